//! file: core/src/vm/exec.rs
//! description: instruction dispatch.
//!
//! `Frame::step` decodes one `Op` and applies it to the frame's operand
//! stack, scope chain and control stacks. It reports how the instruction
//! pointer moves next; the fetch loop in `frame.rs` owns error routing.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::VmError;
use crate::vm::frame::{CatchEntry, DeferEntry, Flow, Frame, RangeIter};
use crate::vm::function::Closure;
use crate::vm::op::{Instruction, Op, Unwind};
use crate::vm::symbol::SymbolId;
use crate::vm::value::{Kind, MapKey, Payload, Value};

impl Frame {
    pub(crate) fn step(&mut self, inst: &Instruction) -> Result<Flow, VmError> {
        match &inst.op {
            Op::Push { value, literal } => {
                let v = value.to_value();
                self.push(match literal {
                    Some(lit) => v.with_literal(lit.as_str()),
                    None => v,
                });
            }
            Op::Pop => {
                self.pop()?;
            }
            Op::Dup => {
                let top = self.peek()?.clone();
                self.push(top);
            }
            Op::MakeClosure(proto) => {
                let closure = Closure::new(Arc::clone(proto), Arc::clone(&self.scope));
                self.push(Value::function(closure));
            }

            Op::Load(id) => {
                let v = self.load(*id)?;
                self.push(v);
            }
            Op::LoadName(name) => {
                let v = self
                    .scope
                    .get_value_by_name(name)
                    .or_else(|| self.vm.imported(name))
                    .ok_or_else(|| VmError::UndefinedSymbol(name.clone()))?;
                self.push(v);
            }
            Op::Store(id) => {
                let v = self.pop()?;
                self.scope.assign(*id, v);
            }
            Op::Declare(id) => {
                let v = self.pop()?;
                self.scope.declare(*id, v);
            }

            Op::Unary(op) => {
                let v = self.pop()?;
                let out = self.vm.operators().unary(*op, &v)?;
                self.push(out);
            }
            Op::Binary(op) => {
                let rhs = self.pop()?;
                let lhs = self.pop()?;
                let out = self.vm.operators().binary(*op, &lhs, &rhs)?;
                self.push(out);
            }

            Op::Jump(target) => return Ok(Flow::Jump(*target)),
            Op::JumpIfFalse(target) => {
                if !self.pop()?.truthy() {
                    return Ok(Flow::Jump(*target));
                }
            }
            Op::JumpIfTrue(target) => {
                if self.pop()?.truthy() {
                    return Ok(Flow::Jump(*target));
                }
            }
            Op::JumpIfFalseKeep(target) => {
                if !self.peek()?.truthy() {
                    return Ok(Flow::Jump(*target));
                }
                self.pop()?;
            }
            Op::JumpIfTrueKeep(target) => {
                if self.peek()?.truthy() {
                    return Ok(Flow::Jump(*target));
                }
                self.pop()?;
            }
            Op::Break(unwind) | Op::Continue(unwind) => {
                self.unwind_to(unwind)?;
                return Ok(Flow::Jump(unwind.target));
            }

            Op::EnterScope(table) => {
                self.scope = self.scope.child(*table);
            }
            Op::ExitScope => self.exit_scope()?,

            Op::Call { argc, spread } => {
                let args = self.pop_args(*argc, *spread)?;
                let callee = self.pop()?;
                let out = self.vm.call_value(&self.ctx, &callee, args, self.depth)?;
                self.push(out);
            }
            Op::Go { argc, spread } => {
                let args = self.pop_args(*argc, *spread)?;
                let callee = self.pop()?;
                self.vm.spawn(&self.ctx, callee, args)?;
            }
            Op::Return => {
                let v = self.stack.pop().unwrap_or_default();
                return Ok(Flow::Return(v));
            }
            Op::Defer { argc } => {
                let args = self.pop_n(*argc)?;
                let callee = self.pop()?;
                if !callee.is_callable() {
                    return Err(VmError::type_error(format!("cannot defer {}", callee.type_tag())));
                }
                self.defers.push(DeferEntry { callee, args });
            }

            Op::TryBegin { catch, finally } => {
                if *finally {
                    let callee = self.pop()?;
                    if !callee.is_callable() {
                        return Err(VmError::type_error(format!("finally block is {}", callee.type_tag())));
                    }
                    self.finallies.push(callee);
                }
                self.catches.push(CatchEntry {
                    target: *catch,
                    stack_height: self.stack.len(),
                    scope: Arc::clone(&self.scope),
                    iterators: self.iterators.len(),
                    finallies: self.finallies.len(),
                });
            }
            Op::TryEnd => {
                self.catches.pop();
            }
            Op::Finally => {
                let callee = self.finallies.pop().ok_or_else(|| VmError::runtime("finally outside of try"))?;
                self.run_finally(&callee)?;
            }
            Op::Panic => {
                let v = self.pop()?;
                return Err(VmError::Panic(v));
            }
            Op::Recover => {
                let v = self.take_recoverable().map(|e| e.to_value()).unwrap_or_default();
                self.push(v);
            }
            Op::Assert { message } => {
                let msg = if *message { Some(self.pop()?) } else { None };
                let cond = self.pop()?;
                if !cond.truthy() {
                    let text = match msg {
                        Some(m) => format!("assert failed: {}", m),
                        None => "assert failed".to_string(),
                    };
                    return Err(VmError::Panic(Value::from(text)));
                }
            }

            Op::NewList(n) => {
                let items = self.pop_n(*n)?;
                self.push(Value::list(items));
            }
            Op::NewMap(n) => {
                let flat = self.pop_n(n * 2)?;
                let mut entries = HashMap::with_capacity(*n);
                for pair in flat.chunks(2) {
                    entries.insert(pair[0].to_key()?, pair[1].clone());
                }
                self.push(Value::map(entries));
            }
            Op::Index => {
                let key = self.pop()?;
                let container = self.pop()?;
                let v = index(&container, &key)?;
                self.push(v);
            }
            Op::StoreIndex => {
                let value = self.pop()?;
                let key = self.pop()?;
                let container = self.pop()?;
                store_index(&container, &key, value)?;
            }

            Op::IterStart => {
                let subject = self.pop()?;
                let iter = range_over(&subject)?;
                self.iterators.push(iter);
            }
            Op::IterNext { vars, exit } => {
                let item = self.next_item()?;
                let Some((key, value)) = item else {
                    return Ok(Flow::Jump(*exit));
                };
                match vars {
                    0 => {}
                    1 => self.push(key),
                    _ => {
                        self.push(key);
                        self.push(value);
                    }
                }
            }
            Op::IterEnd => {
                self.iterators.pop();
            }

            Op::Send => {
                let v = self.pop()?;
                let ch = self.pop()?;
                let ch = ch
                    .as_channel()
                    .ok_or_else(|| VmError::type_error(format!("cannot send to {}", ch.type_tag())))?;
                ch.send(&self.ctx, v)?;
            }
            Op::Recv => {
                let ch = self.pop()?;
                let ch = ch
                    .as_channel()
                    .ok_or_else(|| VmError::type_error(format!("cannot receive from {}", ch.type_tag())))?;
                let (v, _) = ch.recv(&self.ctx)?;
                self.push(v);
            }

            Op::Cast(kind) => {
                let v = self.pop()?;
                self.push(cast(&v, *kind)?);
            }
        }
        Ok(Flow::Next)
    }

    /// Scope chain first, then the imported namespace by name.
    fn load(&self, id: SymbolId) -> Result<Value, VmError> {
        if let Some(v) = self.scope.get(id) {
            return Ok(v);
        }
        let name = self.scope.symbols().name_of(id);
        match name.and_then(|n| self.vm.imported(n)) {
            Some(v) => Ok(v),
            None => Err(VmError::UndefinedSymbol(name.map(str::to_string).unwrap_or_else(|| format!("#{}", id)))),
        }
    }

    fn pop_args(&mut self, argc: usize, spread: bool) -> Result<Vec<Value>, VmError> {
        let mut args = self.pop_n(argc)?;
        if spread {
            let last = args.pop().ok_or_else(|| VmError::runtime("spread call without arguments"))?;
            let list = last
                .as_list()
                .ok_or_else(|| VmError::type_error(format!("cannot spread {}", last.type_tag())))?;
            args.extend(list.lock().iter().cloned());
        }
        Ok(args)
    }

    /// Leaves the try statements a `break`/`continue` jumps out of. Their
    /// catches are dropped before their finally blocks run, so an error
    /// raised by a finally reaches an enclosing handler.
    fn unwind_to(&mut self, unwind: &Unwind) -> Result<(), VmError> {
        let catches = self.catches.len().saturating_sub(unwind.catches);
        self.catches.truncate(catches);
        let iterators = self.iterators.len().saturating_sub(unwind.iterators);
        self.iterators.truncate(iterators);
        for _ in 0..unwind.finallies {
            if let Some(callee) = self.finallies.pop() {
                self.run_finally(&callee)?;
            }
        }
        for _ in 0..unwind.scopes {
            self.exit_scope()?;
        }
        Ok(())
    }

    fn next_item(&mut self) -> Result<Option<(Value, Value)>, VmError> {
        let ctx = self.ctx.clone();
        let iter = self.iterators.last_mut().ok_or_else(|| VmError::runtime("range without iterator"))?;
        match iter {
            RangeIter::Count { n, i } => {
                if *i >= *n {
                    return Ok(None);
                }
                let cur = Value::from(*i);
                *i += 1;
                Ok(Some((cur.clone(), cur)))
            }
            RangeIter::Items { keys, values, pos } => {
                if *pos >= keys.len() {
                    return Ok(None);
                }
                let item = (keys[*pos].clone(), values[*pos].clone());
                *pos += 1;
                Ok(Some(item))
            }
            RangeIter::Channel(ch) => {
                let (v, ok) = ch.recv(&ctx)?;
                Ok(ok.then(|| (v.clone(), v)))
            }
        }
    }
}

fn range_over(subject: &Value) -> Result<RangeIter, VmError> {
    let items = |values: Vec<Value>| RangeIter::Items {
        keys: (0..values.len()).map(Value::from).collect(),
        values,
        pos: 0,
    };
    match subject.payload() {
        Payload::Int(n) => Ok(RangeIter::Count { n: *n, i: 0 }),
        Payload::List(l) => Ok(items(l.lock().clone())),
        Payload::Str(s) => Ok(items(s.chars().map(Value::from).collect())),
        Payload::Bytes(b) => Ok(items(b.iter().map(|x| Value::from(*x as i64)).collect())),
        Payload::Map(m) => {
            let guard = m.lock();
            let mut keys: Vec<&MapKey> = guard.keys().collect();
            keys.sort();
            let values = keys.iter().map(|k| guard[*k].clone()).collect();
            Ok(RangeIter::Items { keys: keys.into_iter().map(MapKey::to_value).collect(), values, pos: 0 })
        }
        Payload::Channel(ch) => Ok(RangeIter::Channel(Arc::clone(ch))),
        _ => Err(VmError::type_error(format!("cannot range over {}", subject.type_tag()))),
    }
}

fn position(len: usize, key: &Value) -> Result<usize, VmError> {
    let i = key
        .as_int()
        .ok_or_else(|| VmError::type_error(format!("index must be int, got {}", key.type_tag())))?;
    let resolved = if i < 0 { len as i64 + i } else { i };
    if resolved < 0 || resolved as usize >= len {
        return Err(VmError::runtime(format!("index out of range [{}] with length {}", i, len)));
    }
    Ok(resolved as usize)
}

fn index(container: &Value, key: &Value) -> Result<Value, VmError> {
    match container.payload() {
        Payload::List(l) => {
            let list = l.lock();
            Ok(list[position(list.len(), key)?].clone())
        }
        Payload::Map(m) => Ok(m.lock().get(&key.to_key()?).cloned().unwrap_or_default()),
        Payload::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            Ok(Value::from(chars[position(chars.len(), key)?]))
        }
        Payload::Bytes(b) => Ok(Value::from(b[position(b.len(), key)?] as i64)),
        _ => Err(VmError::type_error(format!("cannot index {}", container.type_tag()))),
    }
}

fn store_index(container: &Value, key: &Value, value: Value) -> Result<(), VmError> {
    match container.payload() {
        Payload::List(l) => {
            let mut list = l.lock();
            let at = position(list.len(), key)?;
            list[at] = value;
            Ok(())
        }
        Payload::Map(m) => {
            m.lock().insert(key.to_key()?, value);
            Ok(())
        }
        _ => Err(VmError::type_error(format!("cannot assign into {}", container.type_tag()))),
    }
}

pub(crate) fn cast(v: &Value, kind: Kind) -> Result<Value, VmError> {
    let fail = || VmError::type_error(format!("cannot convert {} to {}", v.type_tag(), kind));
    match kind {
        Kind::Bool => Ok(Value::from(v.truthy())),
        Kind::Int => match v.payload() {
            Payload::Float(x) => Ok(Value::from(*x as i64)),
            Payload::Str(s) => s.trim().parse::<i64>().map(Value::from).map_err(|_| fail()),
            _ => v.as_int().map(Value::from).ok_or_else(fail),
        },
        Kind::Float => match v.payload() {
            Payload::Str(s) => s.trim().parse::<f64>().map(Value::from).map_err(|_| fail()),
            _ => v.as_float().map(Value::from).ok_or_else(fail),
        },
        Kind::Char => v
            .as_int()
            .and_then(|i| u32::try_from(i).ok())
            .and_then(char::from_u32)
            .map(Value::from)
            .ok_or_else(fail),
        Kind::Str => Ok(Value::from(v.to_string())),
        Kind::Bytes => v.as_bytes().map(|b| Value::bytes(b.to_vec())).ok_or_else(fail),
        Kind::List => match v.payload() {
            Payload::List(_) => Ok(v.clone()),
            Payload::Bytes(b) => Ok(Value::list(b.iter().map(|x| Value::from(*x as i64)).collect())),
            _ => Err(fail()),
        },
        _ if v.kind() == kind => Ok(v.clone()),
        _ => Err(fail()),
    }
}
