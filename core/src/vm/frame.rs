//! file: core/src/vm/frame.rs
//! description: execution frames.
//!
//! A `Frame` is one instruction pointer over one instruction sequence: a
//! call, a goroutine body, a deferred call or the top-level program. It
//! owns the operand stack and the control stacks for try/catch, finally,
//! defer and range loops. Instruction dispatch lives in `exec.rs`.

use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::error::VmError;
use crate::vm::channel::Channel;
use crate::vm::context::Context;
use crate::vm::function::Closure;
use crate::vm::op::Instruction;
use crate::vm::scope::Scope;
use crate::vm::value::{Payload, Value};
use crate::vm::VirtualMachine;

/// Error slot shared between a failing frame and the deferred calls it runs,
/// so `recover()` inside a defer can consume it.
pub(crate) type PanicSlot = Arc<Mutex<Option<VmError>>>;

pub(crate) struct DeferEntry {
    pub callee: Value,
    pub args: Vec<Value>,
}

pub(crate) struct CatchEntry {
    pub target: usize,
    pub stack_height: usize,
    pub scope: Arc<Scope>,
    pub iterators: usize,
    /// Finally stack height once this try's own finally is pushed. Deeper
    /// entries belong to nested try statements the error escapes from.
    pub finallies: usize,
}

pub(crate) enum RangeIter {
    Count { n: i64, i: i64 },
    Items { keys: Vec<Value>, values: Vec<Value>, pos: usize },
    Channel(Arc<Channel>),
}

pub(crate) enum Flow {
    Next,
    Jump(usize),
    Return(Value),
}

pub(crate) struct Completion {
    pub value: Value,
    pub returned: bool,
}

/// Debugger-facing snapshot of a frame at an instruction boundary.
#[derive(Clone)]
pub struct FrameView {
    pub frame_id: u64,
    pub thread: std::thread::ThreadId,
    pub depth: usize,
    pub function: String,
    pub ip: usize,
    pub line: usize,
    pub stack_len: usize,
    scope: Arc<Scope>,
}

impl FrameView {
    pub fn current_scope(&self) -> &Arc<Scope> {
        &self.scope
    }

    pub fn get_value_by_name(&self, name: &str) -> Option<Value> {
        self.scope.get_value_by_name(name)
    }
}

impl std::fmt::Debug for FrameView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameView")
            .field("frame_id", &self.frame_id)
            .field("depth", &self.depth)
            .field("function", &self.function)
            .field("ip", &self.ip)
            .field("line", &self.line)
            .finish()
    }
}

pub struct Frame {
    pub(crate) vm: VirtualMachine,
    pub(crate) ctx: Context,
    pub(crate) id: u64,
    pub(crate) depth: usize,
    pub(crate) name: String,
    pub(crate) code: Arc<[Instruction]>,
    pub(crate) ip: usize,
    pub(crate) stack: Vec<Value>,
    pub(crate) scope: Arc<Scope>,
    pub(crate) defers: Vec<DeferEntry>,
    pub(crate) catches: Vec<CatchEntry>,
    /// Finally blocks of the try statements currently open in this frame.
    pub(crate) finallies: Vec<Value>,
    pub(crate) iterators: Vec<RangeIter>,
    /// Error handled by the running catch body, with the scope depth the
    /// catch started at.
    pub(crate) caught: Option<(VmError, usize)>,
    pub(crate) panic_slot: Option<PanicSlot>,
    pub(crate) last_line: usize,
    pub(crate) debug_enabled: bool,
}

impl Frame {
    fn new(vm: VirtualMachine, ctx: Context, scope: Arc<Scope>, name: String, depth: usize) -> Self {
        let id = vm.next_frame_id();
        Frame {
            vm,
            ctx,
            id,
            depth,
            name,
            code: Arc::from(Vec::new()),
            ip: 0,
            stack: Vec::new(),
            scope,
            defers: Vec::new(),
            catches: Vec::new(),
            finallies: Vec::new(),
            iterators: Vec::new(),
            caught: None,
            panic_slot: None,
            last_line: 0,
            debug_enabled: true,
        }
    }

    pub(crate) fn root(vm: VirtualMachine, ctx: Context, scope: Arc<Scope>) -> Self {
        Frame::new(vm, ctx, scope, "<main>".to_string(), 0)
    }

    /// Binds `args` into a fresh child of the closure's captured scope.
    /// Arity is checked before any callee instruction runs.
    pub(crate) fn for_call(
        vm: VirtualMachine,
        ctx: Context,
        closure: &Arc<Closure>,
        mut args: Vec<Value>,
        depth: usize,
    ) -> Result<Self, VmError> {
        let proto = &closure.proto;
        closure.arity().check(&proto.name, args.len())?;

        let scope = closure.captured.child(proto.table);
        let fixed = if proto.variadic { proto.params.len().saturating_sub(1) } else { proto.params.len() };
        let rest = if proto.variadic { args.split_off(fixed.min(args.len())) } else { Vec::new() };
        for (id, value) in proto.params.iter().zip(args) {
            scope.declare(*id, value);
        }
        if proto.variadic {
            if let Some(id) = proto.params.last() {
                scope.declare(*id, Value::list(rest));
            }
        }

        let mut frame = Frame::new(vm, ctx, scope, proto.name.clone(), depth);
        frame.code = Arc::clone(&proto.code);
        Ok(frame)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn function_name(&self) -> &str {
        &self.name
    }

    pub fn current_scope(&self) -> &Arc<Scope> {
        &self.scope
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn vm(&self) -> &VirtualMachine {
        &self.vm
    }

    pub(crate) fn disable_debugger(&mut self) {
        self.debug_enabled = false;
    }

    pub fn view(&self) -> FrameView {
        FrameView {
            frame_id: self.id,
            thread: std::thread::current().id(),
            depth: self.depth,
            function: self.name.clone(),
            ip: self.ip,
            line: self.code.get(self.ip).map(Instruction::line).unwrap_or(self.last_line),
            stack_len: self.stack.len(),
            scope: Arc::clone(&self.scope),
        }
    }

    /// Executes `code` from its first instruction, then unwinds defers.
    pub fn exec(&mut self, code: Arc<[Instruction]>) -> Result<Value, VmError> {
        self.code = code;
        self.ip = 0;
        self.last_line = 0;
        self.run_body()
    }

    pub(crate) fn run_body(&mut self) -> Result<Value, VmError> {
        self.run_to_completion().map(|c| c.value)
    }

    pub(crate) fn run_to_completion(&mut self) -> Result<Completion, VmError> {
        let outcome = self.run_loop();
        let outcome = self.drain_finallies(outcome);
        self.unwind(outcome)
    }

    fn run_loop(&mut self) -> Result<Completion, VmError> {
        loop {
            if self.ip >= self.code.len() {
                let value = self.stack.last().cloned().unwrap_or_default();
                return Ok(Completion { value, returned: false });
            }
            if let Some(reason) = self.ctx.err() {
                return Err(VmError::Cancelled(reason));
            }

            let code = Arc::clone(&self.code);
            let inst = &code[self.ip];
            if self.debug_enabled {
                self.debug_hook(inst)?;
            }
            if self.vm.config().trace {
                println!("{:>4} {:04}  {}{}", inst.line(), self.ip, "  ".repeat(self.depth), inst);
            }

            match self.step(inst) {
                Ok(Flow::Next) => self.ip += 1,
                Ok(Flow::Jump(target)) => self.ip = target,
                Ok(Flow::Return(value)) => return Ok(Completion { value, returned: true }),
                Err(e) => {
                    if e.is_catchable() {
                        if let Some(entry) = self.catches.pop() {
                            self.enter_catch(entry, e)?;
                            continue;
                        }
                    }
                    debug!("frame {} ({}) failed at ip {}: {}", self.id, self.name, self.ip, e);
                    return Err(e);
                }
            }
        }
    }

    /// Nested try statements the error escapes run their finally blocks
    /// first; an error raised by one of them replaces the caught one.
    fn enter_catch(&mut self, entry: CatchEntry, mut error: VmError) -> Result<(), VmError> {
        while self.finallies.len() > entry.finallies {
            let Some(callee) = self.finallies.pop() else {
                break;
            };
            if let Err(e) = self.run_finally(&callee) {
                if !e.is_catchable() {
                    return Err(e);
                }
                error = e;
            }
        }
        self.stack.truncate(entry.stack_height);
        self.iterators.truncate(entry.iterators);
        self.scope = entry.scope;
        self.stack.push(error.to_value());
        self.caught = Some((error, self.scope.depth()));
        self.ip = entry.target;
        Ok(())
    }

    /// Runs a finally block when its try statement completes or is left by
    /// `break`/`continue`. Its own `return` only ends the block.
    pub(crate) fn run_finally(&self, callee: &Value) -> Result<(), VmError> {
        let slot: PanicSlot = Arc::new(Mutex::new(None));
        self.run_deferred(callee, Vec::new(), slot).map(|_| ())
    }

    /// Try statements still open when the frame exits run their finally
    /// blocks innermost first. An explicit `return` inside one replaces the
    /// pending return value, or the error it recovered.
    fn drain_finallies(&mut self, outcome: Result<Completion, VmError>) -> Result<Completion, VmError> {
        if self.finallies.is_empty() {
            return outcome;
        }
        let (mut completion, mut pending) = match outcome {
            Ok(c) => (c, None),
            Err(e) => (Completion { value: Value::undefined(), returned: false }, Some(e)),
        };

        while let Some(callee) = self.finallies.pop() {
            let had_error = pending.is_some();
            let slot: PanicSlot = Arc::new(Mutex::new(pending.take()));
            let run = self.run_deferred(&callee, Vec::new(), Arc::clone(&slot));
            pending = slot.lock().take();
            match run {
                Ok(c) if c.returned && (completion.returned || (had_error && pending.is_none())) => {
                    completion = Completion { value: c.value, returned: true };
                }
                Ok(_) => {}
                Err(e) => pending = Some(e),
            }
        }

        match pending {
            Some(e) => Err(e),
            None => Ok(completion),
        }
    }

    /// Runs the defer stack once, LIFO, whatever the exit path was.
    fn unwind(&mut self, outcome: Result<Completion, VmError>) -> Result<Completion, VmError> {
        let (completion, mut pending) = match outcome {
            Ok(c) => (c, None),
            Err(e) => (Completion { value: Value::undefined(), returned: false }, Some(e)),
        };

        while let Some(entry) = self.defers.pop() {
            let had_error = pending.is_some();
            let slot: PanicSlot = Arc::new(Mutex::new(pending.take()));
            let run = self.run_deferred(&entry.callee, entry.args, Arc::clone(&slot));
            pending = slot.lock().take();
            if had_error && pending.is_none() {
                debug!("frame {} ({}): deferred call recovered the error", self.id, self.name);
            }
            if let Err(e) = run {
                pending = Some(e);
            }
        }

        match pending {
            Some(e) => Err(e),
            None => Ok(completion),
        }
    }

    fn run_deferred(&self, callee: &Value, args: Vec<Value>, slot: PanicSlot) -> Result<Completion, VmError> {
        match callee.payload() {
            Payload::Function(closure) => {
                let mut frame = Frame::for_call(self.vm.clone(), self.ctx.clone(), closure, args, self.depth + 1)?;
                frame.panic_slot = Some(slot);
                frame.debug_enabled = self.debug_enabled;
                frame.run_to_completion()
            }
            _ => {
                let value = self.vm.call_value(&self.ctx, callee, args, self.depth)?;
                Ok(Completion { value, returned: false })
            }
        }
    }

    pub(crate) fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    pub(crate) fn pop(&mut self) -> Result<Value, VmError> {
        self.stack.pop().ok_or_else(|| VmError::runtime(format!("operand stack underflow in {}", self.name)))
    }

    pub(crate) fn pop_n(&mut self, n: usize) -> Result<Vec<Value>, VmError> {
        if self.stack.len() < n {
            return Err(VmError::runtime(format!("operand stack underflow in {}", self.name)));
        }
        let at = self.stack.len() - n;
        Ok(self.stack.split_off(at))
    }

    pub(crate) fn peek(&self) -> Result<&Value, VmError> {
        self.stack.last().ok_or_else(|| VmError::runtime(format!("operand stack underflow in {}", self.name)))
    }

    pub(crate) fn exit_scope(&mut self) -> Result<(), VmError> {
        let parent = self
            .scope
            .parent()
            .cloned()
            .ok_or_else(|| VmError::runtime("scope underflow"))?;
        self.scope = parent;
        if let Some((_, depth)) = &self.caught {
            if self.scope.depth() <= *depth {
                self.caught = None;
            }
        }
        Ok(())
    }

    /// `recover()`: the error of the running catch body, else the error the
    /// enclosing frame is unwinding with.
    pub(crate) fn take_recoverable(&mut self) -> Option<VmError> {
        if let Some((e, _)) = self.caught.take() {
            return Some(e);
        }
        self.panic_slot.as_ref().and_then(|slot| slot.lock().take())
    }

    fn debug_hook(&mut self, inst: &Instruction) -> Result<(), VmError> {
        let line = inst.line();
        let new_line = line != self.last_line;
        self.last_line = line;
        let Some(dbg) = self.vm.debugger() else {
            return Ok(());
        };
        crate::vm::debugger::Debugger::on_instruction(&dbg, self, new_line)
    }
}
