//! file: core/src/vm/builder.rs
//! description: programmatic construction of `Program`s.
//!
//! The VM never parses source. Hosts that embed a compiler hand over a
//! `Program`; everything else (tests, the debugger's expressions, small
//! generated snippets) assembles one here. The builder tracks the current
//! symbol table and source line, and resolves names the way the runtime
//! scope chain will.

use std::sync::Arc;

use crate::location::Span;
use crate::vm::op::{BinaryOp, Constant, FunctionProto, Instruction, Op, Program, UnaryOp, Unwind};
use crate::vm::symbol::{SymbolId, SymbolTable, TableId, ROOT_TABLE};

pub struct CodeBuilder {
    symbols: SymbolTable,
    table: TableId,
    line: usize,
    code: Vec<Instruction>,
}

impl Default for CodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeBuilder {
    pub fn new() -> Self {
        CodeBuilder { symbols: SymbolTable::new(), table: ROOT_TABLE, line: 1, code: Vec::new() }
    }

    /// Continues building on top of an existing table, e.g. for expressions
    /// evaluated against a running program's scopes.
    pub fn with_symbols(symbols: SymbolTable, table: TableId) -> Self {
        CodeBuilder { symbols, table, line: 1, code: Vec::new() }
    }

    /// Source line attached to subsequently emitted instructions.
    pub fn line(&mut self, line: usize) -> &mut Self {
        self.line = line;
        self
    }

    pub fn current_line(&self) -> usize {
        self.line
    }

    pub fn table(&self) -> TableId {
        self.table
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn emit(&mut self, op: Op) -> usize {
        self.code.push(Instruction::new(op, Span::line(self.line)));
        self.code.len() - 1
    }

    pub fn current_len(&self) -> usize {
        self.code.len()
    }

    pub fn patch(&mut self, idx: usize, op: Op) {
        if let Some(inst) = self.code.get_mut(idx) {
            inst.op = op;
        }
    }

    /// Points the jump-like instruction at `idx` to the next emitted index.
    pub fn patch_here(&mut self, idx: usize) {
        let here = self.code.len();
        self.patch_target(idx, here);
    }

    pub fn patch_target(&mut self, idx: usize, target: usize) {
        let Some(inst) = self.code.get_mut(idx) else {
            return;
        };
        match &mut inst.op {
            Op::Jump(t)
            | Op::JumpIfFalse(t)
            | Op::JumpIfTrue(t)
            | Op::JumpIfFalseKeep(t)
            | Op::JumpIfTrueKeep(t)
            | Op::TryBegin { catch: t, .. }
            | Op::IterNext { exit: t, .. } => *t = target,
            Op::Break(u) | Op::Continue(u) => u.target = target,
            _ => {}
        }
    }

    // ------- Symbols -------

    pub fn declare(&mut self, name: &str) -> SymbolId {
        self.symbols.declare(self.table, name)
    }

    pub fn resolve(&self, name: &str) -> Option<SymbolId> {
        self.symbols.lookup(self.table, name)
    }

    // ------- Shorthands -------

    pub fn push(&mut self, value: impl Into<Constant>) -> usize {
        self.emit(Op::Push { value: value.into(), literal: None })
    }

    pub fn push_literal(&mut self, value: impl Into<Constant>, literal: &str) -> usize {
        self.emit(Op::Push { value: value.into(), literal: Some(literal.to_string()) })
    }

    pub fn push_undefined(&mut self) -> usize {
        self.emit(Op::Push { value: Constant::Undefined, literal: None })
    }

    /// Loads a visible symbol by id, or an imported name.
    pub fn load(&mut self, name: &str) -> usize {
        match self.resolve(name) {
            Some(id) => self.emit(Op::Load(id)),
            None => self.emit(Op::LoadName(name.to_string())),
        }
    }

    /// `name = <top>`: assigns the nearest visible binding, declaring the
    /// name in the current table when nothing is visible yet.
    pub fn store(&mut self, name: &str) -> usize {
        let id = match self.resolve(name) {
            Some(id) => id,
            None => self.declare(name),
        };
        self.emit(Op::Store(id))
    }

    /// `var name = <top>`: always a fresh binding in the current scope.
    pub fn define(&mut self, name: &str) -> usize {
        let id = self.declare(name);
        self.emit(Op::Declare(id))
    }

    pub fn binary(&mut self, op: BinaryOp) -> usize {
        self.emit(Op::Binary(op))
    }

    pub fn unary(&mut self, op: UnaryOp) -> usize {
        self.emit(Op::Unary(op))
    }

    pub fn call(&mut self, argc: usize) -> usize {
        self.emit(Op::Call { argc, spread: false })
    }

    /// Emits a jump whose target is fixed later with `patch_here`.
    pub fn jump_forward(&mut self, make: fn(usize) -> Op) -> usize {
        self.emit(make(usize::MAX))
    }

    pub fn break_to(&mut self, unwind: Unwind) -> usize {
        self.emit(Op::Break(unwind))
    }

    pub fn continue_to(&mut self, unwind: Unwind) -> usize {
        self.emit(Op::Continue(unwind))
    }

    // ------- Structure -------

    /// Opens a block with its own symbol table.
    pub fn enter_scope(&mut self) -> TableId {
        let table = self.symbols.new_child(self.table);
        self.table = table;
        self.emit(Op::EnterScope(table));
        table
    }

    pub fn exit_scope(&mut self) {
        self.emit(Op::ExitScope);
        self.table = self.symbols.parent_of(self.table).unwrap_or(ROOT_TABLE);
    }

    /// Builds a function literal in a child table and emits `MakeClosure`.
    /// The last parameter collects extra arguments when `variadic` is set.
    pub fn function<F>(&mut self, name: &str, params: &[&str], variadic: bool, body: F) -> usize
    where
        F: FnOnce(&mut CodeBuilder),
    {
        let proto = self.build_proto(name, params, variadic, body);
        self.emit(Op::MakeClosure(Arc::new(proto)))
    }

    pub fn build_proto<F>(&mut self, name: &str, params: &[&str], variadic: bool, body: F) -> FunctionProto
    where
        F: FnOnce(&mut CodeBuilder),
    {
        let outer_table = self.table;
        let outer_line = self.line;
        let outer_code = std::mem::take(&mut self.code);

        let table = self.symbols.new_child(outer_table);
        self.table = table;
        let params: Vec<SymbolId> = params.iter().map(|p| self.declare(p)).collect();
        body(self);

        let code = std::mem::replace(&mut self.code, outer_code);
        self.table = outer_table;
        self.line = outer_line;
        FunctionProto { name: name.to_string(), params, variadic, table, code: Arc::from(code) }
    }

    pub fn finish(self) -> Program {
        Program::new(self.symbols, self.code)
    }

    /// Instructions only, for debugger expressions built against a table
    /// the running program already owns.
    pub fn finish_code(self) -> Vec<Instruction> {
        self.code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_blocks_shadow_by_id() {
        let mut b = CodeBuilder::new();
        b.push(1i64);
        b.define("x");
        let outer = b.resolve("x");
        b.enter_scope();
        b.push(2i64);
        b.define("x");
        let inner = b.resolve("x");
        b.exit_scope();
        assert_ne!(outer, inner);
        assert_eq!(b.resolve("x"), outer);
    }

    #[test]
    fn patch_here_fixes_forward_jumps() {
        let mut b = CodeBuilder::new();
        b.push(true);
        let j = b.jump_forward(Op::JumpIfFalse);
        b.push(1i64);
        b.patch_here(j);
        let program = b.finish();
        assert_eq!(program.code[j].op, Op::JumpIfFalse(3));
    }

    #[test]
    fn functions_get_their_own_table() {
        let mut b = CodeBuilder::new();
        b.function("add", &["a", "b"], false, |f| {
            f.load("a");
            f.load("b");
            f.binary(BinaryOp::Add);
            f.emit(Op::Return);
        });
        let program = b.finish();
        let funcs = program.functions();
        assert_eq!(funcs.len(), 1);
        assert_eq!(funcs[0].params.len(), 2);
        assert_ne!(funcs[0].table, ROOT_TABLE);
        assert_eq!(funcs[0].code.len(), 4);
    }
}
