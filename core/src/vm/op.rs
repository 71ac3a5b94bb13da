//! file: core/src/vm/op.rs
//! description: instruction set executed by frames.
//!
//! Instructions are produced by an external compiler (or `CodeBuilder`) and
//! are serializable so they can be cached as `.yakc` blobs.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::location::Span;
use crate::vm::symbol::{SymbolId, TableId};
use crate::vm::value::{Kind, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    BitAndNot,
    Shl,
    Shr,
    Lt,
    Gt,
    LtEq,
    GtEq,
    Eq,
    NotEq,
    In,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::BitAndNot => "&^",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::Lt => "<",
            BinaryOp::Gt => ">",
            BinaryOp::LtEq => "<=",
            BinaryOp::GtEq => ">=",
            BinaryOp::Eq => "==",
            BinaryOp::NotEq => "!=",
            BinaryOp::In => "in",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Plus,
    Not,
    BitNot,
}

impl UnaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            UnaryOp::Neg => "-",
            UnaryOp::Plus => "+",
            UnaryOp::Not => "!",
            UnaryOp::BitNot => "^",
        }
    }
}

/// Serializable scalar operand of `Op::Push`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Undefined,
    Bool(bool),
    Int(i64),
    Float(f64),
    Char(char),
    Str(String),
    Bytes(Vec<u8>),
}

impl Constant {
    pub fn to_value(&self) -> Value {
        match self {
            Constant::Undefined => Value::undefined(),
            Constant::Bool(b) => Value::from(*b),
            Constant::Int(i) => Value::from(*i),
            Constant::Float(x) => Value::from(*x),
            Constant::Char(c) => Value::from(*c),
            Constant::Str(s) => Value::from(s.as_str()),
            Constant::Bytes(b) => Value::bytes(b.clone()),
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Undefined => write!(f, "undefined"),
            Constant::Bool(b) => write!(f, "{}", b),
            Constant::Int(i) => write!(f, "{}", i),
            Constant::Float(x) => write!(f, "{:?}", x),
            Constant::Char(c) => write!(f, "{:?}", c),
            Constant::Str(s) => write!(f, "{:?}", s),
            Constant::Bytes(b) => write!(f, "b{:?}", String::from_utf8_lossy(b)),
        }
    }
}

macro_rules! constant_from {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(impl From<$t> for Constant {
            fn from(v: $t) -> Self {
                Constant::$variant(v.into())
            }
        })*
    };
}

constant_from!(bool => Bool, i64 => Int, f64 => Float, char => Char, String => Str, &str => Str);

/// Compiled body of a function literal. Closures pair it with the scope
/// that was current when `MakeClosure` ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionProto {
    pub name: String,
    pub params: Vec<SymbolId>,
    pub variadic: bool,
    /// Symbol table of the parameter scope.
    pub table: TableId,
    pub code: Arc<[Instruction]>,
}

/// How much frame state a `break`/`continue` discards before jumping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Unwind {
    pub target: usize,
    pub scopes: usize,
    pub catches: usize,
    pub iterators: usize,
    /// Finally blocks run, innermost first, before the jump.
    pub finallies: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    Push { value: Constant, literal: Option<String> },
    Pop,
    Dup,
    MakeClosure(Arc<FunctionProto>),

    Load(SymbolId),
    LoadName(String),
    Store(SymbolId),
    Declare(SymbolId),

    Unary(UnaryOp),
    Binary(BinaryOp),

    Jump(usize),
    JumpIfFalse(usize),
    JumpIfTrue(usize),
    /// Short-circuit forms: jump leaving the operand on the stack, else pop it.
    JumpIfFalseKeep(usize),
    JumpIfTrueKeep(usize),
    Break(Unwind),
    Continue(Unwind),

    EnterScope(TableId),
    ExitScope,

    Call { argc: usize, spread: bool },
    Go { argc: usize, spread: bool },
    Return,
    Defer { argc: usize },

    /// Opens a try range. With `finally`, the closure on top of the stack
    /// is pushed on the frame's finally stack until the statement exits.
    TryBegin { catch: usize, finally: bool },
    TryEnd,
    /// End of a try/catch statement: pops and runs its finally block.
    Finally,
    Panic,
    Recover,
    Assert { message: bool },

    NewList(usize),
    NewMap(usize),
    Index,
    StoreIndex,

    IterStart,
    IterNext { vars: usize, exit: usize },
    IterEnd,

    Send,
    Recv,

    Cast(Kind),
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Push { value, literal: Some(lit) } => write!(f, "PUSH {} ({})", value, lit),
            Op::Push { value, literal: None } => write!(f, "PUSH {}", value),
            Op::Pop => write!(f, "POP"),
            Op::Dup => write!(f, "DUP"),
            Op::MakeClosure(p) => write!(f, "CLOSURE {} params={}", p.name, p.params.len()),
            Op::Load(id) => write!(f, "LOAD #{}", id),
            Op::LoadName(n) => write!(f, "LOAD_NAME {}", n),
            Op::Store(id) => write!(f, "STORE #{}", id),
            Op::Declare(id) => write!(f, "DECLARE #{}", id),
            Op::Unary(op) => write!(f, "UNARY {}", op.symbol()),
            Op::Binary(op) => write!(f, "BINARY {}", op.symbol()),
            Op::Jump(t) => write!(f, "JMP -> {}", t),
            Op::JumpIfFalse(t) => write!(f, "JMPF -> {}", t),
            Op::JumpIfTrue(t) => write!(f, "JMPT -> {}", t),
            Op::JumpIfFalseKeep(t) => write!(f, "JMPF_KEEP -> {}", t),
            Op::JumpIfTrueKeep(t) => write!(f, "JMPT_KEEP -> {}", t),
            Op::Break(u) => write!(
                f,
                "BREAK -> {} scopes={} catches={} finallies={}",
                u.target, u.scopes, u.catches, u.finallies
            ),
            Op::Continue(u) => write!(
                f,
                "CONTINUE -> {} scopes={} catches={} finallies={}",
                u.target, u.scopes, u.catches, u.finallies
            ),
            Op::EnterScope(t) => write!(f, "SCOPE {}", t),
            Op::ExitScope => write!(f, "SCOPE_END"),
            Op::Call { argc, spread } => {
                write!(f, "CALL {}{}", argc, if *spread { "..." } else { "" })
            }
            Op::Go { argc, spread } => write!(f, "GO {}{}", argc, if *spread { "..." } else { "" }),
            Op::Return => write!(f, "RETURN"),
            Op::Defer { argc } => write!(f, "DEFER {}", argc),
            Op::TryBegin { catch, finally } => write!(f, "TRY catch={} finally={}", catch, finally),
            Op::TryEnd => write!(f, "TRY_END"),
            Op::Finally => write!(f, "FINALLY"),
            Op::Panic => write!(f, "PANIC"),
            Op::Recover => write!(f, "RECOVER"),
            Op::Assert { message } => write!(f, "ASSERT{}", if *message { " msg" } else { "" }),
            Op::NewList(n) => write!(f, "NEW_LIST {}", n),
            Op::NewMap(n) => write!(f, "NEW_MAP {}", n),
            Op::Index => write!(f, "INDEX"),
            Op::StoreIndex => write!(f, "STORE_INDEX"),
            Op::IterStart => write!(f, "ITER"),
            Op::IterNext { vars, exit } => write!(f, "ITER_NEXT {} exit={}", vars, exit),
            Op::IterEnd => write!(f, "ITER_END"),
            Op::Send => write!(f, "SEND"),
            Op::Recv => write!(f, "RECV"),
            Op::Cast(k) => write!(f, "CAST {}", k),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub op: Op,
    pub span: Span,
}

impl Instruction {
    pub fn new(op: Op, span: Span) -> Self {
        Self { op, span }
    }

    pub fn line(&self) -> usize {
        self.span.start.line
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.op)
    }
}

/// Unit handed over the compiler boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub symbols: crate::vm::symbol::SymbolTable,
    pub code: Vec<Instruction>,
}

impl Program {
    pub fn new(symbols: crate::vm::symbol::SymbolTable, code: Vec<Instruction>) -> Self {
        Self { symbols, code }
    }

    /// All function prototypes reachable from the top-level code, depth first.
    pub fn functions(&self) -> Vec<Arc<FunctionProto>> {
        let mut out = Vec::new();
        collect_functions(&self.code, &mut out);
        out
    }
}

fn collect_functions(code: &[Instruction], out: &mut Vec<Arc<FunctionProto>>) {
    for inst in code {
        if let Op::MakeClosure(proto) = &inst.op {
            out.push(Arc::clone(proto));
            collect_functions(&proto.code, out);
        }
    }
}
