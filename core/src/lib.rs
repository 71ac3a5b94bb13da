pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod location;
pub mod script;
pub mod vm;

pub use cache::CodeCache;
pub use config::VmConfig;
pub use engine::{Compiler, Engine};
pub use error::{Level, MarshalError, VmError, YakErrorExt};
pub use location::{Location, Position, Span};
pub use script::Script;
pub use vm::builder::CodeBuilder;
pub use vm::bytecode::{CodesMarshaller, ENGINE_VERSION};
pub use vm::context::{CancelReason, Context};
pub use vm::debugger::{Debugger, Expression, HitCondition, PauseReason, StepMode};
pub use vm::function::{Arity, CallContext, Closure, HostFunction};
pub use vm::op::{BinaryOp, Constant, FunctionProto, Instruction, Op, Program, UnaryOp, Unwind};
pub use vm::operators::OperatorTable;
pub use vm::scope::Scope;
pub use vm::symbol::SymbolTable;
pub use vm::value::{Kind, MapKey, Payload, Value};
pub use vm::VirtualMachine;

/// One-line report in the same shape as `dyn YakErrorExt`'s Display, for
/// concrete error types.
pub fn generate_error_report<E: YakErrorExt + ?Sized>(error: &E) -> String {
    let location = match error.location() {
        Some(loc) => loc.to_string(),
        None => "unknown".to_string(),
    };
    let span = match error.span() {
        Some(span) => span.to_string(),
        None => "span:none".to_string(),
    };
    format!("YAKVM | {} | {} | {} | {} | {}", error.level(), location, error.issuer(), span, error.message())
}
