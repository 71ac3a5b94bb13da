//! file: core/src/vm/host.rs
//! description: engine-level builtins.
//!
//! Only primitives that need VM internals live here: the cancellation
//! context, channels and the goroutine wait group. Everything else is
//! supplied by the embedding host through `VirtualMachine::import`.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use crate::error::VmError;
use crate::vm::channel::Channel;
use crate::vm::exec::cast;
use crate::vm::function::{Arity, CallContext, HostFunction};
use crate::vm::value::{Kind, Value};
use crate::vm::VirtualMachine;

/// Imports every builtin into `vm`.
pub fn install(vm: &VirtualMachine) {
    vm.import_libs(builtins());
}

pub fn builtins() -> HashMap<String, Value> {
    let fns = vec![
        HostFunction::new("sleep", Arity::Exact(1), sleep),
        HostFunction::new("len", Arity::Exact(1), len),
        HostFunction::new("chan", Arity::Any, make_chan),
        HostFunction::new("close", Arity::Exact(1), close),
        HostFunction::new("wait", Arity::Exact(0), wait),
        HostFunction::new("typeof", Arity::Exact(1), |_, args| Ok(Value::from(args[0].type_tag()))),
        HostFunction::new("string", Arity::Exact(1), |_, args| cast(&args[0], Kind::Str)),
        HostFunction::new("print", Arity::Any, |_, args| emit(&args, false)),
        HostFunction::new("println", Arity::Any, |_, args| emit(&args, true)),
    ];
    fns.into_iter().map(|f| (f.name().to_string(), Value::host(f))).collect()
}

fn sleep(cx: &CallContext<'_>, args: Vec<Value>) -> Result<Value, VmError> {
    let secs = args[0]
        .as_float()
        .ok_or_else(|| VmError::type_error(format!("sleep expects a number, got {}", args[0].type_tag())))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(VmError::runtime(format!("invalid sleep duration {}", secs)));
    }
    cx.context().sleep(Duration::from_secs_f64(secs)).map_err(VmError::Cancelled)?;
    Ok(Value::undefined())
}

fn len(_: &CallContext<'_>, args: Vec<Value>) -> Result<Value, VmError> {
    args[0]
        .len()
        .map(Value::from)
        .ok_or_else(|| VmError::type_error(format!("len of {}", args[0].type_tag())))
}

fn make_chan(_: &CallContext<'_>, args: Vec<Value>) -> Result<Value, VmError> {
    let cap = match args.as_slice() {
        [] => 0,
        [cap] => cap
            .as_int()
            .filter(|n| *n >= 0)
            .ok_or_else(|| VmError::type_error(format!("invalid channel capacity {}", cap)))?
            as usize,
        _ => {
            return Err(VmError::Arity { function: "chan".into(), expected: 1, got: args.len(), variadic: false });
        }
    };
    Ok(Value::channel(Arc::new(Channel::new(cap))))
}

fn close(_: &CallContext<'_>, args: Vec<Value>) -> Result<Value, VmError> {
    let ch = args[0]
        .as_channel()
        .ok_or_else(|| VmError::type_error(format!("cannot close {}", args[0].type_tag())))?;
    ch.close()?;
    Ok(Value::undefined())
}

fn wait(cx: &CallContext<'_>, _: Vec<Value>) -> Result<Value, VmError> {
    cx.vm().async_wait(cx.context())?;
    Ok(Value::undefined())
}

fn emit(args: &[Value], newline: bool) -> Result<Value, VmError> {
    let line: Vec<String> = args.iter().map(Value::to_string).collect();
    let mut out = std::io::stdout().lock();
    let written = if newline { writeln!(out, "{}", line.join(" ")) } else { write!(out, "{}", line.join(" ")) };
    written.map_err(|e| VmError::runtime(format!("stdout: {}", e)))?;
    Ok(Value::undefined())
}
