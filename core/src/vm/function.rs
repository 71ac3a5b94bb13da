//! file: core/src/vm/function.rs
//! description: script closures and host functions callable from bytecode.

use std::fmt;
use std::sync::Arc;

use crate::error::VmError;
use crate::vm::context::Context;
use crate::vm::op::FunctionProto;
use crate::vm::scope::Scope;
use crate::vm::value::Value;
use crate::vm::VirtualMachine;

/// A function literal bound to the scope it was created in.
pub struct Closure {
    pub proto: Arc<FunctionProto>,
    pub captured: Arc<Scope>,
}

impl Closure {
    pub fn new(proto: Arc<FunctionProto>, captured: Arc<Scope>) -> Self {
        Self { proto, captured }
    }

    pub fn name(&self) -> &str {
        &self.proto.name
    }

    pub fn arity(&self) -> Arity {
        let n = self.proto.params.len();
        if self.proto.variadic { Arity::AtLeast(n.saturating_sub(1)) } else { Arity::Exact(n) }
    }
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Closure").field("name", &self.proto.name).field("params", &self.proto.params).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
    Any,
}

impl Arity {
    pub fn check(&self, function: &str, got: usize) -> Result<(), VmError> {
        let (ok, expected, variadic) = match *self {
            Arity::Exact(n) => (got == n, n, false),
            Arity::AtLeast(n) => (got >= n, n, true),
            Arity::Any => (true, 0, true),
        };
        if ok {
            Ok(())
        } else {
            Err(VmError::Arity { function: function.to_string(), expected, got, variadic })
        }
    }
}

/// What a host function sees of the running VM.
pub struct CallContext<'a> {
    pub(crate) vm: &'a VirtualMachine,
    pub(crate) ctx: &'a Context,
    pub(crate) depth: usize,
}

impl<'a> CallContext<'a> {
    pub fn vm(&self) -> &VirtualMachine {
        self.vm
    }

    pub fn context(&self) -> &Context {
        self.ctx
    }

    /// Calls back into a script or host callable.
    pub fn call(&self, callee: &Value, args: Vec<Value>) -> Result<Value, VmError> {
        self.vm.call_value(self.ctx, callee, args, self.depth)
    }
}

pub type HostFn = dyn Fn(&CallContext<'_>, Vec<Value>) -> Result<Value, VmError> + Send + Sync;

/// A native function importable into the VM namespace.
pub struct HostFunction {
    name: String,
    arity: Arity,
    f: Box<HostFn>,
}

impl HostFunction {
    pub fn new<F>(name: impl Into<String>, arity: Arity, f: F) -> Self
    where
        F: Fn(&CallContext<'_>, Vec<Value>) -> Result<Value, VmError> + Send + Sync + 'static,
    {
        Self { name: name.into(), arity, f: Box::new(f) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arity(&self) -> Arity {
        self.arity
    }

    pub fn invoke(&self, cx: &CallContext<'_>, args: Vec<Value>) -> Result<Value, VmError> {
        self.arity.check(&self.name, args.len())?;
        (self.f)(cx, args)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction").field("name", &self.name).field("arity", &self.arity).finish()
    }
}
