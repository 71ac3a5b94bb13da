//! file: core/src/vm/mod.rs
//! description: the virtual machine, its bytecode and runtime support.

pub mod builder;
pub mod bytecode;
pub mod channel;
pub mod context;
pub mod debugger;
mod exec;
pub mod frame;
pub mod function;
pub mod host;
pub mod op;
pub mod operators;
pub mod scope;
pub mod symbol;
pub mod value;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, warn};
use parking_lot::{Condvar, Mutex, RwLock};
use uuid::Uuid;

use crate::config::VmConfig;
use crate::error::VmError;
use context::Context;
use debugger::Debugger;
use frame::Frame;
use function::CallContext;
use op::{Instruction, Program};
use operators::{OperatorTable, DEFAULT_OPERATORS};
use scope::Scope;
use symbol::SymbolTable;
use value::{Payload, Value};

/// Counts live goroutines; `wait` blocks until it drops to zero.
struct WaitGroup {
    count: Mutex<usize>,
    cv: Condvar,
}

struct WaitGuard(Arc<WaitGroup>);

impl Drop for WaitGuard {
    fn drop(&mut self) {
        let mut count = self.0.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.0.cv.notify_all();
        }
    }
}

impl WaitGroup {
    fn add(self: &Arc<Self>) -> WaitGuard {
        *self.count.lock() += 1;
        WaitGuard(Arc::clone(self))
    }

    fn wait(&self, ctx: &Context) -> Result<(), VmError> {
        let mut count = self.count.lock();
        while *count > 0 {
            if let Some(reason) = ctx.err() {
                return Err(VmError::Cancelled(reason));
            }
            self.cv.wait_for(&mut count, Duration::from_millis(10));
        }
        Ok(())
    }
}

struct VmInner {
    id: Uuid,
    config: VmConfig,
    symbols: RwLock<Option<Arc<SymbolTable>>>,
    imports: RwLock<HashMap<String, Value>>,
    operators: RwLock<Arc<OperatorTable>>,
    tasks: Arc<WaitGroup>,
    debugger: RwLock<Option<Arc<Mutex<Debugger>>>>,
    root_scope: Mutex<Option<Arc<Scope>>>,
    frame_ids: AtomicU64,
    thread_ids: AtomicU64,
}

/// Shared handle to one virtual machine. Clones refer to the same VM, which
/// is how goroutine threads reach imports, operators and the wait group.
#[derive(Clone)]
pub struct VirtualMachine {
    inner: Arc<VmInner>,
}

impl Default for VirtualMachine {
    fn default() -> Self {
        Self::new(VmConfig::default())
    }
}

impl VirtualMachine {
    pub fn new(config: VmConfig) -> Self {
        VirtualMachine {
            inner: Arc::new(VmInner {
                id: Uuid::new_v4(),
                config,
                symbols: RwLock::new(None),
                imports: RwLock::new(HashMap::new()),
                operators: RwLock::new(Arc::clone(&DEFAULT_OPERATORS)),
                tasks: Arc::new(WaitGroup { count: Mutex::new(0), cv: Condvar::new() }),
                debugger: RwLock::new(None),
                root_scope: Mutex::new(None),
                frame_ids: AtomicU64::new(1),
                thread_ids: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn config(&self) -> &VmConfig {
        &self.inner.config
    }

    // ------- Namespace -------

    /// Injects a host value. A later import with the same name wins.
    pub fn import(&self, name: impl Into<String>, value: Value) {
        self.inner.imports.write().insert(name.into(), value);
    }

    pub fn import_libs(&self, libs: HashMap<String, Value>) {
        let mut imports = self.inner.imports.write();
        for (name, value) in libs {
            imports.insert(name, value);
        }
    }

    pub fn imported(&self, name: &str) -> Option<Value> {
        self.inner.imports.read().get(name).cloned()
    }

    pub fn symbol_table(&self) -> Option<Arc<SymbolTable>> {
        self.inner.symbols.read().clone()
    }

    /// Replaces the symbol table used by subsequent runs; used when
    /// executing pre-marshalled bytecode.
    pub fn set_symbol_table(&self, symbols: SymbolTable) {
        *self.inner.symbols.write() = Some(Arc::new(symbols));
    }

    pub fn operators(&self) -> Arc<OperatorTable> {
        Arc::clone(&self.inner.operators.read())
    }

    pub fn set_operators(&self, table: OperatorTable) {
        *self.inner.operators.write() = Arc::new(table);
    }

    pub fn set_debugger(&self, debugger: Debugger) {
        *self.inner.debugger.write() = Some(Arc::new(Mutex::new(debugger)));
    }

    pub fn debugger(&self) -> Option<Arc<Mutex<Debugger>>> {
        self.inner.debugger.read().clone()
    }

    /// Scope the most recent top-level run finished with.
    pub fn root_scope(&self) -> Option<Arc<Scope>> {
        self.inner.root_scope.lock().clone()
    }

    pub(crate) fn next_frame_id(&self) -> u64 {
        self.inner.frame_ids.fetch_add(1, Ordering::Relaxed)
    }

    // ------- Execution -------

    /// Opens a root frame over the current symbol table and hands it to
    /// `setup`, which drives it (normally through `Frame::exec`).
    pub fn exec<F>(&self, ctx: &Context, setup: F) -> Result<Value, VmError>
    where
        F: FnOnce(&mut Frame) -> Result<Value, VmError>,
    {
        let symbols = self.symbol_table().ok_or(VmError::MissingSymbolTable)?;
        let debugger = self.debugger();
        if let Some(dbg) = &debugger {
            Debugger::run_init(dbg);
        }

        let scope = Scope::root(symbols);
        let mut frame = Frame::root(self.clone(), ctx.clone(), Arc::clone(&scope));
        let result = setup(&mut frame);
        *self.inner.root_scope.lock() = Some(scope);

        if let Some(dbg) = &debugger {
            Debugger::run_finished(dbg, &result);
        }
        result
    }

    pub fn exec_program(&self, ctx: &Context, program: &Program) -> Result<Value, VmError> {
        self.set_symbol_table(program.symbols.clone());
        let code: Arc<[Instruction]> = Arc::from(program.code.clone());
        self.exec(ctx, move |frame| frame.exec(code))
    }

    /// Runs `code` in an isolated frame over `scope` without debugger hooks
    /// and returns the value left on top of its stack.
    pub fn eval_in_scope(
        &self,
        ctx: &Context,
        scope: Arc<Scope>,
        code: Arc<[Instruction]>,
    ) -> Result<Value, VmError> {
        let mut frame = Frame::root(self.clone(), ctx.clone(), scope);
        frame.disable_debugger();
        frame.exec(code)
    }

    /// Blocks until every goroutine spawned on this VM has finished.
    pub fn async_wait(&self, ctx: &Context) -> Result<(), VmError> {
        self.inner.tasks.wait(ctx)
    }

    /// Calls a script or host callable from a frame at `caller_depth`.
    pub fn call_value(
        &self,
        ctx: &Context,
        callee: &Value,
        args: Vec<Value>,
        caller_depth: usize,
    ) -> Result<Value, VmError> {
        match callee.payload() {
            Payload::Function(closure) => {
                let mut frame = Frame::for_call(self.clone(), ctx.clone(), closure, args, caller_depth + 1)?;
                frame.run_body()
            }
            Payload::Host(host) => {
                let cx = CallContext { vm: self, ctx, depth: caller_depth };
                host.invoke(&cx, args)
            }
            _ => Err(VmError::type_error(format!("cannot call {}", callee.type_tag()))),
        }
    }

    /// Starts `callee` on its own OS thread. The wait group is released on
    /// every exit path, including a Rust panic inside the task.
    pub(crate) fn spawn(&self, ctx: &Context, callee: Value, args: Vec<Value>) -> Result<(), VmError> {
        if !callee.is_callable() {
            return Err(VmError::type_error(format!("cannot go {}", callee.type_tag())));
        }
        let guard = self.inner.tasks.add();
        let task = self.inner.thread_ids.fetch_add(1, Ordering::Relaxed) + 1;
        let vm = self.clone();
        let ctx = ctx.clone();
        std::thread::Builder::new()
            .name(format!("yakvm-go-{}", task))
            .spawn(move || {
                let _guard = guard;
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| vm.call_value(&ctx, &callee, args, 0)));
                match outcome {
                    Ok(Ok(_)) => debug!("goroutine {} finished", task),
                    Ok(Err(e)) => warn!("goroutine {} terminated: {}", task, e),
                    Err(_) => error!("goroutine {} panicked inside the vm", task),
                }
            })
            .map(|_| ())
            .map_err(|e| VmError::runtime(format!("cannot spawn goroutine: {}", e)))
    }
}

impl std::fmt::Debug for VirtualMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualMachine")
            .field("id", &self.inner.id)
            .field("imports", &self.inner.imports.read().len())
            .field("goroutines", &*self.inner.tasks.count.lock())
            .finish()
    }
}
