//! file: core/src/vm/debugger.rs
//! description: breakpoints, watches and stepping.
//!
//! The debugger sits between the fetch loop and dispatch. A frame asks it
//! whether to pause before each instruction; pauses are decided only when
//! the instruction starts a new source line, except for step requests that
//! track call depth. While the user callback runs the debugger lock is held,
//! so pauses from concurrent goroutines are serialized.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

use log::debug;
use parking_lot::{Mutex, MutexGuard};

use crate::error::VmError;
use crate::vm::context::Context;
use crate::vm::frame::{Frame, FrameView};
use crate::vm::op::Instruction;
use crate::vm::value::Value;
use crate::vm::VirtualMachine;

pub type DebugCallback = Box<dyn FnMut(&mut Debugger) + Send>;

thread_local! {
    static IN_HOOK: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as running debugger code, so frames created
/// from inside a callback or condition do not re-enter the hook.
struct HookScope;

impl HookScope {
    fn enter() -> Self {
        IN_HOOK.with(|h| h.set(true));
        HookScope
    }

    fn active() -> bool {
        IN_HOOK.with(Cell::get)
    }
}

impl Drop for HookScope {
    fn drop(&mut self) {
        IN_HOOK.with(|h| h.set(false));
    }
}

/// Pre-compiled expression evaluated against a paused scope.
#[derive(Debug, Clone)]
pub struct Expression {
    pub source: String,
    pub code: Arc<[Instruction]>,
}

impl Expression {
    pub fn new(source: impl Into<String>, code: Vec<Instruction>) -> Self {
        Expression { source: source.into(), code: Arc::from(code) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitCondition {
    Equal(usize),
    AtLeast(usize),
    Multiple(usize),
}

impl HitCondition {
    fn allows(&self, hits: usize) -> bool {
        match *self {
            HitCondition::Equal(n) => hits == n,
            HitCondition::AtLeast(n) => hits >= n,
            HitCondition::Multiple(n) => n > 0 && hits % n == 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Breakpoint {
    pub line: usize,
    pub condition: Option<Expression>,
    pub hit_condition: Option<HitCondition>,
    pub hits: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    Next,
    In,
    Out,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PauseReason {
    Breakpoint { line: usize },
    Watch { name: String, old: Option<Value>, new: Value },
    Step(StepMode),
    Finished,
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PauseReason::Breakpoint { line } => write!(f, "breakpoint at line {}", line),
            PauseReason::Watch { name, old: Some(old), new } => write!(f, "watch {}: {} -> {}", name, old, new),
            PauseReason::Watch { name, old: None, new } => write!(f, "watch {}: -> {}", name, new),
            PauseReason::Step(mode) => write!(f, "step {:?}", mode),
            PauseReason::Finished => write!(f, "finished"),
        }
    }
}

#[derive(Debug, Clone)]
struct StepRequest {
    mode: StepMode,
    thread: ThreadId,
    frame_id: u64,
    depth: usize,
}

impl StepRequest {
    fn matches(&self, view: &FrameView, new_line: bool) -> bool {
        if view.thread != self.thread {
            return false;
        }
        match self.mode {
            StepMode::Out => view.depth < self.depth,
            StepMode::In if view.depth > self.depth => true,
            StepMode::Next | StepMode::In => {
                (view.frame_id == self.frame_id && new_line) || view.depth < self.depth
            }
        }
    }
}

pub struct Debugger {
    init: Option<DebugCallback>,
    callback: Option<DebugCallback>,
    breakpoints: BTreeMap<usize, Breakpoint>,
    observed: BTreeMap<String, Option<Value>>,
    step: Option<StepRequest>,
    pause: Option<PauseReason>,
    frame: Option<FrameView>,
    finished: bool,
    // Present only while paused; lets the callback evaluate expressions.
    vm: Option<VirtualMachine>,
    ctx: Option<Context>,
}

impl Debugger {
    pub fn new<I, C>(init: I, callback: C) -> Self
    where
        I: FnMut(&mut Debugger) + Send + 'static,
        C: FnMut(&mut Debugger) + Send + 'static,
    {
        Debugger {
            init: Some(Box::new(init)),
            callback: Some(Box::new(callback)),
            breakpoints: BTreeMap::new(),
            observed: BTreeMap::new(),
            step: None,
            pause: None,
            frame: None,
            finished: false,
            vm: None,
            ctx: None,
        }
    }

    // ------- Breakpoints -------

    pub fn set_normal_breakpoint(&mut self, line: usize) {
        self.set_breakpoint(line, None, None);
    }

    pub fn set_conditional_breakpoint(&mut self, line: usize, condition: Expression) {
        self.set_breakpoint(line, Some(condition), None);
    }

    /// Replaces any breakpoint already registered on `line`.
    pub fn set_breakpoint(&mut self, line: usize, condition: Option<Expression>, hit_condition: Option<HitCondition>) {
        self.breakpoints.insert(line, Breakpoint { line, condition, hit_condition, hits: 0 });
    }

    pub fn remove_breakpoint(&mut self, line: usize) -> bool {
        self.breakpoints.remove(&line).is_some()
    }

    pub fn breakpoints(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.values()
    }

    pub fn clear_breakpoints(&mut self) {
        self.breakpoints.clear();
        self.observed.clear();
    }

    pub fn add_observe_breakpoint(&mut self, name: impl Into<String>) {
        let name = name.into();
        let current = self.frame.as_ref().and_then(|f| f.get_value_by_name(&name)).map(|v| v.deep_clone());
        self.observed.insert(name, current);
    }

    pub fn remove_observe_breakpoint(&mut self, name: &str) -> bool {
        self.observed.remove(name).is_some()
    }

    /// Last value seen for a watched name.
    pub fn observed(&self, name: &str) -> Option<&Value> {
        self.observed.get(name).and_then(Option::as_ref)
    }

    // ------- Stepping -------

    pub fn step_next(&mut self) {
        self.request_step(StepMode::Next);
    }

    pub fn step_in(&mut self) {
        self.request_step(StepMode::In);
    }

    pub fn step_out(&mut self) {
        self.request_step(StepMode::Out);
    }

    pub fn resume(&mut self) {
        self.step = None;
    }

    fn request_step(&mut self, mode: StepMode) {
        self.step = self.frame.as_ref().map(|view| StepRequest {
            mode,
            thread: view.thread,
            frame_id: view.frame_id,
            depth: view.depth,
        });
    }

    // ------- Paused state -------

    pub fn finished(&self) -> bool {
        self.finished
    }

    pub fn current_line(&self) -> usize {
        self.frame.as_ref().map(|f| f.line).unwrap_or(0)
    }

    pub fn frame(&self) -> Option<&FrameView> {
        self.frame.as_ref()
    }

    pub fn pause_reason(&self) -> Option<&PauseReason> {
        self.pause.as_ref()
    }

    pub fn get_value_by_name(&self, name: &str) -> Option<Value> {
        self.frame.as_ref().and_then(|f| f.get_value_by_name(name))
    }

    pub fn eval_expression(&self, expr: &Expression) -> Result<Value, VmError> {
        let (Some(vm), Some(ctx), Some(frame)) = (&self.vm, &self.ctx, &self.frame) else {
            return Err(VmError::runtime("debugger is not paused"));
        };
        vm.eval_in_scope(ctx, Arc::clone(frame.current_scope()), Arc::clone(&expr.code))
    }

    // ------- Hooks driven by the VM -------

    pub(crate) fn run_init(dbg: &Arc<Mutex<Debugger>>) {
        let _hook = HookScope::enter();
        let mut guard = dbg.lock();
        guard.finished = false;
        guard.pause = None;
        guard.step = None;
        for bp in guard.breakpoints.values_mut() {
            bp.hits = 0;
        }
        if let Some(mut init) = guard.init.take() {
            init(&mut *guard);
            guard.init = Some(init);
        }
    }

    pub(crate) fn run_finished(dbg: &Arc<Mutex<Debugger>>, result: &Result<Value, VmError>) {
        let _hook = HookScope::enter();
        let mut guard = dbg.lock();
        if guard.finished {
            return;
        }
        match result {
            Ok(_) => debug!("debugger: program finished"),
            Err(e) => debug!("debugger: program finished with error: {}", e),
        }
        guard.finished = true;
        guard.step = None;
        guard.frame = None;
        guard.pause = Some(PauseReason::Finished);
        guard.invoke_callback();
    }

    pub(crate) fn on_instruction(dbg: &Arc<Mutex<Debugger>>, frame: &Frame, new_line: bool) -> Result<(), VmError> {
        if HookScope::active() {
            return Ok(());
        }
        let mut guard = lock_cancellable(dbg, frame.context())?;
        if guard.finished {
            return Ok(());
        }
        let view = frame.view();

        let stepped = guard.step.as_ref().filter(|req| req.matches(&view, new_line)).map(|req| req.mode);
        let reason = match stepped {
            Some(mode) => Some(PauseReason::Step(mode)),
            None if new_line => guard.breakpoint_hit(frame, view.line).or_else(|| guard.watch_hit(&view)),
            None => None,
        };
        let Some(reason) = reason else {
            return Ok(());
        };

        debug!("debugger: pause in {} at line {} ({})", view.function, view.line, reason);
        let _hook = HookScope::enter();
        guard.step = None;
        guard.pause = Some(reason);
        guard.frame = Some(view);
        guard.vm = Some(frame.vm().clone());
        guard.ctx = Some(frame.context().clone());
        guard.invoke_callback();
        guard.pause = None;
        guard.vm = None;
        guard.ctx = None;
        Ok(())
    }

    fn invoke_callback(&mut self) {
        if let Some(mut callback) = self.callback.take() {
            callback(self);
            self.callback = Some(callback);
        }
    }

    fn breakpoint_hit(&mut self, frame: &Frame, line: usize) -> Option<PauseReason> {
        let bp = self.breakpoints.get_mut(&line)?;
        if let Some(cond) = &bp.condition {
            let _hook = HookScope::enter();
            let scope = Arc::clone(frame.current_scope());
            match frame.vm().eval_in_scope(frame.context(), scope, Arc::clone(&cond.code)) {
                Ok(v) if v.truthy() => {}
                Ok(_) => return None,
                Err(e) => {
                    debug!("debugger: condition `{}` failed: {}", cond.source, e);
                    return None;
                }
            }
        }
        bp.hits += 1;
        match bp.hit_condition {
            Some(hc) if !hc.allows(bp.hits) => None,
            _ => Some(PauseReason::Breakpoint { line }),
        }
    }

    fn watch_hit(&mut self, view: &FrameView) -> Option<PauseReason> {
        for (name, last) in self.observed.iter_mut() {
            let Some(current) = view.get_value_by_name(name) else {
                continue;
            };
            if last.as_ref() != Some(&current) {
                let old = last.replace(current.deep_clone());
                return Some(PauseReason::Watch { name: name.clone(), old, new: current });
            }
        }
        None
    }
}

impl fmt::Debug for Debugger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Debugger")
            .field("breakpoints", &self.breakpoints.keys().collect::<Vec<_>>())
            .field("observed", &self.observed.keys().collect::<Vec<_>>())
            .field("pause", &self.pause)
            .field("finished", &self.finished)
            .finish()
    }
}

/// Waits for the debugger lock without outliving the frame's context.
fn lock_cancellable<'a>(dbg: &'a Arc<Mutex<Debugger>>, ctx: &Context) -> Result<MutexGuard<'a, Debugger>, VmError> {
    loop {
        if let Some(guard) = dbg.try_lock_for(Duration::from_millis(50)) {
            return Ok(guard);
        }
        if let Some(reason) = ctx.err() {
            return Err(VmError::Cancelled(reason));
        }
    }
}
