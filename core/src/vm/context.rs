//! file: core/src/vm/context.rs
//! description: cancellation contexts for every blocking VM operation.
//!
//! A `Context` owns a done channel that is closed on cancellation, plus an
//! optional deadline. Blocking operations select over the done channel, a
//! timer for the deadline, and the operation itself.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Select, Sender};
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Cancelled,
    DeadlineExceeded,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Cancelled => write!(f, "context canceled"),
            CancelReason::DeadlineExceeded => write!(f, "context deadline exceeded"),
        }
    }
}

struct Inner {
    deadline: Option<Instant>,
    cancelled: AtomicBool,
    reason: Mutex<Option<CancelReason>>,
    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,
    children: Mutex<Vec<Weak<Inner>>>,
}

impl Inner {
    fn cancel(&self, reason: CancelReason) {
        {
            let mut slot = self.reason.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(reason);
        }
        self.cancelled.store(true, Ordering::SeqCst);
        // Dropping the only sender disconnects every receiver at once.
        self.done_tx.lock().take();
        let children: Vec<Weak<Inner>> = std::mem::take(&mut *self.children.lock());
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel(reason);
        }
    }
}

#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

/// Outcome of a context-aware select on a value-carrying channel.
pub(crate) enum Selected<T> {
    Value(T),
    Disconnected,
}

impl Context {
    fn with_parent(parent: Option<&Context>, deadline: Option<Instant>) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(0);
        let deadline = match (parent.and_then(|p| p.deadline()), deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let ctx = Context {
            inner: Arc::new(Inner {
                deadline,
                cancelled: AtomicBool::new(false),
                reason: Mutex::new(None),
                done_tx: Mutex::new(Some(tx)),
                done_rx: rx,
                children: Mutex::new(Vec::new()),
            }),
        };
        if let Some(p) = parent {
            match *p.inner.reason.lock() {
                Some(reason) => ctx.inner.cancel(reason),
                None => {
                    let mut children = p.inner.children.lock();
                    children.retain(|child| child.strong_count() > 0);
                    children.push(Arc::downgrade(&ctx.inner));
                }
            }
        }
        ctx
    }

    /// A context that is never cancelled on its own.
    pub fn background() -> Self {
        Self::with_parent(None, None)
    }

    pub fn with_cancel(parent: &Context) -> Self {
        Self::with_parent(Some(parent), None)
    }

    pub fn with_timeout(parent: &Context, timeout: Duration) -> Self {
        Self::with_parent(Some(parent), Some(Instant::now() + timeout))
    }

    pub fn with_deadline(parent: &Context, deadline: Instant) -> Self {
        Self::with_parent(Some(parent), Some(deadline))
    }

    pub fn cancel(&self) {
        self.inner.cancel(CancelReason::Cancelled);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// `None` while the context is live.
    pub fn err(&self) -> Option<CancelReason> {
        if self.inner.cancelled.load(Ordering::SeqCst) {
            return *self.inner.reason.lock();
        }
        match self.inner.deadline {
            Some(d) if Instant::now() >= d => {
                self.inner.cancel(CancelReason::DeadlineExceeded);
                Some(CancelReason::DeadlineExceeded)
            }
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    fn timer(&self) -> Receiver<Instant> {
        match self.inner.deadline {
            Some(d) => crossbeam_channel::at(d),
            None => crossbeam_channel::never(),
        }
    }

    fn reason_after_wakeup(&self, timer_fired: bool) -> CancelReason {
        if timer_fired {
            self.inner.cancel(CancelReason::DeadlineExceeded);
        }
        self.err().unwrap_or(CancelReason::Cancelled)
    }

    /// Sleeps for `duration`, waking early with an error on cancellation.
    pub fn sleep(&self, duration: Duration) -> Result<(), CancelReason> {
        let wake = crossbeam_channel::after(duration);
        match self.recv(&wake)? {
            Selected::Value(_) | Selected::Disconnected => Ok(()),
        }
    }

    /// Blocks on `rx` until a value arrives, the channel disconnects, or the
    /// context ends.
    pub(crate) fn recv<T>(&self, rx: &Receiver<T>) -> Result<Selected<T>, CancelReason> {
        if let Some(reason) = self.err() {
            return Err(reason);
        }
        let timer = self.timer();
        let mut sel = Select::new();
        let op_value = sel.recv(rx);
        let op_done = sel.recv(&self.inner.done_rx);
        let op_timer = sel.recv(&timer);
        let oper = sel.select();
        match oper.index() {
            i if i == op_value => Ok(match oper.recv(rx) {
                Ok(v) => Selected::Value(v),
                Err(_) => Selected::Disconnected,
            }),
            i if i == op_done => {
                let _ = oper.recv(&self.inner.done_rx);
                Err(self.reason_after_wakeup(false))
            }
            i if i == op_timer => {
                let _ = oper.recv(&timer);
                Err(self.reason_after_wakeup(true))
            }
            _ => unreachable!("select returned an unregistered operation"),
        }
    }

    /// Like `recv`, but also wakes when `signal` fires or disconnects.
    /// Returns `Ok(None)` in that case.
    pub(crate) fn recv_or_signal<T>(
        &self,
        rx: &Receiver<T>,
        signal: &Receiver<()>,
    ) -> Result<Option<Selected<T>>, CancelReason> {
        if let Some(reason) = self.err() {
            return Err(reason);
        }
        let timer = self.timer();
        let mut sel = Select::new();
        let op_value = sel.recv(rx);
        let op_signal = sel.recv(signal);
        let op_done = sel.recv(&self.inner.done_rx);
        let op_timer = sel.recv(&timer);
        let oper = sel.select();
        match oper.index() {
            i if i == op_value => Ok(Some(match oper.recv(rx) {
                Ok(v) => Selected::Value(v),
                Err(_) => Selected::Disconnected,
            })),
            i if i == op_signal => {
                let _ = oper.recv(signal);
                Ok(None)
            }
            i if i == op_done => {
                let _ = oper.recv(&self.inner.done_rx);
                Err(self.reason_after_wakeup(false))
            }
            i if i == op_timer => {
                let _ = oper.recv(&timer);
                Err(self.reason_after_wakeup(true))
            }
            _ => unreachable!("select returned an unregistered operation"),
        }
    }

    /// Sends `value`, racing against `signal` and the context. On a signal
    /// the value is handed back.
    pub(crate) fn send_or_signal<T>(
        &self,
        tx: &Sender<T>,
        value: T,
        signal: &Receiver<()>,
    ) -> Result<Result<(), T>, CancelReason> {
        if let Some(reason) = self.err() {
            return Err(reason);
        }
        let timer = self.timer();
        let mut sel = Select::new();
        let op_send = sel.send(tx);
        let op_signal = sel.recv(signal);
        let op_done = sel.recv(&self.inner.done_rx);
        let op_timer = sel.recv(&timer);
        let oper = sel.select();
        match oper.index() {
            i if i == op_send => Ok(oper.send(tx, value).map_err(|e| e.into_inner())),
            i if i == op_signal => {
                let _ = oper.recv(signal);
                Ok(Err(value))
            }
            i if i == op_done => {
                let _ = oper.recv(&self.inner.done_rx);
                Err(self.reason_after_wakeup(false))
            }
            i if i == op_timer => {
                let _ = oper.recv(&timer);
                Err(self.reason_after_wakeup(true))
            }
            _ => unreachable!("select returned an unregistered operation"),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("deadline", &self.inner.deadline)
            .field("err", &self.err())
            .finish()
    }
}
