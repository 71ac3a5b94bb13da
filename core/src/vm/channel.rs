//! file: core/src/vm/channel.rs
//! description: closable channels shared between goroutines.

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::error::VmError;
use crate::vm::context::{Context, Selected};
use crate::vm::value::Value;

/// Script channel. Capacity 0 is a rendezvous channel.
///
/// Closing drops the close signal's sender, which wakes every blocked
/// sender and receiver; buffered values stay readable after close.
pub struct Channel {
    capacity: usize,
    tx: Sender<Value>,
    rx: Receiver<Value>,
    closed: AtomicBool,
    close_tx: Mutex<Option<Sender<()>>>,
    close_rx: Receiver<()>,
}

impl Channel {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        let (close_tx, close_rx) = crossbeam_channel::bounded(0);
        Channel {
            capacity,
            tx,
            rx,
            closed: AtomicBool::new(false),
            close_tx: Mutex::new(Some(close_tx)),
            close_rx,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close(&self) -> Result<(), VmError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(VmError::runtime("close of closed channel"));
        }
        self.close_tx.lock().take();
        Ok(())
    }

    pub fn send(&self, ctx: &Context, value: Value) -> Result<(), VmError> {
        if self.is_closed() {
            return Err(VmError::runtime("send on closed channel"));
        }
        match ctx.send_or_signal(&self.tx, value, &self.close_rx) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(VmError::runtime("send on closed channel")),
            Err(reason) => Err(VmError::Cancelled(reason)),
        }
    }

    /// Returns `(value, true)` for a delivered value and
    /// `(undefined, false)` once closed and drained.
    pub fn recv(&self, ctx: &Context) -> Result<(Value, bool), VmError> {
        if let Ok(v) = self.rx.try_recv() {
            return Ok((v, true));
        }
        if self.is_closed() {
            return Ok((Value::undefined(), false));
        }
        match ctx.recv_or_signal(&self.rx, &self.close_rx) {
            Ok(Some(Selected::Value(v))) => Ok((v, true)),
            Ok(Some(Selected::Disconnected)) | Ok(None) => match self.rx.try_recv() {
                Ok(v) => Ok((v, true)),
                Err(_) => Ok((Value::undefined(), false)),
            },
            Err(reason) => Err(VmError::Cancelled(reason)),
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn buffered_values_survive_close() {
        let ctx = Context::background();
        let ch = Channel::new(2);
        ch.send(&ctx, Value::from(1i64)).unwrap();
        ch.close().unwrap();
        assert_eq!(ch.recv(&ctx).unwrap(), (Value::from(1i64), true));
        assert_eq!(ch.recv(&ctx).unwrap(), (Value::undefined(), false));
        assert!(ch.send(&ctx, Value::from(2i64)).is_err());
        assert!(ch.close().is_err());
    }

    #[test]
    fn rendezvous_hands_over_between_threads() {
        let ctx = Context::background();
        let ch = Arc::new(Channel::new(0));
        let ch2 = Arc::clone(&ch);
        let ctx2 = ctx.clone();
        let t = std::thread::spawn(move || ch2.send(&ctx2, Value::from("hi")));
        assert_eq!(ch.recv(&ctx).unwrap().0, Value::from("hi"));
        assert!(t.join().unwrap().is_ok());
    }

    #[test]
    fn blocked_receive_is_cancellable() {
        let ctx = Context::with_timeout(&Context::background(), Duration::from_millis(20));
        let ch = Channel::new(0);
        let err = ch.recv(&ctx).unwrap_err();
        assert!(err.is_cancelled(), "{}", err);
    }

    #[test]
    fn close_wakes_blocked_receiver() {
        let ctx = Context::background();
        let ch = Arc::new(Channel::new(0));
        let ch2 = Arc::clone(&ch);
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            ch2.close()
        });
        assert_eq!(ch.recv(&ctx).unwrap(), (Value::undefined(), false));
        assert!(t.join().unwrap().is_ok());
    }
}
