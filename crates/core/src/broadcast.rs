//! Fan-out of frames to registered listeners.
//!
//! Delivery is synchronous, in registration order, on the publishing thread.
//! A slow listener therefore slows the producer down; that backpressure is
//! the intended flow control. The listener list is snapshotted at the start
//! of every [`publish`](FrameBroadcaster::publish), so listeners may be
//! registered or removed from other threads at any time.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::error::{MjpegError, Result};
use crate::frame::Frame;

/// Receives frames from a [`FrameBroadcaster`].
///
/// Registering or unregistering a listener from inside its own callback is
/// not supported.
pub trait FrameListener: Send + Sync {
    fn on_frame(&self, frame: &Frame) -> Result<()>;

    /// Called once when the producer announces the end of its stream.
    fn on_end(&self) {}
}

impl<F> FrameListener for F
where
    F: Fn(&Frame) -> Result<()> + Send + Sync,
{
    fn on_frame(&self, frame: &Frame) -> Result<()> {
        self(frame)
    }
}

/// What happens when a listener fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaultPolicy {
    /// Log and count the failure; remaining listeners still get the frame.
    /// Panics inside a listener are caught and treated the same way.
    #[default]
    Isolate,
    /// Stop delivery and return the error to the publisher.
    Halt,
}

/// Delivers each published frame to every registered listener.
pub struct FrameBroadcaster {
    listeners: RwLock<Vec<Arc<dyn FrameListener>>>,
    policy: FaultPolicy,
    faults: AtomicU64,
}

impl FrameBroadcaster {
    pub fn new() -> Self {
        Self::with_policy(FaultPolicy::default())
    }

    pub fn with_policy(policy: FaultPolicy) -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            policy,
            faults: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> FaultPolicy {
        self.policy
    }

    /// Add a listener. Returns `false` if this exact listener (same `Arc`)
    /// is already registered.
    pub fn register(&self, listener: Arc<dyn FrameListener>) -> bool {
        let mut listeners = self.listeners.write();
        if listeners.iter().any(|l| same_listener(l, &listener)) {
            return false;
        }
        listeners.push(listener);
        tracing::debug!(total = listeners.len(), "listener registered");
        true
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn unregister<L: FrameListener + ?Sized>(&self, listener: &Arc<L>) -> bool {
        let mut listeners = self.listeners.write();
        match listeners.iter().position(|l| same_listener(l, listener)) {
            Some(pos) => {
                listeners.remove(pos);
                tracing::debug!(total = listeners.len(), "listener unregistered");
                true
            }
            None => false,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Number of listener failures absorbed under [`FaultPolicy::Isolate`].
    pub fn faults(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }

    /// Deliver `frame` to every listener registered when the call starts.
    ///
    /// Returns the number of listeners that accepted the frame. Under
    /// [`FaultPolicy::Halt`] the first failure is returned instead.
    pub fn publish(&self, frame: &Frame) -> Result<usize> {
        let listeners = self.listeners.read().clone();
        let mut delivered = 0;

        for listener in &listeners {
            let outcome = match self.policy {
                FaultPolicy::Halt => listener.on_frame(frame),
                FaultPolicy::Isolate => {
                    panic::catch_unwind(AssertUnwindSafe(|| listener.on_frame(frame)))
                        .unwrap_or_else(|_| Err(MjpegError::Listener("listener panicked".into())))
                }
            };

            match outcome {
                Ok(()) => delivered += 1,
                Err(e) if self.policy == FaultPolicy::Isolate => {
                    self.faults.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(sequence = frame.sequence(), error = %e, "listener failed");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(delivered)
    }

    /// Tell every listener that no more frames will follow.
    pub fn publish_end(&self) {
        let listeners = self.listeners.read().clone();
        for listener in &listeners {
            listener.on_end();
        }
    }
}

impl Default for FrameBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

fn same_listener<L: FrameListener + ?Sized>(a: &Arc<dyn FrameListener>, b: &Arc<L>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
