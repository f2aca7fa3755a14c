//! Blocking FIFO of frames between a producer and one consumer thread.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::broadcast::FrameListener;
use crate::error::{MjpegError, Result};
use crate::frame::Frame;

struct QueueState {
    frames: VecDeque<Frame>,
    closed: bool,
}

/// Thread-safe FIFO of frames.
///
/// Unbounded by default. A queue built with [`FrameQueue::bounded`] blocks
/// producers while it is full, which pushes back on the publishing worker.
///
/// Closing the queue wakes every waiter: consumers drain what is left and
/// then get `None`, producers get [`MjpegError::QueueClosed`].
pub struct FrameQueue {
    state: Mutex<QueueState>,
    /// Signalled when a frame is added or the queue closes.
    not_empty: Condvar,
    /// Signalled when frames are removed or the queue closes.
    drained: Condvar,
    capacity: Option<usize>,
}

impl FrameQueue {
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    /// A queue holding at most `capacity` frames (minimum 1).
    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity.max(1)))
    }

    fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                frames: VecDeque::new(),
                closed: false,
            }),
            not_empty: Condvar::new(),
            drained: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Append a frame, waiting for room if the queue is bounded and full.
    pub fn add(&self, frame: Frame) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(capacity) = self.capacity {
            while !state.closed && state.frames.len() >= capacity {
                self.drained.wait(&mut state);
            }
        }
        if state.closed {
            return Err(MjpegError::QueueClosed);
        }
        state.frames.push_back(frame);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Take the oldest frame, waiting until one arrives.
    ///
    /// Returns `None` once the queue is closed and empty.
    pub fn remove_one(&self) -> Option<Frame> {
        let mut state = self.state.lock();
        loop {
            if let Some(frame) = state.frames.pop_front() {
                self.drained.notify_all();
                return Some(frame);
            }
            if state.closed {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Like [`remove_one`](Self::remove_one) but gives up after `timeout`.
    pub fn remove_one_timeout(&self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(frame) = state.frames.pop_front() {
                self.drained.notify_all();
                return Some(frame);
            }
            if state.closed {
                return None;
            }
            if self.not_empty.wait_until(&mut state, deadline).timed_out() {
                let frame = state.frames.pop_front();
                if frame.is_some() {
                    self.drained.notify_all();
                }
                return frame;
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().frames.is_empty()
    }

    /// Always `false` for an unbounded queue.
    pub fn is_full(&self) -> bool {
        self.capacity
            .is_some_and(|capacity| self.state.lock().frames.len() >= capacity)
    }

    pub fn len(&self) -> usize {
        self.state.lock().frames.len()
    }

    /// Discard every queued frame, returning how many were dropped.
    pub fn remove_all(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.frames.len();
        state.frames.clear();
        self.drained.notify_all();
        dropped
    }

    /// Drop the oldest frames so that at most `keep` remain. Returns how
    /// many were dropped.
    pub fn remove_stale(&self, keep: usize) -> usize {
        let mut state = self.state.lock();
        let dropped = state.frames.len().saturating_sub(keep);
        if dropped > 0 {
            state.frames.drain(..dropped);
            self.drained.notify_all();
        }
        dropped
    }

    /// Block until a consumer has taken every queued frame.
    pub fn wait_until_empty(&self) {
        let mut state = self.state.lock();
        while !state.frames.is_empty() {
            self.drained.wait(&mut state);
        }
    }

    /// Stop accepting frames and wake all waiters. Queued frames can still
    /// be removed.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if !state.closed {
            state.closed = true;
            tracing::debug!(pending = state.frames.len(), "frame queue closed");
        }
        self.not_empty.notify_all();
        self.drained.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameListener for FrameQueue {
    fn on_frame(&self, frame: &Frame) -> Result<()> {
        self.add(frame.clone())
    }

    fn on_end(&self) {
        self.close();
    }
}
