//! Background frame pump.
//!
//! A [`FrameWorker`] owns a [`FrameSource`] and a dedicated thread that reads
//! frames from it and publishes them through a [`FrameBroadcaster`].
//!
//! ## Lifecycle
//!
//! ```text
//! start    Idle      -> Running
//! suspend  Running   -> Suspended
//! resume   Suspended -> Running
//! stop     any       -> Stopped   (terminal)
//! end of stream or fatal error -> Stopped
//! ```
//!
//! Suspension is cooperative: the thread checks for it before each read, so
//! a frame already being read when `suspend` is called is still published.
//! `stop` likewise takes effect at the next check; a thread blocked inside
//! the source's read stays there until the read returns.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::broadcast::FrameBroadcaster;
use crate::error::{MjpegError, Result};
use crate::scanner::FrameSource;

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Created, thread not yet spawned.
    Idle,
    /// Reading and publishing frames.
    Running,
    /// Thread parked until `resume` or `stop`.
    Suspended,
    /// Finished; cannot be restarted.
    Stopped,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name given to the spawned thread and its log span.
    pub name: String,
    /// Call [`FrameBroadcaster::publish_end`] whenever the worker exits
    /// (end of stream, failure or stop), so queues close and their
    /// consumers exit.
    pub announce_end: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "mjpeg-worker".to_string(),
            announce_end: false,
        }
    }
}

/// Counters collected while the worker runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Frames delivered to the broadcaster.
    pub frames: u64,
    /// Malformed or oversized frames skipped.
    pub skipped: u64,
}

struct Control {
    state: WorkerState,
    alive: bool,
}

struct Shared {
    control: Mutex<Control>,
    signal: Condvar,
    frames: AtomicU64,
    skipped: AtomicU64,
}

impl Shared {
    /// Park while suspended. Returns `false` once the worker must exit.
    fn proceed(&self) -> bool {
        let mut control = self.control.lock();
        loop {
            match control.state {
                WorkerState::Running | WorkerState::Idle => return true,
                WorkerState::Suspended => self.signal.wait(&mut control),
                WorkerState::Stopped => return false,
            }
        }
    }
}

/// Marks the worker finished when the thread exits, panics included.
struct ExitGuard(Arc<Shared>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let mut control = self.0.control.lock();
        control.state = WorkerState::Stopped;
        control.alive = false;
        self.0.signal.notify_all();
    }
}

/// Reads frames on its own thread and hands them to a broadcaster.
pub struct FrameWorker {
    shared: Arc<Shared>,
    broadcaster: Arc<FrameBroadcaster>,
    config: WorkerConfig,
    source: Mutex<Option<Box<dyn FrameSource>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl FrameWorker {
    pub fn new<S: FrameSource + 'static>(source: S, broadcaster: Arc<FrameBroadcaster>) -> Self {
        Self::with_config(source, broadcaster, WorkerConfig::default())
    }

    pub fn with_config<S: FrameSource + 'static>(
        source: S,
        broadcaster: Arc<FrameBroadcaster>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                control: Mutex::new(Control {
                    state: WorkerState::Idle,
                    alive: false,
                }),
                signal: Condvar::new(),
                frames: AtomicU64::new(0),
                skipped: AtomicU64::new(0),
            }),
            broadcaster,
            config,
            source: Mutex::new(Some(Box::new(source))),
            handle: Mutex::new(None),
        }
    }

    pub fn broadcaster(&self) -> &Arc<FrameBroadcaster> {
        &self.broadcaster
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Spawn the worker thread. Does nothing if it is already running or
    /// suspended; a stopped worker cannot be restarted.
    pub fn start(&self) -> Result<()> {
        let mut control = self.shared.control.lock();
        match control.state {
            WorkerState::Running | WorkerState::Suspended => return Ok(()),
            WorkerState::Stopped => {
                return Err(MjpegError::InvalidTransition {
                    from: WorkerState::Stopped,
                    action: "start",
                });
            }
            WorkerState::Idle => {}
        }

        let source = self.source.lock().take().ok_or(MjpegError::InvalidTransition {
            from: control.state,
            action: "start",
        })?;

        let shared = self.shared.clone();
        let broadcaster = self.broadcaster.clone();
        let config = self.config.clone();
        let handle = thread::Builder::new()
            .name(self.config.name.clone())
            .spawn(move || pump(source, shared, broadcaster, config));

        match handle {
            Ok(handle) => {
                control.state = WorkerState::Running;
                control.alive = true;
                *self.handle.lock() = Some(handle);
                tracing::info!(worker = %self.config.name, "worker started");
                Ok(())
            }
            Err(e) => {
                control.state = WorkerState::Stopped;
                Err(e.into())
            }
        }
    }

    /// Ask the worker to finish. Idempotent; does not wait for the thread.
    pub fn stop(&self) {
        let mut control = self.shared.control.lock();
        let from = control.state;
        if from == WorkerState::Stopped {
            return;
        }
        control.state = WorkerState::Stopped;
        self.shared.signal.notify_all();
        drop(control);

        if from == WorkerState::Idle {
            self.source.lock().take();
        }
        tracing::info!(worker = %self.config.name, ?from, "worker stopping");
    }

    /// Pause before the next read. No-op if already suspended.
    pub fn suspend(&self) -> Result<()> {
        self.transition("suspend", WorkerState::Running, WorkerState::Suspended)
    }

    /// Continue after [`suspend`](Self::suspend). No-op if already running.
    pub fn resume(&self) -> Result<()> {
        self.transition("resume", WorkerState::Suspended, WorkerState::Running)
    }

    fn transition(&self, action: &'static str, from: WorkerState, to: WorkerState) -> Result<()> {
        let mut control = self.shared.control.lock();
        if control.state == to {
            return Ok(());
        }
        if control.state != from {
            return Err(MjpegError::InvalidTransition {
                from: control.state,
                action,
            });
        }
        control.state = to;
        self.shared.signal.notify_all();
        tracing::debug!(worker = %self.config.name, old_state = ?from, new_state = ?to, "state transition");
        Ok(())
    }

    /// Block until the worker thread has exited. Returns immediately if it
    /// was never started.
    pub fn join(&self) {
        {
            let mut control = self.shared.control.lock();
            while control.alive {
                self.shared.signal.wait(&mut control);
            }
        }
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                tracing::warn!(worker = %self.config.name, "worker thread panicked");
            }
        }
    }

    /// Start the worker and wait for it to finish.
    pub fn run(&self) -> Result<()> {
        self.start()?;
        self.join();
        Ok(())
    }

    pub fn state(&self) -> WorkerState {
        self.shared.control.lock().state
    }

    /// Whether the worker thread is still executing.
    pub fn is_alive(&self) -> bool {
        self.shared.control.lock().alive
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            frames: self.shared.frames.load(Ordering::Relaxed),
            skipped: self.shared.skipped.load(Ordering::Relaxed),
        }
    }
}

impl Drop for FrameWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn pump(
    mut source: Box<dyn FrameSource>,
    shared: Arc<Shared>,
    broadcaster: Arc<FrameBroadcaster>,
    config: WorkerConfig,
) {
    let _exit = ExitGuard(shared.clone());
    let span = tracing::info_span!("worker", name = %config.name);
    let _enter = span.enter();

    let reason = loop {
        if !shared.proceed() {
            break "stopped";
        }

        match source.next_frame() {
            Ok(frame) => match broadcaster.publish(&frame) {
                Ok(delivered) => {
                    shared.frames.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(sequence = frame.sequence(), len = frame.len(), delivered, "frame published");
                }
                Err(e) => {
                    tracing::error!(sequence = frame.sequence(), error = %e, "listener failed, halting");
                    break "listener failure";
                }
            },
            Err(e) if e.is_recoverable() => {
                shared.skipped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "skipping frame");
            }
            Err(MjpegError::EndOfStream) => break "end of stream",
            Err(e) => {
                tracing::error!(error = %e, "source failed");
                break "source failure";
            }
        }
    };

    if config.announce_end {
        broadcaster.publish_end();
    }

    drop(source);
    tracing::info!(
        reason,
        frames = shared.frames.load(Ordering::Relaxed),
        skipped = shared.skipped.load(Ordering::Relaxed),
        "worker finished"
    );
}
