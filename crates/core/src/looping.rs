//! Replay of a recorded MJPEG file as an endless live feed.
//!
//! [`ReplayFile`] scans a file and, when it runs out, reopens it and starts
//! over. [`LoopingSource`] runs a replay on a [`FrameWorker`] so it can be
//! consumed like a camera.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::broadcast::FrameBroadcaster;
use crate::error::{MjpegError, Result};
use crate::frame::Frame;
use crate::queue::FrameQueue;
use crate::scanner::{FIRST_SEQUENCE, FrameScanner, FrameSource, ScannerConfig};
use crate::worker::{FrameWorker, WorkerConfig, WorkerState, WorkerStats};

/// How sequence numbers behave when the file wraps around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SequencePolicy {
    /// Keep counting up across passes.
    #[default]
    Continue,
    /// Start again from the first sequence number on every pass.
    Restart,
}

#[derive(Debug, Clone, Default)]
pub struct LoopConfig {
    pub scanner: ScannerConfig,
    pub sequence_policy: SequencePolicy,
    /// Pace frames to this rate. `None` replays as fast as the reader goes.
    pub frame_rate: Option<u32>,
}

/// A file that is scanned from the start again each time it is exhausted.
pub struct ReplayFile {
    path: PathBuf,
    config: LoopConfig,
    scanner: FrameScanner<File>,
    frames_this_pass: u64,
    passes: u64,
    interval: Option<Duration>,
    last_frame_at: Option<Instant>,
}

impl ReplayFile {
    pub fn open(path: impl AsRef<Path>, config: LoopConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let scanner = FrameScanner::with_config(file, config.scanner.clone());
        let interval = config
            .frame_rate
            .filter(|fps| *fps > 0)
            .map(|fps| Duration::from_secs(1) / fps);

        Ok(Self {
            path,
            config,
            scanner,
            frames_this_pass: 0,
            passes: 1,
            interval,
            last_frame_at: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of times the file has been opened, starting at 1.
    pub fn passes(&self) -> u64 {
        self.passes
    }

    fn rewind(&mut self) -> Result<()> {
        let next = match self.config.sequence_policy {
            SequencePolicy::Continue => self.scanner.next_sequence(),
            SequencePolicy::Restart => FIRST_SEQUENCE,
        };
        let file = File::open(&self.path)?;
        // replacing the scanner drops the exhausted file handle
        self.scanner =
            FrameScanner::with_config(file, self.config.scanner.clone()).with_first_sequence(next);
        self.passes += 1;
        self.frames_this_pass = 0;
        tracing::debug!(path = %self.path.display(), pass = self.passes, next, "replay rewound");
        Ok(())
    }

    fn pace(&mut self) {
        let Some(interval) = self.interval else {
            return;
        };
        if let Some(last) = self.last_frame_at {
            let elapsed = last.elapsed();
            if elapsed < interval {
                thread::sleep(interval - elapsed);
            }
        }
        self.last_frame_at = Some(Instant::now());
    }
}

impl FrameSource for ReplayFile {
    fn next_frame(&mut self) -> Result<Frame> {
        loop {
            match self.scanner.next_frame() {
                Ok(frame) => {
                    self.frames_this_pass += 1;
                    self.pace();
                    return Ok(frame);
                }
                Err(MjpegError::EndOfStream) if self.frames_this_pass == 0 => {
                    tracing::warn!(path = %self.path.display(), "recording contains no frames");
                    return Err(MjpegError::EndOfStream);
                }
                Err(MjpegError::EndOfStream) => self.rewind()?,
                Err(e) => return Err(e),
            }
        }
    }
}

/// A looping replay running on its own worker thread.
pub struct LoopingSource {
    worker: FrameWorker,
    queue: Option<Arc<FrameQueue>>,
}

impl LoopingSource {
    /// Open `path` and publish through a fresh broadcaster.
    pub fn open(path: impl AsRef<Path>, config: LoopConfig) -> Result<Self> {
        Self::with_broadcaster(path, config, Arc::new(FrameBroadcaster::new()))
    }

    pub fn with_broadcaster(
        path: impl AsRef<Path>,
        config: LoopConfig,
        broadcaster: Arc<FrameBroadcaster>,
    ) -> Result<Self> {
        let replay = ReplayFile::open(&path, config)?;
        let name = match path.as_ref().file_name() {
            Some(file) => format!("mjpeg-loop:{}", file.to_string_lossy()),
            None => "mjpeg-loop".to_string(),
        };
        let worker = FrameWorker::with_config(
            replay,
            broadcaster,
            WorkerConfig {
                name,
                announce_end: true,
            },
        );
        Ok(Self {
            worker,
            queue: None,
        })
    }

    /// Feed a queue that is closed and cleared when the source stops.
    pub fn with_queue(mut self, queue: Arc<FrameQueue>) -> Self {
        self.worker.broadcaster().register(queue.clone());
        self.queue = Some(queue);
        self
    }

    pub fn broadcaster(&self) -> &Arc<FrameBroadcaster> {
        self.worker.broadcaster()
    }

    pub fn queue(&self) -> Option<&Arc<FrameQueue>> {
        self.queue.as_ref()
    }

    pub fn start(&self) -> Result<()> {
        self.worker.start()
    }

    /// Stop the worker and wait for it to release the file. The attached
    /// queue is closed first, which releases a worker blocked on a full
    /// bounded queue and wakes any consumer, then emptied.
    pub fn stop(&self) {
        self.worker.stop();
        if let Some(queue) = &self.queue {
            queue.close();
        }
        self.worker.join();
        if let Some(queue) = &self.queue {
            let dropped = queue.remove_all();
            tracing::debug!(dropped, "looping source queue cleared");
        }
    }

    pub fn suspend(&self) -> Result<()> {
        self.worker.suspend()
    }

    pub fn resume(&self) -> Result<()> {
        self.worker.resume()
    }

    pub fn join(&self) {
        self.worker.join();
    }

    pub fn is_alive(&self) -> bool {
        self.worker.is_alive()
    }

    pub fn state(&self) -> WorkerState {
        self.worker.state()
    }

    pub fn stats(&self) -> WorkerStats {
        self.worker.stats()
    }
}
