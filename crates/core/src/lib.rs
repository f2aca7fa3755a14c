//! Motion-JPEG stream processing.
//!
//! A [`FrameScanner`] cuts a byte stream (an HTTP `multipart/x-mixed-replace`
//! body, a recorded file, or plain concatenated JPEGs) into [`Frame`]s. A
//! [`FrameWorker`] runs a scanner on its own thread and publishes each frame
//! through a [`FrameBroadcaster`] to any number of [`FrameListener`]s, such
//! as a [`FrameQueue`], a [`RateMonitor`] or a [`JpegSequenceWriter`]. A
//! [`LoopingSource`] replays a recording forever, and an [`MjpegServer`]
//! re-serves any broadcaster over HTTP.
//!
//! ```no_run
//! use std::sync::Arc;
//! use mjpeg::{FrameBroadcaster, FrameQueue, FrameWorker, HttpConfig, ScannerConfig};
//!
//! let conn = mjpeg::http::connect("http://camera.local/mjpg/video.mjpg", &HttpConfig::default())?;
//! let broadcaster = Arc::new(FrameBroadcaster::new());
//! let queue = Arc::new(FrameQueue::new());
//! broadcaster.register(queue.clone());
//!
//! let worker = FrameWorker::new(conn.into_scanner(ScannerConfig::default()), broadcaster);
//! worker.start()?;
//! while let Some(frame) = queue.remove_one() {
//!     println!("frame {} ({} bytes)", frame.sequence(), frame.len());
//! }
//! # Ok::<(), mjpeg::MjpegError>(())
//! ```

pub mod broadcast;
pub mod error;
pub mod frame;
pub mod http;
pub mod looping;
pub mod monitor;
pub mod protocol;
pub mod queue;
pub mod record;
pub mod scanner;
pub mod sequence;
pub mod server;
pub mod transport;
pub mod worker;

pub use broadcast::{FaultPolicy, FrameBroadcaster, FrameListener};
pub use error::{MjpegError, ParseErrorKind, Result};
pub use frame::Frame;
pub use http::{HttpConfig, MjpegConnection};
pub use looping::{LoopConfig, LoopingSource, ReplayFile, SequencePolicy};
pub use monitor::RateMonitor;
pub use queue::FrameQueue;
pub use record::StreamRecorder;
pub use scanner::{FrameScanner, FrameSource, FramingMode, ScannerConfig};
pub use sequence::JpegSequenceWriter;
pub use server::{MjpegServer, ServerConfig};
pub use worker::{FrameWorker, WorkerConfig, WorkerState, WorkerStats};
