use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::broadcast::FrameListener;
use crate::error::Result;
use crate::frame::Frame;
use crate::protocol::multipart;

/// Boundary written by [`StreamRecorder::new`].
pub const DEFAULT_BOUNDARY: &str = "--myboundary";

/// Appends frames to a writer as a multipart stream.
///
/// Frames that carry their wire bytes ([`Frame::raw`]) are copied verbatim;
/// others are re-framed under the recorder's boundary. Either way the
/// output can be replayed with a looping source.
pub struct StreamRecorder<W: Write + Send> {
    writer: Mutex<W>,
    delimiter: Vec<u8>,
    frames: AtomicU64,
    bytes: AtomicU64,
}

impl<W: Write + Send> StreamRecorder<W> {
    pub fn new(writer: W) -> Self {
        Self::with_boundary(writer, DEFAULT_BOUNDARY)
    }

    pub fn with_boundary(writer: W, boundary: &str) -> Self {
        Self {
            writer: Mutex::new(writer),
            delimiter: multipart::delimiter_for(boundary),
            frames: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn flush(&self) -> Result<()> {
        self.writer.lock().flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W: Write + Send> FrameListener for StreamRecorder<W> {
    fn on_frame(&self, frame: &Frame) -> Result<()> {
        let mut writer = self.writer.lock();
        let written = match frame.raw().filter(|raw| raw.starts_with(b"--")) {
            Some(raw) => {
                writer.write_all(raw)?;
                writer.write_all(b"\r\n")?;
                raw.len() + 2
            }
            None => {
                let part = multipart::write_part(&self.delimiter, frame);
                writer.write_all(&part)?;
                part.len()
            }
        };
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(written as u64, Ordering::Relaxed);
        Ok(())
    }

    fn on_end(&self) {
        if let Err(e) = self.writer.lock().flush() {
            tracing::warn!(error = %e, "failed to flush recording");
        }
    }
}
