use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::broadcast::FrameListener;
use crate::error::Result;
use crate::frame::Frame;

/// Smallest zero-padding. Sequences can run past `max_frames`.
const MIN_WIDTH: usize = 6;

/// Writes each frame to its own numbered JPEG file.
///
/// Files are named `<prefix><sequence>.jpg` with the sequence zero-padded to
/// six digits, or to the number of digits in `max_frames` when that is
/// larger. Skipped frames show up as gaps in the numbering.
pub struct JpegSequenceWriter {
    dir: PathBuf,
    prefix: String,
    max_frames: Option<u64>,
    width: usize,
    accepted: AtomicU64,
}

impl JpegSequenceWriter {
    pub fn new(dir: impl AsRef<Path>, prefix: &str, max_frames: Option<u64>) -> Self {
        let width = max_frames.map_or(MIN_WIDTH, |max| max.to_string().len().max(MIN_WIDTH));
        Self {
            dir: dir.as_ref().to_path_buf(),
            prefix: prefix.to_string(),
            max_frames,
            width,
            accepted: AtomicU64::new(0),
        }
    }

    pub fn file_name(&self, sequence: u64) -> String {
        format!("{}{:0width$}.jpg", self.prefix, sequence, width = self.width)
    }

    /// Frames written so far.
    pub fn written(&self) -> u64 {
        let accepted = self.accepted.load(Ordering::Relaxed);
        self.max_frames.map_or(accepted, |max| accepted.min(max))
    }

    /// Whether `max_frames` files have been written.
    pub fn is_done(&self) -> bool {
        self.max_frames.is_some_and(|max| self.written() >= max)
    }
}

impl FrameListener for JpegSequenceWriter {
    fn on_frame(&self, frame: &Frame) -> Result<()> {
        let n = self.accepted.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(max) = self.max_frames {
            if n > max {
                if n == max + 1 {
                    tracing::warn!(max, "frame limit reached, ignoring further frames");
                }
                return Ok(());
            }
        }

        let path = self.dir.join(self.file_name(frame.sequence()));
        fs::write(&path, frame.payload())?;
        tracing::debug!(path = %path.display(), len = frame.len(), "frame written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn frame(sequence: u64) -> Frame {
        Frame::new(sequence, Bytes::from(vec![0xFF, 0xD8, sequence as u8, 0xFF, 0xD9]))
    }

    #[test]
    fn names_have_even_width() {
        let dir = tempfile::tempdir().unwrap();
        let small = JpegSequenceWriter::new(dir.path(), "", Some(9));
        // sequences run past max_frames after gaps or on a looping source
        assert_eq!(small.file_name(9).len(), small.file_name(10).len());
        assert_eq!(small.file_name(3), "000003.jpg");
        assert_eq!(JpegSequenceWriter::new(dir.path(), "img", Some(250)).file_name(7), "img000007.jpg");
        assert_eq!(JpegSequenceWriter::new(dir.path(), "f_", None).file_name(42), "f_000042.jpg");
        assert_eq!(
            JpegSequenceWriter::new(dir.path(), "big", Some(50_000_000)).file_name(12),
            "big00000012.jpg"
        );
    }

    #[test]
    fn writes_payloads_and_honours_limit() {
        let dir = tempfile::tempdir().unwrap();
        let writer = JpegSequenceWriter::new(dir.path(), "cam", Some(2));
        for n in 1..=4 {
            writer.on_frame(&frame(n)).unwrap();
        }
        assert_eq!(writer.written(), 2);
        assert!(writer.is_done());

        assert_eq!(
            fs::read(dir.path().join("cam000001.jpg")).unwrap(),
            vec![0xFF, 0xD8, 1, 0xFF, 0xD9]
        );
        assert!(dir.path().join("cam000002.jpg").exists());
        assert!(!dir.path().join("cam000003.jpg").exists());
    }

    #[test]
    fn gaps_in_sequence_show_in_names() {
        let dir = tempfile::tempdir().unwrap();
        let writer = JpegSequenceWriter::new(dir.path(), "s", Some(99));
        writer.on_frame(&frame(1)).unwrap();
        writer.on_frame(&frame(3)).unwrap();
        assert!(dir.path().join("s000001.jpg").exists());
        assert!(!dir.path().join("s000002.jpg").exists());
        assert!(dir.path().join("s000003.jpg").exists());
    }

    #[test]
    fn missing_directory_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let writer = JpegSequenceWriter::new(dir.path().join("nope"), "x", None);
        assert!(matches!(
            writer.on_frame(&frame(1)),
            Err(crate::MjpegError::Io(_))
        ));
    }
}
