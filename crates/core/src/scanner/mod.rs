//! Frame boundary scanning.
//!
//! [`FrameScanner`] turns any [`Read`] into a sequence of [`Frame`]s. It makes
//! no assumption about alignment: bytes before the first frame start are
//! discarded, so a stream joined mid-frame yields the first *complete* frame.
//!
//! ## Framing modes
//!
//! | Mode | Frame start | Frame end |
//! |------|-------------|-----------|
//! | [`FramingMode::Multipart`] | boundary delimiter line | `Content-Length`, else last EOI before the next delimiter |
//! | [`FramingMode::Markers`] | JPEG SOI | matching JPEG EOI |
//! | [`FramingMode::Auto`] | sniffed from the first bytes, then one of the above | |
//!
//! The buffer never grows much beyond [`ScannerConfig::max_frame_size`]; a
//! frame that does not fit fails with [`MjpegError::CapacityExceeded`] and
//! scanning resumes after it. The scanner never retries a failed read.

pub mod jpeg;

use std::io::{self, Read};

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{MjpegError, ParseErrorKind, Result};
use crate::frame::{EOI, Frame, SOI};
use crate::protocol::multipart::{self, find, rfind};
use jpeg::JpegWalker;

/// Default upper bound on a single frame, in bytes.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 2 * 1024 * 1024;

/// Default number of bytes requested from the reader per fill.
pub const DEFAULT_READ_CHUNK: usize = 16 * 1024;

/// Sequence number given to the first frame of a fresh scanner.
pub const FIRST_SEQUENCE: u64 = 1;

/// Bytes that must follow a complete JPEG before auto-detection settles on
/// marker mode, so a delimiter right after EOI is not missed.
const SNIFF_TAIL: usize = 256;

/// Anything that yields frames one at a time.
///
/// This is the seam between a [`FrameWorker`](crate::FrameWorker) and its
/// input. Errors follow the scanner's contract: recoverable framing errors,
/// [`MjpegError::EndOfStream`] when exhausted, anything else is fatal.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Frame>;
}

impl FrameSource for Box<dyn FrameSource> {
    fn next_frame(&mut self) -> Result<Frame> {
        (**self).next_frame()
    }
}

/// How frame boundaries are recognised.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FramingMode {
    /// Detect a multipart delimiter in the first bytes, else use markers.
    #[default]
    Auto,
    /// `multipart/x-mixed-replace` parts separated by this boundary token.
    Multipart(String),
    /// Concatenated JPEG images, delimited by SOI/EOI markers only.
    Markers,
}

/// Scanner configuration.
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub mode: FramingMode,
    /// Largest frame (and lookahead window) the scanner will buffer.
    pub max_frame_size: usize,
    /// Bytes requested from the reader per fill.
    pub read_chunk: usize,
    /// Keep the wire bytes of each part on the frame ([`Frame::raw`]).
    pub retain_raw: bool,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            mode: FramingMode::Auto,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            read_chunk: DEFAULT_READ_CHUNK,
            retain_raw: false,
        }
    }
}

impl ScannerConfig {
    pub fn with_boundary(mut self, token: &str) -> Self {
        self.mode = FramingMode::Multipart(token.to_string());
        self
    }
}

#[derive(Debug)]
enum Framing {
    Undetected,
    Multipart { delimiter: Bytes },
    Markers,
}

impl Framing {
    fn from_mode(mode: &FramingMode) -> Self {
        match mode {
            FramingMode::Auto => Framing::Undetected,
            FramingMode::Multipart(token) if token.is_empty() => {
                tracing::warn!("empty boundary token, falling back to marker framing");
                Framing::Markers
            }
            FramingMode::Multipart(token) => Framing::Multipart {
                delimiter: Bytes::from(multipart::delimiter_for(token)),
            },
            FramingMode::Markers => Framing::Markers,
        }
    }
}

/// Extracts frames from a byte stream.
///
/// Owns its reader, buffer and the boundary token of its connection; a
/// scanner is never shared between threads.
pub struct FrameScanner<R> {
    reader: R,
    buffer: BytesMut,
    framing: Framing,
    config: ScannerConfig,
    next_sequence: u64,
    eof: bool,
}

impl<R: Read> FrameScanner<R> {
    pub fn new(reader: R) -> Self {
        Self::with_config(reader, ScannerConfig::default())
    }

    pub fn with_config(reader: R, config: ScannerConfig) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(config.read_chunk * 4),
            framing: Framing::from_mode(&config.mode),
            config,
            next_sequence: FIRST_SEQUENCE,
            eof: false,
        }
    }

    /// Number the next frame `sequence` instead of [`FIRST_SEQUENCE`].
    pub fn with_first_sequence(mut self, sequence: u64) -> Self {
        self.next_sequence = sequence;
        self
    }

    /// Sequence number the next frame will carry.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Delimiter line in use, once multipart framing is known.
    pub fn boundary(&self) -> Option<String> {
        match &self.framing {
            Framing::Multipart { delimiter } => {
                Some(String::from_utf8_lossy(delimiter).into_owned())
            }
            _ => None,
        }
    }

    /// Block until the next complete frame is available.
    ///
    /// Fails with [`MjpegError::EndOfStream`] once the reader is exhausted;
    /// a trailing partial frame is discarded, never returned. A frame
    /// rejected with a recoverable error still uses up its sequence number;
    /// bytes discarded while looking for a boundary do not.
    pub fn next_frame(&mut self) -> Result<Frame> {
        if matches!(self.framing, Framing::Undetected) {
            self.detect_framing()?;
        }

        let delimiter = match &self.framing {
            Framing::Multipart { delimiter } => Some(delimiter.clone()),
            _ => None,
        };
        let scanned = match delimiter {
            Some(delimiter) => self.next_part(&delimiter),
            None => self.next_marked(),
        };
        let (payload, raw) = match scanned {
            Ok(scanned) => scanned,
            Err(e) => {
                // junk skipped while hunting for a boundary is not a frame
                let aligning = matches!(
                    e,
                    MjpegError::Parse {
                        kind: ParseErrorKind::BoundaryNotFound
                    }
                );
                if e.is_recoverable() && !aligning {
                    self.next_sequence += 1;
                }
                return Err(e);
            }
        };

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        tracing::trace!(sequence, len = payload.len(), "frame scanned");

        let frame = Frame::new(sequence, payload);
        Ok(match raw {
            Some(raw) if self.config.retain_raw => frame.with_raw(raw),
            _ => frame,
        })
    }

    /// Read one chunk from the source. Returns 0 at end of stream.
    fn fill(&mut self) -> Result<usize> {
        if self.eof {
            return Ok(0);
        }
        let start = self.buffer.len();
        self.buffer.resize(start + self.config.read_chunk.max(1), 0);
        loop {
            match self.reader.read(&mut self.buffer[start..]) {
                Ok(n) => {
                    self.buffer.truncate(start + n);
                    if n == 0 {
                        self.eof = true;
                    }
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.buffer.truncate(start);
                    return Err(e.into());
                }
            }
        }
    }

    fn end_of_stream(&mut self) -> MjpegError {
        if !self.buffer.is_empty() {
            tracing::debug!(discarded = self.buffer.len(), "dropping trailing partial data");
            self.buffer.clear();
        }
        MjpegError::EndOfStream
    }

    fn detect_framing(&mut self) -> Result<()> {
        loop {
            if let Some(token) = multipart::sniff_boundary(&self.buffer) {
                tracing::debug!(boundary = %token, "detected multipart framing");
                self.framing = Framing::from_mode(&FramingMode::Multipart(token));
                return Ok(());
            }
            if let Some(start) = find(&self.buffer, &SOI) {
                let image = &self.buffer[start..];
                if let Some(end) = JpegWalker::new().scan(image) {
                    if self.eof || image.len() >= end + SNIFF_TAIL {
                        tracing::debug!("no multipart delimiter, using marker framing");
                        self.framing = Framing::Markers;
                        return Ok(());
                    }
                }
            }
            if self.buffer.len() > self.config.max_frame_size {
                tracing::debug!("no framing detected within lookahead, using marker framing");
                self.framing = Framing::Markers;
                return Ok(());
            }
            if self.fill()? == 0 {
                if self.buffer.is_empty() {
                    return Err(MjpegError::EndOfStream);
                }
                self.framing = Framing::Markers;
                return Ok(());
            }
        }
    }

    /// Multipart framing: delimiter, headers, body.
    fn next_part(&mut self, delimiter: &[u8]) -> Result<(Bytes, Option<Bytes>)> {
        let overlap = delimiter.len() - 1;

        let head = loop {
            self.seek_delimiter(delimiter)?;

            // "--token--" closes the multipart body; skip past it.
            while self.buffer.len() < delimiter.len() + 2 {
                if self.fill()? == 0 {
                    return Err(self.end_of_stream());
                }
            }
            if self.buffer[delimiter.len()..].starts_with(b"--") {
                self.buffer.advance(delimiter.len() + 2);
                continue;
            }

            match multipart::scan_part_head(&self.buffer, delimiter.len()) {
                Ok(Some(head)) => break head,
                Ok(None) => {
                    if self.fill()? == 0 {
                        return Err(self.end_of_stream());
                    }
                    // seek_delimiter will match at offset 0 again
                }
                Err(e) => {
                    self.buffer.advance(delimiter.len());
                    return Err(e);
                }
            }
        };

        let body_start = head.body_start;
        let content_length = match head.content_length() {
            Ok(len) => len,
            Err(e) => {
                self.buffer.advance(body_start);
                return Err(e);
            }
        };

        if let Some(len) = content_length {
            if len > self.config.max_frame_size {
                self.buffer.advance(body_start);
                return Err(MjpegError::CapacityExceeded {
                    limit: self.config.max_frame_size,
                    needed: len,
                });
            }
            while self.buffer.len() < body_start + len {
                if self.fill()? == 0 {
                    return Err(self.end_of_stream());
                }
            }
            let part = self.buffer.split_to(body_start + len).freeze();
            let payload = part.slice(body_start..);
            if !payload.starts_with(&SOI) {
                return Err(MjpegError::parse(ParseErrorKind::MissingStartOfImage));
            }
            return Ok((payload, Some(part)));
        }

        // No declared length: the body runs to the next delimiter.
        let mut from = body_start;
        let body_end = loop {
            if let Some(pos) = find(&self.buffer[from..], delimiter) {
                break from + pos;
            }
            if self.buffer.len() - body_start > self.config.max_frame_size {
                let needed = self.buffer.len() - body_start;
                let drop = self.buffer.len() - overlap;
                self.buffer.advance(drop);
                return Err(MjpegError::CapacityExceeded {
                    limit: self.config.max_frame_size,
                    needed,
                });
            }
            from = self.buffer.len().saturating_sub(overlap).max(body_start);
            if self.fill()? == 0 {
                // last part of a finite stream
                break self.buffer.len();
            }
        };

        let part = self.buffer.split_to(body_end).freeze();
        let body = &part[body_start..];
        let lead = body
            .iter()
            .take_while(|b| b.is_ascii_whitespace())
            .count();
        if !body[lead..].starts_with(&SOI) {
            if self.eof && self.buffer.is_empty() {
                return Err(MjpegError::EndOfStream);
            }
            return Err(MjpegError::parse(ParseErrorKind::MissingStartOfImage));
        }
        match rfind(body, &EOI) {
            Some(eoi) if eoi >= lead => {
                let payload = part.slice(body_start + lead..body_start + eoi + 2);
                Ok((payload, Some(part)))
            }
            _ if self.eof && self.buffer.is_empty() => Err(MjpegError::EndOfStream),
            _ => Err(MjpegError::parse(ParseErrorKind::MissingEndOfImage)),
        }
    }

    /// Discard bytes until the buffer starts with `delimiter`.
    fn seek_delimiter(&mut self, delimiter: &[u8]) -> Result<()> {
        let overlap = delimiter.len() - 1;
        let mut from = 0;
        loop {
            if let Some(pos) = find(&self.buffer[from..], delimiter) {
                let skipped = from + pos;
                if skipped > 0 {
                    tracing::trace!(skipped, "skipped bytes before boundary");
                }
                self.buffer.advance(skipped);
                return Ok(());
            }
            if self.buffer.len() > self.config.max_frame_size {
                let drop = self.buffer.len() - overlap;
                self.buffer.advance(drop);
                return Err(MjpegError::parse(ParseErrorKind::BoundaryNotFound));
            }
            from = self.buffer.len().saturating_sub(overlap);
            if self.fill()? == 0 {
                return Err(self.end_of_stream());
            }
        }
    }

    /// Marker framing: SOI through the matching EOI.
    fn next_marked(&mut self) -> Result<(Bytes, Option<Bytes>)> {
        loop {
            if let Some(start) = find(&self.buffer, &SOI) {
                self.buffer.advance(start);
                break;
            }
            // keep a trailing 0xFF, it may be the first half of SOI
            let keep = usize::from(self.buffer.last() == Some(&0xFF));
            let drop = self.buffer.len() - keep;
            self.buffer.advance(drop);
            if self.fill()? == 0 {
                return Err(self.end_of_stream());
            }
        }

        let mut walker = JpegWalker::new();
        loop {
            if let Some(end) = walker.scan(&self.buffer) {
                let image = self.buffer.split_to(end).freeze();
                return Ok((image.clone(), Some(image)));
            }
            if self.buffer.len() > self.config.max_frame_size {
                let needed = self.buffer.len();
                self.buffer.advance(SOI.len());
                return Err(MjpegError::CapacityExceeded {
                    limit: self.config.max_frame_size,
                    needed,
                });
            }
            if self.fill()? == 0 {
                return Err(self.end_of_stream());
            }
        }
    }
}

impl<R: Read + Send> FrameSource for FrameScanner<R> {
    fn next_frame(&mut self) -> Result<Frame> {
        FrameScanner::next_frame(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn jpeg(fill: u8, len: usize) -> Vec<u8> {
        let mut image = vec![0xFF, 0xD8, 0xFF, 0xDA, 0x00, 0x02];
        image.extend(std::iter::repeat_n(fill, len));
        image.extend_from_slice(&[0xFF, 0xD9]);
        image
    }

    fn part(boundary: &str, image: &[u8], with_length: bool) -> Vec<u8> {
        let mut out = format!("{boundary}\r\nContent-Type: image/jpeg\r\n").into_bytes();
        if with_length {
            out.extend_from_slice(format!("Content-Length: {}\r\n", image.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(image);
        out.extend_from_slice(b"\r\n");
        out
    }

    fn scanner(data: Vec<u8>, mode: FramingMode) -> FrameScanner<Cursor<Vec<u8>>> {
        let config = ScannerConfig {
            mode,
            read_chunk: 7,
            ..Default::default()
        };
        FrameScanner::with_config(Cursor::new(data), config)
    }

    fn collect<R: Read>(scanner: &mut FrameScanner<R>) -> Vec<Frame> {
        let mut frames = Vec::new();
        loop {
            match scanner.next_frame() {
                Ok(frame) => frames.push(frame),
                Err(MjpegError::EndOfStream) => return frames,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
    }

    #[test]
    fn multipart_with_content_length() {
        let images = [jpeg(1, 20), jpeg(2, 30), jpeg(3, 40)];
        let data: Vec<u8> = images
            .iter()
            .flat_map(|i| part("--myboundary", i, true))
            .collect();
        let mut s = scanner(data, FramingMode::Multipart("--myboundary".into()));
        let frames = collect(&mut s);
        assert_eq!(frames.len(), 3);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.sequence(), i as u64 + 1);
            assert_eq!(frame.payload().as_ref(), images[i].as_slice());
            assert_eq!(frame.len(), images[i].len());
        }
    }

    #[test]
    fn multipart_without_content_length() {
        let images = [jpeg(4, 12), jpeg(5, 50)];
        let data: Vec<u8> = images
            .iter()
            .flat_map(|i| part("--frame", i, false))
            .collect();
        let mut s = scanner(data, FramingMode::Multipart("frame".into()));
        let frames = collect(&mut s);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].payload().as_ref(), images[1].as_slice());
    }

    #[test]
    fn recovers_from_mid_frame_start() {
        let first = part("--b", &jpeg(1, 64), true);
        let mut data = first[30..].to_vec();
        data.extend(part("--b", &jpeg(2, 16), true));
        let mut s = scanner(data, FramingMode::Multipart("--b".into()));
        let frame = s.next_frame().unwrap();
        assert_eq!(frame.sequence(), 1);
        assert_eq!(frame.payload().as_ref(), jpeg(2, 16).as_slice());
        assert!(matches!(s.next_frame(), Err(MjpegError::EndOfStream)));
    }

    #[test]
    fn markers_recover_from_mid_frame_start() {
        let mut data = jpeg(7, 40)[10..].to_vec();
        data.extend(jpeg(8, 5));
        data.extend(jpeg(9, 5));
        let mut s = scanner(data, FramingMode::Markers);
        let frames = collect(&mut s);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].payload().as_ref(), jpeg(8, 5).as_slice());
    }

    #[test]
    fn auto_detects_multipart() {
        let mut data = b"\x00\x01garbage".to_vec();
        data.extend(part("--myboundary", &jpeg(1, 10), true));
        data.extend(part("--myboundary", &jpeg(2, 10), true));
        let mut s = scanner(data, FramingMode::Auto);
        assert_eq!(collect(&mut s).len(), 2);
        assert_eq!(s.boundary().as_deref(), Some("--myboundary"));
    }

    #[test]
    fn auto_falls_back_to_markers() {
        let data: Vec<u8> = (0..3).flat_map(|i| jpeg(i, 300)).collect();
        let mut s = scanner(data, FramingMode::Auto);
        assert_eq!(collect(&mut s).len(), 3);
        assert_eq!(s.boundary(), None);
    }

    #[test]
    fn oversized_content_length_is_recoverable() {
        let mut data = b"--b\r\nContent-Length: 5000\r\n\r\n".to_vec();
        data.extend(jpeg(1, 10));
        data.extend_from_slice(b"\r\n");
        data.extend(part("--b", &jpeg(2, 10), true));
        let config = ScannerConfig {
            mode: FramingMode::Multipart("--b".into()),
            max_frame_size: 1000,
            ..Default::default()
        };
        let mut s = FrameScanner::with_config(Cursor::new(data), config);
        let err = s.next_frame().unwrap_err();
        assert!(matches!(
            err,
            MjpegError::CapacityExceeded {
                limit: 1000,
                needed: 5000
            }
        ));
        assert!(err.is_recoverable());
        let frame = s.next_frame().unwrap();
        assert_eq!(frame.payload().as_ref(), jpeg(2, 10).as_slice());
        assert_eq!(frame.sequence(), 2);
    }

    #[test]
    fn long_junk_before_boundary_uses_no_sequence() {
        let mut data = vec![b'x'; 300];
        data.extend(part("--b", &jpeg(1, 10), true));
        let config = ScannerConfig {
            mode: FramingMode::Multipart("--b".into()),
            max_frame_size: 100,
            read_chunk: 7,
            ..Default::default()
        };
        let mut s = FrameScanner::with_config(Cursor::new(data), config);
        let mut aligning_errors = 0;
        let frame = loop {
            match s.next_frame() {
                Ok(frame) => break frame,
                Err(MjpegError::Parse {
                    kind: ParseErrorKind::BoundaryNotFound,
                }) => aligning_errors += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        };
        assert!(aligning_errors > 0);
        assert_eq!(frame.sequence(), 1);
        assert_eq!(frame.payload().as_ref(), jpeg(1, 10).as_slice());
    }

    #[test]
    fn marker_frame_too_large() {
        let mut data = jpeg(1, 500);
        data.extend(jpeg(2, 10));
        let config = ScannerConfig {
            mode: FramingMode::Markers,
            max_frame_size: 100,
            read_chunk: 64,
            ..Default::default()
        };
        let mut s = FrameScanner::with_config(Cursor::new(data), config);
        assert!(matches!(
            s.next_frame(),
            Err(MjpegError::CapacityExceeded { limit: 100, .. })
        ));
        let frame = s.next_frame().unwrap();
        assert_eq!(frame.payload().as_ref(), jpeg(2, 10).as_slice());
    }

    #[test]
    fn body_without_soi_is_parse_error() {
        let mut data = b"--b\r\nContent-Length: 4\r\n\r\nabcd\r\n".to_vec();
        data.extend(part("--b", &jpeg(3, 3), true));
        let mut s = scanner(data, FramingMode::Multipart("--b".into()));
        assert!(matches!(
            s.next_frame(),
            Err(MjpegError::Parse {
                kind: ParseErrorKind::MissingStartOfImage
            })
        ));
        assert_eq!(s.next_frame().unwrap().sequence(), 2);
    }

    #[test]
    fn truncated_final_frame_is_not_emitted() {
        let mut data = part("--b", &jpeg(1, 10), true);
        let second = part("--b", &jpeg(2, 50), true);
        data.extend_from_slice(&second[..second.len() - 20]);
        let mut s = scanner(data, FramingMode::Multipart("--b".into()));
        assert_eq!(collect(&mut s).len(), 1);
    }

    #[test]
    fn closing_delimiter_is_skipped() {
        let mut data = part("--b", &jpeg(1, 10), true);
        data.extend_from_slice(b"--b--\r\n");
        let mut s = scanner(data, FramingMode::Multipart("b".into()));
        assert_eq!(collect(&mut s).len(), 1);
    }

    #[test]
    fn raw_bytes_retained_on_request() {
        let wire = part("--b", &jpeg(1, 10), true);
        let config = ScannerConfig {
            mode: FramingMode::Multipart("--b".into()),
            retain_raw: true,
            ..Default::default()
        };
        let mut s = FrameScanner::with_config(Cursor::new(wire.clone()), config);
        let frame = s.next_frame().unwrap();
        let raw = frame.raw().expect("raw bytes retained");
        assert!(raw.starts_with(b"--b\r\nContent-Type: image/jpeg"));
        assert!(raw.ends_with(&jpeg(1, 10)));
    }

    #[test]
    fn first_sequence_override() {
        let data = part("--b", &jpeg(1, 10), true);
        let mut s = scanner(data, FramingMode::Multipart("--b".into())).with_first_sequence(42);
        assert_eq!(s.next_frame().unwrap().sequence(), 42);
        assert_eq!(s.next_sequence(), 43);
    }

    #[test]
    fn empty_source_is_end_of_stream() {
        let mut s = scanner(Vec::new(), FramingMode::Auto);
        assert!(matches!(s.next_frame(), Err(MjpegError::EndOfStream)));
    }
}
