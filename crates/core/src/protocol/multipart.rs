//! `multipart/x-mixed-replace` framing (RFC 2046 §5.1, as used by IP cameras).
//!
//! ```text
//! --myboundary\r\n
//! Content-Type: image/jpeg\r\n
//! Content-Length: 23412\r\n
//! \r\n
//! <23412 bytes of JPEG>\r\n
//! --myboundary\r\n
//! ...
//! ```
//!
//! Axis cameras announce `boundary=--myboundary` and then write
//! `--myboundary` lines, i.e. the leading dashes are already part of the
//! token. [`delimiter_for`] accepts both conventions.

use crate::error::{MjpegError, ParseErrorKind, Result};
use crate::frame::{Frame, SOI};

/// Media type announced by MJPEG servers.
pub const MULTIPART_MIXED_REPLACE: &str = "multipart/x-mixed-replace";

/// Upper bound on the size of one part's delimiter line plus headers.
pub const MAX_HEAD_BYTES: usize = 4 * 1024;

/// Extract the `boundary` parameter from a `Content-Type` header value.
///
/// The parameter name is matched case-insensitively, surrounding quotes are
/// removed and the value is otherwise returned verbatim.
///
/// `multipart/x-mixed-replace; boundary=--myboundary` → `--myboundary`
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.split_once('='))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| value.trim().trim_matches('"').to_string())
        .filter(|value| !value.is_empty())
}

/// Whether a `Content-Type` value announces a multipart stream.
pub fn is_multipart(content_type: &str) -> bool {
    content_type
        .trim_start()
        .to_ascii_lowercase()
        .starts_with("multipart/")
}

/// Bytes that open every part for the given boundary token.
///
/// Tokens that already carry the `--` prefix are used as-is; otherwise the
/// RFC 2046 `--` prefix is prepended.
pub fn delimiter_for(token: &str) -> Vec<u8> {
    if token.starts_with("--") {
        token.as_bytes().to_vec()
    } else {
        format!("--{token}").into_bytes()
    }
}

/// Location of a part body following its delimiter line and headers.
#[derive(Debug, PartialEq, Eq)]
pub struct PartHead {
    /// Offset of the first body byte, relative to the delimiter start.
    pub body_start: usize,
    /// Header lines as (name, value) pairs in arrival order.
    pub headers: Vec<(String, String)>,
}

impl PartHead {
    /// Look up a header value by name (case-insensitive).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Declared body length, if any.
    pub fn content_length(&self) -> Result<Option<usize>> {
        match self.get_header("Content-Length") {
            None => Ok(None),
            Some(value) => value.trim().parse::<usize>().map(Some).map_err(|_| {
                MjpegError::parse(ParseErrorKind::InvalidContentLength(value.to_string()))
            }),
        }
    }
}

/// Parse the head of a part that begins at `buf[0]` with a delimiter of
/// `delimiter_len` bytes.
///
/// Returns `Ok(None)` when more data is needed. Cameras that omit the blank
/// line and start the JPEG right after the headers are tolerated.
pub fn scan_part_head(buf: &[u8], delimiter_len: usize) -> Result<Option<PartHead>> {
    let Some(line_end) = find(&buf[delimiter_len.min(buf.len())..], b"\n") else {
        return head_incomplete(buf);
    };
    let mut pos = delimiter_len + line_end + 1;
    let mut headers = Vec::new();

    loop {
        if pos > MAX_HEAD_BYTES {
            return Err(MjpegError::parse(ParseErrorKind::HeaderTooLarge));
        }
        if buf.len() < pos + SOI.len() {
            return head_incomplete(buf);
        }
        if buf[pos..].starts_with(&SOI) {
            return Ok(Some(PartHead {
                body_start: pos,
                headers,
            }));
        }
        let Some(len) = find(&buf[pos..], b"\n") else {
            return head_incomplete(buf);
        };
        let line = trim_cr(&buf[pos..pos + len]);
        pos += len + 1;
        if line.is_empty() {
            return Ok(Some(PartHead {
                body_start: pos,
                headers,
            }));
        }
        headers.push(parse_header_line(line)?);
    }
}

fn head_incomplete(buf: &[u8]) -> Result<Option<PartHead>> {
    if buf.len() > MAX_HEAD_BYTES {
        Err(MjpegError::parse(ParseErrorKind::HeaderTooLarge))
    } else {
        Ok(None)
    }
}

fn parse_header_line(line: &[u8]) -> Result<(String, String)> {
    let text = String::from_utf8_lossy(line);
    let (name, value) = text
        .split_once(':')
        .ok_or_else(|| MjpegError::parse(ParseErrorKind::InvalidHeader(text.to_string())))?;
    Ok((name.trim().to_string(), value.trim().to_string()))
}

/// Look for a delimiter line that opens a multipart part and return its token.
///
/// A candidate is a line starting with `--` that is followed by a
/// `Content-Type`/`Content-Length` header, or by a blank line and a JPEG.
/// This keeps stray `--` sequences inside JPEG data from being mistaken for
/// a boundary.
pub fn sniff_boundary(buf: &[u8]) -> Option<String> {
    let mut start = 0;
    while start < buf.len() {
        let line_len = find(&buf[start..], b"\n")?;
        let line = trim_cr(&buf[start..start + line_len]);
        let next = start + line_len + 1;
        if is_delimiter_candidate(line) && opens_part(&buf[next..]) {
            return Some(String::from_utf8_lossy(line).into_owned());
        }
        start = next;
    }
    None
}

fn is_delimiter_candidate(line: &[u8]) -> bool {
    (3..=72).contains(&line.len())
        && line.starts_with(b"--")
        && line.iter().all(|b| b.is_ascii_graphic())
}

fn opens_part(rest: &[u8]) -> bool {
    let Some(len) = find(rest, b"\n") else {
        return false;
    };
    let line = trim_cr(&rest[..len]);
    if line.is_empty() {
        return rest[len + 1..].starts_with(&SOI);
    }
    let lower = line.to_ascii_lowercase();
    lower.starts_with(b"content-type:") || lower.starts_with(b"content-length:")
}

/// Serialize one frame as a multipart part, delimiter first.
pub fn write_part(delimiter: &[u8], frame: &Frame) -> Vec<u8> {
    let head = format!(
        "\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        frame.len()
    );
    let mut part = Vec::with_capacity(delimiter.len() + head.len() + frame.len() + 2);
    part.extend_from_slice(delimiter);
    part.extend_from_slice(head.as_bytes());
    part.extend_from_slice(frame.payload());
    part.extend_from_slice(b"\r\n");
    part
}

/// Position of the first occurrence of `needle` in `haystack`.
pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Position of the last occurrence of `needle` in `haystack`.
pub fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .rposition(|window| window == needle)
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}
