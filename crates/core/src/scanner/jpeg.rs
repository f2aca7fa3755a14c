//! JPEG marker walking (ITU T.81 Annex B).
//!
//! A JPEG file is a sequence of marker segments:
//!
//! ```text
//! FF D8                       SOI
//! FF Ex  len(2) payload       APPn (EXIF thumbnails live here)
//! FF DB  len(2) payload       DQT, DHT, SOF, ...
//! FF DA  len(2) payload       SOS, followed by entropy-coded data
//! ...entropy data...          FF only appears as FF 00 or FF D0..D7
//! FF D9                       EOI
//! ```
//!
//! Walking segment lengths instead of searching for `FF D9` means an
//! embedded thumbnail (a complete JPEG inside APP1) does not end the frame.

/// Resumable search for the end of a JPEG image.
///
/// `scan` can be called repeatedly as the buffer grows; work done on a
/// previous call is not repeated.
#[derive(Debug, Default)]
pub struct JpegWalker {
    pos: usize,
    in_entropy: bool,
}

impl JpegWalker {
    /// Start walking at the SOI marker located at `buf[0]`.
    pub fn new() -> Self {
        Self {
            pos: 2,
            in_entropy: false,
        }
    }

    /// Returns the image length (through EOI) once the buffer holds it.
    ///
    /// Malformed segment structure degrades to a plain search for EOI.
    pub fn scan(&mut self, buf: &[u8]) -> Option<usize> {
        loop {
            if self.in_entropy {
                return self.scan_entropy(buf);
            }
            if buf.len() < self.pos + 2 {
                return None;
            }
            if buf[self.pos] != 0xFF {
                self.in_entropy = true;
                continue;
            }
            match buf[self.pos + 1] {
                0xFF => self.pos += 1,
                0xD9 => return Some(self.pos + 2),
                0x01 | 0xD0..=0xD7 => self.pos += 2,
                0xD8 | 0x00 => self.in_entropy = true,
                marker => {
                    if buf.len() < self.pos + 4 {
                        return None;
                    }
                    let len = u16::from_be_bytes([buf[self.pos + 2], buf[self.pos + 3]]) as usize;
                    if len < 2 {
                        self.in_entropy = true;
                        continue;
                    }
                    self.pos += 2 + len;
                    if marker == 0xDA {
                        self.in_entropy = true;
                    }
                }
            }
        }
    }

    fn scan_entropy(&mut self, buf: &[u8]) -> Option<usize> {
        while self.pos + 1 < buf.len() {
            if buf[self.pos] != 0xFF {
                self.pos += 1;
                continue;
            }
            match buf[self.pos + 1] {
                0xD9 => return Some(self.pos + 2),
                0x00 | 0xD0..=0xD7 | 0xFF => self.pos += 1,
                _ => {
                    // another segment (progressive scans, DHT between scans)
                    self.in_entropy = false;
                    return self.scan(buf);
                }
            }
        }
        None
    }
}
