use bytes::Bytes;

/// JPEG start-of-image marker.
pub const SOI: [u8; 2] = [0xFF, 0xD8];
/// JPEG end-of-image marker.
pub const EOI: [u8; 2] = [0xFF, 0xD9];

/// One JPEG image extracted from an MJPEG stream.
///
/// Frames are immutable and cheap to clone: the payload is reference
/// counted, so every listener on a broadcaster shares the same bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    sequence: u64,
    payload: Bytes,
    raw: Option<Bytes>,
}

impl Frame {
    pub fn new(sequence: u64, payload: Bytes) -> Self {
        Self {
            sequence,
            payload,
            raw: None,
        }
    }

    /// Attach the bytes of the whole part (boundary line, headers, payload)
    /// as they appeared on the wire.
    pub fn with_raw(mut self, raw: Bytes) -> Self {
        self.raw = Some(raw);
        self
    }

    /// Position of this frame in read order.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// JPEG bytes, SOI through EOI.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Wire bytes of the part, if the scanner was configured to retain them.
    pub fn raw(&self) -> Option<&Bytes> {
        self.raw.as_ref()
    }
}
