//! Error types for the MJPEG pipeline.

use std::fmt;

use crate::worker::WorkerState;

/// Errors that can occur anywhere in the frame pipeline.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Scanner**: [`Parse`](Self::Parse) and
///   [`CapacityExceeded`](Self::CapacityExceeded) describe a bad frame and are
///   recoverable; [`EndOfStream`](Self::EndOfStream) means the source is done.
/// - **Transport**: [`Io`](Self::Io) for reads/writes,
///   [`Connection`](Self::Connection) for HTTP stream acquisition.
/// - **Lifecycle**: [`InvalidTransition`](Self::InvalidTransition),
///   [`AlreadyRunning`](Self::AlreadyRunning), [`NotStarted`](Self::NotStarted).
/// - **Delivery**: [`QueueClosed`](Self::QueueClosed),
///   [`Listener`](Self::Listener).
#[derive(Debug, thiserror::Error)]
pub enum MjpegError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The byte source is permanently exhausted.
    #[error("end of stream")]
    EndOfStream,

    /// Malformed or incomplete framing data.
    #[error("MJPEG parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// A frame did not complete within the configured maximum size.
    #[error("frame exceeds capacity: needed {needed} bytes, limit is {limit}")]
    CapacityExceeded { limit: usize, needed: usize },

    /// HTTP connection could not be established (refused, timeout, bad status).
    #[error("connection error: {0}")]
    Connection(String),

    /// A worker lifecycle call was made from a state that does not allow it.
    #[error("cannot {action} a worker in state {from:?}")]
    InvalidTransition {
        from: WorkerState,
        action: &'static str,
    },

    /// [`FrameQueue::close`](crate::FrameQueue::close) has been called.
    #[error("frame queue closed")]
    QueueClosed,

    /// A listener reported a failure while handling a frame.
    #[error("listener failed: {0}")]
    Listener(String),

    /// [`MjpegServer::start`](crate::MjpegServer::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,

    /// [`MjpegServer::start`](crate::MjpegServer::start) has not been called yet.
    #[error("server not started")]
    NotStarted,
}

impl MjpegError {
    pub(crate) fn parse(kind: ParseErrorKind) -> Self {
        MjpegError::Parse { kind }
    }

    /// Whether the scanner can continue with the next frame after this error.
    ///
    /// Capacity overruns are treated like any other framing error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MjpegError::Parse { .. } | MjpegError::CapacityExceeded { .. }
        )
    }
}

/// Specific kind of framing failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// No boundary delimiter was found within the lookahead window.
    BoundaryNotFound,
    /// The part header block grew past the header limit without a blank line.
    HeaderTooLarge,
    /// A part header line did not contain a colon separator.
    InvalidHeader(String),
    /// `Content-Length` was present but not a non-negative integer.
    InvalidContentLength(String),
    /// The part body does not begin with a JPEG start-of-image marker.
    MissingStartOfImage,
    /// No JPEG end-of-image marker before the next boundary.
    MissingEndOfImage,
    /// An HTTP request arrived with no request line.
    EmptyRequest,
    /// The HTTP request line is not `METHOD target VERSION`.
    InvalidRequestLine,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BoundaryNotFound => write!(f, "boundary not found within lookahead window"),
            Self::HeaderTooLarge => write!(f, "part header too large"),
            Self::InvalidHeader(line) => write!(f, "invalid part header: {line:?}"),
            Self::InvalidContentLength(value) => write!(f, "invalid content-length: {value:?}"),
            Self::MissingStartOfImage => write!(f, "part body missing JPEG start-of-image"),
            Self::MissingEndOfImage => write!(f, "part body missing JPEG end-of-image"),
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
        }
    }
}

/// Convenience alias for `Result<T, MjpegError>`.
pub type Result<T> = std::result::Result<T, MjpegError>;
