//! MJPEG input over HTTP.
//!
//! [`connect`] issues the GET, checks the status and reads the boundary from
//! the response `Content-Type`. The boundary belongs to that connection
//! only and is handed to its scanner by [`MjpegConnection::into_scanner`].

use std::io::Read;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::{MjpegError, Result};
use crate::protocol::multipart;
use crate::scanner::{FrameScanner, FramingMode, ScannerConfig};

/// Body reader of an established stream.
pub type StreamReader = Box<dyn Read + Send + Sync + 'static>;

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub connect_timeout: Duration,
    /// Bounds every blocking read, and with it how long a worker takes to
    /// notice `stop` on a stalled camera. `None` waits forever.
    pub read_timeout: Option<Duration>,
    /// Username and password for HTTP basic authentication.
    pub credentials: Option<(String, String)>,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Some(Duration::from_secs(10)),
            credentials: None,
            user_agent: concat!("mjpeg-rs/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// An open MJPEG response, ready to be scanned.
pub struct MjpegConnection {
    /// `Content-Type` of the response, empty if absent.
    pub content_type: String,
    /// Boundary announced in `Content-Type`, verbatim.
    pub boundary: Option<String>,
    reader: StreamReader,
}

impl MjpegConnection {
    pub fn from_reader(content_type: &str, reader: StreamReader) -> Self {
        Self {
            content_type: content_type.to_string(),
            boundary: multipart::boundary_from_content_type(content_type),
            reader,
        }
    }

    /// Build a scanner for this stream.
    ///
    /// With [`FramingMode::Auto`] the announced boundary is used when there
    /// is one, and a non-multipart response is scanned for JPEG markers.
    /// Any explicit mode in `config` is kept.
    pub fn into_scanner(self, mut config: ScannerConfig) -> FrameScanner<StreamReader> {
        if config.mode == FramingMode::Auto {
            config.mode = match self.boundary {
                Some(boundary) => FramingMode::Multipart(boundary),
                None if multipart::is_multipart(&self.content_type) => FramingMode::Auto,
                None => FramingMode::Markers,
            };
        }
        FrameScanner::with_config(self.reader, config)
    }

    pub fn into_reader(self) -> StreamReader {
        self.reader
    }
}

/// Open an MJPEG stream.
///
/// Refused connections, timeouts and error statuses (400 and up) all map to
/// [`MjpegError::Connection`]. No retry is attempted.
pub fn connect(url: &str, config: &HttpConfig) -> Result<MjpegConnection> {
    let mut builder = ureq::AgentBuilder::new()
        .timeout_connect(config.connect_timeout)
        .user_agent(&config.user_agent);
    if let Some(timeout) = config.read_timeout {
        builder = builder.timeout_read(timeout);
    }
    let agent = builder.build();

    let mut request = agent.get(url);
    if let Some((user, password)) = &config.credentials {
        request = request.set("Authorization", &basic_auth(user, password));
    }

    let response = request.call().map_err(connection_error)?;
    let content_type = response.header("Content-Type").unwrap_or("").to_string();
    let connection = MjpegConnection::from_reader(&content_type, response.into_reader());

    tracing::info!(
        url,
        content_type = %connection.content_type,
        boundary = ?connection.boundary,
        "stream connected"
    );
    if !multipart::is_multipart(&connection.content_type) {
        tracing::warn!(url, content_type = %connection.content_type, "response is not multipart, scanning for JPEG markers");
    }
    Ok(connection)
}

/// `Authorization` header value for HTTP basic authentication.
pub fn basic_auth(user: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{user}:{password}")))
}

fn connection_error(error: ureq::Error) -> MjpegError {
    match error {
        ureq::Error::Status(code, response) => {
            MjpegError::Connection(format!("HTTP {} {}", code, response.status_text()))
        }
        ureq::Error::Transport(transport) => MjpegError::Connection(transport.to_string()),
    }
}
