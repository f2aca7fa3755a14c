/// An HTTP/1.1 response head, optionally with a small text body.
///
/// ```text
/// HTTP/1.1 200 OK\r\n
/// Server: mjpeg-rs/0.1\r\n
/// Connection: close\r\n
/// Content-Type: multipart/x-mixed-replace; boundary=--myboundary\r\n
/// \r\n
/// ```
///
/// Builder style: chain [`add_header`](Self::add_header) and
/// [`with_body`](Self::with_body), then [`serialize`](Self::serialize).
/// Streaming responses carry no body; the multipart parts follow the head.
#[must_use]
pub struct HttpResponse {
    pub status_code: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

/// Default value of the `Server` header.
pub const SERVER_AGENT: &str = "mjpeg-rs/0.1";

impl HttpResponse {
    pub fn new(status_code: u16, status_text: &str) -> Self {
        HttpResponse {
            status_code,
            status_text: status_text.to_string(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(200, "OK")
    }

    pub fn bad_request() -> Self {
        Self::new(400, "Bad Request")
    }

    pub fn method_not_allowed() -> Self {
        Self::new(405, "Method Not Allowed").add_header("Allow", "GET, HEAD, POST")
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: String) -> Self {
        self.body = Some(body);
        self
    }

    /// Serialize to wire format. `Content-Length` is added when a body is set.
    pub fn serialize(&self) -> String {
        let mut response = format!("HTTP/1.1 {} {}\r\n", self.status_code, self.status_text);

        for (name, value) in &self.headers {
            response.push_str(&format!("{}: {}\r\n", name, value));
        }

        if let Some(body) = &self.body {
            response.push_str(&format!("Content-Length: {}\r\n", body.len()));
            response.push_str("\r\n");
            response.push_str(body);
        } else {
            response.push_str("\r\n");
        }
        response
    }
}
