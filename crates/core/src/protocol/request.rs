use crate::error::{MjpegError, ParseErrorKind};

/// A parsed HTTP request head (RFC 9112 §3).
///
/// ```text
/// GET /stream?req_fps=5 HTTP/1.1\r\n
/// Host: camera.local\r\n
/// \r\n
/// ```
///
/// Only the head is parsed; stream requests carry no body. Header lookup is
/// case-insensitive.
#[derive(Debug)]
pub struct HttpRequest {
    pub method: String,
    /// Request target as sent, query string included.
    pub target: String,
    pub version: String,
    /// Headers as ordered (name, value) pairs, names stored as received.
    pub headers: Vec<(String, String)>,
}

impl HttpRequest {
    /// Parse a request head: request line, headers, blank line.
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let mut lines = raw.lines();

        let request_line = lines
            .next()
            .filter(|line| !line.trim().is_empty())
            .ok_or(MjpegError::parse(ParseErrorKind::EmptyRequest))?;

        let parts: Vec<&str> = request_line.split_whitespace().collect();
        if parts.len() != 3 || !parts[2].starts_with("HTTP/") {
            return Err(MjpegError::parse(ParseErrorKind::InvalidRequestLine));
        }

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| MjpegError::parse(ParseErrorKind::InvalidHeader(line.to_string())))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(HttpRequest {
            method: parts[0].to_string(),
            target: parts[1].to_string(),
            version: parts[2].to_string(),
            headers,
        })
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Target without its query string.
    pub fn path(&self) -> &str {
        self.target
            .split_once('?')
            .map_or(self.target.as_str(), |(path, _)| path)
    }

    /// First value of a query parameter. Values are not percent-decoded.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        let (_, query) = self.target.split_once('?')?;
        query
            .split('&')
            .filter_map(|pair| match pair.split_once('=') {
                Some((key, value)) => Some((key, value)),
                None if !pair.is_empty() => Some((pair, "")),
                None => None,
            })
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_stream_request() {
        let raw = "GET /video.mjpg?req_fps=5&des_fps=2 HTTP/1.1\r\nHost: cam\r\n\r\n";
        let req = HttpRequest::parse(raw).unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path(), "/video.mjpg");
        assert_eq!(req.version, "HTTP/1.1");
        assert_eq!(req.query_param("req_fps"), Some("5"));
        assert_eq!(req.query_param("des_fps"), Some("2"));
        assert_eq!(req.query_param("fps"), None);
    }

    #[test]
    fn query_without_values() {
        let req = HttpRequest::parse("GET /s?flag&&x=1 HTTP/1.0\r\n\r\n").unwrap();
        assert_eq!(req.query_param("flag"), Some(""));
        assert_eq!(req.query_param("x"), Some("1"));
    }

    #[test]
    fn no_query() {
        let req = HttpRequest::parse("GET / HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(req.path(), "/");
        assert_eq!(req.query_param("req_fps"), None);
    }

    #[test]
    fn header_lookup_case_insensitive() {
        let req = HttpRequest::parse("GET / HTTP/1.1\r\nuser-agent: vlc\r\n\r\n").unwrap();
        assert_eq!(req.get_header("User-Agent"), Some("vlc"));
    }

    #[test]
    fn rejects_malformed_heads() {
        assert!(matches!(
            HttpRequest::parse(""),
            Err(MjpegError::Parse { kind: ParseErrorKind::EmptyRequest })
        ));
        assert!(matches!(
            HttpRequest::parse("GET /\r\n\r\n"),
            Err(MjpegError::Parse { kind: ParseErrorKind::InvalidRequestLine })
        ));
        assert!(matches!(
            HttpRequest::parse("OPTIONS rtsp://cam/ RTSP/1.0\r\n\r\n"),
            Err(MjpegError::Parse { kind: ParseErrorKind::InvalidRequestLine })
        ));
        assert!(HttpRequest::parse("GET / HTTP/1.1\r\nbroken\r\n\r\n").is_err());
    }
}
