use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::broadcast::FrameBroadcaster;
use crate::frame::Frame;
use crate::protocol::multipart::{self, MULTIPART_MIXED_REPLACE};
use crate::protocol::{HttpRequest, HttpResponse};
use crate::queue::FrameQueue;
use crate::server::ServerConfig;

/// How long a client may take to send its request head.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// A client that cannot take a part within this time is dropped.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound on a request head.
const MAX_REQUEST_BYTES: usize = 8 * 1024;
/// How often an idle client thread re-checks the running flag.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// A client further behind than this skips to the newest frame.
const MAX_CLIENT_BACKLOG: usize = 8;
/// Accept loop poll interval.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Non-blocking TCP accept loop.
///
/// Checks the `running` flag between accepts with a 50ms poll interval
/// so that [`crate::MjpegServer::stop`] can terminate it promptly.
pub fn accept_loop(
    listener: TcpListener,
    broadcaster: Arc<FrameBroadcaster>,
    config: Arc<ServerConfig>,
    running: Arc<AtomicBool>,
    clients: Arc<AtomicUsize>,
) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let b = broadcaster.clone();
                let c = config.clone();
                let r = running.clone();
                let n = clients.clone();
                thread::spawn(move || {
                    Connection::handle(stream, b, c, r, n);
                });
            }
            Err(e) => accept_failed(&e, &running),
        }
    }
    tracing::debug!("accept loop exited");
}

/// Wait out a failed accept. Real errors (EMFILE and the like) back off
/// for the same interval as an empty backlog.
fn accept_failed(error: &io::Error, running: &AtomicBool) {
    if error.kind() != io::ErrorKind::WouldBlock && running.load(Ordering::SeqCst) {
        tracing::warn!(%error, "TCP accept error");
    }
    thread::sleep(ACCEPT_POLL);
}

/// A single viewer: one request, then an endless multipart response.
struct Connection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    peer_addr: SocketAddr,
}

impl Connection {
    pub fn handle(
        stream: TcpStream,
        broadcaster: Arc<FrameBroadcaster>,
        config: Arc<ServerConfig>,
        running: Arc<AtomicBool>,
        clients: Arc<AtomicUsize>,
    ) {
        let peer_addr = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(_) => return,
        };
        if stream.set_read_timeout(Some(REQUEST_TIMEOUT)).is_err()
            || stream.set_write_timeout(Some(WRITE_TIMEOUT)).is_err()
        {
            return;
        }
        let reader_stream = match stream.try_clone() {
            Ok(s) => s,
            Err(_) => return,
        };

        tracing::info!(%peer_addr, "client connected");

        let mut conn = Connection {
            reader: BufReader::new(reader_stream),
            writer: stream,
            peer_addr,
        };

        let reason = match conn.read_request() {
            Ok(request) => conn.serve(&request, &broadcaster, &config, &running, &clients),
            Err(reason) => reason,
        };

        tracing::info!(%peer_addr, reason, "client disconnected");
    }

    /// Read and parse the request head, answering 400 when it is malformed.
    fn read_request(&mut self) -> Result<HttpRequest, &'static str> {
        let mut request_text = String::new();
        loop {
            let remaining = MAX_REQUEST_BYTES.saturating_sub(request_text.len());
            if remaining == 0 {
                self.respond(HttpResponse::bad_request());
                return Err("request head too large");
            }
            let mut line = String::new();
            match (&mut self.reader).take(remaining as u64).read_line(&mut line) {
                Ok(0) => return Err("connection closed by client"),
                Ok(_) => {
                    request_text.push_str(&line);
                    if line == "\r\n" || line == "\n" {
                        break;
                    }
                }
                Err(_) => return Err("read error"),
            }
        }

        match HttpRequest::parse(&request_text) {
            Ok(request) => {
                tracing::debug!(
                    peer = %self.peer_addr,
                    method = %request.method,
                    target = %request.target,
                    "request"
                );
                Ok(request)
            }
            Err(e) => {
                tracing::warn!(peer = %self.peer_addr, error = %e, "parse error");
                self.respond(HttpResponse::bad_request());
                Err("bad request")
            }
        }
    }

    fn serve(
        &mut self,
        request: &HttpRequest,
        broadcaster: &FrameBroadcaster,
        config: &ServerConfig,
        running: &AtomicBool,
        clients: &AtomicUsize,
    ) -> &'static str {
        // POST is served like GET
        if !matches!(request.method.as_str(), "GET" | "HEAD" | "POST") {
            self.respond(HttpResponse::method_not_allowed());
            return "method not allowed";
        }

        let fps = match requested_fps(request) {
            Ok(fps) => fps.or(config.default_fps),
            Err(value) => {
                tracing::warn!(
                    peer = %self.peer_addr,
                    value,
                    default = ?config.default_fps,
                    "unusable frame rate, using default"
                );
                config.default_fps
            }
        };

        let content_type = format!("{MULTIPART_MIXED_REPLACE}; boundary={}", config.boundary);
        let head = HttpResponse::ok()
            .add_header("Server", &config.server_name)
            .add_header("Connection", "close")
            .add_header("Cache-Control", "no-cache")
            .add_header("Pragma", "no-cache")
            .add_header("Content-Type", &content_type);
        if !self.respond(head) {
            return "write error";
        }
        if request.method == "HEAD" {
            return "head request";
        }

        let queue = Arc::new(FrameQueue::new());
        broadcaster.register(queue.clone());
        clients.fetch_add(1, Ordering::SeqCst);

        let interval = fps.map(|fps| Duration::from_secs(1) / fps);
        let delimiter = multipart::delimiter_for(&config.boundary);
        let (reason, sent) = self.stream(&queue, &delimiter, interval, running);

        broadcaster.unregister(&queue);
        queue.close();
        clients.fetch_sub(1, Ordering::SeqCst);

        tracing::debug!(peer = %self.peer_addr, sent, ?fps, "stream finished");
        reason
    }

    /// Drain the client's queue onto the socket. Returns the reason for
    /// exiting and the number of parts sent.
    fn stream(
        &mut self,
        queue: &FrameQueue,
        delimiter: &[u8],
        interval: Option<Duration>,
        running: &AtomicBool,
    ) -> (&'static str, u64) {
        let mut sent = 0;
        let mut last_sent: Option<Instant> = None;

        while running.load(Ordering::SeqCst) {
            let Some(frame) = next_frame(queue) else {
                if queue.is_closed() {
                    let mut closing = delimiter.to_vec();
                    closing.extend_from_slice(b"--\r\n");
                    let _ = self.writer.write_all(&closing);
                    return ("stream ended", sent);
                }
                continue;
            };

            if let (Some(interval), Some(last)) = (interval, last_sent) {
                if last.elapsed() < interval {
                    continue;
                }
            }

            if self
                .writer
                .write_all(&multipart::write_part(delimiter, &frame))
                .is_err()
            {
                return ("write error", sent);
            }
            last_sent = Some(Instant::now());
            sent += 1;
        }

        ("server shutting down", sent)
    }

    fn respond(&mut self, response: HttpResponse) -> bool {
        tracing::debug!(peer = %self.peer_addr, status = response.status_code, "response");
        self.writer
            .write_all(response.serialize().as_bytes())
            .is_ok()
    }
}

/// Next frame for a client. A client that has fallen more than
/// [`MAX_CLIENT_BACKLOG`] frames behind loses all but the newest one.
fn next_frame(queue: &FrameQueue) -> Option<Frame> {
    if queue.len() > MAX_CLIENT_BACKLOG {
        let dropped = queue.remove_stale(1);
        tracing::debug!(dropped, "slow client, dropped stale frames");
    }
    queue.remove_one_timeout(POLL_INTERVAL)
}

/// Frame rate requested through `req_fps`, else `des_fps`.
fn requested_fps(request: &HttpRequest) -> Result<Option<u32>, String> {
    let Some(value) = request
        .query_param("req_fps")
        .or_else(|| request.query_param("des_fps"))
    else {
        return Ok(None);
    };
    match value.parse::<u32>() {
        Ok(fps) if fps > 0 => Ok(Some(fps)),
        _ => Err(value.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(target: &str) -> HttpRequest {
        HttpRequest::parse(&format!("GET {target} HTTP/1.1\r\n\r\n")).unwrap()
    }

    #[test]
    fn req_fps_wins_over_des_fps() {
        assert_eq!(requested_fps(&request("/?des_fps=2&req_fps=5")), Ok(Some(5)));
        assert_eq!(requested_fps(&request("/?des_fps=2")), Ok(Some(2)));
        assert_eq!(requested_fps(&request("/stream")), Ok(None));
    }

    #[test]
    fn reports_unusable_rates() {
        assert_eq!(requested_fps(&request("/?req_fps=0")), Err("0".to_string()));
        assert_eq!(requested_fps(&request("/?req_fps=fast")), Err("fast".to_string()));
    }

    #[test]
    fn accept_errors_back_off() {
        let running = AtomicBool::new(true);
        for kind in [io::ErrorKind::WouldBlock, io::ErrorKind::Other] {
            let started = Instant::now();
            accept_failed(&io::Error::from(kind), &running);
            assert!(started.elapsed() >= ACCEPT_POLL, "{kind:?} did not back off");
        }
    }

    #[test]
    fn lagging_client_skips_to_newest() {
        let queue = FrameQueue::new();
        for n in 1..=20u64 {
            queue
                .add(Frame::new(n, bytes::Bytes::from(vec![0xFF, 0xD8, 0xFF, 0xD9])))
                .unwrap();
        }
        assert_eq!(next_frame(&queue).map(|f| f.sequence()), Some(20));
        assert!(queue.is_empty());

        for n in 21..=21 + MAX_CLIENT_BACKLOG as u64 - 1 {
            queue
                .add(Frame::new(n, bytes::Bytes::from(vec![0xFF, 0xD8, 0xFF, 0xD9])))
                .unwrap();
        }
        // at the limit nothing is dropped
        assert_eq!(next_frame(&queue).map(|f| f.sequence()), Some(21));
    }
}
