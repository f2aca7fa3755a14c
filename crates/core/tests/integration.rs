//! Integration test: re-stream server over real sockets.
//!
//! Starts the server on an ephemeral port, connects with a TCP client (and
//! with the HTTP input side of the crate), publishes frames and checks what
//! arrives on the wire.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use mjpeg::{
    Frame, FrameBroadcaster, FrameScanner, HttpConfig, MjpegError, MjpegServer, ScannerConfig,
    ServerConfig,
};

/// Send a request and read the response head (through the blank line).
fn http_request(stream: &TcpStream, request: &str) -> std::io::Result<(String, BufReader<TcpStream>)> {
    let mut writer = stream.try_clone()?;
    writer.write_all(request.as_bytes())?;
    writer.flush()?;

    let mut reader = BufReader::new(stream.try_clone()?);
    let mut head = String::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        head.push_str(&line);
        if line == "\r\n" || line == "\n" {
            break;
        }
    }
    Ok((head, reader))
}

fn connect(server: &MjpegServer) -> TcpStream {
    let addr = server.local_addr().expect("server address");
    let stream = TcpStream::connect_timeout(&addr, Duration::from_secs(2)).expect("connect to server");
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream.set_write_timeout(Some(Duration::from_secs(2))).unwrap();
    stream
}

fn jpeg(tag: u8) -> Bytes {
    Bytes::from(vec![0xFF, 0xD8, 0xFF, 0xDA, 0x00, 0x03, 0x01, tag, 0x00, 0xFF, 0xD9])
}

fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(10));
    }
}

fn started_server(config: ServerConfig) -> (MjpegServer, Arc<FrameBroadcaster>) {
    let broadcaster = Arc::new(FrameBroadcaster::new());
    let mut server = MjpegServer::with_config("127.0.0.1:0", broadcaster.clone(), config);
    server.start().expect("server start");
    (server, broadcaster)
}

#[test]
fn streams_published_frames_as_multipart() {
    let (mut server, broadcaster) = started_server(ServerConfig::default());
    let stream = connect(&server);

    let (head, reader) = http_request(&stream, "GET /video.mjpg HTTP/1.1\r\nHost: test\r\n\r\n")
        .expect("response head");
    assert!(
        head.starts_with("HTTP/1.1 200 OK"),
        "expected 200 OK, got: {}",
        head.lines().next().unwrap_or("")
    );
    assert!(head.contains("Content-Type: multipart/x-mixed-replace; boundary=--myboundary\r\n"));
    assert!(head.contains("Connection: close\r\n"));
    assert!(head.contains("Server: mjpeg-rs/0.1\r\n"));

    wait_for(|| server.client_count() == 1);
    for tag in 1..=3 {
        broadcaster.publish(&Frame::new(tag as u64, jpeg(tag))).unwrap();
    }

    let config = ScannerConfig::default().with_boundary("--myboundary");
    let mut scanner = FrameScanner::with_config(reader, config);
    for tag in 1..=3 {
        let frame = scanner.next_frame().expect("frame from server");
        assert_eq!(frame.payload(), &jpeg(tag));
    }

    server.stop();
    wait_for(|| server.client_count() == 0);
    assert_eq!(broadcaster.listener_count(), 0);
}

#[test]
fn end_of_source_closes_the_stream() {
    let (mut server, broadcaster) = started_server(ServerConfig::default());
    let stream = connect(&server);
    let (_, mut reader) = http_request(&stream, "GET / HTTP/1.1\r\n\r\n").unwrap();

    wait_for(|| server.client_count() == 1);
    broadcaster.publish(&Frame::new(1, jpeg(1))).unwrap();
    broadcaster.publish_end();

    let mut body = Vec::new();
    reader.read_to_end(&mut body).expect("read until close");
    assert!(body.ends_with(b"--myboundary--\r\n"));

    let mut scanner = FrameScanner::new(std::io::Cursor::new(body));
    assert_eq!(scanner.next_frame().unwrap().payload(), &jpeg(1));
    assert!(matches!(scanner.next_frame(), Err(MjpegError::EndOfStream)));
    server.stop();
}

#[test]
fn req_fps_throttles_the_client() {
    let (mut server, broadcaster) = started_server(ServerConfig::default());
    let stream = connect(&server);
    let (head, mut reader) = http_request(&stream, "GET /?des_fps=30&req_fps=1 HTTP/1.1\r\n\r\n").unwrap();
    assert!(head.starts_with("HTTP/1.1 200 OK"));

    wait_for(|| server.client_count() == 1);
    for tag in 1..=5 {
        broadcaster.publish(&Frame::new(tag as u64, jpeg(tag))).unwrap();
    }
    broadcaster.publish_end();

    let mut body = Vec::new();
    reader.read_to_end(&mut body).unwrap();
    let mut scanner = FrameScanner::new(std::io::Cursor::new(body));
    assert_eq!(scanner.next_frame().unwrap().payload(), &jpeg(1));
    assert!(matches!(scanner.next_frame(), Err(MjpegError::EndOfStream)));
    server.stop();
}

#[test]
fn malformed_requests_are_rejected() {
    let (mut server, _broadcaster) = started_server(ServerConfig::default());

    let stream = connect(&server);
    let (head, _) = http_request(&stream, "NONSENSE\r\n\r\n").unwrap();
    assert!(head.starts_with("HTTP/1.1 400 Bad Request"), "got: {head}");

    let stream = connect(&server);
    let (head, _) = http_request(&stream, "PUT / HTTP/1.1\r\n\r\n").unwrap();
    assert!(head.starts_with("HTTP/1.1 405"), "got: {head}");
    assert!(head.contains("Allow: GET, HEAD, POST\r\n"));

    assert_eq!(server.client_count(), 0);
    server.stop();
}

#[test]
fn oversized_request_head_gets_400() {
    let (mut server, _broadcaster) = started_server(ServerConfig::default());
    let stream = connect(&server);

    // a request line with no end, exactly the size of the head limit
    let flood = "A".repeat(8 * 1024);
    let (head, _) = http_request(&stream, &flood).unwrap();
    assert!(head.starts_with("HTTP/1.1 400 Bad Request"), "got: {head}");
    assert_eq!(server.client_count(), 0);
    server.stop();
}

#[test]
fn post_and_unusable_fps_are_streamed() {
    let (mut server, broadcaster) = started_server(ServerConfig::default());

    let post = connect(&server);
    let (head, post_reader) = http_request(&post, "POST /video.mjpg HTTP/1.1\r\nContent-Length: 0\r\n\r\n").unwrap();
    assert!(head.starts_with("HTTP/1.1 200 OK"), "got: {head}");

    let zero = connect(&server);
    let (head, zero_reader) = http_request(&zero, "GET /?req_fps=0 HTTP/1.1\r\n\r\n").unwrap();
    assert!(head.starts_with("HTTP/1.1 200 OK"), "got: {head}");

    wait_for(|| server.client_count() == 2);
    broadcaster.publish(&Frame::new(1, jpeg(1))).unwrap();
    broadcaster.publish(&Frame::new(2, jpeg(2))).unwrap();

    for reader in [post_reader, zero_reader] {
        let mut scanner = FrameScanner::with_config(reader, ScannerConfig::default().with_boundary("--myboundary"));
        assert_eq!(scanner.next_frame().unwrap().payload(), &jpeg(1));
        // no default rate configured, so nothing is throttled
        assert_eq!(scanner.next_frame().unwrap().payload(), &jpeg(2));
    }
    server.stop();
}

#[test]
fn slow_reader_skips_to_newest_frames() {
    const FRAMES: u8 = 48;
    const FILLER: usize = 512 * 1024;

    let (mut server, broadcaster) = started_server(ServerConfig::default());
    let stream = connect(&server);
    stream.set_read_timeout(Some(Duration::from_secs(20))).unwrap();
    let (_, mut reader) = http_request(&stream, "GET / HTTP/1.1\r\n\r\n").unwrap();
    wait_for(|| server.client_count() == 1);

    // publish everything before reading a single byte
    for tag in 1..=FRAMES {
        let mut image = vec![0xFF, 0xD8, 0xFF, 0xDA, 0x00, 0x03, 0x01, tag];
        image.extend(std::iter::repeat_n(tag, FILLER));
        image.extend_from_slice(&[0xFF, 0xD9]);
        broadcaster.publish(&Frame::new(u64::from(tag), Bytes::from(image))).unwrap();
    }
    broadcaster.publish_end();

    let mut body = Vec::new();
    reader.read_to_end(&mut body).expect("read until close");
    let mut scanner = FrameScanner::new(std::io::Cursor::new(body));
    let mut tags = Vec::new();
    while let Ok(frame) = scanner.next_frame() {
        tags.push(frame.payload()[7]);
    }

    assert!(tags.len() < usize::from(FRAMES), "nothing was dropped: {} frames", tags.len());
    assert_eq!(tags.last(), Some(&FRAMES));
    assert!(tags.windows(2).all(|w| w[0] < w[1]));
    server.stop();
}

#[test]
fn http_input_reads_from_server() {
    let config = ServerConfig {
        boundary: "frame".to_string(),
        ..ServerConfig::default()
    };
    let (mut server, broadcaster) = started_server(config);
    let url = format!("http://{}/stream", server.local_addr().unwrap());

    let conn = mjpeg::http::connect(&url, &HttpConfig::default()).expect("connect");
    assert_eq!(conn.boundary.as_deref(), Some("frame"));
    let mut scanner = conn.into_scanner(ScannerConfig::default());

    wait_for(|| server.client_count() == 1);
    broadcaster.publish(&Frame::new(1, jpeg(7))).unwrap();
    broadcaster.publish(&Frame::new(2, jpeg(8))).unwrap();

    let first = scanner.next_frame().expect("first frame");
    let second = scanner.next_frame().expect("second frame");
    assert_eq!(first.sequence(), 1);
    assert_eq!(first.payload(), &jpeg(7));
    assert_eq!(second.payload(), &jpeg(8));
    server.stop();
}

#[test]
fn start_twice_is_rejected() {
    let broadcaster = Arc::new(FrameBroadcaster::new());
    let mut server = MjpegServer::new("127.0.0.1:0", broadcaster);
    assert!(matches!(server.local_addr(), Err(MjpegError::NotStarted)));

    server.start().unwrap();
    assert!(server.is_running());
    assert!(matches!(server.start(), Err(MjpegError::AlreadyRunning)));

    server.stop();
    assert!(!server.is_running());
}
