use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use crate::broadcast::FrameBroadcaster;
use crate::error::{MjpegError, Result};
use crate::protocol::response::SERVER_AGENT;
use crate::record::DEFAULT_BOUNDARY;
use crate::transport::tcp;

/// Settings shared by every client connection.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Boundary announced in `Content-Type` and written before each part.
    pub boundary: String,
    /// Value of the `Server` response header.
    pub server_name: String,
    /// Frame rate applied when the request names none. `None` sends every
    /// frame.
    pub default_fps: Option<u32>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            boundary: DEFAULT_BOUNDARY.to_string(),
            server_name: SERVER_AGENT.to_string(),
            default_fps: None,
        }
    }
}

/// Serves the frames of a broadcaster as an MJPEG HTTP endpoint.
///
/// Every client gets its own [`FrameQueue`](crate::FrameQueue) registered on
/// the broadcaster and a thread that drains it onto the socket. Whatever
/// feeds the broadcaster (a camera worker, a looping source) is not owned by
/// the server.
pub struct MjpegServer {
    running: Arc<AtomicBool>,
    bind_addr: String,
    local_addr: Option<SocketAddr>,
    broadcaster: Arc<FrameBroadcaster>,
    config: Arc<ServerConfig>,
    clients: Arc<AtomicUsize>,
}

impl MjpegServer {
    pub fn new(bind_addr: &str, broadcaster: Arc<FrameBroadcaster>) -> Self {
        Self::with_config(bind_addr, broadcaster, ServerConfig::default())
    }

    pub fn with_config(
        bind_addr: &str,
        broadcaster: Arc<FrameBroadcaster>,
        config: ServerConfig,
    ) -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            bind_addr: bind_addr.to_string(),
            local_addr: None,
            broadcaster,
            config: Arc::new(config),
            clients: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(MjpegError::AlreadyRunning);
        }

        let listener = TcpListener::bind(&self.bind_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);

        self.running.store(true, Ordering::SeqCst);

        let running = self.running.clone();
        let broadcaster = self.broadcaster.clone();
        let config = self.config.clone();
        let clients = self.clients.clone();

        tracing::info!(addr = %local_addr, boundary = %self.config.boundary, "MJPEG server listening");

        thread::spawn(move || {
            tcp::accept_loop(listener, broadcaster, config, running, clients);
        });

        Ok(())
    }

    /// Stop accepting and close every client connection.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        tracing::info!("server stopping");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Address actually bound, which resolves port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.local_addr.ok_or(MjpegError::NotStarted)
    }

    /// Clients currently receiving the stream.
    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }

    pub fn broadcaster(&self) -> &Arc<FrameBroadcaster> {
        &self.broadcaster
    }

    pub fn config(&self) -> Arc<ServerConfig> {
        self.config.clone()
    }
}

impl Drop for MjpegServer {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
