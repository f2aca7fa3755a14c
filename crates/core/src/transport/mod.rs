//! Network transport for the re-stream server.
//!
//! - **TCP** ([`tcp`]): a non-blocking accept loop and one thread per
//!   client. Each client thread reads a single HTTP request head and then
//!   writes multipart parts until the client goes away, the source ends or
//!   the server stops.

pub mod tcp;
