//! Wire formats: multipart framing and the minimal HTTP/1.1 used to serve it.
//!
//! An MJPEG-over-HTTP exchange is a single GET answered by a response whose
//! body never ends:
//!
//! ```text
//! GET /stream?req_fps=5 HTTP/1.1\r\n
//! \r\n
//!
//! HTTP/1.1 200 OK\r\n
//! Content-Type: multipart/x-mixed-replace; boundary=--myboundary\r\n
//! \r\n
//! --myboundary\r\n
//! Content-Type: image/jpeg\r\n
//! Content-Length: 23412\r\n
//! \r\n
//! <jpeg>\r\n
//! --myboundary\r\n
//! ...
//! ```
//!
//! | Query parameter | Meaning |
//! |-----------------|---------|
//! | `req_fps` | Requested frame rate; wins over `des_fps` |
//! | `des_fps` | Desired frame rate |

pub mod multipart;
pub mod request;
pub mod response;

pub use request::HttpRequest;
pub use response::HttpResponse;
