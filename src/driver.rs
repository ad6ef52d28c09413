//! The outbound contract between the routing core and the connection layer.
//!
//! The core never performs socket I/O itself. It asks the embedding event
//! loop to open, close, and write connections through [`Driver`], and the
//! loop feeds readiness back through the entry points on
//! [`Pools`](crate::pools::Pools). Connections are identified by opaque
//! [`ConnId`] tokens minted by the loop.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Opaque connection token minted by the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Resolved endpoint for a listener or backend connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SockInfo {
    Inet(SocketAddr),
    Unix {
        path: PathBuf,
        /// Socket permission bits, if configured.
        perm: Option<u32>,
    },
}

impl fmt::Display for SockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SockInfo::Inet(addr) => write!(f, "{addr}"),
            SockInfo::Unix { path, .. } => write!(f, "{}", path.display()),
        }
    }
}

/// Socket operations the core requests from the connection layer.
///
/// All calls are non-blocking requests: `connect` initiates, `send`
/// enqueues on the connection's outbound side, and completion is
/// reported back through the core's event entry points.
pub trait Driver {
    /// Bind a listening socket and start accepting.
    fn listen(&mut self, info: &SockInfo, backlog: u32) -> io::Result<ConnId>;

    /// Initiate a non-blocking connect to a backend.
    fn connect(&mut self, info: &SockInfo) -> io::Result<ConnId>;

    /// Enqueue bytes on a connection's outbound queue.
    fn send(&mut self, conn: ConnId, data: &[u8]) -> io::Result<()>;

    /// Close a connection (listener, client, or backend).
    fn close(&mut self, conn: ConnId);
}
