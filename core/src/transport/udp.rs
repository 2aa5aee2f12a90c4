use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;

/// Largest payload a single UDP datagram can carry.
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

/// How often a blocked worker re-checks its run flag.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Errors surfaced by transport construction and sends
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("transport is not running")]
    NotRunning,
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
}

/// Blocking UDP socket shared between the caller thread (sends) and the
/// transport worker (receives). The socket closes when the last clone drops.
#[derive(Debug, Clone)]
pub struct UdpEndpoint {
    socket: Arc<UdpSocket>,
}

impl UdpEndpoint {
    /// Bind a datagram socket. Port 0 picks an ephemeral port.
    ///
    /// `poll_interval` becomes the read timeout: it bounds how long a worker
    /// takes to notice its run flag was cleared.
    pub fn bind(addr: SocketAddr, poll_interval: Duration) -> io::Result<Self> {
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        if addr.is_ipv6() {
            // Accept v4-mapped peers on a v6 wildcard bind where the OS allows it
            let _ = socket.set_only_v6(false);
        }
        socket.bind(&addr.into())?;
        socket.set_read_timeout(Some(poll_interval.max(Duration::from_millis(1))))?;

        Ok(UdpEndpoint {
            socket: Arc::new(socket.into()),
        })
    }

    pub fn send(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, target)
    }

    pub fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

pub(crate) fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL.as_millis() as u64
}

pub(crate) fn default_max_datagram_size() -> usize {
    MAX_DATAGRAM_SIZE
}

pub(crate) fn default_event_capacity() -> usize {
    256
}

/// Receive buffer length for a configured datagram size. Datagrams longer
/// than this are truncated by the OS.
pub(crate) fn recv_buffer_len(max_datagram_size: usize) -> usize {
    max_datagram_size.clamp(1, MAX_DATAGRAM_SIZE)
}

/// Error for operations on a transport whose socket was released.
pub(crate) fn released() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport stopped")
}

/// Join a transport worker. A handler that tears down its own transport
/// runs on the worker itself; that loop ends once it returns.
pub(crate) fn join_worker(handle: JoinHandle<()>) {
    if handle.thread().id() == thread::current().id() {
        return;
    }
    if handle.join().is_err() {
        tracing::error!("Transport worker panicked");
    }
}

/// True for the errors a read timeout produces.
pub(crate) fn is_timeout(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
