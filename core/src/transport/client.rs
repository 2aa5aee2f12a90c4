//! Client Transport
//!
//! Talks to one fixed server endpoint: datagrams go out from the caller's
//! thread, inbound datagrams are handed to a [`ClientHandler`] on a
//! background receive thread.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::events::ClientEventSender;
use super::udp::{
    default_event_capacity, default_max_datagram_size, default_poll_interval_ms, is_timeout,
    join_worker, recv_buffer_len, released, TransportError, UdpEndpoint,
};
use crate::packet::{PacketBuffer, PacketError};

/// Receives every datagram that reaches a client. Called on the client's
/// receive thread with a buffer that is reused for the next datagram.
pub trait ClientHandler: Send + 'static {
    fn on_receive(&mut self, packet: &mut PacketBuffer);
}

impl<F> ClientHandler for F
where
    F: FnMut(&mut PacketBuffer) + Send + 'static,
{
    fn on_receive(&mut self, packet: &mut PacketBuffer) {
        self(packet)
    }
}

fn default_send_hello() -> bool {
    true
}

/// Configuration for a ClientTransport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub remote_address: IpAddr,
    pub remote_port: u16,
    /// Local address to bind; defaults to the wildcard of the remote's family
    #[serde(default)]
    pub bind_address: Option<IpAddr>,
    /// Send one empty datagram on start so the server registers this client
    #[serde(default = "default_send_hello")]
    pub send_hello: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Receive buffer size, capped at 65535. Longer datagrams reach the
    /// handler truncated.
    #[serde(default = "default_max_datagram_size")]
    pub max_datagram_size: usize,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl ClientConfig {
    /// `address` must be a literal IPv4 or IPv6 address.
    pub fn new(address: &str, port: u16) -> Result<Self, TransportError> {
        let remote_address = address
            .parse::<IpAddr>()
            .map_err(|_| TransportError::InvalidAddress(address.to_string()))?;
        Ok(ClientConfig {
            remote_address,
            remote_port: port,
            bind_address: None,
            send_hello: default_send_hello(),
            poll_interval_ms: default_poll_interval_ms(),
            max_datagram_size: default_max_datagram_size(),
            event_capacity: default_event_capacity(),
        })
    }

    pub fn from_json(json: &str) -> Result<Self, TransportError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn remote(&self) -> SocketAddr {
        SocketAddr::new(self.remote_address, self.remote_port)
    }

    fn local_bind(&self) -> SocketAddr {
        let ip = self.bind_address.unwrap_or(match self.remote_address {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        });
        SocketAddr::new(ip, 0)
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// UDP client bound to an ephemeral port and aimed at one server.
///
/// The outgoing buffer is never cleared implicitly: a `send` transmits
/// everything written since the last `clear_buffer`.
pub struct ClientTransport {
    /// `None` once disconnected
    socket: Option<UdpEndpoint>,
    server_addr: SocketAddr,
    outgoing: PacketBuffer,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl ClientTransport {
    /// Bind, send the hello datagram (unless disabled) and start receiving.
    pub fn start<H: ClientHandler>(config: ClientConfig, handler: H) -> Result<Self, TransportError> {
        let socket = UdpEndpoint::bind(config.local_bind(), config.poll_interval())?;
        let server_addr = config.remote();
        tracing::info!(
            "Client bound to {} for server {}",
            socket.local_addr()?,
            server_addr
        );

        let worker_socket = socket.clone();
        let mut client = ClientTransport {
            socket: Some(socket),
            server_addr,
            outgoing: PacketBuffer::new(),
            running: Arc::new(AtomicBool::new(true)),
            worker: None,
        };

        if config.send_hello {
            client.send()?;
        }

        let running = client.running.clone();
        let max_datagram_size = config.max_datagram_size;
        let worker = thread::Builder::new()
            .name("tucan-client".into())
            .spawn(move || receive_loop(worker_socket, running, max_datagram_size, handler))?;
        client.worker = Some(worker);

        Ok(client)
    }

    /// Start with inbound datagrams delivered through a channel instead of a
    /// callback.
    pub fn start_with_events(
        config: ClientConfig,
    ) -> Result<(Self, mpsc::Receiver<Bytes>), TransportError> {
        let (sender, rx) = ClientEventSender::channel(config.event_capacity);
        let client = Self::start(config, sender)?;
        Ok((client, rx))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.as_ref().ok_or_else(released)?.local_addr()
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn buffer(&self) -> &PacketBuffer {
        &self.outgoing
    }

    pub fn buffer_mut(&mut self) -> &mut PacketBuffer {
        &mut self.outgoing
    }

    pub fn buffer_size(&self) -> usize {
        self.outgoing.buffer_size()
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.outgoing.write_bytes(data);
    }

    pub fn write_int16(&mut self, value: i16) {
        self.outgoing.write_int16(value);
    }

    pub fn write_int32(&mut self, value: i32) {
        self.outgoing.write_int32(value);
    }

    pub fn write_int64(&mut self, value: i64) {
        self.outgoing.write_int64(value);
    }

    pub fn write_float32(&mut self, value: f32) {
        self.outgoing.write_float32(value);
    }

    pub fn write_string<'a>(&mut self, value: impl Into<Option<&'a str>>) -> Result<(), PacketError> {
        self.outgoing.write_string(value)
    }

    pub fn clear_buffer(&mut self) {
        self.outgoing.clear();
    }

    /// Send the whole outgoing buffer as one datagram.
    pub fn send(&self) -> Result<usize, TransportError> {
        let socket = match &self.socket {
            Some(socket) if self.is_running() => socket,
            _ => return Err(TransportError::NotRunning),
        };
        let sent = socket.send(self.outgoing.as_slice(), self.server_addr)?;
        tracing::trace!("Sent {} bytes to {}", sent, self.server_addr);
        Ok(sent)
    }

    /// Stop receiving and release the local port. Idempotent.
    ///
    /// Blocks for up to one poll interval while the receive thread notices.
    pub fn disconnect(&mut self) {
        if self.running.swap(false, Ordering::SeqCst) {
            tracing::info!("Client disconnected from {}", self.server_addr);
        }
        if let Some(worker) = self.worker.take() {
            join_worker(worker);
        }
        self.socket = None;
    }
}

impl Drop for ClientTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn receive_loop<H: ClientHandler>(
    socket: UdpEndpoint,
    running: Arc<AtomicBool>,
    max_datagram_size: usize,
    mut handler: H,
) {
    tracing::debug!("Client receive loop started");
    let mut buf = vec![0u8; recv_buffer_len(max_datagram_size)];
    let mut incoming = PacketBuffer::new();

    while running.load(Ordering::SeqCst) {
        match socket.recv(&mut buf) {
            Ok((len, from)) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                tracing::trace!("Received {} bytes from {}", len, from);
                incoming.clear();
                incoming.write_bytes(&buf[..len]);
                handler.on_receive(&mut incoming);
            }
            Err(ref e) if is_timeout(e) => {}
            Err(e) => {
                // ICMP port-unreachable surfaces here on some platforms
                tracing::debug!("Client receive error: {}", e);
            }
        }
    }

    tracing::debug!("Client receive loop stopped");
}
