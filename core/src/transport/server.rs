//! Relay Server Transport
//!
//! Admits up to `max_clients` sender endpoints and relays every datagram from
//! a known client to all other known clients. The first datagram from a new
//! endpoint is its handshake and is never relayed. A failed relay send counts
//! as that client disconnecting.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::events::{ServerEvent, ServerEventSender};
use super::registry::{Admission, ClientRegistry, Endpoint};
use super::udp::{
    default_event_capacity, default_max_datagram_size, default_poll_interval_ms, is_timeout,
    join_worker, recv_buffer_len, released, TransportError, UdpEndpoint,
};
use crate::packet::PacketBuffer;

/// Server-side callbacks, all invoked on the relay thread.
pub trait ServerHandler: Send + 'static {
    /// Every non-empty datagram, known sender or not, before admission.
    fn on_receive(&mut self, _packet: &mut PacketBuffer) {}
    fn on_client_connect(&mut self, _endpoint: Endpoint) {}
    fn on_client_disconnect(&mut self, _endpoint: Endpoint) {}
}

impl ServerHandler for () {}

type PacketCallback = Box<dyn FnMut(&mut PacketBuffer) + Send>;
type EndpointCallback = Box<dyn FnMut(Endpoint) + Send>;

/// Closure-based [`ServerHandler`]; unset callbacks do nothing.
#[derive(Default)]
pub struct ServerCallbacks {
    receive: Option<PacketCallback>,
    connect: Option<EndpointCallback>,
    disconnect: Option<EndpointCallback>,
}

impl ServerCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_receive(mut self, f: impl FnMut(&mut PacketBuffer) + Send + 'static) -> Self {
        self.receive = Some(Box::new(f));
        self
    }

    pub fn with_client_connect(mut self, f: impl FnMut(Endpoint) + Send + 'static) -> Self {
        self.connect = Some(Box::new(f));
        self
    }

    pub fn with_client_disconnect(mut self, f: impl FnMut(Endpoint) + Send + 'static) -> Self {
        self.disconnect = Some(Box::new(f));
        self
    }
}

impl ServerHandler for ServerCallbacks {
    fn on_receive(&mut self, packet: &mut PacketBuffer) {
        if let Some(f) = self.receive.as_mut() {
            f(packet);
        }
    }

    fn on_client_connect(&mut self, endpoint: Endpoint) {
        if let Some(f) = self.connect.as_mut() {
            f(endpoint);
        }
    }

    fn on_client_disconnect(&mut self, endpoint: Endpoint) {
        if let Some(f) = self.disconnect.as_mut() {
            f(endpoint);
        }
    }
}

/// Configuration for a ServerTransport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Local port; 0 picks an ephemeral one
    pub port: u16,
    pub bind_address: IpAddr,
    /// Registry capacity; `None` is unbounded
    pub max_clients: Option<usize>,
    /// Hold all relaying until the registry is full
    pub wait_for_all: bool,
    pub poll_interval_ms: u64,
    /// Receive buffer size, capped at 65535. Longer datagrams arrive
    /// truncated and are relayed that way.
    pub max_datagram_size: usize,
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: 0,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            max_clients: None,
            wait_for_all: false,
            poll_interval_ms: default_poll_interval_ms(),
            max_datagram_size: default_max_datagram_size(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl ServerConfig {
    pub fn new(port: u16) -> Self {
        ServerConfig {
            port,
            ..Self::default()
        }
    }

    pub fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = Some(max_clients);
        self
    }

    pub fn with_wait_for_all(mut self, wait_for_all: bool) -> Self {
        self.wait_for_all = wait_for_all;
        self
    }

    pub fn from_json(json: &str) -> Result<Self, TransportError> {
        Ok(serde_json::from_str(json)?)
    }

    fn local_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// What happens to one datagram once its sender is looked up
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Route {
    /// Unknown sender and no room left
    Rejected,
    /// Unknown sender admitted; the datagram was its handshake
    Connected,
    /// Known sender but the quorum gate is still closed
    Held,
    /// Forward to these peers
    Relay(Vec<Endpoint>),
}

pub(crate) fn route(registry: &mut ClientRegistry, wait_for_all: bool, sender: Endpoint) -> Route {
    match registry.admit(sender) {
        Admission::Rejected => Route::Rejected,
        Admission::Admitted => Route::Connected,
        Admission::Known if wait_for_all && !registry.is_full() => Route::Held,
        Admission::Known => Route::Relay(registry.peers_of(&sender)),
    }
}

/// Send `payload` to each target, carrying on past failures.
/// Returns the targets whose send failed.
pub(crate) fn relay<F>(payload: &[u8], targets: &[Endpoint], mut send: F) -> Vec<Endpoint>
where
    F: FnMut(&[u8], Endpoint) -> io::Result<usize>,
{
    let mut failed = Vec::new();
    for &target in targets {
        if let Err(e) = send(payload, target) {
            tracing::warn!("Relay to {} failed: {}", target, e);
            failed.push(target);
        }
    }
    failed
}

fn lock(registry: &Mutex<ClientRegistry>) -> MutexGuard<'_, ClientRegistry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// UDP relay server.
pub struct ServerTransport {
    /// `None` once stopped
    socket: Option<UdpEndpoint>,
    registry: Arc<Mutex<ClientRegistry>>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl ServerTransport {
    /// Bind the configured port and start the relay thread.
    pub fn start<H: ServerHandler>(config: ServerConfig, handler: H) -> Result<Self, TransportError> {
        let socket = UdpEndpoint::bind(config.local_addr(), config.poll_interval())?;
        let registry = Arc::new(Mutex::new(ClientRegistry::new(config.max_clients)));
        let running = Arc::new(AtomicBool::new(true));

        tracing::info!(
            "Relay server listening on {} (max clients: {:?}, wait for all: {})",
            socket.local_addr()?,
            config.max_clients,
            config.wait_for_all
        );
        if config.wait_for_all && config.max_clients.is_none() {
            tracing::warn!("wait_for_all without max_clients: datagrams will never be relayed");
        }

        let worker = RelayWorker {
            socket: socket.clone(),
            registry: registry.clone(),
            running: running.clone(),
            wait_for_all: config.wait_for_all,
            handler,
            scratch: PacketBuffer::new(),
        };
        let max_datagram_size = config.max_datagram_size;
        let worker = thread::Builder::new()
            .name("tucan-relay".into())
            .spawn(move || worker.run(max_datagram_size))?;

        Ok(ServerTransport {
            socket: Some(socket),
            registry,
            running,
            worker: Some(worker),
        })
    }

    /// Start with callbacks delivered as [`ServerEvent`]s.
    pub fn start_with_events(
        config: ServerConfig,
    ) -> Result<(Self, mpsc::Receiver<ServerEvent>), TransportError> {
        let (sender, rx) = ServerEventSender::channel(config.event_capacity);
        let server = Self::start(config, sender)?;
        Ok((server, rx))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.as_ref().ok_or_else(released)?.local_addr()
    }

    /// Registered clients in connection order
    pub fn clients(&self) -> Vec<Endpoint> {
        lock(&self.registry).endpoints().to_vec()
    }

    pub fn client_count(&self) -> usize {
        lock(&self.registry).len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop relaying and release the port. Idempotent.
    ///
    /// Blocks for up to one poll interval while the relay thread notices.
    pub fn stop(&mut self) {
        if self.running.swap(false, Ordering::SeqCst) {
            tracing::info!("Relay server stopping");
        }
        if let Some(worker) = self.worker.take() {
            join_worker(worker);
        }
        // The worker's clone is gone, so this closes the socket
        self.socket = None;
    }
}

impl Drop for ServerTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

struct RelayWorker<H> {
    socket: UdpEndpoint,
    registry: Arc<Mutex<ClientRegistry>>,
    running: Arc<AtomicBool>,
    wait_for_all: bool,
    handler: H,
    scratch: PacketBuffer,
}

impl<H: ServerHandler> RelayWorker<H> {
    fn run(mut self, max_datagram_size: usize) {
        tracing::debug!("Relay loop started");
        let mut buf = vec![0u8; recv_buffer_len(max_datagram_size)];

        while self.running.load(Ordering::SeqCst) {
            let (len, sender) = match self.socket.recv(&mut buf) {
                Ok(received) => received,
                Err(ref e) if is_timeout(e) => continue,
                Err(e) => {
                    tracing::trace!("Receive error, retrying: {}", e);
                    continue;
                }
            };
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            self.process(sender, &buf[..len]);
        }

        tracing::debug!("Relay loop stopped");
    }

    fn process(&mut self, sender: Endpoint, payload: &[u8]) {
        tracing::trace!("{} bytes from {}", payload.len(), sender);

        if !payload.is_empty() {
            self.scratch.clear();
            self.scratch.write_bytes(payload);
            self.handler.on_receive(&mut self.scratch);
        }

        let route = route(&mut lock(&self.registry), self.wait_for_all, sender);
        match route {
            Route::Rejected => {
                tracing::trace!("Registry full, dropping datagram from {}", sender);
            }
            Route::Connected => {
                tracing::debug!("Client connected: {}", sender);
                self.handler.on_client_connect(sender);
            }
            Route::Held => {
                tracing::trace!("Waiting for all clients, holding datagram from {}", sender);
            }
            Route::Relay(targets) => {
                let socket = &self.socket;
                let failed = relay(payload, &targets, |data, target| socket.send(data, target));
                for endpoint in failed {
                    lock(&self.registry).remove(&endpoint);
                    tracing::debug!("Client disconnected: {}", endpoint);
                    self.handler.on_client_disconnect(endpoint);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(port: u16) -> Endpoint {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_first_datagram_is_handshake() {
        let mut registry = ClientRegistry::new(Some(2));

        assert_eq!(route(&mut registry, false, ep(1)), Route::Connected);
        assert_eq!(route(&mut registry, false, ep(2)), Route::Connected);
        assert_eq!(route(&mut registry, false, ep(1)), Route::Relay(vec![ep(2)]));
        assert_eq!(route(&mut registry, false, ep(2)), Route::Relay(vec![ep(1)]));
    }

    #[test]
    fn test_over_capacity_sender_never_admitted() {
        let mut registry = ClientRegistry::new(Some(1));
        route(&mut registry, false, ep(1));

        for _ in 0..3 {
            assert_eq!(route(&mut registry, false, ep(2)), Route::Rejected);
        }
        assert_eq!(registry.endpoints(), &[ep(1)]);
        // The lone client has nobody to relay to
        assert_eq!(route(&mut registry, false, ep(1)), Route::Relay(vec![]));
    }

    #[test]
    fn test_quorum_gate() {
        let mut registry = ClientRegistry::new(Some(3));
        route(&mut registry, true, ep(1));
        route(&mut registry, true, ep(2));

        assert_eq!(route(&mut registry, true, ep(1)), Route::Held);
        assert_eq!(route(&mut registry, true, ep(2)), Route::Held);

        assert_eq!(route(&mut registry, true, ep(3)), Route::Connected);
        assert_eq!(
            route(&mut registry, true, ep(1)),
            Route::Relay(vec![ep(2), ep(3)])
        );
    }

    #[test]
    fn test_quorum_gate_unbounded_never_opens() {
        let mut registry = ClientRegistry::new(None);
        route(&mut registry, true, ep(1));
        route(&mut registry, true, ep(2));
        assert_eq!(route(&mut registry, true, ep(1)), Route::Held);
    }

    #[test]
    fn test_relay_isolates_failures() {
        let targets = [ep(1), ep(2), ep(3)];
        let mut delivered = Vec::new();

        let failed = relay(b"state", &targets, |data, target| {
            if target == ep(2) {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "gone"));
            }
            delivered.push((target, data.to_vec()));
            Ok(data.len())
        });

        assert_eq!(failed, vec![ep(2)]);
        assert_eq!(
            delivered,
            vec![(ep(1), b"state".to_vec()), (ep(3), b"state".to_vec())]
        );
    }

    #[test]
    fn test_failed_relay_disconnects_client() {
        let registry = Arc::new(Mutex::new(ClientRegistry::new(None)));
        let socket =
            UdpEndpoint::bind("127.0.0.1:0".parse().unwrap(), Duration::from_millis(10)).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        let mut worker = RelayWorker {
            socket,
            registry: registry.clone(),
            running: Arc::new(AtomicBool::new(true)),
            wait_for_all: false,
            handler: ServerCallbacks::new().with_client_disconnect(move |endpoint| {
                let _ = tx.send(endpoint);
            }),
            scratch: PacketBuffer::new(),
        };

        // An IPv6 peer cannot be reached from an IPv4 socket
        let unreachable: Endpoint = "[::1]:9".parse().unwrap();
        let sender = ep(40000);
        lock(&registry).admit(unreachable);
        lock(&registry).admit(sender);

        worker.process(sender, &[1, 2, 3]);

        assert_eq!(rx.try_recv().unwrap(), unreachable);
        assert_eq!(lock(&registry).endpoints(), &[sender]);
    }

    #[test]
    fn test_callbacks_dispatch() {
        let (tx, rx) = std::sync::mpsc::channel();
        let tx_connect = tx.clone();
        let mut callbacks = ServerCallbacks::new()
            .with_receive(move |packet| {
                let _ = tx.send(format!("recv {}", packet.buffer_size()));
            })
            .with_client_connect(move |endpoint| {
                let _ = tx_connect.send(format!("connect {}", endpoint));
            });

        callbacks.on_client_connect(ep(5));
        callbacks.on_receive(&mut PacketBuffer::from(&[0u8; 3][..]));
        callbacks.on_client_disconnect(ep(5));

        let seen: Vec<String> = rx.try_iter().collect();
        assert_eq!(seen, vec!["connect 127.0.0.1:5", "recv 3"]);
    }

    #[test]
    fn test_config_json() {
        let config = ServerConfig::from_json(r#"{"port":7777,"max_clients":4}"#).unwrap();
        assert_eq!(config, ServerConfig::new(7777).with_max_clients(4));

        let config = ServerConfig::from_json(r#"{"port":1,"wait_for_all":true}"#).unwrap();
        assert!(config.wait_for_all);
        assert_eq!(config.max_clients, None);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut server = ServerTransport::start(ServerConfig::new(0), ()).unwrap();
        assert!(server.local_addr().unwrap().port() > 0);
        assert!(server.is_running());

        server.stop();
        assert!(!server.is_running());
        server.stop();
    }

    #[test]
    fn test_stop_releases_port() {
        let mut server = ServerTransport::start(ServerConfig::new(0), ()).unwrap();
        let port = server.local_addr().unwrap().port();

        server.stop();
        assert!(server.local_addr().is_err());
        std::net::UdpSocket::bind(("0.0.0.0", port)).expect("port still bound");
    }

    #[test]
    fn test_worker_exits_when_flag_cleared() {
        let socket =
            UdpEndpoint::bind("127.0.0.1:0".parse().unwrap(), Duration::from_millis(10)).unwrap();
        let running = Arc::new(AtomicBool::new(true));
        let worker = RelayWorker {
            socket,
            registry: Arc::new(Mutex::new(ClientRegistry::new(None))),
            running: running.clone(),
            wait_for_all: false,
            handler: (),
            scratch: PacketBuffer::new(),
        };
        let handle = thread::spawn(move || worker.run(64));

        thread::sleep(Duration::from_millis(30));
        running.store(false, Ordering::SeqCst);
        assert!(handle.join().is_ok());
    }
}
