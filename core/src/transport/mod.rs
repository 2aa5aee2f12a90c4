//! Transport Module
//!
//! Unreliable UDP datagram transport: a client aimed at one server and a
//! relay server that fans each datagram out to the other clients.

pub mod client;
pub mod events;
pub mod registry;
pub mod server;
pub mod udp;

// Re-exports for convenience
pub use client::{ClientConfig, ClientHandler, ClientTransport};
pub use events::ServerEvent;
pub use registry::{Admission, ClientRegistry, Endpoint};
pub use server::{ServerCallbacks, ServerConfig, ServerHandler, ServerTransport};
pub use udp::{TransportError, UdpEndpoint, MAX_DATAGRAM_SIZE};
