//! Tucan Core Library
//! Unreliable datagram messaging for real-time peer groups

pub mod ffi;
pub mod packet;
pub mod transport;

pub use packet::{PacketBuffer, PacketError, TextEncoding};
pub use transport::{
    ClientConfig, ClientTransport, ServerCallbacks, ServerConfig, ServerEvent, ServerTransport,
    TransportError,
};

/// Initialize logging
pub fn init() {
    // A host may call this from several entry points; an already installed
    // subscriber is left in place.
    let _ = tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(tracing::Level::INFO)
            .finish(),
    );

    tracing::info!("Tucan Core Initialized (logger ready)");
}
