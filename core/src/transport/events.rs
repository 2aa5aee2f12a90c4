//! Channel-based handlers
//!
//! Forward transport callbacks into bounded tokio channels so async code can
//! consume them with `recv().await`. Events are pushed with `try_send`: a
//! full channel drops the event rather than stalling the receive loop.

use bytes::Bytes;
use tokio::sync::mpsc::{self, error::TrySendError};

use super::client::ClientHandler;
use super::registry::Endpoint;
use super::server::ServerHandler;
use crate::packet::PacketBuffer;

/// Events emitted by a ServerTransport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Non-empty datagram received, from any sender
    Received { packet: Bytes },
    /// New client admitted
    Connected { endpoint: Endpoint },
    /// Relay to a client failed and it was dropped
    Disconnected { endpoint: Endpoint },
}

pub(crate) struct ClientEventSender {
    tx: mpsc::Sender<Bytes>,
}

impl ClientEventSender {
    pub(crate) fn channel(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (ClientEventSender { tx }, rx)
    }
}

impl ClientHandler for ClientEventSender {
    fn on_receive(&mut self, packet: &mut PacketBuffer) {
        forward(&self.tx, packet.to_array());
    }
}

pub(crate) struct ServerEventSender {
    tx: mpsc::Sender<ServerEvent>,
}

impl ServerEventSender {
    pub(crate) fn channel(capacity: usize) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (ServerEventSender { tx }, rx)
    }
}

impl ServerHandler for ServerEventSender {
    fn on_receive(&mut self, packet: &mut PacketBuffer) {
        forward(
            &self.tx,
            ServerEvent::Received {
                packet: packet.to_array(),
            },
        );
    }

    fn on_client_connect(&mut self, endpoint: Endpoint) {
        forward(&self.tx, ServerEvent::Connected { endpoint });
    }

    fn on_client_disconnect(&mut self, endpoint: Endpoint) {
        forward(&self.tx, ServerEvent::Disconnected { endpoint });
    }
}

fn forward<T>(tx: &mpsc::Sender<T>, event: T) {
    match tx.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => tracing::warn!("Event channel full, dropping event"),
        Err(TrySendError::Closed(_)) => tracing::trace!("Event receiver gone"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_events_in_order() {
        let (mut sender, mut rx) = ServerEventSender::channel(8);
        let endpoint: Endpoint = "127.0.0.1:4000".parse().unwrap();

        sender.on_client_connect(endpoint);
        sender.on_receive(&mut PacketBuffer::from(&[1u8, 2][..]));
        sender.on_client_disconnect(endpoint);

        assert_eq!(rx.try_recv().unwrap(), ServerEvent::Connected { endpoint });
        assert_eq!(
            rx.try_recv().unwrap(),
            ServerEvent::Received {
                packet: Bytes::from_static(&[1, 2])
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            ServerEvent::Disconnected { endpoint }
        );
    }

    #[test]
    fn test_full_channel_drops_newest() {
        let (mut sender, mut rx) = ClientEventSender::channel(1);

        sender.on_receive(&mut PacketBuffer::from(&[1u8][..]));
        sender.on_receive(&mut PacketBuffer::from(&[2u8][..]));

        assert_eq!(&rx.try_recv().unwrap()[..], &[1]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_receiver_is_ignored() {
        let (mut sender, rx) = ClientEventSender::channel(4);
        drop(rx);
        sender.on_receive(&mut PacketBuffer::from(&[1u8][..]));
    }
}
