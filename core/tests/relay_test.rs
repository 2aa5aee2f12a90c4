use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_test::assert_ok;
use tucan_core::{
    ClientConfig, ClientTransport, PacketBuffer, ServerConfig, ServerEvent, ServerTransport,
};

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(300);

async fn next<T>(rx: &mut mpsc::Receiver<T>) -> T {
    timeout(WAIT, rx.recv())
        .await
        .expect("Timeout waiting for event")
        .expect("Event channel closed")
}

async fn assert_quiet<T: std::fmt::Debug>(rx: &mut mpsc::Receiver<T>) {
    // A closed channel counts as quiet
    if let Ok(Some(event)) = timeout(QUIET, rx.recv()).await {
        panic!("Unexpected event: {:?}", event);
    }
}

fn client_config(server: &ServerTransport) -> ClientConfig {
    let port = server.local_addr().unwrap().port();
    ClientConfig::new("127.0.0.1", port).unwrap()
}

/// Address the server sees for a loopback client
fn seen_as(client: &ClientTransport) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, client.local_addr().unwrap().port()))
}

async fn connect(
    server: &ServerTransport,
    events: &mut mpsc::Receiver<ServerEvent>,
) -> (ClientTransport, mpsc::Receiver<Bytes>) {
    let (client, rx) = ClientTransport::start_with_events(client_config(server)).unwrap();
    assert_eq!(
        next(events).await,
        ServerEvent::Connected {
            endpoint: seen_as(&client)
        }
    );
    (client, rx)
}

#[tokio::test]
async fn test_handshake_then_relay_scenario() {
    let config = ServerConfig::new(0).with_max_clients(2);
    let (server, mut events) = ServerTransport::start_with_events(config).unwrap();

    let mut a_config = client_config(&server);
    a_config.send_hello = false;
    let mut b_config = client_config(&server);
    b_config.send_hello = false;
    let (mut a, mut a_rx) = ClientTransport::start_with_events(a_config).unwrap();
    let (mut b, mut b_rx) = ClientTransport::start_with_events(b_config).unwrap();

    // A's first datagram is seen, then consumed as its handshake
    a.write_bytes(&[0x01, 0x02]);
    assert_ok!(a.send());
    assert_eq!(
        next(&mut events).await,
        ServerEvent::Received {
            packet: Bytes::from_static(&[0x01, 0x02])
        }
    );
    assert_eq!(
        next(&mut events).await,
        ServerEvent::Connected { endpoint: seen_as(&a) }
    );
    assert_eq!(server.clients(), vec![seen_as(&a)]);

    b.write_bytes(&[0x03]);
    assert_ok!(b.send());
    assert_eq!(
        next(&mut events).await,
        ServerEvent::Received {
            packet: Bytes::from_static(&[0x03])
        }
    );
    assert_eq!(
        next(&mut events).await,
        ServerEvent::Connected { endpoint: seen_as(&b) }
    );
    assert_eq!(server.clients(), vec![seen_as(&a), seen_as(&b)]);
    assert_quiet(&mut a_rx).await;

    a.clear_buffer();
    a.write_bytes(&[0x09]);
    assert_ok!(a.send());

    assert_eq!(&next(&mut b_rx).await[..], &[0x09]);
    assert_quiet(&mut a_rx).await;
}

#[tokio::test]
async fn test_typed_fields_survive_relay() {
    let (server, mut events) = ServerTransport::start_with_events(ServerConfig::new(0)).unwrap();
    let (mut a, _a_rx) = connect(&server, &mut events).await;
    let (_b, mut b_rx) = connect(&server, &mut events).await;

    a.write_int16(-2);
    a.write_int32(1_000_000);
    a.write_int64(1 << 40);
    a.write_float32(0.25);
    a.write_string("move").unwrap();
    assert_ok!(a.send());

    let datagram = next(&mut b_rx).await;
    let mut packet = PacketBuffer::from(&datagram[..]);
    assert_eq!(packet.read_int16().unwrap(), -2);
    assert_eq!(packet.read_int32().unwrap(), 1_000_000);
    assert_eq!(packet.read_int64().unwrap(), 1 << 40);
    assert_eq!(packet.read_float32().unwrap(), 0.25);
    assert_eq!(packet.read_string().unwrap(), "move");
    assert_eq!(packet.unread_size(), 0);
}

#[tokio::test]
async fn test_relay_skips_sender() {
    let (server, mut events) = ServerTransport::start_with_events(ServerConfig::new(0)).unwrap();
    let (mut a, mut a_rx) = connect(&server, &mut events).await;
    let (_b, mut b_rx) = connect(&server, &mut events).await;
    let (_c, mut c_rx) = connect(&server, &mut events).await;

    a.write_bytes(b"hi");
    assert_ok!(a.send());

    assert_eq!(&next(&mut b_rx).await[..], b"hi");
    assert_eq!(&next(&mut c_rx).await[..], b"hi");
    assert_quiet(&mut a_rx).await;
}

#[tokio::test]
async fn test_client_over_capacity_is_ignored() {
    let config = ServerConfig::new(0).with_max_clients(1);
    let (server, mut events) = ServerTransport::start_with_events(config).unwrap();
    let (mut a, mut a_rx) = connect(&server, &mut events).await;

    let (mut b, mut b_rx) = ClientTransport::start_with_events(client_config(&server)).unwrap();
    b.write_bytes(&[5]);
    assert_ok!(b.send());

    // Seen by on_receive, but never admitted or relayed
    assert_eq!(
        next(&mut events).await,
        ServerEvent::Received {
            packet: Bytes::from_static(&[5])
        }
    );
    assert_quiet(&mut events).await;
    assert_quiet(&mut a_rx).await;
    assert_eq!(server.clients(), vec![seen_as(&a)]);

    a.write_bytes(&[6]);
    assert_ok!(a.send());
    assert_quiet(&mut b_rx).await;
    assert_eq!(server.client_count(), 1);
}

#[tokio::test]
async fn test_wait_for_all_holds_relay() {
    let config = ServerConfig::new(0)
        .with_max_clients(3)
        .with_wait_for_all(true);
    let (server, mut events) = ServerTransport::start_with_events(config).unwrap();
    let (mut a, _a_rx) = connect(&server, &mut events).await;
    let (_b, mut b_rx) = connect(&server, &mut events).await;

    a.write_bytes(&[1]);
    assert_ok!(a.send());
    // Held datagrams still reach on_receive
    assert_eq!(
        next(&mut events).await,
        ServerEvent::Received {
            packet: Bytes::from_static(&[1])
        }
    );
    assert_quiet(&mut b_rx).await;

    let (_c, mut c_rx) = connect(&server, &mut events).await;

    a.clear_buffer();
    a.write_bytes(&[2]);
    assert_ok!(a.send());

    assert_eq!(&next(&mut b_rx).await[..], &[2]);
    assert_eq!(&next(&mut c_rx).await[..], &[2]);
    assert_eq!(
        next(&mut events).await,
        ServerEvent::Received {
            packet: Bytes::from_static(&[2])
        }
    );
}

#[tokio::test]
async fn test_stopped_server_goes_silent() {
    let (mut server, mut events) =
        ServerTransport::start_with_events(ServerConfig::new(0)).unwrap();
    let (mut a, _a_rx) = connect(&server, &mut events).await;

    server.stop();
    assert!(!server.is_running());

    a.write_bytes(&[1]);
    // The datagram may or may not leave the socket; nobody handles it
    let _ = a.send();
    assert_quiet(&mut events).await;

    a.disconnect();
    assert!(!a.is_running());
}
