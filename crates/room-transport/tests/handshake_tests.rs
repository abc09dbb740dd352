use room_proto::KeyPair;
use room_transport::memory::{self, pipe};
use room_transport::{
    Dialer, Handshaker, KeyHandshake, TcpDialer, TcpRoomListener, TransportError,
};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

const NET: &[u8] = b"test-network-key";

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[tokio::test]
async fn test_handshake_authenticates_both_sides() {
    init_tracing();

    let server_keys = KeyPair::generate();
    let client_keys = KeyPair::generate();
    let server = KeyHandshake::new(server_keys.clone(), NET);
    let client = KeyHandshake::new(client_keys.clone(), NET);

    let (a, b) = pipe();
    let server_id = server_keys.identity();
    let (client_res, server_res) = tokio::join!(client.client(a, &server_id), server.server(b));

    let mut client_chan = client_res.unwrap();
    let mut server_chan = server_res.unwrap();
    assert_eq!(client_chan.remote, server_keys.identity());
    assert_eq!(server_chan.remote, client_keys.identity());

    client_chan.io.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    server_chan.io.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
}

#[tokio::test]
async fn test_handshake_rejects_wrong_network_key() {
    let server_keys = KeyPair::generate();
    let server = KeyHandshake::new(server_keys.clone(), NET);
    let client = KeyHandshake::new(KeyPair::generate(), b"another-network");

    let (a, b) = pipe();
    let server_id = server_keys.identity();
    let (client_res, server_res) = tokio::join!(client.client(a, &server_id), server.server(b));

    assert!(matches!(client_res, Err(TransportError::Handshake(_))));
    assert!(matches!(server_res, Err(TransportError::Handshake(_))));
}

#[tokio::test]
async fn test_client_rejects_unexpected_server_identity() {
    let server = KeyHandshake::new(KeyPair::generate(), NET);
    let client = KeyHandshake::new(KeyPair::generate(), NET);
    let someone_else = KeyPair::generate().identity();

    let (a, b) = pipe();
    let (client_res, server_res) =
        tokio::join!(client.client(a, &someone_else), server.server(b));

    assert!(matches!(client_res, Err(TransportError::Handshake(_))));
    assert!(server_res.is_err());
}

#[tokio::test]
async fn test_handshake_times_out_on_silent_peer() {
    let server = KeyHandshake::new(KeyPair::generate(), NET)
        .with_timeout(Duration::from_millis(100));

    let (_silent, b) = pipe();
    let result = server.server(b).await;
    assert!(matches!(result, Err(TransportError::Timeout)));
}

#[tokio::test]
async fn test_tcp_dial_and_handshake() {
    init_tracing();

    let server_keys = KeyPair::generate();
    let server = KeyHandshake::new(server_keys.clone(), NET);
    let client = KeyHandshake::new(KeyPair::generate(), NET);

    let listener = TcpRoomListener::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let accept = tokio::spawn(async move {
        let (io, remote) = listener.accept().await.unwrap();
        let chan = server.server(io).await.unwrap();
        (chan.with_remote_addr(Some(remote)), remote)
    });

    let (io, peer_addr) = TcpDialer::new().dial(&addr.to_string()).await.unwrap();
    assert_eq!(peer_addr, Some(addr));
    let chan = client.client(io, &server_keys.identity()).await.unwrap();
    assert_eq!(chan.remote, server_keys.identity());

    let (server_chan, remote) = timeout(Duration::from_secs(5), accept)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(server_chan.remote_addr, Some(remote));
}

#[tokio::test]
async fn test_tcp_dial_failure() {
    // Bind and drop to get a port nobody listens on
    let listener = TcpRoomListener::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = TcpDialer::new().dial(&addr.to_string()).await;
    assert!(matches!(result, Err(TransportError::Dial(_))));
}

#[tokio::test]
async fn test_memory_listener_hands_over_streams() {
    let (dialer, listener) = memory::listener();

    let (mut local, _) = dialer.dial("room").await.unwrap();
    let mut remote = listener.accept().await.unwrap();

    local.write_all(b"hi").await.unwrap();
    let mut buf = [0u8; 2];
    remote.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hi");

    drop(listener);
    assert!(matches!(
        dialer.dial("room").await,
        Err(TransportError::Dial(_))
    ));
}
