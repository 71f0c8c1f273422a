//! End-to-end tests over real TCP: upgrade contract, broadcast and the client
//! pump against the server.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tether_client::{ConnectionPump, PumpConfig};
use tether_codec::{Codec, Compressor};
use tether_core::{Hooks, RoomConfig, SocketConfig};
use tether_server::{Server, ServerOptions};
use tether_transport::CLIENT_ID_HEADER;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

async fn start(server: &Server) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = server.clone();
    tokio::spawn(async move { serving.serve(listener).await });
    addr
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn test_upgrade_without_client_id_is_rejected() {
    let server = Server::new(ServerOptions::default(), None);
    server.register_path("/a", RoomConfig::default()).unwrap();
    let addr = start(&server).await;

    let err = tokio_tungstenite::connect_async(format!("ws://{}/a", addr))
        .await
        .unwrap_err();
    match err {
        WsError::Http(response) => assert_eq!(response.status(), 400),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(server.socket_count(), 0);

    let mut request = format!("ws://{}/unknown", addr).into_client_request().unwrap();
    request
        .headers_mut()
        .insert(CLIENT_ID_HEADER, "client01".parse().unwrap());
    match tokio_tungstenite::connect_async(request).await.unwrap_err() {
        WsError::Http(response) => assert_eq!(response.status(), 404),
        other => panic!("unexpected error: {}", other),
    }

    server.stop();
}

#[tokio::test]
async fn test_upgrade_registers_socket_and_delivers_broadcast() {
    let server = Server::new(ServerOptions::default(), None);
    let room = server.register_path("/chat", RoomConfig::default()).unwrap();
    let addr = start(&server).await;

    let mut request = format!("ws://{}/chat", addr).into_client_request().unwrap();
    request
        .headers_mut()
        .insert(CLIENT_ID_HEADER, "client01".parse().unwrap());
    let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    eventually("socket registration", || server.socket_count() == 1).await;
    let socket = room.sockets().pop().unwrap();
    assert!(socket.id().contains("-client01-"));
    assert!(server.socket(socket.id()).is_some());

    room.broadcast("hello").await.unwrap();
    match ws.next().await.unwrap().unwrap() {
        Message::Binary(data) => assert_eq!(data, b"hello"),
        other => panic!("unexpected message: {:?}", other),
    }

    ws.send(Message::Close(None)).await.unwrap();
    eventually("socket removal", || server.socket_count() == 0 && room.is_empty()).await;
    server.stop();
}

#[tokio::test]
async fn test_pump_roundtrip_with_compression() {
    let codec: Arc<dyn Codec> = Arc::new(Compressor::gzip(6));

    let server = Server::new(ServerOptions::default(), None);
    let room_config = RoomConfig {
        socket: SocketConfig::default()
            .with_codec(codec.clone())
            .with_hooks(Hooks::new().on_receive(Some)),
        ..RoomConfig::default()
    };
    let room = server.register_path("/echo", room_config).unwrap();
    let addr = start(&server).await;

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let config = PumpConfig::new(format!("ws://{}/echo", addr))
        .with_codec(codec)
        .with_hooks(Hooks::new().on_receive(move |data| {
            let _ = seen_tx.send(data);
            None
        }));
    let pump = ConnectionPump::websocket(config).unwrap();
    pump.run().unwrap();

    let payload: Bytes = (0..2048u32).map(|i| (i % 97) as u8).collect::<Vec<_>>().into();
    pump.send(payload.clone()).await.unwrap();

    let echoed = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, payload);

    let socket = room.sockets().pop().unwrap();
    assert!(socket.id().contains(pump.id()));

    pump.stop();
    eventually("socket removal", || server.socket_count() == 0).await;
    server.stop();
}

#[tokio::test]
async fn test_server_stop_closes_clients() {
    let server = Server::new(ServerOptions::default(), None);
    server.register_path("/chat", RoomConfig::default()).unwrap();
    let addr = start(&server).await;

    let mut request = format!("ws://{}/chat", addr).into_client_request().unwrap();
    request
        .headers_mut()
        .insert(CLIENT_ID_HEADER, "client01".parse().unwrap());
    let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();
    eventually("socket registration", || server.socket_count() == 1).await;
    assert_eq!(server.local_addr(), Some(addr));

    server.stop();
    let next = tokio::time::timeout(Duration::from_secs(5), ws.next()).await.unwrap();
    assert!(matches!(next, None | Some(Ok(Message::Close(_))) | Some(Err(_))));
}
