//! End-to-end relay behaviour over real sockets.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use ws_relay_proxy::proxy::ProxyOptions;

mod common;

use common::{assert_client_silent, connect, next_client_message, STEP};

#[tokio::test]
async fn client_text_is_forwarded_and_backend_text_goes_to_viewer() {
    let mut backend = common::start_ws_backend(None).await;
    let url = backend.url();
    let (viewed_tx, mut viewed) = mpsc::unbounded_channel();
    let mut app = common::start_embedded_proxy(move || {
        let viewed_tx = viewed_tx.clone();
        ProxyOptions::new("viewer-session", url.clone()).with_viewer(move |payload: &[u8]| {
            let _ = viewed_tx.send(payload.to_vec());
        })
    })
    .await;

    let mut client = connect(app.addr, "/feed?channel=7", &[]).await;
    let proxy = app.next_proxy().await;

    client.send(Message::text("subscribe")).await.unwrap();
    assert_eq!(backend.next_message().await, Message::text("subscribe"));

    backend.send(Message::text("tick-1"));
    let payload = tokio::time::timeout(STEP, viewed.recv()).await.unwrap().unwrap();
    assert_eq!(payload, b"tick-1".to_vec());
    assert_client_silent(&mut client).await;

    assert!(proxy.is_connected());
}

#[tokio::test]
async fn binary_from_backend_is_dropped_without_reaching_viewer() {
    let backend = common::start_ws_backend(None).await;
    let url = backend.url();
    let (viewed_tx, mut viewed) = mpsc::unbounded_channel::<Vec<u8>>();
    let app = common::start_embedded_proxy(move || {
        let viewed_tx = viewed_tx.clone();
        ProxyOptions::new("binary-session", url.clone()).with_viewer(move |payload: &[u8]| {
            let _ = viewed_tx.send(payload.to_vec());
        })
    })
    .await;

    let mut client = connect(app.addr, "/", &[]).await;
    backend.send(Message::binary(Bytes::from_static(&[0xde, 0xad])));
    backend.send(Message::text("after-binary"));

    let payload = tokio::time::timeout(STEP, viewed.recv()).await.unwrap().unwrap();
    assert_eq!(payload, b"after-binary".to_vec());
    assert_client_silent(&mut client).await;
}

#[tokio::test]
async fn embedder_sends_reach_the_client() {
    let backend = common::start_ws_backend(None).await;
    let url = backend.url();
    let mut app = common::start_embedded_proxy(move || ProxyOptions::new("send-session", url.clone())).await;

    let mut client = connect(app.addr, "/", &[]).await;
    let proxy = app.next_proxy().await;
    wait_connected(&proxy).await;

    proxy.send("pushed").await.unwrap();
    assert_eq!(next_client_message(&mut client).await, Some(Message::text("pushed")));

    proxy
        .send_typed(Message::binary(Bytes::from_static(b"raw")))
        .await
        .unwrap();
    assert_eq!(
        next_client_message(&mut client).await,
        Some(Message::binary(Bytes::from_static(b"raw")))
    );
}

#[tokio::test]
async fn backend_close_code_reaches_client_and_ends_session() {
    let backend = common::start_ws_backend(None).await;
    let url = backend.url();
    let removed = Arc::new(Mutex::new(Vec::<String>::new()));
    let manager_log = Arc::clone(&removed);
    let manager: Arc<dyn ws_relay_proxy::proxy::Manager> = Arc::new(move |id: &str| {
        manager_log.lock().unwrap().push(id.to_owned());
    });
    let mut app = common::start_embedded_proxy(move || {
        ProxyOptions::new("closing-session", url.clone()).with_manager(Arc::clone(&manager))
    })
    .await;

    let mut client = connect(app.addr, "/", &[]).await;
    let proxy = app.next_proxy().await;
    wait_connected(&proxy).await;

    backend.send(Message::Close(Some(CloseFrame {
        code: CloseCode::Away,
        reason: "maintenance".into(),
    })));

    match next_client_message(&mut client).await {
        Some(Message::Close(Some(frame))) => {
            assert_eq!(frame.code, CloseCode::Away);
            assert_eq!(frame.reason.as_str(), "maintenance");
        }
        other => panic!("expected close frame, got {other:?}"),
    }

    tokio::time::timeout(STEP, proxy.closed()).await.unwrap();
    assert!(!proxy.is_connected());
    assert_eq!(*removed.lock().unwrap(), vec!["closing-session".to_owned()]);
}

#[tokio::test]
async fn client_close_reaches_backend() {
    let mut backend = common::start_ws_backend(None).await;
    let url = backend.url();
    let mut app = common::start_embedded_proxy(move || ProxyOptions::new("client-close", url.clone())).await;

    let mut client = connect(app.addr, "/", &[]).await;
    let proxy = app.next_proxy().await;
    wait_connected(&proxy).await;

    client
        .close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        }))
        .await
        .unwrap();

    match backend.next_message().await {
        Message::Close(Some(frame)) => {
            assert_eq!(frame.code, CloseCode::Normal);
            assert_eq!(frame.reason.as_str(), "bye");
        }
        other => panic!("expected close frame, got {other:?}"),
    }
    tokio::time::timeout(STEP, proxy.closed()).await.unwrap();
}

#[tokio::test]
async fn client_ping_is_forwarded_and_answered() {
    let mut backend = common::start_ws_backend(None).await;
    let url = backend.url();
    let app = common::start_embedded_proxy(move || ProxyOptions::new("ping-session", url.clone())).await;

    let mut client = connect(app.addr, "/", &[]).await;
    client.send(Message::Ping(Bytes::from_static(b"hb"))).await.unwrap();

    assert_eq!(backend.next_message().await, Message::Ping(Bytes::from_static(b"hb")));
    assert_eq!(
        next_client_message(&mut client).await,
        Some(Message::Pong(Bytes::from_static(b"hb")))
    );
}

#[tokio::test]
async fn close_proxy_disconnects_both_peers() {
    let mut backend = common::start_ws_backend(None).await;
    let url = backend.url();
    let mut app = common::start_embedded_proxy(move || ProxyOptions::new("stopped", url.clone())).await;

    let mut client = connect(app.addr, "/", &[]).await;
    let proxy = app.next_proxy().await;
    wait_connected(&proxy).await;

    proxy.close_proxy().await;
    proxy.close_proxy().await;

    assert!(matches!(backend.next_message().await, Message::Close(_)));
    assert!(matches!(
        next_client_message(&mut client).await,
        Some(Message::Close(_)) | None
    ));
    tokio::time::timeout(STEP, proxy.closed()).await.unwrap();
    assert!(!proxy.is_connected());
}

async fn wait_connected(proxy: &ws_relay_proxy::HalfDuplexProxy) {
    tokio::time::timeout(STEP, async {
        while !proxy.is_connected() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("session never established");
}
