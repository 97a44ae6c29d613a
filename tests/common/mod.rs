//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Request};
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request as HandshakeRequest, Response as HandshakeResponse};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use ws_relay_proxy::config::ServerConfig;
use ws_relay_proxy::http::{HttpServer, SessionRegistry};
use ws_relay_proxy::lifecycle::Shutdown;
use ws_relay_proxy::proxy::{HalfDuplexProxy, ProxyOptions};

pub const STEP: Duration = Duration::from_secs(2);

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A scripted WebSocket backend. Serves one session at a time: whatever it
/// reads lands in `received`, whatever is pushed to `outgoing` is written.
pub struct Backend {
    pub addr: SocketAddr,
    pub handshakes: mpsc::UnboundedReceiver<HeaderMap>,
    pub received: mpsc::UnboundedReceiver<Message>,
    pub outgoing: mpsc::UnboundedSender<Message>,
}

impl Backend {
    pub fn url(&self) -> Url {
        Url::parse(&format!("ws://{}", self.addr)).unwrap()
    }

    pub async fn next_handshake(&mut self) -> HeaderMap {
        tokio::time::timeout(STEP, self.handshakes.recv())
            .await
            .expect("backend saw no handshake")
            .expect("backend stopped")
    }

    /// Next non-pong message the backend read.
    pub async fn next_message(&mut self) -> Message {
        loop {
            let message = tokio::time::timeout(STEP, self.received.recv())
                .await
                .expect("backend received nothing")
                .expect("backend stopped");
            if !matches!(message, Message::Pong(_)) {
                return message;
            }
        }
    }

    pub fn send(&self, message: Message) {
        self.outgoing.send(message).unwrap();
    }
}

/// Start a WebSocket backend. `protocol`, when set, is selected as the
/// negotiated subprotocol.
pub async fn start_ws_backend(protocol: Option<&'static str>) -> Backend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (handshake_tx, handshakes) = mpsc::unbounded_channel();
    let (received_tx, received) = mpsc::unbounded_channel();
    let (outgoing, outgoing_rx) = mpsc::unbounded_channel::<Message>();
    let outgoing_rx = Arc::new(Mutex::new(outgoing_rx));

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let handshake_tx = handshake_tx.clone();
            let received_tx = received_tx.clone();
            let outgoing_rx = Arc::clone(&outgoing_rx);

            tokio::spawn(async move {
                let callback = move |request: &HandshakeRequest, mut response: HandshakeResponse| -> Result<HandshakeResponse, ErrorResponse> {
                    let _ = handshake_tx.send(request.headers().clone());
                    if let Some(protocol) = protocol {
                        response
                            .headers_mut()
                            .insert("sec-websocket-protocol", HeaderValue::from_static(protocol));
                    }
                    Ok(response)
                };
                let Ok(socket) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                    return;
                };
                let (mut sink, mut stream) = socket.split();
                let mut outgoing_rx = outgoing_rx.lock().await;

                loop {
                    tokio::select! {
                        incoming = stream.next() => match incoming {
                            Some(Ok(message)) => {
                                let closing = message.is_close();
                                let _ = received_tx.send(message);
                                if closing {
                                    break;
                                }
                            }
                            _ => break,
                        },
                        outgoing = outgoing_rx.recv() => match outgoing {
                            Some(message) => {
                                if sink.send(message).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        },
                    }
                }
            });
        }
    });

    Backend {
        addr,
        handshakes,
        received,
        outgoing,
    }
}

/// Start a plain TCP backend that answers every handshake with `response`.
pub async fn start_rejecting_backend(response: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    addr
}

/// An address nothing listens on.
pub async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// The bundled host server, running on an ephemeral port.
pub struct HostServer {
    pub addr: SocketAddr,
    pub sessions: Arc<SessionRegistry>,
    pub shutdown: Shutdown,
    pub task: tokio::task::JoinHandle<Result<(), std::io::Error>>,
}

pub async fn start_host_server(backend: &Url, natural_tunnel: bool) -> HostServer {
    let mut config = ServerConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.backend.url = backend.to_string();
    config.backend.natural_tunnel = natural_tunnel;

    let listener = TcpListener::bind(&config.listener.bind_address).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = HttpServer::new(&config).unwrap();
    let sessions = server.sessions();
    let shutdown = Shutdown::new();
    let task = tokio::spawn(server.run(listener, shutdown.clone()));

    HostServer {
        addr,
        sessions,
        shutdown,
        task,
    }
}

/// A proxy embedded in a custom axum app, the way an application would use
/// the library directly. Every proxy created is handed to the test.
pub struct EmbeddedProxy {
    pub addr: SocketAddr,
    pub proxies: mpsc::UnboundedReceiver<Arc<HalfDuplexProxy>>,
}

impl EmbeddedProxy {
    pub async fn next_proxy(&mut self) -> Arc<HalfDuplexProxy> {
        tokio::time::timeout(STEP, self.proxies.recv())
            .await
            .expect("no proxy created")
            .expect("embedding app stopped")
    }
}

pub async fn start_embedded_proxy<F>(make_options: F) -> EmbeddedProxy
where
    F: Fn() -> ProxyOptions + Send + Sync + 'static,
{
    let make_options = Arc::new(make_options);
    let (tx, proxies) = mpsc::unbounded_channel();

    let app = Router::new().fallback(move |request: Request<Body>| {
        let make_options = Arc::clone(&make_options);
        let tx = tx.clone();
        async move {
            let proxy = Arc::new(HalfDuplexProxy::new(make_options()));
            let _ = tx.send(Arc::clone(&proxy));
            proxy.serve(request).await
        }
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await;
    });

    EmbeddedProxy { addr, proxies }
}

/// Connect a client to `addr` with extra handshake headers.
pub async fn connect(addr: SocketAddr, path: &str, headers: &[(&'static str, &'static str)]) -> Client {
    let mut request = format!("ws://{addr}{path}").into_client_request().unwrap();
    for (name, value) in headers {
        request
            .headers_mut()
            .append(*name, HeaderValue::from_static(value));
    }
    let (client, _) = tokio::time::timeout(STEP, tokio_tungstenite::connect_async(request))
        .await
        .expect("client handshake timed out")
        .expect("client handshake failed");
    client
}

/// Next non-control message the client reads, or `None` if the stream ends.
pub async fn next_client_message(client: &mut Client) -> Option<Message> {
    loop {
        match tokio::time::timeout(STEP, client.next()).await.expect("client received nothing") {
            Some(Ok(Message::Ping(_))) => continue,
            Some(Ok(message)) => return Some(message),
            Some(Err(_)) | None => return None,
        }
    }
}

/// Assert the client reads nothing for a short while.
pub async fn assert_client_silent(client: &mut Client) {
    let quiet = tokio::time::timeout(Duration::from_millis(200), client.next()).await;
    assert!(quiet.is_err(), "client unexpectedly received {quiet:?}");
}
