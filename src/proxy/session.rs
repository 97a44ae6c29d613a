//! The proxy instance: handshake orchestration, relay supervision and the
//! session API exposed to the embedding application.
//!
//! # Data Flow
//! ```text
//! inbound request
//!     → resolve backend URL (500 code 1 / code 2 on failure)
//!     → negotiate request headers → Director
//!     → dial backend (relay rejection / 503 on failure)
//!     → negotiate upgrade headers → Upgrader (400 on failure)
//!     → 101 returned to the host server
//!     → [spawned] client socket handed over → two copy loops
//!     → first loop to finish ends the session → teardown → Manager
//! ```
//!
//! # Design Decisions
//! - One instance serves exactly one upgrade; a second request is refused
//! - The relay runs on a spawned task because hyper only hands over the
//!   client socket after the `101` response has been written
//! - Each loop reports through its own single-slot channel; a loop that
//!   stops on request drops its sender without reporting

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::body::Body;
use axum::http::header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio::sync::{oneshot, watch};
use tokio_tungstenite::tungstenite::Message;

use crate::observability::metrics;
use crate::proxy::backend::{resolver_for, TungsteniteDialer};
use crate::proxy::connection::WsConnection;
use crate::proxy::error::{DialError, ProxyError, RejectedHandshake};
use crate::proxy::headers;
use crate::proxy::options::{BackendResolver, Dialer, ProxyOptions, Upgrader};
use crate::proxy::relay::{CopyLoop, Direction, HalfDuplex, RelayPolicy};
use crate::proxy::upgrade::HyperUpgrader;

/// A WebSocket reverse proxy for a single session.
///
/// The relay discipline is chosen by `P`; see [`HalfDuplex`].
pub struct WebsocketProxy<P: RelayPolicy = HalfDuplex> {
    options: ProxyOptions,
    backend: Option<BackendResolver>,
    policy: P,
    session_id: Arc<str>,
    to_client: Mutex<Option<Arc<WsConnection>>>,
    to_backend: Mutex<Option<Arc<WsConnection>>>,
    connected: AtomicBool,
    engaged: AtomicBool,
    /// Stops the loop writing to the client.
    stop_client: watch::Sender<bool>,
    /// Stops the loop writing to the backend.
    stop_backend: watch::Sender<bool>,
    finished: watch::Sender<bool>,
}

/// The proxy with the half-duplex relay discipline.
pub type HalfDuplexProxy = WebsocketProxy<HalfDuplex>;

impl WebsocketProxy<HalfDuplex> {
    /// Build a half-duplex proxy whose backend URL is derived from
    /// `options.url` and the inbound request target.
    pub fn new(options: ProxyOptions) -> Self {
        Self::with_policy(options, HalfDuplex)
    }
}

impl<P: RelayPolicy> WebsocketProxy<P> {
    pub fn with_policy(options: ProxyOptions, policy: P) -> Self {
        let backend = options.url.clone().map(resolver_for);
        Self {
            session_id: Arc::from(options.unique_id.as_str()),
            options,
            backend,
            policy,
            to_client: Mutex::new(None),
            to_backend: Mutex::new(None),
            connected: AtomicBool::new(false),
            engaged: AtomicBool::new(false),
            stop_client: watch::Sender::new(false),
            stop_backend: watch::Sender::new(false),
            finished: watch::Sender::new(false),
        }
    }

    /// Replace the backend resolver. `None` leaves the proxy without one,
    /// which fails every request.
    pub fn with_backend(mut self, resolver: Option<BackendResolver>) -> Self {
        self.backend = resolver;
        self
    }

    pub fn unique_id(&self) -> &str {
        &self.session_id
    }

    /// Handle the inbound upgrade request.
    ///
    /// Returns the response for the host server to send. On success this is
    /// the `101` handshake response and the session continues on a spawned
    /// task; await [`closed`](Self::closed) to observe its end.
    pub async fn serve(self: &Arc<Self>, request: Request<Body>) -> Response {
        if self.engaged.swap(true, Ordering::SeqCst) {
            tracing::error!(session_id = %self.session_id, "websocketproxy: proxy instance already served a request");
            return (StatusCode::INTERNAL_SERVER_ERROR, "proxy already engaged").into_response();
        }

        let response = self.handshake(request).await;
        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            self.finish("rejected");
        }
        response
    }

    async fn handshake(self: &Arc<Self>, request: Request<Body>) -> Response {
        let (parts, body) = request.into_parts();

        let Some(resolve) = &self.backend else {
            tracing::error!(session_id = %self.session_id, "websocketproxy: backend function is not defined");
            return internal_error(1);
        };
        let Some(backend_url) = resolve(&parts) else {
            tracing::error!(session_id = %self.session_id, "websocketproxy: backend URL is nil");
            return internal_error(2);
        };

        let mut request_headers = headers::request_headers(&parts, self.options.natural_tunnel);
        if let Some(director) = &self.options.director {
            director.adjust_headers(&parts, &mut request_headers);
        }

        tracing::debug!(session_id = %self.session_id, backend_url = %backend_url, "dialing backend");
        let dialed = match self.options.dialer.as_ref() {
            Some(dialer) => dialer.dial(backend_url.clone(), request_headers).await,
            None => TungsteniteDialer.dial(backend_url.clone(), request_headers).await,
        };
        let dialed = match dialed {
            Ok(dialed) => dialed,
            Err(DialError::Rejected(rejected)) => {
                tracing::error!(
                    session_id = %self.session_id,
                    backend_url = %backend_url,
                    status = %rejected.status,
                    "websocketproxy: couldn't dial to remote backend url"
                );
                metrics::record_dial_failure("rejected");
                return relay_rejection(&self.session_id, *rejected);
            }
            Err(err) => {
                tracing::error!(
                    session_id = %self.session_id,
                    backend_url = %backend_url,
                    error = %err,
                    "websocketproxy: couldn't dial to remote backend url"
                );
                metrics::record_dial_failure("unreachable");
                return StatusCode::SERVICE_UNAVAILABLE.into_response();
            }
        };

        let upgrade_headers = headers::upgrade_headers(&dialed.response_headers, self.options.natural_tunnel);
        let mut request = Request::from_parts(parts, body);
        let upgraded = match self.options.upgrader.as_ref() {
            Some(upgrader) => upgrader.upgrade(&mut request, upgrade_headers),
            None => HyperUpgrader.upgrade(&mut request, upgrade_headers),
        };
        let (response, pending) = match upgraded {
            Ok(upgraded) => upgraded,
            Err(err) => {
                tracing::error!(session_id = %self.session_id, error = %err, "websocketproxy: couldn't upgrade");
                dialed.connection.close().await;
                return StatusCode::BAD_REQUEST.into_response();
            }
        };

        let proxy = Arc::clone(self);
        let backend = dialed.connection;
        tokio::spawn(async move {
            match pending.await {
                Ok(client) => proxy.run(client, backend).await,
                Err(err) => {
                    tracing::error!(session_id = %proxy.session_id, error = %err, "websocketproxy: couldn't upgrade");
                    backend.close().await;
                    proxy.finish("upgrade_failed");
                }
            }
        });

        response
    }

    /// Drive both copy loops until the first one ends, then tear down.
    async fn run(self: Arc<Self>, client: WsConnection, backend: WsConnection) {
        let client = Arc::new(client);
        let backend = Arc::new(backend);

        let (Some(client_reader), Some(backend_reader)) = (client.take_reader(), backend.take_reader()) else {
            tracing::error!(session_id = %self.session_id, "websocketproxy: connection read half already taken");
            client.close().await;
            backend.close().await;
            self.finish("upgrade_failed");
            return;
        };

        *lock(&self.to_client) = Some(Arc::clone(&client));
        *lock(&self.to_backend) = Some(Arc::clone(&backend));
        self.connected.store(true, Ordering::SeqCst);
        metrics::record_session_opened();
        tracing::info!(session_id = %self.session_id, "websocketproxy: session established");

        let forward = CopyLoop {
            direction: Direction::ClientToBackend,
            route: self.policy.route(Direction::ClientToBackend),
            source: Arc::clone(&client),
            destination: Arc::clone(&backend),
            viewer: self.options.viewer.clone(),
            stop: self.stop_backend.subscribe(),
            session_id: Arc::clone(&self.session_id),
        };
        let intercept = CopyLoop {
            direction: Direction::BackendToClient,
            route: self.policy.route(Direction::BackendToClient),
            source: backend,
            destination: client,
            viewer: self.options.viewer.clone(),
            stop: self.stop_client.subscribe(),
            session_id: Arc::clone(&self.session_id),
        };

        let (err_backend, mut backend_rx) = oneshot::channel();
        let (err_client, mut client_rx) = oneshot::channel();
        let forward = tokio::spawn(async move {
            if let Err(err) = forward.run(client_reader).await {
                let _ = err_backend.send(err);
            }
        });
        let intercept = tokio::spawn(async move {
            if let Err(err) = intercept.run(backend_reader).await {
                let _ = err_client.send(err);
            }
        });

        let (direction, outcome) = tokio::select! {
            result = &mut client_rx => (Direction::BackendToClient, result.ok()),
            result = &mut backend_rx => (Direction::ClientToBackend, result.ok()),
        };

        let label = match &outcome {
            Some(err) if err.is_expected_close() => {
                tracing::debug!(session_id = %self.session_id, %direction, error = %err, "websocketproxy: peer closed");
                "closed"
            }
            Some(err) => {
                tracing::error!(
                    session_id = %self.session_id,
                    %direction,
                    error = %err,
                    "websocketproxy: error when copying {}",
                    copy_description(direction)
                );
                "error"
            }
            None => {
                tracing::debug!(session_id = %self.session_id, %direction, "websocketproxy: relay stopped");
                "stopped"
            }
        };

        self.connected.store(false, Ordering::SeqCst);
        self.raise_stop_signals();
        for handle in [forward, intercept] {
            if let Err(err) = handle.await {
                tracing::error!(session_id = %self.session_id, error = %err, "websocketproxy: relay task failed");
            }
        }
        self.close_proxy().await;
        metrics::record_session_closed();
        self.finish(label);
    }

    /// Send a text message to the client.
    pub async fn send(&self, text: impl Into<String>) -> Result<(), ProxyError> {
        self.send_typed(Message::text(text.into())).await
    }

    /// Send any message to the client. Fails with
    /// [`ProxyError::NotEstablished`] until the upgrade has completed.
    pub async fn send_typed(&self, message: Message) -> Result<(), ProxyError> {
        let client = lock(&self.to_client).clone().ok_or(ProxyError::NotEstablished)?;
        client.write_message(message).await?;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Close both connections and stop both copy loops. Calling it again is
    /// a no-op.
    pub async fn close_proxy(&self) {
        let backend = lock(&self.to_backend).take();
        let client = lock(&self.to_client).take();

        if let Some(backend) = backend {
            backend.close().await;
        }
        if let Some(client) = client {
            client.close().await;
        }

        self.raise_stop_signals();
    }

    /// Wait until the session has ended, successfully or not.
    pub async fn closed(&self) {
        let mut finished = self.finished.subscribe();
        let _ = finished.wait_for(|done| *done).await;
    }

    fn raise_stop_signals(&self) {
        self.stop_backend.send_replace(true);
        self.stop_client.send_replace(true);
    }

    fn finish(&self, outcome: &'static str) {
        if self.finished.send_replace(true) {
            return;
        }
        metrics::record_session_outcome(outcome);

        if let Some(manager) = &self.options.manager {
            if !self.session_id.is_empty() {
                manager.remove_connection(&self.session_id);
            }
        }
    }
}

impl<P: RelayPolicy> std::fmt::Debug for WebsocketProxy<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebsocketProxy")
            .field("session_id", &self.session_id)
            .field("connected", &self.is_connected())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn copy_description(direction: Direction) -> &'static str {
    match direction {
        Direction::ClientToBackend => "from client to backend",
        Direction::BackendToClient => "from backend to client",
    }
}

fn internal_error(code: u8) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("internal server error (code: {code})"),
    )
        .into_response()
}

/// Send the backend's refusal back to the caller. Framing fields are left
/// to the host server since the body is re-sent from memory.
///
/// The body is only what the WebSocket library had buffered past the
/// response headers when it gave up on the handshake. A large rejection body
/// arrives truncated and its framing is recomputed for the captured part.
fn relay_rejection(session_id: &str, rejected: RejectedHandshake) -> Response {
    let mut headers = rejected.headers;
    let announced = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if let Some(announced) = announced.filter(|len| *len > rejected.body.len()) {
        tracing::warn!(
            session_id = %session_id,
            announced,
            captured = rejected.body.len(),
            "websocketproxy: backend rejection body truncated"
        );
    }
    for name in [CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING] {
        headers.remove(name);
    }

    let mut response = Response::new(Body::from(rejected.body));
    *response.status_mut() = rejected.status;
    *response.headers_mut() = headers;
    response
}
