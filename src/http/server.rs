//! HTTP host server for the proxy.
//!
//! # Responsibilities
//! - Create the Axum Router; every path is a proxy endpoint
//! - Wire up middleware (request ID, tracing, body limit)
//! - Build one fresh proxy per inbound request and register it
//! - Bind to the listener with connection info for `X-Forwarded-For`
//! - On shutdown, stop accepting and close live sessions

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderName, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use url::Url;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::http::registry::SessionRegistry;
use crate::lifecycle::Shutdown;
use crate::proxy::{HalfDuplexProxy, ProxyOptions};

/// Header carrying the request ID. Logged with the session, never used as
/// its key.
pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Handshake requests carry no body worth reading.
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub backend: Url,
    pub natural_tunnel: bool,
    pub sessions: Arc<SessionRegistry>,
}

/// HTTP server hosting one proxy per upgrade request.
pub struct HttpServer {
    router: Router,
    sessions: Arc<SessionRegistry>,
}

impl HttpServer {
    /// Create a server for a validated configuration.
    pub fn new(config: &ServerConfig) -> Result<Self, url::ParseError> {
        let backend = Url::parse(&config.backend.url)?;
        let sessions = Arc::new(SessionRegistry::new());
        let state = AppState {
            backend,
            natural_tunnel: config.backend.natural_tunnel,
            sessions: Arc::clone(&sessions),
        };

        Ok(Self {
            router: Self::build_router(state),
            sessions,
        })
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(state: AppState) -> Router {
        Router::new()
            .route("/", any(proxy_handler))
            .route("/{*path}", any(proxy_handler))
            .with_state(state)
            .layer(
                ServiceBuilder::new()
                    .layer(SetRequestIdLayer::new(X_REQUEST_ID, MakeRequestUuid))
                    .layer(TraceLayer::new_for_http())
                    .layer(PropagateRequestIdLayer::new(X_REQUEST_ID))
                    .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES)),
            )
    }

    pub fn sessions(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.sessions)
    }

    /// Run the server until `shutdown` is triggered.
    pub async fn run(self, listener: TcpListener, shutdown: Shutdown) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        // Upgraded connections outlive the HTTP layer; close them explicitly.
        let sweeper = {
            let sessions = Arc::clone(&self.sessions);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                shutdown.wait().await;
                sessions.close_all().await;
            })
        };

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.wait().await })
            .await?;

        if let Err(err) = sweeper.await {
            tracing::error!(error = %err, "Session sweeper failed");
        }

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Proxy a single inbound request.
async fn proxy_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    // Session ids are minted here; the inbound request id is client-controlled.
    let session_id = Uuid::new_v4().to_string();
    let request_id = request
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();

    tracing::debug!(
        session_id = %session_id,
        request_id = %request_id,
        path = %request.uri().path(),
        "Proxying request"
    );

    let viewer_id = session_id.clone();
    let options = ProxyOptions::new(session_id.clone(), state.backend.clone())
        .with_natural_tunnel(state.natural_tunnel)
        .with_manager(state.sessions.clone())
        .with_viewer(move |payload: &[u8]| {
            tracing::trace!(session_id = %viewer_id, bytes = payload.len(), "Backend message intercepted");
        });

    let proxy = Arc::new(HalfDuplexProxy::new(options));
    if !state.sessions.insert(session_id, Arc::clone(&proxy)) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "session id collision").into_response();
    }
    proxy.serve(request).await
}
