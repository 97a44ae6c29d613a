//! Proxy configuration and the embedder-supplied capabilities.
//!
//! # Capabilities
//! - [`Director`]: last word on the outbound request headers
//! - [`Viewer`]: receives backend text payloads the proxy intercepts
//! - [`Manager`]: session registry, told when a session ends
//! - [`Dialer`]: opens the backend connection
//! - [`Upgrader`]: completes the client upgrade
//!
//! Plain closures work for the first three.

use std::sync::Arc;

use axum::body::Body;
use axum::http::request::Parts;
use axum::http::{HeaderMap, Request};
use axum::response::Response;
use futures_util::future::BoxFuture;
use url::Url;

use crate::proxy::connection::WsConnection;
use crate::proxy::error::{DialError, UpgradeError};

/// Adjusts the outbound handshake headers before the backend is dialed.
pub trait Director: Send + Sync {
    fn adjust_headers(&self, request: &Parts, headers: &mut HeaderMap);
}

impl<F> Director for F
where
    F: Fn(&Parts, &mut HeaderMap) + Send + Sync,
{
    fn adjust_headers(&self, request: &Parts, headers: &mut HeaderMap) {
        self(request, headers)
    }
}

/// Observes text messages read from the backend.
///
/// Runs inline in the relay loop, so it must return quickly.
pub trait Viewer: Send + Sync {
    fn handle_message(&self, payload: &[u8]);
}

impl<F> Viewer for F
where
    F: Fn(&[u8]) + Send + Sync,
{
    fn handle_message(&self, payload: &[u8]) {
        self(payload)
    }
}

/// Registry of live sessions keyed by their unique id.
pub trait Manager: Send + Sync {
    fn remove_connection(&self, id: &str);
}

impl<F> Manager for F
where
    F: Fn(&str) + Send + Sync,
{
    fn remove_connection(&self, id: &str) {
        self(id)
    }
}

/// A successfully established backend connection.
pub struct Dialed {
    pub connection: WsConnection,
    /// Headers of the backend's `101` handshake response.
    pub response_headers: HeaderMap,
}

/// Opens the outbound WebSocket connection.
pub trait Dialer: Send + Sync {
    fn dial(&self, url: Url, headers: HeaderMap) -> BoxFuture<'static, Result<Dialed, DialError>>;
}

/// Resolves to the client connection once the server hands over the socket.
pub type PendingUpgrade = BoxFuture<'static, Result<WsConnection, UpgradeError>>;

/// Completes the inbound upgrade.
///
/// Returns the handshake response to send back to the client together with
/// a future yielding the upgraded connection. The future only resolves after
/// the response has been written by the host server.
pub trait Upgrader: Send + Sync {
    fn upgrade(
        &self,
        request: &mut Request<Body>,
        headers: HeaderMap,
    ) -> Result<(Response, PendingUpgrade), UpgradeError>;
}

/// Maps an inbound request to the backend URL to dial.
pub type BackendResolver = Arc<dyn Fn(&Parts) -> Option<Url> + Send + Sync>;

/// Everything a proxy instance needs. Immutable once the proxy is built.
#[derive(Clone, Default)]
pub struct ProxyOptions {
    /// Session identifier handed to [`Manager::remove_connection`].
    pub unique_id: String,
    /// Backend base URL; scheme, host and port are kept, the path and query
    /// come from the inbound request.
    pub url: Option<Url>,
    /// Forward the full header set instead of the allow-listed subset.
    pub natural_tunnel: bool,
    pub director: Option<Arc<dyn Director>>,
    pub viewer: Option<Arc<dyn Viewer>>,
    pub manager: Option<Arc<dyn Manager>>,
    pub dialer: Option<Arc<dyn Dialer>>,
    pub upgrader: Option<Arc<dyn Upgrader>>,
}

impl ProxyOptions {
    /// Options for a session proxied to `url` with every collaborator left at
    /// its default.
    pub fn new(unique_id: impl Into<String>, url: Url) -> Self {
        Self {
            unique_id: unique_id.into(),
            url: Some(url),
            ..Self::default()
        }
    }

    pub fn with_natural_tunnel(mut self, enabled: bool) -> Self {
        self.natural_tunnel = enabled;
        self
    }

    pub fn with_director(mut self, director: impl Director + 'static) -> Self {
        self.director = Some(Arc::new(director));
        self
    }

    pub fn with_viewer(mut self, viewer: impl Viewer + 'static) -> Self {
        self.viewer = Some(Arc::new(viewer));
        self
    }

    pub fn with_manager(mut self, manager: Arc<dyn Manager>) -> Self {
        self.manager = Some(manager);
        self
    }

    pub fn with_dialer(mut self, dialer: impl Dialer + 'static) -> Self {
        self.dialer = Some(Arc::new(dialer));
        self
    }

    pub fn with_upgrader(mut self, upgrader: impl Upgrader + 'static) -> Self {
        self.upgrader = Some(Arc::new(upgrader));
        self
    }
}

impl std::fmt::Debug for ProxyOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyOptions")
            .field("unique_id", &self.unique_id)
            .field("url", &self.url.as_ref().map(Url::as_str))
            .field("natural_tunnel", &self.natural_tunnel)
            .field("director", &self.director.is_some())
            .field("viewer", &self.viewer.is_some())
            .field("manager", &self.manager.is_some())
            .field("dialer", &self.dialer.is_some())
            .field("upgrader", &self.upgrader.is_some())
            .finish()
    }
}
