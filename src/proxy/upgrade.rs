//! Client-side protocol upgrade on top of hyper's connection hand-over.

use axum::body::Body;
use axum::http::header::{
    CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION, UPGRADE,
};
use axum::http::{HeaderMap, HeaderValue, Method, Request, StatusCode};
use axum::response::Response;
use futures_util::FutureExt;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;

use crate::proxy::connection::WsConnection;
use crate::proxy::error::UpgradeError;
use crate::proxy::options::{PendingUpgrade, Upgrader};

/// Upgrades requests served by hyper (and therefore axum).
///
/// Requires the host server to keep connections upgradable, which
/// `axum::serve` does.
#[derive(Debug, Clone, Copy, Default)]
pub struct HyperUpgrader;

impl Upgrader for HyperUpgrader {
    fn upgrade(
        &self,
        request: &mut Request<Body>,
        headers: HeaderMap,
    ) -> Result<(Response, PendingUpgrade), UpgradeError> {
        let key = validate_request(request)?;

        let on_upgrade = request
            .extensions_mut()
            .remove::<OnUpgrade>()
            .ok_or(UpgradeError::NotUpgradable)?;

        let response = switching_protocols(&key, headers)?;

        Ok((response, complete_upgrade(on_upgrade).boxed()))
    }
}

async fn complete_upgrade(on_upgrade: OnUpgrade) -> Result<WsConnection, UpgradeError> {
    let upgraded = on_upgrade.await?;
    let socket = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
    Ok(WsConnection::new(socket))
}

/// Check the client's handshake and return its `Sec-WebSocket-Key`.
fn validate_request(request: &Request<Body>) -> Result<HeaderValue, UpgradeError> {
    if request.method() != Method::GET {
        return Err(UpgradeError::MethodNotGet);
    }

    let headers = request.headers();
    if !header_contains_token(headers, &CONNECTION, "upgrade") {
        return Err(UpgradeError::InvalidHeader("Connection"));
    }
    if !header_contains_token(headers, &UPGRADE, "websocket") {
        return Err(UpgradeError::InvalidHeader("Upgrade"));
    }
    if headers.get(SEC_WEBSOCKET_VERSION).map(|v| v.as_bytes()) != Some(b"13".as_slice()) {
        return Err(UpgradeError::InvalidHeader("Sec-WebSocket-Version"));
    }

    headers
        .get(SEC_WEBSOCKET_KEY)
        .filter(|key| !key.is_empty())
        .cloned()
        .ok_or(UpgradeError::InvalidHeader("Sec-WebSocket-Key"))
}

fn header_contains_token(headers: &HeaderMap, name: &axum::http::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

/// Build the `101` response. The accept value is always derived from the
/// client's key; a negotiated `Sec-WebSocket-Accept` belongs to the backend
/// hop and is replaced. Extensions are never negotiated on the client hop.
fn switching_protocols(key: &HeaderValue, negotiated: HeaderMap) -> Result<Response, UpgradeError> {
    let mut response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .body(Body::empty())?;

    let headers = response.headers_mut();
    headers.extend(negotiated);
    headers.remove(SEC_WEBSOCKET_EXTENSIONS);

    // At most one subprotocol can be selected.
    if let Some(protocol) = headers.get(SEC_WEBSOCKET_PROTOCOL).cloned() {
        headers.insert(SEC_WEBSOCKET_PROTOCOL, protocol);
    }

    headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    let accept = HeaderValue::from_str(&derive_accept_key(key.as_bytes()))
        .map_err(axum::http::Error::from)?;
    headers.insert(SEC_WEBSOCKET_ACCEPT, accept);

    Ok(response)
}
