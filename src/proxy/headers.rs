//! Handshake header negotiation for both legs of the proxy.
//!
//! # Responsibilities
//! - Build the header set sent to the backend when dialing
//! - Build the header set returned to the client in the `101` response
//! - Annotate `X-Forwarded-For` and `X-Forwarded-Proto`
//!
//! # Modes
//! - Natural tunnel: clone everything, then strip fields the WebSocket
//!   library re-adds itself and the classic hop-by-hop fields
//! - Default: copy a small allow-list only

use std::net::SocketAddr;

use axum::extract::ConnectInfo;
use axum::http::header::{
    CONNECTION, COOKIE, HOST, ORIGIN, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, SEC_WEBSOCKET_ACCEPT,
    SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION,
    SET_COOKIE, TE, TRAILER, TRANSFER_ENCODING, UPGRADE, USER_AGENT,
};
use axum::http::request::Parts;
use axum::http::uri::Scheme;
use axum::http::{HeaderMap, HeaderName, HeaderValue};

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");

/// Fields the WebSocket library writes on its own during the handshake.
const HANDSHAKE_HEADERS: [HeaderName; 5] = [
    CONNECTION,
    SEC_WEBSOCKET_EXTENSIONS,
    SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_VERSION,
    UPGRADE,
];

/// Hop-by-hop fields that never cross the proxy.
const HOP_BY_HOP_HEADERS: [HeaderName; 6] = [
    KEEP_ALIVE,
    TRANSFER_ENCODING,
    TE,
    TRAILER,
    PROXY_AUTHORIZATION,
    PROXY_AUTHENTICATE,
];

/// Marker extension the host server inserts on requests that arrived over TLS.
#[derive(Debug, Clone, Copy, Default)]
pub struct TlsConnection;

/// Headers for the outbound (backend) handshake request.
///
/// The Director runs afterwards and may still add or override entries.
pub fn request_headers(request: &Parts, natural_tunnel: bool) -> HeaderMap {
    let mut headers = if natural_tunnel {
        let mut headers = request.headers.clone();
        strip_tunnel_headers(&mut headers);
        headers
    } else {
        allow_listed_request_headers(request)
    };

    annotate_forwarded(request, &mut headers);
    headers
}

/// Headers for the `101` response sent to the client, derived from the
/// backend's handshake response.
pub fn upgrade_headers(backend_response: &HeaderMap, natural_tunnel: bool) -> HeaderMap {
    if natural_tunnel {
        let mut headers = backend_response.clone();
        strip_tunnel_headers(&mut headers);
        return headers;
    }

    let mut headers = HeaderMap::new();
    for name in [SEC_WEBSOCKET_PROTOCOL, SET_COOKIE, SEC_WEBSOCKET_ACCEPT] {
        if let Some(value) = first_non_empty(backend_response, &name) {
            headers.insert(name, value.clone());
        }
    }
    headers
}

fn strip_tunnel_headers(headers: &mut HeaderMap) {
    for name in HANDSHAKE_HEADERS.iter().chain(HOP_BY_HOP_HEADERS.iter()) {
        headers.remove(name);
    }
}

fn allow_listed_request_headers(request: &Parts) -> HeaderMap {
    let mut headers = HeaderMap::new();

    for name in [USER_AGENT, ORIGIN] {
        if let Some(value) = first_non_empty(&request.headers, &name) {
            headers.append(name, value.clone());
        }
    }
    for name in [SEC_WEBSOCKET_PROTOCOL, COOKIE] {
        for value in request.headers.get_all(&name) {
            headers.append(name.clone(), value.clone());
        }
    }
    if let Some(host) = inbound_host(request) {
        headers.insert(HOST, host);
    }

    headers
}

/// The host the client asked for: the request target's authority if it is
/// absolute, otherwise the `Host` header.
fn inbound_host(request: &Parts) -> Option<HeaderValue> {
    if let Some(authority) = request.uri.authority() {
        return HeaderValue::from_str(authority.as_str()).ok();
    }
    first_non_empty(&request.headers, &HOST).cloned()
}

fn first_non_empty<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a HeaderValue> {
    headers.get(name).filter(|value| !value.is_empty())
}

fn annotate_forwarded(request: &Parts, headers: &mut HeaderMap) {
    if let Some(ConnectInfo(peer)) = request.extensions.get::<ConnectInfo<SocketAddr>>() {
        let mut chain: Vec<&str> = request
            .headers
            .get_all(&X_FORWARDED_FOR)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect();
        let client_ip = peer.ip().to_string();
        chain.push(&client_ip);

        if let Ok(value) = HeaderValue::from_str(&chain.join(", ")) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }

    let proto = if is_tls(request) { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));
}

fn is_tls(request: &Parts) -> bool {
    request.extensions.get::<TlsConnection>().is_some()
        || request.uri.scheme() == Some(&Scheme::HTTPS)
}
