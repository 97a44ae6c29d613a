//! Backend resolution and dialing.
//!
//! # Responsibilities
//! - Derive the backend URL for an inbound request
//! - Open the outbound WebSocket connection with the negotiated headers
//! - Tell a rejected handshake apart from an unreachable backend

use std::sync::Arc;

use axum::http::request::Parts;
use axum::http::HeaderMap;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Error as WsError;
use url::Url;

use crate::proxy::connection::WsConnection;
use crate::proxy::error::{DialError, RejectedHandshake};
use crate::proxy::options::{BackendResolver, Dialed, Dialer};

/// Resolver that keeps `base`'s scheme, host and port and takes the path and
/// query from the inbound request.
pub fn resolver_for(base: Url) -> BackendResolver {
    Arc::new(move |request: &Parts| Some(backend_url(&base, request)))
}

/// Overlay the inbound request target onto the configured backend URL.
pub fn backend_url(base: &Url, request: &Parts) -> Url {
    let mut url = base.clone();
    url.set_path(request.uri.path());
    url.set_query(request.uri.query());
    url.set_fragment(None);
    url
}

/// Dialer backed by `tokio_tungstenite::connect_async`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteDialer;

impl Dialer for TungsteniteDialer {
    fn dial(&self, url: Url, headers: HeaderMap) -> BoxFuture<'static, Result<Dialed, DialError>> {
        connect(url, headers).boxed()
    }
}

async fn connect(url: Url, headers: HeaderMap) -> Result<Dialed, DialError> {
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(DialError::Transport)?;
    merge_headers(request.headers_mut(), headers);

    match tokio_tungstenite::connect_async(request).await {
        Ok((socket, response)) => Ok(Dialed {
            connection: WsConnection::new(socket),
            response_headers: response.headers().clone(),
        }),
        Err(WsError::Http(response)) => Err(DialError::Rejected(Box::new(RejectedHandshake {
            status: response.status(),
            headers: response.headers().clone(),
            body: response.body().clone().unwrap_or_default().into(),
        }))),
        Err(err) => Err(DialError::Transport(err)),
    }
}

/// Copy `extra` over the library-generated handshake request, replacing any
/// field present in both (e.g. `Host`).
fn merge_headers(target: &mut HeaderMap, extra: HeaderMap) {
    let mut current = None;
    for (name, value) in extra {
        let name = match name {
            Some(name) => {
                target.remove(&name);
                current = Some(name.clone());
                name
            }
            None => match current.clone() {
                Some(name) => name,
                None => continue,
            },
        };
        target.append(name, value);
    }
}
