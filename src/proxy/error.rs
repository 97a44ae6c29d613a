//! Error types for the proxy core.

use std::time::Duration;

use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use thiserror::Error;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Error as WsError;

/// Errors surfaced by a running session: relay loops, the control-frame
/// bridge and the out-of-band send API.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The client connection has not been upgraded yet, or was already closed.
    #[error("websocketproxy: connection not established")]
    NotEstablished,

    /// The peer signalled a close with a structured close frame.
    #[error("websocket: close {} {reason}", close_code_u16(.code))]
    Closed { code: CloseCode, reason: String },

    /// A control frame could not be written before its deadline.
    #[error("control frame deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    /// Transport or protocol failure reported by the WebSocket library.
    #[error(transparent)]
    Transport(#[from] WsError),
}

impl ProxyError {
    /// Returns the close code when this error is a structured close.
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            ProxyError::Closed { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// A structured close that is not an abnormal closure is the expected way
    /// for a session to end and is not worth an error log.
    pub fn is_expected_close(&self) -> bool {
        matches!(self.close_code(), Some(code) if code != CloseCode::Abnormal)
    }
}

fn close_code_u16(code: &CloseCode) -> u16 {
    u16::from(*code)
}

/// Outcome of a failed backend dial.
#[derive(Debug, Error)]
pub enum DialError {
    /// The backend answered the handshake with something other than `101`.
    #[error("backend rejected websocket handshake with status {}", .0.status)]
    Rejected(Box<RejectedHandshake>),

    /// No response was obtained from the backend.
    #[error("couldn't dial backend: {0}")]
    Transport(#[source] WsError),
}

/// The backend's non-upgrade response, relayed verbatim to the caller.
#[derive(Debug, Clone)]
pub struct RejectedHandshake {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Failure to complete the inbound protocol upgrade.
#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("websocket: request method is not GET")]
    MethodNotGet,

    #[error("websocket: missing or invalid `{0}` header")]
    InvalidHeader(&'static str),

    #[error("websocket: connection does not support upgrades")]
    NotUpgradable,

    #[error("websocket: upgrade failed: {0}")]
    Hyper(#[from] hyper::Error),

    #[error("websocket: could not build handshake response: {0}")]
    Response(#[from] axum::http::Error),
}
