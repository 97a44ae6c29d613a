//! Control-frame bridging between the client and the backend.
//!
//! Client pings are forwarded to the backend and answered to the client.
//! The answer is the pong the WebSocket library queued when it read the
//! ping; the bridge only flushes it. Backend pings get the library's default
//! auto-pong and nothing else.

use std::io;
use std::time::Duration;

use axum::body::Bytes;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::proxy::connection::WsConnection;
use crate::proxy::error::ProxyError;

/// Deadline for every control frame the bridge writes.
pub const CONTROL_DEADLINE: Duration = Duration::from_secs(1);

/// Handle a ping received from the client.
///
/// A failure to reach the backend is returned to the caller. A failure to
/// answer the client is ignored when the client is already closing or the
/// error is transient.
pub async fn bridge_client_ping(
    client: &WsConnection,
    backend: &WsConnection,
    payload: Bytes,
) -> Result<(), ProxyError> {
    backend
        .write_control(Message::Ping(payload), CONTROL_DEADLINE)
        .await?;

    match client.flush(CONTROL_DEADLINE).await {
        Ok(()) => Ok(()),
        Err(err) if is_tolerated(&err) => {
            tracing::trace!(error = %err, "pong to client skipped");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Conditions under which a pong that could not be written is not an error.
fn is_tolerated(err: &ProxyError) -> bool {
    match err {
        ProxyError::DeadlineExceeded(_) => true,
        ProxyError::Transport(WsError::ConnectionClosed | WsError::AlreadyClosed) => true,
        ProxyError::Transport(WsError::Io(io_err)) => is_transient(io_err),
        _ => false,
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::connection::testing::pair;

    #[tokio::test]
    async fn ping_is_forwarded_to_backend() {
        let (client, _client_peer) = pair();
        let (backend, mut backend_peer) = pair();

        bridge_client_ping(&client, &backend, Bytes::from_static(b"hb"))
            .await
            .unwrap();

        assert_eq!(
            backend_peer.written.recv().await.unwrap(),
            Message::Ping(Bytes::from_static(b"hb"))
        );
    }

    #[tokio::test]
    async fn unreachable_backend_fails_the_bridge() {
        let (client, _client_peer) = pair();
        let (backend, backend_peer) = pair();
        drop(backend_peer);

        let err = bridge_client_ping(&client, &backend, Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Transport(WsError::ConnectionClosed)));
    }

    #[test]
    fn closed_and_transient_client_failures_are_tolerated() {
        assert!(is_tolerated(&ProxyError::Transport(WsError::AlreadyClosed)));
        assert!(is_tolerated(&ProxyError::Transport(WsError::ConnectionClosed)));
        assert!(is_tolerated(&ProxyError::DeadlineExceeded(CONTROL_DEADLINE)));
        assert!(is_tolerated(&ProxyError::Transport(WsError::Io(io::Error::from(
            io::ErrorKind::TimedOut
        )))));
        assert!(!is_tolerated(&ProxyError::Transport(WsError::Io(io::Error::from(
            io::ErrorKind::BrokenPipe
        )))));
        assert!(!is_tolerated(&ProxyError::NotEstablished));
    }
}
