//! Directional copy loops.
//!
//! # Responsibilities
//! - Read one peer message by message, in order
//! - Forward each message to the other peer or hand it to the Viewer,
//!   depending on the [`RelayPolicy`]
//! - Turn a read failure into a close frame for the other peer
//! - Stop on request, telling the other peer the proxy closed the session
//!
//! # Data Flow (half duplex)
//! ```text
//! Client ──── forward ────▶ Backend
//! Client      (nothing)  ◀─ Backend ──▶ Viewer
//! ```

use std::fmt;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::observability::metrics;
use crate::proxy::connection::{MessageStream, WsConnection};
use crate::proxy::control;
use crate::proxy::error::ProxyError;
use crate::proxy::options::Viewer;

/// Longest close reason that fits a control frame.
const MAX_CLOSE_REASON: usize = 123;

const CLOSED_BY_PROXY: &str = "Closed by proxy";

/// Which way a copy loop moves messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ClientToBackend,
    BackendToClient,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ClientToBackend => "client_to_backend",
            Direction::BackendToClient => "backend_to_client",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happens to a data message read in one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Written verbatim to the opposite peer.
    Forward,
    /// Text payloads go to the Viewer; nothing is written.
    Intercept,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Forward => "forward",
            Route::Intercept => "intercept",
        }
    }
}

/// Decides per direction whether messages are forwarded or intercepted.
pub trait RelayPolicy: Send + Sync + 'static {
    fn route(&self, direction: Direction) -> Route;
}

/// Client traffic is tunnelled to the backend; backend traffic is only shown
/// to the Viewer and the application decides what reaches the client.
#[derive(Debug, Clone, Copy, Default)]
pub struct HalfDuplex;

impl RelayPolicy for HalfDuplex {
    fn route(&self, direction: Direction) -> Route {
        match direction {
            Direction::ClientToBackend => Route::Forward,
            Direction::BackendToClient => Route::Intercept,
        }
    }
}

/// Both directions are tunnelled.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl RelayPolicy for Passthrough {
    fn route(&self, _direction: Direction) -> Route {
        Route::Forward
    }
}

/// One direction of a session.
pub(crate) struct CopyLoop {
    pub direction: Direction,
    pub route: Route,
    /// The peer being read. Needed to answer client pings.
    pub source: Arc<WsConnection>,
    pub destination: Arc<WsConnection>,
    pub viewer: Option<Arc<dyn Viewer>>,
    pub stop: watch::Receiver<bool>,
    pub session_id: Arc<str>,
}

impl CopyLoop {
    /// Run until the source fails, the destination refuses a write, or the
    /// stop signal is raised. Stopping is not an error.
    ///
    /// `reader` is the read half of `source`; the stream is not `Sync`, so it
    /// is owned by the future rather than borrowed through `self`.
    pub async fn run(mut self, mut reader: MessageStream) -> Result<(), ProxyError> {
        loop {
            let next = tokio::select! {
                biased;
                _ = stop_requested(&mut self.stop) => {
                    self.write_close(proxy_close()).await;
                    tracing::debug!(session_id = %self.session_id, direction = %self.direction, "relay stopped");
                    return Ok(());
                }
                next = reader.next() => next,
            };

            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(err)) => return Err(self.fail(err.into()).await),
                None => return Err(self.fail(WsError::ConnectionClosed.into()).await),
            };

            match message {
                Message::Close(frame) => {
                    let (code, reason) = frame
                        .map(|frame| (frame.code, frame.reason.as_str().to_owned()))
                        .unwrap_or((CloseCode::Status, String::new()));
                    return Err(self.fail(ProxyError::Closed { code, reason }).await);
                }
                Message::Ping(payload) => {
                    if self.direction == Direction::ClientToBackend {
                        if let Err(err) =
                            control::bridge_client_ping(&self.source, &self.destination, payload).await
                        {
                            return Err(self.fail(err).await);
                        }
                    }
                }
                Message::Pong(_) | Message::Frame(_) => {}
                message => self.deliver(message).await?,
            }
        }
    }

    async fn deliver(&self, message: Message) -> Result<(), ProxyError> {
        metrics::record_message(self.direction, self.route);

        match self.route {
            Route::Forward => self.destination.write_message(message).await?,
            Route::Intercept => {
                if let (Message::Text(text), Some(viewer)) = (&message, &self.viewer) {
                    viewer.handle_message(text.as_bytes());
                }
            }
        }
        Ok(())
    }

    /// Tell the destination why the source went away, then hand back the
    /// error for the session to report.
    async fn fail(&self, err: ProxyError) -> ProxyError {
        self.write_close(close_frame_for(&err)).await;
        err
    }

    async fn write_close(&self, frame: Message) {
        if let Err(err) = self.destination.write_message(frame).await {
            tracing::trace!(
                session_id = %self.session_id,
                direction = %self.direction,
                error = %err,
                "close frame not delivered"
            );
        }
    }
}

/// Resolves once the stop signal is raised or its sender is gone.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

/// The close frame sent to the other peer when a read fails: the peer's own
/// close code and reason when it sent one, otherwise a normal closure
/// carrying the error text.
pub(crate) fn close_frame_for(err: &ProxyError) -> Message {
    let (code, reason) = match err {
        ProxyError::Closed { code, reason } if *code != CloseCode::Status => (*code, reason.clone()),
        other => (CloseCode::Normal, other.to_string()),
    };
    Message::Close(Some(CloseFrame {
        code,
        reason: clip_reason(reason).into(),
    }))
}

fn proxy_close() -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: CLOSED_BY_PROXY.into(),
    }))
}

fn clip_reason(mut reason: String) -> String {
    if reason.len() > MAX_CLOSE_REASON {
        let mut end = MAX_CLOSE_REASON;
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        reason.truncate(end);
    }
    reason
}
