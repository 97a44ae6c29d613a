//! A single WebSocket peer as seen by the proxy.
//!
//! # Responsibilities
//! - Own the write half behind an async mutex (one writer at a time)
//! - Hand the read half to exactly one relay loop
//! - Apply deadlines to control frames
//!
//! # Design Decisions
//! - The transport is type-erased so dialers, upgraders and tests can hand
//!   over any `Stream + Sink` of tungstenite messages
//! - Ordinary message writes carry no deadline; a hung peer stalls only the
//!   direction writing to it

use std::pin::Pin;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::proxy::error::ProxyError;

/// Type-erased write half of a WebSocket connection.
pub type MessageSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;

/// Type-erased read half of a WebSocket connection.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

/// An upgraded WebSocket connection.
pub struct WsConnection {
    writer: Mutex<MessageSink>,
    reader: StdMutex<Option<MessageStream>>,
}

impl WsConnection {
    /// Wrap a full-duplex WebSocket stream, e.g. a `WebSocketStream`.
    pub fn new<S>(socket: S) -> Self
    where
        S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Send + 'static,
    {
        let (writer, reader) = socket.split();
        Self::from_parts(Box::pin(writer), Box::pin(reader))
    }

    /// Build a connection from independently produced halves.
    pub fn from_parts(writer: MessageSink, reader: MessageStream) -> Self {
        Self {
            writer: Mutex::new(writer),
            reader: StdMutex::new(Some(reader)),
        }
    }

    /// Take the read half. Only the first caller gets it.
    pub(crate) fn take_reader(&self) -> Option<MessageStream> {
        self.reader.lock().ok().and_then(|mut guard| guard.take())
    }

    /// Write one message, waiting for any concurrent writer to finish first.
    pub async fn write_message(&self, message: Message) -> Result<(), WsError> {
        let mut writer = self.writer.lock().await;
        writer.send(message).await
    }

    /// Write a control frame, giving up once `deadline` has elapsed.
    pub async fn write_control(&self, message: Message, deadline: Duration) -> Result<(), ProxyError> {
        match tokio::time::timeout(deadline, self.write_message(message)).await {
            Ok(result) => result.map_err(ProxyError::from),
            Err(_) => Err(ProxyError::DeadlineExceeded(deadline)),
        }
    }

    /// Flush frames queued by the library itself (e.g. automatic pongs).
    pub async fn flush(&self, deadline: Duration) -> Result<(), ProxyError> {
        let flush = async {
            let mut writer = self.writer.lock().await;
            writer.flush().await
        };
        match tokio::time::timeout(deadline, flush).await {
            Ok(result) => result.map_err(ProxyError::from),
            Err(_) => Err(ProxyError::DeadlineExceeded(deadline)),
        }
    }

    /// Close the write half. Errors from an already closed peer are ignored.
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(err) = writer.close().await {
            tracing::trace!(error = %err, "close on websocket connection failed");
        }
    }
}

impl std::fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnection").finish_non_exhaustive()
    }
}
