//! Half-duplex WebSocket reverse proxy.
//!
//! # Data Flow
//! ```text
//! client ──upgrade──▶ session.rs ──dial──▶ backend.rs ──▶ backend
//!                        │
//!                        ├─ headers.rs  (request / upgrade header sets)
//!                        ├─ upgrade.rs  (101 to the client)
//!                        └─ relay.rs    (two copy loops)
//!                              ├─ client → backend: forwarded verbatim
//!                              └─ backend → client: text to the Viewer
//! ```
//!
//! The proxy core never writes to the client on its own. Backend traffic
//! reaches the client only through [`WebsocketProxy::send`] and
//! [`WebsocketProxy::send_typed`].

pub mod backend;
pub mod connection;
pub mod control;
pub mod error;
pub mod headers;
pub mod options;
pub mod relay;
pub mod session;
pub mod upgrade;

pub use backend::TungsteniteDialer;
pub use connection::WsConnection;
pub use error::{DialError, ProxyError, RejectedHandshake, UpgradeError};
pub use headers::TlsConnection;
pub use options::{BackendResolver, Dialed, Dialer, Director, Manager, ProxyOptions, Upgrader, Viewer};
pub use relay::{Direction, HalfDuplex, Passthrough, RelayPolicy, Route};
pub use session::{HalfDuplexProxy, WebsocketProxy};
pub use upgrade::HyperUpgrader;
