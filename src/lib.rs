//! Half-duplex WebSocket reverse proxy library.
//!
//! Embed [`HalfDuplexProxy`] in any hyper/axum server, or run the bundled
//! host server (`src/main.rs`).

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod proxy;

pub use config::ServerConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use proxy::{HalfDuplexProxy, ProxyError, ProxyOptions, WebsocketProxy};
