//! HTTP host server subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, request ID, tracing)
//!     → one HalfDuplexProxy per request, registered in registry.rs
//!     → 101 / error response to the client
//!     → proxy removes itself from the registry when its session ends
//! ```

pub mod registry;
pub mod server;

pub use registry::SessionRegistry;
pub use server::{HttpServer, X_REQUEST_ID};
