//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! proxy sessions and the host server produce:
//!     → tracing events (logging.rs installs the subscriber)
//!     → metrics (metrics.rs, exported for Prometheus scrapes)
//! ```
//!
//! # Design Decisions
//! - Structured fields (`session_id`, `direction`, `backend_url`) on every event
//! - Installing a subscriber or recorder is left to the embedding binary

pub mod logging;
pub mod metrics;

pub use logging::{LogInit, LogInitError, LogLevel};
