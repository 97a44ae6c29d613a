//! Lifecycle management for the host server.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//!
//! Shutdown (shutdown.rs):
//!     trigger → stop accepting → close live sessions → exit
//! ```

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
