//! Metrics collection and exposition.
//!
//! # Metrics
//! - `wsproxy_sessions_total` (counter): finished sessions by `outcome`
//! - `wsproxy_active_sessions` (gauge): sessions currently relaying
//! - `wsproxy_messages_total` (counter): relayed messages by `direction`, `route`
//! - `wsproxy_dial_failures_total` (counter): backend dial failures by `kind`
//!
//! Recording is a no-op until a recorder is installed, so library users who
//! never call [`init_exporter`] pay nothing beyond the macro call.

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::proxy::relay::{Direction, Route};

/// Install the Prometheus recorder and serve it on `addr`.
///
/// Must be called from within a Tokio runtime.
pub fn init_exporter(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_message(direction: Direction, route: Route) {
    counter!(
        "wsproxy_messages_total",
        "direction" => direction.as_str(),
        "route" => route.as_str()
    )
    .increment(1);
}

pub fn record_session_opened() {
    gauge!("wsproxy_active_sessions").increment(1.0);
}

pub fn record_session_closed() {
    gauge!("wsproxy_active_sessions").decrement(1.0);
}

/// `outcome` is one of `closed`, `error`, `stopped`, `rejected` or
/// `upgrade_failed`.
pub fn record_session_outcome(outcome: &'static str) {
    counter!("wsproxy_sessions_total", "outcome" => outcome).increment(1);
}

pub fn record_dial_failure(kind: &'static str) {
    counter!("wsproxy_dial_failures_total", "kind" => kind).increment(1);
}
