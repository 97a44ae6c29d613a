//! Registry of live proxy sessions.
//!
//! # Responsibilities
//! - Track every proxy the host server created, keyed by session id
//! - Forget a session when its proxy reports termination
//! - Close everything still running on shutdown

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::proxy::{HalfDuplexProxy, Manager};

/// How long `close_all` waits for each session to wind down.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Live sessions, shared between request handlers and the proxies
/// themselves (as their [`Manager`]).
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<HalfDuplexProxy>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. An id that is already live is refused and the
    /// existing entry is left in place.
    pub fn insert(&self, id: impl Into<String>, proxy: Arc<HalfDuplexProxy>) -> bool {
        match self.sessions.entry(id.into()) {
            Entry::Occupied(entry) => {
                tracing::warn!(session_id = %entry.key(), "Session id already registered");
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(proxy);
                true
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<HalfDuplexProxy>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Close every live session and wait for each to end.
    pub async fn close_all(&self) {
        // Snapshot first: proxies remove themselves while we wait.
        let proxies: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        tracing::info!(sessions = proxies.len(), "Closing live sessions");
        for proxy in proxies {
            proxy.close_proxy().await;
            if tokio::time::timeout(CLOSE_GRACE, proxy.closed()).await.is_err() {
                tracing::warn!(session_id = %proxy.unique_id(), "Session did not close in time");
                self.sessions.remove(proxy.unique_id());
            }
        }
    }
}

impl Manager for SessionRegistry {
    fn remove_connection(&self, id: &str) {
        if self.sessions.remove(id).is_some() {
            tracing::debug!(session_id = %id, remaining = self.sessions.len(), "Session removed");
        }
    }
}
