//! Client session bookkeeping (spec §3 Session, §4.4 Session Store, §9
//! "session ids are never trusted from the client").
//!
//! The wire-level Streamable HTTP session lifecycle (id issuance, the
//! `Mcp-Session-Id` header, per-session event stream) is handled by rmcp's
//! own session manager on the transport layer. This module is the gateway's
//! own view of that same set of sessions: it exists so the admin surface can
//! list active sessions and so idle sessions get reaped on a timer, same as
//! the rest of the gateway's resource-lifetime model.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info};

/// One tracked client session. Timestamps are stored as unix seconds in
/// atomics rather than `Instant`, so session age can be reported to admin
/// clients without a monotonic-to-wall-clock conversion.
pub struct Session {
    pub id: String,
    created_at: AtomicI64,
    last_activity_at: AtomicI64,
    initialized: AtomicBool,
}

impl Session {
    fn new(id: String, now: i64) -> Self {
        Self {
            id,
            created_at: AtomicI64::new(now),
            last_activity_at: AtomicI64::new(now),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn created_at(&self) -> i64 {
        self.created_at.load(Ordering::Relaxed)
    }

    pub fn last_activity_at(&self) -> i64 {
        self.last_activity_at.load(Ordering::Relaxed)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Relaxed)
    }

    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Relaxed);
    }

    fn touch(&self, now: i64) {
        self.last_activity_at.store(now, Ordering::Relaxed);
    }
}

/// Snapshot view of a session, for the admin surface.
#[derive(Debug, serde::Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub created_at: i64,
    pub last_activity_at: i64,
    pub initialized: bool,
}

/// Tracks active sessions and reaps idle ones. Never generates or accepts a
/// session id supplied by a client for creation — a new session always gets
/// a freshly generated id (spec §9 fixation-prevention note).
pub struct SessionStore {
    sessions: DashMap<String, Arc<Session>>,
    idle_timeout: Duration,
}

impl SessionStore {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            idle_timeout,
        }
    }

    /// Register a session id that the transport layer has already minted
    /// (rmcp's session manager owns generation; this just starts tracking it
    /// for idle GC and admin listing).
    pub fn track(&self, id: String) -> Arc<Session> {
        let now = now_unix();
        Arc::clone(
            self.sessions
                .entry(id.clone())
                .or_insert_with(|| Arc::new(Session::new(id, now))),
        )
    }

    pub fn touch(&self, id: &str) {
        if let Some(session) = self.sessions.get(id) {
            session.touch(now_unix());
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|s| Arc::clone(s.value()))
    }

    pub fn remove(&self, id: &str) {
        self.sessions.remove(id);
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|entry| {
                let s = entry.value();
                SessionInfo {
                    id: s.id.clone(),
                    created_at: s.created_at(),
                    last_activity_at: s.last_activity_at(),
                    initialized: s.is_initialized(),
                }
            })
            .collect()
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Evict sessions idle longer than `idle_timeout`. Returns the evicted ids
    /// so the caller can also close them on the transport side.
    fn sweep(&self) -> Vec<String> {
        let now = now_unix();
        let cutoff = self.idle_timeout.as_secs() as i64;
        let mut evicted = Vec::new();
        self.sessions.retain(|id, session| {
            let idle = now - session.last_activity_at();
            let keep = idle < cutoff;
            if !keep {
                evicted.push(id.clone());
            }
            keep
        });
        evicted
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Background idle-session reaper (spec §4.4: "sessions idle past the
/// configured timeout are discarded").
pub async fn run_session_gc(
    store: Arc<SessionStore>,
    shutdown: Arc<tokio::sync::Notify>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let evicted = store.sweep();
                if !evicted.is_empty() {
                    info!(count = evicted.len(), "evicted idle sessions");
                    for id in &evicted {
                        debug!(session = %id, "session idle timeout");
                    }
                }
            }
            _ = shutdown.notified() => {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_is_idempotent_for_same_id() {
        let store = SessionStore::new(Duration::from_secs(60));
        let a = store.track("s1".to_string());
        let b = store.track("s1".to_string());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn mark_initialized_is_visible_via_get() {
        let store = SessionStore::new(Duration::from_secs(60));
        let session = store.track("s1".to_string());
        session.mark_initialized();
        assert!(store.get("s1").unwrap().is_initialized());
    }

    #[test]
    fn sweep_evicts_only_idle_sessions() {
        let store = SessionStore::new(Duration::from_secs(0));
        store.track("old".to_string());
        std::thread::sleep(Duration::from_millis(1100));
        let evicted = store.sweep();
        assert_eq!(evicted, vec!["old".to_string()]);
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn remove_drops_tracked_session() {
        let store = SessionStore::new(Duration::from_secs(60));
        store.track("s1".to_string());
        store.remove("s1");
        assert!(store.get("s1").is_none());
    }
}
