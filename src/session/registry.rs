//! Global Session Registry
//!
//! Thread-safe session bookkeeping using DashMap for concurrent access.
//! Shutdown paths (`force_cleanup_all`, `graceful_cleanup_all`) make sure no
//! session outlives the process with temp files left behind.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::session::Session;
use super::types::{SessionEntry, SessionInfo};

/// Per-session bound on close() during forced cleanup
const FORCE_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// How often graceful cleanup re-checks for running operations
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Registry of live provisioning sessions
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionEntry>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: Arc<Session>) {
        info!(
            "Registering session {} ({}) -> {}",
            session.id(),
            session.purpose(),
            session.target()
        );
        self.sessions
            .insert(session.id().to_string(), SessionEntry::new(session));
    }

    /// Remove a session that has no operation in flight.
    ///
    /// Returns `None` (and keeps the entry) when the session is unknown or
    /// still marked in-progress; clear the flag first.
    pub fn unregister(&self, session_id: &str) -> Option<Arc<Session>> {
        match self
            .sessions
            .remove_if(session_id, |_, entry| !entry.in_progress)
        {
            Some((_, entry)) => {
                debug!("Unregistered session {}", session_id);
                Some(entry.session)
            }
            None => {
                if self.sessions.contains_key(session_id) {
                    warn!(
                        "Refusing to unregister session {}: operation still in progress",
                        session_id
                    );
                }
                None
            }
        }
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|e| e.session.clone())
    }

    /// Mark or clear the in-progress flag. Returns false for unknown sessions.
    pub fn set_in_progress(&self, session_id: &str, in_progress: bool) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(mut entry) => {
                entry.in_progress = in_progress;
                true
            }
            None => false,
        }
    }

    pub fn has_in_progress_operations(&self) -> bool {
        self.sessions.iter().any(|e| e.in_progress)
    }

    pub fn in_progress_count(&self) -> usize {
        self.sessions.iter().filter(|e| e.in_progress).count()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// List all sessions, oldest first
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| SessionInfo::from(entry.value()))
            .collect();
        sessions.sort_by(|a, b| b.age_secs.cmp(&a.age_secs).then(a.id.cmp(&b.id)));
        sessions
    }

    /// Cancel, close and remove every session, in-progress or not.
    pub async fn force_cleanup_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        if ids.is_empty() {
            return;
        }

        info!("Force-closing {} session(s)", ids.len());
        for id in ids {
            let Some((_, entry)) = self.sessions.remove(&id) else {
                continue;
            };
            if entry.in_progress {
                warn!("Session {} still in progress, cancelling", id);
            }
            entry.session.control().cancel();
            if tokio::time::timeout(FORCE_CLOSE_TIMEOUT, entry.session.close())
                .await
                .is_err()
            {
                warn!("Timed out closing session {}", id);
            }
        }
    }

    /// Ask running operations to stop, give them `grace` to unwind through
    /// their own cleanup, then force-close whatever is left.
    pub async fn graceful_cleanup_all(&self, grace: Duration) {
        for entry in self.sessions.iter() {
            if entry.in_progress {
                entry.session.control().cancel();
            }
        }

        let deadline = Instant::now() + grace;
        while self.has_in_progress_operations() && Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        let remaining = self.in_progress_count();
        if remaining > 0 {
            warn!(
                "{} operation(s) still running after {:?}, forcing cleanup",
                remaining, grace
            );
        }
        self.force_cleanup_all().await;
    }

    /// Multi-line human readable status
    pub fn status_summary(&self) -> String {
        let sessions = self.list();
        let mut summary = format!(
            "{} session(s), {} in progress",
            sessions.len(),
            sessions.iter().filter(|s| s.in_progress).count()
        );
        for s in &sessions {
            summary.push_str(&format!(
                "\n- {} [{}] {}{} ({} remote, {} local tracked, {}s)",
                s.id,
                s.purpose,
                s.target,
                if s.in_progress { " in progress" } else { "" },
                s.tracked_remote_files,
                s.tracked_local_files,
                s.age_secs
            ));
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::FakeTransport;

    fn session(id: &str, transport: Arc<FakeTransport>) -> Arc<Session> {
        Arc::new(Session::with_transport(id, "test", "u@h:22", transport))
    }

    #[test]
    fn test_register_and_unregister() {
        let registry = SessionRegistry::new();
        registry.register(session("a", FakeTransport::new()));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("a").is_some());

        assert!(registry.unregister("a").is_some());
        assert!(registry.is_empty());
        assert!(registry.unregister("a").is_none());
    }

    #[test]
    fn test_in_progress_entries_are_not_dropped() {
        let registry = SessionRegistry::new();
        registry.register(session("a", FakeTransport::new()));
        assert!(registry.set_in_progress("a", true));
        assert!(registry.has_in_progress_operations());

        assert!(registry.unregister("a").is_none());
        assert_eq!(registry.len(), 1);

        registry.set_in_progress("a", false);
        assert!(registry.unregister("a").is_some());
        assert!(!registry.set_in_progress("a", true));
    }

    #[test]
    fn test_status_summary() {
        let registry = SessionRegistry::new();
        let s = session("abc", FakeTransport::new());
        s.track_remote_file("/tmp/x.zip");
        registry.register(s);
        registry.set_in_progress("abc", true);

        let summary = registry.status_summary();
        assert!(summary.starts_with("1 session(s), 1 in progress"));
        assert!(summary.contains("abc [test] u@h:22 in progress (1 remote, 0 local"));
    }

    #[tokio::test]
    async fn test_force_cleanup_closes_everything() {
        let registry = SessionRegistry::new();
        let t1 = FakeTransport::new();
        let t2 = FakeTransport::new();
        t1.put_remote_file("/tmp/a.zip", vec![1]);
        let s1 = session("a", t1.clone());
        s1.track_remote_file("/tmp/a.zip");
        registry.register(s1.clone());
        registry.register(session("b", t2.clone()));
        registry.set_in_progress("a", true);

        registry.force_cleanup_all().await;

        assert!(registry.is_empty());
        assert!(s1.control().is_cancelled());
        assert!(!t1.has_remote_file("/tmp/a.zip"));
        assert!(t1.is_disconnected());
        assert!(t2.is_disconnected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_cleanup_waits_for_running_operation() {
        let registry = Arc::new(SessionRegistry::new());
        let s = session("a", FakeTransport::new());
        registry.register(s.clone());
        registry.set_in_progress("a", true);

        // Simulated pipeline: notices cancellation, then unwinds
        let worker = {
            let registry = registry.clone();
            let s = s.clone();
            tokio::spawn(async move {
                while !s.control().is_cancelled() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                tokio::time::sleep(Duration::from_millis(300)).await;
                registry.set_in_progress("a", false);
            })
        };

        let started = Instant::now();
        registry.graceful_cleanup_all(Duration::from_secs(5)).await;
        worker.await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(registry.is_empty());
        assert!(s.is_disconnected());
    }
}
