//! Session Types and Data Structures

use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use super::session::Session;

/// Registry slot for one live session
pub struct SessionEntry {
    pub session: Arc<Session>,
    /// A pipeline is currently running on this session
    pub in_progress: bool,
    pub registered_at: Instant,
}

impl SessionEntry {
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            in_progress: false,
            registered_at: Instant::now(),
        }
    }
}

/// Snapshot of a registered session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub purpose: String,
    pub target: String,
    pub in_progress: bool,
    pub tracked_remote_files: usize,
    pub tracked_local_files: usize,
    pub age_secs: u64,
}

impl From<&SessionEntry> for SessionInfo {
    fn from(entry: &SessionEntry) -> Self {
        Self {
            id: entry.session.id().to_string(),
            purpose: entry.session.purpose().to_string(),
            target: entry.session.target().to_string(),
            in_progress: entry.in_progress,
            tracked_remote_files: entry.session.tracked_remote_files().len(),
            tracked_local_files: entry.session.tracked_local_files().len(),
            age_secs: entry.registered_at.elapsed().as_secs(),
        }
    }
}
