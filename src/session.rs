//! Session store
//!
//! Keyed, bounded per-session turn history. Each session sits behind its own
//! async mutex; a turn holds the session guard from resolution until the
//! history update, so turns on one session are serialized while different
//! sessions proceed independently.
//!
//! ```text
//! SessionStore
//!   sessions: RwLock<HashMap<id, Arc<Mutex<Session>>>>
//!                                     │
//!                          Session { history: VecDeque<QueryRecord> (≤ capacity) }
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;

/// One completed turn. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRecord {
    pub original_query: String,
    pub resolved_query: String,
    pub sql: String,
    /// Row count plus leading column names
    pub result_summary: String,
    pub timestamp: DateTime<Utc>,
}

impl QueryRecord {
    pub fn new(
        original_query: impl Into<String>,
        resolved_query: impl Into<String>,
        sql: impl Into<String>,
        result_summary: impl Into<String>,
    ) -> Self {
        Self {
            original_query: original_query.into(),
            resolved_query: resolved_query.into(),
            sql: sql.into(),
            result_summary: result_summary.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    capacity: usize,
    history: VecDeque<QueryRecord>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<String>, capacity: usize) -> Self {
        let now = Utc::now();
        let capacity = capacity.max(1);
        Self {
            id: id.into(),
            capacity,
            history: VecDeque::with_capacity(capacity),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Append, evicting the oldest record when full.
    pub fn push(&mut self, record: QueryRecord) {
        while self.history.len() >= self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(record);
        self.updated_at = Utc::now();
    }

    /// Oldest first
    pub fn history(&self) -> impl Iterator<Item = &QueryRecord> {
        self.history.iter()
    }

    /// The last `k` records, oldest first.
    pub fn recent(&self, k: usize) -> Vec<&QueryRecord> {
        let skip = self.history.len().saturating_sub(k);
        self.history.iter().skip(skip).collect()
    }
}

type SessionMap = RwLock<HashMap<String, Arc<Mutex<Session>>>>;

pub struct SessionStore {
    sessions: SessionMap,
    capacity: usize,
}

impl SessionStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lock the session, creating it on first use.
    ///
    /// The guard is owned so it can be held across the whole turn.
    pub async fn lock(&self, session_id: &str) -> OwnedMutexGuard<Session> {
        let existing = self.sessions.read().await.get(session_id).cloned();
        let slot = match existing {
            Some(slot) => slot,
            None => {
                let mut sessions = self.sessions.write().await;
                sessions
                    .entry(session_id.to_string())
                    .or_insert_with(|| {
                        debug!(session_id, "creating session");
                        Arc::new(Mutex::new(Session::new(session_id, self.capacity)))
                    })
                    .clone()
            }
        };
        slot.lock_owned().await
    }

    /// Copy of a session's history, oldest first. Waits for any running turn.
    pub async fn history(&self, session_id: &str) -> Option<Vec<QueryRecord>> {
        let slot = self.sessions.read().await.get(session_id).cloned()?;
        let session = slot.lock().await;
        Some(session.history().cloned().collect())
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    pub async fn remove(&self, session_id: &str) -> bool {
        self.sessions.write().await.remove(session_id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
