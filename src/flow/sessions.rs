use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use dashmap::DashMap;
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::limits::MAX_SESSIONS;
use crate::model::OwnerId;

use super::{Choice, Flow, FlowError, Reply, Session};

pub type SharedSession = Arc<Mutex<Session>>;

/// Open booking sessions, one per owner. Choices for one owner are serialized
/// by the session mutex; different owners proceed in parallel.
pub struct SessionManager {
    flow: Flow,
    sessions: DashMap<OwnerId, SharedSession>,
}

impl SessionManager {
    pub fn new(flow: Flow) -> Self {
        Self {
            flow,
            sessions: DashMap::new(),
        }
    }

    pub fn flow(&self) -> &Flow {
        &self.flow
    }

    /// Start a fresh session for `owner`, replacing any open one.
    /// Returns the session id when the flow continues.
    pub async fn begin(&self, owner: OwnerId, now: NaiveDateTime) -> (Option<Ulid>, Reply) {
        if !self.sessions.contains_key(&owner) && self.sessions.len() >= MAX_SESSIONS {
            return (None, Reply::Ended(FlowError::Busy));
        }
        let reply = self.flow.begin(owner, now).await;
        if reply.is_terminal() {
            self.sessions.remove(&owner);
            self.record_len();
            return (None, reply);
        }

        let session = Session::new(owner);
        let id = session.id;
        self.sessions.insert(owner, Arc::new(Mutex::new(session)));
        self.record_len();
        tracing::debug!("session {id} opened for owner {owner}");
        (Some(id), reply)
    }

    /// Feed one choice to the owner's open session.
    pub async fn apply(
        &self,
        owner: OwnerId,
        session_id: Ulid,
        choice: Choice,
        now: NaiveDateTime,
    ) -> (Option<Ulid>, Reply) {
        let Some(shared) = self.sessions.get(&owner).map(|e| e.value().clone()) else {
            return (None, Reply::Ended(FlowError::InvalidTransition("no open session")));
        };
        let mut session = shared.lock().await;
        if session.id != session_id {
            return (None, Reply::Ended(FlowError::InvalidTransition("stale session")));
        }

        let reply = self.flow.advance(&mut session, choice, now).await;
        if !reply.is_terminal() {
            return (Some(session.id), reply);
        }
        drop(session);
        // A newer session may have replaced this one meanwhile
        self.sessions
            .remove_if(&owner, |_, current| Arc::ptr_eq(current, &shared));
        self.record_len();
        (None, reply)
    }

    pub fn abandon(&self, owner: OwnerId) -> bool {
        let removed = self.sessions.remove(&owner).is_some();
        self.record_len();
        removed
    }

    /// Drop sessions untouched for `max_idle`. Sessions busy with a step are kept.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, shared| match shared.try_lock() {
            Ok(session) => session.idle_for() < max_idle,
            Err(_) => true,
        });
        self.record_len();
        before.saturating_sub(self.sessions.len())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn record_len(&self) {
        metrics::gauge!(crate::observability::SESSIONS_ACTIVE).set(self.sessions.len() as f64);
    }
}
