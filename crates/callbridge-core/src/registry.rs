//! Session Registry
//!
//! Owns the mapping from [`CallId`] to [`CallSession`] and the pairwise
//! conference groups built on top of it. It is the single source of truth
//! for "does a call with this id exist".
//!
//! Native callbacks, application commands and timer tasks all reach the
//! registry concurrently, so every operation runs under one registry-wide
//! `RwLock`. Check-then-act sequences go through
//! [`SessionRegistry::with_session_mut`] so they cannot interleave with a
//! concurrent removal of the same session.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error};
use uuid::Uuid;

use crate::call::{CallId, CallSession, CallState, CallStats, NewSession};
use crate::error::{BridgeError, BridgeResult};

/// Identifier of a conference group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConferenceId(pub Uuid);

impl ConferenceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConferenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    sessions: HashMap<CallId, CallSession>,
    conferences: HashMap<ConferenceId, HashSet<CallId>>,
    membership: HashMap<CallId, ConferenceId>,
    total_created: usize,
    total_removed: usize,
}

impl RegistryInner {
    /// Every session's peers are all other live sessions
    fn recompute_peers(&mut self) {
        let ids: Vec<CallId> = self.sessions.keys().cloned().collect();
        for (id, session) in self.sessions.iter_mut() {
            session.conference_peers = ids.iter().filter(|other| *other != id).cloned().collect();
        }
    }

    fn leave_conference(&mut self, call_id: &CallId) {
        let Some(conference_id) = self.membership.remove(call_id) else {
            return;
        };
        let dissolve = match self.conferences.get_mut(&conference_id) {
            Some(members) => {
                members.remove(call_id);
                members.len() < 2
            }
            None => false,
        };
        if dissolve {
            if let Some(members) = self.conferences.remove(&conference_id) {
                for member in members {
                    self.membership.remove(&member);
                }
            }
            debug!(conference_id = %conference_id, "Conference dissolved");
        }
    }
}

/// Registry of live call sessions
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and insert a session.
    ///
    /// Fails with [`BridgeError::CallAlreadyExists`] if the id is live;
    /// a duplicate id is an invariant violation and is logged as an error.
    pub async fn create(&self, call_id: CallId, attrs: NewSession) -> BridgeResult<CallSession> {
        let mut inner = self.inner.write().await;

        if inner.sessions.contains_key(&call_id) {
            error!(call_id = %call_id, "Duplicate session id, refusing to create");
            return Err(BridgeError::CallAlreadyExists { call_id });
        }

        let session = CallSession::new(call_id.clone(), attrs);
        inner.sessions.insert(call_id.clone(), session);
        inner.total_created += 1;
        inner.recompute_peers();

        debug!(call_id = %call_id, "Registered session");
        inner
            .sessions
            .get(&call_id)
            .cloned()
            .ok_or_else(|| BridgeError::internal_error("session vanished during create"))
    }

    /// Get a snapshot of a session
    pub async fn get(&self, call_id: &CallId) -> BridgeResult<CallSession> {
        let inner = self.inner.read().await;
        inner
            .sessions
            .get(call_id)
            .cloned()
            .ok_or_else(|| BridgeError::CallNotFound { call_id: call_id.clone() })
    }

    pub async fn contains(&self, call_id: &CallId) -> bool {
        self.inner.read().await.sessions.contains_key(call_id)
    }

    /// Remove a session. Removing an absent id is a no-op.
    pub async fn remove(&self, call_id: &CallId) -> Option<CallSession> {
        let mut inner = self.inner.write().await;
        let removed = inner.sessions.remove(call_id);
        if removed.is_some() {
            inner.total_removed += 1;
            inner.leave_conference(call_id);
            inner.recompute_peers();
            debug!(call_id = %call_id, "Unregistered session");
        }
        removed
    }

    /// All sessions except the given one
    pub async fn list_except(&self, call_id: &CallId) -> Vec<CallSession> {
        let inner = self.inner.read().await;
        inner
            .sessions
            .values()
            .filter(|session| &session.id != call_id)
            .cloned()
            .collect()
    }

    /// All live sessions
    pub async fn list(&self) -> Vec<CallSession> {
        self.inner.read().await.sessions.values().cloned().collect()
    }

    pub async fn ids(&self) -> Vec<CallId> {
        self.inner.read().await.sessions.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.sessions.is_empty()
    }

    /// Run `f` against a session while holding the registry write lock.
    ///
    /// The lookup and the mutation are atomic with respect to `remove`.
    pub async fn with_session_mut<R>(
        &self,
        call_id: &CallId,
        f: impl FnOnce(&mut CallSession) -> R,
    ) -> BridgeResult<R> {
        let mut inner = self.inner.write().await;
        match inner.sessions.get_mut(call_id) {
            Some(session) => Ok(f(session)),
            None => Err(BridgeError::CallNotFound { call_id: call_id.clone() }),
        }
    }

    /// Run `f` against a session and remove it, under one write lock.
    ///
    /// Returns `None` for an absent id. If `f` fails the session is left in
    /// place, unchanged, and the error is returned.
    pub async fn remove_with<E>(
        &self,
        call_id: &CallId,
        f: impl FnOnce(&mut CallSession) -> Result<(), E>,
    ) -> Option<Result<CallSession, E>> {
        let mut inner = self.inner.write().await;
        let session = inner.sessions.get_mut(call_id)?;

        let mut updated = session.clone();
        if let Err(e) = f(&mut updated) {
            return Some(Err(e));
        }

        inner.sessions.remove(call_id);
        inner.total_removed += 1;
        inner.leave_conference(call_id);
        inner.recompute_peers();
        debug!(call_id = %call_id, state = ?updated.state, "Unregistered session");
        Some(Ok(updated))
    }

    /// Group two live sessions into one conference.
    ///
    /// If either session already belongs to a conference the other one
    /// joins it.
    pub async fn group(&self, first: &CallId, second: &CallId) -> BridgeResult<ConferenceId> {
        let mut inner = self.inner.write().await;

        for id in [first, second] {
            if !inner.sessions.contains_key(id) {
                return Err(BridgeError::CallNotFound { call_id: id.clone() });
            }
        }

        let existing_first = inner.membership.get(first).copied();
        let existing_second = inner.membership.get(second).copied();

        let conference_id = match (existing_first, existing_second) {
            (Some(a), Some(b)) if a != b => {
                // Fold the second group into the first.
                let moved = inner.conferences.remove(&b).unwrap_or_default();
                for member in &moved {
                    inner.membership.insert(member.clone(), a);
                }
                inner.conferences.entry(a).or_default().extend(moved);
                a
            }
            (Some(a), _) => a,
            (None, Some(b)) => b,
            (None, None) => ConferenceId::new(),
        };

        let members = inner.conferences.entry(conference_id).or_default();
        members.insert(first.clone());
        members.insert(second.clone());
        inner.membership.insert(first.clone(), conference_id);
        inner.membership.insert(second.clone(), conference_id);

        debug!(conference_id = %conference_id, first = %first, second = %second, "Sessions grouped");
        Ok(conference_id)
    }

    /// Conference a session belongs to, if any
    pub async fn conference_of(&self, call_id: &CallId) -> Option<ConferenceId> {
        self.inner.read().await.membership.get(call_id).copied()
    }

    /// Members of a conference
    pub async fn conference_members(&self, conference_id: &ConferenceId) -> Vec<CallId> {
        let inner = self.inner.read().await;
        inner
            .conferences
            .get(conference_id)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop every session and conference
    pub async fn clear(&self) -> Vec<CallSession> {
        let mut inner = self.inner.write().await;
        let drained: Vec<CallSession> = inner.sessions.drain().map(|(_, session)| session).collect();
        inner.total_removed += drained.len();
        inner.conferences.clear();
        inner.membership.clear();
        drained
    }

    /// Current call statistics
    pub async fn stats(&self) -> CallStats {
        let inner = self.inner.read().await;
        let mut stats = CallStats {
            total_sessions: inner.sessions.len(),
            conferences: inner.conferences.len(),
            ..Default::default()
        };
        for session in inner.sessions.values() {
            match session.state {
                CallState::Active => stats.active_sessions += 1,
                CallState::Ringing => stats.ringing_sessions += 1,
                CallState::Holding => stats.held_sessions += 1,
                _ => {}
            }
        }
        stats
    }

    /// Lifetime (created, removed) counters
    pub async fn lifetime_counts(&self) -> (usize, usize) {
        let inner = self.inner.read().await;
        (inner.total_created, inner.total_removed)
    }
}
