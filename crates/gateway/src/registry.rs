//! In-memory session registry with admission control.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use proto::{ChallengeId, Session, SessionError, SessionId, SessionStatus, UserId};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

/// Admission caps and time budgets.
#[derive(Debug, Clone)]
pub struct SessionLimits {
    pub max_per_user: usize,
    pub max_total: usize,
    pub idle_timeout: Duration,
    pub max_duration: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_per_user: 1,
            max_total: 15,
            idle_timeout: Duration::from_secs(600),
            max_duration: Duration::from_secs(900),
        }
    }
}

struct Inner {
    sessions: HashMap<SessionId, Session>,
    pending: HashSet<(UserId, ChallengeId)>,
}

/// Successful outcome of [`SessionManager::try_reserve`].
#[derive(Debug, Clone)]
pub enum Reservation {
    /// The caller owns the pending slot for this (user, challenge) and must
    /// either `create` the session or `release` the slot.
    Reserved,
    /// The user already holds an active session for this challenge.
    Existing(Session),
}

/// Owner of all live session state.
///
/// One mutex covers the session map and the pending set; every admission
/// check, count, and mutation happens under it, and nothing under it does
/// I/O — container and store calls always run outside the lock.
pub struct SessionManager {
    limits: SessionLimits,
    inner: Mutex<Inner>,
    close_tx: OnceLock<UnboundedSender<SessionId>>,
}

impl SessionManager {
    pub fn new(limits: SessionLimits) -> Self {
        Self {
            limits,
            inner: Mutex::new(Inner {
                sessions: HashMap::new(),
                pending: HashSet::new(),
            }),
            close_tx: OnceLock::new(),
        }
    }

    pub fn limits(&self) -> &SessionLimits {
        &self.limits
    }

    /// Install the channel that receives ids of ended sessions. Set once at
    /// wiring time; later calls are ignored.
    pub fn set_close_notifier(&self, tx: UnboundedSender<SessionId>) {
        let _ = self.close_tx.set(tx);
    }

    /// Admission control and pending claim in one critical section.
    ///
    /// Container creation happens outside the lock, so a slot granted here
    /// must stay accounted for until it becomes a session or is released —
    /// both caps therefore count active sessions **plus** in-flight
    /// reservations. Without that, two concurrent starts (same user on two
    /// challenges, or distinct users near the global cap) would each pass a
    /// bare count check and both insert.
    pub fn try_reserve(
        &self,
        user_id: UserId,
        challenge_id: ChallengeId,
    ) -> Result<Reservation, SessionError> {
        let mut inner = self.inner.lock();

        if let Some(existing) = inner
            .sessions
            .values()
            .find(|s| s.user_id == user_id && s.challenge_id == challenge_id)
        {
            return Ok(Reservation::Existing(existing.clone()));
        }

        if inner.pending.contains(&(user_id, challenge_id)) {
            return Err(SessionError::DuplicatePending);
        }

        let user_held = inner
            .sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .count()
            + inner.pending.iter().filter(|(u, _)| *u == user_id).count();
        if user_held >= self.limits.max_per_user {
            return Err(SessionError::AdmissionDenied(format!(
                "Maximum {} active session(s) per user",
                self.limits.max_per_user
            )));
        }

        if inner.sessions.len() + inner.pending.len() >= self.limits.max_total {
            return Err(SessionError::AdmissionDenied(
                "System at capacity. Please try again later.".to_string(),
            ));
        }

        inner.pending.insert((user_id, challenge_id));
        Ok(Reservation::Reserved)
    }

    /// Give back a reservation whose container creation failed.
    pub fn release(&self, user_id: UserId, challenge_id: ChallengeId) {
        self.inner.lock().pending.remove(&(user_id, challenge_id));
    }

    pub fn is_pending(&self, user_id: UserId, challenge_id: ChallengeId) -> bool {
        self.inner.lock().pending.contains(&(user_id, challenge_id))
    }

    /// Convert a reservation into an active session. The pending slot is
    /// consumed and the record inserted under one lock, so at no instant do
    /// both count against the caps.
    pub fn create(
        &self,
        user_id: UserId,
        challenge_id: ChallengeId,
        container_id: String,
    ) -> Session {
        let now = chrono::Utc::now();
        let session = Session {
            id: SessionId::new(),
            user_id,
            challenge_id,
            container_id,
            status: SessionStatus::Active,
            created_at: now,
            expires_at: now
                + chrono::Duration::from_std(self.limits.max_duration)
                    .unwrap_or_else(|_| chrono::Duration::seconds(900)),
            created: Instant::now(),
            last_activity: Instant::now(),
        };

        {
            let mut inner = self.inner.lock();
            inner.pending.remove(&(user_id, challenge_id));
            inner.sessions.insert(session.id, session.clone());
        }
        info!(
            "Session {} created for user {user_id} challenge {challenge_id}",
            session.id
        );
        session
    }

    pub fn get(&self, id: SessionId) -> Option<Session> {
        self.inner.lock().sessions.get(&id).cloned()
    }

    /// The user's active session for a specific challenge, if any.
    pub fn find_active(&self, user_id: UserId, challenge_id: ChallengeId) -> Option<Session> {
        self.inner
            .lock()
            .sessions
            .values()
            .find(|s| s.user_id == user_id && s.challenge_id == challenge_id)
            .cloned()
    }

    /// Bump the activity timestamp. No-op for unknown ids. The new instant is
    /// taken under the lock, so later callers can never move it backwards.
    pub fn update_activity(&self, id: SessionId) {
        if let Some(session) = self.inner.lock().sessions.get_mut(&id) {
            session.last_activity = Instant::now();
        }
    }

    /// End a session normally. Removes the record and schedules a socket
    /// close; calling it again (or for an unknown id) is a no-op.
    pub fn end(&self, id: SessionId) -> bool {
        self.finish(id, SessionStatus::Ended)
    }

    /// End a session because a timeout elapsed.
    pub fn mark_expired(&self, id: SessionId) -> bool {
        self.finish(id, SessionStatus::Expired)
    }

    fn finish(&self, id: SessionId, status: SessionStatus) -> bool {
        let removed = self.inner.lock().sessions.remove(&id);
        match removed {
            Some(session) => {
                debug!(
                    "Session {id} ({}/{}) -> {status}",
                    session.user_id, session.challenge_id
                );
                if let Some(tx) = self.close_tx.get() {
                    let _ = tx.send(id);
                }
                true
            }
            None => false,
        }
    }

    pub fn list_active(&self) -> Vec<Session> {
        self.inner.lock().sessions.values().cloned().collect()
    }

    pub fn list_user(&self, user_id: UserId) -> Vec<Session> {
        self.inner
            .lock()
            .sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Sessions past their idle or absolute timeout at this instant.
    pub fn list_expired(&self) -> Vec<Session> {
        let now = Instant::now();
        self.inner
            .lock()
            .sessions
            .values()
            .filter(|s| {
                now.duration_since(s.last_activity) > self.limits.idle_timeout
                    || now.duration_since(s.created) > self.limits.max_duration
            })
            .cloned()
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }
}
