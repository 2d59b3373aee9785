//! # Session Registry
//!
//! Keyed store of live conversations, owned by the application state and shared
//! by every session channel. Each session holds the client's init metadata and
//! an append-only transcript.
//!
//! ## Ownership:
//! A channel that opens (or resumes) a session receives a [`SessionLease`].
//! Only the holder of the current lease may append to the transcript; releasing
//! the lease bumps the session epoch, so any copy still held by an in-flight
//! assistant turn is rejected afterwards.
//!
//! ## Reconnect policy:
//! - **Fresh**: releasing a lease removes the session; a later `init` with the
//!   same id starts over with an empty transcript.
//! - **Resume**: releasing a lease detaches the session; a later `init` with the
//!   same id re-attaches to the retained transcript until it expires.

use crate::session::envelope::Role;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// What happens to a session when its channel closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectPolicy {
    Fresh,
    Resume,
}

impl ReconnectPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconnectPolicy::Fresh => "fresh",
            ReconnectPolicy::Resume => "resume",
        }
    }
}

/// One line of a session transcript.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEntry {
    pub role: Role,
    pub content: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("maximum concurrent sessions ({0}) reached")]
    LimitReached(usize),

    #[error("session `{0}` is attached to another channel")]
    InUse(String),

    #[error("session `{0}` is closed")]
    Closed(String),

    #[error("session id must not be blank")]
    BlankId,
}

/// A single conversation.
#[derive(Debug)]
pub struct Session {
    id: String,
    metadata: Value,
    created_at: DateTime<Utc>,
    inner: Mutex<SessionInner>,
}

#[derive(Debug)]
struct SessionInner {
    transcript: Vec<TranscriptEntry>,
    /// Bumped on every attach and release; leases from older epochs are dead.
    epoch: u64,
    attached: bool,
    last_activity: DateTime<Utc>,
}

impl Session {
    fn new(id: String, metadata: Value) -> Self {
        let now = Utc::now();
        Self {
            id,
            metadata,
            created_at: now,
            inner: Mutex::new(SessionInner {
                transcript: Vec::new(),
                epoch: 1,
                attached: true,
                last_activity: now,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn metadata(&self) -> &Value {
        &self.metadata
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_attached(&self) -> bool {
        self.lock().attached
    }

    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.lock().transcript.clone()
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.lock().last_activity
    }
}

/// A channel's exclusive write access to one session's transcript.
#[derive(Debug, Clone)]
pub struct SessionLease {
    session: Arc<Session>,
    epoch: u64,
}

impl SessionLease {
    pub fn session_id(&self) -> &str {
        self.session.id()
    }

    pub fn metadata(&self) -> &Value {
        self.session.metadata()
    }

    /// Whether this lease still owns the session.
    pub fn is_current(&self) -> bool {
        let inner = self.session.lock();
        inner.attached && inner.epoch == self.epoch
    }

    /// Append a transcript entry; fails once the lease has been released.
    /// Returns the transcript length after the append.
    pub fn append(&self, role: Role, content: impl Into<String>) -> Result<usize, SessionError> {
        let mut inner = self.session.lock();
        if !inner.attached || inner.epoch != self.epoch {
            return Err(SessionError::Closed(self.session.id.clone()));
        }

        let now = Utc::now();
        inner.transcript.push(TranscriptEntry {
            role,
            content: content.into(),
            at: now,
        });
        inner.last_activity = now;
        Ok(inner.transcript.len())
    }

    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.session.transcript()
    }
}

/// Result of opening a session for a channel.
#[derive(Debug)]
pub struct OpenedSession {
    pub lease: SessionLease,
    /// True when an existing detached session was re-attached.
    pub resumed: bool,
}

/// Registry counts for health and metrics reporting.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySummary {
    pub total_sessions: usize,
    pub attached_sessions: usize,
    pub detached_sessions: usize,
    pub max_sessions: usize,
    pub reconnect_policy: ReconnectPolicy,
}

/// Keyed store of sessions by id.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    max_sessions: usize,
    policy: ReconnectPolicy,
    idle_timeout: chrono::Duration,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize, policy: ReconnectPolicy, idle_timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
            policy,
            idle_timeout: chrono::Duration::from_std(idle_timeout)
                .unwrap_or_else(|_| chrono::Duration::MAX),
        }
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    /// Open a session for a newly initialized channel.
    ///
    /// ## Returns:
    /// - the client-supplied id when present, otherwise a fresh UUID
    /// - `resumed = true` only under [`ReconnectPolicy::Resume`] when a detached
    ///   session with that id still exists
    pub fn open(
        &self,
        requested_id: Option<String>,
        metadata: Value,
    ) -> Result<OpenedSession, SessionError> {
        let requested_id = match requested_id {
            Some(id) if id.trim().is_empty() => return Err(SessionError::BlankId),
            other => other,
        };

        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(id) = requested_id.as_deref() {
            // Attachment only changes under the registry write lock, so this
            // check holds until we return.
            if let Some(existing) = sessions.get(id).cloned() {
                if existing.is_attached() {
                    return Err(SessionError::InUse(id.to_string()));
                }

                match self.policy {
                    ReconnectPolicy::Resume => {
                        if attached_count(&sessions) >= self.max_sessions {
                            return Err(SessionError::LimitReached(self.max_sessions));
                        }
                        let lease = {
                            let mut inner = existing.lock();
                            inner.epoch += 1;
                            inner.attached = true;
                            inner.last_activity = Utc::now();
                            SessionLease {
                                session: existing.clone(),
                                epoch: inner.epoch,
                            }
                        };
                        info!(session_id = %id, "Resumed detached session");
                        return Ok(OpenedSession {
                            lease,
                            resumed: true,
                        });
                    }
                    ReconnectPolicy::Fresh => {
                        sessions.remove(id);
                        debug!(session_id = %id, "Discarded stale session for fresh start");
                    }
                }
            }
        }

        if attached_count(&sessions) >= self.max_sessions {
            return Err(SessionError::LimitReached(self.max_sessions));
        }

        let session_id = requested_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let session = Arc::new(Session::new(session_id.clone(), metadata));
        let lease = SessionLease {
            session: session.clone(),
            epoch: 1,
        };
        sessions.insert(session_id.clone(), session);

        info!(session_id = %session_id, "Opened session");
        Ok(OpenedSession {
            lease,
            resumed: false,
        })
    }

    /// Release a channel's lease. The transcript becomes read-only for every
    /// copy of that lease. Returns false when the lease was already dead.
    pub fn release(&self, lease: &SessionLease) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let id = lease.session_id();

        {
            let mut inner = lease.session.lock();
            if !inner.attached || inner.epoch != lease.epoch {
                return false;
            }
            inner.attached = false;
            inner.epoch += 1;
            inner.last_activity = Utc::now();
        }

        let registered = sessions
            .get(id)
            .is_some_and(|current| Arc::ptr_eq(current, &lease.session));
        if registered && self.policy == ReconnectPolicy::Fresh {
            sessions.remove(id);
        }

        debug!(session_id = %id, policy = self.policy.as_str(), "Released session");
        true
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions.get(session_id).cloned()
    }

    /// Number of sessions currently attached to a channel.
    pub fn active_count(&self) -> usize {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        attached_count(&sessions)
    }

    /// Total sessions held, attached or not.
    pub fn len(&self) -> usize {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop detached sessions idle for longer than the configured timeout.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let before = sessions.len();

        sessions.retain(|_, session| {
            let inner = session.lock();
            inner.attached || now.signed_duration_since(inner.last_activity) <= self.idle_timeout
        });

        before - sessions.len()
    }

    /// Run [`sweep_expired`](Self::sweep_expired) on a fixed interval.
    pub fn spawn_sweeper(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let removed = self.sweep_expired(Utc::now());
                if removed > 0 {
                    info!(removed, "Expired detached sessions");
                }
            }
        })
    }

    pub fn summary(&self) -> RegistrySummary {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        let attached = attached_count(&sessions);

        RegistrySummary {
            total_sessions: sessions.len(),
            attached_sessions: attached,
            detached_sessions: sessions.len() - attached,
            max_sessions: self.max_sessions,
            reconnect_policy: self.policy,
        }
    }
}

fn attached_count(sessions: &HashMap<String, Arc<Session>>) -> usize {
    sessions.values().filter(|s| s.is_attached()).count()
}
