use crate::types::*;
use chrono::Utc;
use dashmap::{mapref::entry::Entry, DashMap};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Errors from the session store
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(SessionId),
}

/// Session lifetime configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Inactivity window after which a session may be reaped
    pub max_age: Duration,
    /// How often the reaper runs
    pub reap_interval: Duration,
    /// Bind new sessions to the principal that created them
    pub restrict_to_owner: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(60 * 60),
            reap_interval: Duration::from_secs(60),
            restrict_to_owner: true,
        }
    }
}

impl SessionConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let secs = |key: &str| {
            std::env::var(key)
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
        };

        let config = Self {
            max_age: secs("SESSION_MAX_AGE_SECS").unwrap_or(defaults.max_age),
            reap_interval: secs("SESSION_REAP_INTERVAL_SECS").unwrap_or(defaults.reap_interval),
            restrict_to_owner: std::env::var("SESSION_RESTRICT_TO_OWNER")
                .map(|v| !matches!(v.trim().to_lowercase().as_str(), "0" | "false" | "no"))
                .unwrap_or(defaults.restrict_to_owner),
        };

        tracing::info!(
            max_age_secs = config.max_age.as_secs(),
            reap_interval_secs = config.reap_interval.as_secs(),
            restrict_to_owner = config.restrict_to_owner,
            "Session config loaded"
        );
        config
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}

struct SessionEntry {
    session: Session,
    /// Requests currently working against this session
    leases: usize,
}

impl SessionEntry {
    fn new(session: Session) -> Self {
        Self { session, leases: 0 }
    }
}

/// Sessions keyed by id, with per-shard locking
#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<DashMap<SessionId, SessionEntry>>,
    config: SessionConfig,
}

impl SessionStore {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn owner_for(&self, principal: &Principal) -> Option<PrincipalId> {
        self.config
            .restrict_to_owner
            .then(|| principal.id.clone())
    }

    fn create(&self, owner: Option<PrincipalId>) -> SessionId {
        let id = new_id();
        self.sessions
            .insert(id.clone(), SessionEntry::new(Session::new(id.clone(), owner)));
        id
    }

    /// Find or make the session a new connection belongs to.
    ///
    /// An unknown or expired id is recreated under the same id so that peers
    /// asking for it keep meeting each other. An id held by another principal
    /// is never joined; the caller gets a new session instead.
    pub fn resolve(&self, requested: Option<&str>, principal: &Principal) -> SessionResolution {
        let owner = self.owner_for(principal);

        let Some(requested) = requested.map(str::trim).filter(|s| !s.is_empty()) else {
            let id = self.create(owner);
            tracing::info!("Created session {} for {}", id, principal.id);
            return SessionResolution::Created(id);
        };

        let now = Utc::now();
        let max_age = to_chrono(self.config.max_age);

        let resolution = match self.sessions.entry(requested.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if !entry.session.admits(principal) {
                    None
                } else if entry.leases == 0 && entry.session.is_expired(max_age, now) {
                    entry.session = Session::new(requested.to_string(), owner.clone());
                    Some(SessionResolution::Recreated(requested.to_string()))
                } else {
                    entry.session.last_activity = now;
                    Some(SessionResolution::Resolved(requested.to_string()))
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(SessionEntry::new(Session::new(
                    requested.to_string(),
                    owner.clone(),
                )));
                Some(SessionResolution::Recreated(requested.to_string()))
            }
        };

        match resolution {
            Some(resolution) => {
                tracing::info!("Session {:?} for {}", resolution, principal.id);
                resolution
            }
            None => {
                let id = self.create(owner);
                tracing::warn!(
                    "{} asked for session {} owned by someone else; created {}",
                    principal.id,
                    requested,
                    id
                );
                SessionResolution::Created(id)
            }
        }
    }

    /// Snapshot of a session
    pub fn get(&self, id: &str) -> Option<Session> {
        self.sessions.get(id).map(|entry| entry.session.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn get_state(&self, id: &str, key: &str) -> Option<Value> {
        self.sessions
            .get(id)
            .and_then(|entry| entry.session.state.get(key).cloned())
    }

    /// Last write wins
    pub fn set_state(&self, id: &str, key: &str, value: Value) -> Result<(), SessionError> {
        let mut entry = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        entry.session.state.insert(key.to_string(), value);
        entry.session.last_activity = Utc::now();
        Ok(())
    }

    /// Mark activity; false if the session is gone
    pub fn touch(&self, id: &str) -> bool {
        match self.sessions.get_mut(id) {
            Some(mut entry) => {
                entry.session.last_activity = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Drop sessions idle for longer than `max_age`, skipping leased ones.
    /// Member connections are left alone.
    pub fn reap(&self, max_age: Duration) -> usize {
        let now = Utc::now();
        let max_age = to_chrono(max_age);
        let mut reaped = 0;

        self.sessions.retain(|id, entry| {
            let keep = entry.leases > 0 || !entry.session.is_expired(max_age, now);
            if !keep {
                tracing::debug!("Reaping idle session {}", id);
                reaped += 1;
            }
            keep
        });

        reaped
    }

    /// Hold a session for the duration of a request.
    ///
    /// If the session vanished (reaped between requests) it is recreated
    /// under the same id.
    pub fn lease(&self, id: &str, principal: &Principal) -> SessionLease {
        let mut healed = false;
        {
            let mut entry = self.sessions.entry(id.to_string()).or_insert_with(|| {
                healed = true;
                SessionEntry::new(Session::new(id.to_string(), self.owner_for(principal)))
            });
            entry.leases += 1;
            entry.session.last_activity = Utc::now();
        }

        if healed {
            tracing::warn!("Session {} was missing; recreated it", id);
        }

        SessionLease {
            sessions: self.sessions.clone(),
            id: id.to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Keeps a session out of the reaper's reach until dropped
pub struct SessionLease {
    sessions: Arc<DashMap<SessionId, SessionEntry>>,
    id: SessionId,
}

impl SessionLease {
    pub fn session_id(&self) -> &SessionId {
        &self.id
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Some(mut entry) = self.sessions.get_mut(&self.id) {
            entry.leases = entry.leases.saturating_sub(1);
            entry.session.last_activity = Utc::now();
        }
    }
}
