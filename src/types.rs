use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Opaque ID types
pub type ConnectionId = String;
pub type SessionId = String;
pub type PrincipalId = String;
pub type RequestId = String;

/// Verified identity attached to a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: PrincipalId,
}

impl Principal {
    pub fn new(id: impl Into<PrincipalId>) -> Self {
        Self { id: id.into() }
    }
}

/// A live duplex channel to one client, as seen by the rest of the broker
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub principal: Principal,
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
}

/// Logical grouping shared by one or more connections.
///
/// Members are never stored here; they are whichever registered connections
/// carry this session id.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: SessionId,
    /// None = any principal may join
    pub owner: Option<PrincipalId>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub state: HashMap<String, Value>,
}

impl Session {
    pub fn new(id: SessionId, owner: Option<PrincipalId>) -> Self {
        let now = Utc::now();
        Self {
            id,
            owner,
            created_at: now,
            last_activity: now,
            state: HashMap::new(),
        }
    }

    pub fn is_expired(&self, max_age: chrono::Duration, now: DateTime<Utc>) -> bool {
        now - self.last_activity > max_age
    }

    pub fn admits(&self, principal: &Principal) -> bool {
        match &self.owner {
            Some(owner) => owner == &principal.id,
            None => true,
        }
    }
}

/// Outcome of resolving a session for a new connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionResolution {
    /// No id was supplied (or it belonged to someone else); a brand-new session was made
    Created(SessionId),
    /// The supplied id matched a live session the principal may hold
    Resolved(SessionId),
    /// The supplied id was unknown or expired; a fresh session now carries it
    Recreated(SessionId),
}

impl SessionResolution {
    pub fn session_id(&self) -> &SessionId {
        match self {
            SessionResolution::Created(id)
            | SessionResolution::Resolved(id)
            | SessionResolution::Recreated(id) => id,
        }
    }
}

/// Seconds since the epoch, as carried in every envelope
pub fn unix_timestamp() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

pub fn new_id() -> String {
    ulid::Ulid::new().to_string()
}
