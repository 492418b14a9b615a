use super::AppState;
use crate::auth::AuthError;
use crate::types::*;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Frames queued per connection before sends start failing
pub const OUTBOUND_BUFFER: usize = 64;

/// Why a frame could not be handed to a connection
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeliveryError {
    #[error("connection {0} is not registered")]
    NotConnected(ConnectionId),

    #[error("outbound queue for {0} is full")]
    ChannelFull(ConnectionId),

    #[error("connection {0} is closing")]
    Closed(ConnectionId),
}

/// Which connections a frame is meant for
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Audience<'a> {
    All,
    Session(&'a str),
}

struct ConnectionEntry {
    connection: Connection,
    sender: mpsc::Sender<Arc<str>>,
}

/// A connection's outbound queue, detached from the registry
#[derive(Clone)]
pub struct Recipient {
    pub connection_id: ConnectionId,
    sender: mpsc::Sender<Arc<str>>,
}

impl Recipient {
    /// Queue a frame without waiting
    pub fn send(&self, frame: Arc<str>) -> Result<(), DeliveryError> {
        self.sender.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                DeliveryError::ChannelFull(self.connection_id.clone())
            }
            mpsc::error::TrySendError::Closed(_) => {
                DeliveryError::Closed(self.connection_id.clone())
            }
        })
    }
}

/// Live connections keyed by id
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<ConnectionId, ConnectionEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, connection: Connection, sender: mpsc::Sender<Arc<str>>) {
        tracing::debug!(
            "Registering connection {} ({}) in session {}",
            connection.id,
            connection.principal.id,
            connection.session_id
        );
        self.connections.insert(
            connection.id.clone(),
            ConnectionEntry { connection, sender },
        );
    }

    /// Idempotent; sessions are untouched
    pub fn remove(&self, id: &str) -> Option<Connection> {
        self.connections.remove(id).map(|(_, entry)| entry.connection)
    }

    pub fn get(&self, id: &str) -> Option<Connection> {
        self.connections.get(id).map(|entry| entry.connection.clone())
    }

    pub fn recipient(&self, id: &str) -> Option<Recipient> {
        self.connections.get(id).map(|entry| Recipient {
            connection_id: entry.connection.id.clone(),
            sender: entry.sender.clone(),
        })
    }

    /// Snapshot the matching connections so no shard stays locked while sending
    pub fn recipients(&self, audience: Audience<'_>) -> Vec<Recipient> {
        self.connections
            .iter()
            .filter(|entry| match audience {
                Audience::All => true,
                Audience::Session(session_id) => entry.connection.session_id == session_id,
            })
            .map(|entry| Recipient {
                connection_id: entry.connection.id.clone(),
                sender: entry.sender.clone(),
            })
            .collect()
    }

    /// Queue a frame for one connection
    pub fn send(&self, id: &str, frame: Arc<str>) -> Result<(), DeliveryError> {
        self.recipient(id)
            .ok_or_else(|| DeliveryError::NotConnected(id.to_string()))?
            .send(frame)
    }

    pub fn session_members(&self, session_id: &str) -> Vec<ConnectionId> {
        self.recipients(Audience::Session(session_id))
            .into_iter()
            .map(|r| r.connection_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

/// A successfully authenticated connection
pub struct Admission {
    pub connection: Connection,
    pub resolution: SessionResolution,
    /// Frames queued for this connection's socket
    pub outbound: mpsc::Receiver<Arc<str>>,
}

impl AppState {
    /// Authenticate a connection attempt and register it.
    ///
    /// The verifier is consulted exactly once, and only for a non-blank
    /// credential. Nothing is registered on failure.
    pub fn admit(
        &self,
        credential: Option<&str>,
        requested_session: Option<&str>,
    ) -> Result<Admission, AuthError> {
        let credential = credential
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or(AuthError::MissingCredential)?;

        let principal = self.verifier.verify(credential)?;
        let resolution = self.sessions.resolve(requested_session, &principal);

        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let connection = Connection {
            id: new_id(),
            principal,
            session_id: resolution.session_id().clone(),
            created_at: chrono::Utc::now(),
        };
        self.connections.insert(connection.clone(), tx);

        tracing::info!(
            "Admitted {} as connection {} ({:?})",
            connection.principal.id,
            connection.id,
            resolution
        );

        Ok(Admission {
            connection,
            resolution,
            outbound: rx,
        })
    }

    /// Forget a connection; safe to call more than once
    pub fn disconnect(&self, connection_id: &str) -> Option<Connection> {
        let removed = self.connections.remove(connection_id);
        if let Some(connection) = &removed {
            tracing::info!(
                "Connection {} ({}) removed",
                connection.id,
                connection.principal.id
            );
        }
        removed
    }
}
