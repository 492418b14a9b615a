mod connection;
mod session;

pub use connection::{
    Admission, Audience, ConnectionRegistry, DeliveryError, Recipient, OUTBOUND_BUFFER,
};
pub use session::{SessionConfig, SessionError, SessionLease, SessionStore};

use crate::auth::PrincipalVerifier;
use crate::proxy::OutboundCallProxy;
use std::sync::Arc;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub connections: ConnectionRegistry,
    pub sessions: SessionStore,
    pub verifier: Arc<dyn PrincipalVerifier>,
    pub proxy: OutboundCallProxy,
}

impl AppState {
    pub fn new(
        verifier: Arc<dyn PrincipalVerifier>,
        proxy: OutboundCallProxy,
        session_config: SessionConfig,
    ) -> Self {
        Self {
            connections: ConnectionRegistry::new(),
            sessions: SessionStore::new(session_config),
            verifier,
            proxy,
        }
    }
}

#[cfg(test)]
pub(crate) fn test_state() -> AppState {
    use crate::auth::AuthError;
    use crate::backend::InternalBackend;
    use crate::types::Principal;
    use std::time::Duration;

    /// "good" is alice, "bob" is bob, anything else is refused
    struct FixedVerifier;

    impl PrincipalVerifier for FixedVerifier {
        fn verify(&self, credential: &str) -> Result<Principal, AuthError> {
            match credential {
                "good" => Ok(Principal::new("alice")),
                "bob" => Ok(Principal::new("bob")),
                other => Err(AuthError::Rejected(format!("unknown credential {}", other))),
            }
        }
    }

    AppState::new(
        Arc::new(FixedVerifier),
        OutboundCallProxy::new(Arc::new(InternalBackend::new()), Duration::from_secs(10)),
        SessionConfig::default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionResolution;

    #[test]
    fn test_new_state_is_empty() {
        let state = test_state();
        assert!(state.connections.is_empty());
        assert!(state.sessions.is_empty());
        assert_eq!(state.proxy.deadline(), std::time::Duration::from_secs(10));
    }

    #[test]
    fn test_connections_share_a_requested_session() {
        let state = test_state();
        let first = state.admit(Some("good"), Some("shared")).unwrap();
        let second = state.admit(Some("good"), Some("shared")).unwrap();

        assert_eq!(
            first.resolution,
            SessionResolution::Recreated("shared".to_string())
        );
        assert_eq!(
            second.resolution,
            SessionResolution::Resolved("shared".to_string())
        );
        assert_eq!(state.connections.session_members("shared").len(), 2);
    }
}
