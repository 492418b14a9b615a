//! Credential verification for WebSocket connections

use crate::types::Principal;
use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

/// Why a connection attempt was refused
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication token")]
    MissingCredential,

    #[error("Malformed authentication token")]
    Malformed,

    #[error("Invalid or expired token")]
    Rejected(String),

    #[error("Invalid token payload")]
    MissingSubject,
}

/// Maps an opaque credential to a principal.
///
/// Implementations are stateless from the broker's point of view.
pub trait PrincipalVerifier: Send + Sync {
    fn verify(&self, credential: &str) -> Result<Principal, AuthError>;
}

/// Authentication configuration
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// HS256 secret (None = no JWT will verify)
    pub jwt_secret: Option<String>,
    /// Static token accepted as-is, for local testing
    pub dev_token: Option<String>,
    /// Principal the dev token maps to
    pub dev_user: String,
}

impl AuthConfig {
    /// Load auth config from environment variables
    pub fn from_env() -> Self {
        let jwt_secret = non_empty_env("JWT_SECRET");
        let dev_token = non_empty_env("DEV_TOKEN");
        let dev_user = non_empty_env("DEV_TOKEN_USER").unwrap_or_else(|| "user".to_string());

        if jwt_secret.is_none() {
            tracing::warn!("JWT_SECRET not set - only the dev token (if any) will be accepted");
        }
        if dev_token.is_some() {
            tracing::warn!("DEV_TOKEN is set - a static credential maps to '{}'", dev_user);
        }

        Self {
            jwt_secret,
            dev_token,
            dev_user,
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    sub: Option<String>,
}

/// HS256 JWT verifier with an optional static dev token
pub struct JwtVerifier {
    decoding_key: Option<DecodingKey>,
    dev_token: Option<String>,
    dev_user: String,
}

impl JwtVerifier {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            decoding_key: config
                .jwt_secret
                .as_ref()
                .map(|secret| DecodingKey::from_secret(secret.as_bytes())),
            dev_token: config.dev_token.clone(),
            dev_user: config.dev_user.clone(),
        }
    }
}

impl PrincipalVerifier for JwtVerifier {
    fn verify(&self, credential: &str) -> Result<Principal, AuthError> {
        if let Some(dev_token) = &self.dev_token {
            if constant_time_eq(dev_token.as_bytes(), credential.as_bytes()) {
                return Ok(Principal::new(self.dev_user.clone()));
            }
        }

        if credential.split('.').count() != 3 {
            return Err(AuthError::Malformed);
        }

        let Some(key) = &self.decoding_key else {
            return Err(AuthError::Rejected("no JWT secret configured".to_string()));
        };

        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();

        let data = decode::<Claims>(credential, key, &validation).map_err(|e| match e.kind() {
            ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
                AuthError::Malformed
            }
            _ => AuthError::Rejected(e.to_string()),
        })?;

        match data.claims.sub {
            Some(sub) if !sub.trim().is_empty() => Ok(Principal::new(sub)),
            _ => Err(AuthError::MissingSubject),
        }
    }
}

/// Constant-time byte comparison to prevent timing attacks
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}
