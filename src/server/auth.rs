//! Subscribe credential verification.
//!
//! The gateway authenticates each channel exactly once, at subscribe time,
//! through the [`TokenVerifier`] seam. Everything after the handshake trusts
//! the [`Principal`] bound to the channel.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::protocol::ClientId;

/// Identity a verified credential resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub client_id: ClientId,
    /// Display name shown in presence rosters.
    pub name: String,
    /// Role label carried on deltas this client produces.
    pub role: String,
}

/// Credential rejection. The session layer maps this to an `AUTH_FAILED`
/// error and closes the channel; clients must not retry.
#[derive(Debug, Clone, thiserror::Error)]
#[error("credential rejected: {0}")]
pub struct AuthError(pub String);

/// Verifies the opaque credential presented at subscribe time.
#[async_trait]
pub trait TokenVerifier: Send + Sync + 'static {
    async fn verify(&self, token: &str) -> Result<Principal, AuthError>;
}

/// A fixed token-to-principal table. The test and single-process backend;
/// production deployments plug in a JWT verifier behind the same trait.
#[derive(Debug, Default)]
pub struct StaticTokenVerifier {
    principals: HashMap<String, Principal>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a credential.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>, principal: Principal) -> Self {
        self.principals.insert(token.into(), principal);
        self
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        self.principals
            .get(token)
            .cloned()
            .ok_or_else(|| AuthError("unknown token".into()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn principal() -> Principal {
        Principal {
            client_id: Uuid::from_u128(1),
            name: "Ada".into(),
            role: "editor".into(),
        }
    }

    #[tokio::test]
    async fn known_token_resolves() {
        let verifier = StaticTokenVerifier::new().with_token("t-1", principal());
        let resolved = verifier.verify("t-1").await.unwrap();
        assert_eq!(resolved, principal());
    }

    #[tokio::test]
    async fn unknown_token_is_rejected() {
        let verifier = StaticTokenVerifier::new().with_token("t-1", principal());
        assert!(verifier.verify("t-2").await.is_err());
    }
}
