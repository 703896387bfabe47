//! Authentication and permission collaborators.
//!
//! The core consumes two seams: a credential verifier called once per HTTP
//! request and at the WebSocket handshake, and an optional permission
//! oracle consulted before a task is admitted. OIDC-backed verification is
//! an external collaborator; the bundled verifier checks static
//! `client_id:secret` credentials by SHA-256 digest.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use flowrunner_proto::{Claims, Client, RunnerError, RunnerResult, TASKS_AUDIENCE};

/// Hex SHA-256 digest of a secret.
pub fn sha256_hex(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Verifies a bearer credential into [`Claims`].
#[async_trait]
pub trait AuthVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> RunnerResult<Claims>;
}

/// Decides whether a subject may run tasks right now.
///
/// A denial maps to HTTP 429 with the reason; absence of an oracle means
/// allow.
#[async_trait]
pub trait PermissionOracle: Send + Sync {
    async fn may_run(&self, subject: &str) -> RunnerResult<()>;
}

/// The default oracle: everyone may run.
pub struct AllowAll;

#[async_trait]
impl PermissionOracle for AllowAll {
    async fn may_run(&self, _subject: &str) -> RunnerResult<()> {
        Ok(())
    }
}

/// A `client_id:secret` pair from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientCredential {
    pub id: String,
    pub secret: String,
}

impl ClientCredential {
    /// Parse one `id:secret` pair.
    pub fn parse(raw: &str) -> RunnerResult<Self> {
        let (id, secret) = raw.split_once(':').ok_or_else(|| {
            RunnerError::ValidationFailed(format!(
                "credential {raw:?} must be formatted as id:secret"
            ))
        })?;
        if id.is_empty() || secret.is_empty() {
            return Err(RunnerError::ValidationFailed(
                "credential id and secret must be non-empty".into(),
            ));
        }
        Ok(Self {
            id: id.to_string(),
            secret: secret.to_string(),
        })
    }

    /// Parse a comma-separated list of pairs.
    pub fn parse_list(raw: &str) -> RunnerResult<Vec<Self>> {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Self::parse)
            .collect()
    }
}

impl From<&ClientCredential> for Client {
    fn from(cred: &ClientCredential) -> Self {
        Client {
            id: cred.id.clone(),
            secret_hash: sha256_hex(&cred.secret),
            audience: TASKS_AUDIENCE.to_string(),
        }
    }
}

/// Verifier over a static set of registered clients.
pub struct StaticTokenVerifier {
    clients: HashMap<String, Client>,
}

impl StaticTokenVerifier {
    pub fn new(clients: impl IntoIterator<Item = Client>) -> Self {
        Self {
            clients: clients.into_iter().map(|c| (c.id.clone(), c)).collect(),
        }
    }

    /// Build from configured credentials.
    pub fn from_credentials(credentials: &[ClientCredential]) -> Self {
        Self::new(credentials.iter().map(Client::from))
    }
}

#[async_trait]
impl AuthVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> RunnerResult<Claims> {
        let (id, secret) = token
            .split_once(':')
            .ok_or_else(|| RunnerError::AuthInvalid("malformed credential".into()))?;
        let client = self
            .clients
            .get(id)
            .ok_or_else(|| RunnerError::AuthInvalid("unknown client".into()))?;
        if sha256_hex(secret) != client.secret_hash {
            return Err(RunnerError::AuthInvalid("secret mismatch".into()));
        }
        Ok(Claims {
            subject: client.id.clone(),
            audience: client.audience.clone(),
            scopes: vec!["tasks".to_string()],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier() -> StaticTokenVerifier {
        StaticTokenVerifier::from_credentials(&[ClientCredential {
            id: "acme".into(),
            secret: "s3cret".into(),
        }])
    }

    #[tokio::test]
    async fn test_verify_known_client() {
        let claims = verifier().verify("acme:s3cret").await.unwrap();
        assert_eq!(claims.subject, "acme");
        assert_eq!(claims.audience, TASKS_AUDIENCE);
    }

    #[tokio::test]
    async fn test_verify_rejects_bad_secret() {
        let err = verifier().verify("acme:wrong").await.unwrap_err();
        assert!(matches!(err, RunnerError::AuthInvalid(_)));
    }

    #[tokio::test]
    async fn test_verify_rejects_unknown_client() {
        let err = verifier().verify("ghost:s3cret").await.unwrap_err();
        assert!(matches!(err, RunnerError::AuthInvalid(_)));
    }

    #[test]
    fn test_credential_list_parsing() {
        let creds = ClientCredential::parse_list("a:1, b:2").unwrap();
        assert_eq!(creds.len(), 2);
        assert_eq!(creds[1].id, "b");
        assert!(ClientCredential::parse_list("oops").is_err());
    }
}
