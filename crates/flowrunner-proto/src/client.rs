//! Client — an authenticated submitter of tasks.
//!
//! Clients carry credential material as a digest, never the secret itself.
//! The active-task count is derived from the task store and is bounded by
//! the configured per-client quota.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The audience tag stamped on tokens minted for the task surface.
pub const TASKS_AUDIENCE: &str = "tasks-api";

/// A registered client of the task surface.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    /// Unique client identifier.
    pub id: String,

    /// Hex SHA-256 digest of the client secret.
    pub secret_hash: String,

    /// Audience tag the client's tokens must carry.
    pub audience: String,
}

/// Verified identity attached to a request after authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// The authenticated client id.
    pub subject: String,

    /// Audience the credential was minted for.
    pub audience: String,

    /// Granted scopes.
    pub scopes: Vec<String>,
}

impl Claims {
    /// Claims for a client of the task surface.
    pub fn for_client(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            audience: TASKS_AUDIENCE.to_string(),
            scopes: vec!["tasks".to_string()],
        }
    }
}
