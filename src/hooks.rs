use std::env;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{AgentError, Result};

/// Gate run before every invocation. A failure aborts the query before any model call.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, user_id: &str) -> Result<()>;
}

/// A bearer token checked against an allow-list.
///
/// The token comes from `access_token`, falling back to the `token_env` variable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenCredentials {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default)]
    pub allowed_tokens: Vec<String>,
}

impl TokenCredentials {
    pub fn new(access_token: impl Into<String>, allowed_tokens: Vec<String>) -> Self {
        Self {
            access_token: Some(access_token.into()),
            token_env: None,
            allowed_tokens,
        }
    }

    pub fn from_env(var: impl Into<String>, allowed_tokens: Vec<String>) -> Self {
        Self {
            access_token: None,
            token_env: Some(var.into()),
            allowed_tokens,
        }
    }

    pub fn token(&self) -> Option<String> {
        self.access_token
            .clone()
            .or_else(|| self.token_env.as_ref().and_then(|var| env::var(var).ok()))
            .filter(|token| !token.is_empty())
    }

    /// `Err` carries the denial reason.
    pub fn verify(&self) -> std::result::Result<(), String> {
        let token = self
            .token()
            .ok_or_else(|| "Authentication failed: no access token provided".to_string())?;
        if self.allowed_tokens.iter().any(|allowed| allowed == &token) {
            Ok(())
        } else {
            Err("Authentication failed: access token is not valid".to_string())
        }
    }
}

#[async_trait]
impl Authenticator for TokenCredentials {
    async fn authenticate(&self, user_id: &str) -> Result<()> {
        match self.verify() {
            Ok(()) => {
                info!(user_id, "authenticated");
                Ok(())
            }
            Err(reason) => {
                warn!(user_id, %reason, "authentication failed");
                Err(AgentError::Unauthorized(reason))
            }
        }
    }
}
