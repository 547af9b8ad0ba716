use std::collections::HashSet;

use crate::config::AuthConfig;
use crate::error::{TrackerError, TrackerResult};

/// Bearer-token check at the dashboard boundary.
///
/// An authorizer with no tokens configured rejects every caller.
#[derive(Debug, Clone, Default)]
pub struct Authorizer {
    tokens: HashSet<String>,
}

impl Authorizer {
    pub fn new(tokens: impl IntoIterator<Item = String>) -> Self {
        Self {
            tokens: tokens
                .into_iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(config.api_tokens.iter().cloned())
    }

    /// Accepts a raw token or an `Authorization` header value (`Bearer <token>`).
    pub fn authorize(&self, credential: Option<&str>) -> TrackerResult<()> {
        let Some(credential) = credential.map(str::trim).filter(|c| !c.is_empty()) else {
            return Err(TrackerError::Unauthorized("missing credentials".into()));
        };
        let token = credential
            .strip_prefix("Bearer ")
            .map(str::trim)
            .unwrap_or(credential);
        if self.tokens.contains(token) {
            Ok(())
        } else {
            Err(TrackerError::Unauthorized("invalid credentials".into()))
        }
    }
}
