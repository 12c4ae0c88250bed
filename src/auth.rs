//! API key authentication for the query endpoints.

use crate::error::{GatewayError, GatewayResult};
use subtle::ConstantTimeEq;
use tracing::warn;

/// Holds the single shared API key for the process lifetime.
#[derive(Clone)]
pub struct ApiKeyGuard {
    expected: Vec<u8>,
}

impl ApiKeyGuard {
    /// Create a guard for the configured key.
    pub fn new(api_key: &str) -> Result<Self, String> {
        let trimmed = api_key.trim();
        if trimmed.is_empty() {
            return Err("Empty API key in configuration".to_string());
        }
        Ok(Self {
            expected: trimmed.as_bytes().to_vec(),
        })
    }

    /// Verify a presented key. Missing, empty and mismatched keys are rejected.
    pub fn verify(&self, presented: Option<&str>) -> GatewayResult<()> {
        let Some(key) = presented.filter(|k| !k.is_empty()) else {
            warn!("Authentication failed: missing api_key");
            return Err(GatewayError::Unauthorized);
        };

        if constant_time_eq(key.as_bytes(), &self.expected) {
            Ok(())
        } else {
            warn!(key_prefix = %mask_key(key), "Authentication failed: invalid api_key");
            Err(GatewayError::Unauthorized)
        }
    }
}

impl std::fmt::Debug for ApiKeyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyGuard")
            .field("expected", &"****")
            .finish()
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Keep at most the first three characters of a presented key.
pub(crate) fn mask_key(key: &str) -> String {
    if key.chars().count() <= 3 {
        "***".to_string()
    } else {
        let prefix: String = key.chars().take(3).collect();
        format!("{}***", prefix)
    }
}
