//! Request gating: authentication, then rate limiting.

use crate::auth::ApiKeyGuard;
use crate::error::{GatewayError, GatewayResult};
use crate::models::ExecutorKind;
use crate::rate_limit::{RateDecision, RateLimitKey, RateLimiter};
use std::sync::Arc;
use tracing::{debug, warn};

/// Admission control shared by both query endpoints.
#[derive(Debug, Clone)]
pub struct RequestGate {
    guard: ApiKeyGuard,
    limiter: Arc<RateLimiter>,
    key: RateLimitKey,
}

impl RequestGate {
    pub fn new(guard: ApiKeyGuard, limiter: Arc<RateLimiter>, key: RateLimitKey) -> Self {
        Self {
            guard,
            limiter,
            key,
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Admit or reject a request for `route` from `client`.
    ///
    /// Authentication runs first, so unauthenticated requests never consume
    /// rate limit budget.
    pub fn admit(
        &self,
        route: ExecutorKind,
        api_key: Option<&str>,
        client: &str,
    ) -> GatewayResult<()> {
        self.guard.verify(api_key)?;

        let identity = match self.key {
            RateLimitKey::Ip => client,
            // verify() guarantees a key is present here
            RateLimitKey::ApiKey => api_key.unwrap_or(client),
        };

        match self.limiter.check(route.as_str(), identity) {
            RateDecision::Allowed { remaining } => {
                debug!(route = route.as_str(), client, remaining, "Request admitted");
                Ok(())
            }
            RateDecision::Denied { retry_after } => {
                warn!(
                    route = route.as_str(),
                    client,
                    retry_after_secs = retry_after.as_secs(),
                    "Rate limit exceeded"
                );
                Err(GatewayError::rate_limited(retry_after.as_secs()))
            }
        }
    }
}
