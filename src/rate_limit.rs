//! Fixed-window rate limiting for the query endpoints.
//!
//! Each (route, caller identity) pair gets its own counter. A counter allows
//! up to `count` requests per window; the window starts at the first request
//! and is replaced by a fresh one once it has elapsed.
//!
//! Counters live in a Moka cache whose time-to-live equals the window length,
//! so idle callers are evicted without a sweeper task.

use clap::ValueEnum;
use moka::sync::Cache;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Time unit of a rate expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl RateUnit {
    fn secs(self) -> u64 {
        match self {
            Self::Second => 1,
            Self::Minute => 60,
            Self::Hour => 3_600,
            Self::Day => 86_400,
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "second" | "seconds" => Some(Self::Second),
            "minute" | "minutes" => Some(Self::Minute),
            "hour" | "hours" => Some(Self::Hour),
            "day" | "days" => Some(Self::Day),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Second => "second",
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
        }
    }
}

/// Errors from parsing a rate expression.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RateParseError {
    #[error("rate limit must look like \"<count>/<unit>\", got {0:?}")]
    Format(String),

    #[error("rate limit count must be a positive integer, got {0:?}")]
    Count(String),

    #[error("unknown rate limit unit {0:?} (expected second, minute, hour or day)")]
    Unit(String),
}

/// A parsed rate limit such as `100/hour`, `10 per minute` or `50/5 minutes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateExpression {
    count: u32,
    multiplier: u32,
    unit: RateUnit,
}

impl RateExpression {
    pub fn new(count: u32, multiplier: u32, unit: RateUnit) -> Self {
        Self {
            count: count.max(1),
            multiplier: multiplier.max(1),
            unit,
        }
    }

    /// Maximum number of requests per window.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Length of one window.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.unit.secs() * u64::from(self.multiplier))
    }
}

impl FromStr for RateExpression {
    type Err = RateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        let (count, period) = normalized
            .split_once('/')
            .or_else(|| normalized.split_once(" per "))
            .ok_or_else(|| RateParseError::Format(s.to_string()))?;

        let count = count.trim();
        let count: u32 = count
            .parse()
            .ok()
            .filter(|c| *c > 0)
            .ok_or_else(|| RateParseError::Count(count.to_string()))?;

        let period = period.trim();
        let split_at = period
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(period.len());
        let (multiplier, unit) = period.split_at(split_at);
        let multiplier = if multiplier.is_empty() {
            1
        } else {
            multiplier
                .parse::<u32>()
                .ok()
                .filter(|m| *m > 0)
                .ok_or_else(|| RateParseError::Format(s.to_string()))?
        };
        let unit = unit.trim();
        let unit = RateUnit::parse(unit).ok_or_else(|| RateParseError::Unit(unit.to_string()))?;

        Ok(Self::new(count, multiplier, unit))
    }
}

impl fmt::Display for RateExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.multiplier == 1 {
            write!(f, "{}/{}", self.count, self.unit.as_str())
        } else {
            write!(f, "{}/{} {}s", self.count, self.multiplier, self.unit.as_str())
        }
    }
}

/// What identifies a caller for rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum RateLimitKey {
    /// Client IP address
    #[default]
    Ip,
    /// Presented API key
    ApiKey,
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Denied { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RateKey {
    route: &'static str,
    identity: String,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Process-wide fixed-window rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    limit: RateExpression,
    windows: Cache<RateKey, Arc<Mutex<Window>>>,
}

impl RateLimiter {
    pub fn new(limit: RateExpression) -> Self {
        let windows = Cache::builder().time_to_live(limit.window()).build();
        Self { limit, windows }
    }

    pub fn limit(&self) -> RateExpression {
        self.limit
    }

    /// Count a request from `identity` on `route` and decide whether it may proceed.
    pub fn check(&self, route: &'static str, identity: &str) -> RateDecision {
        self.check_at(route, identity, Instant::now())
    }

    /// Same as [`check`](Self::check) with an explicit clock reading.
    pub fn check_at(&self, route: &'static str, identity: &str, now: Instant) -> RateDecision {
        let key = RateKey {
            route,
            identity: identity.to_string(),
        };
        let entry = self.windows.get_with(key, || {
            Arc::new(Mutex::new(Window {
                started: now,
                count: 0,
            }))
        });

        let window_len = self.limit.window();
        let mut window = entry.lock().unwrap_or_else(PoisonError::into_inner);

        // The cache clock and `now` can disagree; the window decides.
        if now.saturating_duration_since(window.started) >= window_len {
            *window = Window {
                started: now,
                count: 0,
            };
        }

        if window.count >= self.limit.count {
            let left = window_len.saturating_sub(now.saturating_duration_since(window.started));
            return RateDecision::Denied {
                retry_after: round_up_secs(left),
            };
        }

        window.count += 1;
        RateDecision::Allowed {
            remaining: self.limit.count - window.count,
        }
    }

    /// Number of live (route, identity) windows.
    pub fn tracked(&self) -> u64 {
        self.windows.run_pending_tasks();
        self.windows.entry_count()
    }
}

/// Whole seconds, rounded up, never below one.
fn round_up_secs(d: Duration) -> Duration {
    let mut secs = d.as_secs();
    if d.subsec_nanos() > 0 {
        secs += 1;
    }
    Duration::from_secs(secs.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_slash_form() {
        let rate: RateExpression = "100/hour".parse().unwrap();
        assert_eq!(rate.count(), 100);
        assert_eq!(rate.window(), Duration::from_secs(3600));
    }

    #[test]
    fn test_parse_per_form_and_plurals() {
        let rate: RateExpression = "10 per minute".parse().unwrap();
        assert_eq!(rate.count(), 10);
        assert_eq!(rate.window(), Duration::from_secs(60));

        let rate: RateExpression = "5/Seconds".parse().unwrap();
        assert_eq!(rate.window(), Duration::from_secs(1));

        let rate: RateExpression = " 1000 / day ".parse().unwrap();
        assert_eq!(rate.count(), 1000);
        assert_eq!(rate.window(), Duration::from_secs(86_400));
    }

    #[test]
    fn test_parse_multiplier() {
        let rate: RateExpression = "10/5 minutes".parse().unwrap();
        assert_eq!(rate.count(), 10);
        assert_eq!(rate.window(), Duration::from_secs(300));

        let rate: RateExpression = "3/2hours".parse().unwrap();
        assert_eq!(rate.window(), Duration::from_secs(7200));
        assert_eq!(rate.to_string(), "3/2 hours");
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            "100".parse::<RateExpression>(),
            Err(RateParseError::Format(_))
        ));
        assert!(matches!(
            "0/hour".parse::<RateExpression>(),
            Err(RateParseError::Count(_))
        ));
        assert!(matches!(
            "many/hour".parse::<RateExpression>(),
            Err(RateParseError::Count(_))
        ));
        assert!(matches!(
            "10/fortnight".parse::<RateExpression>(),
            Err(RateParseError::Unit(_))
        ));
        assert!(matches!(
            "10/0 minutes".parse::<RateExpression>(),
            Err(RateParseError::Format(_))
        ));
    }

    #[test]
    fn test_display_round_trips_simple_form() {
        let rate: RateExpression = "2/minute".parse().unwrap();
        assert_eq!(rate.to_string(), "2/minute");
    }

    #[test]
    fn test_allows_up_to_count_then_denies() {
        let limiter = RateLimiter::new("3/minute".parse().unwrap());
        let now = Instant::now();

        assert_eq!(
            limiter.check_at("direct", "10.0.0.1", now),
            RateDecision::Allowed { remaining: 2 }
        );
        assert!(limiter.check_at("direct", "10.0.0.1", now).is_allowed());
        assert!(limiter.check_at("direct", "10.0.0.1", now).is_allowed());

        let denied = limiter.check_at("direct", "10.0.0.1", now + Duration::from_millis(20_500));
        assert_eq!(
            denied,
            RateDecision::Denied {
                retry_after: Duration::from_secs(40)
            }
        );
    }

    #[test]
    fn test_window_resets_after_elapsed() {
        let limiter = RateLimiter::new("1/second".parse().unwrap());
        let now = Instant::now();

        assert!(limiter.check_at("pooled", "a", now).is_allowed());
        assert!(!limiter.check_at("pooled", "a", now).is_allowed());
        assert!(
            limiter
                .check_at("pooled", "a", now + Duration::from_secs(1))
                .is_allowed()
        );
    }

    #[test]
    fn test_retry_after_is_at_least_one_second() {
        let limiter = RateLimiter::new("1/second".parse().unwrap());
        let now = Instant::now();
        limiter.check_at("pooled", "a", now);
        let decision = limiter.check_at("pooled", "a", now + Duration::from_millis(999));
        assert_eq!(
            decision,
            RateDecision::Denied {
                retry_after: Duration::from_secs(1)
            }
        );
    }

    #[test]
    fn test_counters_are_independent_per_route_and_identity() {
        let limiter = RateLimiter::new("1/hour".parse().unwrap());
        let now = Instant::now();

        assert!(limiter.check_at("pooled", "a", now).is_allowed());
        assert!(limiter.check_at("direct", "a", now).is_allowed());
        assert!(limiter.check_at("pooled", "b", now).is_allowed());
        assert!(!limiter.check_at("pooled", "a", now).is_allowed());
        assert_eq!(limiter.tracked(), 3);
    }

    #[test]
    fn test_denied_requests_do_not_extend_window() {
        let limiter = RateLimiter::new("1/minute".parse().unwrap());
        let now = Instant::now();
        limiter.check_at("pooled", "a", now);
        for s in 1..59 {
            assert!(
                !limiter
                    .check_at("pooled", "a", now + Duration::from_secs(s))
                    .is_allowed()
            );
        }
        assert!(
            limiter
                .check_at("pooled", "a", now + Duration::from_secs(60))
                .is_allowed()
        );
    }

    #[test]
    fn test_idle_windows_expire_from_cache() {
        let limiter = RateLimiter::new("1/second".parse().unwrap());
        assert!(limiter.check("pooled", "idle").is_allowed());
        assert!(!limiter.check("pooled", "idle").is_allowed());
        assert_eq!(limiter.tracked(), 1);

        std::thread::sleep(Duration::from_millis(1_200));
        assert_eq!(limiter.tracked(), 0);
        assert!(limiter.check("pooled", "idle").is_allowed());
    }

    #[test]
    fn test_concurrent_checks_never_exceed_limit() {
        let limiter = Arc::new(RateLimiter::new("50/hour".parse().unwrap()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    (0..20)
                        .filter(|_| limiter.check("pooled", "shared").is_allowed())
                        .count()
                })
            })
            .collect();
        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(allowed, 50);
    }
}
