//! Cache policy state machine.
//!
//! Given a mode, an optional TTL and the newest stored response for a
//! request's (hash, bucket), decide whether to serve it, fetch fresh, or
//! refuse. The policy never touches storage itself.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;
use crate::model::Response;

/// Policy controlling cache usage and persistence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Serve a stored response if it is within TTL, else fetch and persist.
    #[default]
    Default,
    /// Always fetch and persist a new response.
    Bypass,
    /// Fetch without persisting anything.
    Never,
    /// Serve any stored response regardless of TTL; never fetch.
    OnlyIfCached,
    /// Same as `Default`. No conditional upstream request is made.
    Revalidate,
}

impl CacheMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheMode::Default => "default",
            CacheMode::Bypass => "bypass",
            CacheMode::Never => "never",
            CacheMode::OnlyIfCached => "only_if_cached",
            CacheMode::Revalidate => "revalidate",
        }
    }
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(CacheMode::Default),
            "bypass" => Ok(CacheMode::Bypass),
            "never" => Ok(CacheMode::Never),
            "only_if_cached" => Ok(CacheMode::OnlyIfCached),
            "revalidate" => Ok(CacheMode::Revalidate),
            other => Err(Error::InvalidInput(format!("unknown cache mode: {other}"))),
        }
    }
}

/// What to do with a request after consulting the store.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheDecision {
    /// Serve this stored response.
    Hit(Response),
    /// Call the adapter.
    Fetch,
    /// Nothing servable and fetching is not allowed.
    Refuse,
}

impl CacheDecision {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheDecision::Hit(_))
    }
}

/// Cache mode plus freshness window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CachePolicy {
    pub mode: CacheMode,
    pub ttl: Option<Duration>,
}

impl CachePolicy {
    pub fn new(mode: CacheMode, ttl: Option<Duration>) -> Self {
        Self { mode, ttl }
    }

    /// `true` maps to `Default`, `false` to `Bypass`.
    pub fn from_use_cache(use_cache: bool, ttl: Option<Duration>) -> Self {
        let mode = if use_cache { CacheMode::Default } else { CacheMode::Bypass };
        Self { mode, ttl }
    }

    /// Whether a stored response may be looked up at all.
    pub fn consults_cache(&self) -> bool {
        !matches!(self.mode, CacheMode::Bypass | CacheMode::Never)
    }

    /// Whether fetched results are written to the payload and metadata stores.
    pub fn persists(&self) -> bool {
        self.mode != CacheMode::Never
    }

    /// Whether the adapter may be called.
    pub fn may_fetch(&self) -> bool {
        self.mode != CacheMode::OnlyIfCached
    }

    /// TTL a short-circuit cache store should apply; `None` means any age.
    pub fn freshness_window(&self) -> Option<Duration> {
        match self.mode {
            CacheMode::OnlyIfCached => None,
            _ => self.ttl,
        }
    }

    pub fn ttl_seconds(&self) -> Option<f64> {
        self.ttl.map(|d| d.as_secs_f64())
    }

    /// Whether `response` is young enough to serve at `now`.
    pub fn is_fresh(&self, response: &Response, now: DateTime<Utc>) -> bool {
        let Some(ttl) = self.ttl else {
            return true;
        };
        let age = now.signed_duration_since(response.fetched_at);
        // Clock skew can make a row look like it comes from the future; that is still fresh.
        match age.to_std() {
            Ok(age) => age <= ttl,
            Err(_) => true,
        }
    }

    /// Decide how to satisfy a request given its newest stored response.
    pub fn evaluate(&self, cached: Option<Response>, now: DateTime<Utc>) -> CacheDecision {
        match self.mode {
            CacheMode::Bypass | CacheMode::Never => CacheDecision::Fetch,
            CacheMode::OnlyIfCached => match cached {
                Some(response) => CacheDecision::Hit(response),
                None => CacheDecision::Refuse,
            },
            CacheMode::Default | CacheMode::Revalidate => match cached {
                Some(response) if self.is_fresh(&response, now) => CacheDecision::Hit(response),
                _ => CacheDecision::Fetch,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResponseStatus;

    fn response_aged(secs: i64) -> Response {
        let mut r = Response::from_bytes("req", ResponseStatus::Ok, b"data", "/tmp/x.bin");
        r.fetched_at = Utc::now() - chrono::Duration::seconds(secs);
        r
    }

    #[test]
    fn test_default_hits_without_ttl() {
        let policy = CachePolicy::new(CacheMode::Default, None);
        let decision = policy.evaluate(Some(response_aged(86_400)), Utc::now());
        assert!(matches!(decision, CacheDecision::Hit(_)));
    }

    #[test]
    fn test_default_respects_ttl() {
        let policy = CachePolicy::new(CacheMode::Default, Some(Duration::from_secs(10)));
        assert!(matches!(policy.evaluate(Some(response_aged(5)), Utc::now()), CacheDecision::Hit(_)));
        assert_eq!(policy.evaluate(Some(response_aged(11)), Utc::now()), CacheDecision::Fetch);
        assert_eq!(policy.evaluate(None, Utc::now()), CacheDecision::Fetch);
    }

    #[test]
    fn test_ttl_boundary_is_inclusive() {
        let policy = CachePolicy::new(CacheMode::Default, Some(Duration::from_secs(10)));
        let r = response_aged(0);
        let now = r.fetched_at + chrono::Duration::seconds(10);
        assert!(policy.is_fresh(&r, now));
        assert!(!policy.is_fresh(&r, now + chrono::Duration::milliseconds(1)));
    }

    #[test]
    fn test_revalidate_matches_default() {
        let ttl = Some(Duration::from_secs(10));
        let default = CachePolicy::new(CacheMode::Default, ttl);
        let revalidate = CachePolicy::new(CacheMode::Revalidate, ttl);
        for age in [0, 5, 11] {
            let now = Utc::now();
            assert_eq!(
                default.evaluate(Some(response_aged(age)), now).is_hit(),
                revalidate.evaluate(Some(response_aged(age)), now).is_hit()
            );
        }
    }

    #[test]
    fn test_only_if_cached_ignores_ttl_and_refuses_on_miss() {
        let policy = CachePolicy::new(CacheMode::OnlyIfCached, Some(Duration::ZERO));
        assert!(policy.evaluate(Some(response_aged(3600)), Utc::now()).is_hit());
        assert_eq!(policy.evaluate(None, Utc::now()), CacheDecision::Refuse);
        assert!(!policy.may_fetch());
        assert_eq!(policy.freshness_window(), None);
    }

    #[test]
    fn test_bypass_and_never_always_fetch() {
        for mode in [CacheMode::Bypass, CacheMode::Never] {
            let policy = CachePolicy::new(mode, None);
            assert!(!policy.consults_cache());
            assert_eq!(policy.evaluate(Some(response_aged(0)), Utc::now()), CacheDecision::Fetch);
        }
        assert!(CachePolicy::new(CacheMode::Bypass, None).persists());
        assert!(!CachePolicy::new(CacheMode::Never, None).persists());
    }

    #[test]
    fn test_use_cache_shim() {
        assert_eq!(CachePolicy::from_use_cache(true, None).mode, CacheMode::Default);
        assert_eq!(CachePolicy::from_use_cache(false, None).mode, CacheMode::Bypass);
    }

    #[test]
    fn test_cache_mode_names() {
        for mode in [
            CacheMode::Default,
            CacheMode::Bypass,
            CacheMode::Never,
            CacheMode::OnlyIfCached,
            CacheMode::Revalidate,
        ] {
            assert_eq!(mode.as_str().parse::<CacheMode>().unwrap(), mode);
            assert_eq!(serde_json::to_value(mode).unwrap(), serde_json::Value::from(mode.as_str()));
        }
        assert!("ONLY_IF_CACHED".parse::<CacheMode>().is_err());
    }
}
