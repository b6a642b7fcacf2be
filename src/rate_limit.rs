//! Per-caller request quotas over rolling windows.
//!
//! Two policies: anonymous callers keyed by IP address and authenticated
//! callers keyed by user id.  A window opens at the first request after the
//! previous one expired, not at a clock boundary.  Counters live behind
//! [`RateLimitStore`], whose single operation must check and consume
//! atomically per key.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use serde::Deserialize;

use crate::CallerIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    Anonymous,
    Authenticated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitPolicy {
    pub max_requests: u32,
    pub window_secs: u64,
}

impl RateLimitPolicy {
    /// 3 requests per rolling 24 hours.
    pub const ANONYMOUS: RateLimitPolicy = RateLimitPolicy {
        max_requests: 3,
        window_secs: 24 * 60 * 60,
    };
    /// 50 requests per rolling 60 minutes.
    pub const AUTHENTICATED: RateLimitPolicy = RateLimitPolicy {
        max_requests: 50,
        window_secs: 60 * 60,
    };

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

fn default_anonymous() -> RateLimitPolicy {
    RateLimitPolicy::ANONYMOUS
}

fn default_authenticated() -> RateLimitPolicy {
    RateLimitPolicy::AUTHENTICATED
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RateLimitPolicies {
    #[serde(default = "default_anonymous")]
    pub anonymous: RateLimitPolicy,
    #[serde(default = "default_authenticated")]
    pub authenticated: RateLimitPolicy,
}

impl Default for RateLimitPolicies {
    fn default() -> Self {
        Self {
            anonymous: RateLimitPolicy::ANONYMOUS,
            authenticated: RateLimitPolicy::AUTHENTICATED,
        }
    }
}

/// Sliding counter for one (caller, endpoint) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitWindow {
    pub count: u32,
    pub window_start: DateTime<Utc>,
    pub window_duration: Duration,
    pub max_requests: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub policy: PolicyKind,
    /// Requests counted in the current window, including this one if allowed.
    pub count: u32,
    pub limit: u32,
    pub window: Duration,
    /// Time until the current window expires.
    pub retry_after: Duration,
}

#[derive(Debug, thiserror::Error)]
#[error("rate limit store unavailable: {0}")]
pub struct StoreError(pub String);

/// Backing store for rate-limit windows.  `consume` must be atomic per key:
/// two concurrent calls for the same key never both succeed when a single
/// slot of quota remains.
#[async_trait::async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn consume(
        &self,
        key: &str,
        policy: &RateLimitPolicy,
        now: DateTime<Utc>,
    ) -> Result<ConsumeOutcome, StoreError>;
}

/// Raw store answer; the limiter adds policy metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeOutcome {
    pub allowed: bool,
    pub count: u32,
    pub retry_after: Duration,
}

/// In-process store.  Each key's read-modify-write runs under the DashMap
/// shard lock for that key.
#[derive(Clone, Default)]
pub struct MemoryRateLimitStore {
    windows: Arc<DashMap<String, RateLimitWindow>>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the window for `key`, if one exists.
    pub fn window(&self, key: &str) -> Option<RateLimitWindow> {
        self.windows.get(key).map(|w| w.value().clone())
    }

    fn consume_sync(
        &self,
        key: &str,
        policy: &RateLimitPolicy,
        now: DateTime<Utc>,
    ) -> Result<ConsumeOutcome, StoreError> {
        let span = TimeDelta::try_seconds(policy.window_secs as i64)
            .ok_or_else(|| StoreError(format!("window of {}s is out of range", policy.window_secs)))?;
        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| RateLimitWindow {
                count: 0,
                window_start: now,
                window_duration: policy.window(),
                max_requests: policy.max_requests,
            });
        let w = entry.value_mut();
        if now - w.window_start > span {
            w.count = 0;
            w.window_start = now;
        }
        w.window_duration = policy.window();
        w.max_requests = policy.max_requests;

        let retry_after = (w.window_start + span - now).to_std().unwrap_or_default();
        if w.count >= policy.max_requests {
            return Ok(ConsumeOutcome {
                allowed: false,
                count: w.count,
                retry_after,
            });
        }
        w.count += 1;
        Ok(ConsumeOutcome {
            allowed: true,
            count: w.count,
            retry_after,
        })
    }
}

#[async_trait::async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn consume(
        &self,
        key: &str,
        policy: &RateLimitPolicy,
        now: DateTime<Utc>,
    ) -> Result<ConsumeOutcome, StoreError> {
        self.consume_sync(key, policy, now)
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    policies: RateLimitPolicies,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, policies: RateLimitPolicies) -> Self {
        Self { store, policies }
    }

    pub fn in_memory(policies: RateLimitPolicies) -> Self {
        Self::new(Arc::new(MemoryRateLimitStore::new()), policies)
    }

    pub fn policies(&self) -> &RateLimitPolicies {
        &self.policies
    }

    pub fn policy_for(&self, identity: &CallerIdentity) -> (PolicyKind, RateLimitPolicy) {
        match identity {
            CallerIdentity::Anonymous { .. } => (PolicyKind::Anonymous, self.policies.anonymous),
            CallerIdentity::Authenticated { .. } => {
                (PolicyKind::Authenticated, self.policies.authenticated)
            }
        }
    }

    pub fn key_for(identity: &CallerIdentity, endpoint: &str) -> String {
        match identity {
            CallerIdentity::Anonymous { ip_address } => format!("anon:{}:{}", ip_address, endpoint),
            CallerIdentity::Authenticated { user_id } => format!("user:{}:{}", user_id, endpoint),
        }
    }

    pub async fn check_and_consume(
        &self,
        identity: &CallerIdentity,
        endpoint: &str,
    ) -> Result<RateLimitDecision, StoreError> {
        self.check_and_consume_at(identity, endpoint, Utc::now()).await
    }

    pub async fn check_and_consume_at(
        &self,
        identity: &CallerIdentity,
        endpoint: &str,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, StoreError> {
        let (kind, policy) = self.policy_for(identity);
        let key = Self::key_for(identity, endpoint);
        let outcome = self.store.consume(&key, &policy, now).await?;
        if !outcome.allowed {
            tracing::info!(
                target: "rate_limit",
                key = %key,
                count = outcome.count,
                limit = policy.max_requests,
                retry_after_secs = outcome.retry_after.as_secs(),
                "quota exhausted"
            );
        }
        Ok(RateLimitDecision {
            allowed: outcome.allowed,
            policy: kind,
            count: outcome.count,
            limit: policy.max_requests,
            window: policy.window(),
            retry_after: outcome.retry_after,
        })
    }
}
