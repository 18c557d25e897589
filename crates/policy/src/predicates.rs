use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::registry::{ClaimPredicate, PolicyContext, PredicateError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageOutcome {
    Consumed { uses: u64 },
    Exhausted { uses: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageError(pub String);

impl std::fmt::Display for UsageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "usage counter unavailable: {}", self.0)
    }
}

impl std::error::Error for UsageError {}

/// Per-policy use counter backing `max_uses`.
#[async_trait]
pub trait UsageCounter: Send + Sync {
    /// Records one use of `policy_id` if fewer than `limit` uses exist.
    /// Concurrent callers never both observe the last remaining use.
    async fn try_consume(&self, policy_id: &str, limit: u64) -> Result<UsageOutcome, UsageError>;

    async fn uses(&self, policy_id: &str) -> Result<u64, UsageError>;
}

pub struct MaxUses {
    usage: Arc<dyn UsageCounter>,
}

impl MaxUses {
    pub fn new(usage: Arc<dyn UsageCounter>) -> Self {
        Self { usage }
    }
}

#[async_trait]
impl ClaimPredicate for MaxUses {
    async fn check(&self, ctx: &PolicyContext) -> Result<bool, PredicateError> {
        let limit = ctx
            .param("limit")
            .and_then(|v| v.as_u64())
            .filter(|limit| *limit >= 1)
            .ok_or_else(|| {
                PredicateError::InvalidParams("limit must be a positive integer".to_string())
            })?;

        match self.usage.try_consume(&ctx.policy_id, limit).await {
            Ok(UsageOutcome::Consumed { uses }) => {
                tracing::debug!(policy_id = %ctx.policy_id, uses, limit, "policy use consumed");
                Ok(true)
            }
            Ok(UsageOutcome::Exhausted { uses }) => {
                tracing::info!(policy_id = %ctx.policy_id, uses, limit, "policy uses exhausted");
                Ok(false)
            }
            Err(err) => Err(PredicateError::Unavailable(err.to_string())),
        }
    }

    fn has_side_effects(&self) -> bool {
        true
    }
}

type Clock = fn() -> DateTime<Utc>;

fn timestamp_param(ctx: &PolicyContext) -> Result<DateTime<Utc>, PredicateError> {
    let raw = ctx.param("timestamp").and_then(|v| v.as_str()).ok_or_else(|| {
        PredicateError::InvalidParams("timestamp must be an RFC 3339 string".to_string())
    })?;
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| PredicateError::InvalidParams(format!("unparseable timestamp: {}", raw)))
}

/// Satisfied once the clock reaches `timestamp`.
pub struct NotBefore {
    now: Clock,
}

impl NotBefore {
    pub fn with_clock(now: Clock) -> Self {
        Self { now }
    }
}

impl Default for NotBefore {
    fn default() -> Self {
        Self { now: Utc::now }
    }
}

#[async_trait]
impl ClaimPredicate for NotBefore {
    async fn check(&self, ctx: &PolicyContext) -> Result<bool, PredicateError> {
        let bound = timestamp_param(ctx)?;
        Ok((self.now)() >= bound)
    }
}

/// Satisfied until the clock passes `timestamp`.
pub struct NotAfter {
    now: Clock,
}

impl NotAfter {
    pub fn with_clock(now: Clock) -> Self {
        Self { now }
    }
}

impl Default for NotAfter {
    fn default() -> Self {
        Self { now: Utc::now }
    }
}

#[async_trait]
impl ClaimPredicate for NotAfter {
    async fn check(&self, ctx: &PolicyContext) -> Result<bool, PredicateError> {
        let bound = timestamp_param(ctx)?;
        Ok((self.now)() <= bound)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct CountingUsage {
        uses: Mutex<HashMap<String, u64>>,
    }

    #[async_trait]
    impl UsageCounter for CountingUsage {
        async fn try_consume(
            &self,
            policy_id: &str,
            limit: u64,
        ) -> Result<UsageOutcome, UsageError> {
            let mut uses = self.uses.lock().expect("usage lock poisoned");
            let entry = uses.entry(policy_id.to_string()).or_insert(0);
            if *entry >= limit {
                return Ok(UsageOutcome::Exhausted { uses: *entry });
            }
            *entry += 1;
            Ok(UsageOutcome::Consumed { uses: *entry })
        }

        async fn uses(&self, policy_id: &str) -> Result<u64, UsageError> {
            let uses = self.uses.lock().expect("usage lock poisoned");
            Ok(uses.get(policy_id).copied().unwrap_or(0))
        }
    }

    fn ctx(claim_type: &str, params: serde_json::Value) -> PolicyContext {
        PolicyContext {
            policy_id: "policy-1".to_string(),
            claim_type: claim_type.to_string(),
            group: None,
            params: params.as_object().cloned().unwrap_or_default(),
        }
    }

    fn fixed_now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-01T12:00:00Z")
            .expect("fixture timestamp")
            .with_timezone(&Utc)
    }

    #[tokio::test]
    async fn max_uses_allows_exactly_limit_uses() {
        let usage = Arc::new(CountingUsage::default());
        let predicate = MaxUses::new(usage.clone());
        let ctx = ctx("max_uses", serde_json::json!({"limit": 2}));

        assert_eq!(predicate.check(&ctx).await, Ok(true));
        assert_eq!(predicate.check(&ctx).await, Ok(true));
        assert_eq!(predicate.check(&ctx).await, Ok(false));
        assert_eq!(usage.uses("policy-1").await, Ok(2));
        assert!(predicate.has_side_effects());
    }

    #[tokio::test]
    async fn max_uses_rejects_missing_or_zero_limit() {
        let predicate = MaxUses::new(Arc::new(CountingUsage::default()));
        for params in [
            serde_json::json!({}),
            serde_json::json!({"limit": 0}),
            serde_json::json!({"limit": "3"}),
        ] {
            let err = predicate
                .check(&ctx("max_uses", params))
                .await
                .unwrap_err();
            assert!(matches!(err, PredicateError::InvalidParams(_)));
        }
    }

    #[tokio::test]
    async fn time_window_predicates_compare_against_clock() {
        let before = NotBefore::with_clock(fixed_now);
        let after = NotAfter::with_clock(fixed_now);

        let past = serde_json::json!({"timestamp": "2025-01-01T00:00:00Z"});
        let future = serde_json::json!({"timestamp": "2025-12-31T23:59:59+00:00"});

        assert_eq!(before.check(&ctx("not_before", past.clone())).await, Ok(true));
        assert_eq!(before.check(&ctx("not_before", future.clone())).await, Ok(false));
        assert_eq!(after.check(&ctx("not_after", past)).await, Ok(false));
        assert_eq!(after.check(&ctx("not_after", future)).await, Ok(true));
    }

    #[tokio::test]
    async fn time_window_predicates_reject_bad_timestamps() {
        let err = NotAfter::with_clock(fixed_now)
            .check(&ctx("not_after", serde_json::json!({"timestamp": "tomorrow"})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unparseable timestamp"));
    }
}
