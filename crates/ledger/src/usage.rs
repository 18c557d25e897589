use std::sync::Arc;
use std::time::Duration;

use airlock_policy::{UsageCounter, UsageError, UsageOutcome};
use async_trait::async_trait;

use crate::LedgerError;
use crate::store::{RecordStore, timed};

pub const USAGE: &str = "usage";

const MAX_CAS_ATTEMPTS: usize = 16;

/// `usage/{policy_id}` holds `{ "uses": n }`; every increment is a
/// versioned compare-and-swap.
#[derive(Clone)]
pub struct UsageLedger {
    store: Arc<dyn RecordStore>,
    store_timeout: Duration,
}

impl UsageLedger {
    pub fn new(store: Arc<dyn RecordStore>, store_timeout: Duration) -> Self {
        Self {
            store,
            store_timeout,
        }
    }

    async fn read_uses(&self, policy_id: &str) -> Result<Option<(i64, u64)>, LedgerError> {
        let Some(record) = timed(self.store_timeout, self.store.select_by_id(USAGE, policy_id)).await?
        else {
            return Ok(None);
        };

        let uses = record
            .body
            .get("uses")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| LedgerError::Corrupt(format!("usage record {} has no uses", policy_id)))?;
        Ok(Some((record.version, uses)))
    }
}

fn unavailable(err: LedgerError) -> UsageError {
    UsageError(err.to_string())
}

#[async_trait]
impl UsageCounter for UsageLedger {
    async fn try_consume(&self, policy_id: &str, limit: u64) -> Result<UsageOutcome, UsageError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            match self.read_uses(policy_id).await.map_err(unavailable)? {
                None => {
                    if limit == 0 {
                        return Ok(UsageOutcome::Exhausted { uses: 0 });
                    }
                    let inserted = timed(
                        self.store_timeout,
                        self.store
                            .insert(USAGE, policy_id, serde_json::json!({ "uses": 1 })),
                    )
                    .await;
                    match inserted {
                        Ok(_) => return Ok(UsageOutcome::Consumed { uses: 1 }),
                        Err(LedgerError::Duplicate { .. }) => continue,
                        Err(err) => return Err(unavailable(err)),
                    }
                }
                Some((version, uses)) => {
                    if uses >= limit {
                        return Ok(UsageOutcome::Exhausted { uses });
                    }
                    let swapped = timed(
                        self.store_timeout,
                        self.store.compare_and_swap(
                            USAGE,
                            policy_id,
                            version,
                            serde_json::json!({ "uses": uses + 1 }),
                        ),
                    )
                    .await
                    .map_err(unavailable)?;
                    if swapped.is_some() {
                        return Ok(UsageOutcome::Consumed { uses: uses + 1 });
                    }
                }
            }
        }

        tracing::warn!(policy_id, "usage counter contended past retry budget");
        Err(UsageError("usage counter is contended".to_string()))
    }

    async fn uses(&self, policy_id: &str) -> Result<u64, UsageError> {
        Ok(self
            .read_uses(policy_id)
            .await
            .map_err(unavailable)?
            .map(|(_, uses)| uses)
            .unwrap_or(0))
    }
}
