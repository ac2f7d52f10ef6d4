//! Committee sampling and the vote attempts it produces.

use std::{collections::BTreeSet, sync::Arc};

use alloy::primitives::{Address, B256};
use tracing::*;

use crate::{
    backoff::Backoff,
    cfg::BackoffConfig,
    error::{NotaryError, RegistryError},
    registry::{Registry, ShardId},
    shutdown::Shutdown,
};

/// One chance to vote: this notary was sampled for `shard` in `period`.
///
/// Lives only as long as the vote is being attempted. It is never persisted, since a restarted notary re-derives the
/// same assignments from the contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteAttempt {
    pub shard: ShardId,
    pub period: u64,
    /// Filled in once the candidate header is known.
    pub chunk_root: Option<B256>,
    /// Number of submissions sent so far.
    pub attempts: u32,
    /// The first block at which votes for `period` are no longer accepted.
    pub deadline: u64,
}

impl VoteAttempt {
    pub fn new(shard: ShardId, period: u64, deadline: u64) -> Self {
        VoteAttempt {
            shard,
            period,
            chunk_root: None,
            attempts: 0,
            deadline,
        }
    }
}

pub struct CommitteeSampler<R> {
    registry: Arc<R>,
    notary: Address,
    shard_count: u64,
    voting_window: u64,
    max_attempts: u32,
    backoff: BackoffConfig,
}

impl<R: Registry> CommitteeSampler<R> {
    pub fn new(
        registry: Arc<R>,
        notary: Address,
        shard_count: u64,
        voting_window: u64,
        max_attempts: u32,
        backoff: BackoffConfig,
    ) -> Self {
        CommitteeSampler {
            registry,
            notary,
            shard_count,
            voting_window,
            max_attempts,
            backoff,
        }
    }

    /// Asks the contract which shards this notary votes on in `period`, which starts at block `period_start`.
    ///
    /// An empty result is the common case. If the contract cannot be reached after the configured number of attempts,
    /// the period is logged as missed and no attempts are returned. A shard id outside the configured range means we
    /// disagree with the contract about its layout, which is fatal.
    pub async fn sample(
        &self,
        period: u64,
        period_start: u64,
        shutdown: &mut Shutdown,
    ) -> Result<Vec<VoteAttempt>, NotaryError> {
        let Some(shards) = self.query(period, shutdown).await else {
            return Ok(Vec::new());
        };

        if let Some(shard) = shards.iter().find(|s| s.0 >= self.shard_count) {
            return Err(NotaryError::InvariantViolation(format!(
                "sampled onto shard {shard} in period {period}, but only {} shards exist",
                self.shard_count
            )));
        }

        let deadline = period_start.saturating_add(self.voting_window);
        Ok(shards
            .into_iter()
            .map(|shard| VoteAttempt::new(shard, period, deadline))
            .collect())
    }

    async fn query(&self, period: u64, shutdown: &mut Shutdown) -> Option<BTreeSet<ShardId>> {
        let mut backoff = Backoff::new(self.backoff);
        for attempt in 1..=self.max_attempts {
            let result = shutdown
                .until(self.registry.sampled_shards(period, self.notary))
                .await?;
            match result {
                Ok(shards) => return Some(shards),
                Err(RegistryError::ChainUnavailable(e)) if attempt < self.max_attempts => {
                    warn!(period, attempt, %e, "committee query failed");
                }
                Err(e) => {
                    warn!(period, attempt, %e, "could not determine committee, missing period");
                    return None;
                }
            }
            if !shutdown.sleep(backoff.next_delay()).await {
                return None;
            }
        }
        None
    }
}
