//! The interface the notary consumes from the main chain.

use std::{collections::BTreeSet, fmt};

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::RegistryError;

pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShardId(pub u64);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The parts of a main chain header the notary needs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: B256,
}

/// Receipt of a mined main chain transaction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: B256,
    pub block_number: Option<u64>,
}

/// A stream of new main chain headers. The stream ends or yields an error when the subscription is lost.
pub type HeaderStream = BoxStream<'static, RegistryResult<BlockHeader>>;

/// Access to the sharding manager contract on the main chain.
///
/// Implementations are shared between the scheduling loop and every in-flight vote, so all methods take `&self` and
/// must be safe to call concurrently.
#[async_trait]
pub trait Registry: Send + Sync + 'static {
    /// Whether `notary` currently holds a deposit in the notary pool.
    async fn is_deposited(&self, notary: Address) -> RegistryResult<bool>;

    /// Sends the pool join transaction, locking the deposit. Not reversible.
    async fn join_pool(&self) -> RegistryResult<TxReceipt>;

    async fn current_block_number(&self) -> RegistryResult<u64>;

    /// Subscribes to new headers. Headers are yielded in increasing order, but blocks may be skipped.
    async fn subscribe_block_headers(&self) -> RegistryResult<HeaderStream>;

    /// The shards whose committee `notary` was sampled onto in `period`. For a finalized period the answer never
    /// changes.
    async fn sampled_shards(&self, period: u64, notary: Address) -> RegistryResult<BTreeSet<ShardId>>;

    /// Votes for `chunk_root` as the collation of `shard` in `period`. Voting twice either succeeds again without
    /// effect or fails with [RegistryError::AlreadyVoted].
    async fn submit_vote(
        &self,
        shard: ShardId,
        period: u64,
        chunk_root: B256,
    ) -> RegistryResult<TxReceipt>;
}
