//! Sources of candidate collation headers.
//!
//! Headers are looked up in local shard storage first. On a miss they are requested from the shard network and the
//! result is written back to storage, so later lookups for the same collation stay local.

use std::sync::Arc;

use alloy::primitives::{Address, B256};
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use tracing::*;

use crate::registry::ShardId;

/// The collation header proposed for a shard and period. The notary only ever reads it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CandidateHeader {
    pub shard: ShardId,
    pub period: u64,
    /// Root of the collation body. This is what the notary votes for.
    pub chunk_root: B256,
    pub proposer: Address,
}

/// The single interface votes consume. Returns `Ok(None)` while no candidate is known yet.
#[async_trait]
pub trait CandidateSource: Send + Sync + 'static {
    async fn candidate_header(&self, shard: ShardId, period: u64) -> Result<Option<CandidateHeader>>;
}

/// Local shard chain storage.
pub trait HeaderStore: Send + Sync + 'static {
    fn get(&self, shard: ShardId, period: u64) -> Option<CandidateHeader>;
    fn put(&self, header: CandidateHeader);
}

/// The shard network, or anything else which can be asked for a header we do not have.
#[async_trait]
pub trait HeaderFetcher: Send + Sync + 'static {
    async fn fetch(&self, shard: ShardId, period: u64) -> Result<Option<CandidateHeader>>;
}

#[derive(Debug, Default)]
pub struct MemoryHeaderStore {
    headers: DashMap<(ShardId, u64), CandidateHeader>,
}

impl MemoryHeaderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

impl HeaderStore for MemoryHeaderStore {
    fn get(&self, shard: ShardId, period: u64) -> Option<CandidateHeader> {
        self.headers.get(&(shard, period)).map(|h| *h)
    }

    fn put(&self, header: CandidateHeader) {
        self.headers.insert((header.shard, header.period), header);
    }
}

impl<T: HeaderStore> HeaderStore for Arc<T> {
    fn get(&self, shard: ShardId, period: u64) -> Option<CandidateHeader> {
        (**self).get(shard, period)
    }

    fn put(&self, header: CandidateHeader) {
        (**self).put(header)
    }
}

#[async_trait]
impl<T: HeaderFetcher> HeaderFetcher for Arc<T> {
    async fn fetch(&self, shard: ShardId, period: u64) -> Result<Option<CandidateHeader>> {
        (**self).fetch(shard, period).await
    }
}

/// Local storage first, then the network.
pub struct CandidateResolver<S, F> {
    store: S,
    fetcher: F,
}

impl<S: HeaderStore, F: HeaderFetcher> CandidateResolver<S, F> {
    pub fn new(store: S, fetcher: F) -> Self {
        CandidateResolver { store, fetcher }
    }
}

#[async_trait]
impl<S: HeaderStore, F: HeaderFetcher> CandidateSource for CandidateResolver<S, F> {
    async fn candidate_header(&self, shard: ShardId, period: u64) -> Result<Option<CandidateHeader>> {
        if let Some(header) = self.store.get(shard, period) {
            return Ok(Some(header));
        }

        let Some(header) = self.fetcher.fetch(shard, period).await? else {
            return Ok(None);
        };
        // A zero root means nothing has been proposed yet.
        if header.chunk_root.is_zero() {
            return Ok(None);
        }
        if header.shard != shard || header.period != period {
            warn!(%shard, period, ?header, "fetched header for a different collation");
            return Ok(None);
        }

        trace!(%shard, period, chunk_root = %header.chunk_root, "caching fetched header");
        self.store.put(header);
        Ok(Some(header))
    }
}
