use std::{collections::BTreeSet, time::Duration};

use alloy::{
    eips::BlockId,
    network::{EthereumWallet, ReceiptResponse},
    primitives::{Address, B256, U256},
    providers::{Provider, ProviderBuilder, WsConnect},
    transports::{RpcError, TransportError},
};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures::StreamExt;
use tracing::*;

use crate::{
    cfg::{Amount, Config},
    contracts::ShardingManager,
    crypto::SecretKey,
    error::RegistryError,
    registry::{BlockHeader, HeaderStream, Registry, RegistryResult, ShardId, TxReceipt},
    shard::{CandidateHeader, HeaderFetcher},
};

/// Revert reason the sharding manager uses for duplicate votes.
const ALREADY_VOTED_REASON: &str = "already voted";

/// [Registry] backed by the sharding manager contract, over a websocket connection to a main chain node.
///
/// The underlying provider multiplexes concurrent requests over one connection, so a single client is shared by
/// everything in the notary.
#[derive(Debug, Clone)]
pub struct SmcClient<P> {
    provider: P,
    smc_address: Address,
    notary: Address,
    period_length: u64,
    deposit: Amount,
    receipt_timeout: Duration,
}

/// Connects to the node at `config.rpc_url`, signing transactions with `secret_key`.
pub async fn connect(
    config: &Config,
    secret_key: &SecretKey,
) -> Result<SmcClient<impl Provider + Clone + 'static>> {
    if !config.rpc_url.starts_with("ws://") && !config.rpc_url.starts_with("wss://") {
        return Err(anyhow!(
            "rpc_url must be a websocket endpoint to support subscriptions, got {}",
            config.rpc_url
        ));
    }

    let wallet = EthereumWallet::from(secret_key.signer());
    let provider = ProviderBuilder::new()
        .wallet(wallet)
        .on_ws(WsConnect::new(&config.rpc_url))
        .await?;
    let chain_id = provider.get_chain_id().await?;
    info!(chain_id, rpc_url = config.rpc_url, smc = %config.smc_address, "connected to main chain");

    Ok(SmcClient {
        provider,
        smc_address: config.smc_address,
        notary: secret_key.address(),
        period_length: config.period_length,
        deposit: config.notary_deposit,
        receipt_timeout: config.receipt_timeout,
    })
}

#[async_trait]
impl<P: Provider + Clone + 'static> Registry for SmcClient<P> {
    async fn is_deposited(&self, notary: Address) -> RegistryResult<bool> {
        let entry = ShardingManager::new(self.smc_address, self.provider.clone())
            .notaryRegistry(notary)
            .call()
            .await
            .map_err(classify)?;
        Ok(entry.deposited)
    }

    async fn join_pool(&self) -> RegistryResult<TxReceipt> {
        let pending = ShardingManager::new(self.smc_address, self.provider.clone())
            .registerNotary()
            .value(U256::from(*self.deposit))
            .send()
            .await
            .map_err(classify)?;
        debug!(tx = %pending.tx_hash(), "pool join sent");
        // A transaction dropped from the mempool would otherwise leave us waiting for its receipt forever.
        let receipt = pending
            .with_timeout(Some(self.receipt_timeout))
            .get_receipt()
            .await
            .map_err(|e| RegistryError::ChainUnavailable(e.to_string()))?;
        mined(receipt, "pool join")
    }

    async fn current_block_number(&self) -> RegistryResult<u64> {
        self.provider.get_block_number().await.map_err(classify_rpc)
    }

    async fn subscribe_block_headers(&self) -> RegistryResult<HeaderStream> {
        let subscription = self.provider.subscribe_blocks().await.map_err(classify_rpc)?;
        Ok(subscription
            .into_stream()
            .map(|header| {
                Ok(BlockHeader {
                    number: header.inner.number,
                    hash: header.hash,
                })
            })
            .boxed())
    }

    async fn sampled_shards(&self, period: u64, notary: Address) -> RegistryResult<BTreeSet<ShardId>> {
        // Query the state as of the period's first block, so the answer for a finalized period never changes.
        let block = period.saturating_mul(self.period_length);
        let sampled = ShardingManager::new(self.smc_address, self.provider.clone())
            .sampledShards(U256::from(period), notary)
            .block(BlockId::number(block))
            .call()
            .await
            .map_err(classify)?;
        sampled
            .shardIds
            .into_iter()
            .map(|id| {
                u64::try_from(id)
                    .map(ShardId)
                    .map_err(|_| RegistryError::ChainRejected(format!("shard id {id} out of range")))
            })
            .collect()
    }

    async fn submit_vote(
        &self,
        shard: ShardId,
        period: u64,
        chunk_root: B256,
    ) -> RegistryResult<TxReceipt> {
        let contract = ShardingManager::new(self.smc_address, self.provider.clone());
        let shard_id = U256::from(shard.0);
        let period = U256::from(period);

        // A notary restarted after voting finds its vote here, without spending gas on a reverting transaction.
        let voted = contract
            .hasVoted(shard_id, period, self.notary)
            .call()
            .await
            .map_err(classify)?;
        if voted.voted {
            return Err(RegistryError::AlreadyVoted);
        }

        let pending = contract
            .submitVote(shard_id, period, chunk_root)
            .send()
            .await
            .map_err(classify)?;
        debug!(tx = %pending.tx_hash(), %shard, %period, "vote sent");
        let receipt = pending
            .with_timeout(Some(self.receipt_timeout))
            .get_receipt()
            .await
            .map_err(|e| RegistryError::ChainUnavailable(e.to_string()))?;
        mined(receipt, "vote")
    }
}

/// Reads candidate headers from the collation records the proposer registered with the contract.
#[async_trait]
impl<P: Provider + Clone + 'static> HeaderFetcher for SmcClient<P> {
    async fn fetch(&self, shard: ShardId, period: u64) -> Result<Option<CandidateHeader>> {
        let record = ShardingManager::new(self.smc_address, self.provider.clone())
            .collationRecords(U256::from(shard.0), U256::from(period))
            .call()
            .await?;
        if record.chunkRoot.is_zero() {
            return Ok(None);
        }
        Ok(Some(CandidateHeader {
            shard,
            period,
            chunk_root: record.chunkRoot,
            proposer: record.proposer,
        }))
    }
}

fn mined(receipt: impl ReceiptResponse, what: &str) -> RegistryResult<TxReceipt> {
    if !receipt.status() {
        return Err(RegistryError::ChainRejected(format!(
            "{what} transaction {} reverted",
            receipt.transaction_hash()
        )));
    }
    Ok(TxReceipt {
        tx_hash: receipt.transaction_hash(),
        block_number: receipt.block_number(),
    })
}

/// Error responses from the node mean it refused the call (usually a revert during gas estimation). Anything else is
/// a connection problem worth retrying.
fn classify_rpc(error: TransportError) -> RegistryError {
    match error {
        RpcError::ErrorResp(payload) if payload.message.contains(ALREADY_VOTED_REASON) => {
            RegistryError::AlreadyVoted
        }
        RpcError::ErrorResp(payload) => RegistryError::ChainRejected(payload.message.to_string()),
        e => RegistryError::ChainUnavailable(e.to_string()),
    }
}

fn classify(error: alloy::contract::Error) -> RegistryError {
    match error {
        alloy::contract::Error::TransportError(e) => classify_rpc(e),
        alloy::contract::Error::PendingTransactionError(e) => {
            RegistryError::ChainUnavailable(e.to_string())
        }
        e => RegistryError::ChainRejected(e.to_string()),
    }
}
