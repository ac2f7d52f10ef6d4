mod subscription;

use std::{
    collections::{BTreeSet, HashMap, HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use alloy::primitives::{Address, B256};
use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use notary::{
    cfg::{BackoffConfig, Config},
    error::RegistryError,
    node::{Notary, ServiceState},
    registry::{BlockHeader, HeaderStream, Registry, RegistryResult, ShardId, TxReceipt},
    shard::{CandidateHeader, CandidateSource},
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;

/// A vote which made it into [MockChain].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RecordedVote {
    shard: ShardId,
    period: u64,
    chunk_root: B256,
    /// Head of the chain when the vote was submitted.
    head: u64,
}

#[derive(Default)]
struct ChainState {
    deposited: bool,
    deposit_checks: usize,
    join_results: VecDeque<RegistryResult<TxReceipt>>,
    /// Number of upcoming join transactions which are never mined.
    stalled_joins: usize,
    join_calls: usize,
    head: u64,
    current_block_calls: usize,
    current_block_failures: VecDeque<RegistryError>,
    headers: Option<mpsc::UnboundedSender<RegistryResult<BlockHeader>>>,
    subscribe_calls: usize,
    subscribe_failures: VecDeque<RegistryError>,
    committees: HashMap<u64, BTreeSet<ShardId>>,
    sampled_periods: Vec<u64>,
    sampling_failures: VecDeque<RegistryError>,
    vote_failures: VecDeque<RegistryError>,
    vote_calls: usize,
    voted: HashSet<(ShardId, u64)>,
    votes: Vec<RecordedVote>,
}

/// A scripted sharding manager. Tests drive the chain by producing blocks and inspect what the notary asked of it.
struct MockChain {
    state: Mutex<ChainState>,
    subscriptions: watch::Sender<usize>,
}

impl MockChain {
    fn new() -> Arc<Self> {
        Arc::new(MockChain {
            state: Mutex::new(ChainState::default()),
            subscriptions: watch::Sender::new(0),
        })
    }

    fn deposited() -> Arc<Self> {
        let chain = Self::new();
        chain.state.lock().deposited = true;
        chain
    }

    fn push_join_result(&self, result: RegistryResult<TxReceipt>) {
        self.state.lock().join_results.push_back(result);
    }

    fn stall_next_join(&self) {
        self.state.lock().stalled_joins += 1;
    }

    fn fail_next_subscription(&self, error: RegistryError) {
        self.state.lock().subscribe_failures.push_back(error);
    }

    fn fail_next_current_block(&self, error: RegistryError) {
        self.state.lock().current_block_failures.push_back(error);
    }

    fn assign(&self, period: u64, shards: impl IntoIterator<Item = u64>) {
        self.state
            .lock()
            .committees
            .insert(period, shards.into_iter().map(ShardId).collect());
    }

    fn fail_next_sampling(&self, error: RegistryError) {
        self.state.lock().sampling_failures.push_back(error);
    }

    fn fail_next_vote(&self, error: RegistryError) {
        self.state.lock().vote_failures.push_back(error);
    }

    fn mark_voted(&self, shard: u64, period: u64) {
        self.state.lock().voted.insert((ShardId(shard), period));
    }

    /// Mines block `number` and announces it to the current subscriber, if any.
    fn produce_block(&self, number: u64) {
        self.send_header(BlockHeader {
            number,
            hash: block_hash(number),
        });
    }

    fn send_header(&self, header: BlockHeader) {
        let mut state = self.state.lock();
        state.head = state.head.max(header.number);
        if let Some(headers) = &state.headers {
            let _ = headers.send(Ok(header));
        }
    }

    /// Advances the chain without announcing anything, as if the blocks were mined while we were disconnected.
    fn advance_silently(&self, number: u64) {
        self.state.lock().head = number;
    }

    /// Ends the current header subscription.
    fn disconnect(&self) {
        self.state.lock().headers = None;
    }

    /// Makes the current header subscription yield an error.
    fn break_subscription(&self, error: RegistryError) {
        if let Some(headers) = &self.state.lock().headers {
            let _ = headers.send(Err(error));
        }
    }

    /// Number of subscriptions which succeeded.
    fn subscription_count(&self) -> usize {
        *self.subscriptions.borrow()
    }

    fn subscribe_calls(&self) -> usize {
        self.state.lock().subscribe_calls
    }

    fn current_block_calls(&self) -> usize {
        self.state.lock().current_block_calls
    }

    async fn wait_for_subscriptions(&self, count: usize) {
        let mut receiver = self.subscriptions.subscribe();
        receiver.wait_for(|c| *c >= count).await.unwrap();
    }

    fn deposit_checks(&self) -> usize {
        self.state.lock().deposit_checks
    }

    fn join_calls(&self) -> usize {
        self.state.lock().join_calls
    }

    fn sampled_periods(&self) -> Vec<u64> {
        self.state.lock().sampled_periods.clone()
    }

    fn vote_calls(&self) -> usize {
        self.state.lock().vote_calls
    }

    fn votes(&self) -> Vec<RecordedVote> {
        self.state.lock().votes.clone()
    }
}

#[async_trait]
impl Registry for MockChain {
    async fn is_deposited(&self, _: Address) -> RegistryResult<bool> {
        let mut state = self.state.lock();
        state.deposit_checks += 1;
        Ok(state.deposited)
    }

    async fn join_pool(&self) -> RegistryResult<TxReceipt> {
        let stalled = {
            let mut state = self.state.lock();
            state.join_calls += 1;
            let stalled = state.stalled_joins > 0;
            if stalled {
                state.stalled_joins -= 1;
            }
            stalled
        };
        if stalled {
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock();
        let result = state
            .join_results
            .pop_front()
            .unwrap_or_else(|| Ok(receipt(state.join_calls as u64)));
        if result.is_ok() {
            state.deposited = true;
        }
        result
    }

    async fn current_block_number(&self) -> RegistryResult<u64> {
        let mut state = self.state.lock();
        state.current_block_calls += 1;
        match state.current_block_failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(state.head),
        }
    }

    async fn subscribe_block_headers(&self) -> RegistryResult<HeaderStream> {
        {
            let mut state = self.state.lock();
            state.subscribe_calls += 1;
            if let Some(error) = state.subscribe_failures.pop_front() {
                return Err(error);
            }
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        self.state.lock().headers = Some(sender);
        self.subscriptions.send_modify(|c| *c += 1);
        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }

    async fn sampled_shards(&self, period: u64, _: Address) -> RegistryResult<BTreeSet<ShardId>> {
        let mut state = self.state.lock();
        if let Some(error) = state.sampling_failures.pop_front() {
            return Err(error);
        }
        state.sampled_periods.push(period);
        Ok(state.committees.get(&period).cloned().unwrap_or_default())
    }

    async fn submit_vote(
        &self,
        shard: ShardId,
        period: u64,
        chunk_root: B256,
    ) -> RegistryResult<TxReceipt> {
        let mut state = self.state.lock();
        state.vote_calls += 1;
        if let Some(error) = state.vote_failures.pop_front() {
            return Err(error);
        }
        if !state.voted.insert((shard, period)) {
            return Err(RegistryError::AlreadyVoted);
        }
        let head = state.head;
        state.votes.push(RecordedVote {
            shard,
            period,
            chunk_root,
            head,
        });
        Ok(receipt(state.votes.len() as u64))
    }
}

/// Candidate headers which tests publish by hand. Lookups for a shard can be made to take a while.
#[derive(Default)]
struct MockCandidates {
    headers: Mutex<HashMap<(ShardId, u64), CandidateHeader>>,
    delays: Mutex<HashMap<ShardId, Duration>>,
    lookups: Mutex<usize>,
}

impl MockCandidates {
    fn new() -> Arc<Self> {
        Arc::default()
    }

    fn publish(&self, shard: u64, period: u64) -> B256 {
        let chunk_root = chunk_root(shard, period);
        self.headers.lock().insert(
            (ShardId(shard), period),
            CandidateHeader {
                shard: ShardId(shard),
                period,
                chunk_root,
                proposer: Address::repeat_byte(0xaa),
            },
        );
        chunk_root
    }

    fn slow_down(&self, shard: u64, delay: Duration) {
        self.delays.lock().insert(ShardId(shard), delay);
    }

    fn lookups(&self) -> usize {
        *self.lookups.lock()
    }
}

#[async_trait]
impl CandidateSource for MockCandidates {
    async fn candidate_header(&self, shard: ShardId, period: u64) -> Result<Option<CandidateHeader>> {
        *self.lookups.lock() += 1;
        let delay = self.delays.lock().get(&shard).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.headers.lock().get(&(shard, period)).copied())
    }
}

fn block_hash(number: u64) -> B256 {
    let mut hash = B256::repeat_byte(0x01);
    hash[24..].copy_from_slice(&number.to_be_bytes());
    hash
}

fn chunk_root(shard: u64, period: u64) -> B256 {
    let mut root = B256::ZERO;
    root[0] = 0xc0;
    root[8..16].copy_from_slice(&shard.to_be_bytes());
    root[24..].copy_from_slice(&period.to_be_bytes());
    root
}

fn receipt(n: u64) -> TxReceipt {
    TxReceipt {
        tx_hash: B256::with_last_byte(n as u8),
        block_number: Some(n),
    }
}

/// Period length 5 and a 3 block voting window, with short retry delays.
fn test_config() -> Config {
    let backoff = BackoffConfig {
        base: Duration::from_secs(1),
        cap: Duration::from_secs(4),
    };
    Config {
        period_length: 5,
        voting_window: 3,
        shard_count: 10,
        deposit_backoff: backoff,
        resubscribe_backoff: backoff,
        vote_backoff: BackoffConfig {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(2),
        },
        candidate_poll_interval: Duration::from_secs(1),
        receipt_timeout: Duration::from_secs(10),
        stop_timeout: Duration::from_secs(5),
        ..Config::new("ws://localhost:8546", Address::repeat_byte(0x5c))
    }
}

fn notary_address() -> Address {
    Address::repeat_byte(0x42)
}

fn build_notary(
    config: Config,
    chain: &Arc<MockChain>,
    candidates: &Arc<MockCandidates>,
) -> Notary<MockChain, MockCandidates> {
    Notary::new(config, notary_address(), chain.clone(), candidates.clone()).unwrap()
}

/// Starts a notary against a chain which already holds its deposit, and waits for the header subscription.
async fn running_notary(
    chain: &Arc<MockChain>,
    candidates: &Arc<MockCandidates>,
) -> Notary<MockChain, MockCandidates> {
    let mut notary = build_notary(test_config(), chain, candidates);
    notary.start().unwrap();
    notary.wait_for_state(ServiceState::Running).await;
    chain.wait_for_subscriptions(1).await;
    notary
}

/// Lets every task run until it blocks. Time is paused in these tests, so this only advances the clock by a moment.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Produces each block in turn, settling after each.
async fn produce_blocks(chain: &MockChain, blocks: impl IntoIterator<Item = u64>) {
    for block in blocks {
        chain.produce_block(block);
        settle().await;
    }
}
