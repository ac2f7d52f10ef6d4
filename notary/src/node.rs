//! The notary service.

use std::sync::Arc;

use alloy::primitives::Address;
use anyhow::{Result, anyhow};
use futures::StreamExt;
use opentelemetry::metrics::Counter;
use parking_lot::Mutex;
use tokio::{
    select,
    sync::watch,
    task::{JoinError, JoinHandle, JoinSet},
    time,
};
use tracing::*;

use crate::{
    backoff::Backoff,
    cfg::Config,
    committee::CommitteeSampler,
    error::NotaryError,
    period::PeriodScheduler,
    pool::PoolMembership,
    registry::{BlockHeader, Registry},
    shard::CandidateSource,
    shutdown::{self, Shutdown, Trigger},
    vote::{VoteOutcome, VoteSubmitter},
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    /// Launched, waiting for the notary's deposit.
    Starting,
    /// Following the chain and voting.
    Running,
    Stopping,
}

/// A collation notary. Joins the notary pool, then follows the main chain and votes on every committee it is sampled
/// onto until stopped.
pub struct Notary<R, C> {
    config: Config,
    identity: Address,
    registry: Arc<R>,
    candidates: Arc<C>,
    state: Arc<watch::Sender<ServiceState>>,
    fatal: Arc<Mutex<Option<NotaryError>>>,
    stop: Option<Trigger>,
    handle: Option<JoinHandle<()>>,
}

impl<R: Registry, C: CandidateSource> Notary<R, C> {
    pub fn new(config: Config, identity: Address, registry: Arc<R>, candidates: Arc<C>) -> Result<Self> {
        config.validate()?;
        let (state, _) = watch::channel(ServiceState::Stopped);
        Ok(Notary {
            config,
            identity,
            registry,
            candidates,
            state: Arc::new(state),
            fatal: Arc::new(Mutex::new(None)),
            stop: None,
            handle: None,
        })
    }

    pub fn identity(&self) -> Address {
        self.identity
    }

    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    /// Receives every state change from now on.
    pub fn subscribe_state(&self) -> watch::Receiver<ServiceState> {
        self.state.subscribe()
    }

    /// Waits until the service reaches `state`.
    pub async fn wait_for_state(&self, state: ServiceState) {
        let mut receiver = self.subscribe_state();
        // The sender lives in `self`, so it cannot be dropped while we wait.
        let _ = receiver.wait_for(|s| *s == state).await;
    }

    /// The error which stopped the service, if it stopped on its own.
    pub fn fatal_error(&self) -> Option<NotaryError> {
        self.fatal.lock().clone()
    }

    /// Launches the notary in the background and returns straight away.
    pub fn start(&mut self) -> Result<()> {
        if self.handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(anyhow!("notary already running"));
        }

        info!(notary = %self.identity, "starting notary service");
        *self.fatal.lock() = None;
        self.state.send_replace(ServiceState::Starting);

        let (trigger, shutdown) = shutdown::channel();
        let supervisor = Supervisor {
            config: self.config.clone(),
            identity: self.identity,
            registry: self.registry.clone(),
            candidates: self.candidates.clone(),
            state: self.state.clone(),
            trigger: trigger.clone(),
            shutdown,
            periods: opentelemetry::global::meter("notary")
                .u64_counter("notary.periods")
                .with_description("Period boundaries processed")
                .build(),
        };
        let fatal = self.fatal.clone();
        let state = self.state.clone();
        self.handle = Some(tokio::spawn(async move {
            if let Err(e) = supervisor.run().await {
                error!(%e, "notary stopped on fatal error");
                *fatal.lock() = Some(e);
            }
            state.send_replace(ServiceState::Stopped);
        }));
        self.stop = Some(trigger);

        Ok(())
    }

    /// Stops the notary and waits for in-flight votes to finish or be cancelled.
    ///
    /// Returns the fatal error if the service had already stopped because of one. Calling this on a stopped service
    /// does nothing.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        info!("stopping notary service");
        if !handle.is_finished() {
            self.state.send_replace(ServiceState::Stopping);
        }
        if let Some(stop) = self.stop.take() {
            stop.trigger();
        }

        let joined = handle.await;
        self.state.send_replace(ServiceState::Stopped);
        joined.map_err(|e: JoinError| anyhow!("notary task failed: {e}"))?;

        match self.fatal_error() {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

/// The background half of [Notary]. Owns everything the supervised loop touches.
struct Supervisor<R, C> {
    config: Config,
    identity: Address,
    registry: Arc<R>,
    candidates: Arc<C>,
    state: Arc<watch::Sender<ServiceState>>,
    trigger: Trigger,
    shutdown: Shutdown,
    periods: Counter<u64>,
}

impl<R: Registry, C: CandidateSource> Supervisor<R, C> {
    async fn run(mut self) -> Result<(), NotaryError> {
        let mut pool = PoolMembership::new(
            self.registry.clone(),
            self.identity,
            self.config.auto_deposit,
            self.config.receipt_timeout,
            self.config.deposit_backoff,
        );
        match pool.ensure_deposited(&mut self.shutdown).await {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(e) => {
                self.state.send_replace(ServiceState::Stopping);
                return Err(e);
            }
        }
        self.state.send_replace(ServiceState::Running);

        let (head_sender, head) = watch::channel(0);
        let mut pipeline = Pipeline {
            scheduler: PeriodScheduler::new(self.config.period_length),
            sampler: CommitteeSampler::new(
                self.registry.clone(),
                self.identity,
                self.config.shard_count,
                self.config.voting_window,
                self.config.sampling_attempts,
                self.config.vote_backoff,
            ),
            submitter: VoteSubmitter::new(
                self.registry.clone(),
                self.candidates.clone(),
                self.config.vote_backoff,
                self.config.candidate_poll_interval,
                head,
                self.shutdown.clone(),
            ),
            head: head_sender,
            votes: JoinSet::new(),
            periods: self.periods.clone(),
        };

        let result = self.follow_chain(&mut pipeline).await;
        if result.is_err() {
            self.state.send_replace(ServiceState::Stopping);
        }
        // Whatever ended the loop, in-flight votes must not outlive it.
        self.trigger.trigger();
        pipeline.drain(self.config.stop_timeout).await;
        result
    }

    /// Follows the header stream until stopped, resubscribing whenever it is lost.
    async fn follow_chain(&mut self, pipeline: &mut Pipeline<R, C>) -> Result<(), NotaryError> {
        let mut backoff = Backoff::new(self.config.resubscribe_backoff);
        let mut resubscribing = false;

        loop {
            let Some(subscription) = self
                .shutdown
                .until(self.registry.subscribe_block_headers())
                .await
            else {
                return Ok(());
            };
            let mut headers = match subscription {
                Ok(headers) => headers,
                Err(e) => {
                    warn!(%e, "failed to subscribe to headers");
                    if !self.shutdown.sleep(backoff.next_delay()).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            if resubscribing {
                // Catch up on the periods which passed while we were disconnected.
                match self.shutdown.until(self.registry.current_block_number()).await {
                    None => return Ok(()),
                    Some(Ok(block)) => {
                        info!(block, "resubscribed to headers");
                        pipeline.on_block(block, &mut self.shutdown).await?;
                    }
                    Some(Err(e)) => {
                        warn!(%e, "failed to fetch current block, catching up on next header");
                    }
                }
            }
            resubscribing = true;

            loop {
                select! {
                    biased;
                    () = self.shutdown.triggered() => return Ok(()),
                    Some(joined) = pipeline.votes.join_next(), if !pipeline.votes.is_empty() => {
                        log_joined(joined);
                    }
                    header = headers.next() => match header {
                        Some(Ok(header)) => {
                            backoff.reset();
                            check_header(&header)?;
                            pipeline.on_block(header.number, &mut self.shutdown).await?;
                        }
                        Some(Err(e)) => {
                            warn!(%e, "header subscription failed");
                            break;
                        }
                        None => {
                            warn!("header subscription ended");
                            break;
                        }
                    },
                }
            }

            if !self.shutdown.sleep(backoff.next_delay()).await {
                return Ok(());
            }
        }
    }
}

struct Pipeline<R, C> {
    scheduler: PeriodScheduler,
    sampler: CommitteeSampler<R>,
    submitter: VoteSubmitter<R, C>,
    head: watch::Sender<u64>,
    votes: JoinSet<VoteOutcome>,
    periods: Counter<u64>,
}

impl<R: Registry, C: CandidateSource> Pipeline<R, C> {
    /// Advances the head to `block` and handles every period boundary this crosses, spawning a vote for each shard
    /// we are sampled onto.
    async fn on_block(&mut self, block: u64, shutdown: &mut Shutdown) -> Result<(), NotaryError> {
        self.head.send_if_modified(|head| {
            let advanced = block > *head;
            if advanced {
                *head = block;
            }
            advanced
        });

        for period in self.scheduler.observe(block).into_iter().flatten() {
            debug!(period, block, "period boundary");
            self.periods.add(1, &[]);

            let period_start = self.scheduler.period_start(period);
            let attempts = self.sampler.sample(period, period_start, shutdown).await?;
            if attempts.is_empty() {
                continue;
            }

            let shards: Vec<_> = attempts.iter().map(|a| a.shard.0).collect();
            info!(period, ?shards, "sampled onto committees");
            for attempt in attempts {
                self.votes.spawn(self.submitter.clone().run(attempt));
            }
        }
        Ok(())
    }

    /// Waits up to `timeout` for outstanding votes, which have been signalled to stop, then aborts the rest.
    async fn drain(&mut self, timeout: time::Duration) {
        let pending = self.votes.len();
        if pending == 0 {
            return;
        }
        debug!(pending, "waiting for in-flight votes");

        let drained = time::timeout(timeout, async {
            while let Some(joined) = self.votes.join_next().await {
                log_joined(joined);
            }
        })
        .await;
        if drained.is_err() {
            warn!(remaining = self.votes.len(), "votes did not stop in time, aborting them");
            self.votes.shutdown().await;
        }
    }
}

fn check_header(header: &BlockHeader) -> Result<(), NotaryError> {
    if header.hash.is_zero() {
        return Err(NotaryError::InvariantViolation(format!(
            "header for block {} has no hash",
            header.number
        )));
    }
    Ok(())
}

fn log_joined(joined: Result<VoteOutcome, JoinError>) {
    match joined {
        Ok(outcome) => trace!(outcome = outcome.name(), "vote task finished"),
        Err(e) if e.is_cancelled() => {}
        Err(e) => error!(%e, "vote task panicked"),
    }
}
