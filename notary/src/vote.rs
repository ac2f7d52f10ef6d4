//! Submitting a single vote before its window closes.

use std::{sync::Arc, time::Duration};

use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram},
};
use tokio::{sync::watch, time::Instant};
use tracing::*;

use crate::{
    backoff::Backoff,
    cfg::BackoffConfig,
    committee::VoteAttempt,
    error::RegistryError,
    registry::{Registry, TxReceipt},
    shard::{CandidateHeader, CandidateSource},
    shutdown::Shutdown,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteOutcome {
    Submitted(TxReceipt),
    /// The contract already holds our vote, e.g. from before a restart. As good as [VoteOutcome::Submitted].
    AlreadyVoted,
    /// The contract refused the vote for another reason.
    Rejected(String),
    /// The window closed before we could vote, usually because no candidate header turned up in time.
    Missed,
    /// The service was stopped first.
    Cancelled,
}

impl VoteOutcome {
    pub fn name(&self) -> &'static str {
        match self {
            VoteOutcome::Submitted(_) => "submitted",
            VoteOutcome::AlreadyVoted => "already_voted",
            VoteOutcome::Rejected(_) => "rejected",
            VoteOutcome::Missed => "missed",
            VoteOutcome::Cancelled => "cancelled",
        }
    }

    /// Whether our vote is recorded on chain.
    pub fn is_success(&self) -> bool {
        matches!(self, VoteOutcome::Submitted(_) | VoteOutcome::AlreadyVoted)
    }
}

#[derive(Clone)]
struct VoteMetrics {
    votes: Counter<u64>,
    duration: Histogram<f64>,
}

impl VoteMetrics {
    fn new() -> Self {
        let meter = opentelemetry::global::meter("notary");
        VoteMetrics {
            votes: meter
                .u64_counter("notary.votes")
                .with_description("Vote attempts by outcome")
                .build(),
            duration: meter
                .f64_histogram("notary.vote.duration")
                .with_unit("s")
                .with_boundaries(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0])
                .build(),
        }
    }
}

/// Runs [VoteAttempt]s. Cheap to clone; every attempt runs on its own clone in its own task, so a stalled attempt
/// never holds up another.
pub struct VoteSubmitter<R, C> {
    registry: Arc<R>,
    candidates: Arc<C>,
    backoff: BackoffConfig,
    poll_interval: Duration,
    /// Highest main chain block observed so far. Deadlines are measured against this.
    head: watch::Receiver<u64>,
    shutdown: Shutdown,
    metrics: VoteMetrics,
}

impl<R, C> Clone for VoteSubmitter<R, C> {
    fn clone(&self) -> Self {
        VoteSubmitter {
            registry: self.registry.clone(),
            candidates: self.candidates.clone(),
            backoff: self.backoff,
            poll_interval: self.poll_interval,
            head: self.head.clone(),
            shutdown: self.shutdown.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<R: Registry, C: CandidateSource> VoteSubmitter<R, C> {
    pub fn new(
        registry: Arc<R>,
        candidates: Arc<C>,
        backoff: BackoffConfig,
        poll_interval: Duration,
        head: watch::Receiver<u64>,
        shutdown: Shutdown,
    ) -> Self {
        VoteSubmitter {
            registry,
            candidates,
            backoff,
            poll_interval,
            head,
            shutdown,
            metrics: VoteMetrics::new(),
        }
    }

    pub async fn run(mut self, mut attempt: VoteAttempt) -> VoteOutcome {
        let start = Instant::now();
        let outcome = self.vote(&mut attempt).await;

        let VoteAttempt {
            shard,
            period,
            attempts,
            ..
        } = attempt;
        match &outcome {
            VoteOutcome::Submitted(receipt) => {
                info!(%shard, period, attempts, tx = %receipt.tx_hash, "vote submitted");
            }
            VoteOutcome::AlreadyVoted => {
                info!(%shard, period, attempts, "vote already recorded");
            }
            VoteOutcome::Rejected(reason) => {
                warn!(%shard, period, attempts, %reason, "vote rejected, abandoning");
            }
            VoteOutcome::Missed => {
                warn!(%shard, period, deadline = attempt.deadline, "voting window closed before we could vote");
            }
            VoteOutcome::Cancelled => {
                debug!(%shard, period, "vote cancelled");
            }
        }
        self.metrics
            .votes
            .add(1, &[KeyValue::new("outcome", outcome.name())]);
        self.metrics.duration.record(
            start.elapsed().as_secs_f64(),
            &[KeyValue::new("outcome", outcome.name())],
        );

        outcome
    }

    async fn vote(&mut self, attempt: &mut VoteAttempt) -> VoteOutcome {
        let header = match self.wait_for_candidate(attempt).await {
            Ok(header) => header,
            Err(outcome) => return outcome,
        };
        // The header may have turned up in the same instant the window closed.
        if self.window_closed(attempt.deadline) {
            return VoteOutcome::Missed;
        }
        attempt.chunk_root = Some(header.chunk_root);

        let mut backoff = Backoff::new(self.backoff);
        loop {
            attempt.attempts += 1;
            let submission = self.registry.submit_vote(attempt.shard, attempt.period, header.chunk_root);
            let result = tokio::select! {
                biased;
                () = self.shutdown.triggered() => {
                    warn!(
                        shard = %attempt.shard,
                        period = attempt.period,
                        chunk_root = %header.chunk_root,
                        "stopped while vote was in flight, it may or may not have been recorded"
                    );
                    return VoteOutcome::Cancelled;
                }
                () = window_closes(&mut self.head, attempt.deadline) => {
                    warn!(
                        shard = %attempt.shard,
                        period = attempt.period,
                        chunk_root = %header.chunk_root,
                        "window closed while vote was in flight, it may or may not have been recorded"
                    );
                    return VoteOutcome::Missed;
                }
                result = submission => result,
            };
            match result {
                Ok(receipt) => return VoteOutcome::Submitted(receipt),
                Err(RegistryError::AlreadyVoted) => return VoteOutcome::AlreadyVoted,
                Err(RegistryError::ChainRejected(reason)) => return VoteOutcome::Rejected(reason),
                Err(RegistryError::ChainUnavailable(e)) => {
                    warn!(shard = %attempt.shard, period = attempt.period, attempt = attempt.attempts, %e, "vote submission failed");
                }
            }

            let delay = backoff.next_delay();
            if let Err(outcome) = self.pause(delay, attempt.deadline).await {
                return outcome;
            }
            if self.window_closed(attempt.deadline) {
                return VoteOutcome::Missed;
            }
        }
    }

    /// Looks the candidate header up, asking again every `poll_interval`, until it is found, the window closes or we
    /// are stopped.
    async fn wait_for_candidate(
        &mut self,
        attempt: &VoteAttempt,
    ) -> Result<CandidateHeader, VoteOutcome> {
        let (shard, period) = (attempt.shard, attempt.period);
        loop {
            if self.window_closed(attempt.deadline) {
                return Err(VoteOutcome::Missed);
            }

            let lookup = self.candidates.candidate_header(shard, period);
            tokio::select! {
                biased;
                () = self.shutdown.triggered() => return Err(VoteOutcome::Cancelled),
                () = window_closes(&mut self.head, attempt.deadline) => return Err(VoteOutcome::Missed),
                result = lookup => match result {
                    Ok(Some(header)) => return Ok(header),
                    Ok(None) => debug!(%shard, period, "candidate header not available yet"),
                    Err(e) => warn!(%shard, period, %e, "failed to look up candidate header"),
                },
            }

            self.pause(self.poll_interval, attempt.deadline).await?;
        }
    }

    /// Waits for `duration`, cut short by the window closing or a stop.
    async fn pause(&mut self, duration: Duration, deadline: u64) -> Result<(), VoteOutcome> {
        tokio::select! {
            biased;
            () = self.shutdown.triggered() => Err(VoteOutcome::Cancelled),
            () = window_closes(&mut self.head, deadline) => Err(VoteOutcome::Missed),
            () = tokio::time::sleep(duration) => Ok(()),
        }
    }

    fn window_closed(&self, deadline: u64) -> bool {
        *self.head.borrow() >= deadline
    }
}

/// Resolves once the head reaches `deadline`. Never resolves if the head is no longer being updated; in that case the
/// service is stopping and the stop signal ends the wait instead.
async fn window_closes(head: &mut watch::Receiver<u64>, deadline: u64) {
    if head.wait_for(|block| *block >= deadline).await.is_err() {
        std::future::pending::<()>().await;
    }
}
