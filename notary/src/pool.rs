//! Admission to the notary pool.

use std::{sync::Arc, time::Duration};

use alloy::primitives::Address;
use tokio::time;
use tracing::*;

use crate::{
    backoff::Backoff,
    cfg::BackoffConfig,
    error::{NotaryError, RegistryError},
    registry::Registry,
    shutdown::Shutdown,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DepositStatus {
    NotDeposited,
    /// The join transaction is being sent.
    Depositing,
    Deposited,
}

/// Makes sure the notary holds a deposit before it does anything else.
///
/// A notary without a deposit is never sampled, so nothing downstream is started until this reaches
/// [DepositStatus::Deposited].
pub struct PoolMembership<R> {
    registry: Arc<R>,
    notary: Address,
    auto_deposit: bool,
    /// How long the join transaction may take to be mined before it is considered lost.
    join_timeout: Duration,
    backoff: Backoff,
    status: DepositStatus,
}

impl<R: Registry> PoolMembership<R> {
    pub fn new(
        registry: Arc<R>,
        notary: Address,
        auto_deposit: bool,
        join_timeout: Duration,
        backoff: BackoffConfig,
    ) -> Self {
        PoolMembership {
            registry,
            notary,
            auto_deposit,
            join_timeout,
            backoff: Backoff::new(backoff),
            status: DepositStatus::NotDeposited,
        }
    }

    pub fn status(&self) -> DepositStatus {
        self.status
    }

    /// Drives the membership state machine until the notary is deposited. Returns `Ok(false)` if stop was signalled
    /// first.
    ///
    /// Transient failures are retried forever. A rejected join transaction is fatal.
    pub async fn ensure_deposited(&mut self, shutdown: &mut Shutdown) -> Result<bool, NotaryError> {
        loop {
            match self.status {
                DepositStatus::Deposited => return Ok(true),
                DepositStatus::NotDeposited => {
                    let Some(deposited) = shutdown.until(self.registry.is_deposited(self.notary)).await
                    else {
                        return Ok(false);
                    };
                    match deposited {
                        Ok(true) => {
                            info!(notary = %self.notary, "notary holds a deposit");
                            self.status = DepositStatus::Deposited;
                            self.backoff.reset();
                            continue;
                        }
                        Ok(false) if self.auto_deposit => {
                            self.status = DepositStatus::Depositing;
                            continue;
                        }
                        Ok(false) => {
                            info!(notary = %self.notary, "no deposit found, waiting for one to be made");
                        }
                        Err(e) => {
                            warn!(%e, "failed to query deposit");
                        }
                    }
                }
                DepositStatus::Depositing => {
                    info!(notary = %self.notary, "joining notary pool");
                    let join = time::timeout(self.join_timeout, self.registry.join_pool());
                    let Some(joined) = shutdown.until(join).await else {
                        warn!(notary = %self.notary, "stopped while pool join was in flight, it may or may not have been mined");
                        return Ok(false);
                    };
                    let joined = joined.unwrap_or_else(|_| {
                        Err(RegistryError::ChainUnavailable(format!(
                            "pool join not mined within {:?}",
                            self.join_timeout
                        )))
                    });
                    match joined {
                        Ok(receipt) => {
                            info!(tx = %receipt.tx_hash, block = ?receipt.block_number, "joined notary pool");
                            self.status = DepositStatus::Deposited;
                            self.backoff.reset();
                            continue;
                        }
                        Err(RegistryError::ChainUnavailable(e)) => {
                            // The transaction may still have been sent, so check the deposit again before resending.
                            warn!(%e, "pool join failed");
                            self.status = DepositStatus::NotDeposited;
                        }
                        Err(e) => {
                            error!(%e, "pool join rejected");
                            return Err(NotaryError::DepositRejected(e.to_string()));
                        }
                    }
                }
            }

            let delay = self.backoff.next_delay();
            debug!(?delay, attempt = self.backoff.failures(), "retrying deposit");
            if !shutdown.sleep(delay).await {
                return Ok(false);
            }
        }
    }
}
