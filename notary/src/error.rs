/// An error from a call to the sharding manager contract.
///
/// The notary decides whether to retry purely on the variant, so adapters must map every failure into one of these.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The chain could not be reached or did not answer. Always worth retrying.
    #[error("chain unavailable: {0}")]
    ChainUnavailable(String),
    /// The chain answered and refused the request, e.g. a reverted transaction.
    #[error("rejected by chain: {0}")]
    ChainRejected(String),
    /// This notary has already voted for the requested shard and period.
    #[error("already voted")]
    AlreadyVoted,
}

impl RegistryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RegistryError::ChainUnavailable(_))
    }
}

/// An error which stops the notary service.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum NotaryError {
    /// The pool join transaction was refused. Without a deposit the notary is never sampled, so there is no point
    /// carrying on.
    #[error("deposit rejected: {0}")]
    DepositRejected(String),
    /// Data from a collaborator broke an invariant the notary relies on.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}
