use fvp_chain::{ChainError, OracleError, UtxoRef};
use fvp_store::StoreError;
use thiserror::Error;

/// Engine failure taxonomy. Stage code matches on variants to decide between
/// retry, batch shrinking, claim failure and tick abort; nothing here is used
/// as control flow for the happy path.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InputValidation(String),

    /// Local to a tick: the vault yields and the next tick retries. Never
    /// marks claims failed.
    #[error("insufficient utxos at {address}: needed {needed}, collected {collected}")]
    InsufficientUtxos {
        address: String,
        needed: u64,
        collected: u64,
    },

    #[error("transaction size {size} exceeds budget {budget}")]
    SizeOverflow { size: usize, budget: usize },

    /// A claim's contribution UTXO was provably consumed by another
    /// transaction; that claim fails, others continue.
    #[error("input {reference} already consumed by {consumed_by_tx}")]
    InputConsumedElsewhere {
        reference: UtxoRef,
        consumed_by_tx: String,
    },

    #[error("build failure: {0}")]
    BuildFailure(String),

    #[error("submit failure: {0}")]
    SubmitFailure(String),

    /// Not a failure for the engine: the next tick reconciles by re-reading
    /// on-chain state.
    #[error("confirmation timed out for {tx_hash}")]
    ConfirmationTimeout { tx_hash: String },

    /// Aborts the whole tick with no state mutation.
    #[error("blockchain unavailable: {0}")]
    BlockchainUnavailable(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("price oracle failure: {0}")]
    Oracle(#[from] OracleError),
}

impl From<ChainError> for EngineError {
    fn from(e: ChainError) -> Self {
        match e {
            ChainError::Unavailable { reason } => EngineError::BlockchainUnavailable(reason),
            ChainError::MissingUtxo { reference } => EngineError::BuildFailure(format!(
                "input {reference} missing or already spent"
            )),
            ChainError::BuildRejected { reason } => EngineError::BuildFailure(reason),
            ChainError::TooLarge { size, limit } => EngineError::SizeOverflow {
                size,
                budget: limit,
            },
            ChainError::SubmitRejected { reason } => EngineError::SubmitFailure(reason),
            ChainError::Decode(reason) => EngineError::BlockchainUnavailable(reason),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
