use async_trait::async_trait;
use thiserror::Error;

use crate::types::{
    BuiltTx, DispatchParameters, ParameterizedScript, SubmitResult, TxInput, Utxo, UtxoRef,
};

/// Failures surfaced by a `BlockchainClient` implementation.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("blockchain unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("input {reference} is missing or already spent")]
    MissingUtxo { reference: UtxoRef },

    #[error("builder rejected transaction: {reason}")]
    BuildRejected { reason: String },

    #[error("transaction exceeds size limit: {size} > {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("submission rejected: {reason}")]
    SubmitRejected { reason: String },

    #[error("malformed response from chain gateway: {0}")]
    Decode(String),
}

impl ChainError {
    /// The spent/unknown input behind this error, when the gateway reported
    /// one. Drives the engine's UTXO retry path.
    pub fn missing_utxo(&self) -> Option<&UtxoRef> {
        match self {
            ChainError::MissingUtxo { reference } => Some(reference),
            _ => None,
        }
    }
}

pub type ChainResult<T> = Result<T, ChainError>;

/// Client for the platform's transaction gateway: builds, signs and submits
/// transactions and answers the chain-state queries the engine needs.
#[async_trait]
pub trait BlockchainClient: Send + Sync {
    /// Build a fully-balanced transaction from the semantic input shape.
    async fn build(&self, input: &TxInput) -> ChainResult<BuiltTx>;

    /// Submit a built transaction.
    async fn submit(&self, hex: &str) -> ChainResult<SubmitResult>;

    /// Wait for confirmation up to `timeout_ms`. `Ok(false)` means the wait
    /// timed out, not that the transaction failed.
    async fn wait_confirmation(&self, tx_hash: &str, timeout_ms: u64) -> ChainResult<bool>;

    /// Parameterize the dispatch script for one vault.
    async fn apply_dispatch_parameters(
        &self,
        params: &DispatchParameters,
    ) -> ChainResult<ParameterizedScript>;

    /// Unspent outputs currently held at an address.
    async fn utxos_at(&self, address: &str) -> ChainResult<Vec<Utxo>>;

    /// The output a contribution/acquire transaction produced at the given
    /// script address, if still unspent.
    async fn find_contribution_utxo(
        &self,
        script_address: &str,
        tx_hash: &str,
    ) -> ChainResult<Option<Utxo>>;

    /// The hash of the transaction that consumed `reference`, if any.
    async fn utxo_spent_by(&self, reference: &UtxoRef) -> ChainResult<Option<String>>;

    /// Whether a transaction is confirmed on-chain.
    async fn tx_confirmed(&self, tx_hash: &str) -> ChainResult<bool>;
}
