use std::collections::BTreeMap;

use async_trait::async_trait;
use fvp_chain::{MultiplierTuple, UtxoRef};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{
    AssetRecord, Claim, ClaimFailureReason, TransactionRecord, TransactionStatus, TransactionType,
    Vault,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid transition for {entity} {id}: {detail}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        detail: String,
    },

    #[error("storage backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Everything the update stage must persist atomically once its transaction
/// confirms: tuple movement, the new datum-bearing output, batch counters and
/// the claims the batch now covers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateBatchCommit {
    pub vault_id: String,
    pub submitted_multipliers: Vec<MultiplierTuple>,
    pub submitted_coin_distribution: Vec<MultiplierTuple>,
    /// Manual mode only: overwrite the on-chain arrays instead of appending,
    /// leaving pending entries untouched.
    pub replace_existing: bool,
    pub new_update_ref: UtxoRef,
    pub batch_number: u32,
    pub total_batches: u32,
    pub covered_claim_ids: Vec<String>,
}

/// Remove submitted tuples from a pending array. Batches are prefixes of the
/// pending list, so the common case drains the prefix; identical tuples (the
/// acquirer slots) make value-based removal unsafe, so each submitted tuple
/// removes at most one pending occurrence in the fallback.
pub fn trim_pending(pending: &mut Vec<MultiplierTuple>, submitted: &[MultiplierTuple]) {
    if pending.len() >= submitted.len() && pending[..submitted.len()] == *submitted {
        pending.drain(..submitted.len());
        return;
    }
    for tuple in submitted {
        if let Some(position) = pending.iter().position(|p| p == tuple) {
            pending.remove(position);
        }
    }
}

/// Persistence seam over the §3 data model. Implementations must make
/// `commit_update_batch` a single transactional write and must enforce the
/// monotonic claim-status rule.
#[async_trait]
pub trait Store: Send + Sync {
    // Vaults
    async fn insert_vault(&self, vault: &Vault) -> StoreResult<()>;
    async fn vault(&self, id: &str) -> StoreResult<Vault>;
    async fn update_vault(&self, vault: &Vault) -> StoreResult<()>;
    /// Unprocessed, ready vaults: Locked or Successful, `lastUpdateTxRef`
    /// set, distribution not yet processed.
    async fn ready_vaults(&self) -> StoreResult<Vec<Vault>>;
    async fn commit_update_batch(&self, commit: &UpdateBatchCommit) -> StoreResult<()>;

    // Input and write-ahead transactions
    async fn insert_transaction(&self, tx: &TransactionRecord) -> StoreResult<()>;
    async fn transaction(&self, id: &str) -> StoreResult<TransactionRecord>;
    async fn transactions_for_vault(
        &self,
        vault_id: &str,
        tx_type: Option<TransactionType>,
        status: Option<TransactionStatus>,
    ) -> StoreResult<Vec<TransactionRecord>>;
    async fn transition_transaction(&self, id: &str, status: TransactionStatus) -> StoreResult<()>;
    /// Record the chain hash of a write-ahead row. Happens at build time,
    /// before submission, so a crash cannot orphan a landed transaction.
    async fn attach_transaction_hash(&self, id: &str, tx_hash: &str) -> StoreResult<()>;

    // Assets
    async fn insert_asset(&self, asset: &AssetRecord) -> StoreResult<()>;
    async fn assets_for_transaction(&self, transaction_id: &str) -> StoreResult<Vec<AssetRecord>>;
    async fn mark_assets_distributed(&self, transaction_id: &str) -> StoreResult<()>;

    // Claims
    async fn insert_claims(&self, claims: &[Claim]) -> StoreResult<()>;
    async fn claim(&self, id: &str) -> StoreResult<Claim>;
    async fn claims_for_vault(&self, vault_id: &str) -> StoreResult<Vec<Claim>>;
    /// All pending claims for a vault, grouped by user.
    async fn pending_claims_by_user(
        &self,
        vault_id: &str,
    ) -> StoreResult<BTreeMap<String, Vec<Claim>>>;
    async fn mark_claim_claimed(&self, id: &str, distribution_tx_id: &str) -> StoreResult<()>;
    async fn mark_claim_failed(&self, id: &str, reason: ClaimFailureReason) -> StoreResult<()>;
    /// Bind still-pending claims to the write-ahead settlement transaction
    /// that will pay them; confirmation flips them to `Claimed`.
    async fn assign_claim_distribution_tx(
        &self,
        claim_id: &str,
        distribution_tx_id: &str,
    ) -> StoreResult<()>;
}
