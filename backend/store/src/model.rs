use chrono::{DateTime, Utc};
use fvp_chain::{MultiplierTuple, UtxoRef};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of one fractionalization vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VaultStatus {
    Draft,
    Open,
    Contributing,
    Acquiring,
    Locked,
    Successful,
    Failed,
    Finalized,
}

/// Aggregate root for one fractionalization.
///
/// `on_chain_* ∪ pending_*` is the canonical packing; the update stage moves
/// tuples from pending to on-chain one batch at a time, atomically with the
/// batch counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vault {
    pub id: String,
    /// Vault spending script.
    pub script_hash: String,
    pub script_address: String,
    /// Hex name of the vault identity asset.
    pub asset_vault_name: String,
    /// VT mint policy.
    pub vt_policy_id: String,
    /// Parameterized per vault on the first extract.
    pub dispatch_script_hash: Option<String>,
    pub dispatch_address: Option<String>,
    pub admin_address: String,
    /// Whole tokens, pre-decimal.
    pub vt_token_supply: u64,
    pub vt_decimals: u32,
    pub tokens_for_acquirers_pct: u32,
    pub lp_pct: u32,
    pub acquire_reserve_pct: u32,
    pub status: VaultStatus,
    /// Datum-bearing output of the latest confirmed state update.
    pub last_update_tx_ref: Option<UtxoRef>,
    pub stake_registered: bool,
    pub on_chain_multipliers: Vec<MultiplierTuple>,
    pub pending_multipliers: Vec<MultiplierTuple>,
    pub on_chain_coin_distribution: Vec<MultiplierTuple>,
    pub pending_coin_distribution: Vec<MultiplierTuple>,
    pub coin_pair_multiplier: u64,
    pub current_batch: u32,
    pub total_batches: u32,
    pub manual_mode: bool,
    pub distribution_in_progress: bool,
    pub distribution_processed: bool,
    pub distribution_started_at: Option<DateTime<Utc>>,
}

impl Vault {
    /// Multipliers currently committed on-chain plus those queued.
    pub fn canonical_multipliers(&self) -> Vec<MultiplierTuple> {
        let mut all = self.on_chain_multipliers.clone();
        all.extend(self.pending_multipliers.iter().cloned());
        all
    }

    pub fn vt_supply_scaled(&self) -> u128 {
        self.vt_token_supply as u128 * 10u128.pow(self.vt_decimals)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssetOriginType {
    Contributed,
    Other,
}

/// One logical asset entry locked by a user's contribution transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub id: String,
    pub transaction_id: String,
    pub policy_id: String,
    /// Hex asset name; empty for policy-level entries.
    pub asset_id: String,
    pub quantity: u64,
    pub floor_price: Option<u64>,
    pub dex_price: Option<u64>,
    pub origin_type: AssetOriginType,
    pub distributed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    Contribute,
    Acquire,
    Claim,
    ExtractDispatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Created,
    Submitted,
    Confirmed,
    Failed,
}

/// A user input transaction (Contribute/Acquire) or an engine write-ahead
/// row (Claim/ExtractDispatch).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: String,
    pub vault_id: String,
    pub user_id: String,
    pub tx_hash: String,
    /// Output index of the locked contribution UTXO at the vault script.
    pub output_index: u32,
    pub tx_type: TransactionType,
    pub status: TransactionStatus,
    /// Whole coin for Acquire; ignored for Contribute.
    pub coin_amount: u64,
    /// Address that funded the input; payouts return here.
    pub owner_address: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransactionRecord {
    /// Reference of the output this transaction locked at the vault script.
    pub fn contribution_ref(&self) -> UtxoRef {
        UtxoRef::new(self.tx_hash.clone(), self.output_index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimType {
    Contributor,
    Acquirer,
    Lp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimStatus {
    Pending,
    Available,
    Claimed,
    Failed,
}

impl ClaimStatus {
    /// `Claimed` and `Failed` are terminal; `Failed` may never become
    /// `Claimed` again.
    pub fn can_transition_to(self, next: ClaimStatus) -> bool {
        match (self, next) {
            (a, b) if a == b => true,
            (ClaimStatus::Pending, _) => true,
            (ClaimStatus::Available, ClaimStatus::Claimed)
            | (ClaimStatus::Available, ClaimStatus::Failed) => true,
            _ => false,
        }
    }
}

/// Why a claim was marked `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason")]
pub enum ClaimFailureReason {
    UtxoAlreadySpent { consumed_by_tx: String },
    BuildFailed { detail: String },
}

/// The engine's settlement promise to one user for one input transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub id: String,
    pub vault_id: String,
    pub user_id: String,
    pub transaction_id: String,
    pub claim_type: ClaimType,
    /// VT base units.
    pub vt_amount: u64,
    /// Coin base units; 0 for acquirer claims before extraction.
    pub coin_amount: u64,
    /// Shared acquirer multiplier; 0 for contributor claims.
    pub multiplier: u64,
    pub status: ClaimStatus,
    pub failure: Option<ClaimFailureReason>,
    pub distribution_batch: Option<u32>,
    pub distribution_tx_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
