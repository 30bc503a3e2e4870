use fvp_chain::Network;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Engine tunables. Defaults match the reference deployment; everything here
/// is loadable from the daemon's TOML config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Distribution driver period.
    pub tick_interval_secs: u64,
    /// Hard protocol ceiling for a serialized transaction.
    pub tx_size_limit: usize,
    /// Update transactions target this percentage of the ceiling to leave
    /// headroom for signatures.
    pub update_size_headroom_pct: u32,
    /// Minimum same-priced asset count before a policy collapses to one
    /// policy-wide tuple.
    pub grouping_threshold: usize,
    /// Acquirer claims attempted per extract transaction before halving.
    pub max_acquirer_batch: usize,
    /// Contributor claims per pay transaction; growth stops here.
    pub max_pay_batch: usize,
    /// Coin payouts below this many base units are paid as zero-coin
    /// (`coinPaid = None`). Not derived from chain parameters; keep at or
    /// above the network's minimum-UTXO requirement.
    pub min_payment: u64,
    /// Missing-UTXO retries before the vault yields to the next tick.
    pub max_utxo_retries: u32,
    pub confirmation_timeout_ms: u64,
    /// Decimal places of the native coin.
    pub coin_decimals: u32,
    /// Stake-credential registration deposit, base units.
    pub stake_deposit: u64,
    /// Allow splitting the multiplier list across several update batches.
    pub multi_batch: bool,
    /// Age after which an in-progress distribution is reported stuck.
    pub stuck_after_secs: u64,
    pub network: Network,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 900,
            tx_size_limit: 16_384,
            update_size_headroom_pct: 85,
            grouping_threshold: 1,
            max_acquirer_batch: 10,
            max_pay_batch: 15,
            min_payment: 4_000,
            max_utxo_retries: 3,
            confirmation_timeout_ms: 120_000,
            coin_decimals: 6,
            stake_deposit: 2_000_000,
            multi_batch: true,
            stuck_after_secs: 1_800,
            network: Network::Mainnet,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.tx_size_limit == 0 {
            return Err(EngineError::InputValidation(
                "tx_size_limit cannot be 0".into(),
            ));
        }
        if !(1..=100).contains(&self.update_size_headroom_pct) {
            return Err(EngineError::InputValidation(
                "update_size_headroom_pct must be in 1..=100".into(),
            ));
        }
        if self.max_pay_batch == 0 || self.max_acquirer_batch == 0 {
            return Err(EngineError::InputValidation(
                "batch limits must be positive".into(),
            ));
        }
        if self.coin_decimals > 9 {
            return Err(EngineError::InputValidation(
                "coin_decimals must be in 0..=9".into(),
            ));
        }
        Ok(())
    }

    /// Byte budget for an update transaction.
    pub fn update_size_budget(&self) -> usize {
        self.tx_size_limit * self.update_size_headroom_pct as usize / 100
    }
}
