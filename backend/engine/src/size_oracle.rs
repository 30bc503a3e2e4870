use std::sync::Arc;

use fvp_chain::{BlockchainClient, MultiplierTuple};
use fvp_store::Vault;
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::stages::update::build_update_input;

/// Measured size of a dry-run update transaction against the protocol
/// ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeEstimate {
    pub bytes: usize,
    pub percent_of_max: u32,
    /// Within the update stage's headroom budget.
    pub fits: bool,
}

/// Estimates a built transaction's byte size by asking the client for a
/// dry-run build.
pub struct SizeOracle {
    client: Arc<dyn BlockchainClient>,
    tx_size_limit: usize,
    update_budget: usize,
}

impl SizeOracle {
    pub fn new(client: Arc<dyn BlockchainClient>, config: &EngineConfig) -> Self {
        Self {
            client,
            tx_size_limit: config.tx_size_limit,
            update_budget: config.update_size_budget(),
        }
    }

    /// Byte budget update transactions are held to.
    pub fn update_budget(&self) -> usize {
        self.update_budget
    }

    pub async fn estimate(
        &self,
        vault: &Vault,
        vt_tuples: &[MultiplierTuple],
        coin_tuples: &[MultiplierTuple],
        coin_pair_multiplier: u64,
        network: fvp_chain::Network,
    ) -> EngineResult<SizeEstimate> {
        let input =
            build_update_input(vault, vt_tuples, coin_tuples, coin_pair_multiplier, network)?;
        let built = self.client.build(&input).await?;
        let estimate = SizeEstimate {
            bytes: built.size,
            percent_of_max: (built.size * 100 / self.tx_size_limit) as u32,
            fits: built.size <= self.update_budget,
        };
        debug!(
            bytes = estimate.bytes,
            percent = estimate.percent_of_max,
            fits = estimate.fits,
            tuples = vt_tuples.len() + coin_tuples.len(),
            "estimated update transaction"
        );
        Ok(estimate)
    }
}
