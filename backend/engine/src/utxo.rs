use std::sync::Arc;

use fvp_chain::{BlockchainClient, Utxo, UtxoRef};
use tracing::debug;

use crate::error::{EngineError, EngineResult};

/// One asset the selection must include.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetTarget {
    pub policy_id: String,
    pub asset_name: String,
    pub quantity: u64,
}

/// Selection constraints: coin target, asset targets, exclusions, and a
/// minimum coin per candidate.
#[derive(Debug, Clone, Default)]
pub struct UtxoQuery {
    pub min_coin: Option<u64>,
    pub target_coin: Option<u64>,
    pub target_assets: Vec<AssetTarget>,
    pub exclude: Vec<UtxoRef>,
}

#[derive(Debug, Clone)]
pub struct UtxoSelection {
    pub utxos: Vec<Utxo>,
    /// Inputs the builder must consume even if its own coin selection would
    /// not pick them (the NFT-bearing outputs).
    pub required_inputs: Vec<UtxoRef>,
    pub total_collected: u64,
}

/// Largest-first selection over an address's unspent outputs. Asset-targeted
/// outputs are always included and reported as required inputs.
pub struct UtxoSelector {
    client: Arc<dyn BlockchainClient>,
}

impl UtxoSelector {
    pub fn new(client: Arc<dyn BlockchainClient>) -> Self {
        Self { client }
    }

    pub async fn select(&self, address: &str, query: &UtxoQuery) -> EngineResult<UtxoSelection> {
        let mut candidates: Vec<Utxo> = self
            .client
            .utxos_at(address)
            .await?
            .into_iter()
            .filter(|u| !query.exclude.contains(&u.reference))
            .filter(|u| query.min_coin.map_or(true, |m| u.coin >= m))
            .collect();

        let mut selected: Vec<Utxo> = Vec::new();
        let mut required_inputs: Vec<UtxoRef> = Vec::new();
        let mut total_collected: u64 = 0;

        for target in &query.target_assets {
            let position = candidates
                .iter()
                .position(|u| {
                    u.asset_quantity(&target.policy_id, &target.asset_name) >= target.quantity
                })
                .ok_or_else(|| EngineError::InsufficientUtxos {
                    address: address.to_string(),
                    needed: query.target_coin.unwrap_or(0),
                    collected: total_collected,
                })?;
            let utxo = candidates.remove(position);
            total_collected += utxo.coin;
            required_inputs.push(utxo.reference.clone());
            selected.push(utxo);
        }

        if let Some(target) = query.target_coin {
            candidates.sort_by(|a, b| b.coin.cmp(&a.coin));
            let mut iter = candidates.into_iter();
            while total_collected < target {
                match iter.next() {
                    Some(utxo) => {
                        total_collected += utxo.coin;
                        selected.push(utxo);
                    }
                    None => {
                        return Err(EngineError::InsufficientUtxos {
                            address: address.to_string(),
                            needed: target,
                            collected: total_collected,
                        })
                    }
                }
            }
        }

        debug!(
            address,
            selected = selected.len(),
            total_collected,
            "utxo selection complete"
        );
        Ok(UtxoSelection {
            utxos: selected,
            required_inputs,
            total_collected,
        })
    }
}
