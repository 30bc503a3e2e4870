use std::collections::HashMap;

use fvp_chain::{MultiplierTuple, Network};
use fvp_store::Vault;
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::packer::{PackedEntry, Packing};
use crate::size_oracle::SizeOracle;

/// One ordered, size-feasible slice of the packing. Whole transaction groups
/// only: no contribution transaction's tuples are ever split across batches.
#[derive(Debug, Clone)]
pub struct Batch {
    pub entries: Vec<PackedEntry>,
    pub group_count: usize,
}

impl Batch {
    pub fn vt_tuples(&self) -> Vec<MultiplierTuple> {
        self.entries.iter().map(|e| e.vt.clone()).collect()
    }

    pub fn coin_tuples(&self) -> Vec<MultiplierTuple> {
        self.entries.iter().filter_map(|e| e.coin.clone()).collect()
    }

    pub fn claim_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for entry in &self.entries {
            for id in &entry.claim_ids {
                if !ids.contains(id) {
                    ids.push(id.clone());
                }
            }
        }
        ids
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchPlan {
    pub batches: Vec<Batch>,
}

impl BatchPlan {
    pub fn total_batches(&self) -> u32 {
        self.batches.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

struct Dsu {
    parent: Vec<usize>,
}

impl Dsu {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, i: usize) -> usize {
        if self.parent[i] != i {
            let root = self.find(self.parent[i]);
            self.parent[i] = root;
        }
        self.parent[i]
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[rb] = ra;
        }
    }
}

/// Partitions a packing into transaction groups. Entries sharing a
/// contribution transaction (directly, or transitively through a policy-wide
/// tuple) form one group; groups are ordered by first appearance.
fn transaction_groups(packing: &Packing) -> Vec<Vec<PackedEntry>> {
    let mut tx_index: HashMap<&str, usize> = HashMap::new();
    for entry in &packing.entries {
        for tx_id in &entry.group_ids {
            let next = tx_index.len();
            tx_index.entry(tx_id.as_str()).or_insert(next);
        }
    }
    let mut dsu = Dsu::new(tx_index.len());
    for entry in &packing.entries {
        let first = tx_index[entry.group_ids[0].as_str()];
        for tx_id in &entry.group_ids[1..] {
            dsu.union(first, tx_index[tx_id.as_str()]);
        }
    }

    let mut group_order: Vec<usize> = Vec::new();
    let mut grouped: HashMap<usize, Vec<PackedEntry>> = HashMap::new();
    for entry in &packing.entries {
        let root = dsu.find(tx_index[entry.group_ids[0].as_str()]);
        if !grouped.contains_key(&root) {
            group_order.push(root);
        }
        grouped.entry(root).or_default().push(entry.clone());
    }
    group_order
        .into_iter()
        .map(|root| grouped.remove(&root).expect("group collected"))
        .collect()
}

/// Binary-searches the largest whole-group prefix of the packing that fits
/// the update size budget, then recurses on the remainder.
pub struct BatchSolver<'a> {
    size_oracle: &'a SizeOracle,
    multi_batch: bool,
    network: Network,
}

impl<'a> BatchSolver<'a> {
    pub fn new(size_oracle: &'a SizeOracle, multi_batch: bool, network: Network) -> Self {
        Self {
            size_oracle,
            multi_batch,
            network,
        }
    }

    async fn estimate_prefix(
        &self,
        vault: &Vault,
        groups: &[Vec<PackedEntry>],
        k: usize,
    ) -> EngineResult<crate::size_oracle::SizeEstimate> {
        let entries: Vec<&PackedEntry> = groups[..k].iter().flatten().collect();
        let vt: Vec<MultiplierTuple> = entries.iter().map(|e| e.vt.clone()).collect();
        let coin: Vec<MultiplierTuple> = entries.iter().filter_map(|e| e.coin.clone()).collect();
        self.size_oracle
            .estimate(vault, &vt, &coin, vault.coin_pair_multiplier, self.network)
            .await
    }

    pub async fn solve(&self, vault: &Vault, packing: &Packing) -> EngineResult<BatchPlan> {
        if packing.is_empty() {
            return Ok(BatchPlan::default());
        }
        let mut remaining = transaction_groups(packing);
        let mut batches = Vec::new();

        while !remaining.is_empty() {
            let n = remaining.len();
            let whole = self.estimate_prefix(vault, &remaining, n).await?;
            if whole.fits {
                batches.push(Batch {
                    entries: remaining.drain(..).flatten().collect(),
                    group_count: n,
                });
                break;
            }
            if !self.multi_batch {
                return Err(EngineError::SizeOverflow {
                    size: whole.bytes,
                    budget: self.size_oracle.update_budget(),
                });
            }
            // Even one group alone must fit, otherwise the vault needs manual
            // intervention.
            let first = self.estimate_prefix(vault, &remaining, 1).await?;
            if !first.fits {
                return Err(EngineError::SizeOverflow {
                    size: first.bytes,
                    budget: self.size_oracle.update_budget(),
                });
            }
            if n == 1 {
                // Single group that fits alone but tripped the whole-list
                // check cannot happen; defensive fallthrough.
                batches.push(Batch {
                    entries: remaining.drain(..).flatten().collect(),
                    group_count: 1,
                });
                break;
            }

            let mut lo = 1usize;
            let mut hi = n - 1;
            while lo < hi {
                let mid = (lo + hi + 1) / 2;
                if self.estimate_prefix(vault, &remaining, mid).await?.fits {
                    lo = mid;
                } else {
                    hi = mid - 1;
                }
            }
            let taken: Vec<Vec<PackedEntry>> = remaining.drain(..lo).collect();
            batches.push(Batch {
                entries: taken.into_iter().flatten().collect(),
                group_count: lo,
            });
            debug!(
                vault_id = %vault.id,
                batch = batches.len(),
                groups_taken = lo,
                groups_left = remaining.len(),
                "batch cut at transaction-group boundary"
            );
        }

        info!(
            vault_id = %vault.id,
            total_batches = batches.len(),
            "batch plan computed"
        );
        Ok(BatchPlan { batches })
    }
}
