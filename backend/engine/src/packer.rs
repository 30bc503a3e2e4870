use std::collections::HashMap;

use fvp_chain::MultiplierTuple;
use fvp_store::Claim;
use tracing::debug;

use crate::calculator::PricedAsset;
use crate::error::{EngineError, EngineResult};

/// One stored contributor claim with the priced assets of its contribution
/// transaction, in stable order.
#[derive(Debug, Clone)]
pub struct ClaimAssets {
    pub claim: Claim,
    pub assets: Vec<PricedAsset>,
}

/// One emitted multiplier entry: the VT tuple, the aligned coin tuple
/// (absent for the acquirer slot), and the transactions and claims it covers.
#[derive(Debug, Clone)]
pub struct PackedEntry {
    pub vt: MultiplierTuple,
    pub coin: Option<MultiplierTuple>,
    /// Contribution transaction ids whose assets this entry covers. More than
    /// one when price grouping collapsed a policy across transactions; those
    /// transactions must then land in the same batch.
    pub group_ids: Vec<String>,
    pub claim_ids: Vec<String>,
}

/// Ordered tuple emission for one vault.
#[derive(Debug, Clone, Default)]
pub struct Packing {
    pub entries: Vec<PackedEntry>,
}

impl Packing {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

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

#[derive(Default)]
struct PolicyStats {
    prices: Vec<u64>,
    asset_count: usize,
}

struct PolicyAccumulator {
    min_vt: u64,
    min_coin: u64,
    group_ids: Vec<String>,
    claim_ids: Vec<String>,
}

enum Slot {
    Ready(PackedEntry),
    Policy(String),
}

/// Converts claims into the `acquire_multiplier` and `coin_distribution`
/// tuple lists, compressing single-priced policies into policy-wide entries.
pub struct MultiplierPacker {
    grouping_threshold: usize,
}

impl MultiplierPacker {
    pub fn new(grouping_threshold: usize) -> Self {
        Self { grouping_threshold }
    }

    /// Split an amount across `n` slots: the first `amount % n` slots get one
    /// extra base unit.
    fn split(amount: u64, n: u64, index: u64) -> u64 {
        let base = amount / n;
        let remainder = amount - base * n;
        if index < remainder {
            base + 1
        } else {
            base
        }
    }

    pub fn pack(
        &self,
        contributor_claims: &[ClaimAssets],
        acquirer_claims: &[Claim],
        acquire_multiplier: u64,
    ) -> EngineResult<Packing> {
        // First pass: which policies collapse to a single policy-wide tuple.
        // A policy qualifies when every contributed asset under it shares one
        // exact price bucket and the count meets the grouping threshold.
        let mut stats: HashMap<String, PolicyStats> = HashMap::new();
        for ca in contributor_claims {
            for asset in &ca.assets {
                let entry = stats.entry(asset.record.policy_id.clone()).or_default();
                if !entry.prices.contains(&asset.price) {
                    entry.prices.push(asset.price);
                }
                entry.asset_count += 1;
            }
        }
        let grouped = |policy: &str| -> bool {
            stats
                .get(policy)
                .map(|s| s.prices.len() == 1 && s.asset_count >= self.grouping_threshold)
                .unwrap_or(false)
        };

        let mut entries: Vec<PackedEntry> = Vec::new();

        // Acquirer slots first, one per acquirer claim, each its own trivial
        // transaction group. Keeping them ahead of the contributor tuples
        // puts every acquirer into the first batch, which the pay stage
        // depends on: contributors are only paid once no acquirer claim is
        // open.
        for claim in acquirer_claims {
            entries.push(PackedEntry {
                vt: MultiplierTuple::acquirer_slot(acquire_multiplier),
                coin: None,
                group_ids: vec![claim.transaction_id.clone()],
                claim_ids: vec![claim.id.clone()],
            });
        }

        let mut slots: Vec<Slot> = Vec::new();
        let mut accumulators: HashMap<String, PolicyAccumulator> = HashMap::new();

        for ca in contributor_claims {
            let n = ca.assets.len() as u64;
            if n == 0 {
                return Err(EngineError::InputValidation(format!(
                    "contributor claim {} has no assets",
                    ca.claim.id
                )));
            }
            for (i, asset) in ca.assets.iter().enumerate() {
                if asset.record.quantity == 0 {
                    return Err(EngineError::InputValidation(format!(
                        "asset {} has zero quantity",
                        asset.record.id
                    )));
                }
                let vt_share = Self::split(ca.claim.vt_amount, n, i as u64);
                let coin_share = Self::split(ca.claim.coin_amount, n, i as u64);
                let per_unit_vt = vt_share / asset.record.quantity;
                let per_unit_coin = coin_share / asset.record.quantity;

                let policy = &asset.record.policy_id;
                if grouped(policy) {
                    match accumulators.get_mut(policy) {
                        Some(acc) => {
                            acc.min_vt = acc.min_vt.min(per_unit_vt);
                            acc.min_coin = acc.min_coin.min(per_unit_coin);
                            if !acc.group_ids.contains(&ca.claim.transaction_id) {
                                acc.group_ids.push(ca.claim.transaction_id.clone());
                            }
                            if !acc.claim_ids.contains(&ca.claim.id) {
                                acc.claim_ids.push(ca.claim.id.clone());
                            }
                        }
                        None => {
                            accumulators.insert(
                                policy.clone(),
                                PolicyAccumulator {
                                    min_vt: per_unit_vt,
                                    min_coin: per_unit_coin,
                                    group_ids: vec![ca.claim.transaction_id.clone()],
                                    claim_ids: vec![ca.claim.id.clone()],
                                },
                            );
                            // Placeholder keeps the tuple at the position of
                            // the first covered asset.
                            slots.push(Slot::Policy(policy.clone()));
                        }
                    }
                } else {
                    slots.push(Slot::Ready(PackedEntry {
                        vt: MultiplierTuple::exact(
                            policy.clone(),
                            asset.record.asset_id.clone(),
                            per_unit_vt,
                        ),
                        coin: Some(MultiplierTuple::exact(
                            policy.clone(),
                            asset.record.asset_id.clone(),
                            per_unit_coin,
                        )),
                        group_ids: vec![ca.claim.transaction_id.clone()],
                        claim_ids: vec![ca.claim.id.clone()],
                    }));
                }
            }
        }

        let grouped_policies = accumulators.len();
        for slot in slots {
            match slot {
                Slot::Ready(entry) => entries.push(entry),
                Slot::Policy(policy) => {
                    let acc = accumulators
                        .remove(&policy)
                        .expect("accumulator exists for placeholder");
                    entries.push(PackedEntry {
                        vt: MultiplierTuple::policy_wide(policy.clone(), acc.min_vt),
                        coin: Some(MultiplierTuple::policy_wide(policy, acc.min_coin)),
                        group_ids: acc.group_ids,
                        claim_ids: acc.claim_ids,
                    });
                }
            }
        }

        debug!(
            entries = entries.len(),
            grouped_policies,
            "packed multiplier tuples"
        );
        Ok(Packing { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fvp_store::{AssetOriginType, AssetRecord, ClaimStatus, ClaimType};

    fn claim(id: &str, tx: &str, vt: u64, coin: u64, claim_type: ClaimType) -> Claim {
        Claim {
            id: id.into(),
            vault_id: "vault-1".into(),
            user_id: "alice".into(),
            transaction_id: tx.into(),
            claim_type,
            vt_amount: vt,
            coin_amount: coin,
            multiplier: 0,
            status: ClaimStatus::Pending,
            failure: None,
            distribution_batch: None,
            distribution_tx_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn asset(tx: &str, policy: &str, name: &str, qty: u64, price: u64) -> PricedAsset {
        PricedAsset {
            record: AssetRecord {
                id: format!("{tx}-{policy}-{name}"),
                transaction_id: tx.into(),
                policy_id: policy.into(),
                asset_id: name.into(),
                quantity: qty,
                floor_price: Some(price),
                dex_price: None,
                origin_type: AssetOriginType::Contributed,
                distributed: false,
            },
            price,
        }
    }

    #[test]
    fn test_remainder_goes_to_first_assets() {
        // 10 VT over 3 assets: 4, 3, 3. Threshold high enough to disable
        // grouping.
        let packer = MultiplierPacker::new(100);
        let packing = packer
            .pack(
                &[ClaimAssets {
                    claim: claim("cl1", "tx1", 10, 0, ClaimType::Contributor),
                    assets: vec![
                        asset("tx1", "aa", "01", 1, 5),
                        asset("tx1", "aa", "02", 1, 5),
                        asset("tx1", "aa", "03", 1, 5),
                    ],
                }],
                &[],
                0,
            )
            .unwrap();
        let values: Vec<u64> = packing.vt_tuples().iter().map(|t| t.value).collect();
        assert_eq!(values, vec![4, 3, 3]);
    }

    #[test]
    fn test_per_unit_divides_by_quantity() {
        let packer = MultiplierPacker::new(100);
        let packing = packer
            .pack(
                &[ClaimAssets {
                    claim: claim("cl1", "tx1", 100, 50, ClaimType::Contributor),
                    assets: vec![asset("tx1", "aa", "01", 7, 5)],
                }],
                &[],
                0,
            )
            .unwrap();
        assert_eq!(packing.vt_tuples()[0].value, 14);
        assert_eq!(packing.coin_tuples()[0].value, 7);
    }

    #[test]
    fn test_single_price_policy_collapses_to_one_tuple() {
        let packer = MultiplierPacker::new(1);
        let assets: Vec<PricedAsset> = (0..200)
            .map(|i| asset("tx1", "aa", &format!("{i:02x}"), 1, 5))
            .collect();
        let packing = packer
            .pack(
                &[ClaimAssets {
                    claim: claim("cl1", "tx1", 10_000, 2_000, ClaimType::Contributor),
                    assets,
                }],
                &[],
                0,
            )
            .unwrap();
        assert_eq!(packing.entries.len(), 1);
        let entry = &packing.entries[0];
        assert_eq!(entry.vt.asset_name, None);
        // 10000 over 200 assets = 50 each; min is 50.
        assert_eq!(entry.vt.value, 50);
        assert_eq!(entry.coin.as_ref().unwrap().value, 10);
    }

    #[test]
    fn test_mixed_prices_emit_per_asset_tuples() {
        let packer = MultiplierPacker::new(1);
        let mut assets: Vec<PricedAsset> = (0..100)
            .map(|i| asset("tx1", "aa", &format!("{i:02x}"), 1, 5))
            .collect();
        assets.extend((100..200).map(|i| asset("tx1", "aa", &format!("{i:02x}"), 1, 10)));
        let packing = packer
            .pack(
                &[ClaimAssets {
                    claim: claim("cl1", "tx1", 10_000, 0, ClaimType::Contributor),
                    assets,
                }],
                &[],
                0,
            )
            .unwrap();
        assert_eq!(packing.entries.len(), 200);
        assert!(packing.entries.iter().all(|e| e.vt.asset_name.is_some()));
    }

    #[test]
    fn test_policy_grouping_spans_transactions() {
        let packer = MultiplierPacker::new(1);
        let packing = packer
            .pack(
                &[
                    ClaimAssets {
                        claim: claim("cl1", "tx1", 100, 0, ClaimType::Contributor),
                        assets: vec![asset("tx1", "aa", "01", 1, 5)],
                    },
                    ClaimAssets {
                        claim: claim("cl2", "tx2", 60, 0, ClaimType::Contributor),
                        assets: vec![asset("tx2", "aa", "02", 1, 5)],
                    },
                ],
                &[],
                0,
            )
            .unwrap();
        assert_eq!(packing.entries.len(), 1);
        let entry = &packing.entries[0];
        // min(100, 60) across the policy's assets.
        assert_eq!(entry.vt.value, 60);
        assert_eq!(entry.group_ids, vec!["tx1".to_string(), "tx2".to_string()]);
        assert_eq!(entry.claim_ids.len(), 2);
    }

    #[test]
    fn test_acquirer_slot_emission() {
        let packer = MultiplierPacker::new(1);
        let packing = packer
            .pack(
                &[],
                &[
                    claim("acl1", "atx1", 0, 0, ClaimType::Acquirer),
                    claim("acl2", "atx2", 0, 0, ClaimType::Acquirer),
                ],
                970,
            )
            .unwrap();
        assert_eq!(packing.entries.len(), 2);
        assert!(packing.entries.iter().all(|e| e.vt.is_acquirer_slot()));
        assert!(packing.entries.iter().all(|e| e.vt.value == 970));
        assert!(packing.entries.iter().all(|e| e.coin.is_none()));
        assert_eq!(packing.coin_tuples().len(), 0);
    }

    #[test]
    fn test_every_asset_covered_exactly_once() {
        let packer = MultiplierPacker::new(1);
        // Policy aa groups (one price); policy bb mixes prices.
        let packing = packer
            .pack(
                &[ClaimAssets {
                    claim: claim("cl1", "tx1", 1_000, 0, ClaimType::Contributor),
                    assets: vec![
                        asset("tx1", "aa", "01", 1, 5),
                        asset("tx1", "aa", "02", 1, 5),
                        asset("tx1", "bb", "01", 1, 5),
                        asset("tx1", "bb", "02", 1, 9),
                    ],
                }],
                &[],
                0,
            )
            .unwrap();
        let tuples = packing.vt_tuples();
        // One policy-wide tuple for aa, one exact tuple per bb asset.
        assert_eq!(tuples.len(), 3);
        let aa: Vec<_> = tuples.iter().filter(|t| t.policy_id == "aa").collect();
        assert_eq!(aa.len(), 1);
        assert_eq!(aa[0].asset_name, None);
        let bb: Vec<_> = tuples.iter().filter(|t| t.policy_id == "bb").collect();
        assert_eq!(bb.len(), 2);
        assert!(bb.iter().all(|t| t.asset_name.is_some()));
    }
}
