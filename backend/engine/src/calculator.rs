use fvp_store::{AssetRecord, ClaimType, TransactionRecord, Vault};
use tracing::{debug, warn};

use crate::arith::{self, mul_div_floor, pow10, Ratio};
use crate::error::{EngineError, EngineResult};

/// A contributed asset with its resolved unit price in whole coin
/// (`floorPrice || dexPrice || oracle || 0`).
#[derive(Debug, Clone)]
pub struct PricedAsset {
    pub record: AssetRecord,
    pub price: u64,
}

impl PricedAsset {
    pub fn value(&self) -> u128 {
        self.price as u128 * self.record.quantity as u128
    }
}

/// One confirmed Contribute transaction and its priced assets.
#[derive(Debug, Clone)]
pub struct ContributionInput {
    pub transaction: TransactionRecord,
    pub assets: Vec<PricedAsset>,
}

impl ContributionInput {
    pub fn value(&self) -> u128 {
        self.assets.iter().map(PricedAsset::value).sum()
    }
}

/// Settlement promise before persistence assigns an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimDraft {
    pub user_id: String,
    pub transaction_id: String,
    pub claim_type: ClaimType,
    /// VT base units.
    pub vt_amount: u64,
    /// Coin base units.
    pub coin_amount: u64,
    /// Shared acquirer multiplier; zero for contributors.
    pub multiplier: u64,
}

/// Full result of the entitlement computation for one vault.
#[derive(Debug, Clone)]
pub struct DistributionPlan {
    pub fdv: u128,
    /// Whole coin reserved for the LP pool's coin side.
    pub lp_coin: u64,
    /// VT base units reserved for the LP pool's token side.
    pub lp_vt: u128,
    pub adjusted_lp_vt: u128,
    pub coin_pair_multiplier: u64,
    /// Normalized minimum across acquirers; written on-chain as the single
    /// acquirer slot.
    pub acquire_multiplier: u64,
    /// Whole coin.
    pub total_acquired_coin: u64,
    /// Whole coin.
    pub total_tvl: u128,
    /// Whole coin left for contributors after the LP cut.
    pub coin_for_contributors: u64,
    pub claims: Vec<ClaimDraft>,
}

#[derive(Debug, Clone)]
pub enum DistributionOutcome {
    /// Acquired coin did not meet the reserve threshold; the vault fails and
    /// no claims are produced.
    BelowThreshold { required: u128, acquired: u64 },
    Plan(DistributionPlan),
}

/// Turns a locked vault's confirmed contributions and acquisitions into
/// per-claim VT and coin entitlements.
pub struct Calculator {
    coin_decimals: u32,
}

fn overflow() -> EngineError {
    EngineError::InputValidation("arithmetic overflow in distribution math".into())
}

impl Calculator {
    pub fn new(coin_decimals: u32) -> Self {
        Self { coin_decimals }
    }

    pub fn compute(
        &self,
        vault: &Vault,
        contributions: &[ContributionInput],
        acquisitions: &[TransactionRecord],
    ) -> EngineResult<DistributionOutcome> {
        for pct in [
            vault.tokens_for_acquirers_pct,
            vault.lp_pct,
            vault.acquire_reserve_pct,
        ] {
            if pct > 100 {
                return Err(EngineError::InputValidation(format!(
                    "vault {} has a percentage out of range: {pct}",
                    vault.id
                )));
            }
        }

        let supply = vault.vt_supply_scaled();
        let pct = vault.tokens_for_acquirers_pct as u128;
        let coin_scale = pow10(self.coin_decimals);

        let total_acquired_coin: u64 = acquisitions.iter().map(|a| a.coin_amount).sum();
        let total_tvl: u128 = contributions.iter().map(ContributionInput::value).sum();

        // Threshold rule: totalTvl * acquirersPct * reservePct / 10000.
        let required = total_tvl * pct * vault.acquire_reserve_pct as u128 / 10_000;
        if (total_acquired_coin as u128) < required {
            warn!(
                vault_id = %vault.id,
                acquired = total_acquired_coin,
                required,
                "acquired coin below reserve threshold"
            );
            return Ok(DistributionOutcome::BelowThreshold {
                required,
                acquired: total_acquired_coin,
            });
        }

        let lp_vt = arith::lp_half_share(vault.lp_pct, supply);
        let fdv = arith::fdv(total_acquired_coin, vault.tokens_for_acquirers_pct);
        let lp_coin = arith::lp_half_share(vault.lp_pct, fdv) as u64;
        let residual_supply = supply - lp_vt;

        let coin_pair_multiplier = if total_acquired_coin == 0 {
            0
        } else {
            u64::try_from(lp_vt / (total_acquired_coin as u128 * coin_scale))
                .map_err(|_| overflow())?
        };
        let adjusted_lp_vt =
            coin_pair_multiplier as u128 * total_acquired_coin as u128 * coin_scale;

        let mut claims = Vec::new();

        // Acquirers: per-claim multiplier first, then normalize everyone down
        // to the minimum so a single shared integer goes on-chain.
        let mut acquire_multiplier = u64::MAX;
        let mut any_acquirer = false;
        for acq in acquisitions {
            if acq.coin_amount == 0 {
                warn!(tx = %acq.id, "skipping zero-coin acquisition");
                continue;
            }
            any_acquirer = true;
            let raw = mul_div_floor(
                acq.coin_amount as u128 * pct,
                residual_supply,
                100 * total_acquired_coin as u128,
            )
            .ok_or_else(overflow)?;
            let multiplier =
                u64::try_from(raw / (acq.coin_amount as u128 * coin_scale)).map_err(|_| overflow())?;
            acquire_multiplier = acquire_multiplier.min(multiplier);
        }
        if !any_acquirer {
            acquire_multiplier = 0;
        }
        for acq in acquisitions {
            if acq.coin_amount == 0 {
                continue;
            }
            let vt_amount = u64::try_from(
                acquire_multiplier as u128 * acq.coin_amount as u128 * coin_scale,
            )
            .map_err(|_| overflow())?;
            claims.push(ClaimDraft {
                user_id: acq.user_id.clone(),
                transaction_id: acq.id.clone(),
                claim_type: ClaimType::Acquirer,
                vt_amount,
                coin_amount: 0,
                multiplier: acquire_multiplier,
            });
        }

        // Contributors: proportional by value, then split across the user's
        // transactions by each transaction's share of the user's value.
        let coin_for_contributors = total_acquired_coin.saturating_sub(lp_coin);
        let mut user_order: Vec<String> = Vec::new();
        let mut by_user: std::collections::HashMap<String, Vec<&ContributionInput>> =
            std::collections::HashMap::new();
        for contribution in contributions {
            let user = contribution.transaction.user_id.clone();
            if !by_user.contains_key(&user) {
                user_order.push(user.clone());
            }
            by_user.entry(user).or_default().push(contribution);
        }

        for user_id in &user_order {
            let user_contributions = &by_user[user_id];
            let user_value: u128 = user_contributions.iter().map(|c| c.value()).sum();

            let user_total_vt = if total_tvl == 0 {
                0
            } else {
                mul_div_floor(
                    residual_supply,
                    (100 - pct) * user_value,
                    100 * total_tvl,
                )
                .ok_or_else(overflow)?
            };
            let user_share = if total_tvl == 0 {
                Ratio::zero()
            } else {
                Ratio::new(user_value, total_tvl).ok_or_else(overflow)?
            };
            let user_coin_share = user_share
                .mul_int(coin_for_contributors as u128)
                .ok_or_else(overflow)?;

            for contribution in user_contributions {
                let tx_value = contribution.value();
                let proportion = if user_value == 0 {
                    Ratio::zero()
                } else {
                    Ratio::new(tx_value, user_value).ok_or_else(overflow)?
                };
                let vt_amount = if user_value == 0 {
                    0
                } else {
                    u64::try_from(
                        mul_div_floor(user_total_vt, tx_value, user_value).ok_or_else(overflow)?,
                    )
                    .map_err(|_| overflow())?
                };
                let coin_amount = u64::try_from(
                    user_coin_share
                        .mul(&proportion)
                        .and_then(|r| r.mul_int(coin_scale))
                        .ok_or_else(overflow)?
                        .floor(),
                )
                .map_err(|_| overflow())?;

                claims.push(ClaimDraft {
                    user_id: user_id.clone(),
                    transaction_id: contribution.transaction.id.clone(),
                    claim_type: ClaimType::Contributor,
                    vt_amount,
                    coin_amount,
                    multiplier: 0,
                });
            }
        }

        debug!(
            vault_id = %vault.id,
            claims = claims.len(),
            acquire_multiplier,
            coin_pair_multiplier,
            "distribution computed"
        );
        Ok(DistributionOutcome::Plan(DistributionPlan {
            fdv,
            lp_coin,
            lp_vt,
            adjusted_lp_vt,
            coin_pair_multiplier,
            acquire_multiplier,
            total_acquired_coin,
            total_tvl,
            coin_for_contributors,
            claims,
        }))
    }
}
