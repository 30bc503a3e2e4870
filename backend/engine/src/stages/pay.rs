use std::collections::HashMap;
use std::sync::Arc;

use fvp_chain::{
    AssetAmount, AssetNameFormat, BlockchainClient, ChainError, Datum, MintAsset, MultiplierTuple,
    Redeemer, ScriptInteraction, ScriptPurpose, TxInput, TxOutputSpec, Utxo, UtxoRef,
};
use fvp_store::{
    Claim, ClaimFailureReason, ClaimStatus, ClaimType, Store, TransactionRecord, TransactionStatus,
    TransactionType, Vault,
};
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::stages::{
    confirm_settlement, eligible_claims, open_settlement_record, reconcile_settlements,
};
use crate::utxo::{UtxoQuery, UtxoSelector};

/// The on-chain validator's lookup: exact `(policyId, assetName)` tuple
/// first, policy-wide fallback, else zero.
pub fn multiplier_given_asset(table: &[MultiplierTuple], policy_id: &str, asset_name: &str) -> u64 {
    if let Some(exact) = table
        .iter()
        .find(|t| t.policy_id == policy_id && t.asset_name.as_deref() == Some(asset_name))
    {
        return exact.value;
    }
    table
        .iter()
        .find(|t| t.policy_id == policy_id && t.asset_name.is_none())
        .map(|t| t.value)
        .unwrap_or(0)
}

struct ReadyClaim {
    claim: Claim,
    tx: TransactionRecord,
    utxo: Utxo,
}

enum SubmitOutcome {
    Confirmed(Vault),
    TimedOut,
    MissingInput(UtxoRef),
}

/// Pays contributors their coin and VT from the dispatch script while
/// returning their contributed assets to the vault.
pub struct PayStage {
    client: Arc<dyn BlockchainClient>,
    store: Arc<dyn Store>,
    selector: UtxoSelector,
    config: EngineConfig,
}

impl PayStage {
    pub fn new(
        client: Arc<dyn BlockchainClient>,
        store: Arc<dyn Store>,
        config: EngineConfig,
    ) -> Self {
        let selector = UtxoSelector::new(client.clone());
        Self {
            client,
            store,
            selector,
            config,
        }
    }

    fn paid_coin(&self, claim: &Claim) -> u64 {
        if claim.coin_amount >= self.config.min_payment {
            claim.coin_amount
        } else {
            0
        }
    }

    /// Replay the validator's VT computation over the contribution UTXO's
    /// actual assets so the built outputs match the on-chain sum. The burned
    /// receipt (vault policy) is not part of the contributed set.
    fn replayed_vt(&self, vault: &Vault, utxo: &Utxo) -> u64 {
        utxo.assets
            .iter()
            .filter(|a| a.policy_id != vault.vt_policy_id)
            .map(|a| {
                a.quantity
                    * multiplier_given_asset(
                        &vault.on_chain_multipliers,
                        &a.policy_id,
                        &a.asset_name,
                    )
            })
            .sum()
    }

    /// The pay transaction for one chunk: spend each contribution UTXO with
    /// `CollectVaultToken`, spend dispatch UTXOs covering the chunk's coin,
    /// mint the summed VT, burn receipts, pay each user and return each
    /// contribution to the vault script.
    async fn build_chunk_input(
        &self,
        vault: &Vault,
        chunk: &[ReadyClaim],
        exclude: &[UtxoRef],
        with_dispatch: bool,
    ) -> EngineResult<TxInput> {
        let update_ref = vault.last_update_tx_ref.clone().ok_or_else(|| {
            EngineError::InputValidation(format!("vault {} has no state output", vault.id))
        })?;

        let mut input = TxInput::new(vault.admin_address.clone(), self.config.network);
        input.reference_inputs.push(update_ref);
        input.required_signers.push(vault.admin_address.clone());
        input.message = Some(format!("vault {} contributor payout", vault.id));

        let needed_coin: u64 = chunk.iter().map(|r| self.paid_coin(&r.claim)).sum();
        let mut total_mint: u128 = 0;

        for (index, ready) in chunk.iter().enumerate() {
            let reference = ready.tx.contribution_ref();
            let tag = fvp_chain::datum_tag(&reference.tx_hash, reference.output_index);
            input.script_interactions.push(ScriptInteraction {
                purpose: ScriptPurpose::Spend,
                hash: vault.script_hash.clone(),
                output_ref: Some(reference),
                redeemer: Redeemer::CollectVaultToken {
                    vt_output_index: (2 * index) as u32,
                    change_output_index: (2 * index + 1) as u32,
                },
            });

            let user_vt = self.replayed_vt(vault, &ready.utxo);
            total_mint += user_vt as u128;
            let paid = self.paid_coin(&ready.claim);

            input.outputs.push(TxOutputSpec {
                address: ready.tx.owner_address.clone(),
                coin: if paid > 0 { Some(paid) } else { None },
                assets: vec![AssetAmount {
                    policy_id: vault.vt_policy_id.clone(),
                    asset_name: vault.asset_vault_name.clone(),
                    quantity: user_vt,
                }],
                datum: Some(Datum::OutputPayout {
                    datum_tag: tag.clone(),
                    coin_paid: if paid > 0 { Some(paid) } else { None },
                }),
            });

            // Contributed assets go back to the vault script with their
            // original coin minimum.
            let returned: Vec<AssetAmount> = ready
                .utxo
                .assets
                .iter()
                .filter(|a| a.policy_id != vault.vt_policy_id)
                .cloned()
                .collect();
            input.outputs.push(TxOutputSpec {
                address: vault.script_address.clone(),
                coin: Some(ready.utxo.coin),
                assets: returned,
                datum: Some(Datum::AssetDatum {
                    policy_id: vault.vt_policy_id.clone(),
                    asset_vault_name: vault.asset_vault_name.clone(),
                    owner: ready.tx.owner_address.clone(),
                    datum_tag: tag,
                }),
            });

            input.mint.push(MintAsset {
                policy_id: vault.vt_policy_id.clone(),
                asset_name: ready.tx.tx_hash.clone(),
                name_format: AssetNameFormat::Hex,
                quantity: -1,
            });
        }

        if with_dispatch && needed_coin > 0 {
            let dispatch_hash = vault.dispatch_script_hash.as_deref().ok_or_else(|| {
                EngineError::InputValidation(format!("vault {} dispatch script missing", vault.id))
            })?;
            let dispatch_address = vault.dispatch_address.as_deref().ok_or_else(|| {
                EngineError::InputValidation(format!("vault {} dispatch address missing", vault.id))
            })?;
            let selection = self
                .selector
                .select(
                    dispatch_address,
                    &UtxoQuery {
                        target_coin: Some(needed_coin),
                        exclude: exclude.to_vec(),
                        ..UtxoQuery::default()
                    },
                )
                .await?;
            for utxo in &selection.utxos {
                input.utxos.push(utxo.reference.clone());
                input.script_interactions.push(ScriptInteraction {
                    purpose: ScriptPurpose::Spend,
                    hash: dispatch_hash.to_string(),
                    output_ref: Some(utxo.reference.clone()),
                    redeemer: Redeemer::Null,
                });
            }
            let leftover = selection.total_collected - needed_coin;
            if leftover > 0 {
                input.outputs.push(TxOutputSpec {
                    address: dispatch_address.to_string(),
                    coin: Some(leftover),
                    assets: vec![],
                    datum: None,
                });
            }
        }

        input.mint.push(MintAsset {
            policy_id: vault.vt_policy_id.clone(),
            asset_name: vault.asset_vault_name.clone(),
            name_format: AssetNameFormat::Hex,
            quantity: i64::try_from(total_mint).map_err(|_| {
                EngineError::InputValidation("arithmetic overflow in pay amounts".into())
            })?,
        });
        input.script_interactions.push(ScriptInteraction {
            purpose: ScriptPurpose::Mint,
            hash: vault.vt_policy_id.clone(),
            output_ref: None,
            redeemer: Redeemer::MintVaultToken,
        });
        Ok(input)
    }

    /// Grow from 2 claims while the measured build stays within the size
    /// ceiling; stop at the configured maximum; fall back to 1.
    async fn choose_batch_size(
        &self,
        vault: &Vault,
        queue: &[ReadyClaim],
        exclude: &[UtxoRef],
        with_dispatch: bool,
    ) -> EngineResult<usize> {
        let max = queue.len().min(self.config.max_pay_batch);
        if max <= 1 {
            return Ok(max);
        }
        let mut last_good = None;
        let mut take = 2.min(max);
        while take <= max {
            let input = self
                .build_chunk_input(vault, &queue[..take], exclude, with_dispatch)
                .await?;
            match self.client.build(&input).await {
                Ok(built) if built.size <= self.config.tx_size_limit => {
                    last_good = Some(take);
                    take += 1;
                }
                Ok(_) | Err(ChainError::TooLarge { .. }) => break,
                // A hard build failure here falls back to a single claim; the
                // submission path decides whether that claim fails.
                Err(_) => return Ok(1),
            }
        }
        Ok(last_good.unwrap_or(1))
    }

    async fn submit_chunk(
        &self,
        vault: &Vault,
        chunk: &[ReadyClaim],
        exclude: &[UtxoRef],
        with_dispatch: bool,
    ) -> EngineResult<SubmitOutcome> {
        let input = self
            .build_chunk_input(vault, chunk, exclude, with_dispatch)
            .await?;
        let built = self.client.build(&input).await?;
        if built.size > self.config.tx_size_limit {
            return Err(EngineError::SizeOverflow {
                size: built.size,
                budget: self.config.tx_size_limit,
            });
        }

        let claims: Vec<Claim> = chunk.iter().map(|r| r.claim.clone()).collect();
        let record =
            open_settlement_record(&self.store, vault, TransactionType::Claim, &claims).await?;
        self.store
            .attach_transaction_hash(&record.id, &built.tx_hash)
            .await?;

        let submitted = match self.client.submit(&built.hex).await {
            Ok(submitted) => submitted,
            Err(ChainError::MissingUtxo { reference }) => {
                self.store
                    .transition_transaction(&record.id, TransactionStatus::Failed)
                    .await?;
                return Ok(SubmitOutcome::MissingInput(reference));
            }
            Err(e) => {
                self.store
                    .transition_transaction(&record.id, TransactionStatus::Failed)
                    .await?;
                return Err(e.into());
            }
        };
        self.store
            .transition_transaction(&record.id, TransactionStatus::Submitted)
            .await?;
        info!(
            vault_id = %vault.id,
            claims = chunk.len(),
            tx_hash = %submitted.tx_hash,
            "📤 Pay submitted"
        );

        let confirmed = self
            .client
            .wait_confirmation(&submitted.tx_hash, self.config.confirmation_timeout_ms)
            .await?;
        if !confirmed {
            warn!(
                vault_id = %vault.id,
                tx_hash = %submitted.tx_hash,
                "pay confirmation timed out; next tick reconciles"
            );
            return Ok(SubmitOutcome::TimedOut);
        }

        confirm_settlement(&self.store, vault, &record.id).await?;
        let updated = self.store.vault(&vault.id).await?;
        info!(vault_id = %vault.id, claims = chunk.len(), "✅ Pay confirmed");
        Ok(SubmitOutcome::Confirmed(updated))
    }

    /// Settle every eligible contributor claim of the current batch. Runs
    /// only once no acquirer claim of the vault is still open.
    pub async fn run(&self, vault: &Vault) -> EngineResult<Vault> {
        let mut vault = vault.clone();
        reconcile_settlements(&self.client, &self.store, &vault, TransactionType::Claim).await?;

        let all_claims = self.store.claims_for_vault(&vault.id).await?;
        let acquirers_open = all_claims.iter().any(|c| {
            c.claim_type == ClaimType::Acquirer
                && matches!(c.status, ClaimStatus::Pending | ClaimStatus::Available)
        });
        if acquirers_open {
            return Ok(vault);
        }

        let eligible = eligible_claims(&self.store, &vault, ClaimType::Contributor).await?;
        if eligible.is_empty() {
            return Ok(vault);
        }

        let script_utxos = self.client.utxos_at(&vault.script_address).await?;
        let by_ref: HashMap<UtxoRef, Utxo> = script_utxos
            .into_iter()
            .map(|u| (u.reference.clone(), u))
            .collect();
        let mut queue: Vec<ReadyClaim> = Vec::new();
        for claim in eligible {
            let tx = self.store.transaction(&claim.transaction_id).await?;
            let reference = tx.contribution_ref();
            match by_ref.get(&reference) {
                Some(utxo) => queue.push(ReadyClaim {
                    claim,
                    tx,
                    utxo: utxo.clone(),
                }),
                None => match self.client.utxo_spent_by(&reference).await? {
                    Some(consumer) => {
                        warn!(
                            claim_id = %claim.id,
                            %reference,
                            consumer = %consumer,
                            "contribution input consumed elsewhere; failing claim"
                        );
                        self.store
                            .mark_claim_failed(
                                &claim.id,
                                ClaimFailureReason::UtxoAlreadySpent {
                                    consumed_by_tx: consumer,
                                },
                            )
                            .await?;
                    }
                    None => {
                        self.store
                            .mark_claim_failed(
                                &claim.id,
                                ClaimFailureReason::BuildFailed {
                                    detail: format!("contribution utxo {reference} not found"),
                                },
                            )
                            .await?;
                    }
                },
            }
        }

        // tokensForAcquirersPct == 0 means no dispatch funding exists:
        // no dispatch inputs and no coin outputs, VT and asset return only.
        let with_dispatch = vault.tokens_for_acquirers_pct > 0;
        let mut exclude: Vec<UtxoRef> = Vec::new();
        let mut retries: u32 = 0;

        while !queue.is_empty() {
            let take = self
                .choose_batch_size(&vault, &queue, &exclude, with_dispatch)
                .await?;
            match self
                .submit_chunk(&vault, &queue[..take], &exclude, with_dispatch)
                .await
            {
                Ok(SubmitOutcome::Confirmed(updated)) => {
                    vault = updated;
                    queue.drain(..take);
                    retries = 0;
                }
                Ok(SubmitOutcome::TimedOut) => return Ok(vault),
                Ok(SubmitOutcome::MissingInput(reference)) => {
                    if let Some(position) = queue
                        .iter()
                        .position(|r| r.tx.contribution_ref() == reference)
                    {
                        let consumer = self
                            .client
                            .utxo_spent_by(&reference)
                            .await?
                            .unwrap_or_default();
                        self.store
                            .mark_claim_failed(
                                &queue[position].claim.id,
                                ClaimFailureReason::UtxoAlreadySpent {
                                    consumed_by_tx: consumer,
                                },
                            )
                            .await?;
                        queue.remove(position);
                    } else {
                        // A dispatch input went missing; re-select without it.
                        retries += 1;
                        if retries > self.config.max_utxo_retries {
                            return Err(EngineError::InsufficientUtxos {
                                address: vault
                                    .dispatch_address
                                    .clone()
                                    .unwrap_or_default(),
                                needed: queue.iter().map(|r| self.paid_coin(&r.claim)).sum(),
                                collected: 0,
                            });
                        }
                        warn!(%reference, retries, "dispatch input spent from under us; excluding");
                        exclude.push(reference);
                    }
                }
                Err(EngineError::BuildFailure(detail)) if take == 1 => {
                    self.store
                        .mark_claim_failed(
                            &queue[0].claim.id,
                            ClaimFailureReason::BuildFailed { detail },
                        )
                        .await?;
                    queue.remove(0);
                }
                Err(EngineError::SizeOverflow { size, .. }) if take == 1 => {
                    self.store
                        .mark_claim_failed(
                            &queue[0].claim.id,
                            ClaimFailureReason::BuildFailed {
                                detail: format!("single-claim payment oversize: {size} bytes"),
                            },
                        )
                        .await?;
                    queue.remove(0);
                }
                Err(EngineError::SizeOverflow { .. }) => {
                    // Re-measure next iteration with the shrunken queue view.
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(vault)
    }
}
