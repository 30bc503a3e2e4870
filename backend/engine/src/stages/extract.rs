use std::collections::HashMap;
use std::sync::Arc;

use fvp_chain::{
    AssetAmount, AssetNameFormat, BlockchainClient, Datum, DepositType, DispatchParameters,
    MintAsset, Redeemer, ScriptDeposit, ScriptInteraction, ScriptPurpose, TxInput, TxOutputSpec,
    Utxo, UtxoRef,
};
use fvp_store::{
    Claim, ClaimFailureReason, ClaimType, Store, TransactionRecord, TransactionStatus,
    TransactionType, Vault,
};
use tracing::{info, warn};

use crate::arith::pow10;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::stages::{
    confirm_settlement, eligible_claims, open_settlement_record, reconcile_settlements,
};

struct ReadyClaim {
    claim: Claim,
    tx: TransactionRecord,
    utxo: Utxo,
}

/// Moves acquirer-contributed coin into the dispatch script and mints the
/// acquirers' VT, one batch of claims per transaction.
pub struct ExtractStage {
    client: Arc<dyn BlockchainClient>,
    store: Arc<dyn Store>,
    config: EngineConfig,
}

impl ExtractStage {
    pub fn new(
        client: Arc<dyn BlockchainClient>,
        store: Arc<dyn Store>,
        config: EngineConfig,
    ) -> Self {
        Self {
            client,
            store,
            config,
        }
    }

    fn overflow() -> EngineError {
        EngineError::InputValidation("arithmetic overflow in extract amounts".into())
    }

    /// The extract transaction for one chunk of acquirer claims:
    /// spend each contribution UTXO with `ExtractCoin`, mint
    /// `(multiplier + coinPairMultiplier) * coin * 10^dec` VT per claim, burn
    /// one receipt per claim, and route the acquired coin to dispatch.
    fn build_chunk_input(&self, vault: &Vault, chunk: &[ReadyClaim]) -> EngineResult<TxInput> {
        let dispatch_hash = vault.dispatch_script_hash.as_deref().ok_or_else(|| {
            EngineError::InputValidation(format!("vault {} dispatch script missing", vault.id))
        })?;
        let dispatch_address = vault.dispatch_address.as_deref().ok_or_else(|| {
            EngineError::InputValidation(format!("vault {} dispatch address missing", vault.id))
        })?;
        let update_ref = vault.last_update_tx_ref.clone().ok_or_else(|| {
            EngineError::InputValidation(format!("vault {} has no state output", vault.id))
        })?;

        let coin_scale = pow10(self.config.coin_decimals);
        let mut input = TxInput::new(vault.admin_address.clone(), self.config.network);
        input.reference_inputs.push(update_ref);
        input.required_signers.push(vault.admin_address.clone());
        input.message = Some(format!("vault {} extract", vault.id));

        let mut total_mint: u128 = 0;
        let mut admin_vt: u128 = 0;
        let mut dispatch_coin: u64 = 0;

        for (index, ready) in chunk.iter().enumerate() {
            let reference = ready.tx.contribution_ref();
            input.script_interactions.push(ScriptInteraction {
                purpose: ScriptPurpose::Spend,
                hash: vault.script_hash.clone(),
                output_ref: Some(reference.clone()),
                redeemer: Redeemer::ExtractCoin {
                    vt_output_index: index as u32,
                },
            });

            let user_vt = ready.claim.vt_amount as u128;
            let vault_share = vault.coin_pair_multiplier as u128
                * ready.tx.coin_amount as u128
                * coin_scale;
            total_mint += user_vt + vault_share;
            admin_vt += vault_share;
            dispatch_coin = dispatch_coin
                .checked_add(ready.utxo.coin)
                .ok_or_else(Self::overflow)?;

            input.outputs.push(TxOutputSpec {
                address: ready.tx.owner_address.clone(),
                coin: None,
                assets: vec![AssetAmount {
                    policy_id: vault.vt_policy_id.clone(),
                    asset_name: vault.asset_vault_name.clone(),
                    quantity: ready.claim.vt_amount,
                }],
                datum: Some(Datum::OutputPayout {
                    datum_tag: fvp_chain::datum_tag(&reference.tx_hash, reference.output_index),
                    coin_paid: None,
                }),
            });

            // One receipt token burned per claim.
            input.mint.push(MintAsset {
                policy_id: vault.vt_policy_id.clone(),
                asset_name: ready.tx.tx_hash.clone(),
                name_format: AssetNameFormat::Hex,
                quantity: -1,
            });
        }

        if admin_vt > 0 {
            input.outputs.push(TxOutputSpec {
                address: vault.admin_address.clone(),
                coin: None,
                assets: vec![AssetAmount {
                    policy_id: vault.vt_policy_id.clone(),
                    asset_name: vault.asset_vault_name.clone(),
                    quantity: u64::try_from(admin_vt).map_err(|_| Self::overflow())?,
                }],
                datum: None,
            });
        }
        input.outputs.push(TxOutputSpec {
            address: dispatch_address.to_string(),
            coin: Some(dispatch_coin),
            assets: vec![],
            datum: None,
        });

        input.mint.push(MintAsset {
            policy_id: vault.vt_policy_id.clone(),
            asset_name: vault.asset_vault_name.clone(),
            name_format: AssetNameFormat::Hex,
            quantity: i64::try_from(total_mint).map_err(|_| Self::overflow())?,
        });
        input.script_interactions.push(ScriptInteraction {
            purpose: ScriptPurpose::Mint,
            hash: vault.vt_policy_id.clone(),
            output_ref: None,
            redeemer: Redeemer::MintVaultToken,
        });

        // The first extract also registers the dispatch stake credential.
        if !vault.stake_registered {
            input.deposits.push(ScriptDeposit {
                hash: dispatch_hash.to_string(),
                deposit_type: DepositType::StakeRegistration,
                deposit: self.config.stake_deposit,
            });
        }
        Ok(input)
    }

    async fn submit_chunk(
        &self,
        vault: &Vault,
        chunk: &[ReadyClaim],
    ) -> EngineResult<Option<Vault>> {
        let input = self.build_chunk_input(vault, chunk)?;
        let built = self.client.build(&input).await?;
        if built.size > self.config.tx_size_limit {
            return Err(EngineError::SizeOverflow {
                size: built.size,
                budget: self.config.tx_size_limit,
            });
        }

        let claims: Vec<Claim> = chunk.iter().map(|r| r.claim.clone()).collect();
        let record =
            open_settlement_record(&self.store, vault, TransactionType::ExtractDispatch, &claims)
                .await?;
        self.store
            .attach_transaction_hash(&record.id, &built.tx_hash)
            .await?;

        let submitted = match self.client.submit(&built.hex).await {
            Ok(submitted) => submitted,
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
            "📤 Extract submitted"
        );

        let confirmed = self
            .client
            .wait_confirmation(&submitted.tx_hash, self.config.confirmation_timeout_ms)
            .await?;
        if !confirmed {
            warn!(
                vault_id = %vault.id,
                tx_hash = %submitted.tx_hash,
                "extract confirmation timed out; next tick reconciles"
            );
            return Ok(None);
        }

        confirm_settlement(&self.store, vault, &record.id).await?;
        let mut updated = self.store.vault(&vault.id).await?;
        if !updated.stake_registered {
            updated.stake_registered = true;
            self.store.update_vault(&updated).await?;
        }
        info!(vault_id = %vault.id, claims = chunk.len(), "✅ Extract confirmed");
        Ok(Some(updated))
    }

    /// Settle every eligible acquirer claim of the current batch. Returns the
    /// refreshed vault; stops early (without error) when a confirmation is
    /// still pending.
    pub async fn run(&self, vault: &Vault) -> EngineResult<Vault> {
        let mut vault = vault.clone();

        if vault.dispatch_script_hash.is_none() {
            let script = self
                .client
                .apply_dispatch_parameters(&DispatchParameters {
                    vault_policy: vault.vt_policy_id.clone(),
                    vault_id: vault.id.clone(),
                    contribution_script_hash: vault.script_hash.clone(),
                })
                .await?;
            info!(vault_id = %vault.id, hash = %script.parameterized_hash, "dispatch script parameterized");
            vault.dispatch_script_hash = Some(script.parameterized_hash);
            vault.dispatch_address = Some(script.address);
            self.store.update_vault(&vault).await?;
        }

        reconcile_settlements(
            &self.client,
            &self.store,
            &vault,
            TransactionType::ExtractDispatch,
        )
        .await?;
        if !vault.stake_registered {
            let confirmed = self
                .store
                .transactions_for_vault(
                    &vault.id,
                    Some(TransactionType::ExtractDispatch),
                    Some(TransactionStatus::Confirmed),
                )
                .await?;
            if !confirmed.is_empty() {
                vault.stake_registered = true;
                self.store.update_vault(&vault).await?;
            }
        }

        let eligible = eligible_claims(&self.store, &vault, ClaimType::Acquirer).await?;
        if eligible.is_empty() {
            return Ok(vault);
        }

        // Resolve each claim's contribution UTXO up front; a provably
        // consumed input fails that claim and the rest continue.
        let script_utxos = self.client.utxos_at(&vault.script_address).await?;
        let by_ref: HashMap<UtxoRef, Utxo> = script_utxos
            .into_iter()
            .map(|u| (u.reference.clone(), u))
            .collect();
        let mut ready: Vec<ReadyClaim> = Vec::new();
        for claim in eligible {
            let tx = self.store.transaction(&claim.transaction_id).await?;
            let reference = tx.contribution_ref();
            match by_ref.get(&reference) {
                Some(utxo) => ready.push(ReadyClaim {
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
                            "acquire input consumed elsewhere; failing claim"
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

        // Greedy batching with halving on size overflow; a single claim that
        // persistently fails to build is marked failed.
        let mut queue = ready;
        while !queue.is_empty() {
            let mut take = queue.len().min(self.config.max_acquirer_batch);
            loop {
                match self.submit_chunk(&vault, &queue[..take]).await {
                    Ok(Some(updated)) => {
                        vault = updated;
                        queue.drain(..take);
                        break;
                    }
                    Ok(None) => return Ok(vault),
                    Err(EngineError::SizeOverflow { .. }) if take > 1 => {
                        take /= 2;
                    }
                    Err(EngineError::SizeOverflow { size, .. }) => {
                        self.store
                            .mark_claim_failed(
                                &queue[0].claim.id,
                                ClaimFailureReason::BuildFailed {
                                    detail: format!("single-claim extract oversize: {size} bytes"),
                                },
                            )
                            .await?;
                        queue.remove(0);
                        break;
                    }
                    Err(EngineError::BuildFailure(detail)) if take == 1 => {
                        self.store
                            .mark_claim_failed(
                                &queue[0].claim.id,
                                ClaimFailureReason::BuildFailed { detail },
                            )
                            .await?;
                        queue.remove(0);
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(vault)
    }
}
