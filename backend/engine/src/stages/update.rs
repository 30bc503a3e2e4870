use std::sync::Arc;

use fvp_chain::{
    BlockchainClient, Datum, MultiplierTuple, Network, TxInput, TxOutputSpec, UtxoRef,
    VaultStateDatum,
};
use fvp_store::{Store, UpdateBatchCommit, Vault};
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::solver::Batch;

/// Semantic build request for a vault-state update: spend the current
/// datum-bearing output (admin-authorized, no script) and re-emit it at
/// index 0 carrying this batch's multiplier tables.
pub fn build_update_input(
    vault: &Vault,
    vt_tuples: &[MultiplierTuple],
    coin_tuples: &[MultiplierTuple],
    coin_pair_multiplier: u64,
    network: Network,
) -> EngineResult<TxInput> {
    let last = vault.last_update_tx_ref.clone().ok_or_else(|| {
        EngineError::InputValidation(format!("vault {} has no state output to update", vault.id))
    })?;
    let mut input = TxInput::new(vault.admin_address.clone(), network);
    input.utxos.push(last);
    input.required_signers.push(vault.admin_address.clone());
    input.message = Some(format!("vault {} multiplier update", vault.id));
    input.outputs.push(TxOutputSpec {
        address: vault.admin_address.clone(),
        coin: None,
        assets: vec![],
        datum: Some(Datum::VaultState(VaultStateDatum {
            acquire_multipliers: vt_tuples.to_vec(),
            coin_distribution: coin_tuples.to_vec(),
            coin_pair_multiplier,
        })),
    });
    Ok(input)
}

/// Publishes one batch of multipliers on-chain and commits the side effects
/// atomically once the transaction confirms.
pub struct UpdateStage {
    client: Arc<dyn BlockchainClient>,
    store: Arc<dyn Store>,
    config: EngineConfig,
}

impl UpdateStage {
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

    async fn commit(
        &self,
        vault: &Vault,
        vt_tuples: Vec<MultiplierTuple>,
        coin_tuples: Vec<MultiplierTuple>,
        covered_claim_ids: Vec<String>,
        replace_existing: bool,
        batch_number: u32,
        total_batches: u32,
        new_update_ref: UtxoRef,
    ) -> EngineResult<Vault> {
        self.store
            .commit_update_batch(&UpdateBatchCommit {
                vault_id: vault.id.clone(),
                submitted_multipliers: vt_tuples,
                submitted_coin_distribution: coin_tuples,
                replace_existing,
                new_update_ref,
                batch_number,
                total_batches,
                covered_claim_ids,
            })
            .await?;
        Ok(self.store.vault(&vault.id).await?)
    }

    /// Book the side effects of an update that landed on-chain after its
    /// confirmation wait timed out. Only the engine ever spends the state
    /// output, so the confirmed spender is the engine's own update carrying
    /// exactly this batch.
    pub async fn commit_recovered(
        &self,
        vault: &Vault,
        batch: &Batch,
        batch_number: u32,
        total_batches: u32,
        new_update_ref: UtxoRef,
    ) -> EngineResult<Vault> {
        info!(
            vault_id = %vault.id,
            tx_hash = %new_update_ref.tx_hash,
            "recovered update confirmed after timeout"
        );
        self.commit(
            vault,
            batch.vt_tuples(),
            batch.coin_tuples(),
            batch.claim_ids(),
            false,
            batch_number,
            total_batches,
            new_update_ref,
        )
        .await
    }

    /// Submit the given batch. `Ok(None)` means the update is in flight
    /// (confirmation timed out); the next pass reconciles through
    /// `commit_recovered`.
    pub async fn submit_batch(
        &self,
        vault: &Vault,
        batch: &Batch,
        batch_number: u32,
        total_batches: u32,
    ) -> EngineResult<Option<Vault>> {
        let input = build_update_input(
            vault,
            &batch.vt_tuples(),
            &batch.coin_tuples(),
            vault.coin_pair_multiplier,
            self.config.network,
        )?;
        let built = self.client.build(&input).await?;
        let budget = self.config.update_size_budget();
        if built.size > budget {
            return Err(EngineError::SizeOverflow {
                size: built.size,
                budget,
            });
        }

        let submitted = self.client.submit(&built.hex).await?;
        info!(
            vault_id = %vault.id,
            batch_number,
            tuples = batch.entries.len(),
            tx_hash = %submitted.tx_hash,
            "📤 Vault state update submitted"
        );
        let confirmed = self
            .client
            .wait_confirmation(&submitted.tx_hash, self.config.confirmation_timeout_ms)
            .await?;
        if !confirmed {
            warn!(
                vault_id = %vault.id,
                tx_hash = %submitted.tx_hash,
                "update confirmation timed out; next tick will reconcile"
            );
            return Ok(None);
        }

        let updated = self
            .commit(
                vault,
                batch.vt_tuples(),
                batch.coin_tuples(),
                batch.claim_ids(),
                false,
                batch_number,
                total_batches,
                UtxoRef::new(submitted.tx_hash, 0),
            )
            .await?;
        info!(
            vault_id = %vault.id,
            batch = batch_number,
            of = total_batches,
            "✅ Update batch confirmed"
        );
        Ok(Some(updated))
    }

    /// Manual-mode submission: the caller supplies the exact tuple lists.
    /// With `replace_existing` the on-chain arrays are overwritten rather
    /// than appended; pending entries are untouched either way.
    pub async fn submit_manual(
        &self,
        vault: &Vault,
        vt_tuples: Vec<MultiplierTuple>,
        coin_tuples: Vec<MultiplierTuple>,
        replace_existing: bool,
    ) -> EngineResult<Option<Vault>> {
        let input = build_update_input(
            vault,
            &vt_tuples,
            &coin_tuples,
            vault.coin_pair_multiplier,
            self.config.network,
        )?;
        let built = self.client.build(&input).await?;
        let budget = self.config.update_size_budget();
        if built.size > budget {
            return Err(EngineError::SizeOverflow {
                size: built.size,
                budget,
            });
        }
        let submitted = self.client.submit(&built.hex).await?;
        let confirmed = self
            .client
            .wait_confirmation(&submitted.tx_hash, self.config.confirmation_timeout_ms)
            .await?;
        if !confirmed {
            warn!(vault_id = %vault.id, tx_hash = %submitted.tx_hash, "manual update not yet confirmed");
            return Ok(None);
        }
        let batch_number = vault.current_batch + 1;
        let updated = self
            .commit(
                vault,
                vt_tuples,
                coin_tuples,
                Vec::new(),
                replace_existing,
                batch_number,
                vault.total_batches.max(batch_number),
                UtxoRef::new(submitted.tx_hash, 0),
            )
            .await?;
        Ok(Some(updated))
    }
}
