use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fvp_chain::{BlockchainClient, MultiplierTuple, PriceOracle, UtxoRef};
use fvp_store::{
    Claim, ClaimStatus, ClaimType, Store, TransactionStatus, TransactionType, Vault, VaultStatus,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::calculator::{Calculator, ContributionInput, DistributionOutcome, PricedAsset};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::lp::LpBootstrap;
use crate::packer::{ClaimAssets, MultiplierPacker};
use crate::size_oracle::SizeOracle;
use crate::solver::BatchSolver;
use crate::stages::{ExtractStage, PayStage, UpdateStage};

/// Claim tallies and progress counters surfaced by the admin `status` call.
#[derive(Debug, Clone, Serialize)]
pub struct VaultStatusReport {
    pub vault_id: String,
    pub status: VaultStatus,
    pub current_batch: u32,
    pub total_batches: u32,
    pub pending_tuples: usize,
    pub on_chain_tuples: usize,
    pub claims_pending: usize,
    pub claims_claimed: usize,
    pub claims_failed: usize,
    pub manual_mode: bool,
    pub distribution_in_progress: bool,
    pub distribution_processed: bool,
    pub stuck: bool,
}

/// Drives the three-phase distribution state machine per vault on a periodic
/// tick: update, extract, pay, then finalization. One tick at a time
/// process-wide; one stage pipeline at a time per vault.
pub struct Orchestrator {
    client: Arc<dyn BlockchainClient>,
    oracle: Arc<dyn PriceOracle>,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    lp: Arc<dyn LpBootstrap>,
    config: EngineConfig,
    size_oracle: SizeOracle,
    update_stage: UpdateStage,
    extract_stage: ExtractStage,
    pay_stage: PayStage,
    tick_active: AtomicBool,
    vault_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        client: Arc<dyn BlockchainClient>,
        oracle: Arc<dyn PriceOracle>,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        lp: Arc<dyn LpBootstrap>,
        config: EngineConfig,
    ) -> Self {
        let size_oracle = SizeOracle::new(client.clone(), &config);
        let update_stage = UpdateStage::new(client.clone(), store.clone(), config.clone());
        let extract_stage = ExtractStage::new(client.clone(), store.clone(), config.clone());
        let pay_stage = PayStage::new(client.clone(), store.clone(), config.clone());
        Self {
            client,
            oracle,
            store,
            clock,
            lp,
            config,
            size_oracle,
            update_stage,
            extract_stage,
            pay_stage,
            tick_active: AtomicBool::new(false),
            vault_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Long-running driver: one tick per configured interval.
    pub async fn run(self: Arc<Self>) {
        info!(
            interval_secs = self.config.tick_interval_secs,
            "🚀 Distribution orchestrator started"
        );
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.tick_interval_secs));
        loop {
            interval.tick().await;
            if let Err(e) = self.tick().await {
                error!(error = %e, "distribution tick aborted");
            }
        }
    }

    /// One pass over all ready vaults. At most one tick runs at a time.
    pub async fn tick(&self) -> EngineResult<()> {
        if self
            .tick_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("previous tick still active; skipping");
            return Ok(());
        }
        let result = self.tick_inner().await;
        self.tick_active.store(false, Ordering::SeqCst);
        result
    }

    async fn tick_inner(&self) -> EngineResult<()> {
        let vaults = self.store.ready_vaults().await?;
        for vault in vaults {
            // Pre-flight read before any state mutation: a dead chain aborts
            // the whole tick.
            self.client.utxos_at(&vault.admin_address).await?;
            let lock = self.vault_lock(&vault.id).await;
            let _guard = lock.lock().await;
            match self.process_vault(&vault.id).await {
                Ok(()) => {}
                // A dead chain aborts the whole tick with no further state
                // mutations.
                Err(e @ EngineError::BlockchainUnavailable(_)) => return Err(e),
                // Local-to-the-vault conditions yield to the next tick.
                Err(EngineError::InsufficientUtxos {
                    address,
                    needed,
                    collected,
                }) => {
                    warn!(
                        vault_id = %vault.id,
                        %address,
                        needed,
                        collected,
                        "insufficient utxos; vault deferred to next tick"
                    );
                }
                Err(EngineError::SizeOverflow { size, budget }) => {
                    error!(
                        vault_id = %vault.id,
                        size,
                        budget,
                        "update cannot fit even one transaction group; manual intervention required"
                    );
                }
                Err(e) => {
                    error!(vault_id = %vault.id, error = %e, "vault processing failed");
                }
            }
        }
        Ok(())
    }

    async fn vault_lock(&self, vault_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.vault_locks.lock().await;
        locks
            .entry(vault_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn priced_assets(&self, transaction_id: &str) -> EngineResult<Vec<PricedAsset>> {
        let records = self.store.assets_for_transaction(transaction_id).await?;
        let mut priced = Vec::with_capacity(records.len());
        for record in records {
            let price = match record.floor_price.or(record.dex_price) {
                Some(price) => price,
                None => {
                    self.oracle
                        .price_of(&record.policy_id, &record.asset_id)
                        .await?
                        .effective()
                }
            };
            priced.push(PricedAsset { record, price });
        }
        Ok(priced)
    }

    async fn contribution_inputs(&self, vault_id: &str) -> EngineResult<Vec<ContributionInput>> {
        let transactions = self
            .store
            .transactions_for_vault(
                vault_id,
                Some(TransactionType::Contribute),
                Some(TransactionStatus::Confirmed),
            )
            .await?;
        let mut inputs = Vec::with_capacity(transactions.len());
        for transaction in transactions {
            let assets = self.priced_assets(&transaction.id).await?;
            inputs.push(ContributionInput { transaction, assets });
        }
        Ok(inputs)
    }

    /// Pack the not-yet-stamped claims into tuple entries, preserving claim
    /// creation order.
    async fn pack_unstamped(&self, vault: &Vault) -> EngineResult<crate::packer::Packing> {
        let claims = self.store.claims_for_vault(&vault.id).await?;
        let unstamped: Vec<&Claim> = claims
            .iter()
            .filter(|c| c.distribution_batch.is_none() && c.status == ClaimStatus::Pending)
            .collect();
        let mut contributor_claims = Vec::new();
        let mut acquirer_claims = Vec::new();
        let mut acquire_multiplier = 0;
        for claim in unstamped {
            match claim.claim_type {
                ClaimType::Contributor => {
                    let assets = self.priced_assets(&claim.transaction_id).await?;
                    contributor_claims.push(ClaimAssets {
                        claim: claim.clone(),
                        assets,
                    });
                }
                ClaimType::Acquirer => {
                    acquire_multiplier = claim.multiplier;
                    acquirer_claims.push(claim.clone());
                }
                ClaimType::Lp => {}
            }
        }
        let packer = MultiplierPacker::new(self.config.grouping_threshold);
        packer.pack(&contributor_claims, &acquirer_claims, acquire_multiplier)
    }

    /// Locked vault with its state output published and no distribution yet:
    /// compute entitlements, create claims, pack, and submit batch one.
    async fn start_distribution(&self, vault: &Vault) -> EngineResult<Vault> {
        let mut vault = vault.clone();
        let contributions = self.contribution_inputs(&vault.id).await?;
        let acquisitions = self
            .store
            .transactions_for_vault(
                &vault.id,
                Some(TransactionType::Acquire),
                Some(TransactionStatus::Confirmed),
            )
            .await?;

        let calculator = Calculator::new(self.config.coin_decimals);
        let plan = match calculator.compute(&vault, &contributions, &acquisitions)? {
            DistributionOutcome::BelowThreshold { required, acquired } => {
                warn!(
                    vault_id = %vault.id,
                    required,
                    acquired,
                    "reserve threshold not met; vault failed"
                );
                vault.status = VaultStatus::Failed;
                self.store.update_vault(&vault).await?;
                return Ok(vault);
            }
            DistributionOutcome::Plan(plan) => plan,
        };

        vault.status = VaultStatus::Successful;
        vault.distribution_in_progress = true;
        vault.distribution_started_at = Some(self.clock.now());
        vault.coin_pair_multiplier = plan.coin_pair_multiplier;
        self.store.update_vault(&vault).await?;

        let now = Utc::now();
        let claims: Vec<Claim> = plan
            .claims
            .iter()
            .map(|draft| Claim {
                id: fvp_store::new_id(),
                vault_id: vault.id.clone(),
                user_id: draft.user_id.clone(),
                transaction_id: draft.transaction_id.clone(),
                claim_type: draft.claim_type,
                vt_amount: draft.vt_amount,
                coin_amount: draft.coin_amount,
                multiplier: draft.multiplier,
                status: ClaimStatus::Pending,
                failure: None,
                distribution_batch: None,
                distribution_tx_id: None,
                created_at: now,
                updated_at: now,
            })
            .collect();
        self.store.insert_claims(&claims).await?;
        info!(
            vault_id = %vault.id,
            claims = claims.len(),
            acquire_multiplier = plan.acquire_multiplier,
            "distribution started"
        );

        let packing = self.pack_unstamped(&vault).await?;
        vault.pending_multipliers = packing.vt_tuples();
        vault.pending_coin_distribution = packing.coin_tuples();
        self.store.update_vault(&vault).await?;

        self.submit_next_batch(&vault).await
    }

    /// Publish the next pending batch, or finish a previous submission whose
    /// confirmation wait timed out. The solver's dry-run builds spend the
    /// state output, so when a timed-out update actually landed the solve
    /// must run against the landed output, not the consumed one.
    async fn submit_next_batch(&self, vault: &Vault) -> EngineResult<Vault> {
        let solver =
            BatchSolver::new(&self.size_oracle, self.config.multi_batch, self.config.network);

        if let Some(last) = &vault.last_update_tx_ref {
            if let Some(spender) = self.client.utxo_spent_by(last).await? {
                if !self.client.tx_confirmed(&spender).await? {
                    // Still in flight; check again next tick.
                    return Ok(vault.clone());
                }
                let mut probe = vault.clone();
                probe.last_update_tx_ref = Some(UtxoRef::new(spender.clone(), 0));
                let packing = self.pack_unstamped(&probe).await?;
                let batch_plan = solver.solve(&probe, &packing).await?;
                if batch_plan.is_empty() {
                    return Ok(vault.clone());
                }
                let batch_number = vault.current_batch + 1;
                let total_batches = vault.current_batch + batch_plan.total_batches();
                return self
                    .update_stage
                    .commit_recovered(
                        vault,
                        &batch_plan.batches[0],
                        batch_number,
                        total_batches,
                        UtxoRef::new(spender, 0),
                    )
                    .await;
            }
        }

        let packing = self.pack_unstamped(vault).await?;
        let batch_plan = solver.solve(vault, &packing).await?;
        if batch_plan.is_empty() {
            return Ok(vault.clone());
        }
        let batch_number = vault.current_batch + 1;
        let total_batches = vault.current_batch + batch_plan.total_batches();
        match self
            .update_stage
            .submit_batch(vault, &batch_plan.batches[0], batch_number, total_batches)
            .await?
        {
            Some(updated) => Ok(updated),
            None => Ok(self.store.vault(&vault.id).await?),
        }
    }

    fn batch_settled(claims: &[Claim], batch: u32) -> bool {
        claims
            .iter()
            .filter(|c| c.distribution_batch == Some(batch))
            .all(|c| matches!(c.status, ClaimStatus::Claimed | ClaimStatus::Failed))
    }

    /// All claims claimed and nothing pending: hand off LP creation and mark
    /// the distribution processed. Failed claims keep the vault open for
    /// manual recovery.
    async fn try_finalize(&self, vault: &Vault) -> EngineResult<Vault> {
        let mut vault = vault.clone();
        let claims = self.store.claims_for_vault(&vault.id).await?;
        let all_claimed = !claims.is_empty()
            && claims.iter().all(|c| c.status == ClaimStatus::Claimed);
        if !all_claimed
            || !vault.pending_multipliers.is_empty()
            || !vault.pending_coin_distribution.is_empty()
        {
            return Ok(vault);
        }

        // Recompute the plan for the LP handoff figures; inputs are the same
        // confirmed transactions the distribution started from.
        let contributions = self.contribution_inputs(&vault.id).await?;
        let acquisitions = self
            .store
            .transactions_for_vault(
                &vault.id,
                Some(TransactionType::Acquire),
                Some(TransactionStatus::Confirmed),
            )
            .await?;
        let calculator = Calculator::new(self.config.coin_decimals);
        if let DistributionOutcome::Plan(plan) =
            calculator.compute(&vault, &contributions, &acquisitions)?
        {
            self.lp
                .create_pool(
                    &vault.id,
                    plan.adjusted_lp_vt,
                    plan.lp_coin,
                    plan.coin_pair_multiplier,
                )
                .await?;
        }

        vault.distribution_processed = true;
        vault.distribution_in_progress = false;
        vault.status = VaultStatus::Finalized;
        self.store.update_vault(&vault).await?;
        info!(vault_id = %vault.id, "🏁 Vault finalized");
        Ok(vault)
    }

    async fn process_vault(&self, vault_id: &str) -> EngineResult<()> {
        let mut vault = self.store.vault(vault_id).await?;

        if let Some(started) = vault.distribution_started_at {
            if vault.distribution_in_progress
                && (self.clock.now() - started).num_seconds() > self.config.stuck_after_secs as i64
            {
                warn!(
                    vault_id = %vault.id,
                    started_at = %started,
                    "distribution in progress for over the stuck threshold; \
                     eligible for manual recovery"
                );
            }
        }

        // Manual mode bypasses automated progression entirely; only the
        // finalization bookkeeping still runs.
        if vault.manual_mode {
            self.try_finalize(&vault).await?;
            return Ok(());
        }

        if vault.status == VaultStatus::Locked
            && vault.last_update_tx_ref.is_some()
            && !vault.distribution_processed
            && !vault.distribution_in_progress
        {
            vault = self.start_distribution(&vault).await?;
            if vault.status == VaultStatus::Failed {
                return Ok(());
            }
        }

        if !vault.distribution_in_progress {
            return Ok(());
        }

        vault = self.extract_stage.run(&vault).await?;
        vault = self.pay_stage.run(&vault).await?;

        let claims = self.store.claims_for_vault(&vault.id).await?;
        let current_settled =
            vault.current_batch == 0 || Self::batch_settled(&claims, vault.current_batch);
        if current_settled {
            let has_unstamped = claims
                .iter()
                .any(|c| c.distribution_batch.is_none() && c.status == ClaimStatus::Pending);
            if has_unstamped {
                // Covers both the next batch of a multi-batch vault and a
                // first batch whose confirmation timed out last tick.
                vault = self.submit_next_batch(&vault).await?;
                vault = self.extract_stage.run(&vault).await?;
                vault = self.pay_stage.run(&vault).await?;
            } else if vault.current_batch > 0 {
                self.try_finalize(&vault).await?;
            }
        }
        Ok(())
    }

    // Admin surface.

    pub async fn enable_manual_mode(&self, vault_id: &str) -> EngineResult<()> {
        let mut vault = self.store.vault(vault_id).await?;
        vault.manual_mode = true;
        self.store.update_vault(&vault).await?;
        info!(vault_id, "manual mode enabled");
        Ok(())
    }

    /// Manual multiplier submission; `replace_existing` overwrites the
    /// on-chain arrays instead of appending.
    pub async fn submit_batch_manual(
        &self,
        vault_id: &str,
        multipliers: Vec<MultiplierTuple>,
        coin_distribution: Vec<MultiplierTuple>,
        replace_existing: bool,
    ) -> EngineResult<()> {
        let vault = self.store.vault(vault_id).await?;
        if !vault.manual_mode {
            return Err(EngineError::InputValidation(format!(
                "vault {vault_id} is not in manual mode"
            )));
        }
        let lock = self.vault_lock(vault_id).await;
        let _guard = lock.lock().await;
        self.update_stage
            .submit_manual(&vault, multipliers, coin_distribution, replace_existing)
            .await?;
        Ok(())
    }

    /// Re-drive settlement for a vault holding the named claims.
    pub async fn process_claims(&self, vault_id: &str, claim_ids: &[String]) -> EngineResult<()> {
        let vault = self.store.vault(vault_id).await?;
        for claim_id in claim_ids {
            let claim = self.store.claim(claim_id).await?;
            if claim.vault_id != vault_id {
                return Err(EngineError::InputValidation(format!(
                    "claim {claim_id} does not belong to vault {vault_id}"
                )));
            }
        }
        let lock = self.vault_lock(vault_id).await;
        let _guard = lock.lock().await;
        let vault = self.extract_stage.run(&vault).await?;
        self.pay_stage.run(&vault).await?;
        Ok(())
    }

    pub async fn status(&self, vault_id: &str) -> EngineResult<VaultStatusReport> {
        let vault = self.store.vault(vault_id).await?;
        let claims = self.store.claims_for_vault(vault_id).await?;
        let stuck = vault.distribution_in_progress
            && vault
                .distribution_started_at
                .map(|started| {
                    (self.clock.now() - started).num_seconds() > self.config.stuck_after_secs as i64
                })
                .unwrap_or(false);
        Ok(VaultStatusReport {
            vault_id: vault.id.clone(),
            status: vault.status,
            current_batch: vault.current_batch,
            total_batches: vault.total_batches,
            pending_tuples: vault.pending_multipliers.len(),
            on_chain_tuples: vault.on_chain_multipliers.len(),
            claims_pending: claims
                .iter()
                .filter(|c| matches!(c.status, ClaimStatus::Pending | ClaimStatus::Available))
                .count(),
            claims_claimed: claims
                .iter()
                .filter(|c| c.status == ClaimStatus::Claimed)
                .count(),
            claims_failed: claims
                .iter()
                .filter(|c| c.status == ClaimStatus::Failed)
                .count(),
            manual_mode: vault.manual_mode,
            distribution_in_progress: vault.distribution_in_progress,
            distribution_processed: vault.distribution_processed,
            stuck,
        })
    }
}
