pub mod extract;
pub mod pay;
pub mod update;

pub use extract::ExtractStage;
pub use pay::PayStage;
pub use update::UpdateStage;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use fvp_chain::BlockchainClient;
use fvp_store::{
    Claim, ClaimStatus, ClaimType, Store, TransactionRecord, TransactionStatus, TransactionType,
    Vault,
};
use tracing::{info, warn};

use crate::error::EngineResult;

/// Write-ahead row for one settlement transaction (extract or pay). The chain
/// hash is attached at build time, before submission, so a crash between
/// submit and persist cannot lose track of a transaction that landed.
pub(crate) async fn open_settlement_record(
    store: &Arc<dyn Store>,
    vault: &Vault,
    tx_type: TransactionType,
    claims: &[Claim],
) -> EngineResult<TransactionRecord> {
    let record = TransactionRecord {
        id: fvp_store::new_id(),
        vault_id: vault.id.clone(),
        user_id: String::new(),
        tx_hash: String::new(),
        output_index: 0,
        tx_type,
        status: TransactionStatus::Created,
        coin_amount: 0,
        owner_address: vault.admin_address.clone(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    store.insert_transaction(&record).await?;
    for claim in claims {
        store
            .assign_claim_distribution_tx(&claim.id, &record.id)
            .await?;
    }
    Ok(record)
}

/// Settle the bookkeeping for one confirmed settlement transaction.
pub(crate) async fn confirm_settlement(
    store: &Arc<dyn Store>,
    vault: &Vault,
    record_id: &str,
) -> EngineResult<()> {
    store
        .transition_transaction(record_id, TransactionStatus::Confirmed)
        .await?;
    let claims = store.claims_for_vault(&vault.id).await?;
    for claim in claims
        .iter()
        .filter(|c| c.distribution_tx_id.as_deref() == Some(record_id))
        .filter(|c| c.status == ClaimStatus::Pending || c.status == ClaimStatus::Available)
    {
        store.mark_claim_claimed(&claim.id, record_id).await?;
        if claim.claim_type == ClaimType::Contributor {
            store.mark_assets_distributed(&claim.transaction_id).await?;
        }
    }
    Ok(())
}

/// Re-read on-chain state for unfinished settlement records of one kind:
/// a confirmed hash settles its claims; a vanished transaction whose bound
/// contribution UTXOs are all unspent frees its claims for another attempt.
pub(crate) async fn reconcile_settlements(
    client: &Arc<dyn BlockchainClient>,
    store: &Arc<dyn Store>,
    vault: &Vault,
    tx_type: TransactionType,
) -> EngineResult<()> {
    let records = store
        .transactions_for_vault(&vault.id, Some(tx_type), None)
        .await?;
    let relevant: Vec<&TransactionRecord> = records
        .iter()
        .filter(|r| r.status != TransactionStatus::Failed)
        .collect();
    if relevant.is_empty() {
        return Ok(());
    }

    let claims = store.claims_for_vault(&vault.id).await?;
    for record in relevant {
        if record.status == TransactionStatus::Confirmed {
            // A crash between the record transition and the claim updates
            // leaves claims pending against a confirmed settlement; finish
            // the bookkeeping.
            let unsettled = claims.iter().any(|c| {
                c.distribution_tx_id.as_deref() == Some(record.id.as_str())
                    && matches!(c.status, ClaimStatus::Pending | ClaimStatus::Available)
            });
            if unsettled {
                confirm_settlement(store, vault, &record.id).await?;
            }
            continue;
        }
        if record.tx_hash.is_empty() {
            // Crashed before build returned; nothing can have landed.
            store
                .transition_transaction(&record.id, TransactionStatus::Failed)
                .await?;
            continue;
        }
        if client.tx_confirmed(&record.tx_hash).await? {
            info!(
                vault_id = %vault.id,
                tx_hash = %record.tx_hash,
                "settlement confirmed after an earlier timeout"
            );
            confirm_settlement(store, vault, &record.id).await?;
            continue;
        }

        let bound: Vec<&Claim> = claims
            .iter()
            .filter(|c| c.distribution_tx_id.as_deref() == Some(record.id.as_str()))
            .collect();
        let mut all_inputs_unspent = true;
        for claim in &bound {
            let tx = store.transaction(&claim.transaction_id).await?;
            if client
                .utxo_spent_by(&tx.contribution_ref())
                .await?
                .is_some()
            {
                all_inputs_unspent = false;
                break;
            }
        }
        if all_inputs_unspent {
            warn!(
                vault_id = %vault.id,
                tx_hash = %record.tx_hash,
                "settlement never landed; releasing its claims for retry"
            );
            store
                .transition_transaction(&record.id, TransactionStatus::Failed)
                .await?;
        }
        // Otherwise the transaction may still be in flight; leave it for the
        // next tick.
    }
    Ok(())
}

/// Claims of one type ready for settlement in the vault's current batch:
/// pending, stamped with this batch, and not bound to a live write-ahead
/// record.
pub(crate) async fn eligible_claims(
    store: &Arc<dyn Store>,
    vault: &Vault,
    claim_type: ClaimType,
) -> EngineResult<Vec<Claim>> {
    let claims = store.claims_for_vault(&vault.id).await?;
    let mut records: HashMap<String, TransactionStatus> = HashMap::new();
    for claim in &claims {
        if let Some(record_id) = &claim.distribution_tx_id {
            if !records.contains_key(record_id) {
                let record = store.transaction(record_id).await?;
                records.insert(record_id.clone(), record.status);
            }
        }
    }
    Ok(claims
        .into_iter()
        .filter(|c| c.claim_type == claim_type)
        .filter(|c| c.status == ClaimStatus::Pending)
        .filter(|c| c.distribution_batch == Some(vault.current_batch))
        .filter(|c| match &c.distribution_tx_id {
            None => true,
            Some(record_id) => records.get(record_id) == Some(&TransactionStatus::Failed),
        })
        .collect())
}
