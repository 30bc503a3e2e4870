use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::model::{
    AssetRecord, Claim, ClaimFailureReason, ClaimStatus, TransactionRecord, TransactionStatus,
    TransactionType, Vault, VaultStatus,
};
use crate::store::{Store, StoreError, StoreResult, UpdateBatchCommit};

#[derive(Default)]
struct Inner {
    vaults: HashMap<String, Vault>,
    transactions: HashMap<String, TransactionRecord>,
    assets: HashMap<String, AssetRecord>,
    claims: HashMap<String, Claim>,
}

/// In-memory store for tests and single-process deployments. All writes take
/// the single lock, which makes `commit_update_batch` atomic by construction.
#[derive(Default)]
pub struct MemStore {
    inner: RwLock<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn claim_transition(claim: &mut Claim, next: ClaimStatus) -> StoreResult<()> {
    if !claim.status.can_transition_to(next) {
        return Err(StoreError::InvalidTransition {
            entity: "claim",
            id: claim.id.clone(),
            detail: format!("{:?} -> {:?}", claim.status, next),
        });
    }
    claim.status = next;
    claim.updated_at = Utc::now();
    Ok(())
}

#[async_trait]
impl Store for MemStore {
    async fn insert_vault(&self, vault: &Vault) -> StoreResult<()> {
        self.inner
            .write()
            .await
            .vaults
            .insert(vault.id.clone(), vault.clone());
        Ok(())
    }

    async fn vault(&self, id: &str) -> StoreResult<Vault> {
        self.inner
            .read()
            .await
            .vaults
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                entity: "vault",
                id: id.to_string(),
            })
    }

    async fn update_vault(&self, vault: &Vault) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if !inner.vaults.contains_key(&vault.id) {
            return Err(StoreError::NotFound {
                entity: "vault",
                id: vault.id.clone(),
            });
        }
        inner.vaults.insert(vault.id.clone(), vault.clone());
        Ok(())
    }

    async fn ready_vaults(&self) -> StoreResult<Vec<Vault>> {
        let inner = self.inner.read().await;
        let mut vaults: Vec<Vault> = inner
            .vaults
            .values()
            .filter(|v| {
                matches!(v.status, VaultStatus::Locked | VaultStatus::Successful)
                    && v.last_update_tx_ref.is_some()
                    && !v.distribution_processed
            })
            .cloned()
            .collect();
        vaults.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(vaults)
    }

    async fn commit_update_batch(&self, commit: &UpdateBatchCommit) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let vault = inner
            .vaults
            .get_mut(&commit.vault_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "vault",
                id: commit.vault_id.clone(),
            })?;

        if commit.replace_existing {
            vault.on_chain_multipliers = commit.submitted_multipliers.clone();
            vault.on_chain_coin_distribution = commit.submitted_coin_distribution.clone();
        } else {
            vault
                .on_chain_multipliers
                .extend(commit.submitted_multipliers.iter().cloned());
            vault
                .on_chain_coin_distribution
                .extend(commit.submitted_coin_distribution.iter().cloned());
            crate::store::trim_pending(
                &mut vault.pending_multipliers,
                &commit.submitted_multipliers,
            );
            crate::store::trim_pending(
                &mut vault.pending_coin_distribution,
                &commit.submitted_coin_distribution,
            );
        }
        vault.last_update_tx_ref = Some(commit.new_update_ref.clone());
        vault.current_batch = commit.batch_number;
        vault.total_batches = commit.total_batches.max(commit.batch_number);

        for claim_id in &commit.covered_claim_ids {
            if let Some(claim) = inner.claims.get_mut(claim_id) {
                if claim.distribution_batch.is_none() {
                    claim.distribution_batch = Some(commit.batch_number);
                    claim.updated_at = Utc::now();
                }
            }
        }
        Ok(())
    }

    async fn insert_transaction(&self, tx: &TransactionRecord) -> StoreResult<()> {
        self.inner
            .write()
            .await
            .transactions
            .insert(tx.id.clone(), tx.clone());
        Ok(())
    }

    async fn transaction(&self, id: &str) -> StoreResult<TransactionRecord> {
        self.inner
            .read()
            .await
            .transactions
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                entity: "transaction",
                id: id.to_string(),
            })
    }

    async fn transactions_for_vault(
        &self,
        vault_id: &str,
        tx_type: Option<TransactionType>,
        status: Option<TransactionStatus>,
    ) -> StoreResult<Vec<TransactionRecord>> {
        let inner = self.inner.read().await;
        let mut txs: Vec<TransactionRecord> = inner
            .transactions
            .values()
            .filter(|t| t.vault_id == vault_id)
            .filter(|t| tx_type.map_or(true, |ty| t.tx_type == ty))
            .filter(|t| status.map_or(true, |st| t.status == st))
            .cloned()
            .collect();
        txs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(txs)
    }

    async fn transition_transaction(&self, id: &str, status: TransactionStatus) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let tx = inner
            .transactions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "transaction",
                id: id.to_string(),
            })?;
        tx.status = status;
        tx.updated_at = Utc::now();
        Ok(())
    }

    async fn attach_transaction_hash(&self, id: &str, tx_hash: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let tx = inner
            .transactions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "transaction",
                id: id.to_string(),
            })?;
        tx.tx_hash = tx_hash.to_string();
        tx.updated_at = Utc::now();
        Ok(())
    }

    async fn insert_asset(&self, asset: &AssetRecord) -> StoreResult<()> {
        self.inner
            .write()
            .await
            .assets
            .insert(asset.id.clone(), asset.clone());
        Ok(())
    }

    async fn assets_for_transaction(&self, transaction_id: &str) -> StoreResult<Vec<AssetRecord>> {
        let inner = self.inner.read().await;
        let mut assets: Vec<AssetRecord> = inner
            .assets
            .values()
            .filter(|a| a.transaction_id == transaction_id)
            .cloned()
            .collect();
        assets.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(assets)
    }

    async fn mark_assets_distributed(&self, transaction_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        for asset in inner.assets.values_mut() {
            if asset.transaction_id == transaction_id {
                asset.distributed = true;
            }
        }
        Ok(())
    }

    async fn insert_claims(&self, claims: &[Claim]) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        for claim in claims {
            inner.claims.insert(claim.id.clone(), claim.clone());
        }
        Ok(())
    }

    async fn claim(&self, id: &str) -> StoreResult<Claim> {
        self.inner
            .read()
            .await
            .claims
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                entity: "claim",
                id: id.to_string(),
            })
    }

    async fn claims_for_vault(&self, vault_id: &str) -> StoreResult<Vec<Claim>> {
        let inner = self.inner.read().await;
        let mut claims: Vec<Claim> = inner
            .claims
            .values()
            .filter(|c| c.vault_id == vault_id)
            .cloned()
            .collect();
        claims.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(claims)
    }

    async fn pending_claims_by_user(
        &self,
        vault_id: &str,
    ) -> StoreResult<BTreeMap<String, Vec<Claim>>> {
        let claims = self.claims_for_vault(vault_id).await?;
        let mut grouped: BTreeMap<String, Vec<Claim>> = BTreeMap::new();
        for claim in claims
            .into_iter()
            .filter(|c| c.status == ClaimStatus::Pending)
        {
            grouped.entry(claim.user_id.clone()).or_default().push(claim);
        }
        Ok(grouped)
    }

    async fn mark_claim_claimed(&self, id: &str, distribution_tx_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let claim = inner
            .claims
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "claim",
                id: id.to_string(),
            })?;
        claim_transition(claim, ClaimStatus::Claimed)?;
        claim.distribution_tx_id = Some(distribution_tx_id.to_string());
        Ok(())
    }

    async fn mark_claim_failed(&self, id: &str, reason: ClaimFailureReason) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let claim = inner
            .claims
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "claim",
                id: id.to_string(),
            })?;
        claim_transition(claim, ClaimStatus::Failed)?;
        claim.failure = Some(reason);
        Ok(())
    }

    async fn assign_claim_distribution_tx(
        &self,
        claim_id: &str,
        distribution_tx_id: &str,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let claim = inner
            .claims
            .get_mut(claim_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "claim",
                id: claim_id.to_string(),
            })?;
        claim.distribution_tx_id = Some(distribution_tx_id.to_string());
        claim.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{new_id, ClaimType};
    use fvp_chain::UtxoRef;

    fn sample_vault() -> Vault {
        Vault {
            id: "vault-1".into(),
            script_hash: "scripthash".into(),
            script_address: "addr_vault".into(),
            asset_vault_name: "766c74".into(),
            vt_policy_id: "vtpolicy".into(),
            dispatch_script_hash: None,
            dispatch_address: None,
            admin_address: "addr_admin".into(),
            vt_token_supply: 1_000_000,
            vt_decimals: 6,
            tokens_for_acquirers_pct: 99,
            lp_pct: 4,
            acquire_reserve_pct: 0,
            status: VaultStatus::Locked,
            last_update_tx_ref: Some(UtxoRef::new("genesis", 0)),
            stake_registered: false,
            on_chain_multipliers: vec![],
            pending_multipliers: vec![fvp_chain::MultiplierTuple::exact("aa", "01", 7)],
            on_chain_coin_distribution: vec![],
            pending_coin_distribution: vec![fvp_chain::MultiplierTuple::exact("aa", "01", 3)],
            coin_pair_multiplier: 0,
            current_batch: 0,
            total_batches: 1,
            manual_mode: false,
            distribution_in_progress: false,
            distribution_processed: false,
            distribution_started_at: None,
        }
    }

    fn sample_claim(id: &str, vault_id: &str) -> Claim {
        Claim {
            id: id.into(),
            vault_id: vault_id.into(),
            user_id: "user-1".into(),
            transaction_id: new_id(),
            claim_type: ClaimType::Contributor,
            vt_amount: 10,
            coin_amount: 0,
            multiplier: 0,
            status: ClaimStatus::Pending,
            failure: None,
            distribution_batch: None,
            distribution_tx_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_ready_vaults_filter() {
        let store = MemStore::new();
        let mut ready = sample_vault();
        store.insert_vault(&ready).await.unwrap();

        ready.id = "vault-2".into();
        ready.distribution_processed = true;
        store.insert_vault(&ready).await.unwrap();

        ready.id = "vault-3".into();
        ready.distribution_processed = false;
        ready.last_update_tx_ref = None;
        store.insert_vault(&ready).await.unwrap();

        let found = store.ready_vaults().await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "vault-1");
    }

    #[tokio::test]
    async fn test_commit_update_batch_moves_tuples_and_stamps_claims() {
        let store = MemStore::new();
        let vault = sample_vault();
        store.insert_vault(&vault).await.unwrap();
        store
            .insert_claims(&[sample_claim("claim-1", &vault.id)])
            .await
            .unwrap();

        store
            .commit_update_batch(&UpdateBatchCommit {
                vault_id: vault.id.clone(),
                submitted_multipliers: vault.pending_multipliers.clone(),
                submitted_coin_distribution: vault.pending_coin_distribution.clone(),
                replace_existing: false,
                new_update_ref: UtxoRef::new("update1", 0),
                batch_number: 1,
                total_batches: 1,
                covered_claim_ids: vec!["claim-1".into()],
            })
            .await
            .unwrap();

        let stored = store.vault(&vault.id).await.unwrap();
        assert_eq!(stored.on_chain_multipliers.len(), 1);
        assert!(stored.pending_multipliers.is_empty());
        assert_eq!(stored.current_batch, 1);
        assert_eq!(stored.last_update_tx_ref, Some(UtxoRef::new("update1", 0)));
        let claim = store.claim("claim-1").await.unwrap();
        assert_eq!(claim.distribution_batch, Some(1));
    }

    #[tokio::test]
    async fn test_pending_claims_grouped_by_user() {
        let store = MemStore::new();
        let mut c1 = sample_claim("claim-1", "vault-1");
        let mut c2 = sample_claim("claim-2", "vault-1");
        c2.user_id = "user-2".into();
        let mut c3 = sample_claim("claim-3", "vault-1");
        c3.user_id = "user-2".into();
        c1.user_id = "user-1".into();
        store.insert_claims(&[c1, c2, c3]).await.unwrap();
        store.mark_claim_claimed("claim-3", "tx9").await.unwrap();

        let grouped = store.pending_claims_by_user("vault-1").await.unwrap();
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped["user-1"].len(), 1);
        assert_eq!(grouped["user-2"].len(), 1);
        assert_eq!(grouped["user-2"][0].id, "claim-2");
    }

    #[tokio::test]
    async fn test_attach_transaction_hash() {
        let store = MemStore::new();
        store
            .insert_transaction(&TransactionRecord {
                id: "wa-1".into(),
                vault_id: "vault-1".into(),
                user_id: String::new(),
                tx_hash: String::new(),
                output_index: 0,
                tx_type: TransactionType::ExtractDispatch,
                status: TransactionStatus::Created,
                coin_amount: 0,
                owner_address: "addr_admin".into(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        store.attach_transaction_hash("wa-1", "deadbeef").await.unwrap();
        assert_eq!(store.transaction("wa-1").await.unwrap().tx_hash, "deadbeef");
    }

    #[tokio::test]
    async fn test_claim_status_is_monotonic() {
        let store = MemStore::new();
        store
            .insert_claims(&[sample_claim("claim-1", "vault-1")])
            .await
            .unwrap();
        store.mark_claim_claimed("claim-1", "tx1").await.unwrap();
        let err = store
            .mark_claim_failed(
                "claim-1",
                ClaimFailureReason::BuildFailed {
                    detail: "late".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }
}
