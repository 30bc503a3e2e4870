//! Shared end-to-end harness: mock chain, in-memory store, manual clock.

use std::sync::Arc;

use chrono::Utc;
use fvp_chain::testing::{MockChain, SubmittedTx};
use fvp_chain::{AssetAmount, Datum, Network, StaticPriceOracle};
use fvp_engine::{EngineConfig, LoggingLpBootstrap, ManualClock, Orchestrator};
use fvp_store::{
    AssetOriginType, AssetRecord, Claim, MemStore, Store, TransactionRecord, TransactionStatus,
    TransactionType, Vault, VaultStatus,
};

pub const ADMIN: &str = "addr_admin";
pub const VAULT_ADDR: &str = "addr_vault_script";
pub const VT_POLICY: &str = "vtpolicy";
pub const VT_NAME: &str = "767431";

pub struct Harness {
    pub chain: Arc<MockChain>,
    pub store: Arc<MemStore>,
    pub clock: Arc<ManualClock>,
    pub orchestrator: Arc<Orchestrator>,
}

pub fn engine_config() -> EngineConfig {
    EngineConfig {
        tick_interval_secs: 1,
        confirmation_timeout_ms: 50,
        network: Network::Preprod,
        ..EngineConfig::default()
    }
}

pub async fn harness() -> Harness {
    let config = engine_config();
    let chain = Arc::new(MockChain::new());
    let store = Arc::new(MemStore::new());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let orchestrator = Arc::new(Orchestrator::new(
        chain.clone(),
        Arc::new(StaticPriceOracle::new()),
        store.clone(),
        clock.clone(),
        Arc::new(LoggingLpBootstrap),
        config,
    ));
    Harness {
        chain,
        store,
        clock,
        orchestrator,
    }
}

pub struct VaultSpec {
    pub vt_supply: u64,
    pub acquirers_pct: u32,
    pub lp_pct: u32,
    pub reserve_pct: u32,
}

pub async fn setup_vault(h: &Harness, spec: VaultSpec) -> Vault {
    let state_ref = h.chain.fund_as("vaultstate", 0, ADMIN, 2_000_000, vec![]).await;
    let vault = Vault {
        id: "vault-1".into(),
        script_hash: "vaultscripthash".into(),
        script_address: VAULT_ADDR.into(),
        asset_vault_name: VT_NAME.into(),
        vt_policy_id: VT_POLICY.into(),
        dispatch_script_hash: None,
        dispatch_address: None,
        admin_address: ADMIN.into(),
        vt_token_supply: spec.vt_supply,
        vt_decimals: 6,
        tokens_for_acquirers_pct: spec.acquirers_pct,
        lp_pct: spec.lp_pct,
        acquire_reserve_pct: spec.reserve_pct,
        status: VaultStatus::Locked,
        last_update_tx_ref: Some(state_ref),
        stake_registered: false,
        on_chain_multipliers: vec![],
        pending_multipliers: vec![],
        on_chain_coin_distribution: vec![],
        pending_coin_distribution: vec![],
        coin_pair_multiplier: 0,
        current_batch: 0,
        total_batches: 0,
        manual_mode: false,
        distribution_in_progress: false,
        distribution_processed: false,
        distribution_started_at: None,
    };
    h.store.insert_vault(&vault).await.unwrap();
    vault
}

/// Lock one contribution at the vault script: the listed assets plus the
/// receipt token, and a store row per asset.
pub async fn add_contribution(
    h: &Harness,
    vault: &Vault,
    user: &str,
    n: u32,
    assets: &[(&str, &str, u64, u64)],
) -> String {
    let tx_hash = format!("contrib{n:03}");
    let mut locked: Vec<AssetAmount> = assets
        .iter()
        .map(|(policy, name, quantity, _)| AssetAmount {
            policy_id: policy.to_string(),
            asset_name: name.to_string(),
            quantity: *quantity,
        })
        .collect();
    locked.push(AssetAmount {
        policy_id: VT_POLICY.into(),
        asset_name: tx_hash.clone(),
        quantity: 1,
    });
    h.chain
        .fund_as(&tx_hash, 0, VAULT_ADDR, 2_000_000, locked)
        .await;

    let record = TransactionRecord {
        id: format!("tx-{tx_hash}"),
        vault_id: vault.id.clone(),
        user_id: user.into(),
        tx_hash: tx_hash.clone(),
        output_index: 0,
        tx_type: TransactionType::Contribute,
        status: TransactionStatus::Confirmed,
        coin_amount: 0,
        owner_address: format!("addr_{user}"),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    h.store.insert_transaction(&record).await.unwrap();
    for (i, (policy, name, quantity, price)) in assets.iter().enumerate() {
        h.store
            .insert_asset(&AssetRecord {
                id: format!("{}-{i:04}", record.id),
                transaction_id: record.id.clone(),
                policy_id: policy.to_string(),
                asset_id: name.to_string(),
                quantity: *quantity,
                floor_price: Some(*price),
                dex_price: None,
                origin_type: AssetOriginType::Contributed,
                distributed: false,
            })
            .await
            .unwrap();
    }
    record.id
}

/// Lock one acquisition at the vault script: the sent coin plus the receipt
/// token.
pub async fn add_acquisition(
    h: &Harness,
    vault: &Vault,
    user: &str,
    n: u32,
    coin_whole: u64,
) -> String {
    let tx_hash = format!("acq{n:03}");
    h.chain
        .fund_as(
            &tx_hash,
            0,
            VAULT_ADDR,
            coin_whole * 1_000_000,
            vec![AssetAmount {
                policy_id: VT_POLICY.into(),
                asset_name: tx_hash.clone(),
                quantity: 1,
            }],
        )
        .await;

    let record = TransactionRecord {
        id: format!("tx-{tx_hash}"),
        vault_id: vault.id.clone(),
        user_id: user.into(),
        tx_hash,
        output_index: 0,
        tx_type: TransactionType::Acquire,
        status: TransactionStatus::Confirmed,
        coin_amount: coin_whole,
        owner_address: format!("addr_{user}"),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    h.store.insert_transaction(&record).await.unwrap();
    record.id
}

pub async fn claims(h: &Harness, vault_id: &str) -> Vec<Claim> {
    h.store.claims_for_vault(vault_id).await.unwrap()
}

pub async fn vault(h: &Harness, vault_id: &str) -> Vault {
    h.store.vault(vault_id).await.unwrap()
}

/// Submitted transactions carrying a vault-state datum, in submission order.
pub async fn update_txs(h: &Harness) -> Vec<SubmittedTx> {
    h.chain
        .submitted()
        .await
        .into_iter()
        .filter(|tx| {
            tx.input
                .outputs
                .iter()
                .any(|o| matches!(o.datum, Some(Datum::VaultState(_))))
        })
        .collect()
}

/// Total VT minted (net of burns) across all submitted transactions.
pub async fn total_vt_minted(h: &Harness) -> i128 {
    h.chain
        .submitted()
        .await
        .iter()
        .flat_map(|tx| tx.input.mint.iter())
        .filter(|m| m.policy_id == VT_POLICY && m.asset_name == VT_NAME)
        .map(|m| m.quantity as i128)
        .sum()
}
