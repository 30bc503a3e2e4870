//! End-to-end distribution scenarios over the mock chain and in-memory
//! store.

mod common;

use common::*;
use fvp_chain::{Datum, UtxoRef, VaultStateDatum};
use fvp_store::{ClaimFailureReason, ClaimStatus, ClaimType, Store, VaultStatus};

fn state_datums(txs: &[fvp_chain::testing::SubmittedTx]) -> Vec<VaultStateDatum> {
    txs.iter()
        .flat_map(|tx| tx.input.outputs.iter())
        .filter_map(|o| match &o.datum {
            Some(Datum::VaultState(state)) => Some(state.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_single_acquirer_single_contributor() {
    let h = harness().await;
    let v = setup_vault(
        &h,
        VaultSpec {
            vt_supply: 1_000_000,
            acquirers_pct: 99,
            lp_pct: 4,
            reserve_pct: 0,
        },
    )
    .await;
    add_contribution(&h, &v, "alice", 1, &[("aa", "01", 1, 1_000)]).await;
    add_acquisition(&h, &v, "bob", 1, 1_000).await;

    h.orchestrator.tick().await.unwrap();

    let v = vault(&h, "vault-1").await;
    assert_eq!(v.status, VaultStatus::Finalized);
    assert!(v.distribution_processed);
    assert!(!v.distribution_in_progress);
    assert!(v.pending_multipliers.is_empty());
    assert_eq!(v.current_batch, 1);
    assert_eq!(v.total_batches, 1);
    assert_eq!(v.coin_pair_multiplier, 20);
    assert!(v.stake_registered);

    let all = claims(&h, "vault-1").await;
    assert_eq!(all.len(), 2);
    let acquirer = all
        .iter()
        .find(|c| c.claim_type == ClaimType::Acquirer)
        .unwrap();
    assert_eq!(acquirer.multiplier, 970);
    assert_eq!(acquirer.vt_amount, 970_000_000_000);
    assert_eq!(acquirer.status, ClaimStatus::Claimed);
    let contributor = all
        .iter()
        .find(|c| c.claim_type == ClaimType::Contributor)
        .unwrap();
    assert_eq!(contributor.vt_amount, 9_800_000_000);
    assert_eq!(contributor.coin_amount, 980_000_000);
    assert_eq!(contributor.status, ClaimStatus::Claimed);

    // One update, one extract, one pay.
    let submitted = h.chain.submitted().await;
    assert_eq!(submitted.len(), 3);
    let updates = update_txs(&h).await;
    assert_eq!(updates.len(), 1);
    let state = &state_datums(&updates)[0];
    assert_eq!(state.acquire_multipliers.len(), 2);
    assert!(state.acquire_multipliers[0].is_acquirer_slot());
    assert_eq!(state.acquire_multipliers[0].value, 970);
    assert_eq!(state.coin_distribution.len(), 1);
    assert_eq!(state.coin_pair_multiplier, 20);

    // The pay transaction carries the contributor's coin and the datum tag,
    // and returns dispatch change.
    let pay = submitted.last().unwrap();
    let user_output = pay
        .input
        .outputs
        .iter()
        .find(|o| o.address == "addr_alice")
        .unwrap();
    assert_eq!(user_output.coin, Some(980_000_000));
    match &user_output.datum {
        Some(Datum::OutputPayout { coin_paid, .. }) => {
            assert_eq!(*coin_paid, Some(980_000_000));
        }
        other => panic!("expected payout datum, got {other:?}"),
    }
    let dispatch_change = pay
        .input
        .outputs
        .iter()
        .find(|o| o.address.starts_with("addr_script_"))
        .unwrap();
    assert_eq!(dispatch_change.coin, Some(20_000_000));
    let vault_return = pay
        .input
        .outputs
        .iter()
        .find(|o| o.address == VAULT_ADDR)
        .unwrap();
    assert_eq!(vault_return.assets.len(), 1);
    assert_eq!(vault_return.assets[0].policy_id, "aa");

    // VT conservation: everything minted stays under the scaled supply.
    let minted = total_vt_minted(&h).await;
    assert!(minted > 0);
    assert!(minted as u128 <= 1_000_000_000_000);
}

#[tokio::test]
async fn test_grouping_by_single_price() {
    let h = harness().await;
    let v = setup_vault(
        &h,
        VaultSpec {
            vt_supply: 1_000_000,
            acquirers_pct: 99,
            lp_pct: 4,
            reserve_pct: 0,
        },
    )
    .await;
    let assets: Vec<(String, String)> = (0..200).map(|i| ("aa".to_string(), format!("{i:03x}"))).collect();
    let asset_refs: Vec<(&str, &str, u64, u64)> = assets
        .iter()
        .map(|(policy, name)| (policy.as_str(), name.as_str(), 1u64, 5u64))
        .collect();
    add_contribution(&h, &v, "alice", 1, &asset_refs).await;
    add_acquisition(&h, &v, "bob", 1, 1_000).await;

    h.orchestrator.tick().await.unwrap();

    let v = vault(&h, "vault-1").await;
    assert_eq!(v.status, VaultStatus::Finalized);
    assert_eq!(v.total_batches, 1);

    // The packer collapses the single-priced policy to one policy-wide tuple.
    let updates = update_txs(&h).await;
    assert_eq!(updates.len(), 1);
    let state = &state_datums(&updates)[0];
    assert_eq!(state.acquire_multipliers.len(), 2);
    let policy_tuple = state
        .acquire_multipliers
        .iter()
        .find(|t| t.policy_id == "aa")
        .unwrap();
    assert_eq!(policy_tuple.asset_name, None);
    assert_eq!(policy_tuple.value, 49_000_000);
    assert_eq!(state.coin_distribution.len(), 1);
    assert_eq!(state.coin_distribution[0].value, 4_900_000);
}

#[tokio::test]
async fn test_mixed_prices_split_into_batches() {
    let h = harness().await;
    let v = setup_vault(
        &h,
        VaultSpec {
            vt_supply: 1_000_000,
            acquirers_pct: 99,
            lp_pct: 4,
            reserve_pct: 0,
        },
    )
    .await;
    // 20 contribution transactions of 10 NFTs each, prices alternating 5/10,
    // so no policy grouping applies and 200 exact tuples are emitted.
    for n in 0..20u32 {
        let assets: Vec<(String, String, u64, u64)> = (0..10)
            .map(|i| {
                (
                    "aa".to_string(),
                    format!("{n:02}{i:02x}"),
                    1u64,
                    if i % 2 == 0 { 5 } else { 10 },
                )
            })
            .collect();
        let asset_refs: Vec<(&str, &str, u64, u64)> = assets
            .iter()
            .map(|(p, a, q, pr)| (p.as_str(), a.as_str(), *q, *pr))
            .collect();
        add_contribution(&h, &v, "alice", n + 1, &asset_refs).await;
    }
    add_acquisition(&h, &v, "bob", 1, 400).await;
    add_acquisition(&h, &v, "carol", 2, 300).await;
    add_acquisition(&h, &v, "dave", 3, 300).await;

    h.orchestrator.tick().await.unwrap();
    h.orchestrator.tick().await.unwrap();

    let v = vault(&h, "vault-1").await;
    assert_eq!(v.status, VaultStatus::Finalized);
    assert!(v.total_batches >= 2);
    assert_eq!(v.current_batch, v.total_batches);

    let all = claims(&h, "vault-1").await;
    assert!(all.iter().all(|c| c.status == ClaimStatus::Claimed));

    // Acquirer uniformity: one shared multiplier.
    let multipliers: Vec<u64> = all
        .iter()
        .filter(|c| c.claim_type == ClaimType::Acquirer)
        .map(|c| c.multiplier)
        .collect();
    assert_eq!(multipliers.len(), 3);
    assert!(multipliers.windows(2).all(|w| w[0] == w[1]));

    // Every submitted transaction respects the ceiling; updates respect the
    // 85% headroom budget.
    let submitted = h.chain.submitted().await;
    assert!(submitted.iter().all(|tx| tx.size <= 16_384));
    let updates = update_txs(&h).await;
    assert!(updates.len() >= 2);
    assert!(updates.iter().all(|tx| tx.size <= 13_926));

    // Transaction-group atomicity: each contribution's asset tuples live in
    // exactly one update datum.
    let datums = state_datums(&updates);
    for n in 0..20u32 {
        let covered: Vec<usize> = datums
            .iter()
            .enumerate()
            .filter(|(_, d)| {
                d.acquire_multipliers
                    .iter()
                    .any(|t| t.asset_name.as_deref().is_some_and(|a| a.starts_with(&format!("{n:02}"))))
            })
            .map(|(i, _)| i)
            .collect();
        assert_eq!(covered.len(), 1, "contribution {n} spread across batches {covered:?}");
    }

    // Partition correctness: a claim stamped with batch b has its tuples in
    // the b-th update datum.
    for claim in all.iter().filter(|c| c.claim_type == ClaimType::Contributor) {
        let batch = claim.distribution_batch.unwrap() as usize;
        let tx = h.store.transaction(&claim.transaction_id).await.unwrap();
        let assets = h.store.assets_for_transaction(&tx.id).await.unwrap();
        let datum = &datums[batch - 1];
        for asset in assets {
            assert!(
                datum
                    .acquire_multipliers
                    .iter()
                    .any(|t| t.policy_id == asset.policy_id
                        && (t.asset_name.as_deref() == Some(asset.asset_id.as_str())
                            || t.asset_name.is_none())),
                "asset {} not covered by batch {batch}",
                asset.asset_id
            );
        }
    }

    let minted = total_vt_minted(&h).await;
    assert!(minted as u128 <= 1_000_000_000_000);
}

#[tokio::test]
async fn test_threshold_not_met_fails_vault() {
    let h = harness().await;
    let v = setup_vault(
        &h,
        VaultSpec {
            vt_supply: 1_000_000,
            acquirers_pct: 99,
            lp_pct: 4,
            reserve_pct: 50,
        },
    )
    .await;
    add_contribution(&h, &v, "alice", 1, &[("aa", "01", 1, 1_000)]).await;
    // required = 1000 * 99 * 50 / 10000 = 495; 494 falls short.
    add_acquisition(&h, &v, "bob", 1, 494).await;

    h.orchestrator.tick().await.unwrap();

    let v = vault(&h, "vault-1").await;
    assert_eq!(v.status, VaultStatus::Failed);
    assert!(claims(&h, "vault-1").await.is_empty());
    assert!(h.chain.submitted().await.is_empty());
}

#[tokio::test]
async fn test_consumed_contribution_fails_only_that_claim() {
    let h = harness().await;
    let v = setup_vault(
        &h,
        VaultSpec {
            vt_supply: 1_000_000,
            acquirers_pct: 99,
            lp_pct: 4,
            reserve_pct: 0,
        },
    )
    .await;
    add_contribution(&h, &v, "alice", 1, &[("aa", "01", 1, 500)]).await;
    add_contribution(&h, &v, "mallory", 2, &[("bb", "01", 1, 500)]).await;
    add_acquisition(&h, &v, "bob", 1, 1_000).await;

    // Mallory's contribution UTXO is spent by someone else before payout.
    h.chain
        .consume_externally(&UtxoRef::new("contrib002", 0), "attacker_tx")
        .await;

    h.orchestrator.tick().await.unwrap();

    let all = claims(&h, "vault-1").await;
    let failed = all
        .iter()
        .find(|c| c.user_id == "mallory")
        .unwrap();
    assert_eq!(failed.status, ClaimStatus::Failed);
    match &failed.failure {
        Some(ClaimFailureReason::UtxoAlreadySpent { consumed_by_tx }) => {
            assert_eq!(consumed_by_tx, "attacker_tx");
        }
        other => panic!("expected UtxoAlreadySpent, got {other:?}"),
    }
    let paid = all.iter().find(|c| c.user_id == "alice").unwrap();
    assert_eq!(paid.status, ClaimStatus::Claimed);

    // Failed claims keep the vault open for manual recovery.
    let v = vault(&h, "vault-1").await;
    assert_ne!(v.status, VaultStatus::Finalized);
    assert!(v.distribution_in_progress);
    assert!(!v.distribution_processed);
}

#[tokio::test]
async fn test_zero_acquirer_pct_pays_without_dispatch() {
    let h = harness().await;
    let v = setup_vault(
        &h,
        VaultSpec {
            vt_supply: 1_000_000,
            acquirers_pct: 0,
            lp_pct: 4,
            reserve_pct: 0,
        },
    )
    .await;
    add_contribution(&h, &v, "alice", 1, &[("aa", "01", 1, 1_000)]).await;

    h.orchestrator.tick().await.unwrap();

    let v = vault(&h, "vault-1").await;
    assert_eq!(v.status, VaultStatus::Finalized);
    assert_eq!(v.coin_pair_multiplier, 0);

    let all = claims(&h, "vault-1").await;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].coin_amount, 0);
    // Full residual supply to the sole contributor.
    assert_eq!(all[0].vt_amount, 980_000_000_000);

    // The pay transaction spends no dispatch inputs and pays no coin.
    let submitted = h.chain.submitted().await;
    let pay = submitted.last().unwrap();
    assert_eq!(pay.input.utxos.len(), 0);
    let user_output = pay
        .input
        .outputs
        .iter()
        .find(|o| o.address == "addr_alice")
        .unwrap();
    assert_eq!(user_output.coin, None);
    match &user_output.datum {
        Some(Datum::OutputPayout { coin_paid, .. }) => assert_eq!(*coin_paid, None),
        other => panic!("expected payout datum, got {other:?}"),
    }
}

#[tokio::test]
async fn test_update_timeout_reconciles_next_pass() {
    let h = harness().await;
    let v = setup_vault(
        &h,
        VaultSpec {
            vt_supply: 1_000_000,
            acquirers_pct: 99,
            lp_pct: 4,
            reserve_pct: 0,
        },
    )
    .await;
    add_contribution(&h, &v, "alice", 1, &[("aa", "01", 1, 1_000)]).await;
    add_acquisition(&h, &v, "bob", 1, 1_000).await;

    // The update lands on-chain but its confirmation wait times out.
    h.chain.defer_confirmations(1).await;
    h.orchestrator.tick().await.unwrap();
    h.orchestrator.tick().await.unwrap();

    let v = vault(&h, "vault-1").await;
    assert_eq!(v.status, VaultStatus::Finalized);
    assert_eq!(v.current_batch, 1);
    // Exactly one update was submitted despite the timeout.
    assert_eq!(update_txs(&h).await.len(), 1);
}

#[tokio::test]
async fn test_idempotent_tick_when_nothing_changes() {
    let h = harness().await;
    let v = setup_vault(
        &h,
        VaultSpec {
            vt_supply: 1_000_000,
            acquirers_pct: 99,
            lp_pct: 4,
            reserve_pct: 0,
        },
    )
    .await;
    add_contribution(&h, &v, "alice", 1, &[("aa", "01", 1, 500)]).await;
    add_contribution(&h, &v, "mallory", 2, &[("bb", "01", 1, 500)]).await;
    add_acquisition(&h, &v, "bob", 1, 1_000).await;
    h.chain
        .consume_externally(&UtxoRef::new("contrib002", 0), "attacker_tx")
        .await;

    h.orchestrator.tick().await.unwrap();
    let vault_before = vault(&h, "vault-1").await;
    let claims_before = claims(&h, "vault-1").await;
    let submitted_before = h.chain.submitted().await.len();

    h.orchestrator.tick().await.unwrap();
    assert_eq!(vault(&h, "vault-1").await, vault_before);
    assert_eq!(claims(&h, "vault-1").await, claims_before);
    assert_eq!(h.chain.submitted().await.len(), submitted_before);
}

#[tokio::test]
async fn test_unavailable_chain_aborts_tick_without_mutations() {
    let h = harness().await;
    let v = setup_vault(
        &h,
        VaultSpec {
            vt_supply: 1_000_000,
            acquirers_pct: 99,
            lp_pct: 4,
            reserve_pct: 0,
        },
    )
    .await;
    add_contribution(&h, &v, "alice", 1, &[("aa", "01", 1, 1_000)]).await;
    add_acquisition(&h, &v, "bob", 1, 1_000).await;

    h.chain.set_unavailable(true).await;
    let err = h.orchestrator.tick().await.unwrap_err();
    assert!(matches!(
        err,
        fvp_engine::EngineError::BlockchainUnavailable(_)
    ));

    let v = vault(&h, "vault-1").await;
    assert_eq!(v.status, VaultStatus::Locked);
    assert!(!v.distribution_in_progress);
    assert!(claims(&h, "vault-1").await.is_empty());

    // The chain coming back lets the next tick run to completion.
    h.chain.set_unavailable(false).await;
    h.orchestrator.tick().await.unwrap();
    assert_eq!(vault(&h, "vault-1").await.status, VaultStatus::Finalized);
}
