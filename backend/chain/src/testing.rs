//! Deterministic in-process chain used by engine tests: a UTXO ledger, a
//! size model standing in for CBOR serialization, and knobs for the failure
//! modes the engine must survive.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::client::{BlockchainClient, ChainError, ChainResult};
use crate::types::{
    BuiltTx, Datum, DispatchParameters, ParameterizedScript, SubmitResult, TxInput, Utxo, UtxoRef,
};

/// Coin the mock builder attaches to outputs that specify none.
pub const MOCK_MIN_OUTPUT_COIN: u64 = 1_200_000;

/// Per-component byte costs approximating a serialized transaction.
#[derive(Debug, Clone, Copy)]
pub struct SizeModel {
    pub base: usize,
    pub per_input: usize,
    pub per_reference_input: usize,
    pub per_output: usize,
    pub per_asset: usize,
    pub per_mint: usize,
    pub per_interaction: usize,
    pub per_signer: usize,
    pub per_tuple: usize,
    pub per_datum: usize,
}

impl Default for SizeModel {
    fn default() -> Self {
        Self {
            base: 480,
            per_input: 70,
            per_reference_input: 40,
            per_output: 90,
            per_asset: 44,
            per_mint: 44,
            per_interaction: 60,
            per_signer: 32,
            per_tuple: 36,
            per_datum: 48,
        }
    }
}

impl SizeModel {
    pub fn estimate(&self, input: &TxInput) -> usize {
        let mut size = self.base;
        size += input.consumed_refs().len() * self.per_input;
        size += input.reference_inputs.len() * self.per_reference_input;
        size += input.required_signers.len() * self.per_signer;
        size += input.script_interactions.len() * self.per_interaction;
        size += input.mint.len() * self.per_mint;
        for output in &input.outputs {
            size += self.per_output;
            size += output.assets.len() * self.per_asset;
            size += match &output.datum {
                Some(Datum::VaultState(state)) => {
                    self.per_datum
                        + (state.acquire_multipliers.len() + state.coin_distribution.len())
                            * self.per_tuple
                }
                Some(_) => self.per_datum,
                None => 0,
            };
        }
        size
    }
}

/// A transaction accepted by the mock, kept for assertions.
#[derive(Debug, Clone)]
pub struct SubmittedTx {
    pub tx_hash: String,
    pub input: TxInput,
    pub size: usize,
}

#[derive(Default)]
struct MockState {
    utxos: HashMap<UtxoRef, Utxo>,
    spent: HashMap<UtxoRef, String>,
    pending: HashMap<String, (TxInput, usize)>,
    submitted: Vec<SubmittedTx>,
    confirmed: HashSet<String>,
    defer_confirmations: u32,
    unavailable: bool,
    funding_counter: u64,
    build_counter: u64,
}

/// In-process `BlockchainClient` with deterministic sizes and hashes.
pub struct MockChain {
    state: Mutex<MockState>,
    pub size_model: SizeModel,
}

impl Default for MockChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChain {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            size_model: SizeModel::default(),
        }
    }

    pub fn with_size_model(size_model: SizeModel) -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            size_model,
        }
    }

    /// Seed an unspent output and return its reference.
    pub async fn fund(
        &self,
        address: &str,
        coin: u64,
        assets: Vec<crate::types::AssetAmount>,
    ) -> UtxoRef {
        let mut state = self.state.lock().await;
        state.funding_counter += 1;
        let reference = UtxoRef::new(format!("{:016x}", state.funding_counter), 0);
        state.utxos.insert(
            reference.clone(),
            Utxo {
                reference: reference.clone(),
                address: address.to_string(),
                coin,
                assets,
            },
        );
        reference
    }

    /// Seed an unspent output under a caller-chosen transaction hash.
    pub async fn fund_as(
        &self,
        tx_hash: &str,
        output_index: u32,
        address: &str,
        coin: u64,
        assets: Vec<crate::types::AssetAmount>,
    ) -> UtxoRef {
        let mut state = self.state.lock().await;
        let reference = UtxoRef::new(tx_hash, output_index);
        state.utxos.insert(
            reference.clone(),
            Utxo {
                reference: reference.clone(),
                address: address.to_string(),
                coin,
                assets,
            },
        );
        reference
    }

    /// Mark an output as consumed by a transaction the engine never built.
    pub async fn consume_externally(&self, reference: &UtxoRef, by_tx: &str) {
        let mut state = self.state.lock().await;
        state.utxos.remove(reference);
        state.spent.insert(reference.clone(), by_tx.to_string());
    }

    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    /// Make the next `n` `wait_confirmation` calls report a timeout even
    /// though the submission landed; `tx_confirmed` still sees it.
    pub async fn defer_confirmations(&self, n: u32) {
        self.state.lock().await.defer_confirmations = n;
    }

    pub async fn submitted(&self) -> Vec<SubmittedTx> {
        self.state.lock().await.submitted.clone()
    }

    pub async fn utxo(&self, reference: &UtxoRef) -> Option<Utxo> {
        self.state.lock().await.utxos.get(reference).cloned()
    }

    fn check_inputs(state: &MockState, input: &TxInput) -> ChainResult<()> {
        for reference in input.consumed_refs() {
            if !state.utxos.contains_key(&reference) {
                return Err(ChainError::MissingUtxo { reference });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BlockchainClient for MockChain {
    async fn build(&self, input: &TxInput) -> ChainResult<BuiltTx> {
        let mut state = self.state.lock().await;
        if state.unavailable {
            return Err(ChainError::Unavailable {
                reason: "mock chain offline".into(),
            });
        }
        Self::check_inputs(&state, input)?;
        state.build_counter += 1;
        let hex = format!("{:08x}", state.build_counter);
        let size = self.size_model.estimate(input);
        let tx_hash = hex::encode(Sha256::digest(hex.as_bytes()));
        state.pending.insert(hex.clone(), (input.clone(), size));
        Ok(BuiltTx { hex, size, tx_hash })
    }

    async fn submit(&self, hex: &str) -> ChainResult<SubmitResult> {
        let mut state = self.state.lock().await;
        if state.unavailable {
            return Err(ChainError::Unavailable {
                reason: "mock chain offline".into(),
            });
        }
        let (input, size) = state
            .pending
            .remove(hex)
            .ok_or_else(|| ChainError::SubmitRejected {
                reason: format!("unknown transaction {hex}"),
            })?;
        if let Err(e) = Self::check_inputs(&state, &input) {
            state.pending.insert(hex.to_string(), (input, size));
            return Err(e);
        }

        let tx_hash = hex::encode(Sha256::digest(hex.as_bytes()));
        for reference in input.consumed_refs() {
            state.utxos.remove(&reference);
            state.spent.insert(reference, tx_hash.clone());
        }
        for (index, output) in input.outputs.iter().enumerate() {
            let reference = UtxoRef::new(tx_hash.clone(), index as u32);
            state.utxos.insert(
                reference.clone(),
                Utxo {
                    reference,
                    address: output.address.clone(),
                    coin: output.coin.unwrap_or(MOCK_MIN_OUTPUT_COIN),
                    assets: output.assets.clone(),
                },
            );
        }
        state.confirmed.insert(tx_hash.clone());
        state.submitted.push(SubmittedTx {
            tx_hash: tx_hash.clone(),
            input,
            size,
        });
        Ok(SubmitResult { tx_hash })
    }

    async fn wait_confirmation(&self, tx_hash: &str, _timeout_ms: u64) -> ChainResult<bool> {
        let mut state = self.state.lock().await;
        if state.defer_confirmations > 0 {
            state.defer_confirmations -= 1;
            return Ok(false);
        }
        Ok(state.confirmed.contains(tx_hash))
    }

    async fn apply_dispatch_parameters(
        &self,
        params: &DispatchParameters,
    ) -> ChainResult<ParameterizedScript> {
        let digest = Sha256::digest(
            format!(
                "{}|{}|{}",
                params.vault_policy, params.vault_id, params.contribution_script_hash
            )
            .as_bytes(),
        );
        let hash = hex::encode(digest)[..56].to_string();
        Ok(ParameterizedScript {
            parameterized_hash: hash.clone(),
            address: format!("addr_script_{hash}"),
            preloaded_script: format!("mock-script-{hash}"),
        })
    }

    async fn utxos_at(&self, address: &str) -> ChainResult<Vec<Utxo>> {
        let state = self.state.lock().await;
        if state.unavailable {
            return Err(ChainError::Unavailable {
                reason: "mock chain offline".into(),
            });
        }
        let mut utxos: Vec<Utxo> = state
            .utxos
            .values()
            .filter(|u| u.address == address)
            .cloned()
            .collect();
        utxos.sort_by(|a, b| a.reference.to_string().cmp(&b.reference.to_string()));
        Ok(utxos)
    }

    async fn find_contribution_utxo(
        &self,
        script_address: &str,
        tx_hash: &str,
    ) -> ChainResult<Option<Utxo>> {
        let utxos = self.utxos_at(script_address).await?;
        Ok(utxos.into_iter().find(|u| u.reference.tx_hash == tx_hash))
    }

    async fn utxo_spent_by(&self, reference: &UtxoRef) -> ChainResult<Option<String>> {
        Ok(self.state.lock().await.spent.get(reference).cloned())
    }

    async fn tx_confirmed(&self, tx_hash: &str) -> ChainResult<bool> {
        Ok(self.state.lock().await.confirmed.contains(tx_hash))
    }
}
