use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Reference to a transaction output: `(txHash, outputIndex)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UtxoRef {
    pub tx_hash: String,
    pub output_index: u32,
}

impl UtxoRef {
    pub fn new(tx_hash: impl Into<String>, output_index: u32) -> Self {
        Self {
            tx_hash: tx_hash.into(),
            output_index,
        }
    }
}

impl std::fmt::Display for UtxoRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.tx_hash, self.output_index)
    }
}

/// One native-asset quantity inside an output value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetAmount {
    pub policy_id: String,
    pub asset_name: String,
    pub quantity: u64,
}

/// An unspent output with its resolved value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub reference: UtxoRef,
    pub address: String,
    pub coin: u64,
    pub assets: Vec<AssetAmount>,
}

impl Utxo {
    /// Quantity of one asset held by this output.
    pub fn asset_quantity(&self, policy_id: &str, asset_name: &str) -> u64 {
        self.assets
            .iter()
            .filter(|a| a.policy_id == policy_id && a.asset_name == asset_name)
            .map(|a| a.quantity)
            .sum()
    }
}

/// Integer multiplier entry published in the vault-state datum.
/// `asset_name = None` denotes a policy-wide entry; the empty policy id is the
/// acquirer slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiplierTuple {
    pub policy_id: String,
    pub asset_name: Option<String>,
    pub value: u64,
}

impl MultiplierTuple {
    pub fn exact(policy_id: impl Into<String>, asset_name: impl Into<String>, value: u64) -> Self {
        Self {
            policy_id: policy_id.into(),
            asset_name: Some(asset_name.into()),
            value,
        }
    }

    pub fn policy_wide(policy_id: impl Into<String>, value: u64) -> Self {
        Self {
            policy_id: policy_id.into(),
            asset_name: None,
            value,
        }
    }

    pub fn acquirer_slot(value: u64) -> Self {
        Self {
            policy_id: String::new(),
            asset_name: Some(String::new()),
            value,
        }
    }

    pub fn is_acquirer_slot(&self) -> bool {
        self.policy_id.is_empty()
    }
}

/// Redeemers the vault, mint and dispatch scripts accept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "constructor", content = "fields")]
pub enum Redeemer {
    ExtractCoin { vt_output_index: u32 },
    ExtractAsset { vt_output_index: Option<u32> },
    CollectVaultToken { vt_output_index: u32, change_output_index: u32 },
    MintVaultToken,
    /// Dispatch spend / withdraw take no redeemer payload.
    Null,
}

/// Vault-state payload carried by the datum-bearing update output.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VaultStateDatum {
    pub acquire_multipliers: Vec<MultiplierTuple>,
    pub coin_distribution: Vec<MultiplierTuple>,
    pub coin_pair_multiplier: u64,
}

/// Output datums the engine writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Datum {
    OutputPayout {
        datum_tag: String,
        coin_paid: Option<u64>,
    },
    AssetDatum {
        policy_id: String,
        asset_vault_name: String,
        owner: String,
        datum_tag: String,
    },
    VaultState(VaultStateDatum),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScriptPurpose {
    Spend,
    Mint,
    Withdraw,
}

/// One script invocation inside a build request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptInteraction {
    pub purpose: ScriptPurpose,
    pub hash: String,
    pub output_ref: Option<UtxoRef>,
    pub redeemer: Redeemer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetNameFormat {
    Hex,
    Utf8,
}

/// Mint (positive) or burn (negative) instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintAsset {
    pub policy_id: String,
    pub asset_name: String,
    pub name_format: AssetNameFormat,
    pub quantity: i64,
}

/// One output of a build request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutputSpec {
    pub address: String,
    pub coin: Option<u64>,
    pub assets: Vec<AssetAmount>,
    pub datum: Option<Datum>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositType {
    StakeRegistration,
}

/// Stake-credential deposit carried by the first dispatch interaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptDeposit {
    pub hash: String,
    pub deposit_type: DepositType,
    pub deposit: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValidityInterval {
    pub invalid_before: Option<u64>,
    pub invalid_hereafter: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Preprod,
    Preview,
}

/// Semantic build request handed to the `BlockchainClient`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub change_address: String,
    /// Inputs the builder must spend, beyond what balancing selects.
    pub utxos: Vec<UtxoRef>,
    pub message: Option<String>,
    pub required_signers: Vec<String>,
    /// Reference inputs, typically the last vault-state update output.
    pub reference_inputs: Vec<UtxoRef>,
    pub validity_interval: ValidityInterval,
    pub network: Network,
    pub script_interactions: Vec<ScriptInteraction>,
    pub mint: Vec<MintAsset>,
    pub outputs: Vec<TxOutputSpec>,
    pub deposits: Vec<ScriptDeposit>,
}

impl TxInput {
    pub fn new(change_address: impl Into<String>, network: Network) -> Self {
        Self {
            change_address: change_address.into(),
            utxos: Vec::new(),
            message: None,
            required_signers: Vec::new(),
            reference_inputs: Vec::new(),
            validity_interval: ValidityInterval::default(),
            network,
            script_interactions: Vec::new(),
            mint: Vec::new(),
            outputs: Vec::new(),
            deposits: Vec::new(),
        }
    }

    /// All inputs this request forces the builder to consume.
    pub fn consumed_refs(&self) -> Vec<UtxoRef> {
        let mut refs = self.utxos.clone();
        for si in &self.script_interactions {
            if si.purpose == ScriptPurpose::Spend {
                if let Some(r) = &si.output_ref {
                    if !refs.contains(r) {
                        refs.push(r.clone());
                    }
                }
            }
        }
        refs
    }
}

/// A serialized, fully-balanced transaction returned by `build`. The hash is
/// known before submission, so callers can persist it write-ahead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltTx {
    pub hex: String,
    pub size: usize,
    pub tx_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResult {
    pub tx_hash: String,
}

/// Inputs to dispatch-script parameterization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchParameters {
    pub vault_policy: String,
    pub vault_id: String,
    pub contribution_script_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterizedScript {
    pub parameterized_hash: String,
    pub address: String,
    pub preloaded_script: String,
}

/// Stable tag correlating an on-chain output with its off-chain record:
/// `sha256(txHash || u32_be(outputIndex))`, hex-encoded.
pub fn datum_tag(tx_hash: &str, output_index: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tx_hash.as_bytes());
    hasher.update(output_index.to_be_bytes());
    hex::encode(hasher.finalize())
}
