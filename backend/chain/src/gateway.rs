use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::client::{BlockchainClient, ChainError, ChainResult};
use crate::types::{
    BuiltTx, DispatchParameters, ParameterizedScript, SubmitResult, TxInput, Utxo, UtxoRef,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub request_timeout_seconds: u64,
    /// Poll interval while waiting for a confirmation.
    pub confirmation_poll_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3100".to_string(),
            api_key: None,
            request_timeout_seconds: 30,
            confirmation_poll_ms: 5_000,
        }
    }
}

/// HTTP client for the platform's transaction gateway. The gateway owns the
/// admin key: it balances, signs and submits; the engine only ships semantic
/// build requests.
pub struct GatewayClient {
    http: reqwest::Client,
    config: GatewayConfig,
}

#[derive(Debug, Deserialize)]
struct BuildResponse {
    hex: String,
    size: usize,
    tx_hash: String,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    tx_hash: String,
}

#[derive(Debug, Deserialize)]
struct TxStatusResponse {
    confirmed: bool,
}

#[derive(Debug, Deserialize)]
struct SpentByResponse {
    spent_by: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GatewayErrorBody {
    error: String,
    #[serde(default)]
    missing_utxo: Option<UtxoRef>,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig) -> ChainResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| ChainError::Unavailable {
                reason: e.to_string(),
            })?;
        info!("🔗 Chain gateway client ready at {}", config.base_url);
        Ok(Self { http, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => req.header("x-api-key", key),
            None => req,
        }
    }

    async fn decode_error(response: reqwest::Response) -> ChainError {
        let status = response.status();
        match response.json::<GatewayErrorBody>().await {
            Ok(body) => {
                if let Some(reference) = body.missing_utxo {
                    return ChainError::MissingUtxo { reference };
                }
                if status.as_u16() == 422 {
                    ChainError::BuildRejected { reason: body.error }
                } else {
                    ChainError::SubmitRejected { reason: body.error }
                }
            }
            Err(e) => ChainError::Decode(format!("{status}: {e}")),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> ChainResult<T> {
        let response = self
            .authorize(self.http.get(self.url(path)))
            .send()
            .await
            .map_err(|e| ChainError::Unavailable {
                reason: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(Self::decode_error(response).await);
        }
        response
            .json::<T>()
            .await
            .map_err(|e| ChainError::Decode(e.to_string()))
    }
}

#[async_trait]
impl BlockchainClient for GatewayClient {
    async fn build(&self, input: &TxInput) -> ChainResult<BuiltTx> {
        let response = self
            .authorize(self.http.post(self.url("/v1/tx/build")))
            .json(input)
            .send()
            .await
            .map_err(|e| ChainError::Unavailable {
                reason: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(Self::decode_error(response).await);
        }
        let body: BuildResponse = response
            .json()
            .await
            .map_err(|e| ChainError::Decode(e.to_string()))?;
        debug!(size = body.size, tx_hash = %body.tx_hash, "built transaction");
        Ok(BuiltTx {
            hex: body.hex,
            size: body.size,
            tx_hash: body.tx_hash,
        })
    }

    async fn submit(&self, hex: &str) -> ChainResult<SubmitResult> {
        let response = self
            .authorize(self.http.post(self.url("/v1/tx/submit")))
            .json(&serde_json::json!({ "hex": hex }))
            .send()
            .await
            .map_err(|e| ChainError::Unavailable {
                reason: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(Self::decode_error(response).await);
        }
        let body: SubmitResponse = response
            .json()
            .await
            .map_err(|e| ChainError::Decode(e.to_string()))?;
        info!(tx_hash = %body.tx_hash, "📤 Transaction submitted");
        Ok(SubmitResult {
            tx_hash: body.tx_hash,
        })
    }

    async fn wait_confirmation(&self, tx_hash: &str, timeout_ms: u64) -> ChainResult<bool> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            match self
                .get_json::<TxStatusResponse>(&format!("/v1/tx/{tx_hash}"))
                .await
            {
                Ok(status) if status.confirmed => return Ok(true),
                Ok(_) => {}
                // A gateway blip while polling is not a submission failure.
                Err(ChainError::Unavailable { reason }) => {
                    warn!(tx_hash, %reason, "gateway unreachable while polling confirmation");
                }
                Err(e) => return Err(e),
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(self.config.confirmation_poll_ms)).await;
        }
    }

    async fn apply_dispatch_parameters(
        &self,
        params: &DispatchParameters,
    ) -> ChainResult<ParameterizedScript> {
        let response = self
            .authorize(self.http.post(self.url("/v1/scripts/dispatch/parameterize")))
            .json(params)
            .send()
            .await
            .map_err(|e| ChainError::Unavailable {
                reason: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(Self::decode_error(response).await);
        }
        response
            .json::<ParameterizedScript>()
            .await
            .map_err(|e| ChainError::Decode(e.to_string()))
    }

    async fn utxos_at(&self, address: &str) -> ChainResult<Vec<Utxo>> {
        self.get_json(&format!("/v1/address/{address}/utxos")).await
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
        let body: SpentByResponse = self
            .get_json(&format!(
                "/v1/utxo/{}/{}/spent-by",
                reference.tx_hash, reference.output_index
            ))
            .await?;
        Ok(body.spent_by)
    }

    async fn tx_confirmed(&self, tx_hash: &str) -> ChainResult<bool> {
        let status: TxStatusResponse = self.get_json(&format!("/v1/tx/{tx_hash}")).await?;
        Ok(status.confirmed)
    }
}
