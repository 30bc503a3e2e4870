use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("price oracle unavailable: {0}")]
    Unavailable(String),

    #[error("malformed oracle response: {0}")]
    Decode(String),
}

/// Coin-denominated unit prices for one asset. Either side may be missing;
/// the calculator applies the `floor || dex || 0` precedence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetPrice {
    pub floor_price: Option<u64>,
    pub dex_price: Option<u64>,
}

impl AssetPrice {
    pub fn floor(price: u64) -> Self {
        Self {
            floor_price: Some(price),
            dex_price: None,
        }
    }

    /// `floorPrice || dexPrice || 0`.
    pub fn effective(&self) -> u64 {
        self.floor_price.or(self.dex_price).unwrap_or(0)
    }
}

/// Per-asset valuation source.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn price_of(&self, policy_id: &str, asset_id: &str) -> Result<AssetPrice, OracleError>;
}

/// Fixed price map, used by tests and manual runs.
#[derive(Debug, Default)]
pub struct StaticPriceOracle {
    prices: HashMap<(String, String), AssetPrice>,
}

impl StaticPriceOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_price(
        mut self,
        policy_id: impl Into<String>,
        asset_id: impl Into<String>,
        price: AssetPrice,
    ) -> Self {
        self.prices
            .insert((policy_id.into(), asset_id.into()), price);
        self
    }
}

#[async_trait]
impl PriceOracle for StaticPriceOracle {
    async fn price_of(&self, policy_id: &str, asset_id: &str) -> Result<AssetPrice, OracleError> {
        Ok(self
            .prices
            .get(&(policy_id.to_string(), asset_id.to_string()))
            .copied()
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpOracleConfig {
    pub base_url: String,
    pub request_timeout_seconds: u64,
    pub cache_ttl_seconds: u64,
}

impl Default for HttpOracleConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3200".to_string(),
            request_timeout_seconds: 10,
            cache_ttl_seconds: 300,
        }
    }
}

/// Oracle backed by the platform's pricing service, with a TTL cache so a
/// tick prices each asset at most once.
pub struct HttpPriceOracle {
    http: reqwest::Client,
    config: HttpOracleConfig,
    cache: RwLock<HashMap<(String, String), (tokio::time::Instant, AssetPrice)>>,
}

impl HttpPriceOracle {
    pub fn new(config: HttpOracleConfig) -> Result<Self, OracleError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| OracleError::Unavailable(e.to_string()))?;
        Ok(Self {
            http,
            config,
            cache: RwLock::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl PriceOracle for HttpPriceOracle {
    async fn price_of(&self, policy_id: &str, asset_id: &str) -> Result<AssetPrice, OracleError> {
        let key = (policy_id.to_string(), asset_id.to_string());
        let ttl = Duration::from_secs(self.config.cache_ttl_seconds);
        if let Some((at, price)) = self.cache.read().await.get(&key) {
            if at.elapsed() < ttl {
                return Ok(*price);
            }
        }

        let url = format!(
            "{}/v1/prices/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            policy_id,
            asset_id
        );
        let price: AssetPrice = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| OracleError::Unavailable(e.to_string()))?
            .json()
            .await
            .map_err(|e| OracleError::Decode(e.to_string()))?;
        debug!(policy_id, asset_id, ?price, "priced asset");

        self.cache
            .write()
            .await
            .insert(key, (tokio::time::Instant::now(), price));
        Ok(price)
    }
}
