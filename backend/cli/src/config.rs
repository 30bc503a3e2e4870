use anyhow::Result;
use fvp_chain::{GatewayConfig, HttpOracleConfig};
use fvp_engine::EngineConfig;
use fvp_store::PgStoreConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub oracle: HttpOracleConfig,
    #[serde(default)]
    pub database: PgStoreConfig,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&config_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_or_default(path: &str) -> Result<Self> {
        if std::path::Path::new(path).exists() {
            Self::load(path)
        } else {
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.engine.validate().map_err(anyhow::Error::from)?;
        if self.gateway.base_url.is_empty() {
            anyhow::bail!("gateway base_url cannot be empty");
        }
        if self.database.url.is_empty() {
            anyhow::bail!("database url cannot be empty");
        }
        Ok(())
    }
}
