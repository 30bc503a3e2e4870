use async_trait::async_trait;
use tracing::info;

use crate::error::EngineResult;

/// Handoff seam for liquidity-pool creation. The engine finalizes a vault by
/// calling this exactly once; pool creation itself is external.
#[async_trait]
pub trait LpBootstrap: Send + Sync {
    async fn create_pool(
        &self,
        vault_id: &str,
        lp_vt: u128,
        lp_coin: u64,
        coin_pair_multiplier: u64,
    ) -> EngineResult<()>;
}

/// Default wiring: record the handoff and leave pool creation to the
/// marketplace side of the platform.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingLpBootstrap;

#[async_trait]
impl LpBootstrap for LoggingLpBootstrap {
    async fn create_pool(
        &self,
        vault_id: &str,
        lp_vt: u128,
        lp_coin: u64,
        coin_pair_multiplier: u64,
    ) -> EngineResult<()> {
        info!(
            vault_id,
            lp_vt, lp_coin, coin_pair_multiplier, "🤝 LP creation handed off"
        );
        Ok(())
    }
}
