//! Market data clients.

use std::sync::Arc;

use async_trait::async_trait;

use crate::cache::TokenLoader;
use crate::error::Result;
use crate::types::{MarketSnapshot, TokenId, TokenInfo};

pub mod fallback;
pub mod rpc;

pub use fallback::FallbackClient;
pub use rpc::RpcMarketClient;

/// Capability contract for price/volume observation.
#[async_trait]
pub trait MarketClient: Send + Sync {
    /// Price/volume snapshot for a validated mint. Fails with
    /// `TokenInvalid` when the on-chain supply check rejects the token.
    async fn get_market(&self, token: &TokenId) -> Result<MarketSnapshot>;

    /// Snapshot plus the decimal scale needed for base-unit encoding.
    async fn token_info(&self, token: &TokenId) -> Result<TokenInfo>;

    /// RPC health probe.
    async fn validate_connection(&self) -> Result<()>;

    /// Validated candidate mints for scanning.
    async fn list_top_tokens(&self) -> Result<Vec<TokenId>>;
}

/// Cache loader backed by a market client.
pub struct MarketInfoLoader {
    market: Arc<dyn MarketClient>,
}

impl MarketInfoLoader {
    pub fn new(market: Arc<dyn MarketClient>) -> Self {
        Self { market }
    }
}

#[async_trait]
impl TokenLoader for MarketInfoLoader {
    async fn load(&self, token: &TokenId) -> Result<TokenInfo> {
        self.market.token_info(token).await
    }
}
