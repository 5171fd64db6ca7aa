//! Primary/fallback composition of market clients.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;

use crate::config::PRICE_API_URL;
use crate::error::{Error, Result};
use crate::market::{MarketClient, RpcMarketClient};
use crate::monitor::Monitor;
use crate::types::{MarketSnapshot, TokenId, TokenInfo};

/// Routes reads to the primary endpoint and falls back to a second client
/// with a stricter timeout when the primary fails. Domain rejections are
/// final and never re-routed.
pub struct FallbackClient {
    primary: Arc<dyn MarketClient>,
    fallback: Arc<dyn MarketClient>,
    retries: u32,
    backoff: Duration,
    monitor: Monitor,
}

impl FallbackClient {
    pub fn new(
        primary: Arc<dyn MarketClient>,
        fallback: Arc<dyn MarketClient>,
        monitor: Monitor,
    ) -> Self {
        Self {
            primary,
            fallback,
            retries: 3,
            backoff: Duration::from_secs(2),
            monitor,
        }
    }

    /// Standard wiring: primary at the configured endpoint, fallback at the
    /// backup endpoint with a shorter timeout and tighter rate.
    pub fn from_endpoints(
        primary_endpoint: &str,
        fallback_endpoint: &str,
        monitor: Monitor,
    ) -> Self {
        let primary = Arc::new(RpcMarketClient::new(
            primary_endpoint,
            PRICE_API_URL,
            0.5,
            2,
            Duration::from_secs(10),
            monitor.clone(),
        ));
        let fallback = Arc::new(RpcMarketClient::new(
            fallback_endpoint,
            PRICE_API_URL,
            1.0,
            2,
            Duration::from_secs(8),
            monitor.clone(),
        ));
        Self::new(primary, fallback, monitor)
    }
}

#[async_trait]
impl MarketClient for FallbackClient {
    async fn get_market(&self, token: &TokenId) -> Result<MarketSnapshot> {
        match self.primary.get_market(token).await {
            Ok(snapshot) => return Ok(snapshot),
            Err(e @ Error::TokenInvalid(_)) => return Err(e),
            Err(e) => {
                self.monitor.market(&format!(
                    "primary market read failed for {token}: {e}, trying fallback"
                ));
            }
        }

        let mut last = Error::Fatal("fallback attempts exhausted".to_string());
        for attempt in 1..=self.retries {
            match self.fallback.get_market(token).await {
                Ok(snapshot) => {
                    self.monitor.market(&format!(
                        "fallback read succeeded for {token} on attempt {attempt}"
                    ));
                    return Ok(snapshot);
                }
                Err(e @ Error::TokenInvalid(_)) => return Err(e),
                Err(e) => {
                    last = e;
                    if attempt < self.retries {
                        self.monitor.retry(&format!(
                            "market read retry {}/{} for {token}",
                            attempt + 1,
                            self.retries
                        ));
                        sleep(self.backoff).await;
                    }
                }
            }
        }
        self.monitor
            .failure(&format!("all market reads failed for {token}: {last}"));
        Err(last)
    }

    async fn token_info(&self, token: &TokenId) -> Result<TokenInfo> {
        match self.primary.token_info(token).await {
            Ok(info) => return Ok(info),
            Err(e @ Error::TokenInvalid(_)) => return Err(e),
            Err(e) => {
                self.monitor.market(&format!(
                    "primary token info failed for {token}: {e}, trying fallback"
                ));
            }
        }

        let mut last = Error::Fatal("fallback attempts exhausted".to_string());
        for attempt in 1..=self.retries {
            match self.fallback.token_info(token).await {
                Ok(info) => return Ok(info),
                Err(e @ Error::TokenInvalid(_)) => return Err(e),
                Err(e) => {
                    last = e;
                    if attempt < self.retries {
                        sleep(self.backoff).await;
                    }
                }
            }
        }
        Err(last)
    }

    async fn validate_connection(&self) -> Result<()> {
        if let Err(e) = self.primary.validate_connection().await {
            self.monitor
                .failure(&format!("primary RPC validation failed: {e}"));
            return self.fallback.validate_connection().await;
        }
        Ok(())
    }

    async fn list_top_tokens(&self) -> Result<Vec<TokenId>> {
        match self.primary.list_top_tokens().await {
            Ok(tokens) => Ok(tokens),
            Err(e) => {
                self.monitor
                    .failure(&format!("primary token list failed: {e}"));
                self.fallback.list_top_tokens().await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WSOL_MINT;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedClient {
        calls: AtomicU32,
        fail_first: u32,
        invalid: bool,
    }

    impl ScriptedClient {
        fn healthy() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail_first: 0,
                invalid: false,
            })
        }

        fn failing(times: u32) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail_first: times,
                invalid: false,
            })
        }

        fn rejecting() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail_first: 0,
                invalid: true,
            })
        }

        fn snapshot(token: &TokenId) -> MarketSnapshot {
            MarketSnapshot {
                token: token.clone(),
                price: 1.5,
                volume_24h: 10.0,
                captured_at: Utc::now(),
            }
        }
    }

    #[async_trait]
    impl MarketClient for ScriptedClient {
        async fn get_market(&self, token: &TokenId) -> Result<MarketSnapshot> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.invalid {
                return Err(Error::TokenInvalid(token.to_string()));
            }
            if n < self.fail_first {
                return Err(Error::Status(503));
            }
            Ok(Self::snapshot(token))
        }

        async fn token_info(&self, token: &TokenId) -> Result<TokenInfo> {
            let snapshot = self.get_market(token).await?;
            Ok(TokenInfo {
                mint: token.clone(),
                symbol: token.to_string(),
                price: snapshot.price,
                volume_24h: snapshot.volume_24h,
                decimals: 9,
                updated_at: snapshot.captured_at,
            })
        }

        async fn validate_connection(&self) -> Result<()> {
            Ok(())
        }

        async fn list_top_tokens(&self) -> Result<Vec<TokenId>> {
            Ok(vec![])
        }
    }

    fn sol() -> TokenId {
        TokenId::new(WSOL_MINT).unwrap()
    }

    #[tokio::test]
    async fn primary_success_skips_fallback() {
        let primary = ScriptedClient::healthy();
        let fallback = ScriptedClient::healthy();
        let client = FallbackClient::new(primary.clone(), fallback.clone(), Monitor::new());

        client.get_market(&sol()).await.unwrap();
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_retries_after_primary_failure() {
        let primary = ScriptedClient::failing(10);
        let fallback = ScriptedClient::failing(1);
        let client = FallbackClient::new(primary.clone(), fallback.clone(), Monitor::new());

        client.get_market(&sol()).await.unwrap();
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalid_token_is_never_rerouted() {
        let primary = ScriptedClient::rejecting();
        let fallback = ScriptedClient::healthy();
        let client = FallbackClient::new(primary, fallback.clone(), Monitor::new());

        let result = client.get_market(&sol()).await;
        assert!(matches!(result, Err(Error::TokenInvalid(_))));
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_fallback_surfaces_last_error() {
        let primary = ScriptedClient::failing(10);
        let fallback = ScriptedClient::failing(10);
        let client = FallbackClient::new(primary, fallback.clone(), Monitor::new());

        let result = client.get_market(&sol()).await;
        assert!(matches!(result, Err(Error::Status(503))));
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 3);
    }
}
