//! JSON-RPC market client with price-service quotes and short-lived
//! per-token memoization.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::http::{retry, RateLimitedHttp, RetryPolicy};
use crate::market::MarketClient;
use crate::monitor::Monitor;
use crate::types::{MarketSnapshot, TokenId, TokenInfo, USDC_MINT, WSOL_MINT};

/// Repeated reads within this window are served from memory.
const MEMO_TTL: Duration = Duration::from_secs(300);

#[derive(Serialize)]
struct RpcRequest {
    jsonrpc: &'static str,
    id: u64,
    method: &'static str,
    params: Value,
}

#[derive(Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct PriceResponse {
    data: PriceData,
}

#[derive(Deserialize)]
struct PriceData {
    price: f64,
    #[serde(rename = "volume24h")]
    volume_24h: Option<f64>,
}

pub struct RpcMarketClient {
    http: RateLimitedHttp,
    endpoint: String,
    price_api: String,
    request_id: AtomicU64,
    memo: DashMap<TokenId, (MarketSnapshot, Instant)>,
    /// Last `captured_at` per token; new snapshots never move backwards.
    last_captured: DashMap<TokenId, DateTime<Utc>>,
    retry_policy: RetryPolicy,
    monitor: Monitor,
}

impl RpcMarketClient {
    pub fn new(
        endpoint: &str,
        price_api: &str,
        rate_per_second: f64,
        burst: u32,
        timeout: Duration,
        monitor: Monitor,
    ) -> Self {
        Self {
            http: RateLimitedHttp::new(rate_per_second, burst, timeout),
            endpoint: endpoint.to_string(),
            price_api: price_api.to_string(),
            request_id: AtomicU64::new(0),
            memo: DashMap::new(),
            last_captured: DashMap::new(),
            retry_policy: RetryPolicy::default(),
            monitor,
        }
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn rpc_call(&self, method: &'static str, params: Value) -> Result<Value> {
        retry(&self.retry_policy, &self.monitor, method, || {
            let params = params.clone();
            async move {
                self.http.acquire(None).await?;
                let request = RpcRequest {
                    jsonrpc: "2.0",
                    id: self.next_id(),
                    method,
                    params,
                };
                let response = self
                    .http
                    .client()
                    .post(&self.endpoint)
                    .json(&request)
                    .send()
                    .await?;
                let status = response.status();
                if !status.is_success() {
                    return Err(Error::Status(status.as_u16()));
                }
                let body: RpcResponse = response
                    .json()
                    .await
                    .map_err(|e| Error::Decode(e.to_string()))?;
                if let Some(err) = body.error {
                    return Err(Error::Decode(format!(
                        "rpc error {}: {}",
                        err.code, err.message
                    )));
                }
                body.result
                    .ok_or_else(|| Error::Decode("missing result field".to_string()))
            }
        })
        .await
    }

    /// On-chain supply check. A definitive upstream rejection maps to
    /// `TokenInvalid`; transport failures keep their class.
    async fn validate_token(&self, token: &TokenId) -> Result<()> {
        match self
            .rpc_call("getTokenSupply", json!([token.as_str()]))
            .await
        {
            Ok(result) => {
                result["value"]["amount"]
                    .as_str()
                    .and_then(|raw| raw.parse::<u64>().ok())
                    .ok_or_else(|| Error::TokenInvalid(token.to_string()))?;
                Ok(())
            }
            Err(Error::Decode(_)) => Err(Error::TokenInvalid(token.to_string())),
            Err(e) => Err(e),
        }
    }

    async fn token_decimals(&self, token: &TokenId) -> Result<u8> {
        let result = self
            .rpc_call(
                "getAccountInfo",
                json!([token.as_str(), { "encoding": "jsonParsed" }]),
            )
            .await?;
        result["value"]["data"]["parsed"]["info"]["decimals"]
            .as_u64()
            .map(|d| d as u8)
            .ok_or_else(|| Error::Decode(format!("no decimals for {token}")))
    }

    /// Aggregate holder balances, used when the price service omits volume.
    async fn holder_volume(&self, token: &TokenId) -> Result<f64> {
        let result = self
            .rpc_call("getTokenLargestAccounts", json!([token.as_str()]))
            .await?;
        let holders = result["value"]
            .as_array()
            .ok_or_else(|| Error::Decode("malformed holder list".to_string()))?;
        let volume = holders
            .iter()
            .filter_map(|h| h["uiAmount"].as_f64())
            .sum::<f64>();
        Ok(volume)
    }

    async fn price_quote(&self, token: &TokenId) -> Result<(f64, Option<f64>)> {
        let url = format!(
            "{}?inputMint={}&outputMint={}",
            self.price_api,
            token.as_str(),
            USDC_MINT
        );
        let response: PriceResponse = retry(&self.retry_policy, &self.monitor, "price", || {
            let url = url.clone();
            async move { self.http.get_json(&url).await }
        })
        .await?;
        Ok((response.data.price, response.data.volume_24h))
    }

    fn monotonic_now(&self, token: &TokenId) -> DateTime<Utc> {
        let now = Utc::now();
        let mut entry = self.last_captured.entry(token.clone()).or_insert(now);
        if now > *entry {
            *entry = now;
        }
        *entry
    }
}

#[async_trait]
impl MarketClient for RpcMarketClient {
    async fn get_market(&self, token: &TokenId) -> Result<MarketSnapshot> {
        if let Some(memo) = self.memo.get(token) {
            if memo.1.elapsed() < MEMO_TTL {
                return Ok(memo.0.clone());
            }
        }

        let started = Instant::now();
        self.validate_token(token).await?;

        let (price, volume) = self.price_quote(token).await?;
        if price <= 0.0 {
            return Err(Error::TokenInvalid(token.to_string()));
        }
        let volume_24h = match volume {
            Some(v) => v,
            None => self.holder_volume(token).await.unwrap_or(0.0),
        };

        let snapshot = MarketSnapshot {
            token: token.clone(),
            price,
            volume_24h,
            captured_at: self.monotonic_now(token),
        };
        self.monitor.market(&format!(
            "{} price={:.8} volume={:.2}",
            token, price, volume_24h
        ));
        self.monitor.perf("market data retrieval", started.elapsed());

        self.memo
            .insert(token.clone(), (snapshot.clone(), Instant::now()));
        Ok(snapshot)
    }

    async fn token_info(&self, token: &TokenId) -> Result<TokenInfo> {
        let snapshot = self.get_market(token).await?;
        let decimals = self.token_decimals(token).await?;
        Ok(TokenInfo {
            mint: token.clone(),
            symbol: token.to_string(),
            price: snapshot.price,
            volume_24h: snapshot.volume_24h,
            decimals,
            updated_at: snapshot.captured_at,
        })
    }

    async fn validate_connection(&self) -> Result<()> {
        let result = self.rpc_call("getHealth", json!([])).await?;
        match result.as_str() {
            Some("ok") => {
                self.monitor
                    .market(&format!("validated RPC connection to {}", self.endpoint));
                Ok(())
            }
            other => Err(Error::Unhealthy(format!(
                "getHealth returned {:?}",
                other.unwrap_or("unknown")
            ))),
        }
    }

    async fn list_top_tokens(&self) -> Result<Vec<TokenId>> {
        // Seed scanning from the validated default set; discovery beyond it
        // happens through the cache loader.
        let mut tokens = Vec::new();
        for mint in [WSOL_MINT] {
            let token = TokenId::new(mint)?;
            if self.validate_token(&token).await.is_ok() {
                tokens.push(token);
            }
        }
        self.monitor
            .market(&format!("token list ready with {} entries", tokens.len()));
        Ok(tokens)
    }
}
