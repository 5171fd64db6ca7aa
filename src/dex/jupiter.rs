//! Jupiter-style aggregator transport and the per-order state machine.
//!
//! `execute` runs Quoting → Quoted → Swapping → Confirmed. The quote leg
//! retries transport failures with backoff; a failed swap leg always
//! re-quotes, so no quote is ever reused across swap attempts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::sleep;
use uuid::Uuid;

use crate::config::DexConfig;
use crate::dex::{DexClient, SwapOrder};
use crate::error::{Error, Result};
use crate::http::{retry, RateLimitedHttp, RetryPolicy};
use crate::monitor::Monitor;
use crate::types::TxHash;

#[derive(Debug, Clone, Serialize)]
pub struct QuoteRequest {
    #[serde(rename = "inputMint")]
    pub input_mint: String,
    #[serde(rename = "outputMint")]
    pub output_mint: String,
    /// Base units as an integer string.
    pub amount: String,
    #[serde(rename = "slippageBps")]
    pub slippage_bps: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteResponse {
    #[serde(rename = "inputMint")]
    pub input_mint: String,
    #[serde(rename = "outputMint")]
    pub output_mint: String,
    #[serde(rename = "inAmount")]
    pub in_amount: String,
    #[serde(rename = "outAmount")]
    pub out_amount: String,
    #[serde(rename = "priceImpactPct", default)]
    pub price_impact_pct: Option<Value>,
    #[serde(rename = "marketInfos", default)]
    pub market_infos: Option<Value>,
    /// Remaining quote payload, forwarded verbatim to the swap leg.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Serialize)]
pub struct SwapRequest {
    #[serde(rename = "quoteResponse")]
    pub quote_response: QuoteResponse,
    #[serde(rename = "userPublicKey")]
    pub user_public_key: String,
}

#[derive(Debug, Deserialize)]
pub struct SwapResponse {
    #[serde(rename = "txHash", default)]
    pub tx_hash: Option<String>,
    #[serde(rename = "swapTransaction", default)]
    pub swap_transaction: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Transport capability behind the state machine.
#[async_trait]
pub trait DexApi: Send + Sync {
    async fn quote(&self, request: &QuoteRequest) -> Result<QuoteResponse>;
    async fn swap(&self, request: &SwapRequest) -> Result<SwapResponse>;
}

/// HTTP transport, gated at the free-tier rate.
pub struct HttpDexApi {
    http: RateLimitedHttp,
    quote_url: String,
    swap_url: String,
}

impl HttpDexApi {
    pub fn new(config: &DexConfig) -> Self {
        Self {
            // Admission that cannot happen within the deadline surfaces
            // RateLimited instead of queuing orders unboundedly.
            http: RateLimitedHttp::new(config.requests_per_second, 1, Duration::from_secs(10))
                .with_admission_deadline(Duration::from_secs(30)),
            quote_url: config.quote_url.clone(),
            swap_url: config.swap_url.clone(),
        }
    }
}

#[async_trait]
impl DexApi for HttpDexApi {
    async fn quote(&self, request: &QuoteRequest) -> Result<QuoteResponse> {
        self.http.post_json(&self.quote_url, request).await
    }

    async fn swap(&self, request: &SwapRequest) -> Result<SwapResponse> {
        self.http.post_json(&self.swap_url, request).await
    }
}

pub struct JupiterClient {
    api: Arc<dyn DexApi>,
    wallet: String,
    slippage_bps: u16,
    quote_policy: RetryPolicy,
    swap_attempts: u32,
    inflight: DashMap<Uuid, ()>,
    monitor: Monitor,
}

impl JupiterClient {
    pub fn new(api: Arc<dyn DexApi>, wallet: &str, config: &DexConfig, monitor: Monitor) -> Self {
        Self {
            api,
            wallet: wallet.to_string(),
            slippage_bps: config.slippage_bps,
            quote_policy: RetryPolicy {
                max_attempts: config.quote_attempts,
                ..RetryPolicy::default()
            },
            swap_attempts: config.swap_attempts,
            inflight: DashMap::new(),
            monitor,
        }
    }

    async fn fetch_quote(&self, order: &SwapOrder) -> Result<QuoteResponse> {
        let (input_mint, output_mint) = order.route();
        let request = QuoteRequest {
            input_mint: input_mint.to_string(),
            output_mint: output_mint.to_string(),
            amount: order.input_base_units(),
            slippage_bps: self.slippage_bps,
        };
        self.monitor.trade(
            &order.token,
            order.side,
            order.amount,
            order.reference_price,
        );
        retry(&self.quote_policy, &self.monitor, "quote", || {
            let request = request.clone();
            async move { self.api.quote(&request).await }
        })
        .await
    }

    /// Reject the quote when the implied slippage crosses the hard cap.
    fn check_slippage(&self, order: &SwapOrder, quote: &QuoteResponse) -> Result<()> {
        let out_amount: f64 = quote
            .out_amount
            .parse()
            .map_err(|_| Error::Decode(format!("unparseable outAmount {}", quote.out_amount)))?;
        let expected = order.expected_output_base_units();
        if expected <= 0.0 {
            return Err(Error::Decode("non-positive expected output".to_string()));
        }
        let slippage_bps = (expected - out_amount) / expected * 10_000.0;
        if slippage_bps > self.slippage_bps as f64 {
            self.monitor.risk(&format!(
                "quote for {} implies {slippage_bps:.0} bps slippage, cap is {}",
                order.token, self.slippage_bps
            ));
            return Err(Error::SlippageExceeded);
        }
        Ok(())
    }

    async fn run(&self, order: &SwapOrder) -> Result<TxHash> {
        let mut last = Error::Fatal("swap attempts exhausted".to_string());
        for attempt in 1..=self.swap_attempts {
            // Each swap attempt runs against a quote produced in this cycle.
            let quote = self.fetch_quote(order).await?;
            self.check_slippage(order, &quote)?;

            let request = SwapRequest {
                quote_response: quote,
                user_public_key: self.wallet.clone(),
            };
            match self.api.swap(&request).await {
                Ok(response) => {
                    let tx = response
                        .tx_hash
                        .or(response.swap_transaction)
                        .ok_or_else(|| {
                            Error::Decode(
                                response
                                    .message
                                    .unwrap_or_else(|| "swap response missing transaction".to_string()),
                            )
                        })?;
                    self.monitor
                        .system(&format!("swap confirmed for {}: {tx}", order.token));
                    return Ok(TxHash(tx));
                }
                Err(e) if e.is_retryable() && attempt < self.swap_attempts => {
                    let delay = self.quote_policy.backoff(attempt);
                    self.monitor.retry(&format!(
                        "swap attempt {attempt}/{} failed for {}: {e}, re-quoting in {delay:?}",
                        self.swap_attempts, order.token
                    ));
                    sleep(delay).await;
                    last = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }
}

#[async_trait]
impl DexClient for JupiterClient {
    async fn execute(&self, order: &SwapOrder) -> Result<TxHash> {
        if self.inflight.insert(order.id, ()).is_some() {
            return Err(Error::OrderInFlight);
        }
        let result = self.run(order).await;
        self.inflight.remove(&order.id);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Side, TokenId, WSOL_MINT};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct MockApi {
        quote_calls: AtomicU32,
        swap_calls: AtomicU32,
        quote_script: Mutex<Vec<Result<QuoteResponse>>>,
        swap_script: Mutex<Vec<Result<SwapResponse>>>,
        delay: Duration,
    }

    impl MockApi {
        fn new(
            quote_script: Vec<Result<QuoteResponse>>,
            swap_script: Vec<Result<SwapResponse>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                quote_calls: AtomicU32::new(0),
                swap_calls: AtomicU32::new(0),
                quote_script: Mutex::new(quote_script),
                swap_script: Mutex::new(swap_script),
                delay: Duration::ZERO,
            })
        }

        fn quote_ok(out_amount: &str) -> QuoteResponse {
            QuoteResponse {
                input_mint: crate::types::USDC_MINT.to_string(),
                output_mint: WSOL_MINT.to_string(),
                in_amount: "50000000".to_string(),
                out_amount: out_amount.to_string(),
                price_impact_pct: None,
                market_infos: None,
                extra: serde_json::Map::new(),
            }
        }

        fn swap_ok() -> SwapResponse {
            SwapResponse {
                tx_hash: Some("5signature".to_string()),
                swap_transaction: None,
                message: None,
            }
        }
    }

    #[async_trait]
    impl DexApi for MockApi {
        async fn quote(&self, _request: &QuoteRequest) -> Result<QuoteResponse> {
            self.quote_calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            let mut script = self.quote_script.lock().unwrap();
            if script.is_empty() {
                Ok(Self::quote_ok("2000000000"))
            } else {
                script.remove(0)
            }
        }

        async fn swap(&self, _request: &SwapRequest) -> Result<SwapResponse> {
            self.swap_calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.swap_script.lock().unwrap();
            if script.is_empty() {
                Ok(Self::swap_ok())
            } else {
                script.remove(0)
            }
        }
    }

    fn order() -> SwapOrder {
        // Buy 2 SOL at 25 USDC; fair output is 2_000_000_000 lamports.
        SwapOrder::new(TokenId::new(WSOL_MINT).unwrap(), Side::Buy, 2.0, 9, 25.0)
    }

    fn client(api: Arc<MockApi>) -> JupiterClient {
        let config = DexConfig::default();
        JupiterClient::new(api, "7xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsU", &config, Monitor::new())
    }

    #[tokio::test(start_paused = true)]
    async fn quote_retries_then_swaps_once() {
        let api = MockApi::new(
            vec![
                Err(Error::Status(503)),
                Err(Error::Status(503)),
                Ok(MockApi::quote_ok("2000000000")),
            ],
            vec![Ok(MockApi::swap_ok())],
        );
        let client = client(api.clone());

        let tx = client.execute(&order()).await.unwrap();
        assert_eq!(tx.0, "5signature");
        assert_eq!(api.quote_calls.load(Ordering::SeqCst), 3);
        assert_eq!(api.swap_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn swap_retry_always_requotes() {
        let api = MockApi::new(
            vec![],
            vec![Err(Error::Status(503)), Ok(MockApi::swap_ok())],
        );
        let client = client(api.clone());

        client.execute(&order()).await.unwrap();
        // One fresh quote per swap attempt.
        assert_eq!(api.quote_calls.load(Ordering::SeqCst), 2);
        assert_eq!(api.swap_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn excessive_slippage_rejects_before_swapping() {
        // Fair output is 2_000_000_000; quote offers 2% less than that,
        // past the 100 bps cap.
        let api = MockApi::new(vec![Ok(MockApi::quote_ok("1960000000"))], vec![]);
        let client = client(api.clone());

        let result = client.execute(&order()).await;
        assert!(matches!(result, Err(Error::SlippageExceeded)));
        assert_eq!(api.swap_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn slippage_within_cap_passes() {
        // 50 bps under fair value, inside the 100 bps cap.
        let api = MockApi::new(vec![Ok(MockApi::quote_ok("1990000000"))], vec![]);
        let client = client(api.clone());
        client.execute(&order()).await.unwrap();
        assert_eq!(api.swap_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_swap_attempts_surface_last_error() {
        let api = MockApi::new(
            vec![],
            vec![
                Err(Error::Status(503)),
                Err(Error::Status(503)),
                Err(Error::Status(503)),
            ],
        );
        let client = client(api.clone());

        let result = client.execute(&order()).await;
        assert!(matches!(result, Err(Error::Status(503))));
        assert_eq!(api.swap_calls.load(Ordering::SeqCst), 3);
        assert_eq!(api.quote_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn duplicate_execute_for_inflight_order_is_rejected() {
        let mut api = MockApi::new(vec![], vec![]);
        Arc::get_mut(&mut api).unwrap().delay = Duration::from_millis(50);
        let client = Arc::new(client(api.clone()));
        let shared = order();

        let racing = {
            let client = Arc::clone(&client);
            let shared = shared.clone();
            tokio::spawn(async move { client.execute(&shared).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = client.execute(&shared).await;
        assert!(matches!(second, Err(Error::OrderInFlight)));
        racing.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn swap_without_transaction_is_a_decode_error() {
        let api = MockApi::new(
            vec![],
            vec![Ok(SwapResponse {
                tx_hash: None,
                swap_transaction: None,
                message: Some("insufficient balance".to_string()),
            })],
        );
        let client = client(api);
        let result = client.execute(&order()).await;
        assert!(matches!(result, Err(Error::Decode(_))));
    }
}
