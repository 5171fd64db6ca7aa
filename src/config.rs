//! Configuration loaded once from the environment at startup and threaded
//! through every component at construction time.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use solana_sdk::pubkey::Pubkey;

use crate::error::{Error, Result};

/// Backup RPC used when the primary fails validation.
pub const FALLBACK_RPC_ENDPOINT: &str = "https://eclipse.helius-rpc.com/";
/// Price service queried with `?inputMint=…&outputMint=…`.
pub const PRICE_API_URL: &str = "https://price.jup.ag/v6/price";
/// DEX aggregator quote and swap endpoints.
pub const DEX_QUOTE_URL: &str = "https://quote-api.jup.ag/v6/quote";
pub const DEX_SWAP_URL: &str = "https://quote-api.jup.ag/v6/swap";

#[derive(Debug, Clone)]
pub struct Config {
    /// Public key the DEX swap leg executes under. The engine never sees
    /// private key material.
    pub wallet: String,
    pub rpc_endpoint: String,
    pub ollama_url: String,
    pub ollama_model: String,
    pub log_file: String,
    pub trading: TradingConfig,
    pub risk: RiskConfig,
    pub cache: CacheConfig,
    pub dex: DexConfig,
}

#[derive(Debug, Clone)]
pub struct TradingConfig {
    /// Interval between market scans.
    pub tick_interval: Duration,
    /// Base trade size in token units.
    pub base_amount: f64,
    /// Hard upper bound on a single trade size.
    pub max_amount: f64,
    /// Volume divisor for liquidity-scaled sizing.
    pub liquidity_scale: f64,
    /// Minimum decision confidence required to act.
    pub confidence_threshold: f64,
    /// Bound on concurrent per-token work within one tick.
    pub max_concurrent_tokens: usize,
    /// Swap attempts per actionable decision.
    pub execute_attempts: u32,
    pub execute_retry_delay: Duration,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            base_amount: 0.1,
            max_amount: 1.0,
            liquidity_scale: 10_000.0,
            confidence_threshold: 0.6,
            max_concurrent_tokens: 4,
            execute_attempts: 3,
            execute_retry_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub max_total_exposure: f64,
    /// Share of the total cap any single token may occupy.
    pub per_token_share: f64,
    /// Acceptable buy-price drift over the last quoted price.
    pub slippage_cap: f64,
    /// Drawdown used by the default stop-loss advisor.
    pub stop_loss_drawdown: f64,
    /// Trailing-stop gap as a share of the entry price; zero disables
    /// trailing.
    pub trailing_gap_pct: f64,
}

impl RiskConfig {
    pub fn per_token_cap(&self) -> f64 {
        self.max_total_exposure * self.per_token_share
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_total_exposure: 3_000_000.0,
            per_token_share: 0.3,
            slippage_cap: 0.02,
            stop_loss_drawdown: 0.5,
            trailing_gap_pct: 0.1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub max_tokens: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            max_tokens: 30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DexConfig {
    pub quote_url: String,
    pub swap_url: String,
    /// Hard slippage cap in basis points.
    pub slippage_bps: u16,
    /// Attempts on the quote leg before surfacing failure.
    pub quote_attempts: u32,
    /// Re-quote cycles for the swap leg.
    pub swap_attempts: u32,
    /// Free-tier assumption: one request per second.
    pub requests_per_second: f64,
}

impl Default for DexConfig {
    fn default() -> Self {
        Self {
            quote_url: DEX_QUOTE_URL.to_string(),
            swap_url: DEX_SWAP_URL.to_string(),
            slippage_bps: 100,
            quote_attempts: 5,
            swap_attempts: 3,
            requests_per_second: 1.0,
        }
    }
}

impl Config {
    /// Load configuration from environment variables. Missing required
    /// variables are a startup failure.
    pub fn from_env() -> Result<Self> {
        let wallet = required("WALLET")?;
        Pubkey::from_str(&wallet)
            .map_err(|_| Error::Config(format!("WALLET is not a valid public key: {wallet}")))?;

        let mut trading = TradingConfig::default();
        if let Some(ms) = parse_var::<u64>("TICK_INTERVAL_MS") {
            trading.tick_interval = Duration::from_millis(ms);
        }
        if let Some(threshold) = parse_var::<f64>("CONFIDENCE_THRESHOLD") {
            trading.confidence_threshold = threshold;
        }

        let mut risk = RiskConfig::default();
        if let Some(max) = parse_var::<f64>("MAX_TOTAL_EXPOSURE") {
            risk.max_total_exposure = max;
        }

        Ok(Self {
            wallet,
            rpc_endpoint: required("RPC_ENDPOINT")?,
            ollama_url: required("OLLAMA_URL")?,
            ollama_model: required("OLLAMA_MODEL")?,
            log_file: env::var("LOG_FILE").unwrap_or_else(|_| "trading.log".to_string()),
            trading,
            risk,
            cache: CacheConfig::default(),
            dex: DexConfig::default(),
        })
    }
}

fn required(name: &str) -> Result<String> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(Error::Config(format!(
            "{name} environment variable is required"
        ))),
    }
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|raw| raw.parse().ok())
}
