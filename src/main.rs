//! AI-guided market-swap engine for Solana SPL tokens.
//!
//! One process: a periodic market scanner consults a locally-hosted model
//! for directional guidance, validates proposals against exposure and
//! slippage envelopes, and routes market swaps through a DEX aggregator.
//! Configuration comes from the environment; all operator output flows
//! through structured log markers.

mod cache;
mod config;
mod dex;
mod engine;
mod error;
mod http;
mod market;
mod monitor;
mod oracle;
mod risk;
mod types;

use std::fs::OpenOptions;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cache::TokenCache;
use crate::config::{Config, FALLBACK_RPC_ENDPOINT};
use crate::dex::{HttpDexApi, JupiterClient};
use crate::engine::Engine;
use crate::market::{FallbackClient, MarketClient, MarketInfoLoader};
use crate::monitor::Monitor;
use crate::oracle::OllamaOracle;
use crate::risk::{DrawdownAdvisor, RiskManager};
use crate::types::{TokenId, USDC_MINT, USDT_MINT, WSOL_MINT};

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return 1;
        }
    };

    let log_file = match OpenOptions::new()
        .append(true)
        .create(true)
        .open(&config.log_file)
    {
        Ok(file) => file,
        Err(e) => {
            eprintln!("failed to open log file {}: {e}", config.log_file);
            return 1;
        }
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .compact(),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(Arc::new(log_file)),
        )
        .init();

    let monitor = Monitor::new();
    monitor.system("starting trading system");
    monitor.system(&format!("wallet: {}", config.wallet));
    monitor.system(&format!("rpc endpoint: {}", config.rpc_endpoint));
    monitor.system(&format!(
        "model: {} at {}",
        config.ollama_model, config.ollama_url
    ));

    // Market data with fallback; a failed health check swaps the backup
    // endpoint into the primary slot.
    let mut market: Arc<dyn MarketClient> = Arc::new(FallbackClient::from_endpoints(
        &config.rpc_endpoint,
        FALLBACK_RPC_ENDPOINT,
        monitor.clone(),
    ));
    if let Err(e) = market.validate_connection().await {
        monitor.failure(&format!(
            "primary RPC validation failed: {e}, switching to backup"
        ));
        market = Arc::new(FallbackClient::from_endpoints(
            FALLBACK_RPC_ENDPOINT,
            FALLBACK_RPC_ENDPOINT,
            monitor.clone(),
        ));
    }

    let oracle = Arc::new(OllamaOracle::new(
        &config.ollama_url,
        &config.ollama_model,
        monitor.clone(),
    ));

    let risk = Arc::new(RiskManager::new(
        &config.risk,
        Arc::new(DrawdownAdvisor::new(config.risk.stop_loss_drawdown)),
        monitor.clone(),
    ));

    let cache = Arc::new(TokenCache::new(
        config.cache.ttl,
        config.cache.max_tokens,
        Arc::new(MarketInfoLoader::new(market.clone())),
        monitor.clone(),
    ));
    seed_tokens(&cache, market.as_ref(), &monitor).await;

    let dex = Arc::new(JupiterClient::new(
        Arc::new(HttpDexApi::new(&config.dex)),
        &config.wallet,
        &config.dex,
        monitor.clone(),
    ));

    let engine = Arc::new(Engine::new(
        market,
        oracle,
        risk,
        cache,
        dex,
        config.trading.clone(),
        monitor.clone(),
    ));

    if let Err(e) = engine.start().await {
        monitor.failure(&format!("failed to start trading engine: {e}"));
        return 2;
    }

    wait_for_shutdown(&monitor).await;

    monitor.system("shutting down trading system");
    match engine.stop().await {
        Ok(()) => 0,
        Err(e) => {
            monitor.failure(&format!("engine stopped abnormally: {e}"));
            2
        }
    }
}

/// Pre-populate the cache so the first scan has candidates. Failures here
/// are logged and tolerated; the cache refreshes on demand.
async fn seed_tokens(cache: &TokenCache, market: &dyn MarketClient, monitor: &Monitor) {
    let mut seeds: Vec<TokenId> = [WSOL_MINT, USDC_MINT, USDT_MINT]
        .iter()
        .filter_map(|mint| TokenId::new(mint).ok())
        .collect();
    if let Ok(listed) = market.list_top_tokens().await {
        for token in listed {
            if !seeds.contains(&token) {
                seeds.push(token);
            }
        }
    }
    for token in seeds {
        if let Err(e) = cache.get(&token).await {
            monitor.failure(&format!("failed to seed token {token}: {e}"));
        }
    }
}

async fn wait_for_shutdown(monitor: &Monitor) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                monitor.failure(&format!("failed to install SIGTERM handler: {e}"));
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        let _ = monitor;
    }
}
