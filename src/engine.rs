//! Trading engine: periodic market scan plus per-token execution.
//!
//! One scheduler task drives the tick loop. Per-token work fans out with a
//! concurrency bound; data flows one direction per tick (snapshot →
//! decision → risk → swap → position update). Stop signals interrupt only
//! the inter-tick wait, so in-flight swap work always runs to completion.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};

use crate::cache::TokenCache;
use crate::config::TradingConfig;
use crate::dex::{DexClient, SwapOrder};
use crate::error::{Error, Result};
use crate::market::MarketClient;
use crate::monitor::Monitor;
use crate::oracle::Oracle;
use crate::risk::RiskManager;
use crate::types::{Action, MarketSnapshot, Side, TokenId, Trade};

pub struct Engine {
    market: Arc<dyn MarketClient>,
    oracle: Arc<dyn Oracle>,
    risk: Arc<RiskManager>,
    cache: Arc<TokenCache>,
    dex: Arc<dyn DexClient>,
    config: TradingConfig,
    monitor: Monitor,
    /// Signed base amounts per token, updated only after confirmed swaps.
    positions: RwLock<HashMap<TokenId, f64>>,
    running: RwLock<bool>,
    stop_tx: watch::Sender<bool>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(
        market: Arc<dyn MarketClient>,
        oracle: Arc<dyn Oracle>,
        risk: Arc<RiskManager>,
        cache: Arc<TokenCache>,
        dex: Arc<dyn DexClient>,
        config: TradingConfig,
        monitor: Monitor,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            market,
            oracle,
            risk,
            cache,
            dex,
            config,
            monitor,
            positions: RwLock::new(HashMap::new()),
            running: RwLock::new(false),
            stop_tx,
            scheduler: Mutex::new(None),
        }
    }

    /// Spawn the scheduler task. Subsequent calls while running are no-ops.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut running = self.running.write().await;
            if *running {
                return Ok(());
            }
            *running = true;
        }
        let _ = self.stop_tx.send(false);

        let engine = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        let handle = tokio::spawn(async move {
            engine.monitor.system("market scan scheduler started");
            let mut ticker = interval(engine.config.tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        // Ticks run to completion; stop is only observed
                        // between them so submitted swaps are never dropped.
                        engine.process_tick().await;
                    }
                }
            }
            engine.monitor.system("market scan scheduler stopped");
        });

        *self.scheduler.lock().await = Some(handle);
        self.monitor.system("trading engine started");
        Ok(())
    }

    /// Signal the scheduler and wait for it to wind down.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut running = self.running.write().await;
            if !*running {
                return Ok(());
            }
            *running = false;
        }
        let _ = self.stop_tx.send(true);

        if let Some(handle) = self.scheduler.lock().await.take() {
            handle
                .await
                .map_err(|e| Error::Fatal(format!("scheduler task failed: {e}")))?;
        }
        self.monitor.system("trading engine stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    pub async fn position(&self, token: &TokenId) -> f64 {
        self.positions
            .read()
            .await
            .get(token)
            .copied()
            .unwrap_or(0.0)
    }

    async fn process_tick(&self) {
        let started = Instant::now();
        let tokens = match self.cache.top_tokens().await {
            Ok(tokens) => tokens,
            Err(e) => {
                self.monitor
                    .failure(&format!("failed to get candidate tokens: {e}"));
                return;
            }
        };
        self.monitor
            .market(&format!("processing cycle over {} tokens", tokens.len()));

        stream::iter(tokens)
            .for_each_concurrent(self.config.max_concurrent_tokens, |token| async move {
                match self.process_token(&token).await {
                    Ok(()) => {}
                    // A sell with nothing held is skipped without noise.
                    Err(Error::InsufficientPosition) => {}
                    Err(e) => self
                        .monitor
                        .failure(&format!("tick aborted for {token}: {e}")),
                }
            })
            .await;

        self.monitor.perf("market scan", started.elapsed());
    }

    async fn process_token(&self, token: &TokenId) -> Result<()> {
        let fetch_start = Instant::now();
        let snapshot = self.market.get_market(token).await?;
        self.monitor.perf("market data fetch", fetch_start.elapsed());

        if snapshot.price <= 0.0 {
            self.monitor
                .market(&format!("skipping {token}: non-positive price"));
            return Ok(());
        }

        let result = self.act_on_snapshot(token, &snapshot).await;
        // Recorded after validation so this tick's proposal was measured
        // against the previous observation.
        self.risk.record_price(token, snapshot.price).await;
        result
    }

    async fn act_on_snapshot(&self, token: &TokenId, snapshot: &MarketSnapshot) -> Result<()> {
        self.risk.update_trailing(token, snapshot.price).await;

        let held = self.position(token).await;
        if held > 0.0 && self.risk.check_stop(token, snapshot.price).await {
            self.monitor.risk(&format!(
                "stop loss triggered for {token} at {:.8}, closing position",
                snapshot.price
            ));
            return self
                .execute_trade(token, Side::Sell, held, snapshot.price)
                .await;
        }

        let decide_start = Instant::now();
        let decision = self.oracle.decide(snapshot).await;
        self.monitor.perf("decision", decide_start.elapsed());

        let side = match decision.action {
            Action::Buy => Side::Buy,
            Action::Sell => Side::Sell,
            Action::Hold => return Ok(()),
        };
        if decision.confidence < self.config.confidence_threshold {
            self.monitor.market(&format!(
                "skipping {token}: confidence {:.2} below threshold {:.2}",
                decision.confidence, self.config.confidence_threshold
            ));
            return Ok(());
        }

        let amount = match side {
            Side::Buy => self.size_buy(snapshot),
            // Sells always close the entire held position.
            Side::Sell if held > 0.0 => held,
            Side::Sell => return Err(Error::InsufficientPosition),
        };

        self.execute_trade(token, side, amount, snapshot.price).await
    }

    /// Volume-scaled sizing bounded to [base_amount, max_amount].
    fn size_buy(&self, snapshot: &MarketSnapshot) -> f64 {
        let liquidity_factor = (snapshot.volume_24h / self.config.liquidity_scale).clamp(0.0, 1.0);
        let amount = self.config.base_amount * (1.0 + liquidity_factor);
        if !amount.is_finite() {
            return self.config.base_amount;
        }
        amount.clamp(self.config.base_amount, self.config.max_amount)
    }

    async fn execute_trade(
        &self,
        token: &TokenId,
        side: Side,
        amount: f64,
        price: f64,
    ) -> Result<()> {
        // Decimals come from the cache before any exposure is committed.
        let info = self.cache.get(token).await?;

        let trade = Trade {
            token: token.clone(),
            side,
            amount,
            reference_price: price,
        };
        let trade_value = trade.value();

        let validate_start = Instant::now();
        self.risk.validate(&trade).await?;
        self.monitor.perf("risk validation", validate_start.elapsed());

        let order = SwapOrder::new(token.clone(), side, amount, info.decimals, price);
        let swap_start = Instant::now();
        let mut last: Option<Error> = None;

        for attempt in 1..=self.config.execute_attempts {
            match self.dex.execute(&order).await {
                Ok(tx) => {
                    self.monitor.perf("swap execution", swap_start.elapsed());
                    self.apply_fill(token, side, amount).await;
                    match side {
                        Side::Buy => {
                            // A filled buy starts trailing its entry price.
                            self.risk.arm_trailing(token, price).await;
                        }
                        Side::Sell => {
                            // Closing a position releases the token's
                            // exposure and its stop entries in one step.
                            self.risk.unwind(token).await;
                        }
                    }
                    self.monitor.trade(token, side, amount, price);
                    self.monitor
                        .system(&format!("executed {side} for {token}: {tx}"));
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt < self.config.execute_attempts => {
                    self.monitor.retry(&format!(
                        "trade attempt {attempt}/{} failed for {token}: {e}",
                        self.config.execute_attempts
                    ));
                    sleep(self.config.execute_retry_delay).await;
                    last = Some(e);
                }
                Err(e) => {
                    last = Some(e);
                    break;
                }
            }
        }

        // Terminal failure: the position never advanced, so the committed
        // exposure delta comes back out.
        self.risk.rollback(token, trade_value).await;
        let e = last.unwrap_or_else(|| Error::Fatal("trade attempts exhausted".to_string()));
        self.monitor
            .failure(&format!("all trade attempts failed for {token}: {e}"));
        Err(e)
    }

    async fn apply_fill(&self, token: &TokenId, side: Side, amount: f64) {
        let mut positions = self.positions.write().await;
        match side {
            Side::Buy => {
                *positions.entry(token.clone()).or_insert(0.0) += amount;
            }
            Side::Sell => {
                positions.remove(token);
            }
        }
    }
}
