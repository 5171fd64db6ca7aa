//! Risk manager: exposure ledger, stop-loss levels, slippage envelope.
//!
//! `validate` commits exposure atomically on success; the engine releases
//! the committed delta with `rollback` when execution terminally fails, and
//! clears a token entirely with `unwind` once its position closes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::config::RiskConfig;
use crate::error::{Error, Result};
use crate::monitor::Monitor;
use crate::types::{Side, TokenId, Trade};

pub mod slippage;
pub mod stop_loss;

pub use slippage::SlippageGuard;
pub use stop_loss::StopLossTable;

/// Candidate stop-loss level for a token at a given price.
#[derive(Debug, Clone, Copy)]
pub struct RiskEstimate {
    pub stop_loss_price: f64,
}

/// Capability producing a fresh risk estimate per validation.
#[async_trait]
pub trait RiskAdvisor: Send + Sync {
    async fn assess(&self, token: &TokenId, price: f64) -> RiskEstimate;
}

/// Default advisor: a fixed drawdown below the reference price.
pub struct DrawdownAdvisor {
    drawdown: f64,
}

impl DrawdownAdvisor {
    pub fn new(drawdown: f64) -> Self {
        Self { drawdown }
    }
}

#[async_trait]
impl RiskAdvisor for DrawdownAdvisor {
    async fn assess(&self, _token: &TokenId, price: f64) -> RiskEstimate {
        RiskEstimate {
            stop_loss_price: price * (1.0 - self.drawdown),
        }
    }
}

#[derive(Default)]
struct Ledger {
    per_token: HashMap<TokenId, f64>,
    total: f64,
}

pub struct RiskManager {
    ledger: RwLock<Ledger>,
    stops: StopLossTable,
    slippage: SlippageGuard,
    last_quoted: RwLock<HashMap<TokenId, f64>>,
    advisor: Arc<dyn RiskAdvisor>,
    max_total_exposure: f64,
    per_token_cap: f64,
    trailing_gap_pct: f64,
    monitor: Monitor,
}

impl RiskManager {
    pub fn new(config: &RiskConfig, advisor: Arc<dyn RiskAdvisor>, monitor: Monitor) -> Self {
        Self {
            ledger: RwLock::new(Ledger::default()),
            stops: StopLossTable::new(),
            slippage: SlippageGuard::new(config.slippage_cap),
            last_quoted: RwLock::new(HashMap::new()),
            advisor,
            max_total_exposure: config.max_total_exposure,
            per_token_cap: config.per_token_cap(),
            trailing_gap_pct: config.trailing_gap_pct,
            monitor,
        }
    }

    /// Validate a proposal and, on success, commit its exposure. Per-token
    /// and total advance together under one write lock.
    pub async fn validate(&self, trade: &Trade) -> Result<()> {
        if trade.amount <= 0.0 || trade.reference_price <= 0.0 {
            return Err(Error::Fatal(format!(
                "malformed trade proposal for {}",
                trade.token
            )));
        }

        let estimate = self
            .advisor
            .assess(&trade.token, trade.reference_price)
            .await;
        self.stops
            .set_stop(&trade.token, estimate.stop_loss_price)
            .await;

        let trade_value = trade.value();
        let last_quoted = self.last_quoted.read().await.get(&trade.token).copied();

        let mut ledger = self.ledger.write().await;
        let current = ledger
            .per_token
            .get(&trade.token)
            .copied()
            .unwrap_or(0.0);

        if current + trade_value > self.per_token_cap {
            self.monitor.risk(&format!(
                "per-token cap would be exceeded for {} (current={current:.2} trade={trade_value:.2} cap={:.2})",
                trade.token, self.per_token_cap
            ));
            return Err(Error::PerTokenExceeded);
        }
        if ledger.total + trade_value > self.max_total_exposure {
            self.monitor.risk(&format!(
                "total cap would be exceeded (current={:.2} trade={trade_value:.2} cap={:.2})",
                ledger.total, self.max_total_exposure
            ));
            return Err(Error::TotalExceeded);
        }
        if trade.side == Side::Buy {
            if let Some(last) = last_quoted {
                self.slippage.check_buy(trade.reference_price, last)?;
            }
        }

        *ledger.per_token.entry(trade.token.clone()).or_insert(0.0) += trade_value;
        ledger.total += trade_value;
        self.monitor
            .exposure(&trade.token, current + trade_value, ledger.total);
        Ok(())
    }

    /// Release a previously committed exposure delta after a terminal
    /// execution failure. The total only drops by what actually leaves the
    /// token's entry, keeping it equal to the per-token sum.
    pub async fn rollback(&self, token: &TokenId, trade_value: f64) {
        let mut ledger = self.ledger.write().await;
        if let Some(entry) = ledger.per_token.get_mut(token) {
            let released = trade_value.min(*entry);
            *entry -= released;
            if *entry <= 0.0 {
                ledger.per_token.remove(token);
            }
            ledger.total = (ledger.total - released).max(0.0);
        }
    }

    /// Clear a token's exposure contribution and stop entries.
    pub async fn unwind(&self, token: &TokenId) {
        let mut ledger = self.ledger.write().await;
        if let Some(value) = ledger.per_token.remove(token) {
            ledger.total = (ledger.total - value).max(0.0);
        }
        drop(ledger);
        self.stops.clear(token).await;
        self.monitor.risk(&format!("unwound exposure for {token}"));
    }

    /// Record an observed price as the anchor for the next buy-slippage
    /// check. Callers record after validating so a proposal is measured
    /// against the previous observation, not its own.
    pub async fn record_price(&self, token: &TokenId, price: f64) {
        self.last_quoted.write().await.insert(token.clone(), price);
    }

    /// Arm a trailing stop behind a freshly opened position; per-tick
    /// `update_trailing` calls then ratchet the floor as the price climbs.
    pub async fn arm_trailing(&self, token: &TokenId, entry_price: f64) {
        if self.trailing_gap_pct > 0.0 {
            self.stops
                .set_trailing(token, entry_price * self.trailing_gap_pct)
                .await;
        }
    }

    pub async fn check_stop(&self, token: &TokenId, current_price: f64) -> bool {
        self.stops.check(token, current_price).await
    }

    pub async fn update_trailing(&self, token: &TokenId, current_price: f64) {
        self.stops.update_trailing(token, current_price).await;
    }

    pub async fn set_trailing(&self, token: &TokenId, gap: f64) {
        self.stops.set_trailing(token, gap).await;
    }

    pub async fn stop_for(&self, token: &TokenId) -> Option<f64> {
        self.stops.stop_for(token).await
    }

    pub async fn exposure(&self, token: &TokenId) -> f64 {
        self.ledger
            .read()
            .await
            .per_token
            .get(token)
            .copied()
            .unwrap_or(0.0)
    }

    pub async fn total_exposure(&self) -> f64 {
        self.ledger.read().await.total
    }
}
