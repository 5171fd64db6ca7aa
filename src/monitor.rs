//! Observability shim. Every operator-visible event carries one marker from
//! a closed set and flows through the `tracing` pipeline configured at
//! startup. Components hold a cheap `Clone` handle; nothing else is global.

use std::fmt;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::types::{Side, TokenId};

/// Closed set of event markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    System,
    Market,
    Ai,
    Risk,
    Trade,
    Retry,
    Perf,
    Error,
}

impl Marker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Marker::System => "[SYSTEM]",
            Marker::Market => "[MARKET]",
            Marker::Ai => "[AI]",
            Marker::Risk => "[RISK]",
            Marker::Trade => "[TRADE]",
            Marker::Retry => "[RETRY]",
            Marker::Perf => "[PERF]",
            Marker::Error => "[ERROR]",
        }
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle for emitting structured lifecycle events.
#[derive(Debug, Clone, Default)]
pub struct Monitor;

impl Monitor {
    pub fn new() -> Self {
        Self
    }

    pub fn system(&self, msg: &str) {
        info!(marker = Marker::System.as_str(), "{} {}", Marker::System, msg);
    }

    pub fn market(&self, msg: &str) {
        info!(marker = Marker::Market.as_str(), "{} {}", Marker::Market, msg);
    }

    pub fn risk(&self, msg: &str) {
        info!(marker = Marker::Risk.as_str(), "{} {}", Marker::Risk, msg);
    }

    pub fn retry(&self, msg: &str) {
        warn!(marker = Marker::Retry.as_str(), "{} {}", Marker::Retry, msg);
    }

    pub fn failure(&self, msg: &str) {
        error!(marker = Marker::Error.as_str(), "{} {}", Marker::Error, msg);
    }

    pub fn ai_signal(&self, token: &TokenId, action: &str, confidence: f64) {
        info!(
            marker = Marker::Ai.as_str(),
            "{} {} {} {:.2}",
            Marker::Ai,
            token,
            action,
            confidence
        );
    }

    pub fn trade(&self, token: &TokenId, side: Side, amount: f64, price: f64) {
        info!(
            marker = Marker::Trade.as_str(),
            "{} {} {} {:.8} @ {:.8}",
            Marker::Trade,
            token,
            side,
            amount,
            price
        );
    }

    pub fn exposure(&self, token: &TokenId, per_token: f64, total: f64) {
        info!(
            marker = Marker::Risk.as_str(),
            "{} exposure {}={:.2} total={:.2}",
            Marker::Risk,
            token,
            per_token,
            total
        );
    }

    pub fn perf(&self, what: &str, elapsed: Duration) {
        info!(
            marker = Marker::Perf.as_str(),
            "{} {} took {:?}",
            Marker::Perf,
            what,
            elapsed
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers_render_bracketed_tags() {
        assert_eq!(Marker::System.as_str(), "[SYSTEM]");
        assert_eq!(Marker::Ai.as_str(), "[AI]");
        assert_eq!(Marker::Retry.as_str(), "[RETRY]");
        assert_eq!(Marker::Perf.as_str(), "[PERF]");
    }
}
