//! Core data model: tokens, snapshots, decisions, trades.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;

use crate::error::{Error, Result};

/// USDC mint, the base output leg for every price and swap.
pub const USDC_MINT: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";
/// Wrapped SOL mint.
pub const WSOL_MINT: &str = "So11111111111111111111111111111111111111112";
/// USDT mint, part of the default seed set.
pub const USDT_MINT: &str = "Es9vMFrzaCERmJfrF4H2FYD4KCoNkY11McCe8BenwNYB";

/// Base units of SOL per SOL.
pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;
/// USDC uses 6 decimals on mainnet.
pub const USDC_DECIMALS: u8 = 6;

/// Opaque mint identifier. Construction validates the base58 alphabet and
/// length through `Pubkey` parsing; the symbol is a human label and is never
/// used for routing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(String);

impl TokenId {
    pub fn new(mint: &str) -> Result<Self> {
        Pubkey::from_str(mint).map_err(|_| Error::TokenInvalid(mint.to_string()))?;
        Ok(Self(mint.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cached per-token state: latest observed price/volume plus the decimal
/// scale needed to encode base-unit amounts for the DEX leg.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenInfo {
    pub mint: TokenId,
    pub symbol: String,
    pub price: f64,
    pub volume_24h: f64,
    pub decimals: u8,
    pub updated_at: DateTime<Utc>,
}

/// Price/volume observation for one token. `captured_at` is monotonic per
/// token within one process; `price > 0` for any snapshot used for
/// decisioning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub token: TokenId,
    pub price: f64,
    pub volume_24h: f64,
    pub captured_at: DateTime<Utc>,
}

/// Directional guidance from the model. `Hold` implies no downstream trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Buy,
    Sell,
    Hold,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Buy => "BUY",
            Action::Sell => "SELL",
            Action::Hold => "HOLD",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed model output. Confidence is always clamped into [0.1, 0.9] and
/// reasoning is never empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,
    pub confidence: f64,
    pub reasoning: String,
    pub model_tag: String,
    pub produced_at: DateTime<Utc>,
}

impl Decision {
    /// Lowest-confidence Hold, used whenever the model cannot be trusted.
    pub fn hold(reasoning: &str, model_tag: &str) -> Self {
        Self {
            action: Action::Hold,
            confidence: 0.1,
            reasoning: reasoning.to_string(),
            model_tag: model_tag.to_string(),
            produced_at: Utc::now(),
        }
    }
}

/// Trade direction once a non-Hold decision has been made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        })
    }
}

/// Proposal handed to the risk manager and then the DEX client.
#[derive(Debug, Clone)]
pub struct Trade {
    pub token: TokenId,
    pub side: Side,
    pub amount: f64,
    pub reference_price: f64,
}

impl Trade {
    /// Notional value used for exposure accounting.
    pub fn value(&self) -> f64 {
        self.amount * self.reference_price
    }
}

/// Confirmed swap identifier surfaced by the DEX client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxHash(pub String);

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_id_accepts_known_mints() {
        assert!(TokenId::new(USDC_MINT).is_ok());
        assert!(TokenId::new(WSOL_MINT).is_ok());
        assert!(TokenId::new(USDT_MINT).is_ok());
    }

    #[test]
    fn token_id_rejects_garbage() {
        assert!(matches!(
            TokenId::new("not-a-mint"),
            Err(Error::TokenInvalid(_))
        ));
        assert!(TokenId::new("").is_err());
    }

    #[test]
    fn lamport_scale_is_ten_to_the_ninth() {
        assert_eq!(LAMPORTS_PER_SOL, 10u64.pow(9));
    }

    #[test]
    fn trade_value_is_amount_times_price() {
        let trade = Trade {
            token: TokenId::new(WSOL_MINT).unwrap(),
            side: Side::Buy,
            amount: 250.0,
            reference_price: 1.0,
        };
        assert_eq!(trade.value(), 250.0);
    }
}
