//! DEX aggregator client: market swaps through a quote → swap pipeline.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{Side, TokenId, TxHash, USDC_DECIMALS, USDC_MINT};

pub mod jupiter;

pub use jupiter::{HttpDexApi, JupiterClient};

/// A market swap to execute. Buys spend USDC for the token; sells spend the
/// token for USDC. `amount` is in human token units.
#[derive(Debug, Clone)]
pub struct SwapOrder {
    pub id: Uuid,
    pub token: TokenId,
    pub side: Side,
    pub amount: f64,
    pub decimals: u8,
    /// Token price in USDC at proposal time.
    pub reference_price: f64,
}

impl SwapOrder {
    pub fn new(token: TokenId, side: Side, amount: f64, decimals: u8, reference_price: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            token,
            side,
            amount,
            decimals,
            reference_price,
        }
    }

    /// Input and output mints for the swap legs.
    pub fn route(&self) -> (&str, &str) {
        match self.side {
            Side::Buy => (USDC_MINT, self.token.as_str()),
            Side::Sell => (self.token.as_str(), USDC_MINT),
        }
    }

    /// Input amount in base units, rendered as an integer string.
    pub fn input_base_units(&self) -> String {
        let raw = match self.side {
            // Buys are funded in USDC: amount × price scaled to 10^6.
            Side::Buy => self.amount * self.reference_price * 10f64.powi(USDC_DECIMALS as i32),
            Side::Sell => self.amount * 10f64.powi(self.decimals as i32),
        };
        format!("{}", raw.round().max(0.0) as u128)
    }

    /// Output expected at the reference price, in base units of the output
    /// mint. The slippage check compares the quoted amount against this.
    pub fn expected_output_base_units(&self) -> f64 {
        match self.side {
            Side::Buy => self.amount * 10f64.powi(self.decimals as i32),
            Side::Sell => {
                self.amount * self.reference_price * 10f64.powi(USDC_DECIMALS as i32)
            }
        }
    }
}

/// Capability contract: atomic execution of one market swap.
#[async_trait]
pub trait DexClient: Send + Sync {
    async fn execute(&self, order: &SwapOrder) -> Result<TxHash>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WSOL_MINT;

    fn sol_order(side: Side, amount: f64, price: f64) -> SwapOrder {
        SwapOrder::new(TokenId::new(WSOL_MINT).unwrap(), side, amount, 9, price)
    }

    #[test]
    fn sell_amount_scales_by_token_decimals() {
        let order = sol_order(Side::Sell, 1.5, 20.0);
        assert_eq!(order.input_base_units(), "1500000000");
        assert_eq!(order.route(), (WSOL_MINT, USDC_MINT));
    }

    #[test]
    fn buy_amount_is_funded_in_usdc_units() {
        let order = sol_order(Side::Buy, 2.0, 25.0);
        // 2 SOL at 25 USDC = 50 USDC = 50_000_000 base units.
        assert_eq!(order.input_base_units(), "50000000");
        assert_eq!(order.route(), (USDC_MINT, WSOL_MINT));
    }

    #[test]
    fn expected_output_matches_reference_price() {
        let buy = sol_order(Side::Buy, 2.0, 25.0);
        assert_eq!(buy.expected_output_base_units(), 2_000_000_000.0);

        let sell = sol_order(Side::Sell, 2.0, 25.0);
        assert_eq!(sell.expected_output_base_units(), 50_000_000.0);
    }
}
