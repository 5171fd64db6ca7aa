//! Stop-loss floors and trailing gaps.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::types::TokenId;

/// Per-token stop levels. Trailing updates only ever raise a level.
#[derive(Default)]
pub struct StopLossTable {
    levels: RwLock<HashMap<TokenId, f64>>,
    trailing_gaps: RwLock<HashMap<TokenId, f64>>,
}

impl StopLossTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_stop(&self, token: &TokenId, price: f64) {
        self.levels.write().await.insert(token.clone(), price);
    }

    pub async fn set_trailing(&self, token: &TokenId, gap: f64) {
        self.trailing_gaps.write().await.insert(token.clone(), gap);
    }

    pub async fn stop_for(&self, token: &TokenId) -> Option<f64> {
        self.levels.read().await.get(token).copied()
    }

    /// True when the current price has reached or crossed the floor.
    pub async fn check(&self, token: &TokenId, current_price: f64) -> bool {
        match self.levels.read().await.get(token) {
            Some(level) => current_price <= *level,
            None => false,
        }
    }

    /// Raise the stop to `current - gap` when that improves on the existing
    /// level. The stop never retreats.
    pub async fn update_trailing(&self, token: &TokenId, current_price: f64) {
        let gap = match self.trailing_gaps.read().await.get(token) {
            Some(gap) => *gap,
            None => return,
        };
        let candidate = current_price - gap;
        let mut levels = self.levels.write().await;
        let entry = levels.entry(token.clone()).or_insert(f64::MIN);
        if candidate > *entry {
            *entry = candidate;
        }
    }

    pub async fn clear(&self, token: &TokenId) {
        self.levels.write().await.remove(token);
        self.trailing_gaps.write().await.remove(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WSOL_MINT;

    fn sol() -> TokenId {
        TokenId::new(WSOL_MINT).unwrap()
    }

    #[tokio::test]
    async fn check_trips_at_or_below_floor() {
        let table = StopLossTable::new();
        table.set_stop(&sol(), 10.0).await;
        assert!(table.check(&sol(), 10.0).await);
        assert!(table.check(&sol(), 9.5).await);
        assert!(!table.check(&sol(), 10.5).await);
    }

    #[tokio::test]
    async fn unknown_token_never_trips() {
        let table = StopLossTable::new();
        assert!(!table.check(&sol(), 0.0001).await);
    }

    #[tokio::test]
    async fn trailing_stop_is_monotonic() {
        let table = StopLossTable::new();
        table.set_stop(&sol(), 8.0).await;
        table.set_trailing(&sol(), 2.0).await;

        table.update_trailing(&sol(), 12.0).await;
        assert_eq!(table.stop_for(&sol()).await, Some(10.0));

        // A falling price must not lower the stop.
        table.update_trailing(&sol(), 9.0).await;
        assert_eq!(table.stop_for(&sol()).await, Some(10.0));

        table.update_trailing(&sol(), 15.0).await;
        assert_eq!(table.stop_for(&sol()).await, Some(13.0));
    }

    #[tokio::test]
    async fn trailing_without_gap_is_a_no_op() {
        let table = StopLossTable::new();
        table.set_stop(&sol(), 5.0).await;
        table.update_trailing(&sol(), 100.0).await;
        assert_eq!(table.stop_for(&sol()).await, Some(5.0));
    }

    #[tokio::test]
    async fn clear_removes_both_tables() {
        let table = StopLossTable::new();
        table.set_stop(&sol(), 5.0).await;
        table.set_trailing(&sol(), 1.0).await;
        table.clear(&sol()).await;
        assert_eq!(table.stop_for(&sol()).await, None);
        assert!(!table.check(&sol(), 0.0).await);
    }
}
