//! Error taxonomy shared across the engine and its clients.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing or malformed environment. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Network-level failure (connect, timeout, body read).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Upstream answered with a non-success HTTP status.
    #[error("upstream returned status {0}")]
    Status(u16),

    /// The rate limiter denied admission under the caller's deadline.
    #[error("rate limit exceeded")]
    RateLimited,

    /// Upstream payload did not match the expected shape.
    #[error("failed to decode upstream payload: {0}")]
    Decode(String),

    /// Upstream rejected the mint (supply check failed, unknown token).
    #[error("invalid token {0}")]
    TokenInvalid(String),

    /// RPC health check did not come back clean.
    #[error("endpoint unhealthy: {0}")]
    Unhealthy(String),

    /// Quoted or referenced price drifted past the configured cap.
    #[error("slippage exceeds configured cap")]
    SlippageExceeded,

    /// Trade would push a single token past its exposure cap.
    #[error("trade would exceed per-token exposure cap")]
    PerTokenExceeded,

    /// Trade would push aggregate exposure past the ceiling.
    #[error("trade would exceed total exposure cap")]
    TotalExceeded,

    /// Sell proposed without a held position.
    #[error("sell without a held position")]
    InsufficientPosition,

    /// The model backend is unavailable; decisions degrade to Hold.
    #[error("model oracle degraded: {0}")]
    OracleDegraded(String),

    /// A second execute was issued for an order that is still in flight.
    #[error("order already in flight")]
    OrderInFlight,

    /// Unrecoverable runtime failure; the engine stops and surfaces it.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    /// Transport-class failures are worth another attempt with backoff.
    /// Domain rejections never are: the proposal itself is wrong.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(_) => true,
            Error::Status(code) => *code == 429 || *code >= 500,
            _ => false,
        }
    }
}
