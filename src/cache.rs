//! Bounded TTL cache over per-token market info.
//!
//! Misses go through the injected loader under a per-key single-flight
//! lock; losers of the race reuse the winner's entry. The loader is
//! expected to sit behind the market client's rate limiter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::error::Result;
use crate::monitor::Monitor;
use crate::types::{TokenId, TokenInfo};

/// Capability for fetching a token's info on a cache miss.
#[async_trait]
pub trait TokenLoader: Send + Sync {
    async fn load(&self, token: &TokenId) -> Result<TokenInfo>;
}

struct Entry {
    info: TokenInfo,
    inserted_at: Instant,
}

pub struct TokenCache {
    entries: RwLock<HashMap<TokenId, Entry>>,
    /// Cache-wide expiry; advanced only when a refresh reloads every key.
    expires: RwLock<Instant>,
    ttl: Duration,
    max_tokens: usize,
    loader: Arc<dyn TokenLoader>,
    inflight: DashMap<TokenId, Arc<Mutex<()>>>,
    monitor: Monitor,
}

impl TokenCache {
    pub fn new(
        ttl: Duration,
        max_tokens: usize,
        loader: Arc<dyn TokenLoader>,
        monitor: Monitor,
    ) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            expires: RwLock::new(Instant::now() + ttl),
            ttl,
            max_tokens,
            loader,
            inflight: DashMap::new(),
            monitor,
        }
    }

    /// Return the cached info when fresh, otherwise load and store it.
    pub async fn get(&self, token: &TokenId) -> Result<TokenInfo> {
        if let Some(info) = self.fresh(token).await {
            return Ok(info);
        }

        let gate = self
            .inflight
            .entry(token.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = gate.lock().await;

        // A concurrent load may have landed while waiting on the gate.
        if let Some(info) = self.fresh(token).await {
            return Ok(info);
        }

        let info = self.loader.load(token).await?;
        self.insert(token.clone(), info.clone()).await;
        self.inflight.remove(token);
        Ok(info)
    }

    /// Unconditional overwrite; the freshest write wins.
    pub async fn set(&self, token: TokenId, info: TokenInfo) {
        self.insert(token, info).await;
    }

    /// Keys currently held, up to `max_tokens`. An empty or wholly expired
    /// cache is refreshed first.
    pub async fn top_tokens(&self) -> Result<Vec<TokenId>> {
        let started = Instant::now();
        let needs_refresh = {
            let entries = self.entries.read().await;
            entries.is_empty() || Instant::now() >= *self.expires.read().await
        };
        if needs_refresh {
            self.monitor.system("token cache expired, refreshing");
            self.refresh().await?;
        }

        let entries = self.entries.read().await;
        let mut tokens: Vec<TokenId> = entries.keys().cloned().collect();
        tokens.sort();
        tokens.truncate(self.max_tokens);
        self.monitor.perf("token cache scan", started.elapsed());
        Ok(tokens)
    }

    /// Re-load every held key. Keys whose loader fails retain their previous
    /// value; the cache-wide expiry advances only on full success.
    pub async fn refresh(&self) -> Result<()> {
        let keys: Vec<TokenId> = self.entries.read().await.keys().cloned().collect();
        let mut all_ok = true;

        for token in keys {
            match self.loader.load(&token).await {
                Ok(info) => self.insert(token, info).await,
                Err(e) => {
                    all_ok = false;
                    self.monitor
                        .failure(&format!("failed to refresh token {token}: {e}"));
                }
            }
        }

        if all_ok {
            *self.expires.write().await = Instant::now() + self.ttl;
        }
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    async fn fresh(&self, token: &TokenId) -> Option<TokenInfo> {
        let entries = self.entries.read().await;
        let entry = entries.get(token)?;
        if entry.inserted_at.elapsed() < self.ttl {
            Some(entry.info.clone())
        } else {
            None
        }
    }

    async fn insert(&self, token: TokenId, info: TokenInfo) {
        let mut entries = self.entries.write().await;
        if !entries.contains_key(&token) && entries.len() >= self.max_tokens {
            // Evict the entry with the oldest insertion time.
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            }
        }
        entries.insert(
            token,
            Entry {
                info,
                inserted_at: Instant::now(),
            },
        );
    }
}
