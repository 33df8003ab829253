//! In-process upstream token cache.
//!
//! Keyed by broker connection id — never by agent — so two agents mapped
//! to the same account share one cached token. Entries live for
//! `clamp(token_expiry − now − 60s, 30s, 5min)`. A per-key flight lock
//! guarantees at most one broker fetch per key per TTL window no matter
//! how many requests race.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;

use waystation_core::Result;

use super::broker::TokenBroker;

const TTL_SAFETY_MARGIN: Duration = Duration::from_secs(60);
const TTL_MIN: Duration = Duration::from_secs(30);
const TTL_MAX: Duration = Duration::from_secs(300);

struct CacheEntry {
    token: String,
    cache_expires_at: Instant,
}

#[derive(Default)]
pub struct TokenCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    flights: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, connection_id: &str) -> Option<String> {
        let entries = self.entries.lock();
        entries.get(connection_id).and_then(|entry| {
            (entry.cache_expires_at > Instant::now()).then(|| entry.token.clone())
        })
    }

    fn flight_lock(&self, connection_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.flights
            .lock()
            .entry(connection_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Resolve the upstream token for `connection_id`, fetching from the
    /// broker on a cache miss. Concurrent callers for the same key
    /// coalesce into one fetch.
    pub async fn get_or_fetch(
        &self,
        connection_id: &str,
        broker: &Arc<dyn TokenBroker>,
    ) -> Result<String> {
        if let Some(token) = self.lookup(connection_id) {
            return Ok(token);
        }

        let flight = self.flight_lock(connection_id);
        let _guard = flight.lock().await;

        // A racing caller may have filled the cache while we waited.
        if let Some(token) = self.lookup(connection_id) {
            return Ok(token);
        }

        let fetched = broker.fetch_token(connection_id).await?;
        let remaining = (fetched.expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let ttl = remaining
            .saturating_sub(TTL_SAFETY_MARGIN)
            .clamp(TTL_MIN, TTL_MAX);

        self.entries.lock().insert(
            connection_id.to_string(),
            CacheEntry {
                token: fetched.access_token.clone(),
                cache_expires_at: Instant::now() + ttl,
            },
        );
        Ok(fetched.access_token)
    }

    /// Drop every cached token (used by factory reset).
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
