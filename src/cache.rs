//! Short-lived display caches. Never consulted for capacity decisions.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::finance::TotalsSummary;
use crate::model::SponsorCard;

/// A single value regenerated at most once per `ttl`. The lock is held while
/// generating, so concurrent readers wait for one refresh instead of stampeding.
pub struct TimedCache<T> {
    ttl: Duration,
    slot: Mutex<Option<(Instant, Arc<T>)>>,
}

impl<T> TimedCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: Mutex::new(None),
        }
    }

    pub async fn get_or_refresh<E, F, Fut>(&self, generate: F) -> Result<Arc<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut slot = self.slot.lock().await;
        if let Some((at, value)) = slot.as_ref() {
            if at.elapsed() < self.ttl {
                return Ok(value.clone());
            }
        }
        let value = Arc::new(generate().await?);
        *slot = Some((Instant::now(), value.clone()));
        Ok(value)
    }

    pub async fn invalidate(&self) {
        *self.slot.lock().await = None;
    }
}

pub struct DisplayCache {
    pub totals: TimedCache<TotalsSummary>,
    pub sponsors: TimedCache<Vec<SponsorCard>>,
}

impl DisplayCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            totals: TimedCache::new(ttl),
            sponsors: TimedCache::new(ttl),
        }
    }

    pub async fn invalidate_all(&self) {
        self.totals.invalidate().await;
        self.sponsors.invalidate().await;
    }
}
