// =============================================================================
// C8 — Snapshot Cache
// =============================================================================
//
// Redis-backed per-symbol LTP/prev-close snapshot with single-flight
// coalescing: if N callers miss the cache for the same key concurrently,
// only one of them actually hits the upstream fetch path; the rest wait on
// its result. The upstream-fetch shape is grounded on the signed-REST-client
// pattern used for account/balance lookups; here it degrades to whatever
// `SnapshotSource` the caller wires up (the tick bus's own last-known-price
// in this engine, since there is no external quote vendor to call out to).
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use crate::types::InstrumentKey;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub key: InstrumentKey,
    pub ltp: f64,
    pub prev_close: f64,
    pub as_of_ms: i64,
}

#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(&self, keys: &[InstrumentKey]) -> anyhow::Result<Vec<Snapshot>>;
}

#[derive(Debug, Default)]
struct Counters {
    single_flight_hits: u64,
    cache_hits: u64,
    redis_hits: u64,
    cache_misses: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SnapshotCacheStats {
    pub single_flight_hits: u64,
    pub cache_hits: u64,
    pub redis_hits: u64,
    pub cache_misses: u64,
    pub inflight: usize,
}

struct InFlight {
    notify: Arc<Notify>,
}

pub struct SnapshotCache {
    redis: Option<redis::Client>,
    source: Arc<dyn SnapshotSource>,
    ttl_secs: u64,
    inflight: Mutex<HashMap<String, Arc<InFlight>>>,
    counters: parking_lot::Mutex<Counters>,
    local: parking_lot::RwLock<HashMap<InstrumentKey, Snapshot>>,
}

impl SnapshotCache {
    pub fn new(redis_url: Option<&str>, source: Arc<dyn SnapshotSource>, ttl_secs: u64) -> Self {
        let redis = redis_url.and_then(|url| redis::Client::open(url).ok());
        Self {
            redis,
            source,
            ttl_secs,
            inflight: Mutex::new(HashMap::new()),
            counters: parking_lot::Mutex::new(Counters::default()),
            local: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    fn flight_key(keys: &[InstrumentKey]) -> String {
        let mut sorted: Vec<String> = keys.iter().map(|k| k.canonical()).collect();
        sorted.sort();
        let mut hasher = Sha1::new();
        hasher.update(sorted.join(",").as_bytes());
        hex::encode(hasher.finalize())
    }

    fn jittered_ttl(&self) -> u64 {
        let jitter = rand::thread_rng().gen_range(0..=(self.ttl_secs / 2).max(1));
        self.ttl_secs + jitter
    }

    /// Fetch snapshots for the given keys, preferring the in-process cache,
    /// then Redis, then falling back to a single-flight upstream fetch.
    pub async fn get(&self, keys: &[InstrumentKey]) -> anyhow::Result<Vec<Snapshot>> {
        if let Some(hit) = self.try_local_cache(keys) {
            self.counters.lock().cache_hits += 1;
            return Ok(hit);
        }

        if let Some(hit) = self.try_redis_cache(keys).await {
            self.counters.lock().redis_hits += 1;
            let mut local = self.local.write();
            for s in &hit {
                local.insert(s.key.clone(), s.clone());
            }
            return Ok(hit);
        }

        let flight_key = Self::flight_key(keys);

        let notify = {
            let mut inflight = self.inflight.lock().await;
            if let Some(existing) = inflight.get(&flight_key) {
                self.counters.lock().single_flight_hits += 1;
                Some(Arc::clone(&existing.notify))
            } else {
                inflight.insert(
                    flight_key.clone(),
                    Arc::new(InFlight {
                        notify: Arc::new(Notify::new()),
                    }),
                );
                None
            }
        };

        if let Some(notify) = notify {
            notify.notified().await;
            return self
                .try_local_cache(keys)
                .ok_or_else(|| anyhow::anyhow!("single-flight wait produced no snapshot"));
        }

        self.counters.lock().cache_misses += 1;
        let result = self.source.fetch(keys).await;

        {
            let mut local = self.local.write();
            if let Ok(snapshots) = &result {
                for s in snapshots {
                    local.insert(s.key.clone(), s.clone());
                }
            }
        }

        if let (Some(client), Ok(snapshots)) = (&self.redis, &result) {
            if let Err(e) = self.write_back(client, snapshots).await {
                warn!(error = %e, "snapshot cache redis write-back failed");
            }
        }

        let mut inflight = self.inflight.lock().await;
        if let Some(entry) = inflight.remove(&flight_key) {
            entry.notify.notify_waiters();
        }

        result
    }

    fn try_local_cache(&self, keys: &[InstrumentKey]) -> Option<Vec<Snapshot>> {
        let local = self.local.read();
        let mut out = Vec::with_capacity(keys.len());
        for k in keys {
            out.push(local.get(k)?.clone());
        }
        Some(out)
    }

    /// Best-effort `MGET` across Redis for every key. Returns `None` (falls
    /// through to the single-flight fetch) unless every key is present —
    /// a partial hit would otherwise return a mixed-staleness batch.
    async fn try_redis_cache(&self, keys: &[InstrumentKey]) -> Option<Vec<Snapshot>> {
        let client = self.redis.as_ref()?;
        let mut conn = client.get_multiplexed_async_connection().await.ok()?;
        let redis_keys: Vec<String> = keys.iter().map(|k| format!("snapshot:{}", k.canonical())).collect();
        let raw: Vec<Option<String>> = conn.mget(&redis_keys).await.ok()?;

        let mut out = Vec::with_capacity(keys.len());
        for entry in raw {
            let snapshot: Snapshot = serde_json::from_str(&entry?).ok()?;
            out.push(snapshot);
        }
        Some(out)
    }

    async fn write_back(&self, client: &redis::Client, snapshots: &[Snapshot]) -> anyhow::Result<()> {
        let mut conn = client.get_multiplexed_async_connection().await?;
        let ttl = self.jittered_ttl();
        for s in snapshots {
            let payload = serde_json::to_string(s)?;
            let _: () = conn
                .set_ex(format!("snapshot:{}", s.key.canonical()), payload, ttl)
                .await?;
        }
        debug!(count = snapshots.len(), ttl, "snapshot cache written back to redis");
        Ok(())
    }

    pub fn stats(&self) -> SnapshotCacheStats {
        let c = self.counters.lock();
        SnapshotCacheStats {
            single_flight_hits: c.single_flight_hits,
            cache_hits: c.cache_hits,
            redis_hits: c.redis_hits,
            cache_misses: c.cache_misses,
            inflight: self.inflight.try_lock().map(|m| m.len()).unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Segment;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingSource {
        calls: AtomicU32,
    }

    #[async_trait]
    impl SnapshotSource for CountingSource {
        async fn fetch(&self, keys: &[InstrumentKey]) -> anyhow::Result<Vec<Snapshot>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(keys
                .iter()
                .map(|k| Snapshot {
                    key: k.clone(),
                    ltp: 100.0,
                    prev_close: 99.0,
                    as_of_ms: 0,
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn fetches_from_source_on_cold_cache() {
        let source = Arc::new(CountingSource {
            calls: AtomicU32::new(0),
        });
        let cache = SnapshotCache::new(None, source.clone(), 5);
        let key = InstrumentKey::new(Segment::NseEq, "1");
        let snaps = cache.get(&[key.clone()]).await.unwrap();
        assert_eq!(snaps[0].ltp, 100.0);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn warm_cache_avoids_second_fetch() {
        let source = Arc::new(CountingSource {
            calls: AtomicU32::new(0),
        });
        let cache = SnapshotCache::new(None, source.clone(), 5);
        let key = InstrumentKey::new(Segment::NseEq, "1");
        cache.get(&[key.clone()]).await.unwrap();
        cache.get(&[key.clone()]).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().cache_hits, 1);
    }

    #[tokio::test]
    async fn concurrent_misses_coalesce_into_one_fetch() {
        let source = Arc::new(CountingSource {
            calls: AtomicU32::new(0),
        });
        let cache = Arc::new(SnapshotCache::new(None, source.clone(), 5));
        let key = InstrumentKey::new(Segment::NseEq, "1");

        let mut handles = Vec::new();
        for _ in 0..5 {
            let cache = Arc::clone(&cache);
            let key = key.clone();
            handles.push(tokio::spawn(async move { cache.get(&[key]).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }
}
