// =============================================================================
// C4 — Candle Engine
// =============================================================================
//
// Aggregates normalized ticks into OHLCV candles per (instrument, interval).
// Buckets align to IST — India does not observe DST, so IST is a fixed
// UTC+5:30 offset and bucket math never has to account for a shifting clock.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::debug;

use crate::types::{Candle, InstrumentKey, NormalizedTick};

/// IST is UTC+5:30, year round.
const IST_OFFSET_MS: i64 = (5 * 3600 + 30 * 60) * 1000;

/// Intervals (seconds) the engine maintains candles for.
pub const SUPPORTED_INTERVALS: &[u32] = &[60, 300, 900, 3600];

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct CandleKey {
    key: InstrumentKey,
    interval_secs: u32,
}

#[derive(Debug, Default)]
pub struct CandleEngineStats {
    pub late_ticks_dropped: AtomicU64,
}

impl CandleEngineStats {
    pub fn snapshot(&self) -> CandleEngineStatsSnapshot {
        CandleEngineStatsSnapshot {
            late_ticks_dropped: self.late_ticks_dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct CandleEngineStatsSnapshot {
    pub late_ticks_dropped: u64,
}

/// Ring-buffer-like per-(symbol, interval) candle store. Only the
/// currently-open candle is mutated in place; once a tick crosses into the
/// next bucket the open candle is closed, emitted, and a new one begun. A
/// tick whose bucket falls behind the currently open one arrived out of
/// order — it is dropped rather than reopening a bucket that already
/// closed, since nothing downstream expects a closed candle to mutate.
pub struct CandleEngine {
    inner: RwLock<HashMap<CandleKey, Candle>>,
    max_history: usize,
    history: RwLock<HashMap<CandleKey, Vec<Candle>>>,
    stats: CandleEngineStats,
}

impl CandleEngine {
    pub fn new(max_history: usize) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            max_history,
            history: RwLock::new(HashMap::new()),
            stats: CandleEngineStats::default(),
        }
    }

    pub fn stats(&self) -> CandleEngineStatsSnapshot {
        self.stats.snapshot()
    }

    fn bucket_start_ms(ts_ms: i64, interval_secs: u32) -> i64 {
        let ist_ts = ts_ms + IST_OFFSET_MS;
        let interval_ms = interval_secs as i64 * 1000;
        let bucket_ist = (ist_ts / interval_ms) * interval_ms;
        bucket_ist - IST_OFFSET_MS
    }

    /// Feed one normalized tick in. Returns any candle that was just closed
    /// as a result (so the caller can fan it out over C7), for every
    /// configured interval.
    pub fn ingest(&self, tick: &NormalizedTick) -> Vec<Candle> {
        let mut closed = Vec::new();
        let mut inner = self.inner.write();

        for &interval_secs in SUPPORTED_INTERVALS {
            let ck = CandleKey {
                key: tick.key.clone(),
                interval_secs,
            };
            let bucket_start = Self::bucket_start_ms(tick.exchange_ts_ms, interval_secs);

            match inner.get_mut(&ck) {
                Some(candle) if bucket_start == candle.open_ts_ms => {
                    candle.high = candle.high.max(tick.ltp);
                    candle.low = candle.low.min(tick.ltp);
                    candle.close = tick.ltp;
                    candle.volume += tick.volume;
                }
                Some(candle) if bucket_start < candle.open_ts_ms => {
                    self.stats.late_ticks_dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        key = %tick.key,
                        interval = interval_secs,
                        tick_ts = tick.exchange_ts_ms,
                        open_ts = candle.open_ts_ms,
                        "dropping late tick that arrived after its bucket closed"
                    );
                }
                Some(candle) => {
                    let mut finished = candle.clone();
                    finished.closed = true;
                    debug!(key = %tick.key, interval = interval_secs, "candle closed");

                    let fresh = Candle {
                        key: tick.key.clone(),
                        interval_secs,
                        open_ts_ms: bucket_start,
                        open: tick.ltp,
                        high: tick.ltp,
                        low: tick.ltp,
                        close: tick.ltp,
                        volume: tick.volume,
                        closed: false,
                    };
                    *candle = fresh;
                    self.push_history(ck, finished.clone());
                    closed.push(finished);
                }
                None => {
                    inner.insert(
                        ck,
                        Candle {
                            key: tick.key.clone(),
                            interval_secs,
                            open_ts_ms: bucket_start,
                            open: tick.ltp,
                            high: tick.ltp,
                            low: tick.ltp,
                            close: tick.ltp,
                            volume: tick.volume,
                            closed: false,
                        },
                    );
                }
            }
        }

        closed
    }

    fn push_history(&self, ck: CandleKey, candle: Candle) {
        let mut history = self.history.write();
        let buf = history.entry(ck).or_default();
        buf.push(candle);
        if buf.len() > self.max_history {
            let excess = buf.len() - self.max_history;
            buf.drain(0..excess);
        }
    }

    /// Currently in-progress candle for a (symbol, interval), if any.
    pub fn current(&self, key: &InstrumentKey, interval_secs: u32) -> Option<Candle> {
        let ck = CandleKey {
            key: key.clone(),
            interval_secs,
        };
        self.inner.read().get(&ck).cloned()
    }

    /// Closed candle history, oldest first, capped at `max_history`.
    pub fn history(&self, key: &InstrumentKey, interval_secs: u32) -> Vec<Candle> {
        let ck = CandleKey {
            key: key.clone(),
            interval_secs,
        };
        self.history.read().get(&ck).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Segment;

    fn tick(token: &str, ts_ms: i64, ltp: f64, vol: u64) -> NormalizedTick {
        NormalizedTick {
            key: InstrumentKey::new(Segment::NseEq, token),
            ltp,
            volume: vol,
            bid: None,
            ask: None,
            exchange_ts_ms: ts_ms,
            ingest_ts_ms: ts_ms,
        }
    }

    #[test]
    fn first_tick_opens_a_candle() {
        let engine = CandleEngine::new(100);
        let closed = engine.ingest(&tick("1", 1_700_000_000_000, 100.0, 10));
        assert!(closed.is_empty());
        let c = engine
            .current(&InstrumentKey::new(Segment::NseEq, "1"), 60)
            .unwrap();
        assert_eq!(c.open, 100.0);
        assert_eq!(c.high, 100.0);
        assert_eq!(c.volume, 10);
        assert!(!c.closed);
    }

    #[test]
    fn ticks_within_bucket_update_high_low_close() {
        let engine = CandleEngine::new(100);
        let base = 1_700_000_000_000;
        engine.ingest(&tick("1", base, 100.0, 10));
        engine.ingest(&tick("1", base + 5_000, 105.0, 5));
        engine.ingest(&tick("1", base + 10_000, 95.0, 5));
        let c = engine
            .current(&InstrumentKey::new(Segment::NseEq, "1"), 60)
            .unwrap();
        assert_eq!(c.high, 105.0);
        assert_eq!(c.low, 95.0);
        assert_eq!(c.close, 95.0);
        assert_eq!(c.volume, 20);
    }

    #[test]
    fn crossing_bucket_boundary_closes_and_opens() {
        let engine = CandleEngine::new(100);
        let base = CandleEngine::bucket_start_ms(1_700_000_000_000, 60);
        engine.ingest(&tick("1", base, 100.0, 1));
        let closed = engine.ingest(&tick("1", base + 61_000, 110.0, 1));
        let closed_60 = closed.iter().find(|c| c.interval_secs == 60).unwrap();
        assert!(closed_60.closed);
        assert_eq!(closed_60.open, 100.0);

        let current = engine
            .current(&InstrumentKey::new(Segment::NseEq, "1"), 60)
            .unwrap();
        assert_eq!(current.open, 110.0);
        assert!(!current.closed);
    }

    #[test]
    fn late_tick_is_dropped_without_reopening_the_closed_bucket() {
        let engine = CandleEngine::new(100);
        let base = CandleEngine::bucket_start_ms(1_700_000_000_000, 60);
        engine.ingest(&tick("1", base, 100.0, 1));
        engine.ingest(&tick("1", base + 61_000, 110.0, 1));
        assert_eq!(engine.stats().late_ticks_dropped, 0);

        // Arrives after the bucket already rolled over to `base + 61_000`.
        let closed = engine.ingest(&tick("1", base + 5_000, 999.0, 1));
        let closed_60 = closed.iter().find(|c| c.interval_secs == 60);
        assert!(closed_60.is_none());

        let current = engine
            .current(&InstrumentKey::new(Segment::NseEq, "1"), 60)
            .unwrap();
        assert_eq!(current.open_ts_ms, base + 61_000);
        assert_eq!(current.close, 110.0);
        assert_eq!(engine.stats().late_ticks_dropped, 1);
    }

    #[test]
    fn history_trims_to_max() {
        let engine = CandleEngine::new(2);
        let base = CandleEngine::bucket_start_ms(1_700_000_000_000, 60);
        for i in 0..5 {
            engine.ingest(&tick("1", base + i * 61_000, 100.0 + i as f64, 1));
        }
        let hist = engine.history(&InstrumentKey::new(Segment::NseEq, "1"), 60);
        assert_eq!(hist.len(), 2);
    }
}
