// =============================================================================
// C3 — Tick Bus
// =============================================================================
//
// In-process pub-sub of normalized ticks. Keeps only the latest tick per
// symbol between dispatch cycles (latest-wins backpressure) so a burst from
// the broker adapter never queues unbounded work for slow handlers.
//
// Handler dispatch happens off a spawned task per handler per cycle: a panic
// inside one handler becomes a `JoinError` that is logged and discarded, and
// never reaches the dispatch loop or any other handler.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::types::{InstrumentKey, NormalizedTick};

pub type TickHandler = Arc<dyn Fn(NormalizedTick) + Send + Sync>;

#[derive(Debug, Default)]
pub struct TickBusStats {
    pub published: AtomicU64,
    pub coalesced: AtomicU64,
    pub dispatched: AtomicU64,
    pub handler_panics: AtomicU64,
}

impl TickBusStats {
    pub fn snapshot(&self) -> TickBusStatsSnapshot {
        TickBusStatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            handler_panics: self.handler_panics.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct TickBusStatsSnapshot {
    pub published: u64,
    pub coalesced: u64,
    pub dispatched: u64,
    pub handler_panics: u64,
}

/// Latest-wins tick pub-sub with a panic-isolated handler registry.
pub struct TickBus {
    pending: RwLock<HashMap<InstrumentKey, NormalizedTick>>,
    handlers: RwLock<Vec<TickHandler>>,
    stats: TickBusStats,
}

impl Default for TickBus {
    fn default() -> Self {
        Self::new()
    }
}

impl TickBus {
    pub fn new() -> Self {
        Self {
            pending: RwLock::new(HashMap::new()),
            handlers: RwLock::new(Vec::new()),
            stats: TickBusStats::default(),
        }
    }

    pub fn register_handler(&self, handler: TickHandler) {
        self.handlers.write().push(handler);
    }

    /// Publish a tick. If a tick for the same symbol is already pending
    /// dispatch, it is overwritten — the bus only ever carries the latest
    /// value forward, never a queue.
    pub fn publish(&self, tick: NormalizedTick) {
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        let mut pending = self.pending.write();
        if pending.insert(tick.key.clone(), tick).is_some() {
            self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drain all pending ticks and dispatch each to every registered
    /// handler, spawning one task per (handler, tick) pair so a panicking
    /// handler cannot take down the dispatch loop or its siblings.
    pub async fn dispatch_pending(&self) {
        let drained: Vec<NormalizedTick> = {
            let mut pending = self.pending.write();
            pending.drain().map(|(_, v)| v).collect()
        };

        if drained.is_empty() {
            return;
        }

        let handlers = self.handlers.read().clone();
        let mut joins = Vec::with_capacity(drained.len() * handlers.len());

        for tick in drained {
            for handler in &handlers {
                let handler = Arc::clone(handler);
                let tick = tick.clone();
                joins.push(tokio::spawn(async move {
                    handler(tick);
                }));
            }
        }

        for join in joins {
            self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = join.await {
                self.stats.handler_panics.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "tick bus handler panicked");
            }
        }
    }

    pub fn stats(&self) -> TickBusStatsSnapshot {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Segment;
    use std::sync::atomic::AtomicUsize;

    fn tick(token: &str) -> NormalizedTick {
        NormalizedTick {
            key: InstrumentKey::new(Segment::NseEq, token),
            ltp: 100.0,
            volume: 1,
            bid: None,
            ask: None,
            exchange_ts_ms: 0,
            ingest_ts_ms: 0,
        }
    }

    #[test]
    fn publishing_same_symbol_twice_coalesces() {
        let bus = TickBus::new();
        bus.publish(tick("1"));
        bus.publish(tick("1"));
        assert_eq!(bus.stats().coalesced, 1);
        assert_eq!(bus.pending.read().len(), 1);
    }

    #[tokio::test]
    async fn dispatch_calls_every_handler() {
        let bus = TickBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c1 = Arc::clone(&count);
        bus.register_handler(Arc::new(move |_tick| {
            c1.fetch_add(1, Ordering::SeqCst);
        }));
        let c2 = Arc::clone(&count);
        bus.register_handler(Arc::new(move |_tick| {
            c2.fetch_add(1, Ordering::SeqCst);
        }));

        bus.publish(tick("1"));
        bus.dispatch_pending().await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(bus.stats().dispatched, 2);
    }

    #[tokio::test]
    async fn panicking_handler_is_isolated() {
        let bus = TickBus::new();
        bus.register_handler(Arc::new(|_tick| panic!("boom")));
        let count = Arc::new(AtomicUsize::new(0));
        let c1 = Arc::clone(&count);
        bus.register_handler(Arc::new(move |_tick| {
            c1.fetch_add(1, Ordering::SeqCst);
        }));

        bus.publish(tick("1"));
        bus.dispatch_pending().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.stats().handler_panics, 1);
    }

    #[tokio::test]
    async fn dispatch_with_no_pending_ticks_is_noop() {
        let bus = TickBus::new();
        bus.dispatch_pending().await;
        assert_eq!(bus.stats().dispatched, 0);
    }
}
