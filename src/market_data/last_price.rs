// =============================================================================
// Last-known-price feed for the Snapshot Cache
// =============================================================================
//
// There is no external quote vendor to call out to for C8's upstream fetch —
// this engine only ever marks against its own tick bus. `LastPriceSource`
// subscribes to the tick bus the same way the Fanout Server does and keeps a
// per-symbol last-price map that the Snapshot Cache falls back to on a miss.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::market_data::tick_bus::TickBus;
use crate::snapshot_cache::{Snapshot, SnapshotSource};
use crate::types::{InstrumentKey, NormalizedTick};

#[derive(Default)]
pub struct LastPriceSource {
    prices: RwLock<HashMap<InstrumentKey, Snapshot>>,
}

impl LastPriceSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach_to_tick_bus(self: &Arc<Self>, bus: &TickBus) {
        let source = Arc::clone(self);
        bus.register_handler(Arc::new(move |tick: NormalizedTick| {
            source.record(&tick);
        }));
    }

    fn record(&self, tick: &NormalizedTick) {
        let mut prices = self.prices.write();
        let prev_close = prices.get(&tick.key).map(|s| s.prev_close).unwrap_or(tick.ltp);
        prices.insert(
            tick.key.clone(),
            Snapshot {
                key: tick.key.clone(),
                ltp: tick.ltp,
                prev_close,
                as_of_ms: tick.exchange_ts_ms,
            },
        );
    }
}

#[async_trait]
impl SnapshotSource for LastPriceSource {
    async fn fetch(&self, keys: &[InstrumentKey]) -> anyhow::Result<Vec<Snapshot>> {
        let prices = self.prices.read();
        Ok(keys.iter().filter_map(|k| prices.get(k).cloned()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Segment;

    fn tick(token: &str, ltp: f64) -> NormalizedTick {
        NormalizedTick {
            key: InstrumentKey::new(Segment::NseEq, token),
            ltp,
            volume: 1,
            bid: None,
            ask: None,
            exchange_ts_ms: 1_700_000_000_000,
            ingest_ts_ms: 1_700_000_000_000,
        }
    }

    #[tokio::test]
    async fn fetch_returns_last_recorded_price() {
        let source = Arc::new(LastPriceSource::new());
        source.record(&tick("1", 101.5));
        let out = source
            .fetch(&[InstrumentKey::new(Segment::NseEq, "1")])
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].ltp, 101.5);
    }

    #[tokio::test]
    async fn fetch_skips_unknown_keys() {
        let source = Arc::new(LastPriceSource::new());
        let out = source
            .fetch(&[InstrumentKey::new(Segment::NseEq, "nope")])
            .await
            .unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn prev_close_carries_forward_across_updates() {
        let source = Arc::new(LastPriceSource::new());
        source.record(&tick("1", 100.0));
        source.record(&tick("1", 105.0));
        let out = source
            .fetch(&[InstrumentKey::new(Segment::NseEq, "1")])
            .await
            .unwrap();
        assert_eq!(out[0].ltp, 105.0);
        assert_eq!(out[0].prev_close, 100.0);
    }
}
