// =============================================================================
// C2 — Broker Adapter
// =============================================================================
//
// One upstream connection, normalized into `NormalizedTick`s. The concrete
// upstream wire format is explicitly out of scope for this engine, so the
// adapter is a trait object; `SimulatedBroker` is the paper-trading
// implementation actually wired up in `main.rs`, generating synthetic ticks
// so the rest of the pipeline is exercisable without network access.
//
// The connect/read-loop shape below mirrors `run_kline_stream` in the
// candle-buffer module this is generalized from: connect, loop reading
// frames, return `Ok(())` on stream end so the supervisor can reconnect.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, info};

use crate::types::{InstrumentKey, NormalizedTick};

#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    /// Establish the upstream connection. Idempotent if already connected.
    async fn connect(&self) -> Result<()>;

    /// Tear down the upstream connection.
    async fn disconnect(&self);

    /// Subscribe to one instrument's feed.
    async fn subscribe(&self, key: &InstrumentKey) -> Result<()>;

    /// Unsubscribe from one instrument's feed.
    async fn unsubscribe(&self, key: &InstrumentKey) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Remaining milliseconds of a post-auth-failure cooldown, 0 if none.
    fn auth_cooldown_remaining_ms(&self) -> i64;

    /// Pull the next batch of normalized ticks produced since the last call.
    /// Returns an empty vec rather than blocking if nothing is ready.
    async fn poll_ticks(&self) -> Vec<NormalizedTick>;
}

/// Deterministic-ish synthetic tick generator for paper trading: walks each
/// subscribed instrument's price with a small random step every poll.
pub struct SimulatedBroker {
    connected: AtomicBool,
    cooldown_until_ms: AtomicI64,
    subscriptions: parking_lot::RwLock<std::collections::HashMap<InstrumentKey, f64>>,
}

impl Default for SimulatedBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBroker {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            cooldown_until_ms: AtomicI64::new(0),
            subscriptions: parking_lot::RwLock::new(std::collections::HashMap::new()),
        }
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

#[async_trait]
impl BrokerAdapter for SimulatedBroker {
    async fn connect(&self) -> Result<()> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("simulated broker connected");
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        info!("simulated broker disconnected");
    }

    async fn subscribe(&self, key: &InstrumentKey) -> Result<()> {
        let mut subs = self.subscriptions.write();
        subs.entry(key.clone()).or_insert(100.0);
        debug!(key = %key, "simulated broker subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, key: &InstrumentKey) -> Result<()> {
        self.subscriptions.write().remove(key);
        debug!(key = %key, "simulated broker unsubscribed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn auth_cooldown_remaining_ms(&self) -> i64 {
        let until = self.cooldown_until_ms.load(Ordering::SeqCst);
        (until - Self::now_ms()).max(0)
    }

    async fn poll_ticks(&self) -> Vec<NormalizedTick> {
        if !self.is_connected() {
            return Vec::new();
        }

        let now = Self::now_ms();
        let mut out = Vec::new();
        let mut subs = self.subscriptions.write();
        for (key, price) in subs.iter_mut() {
            let step: f64 = rand::thread_rng().gen_range(-0.5..0.5);
            *price = (*price + step).max(0.05);
            out.push(NormalizedTick {
                key: key.clone(),
                ltp: *price,
                volume: rand::thread_rng().gen_range(1..500),
                bid: Some(*price - 0.05),
                ask: Some(*price + 0.05),
                exchange_ts_ms: now,
                ingest_ts_ms: now,
            });
        }
        out
    }
}

pub type SharedBroker = Arc<dyn BrokerAdapter>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Segment;

    #[tokio::test]
    async fn connect_then_subscribe_produces_ticks() {
        let broker = SimulatedBroker::new();
        broker.connect().await.unwrap();
        let key = InstrumentKey::new(Segment::NseEq, "1");
        broker.subscribe(&key).await.unwrap();

        let ticks = broker.poll_ticks().await;
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].key, key);
    }

    #[tokio::test]
    async fn unsubscribed_symbol_stops_producing_ticks() {
        let broker = SimulatedBroker::new();
        broker.connect().await.unwrap();
        let key = InstrumentKey::new(Segment::NseEq, "1");
        broker.subscribe(&key).await.unwrap();
        broker.unsubscribe(&key).await.unwrap();

        let ticks = broker.poll_ticks().await;
        assert!(ticks.is_empty());
    }

    #[tokio::test]
    async fn disconnected_broker_produces_no_ticks() {
        let broker = SimulatedBroker::new();
        assert!(!broker.is_connected());
        let ticks = broker.poll_ticks().await;
        assert!(ticks.is_empty());
    }
}
