// =============================================================================
// C6 — Market Feed Supervisor
// =============================================================================
//
// Owns the broker adapter (C2). Runs a reconnect loop with exponential
// backoff and trips a circuit breaker after repeated failures, the same
// shape as the reconnect-loop-with-sleep in the engine entrypoint, combined
// with the `RwLock<Inner>` double-checked-locking session-state pattern used
// for the daily risk reset.
// =============================================================================

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{error, info, warn};

use crate::market_data::broker::SharedBroker;
use crate::market_data::subscription::{RefcountTransition, SubscriptionRegistry};
use crate::market_data::tick_bus::TickBus;
use crate::types::InstrumentKey;

const BASE_BACKOFF_MS: u64 = 500;
const MAX_BACKOFF_MS: u64 = 30_000;
const CIRCUIT_TRIP_THRESHOLD: u32 = 5;
const CIRCUIT_RESET_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum SessionState {
    Connecting,
    Healthy,
    Degraded,
    CircuitOpen,
}

struct Inner {
    state: SessionState,
    consecutive_failures: u32,
}

pub struct MarketFeedSupervisor {
    broker: SharedBroker,
    registry: Arc<SubscriptionRegistry>,
    tick_bus: Arc<TickBus>,
    inner: RwLock<Inner>,
    min_safety_count: u32,
    reconnect_attempts: AtomicU32,
}

impl MarketFeedSupervisor {
    pub fn new(
        broker: SharedBroker,
        registry: Arc<SubscriptionRegistry>,
        tick_bus: Arc<TickBus>,
        min_safety_count: u32,
    ) -> Self {
        Self {
            broker,
            registry,
            tick_bus,
            inner: RwLock::new(Inner {
                state: SessionState::Connecting,
                consecutive_failures: 0,
            }),
            min_safety_count,
            reconnect_attempts: AtomicU32::new(0),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.read().state
    }

    /// Run forever: connect, resubscribe active instruments, poll ticks into
    /// the tick bus, and reconnect with backoff on failure. Intended to be
    /// spawned once at startup.
    pub async fn run(self: Arc<Self>) {
        loop {
            match self.connect_and_resubscribe().await {
                Ok(()) => {
                    self.mark_healthy();
                    self.poll_loop().await;
                    // poll_loop only returns when the broker disconnects.
                    warn!("market feed disconnected, will reconnect");
                }
                Err(e) => {
                    error!(error = %e, "market feed connect failed");
                }
            }

            if self.trip_or_backoff().await {
                return;
            }
        }
    }

    async fn connect_and_resubscribe(&self) -> anyhow::Result<()> {
        self.broker.connect().await?;
        for key in self.registry.active_keys() {
            self.broker.subscribe(&key).await?;
        }
        Ok(())
    }

    fn mark_healthy(&self) {
        let mut inner = self.inner.write();
        inner.state = SessionState::Healthy;
        inner.consecutive_failures = 0;
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        info!("market feed healthy");
    }

    async fn poll_loop(&self) {
        let mut ticker = tokio::time::interval(Duration::from_millis(200));
        loop {
            ticker.tick().await;
            if !self.broker.is_connected() {
                return;
            }
            for tick in self.broker.poll_ticks().await {
                self.tick_bus.publish(tick);
            }
            self.tick_bus.dispatch_pending().await;
        }
    }

    /// Returns `true` if the caller should stop retrying entirely (it never
    /// does for this engine, but the circuit breaker still gates the sleep
    /// duration and logs the degraded state).
    async fn trip_or_backoff(&self) -> bool {
        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;

        {
            let mut inner = self.inner.write();
            inner.consecutive_failures += 1;
            if inner.consecutive_failures >= CIRCUIT_TRIP_THRESHOLD {
                inner.state = SessionState::CircuitOpen;
                warn!(
                    failures = inner.consecutive_failures,
                    "circuit breaker open — backing off"
                );
            } else {
                inner.state = SessionState::Degraded;
            }
        }

        let backoff_ms = if self.state() == SessionState::CircuitOpen {
            CIRCUIT_RESET_SECS * 1000
        } else {
            (BASE_BACKOFF_MS * 2u64.saturating_pow(attempt.min(6))).min(MAX_BACKOFF_MS)
        };

        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        false
    }

    /// Registers a client's interest in `key` and, only on the 0→1
    /// transition, subscribes it with the broker. Returns the transition so
    /// the caller can report whether the key was newly added.
    pub async fn subscribe_key(&self, key: &InstrumentKey) -> anyhow::Result<RefcountTransition> {
        let transition = self.registry.subscribe(key);
        if transition == RefcountTransition::NowActive {
            self.broker.subscribe(key).await?;
            info!(key = %key, "subscribed upstream");
        }
        Ok(transition)
    }

    /// Releases a client's interest in `key` and, only on the last-ref-drops
    /// transition, unsubscribes it with the broker.
    pub async fn unsubscribe_key(&self, key: &InstrumentKey) -> anyhow::Result<RefcountTransition> {
        let transition = self.registry.unsubscribe(key);
        if transition == RefcountTransition::NowInactive {
            self.broker.unsubscribe(key).await?;
            info!(key = %key, "unsubscribed upstream");
        }
        Ok(transition)
    }

    pub fn is_degraded(&self) -> bool {
        let count = self.registry.active_count() as u32;
        count > 0 && self.registry.active_count() < self.min_safety_count as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::broker::SimulatedBroker;

    #[tokio::test]
    async fn starts_in_connecting_state() {
        let sup = MarketFeedSupervisor::new(
            Arc::new(SimulatedBroker::new()),
            Arc::new(SubscriptionRegistry::new()),
            Arc::new(TickBus::new()),
            1,
        );
        assert_eq!(sup.state(), SessionState::Connecting);
    }

    #[tokio::test]
    async fn connect_and_resubscribe_succeeds_with_no_subscriptions() {
        let sup = MarketFeedSupervisor::new(
            Arc::new(SimulatedBroker::new()),
            Arc::new(SubscriptionRegistry::new()),
            Arc::new(TickBus::new()),
            1,
        );
        sup.connect_and_resubscribe().await.unwrap();
    }

    #[tokio::test]
    async fn subscribe_key_only_hits_broker_on_first_ref() {
        let sup = MarketFeedSupervisor::new(
            Arc::new(SimulatedBroker::new()),
            Arc::new(SubscriptionRegistry::new()),
            Arc::new(TickBus::new()),
            1,
        );
        sup.broker.connect().await.unwrap();
        let key = crate::types::InstrumentKey::new(crate::types::Segment::NseEq, "1");

        assert_eq!(sup.subscribe_key(&key).await.unwrap(), RefcountTransition::NowActive);
        assert_eq!(sup.subscribe_key(&key).await.unwrap(), RefcountTransition::Unchanged);
        assert_eq!(sup.unsubscribe_key(&key).await.unwrap(), RefcountTransition::Unchanged);
        assert_eq!(sup.unsubscribe_key(&key).await.unwrap(), RefcountTransition::NowInactive);
    }

    #[tokio::test]
    async fn mark_healthy_resets_failure_counters() {
        let sup = MarketFeedSupervisor::new(
            Arc::new(SimulatedBroker::new()),
            Arc::new(SubscriptionRegistry::new()),
            Arc::new(TickBus::new()),
            1,
        );
        {
            let mut inner = sup.inner.write();
            inner.consecutive_failures = 3;
        }
        sup.mark_healthy();
        assert_eq!(sup.state(), SessionState::Healthy);
        assert_eq!(sup.inner.read().consecutive_failures, 0);
    }
}
