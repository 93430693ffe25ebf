// =============================================================================
// C5 — Subscription Registry
// =============================================================================
//
// Ref-counted per-symbol subscription set, shared by every fanout client.
// Crossing 0→1 triggers an upstream subscribe; crossing 1→0 triggers an
// upstream unsubscribe. Encapsulated the way `OrderBookManager` encapsulates
// its map — no external caller ever touches the HashMap directly.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

use crate::types::InstrumentKey;

/// Outcome of a subscribe/unsubscribe call, telling the caller whether an
/// upstream action is now required.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefcountTransition {
    /// Ref count was 0, now 1 — caller must subscribe upstream.
    NowActive,
    /// Ref count changed but stayed above zero — no upstream action needed.
    Unchanged,
    /// Ref count dropped to 0 — caller must unsubscribe upstream.
    NowInactive,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    refcounts: RwLock<HashMap<InstrumentKey, u32>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, key: &InstrumentKey) -> RefcountTransition {
        let mut map = self.refcounts.write();
        let count = map.entry(key.clone()).or_insert(0);
        *count += 1;
        let transition = if *count == 1 {
            RefcountTransition::NowActive
        } else {
            RefcountTransition::Unchanged
        };
        debug!(key = %key, refcount = *count, "subscribed");
        transition
    }

    pub fn unsubscribe(&self, key: &InstrumentKey) -> RefcountTransition {
        let mut map = self.refcounts.write();
        let transition = match map.get_mut(key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                RefcountTransition::Unchanged
            }
            Some(_) => {
                map.remove(key);
                RefcountTransition::NowInactive
            }
            None => RefcountTransition::Unchanged,
        };
        debug!(key = %key, "unsubscribed");
        transition
    }

    pub fn is_active(&self, key: &InstrumentKey) -> bool {
        self.refcounts.read().contains_key(key)
    }

    pub fn active_keys(&self) -> Vec<InstrumentKey> {
        self.refcounts.read().keys().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.refcounts.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Segment;

    fn k(token: &str) -> InstrumentKey {
        InstrumentKey::new(Segment::NseEq, token)
    }

    #[test]
    fn first_subscribe_triggers_now_active() {
        let reg = SubscriptionRegistry::new();
        assert_eq!(reg.subscribe(&k("1")), RefcountTransition::NowActive);
        assert!(reg.is_active(&k("1")));
    }

    #[test]
    fn second_subscribe_is_unchanged() {
        let reg = SubscriptionRegistry::new();
        reg.subscribe(&k("1"));
        assert_eq!(reg.subscribe(&k("1")), RefcountTransition::Unchanged);
    }

    #[test]
    fn last_unsubscribe_triggers_now_inactive() {
        let reg = SubscriptionRegistry::new();
        reg.subscribe(&k("1"));
        reg.subscribe(&k("1"));
        assert_eq!(reg.unsubscribe(&k("1")), RefcountTransition::Unchanged);
        assert_eq!(reg.unsubscribe(&k("1")), RefcountTransition::NowInactive);
        assert!(!reg.is_active(&k("1")));
    }

    #[test]
    fn unsubscribe_unknown_key_is_noop() {
        let reg = SubscriptionRegistry::new();
        assert_eq!(reg.unsubscribe(&k("nope")), RefcountTransition::Unchanged);
    }

    #[test]
    fn active_keys_lists_all_subscribed() {
        let reg = SubscriptionRegistry::new();
        reg.subscribe(&k("1"));
        reg.subscribe(&k("2"));
        assert_eq!(reg.active_count(), 2);
        let mut keys = reg.active_keys();
        keys.sort_by_key(|k| k.token.clone());
        assert_eq!(keys[0].token, "1");
        assert_eq!(keys[1].token, "2");
    }
}
