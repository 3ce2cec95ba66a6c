//! `SignalCache` — a FIFO queue of `SignalEvent` between `MasterStream` and
//! the `Translator`. Guarded by a mutex plus a `Notify`, even though only one
//! producer exists today: the mutex protects the queue, `Notify` wakes the
//! single consumer.

use std::collections::{HashMap, VecDeque};

use tokio::sync::{Mutex, Notify};

use super::messages::SignalEvent;
use super::types::PosSide;

struct Inner {
    events: VecDeque<SignalEvent>,
    last_raw: HashMap<(String, PosSide), std::collections::HashMap<String, serde_json::Value>>,
}

pub struct SignalCache {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl Default for SignalCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                events: VecDeque::new(),
                last_raw: HashMap::new(),
            }),
            notify: Notify::new(),
        }
    }

    /// Appends `ev`, updates the `(symbol, side)` raw snapshot when a side is
    /// present, and wakes the consumer.
    pub async fn push_event(&self, ev: SignalEvent) {
        let mut inner = self.inner.lock().await;
        if let Some(side) = ev.pos_side {
            inner
                .last_raw
                .insert((ev.symbol.clone(), side), ev.raw.clone());
        }
        inner.events.push_back(ev);
        self.notify.notify_one();
    }

    /// Drains the whole queue atomically. Returns an empty vec if nothing is
    /// pending; callers should await `notified()` before calling again.
    pub async fn pop_events(&self) -> Vec<SignalEvent> {
        let mut inner = self.inner.lock().await;
        inner.events.drain(..).collect()
    }

    pub async fn get_last_raw(
        &self,
        symbol: &str,
        side: PosSide,
    ) -> Option<std::collections::HashMap<String, serde_json::Value>> {
        let inner = self.inner.lock().await;
        inner.last_raw.get(&(symbol.to_string(), side)).cloned()
    }

    /// Suspends until a push has happened since the last drain. Consumers run
    /// `pop_events` in a `loop { notified().await; drain }` shape; a push that
    /// races the `notified()` call is still observed because `pop_events`
    /// always drains everything currently queued.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::messages::SignalEventType;

    fn ev(symbol: &str, side: Option<PosSide>) -> SignalEvent {
        SignalEvent {
            symbol: symbol.to_string(),
            pos_side: side,
            event_type: SignalEventType::LimitPlaced,
            ts_ms: 0,
            raw: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_push_then_pop_drains_all() {
        let cache = SignalCache::new();
        cache.push_event(ev("BTC_USDT", Some(PosSide::Long))).await;
        cache.push_event(ev("ETH_USDT", Some(PosSide::Short))).await;
        let drained = cache.pop_events().await;
        assert_eq!(drained.len(), 2);
        let again = cache.pop_events().await;
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_last_raw_tracks_latest_per_symbol_side() {
        let cache = SignalCache::new();
        cache.push_event(ev("BTC_USDT", Some(PosSide::Long))).await;
        let raw = cache.get_last_raw("BTC_USDT", PosSide::Long).await;
        assert!(raw.is_some());
        assert!(cache.get_last_raw("BTC_USDT", PosSide::Short).await.is_none());
    }

    #[tokio::test]
    async fn test_event_without_side_is_queued_but_not_indexed() {
        let cache = SignalCache::new();
        cache.push_event(ev("BTC_USDT", None)).await;
        assert_eq!(cache.pop_events().await.len(), 1);
        assert!(cache.get_last_raw("BTC_USDT", PosSide::Long).await.is_none());
    }
}
