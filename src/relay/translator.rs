//! Translator (`MasterPayload`): turns classified `SignalEvent`s into
//! canonical `MasterEvent`s. Owns the master's own `PositionVar` map purely
//! as a slot for attached TP/SL (consumed on next fill) and the
//! self-echo-suppression set for limit orders we placed ourselves.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::cache::SignalCache;
use super::messages::{MasterEvent, MasterEventKind, MasterEventPayload, SigType, SignalEvent, SignalEventType};
use super::position::{PositionVar, PositionVarMap};
use super::types::{OrderMethod, PosSide};

#[derive(Debug, Clone)]
pub struct TranslatorConfig {
    /// How long a self-placed limit order's id is remembered before eviction,
    /// in case the exchange never reports a fill for it.
    pub limit_intent_ttl: Duration,
    pub limit_intent_max_entries: usize,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            limit_intent_ttl: Duration::from_secs(3600),
            limit_intent_max_entries: 10_000,
        }
    }
}

impl TranslatorConfig {
    pub fn from_env() -> Self {
        let mut c = Self::default();
        if let Ok(v) = std::env::var("LIMIT_INTENT_TTL_SECS") {
            if let Ok(secs) = v.parse() {
                c.limit_intent_ttl = Duration::from_secs(secs);
            }
        }
        if let Ok(v) = std::env::var("LIMIT_INTENT_MAX_ENTRIES") {
            if let Ok(n) = v.parse() {
                c.limit_intent_max_entries = n;
            }
        }
        c
    }
}

/// Bounded-size, TTL-evicted set of order ids we placed ourselves. See
/// design note on self-echo suppression: an exchange that never reports a
/// fill for a placed limit order must not leak memory forever.
struct LimitIntentSet {
    entries: HashMap<String, Instant>,
    ttl: Duration,
    max_entries: usize,
}

impl LimitIntentSet {
    fn new(ttl: Duration, max_entries: usize) -> Self {
        Self { entries: HashMap::new(), ttl, max_entries }
    }

    fn insert(&mut self, order_id: String) {
        self.evict_expired();
        self.evict_oldest_if_needed();
        self.entries.insert(order_id, Instant::now());
    }

    /// Removes `order_id` if present, returning whether it was there.
    fn take(&mut self, order_id: &str) -> bool {
        self.evict_expired();
        self.entries.remove(order_id).is_some()
    }

    fn evict_expired(&mut self) {
        let ttl = self.ttl;
        self.entries.retain(|_, inserted| inserted.elapsed() < ttl);
    }

    fn evict_oldest_if_needed(&mut self) {
        if self.entries.len() < self.max_entries {
            return;
        }
        if let Some(oldest) = self.entries.iter().min_by_key(|(_, t)| **t).map(|(k, _)| k.clone()) {
            self.entries.remove(&oldest);
        }
    }
}

/// Pulls exchange timestamp fields and normalizes to ms. Values under `1e10`
/// are assumed second-granularity (valid through the year 2286 — noted, not
/// fixed, since nothing in this system outlives that).
fn extract_exchange_ts(raw: &HashMap<String, Value>) -> Option<i64> {
    for key in ["updateTime", "createTime", "timestamp", "time", "ts"] {
        if let Some(v) = raw.get(key).and_then(value_as_i64) {
            let ms = if v < 10_000_000_000 { v * 1000 } else { v };
            return Some(ms);
        }
    }
    None
}

fn value_as_i64(v: &Value) -> Option<i64> {
    v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

fn value_as_f64(v: &Value) -> Option<f64> {
    v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

fn get_f64(raw: &HashMap<String, Value>, key: &str) -> Option<f64> {
    raw.get(key).and_then(value_as_f64)
}

fn get_i64(raw: &HashMap<String, Value>, key: &str) -> Option<i64> {
    raw.get(key).and_then(value_as_i64)
}

fn get_str(raw: &HashMap<String, Value>, key: &str) -> Option<String> {
    raw.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn get_bool(raw: &HashMap<String, Value>, key: &str) -> bool {
    raw.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

pub struct Translator {
    cache: Arc<SignalCache>,
    out_tx: mpsc::Sender<MasterEvent>,
    limit_intents: LimitIntentSet,
    master_pv: PositionVarMap,
}

impl Translator {
    pub fn new(cfg: TranslatorConfig, cache: Arc<SignalCache>, out_tx: mpsc::Sender<MasterEvent>) -> Self {
        Self {
            cache,
            out_tx,
            limit_intents: LimitIntentSet::new(cfg.limit_intent_ttl, cfg.limit_intent_max_entries),
            master_pv: PositionVarMap::new(),
        }
    }

    pub async fn run(mut self) {
        debug!("translator started");
        loop {
            self.cache.notified().await;
            let events = self.cache.pop_events().await;
            for ev in events {
                self.handle(ev).await;
            }
        }
    }

    fn tech_ts_now() -> i64 {
        super::rest::now_ms()
    }

    fn resolve_ts(raw: &HashMap<String, Value>) -> i64 {
        let tech_ts = Self::tech_ts_now();
        match extract_exchange_ts(raw) {
            Some(exec_ts) => exec_ts.min(tech_ts),
            None => tech_ts,
        }
    }

    /// Pulls and clears the pending TP/SL slot for (symbol, pos_side), if any.
    fn take_attached(&mut self, symbol: &str, pos_side: PosSide) -> (Option<f64>, Option<f64>) {
        let pv = self
            .master_pv
            .entry(symbol.to_string())
            .or_default()
            .entry(pos_side)
            .or_insert_with(PositionVar::default);
        (pv.attached_tp.take(), pv.attached_sl.take())
    }

    async fn emit(&self, event: MasterEvent) {
        if self.out_tx.send(event).await.is_err() {
            warn!("out_queue closed, dropping translated event");
        }
    }

    async fn handle(&mut self, ev: SignalEvent) {
        match ev.event_type {
            SignalEventType::OcoAttached => {
                if let Some(side) = ev.pos_side {
                    let pv = self.master_pv.entry(ev.symbol.clone()).or_default().entry(side).or_default();
                    pv.attached_tp = get_f64(&ev.raw, "takeProfitPrice");
                    pv.attached_sl = get_f64(&ev.raw, "stopLossPrice");
                }
            }

            SignalEventType::MarketFilled => {
                let Some(side) = ev.pos_side else { return };
                let reduce_only = get_bool(&ev.raw, "reduceOnly");
                let emit_side = if reduce_only { side.opposite() } else { side };
                let (tp, sl) = self.take_attached(&ev.symbol, emit_side);
                let ts_ms = Self::resolve_ts(&ev.raw);
                self.emit(MasterEvent {
                    event: if reduce_only { MasterEventKind::Sell } else { MasterEventKind::Buy },
                    method: OrderMethod::Market,
                    symbol: ev.symbol.clone(),
                    pos_side: Some(emit_side),
                    closed: reduce_only,
                    payload: self.build_payload(&ev, tp, sl),
                    sig_type: SigType::Copy,
                    ts_ms,
                    cid: None,
                })
                .await;
            }

            SignalEventType::LimitFilled => {
                let Some(order_id) = get_str(&ev.raw, "orderId") else { return };
                if self.limit_intents.take(&order_id) {
                    // Echo of our own placement; consume and stay silent.
                    return;
                }
                let Some(side) = ev.pos_side else { return };
                let (tp, sl) = self.take_attached(&ev.symbol, side);
                let ts_ms = Self::resolve_ts(&ev.raw);
                self.emit(MasterEvent {
                    event: MasterEventKind::Buy,
                    method: OrderMethod::Limit,
                    symbol: ev.symbol.clone(),
                    pos_side: Some(side),
                    closed: false,
                    payload: self.build_payload(&ev, tp, sl),
                    sig_type: SigType::Copy,
                    ts_ms,
                    cid: None,
                })
                .await;
            }

            SignalEventType::LimitPlaced => {
                if let Some(order_id) = get_str(&ev.raw, "orderId") {
                    self.limit_intents.insert(order_id);
                }
                let Some(side) = ev.pos_side else { return };
                let (tp, sl) = self.take_attached(&ev.symbol, side);
                let ts_ms = Self::resolve_ts(&ev.raw);
                self.emit(MasterEvent {
                    event: MasterEventKind::Buy,
                    method: OrderMethod::Limit,
                    symbol: ev.symbol.clone(),
                    pos_side: Some(side),
                    closed: false,
                    payload: self.build_payload(&ev, tp, sl),
                    sig_type: SigType::Copy,
                    ts_ms,
                    cid: None,
                })
                .await;
            }

            SignalEventType::TriggerFilled => {
                let Some(side) = ev.pos_side else { return };
                let raw_side = get_i64(&ev.raw, "side").unwrap_or_default();
                let is_sell = !matches!(raw_side, 1 | 3);
                let reduce_only = get_bool(&ev.raw, "reduceOnly");
                let emit_side = if reduce_only { side.opposite() } else { side };
                let (tp, sl) = self.take_attached(&ev.symbol, emit_side);
                let ts_ms = Self::resolve_ts(&ev.raw);
                self.emit(MasterEvent {
                    event: if is_sell { MasterEventKind::Sell } else { MasterEventKind::Buy },
                    method: OrderMethod::Trigger,
                    symbol: ev.symbol.clone(),
                    pos_side: Some(emit_side),
                    closed: reduce_only,
                    payload: self.build_payload(&ev, tp, sl),
                    sig_type: SigType::Copy,
                    ts_ms,
                    cid: None,
                })
                .await;
            }

            SignalEventType::OrderCancelled | SignalEventType::OrderInvalid => {
                if let Some(order_id) = get_str(&ev.raw, "orderId") {
                    self.limit_intents.take(&order_id);
                    self.emit(MasterEvent {
                        event: MasterEventKind::Canceled,
                        method: OrderMethod::Limit,
                        symbol: ev.symbol.clone(),
                        pos_side: ev.pos_side,
                        closed: false,
                        payload: MasterEventPayload { order_id: Some(order_id), ..Default::default() },
                        sig_type: SigType::Copy,
                        ts_ms: Self::resolve_ts(&ev.raw),
                        cid: None,
                    })
                    .await;
                }
            }

            SignalEventType::PositionOpened
            | SignalEventType::PositionClosed
            | SignalEventType::PlanOrder
            | SignalEventType::PlanExecuted
            | SignalEventType::PlanCancelled
            | SignalEventType::Deal => {
                // Observability only; the core fan-out never reacts to these directly.
            }
        }
    }

    fn build_payload(&self, ev: &SignalEvent, tp: Option<f64>, sl: Option<f64>) -> MasterEventPayload {
        MasterEventPayload {
            order_id: get_str(&ev.raw, "orderId"),
            qty: get_f64(&ev.raw, "vol"),
            price: get_f64(&ev.raw, "price").or_else(|| get_f64(&ev.raw, "dealAvgPrice")).or_else(|| get_f64(&ev.raw, "avgPrice")),
            leverage: get_i64(&ev.raw, "leverage"),
            open_type: get_i64(&ev.raw, "openType"),
            reduce_only: get_bool(&ev.raw, "reduceOnly"),
            tp_price: tp,
            sl_price: sl,
            trigger_price: get_f64(&ev.raw, "triggerPrice"),
            exec_ts: extract_exchange_ts(&ev.raw),
            trigger_exec: get_i64(&ev.raw, "executeType"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn raw_map(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn make() -> (Translator, mpsc::Receiver<MasterEvent>) {
        let cache = Arc::new(SignalCache::new());
        let (tx, rx) = mpsc::channel(100);
        (Translator::new(TranslatorConfig::default(), cache, tx), rx)
    }

    #[tokio::test]
    async fn test_market_filled_emits_buy() {
        let (mut t, mut rx) = make();
        let ev = SignalEvent {
            symbol: "BTC_USDT".into(),
            pos_side: Some(PosSide::Long),
            event_type: SignalEventType::MarketFilled,
            ts_ms: 1_700_000_000_000,
            raw: raw_map(&[
                ("vol", Value::from(10)),
                ("price", Value::from("100")),
                ("reduceOnly", Value::from(false)),
                ("updateTime", Value::from(1_700_000_000_000i64)),
                ("orderId", Value::from("A")),
            ]),
        };
        t.handle(ev).await;
        let out = rx.try_recv().unwrap();
        assert_eq!(out.event, MasterEventKind::Buy);
        assert_eq!(out.method, OrderMethod::Market);
        assert!(!out.closed);
        assert_eq!(out.payload.qty, Some(10.0));
        assert!(out.ts_ms <= 1_700_000_000_000);
    }

    #[tokio::test]
    async fn test_market_filled_reduce_only_emits_sell_and_closed() {
        let (mut t, mut rx) = make();
        let ev = SignalEvent {
            symbol: "BTC_USDT".into(),
            pos_side: Some(PosSide::Long),
            event_type: SignalEventType::MarketFilled,
            ts_ms: 1_700_000_000_000,
            raw: raw_map(&[
                ("vol", Value::from(10)),
                ("price", Value::from("100")),
                ("reduceOnly", Value::from(true)),
                ("updateTime", Value::from(1_700_000_000_000i64)),
                ("orderId", Value::from("A")),
            ]),
        };
        t.handle(ev).await;
        let out = rx.try_recv().unwrap();
        assert_eq!(out.event, MasterEventKind::Sell);
        assert_eq!(out.method, OrderMethod::Market);
        assert!(out.closed);
        assert_eq!(out.pos_side, Some(PosSide::Short));
    }

    #[tokio::test]
    async fn test_self_placed_limit_is_deduped() {
        let (mut t, mut rx) = make();
        let placed = SignalEvent {
            symbol: "BTC_USDT".into(),
            pos_side: Some(PosSide::Long),
            event_type: SignalEventType::LimitPlaced,
            ts_ms: 1,
            raw: raw_map(&[("orderId", Value::from("L1"))]),
        };
        t.handle(placed).await;
        assert!(rx.try_recv().is_ok()); // limit_placed still emits as intent

        let filled = SignalEvent {
            symbol: "BTC_USDT".into(),
            pos_side: Some(PosSide::Long),
            event_type: SignalEventType::LimitFilled,
            ts_ms: 2,
            raw: raw_map(&[("orderId", Value::from("L1"))]),
        };
        t.handle(filled).await;
        assert!(rx.try_recv().is_err(), "echo of our own limit must not re-emit");
        assert!(!t.limit_intents.entries.contains_key("L1"));
    }

    #[tokio::test]
    async fn test_unknown_limit_fill_emits_event() {
        let (mut t, mut rx) = make();
        let filled = SignalEvent {
            symbol: "BTC_USDT".into(),
            pos_side: Some(PosSide::Long),
            event_type: SignalEventType::LimitFilled,
            ts_ms: 2,
            raw: raw_map(&[("orderId", Value::from("unknown"))]),
        };
        t.handle(filled).await;
        let out = rx.try_recv().unwrap();
        assert_eq!(out.method, OrderMethod::Limit);
    }

    #[tokio::test]
    async fn test_trigger_close_short_flips_to_long() {
        let (mut t, mut rx) = make();
        let ev = SignalEvent {
            symbol: "BTC_USDT".into(),
            pos_side: Some(PosSide::Short),
            event_type: SignalEventType::TriggerFilled,
            ts_ms: 1,
            raw: raw_map(&[("side", Value::from(1)), ("reduceOnly", Value::from(true))]),
        };
        t.handle(ev).await;
        let out = rx.try_recv().unwrap();
        assert_eq!(out.pos_side, Some(PosSide::Long));
        assert!(out.closed);
        assert_eq!(out.method, OrderMethod::Trigger);
    }

    #[tokio::test]
    async fn test_oco_attached_is_consumed_on_next_fill() {
        let (mut t, mut rx) = make();
        let oco = SignalEvent {
            symbol: "BTC_USDT".into(),
            pos_side: Some(PosSide::Long),
            event_type: SignalEventType::OcoAttached,
            ts_ms: 1,
            raw: raw_map(&[("takeProfitPrice", Value::from(110.0)), ("stopLossPrice", Value::from(90.0))]),
        };
        t.handle(oco).await;
        assert!(rx.try_recv().is_err(), "oco_attached is state, not a signal");

        let fill = SignalEvent {
            symbol: "BTC_USDT".into(),
            pos_side: Some(PosSide::Long),
            event_type: SignalEventType::MarketFilled,
            ts_ms: 2,
            raw: raw_map(&[("vol", Value::from(1)), ("reduceOnly", Value::from(false))]),
        };
        t.handle(fill).await;
        let out = rx.try_recv().unwrap();
        assert_eq!(out.payload.tp_price, Some(110.0));
        assert_eq!(out.payload.sl_price, Some(90.0));

        let (tp, sl) = t.take_attached("BTC_USDT", PosSide::Long);
        assert_eq!(tp, None);
        assert_eq!(sl, None);
    }

    #[tokio::test]
    async fn test_cancel_clears_limit_intent_and_emits() {
        let (mut t, mut rx) = make();
        t.limit_intents.insert("L9".to_string());
        let cancel = SignalEvent {
            symbol: "BTC_USDT".into(),
            pos_side: None,
            event_type: SignalEventType::OrderCancelled,
            ts_ms: 1,
            raw: raw_map(&[("orderId", Value::from("L9"))]),
        };
        t.handle(cancel).await;
        assert!(!t.limit_intents.entries.contains_key("L9"));
        let out = rx.try_recv().unwrap();
        assert_eq!(out.event, MasterEventKind::Canceled);
        assert_eq!(out.payload.order_id, Some("L9".to_string()));
    }

    #[test]
    fn test_limit_intent_set_evicts_oldest_over_capacity() {
        let mut set = LimitIntentSet::new(StdDuration::from_secs(3600), 2);
        set.insert("a".into());
        set.insert("b".into());
        set.insert("c".into());
        assert_eq!(set.entries.len(), 2);
        assert!(!set.entries.contains_key("a"));
    }
}
