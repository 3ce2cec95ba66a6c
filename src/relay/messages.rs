//! Wire-level and pipeline-level message types: the `SignalEvent` produced by
//! `MasterStream`, the canonical `MasterEvent` produced by the translator, and
//! the payload fields threaded between them.

use std::collections::HashMap;

use serde_json::Value;

use super::types::PosSide;

/// Raw event taxonomy classified out of the master WS stream. Immutable once
/// pushed onto the `SignalCache`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEventType {
    LimitPlaced,
    LimitFilled,
    MarketFilled,
    TriggerFilled,
    OrderCancelled,
    OrderInvalid,
    OcoAttached,
    PositionOpened,
    PositionClosed,
    PlanOrder,
    PlanExecuted,
    PlanCancelled,
    Deal,
}

/// A normalized event pulled off the master's authenticated WS stream.
#[derive(Debug, Clone)]
pub struct SignalEvent {
    pub symbol: String,
    pub pos_side: Option<PosSide>,
    pub event_type: SignalEventType,
    pub ts_ms: i64,
    pub raw: HashMap<String, Value>,
}

/// The signal's provenance: an organic copy of the master's action, or a
/// synthetic event produced by the command bus (e.g. manual close).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigType {
    Copy,
    Manual,
}

/// Canonical event emitted by the translator and consumed by the executor
/// fan-out. `payload` carries the exchange-provided fields needed to build a
/// per-follower `OrderIntent`.
#[derive(Debug, Clone)]
pub struct MasterEvent {
    pub event: MasterEventKind,
    pub method: super::types::OrderMethod,
    pub symbol: String,
    pub pos_side: Option<PosSide>,
    pub closed: bool,
    pub payload: MasterEventPayload,
    pub sig_type: SigType,
    pub ts_ms: i64,
    /// Manual-close events are bound to exactly one follower.
    pub cid: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterEventKind {
    Buy,
    Sell,
    Canceled,
}

/// The fields a translator rule may populate; `IntentFactory` reads these to
/// resolve sizing, leverage and price. Every field is optional because
/// different event kinds populate a different subset.
#[derive(Debug, Clone, Default)]
pub struct MasterEventPayload {
    pub order_id: Option<String>,
    pub qty: Option<f64>,
    pub price: Option<f64>,
    pub leverage: Option<i64>,
    pub open_type: Option<i64>,
    pub reduce_only: bool,
    pub tp_price: Option<f64>,
    pub sl_price: Option<f64>,
    pub trigger_price: Option<f64>,
    pub exec_ts: Option<i64>,
    pub trigger_exec: Option<i64>,
}
