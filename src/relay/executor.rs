//! Executor: per-(follower, symbol, pos_side) serialized order issuance.
//! The only serialization point is the `SymbolOrders` lock for that one
//! tuple — distinct tuples, and distinct followers, proceed fully in
//! parallel because `dispatch` never holds the runtime-wide lock across an
//! await; it operates on a snapshot of cloned handles instead.

use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use super::follower::{record_error_on, DispatchHandles, FollowerRuntime, OrderEntry, OrderStatus, SymbolOrders};
use super::intent::{IntentFactory, OrderIntent, SymbolSpec};
use super::messages::{MasterEvent, MasterEventKind, SigType};
use super::rest::{CreateOrderParams, CreateTriggerOrderParams};
use super::types::{ExchangeOrderSide, OpenType, TriggerType};

pub struct Executor;

impl Executor {
    /// Dispatches one `MasterEvent` against one follower. Never panics or
    /// propagates: every failure is recorded on the runtime and logged,
    /// because one bad follower must never block the others. `rt` is locked
    /// only to snapshot handles up front and, on failure, to record the
    /// error — never across the REST round-trip itself.
    pub async fn dispatch(rt: &Arc<AsyncMutex<FollowerRuntime>>, event: &MasterEvent, spec: &SymbolSpec) {
        let Some(pos_side) = event.pos_side else {
            warn!("{} :: dropped, event carries no position side", event.symbol);
            return;
        };

        let handles = {
            let guard = rt.lock().await;
            if !guard.config.enabled {
                return;
            }
            guard.dispatch_handles(&event.symbol, pos_side).await
        };

        if !handles.session.wait_ready(std::time::Duration::from_secs(5)).await {
            record_error_on(rt, "session not ready").await;
            warn!("{} {:?} :: dropped, session not ready", event.symbol, event.pos_side);
            return;
        }

        let mut orders = handles.symbol_orders.lock().await;

        if event.event == MasterEventKind::Canceled {
            let Some(order_id) = event.payload.order_id.clone() else { return };
            Self::handle_cancel(rt, &handles, &mut orders, &event.symbol, &order_id).await;
            return;
        }

        let pv_snapshot = {
            let pvs = handles.position_vars.lock().await;
            pvs.get(&event.symbol).and_then(|sides| sides.get(&pos_side)).cloned().unwrap_or_default()
        };

        let Some(intent) = IntentFactory::build(&handles.config, event, &pv_snapshot, spec) else {
            return;
        };

        if intent.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(intent.delay_ms)).await;
        }

        if event.closed {
            Self::issue_close(rt, &handles, &mut orders, event, &intent).await;
            return;
        }

        match intent.method {
            super::types::OrderMethod::Market | super::types::OrderMethod::Limit => {
                Self::issue_open(rt, &handles, &mut orders, event, &intent).await;
            }
            super::types::OrderMethod::Trigger => {
                Self::issue_trigger(rt, &handles, &mut orders, event, &intent).await;
            }
        }
    }

    async fn handle_cancel(
        rt: &Arc<AsyncMutex<FollowerRuntime>>,
        handles: &DispatchHandles,
        orders: &mut SymbolOrders,
        symbol: &str,
        master_oid: &str,
    ) {
        let (entry, is_trigger) = match orders.limit.remove(master_oid) {
            Some(e) => (Some(e), false),
            None => (orders.trigger.remove(master_oid), true),
        };
        let Some(entry) = entry else {
            info!("{symbol} :: CANCEL MISS master_oid={master_oid}");
            return;
        };
        let result = if is_trigger {
            handles.client.cancel_trigger_orders(&[(entry.copy_order_id.clone(), symbol.to_string())]).await
        } else {
            handles.client.cancel_orders(&[entry.copy_order_id.clone()]).await
        };
        if let Err(e) = result {
            record_error_on(rt, format!("cancel failed: {e:#}")).await;
            warn!("{symbol} :: CANCEL FAILED: {e:#}");
        }
    }

    async fn issue_close(
        rt: &Arc<AsyncMutex<FollowerRuntime>>,
        handles: &DispatchHandles,
        orders: &mut SymbolOrders,
        event: &MasterEvent,
        intent: &OrderIntent,
    ) {
        let side = ExchangeOrderSide::resolve(intent.side, intent.position_side, true);
        let params = CreateOrderParams {
            symbol: &intent.symbol,
            vol: intent.contracts,
            side,
            open_type: OpenType::from_i64(intent.open_type).unwrap_or(OpenType::Crossed),
            leverage: intent.leverage,
            price: None,
            sl_price: None,
            tp_price: None,
        };
        match handles.client.create_order(params).await {
            Ok(_order_id) => {
                if event.sig_type == SigType::Manual {
                    let limit_ids: Vec<String> = orders.limit.values().map(|e| e.copy_order_id.clone()).collect();
                    let trigger_ids: Vec<(String, String)> =
                        orders.trigger.values().map(|e| (e.copy_order_id.clone(), intent.symbol.clone())).collect();
                    if handles.client.cancel_orders(&limit_ids).await.is_ok()
                        && handles.client.cancel_trigger_orders(&trigger_ids).await.is_ok()
                    {
                        orders.limit.clear();
                        orders.trigger.clear();
                    }
                }
            }
            Err(e) => {
                record_error_on(rt, format!("close failed: {e:#}")).await;
                warn!("{} {:?} :: MARKET FAILED: {e:#}", intent.symbol, intent.position_side);
            }
        }
    }

    async fn issue_open(
        rt: &Arc<AsyncMutex<FollowerRuntime>>,
        handles: &DispatchHandles,
        orders: &mut SymbolOrders,
        event: &MasterEvent,
        intent: &OrderIntent,
    ) {
        let side = ExchangeOrderSide::resolve(intent.side, intent.position_side, false);
        let params = CreateOrderParams {
            symbol: &intent.symbol,
            vol: intent.contracts,
            side,
            open_type: OpenType::from_i64(intent.open_type).unwrap_or(OpenType::Crossed),
            leverage: intent.leverage,
            price: intent.price.as_deref(),
            sl_price: intent.sl_price.as_deref(),
            tp_price: intent.tp_price.as_deref(),
        };
        match handles.client.create_order(params).await {
            Ok(copy_order_id) => {
                if intent.method == super::types::OrderMethod::Limit {
                    if let Some(master_oid) = &event.payload.order_id {
                        orders.limit.insert(
                            master_oid.clone(),
                            OrderEntry { copy_order_id, price: intent.price.clone(), qty: intent.contracts, status: OrderStatus::Open },
                        );
                    }
                }
            }
            Err(e) => {
                let method = if intent.method == super::types::OrderMethod::Limit { "LIMIT" } else { "MARKET" };
                record_error_on(rt, format!("{method} failed: {e:#}")).await;
                warn!("{} {:?} :: {method} FAILED: {e:#}", intent.symbol, intent.position_side);
            }
        }
    }

    async fn issue_trigger(
        rt: &Arc<AsyncMutex<FollowerRuntime>>,
        handles: &DispatchHandles,
        orders: &mut SymbolOrders,
        event: &MasterEvent,
        intent: &OrderIntent,
    ) {
        let side = ExchangeOrderSide::resolve(intent.side, intent.position_side, false);
        let _ = TriggerType::for_order_side(side); // documents the mapping consumed inside the REST layer
        let Some(trigger_price) = intent.trigger_price.as_deref() else {
            warn!("{} {:?} :: TRIGGER FAILED: missing trigger_price", intent.symbol, intent.position_side);
            return;
        };
        let params = CreateTriggerOrderParams {
            symbol: &intent.symbol,
            vol: intent.contracts,
            side,
            open_type: OpenType::from_i64(intent.open_type).unwrap_or(OpenType::Crossed),
            leverage: intent.leverage,
            trigger_price,
            trigger_exec: event.payload.trigger_exec,
        };
        match handles.client.create_trigger_order(params).await {
            Ok(copy_order_id) => {
                if let Some(master_oid) = &event.payload.order_id {
                    orders.trigger.insert(
                        master_oid.clone(),
                        OrderEntry { copy_order_id, price: intent.trigger_price.clone(), qty: intent.contracts, status: OrderStatus::Open },
                    );
                }
            }
            Err(e) => {
                record_error_on(rt, format!("trigger failed: {e:#}")).await;
                warn!("{} {:?} :: TRIGGER FAILED: {e:#}", intent.symbol, intent.position_side);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::follower::FollowerConfig;
    use crate::relay::messages::{MasterEventPayload, SigType};
    use crate::relay::types::{OrderMethod, PosSide};

    fn cfg() -> FollowerConfig {
        FollowerConfig {
            id: 1,
            api_key: "k".into(),
            api_secret: "s".into(),
            proxy: None,
            coef: 1.0,
            leverage: Some(10),
            margin_mode: Some(2),
            max_position_size: None,
            random_size_pct: None,
            delay_ms: None,
            enabled: true,
        }
    }

    fn runtime() -> Arc<AsyncMutex<FollowerRuntime>> {
        Arc::new(AsyncMutex::new(FollowerRuntime::new(cfg(), "https://example.invalid").unwrap()))
    }

    fn cancel_event(order_id: &str) -> MasterEvent {
        MasterEvent {
            event: MasterEventKind::Canceled,
            method: OrderMethod::Limit,
            symbol: "BTC_USDT".into(),
            pos_side: Some(PosSide::Long),
            closed: false,
            payload: MasterEventPayload { order_id: Some(order_id.to_string()), ..Default::default() },
            sig_type: SigType::Copy,
            ts_ms: 0,
            cid: None,
        }
    }

    fn spec() -> SymbolSpec {
        SymbolSpec { contract_precision: 1, price_precision: 2, contract_size: 1.0, vol_unit: 0.1, max_leverage: 125 }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_drops_when_session_not_ready() {
        let rt = runtime();
        // session never initialized: wait_ready's 5s poll resolves instantly under paused time
        let ev = cancel_event("X");
        Executor::dispatch(&rt, &ev, &spec()).await;
        assert!(rt.lock().await.last_error.is_some());
    }

    #[tokio::test]
    async fn test_cancel_miss_on_unknown_master_oid_is_idempotent() {
        let rt = runtime();
        rt.lock().await.session.initialize().await.unwrap();
        let ev = cancel_event("never-placed");
        // Should not panic and should simply log CANCEL MISS, no REST call attempted.
        Executor::dispatch(&rt, &ev, &spec()).await;
    }
}
