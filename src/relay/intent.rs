//! IntentFactory: builds a follower's sized `OrderIntent` from the
//! translated `MasterEvent`, the follower's config, its tracked `PositionVar`
//! and the instrument's contract spec.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use rust_decimal::prelude::*;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use super::follower::FollowerConfig;
use super::messages::{MasterEvent, MasterEventKind, SigType};
use super::position::PositionVar;
use super::rest::{ContractDetail, RestClient};
use super::types::{OrderMethod, OrderSide, PosSide};

pub const FALLBACK_LEVERAGE: i64 = 5;
pub const FALLBACK_MARGIN_MODE: i64 = 2;

/// Instrument precision/sizing constants, as published by the exchange's
/// contract spec endpoint.
#[derive(Debug, Clone, Copy)]
pub struct SymbolSpec {
    pub contract_precision: u32,
    pub price_precision: u32,
    pub contract_size: f64,
    pub vol_unit: f64,
    pub max_leverage: i64,
}

impl SymbolSpec {
    /// The spec used when a symbol isn't (yet) in the contract listing —
    /// conservative enough to never round an order up past what the master
    /// sent, matching the original client's defaults for an unseen symbol.
    pub const FALLBACK: SymbolSpec =
        SymbolSpec { contract_precision: 0, price_precision: 2, contract_size: 1.0, vol_unit: 1.0, max_leverage: 20 };

    fn from_detail(d: &ContractDetail) -> Self {
        Self {
            contract_precision: d.vol_scale.unwrap_or(3),
            price_precision: d.price_scale.unwrap_or(2),
            contract_size: d.contract_size.unwrap_or(1.0),
            vol_unit: d.vol_unit.unwrap_or(1.0),
            max_leverage: d.max_leverage.map(|l| l as i64).unwrap_or(20),
        }
    }
}

/// Caches `/contract/detail` behind a TTL so the sizing path never blocks on
/// a REST call; refreshed lazily on lookup, the way the master's own client
/// reloads its symbol table rather than hitting the endpoint per order.
pub struct SpecRegistry {
    client: RestClient,
    ttl: Duration,
    inner: AsyncMutex<SpecRegistryInner>,
}

struct SpecRegistryInner {
    by_symbol: HashMap<String, SymbolSpec>,
    fetched_at: Option<Instant>,
}

impl SpecRegistry {
    pub fn new(client: RestClient, ttl: Duration) -> Arc<Self> {
        Arc::new(Self { client, ttl, inner: AsyncMutex::new(SpecRegistryInner { by_symbol: HashMap::new(), fetched_at: None }) })
    }

    /// Looks up `symbol`'s spec, refreshing the whole table first if it's
    /// stale or this is the first lookup. Falls back to `SymbolSpec::FALLBACK`
    /// if the symbol is unknown or the refresh itself fails.
    pub async fn get(&self, symbol: &str) -> SymbolSpec {
        let mut inner = self.inner.lock().await;
        let stale = inner.fetched_at.map(|t| t.elapsed() > self.ttl).unwrap_or(true);
        if stale {
            match self.client.get_contract_detail().await {
                Ok(details) => {
                    inner.by_symbol = details.iter().map(|d| (d.symbol.clone(), SymbolSpec::from_detail(d))).collect();
                    inner.fetched_at = Some(Instant::now());
                }
                Err(e) => warn!("contract spec refresh failed, using stale/fallback table: {e:#}"),
            }
        }
        inner.by_symbol.get(symbol).copied().unwrap_or(SymbolSpec::FALLBACK)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderIntent {
    pub symbol: String,
    pub side: OrderSide,
    pub position_side: PosSide,
    pub contracts: f64,
    pub method: OrderMethod,
    pub leverage: i64,
    pub open_type: i64,
    pub price: Option<String>,
    pub trigger_price: Option<String>,
    pub sl_price: Option<String>,
    pub tp_price: Option<String>,
    pub delay_ms: u64,
}

/// Rounds to `precision` decimal places then renders the canonical
/// trailing-zero-free decimal string (`100.50` -> `"100.5"`, `100.0` ->
/// `"100"`), matching the exchange's expected literal price format.
pub fn format_price(value: f64, precision: u32) -> Option<String> {
    if !value.is_finite() {
        return None;
    }
    let dec = Decimal::from_f64(value)?.round_dp(precision).normalize();
    Some(dec.to_string())
}

pub struct IntentFactory;

impl IntentFactory {
    pub fn build(
        cfg: &FollowerConfig,
        event: &MasterEvent,
        pv: &PositionVar,
        spec: &SymbolSpec,
    ) -> Option<OrderIntent> {
        let pos_side = event.pos_side?;
        let is_close = event.closed;

        let (leverage, open_type) = if is_close {
            Self::resolve_close(cfg, event, pv)
        } else {
            Self::resolve_open(cfg, event, pv)
        };

        let leverage = leverage.min(spec.max_leverage).max(1);

        let contracts = Self::resolve_qty(cfg, event, pv, spec, is_close)?;
        if !contracts.is_finite() || contracts <= 0.0 {
            debug!(
                "INTENT DROP {} {:?}: non-positive contracts after clamp ({contracts})",
                event.symbol, pos_side
            );
            return None;
        }

        let side = match event.event {
            MasterEventKind::Buy => OrderSide::Buy,
            MasterEventKind::Sell => OrderSide::Sell,
            MasterEventKind::Canceled => return None,
        };

        let price = event
            .payload
            .price
            .and_then(|p| format_price(p, spec.price_precision));
        let trigger_price = event
            .payload
            .trigger_price
            .and_then(|p| format_price(p, spec.price_precision));
        let sl_price = event
            .payload
            .sl_price
            .and_then(|p| format_price(p, spec.price_precision));
        let tp_price = event
            .payload
            .tp_price
            .and_then(|p| format_price(p, spec.price_precision));

        let delay_ms = if event.sig_type != SigType::Manual && !is_close {
            Self::resolve_delay(cfg)
        } else {
            0
        };

        Some(OrderIntent {
            symbol: event.symbol.clone(),
            side,
            position_side: pos_side,
            contracts,
            method: event.method,
            leverage,
            open_type,
            price,
            trigger_price,
            sl_price,
            tp_price,
            delay_ms,
        })
    }

    fn resolve_open(cfg: &FollowerConfig, event: &MasterEvent, pv: &PositionVar) -> (i64, i64) {
        let leverage = cfg
            .leverage
            .or(event.payload.leverage)
            .or(pv.leverage)
            .unwrap_or(FALLBACK_LEVERAGE);
        let open_type = cfg
            .margin_mode
            .or(event.payload.open_type)
            .or(pv.margin_mode)
            .unwrap_or(FALLBACK_MARGIN_MODE);
        (leverage, open_type)
    }

    fn resolve_close(cfg: &FollowerConfig, event: &MasterEvent, pv: &PositionVar) -> (i64, i64) {
        let leverage = pv
            .leverage
            .or(event.payload.leverage)
            .or(cfg.leverage)
            .unwrap_or(FALLBACK_LEVERAGE);
        let open_type = pv
            .margin_mode
            .or(event.payload.open_type)
            .or(cfg.margin_mode)
            .unwrap_or(FALLBACK_MARGIN_MODE);
        (leverage, open_type)
    }

    fn resolve_qty(
        cfg: &FollowerConfig,
        event: &MasterEvent,
        pv: &PositionVar,
        spec: &SymbolSpec,
        is_close: bool,
    ) -> Option<f64> {
        if is_close {
            // A close always targets the full tracked position, never the
            // master's own qty (the follower's size may have drifted).
            return Some(pv.qty);
        }

        let master_qty = event.payload.qty?;
        let price = event.payload.price.filter(|p| *p > 0.0)?;
        let leverage = cfg.leverage.or(event.payload.leverage).unwrap_or(FALLBACK_LEVERAGE).max(1);

        let needs_clamp = cfg.coef != 1.0 || cfg.random_size_pct.is_some() || cfg.max_position_size.is_some();
        if !needs_clamp {
            return Some(master_qty);
        }

        Self::clamp_by_max_margin(master_qty, price, leverage, cfg, spec)
    }

    /// `margin = contracts * contract_size * price / leverage`, scaled by
    /// `|coef|` and an optional random size percentage, then capped at
    /// `max_position_size` and snapped back onto the contract grid.
    fn clamp_by_max_margin(
        contracts: f64,
        price: f64,
        leverage: i64,
        cfg: &FollowerConfig,
        spec: &SymbolSpec,
    ) -> Option<f64> {
        let mut margin = contracts * spec.contract_size * price / leverage as f64;

        if cfg.coef != 0.0 && cfg.coef != 1.0 {
            margin *= cfg.coef.abs();
        }

        if let Some((lo, hi)) = cfg.random_size_pct {
            if hi > lo {
                let rnd = rand::thread_rng().gen_range(lo..hi);
                margin *= (rnd / 100.0).abs();
            }
        }

        if let Some(max_margin) = cfg.max_position_size {
            margin = margin.min(max_margin.abs());
        }

        let base_qty = margin * leverage as f64 / price;
        if spec.vol_unit <= 0.0 {
            return None;
        }
        let snapped = (base_qty / spec.vol_unit).floor() * spec.vol_unit;
        let rounded = Decimal::from_f64(snapped)?.round_dp(spec.contract_precision);
        rounded.to_f64()
    }

    fn resolve_delay(cfg: &FollowerConfig) -> u64 {
        match cfg.delay_ms {
            Some((lo, hi)) if hi > lo => rand::thread_rng().gen_range(lo..hi) as u64,
            Some((lo, _)) => lo as u64,
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::messages::MasterEventPayload;

    fn spec() -> SymbolSpec {
        SymbolSpec {
            contract_precision: 1,
            price_precision: 2,
            contract_size: 1.0,
            vol_unit: 0.1,
            max_leverage: 125,
        }
    }

    fn cfg(coef: f64, max_pos: Option<f64>) -> FollowerConfig {
        FollowerConfig {
            id: 1,
            api_key: String::new(),
            api_secret: String::new(),
            proxy: None,
            coef,
            leverage: None,
            margin_mode: None,
            max_position_size: max_pos,
            random_size_pct: None,
            delay_ms: None,
            enabled: true,
        }
    }

    fn buy_event(qty: f64, price: f64) -> MasterEvent {
        MasterEvent {
            event: MasterEventKind::Buy,
            method: OrderMethod::Market,
            symbol: "BTC_USDT".into(),
            pos_side: Some(PosSide::Long),
            closed: false,
            payload: MasterEventPayload {
                qty: Some(qty),
                price: Some(price),
                leverage: Some(10),
                open_type: Some(2),
                ..Default::default()
            },
            sig_type: SigType::Copy,
            ts_ms: 0,
            cid: None,
        }
    }

    #[test]
    fn test_scenario_5_fanout_clamp() {
        let c = cfg(0.5, Some(50.0));
        let spec = spec();
        let event = buy_event(20.0, 100.0);
        let qty = IntentFactory::resolve_qty(&c, &event, &PositionVar::default(), &spec, false).unwrap();
        assert_eq!(qty, 5.0);
    }

    #[test]
    fn test_no_clamp_passes_through_master_qty() {
        let c = cfg(1.0, None);
        let spec = spec();
        let event = buy_event(20.0, 100.0);
        let qty = IntentFactory::resolve_qty(&c, &event, &PositionVar::default(), &spec, false).unwrap();
        assert_eq!(qty, 20.0);
    }

    #[test]
    fn test_clamp_monotonic_in_max_position_size() {
        let spec = spec();
        let event = buy_event(20.0, 100.0);
        let small = IntentFactory::resolve_qty(&cfg(0.5, Some(20.0)), &event, &PositionVar::default(), &spec, false).unwrap();
        let large = IntentFactory::resolve_qty(&cfg(0.5, Some(80.0)), &event, &PositionVar::default(), &spec, false).unwrap();
        assert!(large >= small);
    }

    #[test]
    fn test_close_uses_tracked_pv_qty_not_master_qty() {
        let c = cfg(1.0, None);
        let spec = spec();
        let mut event = buy_event(999.0, 100.0);
        event.closed = true;
        let pv = PositionVar { qty: 2.0, in_position: true, ..Default::default() };
        let qty = IntentFactory::resolve_qty(&c, &event, &pv, &spec, true).unwrap();
        assert_eq!(qty, 2.0);
    }

    #[test]
    fn test_format_price_strips_trailing_zeros() {
        assert_eq!(format_price(100.50, 2).unwrap(), "100.5");
        assert_eq!(format_price(100.0, 2).unwrap(), "100");
        assert_eq!(format_price(100.125, 2).unwrap(), "100.13");
    }

    #[test]
    fn test_build_drops_on_non_finite_price_missing() {
        let c = cfg(1.0, None);
        let spec = spec();
        let mut event = buy_event(20.0, 100.0);
        event.payload.price = None;
        let intent = IntentFactory::build(&c, &event, &PositionVar::default(), &spec);
        assert!(intent.is_none());
    }

    #[test]
    fn test_open_leverage_resolution_order() {
        let mut c = cfg(1.0, None);
        c.leverage = Some(7);
        let event = buy_event(20.0, 100.0);
        let (leverage, _) = IntentFactory::resolve_open(&c, &event, &PositionVar::default());
        assert_eq!(leverage, 7);
    }

    #[test]
    fn test_close_leverage_resolution_prefers_pv() {
        let c = cfg(1.0, None);
        let event = buy_event(20.0, 100.0);
        let pv = PositionVar { leverage: Some(25), ..Default::default() };
        let (leverage, _) = IntentFactory::resolve_close(&c, &event, &pv);
        assert_eq!(leverage, 25);
    }
}
