//! Per-`(symbol, pos_side)` position tracking: the `PositionVar` record and
//! the `PosMonitorFSM` that diffs REST position snapshots against it.

use std::collections::HashMap;

use tracing::warn;

use super::rest::RawPosition;
use super::types::PosSide;

/// Transient FSM state layered on top of a `PositionVar`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PvState {
    /// A close was observed; the entry awaits realized-PnL accounting before
    /// being fully cleared by `RefreshCoordinator::on_stable`.
    ClosedPending,
}

/// Position snapshot for one `(symbol, pos_side)` on one follower (or the
/// master, cid 0). `in_position ⇒ qty > 0` is maintained as an invariant by
/// every mutator in this module.
#[derive(Debug, Clone, Default)]
pub struct PositionVar {
    pub in_position: bool,
    pub qty: f64,
    pub entry_price: Option<f64>,
    pub avg_price: Option<f64>,
    pub leverage: Option<i64>,
    pub margin_mode: Option<i64>,
    pub entry_ts: Option<i64>,
    pub state: Option<PvState>,
    pub attached_tp: Option<f64>,
    pub attached_sl: Option<f64>,
}

impl PositionVar {
    /// Resets every field except `entry_ts`, which the caller restores and
    /// then marks `ClosedPending` — the PnL reporter needs it intact.
    fn reset_keep_entry_ts(&mut self) {
        let entry_ts = self.entry_ts;
        *self = PositionVar::default();
        self.entry_ts = entry_ts;
        self.state = Some(PvState::ClosedPending);
    }
}

/// Position maps are keyed `symbol -> pos_side -> PositionVar`, matching the
/// nesting the translator and executor both index into.
pub type PositionVarMap = HashMap<String, HashMap<PosSide, PositionVar>>;

/// Normalized REST entry the FSM can apply. Built by `PosMonitorFSM::unpack`
/// from a `RawPosition`; entries failing the holding/volume/side checks are
/// dropped silently (garbage rows are routine on this wire).
struct UnpackedPosition {
    symbol: String,
    pos_side: PosSide,
    qty: f64,
    entry_price: f64,
    avg_price: f64,
    leverage: i64,
    margin_mode: i64,
}

pub struct PosMonitorFSM;

impl PosMonitorFSM {
    /// `state == 1` (holding), `hold_vol > 0`, a recognized `position_type`.
    fn unpack(raw: &RawPosition) -> Option<UnpackedPosition> {
        if raw.state != 1 {
            return None;
        }
        let pos_side = PosSide::from_position_type(raw.position_type)?;
        let qty = raw.hold_vol.abs();
        if raw.symbol.is_empty() || qty <= 0.0 {
            return None;
        }
        Some(UnpackedPosition {
            symbol: raw.symbol.clone(),
            pos_side,
            qty,
            entry_price: raw.open_avg_price,
            avg_price: raw.hold_avg_price,
            leverage: raw.leverage.max(1),
            margin_mode: raw.open_type.max(1),
        })
    }

    /// Applies a freshly-fetched position snapshot against `position_vars`.
    /// A `None` snapshot means the REST call failed; the cache is left
    /// untouched (fail-open, per §4.7).
    pub fn apply_snapshot(
        position_vars: &mut PositionVarMap,
        positions: Option<Vec<RawPosition>>,
        now_ms: i64,
    ) {
        let Some(positions) = positions else {
            return;
        };

        let mut active: HashMap<(String, PosSide), UnpackedPosition> = HashMap::new();
        for raw in &positions {
            if let Some(info) = Self::unpack(raw) {
                active.insert((info.symbol.clone(), info.pos_side), info);
            }
        }

        for (symbol, sides) in position_vars.iter_mut() {
            for (pos_side, pv) in sides.iter_mut() {
                let key = (symbol.clone(), *pos_side);
                let was_in_position = pv.in_position;

                match active.get(&key) {
                    Some(info) if info.qty > 0.0 && !was_in_position => {
                        pv.in_position = true;
                        pv.qty = info.qty;
                        pv.entry_price = Some(info.entry_price);
                        pv.avg_price = Some(info.avg_price);
                        pv.leverage = Some(info.leverage);
                        pv.margin_mode = Some(info.margin_mode);
                        pv.entry_ts = Some(now_ms);
                    }
                    Some(info) if info.qty > 0.0 && was_in_position => {
                        pv.in_position = true;
                        pv.qty = info.qty;
                        // entry_price is not overwritten: it is the open price.
                        pv.avg_price = Some(info.avg_price);
                        pv.leverage = Some(info.leverage);
                        pv.margin_mode = Some(info.margin_mode);
                    }
                    _ => {
                        if was_in_position {
                            pv.reset_keep_entry_ts();
                            if pv.entry_ts.is_none() {
                                warn!(
                                    "{} {} closed with no entry_ts recorded; PnL report will be dropped",
                                    symbol, pos_side
                                );
                            }
                        }
                    }
                }
            }
        }
    }

    /// Order-independent snapshot hash over every `qty > 0` entry: XOR of
    /// per-entry hashes so fan-out followers can detect convergence without
    /// caring about map iteration order.
    pub fn snapshot_hash(position_vars: &PositionVarMap) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut acc: u64 = 0;
        for (symbol, sides) in position_vars {
            for (pos_side, pv) in sides {
                if pv.qty <= 0.0 {
                    continue;
                }
                let mut hasher = std::collections::hash_map::DefaultHasher::new();
                symbol.hash(&mut hasher);
                pos_side.hash(&mut hasher);
                pv.qty.to_bits().hash(&mut hasher);
                acc ^= hasher.finish();
            }
        }
        acc
    }
}
