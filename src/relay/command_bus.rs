//! CommandBus: turns a UI manual-close command into the synthetic
//! `MasterEvent` the translator's `out_queue` carries, and expands it into
//! one atomic per-position event per targeted follower.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use super::follower::FollowerRuntime;
use super::messages::{MasterEvent, MasterEventKind, MasterEventPayload, SigType};
use super::types::OrderMethod;

pub const ALL_OPENED_SYMBOLS: &str = "ALL OPENED SYMBOLS";

pub struct CommandBus;

impl CommandBus {
    /// One synthetic event representing the UI's manual-close request
    /// itself, before per-follower expansion. This is what gets pushed onto
    /// the translator's `out_queue`.
    pub fn build_manual_close_signal() -> MasterEvent {
        MasterEvent {
            event: MasterEventKind::Sell,
            method: OrderMethod::Market,
            symbol: ALL_OPENED_SYMBOLS.to_string(),
            pos_side: None,
            closed: true,
            payload: MasterEventPayload::default(),
            sig_type: SigType::Manual,
            ts_ms: super::rest::now_ms(),
            cid: None,
        }
    }

    /// Expands a manual-close signal into one `MasterEvent` per open
    /// `(symbol, pos_side)` on each targeted follower. Master (cid 0) is
    /// forbidden and silently skipped with a warning.
    pub async fn expand(
        followers: &HashMap<i64, Arc<AsyncMutex<FollowerRuntime>>>,
        cids: &[i64],
    ) -> Vec<MasterEvent> {
        let mut out = Vec::new();
        let now = super::rest::now_ms();

        for &cid in cids {
            if cid == 0 {
                warn!("manual close of master (cid=0) is forbidden, skipping");
                continue;
            }
            let Some(rt) = followers.get(&cid) else {
                warn!("manual close target {cid} not found");
                continue;
            };
            let rt = rt.lock().await;
            let pvs = rt.position_vars.lock().await;

            for (symbol, sides) in pvs.iter() {
                for (side, pv) in sides.iter() {
                    if !pv.in_position || pv.qty <= 0.0 {
                        continue;
                    }
                    out.push(MasterEvent {
                        event: MasterEventKind::Sell,
                        method: OrderMethod::Market,
                        symbol: symbol.clone(),
                        pos_side: Some(*side),
                        closed: true,
                        payload: MasterEventPayload {
                            qty: Some(pv.qty),
                            reduce_only: true,
                            leverage: pv.leverage,
                            open_type: pv.margin_mode,
                            ..Default::default()
                        },
                        sig_type: SigType::Manual,
                        ts_ms: now,
                        cid: Some(cid),
                    });
                }
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::follower::FollowerConfig;
    use crate::relay::position::PositionVar;
    use crate::relay::types::PosSide;

    fn cfg(id: i64) -> FollowerConfig {
        FollowerConfig {
            id,
            api_key: "k".into(),
            api_secret: "s".into(),
            proxy: None,
            coef: 1.0,
            leverage: None,
            margin_mode: None,
            max_position_size: None,
            random_size_pct: None,
            delay_ms: None,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn test_master_close_is_forbidden() {
        let rt = FollowerRuntime::new(cfg(0), "https://example.invalid").unwrap();
        let mut followers = HashMap::new();
        followers.insert(0i64, Arc::new(AsyncMutex::new(rt)));
        let out = CommandBus::expand(&followers, &[0]).await;
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_expand_emits_one_event_per_open_position() {
        let rt = FollowerRuntime::new(cfg(3), "https://example.invalid").unwrap();
        {
            let mut pvs = rt.position_vars.lock().await;
            pvs.entry("BTC_USDT".to_string()).or_default().insert(
                PosSide::Long,
                PositionVar { in_position: true, qty: 2.0, ..Default::default() },
            );
        }
        let mut followers = HashMap::new();
        followers.insert(3i64, Arc::new(AsyncMutex::new(rt)));

        let out = CommandBus::expand(&followers, &[3]).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].cid, Some(3));
        assert_eq!(out[0].payload.qty, Some(2.0));
        assert!(out[0].payload.reduce_only);
        assert_eq!(out[0].sig_type, SigType::Manual);
    }

    #[tokio::test]
    async fn test_expand_skips_flat_positions() {
        let rt = FollowerRuntime::new(cfg(3), "https://example.invalid").unwrap();
        {
            let mut pvs = rt.position_vars.lock().await;
            pvs.entry("BTC_USDT".to_string()).or_default().insert(PosSide::Long, PositionVar::default());
        }
        let mut followers = HashMap::new();
        followers.insert(3i64, Arc::new(AsyncMutex::new(rt)));

        let out = CommandBus::expand(&followers, &[3]).await;
        assert!(out.is_empty());
    }
}
