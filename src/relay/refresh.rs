//! RefreshCoordinator: hash-convergence polling after a fan-out burst, and
//! the batched realized-PnL report fired once a follower's position settles.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use super::follower::FollowerRuntime;
use super::position::{PosMonitorFSM, PvState};
use super::types::PosSide;

const INITIAL_DELAY: Duration = Duration::from_millis(50);
const MAX_DELAY: Duration = Duration::from_millis(500);
const DELAY_BACKOFF: f64 = 1.25;
const CONVERGENCE_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct PnlReport {
    pub cid: i64,
    pub symbol: String,
    pub pos_side: PosSide,
    pub pnl_usdt: Option<f64>,
    pub entry_ts: i64,
}

pub struct RefreshCoordinator;

impl RefreshCoordinator {
    /// Polls the given followers' positions until each one's PV hash changes
    /// from its pre-fan-out value, or the 5s convergence deadline passes.
    /// Converged followers are handed to `on_stable` as soon as they settle.
    pub async fn trigger(
        followers: &HashMap<i64, Arc<AsyncMutex<FollowerRuntime>>>,
        targets: Vec<i64>,
    ) -> Vec<PnlReport> {
        let mut prev_hash = HashMap::new();
        for &cid in &targets {
            if let Some(rt) = followers.get(&cid) {
                let rt = rt.lock().await;
                let pvs = rt.position_vars.lock().await;
                prev_hash.insert(cid, PosMonitorFSM::snapshot_hash(&pvs));
            }
        }

        let mut pending: HashSet<i64> = targets.into_iter().filter(|c| followers.contains_key(c)).collect();
        let mut delay = INITIAL_DELAY;
        let deadline = Instant::now() + CONVERGENCE_DEADLINE;
        let mut reports = Vec::new();

        while !pending.is_empty() && Instant::now() < deadline {
            let cids: Vec<i64> = pending.iter().copied().collect();
            let refreshed = join_all(cids.iter().map(|&cid| Self::refresh_one(followers, cid))).await;

            for (cid, new_hash) in refreshed {
                let changed = prev_hash.get(&cid).map(|h| *h != new_hash).unwrap_or(true);
                if changed {
                    pending.remove(&cid);
                    prev_hash.insert(cid, new_hash);
                    reports.extend(Self::on_stable(followers, &[cid]).await);
                }
            }

            if pending.is_empty() {
                break;
            }
            tokio::time::sleep(delay).await;
            delay = Duration::from_secs_f64((delay.as_secs_f64() * DELAY_BACKOFF).min(MAX_DELAY.as_secs_f64()));
        }

        if !pending.is_empty() {
            debug!("refresh convergence timed out for followers {:?}", pending);
        }

        reports
    }

    async fn refresh_one(followers: &HashMap<i64, Arc<AsyncMutex<FollowerRuntime>>>, cid: i64) -> (i64, u64) {
        let Some(rt) = followers.get(&cid) else { return (cid, 0) };
        let rt = rt.lock().await;
        let positions = rt.client.get_open_positions(None).await.ok();
        let mut pvs = rt.position_vars.lock().await;
        PosMonitorFSM::apply_snapshot(&mut pvs, positions, super::rest::now_ms());
        (cid, PosMonitorFSM::snapshot_hash(&pvs))
    }

    /// For each settled follower, collects every `CLOSED_PENDING` PV,
    /// fetches one batched realized-PnL call spanning `[min(entry_ts), now]`,
    /// matches results by `(symbol, direction)`, and clears the PVs.
    async fn on_stable(followers: &HashMap<i64, Arc<AsyncMutex<FollowerRuntime>>>, ids: &[i64]) -> Vec<PnlReport> {
        let mut reports = Vec::new();

        for &cid in ids {
            let Some(rt) = followers.get(&cid) else { continue };
            let rt = rt.lock().await;
            let mut pvs = rt.position_vars.lock().await;

            let closed: Vec<(String, PosSide, i64)> = pvs
                .iter()
                .flat_map(|(symbol, sides)| {
                    sides.iter().filter_map(move |(side, pv)| {
                        if pv.state == Some(PvState::ClosedPending) {
                            pv.entry_ts.map(|ts| (symbol.clone(), *side, ts))
                        } else {
                            None
                        }
                    })
                })
                .collect();

            if closed.is_empty() {
                continue;
            }

            let min_entry_ts = closed.iter().map(|(_, _, ts)| *ts).min().unwrap_or(0);
            let now = super::rest::now_ms();
            let batch = rt.client.get_realized_pnl_batch(min_entry_ts, now).await.unwrap_or_default();

            for (symbol, side, entry_ts) in &closed {
                let direction = match side {
                    PosSide::Long => 1,
                    PosSide::Short => 2,
                };
                let pnl = batch.get(&(symbol.clone(), direction)).and_then(|r| r.pnl_usdt);
                reports.push(PnlReport { cid, symbol: symbol.clone(), pos_side: *side, pnl_usdt: pnl, entry_ts: *entry_ts });
                info!("PNL REPORT cid={cid} {symbol} {side:?} entry_ts={entry_ts} pnl={pnl:?}");
            }

            for (symbol, side, _) in &closed {
                if let Some(sides) = pvs.get_mut(symbol) {
                    sides.insert(*side, Default::default());
                }
            }
        }

        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::follower::FollowerConfig;
    use crate::relay::position::PositionVar;

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
    async fn test_on_stable_skips_followers_with_no_closed_pending() {
        let rt = FollowerRuntime::new(cfg(1), "https://example.invalid").unwrap();
        let mut followers = HashMap::new();
        followers.insert(1i64, Arc::new(AsyncMutex::new(rt)));
        let reports = RefreshCoordinator::on_stable(&followers, &[1]).await;
        assert!(reports.is_empty());
    }

    #[tokio::test]
    async fn test_on_stable_clears_closed_pending_pv() {
        let rt = FollowerRuntime::new(cfg(1), "https://example.invalid").unwrap();
        {
            let mut pvs = rt.position_vars.lock().await;
            pvs.entry("BTC_USDT".to_string()).or_default().insert(
                PosSide::Long,
                PositionVar { entry_ts: Some(100), state: Some(PvState::ClosedPending), ..Default::default() },
            );
        }
        let mut followers = HashMap::new();
        followers.insert(1i64, Arc::new(AsyncMutex::new(rt)));

        let reports = RefreshCoordinator::on_stable(&followers, &[1]).await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].entry_ts, 100);

        let rt = followers.get(&1).unwrap().lock().await;
        let pvs = rt.position_vars.lock().await;
        assert_eq!(pvs["BTC_USDT"][&PosSide::Long].state, None);
    }
}
