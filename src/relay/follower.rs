//! FollowerRuntime: one copy-trading account's session, REST client and
//! tracked state, plus the registry that serializes activate/deactivate per
//! follower id behind a per-cid init lock.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use super::position::PositionVarMap;
use super::rest::RestClient;
use super::session::NetworkSession;
use super::types::PosSide;

/// Persistent, per-follower sizing/credentials config (§3 Follower Config).
#[derive(Debug, Clone)]
pub struct FollowerConfig {
    pub id: i64,
    pub api_key: String,
    pub api_secret: String,
    pub proxy: Option<String>,
    pub coef: f64,
    pub leverage: Option<i64>,
    pub margin_mode: Option<i64>,
    pub max_position_size: Option<f64>,
    pub random_size_pct: Option<(f64, f64)>,
    pub delay_ms: Option<(f64, f64)>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    Init,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Open,
    Filled,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct OrderEntry {
    pub copy_order_id: String,
    pub price: Option<String>,
    pub qty: f64,
    pub status: OrderStatus,
}

/// Per-`(symbol, pos_side)` open-order bookkeeping. Wrapped in its own `Arc`
/// inside `OrdersVarMap` so the executor can serialize one tuple's order
/// actions without blocking other symbols or sides on the same follower.
#[derive(Default)]
pub struct SymbolOrders {
    pub limit: HashMap<String, OrderEntry>,
    pub trigger: HashMap<String, OrderEntry>,
}

pub type OrdersVarMap = HashMap<String, HashMap<PosSide, Arc<AsyncMutex<SymbolOrders>>>>;

pub struct FollowerRuntime {
    pub id: i64,
    pub config: FollowerConfig,
    pub session: Arc<NetworkSession>,
    pub client: RestClient,
    pub position_vars: Arc<AsyncMutex<PositionVarMap>>,
    pub orders_vars: Arc<AsyncMutex<OrdersVarMap>>,
    pub init_state: InitState,
    pub network_ready: bool,
    pub last_error: Option<String>,
    pub last_error_ts: Option<i64>,
    ping_task: Option<tokio::task::JoinHandle<()>>,
}

impl FollowerRuntime {
    pub fn new(config: FollowerConfig, base_url: &str) -> anyhow::Result<Self> {
        let client = RestClient::new(base_url, &config.api_key, &config.api_secret, config.proxy.as_deref())?;
        let session = Arc::new(NetworkSession::new(base_url, config.proxy.clone()));
        Ok(Self {
            id: config.id,
            config,
            session,
            client,
            position_vars: Arc::new(AsyncMutex::new(PositionVarMap::new())),
            orders_vars: Arc::new(AsyncMutex::new(OrdersVarMap::new())),
            init_state: InitState::Init,
            network_ready: false,
            last_error: None,
            last_error_ts: None,
            ping_task: None,
        })
    }

    pub fn record_error(&mut self, reason: impl Into<String>) {
        self.last_error = Some(reason.into());
        self.last_error_ts = Some(super::rest::now_ms());
    }

    /// Fetches (creating on first use) the lock for one `(symbol, pos_side)`
    /// tuple. The outer `orders_vars` lock is held only long enough to
    /// get-or-insert the entry; distinct tuples then proceed independently.
    pub async fn symbol_orders(&self, symbol: &str, side: PosSide) -> Arc<AsyncMutex<SymbolOrders>> {
        let mut ov = self.orders_vars.lock().await;
        ov.entry(symbol.to_string())
            .or_default()
            .entry(side)
            .or_insert_with(|| Arc::new(AsyncMutex::new(SymbolOrders::default())))
            .clone()
    }

    /// Clones out everything a dispatch needs to talk to the exchange for one
    /// `(symbol, pos_side)` tuple. Cloning `client`/`session`/the two `Arc`
    /// maps is cheap; the caller drops the runtime lock immediately after
    /// this returns, so REST round-trips for different tuples (or different
    /// followers) never wait on each other.
    pub async fn dispatch_handles(&self, symbol: &str, side: PosSide) -> DispatchHandles {
        DispatchHandles {
            config: self.config.clone(),
            session: self.session.clone(),
            client: self.client.clone(),
            position_vars: self.position_vars.clone(),
            symbol_orders: self.symbol_orders(symbol, side).await,
        }
    }
}

/// Everything `Executor::dispatch` needs, snapshotted out of a
/// `FollowerRuntime` while its lock is held only briefly. Dispatch itself
/// then runs against these handles with no runtime-wide lock held, so two
/// `(symbol, pos_side)` tuples for the same follower can be in flight at
/// once; only `record_error` reacquires the runtime lock, and only for the
/// instant it takes to set two fields.
#[derive(Clone)]
pub struct DispatchHandles {
    pub config: FollowerConfig,
    pub session: Arc<NetworkSession>,
    pub client: RestClient,
    pub position_vars: Arc<AsyncMutex<PositionVarMap>>,
    pub symbol_orders: Arc<AsyncMutex<SymbolOrders>>,
}

/// Briefly reacquires `rt`'s lock to record a dispatch failure, without
/// holding it for the I/O that produced the failure.
pub async fn record_error_on(rt: &Arc<AsyncMutex<FollowerRuntime>>, reason: impl Into<String>) {
    rt.lock().await.record_error(reason);
}

/// Holds every follower runtime plus a per-cid init lock, the way `CopyState`
/// serializes `activate_copy`/`deactivate_copy` in the original system so two
/// concurrent commands against the same follower can never race.
pub struct FollowerRegistry {
    runtimes: AsyncMutex<HashMap<i64, Arc<AsyncMutex<FollowerRuntime>>>>,
    init_locks: AsyncMutex<HashMap<i64, Arc<AsyncMutex<()>>>>,
    base_url: String,
}

impl FollowerRegistry {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            runtimes: AsyncMutex::new(HashMap::new()),
            init_locks: AsyncMutex::new(HashMap::new()),
            base_url: base_url.into(),
        }
    }

    async fn init_lock(&self, cid: i64) -> Arc<AsyncMutex<()>> {
        let mut locks = self.init_locks.lock().await;
        locks.entry(cid).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    pub async fn get(&self, cid: i64) -> Option<Arc<AsyncMutex<FollowerRuntime>>> {
        self.runtimes.lock().await.get(&cid).cloned()
    }

    pub async fn all(&self) -> Vec<Arc<AsyncMutex<FollowerRuntime>>> {
        self.runtimes.lock().await.values().cloned().collect()
    }

    /// A `cid -> runtime` snapshot, the shape `CommandBus`/`RefreshCoordinator`
    /// take so they don't need to know about the registry's own locking.
    pub async fn snapshot(&self) -> HashMap<i64, Arc<AsyncMutex<FollowerRuntime>>> {
        self.runtimes.lock().await.clone()
    }

    /// Builds and registers a runtime for `cfg`, serialized per-cid so a
    /// concurrent deactivate/activate pair can't interleave.
    pub async fn activate(&self, cfg: FollowerConfig) -> anyhow::Result<()> {
        let cid = cfg.id;
        let lock = self.init_lock(cid).await;
        let _guard = lock.lock().await;

        if self.runtimes.lock().await.contains_key(&cid) {
            warn!("follower {cid} already active, deactivating stale runtime first");
            self.deactivate_locked(cid).await;
        }

        let mut runtime = FollowerRuntime::new(cfg, &self.base_url)?;
        runtime.session.initialize().await?;
        runtime.init_state = InitState::Ready;
        runtime.network_ready = true;
        runtime.ping_task = Some(runtime.session.clone().start_ping_loop());

        self.runtimes.lock().await.insert(cid, Arc::new(AsyncMutex::new(runtime)));
        info!("follower {cid} activated");
        Ok(())
    }

    pub async fn deactivate(&self, cid: i64) {
        let lock = self.init_lock(cid).await;
        let _guard = lock.lock().await;
        self.deactivate_locked(cid).await;
    }

    async fn deactivate_locked(&self, cid: i64) {
        let removed = self.runtimes.lock().await.remove(&cid);
        if let Some(runtime) = removed {
            let mut runtime = runtime.lock().await;
            if let Some(task) = runtime.ping_task.take() {
                task.abort();
            }
            runtime.session.shutdown().await;
            info!("follower {cid} deactivated");
        }
    }

    pub async fn shutdown_all(&self) {
        let ids: Vec<i64> = self.runtimes.lock().await.keys().copied().collect();
        for cid in ids {
            self.deactivate(cid).await;
        }
    }
}
