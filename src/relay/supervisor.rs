//! Supervisor (`SignalFsm`): the outer state machine that owns the master
//! stream, the translator, and the per-event fan-out loop, and reacts to the
//! admin surface's stop/pause/credential commands. Polled at a fixed tick
//! the way the teacher's own coordinator loop samples shared state instead
//! of being pushed to, so the reload/hard-stop paths stay simple sequential
//! code rather than a second layer of message passing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::cache::SignalCache;
use super::command_bus::CommandBus;
use super::executor::Executor;
use super::follower::{FollowerRegistry, FollowerRuntime};
use super::intent::SpecRegistry;
use super::messages::MasterEvent;
use super::notifier::Notifier;
use super::refresh::RefreshCoordinator;
use super::rest::RestClient;
use super::stream::{MasterStream, MasterStreamConfig};
use super::translator::{Translator, TranslatorConfig};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const STREAM_READY_TIMEOUT: Duration = Duration::from_secs(15);
const STREAM_READY_RETRY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalFsmState {
    HardStop,
    Paused,
    NoCreds,
    Running,
    Reload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MasterCreds {
    ws_url: String,
    api_key: String,
    api_secret: String,
    black_symbols: Vec<String>,
}

fn creds_hash(c: &MasterCreds) -> String {
    let mut hasher = Sha256::new();
    hasher.update(c.ws_url.as_bytes());
    hasher.update(c.api_key.as_bytes());
    hasher.update(c.api_secret.as_bytes());
    for s in &c.black_symbols {
        hasher.update(s.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// The admin surface's only write path into the supervisor: flags it polls
/// on every tick, plus the master credentials it reloads against when they
/// change. No direct method calls into the running pipeline — everything
/// goes through this shared, sampled state.
#[derive(Default)]
pub struct SupervisorCommands {
    pub stop: AtomicBool,
    pub trading_enabled: AtomicBool,
    creds: AsyncMutex<Option<MasterCreds>>,
    manual_close: AsyncMutex<Vec<i64>>,
}

impl SupervisorCommands {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { trading_enabled: AtomicBool::new(true), ..Default::default() })
    }

    pub async fn set_master_creds(&self, ws_url: String, api_key: String, api_secret: String, black_symbols: Vec<String>) {
        *self.creds.lock().await = Some(MasterCreds { ws_url, api_key, api_secret, black_symbols });
    }

    pub async fn request_manual_close(&self, cids: Vec<i64>) {
        self.manual_close.lock().await.extend(cids);
    }

    async fn take_manual_close(&self) -> Vec<i64> {
        std::mem::take(&mut *self.manual_close.lock().await)
    }
}

pub struct Supervisor {
    commands: Arc<SupervisorCommands>,
    followers: Arc<FollowerRegistry>,
    spec_registry: Arc<SpecRegistry>,
    notifier: Arc<dyn Notifier>,
    quota_asset: String,
    state: SignalFsmState,
    shared_state: Arc<AsyncMutex<SignalFsmState>>,
    last_creds_hash: Option<String>,

    cache: Option<Arc<SignalCache>>,
    stream_stop: Option<Arc<AtomicBool>>,
    stream_ready: Option<Arc<AtomicBool>>,
    stream_handle: Option<JoinHandle<()>>,
    translator_handle: Option<JoinHandle<()>>,
    dispatch_tx: Option<mpsc::Sender<MasterEvent>>,
    dispatch_handle: Option<JoinHandle<()>>,
}

impl Supervisor {
    /// Builds the supervisor along with the shared state cell the admin
    /// surface's `/status` route reads; `run()` keeps both the local `state`
    /// field and this shared cell in sync on every transition.
    pub fn new(
        commands: Arc<SupervisorCommands>,
        followers: Arc<FollowerRegistry>,
        rest_base_url: &str,
        quota_asset: impl Into<String>,
        notifier: Arc<dyn Notifier>,
    ) -> anyhow::Result<(Self, Arc<AsyncMutex<SignalFsmState>>)> {
        let spec_client = RestClient::new(rest_base_url, "", "", None)?;
        let shared_state = Arc::new(AsyncMutex::new(SignalFsmState::NoCreds));
        let supervisor = Self {
            commands,
            followers,
            spec_registry: SpecRegistry::new(spec_client, Duration::from_secs(15)),
            notifier,
            quota_asset: quota_asset.into(),
            state: SignalFsmState::NoCreds,
            shared_state: shared_state.clone(),
            last_creds_hash: None,
            cache: None,
            stream_stop: None,
            stream_ready: None,
            stream_handle: None,
            translator_handle: None,
            dispatch_tx: None,
            dispatch_handle: None,
        };
        Ok((supervisor, shared_state))
    }

    pub fn state(&self) -> SignalFsmState {
        self.state
    }

    /// Updates both the local field (cheap synchronous reads inside `run()`)
    /// and the shared cell the admin surface polls.
    async fn set_state(&mut self, state: SignalFsmState) {
        self.state = state;
        *self.shared_state.lock().await = state;
    }

    /// Drives the state machine until a hard stop is observed. Never
    /// returns an error: every sub-failure is logged and retried on the
    /// next tick, the same fail-open posture as the rest of the pipeline.
    pub async fn run(mut self) {
        info!("supervisor starting");
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;

            if self.commands.stop.load(Ordering::SeqCst) {
                self.hard_stop().await;
                break;
            }

            let manual = self.commands.take_manual_close().await;
            if !manual.is_empty() && self.state == SignalFsmState::Running {
                self.run_manual_close(manual).await;
            }

            if !self.commands.trading_enabled.load(Ordering::SeqCst) {
                self.set_state(SignalFsmState::Paused).await;
                continue;
            }

            let creds = self.commands.creds.lock().await.clone();
            let Some(creds) = creds else {
                self.set_state(SignalFsmState::NoCreds).await;
                continue;
            };

            let hash = creds_hash(&creds);
            if self.last_creds_hash.as_deref() != Some(hash.as_str()) {
                self.set_state(SignalFsmState::Reload).await;
                self.reload(creds).await;
                self.last_creds_hash = Some(hash);
                self.set_state(SignalFsmState::Running).await;
            }
        }
        info!("supervisor stopped");
    }

    async fn run_manual_close(&self, cids: Vec<i64>) {
        let snapshot = self.followers.snapshot().await;
        let events = CommandBus::expand(&snapshot, &cids).await;
        if let Some(tx) = &self.dispatch_tx {
            for ev in events {
                let _ = tx.send(ev).await;
            }
        }
    }

    /// 7-step teardown, in the order the original system shuts its pieces
    /// down: stop intake first, drain in-flight work, then tear down
    /// connections from the innermost outward.
    async fn hard_stop(&mut self) {
        info!("supervisor hard stop");
        self.set_state(SignalFsmState::HardStop).await;

        if let Some(stop) = &self.stream_stop {
            stop.store(true, Ordering::SeqCst);
        }
        if let Some(h) = self.stream_handle.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), h).await;
        }
        if let Some(h) = self.translator_handle.take() {
            h.abort();
        }
        self.dispatch_tx = None;
        if let Some(h) = self.dispatch_handle.take() {
            h.abort();
        }
        self.followers.shutdown_all().await;
        self.last_creds_hash = None;
        self.cache = None;
        self.stream_stop = None;
        self.stream_ready = None;
    }

    /// Tears down the old master stream/translator (if any), builds fresh
    /// ones against the new credentials, and waits up to 15s for the new
    /// stream to report ready before handing off the dispatch loop.
    async fn reload(&mut self, creds: MasterCreds) {
        info!("supervisor reloading master credentials");

        if let Some(stop) = self.stream_stop.take() {
            stop.store(true, Ordering::SeqCst);
        }
        if let Some(h) = self.stream_handle.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), h).await;
        }
        if let Some(h) = self.translator_handle.take() {
            h.abort();
        }
        if let Some(h) = self.dispatch_handle.take() {
            h.abort();
        }

        let cache = Arc::new(SignalCache::new());
        let stream_cfg = MasterStreamConfig {
            ws_url: creds.ws_url,
            api_key: creds.api_key,
            api_secret: creds.api_secret,
            black_symbols: creds.black_symbols,
            quota_asset: self.quota_asset.clone(),
        };
        let stream = MasterStream::new(stream_cfg, cache.clone());
        let stop_handle = stream.stop_handle();
        let ready_handle = stream.ready_handle();
        let stream_handle = tokio::spawn(stream.run());

        let deadline = tokio::time::Instant::now() + STREAM_READY_TIMEOUT;
        while !ready_handle.load(Ordering::SeqCst) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(STREAM_READY_RETRY).await;
        }
        if !ready_handle.load(Ordering::SeqCst) {
            warn!("master stream did not report ready within {STREAM_READY_TIMEOUT:?}; continuing, it will keep retrying");
        }

        let (out_tx, out_rx) = mpsc::channel(1024);
        let translator = Translator::new(TranslatorConfig::from_env(), cache.clone(), out_tx.clone());
        let translator_handle = tokio::spawn(translator.run());

        let dispatch_handle = tokio::spawn(Self::dispatch_loop(
            out_rx,
            self.followers.clone(),
            self.spec_registry.clone(),
            self.notifier.clone(),
        ));

        self.cache = Some(cache);
        self.stream_stop = Some(stop_handle);
        self.stream_ready = Some(ready_handle);
        self.stream_handle = Some(stream_handle);
        self.translator_handle = Some(translator_handle);
        self.dispatch_tx = Some(out_tx);
        self.dispatch_handle = Some(dispatch_handle);
    }

    /// One event at a time off the translator's `out_queue`: resolves the
    /// symbol spec once, fans out to every targeted follower concurrently,
    /// then triggers the refresh/PnL-report pass for whichever followers
    /// were actually touched.
    async fn dispatch_loop(
        mut rx: mpsc::Receiver<MasterEvent>,
        followers: Arc<FollowerRegistry>,
        spec_registry: Arc<SpecRegistry>,
        notifier: Arc<dyn Notifier>,
    ) {
        while let Some(event) = rx.recv().await {
            let spec = spec_registry.get(&event.symbol).await;
            let snapshot = followers.snapshot().await;

            let targets: Vec<(i64, Arc<AsyncMutex<FollowerRuntime>>)> = match event.cid {
                Some(cid) => snapshot.get(&cid).map(|rt| vec![(cid, rt.clone())]).into_iter().flatten().collect(),
                None => snapshot.iter().map(|(cid, rt)| (*cid, rt.clone())).collect(),
            };

            let mut handles = Vec::with_capacity(targets.len());
            for (cid, rt) in targets {
                let event = event.clone();
                handles.push(tokio::spawn(async move {
                    Executor::dispatch(&rt, &event, &spec).await;
                    cid
                }));
            }

            let mut touched = Vec::new();
            for h in handles {
                if let Ok(cid) = h.await {
                    touched.push(cid);
                }
            }

            if !touched.is_empty() {
                let full_snapshot = followers.snapshot().await;
                let reports = RefreshCoordinator::trigger(&full_snapshot, touched).await;
                for report in reports {
                    notifier.pnl_report(&report).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_creds_hash_changes_with_api_key() {
        let a = MasterCreds { ws_url: "w".into(), api_key: "k1".into(), api_secret: "s".into(), black_symbols: vec![] };
        let b = MasterCreds { api_key: "k2".into(), ..a.clone() };
        assert_ne!(creds_hash(&a), creds_hash(&b));
    }

    #[test]
    fn test_creds_hash_stable_for_same_input() {
        let a = MasterCreds { ws_url: "w".into(), api_key: "k".into(), api_secret: "s".into(), black_symbols: vec!["X".into()] };
        assert_eq!(creds_hash(&a), creds_hash(&a.clone()));
    }

    #[tokio::test]
    async fn test_commands_default_to_trading_enabled_and_no_creds() {
        let cmds = SupervisorCommands::new();
        assert!(cmds.trading_enabled.load(Ordering::SeqCst));
        assert!(!cmds.stop.load(Ordering::SeqCst));
        assert!(cmds.creds.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_manual_close_queue_drains_once() {
        let cmds = SupervisorCommands::new();
        cmds.request_manual_close(vec![1, 2]).await;
        let drained = cmds.take_manual_close().await;
        assert_eq!(drained, vec![1, 2]);
        assert!(cmds.take_manual_close().await.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_loop_exits_when_sender_dropped() {
        let followers = Arc::new(FollowerRegistry::new("https://example.invalid"));
        let spec_client = RestClient::new("https://example.invalid", "", "", None).unwrap();
        let spec_registry = SpecRegistry::new(spec_client, Duration::from_secs(15));
        let notifier: Arc<dyn Notifier> = Arc::new(super::super::notifier::LogNotifier);
        let (tx, rx) = mpsc::channel(8);
        drop(tx);
        // Should return promptly once the channel is closed, not hang.
        tokio::time::timeout(Duration::from_secs(2), Supervisor::dispatch_loop(rx, followers, spec_registry, notifier))
            .await
            .unwrap();
    }
}
