//! NetworkSession: one long-lived HTTP session per account (or the shared
//! public session), with ping-based degradation detection and a
//! single-flight recreate.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

const PING_INTERVAL: Duration = Duration::from_secs(10);
const PING_RETRY_DELAY: Duration = Duration::from_millis(150);
const PING_FAIL_THRESHOLD: u32 = 3;
const SESSION_TTL: Duration = Duration::from_secs(30);
const WAIT_READY_POLL: Duration = Duration::from_millis(10);
const SESSION_CLOSE_BOUND: Duration = Duration::from_secs(3);

pub struct NetworkSession {
    base_url: String,
    proxy: Option<String>,
    client: AsyncMutex<Option<reqwest::Client>>,
    ready: AtomicBool,
    stopped: AtomicBool,
    fail_count: AtomicU32,
    recreate_lock: AsyncMutex<()>,
}

impl NetworkSession {
    pub fn new(base_url: impl Into<String>, proxy: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            proxy,
            client: AsyncMutex::new(None),
            ready: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            fail_count: AtomicU32::new(0),
            recreate_lock: AsyncMutex::new(()),
        }
    }

    fn build_client(&self) -> anyhow::Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(10));
        if let Some(p) = &self.proxy {
            builder = builder.proxy(reqwest::Proxy::all(p)?);
        }
        Ok(builder.build()?)
    }

    pub async fn initialize(&self) -> anyhow::Result<()> {
        let client = self.build_client()?;
        *self.client.lock().await = Some(client);
        self.ready.store(true, Ordering::SeqCst);
        self.fail_count.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Polls up to `timeout` at 10ms granularity; false on timeout or stop.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout.min(SESSION_TTL);
        while tokio::time::Instant::now() < deadline {
            if self.stopped.load(Ordering::SeqCst) {
                return false;
            }
            if self.ready.load(Ordering::SeqCst) {
                return true;
            }
            tokio::time::sleep(WAIT_READY_POLL).await;
        }
        false
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && !self.stopped.load(Ordering::SeqCst)
    }

    async fn ping_once(&self) -> anyhow::Result<()> {
        let guard = self.client.lock().await;
        let client = guard.as_ref().ok_or_else(|| anyhow::anyhow!("session not initialized"))?;
        let resp = client.get(format!("{}/api/v1/contract/ping", self.base_url)).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("ping status {}", resp.status());
        }
        Ok(())
    }

    /// Degradation triggers a single-flight recreate; concurrent callers see
    /// the in-progress attempt and return without duplicating work.
    pub async fn notify_failure(&self, reason: &str) {
        let Ok(_guard) = self.recreate_lock.try_lock() else {
            return;
        };
        warn!("session degraded ({reason}), recreating");
        self.ready.store(false, Ordering::SeqCst);

        {
            let mut client = self.client.lock().await;
            let _ = tokio::time::timeout(SESSION_CLOSE_BOUND, async { *client = None }).await;
        }

        if let Err(e) = self.initialize().await {
            warn!("session recreate failed: {e:#}");
        } else {
            info!("session recreated after {reason}");
        }
    }

    pub async fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.ready.store(false, Ordering::SeqCst);
        let mut client = self.client.lock().await;
        let _ = tokio::time::timeout(SESSION_CLOSE_BOUND, async { *client = None }).await;
    }

    /// Spawns the ping loop as a background task; returns its join handle so
    /// the owner can await it during shutdown.
    pub fn start_ping_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.ping_loop().await })
    }

    async fn ping_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(PING_INTERVAL).await;
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            match self.ping_once().await {
                Ok(()) => {
                    self.fail_count.store(0, Ordering::SeqCst);
                }
                Err(e) => {
                    let fails = self.fail_count.fetch_add(1, Ordering::SeqCst) + 1;
                    warn!("ping failed ({fails}/{PING_FAIL_THRESHOLD}): {e:#}");
                    tokio::time::sleep(PING_RETRY_DELAY).await;
                    if fails >= PING_FAIL_THRESHOLD {
                        self.fail_count.store(0, Ordering::SeqCst);
                        self.notify_failure("ping_degradation").await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initialize_then_wait_ready_succeeds_immediately() {
        let s = NetworkSession::new("https://example.invalid", None);
        s.initialize().await.unwrap();
        assert!(s.wait_ready(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn test_wait_ready_times_out_when_never_initialized() {
        let s = NetworkSession::new("https://example.invalid", None);
        assert!(!s.wait_ready(Duration::from_millis(30)).await);
    }

    #[tokio::test]
    async fn test_shutdown_clears_ready() {
        let s = NetworkSession::new("https://example.invalid", None);
        s.initialize().await.unwrap();
        s.shutdown().await;
        assert!(!s.is_ready());
        assert!(!s.wait_ready(Duration::from_millis(10)).await);
    }
}
