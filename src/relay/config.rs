//! Ambient configuration: process-wide constants read from the environment,
//! and the single-file JSON persistence of follower configs (§6: "a single
//! JSON file keyed by follower id, rewritten in full on any change").

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::follower::FollowerConfig;

/// Process-wide knobs. Every field has a sane default so the service runs
/// out of the box against a `.env` file, matching the teacher's `from_env`
/// convention on every actor config.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub rest_base_url: String,
    pub quota_asset: String,
    pub spec_ttl_ms: u64,
    pub session_ttl_ms: u64,
    pub cmd_ttl_ms: u64,
    pub requests_delay_ms: u64,
    pub state_path: PathBuf,
    pub admin_addr: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            rest_base_url: "https://contract.mexc.com".to_string(),
            quota_asset: "USDT".to_string(),
            spec_ttl_ms: 15_000,
            session_ttl_ms: 30_000,
            cmd_ttl_ms: 250,
            requests_delay_ms: 200,
            state_path: PathBuf::from("relay_state.json"),
            admin_addr: "127.0.0.1:8088".to_string(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let mut c = Self::default();
        if let Ok(v) = std::env::var("REST_BASE_URL") {
            c.rest_base_url = v;
        }
        if let Ok(v) = std::env::var("QUOTA_ASSET") {
            c.quota_asset = v;
        }
        if let Ok(v) = std::env::var("SPEC_TTL_MS") {
            if let Ok(n) = v.parse() {
                c.spec_ttl_ms = n;
            }
        }
        if let Ok(v) = std::env::var("SESSION_TTL_MS") {
            if let Ok(n) = v.parse() {
                c.session_ttl_ms = n;
            }
        }
        if let Ok(v) = std::env::var("CMD_TTL_MS") {
            if let Ok(n) = v.parse() {
                c.cmd_ttl_ms = n;
            }
        }
        if let Ok(v) = std::env::var("REQUESTS_DELAY_MS") {
            if let Ok(n) = v.parse() {
                c.requests_delay_ms = n;
            }
        }
        if let Ok(v) = std::env::var("RELAY_STATE_PATH") {
            c.state_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ADMIN_ADDR") {
            c.admin_addr = v;
        }
        c
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedFollowerConfig {
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

impl From<&FollowerConfig> for PersistedFollowerConfig {
    fn from(c: &FollowerConfig) -> Self {
        Self {
            id: c.id,
            api_key: c.api_key.clone(),
            api_secret: c.api_secret.clone(),
            proxy: c.proxy.clone(),
            coef: c.coef,
            leverage: c.leverage,
            margin_mode: c.margin_mode,
            max_position_size: c.max_position_size,
            random_size_pct: c.random_size_pct,
            delay_ms: c.delay_ms,
            enabled: c.enabled,
        }
    }
}

impl From<PersistedFollowerConfig> for FollowerConfig {
    fn from(c: PersistedFollowerConfig) -> Self {
        Self {
            id: c.id,
            api_key: c.api_key,
            api_secret: c.api_secret,
            proxy: c.proxy,
            coef: c.coef,
            leverage: c.leverage,
            margin_mode: c.margin_mode,
            max_position_size: c.max_position_size,
            random_size_pct: c.random_size_pct,
            delay_ms: c.delay_ms,
            enabled: c.enabled,
        }
    }
}

/// Single JSON file keyed by follower id (0 reserved for master metadata,
/// never carries a `FollowerConfig`). Rewritten wholesale on every change;
/// this is a single-process service so no atomic-rename dance is needed.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PersistedState {
    pub followers: HashMap<i64, PersistedFollowerConfig>,
}

impl PersistedState {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn upsert(&mut self, cfg: &FollowerConfig) {
        self.followers.insert(cfg.id, cfg.into());
    }

    pub fn remove(&mut self, id: i64) {
        self.followers.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(id: i64) -> FollowerConfig {
        FollowerConfig {
            id,
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

    #[test]
    fn test_roundtrip_through_json() {
        let mut state = PersistedState::default();
        state.upsert(&cfg(1));
        let json = serde_json::to_string(&state).unwrap();
        let back: PersistedState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.followers[&1].leverage, Some(10));
    }

    #[test]
    fn test_load_missing_file_returns_empty_state() {
        let state = PersistedState::load(Path::new("/nonexistent/relay_state_test.json")).unwrap();
        assert!(state.followers.is_empty());
    }

    #[test]
    fn test_remove_clears_entry() {
        let mut state = PersistedState::default();
        state.upsert(&cfg(1));
        state.remove(1);
        assert!(!state.followers.contains_key(&1));
    }
}
