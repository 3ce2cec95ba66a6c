//! Admin HTTP surface: the external UI's only way to talk to the relay.
//! `activate`/`deactivate`/`manual_close`/config edits/credentials/`status`,
//! plus a two-step `stop` that requires an explicit confirm token so a
//! stray request can't tear the whole service down.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::relay::config::{AppConfig, PersistedFollowerConfig, PersistedState};
use crate::relay::follower::{FollowerConfig, FollowerRegistry};
use crate::relay::supervisor::{SignalFsmState, SupervisorCommands};

#[derive(Clone)]
pub struct AdminState {
    pub commands: Arc<SupervisorCommands>,
    pub followers: Arc<FollowerRegistry>,
    pub app_config: Arc<AppConfig>,
    pub state_store: Arc<tokio::sync::Mutex<PersistedState>>,
    pub supervisor_state: Arc<tokio::sync::Mutex<SignalFsmState>>,
    pub stop_token: Arc<tokio::sync::Mutex<Option<String>>>,
}

pub async fn serve(state: AdminState, addr: SocketAddr) {
    let app = Router::new()
        .route("/status", get(status))
        .route("/activate", post(activate))
        .route("/deactivate", post(deactivate))
        .route("/manual_close", post(manual_close))
        .route("/config", post(set_config))
        .route("/credentials", post(set_credentials))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .with_state(state);

    info!("admin surface listening on {addr}");
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("admin surface failed to bind {addr}: {e:#}");
            return;
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("admin surface stopped: {e:#}");
    }
}

#[derive(Serialize)]
struct StatusResponse {
    state: String,
    trading_enabled: bool,
    follower_ids: Vec<i64>,
}

async fn status(State(state): State<AdminState>) -> Json<StatusResponse> {
    let fsm = *state.supervisor_state.lock().await;
    let ids: Vec<i64> = state.followers.snapshot().await.keys().copied().collect();
    Json(StatusResponse {
        state: format!("{fsm:?}"),
        trading_enabled: state.commands.trading_enabled.load(Ordering::SeqCst),
        follower_ids: ids,
    })
}

#[derive(Deserialize)]
struct IdsBody {
    ids: Vec<i64>,
}

#[derive(Serialize)]
struct ActivateResult {
    activated: Vec<i64>,
    failed: Vec<(i64, String)>,
}

/// Activates each requested follower, looking its persisted config up by id.
/// A missing persisted config is a per-id failure, not a whole-request error.
async fn activate(State(state): State<AdminState>, Json(body): Json<IdsBody>) -> Json<ActivateResult> {
    let mut result = ActivateResult { activated: Vec::new(), failed: Vec::new() };
    let persisted = state.state_store.lock().await;
    for id in body.ids {
        match persisted.followers.get(&id) {
            Some(cfg) => {
                let cfg: FollowerConfig = cfg.clone().into();
                match state.followers.activate(cfg).await {
                    Ok(()) => result.activated.push(id),
                    Err(e) => result.failed.push((id, format!("{e:#}"))),
                }
            }
            None => result.failed.push((id, "no persisted config for this id".to_string())),
        }
    }
    Json(result)
}

async fn deactivate(State(state): State<AdminState>, Json(body): Json<IdsBody>) -> Json<Vec<i64>> {
    for id in &body.ids {
        state.followers.deactivate(*id).await;
    }
    Json(body.ids)
}

async fn manual_close(State(state): State<AdminState>, Json(body): Json<IdsBody>) -> Json<Vec<i64>> {
    state.commands.request_manual_close(body.ids.clone()).await;
    Json(body.ids)
}

/// Upserts one follower's persisted config and returns it. Takes effect on
/// the follower's next `activate`; it does not hot-patch a running runtime.
async fn set_config(State(state): State<AdminState>, Json(cfg): Json<PersistedFollowerConfig>) -> Json<PersistedFollowerConfig> {
    let mut persisted = state.state_store.lock().await;
    persisted.upsert(&cfg.clone().into());
    if let Err(e) = persisted.save(&state.app_config.state_path) {
        tracing::warn!("failed to persist follower config: {e:#}");
    }
    Json(cfg)
}

#[derive(Deserialize)]
struct CredentialsBody {
    ws_url: String,
    api_key: String,
    api_secret: String,
    #[serde(default)]
    black_symbols: Vec<String>,
}

async fn set_credentials(State(state): State<AdminState>, Json(body): Json<CredentialsBody>) {
    state.commands.set_master_creds(body.ws_url, body.api_key, body.api_secret, body.black_symbols).await;
}

async fn start(State(state): State<AdminState>) {
    state.commands.trading_enabled.store(true, Ordering::SeqCst);
}

#[derive(Deserialize)]
struct StopBody {
    confirm: Option<String>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum StopResponse {
    NeedsConfirm { confirm_token: String },
    Stopped,
}

/// Two-step stop: the first call without `confirm` mints a one-time token
/// and does nothing else; only a second call quoting that token triggers
/// the supervisor's hard stop. Guards against an accidental stray request.
async fn stop(State(state): State<AdminState>, Json(body): Json<StopBody>) -> Json<StopResponse> {
    let mut pending = state.stop_token.lock().await;
    match (body.confirm, pending.clone()) {
        (Some(given), Some(expected)) if given == expected => {
            *pending = None;
            state.commands.stop.store(true, Ordering::SeqCst);
            Json(StopResponse::Stopped)
        }
        _ => {
            let token = uuid::Uuid::new_v4().to_string();
            *pending = Some(token.clone());
            Json(StopResponse::NeedsConfirm { confirm_token: token })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stop_requires_two_calls() {
        let state = AdminState {
            commands: SupervisorCommands::new(),
            followers: Arc::new(FollowerRegistry::new("https://example.invalid")),
            app_config: Arc::new(AppConfig::default()),
            state_store: Arc::new(tokio::sync::Mutex::new(PersistedState::default())),
            supervisor_state: Arc::new(tokio::sync::Mutex::new(SignalFsmState::NoCreds)),
            stop_token: Arc::new(tokio::sync::Mutex::new(None)),
        };

        let Json(first) = stop(State(state.clone()), Json(StopBody { confirm: None })).await;
        let token = match first {
            StopResponse::NeedsConfirm { confirm_token } => confirm_token,
            StopResponse::Stopped => panic!("first call must not stop"),
        };
        assert!(!state.commands.stop.load(Ordering::SeqCst));

        let Json(second) = stop(State(state.clone()), Json(StopBody { confirm: Some(token) })).await;
        assert!(matches!(second, StopResponse::Stopped));
        assert!(state.commands.stop.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stop_rejects_wrong_token() {
        let state = AdminState {
            commands: SupervisorCommands::new(),
            followers: Arc::new(FollowerRegistry::new("https://example.invalid")),
            app_config: Arc::new(AppConfig::default()),
            state_store: Arc::new(tokio::sync::Mutex::new(PersistedState::default())),
            supervisor_state: Arc::new(tokio::sync::Mutex::new(SignalFsmState::NoCreds)),
            stop_token: Arc::new(tokio::sync::Mutex::new(None)),
        };
        stop(State(state.clone()), Json(StopBody { confirm: None })).await;
        let Json(resp) = stop(State(state.clone()), Json(StopBody { confirm: Some("wrong".to_string()) })).await;
        assert!(matches!(resp, StopResponse::NeedsConfirm { .. }));
        assert!(!state.commands.stop.load(Ordering::SeqCst));
    }
}
