use std::sync::Arc;

use anyhow::Context;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use pm_copy_relay::admin_http::{self, AdminState};
use pm_copy_relay::relay::config::{AppConfig, PersistedState};
use pm_copy_relay::relay::follower::FollowerRegistry;
use pm_copy_relay::relay::notifier::LogNotifier;
use pm_copy_relay::relay::supervisor::{Supervisor, SupervisorCommands};

/*
PIPELINE:
WS -> CACHE -> TRANSLATOR -> COPY (FOLLOWER FAN-OUT) -> EXECUTOR
*/

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_max_level(Level::INFO)
        .init();

    let app_config = Arc::new(AppConfig::from_env());
    info!("starting against {}", app_config.rest_base_url);

    let persisted = PersistedState::load(&app_config.state_path).context("failed to load persisted follower state")?;
    let state_store = Arc::new(tokio::sync::Mutex::new(persisted));

    let followers = Arc::new(FollowerRegistry::new(app_config.rest_base_url.clone()));
    {
        let persisted = state_store.lock().await;
        for cfg in persisted.followers.values().filter(|c| c.enabled) {
            if let Err(e) = followers.activate(cfg.clone().into()).await {
                tracing::error!("failed to activate persisted follower {}: {e:#}", cfg.id);
            }
        }
    }

    let commands = SupervisorCommands::new();
    if let (Ok(ws_url), Ok(api_key), Ok(api_secret)) =
        (std::env::var("MASTER_WS_URL"), std::env::var("MASTER_API_KEY"), std::env::var("MASTER_API_SECRET"))
    {
        let black_symbols = std::env::var("BLACK_SYMBOLS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        commands.set_master_creds(ws_url, api_key, api_secret, black_symbols).await;
    } else {
        info!("no master credentials in environment; starting in NO_CREDS, waiting for the admin surface");
    }

    let notifier = Arc::new(LogNotifier);
    let (supervisor, supervisor_state) =
        Supervisor::new(commands.clone(), followers.clone(), &app_config.rest_base_url, app_config.quota_asset.clone(), notifier)
            .context("failed to construct supervisor")?;
    let supervisor_handle = tokio::spawn(supervisor.run());

    let admin_addr = app_config.admin_addr.parse().context("invalid ADMIN_ADDR")?;
    let admin_state = AdminState {
        commands,
        followers,
        app_config,
        state_store,
        supervisor_state,
        stop_token: Arc::new(tokio::sync::Mutex::new(None)),
    };
    let admin_handle = tokio::spawn(admin_http::serve(admin_state, admin_addr));

    tokio::select! {
        res = supervisor_handle => {
            if let Err(e) = res {
                tracing::error!("supervisor task panicked: {e:#}");
            }
        }
        res = admin_handle => {
            if let Err(e) = res {
                tracing::error!("admin surface task panicked: {e:#}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c received, shutting down");
        }
    }

    Ok(())
}
