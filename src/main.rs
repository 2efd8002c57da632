//! mup - a multi-protocol chat bot runtime.
//!
//! Reconciles account clients (IRC, Telegram, Signal, WebHook) and plugins
//! against a SQLite store, with all chat traffic routed through a single
//! append-only `message` table (§3, §4.3, §4.5, §4.6).

mod account;
mod config;
mod db;
mod dying;
mod error;
mod ldap;
mod plugin;
mod plugins;
mod telemetry;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use crate::account::{AccountManager, ClientContext};
use crate::config::{Args, Settings};
use crate::db::Database;
use crate::error::Result;
use crate::plugin::PluginManager;

/// Inbound channel depth between account clients and the account manager.
/// Generous: the account manager drains it into the store on every tick and
/// backpressure here would stall every client's reader loop (§4.5, §5).
const INBOUND_CHANNEL_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() {
    let args = match Args::parse(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("ERROR: {e}");
            std::process::exit(1);
        }
    };

    match run(args).await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            tracing::error!(error = %e, code = e.error_code(), "fatal error");
            std::process::exit(e.exit_code());
        }
    }
}

async fn run(args: Args) -> Result<()> {
    std::fs::create_dir_all(&args.dir).map_err(crate::config::ConfigError::from)?;
    let settings = Settings::load(&args.config_path())?;

    crate::telemetry::init(settings.log_format, args.debug);

    info!(dir = %args.dir.display(), "starting mup");

    crate::plugins::register_all();

    let db = Database::new(&args.db_path().to_string_lossy()).await?;

    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
    let client_ctx = ClientContext {
        network_timeout: settings.network_timeout(),
        inbound: inbound_tx,
        telegram_api_host: settings.telegram_api_host.clone(),
        bang: settings.bang,
        webhook_listen: settings.webhook_listen.clone(),
    };
    let (account_manager, account_dying) = AccountManager::new(db.clone(), client_ctx, settings.account_refresh_secs);
    let (plugin_manager, plugin_dying) = PluginManager::new(db.clone(), settings.max_text_len, settings.min_text_len);

    let plugin_refresh = non_negative_period(settings.plugin_refresh_secs);

    let account_task = tokio::spawn(Arc::clone(&account_manager).run(
        inbound_rx,
        args.accounts.clone(),
        account_dying.child(),
    ));
    let plugin_task = tokio::spawn(Arc::clone(&plugin_manager).run(
        args.plugins.clone(),
        plugin_refresh,
        plugin_dying.child(),
    ));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping");

    account_dying.kill();
    plugin_dying.kill();
    if let Err(e) = account_task.await {
        tracing::warn!(error = %e, "account manager task panicked");
    }
    if let Err(e) = plugin_task.await {
        tracing::warn!(error = %e, "plugin manager task panicked");
    }

    info!("shutdown complete");
    Ok(())
}

fn non_negative_period(secs: i64) -> Option<std::time::Duration> {
    if secs < 0 {
        None
    } else {
        Some(std::time::Duration::from_secs(secs.max(0) as u64))
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("received ctrl-c");
}
