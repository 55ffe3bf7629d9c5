//! Demonstration harness for the `raid_ledger` library: wires an `Engine`
//! to in-memory persistence and a no-op presence source, runs the periodic
//! schedulers, and exits cleanly on `SIGINT`/`SIGTERM`. A real deployment
//! swaps the in-memory store for `persistence::postgres::PostgresStore` and
//! the no-op presence source for an actual gateway integration (§1
//! Non-goals) — neither is this binary's concern.

use std::env;
use std::fs;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use raid_ledger::clock::SystemClock;
use raid_ledger::engine::{Engine, Stores};
use raid_ledger::model::DiscordId;
use raid_ledger::persistence::memory::MemoryStore;
use raid_ledger::ports::{GatewayEvent, NotificationPayload, NotificationSender, PresenceEventSource};
use raid_ledger::utils::prelude::*;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// A presence source that never yields events and reports every guild as
/// empty. Stands in for a real gateway connection (§1 Non-goals) so the
/// engine's startup recovery and periodic loops have something to drive
/// against in this demo.
struct NoPresence;

#[async_trait]
impl PresenceEventSource for NoPresence {
    async fn next_event(&self) -> Option<GatewayEvent> {
        None
    }

    async fn occupied_voice_channels(
        &self,
        _guild_id: DiscordId,
    ) -> AnyResult<Vec<(DiscordId, Vec<(DiscordId, raid_ledger::model::MemberHint)>)>> {
        Ok(vec![])
    }
}

/// Logs notifications instead of rendering them to Discord. §1 Non-goals:
/// the core does not render human-readable notification bodies.
struct LoggingSender;

#[async_trait]
impl NotificationSender for LoggingSender {
    async fn send_or_edit(
        &self,
        channel_id: DiscordId,
        message_id: Option<String>,
        payload: NotificationPayload,
    ) -> AnyResult<String> {
        info!("notification for channel '{channel_id}' (existing message {message_id:?}): {payload:?}");
        Ok(message_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()))
    }
}

#[tracing::instrument]
#[tokio::main]
async fn main() -> AnyResult<()> {
    simple_env_load::load_env_from([".env"]);

    std::fs::create_dir_all("./data/").map_err(|e| anyhow::anyhow!("Failed to create data folder: {}", e))?;

    let logfile =
        fs::File::create("./data/log.log").map_err(|e| anyhow::anyhow!("Failed to create log file: {}", e))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::DEBUG.into())
                .try_from_env()
                .with_context(|| format!("Problem with `RUST_LOG={}`", env::var("RUST_LOG").unwrap_or_default()))?,
        )
        .with_ansi(false)
        .with_writer(Mutex::new(logfile))
        .compact()
        .init();

    info!("Starting raid-ledger demo harness");

    let clock = Arc::new(SystemClock);
    let store = MemoryStore::new(clock.clone());
    let stores = Stores {
        bindings: store.clone(),
        games: store.clone(),
        sessions: store.clone(),
        events: store.clone(),
        signups: store.clone(),
        availability: store,
    };

    let guild_id = env::var("DEMO_GUILD_ID")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(DiscordId)
        .unwrap_or(DiscordId(0));

    let engine = Engine::new(guild_id, stores, Arc::new(LoggingSender), clock);
    engine
        .start(Arc::new(NoPresence))
        .await
        .context("failed to start engine")?;

    wait_for_shutdown_signal().await;

    info!("Shutdown signal received, stopping engine");
    engine.shutdown().await;

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {},
        _ = sigint.recv() => {},
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
