//! codexcord
//!
//! Mirrors Codex CLI sessions into Discord: one channel per project
//! directory, one thread per session, and messages typed into a thread run
//! the next turn.

mod canonical;
mod cmd_status;
mod config;
mod coordinator;
mod echo;
mod formatter;
mod keyed;
mod lock;
mod logging;
mod migration_runner;
mod paths;
mod relay;
mod session_naming;
mod store;
mod tailer;
#[cfg(test)]
pub mod testing;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use codexcord_connector_codex::CodexExecRunner;
use codexcord_connector_core::{ChatEvent, ChatPlatform, TurnRunner};
use codexcord_connector_discord::{DiscordClient, DiscordConfig, DiscordIngress, WatchSet};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{Cli, Command, StartArgs};
use crate::coordinator::SyncCoordinator;
use crate::echo::EchoSuppressor;
use crate::lock::InstanceLock;
use crate::paths::DataPaths;
use crate::relay::{InteractiveRelay, RelayConfig};
use crate::store::{MappingStore, StoreError};
use crate::tailer::{startup_seed, watch_sessions_dir, LogTailer, TailBatch};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let paths = DataPaths::resolve(cli.data_dir.as_deref()).context("resolve data dir")?;

    match cli.command {
        None => run_start(paths, cli.start).await,
        Some(Command::Start(args)) => run_start(paths, args).await,
        Some(Command::Status) => cmd_status::status(&paths),
        Some(Command::Projects) => cmd_status::projects(&paths),
        Some(Command::ForgetProject { path }) => cmd_status::forget_project(&paths, &path),
    }
}

async fn run_start(paths: DataPaths, args: StartArgs) -> anyhow::Result<()> {
    paths.ensure_dirs().context("create data dir")?;
    let logging = logging::init_logging(&paths).context("init logging")?;
    let _lock = InstanceLock::acquire(&paths.lock_path()).context("acquire instance lock")?;

    info!(
        component = "server",
        event = "server.starting",
        run_id = %logging.run_id,
        version = VERSION,
        data_dir = %paths.root().display(),
        "Starting codexcord"
    );

    let store = Arc::new(MappingStore::open(&paths.db_path()).context("open mapping store")?);

    let token = args
        .discord_token
        .clone()
        .filter(|t| !t.trim().is_empty())
        .context("a Discord bot token is required (--discord-token or DISCORD_BOT_TOKEN)")?;
    let guild_id = args
        .guild_id
        .clone()
        .context("a Discord guild id is required (--guild-id or DISCORD_GUILD_ID)")?;
    let discord = DiscordClient::new(DiscordConfig {
        api_base: args.discord_api_base.clone(),
        bot_token: token,
        guild_id,
        category_id: args.category_id.clone(),
    })
    .context("build Discord client")?;
    let chat: Arc<dyn ChatPlatform> = Arc::new(discord.clone());

    let echo = Arc::new(EchoSuppressor::new(args.echo_ttl()));
    let coordinator = Arc::new(SyncCoordinator::new(
        store.clone(),
        chat.clone(),
        echo.clone(),
        args.coordinator_config(),
    ));
    let runner: Arc<dyn TurnRunner> =
        Arc::new(CodexExecRunner::new(args.codex_bin.to_string_lossy()));
    let relay = Arc::new(InteractiveRelay::new(
        coordinator.clone(),
        store.clone(),
        chat,
        echo.clone(),
        runner,
        RelayConfig {
            show_reasoning: args.show_reasoning,
        },
    ));

    let sessions_dir = resolve_sessions_dir(&args)?;
    std::fs::create_dir_all(&sessions_dir)
        .with_context(|| format!("create sessions dir {}", sessions_dir.display()))?;

    let (batch_tx, batch_rx) = mpsc::unbounded_channel();
    let mut tailer = LogTailer::new(args.tailer_config(), batch_tx);
    let mapped = store.mapped_session_ids()?;
    startup_seed(&mut tailer, &sessions_dir, &mapped);
    let tailer_handle = tailer.handle();
    let tailer_task = tailer.spawn();
    let watcher = watch_sessions_dir(&sessions_dir, tailer_handle.clone())
        .with_context(|| format!("watch {}", sessions_dir.display()))?;

    let batches = spawn_batch_consumer(coordinator.clone(), batch_rx);
    let ingress = spawn_ingress(
        DiscordIngress::new(discord),
        store.clone(),
        coordinator.clone(),
        relay,
        args.ingress_interval(),
    );
    let maintenance = spawn_maintenance(coordinator, echo);

    info!(
        component = "server",
        event = "server.started",
        sessions_dir = %sessions_dir.display(),
        mapped_sessions = mapped.len(),
        "codexcord running"
    );

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!(
        component = "server",
        event = "server.shutdown",
        "Shutting down"
    );

    drop(watcher);
    tailer_handle.stop();
    ingress.abort();
    maintenance.abort();
    batches.abort();
    if let Err(err) = tailer_task.await {
        warn!(
            component = "server",
            event = "server.tailer_join_failed",
            error = %err,
            "Tailer task ended abnormally"
        );
    }
    Ok(())
}

fn resolve_sessions_dir(args: &StartArgs) -> anyhow::Result<PathBuf> {
    match &args.sessions_dir {
        Some(dir) => Ok(dir.clone()),
        None => paths::default_sessions_dir()
            .context("cannot locate the Codex sessions dir; pass --sessions-dir"),
    }
}

fn spawn_batch_consumer(
    coordinator: Arc<SyncCoordinator>,
    mut batches: mpsc::UnboundedReceiver<TailBatch>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(batch) = batches.recv().await {
            coordinator.handle_batch(batch).await;
        }
    })
}

fn spawn_ingress(
    mut ingress: DiscordIngress,
    store: Arc<MappingStore>,
    coordinator: Arc<SyncCoordinator>,
    relay: Arc<InteractiveRelay>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let watch = match watch_set(&store) {
                Ok(watch) => watch,
                Err(err) => {
                    warn!(
                        component = "ingress",
                        event = "ingress.watch_set_failed",
                        error = %err,
                        "Failed loading mapped channels"
                    );
                    continue;
                }
            };

            for event in ingress.poll_once(&watch).await {
                match event {
                    ChatEvent::MessageCreated {
                        thread_id,
                        message_id,
                        content,
                        ..
                    } => {
                        let relay = relay.clone();
                        tokio::spawn(async move {
                            if let Err(err) =
                                relay.handle_message(&thread_id, &message_id, &content).await
                            {
                                warn!(
                                    component = "relay",
                                    event = "relay.message_failed",
                                    thread_id = %thread_id,
                                    error = %err,
                                    "Failed relaying chat message"
                                );
                            }
                        });
                    }
                    other => {
                        if let Err(err) = coordinator.handle_chat_event(other).await {
                            warn!(
                                component = "ingress",
                                event = "ingress.event_failed",
                                error = %err,
                                "Failed applying chat event"
                            );
                        }
                    }
                }
            }
        }
    })
}

fn watch_set(store: &MappingStore) -> Result<WatchSet, StoreError> {
    Ok(WatchSet {
        channels: store
            .list_projects()?
            .into_iter()
            .map(|p| p.channel_id)
            .collect(),
        threads: store.chat_thread_ids()?,
    })
}

/// Echo bucket pruning and mapping retries for sessions stuck in the buffer
/// after a transient failure.
fn spawn_maintenance(
    coordinator: Arc<SyncCoordinator>,
    echo: Arc<EchoSuppressor>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let pruned = echo.prune();
            let retries = coordinator.retry_pending();
            if pruned > 0 || !retries.is_empty() {
                info!(
                    component = "server",
                    event = "server.maintenance",
                    pruned_echo_buckets = pruned,
                    pending_retries = retries.len(),
                    "Maintenance pass"
                );
            }
            futures::future::join_all(retries).await;
        }
    })
}
