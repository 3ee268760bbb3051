use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use fleet_common::config::{resolve_config_path, FleetConfig, DEFAULT_CONFIG_FILE};
use fleet_orchestration::journal::JOURNAL_FILE;
use fleet_orchestration::{
    dispatcher_from_config, ActivityMonitor, CommandRouter, Coordinator, FileSignalSource,
    Journal, Mailbox, MailboxTransport, MessageHandler, WorkflowEngine,
};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fleetd", version)]
#[command(about = "Fleet coordination daemon")]
struct Cli {
    /// Config file (falls back to $FLEET_CONFIG, then ./fleet.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging (ignored when RUST_LOG is set)
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let Some(config_path) = resolve_config_path(cli.config) else {
        bail!("no config file given and ./{DEFAULT_CONFIG_FILE} does not exist");
    };
    let config = FleetConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    config.ensure_roots().context("preparing storage roots")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        agents = ?config.agents,
        supervisor = %config.supervisor,
        orchestrator = %config.orchestrator,
        dispatch = ?config.dispatch.mode,
        "fleetd starting"
    );

    let journal = Arc::new(
        Journal::open(config.runtime_root.join(JOURNAL_FILE)).context("opening journal")?,
    );
    let dispatcher = dispatcher_from_config(&config);
    let coordinator = Arc::new(
        Coordinator::from_config(&config)
            .context("opening task store")?
            .with_journal(journal.clone()),
    );

    let (workflow_tx, workflow_rx) = mpsc::unbounded_channel();
    let router: Arc<dyn MessageHandler> = Arc::new(
        CommandRouter::from_config(&config, coordinator.clone(), dispatcher.clone())
            .with_workflow_channel(workflow_tx),
    );

    let mut transport = MailboxTransport::new(config.poll_interval());
    for owner in config.mailbox_owners() {
        let mailbox = Mailbox::open(config.mailbox_dir(owner), owner, config.mailbox.index_capacity)
            .with_context(|| format!("opening mailbox for {owner}"))?;
        transport.add_mailbox(mailbox);
    }
    transport.register(router);

    let monitor = ActivityMonitor::new(
        &config,
        Arc::new(FileSignalSource::from_config(&config)),
        dispatcher.clone(),
    )
    .with_coordinator(coordinator.clone())
    .with_journal(journal.clone());

    let engine = WorkflowEngine::from_config(&config, dispatcher).with_journal(journal);

    let cancel = CancellationToken::new();
    spawn_signal_handlers(cancel.clone());

    let mut loops = JoinSet::new();
    loops.spawn(transport.run(cancel.clone()));
    loops.spawn(monitor.run(cancel.clone()));
    loops.spawn(engine.serve(workflow_rx, cancel.clone()));

    while let Some(joined) = loops.join_next().await {
        if let Err(err) = joined {
            error!("Service loop crashed: {}", err);
        } else if !cancel.is_cancelled() {
            warn!("Service loop exited unexpectedly");
        }
        // One loop down takes the daemon down.
        cancel.cancel();
    }

    info!("fleetd stopped");
    Ok(())
}

fn spawn_signal_handlers(cancel: CancellationToken) {
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C; shutting down");
            ctrl_c_cancel.cancel();
        }
    });

    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                return;
            }
        };
        tokio::spawn(async move {
            if sigterm.recv().await.is_some() {
                info!("Received SIGTERM; shutting down");
                cancel.cancel();
            }
        });
    }
}
