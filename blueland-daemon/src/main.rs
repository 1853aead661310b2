/*!
 * Blueland Daemon
 * Bluetooth pairing agent and device session service
 */

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod agent;
mod bluez;
mod broadcast;
mod config;
mod coordinator;
mod device;
mod error;
mod ipc;
mod obex;
mod prompt;

use bluez::{BluetoothStack, BluezStack};
use config::DaemonConfig;
use coordinator::Coordinator;
use ipc::{IpcServer, Request, Response};
use prompt::ZenityPrompter;

#[derive(Parser)]
#[command(name = "bluelandd")]
#[command(about = "Blueland Bluetooth Daemon")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, default_value = "/etc/blueland/bluelandd.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon
    Run,
    /// Query a running daemon
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("bluelandd={}", log_level))),
        )
        .init();

    let config = DaemonConfig::load(&cli.config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(config).await,
        Commands::Status => check_status(&config).await,
    }
}

async fn run_daemon(config: DaemonConfig) -> Result<()> {
    info!("Blueland daemon starting...");

    let (resource, system_bus) =
        dbus_tokio::connection::new_system_sync().context("connecting to the system bus")?;
    tokio::spawn(async move {
        let err = resource.await;
        error!("Lost connection to the system bus: {}", err);
    });

    // file transfer lives on the session bus; pairing works without it
    let session_bus = match dbus_tokio::connection::new_session_sync() {
        Ok((resource, conn)) => {
            tokio::spawn(async move {
                let err = resource.await;
                warn!("Lost connection to the session bus: {}", err);
            });
            Some(conn)
        }
        Err(e) => {
            warn!("No session bus, file transfer disabled: {}", e);
            None
        }
    };

    let stack = Arc::new(BluezStack::new(system_bus.clone(), session_bus.clone()));
    let prompter = Arc::new(ZenityPrompter::new(&config.prompt));
    let (handle, inbox) = coordinator::channel();

    agent::serve(&system_bus, handle.clone());
    if let Some(session) = session_bus.as_ref().filter(|_| config.obex.enabled) {
        obex::start(
            session.clone(),
            obex::ObexAgent::new(prompter.clone(), session.clone(), &config.obex),
        );
    }

    let (watch, stack_events) = stack.watch().await.context("subscribing to BlueZ signals")?;
    let mut coordinator = Coordinator::new(
        stack.clone(),
        prompter,
        handle.clone(),
        Duration::from_secs(config.discovery.window_secs),
    );
    match stack.register_agent().await {
        Ok(()) => coordinator.set_agent_registered(true),
        Err(e) => warn!("Agent not registered, waiting for BlueZ: {}", e),
    }
    match stack.devices().await {
        Ok(devices) => coordinator.seed(devices),
        Err(e) => warn!("Could not read known devices: {}", e),
    }

    let command_listener = bind(&config.command_socket)?;
    let event_listener = bind(&config.event_socket)?;
    tokio::spawn(IpcServer::new(command_listener, handle.clone()).run());
    tokio::spawn(broadcast::serve(
        event_listener,
        handle.clone(),
        config.broadcast.queue_depth,
    ));
    let coordinator = tokio::spawn(coordinator.run(inbox, stack_events));

    info!(
        "Blueland daemon ready on {} (events: {})",
        config.command_socket.display(),
        config.event_socket.display()
    );

    wait_for_shutdown().await?;

    handle.shutdown();
    if let Err(e) = coordinator.await {
        error!("Coordinator task failed: {}", e);
    }
    if let Err(e) = stack.unregister_agent().await {
        debug!("UnregisterAgent: {}", e);
    }
    watch.stop().await;
    for socket in [&config.command_socket, &config.event_socket] {
        if let Err(e) = fs::remove_file(socket) {
            debug!("Removing {}: {}", socket.display(), e);
        }
    }

    info!("Blueland daemon stopped");
    Ok(())
}

/// Binds a socket path, creating its private parent directory and clearing
/// any socket left behind by an earlier run.
fn bind(path: &Path) -> Result<UnixListener> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
            .with_context(|| format!("restricting {}", dir.display()))?;
    }
    if path.exists() {
        fs::remove_file(path).with_context(|| format!("removing stale {}", path.display()))?;
    }
    UnixListener::bind(path).with_context(|| format!("binding {}", path.display()))
}

async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
    Ok(())
}

async fn check_status(config: &DaemonConfig) -> Result<()> {
    match ipc::send_request(&config.command_socket, &Request::Status).await? {
        Response::Status { status } => println!("{}", serde_json::to_string_pretty(&status)?),
        other => println!("{}", serde_json::to_string_pretty(&other)?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blueland").join("command.sock");

        let first = bind(&path).unwrap();
        drop(first);
        assert!(path.exists());

        let _second = bind(&path).unwrap();
        let mode = fs::metadata(path.parent().unwrap()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
