//! `pi-swarm-bridge`: a thin operator binary for running a bare channel
//! group or a TCP bridge leg as its own OS process.
//!
//! This is not the host runtime (spec.md places that out of scope) — it
//! exists to exercise the library from a real process boundary, and to give
//! an operator a way to stand up a channel group or bridge leg without
//! embedding the crate in a larger program.

use anyhow::{anyhow, Context as _};
use clap::{Parser, Subcommand};
use pi_swarm::channel::group::{ChannelDef, ChannelGroup};
use pi_swarm::bridge::client::TcpBridgeClient;
use pi_swarm::bridge::server::TcpBridgeServer;
use pi_swarm::ChannelsConfig;

use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

#[derive(Parser)]
#[command(name = "pi-swarm-bridge", version)]
#[command(about = "Operator tool for running a channel group or TCP bridge leg standalone")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Start a channel group at `group_dir`, binding every listed channel.
    ServeGroup {
        /// Directory the group lives in (sockets and group.json go here).
        group_dir: PathBuf,
        /// Channel names to bind, e.g. general inbox-queen.
        #[arg(required = true)]
        channels: Vec<String>,
        /// Run in the foreground instead of daemonizing.
        #[arg(short, long)]
        foreground: bool,
    },
    /// Expose a local channel socket to TCP peers.
    BridgeServer {
        /// Path to the local channel's Unix socket.
        local_socket: PathBuf,
        /// Host/address to bind the TCP listener on.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Port to bind the TCP listener on.
        #[arg(long)]
        port: u16,
        /// Run in the foreground instead of daemonizing.
        #[arg(short, long)]
        foreground: bool,
    },
    /// Tunnel a local channel socket to a remote bridge server.
    BridgeClient {
        /// Path to the local channel's Unix socket.
        local_socket: PathBuf,
        /// Remote bridge server host.
        host: String,
        /// Remote bridge server port.
        port: u16,
        /// Disable reconnect-on-disconnect.
        #[arg(long)]
        no_reconnect: bool,
        /// Run in the foreground instead of daemonizing.
        #[arg(short, long)]
        foreground: bool,
    },
    /// Send SIGTERM to a process started by this binary and wait for exit.
    Stop {
        /// Run directory passed to the original `serve-group`/`bridge-*` call.
        run_dir: PathBuf,
    },
}

/// Paths for this binary's own runtime files, scoped to one run directory.
///
/// Grounded in `daemon.rs`'s `DaemonPaths`: a pidfile plus a log directory,
/// both derived from a single base directory the caller already owns.
struct OperatorPaths {
    pid_file: PathBuf,
    log_dir: PathBuf,
}

impl OperatorPaths {
    fn new(run_dir: &Path) -> Self {
        Self {
            pid_file: run_dir.join("pi-swarm-bridge.pid"),
            log_dir: run_dir.join("logs"),
        }
    }
}

fn is_process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

fn read_pid_file(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Check whether this binary is already running against `paths`, cleaning
/// up a stale pidfile left behind by a process that no longer exists.
fn is_running(paths: &OperatorPaths) -> Option<u32> {
    let pid = read_pid_file(&paths.pid_file)?;
    if is_process_alive(pid) {
        Some(pid)
    } else {
        let _ = std::fs::remove_file(&paths.pid_file);
        None
    }
}

/// Daemonize the current process. Returns in the child; the parent exits.
fn daemonize(paths: &OperatorPaths) -> anyhow::Result<()> {
    std::fs::create_dir_all(&paths.log_dir)
        .with_context(|| format!("failed to create log directory: {}", paths.log_dir.display()))?;

    let stdout = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.log_dir.join("bridge.out"))
        .context("failed to open stdout log")?;
    let stderr = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.log_dir.join("bridge.err"))
        .context("failed to open stderr log")?;

    daemonize::Daemonize::new()
        .pid_file(&paths.pid_file)
        .chown_pid_file(true)
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .map_err(|error| anyhow!("failed to daemonize: {error}"))?;

    Ok(())
}

fn cleanup_pidfile(paths: &OperatorPaths) {
    if let Err(error) = std::fs::remove_file(&paths.pid_file) {
        if error.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(%error, "failed to remove pid file");
        }
    }
}

fn build_env_filter(debug: bool) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_env("RUST_LOG").unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(if debug { "debug" } else { "info" })
    })
}

/// Foreground logging: plain compact output to stderr.
fn init_foreground_tracing(debug: bool) {
    let fmt_layer = tracing_subscriber::fmt::layer().compact();
    tracing_subscriber::registry()
        .with(build_env_filter(debug))
        .with(fmt_layer)
        .init();
}

/// Background logging: daily-rolling file under `<run-dir>/logs/`, matching
/// `daemon.rs`'s `tracing_appender::rolling::daily` usage.
fn init_background_tracing(paths: &OperatorPaths, debug: bool) {
    let file_appender = tracing_appender::rolling::daily(&paths.log_dir, "pi-swarm-bridge.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    std::mem::forget(guard);

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .compact();
    tracing_subscriber::registry()
        .with(build_env_filter(debug))
        .with(fmt_layer)
        .init();
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

async fn run_serve_group(group_dir: PathBuf, channels: Vec<String>, foreground: bool, debug: bool) -> anyhow::Result<()> {
    let paths = OperatorPaths::new(&group_dir);

    if !foreground {
        if let Some(pid) = is_running(&paths) {
            return Err(anyhow!("a bridge process is already running for this group (pid {pid})"));
        }
        daemonize(&paths)?;
        init_background_tracing(&paths, debug);
    } else {
        init_foreground_tracing(debug);
    }

    let cfg = ChannelsConfig::load().context("failed to load configuration")?;
    let defs: Vec<ChannelDef> = channels.into_iter().map(ChannelDef::new).collect();
    let group = ChannelGroup::new(&group_dir, defs).with_max_frame_bytes(cfg.max_frame_bytes);
    group.start().await.context("failed to start channel group")?;
    tracing::info!(group_dir = %group_dir.display(), "channel group listening");

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, stopping channel group");
    group.stop(false).await;

    if !foreground {
        cleanup_pidfile(&paths);
    }
    Ok(())
}

async fn run_bridge_server(
    local_socket: PathBuf,
    host: String,
    port: u16,
    foreground: bool,
    debug: bool,
) -> anyhow::Result<()> {
    let run_dir = local_socket
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let paths = OperatorPaths::new(&run_dir);

    if !foreground {
        if let Some(pid) = is_running(&paths) {
            return Err(anyhow!("a bridge process is already running in {} (pid {pid})", run_dir.display()));
        }
        daemonize(&paths)?;
        init_background_tracing(&paths, debug);
    } else {
        init_foreground_tracing(debug);
    }

    let cfg = ChannelsConfig::load().context("failed to load configuration")?;
    let server = TcpBridgeServer::new(local_socket, host.clone(), port)
        .with_max_frame_bytes(cfg.max_frame_bytes);
    let mut events = server.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            tracing::info!(?event, "bridge server event");
        }
    });

    server.start().await.context("failed to start bridge server")?;
    tracing::info!(%host, port, "bridge server listening");

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, stopping bridge server");
    server.stop().await;

    if !foreground {
        cleanup_pidfile(&paths);
    }
    Ok(())
}

async fn run_bridge_client(
    local_socket: PathBuf,
    host: String,
    port: u16,
    no_reconnect: bool,
    foreground: bool,
    debug: bool,
) -> anyhow::Result<()> {
    let run_dir = local_socket
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let paths = OperatorPaths::new(&run_dir);

    if !foreground {
        if let Some(pid) = is_running(&paths) {
            return Err(anyhow!("a bridge process is already running in {} (pid {pid})", run_dir.display()));
        }
        daemonize(&paths)?;
        init_background_tracing(&paths, debug);
    } else {
        init_foreground_tracing(debug);
    }

    let cfg = ChannelsConfig::load().context("failed to load configuration")?;
    let client = TcpBridgeClient::new(
        local_socket,
        host.clone(),
        port,
        !no_reconnect,
        cfg.reconnect_initial_delay,
        cfg.reconnect_max_delay,
    )
    .with_max_frame_bytes(cfg.max_frame_bytes);
    let mut events = client.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            tracing::info!(?event, "bridge client event");
        }
    });

    client.start().await.context("failed to start bridge client")?;
    tracing::info!(%host, port, "bridge client connected");

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, stopping bridge client");
    client.stop().await;

    if !foreground {
        cleanup_pidfile(&paths);
    }
    Ok(())
}

fn run_stop(run_dir: PathBuf) -> anyhow::Result<()> {
    let paths = OperatorPaths::new(&run_dir);
    let Some(pid) = read_pid_file(&paths.pid_file) else {
        return Err(anyhow!("no pid file found in {}", run_dir.display()));
    };
    if !is_process_alive(pid) {
        cleanup_pidfile(&paths);
        return Err(anyhow!("process {pid} is not running"));
    }

    if unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) } != 0 {
        return Err(anyhow!("failed to signal process {pid}"));
    }

    for _ in 0..100 {
        if !is_process_alive(pid) {
            cleanup_pidfile(&paths);
            println!("stopped (pid {pid})");
            return Ok(());
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
    }
    Err(anyhow!("process {pid} did not exit within 10s"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::ServeGroup { group_dir, channels, foreground } => {
            run_serve_group(group_dir, channels, foreground, cli.debug).await
        }
        Command::BridgeServer { local_socket, host, port, foreground } => {
            run_bridge_server(local_socket, host, port, foreground, cli.debug).await
        }
        Command::BridgeClient { local_socket, host, port, no_reconnect, foreground } => {
            run_bridge_client(local_socket, host, port, no_reconnect, foreground, cli.debug).await
        }
        Command::Stop { run_dir } => run_stop(run_dir),
    }
}
