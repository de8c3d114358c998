//! OpenCT reader daemon
//!
//! One `ifdhandler` process serves one smart-card reader over a Unix domain
//! socket and publishes the reader's state into the shared status file.
//! A separate `master` process answers reader enumeration.

mod cli;
mod config;
mod locks;
mod process;
mod server;
mod status;

use clap::Parser;
use cli::{Cli, Command};
use color_eyre::eyre::{Result, WrapErr, bail};
use config::Config;
use openct_ifd::{Reader, Registry};
use openct_protocol::{
    Error, StatusFile, StatusFileMut, master_socket_path, reader_socket_path, status_file_path,
};
use process::{MasterService, ReaderService};
use server::{Server, is_daemon_running};
use status::StatusSlot;
use std::future::Future;
use tokio::signal::unix::{SignalKind, signal};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config.as_ref())?
        .with_socket_dir(cli.socket_dir.clone())
        .with_log_level(cli.log_level.clone());

    // Only the serving commands log at the configured level
    match &cli.command {
        Command::Start { .. } | Command::Master => {
            init_logging(&config.daemon.log_level)?;
        }
        _ => {
            init_logging("warn")?;
        }
    }

    match cli.command {
        Command::Init => cmd_init(&config),
        Command::Start { reader, foreground } => cmd_start(&config, reader, foreground).await,
        Command::Master => cmd_master(&config).await,
        Command::List => cmd_list(&config),
        Command::Shutdown => cmd_shutdown(&config),
    }
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();

    Ok(())
}

/// Completes on the first SIGTERM or SIGINT.
fn shutdown_signal() -> Result<impl Future<Output = ()>> {
    let mut sigterm = signal(SignalKind::terminate()).wrap_err("Failed to set up SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).wrap_err("Failed to set up SIGINT")?;

    Ok(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT");
            }
        }
    })
}

fn cmd_init(config: &Config) -> Result<()> {
    let dir = &config.daemon.socket_dir;
    std::fs::create_dir_all(dir)
        .wrap_err_with(|| format!("Failed to create {}", dir.display()))?;

    let path = status_file_path(dir);
    let count = config.reader.len().max(1);
    StatusFileMut::create(&path, count)
        .wrap_err_with(|| format!("Failed to create {}", path.display()))?;

    println!("Status file {} ready for {} reader(s)", path.display(), count);
    Ok(())
}

async fn cmd_start(config: &Config, index: usize, foreground: bool) -> Result<()> {
    let Some(reader_config) = config.reader(index) else {
        bail!("Reader {} is not configured ({} configured)", index, config.reader.len());
    };
    let dir = &config.daemon.socket_dir;
    let socket_path = reader_socket_path(dir, index);

    // Check if already running
    if is_daemon_running(&socket_path).await {
        bail!("Reader {} is already served at {}", index, socket_path.display());
    }

    if !foreground {
        // Re-exec ourselves attached to nothing
        let exe = std::env::current_exe()?;
        let args: Vec<String> = std::env::args().skip(1).collect();

        let child = std::process::Command::new(&exe)
            .args(&args)
            .arg("--foreground")
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()?;

        println!("Reader {} daemon started with PID {}", index, child.id());
        return Ok(());
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        reader = index,
        name = %reader_config.name,
        driver = %reader_config.driver,
        socket = %socket_path.display(),
        "Starting ifdhandler"
    );

    let shutdown = shutdown_signal()?;

    let driver = Registry::with_builtin()
        .open(&reader_config.driver, &reader_config.device)
        .wrap_err_with(|| format!("Failed to open driver {:?}", reader_config.driver))?;
    let reader = Reader::open(driver).wrap_err("Failed to initialise reader")?;

    let status_path = status_file_path(dir);
    let slot = StatusSlot::claim(&status_path, index, config.reader.len())
        .wrap_err_with(|| format!("Failed to claim status record in {}", status_path.display()))?;
    tracing::debug!(record = slot.index(), "Publishing to status file");

    let mut server = Server::bind(
        socket_path,
        config.daemon.max_clients,
        config.daemon.poll_interval(),
    )?;
    let mut service = ReaderService::new(reader, Some(slot));

    let outcome = server.run(&mut service, shutdown).await;
    if let Err(e) = service.close() {
        tracing::warn!(error = %e, "Reader did not close cleanly");
    }

    match outcome {
        Ok(()) => {}
        Err(Error::DeviceDisconnected) => {
            tracing::info!(socket = %server.socket_path().display(), "Reader unplugged");
        }
        Err(e) => return Err(e).wrap_err("Reader daemon failed"),
    }

    tracing::info!("Daemon stopped");
    Ok(())
}

async fn cmd_master(config: &Config) -> Result<()> {
    let dir = &config.daemon.socket_dir;
    let socket_path = master_socket_path(dir);

    if is_daemon_running(&socket_path).await {
        bail!("Master is already running at {}", socket_path.display());
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        socket = %socket_path.display(),
        "Starting master"
    );

    let shutdown = shutdown_signal()?;

    let mut server = Server::bind(
        socket_path,
        config.daemon.max_clients,
        config.daemon.poll_interval(),
    )?;
    let mut service = MasterService::new(status_file_path(dir));
    server.run(&mut service, shutdown).await?;

    tracing::info!("Master stopped");
    Ok(())
}

fn open_status(config: &Config) -> Result<Option<StatusFile>> {
    let path = status_file_path(&config.daemon.socket_dir);
    match StatusFile::open(&path) {
        Ok(file) => Ok(Some(file)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            println!("No status file at {}", path.display());
            Ok(None)
        }
        Err(e) => Err(e).wrap_err_with(|| format!("Failed to open {}", path.display())),
    }
}

fn cmd_list(config: &Config) -> Result<()> {
    let Some(file) = open_status(config)? else {
        return Ok(());
    };

    let mut any = false;
    for (index, record) in file.readers() {
        any = true;
        println!("{:2} {}", index, record.name());
        for slot in 0..record.slot_count as usize {
            let status = record.card_status(slot);
            let state = if status.contains(openct_protocol::CardStatus::PRESENT) {
                "card present"
            } else {
                "empty"
            };
            println!("     slot {}: {}", slot, state);
        }
    }
    if !any {
        println!("No readers running");
    }
    Ok(())
}

fn cmd_shutdown(config: &Config) -> Result<()> {
    let Some(file) = open_status(config)? else {
        return Ok(());
    };

    let mut stopped = 0;
    for (index, record) in file.readers() {
        let Ok(pid) = libc::pid_t::try_from(record.pid) else {
            continue;
        };
        // Stopping is not part of the wire protocol; daemons exit on SIGTERM.
        // SAFETY: kill has no memory-safety preconditions.
        if unsafe { libc::kill(pid, libc::SIGTERM) } == 0 {
            stopped += 1;
        } else {
            let err = std::io::Error::last_os_error();
            eprintln!("Failed to stop reader {} (pid {}): {}", index, pid, err);
        }
    }
    println!("Stopped {} reader daemon(s)", stopped);
    Ok(())
}
