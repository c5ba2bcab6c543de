use anyhow::Result;
use clap::error::ErrorKind;
use clap::Parser;
use kwvolume::modules::constants::{DEFAULT_SOCKET_PATH, DEFAULT_TIMEOUT_SECS, DEFAULT_VOLUMES_ROOT};
use kwvolume::modules::memlock::lock_memory;
use kwvolume::modules::plugin;
use kwvolume::{Config, FuseLauncher, VolumeDriver};
use log::{error, info, warn, LevelFilter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Docker volumes root directory
    #[arg(long, default_value = DEFAULT_VOLUMES_ROOT)]
    root: PathBuf,
    /// PEM-encoded certificate file
    #[arg(long)]
    cert: Option<PathBuf>,
    /// PEM-encoded private key file
    #[arg(long, default_value = "client.key")]
    key: PathBuf,
    /// PEM-encoded CA certificates file
    #[arg(long, default_value = "cacert.crt")]
    ca: PathBuf,
    /// Default user to own files
    #[arg(long = "asuser", default_value = "keywhiz")]
    user: String,
    /// Default group to own files
    #[arg(long, default_value = "keywhiz")]
    group: String,
    /// Enable startup ping to server
    #[arg(long)]
    ping: bool,
    /// Enable debugging output
    #[arg(long)]
    debug: bool,
    /// Timeout for communication with server, in seconds
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    timeout: u64,
    /// Plugin socket path
    #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,
    /// Keywhiz server URL
    url: String,
}

fn parse_cli() -> Cli {
    match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            e.exit()
        }
        Err(e) => {
            let _ = e.print();
            std::process::exit(1);
        }
    }
}

async fn shutdown_signal() {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        _ = terminate.recv() => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = parse_cli();

    let log_level = if cli.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::new().filter_level(log_level).init();

    let config = Config::new(
        &cli.url,
        cli.cert.unwrap_or_default(),
        cli.key,
        cli.ca,
        cli.user,
        cli.group,
        cli.ping,
        cli.debug,
        Duration::from_secs(cli.timeout),
    )
    .inspect_err(|e| error!("{}", e))?;

    lock_memory().inspect_err(|e| error!("{}", e))?;

    info!("Starting kwvolume for {}", config.server_url);
    let driver = Arc::new(VolumeDriver::new(
        cli.root,
        FuseLauncher::new(Arc::new(config)),
    ));

    plugin::serve(Arc::clone(&driver), &cli.socket, shutdown_signal()).await?;

    let unmounted = tokio::task::spawn_blocking(move || driver.shutdown()).await?;
    info!("Unmounted {} volumes, exiting", unmounted);

    Ok(())
}
