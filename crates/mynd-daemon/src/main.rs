mod backend;
mod buttons;
mod core;
mod link;
mod mpd;
mod power;
mod streaming;
#[cfg(test)]
mod testing;

use clap::Parser;
use mynd_proto::config::{Config, LoggingConfig, DEFAULT_CONFIG_PATH};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Bridge between the Mynd MCU and the moOde player.
#[derive(Debug, Parser)]
#[command(name = "mynd-rpi-link", version)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log to the console even when the config asks for syslog
    #[arg(short, long)]
    foreground: bool,
}

fn init_logging(logging: &LoggingConfig, foreground: bool) {
    let journal = logging.use_syslog && !foreground;

    let journal_layer = journal.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .without_time()
    });
    let console_layer = (!journal).then(tracing_subscriber::fmt::layer);

    tracing_subscriber::registry()
        .with(journal_layer)
        .with(console_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(logging.filter_directive())),
        )
        .init();
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                None
            }
        };
        let terminate = async {
            match sigterm.as_mut() {
                Some(stream) => {
                    stream.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
            _ = terminate => info!("Received SIGTERM"),
        }
        shutdown.cancel();
    });
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{:#}", e);
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config.logging, args.foreground);
    info!("Config loaded from: {}", args.config.display());

    let playback = match backend::Moode::new(&config.moode) {
        Ok(moode) => Arc::new(moode),
        Err(e) => {
            error!("Failed to set up Moode client: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let opener = Arc::new(link::SerialOpener::new(&config.uart));
    let daemon = core::DaemonCore::new(
        opener,
        playback,
        power::PowerSettings::from_config(&config),
    );

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    match daemon.run(shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Failed to open UART {}: {}", config.uart.device, e);
            ExitCode::FAILURE
        }
    }
}
