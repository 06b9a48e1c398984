//! PortsForward - TCP port forwarder with live-reloaded rules
//!
//! Listens on every source port named in the rules file and relays each
//! connection to its destination, optionally mirroring and recording traffic.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use portsforward_config::{ConfigWatcher, ForwardSettings, MirrorTarget, RuleSet};
use portsforward_server::{DataTaps, ListenerManager};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const VERSION: &str = concat!(
    env!("GIT_TAG"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_TIME"),
    ")"
);

/// PortsForward - Relay TCP ports according to a live-reloaded rules file
#[derive(Parser, Debug)]
#[command(name = "portsforward")]
#[command(version = VERSION)]
#[command(about = "Relay TCP ports according to a live-reloaded rules file")]
#[command(long_about = r#"
Relay TCP connections from local source ports to destination hosts.

Each line of the rules file has the form
  source_port,destination_host,destination_port,bandwidth_kib_per_sec
where a bandwidth of 0 means unlimited. The file is created with a single
default rule when missing and is re-read whenever it changes.

EXAMPLES:
  # Forward with the rules in ./portsforward.conf
  portsforward

  # Seed a new rules file forwarding 8080 to an internal web server
  portsforward --config web.conf --source-port 8080 \
    --destination-host 10.0.0.5 --destination-port 80

  # Copy client traffic to an analyzer and record both directions
  portsforward --mirror-up-host 10.0.0.9 --mirror-up-port 9000 \
    --data-up-file up.bin --data-down-file down.bin
"#)]
struct Cli {
    /// Rules file
    #[arg(long, env = "PORTSFORWARD_CONFIG", default_value = "portsforward.conf")]
    config: PathBuf,

    /// Seconds between checks of the rules file
    #[arg(long, env = "PORTSFORWARD_POLL_INTERVAL", default_value = "10")]
    poll_interval_secs: u64,

    /// Source port of the seed rule written to a new rules file
    #[arg(long)]
    source_port: Option<u16>,

    /// Destination host of the seed rule written to a new rules file
    #[arg(long)]
    destination_host: Option<String>,

    /// Destination port of the seed rule written to a new rules file
    #[arg(long)]
    destination_port: Option<u16>,

    /// Host receiving a copy of client-to-destination traffic
    #[arg(long)]
    mirror_up_host: Option<String>,

    /// Port of the upstream mirror
    #[arg(long)]
    mirror_up_port: Option<u16>,

    /// Host receiving a copy of destination-to-client traffic
    #[arg(long)]
    mirror_down_host: Option<String>,

    /// Port of the downstream mirror
    #[arg(long)]
    mirror_down_port: Option<u16>,

    /// File recording all client-to-destination bytes
    #[arg(long)]
    data_up_file: Option<PathBuf>,

    /// File recording all destination-to-client bytes
    #[arg(long)]
    data_down_file: Option<PathBuf>,

    /// Write logs to this file
    #[arg(long, env = "PORTSFORWARD_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Also log to the console when a log file is set
    #[arg(long)]
    log_to_console: bool,

    /// Size of each relay read, in bytes
    #[arg(long, default_value = "1024")]
    buffer_size: usize,

    /// Connections served at once per rule (unbounded when not set)
    #[arg(long)]
    max_connections_per_rule: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_level: String,
}

impl Cli {
    fn settings(&self) -> Result<ForwardSettings> {
        let mirror_up =
            MirrorTarget::from_parts(self.mirror_up_host.clone(), self.mirror_up_port, "upstream")?;
        let mirror_down = MirrorTarget::from_parts(
            self.mirror_down_host.clone(),
            self.mirror_down_port,
            "downstream",
        )?;

        let mut settings = ForwardSettings::default()
            .with_rules_path(self.config.clone())
            .with_poll_interval(Duration::from_secs(self.poll_interval_secs))
            .with_buffer_size(self.buffer_size)
            .with_taps(self.data_up_file.clone(), self.data_down_file.clone())
            .with_mirrors(mirror_up, mirror_down)
            .with_max_connections_per_rule(self.max_connections_per_rule)
            .with_seed_rule(
                self.source_port,
                self.destination_host.clone(),
                self.destination_port,
            );
        settings.log_file = self.log_file.clone();
        settings.log_to_console = self.log_to_console;

        settings.validate()?;
        Ok(settings)
    }
}

/// Setup logging to the console, a file, or both
fn setup_logging(settings: &ForwardSettings, log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = match &settings.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(true)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    let console_layer = (settings.log_file.is_none() || settings.log_to_console)
        .then(|| fmt::layer().with_target(true).with_thread_ids(false));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .with(filter)
        .init();

    Ok(())
}

async fn run(settings: ForwardSettings) -> Result<()> {
    let settings = Arc::new(settings);
    let taps = DataTaps::open(&settings)
        .await
        .context("Failed to open data files")?;
    let manager = Arc::new(ListenerManager::new(settings.clone(), taps));
    let shutdown = CancellationToken::new();

    let mut watch = {
        let manager = manager.clone();
        let shutdown = shutdown.clone();
        let watcher = ConfigWatcher::new(settings.clone());
        tokio::spawn(async move {
            watcher
                .run(shutdown, move |rules: RuleSet| {
                    let manager = manager.clone();
                    async move { manager.reconfigure(rules).await }
                })
                .await
        })
    };

    let result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            info!("Shutting down...");
            shutdown.cancel();
            watch.await.context("Config watcher task failed")?
        }
        finished = &mut watch => finished.context("Config watcher task failed")?,
    };

    manager.shutdown().await;
    result.with_context(|| format!("Stopped watching {}", settings.rules_path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.settings().context("Invalid configuration")?;
    setup_logging(&settings, &cli.log_level)?;

    info!("Starting PortsForward {}", VERSION);
    info!("Rules file: {}", settings.rules_path.display());
    if let Some(mirror) = &settings.mirror_up {
        info!("Mirroring upstream traffic to {}", mirror);
    }
    if let Some(mirror) = &settings.mirror_down {
        info!("Mirroring downstream traffic to {}", mirror);
    }

    if let Err(e) = run(settings).await {
        error!("{:#}", e);
        return Err(e);
    }

    info!("PortsForward stopped");
    Ok(())
}
