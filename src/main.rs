//! # Departure Board Entry Point
//!
//! Loads the configuration, wires the fetch, clock and display collaborators
//! together and hands them to the [`Scheduler`].
//!
//! ```text
//! departure-board [--config <path>] [--offline] [--once] [--pixels | --stdout]
//! ```
//!
//! - `--offline`: never touch the network, show the offline dataset
//! - `--once`: one refresh and render, then exit
//! - `--pixels`: draw into framebuffers and print them as ASCII art
//! - `--stdout`: framed text output (the default)

use departure_board_lib::{
    clock::ClockSync,
    config::{Config, ConfigError, CONFIG_FILE},
    display::{FrameBufferScreen, Screen, TerminalScreen},
    fallback::OfflineDataset,
    fetch_client::FetchClient,
    ntp::SntpClient,
    rail_data::ResilientFetcher,
    renderer::BoardRenderer,
    scheduler::Scheduler,
};
use anyhow::Context;
use chrono::Utc;
use std::env;
use std::io;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Command line switches.
#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    offline: bool,
    once: bool,
    pixels: bool,
}

impl Args {
    fn parse() -> anyhow::Result<Self> {
        let mut args = Args::default();
        let mut raw = env::args().skip(1);
        while let Some(arg) = raw.next() {
            match arg.as_str() {
                "--config" => {
                    let path = raw.next().context("--config needs a path")?;
                    args.config = Some(PathBuf::from(path));
                }
                "--offline" => args.offline = true,
                "--once" => args.once = true,
                "--pixels" => args.pixels = true,
                "--stdout" => args.pixels = false,
                other => anyhow::bail!("unknown argument: {other}"),
            }
        }
        Ok(args)
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse()?;
    let path = args.config.clone().unwrap_or_else(|| PathBuf::from(CONFIG_FILE));

    // The log level lives in the config, so the config is read before logging starts
    let loaded = Config::read(&path);
    let config = match &loaded {
        Ok(config) => config.clone(),
        Err(_) => Config::default(),
    };
    init_tracing(&config.log_level);

    match loaded {
        Ok(_) => info!(path = %path.display(), station = %config.station.code, "Loaded configuration"),
        Err(ConfigError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
            info!(path = %path.display(), "No config file found, using defaults")
        }
        Err(e) => warn!(path = %path.display(), error = %e, "Unusable config file, using defaults"),
    }

    // Single-threaded: one cooperative loop owns all state
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(config, args))
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(config: Config, args: Args) -> anyhow::Result<()> {
    let extractor = config.extractor();
    let offline = OfflineDataset::load(config.api.offline_data.as_deref(), &extractor);
    let policy = config.retry_policy();

    let client = FetchClient::new(
        config.backend(),
        config.api_key(),
        config.api.max_response_bytes,
        policy.request_timeout,
    )
    .context("building HTTP client")?;
    info!(backend = client.backend().name(), "HTTP client ready");

    let offline_only = args.offline || config.api.offline_mode;
    if offline_only {
        info!("Offline mode, the network will not be used");
    }
    let fetcher = ResilientFetcher::new(
        client,
        config.query(),
        policy,
        extractor,
        offline,
        config.alert.custom.clone(),
    )
    .offline_only(offline_only);

    let mut time_source = SntpClient::new(config.clock.ntp_server.clone(), config.ntp_timeout());
    let clock = match ClockSync::initialize(&mut time_source, Utc::now()).await {
        Ok(clock) => clock,
        Err(e) => {
            warn!(error = %e, "Running on the system clock");
            ClockSync::unsynced(Utc::now())
        }
    }
    .with_resync(config.resync_interval());

    let renderer = BoardRenderer::new(config.layout_style(), config.stale_after());
    let screens: Vec<Box<dyn Screen>> = config
        .screens
        .iter()
        .map(|_| -> Box<dyn Screen> {
            if args.pixels {
                Box::new(FrameBufferScreen::new(config.display.width, config.display.height).with_preview(true))
            } else {
                Box::new(TerminalScreen::stdout())
            }
        })
        .collect();

    let mut scheduler = Scheduler::new(fetcher, time_source, clock, renderer, screens, config.cadence());

    if args.once {
        scheduler.run_once().await;
        return Ok(());
    }
    scheduler.run().await;
    Ok(())
}
