use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use clap::Parser;
use log::{info, warn, LevelFilter};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::archive::{json_lines_sink, Archiver, ARCHIVE_QUEUE_SIZE};
use crate::config::io::ConfigIO;
use crate::config::types::Config;
use crate::console::{print_state_task, run_console};
use crate::device::btle::BtleRadio;
use crate::device::connection::{ConnectionManager, ConnectionPolicy};
use crate::device::scanner::NameMatch;
use crate::error::AppRunError;

pub mod archive;
pub mod config;
pub mod console;
pub mod device;
pub mod error;

const DEFAULT_ARCHIVE_FILE_NAME: &str = "cuff-link-readings.jsonl";

#[derive(Parser, Debug, Default)]
#[command(author, version)]
#[command(about = "Connects to a pneumatic cuff over Bluetooth LE and relays its pressure readings", long_about = None)]
pub struct Options {
    /// Use this config file instead of the default location
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Connect to the first peripheral whose advertised name contains this text
    #[arg(long)]
    pub name_filter: Option<String>,

    /// Require the advertised name to equal the name filter exactly
    #[arg(long)]
    pub exact_name: bool,

    /// Archive readings under this identity
    #[arg(long)]
    pub identity: Option<String>,

    /// Append archived readings to this file (JSON lines)
    #[arg(long)]
    pub archive: Option<PathBuf>,

    /// Do not start scanning on startup
    #[arg(long)]
    pub no_scan: bool,

    /// Write the config, including the options above, back to the config file
    #[arg(long)]
    pub save_config: bool,

    /// Log more details (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Options {
    /// Command line options take precedence over the config file.
    pub fn apply(&self, config: &mut Config) {
        if let Some(name_filter) = &self.name_filter {
            config.name_filter = name_filter.clone();
        }

        if self.exact_name {
            config.name_match = NameMatch::Exact;
        }

        if let Some(identity) = &self.identity {
            config.identity = Some(identity.clone());
        }

        if let Some(archive) = &self.archive {
            config.archive_path = Some(archive.clone());
        }
    }

    pub fn log_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

pub fn init_logging(level: LevelFilter) {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339(std::time::SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(LevelFilter::Warn)
        .level_for("cuff_link", level)
        .chain(std::io::stderr());

    if let Ok(log_file) = env::var("LOG_FILE") {
        dispatch = dispatch.chain(
            fern::log_file(log_file).expect("Failed to open LOG_FILE")
        );
    }

    dispatch.apply().expect("Failed to initialize logger");
}

pub fn run(options: Options) -> Result<(), AppRunError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let result = runtime.block_on(run_controller(options));

    // stdin is read on a blocking thread that only returns after the next line
    runtime.shutdown_timeout(Duration::from_millis(500));
    result
}

/// Reads the config file and applies the command line options on top of it.
async fn load_config(config_io: &ConfigIO, options: &Options) -> Result<Config, AppRunError> {
    let mut config = config_io.read().await?;
    options.apply(&mut config);
    config.validate()?;

    if options.save_config {
        config_io.save(&config).await?;
        info!("Saved config to {}", config_io.path().display());
    }

    Ok(config)
}

async fn run_controller(options: Options) -> Result<(), AppRunError> {
    let config_io = ConfigIO::open(options.config.as_deref())?;
    let mut locker = config_io.locker()?;
    let _lock = locker.lock()?;

    let config = load_config(&config_io, &options).await?;

    let cancel = CancellationToken::new();

    let (archive, archive_handle) = match &config.identity {
        Some(identity) => {
            let path = config.archive_path
                .clone()
                .unwrap_or_else(|| config_io.path().with_file_name(DEFAULT_ARCHIVE_FILE_NAME));
            let (archiver, receiver) = Archiver::new(identity.clone(), ARCHIVE_QUEUE_SIZE);
            let handle = json_lines_sink(path, receiver, cancel.clone());
            (Some(archiver), Some(handle))
        },
        None => {
            info!("No identity configured; readings are not archived");
            (None, None)
        },
    };

    let radio = BtleRadio::new().await?;
    let (manager, manager_handle) = ConnectionManager::spawn(
        Arc::new(radio),
        ConnectionPolicy::from(&config),
        archive.clone(),
        cancel.clone(),
    );
    let printer_handle = print_state_task(manager.store(), cancel.clone());

    if !options.no_scan {
        manager.start_scan()?;
    }

    let result = run_console(manager, archive, cancel.clone()).await;
    cancel.cancel();

    if let Err(err) = manager_handle.await {
        warn!("Connection manager task failed: {}", err);
    }

    match printer_handle.await {
        Ok(Err(err)) => warn!("Failed to print state: {}", err),
        Err(err) => warn!("State printer task failed: {}", err),
        Ok(Ok(())) => {},
    }

    if let Some(handle) = archive_handle {
        match handle.await {
            Ok(archive_result) => archive_result?,
            Err(err) => warn!("Archive task failed: {}", err),
        }
    }

    result
}
