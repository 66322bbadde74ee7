mod console;

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use ngplus_core::config::{target, timing};
use ngplus_core::{
    FileLevelStore, MonitorConfig, MonitorLoop, OsProcessProvider, ScalingEngine, ScalingTable,
    ShutdownSignal,
};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "infinite-ngplus", version)]
#[command(about = "Keeps a running ELDEN RING at any NG+ level")]
struct Args {
    /// Executable name of the game process
    #[arg(long, env = "NGPLUS_EXE", default_value = target::EXE_NAME)]
    exe: String,

    /// Main window title the process must own
    #[arg(long, env = "NGPLUS_WINDOW_TITLE", default_value = target::WINDOW_TITLE)]
    window_title: String,

    /// Attach to any process with the right name, whatever its windows
    #[arg(long)]
    any_window: bool,

    /// Process list poll interval while detached, in milliseconds
    #[arg(long, env = "NGPLUS_POLL_MS", default_value_t = timing::POLL_INTERVAL.as_millis() as u64)]
    poll_ms: u64,

    /// Monitor tick interval while attached, in milliseconds
    #[arg(long, env = "NGPLUS_TICK_MS", default_value_t = timing::TICK_INTERVAL.as_millis() as u64)]
    tick_ms: u64,

    /// How long a new process must stay up before attaching, in milliseconds
    #[arg(long, env = "NGPLUS_MIN_LIFETIME_MS", default_value_t = timing::MIN_LIFETIME.as_millis() as u64)]
    min_lifetime_ms: u64,

    /// File holding the last applied level
    #[arg(long, env = "NGPLUS_LEVEL_FILE", default_value = target::LEVEL_FILE)]
    level_file: PathBuf,

    /// Scaling profile (JSON) replacing the built-in one
    #[arg(long, env = "NGPLUS_PROFILE")]
    profile: Option<PathBuf>,

    /// Record scan attempts per attachment
    #[arg(long, env = "NGPLUS_SCAN_ATTEMPTS", default_value_t = timing::SCAN_MAX_ATTEMPTS)]
    scan_attempts: u32,

    /// Pause between record scan attempts, in seconds
    #[arg(long, env = "NGPLUS_SCAN_RETRY_SECS", default_value_t = timing::SCAN_RETRY_DELAY.as_secs())]
    scan_retry_secs: u64,

    /// Level to request at startup instead of the saved one
    #[arg(long)]
    level: Option<i64>,

    /// Mirror the log into this file
    #[arg(long, env = "NGPLUS_LOG_FILE")]
    log_file: Option<PathBuf>,
}

impl Args {
    fn monitor_config(&self) -> MonitorConfig {
        let window_title = (!self.any_window).then(|| self.window_title.clone());
        MonitorConfig::builder()
            .exe_name(&self.exe)
            .window_title(window_title)
            .poll_interval(Duration::from_millis(self.poll_ms))
            .tick_interval(Duration::from_millis(self.tick_ms))
            .min_lifetime(Duration::from_millis(self.min_lifetime_ms))
            .level_file(&self.level_file)
            .scan_retry(self.scan_attempts, Duration::from_secs(self.scan_retry_secs))
            .build()
    }
}

fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ngplus=info,ngplus_core=info,infinite_ngplus=info"));

    let file_layer = match log_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("cannot create log file {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_file.as_deref())?;

    info!("Infinite NG+ {}", env!("CARGO_PKG_VERSION"));

    let table = match &args.profile {
        Some(path) => {
            let table = ScalingTable::load(path)
                .with_context(|| format!("cannot load profile {}", path.display()))?;
            info!("Loaded scaling profile '{}' from {}", table.name, path.display());
            table
        }
        None => ScalingTable::builtin()?,
    };
    let engine = ScalingEngine::new(table);
    let increments: Vec<(String, f64)> = engine
        .increments()
        .map(|(field, inc)| (field.to_string(), inc))
        .collect();
    let tiered_max = engine.table().tiered_max_level;

    let config = args.monitor_config();
    let store = FileLevelStore::new(&config.level_file);

    let shutdown = Arc::new(ShutdownSignal::new());
    let shutdown_ctrlc = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        info!("Received shutdown signal, stopping...");
        shutdown_ctrlc.trigger();
    })?;

    let (monitor, handle) = MonitorLoop::new(
        OsProcessProvider,
        config,
        engine,
        Box::new(store),
        Arc::clone(&shutdown),
    )?;
    if let Some(level) = args.level {
        handle.request_absolute(level);
    }

    let worker = thread::Builder::new()
        .name("monitor".to_string())
        .spawn(move || monitor.run())?;

    console::run(&handle, &console::Info { increments, tiered_max }, &shutdown);

    shutdown.trigger();
    if worker.join().is_err() {
        warn!("Monitor thread panicked");
        return Err(anyhow!("monitor thread panicked"));
    }
    Ok(())
}
