mod analyzer;
mod auth;
mod config;
mod data_dir;
mod db;
mod error;
mod metrics;
mod model;
mod queue;
mod retry;
mod serve;
mod signals;
mod wire;

use clap::Parser;
use config::{LogFormat, LoggingConfig, PlatformConfig};
use data_dir::DataDir;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Ingestion service for agent-session telemetry: accepts session batches
/// over HTTP, stores them, and analyses them in the background.
#[derive(Parser, Debug)]
#[command(name = "bagula", version, about)]
pub struct Cli {
    /// Data directory holding the database and default config
    #[arg(long, default_value = ".bagula")]
    data_dir: PathBuf,

    /// Config file path (default: <data-dir>/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides config)
    #[arg(long)]
    bind: Option<String>,

    /// Port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// SQLite database path (overrides config)
    #[arg(long)]
    database: Option<PathBuf>,

    /// Analysis worker count (overrides config)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Debug logging for the service
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn apply_overrides(&self, config: &mut PlatformConfig) {
        if let Some(bind) = &self.bind {
            config.server.bind = bind.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(database) = &self.database {
            config.storage.database_path = Some(database.clone());
        }
        if let Some(workers) = self.workers {
            config.queue.workers = workers;
        }
    }
}

fn init_logging(logging: &LoggingConfig, verbose: bool) {
    let default_directive = if verbose {
        "bagula=debug,tower_http=debug"
    } else {
        logging.level.as_str()
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let dd = DataDir::new(&cli.data_dir);

    let config_path = cli.config.clone().unwrap_or_else(|| dd.config());
    let mut config = match PlatformConfig::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    cli.apply_overrides(&mut config);
    if let Err(e) = config.validate() {
        eprintln!("error: {e}");
        return ExitCode::FAILURE;
    }

    init_logging(&config.logging, cli.verbose);
    tracing::debug!(?cli, "parsed CLI arguments");

    let db_path = dd.resolve_db(config.storage.database_path.as_deref());

    if cli.dry_run {
        println!("# config: {}", config_path.display());
        println!("# database: {}", db_path.display());
        match toml::to_string_pretty(&config) {
            Ok(s) => print!("{s}"),
            Err(e) => {
                eprintln!("error: failed to render config: {e}");
                return ExitCode::FAILURE;
            }
        }
        return ExitCode::SUCCESS;
    }

    match dd.init() {
        Ok(true) => tracing::info!(path = %dd.root().display(), "initialized data directory"),
        Ok(false) => {}
        Err(e) => {
            tracing::error!(path = %dd.root().display(), error = %e, "failed to initialize data directory");
            return ExitCode::FAILURE;
        }
    }

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "bagula starting");
    match serve::run(config, db_path).await {
        Ok(()) => {
            tracing::info!("bagula stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "bagula failed");
            ExitCode::FAILURE
        }
    }
}
