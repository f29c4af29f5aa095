//! CLI entry point for the duplicate scanner

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use duplicate_scanner::hash::HashEngine;
use duplicate_scanner::progress::ScanEvent;
use duplicate_scanner::report::{OutputFormat as ReportOutputFormat, ReportGenerator};
use duplicate_scanner::store::JsonFileStore;
use duplicate_scanner::{web, Config, HashAlgorithm, ScanConfig, ScanRegistry, ScanState};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "duplicate-scanner")]
#[command(about = "Concurrent multi-algorithm duplicate file scanner")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    engine: EngineArgs,

    /// Log level filter (overridden by RUST_LOG)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Shorthand for --log-level debug
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct EngineArgs {
    /// Size of the shared hashing worker pool
    #[arg(long, env = "SCANNER_WORKERS", default_value_t = duplicate_scanner::DEFAULT_WORKERS, global = true)]
    workers: usize,

    /// Read chunk size in bytes
    #[arg(long, env = "SCANNER_CHUNK_SIZE", default_value_t = duplicate_scanner::DEFAULT_CHUNK_SIZE, global = true)]
    chunk_size: usize,

    /// Skip files larger than this many bytes
    #[arg(long, env = "SCANNER_MAX_FILE_SIZE", value_name = "BYTES", global = true)]
    max_file_size: Option<u64>,

    /// Number of finished scans kept in memory
    #[arg(long, env = "SCANNER_HISTORY", default_value_t = 64, global = true)]
    history: usize,
}

impl EngineArgs {
    fn to_config(&self) -> Config {
        let defaults = Config::default();
        Config {
            workers: self.workers,
            chunk_size: self.chunk_size,
            history_capacity: self.history,
            max_file_size: self.max_file_size.or(defaults.max_file_size),
            ..defaults
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API and progress push socket
    Serve {
        /// Address to bind to
        #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:8080")]
        bind: String,

        /// Directory for persisted scan results
        #[arg(long, env = "RESULTS_DIR")]
        results_dir: Option<PathBuf>,
    },

    /// Scan paths once and print a report
    Scan {
        /// Files or directories to scan
        #[arg(value_name = "PATH", required = true)]
        paths: Vec<PathBuf>,

        /// Hash algorithms, comma separated (unknown names are ignored)
        #[arg(short, long, value_delimiter = ',')]
        algorithms: Vec<String>,

        /// Exclude patterns (glob patterns, can be specified multiple times)
        #[arg(short, long, value_name = "PATTERN")]
        exclude: Vec<String>,

        /// Display name for the scan
        #[arg(long)]
        name: Option<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,

        /// Output file path (stdout if not specified)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Hash a single file
    Hash {
        file: PathBuf,

        /// Hash algorithms, comma separated
        #[arg(short, long, value_delimiter = ',')]
        algorithms: Vec<String>,

        /// Single fast digest only
        #[arg(long)]
        quick: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    /// Human-readable text format
    Text,
    /// JSON format for programmatic use
    Json,
}

impl From<OutputFormat> for ReportOutputFormat {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Text => ReportOutputFormat::Text,
            OutputFormat::Json => ReportOutputFormat::Json,
        }
    }
}

fn init_tracing(log_level: &str, verbose: bool) {
    let level = if verbose { "debug" } else { log_level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.verbose);
    let config = cli.engine.to_config();

    match cli.command {
        Commands::Serve { bind, results_dir } => serve(config, &bind, results_dir).await,
        Commands::Scan {
            paths,
            algorithms,
            exclude,
            name,
            format,
            output,
        } => {
            let mut scan_config = ScanConfig::new(paths).algorithms(HashAlgorithm::parse_list(&algorithms));
            scan_config.exclude_patterns = exclude;
            scan_config.name = name;
            scan_once(config, scan_config, format.into(), output).await
        }
        Commands::Hash { file, algorithms, quick } => hash_file(config, &file, &algorithms, quick).await,
    }
}

async fn serve(config: Config, bind: &str, results_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let mut registry = ScanRegistry::new(config)?;
    if let Some(dir) = results_dir {
        let store = JsonFileStore::new(&dir)
            .with_context(|| format!("cannot use results directory {}", dir.display()))?;
        info!(dir = %dir.display(), "Persisting completed scans");
        registry = registry.with_store(Arc::new(store));
    }
    let registry = Arc::new(registry);

    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    };

    web::start_server(bind, Arc::clone(&registry), shutdown)
        .await
        .with_context(|| format!("web server on {} failed", bind))?;
    registry.shutdown().await;
    Ok(())
}

async fn scan_once(
    config: Config,
    scan_config: ScanConfig,
    format: ReportOutputFormat,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let registry = ScanRegistry::new(config)?;

    // Mirror hub events into the log
    let (_, mut events) = registry.hub().subscribe_channel();
    tokio::spawn(async move {
        while let Some(payload) = events.recv().await {
            match serde_json::from_str::<ScanEvent>(&payload) {
                Ok(ScanEvent::ScanProgress { progress, .. }) => info!(
                    processed = progress.files_processed,
                    discovered = progress.files_discovered,
                    failed = progress.files_failed,
                    "Scan progress: {:.1}%",
                    progress.progress_percentage()
                ),
                Ok(event) => tracing::debug!(event = event.event_type(), "Scan event"),
                Err(err) => warn!(error = %err, "Unreadable scan event"),
            }
        }
    });

    let scan_id = registry.start(scan_config).await?;
    let scan = registry.get(scan_id).await?;

    let state = tokio::select! {
        state = scan.join() => state,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling scan");
            scan.cancel();
            scan.join().await
        }
    };
    registry.shutdown().await;

    match state {
        ScanState::Completed => {
            let Some(report) = scan.report() else {
                bail!("scan {} completed without a report", scan_id);
            };
            let generator = ReportGenerator::new();
            match output {
                Some(path) => {
                    generator.save_report(&report, format, &path)?;
                    info!(path = %path.display(), "Report written");
                }
                None => println!("{}", generator.generate(&report, format)?),
            }
            Ok(())
        }
        ScanState::Cancelled => {
            warn!(processed = scan.progress().files_processed, "Scan cancelled");
            Ok(())
        }
        other => {
            let message = scan.status().error.unwrap_or_else(|| format!("scan ended in state {}", other));
            bail!(message)
        }
    }
}

async fn hash_file(config: Config, file: &Path, algorithms: &[String], quick: bool) -> anyhow::Result<()> {
    config.validate()?;
    let engine = HashEngine::new(config.chunk_size, config.workers);

    if quick {
        let digest = engine.quick_hash(file).await?;
        println!("{}  {}", digest, file.display());
    } else {
        let mut requested = HashAlgorithm::parse_list(algorithms);
        if requested.is_empty() {
            requested = config.default_algorithms.clone();
        }
        let result = engine.hash_file(file, &requested).await?;
        for (algorithm, digest) in &result.digests {
            println!("{:<8}  {}  {}", algorithm.as_str(), digest, file.display());
        }
    }

    engine.shutdown().await;
    Ok(())
}
