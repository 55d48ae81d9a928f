// Agent Traffic Logger CLI

use agentlog_lib::config::AppConfig;
use agentlog_lib::migrate::{migrate_legacy_array, MigrationOutcome};
use agentlog_lib::transcript::Transcript;
use agentlog_lib::{build_recorder, init_tracing, proxy};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "agentlog")]
#[command(about = "Record and review agent API traffic", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to ./agentlog.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the recording proxy in front of the API
    Proxy {
        #[arg(short, long)]
        port: Option<u16>,
        /// Upstream base URL
        #[arg(long)]
        upstream: Option<String>,
        /// Where records are written
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
    /// Print a transcript of a log file
    View {
        file: PathBuf,
        /// Only show requests for this model
        #[arg(long)]
        model: Option<String>,
        /// API host whose records are shown
        #[arg(long)]
        host: Option<String>,
        /// Characters per preview
        #[arg(long)]
        preview: Option<usize>,
    },
    /// Convert a legacy JSON array log into JSON lines
    Migrate { legacy: PathBuf, dest: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref()).context("loading configuration")?;
    config.debug |= cli.debug;
    init_tracing(config.debug);

    match cli.command {
        Commands::Proxy {
            port,
            upstream,
            log_file,
        } => {
            if let Some(port) = port {
                config.proxy.port = port;
            }
            if let Some(upstream) = upstream {
                config.proxy.upstream_url = upstream;
            }
            if let Some(log_file) = log_file {
                config.writer.log_file = log_file;
            }
            run_proxy(config).await
        }
        Commands::View {
            file,
            model,
            host,
            preview,
        } => {
            let host = host.unwrap_or_else(|| config.consumer.target_host.clone());
            let transcript = Transcript::load(&file, &host)
                .with_context(|| format!("reading {}", file.display()))?;
            let transcript = match model {
                Some(model) => transcript.filter_by_model(&model),
                None => transcript,
            };
            if transcript.skipped_lines > 0 {
                tracing::warn!("{} unreadable lines skipped", transcript.skipped_lines);
            }
            print!(
                "{}",
                transcript.render(preview.unwrap_or(config.consumer.preview_chars))
            );
            Ok(())
        }
        Commands::Migrate { legacy, dest } => {
            match migrate_legacy_array(&legacy, &dest)? {
                MigrationOutcome::NothingToMigrate => {
                    println!("Nothing to migrate at {}", legacy.display());
                }
                MigrationOutcome::Migrated { records, backup } => {
                    println!(
                        "Migrated {} records to {} (original moved to {})",
                        records,
                        dest.display(),
                        backup.display()
                    );
                }
                MigrationOutcome::CorruptSource { backup } => {
                    println!(
                        "{} is not a valid JSON array; moved to {}",
                        legacy.display(),
                        backup.display()
                    );
                }
            }
            Ok(())
        }
    }
}

async fn run_proxy(config: AppConfig) -> Result<()> {
    let recorder = build_recorder(&config)?;
    let writer = recorder.writer().clone();

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = tx.send(true);
        }
    });

    let served = proxy::run_proxy(&config.proxy, recorder, rx).await;

    let summary = writer.close().await;
    println!(
        "Flushed {} records to {}",
        summary.persisted,
        config.writer.log_file.display()
    );
    if summary.unpersisted > 0 {
        eprintln!("{} records could not be written", summary.unpersisted);
    }

    served.context("proxy server failed")
}
