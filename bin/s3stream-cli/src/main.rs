//! s3stream CLI - operator tool
//!
//! Boots an engine on a data directory, runs one command and shuts the
//! engine down cleanly, uploading pending data.

mod settings;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use s3stream_common::RecordBatch;
use s3stream_engine::Engine;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "s3stream-cli")]
#[command(about = "s3stream operator CLI")]
#[command(version)]
struct Args {
    /// Configuration file path (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Data directory (overrides broker.data_dir)
    #[arg(long, global = true, env = "S3STREAM_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Append one record batch to a stream
    Append {
        /// Stream name
        #[arg(short, long)]
        stream: String,
        /// Number of records the batch counts for
        #[arg(long, default_value = "1")]
        count: u32,
        /// Batch payload
        payload: String,
    },
    /// Read record batches from a stream
    Fetch {
        #[arg(short, long)]
        stream: String,
        #[arg(long, default_value = "0")]
        start: u64,
        /// Exclusive end offset (defaults to the end of the stream)
        #[arg(long)]
        end: Option<u64>,
        #[arg(long, default_value = "1048576")]
        max_bytes: usize,
    },
    /// Advance the start offset of a stream
    Trim {
        #[arg(short, long)]
        stream: String,
        #[arg(long)]
        offset: u64,
    },
    /// Upload all pending WAL data into an object
    Flush,
    /// Print streams and the published metadata image as JSON
    Inspect,
    /// Print the effective configuration as JSON
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level, args.log_format);

    let config = settings::load(args.config.as_deref(), args.data_dir.clone())?;
    if matches!(args.command, Commands::Config) {
        let mut effective = serde_json::to_value(&config)?;
        if let Some(secret) = effective.pointer_mut("/auto_balancer/client_auth/sasl_jaas_config")
            && !secret.is_null()
        {
            *secret = serde_json::Value::from("[hidden]");
        }
        println!("{}", serde_json::to_string_pretty(&effective)?);
        return Ok(());
    }

    info!("Opening engine at {}", config.broker.data_dir.display());
    let engine = Engine::open(config)
        .await
        .context("failed to open engine")?;
    let outcome = run(&engine, args.command).await;
    let shutdown = engine.shutdown().await.context("failed to shut down engine");
    outcome?;
    shutdown
}

fn init_logging(level: &str, format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.to_owned().into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

async fn run(engine: &Engine, command: Commands) -> Result<()> {
    match command {
        Commands::Append {
            stream,
            count,
            payload,
        } => {
            let handle = engine.stream(&stream);
            let offset = handle
                .append(RecordBatch::new(count, payload.into_bytes()))
                .await
                .with_context(|| format!("append to {stream} failed"))?;
            println!("{offset}");
        }
        Commands::Fetch {
            stream,
            start,
            end,
            max_bytes,
        } => {
            let handle = engine.stream(&stream);
            let end = match end {
                Some(end) => end,
                None => handle.next_offset().await?,
            };
            let result = handle
                .fetch(start, end, max_bytes)
                .await
                .with_context(|| format!("fetch from {stream} failed"))?;
            for batch in result.records() {
                println!(
                    "{}\t{}\t{}",
                    batch.base_offset(),
                    batch.count(),
                    String::from_utf8_lossy(batch.payload())
                );
            }
        }
        Commands::Trim { stream, offset } => {
            engine
                .stream(&stream)
                .trim(offset)
                .await
                .with_context(|| format!("trim of {stream} failed"))?;
            println!("{offset}");
        }
        Commands::Flush => match engine.flush().await? {
            Some(object) => println!(
                "uploaded object {} ({} bytes, {} streams)",
                object.object_id,
                object.object_size,
                object.stream_ranges.len()
            ),
            None => println!("nothing to upload"),
        },
        Commands::Inspect => {
            let stats = engine.upload_stats();
            let cache = engine.cache_stats();
            let report = serde_json::json!({
                "streams": engine.list_streams(),
                "image": &*engine.image(),
                "pending_bytes": engine.pending_bytes(),
                "uploads": {
                    "objects": stats.objects.load(Ordering::Relaxed),
                    "bytes": stats.bytes.load(Ordering::Relaxed),
                    "removed": stats.removed.load(Ordering::Relaxed),
                },
                "cache": {
                    "hits": cache.hits.load(Ordering::Relaxed),
                    "misses": cache.misses.load(Ordering::Relaxed),
                },
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Config => {}
    }
    Ok(())
}
