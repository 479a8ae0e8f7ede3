//! Vesper worker process
//!
//! Serves one governor over JSON lines: one request per stdin line, one
//! response per stdout line. Logs go to stderr.
//!
//! ## Usage
//!
//! ```bash
//! # In-memory backends, wait for an `init` request
//! vesper-worker
//!
//! # Initialize from a config file and persist records on disk
//! vesper-worker --config governor.json --store-dir ./vesper-data
//!
//! echo '{"type":"init"}
//! {"type":"track","size_bytes":4096}
//! {"type":"status"}' | vesper-worker
//! ```

use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vesper_governor::GovernorConfig;
use vesper_worker::{
    spawn_worker, Backends, WorkerContext, WorkerError, WorkerRequest, WorkerResponse,
    DEFAULT_QUEUE_DEPTH, DEFAULT_QUOTA_BYTES,
};

#[derive(Parser, Debug)]
#[command(name = "vesper-worker")]
#[command(version)]
#[command(about = "Vesper resource governor worker", long_about = None)]
struct Args {
    /// Governor configuration file (JSON); initializes on startup
    #[arg(short, long)]
    config: Option<String>,

    /// Persist records under this directory instead of in memory
    #[arg(long)]
    store_dir: Option<String>,

    /// Storage quota shared by cache and store, in MB
    #[arg(long, default_value_t = DEFAULT_QUOTA_BYTES / (1024 * 1024))]
    quota_mb: u64,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let quota_bytes = args.quota_mb.saturating_mul(1024 * 1024);
    let backends = match &args.store_dir {
        Some(dir) => Backends::with_store_dir(dir, quota_bytes),
        None => Backends::in_memory(quota_bytes),
    };

    info!("Starting Vesper worker");
    info!("  Quota:   {} MB", args.quota_mb);
    info!(
        "  Records: {}",
        args.store_dir.as_deref().unwrap_or("in memory")
    );

    let (handle, task) = spawn_worker(WorkerContext::new(backends), DEFAULT_QUEUE_DEPTH);

    if let Some(path) = &args.config {
        let config = GovernorConfig::from_path(path)?;
        match handle.init(config).await? {
            WorkerResponse::Initialized => info!("  Config:  {}", path),
            WorkerResponse::Error { kind, message } => {
                return Err(format!("init failed ({kind}): {message}").into())
            }
            other => return Err(WorkerError::UnexpectedResponse(format!("{other:?}")).into()),
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut shut_down = false;

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<WorkerRequest>(&line) {
            Ok(request) => handle.send(request).await?,
            Err(e) => {
                warn!("Malformed request: {}", e);
                let err = WorkerError::from(e);
                WorkerResponse::error(err.kind(), err)
            }
        };

        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
        stdout.flush().await?;

        if matches!(response, WorkerResponse::ShuttingDown) {
            shut_down = true;
            break;
        }
    }

    // EOF without a shutdown request still stops the worker cleanly
    if !shut_down {
        handle.shutdown().await?;
    }
    task.await?;

    info!("Vesper worker exited");
    Ok(())
}
