//! Fragvault
//!
//! Command-line front end for the erasure-coded backup pipeline.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           fragvault                              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │    Backup    │───▶│  Raid Worker │───▶│ Data Sender  │──▶ suppliers/
//! │  │     Job      │    │   (pool)     │    │              │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! │          ▲                   ▲                   ▲               │
//! │          │           ┌──────────────┐            │               │
//! │     source file      │   Monitor    │────────────┘               │
//! │                      └──────────────┘                            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fragvault::adapters::{AesGcmBlockCipher, DirectorySupplier, LoggingEventPublisher};
use fragvault::backup::BackupOutcome;
use fragvault::metrics::PipelineMetrics;
use fragvault::restore::RestoreOutcome;
use fragvault::{BackupId, EccMap, Pipeline, PipelineConfig};

const READ_CHUNK: usize = 64 * 1024;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Fragvault - Erasure-coded backups spread over suppliers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "FRAGVAULT_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding the catalog, matrix and local fragments
    #[arg(long, env = "FRAGVAULT_STATE_DIR", default_value = "./fragvault-state")]
    state_dir: PathBuf,

    /// Directory with one subdirectory per supplier
    #[arg(long, env = "FRAGVAULT_SUPPLIERS_ROOT", default_value = "./fragvault-suppliers")]
    suppliers_root: PathBuf,

    /// 32-byte backup key; created on first use (default: <state-dir>/backup.key)
    #[arg(long, env = "FRAGVAULT_KEY_FILE")]
    key_file: Option<PathBuf>,

    /// ECC scheme, overrides the config file
    #[arg(long, env = "FRAGVAULT_ECC_SCHEME")]
    ecc_scheme: Option<String>,

    /// Block size in bytes, overrides the config file
    #[arg(long, env = "FRAGVAULT_BLOCK_SIZE")]
    block_size: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Back up a file
    Backup {
        /// Backup id, `customer:path/version`
        #[arg(long)]
        id: BackupId,

        /// File to back up
        #[arg(long)]
        source: PathBuf,

        /// How long to wait for fragments to reach suppliers
        #[arg(long, default_value = "300")]
        send_timeout_secs: u64,
    },

    /// Restore a backup into a file
    Restore {
        #[arg(long)]
        id: BackupId,

        #[arg(long)]
        output: PathBuf,
    },

    /// Show backups and suppliers
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Run the monitor loop until interrupted
    Monitor {
        /// Metrics server bind address
        #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
        metrics_addr: String,

        /// Health server bind address
        #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
        health_addr: String,
    },

    /// Delete a backup locally and from its suppliers
    Delete {
        #[arg(long)]
        id: BackupId,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    let config = load_config(&args)?;
    info!("Starting fragvault");
    info!("  State dir: {}", args.state_dir.display());
    info!("  Suppliers root: {}", args.suppliers_root.display());
    info!("  ECC scheme: {}", config.ecc_scheme);
    info!("  Block size: {}", config.block_size);

    let key_file = args
        .key_file
        .clone()
        .unwrap_or_else(|| args.state_dir.join("backup.key"));
    let cipher = Arc::new(load_or_create_key(&key_file)?);
    let ecc = config.eccmap()?;

    let pipeline = Pipeline::open(
        config,
        &args.state_dir,
        cipher,
        Arc::new(LoggingEventPublisher::info_level()),
    )
    .context("failed to open pipeline state")?;
    add_suppliers(&pipeline, &args.suppliers_root, &ecc)?;

    let result = match args.command {
        Command::Backup {
            id,
            source,
            send_timeout_secs,
        } => run_backup(&pipeline, id, &source, Duration::from_secs(send_timeout_secs)).await,
        Command::Restore { id, output } => run_restore(&pipeline, id, &output).await,
        Command::Status { json } => print_status(&pipeline, json),
        Command::Monitor {
            metrics_addr,
            health_addr,
        } => run_monitor(&pipeline, metrics_addr, health_addr).await,
        Command::Delete { id } => pipeline
            .delete_backup(&id)
            .await
            .with_context(|| format!("failed to delete {}", id)),
    };

    pipeline.shutdown().await;
    result
}

fn load_config(args: &Args) -> anyhow::Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_yaml_file(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(scheme) = &args.ecc_scheme {
        config.ecc_scheme = scheme.clone();
    }
    if let Some(block_size) = args.block_size {
        config.block_size = block_size;
    }
    config.validate()?;
    Ok(config)
}

fn load_or_create_key(path: &Path) -> anyhow::Result<AesGcmBlockCipher> {
    if !path.exists() {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, AesGcmBlockCipher::generate_key())
            .with_context(|| format!("cannot write key file {}", path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        warn!("Created new backup key at {}; keep a copy of it", path.display());
    }
    Ok(AesGcmBlockCipher::from_key_file(path)?)
}

/// Register every supplier directory, creating `supplier-NN` directories
/// until the ecc scheme has enough of them.
fn add_suppliers(pipeline: &Pipeline, root: &Path, ecc: &EccMap) -> anyhow::Result<()> {
    std::fs::create_dir_all(root)
        .with_context(|| format!("cannot create suppliers root {}", root.display()))?;
    let mut suppliers = DirectorySupplier::discover(root)?;
    let mut next = suppliers.len();
    while suppliers.len() < ecc.supplier_count() {
        let dir = root.join(format!("supplier-{:02}", next));
        next += 1;
        if dir.exists() {
            continue;
        }
        std::fs::create_dir_all(&dir)?;
        suppliers = DirectorySupplier::discover(root)?;
    }
    info!("  Suppliers: {}", suppliers.len());
    for supplier in suppliers {
        pipeline.add_supplier(Arc::new(supplier))?;
    }
    Ok(())
}

// =============================================================================
// Commands
// =============================================================================

async fn run_backup(
    pipeline: &Arc<Pipeline>,
    id: BackupId,
    source: &Path,
    send_timeout: Duration,
) -> anyhow::Result<()> {
    let file = std::fs::File::open(source)
        .with_context(|| format!("cannot open {}", source.display()))?;
    pipeline.start();

    let (writer, handle) = pipeline.start_backup(id.clone())?;
    let producer = tokio::task::spawn_blocking(move || {
        let mut file = file;
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    writer.close();
                    return Err(anyhow::Error::from(e).context("failed to read source"));
                }
            };
            writer.write(&buf[..n])?;
        }
        writer.mark_finished();
        Ok(())
    });

    let interrupt = abort_on_ctrl_c(handle.abort_token());
    let outcome = handle.wait().await?;
    interrupt.abort();
    match producer.await? {
        Ok(()) => {}
        Err(e) if outcome.is_done() => warn!("Producer ended with {:#}", e),
        Err(e) => error!("Producer failed: {:#}", e),
    }

    match outcome {
        BackupOutcome::Done { total_blocks, .. } => {
            info!("Backup {} done with {} blocks; sending fragments", id, total_blocks);
            if tokio::time::timeout(send_timeout, pipeline.flush_sends())
                .await
                .is_err()
            {
                warn!(
                    "Fragments still unsent after {:?}; the monitor will retry",
                    send_timeout
                );
            }
            println!("{}", serde_json::to_string_pretty(&pipeline.backup(&id))?);
            Ok(())
        }
        other => bail!("backup {} did not complete: {:?}", id, other),
    }
}

async fn run_restore(pipeline: &Arc<Pipeline>, id: BackupId, output: &Path) -> anyhow::Result<()> {
    let file = tokio::fs::File::create(output)
        .await
        .with_context(|| format!("cannot create {}", output.display()))?;
    let handle = pipeline.restore(id.clone(), file)?;

    let interrupt = abort_on_ctrl_c(handle.abort_token());
    let outcome = handle.wait().await?;
    interrupt.abort();

    match outcome {
        RestoreOutcome::Done { blocks, bytes } => {
            info!("Restored {} bytes in {} blocks to {}", bytes, blocks, output.display());
            Ok(())
        }
        RestoreOutcome::Failed {
            block_number,
            reason,
        } => bail!("restore failed at block {}: {}", block_number, reason),
        RestoreOutcome::Aborted => bail!("restore aborted"),
    }
}

fn abort_on_ctrl_c(abort: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; aborting");
            abort.cancel();
        }
    })
}

fn print_status(pipeline: &Pipeline, json: bool) -> anyhow::Result<()> {
    let backups = pipeline.backups();
    let suppliers = pipeline.suppliers();
    if json {
        let body = serde_json::json!({
            "backups": backups,
            "suppliers": suppliers
                .iter()
                .map(|(id, state)| serde_json::json!({ "id": id, "state": state }))
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    println!(
        "{:<40} {:<8} {:<8} {:>7} {:>7} {:>7} {:>8}",
        "BACKUP", "STATUS", "ECC", "BLOCKS", "LOCAL", "REMOTE", "AT-RISK"
    );
    for backup in &backups {
        println!(
            "{:<40} {:<8} {:<8} {:>7} {:>7} {:>7} {:>8}",
            backup.state.id.to_string(),
            backup.state.status.to_string(),
            backup.state.ecc_scheme,
            backup.blocks,
            backup.local_fragments,
            backup.remote_fragments,
            backup.state.at_risk_blocks.len()
        );
    }
    println!();
    for (id, state) in &suppliers {
        println!("{:<40} {}", id.to_string(), state);
    }
    Ok(())
}

async fn run_monitor(
    pipeline: &Arc<Pipeline>,
    metrics_addr: String,
    health_addr: String,
) -> anyhow::Result<()> {
    pipeline.start();

    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {:#}", e);
        }
    });

    let metrics = pipeline.metrics().clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics).await {
            error!("Metrics server error: {:#}", e);
        }
    });

    info!("Monitor running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
    Ok(())
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn health_handler(
        req: Request<hyper::body::Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let mut response = Response::new(Full::new(Bytes::from("ok")));
        if !matches!(req.uri().path(), "/healthz" | "/livez" | "/readyz") {
            *response.status_mut() = StatusCode::NOT_FOUND;
            *response.body_mut() = Full::new(Bytes::from("not found"));
        }
        Ok(response)
    }

    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid health server address {}", addr))?;
    let listener = TcpListener::bind(addr)
        .await
        .context("failed to bind health server")?;

    info!("Health server listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await.context("health server accept")?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(health_handler))
                .await
            {
                error!("Health server connection error: {}", e);
            }
        });
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, metrics: Arc<PipelineMetrics>) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid metrics server address {}", addr))?;
    let listener = TcpListener::bind(addr)
        .await
        .context("failed to bind metrics server")?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await.context("metrics server accept")?;
        let io = TokioIo::new(stream);
        let metrics = metrics.clone();

        let handler = move |req: Request<hyper::body::Incoming>| {
            let metrics = metrics.clone();
            async move {
                let mut response = Response::new(Full::new(Bytes::new()));
                if req.uri().path() != "/metrics" {
                    *response.status_mut() = StatusCode::NOT_FOUND;
                    *response.body_mut() = Full::new(Bytes::from("not found"));
                    return Ok::<_, std::convert::Infallible>(response);
                }
                match metrics.encode_text() {
                    Ok(text) => {
                        response.headers_mut().insert(
                            CONTENT_TYPE,
                            HeaderValue::from_static("text/plain; version=0.0.4"),
                        );
                        *response.body_mut() = Full::new(Bytes::from(text));
                    }
                    Err(e) => {
                        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                        *response.body_mut() = Full::new(Bytes::from(e.to_string()));
                    }
                }
                Ok(response)
            }
        };

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handler))
                .await
            {
                error!("Metrics server connection error: {}", e);
            }
        });
    }
}
