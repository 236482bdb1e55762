//! Chunkify command-line uploader.

mod progress;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use chunkify_http::{HttpTransport, WireEncoding};
use chunkify_transfer::{Chunkify, ChunkifyOptions, UploadResult};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use progress::{UploadBars, format_bytes};

/// Upload files in chunks over HTTP
#[derive(Parser)]
#[command(name = "chunkify")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload one or more files
    Upload(UploadArgs),
}

#[derive(Args, Default)]
struct UploadArgs {
    /// Files to upload
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// JSON options file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Upload endpoint
    #[arg(long)]
    route: Option<String>,

    /// Prepended to a relative route
    #[arg(long)]
    base_url: Option<String>,

    /// HTTP verb
    #[arg(long)]
    method: Option<String>,

    /// Upload chunks concurrently
    #[arg(long)]
    parallel: bool,

    /// Concurrent chunk uploads in parallel mode
    #[arg(long)]
    workers: Option<usize>,

    /// Bytes per chunk
    #[arg(long)]
    chunk_size: Option<u64>,

    /// Number of chunks per file (ignored when --chunk-size is set)
    #[arg(long = "chunks")]
    number_of_chunks: Option<u32>,

    /// Retries per chunk after its first failure
    #[arg(long)]
    max_retries: Option<u32>,

    /// Request encoding: multipart or headers
    #[arg(long, default_value_t = WireEncoding::Multipart)]
    encoding: WireEncoding,

    /// Per-request timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,
}

impl UploadArgs {
    /// Options from `--config` (or defaults) with flags applied on top.
    fn options(&self) -> anyhow::Result<ChunkifyOptions> {
        let mut options = match &self.config {
            Some(path) => ChunkifyOptions::load(path)
                .with_context(|| format!("cannot load options from {}", path.display()))?,
            None => ChunkifyOptions::default(),
        };

        if let Some(route) = &self.route {
            options.route = route.clone();
        }
        if let Some(base_url) = &self.base_url {
            options.base_url = Some(base_url.clone());
        }
        if let Some(method) = &self.method {
            options.method = method.clone();
        }
        if self.parallel {
            options.parallel = true;
        }
        if let Some(workers) = self.workers {
            options.workers = Some(workers);
        }
        if let Some(size) = self.chunk_size {
            options.chunk_size = Some(size);
        }
        if let Some(count) = self.number_of_chunks {
            options.number_of_chunks = count;
        }
        if let Some(retries) = self.max_retries {
            options.max_retries = retries;
        }
        if self.files.len() > 1 {
            options.multiple = true;
        }
        Ok(options)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(if cli.verbose { "debug" } else { "info" })
        }))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Upload(args) => upload(args).await,
    }
}

async fn upload(args: UploadArgs) -> anyhow::Result<()> {
    let options = args.options()?;
    let mut engine = Chunkify::new(options).context("invalid upload options")?;
    info!(
        route = %engine.config().route,
        method = %engine.config().method,
        encoding = %args.encoding,
        "chunkify starting"
    );

    let bars = Arc::new(UploadBars::new());
    let b = Arc::clone(&bars);
    engine.on_progress(move |p| b.update(p));
    engine.on_success(|file, response| {
        info!(
            file = %file.name(),
            status = response.status,
            response = %response.text(),
            "file stored"
        );
    });

    let mut files = Vec::with_capacity(args.files.len());
    for path in &args.files {
        let file = engine
            .open(path)
            .with_context(|| format!("cannot open {}", path.display()))?;
        info!(
            file = %file.name(),
            size = %format_bytes(file.size()),
            mime = %file.mime_type(),
            "queued"
        );
        files.push(file);
    }

    let transport = HttpTransport::with_timeout(args.encoding, args.timeout.map(Duration::from_secs))
        .context("cannot build HTTP client")?;

    let cancel = engine.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling uploads");
            cancel.cancel();
        }
    });

    let results = engine.upload(&files, &transport).await?;

    for result in &results {
        bars.finish(result);
    }
    let failed = report_failures(&results);
    if failed > 0 {
        bail!("{failed} of {} uploads did not complete", results.len());
    }
    Ok(())
}

/// Logs every result whose status counts as a failure. Returns how many.
fn report_failures(results: &[UploadResult]) -> usize {
    let mut failed = 0;
    for result in results.iter().filter(|r| r.status.is_failure()) {
        failed += 1;
        warn!(
            file = %result.file_name,
            status = %result.status,
            chunk = ?result.failed_chunk,
            error = result.error.as_deref().unwrap_or(""),
            "upload did not complete"
        );
    }
    failed
}
