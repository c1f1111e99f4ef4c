use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

use mediad::{
    config::{self, ServiceConfig},
    engine::FfmpegEngine,
    housekeeping, hwaccel, ChunkAssembler, JobRunner, Splitter, TaskRegistry, TranscodeEngine,
};

mod handlers;
mod server;
mod split_handlers;

/// Media conversion service
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address override
    #[arg(long)]
    host: Option<String>,

    /// Bind port override
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logger - use RUST_LOG env var or default to info level
    env_logger::Builder::from_default_env()
        .format_timestamp_secs()
        .init();

    let args = Args::parse();

    let mut cfg = ServiceConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(host) = args.host {
        cfg.host = host;
    }
    if let Some(port) = args.port {
        cfg.port = port;
    }

    info!("Media conversion daemon starting");
    info!("  Data dir: {}", cfg.data_dir.display());
    info!("  Temp dir: {}", cfg.temp_dir.display());
    info!("  Output dir: {}", cfg.output_dir.display());

    cfg.ensure_dirs().context("Failed to create working directories")?;

    if cfg.ffmpeg_bin == PathBuf::from("ffmpeg") {
        cfg.ffmpeg_bin = config::find_tool("ffmpeg");
    }
    if cfg.ffprobe_bin == PathBuf::from("ffprobe") {
        cfg.ffprobe_bin = config::find_tool("ffprobe");
    }
    info!("  ffmpeg: {}", cfg.ffmpeg_bin.display());
    info!("  ffprobe: {}", cfg.ffprobe_bin.display());

    let mut caps = hwaccel::probe(&cfg.ffmpeg_bin).await;
    if caps.enabled {
        match hwaccel::smoke_test(&cfg.ffmpeg_bin, &caps).await {
            Ok(()) => info!("hardware acceleration active: {}", caps.kind),
            Err(e) => {
                warn!("hardware encoder failed smoke test, using CPU: {}", e);
                caps = hwaccel::HwCaps::disabled();
            }
        }
    } else {
        info!("no hardware acceleration detected, using CPU");
    }

    let engine: Arc<dyn TranscodeEngine> = Arc::new(FfmpegEngine::new(
        cfg.ffmpeg_bin.clone(),
        cfg.ffprobe_bin.clone(),
        caps,
    ));
    engine
        .validate()
        .await
        .context("ffmpeg is not usable; install it or set ffmpeg_bin in the config")?;

    let registry = Arc::new(TaskRegistry::new());
    let assembler = Arc::new(ChunkAssembler::new(
        cfg.temp_dir.clone(),
        cfg.data_dir.clone(),
    ));

    // Nothing is live yet, so this clears every leftover staging entry
    let swept = housekeeping::sweep_staging(&cfg.temp_dir, &assembler.live_ids());
    if swept > 0 {
        info!("removed {} leftover staging entr(ies)", swept);
    }
    let runner = Arc::new(JobRunner::new(Arc::clone(&registry), Arc::clone(&engine)));
    let splitter = Arc::new(Splitter::new(Arc::clone(&engine), cfg.output_dir.clone()));

    let addr = format!("{}:{}", cfg.host, cfg.port);
    let state = server::AppState {
        config: Arc::new(cfg),
        registry,
        assembler,
        runner,
        splitter,
    };

    let app = server::router(state);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("listening on http://{}", addr);

    axum::serve(listener, app)
        .await
        .context("Server terminated")?;
    Ok(())
}
