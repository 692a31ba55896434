//! livecap – records one live stream until it goes offline.
//!
//! Usage: `livecap <name> <url> [config-path]`
//!
//! The session summary is printed to stdout as JSON when recording ends.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use livecap_capture::backend::CaptureBackend;
use livecap_capture::http::{HttpProbe, HttpPullEngine};
use livecap_capture::muxer::ProcessMuxerBackend;
use livecap_capture::native::NativeEngineBackend;
use livecap_capture::session::{Session, SessionController};
use livecap_common::config::{self, BackendKind, Config};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let (name, url) = match (args.next(), args.next()) {
        (Some(name), Some(url)) => (name, url),
        _ => anyhow::bail!("usage: livecap <name> <url> [config-path]"),
    };

    // ── load config ──────────────────────────────────────────────────
    let config_path = args
        .next()
        .unwrap_or_else(|| Config::default_path().to_string());
    let config = if Path::new(&config_path).exists() {
        config::load(Path::new(&config_path)).context("Config load failed")?
    } else {
        info!("No config at {config_path}, using defaults");
        Config::default()
    };

    std::fs::create_dir_all(&config.output_dir).with_context(|| {
        format!(
            "Cannot create output directory {}",
            config.output_dir.display()
        )
    })?;

    // ── ctrl-c ───────────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::Relaxed);
        info!("Shutdown signal received");
    })
    .context("Cannot set Ctrl-C handler")?;

    // ── backend ──────────────────────────────────────────────────────
    let backend: Box<dyn CaptureBackend> = match config.downloader {
        BackendKind::NativeEngine => Box::new(NativeEngineBackend::new(HttpPullEngine::new(
            shutdown.clone(),
        )?)),
        BackendKind::ProcessMuxer => Box::new(ProcessMuxerBackend::new(
            config.ffmpeg_path.clone(),
            shutdown.clone(),
        )),
    };
    let probe = HttpProbe::new()?;

    info!(
        "livecap starting (name={name}, downloader={}, output={})",
        config.downloader.as_str(),
        config.output_dir.display()
    );

    let session = Session::new(&name, &url, &config);
    let summary = SessionController::new(session, config, Box::new(probe), backend)
        .with_shutdown(shutdown)
        .run()
        .context("Recording session failed")?;

    println!(
        "{}",
        serde_json::to_string_pretty(&summary).context("Cannot encode summary")?
    );
    info!("livecap stopped");
    Ok(())
}
