//! Configuration parsing – reads a KEY=VALUE file (`livecap.conf`).
//!
//! The parsed [`Config`] is handed to every session explicitly; nothing in
//! the crate looks configuration up from global state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::info;

/// Default muxer segment size when neither `SEGMENT_TIME` nor `FILE_SIZE`
/// is configured (matches ffmpeg's historical `-fs` default here).
pub const DEFAULT_MUXER_FILE_SIZE: u64 = 2_621_440_000;

/// Which capture backend a session should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// In-process capture engine.
    #[default]
    NativeEngine,
    /// External muxer subprocess (ffmpeg).
    ProcessMuxer,
}

impl BackendKind {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "native" | "stream-gears" => Ok(BackendKind::NativeEngine),
            "ffmpeg" | "muxer" => Ok(BackendKind::ProcessMuxer),
            other => Err(ConfigError::UnknownDownloader(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::NativeEngine => "native",
            BackendKind::ProcessMuxer => "ffmpeg",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown downloader '{0}' (expected 'native' or 'ffmpeg')")]
    UnknownDownloader(String),
    #[error("invalid SEGMENT_TIME '{0}' (expected HH:MM:SS)")]
    BadSegmentTime(String),
    #[error("invalid value for {key}: '{value}'")]
    BadNumber { key: &'static str, value: String },
}

/// Recorder configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // ── capture ──────────────────────────────────────────────────────
    pub downloader: BackendKind,
    /// Segment duration in seconds, parsed from `HH:MM:SS`.
    pub segment_time: Option<u64>,
    /// Segment size in bytes.
    pub file_size: Option<u64>,
    pub ffmpeg_path: PathBuf,

    // ── output ───────────────────────────────────────────────────────
    pub output_dir: PathBuf,
    /// Filename template; `None` means `{streamer}%Y-%m-%dT%H_%M_%S`.
    pub filename_prefix: Option<String>,
    pub suffix: String,

    // ── retry ────────────────────────────────────────────────────────
    /// Seconds to wait before re-checking a stream that went away.
    pub delay: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            downloader: BackendKind::NativeEngine,
            segment_time: None,
            file_size: None,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            output_dir: PathBuf::from("."),
            filename_prefix: None,
            suffix: "flv".to_string(),
            delay: None,
        }
    }
}

impl Config {
    /// Default config path.
    pub fn default_path() -> &'static str {
        "/etc/livecap/livecap.conf"
    }
}

/// Load a `KEY=VALUE` configuration file.
///
/// Lines starting with `#` are comments.  Values may be optionally
/// double-quoted.  Unknown keys are silently ignored.
pub fn load(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read config: {}", path.display()))?;

    let config = from_str(&text).with_context(|| format!("Invalid config: {}", path.display()))?;
    info!("Loaded config from {}", path.display());
    Ok(config)
}

/// Build a [`Config`] from the text of a configuration file.
pub fn from_str(text: &str) -> Result<Config, ConfigError> {
    let map = parse_conf(text);
    let get = |key: &str| -> Option<String> {
        map.get(key).cloned().filter(|v| !v.is_empty())
    };
    let get_u64 = |key: &'static str| -> Result<Option<u64>, ConfigError> {
        get(key)
            .map(|v| {
                v.parse::<u64>()
                    .map_err(|_| ConfigError::BadNumber { key, value: v.clone() })
            })
            .transpose()
    };

    let defaults = Config::default();
    Ok(Config {
        downloader: match get("DOWNLOADER") {
            Some(v) => BackendKind::parse(&v)?,
            None => defaults.downloader,
        },
        segment_time: get("SEGMENT_TIME")
            .map(|v| parse_segment_time(&v))
            .transpose()?,
        file_size: get_u64("FILE_SIZE")?.filter(|&n| n > 0),
        ffmpeg_path: get("FFMPEG_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.ffmpeg_path),
        output_dir: get("OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.output_dir),
        filename_prefix: get("FILENAME_PREFIX"),
        suffix: get("SUFFIX").unwrap_or(defaults.suffix),
        delay: get_u64("DELAY")?.filter(|&n| n > 0),
    })
}

/// Parse an `HH:MM:SS` duration into seconds.
pub fn parse_segment_time(value: &str) -> Result<u64, ConfigError> {
    let bad = || ConfigError::BadSegmentTime(value.to_string());
    let parts: Vec<&str> = value.trim().split(':').collect();
    if parts.len() != 3 {
        return Err(bad());
    }
    let mut total = 0u64;
    for (part, scale) in parts.iter().zip([3600u64, 60, 1]) {
        let n: u64 = part.trim().parse().map_err(|_| bad())?;
        total = n
            .checked_mul(scale)
            .and_then(|v| total.checked_add(v))
            .ok_or_else(bad)?;
    }
    if total == 0 {
        return Err(bad());
    }
    Ok(total)
}

/// Parse `KEY=VALUE` lines into a map, stripping optional double-quotes.
fn parse_conf(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, val)) = line.split_once('=') {
            let key = key.trim();
            let val = val.trim().trim_matches('"');
            map.insert(key.to_string(), val.to_string());
        }
    }
    map
}

// ─── tests ───────────────────────────────────────────────────────────────
