//! Segment policy – decides when a capture rolls into a new output file.

use std::time::Duration;

use crate::config::{BackendKind, Config, DEFAULT_MUXER_FILE_SIZE};

/// Native engine default when nothing is configured: 8 GiB.
pub const DEFAULT_NATIVE_FILE_SIZE: u64 = 8 * 1024 * 1024 * 1024;

/// Split rule for a recording.  Exactly one limit is ever active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentPolicy {
    /// Roll over after this many seconds.
    ByDuration(u64),
    /// Roll over after this many bytes.
    BySize(u64),
}

impl SegmentPolicy {
    /// Derive the policy for `backend` from the configuration.
    ///
    /// `SEGMENT_TIME` wins over `FILE_SIZE` when both are set.
    pub fn from_config(config: &Config, backend: BackendKind) -> Self {
        match (config.segment_time, config.file_size) {
            (Some(secs), _) if secs > 0 => SegmentPolicy::ByDuration(secs),
            (_, Some(bytes)) if bytes > 0 => SegmentPolicy::BySize(bytes),
            _ => match backend {
                BackendKind::NativeEngine => SegmentPolicy::BySize(DEFAULT_NATIVE_FILE_SIZE),
                BackendKind::ProcessMuxer => SegmentPolicy::BySize(DEFAULT_MUXER_FILE_SIZE),
            },
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        match self {
            SegmentPolicy::ByDuration(secs) => Some(Duration::from_secs(*secs)),
            SegmentPolicy::BySize(_) => None,
        }
    }

    pub fn size(&self) -> Option<u64> {
        match self {
            SegmentPolicy::ByDuration(_) => None,
            SegmentPolicy::BySize(bytes) => Some(*bytes),
        }
    }

    /// `HH:MM:SS` form used on muxer command lines.
    pub fn hms(secs: u64) -> String {
        format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

impl std::fmt::Display for SegmentPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SegmentPolicy::ByDuration(secs) => write!(f, "every {}", Self::hms(*secs)),
            SegmentPolicy::BySize(bytes) => {
                write!(f, "every {:.1} MB", *bytes as f64 / 1_048_576.0)
            }
        }
    }
}
