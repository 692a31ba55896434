//! Types returned to whoever spawned a recording session.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Outcome of one session's retry loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub name: String,
    pub url: String,
    /// Last title reported by the stream probe.
    pub title: Option<String>,
    /// Local time at which the session began.
    pub started_at: DateTime<Local>,
    /// Capture attempts that ran.
    pub attempts: u32,
    /// Availability checks made by the main loop.
    pub probes: u32,
}
