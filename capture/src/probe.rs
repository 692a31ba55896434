//! Stream availability checks.

use crate::session::Session;

/// What a successful probe learned about the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveStream {
    /// URL the backend should actually read from.
    pub raw_url: String,
    pub title: Option<String>,
}

/// Platform-specific discovery of a live stream.
///
/// Returns `Ok(None)` when the source is not live right now.  Called
/// repeatedly over a session's lifetime, so implementations must tolerate
/// being asked again after any outcome.
pub trait StreamProbe: Send {
    fn check_stream(&mut self, session: &Session) -> anyhow::Result<Option<LiveStream>>;
}
