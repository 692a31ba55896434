//! Capture backend contract shared by the native engine and the muxer
//! subprocess.

use std::ops::{Deref, DerefMut};
use std::path::Path;

use thiserror::Error;

use livecap_common::config::BackendKind;
use livecap_common::segment::SegmentPolicy;

/// Ordered request headers sent to the stream host.
pub type Headers = Vec<(String, String)>;

/// Exit code meaning "the remote dropped us, try again after a cool-down".
pub const EXIT_KEEP_GOING: i32 = 1;

/// Exit code reported when a backend failed internally or its process was
/// killed by a signal.
pub const EXIT_ABNORMAL: i32 = -1;

/// Everything a backend needs for one capture attempt.
#[derive(Debug, Clone, Copy)]
pub struct CaptureRequest<'a> {
    pub url: &'a str,
    pub headers: &'a [(String, String)],
    /// Output path without the container suffix.
    pub output: &'a Path,
    pub suffix: &'a str,
    pub segment: SegmentPolicy,
    pub extra_args: &'a [String],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureResult {
    pub exit_code: i32,
    /// Best-effort count of bytes written.
    pub bytes_written: Option<u64>,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("cannot spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error during capture: {0}")]
    Io(#[from] std::io::Error),
    #[error("capture interrupted")]
    Interrupted,
    #[error("capture backend panicked")]
    Panicked,
}

/// A way of getting a live stream onto disk.
///
/// `capture` blocks for the whole recording attempt.  `close` releases
/// anything the backend still holds from that attempt; it is called once
/// after every attempt, whatever the outcome.
pub trait CaptureBackend: Send {
    fn kind(&self) -> BackendKind;

    fn capture(&mut self, request: &CaptureRequest<'_>) -> Result<CaptureResult, CaptureError>;

    fn close(&mut self) {}
}

/// Scope of one capture attempt: calls [`CaptureBackend::close`] on drop,
/// including during unwinding.
pub struct AttemptGuard<'a, B: CaptureBackend + ?Sized> {
    backend: &'a mut B,
}

impl<'a, B: CaptureBackend + ?Sized> AttemptGuard<'a, B> {
    pub fn new(backend: &'a mut B) -> Self {
        AttemptGuard { backend }
    }
}

impl<B: CaptureBackend + ?Sized> Deref for AttemptGuard<'_, B> {
    type Target = B;

    fn deref(&self) -> &B {
        self.backend
    }
}

impl<B: CaptureBackend + ?Sized> DerefMut for AttemptGuard<'_, B> {
    fn deref_mut(&mut self) -> &mut B {
        self.backend
    }
}

impl<B: CaptureBackend + ?Sized> Drop for AttemptGuard<'_, B> {
    fn drop(&mut self) {
        self.backend.close();
    }
}
