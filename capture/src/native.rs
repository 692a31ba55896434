//! Native engine backend – hands the capture to an in-process engine.

use std::path::Path;

use tracing::{error, info};

use livecap_common::config::BackendKind;
use livecap_common::segment::SegmentPolicy;

use crate::backend::{CaptureBackend, CaptureError, CaptureRequest, CaptureResult, EXIT_ABNORMAL};

/// Segment limits in the shape capture engines expect: at most one of
/// `time` (seconds) and `size` (bytes) is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineSegment {
    pub time: Option<u64>,
    pub size: Option<u64>,
}

impl From<SegmentPolicy> for EngineSegment {
    fn from(policy: SegmentPolicy) -> Self {
        match policy {
            SegmentPolicy::ByDuration(secs) => EngineSegment {
                time: Some(secs),
                size: None,
            },
            SegmentPolicy::BySize(bytes) => EngineSegment {
                time: None,
                size: Some(bytes),
            },
        }
    }
}

/// A blocking stream downloader.
///
/// The engine must write the primary output to `{output}.{suffix}.part`
/// so the session can finalize it.  Returns the number of bytes written.
pub trait NativeEngine: Send {
    fn download(
        &mut self,
        url: &str,
        headers: &[(String, String)],
        output: &Path,
        suffix: &str,
        segment: &EngineSegment,
    ) -> anyhow::Result<u64>;
}

pub struct NativeEngineBackend<E> {
    engine: E,
}

impl<E: NativeEngine> NativeEngineBackend<E> {
    pub fn new(engine: E) -> Self {
        NativeEngineBackend { engine }
    }
}

impl<E: NativeEngine> CaptureBackend for NativeEngineBackend<E> {
    fn kind(&self) -> BackendKind {
        BackendKind::NativeEngine
    }

    fn capture(&mut self, request: &CaptureRequest<'_>) -> Result<CaptureResult, CaptureError> {
        let segment = EngineSegment::from(request.segment);
        info!(
            "Native capture → {} (segment {})",
            request.output.display(),
            request.segment
        );

        match self.engine.download(
            request.url,
            request.headers,
            request.output,
            request.suffix,
            &segment,
        ) {
            Ok(bytes) => Ok(CaptureResult {
                exit_code: 0,
                bytes_written: Some(bytes),
            }),
            Err(e) => {
                error!("Native engine failed: {e:#}");
                Ok(CaptureResult {
                    exit_code: EXIT_ABNORMAL,
                    bytes_written: None,
                })
            }
        }
    }
}
