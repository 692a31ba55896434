//! Muxer backend – records by running `ffmpeg` as a child process.
//!
//! The child's stdout and stderr are drained on reader threads and
//! forwarded line by line to the log.  Output is the only liveness signal;
//! the attempt ends when the process exits.

use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use livecap_common::config::BackendKind;
use livecap_common::segment::SegmentPolicy;

use crate::backend::{CaptureBackend, CaptureError, CaptureRequest, CaptureResult, EXIT_ABNORMAL};
use crate::finalize::provisional_path;

/// How often the forwarding loop looks at the shutdown flag.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// How long ffmpeg gets to flush and exit after being sent `q`.
const QUIT_GRACE: Duration = Duration::from_secs(10);

pub struct ProcessMuxerBackend {
    program: PathBuf,
    shutdown: Arc<AtomicBool>,
    child: Option<Child>,
}

impl ProcessMuxerBackend {
    pub fn new(program: impl Into<PathBuf>, shutdown: Arc<AtomicBool>) -> Self {
        ProcessMuxerBackend {
            program: program.into(),
            shutdown,
            child: None,
        }
    }
}

impl CaptureBackend for ProcessMuxerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::ProcessMuxer
    }

    fn capture(&mut self, request: &CaptureRequest<'_>) -> Result<CaptureResult, CaptureError> {
        let args = build_args(request);
        info!(
            "Spawning: {} {}",
            self.program.display(),
            args.iter()
                .filter(|a| !a.contains("\r\n"))
                .cloned()
                .collect::<Vec<_>>()
                .join(" ")
        );

        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| CaptureError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;
        info!("ffmpeg started (pid={})", child.id());

        let child = self.child.insert(child);
        let exit_code = forward_until_exit(child, &self.shutdown, "ffmpeg")?;
        self.child = None;

        let bytes_written = match request.segment {
            SegmentPolicy::BySize(_) => std::fs::metadata(provisional_path(
                request.output,
                request.suffix,
            ))
            .map(|m| m.len())
            .ok(),
            SegmentPolicy::ByDuration(_) => None,
        };

        Ok(CaptureResult {
            exit_code,
            bytes_written,
        })
    }

    /// Kill a child that outlived its attempt (spawned but never reaped).
    fn close(&mut self) {
        if let Some(mut child) = self.child.take() {
            match child.try_wait() {
                Ok(Some(_)) => {}
                _ => {
                    warn!("Killing leftover ffmpeg (pid={})", child.id());
                    let _ = child.kill();
                    let _ = child.wait();
                }
            }
        }
    }
}

/// Full ffmpeg argument list for one capture.
pub fn build_args(request: &CaptureRequest<'_>) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-y".into(),
        "-headers".into(),
        header_blob(request.headers),
        "-reconnect_streamed".into(),
        "1".into(),
        "-reconnect_delay_max".into(),
        "20".into(),
        "-rw_timeout".into(),
        "20000000".into(),
        "-i".into(),
        request.url.into(),
        "-bsf:a".into(),
        "aac_adtstoasc".into(),
    ];

    match request.segment {
        SegmentPolicy::ByDuration(secs) => {
            args.extend(["-segment_time".into(), SegmentPolicy::hms(secs)]);
        }
        SegmentPolicy::BySize(bytes) => {
            args.extend(["-fs".into(), bytes.to_string()]);
        }
    }

    args.extend(request.extra_args.iter().cloned());
    args.extend(["-c".into(), "copy".into()]);

    match request.segment {
        SegmentPolicy::ByDuration(_) => {
            // The segment muxer treats every `%` as a directive.
            let pattern = format!(
                "{} part-%03d.{}",
                request.output.display().to_string().replace('%', "%%"),
                request.suffix
            );
            args.extend([
                "-f".into(),
                "segment".into(),
                "-segment_format".into(),
                request.suffix.into(),
                pattern,
            ]);
        }
        SegmentPolicy::BySize(_) => {
            let part = provisional_path(request.output, request.suffix);
            args.extend([
                "-f".into(),
                request.suffix.into(),
                part.display().to_string(),
            ]);
        }
    }
    args
}

/// `Key: Value\r\n` for every header, concatenated.
pub fn header_blob(headers: &[(String, String)]) -> String {
    headers
        .iter()
        .map(|(k, v)| format!("{k}: {v}\r\n"))
        .collect()
}

/// Forward the child's output to the log until it exits.
///
/// Returns the exit code (`-1` if killed by a signal).  If `shutdown` is
/// raised meanwhile, the child is asked to quit and
/// [`CaptureError::Interrupted`] is returned.
pub fn forward_until_exit(
    child: &mut Child,
    shutdown: &AtomicBool,
    label: &str,
) -> Result<i32, CaptureError> {
    let (tx, rx) = mpsc::channel::<String>();
    if let Some(stdout) = child.stdout.take() {
        spawn_line_reader(stdout, tx.clone(), format!("{label}-stdout"))?;
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_line_reader(stderr, tx.clone(), format!("{label}-stderr"))?;
    }
    drop(tx);

    loop {
        if shutdown.load(Ordering::Relaxed) {
            request_quit(child, label);
            return Err(CaptureError::Interrupted);
        }
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(line) => debug!("[{label}] {line}"),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let status = child.wait()?;
    debug!("{label} exited with {status}");
    Ok(status.code().unwrap_or(EXIT_ABNORMAL))
}

fn spawn_line_reader<R: Read + Send + 'static>(
    reader: R,
    tx: Sender<String>,
    name: String,
) -> std::io::Result<()> {
    std::thread::Builder::new().name(name).spawn(move || {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end();
                    if !line.is_empty() && tx.send(line.to_string()).is_err() {
                        break;
                    }
                }
            }
        }
    })?;
    Ok(())
}

/// Ask the child to stop the way an interactive user would: send `q` on
/// stdin and give it [`QUIT_GRACE`] to exit.  Anything still running after
/// that is left for [`CaptureBackend::close`].
fn request_quit(child: &mut Child, label: &str) {
    if cfg!(windows) {
        return;
    }
    info!("Asking {label} (pid={}) to quit", child.id());
    if let Some(stdin) = child.stdin.as_mut() {
        if let Err(e) = stdin.write_all(b"q").and_then(|()| stdin.flush()) {
            warn!("Cannot write quit to {label}: {e}");
            return;
        }
    }

    let deadline = Instant::now() + QUIT_GRACE;
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(status)) => {
                info!("{label} quit with {status}");
                return;
            }
            Ok(None) => std::thread::sleep(POLL_INTERVAL),
            Err(e) => {
                warn!("Cannot check {label} status: {e}");
                return;
            }
        }
    }
    warn!("{label} did not quit within {QUIT_GRACE:?}");
}
