//! Recording session – probes a stream, captures it, finalizes the output,
//! and decides whether to go again.
//!
//! One session runs on one thread and owns everything it touches; several
//! sessions can run side by side without sharing state.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use livecap_common::config::{BackendKind, Config};
use livecap_common::filename::{self, FilenameError, NameFields};
use livecap_common::protocol::SessionSummary;
use livecap_common::segment::SegmentPolicy;

use crate::backend::{
    AttemptGuard, CaptureBackend, CaptureError, CaptureRequest, CaptureResult, Headers,
    EXIT_KEEP_GOING,
};
use crate::finalize::{self, provisional_path};
use crate::probe::StreamProbe;

/// Capture attempts per session before giving up.
pub const MAX_ATTEMPTS: u32 = 30;

/// Pause after an attempt that asked to keep going, or after any native
/// engine attempt.
pub const COOL_DOWN: Duration = Duration::from_secs(45);

/// Pause before retrying a stream that came back during the `DELAY` wait.
pub const GRACE: Duration = Duration::from_secs(5);

/// Browser-like headers sent with every request.
pub fn default_headers() -> Headers {
    [
        (
            "Accept",
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
        ),
        ("Accept-Encoding", "gzip, deflate"),
        ("Accept-Language", "zh-CN,zh;q=0.8,en-US;q=0.5,en;q=0.3"),
        (
            "User-Agent",
            "Mozilla/5.0 (X11; Linux x86_64; rv:60.1) Gecko/20100101 Firefox/60.1",
        ),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// State of one recording session.
#[derive(Debug, Clone)]
pub struct Session {
    pub name: String,
    pub url: String,
    /// Container extension, e.g. `flv`.
    pub suffix: String,
    /// Room title, as last reported by the probe.
    pub title: Option<String>,
    /// Set by a successful probe; cleared when the attempt ends.
    pub raw_stream_url: Option<String>,
    pub backend_kind: BackendKind,
    /// Extra backend options (ffmpeg output arguments).
    pub extra_args: Vec<String>,
    pub headers: Headers,
    pub filename_template: Option<String>,
}

impl Session {
    pub fn new(name: &str, url: &str, config: &Config) -> Self {
        Session {
            name: name.to_string(),
            url: url.to_string(),
            suffix: config.suffix.clone(),
            title: None,
            raw_stream_url: None,
            backend_kind: config.downloader,
            extra_args: Vec::new(),
            headers: default_headers(),
            filename_template: config.filename_prefix.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    /// The configured template cannot produce a usable file name; retrying
    /// will not help.
    #[error(transparent)]
    InvalidFilename(#[from] FilenameError),
    #[error("recording session interrupted")]
    Interrupted,
}

/// Blocking pause between attempts.
pub trait Sleeper: Send {
    /// Sleep for `duration`, returning early once `shutdown` is raised.
    fn sleep(&self, duration: Duration, shutdown: &AtomicBool);
}

/// Sleeps on the current thread in one-second slices.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration, shutdown: &AtomicBool) {
        let deadline = Instant::now() + duration;
        loop {
            if shutdown.load(Ordering::Relaxed) {
                return;
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return;
            }
            std::thread::sleep(left.min(Duration::from_secs(1)));
        }
    }
}

/// How a single probe-and-capture cycle ended.
#[derive(Debug)]
pub enum AttemptOutcome {
    /// The probe found nothing live.
    Offline,
    /// The backend ran to completion.
    Captured(CaptureResult),
    /// Probe, capture or filesystem trouble; the session carries on.
    Faulted(anyhow::Error),
}

/// Drives one [`Session`] through probe → capture → finalize until the
/// stream goes away or [`MAX_ATTEMPTS`] captures have run.
pub struct SessionController {
    session: Session,
    config: Config,
    probe: Box<dyn StreamProbe>,
    backend: Box<dyn CaptureBackend>,
    sleeper: Box<dyn Sleeper>,
    shutdown: Arc<AtomicBool>,
}

impl SessionController {
    pub fn new(
        mut session: Session,
        config: Config,
        probe: Box<dyn StreamProbe>,
        backend: Box<dyn CaptureBackend>,
    ) -> Self {
        session.backend_kind = backend.kind();
        SessionController {
            session,
            config,
            probe,
            backend,
            sleeper: Box::new(ThreadSleeper),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Box<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Run the retry loop to completion.
    ///
    /// Only an unusable file name or an interrupt end the session with an
    /// error; every other failure is logged and counted as an attempt.
    pub fn run(mut self) -> Result<SessionSummary, SessionError> {
        let started_at = Local::now();
        info!(
            "Starting {} recorder for {} ({})",
            self.backend.kind().as_str(),
            self.session.name,
            self.session.url
        );

        let mut attempts = 0u32;
        let mut probes = 0u32;
        while attempts < MAX_ATTEMPTS {
            self.check_shutdown()?;
            probes += 1;

            let keep_going = match self.attempt()? {
                AttemptOutcome::Offline => {
                    let Some(delay) = self.config.delay else {
                        break;
                    };
                    info!("{} went offline, re-checking in {delay}s", self.session.name);
                    self.pause(Duration::from_secs(delay))?;
                    probes += 1;
                    if self.is_live() {
                        self.pause(GRACE)?;
                        continue;
                    }
                    break;
                }
                AttemptOutcome::Captured(result) => result.exit_code == EXIT_KEEP_GOING,
                AttemptOutcome::Faulted(e) => {
                    error!("Attempt failed for {}: {e:#}", self.session.name);
                    false
                }
            };

            attempts += 1;
            if keep_going || self.backend.kind() == BackendKind::NativeEngine {
                debug!("Cooling down for {COOL_DOWN:?}");
                self.pause(COOL_DOWN)?;
            }
        }

        if attempts >= MAX_ATTEMPTS {
            warn!("{} reached {MAX_ATTEMPTS} attempts", self.session.name);
        }
        info!("Leaving session after {attempts} attempt(s): {}", self.session.name);

        Ok(SessionSummary {
            name: self.session.name,
            url: self.session.url,
            title: self.session.title,
            started_at,
            attempts,
            probes,
        })
    }

    /// Probe, then capture and finalize if the stream is live.
    pub fn attempt(&mut self) -> Result<AttemptOutcome, SessionError> {
        let live = match self.probe.check_stream(&self.session) {
            Ok(Some(live)) => live,
            Ok(None) => return Ok(AttemptOutcome::Offline),
            Err(e) => return Ok(AttemptOutcome::Faulted(e.context("stream probe failed"))),
        };
        if live.title.is_some() {
            self.session.title = live.title;
        }
        self.session.raw_stream_url = Some(live.raw_url.clone());

        let outcome = self.capture(&live.raw_url);
        self.session.raw_stream_url = None;
        outcome
    }

    fn capture(&mut self, url: &str) -> Result<AttemptOutcome, SessionError> {
        let name = filename::render(
            self.session.filename_template.as_deref(),
            NameFields {
                streamer: &self.session.name,
                room_title: self.session.title.as_deref(),
            },
            Local::now(),
        )?;
        let base = self.config.output_dir.join(&name);
        if let Err(e) = std::fs::create_dir_all(&self.config.output_dir) {
            return Ok(AttemptOutcome::Faulted(anyhow::Error::new(e).context(format!(
                "Cannot create output directory {}",
                self.config.output_dir.display()
            ))));
        }

        let request = CaptureRequest {
            url,
            headers: &self.session.headers,
            output: &base,
            suffix: &self.session.suffix,
            segment: SegmentPolicy::from_config(&self.config, self.backend.kind()),
            extra_args: &self.session.extra_args,
        };

        // A panicking backend ends the attempt, not the session.
        let caught = {
            let mut backend = AttemptGuard::new(self.backend.as_mut());
            std::panic::catch_unwind(AssertUnwindSafe(|| backend.capture(&request)))
        };
        let result = caught.unwrap_or_else(|_| Err(CaptureError::Panicked));

        match &result {
            Ok(r) => info!(
                "{} part: {}",
                r.exit_code,
                provisional_path(&base, &self.session.suffix).display()
            ),
            Err(e) => warn!("Capture of {} ended: {e}", self.session.name),
        }

        if let Err(e) = finalize::finalize(&base, &self.session.suffix) {
            error!("Cannot finalize {}: {e}", base.display());
        }

        match result {
            Ok(r) => Ok(AttemptOutcome::Captured(r)),
            Err(CaptureError::Interrupted) => Err(SessionError::Interrupted),
            Err(e) => Ok(AttemptOutcome::Faulted(e.into())),
        }
    }

    fn is_live(&mut self) -> bool {
        match self.probe.check_stream(&self.session) {
            Ok(live) => live.is_some(),
            Err(e) => {
                warn!("Re-check of {} failed: {e:#}", self.session.name);
                false
            }
        }
    }

    fn pause(&self, duration: Duration) -> Result<(), SessionError> {
        self.sleeper.sleep(duration, &self.shutdown);
        self.check_shutdown()
    }

    fn check_shutdown(&self) -> Result<(), SessionError> {
        if self.shutdown.load(Ordering::Relaxed) {
            info!("Stopping session for {}", self.session.name);
            return Err(SessionError::Interrupted);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use crate::probe::LiveStream;

    /// Answers from a script, then repeats `fallback`.
    struct ScriptedProbe {
        script: VecDeque<bool>,
        fallback: bool,
        calls: Arc<Mutex<u32>>,
    }

    impl ScriptedProbe {
        fn new(script: &[bool], fallback: bool) -> (Self, Arc<Mutex<u32>>) {
            let calls = Arc::new(Mutex::new(0));
            (
                ScriptedProbe {
                    script: script.iter().copied().collect(),
                    fallback,
                    calls: calls.clone(),
                },
                calls,
            )
        }
    }

    impl StreamProbe for ScriptedProbe {
        fn check_stream(&mut self, _: &Session) -> anyhow::Result<Option<LiveStream>> {
            *self.calls.lock().unwrap() += 1;
            let live = self.script.pop_front().unwrap_or(self.fallback);
            Ok(live.then(|| LiveStream {
                raw_url: "http://host/raw.flv".into(),
                title: Some("Evening show".into()),
            }))
        }
    }

    struct FailingProbe;

    impl StreamProbe for FailingProbe {
        fn check_stream(&mut self, _: &Session) -> anyhow::Result<Option<LiveStream>> {
            anyhow::bail!("platform API unreachable")
        }
    }

    #[derive(Default)]
    struct Calls {
        captures: u32,
        closes: u32,
        urls: Vec<String>,
    }

    struct FakeBackend {
        kind: BackendKind,
        exit_code: i32,
        error: bool,
        panic: bool,
        interrupt: bool,
        calls: Arc<Mutex<Calls>>,
    }

    impl FakeBackend {
        fn new(kind: BackendKind, exit_code: i32) -> (Self, Arc<Mutex<Calls>>) {
            let calls = Arc::new(Mutex::new(Calls::default()));
            (
                FakeBackend {
                    kind,
                    exit_code,
                    error: false,
                    panic: false,
                    interrupt: false,
                    calls: calls.clone(),
                },
                calls,
            )
        }
    }

    impl CaptureBackend for FakeBackend {
        fn kind(&self) -> BackendKind {
            self.kind
        }

        fn capture(&mut self, request: &CaptureRequest<'_>) -> Result<CaptureResult, CaptureError> {
            let mut calls = self.calls.lock().unwrap();
            calls.captures += 1;
            calls.urls.push(request.url.to_string());
            if self.panic {
                drop(calls);
                panic!("engine crashed");
            }
            if self.error {
                return Err(CaptureError::Io(std::io::Error::other("disk full")));
            }
            std::fs::write(provisional_path(request.output, request.suffix), b"flv")?;
            if self.interrupt {
                return Err(CaptureError::Interrupted);
            }
            Ok(CaptureResult {
                exit_code: self.exit_code,
                bytes_written: Some(3),
            })
        }

        fn close(&mut self) {
            self.calls.lock().unwrap().closes += 1;
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSleeper {
        pauses: Arc<Mutex<Vec<Duration>>>,
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration, _: &AtomicBool) {
            self.pauses.lock().unwrap().push(duration);
        }
    }

    fn config(dir: &std::path::Path) -> Config {
        Config {
            output_dir: dir.to_path_buf(),
            ..Config::default()
        }
    }

    fn controller(
        config: Config,
        probe: impl StreamProbe + 'static,
        backend: impl CaptureBackend + 'static,
        sleeper: &RecordingSleeper,
    ) -> SessionController {
        let session = Session::new("alice", "http://host/room/1", &config);
        SessionController::new(session, config, Box::new(probe), Box::new(backend))
            .with_sleeper(Box::new(sleeper.clone()))
    }

    #[test]
    fn test_offline_on_first_probe() {
        let dir = tempfile::tempdir().unwrap();
        let (probe, probe_calls) = ScriptedProbe::new(&[], false);
        let (backend, calls) = FakeBackend::new(BackendKind::ProcessMuxer, 0);
        let sleeper = RecordingSleeper::default();

        let summary = controller(config(dir.path()), probe, backend, &sleeper)
            .run()
            .unwrap();

        assert_eq!(summary.probes, 1);
        assert_eq!(summary.attempts, 0);
        assert_eq!(*probe_calls.lock().unwrap(), 1);
        assert_eq!(calls.lock().unwrap().captures, 0);
        assert!(sleeper.pauses.lock().unwrap().is_empty());
        assert_eq!(summary.name, "alice");
        assert_eq!(summary.url, "http://host/room/1");
    }

    #[test]
    fn test_stops_at_attempt_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let (probe, _) = ScriptedProbe::new(&[], true);
        let (backend, calls) = FakeBackend::new(BackendKind::ProcessMuxer, EXIT_KEEP_GOING);
        let sleeper = RecordingSleeper::default();

        let summary = controller(config(dir.path()), probe, backend, &sleeper)
            .run()
            .unwrap();

        assert_eq!(summary.attempts, MAX_ATTEMPTS);
        let calls = calls.lock().unwrap();
        assert_eq!(calls.captures, MAX_ATTEMPTS);
        assert_eq!(calls.closes, MAX_ATTEMPTS);
        let pauses = sleeper.pauses.lock().unwrap();
        assert_eq!(pauses.len(), MAX_ATTEMPTS as usize);
        assert!(pauses.iter().all(|d| *d == COOL_DOWN));
    }

    #[test]
    fn test_native_backend_cools_down() {
        let dir = tempfile::tempdir().unwrap();
        let (probe, _) = ScriptedProbe::new(&[true], false);
        let (backend, _) = FakeBackend::new(BackendKind::NativeEngine, 0);
        let sleeper = RecordingSleeper::default();

        let summary = controller(config(dir.path()), probe, backend, &sleeper)
            .run()
            .unwrap();

        assert_eq!(summary.attempts, 1);
        assert_eq!(*sleeper.pauses.lock().unwrap(), vec![Duration::from_secs(45)]);
    }

    #[test]
    fn test_native_backend_keep_going_cools_down() {
        let dir = tempfile::tempdir().unwrap();
        let (probe, _) = ScriptedProbe::new(&[true], false);
        let (backend, calls) = FakeBackend::new(BackendKind::NativeEngine, EXIT_KEEP_GOING);
        let sleeper = RecordingSleeper::default();

        let summary = controller(config(dir.path()), probe, backend, &sleeper)
            .run()
            .unwrap();

        // Both cool-down conditions hold; the pause is still taken once.
        assert_eq!(summary.attempts, 1);
        assert_eq!(calls.lock().unwrap().captures, 1);
        assert_eq!(*sleeper.pauses.lock().unwrap(), vec![Duration::from_secs(45)]);
    }

    #[test]
    fn test_muxer_clean_exit_has_no_pause() {
        let dir = tempfile::tempdir().unwrap();
        let (probe, _) = ScriptedProbe::new(&[true, true], false);
        let (backend, _) = FakeBackend::new(BackendKind::ProcessMuxer, 0);
        let sleeper = RecordingSleeper::default();

        let summary = controller(config(dir.path()), probe, backend, &sleeper)
            .run()
            .unwrap();

        assert_eq!(summary.attempts, 2);
        assert!(sleeper.pauses.lock().unwrap().is_empty());
    }

    #[test]
    fn test_three_captures_then_stream_ends() {
        let dir = tempfile::tempdir().unwrap();
        let (probe, probe_calls) = ScriptedProbe::new(&[true, true, true], false);
        let (backend, calls) = FakeBackend::new(BackendKind::ProcessMuxer, 0);
        let sleeper = RecordingSleeper::default();

        let summary = controller(config(dir.path()), probe, backend, &sleeper)
            .run()
            .unwrap();

        assert_eq!(summary.attempts, 3);
        assert_eq!(summary.probes, 4);
        assert_eq!(*probe_calls.lock().unwrap(), 4);
        assert_eq!(summary.title.as_deref(), Some("Evening show"));
        let calls = calls.lock().unwrap();
        assert_eq!(calls.captures, 3);
        assert!(calls.urls.iter().all(|u| u == "http://host/raw.flv"));

        // Every attempt's provisional file was promoted.
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|x| x == "part"))
            .count();
        assert_eq!(leftovers, 0);
        assert!(dir.path().read_dir().unwrap().count() >= 1);
    }

    #[test]
    fn test_delay_recheck_resumes_when_stream_returns() {
        let dir = tempfile::tempdir().unwrap();
        // live, offline, back after delay, live, offline, still offline.
        let (probe, _) = ScriptedProbe::new(&[true, false, true, true, false, false], false);
        let (backend, calls) = FakeBackend::new(BackendKind::ProcessMuxer, 0);
        let sleeper = RecordingSleeper::default();
        let config = Config {
            delay: Some(60),
            ..config(dir.path())
        };

        let summary = controller(config, probe, backend, &sleeper).run().unwrap();

        assert_eq!(summary.attempts, 2);
        assert_eq!(calls.lock().unwrap().captures, 2);
        assert_eq!(
            *sleeper.pauses.lock().unwrap(),
            vec![
                Duration::from_secs(60),
                GRACE,
                Duration::from_secs(60),
            ]
        );
    }

    #[test]
    fn test_capture_errors_count_as_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let (probe, _) = ScriptedProbe::new(&[], true);
        let (mut backend, calls) = FakeBackend::new(BackendKind::ProcessMuxer, 0);
        backend.error = true;
        let sleeper = RecordingSleeper::default();

        let summary = controller(config(dir.path()), probe, backend, &sleeper)
            .run()
            .unwrap();

        assert_eq!(summary.attempts, MAX_ATTEMPTS);
        assert_eq!(calls.lock().unwrap().closes, MAX_ATTEMPTS);
    }

    #[test]
    fn test_backend_panic_ends_attempt_only() {
        let dir = tempfile::tempdir().unwrap();
        let (probe, _) = ScriptedProbe::new(&[true, true], false);
        let (mut backend, calls) = FakeBackend::new(BackendKind::ProcessMuxer, 0);
        backend.panic = true;
        let sleeper = RecordingSleeper::default();

        let summary = controller(config(dir.path()), probe, backend, &sleeper)
            .run()
            .unwrap();

        assert_eq!(summary.attempts, 2);
        let calls = calls.lock().unwrap();
        assert_eq!(calls.captures, 2);
        assert_eq!(calls.closes, 2);
    }

    #[test]
    fn test_probe_errors_do_not_end_session() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, calls) = FakeBackend::new(BackendKind::ProcessMuxer, 0);
        let sleeper = RecordingSleeper::default();

        let summary = controller(config(dir.path()), FailingProbe, backend, &sleeper)
            .run()
            .unwrap();

        assert_eq!(summary.attempts, MAX_ATTEMPTS);
        assert_eq!(calls.lock().unwrap().captures, 0);
    }

    #[test]
    fn test_invalid_filename_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (probe, _) = ScriptedProbe::new(&[], true);
        let (backend, calls) = FakeBackend::new(BackendKind::ProcessMuxer, 0);
        let sleeper = RecordingSleeper::default();
        let config = Config {
            filename_prefix: Some("??".into()),
            ..config(dir.path())
        };

        let err = controller(config, probe, backend, &sleeper).run().unwrap_err();
        assert!(matches!(err, SessionError::InvalidFilename(_)));
        assert_eq!(calls.lock().unwrap().captures, 0);
    }

    #[test]
    fn test_shutdown_interrupts_session() {
        let dir = tempfile::tempdir().unwrap();
        let (probe, _) = ScriptedProbe::new(&[], true);
        let (backend, _) = FakeBackend::new(BackendKind::NativeEngine, 0);
        let sleeper = RecordingSleeper::default();
        let shutdown = Arc::new(AtomicBool::new(true));

        let err = controller(config(dir.path()), probe, backend, &sleeper)
            .with_shutdown(shutdown)
            .run()
            .unwrap_err();
        assert!(matches!(err, SessionError::Interrupted));
    }

    #[test]
    fn test_interrupt_during_capture_finalizes_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let (probe, probe_calls) = ScriptedProbe::new(&[], true);
        let (mut backend, calls) = FakeBackend::new(BackendKind::ProcessMuxer, 0);
        backend.interrupt = true;
        let sleeper = RecordingSleeper::default();

        let err = controller(config(dir.path()), probe, backend, &sleeper)
            .run()
            .unwrap_err();
        assert!(matches!(err, SessionError::Interrupted));

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].ends_with(".flv"), "{names:?}");

        let calls = calls.lock().unwrap();
        assert_eq!(calls.captures, 1);
        assert_eq!(calls.closes, 1);
        assert_eq!(*probe_calls.lock().unwrap(), 1);
        assert!(sleeper.pauses.lock().unwrap().is_empty());
    }

    #[test]
    fn test_raw_url_cleared_after_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let (probe, _) = ScriptedProbe::new(&[true], false);
        let (backend, _) = FakeBackend::new(BackendKind::ProcessMuxer, 0);
        let sleeper = RecordingSleeper::default();
        let mut controller = controller(config(dir.path()), probe, backend, &sleeper);

        let outcome = controller.attempt().unwrap();
        assert!(matches!(outcome, AttemptOutcome::Captured(_)));
        assert!(controller.session().raw_stream_url.is_none());
    }

    #[test]
    fn test_thread_sleeper_stops_on_shutdown() {
        let shutdown = AtomicBool::new(true);
        let start = Instant::now();
        ThreadSleeper.sleep(Duration::from_secs(30), &shutdown);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_controller_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<SessionController>();
    }
}
