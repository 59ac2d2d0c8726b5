//! Capture modes: single stills, continuous capture and video recording.
//!
//! One [`CaptureController`] owns the acquirer behind a mutex. Continuous
//! capture and recording each run on a named worker thread and may run at the
//! same time; every acquisition is serialized through the mutex, which is held
//! only while the device is read, never while encoding or writing.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use tracing::{debug, error, info, warn};

use crate::acquirer::{self, Frame, FrameAcquirer};
use crate::backend::DeviceBackend;
use crate::calibration::CalibrationParameters;
use crate::cancel::CancellationToken;
use crate::config::{ContinuousConfig, RecordingConfig};
use crate::error::{AcquireError, DeviceError, JobError, OutputError};
use crate::output;
use crate::pixel::FourCC;
use crate::session::{CameraInfo, SessionState};
use crate::video::VideoRecorder;

/// Back-off after a transient miss while recording.
const RECORDING_RETRY: Duration = Duration::from_millis(10);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Kind of capture job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// One synchronous still.
    Single,
    /// Periodic stills into a directory.
    Continuous,
    /// Paced frames into a video file.
    Recording,
}

impl JobKind {
    const fn thread_name(self) -> &'static str {
        match self {
            Self::Single => "single-capture",
            Self::Continuous => "continuous-capture",
            Self::Recording => "video-recording",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Single => "single",
            Self::Continuous => "continuous",
            Self::Recording => "recording",
        })
    }
}

/// Lifecycle of a background job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobStatus {
    /// No worker running.
    #[default]
    Idle,
    /// Worker running.
    Running,
    /// Stop requested, worker finishing.
    Stopping,
}

/// Point-in-time view of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSnapshot {
    /// Job kind.
    pub kind: JobKind,
    /// Current status.
    pub status: JobStatus,
    /// Images or video frames written by the current or last run.
    pub frames_written: u64,
    /// Acquisitions that timed out or returned no data.
    pub misses: u64,
    /// Output directory or file.
    pub target: Option<PathBuf>,
    /// When the current or last run started.
    pub started_at: Option<DateTime<Local>>,
    /// Error that ended the last run, if any.
    pub last_error: Option<String>,
}

impl JobSnapshot {
    const fn idle(kind: JobKind) -> Self {
        Self {
            kind,
            status: JobStatus::Idle,
            frames_written: 0,
            misses: 0,
            target: None,
            started_at: None,
            last_error: None,
        }
    }
}

/// Result of a finished job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSummary {
    /// Job kind.
    pub kind: JobKind,
    /// Images or video frames written.
    pub frames_written: u64,
    /// Transient misses tolerated.
    pub misses: u64,
    /// Wall time between start and stop.
    pub elapsed: Duration,
    /// Output directory or file.
    pub target: Option<PathBuf>,
    /// Error that ended the run early.
    pub error: Option<String>,
}

/// Parameters for continuous capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuousSpec {
    /// Output directory, created if missing.
    pub directory: PathBuf,
    /// Delay between captures.
    pub interval: Duration,
    /// Image extension (`jpg`, `png`, ...).
    pub format: String,
    /// Stop on its own after this many images.
    pub max_count: Option<u64>,
}

impl From<&ContinuousConfig> for ContinuousSpec {
    fn from(config: &ContinuousConfig) -> Self {
        Self {
            directory: config.directory.clone(),
            interval: config.interval,
            format: config.format.clone(),
            max_count: config.max_count,
        }
    }
}

/// Parameters for video recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingSpec {
    /// Output video file.
    pub path: PathBuf,
    /// Frames per second, also the pacing rate.
    pub fps: u32,
    /// Codec FourCC handed to the encoder.
    pub codec: String,
}

impl From<&RecordingConfig> for RecordingSpec {
    fn from(config: &RecordingConfig) -> Self {
        Self {
            path: config.path.clone(),
            fps: config.fps,
            codec: config.codec.clone(),
        }
    }
}

/// Controller-wide status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerStatus {
    /// Session state of the bound device.
    pub session_state: SessionState,
    /// Continuous capture job.
    pub continuous: JobSnapshot,
    /// Recording job.
    pub recording: JobSnapshot,
    /// Whether calibration is bound.
    pub calibrated: bool,
}

/// What [`CaptureController::shutdown`] did.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Jobs that were stopped or reaped.
    pub jobs: Vec<JobSummary>,
    /// Teardown steps that failed.
    pub teardown_errors: Vec<DeviceError>,
}

impl ShutdownReport {
    /// True when no job failed and teardown was clean.
    pub fn is_clean(&self) -> bool {
        self.teardown_errors.is_empty() && self.jobs.iter().all(|j| j.error.is_none())
    }
}

#[derive(Debug)]
struct JobSlot {
    kind: JobKind,
    state: Arc<Mutex<JobSnapshot>>,
    token: Option<CancellationToken>,
    worker: Option<JoinHandle<()>>,
}

impl JobSlot {
    fn new(kind: JobKind) -> Self {
        Self {
            kind,
            state: Arc::new(Mutex::new(JobSnapshot::idle(kind))),
            token: None,
            worker: None,
        }
    }

    fn snapshot(&self) -> JobSnapshot {
        lock(&self.state).clone()
    }

    fn join(&mut self) {
        self.token = None;
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                let mut state = lock(&self.state);
                state.status = JobStatus::Idle;
                state.last_error = Some("worker panicked".to_owned());
                error!(job = %self.kind, "worker panicked");
            }
        }
    }

    fn summary(&self) -> JobSummary {
        let state = lock(&self.state);
        let elapsed = state
            .started_at
            .and_then(|t| (Local::now() - t).to_std().ok())
            .unwrap_or_default();
        JobSummary {
            kind: self.kind,
            frames_written: state.frames_written,
            misses: state.misses,
            elapsed,
            target: state.target.clone(),
            error: state.last_error.clone(),
        }
    }

    /// Mark running and reset counters. Joins a worker that already finished.
    fn begin(&mut self, target: PathBuf) -> Result<(), JobError> {
        if lock(&self.state).status != JobStatus::Idle {
            return Err(JobError::AlreadyRunning(self.kind));
        }
        self.join();
        let mut state = lock(&self.state);
        *state = JobSnapshot {
            status: JobStatus::Running,
            target: Some(target),
            started_at: Some(Local::now()),
            ..JobSnapshot::idle(self.kind)
        };
        Ok(())
    }

    fn spawn<F>(&mut self, root: &CancellationToken, body: F) -> Result<(), JobError>
    where
        F: FnOnce(CancellationToken, Arc<Mutex<JobSnapshot>>) -> Result<(), JobError> + Send + 'static,
    {
        let token = root.child_token();
        let worker_token = token.clone();
        let state = Arc::clone(&self.state);
        let kind = self.kind;
        let spawned = thread::Builder::new()
            .name(kind.thread_name().to_owned())
            .spawn(move || {
                let result = body(worker_token, Arc::clone(&state));
                let mut snapshot = lock(&state);
                if let Err(err) = result {
                    error!(job = %kind, error = %err, "job ended with error");
                    snapshot.last_error = Some(err.to_string());
                }
                snapshot.status = JobStatus::Idle;
                info!(job = %kind, frames = snapshot.frames_written, misses = snapshot.misses, "job finished");
            });
        match spawned {
            Ok(worker) => {
                self.token = Some(token);
                self.worker = Some(worker);
                Ok(())
            }
            Err(source) => {
                lock(&self.state).status = JobStatus::Idle;
                Err(JobError::Spawn { kind, source })
            }
        }
    }

    fn stop(&mut self) -> Result<JobSummary, JobError> {
        {
            let mut state = lock(&self.state);
            if state.status != JobStatus::Running {
                drop(state);
                self.join();
                return Err(JobError::NotRunning(self.kind));
            }
            state.status = JobStatus::Stopping;
        }
        info!(job = %self.kind, "stopping");
        if let Some(token) = &self.token {
            token.cancel();
        }
        self.join();
        lock(&self.state).status = JobStatus::Idle;
        Ok(self.summary())
    }

    /// Stop if running, otherwise reap a finished worker. `None` if the slot never ran.
    fn shutdown(&mut self) -> Option<JobSummary> {
        match self.stop() {
            Ok(summary) => Some(summary),
            Err(_) => {
                let started = lock(&self.state).started_at.is_some();
                started.then(|| self.summary())
            }
        }
    }
}

fn bump(state: &Mutex<JobSnapshot>, written: u64, misses: u64) -> u64 {
    let mut s = lock(state);
    s.frames_written += written;
    s.misses += misses;
    s.frames_written
}

/// Acquire through a held guard, then undistort after releasing it.
fn acquire_locked<B: DeviceBackend>(
    mut guard: MutexGuard<'_, FrameAcquirer<B>>,
    timeout: Duration,
    calibrate: bool,
) -> Result<Frame, AcquireError> {
    let frame = guard.acquire(timeout)?;
    let undistorter = guard.undistorter().filter(|_| calibrate);
    drop(guard);
    Ok(acquirer::apply(undistorter.as_deref(), frame))
}

fn acquire_frame<B: DeviceBackend>(
    acquirer: &Mutex<FrameAcquirer<B>>,
    timeout: Duration,
    calibrate: bool,
) -> Result<Frame, AcquireError> {
    acquire_locked(lock(acquirer), timeout, calibrate)
}

/// Calibrated acquisition for a worker. `None` if `token` was cancelled while
/// waiting for the lock, in which case the device is not read.
fn acquire_job_frame<B: DeviceBackend>(
    acquirer: &Mutex<FrameAcquirer<B>>,
    timeout: Duration,
    token: &CancellationToken,
) -> Result<Option<Frame>, AcquireError> {
    let guard = lock(acquirer);
    if token.is_cancelled() {
        return Ok(None);
    }
    acquire_locked(guard, timeout, true).map(Some)
}

/// Drives capture jobs against one streaming session.
pub struct CaptureController<B: DeviceBackend> {
    acquirer: Arc<Mutex<FrameAcquirer<B>>>,
    root: CancellationToken,
    acquire_timeout: Duration,
    continuous: JobSlot,
    recording: JobSlot,
    shut_down: bool,
}

impl<B: DeviceBackend> fmt::Debug for CaptureController<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureController")
            .field("acquire_timeout", &self.acquire_timeout)
            .field("continuous", &self.continuous.snapshot())
            .field("recording", &self.recording.snapshot())
            .field("shut_down", &self.shut_down)
            .finish_non_exhaustive()
    }
}

impl<B: DeviceBackend> CaptureController<B> {
    /// Controller over `acquirer`. Jobs get child tokens of `root`.
    pub fn new(acquirer: FrameAcquirer<B>, root: CancellationToken, acquire_timeout: Duration) -> Self {
        Self {
            acquirer: Arc::new(Mutex::new(acquirer)),
            root,
            acquire_timeout,
            continuous: JobSlot::new(JobKind::Continuous),
            recording: JobSlot::new(JobKind::Recording),
            shut_down: false,
        }
    }

    fn slot_mut(&mut self, kind: JobKind) -> Option<&mut JobSlot> {
        match kind {
            JobKind::Single => None,
            JobKind::Continuous => Some(&mut self.continuous),
            JobKind::Recording => Some(&mut self.recording),
        }
    }

    /// Acquire one frame, undistorted when `calibrate` and calibration is bound.
    pub fn capture_frame(&self, calibrate: bool) -> Result<Frame, JobError> {
        Ok(acquire_frame(&self.acquirer, self.acquire_timeout, calibrate)?)
    }

    /// Acquire, undistort and write one still to `path`.
    pub fn capture_single(&self, path: &Path) -> Result<PathBuf, JobError> {
        output::format_for(path)?;
        let frame = self.capture_frame(true)?;
        let written = output::write_image(&frame, path)?;
        info!(path = %written.display(), sequence = frame.sequence, "image captured");
        Ok(written)
    }

    /// Start writing stills into `spec.directory` every `spec.interval`.
    pub fn start_continuous(&mut self, spec: ContinuousSpec) -> Result<(), JobError> {
        let kind = JobKind::Continuous;
        let sample = spec.directory.join("capture").with_extension(&spec.format);
        output::format_for(&sample).map_err(|e| JobError::InvalidSpec {
            kind,
            reason: e.to_string(),
        })?;
        if spec.max_count == Some(0) {
            return Err(JobError::InvalidSpec {
                kind,
                reason: "max_count must be at least 1".to_owned(),
            });
        }
        if lock(&self.continuous.state).status != JobStatus::Idle {
            return Err(JobError::AlreadyRunning(kind));
        }
        std::fs::create_dir_all(&spec.directory).map_err(|source| OutputError::Io {
            path: spec.directory.clone(),
            source,
        })?;

        self.continuous.begin(spec.directory.clone())?;
        info!(
            directory = %spec.directory.display(),
            interval = ?spec.interval,
            format = %spec.format,
            max_count = ?spec.max_count,
            "continuous capture started"
        );
        let acquirer = Arc::clone(&self.acquirer);
        let timeout = self.acquire_timeout;
        self.continuous
            .spawn(&self.root, move |token, state| run_continuous(&acquirer, &spec, timeout, &token, &state))
    }

    /// Start recording paced frames into `spec.path`.
    pub fn start_recording(&mut self, spec: RecordingSpec) -> Result<(), JobError> {
        let kind = JobKind::Recording;
        if spec.fps == 0 {
            return Err(JobError::InvalidSpec {
                kind,
                reason: "fps must be at least 1".to_owned(),
            });
        }
        if FourCC::parse(&spec.codec).is_none() {
            return Err(JobError::InvalidSpec {
                kind,
                reason: format!("`{}` is not a FourCC", spec.codec),
            });
        }
        self.recording.begin(spec.path.clone())?;
        info!(path = %spec.path.display(), fps = spec.fps, codec = %spec.codec, "recording requested");
        let acquirer = Arc::clone(&self.acquirer);
        let timeout = self.acquire_timeout;
        self.recording
            .spawn(&self.root, move |token, state| run_recording(&acquirer, &spec, timeout, &token, &state))
    }

    /// Stop a background job and wait for its worker.
    pub fn stop(&mut self, kind: JobKind) -> Result<JobSummary, JobError> {
        let slot = self.slot_mut(kind).ok_or(JobError::NotRunning(kind))?;
        let summary = slot.stop()?;
        info!(job = %kind, frames = summary.frames_written, elapsed = ?summary.elapsed, "job stopped");
        Ok(summary)
    }

    /// Snapshot of one job.
    pub fn job(&self, kind: JobKind) -> JobSnapshot {
        match kind {
            JobKind::Continuous => self.continuous.snapshot(),
            JobKind::Recording => self.recording.snapshot(),
            JobKind::Single => JobSnapshot::idle(kind),
        }
    }

    /// Session state, job snapshots and calibration binding.
    pub fn status(&self) -> ControllerStatus {
        let (session_state, calibrated) = {
            let acquirer = lock(&self.acquirer);
            (acquirer.session().state(), acquirer.has_calibration())
        };
        ControllerStatus {
            session_state,
            continuous: self.continuous.snapshot(),
            recording: self.recording.snapshot(),
            calibrated,
        }
    }

    /// Replace or clear calibration for subsequent frames.
    pub fn set_calibration(&self, calibration: Option<Arc<CalibrationParameters>>) {
        lock(&self.acquirer).set_calibration(calibration);
    }

    /// Read device features from the bound session.
    pub fn camera_info(&self) -> Result<CameraInfo, DeviceError> {
        lock(&self.acquirer).session_mut().camera_info()
    }

    /// Cancel every job, join the workers and tear down the session.
    ///
    /// Safe to call more than once; later calls report nothing.
    pub fn shutdown(&mut self) -> ShutdownReport {
        if self.shut_down {
            return ShutdownReport::default();
        }
        self.shut_down = true;
        info!("shutting down capture controller");
        self.root.cancel();

        let jobs = [&mut self.continuous, &mut self.recording]
            .into_iter()
            .filter_map(JobSlot::shutdown)
            .collect();
        let teardown_errors = match lock(&self.acquirer).session_mut().teardown() {
            Ok(()) => Vec::new(),
            Err(err) => {
                warn!(error = %err, "teardown reported errors");
                err.errors
            }
        };
        ShutdownReport { jobs, teardown_errors }
    }
}

impl<B: DeviceBackend> Drop for CaptureController<B> {
    fn drop(&mut self) {
        if !self.shut_down {
            let report = self.shutdown();
            if !report.is_clean() {
                warn!(?report, "shutdown on drop was not clean");
            }
        }
    }
}

fn run_continuous<B: DeviceBackend>(
    acquirer: &Mutex<FrameAcquirer<B>>,
    spec: &ContinuousSpec,
    timeout: Duration,
    token: &CancellationToken,
    state: &Mutex<JobSnapshot>,
) -> Result<(), JobError> {
    let mut sequence: u64 = 0;
    loop {
        if token.is_cancelled() {
            return Ok(());
        }
        if spec.max_count.is_some_and(|max| sequence >= max) {
            info!(count = sequence, "continuous capture reached max_count");
            return Ok(());
        }

        match acquire_job_frame(acquirer, timeout, token) {
            Ok(None) => return Ok(()),
            Ok(Some(frame)) => {
                let name = format!(
                    "capture_{}_{sequence}.{}",
                    frame.timestamp.format("%Y%m%d_%H%M%S_%3f"),
                    spec.format
                );
                let path = output::write_image(&frame, &spec.directory.join(name))?;
                sequence += 1;
                let written = bump(state, 1, 0);
                info!(count = written, path = %path.display(), "continuous capture");
                if spec.max_count.is_some_and(|max| sequence >= max) {
                    continue;
                }
            }
            Err(err) if err.is_transient() => {
                bump(state, 0, 1);
                warn!(error = %err, "continuous capture missed a frame");
            }
            Err(err) => return Err(err.into()),
        }

        if token.sleep(spec.interval) {
            return Ok(());
        }
    }
}

fn run_recording<B: DeviceBackend>(
    acquirer: &Mutex<FrameAcquirer<B>>,
    spec: &RecordingSpec,
    timeout: Duration,
    token: &CancellationToken,
    state: &Mutex<JobSnapshot>,
) -> Result<(), JobError> {
    // The first frame fixes the output size; it is not written.
    let first = loop {
        if token.is_cancelled() {
            return Ok(());
        }
        match acquire_job_frame(acquirer, timeout, token) {
            Ok(None) => return Ok(()),
            Ok(Some(frame)) => break frame,
            Err(err) if err.is_transient() => {
                bump(state, 0, 1);
                if token.sleep(RECORDING_RETRY) {
                    return Ok(());
                }
            }
            Err(err) => return Err(err.into()),
        }
    };

    let mut writer = match VideoRecorder::create(&spec.path, first.width, first.height, spec.fps, &spec.codec) {
        Ok(writer) => writer,
        Err(OutputError::UnsupportedCodec { codec, .. }) => {
            return Err(JobError::InvalidSpec {
                kind: JobKind::Recording,
                reason: format!("codec `{codec}` rejected by the encoder"),
            });
        }
        Err(err) => return Err(err.into()),
    };
    let period = Duration::from_secs(1) / spec.fps;
    let mut deadline = Instant::now();

    let result = loop {
        if token.is_cancelled() {
            break Ok(());
        }
        match acquire_job_frame(acquirer, timeout, token) {
            Ok(None) => break Ok(()),
            Ok(Some(frame)) => {
                if let Err(err) = writer.write_frame(&frame) {
                    break Err(JobError::from(err));
                }
                bump(state, 1, 0);
            }
            Err(err) if err.is_transient() => {
                bump(state, 0, 1);
                debug!(error = %err, "recording missed a frame");
                if token.sleep(RECORDING_RETRY) {
                    break Ok(());
                }
                continue;
            }
            Err(err) => break Err(err.into()),
        }

        deadline += period;
        let now = Instant::now();
        if let Some(wait) = deadline.checked_duration_since(now) {
            if token.sleep(wait) {
                break Ok(());
            }
        } else if now.duration_since(deadline) > period {
            // Fell behind by more than a frame: resynchronize rather than burst.
            deadline = now;
        }
    };

    debug!(path = %spec.path.display(), frames = writer.frames(), "closing video file");
    let finished = writer.finish();
    result?;
    finished?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::{FakeBackend, FakeCall};
    use crate::backend::{AccessMode, BackendError, DeviceBackend};
    use crate::pixel::PixelType;
    use crate::session::DeviceSession;

    const TIMEOUT: Duration = Duration::from_millis(100);

    /// Run `f` on another thread and fail if it does not return in time.
    fn within<T: Send + 'static>(limit: Duration, f: impl FnOnce() -> T + Send + 'static) -> T {
        let (tx, rx) = std::sync::mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(f());
        });
        rx.recv_timeout(limit).expect("call should return without hanging")
    }

    fn wait_idle(controller: &CaptureController<FakeBackend>, kind: JobKind) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while controller.job(kind).status != JobStatus::Idle && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn controller(backend: &FakeBackend) -> CaptureController<FakeBackend> {
        let backend = Arc::new(backend.clone());
        let descriptor = backend
            .enumerate()
            .expect("enumerate should succeed")
            .into_iter()
            .next()
            .expect("fake has a device");
        let mut session = DeviceSession::new(backend);
        session
            .connect(&descriptor, AccessMode::Exclusive)
            .expect("connect should succeed");
        CaptureController::new(FrameAcquirer::new(session), CancellationToken::new(), TIMEOUT)
    }

    fn small_backend() -> FakeBackend {
        FakeBackend::with_default_devices().with_format(32, 24, PixelType::BGR8_PACKED)
    }

    fn continuous(dir: &Path, interval: Duration, max_count: Option<u64>) -> ContinuousSpec {
        ContinuousSpec {
            directory: dir.to_path_buf(),
            interval,
            format: "png".to_owned(),
            max_count,
        }
    }

    #[test]
    fn test_capture_single_writes_file() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let controller = controller(&small_backend());
        let path = dir.path().join("a/b/still.png");
        let written = controller.capture_single(&path).expect("capture should succeed");
        assert_eq!(written, path);
        assert!(path.exists());
    }

    #[test]
    fn test_capture_single_rejects_format_before_acquiring() {
        let backend = small_backend();
        let controller = controller(&backend);
        let err = controller
            .capture_single(Path::new("still.gif"))
            .expect_err("gif is not supported");
        assert!(matches!(err, JobError::Output(_)));
        assert_eq!(backend.calls(FakeCall::GetFrame), 0);
    }

    #[test]
    fn test_second_start_is_already_running() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let mut controller = controller(&small_backend());
        controller
            .start_continuous(continuous(dir.path(), Duration::from_secs(10), None))
            .expect("start should succeed");
        let err = controller
            .start_continuous(continuous(dir.path(), Duration::from_secs(10), None))
            .expect_err("second start must fail");
        assert!(matches!(err, JobError::AlreadyRunning(JobKind::Continuous)));
        controller.stop(JobKind::Continuous).expect("stop should succeed");
    }

    #[test]
    fn test_stop_idle_job_is_not_running() {
        let mut controller = controller(&small_backend());
        let err = controller.stop(JobKind::Recording).expect_err("nothing is running");
        assert!(matches!(err, JobError::NotRunning(JobKind::Recording)));
        let err = controller.stop(JobKind::Single).expect_err("single has no worker");
        assert!(matches!(err, JobError::NotRunning(JobKind::Single)));
    }

    #[test]
    fn test_max_count_stops_on_its_own() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let mut controller = controller(&small_backend());
        controller
            .start_continuous(continuous(dir.path(), Duration::from_millis(1), Some(3)))
            .expect("start should succeed");

        let deadline = Instant::now() + Duration::from_secs(5);
        while controller.job(JobKind::Continuous).status != JobStatus::Idle && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let snapshot = controller.job(JobKind::Continuous);
        assert_eq!(snapshot.status, JobStatus::Idle);
        assert_eq!(snapshot.frames_written, 3);
        let files = std::fs::read_dir(dir.path()).expect("dir should exist").count();
        assert_eq!(files, 3);
        assert!(matches!(
            controller.stop(JobKind::Continuous),
            Err(JobError::NotRunning(JobKind::Continuous))
        ));
    }

    #[test]
    fn test_invalid_specs_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let mut controller = controller(&small_backend());
        let mut spec = continuous(dir.path(), Duration::from_millis(1), None);
        spec.format = "gif".to_owned();
        assert!(matches!(
            controller.start_continuous(spec),
            Err(JobError::InvalidSpec { kind: JobKind::Continuous, .. })
        ));
        let err = controller
            .start_recording(RecordingSpec {
                path: dir.path().join("v.avi"),
                fps: 0,
                codec: "MJPG".to_owned(),
            })
            .expect_err("fps 0 is invalid");
        assert!(matches!(err, JobError::InvalidSpec { kind: JobKind::Recording, .. }));
    }

    #[test]
    fn test_fatal_device_error_ends_job_with_snapshot_error() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let backend = small_backend();
        let mut controller = controller(&backend);
        backend.fail_next(FakeCall::GetFrame, BackendError::Resource);
        controller
            .start_continuous(continuous(dir.path(), Duration::from_millis(1), None))
            .expect("start should succeed");

        let deadline = Instant::now() + Duration::from_secs(5);
        while controller.job(JobKind::Continuous).status != JobStatus::Idle && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let snapshot = controller.job(JobKind::Continuous);
        assert_eq!(snapshot.status, JobStatus::Idle);
        assert!(snapshot.last_error.is_some());
        assert_eq!(controller.status().session_state, SessionState::Error);
    }

    #[test]
    fn test_shutdown_tears_down_and_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let backend = small_backend();
        let mut controller = controller(&backend);
        controller
            .start_continuous(continuous(dir.path(), Duration::from_secs(10), None))
            .expect("start should succeed");

        let report = controller.shutdown();
        assert!(report.is_clean());
        assert_eq!(report.jobs.len(), 1);
        assert_eq!(controller.status().session_state, SessionState::Uninitialized);
        assert_eq!(backend.live_handles(), 0);
        assert!(controller.shutdown().jobs.is_empty());
    }

    #[test]
    fn test_shutdown_after_job_finished_on_its_own() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let backend = small_backend();
        let mut controller = controller(&backend);
        controller
            .start_continuous(continuous(dir.path(), Duration::from_millis(1), Some(1)))
            .expect("start should succeed");
        wait_idle(&controller, JobKind::Continuous);
        assert_eq!(controller.job(JobKind::Continuous).status, JobStatus::Idle);

        let report = within(Duration::from_secs(5), move || controller.shutdown());
        assert!(report.is_clean());
        assert_eq!(report.jobs.len(), 1);
        assert_eq!(report.jobs.first().map(|j| j.frames_written), Some(1));
        assert_eq!(backend.live_handles(), 0);
    }

    #[test]
    fn test_drop_after_stop_releases_device() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let backend = small_backend();
        let mut controller = controller(&backend);
        controller
            .start_continuous(continuous(dir.path(), Duration::from_secs(10), None))
            .expect("start should succeed");
        controller.stop(JobKind::Continuous).expect("stop should succeed");

        within(Duration::from_secs(5), move || drop(controller));
        assert_eq!(backend.live_handles(), 0);
    }

    #[test]
    fn test_cancelled_worker_does_not_read_device() {
        let backend = small_backend();
        let controller = controller(&backend);
        let token = CancellationToken::new();
        token.cancel();
        let frame = acquire_job_frame(&controller.acquirer, TIMEOUT, &token).expect("cancellation is not an error");
        assert!(frame.is_none());
        assert_eq!(backend.calls(FakeCall::GetFrame), 0);

        let frame = acquire_job_frame(&controller.acquirer, TIMEOUT, &CancellationToken::new())
            .expect("live token should acquire");
        assert!(frame.is_some());
        assert_eq!(backend.calls(FakeCall::GetFrame), 1);
    }

    #[test]
    fn test_malformed_codec_is_rejected_before_starting() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let backend = small_backend();
        let mut controller = controller(&backend);
        let err = controller
            .start_recording(RecordingSpec {
                path: dir.path().join("v.avi"),
                fps: 10,
                codec: "H.264".to_owned(),
            })
            .expect_err("five characters are not a FourCC");
        assert!(matches!(err, JobError::InvalidSpec { kind: JobKind::Recording, .. }));
        assert_eq!(controller.job(JobKind::Recording).status, JobStatus::Idle);
        assert_eq!(backend.calls(FakeCall::GetFrame), 0);
    }

    #[test]
    fn test_status_reports_calibration() {
        let controller = controller(&small_backend());
        assert!(!controller.status().calibrated);
        controller.set_calibration(Some(Arc::new(CalibrationParameters {
            camera_matrix: [[30.0, 0.0, 16.0], [0.0, 30.0, 12.0], [0.0, 0.0, 1.0]],
            distortion: vec![0.0; 5],
            image_width: 32,
            image_height: 24,
            reprojection_error: 0.0,
        })));
        let status = controller.status();
        assert!(status.calibrated);
        assert_eq!(status.session_state, SessionState::Streaming);
        assert_eq!(status.continuous.status, JobStatus::Idle);
    }
}
