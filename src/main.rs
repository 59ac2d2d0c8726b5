//! cam-session binary: discover devices and run capture jobs from the shell.

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cam_session::backend::fake::FakeBackend;
use cam_session::calibration::{CalibrationProvider, JsonCalibrationProvider};
use cam_session::{
    AppConfig, CancellationToken, CaptureController, ConnectOptions, ContinuousSpec, DeviceBackend,
    DeviceRegistry, FrameAcquirer, JobKind, JobStatus, RecordingSpec,
};
use clap::{Parser, Subcommand};
use humantime_serde::re::humantime;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How often a waiting foreground command checks its job.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Camera session control and capture.
#[derive(Debug, Parser)]
#[command(author, version, about = "Camera session control and capture")]
struct Args {
    /// TOML configuration file. Defaults are used if omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use the in-memory fake backend instead of hardware.
    #[arg(long, global = true)]
    fake: bool,

    /// Device index from `discover`.
    #[arg(long, short, global = true, default_value_t = 0)]
    device: u32,

    /// JSON calibration file; overrides the config.
    #[arg(long, global = true)]
    calibration: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List reachable devices.
    Discover,

    /// Capture one still image.
    Capture {
        /// Output image (.jpg, .png, .bmp, .tif).
        #[arg(default_value = "capture.jpg")]
        output: PathBuf,
    },

    /// Capture stills periodically until Ctrl-C, `--duration` or `--max-count`.
    Continuous {
        /// Output directory.
        #[arg(long)]
        directory: Option<PathBuf>,

        /// Delay between captures, e.g. `500ms`.
        #[arg(long, value_parser = humantime::parse_duration)]
        interval: Option<Duration>,

        /// Image extension.
        #[arg(long)]
        format: Option<String>,

        /// Stop after this many images.
        #[arg(long)]
        max_count: Option<u64>,

        /// Stop after this long, e.g. `30s`.
        #[arg(long, value_parser = humantime::parse_duration)]
        duration: Option<Duration>,
    },

    /// Record a video until Ctrl-C or `--duration`.
    Record {
        /// Output file.
        #[arg(long)]
        output: Option<PathBuf>,

        /// Frames per second.
        #[arg(long)]
        fps: Option<u32>,

        /// Codec FourCC passed to the encoder, e.g. XVID or MJPG.
        #[arg(long)]
        codec: Option<String>,

        /// Stop after this long, e.g. `10s`.
        #[arg(long, value_parser = humantime::parse_duration)]
        duration: Option<Duration>,
    },
}

fn main() {
    if let Err(err) = try_main() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let root = CancellationToken::new();
    let handler_token = root.clone();
    ctrlc::set_handler(move || {
        info!("interrupt received, stopping");
        handler_token.cancel();
    })?;

    if args.fake {
        return run(FakeBackend::with_default_devices(), &args, &config, &root);
    }
    hardware(&args, &config, &root)
}

#[cfg(target_os = "linux")]
fn hardware(args: &Args, config: &AppConfig, root: &CancellationToken) -> Result<(), Box<dyn Error>> {
    let backend = cam_session::backend::v4l2::V4l2Backend::new(&config.backend);
    run(backend, args, config, root)
}

#[cfg(not(target_os = "linux"))]
fn hardware(_args: &Args, _config: &AppConfig, _root: &CancellationToken) -> Result<(), Box<dyn Error>> {
    Err("no hardware backend on this platform; use --fake".into())
}

fn run<B: DeviceBackend>(
    backend: B,
    args: &Args,
    config: &AppConfig,
    root: &CancellationToken,
) -> Result<(), Box<dyn Error>> {
    let registry = DeviceRegistry::new(Arc::new(backend));

    if matches!(args.command, Command::Discover) {
        let devices = registry.discover()?;
        if devices.is_empty() {
            println!("No devices found");
        }
        for device in devices {
            println!("{device}");
        }
        return Ok(());
    }

    let options = ConnectOptions {
        access: config.session.access_mode(),
        retry: config.session.retry.clone(),
    };
    let mut acquirer = FrameAcquirer::new(registry.connect(args.device, &options)?);
    if let Some(path) = args.calibration.as_ref().or(config.calibration.as_ref()) {
        let params = JsonCalibrationProvider.load(path)?;
        info!(path = %path.display(), error = params.reprojection_error, "calibration loaded");
        acquirer.set_calibration(Some(Arc::new(params)));
    }

    let mut controller = CaptureController::new(acquirer, root.clone(), config.acquisition.timeout);
    match controller.camera_info() {
        Ok(camera) => info!(?camera, "camera ready"),
        Err(err) => warn!(error = %err, "could not read camera info"),
    }

    let outcome = command(&mut controller, &args.command, config, root);
    let report = controller.shutdown();
    for job in &report.jobs {
        println!(
            "{}: {} frame(s), {} miss(es) in {:.1}s{}",
            job.kind,
            job.frames_written,
            job.misses,
            job.elapsed.as_secs_f64(),
            job.error.as_deref().map(|e| format!(" (error: {e})")).unwrap_or_default()
        );
    }
    outcome?;
    if !report.is_clean() {
        return Err(format!("shutdown was not clean: {:?}", report.teardown_errors).into());
    }
    Ok(())
}

fn command<B: DeviceBackend>(
    controller: &mut CaptureController<B>,
    command: &Command,
    config: &AppConfig,
    root: &CancellationToken,
) -> Result<(), Box<dyn Error>> {
    match command {
        Command::Discover => Ok(()),
        Command::Capture { output } => {
            let path = controller.capture_single(output)?;
            println!("Saved {}", path.display());
            Ok(())
        }
        Command::Continuous {
            directory,
            interval,
            format,
            max_count,
            duration,
        } => {
            let mut spec = ContinuousSpec::from(&config.continuous);
            if let Some(directory) = directory {
                spec.directory.clone_from(directory);
            }
            if let Some(interval) = interval {
                spec.interval = *interval;
            }
            if let Some(format) = format {
                spec.format.clone_from(format);
            }
            spec.max_count = max_count.or(spec.max_count);
            controller.start_continuous(spec)?;
            wait(controller, JobKind::Continuous, *duration, root);
            Ok(())
        }
        Command::Record {
            output,
            fps,
            codec,
            duration,
        } => {
            let mut spec = RecordingSpec::from(&config.recording);
            if let Some(output) = output {
                spec.path.clone_from(output);
            }
            spec.fps = fps.unwrap_or(spec.fps);
            if let Some(codec) = codec {
                spec.codec.clone_from(codec);
            }
            let path = spec.path.clone();
            controller.start_recording(spec)?;
            wait(controller, JobKind::Recording, *duration, root);
            println!("Recorded {}", path.display());
            Ok(())
        }
    }
}

/// Block until `root` is cancelled, `duration` elapses or the job ends on its own.
fn wait<B: DeviceBackend>(
    controller: &CaptureController<B>,
    kind: JobKind,
    duration: Option<Duration>,
    root: &CancellationToken,
) {
    let deadline = duration.map(|d| Instant::now() + d);
    loop {
        if root.sleep(POLL_INTERVAL) {
            return;
        }
        if controller.job(kind).status == JobStatus::Idle {
            return;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            info!(job = %kind, "duration elapsed");
            return;
        }
    }
}
