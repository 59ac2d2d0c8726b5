//! Application configuration.
//!
//! Everything the process needs is carried in [`AppConfig`] and passed
//! explicitly to constructors; the library never reads or writes process
//! environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::AccessMode;
use crate::error::ConfigError;

/// Top-level configuration, usually loaded from TOML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    /// Backend construction parameters.
    pub backend: BackendConfig,
    /// Session and connect behaviour.
    pub session: SessionConfig,
    /// Frame acquisition parameters.
    pub acquisition: AcquisitionConfig,
    /// Defaults for continuous capture.
    pub continuous: ContinuousConfig,
    /// Defaults for video recording.
    pub recording: RecordingConfig,
    /// Calibration file to bind at startup.
    pub calibration: Option<PathBuf>,
    /// Log filter settings.
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Parse and validate TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that parse but cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend.buffer_count == 0 {
            return Err(invalid("backend.buffer_count", "must be at least 1"));
        }
        if self.session.retry.attempts == 0 {
            return Err(invalid("session.retry.attempts", "must be at least 1"));
        }
        if !(self.session.retry.multiplier >= 1.0) {
            return Err(invalid("session.retry.multiplier", "must be >= 1.0"));
        }
        if self.acquisition.timeout.is_zero() {
            return Err(invalid("acquisition.timeout", "must be non-zero"));
        }
        if self.recording.fps == 0 {
            return Err(invalid("recording.fps", "must be at least 1"));
        }
        if self.recording.codec.is_empty() || self.recording.codec.len() > 4 {
            return Err(invalid("recording.codec", "must be a 1-4 character FourCC"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_owned(),
    }
}

/// Backend construction parameters.
///
/// Replaces ambient SDK discovery through environment variables: vendor
/// backends receive the runtime location here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendConfig {
    /// Vendor SDK install root (e.g. `/opt/MVS`).
    pub sdk_root: Option<PathBuf>,
    /// Extra directories to search for runtime libraries.
    pub library_paths: Vec<PathBuf>,
    /// Number of driver-side frame buffers.
    pub buffer_count: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            sdk_root: None,
            library_paths: Vec::new(),
            buffer_count: 4,
        }
    }
}

impl BackendConfig {
    /// Runtime library directories in search order: explicit paths first,
    /// then the architecture-specific directories under `sdk_root`.
    pub fn search_paths(&self) -> Vec<PathBuf> {
        let mut paths = self.library_paths.clone();
        if let Some(root) = &self.sdk_root {
            let lib = root.join("lib");
            match std::env::consts::ARCH {
                "aarch64" => paths.push(lib.join("aarch64")),
                "x86" | "arm" => paths.push(lib.join("32")),
                _ => paths.push(lib.join("64")),
            }
            paths.push(lib);
        }
        paths
    }
}

/// Session and connect behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Open with exclusive access.
    pub exclusive: bool,
    /// Retry policy for handle creation and open.
    pub retry: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            exclusive: true,
            retry: RetryPolicy::default(),
        }
    }
}

impl SessionConfig {
    /// Access mode implied by `exclusive`.
    pub const fn access_mode(&self) -> AccessMode {
        if self.exclusive {
            AccessMode::Exclusive
        } else {
            AccessMode::Control
        }
    }
}

/// Explicit retry schedule for transient connect failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Delay before the second attempt.
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Growth factor applied per attempt.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(500),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// No retries.
    pub const fn once() -> Self {
        Self {
            attempts: 1,
            initial_backoff: Duration::ZERO,
            multiplier: 1.0,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exp);
        Duration::try_from_secs_f64(scaled)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Frame acquisition parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AcquisitionConfig {
    /// Maximum wait for a single frame.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(1000),
        }
    }
}

/// Defaults for continuous capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContinuousConfig {
    /// Output directory.
    pub directory: PathBuf,
    /// Delay between captures.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Image file extension.
    pub format: String,
    /// Stop after this many images.
    pub max_count: Option<u64>,
}

impl Default for ContinuousConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("continuous_capture"),
            interval: Duration::from_secs(1),
            format: "jpg".to_owned(),
            max_count: None,
        }
    }
}

/// Defaults for video recording.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecordingConfig {
    /// Output file.
    pub path: PathBuf,
    /// Frames per second.
    pub fps: u32,
    /// Container codec FourCC.
    pub codec: String,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("video.avi"),
            fps: 30,
            codec: "XVID".to_owned(),
        }
    }
}

/// Log filter settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_owned(),
        }
    }
}
