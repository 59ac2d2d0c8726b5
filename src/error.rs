//! Error taxonomy for device sessions, acquisition, capture jobs and calibration.
//!
//! Each layer owns one `thiserror` enum. [`Error`] aggregates them for callers
//! that drive the whole stack (the binary, integration tests).

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::backend::{BackendError, TransportKind};
use crate::capture::JobKind;
use crate::pixel::PixelType;
use crate::session::{Operation, SessionState};

/// Convenience alias for results using the aggregate error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable guidance attached to [`DeviceError::PermissionDenied`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remediation {
    /// Unix group the current user must belong to.
    pub group: &'static str,
    /// Ordered steps that usually resolve the denial.
    pub steps: Vec<String>,
}

impl Remediation {
    /// Guidance for the given transport.
    pub fn for_transport(transport: TransportKind) -> Self {
        match transport {
            TransportKind::Usb => Self {
                group: "plugdev",
                steps: vec![
                    "add the user to the plugdev group: sudo usermod -a -G plugdev $USER".to_owned(),
                    "install a udev rule granting the group access to the camera".to_owned(),
                    "unplug and replug the camera, then log in again".to_owned(),
                ],
            },
            TransportKind::GigE => Self {
                group: "netdev",
                steps: vec![
                    "make sure no other process holds the camera in exclusive mode".to_owned(),
                    "check the camera and host NIC are on the same subnet".to_owned(),
                    "add the user to the netdev group or grant CAP_NET_RAW".to_owned(),
                ],
            },
        }
    }
}

impl fmt::Display for Remediation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "requires membership in `{}`", self.group)?;
        for (i, step) in self.steps.iter().enumerate() {
            write!(f, "; {}. {step}", i + 1)?;
        }
        Ok(())
    }
}

/// Errors raised by device discovery and the session state machine.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no device at index {index} ({available} available)")]
    NotFound { index: u32, available: usize },

    #[error("device enumeration failed: {0}")]
    EnumerationFailed(#[source] BackendError),

    #[error("failed to create device handle: {0}")]
    HandleCreateFailed(#[source] BackendError),

    #[error("failed to open device: {0}")]
    OpenFailed(#[source] BackendError),

    #[error("permission denied during {operation}: {remediation}")]
    PermissionDenied {
        operation: Operation,
        remediation: Remediation,
    },

    #[error("call order violation: `{attempted}` is not valid in state {state}")]
    CallOrderViolation {
        attempted: Operation,
        state: SessionState,
    },

    #[error("{operation} failed: {source}")]
    OperationFailed {
        operation: Operation,
        #[source]
        source: BackendError,
    },
}

/// Errors raised while pulling and normalizing a single frame.
#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("no frame within {0:?}")]
    Timeout(Duration),

    #[error("device returned no frame data")]
    NoData,

    #[error("cannot convert {width}x{height} {pixel_type} frame to BGR: {reason}")]
    ConversionFailed {
        pixel_type: PixelType,
        width: u32,
        height: u32,
        reason: String,
    },

    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl AcquireError {
    /// Timeouts and empty frames are tolerated inside capture loops.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::NoData)
    }
}

/// Errors raised while encoding or writing output artifacts.
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("unsupported output format for {0}")]
    UnsupportedFormat(PathBuf),

    #[error("failed to encode {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("codec `{codec}` is not available for {path}")]
    UnsupportedCodec { codec: String, path: PathBuf },

    #[error("video error on {path}: {source}")]
    Video {
        path: PathBuf,
        #[source]
        source: opencv::Error,
    },

    #[error("frame is {actual:?} but writer expects {expected:?}")]
    DimensionMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },
}

/// Errors raised by the capture mode controller.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("{0} job is already running")]
    AlreadyRunning(JobKind),

    #[error("{0} job is not running")]
    NotRunning(JobKind),

    #[error("invalid {kind} job: {reason}")]
    InvalidSpec { kind: JobKind, reason: String },

    #[error(transparent)]
    Acquire(#[from] AcquireError),

    #[error(transparent)]
    Output(#[from] OutputError),

    #[error("failed to spawn {kind} worker: {source}")]
    Spawn {
        kind: JobKind,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by calibration providers.
#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("unsupported calibration file {0} (expected .json)")]
    UnsupportedFormat(PathBuf),

    #[error("failed to parse calibration {path}: {reason}")]
    ParseFailed { path: PathBuf, reason: String },

    #[error("failed to read calibration {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Every teardown step that failed, in the order they ran.
#[derive(Debug, Error)]
#[error("teardown finished with {} error(s): {}", errors.len(), join_errors(errors))]
pub struct TeardownError {
    /// Collected step failures.
    pub errors: Vec<DeviceError>,
}

fn join_errors(errors: &[DeviceError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Aggregate error for callers driving the full stack.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Acquire(#[from] AcquireError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    #[error(transparent)]
    Output(#[from] OutputError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Teardown(#[from] TeardownError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remediation_display_lists_steps() {
        let text = Remediation::for_transport(TransportKind::Usb).to_string();
        assert!(text.starts_with("requires membership in `plugdev`"));
        assert!(text.contains("1. add the user"));
        assert!(text.contains("3. unplug"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(AcquireError::Timeout(Duration::from_millis(5)).is_transient());
        assert!(AcquireError::NoData.is_transient());
        let fatal = AcquireError::ConversionFailed {
            pixel_type: PixelType::MONO8,
            width: 1,
            height: 1,
            reason: "short".to_owned(),
        };
        assert!(!fatal.is_transient());
    }

    #[test]
    fn test_teardown_error_joins_messages() {
        let err = TeardownError {
            errors: vec![
                DeviceError::OperationFailed {
                    operation: Operation::StopStreaming,
                    source: BackendError::Handle,
                },
                DeviceError::OperationFailed {
                    operation: Operation::Close,
                    source: BackendError::Resource,
                },
            ],
        };
        let text = err.to_string();
        assert!(text.starts_with("teardown finished with 2 error(s)"));
        assert!(text.contains("stop_streaming"));
        assert!(text.contains("close"));
    }
}
