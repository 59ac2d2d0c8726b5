//! cam-session: camera session control and capture pipeline.
//!
//! The crate drives GigE/USB industrial cameras (and V4L2 devices) through an
//! explicit session state machine, normalizes every frame to packed BGR, and
//! runs single, continuous and recording capture modes that share one device
//! safely.
//!
//! Device access sits behind the [`backend::DeviceBackend`] trait, enabling
//! both production use with real hardware and testing with the in-memory
//! [`backend::fake::FakeBackend`].

pub mod acquirer;
pub mod backend;
pub mod calibration;
pub mod cancel;
pub mod capture;
pub mod config;
pub mod error;
pub mod output;
pub mod pixel;
pub mod registry;
pub mod session;
pub mod validation;
pub mod video;

pub use acquirer::{Frame, FrameAcquirer};
pub use backend::{AccessMode, DeviceBackend, DeviceDescriptor, TransportKind};
pub use calibration::{CalibrationParameters, CalibrationProvider, JsonCalibrationProvider};
pub use cancel::CancellationToken;
pub use capture::{
    CaptureController, ContinuousSpec, ControllerStatus, JobKind, JobSnapshot, JobStatus, JobSummary,
    RecordingSpec, ShutdownReport,
};
pub use config::AppConfig;
pub use error::{AcquireError, CalibrationError, ConfigError, DeviceError, Error, JobError, OutputError};
pub use registry::{ConnectOptions, DeviceRegistry};
pub use session::{CameraInfo, DeviceSession, SessionState};
