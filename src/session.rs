//! Device session state machine.
//!
//! A [`DeviceSession`] owns at most one backend handle and only forwards a
//! call to it when the call is valid in the current [`SessionState`]. Invalid
//! calls fail with [`DeviceError::CallOrderViolation`] before reaching the
//! device and leave the state untouched. A failed device call moves the
//! session to [`SessionState::Error`]; [`DeviceSession::teardown`] recovers
//! from any state.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::backend::{
    keys, AccessMode, BackendError, DeviceBackend, DeviceDescriptor, DeviceHandle, FrameInfo,
    TransportKind,
};
use crate::error::{AcquireError, DeviceError, Remediation, TeardownError};
use crate::pixel::PixelType;

/// Lifecycle state of a [`DeviceSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No handle.
    Uninitialized,
    /// Handle created, device not opened.
    HandleCreated,
    /// Device opened, not streaming.
    Opened,
    /// Acquisition engine running.
    Streaming,
    /// Device closed, handle still held.
    Closed,
    /// A device call failed; tear down before reuse.
    Error,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "Uninitialized",
            Self::HandleCreated => "HandleCreated",
            Self::Opened => "Opened",
            Self::Streaming => "Streaming",
            Self::Closed => "Closed",
            Self::Error => "Error",
        };
        f.write_str(name)
    }
}

/// Session operations, named in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// [`DeviceSession::create_handle`]
    CreateHandle,
    /// [`DeviceSession::open`]
    Open,
    /// [`DeviceSession::start_streaming`]
    StartStreaming,
    /// [`DeviceSession::stop_streaming`]
    StopStreaming,
    /// [`DeviceSession::close`]
    Close,
    /// [`DeviceSession::destroy_handle`]
    DestroyHandle,
    /// Frame acquisition.
    Acquire,
    /// [`DeviceSession::camera_info`]
    CameraInfo,
}

impl Operation {
    /// State the operation must be called from.
    pub const fn required_state(self) -> &'static [SessionState] {
        match self {
            Self::CreateHandle => &[SessionState::Uninitialized],
            Self::Open => &[SessionState::HandleCreated],
            Self::StartStreaming | Self::Close => &[SessionState::Opened],
            Self::StopStreaming | Self::Acquire => &[SessionState::Streaming],
            Self::DestroyHandle => &[SessionState::Closed],
            Self::CameraInfo => &[SessionState::Opened, SessionState::Streaming],
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CreateHandle => "create_handle",
            Self::Open => "open",
            Self::StartStreaming => "start_streaming",
            Self::StopStreaming => "stop_streaming",
            Self::Close => "close",
            Self::DestroyHandle => "destroy_handle",
            Self::Acquire => "acquire",
            Self::CameraInfo => "camera_info",
        };
        f.write_str(name)
    }
}

/// Snapshot of basic device parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraInfo {
    /// Output width, if readable.
    pub width: Option<i64>,
    /// Output height, if readable.
    pub height: Option<i64>,
    /// Current pixel type, if readable.
    pub pixel_type: Option<PixelType>,
    /// Acquisition frame rate in Hz, if readable.
    pub frame_rate: Option<f64>,
}

/// Owns one device handle and enforces the connect/stream order.
pub struct DeviceSession<B: DeviceBackend> {
    backend: Arc<B>,
    state: SessionState,
    descriptor: Option<DeviceDescriptor>,
    handle: Option<B::Handle>,
    opened: bool,
    streaming: bool,
}

impl<B: DeviceBackend> fmt::Debug for DeviceSession<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("backend", &self.backend.name())
            .field("state", &self.state)
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

impl<B: DeviceBackend> DeviceSession<B> {
    /// An `Uninitialized` session on `backend`.
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            state: SessionState::Uninitialized,
            descriptor: None,
            handle: None,
            opened: false,
            streaming: false,
        }
    }

    /// Current state.
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Device the live handle is bound to.
    pub const fn descriptor(&self) -> Option<&DeviceDescriptor> {
        self.descriptor.as_ref()
    }

    fn check(&self, attempted: Operation) -> Result<(), DeviceError> {
        if attempted.required_state().contains(&self.state) {
            Ok(())
        } else {
            warn!(%attempted, state = %self.state, "rejected out-of-order device call");
            Err(DeviceError::CallOrderViolation {
                attempted,
                state: self.state,
            })
        }
    }

    fn transport(&self) -> TransportKind {
        self.descriptor
            .as_ref()
            .map_or(TransportKind::Usb, |d| d.transport)
    }

    fn map_error(&self, operation: Operation, err: BackendError) -> DeviceError {
        match (operation, err) {
            (Operation::CreateHandle | Operation::Open, BackendError::AccessDenied) => {
                DeviceError::PermissionDenied {
                    operation,
                    remediation: Remediation::for_transport(self.transport()),
                }
            }
            (_, BackendError::CallOrder) => DeviceError::CallOrderViolation {
                attempted: operation,
                state: self.state,
            },
            (Operation::CreateHandle, _) => DeviceError::HandleCreateFailed(err),
            (Operation::Open, _) => DeviceError::OpenFailed(err),
            _ => DeviceError::OperationFailed {
                operation,
                source: err,
            },
        }
    }

    fn fail(&mut self, operation: Operation, err: BackendError) -> DeviceError {
        let mapped = self.map_error(operation, err);
        warn!(%operation, state = %self.state, error = %mapped, "device call failed");
        self.state = SessionState::Error;
        mapped
    }

    fn handle_mut(&mut self, operation: Operation) -> Result<&mut B::Handle, DeviceError> {
        let state = self.state;
        self.handle
            .as_mut()
            .ok_or(DeviceError::CallOrderViolation {
                attempted: operation,
                state,
            })
    }

    /// `Uninitialized → HandleCreated`.
    pub fn create_handle(&mut self, descriptor: &DeviceDescriptor) -> Result<(), DeviceError> {
        self.check(Operation::CreateHandle)?;
        self.descriptor = Some(descriptor.clone());
        match self.backend.create_handle(descriptor) {
            Ok(handle) => {
                self.handle = Some(handle);
                self.state = SessionState::HandleCreated;
                info!(device = %descriptor, backend = self.backend.name(), "device handle created");
                Ok(())
            }
            Err(err) => Err(self.fail(Operation::CreateHandle, err)),
        }
    }

    /// `HandleCreated → Opened`.
    ///
    /// GigE devices also get the optimal packet size; every device gets
    /// `TriggerMode = Off`. Failures of those two writes are only logged.
    pub fn open(&mut self, access: AccessMode) -> Result<(), DeviceError> {
        self.check(Operation::Open)?;
        let transport = self.transport();
        let handle = self.handle_mut(Operation::Open)?;

        if let Err(err) = handle.open(access) {
            return Err(self.fail(Operation::Open, err));
        }

        if transport == TransportKind::GigE {
            match handle.optimal_packet_size() {
                Ok(size) if size > 0 => {
                    if let Err(err) = handle.set_int_value(keys::PACKET_SIZE, i64::from(size)) {
                        warn!(size, error = %err, "failed to set packet size");
                    } else {
                        debug!(size, "negotiated packet size");
                    }
                }
                Ok(_) => warn!("device reported no optimal packet size"),
                Err(err) => warn!(error = %err, "failed to query optimal packet size"),
            }
        }
        if let Err(err) = handle.set_enum_value(keys::TRIGGER_MODE, keys::TRIGGER_MODE_OFF) {
            warn!(error = %err, "failed to disable trigger mode");
        }

        self.opened = true;
        self.state = SessionState::Opened;
        info!(?access, "device opened");
        Ok(())
    }

    /// `Opened → Streaming`.
    pub fn start_streaming(&mut self) -> Result<(), DeviceError> {
        self.check(Operation::StartStreaming)?;
        if let Err(err) = self.handle_mut(Operation::StartStreaming)?.start_streaming() {
            return Err(self.fail(Operation::StartStreaming, err));
        }
        self.streaming = true;
        self.state = SessionState::Streaming;
        info!("streaming started");
        Ok(())
    }

    /// `Streaming → Opened`.
    pub fn stop_streaming(&mut self) -> Result<(), DeviceError> {
        self.check(Operation::StopStreaming)?;
        if let Err(err) = self.handle_mut(Operation::StopStreaming)?.stop_streaming() {
            return Err(self.fail(Operation::StopStreaming, err));
        }
        self.streaming = false;
        self.state = SessionState::Opened;
        info!("streaming stopped");
        Ok(())
    }

    /// `Opened → Closed`.
    pub fn close(&mut self) -> Result<(), DeviceError> {
        self.check(Operation::Close)?;
        if let Err(err) = self.handle_mut(Operation::Close)?.close() {
            return Err(self.fail(Operation::Close, err));
        }
        self.opened = false;
        self.state = SessionState::Closed;
        info!("device closed");
        Ok(())
    }

    /// `Closed → Uninitialized`. The session can be reused afterwards.
    pub fn destroy_handle(&mut self) -> Result<(), DeviceError> {
        self.check(Operation::DestroyHandle)?;
        let handle = self.handle.take().ok_or(DeviceError::CallOrderViolation {
            attempted: Operation::DestroyHandle,
            state: self.state,
        })?;
        if let Err(err) = handle.destroy() {
            self.descriptor = None;
            return Err(self.fail(Operation::DestroyHandle, err));
        }
        self.descriptor = None;
        self.state = SessionState::Uninitialized;
        info!("device handle destroyed");
        Ok(())
    }

    /// Create, open and start streaming, failing on the first error.
    pub fn connect(&mut self, descriptor: &DeviceDescriptor, access: AccessMode) -> Result<(), DeviceError> {
        self.create_handle(descriptor)?;
        self.open(access)?;
        self.start_streaming()
    }

    /// Release every live resource in the fixed order
    /// `stop_streaming → close → destroy_handle`.
    ///
    /// Valid from any state. Every step runs even if an earlier one failed;
    /// the session always ends `Uninitialized`.
    pub fn teardown(&mut self) -> Result<(), TeardownError> {
        let mut errors = Vec::new();

        if self.streaming {
            if let Some(Err(err)) = self.handle.as_mut().map(DeviceHandle::stop_streaming) {
                errors.push(self.map_error(Operation::StopStreaming, err));
            }
            self.streaming = false;
        }
        if self.opened {
            if let Some(Err(err)) = self.handle.as_mut().map(DeviceHandle::close) {
                errors.push(self.map_error(Operation::Close, err));
            }
            self.opened = false;
        }
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.destroy() {
                errors.push(self.map_error(Operation::DestroyHandle, err));
            }
        }

        let had_device = self.descriptor.take().is_some();
        self.state = SessionState::Uninitialized;

        if errors.is_empty() {
            if had_device {
                info!("session torn down");
            }
            Ok(())
        } else {
            warn!(count = errors.len(), "session teardown finished with errors");
            Err(TeardownError { errors })
        }
    }

    /// Read width, height, pixel format and frame rate.
    ///
    /// Unreadable features are `None`; this never changes the state.
    pub fn camera_info(&mut self) -> Result<CameraInfo, DeviceError> {
        self.check(Operation::CameraInfo)?;
        let handle = self.handle_mut(Operation::CameraInfo)?;
        Ok(CameraInfo {
            width: handle.get_int_value(keys::WIDTH).ok(),
            height: handle.get_int_value(keys::HEIGHT).ok(),
            pixel_type: handle.get_enum_value(keys::PIXEL_FORMAT).ok().map(PixelType),
            frame_rate: handle.get_float_value(keys::FRAME_RATE).ok(),
        })
    }

    /// Pull one raw frame into `buf`. Only valid while `Streaming`.
    pub(crate) fn grab(&mut self, buf: &mut Vec<u8>, timeout: Duration) -> Result<FrameInfo, AcquireError> {
        self.check(Operation::Acquire)?;
        match self.handle_mut(Operation::Acquire)?.get_one_frame_timeout(buf, timeout) {
            Ok(info) if info.frame_len == 0 => Err(AcquireError::NoData),
            Ok(info) => Ok(info),
            Err(BackendError::Timeout) => Err(AcquireError::Timeout(timeout)),
            Err(BackendError::NoData | BackendError::AbnormalImage) => Err(AcquireError::NoData),
            Err(err) => Err(self.fail(Operation::Acquire, err).into()),
        }
    }

    /// Convert a non-canonical frame through the device's converter.
    pub(crate) fn convert(&mut self, info: &FrameInfo, src: &[u8], dst: &mut [u8]) -> Result<(), AcquireError> {
        self.check(Operation::Acquire)?;
        self.handle_mut(Operation::Acquire)?
            .convert_pixel_type(info, src, dst)
            .map_err(|err| AcquireError::ConversionFailed {
                pixel_type: info.pixel_type,
                width: info.width,
                height: info.height,
                reason: err.to_string(),
            })
    }
}

impl<B: DeviceBackend> Drop for DeviceSession<B> {
    fn drop(&mut self) {
        if self.handle.is_some() {
            if let Err(err) = self.teardown() {
                warn!(error = %err, "teardown on drop reported errors");
            }
        }
    }
}
