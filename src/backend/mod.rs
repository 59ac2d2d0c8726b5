//! Vendor boundary: device enumeration and the per-device handle.
//!
//! The session layer is the only caller of [`DeviceHandle`] and guarantees
//! calls arrive in a valid order. Implementations report failures with the
//! fixed [`BackendError`] set and never see the core error taxonomy.

pub mod fake;
#[cfg(target_os = "linux")]
pub mod v4l2;

use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use thiserror::Error;

use crate::pixel::PixelType;

/// Well-known GenICam feature names.
pub mod keys {
    /// GigE stream channel packet size.
    pub const PACKET_SIZE: &str = "GevSCPSPacketSize";
    /// Hardware trigger mode.
    pub const TRIGGER_MODE: &str = "TriggerMode";
    /// Sensor output width.
    pub const WIDTH: &str = "Width";
    /// Sensor output height.
    pub const HEIGHT: &str = "Height";
    /// Pixel format code.
    pub const PIXEL_FORMAT: &str = "PixelFormat";
    /// Acquisition frame rate in Hz.
    pub const FRAME_RATE: &str = "AcquisitionFrameRate";

    /// `TriggerMode` value for free-running acquisition.
    pub const TRIGGER_MODE_OFF: u32 = 0;
}

/// Physical transport of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// GigE Vision over Ethernet.
    GigE,
    /// USB (USB3 Vision or UVC).
    Usb,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GigE => f.write_str("GigE"),
            Self::Usb => f.write_str("USB"),
        }
    }
}

/// Immutable description of a discovered device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Transport the device was found on.
    pub transport: TransportKind,
    /// User-defined or model name.
    pub name: String,
    /// Current IP address, GigE only.
    pub ip: Option<Ipv4Addr>,
    /// Backend-assigned enumeration index.
    pub index: u32,
}

impl DeviceDescriptor {
    /// Descriptor for a GigE device.
    pub fn gige(index: u32, name: impl Into<String>, ip: Ipv4Addr) -> Self {
        Self {
            transport: TransportKind::GigE,
            name: name.into(),
            ip: Some(ip),
            index,
        }
    }

    /// Descriptor for a USB device.
    pub fn usb(index: u32, name: impl Into<String>) -> Self {
        Self {
            transport: TransportKind::Usb,
            name: name.into(),
            ip: None,
            index,
        }
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} device: {}", self.index, self.transport, self.name)?;
        if let Some(ip) = self.ip {
            write!(f, " ({ip})")?;
        }
        Ok(())
    }
}

/// Access mode requested when opening a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    /// No other application may open the device.
    #[default]
    Exclusive,
    /// Control access; other applications may monitor.
    Control,
    /// Read-only monitoring.
    Monitor,
}

/// Metadata returned with each raw frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameInfo {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Device pixel type of the raw bytes.
    pub pixel_type: PixelType,
    /// Number of valid bytes written to the transfer buffer.
    pub frame_len: usize,
    /// Device frame counter.
    pub frame_number: u64,
}

/// Error codes reported by a device backend.
///
/// Mirrors the vendor SDK status codes, plus `Timeout` for backends that
/// distinguish a poll timeout from an empty frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum BackendError {
    #[error("invalid or stale handle")]
    Handle,
    #[error("operation not supported")]
    Support,
    #[error("buffer full")]
    BufferFull,
    #[error("function called in wrong order")]
    CallOrder,
    #[error("invalid parameter")]
    Parameter,
    #[error("resource allocation failed")]
    Resource,
    #[error("no data")]
    NoData,
    #[error("precondition failed or environment changed")]
    Precondition,
    #[error("version mismatch")]
    Version,
    #[error("buffer too small")]
    BufferTooSmall,
    #[error("abnormal image, likely packet loss")]
    AbnormalImage,
    #[error("failed to load runtime library")]
    LoadLibrary,
    #[error("no output buffer")]
    NoOutputBuffer,
    #[error("encryption error")]
    Encrypt,
    #[error("failed to open file")]
    OpenFile,
    #[error("unknown error")]
    Unknown,
    #[error("access denied")]
    AccessDenied,
    #[error("timed out")]
    Timeout,
}

impl BackendError {
    const CODES: [(u32, Self); 17] = [
        (0x8000_0001, Self::Handle),
        (0x8000_0002, Self::Support),
        (0x8000_0003, Self::BufferFull),
        (0x8000_0004, Self::CallOrder),
        (0x8000_0005, Self::Parameter),
        (0x8000_0006, Self::Resource),
        (0x8000_0007, Self::NoData),
        (0x8000_0008, Self::Precondition),
        (0x8000_0009, Self::Version),
        (0x8000_000A, Self::BufferTooSmall),
        (0x8000_000B, Self::AbnormalImage),
        (0x8000_000C, Self::LoadLibrary),
        (0x8000_000D, Self::NoOutputBuffer),
        (0x8000_000E, Self::Encrypt),
        (0x8000_000F, Self::OpenFile),
        (0x8000_0010, Self::Unknown),
        (0x8000_0011, Self::AccessDenied),
    ];

    /// Map a raw vendor status code. Unrecognised codes become `Unknown`.
    pub fn from_code(code: u32) -> Self {
        Self::CODES
            .iter()
            .find(|(c, _)| *c == code)
            .map_or(Self::Unknown, |(_, e)| *e)
    }

    /// Raw vendor status code, if this error has one.
    pub fn code(self) -> Option<u32> {
        Self::CODES.iter().find(|(_, e)| *e == self).map(|(c, _)| *c)
    }
}

/// Result type for backend operations.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// One opened-or-openable device.
///
/// Only one acquisition may be in flight per handle; callers serialize.
pub trait DeviceHandle: Send + 'static {
    /// Open the device.
    fn open(&mut self, access: AccessMode) -> BackendResult<()>;

    /// Close the device, keeping the handle.
    fn close(&mut self) -> BackendResult<()>;

    /// Release the handle.
    fn destroy(self) -> BackendResult<()>
    where
        Self: Sized;

    /// Optimal GigE packet size in bytes.
    fn optimal_packet_size(&mut self) -> BackendResult<u32>;

    /// Write an integer feature.
    fn set_int_value(&mut self, key: &str, value: i64) -> BackendResult<()>;

    /// Write an enumeration feature.
    fn set_enum_value(&mut self, key: &str, value: u32) -> BackendResult<()>;

    /// Read an integer feature.
    fn get_int_value(&mut self, key: &str) -> BackendResult<i64>;

    /// Read an enumeration feature.
    fn get_enum_value(&mut self, key: &str) -> BackendResult<u32>;

    /// Read a float feature.
    fn get_float_value(&mut self, key: &str) -> BackendResult<f64>;

    /// Start the acquisition engine.
    fn start_streaming(&mut self) -> BackendResult<()>;

    /// Stop the acquisition engine.
    fn stop_streaming(&mut self) -> BackendResult<()>;

    /// Wait up to `timeout` for one frame, writing its bytes into `buf`.
    fn get_one_frame_timeout(&mut self, buf: &mut Vec<u8>, timeout: Duration) -> BackendResult<FrameInfo>;

    /// Convert `src` described by `info` into packed BGR in `dst`.
    ///
    /// `dst` is exactly `width * height * 3` bytes.
    fn convert_pixel_type(&mut self, info: &FrameInfo, src: &[u8], dst: &mut [u8]) -> BackendResult<()>;
}

/// Entry point to a device transport.
pub trait DeviceBackend: Send + Sync + 'static {
    /// Handle type produced by [`DeviceBackend::create_handle`].
    type Handle: DeviceHandle;

    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// List reachable devices.
    fn enumerate(&self) -> BackendResult<Vec<DeviceDescriptor>>;

    /// Create a handle bound to `descriptor`.
    fn create_handle(&self, descriptor: &DeviceDescriptor) -> BackendResult<Self::Handle>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vendor_code_round_trip() {
        assert_eq!(BackendError::from_code(0x8000_0004), BackendError::CallOrder);
        assert_eq!(BackendError::from_code(0x8000_0011), BackendError::AccessDenied);
        assert_eq!(BackendError::AccessDenied.code(), Some(0x8000_0011));
        assert_eq!(BackendError::from_code(0x1234), BackendError::Unknown);
        assert_eq!(BackendError::Timeout.code(), None);
    }

    #[test]
    fn test_descriptor_display() {
        let gige = DeviceDescriptor::gige(0, "Line A", Ipv4Addr::new(192, 168, 0, 1));
        assert_eq!(gige.to_string(), "[0] GigE device: Line A (192.168.0.1)");
        let usb = DeviceDescriptor::usb(2, "Bench");
        assert_eq!(usb.to_string(), "[2] USB device: Bench");
    }
}
