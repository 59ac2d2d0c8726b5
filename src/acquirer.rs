//! Frame acquisition and pixel normalization.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use tracing::{debug, info};

use crate::backend::DeviceBackend;
use crate::calibration::{CalibrationParameters, Undistorter};
use crate::error::AcquireError;
use crate::pixel::{self, PixelType};
use crate::session::DeviceSession;

/// A captured frame in canonical interleaved BGR.
///
/// `data` is always `width * height * 3` bytes and owned by the frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Packed BGR bytes, row-major.
    pub data: Vec<u8>,
    /// Acquisition sequence number on this acquirer, starting at 0.
    pub sequence: u64,
    /// Wall-clock time the frame was returned by the device.
    pub timestamp: DateTime<Local>,
}

impl Frame {
    /// Get the RGB value at pixel coordinates (x, y).
    ///
    /// Returns `None` if coordinates are out of bounds.
    pub fn pixel_at(&self, x: u32, y: u32) -> Option<(u8, u8, u8)> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = ((y as usize) * (self.width as usize) + (x as usize)) * 3;
        match self.data.get(offset..offset + 3)? {
            &[b, g, r] => Some((r, g, b)),
            _ => None,
        }
    }

    /// Number of bytes a canonical frame of this size holds.
    pub fn expected_len(&self) -> Option<usize> {
        pixel::bgr_len(self.width, self.height)
    }
}

/// Pulls frames from a streaming session and normalizes them to BGR.
#[derive(Debug)]
pub struct FrameAcquirer<B: DeviceBackend> {
    session: DeviceSession<B>,
    undistorter: Option<Arc<Undistorter>>,
    raw: Vec<u8>,
    sequence: u64,
}

impl<B: DeviceBackend> FrameAcquirer<B> {
    /// Acquirer over `session`, with no calibration bound.
    pub fn new(session: DeviceSession<B>) -> Self {
        Self {
            session,
            undistorter: None,
            raw: Vec::new(),
            sequence: 0,
        }
    }

    /// Acquirer with `calibration` bound from the start.
    pub fn with_calibration(session: DeviceSession<B>, calibration: Arc<CalibrationParameters>) -> Self {
        let mut acquirer = Self::new(session);
        acquirer.set_calibration(Some(calibration));
        acquirer
    }

    /// The underlying session.
    pub const fn session(&self) -> &DeviceSession<B> {
        &self.session
    }

    /// Mutable access to the underlying session (teardown, camera info).
    pub fn session_mut(&mut self) -> &mut DeviceSession<B> {
        &mut self.session
    }

    /// Replace or clear the bound calibration.
    pub fn set_calibration(&mut self, calibration: Option<Arc<CalibrationParameters>>) {
        if calibration.is_some() {
            info!("calibration bound");
        } else if self.undistorter.is_some() {
            info!("calibration cleared");
        }
        self.undistorter = calibration.map(|params| Arc::new(Undistorter::new(params)));
    }

    /// Whether calibration is bound.
    pub const fn has_calibration(&self) -> bool {
        self.undistorter.is_some()
    }

    /// The bound undistorter, for applying calibration outside a lock.
    pub fn undistorter(&self) -> Option<Arc<Undistorter>> {
        self.undistorter.clone()
    }

    /// Acquire one frame and normalize it to BGR.
    ///
    /// Fails with `CallOrderViolation` without touching the device unless the
    /// session is streaming.
    pub fn acquire(&mut self, timeout: Duration) -> Result<Frame, AcquireError> {
        let info = self.session.grab(&mut self.raw, timeout)?;
        let (width, height) = (info.width, info.height);
        let raw = self.raw.get(..info.frame_len.min(self.raw.len())).unwrap_or_default();

        let data = match info.pixel_type {
            PixelType::MONO8 => pixel::mono8_to_bgr(raw, width, height)?,
            PixelType::RGB8_PACKED => pixel::rgb8_to_bgr(raw, width, height)?,
            PixelType::BGR8_PACKED => {
                let mut owned = std::mem::take(&mut self.raw);
                owned.truncate(info.frame_len);
                pixel::bgr8_passthrough(owned, width, height)?
            }
            other => {
                let len = pixel::bgr_len(width, height).ok_or_else(|| AcquireError::ConversionFailed {
                    pixel_type: other,
                    width,
                    height,
                    reason: "size overflow".to_owned(),
                })?;
                let mut out = vec![0u8; len];
                let src = std::mem::take(&mut self.raw);
                let converted = self
                    .session
                    .convert(&info, src.get(..info.frame_len).unwrap_or(&src), &mut out);
                self.raw = src;
                converted?;
                out
            }
        };

        let frame = Frame {
            width,
            height,
            data,
            sequence: self.sequence,
            timestamp: Local::now(),
        };
        self.sequence += 1;
        debug!(
            sequence = frame.sequence,
            frame_number = info.frame_number,
            width,
            height,
            pixel_type = %info.pixel_type,
            "frame acquired"
        );
        Ok(frame)
    }

    /// Undistort `frame` with the bound calibration; identity when none is bound.
    pub fn apply_calibration(&self, frame: Frame) -> Frame {
        apply(self.undistorter.as_deref(), frame)
    }
}

/// Undistort `frame` with `undistorter`, if any.
pub(crate) fn apply(undistorter: Option<&Undistorter>, frame: Frame) -> Frame {
    match undistorter {
        Some(u) => u.undistort(&frame),
        None => frame,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::{FakeBackend, FakeCall, TestPattern};
    use crate::backend::{AccessMode, BackendError, DeviceBackend};
    use crate::error::DeviceError;
    use crate::session::{Operation, SessionState};

    const TIMEOUT: Duration = Duration::from_millis(100);

    fn streaming(backend: &FakeBackend) -> FrameAcquirer<FakeBackend> {
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
        FrameAcquirer::new(session)
    }

    #[test]
    fn test_acquire_bgr_frame_has_canonical_size() {
        let backend = FakeBackend::with_default_devices().with_format(64, 48, PixelType::BGR8_PACKED);
        let mut acquirer = streaming(&backend);
        let frame = acquirer.acquire(TIMEOUT).expect("acquire should succeed");
        assert_eq!((frame.width, frame.height), (64, 48));
        assert_eq!(frame.data.len(), 64 * 48 * 3);
        assert_eq!(frame.sequence, 0);
        assert_eq!(acquirer.acquire(TIMEOUT).expect("second acquire").sequence, 1);
    }

    #[test]
    fn test_frames_do_not_alias_each_other() {
        let backend = FakeBackend::with_default_devices()
            .with_format(16, 8, PixelType::BGR8_PACKED)
            .with_pattern(TestPattern::Solid(255, 0, 0));
        let mut acquirer = streaming(&backend);
        let first = acquirer.acquire(TIMEOUT).expect("first acquire");
        let snapshot = first.data.clone();
        let _second = acquirer.acquire(TIMEOUT).expect("second acquire");
        assert_eq!(first.data, snapshot);
    }

    #[test]
    fn test_mono8_uniform_frame_replicates_value() {
        let backend = FakeBackend::with_default_devices()
            .with_format(8, 4, PixelType::MONO8)
            .with_pattern(TestPattern::Solid(128, 128, 128));
        let mut acquirer = streaming(&backend);
        let frame = acquirer.acquire(TIMEOUT).expect("acquire should succeed");
        let (r, g, b) = frame.pixel_at(3, 2).expect("pixel in bounds");
        assert_eq!(r, g);
        assert_eq!(g, b);
        assert!(frame.data.chunks_exact(3).all(|px| px == [r, g, b]));
    }

    #[test]
    fn test_rgb8_is_reordered_to_bgr() {
        let backend = FakeBackend::with_default_devices()
            .with_format(4, 4, PixelType::RGB8_PACKED)
            .with_pattern(TestPattern::ColorBars);
        let mut rgb = streaming(&backend);
        let from_rgb = rgb.acquire(TIMEOUT).expect("rgb acquire");

        let backend = FakeBackend::with_default_devices()
            .with_format(4, 4, PixelType::BGR8_PACKED)
            .with_pattern(TestPattern::ColorBars);
        let mut bgr = streaming(&backend);
        let from_bgr = bgr.acquire(TIMEOUT).expect("bgr acquire");

        assert_eq!(from_rgb.data, from_bgr.data);
    }

    #[test]
    fn test_yuyv_goes_through_backend_converter() {
        let backend = FakeBackend::with_default_devices().with_format(16, 8, PixelType::YUV422_YUYV_PACKED);
        let mut acquirer = streaming(&backend);
        let frame = acquirer.acquire(TIMEOUT).expect("acquire should succeed");
        assert_eq!(frame.data.len(), 16 * 8 * 3);
        assert_eq!(backend.calls(FakeCall::Convert), 1);
    }

    #[test]
    fn test_unsupported_format_is_conversion_failure() {
        let backend = FakeBackend::with_default_devices().with_format(16, 8, PixelType(0x0110_0003));
        let mut acquirer = streaming(&backend);
        let err = acquirer.acquire(TIMEOUT).expect_err("conversion must fail");
        assert!(matches!(err, AcquireError::ConversionFailed { width: 16, height: 8, .. }));
        assert_eq!(acquirer.session().state(), SessionState::Streaming);
    }

    #[test]
    fn test_acquire_without_streaming_never_reaches_device() {
        let backend = Arc::new(FakeBackend::with_default_devices());
        let mut acquirer = FrameAcquirer::new(DeviceSession::new(Arc::clone(&backend)));
        let err = acquirer.acquire(TIMEOUT).expect_err("acquire must fail");
        assert!(matches!(
            err,
            AcquireError::Device(DeviceError::CallOrderViolation {
                attempted: Operation::Acquire,
                state: SessionState::Uninitialized,
            })
        ));
        assert_eq!(backend.calls(FakeCall::GetFrame), 0);
    }

    #[test]
    fn test_timeout_is_transient_and_keeps_streaming() {
        let backend = FakeBackend::with_default_devices();
        let mut acquirer = streaming(&backend);
        backend.fail_next(FakeCall::GetFrame, BackendError::Timeout);
        let err = acquirer.acquire(Duration::from_millis(5)).expect_err("acquire must time out");
        assert!(err.is_transient());
        assert_eq!(acquirer.session().state(), SessionState::Streaming);
        acquirer.acquire(TIMEOUT).expect("next acquire succeeds");
    }

    #[test]
    fn test_identity_without_calibration() {
        let backend = FakeBackend::with_default_devices().with_format(16, 8, PixelType::BGR8_PACKED);
        let mut acquirer = streaming(&backend);
        let frame = acquirer.acquire(TIMEOUT).expect("acquire should succeed");
        let expected = frame.clone();
        assert_eq!(acquirer.apply_calibration(frame), expected);
        assert!(!acquirer.has_calibration());
    }

    #[test]
    fn test_set_calibration_binds_and_clears() {
        let backend = FakeBackend::with_default_devices();
        let mut acquirer = streaming(&backend);
        let params = CalibrationParameters {
            camera_matrix: [[500.0, 0.0, 320.0], [0.0, 500.0, 240.0], [0.0, 0.0, 1.0]],
            distortion: vec![0.0; 5],
            image_width: 640,
            image_height: 480,
            reprojection_error: 0.1,
        };
        acquirer.set_calibration(Some(Arc::new(params)));
        assert!(acquirer.has_calibration());

        let frame = acquirer.acquire(TIMEOUT).expect("acquire should succeed");
        let expected = frame.data.clone();
        assert_eq!(acquirer.apply_calibration(frame).data, expected);

        acquirer.set_calibration(None);
        assert!(!acquirer.has_calibration());
    }
}
