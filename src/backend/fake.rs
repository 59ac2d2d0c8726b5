//! Deterministic in-memory backend for testing without hardware.
//!
//! Frames are synthesized from a [`TestPattern`] in the configured pixel
//! type. Faults can be queued per call, and every call is counted so tests
//! can assert that a call never reached the device.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use super::{
    AccessMode, BackendError, BackendResult, DeviceBackend, DeviceDescriptor, DeviceHandle,
    FrameInfo,
};
use crate::pixel::{self, PixelType};

/// Backend operations a fault can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeCall {
    /// `enumerate`
    Enumerate,
    /// `create_handle`
    CreateHandle,
    /// `open`
    Open,
    /// `close`
    Close,
    /// `destroy`
    Destroy,
    /// `optimal_packet_size`
    PacketSize,
    /// `set_int_value` / `set_enum_value`
    SetValue,
    /// `start_streaming`
    StartStreaming,
    /// `stop_streaming`
    StopStreaming,
    /// `get_one_frame_timeout`
    GetFrame,
    /// `convert_pixel_type`
    Convert,
}

/// Test pattern types for frame generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestPattern {
    /// SMPTE color bars pattern.
    ColorBars,
    /// Horizontal gradient from dark to light.
    Gradient,
    /// Solid color with specified Y, U, V values.
    Solid(u8, u8, u8),
}

#[derive(Debug)]
struct FakeState {
    devices: Vec<DeviceDescriptor>,
    width: u32,
    height: u32,
    pixel_type: PixelType,
    pattern: TestPattern,
    frame_delay: Duration,
    packet_size: u32,
    faults: HashMap<FakeCall, VecDeque<BackendError>>,
    calls: HashMap<FakeCall, usize>,
    values: HashMap<String, i64>,
    live_handles: usize,
    in_flight: bool,
    overlaps: usize,
    sequence: u64,
}

impl FakeState {
    fn record(&mut self, call: FakeCall) -> BackendResult<()> {
        *self.calls.entry(call).or_default() += 1;
        match self.faults.get_mut(&call).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Fake device transport. Clones share state.
#[derive(Debug, Clone)]
pub struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBackend {
    /// A backend with no devices, 640x480 BGR8 color bars.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                devices: Vec::new(),
                width: 640,
                height: 480,
                pixel_type: PixelType::BGR8_PACKED,
                pattern: TestPattern::ColorBars,
                frame_delay: Duration::ZERO,
                packet_size: 8164,
                faults: HashMap::new(),
                calls: HashMap::new(),
                values: HashMap::new(),
                live_handles: 0,
                in_flight: false,
                overlaps: 0,
                sequence: 0,
            })),
        }
    }

    /// A backend exposing one USB and one GigE camera.
    #[must_use]
    pub fn with_default_devices() -> Self {
        Self::new()
            .with_device(DeviceDescriptor::usb(0, "Fake USB Camera"))
            .with_device(DeviceDescriptor::gige(
                1,
                "Fake GigE Camera",
                Ipv4Addr::new(192, 168, 0, 1),
            ))
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a device to the enumeration result.
    #[must_use]
    pub fn with_device(self, descriptor: DeviceDescriptor) -> Self {
        self.lock().devices.push(descriptor);
        self
    }

    /// Set the geometry and pixel type of generated frames.
    #[must_use]
    pub fn with_format(self, width: u32, height: u32, pixel_type: PixelType) -> Self {
        {
            let mut state = self.lock();
            state.width = width;
            state.height = height;
            state.pixel_type = pixel_type;
        }
        self
    }

    /// Set the test pattern for frame generation.
    #[must_use]
    pub fn with_pattern(self, pattern: TestPattern) -> Self {
        self.lock().pattern = pattern;
        self
    }

    /// Simulate sensor readout time for each frame.
    #[must_use]
    pub fn with_frame_delay(self, delay: Duration) -> Self {
        self.lock().frame_delay = delay;
        self
    }

    /// Fail the next `call` with `err`. Faults queue in order.
    pub fn fail_next(&self, call: FakeCall, err: BackendError) {
        self.lock().faults.entry(call).or_default().push_back(err);
    }

    /// Fail the next `count` invocations of `call` with `err`.
    pub fn fail_times(&self, call: FakeCall, err: BackendError, count: usize) {
        let mut state = self.lock();
        let queue = state.faults.entry(call).or_default();
        queue.extend(std::iter::repeat(err).take(count));
    }

    /// How many times `call` reached the backend, including failures.
    pub fn calls(&self, call: FakeCall) -> usize {
        self.lock().calls.get(&call).copied().unwrap_or(0)
    }

    /// Number of frame requests that started while another was in flight.
    pub fn overlapping_acquisitions(&self) -> usize {
        self.lock().overlaps
    }

    /// Handles created and not yet destroyed.
    pub fn live_handles(&self) -> usize {
        self.lock().live_handles
    }

    /// Last value written to an integer or enumeration feature.
    pub fn value(&self, key: &str) -> Option<i64> {
        self.lock().values.get(key).copied()
    }
}

impl DeviceBackend for FakeBackend {
    type Handle = FakeHandle;

    fn name(&self) -> &'static str {
        "fake"
    }

    fn enumerate(&self) -> BackendResult<Vec<DeviceDescriptor>> {
        let mut state = self.lock();
        state.record(FakeCall::Enumerate)?;
        Ok(state.devices.clone())
    }

    fn create_handle(&self, descriptor: &DeviceDescriptor) -> BackendResult<FakeHandle> {
        let mut state = self.lock();
        state.record(FakeCall::CreateHandle)?;
        if !state.devices.contains(descriptor) {
            return Err(BackendError::Parameter);
        }
        state.live_handles += 1;
        Ok(FakeHandle {
            backend: self.clone(),
            open: false,
            streaming: false,
        })
    }
}

/// Handle produced by [`FakeBackend`].
#[derive(Debug)]
pub struct FakeHandle {
    backend: FakeBackend,
    open: bool,
    streaming: bool,
}

impl FakeHandle {
    fn require_open(&self) -> BackendResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(BackendError::CallOrder)
        }
    }
}

impl DeviceHandle for FakeHandle {
    fn open(&mut self, _access: AccessMode) -> BackendResult<()> {
        self.backend.lock().record(FakeCall::Open)?;
        if self.open {
            return Err(BackendError::CallOrder);
        }
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> BackendResult<()> {
        self.backend.lock().record(FakeCall::Close)?;
        self.require_open()?;
        self.open = false;
        Ok(())
    }

    fn destroy(self) -> BackendResult<()> {
        let mut state = self.backend.lock();
        state.live_handles = state.live_handles.saturating_sub(1);
        state.record(FakeCall::Destroy)
    }

    fn optimal_packet_size(&mut self) -> BackendResult<u32> {
        let mut state = self.backend.lock();
        state.record(FakeCall::PacketSize)?;
        Ok(state.packet_size)
    }

    fn set_int_value(&mut self, key: &str, value: i64) -> BackendResult<()> {
        self.require_open()?;
        let mut state = self.backend.lock();
        state.record(FakeCall::SetValue)?;
        state.values.insert(key.to_owned(), value);
        Ok(())
    }

    fn set_enum_value(&mut self, key: &str, value: u32) -> BackendResult<()> {
        self.set_int_value(key, i64::from(value))
    }

    fn get_int_value(&mut self, key: &str) -> BackendResult<i64> {
        self.require_open()?;
        let state = self.backend.lock();
        match key {
            super::keys::WIDTH => Ok(i64::from(state.width)),
            super::keys::HEIGHT => Ok(i64::from(state.height)),
            _ => state.values.get(key).copied().ok_or(BackendError::Support),
        }
    }

    fn get_enum_value(&mut self, key: &str) -> BackendResult<u32> {
        self.require_open()?;
        if key == super::keys::PIXEL_FORMAT {
            return Ok(self.backend.lock().pixel_type.0);
        }
        let value = self.get_int_value(key)?;
        u32::try_from(value).map_err(|_| BackendError::Parameter)
    }

    fn get_float_value(&mut self, key: &str) -> BackendResult<f64> {
        self.require_open()?;
        if key == super::keys::FRAME_RATE {
            Ok(30.0)
        } else {
            Err(BackendError::Support)
        }
    }

    fn start_streaming(&mut self) -> BackendResult<()> {
        self.backend.lock().record(FakeCall::StartStreaming)?;
        self.require_open()?;
        self.streaming = true;
        Ok(())
    }

    fn stop_streaming(&mut self) -> BackendResult<()> {
        self.backend.lock().record(FakeCall::StopStreaming)?;
        if !self.streaming {
            return Err(BackendError::CallOrder);
        }
        self.streaming = false;
        Ok(())
    }

    fn get_one_frame_timeout(&mut self, buf: &mut Vec<u8>, timeout: Duration) -> BackendResult<FrameInfo> {
        let delay = {
            let mut state = self.backend.lock();
            if state.in_flight {
                state.overlaps += 1;
            }
            state.in_flight = true;
            if let Err(err) = state.record(FakeCall::GetFrame) {
                state.in_flight = false;
                drop(state);
                if err == BackendError::Timeout {
                    thread::sleep(timeout);
                }
                return Err(err);
            }
            if !self.streaming {
                state.in_flight = false;
                return Err(BackendError::CallOrder);
            }
            state.frame_delay
        };

        // Readout happens without the state lock so overlapping callers are observable.
        if !delay.is_zero() {
            thread::sleep(delay.min(timeout));
        }

        let mut state = self.backend.lock();
        state.in_flight = false;
        let (width, height, pixel_type) = (state.width, state.height, state.pixel_type);
        *buf = generate_test_frame(width, height, pixel_type, state.pattern);
        state.sequence += 1;
        Ok(FrameInfo {
            width,
            height,
            pixel_type,
            frame_len: buf.len(),
            frame_number: state.sequence,
        })
    }

    fn convert_pixel_type(&mut self, info: &FrameInfo, src: &[u8], dst: &mut [u8]) -> BackendResult<()> {
        self.backend.lock().record(FakeCall::Convert)?;
        match info.pixel_type {
            PixelType::YUV422_YUYV_PACKED => pixel::yuyv_to_bgr(src, info.width, info.height, dst),
            _ => Err(BackendError::Support),
        }
    }
}

/// Generate raw frame bytes for `pixel_type`.
///
/// Unknown pixel types get one byte per pixel of luminance, so conversion of
/// them fails in the same way a real device's unsupported format would.
fn generate_test_frame(width: u32, height: u32, pixel_type: PixelType, pattern: TestPattern) -> Vec<u8> {
    let mut yuyv = vec![0u8; (width * height * 2) as usize];
    match pattern {
        TestPattern::ColorBars => generate_color_bars(&mut yuyv, width, height),
        TestPattern::Gradient => generate_gradient(&mut yuyv, width, height),
        TestPattern::Solid(y, u, v) => generate_solid(&mut yuyv, y, u, v),
    }

    if pixel_type == PixelType::YUV422_YUYV_PACKED {
        return yuyv;
    }

    let mut out = Vec::with_capacity((width * height * 3) as usize);
    for quad in yuyv.chunks_exact(4) {
        if let [y0, u, y1, v] = *quad {
            for y in [y0, y1] {
                match pixel_type {
                    PixelType::RGB8_PACKED => {
                        let (r, g, b) = pixel::yuv_to_rgb(y, u, v);
                        out.extend_from_slice(&[r, g, b]);
                    }
                    PixelType::BGR8_PACKED => {
                        let (r, g, b) = pixel::yuv_to_rgb(y, u, v);
                        out.extend_from_slice(&[b, g, r]);
                    }
                    _ => out.push(y),
                }
            }
        }
    }
    out
}

/// Generate YUYV color bars pattern.
fn generate_color_bars(data: &mut [u8], width: u32, height: u32) {
    // 8 color bars: White, Yellow, Cyan, Green, Magenta, Red, Blue, Black
    let bars: [(u8, u8, u8); 8] = [
        (235, 128, 128), // White
        (210, 16, 146),  // Yellow
        (170, 166, 16),  // Cyan
        (145, 54, 34),   // Green
        (106, 202, 222), // Magenta
        (81, 90, 240),   // Red
        (41, 240, 110),  // Blue
        (16, 128, 128),  // Black
    ];

    let bar_width = (width / 8).max(1);

    for y in 0..height {
        for x in (0..width).step_by(2) {
            let bar_idx = (x / bar_width).min(7) as usize;
            let (y_val, u_val, v_val) = bars[bar_idx];

            let offset = ((y * width + x) * 2) as usize;
            if offset + 3 < data.len() {
                data[offset] = y_val;
                data[offset + 1] = u_val;
                data[offset + 2] = y_val;
                data[offset + 3] = v_val;
            }
        }
    }
}

/// Generate YUYV horizontal gradient pattern.
fn generate_gradient(data: &mut [u8], width: u32, height: u32) {
    for y in 0..height {
        for x in (0..width).step_by(2) {
            #[allow(clippy::cast_possible_truncation)]
            let y_val = ((x * 255) / width) as u8;
            let offset = ((y * width + x) * 2) as usize;

            if offset + 3 < data.len() {
                data[offset] = y_val;
                data[offset + 1] = 128;
                data[offset + 2] = y_val;
                data[offset + 3] = 128;
            }
        }
    }
}

/// Generate solid color YUYV frame.
fn generate_solid(data: &mut [u8], y: u8, u: u8, v: u8) {
    for quad in data.chunks_exact_mut(4) {
        quad.copy_from_slice(&[y, u, y, v]);
    }
}
