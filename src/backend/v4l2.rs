//! V4L2 backend for UVC cameras using the v4l crate.
//!
//! V4L2 has no separate handle and open steps: `create_handle` resolves the
//! device node and `open` opens it. Feature names map onto the current
//! format, stream parameters or, failing that, a V4L2 control whose name
//! matches the key.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::control::{Control, Value};
use v4l::io::mmap::Stream;
use v4l::io::traits::{CaptureStream, Stream as _};
use v4l::video::Capture;
use v4l::Device;

use super::{keys, AccessMode, BackendError, BackendResult, DeviceBackend, DeviceDescriptor, DeviceHandle, FrameInfo};
use crate::config::BackendConfig;
use crate::pixel::{self, FourCC, PixelType};

const EBUSY: i32 = 16;
const ENODEV: i32 = 19;

fn map_io(err: &io::Error) -> BackendError {
    match (err.kind(), err.raw_os_error()) {
        (io::ErrorKind::PermissionDenied, _) => BackendError::AccessDenied,
        (io::ErrorKind::TimedOut, _) => BackendError::Timeout,
        (io::ErrorKind::WouldBlock, _) => BackendError::NoData,
        (io::ErrorKind::NotFound, _) | (_, Some(ENODEV)) => BackendError::Handle,
        (_, Some(EBUSY)) => BackendError::Resource,
        _ => BackendError::Unknown,
    }
}

fn log_io(operation: &'static str) -> impl Fn(io::Error) -> BackendError {
    move |err| {
        debug!(operation, error = %err, "v4l2 call failed");
        map_io(&err)
    }
}

/// Pixel type for a V4L2 FourCC.
pub fn pixel_type_for(fourcc: FourCC) -> PixelType {
    match fourcc {
        FourCC::GREY => PixelType::MONO8,
        FourCC::RGB3 => PixelType::RGB8_PACKED,
        FourCC::BGR3 => PixelType::BGR8_PACKED,
        FourCC::YUYV => PixelType::YUV422_YUYV_PACKED,
        other => PixelType::from_fourcc(other),
    }
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Enumerates `/dev/video*` capture nodes.
#[derive(Debug, Clone)]
pub struct V4l2Backend {
    buffer_count: u32,
    search_paths: Vec<PathBuf>,
}

impl V4l2Backend {
    /// Backend using `config.buffer_count` mmap buffers per stream.
    ///
    /// Capture goes through the kernel driver; the configured runtime search
    /// paths are resolved and checked so a misconfigured install shows up in
    /// the log before the first device is opened.
    pub fn new(config: &BackendConfig) -> Self {
        let search_paths = config.search_paths();
        for missing in search_paths.iter().filter(|p| !p.is_dir()) {
            warn!(path = %missing.display(), "runtime search path does not exist");
        }
        if !search_paths.is_empty() {
            debug!(paths = ?search_paths, "runtime search paths");
        }
        Self {
            buffer_count: config.buffer_count.max(1),
            search_paths,
        }
    }

    /// Resolved runtime library directories, in search order.
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }
}

impl DeviceBackend for V4l2Backend {
    type Handle = V4l2Handle;

    fn name(&self) -> &'static str {
        "v4l2"
    }

    fn enumerate(&self) -> BackendResult<Vec<DeviceDescriptor>> {
        let mut devices = Vec::new();
        for node in v4l::context::enum_devices() {
            let index = u32::try_from(node.index()).map_err(|_| BackendError::Parameter)?;
            let name = node.name().unwrap_or_else(|| node.path().display().to_string());
            match Device::new(node.index()).and_then(|dev| dev.query_caps()) {
                Ok(caps) if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) => {
                    debug!(index, card = %caps.card, "skipping non-capture node");
                }
                Ok(caps) => devices.push(DeviceDescriptor::usb(index, caps.card)),
                Err(err) => {
                    warn!(index, error = %err, "cannot query node, listing by name");
                    devices.push(DeviceDescriptor::usb(index, name));
                }
            }
        }
        devices.sort_by_key(|d| d.index);
        Ok(devices)
    }

    fn create_handle(&self, descriptor: &DeviceDescriptor) -> BackendResult<Self::Handle> {
        let exists = v4l::context::enum_devices()
            .iter()
            .any(|node| u32::try_from(node.index()).is_ok_and(|i| i == descriptor.index));
        if !exists {
            return Err(BackendError::Handle);
        }
        Ok(V4l2Handle {
            index: descriptor.index,
            buffer_count: self.buffer_count,
            device: None,
            stream: None,
            format: None,
        })
    }
}

/// An opened (or openable) V4L2 device.
pub struct V4l2Handle {
    index: u32,
    buffer_count: u32,
    device: Option<Device>,
    stream: Option<Stream<'static>>,
    format: Option<(u32, u32, PixelType)>,
}

impl std::fmt::Debug for V4l2Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("V4l2Handle")
            .field("index", &self.index)
            .field("open", &self.device.is_some())
            .field("streaming", &self.stream.is_some())
            .field("format", &self.format)
            .finish()
    }
}

impl V4l2Handle {
    fn device(&self) -> BackendResult<&Device> {
        self.device.as_ref().ok_or(BackendError::CallOrder)
    }

    fn current_format(&self) -> BackendResult<v4l::Format> {
        self.device()?.format().map_err(log_io("format"))
    }

    fn find_control(&self, key: &str) -> BackendResult<u32> {
        let wanted = normalize(key);
        self.device()?
            .query_controls()
            .map_err(log_io("query_controls"))?
            .into_iter()
            .find(|d| normalize(&d.name) == wanted)
            .map(|d| d.id)
            .ok_or(BackendError::Support)
    }

    fn set_dimension(&mut self, key: &str, value: i64) -> BackendResult<()> {
        let value = u32::try_from(value).map_err(|_| BackendError::Parameter)?;
        let mut fmt = self.current_format()?;
        if key == keys::WIDTH {
            fmt.width = value;
        } else {
            fmt.height = value;
        }
        let applied = self.device()?.set_format(&fmt).map_err(log_io("set_format"))?;
        info!(width = applied.width, height = applied.height, fourcc = %applied.fourcc, "format applied");
        Ok(())
    }
}

impl DeviceHandle for V4l2Handle {
    fn open(&mut self, access: AccessMode) -> BackendResult<()> {
        if self.device.is_some() {
            return Err(BackendError::CallOrder);
        }
        if access != AccessMode::Exclusive {
            debug!(?access, "V4L2 has no access modes; opening normally");
        }
        let device = Device::new(self.index as usize).map_err(log_io("open"))?;
        let caps = device.query_caps().map_err(log_io("query_caps"))?;
        if !caps.capabilities.contains(v4l::capability::Flags::STREAMING) {
            return Err(BackendError::Support);
        }
        info!(index = self.index, card = %caps.card, driver = %caps.driver, bus = %caps.bus, "device opened");
        self.device = Some(device);
        Ok(())
    }

    fn close(&mut self) -> BackendResult<()> {
        self.stream = None;
        self.device.take().map(drop).ok_or(BackendError::CallOrder)
    }

    fn destroy(self) -> BackendResult<()> {
        Ok(())
    }

    fn optimal_packet_size(&mut self) -> BackendResult<u32> {
        Err(BackendError::Support)
    }

    fn set_int_value(&mut self, key: &str, value: i64) -> BackendResult<()> {
        match key {
            keys::WIDTH | keys::HEIGHT => self.set_dimension(key, value),
            _ => {
                let id = self.find_control(key)?;
                self.device()?
                    .set_control(Control {
                        id,
                        value: Value::Integer(value),
                    })
                    .map_err(log_io("set_control"))
            }
        }
    }

    fn set_enum_value(&mut self, key: &str, value: u32) -> BackendResult<()> {
        match key {
            // UVC devices only free-run.
            keys::TRIGGER_MODE if value == keys::TRIGGER_MODE_OFF => Ok(()),
            keys::TRIGGER_MODE => Err(BackendError::Support),
            _ => self.set_int_value(key, i64::from(value)),
        }
    }

    fn get_int_value(&mut self, key: &str) -> BackendResult<i64> {
        match key {
            keys::WIDTH => Ok(i64::from(self.current_format()?.width)),
            keys::HEIGHT => Ok(i64::from(self.current_format()?.height)),
            _ => {
                let id = self.find_control(key)?;
                match self.device()?.control(id).map_err(log_io("control"))?.value {
                    Value::Integer(v) => Ok(v),
                    Value::Boolean(b) => Ok(i64::from(b)),
                    _ => Err(BackendError::Support),
                }
            }
        }
    }

    fn get_enum_value(&mut self, key: &str) -> BackendResult<u32> {
        match key {
            keys::PIXEL_FORMAT => {
                let fmt = self.current_format()?;
                Ok(pixel_type_for(FourCC(fmt.fourcc.repr)).0)
            }
            keys::TRIGGER_MODE => Ok(keys::TRIGGER_MODE_OFF),
            _ => u32::try_from(self.get_int_value(key)?).map_err(|_| BackendError::Parameter),
        }
    }

    fn get_float_value(&mut self, key: &str) -> BackendResult<f64> {
        if key != keys::FRAME_RATE {
            return Err(BackendError::Support);
        }
        let interval = self.device()?.params().map_err(log_io("params"))?.interval;
        if interval.numerator == 0 {
            return Err(BackendError::Support);
        }
        Ok(f64::from(interval.denominator) / f64::from(interval.numerator))
    }

    fn start_streaming(&mut self) -> BackendResult<()> {
        if self.stream.is_some() {
            return Err(BackendError::CallOrder);
        }
        let fmt = self.current_format()?;
        let mut stream = Stream::with_buffers(self.device()?, Type::VideoCapture, self.buffer_count)
            .map_err(log_io("with_buffers"))?;
        stream.start().map_err(log_io("stream_on"))?;
        let pixel_type = pixel_type_for(FourCC(fmt.fourcc.repr));
        info!(width = fmt.width, height = fmt.height, fourcc = %fmt.fourcc, buffers = self.buffer_count, "streaming");
        self.format = Some((fmt.width, fmt.height, pixel_type));
        self.stream = Some(stream);
        Ok(())
    }

    fn stop_streaming(&mut self) -> BackendResult<()> {
        let mut stream = self.stream.take().ok_or(BackendError::CallOrder)?;
        self.format = None;
        stream.stop().map_err(log_io("stream_off"))
    }

    fn get_one_frame_timeout(&mut self, buf: &mut Vec<u8>, timeout: Duration) -> BackendResult<FrameInfo> {
        let (width, height, pixel_type) = self.format.ok_or(BackendError::CallOrder)?;
        let stream = self.stream.as_mut().ok_or(BackendError::CallOrder)?;
        stream.set_timeout(timeout);
        let (data, meta) = stream.next().map_err(|err| map_io(&err))?;
        let used = (meta.bytesused as usize).min(data.len());
        buf.clear();
        buf.extend_from_slice(data.get(..used).unwrap_or(data));
        Ok(FrameInfo {
            width,
            height,
            pixel_type,
            frame_len: used,
            frame_number: u64::from(meta.sequence),
        })
    }

    fn convert_pixel_type(&mut self, info: &FrameInfo, src: &[u8], dst: &mut [u8]) -> BackendResult<()> {
        match info.pixel_type {
            PixelType::YUV422_YUYV_PACKED => pixel::yuyv_to_bgr(src, info.width, info.height, dst),
            t if t == PixelType::from_fourcc(FourCC::MJPG) => {
                let rgb = image::load_from_memory_with_format(src, image::ImageFormat::Jpeg)
                    .map_err(|err| {
                        debug!(error = %err, "MJPEG decode failed");
                        BackendError::AbnormalImage
                    })?
                    .to_rgb8();
                if rgb.dimensions() != (info.width, info.height) || dst.len() != rgb.as_raw().len() {
                    return Err(BackendError::BufferTooSmall);
                }
                for (out, px) in dst.chunks_exact_mut(3).zip(rgb.as_raw().chunks_exact(3)) {
                    if let [r, g, b] = *px {
                        out.copy_from_slice(&[b, g, r]);
                    }
                }
                Ok(())
            }
            _ => Err(BackendError::Support),
        }
    }
}
