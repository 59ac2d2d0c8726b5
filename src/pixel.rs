//! Pixel formats and conversion to the canonical BGR layout.

use std::fmt;

use crate::backend::BackendError;
use crate::error::AcquireError;

/// Four-character code (e.g. `YUYV`, `MJPG`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");
    /// RGB3 pixel format (24-bit RGB).
    pub const RGB3: Self = Self::new(b"RGB3");
    /// BGR3 pixel format (24-bit BGR).
    pub const BGR3: Self = Self::new(b"BGR3");
    /// GREY pixel format (8-bit luminance).
    pub const GREY: Self = Self::new(b"GREY");

    /// Little-endian `u32` value, as stored in V4L2 structs and video containers.
    pub const fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    /// Inverse of [`to_u32`](Self::to_u32).
    pub const fn from_u32(code: u32) -> Self {
        Self(code.to_le_bytes())
    }

    /// Parse a code from text, padding short codes with spaces.
    pub fn parse(text: &str) -> Option<Self> {
        let bytes = text.as_bytes();
        if bytes.is_empty() || bytes.len() > 4 || !text.is_ascii() {
            return None;
        }
        let mut code = [b' '; 4];
        for (slot, &b) in code.iter_mut().zip(bytes) {
            *slot = b;
        }
        Some(Self(code))
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            let c = if b.is_ascii_graphic() || b == b' ' { b as char } else { '?' };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

/// Device-reported pixel type.
///
/// GigE/USB3 Vision devices report GenICam PFNC codes. Backends without a
/// PFNC name for a format (V4L2 MJPEG, for instance) report
/// [`PixelType::from_fourcc`], whose high bit is never set by PFNC codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelType(pub u32);

impl PixelType {
    /// 8-bit monochrome.
    pub const MONO8: Self = Self(0x0108_0001);
    /// Packed 24-bit RGB.
    pub const RGB8_PACKED: Self = Self(0x0218_0014);
    /// Packed 24-bit BGR.
    pub const BGR8_PACKED: Self = Self(0x0218_0015);
    /// YUV 4:2:2 packed as `Y0 U Y1 V`.
    pub const YUV422_YUYV_PACKED: Self = Self(0x0210_0032);

    const FOURCC_FLAG: u32 = 0x8000_0000;

    /// Pixel type for a format only known by its `FourCC`.
    pub const fn from_fourcc(fourcc: FourCC) -> Self {
        Self(Self::FOURCC_FLAG | (fourcc.to_u32() & !Self::FOURCC_FLAG))
    }

    /// Bits per pixel encoded in a PFNC code, if this is one.
    pub const fn bits_per_pixel(self) -> Option<u32> {
        if self.0 & Self::FOURCC_FLAG == 0 {
            Some((self.0 >> 16) & 0xff)
        } else {
            None
        }
    }
}

impl fmt::Display for PixelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::MONO8 => f.write_str("Mono8"),
            Self::RGB8_PACKED => f.write_str("RGB8"),
            Self::BGR8_PACKED => f.write_str("BGR8"),
            Self::YUV422_YUYV_PACKED => f.write_str("YUV422_YUYV"),
            Self(code) if code & Self::FOURCC_FLAG != 0 => {
                let bytes = (code & !Self::FOURCC_FLAG).to_le_bytes();
                write!(f, "{}", FourCC(bytes))
            }
            Self(code) => write!(f, "0x{code:08x}"),
        }
    }
}

/// Number of bytes in a canonical BGR frame.
pub fn bgr_len(width: u32, height: u32) -> Option<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|n| n.checked_mul(3))
}

fn conversion_failed(pixel_type: PixelType, width: u32, height: u32, reason: String) -> AcquireError {
    AcquireError::ConversionFailed {
        pixel_type,
        width,
        height,
        reason,
    }
}

fn checked_source<'a>(
    src: &'a [u8],
    pixel_type: PixelType,
    width: u32,
    height: u32,
    bytes_per_pixel: usize,
) -> Result<&'a [u8], AcquireError> {
    let needed = (width as usize)
        .checked_mul(height as usize)
        .and_then(|n| n.checked_mul(bytes_per_pixel))
        .ok_or_else(|| conversion_failed(pixel_type, width, height, "size overflow".to_owned()))?;
    src.get(..needed).ok_or_else(|| {
        conversion_failed(
            pixel_type,
            width,
            height,
            format!("source holds {} bytes, need {needed}", src.len()),
        )
    })
}

/// Replicate each 8-bit luminance sample into three channels.
pub fn mono8_to_bgr(src: &[u8], width: u32, height: u32) -> Result<Vec<u8>, AcquireError> {
    let src = checked_source(src, PixelType::MONO8, width, height, 1)?;
    let mut out = Vec::with_capacity(src.len() * 3);
    for &v in src {
        out.extend_from_slice(&[v, v, v]);
    }
    Ok(out)
}

/// Reverse packed RGB triplets to BGR.
pub fn rgb8_to_bgr(src: &[u8], width: u32, height: u32) -> Result<Vec<u8>, AcquireError> {
    let src = checked_source(src, PixelType::RGB8_PACKED, width, height, 3)?;
    let mut out = Vec::with_capacity(src.len());
    for px in src.chunks_exact(3) {
        if let [r, g, b] = *px {
            out.extend_from_slice(&[b, g, r]);
        }
    }
    Ok(out)
}

/// Take ownership of a packed BGR buffer, trimming trailing transfer bytes.
pub fn bgr8_passthrough(mut src: Vec<u8>, width: u32, height: u32) -> Result<Vec<u8>, AcquireError> {
    let needed = checked_source(&src, PixelType::BGR8_PACKED, width, height, 3)?.len();
    src.truncate(needed);
    Ok(src)
}

/// Convert YUYV 4:2:2 into `dst` as packed BGR.
///
/// `dst` must be exactly `width * height * 3` bytes.
pub fn yuyv_to_bgr(src: &[u8], width: u32, height: u32, dst: &mut [u8]) -> Result<(), BackendError> {
    let pixels = (width as usize) * (height as usize);
    if dst.len() != pixels * 3 {
        return Err(BackendError::BufferTooSmall);
    }
    let src = src.get(..pixels * 2).ok_or(BackendError::BufferTooSmall)?;

    // [Y0 U Y1 V] covers two pixels sharing U and V.
    for (quad, out) in src.chunks_exact(4).zip(dst.chunks_exact_mut(6)) {
        if let [y0, u, y1, v] = *quad {
            let (r0, g0, b0) = yuv_to_rgb(y0, u, v);
            let (r1, g1, b1) = yuv_to_rgb(y1, u, v);
            out.copy_from_slice(&[b0, g0, r0, b1, g1, r1]);
        }
    }
    Ok(())
}

/// Convert YUV values to RGB.
///
/// Uses the ITU-R BT.601 conversion formula.
///
/// # Arguments
///
/// * `y` - Luminance value (16-235 for studio range)
/// * `u` - Blue-difference chroma value (16-240)
/// * `v` - Red-difference chroma value (16-240)
///
/// # Returns
///
/// RGB tuple with values clamped to 0-255 range.
#[must_use]
#[allow(clippy::many_single_char_names)]
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let y_f = f32::from(y);
    let u_f = f32::from(u) - 128.0;
    let v_f = f32::from(v) - 128.0;

    let r = 1.402f32.mul_add(v_f, y_f);
    let g = 0.714_14f32.mul_add(-v_f, 0.344_14f32.mul_add(-u_f, y_f));
    let b = 1.772f32.mul_add(u_f, y_f);

    (clamp_u8(r), clamp_u8(g), clamp_u8(b))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn clamp_u8(val: f32) -> u8 {
    val.clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mono8_uniform_value_replicates_to_three_channels() {
        let (w, h, v) = (7u32, 5u32, 93u8);
        let src = vec![v; (w * h) as usize];
        let out = mono8_to_bgr(&src, w, h).expect("mono8 conversion should succeed");
        assert_eq!(out.len(), (w * h * 3) as usize);
        assert!(out.iter().all(|&b| b == v));
    }

    #[test]
    fn test_mono8_short_buffer_fails() {
        let err = mono8_to_bgr(&[1, 2, 3], 2, 2).expect_err("short buffer must fail");
        assert!(matches!(err, AcquireError::ConversionFailed { .. }));
    }

    #[test]
    fn test_rgb8_reverses_channels() {
        let out = rgb8_to_bgr(&[10, 20, 30, 40, 50, 60], 2, 1).expect("rgb conversion should succeed");
        assert_eq!(out, vec![30, 20, 10, 60, 50, 40]);
    }

    #[test]
    fn test_bgr8_passthrough_trims_padding() {
        let src = vec![1, 2, 3, 4, 5, 6, 0, 0];
        let out = bgr8_passthrough(src, 2, 1).expect("passthrough should succeed");
        assert_eq!(out, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_yuyv_neutral_chroma_is_gray() {
        let src = [128, 128, 128, 128];
        let mut dst = [0u8; 6];
        yuyv_to_bgr(&src, 2, 1, &mut dst).expect("yuyv conversion should succeed");
        assert_eq!(dst, [128; 6]);
    }

    #[test]
    fn test_yuyv_rejects_wrong_destination_size() {
        let mut dst = [0u8; 5];
        assert_eq!(
            yuyv_to_bgr(&[0; 4], 2, 1, &mut dst),
            Err(BackendError::BufferTooSmall)
        );
    }

    #[test]
    fn test_fourcc_parse_pads_and_displays() {
        let code = FourCC::parse("DIB").expect("three letters should parse");
        assert_eq!(code, FourCC::new(b"DIB "));
        assert_eq!(code.to_string(), "DIB ");
        assert!(FourCC::parse("TOOLONG").is_none());
        assert_eq!(FourCC::from_u32(FourCC::MJPG.to_u32()), FourCC::MJPG);
    }

    #[test]
    fn test_pixel_type_display() {
        assert_eq!(PixelType::MONO8.to_string(), "Mono8");
        assert_eq!(PixelType::from_fourcc(FourCC::MJPG).to_string(), "MJPG");
        assert_eq!(PixelType::MONO8.bits_per_pixel(), Some(8));
        assert_eq!(PixelType::from_fourcc(FourCC::MJPG).bits_per_pixel(), None);
    }
}
