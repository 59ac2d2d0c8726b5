//! Still-image encoding for captured frames.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageFormat, RgbImage};
use tracing::debug;

use crate::acquirer::Frame;
use crate::error::OutputError;

/// JPEG quality used for stills.
pub const JPEG_QUALITY: u8 = 90;

/// Image formats accepted by [`write_image`].
pub const SUPPORTED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tif", "tiff"];

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> OutputError + '_ {
    move |source| OutputError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Resolve the still format for `path` from its extension.
pub fn format_for(path: &Path) -> Result<ImageFormat, OutputError> {
    let supported = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| SUPPORTED_EXTENSIONS.iter().any(|s| s.eq_ignore_ascii_case(e)));
    if !supported {
        return Err(OutputError::UnsupportedFormat(path.to_path_buf()));
    }
    ImageFormat::from_path(path).map_err(|_| OutputError::UnsupportedFormat(path.to_path_buf()))
}

/// Packed RGB copy of a BGR frame.
pub fn to_rgb(frame: &Frame) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(frame.data.len());
    for px in frame.data.chunks_exact(3) {
        if let [b, g, r] = *px {
            rgb.extend_from_slice(&[r, g, b]);
        }
    }
    rgb
}

fn rgb_image(frame: &Frame, path: &Path) -> Result<RgbImage, OutputError> {
    RgbImage::from_raw(frame.width, frame.height, to_rgb(frame)).ok_or_else(|| OutputError::Io {
        path: path.to_path_buf(),
        source: std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "frame holds {} bytes, expected {}x{}x3",
                frame.data.len(),
                frame.width,
                frame.height
            ),
        ),
    })
}

/// Encode `frame` to `path`, picking the format from the extension.
///
/// Parent directories are created as needed. Returns the written path.
pub fn write_image(frame: &Frame, path: &Path) -> Result<PathBuf, OutputError> {
    let format = format_for(path)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_error(parent))?;
    }

    let encode_error = |source: image::ImageError| OutputError::Encode {
        path: path.to_path_buf(),
        source,
    };
    if format == ImageFormat::Jpeg {
        let mut writer = BufWriter::new(fs::File::create(path).map_err(io_error(path))?);
        let rgb = to_rgb(frame);
        JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY)
            .encode(&rgb, frame.width, frame.height, ExtendedColorType::Rgb8)
            .map_err(encode_error)?;
        writer.flush().map_err(io_error(path))?;
    } else {
        rgb_image(frame, path)?
            .save_with_format(path, format)
            .map_err(encode_error)?;
    }

    debug!(path = %path.display(), width = frame.width, height = frame.height, "image written");
    Ok(path.to_path_buf())
}
