//! Video recording through OpenCV's `VideoWriter`.
//!
//! The requested FourCC is handed to the encoder as is. A code the encoder
//! cannot open is reported as [`OutputError::UnsupportedCodec`], never
//! replaced by another codec.

use std::fs;
use std::path::{Path, PathBuf};

use opencv::core::{Mat, Size, StsError, StsOutOfRange};
use opencv::prelude::*;
use opencv::videoio::{
    VideoCapture, VideoWriter, CAP_ANY, CAP_PROP_FOURCC, CAP_PROP_FPS, CAP_PROP_FRAME_COUNT, CAP_PROP_FRAME_HEIGHT,
    CAP_PROP_FRAME_WIDTH,
};
use tracing::{debug, info, warn};

use crate::acquirer::Frame;
use crate::error::OutputError;
use crate::pixel::FourCC;

fn dimension(value: u32) -> opencv::Result<i32> {
    i32::try_from(value).map_err(|_| opencv::Error::new(StsOutOfRange, format!("dimension {value} out of range")))
}

/// Streams BGR frames into a video file of fixed size.
///
/// Call [`finish`](Self::finish) to flush the container; dropping an
/// unfinished recorder releases it and logs any error.
pub struct VideoRecorder {
    writer: VideoWriter,
    path: PathBuf,
    width: u32,
    height: u32,
    codec: FourCC,
    frames: u64,
    finished: bool,
}

impl std::fmt::Debug for VideoRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoRecorder")
            .field("path", &self.path)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("codec", &self.codec)
            .field("frames", &self.frames)
            .finish_non_exhaustive()
    }
}

impl VideoRecorder {
    /// Create `path` (and its parent directories) for `width` x `height` frames.
    pub fn create(path: &Path, width: u32, height: u32, fps: u32, codec: &str) -> Result<Self, OutputError> {
        let unsupported = || OutputError::UnsupportedCodec {
            codec: codec.to_owned(),
            path: path.to_path_buf(),
        };
        let fourcc = FourCC::parse(codec).ok_or_else(unsupported)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| OutputError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let video_error = |source| OutputError::Video {
            path: path.to_path_buf(),
            source,
        };
        let [c1, c2, c3, c4] = fourcc.0.map(char::from);
        let code = VideoWriter::fourcc(c1, c2, c3, c4).map_err(video_error)?;
        let size = Size::new(dimension(width).map_err(video_error)?, dimension(height).map_err(video_error)?);
        let writer = VideoWriter::new(&path.to_string_lossy(), code, f64::from(fps.max(1)), size, true)
            .map_err(video_error)?;
        if !writer.is_opened().map_err(video_error)? {
            warn!(path = %path.display(), codec = %fourcc, "encoder rejected codec");
            return Err(unsupported());
        }

        info!(path = %path.display(), width, height, fps, codec = %fourcc, "video file opened");
        Ok(Self {
            writer,
            path: path.to_path_buf(),
            width,
            height,
            codec: fourcc,
            frames: 0,
            finished: false,
        })
    }

    /// Frames appended so far.
    pub const fn frames(&self) -> u64 {
        self.frames
    }

    /// Append one frame. Its size must match the recorder's.
    pub fn write_frame(&mut self, frame: &Frame) -> Result<(), OutputError> {
        if (frame.width, frame.height) != (self.width, self.height) {
            return Err(OutputError::DimensionMismatch {
                expected: (self.width, self.height),
                actual: (frame.width, frame.height),
            });
        }
        let video_error = |source| OutputError::Video {
            path: self.path.clone(),
            source,
        };
        let rows = dimension(frame.height).map_err(video_error)?;
        let mat: Mat = Mat::from_slice(&frame.data)
            .and_then(|m| m.reshape(3, rows)?.try_clone())
            .map_err(video_error)?;
        self.writer.write(&mat).map_err(video_error)?;
        self.frames += 1;
        Ok(())
    }

    /// Flush and close the file.
    pub fn finish(mut self) -> Result<(), OutputError> {
        self.release()
    }

    fn release(&mut self) -> Result<(), OutputError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.writer.release().map_err(|source| OutputError::Video {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = %self.path.display(), frames = self.frames, codec = %self.codec, "video file closed");
        Ok(())
    }
}

impl Drop for VideoRecorder {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!(error = %err, "failed to close video file");
        }
    }
}

/// Properties of a finished video file as reported by the decoder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoInfo {
    /// Frame count.
    pub frames: u64,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Nominal frame rate.
    pub fps: f64,
    /// Stream codec.
    pub codec: FourCC,
}

impl VideoInfo {
    /// Open `path` for reading and collect its stream properties.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn read(path: &Path) -> Result<Self, OutputError> {
        let video_error = |source| OutputError::Video {
            path: path.to_path_buf(),
            source,
        };
        let capture = VideoCapture::from_file(&path.to_string_lossy(), CAP_ANY).map_err(video_error)?;
        if !capture.is_opened().map_err(video_error)? {
            return Err(video_error(opencv::Error::new(StsError, "file could not be opened for reading")));
        }
        let get = |prop| capture.get(prop).map_err(video_error);
        Ok(Self {
            frames: get(CAP_PROP_FRAME_COUNT)? as u64,
            width: get(CAP_PROP_FRAME_WIDTH)? as u32,
            height: get(CAP_PROP_FRAME_HEIGHT)? as u32,
            fps: get(CAP_PROP_FPS)?,
            codec: FourCC::from_u32(get(CAP_PROP_FOURCC)? as u32),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(width: u32, height: u32, value: u8) -> Frame {
        Frame {
            width,
            height,
            data: vec![value; (width * height * 3) as usize],
            sequence: 0,
            timestamp: chrono::Local::now(),
        }
    }

    #[test]
    fn test_mjpg_file_reports_frames_size_and_codec() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = dir.path().join("nested/clip.avi");
        let mut recorder = VideoRecorder::create(&path, 32, 24, 10, "MJPG").expect("MJPG should open");
        for value in [0, 80, 160, 240] {
            recorder.write_frame(&frame(32, 24, value)).expect("write should succeed");
        }
        assert_eq!(recorder.frames(), 4);
        recorder.finish().expect("finish should succeed");

        let info = VideoInfo::read(&path).expect("video should read back");
        assert_eq!(info.frames, 4);
        assert_eq!((info.width, info.height), (32, 24));
        assert!((info.fps - 10.0).abs() < 1e-6);
        assert_eq!(info.codec, FourCC::MJPG);
    }

    #[test]
    fn test_malformed_codec_is_unsupported() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = dir.path().join("clip.avi");
        let err = VideoRecorder::create(&path, 32, 24, 10, "TOOLONG").expect_err("5+ characters are not a FourCC");
        assert!(matches!(err, OutputError::UnsupportedCodec { ref codec, .. } if codec == "TOOLONG"));
        assert!(!path.exists());
    }

    #[test]
    fn test_frame_size_must_match() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let mut recorder =
            VideoRecorder::create(&dir.path().join("clip.avi"), 32, 24, 10, "MJPG").expect("MJPG should open");
        let err = recorder
            .write_frame(&frame(16, 16, 0))
            .expect_err("size differs from the file");
        assert!(matches!(
            err,
            OutputError::DimensionMismatch {
                expected: (32, 24),
                actual: (16, 16)
            }
        ));
        assert_eq!(recorder.frames(), 0);
    }
}
