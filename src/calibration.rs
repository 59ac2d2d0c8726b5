//! Lens calibration parameters, file providers and undistortion.
//!
//! Distortion follows the OpenCV coefficient order
//! `[k1, k2, p1, p2, k3, k4, k5, k6, s1, s2, s3, s4, tau_x, tau_y]` (any
//! prefix of length 4, 5, 8, 12 or 14). The camera matrix is kept as the new camera matrix, so
//! undistorted frames have the input size and a black border where no source
//! pixel maps.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use nalgebra::{Matrix3, Vector3};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::acquirer::Frame;
use crate::error::CalibrationError;

/// Intrinsics and distortion for one camera.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationParameters {
    /// Row-major 3×3 intrinsic matrix.
    pub camera_matrix: [[f64; 3]; 3],
    /// Distortion coefficients in OpenCV order.
    pub distortion: Vec<f64>,
    /// Width of the images used for calibration.
    pub image_width: u32,
    /// Height of the images used for calibration.
    pub image_height: u32,
    /// RMS reprojection error in pixels. Diagnostic only.
    pub reprojection_error: f64,
}

impl CalibrationParameters {
    /// Camera matrix scaled from the reference size to `width` x `height`.
    pub fn intrinsics(&self, width: u32, height: u32) -> Matrix3<f64> {
        let sx = f64::from(width) / f64::from(self.image_width);
        let sy = f64::from(height) / f64::from(self.image_height);
        let scale = Matrix3::from_diagonal(&Vector3::new(sx, sy, 1.0));
        scale * Matrix3::from_row_iterator(self.camera_matrix.iter().flatten().copied())
    }

    /// Check the parameters describe a usable pinhole camera.
    pub fn validate(&self) -> Result<(), String> {
        let k = &self.camera_matrix;
        if k.iter().flatten().any(|v| !v.is_finite()) {
            return Err("camera matrix contains non-finite values".to_owned());
        }
        if k[0][0] <= 0.0 || k[1][1] <= 0.0 {
            return Err(format!("focal lengths must be positive, got fx={} fy={}", k[0][0], k[1][1]));
        }
        if !matches!(self.distortion.len(), 4 | 5 | 8 | 12 | 14) {
            return Err(format!(
                "expected 4, 5, 8, 12 or 14 distortion coefficients, got {}",
                self.distortion.len()
            ));
        }
        if self.distortion.iter().any(|v| !v.is_finite()) {
            return Err("distortion coefficients contain non-finite values".to_owned());
        }
        if self.image_width == 0 || self.image_height == 0 {
            return Err("reference image size must be non-zero".to_owned());
        }
        Ok(())
    }
}

/// Source of parsed calibration parameters.
pub trait CalibrationProvider {
    /// Load parameters from `path`.
    fn load(&self, path: &Path) -> Result<CalibrationParameters, CalibrationError>;
}

/// Reads the JSON layout written by the calibration tool:
///
/// ```json
/// {
///   "camera_matrix": [[fx, 0, cx], [0, fy, cy], [0, 0, 1]],
///   "distortion_coefficients": [[k1, k2, p1, p2, k3]],
///   "calibration_info": { "image_size": [width, height] },
///   "reprojection_error": 0.21
/// }
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCalibrationProvider;

#[derive(Debug, Deserialize)]
struct JsonCalibration {
    camera_matrix: [[f64; 3]; 3],
    distortion_coefficients: Coefficients,
    calibration_info: JsonCalibrationInfo,
    reprojection_error: f64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Coefficients {
    Flat(Vec<f64>),
    Nested(Vec<Vec<f64>>),
}

#[derive(Debug, Deserialize)]
struct JsonCalibrationInfo {
    image_size: [u32; 2],
}

impl CalibrationProvider for JsonCalibrationProvider {
    fn load(&self, path: &Path) -> Result<CalibrationParameters, CalibrationError> {
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        if !is_json {
            return Err(CalibrationError::UnsupportedFormat(path.to_path_buf()));
        }

        let text = std::fs::read_to_string(path).map_err(|source| CalibrationError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let parse_failed = |reason: String| CalibrationError::ParseFailed {
            path: path.to_path_buf(),
            reason,
        };

        let raw: JsonCalibration = serde_json::from_str(&text).map_err(|e| parse_failed(e.to_string()))?;
        let distortion = match raw.distortion_coefficients {
            Coefficients::Flat(v) => v,
            Coefficients::Nested(rows) => rows.into_iter().flatten().collect(),
        };
        let params = CalibrationParameters {
            camera_matrix: raw.camera_matrix,
            distortion,
            image_width: raw.calibration_info.image_size[0],
            image_height: raw.calibration_info.image_size[1],
            reprojection_error: raw.reprojection_error,
        };
        params.validate().map_err(parse_failed)?;

        info!(
            path = %path.display(),
            width = params.image_width,
            height = params.image_height,
            reprojection_error = params.reprojection_error,
            "calibration loaded"
        );
        Ok(params)
    }
}

type Mat3 = Matrix3<f64>;
type Vec3 = Vector3<f64>;

/// Brown-Conrady distortion with the rational, thin-prism and tilted-sensor
/// extensions.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Distortion {
    k: [f64; 6],
    p1: f64,
    p2: f64,
    s: [f64; 4],
    tilt: Option<Mat3>,
}

/// Projection onto a sensor tilted by `tau_x`, `tau_y` radians.
fn tilt_projection(tau_x: f64, tau_y: f64) -> Mat3 {
    let (sx, cx) = tau_x.sin_cos();
    let (sy, cy) = tau_y.sin_cos();
    let rot_x = Mat3::new(1.0, 0.0, 0.0, 0.0, cx, sx, 0.0, -sx, cx);
    let rot_y = Mat3::new(cy, 0.0, -sy, 0.0, 1.0, 0.0, sy, 0.0, cy);
    let rot = rot_y * rot_x;
    let (r02, r12, r22) = (rot[(0, 2)], rot[(1, 2)], rot[(2, 2)]);
    let proj_z = Mat3::new(r22, 0.0, -r02, 0.0, r22, -r12, 0.0, 0.0, 1.0);
    proj_z * rot
}

impl Distortion {
    fn from_coefficients(c: &[f64]) -> Self {
        let at = |i: usize| c.get(i).copied().unwrap_or(0.0);
        Self {
            k: [at(0), at(1), at(4), at(5), at(6), at(7)],
            p1: at(2),
            p2: at(3),
            s: [at(8), at(9), at(10), at(11)],
            tilt: (at(12) != 0.0 || at(13) != 0.0).then(|| tilt_projection(at(12), at(13))),
        }
    }

    /// Map an ideal normalized point to its distorted position.
    fn distort(&self, x: f64, y: f64) -> (f64, f64) {
        let [k1, k2, k3, k4, k5, k6] = self.k;
        let [s1, s2, s3, s4] = self.s;
        let r2 = x.mul_add(x, y * y);
        let r4 = r2 * r2;
        let r6 = r4 * r2;
        let radial = (1.0 + k1 * r2 + k2 * r4 + k3 * r6) / (1.0 + k4 * r2 + k5 * r4 + k6 * r6);
        let xd = x * radial + 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x) + s1 * r2 + s2 * r4;
        let yd = y * radial + self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y + s3 * r2 + s4 * r4;
        match &self.tilt {
            Some(t) => {
                let p = t * Vec3::new(xd, yd, 1.0);
                let inv = if p.z == 0.0 { 1.0 } else { p.z.recip() };
                (p.x * inv, p.y * inv)
            }
            None => (xd, yd),
        }
    }
}

/// Source coordinates for every destination pixel of one frame size.
#[derive(Debug)]
struct RemapTable {
    width: u32,
    height: u32,
    coords: Vec<Option<(f32, f32)>>,
}

impl RemapTable {
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    fn build(params: &CalibrationParameters, model: &Distortion, width: u32, height: u32) -> Self {
        let k = params.intrinsics(width, height);
        let max_x = f64::from(width.saturating_sub(1));
        let max_y = f64::from(height.saturating_sub(1));
        const EDGE: f64 = 1e-3;

        let mut coords = Vec::with_capacity(width as usize * height as usize);
        let Some(k_inv) = k.try_inverse() else {
            warn!("camera matrix is singular; undistortion yields a black frame");
            coords.resize(width as usize * height as usize, None);
            return Self { width, height, coords };
        };
        for v in 0..height {
            for u in 0..width {
                let ideal = k_inv * Vec3::new(f64::from(u), f64::from(v), 1.0);
                let (xd, yd) = model.distort(ideal.x, ideal.y);
                let src = k * Vec3::new(xd, yd, 1.0);
                let (su, sv) = (src.x, src.y);
                let inside = (-EDGE..=max_x + EDGE).contains(&su) && (-EDGE..=max_y + EDGE).contains(&sv);
                coords.push(inside.then(|| (su.clamp(0.0, max_x) as f32, sv.clamp(0.0, max_y) as f32)));
            }
        }
        Self { width, height, coords }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn apply(&self, src: &[u8]) -> Vec<u8> {
        let w = self.width as usize;
        let h = self.height as usize;
        let mut out = vec![0u8; w * h * 3];
        let sample = |x: usize, y: usize, c: usize| f32::from(src.get((y * w + x) * 3 + c).copied().unwrap_or(0));

        for (dst, coord) in out.chunks_exact_mut(3).zip(&self.coords) {
            let Some((fx, fy)) = *coord else { continue };
            let x0 = fx.floor() as usize;
            let y0 = fy.floor() as usize;
            let x1 = (x0 + 1).min(w - 1);
            let y1 = (y0 + 1).min(h - 1);
            let wx = fx - x0 as f32;
            let wy = fy - y0 as f32;
            for (c, out_c) in dst.iter_mut().enumerate() {
                let top = sample(x0, y0, c).mul_add(1.0 - wx, sample(x1, y0, c) * wx);
                let bottom = sample(x0, y1, c).mul_add(1.0 - wx, sample(x1, y1, c) * wx);
                *out_c = top.mul_add(1.0 - wy, bottom * wy).round().clamp(0.0, 255.0) as u8;
            }
        }
        out
    }
}

/// Undistorts BGR frames with fixed calibration parameters.
///
/// The remap table is built lazily for the first frame size seen and rebuilt
/// only when the size changes.
#[derive(Debug)]
pub struct Undistorter {
    params: Arc<CalibrationParameters>,
    model: Distortion,
    table: Mutex<Option<Arc<RemapTable>>>,
}

impl Undistorter {
    /// Undistorter for `params`.
    pub fn new(params: Arc<CalibrationParameters>) -> Self {
        let model = Distortion::from_coefficients(&params.distortion);
        Self {
            params,
            model,
            table: Mutex::new(None),
        }
    }

    /// Bound parameters.
    pub fn params(&self) -> &CalibrationParameters {
        &self.params
    }

    fn table_for(&self, width: u32, height: u32) -> Arc<RemapTable> {
        let mut slot = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(table) if table.width == width && table.height == height => Arc::clone(table),
            _ => {
                if (width, height) != (self.params.image_width, self.params.image_height) {
                    warn!(
                        width,
                        height,
                        reference_width = self.params.image_width,
                        reference_height = self.params.image_height,
                        "frame size differs from calibration; scaling intrinsics"
                    );
                }
                debug!(width, height, "building undistortion map");
                let table = Arc::new(RemapTable::build(&self.params, &self.model, width, height));
                *slot = Some(Arc::clone(&table));
                table
            }
        }
    }

    /// Undistorted copy of `frame`.
    pub fn undistort(&self, frame: &Frame) -> Frame {
        if frame.width == 0 || frame.height == 0 {
            return frame.clone();
        }
        let table = self.table_for(frame.width, frame.height);
        Frame {
            width: frame.width,
            height: frame.height,
            data: table.apply(&frame.data),
            sequence: frame.sequence,
            timestamp: frame.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn params(distortion: Vec<f64>) -> CalibrationParameters {
        CalibrationParameters {
            camera_matrix: [[40.0, 0.0, 15.5], [0.0, 40.0, 11.5], [0.0, 0.0, 1.0]],
            distortion,
            image_width: 32,
            image_height: 24,
            reprojection_error: 0.2,
        }
    }

    fn frame(width: u32, height: u32, data: Vec<u8>) -> Frame {
        Frame {
            width,
            height,
            data,
            sequence: 0,
            timestamp: chrono::Local::now(),
        }
    }

    fn gradient_frame(width: u32, height: u32) -> Frame {
        let data = (0..height)
            .flat_map(|y| (0..width).flat_map(move |x| [(x * 7) as u8, (y * 9) as u8, ((x + y) * 3) as u8]))
            .collect();
        frame(width, height, data)
    }

    fn write_temp(ext: &str, body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(ext)
            .tempfile()
            .expect("temp file should be created");
        file.write_all(body.as_bytes()).expect("temp file should be writable");
        file
    }

    #[test]
    fn test_zero_distortion_is_identity() {
        let frame = gradient_frame(32, 24);
        let undistorter = Undistorter::new(Arc::new(params(vec![0.0; 5])));
        let out = undistorter.undistort(&frame);
        assert_eq!(out.data, frame.data);
    }

    #[test]
    fn test_pincushion_blackens_corners_keeps_center() {
        let frame = frame(32, 24, vec![200; 32 * 24 * 3]);
        let undistorter = Undistorter::new(Arc::new(params(vec![2.0, 0.0, 0.0, 0.0, 0.0])));
        let out = undistorter.undistort(&frame);
        assert_eq!(out.pixel_at(16, 12), Some((200, 200, 200)));
        assert_eq!(out.pixel_at(0, 0), Some((0, 0, 0)));
    }

    #[test]
    fn test_undistort_is_idempotent_for_same_input() {
        let frame = gradient_frame(32, 24);
        let undistorter = Undistorter::new(Arc::new(params(vec![-0.3, 0.1, 0.001, 0.002, 0.0])));
        let a = undistorter.undistort(&frame);
        let b = undistorter.undistort(&frame);
        assert_eq!(a.data, b.data);
    }

    #[test]
    fn test_zero_tilt_matches_untilted_model() {
        let mut coefficients = vec![-0.2, 0.05, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let frame = gradient_frame(32, 24);
        let plain = Undistorter::new(Arc::new(params(coefficients.clone()))).undistort(&frame);
        coefficients.extend([0.0, 0.0]);
        let tilted = Undistorter::new(Arc::new(params(coefficients))).undistort(&frame);
        assert_eq!(plain.data, tilted.data);
    }

    #[test]
    fn test_tilt_projection_identity_at_zero() {
        let t = tilt_projection(0.0, 0.0);
        assert_eq!(t, Mat3::identity());
    }

    #[test]
    fn test_intrinsics_scale_with_frame_size() {
        let k = params(vec![0.0; 5]).intrinsics(16, 48);
        assert_eq!(k, Mat3::new(20.0, 0.0, 7.75, 0.0, 80.0, 23.0, 0.0, 0.0, 1.0));
    }

    #[test]
    fn test_tilted_sensor_shifts_pixels() {
        let frame = gradient_frame(32, 24);
        let mut coefficients = vec![0.0; 12];
        coefficients.extend([0.05, 0.0]);
        let tilted = Undistorter::new(Arc::new(params(coefficients))).undistort(&frame);
        assert_ne!(tilted.data, frame.data);
    }

    #[test]
    fn test_validate_rejects_bad_coefficient_count() {
        let err = params(vec![0.0; 3]).validate().expect_err("3 coefficients are invalid");
        assert!(err.contains("got 3"));
    }

    #[test]
    fn test_load_json_nested_coefficients() {
        let file = write_temp(
            ".json",
            r#"{
                "camera_matrix": [[1000.0, 0.0, 640.0], [0.0, 1000.0, 360.0], [0.0, 0.0, 1.0]],
                "distortion_coefficients": [[-0.1, 0.05, 0.0, 0.0, 0.0]],
                "calibration_info": { "image_size": [1280, 720] },
                "reprojection_error": 0.31
            }"#,
        );
        let params = JsonCalibrationProvider
            .load(file.path())
            .expect("calibration should load");
        assert_eq!(params.image_width, 1280);
        assert_eq!(params.image_height, 720);
        assert_eq!(params.distortion, vec![-0.1, 0.05, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_load_xml_is_unsupported() {
        let file = write_temp(".xml", "<opencv_storage/>");
        let err = JsonCalibrationProvider
            .load(file.path())
            .expect_err("xml is not supported");
        assert!(matches!(err, CalibrationError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_load_malformed_json_is_parse_failed() {
        let file = write_temp(".json", r#"{ "camera_matrix": [[1.0]] }"#);
        let err = JsonCalibrationProvider
            .load(file.path())
            .expect_err("malformed json must fail");
        assert!(matches!(err, CalibrationError::ParseFailed { .. }));
    }
}
