//! Perspective alignment of a source into the shared reference frame.
//!
//! Each source may carry a 3x3 homography mapping its pixel coordinates onto
//! the reference camera. Calibrations live in a directory as
//! `<source>.yaml` files:
//!
//! ```yaml
//! matrix:
//!   - [1.02, 0.01, -12.5]
//!   - [0.00, 1.01, -8.0]
//!   - [0.00, 0.00, 1.0]
//! ```

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::frame::Frame;

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("no calibration at {0}")]
    NotFound(PathBuf),
    #[error("IO error reading {path}: {message}")]
    Io { path: PathBuf, message: String },
    #[error("Parse error in {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("matrix is singular and cannot be inverted")]
    Singular,
}

#[derive(Debug, Serialize, Deserialize)]
struct CalibrationFile {
    matrix: [[f64; 3]; 3],
}

/// A projective warp from source pixels to reference pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct PerspectiveTransform {
    matrix: Matrix3<f64>,
    inverse: Matrix3<f64>,
}

impl PerspectiveTransform {
    pub fn identity() -> Self {
        Self {
            matrix: Matrix3::identity(),
            inverse: Matrix3::identity(),
        }
    }

    /// Build from row-major coefficients.
    pub fn from_rows(rows: [[f64; 3]; 3]) -> Result<Self, TransformError> {
        let matrix = Matrix3::from_fn(|r, c| rows[r][c]);
        let inverse = matrix.try_inverse().ok_or(TransformError::Singular)?;
        if inverse.iter().any(|v| !v.is_finite()) {
            return Err(TransformError::Singular);
        }
        Ok(Self { matrix, inverse })
    }

    pub fn is_identity(&self) -> bool {
        self.matrix == Matrix3::identity()
    }

    /// Map a source pixel position into the reference frame.
    pub fn apply(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        project(&self.matrix, x, y)
    }

    /// Warp a frame into the reference frame, keeping its size. Pixels that
    /// map outside the source are black. Identity transforms pass the frame
    /// through untouched.
    pub fn warp(&self, frame: Frame) -> Frame {
        if self.is_identity() {
            return frame;
        }

        let width = frame.width as usize;
        let height = frame.height as usize;
        let channels = frame.channels as usize;
        let mut out = vec![0u8; frame.data.len()];

        for y in 0..height {
            for x in 0..width {
                let Some((sx, sy)) = project(&self.inverse, x as f64, y as f64) else {
                    continue;
                };
                let base = (y * width + x) * channels;
                sample_bilinear(&frame, sx, sy, &mut out[base..base + channels]);
            }
        }

        Frame {
            data: out,
            ..frame
        }
    }
}

impl Default for PerspectiveTransform {
    fn default() -> Self {
        Self::identity()
    }
}

fn project(m: &Matrix3<f64>, x: f64, y: f64) -> Option<(f64, f64)> {
    let p = m * Vector3::new(x, y, 1.0);
    if p.z.abs() < f64::EPSILON {
        return None;
    }
    Some((p.x / p.z, p.y / p.z))
}

/// Bilinear sample with a constant black border.
fn sample_bilinear(frame: &Frame, sx: f64, sy: f64, out: &mut [u8]) {
    let width = frame.width as i64;
    let height = frame.height as i64;
    if sx <= -1.0 || sy <= -1.0 || sx >= width as f64 || sy >= height as f64 {
        return;
    }

    let x0 = sx.floor() as i64;
    let y0 = sy.floor() as i64;
    let fx = sx - x0 as f64;
    let fy = sy - y0 as f64;
    let channels = frame.channels as usize;

    let pixel = |x: i64, y: i64, c: usize| -> f64 {
        if x < 0 || y < 0 || x >= width || y >= height {
            0.0
        } else {
            frame.data[(y as usize * width as usize + x as usize) * channels + c] as f64
        }
    };

    for (c, dst) in out.iter_mut().enumerate() {
        let top = pixel(x0, y0, c) * (1.0 - fx) + pixel(x0 + 1, y0, c) * fx;
        let bottom = pixel(x0, y0 + 1, c) * (1.0 - fx) + pixel(x0 + 1, y0 + 1, c) * fx;
        let value = top * (1.0 - fy) + bottom * fy;
        *dst = value.round().clamp(0.0, 255.0) as u8;
    }
}

/// Persisted calibrations keyed by source name.
#[derive(Debug, Clone, Default)]
pub struct TransformStore {
    dir: Option<PathBuf>,
}

impl TransformStore {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    /// Path of the calibration file for `source`, if a store directory is set.
    pub fn path_for(&self, source: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(format!("{}.yaml", source)))
    }

    /// Load the transform for `source`.
    pub fn load(&self, source: &str) -> Result<PerspectiveTransform, TransformError> {
        let path = self
            .path_for(source)
            .ok_or_else(|| TransformError::NotFound(PathBuf::from(format!("{}.yaml", source))))?;
        load_file(&path)
    }

    /// Load the transform for `source`, falling back to identity with a
    /// warning when it is missing or unusable.
    pub fn load_or_identity(&self, source: &str) -> PerspectiveTransform {
        match self.load(source) {
            Ok(t) => {
                log::info!("[camera:{}] loaded perspective transform", source);
                t
            }
            Err(e) => {
                log::warn!(
                    "[camera:{}] {}; using identity transform",
                    source,
                    e
                );
                PerspectiveTransform::identity()
            }
        }
    }

    /// Persist a transform for `source`.
    pub fn save(&self, source: &str, rows: [[f64; 3]; 3]) -> Result<PathBuf, TransformError> {
        let path = self
            .path_for(source)
            .ok_or_else(|| TransformError::NotFound(PathBuf::from(format!("{}.yaml", source))))?;
        let yaml = serde_yaml::to_string(&CalibrationFile { matrix: rows }).map_err(|e| {
            TransformError::Parse {
                path: path.clone(),
                message: e.to_string(),
            }
        })?;
        std::fs::write(&path, yaml).map_err(|e| TransformError::Io {
            path: path.clone(),
            message: e.to_string(),
        })?;
        Ok(path)
    }
}

fn load_file(path: &Path) -> Result<PerspectiveTransform, TransformError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TransformError::NotFound(path.to_path_buf()))
        }
        Err(e) => {
            return Err(TransformError::Io {
                path: path.to_path_buf(),
                message: e.to_string(),
            })
        }
    };
    let file: CalibrationFile =
        serde_yaml::from_str(&contents).map_err(|e| TransformError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
    PerspectiveTransform::from_rows(file.matrix)
}
