//! Calibration data: per-mode intrinsics and per-stream poses.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::traits::Stream;

/// 3x3 matrix stored row by row.
pub type Mat3 = [[f32; 3]; 3];

const IDENTITY: Mat3 = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

/// Lens distortion model of an [`Intrinsics`] entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DistortionModel {
    /// Rectilinear images, no distortion.
    #[default]
    None,
    /// Brown-Conrady with tangential terms applied to the distorted point.
    ModifiedBrownConrady,
    /// Inverse Brown-Conrady, undistorting on projection.
    InverseBrownConrady,
}

/// Optical parameters of one stream mode.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Intrinsics {
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    /// Principal point, x.
    pub ppx: f32,
    /// Principal point, y.
    pub ppy: f32,
    /// Focal length in pixels, x.
    pub fx: f32,
    /// Focal length in pixels, y.
    pub fy: f32,
    /// Distortion model.
    #[serde(default)]
    pub model: DistortionModel,
    /// Distortion coefficients.
    #[serde(default)]
    pub coeffs: [f32; 5],
}

/// Rigid pose of a stream's coordinate frame relative to the device.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Pose {
    /// Rotation, row by row.
    pub orientation: Mat3,
    /// Translation in meters.
    pub position: [f32; 3],
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Pose {
    /// The identity transform.
    pub const IDENTITY: Self = Self {
        orientation: IDENTITY,
        position: [0.0; 3],
    };

    /// Inverse rigid transform.
    #[must_use]
    pub fn inverse(&self) -> Self {
        let orientation = transpose(&self.orientation);
        let moved = mul_vec(&orientation, &self.position);
        Self {
            orientation,
            position: moved.map(|v| -v),
        }
    }

    /// `self * other`: apply `other` first, then `self`.
    #[must_use]
    pub fn compose(&self, other: &Self) -> Self {
        let mut position = mul_vec(&self.orientation, &other.position);
        for (p, t) in position.iter_mut().zip(self.position) {
            *p += t;
        }
        Self {
            orientation: mul(&self.orientation, &other.orientation),
            position,
        }
    }

    /// Map a point through this transform.
    pub fn transform(&self, point: [f32; 3]) -> [f32; 3] {
        self.compose(&Self {
            orientation: IDENTITY,
            position: point,
        })
        .position
    }
}

#[allow(clippy::indexing_slicing)]
fn transpose(m: &Mat3) -> Mat3 {
    std::array::from_fn(|r| std::array::from_fn(|c| m[c][r]))
}

#[allow(clippy::indexing_slicing)]
fn mul(a: &Mat3, b: &Mat3) -> Mat3 {
    std::array::from_fn(|r| std::array::from_fn(|c| (0..3).map(|k| a[r][k] * b[k][c]).sum()))
}

fn mul_vec(m: &Mat3, v: &[f32; 3]) -> [f32; 3] {
    m.map(|row| row.iter().zip(v).map(|(a, b)| a * b).sum())
}

/// Relative transform between two stream coordinate frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extrinsics {
    /// Rotation, column-major.
    pub rotation: [f32; 9],
    /// Translation in meters.
    pub translation: [f32; 3],
}

impl Extrinsics {
    /// Rebuild the pose this transform was derived from.
    pub fn to_pose(&self) -> Pose {
        Pose {
            orientation: std::array::from_fn(|r| {
                std::array::from_fn(|c| self.rotation.get(c * 3 + r).copied().unwrap_or(0.0))
            }),
            position: self.translation,
        }
    }

    /// Chain two transforms: apply `other` first, then `self`.
    #[must_use]
    pub fn compose(&self, other: &Self) -> Self {
        Self::from(self.to_pose().compose(&other.to_pose()))
    }

    /// Whether this is the identity transform within `tolerance`.
    pub fn is_identity(&self, tolerance: f32) -> bool {
        let identity = Self::from(Pose::IDENTITY);
        self.rotation
            .iter()
            .chain(&self.translation)
            .zip(identity.rotation.iter().chain(&identity.translation))
            .all(|(a, b)| (a - b).abs() <= tolerance)
    }
}

impl From<Pose> for Extrinsics {
    fn from(pose: Pose) -> Self {
        let mut rotation = [0.0; 9];
        for (c, column) in rotation.chunks_exact_mut(3).enumerate() {
            for (r, value) in column.iter_mut().enumerate() {
                *value = pose
                    .orientation
                    .get(r)
                    .and_then(|row| row.get(c))
                    .copied()
                    .unwrap_or(0.0);
            }
        }
        Self {
            rotation,
            translation: pose.position,
        }
    }
}

const fn default_depth_scale() -> f32 {
    0.001
}

/// Everything fetched from the camera's calibration store.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Calibration {
    /// Intrinsics, indexed by `StreamMode::intrinsics_index`.
    #[serde(default)]
    pub intrinsics: Vec<Intrinsics>,
    /// Pose of each stream's coordinate frame.
    #[serde(default)]
    pub stream_poses: BTreeMap<Stream, Pose>,
    /// Meters per depth unit.
    #[serde(default = "default_depth_scale")]
    pub depth_scale: f32,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            intrinsics: Vec::new(),
            stream_poses: BTreeMap::new(),
            depth_scale: default_depth_scale(),
        }
    }
}

impl Calibration {
    /// Relative transform from `from`'s frame to `to`'s frame.
    pub fn extrinsics(&self, from: &Pose, to: &Pose) -> Extrinsics {
        Extrinsics::from(from.inverse().compose(to))
    }
}
