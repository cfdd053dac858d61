//! Rigid placements and the `(x,y,z)` / `(x,y,z,w)` argument forms.
//!
//! A [`Placement`] is kept in the same shape an `AXIS2_PLACEMENT_3D` has on
//! disk (location, axis, reference direction) so that untouched placements
//! survive a parse/serialize cycle bit for bit. Quaternions are derived on
//! demand for the graph wire format.

use glam::{DMat3, DQuat, DVec3};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Components closer than this to 0 or ±1 are snapped when a frame is rebuilt
/// from a quaternion.
const SNAP_EPSILON: f64 = 1e-12;

/// Rigid transform from local to parent coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub location: [f64; 3],
    pub axis: [f64; 3],
    pub ref_direction: [f64; 3],
}

impl Default for Placement {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Placement {
    pub const IDENTITY: Placement = Placement {
        location: [0.0, 0.0, 0.0],
        axis: [0.0, 0.0, 1.0],
        ref_direction: [1.0, 0.0, 0.0],
    };

    pub fn new(location: [f64; 3], axis: Option<[f64; 3]>, ref_direction: Option<[f64; 3]>) -> Self {
        Self {
            location,
            axis: axis.unwrap_or(Self::IDENTITY.axis),
            ref_direction: ref_direction.unwrap_or(Self::IDENTITY.ref_direction),
        }
    }

    pub fn from_translation_rotation(translation: DVec3, rotation: DQuat) -> Self {
        let rotation = rotation.normalize();
        Self {
            location: translation.to_array(),
            axis: snap(rotation * DVec3::Z),
            ref_direction: snap(rotation * DVec3::X),
        }
    }

    pub fn translation(&self) -> DVec3 {
        DVec3::from_array(self.location)
    }

    /// Orthonormal frame `[x, y, z]` as columns.
    pub fn frame(&self) -> DMat3 {
        let z = DVec3::from_array(self.axis).try_normalize().unwrap_or(DVec3::Z);
        let r = DVec3::from_array(self.ref_direction);
        let x = (r - z * r.dot(z))
            .try_normalize()
            .unwrap_or_else(|| z.any_orthonormal_vector());
        let y = z.cross(x);
        DMat3::from_cols(x, y, z)
    }

    pub fn rotation(&self) -> DQuat {
        DQuat::from_mat3(&self.frame()).normalize()
    }

    /// `self * other`: `other` is applied first.
    pub fn compose(&self, other: &Placement) -> Self {
        let frame = self.frame();
        Self {
            location: (self.translation() + frame * other.translation()).to_array(),
            axis: snap(frame * DVec3::from_array(other.axis)),
            ref_direction: snap(frame * DVec3::from_array(other.ref_direction)),
        }
    }

    pub fn inverse(&self) -> Self {
        let inv = self.frame().transpose();
        Self {
            location: (-(inv * self.translation())).to_array(),
            axis: snap(inv * DVec3::Z),
            ref_direction: snap(inv * DVec3::X),
        }
    }

    pub fn is_identity(&self) -> bool {
        let close = |a: &[f64; 3], b: &[f64; 3]| a.iter().zip(b).all(|(x, y)| (x - y).abs() <= SNAP_EPSILON);
        close(&self.location, &Self::IDENTITY.location)
            && close(&self.axis, &Self::IDENTITY.axis)
            && close(&self.ref_direction, &Self::IDENTITY.ref_direction)
    }

    /// `[tx, ty, tz, qx, qy, qz, qw]`
    pub fn to_wire(&self) -> [f64; 7] {
        let t = self.location;
        let q = self.rotation();
        [t[0], t[1], t[2], q.x, q.y, q.z, q.w]
    }

    pub fn from_wire(wire: &[f64]) -> Option<Self> {
        if wire.len() != 7 {
            return None;
        }
        let translation = DVec3::new(wire[0], wire[1], wire[2]);
        let rotation = DQuat::from_xyzw(wire[3], wire[4], wire[5], wire[6]);
        if !translation.is_finite() || !rotation.is_finite() || rotation.length_squared() == 0.0 {
            return None;
        }
        Some(Self::from_translation_rotation(translation, rotation))
    }
}

fn snap(v: DVec3) -> [f64; 3] {
    v.to_array().map(|c| {
        if c.abs() < SNAP_EPSILON {
            0.0
        } else if (c.abs() - 1.0).abs() < SNAP_EPSILON {
            c.signum()
        } else {
            c
        }
    })
}

// ============================================================================
// Argument forms
// ============================================================================

/// Error parsing a `(x,y,z)` or `(x,y,z,w)` tuple.
#[derive(Debug, Error, PartialEq)]
pub enum TupleParseError {
    #[error("expected {expected} comma-separated numbers in parentheses, got '{input}'")]
    Arity { expected: usize, input: String },

    #[error("invalid number '{0}'")]
    Number(String),
}

fn parse_tuple<const N: usize>(input: &str) -> Result<[f64; N], TupleParseError> {
    let arity = || TupleParseError::Arity {
        expected: N,
        input: input.to_string(),
    };
    let trimmed = input.trim();
    let inner = trimmed
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .unwrap_or(trimmed);
    let parts: Vec<&str> = inner.split(',').map(str::trim).collect();
    if parts.len() != N {
        return Err(arity());
    }
    let mut out = [0.0; N];
    for (slot, part) in out.iter_mut().zip(parts) {
        *slot = part
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| TupleParseError::Number(part.to_string()))?;
    }
    Ok(out)
}

/// Target position of a part, `(x,y,z)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

}

impl FromStr for Position {
    type Err = TupleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let [x, y, z] = parse_tuple::<3>(s)?;
        Ok(Self { x, y, z })
    }
}

/// Rotation in `(x,y,z,w)` order; not necessarily normalized.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

impl Quaternion {
    pub const IDENTITY: Quaternion = Quaternion {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        w: 1.0,
    };

    pub fn new(x: f64, y: f64, z: f64, w: f64) -> Self {
        Self { x, y, z, w }
    }

    pub fn norm(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z + self.w * self.w).sqrt()
    }

    /// Normalize; `None` if the result is not unit length within `tolerance`.
    pub fn to_unit(self, tolerance: f64) -> Option<DQuat> {
        let norm = self.norm();
        if !norm.is_finite() || norm <= f64::EPSILON {
            return None;
        }
        let q = DQuat::from_xyzw(self.x / norm, self.y / norm, self.z / norm, self.w / norm);
        if (q.length() - 1.0).abs() > tolerance {
            return None;
        }
        Some(q)
    }
}

impl FromStr for Quaternion {
    type Err = TupleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let [x, y, z, w] = parse_tuple::<4>(s)?;
        Ok(Self { x, y, z, w })
    }
}
