use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::{LedControlError, Result};

/// Normalized position of one LED, each axis in [0, 1).
pub type LedPosition = [f64; 3];

/// Describes where each LED sits in space.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "points", rename_all = "lowercase")]
pub enum Mapping {
    /// LEDs evenly spaced along x: `x = i / count`.
    #[default]
    Line,
    /// One raw coordinate per LED in arbitrary units.
    Points(Vec<[f64; 3]>),
}

impl Mapping {
    /// Parses a JSON array of `[x, y]` or `[x, y, z]` coordinates.
    pub fn from_json_points(json: &str) -> Result<Self> {
        let raw: Vec<Vec<f64>> = serde_json::from_str(json)
            .map_err(|e| LedControlError::InvalidMapping(e.to_string()))?;
        let points = raw
            .into_iter()
            .enumerate()
            .map(|(index, point)| match point.as_slice() {
                [x, y] => Ok([*x, *y, 0.0]),
                [x, y, z] => Ok([*x, *y, *z]),
                other => Err(LedControlError::InvalidMapping(format!(
                    "point {index} has {} coordinates, expected 2 or 3",
                    other.len()
                ))),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Mapping::Points(points))
    }
}

/// Owns the normalized LED positions. Immutable after construction.
#[derive(Debug, Clone)]
pub struct SpatialMapper {
    positions: Vec<LedPosition>,
}

impl SpatialMapper {
    pub fn new(led_count: usize, mapping: &Mapping) -> Result<Self> {
        if led_count == 0 {
            return Err(LedControlError::InvalidMapping(
                "mapping requires at least one LED".to_string(),
            ));
        }

        let positions = match mapping {
            Mapping::Line => (0..led_count)
                .map(|i| [i as f64 / led_count as f64, 0.0, 0.0])
                .collect(),
            Mapping::Points(points) => {
                if points.len() != led_count {
                    return Err(LedControlError::InvalidMapping(format!(
                        "{} points supplied for {led_count} LEDs",
                        points.len()
                    )));
                }
                if points.iter().flatten().any(|v| !v.is_finite()) {
                    return Err(LedControlError::InvalidMapping(
                        "coordinates must be finite".to_string(),
                    ));
                }
                normalize_points(points)
            }
        };

        Ok(Self { positions })
    }

    pub fn led_count(&self) -> usize {
        self.positions.len()
    }

    pub fn positions(&self) -> &[LedPosition] {
        &self.positions
    }

    /// Positions of `range` divided by `scale` and wrapped into [0, 1).
    ///
    /// A zero scale collapses every position to the origin.
    pub fn scaled_positions(&self, range: Range<usize>, scale: f64) -> Vec<LedPosition> {
        let end = range.end.min(self.positions.len());
        let start = range.start.min(end);
        let slice = &self.positions[start..end];

        if scale == 0.0 || !scale.is_finite() {
            return vec![[0.0; 3]; slice.len()];
        }

        slice
            .iter()
            .map(|p| {
                [
                    wrap_unit(p[0] / scale),
                    wrap_unit(p[1] / scale),
                    wrap_unit(p[2] / scale),
                ]
            })
            .collect()
    }
}

fn wrap_unit(value: f64) -> f64 {
    let wrapped = value.rem_euclid(1.0);
    if wrapped >= 1.0 {
        0.0
    } else {
        wrapped
    }
}

/// Joint normalization: one min and one range shared by all three axes so
/// the aspect ratio of the layout is preserved.
fn normalize_points(points: &[[f64; 3]]) -> Vec<LedPosition> {
    let min = points
        .iter()
        .flatten()
        .copied()
        .fold(f64::INFINITY, f64::min);
    let max = points
        .iter()
        .flatten()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);
    let range = max - min;

    if range <= 0.0 {
        return vec![[0.0; 3]; points.len()];
    }

    points
        .iter()
        .map(|p| {
            [
                (p[0] - min) / range * 0.999,
                (p[1] - min) / range * 0.999,
                (p[2] - min) / range * 0.999,
            ]
        })
        .collect()
}
