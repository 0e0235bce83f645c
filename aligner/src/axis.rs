use glam::{DAffine3, DVec3};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter};

use crate::error::ConfigError;

/// Geometry of one atlas section as seen by the positioning view.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AtlasGeometry {
    /// Atlas voxel spacing along the slicing axis.
    pub pixel_size: f64,
    /// Width of one section in display units.
    pub extent_x: f64,
    /// Height of one section in display units.
    pub extent_y: f64,
    /// Atlas voxels the axis advances per positioning slot.
    pub step: u32,
}

impl Default for AtlasGeometry {
    fn default() -> Self {
        Self {
            pixel_size: 0.01,
            extent_x: 11.4,
            extent_y: 8.0,
            step: 1,
        }
    }
}

impl AtlasGeometry {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pixel_size.is_nan() || self.pixel_size <= 0.0 {
            return Err(ConfigError::InvalidGeometry(format!(
                "pixel size must be positive, got {}",
                self.pixel_size
            )));
        }
        if self.extent_x.is_nan()
            || self.extent_y.is_nan()
            || self.extent_x <= 0.0
            || self.extent_y <= 0.0
        {
            return Err(ConfigError::InvalidGeometry(format!(
                "extents must be positive, got {} x {}",
                self.extent_x, self.extent_y
            )));
        }
        if self.step == 0 {
            return Err(ConfigError::InvalidGeometry("step must be at least 1".into()));
        }
        Ok(())
    }

    /// Axis distance covered by one positioning slot.
    pub fn step_size(&self) -> f64 {
        self.pixel_size * self.step as f64
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display, EnumIter, Serialize, Deserialize,
)]
pub enum DisplayMode {
    /// Slices laid out side by side along the horizontal axis.
    #[default]
    Positioning,
    /// Slices overlaid on the atlas, only depth varies.
    Review,
}

impl DisplayMode {
    pub fn next(self) -> Self {
        match self {
            DisplayMode::Positioning => DisplayMode::Review,
            DisplayMode::Review => DisplayMode::Positioning,
        }
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display, EnumIter, Serialize, Deserialize,
)]
pub enum OverlapMode {
    NoOffset,
    FixedOffset,
    #[default]
    Staircase,
}

impl OverlapMode {
    pub fn from_index(index: usize) -> Self {
        match index {
            0 => OverlapMode::NoOffset,
            1 => OverlapMode::FixedOffset,
            _ => OverlapMode::Staircase,
        }
    }

    pub fn toggled(self) -> Self {
        match self {
            OverlapMode::NoOffset => OverlapMode::FixedOffset,
            OverlapMode::FixedOffset => OverlapMode::Staircase,
            OverlapMode::Staircase => OverlapMode::NoOffset,
        }
    }
}

/// Snaps to the pixel grid, truncating toward zero.
pub fn snap_to_pixel(axis_position: f64, pixel_size: f64) -> f64 {
    (axis_position / pixel_size).trunc() * pixel_size
}

/// Placement of a slice in the view for the given display mode.
pub fn placement(
    axis_position: f64,
    geometry: &AtlasGeometry,
    mode: DisplayMode,
    y_shift: u32,
) -> DVec3 {
    match mode {
        DisplayMode::Positioning => DVec3::new(
            positioning_x(axis_position, geometry),
            geometry.extent_y * y_shift as f64,
            0.0,
        ),
        DisplayMode::Review => DVec3::new(0.0, 0.0, axis_position),
    }
}

/// Placement as an affine to compose on top of the registered content.
pub fn placement_transform(
    axis_position: f64,
    geometry: &AtlasGeometry,
    mode: DisplayMode,
    y_shift: u32,
) -> DAffine3 {
    DAffine3::from_translation(placement(axis_position, geometry, mode, y_shift))
}

fn positioning_x(axis_position: f64, geometry: &AtlasGeometry) -> f64 {
    let snapped = snap_to_pixel(axis_position, geometry.pixel_size);
    snapped / geometry.pixel_size / geometry.step as f64 * geometry.extent_x
        + 0.5 * geometry.extent_x
}

/// Axis position under a horizontal display coordinate while dragging.
pub fn axis_position_from_display_x(x: f64, geometry: &AtlasGeometry) -> f64 {
    (x / geometry.extent_x).trunc() * geometry.step_size()
}

/// Vertical offset index of each slice, `positions` given in sorted order.
pub fn overlap_offsets(positions: &[f64], geometry: &AtlasGeometry, mode: OverlapMode) -> Vec<u32> {
    match mode {
        OverlapMode::NoOffset => vec![0; positions.len()],
        OverlapMode::FixedOffset => vec![1; positions.len()],
        OverlapMode::Staircase => {
            let mut offsets = Vec::with_capacity(positions.len());
            let mut stair_start = f64::NEG_INFINITY;
            let mut stair_index = 0u32;
            for &position in positions {
                let x = positioning_x(position, geometry);
                if x >= stair_start + geometry.extent_x {
                    stair_start = x;
                    stair_index = 0;
                    offsets.push(1);
                } else {
                    stair_index += 1;
                    offsets.push(1 + stair_index);
                }
            }
            offsets
        }
    }
}
