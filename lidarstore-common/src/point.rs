//! The point record shared by all stages of the pipeline.

use crate::geometry::PositionGlobal;
use nalgebra::{point, Vector3};
use serde::{Deserialize, Serialize};

/// Well known classification codes (ASPRS LAS specification).
pub mod classification {
    pub const NEVER_CLASSIFIED: u8 = 0;
    pub const UNASSIGNED: u8 = 1;
    pub const GROUND: u8 = 2;
}

/// One LiDAR sample.
///
/// The position is in world coordinates. Scale and offset of the source file are applied once
/// at import, after that the position is only ever quantized by the coordinate system of the
/// dataset it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointRecord {
    pub position: PositionGlobal,
    pub intensity: u16,
    pub scan_angle: i16,
    pub return_number: u8,
    pub number_of_returns: u8,
    pub classification: u8,
    pub user_data: u8,
    pub gps_time: Option<f64>,

    /// Rgb color, each channel in `[0, 1]`.
    pub color: Vector3<f32>,

    /// Derived per-point scalar. `None` until some analysis pass computed it.
    pub descriptor: Option<f32>,
    pub management_status: u32,
    pub species: u32,
    pub layer: u32,
}

impl PointRecord {
    /// A point at the given position with all attributes zeroed.
    pub fn at(position: PositionGlobal) -> Self {
        PointRecord {
            position,
            ..Default::default()
        }
    }
}

impl Default for PointRecord {
    fn default() -> Self {
        PointRecord {
            position: point![0.0, 0.0, 0.0],
            intensity: 0,
            scan_angle: 0,
            return_number: 0,
            number_of_returns: 0,
            classification: classification::NEVER_CLASSIFIED,
            user_data: 0,
            gps_time: None,
            color: Vector3::zeros(),
            descriptor: None,
            management_status: 0,
            species: 0,
            layer: 0,
        }
    }
}
