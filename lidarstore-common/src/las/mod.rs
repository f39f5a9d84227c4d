//! Reading of LAS/LAZ input files.

use crate::geometry::bounding_box::Aabb;
use crate::point::PointRecord;
use las::{Read, Reader};
use nalgebra::{point, vector, Vector3};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum ReadLasError {
    #[error(transparent)]
    Io(Arc<std::io::Error>), // std::io:::Error is not Clone. Wrapping it in an Arc allows us to make ReadLasError Clone.
    #[error("Bad LAS file: {desc}")]
    FileFormat { desc: String },
}

impl From<std::io::Error> for ReadLasError {
    fn from(e: std::io::Error) -> Self {
        ReadLasError::Io(Arc::new(e))
    }
}

impl From<las::Error> for ReadLasError {
    fn from(e: las::Error) -> Self {
        match e {
            las::Error::Io(io) => ReadLasError::Io(Arc::new(io)),
            _ => ReadLasError::FileFormat {
                desc: format!("{}", e),
            },
        }
    }
}

/// The parts of the las header that are relevant for indexing.
#[derive(Debug, Clone, PartialEq)]
pub struct LasHeaderInfo {
    pub nr_points: u64,
    pub bounds: Aabb,
    pub scale: Vector3<f64>,
    pub offset: Vector3<f64>,
    pub point_format: u8,
}

/// Streams the points of a las or laz file.
pub struct LasPointSource {
    reader: Reader<'static>,
    header: LasHeaderInfo,
}

impl LasPointSource {
    pub fn open(path: &Path) -> Result<Self, ReadLasError> {
        let reader = Reader::from_path(path)?;
        let header = reader.header();
        let bounds = header.bounds();
        let transforms = header.transforms();
        let point_format = header.point_format().to_u8()?;
        let header = LasHeaderInfo {
            nr_points: header.number_of_points(),
            bounds: Aabb::new(
                point![bounds.min.x, bounds.min.y, bounds.min.z],
                point![bounds.max.x, bounds.max.y, bounds.max.z],
            ),
            scale: vector![
                transforms.x.scale,
                transforms.y.scale,
                transforms.z.scale
            ],
            offset: vector![
                transforms.x.offset,
                transforms.y.offset,
                transforms.z.offset
            ],
            point_format,
        };
        Ok(LasPointSource { reader, header })
    }

    pub fn header(&self) -> &LasHeaderInfo {
        &self.header
    }
}

impl Iterator for LasPointSource {
    type Item = Result<PointRecord, ReadLasError>;

    fn next(&mut self) -> Option<Self::Item> {
        let point = self.reader.read()?;
        Some(point.map(convert_point).map_err(ReadLasError::from))
    }
}

fn convert_point(point: las::Point) -> PointRecord {
    let color = match point.color {
        Some(c) => vector![c.red, c.green, c.blue].map(|v| v as f32 / u16::MAX as f32),
        None => Vector3::zeros(),
    };
    PointRecord {
        position: point![point.x, point.y, point.z],
        intensity: point.intensity,
        scan_angle: point.scan_angle.round() as i16,
        return_number: point.return_number,
        number_of_returns: point.number_of_returns,
        classification: u8::from(point.classification),
        user_data: point.user_data,
        gps_time: point.gps_time,
        color,
        descriptor: None,
        management_status: 0,
        species: 0,
        layer: 0,
    }
}
