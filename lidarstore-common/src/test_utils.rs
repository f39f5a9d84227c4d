//! Shared helpers for the unit tests.

use crate::geometry::bounding_box::Aabb;
use crate::geometry::coordinate_system::CoordinateSystem;
use crate::index::builder::IndexBuilder;
use crate::index::settings::IndexSettings;
use crate::index::spatial_index::SpatialIndexFile;
use crate::point::PointRecord;
use las::Write as _;
use nalgebra::{point, vector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};

/// The `[0,100]^3` box used by most tests.
pub fn test_bounds() -> Aabb {
    Aabb::new(point![0.0, 0.0, 0.0], point![100.0, 100.0, 100.0])
}

/// Points with random attributes, uniformly distributed in [test_bounds].
/// Positions are quantized to the given coordinate system.
pub fn random_points(n: usize, seed: u64, cs: &CoordinateSystem) -> Vec<PointRecord> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            let position = point![
                rng.gen_range(0.0..=100.0),
                rng.gen_range(0.0..=100.0),
                rng.gen_range(0.0..=100.0)
            ];
            PointRecord {
                position: cs.quantize(&position).unwrap(),
                intensity: rng.gen_range(0..1000),
                scan_angle: rng.gen_range(-90..=90),
                return_number: rng.gen_range(1..=3),
                number_of_returns: 3,
                classification: rng.gen_range(0..6),
                user_data: rng.gen(),
                gps_time: rng.gen_bool(0.8).then(|| rng.gen_range(0.0..1000.0)),
                color: vector![rng.gen(), rng.gen(), rng.gen()],
                descriptor: rng.gen_bool(0.5).then(|| rng.gen_range(0.0..1.0)),
                management_status: rng.gen_range(0..3),
                species: rng.gen_range(0..4),
                layer: rng.gen_range(0..2),
            }
        })
        .collect()
}

/// Settings with the default scale, splitting nodes above `max_points_per_leaf` points.
pub fn test_settings(max_points_per_leaf: usize) -> IndexSettings {
    IndexSettings {
        max_points_per_leaf,
        max_tree_depth: 10,
        buffer_size_bytes: 16 * 1024 * 1024,
        ..Default::default()
    }
}

/// Builds an index over the given points into `<dir>/<name>`.
pub fn build_index(
    dir: &Path,
    name: &str,
    points: &[PointRecord],
    settings: IndexSettings,
) -> (PathBuf, SpatialIndexFile) {
    let index_dir = dir.join(name);
    let index = IndexBuilder::new(settings)
        .build(points.iter().cloned(), test_bounds(), &index_dir)
        .unwrap();
    (index_dir, index)
}

/// Writes a las file (format 3) containing the given points.
pub fn write_las_file(path: &Path, points: &[PointRecord]) {
    let mut builder = las::Builder::from((1, 2));
    builder.point_format = las::point::Format::new(3).unwrap();
    let header = builder.into_header().unwrap();
    let mut writer = las::Writer::from_path(path, header).unwrap();
    for p in points {
        let color = p.color.map(|c| (c * u16::MAX as f32) as u16);
        writer
            .write(las::Point {
                x: p.position.x,
                y: p.position.y,
                z: p.position.z,
                intensity: p.intensity,
                return_number: p.return_number,
                number_of_returns: p.number_of_returns,
                classification: las::point::Classification::new(p.classification).unwrap(),
                user_data: p.user_data,
                gps_time: Some(p.gps_time.unwrap_or(0.0)),
                color: Some(las::Color::new(color.x, color.y, color.z)),
                ..Default::default()
            })
            .unwrap();
    }
    writer.close().unwrap();
}
