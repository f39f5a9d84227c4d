//! Binary encoding of pages and of single point records.
//!
//!  # Page format
//!
//! ## Header
//!
//!  - field 1, str, 16 bytes: magic number. This is always the fixed string "lidarstore page\0"
//!  - field 2, u8, 1 byte: version number. Currently, there is only version 1.
//!  - field 3, u64 le, 8 bytes: number of points
//!
//! ## Point data
//!
//! The attributes are stored column by column, each column holding one value per point
//! (all little endian, no padding):
//!
//!  - x, y, z: i32 each, in the coordinate system of the dataset.
//!    (all x values, then all y values, then all z values)
//!  - intensity: u16
//!  - scan angle: i16
//!  - return number: u8
//!  - number of returns: u8
//!  - classification: u8
//!  - user data: u8
//!  - gps time: f64, NaN if the point has no gps time
//!  - color: 3 x f32 per point (interleaved r, g, b)
//!  - descriptor: f32, NaN if unset
//!  - management status: u32
//!  - species: u32
//!  - layer: u32
//!
//! The encoded size only depends on the number of points (see [encoded_len]), which allows
//! edited pages to be written back to the same place in the page file.
//!
//!  # Record format
//!
//! Used for the temporary files of the index builder. Same attributes as above, but one point
//! after the other, with the position stored as 3 x f64 world coordinates.

use super::PointIoError;
use crate::geometry::coordinate_system::CoordinateSystem;
use crate::index::page::PageColumns;
use crate::point::PointRecord;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use nalgebra::{point, vector};
use std::io::{Read, Write};

const MAGIC_NUMBER: &[u8; 16] = b"lidarstore page\0";
const VERSION: u8 = 1;

/// Size of the page header in bytes.
pub const PAGE_HEADER_LEN: u64 = 16 + 1 + 8;

/// Size of one point in a page in bytes.
pub const PAGE_POINT_LEN: u64 = 3 * 4 + 2 + 2 + 4 + 8 + 3 * 4 + 4 + 3 * 4;

/// Size of one point in the record format in bytes.
pub const RECORD_LEN: u64 = 3 * 8 + 2 + 2 + 4 + 8 + 3 * 4 + 4 + 3 * 4;

/// Size of an encoded page with the given number of points.
pub fn encoded_len(nr_points: u64) -> u64 {
    PAGE_HEADER_LEN + nr_points * PAGE_POINT_LEN
}

/// Like [encoded_len], but `None` if the size does not fit into a u64.
pub fn checked_encoded_len(nr_points: u64) -> Option<u64> {
    nr_points
        .checked_mul(PAGE_POINT_LEN)?
        .checked_add(PAGE_HEADER_LEN)
}

pub fn write_page(
    columns: &PageColumns,
    coordinate_system: &CoordinateSystem,
    wr: &mut impl Write,
) -> Result<(), PointIoError> {
    let nr_points = columns.len();
    let mut buf = Vec::with_capacity(encoded_len(nr_points as u64) as usize);

    // header
    buf.write_all(MAGIC_NUMBER)?;
    buf.write_u8(VERSION)?;
    buf.write_u64::<LittleEndian>(nr_points as u64)?;

    // positions
    let local = columns
        .position
        .iter()
        .map(|p| coordinate_system.encode_position(p))
        .collect::<Result<Vec<_>, _>>()?;
    for axis in 0..3 {
        for p in &local {
            buf.write_i32::<LittleEndian>(p[axis])?;
        }
    }

    // attributes
    for v in &columns.intensity {
        buf.write_u16::<LittleEndian>(*v)?;
    }
    for v in &columns.scan_angle {
        buf.write_i16::<LittleEndian>(*v)?;
    }
    buf.write_all(&columns.return_number)?;
    buf.write_all(&columns.number_of_returns)?;
    buf.write_all(&columns.classification)?;
    buf.write_all(&columns.user_data)?;
    for v in &columns.gps_time {
        buf.write_f64::<LittleEndian>(v.unwrap_or(f64::NAN))?;
    }
    for c in &columns.color {
        buf.write_f32::<LittleEndian>(c.x)?;
        buf.write_f32::<LittleEndian>(c.y)?;
        buf.write_f32::<LittleEndian>(c.z)?;
    }
    for v in &columns.descriptor {
        buf.write_f32::<LittleEndian>(v.unwrap_or(f32::NAN))?;
    }
    for v in &columns.management_status {
        buf.write_u32::<LittleEndian>(*v)?;
    }
    for v in &columns.species {
        buf.write_u32::<LittleEndian>(*v)?;
    }
    for v in &columns.layer {
        buf.write_u32::<LittleEndian>(*v)?;
    }

    debug_assert_eq!(buf.len() as u64, encoded_len(nr_points as u64));
    wr.write_all(&buf)?;
    Ok(())
}

/// Decodes a page. `data` must contain exactly one encoded page.
pub fn read_page(
    data: &[u8],
    coordinate_system: &CoordinateSystem,
) -> Result<PageColumns, PointIoError> {
    let mut rd = data;

    // magic number
    let mut magic_buf = [0; 16];
    rd.read_exact(&mut magic_buf)?;
    if &magic_buf != MAGIC_NUMBER {
        return Err(PointIoError::DataFormat(
            "This is not a lidarstore page.".to_string(),
        ));
    }

    // version number
    let version = rd.read_u8()?;
    if version != VERSION {
        return Err(PointIoError::DataFormat(format!(
            "Wrong version: {version} (expected version {VERSION})"
        )));
    }

    // point count, checked against the data size before allocating anything
    let nr_points = rd.read_u64::<LittleEndian>()?;
    let expected_len = nr_points
        .checked_mul(PAGE_POINT_LEN)
        .and_then(|l| l.checked_add(PAGE_HEADER_LEN));
    if expected_len != Some(data.len() as u64) {
        return Err(PointIoError::DataFormat(format!(
            "Page of {nr_points} points has an unexpected size of {} bytes.",
            data.len()
        )));
    }
    let n = nr_points as usize;

    let mut xyz = vec![0; 3 * n];
    rd.read_i32_into::<LittleEndian>(&mut xyz)?;
    let position = (0..n)
        .map(|i| coordinate_system.decode_position(&point![xyz[i], xyz[n + i], xyz[2 * n + i]]))
        .collect();

    let mut intensity = vec![0; n];
    rd.read_u16_into::<LittleEndian>(&mut intensity)?;
    let mut scan_angle = vec![0; n];
    rd.read_i16_into::<LittleEndian>(&mut scan_angle)?;
    let mut return_number = vec![0; n];
    rd.read_exact(&mut return_number)?;
    let mut number_of_returns = vec![0; n];
    rd.read_exact(&mut number_of_returns)?;
    let mut classification = vec![0; n];
    rd.read_exact(&mut classification)?;
    let mut user_data = vec![0; n];
    rd.read_exact(&mut user_data)?;

    let mut gps_time = vec![0.0; n];
    rd.read_f64_into::<LittleEndian>(&mut gps_time)?;
    let gps_time = gps_time
        .into_iter()
        .map(|t| if t.is_nan() { None } else { Some(t) })
        .collect();

    let mut rgb = vec![0.0; 3 * n];
    rd.read_f32_into::<LittleEndian>(&mut rgb)?;
    let color = rgb.chunks_exact(3).map(|c| vector![c[0], c[1], c[2]]).collect();

    let mut descriptor = vec![0.0; n];
    rd.read_f32_into::<LittleEndian>(&mut descriptor)?;
    let descriptor = descriptor
        .into_iter()
        .map(|d| if d.is_nan() { None } else { Some(d) })
        .collect();

    let mut management_status = vec![0; n];
    rd.read_u32_into::<LittleEndian>(&mut management_status)?;
    let mut species = vec![0; n];
    rd.read_u32_into::<LittleEndian>(&mut species)?;
    let mut layer = vec![0; n];
    rd.read_u32_into::<LittleEndian>(&mut layer)?;

    Ok(PageColumns {
        position,
        intensity,
        scan_angle,
        return_number,
        number_of_returns,
        classification,
        user_data,
        gps_time,
        color,
        descriptor,
        management_status,
        species,
        layer,
    })
}

pub fn write_record(point: &PointRecord, wr: &mut impl Write) -> Result<(), PointIoError> {
    for axis in 0..3 {
        wr.write_f64::<LittleEndian>(point.position[axis])?;
    }
    wr.write_u16::<LittleEndian>(point.intensity)?;
    wr.write_i16::<LittleEndian>(point.scan_angle)?;
    wr.write_all(&[
        point.return_number,
        point.number_of_returns,
        point.classification,
        point.user_data,
    ])?;
    wr.write_f64::<LittleEndian>(point.gps_time.unwrap_or(f64::NAN))?;
    for channel in point.color.iter() {
        wr.write_f32::<LittleEndian>(*channel)?;
    }
    wr.write_f32::<LittleEndian>(point.descriptor.unwrap_or(f32::NAN))?;
    wr.write_u32::<LittleEndian>(point.management_status)?;
    wr.write_u32::<LittleEndian>(point.species)?;
    wr.write_u32::<LittleEndian>(point.layer)?;
    Ok(())
}

pub fn read_record(rd: &mut impl Read) -> Result<PointRecord, PointIoError> {
    let mut buf = [0; RECORD_LEN as usize];
    rd.read_exact(&mut buf)?;
    let mut rd = &buf[..];

    let x = rd.read_f64::<LittleEndian>()?;
    let y = rd.read_f64::<LittleEndian>()?;
    let z = rd.read_f64::<LittleEndian>()?;
    let intensity = rd.read_u16::<LittleEndian>()?;
    let scan_angle = rd.read_i16::<LittleEndian>()?;
    let return_number = rd.read_u8()?;
    let number_of_returns = rd.read_u8()?;
    let classification = rd.read_u8()?;
    let user_data = rd.read_u8()?;
    let gps_time = rd.read_f64::<LittleEndian>()?;
    let r = rd.read_f32::<LittleEndian>()?;
    let g = rd.read_f32::<LittleEndian>()?;
    let b = rd.read_f32::<LittleEndian>()?;
    let descriptor = rd.read_f32::<LittleEndian>()?;
    let management_status = rd.read_u32::<LittleEndian>()?;
    let species = rd.read_u32::<LittleEndian>()?;
    let layer = rd.read_u32::<LittleEndian>()?;

    Ok(PointRecord {
        position: point![x, y, z],
        intensity,
        scan_angle,
        return_number,
        number_of_returns,
        classification,
        user_data,
        gps_time: (!gps_time.is_nan()).then_some(gps_time),
        color: vector![r, g, b],
        descriptor: (!descriptor.is_nan()).then_some(descriptor),
        management_status,
        species,
        layer,
    })
}
