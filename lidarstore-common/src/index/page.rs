use super::TileKey;
use crate::geometry::bounding_box::Aabb;
use crate::geometry::PositionGlobal;
use crate::point::PointRecord;
use nalgebra::Vector3;

/// Attribute arrays of a page. All columns have the same length.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageColumns {
    pub position: Vec<PositionGlobal>,
    pub intensity: Vec<u16>,
    pub scan_angle: Vec<i16>,
    pub return_number: Vec<u8>,
    pub number_of_returns: Vec<u8>,
    pub classification: Vec<u8>,
    pub user_data: Vec<u8>,
    pub gps_time: Vec<Option<f64>>,
    pub color: Vec<Vector3<f32>>,
    pub descriptor: Vec<Option<f32>>,
    pub management_status: Vec<u32>,
    pub species: Vec<u32>,
    pub layer: Vec<u32>,
}

impl PageColumns {
    pub fn with_capacity(capacity: usize) -> Self {
        PageColumns {
            position: Vec::with_capacity(capacity),
            intensity: Vec::with_capacity(capacity),
            scan_angle: Vec::with_capacity(capacity),
            return_number: Vec::with_capacity(capacity),
            number_of_returns: Vec::with_capacity(capacity),
            classification: Vec::with_capacity(capacity),
            user_data: Vec::with_capacity(capacity),
            gps_time: Vec::with_capacity(capacity),
            color: Vec::with_capacity(capacity),
            descriptor: Vec::with_capacity(capacity),
            management_status: Vec::with_capacity(capacity),
            species: Vec::with_capacity(capacity),
            layer: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.position.len()
    }

    pub fn is_empty(&self) -> bool {
        self.position.is_empty()
    }

    pub fn push(&mut self, point: &PointRecord) {
        self.position.push(point.position);
        self.intensity.push(point.intensity);
        self.scan_angle.push(point.scan_angle);
        self.return_number.push(point.return_number);
        self.number_of_returns.push(point.number_of_returns);
        self.classification.push(point.classification);
        self.user_data.push(point.user_data);
        self.gps_time.push(point.gps_time);
        self.color.push(point.color);
        self.descriptor.push(point.descriptor);
        self.management_status.push(point.management_status);
        self.species.push(point.species);
        self.layer.push(point.layer);
    }

    /// Assembles the point at index `i`.
    /// Panics, if `i` is out of bounds.
    pub fn get(&self, i: usize) -> PointRecord {
        PointRecord {
            position: self.position[i],
            intensity: self.intensity[i],
            scan_angle: self.scan_angle[i],
            return_number: self.return_number[i],
            number_of_returns: self.number_of_returns[i],
            classification: self.classification[i],
            user_data: self.user_data[i],
            gps_time: self.gps_time[i],
            color: self.color[i],
            descriptor: self.descriptor[i],
            management_status: self.management_status[i],
            species: self.species[i],
            layer: self.layer[i],
        }
    }

    fn set(&mut self, i: usize, point: &PointRecord) {
        self.position[i] = point.position;
        self.intensity[i] = point.intensity;
        self.scan_angle[i] = point.scan_angle;
        self.return_number[i] = point.return_number;
        self.number_of_returns[i] = point.number_of_returns;
        self.classification[i] = point.classification;
        self.user_data[i] = point.user_data;
        self.gps_time[i] = point.gps_time;
        self.color[i] = point.color;
        self.descriptor[i] = point.descriptor;
        self.management_status[i] = point.management_status;
        self.species[i] = point.species;
        self.layer[i] = point.layer;
    }
}

/// The decoded, in-memory form of one leaf node's points.
#[derive(Debug, Clone)]
pub struct Page {
    key: TileKey,
    columns: PageColumns,
    dirty: bool,
}

impl Page {
    pub fn new(key: TileKey, columns: PageColumns) -> Self {
        Page {
            key,
            columns,
            dirty: false,
        }
    }

    pub fn from_points<'a>(key: TileKey, points: impl IntoIterator<Item = &'a PointRecord>) -> Self {
        let mut columns = PageColumns::default();
        for point in points {
            columns.push(point);
        }
        Page::new(key, columns)
    }

    pub fn key(&self) -> TileKey {
        self.key
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn columns(&self) -> &PageColumns {
        &self.columns
    }

    /// Mutable access to the attribute arrays. Marks the page as dirty.
    /// Changing the positions is not supported, since that could move points out of
    /// the node they are stored in.
    pub fn columns_mut(&mut self) -> &mut PageColumns {
        self.dirty = true;
        &mut self.columns
    }

    pub fn point(&self, i: usize) -> PointRecord {
        self.columns.get(i)
    }

    pub fn points(&self) -> impl Iterator<Item = PointRecord> + '_ {
        (0..self.len()).map(|i| self.columns.get(i))
    }

    /// Replaces the attributes of the point at index `i`.
    /// The position is kept, since points can not move between nodes.
    /// Returns true and marks the page dirty, if anything changed.
    pub fn update_point(&mut self, i: usize, point: &PointRecord) -> bool {
        let mut updated = point.clone();
        updated.position = self.columns.position[i];
        if self.columns.get(i) == updated {
            return false;
        }
        self.columns.set(i, &updated);
        self.dirty = true;
        true
    }

    pub fn bounds(&self) -> Aabb {
        let mut aabb = Aabb::empty();
        for position in &self.columns.position {
            aabb.extend(position);
        }
        aabb
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{DatasetId, NodeId};
    use crate::point::classification;
    use nalgebra::point;

    fn sample_page() -> Page {
        let points = (0..5)
            .map(|i| PointRecord {
                intensity: i * 10,
                ..PointRecord::at(point![i as f64, 0.0, 1.0])
            })
            .collect::<Vec<_>>();
        Page::from_points(TileKey::new(DatasetId(0), NodeId(3)), &points)
    }

    #[test]
    fn points_round_trip_through_columns() {
        let page = sample_page();
        assert_eq!(page.len(), 5);
        assert_eq!(page.point(2).intensity, 20);
        assert_eq!(page.point(4).position, point![4.0, 0.0, 1.0]);
        assert!(!page.is_dirty());
    }

    #[test]
    fn update_marks_dirty_only_on_change() {
        let mut page = sample_page();
        let unchanged = page.point(1);
        assert!(!page.update_point(1, &unchanged));
        assert!(!page.is_dirty());

        let mut changed = page.point(1);
        changed.classification = classification::GROUND;
        changed.position = point![100.0, 100.0, 100.0];
        assert!(page.update_point(1, &changed));
        assert!(page.is_dirty());
        assert_eq!(page.point(1).classification, classification::GROUND);
        assert_eq!(page.point(1).position, point![1.0, 0.0, 1.0]);
    }
}
