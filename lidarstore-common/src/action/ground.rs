//! Actions based on the height of points above the lowest point in their grid cell.

use super::grid::CellGrid;
use super::ActionError;
use crate::editor::EditorState;
use crate::geometry::bounding_box::Aabb;
use crate::index::TileKey;
use crate::point::{classification, PointRecord};
use crate::span;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Find the lowest point in each cell.
    Collect,
    /// Update the points.
    Apply,
    Flush,
    Done,
}

/// Two passes over all pages of the active datasets. The first one finds the lowest point in each
/// grid cell, the second one updates every point based on the lowest point of its cell.
/// Each call to [CellPasses::next] processes one page.
#[derive(Debug)]
pub struct CellPasses {
    tiles: Vec<TileKey>,
    grid: CellGrid,
    phase: Phase,
    pos: usize,
    nr_changed: u64,
}

impl CellPasses {
    fn prepare(state: &EditorState, cell_points: usize) -> Result<Self, ActionError> {
        let datasets = state.active_datasets();
        if datasets.is_empty() {
            return Err(ActionError::NoDatasets);
        }
        let mut bounds = Aabb::empty();
        let mut nr_points = 0;
        let mut tiles = Vec::new();
        for (dataset, index) in &datasets {
            if index.nr_points() == 0 {
                continue;
            }
            bounds.extend(&index.bounds().min);
            bounds.extend(&index.bounds().max);
            nr_points += index.nr_points();
            tiles.extend(
                index
                    .leaves()
                    .filter(|leaf| leaf.page_ref().is_some_and(|p| p.nr_points > 0))
                    .map(|leaf| TileKey::new(*dataset, leaf.id)),
            );
        }
        let grid = CellGrid::new(&bounds, nr_points, cell_points);
        debug!(
            "Cell grid: {} cells of size {:.3}, {} pages.",
            grid.nr_cells(),
            grid.cell_size(),
            tiles.len()
        );
        Ok(CellPasses {
            tiles,
            grid,
            phase: Phase::Collect,
            pos: 0,
            nr_changed: 0,
        })
    }

    fn next(
        &mut self,
        state: &mut EditorState,
        mut update: impl FnMut(f64, &mut PointRecord),
    ) -> Result<(), ActionError> {
        match self.phase {
            Phase::Collect => {
                let _span = span!("CellPasses::next: collect");
                if let Some(tile) = self.tiles.get(self.pos) {
                    let page = state.cache_mut().get(tile)?;
                    for position in &page.columns().position {
                        self.grid.insert(position);
                    }
                    self.pos += 1;
                }
                if self.pos >= self.tiles.len() {
                    self.phase = Phase::Apply;
                    self.pos = 0;
                }
            }
            Phase::Apply => {
                let _span = span!("CellPasses::next: apply");
                if let Some(tile) = self.tiles.get(self.pos) {
                    let page = state.cache_mut().get_mut(tile)?;
                    for i in 0..page.len() {
                        let mut point = page.point(i);
                        let Some(min_z) = self.grid.min_z(&point.position) else {
                            continue;
                        };
                        update(min_z, &mut point);
                        if page.update_point(i, &point) {
                            self.nr_changed += 1;
                        }
                    }
                    self.pos += 1;
                }
                if self.pos >= self.tiles.len() {
                    self.phase = Phase::Flush;
                }
            }
            Phase::Flush => {
                let nr_pages = state.cache_mut().flush()?;
                info!(
                    "Changed {} points, wrote {nr_pages} pages.",
                    self.nr_changed
                );
                self.phase = Phase::Done;
            }
            Phase::Done => {}
        }
        Ok(())
    }

    fn progress(&self) -> f64 {
        let pages = self.tiles.len().max(1) as f64;
        match self.phase {
            Phase::Collect => 0.5 * self.pos as f64 / pages,
            Phase::Apply => 0.5 + 0.5 * self.pos as f64 / pages,
            Phase::Flush | Phase::Done => 1.0,
        }
    }

    fn is_finished(&self) -> bool {
        self.phase == Phase::Done
    }

    pub fn nr_changed(&self) -> u64 {
        self.nr_changed
    }
}

fn parse_parameters<T: Default + for<'de> Deserialize<'de>>(parameters: Value) -> Result<T, ActionError> {
    if parameters.is_null() {
        Ok(T::default())
    } else {
        Ok(serde_json::from_value(parameters)?)
    }
}

fn check_cell_points(cell_points: usize) -> Result<(), ActionError> {
    if cell_points == 0 {
        return Err(ActionError::InvalidParameter(
            "cell_points must be at least 1".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GroundParameters {
    /// Average number of points per grid cell.
    pub cell_points: usize,

    /// Max height above the lowest point of the cell, for a point to be ground.
    pub ground_threshold: f64,
}

impl Default for GroundParameters {
    fn default() -> Self {
        GroundParameters {
            cell_points: 1000,
            ground_threshold: 0.5,
        }
    }
}

/// Classifies points close to the lowest point of their cell as ground.
/// Points that were ground before, but are above the threshold now, become unassigned.
#[derive(Debug, Default)]
pub struct GroundClassification {
    parameters: GroundParameters,
    passes: Option<CellPasses>,
}

impl GroundClassification {
    pub fn parameters(&self) -> &GroundParameters {
        &self.parameters
    }

    pub(super) fn apply_parameters(&mut self, parameters: Value, state: &EditorState) -> Result<(), ActionError> {
        let parameters: GroundParameters = parse_parameters(parameters)?;
        check_cell_points(parameters.cell_points)?;
        if parameters.ground_threshold.is_nan() || parameters.ground_threshold < 0.0 {
            return Err(ActionError::InvalidParameter(
                "ground_threshold must not be negative".to_string(),
            ));
        }
        self.passes = Some(CellPasses::prepare(state, parameters.cell_points)?);
        self.parameters = parameters;
        Ok(())
    }

    pub(super) fn next(&mut self, state: &mut EditorState) -> Result<(), ActionError> {
        let threshold = self.parameters.ground_threshold;
        let passes = self.passes.as_mut().ok_or(ActionError::NotPrepared)?;
        passes.next(state, |min_z, point| {
            if point.position.z - min_z <= threshold {
                point.classification = classification::GROUND;
            } else if point.classification == classification::GROUND {
                point.classification = classification::UNASSIGNED;
            }
        })
    }

    pub fn progress(&self) -> f64 {
        self.passes.as_ref().map_or(0.0, CellPasses::progress)
    }

    pub fn is_finished(&self) -> bool {
        self.passes.as_ref().is_some_and(CellPasses::is_finished)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DescriptorParameters {
    pub cell_points: usize,
}

impl Default for DescriptorParameters {
    fn default() -> Self {
        DescriptorParameters { cell_points: 1000 }
    }
}

/// Sets the descriptor of every point to its height above the lowest point of its cell.
#[derive(Debug, Default)]
pub struct ElevationDescriptor {
    parameters: DescriptorParameters,
    passes: Option<CellPasses>,
}

impl ElevationDescriptor {
    pub fn parameters(&self) -> &DescriptorParameters {
        &self.parameters
    }

    pub(super) fn apply_parameters(&mut self, parameters: Value, state: &EditorState) -> Result<(), ActionError> {
        let parameters: DescriptorParameters = parse_parameters(parameters)?;
        check_cell_points(parameters.cell_points)?;
        self.passes = Some(CellPasses::prepare(state, parameters.cell_points)?);
        self.parameters = parameters;
        Ok(())
    }

    pub(super) fn next(&mut self, state: &mut EditorState) -> Result<(), ActionError> {
        let passes = self.passes.as_mut().ok_or(ActionError::NotPrepared)?;
        passes.next(state, |min_z, point| {
            point.descriptor = Some((point.position.z - min_z) as f32)
        })
    }

    pub fn progress(&self) -> f64 {
        self.passes.as_ref().map_or(0.0, CellPasses::progress)
    }

    pub fn is_finished(&self) -> bool {
        self.passes.as_ref().is_some_and(CellPasses::is_finished)
    }
}
