//! One-shot construction of an index directory from a stream of points.
//!
//! Points are bucketed into an octree top-down: all points go into the root bucket first,
//! and any bucket holding more than `max_points_per_leaf` points is split into its 8 octants
//! by streaming its points into 8 child buckets. Buckets keep their points in memory until the
//! configured buffer size is exhausted, after that new points are spilled to temporary files.
//!
//! Everything is written into a staging directory next to the destination, which is renamed
//! into place once the index is complete. A failed build leaves nothing behind.

use super::page::PageColumns;
use super::settings::{IndexSettingIoError, IndexSettings};
use super::spatial_index::{
    CorruptIndexError, IndexHeader, IndexOpenError, Node, NodeContent, PageRef, SpatialIndexFile,
};
use super::{NodeId, INDEX_FILE_NAME, PAGES_FILE_NAME};
use crate::geometry::bounding_box::Aabb;
use crate::geometry::coordinate_system::{CoordinateSystem, CoordinateSystemError};
use crate::geometry::PositionGlobal;
use crate::io::page_codec::{self, write_record};
use crate::io::{IoError, PointIoError};
use crate::las::{LasPointSource, ReadLasError};
use crate::point::PointRecord;
use crate::span;
use log::{debug, info};
use std::convert::Infallible;
use std::fmt::Display;
use std::fs::File;
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::{NamedTempFile, TempDir};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("The input bounds {0:?} have zero volume.")]
    DegenerateBounds(Aabb),

    #[error("Invalid build settings: {0}")]
    InvalidSettings(String),

    #[error("Could not allocate temporary storage: {0}")]
    TempFile(IoError),

    #[error("The point at {0:?} lies outside of the input bounds.")]
    PointOutOfBounds(PositionGlobal),

    #[error(transparent)]
    CoordinateSystem(#[from] CoordinateSystemError),

    #[error("Failed to read the input: {0}")]
    Input(String),

    #[error("Failed to write the index: {0}")]
    Write(#[from] PointIoError),

    #[error("Failed to write the index settings: {0}")]
    Settings(#[from] IndexSettingIoError),

    #[error("The index could not be committed to {path}: {source}")]
    Commit { path: PathBuf, source: IoError },

    #[error("The built index is inconsistent: {0}")]
    Inconsistent(#[from] CorruptIndexError),

    #[error("The built index could not be opened: {0}")]
    Reopen(#[from] IndexOpenError),
}

impl From<std::io::Error> for BuildError {
    fn from(e: std::io::Error) -> Self {
        BuildError::Write(e.into())
    }
}

impl From<ReadLasError> for BuildError {
    fn from(e: ReadLasError) -> Self {
        BuildError::Input(e.to_string())
    }
}

/// Statistics of a finished build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildSummary {
    pub nr_points: u64,
    pub nr_nodes: usize,
    pub nr_leaves: usize,
    pub max_depth: u8,
    pub nr_spilled_points: u64,
}

pub struct IndexBuilder {
    settings: IndexSettings,
}

impl IndexBuilder {
    pub fn new(settings: IndexSettings) -> Self {
        IndexBuilder { settings }
    }

    pub fn settings(&self) -> &IndexSettings {
        &self.settings
    }

    /// Builds an index over the given points into `output_dir`.
    /// An existing index at that location is replaced, once the new one is complete.
    pub fn build(
        &self,
        points: impl IntoIterator<Item = PointRecord>,
        bounds: Aabb,
        output_dir: &Path,
    ) -> Result<SpatialIndexFile, BuildError> {
        self.try_build(points.into_iter().map(Ok::<_, Infallible>), bounds, output_dir)
    }

    /// Like [IndexBuilder::build], but for fallible input. The first input error aborts the build.
    pub fn try_build<E: Display>(
        &self,
        points: impl IntoIterator<Item = Result<PointRecord, E>>,
        bounds: Aabb,
        output_dir: &Path,
    ) -> Result<SpatialIndexFile, BuildError> {
        let _span = span!("IndexBuilder::build");
        self.check_settings()?;
        if bounds.is_empty() || !(bounds.volume() > 0.0) || !bounds.volume().is_finite() {
            return Err(BuildError::DegenerateBounds(bounds));
        }

        // directories for the result and for spilled buckets
        let parent = match output_dir.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent).map_err(|e| BuildError::TempFile(e.into()))?;
        let staging = tempdir_in(&parent, ".lidarstore-build-")?;
        let spill_dir = tempdir_in(&parent, ".lidarstore-spill-")?;

        let summary = self.build_into(points, bounds, staging.path(), spill_dir.path())?;
        drop(spill_dir);
        commit(staging, output_dir)?;
        info!(
            "Built index {} with {} points in {} nodes ({} leaves, depth {}, {} points spilled to disk).",
            output_dir.display(),
            summary.nr_points,
            summary.nr_nodes,
            summary.nr_leaves,
            summary.max_depth,
            summary.nr_spilled_points
        );

        let index = SpatialIndexFile::open(&output_dir.join(INDEX_FILE_NAME))?;
        Ok(index)
    }

    /// Builds the index of a las or laz file.
    pub fn build_from_las(
        &self,
        las_path: &Path,
        output_dir: &Path,
    ) -> Result<SpatialIndexFile, BuildError> {
        let source = LasPointSource::open(las_path)?;
        let header = source.header().clone();
        info!(
            "Indexing {} ({} points, point format {}).",
            las_path.display(),
            header.nr_points,
            header.point_format
        );
        self.try_build(source, header.bounds, output_dir)
    }

    fn check_settings(&self) -> Result<(), BuildError> {
        if self.settings.max_points_per_leaf == 0 {
            return Err(BuildError::InvalidSettings(
                "max_points_per_leaf must be at least 1".to_string(),
            ));
        }
        if self.settings.buffer_size_bytes < std::mem::size_of::<PointRecord>() {
            return Err(BuildError::InvalidSettings(format!(
                "buffer_size_bytes must be at least {} (the size of one point)",
                std::mem::size_of::<PointRecord>()
            )));
        }
        Ok(())
    }

    fn build_into<E: Display>(
        &self,
        points: impl IntoIterator<Item = Result<PointRecord, E>>,
        bounds: Aabb,
        staging: &Path,
        spill_dir: &Path,
    ) -> Result<BuildSummary, BuildError> {
        // The root box gets a margin of one quantization step,
        // so that points on the input bounds stay inside after quantization.
        let root_bounds = bounds.padded(self.settings.scale);
        let coordinate_system = CoordinateSystem::for_bounds(&root_bounds, self.settings.scale)?;
        let mut ctx = BuildContext {
            budget: MemoryBudget {
                max_points: self.settings.buffer_size_bytes / std::mem::size_of::<PointRecord>(),
                used_points: 0,
            },
            spill_dir,
            nr_spilled_points: 0,
        };

        // distribute all input points into the root bucket
        let mut root = Bucket::default();
        {
            let _span = span!("IndexBuilder::build read input");
            for point in points {
                let mut point = point.map_err(|e| BuildError::Input(e.to_string()))?;
                point.position = coordinate_system.quantize(&point.position)?;
                if !root_bounds.contains(&point.position) {
                    return Err(BuildError::PointOutOfBounds(point.position));
                }
                root.push(point, &mut ctx)?;
            }
        }
        let nr_points = root.len;
        debug!("Read {nr_points} input points.");

        // split nodes depth first, assigning ids as nodes are created
        let pages_file = File::create(staging.join(PAGES_FILE_NAME))?;
        let mut pages = PageFileWriter {
            wr: BufWriter::new(pages_file),
            offset: 0,
        };
        let mut nodes = vec![Node {
            id: NodeId::ROOT,
            bounds: root_bounds,
            parent: None,
            depth: 0,
            content: NodeContent::Inner(vec![]),
        }];
        let mut stack = vec![(NodeId::ROOT, root)];
        while let Some((id, bucket)) = stack.pop() {
            let node_bounds = nodes[id.index()].bounds;
            let depth = nodes[id.index()].depth;
            let is_leaf = bucket.len <= self.settings.max_points_per_leaf as u64
                || depth >= self.settings.max_tree_depth;

            if is_leaf {
                let _span = span!("IndexBuilder::build write page");
                let mut columns = PageColumns::with_capacity(bucket.len as usize);
                let mut source = bucket.into_source()?;
                while let Some(point) = source.next_point(&mut ctx.budget)? {
                    columns.push(&point);
                }
                let page = pages.write_page(&columns, &coordinate_system)?;
                nodes[id.index()].content = NodeContent::Leaf(page);
                continue;
            }

            let _span = span!("IndexBuilder::build split node");
            let mut children: [Bucket; 8] = Default::default();
            let mut source = bucket.into_source()?;
            while let Some(point) = source.next_point(&mut ctx.budget)? {
                let octant = node_bounds.octant_of(&point.position);
                children[octant].push(point, &mut ctx)?;
            }
            drop(source);

            let first_child = nodes.len() as u32;
            let child_ids = (0..8).map(|i| NodeId(first_child + i)).collect::<Vec<_>>();
            for (octant, child) in child_ids.iter().enumerate() {
                nodes.push(Node {
                    id: *child,
                    bounds: node_bounds.octant_box(octant),
                    parent: Some(id),
                    depth: depth + 1,
                    content: NodeContent::Inner(vec![]),
                });
            }
            nodes[id.index()].content = NodeContent::Inner(child_ids.clone());

            // reversed, so that octant 0 is processed first
            for (child, bucket) in child_ids.into_iter().zip(children).rev() {
                stack.push((child, bucket));
            }
        }
        pages.finish()?;

        let summary = BuildSummary {
            nr_points,
            nr_nodes: nodes.len(),
            nr_leaves: nodes.iter().filter(|n| n.is_leaf()).count(),
            max_depth: nodes.iter().map(|n| n.depth).max().unwrap_or(0),
            nr_spilled_points: ctx.nr_spilled_points,
        };
        let header = IndexHeader {
            bounds,
            coordinate_system,
            nr_points,
            nr_nodes: nodes.len() as u64,
        };
        let index = SpatialIndexFile::new(header, nodes)?;
        index.write(&staging.join(INDEX_FILE_NAME))?;
        self.settings.save_to_index_folder(staging)?;
        Ok(summary)
    }
}

fn tempdir_in(parent: &Path, prefix: &str) -> Result<TempDir, BuildError> {
    tempfile::Builder::new()
        .prefix(prefix)
        .tempdir_in(parent)
        .map_err(|e| BuildError::TempFile(e.into()))
}

/// Moves the staging directory to its final location, replacing any previous index there.
fn commit(staging: TempDir, output_dir: &Path) -> Result<(), BuildError> {
    let _span = span!("IndexBuilder::build commit");
    let commit_error = |e: std::io::Error| BuildError::Commit {
        path: output_dir.to_path_buf(),
        source: e.into(),
    };

    // move the old index out of the way first. It is deleted when `old` is dropped.
    let mut old = None;
    if output_dir.exists() {
        let parent = staging.path().parent().unwrap_or(Path::new("."));
        let trash = tempdir_in(parent, ".lidarstore-old-")?;
        let moved_to = trash.path().join("index");
        std::fs::rename(output_dir, &moved_to).map_err(commit_error)?;
        old = Some((trash, moved_to));
    }

    let staging_path = staging.keep();
    if let Err(e) = std::fs::rename(&staging_path, output_dir) {
        let _ = std::fs::remove_dir_all(&staging_path);
        // put the previous index back
        if let Some((_trash, moved_to)) = &old {
            let _ = std::fs::rename(moved_to, output_dir);
        }
        return Err(commit_error(e));
    }
    drop(old);
    Ok(())
}

struct MemoryBudget {
    max_points: usize,
    used_points: usize,
}

struct BuildContext<'a> {
    budget: MemoryBudget,
    spill_dir: &'a Path,
    nr_spilled_points: u64,
}

/// The points of one node during the build.
/// Points are kept in insertion order: first those in the spill file, then those in memory.
#[derive(Default)]
struct Bucket {
    memory: Vec<PointRecord>,
    spill: Option<SpillFile>,
    len: u64,
}

struct SpillFile {
    wr: BufWriter<NamedTempFile>,
    nr_points: u64,
}

impl Bucket {
    fn push(&mut self, point: PointRecord, ctx: &mut BuildContext) -> Result<(), BuildError> {
        self.len += 1;
        if ctx.budget.used_points < ctx.budget.max_points {
            ctx.budget.used_points += 1;
            self.memory.push(point);
            return Ok(());
        }

        // out of memory: spill everything this bucket holds so far, followed by the new point
        let spill = match &mut self.spill {
            Some(s) => s,
            None => {
                let file = NamedTempFile::new_in(ctx.spill_dir)
                    .map_err(|e| BuildError::TempFile(e.into()))?;
                self.spill.insert(SpillFile {
                    wr: BufWriter::new(file),
                    nr_points: 0,
                })
            }
        };
        let in_memory = self.memory.len();
        for p in self.memory.drain(..).chain(std::iter::once(point)) {
            write_record(&p, &mut spill.wr)?;
            spill.nr_points += 1;
            ctx.nr_spilled_points += 1;
        }
        ctx.budget.used_points -= in_memory;
        self.memory = Vec::new();
        Ok(())
    }

    fn into_source(self) -> Result<BucketSource, BuildError> {
        let spill = match self.spill {
            None => None,
            Some(spill) => {
                let mut file = spill.wr.into_inner().map_err(|e| e.into_error())?;
                file.seek(SeekFrom::Start(0))?;
                Some((BufReader::new(file), spill.nr_points))
            }
        };
        Ok(BucketSource {
            spill,
            memory: self.memory.into_iter(),
        })
    }
}

struct BucketSource {
    spill: Option<(BufReader<NamedTempFile>, u64)>,
    memory: std::vec::IntoIter<PointRecord>,
}

impl BucketSource {
    fn next_point(&mut self, budget: &mut MemoryBudget) -> Result<Option<PointRecord>, BuildError> {
        if let Some((rd, remaining)) = &mut self.spill {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(Some(page_codec::read_record(rd)?));
            }
            self.spill = None;
        }
        let next = self.memory.next();
        if next.is_some() {
            budget.used_points -= 1;
        }
        Ok(next)
    }
}

struct PageFileWriter {
    wr: BufWriter<File>,
    offset: u64,
}

impl PageFileWriter {
    fn write_page(
        &mut self,
        columns: &PageColumns,
        coordinate_system: &CoordinateSystem,
    ) -> Result<PageRef, PointIoError> {
        let nr_points = columns.len() as u64;
        let length = page_codec::encoded_len(nr_points);
        page_codec::write_page(columns, coordinate_system, &mut self.wr)?;
        let page = PageRef {
            offset: self.offset,
            length,
            nr_points,
        };
        self.offset += length;
        Ok(page)
    }

    fn finish(mut self) -> Result<(), PointIoError> {
        self.wr.flush()?;
        self.wr.get_ref().sync_all()?;
        Ok(())
    }
}
