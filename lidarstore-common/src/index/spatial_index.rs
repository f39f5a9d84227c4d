//! Read-only handle over a persisted octree.
//!
//! The index is stored in a chunk file (see [crate::io::chunk_file]) with three chunks:
//!
//!  - `IHDR` (1.0): bounds (6 x f64: min xyz, max xyz), coordinate system (3 x f64 scale, 3 x f64 offset),
//!    number of points (u64), number of nodes (u64).
//!  - `NODE` (1.0): one entry per node, ordered by node id:
//!    parent id (u32, `u32::MAX` for the root), depth (u8), bounds (6 x f64),
//!    kind (u8, 0 = leaf, 1 = inner), for inner nodes: number of children (u8) followed by the child ids (u32 each).
//!  - `PAGE` (1.0): number of entries (u64), followed by one entry per leaf:
//!    node id (u32), offset in the page file (u64), length in bytes (u64), number of points (u64).

use super::NodeId;
use crate::geometry::bounding_box::Aabb;
use crate::geometry::coordinate_system::{CoordinateSystem, CoordinateSystemError};
use crate::io::chunk_file::{ChunkReader, ChunkType, ChunkVersion, ChunkWriter};
use crate::io::page_codec;
use crate::io::PointIoError;
use crate::span;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::debug;
use nalgebra::{point, vector};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;

const CHUNK_HEADER: ChunkType = *b"IHDR";
const CHUNK_NODES: ChunkType = *b"NODE";
const CHUNK_PAGES: ChunkType = *b"PAGE";
const CHUNK_VERSION: ChunkVersion = ChunkVersion::new(1, 0);

const NO_PARENT: u32 = u32::MAX;

/// Structural inconsistency of an index, detected when opening it.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CorruptIndexError {
    #[error("The index is missing the {0} chunk.")]
    MissingChunk(String),

    #[error("The {0} chunk is truncated or malformed.")]
    MalformedChunk(String),

    #[error("The index declares {declared} nodes, but the node table holds {actual}.")]
    NodeCount { declared: u64, actual: u64 },

    #[error("The index declares {declared} points, but its pages hold {actual}.")]
    PointCount { declared: u64, actual: u64 },

    #[error("Inconsistent node {node}: {reason}")]
    Node { node: u32, reason: String },

    #[error("Invalid coordinate system: {0}")]
    CoordinateSystem(String),
}

#[derive(Debug, Error, Clone)]
pub enum IndexOpenError {
    #[error("Could not read the index file: {0}")]
    Io(#[from] PointIoError),

    #[error("Corrupt index: {0}")]
    Corrupt(#[from] CorruptIndexError),

    #[error("The {chunk} chunk has version {major}.{minor}, which is not supported.")]
    UnsupportedVersion { chunk: String, major: u8, minor: u8 },
}

impl From<std::io::Error> for IndexOpenError {
    fn from(value: std::io::Error) -> Self {
        IndexOpenError::Io(value.into())
    }
}

/// Location of a leaf's page within the page file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRef {
    pub offset: u64,
    pub length: u64,
    pub nr_points: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeContent {
    Leaf(PageRef),

    /// Children, ordered by octant index.
    Inner(Vec<NodeId>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub bounds: Aabb,
    pub parent: Option<NodeId>,
    pub depth: u8,
    pub content: NodeContent,
}

impl Node {
    pub fn is_leaf(&self) -> bool {
        matches!(self.content, NodeContent::Leaf(_))
    }

    pub fn children(&self) -> &[NodeId] {
        match &self.content {
            NodeContent::Leaf(_) => &[],
            NodeContent::Inner(children) => children,
        }
    }

    pub fn page_ref(&self) -> Option<PageRef> {
        match &self.content {
            NodeContent::Leaf(page) => Some(*page),
            NodeContent::Inner(_) => None,
        }
    }
}

/// Dataset wide information stored in the index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHeader {
    pub bounds: Aabb,
    pub coordinate_system: CoordinateSystem,
    pub nr_points: u64,
    pub nr_nodes: u64,
}

#[derive(Debug, Clone)]
pub struct SpatialIndexFile {
    header: IndexHeader,
    nodes: Vec<Node>,
}

impl SpatialIndexFile {
    /// Creates an index from a node table.
    /// The nodes must be ordered by id, and the root must be the first node.
    pub fn new(header: IndexHeader, nodes: Vec<Node>) -> Result<Self, CorruptIndexError> {
        let index = SpatialIndexFile { header, nodes };
        index.validate()?;
        Ok(index)
    }

    pub fn open(path: &Path) -> Result<Self, IndexOpenError> {
        let _span = span!("SpatialIndexFile::open");
        let file = File::open(path)?;
        let mut rd = ChunkReader::new(BufReader::new(file));

        let mut header = None;
        let mut nodes = None;
        let mut pages = None;
        while let Some(chunk) = rd.next_header()? {
            let target = match &chunk.chunk_type {
                &CHUNK_HEADER | &CHUNK_NODES | &CHUNK_PAGES => chunk.chunk_type,
                _ => {
                    rd.skip_payload(&chunk)?;
                    continue;
                }
            };
            if !CHUNK_VERSION.can_read(chunk.version) {
                return Err(IndexOpenError::UnsupportedVersion {
                    chunk: chunk.type_name(),
                    major: chunk.version.major,
                    minor: chunk.version.minor,
                });
            }
            let payload = rd.read_payload(&chunk)?;
            let malformed = |_| CorruptIndexError::MalformedChunk(chunk.type_name());
            match target {
                CHUNK_HEADER => header = Some(read_header(&payload).map_err(malformed)?),
                CHUNK_NODES => nodes = Some(read_nodes(&payload).map_err(malformed)?),
                _ => pages = Some(read_pages(&payload).map_err(malformed)?),
            }
        }

        let missing = |c: ChunkType| CorruptIndexError::MissingChunk(String::from_utf8_lossy(&c).into_owned());
        let header = header.ok_or_else(|| missing(CHUNK_HEADER))?;
        let nodes = nodes.ok_or_else(|| missing(CHUNK_NODES))?;
        let pages = pages.ok_or_else(|| missing(CHUNK_PAGES))?;
        let header = header?;

        let nodes = assemble_nodes(nodes, pages)?;
        let index = SpatialIndexFile::new(header, nodes)?;
        debug!(
            "Opened index {} with {} nodes and {} points.",
            path.display(),
            index.node_count(),
            index.header.nr_points
        );
        Ok(index)
    }

    pub fn write(&self, path: &Path) -> Result<(), PointIoError> {
        let _span = span!("SpatialIndexFile::write");
        let file = File::create(path)?;
        let mut wr = ChunkWriter::new(BufWriter::new(file));
        wr.write_chunk(CHUNK_HEADER, CHUNK_VERSION, &self.encode_header()?)?;
        wr.write_chunk(CHUNK_NODES, CHUNK_VERSION, &self.encode_nodes()?)?;
        wr.write_chunk(CHUNK_PAGES, CHUNK_VERSION, &self.encode_pages()?)?;
        let mut buf = wr.into_inner();
        buf.flush()?;
        buf.get_ref().sync_all()?;
        Ok(())
    }

    pub fn header(&self) -> &IndexHeader {
        &self.header
    }

    pub fn bounds(&self) -> &Aabb {
        &self.header.bounds
    }

    pub fn coordinate_system(&self) -> &CoordinateSystem {
        &self.header.coordinate_system
    }

    pub fn nr_points(&self) -> u64 {
        self.header.nr_points
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn root(&self) -> &Node {
        &self.nodes[0]
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn leaves(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.is_leaf())
    }

    pub fn page_ref_for(&self, leaf: NodeId) -> Option<PageRef> {
        self.node(leaf)?.page_ref()
    }

    /// Lazily enumerates the nodes whose bounds intersect `query`, in depth first order.
    /// Children are visited in octant order. Subtrees that do not intersect are skipped entirely.
    pub fn nodes_intersecting(&self, query: Aabb) -> NodesIntersecting<'_> {
        NodesIntersecting {
            index: self,
            traversal: NodeTraversal::new(),
            query,
        }
    }

    fn validate(&self) -> Result<(), CorruptIndexError> {
        let nr_nodes = self.nodes.len() as u64;
        if nr_nodes != self.header.nr_nodes {
            return Err(CorruptIndexError::NodeCount {
                declared: self.header.nr_nodes,
                actual: nr_nodes,
            });
        }
        if nr_nodes == 0 {
            return Err(CorruptIndexError::NodeCount {
                declared: 0,
                actual: 0,
            });
        }
        if nr_nodes > NO_PARENT as u64 {
            return Err(CorruptIndexError::NodeCount {
                declared: self.header.nr_nodes,
                actual: nr_nodes,
            });
        }

        let corrupt = |node: &Node, reason: &str| CorruptIndexError::Node {
            node: node.id.0,
            reason: reason.to_string(),
        };
        let mut referenced = vec![false; self.nodes.len()];
        let mut nr_points = 0;
        for (i, node) in self.nodes.iter().enumerate() {
            if node.id.index() != i {
                return Err(corrupt(node, "node table is not ordered by id"));
            }
            match (i, node.parent) {
                (0, None) => {}
                (0, Some(_)) => return Err(corrupt(node, "the root has a parent")),
                (_, None) => return Err(corrupt(node, "missing parent")),
                (_, Some(parent)) => {
                    let Some(parent) = self.node(parent) else {
                        return Err(corrupt(node, "parent does not exist"));
                    };
                    if !parent.children().contains(&node.id) {
                        return Err(corrupt(node, "parent does not list this node as a child"));
                    }
                    if parent.depth as u32 + 1 != node.depth as u32 {
                        return Err(corrupt(node, "depth does not match the parent's depth"));
                    }
                }
            }
            match &node.content {
                NodeContent::Leaf(page) => {
                    let Some(length) = page_codec::checked_encoded_len(page.nr_points) else {
                        return Err(corrupt(node, "page size overflows"));
                    };
                    if page.length != length {
                        return Err(corrupt(node, "page size does not match its point count"));
                    }
                    nr_points = match u64::checked_add(nr_points, page.nr_points) {
                        Some(n) => n,
                        None => return Err(corrupt(node, "point count overflows")),
                    };
                }
                NodeContent::Inner(children) => {
                    if children.is_empty() || children.len() > 8 {
                        return Err(corrupt(node, "inner nodes need between 1 and 8 children"));
                    }
                    for child in children {
                        if child.0 as u64 >= nr_nodes || child.index() == 0 {
                            return Err(corrupt(node, "child id out of range"));
                        }
                        if referenced[child.index()] {
                            return Err(corrupt(node, "child is referenced twice"));
                        }
                        referenced[child.index()] = true;
                    }
                }
            }
        }
        if let Some(orphan) = referenced.iter().skip(1).position(|r| !r) {
            return Err(corrupt(&self.nodes[orphan + 1], "node is not reachable from the root"));
        }
        if nr_points != self.header.nr_points {
            return Err(CorruptIndexError::PointCount {
                declared: self.header.nr_points,
                actual: nr_points,
            });
        }
        Ok(())
    }

    fn encode_header(&self) -> Result<Vec<u8>, PointIoError> {
        let mut buf = Vec::new();
        write_aabb(&mut buf, &self.header.bounds)?;
        let cs = &self.header.coordinate_system;
        for v in cs.scale().iter().chain(cs.offset().iter()) {
            buf.write_f64::<LittleEndian>(*v)?;
        }
        buf.write_u64::<LittleEndian>(self.header.nr_points)?;
        buf.write_u64::<LittleEndian>(self.nodes.len() as u64)?;
        Ok(buf)
    }

    fn encode_nodes(&self) -> Result<Vec<u8>, PointIoError> {
        let mut buf = Vec::new();
        for node in &self.nodes {
            buf.write_u32::<LittleEndian>(node.parent.map(|p| p.0).unwrap_or(NO_PARENT))?;
            buf.write_u8(node.depth)?;
            write_aabb(&mut buf, &node.bounds)?;
            match &node.content {
                NodeContent::Leaf(_) => buf.write_u8(0)?,
                NodeContent::Inner(children) => {
                    buf.write_u8(1)?;
                    buf.write_u8(children.len() as u8)?;
                    for child in children {
                        buf.write_u32::<LittleEndian>(child.0)?;
                    }
                }
            }
        }
        Ok(buf)
    }

    fn encode_pages(&self) -> Result<Vec<u8>, PointIoError> {
        let mut buf = Vec::new();
        buf.write_u64::<LittleEndian>(self.leaves().count() as u64)?;
        for leaf in self.leaves() {
            if let Some(page) = leaf.page_ref() {
                buf.write_u32::<LittleEndian>(leaf.id.0)?;
                buf.write_u64::<LittleEndian>(page.offset)?;
                buf.write_u64::<LittleEndian>(page.length)?;
                buf.write_u64::<LittleEndian>(page.nr_points)?;
            }
        }
        Ok(buf)
    }
}

/// Depth first traversal state.
///
/// Holds no reference to the index itself, so it can be kept next to an index handle
/// (for example inside of a query) and resumed at any later time.
#[derive(Debug, Clone)]
pub struct NodeTraversal {
    stack: Vec<NodeId>,
}

impl NodeTraversal {
    pub fn new() -> Self {
        NodeTraversal {
            stack: vec![NodeId::ROOT],
        }
    }

    pub fn is_finished(&self) -> bool {
        self.stack.is_empty()
    }

    /// Advances to the next node accepted by `visit`.
    /// The children of rejected nodes are never visited.
    pub fn next_node(
        &mut self,
        index: &SpatialIndexFile,
        mut visit: impl FnMut(&Node) -> bool,
    ) -> Option<NodeId> {
        while let Some(id) = self.stack.pop() {
            let Some(node) = index.node(id) else {
                continue;
            };
            if !visit(node) {
                continue;
            }
            self.stack.extend(node.children().iter().rev());
            return Some(id);
        }
        None
    }

    /// Like [NodeTraversal::next_node], but only returns leaves.
    pub fn next_leaf(
        &mut self,
        index: &SpatialIndexFile,
        mut visit: impl FnMut(&Node) -> bool,
    ) -> Option<NodeId> {
        loop {
            let id = self.next_node(index, &mut visit)?;
            if index.node(id).is_some_and(Node::is_leaf) {
                return Some(id);
            }
        }
    }
}

impl Default for NodeTraversal {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator returned by [SpatialIndexFile::nodes_intersecting].
pub struct NodesIntersecting<'a> {
    index: &'a SpatialIndexFile,
    traversal: NodeTraversal,
    query: Aabb,
}

impl Iterator for NodesIntersecting<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<Self::Item> {
        let query = self.query;
        self.traversal
            .next_node(self.index, |node| node.bounds.intersects_aabb(&query))
    }
}

fn write_aabb(wr: &mut impl Write, aabb: &Aabb) -> std::io::Result<()> {
    for v in aabb.min.iter().chain(aabb.max.iter()) {
        wr.write_f64::<LittleEndian>(*v)?;
    }
    Ok(())
}

fn read_aabb(rd: &mut impl Read) -> std::io::Result<Aabb> {
    let mut v = [0.0; 6];
    rd.read_f64_into::<LittleEndian>(&mut v)?;
    Ok(Aabb::new(point![v[0], v[1], v[2]], point![v[3], v[4], v[5]]))
}

/// The header, or the reason why its coordinate system is invalid.
type HeaderResult = Result<IndexHeader, CorruptIndexError>;

fn read_header(mut rd: &[u8]) -> std::io::Result<HeaderResult> {
    let bounds = read_aabb(&mut rd)?;
    let mut cs = [0.0; 6];
    rd.read_f64_into::<LittleEndian>(&mut cs)?;
    let nr_points = rd.read_u64::<LittleEndian>()?;
    let nr_nodes = rd.read_u64::<LittleEndian>()?;
    let coordinate_system = CoordinateSystem::new(
        vector![cs[0], cs[1], cs[2]],
        vector![cs[3], cs[4], cs[5]],
    );
    Ok(coordinate_system
        .map_err(|e: CoordinateSystemError| CorruptIndexError::CoordinateSystem(e.to_string()))
        .map(|coordinate_system| IndexHeader {
            bounds,
            coordinate_system,
            nr_points,
            nr_nodes,
        }))
}

/// Node table entry, before the page refs are filled in.
struct RawNode {
    parent: Option<NodeId>,
    depth: u8,
    bounds: Aabb,
    children: Option<Vec<NodeId>>,
}

fn read_nodes(mut rd: &[u8]) -> std::io::Result<Vec<RawNode>> {
    let mut nodes = Vec::new();
    while !rd.is_empty() {
        let parent = rd.read_u32::<LittleEndian>()?;
        let depth = rd.read_u8()?;
        let bounds = read_aabb(&mut rd)?;
        let children = match rd.read_u8()? {
            0 => None,
            1 => {
                let nr_children = rd.read_u8()?;
                let mut children = Vec::with_capacity(nr_children as usize);
                for _ in 0..nr_children {
                    children.push(NodeId(rd.read_u32::<LittleEndian>()?));
                }
                Some(children)
            }
            _ => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "invalid node kind",
                ));
            }
        };
        nodes.push(RawNode {
            parent: (parent != NO_PARENT).then_some(NodeId(parent)),
            depth,
            bounds,
            children,
        });
    }
    Ok(nodes)
}

fn read_pages(mut rd: &[u8]) -> std::io::Result<Vec<(NodeId, PageRef)>> {
    let nr_entries = rd.read_u64::<LittleEndian>()?;
    if nr_entries > rd.len() as u64 / 28 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "page table too short",
        ));
    }
    let mut pages = Vec::with_capacity(nr_entries as usize);
    for _ in 0..nr_entries {
        let node = NodeId(rd.read_u32::<LittleEndian>()?);
        let offset = rd.read_u64::<LittleEndian>()?;
        let length = rd.read_u64::<LittleEndian>()?;
        let nr_points = rd.read_u64::<LittleEndian>()?;
        pages.push((
            node,
            PageRef {
                offset,
                length,
                nr_points,
            },
        ));
    }
    Ok(pages)
}

fn assemble_nodes(
    raw: Vec<RawNode>,
    pages: Vec<(NodeId, PageRef)>,
) -> Result<Vec<Node>, CorruptIndexError> {
    let mut page_refs: Vec<Option<PageRef>> = vec![None; raw.len()];
    for (node, page) in pages {
        let slot = page_refs.get_mut(node.index()).ok_or(CorruptIndexError::Node {
            node: node.0,
            reason: "page table refers to a node that does not exist".to_string(),
        })?;
        if slot.replace(page).is_some() {
            return Err(CorruptIndexError::Node {
                node: node.0,
                reason: "page table lists the node twice".to_string(),
            });
        }
    }

    raw.into_iter()
        .zip(page_refs)
        .enumerate()
        .map(|(i, (raw, page))| {
            let content = match (raw.children, page) {
                (Some(children), None) => NodeContent::Inner(children),
                (None, Some(page)) => NodeContent::Leaf(page),
                (None, None) => {
                    return Err(CorruptIndexError::Node {
                        node: i as u32,
                        reason: "leaf without a page".to_string(),
                    });
                }
                (Some(_), Some(_)) => {
                    return Err(CorruptIndexError::Node {
                        node: i as u32,
                        reason: "inner node with a page".to_string(),
                    });
                }
            };
            Ok(Node {
                id: NodeId(i as u32),
                bounds: raw.bounds,
                parent: raw.parent,
                depth: raw.depth,
                content,
            })
        })
        .collect()
}
