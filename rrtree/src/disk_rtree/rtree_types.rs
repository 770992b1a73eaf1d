//! Core types of the disk-resident tree: nodes, pages, the file header
//! and reports.

use serde::{Deserialize, Serialize};

use super::rtree_constants::{MAGIC, PAGE_SIZE, VERSION};
use crate::bounding_box::BoundingBox;
use crate::buffer::SpatialItem;
use crate::config::NodeCapacity;
use crate::errors::{RRTreeError, RRTreeResult};

/// Page ID - unique identifier for a node/page on disk. Page 0 is the header.
pub type PageId = u64;

// ============================================================================
// Node Types
// ============================================================================

/// An entry in a leaf node: a key and the region it occupies.
///
/// Ordered by bounding box, then key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LeafEntry {
    pub bbox: BoundingBox,
    pub id: u64,
}

impl LeafEntry {
    pub fn new(bbox: BoundingBox, id: u64) -> Self {
        Self { bbox, id }
    }
}

impl SpatialItem for LeafEntry {
    fn descriptor(&self) -> BoundingBox {
        self.bbox
    }
}

/// A child reference in an internal node (an index entry)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChildRef {
    pub bbox: BoundingBox,
    pub page_id: PageId,
}

/// Node types in the tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    /// Leaf node containing actual entries
    Leaf { entries: Vec<LeafEntry> },
    /// Internal node containing child references
    Internal {
        children: Vec<ChildRef>,
        level: u32, // Height from leaf level (leaves are 0)
    },
}

impl Node {
    /// Get the bounding box enclosing all children/entries
    pub fn compute_bbox(&self) -> BoundingBox {
        match self {
            Node::Leaf { entries } => compute_entries_bbox(entries),
            Node::Internal { children, .. } => compute_children_bbox(children),
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf { .. })
    }

    pub fn level(&self) -> u32 {
        match self {
            Node::Leaf { .. } => 0,
            Node::Internal { level, .. } => *level,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Node::Leaf { entries } => entries.len(),
            Node::Internal { children, .. } => children.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index entry an object with `descriptor` should descend into: least
    /// area enlargement, then least area, then the first in node order.
    /// `None` for leaves and childless internal nodes.
    pub fn choose_subtree(&self, descriptor: &BoundingBox) -> Option<&ChildRef> {
        match self {
            Node::Leaf { .. } => None,
            Node::Internal { children, .. } => Self::choose_child(children, descriptor),
        }
    }

    /// [`Node::choose_subtree`] over a bare slice of index entries.
    pub fn choose_child<'a>(children: &'a [ChildRef], descriptor: &BoundingBox) -> Option<&'a ChildRef> {
        let mut best: Option<(&ChildRef, f64, f64)> = None;
        for child in children {
            let enlargement = child.bbox.enlargement(descriptor);
            let area = child.bbox.area();
            let better = match best {
                None => true,
                Some((_, best_enlargement, best_area)) => {
                    enlargement < best_enlargement
                        || (enlargement == best_enlargement && area < best_area)
                }
            };
            if better {
                best = Some((child, enlargement, area));
            }
        }
        best.map(|(child, _, _)| child)
    }
}

pub(crate) fn compute_entries_bbox(entries: &[LeafEntry]) -> BoundingBox {
    BoundingBox::covering(entries.iter().map(|e| &e.bbox))
}

pub(crate) fn compute_children_bbox(children: &[ChildRef]) -> BoundingBox {
    BoundingBox::covering(children.iter().map(|c| &c.bbox))
}

// ============================================================================
// Page with Checksum
// ============================================================================

/// A page wrapped with CRC32 checksum for corruption detection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageWithChecksum {
    /// CRC32 checksum of the node data
    pub checksum: u32,
    /// The actual node data
    pub node: Node,
}

impl PageWithChecksum {
    pub fn new(node: Node) -> RRTreeResult<Self> {
        let checksum = Self::calculate_checksum(&node)?;
        Ok(Self { checksum, node })
    }

    /// Calculate CRC32 checksum of node data
    pub fn calculate_checksum(node: &Node) -> RRTreeResult<u32> {
        let serialized = bincode::serde::encode_to_vec(node, bincode::config::legacy())
            .map_err(|e| RRTreeError::Serialization(e.to_string()))?;
        Ok(Self::crc32(&serialized))
    }

    /// CRC32-MPEG2 implementation (matching common checksums)
    fn crc32(data: &[u8]) -> u32 {
        let mut crc: u32 = 0xFFFFFFFF;
        const POLY: u32 = 0x04C11DB7;

        for &byte in data {
            crc ^= (byte as u32) << 24;
            for _ in 0..8 {
                crc = if crc & 0x80000000 != 0 {
                    (crc << 1) ^ POLY
                } else {
                    crc << 1
                };
            }
        }

        crc ^ 0xFFFFFFFF
    }

    /// Verify checksum and consume self to return node
    pub fn into_node(self) -> RRTreeResult<Node> {
        let expected = Self::calculate_checksum(&self.node)?;
        if self.checksum != expected {
            return Err(RRTreeError::corrupted(format!(
                "Page checksum mismatch - possible corruption (expected: {:x}, got: {:x})",
                expected, self.checksum
            )));
        }
        Ok(self.node)
    }
}

// ============================================================================
// File Header
// ============================================================================

/// File header stored in page 0
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileHeader {
    pub magic: u32,
    pub version: u32,
    pub page_size: u32,
    /// 0 while the tree is empty
    pub root_page: PageId,
    pub next_page_id: PageId,
    /// Committed entries
    pub entry_count: u64,
    /// 0 for an empty tree, 1 for a single leaf
    pub height: u32,
    pub capacity: NodeCapacity,
}

impl FileHeader {
    pub fn new(capacity: NodeCapacity) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            page_size: PAGE_SIZE as u32,
            root_page: 0,
            next_page_id: 1,
            entry_count: 0,
            height: 0,
            capacity,
        }
    }

    pub fn validate(&self) -> RRTreeResult<()> {
        if self.magic != MAGIC {
            return Err(RRTreeError::InvalidOperation(
                "Invalid file format (bad magic)".into(),
            ));
        }
        if self.version != VERSION {
            return Err(RRTreeError::InvalidOperation(format!(
                "Unsupported file format version {}",
                self.version
            )));
        }
        if self.page_size as usize != PAGE_SIZE {
            return Err(RRTreeError::InvalidOperation(format!(
                "Unsupported page size {}",
                self.page_size
            )));
        }
        self.capacity.validate()
    }
}

// ============================================================================
// Reports
// ============================================================================

/// Statistics about tree I/O and shape
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub total_entries: u64,
    pub tree_height: u32,
    pub cached_pages: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub disk_reads: u64,
    pub disk_writes: u64,
    pub free_pages: u64,
}

/// Outcome of applying a batch of buffered operations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub insertions_applied: u64,
    /// Deletions that removed an entry, including retried ones
    pub deletions_applied: u64,
    /// Deletions the grouped descent missed but an exact removal found
    pub deletions_retried: u64,
    /// Deletions whose entry is not in the tree at all
    pub unresolved_deletions: u64,
    pub nodes_split: u64,
    pub nodes_freed: u64,
}

/// Per-query piggybacking counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchReport {
    pub leaves_visited: u64,
    pub leaves_changed: u64,
    pub unpiggybackable_insertions: u64,
    pub unpiggybackable_deletions: u64,
}

/// Structural check results
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityReport {
    pub pages_checked: u64,
    pub entries_found: u64,
    pub is_valid: bool,
    pub errors: Vec<String>,
}

impl IntegrityReport {
    pub fn new() -> Self {
        Self {
            pages_checked: 0,
            entries_found: 0,
            is_valid: true,
            errors: Vec::new(),
        }
    }

    pub(crate) fn fail(&mut self, message: String) {
        self.is_valid = false;
        self.errors.push(message);
    }
}

impl Default for IntegrityReport {
    fn default() -> Self {
        Self::new()
    }
}
