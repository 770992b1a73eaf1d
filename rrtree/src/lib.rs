//! # RR-Tree - Buffered Updates for a Disk R-Tree
//!
//! This crate provides a disk-resident R-Tree whose insertions and
//! deletions are deferred in an in-memory update buffer instead of
//! restructuring the tree on every write.
//!
//! ## Features
//!
//! - **Update Buffer**: pending operations indexed by their bounding box
//! - **Piggybacking**: queries merge fitting buffered operations into the
//!   leaves they visit anyway, within leaf capacity
//! - **Grouped Flushes**: a full buffer is applied in one descent, with
//!   operations partitioned per subtree by a configurable grouping strategy
//! - **Disk-Based Storage**: checksummed pages loaded on demand through an
//!   LRU cache
//! - **Consistent Reads**: queries always reflect buffered operations
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rrtree::{BoundingBox, GroupingStrategy, RRTree, RRTreeConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RRTreeConfig::new()
//!     .with_buffer_capacity(512)
//!     .with_grouping_strategy(GroupingStrategy::Trivial)
//!     .with_epsilon(0.5);
//! let tree = RRTree::create("roads.rrtree", config)?;
//!
//! tree.insert(BoundingBox::new(0.0, 0.0, 10.0, 10.0), 1)?;
//! tree.delete(BoundingBox::new(0.0, 0.0, 10.0, 10.0), 1)?;
//!
//! let query = BoundingBox::new(5.0, 5.0, 15.0, 15.0);
//! assert!(tree.find_intersecting_keys(&query)?.is_empty());
//! tree.close()?;
//! # Ok(())
//! # }
//! ```

pub mod bounding_box;
pub mod buffer;
pub mod config;
pub mod disk_rtree;
pub mod errors;
pub mod rr_tree;
pub mod spatial_index;

pub use bounding_box::BoundingBox;
pub use buffer::{
    BufferOutcome, GroupingStrategy, LeafNodeModifier, LogTracer, NoopTracer, ObjectTracer,
    OperationEntry, OperationGroupMaker, OperationKind, PiggybackStatistics, PiggybackingInfo,
    SpatialItem, UpdateBuffer,
};
pub use config::{NodeCapacity, RRTreeConfig};
pub use disk_rtree::{DiskRTree, FlushReport, IntegrityReport, LeafEntry, SearchMode, TreeStats};
pub use errors::{RRTreeError, RRTreeResult};
pub use rr_tree::{RRTree, RRTreeStats};
pub use spatial_index::SpatialIndex;
