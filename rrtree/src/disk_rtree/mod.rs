//! Disk-based R-Tree holding the committed entries of an RR-Tree.
//!
//! Nodes live in fixed-size checksummed pages and are loaded lazily through
//! an LRU page cache. The tree is modified in two ways:
//! - batch application of buffered operations, grouped per subtree
//! - piggybacking, where a search merges fitting buffered operations into
//!   the leaves it visits

pub mod leaf;
pub mod rtree_cache;
pub mod rtree_constants;
pub mod rtree_storage;
pub mod rtree_types;
mod rtree_impl;

pub use leaf::DiskLeaf;
pub use rtree_constants::DEFAULT_CACHE_PAGES;
pub use rtree_impl::{DiskRTree, PiggybackPass, SearchMode};
pub use rtree_types::{
    ChildRef, FileHeader, FlushReport, IntegrityReport, LeafEntry, Node, PageId, PageWithChecksum,
    SearchReport, TreeStats,
};
