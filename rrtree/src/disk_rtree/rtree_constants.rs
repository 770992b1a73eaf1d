//! Constants for the disk-resident tree.

/// Default page size (16KB) - balances I/O efficiency and memory usage
pub const PAGE_SIZE: usize = 16384;

/// Maximum number of entries per leaf node
pub const MAX_LEAF_ENTRIES: usize = 64;

/// Piggybacked deletions never take a leaf below this (about 40% of max)
pub const MIN_LEAF_ENTRIES: usize = 25;

/// Maximum children per internal node
pub const MAX_INTERNAL_CHILDREN: usize = 64;

/// Encoded size of one leaf entry or child reference (bounding box + u64)
pub const ENTRY_SIZE: usize = 40;

/// Room reserved per page for the checksum, enum tag, vector length and level
pub const PAGE_OVERHEAD: usize = 64;

/// Largest node capacity whose full node still fits in one page
pub const MAX_NODE_CAPACITY: usize = (PAGE_SIZE - PAGE_OVERHEAD) / ENTRY_SIZE;

/// Default cache size in number of pages (16MB with 16KB pages)
pub const DEFAULT_CACHE_PAGES: usize = 1024;

/// Magic number for file format identification
pub const MAGIC: u32 = 0x52525452; // "RRTR"

/// File format version
pub const VERSION: u32 = 1;
