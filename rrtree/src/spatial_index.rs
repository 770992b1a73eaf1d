//! SpatialIndex trait definition for keyed rectangle indexes.

use crate::bounding_box::BoundingBox;
use crate::errors::RRTreeResult;

/// A spatial index mapping bounding boxes to `u64` keys.
pub trait SpatialIndex: Send + Sync {
    /// Adds a key to the index.
    fn add(&self, key: &BoundingBox, id: u64) -> RRTreeResult<()>;

    /// Removes a key from the index. Returns false when an identical
    /// removal is already pending.
    fn remove(&self, key: &BoundingBox, id: u64) -> RRTreeResult<bool>;

    /// Finds the keys intersecting `key`.
    fn find_intersecting_keys(&self, key: &BoundingBox) -> RRTreeResult<Vec<u64>>;

    /// Finds the keys contained in `key`.
    fn find_contained_keys(&self, key: &BoundingBox) -> RRTreeResult<Vec<u64>>;

    /// Gets the number of committed keys.
    fn size(&self) -> u64;

    /// Closes this index, flushing all pending changes.
    fn close(&self) -> RRTreeResult<()>;

    /// Clears all data from the index.
    fn clear(&self) -> RRTreeResult<()>;
}
