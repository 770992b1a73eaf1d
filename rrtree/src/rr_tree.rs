//! The RR-Tree: a disk R-Tree fronted by an in-memory update buffer.

use std::collections::BTreeMap;
use std::path::Path;

use indexmap::{IndexMap, IndexSet};
use log::{debug, warn};
use parking_lot::Mutex;

use crate::bounding_box::BoundingBox;
use crate::buffer::{
    BufferOutcome, LeafNodeModifier, OperationBuffer, OperationEntry, OperationGroupMaker,
    PiggybackStatistics, UpdateBuffer,
};
use crate::config::RRTreeConfig;
use crate::disk_rtree::{
    DiskRTree, FlushReport, IntegrityReport, LeafEntry, PiggybackPass, SearchMode, TreeStats,
};
use crate::errors::{RRTreeError, RRTreeResult};
use crate::spatial_index::SpatialIndex;

/// Counters describing how updates reached the disk tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RRTreeStats {
    /// Operations stored in the buffer
    pub buffered_operations: u64,
    /// Deletions that cancelled a pending insertion
    pub annihilated_operations: u64,
    /// Operations already pending when submitted
    pub duplicate_operations: u64,
    pub flushes: u64,
    /// Operations applied by buffer flushes
    pub flushed_operations: u64,
    pub piggybacked_insertions: u64,
    pub piggybacked_deletions: u64,
    /// Fitting operations a leaf had no room for
    pub unpiggybackable_insertions: u64,
    pub unpiggybackable_deletions: u64,
    pub leaves_changed: u64,
    pub unresolved_deletions: u64,
    pub failed_flushes: u64,
    /// Operations drained by a flush that failed
    pub dropped_operations: u64,
    /// Copy of the grouping strategy's deletion split histogram
    pub deletion_splits: BTreeMap<usize, u64>,
}

/// Disk-resident R-Tree with buffered updates.
///
/// Insertions and deletions are collected in an [`UpdateBuffer`] and reach
/// the disk tree either by piggybacking onto leaves visited by queries or
/// by a grouped batch flush once the buffer is full. Queries always see
/// the buffered operations.
///
/// All operations take `&self`; calls are serialized internally.
///
/// # Examples
///
/// ```rust,no_run
/// use rrtree::{BoundingBox, RRTree, RRTreeConfig};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let tree = RRTree::create("places.rrtree", RRTreeConfig::new())?;
/// tree.insert(BoundingBox::new(0.0, 0.0, 10.0, 10.0), 1)?;
///
/// let hits = tree.find_intersecting_keys(&BoundingBox::new(5.0, 5.0, 15.0, 15.0))?;
/// assert_eq!(hits, vec![1]);
/// tree.close()?;
/// # Ok(())
/// # }
/// ```
pub struct RRTree {
    config: RRTreeConfig,
    state: Mutex<RRTreeState>,
}

struct RRTreeState {
    tree: DiskRTree,
    buffer: UpdateBuffer<LeafEntry>,
    modifier: LeafNodeModifier<LeafEntry>,
    group_maker: OperationGroupMaker,
    stats: RRTreeStats,
}

impl RRTree {
    /// Create a new tree file at `path`, replacing any existing one.
    pub fn create(path: impl AsRef<Path>, config: RRTreeConfig) -> RRTreeResult<Self> {
        config.validate()?;
        let tree = DiskRTree::create(path, config.node_capacity(), config.cache_pages())?;
        Ok(Self::with_tree(tree, config))
    }

    /// Open an existing tree file. Node capacities are read from the file;
    /// every other setting comes from `config`.
    pub fn open(path: impl AsRef<Path>, config: RRTreeConfig) -> RRTreeResult<Self> {
        config.validate()?;
        let tree = DiskRTree::open(path, config.cache_pages())?;
        if tree.capacity() != config.node_capacity() {
            debug!(
                "using stored node capacity {:?} instead of {:?}",
                tree.capacity(),
                config.node_capacity()
            );
        }
        Ok(Self::with_tree(tree, config))
    }

    fn with_tree(tree: DiskRTree, config: RRTreeConfig) -> Self {
        let state = RRTreeState {
            tree,
            buffer: UpdateBuffer::new(config.buffer_capacity()),
            modifier: LeafNodeModifier::from_settings(config.piggybacking(), config.tracer()),
            group_maker: OperationGroupMaker::new(config.grouping_strategy()),
            stats: RRTreeStats::default(),
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    pub fn config(&self) -> &RRTreeConfig {
        &self.config
    }

    /// Buffers the insertion of `id` with `bbox`.
    pub fn insert(&self, bbox: BoundingBox, id: u64) -> RRTreeResult<BufferOutcome> {
        validate_bbox(&bbox)?;
        self.buffer_operation(OperationEntry::insertion(LeafEntry::new(bbox, id)))
    }

    /// Buffers the deletion of `id` stored with exactly `bbox`.
    pub fn delete(&self, bbox: BoundingBox, id: u64) -> RRTreeResult<BufferOutcome> {
        validate_bbox(&bbox)?;
        self.buffer_operation(OperationEntry::deletion(LeafEntry::new(bbox, id)))
    }

    fn buffer_operation(&self, entry: OperationEntry<LeafEntry>) -> RRTreeResult<BufferOutcome> {
        let mut state = self.state.lock();
        state.check_open()?;

        // Reinserting an item whose deletion is pending: the deletion goes
        // away, and so does the insertion if the tree still holds the item.
        // The tree is counted before the buffer changes, so a failed read
        // leaves the pending deletion in place.
        if entry.is_insertion() && state.buffer.has_pending_deletion(entry.data()) {
            let committed = state.tree.count_entry(entry.data())?;
            state.buffer.remove_exact_entry(&entry.opposite());
            if committed > 0 {
                debug!("insertion of {:?} cancelled a pending deletion", entry.data());
                state.stats.annihilated_operations += 1;
                return Ok(BufferOutcome::Annihilated);
            }
        }

        let outcome = state.buffer.add(entry);
        match outcome {
            BufferOutcome::Buffered => state.stats.buffered_operations += 1,
            BufferOutcome::Annihilated => state.stats.annihilated_operations += 1,
            BufferOutcome::Duplicate => state.stats.duplicate_operations += 1,
        }

        if state.buffer.is_full() {
            state.flush_buffer()?;
        }
        Ok(outcome)
    }

    /// Ids of entries intersecting `bbox`, buffered operations included.
    pub fn find_intersecting_keys(&self, bbox: &BoundingBox) -> RRTreeResult<Vec<u64>> {
        self.find_keys(bbox, SearchMode::Intersecting)
    }

    /// Ids of entries lying entirely inside `bbox`, buffered operations included.
    pub fn find_contained_keys(&self, bbox: &BoundingBox) -> RRTreeResult<Vec<u64>> {
        self.find_keys(bbox, SearchMode::Contained)
    }

    fn find_keys(&self, query: &BoundingBox, mode: SearchMode) -> RRTreeResult<Vec<u64>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.check_open()?;

        let mut found = Vec::new();
        let searched = {
            let mut pass = PiggybackPass::new(
                &mut state.modifier,
                &state.buffer,
                self.config.use_epsilon(),
                self.config.epsilon(),
            );
            state.tree.search(query, mode, &mut pass, |entry| found.push(*entry))
        };

        // Leaves piggybacked before a failure are already rewritten, so
        // their operations are committed either way.
        let mut piggybacked = PiggybackStatistics::default();
        state
            .modifier
            .finalize_modifications(&mut state.buffer, &mut state.tree, &mut piggybacked);

        let stats = &mut state.stats;
        stats.piggybacked_insertions += piggybacked.insertions;
        stats.piggybacked_deletions += piggybacked.deletions;
        let report = searched?;
        stats.unpiggybackable_insertions += report.unpiggybackable_insertions;
        stats.unpiggybackable_deletions += report.unpiggybackable_deletions;
        stats.leaves_changed += report.leaves_changed;

        // A pending deletion hides one stored copy of its item.
        let mut copies: IndexMap<LeafEntry, usize> = IndexMap::new();
        for entry in found {
            *copies.entry(entry).or_insert(0) += 1;
        }
        let mut keys = IndexSet::new();
        for (entry, count) in copies {
            if count > usize::from(state.buffer.has_pending_deletion(&entry)) {
                keys.insert(entry.id);
            }
        }
        for pending in state.buffer.query_intersecting(query) {
            if pending.is_insertion() && mode.matches(query, &pending.data().bbox) {
                keys.insert(pending.data().id);
            }
        }
        Ok(keys.into_iter().collect())
    }

    /// Applies every buffered operation to the disk tree.
    pub fn flush_buffer(&self) -> RRTreeResult<FlushReport> {
        let mut state = self.state.lock();
        state.check_open()?;
        state.flush_buffer()
    }

    /// Committed entries in the disk tree. Buffered operations are not counted.
    pub fn size(&self) -> u64 {
        self.state.lock().tree.size()
    }

    pub fn pending_operations(&self) -> usize {
        self.state.lock().buffer.len()
    }

    pub fn height(&self) -> u32 {
        self.state.lock().tree.height()
    }

    pub fn stats(&self) -> RRTreeStats {
        let state = self.state.lock();
        let mut stats = state.stats.clone();
        stats.deletion_splits = state.group_maker.deletion_splits().clone();
        stats
    }

    pub fn tree_stats(&self) -> TreeStats {
        self.state.lock().tree.stats()
    }

    pub fn check_integrity(&self) -> RRTreeResult<IntegrityReport> {
        self.state.lock().tree.check_integrity()
    }

    /// Writes dirty pages and the header without touching the buffer.
    pub fn sync(&self) -> RRTreeResult<()> {
        let state = self.state.lock();
        state.check_open()?;
        state.tree.flush()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().tree.is_closed()
    }

    /// Flushes the buffer, then closes the disk tree.
    pub fn close(&self) -> RRTreeResult<()> {
        let mut state = self.state.lock();
        if state.tree.is_closed() {
            return Ok(());
        }
        state.flush_buffer()?;
        state.tree.close()
    }

    /// Discards every committed entry and every buffered operation.
    pub fn clear(&self) -> RRTreeResult<()> {
        let mut state = self.state.lock();
        state.check_open()?;
        state.buffer.clear();
        state.tree.clear()?;
        state.group_maker.reset_statistics();
        state.stats = RRTreeStats::default();
        debug!("cleared tree and update buffer");
        Ok(())
    }
}

impl RRTreeState {
    fn check_open(&self) -> RRTreeResult<()> {
        if self.tree.is_closed() {
            Err(RRTreeError::Closed)
        } else {
            Ok(())
        }
    }

    fn flush_buffer(&mut self) -> RRTreeResult<FlushReport> {
        let operations = self.buffer.drain();
        if operations.is_empty() {
            return Ok(FlushReport::default());
        }

        let count = operations.len() as u64;
        let report = match self.tree.apply_operations(operations, &mut self.group_maker) {
            Ok(report) => report,
            Err(err) => {
                self.stats.failed_flushes += 1;
                self.stats.dropped_operations += count;
                warn!("flush of {} buffered operations failed, dropping them: {}", count, err);
                return Err(err);
            }
        };
        self.stats.flushes += 1;
        self.stats.flushed_operations += count;
        self.stats.unresolved_deletions += report.unresolved_deletions;
        debug!(
            "flushed {} buffered operations, tree now holds {} entries",
            count,
            self.tree.size()
        );
        Ok(report)
    }
}

fn validate_bbox(bbox: &BoundingBox) -> RRTreeResult<()> {
    let finite = [bbox.min_x, bbox.min_y, bbox.max_x, bbox.max_y]
        .iter()
        .all(|c| c.is_finite());
    if !finite || bbox.is_empty() {
        return Err(RRTreeError::InvalidArgument(format!(
            "invalid bounding box {}",
            bbox
        )));
    }
    Ok(())
}

impl SpatialIndex for RRTree {
    fn add(&self, key: &BoundingBox, id: u64) -> RRTreeResult<()> {
        self.insert(*key, id).map(|_| ())
    }

    fn remove(&self, key: &BoundingBox, id: u64) -> RRTreeResult<bool> {
        Ok(self.delete(*key, id)? != BufferOutcome::Duplicate)
    }

    fn find_intersecting_keys(&self, key: &BoundingBox) -> RRTreeResult<Vec<u64>> {
        RRTree::find_intersecting_keys(self, key)
    }

    fn find_contained_keys(&self, key: &BoundingBox) -> RRTreeResult<Vec<u64>> {
        RRTree::find_contained_keys(self, key)
    }

    fn size(&self) -> u64 {
        RRTree::size(self)
    }

    fn close(&self) -> RRTreeResult<()> {
        RRTree::close(self)
    }

    fn clear(&self) -> RRTreeResult<()> {
        RRTree::clear(self)
    }
}

impl Drop for RRTree {
    fn drop(&mut self) {
        // Best effort: buffered operations would otherwise be lost
        if !self.state.get_mut().tree.is_closed() {
            let _ = self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::GroupingStrategy;
    use crate::config::NodeCapacity;
    use crate::disk_rtree::rtree_constants::PAGE_SIZE;
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};
    use std::sync::Arc;
    use std::thread;
    use tempfile::tempdir;

    fn small_config() -> RRTreeConfig {
        RRTreeConfig::new()
            .with_node_capacity(NodeCapacity::new(4, 2, 4))
            .with_cache_pages(32)
    }

    fn square(x: f64, y: f64) -> BoundingBox {
        BoundingBox::new(x, y, x + 1.0, y + 1.0)
    }

    fn sorted(mut keys: Vec<u64>) -> Vec<u64> {
        keys.sort();
        keys
    }

    /// Two leaves: page 1 holds ids 0..3 near the origin, page 2 holds ids
    /// 3..6 around x = 20 and is zeroed on disk before reopening.
    fn open_with_damaged_leaf(path: &Path, config: RRTreeConfig) -> RRTree {
        {
            let tree = RRTree::create(path, small_config()).unwrap();
            for i in 0..3u64 {
                tree.insert(square(i as f64 * 2.0, 0.0), i).unwrap();
            }
            for i in 3..6u64 {
                tree.insert(square(20.0 + (i - 3) as f64 * 2.0, 0.0), i).unwrap();
            }
            tree.close().unwrap();
        }

        let mut file = OpenOptions::new().write(true).open(path).unwrap();
        file.seek(SeekFrom::Start(2 * PAGE_SIZE as u64)).unwrap();
        file.write_all(&vec![0u8; PAGE_SIZE]).unwrap();
        file.sync_all().unwrap();

        RRTree::open(path, config).unwrap()
    }

    #[test]
    fn test_buffered_insert_is_visible_before_flush() {
        let dir = tempdir().unwrap();
        let tree = RRTree::create(dir.path().join("t.rrtree"), small_config()).unwrap();

        assert_eq!(tree.insert(square(0.0, 0.0), 1).unwrap(), BufferOutcome::Buffered);
        assert_eq!(tree.size(), 0);
        assert_eq!(tree.pending_operations(), 1);

        let keys = tree.find_intersecting_keys(&BoundingBox::new(0.5, 0.5, 2.0, 2.0)).unwrap();
        assert_eq!(keys, vec![1]);
    }

    #[test]
    fn test_auto_flush_at_capacity() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempdir().unwrap();
        let config = small_config().with_buffer_capacity(8);
        let tree = RRTree::create(dir.path().join("t.rrtree"), config).unwrap();

        for i in 0..8 {
            tree.insert(square(i as f64 * 2.0, 0.0), i).unwrap();
        }
        assert_eq!(tree.pending_operations(), 0);
        assert_eq!(tree.size(), 8);

        let stats = tree.stats();
        assert_eq!(stats.flushes, 1);
        assert_eq!(stats.flushed_operations, 8);
        assert!(tree.check_integrity().unwrap().is_valid);
    }

    #[test]
    fn test_delete_annihilates_pending_insert() {
        let dir = tempdir().unwrap();
        let tree = RRTree::create(dir.path().join("t.rrtree"), small_config()).unwrap();

        tree.insert(square(0.0, 0.0), 1).unwrap();
        assert_eq!(tree.insert(square(0.0, 0.0), 1).unwrap(), BufferOutcome::Duplicate);
        assert_eq!(tree.delete(square(0.0, 0.0), 1).unwrap(), BufferOutcome::Annihilated);
        assert_eq!(tree.pending_operations(), 0);
        assert!(tree.find_intersecting_keys(&square(0.0, 0.0)).unwrap().is_empty());

        let stats = tree.stats();
        assert_eq!(stats.annihilated_operations, 1);
        assert_eq!(stats.duplicate_operations, 1);
    }

    #[test]
    fn test_reinsert_cancels_pending_deletion_of_committed_item() {
        let dir = tempdir().unwrap();
        let tree = RRTree::create(dir.path().join("t.rrtree"), small_config()).unwrap();

        tree.insert(square(0.0, 0.0), 1).unwrap();
        tree.flush_buffer().unwrap();

        assert_eq!(tree.delete(square(0.0, 0.0), 1).unwrap(), BufferOutcome::Buffered);
        assert_eq!(tree.insert(square(0.0, 0.0), 1).unwrap(), BufferOutcome::Annihilated);
        assert_eq!(tree.pending_operations(), 0);
        assert_eq!(tree.find_intersecting_keys(&square(0.0, 0.0)).unwrap(), vec![1]);

        // Nothing committed: the stray deletion is dropped, the insertion kept.
        tree.delete(square(9.0, 9.0), 2).unwrap();
        assert_eq!(tree.insert(square(9.0, 9.0), 2).unwrap(), BufferOutcome::Buffered);
        assert_eq!(tree.pending_operations(), 1);
        tree.flush_buffer().unwrap();
        assert_eq!(tree.size(), 2);
    }

    #[test]
    fn test_pending_deletion_hides_committed_entry() {
        let dir = tempdir().unwrap();
        let config = small_config().with_piggybacking(false);
        let tree = RRTree::create(dir.path().join("t.rrtree"), config).unwrap();

        tree.insert(square(0.0, 0.0), 1).unwrap();
        tree.insert(square(5.0, 5.0), 2).unwrap();
        tree.flush_buffer().unwrap();

        tree.delete(square(0.0, 0.0), 1).unwrap();
        let everything = BoundingBox::new(-10.0, -10.0, 10.0, 10.0);
        assert_eq!(tree.find_intersecting_keys(&everything).unwrap(), vec![2]);
        assert_eq!(tree.size(), 2);
        assert_eq!(tree.pending_operations(), 1);

        tree.flush_buffer().unwrap();
        assert_eq!(tree.size(), 1);
        assert_eq!(tree.find_intersecting_keys(&everything).unwrap(), vec![2]);
    }

    #[test]
    fn test_query_piggybacks_onto_visited_leaf() {
        let dir = tempdir().unwrap();
        let tree = RRTree::create(dir.path().join("t.rrtree"), small_config()).unwrap();

        tree.insert(BoundingBox::new(0.0, 0.0, 10.0, 10.0), 1).unwrap();
        tree.insert(square(8.0, 8.0), 2).unwrap();
        tree.insert(square(5.0, 5.0), 4).unwrap();
        tree.flush_buffer().unwrap();

        // Inside the single leaf's descriptor: merged by the next query.
        tree.insert(square(3.0, 3.0), 3).unwrap();
        tree.delete(square(8.0, 8.0), 2).unwrap();

        let keys = tree.find_intersecting_keys(&BoundingBox::new(2.0, 2.0, 9.0, 9.0)).unwrap();
        assert_eq!(sorted(keys), vec![1, 3, 4]);
        assert_eq!(tree.pending_operations(), 0);
        assert_eq!(tree.size(), 3);

        let stats = tree.stats();
        assert_eq!(stats.piggybacked_insertions, 1);
        assert_eq!(stats.piggybacked_deletions, 1);
        assert_eq!(stats.leaves_changed, 1);
        assert_eq!(stats.flushes, 1);
        assert!(tree.check_integrity().unwrap().is_valid);
    }

    #[test]
    fn test_operations_outside_leaf_stay_buffered() {
        let dir = tempdir().unwrap();
        let tree = RRTree::create(dir.path().join("t.rrtree"), small_config()).unwrap();

        tree.insert(square(0.0, 0.0), 1).unwrap();
        tree.insert(square(2.0, 2.0), 2).unwrap();
        tree.flush_buffer().unwrap();

        // Intersects the leaf but is not contained by it.
        tree.insert(BoundingBox::new(2.5, 2.5, 6.0, 6.0), 3).unwrap();
        let keys = tree.find_intersecting_keys(&BoundingBox::new(0.0, 0.0, 4.0, 4.0)).unwrap();
        assert_eq!(sorted(keys), vec![1, 2, 3]);
        assert_eq!(tree.pending_operations(), 1);
        assert_eq!(tree.stats().piggybacked_insertions, 0);
    }

    #[test]
    fn test_epsilon_widens_piggyback_catchment() {
        let dir = tempdir().unwrap();
        let config = small_config().with_epsilon(1.0);
        let tree = RRTree::create(dir.path().join("t.rrtree"), config).unwrap();

        tree.insert(square(0.0, 0.0), 1).unwrap();
        tree.insert(square(2.0, 2.0), 2).unwrap();
        tree.flush_buffer().unwrap();

        tree.insert(BoundingBox::new(2.5, 2.5, 3.5, 3.5), 3).unwrap();
        tree.find_intersecting_keys(&square(0.0, 0.0)).unwrap();
        assert_eq!(tree.pending_operations(), 0);
        assert_eq!(tree.size(), 3);
    }

    #[test]
    fn test_full_leaf_reports_unpiggybackable() {
        let dir = tempdir().unwrap();
        let tree = RRTree::create(dir.path().join("t.rrtree"), small_config()).unwrap();

        for i in 0..4 {
            tree.insert(square(i as f64, i as f64), i).unwrap();
        }
        tree.flush_buffer().unwrap();
        assert_eq!(tree.height(), 1);

        tree.insert(BoundingBox::new(1.0, 1.0, 1.5, 1.5), 10).unwrap();
        let keys = tree.find_intersecting_keys(&square(1.0, 1.0)).unwrap();
        assert!(keys.contains(&10));

        let stats = tree.stats();
        assert_eq!(stats.unpiggybackable_insertions, 1);
        assert_eq!(stats.piggybacked_insertions, 0);
        assert_eq!(tree.pending_operations(), 1);
    }

    #[test]
    fn test_contained_query_filters_buffered_entries() {
        let dir = tempdir().unwrap();
        let tree = RRTree::create(dir.path().join("t.rrtree"), small_config()).unwrap();

        tree.insert(square(0.0, 0.0), 1).unwrap();
        tree.insert(BoundingBox::new(0.0, 0.0, 5.0, 5.0), 2).unwrap();
        let keys = tree.find_contained_keys(&BoundingBox::new(-1.0, -1.0, 2.0, 2.0)).unwrap();
        assert_eq!(keys, vec![1]);
    }

    #[test]
    fn test_invalid_bounding_box_rejected() {
        let dir = tempdir().unwrap();
        let tree = RRTree::create(dir.path().join("t.rrtree"), small_config()).unwrap();

        let inverted = BoundingBox::new(2.0, 2.0, 1.0, 1.0);
        assert!(matches!(tree.insert(inverted, 1), Err(RRTreeError::InvalidArgument(_))));
        let nan = BoundingBox::new(f64::NAN, 0.0, 1.0, 1.0);
        assert!(matches!(tree.delete(nan, 1), Err(RRTreeError::InvalidArgument(_))));
        assert_eq!(tree.pending_operations(), 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempdir().unwrap();
        let config = RRTreeConfig::new().with_buffer_capacity(0);
        assert!(matches!(
            RRTree::create(dir.path().join("t.rrtree"), config),
            Err(RRTreeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_close_flushes_buffer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.rrtree");
        {
            let tree = RRTree::create(&path, small_config()).unwrap();
            tree.insert(square(0.0, 0.0), 1).unwrap();
            tree.insert(square(4.0, 4.0), 2).unwrap();
            tree.close().unwrap();
            assert!(tree.is_closed());
            assert!(matches!(tree.insert(square(1.0, 1.0), 3), Err(RRTreeError::Closed)));
        }

        let tree = RRTree::open(&path, RRTreeConfig::new()).unwrap();
        assert_eq!(tree.size(), 2);
        assert_eq!(tree.tree_stats().total_entries, 2);
    }

    #[test]
    fn test_drop_flushes_buffer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.rrtree");
        {
            let tree = RRTree::create(&path, small_config()).unwrap();
            tree.insert(square(0.0, 0.0), 1).unwrap();
        }
        let tree = RRTree::open(&path, small_config()).unwrap();
        assert_eq!(tree.find_intersecting_keys(&square(0.0, 0.0)).unwrap(), vec![1]);
    }

    #[test]
    fn test_clear_discards_everything() {
        let dir = tempdir().unwrap();
        let tree = RRTree::create(dir.path().join("t.rrtree"), small_config()).unwrap();

        for i in 0..10 {
            tree.insert(square(i as f64, 0.0), i).unwrap();
        }
        tree.flush_buffer().unwrap();
        tree.insert(square(50.0, 50.0), 99).unwrap();

        tree.clear().unwrap();
        assert_eq!(tree.size(), 0);
        assert_eq!(tree.pending_operations(), 0);
        assert_eq!(tree.stats(), RRTreeStats::default());
        assert!(tree
            .find_intersecting_keys(&BoundingBox::new(-100.0, -100.0, 100.0, 100.0))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_deletion_split_histogram_is_exposed() {
        let dir = tempdir().unwrap();
        let config = small_config()
            .with_piggybacking(false)
            .with_grouping_strategy(GroupingStrategy::Trivial);
        let tree = RRTree::create(dir.path().join("t.rrtree"), config).unwrap();

        for i in 0..20 {
            tree.insert(square((i % 5) as f64 * 3.0, (i / 5) as f64 * 3.0), i).unwrap();
        }
        tree.flush_buffer().unwrap();
        for i in 0..5 {
            tree.delete(square((i % 5) as f64 * 3.0, 0.0), i).unwrap();
        }
        tree.flush_buffer().unwrap();

        let stats = tree.stats();
        assert!(stats.deletion_splits.values().sum::<u64>() >= 5);
        assert_eq!(stats.unresolved_deletions, 0);
        assert_eq!(tree.size(), 15);
    }

    #[test]
    fn test_spatial_index_trait() {
        let dir = tempdir().unwrap();
        let tree = RRTree::create(dir.path().join("t.rrtree"), small_config()).unwrap();
        let index: &dyn SpatialIndex = &tree;

        index.add(&square(0.0, 0.0), 1).unwrap();
        assert!(index.remove(&square(0.0, 0.0), 1).unwrap());
        assert!(index.remove(&square(3.0, 3.0), 2).unwrap());
        assert!(!index.remove(&square(3.0, 3.0), 2).unwrap());
        assert!(index.find_intersecting_keys(&square(0.0, 0.0)).unwrap().is_empty());
        assert_eq!(index.size(), 0);
        index.clear().unwrap();
        index.close().unwrap();
    }

    #[test]
    fn test_failed_query_commits_leaves_already_piggybacked() {
        let dir = tempdir().unwrap();
        let tree = open_with_damaged_leaf(&dir.path().join("t.rrtree"), small_config());
        assert_eq!(tree.size(), 6);

        tree.insert(square(1.0, 0.0), 99).unwrap();
        let everything = BoundingBox::new(-10.0, -10.0, 100.0, 100.0);
        assert!(tree.find_intersecting_keys(&everything).is_err());

        // The intact leaf took the insertion before the damaged one was read.
        assert_eq!(tree.pending_operations(), 0);
        assert_eq!(tree.size(), 7);
        assert_eq!(tree.stats().piggybacked_insertions, 1);

        tree.flush_buffer().unwrap();
        assert_eq!(tree.size(), 7);

        let near_origin = BoundingBox::new(-1.0, -1.0, 6.0, 2.0);
        assert_eq!(sorted(tree.find_intersecting_keys(&near_origin).unwrap()), vec![0, 1, 2, 99]);
        assert_eq!(tree.size(), 7);
        assert_eq!(tree.stats().piggybacked_insertions, 1);
    }

    #[test]
    fn test_failed_reinsert_keeps_pending_deletion() {
        let dir = tempdir().unwrap();
        let config = small_config().with_piggybacking(false);
        let tree = open_with_damaged_leaf(&dir.path().join("t.rrtree"), config);

        let damaged = square(22.0, 0.0);
        assert_eq!(tree.delete(damaged, 4).unwrap(), BufferOutcome::Buffered);
        assert_eq!(tree.pending_operations(), 1);

        assert!(tree.insert(damaged, 4).is_err());
        assert_eq!(tree.pending_operations(), 1);
        assert_eq!(tree.stats().annihilated_operations, 0);
        assert_eq!(tree.delete(damaged, 4).unwrap(), BufferOutcome::Duplicate);
    }

    #[test]
    fn test_failed_flush_reports_dropped_operations() {
        let dir = tempdir().unwrap();
        let config = small_config().with_piggybacking(false);
        let tree = open_with_damaged_leaf(&dir.path().join("t.rrtree"), config);

        tree.insert(square(22.5, 0.0), 50).unwrap();
        assert!(tree.flush_buffer().is_err());

        let stats = tree.stats();
        assert_eq!(stats.failed_flushes, 1);
        assert_eq!(stats.dropped_operations, 1);
        assert_eq!(stats.flushes, 0);
        assert_eq!(tree.pending_operations(), 0);
        assert_eq!(tree.size(), 6);
    }

    #[test]
    fn test_concurrent_writers_and_readers() {
        let dir = tempdir().unwrap();
        let config = small_config().with_buffer_capacity(16);
        let tree = Arc::new(RRTree::create(dir.path().join("t.rrtree"), config).unwrap());

        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let tree = Arc::clone(&tree);
                thread::spawn(move || {
                    for i in 0..25u64 {
                        let id = t * 100 + i;
                        tree.insert(square(i as f64 * 2.0, t as f64 * 2.0), id).unwrap();
                        tree.find_intersecting_keys(&square(i as f64 * 2.0, 0.0)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        tree.flush_buffer().unwrap();
        assert_eq!(tree.size(), 100);
        assert!(tree.check_integrity().unwrap().is_valid);
    }
}
