//! DiskRTree implementation.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexSet;
use log::{debug, warn};
use parking_lot::RwLock;

use super::leaf::DiskLeaf;
use super::rtree_cache::PageCache;
use super::rtree_storage::Storage;
use super::rtree_types::{
    compute_children_bbox, ChildRef, FileHeader, FlushReport, IntegrityReport, LeafEntry, Node,
    PageId, SearchReport, TreeStats,
};
use crate::bounding_box::BoundingBox;
use crate::buffer::{
    GroupKey, LeafNodeModifier, OperationBuffer, OperationEntry, OperationGroupMaker,
    OperationSink, PiggybackingInfo, UpdateBuffer,
};
use crate::config::NodeCapacity;
use crate::errors::{RRTreeError, RRTreeResult};

/// Which leaf entries a search reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// Entries sharing at least one point with the query
    Intersecting,
    /// Entries lying entirely inside the query
    Contained,
}

impl SearchMode {
    /// Whether an entry with `bbox` is reported for `query`.
    pub fn matches(self, query: &BoundingBox, bbox: &BoundingBox) -> bool {
        match self {
            SearchMode::Intersecting => query.intersects(bbox),
            SearchMode::Contained => query.contains(bbox),
        }
    }
}

/// Everything a search needs to piggyback buffered operations onto the
/// leaves it visits.
pub struct PiggybackPass<'a, B> {
    pub modifier: &'a mut LeafNodeModifier<LeafEntry>,
    pub buffer: &'a B,
    pub use_epsilon: bool,
    pub epsilon: f64,
}

impl<'a, B: OperationBuffer<LeafEntry>> PiggybackPass<'a, B> {
    pub fn new(
        modifier: &'a mut LeafNodeModifier<LeafEntry>,
        buffer: &'a B,
        use_epsilon: bool,
        epsilon: f64,
    ) -> Self {
        Self {
            modifier,
            buffer,
            use_epsilon,
            epsilon,
        }
    }
}

/// A paged R-Tree stored in a single file.
///
/// Nodes are loaded lazily through an LRU page cache; only the header is
/// read on open. Changes stay in the cache until evicted or flushed.
pub struct DiskRTree {
    inner: Arc<DiskRTreeInner>,
}

struct DiskRTreeInner {
    storage: Storage,
    cache: RwLock<PageCache>,
    header: RwLock<FileHeader>,
    stats: IoStatistics,
    closed: RwLock<bool>,
    /// Pages freed by this session, reused before growing the file
    free_pages: RwLock<Vec<PageId>>,
}

struct IoStatistics {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    disk_reads: AtomicU64,
    disk_writes: AtomicU64,
}

impl IoStatistics {
    fn new() -> Self {
        Self {
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            disk_reads: AtomicU64::new(0),
            disk_writes: AtomicU64::new(0),
        }
    }
}

/// Bookkeeping for one `apply_operations` call.
struct FlushState {
    capacity: NodeCapacity,
    report: FlushReport,
    /// Deletions a visited leaf did not hold
    missed: IndexSet<OperationEntry<LeafEntry>>,
    /// Deletions some leaf applied; a split deletion missed elsewhere is fine
    applied: HashSet<OperationEntry<LeafEntry>>,
}

impl DiskRTree {
    /// Create an empty tree at `path`, truncating any existing file.
    pub fn create(path: impl AsRef<Path>, capacity: NodeCapacity, cache_pages: usize) -> RRTreeResult<Self> {
        capacity.validate()?;
        let storage = Storage::create(path.as_ref())?;
        let header = FileHeader::new(capacity);
        storage.write_header(&header)?;
        storage.sync()?;
        debug!("created tree file {:?} with {:?}", path.as_ref(), capacity);

        Ok(Self::from_parts(storage, header, cache_pages))
    }

    /// Open an existing tree. Only the header is read; node capacities come
    /// from the file.
    pub fn open(path: impl AsRef<Path>, cache_pages: usize) -> RRTreeResult<Self> {
        let storage = Storage::open(path.as_ref())?;
        let header = storage.read_header()?;
        header.validate()?;
        debug!(
            "opened tree file {:?}: {} entries, height {}",
            path.as_ref(),
            header.entry_count,
            header.height
        );

        Ok(Self::from_parts(storage, header, cache_pages))
    }

    fn from_parts(storage: Storage, header: FileHeader, cache_pages: usize) -> Self {
        Self {
            inner: Arc::new(DiskRTreeInner {
                storage,
                cache: RwLock::new(PageCache::new(cache_pages)),
                header: RwLock::new(header),
                stats: IoStatistics::new(),
                closed: RwLock::new(false),
                free_pages: RwLock::new(Vec::new()),
            }),
        }
    }

    fn check_closed(&self) -> RRTreeResult<()> {
        if *self.inner.closed.read() {
            Err(RRTreeError::Closed)
        } else {
            Ok(())
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.read()
    }

    pub fn capacity(&self) -> NodeCapacity {
        self.inner.header.read().capacity
    }

    /// Committed entries
    pub fn size(&self) -> u64 {
        self.inner.header.read().entry_count
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// 0 for an empty tree, 1 when the root is a leaf
    pub fn height(&self) -> u32 {
        self.inner.header.read().height
    }

    pub fn stats(&self) -> TreeStats {
        let header = self.inner.header.read();
        TreeStats {
            total_entries: header.entry_count,
            tree_height: header.height,
            cached_pages: self.inner.cache.read().len() as u64,
            cache_hits: self.inner.stats.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.inner.stats.cache_misses.load(Ordering::Relaxed),
            disk_reads: self.inner.stats.disk_reads.load(Ordering::Relaxed),
            disk_writes: self.inner.stats.disk_writes.load(Ordering::Relaxed),
            free_pages: self.inner.free_pages.read().len() as u64,
        }
    }

    /// Traverses every subtree intersecting `query`, calling `visit` for each
    /// matching leaf entry.
    ///
    /// Each visited leaf is first offered to the pass's modifier. Leaves the
    /// modifier changes are written back and the bounding boxes of their
    /// ancestors refreshed; results reflect the modified leaves. The caller
    /// owns finalizing the modifier afterwards, also when the search fails:
    /// leaves changed before the failure stay changed.
    pub fn search<B, F>(
        &self,
        query: &BoundingBox,
        mode: SearchMode,
        pass: &mut PiggybackPass<'_, B>,
        mut visit: F,
    ) -> RRTreeResult<SearchReport>
    where
        B: OperationBuffer<LeafEntry>,
        F: FnMut(&LeafEntry),
    {
        self.check_closed()?;
        let (root, capacity) = {
            let header = self.inner.header.read();
            (header.root_page, header.capacity)
        };

        let mut report = SearchReport::default();
        let mut failure = None;
        if root != 0 {
            self.search_recursive(
                root,
                query,
                mode,
                capacity,
                pass,
                &mut visit,
                &mut report,
                &mut failure,
            );
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    /// Keys of matching entries, without piggybacking.
    pub fn find_keys(&self, query: &BoundingBox, mode: SearchMode) -> RRTreeResult<Vec<u64>> {
        let mut modifier = LeafNodeModifier::null();
        let buffer = UpdateBuffer::new(1);
        let mut pass = PiggybackPass::new(&mut modifier, &buffer, false, 0.0);
        let mut keys = Vec::new();
        self.search(query, mode, &mut pass, |entry| keys.push(entry.id))?;
        Ok(keys)
    }

    /// Returns the new bounding box of the node when it changed.
    ///
    /// The first error stops the traversal and lands in `failure`. Nodes
    /// changed before it are still written back along with their ancestors,
    /// since the modifier already counts their operations as applied.
    #[allow(clippy::too_many_arguments)]
    fn search_recursive<B, F>(
        &self,
        page_id: PageId,
        query: &BoundingBox,
        mode: SearchMode,
        capacity: NodeCapacity,
        pass: &mut PiggybackPass<'_, B>,
        visit: &mut F,
        report: &mut SearchReport,
        failure: &mut Option<RRTreeError>,
    ) -> Option<BoundingBox>
    where
        B: OperationBuffer<LeafEntry>,
        F: FnMut(&LeafEntry),
    {
        let node = match self.read_node(page_id) {
            Ok(node) => node,
            Err(err) => {
                record_failure(failure, err);
                return None;
            }
        };

        let node = match node {
            Node::Leaf { entries } => {
                report.leaves_visited += 1;
                let mut leaf = DiskLeaf::new(entries, capacity, pass.epsilon);
                let mut info = PiggybackingInfo::new();
                let changed =
                    pass.modifier
                        .modify(&mut leaf, pass.buffer, pass.use_epsilon, pass.epsilon, &mut info);
                report.unpiggybackable_insertions += info.unpiggybackable_size_increasing() as u64;
                report.unpiggybackable_deletions += info.unpiggybackable_size_decreasing() as u64;

                let entries = leaf.into_entries();
                for entry in entries.iter().filter(|e| mode.matches(query, &e.bbox)) {
                    visit(entry);
                }

                if !changed {
                    return None;
                }
                report.leaves_changed += 1;
                Node::Leaf { entries }
            }
            Node::Internal {
                mut children,
                level,
            } => {
                let mut changed = false;
                for child in children.iter_mut() {
                    if failure.is_some() {
                        break;
                    }
                    if !child.bbox.intersects(query) {
                        continue;
                    }
                    if let Some(bbox) = self.search_recursive(
                        child.page_id,
                        query,
                        mode,
                        capacity,
                        pass,
                        visit,
                        report,
                        failure,
                    ) {
                        child.bbox = bbox;
                        changed = true;
                    }
                }

                if !changed {
                    return None;
                }
                Node::Internal { children, level }
            }
        };

        // The cache keeps the node even when writing an evicted page fails.
        let bbox = node.compute_bbox();
        if let Err(err) = self.write_node(page_id, node) {
            record_failure(failure, err);
        }
        Some(bbox)
    }

    /// Applies a batch of buffered operations in one grouped descent.
    ///
    /// At every internal node `group_maker` partitions the batch among the
    /// child entries; leaves apply their deletions, then their insertions.
    /// Overfull nodes split evenly along the x axis, emptied nodes are
    /// freed, and the root grows or collapses as needed. Deletions the
    /// descent could not place are retried by exact removal.
    pub fn apply_operations(
        &self,
        mut operations: Vec<OperationEntry<LeafEntry>>,
        group_maker: &mut OperationGroupMaker,
    ) -> RRTreeResult<FlushReport> {
        self.check_closed()?;
        let mut state = FlushState {
            capacity: self.capacity(),
            report: FlushReport::default(),
            missed: IndexSet::new(),
            applied: HashSet::new(),
        };
        if operations.is_empty() {
            return Ok(state.report);
        }
        operations.sort_by(|a, b| a.data().cmp(b.data()).then(a.kind().cmp(&b.kind())));

        let inserted: HashSet<LeafEntry> = operations
            .iter()
            .filter(|op| op.is_insertion())
            .map(|op| *op.data())
            .collect();

        let (mut root, mut height) = {
            let header = self.inner.header.read();
            (header.root_page, header.height)
        };

        if root == 0 {
            if inserted.is_empty() {
                for op in operations {
                    warn!("deletion of {:?} on an empty tree", op.data());
                    state.report.unresolved_deletions += 1;
                }
                return Ok(state.report);
            }
            root = self.allocate_page();
            self.write_node(root, Node::Leaf { entries: Vec::new() })?;
            height = 1;
        }

        let top = self.apply_to_subtree(root, operations, group_maker, &mut state)?;
        let (root, height) = self.install_root(top, height - 1, &mut state.report)?;

        {
            let mut header = self.inner.header.write();
            header.root_page = root;
            header.height = height;
            header.entry_count = (header.entry_count + state.report.insertions_applied)
                .saturating_sub(state.report.deletions_applied);
        }

        let FlushState {
            mut report,
            missed,
            applied,
            ..
        } = state;
        for op in missed.into_iter().filter(|op| !applied.contains(op)) {
            let entry = op.data();
            // A copy inserted by this batch must survive its own deletion.
            let found = if inserted.contains(entry) {
                self.count_entry(entry)? > 1 && self.remove_entry(entry)?
            } else {
                self.remove_entry(entry)?
            };
            if found {
                report.deletions_applied += 1;
                report.deletions_retried += 1;
            } else {
                warn!("deletion of {:?} matched no entry", entry);
                report.unresolved_deletions += 1;
            }
        }

        debug!(
            "applied batch: {} insertions, {} deletions ({} retried, {} unresolved), {} splits, {} freed",
            report.insertions_applied,
            report.deletions_applied,
            report.deletions_retried,
            report.unresolved_deletions,
            report.nodes_split,
            report.nodes_freed
        );
        Ok(report)
    }

    /// Applies `operations` below `page_id` and returns the index entries
    /// that now stand in for the node: none if it emptied, several if it split.
    fn apply_to_subtree(
        &self,
        page_id: PageId,
        operations: Vec<OperationEntry<LeafEntry>>,
        group_maker: &mut OperationGroupMaker,
        state: &mut FlushState,
    ) -> RRTreeResult<Vec<ChildRef>> {
        let node = self.read_node(page_id)?;
        match node {
            Node::Leaf { entries } => self.apply_to_leaf(page_id, entries, operations, state),
            Node::Internal { .. } => self.apply_to_internal(page_id, node, operations, group_maker, state),
        }
    }

    fn apply_to_leaf(
        &self,
        page_id: PageId,
        mut entries: Vec<LeafEntry>,
        operations: Vec<OperationEntry<LeafEntry>>,
        state: &mut FlushState,
    ) -> RRTreeResult<Vec<ChildRef>> {
        for op in operations.iter().filter(|op| op.is_deletion()) {
            // A split deletion removes one copy only.
            if state.applied.contains(op) {
                continue;
            }
            match entries.iter().position(|e| e == op.data()) {
                Some(pos) => {
                    entries.remove(pos);
                    state.applied.insert(op.clone());
                    state.report.deletions_applied += 1;
                }
                None => {
                    state.missed.insert(op.clone());
                }
            }
        }
        for op in operations.iter().filter(|op| op.is_insertion()) {
            entries.push(*op.data());
            state.report.insertions_applied += 1;
        }

        if entries.is_empty() {
            self.free_page(page_id);
            state.report.nodes_freed += 1;
            return Ok(Vec::new());
        }

        let parts = split_evenly(entries, state.capacity.max_leaf_entries, |e| e.bbox.center_x());
        state.report.nodes_split += (parts.len() - 1) as u64;
        self.write_parts(page_id, parts, |entries| Node::Leaf { entries })
    }

    fn apply_to_internal(
        &self,
        page_id: PageId,
        node: Node,
        operations: Vec<OperationEntry<LeafEntry>>,
        group_maker: &mut OperationGroupMaker,
        state: &mut FlushState,
    ) -> RRTreeResult<Vec<ChildRef>> {
        let mut groups = group_maker.group_operations(&node, operations)?;
        let Node::Internal { children, level } = node else {
            return Err(RRTreeError::InvalidOperation(format!(
                "page {} is not an internal node",
                page_id
            )));
        };

        if let Some(orphans) = groups.take(GroupKey::Orphan) {
            for op in orphans {
                if op.is_deletion() {
                    state.missed.insert(op);
                    continue;
                }
                let Some(child) = Node::choose_child(&children, &op.descriptor()) else {
                    return Err(RRTreeError::InvalidOperation(format!(
                        "no subtree of page {} can take insertion {:?}",
                        page_id,
                        op.data()
                    )));
                };
                groups.add(GroupKey::Subtree(child.page_id), op);
            }
        }

        let mut new_children = Vec::with_capacity(children.len());
        for child in children {
            match groups.take(GroupKey::Subtree(child.page_id)) {
                Some(group) => new_children.extend(self.apply_to_subtree(
                    child.page_id,
                    group.into_vec(),
                    group_maker,
                    state,
                )?),
                None => new_children.push(child),
            }
        }

        if new_children.is_empty() {
            self.free_page(page_id);
            state.report.nodes_freed += 1;
            return Ok(Vec::new());
        }

        let parts = split_evenly(new_children, state.capacity.max_internal_children, |c| {
            c.bbox.center_x()
        });
        state.report.nodes_split += (parts.len() - 1) as u64;
        self.write_parts(page_id, parts, |children| Node::Internal { children, level })
    }

    /// Writes the first part to `page_id` and the rest to fresh pages.
    fn write_parts<T, M>(&self, page_id: PageId, parts: Vec<Vec<T>>, make: M) -> RRTreeResult<Vec<ChildRef>>
    where
        M: Fn(Vec<T>) -> Node,
    {
        let mut refs = Vec::with_capacity(parts.len());
        for (i, part) in parts.into_iter().enumerate() {
            let target = if i == 0 { page_id } else { self.allocate_page() };
            let node = make(part);
            refs.push(ChildRef {
                bbox: node.compute_bbox(),
                page_id: target,
            });
            self.write_node(target, node)?;
        }
        Ok(refs)
    }

    /// Builds new root levels over `top` until one node remains, then drops
    /// single-child roots. Returns the root page and tree height.
    fn install_root(
        &self,
        mut top: Vec<ChildRef>,
        mut level: u32,
        report: &mut FlushReport,
    ) -> RRTreeResult<(PageId, u32)> {
        if top.is_empty() {
            debug!("tree emptied");
            return Ok((0, 0));
        }

        let max_children = self.capacity().max_internal_children;
        while top.len() > 1 {
            level += 1;
            let parts = split_evenly(top, max_children, |c| c.bbox.center_x());
            let mut next = Vec::with_capacity(parts.len());
            for children in parts {
                let page_id = self.allocate_page();
                let bbox = compute_children_bbox(&children);
                self.write_node(page_id, Node::Internal { children, level })?;
                next.push(ChildRef { bbox, page_id });
            }
            report.nodes_split += (next.len() - 1) as u64;
            debug!("root grew to level {} over {} nodes", level, next.len());
            top = next;
        }

        self.collapse_root(top[0].page_id, level + 1)
    }

    /// Replaces a root with a single child by that child until the root has
    /// several children or is a leaf. An empty root empties the tree.
    fn collapse_root(&self, mut root: PageId, mut height: u32) -> RRTreeResult<(PageId, u32)> {
        loop {
            match self.read_node(root)? {
                Node::Internal { children, .. } if children.len() == 1 => {
                    self.free_page(root);
                    root = children[0].page_id;
                    height = height.saturating_sub(1);
                    debug!("root collapsed to page {} (height {})", root, height);
                }
                node if node.is_empty() => {
                    self.free_page(root);
                    return Ok((0, 0));
                }
                _ => return Ok((root, height)),
            }
        }
    }

    /// Removes one copy of exactly `entry`, descending every child whose
    /// bounding box contains it.
    pub fn remove_entry(&self, entry: &LeafEntry) -> RRTreeResult<bool> {
        self.check_closed()?;
        let (root, height) = {
            let header = self.inner.header.read();
            (header.root_page, header.height)
        };
        if root == 0 || !self.remove_recursive(root, entry)? {
            return Ok(false);
        }

        let (root, height) = self.collapse_root(root, height)?;
        let mut header = self.inner.header.write();
        header.entry_count = header.entry_count.saturating_sub(1);
        header.root_page = root;
        header.height = height;
        Ok(true)
    }

    fn remove_recursive(&self, page_id: PageId, entry: &LeafEntry) -> RRTreeResult<bool> {
        let mut node = self.read_node(page_id)?;

        match &mut node {
            Node::Leaf { entries } => match entries.iter().position(|e| e == entry) {
                Some(pos) => {
                    entries.remove(pos);
                    self.write_node(page_id, node)?;
                    Ok(true)
                }
                None => Ok(false),
            },
            Node::Internal { children, .. } => {
                for i in 0..children.len() {
                    if children[i].bbox.contains(&entry.bbox)
                        && self.remove_recursive(children[i].page_id, entry)?
                    {
                        let child_node = self.read_node(children[i].page_id)?;
                        if child_node.is_empty() {
                            self.free_page(children[i].page_id);
                            children.remove(i);
                        } else {
                            children[i].bbox = child_node.compute_bbox();
                        }
                        self.write_node(page_id, node)?;
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    /// Number of stored copies of exactly `entry`.
    pub fn count_entry(&self, entry: &LeafEntry) -> RRTreeResult<usize> {
        self.check_closed()?;
        let root = self.inner.header.read().root_page;
        if root == 0 {
            return Ok(0);
        }
        self.count_recursive(root, entry)
    }

    fn count_recursive(&self, page_id: PageId, entry: &LeafEntry) -> RRTreeResult<usize> {
        match self.read_node(page_id)? {
            Node::Leaf { entries } => Ok(entries.iter().filter(|e| *e == entry).count()),
            Node::Internal { children, .. } => {
                let mut count = 0;
                for child in children.iter().filter(|c| c.bbox.contains(&entry.bbox)) {
                    count += self.count_recursive(child.page_id, entry)?;
                }
                Ok(count)
            }
        }
    }

    /// Every stored entry, in tree order.
    pub fn all_entries(&self) -> RRTreeResult<Vec<LeafEntry>> {
        self.check_closed()?;
        let root = self.inner.header.read().root_page;
        let mut entries = Vec::new();
        if root != 0 {
            self.collect_entries_recursive(root, &mut entries)?;
        }
        Ok(entries)
    }

    fn collect_entries_recursive(&self, page_id: PageId, out: &mut Vec<LeafEntry>) -> RRTreeResult<()> {
        match self.read_node(page_id)? {
            Node::Leaf { entries } => out.extend(entries),
            Node::Internal { children, .. } => {
                for child in children {
                    self.collect_entries_recursive(child.page_id, out)?;
                }
            }
        }
        Ok(())
    }

    /// Walks the whole tree checking node sizes, levels, child bounding
    /// boxes and the committed entry count.
    pub fn check_integrity(&self) -> RRTreeResult<IntegrityReport> {
        self.check_closed()?;
        let header = self.inner.header.read().clone();
        let mut report = IntegrityReport::new();

        if let Err(e) = header.validate() {
            report.fail(format!("Invalid header: {}", e));
            return Ok(report);
        }

        if header.root_page == 0 {
            if header.height != 0 || header.entry_count != 0 {
                report.fail(format!(
                    "empty tree records height {} and {} entries",
                    header.height, header.entry_count
                ));
            }
            return Ok(report);
        }

        let root = self.read_node(header.root_page)?;
        if root.level() + 1 != header.height {
            report.fail(format!(
                "root level {} does not match height {}",
                root.level(),
                header.height
            ));
        }
        self.check_node(header.root_page, &root, header.capacity, &mut report)?;

        if report.entries_found != header.entry_count {
            report.fail(format!(
                "header records {} entries, tree holds {}",
                header.entry_count, report.entries_found
            ));
        }
        Ok(report)
    }

    fn check_node(
        &self,
        page_id: PageId,
        node: &Node,
        capacity: NodeCapacity,
        report: &mut IntegrityReport,
    ) -> RRTreeResult<()> {
        report.pages_checked += 1;
        match node {
            Node::Leaf { entries } => {
                if entries.len() > capacity.max_leaf_entries {
                    report.fail(format!("page {}: leaf holds {} entries", page_id, entries.len()));
                }
                report.entries_found += entries.len() as u64;
            }
            Node::Internal { children, level } => {
                if children.is_empty() || children.len() > capacity.max_internal_children {
                    report.fail(format!(
                        "page {}: internal node holds {} children",
                        page_id,
                        children.len()
                    ));
                }
                for child in children {
                    let child_node = self.read_node(child.page_id)?;
                    if child_node.level() + 1 != *level {
                        report.fail(format!(
                            "page {}: child {} at level {} under level {}",
                            page_id,
                            child.page_id,
                            child_node.level(),
                            level
                        ));
                    }
                    if child_node.compute_bbox() != child.bbox {
                        report.fail(format!(
                            "page {}: stale bounding box for child {}",
                            page_id, child.page_id
                        ));
                    }
                    self.check_node(child.page_id, &child_node, capacity, report)?;
                }
            }
        }
        Ok(())
    }

    /// Flush all dirty pages and the header to disk
    pub fn flush(&self) -> RRTreeResult<()> {
        {
            let mut cache = self.inner.cache.write();
            for page_id in cache.dirty_pages() {
                if let Some(cached) = cache.peek(page_id) {
                    self.inner.storage.write_page(page_id, &cached.node)?;
                    self.inner.stats.disk_writes.fetch_add(1, Ordering::Relaxed);
                }
                cache.mark_clean(page_id);
            }
        }

        self.inner.storage.write_header(&self.inner.header.read())?;
        self.inner.storage.sync()?;
        Ok(())
    }

    pub fn close(&self) -> RRTreeResult<()> {
        let mut closed = self.inner.closed.write();
        if *closed {
            return Ok(());
        }

        self.flush()?;
        *closed = true;
        debug!("closed tree file {:?}", self.inner.storage.path());
        Ok(())
    }

    /// Drops every entry, keeping the file and its node capacity.
    pub fn clear(&self) -> RRTreeResult<()> {
        self.check_closed()?;

        self.inner.cache.write().clear();
        self.inner.free_pages.write().clear();

        let mut header = self.inner.header.write();
        *header = FileHeader::new(header.capacity);
        self.inner.storage.truncate_nodes()?;
        self.inner.storage.write_header(&header)?;
        self.inner.storage.sync()?;
        Ok(())
    }

    fn allocate_page(&self) -> PageId {
        if let Some(page_id) = self.inner.free_pages.write().pop() {
            return page_id;
        }

        let mut header = self.inner.header.write();
        let page_id = header.next_page_id;
        header.next_page_id += 1;
        page_id
    }

    /// Forget a page's contents and queue it for reuse
    fn free_page(&self, page_id: PageId) {
        self.inner.cache.write().remove(page_id);
        self.inner.free_pages.write().push(page_id);
    }

    /// Read a node - first checks cache, then loads from disk.
    fn read_node(&self, page_id: PageId) -> RRTreeResult<Node> {
        {
            let mut cache = self.inner.cache.write();
            if let Some(node) = cache.get(page_id) {
                self.inner.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(node.clone());
            }
        }

        self.inner.stats.cache_misses.fetch_add(1, Ordering::Relaxed);
        self.inner.stats.disk_reads.fetch_add(1, Ordering::Relaxed);

        let node = self.inner.storage.read_page(page_id)?;
        self.cache_node(page_id, node.clone(), false)?;
        Ok(node)
    }

    /// Write a node to cache (marked dirty for later flush)
    fn write_node(&self, page_id: PageId, node: Node) -> RRTreeResult<()> {
        self.cache_node(page_id, node, true)
    }

    /// Add a node to cache; a dirty page evicted to make room is written out.
    fn cache_node(&self, page_id: PageId, node: Node, dirty: bool) -> RRTreeResult<()> {
        let evicted = self.inner.cache.write().insert(page_id, node, dirty);
        if let Some((evicted_id, page)) = evicted {
            if page.dirty {
                self.inner.storage.write_page(evicted_id, &page.node)?;
                self.inner.stats.disk_writes.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}

impl OperationSink<LeafEntry> for DiskRTree {
    /// Commits a piggybacked operation already written into a leaf.
    fn complete_operation(&mut self, entry: &OperationEntry<LeafEntry>) {
        let mut header = self.inner.header.write();
        if entry.is_insertion() {
            header.entry_count += 1;
        } else {
            header.entry_count = header.entry_count.saturating_sub(1);
        }
    }
}

/// Keeps the first error of a traversal.
fn record_failure(failure: &mut Option<RRTreeError>, err: RRTreeError) {
    if failure.is_none() {
        *failure = Some(err);
    }
}

/// Splits `items` into the fewest parts of at most `max` items, with sizes
/// differing by at most one, ordered along the x axis.
fn split_evenly<T, F>(mut items: Vec<T>, max: usize, center_x: F) -> Vec<Vec<T>>
where
    F: Fn(&T) -> f64,
{
    if items.len() <= max {
        return vec![items];
    }
    items.sort_by(|a, b| center_x(a).total_cmp(&center_x(b)));

    let parts = items.len().div_ceil(max);
    let base = items.len() / parts;
    let extra = items.len() % parts;
    let mut rest = items.into_iter();
    (0..parts)
        .map(|i| rest.by_ref().take(base + usize::from(i < extra)).collect())
        .collect()
}

impl Drop for DiskRTree {
    fn drop(&mut self) {
        // Best effort flush on drop
        if !*self.inner.closed.read() {
            let _ = self.flush();
        }
    }
}
