//! Leaf piggybacking: merging buffered operations into leaves that a
//! traversal visits anyway.
//!
//! A [`LeafNodeModifier`] is consulted once per visited leaf. The
//! [`Piggybacker`] variant asks the update buffer for operations near the
//! leaf, lets the leaf pick the ones that fit, applies as many as the
//! leaf's capacity allows, and remembers them. Nothing is removed from the
//! buffer until [`LeafNodeModifier::finalize_modifications`] runs, so the
//! buffer stays the source of truth for every operation not yet finalized.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexSet;
use log::{trace, warn};

use super::operation::{OperationEntry, SpatialItem};
use super::tracer::{NoopTracer, ObjectTracer};
use crate::bounding_box::BoundingBox;

/// Per-leaf-visit accounting filled in by [`Piggybacker::modify`] and the
/// visited node, then read back by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PiggybackingInfo {
    num_size_increasing: usize,
    num_size_decreasing: usize,
    unpiggybackable_size_increasing: usize,
    unpiggybackable_size_decreasing: usize,
    ops_not_yet_applied: usize,
    node_changed: bool,
}

impl PiggybackingInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_size_increasing(&mut self) {
        self.num_size_increasing += 1;
    }

    pub fn increment_size_decreasing(&mut self) {
        self.num_size_decreasing += 1;
    }

    pub fn increment_not_yet_applied(&mut self) {
        self.ops_not_yet_applied += 1;
    }

    /// Records that `count` counted operations were applied to the node.
    pub fn mark_applied(&mut self, count: usize) {
        self.ops_not_yet_applied = self.ops_not_yet_applied.saturating_sub(count);
    }

    pub fn num_size_increasing(&self) -> usize {
        self.num_size_increasing
    }

    pub fn num_size_decreasing(&self) -> usize {
        self.num_size_decreasing
    }

    pub fn unpiggybackable_size_increasing(&self) -> usize {
        self.unpiggybackable_size_increasing
    }

    pub fn unpiggybackable_size_decreasing(&self) -> usize {
        self.unpiggybackable_size_decreasing
    }

    /// Candidates counted for this visit that have not been applied.
    pub fn ops_not_yet_applied(&self) -> usize {
        self.ops_not_yet_applied
    }

    /// Capped at the number of size-increasing candidates counted.
    pub fn set_unpiggybackable_size_increasing(&mut self, count: usize) {
        self.unpiggybackable_size_increasing = count.min(self.num_size_increasing);
    }

    /// Capped at the number of size-decreasing candidates counted.
    pub fn set_unpiggybackable_size_decreasing(&mut self, count: usize) {
        self.unpiggybackable_size_decreasing = count.min(self.num_size_decreasing);
    }

    pub fn set_node_changed(&mut self, changed: bool) {
        self.node_changed = changed;
    }

    pub fn is_node_changed(&self) -> bool {
        self.node_changed
    }

    /// How many size-increasing operations the node agreed to take.
    pub fn num_insertions_to_apply(&self) -> usize {
        self.num_size_increasing - self.unpiggybackable_size_increasing
    }

    /// How many size-decreasing operations the node agreed to take.
    pub fn num_deletions_to_apply(&self) -> usize {
        self.num_size_decreasing - self.unpiggybackable_size_decreasing
    }
}

/// A leaf node as seen by the piggybacker. The node alone knows its fit
/// and capacity rules.
pub trait PiggybackTarget<T: SpatialItem> {
    /// Bounding region of the node's current entries; `None` when it has none.
    fn compute_descriptor(&self) -> Option<BoundingBox>;

    /// Picks the candidates that can be merged into this node.
    fn select_fitting_operations<I>(&self, candidates: I, use_epsilon: bool) -> Vec<OperationEntry<T>>
    where
        I: Iterator<Item = OperationEntry<T>>;

    fn operation_will_increase_node_size(&self, entry: &OperationEntry<T>) -> bool;

    /// Sets the unpiggybackable counts on `info` from the counted candidates
    /// and the node's remaining capacity, and may mark the node changed.
    fn limit_number_of_operations(&mut self, info: &mut PiggybackingInfo);

    /// Applies at most `max_insertions` size-increasing and `max_deletions`
    /// size-decreasing candidates in place and returns exactly those applied.
    fn execute_constrained_subset_of_ops(
        &mut self,
        candidates: &[OperationEntry<T>],
        max_insertions: usize,
        max_deletions: usize,
    ) -> Vec<OperationEntry<T>>;
}

/// The pending-operation store consulted and trimmed by the piggybacker.
pub trait OperationBuffer<T: SpatialItem> {
    /// Pending entries of either kind whose region intersects `descriptor`.
    fn query_entry_of_any_type<'a>(
        &'a self,
        descriptor: &BoundingBox,
    ) -> Box<dyn Iterator<Item = &'a OperationEntry<T>> + 'a>;

    /// Removes exactly this entry; returns false if it was not pending.
    fn remove_exact_entry(&mut self, entry: &OperationEntry<T>) -> bool;
}

/// The tree side of finalization.
pub trait OperationSink<T: SpatialItem> {
    /// Makes an operation already merged into a node authoritative.
    fn complete_operation(&mut self, entry: &OperationEntry<T>);
}

/// Tally of finalized piggybacked operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PiggybackStatistics {
    pub insertions: u64,
    pub deletions: u64,
}

impl PiggybackStatistics {
    pub fn record<T>(&mut self, entry: &OperationEntry<T>) {
        if entry.is_insertion() {
            self.insertions += 1;
        } else {
            self.deletions += 1;
        }
    }

    pub fn total(&self) -> u64 {
        self.insertions + self.deletions
    }
}

/// Merges buffered operations into visited leaves and commits them on finalize.
pub struct Piggybacker<T: SpatialItem> {
    applied: IndexSet<OperationEntry<T>>,
    tracer: Arc<dyn ObjectTracer>,
}

impl<T: SpatialItem> fmt::Debug for Piggybacker<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Piggybacker")
            .field("applied", &self.applied)
            .finish_non_exhaustive()
    }
}

impl<T: SpatialItem> Default for Piggybacker<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: SpatialItem> Piggybacker<T> {
    pub fn new() -> Self {
        Self::with_tracer(Arc::new(NoopTracer))
    }

    pub fn with_tracer(tracer: Arc<dyn ObjectTracer>) -> Self {
        Self {
            applied: IndexSet::new(),
            tracer,
        }
    }

    /// Operations applied to nodes and waiting for finalization.
    pub fn pending_commits(&self) -> usize {
        self.applied.len()
    }

    pub fn has_pending_commits(&self) -> bool {
        !self.applied.is_empty()
    }

    /// Merges fitting buffered operations into `node`.
    ///
    /// Returns whether the node reports itself changed. Operations applied
    /// by an earlier call and not yet finalized are never offered again.
    pub fn modify<N, B>(
        &mut self,
        node: &mut N,
        buffer: &B,
        use_epsilon: bool,
        epsilon: f64,
        info: &mut PiggybackingInfo,
    ) -> bool
    where
        N: PiggybackTarget<T>,
        B: OperationBuffer<T>,
    {
        let Some(descriptor) = node.compute_descriptor() else {
            return false;
        };
        let catchment = if use_epsilon {
            descriptor.expanded(epsilon)
        } else {
            descriptor
        };

        let applied = &self.applied;
        let nearby = buffer
            .query_entry_of_any_type(&catchment)
            .filter(|entry| !applied.contains(*entry))
            .cloned();
        let candidates = node.select_fitting_operations(nearby, use_epsilon);

        if candidates.is_empty() {
            trace!("no piggyback candidates for leaf {}", descriptor);
            return false;
        }

        let extra = format!("leaf {}", descriptor);
        for entry in &candidates {
            let tag = if node.operation_will_increase_node_size(entry) {
                info.increment_size_increasing();
                "piggyback-increasing"
            } else {
                info.increment_size_decreasing();
                "piggyback-decreasing"
            };
            self.tracer.trace_update_tree_entry(entry, tag, &extra);
            info.increment_not_yet_applied();
        }

        node.limit_number_of_operations(info);
        let max_insertions = info.num_insertions_to_apply();
        let max_deletions = info.num_deletions_to_apply();

        let executed = node.execute_constrained_subset_of_ops(&candidates, max_insertions, max_deletions);
        info.mark_applied(executed.len());

        trace!(
            "leaf {}: {} candidates, {} applied (caps {} / {})",
            descriptor,
            candidates.len(),
            executed.len(),
            max_insertions,
            max_deletions
        );

        self.applied.extend(executed);
        info.is_node_changed()
    }

    /// Commits every operation applied since the last finalize: the tree
    /// completes it, the buffer forgets it, `stats` counts it.
    pub fn finalize_modifications<B, S>(
        &mut self,
        buffer: &mut B,
        sink: &mut S,
        stats: &mut PiggybackStatistics,
    ) where
        B: OperationBuffer<T>,
        S: OperationSink<T>,
    {
        for entry in self.applied.drain(..) {
            sink.complete_operation(&entry);
            if !buffer.remove_exact_entry(&entry) {
                warn!("piggybacked operation {:?} was no longer buffered", entry);
            }
            stats.record(&entry);
        }
    }
}

/// Strategy consulted on every visited leaf.
#[derive(Debug)]
pub enum LeafNodeModifier<T: SpatialItem> {
    /// Piggybacking disabled.
    Null,
    Piggybacker(Piggybacker<T>),
}

impl<T: SpatialItem> LeafNodeModifier<T> {
    pub fn null() -> Self {
        LeafNodeModifier::Null
    }

    pub fn piggybacker(tracer: Arc<dyn ObjectTracer>) -> Self {
        LeafNodeModifier::Piggybacker(Piggybacker::with_tracer(tracer))
    }

    /// Picks the variant for a tree: piggybacking on or off.
    pub fn from_settings(piggybacking: bool, tracer: Arc<dyn ObjectTracer>) -> Self {
        if piggybacking {
            Self::piggybacker(tracer)
        } else {
            Self::null()
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, LeafNodeModifier::Piggybacker(_))
    }

    pub fn pending_commits(&self) -> usize {
        match self {
            LeafNodeModifier::Null => 0,
            LeafNodeModifier::Piggybacker(p) => p.pending_commits(),
        }
    }

    /// See [`Piggybacker::modify`]. The null modifier never changes a node.
    pub fn modify<N, B>(
        &mut self,
        node: &mut N,
        buffer: &B,
        use_epsilon: bool,
        epsilon: f64,
        info: &mut PiggybackingInfo,
    ) -> bool
    where
        N: PiggybackTarget<T>,
        B: OperationBuffer<T>,
    {
        match self {
            LeafNodeModifier::Null => false,
            LeafNodeModifier::Piggybacker(p) => p.modify(node, buffer, use_epsilon, epsilon, info),
        }
    }

    /// See [`Piggybacker::finalize_modifications`]. A no-op for the null modifier.
    pub fn finalize_modifications<B, S>(
        &mut self,
        buffer: &mut B,
        sink: &mut S,
        stats: &mut PiggybackStatistics,
    ) where
        B: OperationBuffer<T>,
        S: OperationSink<T>,
    {
        if let LeafNodeModifier::Piggybacker(p) = self {
            p.finalize_modifications(buffer, sink, stats);
        }
    }
}
