//! A visited leaf as a piggybacking target.

use crate::bounding_box::BoundingBox;
use crate::buffer::{OperationEntry, PiggybackTarget, PiggybackingInfo};
use crate::config::NodeCapacity;

use super::rtree_types::{compute_entries_bbox, LeafEntry};

/// Leaf entries taken out of a page for one piggybacking pass.
///
/// Insertions fit when the leaf region (widened by epsilon when asked)
/// contains them; deletions fit only when the leaf stores the exact entry.
/// Deletions never take the leaf below `min_leaf_entries` and insertions
/// never take it above `max_leaf_entries`.
#[derive(Debug, Clone)]
pub struct DiskLeaf {
    entries: Vec<LeafEntry>,
    capacity: NodeCapacity,
    epsilon: f64,
}

impl DiskLeaf {
    pub fn new(entries: Vec<LeafEntry>, capacity: NodeCapacity, epsilon: f64) -> Self {
        Self {
            entries,
            capacity,
            epsilon,
        }
    }

    pub fn entries(&self) -> &[LeafEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<LeafEntry> {
        self.entries
    }
}

impl PiggybackTarget<LeafEntry> for DiskLeaf {
    fn compute_descriptor(&self) -> Option<BoundingBox> {
        if self.entries.is_empty() {
            None
        } else {
            Some(compute_entries_bbox(&self.entries))
        }
    }

    fn select_fitting_operations<I>(&self, candidates: I, use_epsilon: bool) -> Vec<OperationEntry<LeafEntry>>
    where
        I: Iterator<Item = OperationEntry<LeafEntry>>,
    {
        let Some(descriptor) = self.compute_descriptor() else {
            return Vec::new();
        };
        let catchment = if use_epsilon {
            descriptor.expanded(self.epsilon)
        } else {
            descriptor
        };

        let mut fitting: Vec<_> = candidates
            .filter(|op| {
                if op.is_insertion() {
                    catchment.contains(&op.descriptor())
                } else {
                    self.entries.contains(op.data())
                }
            })
            .collect();
        fitting.sort_by(|a, b| a.data().cmp(b.data()).then(a.kind().cmp(&b.kind())));
        fitting
    }

    fn operation_will_increase_node_size(&self, entry: &OperationEntry<LeafEntry>) -> bool {
        entry.is_insertion()
    }

    fn limit_number_of_operations(&mut self, info: &mut PiggybackingInfo) {
        let len = self.entries.len();
        let requested_deletions = info.num_size_decreasing();
        let requested_insertions = info.num_size_increasing();

        let removable = len - len.min(self.capacity.min_leaf_entries);
        let accepted_deletions = requested_deletions.min(removable);
        let room = (self.capacity.max_leaf_entries + accepted_deletions).saturating_sub(len);
        let accepted_insertions = requested_insertions.min(room);

        info.set_unpiggybackable_size_decreasing(requested_deletions - accepted_deletions);
        info.set_unpiggybackable_size_increasing(requested_insertions - accepted_insertions);
        if accepted_deletions + accepted_insertions > 0 {
            info.set_node_changed(true);
        }
    }

    fn execute_constrained_subset_of_ops(
        &mut self,
        candidates: &[OperationEntry<LeafEntry>],
        max_insertions: usize,
        max_deletions: usize,
    ) -> Vec<OperationEntry<LeafEntry>> {
        let mut applied = Vec::new();

        for op in candidates.iter().filter(|op| op.is_deletion()).take(max_deletions) {
            if let Some(pos) = self.entries.iter().position(|e| e == op.data()) {
                self.entries.remove(pos);
                applied.push(op.clone());
            }
        }
        for op in candidates.iter().filter(|op| op.is_insertion()).take(max_insertions) {
            self.entries.push(*op.data());
            applied.push(op.clone());
        }

        applied
    }
}
