//! Classification of buffered operations by the child subtree they affect.
//!
//! A [`OperationGroupMaker`] runs once per internal node visited by a
//! buffer flush. It partitions the batch destined below that node into one
//! [`OperationGroup`](super::group::OperationGroup) per child index entry,
//! plus an orphan bucket for operations the grouped descent cannot place.

use std::collections::BTreeMap;

use log::trace;

use super::group::{GroupKey, IndexEntryToGroupMap};
use super::operation::{OperationEntry, OperationKind, SpatialItem};
use crate::disk_rtree::{ChildRef, Node};
use crate::errors::{RRTreeError, RRTreeResult};

/// Policy used to route deletions. Insertions are always routed to the
/// single subtree picked by [`Node::choose_subtree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupingStrategy {
    /// A deletion joins the group of every child whose descriptor contains
    /// it. Deletions contained in no child go to the orphan bucket.
    #[default]
    Trivial,
    /// Deletions bypass per-subtree grouping and go to the orphan bucket.
    InsertionsOnly,
    /// Deletions are routed exactly like insertions: one subtree, never split.
    DeletionsAsInsertions,
}

/// Groups operations per child subtree according to a [`GroupingStrategy`].
#[derive(Debug, Clone, Default)]
pub struct OperationGroupMaker {
    strategy: GroupingStrategy,
    /// split count -> number of deletions split that many ways
    deletion_splits: BTreeMap<usize, u64>,
}

impl OperationGroupMaker {
    pub fn new(strategy: GroupingStrategy) -> Self {
        Self {
            strategy,
            deletion_splits: BTreeMap::new(),
        }
    }

    pub fn strategy(&self) -> GroupingStrategy {
        self.strategy
    }

    /// Partitions `operations` among the child index entries of `node`.
    ///
    /// # Errors
    ///
    /// Returns [`RRTreeError::InvalidArgument`] when `node` is a leaf or an
    /// internal node without index entries. Nothing is grouped in that case.
    pub fn group_operations<T, I>(
        &mut self,
        node: &Node,
        operations: I,
    ) -> RRTreeResult<IndexEntryToGroupMap<T>>
    where
        T: SpatialItem,
        I: IntoIterator<Item = OperationEntry<T>>,
    {
        let children = match node {
            Node::Internal { children, .. } if !children.is_empty() => children,
            Node::Internal { .. } => {
                return Err(RRTreeError::InvalidArgument(
                    "cannot group operations below an internal node without index entries".into(),
                ))
            }
            Node::Leaf { .. } => {
                return Err(RRTreeError::InvalidArgument(
                    "cannot group operations below a leaf node".into(),
                ))
            }
        };

        let mut map = IndexEntryToGroupMap::new();
        for op in operations {
            match (op.kind(), self.strategy) {
                (OperationKind::Insertion, _)
                | (OperationKind::Deletion, GroupingStrategy::DeletionsAsInsertions) => {
                    route_to_chosen_subtree(children, op, &mut map)
                }
                (OperationKind::Deletion, GroupingStrategy::InsertionsOnly) => map.add_orphan(op),
                (OperationKind::Deletion, GroupingStrategy::Trivial) => {
                    self.split_deletion(children, op, &mut map)
                }
            }
        }
        Ok(map)
    }

    fn split_deletion<T: SpatialItem>(
        &mut self,
        children: &[ChildRef],
        op: OperationEntry<T>,
        map: &mut IndexEntryToGroupMap<T>,
    ) {
        let descriptor = op.descriptor();
        let containing: Vec<_> = children
            .iter()
            .filter(|child| child.bbox.contains(&descriptor))
            .map(|child| child.page_id)
            .collect();

        *self.deletion_splits.entry(containing.len()).or_insert(0) += 1;

        match containing.as_slice() {
            [] => map.add_orphan(op),
            [page_id] => map.add(GroupKey::Subtree(*page_id), op),
            pages => {
                trace!("deletion {:?} split across {} subtrees", op.data(), pages.len());
                for page_id in pages {
                    map.add(GroupKey::Subtree(*page_id), op.clone());
                }
            }
        }
    }

    /// Histogram of how many child subtrees each deletion was split across
    /// (Trivial strategy only). Key 0 counts deletions contained in no child.
    pub fn deletion_splits(&self) -> &BTreeMap<usize, u64> {
        &self.deletion_splits
    }

    pub fn reset_statistics(&mut self) {
        self.deletion_splits.clear();
    }
}

fn route_to_chosen_subtree<T: SpatialItem>(
    children: &[ChildRef],
    op: OperationEntry<T>,
    map: &mut IndexEntryToGroupMap<T>,
) {
    match Node::choose_child(children, &op.descriptor()) {
        Some(child) => map.add(GroupKey::Subtree(child.page_id), op),
        None => map.add_orphan(op),
    }
}
