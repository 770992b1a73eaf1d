//! The in-memory update buffer.
//!
//! Pending insertions and deletions live in an `rstar` tree keyed by their
//! descriptor, so a leaf visit can ask for every operation near the leaf
//! without scanning the whole buffer.

use log::debug;
use rstar::{RTree, SelectionFunction, AABB};

use super::operation::{OperationEntry, SpatialItem};
use super::piggyback::OperationBuffer;
use crate::bounding_box::BoundingBox;

/// What [`UpdateBuffer::add`] did with an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOutcome {
    /// Stored as a new pending operation.
    Buffered,
    /// The same entry was already pending; nothing changed.
    Duplicate,
    /// A deletion met a pending insertion of the same item and both vanished.
    Annihilated,
}

/// Selects stored entries whose descriptor intersects a query box.
struct Intersecting(BoundingBox);

impl<T: SpatialItem> SelectionFunction<OperationEntry<T>> for Intersecting {
    fn should_unpack_parent(&self, envelope: &AABB<[f64; 2]>) -> bool {
        let (lower, upper) = (envelope.lower(), envelope.upper());
        BoundingBox::new(lower[0], lower[1], upper[0], upper[1]).intersects(&self.0)
    }

    fn should_unpack_leaf(&self, leaf: &OperationEntry<T>) -> bool {
        leaf.descriptor().intersects(&self.0)
    }
}

/// Bounded set of pending operations.
///
/// The capacity is advisory: `add` never refuses an entry, and the owner
/// is expected to flush once [`UpdateBuffer::is_full`] reports true.
pub struct UpdateBuffer<T: SpatialItem> {
    tree: RTree<OperationEntry<T>>,
    capacity: usize,
}

impl<T: SpatialItem> std::fmt::Debug for UpdateBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateBuffer")
            .field("len", &self.tree.size())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl<T: SpatialItem> UpdateBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            tree: RTree::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.tree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Records a pending operation.
    ///
    /// A deletion whose item has a pending insertion cancels it instead of
    /// being stored. An insertion never cancels a pending deletion here:
    /// whether the deletion targets a committed copy is only known to the
    /// tree owning this buffer.
    pub fn add(&mut self, entry: OperationEntry<T>) -> BufferOutcome {
        if entry.is_deletion() && self.tree.remove(&entry.opposite()).is_some() {
            debug!("deletion of {:?} annihilated a pending insertion", entry.data());
            return BufferOutcome::Annihilated;
        }
        if self.tree.contains(&entry) {
            return BufferOutcome::Duplicate;
        }
        self.tree.insert(entry);
        BufferOutcome::Buffered
    }

    pub fn contains(&self, entry: &OperationEntry<T>) -> bool {
        self.tree.contains(entry)
    }

    /// Whether a deletion of `item` is waiting to be applied.
    pub fn has_pending_deletion(&self, item: &T) -> bool {
        self.tree.contains(&OperationEntry::deletion(item.clone()))
    }

    /// Pending entries of either kind whose descriptor intersects `bbox`.
    pub fn query_intersecting<'a>(
        &'a self,
        bbox: &BoundingBox,
    ) -> impl Iterator<Item = &'a OperationEntry<T>> + 'a {
        self.tree.locate_with_selection_function(Intersecting(*bbox))
    }

    pub fn iter(&self) -> impl Iterator<Item = &OperationEntry<T>> {
        self.tree.iter()
    }

    pub fn pending_insertions(&self) -> impl Iterator<Item = &T> {
        self.tree.iter().filter(|e| e.is_insertion()).map(|e| e.data())
    }

    pub fn pending_deletions(&self) -> impl Iterator<Item = &T> {
        self.tree.iter().filter(|e| e.is_deletion()).map(|e| e.data())
    }

    /// Empties the buffer, returning every pending entry.
    pub fn drain(&mut self) -> Vec<OperationEntry<T>> {
        let tree = std::mem::replace(&mut self.tree, RTree::new());
        tree.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.tree = RTree::new();
    }
}

impl<T: SpatialItem> OperationBuffer<T> for UpdateBuffer<T> {
    fn query_entry_of_any_type<'a>(
        &'a self,
        descriptor: &BoundingBox,
    ) -> Box<dyn Iterator<Item = &'a OperationEntry<T>> + 'a> {
        Box::new(self.query_intersecting(descriptor))
    }

    fn remove_exact_entry(&mut self, entry: &OperationEntry<T>) -> bool {
        self.tree.remove(entry).is_some()
    }
}
