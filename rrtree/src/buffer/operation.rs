//! Buffered operation records.

use std::fmt::Debug;
use std::hash::Hash;

use rstar::{RTreeObject, AABB};

use crate::bounding_box::BoundingBox;

/// A data item that can be stored in the tree and referenced by buffered
/// operations. Identity is the item's `Eq`/`Hash`.
pub trait SpatialItem: Clone + Eq + Hash + Debug {
    /// The region the item occupies.
    fn descriptor(&self) -> BoundingBox;
}

/// What a buffered operation does to its item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperationKind {
    Insertion,
    Deletion,
}

impl OperationKind {
    /// The operation that cancels this one.
    pub fn opposite(self) -> Self {
        match self {
            OperationKind::Insertion => OperationKind::Deletion,
            OperationKind::Deletion => OperationKind::Insertion,
        }
    }
}

/// An immutable pairing of a data item with the kind of update pending on it.
///
/// Two entries referencing the same item with different kinds are distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationEntry<T> {
    data: T,
    kind: OperationKind,
}

impl<T> OperationEntry<T> {
    pub fn new(data: T, kind: OperationKind) -> Self {
        Self { data, kind }
    }

    pub fn insertion(data: T) -> Self {
        Self::new(data, OperationKind::Insertion)
    }

    pub fn deletion(data: T) -> Self {
        Self::new(data, OperationKind::Deletion)
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn is_insertion(&self) -> bool {
        self.kind == OperationKind::Insertion
    }

    pub fn is_deletion(&self) -> bool {
        self.kind == OperationKind::Deletion
    }

    pub fn into_data(self) -> T {
        self.data
    }
}

impl<T: Clone> OperationEntry<T> {
    /// The entry that would cancel this one out in the buffer.
    pub fn opposite(&self) -> Self {
        Self::new(self.data.clone(), self.kind.opposite())
    }
}

impl<T: SpatialItem> OperationEntry<T> {
    pub fn descriptor(&self) -> BoundingBox {
        self.data.descriptor()
    }
}

impl<T: SpatialItem> RTreeObject for OperationEntry<T> {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.descriptor().to_envelope()
    }
}
