use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use rstar::AABB;
use serde::{Deserialize, Serialize};

/// A 2D axis-aligned bounding box used as the spatial descriptor of tree
/// entries, index entries and buffered operations.
///
/// Equality and hashing are bit-exact on the four coordinates, and boxes
/// are totally ordered (min corner first, then max corner) so that any
/// collection of descriptors can be sorted deterministically.
///
/// # Examples
///
/// ```rust
/// use rrtree::BoundingBox;
///
/// let leaf = BoundingBox::new(1.0, 1.0, 4.0, 4.0);
/// let item = BoundingBox::new(2.0, 2.0, 3.0, 3.0);
/// assert!(leaf.contains(&item));
/// assert!(leaf.expanded(0.5).contains(&BoundingBox::new(0.6, 0.6, 1.0, 1.0)));
/// ```
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Minimum X coordinate
    pub min_x: f64,
    /// Minimum Y coordinate
    pub min_y: f64,
    /// Maximum X coordinate
    pub max_x: f64,
    /// Maximum Y coordinate
    pub max_y: f64,
}

impl PartialEq for BoundingBox {
    fn eq(&self, other: &Self) -> bool {
        self.min_x.to_bits() == other.min_x.to_bits()
            && self.min_y.to_bits() == other.min_y.to_bits()
            && self.max_x.to_bits() == other.max_x.to_bits()
            && self.max_y.to_bits() == other.max_y.to_bits()
    }
}

impl Eq for BoundingBox {}

impl Hash for BoundingBox {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.min_x.to_bits().hash(state);
        self.min_y.to_bits().hash(state);
        self.max_x.to_bits().hash(state);
        self.max_y.to_bits().hash(state);
    }
}

impl PartialOrd for BoundingBox {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BoundingBox {
    fn cmp(&self, other: &Self) -> Ordering {
        self.min_x
            .total_cmp(&other.min_x)
            .then(self.min_y.total_cmp(&other.min_y))
            .then(self.max_x.total_cmp(&other.max_x))
            .then(self.max_y.total_cmp(&other.max_y))
    }
}

impl std::fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "BoundingBox({}, {}, {}, {})",
            self.min_x, self.min_y, self.max_x, self.max_y
        )
    }
}

impl BoundingBox {
    /// Creates a new bounding box with the specified coordinates.
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> BoundingBox {
        BoundingBox {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// The identity element for [`BoundingBox::union`]: contains nothing,
    /// intersects nothing.
    pub fn empty() -> Self {
        Self {
            min_x: f64::INFINITY,
            min_y: f64::INFINITY,
            max_x: f64::NEG_INFINITY,
            max_y: f64::NEG_INFINITY,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.min_x > self.max_x || self.min_y > self.max_y
    }

    /// Returns true when `other` lies entirely within this box (boundaries included).
    pub fn contains(&self, other: &BoundingBox) -> bool {
        self.min_x <= other.min_x
            && self.min_y <= other.min_y
            && self.max_x >= other.max_x
            && self.max_y >= other.max_y
    }

    /// Returns true when the boxes share at least one point.
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        !(self.max_x < other.min_x
            || self.min_x > other.max_x
            || self.max_y < other.min_y
            || self.min_y > other.max_y)
    }

    pub fn area(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        (self.max_x - self.min_x) * (self.max_y - self.min_y)
    }

    /// Area the box would gain by growing to cover `other`.
    pub fn enlargement(&self, other: &BoundingBox) -> f64 {
        self.union(other).area() - self.area()
    }

    /// The smallest box covering both boxes.
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    /// Grows this box in place to cover `other`.
    pub fn expand(&mut self, other: &BoundingBox) {
        *self = self.union(other);
    }

    /// Returns a copy pushed outward by `epsilon` on every side.
    ///
    /// An empty box stays empty.
    pub fn expanded(&self, epsilon: f64) -> BoundingBox {
        if self.is_empty() {
            return *self;
        }
        BoundingBox {
            min_x: self.min_x - epsilon,
            min_y: self.min_y - epsilon,
            max_x: self.max_x + epsilon,
            max_y: self.max_y + epsilon,
        }
    }

    pub fn center_x(&self) -> f64 {
        (self.min_x + self.max_x) / 2.0
    }

    /// Smallest box covering every box in the iterator, or [`BoundingBox::empty`].
    pub fn covering<'a, I>(boxes: I) -> BoundingBox
    where
        I: IntoIterator<Item = &'a BoundingBox>,
    {
        boxes
            .into_iter()
            .fold(BoundingBox::empty(), |acc, b| acc.union(b))
    }

    pub(crate) fn to_envelope(self) -> AABB<[f64; 2]> {
        AABB::from_corners([self.min_x, self.min_y], [self.max_x, self.max_y])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_contains_and_intersects() {
        let outer = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let inner = BoundingBox::new(2.0, 2.0, 3.0, 3.0);
        let straddling = BoundingBox::new(8.0, 8.0, 12.0, 12.0);
        let away = BoundingBox::new(20.0, 20.0, 21.0, 21.0);

        assert!(outer.contains(&inner));
        assert!(outer.contains(&outer));
        assert!(!outer.contains(&straddling));
        assert!(outer.intersects(&straddling));
        assert!(!outer.intersects(&away));
    }

    #[test]
    fn test_touching_boxes_intersect() {
        let a = BoundingBox::new(0.0, 0.0, 2.0, 2.0);
        let b = BoundingBox::new(2.0, 2.0, 4.0, 4.0);
        assert!(a.intersects(&b));
        assert!(!a.contains(&b));
    }

    #[test]
    fn test_union_and_enlargement() {
        let a = BoundingBox::new(0.0, 0.0, 2.0, 2.0);
        let b = BoundingBox::new(1.0, 1.0, 4.0, 3.0);
        let u = a.union(&b);
        assert_eq!(u, BoundingBox::new(0.0, 0.0, 4.0, 3.0));
        assert_eq!(a.enlargement(&b), 12.0 - 4.0);
        assert_eq!(u.enlargement(&a), 0.0);
    }

    #[test]
    fn test_empty_box() {
        let empty = BoundingBox::empty();
        assert!(empty.is_empty());
        assert_eq!(empty.area(), 0.0);
        assert!(!empty.intersects(&BoundingBox::new(0.0, 0.0, 1.0, 1.0)));
        assert!(empty.expanded(5.0).is_empty());

        let b = BoundingBox::new(1.0, 2.0, 3.0, 4.0);
        assert_eq!(empty.union(&b), b);
        assert_eq!(BoundingBox::covering(std::iter::empty()), empty);
    }

    #[test]
    fn test_expanded() {
        let b = BoundingBox::new(1.0, 1.0, 4.0, 4.0);
        assert_eq!(b.expanded(0.5), BoundingBox::new(0.5, 0.5, 4.5, 4.5));
        assert_eq!(b.expanded(0.0), b);
    }

    #[test]
    fn test_ordering_is_total() {
        let mut boxes = vec![
            BoundingBox::new(2.0, 0.0, 3.0, 1.0),
            BoundingBox::new(1.0, 5.0, 2.0, 6.0),
            BoundingBox::new(1.0, 0.0, 2.0, 1.0),
        ];
        boxes.sort();
        assert_eq!(boxes[0], BoundingBox::new(1.0, 0.0, 2.0, 1.0));
        assert_eq!(boxes[2], BoundingBox::new(2.0, 0.0, 3.0, 1.0));
    }

    #[test]
    fn test_hash_matches_eq() {
        let mut set = HashSet::new();
        set.insert(BoundingBox::new(0.0, 0.0, 1.0, 1.0));
        assert!(set.contains(&BoundingBox::new(0.0, 0.0, 1.0, 1.0)));
        assert!(!set.contains(&BoundingBox::new(0.0, 0.0, 1.0, 2.0)));
    }

    #[test]
    fn test_covering() {
        let boxes = [
            BoundingBox::new(0.0, 0.0, 1.0, 1.0),
            BoundingBox::new(5.0, -1.0, 6.0, 0.0),
        ];
        assert_eq!(
            BoundingBox::covering(boxes.iter()),
            BoundingBox::new(0.0, -1.0, 6.0, 1.0)
        );
    }
}
