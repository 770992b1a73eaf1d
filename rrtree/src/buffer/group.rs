//! Operation groups and their per-subtree map.

use indexmap::map::Entry;
use indexmap::{IndexMap, IndexSet};

use super::operation::{OperationEntry, SpatialItem};
use crate::disk_rtree::PageId;

/// A bag of operation entries destined for one subtree.
///
/// Membership is by entry identity, so adding the same entry twice keeps
/// one copy. Iteration follows insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationGroup<T: SpatialItem> {
    entries: IndexSet<OperationEntry<T>>,
}

impl<T: SpatialItem> Default for OperationGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: SpatialItem> OperationGroup<T> {
    pub fn new() -> Self {
        Self {
            entries: IndexSet::new(),
        }
    }

    /// Adds an entry, returning false if it was already a member.
    pub fn add(&mut self, entry: OperationEntry<T>) -> bool {
        self.entries.insert(entry)
    }

    pub fn contains(&self, entry: &OperationEntry<T>) -> bool {
        self.entries.contains(entry)
    }

    /// Removes an entry, e.g. a split deletion already resolved in a sibling subtree.
    pub fn remove(&mut self, entry: &OperationEntry<T>) -> bool {
        self.entries.shift_remove(entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OperationEntry<T>> {
        self.entries.iter()
    }

    pub fn num_insertions(&self) -> usize {
        self.entries.iter().filter(|e| e.is_insertion()).count()
    }

    pub fn num_deletions(&self) -> usize {
        self.entries.iter().filter(|e| e.is_deletion()).count()
    }

    pub fn into_vec(self) -> Vec<OperationEntry<T>> {
        self.entries.into_iter().collect()
    }
}

impl<T: SpatialItem> FromIterator<OperationEntry<T>> for OperationGroup<T> {
    fn from_iter<I: IntoIterator<Item = OperationEntry<T>>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl<T: SpatialItem> IntoIterator for OperationGroup<T> {
    type Item = OperationEntry<T>;
    type IntoIter = indexmap::set::IntoIter<OperationEntry<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Identifies which group an operation was routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GroupKey {
    /// The child subtree rooted at this page.
    Subtree(PageId),
    /// Operations that fit no child subtree; resolved outside the grouped descent.
    Orphan,
}

/// Maps each child index entry of a node (plus the orphan bucket) to the
/// operations routed to it.
#[derive(Debug, Clone)]
pub struct IndexEntryToGroupMap<T: SpatialItem> {
    groups: IndexMap<GroupKey, OperationGroup<T>>,
}

impl<T: SpatialItem> Default for IndexEntryToGroupMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: SpatialItem> IndexEntryToGroupMap<T> {
    pub fn new() -> Self {
        Self {
            groups: IndexMap::new(),
        }
    }

    /// Adds an entry to the group for `key`, creating the group on first use.
    pub fn add(&mut self, key: GroupKey, entry: OperationEntry<T>) {
        match self.groups.entry(key) {
            Entry::Occupied(mut occupied) => {
                occupied.get_mut().add(entry);
            }
            Entry::Vacant(vacant) => {
                let mut group = OperationGroup::new();
                group.add(entry);
                vacant.insert(group);
            }
        }
    }

    pub fn add_orphan(&mut self, entry: OperationEntry<T>) {
        self.add(GroupKey::Orphan, entry);
    }

    pub fn group(&self, key: GroupKey) -> Option<&OperationGroup<T>> {
        self.groups.get(&key)
    }

    pub fn orphans(&self) -> Option<&OperationGroup<T>> {
        self.group(GroupKey::Orphan)
    }

    /// Removes and returns the group for `key`.
    pub fn take(&mut self, key: GroupKey) -> Option<OperationGroup<T>> {
        self.groups.shift_remove(&key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &GroupKey> {
        self.groups.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&GroupKey, &OperationGroup<T>)> {
        self.groups.iter()
    }

    /// Number of groups, the orphan bucket included.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Total memberships across all groups; a deletion replicated into `n`
    /// groups counts `n` times.
    pub fn total_memberships(&self) -> usize {
        self.groups.values().map(OperationGroup::len).sum()
    }

    /// The distinct operations present in at least one group.
    ///
    /// Insertions appear once in the map already; a deletion replicated
    /// across several overlapping subtrees is reported once. Comparing the
    /// result with the grouped batch yields the operations that landed nowhere.
    pub fn flatten(&self) -> IndexSet<OperationEntry<T>> {
        let mut flat = IndexSet::new();
        for group in self.groups.values() {
            flat.extend(group.iter().cloned());
        }
        flat
    }

    /// Operations from `batch` that are in no group at all.
    pub fn residual<'a, I>(&self, batch: I) -> Vec<OperationEntry<T>>
    where
        I: IntoIterator<Item = &'a OperationEntry<T>>,
        T: 'a,
    {
        let flat = self.flatten();
        batch
            .into_iter()
            .filter(|e| !flat.contains(*e))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::operation::test_support::{item, Item};

    fn ins(id: u64) -> OperationEntry<Item> {
        OperationEntry::insertion(item(id, 0.0, 0.0, 1.0, 1.0))
    }

    fn del(id: u64) -> OperationEntry<Item> {
        OperationEntry::deletion(item(id, 0.0, 0.0, 1.0, 1.0))
    }

    #[test]
    fn test_group_membership() {
        let mut group = OperationGroup::new();
        assert!(group.add(ins(1)));
        assert!(!group.add(ins(1)));
        assert!(group.add(del(1)));
        assert_eq!(group.len(), 2);
        assert_eq!(group.num_insertions(), 1);
        assert_eq!(group.num_deletions(), 1);

        assert!(group.remove(&del(1)));
        assert!(!group.contains(&del(1)));
        assert!(group.contains(&ins(1)));
    }

    #[test]
    fn test_map_creates_groups_on_demand() {
        let mut map = IndexEntryToGroupMap::new();
        map.add(GroupKey::Subtree(3), ins(1));
        map.add(GroupKey::Subtree(3), ins(2));
        map.add_orphan(del(9));

        assert_eq!(map.len(), 2);
        assert_eq!(map.group(GroupKey::Subtree(3)).map(|g| g.len()), Some(2));
        assert_eq!(map.orphans().map(|g| g.len()), Some(1));
        assert!(map.group(GroupKey::Subtree(4)).is_none());
    }

    #[test]
    fn test_flatten_dedups_replicated_deletions() {
        let mut map = IndexEntryToGroupMap::new();
        map.add(GroupKey::Subtree(1), ins(1));
        map.add(GroupKey::Subtree(1), del(5));
        map.add(GroupKey::Subtree(2), del(5));
        map.add(GroupKey::Subtree(2), ins(2));

        assert_eq!(map.total_memberships(), 4);
        let flat = map.flatten();
        assert_eq!(flat.len(), 3);
        assert!(flat.contains(&del(5)));
    }

    #[test]
    fn test_residual() {
        let mut map = IndexEntryToGroupMap::new();
        map.add(GroupKey::Subtree(1), ins(1));
        let batch = vec![ins(1), del(2)];
        assert_eq!(map.residual(batch.iter()), vec![del(2)]);
    }

    #[test]
    fn test_take_removes_group() {
        let mut map = IndexEntryToGroupMap::new();
        map.add(GroupKey::Subtree(1), ins(1));
        let group = map.take(GroupKey::Subtree(1)).unwrap();
        assert_eq!(group.into_vec(), vec![ins(1)]);
        assert!(map.is_empty());
    }
}
