//! LRU cache of decoded tree pages.
//!
//! Pages enter the cache only when first read or written; nothing is
//! preloaded. Dirty pages pushed out by the LRU policy are handed back to
//! the caller, which owns writing them to disk.

use std::num::NonZeroUsize;

use lru::LruCache;

use super::rtree_types::{Node, PageId};

/// A cached page with its data and dirty flag
#[derive(Debug, Clone)]
pub struct CachedPage {
    pub node: Node,
    pub dirty: bool,
}

/// LRU cache for tree pages
pub struct PageCache {
    pages: LruCache<PageId, CachedPage>,
}

impl PageCache {
    /// Create a new page cache holding at most `max_pages` pages (at least one)
    pub fn new(max_pages: usize) -> Self {
        let cap = NonZeroUsize::new(max_pages).unwrap_or(NonZeroUsize::MIN);
        Self {
            pages: LruCache::new(cap),
        }
    }

    /// Get a page, marking it most recently used.
    /// Returns None if the page must be loaded from disk.
    pub fn get(&mut self, page_id: PageId) -> Option<&Node> {
        self.pages.get(&page_id).map(|cached| &cached.node)
    }

    /// Insert or replace a page. A page already dirty stays dirty.
    ///
    /// Returns the page evicted to make room, if any.
    pub fn insert(&mut self, page_id: PageId, node: Node, dirty: bool) -> Option<(PageId, CachedPage)> {
        let dirty = dirty || self.pages.peek(&page_id).is_some_and(|c| c.dirty);
        match self.pages.push(page_id, CachedPage { node, dirty }) {
            Some((evicted_id, _)) if evicted_id == page_id => None,
            evicted => evicted,
        }
    }

    /// Ids of every page with unwritten changes
    pub fn dirty_pages(&self) -> Vec<PageId> {
        self.pages
            .iter()
            .filter(|(_, cached)| cached.dirty)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Peek at a page without touching the LRU order
    pub fn peek(&self, page_id: PageId) -> Option<&CachedPage> {
        self.pages.peek(&page_id)
    }

    pub fn mark_clean(&mut self, page_id: PageId) {
        if let Some(cached) = self.pages.peek_mut(&page_id) {
            cached.dirty = false;
        }
    }

    /// Remove a page from cache
    pub fn remove(&mut self, page_id: PageId) -> Option<CachedPage> {
        self.pages.pop(&page_id)
    }

    /// Empty the cache, returning every page in LRU order
    pub fn clear(&mut self) -> Vec<(PageId, CachedPage)> {
        let mut drained = Vec::with_capacity(self.pages.len());
        while let Some(entry) = self.pages.pop_lru() {
            drained.push(entry);
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn contains(&self, page_id: PageId) -> bool {
        self.pages.contains(&page_id)
    }
}
