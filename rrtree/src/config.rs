//! Tuning knobs for an [`RRTree`](crate::RRTree).

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::buffer::{GroupingStrategy, NoopTracer, ObjectTracer};
use crate::disk_rtree::rtree_constants::{
    DEFAULT_CACHE_PAGES, MAX_INTERNAL_CHILDREN, MAX_LEAF_ENTRIES, MAX_NODE_CAPACITY,
    MIN_LEAF_ENTRIES,
};
use crate::errors::{RRTreeError, RRTreeResult};

/// Fan-out limits of the disk tree. Persisted in the file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCapacity {
    pub max_leaf_entries: usize,
    pub min_leaf_entries: usize,
    pub max_internal_children: usize,
}

impl Default for NodeCapacity {
    fn default() -> Self {
        Self {
            max_leaf_entries: MAX_LEAF_ENTRIES,
            min_leaf_entries: MIN_LEAF_ENTRIES,
            max_internal_children: MAX_INTERNAL_CHILDREN,
        }
    }
}

impl NodeCapacity {
    pub fn new(max_leaf_entries: usize, min_leaf_entries: usize, max_internal_children: usize) -> Self {
        Self {
            max_leaf_entries,
            min_leaf_entries,
            max_internal_children,
        }
    }

    pub fn validate(&self) -> RRTreeResult<()> {
        if self.max_leaf_entries < 2 {
            return Err(RRTreeError::InvalidArgument(
                "max_leaf_entries must be at least 2".into(),
            ));
        }
        if self.min_leaf_entries < 1 {
            return Err(RRTreeError::InvalidArgument(
                "min_leaf_entries must be at least 1".into(),
            ));
        }
        if self.min_leaf_entries > self.max_leaf_entries / 2 {
            return Err(RRTreeError::InvalidArgument(format!(
                "min_leaf_entries ({}) must not exceed half of max_leaf_entries ({})",
                self.min_leaf_entries, self.max_leaf_entries
            )));
        }
        if self.max_internal_children < 2 {
            return Err(RRTreeError::InvalidArgument(
                "max_internal_children must be at least 2".into(),
            ));
        }
        if self.max_leaf_entries > MAX_NODE_CAPACITY || self.max_internal_children > MAX_NODE_CAPACITY {
            return Err(RRTreeError::InvalidArgument(format!(
                "node capacity exceeds what fits in one page ({})",
                MAX_NODE_CAPACITY
            )));
        }
        Ok(())
    }
}

/// Configuration for an RR-Tree.
///
/// Defaults:
/// - Buffer capacity: 1024 operations
/// - Piggybacking: enabled
/// - Grouping strategy: [`GroupingStrategy::Trivial`]
/// - Epsilon widening: off (epsilon 0.0)
/// - Page cache: 1024 pages
/// - Node capacity: 64 / 25 leaf entries, 64 internal children
///
/// # Examples
///
/// ```rust
/// use rrtree::{GroupingStrategy, RRTreeConfig};
///
/// let config = RRTreeConfig::new()
///     .with_buffer_capacity(256)
///     .with_grouping_strategy(GroupingStrategy::InsertionsOnly)
///     .with_epsilon(0.5);
/// assert!(config.validate().is_ok());
/// assert!(config.use_epsilon());
/// ```
#[derive(Clone)]
pub struct RRTreeConfig {
    buffer_capacity: usize,
    piggybacking: bool,
    grouping_strategy: GroupingStrategy,
    use_epsilon: bool,
    epsilon: f64,
    cache_pages: usize,
    node_capacity: NodeCapacity,
    tracer: Arc<dyn ObjectTracer>,
}

impl fmt::Debug for RRTreeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RRTreeConfig")
            .field("buffer_capacity", &self.buffer_capacity)
            .field("piggybacking", &self.piggybacking)
            .field("grouping_strategy", &self.grouping_strategy)
            .field("use_epsilon", &self.use_epsilon)
            .field("epsilon", &self.epsilon)
            .field("cache_pages", &self.cache_pages)
            .field("node_capacity", &self.node_capacity)
            .finish_non_exhaustive()
    }
}

impl Default for RRTreeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RRTreeConfig {
    pub fn new() -> Self {
        Self {
            buffer_capacity: 1024,
            piggybacking: true,
            grouping_strategy: GroupingStrategy::Trivial,
            use_epsilon: false,
            epsilon: 0.0,
            cache_pages: DEFAULT_CACHE_PAGES,
            node_capacity: NodeCapacity::default(),
            tracer: Arc::new(NoopTracer),
        }
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    /// Number of buffered operations that triggers an automatic flush.
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    pub fn piggybacking(&self) -> bool {
        self.piggybacking
    }

    pub fn with_piggybacking(mut self, enabled: bool) -> Self {
        self.piggybacking = enabled;
        self
    }

    pub fn grouping_strategy(&self) -> GroupingStrategy {
        self.grouping_strategy
    }

    pub fn with_grouping_strategy(mut self, strategy: GroupingStrategy) -> Self {
        self.grouping_strategy = strategy;
        self
    }

    pub fn use_epsilon(&self) -> bool {
        self.use_epsilon
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Widens leaf catchment by `epsilon` when piggybacking. Also turns
    /// widening on.
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.use_epsilon = true;
        self.epsilon = epsilon;
        self
    }

    pub fn with_use_epsilon(mut self, use_epsilon: bool) -> Self {
        self.use_epsilon = use_epsilon;
        self
    }

    pub fn cache_pages(&self) -> usize {
        self.cache_pages
    }

    pub fn with_cache_pages(mut self, pages: usize) -> Self {
        self.cache_pages = pages;
        self
    }

    /// Capacity used when creating a tree. An opened tree keeps the
    /// capacity recorded in its file.
    pub fn node_capacity(&self) -> NodeCapacity {
        self.node_capacity
    }

    pub fn with_node_capacity(mut self, capacity: NodeCapacity) -> Self {
        self.node_capacity = capacity;
        self
    }

    pub fn tracer(&self) -> Arc<dyn ObjectTracer> {
        Arc::clone(&self.tracer)
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn ObjectTracer>) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn validate(&self) -> RRTreeResult<()> {
        if self.buffer_capacity == 0 {
            return Err(RRTreeError::InvalidArgument(
                "buffer_capacity must be greater than zero".into(),
            ));
        }
        if self.cache_pages == 0 {
            return Err(RRTreeError::InvalidArgument(
                "cache_pages must be greater than zero".into(),
            ));
        }
        if !self.epsilon.is_finite() || self.epsilon < 0.0 {
            return Err(RRTreeError::InvalidArgument(format!(
                "epsilon must be a finite non-negative number, got {}",
                self.epsilon
            )));
        }
        self.node_capacity.validate()
    }
}
