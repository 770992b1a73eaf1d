//! Buffered update machinery: operation records, per-subtree grouping for
//! flushes, the in-memory update buffer and leaf piggybacking.

pub mod group;
pub mod group_maker;
pub mod operation;
pub mod piggyback;
pub mod tracer;
pub mod update_buffer;

pub use group::{GroupKey, IndexEntryToGroupMap, OperationGroup};
pub use group_maker::{GroupingStrategy, OperationGroupMaker};
pub use operation::{OperationEntry, OperationKind, SpatialItem};
pub use piggyback::{
    LeafNodeModifier, OperationBuffer, OperationSink, PiggybackStatistics, PiggybackTarget,
    Piggybacker, PiggybackingInfo,
};
pub use tracer::{LogTracer, NoopTracer, ObjectTracer};
pub use update_buffer::{BufferOutcome, UpdateBuffer};
