use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;

/// A completion-counter value scoped to one logical command queue.
///
/// Strictly increasing; every iteration of every collective on a queue
/// consumes exactly one value. It is the only notion of "when" in the
/// scheduling core: hazard and credit bookkeeping is expressed in terms
/// of the counter value that must be reached before an action is safe.
pub type TargetValue = u64;

/// Identifier of a logical command queue (one per concurrency stream).
pub type QueueId = u32;

/// Returned by hazard/credit queries when no wait is required.
pub const NO_WAIT: TargetValue = 0;

/// Kind of device-memory access being tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    Read,
    Write,
}

impl AccessKind {
    pub const fn name(self) -> &'static str {
        match self {
            AccessKind::Read => "read",
            AccessKind::Write => "write",
        }
    }
}

/// Logical staging-buffer kinds, each backed by its own credit pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BufferKind {
    /// Intra-node fabric staging buffers.
    ScaleUpStaging = 0,
    /// Inter-node network staging buffers.
    ScaleOutStaging = 1,
    /// Local copy/reduction staging buffers.
    ReductionStaging = 2,
}

impl BufferKind {
    pub const ALL: [BufferKind; 3] = [
        BufferKind::ScaleUpStaging,
        BufferKind::ScaleOutStaging,
        BufferKind::ReductionStaging,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            BufferKind::ScaleUpStaging => "scaleup_staging",
            BufferKind::ScaleOutStaging => "scaleout_staging",
            BufferKind::ReductionStaging => "reduction_staging",
        }
    }
}

impl std::fmt::Display for BufferKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The three independently-executing hardware engines a queue feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EngineKind {
    /// Intra-node fabric network engine.
    ScaleUp = 0,
    /// Inter-node network engine.
    ScaleOut = 1,
    /// Local copy/reduction engine.
    Reduction = 2,
}

impl EngineKind {
    pub const ALL: [EngineKind; 3] = [
        EngineKind::ScaleUp,
        EngineKind::ScaleOut,
        EngineKind::Reduction,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            EngineKind::ScaleUp => "scaleup",
            EngineKind::ScaleOut => "scaleout",
            EngineKind::Reduction => "reduction",
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Logical collective operations the orchestrator schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CollectiveOp {
    AllGather = 0,
    ReduceScatter = 1,
    Broadcast = 2,
    AllReduce = 3,
    AllToAll = 4,
    Send = 5,
    Recv = 6,
}

impl CollectiveOp {
    pub const fn name(self) -> &'static str {
        match self {
            CollectiveOp::AllGather => "allgather",
            CollectiveOp::ReduceScatter => "reduce_scatter",
            CollectiveOp::Broadcast => "broadcast",
            CollectiveOp::AllReduce => "allreduce",
            CollectiveOp::AllToAll => "alltoall",
            CollectiveOp::Send => "send",
            CollectiveOp::Recv => "recv",
        }
    }

    /// Whether the local copy/reduction engine participates in this op.
    pub const fn uses_reduction(self) -> bool {
        matches!(self, CollectiveOp::ReduceScatter | CollectiveOp::AllReduce)
    }

    /// Whether the intra-node fabric engine participates in this op.
    pub const fn uses_scaleup(self) -> bool {
        !matches!(self, CollectiveOp::Send | CollectiveOp::Recv)
    }
}

impl std::fmt::Display for CollectiveOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Data types moved by collective operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    F32 = 0,
    F64 = 1,
    F16 = 2,
    BF16 = 3,
    I8 = 4,
    I32 = 5,
    I64 = 6,
    U8 = 7,
    U32 = 8,
    U64 = 9,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size_in_bytes(self) -> usize {
        match self {
            DataType::F32 | DataType::I32 | DataType::U32 => 4,
            DataType::F64 | DataType::I64 | DataType::U64 => 8,
            DataType::F16 | DataType::BF16 => 2,
            DataType::I8 | DataType::U8 => 1,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::F16 => "f16",
            DataType::BF16 => "bf16",
            DataType::I8 => "i8",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::U8 => "u8",
            DataType::U32 => "u32",
            DataType::U64 => "u64",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A half-open byte range `[start, end)` in device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryRange {
    pub start: u64,
    pub end: u64,
}

impl MemoryRange {
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub const fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub const fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Half-open intersection test.
    pub const fn overlaps(&self, other: &MemoryRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Smallest range covering both `self` and `other`.
    pub const fn union(&self, other: &MemoryRange) -> MemoryRange {
        MemoryRange {
            start: if self.start < other.start {
                self.start
            } else {
                other.start
            },
            end: if self.end > other.end {
                self.end
            } else {
                other.end
            },
        }
    }
}

impl std::fmt::Display for MemoryRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.end)
    }
}

/// Physical sync-object address: sync-manager index plus object id.
///
/// Opaque to the core; produced by a [`SyncObjectAllocator`] and consumed
/// by hardware instructions as wait/signal targets.
///
/// [`SyncObjectAllocator`]: crate::engine::SyncObjectAllocator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncAddress {
    pub sm_index: u32,
    pub sob_id: u32,
}

impl std::fmt::Display for SyncAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sm{}.sob{}", self.sm_index, self.sob_id)
    }
}

/// Structural description of one collective iteration.
///
/// Two iterations with equal descriptors have identical wait/signal graph
/// shape and may share a cached graph template; only concrete addresses
/// and counts differ between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShapeDescriptor {
    pub op: CollectiveOp,
    pub dtype: DataType,
    /// Element count moved this iteration.
    pub count: usize,
    pub world_size: u32,
    /// Number of boxes (nodes) participating; 1 means scale-up only.
    pub box_count: u32,
    /// This rank's box position within the scale-out plane.
    pub box_index: u32,
    /// Slice position within the box for sliced algorithms.
    pub slice_index: u32,
    /// Iteration index within the collective's schedule.
    pub iteration: u32,
}

impl ShapeDescriptor {
    /// Structural hash identifying this iteration's shape for graph caching.
    pub fn cuid(&self) -> u64 {
        let mut h = FxHasher::default();
        self.hash(&mut h);
        h.finish()
    }

    /// Engines this iteration emits work to.
    pub fn engines(&self) -> Vec<EngineKind> {
        let mut out = Vec::with_capacity(3);
        if self.op.uses_scaleup() && self.world_size > 1 {
            out.push(EngineKind::ScaleUp);
        }
        if self.box_count > 1 {
            out.push(EngineKind::ScaleOut);
        }
        if self.op.uses_reduction() {
            out.push(EngineKind::Reduction);
        }
        out
    }

    /// Bytes moved this iteration.
    pub fn bytes(&self) -> usize {
        self.count * self.dtype.size_in_bytes()
    }
}
