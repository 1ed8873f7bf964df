//! Engine-queue and sync-object interfaces.
//!
//! The core never interprets instruction payloads; it only orders them
//! and attaches resolved wait/signal metadata. Concrete ASIC command
//! encoding and queue submission live behind [`EngineSink`].

use bytes::Bytes;

use crate::graph::event::{SyncBinding, WaitMethod, WaitPhase};
use crate::types::{EngineKind, SyncAddress, TargetValue};

/// One opaque hardware instruction with its ordering metadata.
#[derive(Debug, Clone)]
pub struct Instruction {
    pub engine: EngineKind,
    /// Opaque command payload; encoded by the ASIC-specific layer.
    pub payload: Bytes,
    /// "Do not execute until this sync object reaches this value."
    pub wait: Option<SyncBinding>,
    /// "Advance this sync object toward this value on completion."
    pub signal: Option<SyncBinding>,
}

/// An ordered instruction stream feeding one hardware engine.
///
/// `submit` flushes everything pushed since the previous submit as one
/// batch tagged with the iteration's completion-counter value. External
/// failures (engine unreachable, transport exhaustion) surface here as
/// typed errors before the orchestrator commits any bookkeeping.
pub trait EngineSink {
    fn push(&mut self, instruction: Instruction);
    fn submit(&mut self, target: TargetValue) -> crate::error::Result<()>;
}

/// In-memory engine queue buffering instructions per batch.
///
/// Serves as the default sink and as the observable endpoint in tests;
/// production deployments wrap the driver's command stream instead.
#[derive(Debug, Default)]
pub struct BufferedEngineQueue {
    pending: Vec<Instruction>,
    batches: Vec<(TargetValue, Vec<Instruction>)>,
}

impl BufferedEngineQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Batches submitted so far, oldest first.
    pub fn batches(&self) -> &[(TargetValue, Vec<Instruction>)] {
        &self.batches
    }

    /// Instructions pushed but not yet submitted.
    pub fn pending(&self) -> &[Instruction] {
        &self.pending
    }

    /// Total instructions across all submitted batches.
    pub fn submitted_len(&self) -> usize {
        self.batches.iter().map(|(_, b)| b.len()).sum()
    }
}

impl EngineSink for BufferedEngineQueue {
    fn push(&mut self, instruction: Instruction) {
        self.pending.push(instruction);
    }

    fn submit(&mut self, target: TargetValue) -> crate::error::Result<()> {
        let batch = std::mem::take(&mut self.pending);
        tracing::trace!(target, len = batch.len(), "submitted engine batch");
        self.batches.push((target, batch));
        Ok(())
    }
}

/// Scale-out transport strategies, matched explicitly at the
/// orchestration boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleOutTransport {
    /// Device-native inter-node fabric; completions signal on-device.
    NativeFabric { ports: u8 },
    /// Host-NIC path; completions arrive on a host CPU thread and cross
    /// the completion ring before the device-side signal.
    HostNic { ring_capacity: usize },
    /// GPU-direct descriptors posted by the device, completing on-device.
    GpuDirect { peer_mask: u64 },
}

impl ScaleOutTransport {
    pub const fn name(&self) -> &'static str {
        match self {
            ScaleOutTransport::NativeFabric { .. } => "native_fabric",
            ScaleOutTransport::HostNic { .. } => "host_nic",
            ScaleOutTransport::GpuDirect { .. } => "gpu_direct",
        }
    }

    /// Whether completions for this transport route through the
    /// host-to-device completion ring.
    pub const fn completes_on_host(&self) -> bool {
        matches!(self, ScaleOutTransport::HostNic { .. })
    }
}

/// Resolves a wait method (plus phase / long-term slot) to a concrete
/// physical sync-object address. Opaque to the core.
pub trait SyncObjectAllocator {
    fn resolve(
        &self,
        method: WaitMethod,
        phase: WaitPhase,
        longterm_slot: Option<u8>,
    ) -> SyncAddress;
}

/// Immutable sync-object lookup table, constructed once at startup and
/// passed by reference — never a hidden process-wide global.
///
/// Layout: one sync-manager index per wait method; immediate objects
/// rotate per phase, long-term objects rotate per slot, and the
/// external completion object is a single well-known id.
#[derive(Debug, Clone)]
pub struct SobTable {
    immediate_base: u32,
    immediate_count: u32,
    longterm_base: u32,
    longterm_count: u32,
    completion_sob: u32,
}

impl SobTable {
    pub fn new(
        immediate_base: u32,
        immediate_count: u32,
        longterm_base: u32,
        longterm_count: u32,
        completion_sob: u32,
    ) -> Self {
        assert!(immediate_count > 0 && longterm_count > 0);
        Self {
            immediate_base,
            immediate_count,
            longterm_base,
            longterm_count,
            completion_sob,
        }
    }
}

impl Default for SobTable {
    fn default() -> Self {
        Self::new(0x100, 64, 0x200, 8, 0x3ff)
    }
}

impl SyncObjectAllocator for SobTable {
    fn resolve(
        &self,
        method: WaitMethod,
        phase: WaitPhase,
        longterm_slot: Option<u8>,
    ) -> SyncAddress {
        match method {
            WaitMethod::Immediate => SyncAddress {
                sm_index: 0,
                sob_id: self.immediate_base + u32::from(phase) % self.immediate_count,
            },
            WaitMethod::Longterm => {
                let slot = u32::from(longterm_slot.unwrap_or(0));
                SyncAddress {
                    sm_index: 1,
                    sob_id: self.longterm_base + slot % self.longterm_count,
                }
            }
            WaitMethod::External => SyncAddress {
                sm_index: 1,
                sob_id: self.completion_sob,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instr(engine: EngineKind) -> Instruction {
        Instruction {
            engine,
            payload: Bytes::from_static(b"\x01\x02"),
            wait: None,
            signal: None,
        }
    }

    #[test]
    fn test_buffered_queue_batching() {
        let mut q = BufferedEngineQueue::new();
        q.push(instr(EngineKind::ScaleUp));
        q.push(instr(EngineKind::ScaleUp));
        assert_eq!(q.pending().len(), 2);
        q.submit(5).unwrap();
        assert!(q.pending().is_empty());
        assert_eq!(q.batches().len(), 1);
        assert_eq!(q.batches()[0].0, 5);
        assert_eq!(q.submitted_len(), 2);
    }

    #[test]
    fn test_empty_submit_records_empty_batch() {
        let mut q = BufferedEngineQueue::new();
        q.submit(1).unwrap();
        assert_eq!(q.batches().len(), 1);
        assert!(q.batches()[0].1.is_empty());
    }

    #[test]
    fn test_transport_host_completion() {
        assert!(ScaleOutTransport::HostNic { ring_capacity: 64 }.completes_on_host());
        assert!(!ScaleOutTransport::NativeFabric { ports: 4 }.completes_on_host());
        assert!(!ScaleOutTransport::GpuDirect { peer_mask: 0xff }.completes_on_host());
    }

    #[test]
    fn test_sob_table_methods_disjoint() {
        let table = SobTable::default();
        let imm = table.resolve(WaitMethod::Immediate, 0, None);
        let lt = table.resolve(WaitMethod::Longterm, 0, Some(2));
        let ext = table.resolve(WaitMethod::External, 0, None);
        assert_ne!(imm, lt);
        assert_ne!(lt, ext);
        assert_ne!(imm, ext);
    }

    #[test]
    fn test_sob_table_rotation() {
        let table = SobTable::new(0x100, 4, 0x200, 2, 0x3ff);
        let p0 = table.resolve(WaitMethod::Immediate, 0, None);
        let p1 = table.resolve(WaitMethod::Immediate, 1, None);
        assert_ne!(p0, p1);
        // Phase rotation wraps at the configured count.
        let p4 = table.resolve(WaitMethod::Immediate, 4, None);
        assert_eq!(p0, p4);
        // Long-term slots rotate independently.
        let s0 = table.resolve(WaitMethod::Longterm, 0, Some(0));
        let s2 = table.resolve(WaitMethod::Longterm, 0, Some(2));
        assert_eq!(s0, s2);
    }

    #[test]
    fn test_sob_table_resolution_deterministic() {
        let table = SobTable::default();
        let a = table.resolve(WaitMethod::External, 0, None);
        let b = table.resolve(WaitMethod::External, 3, Some(1));
        assert_eq!(a, b);
        assert_eq!(
            a,
            SyncAddress {
                sm_index: 1,
                sob_id: 0x3ff
            }
        );
    }
}
