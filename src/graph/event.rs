//! Wait/signal event vocabulary and per-iteration state machines.

use crate::types::{SyncAddress, TargetValue};

/// Hardware completion sources that can feed a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SignalKind {
    ScaleUpSendDone = 0,
    ScaleUpRecvDone = 1,
    ScaleOutSendDone = 2,
    ScaleOutRecvDone = 3,
    ReductionDone = 4,
    LocalCopyDone = 5,
    /// Completion detected by a host CPU thread and handed over through
    /// the completion ring.
    HostThreadDone = 6,
}

impl SignalKind {
    pub const fn name(self) -> &'static str {
        match self {
            SignalKind::ScaleUpSendDone => "scaleup_send_done",
            SignalKind::ScaleUpRecvDone => "scaleup_recv_done",
            SignalKind::ScaleOutSendDone => "scaleout_send_done",
            SignalKind::ScaleOutRecvDone => "scaleout_recv_done",
            SignalKind::ReductionDone => "reduction_done",
            SignalKind::LocalCopyDone => "local_copy_done",
            SignalKind::HostThreadDone => "host_thread_done",
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Consumer synchronization points a graph can register waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WaitPoint {
    ScaleUpSend = 0,
    ScaleUpRecv = 1,
    ScaleOutSend = 2,
    ScaleOutRecv = 3,
    ReductionLaunch = 4,
    FinalCopy = 5,
}

impl WaitPoint {
    pub const fn name(self) -> &'static str {
        match self {
            WaitPoint::ScaleUpSend => "scaleup_send",
            WaitPoint::ScaleUpRecv => "scaleup_recv",
            WaitPoint::ScaleOutSend => "scaleout_send",
            WaitPoint::ScaleOutRecv => "scaleout_recv",
            WaitPoint::ReductionLaunch => "reduction_launch",
            WaitPoint::FinalCopy => "final_copy",
        }
    }
}

impl std::fmt::Display for WaitPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Class of physical synchronization primitive realizing a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WaitMethod {
    /// Short-lived credit object, recycled every iteration.
    Immediate = 0,
    /// Long-term rotating object for waits that outlive one iteration.
    Longterm = 1,
    /// Externally-visible completion object callers poll or block on.
    External = 2,
}

impl WaitMethod {
    pub const fn name(self) -> &'static str {
        match self {
            WaitMethod::Immediate => "immediate",
            WaitMethod::Longterm => "longterm",
            WaitMethod::External => "external",
        }
    }
}

impl std::fmt::Display for WaitMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Sub-sequence number for waits satisfied multiple times before the
/// event as a whole completes.
pub type WaitPhase = u8;

/// Lifecycle of a wait event within one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    /// Never observed this iteration.
    Unregistered,
    /// Fewer signal occurrences registered than expected.
    PartiallySignalled,
    /// Every phase's occurrence count is met.
    Signalled,
    /// Consumed by instruction emission; no longer eligible for reuse
    /// this iteration.
    Finalized,
}

/// Lifecycle of a signal event within one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalState {
    Unregistered,
    Registered,
    /// Bound to a downstream wait or the completion accumulator.
    Dequeued,
}

/// A resolved `{sync object, count}` pair attached to an instruction:
/// "do not execute until `addr` reaches `value`" or "advance `addr`
/// toward `value` on completion".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncBinding {
    pub addr: SyncAddress,
    pub value: TargetValue,
}

impl std::fmt::Display for SyncBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}>={}", self.addr, self.value)
    }
}
