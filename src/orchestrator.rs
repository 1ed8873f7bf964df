//! Per-queue orchestration: the driving loop that turns one collective
//! iteration into ordered, hazard- and credit-safe engine commands.
//!
//! Pipeline per iteration: derive the shape, record hazards for every
//! touched range, plan and allocate buffer credits, build or load the
//! signal graph, emit instructions with resolved wait/signal bindings,
//! then advance the queue's completion counter and submit.

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHashMap;

use crate::config::WeftConfig;
use crate::credit::{BufferManager, PoolKey};
use crate::engine::{
    BufferedEngineQueue, EngineSink, Instruction, SobTable, SyncObjectAllocator,
};
use crate::error::{Diagnostics, Result, WeftError, contract_violation};
use crate::fabric::FabricTopology;
use crate::graph::SignalGraphScheduler;
use crate::graph::event::{SignalKind, SyncBinding, WaitMethod, WaitPoint};
use crate::hazard::RangeHazardTracker;
use crate::ring::{CompletionRecord, RingConsumer, RingProducer, completion_ring};
use crate::types::{
    AccessKind, BufferKind, EngineKind, MemoryRange, NO_WAIT, QueueId, ShapeDescriptor,
    SyncAddress, TargetValue,
};

/// Long-term sync objects rotate over this many slots.
const LONGTERM_SLOTS: u32 = 8;

/// Token for one open iteration. Consumed by `finalize_iteration`;
/// presenting a stale handle is a caller contract violation.
#[derive(Debug)]
pub struct IterationHandle {
    token: u64,
    target: TargetValue,
}

impl IterationHandle {
    /// Completion-counter value this iteration will retire at.
    pub fn target(&self) -> TargetValue {
        self.target
    }
}

#[derive(Debug)]
struct IterationState {
    token: u64,
    shape: ShapeDescriptor,
    cuid: u64,
    target: TargetValue,
    loaded: bool,
    resolved: bool,
    /// Highest counter value this iteration must wait for, combining
    /// hazard conflicts and credit previous-expirations.
    required_wait: TargetValue,
    /// Credit slots taken per pool this iteration.
    touched: FxHashMap<PoolKey, usize>,
}

/// Drives one logical command queue.
///
/// Owns the queue's completion counter and all per-queue bookkeeping
/// (hazard tracker, credit pools, graph scheduler). Single-threaded by
/// contract; [`SchedQueue`] provides the per-queue lock.
pub struct CollectiveOrchestrator {
    queue: QueueId,
    topology: FabricTopology,
    sob_table: SobTable,
    hazards: RangeHazardTracker,
    buffers: BufferManager,
    scheduler: SignalGraphScheduler,
    scale_up: BufferedEngineQueue,
    scale_out: BufferedEngineQueue,
    reduction: BufferedEngineQueue,
    /// Host-side completion handoff, present only for transports that
    /// complete on a host CPU thread.
    completions: Option<RingProducer>,
    completion_rx: Option<RingConsumer>,
    /// Last finalized counter value; the open iteration targets +1.
    completed: TargetValue,
    /// Last counter value observed retired by hardware.
    retired: TargetValue,
    /// Wait methods awaiting reset, paired with the counter value that
    /// releases them.
    cleanup: Vec<(WaitMethod, TargetValue)>,
    iteration: Option<IterationState>,
    handle_seq: u64,
}

impl CollectiveOrchestrator {
    pub fn new(queue: QueueId, config: &WeftConfig, topology: FabricTopology) -> Self {
        let mut buffers = BufferManager::new();
        for kind in BufferKind::ALL {
            let size = topology.clamp_credits(kind, config.credits_for(kind));
            buffers.register(
                PoolKey::of(kind),
                size,
                (kind as u64) << 32,
                config.staging_stride,
            );
        }
        let (completions, completion_rx) = if topology.transport.completes_on_host() {
            let (tx, rx) = completion_ring(config.completion_ring_capacity);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        tracing::debug!(queue, transport = topology.transport.name(), "queue initialized");
        Self {
            queue,
            topology,
            sob_table: SobTable::default(),
            hazards: RangeHazardTracker::new(),
            buffers,
            scheduler: SignalGraphScheduler::new(config.graph_cache_capacity),
            scale_up: BufferedEngineQueue::new(),
            scale_out: BufferedEngineQueue::new(),
            reduction: BufferedEngineQueue::new(),
            completions,
            completion_rx,
            completed: 0,
            retired: 0,
            cleanup: Vec::new(),
            iteration: None,
            handle_seq: 0,
        }
    }

    pub fn queue(&self) -> QueueId {
        self.queue
    }

    /// Last finalized completion-counter value.
    pub fn completed_target(&self) -> TargetValue {
        self.completed
    }

    /// Open one collective iteration: derive its shape indices, assign
    /// the next counter value, and build or load the signal graph.
    ///
    /// External conditions (no usable ports) surface as errors before
    /// any bookkeeping is touched.
    pub fn begin_iteration(&mut self, shape: &ShapeDescriptor) -> Result<IterationHandle> {
        if self.iteration.is_some() {
            self.fatal("begin_iteration while an iteration is open");
        }
        if shape.engines().is_empty() {
            self.fatal(&format!("shape {} touches no engines", shape.op));
        }
        self.topology.validate(shape.box_count > 1)?;

        let target = self.completed + 1;
        let cuid = shape.cuid();
        let loaded = self.scheduler.load_graph(cuid);
        if !loaded {
            self.build_graph(shape);
        }
        self.handle_seq += 1;
        let token = self.handle_seq;
        tracing::debug!(
            queue = self.queue,
            op = shape.op.name(),
            cuid,
            target,
            loaded,
            "iteration opened"
        );
        self.iteration = Some(IterationState {
            token,
            shape: *shape,
            cuid,
            target,
            loaded,
            resolved: false,
            required_wait: NO_WAIT,
            touched: FxHashMap::default(),
        });
        Ok(IterationHandle { token, target })
    }

    /// Track one source/destination range this iteration touches.
    ///
    /// Returns the counter value the iteration must wait for before the
    /// access is safe ([`NO_WAIT`] when unconflicted); the wait is also
    /// folded into the iteration's combined gate.
    pub fn record_access(
        &mut self,
        handle: &IterationHandle,
        range: MemoryRange,
        kind: AccessKind,
    ) -> TargetValue {
        self.check_handle(handle, "record_access");
        let wait = self
            .hazards
            .check_and_record(range, handle.target, kind, true);
        if let Some(it) = self.iteration.as_mut() {
            it.required_wait = it.required_wait.max(wait);
        }
        wait
    }

    /// Take one staging-buffer credit of `kind` for this iteration.
    ///
    /// Verifies the centralized required-credit bound against the pool
    /// before allocating; exceeding the pool is a capacity-planning bug
    /// and fatal. Returns the slot's device address and previous
    /// expiration (folded into the iteration's combined gate).
    pub fn allocate_credit(
        &mut self,
        handle: &IterationHandle,
        kind: BufferKind,
    ) -> (u64, TargetValue) {
        self.check_handle(handle, "allocate_credit");
        let key = PoolKey::of(kind);
        let target = handle.target;

        let touched = self
            .iteration
            .as_ref()
            .map_or(0, |it| it.touched.get(&key).copied().unwrap_or(0));
        let required = self.buffers.required_credits(key, touched + 1, target);
        if required > self.buffers.pool_size(key) {
            self.fatal(&format!(
                "iteration needs {required} credits from {kind} pool of {}",
                self.buffers.pool_size(key)
            ));
        }

        let (address, previous) = self.buffers.allocate(key, target);
        if let Some(it) = self.iteration.as_mut() {
            it.required_wait = it.required_wait.max(previous);
            *it.touched.entry(key).or_insert(0) += 1;
        }
        (address, previous)
    }

    /// Physical sync-object address bound to `signal`, for callers
    /// assembling their own instruction payloads. The signal is
    /// consumed: emission will not attach it again.
    pub fn bind_signal(&mut self, handle: &IterationHandle, signal: SignalKind) -> SyncAddress {
        self.check_handle(handle, "bind_signal");
        self.ensure_resolved();
        self.scheduler.dequeue_so_address(signal)
    }

    /// Emit this iteration's commands, advance the completion counter,
    /// and submit one batch per touched engine.
    pub fn finalize_iteration(&mut self, handle: IterationHandle) -> Result<TargetValue> {
        self.check_handle(&handle, "finalize_iteration");

        // A full ring would lose the host-side completion handoff;
        // surface it while the iteration can still be finalized later.
        let needs_ring = self
            .iteration
            .as_ref()
            .is_some_and(|it| it.shape.engines().contains(&EngineKind::ScaleOut));
        if needs_ring {
            if let Some(tx) = &self.completions {
                if tx.is_full() {
                    return Err(WeftError::CompletionRingFull {
                        capacity: tx.capacity(),
                    });
                }
            }
        }

        self.ensure_resolved();
        let Some(it) = self.iteration.take() else {
            self.fatal("finalize_iteration without an open iteration");
        };
        let target = it.target;

        // Completion bindings must carry the counter value before
        // emission copies them onto instructions.
        let mut cleanup = self.scheduler.update_completion_tracker(target);
        self.cleanup.append(&mut cleanup);

        self.emit_commands(&it);
        self.scheduler.seal();

        let engines = it.shape.engines();
        for engine in &engines {
            self.sink_mut(*engine).submit(target)?;
        }

        if self.topology.transport.completes_on_host()
            && engines.contains(&EngineKind::ScaleOut)
        {
            let record = CompletionRecord {
                queue: self.queue,
                target,
            };
            if let Some(tx) = &mut self.completions {
                if let Err(e) = tx.push(record) {
                    // Capacity was checked above; a failure here means
                    // the producer contract was broken elsewhere.
                    tracing::error!(queue = self.queue, target, "completion handoff lost: {e}");
                }
            }
        }

        self.completed = target;
        tracing::debug!(queue = self.queue, target, "iteration finalized");
        Ok(target)
    }

    /// Drop the open iteration after an externally-detected failure,
    /// without caching its graph. Hazard ranges already recorded stay
    /// in place; they are stamped with a counter value the next
    /// iteration will reuse, so they remain safely conservative.
    pub fn abandon_iteration(&mut self, handle: IterationHandle) {
        self.check_handle(&handle, "abandon_iteration");
        self.scheduler.abandon();
        self.iteration = None;
        tracing::debug!(queue = self.queue, target = handle.target, "iteration abandoned");
    }

    /// Feed back hardware progress: every bookkeeping entry bound to a
    /// counter value ≤ `value` is released. Idempotent.
    pub fn retire(&mut self, value: TargetValue) {
        self.retired = self.retired.max(value);
        self.hazards.retire(value);
        self.cleanup.retain(|(_, t)| *t > value);
    }

    /// Last counter value reported retired.
    pub fn retired_target(&self) -> TargetValue {
        self.retired
    }

    /// Wait methods still awaiting reset, with their release values.
    pub fn pending_cleanup(&self) -> &[(WaitMethod, TargetValue)] {
        &self.cleanup
    }

    /// Invalidate all cached graph templates (communicator teardown).
    pub fn invalidate_graphs(&mut self) {
        self.scheduler.invalidate_all();
    }

    pub fn graph_cache_len(&self) -> usize {
        self.scheduler.cache_len()
    }

    /// Observable engine queue, mainly for tests and post-mortems.
    pub fn engine(&self, kind: EngineKind) -> &BufferedEngineQueue {
        match kind {
            EngineKind::ScaleUp => &self.scale_up,
            EngineKind::ScaleOut => &self.scale_out,
            EngineKind::Reduction => &self.reduction,
        }
    }

    /// Hand the device-side consumer of the host completion ring to the
    /// engine collaborator. Present once, for host-completing
    /// transports only.
    pub fn take_host_completions(&mut self) -> Option<RingConsumer> {
        self.completion_rx.take()
    }

    /// Full bookkeeping snapshot for post-mortem debugging of a stuck
    /// queue: live counter values against every pool's and graph's
    /// recorded state.
    pub fn diagnostics_dump(&self) -> String {
        let mut out = String::new();
        self.diagnostics(&mut out);
        out
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Register the iteration's wait/signal graph, first time a shape
    /// is seen.
    ///
    /// Scale-up and scale-out launches gate on the iteration's combined
    /// hazard/credit wait; the reduction engine joins both planes
    /// through a long-term two-phase wait. The last engine in the chain
    /// feeds the queue's completion object.
    fn build_graph(&mut self, shape: &ShapeDescriptor) {
        let engines = shape.engines();
        let multibox = engines.contains(&EngineKind::ScaleOut);
        let scaleup = engines.contains(&EngineKind::ScaleUp);
        let so_done = self.scaleout_done_signal();
        let slot = (shape.iteration % LONGTERM_SLOTS) as u8;

        if engines.contains(&EngineKind::Reduction) {
            if multibox {
                self.scheduler.enqueue_wait(
                    WaitPoint::ReductionLaunch,
                    &[SignalKind::ScaleUpSendDone],
                    WaitMethod::Longterm,
                    0,
                    1,
                    Some(slot),
                );
                self.scheduler.enqueue_wait(
                    WaitPoint::ReductionLaunch,
                    &[so_done],
                    WaitMethod::Longterm,
                    1,
                    1,
                    Some(slot),
                );
            } else {
                self.scheduler.enqueue_wait(
                    WaitPoint::ReductionLaunch,
                    &[SignalKind::ScaleUpSendDone],
                    WaitMethod::Immediate,
                    0,
                    1,
                    None,
                );
            }
            self.scheduler.enqueue_completion(&[SignalKind::ReductionDone]);
        } else if multibox && scaleup {
            self.scheduler.enqueue_wait(
                WaitPoint::ScaleOutSend,
                &[SignalKind::ScaleUpSendDone],
                WaitMethod::Immediate,
                0,
                1,
                None,
            );
            self.scheduler.enqueue_completion(&[so_done]);
        } else if multibox {
            self.scheduler.enqueue_completion(&[so_done]);
        } else {
            self.scheduler.enqueue_completion(&[SignalKind::ScaleUpSendDone]);
        }
    }

    fn ensure_resolved(&mut self) {
        let needs = match &self.iteration {
            Some(it) => !it.resolved,
            None => self.fatal("resolution without an open iteration"),
        };
        if needs {
            self.scheduler.allocate_resources(&self.sob_table);
            if let Some(it) = self.iteration.as_mut() {
                it.resolved = true;
            }
        }
    }

    /// Serialize one payload instruction per engine, preceded by fence
    /// instructions when a wait chain has more than one phase binding.
    fn emit_commands(&mut self, it: &IterationState) {
        let gate = if it.required_wait > NO_WAIT {
            Some(SyncBinding {
                addr: self
                    .sob_table
                    .resolve(WaitMethod::External, 0, None),
                value: it.required_wait,
            })
        } else {
            None
        };

        let pending = self.scheduler.pending_signals();
        let registered = self.scheduler.registered_waits();

        for engine in it.shape.engines() {
            let point = Self::launch_point(engine);
            let mut bindings = if registered.contains(&point) {
                self.scheduler.take_wait(point)
            } else {
                Vec::new()
            };
            // Engines with no graph wait gate directly on the combined
            // hazard/credit value.
            let wait = match bindings.pop() {
                Some(last) => Some(last),
                None => gate,
            };
            for fence in bindings {
                self.push_instruction(engine, Bytes::new(), Some(fence), None);
            }

            let done = self.done_signal(engine);
            let signal = if pending.contains(&done) {
                Some(self.scheduler.dequeue_binding(done))
            } else {
                None
            };
            let payload = Self::encode_payload(&it.shape, engine);
            self.push_instruction(engine, payload, wait, signal);
        }
    }

    fn push_instruction(
        &mut self,
        engine: EngineKind,
        payload: Bytes,
        wait: Option<SyncBinding>,
        signal: Option<SyncBinding>,
    ) {
        self.sink_mut(engine).push(Instruction {
            engine,
            payload,
            wait,
            signal,
        });
    }

    fn sink_mut(&mut self, kind: EngineKind) -> &mut BufferedEngineQueue {
        match kind {
            EngineKind::ScaleUp => &mut self.scale_up,
            EngineKind::ScaleOut => &mut self.scale_out,
            EngineKind::Reduction => &mut self.reduction,
        }
    }

    const fn launch_point(engine: EngineKind) -> WaitPoint {
        match engine {
            EngineKind::ScaleUp => WaitPoint::ScaleUpSend,
            EngineKind::ScaleOut => WaitPoint::ScaleOutSend,
            EngineKind::Reduction => WaitPoint::ReductionLaunch,
        }
    }

    fn done_signal(&self, engine: EngineKind) -> SignalKind {
        match engine {
            EngineKind::ScaleUp => SignalKind::ScaleUpSendDone,
            EngineKind::ScaleOut => self.scaleout_done_signal(),
            EngineKind::Reduction => SignalKind::ReductionDone,
        }
    }

    fn scaleout_done_signal(&self) -> SignalKind {
        if self.topology.transport.completes_on_host() {
            SignalKind::HostThreadDone
        } else {
            SignalKind::ScaleOutSendDone
        }
    }

    /// Opaque command descriptor; the ASIC-specific layer would encode
    /// real commands here.
    fn encode_payload(shape: &ShapeDescriptor, engine: EngineKind) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u8(shape.op as u8);
        buf.put_u8(engine as u8);
        buf.put_u8(shape.dtype as u8);
        buf.put_u8(0);
        buf.put_u32(shape.count as u32);
        buf.put_u32(shape.box_index);
        buf.put_u32(shape.slice_index);
        buf.freeze()
    }

    fn check_handle(&self, handle: &IterationHandle, op: &str) {
        let ok = matches!(&self.iteration, Some(it) if it.token == handle.token);
        if !ok {
            self.fatal(&format!("{op} with a stale iteration handle"));
        }
    }

    #[cold]
    fn fatal(&self, detail: &str) -> ! {
        contract_violation("orchestrator", detail, &self.diagnostics_dump())
    }
}

impl Diagnostics for CollectiveOrchestrator {
    fn diagnostics(&self, out: &mut String) {
        use std::fmt::Write;
        let _ = writeln!(
            out,
            "queue {}: completed={} retired={}",
            self.queue, self.completed, self.retired
        );
        if let Some(it) = &self.iteration {
            let _ = writeln!(
                out,
                "open iteration: cuid={} target={} loaded={} required_wait={}",
                it.cuid, it.target, it.loaded, it.required_wait
            );
        }
        self.hazards.diagnostics(out);
        self.buffers.diagnostics(out);
        self.scheduler.diagnostics(out);
        let _ = writeln!(out, "pending cleanup: {:?}", self.cleanup);
    }
}

/// A logical command queue: one orchestrator behind the per-queue
/// exclusive lock, held for the duration of one collective call.
pub struct SchedQueue {
    inner: Mutex<CollectiveOrchestrator>,
}

impl SchedQueue {
    pub fn new(queue: QueueId, config: &WeftConfig, topology: FabricTopology) -> Self {
        Self {
            inner: Mutex::new(CollectiveOrchestrator::new(queue, config, topology)),
        }
    }

    /// Run one full iteration: open, record every access, take one
    /// staging credit per touched engine, finalize.
    pub fn run_iteration(
        &self,
        shape: &ShapeDescriptor,
        accesses: &[(MemoryRange, AccessKind)],
    ) -> Result<TargetValue> {
        let mut orch = self.inner.lock();
        let handle = orch.begin_iteration(shape)?;
        for (range, kind) in accesses {
            orch.record_access(&handle, *range, *kind);
        }
        for engine in shape.engines() {
            let kind = match engine {
                EngineKind::ScaleUp => BufferKind::ScaleUpStaging,
                EngineKind::ScaleOut => BufferKind::ScaleOutStaging,
                EngineKind::Reduction => BufferKind::ReductionStaging,
            };
            orch.allocate_credit(&handle, kind);
        }
        orch.finalize_iteration(handle)
    }

    /// Feed back hardware progress.
    pub fn retire(&self, value: TargetValue) {
        self.inner.lock().retire(value);
    }

    /// Exclusive access for manual iteration driving.
    pub fn lock(&self) -> MutexGuard<'_, CollectiveOrchestrator> {
        self.inner.lock()
    }
}
