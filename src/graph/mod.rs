//! Per-iteration wait/signal dependency graphs with shape-keyed caching.
//!
//! Every collective iteration builds (or replays) a directed graph of
//! consumer wait events, each fed by one or more hardware completion
//! signals. Resolving the graph binds each wait to a physical sync
//! object; the orchestrator then serializes those bindings onto engine
//! queues. Fully-built graphs are cached by the iteration's structural
//! hash (cuid) so steady-state collectives skip construction and only
//! refresh addresses and counts.

pub mod cache;
pub mod event;

use std::fmt::Write as _;
use std::sync::Arc;

use crate::engine::SyncObjectAllocator;
use crate::error::{Diagnostics, contract_violation};
use crate::types::{SyncAddress, TargetValue};
use cache::GraphCache;
use event::{SignalKind, SignalState, SyncBinding, WaitMethod, WaitPhase, WaitPoint, WaitState};

/// One phase of a wait event: how many signal occurrences it expects
/// and which signal kinds feed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseSpec {
    pub phase: WaitPhase,
    pub expected: u32,
    pub signals: Vec<SignalKind>,
}

impl PhaseSpec {
    fn wired(&self) -> bool {
        self.signals.len() as u32 == self.expected
    }
}

/// Structural description of one wait event: its physical-primitive
/// class and its phase chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitSpec {
    pub point: WaitPoint,
    pub method: WaitMethod,
    pub longterm_slot: Option<u8>,
    pub phases: Vec<PhaseSpec>,
}

impl WaitSpec {
    fn state(&self) -> WaitState {
        if self.phases.iter().all(PhaseSpec::wired) {
            WaitState::Signalled
        } else {
            WaitState::PartiallySignalled
        }
    }
}

/// A sealed, cacheable graph shape: wait events plus the signals that
/// feed the iteration's own completion counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphTemplate {
    pub waits: Vec<WaitSpec>,
    pub completion_signals: Vec<SignalKind>,
}

impl GraphTemplate {
    /// Wait methods used by this graph, deduplicated in first-use order.
    /// These are the primitives that must be reset after the iteration.
    pub fn cleanup_methods(&self) -> Vec<WaitMethod> {
        let mut out = Vec::new();
        for spec in &self.waits {
            if !out.contains(&spec.method) {
                out.push(spec.method);
            }
        }
        if !self.completion_signals.is_empty() && !out.contains(&WaitMethod::External) {
            out.push(WaitMethod::External);
        }
        out
    }
}

/// Concrete per-iteration state of one signal event.
#[derive(Debug, Clone)]
struct SignalRuntime {
    kind: SignalKind,
    state: SignalState,
    /// Set by `allocate_resources`.
    binding: Option<SyncBinding>,
    /// Feeds the completion accumulator rather than a consumer wait.
    completion: bool,
}

/// Concrete per-iteration state of one wait event.
#[derive(Debug, Clone)]
struct WaitRuntime {
    point: WaitPoint,
    state: WaitState,
    /// One binding per phase, set by `allocate_resources`.
    bindings: Vec<SyncBinding>,
}

enum Mode {
    /// First time this shape is seen: the full enqueue sequence runs
    /// and the template is sealed into the cache afterwards.
    Build { waits: Vec<WaitSpec>, completion: Vec<SignalKind> },
    /// Cache hit: the template drives resolution directly.
    Replay(Arc<GraphTemplate>),
}

struct Session {
    cuid: u64,
    mode: Mode,
    signals: Vec<SignalRuntime>,
    waits: Vec<WaitRuntime>,
    resolved: bool,
}

impl Session {
    fn signal_mut(&mut self, kind: SignalKind) -> Option<&mut SignalRuntime> {
        self.signals.iter_mut().find(|s| s.kind == kind)
    }

    fn wait_mut(&mut self, point: WaitPoint) -> Option<&mut WaitRuntime> {
        self.waits.iter_mut().find(|w| w.point == point)
    }
}

/// Builds, resolves, and caches wait/signal graphs for one queue.
///
/// All misuse (enqueueing outside a build, zero expected signals,
/// resolving with partially-signalled events, sealing with dangling
/// waits) indicates the orchestrator and the hazard/credit layers have
/// gone out of sync, and is fatal.
pub struct SignalGraphScheduler {
    cache: GraphCache,
    session: Option<Session>,
}

impl SignalGraphScheduler {
    pub fn new(cache_capacity: usize) -> Self {
        Self {
            cache: GraphCache::new(cache_capacity),
            session: None,
        }
    }

    /// Open the graph session for one iteration.
    ///
    /// Returns `true` on a cache hit: the caller must skip the
    /// `enqueue_*` sequence and go straight to `allocate_resources`.
    pub fn load_graph(&mut self, cuid: u64) -> bool {
        if self.session.is_some() {
            self.fatal("load_graph", "previous graph session still open");
        }
        let (mode, loaded) = match self.cache.get(cuid) {
            Some(template) => (Mode::Replay(template), true),
            None => (
                Mode::Build {
                    waits: Vec::new(),
                    completion: Vec::new(),
                },
                false,
            ),
        };
        tracing::debug!(cuid, loaded, "opened graph session");
        self.session = Some(Session {
            cuid,
            mode,
            signals: Vec::new(),
            waits: Vec::new(),
            resolved: false,
        });
        loaded
    }

    /// Whether the current session replays a cached graph.
    pub fn is_graph_loaded(&self) -> bool {
        matches!(
            self.session,
            Some(Session {
                mode: Mode::Replay(_),
                ..
            })
        )
    }

    /// Register a consumer dependency: `point` must observe `expected`
    /// occurrences of the given signal kinds in phase `phase` before it
    /// is satisfied.
    ///
    /// Re-enqueueing the same point accumulates phases; re-enqueueing
    /// the same phase contributes further signals toward its expected
    /// count. Method and long-term slot must stay consistent across
    /// calls for one point.
    pub fn enqueue_wait(
        &mut self,
        point: WaitPoint,
        signals: &[SignalKind],
        method: WaitMethod,
        phase: WaitPhase,
        expected: u32,
        longterm_slot: Option<u8>,
    ) {
        if expected == 0 {
            self.fatal(
                "enqueue_wait",
                &format!("wait {point} registered with zero expected signals"),
            );
        }
        if signals.is_empty() {
            self.fatal("enqueue_wait", &format!("wait {point} fed by no signals"));
        }
        self.register_signals(signals, false);
        let session = self.session_mut("enqueue_wait");
        let Mode::Build { waits, .. } = &mut session.mode else {
            contract_violation(
                "graph",
                "enqueue_wait on a replayed graph",
                "",
            );
        };

        let spec = match waits.iter_mut().find(|w| w.point == point) {
            Some(spec) => {
                if spec.method != method || spec.longterm_slot != longterm_slot {
                    contract_violation(
                        "graph",
                        &format!(
                            "wait {point} re-registered with method {method} (was {})",
                            spec.method
                        ),
                        "",
                    );
                }
                spec
            }
            None => {
                waits.push(WaitSpec {
                    point,
                    method,
                    longterm_slot,
                    phases: Vec::new(),
                });
                waits.last_mut().expect("just pushed")
            }
        };
        match spec.phases.iter_mut().find(|p| p.phase == phase) {
            Some(ps) => {
                if ps.expected != expected {
                    contract_violation(
                        "graph",
                        &format!(
                            "wait {point} phase {phase} expected count changed from {} to {expected}",
                            ps.expected
                        ),
                        "",
                    );
                }
                if ps.signals.len() + signals.len() > expected as usize {
                    contract_violation(
                        "graph",
                        &format!("wait {point} phase {phase} over-subscribed"),
                        "",
                    );
                }
                ps.signals.extend_from_slice(signals);
            }
            None => {
                if signals.len() > expected as usize {
                    contract_violation(
                        "graph",
                        &format!("wait {point} phase {phase} over-subscribed"),
                        "",
                    );
                }
                spec.phases.push(PhaseSpec {
                    phase,
                    expected,
                    signals: signals.to_vec(),
                });
            }
        }

        let state = spec.state();
        match session.waits.iter_mut().find(|w| w.point == point) {
            Some(rt) => rt.state = state,
            None => session.waits.push(WaitRuntime {
                point,
                state,
                bindings: Vec::new(),
            }),
        }
    }

    /// Mark signals as contributing directly to the iteration's own
    /// completion counter: no consumer wait beyond the queue's
    /// completion object.
    pub fn enqueue_completion(&mut self, signals: &[SignalKind]) {
        if signals.is_empty() {
            self.fatal("enqueue_completion", "empty completion signal set");
        }
        self.register_signals(signals, true);
        let session = self.session_mut("enqueue_completion");
        let Mode::Build { completion, .. } = &mut session.mode else {
            contract_violation("graph", "enqueue_completion on a replayed graph", "");
        };
        completion.extend_from_slice(signals);
    }

    fn register_signals(&mut self, signals: &[SignalKind], completion: bool) {
        let session = self.session_mut("register_signals");
        for &kind in signals {
            if session.signals.iter().any(|s| s.kind == kind) {
                contract_violation(
                    "graph",
                    &format!("signal {kind} registered twice in one iteration"),
                    "",
                );
            }
            session.signals.push(SignalRuntime {
                kind,
                state: SignalState::Registered,
                binding: None,
                completion,
            });
        }
    }

    /// Finalize addresses for the current iteration once all enqueue
    /// calls are done (build) or directly from the template (replay).
    ///
    /// Every wait phase resolves to one physical sync object whose
    /// count target is the phase's expected occurrence count; the
    /// signals feeding the phase bind to the same object. Completion
    /// signals bind to the external completion object; their counter
    /// value is filled in by [`update_completion_tracker`].
    ///
    /// [`update_completion_tracker`]: Self::update_completion_tracker
    pub fn allocate_resources(&mut self, allocator: &dyn SyncObjectAllocator) {
        let template: Option<Arc<GraphTemplate>> = {
            let session = self.session_mut("allocate_resources");
            if session.resolved {
                contract_violation("graph", "allocate_resources called twice", "");
            }
            match &session.mode {
                Mode::Replay(t) => Some(Arc::clone(t)),
                Mode::Build { .. } => None,
            }
        };

        // Replay path: materialize runtime state from the template,
        // skipping the enqueue sequence entirely.
        if let Some(template) = &template {
            let session = self.session_mut("allocate_resources");
            for spec in &template.waits {
                session.waits.push(WaitRuntime {
                    point: spec.point,
                    state: spec.state(),
                    bindings: Vec::new(),
                });
                for ps in &spec.phases {
                    for &kind in &ps.signals {
                        session.signals.push(SignalRuntime {
                            kind,
                            state: SignalState::Registered,
                            binding: None,
                            completion: false,
                        });
                    }
                }
            }
            for &kind in &template.completion_signals {
                session.signals.push(SignalRuntime {
                    kind,
                    state: SignalState::Registered,
                    binding: None,
                    completion: true,
                });
            }
        }

        let (specs, completion): (Vec<WaitSpec>, Vec<SignalKind>) = {
            let session = self.session_mut("allocate_resources");
            match (&session.mode, template) {
                (_, Some(t)) => (t.waits.clone(), t.completion_signals.clone()),
                (Mode::Build { waits, completion }, None) => (waits.clone(), completion.clone()),
                (Mode::Replay(_), None) => unreachable!("template captured above"),
            }
        };

        let dangling: Vec<WaitPoint> = specs
            .iter()
            .filter(|s| s.state() != WaitState::Signalled)
            .map(|s| s.point)
            .collect();
        if !dangling.is_empty() {
            let mut dump = String::new();
            self.diagnostics(&mut dump);
            contract_violation(
                "graph",
                &format!("unresolved wait events at resolution: {dangling:?}"),
                &dump,
            );
        }

        for spec in &specs {
            for ps in &spec.phases {
                let addr = allocator.resolve(spec.method, ps.phase, spec.longterm_slot);
                let binding = SyncBinding {
                    addr,
                    value: TargetValue::from(ps.expected),
                };
                let session = self.session_mut("allocate_resources");
                session
                    .wait_mut(spec.point)
                    .expect("runtime exists for every spec")
                    .bindings
                    .push(binding);
                for &kind in &ps.signals {
                    session
                        .signal_mut(kind)
                        .expect("runtime exists for every registered signal")
                        .binding = Some(binding);
                }
            }
        }

        let completion_addr = allocator.resolve(WaitMethod::External, 0, None);
        let session = self.session_mut("allocate_resources");
        for &kind in &completion {
            session
                .signal_mut(kind)
                .expect("runtime exists for every completion signal")
                .binding = Some(SyncBinding {
                addr: completion_addr,
                value: 0, // filled in by update_completion_tracker
            });
        }
        session.resolved = true;
        tracing::debug!(
            cuid = session.cuid,
            waits = session.waits.len(),
            signals = session.signals.len(),
            "graph resources allocated"
        );
    }

    /// Physical address bound to `signal`, marking the signal consumed.
    pub fn dequeue_so_address(&mut self, signal: SignalKind) -> SyncAddress {
        self.dequeue_binding(signal).addr
    }

    /// Full binding for `signal` (address plus the value it will
    /// reach), marking the signal consumed.
    pub fn dequeue_binding(&mut self, signal: SignalKind) -> SyncBinding {
        self.require_resolved("dequeue_binding");
        let session = self.session_mut("dequeue_binding");
        let Some(rt) = session.signal_mut(signal) else {
            contract_violation(
                "graph",
                &format!("dequeue of unregistered signal {signal}"),
                "",
            );
        };
        if rt.state == SignalState::Dequeued {
            contract_violation("graph", &format!("signal {signal} dequeued twice"), "");
        }
        rt.state = SignalState::Dequeued;
        rt.binding.expect("resolved session binds every signal")
    }

    /// Signals still awaiting consumption, in registration order.
    pub fn pending_signals(&self) -> Vec<SignalKind> {
        match &self.session {
            Some(s) => s
                .signals
                .iter()
                .filter(|r| r.state == SignalState::Registered)
                .map(|r| r.kind)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Wait points registered this iteration, in registration order.
    pub fn registered_waits(&self) -> Vec<WaitPoint> {
        match &self.session {
            Some(s) => s.waits.iter().map(|w| w.point).collect(),
            None => Vec::new(),
        }
    }

    /// Consume the resolved bindings (one per phase) for `point`,
    /// marking the wait finalized and ineligible for reuse this
    /// iteration.
    pub fn take_wait(&mut self, point: WaitPoint) -> Vec<SyncBinding> {
        self.require_resolved("take_wait");
        let session = self.session_mut("take_wait");
        let Some(rt) = session.wait_mut(point) else {
            contract_violation("graph", &format!("take_wait on unregistered {point}"), "");
        };
        match rt.state {
            WaitState::Signalled => {
                rt.state = WaitState::Finalized;
                rt.bindings.clone()
            }
            other => {
                contract_violation(
                    "graph",
                    &format!("take_wait on {point} in state {other:?}"),
                    "",
                )
            }
        }
    }

    /// Bind the iteration's counter value to every completion signal
    /// and report which wait methods must be reset once that value
    /// retires. The signals stay pending until emission dequeues their
    /// bindings onto instructions.
    pub fn update_completion_tracker(
        &mut self,
        target: TargetValue,
    ) -> Vec<(WaitMethod, TargetValue)> {
        self.require_resolved("update_completion_tracker");
        let session = self.session_mut("update_completion_tracker");
        let mut methods: Vec<WaitMethod> = Vec::new();
        for rt in &mut session.signals {
            if rt.completion {
                if let Some(b) = &mut rt.binding {
                    b.value = target;
                }
                if !methods.contains(&WaitMethod::External) {
                    methods.push(WaitMethod::External);
                }
            }
        }
        let specs: Vec<WaitMethod> = match &session.mode {
            Mode::Build { waits, .. } => waits.iter().map(|w| w.method).collect(),
            Mode::Replay(t) => t.waits.iter().map(|w| w.method).collect(),
        };
        for m in specs {
            if !methods.contains(&m) {
                methods.push(m);
            }
        }
        methods.into_iter().map(|m| (m, target)).collect()
    }

    /// Close the session after emission. Fatal if any wait was never
    /// consumed or any signal never bound downstream; in build mode the
    /// sealed template enters the cache.
    pub fn seal(&mut self) {
        self.require_resolved("seal");
        let session = self.session.take().expect("require_resolved checked");
        let unconsumed: Vec<WaitPoint> = session
            .waits
            .iter()
            .filter(|w| w.state != WaitState::Finalized)
            .map(|w| w.point)
            .collect();
        let unbound: Vec<SignalKind> = session
            .signals
            .iter()
            .filter(|s| s.state != SignalState::Dequeued)
            .map(|s| s.kind)
            .collect();
        if !unconsumed.is_empty() || !unbound.is_empty() {
            self.session = Some(session);
            let mut dump = String::new();
            self.diagnostics(&mut dump);
            contract_violation(
                "graph",
                &format!(
                    "graph sealed with dangling waits {unconsumed:?} and unbound signals {unbound:?}"
                ),
                &dump,
            );
        }
        if let Mode::Build { waits, completion } = session.mode {
            self.cache.insert(
                session.cuid,
                Arc::new(GraphTemplate {
                    waits,
                    completion_signals: completion,
                }),
            );
            tracing::debug!(cuid = session.cuid, "graph template sealed into cache");
        }
    }

    /// Drop the open session without caching anything, leaving prior
    /// cached templates intact. Used when an external failure aborts
    /// the iteration before finalize.
    pub fn abandon(&mut self) {
        self.session = None;
    }

    /// Invalidate every cached template (communicator teardown).
    pub fn invalidate_all(&mut self) {
        self.cache.clear();
        tracing::debug!("graph cache invalidated");
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    fn session_mut(&mut self, op: &str) -> &mut Session {
        match &mut self.session {
            Some(s) => s,
            None => contract_violation("graph", &format!("{op} without an open session"), ""),
        }
    }

    fn require_resolved(&mut self, op: &str) {
        let ok = matches!(&self.session, Some(s) if s.resolved);
        if !ok {
            self.fatal(op, "graph resources not allocated");
        }
    }

    #[cold]
    fn fatal(&self, op: &str, detail: &str) -> ! {
        let mut dump = String::new();
        self.diagnostics(&mut dump);
        contract_violation("graph", &format!("{op}: {detail}"), &dump)
    }
}

impl Diagnostics for SignalGraphScheduler {
    fn diagnostics(&self, out: &mut String) {
        let _ = writeln!(
            out,
            "graph cache: {} / {} templates",
            self.cache.len(),
            self.cache.capacity()
        );
        match &self.session {
            None => {
                let _ = writeln!(out, "no open session");
            }
            Some(s) => {
                let _ = writeln!(out, "session cuid={} resolved={}", s.cuid, s.resolved);
                for w in &s.waits {
                    let _ = writeln!(out, "  wait {}: {:?}", w.point, w.state);
                }
                for sig in &s.signals {
                    let _ = writeln!(
                        out,
                        "  signal {}: {:?} completion={}",
                        sig.kind, sig.state, sig.completion
                    );
                }
            }
        }
    }
}
