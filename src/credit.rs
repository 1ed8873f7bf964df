//! Buffer-credit pools: fixed rings of reusable staging-buffer slots.
//!
//! A credit is permission to reuse one staging-buffer slot. Each slot
//! remembers the completion-counter value that must be reached before
//! the slot is safe to hand out again; allocation is round-robin and
//! assumes the caller has already verified capacity through
//! [`BufferManager::required_credits`].

use std::fmt::Write as _;

use rustc_hash::FxHashMap;

use crate::config::WeftConfig;
use crate::error::{Diagnostics, contract_violation};
use crate::types::{BufferKind, TargetValue};

/// A fixed-size ring of credit slots for one logical buffer kind.
///
/// Power-of-two sizes advance the cursor with a bit-mask; general sizes
/// fall back to modulo.
#[derive(Debug)]
pub struct CreditPool {
    slots: Vec<TargetValue>,
    cursor: usize,
    mask: Option<usize>,
}

impl CreditPool {
    /// Create a pool of `size` slots, all initially expired at 0.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "credit pool must have at least one slot");
        Self {
            slots: vec![0; size],
            cursor: 0,
            mask: size.is_power_of_two().then(|| size - 1),
        }
    }

    /// Take the slot under the cursor, stamping it with `new_expiration`.
    ///
    /// Returns the slot's previous expiration. If the previous
    /// expiration equals `new_expiration` the pool has no free slot:
    /// the caller's required-credit computation was wrong, which is a
    /// capacity-planning bug, never a transient condition to retry.
    pub fn allocate(&mut self, new_expiration: TargetValue) -> TargetValue {
        let slot = self.cursor;
        let previous = self.slots[slot];
        if previous == new_expiration {
            let mut dump = String::new();
            self.diagnostics(&mut dump);
            contract_violation(
                "credit",
                &format!(
                    "pool of {} slots exhausted: slot {slot} already expires at {new_expiration}",
                    self.slots.len()
                ),
                &dump,
            );
        }
        self.slots[slot] = new_expiration;
        self.cursor = match self.mask {
            Some(mask) => (slot + 1) & mask,
            None => (slot + 1) % self.slots.len(),
        };
        previous
    }

    /// Index of the slot the next `allocate` will hand out.
    pub fn current_slot(&self) -> usize {
        self.cursor
    }

    /// Expiration of the slot the next `allocate` will hand out.
    pub fn current_expiration(&self) -> TargetValue {
        self.slots[self.cursor]
    }

    /// Whether the cursor slot expires exactly at `current`, meaning
    /// this iteration must insert a buffer-barrier signal before the
    /// slot can cycle again.
    pub fn is_expiring(&self, current: TargetValue) -> bool {
        self.current_expiration() == current
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl Diagnostics for CreditPool {
    fn diagnostics(&self, out: &mut String) {
        let _ = writeln!(
            out,
            "credit pool: {} slots, cursor={}",
            self.slots.len(),
            self.cursor
        );
        for (i, exp) in self.slots.iter().enumerate() {
            let _ = writeln!(out, "  slot {i}: expires at {exp}");
        }
    }
}

/// Logical identity of one credit pool: buffer kind plus the stream and
/// sub-index the higher layers multiplex over it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub kind: BufferKind,
    pub stream: u8,
    pub sub_index: u8,
}

impl PoolKey {
    /// The default pool for a buffer kind (stream 0, sub-index 0).
    pub const fn of(kind: BufferKind) -> Self {
        Self {
            kind,
            stream: 0,
            sub_index: 0,
        }
    }
}

#[derive(Debug)]
struct ManagedPool {
    pool: CreditPool,
    base: u64,
    stride: u64,
}

/// Maps logical (kind, stream, sub-index) tuples to a credit pool plus a
/// base address and stride, keeping the pools themselves address-agnostic.
#[derive(Debug, Default)]
pub struct BufferManager {
    pools: FxHashMap<PoolKey, ManagedPool>,
}

impl BufferManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the default pool per buffer kind from config. Each kind
    /// gets its own address region; slot addresses are
    /// `base + slot * stride`.
    pub fn from_config(config: &WeftConfig) -> Self {
        let mut mgr = Self::new();
        for kind in BufferKind::ALL {
            let base = (kind as u64) << 32;
            mgr.register(
                PoolKey::of(kind),
                config.credits_for(kind),
                base,
                config.staging_stride,
            );
        }
        mgr
    }

    /// Register a pool. Re-registering an existing key is a
    /// configuration bug and fatal.
    pub fn register(&mut self, key: PoolKey, size: usize, base: u64, stride: u64) {
        let replaced = self.pools.insert(
            key,
            ManagedPool {
                pool: CreditPool::new(size),
                base,
                stride,
            },
        );
        if replaced.is_some() {
            contract_violation(
                "credit",
                &format!("pool {} registered twice", key.kind),
                "",
            );
        }
        tracing::debug!(kind = key.kind.name(), size, base, stride, "registered credit pool");
    }

    fn pool(&self, key: PoolKey) -> &ManagedPool {
        match self.pools.get(&key) {
            Some(p) => p,
            None => {
                let mut dump = String::new();
                self.diagnostics(&mut dump);
                contract_violation(
                    "credit",
                    &format!("no pool registered for kind {}", key.kind),
                    &dump,
                )
            }
        }
    }

    /// Allocate a credit from the pool under `key`, returning the slot's
    /// device address and its previous expiration.
    pub fn allocate(&mut self, key: PoolKey, new_expiration: TargetValue) -> (u64, TargetValue) {
        self.pool(key); // fatal on unknown key before the mutable borrow
        let managed = self.pools.get_mut(&key).expect("pool checked above");
        let slot = managed.pool.current_slot();
        let previous = managed.pool.allocate(new_expiration);
        let address = managed.base + slot as u64 * managed.stride;
        tracing::trace!(
            kind = key.kind.name(),
            slot,
            address,
            previous,
            new_expiration,
            "allocated credit"
        );
        (address, previous)
    }

    /// Whether the pool's cursor slot expires at `current`.
    pub fn is_expiring(&self, key: PoolKey, current: TargetValue) -> bool {
        self.pool(key).pool.is_expiring(current)
    }

    /// Number of slots in the pool under `key`.
    pub fn pool_size(&self, key: PoolKey) -> usize {
        self.pool(key).pool.len()
    }

    /// Capacity-planning bound for one iteration: the number of slots
    /// the iteration touches in this pool, plus one buffer-barrier
    /// credit when the cursor slot expires exactly at the current
    /// counter value.
    ///
    /// This is the single place the required-credit formula lives;
    /// call sites must not duplicate it.
    pub fn required_credits(
        &self,
        key: PoolKey,
        touched_slots: usize,
        current: TargetValue,
    ) -> usize {
        touched_slots + usize::from(self.is_expiring(key, current))
    }
}

impl Diagnostics for BufferManager {
    fn diagnostics(&self, out: &mut String) {
        for (key, managed) in &self.pools {
            let _ = writeln!(
                out,
                "pool {} (stream {}, sub {}): base={:#x} stride={:#x}",
                key.kind, key.stream, key.sub_index, managed.base, managed.stride
            );
            managed.pool.diagnostics(out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_allocation() {
        // Spec scenario: pool of 2, allocations at 7, 9, then 11.
        let mut p = CreditPool::new(2);
        assert_eq!(p.allocate(7), 0);
        assert_eq!(p.allocate(9), 0);
        // Wraps to slot 0, whose old expiration 7 differs from 11.
        assert_eq!(p.allocate(11), 7);
        assert_eq!(p.current_slot(), 1);
    }

    #[test]
    fn test_peeks_do_not_mutate() {
        let mut p = CreditPool::new(4);
        p.allocate(5);
        assert_eq!(p.current_slot(), 1);
        assert_eq!(p.current_expiration(), 0);
        assert_eq!(p.current_slot(), 1);
        assert!(!p.is_expiring(5));
        assert!(p.is_expiring(0));
    }

    #[test]
    #[should_panic(expected = "exhausted")]
    fn test_exhaustion_is_fatal() {
        let mut p = CreditPool::new(2);
        p.allocate(7);
        p.allocate(7);
        // Slot 0 already expires at 7: reuse without retirement.
        p.allocate(7);
    }

    #[test]
    fn test_non_power_of_two_wraps() {
        let mut p = CreditPool::new(3);
        p.allocate(1);
        p.allocate(2);
        p.allocate(3);
        assert_eq!(p.current_slot(), 0);
        assert_eq!(p.allocate(4), 1);
    }

    #[test]
    fn test_manager_addresses_follow_stride() {
        let mut mgr = BufferManager::new();
        let key = PoolKey::of(BufferKind::ScaleUpStaging);
        mgr.register(key, 4, 0x1000, 0x100);
        assert_eq!(mgr.allocate(key, 5), (0x1000, 0));
        assert_eq!(mgr.allocate(key, 5), (0x1100, 0));
        assert_eq!(mgr.allocate(key, 6), (0x1200, 0));
    }

    #[test]
    fn test_manager_from_config_registers_all_kinds() {
        let mgr = BufferManager::from_config(&WeftConfig::default());
        for kind in BufferKind::ALL {
            assert!(mgr.pool_size(PoolKey::of(kind)) > 0);
        }
    }

    #[test]
    fn test_required_credits_adds_barrier_on_expiry() {
        let mut mgr = BufferManager::new();
        let key = PoolKey::of(BufferKind::ScaleOutStaging);
        mgr.register(key, 2, 0, 0x100);
        // Fresh pool: cursor slot expires at 0.
        assert_eq!(mgr.required_credits(key, 2, 5), 2);
        assert_eq!(mgr.required_credits(key, 2, 0), 3);
        mgr.allocate(key, 7);
        mgr.allocate(key, 8);
        // Cursor wrapped to slot 0 (expires at 7).
        assert_eq!(mgr.required_credits(key, 1, 7), 2);
        assert_eq!(mgr.required_credits(key, 1, 6), 1);
    }

    #[test]
    #[should_panic(expected = "no pool registered")]
    fn test_unknown_pool_is_fatal() {
        let mgr = BufferManager::new();
        mgr.pool_size(PoolKey::of(BufferKind::ReductionStaging));
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn test_double_registration_is_fatal() {
        let mut mgr = BufferManager::new();
        let key = PoolKey::of(BufferKind::ScaleUpStaging);
        mgr.register(key, 2, 0, 0x100);
        mgr.register(key, 2, 0, 0x100);
    }
}
