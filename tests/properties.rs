use proptest::prelude::*;

use weft::{
    AccessKind, CompletionRecord, CreditPool, MemoryRange, RangeHazardTracker, TargetValue,
    completion_ring,
};

fn access_strategy() -> impl Strategy<Value = (u64, u64, AccessKind)> {
    (0u64..4096, 1u64..512, prop_oneof![Just(AccessKind::Read), Just(AccessKind::Write)])
}

proptest! {
    /// A returned wait value always refers to an access that actually
    /// happened: it is below the new access's own counter value.
    #[test]
    fn prop_wait_is_always_in_the_past(accesses in prop::collection::vec(access_strategy(), 1..64)) {
        let mut tracker = RangeHazardTracker::new();
        for (i, (start, len, kind)) in accesses.iter().enumerate() {
            let target = (i + 1) as TargetValue;
            let wait = tracker.check_and_record(
                MemoryRange::new(*start, start + len),
                target,
                *kind,
                true,
            );
            prop_assert!(wait < target, "wait {wait} not before target {target}");
        }
    }

    /// A read overlapping exactly one prior write waits for precisely
    /// that writer's counter value.
    #[test]
    fn prop_read_waits_for_its_writer(start in 0u64..4096, len in 1u64..512, overlap in 0u64..512) {
        let mut tracker = RangeHazardTracker::new();
        tracker.check_and_record(MemoryRange::new(start, start + len), 3, AccessKind::Write, true);
        let probe = MemoryRange::new(start + overlap % len, start + len + overlap);
        let wait = tracker.check_and_record(probe, 4, AccessKind::Read, true);
        prop_assert_eq!(wait, 3);
    }

    /// Same-kind overlapping accesses collapse: the tracked entry count
    /// never exceeds the number of disjoint regions touched.
    #[test]
    fn prop_writes_merge_to_disjoint_ranges(writes in prop::collection::vec((0u64..256, 1u64..64), 1..40)) {
        let mut tracker = RangeHazardTracker::new();
        for (i, (start, len)) in writes.iter().enumerate() {
            tracker.check_and_record(
                MemoryRange::new(*start, start + len),
                (i + 1) as TargetValue,
                AccessKind::Write,
                true,
            );
        }
        prop_assert!(tracker.outstanding_writes() <= writes.len());
        // One covering write always collapses the whole set.
        tracker.check_and_record(
            MemoryRange::new(0, 512),
            (writes.len() + 1) as TargetValue,
            AccessKind::Write,
            true,
        );
        prop_assert_eq!(tracker.outstanding_writes(), 1);
    }

    /// Retirement is idempotent and monotone: retiring the same value
    /// twice, or a smaller value after a larger one, changes nothing.
    #[test]
    fn prop_retirement_idempotent(
        writes in prop::collection::vec((0u64..4096, 1u64..256), 1..32),
        upto in 0u64..40,
    ) {
        let mut tracker = RangeHazardTracker::new();
        for (i, (start, len)) in writes.iter().enumerate() {
            tracker.check_and_record(
                MemoryRange::new(*start, start + len),
                (i + 1) as TargetValue,
                AccessKind::Write,
                true,
            );
        }
        tracker.retire(upto);
        let after_first = tracker.outstanding_writes();
        tracker.retire(upto);
        prop_assert_eq!(tracker.outstanding_writes(), after_first);
        tracker.retire(upto.saturating_sub(1));
        prop_assert_eq!(tracker.outstanding_writes(), after_first);
    }

    /// A dry-run check returns the same wait as the committing check
    /// would, and commits nothing.
    #[test]
    fn prop_dry_run_matches_commit(
        writes in prop::collection::vec((0u64..1024, 1u64..128), 1..16),
        probe_start in 0u64..1024,
        probe_len in 1u64..128,
    ) {
        let mut committed = RangeHazardTracker::new();
        let mut dry = RangeHazardTracker::new();
        for (i, (start, len)) in writes.iter().enumerate() {
            let range = MemoryRange::new(*start, start + len);
            let target = (i + 1) as TargetValue;
            committed.check_and_record(range, target, AccessKind::Write, true);
            dry.check_and_record(range, target, AccessKind::Write, true);
        }
        let probe = MemoryRange::new(probe_start, probe_start + probe_len);
        let target = (writes.len() + 1) as TargetValue;
        let before = dry.outstanding_writes();
        let predicted = dry.check_and_record(probe, target, AccessKind::Write, false);
        prop_assert_eq!(dry.outstanding_writes(), before, "dry run must not commit");
        let actual = committed.check_and_record(probe, target, AccessKind::Write, true);
        prop_assert_eq!(predicted, actual);
    }

    /// With strictly increasing expirations a pool never hands out the
    /// same slot before its previous expiration, and previous
    /// expirations replay the allocation history exactly `size` steps
    /// behind.
    #[test]
    fn prop_credit_slots_cycle_in_order(size in 1usize..16, rounds in 1usize..64) {
        let mut pool = CreditPool::new(size);
        let mut history: Vec<TargetValue> = Vec::new();
        for i in 0..rounds {
            let expiration = (i + 1) as TargetValue;
            let previous = pool.allocate(expiration);
            let expected = if i >= size { history[i - size] } else { 0 };
            prop_assert_eq!(previous, expected);
            prop_assert!(previous < expiration);
            history.push(expiration);
        }
    }

    /// The ring delivers every record in push order across arbitrary
    /// push/pop interleavings.
    #[test]
    fn prop_ring_preserves_fifo(ops in prop::collection::vec(any::<bool>(), 1..200)) {
        let (mut tx, mut rx) = completion_ring(16);
        let mut next_push = 0u64;
        let mut next_pop = 0u64;
        for push in ops {
            if push {
                if tx.push(CompletionRecord { queue: 0, target: next_push }).is_ok() {
                    next_push += 1;
                }
            } else if let Some(rec) = rx.pop() {
                prop_assert_eq!(rec.target, next_pop);
                next_pop += 1;
            }
        }
        while let Some(rec) = rx.pop() {
            prop_assert_eq!(rec.target, next_pop);
            next_pop += 1;
        }
        prop_assert_eq!(next_pop, next_push);
    }
}
