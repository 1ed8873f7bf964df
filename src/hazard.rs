//! Read/write hazard tracking over device-memory byte ranges.
//!
//! The tracker keeps two sets of outstanding ranges (reads and writes),
//! each entry stamped with the completion-counter value that produced it.
//! A new access asks which prior conflicting access it must wait for;
//! the answer is a single counter value the hardware observes before the
//! new access's commands execute.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::ops::Bound::{Excluded, Included, Unbounded};

use crate::error::{Diagnostics, contract_violation};
use crate::types::{AccessKind, MemoryRange, NO_WAIT, TargetValue};

/// An outstanding tracked range: half-open end plus the counter value of
/// the access that produced it.
#[derive(Debug, Clone, Copy)]
struct TrackedRange {
    end: u64,
    target: TargetValue,
}

/// One of the two outstanding-range sets (reads or writes).
///
/// Invariant: entries never overlap. `by_start` is the address-ordered
/// map used for overlap probes; `by_target` orders the same entries
/// oldest-first so retirement is O(k log n) in the number removed.
#[derive(Debug, Default)]
struct RangeSet {
    by_start: BTreeMap<u64, TrackedRange>,
    by_target: BTreeSet<(TargetValue, u64)>,
}

impl RangeSet {
    /// Start keys of every entry overlapping `range`.
    ///
    /// Entries are non-overlapping, so only the entry immediately
    /// preceding `range.start` can reach into the query from the left;
    /// everything else overlapping must start inside `[start, end)`.
    fn overlapping(&self, range: &MemoryRange) -> Vec<u64> {
        let mut out = Vec::new();
        if let Some((&start, entry)) = self.by_start.range(..=range.start).next_back() {
            if entry.end > range.start {
                out.push(start);
            }
        }
        for (&start, _) in self
            .by_start
            .range((Excluded(range.start), Excluded(range.end)))
        {
            out.push(start);
        }
        out
    }

    /// Highest counter value among entries conflicting with `range`,
    /// or `NO_WAIT` if none conflict.
    fn max_conflict(&self, range: &MemoryRange) -> TargetValue {
        self.overlapping(range)
            .iter()
            .map(|s| self.by_start[s].target)
            .max()
            .unwrap_or(NO_WAIT)
    }

    /// Union `range` with every overlapping entry and insert the merged
    /// range stamped with `target`. Returns the highest counter value
    /// among the entries that were merged away.
    fn merge_insert(&mut self, range: MemoryRange, target: TargetValue) -> TargetValue {
        let mut merged = range;
        let mut prior = NO_WAIT;
        for start in self.overlapping(&range) {
            let entry = self
                .by_start
                .remove(&start)
                .expect("overlap probe returned a missing key");
            self.by_target.remove(&(entry.target, start));
            merged = merged.union(&MemoryRange::new(start, entry.end));
            prior = prior.max(entry.target);
        }
        self.by_start.insert(
            merged.start,
            TrackedRange {
                end: merged.end,
                target,
            },
        );
        self.by_target.insert((target, merged.start));
        prior
    }

    /// Drop every entry stamped with a counter value ≤ `upto`.
    fn retire(&mut self, upto: TargetValue) -> usize {
        let expired: Vec<(TargetValue, u64)> = self
            .by_target
            .range((Unbounded, Included((upto, u64::MAX))))
            .copied()
            .collect();
        for (target, start) in &expired {
            self.by_target.remove(&(*target, *start));
            self.by_start.remove(start);
        }
        expired.len()
    }

    fn len(&self) -> usize {
        self.by_start.len()
    }

    fn dump(&self, out: &mut String) {
        for (start, entry) in &self.by_start {
            let _ = writeln!(
                out,
                "  {} @ {}",
                MemoryRange::new(*start, entry.end),
                entry.target
            );
        }
    }
}

/// Tracks outstanding device-memory accesses per queue and computes the
/// counter value a new access must wait for.
///
/// Flow policies:
/// - read-after-read and write-after-write merge overlapping same-kind
///   entries into one wider range stamped with the new counter value;
///   a write still waits for the prior writers it merged over.
/// - write-after-read and read-after-write never merge; they only
///   return the highest conflicting counter value from the opposite set.
///
/// Counter values must be presented in non-decreasing order; a decrease
/// is a fatal contract violation (the core is single-threaded per
/// queue, so this is a programmer error, not a race).
#[derive(Debug, Default)]
pub struct RangeHazardTracker {
    reads: RangeSet,
    writes: RangeSet,
    last_target: TargetValue,
}

impl RangeHazardTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check `range` for conflicts and (unless `may_mutate` is false)
    /// record the access.
    ///
    /// Returns the counter value the access must wait for, or
    /// [`NO_WAIT`] when no prior access conflicts. With
    /// `may_mutate = false` the same computation runs without
    /// committing any bookkeeping, for dry-run checks inside grouped
    /// batches.
    pub fn check_and_record(
        &mut self,
        range: MemoryRange,
        target: TargetValue,
        kind: AccessKind,
        may_mutate: bool,
    ) -> TargetValue {
        if target < self.last_target {
            let mut dump = String::new();
            self.diagnostics(&mut dump);
            contract_violation(
                "hazard",
                &format!(
                    "non-monotonic target value {target} after {} ({} access to {range})",
                    self.last_target,
                    kind.name()
                ),
                &dump,
            );
        }
        if range.is_empty() {
            return NO_WAIT;
        }

        let wait = match kind {
            AccessKind::Read => {
                // RAW from the write set; RAR merges without waiting.
                let raw = self.writes.max_conflict(&range);
                if may_mutate {
                    self.reads.merge_insert(range, target);
                }
                raw
            }
            AccessKind::Write => {
                // WAR from the read set, WAW from the prior writers the
                // merge replaces.
                let war = self.reads.max_conflict(&range);
                let waw = if may_mutate {
                    self.writes.merge_insert(range, target)
                } else {
                    self.writes.max_conflict(&range)
                };
                war.max(waw)
            }
        };

        if may_mutate {
            self.last_target = target;
        }
        tracing::trace!(
            %range,
            target,
            kind = kind.name(),
            wait,
            may_mutate,
            "hazard check"
        );
        wait
    }

    /// Drop every tracked range (both sets) stamped with a counter
    /// value ≤ `upto`. Idempotent.
    pub fn retire(&mut self, upto: TargetValue) {
        let dropped = self.reads.retire(upto) + self.writes.retire(upto);
        if dropped > 0 {
            tracing::trace!(upto, dropped, "retired hazard ranges");
        }
    }

    /// Number of outstanding tracked read ranges.
    pub fn outstanding_reads(&self) -> usize {
        self.reads.len()
    }

    /// Number of outstanding tracked write ranges.
    pub fn outstanding_writes(&self) -> usize {
        self.writes.len()
    }
}

impl Diagnostics for RangeHazardTracker {
    fn diagnostics(&self, out: &mut String) {
        let _ = writeln!(out, "hazard: last_target={}", self.last_target);
        let _ = writeln!(out, "outstanding reads ({}):", self.reads.len());
        self.reads.dump(out);
        let _ = writeln!(out, "outstanding writes ({}):", self.writes.len());
        self.writes.dump(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AccessKind::{Read, Write};

    fn r(start: u64, end: u64) -> MemoryRange {
        MemoryRange::new(start, end)
    }

    #[test]
    fn test_read_after_write_waits() {
        // Spec scenario: write [100,200)@5 then read [150,250)@6.
        let mut t = RangeHazardTracker::new();
        assert_eq!(t.check_and_record(r(100, 200), 5, Write, true), NO_WAIT);
        assert_eq!(t.check_and_record(r(150, 250), 6, Read, true), 5);
        // Write-set still holds [100,200)@5, read-set holds [150,250)@6.
        assert_eq!(t.outstanding_writes(), 1);
        assert_eq!(t.outstanding_reads(), 1);
    }

    #[test]
    fn test_disjoint_reads_no_conflict() {
        let mut t = RangeHazardTracker::new();
        assert_eq!(t.check_and_record(r(0, 50), 3, Read, true), NO_WAIT);
        assert_eq!(t.check_and_record(r(100, 150), 4, Read, true), NO_WAIT);
        assert_eq!(t.outstanding_reads(), 2);
    }

    #[test]
    fn test_overlapping_reads_merge_without_wait() {
        let mut t = RangeHazardTracker::new();
        assert_eq!(t.check_and_record(r(0, 100), 3, Read, true), NO_WAIT);
        assert_eq!(t.check_and_record(r(50, 150), 4, Read, true), NO_WAIT);
        // Merged into a single [0,150) entry stamped with 4.
        assert_eq!(t.outstanding_reads(), 1);
        // A write over any part of the union must wait for 4.
        assert_eq!(t.check_and_record(r(0, 10), 5, Write, false), 4);
        assert_eq!(t.check_and_record(r(140, 150), 5, Write, false), 4);
    }

    #[test]
    fn test_write_after_write_waits_and_merges() {
        let mut t = RangeHazardTracker::new();
        assert_eq!(t.check_and_record(r(0, 100), 2, Write, true), NO_WAIT);
        assert_eq!(t.check_and_record(r(50, 200), 3, Write, true), 2);
        assert_eq!(t.outstanding_writes(), 1);
        // Union covers [0,200) stamped with 3.
        assert_eq!(t.check_and_record(r(190, 200), 4, Write, true), 3);
    }

    #[test]
    fn test_write_after_read_waits_without_touching_read_set() {
        let mut t = RangeHazardTracker::new();
        t.check_and_record(r(100, 200), 5, Read, true);
        assert_eq!(t.check_and_record(r(150, 160), 6, Write, true), 5);
        // The read entry is untouched by the write.
        assert_eq!(t.outstanding_reads(), 1);
        assert_eq!(t.outstanding_writes(), 1);
    }

    #[test]
    fn test_predecessor_overlap_detected() {
        // A wide earlier entry must be found even when the query starts
        // past its start address.
        let mut t = RangeHazardTracker::new();
        t.check_and_record(r(0, 1000), 2, Write, true);
        assert_eq!(t.check_and_record(r(500, 600), 3, Read, true), 2);
    }

    #[test]
    fn test_touching_ranges_do_not_conflict() {
        let mut t = RangeHazardTracker::new();
        t.check_and_record(r(0, 100), 2, Write, true);
        assert_eq!(t.check_and_record(r(100, 200), 3, Read, true), NO_WAIT);
    }

    #[test]
    fn test_dry_run_commits_nothing() {
        let mut t = RangeHazardTracker::new();
        t.check_and_record(r(0, 100), 2, Write, true);
        assert_eq!(t.check_and_record(r(50, 150), 3, Write, false), 2);
        assert_eq!(t.outstanding_writes(), 1);
        // The committed follow-up sees the same answer.
        assert_eq!(t.check_and_record(r(50, 150), 3, Write, true), 2);
    }

    #[test]
    fn test_retire_drops_only_expired() {
        let mut t = RangeHazardTracker::new();
        t.check_and_record(r(0, 100), 5, Write, true);
        t.check_and_record(r(200, 300), 8, Read, true);
        t.retire(7);
        assert_eq!(t.outstanding_writes(), 0);
        assert_eq!(t.outstanding_reads(), 1);
        // Idempotent: a second retire at the same value is a no-op.
        t.retire(7);
        assert_eq!(t.outstanding_reads(), 1);
        t.retire(8);
        assert_eq!(t.outstanding_reads(), 0);
    }

    #[test]
    fn test_retire_noop_below_all_targets() {
        let mut t = RangeHazardTracker::new();
        t.check_and_record(r(0, 100), 8, Write, true);
        t.retire(7);
        assert_eq!(t.outstanding_writes(), 1);
    }

    #[test]
    fn test_empty_range_ignored() {
        let mut t = RangeHazardTracker::new();
        assert_eq!(t.check_and_record(r(100, 100), 2, Write, true), NO_WAIT);
        assert_eq!(t.outstanding_writes(), 0);
    }

    #[test]
    fn test_equal_target_values_allowed() {
        let mut t = RangeHazardTracker::new();
        t.check_and_record(r(0, 100), 5, Read, true);
        t.check_and_record(r(200, 300), 5, Read, true);
        assert_eq!(t.outstanding_reads(), 2);
    }

    #[test]
    #[should_panic(expected = "non-monotonic target value")]
    fn test_monotonicity_violation_is_fatal() {
        let mut t = RangeHazardTracker::new();
        t.check_and_record(r(0, 100), 5, Read, true);
        t.check_and_record(r(200, 300), 4, Read, true);
    }

    #[test]
    fn test_merge_covers_multiple_entries() {
        let mut t = RangeHazardTracker::new();
        t.check_and_record(r(0, 10), 1, Read, true);
        t.check_and_record(r(20, 30), 2, Read, true);
        t.check_and_record(r(40, 50), 3, Read, true);
        // Spans all three: one merged entry remains.
        t.check_and_record(r(5, 45), 4, Read, true);
        assert_eq!(t.outstanding_reads(), 1);
        assert_eq!(t.check_and_record(r(0, 1), 5, Write, false), 4);
        assert_eq!(t.check_and_record(r(49, 50), 5, Write, false), 4);
    }
}
