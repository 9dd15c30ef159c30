//! The conjunction-id allocator.
//!
//! Conjunctive matches label their clauses with small integers drawn
//! from the 32-bit space `[1, 2^32)`; id 0 means "no conjunction". Each
//! (row, datapath) pair owns at most one contiguous slice at a time, and
//! a slice stays owned until the row's flows are removed — the
//! translation cache relies on being able to re-claim the exact slice it
//! recorded.
//!
//! # Invariants
//!
//! * Allocated slices never overlap.
//! * Every allocated slice is owned by exactly one (row, datapath).

use std::collections::{BTreeMap, HashMap};

use switchboard_data::{DpId, RowId};

#[derive(Debug, Default)]
pub struct ConjIdAllocator {
    /// base → length, non-overlapping.
    allocated: BTreeMap<u32, u32>,
    owners: HashMap<(RowId, DpId), (u32, u32), ahash::RandomState>,
    /// First-fit search position; advances so freed low ranges are not
    /// immediately thrashed.
    cursor: u32,
}

impl ConjIdAllocator {
    pub fn new() -> Self {
        ConjIdAllocator {
            cursor: 1,
            ..Default::default()
        }
    }

    /// Allocate `n` contiguous ids for `(row, dp)`, replacing any slice
    /// that pair already owns.
    ///
    /// # Panics
    ///
    /// Panics when the 32-bit space is exhausted. With one slice per
    /// (row, datapath) this cannot happen under sane inputs.
    pub fn alloc(&mut self, row: RowId, dp: DpId, n: u32) -> u32 {
        assert!(n > 0);
        self.free_owned(row, dp);
        let base = self
            .find_free(self.cursor.max(1), n)
            .or_else(|| self.find_free(1, n))
            .unwrap_or_else(|| panic!("32-bit conjunction id space exhausted"));
        self.cursor = base.saturating_add(n).max(1);
        self.insert(row, dp, base, n);
        base
    }

    /// Claim exactly `[base, base + n)` for `(row, dp)`. Succeeds iff
    /// the slice is free and the pair owns nothing else.
    pub fn alloc_specified(&mut self, row: RowId, dp: DpId, base: u32, n: u32) -> bool {
        if n == 0 || base == 0 || u32::MAX - n < base {
            return false;
        }
        if self.owners.contains_key(&(row, dp)) {
            return false;
        }
        if !self.range_free(base, n) {
            return false;
        }
        self.insert(row, dp, base, n);
        true
    }

    /// The base currently allocated to `(row, dp)`, or 0.
    pub fn find(&self, row: RowId, dp: DpId) -> u32 {
        self.owners.get(&(row, dp)).map(|(b, _)| *b).unwrap_or(0)
    }

    /// Release every slice owned by `row`, on any datapath.
    pub fn free(&mut self, row: RowId) {
        let keys: Vec<(RowId, DpId)> = self
            .owners
            .keys()
            .filter(|(r, _)| *r == row)
            .copied()
            .collect();
        for key in keys {
            let (base, _) = self.owners.remove(&key).unwrap();
            self.allocated.remove(&base);
        }
    }

    pub fn clear(&mut self) {
        self.allocated.clear();
        self.owners.clear();
        self.cursor = 1;
    }

    fn free_owned(&mut self, row: RowId, dp: DpId) {
        if let Some((base, _)) = self.owners.remove(&(row, dp)) {
            self.allocated.remove(&base);
        }
    }

    fn insert(&mut self, row: RowId, dp: DpId, base: u32, n: u32) {
        self.allocated.insert(base, n);
        self.owners.insert((row, dp), (base, n));
    }

    fn range_free(&self, base: u32, n: u32) -> bool {
        let end = base as u64 + n as u64;
        // A predecessor reaching into [base, end) or a successor
        // starting inside it means overlap.
        if let Some((pb, pn)) = self.allocated.range(..=base).next_back() {
            if *pb as u64 + *pn as u64 > base as u64 {
                return false;
            }
        }
        if let Some((sb, _)) = self.allocated.range(base..).next() {
            if (*sb as u64) < end {
                return false;
            }
        }
        true
    }

    /// First-fit search for `n` free ids at or after `from`.
    fn find_free(&self, from: u32, n: u32) -> Option<u32> {
        let mut candidate = from.max(1) as u64;
        loop {
            if candidate + n as u64 > u32::MAX as u64 + 1 {
                return None;
            }
            let c32 = candidate as u32;
            // A predecessor reaching past the candidate pushes it
            // forward.
            if let Some((pb, pn)) = self.allocated.range(..=c32).next_back() {
                let pend = *pb as u64 + *pn as u64;
                if pend > candidate {
                    candidate = pend;
                    continue;
                }
            }
            // A successor starting inside [candidate, candidate + n)
            // does too.
            if let Some((sb, sn)) = self.allocated.range(c32..).next() {
                if (*sb as u64) < candidate + n as u64 {
                    candidate = *sb as u64 + *sn as u64;
                    continue;
                }
            }
            return Some(candidate as u32);
        }
    }
}
