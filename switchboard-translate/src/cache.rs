//! The translation cache.
//!
//! Per row identity, at most one cached artifact in one of two states:
//! a simplified-but-unexpanded expression tree, or the fully expanded
//! match set together with the conjunction-id slice it was produced
//! with. Which state a row may cache is the compiler's decision (see the
//! placement rule there); this module only stores, bounds and evicts.
//!
//! Eviction is a size-bounded LRU: an entry count cap from the LRU
//! structure itself plus an explicit byte budget over the entries'
//! estimated sizes.

use std::num::NonZeroUsize;

use lru::LruCache;
use switchboard_data::RowId;
use switchboard_expr::{Expr, MatchSet};
use tracing::debug;

/// A cached per-row artifact.
#[derive(Clone, Debug)]
pub enum CacheEntry {
    /// Simplified expression tree; conditions not yet evaluated, not
    /// normalized.
    Expr { expr: Expr, size: usize },
    /// Fully expanded matches plus the conjunction slice recorded when
    /// they were produced.
    Matches {
        conj_base: u32,
        n_conjs: u32,
        matches: MatchSet,
        size: usize,
    },
}

impl CacheEntry {
    fn size(&self) -> usize {
        match self {
            CacheEntry::Expr { size, .. } | CacheEntry::Matches { size, .. } => *size,
        }
    }
}

pub struct TranslationCache {
    entries: LruCache<RowId, CacheEntry>,
    enabled: bool,
    byte_budget: usize,
    bytes_used: usize,
}

impl std::fmt::Debug for TranslationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslationCache")
            .field("entries", &self.entries.len())
            .field("enabled", &self.enabled)
            .field("byte_budget", &self.byte_budget)
            .field("bytes_used", &self.bytes_used)
            .finish()
    }
}

pub const DEFAULT_CACHE_ENTRIES: usize = 128 * 1024;
pub const DEFAULT_CACHE_BYTES: usize = 32 * 1024 * 1024;

impl Default for TranslationCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_ENTRIES, DEFAULT_CACHE_BYTES)
    }
}

impl TranslationCache {
    pub fn new(max_entries: usize, byte_budget: usize) -> Self {
        TranslationCache {
            entries: LruCache::new(
                NonZeroUsize::new(max_entries.max(1)).expect("cache capacity is not zero"),
            ),
            enabled: true,
            byte_budget,
            bytes_used: 0,
        }
    }

    /// A cache that stores nothing.
    pub fn disabled() -> Self {
        let mut c = Self::new(1, 0);
        c.enabled = false;
        c
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Disabling drops all entries.
    pub fn set_enabled(&mut self, enabled: bool) {
        if !enabled {
            self.entries.clear();
            self.bytes_used = 0;
        }
        self.enabled = enabled;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&mut self, row: RowId) -> Option<&CacheEntry> {
        if !self.enabled {
            return None;
        }
        self.entries.get(&row)
    }

    pub fn put_expr(&mut self, row: RowId, expr: Expr, size: usize) {
        self.put(row, CacheEntry::Expr { expr, size });
    }

    pub fn put_matches(
        &mut self,
        row: RowId,
        conj_base: u32,
        n_conjs: u32,
        matches: MatchSet,
        size: usize,
    ) {
        self.put(
            row,
            CacheEntry::Matches {
                conj_base,
                n_conjs,
                matches,
                size,
            },
        );
    }

    pub fn delete(&mut self, row: RowId) {
        if let Some(old) = self.entries.pop(&row) {
            self.bytes_used -= old.size();
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.bytes_used = 0;
    }

    fn put(&mut self, row: RowId, entry: CacheEntry) {
        if !self.enabled {
            return;
        }
        let size = entry.size();
        if size > self.byte_budget {
            debug!(%row, size, "translation artifact larger than the cache budget");
            self.delete(row);
            return;
        }
        self.delete(row);
        if let Some((_, evicted)) = self.entries.push(row, entry) {
            self.bytes_used -= evicted.size();
        }
        self.bytes_used += size;
        while self.bytes_used > self.byte_budget {
            match self.entries.pop_lru() {
                Some((_, evicted)) => self.bytes_used -= evicted.size(),
                None => break,
            }
        }
    }
}
