//! The incremental logical-flow translator.
//!
//! [`Translator`] owns the background structures that survive across
//! translation cycles — the resource-reference index, the conjunction-id
//! allocator, the translation cache and the id assignments — and exposes
//! the delta engine: a full rebuild plus one handler per kind of tracked
//! input change. Handlers return a *handled* flag; `false` means the
//! change could not be applied incrementally and the caller must fall
//! back to a full recompute next cycle.
//!
//! All operations are sequenced by the caller on one thread; nothing
//! here is internally concurrent.

use std::collections::HashSet;

use switchboard_data::{
    mc_group_key, AddrSetDiff, Datapath, LoadBalancer, LocalState, LogicalRow, MulticastGroup,
    OptionBags, OwnerId, PortBinding, RowId, Snapshot, Tracked,
};
use switchboard_flow::{AddrSetAnnotation, FlowSink};
use tracing::debug;

pub mod cache;
mod compiler;
pub mod conj_ids;
mod hairpin;
pub mod meters;
mod neighbor;
mod port_sec;
pub mod ratelimit;
pub mod refs;

pub use cache::{CacheEntry, TranslationCache};
pub use conj_ids::ConjIdAllocator;
pub use meters::MeterTable;
pub use refs::{RefKind, ResourceRefIndex};

use hairpin::HairpinIdPool;
use ratelimit::LogLimiter;

/// The per-cycle input bundle: a consistent snapshot of the tables, the
/// chassis runtime state and the option bags.
#[derive(Clone, Copy)]
pub struct Ctx<'a> {
    pub snapshot: &'a Snapshot,
    pub state: &'a LocalState,
    pub opts: &'a OptionBags,
}

#[derive(Debug, Default)]
pub(crate) struct Limiters {
    pub(crate) actions: LogLimiter,
    pub(crate) matches: LogLimiter,
    pub(crate) meters: LogLimiter,
    pub(crate) addrs: LogLimiter,
    pub(crate) neighbor: LogLimiter,
    pub(crate) port_sec: LogLimiter,
}

/// The translator: persistent background state plus the delta engine.
#[derive(Debug)]
pub struct Translator {
    pub(crate) refs: ResourceRefIndex,
    pub(crate) conj_ids: ConjIdAllocator,
    pub(crate) cache: TranslationCache,
    pub(crate) meters: MeterTable,
    pub(crate) hairpin_ids: HairpinIdPool,
    /// Rows already translated this cycle; makes the change handlers
    /// idempotent within one cycle.
    pub(crate) processed: HashSet<RowId>,
    pub(crate) limiters: Limiters,
}

impl Default for Translator {
    fn default() -> Self {
        Self::new()
    }
}

impl Translator {
    pub fn new() -> Self {
        Self::with_cache(TranslationCache::default())
    }

    pub fn with_cache(cache: TranslationCache) -> Self {
        Translator {
            refs: ResourceRefIndex::new(),
            conj_ids: ConjIdAllocator::new(),
            cache,
            meters: MeterTable::default(),
            hairpin_ids: HairpinIdPool::default(),
            processed: HashSet::new(),
            limiters: Limiters::default(),
        }
    }

    pub fn refs(&self) -> &ResourceRefIndex {
        &self.refs
    }

    pub fn conj_ids(&self) -> &ConjIdAllocator {
        &self.conj_ids
    }

    pub fn cache(&self) -> &TranslationCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut TranslationCache {
        &mut self.cache
    }

    /// Forget which rows this cycle already translated. Call between
    /// cycles, after tracked changes have been applied.
    pub fn clear_processed_rows(&mut self) {
        self.processed.clear();
    }

    /// Translate everything from scratch into `sink` (which the caller
    /// supplies empty on a recompute). Background state is reset; the
    /// translation cache survives and is revalidated entry by entry.
    pub fn run_full(&mut self, ctx: &Ctx<'_>, sink: &mut dyn FlowSink) {
        self.refs.clear();
        self.conj_ids.clear();
        for row in ctx.snapshot.rows() {
            self.consider_logical_row(row, ctx, sink, true);
        }
        self.add_neighbor_flows(ctx, sink);
        self.add_lb_hairpin_flows(ctx, sink);
        self.add_fdb_flows(ctx, sink);
        self.add_port_sec_flows(ctx, sink);
    }

    /// Replay the tracked logical rows: flood-remove their flows (and
    /// the flows of every row sharing one), then re-translate whatever
    /// still exists in the input.
    pub fn handle_changed_rows(
        &mut self,
        tracked: &[Tracked<LogicalRow>],
        ctx: &Ctx<'_>,
        sink: &mut dyn FlowSink,
    ) -> bool {
        let mut flood: HashSet<OwnerId> = HashSet::new();
        for t in tracked {
            if self.processed.contains(&t.item.id) {
                debug!(row = %t.item.id, "row already processed this cycle, skip");
                continue;
            }
            debug!(row = %t.item.id, "delete row");
            flood.insert(t.item.id.into());
            if !t.is_new() {
                self.cache.delete(t.item.id);
            }
        }
        self.replay_flooded(flood, ctx, sink);
        true
    }

    /// Replay every row referencing `(kind, name)`. Returns true with no
    /// effect when nothing references it.
    pub fn handle_changed_ref(
        &mut self,
        kind: RefKind,
        name: &str,
        ctx: &Ctx<'_>,
        sink: &mut dyn FlowSink,
    ) -> bool {
        let todo: Vec<RowId> = self
            .refs
            .rows_for(kind, name)
            .map(|(row, _)| row)
            .filter(|row| !self.processed.contains(row))
            .collect();
        if todo.is_empty() {
            return true;
        }
        debug!(?kind, name, n = todo.len(), "replaying rows for changed reference");
        let flood: HashSet<OwnerId> = todo.into_iter().map(OwnerId::from).collect();
        self.replay_flooded(flood, ctx, sink);
        true
    }

    /// Flood-remove the given owners and re-translate every affected
    /// row that still exists.
    fn replay_flooded(
        &mut self,
        mut flood: HashSet<OwnerId>,
        ctx: &Ctx<'_>,
        sink: &mut dyn FlowSink,
    ) {
        if flood.is_empty() {
            return;
        }
        sink.flood_remove(&mut flood);
        for owner in &flood {
            let row_id = RowId::from(*owner);
            self.refs.forget_row(row_id);
            self.conj_ids.free(row_id);
            if let Some(row) = ctx.snapshot.row(row_id) {
                debug!(row = %row_id, "re-adding row");
                // Rows dragged in by the flood may have been processed
                // earlier this cycle; they are being reprocessed now.
                self.processed.remove(&row_id);
                self.consider_logical_row(row, ctx, sink, false);
            }
        }
    }

    /// The address-set fast path: apply `diff` for set `name` without
    /// re-parsing the referencing rows. Returns false when the caller
    /// must fall back to a full reprocess of those rows.
    pub fn handle_addr_set_update(
        &mut self,
        name: &str,
        diff: &AddrSetDiff,
        ctx: &Ctx<'_>,
        sink: &mut dyn FlowSink,
    ) -> bool {
        debug_assert!(!diff.added.is_empty() || !diff.deleted.is_empty());
        let Some(current) = ctx.snapshot.addr_set(name) else {
            debug!(set = name, "updated address set missing from snapshot");
            return false;
        };
        let new_size = current.len();
        let old_size = (new_size + diff.deleted.len()).saturating_sub(diff.added.len());

        // A set at size 0 or 1 compiles to a different match template;
        // and a diff as large as the set is cheaper to reprocess.
        if old_size <= 1 || new_size <= 1 {
            return false;
        }
        if diff.added.len() + diff.deleted.len() >= new_size {
            return false;
        }

        let referencing: Vec<(RowId, usize)> = self.refs.rows_for(RefKind::AddrSet, name).collect();
        for (row_id, ref_count) in referencing {
            if self.processed.contains(&row_id) {
                debug!(row = %row_id, "row already processed this cycle, skip");
                continue;
            }
            let Some(row) = ctx.snapshot.row(row_id) else {
                // Deletions are handled by the row-change handler.
                debug!(row = %row_id, set = name, "row not found, skip");
                continue;
            };
            for c in &diff.deleted {
                let annotation = AddrSetAnnotation {
                    set: name.to_string(),
                    ip: c.value,
                    mask: c.effective_mask(),
                };
                if !sink.remove_flows_for_addr_set_ip(row_id.into(), &annotation, ref_count) {
                    if self.limiters.addrs.allow() {
                        debug!(
                            row = %row_id,
                            set = name,
                            "deleted address removal mismatch, need reprocessing"
                        );
                    }
                    return false;
                }
            }
            if !diff.added.is_empty()
                && !self.consider_row_for_added_addrs(
                    row,
                    name,
                    ref_count,
                    &diff.added,
                    ctx,
                    sink,
                )
            {
                return false;
            }
        }
        true
    }

    /// Port-binding creations and deletions: replay the rows that named
    /// the port.
    pub fn handle_changed_port_bindings(
        &mut self,
        tracked: &[Tracked<PortBinding>],
        ctx: &Ctx<'_>,
        sink: &mut dyn FlowSink,
    ) -> bool {
        for t in tracked {
            if !t.is_new() && !t.is_deleted() {
                continue;
            }
            if !self.handle_changed_ref(RefKind::PortBinding, &t.item.name, ctx, sink) {
                return false;
            }
        }
        true
    }

    /// A port binding whose residence on this chassis may have changed:
    /// replay the rows referencing it, then reprogram its port-security
    /// flows.
    pub fn handle_flows_for_lport(
        &mut self,
        pb: &PortBinding,
        ctx: &Ctx<'_>,
        sink: &mut dyn FlowSink,
    ) -> bool {
        if !self.handle_changed_ref(RefKind::PortBinding, &pb.name, ctx, sink) {
            return false;
        }
        // All flows keyed on the binding's own identity are the
        // port-security ones.
        sink.remove_flows(pb.id);
        if !pb.port_security.is_empty() && ctx.state.bound_lports.contains(&pb.name) {
            self.consider_port_sec_flows(pb, ctx, sink);
        }
        true
    }

    /// Multicast-group creations and deletions.
    pub fn handle_changed_mc_groups(
        &mut self,
        tracked: &[Tracked<MulticastGroup>],
        ctx: &Ctx<'_>,
        sink: &mut dyn FlowSink,
    ) -> bool {
        for t in tracked {
            if !t.is_new() && !t.is_deleted() {
                continue;
            }
            let Some(dp) = ctx.snapshot.datapath(t.item.datapath) else {
                debug!(group = %t.item.name, "multicast group on unknown datapath, skip");
                continue;
            };
            let key = mc_group_key(&t.item.name, dp.tunnel_key);
            if !self.handle_changed_ref(RefKind::McGroup, &key, ctx, sink) {
                return false;
            }
        }
        true
    }

    /// Purge cache entries of deleted rows. Call before tracked changes
    /// are cleared so the cache never outlives its row.
    pub fn handle_cached_rows(&mut self, tracked: &[Tracked<LogicalRow>]) {
        for t in tracked {
            if t.is_deleted() {
                self.cache.delete(t.item.id);
            }
        }
    }

    /// A datapath became local: translate everything bound to it,
    /// without a flood-remove. Rows translated for one group member only
    /// are not marked processed (their group translation is
    /// incomplete).
    pub fn add_flows_for_datapath(
        &mut self,
        dp: &Datapath,
        lbs: &[&LoadBalancer],
        ctx: &Ctx<'_>,
        sink: &mut dyn FlowSink,
    ) -> bool {
        for row in ctx.snapshot.rows_for_datapath(dp.id) {
            if self.processed.contains(&row.id) {
                continue;
            }
            self.processed.insert(row.id);
            self.consider_row_on_datapath(row, dp.id, ctx, sink);
        }
        for row in ctx.snapshot.rows_for_group_member(dp.id) {
            if self.processed.contains(&row.id) {
                continue;
            }
            self.consider_row_on_datapath(row, dp.id, ctx, sink);
        }

        for fdb in ctx.snapshot.fdbs_for_dp_key(dp.tunnel_key) {
            self.consider_fdb_flows(fdb, ctx, sink);
        }
        for mb in ctx.snapshot.mac_bindings_for_datapath(dp.id) {
            self.consider_dynamic_neighbor(mb, ctx, sink);
        }
        for smb in ctx.snapshot.static_mac_bindings_for_datapath(dp.id) {
            self.consider_static_neighbor(smb, ctx, sink);
        }
        for lb in lbs {
            self.consider_lb_hairpin_flows(lb, ctx, sink);
        }
        true
    }
}
