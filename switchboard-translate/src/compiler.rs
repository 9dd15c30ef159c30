//! The row compiler: one logical row on one datapath, through parse,
//! condition evaluation, normalization, expansion and emission.

use switchboard_data::{
    mc_group_key, AddrConstant, Datapath, LogicalRow, Pipeline, RowBinding, RowId,
};
use switchboard_expr::{
    expr_to_matches, parse_actions, parse_match, symtab, AddrSetOverride, EncodeParams, Expr,
    MatchSet, PortResolver, ResidenceOracle,
};
use switchboard_flow::consts::oftable;
use switchboard_flow::{FlowAction, FlowDesc, FlowSink, MatchField};
use tracing::{debug, warn};

use crate::cache::CacheEntry;
use crate::refs::{RefKind, ResourceRefIndex};
use crate::{Ctx, Translator};

/// The capability bundle the expression expander and action encoder call
/// back into: snapshot views for name resolution, plus the reference
/// index so every consulted name is recorded against the row.
pub(crate) struct LookupPortCtx<'a> {
    pub(crate) ctx: &'a Ctx<'a>,
    pub(crate) dp: &'a Datapath,
    pub(crate) row: RowId,
    pub(crate) refs: &'a mut ResourceRefIndex,
}

impl PortResolver for LookupPortCtx<'_> {
    fn lookup_port(&mut self, name: &str) -> Option<u32> {
        if name == "none" {
            return Some(0);
        }
        // Record the name before resolving: a later binding change must
        // reprocess this row whether or not the lookup succeeds today.
        self.refs.add(RefKind::PortBinding, name, self.row, 0);
        if let Some(pb) = self.ctx.snapshot.port_binding_by_name(name) {
            if pb.datapath == self.dp.id {
                return Some(pb.tunnel_key);
            }
        }
        let mg_key = mc_group_key(name, self.dp.tunnel_key);
        self.refs.add(RefKind::McGroup, &mg_key, self.row, 0);
        self.ctx
            .snapshot
            .mc_group(self.dp.id, name)
            .map(|mg| mg.tunnel_key)
    }

    fn tunnel_ofport(&mut self, name: &str) -> Option<u32> {
        let pb = self.ctx.snapshot.port_binding_by_name(name)?;
        if pb.datapath != self.dp.id {
            return None;
        }
        let chassis = pb.chassis.as_deref()?;
        self.ctx.state.chassis_tunnels.get(chassis).copied()
    }
}

impl ResidenceOracle for LookupPortCtx<'_> {
    fn is_chassis_resident(&mut self, port: &str) -> bool {
        self.refs.add(RefKind::PortBinding, port, self.row, 0);
        let Some(pb) = self.ctx.snapshot.port_binding_by_name(port) else {
            return false;
        };
        if pb.kind != "chassisredirect" {
            pb.chassis.as_deref() == Some(self.ctx.state.chassis.as_str())
        } else {
            match &pb.ha_chassis_group {
                Some(group) if group.contains(&self.ctx.state.chassis) => {
                    group.is_active(&self.ctx.state.chassis, &self.ctx.state.active_tunnels)
                }
                _ => false,
            }
        }
    }
}

/// What the cache probe produced for this translation.
enum Probe {
    Fresh,
    Expr(Expr),
    Matches {
        base: u32,
        n_conjs: u32,
        matches: MatchSet,
    },
}

impl Translator {
    /// Translate one row on every datapath it is bound to.
    pub(crate) fn consider_logical_row(
        &mut self,
        row: &LogicalRow,
        ctx: &Ctx<'_>,
        sink: &mut dyn FlowSink,
        is_recompute: bool,
    ) {
        if !is_recompute {
            debug_assert!(!self.processed.contains(&row.id));
            self.processed.insert(row.id);
        }
        match row.binding {
            RowBinding::Datapath(dp) => self.consider_row_on_datapath(row, dp, ctx, sink),
            RowBinding::Group(group) => {
                let Some(group) = ctx.snapshot.dp_group(group) else {
                    debug!(row = %row.id, "row bound to unknown datapath group, skip");
                    return;
                };
                for dp in group.datapaths.clone() {
                    self.consider_row_on_datapath(row, dp, ctx, sink);
                }
            }
        }
    }

    pub(crate) fn consider_row_on_datapath(
        &mut self,
        row: &LogicalRow,
        dp_id: switchboard_data::DpId,
        ctx: &Ctx<'_>,
        sink: &mut dyn FlowSink,
    ) {
        let Some(dp) = ctx.snapshot.datapath(dp_id) else {
            debug!(row = %row.id, "row bound to unknown datapath, skip");
            return;
        };
        // Locality gate.
        if ctx.state.local_datapath(dp.tunnel_key) != Some(dp.id) {
            debug!(row = %row.id, dp = dp.tunnel_key, "skip row for non-local datapath");
            return;
        }

        // In/out-port gate.
        if let Some(io_port) = row.in_out_port() {
            self.refs.add(RefKind::PortBinding, io_port, row.id, 0);
            let Some(pb) = ctx.snapshot.port_binding_by_name(io_port) else {
                debug!(row = %row.id, port = io_port, "in/out port not found, skip");
                return;
            };
            if !ctx.state.is_related_port(dp.tunnel_key, pb.tunnel_key) {
                debug!(row = %row.id, port = io_port, "in/out port not local, skip");
                return;
            }
        }

        let (ptable, _) = pipeline_tables(row);

        // Action parse.
        let (program, action_prereq) = match parse_actions(&row.actions, symtab(), ctx.opts) {
            Ok(parsed) => parsed,
            Err(e) => {
                if self.limiters.actions.allow() {
                    warn!(row = %row.id, actions = %row.actions, "error parsing actions: {e}");
                }
                return;
            }
        };

        // Cache probe; a cached match set whose conjunction slice is no
        // longer available is stale and gets dropped.
        let mut probe = match self.cache.get(row.id) {
            None => Probe::Fresh,
            Some(CacheEntry::Expr { expr, .. }) => Probe::Expr(expr.clone()),
            Some(CacheEntry::Matches {
                conj_base,
                n_conjs,
                matches,
                ..
            }) => Probe::Matches {
                base: *conj_base,
                n_conjs: *n_conjs,
                matches: matches.clone(),
            },
        };
        let cached_conjs = match &probe {
            Probe::Matches { base, n_conjs, .. } => Some((*base, *n_conjs)),
            _ => None,
        };
        if let Some((base, n_conjs)) = cached_conjs {
            if n_conjs > 0 && !self.conj_ids.alloc_specified(row.id, dp.id, base, n_conjs) {
                debug!(
                    row = %row.id,
                    "cached conjunction ids no longer available, dropping cache entry"
                );
                self.cache.delete(row.id);
                probe = Probe::Fresh;
            }
        }

        let meter = self.assign_meter(row);

        let mut cached_expr: Option<Expr> = None;
        let (mut matches, base, n_conjs, from_cache) = match probe {
            Probe::Matches {
                base,
                n_conjs,
                matches,
            } => (matches, base, n_conjs, true),
            fresh_or_expr => {
                let expr = match fresh_or_expr {
                    Probe::Expr(expr) => Some(expr),
                    _ => None,
                };
                let expr = match expr {
                    Some(expr) => expr,
                    None => {
                        // Parse the match text, recording set references.
                        let parsed = match parse_match(
                            &row.match_text,
                            symtab(),
                            ctx.snapshot,
                            ctx.snapshot,
                        ) {
                            Ok(parsed) => parsed,
                            Err(e) => {
                                if self.limiters.matches.allow() {
                                    warn!(
                                        row = %row.id,
                                        match_ = %row.match_text,
                                        "error parsing match: {e}"
                                    );
                                }
                                return;
                            }
                        };
                        for (name, count) in &parsed.addr_sets {
                            self.refs.add(RefKind::AddrSet, name, row.id, *count);
                        }
                        for name in &parsed.port_groups {
                            self.refs.add(RefKind::PortGroup, name, row.id, 0);
                        }
                        let has_set_refs = parsed.has_set_refs();
                        let expr = match action_prereq.clone() {
                            Some(prereq) => Expr::And(vec![parsed.expr, prereq]).simplify(),
                            None => parsed.expr,
                        };
                        // An expression with set references must be
                        // re-expanded each cycle; never save it.
                        if self.cache.enabled() && !has_set_refs {
                            cached_expr = Some(expr.clone());
                        }
                        expr
                    }
                };

                let mut aux = LookupPortCtx {
                    ctx,
                    dp,
                    row: row.id,
                    refs: &mut self.refs,
                };
                let normalized = expr.evaluate_condition(&mut aux).normalize();
                let (matches, n_conjs) = expr_to_matches(&normalized, &mut aux);
                if matches.is_empty() {
                    debug!(row = %row.id, "row produced no matches, skip");
                    return;
                }
                let base = if n_conjs > 0 {
                    self.conj_ids.alloc(row.id, dp.id, n_conjs)
                } else {
                    0
                };
                let mut matches = matches;
                if n_conjs > 0 {
                    matches.prepare(base);
                }
                (matches, base, n_conjs, false)
            }
        };

        if matches.is_empty() {
            debug!(row = %row.id, "row produced no matches, skip");
            return;
        }

        let mut aux = LookupPortCtx {
            ctx,
            dp,
            row: row.id,
            refs: &mut self.refs,
        };
        let actions = program.encode(&encode_params(row, dp, meter), &mut aux);

        emit_matches(row, dp, &matches, ptable, &actions, meter, ctx, sink);

        // Cache write, per the placement rule: fully expanded matches
        // only for rows with no references at all, otherwise the saved
        // expression.
        if self.cache.enabled() && !from_cache {
            if let Some(cexpr) = cached_expr {
                if !self.refs.row_has_refs(row.id) {
                    let size = matches.size_estimate();
                    self.cache
                        .put_matches(row.id, base, n_conjs, std::mem::take(&mut matches), size);
                } else {
                    let size = cexpr.size_estimate();
                    self.cache.put_expr(row.id, cexpr, size);
                }
            }
        }
    }

    /// Re-translate `row` against a fake address set holding only the
    /// added constants, and emit the surviving matches on the row's
    /// existing conjunction slice. Returns false when the fast path
    /// does not apply and the caller must fall back.
    pub(crate) fn consider_row_for_added_addrs(
        &mut self,
        row: &LogicalRow,
        as_name: &str,
        ref_count: usize,
        added: &[AddrConstant],
        ctx: &Ctx<'_>,
        sink: &mut dyn FlowSink,
    ) -> bool {
        match row.binding {
            RowBinding::Datapath(dp) => {
                self.consider_added_addrs_on_dp(row, dp, as_name, ref_count, added, ctx, sink)
            }
            RowBinding::Group(group) => {
                let Some(group) = ctx.snapshot.dp_group(group) else {
                    debug!(row = %row.id, "row bound to unknown datapath group, skip");
                    return true;
                };
                group.datapaths.clone().into_iter().all(|dp| {
                    self.consider_added_addrs_on_dp(row, dp, as_name, ref_count, added, ctx, sink)
                })
            }
        }
    }

    fn consider_added_addrs_on_dp(
        &mut self,
        row: &LogicalRow,
        dp_id: switchboard_data::DpId,
        as_name: &str,
        ref_count: usize,
        added: &[AddrConstant],
        ctx: &Ctx<'_>,
        sink: &mut dyn FlowSink,
    ) -> bool {
        debug_assert!(!added.is_empty());
        let Some(dp) = ctx.snapshot.datapath(dp_id) else {
            return true;
        };
        if ctx.state.local_datapath(dp.tunnel_key) != Some(dp.id) {
            debug!(row = %row.id, dp = dp.tunnel_key, "skip row for non-local datapath");
            return true;
        }

        let (ptable, _) = pipeline_tables(row);

        let (program, action_prereq) = match parse_actions(&row.actions, symtab(), ctx.opts) {
            Ok(parsed) => parsed,
            Err(e) => {
                if self.limiters.actions.allow() {
                    warn!(row = %row.id, actions = %row.actions, "error parsing actions: {e}");
                }
                return true;
            }
        };

        // With a single added element the fake set is padded to two so
        // the expansion keeps the multi-element template; the padding's
        // matches are discarded below.
        let mut fake = added.to_vec();
        let mut dummy: Option<u128> = None;
        if added.len() == 1 {
            let pad = added[0].with_bumped_low_byte();
            dummy = Some(pad.value);
            fake.push(pad);
        }
        let overlay = AddrSetOverride {
            base: ctx.snapshot,
            name: as_name,
            addrs: &fake,
        };

        let parsed = match parse_match(&row.match_text, symtab(), &overlay, ctx.snapshot) {
            Ok(parsed) => parsed,
            Err(e) => {
                if self.limiters.matches.allow() {
                    warn!(row = %row.id, match_ = %row.match_text, "error parsing match: {e}");
                }
                return true;
            }
        };
        for (name, count) in &parsed.addr_sets {
            self.refs.add(RefKind::AddrSet, name, row.id, *count);
        }
        for name in &parsed.port_groups {
            self.refs.add(RefKind::PortGroup, name, row.id, 0);
        }
        let expr = match action_prereq {
            Some(prereq) => Expr::And(vec![parsed.expr, prereq]).simplify(),
            None => parsed.expr,
        };

        let mut aux = LookupPortCtx {
            ctx,
            dp,
            row: row.id,
            refs: &mut self.refs,
        };
        let normalized = expr.evaluate_condition(&mut aux).normalize();
        let (mut matches, n_conjs) = expr_to_matches(&normalized, &mut aux);
        if matches.is_empty() {
            debug!(row = %row.id, "row produced no matches, skip");
            return true;
        }

        // Keep only the matches attributable to the added addresses.
        matches.retain(|_, ann| match ann {
            Some(ann) => {
                ann.set == as_name && Some(ann.ip) != dummy
            }
            None => false,
        });

        if matches.len() != ref_count * added.len() {
            debug!(
                row = %row.id,
                set = as_name,
                got = matches.len(),
                expected = ref_count * added.len(),
                "address-set delta produced an unexpected match count, need reprocessing"
            );
            return false;
        }

        if n_conjs > 0 {
            let base = self.conj_ids.find(row.id, dp.id);
            if base == 0 {
                debug!(row = %row.id, "row has no conjunction slice, need reprocessing");
                return false;
            }
            matches.prepare(base);
        }

        let meter = self.assign_meter(row);
        let mut aux = LookupPortCtx {
            ctx,
            dp,
            row: row.id,
            refs: &mut self.refs,
        };
        let actions = program.encode(&encode_params(row, dp, meter), &mut aux);
        emit_matches(row, dp, &matches, ptable, &actions, meter, ctx, sink);
        true
    }

    fn assign_meter(&mut self, row: &LogicalRow) -> Option<u32> {
        let name = row.controller_meter.as_deref()?;
        match self.meters.assign(name) {
            Some(id) => Some(id),
            None => {
                if self.limiters.meters.allow() {
                    warn!(row = %row.id, meter = name, "unable to assign id for meter");
                }
                None
            }
        }
    }
}

fn pipeline_tables(row: &LogicalRow) -> (u8, u8) {
    match row.pipeline {
        Pipeline::Ingress => (
            oftable::LOG_INGRESS_PIPELINE + row.table_id,
            oftable::REMOTE_OUTPUT,
        ),
        Pipeline::Egress => (
            oftable::LOG_EGRESS_PIPELINE + row.table_id,
            oftable::SAVE_INPORT,
        ),
    }
}

fn encode_params(row: &LogicalRow, dp: &Datapath, meter: Option<u32>) -> EncodeParams {
    EncodeParams {
        pipeline: row.pipeline,
        ingress_ptable: oftable::LOG_INGRESS_PIPELINE,
        egress_ptable: oftable::LOG_EGRESS_PIPELINE,
        output_ptable: match row.pipeline {
            Pipeline::Ingress => oftable::REMOTE_OUTPUT,
            Pipeline::Egress => oftable::SAVE_INPORT,
        },
        cur_table: row.table_id,
        is_switch: dp.is_switch,
        use_snat_zone: dp.external_ids.contains_key("snat-ct-zone"),
        meter,
    }
}

#[allow(clippy::too_many_arguments)]
fn emit_matches(
    row: &LogicalRow,
    dp: &Datapath,
    matches: &MatchSet,
    ptable: u8,
    actions: &[FlowAction],
    meter: Option<u32>,
    ctx: &Ctx<'_>,
    sink: &mut dyn FlowSink,
) {
    let pinned_port_field = match row.pipeline {
        Pipeline::Ingress => MatchField::LogInport,
        Pipeline::Egress => MatchField::LogOutport,
    };
    for entry in matches.iter() {
        let mut m = entry.match_.clone();
        m.set(MatchField::Metadata, dp.tunnel_key as u128);

        // On a switch a match pinning a logical port only applies when
        // that port is related to this chassis.
        if dp.is_switch {
            if let Some(port) = m.exact_value(pinned_port_field) {
                if port != 0 && !ctx.state.is_related_port(dp.tunnel_key, port as u32) {
                    debug!(row = %row.id, port, "port in match is not local, skip");
                    continue;
                }
            }
        }

        if entry.conjunctions.is_empty() {
            sink.add_flow(
                row.id.into(),
                FlowDesc {
                    table: ptable,
                    priority: row.priority,
                    cookie: row.id.cookie(),
                    match_: m,
                    actions: actions.to_vec(),
                    meter,
                    annotation: entry.annotation.clone(),
                },
            );
        } else {
            let conj_actions: Vec<FlowAction> = entry
                .conjunctions
                .iter()
                .map(|c| FlowAction::Conjunction {
                    id: c.id,
                    clause: c.clause,
                    n_clauses: c.n_clauses,
                })
                .collect();
            sink.add_or_append_flow(
                row.id.into(),
                FlowDesc {
                    table: ptable,
                    priority: row.priority,
                    cookie: 0,
                    match_: m,
                    actions: conj_actions,
                    meter,
                    annotation: entry.annotation.clone(),
                },
            );
        }
    }
}
