//! C6: the analyzer. Walks the graph once, in reverse postorder, deciding
//! what can be scalar-replaced and queuing the edits that do it (C5), while
//! C2–C4 track the bookkeeping that makes those decisions sound.
//!
//! Loops are refused outright (§5/§9): the moment a block has a
//! not-yet-visited predecessor, analysis stops and reports nothing found,
//! rather than attempting any kind of fixed-point iteration.

use crate::allocation::AllocationTracker;
use crate::bbstate::{allocation_tracked, BbStateTable};
use crate::error::PeaError;
use crate::facts::ShadowFactsTable;
use crate::host::{BigIntOp, Host, OpFamily, OpInfo, Operand};
use crate::ids::{AllocId, HypReg, RegKind};
use crate::repr::AttrKind;
use crate::transform::{MaterializationTarget, TransformKind, TransformLedger};
use std::collections::{HashSet, VecDeque};
use std::rc::Rc;

pub struct Analyzer<H: Host> {
    pub tracker: AllocationTracker<H>,
    pub facts: ShadowFactsTable<H>,
    pub bb_states: BbStateTable<H>,
    pub ledger: TransformLedger<H>,
}

pub enum AnalyzeOutcome<H: Host> {
    /// A not-yet-visited predecessor was found; analysis gave up without
    /// looking at the rest of the graph.
    LoopDetected,
    Done { analyzer: Analyzer<H>, found_replaceable: bool },
}

enum BigintArity {
    Binary,
    Unary,
    Relational,
}

/// §4.6/§4.7: walks backward from `use_bb` toward `alloc_bb` through
/// predecessors. Reaching `alloc_bb` means the use sits on a straight-line
/// path from the allocator (not worth materializing on that evidence
/// alone); falling off the graph (exhausting predecessors without ever
/// reaching it) means the use is reachable from some other branch, and
/// defaults to "yes, worth materializing".
fn in_branch<H: Host>(host: &H, alloc_bb: H::Block, use_bb: H::Block) -> bool {
    if alloc_bb == use_bb {
        return false;
    }
    let mut visited: HashSet<H::Block> = HashSet::new();
    let mut queue: VecDeque<H::Block> = VecDeque::new();
    queue.push_back(use_bb);
    visited.insert(use_bb);
    while let Some(block) = queue.pop_front() {
        if block == alloc_bb {
            return false;
        }
        for pred in host.predecessors(block) {
            if visited.insert(pred) {
                queue.push_back(pred);
            }
        }
    }
    true
}

fn worth_materializing<H: Host>(host: &H, tracker: &AllocationTracker<H>, id: AllocId, use_bb: H::Block) -> bool {
    let rec = tracker.get(id);
    if rec.read || rec.bigint {
        return true;
    }
    in_branch(host, rec.allocator_bb, use_bb)
}

/// §4.5: a materialization must never be spliced into the middle of a call's
/// argument-preparation sequence. Walks back from the demanding instruction
/// while it (and whatever precedes it) is itself an `arg_*`/`argconst_*`
/// opcode, landing on the first instruction of that run.
fn materialize_anchor<H: Host>(host: &H, block: H::Block, ins_list: &[H::Ins], idx: usize) -> Result<H::Ins, PeaError> {
    let mut anchor_idx = idx;
    loop {
        let info = host.op_info(block, ins_list[anchor_idx])?;
        if info.is_arg_prep() && anchor_idx > 0 {
            anchor_idx -= 1;
        } else {
            break;
        }
    }
    Ok(ins_list[anchor_idx])
}

impl<H: Host> Analyzer<H> {
    /// §4.3/§4.9. Runs the whole analysis; `LoopDetected` and
    /// `Done { found_replaceable: false, .. }` are both "nothing to do"
    /// outcomes, not errors.
    pub fn analyze(host: &mut H) -> Result<AnalyzeOutcome<H>, PeaError> {
        let rpo = host.reverse_postorder();
        let mut seen_blocks: HashSet<H::Block> = HashSet::new();
        let mut an = Analyzer {
            tracker: AllocationTracker::new(),
            facts: ShadowFactsTable::new(),
            bb_states: BbStateTable::new(),
            ledger: TransformLedger::new(),
        };
        let mut found_replaceable = false;

        for &block in &rpo {
            let preds = host.predecessors(block);
            if preds.iter().any(|p| !seen_blocks.contains(p)) {
                #[cfg(feature = "diagnostic-log")]
                tracing::trace!(?block, "partial escape analysis does not support loops, stopping");
                return Ok(AnalyzeOutcome::LoopDetected);
            }
            an.bb_states.setup_block(&mut an.tracker, block, &preds);

            let ins_list = host.instructions(block);
            for idx in 0..ins_list.len() {
                let ins = ins_list[idx];
                let info = host.op_info(block, ins)?;
                an.analyze_instruction(host, block, &ins_list, idx, ins, &info, &mut found_replaceable)?;
            }
            seen_blocks.insert(block);
        }

        Ok(AnalyzeOutcome::Done { analyzer: an, found_replaceable })
    }

    #[allow(clippy::too_many_arguments)]
    fn analyze_instruction(
        &mut self,
        host: &mut H,
        block: H::Block,
        ins_list: &[H::Ins],
        idx: usize,
        ins: H::Ins,
        info: &OpInfo<H::Reg, H::Type>,
        found_replaceable: &mut bool,
    ) -> Result<(), PeaError> {
        match info.family {
            OpFamily::FastCreate => {
                let ty = info
                    .alloc_type
                    .ok_or_else(|| PeaError::IrInvariantViolated { detail: "allocator missing its allocated type".into() })?;
                let dest = info
                    .writes
                    .ok_or_else(|| PeaError::IrInvariantViolated { detail: "allocator missing its destination".into() })?;
                if let Some(id) = self.tracker.try_track(host, ins, block, ty) {
                    self.facts.track_register(dest.reg, dest.version, id);
                    self.bb_states.track_new(block, self.tracker.get(id).num_attrs());
                    *found_replaceable = true;
                }
                return Ok(());
            }
            OpFamily::MaterializeBi => {
                let ty = info
                    .alloc_type
                    .ok_or_else(|| PeaError::IrInvariantViolated { detail: "allocator missing its allocated type".into() })?;
                let dest = info
                    .writes
                    .ok_or_else(|| PeaError::IrInvariantViolated { detail: "allocator missing its destination".into() })?;
                let unboxed = info.reads.first().copied().ok_or_else(|| PeaError::IrInvariantViolated {
                    detail: "materialize_bi missing its unboxed source operand".into(),
                })?;
                if let Some(id) = self.tracker.try_track(host, ins, block, ty) {
                    self.facts.track_register(dest.reg, dest.version, id);
                    self.bb_states.track_new(block, self.tracker.get(id).num_attrs());
                    // §4.5/§4.7: this allocator already produced a boxed
                    // bigint from an unboxed source; if the box is never
                    // forced real, that source must still end up in the
                    // attribute's register, so queue the conversion
                    // unconditionally rather than leaving it to the final
                    // cleanup pass (which would otherwise just delete the
                    // instruction and lose the value).
                    let hyp_reg = self.tracker.get(id).hyp_attr_regs[0];
                    self.tracker.get_mut(id).unmaterialize_bi_queued = true;
                    self.ledger.push(block, Some(id), TransformKind::UnmaterializeBi { ins, hyp_reg, unboxed });
                    *found_replaceable = true;
                }
                return Ok(());
            }
            OpFamily::AliasMove => {
                if let (Some(src), Some(dst)) = (info.reads.first().copied(), info.writes) {
                    self.facts.alias(src.reg, src.version, dst.reg, dst.version);
                    if let Some(id) = self.facts.allocation_of(src.reg, src.version) {
                        if allocation_tracked(&self.tracker, self.bb_states.state(block), id) {
                            self.ledger.push(block, Some(id), TransformKind::DeleteSet { ins });
                        }
                    }
                }
                return Ok(());
            }
            OpFamily::GetAttr(kind) => {
                if self.try_rewrite_getattr(host, block, ins, info, kind)? {
                    return Ok(());
                }
            }
            OpFamily::BindAttr(kind) => {
                if self.try_rewrite_bindattr(host, block, ins, info, kind)? {
                    return Ok(());
                }
            }
            OpFamily::VivifyingGet { kind, concrete } => {
                if self.try_rewrite_vivifying_get(host, block, ins, info, kind, concrete)? {
                    return Ok(());
                }
            }
            OpFamily::GuardConc => {
                if self.try_settify_guard(host, block, ins, info)? {
                    return Ok(());
                }
            }
            OpFamily::ProfAllocated => {
                if let Some(obj) = info.object_operand.or_else(|| info.reads.first().copied()) {
                    if let Some(id) = self.facts.allocation_of(obj.reg, obj.version) {
                        if allocation_tracked(&self.tracker, self.bb_states.state(block), id) {
                            self.ledger.push(block, Some(id), TransformKind::ProfAllocated { ins });
                            return Ok(());
                        }
                    }
                }
            }
            OpFamily::BigIntBinary(op) => {
                if self.try_decompose_bigint(block, ins, info, op, BigintArity::Binary)? {
                    *found_replaceable = true;
                    return Ok(());
                }
            }
            OpFamily::BigIntUnary(op) => {
                if self.try_decompose_bigint(block, ins, info, op, BigintArity::Unary)? {
                    *found_replaceable = true;
                    return Ok(());
                }
            }
            OpFamily::BigIntRelational(op) => {
                if self.try_decompose_bigint(block, ins, info, op, BigintArity::Relational)? {
                    return Ok(());
                }
            }
            OpFamily::DecontI => {
                if self.try_rewrite_decont_i(block, ins, info)? {
                    return Ok(());
                }
            }
            OpFamily::Phi | OpFamily::ArgPrep | OpFamily::Other => {}
        }

        // Fallback: anything read here that still aliases a tracked,
        // replaceable allocation is an escaping use this pass doesn't
        // specifically understand. A `may_deopt` instruction only needs a
        // deopt-safe materialization recipe for it; anything else forces a
        // real object into existence right here, worth-materializing
        // permitting.
        if info.may_deopt {
            if let Some(deopt_idx) = info.deopt_idx {
                for live in host.live_at_deopt(deopt_idx) {
                    let Some(id) = self.facts.allocation_of(live.reg, live.version) else { continue };
                    if !allocation_tracked(&self.tracker, self.bb_states.state(block), id) {
                        continue;
                    }
                    host.usages_add_deopt(live, deopt_idx);
                    self.ledger.push(block, Some(id), TransformKind::AddDeoptPoint { deopt_idx, allocation: id, target: live });
                }
            }
            return Ok(());
        }

        for read_idx in 0..info.reads.len() {
            let read = info.reads[read_idx];
            let Some(id) = self.facts.allocation_of(read.reg, read.version) else { continue };
            if !allocation_tracked(&self.tracker, self.bb_states.state(block), id) {
                continue;
            }
            if !worth_materializing(host, &self.tracker, id, block) {
                // Not worth it on current evidence; leave it tracked. A
                // later, stricter use elsewhere will still catch it.
                continue;
            }
            self.queue_materialize(host, block, ins_list, idx, id, MaterializationTarget::Concrete(read))?;
        }
        Ok(())
    }

    fn try_rewrite_getattr(
        &mut self,
        host: &H,
        block: H::Block,
        ins: H::Ins,
        info: &OpInfo<H::Reg, H::Type>,
        kind: AttrKind,
    ) -> Result<bool, PeaError> {
        let Some(obj) = info.object_operand else { return Ok(false) };
        let Some(id) = self.facts.allocation_of(obj.reg, obj.version) else { return Ok(false) };
        if !allocation_tracked(&self.tracker, self.bb_states.state(block), id) {
            return Ok(false);
        }
        let Some(offset) = info.attr_offset else { return Ok(false) };
        let Some(attr_index) = host.attr_index(self.tracker.get(id).ty, offset) else { return Ok(false) };
        if attr_index >= self.tracker.get(id).attr_kinds.len()
            || self.tracker.get(id).attr_kinds[attr_index].reg_kind() != kind.reg_kind()
        {
            return Ok(false);
        }
        if !self.bb_states.state(block).map_or(false, |s| s.is_used(id, attr_index)) {
            // Never written on every path reaching here: reading it would
            // observe a representation-defined default this pass doesn't
            // model. Force a real object instead.
            return Ok(false);
        }
        let dest = info
            .writes
            .ok_or_else(|| PeaError::IrInvariantViolated { detail: "attribute read missing its destination".into() })?;
        let hyp_reg = self.tracker.get(id).hyp_attr_regs[attr_index];
        self.tracker.get_mut(id).read = true;
        self.ledger.push(block, Some(id), TransformKind::GetattrToSet { ins, dest, hyp_reg });
        Ok(true)
    }

    /// §4.5: an auto-vivifying attribute read (`sp_getvt_o`/`sp_getvc_o` and
    /// friends). If the attribute was already written on every path
    /// reaching here, this is an ordinary read, same as `GETATTR_TO_SET`.
    /// Otherwise it's the first read of that attribute: rather than forcing
    /// a real object just to vivify its default, conjure the default
    /// straight into the attribute's own register.
    fn try_rewrite_vivifying_get(
        &mut self,
        host: &H,
        block: H::Block,
        ins: H::Ins,
        info: &OpInfo<H::Reg, H::Type>,
        kind: AttrKind,
        concrete: bool,
    ) -> Result<bool, PeaError> {
        let Some(obj) = info.object_operand else { return Ok(false) };
        let Some(id) = self.facts.allocation_of(obj.reg, obj.version) else { return Ok(false) };
        if !allocation_tracked(&self.tracker, self.bb_states.state(block), id) {
            return Ok(false);
        }
        let Some(offset) = info.attr_offset else { return Ok(false) };
        let Some(attr_index) = host.attr_index(self.tracker.get(id).ty, offset) else { return Ok(false) };
        if attr_index >= self.tracker.get(id).attr_kinds.len()
            || self.tracker.get(id).attr_kinds[attr_index].reg_kind() != kind.reg_kind()
        {
            return Ok(false);
        }
        let dest = info
            .writes
            .ok_or_else(|| PeaError::IrInvariantViolated { detail: "vivifying read missing its destination".into() })?;
        let hyp_reg = self.tracker.get(id).hyp_attr_regs[attr_index];
        self.tracker.get_mut(id).read = true;

        if self.bb_states.state(block).map_or(false, |s| s.is_used(id, attr_index)) {
            self.ledger.push(block, Some(id), TransformKind::GetattrToSet { ins, dest, hyp_reg });
            return Ok(true);
        }

        let type_slot = info.alloc_type_slot.ok_or_else(|| PeaError::IrInvariantViolated {
            detail: "auto-vivifying read missing its default-value type slot".into(),
        })?;
        if let Some(s) = self.bb_states.state_mut(block) {
            s.mark_used(id, attr_index);
        }
        let kind = if concrete {
            TransformKind::VivifyConcrete { ins, dest, hyp_reg, type_slot }
        } else {
            TransformKind::VivifyType { ins, dest, hyp_reg, type_slot }
        };
        self.ledger.push(block, Some(id), kind);
        Ok(true)
    }

    /// §4.5/§4.7: a `decont_i` whose source traces back to a tracked bigint
    /// box rewrites into a direct read of the scalar-replaced bigint
    /// register, instead of forcing a real object just to unbox it again.
    fn try_rewrite_decont_i(
        &mut self,
        block: H::Block,
        ins: H::Ins,
        info: &OpInfo<H::Reg, H::Type>,
    ) -> Result<bool, PeaError> {
        let Some(obj) = info.object_operand.or_else(|| info.reads.first().copied()) else { return Ok(false) };
        let Some(id) = self.facts.allocation_of(obj.reg, obj.version) else { return Ok(false) };
        if !allocation_tracked(&self.tracker, self.bb_states.state(block), id) {
            return Ok(false);
        }
        let Some(attr_index) = self.tracker.get(id).attr_kinds.iter().position(|k| *k == RegKind::BigIntRef) else {
            return Ok(false);
        };
        let dest = info
            .writes
            .ok_or_else(|| PeaError::IrInvariantViolated { detail: "decont_i missing its destination".into() })?;
        let hyp_reg = self.tracker.get(id).hyp_attr_regs[attr_index];
        self.tracker.get_mut(id).read = true;
        self.ledger.push(block, Some(id), TransformKind::UnboxBigint { ins, dest, hyp_reg });
        Ok(true)
    }

    fn try_rewrite_bindattr(
        &mut self,
        host: &H,
        block: H::Block,
        ins: H::Ins,
        info: &OpInfo<H::Reg, H::Type>,
        kind: AttrKind,
    ) -> Result<bool, PeaError> {
        let Some(obj) = info.object_operand else { return Ok(false) };
        let Some(id) = self.facts.allocation_of(obj.reg, obj.version) else { return Ok(false) };
        if !allocation_tracked(&self.tracker, self.bb_states.state(block), id) {
            return Ok(false);
        }
        let Some(offset) = info.attr_offset else { return Ok(false) };
        let Some(attr_index) = host.attr_index(self.tracker.get(id).ty, offset) else { return Ok(false) };
        if attr_index >= self.tracker.get(id).attr_kinds.len()
            || self.tracker.get(id).attr_kinds[attr_index].reg_kind() != kind.reg_kind()
        {
            return Ok(false);
        }
        let Some(value) = info.reads.last().copied() else {
            return Err(PeaError::IrInvariantViolated { detail: "attribute bind missing its value operand".into() });
        };
        let hyp_reg = self.tracker.get(id).hyp_attr_regs[attr_index];
        if let Some(inner) = self.facts.allocation_of(value.reg, value.version) {
            self.tracker.add_escape_dependency(inner, id);
            self.facts.get_or_create_hyp(hyp_reg).depend_allocation = Some(inner);
        }
        if let Some(s) = self.bb_states.state_mut(block) {
            s.mark_used(id, attr_index);
        }
        self.ledger.push(block, Some(id), TransformKind::BindattrToSet { ins, hyp_reg, value });
        Ok(true)
    }

    /// §4.5(a): a `guardconc` whose shadow facts already prove the guarded
    /// value has the expected concrete type can be rewritten into a plain
    /// alias move instead of a real runtime check.
    fn try_settify_guard(
        &mut self,
        host: &H,
        block: H::Block,
        ins: H::Ins,
        info: &OpInfo<H::Reg, H::Type>,
    ) -> Result<bool, PeaError> {
        let (Some(obj), Some(slot)) = (info.reads.first().copied(), info.guarded_type_slot) else {
            return Ok(false);
        };
        let Some(wanted) = host.slot_type(slot) else { return Ok(false) };
        let Some(sf) = self.facts.get_concrete(obj.reg, obj.version) else { return Ok(false) };
        if !sf.concrete {
            return Ok(false);
        }
        if sf.known_type.map(|t| host.repr_id(t)) != Some(host.repr_id(wanted)) {
            return Ok(false);
        }
        let Some(id) = sf.depend_allocation else { return Ok(false) };
        if !allocation_tracked(&self.tracker, self.bb_states.state(block), id) {
            return Ok(false);
        }
        let dest = info
            .writes
            .ok_or_else(|| PeaError::IrInvariantViolated { detail: "guard missing its destination".into() })?;
        self.ledger.push(block, Some(id), TransformKind::GuardToSet { ins, dest, source: obj });
        Ok(true)
    }

    /// §4.6/§4.8: decomposes a bigint arithmetic/relational op into an
    /// unboxed-register instruction, but only when every operand already
    /// traces back to a tracked, still-replaceable bigint box — otherwise
    /// there is nothing to gain, and the instruction is left alone (any
    /// tracked operand still gets picked up by the escaping-use fallback).
    fn try_decompose_bigint(
        &mut self,
        block: H::Block,
        ins: H::Ins,
        info: &OpInfo<H::Reg, H::Type>,
        op: BigIntOp,
        arity: BigintArity,
    ) -> Result<bool, PeaError> {
        let operand_count = match arity {
            BigintArity::Unary => 1,
            _ => 2,
        };
        if info.reads.len() < operand_count {
            return Err(PeaError::IrInvariantViolated { detail: "bigint operation missing operands".into() });
        }

        let mut hyps: Vec<HypReg> = Vec::with_capacity(operand_count);
        let mut result_ty = None;
        for operand in &info.reads[..operand_count] {
            let Some(id) = self.facts.allocation_of(operand.reg, operand.version) else { return Ok(false) };
            if !allocation_tracked(&self.tracker, self.bb_states.state(block), id) || !self.tracker.get(id).bigint {
                return Ok(false);
            }
            hyps.push(self.tracker.get(id).hyp_attr_regs[0]);
            result_ty.get_or_insert(self.tracker.get(id).ty);
            self.tracker.get_mut(id).read = true;
        }

        let kind = match arity {
            BigintArity::Binary | BigintArity::Unary => {
                let dest = info
                    .writes
                    .ok_or_else(|| PeaError::IrInvariantViolated { detail: "bigint op missing destination".into() })?;
                let ty = result_ty
                    .ok_or_else(|| PeaError::IrOops { detail: "bigint decomposition lost its operand type".into() })?;
                let result_id = self.tracker.track_synthetic_bigint(ins, block, ty);
                self.facts.track_register(dest.reg, dest.version, result_id);
                self.bb_states.track_new(block, self.tracker.get(result_id).num_attrs());
                let result_hyp = self.tracker.get(result_id).hyp_attr_regs[0];
                if matches!(arity, BigintArity::Binary) {
                    TransformKind::DecomposeBigintBinary { ins, op, lhs: hyps[0], rhs: hyps[1], result_hyp }
                } else {
                    TransformKind::DecomposeBigintUnary { ins, op, operand: hyps[0], result_hyp }
                }
            }
            BigintArity::Relational => {
                let dest = info
                    .writes
                    .ok_or_else(|| PeaError::IrInvariantViolated { detail: "bigint comparison missing destination".into() })?;
                TransformKind::DecomposeBigintRelational { ins, op, lhs: hyps[0], rhs: hyps[1], dest }
            }
        };
        self.ledger.push(block, None, kind);
        Ok(true)
    }

    fn queue_materialize(
        &mut self,
        host: &mut H,
        block: H::Block,
        ins_list: &[H::Ins],
        idx: usize,
        id: AllocId,
        target: MaterializationTarget<H>,
    ) -> Result<(), PeaError> {
        if self.tracker.is_irreplaceable(id) {
            // Already forced real on some earlier path through this same
            // analysis (or itself nested inside an already-queued outer
            // materialization); nothing further to queue.
            return Ok(());
        }
        let anchor = materialize_anchor(host, block, ins_list, idx)?;
        let mut targets = vec![(id, target)];
        self.collect_nested_materializations(id, &mut targets);
        let nested_ids: Vec<AllocId> = targets.iter().map(|(nested_id, _)| *nested_id).collect();
        for nested_id in &nested_ids {
            self.tracker.mark_materialized(*nested_id);
        }
        let transform = self.ledger.push(block, Some(id), TransformKind::Materialize { prior_to: anchor, targets });
        if let Some(s) = self.bb_states.state_mut(block) {
            for nested_id in &nested_ids {
                s.add_materialization(*nested_id, Rc::clone(&transform));
            }
        }
        Ok(())
    }

    /// Any tracked, still-replaceable allocation reachable through an
    /// object/bigint-kind attribute must itself become a real object before
    /// (or as part of) `id` materializing, since a synthesized bind can only
    /// write a real register into `id`'s attribute slot.
    fn collect_nested_materializations(&self, id: AllocId, out: &mut Vec<(AllocId, MaterializationTarget<H>)>) {
        let rec = self.tracker.get(id);
        for (attr_index, kind) in rec.attr_kinds.iter().enumerate() {
            if !matches!(kind, RegKind::Obj | RegKind::BigIntRef) {
                continue;
            }
            let hyp = rec.hyp_attr_regs[attr_index];
            let Some(sf) = self.facts.get_hyp(hyp) else { continue };
            let Some(inner) = sf.depend_allocation else { continue };
            if self.tracker.is_irreplaceable(inner) || out.iter().any(|(seen, _)| *seen == inner) {
                continue;
            }
            out.push((inner, MaterializationTarget::Hypothetical(hyp)));
            self.collect_nested_materializations(inner, out);
        }
    }
}
