//! C7: the rewriter. Drains the transform ledger in the function's linear
//! block order and applies each queued edit through the `Host`.
//!
//! Every transform recorded by the analyzer remains valid regardless of what
//! happens to its allocation afterwards: an attribute read/write rewrite
//! only changes how one instruction gets its value, a settified guard was
//! already proven sound at the point it was queued, and a `Materialize`
//! transform is queued at most once per allocation (queuing one marks the
//! allocation irreplaceable immediately, see [`crate::analyzer`]). None of
//! that requires re-checking an allocation's final state at apply time. The
//! one thing the rewriter does need to do itself, at the very end, is delete
//! the allocator instruction of every allocation that stayed scalar-replaced
//! all the way through — those never got a `Materialize` transform at all,
//! since nothing ever forced them real.

use crate::allocation::AllocationTracker;
use crate::deopt::DeoptBridge;
use crate::error::PeaError;
use crate::host::{Host, Op, Operand, SlotValue};
use crate::ids::{AllocId, HypReg, SlotIdx};
use crate::repr::AttrKind;
use crate::transform::{MaterializationTarget, Transform, TransformKind};

/// Returns (and lazily assigns) the concrete register backing attribute
/// `attr_index` of `owner`.
fn ensure_concrete_attr_reg<H: Host>(
    host: &mut H,
    tracker: &mut AllocationTracker<H>,
    owner: AllocId,
    attr_index: usize,
) -> H::Reg {
    if let Some(reg) = tracker.get(owner).concrete_attr_regs[attr_index] {
        return reg;
    }
    let kind = tracker.get(owner).attr_kinds[attr_index];
    let reg = host.unique_reg(kind);
    tracker.get_mut(owner).concrete_attr_regs[attr_index] = Some(reg);
    reg
}

/// Resolves a hypothetical register to its (lazily assigned) concrete home.
fn resolve_hyp<H: Host>(
    host: &mut H,
    tracker: &mut AllocationTracker<H>,
    hyp: crate::ids::HypReg,
) -> Result<H::Reg, PeaError> {
    let (owner, attr_index) = tracker
        .hyp_owner(hyp)
        .ok_or_else(|| PeaError::IrOops { detail: format!("hypothetical register {} has no owner", hyp) })?;
    Ok(ensure_concrete_attr_reg(host, tracker, owner, attr_index))
}

fn resolve_target<H: Host>(
    host: &mut H,
    tracker: &mut AllocationTracker<H>,
    target: &MaterializationTarget<H>,
) -> Result<H::Reg, PeaError> {
    match target {
        MaterializationTarget::Concrete(op) => Ok(op.reg),
        MaterializationTarget::Hypothetical(hyp) => resolve_hyp(host, tracker, *hyp),
    }
}

/// §4.9/C8: materializes one allocation's real object immediately before
/// `prior_to`, into `dst_reg`. Prefers the single-instruction
/// `sp_materialize_bi` fast path for single-attribute bigint boxes with an
/// int-cache entry; falls back to a plain `fastcreate` plus one bind per
/// attribute that was ever written.
fn materialize_allocation<H: Host>(
    host: &mut H,
    tracker: &mut AllocationTracker<H>,
    block: H::Block,
    prior_to: H::Ins,
    id: AllocId,
    dst_reg: H::Reg,
) -> Result<(), PeaError> {
    let ty = tracker.get(id).ty;
    let type_slot = host.add_spesh_slot(SlotValue::Type(ty));

    if tracker.get(id).bigint && tracker.get(id).num_attrs() == 1 {
        if let Some(int_cache_type_idx) = host.int_cache_type_index(ty) {
            let unboxed = ensure_concrete_attr_reg(host, tracker, id, 0);
            let mat_ins = host.insert_ins_before(
                block,
                prior_to,
                Op::MaterializeBi { dst: dst_reg, type_slot, offset: 0, unboxed, int_cache_type_idx },
            );
            host.usages_add(Operand::new(unboxed, host.current_version(unboxed)), mat_ins);
            return Ok(());
        }
    }

    host.insert_ins_before(block, prior_to, Op::FastCreate { dst: dst_reg, type_slot });
    let num_attrs = tracker.get(id).num_attrs();
    for attr_index in 0..num_attrs {
        let Some(val_reg) = tracker.get(id).concrete_attr_regs[attr_index] else {
            // Never written on any path reaching here: left unset, same as
            // a fresh allocation would leave it.
            continue;
        };
        let offset = host.attr_offset(ty, attr_index).ok_or_else(|| PeaError::IrInvariantViolated {
            detail: format!("type has no attribute offset for index {}", attr_index),
        })?;
        let kind = AttrKind::from_reg_kind(tracker.get(id).attr_kinds[attr_index]);
        let bind_ins = host.insert_ins_before(block, prior_to, Op::BindAttr { obj: dst_reg, offset, val: val_reg, kind });
        host.usages_add(Operand::new(val_reg, host.current_version(val_reg)), bind_ins);
    }
    Ok(())
}

/// Retires every operand an instruction about to be deleted was reading,
/// per the host's usage table, then deletes it.
fn retire_instruction<H: Host>(host: &mut H, block: H::Block, ins: H::Ins) -> Result<(), PeaError> {
    let info = host.op_info(block, ins)?;
    for read in info.reads {
        host.usages_delete(read, ins);
    }
    if let Some(obj) = info.object_operand {
        host.usages_delete(obj, ins);
    }
    host.delete_ins(block, ins);
    Ok(())
}

/// §4.5/§4.7: conjures an auto-vivified attribute's default value straight
/// into its (lazily assigned) concrete register, then aliases the original
/// read's destination to it, same as an ordinary `GETATTR_TO_SET`.
fn apply_vivify<H: Host>(
    host: &mut H,
    tracker: &mut AllocationTracker<H>,
    block: H::Block,
    ins: H::Ins,
    dest: Operand<H::Reg>,
    hyp_reg: HypReg,
    type_slot: SlotIdx,
    concrete: bool,
) -> Result<(), PeaError> {
    let attr_reg = resolve_hyp(host, tracker, hyp_reg)?;
    host.new_version(attr_reg);
    host.insert_ins_before(block, ins, Op::VivifyDefault { dst: attr_reg, type_slot, concrete });
    let mov = host.insert_ins_before(block, ins, Op::Move { dst: dest.reg, src: attr_reg });
    host.usages_add(Operand::new(attr_reg, host.current_version(attr_reg)), mov);
    retire_instruction(host, block, ins)
}

fn apply_transform<H: Host>(
    host: &mut H,
    tracker: &mut AllocationTracker<H>,
    deopt: &mut DeoptBridge<H>,
    block: H::Block,
    transform: &Transform<H>,
) -> Result<(), PeaError> {
    match &transform.kind {
        TransformKind::GetattrToSet { ins, dest, hyp_reg } => {
            let src = resolve_hyp(host, tracker, *hyp_reg)?;
            let mov = host.insert_ins_before(block, *ins, Op::Move { dst: dest.reg, src });
            host.usages_add(Operand::new(src, host.current_version(src)), mov);
            retire_instruction(host, block, *ins)?;
        }
        TransformKind::BindattrToSet { ins, hyp_reg, value } => {
            let dst = resolve_hyp(host, tracker, *hyp_reg)?;
            host.new_version(dst);
            let mov = host.insert_ins_before(block, *ins, Op::Move { dst, src: value.reg });
            host.usages_add(*value, mov);
            retire_instruction(host, block, *ins)?;
        }
        TransformKind::GuardToSet { ins, dest, source } => {
            let mov = host.insert_ins_before(block, *ins, Op::Move { dst: dest.reg, src: source.reg });
            host.usages_add(*source, mov);
            retire_instruction(host, block, *ins)?;
        }
        TransformKind::ProfAllocated { ins } => {
            let alloc = transform
                .allocation
                .ok_or_else(|| PeaError::IrOops { detail: "prof_allocated rewrite missing its allocation".into() })?;
            let ty = tracker.get(alloc).ty;
            let type_slot = host.add_spesh_slot(SlotValue::Type(ty));
            host.insert_ins_before(block, *ins, Op::ProfReplaced { type_slot });
            retire_instruction(host, block, *ins)?;
        }
        TransformKind::VivifyType { ins, dest, hyp_reg, type_slot } => {
            apply_vivify(host, tracker, block, *ins, *dest, *hyp_reg, *type_slot, false)?;
        }
        TransformKind::VivifyConcrete { ins, dest, hyp_reg, type_slot } => {
            apply_vivify(host, tracker, block, *ins, *dest, *hyp_reg, *type_slot, true)?;
        }
        TransformKind::UnboxBigint { ins, dest, hyp_reg } => {
            let src = resolve_hyp(host, tracker, *hyp_reg)?;
            let mov = host.insert_ins_before(block, *ins, Op::Move { dst: dest.reg, src });
            host.usages_add(Operand::new(src, host.current_version(src)), mov);
            retire_instruction(host, block, *ins)?;
        }
        TransformKind::DeleteSet { ins } => {
            retire_instruction(host, block, *ins)?;
        }
        TransformKind::UnmaterializeBi { ins, hyp_reg, unboxed } => {
            let attr_reg = resolve_hyp(host, tracker, *hyp_reg)?;
            host.new_version(attr_reg);
            let mov = host.insert_ins_before(block, *ins, Op::Move { dst: attr_reg, src: unboxed.reg });
            host.usages_add(*unboxed, mov);
            retire_instruction(host, block, *ins)?;
        }
        TransformKind::DecomposeBigintBinary { ins, op, lhs, rhs, result_hyp } => {
            let lhs_reg = resolve_hyp(host, tracker, *lhs)?;
            let rhs_reg = resolve_hyp(host, tracker, *rhs)?;
            let dst = resolve_hyp(host, tracker, *result_hyp)?;
            host.new_version(dst);
            let new_ins = host.insert_ins_before(
                block,
                *ins,
                Op::UnboxedBigintOp { op: *op, dst: Some(dst), args: vec![lhs_reg, rhs_reg] },
            );
            host.usages_add(Operand::new(lhs_reg, host.current_version(lhs_reg)), new_ins);
            host.usages_add(Operand::new(rhs_reg, host.current_version(rhs_reg)), new_ins);
            retire_instruction(host, block, *ins)?;
        }
        TransformKind::DecomposeBigintUnary { ins, op, operand, result_hyp } => {
            let operand_reg = resolve_hyp(host, tracker, *operand)?;
            let dst = resolve_hyp(host, tracker, *result_hyp)?;
            host.new_version(dst);
            let new_ins =
                host.insert_ins_before(block, *ins, Op::UnboxedBigintOp { op: *op, dst: Some(dst), args: vec![operand_reg] });
            host.usages_add(Operand::new(operand_reg, host.current_version(operand_reg)), new_ins);
            retire_instruction(host, block, *ins)?;
        }
        TransformKind::DecomposeBigintRelational { ins, op, lhs, rhs, dest } => {
            let lhs_reg = resolve_hyp(host, tracker, *lhs)?;
            let rhs_reg = resolve_hyp(host, tracker, *rhs)?;
            let new_ins = host.insert_ins_before(
                block,
                *ins,
                Op::UnboxedBigintOp { op: *op, dst: Some(dest.reg), args: vec![lhs_reg, rhs_reg] },
            );
            host.usages_add(Operand::new(lhs_reg, host.current_version(lhs_reg)), new_ins);
            host.usages_add(Operand::new(rhs_reg, host.current_version(rhs_reg)), new_ins);
            retire_instruction(host, block, *ins)?;
        }
        TransformKind::AddDeoptPoint { deopt_idx, allocation, target } => {
            let ty = tracker.get(*allocation).ty;
            let type_slot = host.add_spesh_slot(SlotValue::Type(ty));
            let mat_idx = deopt.materialize_info_idx(tracker, type_slot, *allocation)?;
            // Pin every attribute register already captured for this
            // allocation as live at the deopt point, not just the original
            // (now dead) tracked-object register: the register allocator's
            // liveness pass only sees what the usage table tells it.
            let attr_regs: Vec<H::Reg> = deopt.attr_regs(mat_idx).iter().filter_map(|r| *r).collect();
            for reg in attr_regs {
                host.usages_add_deopt(Operand::new(reg, host.current_version(reg)), *deopt_idx);
            }
            deopt.add_deopt_point(*deopt_idx, mat_idx, target.reg);
        }
        TransformKind::Materialize { prior_to, targets } => {
            for (id, target) in targets {
                let dst_reg = resolve_target(host, tracker, target)?;
                materialize_allocation(host, tracker, block, *prior_to, *id, dst_reg)?;
            }
        }
    }
    Ok(())
}

/// C7. Applies every transform in `ledger`, walking blocks in the host's
/// `linear_order`, then deletes the allocator instruction of every
/// allocation that stayed scalar-replaced through to the end of analysis
/// (nothing ever forced it real, so its `fastcreate`/`sp_materialize_bi` is
/// now dead code).
pub fn rewrite<H: Host>(
    host: &mut H,
    tracker: &mut AllocationTracker<H>,
    ledger: &crate::transform::TransformLedger<H>,
    deopt: &mut DeoptBridge<H>,
) -> Result<(), PeaError> {
    for block in host.linear_order() {
        let transforms = ledger.for_block(block).to_vec();
        for transform in &transforms {
            // Every transform but `Materialize` rewrites one existing
            // instruction in place; it's only sound when either the
            // allocation survived analysis fully scalar-replaced, or it was
            // itself forced real via a `Materialize` transform elsewhere
            // (which supersedes it). An allocation retired by something
            // else entirely — an inconsistent cross-predecessor merge, most
            // notably — has no such transform backing it up, so every
            // rewrite already queued against it must be left unapplied and
            // the original instruction kept.
            if !matches!(transform.kind, TransformKind::Materialize { .. }) {
                if let Some(id) = transform.allocation {
                    if tracker.is_irreplaceable(id) && !tracker.is_materialized(id) {
                        continue;
                    }
                }
            }
            apply_transform(host, tracker, deopt, block, transform)?;
        }
    }

    // The original allocator survives only when the allocation was retired
    // without ever being materialized (an inconsistent merge, say): that's
    // the one case where the original IR has to come through untouched.
    // Every other allocation's original allocator is now dead: either it
    // stayed scalar-replaced end to end, or a `Materialize` transform
    // already synthesized a fresh allocator of its own at the point that
    // needed one.
    for i in 0..tracker.allocations.len() {
        let id = AllocId(i as u32);
        let rec = tracker.get(id);
        if rec.synthetic || rec.unmaterialize_bi_queued {
            // `synthetic` stands for a decomposed bigint op's result, not a
            // real allocator; `unmaterialize_bi_queued` means the allocator
            // was a pre-existing `sp_materialize_bi` already converted in
            // place into a move by its `UnmaterializeBi` transform. Either
            // way the instruction this record points at was already
            // retired elsewhere.
            continue;
        }
        if !tracker.is_irreplaceable(id) || tracker.is_materialized(id) {
            host.delete_ins(rec.allocator_bb, rec.allocator);
        }
    }
    Ok(())
}
