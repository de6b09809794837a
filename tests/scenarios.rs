//! Targeted integration tests, one per named scenario (S1-S6).

#![cfg(feature = "test-support")]

use pea::host::{BigIntOp, Host};
use pea::mock::MockHost;
use pea::pass::run_partial_escape_analysis;
use pea::repr::AttrKind;

#[test]
fn s1_single_attribute_box_never_escapes() {
    let mut host = MockHost::new();
    let ty = host.register_type(vec![AttrKind::Int], None);
    let entry = host.new_block();

    let src = host.unique_reg(pea::ids::RegKind::Int);
    let dst = host.push_fastcreate(entry, ty);
    host.push_bindattr(entry, dst, 0, src, AttrKind::Int);
    let out = host.push_getattr(entry, dst, 0, AttrKind::Int);
    host.push_other(entry, vec![out], false);

    let before = host.instruction_count(entry);
    let result = run_partial_escape_analysis(&mut host).expect("analysis succeeds");
    assert!(result.changed, "S1 should find a replaceable allocation");
    assert!(result.deopt_table.deopt_point.is_empty(), "no deopt point was exercised");

    // fastcreate, bindattr and getattr all rewritten/removed; the original
    // allocator and both attribute ops are gone from the block.
    let after = host.instruction_count(entry);
    assert!(after < before, "some instructions were deleted");
}

#[test]
fn s2_bigint_addition_devirtualization() {
    let mut host = MockHost::new();
    let bigint_ty = host.register_type(vec![AttrKind::BigInt], Some(0));
    let entry = host.new_block();

    let a = host.push_fastcreate(entry, bigint_ty);
    let b = host.push_fastcreate(entry, bigint_ty);
    let dst = host.push_bigint_binary(entry, BigIntOp::Add, a, b);
    host.push_other(entry, vec![dst], false);

    let result = run_partial_escape_analysis(&mut host).expect("analysis succeeds");
    assert!(result.changed, "S2 should devirtualize the bigint add");
}

#[test]
fn s3_guard_elimination_after_allocation() {
    let mut host = MockHost::new();
    let ty = host.register_type(vec![AttrKind::Int], None);
    let entry = host.new_block();

    let obj = host.push_fastcreate(entry, ty);
    let guarded = host.push_guardconc(entry, obj, ty);
    host.push_other(entry, vec![guarded], false);

    let result = run_partial_escape_analysis(&mut host).expect("analysis succeeds");
    assert!(result.changed, "S3 should settify the guard and drop the allocator");
}

#[test]
fn s4_escaping_to_unhandled_opcode_materializes_before_arg_prep() {
    let mut host = MockHost::new();
    let ty = host.register_type(vec![AttrKind::Int], None);
    let entry = host.new_block();

    let obj = host.push_fastcreate(entry, ty);
    let other_arg = host.unique_reg(pea::ids::RegKind::Int);
    host.push_argprep(entry, other_arg);
    host.push_argprep(entry, obj);
    host.push_other(entry, vec![obj], false);

    let result = run_partial_escape_analysis(&mut host).expect("analysis succeeds");
    assert!(result.changed, "S4 should force a materialization");
}

#[test]
fn s5_inconsistent_write_across_predecessors_stays_irreplaceable() {
    let mut host = MockHost::new();
    let ty = host.register_type(vec![AttrKind::Int], None);
    let entry = host.new_block();
    let left = host.new_block();
    let right = host.new_block();
    let merge = host.new_block();
    host.add_edge(entry, left);
    host.add_edge(entry, right);
    host.add_edge(left, merge);
    host.add_edge(right, merge);

    let obj = host.push_fastcreate(entry, ty);
    let src = host.unique_reg(pea::ids::RegKind::Int);
    host.push_bindattr(left, obj, 0, src, AttrKind::Int);
    // right branch leaves the attribute unwritten.
    let out = host.push_getattr(merge, obj, 0, AttrKind::Int);
    host.push_other(merge, vec![out], false);

    let before_entry = host.instruction_count(entry);
    let before_left = host.instruction_count(left);
    let before_merge = host.instruction_count(merge);
    let result = run_partial_escape_analysis(&mut host).expect("analysis succeeds");

    // The allocation was forced irreplaceable by the inconsistent merge, so
    // nothing in the original IR changes anywhere: the allocator survives,
    // the left branch's bind is never rewritten into a move, and the
    // merge-block read is never rewritten either.
    assert_eq!(host.instruction_count(entry), before_entry);
    assert_eq!(host.instruction_count(left), before_left);
    assert_eq!(host.instruction_count(merge), before_merge);
    let _ = result;
}

#[test]
fn s6_deopt_liveness_gets_one_materialize_descriptor() {
    let mut host = MockHost::new();
    let ty = host.register_type(vec![AttrKind::Int], None);
    let entry = host.new_block();

    let obj = host.push_fastcreate(entry, ty);
    let src = host.unique_reg(pea::ids::RegKind::Int);
    host.push_bindattr(entry, obj, 0, src, AttrKind::Int);
    let deopt_idx = host.push_other(entry, vec![], true).expect("may_deopt instruction mints a deopt index");
    host.set_deopt_live(deopt_idx, &[obj]);
    host.push_other(entry, vec![obj], false);

    let result = run_partial_escape_analysis(&mut host).expect("analysis succeeds");
    assert!(result.changed);
    assert_eq!(result.deopt_table.deopt_point.len(), 1, "exactly one deopt-point entry for the live allocation");
    assert_eq!(result.deopt_table.materialize_info.len(), 1, "exactly one materialize descriptor, shared by any later deopt point");
}

#[test]
fn s7_vivifying_get_reads_existing_value_when_already_written() {
    let mut host = MockHost::new();
    let ty = host.register_type(vec![AttrKind::Obj], None);
    let default_ty = host.register_opaque_type();
    let entry = host.new_block();

    let obj = host.push_fastcreate(entry, ty);
    let val = host.unique_reg(pea::ids::RegKind::Obj);
    host.push_bindattr(entry, obj, 0, val, AttrKind::Obj);
    let out = host.push_vivifying_get(entry, obj, 0, AttrKind::Obj, false, default_ty);
    host.push_other(entry, vec![out], false);

    let result = run_partial_escape_analysis(&mut host).expect("analysis succeeds");
    assert!(result.changed, "S7 should devirtualize the auto-vivifying read");

    // Written on the only path reaching it: the read must alias straight to
    // the bound value's concrete register, never conjure a default.
    let moves: Vec<_> = host
        .instructions(entry)
        .into_iter()
        .filter_map(|ins| {
            let info = host.op_info(entry, ins).unwrap();
            (info.family == pea::host::OpFamily::AliasMove).then_some(info)
        })
        .collect();
    assert_eq!(moves.len(), 2, "one move for the bind, one for the read");
    let bind_move = moves.iter().find(|m| m.reads.first().map(|r| r.reg) == Some(val)).expect("bind move reads val");
    let attr_reg = bind_move.writes.expect("bind move writes the attribute register").reg;
    let read_move = moves.iter().find(|m| m.writes.map(|w| w.reg) == Some(out)).expect("read move writes out");
    assert_eq!(
        read_move.reads.first().map(|r| r.reg),
        Some(attr_reg),
        "the read aliases the same register the bind wrote, not a conjured default"
    );
}

#[test]
fn s8_vivifying_get_conjures_default_when_never_written() {
    let mut host = MockHost::new();
    let ty = host.register_type(vec![AttrKind::Obj], None);
    let default_ty = host.register_opaque_type();
    let entry = host.new_block();

    let obj = host.push_fastcreate(entry, ty);
    let out = host.push_vivifying_get(entry, obj, 0, AttrKind::Obj, false, default_ty);
    host.push_other(entry, vec![out], false);

    let result = run_partial_escape_analysis(&mut host).expect("analysis succeeds");
    assert!(result.changed, "S8 should devirtualize the auto-vivifying read");

    // Never written on any path: the allocator and the vivifying read are
    // both rewritten away, and `out` now comes from a move fed by a
    // conjured default rather than a real object.
    assert!(
        host.instructions(entry).into_iter().all(|ins| {
            let family = host.op_info(entry, ins).unwrap().family;
            !matches!(family, pea::host::OpFamily::FastCreate | pea::host::OpFamily::VivifyingGet { .. })
        }),
        "both the allocator and the vivifying read are rewritten away"
    );
    let out_ins = host
        .instructions(entry)
        .into_iter()
        .find(|&ins| host.op_info(entry, ins).unwrap().writes.map(|w| w.reg) == Some(out))
        .expect("out is still produced by something");
    assert_eq!(host.op_info(entry, out_ins).unwrap().family, pea::host::OpFamily::AliasMove);
}

#[test]
fn s9_decont_i_unboxes_tracked_bigint_directly() {
    let mut host = MockHost::new();
    let bigint_ty = host.register_type(vec![AttrKind::BigInt], Some(0));
    let entry = host.new_block();

    let obj = host.push_fastcreate(entry, bigint_ty);
    let src = host.unique_reg(pea::ids::RegKind::BigIntRef);
    host.push_bindattr(entry, obj, 0, src, AttrKind::BigInt);
    let out = host.push_decont_i(entry, obj);
    host.push_other(entry, vec![out], false);

    let result = run_partial_escape_analysis(&mut host).expect("analysis succeeds");
    assert!(result.changed, "S9 should devirtualize decont_i against the tracked box");
    assert!(
        host.instructions(entry).into_iter().all(|ins| {
            let family = host.op_info(entry, ins).unwrap().family;
            !matches!(family, pea::host::OpFamily::FastCreate | pea::host::OpFamily::DecontI)
        }),
        "both the allocator and decont_i are rewritten away"
    );
}

#[test]
fn s10_alias_move_is_deleted_once_absorbed_into_shadow_facts() {
    let mut host = MockHost::new();
    let ty = host.register_type(vec![AttrKind::Int], None);
    let entry = host.new_block();

    let obj = host.push_fastcreate(entry, ty);
    let alias = host.push_set(entry, obj);
    let src = host.unique_reg(pea::ids::RegKind::Int);
    host.push_bindattr(entry, alias, 0, src, AttrKind::Int);
    let out = host.push_getattr(entry, alias, 0, AttrKind::Int);
    host.push_other(entry, vec![out], false);

    let result = run_partial_escape_analysis(&mut host).expect("analysis succeeds");
    assert!(result.changed, "S10 should devirtualize through the alias");

    // The `set` aliasing `obj` into `alias` is fully absorbed into shadow
    // facts: leaving it behind would read a register nothing defines once
    // the allocator it pointed at is deleted.
    assert!(
        host.instructions(entry).into_iter().all(|ins| {
            let info = host.op_info(entry, ins).unwrap();
            let reads_dead = info.reads.iter().any(|r| r.reg == obj || r.reg == alias);
            let object_dead = info.object_operand.map(|o| o.reg == obj || o.reg == alias).unwrap_or(false);
            !reads_dead && !object_dead
        }),
        "no surviving instruction still reads the deleted allocator or its alias"
    );
}

#[test]
fn s11_preexisting_materialize_bi_keeps_its_unboxed_value_when_never_forced_real() {
    let mut host = MockHost::new();
    let bigint_ty = host.register_type(vec![AttrKind::BigInt], Some(0));
    let entry = host.new_block();

    let unboxed = host.unique_reg(pea::ids::RegKind::BigIntRef);
    let boxed = host.push_materialize_bi(entry, bigint_ty, unboxed);
    let out = host.push_decont_i(entry, boxed);
    host.push_other(entry, vec![out], false);

    let result = run_partial_escape_analysis(&mut host).expect("analysis succeeds");
    assert!(result.changed, "S11 should devirtualize the pre-existing box");

    // The sp_materialize_bi allocator is converted into a move of its own
    // unboxed source, not deleted outright: the downstream decont_i must
    // still end up reading that same value through the chain of moves.
    let moves: Vec<_> = host
        .instructions(entry)
        .into_iter()
        .filter_map(|ins| {
            let info = host.op_info(entry, ins).unwrap();
            (info.family == pea::host::OpFamily::AliasMove).then_some(info)
        })
        .collect();
    assert!(moves.iter().any(|m| m.reads.first().map(|r| r.reg) == Some(unboxed)), "the unboxed source survives into a move");
    assert!(moves.iter().any(|m| m.writes.map(|w| w.reg) == Some(out)), "decont_i now reads that same value chain");
}

#[test]
fn loop_detection_leaves_the_function_untouched() {
    let mut host = MockHost::new();
    let ty = host.register_type(vec![AttrKind::Int], None);
    let entry = host.new_block();
    let loop_header = host.new_block();
    host.add_edge(entry, loop_header);
    host.add_edge(loop_header, loop_header); // back-edge: a not-yet-visited predecessor

    let _obj = host.push_fastcreate(loop_header, ty);
    let before = host.instruction_count(loop_header);
    let result = run_partial_escape_analysis(&mut host).expect("analysis succeeds");
    assert!(!result.changed, "a function with a loop is left untouched");
    assert_eq!(host.instruction_count(loop_header), before);
}

