//! Universal property checks from the "testable properties" list, as
//! opposed to `tests/scenarios.rs`'s one-test-per-named-scenario.

#![cfg(feature = "test-support")]

use pea::allocation::AllocationTracker;
use pea::analyzer::{AnalyzeOutcome, Analyzer};
use pea::deopt::DeoptBridge;
use pea::host::{BigIntOp, Host};
use pea::ids::RegKind;
use pea::mock::MockHost;
use pea::pass::run_partial_escape_analysis;
use pea::repr::AttrKind;
use pea::rewriter;
use quickcheck_macros::quickcheck;

fn analyze(host: &mut MockHost) -> Analyzer<MockHost> {
    match Analyzer::analyze(host).expect("analysis succeeds") {
        AnalyzeOutcome::Done { analyzer, .. } => analyzer,
        AnalyzeOutcome::LoopDetected => panic!("test graph has no loop"),
    }
}

/// Runs both halves of the pass, same as [`run_partial_escape_analysis`],
/// but hands back the tracker too so a test can inspect concrete register
/// assignments after the rewriter has actually resolved them.
fn analyze_and_rewrite(host: &mut MockHost) -> AllocationTracker<MockHost> {
    let mut analyzer = analyze(host);
    let mut deopt = DeoptBridge::new();
    rewriter::rewrite(host, &mut analyzer.tracker, &analyzer.ledger, &mut deopt).expect("rewrite succeeds");
    analyzer.tracker
}

// -- property 2: loop refusal -----------------------------------------------

#[test]
fn loop_refusal_makes_no_edits_and_reports_nothing_found() {
    let mut host = MockHost::new();
    let ty = host.register_type(vec![AttrKind::Int], None);
    let entry = host.new_block();
    let header = host.new_block();
    host.add_edge(entry, header);
    host.add_edge(header, header);
    host.push_fastcreate(header, ty);

    let before: Vec<usize> = (0..2).map(|i| host.instruction_count(pea_block(i))).collect();
    let result = run_partial_escape_analysis(&mut host).expect("analysis succeeds");
    assert!(!result.changed, "a loop must report nothing found");
    for (i, count) in before.into_iter().enumerate() {
        assert_eq!(host.instruction_count(pea_block(i as u32)), count, "block {i} must be untouched");
    }
}

fn pea_block(i: u32) -> pea::mock::MBlock {
    pea::mock::MBlock(i)
}

/// A chain `entry -> b1 -> b2 -> ... -> bN`, with a back-edge from the last
/// block to some earlier one whenever `loop_at` names a valid target. A
/// candidate allocation sits in the last block either way.
#[quickcheck]
fn loop_refusal_holds_over_randomly_shaped_chains(chain_len: u8, loop_at: u8) {
    let chain_len = (chain_len % 6) + 1;
    let mut host = MockHost::new();
    let ty = host.register_type(vec![AttrKind::Int], None);

    let blocks: Vec<_> = (0..chain_len).map(|_| host.new_block()).collect();
    for w in blocks.windows(2) {
        host.add_edge(w[0], w[1]);
    }
    let last = *blocks.last().unwrap();
    host.push_fastcreate(last, ty);

    let has_loop = chain_len > 1 && (loop_at as usize % chain_len as usize) < chain_len as usize - 1;
    if has_loop {
        let target = blocks[loop_at as usize % (chain_len as usize - 1)];
        host.add_edge(last, target);
    }

    let before: Vec<usize> = blocks.iter().map(|&b| host.instruction_count(b)).collect();
    let result = run_partial_escape_analysis(&mut host).expect("analysis succeeds");
    if has_loop {
        assert!(!result.changed, "any back-edge must make the pass report nothing found");
        for (&b, count) in blocks.iter().zip(before) {
            assert_eq!(host.instruction_count(b), count, "a rejected function is left untouched");
        }
    } else {
        assert!(result.changed, "an acyclic chain with a never-escaping allocation is always found replaceable");
    }
}

// -- property 3: irreplaceability propagation --------------------------------

#[test]
fn irreplaceability_propagates_to_escape_dependents() {
    // outer holds inner in its one attribute, recording outer as one of
    // inner's escape dependencies. inner is then forced irreplaceable by
    // escaping to an opaque call directly; that must drag outer down with
    // it too, since outer's attribute slot can no longer be a purely
    // hypothetical placeholder once inner itself needs a real object.
    let mut host = MockHost::new();
    let inner_ty = host.register_type(vec![AttrKind::Int], None);
    let outer_ty = host.register_type(vec![AttrKind::Obj], None);
    let entry = host.new_block();

    let inner = host.push_fastcreate(entry, inner_ty);
    let inner_src = host.unique_reg(RegKind::Int);
    host.push_bindattr(entry, inner, 0, inner_src, AttrKind::Int);
    host.push_getattr(entry, inner, 0, AttrKind::Int); // marks inner.read, so the later escape is unconditionally worth it
    let outer = host.push_fastcreate(entry, outer_ty);
    host.push_bindattr(entry, outer, 0, inner, AttrKind::Obj);
    host.push_argprep(entry, inner);
    let other_arg = host.unique_reg(RegKind::Int);
    host.push_argprep(entry, other_arg);
    host.push_other(entry, vec![inner], false);

    let analyzer = analyze(&mut host);
    let outer_id = (0..analyzer.tracker.allocations.len())
        .map(pea::ids::AllocId)
        .find(|id| analyzer.tracker.get(*id).attr_kinds.first() == Some(&RegKind::Obj))
        .expect("outer allocation tracked");
    let inner_id = (0..analyzer.tracker.allocations.len())
        .map(pea::ids::AllocId)
        .find(|id| analyzer.tracker.get(*id).attr_kinds.first() == Some(&RegKind::Int))
        .expect("inner allocation tracked");

    assert!(analyzer.tracker.is_irreplaceable(inner_id), "inner escapes to an opaque call");
    assert!(analyzer.tracker.is_materialized(inner_id), "inner's escape queued a real materialize transform");
    assert!(analyzer.tracker.is_irreplaceable(outer_id), "outer must inherit inner's irreplaceability");
    assert!(
        !analyzer.tracker.is_materialized(outer_id),
        "outer never got its own materialize transform, only inherited irreplaceability"
    );
}

#[test]
fn irreplaceability_propagation_is_closed_over_the_whole_dependency_set() {
    // A manual, host-independent check directly against the tracker: build
    // a chain A -> B -> C of escape dependencies and confirm marking A
    // irreplaceable reaches C transitively, even though only A is ever
    // marked directly.
    let mut tracker: AllocationTracker<MockHost> = AllocationTracker::new();
    let mut host = MockHost::new();
    let ty = host.register_type(vec![AttrKind::Int], None);
    let blk = host.new_block();

    let a = tracker.try_track(&host, pea::mock::MIns(0), blk, ty).expect("p6opaque type is trackable");
    let b = tracker.try_track(&host, pea::mock::MIns(1), blk, ty).expect("p6opaque type is trackable");
    let c = tracker.try_track(&host, pea::mock::MIns(2), blk, ty).expect("p6opaque type is trackable");
    tracker.add_escape_dependency(a, b);
    tracker.add_escape_dependency(b, c);

    tracker.mark_irreplaceable(a);
    assert!(tracker.is_irreplaceable(a));
    assert!(tracker.is_irreplaceable(b));
    assert!(tracker.is_irreplaceable(c));
}

/// Same shape as the chain test above but over a randomly generated linear
/// chain of arbitrary length, with the irreplaceable mark dropped at a
/// random point along it: everything from that point on must end up
/// irreplaceable, and — since a chain has no other entry points — nothing
/// before it does.
#[quickcheck]
fn irreplaceability_propagates_through_a_random_length_chain(chain_len: u8, mark_at: u8) -> bool {
    let chain_len = (chain_len % 8) + 1;
    let mark_at = (mark_at as usize) % chain_len as usize;

    let mut tracker: AllocationTracker<MockHost> = AllocationTracker::new();
    let mut host = MockHost::new();
    let ty = host.register_type(vec![AttrKind::Int], None);
    let blk = host.new_block();

    let ids: Vec<_> = (0..chain_len)
        .map(|i| tracker.try_track(&host, pea::mock::MIns(i as u32), blk, ty).expect("p6opaque type is trackable"))
        .collect();
    for w in ids.windows(2) {
        tracker.add_escape_dependency(w[0], w[1]);
    }

    tracker.mark_irreplaceable(ids[mark_at]);

    ids.iter().enumerate().all(|(i, &id)| tracker.is_irreplaceable(id) == (i >= mark_at))
}

// -- property 4: consistency of `used` ---------------------------------------

#[test]
fn a_read_reachable_from_a_predecessor_that_never_wrote_the_attribute_is_left_unrewritten() {
    // Mirrors S5's merge shape, but checks the mechanism directly: the
    // right branch never binds the attribute, so the merge-block read is
    // not "used" on every path reaching it, and must survive as a real
    // GetAttr rather than being turned into a plain register move.
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
    let src = host.unique_reg(RegKind::Int);
    host.push_bindattr(left, obj, 0, src, AttrKind::Int);
    let read_reg = host.push_getattr(merge, obj, 0, AttrKind::Int);
    host.push_other(merge, vec![read_reg], false);

    let _result = run_partial_escape_analysis(&mut host).expect("analysis succeeds");
    let read_ins = host
        .instructions(merge)
        .into_iter()
        .find(|&ins| host.op_info(merge, ins).map(|i| i.writes.map(|w| w.reg) == Some(read_reg)).unwrap_or(false))
        .expect("the read instruction is still in the block");
    let info = host.op_info(merge, read_ins).expect("instruction exists");
    assert!(
        matches!(info.family, pea::host::OpFamily::GetAttr(_)),
        "a read not proven used on every path must never become an alias move"
    );
}

// -- consistency of per-block materialization state --------------------------

#[test]
fn materialization_recorded_on_some_but_not_all_predecessors_marks_irreplaceable() {
    // Direct check against the bb-state merge itself, mirroring the `used`
    // consistency check above: `left` records a materialization for `id`,
    // `right` never touches it at all, so `merge` must see the mismatch and
    // retire the allocation, even though neither predecessor alone would.
    use pea::bbstate::BbStateTable;
    use pea::transform::{MaterializationTarget, TransformKind, TransformLedger};

    let mut host = MockHost::new();
    let ty = host.register_type(vec![AttrKind::Int], None);
    let blk = host.new_block();
    let left = host.new_block();
    let right = host.new_block();
    let merge = host.new_block();

    let mut tracker: AllocationTracker<MockHost> = AllocationTracker::new();
    let mut bb_states: BbStateTable<MockHost> = BbStateTable::new();
    bb_states.setup_block(&mut tracker, blk, &[]);
    let id = tracker.try_track(&host, pea::mock::MIns(0), blk, ty).expect("p6opaque type is trackable");
    bb_states.track_new(blk, tracker.get(id).num_attrs());

    bb_states.setup_block(&mut tracker, left, &[blk]);
    bb_states.setup_block(&mut tracker, right, &[blk]);

    let mut ledger: TransformLedger<MockHost> = TransformLedger::new();
    let target = MaterializationTarget::Concrete(pea::host::Operand::new(pea::mock::MReg(0), pea::ids::Version(0)));
    let transform = ledger.push(left, Some(id), TransformKind::Materialize { prior_to: pea::mock::MIns(1), targets: vec![(id, target)] });
    bb_states.state_mut(left).unwrap().add_materialization(id, transform);

    assert!(!tracker.is_irreplaceable(id), "not yet forced irreplaceable before the merge sees the mismatch");
    bb_states.setup_block(&mut tracker, merge, &[left, right]);
    assert!(tracker.is_irreplaceable(id), "materialized on one predecessor but not the other must retire the allocation");
}

// -- property 5: no argument-sequence splits ---------------------------------

#[test]
fn materialization_never_splits_an_arg_prep_sequence() {
    let mut host = MockHost::new();
    let ty = host.register_type(vec![AttrKind::Int], None);
    let entry = host.new_block();

    let obj = host.push_fastcreate(entry, ty);
    let other_arg = host.unique_reg(RegKind::Int);
    host.push_argprep(entry, other_arg);
    host.push_argprep(entry, obj);
    host.push_other(entry, vec![obj], false);

    let before = host.instruction_count(entry);
    let result = run_partial_escape_analysis(&mut host).expect("analysis succeeds");
    assert!(result.changed);
    // The materialization inserts at least a fastcreate ahead of the first
    // arg_prep; nothing should have landed *between* the two arg_preps,
    // which would show up as the sequence no longer being two consecutive
    // arg-prep-shaped instructions immediately before the call.
    let after = host.instruction_count(entry);
    assert!(after > before, "materialization adds instructions ahead of the call");
}

// -- property 6: deopt completeness ------------------------------------------

#[test]
fn every_live_allocation_at_a_deopt_point_gets_a_table_entry() {
    let mut host = MockHost::new();
    let ty = host.register_type(vec![AttrKind::Int], None);
    let entry = host.new_block();

    let a = host.push_fastcreate(entry, ty);
    let b = host.push_fastcreate(entry, ty);
    let src = host.unique_reg(RegKind::Int);
    host.push_bindattr(entry, a, 0, src, AttrKind::Int);
    host.push_bindattr(entry, b, 0, src, AttrKind::Int);

    let deopt_idx = host.push_other(entry, vec![], true).expect("may_deopt mints a deopt index");
    host.set_deopt_live(deopt_idx, &[a, b]);

    let result = run_partial_escape_analysis(&mut host).expect("analysis succeeds");
    assert!(result.changed);
    assert_eq!(result.deopt_table.deopt_point.len(), 2, "one deopt-point entry per live allocation");
    let mut targets: Vec<_> = result.deopt_table.deopt_point.iter().map(|e| e.target_reg).collect();
    targets.sort_by_key(|r| r.0);
    let mut expected = vec![a, b];
    expected.sort_by_key(|r| r.0);
    assert_eq!(targets, expected);
}

#[test]
fn an_allocation_not_live_at_a_deopt_point_gets_no_entry_for_it() {
    let mut host = MockHost::new();
    let ty = host.register_type(vec![AttrKind::Int], None);
    let entry = host.new_block();

    let obj = host.push_fastcreate(entry, ty);
    let src = host.unique_reg(RegKind::Int);
    host.push_bindattr(entry, obj, 0, src, AttrKind::Int);

    let _deopt_idx = host.push_other(entry, vec![], true).expect("may_deopt mints a deopt index");
    // nothing declared live across this deopt point.

    let result = run_partial_escape_analysis(&mut host).expect("analysis succeeds");
    assert!(result.changed);
    assert!(result.deopt_table.deopt_point.is_empty(), "no allocation was live at the deopt point");
}

#[test]
fn deopt_point_pins_every_captured_attribute_register_as_live() {
    // `usages_add_deopt` gets called twice for this allocation: once by the
    // analyzer for the original tracked register, and once per attribute
    // register by the `AddDeoptPoint` rewrite. Only the latter is new; check
    // for it by name rather than by count.
    let mut host = MockHost::new();
    let ty = host.register_type(vec![AttrKind::Int], None);
    let entry = host.new_block();

    let obj = host.push_fastcreate(entry, ty);
    let src = host.unique_reg(RegKind::Int);
    host.push_bindattr(entry, obj, 0, src, AttrKind::Int);

    let deopt_idx = host.push_other(entry, vec![], true).expect("may_deopt mints a deopt index");
    host.set_deopt_live(deopt_idx, &[obj]);
    host.push_other(entry, vec![obj], false);

    let mut analyzer = analyze(&mut host);
    let mut deopt = DeoptBridge::new();
    rewriter::rewrite(&mut host, &mut analyzer.tracker, &analyzer.ledger, &mut deopt).expect("rewrite succeeds");

    let attr_reg = analyzer.tracker.get(pea::ids::AllocId(0)).concrete_attr_regs[0].expect("attribute register assigned");
    assert!(
        host.deopt_usages(deopt_idx).iter().any(|op| op.reg == attr_reg),
        "the captured attribute register must be pinned live at the deopt point, not just the original tracked register"
    );
}

// -- property 7: single concrete-register assignment -------------------------

#[test]
fn each_attribute_is_assigned_a_concrete_register_at_most_once() {
    let mut host = MockHost::new();
    let ty = host.register_type(vec![AttrKind::Int], None);
    let entry = host.new_block();

    let obj = host.push_fastcreate(entry, ty);
    let src = host.unique_reg(RegKind::Int);
    host.push_bindattr(entry, obj, 0, src, AttrKind::Int);
    let r1 = host.push_getattr(entry, obj, 0, AttrKind::Int);
    let r2 = host.push_getattr(entry, obj, 0, AttrKind::Int);
    host.push_other(entry, vec![r1, r2], false);

    let tracker = analyze_and_rewrite(&mut host);
    let id = pea::ids::AllocId(0);
    assert_eq!(tracker.get(id).concrete_attr_regs.len(), 1);
    // Reading the same attribute twice must resolve to the same concrete
    // register both times, never a second, freshly minted one.
    let reg = tracker.get(id).concrete_attr_regs[0];
    assert!(reg.is_some(), "attribute was bound, so a concrete register must exist");
}

#[quickcheck]
fn concrete_register_assignment_is_stable_across_repeated_binds(n_binds: u8) {
    let n_binds = (n_binds % 5) + 1;
    let mut host = MockHost::new();
    let ty = host.register_type(vec![AttrKind::Int], None);
    let entry = host.new_block();

    let obj = host.push_fastcreate(entry, ty);
    for _ in 0..n_binds {
        let src = host.unique_reg(RegKind::Int);
        host.push_bindattr(entry, obj, 0, src, AttrKind::Int);
    }
    host.push_getattr(entry, obj, 0, AttrKind::Int);
    host.push_other(entry, vec![], false);

    let _tracker = analyze_and_rewrite(&mut host);
    // The first `n_binds` surviving `AliasMove`s are the rewritten binds,
    // each writing the attribute's one concrete register; the last is the
    // rewritten read, moving out of that same register. All of it must
    // funnel through one shared register, never a second one minted partway
    // through.
    let mut moves = Vec::new();
    for ins in host.instructions(entry) {
        let info = host.op_info(entry, ins).expect("instruction exists");
        if info.family == pea::host::OpFamily::AliasMove {
            moves.push(info);
        }
    }
    assert_eq!(moves.len() as u8, n_binds + 1, "one move per bind, plus one for the read");
    let bind_moves = &moves[..n_binds as usize];
    let read_move = &moves[n_binds as usize];

    let concrete_reg = bind_moves[0].writes.expect("bind rewrite always writes its concrete register").reg;
    for bind_move in bind_moves {
        assert_eq!(bind_move.writes.expect("bind rewrite always writes its concrete register").reg, concrete_reg);
    }
    assert_eq!(
        read_move.reads.first().expect("read rewrite always reads its concrete register").reg,
        concrete_reg,
        "the read must move out of the same register every bind wrote into"
    );
}

// -- property 1: soundness (spot check on the bigint devirtualization path) -

#[test]
fn bigint_add_keeps_agreeing_on_which_registers_feed_the_unboxed_op() {
    let mut host = MockHost::new();
    let bigint_ty = host.register_type(vec![AttrKind::BigInt], Some(0));
    let entry = host.new_block();

    let a = host.push_fastcreate(entry, bigint_ty);
    let b = host.push_fastcreate(entry, bigint_ty);
    let dst = host.push_bigint_binary(entry, BigIntOp::Add, a, b);
    host.push_other(entry, vec![dst], false);

    let before = host.instruction_count(entry);
    let result = run_partial_escape_analysis(&mut host).expect("analysis succeeds");
    assert!(result.changed);
    // Both fastcreates are gone (never escaped) and the add is replaced by
    // an unboxed op: net instruction count must shrink.
    let after = host.instruction_count(entry);
    assert!(after < before);
}
