//! C2: tracks every allocation under consideration for scalar replacement,
//! and the irreplaceability bit (with its transitive escape-dependency
//! propagation) that can retire one at any point during analysis.

use crate::host::Host;
use crate::ids::{AllocId, HypReg, RegKind};
use crate::repr::P6opaqueLayout;
use std::collections::HashMap;

/// Everything tracked about one candidate allocation. Lives for the whole
/// analysis, even after `irreplaceable` is set — the record stays around so
/// later blocks can still ask "was this ever a candidate" without the
/// index shifting underneath anyone holding an `AllocId`.
pub struct AllocationRecord<H: Host> {
    pub allocator: H::Ins,
    pub allocator_bb: H::Block,
    pub ty: H::Type,
    pub index: AllocId,
    pub hyp_attr_regs: Vec<HypReg>,
    pub attr_kinds: Vec<RegKind>,
    pub bigint: bool,
    /// Whether this record stands for a decomposed bigint op's still-scalar
    /// result rather than a real allocator instruction: `allocator` here is
    /// the arithmetic op itself, which the decompose transform that created
    /// this record already retires on its own. The rewriter's final
    /// allocator-cleanup pass must leave these alone.
    pub synthetic: bool,
    /// Set when a pre-existing `sp_materialize_bi` allocator was converted
    /// in place into an `UnmaterializeBi` move rather than left for the
    /// rewriter's final cleanup pass to delete outright.
    pub unmaterialize_bi_queued: bool,
    /// Set once any attribute of this allocation has been read.
    pub read: bool,
    pub irreplaceable: bool,
    /// Set when `irreplaceable` was set because this allocation was queued
    /// for materialization (forced into a real object somewhere). An
    /// allocation can also end up irreplaceable with this left `false` — an
    /// inconsistent cross-predecessor merge, say — in which case no
    /// materialization was ever queued for it and the rewriter must leave
    /// every transform already queued against it unapplied: the original
    /// allocator and attribute ops are the only valid way to rebuild it.
    pub materialized: bool,
    /// Allocations whose own replaceability depends transitively on this
    /// one remaining replaceable (e.g. an outer object holding this one in
    /// an attribute slot). A DAG, referenced by index rather than pointer.
    pub escape_dependencies: Vec<AllocId>,
    /// Concrete register backing each attribute, assigned lazily the first
    /// time a transform needs a real home for it.
    pub concrete_attr_regs: Vec<Option<H::Reg>>,
    /// Cached index into the deopt bridge's materialize-info table, once
    /// one has been built for this allocation.
    pub deopt_mat_idx: Option<u32>,
}

impl<H: Host> AllocationRecord<H> {
    pub fn num_attrs(&self) -> usize {
        self.attr_kinds.len()
    }
}

fn attr_kinds_from_layout(layout: &P6opaqueLayout) -> Vec<RegKind> {
    layout.attrs.iter().map(|k| k.reg_kind()).collect()
}

/// C2. Owns the dense `AllocId` space and the hypothetical register space
/// that rides alongside it (one hypothetical register per tracked
/// attribute, across every allocation).
pub struct AllocationTracker<H: Host> {
    pub allocations: Vec<AllocationRecord<H>>,
    /// Reverse lookup from a hypothetical register back to the allocation
    /// (and attribute index) that owns it, used when a materialization
    /// target names a hypothetical register that must resolve to a real
    /// one.
    hyp_owner: HashMap<HypReg, (AllocId, usize)>,
    next_hyp: u32,
}

impl<H: Host> AllocationTracker<H> {
    pub fn new() -> Self {
        Self { allocations: Vec::new(), hyp_owner: HashMap::new(), next_hyp: 0 }
    }

    fn alloc_hyp(&mut self, owner: AllocId, attr_index: usize) -> HypReg {
        let h = HypReg(self.next_hyp);
        self.next_hyp += 1;
        self.hyp_owner.insert(h, (owner, attr_index));
        h
    }

    pub fn hyp_owner(&self, hyp: HypReg) -> Option<(AllocId, usize)> {
        self.hyp_owner.get(&hyp).copied()
    }

    /// §4.2: try to track `alloc_ins` (whose destination has type `ty`) as a
    /// scalar-replacement candidate. Returns `None` (not an error: simply
    /// not a candidate) when the type isn't P6opaque-shaped, or an
    /// attribute's kind doesn't map onto a register this pass can hold.
    pub fn try_track(&mut self, host: &H, alloc_ins: H::Ins, allocator_bb: H::Block, ty: H::Type) -> Option<AllocId> {
        let layout = host.p6opaque_layout(ty)?;
        let attr_kinds = attr_kinds_from_layout(&layout);
        let bigint = layout.is_bigint_box();
        let index = AllocId(self.allocations.len() as u32);
        let hyp_attr_regs: Vec<HypReg> = (0..attr_kinds.len()).map(|i| self.alloc_hyp(index, i)).collect();
        let concrete_attr_regs = vec![None; attr_kinds.len()];
        self.allocations.push(AllocationRecord {
            allocator: alloc_ins,
            allocator_bb,
            ty,
            index,
            hyp_attr_regs,
            attr_kinds,
            bigint,
            synthetic: false,
            unmaterialize_bi_queued: false,
            read: false,
            irreplaceable: false,
            materialized: false,
            escape_dependencies: Vec::new(),
            concrete_attr_regs,
            deopt_mat_idx: None,
        });
        #[cfg(feature = "diagnostic-log")]
        tracing::trace!(alloc = index.0, "tracked candidate allocation");
        Some(index)
    }

    /// Tracks a synthetic single-attribute bigint allocation standing for
    /// the still-unboxed result of a decomposed bigint arithmetic op. Unlike
    /// [`try_track`](Self::try_track), this never consults the host's
    /// representation model: the shape (one `BigIntRef` attribute) is known
    /// a priori.
    pub fn track_synthetic_bigint(&mut self, allocator: H::Ins, allocator_bb: H::Block, ty: H::Type) -> AllocId {
        let index = AllocId(self.allocations.len() as u32);
        let hyp = self.alloc_hyp(index, 0);
        self.allocations.push(AllocationRecord {
            allocator,
            allocator_bb,
            ty,
            index,
            hyp_attr_regs: vec![hyp],
            attr_kinds: vec![RegKind::BigIntRef],
            bigint: true,
            synthetic: true,
            unmaterialize_bi_queued: false,
            read: false,
            irreplaceable: false,
            materialized: false,
            escape_dependencies: Vec::new(),
            concrete_attr_regs: vec![None],
            deopt_mat_idx: None,
        });
        #[cfg(feature = "diagnostic-log")]
        tracing::trace!(alloc = index.0, "tracked synthetic bigint result");
        index
    }

    pub fn get(&self, id: AllocId) -> &AllocationRecord<H> {
        &self.allocations[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: AllocId) -> &mut AllocationRecord<H> {
        &mut self.allocations[id.0 as usize]
    }

    pub fn is_irreplaceable(&self, id: AllocId) -> bool {
        self.allocations[id.0 as usize].irreplaceable
    }

    pub fn is_materialized(&self, id: AllocId) -> bool {
        self.allocations[id.0 as usize].materialized
    }

    /// Marks `id` irreplaceable *because* it was queued for materialization,
    /// as opposed to an inconsistent merge retiring it with nothing to
    /// rebuild it from. The rewriter uses this distinction to tell apart
    /// "this allocation's attribute rewrites are superseded by a
    /// materialization" from "this allocation's attribute rewrites must
    /// never have happened at all".
    pub fn mark_materialized(&mut self, id: AllocId) {
        self.mark_irreplaceable(id);
        self.allocations[id.0 as usize].materialized = true;
    }

    /// Marks `id` irreplaceable, and transitively every allocation whose
    /// replaceability depends on it, via an iterative walk over
    /// `escape_dependencies` (a DAG; the `irreplaceable` check on entry
    /// doubles as a visited guard so no cycle, were one to sneak in, could
    /// loop forever).
    pub fn mark_irreplaceable(&mut self, id: AllocId) {
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            let rec = &mut self.allocations[cur.0 as usize];
            if rec.irreplaceable {
                continue;
            }
            rec.irreplaceable = true;
            #[cfg(feature = "diagnostic-log")]
            tracing::trace!(alloc = cur.0, "marked irreplaceable");
            stack.extend(rec.escape_dependencies.iter().copied());
        }
    }

    /// Records that `dependent`'s replaceability depends on `of` remaining
    /// replaceable: if `of` is ever marked irreplaceable, `dependent` is
    /// too.
    pub fn add_escape_dependency(&mut self, of: AllocId, dependent: AllocId) {
        self.allocations[of.0 as usize].escape_dependencies.push(dependent);
    }
}

impl<H: Host> Default for AllocationTracker<H> {
    fn default() -> Self {
        Self::new()
    }
}
