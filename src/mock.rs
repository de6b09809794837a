//! An in-memory [`Host`] implementation and a small graph-builder API, used
//! by this crate's own tests (`tests/scenarios.rs`, `tests/properties.rs`).
//! Gated behind `test-support` so it never ships as part of a normal build.
//!
//! Graphs built with [`MockHost`] are assumed acyclic in the CFG sense: the
//! builder only ever appends blocks, and block creation order is used
//! directly as both reverse-postorder and linear order. That's enough to
//! exercise every non-loop scenario this pass cares about without needing a
//! real dominance computation.

use crate::error::PeaError;
use crate::host::{BigIntOp, Host, HostFacts, Op, OpFamily, OpInfo, Operand, SlotValue};
use crate::ids::{DeoptIdx, RegKind, SlotIdx, Version};
use crate::repr::{AttrKind, P6opaqueLayout, ReprId, StorageSpec};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MReg(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MIns(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MBlock(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MType(pub u32);

#[derive(Clone)]
struct TypeInfo {
    layout: Option<P6opaqueLayout>,
    storage: StorageSpec,
    int_cache_idx: Option<u16>,
}

impl Default for TypeInfo {
    fn default() -> Self {
        TypeInfo { layout: None, storage: StorageSpec { boxed_primitive: false, bits: 0, is_unsigned: false }, int_cache_idx: None }
    }
}

#[derive(Default)]
struct BlockData {
    order: Vec<MIns>,
    preds: Vec<MBlock>,
}

/// In-memory, hand-built CFG implementing [`Host`]. Every `push_*`/`new_*`
/// method is part of the test-authoring surface; the `Host` trait methods
/// below are what the pass itself calls.
#[derive(Default)]
pub struct MockHost {
    blocks: Vec<BlockData>,
    instrs: HashMap<MIns, OpInfo<MReg, MType>>,
    next_ins: u32,
    next_reg: u32,
    next_type: u32,
    next_deopt: u32,
    versions: HashMap<MReg, u32>,
    host_facts: HashMap<(MReg, u32), HostFacts<MType>>,
    usages: HashMap<(MReg, u32), Vec<MIns>>,
    deopt_usages: HashMap<i32, Vec<Operand<MReg>>>,
    deopt_live: HashMap<i32, Vec<Operand<MReg>>>,
    slots: Vec<SlotValue<MType>>,
    types: HashMap<MType, TypeInfo>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn operand(&self, reg: MReg) -> Operand<MReg> {
        Operand::new(reg, Version(*self.versions.get(&reg).unwrap_or(&0)))
    }

    fn fresh_reg(&mut self) -> MReg {
        let r = MReg(self.next_reg);
        self.next_reg += 1;
        self.versions.insert(r, 0);
        r
    }

    fn push(&mut self, block: MBlock, info: OpInfo<MReg, MType>) -> MIns {
        let id = MIns(self.next_ins);
        self.next_ins += 1;
        self.instrs.insert(id, info);
        self.blocks[block.0 as usize].order.push(id);
        id
    }

    // -- graph construction -------------------------------------------------

    pub fn new_block(&mut self) -> MBlock {
        let id = MBlock(self.blocks.len() as u32);
        self.blocks.push(BlockData::default());
        id
    }

    pub fn add_edge(&mut self, from: MBlock, to: MBlock) {
        self.blocks[to.0 as usize].preds.push(from);
    }

    /// Registers a P6opaque-shaped type. `offset == index` for every
    /// attribute, which keeps test graphs free of arbitrary layout math.
    pub fn register_type(&mut self, attrs: Vec<AttrKind>, bigint_attr_index: Option<usize>) -> MType {
        let id = MType(self.next_type);
        self.next_type += 1;
        self.types.insert(id, TypeInfo { layout: Some(P6opaqueLayout { attrs, bigint_attr_index }), ..Default::default() });
        id
    }

    /// Registers a non-P6opaque type (never a scalar-replacement candidate).
    pub fn register_opaque_type(&mut self) -> MType {
        let id = MType(self.next_type);
        self.next_type += 1;
        self.types.insert(id, TypeInfo::default());
        id
    }

    pub fn set_int_cache_index(&mut self, ty: MType, idx: u16) {
        self.types.entry(ty).or_default().int_cache_idx = Some(idx);
    }

    pub fn push_fastcreate(&mut self, block: MBlock, ty: MType) -> MReg {
        let dst = self.fresh_reg();
        let slot = self.add_spesh_slot(SlotValue::Type(ty));
        self.push(
            block,
            OpInfo {
                family: OpFamily::FastCreate,
                may_deopt: false,
                deopt_idx: None,
                reads: vec![],
                writes: Some(self.operand(dst)),
                object_operand: None,
                attr_offset: None,
                guarded_type_slot: None,
                alloc_type_slot: Some(slot),
                alloc_type: Some(ty),
            },
        );
        dst
    }

    pub fn push_bindattr(&mut self, block: MBlock, obj: MReg, index: u32, val: MReg, kind: AttrKind) {
        self.push(
            block,
            OpInfo {
                family: OpFamily::BindAttr(kind),
                may_deopt: false,
                deopt_idx: None,
                reads: vec![self.operand(val)],
                writes: None,
                object_operand: Some(self.operand(obj)),
                attr_offset: Some(index),
                guarded_type_slot: None,
                alloc_type_slot: None,
                alloc_type: None,
            },
        );
    }

    pub fn push_getattr(&mut self, block: MBlock, obj: MReg, index: u32, kind: AttrKind) -> MReg {
        let dst = self.fresh_reg();
        self.push(
            block,
            OpInfo {
                family: OpFamily::GetAttr(kind),
                may_deopt: false,
                deopt_idx: None,
                reads: vec![self.operand(obj)],
                writes: Some(self.operand(dst)),
                object_operand: Some(self.operand(obj)),
                attr_offset: Some(index),
                guarded_type_slot: None,
                alloc_type_slot: None,
                alloc_type: None,
            },
        );
        dst
    }

    pub fn push_guardconc(&mut self, block: MBlock, src: MReg, wanted: MType) -> MReg {
        let dst = self.fresh_reg();
        let slot = self.add_spesh_slot(SlotValue::Type(wanted));
        self.push(
            block,
            OpInfo {
                family: OpFamily::GuardConc,
                may_deopt: false,
                deopt_idx: None,
                reads: vec![self.operand(src)],
                writes: Some(self.operand(dst)),
                object_operand: None,
                attr_offset: None,
                guarded_type_slot: Some(slot),
                alloc_type_slot: None,
                alloc_type: None,
            },
        );
        dst
    }

    pub fn push_prof_allocated(&mut self, block: MBlock, obj: MReg) {
        self.push(
            block,
            OpInfo {
                family: OpFamily::ProfAllocated,
                may_deopt: false,
                deopt_idx: None,
                reads: vec![self.operand(obj)],
                writes: None,
                object_operand: Some(self.operand(obj)),
                attr_offset: None,
                guarded_type_slot: None,
                alloc_type_slot: None,
                alloc_type: None,
            },
        );
    }

    /// A test-authored `set`/trivial-PHI aliasing `src`, distinct from the
    /// `Op::Move` the rewriter synthesizes through [`Host::insert_ins_before`].
    pub fn push_set(&mut self, block: MBlock, src: MReg) -> MReg {
        let dst = self.fresh_reg();
        self.push(
            block,
            OpInfo {
                family: OpFamily::AliasMove,
                may_deopt: false,
                deopt_idx: None,
                reads: vec![self.operand(src)],
                writes: Some(self.operand(dst)),
                object_operand: None,
                attr_offset: None,
                guarded_type_slot: None,
                alloc_type_slot: None,
                alloc_type: None,
            },
        );
        dst
    }

    /// An auto-vivifying attribute read (`sp_getvt_o`/`sp_getvc_o`).
    /// `default_ty` is the type whose default value gets conjured when the
    /// attribute was never written.
    pub fn push_vivifying_get(&mut self, block: MBlock, obj: MReg, index: u32, kind: AttrKind, concrete: bool, default_ty: MType) -> MReg {
        let dst = self.fresh_reg();
        let slot = self.add_spesh_slot(SlotValue::Type(default_ty));
        self.push(
            block,
            OpInfo {
                family: OpFamily::VivifyingGet { kind, concrete },
                may_deopt: false,
                deopt_idx: None,
                reads: vec![self.operand(obj)],
                writes: Some(self.operand(dst)),
                object_operand: Some(self.operand(obj)),
                attr_offset: Some(index),
                guarded_type_slot: None,
                alloc_type_slot: Some(slot),
                alloc_type: None,
            },
        );
        dst
    }

    /// A pre-existing `sp_materialize_bi` allocator, boxing `unboxed` into a
    /// fresh instance of `ty`.
    pub fn push_materialize_bi(&mut self, block: MBlock, ty: MType, unboxed: MReg) -> MReg {
        let dst = self.fresh_reg();
        let slot = self.add_spesh_slot(SlotValue::Type(ty));
        self.push(
            block,
            OpInfo {
                family: OpFamily::MaterializeBi,
                may_deopt: false,
                deopt_idx: None,
                reads: vec![self.operand(unboxed)],
                writes: Some(self.operand(dst)),
                object_operand: None,
                attr_offset: None,
                guarded_type_slot: None,
                alloc_type_slot: Some(slot),
                alloc_type: Some(ty),
            },
        );
        dst
    }

    pub fn push_decont_i(&mut self, block: MBlock, obj: MReg) -> MReg {
        let dst = self.fresh_reg();
        self.push(
            block,
            OpInfo {
                family: OpFamily::DecontI,
                may_deopt: false,
                deopt_idx: None,
                reads: vec![self.operand(obj)],
                writes: Some(self.operand(dst)),
                object_operand: Some(self.operand(obj)),
                attr_offset: None,
                guarded_type_slot: None,
                alloc_type_slot: None,
                alloc_type: None,
            },
        );
        dst
    }

    fn push_bigint_op(&mut self, block: MBlock, family: OpFamily, reads: Vec<MReg>) -> MReg {
        let dst = self.fresh_reg();
        let reads = reads.iter().map(|r| self.operand(*r)).collect();
        self.push(
            block,
            OpInfo {
                family,
                may_deopt: false,
                deopt_idx: None,
                reads,
                writes: Some(self.operand(dst)),
                object_operand: None,
                attr_offset: None,
                guarded_type_slot: None,
                alloc_type_slot: None,
                alloc_type: None,
            },
        );
        dst
    }

    pub fn push_bigint_binary(&mut self, block: MBlock, op: BigIntOp, lhs: MReg, rhs: MReg) -> MReg {
        self.push_bigint_op(block, OpFamily::BigIntBinary(op), vec![lhs, rhs])
    }

    pub fn push_bigint_unary(&mut self, block: MBlock, op: BigIntOp, operand: MReg) -> MReg {
        self.push_bigint_op(block, OpFamily::BigIntUnary(op), vec![operand])
    }

    pub fn push_bigint_relational(&mut self, block: MBlock, op: BigIntOp, lhs: MReg, rhs: MReg) -> MReg {
        self.push_bigint_op(block, OpFamily::BigIntRelational(op), vec![lhs, rhs])
    }

    pub fn push_phi(&mut self, block: MBlock, inputs: Vec<MReg>) -> MReg {
        let dst = self.fresh_reg();
        let reads = inputs.iter().map(|r| self.operand(*r)).collect();
        self.push(
            block,
            OpInfo {
                family: OpFamily::Phi,
                may_deopt: false,
                deopt_idx: None,
                reads,
                writes: Some(self.operand(dst)),
                object_operand: None,
                attr_offset: None,
                guarded_type_slot: None,
                alloc_type_slot: None,
                alloc_type: None,
            },
        );
        dst
    }

    pub fn push_argprep(&mut self, block: MBlock, reg: MReg) {
        self.push(
            block,
            OpInfo {
                family: OpFamily::ArgPrep,
                may_deopt: false,
                deopt_idx: None,
                reads: vec![self.operand(reg)],
                writes: None,
                object_operand: None,
                attr_offset: None,
                guarded_type_slot: None,
                alloc_type_slot: None,
                alloc_type: None,
            },
        );
    }

    /// An opaque, not-specially-understood instruction (`invoke_o` and
    /// friends). `may_deopt` mints a fresh [`DeoptIdx`]; use
    /// [`Self::set_deopt_live`] afterwards to say what's live across it.
    pub fn push_other(&mut self, block: MBlock, reads: Vec<MReg>, may_deopt: bool) -> Option<DeoptIdx> {
        let deopt_idx = if may_deopt {
            let idx = DeoptIdx(self.next_deopt as i32);
            self.next_deopt += 1;
            Some(idx)
        } else {
            None
        };
        let reads = reads.iter().map(|r| self.operand(*r)).collect();
        self.push(
            block,
            OpInfo {
                family: OpFamily::Other,
                may_deopt,
                deopt_idx,
                reads,
                writes: None,
                object_operand: None,
                attr_offset: None,
                guarded_type_slot: None,
                alloc_type_slot: None,
                alloc_type: None,
            },
        );
        deopt_idx
    }

    /// Declares that `regs` (at their current version) are live across
    /// `deopt_idx`, as a real host's usage table would report.
    pub fn set_deopt_live(&mut self, deopt_idx: DeoptIdx, regs: &[MReg]) {
        let ops = regs.iter().map(|r| self.operand(*r)).collect();
        self.deopt_live.insert(deopt_idx.0, ops);
    }

    pub fn instruction_count(&self, block: MBlock) -> usize {
        self.blocks[block.0 as usize].order.len()
    }

    pub fn deopt_usages(&self, deopt_idx: DeoptIdx) -> &[Operand<MReg>] {
        self.deopt_usages.get(&deopt_idx.0).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

fn op_to_info(host: &mut MockHost, op: Op<MReg>) -> OpInfo<MReg, MType> {
    match op {
        Op::Move { dst, src } => OpInfo {
            family: OpFamily::AliasMove,
            may_deopt: false,
            deopt_idx: None,
            reads: vec![host.operand(src)],
            writes: Some(host.operand(dst)),
            object_operand: None,
            attr_offset: None,
            guarded_type_slot: None,
            alloc_type_slot: None,
            alloc_type: None,
        },
        Op::FastCreate { dst, type_slot } => OpInfo {
            family: OpFamily::FastCreate,
            may_deopt: false,
            deopt_idx: None,
            reads: vec![],
            writes: Some(host.operand(dst)),
            object_operand: None,
            attr_offset: None,
            guarded_type_slot: None,
            alloc_type_slot: Some(type_slot),
            alloc_type: host.slot_type(type_slot),
        },
        Op::BindAttr { obj, offset, val, kind } => OpInfo {
            family: OpFamily::BindAttr(kind),
            may_deopt: false,
            deopt_idx: None,
            reads: vec![host.operand(val)],
            writes: None,
            object_operand: Some(host.operand(obj)),
            attr_offset: Some(offset),
            guarded_type_slot: None,
            alloc_type_slot: None,
            alloc_type: None,
        },
        Op::MaterializeBi { dst, type_slot, offset, unboxed, int_cache_type_idx: _ } => OpInfo {
            family: OpFamily::MaterializeBi,
            may_deopt: false,
            deopt_idx: None,
            reads: vec![host.operand(unboxed)],
            writes: Some(host.operand(dst)),
            object_operand: None,
            attr_offset: Some(offset),
            guarded_type_slot: None,
            alloc_type_slot: Some(type_slot),
            alloc_type: host.slot_type(type_slot),
        },
        Op::TakeBigint { dst, obj, offset } => OpInfo {
            family: OpFamily::Other,
            may_deopt: false,
            deopt_idx: None,
            reads: vec![host.operand(obj)],
            writes: Some(host.operand(dst)),
            object_operand: Some(host.operand(obj)),
            attr_offset: Some(offset),
            guarded_type_slot: None,
            alloc_type_slot: None,
            alloc_type: None,
        },
        Op::VivifyDefault { dst, type_slot, concrete: _ } => OpInfo {
            family: OpFamily::Other,
            may_deopt: false,
            deopt_idx: None,
            reads: vec![],
            writes: Some(host.operand(dst)),
            object_operand: None,
            attr_offset: None,
            guarded_type_slot: None,
            alloc_type_slot: Some(type_slot),
            alloc_type: host.slot_type(type_slot),
        },
        Op::ProfReplaced { type_slot } => OpInfo {
            family: OpFamily::Other,
            may_deopt: false,
            deopt_idx: None,
            reads: vec![],
            writes: None,
            object_operand: None,
            attr_offset: None,
            guarded_type_slot: None,
            alloc_type_slot: Some(type_slot),
            alloc_type: host.slot_type(type_slot),
        },
        Op::UnboxedBigintOp { op, dst, args } => OpInfo {
            family: match dst {
                Some(_) if args.len() == 2 => OpFamily::BigIntBinary(op),
                Some(_) => OpFamily::BigIntUnary(op),
                None => OpFamily::BigIntRelational(op),
            },
            may_deopt: false,
            deopt_idx: None,
            reads: args.iter().map(|r| host.operand(*r)).collect(),
            writes: dst.map(|d| host.operand(d)),
            object_operand: None,
            attr_offset: None,
            guarded_type_slot: None,
            alloc_type_slot: None,
            alloc_type: None,
        },
    }
}

impl Host for MockHost {
    type Reg = MReg;
    type Ins = MIns;
    type Block = MBlock;
    type Type = MType;

    fn facts(&self, operand: Operand<Self::Reg>) -> Option<HostFacts<Self::Type>> {
        self.host_facts.get(&(operand.reg, operand.version.0)).copied()
    }

    fn new_version(&mut self, reg: Self::Reg) -> Version {
        let v = self.versions.entry(reg).or_insert(0);
        *v += 1;
        Version(*v)
    }

    fn current_version(&self, reg: Self::Reg) -> Version {
        Version(*self.versions.get(&reg).unwrap_or(&0))
    }

    fn unique_reg(&mut self, kind: RegKind) -> Self::Reg {
        let _ = kind;
        self.fresh_reg()
    }

    fn insert_ins_before(&mut self, block: Self::Block, anchor: Self::Ins, op: Op<Self::Reg>) -> Self::Ins {
        let info = op_to_info(self, op);
        let id = MIns(self.next_ins);
        self.next_ins += 1;
        self.instrs.insert(id, info);
        let order = &mut self.blocks[block.0 as usize].order;
        let pos = order.iter().position(|&i| i == anchor).unwrap_or(order.len());
        order.insert(pos, id);
        id
    }

    fn delete_ins(&mut self, block: Self::Block, ins: Self::Ins) {
        self.blocks[block.0 as usize].order.retain(|&i| i != ins);
        self.instrs.remove(&ins);
    }

    fn usages_add(&mut self, operand: Operand<Self::Reg>, user: Self::Ins) {
        self.usages.entry((operand.reg, operand.version.0)).or_default().push(user);
    }

    fn usages_delete(&mut self, operand: Operand<Self::Reg>, user: Self::Ins) {
        if let Some(v) = self.usages.get_mut(&(operand.reg, operand.version.0)) {
            v.retain(|&i| i != user);
        }
    }

    fn usages_add_deopt(&mut self, operand: Operand<Self::Reg>, deopt_idx: DeoptIdx) {
        self.deopt_usages.entry(deopt_idx.0).or_default().push(operand);
    }

    fn add_spesh_slot(&mut self, value: SlotValue<Self::Type>) -> SlotIdx {
        let idx = SlotIdx(self.slots.len() as u32);
        self.slots.push(value);
        idx
    }

    fn slot_type(&self, slot: SlotIdx) -> Option<Self::Type> {
        match self.slots.get(slot.0 as usize) {
            Some(SlotValue::Type(t)) => Some(*t),
            None => None,
        }
    }

    fn op_info(&self, block: Self::Block, ins: Self::Ins) -> Result<OpInfo<Self::Reg, Self::Type>, PeaError> {
        let _ = block;
        self.instrs
            .get(&ins)
            .cloned()
            .ok_or_else(|| PeaError::IrOops { detail: format!("no such instruction {:?}", ins) })
    }

    fn reverse_postorder(&self) -> Vec<Self::Block> {
        (0..self.blocks.len() as u32).map(MBlock).collect()
    }

    fn linear_order(&self) -> Vec<Self::Block> {
        self.reverse_postorder()
    }

    fn predecessors(&self, block: Self::Block) -> Vec<Self::Block> {
        self.blocks[block.0 as usize].preds.clone()
    }

    fn instructions(&self, block: Self::Block) -> Vec<Self::Ins> {
        self.blocks[block.0 as usize].order.clone()
    }

    fn live_at_deopt(&self, deopt_idx: DeoptIdx) -> Vec<Operand<Self::Reg>> {
        self.deopt_live.get(&deopt_idx.0).cloned().unwrap_or_default()
    }

    fn repr_id(&self, ty: Self::Type) -> ReprId {
        ReprId(ty.0)
    }

    fn p6opaque_layout(&self, ty: Self::Type) -> Option<P6opaqueLayout> {
        self.types.get(&ty).and_then(|t| t.layout.clone())
    }

    fn attr_index(&self, ty: Self::Type, offset: u32) -> Option<usize> {
        let layout = self.types.get(&ty)?.layout.as_ref()?;
        let idx = offset as usize;
        if idx < layout.attrs.len() {
            Some(idx)
        } else {
            None
        }
    }

    fn attr_offset(&self, ty: Self::Type, index: usize) -> Option<u32> {
        let layout = self.types.get(&ty)?.layout.as_ref()?;
        if index < layout.attrs.len() {
            Some(index as u32)
        } else {
            None
        }
    }

    fn storage_spec(&self, ty: Self::Type) -> StorageSpec {
        self.types.get(&ty).map(|t| t.storage).unwrap_or(StorageSpec { boxed_primitive: false, bits: 0, is_unsigned: false })
    }

    fn int_cache_type_index(&self, ty: Self::Type) -> Option<u16> {
        self.types.get(&ty).and_then(|t| t.int_cache_idx)
    }
}
