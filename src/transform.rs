//! C5: the transform ledger. Every rewrite the analyzer decides on is
//! recorded as a `Transform` here rather than applied immediately; a
//! separate rewriter pass (C7) walks the ledger afterwards and applies them
//! in queued order.
//!
//! Transforms are shared via `Rc` rather than cloned: the same transform
//! can be reachable from more than one basic block's per-allocation merge
//! state (e.g. a materialization performed on one path, observed again when
//! a later block merges its predecessors), and identity — not value equality
//! — is what distinguishes "the same edit, seen twice" from "two edits that
//! happen to look alike".

use crate::host::{BigIntOp, Host, Operand};
use crate::ids::{AllocId, DeoptIdx, HypReg, SlotIdx, TransformId};
use std::collections::HashMap;
use std::rc::Rc;

/// One of the materialization targets of a `Materialize` transform: either
/// a concrete register a live use already names, or a hypothetical register
/// that must first be resolved to a concrete one (allocating it lazily if
/// this is the first transform to need it).
pub enum MaterializationTarget<H: Host> {
    Concrete(Operand<H::Reg>),
    Hypothetical(HypReg),
}

/// A queued graph edit. Every transform names the allocation it pertains to
/// (absent for the relational-bigint decomposition, which produces no
/// allocation of its own) plus a payload chosen from the kinds below.
pub struct Transform<H: Host> {
    pub id: TransformId,
    pub allocation: Option<AllocId>,
    pub kind: TransformKind<H>,
}

pub enum TransformKind<H: Host> {
    /// Rewrites a `GETATTR_TO_SET`-eligible read into a direct alias of the
    /// attribute's (hypothetical, eventually concrete) register, deleting
    /// the original attribute read.
    GetattrToSet { ins: H::Ins, dest: Operand<H::Reg>, hyp_reg: HypReg },
    /// Rewrites a bind into a direct write of the attribute's register,
    /// deleting the original bind.
    BindattrToSet { ins: H::Ins, hyp_reg: HypReg, value: Operand<H::Reg> },
    /// Settifies a `guardconc` that shadow facts already proved will pass:
    /// rewritten into a plain alias move.
    GuardToSet { ins: H::Ins, dest: Operand<H::Reg>, source: Operand<H::Reg> },
    /// Adds a deopt-point entry so a live scalar-replaced allocation can be
    /// materialized on the corresponding deopt path, and pins the current
    /// version of every attribute register already captured for it so a
    /// downstream liveness pass can't treat them as dead beforehand.
    AddDeoptPoint { deopt_idx: DeoptIdx, allocation: AllocId, target: Operand<H::Reg> },
    /// Rewrites a `prof_allocated` hook on an allocation that no longer
    /// exists as a real object into a type-only profiling variant.
    ProfAllocated { ins: H::Ins },
    /// An auto-vivifying read whose attribute was never written: conjures
    /// the type object itself into the attribute's register.
    VivifyType { ins: H::Ins, dest: Operand<H::Reg>, hyp_reg: HypReg, type_slot: SlotIdx },
    /// Same as `VivifyType`, but the read demands a fresh concrete instance
    /// rather than the type object itself.
    VivifyConcrete { ins: H::Ins, dest: Operand<H::Reg>, hyp_reg: HypReg, type_slot: SlotIdx },
    /// Rewrites a `decont_i` reading a tracked bigint box's container into a
    /// direct read of the scalar-replaced bigint register.
    UnboxBigint { ins: H::Ins, dest: Operand<H::Reg>, hyp_reg: HypReg },
    /// Deletes a `set`/trivial-PHI aliasing a tracked allocation: the alias
    /// is fully absorbed into the shadow facts table, so the instruction
    /// itself carries no further meaning.
    DeleteSet { ins: H::Ins },
    /// Converts a pre-existing `sp_materialize_bi` into a move of its
    /// already-unboxed source operand straight into the allocation's bigint
    /// attribute register, rather than deleting it and losing that value.
    UnmaterializeBi { ins: H::Ins, hyp_reg: HypReg, unboxed: Operand<H::Reg> },
    /// Decomposes a binary bigint arithmetic op into an unboxed-register
    /// operation. Both operands are hypothetical registers belonging to
    /// tracked bigint boxes; `result_hyp` is the synthetic allocation
    /// created to hold the (still scalar) result.
    DecomposeBigintBinary { ins: H::Ins, op: BigIntOp, lhs: HypReg, rhs: HypReg, result_hyp: HypReg },
    /// Decomposes a unary bigint arithmetic op.
    DecomposeBigintUnary { ins: H::Ins, op: BigIntOp, operand: HypReg, result_hyp: HypReg },
    /// Decomposes a relational bigint comparison; produces a plain boolean
    /// written directly into `dest`, not a new allocation.
    DecomposeBigintRelational { ins: H::Ins, op: BigIntOp, lhs: HypReg, rhs: HypReg, dest: Operand<H::Reg> },
    /// Materializes one or more tracked allocations into real objects
    /// immediately before `prior_to` (which has already been walked
    /// backwards past any argument-preparation opcodes).
    Materialize { prior_to: H::Ins, targets: Vec<(AllocId, MaterializationTarget<H>)> },
}

/// C5. Owns `TransformId` allocation and the per-block queues the rewriter
/// later drains in block-linear order.
pub struct TransformLedger<H: Host> {
    next_id: u32,
    per_block: HashMap<H::Block, Vec<Rc<Transform<H>>>>,
}

impl<H: Host> TransformLedger<H> {
    pub fn new() -> Self {
        Self { next_id: 0, per_block: HashMap::new() }
    }

    pub fn push(&mut self, block: H::Block, allocation: Option<AllocId>, kind: TransformKind<H>) -> Rc<Transform<H>> {
        let id = TransformId(self.next_id);
        self.next_id += 1;
        let t = Rc::new(Transform { id, allocation, kind });
        self.per_block.entry(block).or_default().push(Rc::clone(&t));
        #[cfg(feature = "diagnostic-log")]
        tracing::trace!(transform = id.0, "queued transform");
        t
    }

    pub fn for_block(&self, block: H::Block) -> &[Rc<Transform<H>>] {
        self.per_block.get(&block).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.per_block.values().all(|v| v.is_empty())
    }
}

impl<H: Host> Default for TransformLedger<H> {
    fn default() -> Self {
        Self::new()
    }
}
