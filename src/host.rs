//! The IR-facing facade: every way this pass reaches out to the embedding
//! compiler. The pass owns no instruction set, no object model and no
//! bytecode loader of its own — it only ever acts through a `Host`.
//!
//! This mirrors the regalloc2/cranelift style of putting the compiler's own
//! types behind a trait with associated types, so the pass can be compiled
//! and tested (see [`crate::mock`]) without linking a real compiler at all.

use crate::error::PeaError;
use crate::ids::{DeoptIdx, RegKind, SlotIdx, Version};
use crate::repr::{P6opaqueLayout, ReprId, StorageSpec};
use std::fmt::Debug;
use std::hash::Hash;

/// A value at a program point: a register plus the SSA version it carries
/// there. This is the unit the analyzer reasons about when it asks the host
/// for facts, or records a usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Operand<R> {
    pub reg: R,
    pub version: Version,
}

impl<R> Operand<R> {
    pub fn new(reg: R, version: Version) -> Self {
        Operand { reg, version }
    }
}

/// The host's own (non-shadow) per-value facts: whatever type inference and
/// earlier optimizations have already proven about a register at a given
/// version.
#[derive(Debug, Clone, Copy)]
pub struct HostFacts<T> {
    pub known_type: Option<T>,
    pub concrete: bool,
}

/// A big-integer operation's arity/shape, used to classify `BigIntBinary`/
/// `BigIntUnary`/`BigIntRelational` opcode families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BigIntOp {
    Add,
    Sub,
    Mul,
    Gcd,
    Neg,
    Abs,
    Cmp,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Coarse classification of an opcode, as handed out by the host's
/// instruction-set dictionary (itself out of scope for this crate).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpFamily {
    /// `sp_fastcreate`: allocates a fresh, all-attributes-unset instance.
    FastCreate,
    /// `sp_materialize_bi`: the single-instruction big-integer box+write.
    MaterializeBi,
    /// `set`, or a single-live-input PHI: a pure alias.
    AliasMove,
    GetAttr(crate::repr::AttrKind),
    BindAttr(crate::repr::AttrKind),
    /// An auto-vivifying attribute read (`sp_getvt_o`/`sp_getvc_o` and
    /// friends): produces a default value the first time an attribute is
    /// read unbound. `concrete` distinguishes the `*vc_o` opcodes (which
    /// clone a fresh instance of the type) from the `*vt_o` ones (which
    /// hand back the type object itself).
    VivifyingGet { kind: crate::repr::AttrKind, concrete: bool },
    BigIntBinary(BigIntOp),
    BigIntUnary(BigIntOp),
    BigIntRelational(BigIntOp),
    /// `decont_i`: unboxes a possibly-containerized integer.
    DecontI,
    /// `prof_allocated`: allocation-profiling hook; has no real effect on
    /// values and is deleted outright when its allocation is replaced.
    ProfAllocated,
    /// `guardconc`: a concreteness/type guard that may deoptimize.
    GuardConc,
    /// A PHI merging two or more live inputs.
    Phi,
    /// An `arg_*`/`argconst_*` opcode preparing a call's argument list. The
    /// rewriter must never insert a materialization between one of these
    /// and the call it feeds.
    ArgPrep,
    /// Anything not covered above. Any use of a tracked value inside one of
    /// these opcodes forces a real object into existence.
    Other,
}

/// Per-instruction metadata the host's instruction-set dictionary provides.
/// Generic directly over `Reg`/`Type` (rather than over a whole `Host`) so
/// it derives `Debug`/`Clone` without dragging in spurious bounds on the
/// host type itself.
#[derive(Debug, Clone)]
pub struct OpInfo<Reg, Type> {
    pub family: OpFamily,
    /// Whether this instruction can deoptimize (and therefore has a
    /// `deopt_idx`/live-registers entry the deopt bridge must account for).
    pub may_deopt: bool,
    pub deopt_idx: Option<DeoptIdx>,
    /// Registers this instruction reads, in operand order.
    pub reads: Vec<Operand<Reg>>,
    /// The register this instruction writes, if any.
    pub writes: Option<Operand<Reg>>,
    /// For attribute ops: which read operand holds the object, and the
    /// attribute's byte offset within it.
    pub object_operand: Option<Operand<Reg>>,
    pub attr_offset: Option<u32>,
    /// For `guardconc`: the spesh slot holding the guarded type.
    pub guarded_type_slot: Option<SlotIdx>,
    /// For `sp_fastcreate`/`sp_materialize_bi`: the type being allocated.
    pub alloc_type_slot: Option<SlotIdx>,
    pub alloc_type: Option<Type>,
}

impl<Reg, Type> OpInfo<Reg, Type> {
    pub fn is_arg_prep(&self) -> bool {
        matches!(self.family, OpFamily::ArgPrep)
    }
}

/// A graph edit the rewriter can ask the host to materialize as a real
/// instruction. Kept deliberately small: only the handful of shapes this
/// pass ever needs to synthesize.
#[derive(Debug, Clone)]
pub enum Op<R> {
    /// A pure register-to-register alias (`set`).
    Move { dst: R, src: R },
    /// `sp_fastcreate`: allocate a fresh instance of the type in `type_slot`.
    FastCreate { dst: R, type_slot: SlotIdx },
    /// Bind a value into an attribute offset of a freshly created object.
    BindAttr {
        obj: R,
        offset: u32,
        val: R,
        kind: crate::repr::AttrKind,
    },
    /// The combined box+write op used for single-attribute bigint boxes.
    MaterializeBi {
        dst: R,
        type_slot: SlotIdx,
        offset: u32,
        unboxed: R,
        int_cache_type_idx: u16,
    },
    /// Unboxes a bigint attribute out of a concrete object into a register
    /// an arithmetic instruction can consume directly.
    TakeBigint { dst: R, obj: R, offset: u32 },
    /// Conjures an auto-vivified attribute's default value (the type object
    /// itself, or a fresh clone of it when `concrete`) straight into `dst`.
    VivifyDefault { dst: R, type_slot: SlotIdx, concrete: bool },
    /// `prof_replaced`: what a `prof_allocated` profiling hook becomes once
    /// its allocation is scalar-replaced — it names the type directly
    /// rather than carrying a value to profile.
    ProfReplaced { type_slot: SlotIdx },
    /// An unboxed-bigint binary/unary/relational arithmetic instruction,
    /// operating directly on unboxed registers instead of boxed objects.
    UnboxedBigintOp {
        op: BigIntOp,
        dst: Option<R>,
        args: Vec<R>,
    },
}

/// A single value the host's constant pool can hold. Only type descriptors
/// are ever added by this pass.
#[derive(Debug, Clone, Copy)]
pub enum SlotValue<T> {
    Type(T),
}

/// The single external interface this pass is built against. A real
/// embedding compiler implements this over its own IR; [`crate::mock`]
/// implements it over an in-memory graph for this crate's own tests.
pub trait Host {
    type Reg: Copy + Eq + Hash + Debug;
    type Ins: Copy + Eq + Hash + Debug;
    type Block: Copy + Eq + Hash + Debug;
    type Type: Copy + Eq + Hash + Debug;

    /// The host's own facts for `operand` (not this pass's shadow facts).
    fn facts(&self, operand: Operand<Self::Reg>) -> Option<HostFacts<Self::Type>>;

    /// Mints a fresh SSA version for `reg`, as when a transform gives it a
    /// new definition.
    fn new_version(&mut self, reg: Self::Reg) -> Version;

    /// The version `reg` currently carries at the point the caller is
    /// working at.
    fn current_version(&self, reg: Self::Reg) -> Version;

    /// Allocates a brand-new register of the given kind, never before used
    /// in the graph. Used to lazily give a scalar-replaced attribute a
    /// concrete home the first time a transform needs one.
    fn unique_reg(&mut self, kind: RegKind) -> Self::Reg;

    /// Inserts a synthesized instruction immediately before `anchor` within
    /// `block`, returning its handle.
    fn insert_ins_before(&mut self, block: Self::Block, anchor: Self::Ins, op: Op<Self::Reg>) -> Self::Ins;

    /// Deletes `ins` from `block` outright.
    fn delete_ins(&mut self, block: Self::Block, ins: Self::Ins);

    fn usages_add(&mut self, operand: Operand<Self::Reg>, user: Self::Ins);
    fn usages_delete(&mut self, operand: Operand<Self::Reg>, user: Self::Ins);
    fn usages_add_deopt(&mut self, operand: Operand<Self::Reg>, deopt_idx: DeoptIdx);

    /// Reserves a constant-pool entry for `value`, returning its index.
    fn add_spesh_slot(&mut self, value: SlotValue<Self::Type>) -> SlotIdx;

    /// Reads back the type previously stored at `slot` (e.g. the type a
    /// pre-existing `guardconc` was set up to guard against).
    fn slot_type(&self, slot: SlotIdx) -> Option<Self::Type>;

    fn op_info(&self, block: Self::Block, ins: Self::Ins) -> Result<OpInfo<Self::Reg, Self::Type>, PeaError>;

    /// Blocks in reverse postorder, the order analysis walks the graph in.
    fn reverse_postorder(&self) -> Vec<Self::Block>;

    /// Blocks in the function's original layout order, the order rewriting
    /// walks the graph in. For a graph with no code motion between the two
    /// passes these coincide, but the pass never assumes that.
    fn linear_order(&self) -> Vec<Self::Block>;

    fn predecessors(&self, block: Self::Block) -> Vec<Self::Block>;

    fn instructions(&self, block: Self::Block) -> Vec<Self::Ins>;

    /// Operands live across the deopt point `deopt_idx`, per the host's own
    /// usage table.
    fn live_at_deopt(&self, deopt_idx: DeoptIdx) -> Vec<Operand<Self::Reg>>;

    fn repr_id(&self, ty: Self::Type) -> ReprId;

    fn p6opaque_layout(&self, ty: Self::Type) -> Option<P6opaqueLayout>;

    /// Maps a byte offset (as named by an attribute op's operand) back to
    /// the attribute index `p6opaque_layout` enumerates, if `ty` has an
    /// attribute at that offset at all.
    fn attr_index(&self, ty: Self::Type, offset: u32) -> Option<usize>;

    /// The inverse of [`attr_index`](Self::attr_index): the byte offset a
    /// real `BindAttr`/`GetAttr` instruction would use to name attribute
    /// `index` of `ty`. Needed when emitting a materialization's binds,
    /// which only ever have an attribute index to work from.
    fn attr_offset(&self, ty: Self::Type, index: usize) -> Option<u32>;

    fn storage_spec(&self, ty: Self::Type) -> StorageSpec;

    /// The index the host's integer cache uses for `ty`, if any; lets the
    /// rewriter prefer `sp_materialize_bi` over a full fastcreate+bind for
    /// single-attribute bigint boxes.
    fn int_cache_type_index(&self, ty: Self::Type) -> Option<u16>;
}
