//! Partial escape analysis for an SSA control-flow graph.
//!
//! Scalar-replaces heap allocations that don't escape on every path with
//! register-resident fields, rewriting attribute reads/writes into direct
//! register operations and settifying type guards already proven to pass.
//! An allocation that does escape on some path is materialized back into a
//! real object immediately before the instruction that demands one, with a
//! side table ([`deopt::DeoptPeaTable`]) letting an external deoptimizer
//! reconstruct it on a deopt path too.
//!
//! This crate owns no object model, instruction set or bytecode loader of
//! its own: every way it reaches into the embedding compiler's IR goes
//! through the [`host::Host`] trait. [`pass::run_partial_escape_analysis`]
//! is the entry point; [`analyzer`] and [`rewriter`] implement the two
//! halves of the pass it runs.

#![allow(clippy::too_many_arguments)]

pub mod allocation;
pub mod analyzer;
pub mod bbstate;
pub mod deopt;
pub mod error;
pub mod facts;
pub mod host;
pub mod ids;
pub mod pass;
pub mod repr;
pub mod rewriter;
pub mod transform;

#[cfg(feature = "test-support")]
pub mod mock;

pub mod prelude {
    pub use crate::error::PeaError;
    pub use crate::host::{BigIntOp, Host, HostFacts, Op, OpFamily, OpInfo, Operand, SlotValue};
    pub use crate::ids::{AllocId, DeoptIdx, HypReg, RegKind, SlotIdx, TransformId, Version};
    pub use crate::pass::{run_partial_escape_analysis, PassResult};
    pub use crate::repr::{AttrKind, P6opaqueLayout, ReprId, StorageSpec};
}
