//! C8: the deopt bridge. Builds the side table an external deoptimizer
//! consumes to reconstruct a scalar-replaced object on a deopt path,
//! without this pass knowing anything about how deoptimization itself
//! works.

use crate::allocation::AllocationTracker;
use crate::error::PeaError;
use crate::host::Host;
use crate::ids::{AllocId, DeoptIdx, SlotIdx};

/// Enough information to rebuild one allocation from its concrete attribute
/// registers: the type to allocate, and the register holding each
/// attribute in declaration order. `None` means that attribute was never
/// written on any path that reached this deopt point, and is left unset on
/// the rebuilt object, same as a fresh allocation would leave it.
#[derive(Debug, Clone)]
pub struct MaterializationInfo<R> {
    pub type_slot: SlotIdx,
    pub attr_regs: Vec<Option<R>>,
}

/// One (deopt point, live scalar-replaced allocation) pairing: which
/// materialize-info entry to rebuild from, and which register the rebuilt
/// object should end up in.
#[derive(Debug, Clone, Copy)]
pub struct DeoptPointEntry<R> {
    pub deopt_point_idx: DeoptIdx,
    pub materialize_info_idx: u32,
    pub target_reg: R,
}

/// The side table handed back to the deoptimizer. Consumed, not produced,
/// outside this crate.
#[derive(Debug, Clone, Default)]
pub struct DeoptPeaTable<R> {
    pub materialize_info: Vec<MaterializationInfo<R>>,
    pub deopt_point: Vec<DeoptPointEntry<R>>,
}

/// C8. Accumulates a [`DeoptPeaTable`] as the rewriter discovers which
/// allocations are still live (and scalar-replaced) at each deopt point.
pub struct DeoptBridge<H: Host> {
    table: DeoptPeaTable<H::Reg>,
}

impl<H: Host> DeoptBridge<H> {
    pub fn new() -> Self {
        Self { table: DeoptPeaTable::default() }
    }

    /// Lazily assigns (and caches on the allocation record) a
    /// materialize-info index for `id`, building the entry the first time
    /// it's requested. An attribute with no concrete register yet was never
    /// written on any path reaching here, and is recorded as `None`: the
    /// deoptimizer rebuilds the object with that attribute left unset,
    /// exactly as a fresh allocation would have it.
    pub fn materialize_info_idx(
        &mut self,
        tracker: &mut AllocationTracker<H>,
        type_slot: SlotIdx,
        id: AllocId,
    ) -> Result<u32, PeaError> {
        if let Some(idx) = tracker.get(id).deopt_mat_idx {
            return Ok(idx);
        }
        let attr_regs = tracker.get(id).concrete_attr_regs.clone();
        let idx = self.table.materialize_info.len() as u32;
        self.table.materialize_info.push(MaterializationInfo { type_slot, attr_regs });
        tracker.get_mut(id).deopt_mat_idx = Some(idx);
        Ok(idx)
    }

    pub fn add_deopt_point(&mut self, deopt_point_idx: DeoptIdx, materialize_info_idx: u32, target_reg: H::Reg) {
        self.table.deopt_point.push(DeoptPointEntry { deopt_point_idx, materialize_info_idx, target_reg });
    }

    /// The attribute registers already captured for materialize-info entry
    /// `idx`, so `ADD_DEOPT_USAGE` can pin every one of them as live at the
    /// deopt point it's attached to.
    pub fn attr_regs(&self, idx: u32) -> &[Option<H::Reg>] {
        self.table
            .materialize_info
            .get(idx as usize)
            .map(|info| info.attr_regs.as_slice())
            .unwrap_or(&[])
    }

    pub fn into_table(self) -> DeoptPeaTable<H::Reg> {
        self.table
    }
}

impl<H: Host> Default for DeoptBridge<H> {
    fn default() -> Self {
        Self::new()
    }
}
