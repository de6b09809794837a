//! C4: per-basic-block allocation state, and the merge that builds a fresh
//! one from a block's predecessors on entry.

use crate::allocation::AllocationTracker;
use crate::host::Host;
use crate::ids::AllocId;
use crate::transform::Transform;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::rc::Rc;

/// One allocation's state as observed entering a particular block.
pub struct PerBbAllocState<H: Host> {
    /// Whether this allocation is still being tracked as replaceable on
    /// every path reaching this block.
    pub seen: bool,
    /// Per-attribute: has it been written on some path reaching this block?
    pub used: Vec<bool>,
    /// Distinct materializations (by transform identity) performed on some
    /// path reaching this block. Almost always empty or a single entry, so
    /// this stays inline rather than heap-allocating in the common case.
    pub materializations: SmallVec<[Rc<Transform<H>>; 2]>,
}

impl<H: Host> PerBbAllocState<H> {
    fn unseen(num_attrs: usize) -> Self {
        Self { seen: false, used: vec![false; num_attrs], materializations: SmallVec::new() }
    }
}

/// A block's full per-allocation state, indexed in parallel with the
/// tracker's allocation vector.
pub struct BbState<H: Host> {
    pub alloc_state: Vec<PerBbAllocState<H>>,
}

impl<H: Host> BbState<H> {
    pub fn is_seen(&self, id: AllocId) -> bool {
        self.alloc_state.get(id.0 as usize).map_or(false, |s| s.seen)
    }

    pub fn is_used(&self, id: AllocId, attr: usize) -> bool {
        self.alloc_state.get(id.0 as usize).and_then(|s| s.used.get(attr)).copied().unwrap_or(false)
    }

    pub fn mark_used(&mut self, id: AllocId, attr: usize) {
        if let Some(s) = self.alloc_state.get_mut(id.0 as usize) {
            if let Some(slot) = s.used.get_mut(attr) {
                *slot = true;
            }
        }
    }

    pub fn materializations(&self, id: AllocId) -> &[Rc<Transform<H>>] {
        self.alloc_state.get(id.0 as usize).map(|s| s.materializations.as_slice()).unwrap_or(&[])
    }

    pub fn add_materialization(&mut self, id: AllocId, t: Rc<Transform<H>>) {
        if let Some(s) = self.alloc_state.get_mut(id.0 as usize) {
            s.materializations.push(t);
        }
    }
}

/// Still tracked as replaceable on entry to `bb_state`, combining the
/// allocation's own (global) irreplaceability bit with the per-block `seen`
/// flag from the merge.
pub fn allocation_tracked<H: Host>(tracker: &AllocationTracker<H>, bb_state: Option<&BbState<H>>, id: AllocId) -> bool {
    !tracker.is_irreplaceable(id) && bb_state.map_or(false, |s| s.is_seen(id))
}

pub struct BbStateTable<H: Host> {
    states: HashMap<H::Block, BbState<H>>,
}

impl<H: Host> BbStateTable<H> {
    pub fn new() -> Self {
        Self { states: HashMap::new() }
    }

    pub fn state(&self, block: H::Block) -> Option<&BbState<H>> {
        self.states.get(&block)
    }

    pub fn state_mut(&mut self, block: H::Block) -> Option<&mut BbState<H>> {
        self.states.get_mut(&block)
    }

    /// A freshly tracked allocation, by construction, never exists in any
    /// already-computed predecessor merge — it's only ever "seen" starting
    /// at the point it's tracked. `setup_block` sizes `block`'s state to
    /// the tracker's allocation count as of entry to `block`, so an
    /// allocation created partway through `block`'s own instruction stream
    /// needs its slot appended here, not merged in: this is what lets that
    /// same block's later instructions (and every successor, once this
    /// block's state is read back as a predecessor) see it as tracked at
    /// all. Allocation ids are handed out in strict tracking order, so a
    /// plain push always lands at the right index.
    pub fn track_new(&mut self, block: H::Block, num_attrs: usize) {
        if let Some(s) = self.states.get_mut(&block) {
            s.alloc_state.push(PerBbAllocState { seen: true, used: vec![false; num_attrs], materializations: SmallVec::new() });
        }
    }

    /// §4.4: builds a fresh state for `block` from the states of `preds`
    /// (all of which, by construction of a reverse-postorder walk with
    /// loops refused, have already been visited).
    ///
    /// An attribute used on *some but not all* applicable predecessors, or
    /// materialized on some but not all, makes the merge inconsistent and
    /// the allocation is marked irreplaceable (never partially consistent).
    pub fn setup_block(
        &mut self,
        tracker: &mut AllocationTracker<H>,
        block: H::Block,
        preds: &[H::Block],
    ) {
        let num_allocs = tracker.allocations.len();
        let mut new_state = BbState { alloc_state: Vec::with_capacity(num_allocs) };

        for i in 0..num_allocs {
            let id = AllocId(i as u32);
            let num_attrs = tracker.get(id).num_attrs();

            let mut applicable = 0usize;
            let mut used_count = vec![0u32; num_attrs];
            let mut materialized_count = 0usize;
            let mut distinct: SmallVec<[Rc<Transform<H>>; 2]> = SmallVec::new();

            for &pred in preds {
                let Some(pred_state) = self.states.get(&pred) else { continue };
                let Some(pred_alloc) = pred_state.alloc_state.get(i) else { continue };
                if !pred_alloc.seen {
                    continue;
                }
                applicable += 1;
                for (attr, used) in pred_alloc.used.iter().enumerate() {
                    if *used {
                        used_count[attr] += 1;
                    }
                }
                if !pred_alloc.materializations.is_empty() {
                    materialized_count += 1;
                    for t in &pred_alloc.materializations {
                        if !distinct.iter().any(|d| Rc::ptr_eq(d, t)) {
                            distinct.push(Rc::clone(t));
                        }
                    }
                }
            }

            if applicable == 0 {
                new_state.alloc_state.push(PerBbAllocState::unseen(num_attrs));
                continue;
            }

            let mut used_bits = vec![false; num_attrs];
            let mut consistent = true;
            for attr in 0..num_attrs {
                if used_count[attr] == 0 {
                    continue;
                }
                if used_count[attr] as usize == applicable {
                    used_bits[attr] = true;
                } else {
                    tracker.mark_irreplaceable(id);
                    consistent = false;
                    break;
                }
            }
            if !consistent {
                new_state.alloc_state.push(PerBbAllocState::unseen(num_attrs));
                continue;
            }

            if materialized_count > 0 && materialized_count != applicable {
                tracker.mark_irreplaceable(id);
            }

            new_state.alloc_state.push(PerBbAllocState { seen: true, used: used_bits, materializations: distinct });
        }

        self.states.insert(block, new_state);
    }
}

impl<H: Host> Default for BbStateTable<H> {
    fn default() -> Self {
        Self::new()
    }
}
