//! C3: the shadow facts table. Carries type/concreteness annotations keyed
//! by either a hypothetical register (which has no entry in the host's own
//! fact table, since it isn't a real register) or a concrete one, plus a
//! back-pointer from a concrete register to the allocation it aliases, when
//! it does.

use crate::host::Host;
use crate::ids::{AllocId, HypReg, Version};
use std::collections::HashMap;

/// One shadow fact: what this pass believes about a value, which may be
/// more refined than what the host's own fact table says, since this pass
/// derives facts about hypothetical registers the host has never heard of.
pub struct ShadowFact<H: Host> {
    pub known_type: Option<H::Type>,
    pub concrete: bool,
    /// If this value is known to alias (or *be*) a tracked allocation, its
    /// id. Set when an allocation is first tracked (the allocator's own
    /// destination aliases itself), propagated across `set`/alias moves,
    /// and consulted when deciding whether a `guardconc` can be settified.
    pub depend_allocation: Option<AllocId>,
}

impl<H: Host> ShadowFact<H> {
    fn blank() -> Self {
        ShadowFact { known_type: None, concrete: false, depend_allocation: None }
    }
}

pub struct ShadowFactsTable<H: Host> {
    by_hyp: HashMap<HypReg, ShadowFact<H>>,
    by_concrete: HashMap<(H::Reg, Version), ShadowFact<H>>,
}

impl<H: Host> ShadowFactsTable<H> {
    pub fn new() -> Self {
        Self { by_hyp: HashMap::new(), by_concrete: HashMap::new() }
    }

    pub fn get_or_create_hyp(&mut self, hyp: HypReg) -> &mut ShadowFact<H> {
        self.by_hyp.entry(hyp).or_insert_with(ShadowFact::blank)
    }

    pub fn get_or_create_concrete(&mut self, reg: H::Reg, version: Version) -> &mut ShadowFact<H> {
        self.by_concrete.entry((reg, version)).or_insert_with(ShadowFact::blank)
    }

    pub fn get_hyp(&self, hyp: HypReg) -> Option<&ShadowFact<H>> {
        self.by_hyp.get(&hyp)
    }

    pub fn get_concrete(&self, reg: H::Reg, version: Version) -> Option<&ShadowFact<H>> {
        self.by_concrete.get(&(reg, version))
    }

    /// The allocation a concrete `(reg, version)` is known to alias, if any.
    pub fn allocation_of(&self, reg: H::Reg, version: Version) -> Option<AllocId> {
        self.get_concrete(reg, version).and_then(|f| f.depend_allocation)
    }

    /// Records that `(reg, version)` aliases `id`, so later lookups (e.g. a
    /// `guardconc` settify check, or a deopt-time live-allocation scan) can
    /// find it again.
    pub fn track_register(&mut self, reg: H::Reg, version: Version, id: AllocId) {
        self.get_or_create_concrete(reg, version).depend_allocation = Some(id);
    }

    /// Propagates the shadow fact of `src` onto `dst` unchanged, as for a
    /// pure alias move (`set`, or a single-live-input PHI).
    pub fn alias(&mut self, src_reg: H::Reg, src_version: Version, dst_reg: H::Reg, dst_version: Version) {
        let src = self.by_concrete.get(&(src_reg, src_version)).map(|f| ShadowFact {
            known_type: f.known_type,
            concrete: f.concrete,
            depend_allocation: f.depend_allocation,
        });
        if let Some(fact) = src {
            self.by_concrete.insert((dst_reg, dst_version), fact);
        }
    }
}

impl<H: Host> Default for ShadowFactsTable<H> {
    fn default() -> Self {
        Self::new()
    }
}
