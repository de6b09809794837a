//! Error types surfaced by the pass.

use thiserror::Error;

/// Failure modes that indicate the host violated its side of the [`Host`]
/// contract, or that this crate's own bookkeeping found itself in a state
/// it should never reach.
///
/// Everything else the design talks about — a candidate that isn't
/// P6opaque-shaped, a loop in the control-flow graph, an inconsistent merge
/// across predecessors, a use the pass can't reason about, a guard that
/// can't be settled — is *not* an error. Those are ordinary control flow
/// that marks an allocation irreplaceable, or makes the whole pass report
/// "found nothing to do". Reserve `Result::Err` for cases a correct host
/// should never trigger.
///
/// [`Host`]: crate::host::Host
#[derive(Debug, Error)]
pub enum PeaError {
    /// The host's IR did not satisfy an invariant the facade depends on:
    /// an opcode classified with operands it doesn't have, a guard without
    /// a type slot, or similar.
    #[error("IR invariant violated: {detail}")]
    IrInvariantViolated { detail: String },

    /// An invariant internal to this pass was violated: asked to resolve a
    /// big-integer attribute on a type that doesn't have one, or to apply a
    /// transform whose allocation was never tracked. If this fires, it's a
    /// bug in this crate's own bookkeeping rather than in the host, since
    /// every transform is one this pass queued itself.
    #[error("PEA invariant violated: {detail}")]
    IrOops { detail: String },
}
