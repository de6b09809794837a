//! Top-level entry point: runs the analyzer, then the rewriter, over one
//! function body exposed through a [`Host`].

use crate::analyzer::{AnalyzeOutcome, Analyzer};
use crate::deopt::{DeoptBridge, DeoptPeaTable};
use crate::error::PeaError;
use crate::host::Host;
use crate::rewriter;

/// What running the pass over one function accomplished.
pub struct PassResult<H: Host> {
    /// Whether any rewrite was actually queued. `false` means the function
    /// was left untouched (nothing to scalar-replace, or analysis gave up
    /// because the function has a loop).
    pub changed: bool,
    /// The side table a deoptimizer needs to reconstruct any allocation
    /// that stayed scalar-replaced up to a deopt point. Empty when
    /// `changed` is `false`.
    pub deopt_table: DeoptPeaTable<H::Reg>,
}

/// Runs partial escape analysis and rewriting over `host`'s function body.
///
/// A function containing a loop, or one with no scalar-replaceable
/// allocations at all, is left completely untouched: both are ordinary,
/// non-error outcomes (see [`AnalyzeOutcome::LoopDetected`] and
/// `found_replaceable: false`), not failures of the pass.
pub fn run_partial_escape_analysis<H: Host>(host: &mut H) -> Result<PassResult<H>, PeaError> {
    let outcome = Analyzer::analyze(host)?;
    let (mut analyzer, found_replaceable) = match outcome {
        AnalyzeOutcome::LoopDetected => {
            return Ok(PassResult { changed: false, deopt_table: DeoptPeaTable::default() });
        }
        AnalyzeOutcome::Done { analyzer, found_replaceable } => (analyzer, found_replaceable),
    };

    if !found_replaceable {
        return Ok(PassResult { changed: false, deopt_table: DeoptPeaTable::default() });
    }

    let mut deopt = DeoptBridge::new();
    rewriter::rewrite(host, &mut analyzer.tracker, &analyzer.ledger, &mut deopt)?;

    Ok(PassResult { changed: true, deopt_table: deopt.into_table() })
}
