//! `default_pipeline`: the ordered pass sequence a consumer with no
//! opinion of its own should run, matching the dependency order laid out
//! for this optimizer -- structured cleanups while the CFG is still
//! nested, `Flatten`, the canonical SSA core, loop machinery interleaved
//! with another SSA round to clean up what loop transforms exposed, then
//! scheduling. Nothing here is mandatory: the CLI is free to build its own
//! `PassManager` and add a subset, this is only the default.

use crate::const_globals::{HoistConstArray, InlineStore};
use crate::dae::Dae;
use crate::dce::{AggressiveDce, Dce};
use crate::dse_dle::{Dle, Dse};
use crate::flatten::Flatten;
use crate::fold::FoldPass;
use crate::gcm::Gcm;
use crate::gvn::Gvn;
use crate::inline::{EarlyInline, Inline, LateInline};
use crate::instschedule::InstSchedule;
use crate::localize_globalize::{Globalize, Localize};
use crate::loops::canonicalize::CanonicalizeLoop;
use crate::loops::licm::Licm;
use crate::loops::remove_empty::RemoveEmptyLoop;
use crate::loops::rotate::LoopRotate;
use crate::loops::unroll::ConstLoopUnroll;
use crate::loops::vectorize::Vectorize;
use crate::mem2reg::Mem2Reg;
use crate::move_alloca::MoveAlloca;
use crate::pass::Pass;
use crate::remerge_raise_to_for::{RaiseToFor, Remerge};
use crate::select::Select;
use crate::simplify_cfg::SimplifyCfg;
use crate::structured_cleanup::{ColumnMajor, LoopDce, Parallelizable, TidyMemory, View};
use crate::synth_const_array::SynthConstArray;
use crate::tco::Tco;

/// Whether the target is ARM, which is the only backend `Vectorize`'s SIMD
/// hint means anything for.
#[derive(Default)]
pub struct PipelineOptions {
    pub arm: bool,
}

pub fn default_pipeline(opts: &PipelineOptions) -> Vec<Box<dyn Pass>> {
    let mut passes: Vec<Box<dyn Pass>> = Vec::new();

    // Structured-CFG passes (§2.3): the front end's structured IR is
    // cleaned up while nesting is still available to reason about.
    passes.push(Box::new(Tco));
    passes.push(Box::new(Remerge));
    passes.push(Box::new(RaiseToFor));
    passes.push(Box::new(EarlyInline::default()));
    passes.push(Box::new(FoldPass::early()));
    passes.push(Box::new(LoopDce));
    passes.push(Box::new(View));
    passes.push(Box::new(TidyMemory));
    passes.push(Box::new(ColumnMajor));
    passes.push(Box::new(Parallelizable));
    passes.push(Box::new(MoveAlloca));

    // Flattening (§2.4): from here on the CFG is Goto/Branch/Phi flat.
    passes.push(Box::new(Flatten));

    // SSA core, first round.
    passes.push(Box::new(Mem2Reg));
    passes.push(Box::new(Gvn));
    passes.push(Box::new(Dce));
    passes.push(Box::new(Dse));
    passes.push(Box::new(Dle));
    passes.push(Box::new(Dae));
    passes.push(Box::new(FoldPass::regular()));
    passes.push(Box::new(SimplifyCfg));
    passes.push(Box::new(AggressiveDce));

    // Loop machinery (§2.5), which needs Mem2Reg's clean SSA form first
    // and feeds back into the SSA core once it's done exposing new
    // constants and invariant code.
    passes.push(Box::new(CanonicalizeLoop { lcssa: true }));
    passes.push(Box::new(LoopRotate));
    passes.push(Box::new(Licm));
    passes.push(Box::new(ConstLoopUnroll));
    passes.push(Box::new(RemoveEmptyLoop));
    passes.push(Box::new(SynthConstArray));
    if opts.arm {
        passes.push(Box::new(Vectorize));
    }

    // SSA core, second round: clean up what loop machinery exposed.
    passes.push(Box::new(Gvn));
    passes.push(Box::new(Dce));
    passes.push(Box::new(Dse));
    passes.push(Box::new(Dle));
    passes.push(Box::new(FoldPass::regular()));
    passes.push(Box::new(SimplifyCfg));
    passes.push(Box::new(Inline::default()));
    passes.push(Box::new(LateInline::default()));
    passes.push(Box::new(AggressiveDce));
    passes.push(Box::new(Select));
    passes.push(Box::new(Localize));
    passes.push(Box::new(Globalize));
    passes.push(Box::new(InlineStore));
    passes.push(Box::new(HoistConstArray::default()));

    // Scheduling (§4.10/§4.11): last, so every other rewrite has already
    // settled on the final op graph GCM and InstSchedule place.
    passes.push(Box::new(Gcm));
    passes.push(Box::new(InstSchedule));

    passes
}
