//! The [`Pass`] trait and the [`PassManager`] that drives a sequence of them
//! over a [`Module`], matching the pipeline described for this optimizer: an
//! ordered, mutable queue with per-pass print/verify/stats hooks and a
//! differential-testing mode bracketed by the flatten/backend lifecycle.

use midopt_ir::Module;
use tracing::info;

use crate::error::{PassError, PassResult};
use crate::verify::verify;

/// A single rewrite or analysis step over a whole module.
///
/// `run` returns whether it changed anything, which several fixpoint-driven
/// callers (e.g. running `RegularFold` until it stops firing) use to decide
/// whether to loop again.
pub trait Pass {
    fn name(&self) -> &'static str;

    fn run(&mut self, module: &mut Module) -> PassResult<bool>;

    /// True for the pass that performs CFG flattening: flips the Pass
    /// Manager's `past_flatten` lifecycle flag once it has run.
    fn marks_flattened(&self) -> bool {
        false
    }

    /// True for the pass that performs `Mem2Reg`: flips `past_mem2reg`,
    /// which gates whether `--verify` is meaningful (dominance of Phi
    /// operands is only an invariant once SSA form exists).
    fn marks_mem2reg(&self) -> bool {
        false
    }

    /// True for the pass that hands off to backend lowering: flips
    /// `in_backend`, after which differential testing stops (the
    /// interpreter only understands mid-level IR).
    fn marks_backend(&self) -> bool {
        false
    }
}

/// A differential-test oracle: runs a module against the saved stdin and
/// reports `(stdout, exit_code)`. The Pass Manager is deliberately generic
/// over this rather than depending on `midopt-interp` directly, so the
/// pass suite can be dev-tested against the interpreter without making it a
/// runtime dependency of every consumer; the CLI supplies the real oracle.
pub trait DifferentialOracle {
    fn run(&mut self, module: &Module) -> Result<(String, i32), String>;
}

pub struct ExpectedOutput {
    pub stdout: String,
    pub exit_code: i32,
}

pub struct PassManager {
    passes: Vec<Box<dyn Pass>>,
    past_flatten: bool,
    past_mem2reg: bool,
    in_backend: bool,
    verify_enabled: bool,
    stats_enabled: bool,
    print_before: Option<String>,
    print_after: Option<String>,
    diff_test: Option<(Box<dyn DifferentialOracle>, ExpectedOutput)>,
}

impl PassManager {
    pub fn new() -> Self {
        PassManager {
            passes: Vec::new(),
            past_flatten: false,
            past_mem2reg: false,
            in_backend: false,
            verify_enabled: false,
            stats_enabled: false,
            print_before: None,
            print_after: None,
            diff_test: None,
        }
    }

    pub fn add(&mut self, pass: Box<dyn Pass>) -> &mut Self {
        self.passes.push(pass);
        self
    }

    pub fn set_verify(&mut self, enabled: bool) -> &mut Self {
        self.verify_enabled = enabled;
        self
    }

    pub fn set_stats(&mut self, enabled: bool) -> &mut Self {
        self.stats_enabled = enabled;
        self
    }

    pub fn set_print_before(&mut self, name: Option<String>) -> &mut Self {
        self.print_before = name;
        self
    }

    pub fn set_print_after(&mut self, name: Option<String>) -> &mut Self {
        self.print_after = name;
        self
    }

    pub fn set_differential_test(&mut self, oracle: Box<dyn DifferentialOracle>, expected: ExpectedOutput) -> &mut Self {
        self.diff_test = Some((oracle, expected));
        self
    }

    pub fn run(&mut self, module: &mut Module) -> PassResult<()> {
        for pass in &mut self.passes {
            let name = pass.name();
            if self.print_before.as_deref() == Some(name) {
                println!("{}", midopt_ir::dump(module));
            }

            let changed = pass.run(module)?;

            if pass.marks_flattened() {
                self.past_flatten = true;
            }
            if pass.marks_mem2reg() {
                self.past_mem2reg = true;
            }
            if pass.marks_backend() {
                self.in_backend = true;
            }

            if self.stats_enabled {
                info!(pass = name, changed, "pass ran");
            }

            if self.print_after.as_deref() == Some(name) {
                println!("{}", midopt_ir::dump(module));
            }

            if self.verify_enabled && self.past_mem2reg {
                if let Err(message) = verify(module) {
                    return Err(PassError::VerifyFailed { pass: name.to_string(), message });
                }
            }

            if self.past_flatten && !self.in_backend {
                if let Some((oracle, expected)) = &mut self.diff_test {
                    let (stdout, exit_code) = oracle.run(module).map_err(|message| PassError::OracleFailed { pass: name.to_string(), message })?;
                    if stdout.trim_end() != expected.stdout.trim_end() || exit_code != expected.exit_code {
                        return Err(PassError::DifferentialMismatch {
                            pass: name.to_string(),
                            expected_stdout: expected.stdout.clone(),
                            actual_stdout: stdout,
                            expected_exit: expected.exit_code,
                            actual_exit: exit_code,
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

impl Default for PassManager {
    fn default() -> Self {
        PassManager::new()
    }
}
