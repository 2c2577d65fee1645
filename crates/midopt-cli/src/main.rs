//! `midopt`: the CLI entry point for the mid-level optimizer, per §6.
//!
//! The positional input is the textual IR `midopt-ir::textformat` reads --
//! the front end that would normally produce it is out of scope for this
//! workspace, so the CLI's notion of "source file" is this crate's own
//! round-trippable dump format. `--sat`/`--bv` are unrelated standalone
//! modes that bypass the optimizer entirely and drive `midopt-smt` directly.

use std::fs;
use std::path::PathBuf;
use std::process;

use clap::Parser;
use tracing::info;

use midopt_ir::{dump, parse};
use midopt_passes::pipeline::{default_pipeline, PipelineOptions};
use midopt_passes::{DifferentialOracle, ExpectedOutput, PassManager};
use midopt_smt::{parse_dimacs, solver_for, BvBuilder, SatResult, Solver};

/// Mid-level SSA optimizer for an embedded RISC-V/ARM ahead-of-time backend.
#[derive(Parser)]
#[command(name = "midopt", about = "Mid-level IR optimizer")]
struct Cli {
    /// Input source file (textual mid-level IR, or a DIMACS/bit-vector file
    /// under `--sat`/`--bv`).
    input: Option<PathBuf>,

    /// Output path (defaults to stdout when omitted).
    #[arg(short = 'o')]
    output: Option<PathBuf>,

    /// Emit the optimized IR without invoking a backend.
    #[arg(short = 'S')]
    no_link: bool,

    /// Enable the standard optimization pipeline.
    #[arg(long = "O1")]
    opt1: bool,

    /// Target the ARM backend.
    #[arg(long, conflicts_with = "rv")]
    arm: bool,

    /// Target the RISC-V backend (default).
    #[arg(long)]
    rv: bool,

    #[arg(short, long)]
    verbose: bool,

    #[arg(short, long = "stats")]
    stats: bool,

    /// Run `Verify` after every post-Mem2Reg pass.
    #[arg(long)]
    verify: bool,

    /// Dump the IR as parsed, before any pass has run.
    #[arg(long = "dump-ast")]
    dump_ast: bool,

    /// Dump the IR once it reaches flat (post-`Flatten`) form.
    #[arg(long = "dump-mid-ir")]
    dump_mid_ir: bool,

    /// Print the module before the named pass runs.
    #[arg(long)]
    print_before: Option<String>,

    /// Print the module after the named pass runs.
    #[arg(long)]
    print_after: Option<String>,

    /// Expected-output file for differential testing (last line is the exit
    /// code, the rest is expected stdout).
    #[arg(long)]
    compare: Option<PathBuf>,

    /// Simulated stdin for differential testing / interpretation.
    #[arg(short = 'i')]
    stdin_file: Option<PathBuf>,

    /// Standalone DIMACS SAT solver mode.
    #[arg(long)]
    sat: bool,

    /// Standalone bit-vector solver mode.
    #[arg(long)]
    bv: bool,
}

fn main() {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();
    let cli = Cli::parse();
    process::exit(run(cli));
}

fn run(cli: Cli) -> i32 {
    if cli.sat && cli.bv {
        eprintln!("error: --sat and --bv are mutually exclusive");
        return 1;
    }
    if cli.sat {
        return run_sat_mode(&cli);
    }
    if cli.bv {
        return run_bv_mode(&cli);
    }
    run_optimizer(&cli)
}

fn read_input(path: &Option<PathBuf>) -> Result<String, i32> {
    let Some(path) = path else {
        eprintln!("error: missing input file");
        return Err(1);
    };
    fs::read_to_string(path).map_err(|e| {
        eprintln!("error: cannot open '{}': {e}", path.display());
        1
    })
}

fn run_sat_mode(cli: &Cli) -> i32 {
    let text = match read_input(&cli.input) {
        Ok(t) => t,
        Err(code) => return code,
    };
    let cnf = match parse_dimacs(&text) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return 1;
        }
    };
    let mut solver = solver_for(&cnf);
    match solver.solve() {
        SatResult::Sat(assignment) => {
            let model: Vec<i32> = assignment.iter().enumerate().map(|(i, &bit)| if bit { (i + 1) as i32 } else { -((i + 1) as i32) }).collect();
            println!("sat");
            println!("{}", model.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(" "));
            0
        }
        SatResult::Unsat => {
            println!("unsat");
            1
        }
    }
}

/// A minimal smoke-test mode for the bit-blasted arithmetic layer: one
/// line of the form `<op> <a> <b>` (`op` in `add`/`sub`/`mul`/`sdiv`/`eq`/
/// `lt`), evaluated through 32-bit `BitVec`s and decoded back from the
/// solver's model.
fn run_bv_mode(cli: &Cli) -> i32 {
    let text = match read_input(&cli.input) {
        Ok(t) => t,
        Err(code) => return code,
    };
    let Some(line) = text.lines().find(|l| !l.trim().is_empty()) else {
        eprintln!("error: empty --bv input");
        return 1;
    };
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let ([op, a_str, b_str], true) = (tokens.get(0..3).map(|s| [s[0], s[1], s[2]]).unwrap_or(["", "", ""]), tokens.len() == 3) else {
        eprintln!("error: expected '<op> <a> <b>', got '{line}'");
        return 1;
    };
    let (Ok(a_val), Ok(b_val)) = (a_str.parse::<i64>(), b_str.parse::<i64>()) else {
        eprintln!("error: operands must be integers");
        return 1;
    };

    let mut solver = Solver::new(0);
    let outcome = {
        let mut bv = BvBuilder::new(&mut solver);
        let a = bv.constant(a_val, 32);
        let b = bv.constant(b_val, 32);
        match op {
            "add" => bv.add(&a, &b).map(Some),
            "sub" => bv.sub(&a, &b).map(Some),
            "mul" => bv.mul(&a, &b).map(Some),
            "sdiv" => bv.sdiv_srem(&a, &b).map(|(q, _)| Some(q)),
            "eq" => bv.eq(&a, &b).map(|lit| {
                bv.solver().add_clause(vec![lit]);
                None
            }),
            "lt" => bv.lt_signed(&a, &b).map(|lit| {
                bv.solver().add_clause(vec![lit]);
                None
            }),
            other => {
                eprintln!("error: unsupported --bv opcode '{other}'");
                return 1;
            }
        }
    };
    let result_bv = match outcome {
        Ok(bv) => bv,
        Err(e) => {
            eprintln!("error: {e}");
            return 1;
        }
    };
    match solver.solve() {
        SatResult::Sat(assignment) => {
            match result_bv {
                Some(bv) => println!("{}", bv.value_of(&assignment)),
                None => println!("true"),
            }
            0
        }
        SatResult::Unsat => {
            println!("false");
            1
        }
    }
}

/// `DifferentialOracle` carrying the saved stdin so each post-pass
/// interpreter run sees the same input the expected-output file was
/// generated against.
struct StdinOracle {
    stdin: String,
}

impl DifferentialOracle for StdinOracle {
    fn run(&mut self, module: &midopt_ir::Module) -> Result<(String, i32), String> {
        midopt_interp::run(module, &self.stdin).map_err(|e| e.to_string())
    }
}

fn parse_expected_output(text: &str) -> Option<ExpectedOutput> {
    let mut lines: Vec<&str> = text.lines().collect();
    let last = lines.pop()?;
    let exit_code: i32 = last.trim().parse().ok()?;
    Some(ExpectedOutput { stdout: lines.join("\n"), exit_code })
}

fn run_optimizer(cli: &Cli) -> i32 {
    let text = match read_input(&cli.input) {
        Ok(t) => t,
        Err(code) => return code,
    };
    let mut module = match parse(&text) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("error: failed to parse input IR: {e}");
            return 1;
        }
    };

    if cli.dump_ast {
        println!("{}", dump(&module));
    }

    if cli.verbose {
        info!("parsed module, starting optimization pipeline");
    }

    let mut manager = PassManager::new();
    manager.set_verify(cli.verify);
    manager.set_stats(cli.stats);
    manager.set_print_before(cli.print_before.clone());
    // `--dump-mid-ir` wants the IR once it first reaches flat form; reuse
    // the print-after-named-pass hook unless the caller already claimed it.
    let mid_ir_hook = cli.dump_mid_ir && cli.print_after.is_none();
    if mid_ir_hook {
        manager.set_print_after(Some("Flatten".to_string()));
    } else {
        manager.set_print_after(cli.print_after.clone());
    }

    if let Some(compare_path) = &cli.compare {
        let expected_text = match fs::read_to_string(compare_path) {
            Ok(t) => t,
            Err(e) => {
                eprintln!("error: cannot open comparison file '{}': {e}", compare_path.display());
                return 1;
            }
        };
        let Some(expected) = parse_expected_output(&expected_text) else {
            eprintln!("error: malformed comparison file '{}'", compare_path.display());
            return 1;
        };
        let stdin = match &cli.stdin_file {
            Some(path) => match fs::read_to_string(path) {
                Ok(t) => t,
                Err(e) => {
                    eprintln!("error: cannot open stdin file '{}': {e}", path.display());
                    return 1;
                }
            },
            None => String::new(),
        };
        manager.set_differential_test(Box::new(StdinOracle { stdin }), expected);
    }

    if cli.opt1 {
        let opts = PipelineOptions { arm: cli.arm };
        for pass in default_pipeline(&opts) {
            manager.add(pass);
        }
    }

    if let Err(e) = manager.run(&mut module) {
        eprintln!("error: {e}");
        return 1;
    }

    if cli.dump_mid_ir && !mid_ir_hook {
        println!("{}", dump(&module));
    }

    if !cli.no_link {
        if cli.verbose {
            info!("backend lowering is out of scope for this workspace; emitting mid-level IR");
        }
    }

    match &cli.output {
        Some(path) => {
            if let Err(e) = fs::write(path, dump(&module)) {
                eprintln!("error: cannot write '{}': {e}", path.display());
                return 1;
            }
        }
        None if !cli.dump_ast && !cli.dump_mid_ir => println!("{}", dump(&module)),
        None => {}
    }

    0
}
