//! Clove CLI
//!
//! Command-line interface for evaluating Clove source, dumping bytecode,
//! running the REPL, and running the dual-back-end compare harness.

use clap::{CommandFactory, Parser as ClapParser, Subcommand, ValueEnum};
use clap_complete::{Shell, generate};
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use clove_compiler::pipeline::BackendChoice;
use clove_compiler::{bootstrap, compare_source, eval_string};
use clove_runtime::print;
use clove_runtime::value::Value;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BackendArg {
    Treewalk,
    Vm,
}

impl From<BackendArg> for BackendChoice {
    fn from(b: BackendArg) -> BackendChoice {
        match b {
            BackendArg::Treewalk => BackendChoice::TreeWalk,
            BackendArg::Vm => BackendChoice::Vm,
        }
    }
}

#[derive(ClapParser)]
#[command(name = "clove")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Clove - a Clojure dialect with dual evaluator back-ends", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a source string and print the last result
    Eval {
        /// Source text to evaluate
        #[arg(short = 'e', value_name = "SRC")]
        expr: String,

        /// Evaluator back-end
        #[arg(long, value_enum, default_value = "vm")]
        backend: BackendArg,
    },

    /// Evaluate a source file
    Run {
        /// Input .clv source file
        input: PathBuf,

        /// Evaluator back-end
        #[arg(long, value_enum, default_value = "vm")]
        backend: BackendArg,
    },

    /// Compile a file and print the bytecode listing
    Dump {
        /// Input .clv source file
        input: PathBuf,
    },

    /// Start an interactive REPL
    Repl {
        /// Evaluator back-end
        #[arg(long, value_enum, default_value = "vm")]
        backend: BackendArg,
    },

    /// Run both back-ends over a file and report mismatches
    Compare {
        /// Input .clv source file
        input: PathBuf,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    clove_runtime::lifecycle::install_signal_handlers();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Eval { expr, backend } => run_eval(&expr, backend.into()),
        Commands::Run { input, backend } => run_file(&input, backend.into()),
        Commands::Dump { input } => run_dump(&input),
        Commands::Repl { backend } => clove_compiler::repl::run(backend.into()),
        Commands::Compare { input } => run_compare(&input),
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "clove", &mut io::stdout());
            0
        }
    };
    process::exit(code);
}

fn run_eval(source: &str, backend: BackendChoice) -> i32 {
    let env = bootstrap();
    let mut print_result = |v: Value| {
        let rendered = print::with_print_heap(&env.heap, || print::pr_str(v));
        println!("{rendered}");
    };
    let result = eval_string(&env, source, backend, Some(&mut print_result));
    clove_runtime::lifecycle::graceful_exit(&env.heap);
    match result {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("{e}");
            1
        }
    }
}

fn run_file(input: &Path, backend: BackendChoice) -> i32 {
    let source = match std::fs::read_to_string(input) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("cannot read {}: {e}", input.display());
            return 1;
        }
    };
    let env = bootstrap();
    let result = eval_string(&env, &source, backend, None);
    clove_runtime::lifecycle::graceful_exit(&env.heap);
    match result {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("{}: {e}", input.display());
            1
        }
    }
}

fn run_dump(input: &Path) -> i32 {
    let source = match std::fs::read_to_string(input) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("cannot read {}: {e}", input.display());
            return 1;
        }
    };
    let env = bootstrap();
    let outcome = clove_runtime::ns::with_eval_env(&env, || -> clove_runtime::Result<()> {
        let mut reader = clove_compiler::Reader::new(&env.heap, &source)?;
        let mut i = 0;
        while let Some(form) = reader.next_form()? {
            let (node, n_slots) = clove_compiler::analyzer::analyze_top(&env, &form)?;
            let chunk = clove_compiler::bytecode::compile_top(&node, n_slots)?;
            print!("{}", clove_compiler::bytecode::dump(&chunk, &format!("form {i}")));
            for (p, proto) in chunk.protos.iter().enumerate() {
                dump_proto(proto, &format!("form {i} proto {p}"));
            }
            reader.set_current_ns(&env.current_ns().name);
            i += 1;
        }
        Ok(())
    });
    match outcome {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("{}: {e}", input.display());
            1
        }
    }
}

fn dump_proto(proto: &Arc<clove_compiler::ast::FnProto>, label: &str) {
    for (a, arity) in proto.arities.iter().enumerate() {
        match clove_compiler::bytecode::arity_chunk(arity) {
            Ok(chunk) => {
                print!(
                    "{}",
                    clove_compiler::bytecode::dump(&chunk, &format!("{label} arity {a}"))
                );
                for (p, inner) in chunk.protos.iter().enumerate() {
                    dump_proto(inner, &format!("{label} arity {a} proto {p}"));
                }
            }
            Err(e) => eprintln!("{label} arity {a}: {e}"),
        }
    }
}

fn run_compare(input: &Path) -> i32 {
    let source = match std::fs::read_to_string(input) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("cannot read {}: {e}", input.display());
            return 1;
        }
    };
    match compare_source(&source) {
        Ok(summary) => {
            print!("{}", clove_compiler::engine::render_report(&summary));
            if summary.all_match { 0 } else { 1 }
        }
        Err(e) => {
            eprintln!("{}: {e}", input.display());
            1
        }
    }
}
