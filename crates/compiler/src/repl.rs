//! Interactive REPL
//!
//! A rustyline-driven loop over the pipeline: each submitted line reads,
//! analyzes, and evaluates in the session env, printing every top-level
//! result readably. The prompt tracks the current namespace.

use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing::debug;

use clove_runtime::ns::Env;
use clove_runtime::print;
use clove_runtime::value::Value;

use crate::builtins::bootstrap;
use crate::pipeline::{BackendChoice, eval_string};

pub fn run(backend: BackendChoice) -> i32 {
    let env = bootstrap();
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("failed to initialize line editor: {e}");
            return 1;
        }
    };

    println!("Clove REPL ({:?} backend). Ctrl-D to exit.", backend);
    loop {
        let prompt = format!("{}=> ", env.current_ns().name);
        match editor.readline(&prompt) {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(&line);
                eval_line(&env, &line, backend);
            }
            Err(ReadlineError::Interrupted) => {
                // Ctrl-C clears the current line
                continue;
            }
            Err(ReadlineError::Eof) => {
                debug!("REPL eof");
                break;
            }
            Err(e) => {
                eprintln!("readline error: {e}");
                return 1;
            }
        }
    }
    clove_runtime::lifecycle::graceful_exit(&env.heap);
    0
}

fn eval_line(env: &Env, line: &str, backend: BackendChoice) {
    let mut print_result = |v: Value| {
        let rendered = print::with_print_heap(&env.heap, || print::pr_str(v));
        println!("{rendered}");
    };
    match eval_string(env, line, backend, Some(&mut print_result)) {
        Ok(_) => {}
        Err(e) => eprintln!("{e}"),
    }
}
