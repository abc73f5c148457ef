//! Read -> analyze -> evaluate orchestration
//!
//! Drives a source string through the reader, the analyzer, and one of the
//! two back-ends, one top-level form at a time. The eval-env hook is
//! installed for the whole run (macro expansion and env-sensitive builtins
//! need it) and restored on every exit path; the reader's namespace view
//! refreshes between forms so reads after an `ns` form resolve there.
//!
//! Analyzed roots are retained on the env for its lifetime: closures
//! stored into vars by `def` keep their AST beyond the per-form scope.

use std::sync::Arc;

use tracing::debug;

use clove_runtime::error::Result;
use clove_runtime::ns::{Env, with_eval_env};
use clove_runtime::value::Value;

use crate::analyzer;
use crate::ast::Node;
use crate::bytecode;
use crate::reader::Reader;
use crate::treewalk;
use crate::vm::Vm;

/// Which evaluator runs analyzed forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendChoice {
    TreeWalk,
    Vm,
}

/// Receives each top-level result as it is produced, so side-effectful
/// prints interleave correctly with result prints (REPL, `-e`).
pub type FormObserver<'a> = dyn FnMut(Value) + 'a;

/// Evaluate every form in `source`, returning the last result.
pub fn eval_string(
    env: &Env,
    source: &str,
    backend: BackendChoice,
    mut observer: Option<&mut FormObserver<'_>>,
) -> Result<Value> {
    with_eval_env(env, || {
        let mut reader = Reader::new(&env.heap, source)?;
        reader.set_current_ns(&env.current_ns().name);
        let mut last = Value::nil();
        while let Some(form) = reader.next_form()? {
            let (node, n_slots) = analyzer::analyze_top(env, &form)?;
            let node = Arc::new(node);
            env.retain_root(node.clone() as Arc<dyn std::any::Any + Send + Sync>);

            last = eval_node(env, &node, n_slots, backend)?;
            if let Some(obs) = observer.as_mut() {
                obs(last);
            }

            // Subsequent forms resolve in whatever namespace this form
            // left us in
            reader.set_current_ns(&env.current_ns().name);
        }
        Ok(last)
    })
}

/// Evaluate one analyzed node on the chosen back-end.
pub fn eval_node(
    env: &Env,
    node: &Node,
    n_slots: usize,
    backend: BackendChoice,
) -> Result<Value> {
    match backend {
        BackendChoice::TreeWalk => treewalk::eval_top(env, node, n_slots),
        BackendChoice::Vm => {
            let chunk = bytecode::compile_top(node, n_slots)?;
            debug!(ops = chunk.code.len(), "compiled top-level form");
            Vm::new().run_chunk(&env.heap, &chunk)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins::bootstrap;

    /// Run under both back-ends, assert agreement, return the tree-walk
    /// env and value together so heap values stay live.
    fn eval_both(source: &str) -> (Env, Value) {
        let tw_env = bootstrap();
        let vm_env = bootstrap();
        let tw = eval_string(&tw_env, source, BackendChoice::TreeWalk, None).unwrap();
        let vm = eval_string(&vm_env, source, BackendChoice::Vm, None).unwrap();
        // Values live in different heaps; equality is structural
        assert!(
            clove_runtime::eql::eql_alloc(&tw_env.heap, tw, vm),
            "back-ends disagree on {source}"
        );
        (tw_env, tw)
    }

    #[test]
    fn test_simple_arithmetic() {
        let (_env, v) = eval_both("(+ 1 2)");
        assert_eq!(v.as_int(), 3);
    }

    #[test]
    fn test_multiple_forms_return_last() {
        let (_env, v) = eval_both("(def x 10) (+ x 5)");
        assert_eq!(v.as_int(), 15);
    }

    #[test]
    fn test_closures_survive_across_forms() {
        let (_env, v) = eval_both("(def add2 (let [n 2] (fn [x] (+ x n)))) (add2 40)");
        assert_eq!(v.as_int(), 42);
    }

    #[test]
    fn test_observer_sees_every_form() {
        let env = bootstrap();
        let mut seen = Vec::new();
        let mut obs = |v: Value| seen.push(v);
        eval_string(&env, "1 2 3", BackendChoice::TreeWalk, Some(&mut obs)).unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2].as_int(), 3);
    }

    #[test]
    fn test_ns_form_switches_namespace() {
        let env = bootstrap();
        eval_string(
            &env,
            "(ns app.main) (def answer 42)",
            BackendChoice::TreeWalk,
            None,
        )
        .unwrap();
        assert_eq!(env.current_ns().name, "app.main");
        let var = env.registry.find("app.main").unwrap().lookup("answer").unwrap();
        assert_eq!(var.root().as_int(), 42);
    }

    #[test]
    fn test_error_carries_location() {
        let env = bootstrap();
        let err = eval_string(&env, "(+ 1 \"hello\")", BackendChoice::TreeWalk, None)
            .unwrap_err();
        assert_eq!(err.kind_name(), "type_error");
        assert_eq!(err.line, Some(0));
        assert_eq!(err.col, Some(5));
    }
}
