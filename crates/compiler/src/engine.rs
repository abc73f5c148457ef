//! Compare engine: the dual-back-end regression harness
//!
//! Runs each top-level form through both evaluators, in two sibling
//! worlds built from the same source, and diffs the outcomes. Both
//! succeeding with equal values is a match; both failing is a match (the
//! back-ends agree on the error behavior); anything one-sided is a
//! mismatch and a regression regardless of which path crashed.

use clove_runtime::eql::eql_alloc;
use clove_runtime::error::{Error, Result};
use clove_runtime::value::Value;

use crate::builtins::bootstrap;
use crate::pipeline::{BackendChoice, eval_string};
use crate::reader::Reader;

/// Outcome of one form under both back-ends.
pub struct CompareResult {
    pub form: String,
    pub tw_value: Option<Value>,
    pub vm_value: Option<Value>,
    pub tw_error: Option<Error>,
    pub vm_error: Option<Error>,
    pub matched: bool,
}

pub struct CompareSummary {
    pub results: Vec<CompareResult>,
    pub all_match: bool,
    /// The two worlds the results' values live in; dropping them would
    /// dangle every heap value above.
    pub tw_env: clove_runtime::ns::Env,
    pub vm_env: clove_runtime::ns::Env,
}

/// Evaluate `source` form-by-form under both back-ends and diff.
pub fn compare_source(source: &str) -> Result<CompareSummary> {
    let tw_env = bootstrap();
    let vm_env = bootstrap();

    // Forms must be enumerated per world so each heap owns its own values;
    // this reader only slices the source into per-form texts.
    let spans = top_level_form_texts(source)?;

    let mut results = Vec::with_capacity(spans.len());
    let mut all_match = true;
    for form_text in spans {
        let tw = eval_string(&tw_env, &form_text, BackendChoice::TreeWalk, None);
        let vm = eval_string(&vm_env, &form_text, BackendChoice::Vm, None);

        let matched = match (&tw, &vm) {
            (Ok(a), Ok(b)) => eql_alloc(&tw_env.heap, *a, *b),
            (Err(_), Err(_)) => true,
            _ => false,
        };
        all_match &= matched;
        results.push(CompareResult {
            form: form_text,
            tw_value: tw.as_ref().ok().copied(),
            vm_value: vm.as_ref().ok().copied(),
            tw_error: tw.err(),
            vm_error: vm.err(),
            matched,
        });
    }
    Ok(CompareSummary {
        results,
        all_match,
        tw_env,
        vm_env,
    })
}

/// Slice a source string into the printed text of each top-level form.
fn top_level_form_texts(source: &str) -> Result<Vec<String>> {
    let heap = clove_runtime::heap::Heap::new();
    let mut reader = Reader::new(&heap, source)?;
    let mut texts = Vec::new();
    while let Some(form) = reader.next_form()? {
        texts.push(clove_runtime::print::pr_str(form.value));
    }
    Ok(texts)
}

/// Render a human-readable report; used by the `compare` CLI command.
pub fn render_report(summary: &CompareSummary) -> String {
    use std::fmt::Write;
    let mut out = String::new();
    for (i, r) in summary.results.iter().enumerate() {
        let status = if r.matched { "ok" } else { "MISMATCH" };
        let _ = writeln!(out, "[{i}] {status}  {}", r.form);
        if !r.matched {
            match (&r.tw_value, &r.tw_error) {
                (Some(v), _) => {
                    let _ = writeln!(out, "     tree-walk: {}", clove_runtime::print::pr_str(*v));
                }
                (_, Some(e)) => {
                    let _ = writeln!(out, "     tree-walk: {e}");
                }
                _ => {}
            }
            match (&r.vm_value, &r.vm_error) {
                (Some(v), _) => {
                    let _ = writeln!(out, "     bytecode:  {}", clove_runtime::print::pr_str(*v));
                }
                (_, Some(e)) => {
                    let _ = writeln!(out, "     bytecode:  {e}");
                }
                _ => {}
            }
        }
    }
    let _ = writeln!(
        out,
        "{} forms, {}",
        summary.results.len(),
        if summary.all_match {
            "all matched".to_string()
        } else {
            let mismatches = summary.results.iter().filter(|r| !r.matched).count();
            format!("{mismatches} MISMATCHED")
        }
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matching_programs() {
        let summary = compare_source(
            "(+ 1 2)\n(def f (fn [x] (* x x)))\n(f 9)\n(let [a 1 b 2] [a b])",
        )
        .unwrap();
        assert!(summary.all_match);
        assert_eq!(summary.results.len(), 4);
    }

    #[test]
    fn test_both_failing_is_a_match() {
        let summary = compare_source("(/ 1 0)").unwrap();
        assert!(summary.all_match);
        let r = &summary.results[0];
        assert!(r.tw_error.is_some());
        assert!(r.vm_error.is_some());
    }

    #[test]
    fn test_state_carries_across_forms_per_world() {
        let summary = compare_source("(def counter (atom 0)) (swap! counter inc) @counter")
            .unwrap();
        assert!(summary.all_match);
        let last = summary.results.last().unwrap();
        assert_eq!(last.tw_value.unwrap().as_int(), 1);
    }
}
