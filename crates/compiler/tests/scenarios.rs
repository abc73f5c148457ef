//! End-to-end scenarios run under both back-ends and the compare engine.

use clove_compiler::pipeline::BackendChoice;
use clove_compiler::{Reader, bootstrap, compare_source, eval_string};
use clove_runtime::ns::Env;
use clove_runtime::value::{Value, ValueKind};
use serial_test::serial;

/// An evaluation outcome plus the world its value lives in; values dangle
/// without their env.
struct Outcome {
    env: Env,
    value: Value,
}

fn eval_tw(source: &str) -> Result<Outcome, clove_runtime::Error> {
    let env = bootstrap();
    let value = eval_string(&env, source, BackendChoice::TreeWalk, None)?;
    Ok(Outcome { env, value })
}

fn eval_vm(source: &str) -> Result<Outcome, clove_runtime::Error> {
    let env = bootstrap();
    let value = eval_string(&env, source, BackendChoice::Vm, None)?;
    Ok(Outcome { env, value })
}

/// Evaluate under both back-ends, assert agreement, return the tree-walk
/// outcome.
fn eval_both(source: &str) -> Outcome {
    let tw = eval_tw(source).unwrap_or_else(|e| panic!("tree-walk failed on {source}: {e}"));
    let vm = eval_vm(source).unwrap_or_else(|e| panic!("bytecode failed on {source}: {e}"));
    assert!(
        clove_runtime::eql::eql_alloc(&tw.env.heap, tw.value, vm.value),
        "back-ends disagree on {source}: {} vs {}",
        clove_runtime::print::pr_str(tw.value),
        clove_runtime::print::pr_str(vm.value),
    );
    tw
}

fn err_both(source: &str) -> [clove_runtime::Error; 2] {
    let tw = eval_tw(source).err().unwrap_or_else(|| {
        panic!("tree-walk unexpectedly succeeded on {source}");
    });
    let vm = eval_vm(source).err().unwrap_or_else(|| {
        panic!("bytecode unexpectedly succeeded on {source}");
    });
    [tw, vm]
}

#[test]
fn scenario_01_addition() {
    let o = eval_both("(+ 1 2)");
    assert_eq!(o.value.kind(), ValueKind::Int);
    assert_eq!(o.value.as_int(), 3);
}

#[test]
fn scenario_02_exact_division() {
    let o = eval_both("(/ 10 2)");
    assert_eq!(o.value.kind(), ValueKind::Int);
    assert_eq!(o.value.as_int(), 5);
}

#[test]
fn scenario_03_reciprocal_is_rational() {
    let o = eval_both("(/ 4)");
    assert_eq!(o.value.kind(), ValueKind::Ratio);
    assert_eq!(clove_runtime::print::pr_str(o.value), "1/4");
}

#[test]
fn scenario_04_floor_mod() {
    assert_eq!(eval_both("(mod 7 3)").value.as_int(), 1);
}

#[test]
fn scenario_05_type_error_points_at_operand() {
    for e in err_both("(+ 1 \"hello\")") {
        assert_eq!(e.kind_name(), "type_error");
        // Column of the string literal, not of +
        assert_eq!(e.col, Some(5));
    }
}

#[test]
fn scenario_06_type_error_inside_let() {
    for e in err_both("(let [x 1] (+ x \"bad\"))") {
        assert_eq!(e.kind_name(), "type_error");
        assert_eq!(e.col, Some(16));
    }
}

#[test]
fn scenario_07_letfn() {
    assert_eq!(
        eval_both("(letfn [(f [x] (+ x 10))] (f 5))").value.as_int(),
        15
    );
}

#[test]
fn scenario_08_reduce() {
    assert_eq!(eval_both("(reduce + [1 2 3 4 5])").value.as_int(), 15);
}

#[test]
fn scenario_08b_reduce_with_closure_under_vm() {
    // Nested callback into the live VM: the active-VM hook path
    let o = eval_vm("(reduce (fn [acc x] (+ acc (* x x))) 0 [1 2 3 4])").unwrap();
    assert_eq!(o.value.as_int(), 30);
}

#[test]
#[serial]
fn scenario_09_atom_reset_and_concurrent_swaps() {
    let o = eval_both("(let [a (atom 0)] (reset! a 99) @a)");
    assert_eq!(o.value.as_int(), 99);

    // N concurrent increments through the pool land exactly N times
    let o = eval_both(
        "(def a (atom 99))
         (dorun (pmap (fn [_] (swap! a inc)) (range 8)))
         @a",
    );
    assert_eq!(o.value.as_int(), 107);
    clove_runtime::pool::shutdown_global_pool();
}

#[test]
#[serial]
fn scenario_10_future_deref_and_timeout() {
    let o = eval_both("@(future 42)");
    assert_eq!(o.value.as_int(), 42);

    let o = eval_both("(deref (future (sleep 500) 1) 1 :timeout)");
    assert_eq!(o.value.kind(), ValueKind::Keyword);
    assert_eq!(o.value.as_symbol().name, "timeout");
    clove_runtime::pool::shutdown_global_pool();
}

#[test]
fn scenario_11_regex() {
    let o = eval_both("(re-find #\"\\d+\" \"abc123\")");
    assert_eq!(o.value.as_str(), "123");
}

#[test]
fn scenario_12_list_equals_vector() {
    assert!(eval_both("(= '(1 2) [1 2])").value.as_bool());
}

#[test]
fn scenario_13_empty_lazy_seq_equality() {
    assert!(eval_both("(= (lazy-seq nil) [])").value.as_bool());
    assert!(!eval_both("(= (lazy-seq nil) nil)").value.as_bool());
}

// =============================================================================
// Boundary behavior
// =============================================================================

#[test]
fn boundary_overflow_non_promoting_vs_promoting() {
    // 2^47 - 1 is the top of the small range
    for e in err_both("(+ 140737488355327 1)") {
        assert_eq!(e.kind_name(), "arithmetic_error");
        assert!(e.message.contains("overflow"));
    }

    let o = eval_both("(+' 140737488355327 1)");
    assert_eq!(o.value.kind(), ValueKind::BigInt);
    assert_eq!(clove_runtime::print::pr_str(o.value), "140737488355328N");
}

#[test]
fn boundary_divide_by_zero_attributes_arg_1() {
    for src in ["(/ 1 0)", "(mod 1 0)", "(rem 1 0)", "(/ 1.0 0.0)"] {
        for e in err_both(src) {
            assert_eq!(e.kind_name(), "arithmetic_error", "{src}");
            assert_eq!(e.message, "Divide by zero", "{src}");
            assert_eq!(e.arg_index, Some(1), "{src}");
        }
    }
}

#[test]
fn boundary_lazy_realization_idempotent() {
    let o = eval_both(
        "(def calls (atom 0))
         (def s (lazy-seq (do (swap! calls inc) (list 1 2 3))))
         (doall s)
         (doall s)
         [@calls (first s)]",
    );
    let items = o.value.as_seq_items();
    assert_eq!(items[0].as_int(), 1, "thunk ran exactly once");
    assert_eq!(items[1].as_int(), 1);
}

#[test]
fn boundary_unrealized_lazy_is_truthy() {
    assert!(eval_both("(if (lazy-seq nil) true false)").value.as_bool());
    // Realized-to-nil stays truthy (it is not nil) but equals ()
    assert!(
        eval_both("(let [s (lazy-seq nil)] (doall s) (if s (= s ()) false))")
            .value
            .as_bool()
    );
}

// =============================================================================
// Round-trips
// =============================================================================

#[test]
fn round_trip_pr_str_read() {
    let heap = clove_runtime::heap::Heap::new();
    let sources = [
        "42",
        "-17",
        "2.5",
        "true",
        "nil",
        "\"hi\\n\"",
        "sym",
        "my.ns/sym",
        ":ns/kw",
        "\\a",
        "\\newline",
        "(1 2 3)",
        "[1 [2] \"x\"]",
        "{:a 1, :b [2 3]}",
        "#{7}",
        "1/4",
        "7N",
        "1.25M",
    ];
    for src in sources {
        let mut reader = Reader::new(&heap, src).unwrap();
        let form = reader.next_form().unwrap().unwrap();
        let printed = clove_runtime::print::pr_str(form.value);
        let mut reread = Reader::new(&heap, &printed).unwrap();
        let back = reread.next_form().unwrap().unwrap();
        assert!(
            clove_runtime::eql::eql_alloc(&heap, form.value, back.value),
            "{src} printed as {printed} which read back differently"
        );
    }
}

// =============================================================================
// Universal invariants, spot-checked end to end
// =============================================================================

#[test]
fn invariant_eql_implies_hash_eq() {
    assert!(eval_both("(= (hash '(1 2)) (hash [1 2]))").value.as_bool());
    assert!(
        eval_both("(= (hash {:a 1}) (hash (hash-map :a 1)))")
            .value
            .as_bool()
    );
}

#[test]
fn invariant_dispatch_matches_get() {
    assert!(eval_both("(= ({:a 1} :a) (get {:a 1} :a))").value.as_bool());
    assert!(eval_both("(= (:a {:a 1}) (get {:a 1} :a))").value.as_bool());
    assert!(eval_both("(= (#{2} 2) 2)").value.as_bool());
    assert!(eval_both("(nil? (#{2} 3))").value.as_bool());
    assert!(eval_both("(= (:missing {:a 1} :dflt) :dflt)").value.as_bool());
}

#[test]
fn invariant_mod_identity() {
    let o = eval_both(
        "(reduce
           (fn [ok pair]
             (let [a (first pair) b (second pair)]
               (and ok (= a (+ (* (quot a b) b) (rem a b))))))
           true
           [[17 5] [-17 5] [17 -5] [-17 -5]])",
    );
    assert!(o.value.is_truthy());
}

#[test]
fn invariant_rational_arithmetic_stays_reduced() {
    assert!(eval_both("(= (+ 1/6 1/3) 1/2)").value.as_bool());
    assert!(eval_both("(integer? (+ 1/2 1/2))").value.as_bool());
    assert!(eval_both("(= (* 2/3 3/2) 1)").value.as_bool());
}

// =============================================================================
// Language features across both back-ends
// =============================================================================

#[test]
fn feature_loop_recur() {
    let o = eval_both("(loop [i 0 acc 0] (if (< i 10) (recur (inc i) (+ acc i)) acc))");
    assert_eq!(o.value.as_int(), 45);
}

#[test]
fn feature_fn_recur_and_variadic() {
    let o = eval_both("((fn f [n acc] (if (zero? n) acc (recur (dec n) (* acc n)))) 10 1)");
    assert_eq!(o.value.as_int(), 3628800);

    let o = eval_both("((fn [x & more] [x (count more)]) 1 2 3 4)");
    let items = o.value.as_seq_items();
    assert_eq!(items[0].as_int(), 1);
    assert_eq!(items[1].as_int(), 3);
}

#[test]
fn feature_apply() {
    assert_eq!(eval_both("(apply + 1 2 [3 4])").value.as_int(), 10);
    // Variadic rest binds the trailing seq without re-collection
    let o = eval_both("(apply (fn [x & more] [x (count more)]) 1 '(2 3))");
    let items = o.value.as_seq_items();
    assert_eq!(items[0].as_int(), 1);
    assert_eq!(items[1].as_int(), 2);
}

#[test]
fn feature_multi_arity() {
    let o = eval_both(
        "(defn greet ([] :none) ([x] x) ([x & more] (count more)))
         [(greet) (greet 5) (greet 1 2 3)]",
    );
    let items = o.value.as_seq_items();
    assert_eq!(items[0].as_symbol().name, "none");
    assert_eq!(items[1].as_int(), 5);
    assert_eq!(items[2].as_int(), 2);
}

#[test]
fn feature_closures_capture() {
    let o = eval_both(
        "(def make-adder (fn [n] (fn [x] (+ x n))))
         (def add5 (make-adder 5))
         (add5 37)",
    );
    assert_eq!(o.value.as_int(), 42);
}

#[test]
fn feature_dynamic_binding_and_set() {
    let o = eval_both(
        "(def ^:dynamic *depth* 0)
         (binding [*depth* 1]
           (set! *depth* 5)
           *depth*)",
    );
    assert_eq!(o.value.as_int(), 5);

    // Root untouched after the binding scope pops
    let o = eval_both(
        "(def ^:dynamic *depth* 0)
         (binding [*depth* 1] (set! *depth* 5))
         *depth*",
    );
    assert_eq!(o.value.as_int(), 0);

    // set! without a frame is a value error
    for e in err_both("(do (def ^:dynamic *d* 0) (set! *d* 1))") {
        assert_eq!(e.kind_name(), "value_error");
        assert!(e.message.contains("Can't change/establish root binding"));
    }
}

#[test]
fn feature_try_catch_finally() {
    let o = eval_both(
        "(def log (atom []))
         (def r (try
                  (throw (ex-info \"boom\" {:code 7}))
                  (catch e (:code (ex-data e)))
                  (finally (swap! log conj :cleanup))))
         [r @log]",
    );
    let items = o.value.as_seq_items();
    assert_eq!(items[0].as_int(), 7);
    assert_eq!(items[1].as_seq_items().len(), 1);
}

#[test]
fn feature_uncaught_throw_propagates() {
    for e in err_both("(throw :bang)") {
        assert_eq!(e.kind_name(), "exception");
    }
}

#[test]
fn feature_lazy_chain_fusion() {
    let o = eval_both(
        "(= (doall (take 5 (filter even? (map (fn [x] (* x x)) (range)))))
            '(0 4 16 36 64))",
    );
    assert!(o.value.as_bool());
}

#[test]
fn feature_nested_filters_flatten() {
    // A tower of filters over an unbounded range with a bounding take
    let o = eval_both(
        "(count (doall (take 3 (filter (fn [x] (pos? x))
                        (filter even?
                          (filter (fn [x] (< x 100)) (range 1 1000)))))))",
    );
    assert_eq!(o.value.as_int(), 3);
}

#[test]
fn feature_multimethods() {
    let o = eval_both(
        "(def speak (multifn :speak first))
         (add-method! speak :dog (fn [_] \"woof\"))
         (add-method! speak :default (fn [_] \"...\"))
         [(speak [:dog]) (speak [:fish])]",
    );
    let items = o.value.as_seq_items();
    assert_eq!(items[0].as_str(), "woof");
    assert_eq!(items[1].as_str(), "...");
}

#[test]
fn feature_protocol_methods() {
    let o = eval_both(
        "(def describe (protocol-fn :describe))
         (extend-type! describe \"integer\" (fn [x] :int))
         (extend-type! describe \"string\" (fn [x] :str))
         [(describe 3) (describe \"s\")]",
    );
    let items = o.value.as_seq_items();
    assert_eq!(items[0].as_symbol().name, "int");
    assert_eq!(items[1].as_symbol().name, "str");
}

#[test]
fn feature_defmacro() {
    let o = eval_both(
        "(defmacro unless [test then els] (list 'if test els then))
         (unless false :yes :no)",
    );
    assert_eq!(o.value.as_symbol().name, "yes");
}

#[test]
fn feature_transient_build() {
    let o = eval_both(
        "(count (persistent! (reduce conj! (transient []) (doall (range 100)))))",
    );
    assert_eq!(o.value.as_int(), 100);
}

#[test]
#[serial]
fn feature_agents_in_language() {
    let o = eval_both(
        "(def a (agent 0))
         (send a + 10)
         (send a + 32)
         (await a)
         @a",
    );
    assert_eq!(o.value.as_int(), 42);
    clove_runtime::pool::shutdown_global_pool();
}

#[test]
fn feature_print_vars_respected() {
    let o = eval_both("(binding [*print-length* 2] (pr-str [1 2 3 4]))");
    assert_eq!(o.value.as_str(), "[1 2 ...]");
    let o = eval_both("(binding [*print-level* 1] (pr-str [1 [2 [3]]]))");
    assert_eq!(o.value.as_str(), "[1 #]");
}

#[test]
fn feature_byte_arrays() {
    let o = eval_both(
        "(def buf (byte-array 4))
         (aset buf 0 255)
         (aset buf 1 300)
         [(aget buf 0) (aget buf 1) (aget buf 2) (alength buf)]",
    );
    let items = o.value.as_seq_items();
    assert_eq!(items[0].as_int(), 255);
    // Values store modulo 256
    assert_eq!(items[1].as_int(), 44);
    assert_eq!(items[2].as_int(), 0);
    assert_eq!(items[3].as_int(), 4);
}

#[test]
fn feature_string_and_codepoint_ops() {
    assert_eq!(eval_both("(subs \"hello\" 1 3)").value.as_str(), "el");
    assert_eq!(eval_both("(str \"a\" 1 nil :k)").value.as_str(), "a1:k");
    assert_eq!(eval_both("(count \"h\u{00e9}llo\")").value.as_int(), 5);
}

// =============================================================================
// Compare engine over the scenario set
// =============================================================================

#[test]
#[serial]
fn compare_engine_over_scenarios() {
    let source = "
(+ 1 2)
(/ 10 2)
(/ 4)
(mod 7 3)
(letfn [(f [x] (+ x 10))] (f 5))
(reduce + [1 2 3 4 5])
(let [a (atom 0)] (reset! a 99) @a)
(re-find #\"\\d+\" \"abc123\")
(= '(1 2) [1 2])
(= (lazy-seq nil) [])
(= (lazy-seq nil) nil)
";
    let summary = compare_source(source).unwrap();
    assert!(
        summary.all_match,
        "{}",
        clove_compiler::engine::render_report(&summary)
    );
}

#[test]
fn compare_engine_counts_shared_failures_as_match() {
    let summary = compare_source("(+ 1 \"no\")\n(/ 1 0)\n(unresolvable)").unwrap();
    assert!(summary.all_match);
}

// =============================================================================
// File-driven evaluation (the CLI `run` path)
// =============================================================================

#[test]
fn run_source_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("prog.clv");
    std::fs::write(
        &path,
        "(ns app.main)\n(def answer (* 6 7))\n(defn shout [x] (str x \"!\"))\n(shout answer)\n",
    )
    .unwrap();

    let source = std::fs::read_to_string(&path).unwrap();
    let o = eval_both(&source);
    assert_eq!(o.value.as_str(), "42!");
    assert_eq!(o.env.current_ns().name, "app.main");
}
