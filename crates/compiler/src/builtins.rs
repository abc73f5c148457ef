//! Native functions and bootstrap
//!
//! Interns the `clove.core` builtin set, registers the print vars,
//! installs the dispatch bridge vtable, and refers core into user
//! namespaces. Bootstrap must run before the first `call_fn_val`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use clove_runtime::agent;
use clove_runtime::arith;
use clove_runtime::collections;
use clove_runtime::dispatch::{self, Bridges, SeqOps};
use clove_runtime::eql;
use clove_runtime::error::{Error, Result};
use clove_runtime::heap::Heap;
use clove_runtime::ns::{Env, Namespace, eval_env};
use clove_runtime::print;
use clove_runtime::refs;
use clove_runtime::seq::{self, SeqCursor};
use clove_runtime::value::{
    AgentErrorMode, BuiltinFn, HeapObj, LazyMeta, LazyOp, Value, ValueKind,
};

/// Create a bootstrapped environment: core namespace populated, bridges
/// installed, positioned in `user` with core referred.
pub fn bootstrap() -> Env {
    let env = Env::new("user");
    let core = env.registry.find_or_create("clove.core");

    install_builtins(&env.heap, &core);
    install_print_vars(&core);

    dispatch::install_bridges(Bridges {
        tree_walk: crate::treewalk::bridge,
        bytecode: crate::vm::bridge,
        type_key: |v| v.type_name(),
        seq_ops: SeqOps {
            seq: seq::seq,
            first: seq::first,
            rest: seq::rest,
        },
    });

    refer_core(&env, &env.current_ns());
    env
}

/// Refer every public core var into `ns`. Idempotent.
pub fn refer_core(env: &Env, ns: &Arc<Namespace>) {
    if ns.name == "clove.core" {
        return;
    }
    let core = env.registry.find_or_create("clove.core");
    for name in core.mapped_names() {
        if let Some(var) = core.lookup(&name) {
            if !var.is_private() {
                ns.refer(&name, var);
            }
        }
    }
}

fn install_print_vars(core: &Arc<Namespace>) {
    let length = core.intern("*print-length*");
    length.set_dynamic(true);
    let level = core.intern("*print-level*");
    level.set_dynamic(true);
    print::register_print_vars(length, level);
}

fn install_builtins(heap: &Heap, core: &Arc<Namespace>) {
    let defs: &[(&'static str, BuiltinFn)] = &[
        // Arithmetic
        ("+", bi_add),
        ("-", bi_sub),
        ("*", bi_mul),
        ("/", bi_div),
        ("+'", bi_add_promoting),
        ("-'", bi_sub_promoting),
        ("*'", bi_mul_promoting),
        ("mod", bi_mod),
        ("rem", bi_rem),
        ("quot", bi_quot),
        ("inc", bi_inc),
        ("dec", bi_dec),
        ("min", bi_min),
        ("max", bi_max),
        ("double", bi_double),
        // Comparison
        ("=", bi_eq),
        ("not=", bi_not_eq),
        ("==", bi_num_eq),
        ("<", bi_lt),
        ("<=", bi_le),
        (">", bi_gt),
        (">=", bi_ge),
        ("compare", bi_compare),
        // Predicates
        ("nil?", bi_nil_p),
        ("some?", bi_some_p),
        ("true?", bi_true_p),
        ("false?", bi_false_p),
        ("boolean?", bi_boolean_p),
        ("number?", bi_number_p),
        ("integer?", bi_integer_p),
        ("float?", bi_float_p),
        ("ratio?", bi_ratio_p),
        ("decimal?", bi_decimal_p),
        ("string?", bi_string_p),
        ("char?", bi_char_p),
        ("keyword?", bi_keyword_p),
        ("symbol?", bi_symbol_p),
        ("fn?", bi_fn_p),
        ("var?", bi_var_p),
        ("map?", bi_map_p),
        ("vector?", bi_vector_p),
        ("list?", bi_list_p),
        ("set?", bi_set_p),
        ("coll?", bi_coll_p),
        ("seq?", bi_seq_p),
        ("empty?", bi_empty_p),
        ("zero?", bi_zero_p),
        ("pos?", bi_pos_p),
        ("neg?", bi_neg_p),
        ("even?", bi_even_p),
        ("odd?", bi_odd_p),
        ("realized?", bi_realized_p),
        ("reduced?", bi_reduced_p),
        // Core
        ("identity", bi_identity),
        ("not", bi_not),
        ("identical?", bi_identical_p),
        ("hash", bi_hash),
        ("type", bi_type),
        ("name", bi_name),
        ("namespace", bi_namespace),
        ("keyword", bi_keyword),
        ("symbol", bi_symbol),
        ("gensym", bi_gensym),
        ("meta", bi_meta),
        // Strings and printing
        ("str", bi_str),
        ("pr-str", bi_pr_str),
        ("subs", bi_subs),
        ("print", bi_print),
        ("println", bi_println),
        ("pr", bi_pr),
        ("prn", bi_prn),
        ("newline", bi_newline),
        // Collections
        ("list", bi_list),
        ("vector", bi_vector),
        ("vec", bi_vec),
        ("hash-map", bi_hash_map),
        ("array-map", bi_array_map),
        ("hash-set", bi_hash_set),
        ("set", bi_set),
        ("get", bi_get),
        ("assoc", bi_assoc),
        ("dissoc", bi_dissoc),
        ("conj", bi_conj),
        ("contains?", bi_contains_p),
        ("count", bi_count),
        ("nth", bi_nth),
        ("keys", bi_keys),
        ("vals", bi_vals),
        ("into", bi_into),
        ("concat", bi_concat),
        // Sequences
        ("seq", bi_seq),
        ("first", bi_first),
        ("rest", bi_rest),
        ("next", bi_next),
        ("second", bi_second),
        ("last", bi_last),
        ("cons", bi_cons),
        ("range", bi_range),
        ("map", bi_map),
        ("filter", bi_filter),
        ("take", bi_take),
        ("reduce", bi_reduce),
        ("apply", bi_apply),
        ("doall", bi_doall),
        ("dorun", bi_dorun),
        ("lazy-seq*", bi_lazy_seq_star),
        ("reduced", bi_reduced),
        // References
        ("atom", bi_atom),
        ("deref", bi_deref),
        ("reset!", bi_reset_bang),
        ("swap!", bi_swap_bang),
        ("compare-and-set!", bi_cas_bang),
        ("volatile!", bi_volatile),
        ("vreset!", bi_vreset_bang),
        ("vswap!", bi_vswap_bang),
        ("delay*", bi_delay_star),
        ("force", bi_force),
        // Futures, agents, pool
        ("future-call", bi_future_call),
        ("future-done?", bi_future_done_p),
        ("pmap", bi_pmap),
        ("agent", bi_agent),
        ("send", bi_send),
        ("send-off", bi_send),
        ("await", bi_await),
        ("agent-error", bi_agent_error),
        ("set-error-mode!", bi_set_error_mode_bang),
        ("set-error-handler!", bi_set_error_handler_bang),
        ("restart-agent", bi_restart_agent),
        ("add-watch", bi_add_watch),
        ("remove-watch", bi_remove_watch),
        ("shutdown-agents", bi_shutdown_agents),
        // Transients
        ("transient", bi_transient),
        ("persistent!", bi_persistent_bang),
        ("conj!", bi_conj_bang),
        ("assoc!", bi_assoc_bang),
        // Regex
        ("re-pattern", bi_re_pattern),
        ("re-find", bi_re_find),
        ("re-matches", bi_re_matches),
        ("re-matcher", bi_re_matcher),
        // Exceptions
        ("ex-info", bi_ex_info),
        ("ex-message", bi_ex_message),
        ("ex-data", bi_ex_data),
        // Multimethods and protocols
        ("multifn", bi_multifn),
        ("add-method!", bi_add_method_bang),
        ("protocol-fn", bi_protocol_fn),
        ("extend-type!", bi_extend_type_bang),
        ("type-key", bi_type_key),
        // Namespaces
        ("in-ns", bi_in_ns),
        ("create-ns", bi_create_ns),
        ("intern", bi_intern),
        ("alias", bi_alias),
        ("refer", bi_refer),
        // Raw byte arrays
        ("byte-array", bi_byte_array),
        ("aget", bi_aget),
        ("aset", bi_aset),
        ("alength", bi_alength),
        // Lifecycle
        ("add-shutdown-hook!", bi_add_shutdown_hook_bang),
        ("shutdown-requested?", bi_shutdown_requested_p),
        ("sleep", bi_sleep),
    ];
    for (name, f) in defs {
        let var = core.intern(name);
        var.set_root(heap.builtin(name, *f));
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn expect_args(name: &str, args: &[Value], min: usize, max: Option<usize>) -> Result<()> {
    let ok = args.len() >= min && max.map(|m| args.len() <= m).unwrap_or(true);
    if !ok {
        return Err(Error::arity(format!(
            "Wrong number of args ({}) passed to: {}",
            args.len(),
            name
        )));
    }
    Ok(())
}

fn with_env<R>(name: &str, f: impl FnOnce(&Env) -> Result<R>) -> Result<R> {
    eval_env(|env| match env {
        Some(env) => f(env),
        None => Err(Error::internal(format!(
            "{name} requires an active evaluation environment"
        ))),
    })
}

fn as_int_arg(name: &str, v: Value, idx: usize) -> Result<i64> {
    if v.is_int() {
        Ok(v.as_int())
    } else {
        Err(Error::type_error(format!("{name} expects an integer")).with_arg(idx))
    }
}

fn symbol_name(v: Value, what: &str, idx: usize) -> Result<String> {
    if v.is_heap() {
        if let HeapObj::Symbol(s) | HeapObj::Keyword(s) = v.obj() {
            return Ok(s.name.clone());
        }
        if let HeapObj::Str(s) = v.obj() {
            return Ok(s.clone());
        }
    }
    Err(Error::type_error(format!("{what} must be a symbol, keyword, or string")).with_arg(idx))
}

fn seq_to_vec(heap: &Heap, v: Value) -> Result<Vec<Value>> {
    if v.is_nil() {
        return Ok(Vec::new());
    }
    let s = seq::seq(heap, v)?;
    if s.is_nil() {
        return Ok(Vec::new());
    }
    SeqCursor::new(s).collect(Some(heap))
}

// =============================================================================
// Arithmetic
// =============================================================================

fn fold_arith(
    heap: &Heap,
    args: &[Value],
    unit: Value,
    op: fn(&Heap, Value, Value) -> Result<Value>,
) -> Result<Value> {
    match args {
        [] => Ok(unit),
        [only] => op(heap, unit, *only),
        [first, rest @ ..] => {
            let mut acc = *first;
            for (i, v) in rest.iter().enumerate() {
                acc = op(heap, acc, *v).map_err(|e| shift_arg(e, i + 1))?;
            }
            Ok(acc)
        }
    }
}

/// Re-point a binary op's argument attribution at the variadic position.
fn shift_arg(e: Error, base: usize) -> Error {
    match e.arg_index {
        Some(1) => e.with_arg(base),
        Some(0) if base > 1 => {
            // Accumulator side: the fault surfaced earlier in the chain
            e
        }
        _ => e,
    }
}

fn bi_add(heap: &Heap, args: &[Value]) -> Result<Value> {
    fold_arith(heap, args, Value::int(0), arith::add)
}

fn bi_sub(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("-", args, 1, None)?;
    if args.len() == 1 {
        return arith::sub(heap, Value::int(0), args[0]);
    }
    let mut acc = args[0];
    for (i, v) in args[1..].iter().enumerate() {
        acc = arith::sub(heap, acc, *v).map_err(|e| shift_arg(e, i + 1))?;
    }
    Ok(acc)
}

fn bi_mul(heap: &Heap, args: &[Value]) -> Result<Value> {
    fold_arith(heap, args, Value::int(1), arith::mul)
}

fn bi_div(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("/", args, 1, None)?;
    if args.len() == 1 {
        return arith::div(heap, Value::int(1), args[0]);
    }
    let mut acc = args[0];
    for (i, v) in args[1..].iter().enumerate() {
        acc = arith::div(heap, acc, *v).map_err(|e| shift_arg(e, i + 1))?;
    }
    Ok(acc)
}

fn bi_add_promoting(heap: &Heap, args: &[Value]) -> Result<Value> {
    fold_arith(heap, args, Value::int(0), arith::add_promoting)
}

fn bi_sub_promoting(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("-'", args, 1, None)?;
    if args.len() == 1 {
        return arith::sub_promoting(heap, Value::int(0), args[0]);
    }
    let mut acc = args[0];
    for v in &args[1..] {
        acc = arith::sub_promoting(heap, acc, *v)?;
    }
    Ok(acc)
}

fn bi_mul_promoting(heap: &Heap, args: &[Value]) -> Result<Value> {
    fold_arith(heap, args, Value::int(1), arith::mul_promoting)
}

fn bi_mod(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("mod", args, 2, Some(2))?;
    arith::modulo(heap, args[0], args[1])
}

fn bi_rem(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("rem", args, 2, Some(2))?;
    arith::rem(heap, args[0], args[1])
}

fn bi_quot(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("quot", args, 2, Some(2))?;
    let r = arith::rem(heap, args[0], args[1])?;
    let exact = arith::sub_promoting(heap, args[0], r)?;
    arith::div(heap, exact, args[1])
}

fn bi_inc(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("inc", args, 1, Some(1))?;
    arith::add(heap, args[0], Value::int(1))
}

fn bi_dec(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("dec", args, 1, Some(1))?;
    arith::sub(heap, args[0], Value::int(1))
}

fn bi_min(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("min", args, 1, None)?;
    let _ = heap;
    let mut best = args[0];
    for v in &args[1..] {
        if arith::compare(*v, best)? == std::cmp::Ordering::Less {
            best = *v;
        }
    }
    Ok(best)
}

fn bi_max(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("max", args, 1, None)?;
    let _ = heap;
    let mut best = args[0];
    for v in &args[1..] {
        if arith::compare(*v, best)? == std::cmp::Ordering::Greater {
            best = *v;
        }
    }
    Ok(best)
}

fn bi_double(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("double", args, 1, Some(1))?;
    let _ = heap;
    Ok(Value::float(arith::to_float(args[0])?))
}

// =============================================================================
// Comparison
// =============================================================================

fn bi_eq(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("=", args, 1, None)?;
    for pair in args.windows(2) {
        if !eql::eql_alloc(heap, pair[0], pair[1]) {
            return Ok(Value::bool_val(false));
        }
    }
    Ok(Value::bool_val(true))
}

fn bi_not_eq(heap: &Heap, args: &[Value]) -> Result<Value> {
    let eq = bi_eq(heap, args)?;
    Ok(Value::bool_val(!eq.as_bool()))
}

fn bi_num_eq(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("==", args, 1, None)?;
    let _ = heap;
    for pair in args.windows(2) {
        if !arith::num_eq(pair[0], pair[1]) {
            return Ok(Value::bool_val(false));
        }
    }
    Ok(Value::bool_val(true))
}

fn compare_chain(args: &[Value], name: &str, keep: fn(std::cmp::Ordering) -> bool) -> Result<Value> {
    expect_args(name, args, 1, None)?;
    for (i, pair) in args.windows(2).enumerate() {
        let ord = arith::compare(pair[0], pair[1]).map_err(|e| shift_arg(e, i + 1))?;
        if !keep(ord) {
            return Ok(Value::bool_val(false));
        }
    }
    Ok(Value::bool_val(true))
}

fn bi_lt(_heap: &Heap, args: &[Value]) -> Result<Value> {
    compare_chain(args, "<", |o| o == std::cmp::Ordering::Less)
}

fn bi_le(_heap: &Heap, args: &[Value]) -> Result<Value> {
    compare_chain(args, "<=", |o| o != std::cmp::Ordering::Greater)
}

fn bi_gt(_heap: &Heap, args: &[Value]) -> Result<Value> {
    compare_chain(args, ">", |o| o == std::cmp::Ordering::Greater)
}

fn bi_ge(_heap: &Heap, args: &[Value]) -> Result<Value> {
    compare_chain(args, ">=", |o| o != std::cmp::Ordering::Less)
}

fn bi_compare(_heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("compare", args, 2, Some(2))?;
    let ord = arith::compare(args[0], args[1])?;
    Ok(Value::int(match ord {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    }))
}

// =============================================================================
// Predicates
// =============================================================================

fn pred(args: &[Value], name: &str, f: impl Fn(Value) -> bool) -> Result<Value> {
    expect_args(name, args, 1, Some(1))?;
    Ok(Value::bool_val(f(args[0])))
}

fn bi_nil_p(_h: &Heap, args: &[Value]) -> Result<Value> {
    pred(args, "nil?", |v| v.is_nil())
}

fn bi_some_p(_h: &Heap, args: &[Value]) -> Result<Value> {
    pred(args, "some?", |v| !v.is_nil())
}

fn bi_true_p(_h: &Heap, args: &[Value]) -> Result<Value> {
    pred(args, "true?", |v| v.is_bool() && v.as_bool())
}

fn bi_false_p(_h: &Heap, args: &[Value]) -> Result<Value> {
    pred(args, "false?", |v| v.is_bool() && !v.as_bool())
}

fn bi_boolean_p(_h: &Heap, args: &[Value]) -> Result<Value> {
    pred(args, "boolean?", |v| v.is_bool())
}

fn bi_number_p(_h: &Heap, args: &[Value]) -> Result<Value> {
    pred(args, "number?", arith::is_number)
}

fn bi_integer_p(_h: &Heap, args: &[Value]) -> Result<Value> {
    pred(args, "integer?", |v| {
        matches!(v.kind(), ValueKind::Int | ValueKind::BigInt)
    })
}

fn bi_float_p(_h: &Heap, args: &[Value]) -> Result<Value> {
    pred(args, "float?", |v| v.is_float())
}

fn bi_ratio_p(_h: &Heap, args: &[Value]) -> Result<Value> {
    pred(args, "ratio?", |v| v.kind() == ValueKind::Ratio)
}

fn bi_decimal_p(_h: &Heap, args: &[Value]) -> Result<Value> {
    pred(args, "decimal?", |v| v.kind() == ValueKind::BigDec)
}

fn bi_string_p(_h: &Heap, args: &[Value]) -> Result<Value> {
    pred(args, "string?", |v| v.kind() == ValueKind::String)
}

fn bi_char_p(_h: &Heap, args: &[Value]) -> Result<Value> {
    pred(args, "char?", |v| v.is_char())
}

fn bi_keyword_p(_h: &Heap, args: &[Value]) -> Result<Value> {
    pred(args, "keyword?", |v| v.kind() == ValueKind::Keyword)
}

fn bi_symbol_p(_h: &Heap, args: &[Value]) -> Result<Value> {
    pred(args, "symbol?", |v| v.kind() == ValueKind::Symbol)
}

fn bi_fn_p(_h: &Heap, args: &[Value]) -> Result<Value> {
    pred(args, "fn?", |v| {
        matches!(
            v.kind(),
            ValueKind::Fn
                | ValueKind::Builtin
                | ValueKind::Multi
                | ValueKind::Protocol
                | ValueKind::Foreign
        )
    })
}

fn bi_var_p(_h: &Heap, args: &[Value]) -> Result<Value> {
    pred(args, "var?", |v| v.kind() == ValueKind::Var)
}

fn bi_map_p(_h: &Heap, args: &[Value]) -> Result<Value> {
    pred(args, "map?", collections::is_map)
}

fn bi_vector_p(_h: &Heap, args: &[Value]) -> Result<Value> {
    pred(args, "vector?", |v| v.kind() == ValueKind::Vector)
}

fn bi_list_p(_h: &Heap, args: &[Value]) -> Result<Value> {
    pred(args, "list?", |v| {
        matches!(v.kind(), ValueKind::List | ValueKind::Cons | ValueKind::Chunked)
    })
}

fn bi_set_p(_h: &Heap, args: &[Value]) -> Result<Value> {
    pred(args, "set?", |v| v.kind() == ValueKind::HashSet)
}

fn bi_coll_p(_h: &Heap, args: &[Value]) -> Result<Value> {
    pred(args, "coll?", |v| {
        matches!(
            v.kind(),
            ValueKind::List
                | ValueKind::Vector
                | ValueKind::ArrayMap
                | ValueKind::HashMap
                | ValueKind::HashSet
                | ValueKind::Cons
                | ValueKind::Chunked
                | ValueKind::LazySeq
        )
    })
}

fn bi_seq_p(_h: &Heap, args: &[Value]) -> Result<Value> {
    pred(args, "seq?", |v| {
        matches!(
            v.kind(),
            ValueKind::List | ValueKind::Cons | ValueKind::Chunked | ValueKind::LazySeq
        )
    })
}

fn bi_empty_p(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("empty?", args, 1, Some(1))?;
    Ok(Value::bool_val(seq::seq(heap, args[0])?.is_nil()))
}

fn bi_zero_p(_h: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("zero?", args, 1, Some(1))?;
    Ok(Value::bool_val(arith::num_eq(args[0], Value::int(0))))
}

fn bi_pos_p(_h: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("pos?", args, 1, Some(1))?;
    Ok(Value::bool_val(
        arith::compare(args[0], Value::int(0))? == std::cmp::Ordering::Greater,
    ))
}

fn bi_neg_p(_h: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("neg?", args, 1, Some(1))?;
    Ok(Value::bool_val(
        arith::compare(args[0], Value::int(0))? == std::cmp::Ordering::Less,
    ))
}

fn bi_even_p(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("even?", args, 1, Some(1))?;
    let r = arith::rem(heap, args[0], Value::int(2))?;
    Ok(Value::bool_val(arith::num_eq(r, Value::int(0))))
}

fn bi_odd_p(heap: &Heap, args: &[Value]) -> Result<Value> {
    let even = bi_even_p(heap, args)?;
    Ok(Value::bool_val(!even.as_bool()))
}

fn bi_realized_p(_h: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("realized?", args, 1, Some(1))?;
    let v = args[0];
    let realized = match v.kind() {
        ValueKind::LazySeq => seq::is_realized(v),
        ValueKind::Delay => refs::delay_is_forced(v),
        ValueKind::Future => match v.obj() {
            HeapObj::Future(f) => f.is_done(),
            _ => true,
        },
        _ => true,
    };
    Ok(Value::bool_val(realized))
}

fn bi_reduced_p(_h: &Heap, args: &[Value]) -> Result<Value> {
    pred(args, "reduced?", refs::is_reduced)
}

// =============================================================================
// Core
// =============================================================================

fn bi_identity(_h: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("identity", args, 1, Some(1))?;
    Ok(args[0])
}

fn bi_not(_h: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("not", args, 1, Some(1))?;
    Ok(Value::bool_val(!args[0].is_truthy()))
}

fn bi_identical_p(_h: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("identical?", args, 2, Some(2))?;
    Ok(Value::bool_val(args[0].identical(args[1])))
}

fn bi_hash(_h: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("hash", args, 1, Some(1))?;
    Ok(Value::int(clove_runtime::hash::hash_value(args[0]) as i64))
}

fn bi_type(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("type", args, 1, Some(1))?;
    Ok(heap.keyword(None, dispatch::type_key(args[0])))
}

fn bi_name(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("name", args, 1, Some(1))?;
    let v = args[0];
    if v.is_heap() {
        match v.obj() {
            HeapObj::Symbol(s) | HeapObj::Keyword(s) => return Ok(heap.str_value(&s.name)),
            HeapObj::Str(_) => return Ok(v),
            _ => {}
        }
    }
    Err(Error::type_error("name expects a symbol, keyword, or string").with_arg(0))
}

fn bi_namespace(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("namespace", args, 1, Some(1))?;
    let v = args[0];
    if v.is_heap() {
        if let HeapObj::Symbol(s) | HeapObj::Keyword(s) = v.obj() {
            return Ok(match &s.ns {
                Some(ns) => heap.str_value(ns),
                None => Value::nil(),
            });
        }
    }
    Err(Error::type_error("namespace expects a symbol or keyword").with_arg(0))
}

fn bi_keyword(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("keyword", args, 1, Some(2))?;
    match args {
        [name] => {
            let name = symbol_name(*name, "keyword name", 0)?;
            Ok(heap.keyword(None, &name))
        }
        [ns, name] => {
            let ns = symbol_name(*ns, "keyword namespace", 0)?;
            let name = symbol_name(*name, "keyword name", 1)?;
            Ok(heap.keyword(Some(&ns), &name))
        }
        _ => unreachable!(),
    }
}

fn bi_symbol(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("symbol", args, 1, Some(2))?;
    match args {
        [name] => {
            let name = symbol_name(*name, "symbol name", 0)?;
            Ok(heap.symbol(None, &name))
        }
        [ns, name] => {
            let ns = symbol_name(*ns, "symbol namespace", 0)?;
            let name = symbol_name(*name, "symbol name", 1)?;
            Ok(heap.symbol(Some(&ns), &name))
        }
        _ => unreachable!(),
    }
}

static GENSYM_COUNTER: AtomicU64 = AtomicU64::new(0);

fn bi_gensym(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("gensym", args, 0, Some(1))?;
    let prefix = match args.first() {
        Some(p) => symbol_name(*p, "gensym prefix", 0)?,
        None => "G__".to_string(),
    };
    let n = GENSYM_COUNTER.fetch_add(1, Ordering::Relaxed);
    Ok(heap.symbol(None, &format!("{prefix}{n}")))
}

fn bi_meta(_h: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("meta", args, 1, Some(1))?;
    let v = args[0];
    if v.is_heap() {
        if let HeapObj::Var(var) = v.obj() {
            if let Some(user) = var.meta.lock().expect("var meta poisoned").user {
                return Ok(user);
            }
        }
    }
    Ok(Value::nil())
}

// =============================================================================
// Strings and printing
// =============================================================================

fn bi_str(heap: &Heap, args: &[Value]) -> Result<Value> {
    let mut out = String::new();
    print::with_print_heap(heap, || {
        for a in args {
            out.push_str(&print::display_str(*a));
        }
    });
    Ok(heap.str_value(out))
}

fn bi_pr_str(heap: &Heap, args: &[Value]) -> Result<Value> {
    let rendered = print::with_print_heap(heap, || {
        args.iter()
            .map(|a| print::pr_str(*a))
            .collect::<Vec<_>>()
            .join(" ")
    });
    Ok(heap.str_value(rendered))
}

fn bi_subs(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("subs", args, 2, Some(3))?;
    let s = args[0];
    if s.kind() != ValueKind::String {
        return Err(Error::type_error("subs expects a string").with_arg(0));
    }
    let text = s.as_str();
    let start = as_int_arg("subs", args[1], 1)?.max(0) as usize;
    let end = match args.get(2) {
        Some(e) => as_int_arg("subs", *e, 2)?.max(0) as usize,
        None => clove_core::codepoint::count(text),
    };
    match clove_core::codepoint::slice(text, start, end) {
        Some(sub) => Ok(heap.str_value(sub)),
        None => Err(Error::value_error(format!(
            "subs range {start}..{end} out of bounds"
        ))),
    }
}

fn print_values(heap: &Heap, args: &[Value], readable: bool, trailing_newline: bool) {
    use std::io::Write;
    let rendered = print::with_print_heap(heap, || {
        args.iter()
            .map(|a| {
                if readable {
                    print::pr_str(*a)
                } else {
                    print::display_str(*a)
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    });
    let stdout = std::io::stdout();
    let mut lock = stdout.lock();
    let _ = lock.write_all(rendered.as_bytes());
    if trailing_newline {
        let _ = lock.write_all(b"\n");
    }
    let _ = lock.flush();
}

fn bi_print(heap: &Heap, args: &[Value]) -> Result<Value> {
    print_values(heap, args, false, false);
    Ok(Value::nil())
}

fn bi_println(heap: &Heap, args: &[Value]) -> Result<Value> {
    print_values(heap, args, false, true);
    Ok(Value::nil())
}

fn bi_pr(heap: &Heap, args: &[Value]) -> Result<Value> {
    print_values(heap, args, true, false);
    Ok(Value::nil())
}

fn bi_prn(heap: &Heap, args: &[Value]) -> Result<Value> {
    print_values(heap, args, true, true);
    Ok(Value::nil())
}

fn bi_newline(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("newline", args, 0, Some(0))?;
    print_values(heap, &[], false, true);
    Ok(Value::nil())
}

// =============================================================================
// Collections
// =============================================================================

fn bi_list(heap: &Heap, args: &[Value]) -> Result<Value> {
    Ok(heap.list_from(args.to_vec()))
}

fn bi_vector(heap: &Heap, args: &[Value]) -> Result<Value> {
    Ok(heap.vector_from(args.to_vec()))
}

fn bi_vec(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("vec", args, 1, Some(1))?;
    Ok(heap.vector_from(seq_to_vec(heap, args[0])?))
}

fn bi_hash_map(heap: &Heap, args: &[Value]) -> Result<Value> {
    if args.len() % 2 != 0 {
        return Err(Error::arity("hash-map expects an even number of arguments"));
    }
    let pairs = args.chunks(2).map(|p| (p[0], p[1])).collect();
    Ok(collections::map_from_pairs(heap, pairs))
}

fn bi_array_map(heap: &Heap, args: &[Value]) -> Result<Value> {
    if args.len() % 2 != 0 {
        return Err(Error::arity("array-map expects an even number of arguments"));
    }
    Ok(heap.array_map(args.chunks(2).map(|p| (p[0], p[1])).collect()))
}

fn bi_hash_set(heap: &Heap, args: &[Value]) -> Result<Value> {
    Ok(collections::set_from_items(heap, args.to_vec()))
}

fn bi_set(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("set", args, 1, Some(1))?;
    Ok(collections::set_from_items(heap, seq_to_vec(heap, args[0])?))
}

fn bi_get(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("get", args, 2, Some(3))?;
    let coll = args[0];
    let key = args[1];
    let fallback = args.get(2).copied().unwrap_or_else(Value::nil);
    let _ = heap;
    if collections::is_map(coll) {
        return Ok(collections::map_get(coll, key).unwrap_or(fallback));
    }
    match coll.kind() {
        ValueKind::HashSet => Ok(if collections::set_contains(coll, key) {
            key
        } else {
            fallback
        }),
        ValueKind::Vector => {
            if key.is_int() {
                let idx = key.as_int();
                let items = coll.as_seq_items();
                if idx >= 0 && (idx as usize) < items.len() {
                    return Ok(items[idx as usize]);
                }
            }
            Ok(fallback)
        }
        ValueKind::Nil => Ok(fallback),
        _ => Ok(fallback),
    }
}

fn bi_assoc(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("assoc", args, 3, None)?;
    if args.len() % 2 != 1 {
        return Err(Error::arity("assoc expects key/value pairs"));
    }
    let mut coll = args[0];
    for pair in args[1..].chunks(2) {
        coll = collections::assoc(heap, coll, pair[0], pair[1])?;
    }
    Ok(coll)
}

fn bi_dissoc(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("dissoc", args, 1, None)?;
    let mut coll = args[0];
    for key in &args[1..] {
        coll = collections::dissoc(heap, coll, *key)?;
    }
    Ok(coll)
}

fn bi_conj(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("conj", args, 1, None)?;
    let mut coll = args[0];
    for elem in &args[1..] {
        coll = collections::conj(heap, coll, *elem)?;
    }
    Ok(coll)
}

fn bi_contains_p(_h: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("contains?", args, 2, Some(2))?;
    let coll = args[0];
    let key = args[1];
    let found = if collections::is_map(coll) {
        collections::map_get(coll, key).is_some()
    } else if coll.kind() == ValueKind::HashSet {
        collections::set_contains(coll, key)
    } else if coll.kind() == ValueKind::Vector {
        key.is_int() && {
            let idx = key.as_int();
            idx >= 0 && (idx as usize) < coll.as_seq_items().len()
        }
    } else {
        false
    };
    Ok(Value::bool_val(found))
}

fn bi_count(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("count", args, 1, Some(1))?;
    Ok(Value::int(seq::count(heap, args[0])? as i64))
}

fn bi_nth(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("nth", args, 2, Some(3))?;
    let n = as_int_arg("nth", args[1], 1)?;
    if n < 0 {
        return Err(Error::value_error("nth index must be non-negative").with_arg(1));
    }
    match seq::nth(heap, args[0], n as usize) {
        Ok(v) => Ok(v),
        Err(_) if args.len() == 3 => Ok(args[2]),
        Err(e) => Err(e),
    }
}

fn bi_keys(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("keys", args, 1, Some(1))?;
    let entries = collections::map_entries(args[0]);
    if entries.is_empty() {
        return Ok(Value::nil());
    }
    Ok(heap.list_from(entries.into_iter().map(|(k, _)| k).collect()))
}

fn bi_vals(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("vals", args, 1, Some(1))?;
    let entries = collections::map_entries(args[0]);
    if entries.is_empty() {
        return Ok(Value::nil());
    }
    Ok(heap.list_from(entries.into_iter().map(|(_, v)| v).collect()))
}

fn bi_into(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("into", args, 2, Some(2))?;
    let mut coll = args[0];
    for v in seq_to_vec(heap, args[1])? {
        coll = collections::conj(heap, coll, v)?;
    }
    Ok(coll)
}

fn bi_concat(heap: &Heap, args: &[Value]) -> Result<Value> {
    let mut out = Vec::new();
    for a in args {
        out.extend(seq_to_vec(heap, *a)?);
    }
    Ok(heap.list_from(out))
}

// =============================================================================
// Sequences
// =============================================================================

fn bi_seq(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("seq", args, 1, Some(1))?;
    seq::seq(heap, args[0])
}

fn bi_first(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("first", args, 1, Some(1))?;
    seq::first(heap, args[0])
}

fn bi_rest(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("rest", args, 1, Some(1))?;
    seq::rest(heap, args[0])
}

fn bi_next(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("next", args, 1, Some(1))?;
    seq::next(heap, args[0])
}

fn bi_second(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("second", args, 1, Some(1))?;
    let r = seq::rest(heap, args[0])?;
    seq::first(heap, r)
}

fn bi_last(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("last", args, 1, Some(1))?;
    let items = seq_to_vec(heap, args[0])?;
    Ok(items.last().copied().unwrap_or_else(Value::nil))
}

fn bi_cons(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("cons", args, 2, Some(2))?;
    Ok(heap.cons(args[0], args[1]))
}

fn bi_range(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("range", args, 0, Some(3))?;
    let (start, end, step) = match args.len() {
        0 => (0, None, 1),
        1 => (0, Some(as_int_arg("range", args[0], 0)?), 1),
        2 => (
            as_int_arg("range", args[0], 0)?,
            Some(as_int_arg("range", args[1], 1)?),
            1,
        ),
        _ => (
            as_int_arg("range", args[0], 0)?,
            Some(as_int_arg("range", args[1], 1)?),
            as_int_arg("range", args[2], 2)?,
        ),
    };
    if step == 0 {
        return Err(Error::value_error("range step must not be zero").with_arg(2));
    }
    Ok(heap.lazy_meta(LazyMeta {
        op: LazyOp::Range { start, end, step },
        source: Value::nil(),
    }))
}

fn bi_map(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("map", args, 2, Some(2))?;
    Ok(heap.lazy_meta(LazyMeta {
        op: LazyOp::Map(args[0]),
        source: args[1],
    }))
}

fn bi_filter(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("filter", args, 2, Some(2))?;
    Ok(heap.lazy_meta(LazyMeta {
        op: LazyOp::Filter(args[0]),
        source: args[1],
    }))
}

fn bi_take(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("take", args, 2, Some(2))?;
    let n = as_int_arg("take", args[0], 0)?;
    Ok(heap.lazy_meta(LazyMeta {
        op: LazyOp::Take(n.max(0)),
        source: args[1],
    }))
}

fn bi_reduce(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("reduce", args, 2, Some(3))?;
    let f = args[0];
    let (mut acc, coll) = match args.len() {
        2 => {
            let s = seq::seq(heap, args[1])?;
            if s.is_nil() {
                // Empty with no init: call with no args
                return dispatch::call_fn_val(heap, f, &[]);
            }
            let mut cursor = SeqCursor::new(s);
            let first = cursor
                .next(Some(heap))?
                .expect("non-empty seq yielded nothing");
            let rest: Vec<Value> = cursor.collect(Some(heap))?;
            (first, heap.list_from(rest))
        }
        _ => (args[1], args[2]),
    };

    let s = seq::seq(heap, coll)?;
    if s.is_nil() {
        return Ok(acc);
    }
    let mut cursor = SeqCursor::new(s);
    while let Some(item) = cursor.next(Some(heap))? {
        acc = dispatch::call_fn_val(heap, f, &[acc, item])?;
        if refs::is_reduced(acc) {
            return Ok(refs::reduced_unwrap(acc));
        }
    }
    Ok(acc)
}

fn bi_apply(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("apply", args, 2, None)?;
    let f = args[0];
    let leading = &args[1..args.len() - 1];
    let trailing = args[args.len() - 1];

    // Single-variadic-arity interpreted functions bind the trailing seq
    // directly as their rest parameter; everything else gets flat args.
    if f.kind() == ValueKind::Fn && seq::is_seq_like(trailing) {
        if let Ok(proto) = f
            .as_fn()
            .proto
            .clone()
            .downcast::<crate::ast::FnProto>()
        {
            if proto.arities.len() == 1
                && proto.arities[0].variadic
                && leading.len() == proto.arities[0].params
            {
                let mut call_args = leading.to_vec();
                call_args.push(trailing);
                dispatch::set_apply_rest_seq(true);
                let result = dispatch::call_fn_val(heap, f, &call_args);
                dispatch::set_apply_rest_seq(false);
                return result;
            }
        }
    }

    let mut call_args: Vec<Value> = leading.to_vec();
    call_args.extend(seq_to_vec(heap, trailing)?);
    dispatch::call_fn_val(heap, f, &call_args)
}

fn bi_doall(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("doall", args, 1, Some(1))?;
    // Realize the whole chain; the value itself is the result
    let _ = seq_to_vec(heap, args[0])?;
    Ok(args[0])
}

fn bi_dorun(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("dorun", args, 1, Some(1))?;
    let _ = seq_to_vec(heap, args[0])?;
    Ok(Value::nil())
}

fn bi_lazy_seq_star(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("lazy-seq*", args, 1, Some(1))?;
    Ok(heap.lazy_thunk(args[0]))
}

fn bi_reduced(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("reduced", args, 1, Some(1))?;
    Ok(heap.reduced(args[0]))
}

// =============================================================================
// References
// =============================================================================

fn bi_atom(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("atom", args, 1, Some(1))?;
    Ok(heap.atom(args[0]))
}

fn bi_deref(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("deref", args, 1, Some(3))?;
    let v = args[0];
    if !v.is_heap() {
        return Err(Error::type_error(format!("{} is not derefable", v.type_name())).with_arg(0));
    }
    match v.obj() {
        HeapObj::Atom(_) => refs::atom_deref(v),
        HeapObj::Volatile(_) => refs::volatile_deref(v),
        HeapObj::Delay(_) => refs::delay_force(heap, v),
        HeapObj::Agent(_) => agent::agent_deref(v),
        HeapObj::Var(var) => Ok(var.deref()),
        HeapObj::Future(fut) => match args.len() {
            1 => fut.get(),
            3 => {
                let ms = as_int_arg("deref", args[1], 1)?.max(0) as u64;
                match fut.get_timeout(std::time::Duration::from_millis(ms)) {
                    Some(outcome) => outcome,
                    None => Ok(args[2]),
                }
            }
            _ => Err(Error::arity(
                "timed deref expects a future, a timeout, and a default",
            )),
        },
        _ => Err(Error::type_error(format!("{} is not derefable", v.type_name())).with_arg(0)),
    }
}

fn bi_reset_bang(_h: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("reset!", args, 2, Some(2))?;
    refs::atom_reset(args[0], args[1])
}

fn bi_swap_bang(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("swap!", args, 2, None)?;
    refs::atom_swap(heap, args[0], args[1], &args[2..])
}

fn bi_cas_bang(_h: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("compare-and-set!", args, 3, Some(3))?;
    Ok(Value::bool_val(refs::atom_compare_and_set(
        args[0], args[1], args[2],
    )?))
}

fn bi_volatile(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("volatile!", args, 1, Some(1))?;
    Ok(heap.volatile(args[0]))
}

fn bi_vreset_bang(_h: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("vreset!", args, 2, Some(2))?;
    refs::volatile_reset(args[0], args[1])
}

fn bi_vswap_bang(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("vswap!", args, 2, None)?;
    refs::volatile_swap(heap, args[0], args[1], &args[2..])
}

fn bi_delay_star(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("delay*", args, 1, Some(1))?;
    Ok(heap.delay(args[0]))
}

fn bi_force(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("force", args, 1, Some(1))?;
    refs::delay_force(heap, args[0])
}

// =============================================================================
// Futures, agents, pool
// =============================================================================

fn bi_future_call(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("future-call", args, 1, Some(1))?;
    with_env("future-call", |env| {
        let fut = clove_runtime::pool::submit_future(env, args[0]);
        Ok(heap.future_value(fut))
    })
}

fn bi_future_done_p(_h: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("future-done?", args, 1, Some(1))?;
    if args[0].is_heap() {
        if let HeapObj::Future(f) = args[0].obj() {
            return Ok(Value::bool_val(f.is_done()));
        }
    }
    Err(Error::type_error("future-done? expects a future").with_arg(0))
}

fn bi_pmap(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("pmap", args, 2, Some(2))?;
    let f = args[0];
    let items = seq_to_vec(heap, args[1])?;
    with_env("pmap", |env| {
        let futures: Vec<_> = items
            .into_iter()
            .map(|item| {
                let thunk = heap.foreign(
                    "pmap-item",
                    Box::new(move |heap: &Heap, _args: &[Value]| {
                        dispatch::call_fn_val(heap, f, &[item])
                    }),
                );
                clove_runtime::pool::submit_future(env, thunk)
            })
            .collect();
        let mut out = Vec::with_capacity(futures.len());
        for fut in futures {
            out.push(fut.get()?);
        }
        Ok(heap.list_from(out))
    })
}

fn bi_agent(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("agent", args, 1, Some(1))?;
    Ok(heap.agent(args[0]))
}

fn bi_send(_h: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("send", args, 2, None)?;
    with_env("send", |env| {
        agent::agent_send(env, args[0], args[1], args[2..].to_vec())
    })
}

fn bi_await(_h: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("await", args, 1, None)?;
    agent::agent_await(args)?;
    Ok(Value::nil())
}

fn bi_agent_error(_h: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("agent-error", args, 1, Some(1))?;
    Ok(agent::agent_error(args[0])?.unwrap_or_else(Value::nil))
}

fn bi_set_error_mode_bang(_h: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("set-error-mode!", args, 2, Some(2))?;
    let mode = symbol_name(args[1], "error mode", 1)?;
    let mode = match mode.as_str() {
        "fail" => AgentErrorMode::Fail,
        "continue" => AgentErrorMode::Continue,
        other => {
            return Err(
                Error::value_error(format!("unknown error mode :{other}")).with_arg(1)
            );
        }
    };
    agent::agent_set_error_mode(args[0], mode)?;
    Ok(args[0])
}

fn bi_set_error_handler_bang(_h: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("set-error-handler!", args, 2, Some(2))?;
    let handler = if args[1].is_nil() { None } else { Some(args[1]) };
    agent::agent_set_error_handler(args[0], handler)?;
    Ok(args[0])
}

fn bi_restart_agent(_h: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("restart-agent", args, 2, Some(2))?;
    agent::agent_restart(args[0], args[1])
}

fn bi_add_watch(_h: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("add-watch", args, 3, Some(3))?;
    agent::agent_add_watch(args[0], args[1], args[2])?;
    Ok(args[0])
}

fn bi_remove_watch(_h: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("remove-watch", args, 2, Some(2))?;
    agent::agent_remove_watch(args[0], args[1])?;
    Ok(args[0])
}

fn bi_shutdown_agents(_h: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("shutdown-agents", args, 0, Some(0))?;
    clove_runtime::pool::shutdown_global_pool();
    Ok(Value::nil())
}

// =============================================================================
// Transients
// =============================================================================

fn bi_transient(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("transient", args, 1, Some(1))?;
    collections::transient(heap, args[0])
}

fn bi_persistent_bang(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("persistent!", args, 1, Some(1))?;
    collections::persistent_bang(heap, args[0])
}

fn bi_conj_bang(_h: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("conj!", args, 2, Some(2))?;
    collections::conj_bang(args[0], args[1])
}

fn bi_assoc_bang(_h: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("assoc!", args, 3, Some(3))?;
    collections::assoc_bang(args[0], args[1], args[2])
}

// =============================================================================
// Raw byte arrays
// =============================================================================

fn bytes_of(v: Value, idx: usize) -> Result<&'static std::sync::Mutex<Vec<u8>>> {
    if v.is_heap() {
        if let HeapObj::Bytes(b) = v.obj() {
            // The heap outlives every value; stretch the borrow to match.
            return Ok(unsafe { &*(b as *const std::sync::Mutex<Vec<u8>>) });
        }
    }
    Err(Error::type_error("expected a byte array").with_arg(idx))
}

/// `(byte-array n)` zero-filled, or `(byte-array seq-of-ints)`.
fn bi_byte_array(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("byte-array", args, 1, Some(1))?;
    if args[0].is_int() {
        let n = args[0].as_int().max(0) as usize;
        return Ok(heap.byte_array(vec![0; n]));
    }
    let mut bytes = Vec::new();
    for v in seq_to_vec(heap, args[0])? {
        if !v.is_int() {
            return Err(Error::type_error("byte-array elements must be integers").with_arg(0));
        }
        bytes.push((v.as_int() & 0xFF) as u8);
    }
    Ok(heap.byte_array(bytes))
}

fn bi_aget(_h: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("aget", args, 2, Some(2))?;
    let bytes = bytes_of(args[0], 0)?.lock().expect("byte array poisoned");
    let idx = as_int_arg("aget", args[1], 1)?;
    if idx < 0 || idx as usize >= bytes.len() {
        return Err(Error::value_error(format!(
            "index {idx} out of bounds for byte array of {}",
            bytes.len()
        )));
    }
    Ok(Value::int(bytes[idx as usize] as i64))
}

fn bi_aset(_h: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("aset", args, 3, Some(3))?;
    let mut bytes = bytes_of(args[0], 0)?.lock().expect("byte array poisoned");
    let idx = as_int_arg("aset", args[1], 1)?;
    let val = as_int_arg("aset", args[2], 2)?;
    if idx < 0 || idx as usize >= bytes.len() {
        return Err(Error::value_error(format!(
            "index {idx} out of bounds for byte array of {}",
            bytes.len()
        )));
    }
    bytes[idx as usize] = (val & 0xFF) as u8;
    Ok(args[2])
}

fn bi_alength(_h: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("alength", args, 1, Some(1))?;
    let bytes = bytes_of(args[0], 0)?.lock().expect("byte array poisoned");
    Ok(Value::int(bytes.len() as i64))
}

// =============================================================================
// Regex
// =============================================================================

fn regex_of(v: Value, idx: usize) -> Result<regex::Regex> {
    if v.is_heap() {
        match v.obj() {
            HeapObj::Regex(re) => return Ok(re.clone()),
            HeapObj::Str(s) => {
                return regex::Regex::new(s)
                    .map_err(|e| Error::value_error(format!("invalid regex: {e}")).with_arg(idx));
            }
            _ => {}
        }
    }
    Err(Error::type_error("expected a regex pattern or string").with_arg(idx))
}

fn bi_re_pattern(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("re-pattern", args, 1, Some(1))?;
    Ok(heap.regex(regex_of(args[0], 0)?))
}

fn match_value(heap: &Heap, caps: regex::Captures<'_>) -> Value {
    if caps.len() == 1 {
        return heap.str_value(caps.get(0).map(|m| m.as_str()).unwrap_or(""));
    }
    let groups: Vec<Value> = caps
        .iter()
        .map(|g| match g {
            Some(m) => heap.str_value(m.as_str()),
            None => Value::nil(),
        })
        .collect();
    heap.vector_from(groups)
}

fn bi_re_find(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("re-find", args, 1, Some(2))?;
    // (re-find matcher): advance stateful matcher
    if args.len() == 1 {
        let v = args[0];
        if v.is_heap() {
            if let HeapObj::Matcher(m) = v.obj() {
                let mut pos = m.pos.lock().expect("matcher poisoned");
                if *pos > m.input.len() {
                    return Ok(Value::nil());
                }
                if let Some(caps) = m.pattern.captures_at(&m.input, *pos) {
                    let whole = caps.get(0).expect("group 0 always present");
                    // Step past empty matches so the scan terminates
                    *pos = if whole.end() > whole.start() {
                        whole.end()
                    } else {
                        whole.end() + 1
                    };
                    return Ok(match_value(heap, caps));
                }
                *pos = m.input.len() + 1;
                return Ok(Value::nil());
            }
        }
        return Err(Error::type_error("re-find expects a matcher").with_arg(0));
    }
    let re = regex_of(args[0], 0)?;
    let s = args[1];
    if s.kind() != ValueKind::String {
        return Err(Error::type_error("re-find expects a string").with_arg(1));
    }
    match re.captures(s.as_str()) {
        Some(caps) => Ok(match_value(heap, caps)),
        None => Ok(Value::nil()),
    }
}

fn bi_re_matches(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("re-matches", args, 2, Some(2))?;
    let re = regex_of(args[0], 0)?;
    let s = args[1];
    if s.kind() != ValueKind::String {
        return Err(Error::type_error("re-matches expects a string").with_arg(1));
    }
    let text = s.as_str();
    match re.captures(text) {
        Some(caps) => {
            let whole = caps.get(0).expect("group 0 always present");
            if whole.start() == 0 && whole.end() == text.len() {
                Ok(match_value(heap, caps))
            } else {
                Ok(Value::nil())
            }
        }
        None => Ok(Value::nil()),
    }
}

fn bi_re_matcher(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("re-matcher", args, 2, Some(2))?;
    let re = regex_of(args[0], 0)?;
    let s = args[1];
    if s.kind() != ValueKind::String {
        return Err(Error::type_error("re-matcher expects a string").with_arg(1));
    }
    Ok(heap.matcher(re, s.as_str()))
}

// =============================================================================
// Exceptions
// =============================================================================

fn bi_ex_info(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("ex-info", args, 2, Some(2))?;
    if args[0].kind() != ValueKind::String {
        return Err(Error::type_error("ex-info message must be a string").with_arg(0));
    }
    Ok(heap.array_map(vec![
        (heap.keyword(None, "message"), args[0]),
        (heap.keyword(None, "data"), args[1]),
    ]))
}

fn bi_ex_message(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("ex-message", args, 1, Some(1))?;
    Ok(collections::map_get(args[0], heap.keyword(None, "message"))
        .unwrap_or_else(Value::nil))
}

fn bi_ex_data(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("ex-data", args, 1, Some(1))?;
    Ok(collections::map_get(args[0], heap.keyword(None, "data")).unwrap_or_else(Value::nil))
}

// =============================================================================
// Multimethods and protocols
// =============================================================================

fn bi_multifn(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("multifn", args, 2, Some(2))?;
    let name = symbol_name(args[0], "multimethod name", 0)?;
    Ok(heap.multi(name, args[1]))
}

fn bi_add_method_bang(_h: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("add-method!", args, 3, Some(3))?;
    let multi = args[0];
    if multi.is_heap() {
        if let HeapObj::Multi(m) = multi.obj() {
            let mut methods = m.methods.lock().expect("multimethod poisoned");
            methods.retain(|(k, _)| !eql::eql(*k, args[1]));
            methods.push((args[1], args[2]));
            return Ok(multi);
        }
    }
    Err(Error::type_error("add-method! expects a multimethod").with_arg(0))
}

fn bi_protocol_fn(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("protocol-fn", args, 1, Some(1))?;
    let name = symbol_name(args[0], "protocol method name", 0)?;
    Ok(heap.protocol_method(name))
}

fn bi_extend_type_bang(_h: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("extend-type!", args, 3, Some(3))?;
    let proto = args[0];
    let key = symbol_name(args[1], "type key", 1)?;
    if proto.is_heap() {
        if let HeapObj::Protocol(p) = proto.obj() {
            let mut impls = p.impls.lock().expect("protocol poisoned");
            impls.retain(|(k, _)| *k != key);
            impls.push((key, args[2]));
            return Ok(proto);
        }
    }
    Err(Error::type_error("extend-type! expects a protocol method").with_arg(0))
}

fn bi_type_key(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("type-key", args, 1, Some(1))?;
    Ok(heap.str_value(dispatch::type_key(args[0])))
}

// =============================================================================
// Namespaces
// =============================================================================

fn bi_in_ns(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("in-ns", args, 1, Some(1))?;
    let name = symbol_name(args[0], "namespace name", 0)?;
    let _ = heap;
    with_env("in-ns", |env| {
        let ns = env.in_ns(&name);
        refer_core(env, &ns);
        Ok(Value::nil())
    })
}

fn bi_create_ns(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("create-ns", args, 1, Some(1))?;
    let name = symbol_name(args[0], "namespace name", 0)?;
    let _ = heap;
    with_env("create-ns", |env| {
        env.registry.find_or_create(&name);
        Ok(Value::nil())
    })
}

fn bi_intern(heap: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("intern", args, 2, Some(3))?;
    let ns_name = symbol_name(args[0], "namespace name", 0)?;
    let var_name = symbol_name(args[1], "var name", 1)?;
    with_env("intern", |env| {
        let ns = env.registry.find_or_create(&ns_name);
        let var = ns.intern(&var_name);
        // Dynamically interned symbols are owned by this env for
        // deterministic teardown
        env.own_symbol(format!("{ns_name}/{var_name}"))?;
        if let Some(init) = args.get(2) {
            var.set_root(*init);
        }
        Ok(heap.var_value(var))
    })
}

fn bi_alias(_h: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("alias", args, 2, Some(2))?;
    let alias = symbol_name(args[0], "alias", 0)?;
    let target = symbol_name(args[1], "namespace name", 1)?;
    with_env("alias", |env| {
        let target_ns = env
            .registry
            .find(&target)
            .ok_or_else(|| Error::value_error(format!("No namespace: {target}")))?;
        env.current_ns().alias(&alias, target_ns);
        Ok(Value::nil())
    })
}

fn bi_refer(_h: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("refer", args, 1, Some(1))?;
    let target = symbol_name(args[0], "namespace name", 0)?;
    with_env("refer", |env| {
        let source = env
            .registry
            .find(&target)
            .ok_or_else(|| Error::value_error(format!("No namespace: {target}")))?;
        let current = env.current_ns();
        for name in source.mapped_names() {
            if let Some(var) = source.lookup(&name) {
                if !var.is_private() {
                    current.refer(&name, var);
                }
            }
        }
        Ok(Value::nil())
    })
}

// =============================================================================
// Lifecycle
// =============================================================================

fn bi_add_shutdown_hook_bang(_h: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("add-shutdown-hook!", args, 2, Some(2))?;
    let key = symbol_name(args[0], "hook key", 0)?;
    clove_runtime::lifecycle::add_shutdown_hook(key, args[1])?;
    Ok(Value::nil())
}

fn bi_shutdown_requested_p(_h: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("shutdown-requested?", args, 0, Some(0))?;
    Ok(Value::bool_val(clove_runtime::lifecycle::shutdown_requested()))
}

fn bi_sleep(_h: &Heap, args: &[Value]) -> Result<Value> {
    expect_args("sleep", args, 1, Some(1))?;
    let ms = as_int_arg("sleep", args[0], 0)?.max(0) as u64;
    std::thread::sleep(std::time::Duration::from_millis(ms));
    Ok(Value::nil())
}
