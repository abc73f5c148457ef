//! Value rendering
//!
//! `pr_str` produces a readable rendering (strings quoted, chars escaped,
//! nil as "nil"); `display_str` produces the non-readable one (nil empty,
//! chars literal, strings bare). Both respect the dynamic vars
//! `*print-length*` and `*print-level*`, truncating with `...` and `#`.
//!
//! Lazy sequences realize on demand during printing when a print heap is
//! installed on the thread-local hook; without one they render as
//! `#<lazy-seq>`.

use std::cell::Cell;
use std::fmt::Write;
use std::sync::{Arc, OnceLock};

use num_traits::Zero;

use crate::heap::Heap;
use crate::value::{HeapObj, LazyState, Value};
use crate::var::Var;

// =============================================================================
// Print configuration
// =============================================================================

struct PrintVars {
    length: Arc<Var>,
    level: Arc<Var>,
}

static PRINT_VARS: OnceLock<PrintVars> = OnceLock::new();

/// Register fallback `*print-length*` / `*print-level*` vars for printing
/// outside any evaluation environment. Inside one, the current env's core
/// vars win, so sibling worlds (the compare engine) each see their own
/// bindings.
pub fn register_print_vars(length: Arc<Var>, level: Arc<Var>) {
    let _ = PRINT_VARS.set(PrintVars { length, level });
}

fn print_var_value(name: &'static str) -> Option<Value> {
    let via_env = crate::ns::eval_env(|env| {
        env.and_then(|env| env.registry.find("clove.core"))
            .and_then(|core| core.lookup(name))
            .map(|var| var.deref())
    });
    if let Some(v) = via_env {
        return Some(v);
    }
    let pv = PRINT_VARS.get()?;
    let var = if name == "*print-length*" {
        &pv.length
    } else {
        &pv.level
    };
    Some(var.deref())
}

fn limit(name: &'static str) -> Option<usize> {
    let v = print_var_value(name)?;
    if v.is_int() {
        Some(v.as_int().max(0) as usize)
    } else {
        None
    }
}

fn print_length() -> Option<usize> {
    limit("*print-length*")
}

fn print_level() -> Option<usize> {
    limit("*print-level*")
}

thread_local! {
    /// Heap available for realizing lazy sequences while printing.
    static PRINT_HEAP: Cell<Option<*const Heap>> = const { Cell::new(None) };
}

/// Make `heap` available to printing on this thread for the duration of
/// `f`, restoring the previous hook on all exit paths.
pub fn with_print_heap<R>(heap: &Heap, f: impl FnOnce() -> R) -> R {
    struct Restore(Option<*const Heap>);
    impl Drop for Restore {
        fn drop(&mut self) {
            PRINT_HEAP.with(|cell| cell.set(self.0));
        }
    }
    let prev = PRINT_HEAP.with(|cell| cell.replace(Some(heap as *const Heap)));
    let _restore = Restore(prev);
    f()
}

fn print_heap<R>(f: impl FnOnce(Option<&Heap>) -> R) -> R {
    let ptr = PRINT_HEAP.with(|cell| cell.get());
    match ptr {
        Some(p) => f(Some(unsafe { &*p })),
        None => f(None),
    }
}

// =============================================================================
// Entry points
// =============================================================================

/// Readable rendering.
pub fn pr_str(v: Value) -> String {
    let mut out = String::new();
    write_value(&mut out, v, true, 0);
    out
}

/// Non-readable rendering: nil empty, chars literal, strings bare.
pub fn display_str(v: Value) -> String {
    if v.is_nil() {
        return String::new();
    }
    if v.is_char() {
        return v.as_char().to_string();
    }
    if v.is_heap() {
        if let HeapObj::Str(s) = v.obj() {
            return s.clone();
        }
    }
    let mut out = String::new();
    write_value(&mut out, v, false, 0);
    out
}

// =============================================================================
// Rendering
// =============================================================================

fn write_value(out: &mut String, v: Value, readable: bool, depth: usize) {
    if v.is_float() {
        return write_float(out, v.as_float());
    }
    if v.is_nil() {
        out.push_str("nil");
        return;
    }
    if v.is_bool() {
        out.push_str(if v.as_bool() { "true" } else { "false" });
        return;
    }
    if v.is_int() {
        let _ = write!(out, "{}", v.as_int());
        return;
    }
    if v.is_char() {
        if readable {
            write_char(out, v.as_char());
        } else {
            out.push(v.as_char());
        }
        return;
    }

    match v.obj() {
        HeapObj::Str(s) => {
            if readable {
                write_string(out, s);
            } else {
                out.push_str(s);
            }
        }
        HeapObj::Symbol(sym) => {
            let _ = write!(out, "{}", sym.qualified());
        }
        HeapObj::Keyword(sym) => {
            let _ = write!(out, ":{}", sym.qualified());
        }
        HeapObj::List(_) | HeapObj::Cons(_) | HeapObj::Chunked(_) => {
            write_seq(out, v, readable, depth, "(", ")");
        }
        HeapObj::Vector(items) => {
            write_items(out, items.iter().copied(), readable, depth, "[", "]");
        }
        HeapObj::ArrayMap(_) | HeapObj::Map(_) => {
            write_map(out, v, readable, depth);
        }
        HeapObj::Set(_) => {
            let elems = crate::collections::set_elements(v);
            write_items(out, elems.into_iter(), readable, depth, "#{", "}");
        }
        HeapObj::Lazy(lazy) => {
            let cached = {
                let state = lazy.state.lock().expect("lazy seq poisoned");
                match &*state {
                    LazyState::Realized(cached) => Some(*cached),
                    _ => None,
                }
            };
            match cached {
                Some(cached) => write_realized_lazy(out, cached, readable, depth),
                None => {
                    let realized =
                        print_heap(|heap| heap.map(|heap| crate::seq::realize(heap, v)));
                    match realized {
                        Some(Ok(cached)) => write_realized_lazy(out, cached, readable, depth),
                        _ => out.push_str("#<lazy-seq>"),
                    }
                }
            }
        }
        HeapObj::Big(b) => {
            let _ = write!(out, "{b}N");
        }
        HeapObj::Ratio(r) => {
            let _ = write!(out, "{}/{}", r.num, r.den);
        }
        HeapObj::BigDec(d) => {
            write_big_dec(out, d);
        }
        HeapObj::Atom(a) => {
            out.push_str("#<atom ");
            write_value(out, *a.value.lock().expect("atom poisoned"), readable, depth);
            out.push('>');
        }
        HeapObj::Volatile(cell) => {
            out.push_str("#<volatile ");
            write_value(out, *cell.lock().expect("volatile poisoned"), readable, depth);
            out.push('>');
        }
        HeapObj::Delay(_) => out.push_str("#<delay>"),
        HeapObj::Reduced(inner) => {
            out.push_str("#<reduced ");
            write_value(out, *inner, readable, depth);
            out.push('>');
        }
        HeapObj::Builtin(b) => {
            let _ = write!(out, "#<builtin {}>", b.name);
        }
        HeapObj::Fn(f) => match &f.name {
            Some(name) => {
                let _ = write!(out, "#<fn {name}>");
            }
            None => out.push_str("#<fn>"),
        },
        HeapObj::Var(var) => {
            let _ = write!(out, "#'{}", var.qualified_name());
        }
        HeapObj::Multi(m) => {
            let _ = write!(out, "#<multifn {}>", m.name);
        }
        HeapObj::Protocol(p) => {
            let _ = write!(out, "#<protocol-fn {}>", p.name);
        }
        HeapObj::Future(fut) => {
            if fut.is_done() {
                out.push_str("#<future done>");
            } else {
                out.push_str("#<future pending>");
            }
        }
        HeapObj::Agent(agent) => {
            let state = agent.inner.lock().expect("agent poisoned").state;
            out.push_str("#<agent ");
            write_value(out, state, readable, depth);
            out.push('>');
        }
        HeapObj::Module(m) => {
            let _ = write!(out, "#<module {}>", m.name);
        }
        HeapObj::Foreign(f) => {
            let _ = write!(out, "#<foreign {}>", f.name);
        }
        HeapObj::Regex(re) => {
            let _ = write!(out, "#\"{}\"", re.as_str());
        }
        HeapObj::Matcher(_) => out.push_str("#<matcher>"),
        HeapObj::Bytes(bytes) => {
            let _ = write!(
                out,
                "#<bytes {}>",
                bytes.lock().expect("byte array poisoned").len()
            );
        }
        HeapObj::TransientVector(_) => out.push_str("#<transient-vector>"),
        HeapObj::TransientMap(_) => out.push_str("#<transient-map>"),
        HeapObj::TransientSet(_) => out.push_str("#<transient-set>"),
    }
}

fn write_realized_lazy(out: &mut String, cached: Value, readable: bool, depth: usize) {
    if cached.is_nil() {
        out.push_str("()");
    } else {
        write_seq(out, cached, readable, depth, "(", ")");
    }
}

/// Floats always show a decimal point so they re-read as floats.
fn write_float(out: &mut String, f: f64) {
    if f.is_nan() {
        out.push_str("##NaN");
    } else if f.is_infinite() {
        out.push_str(if f > 0.0 { "##Inf" } else { "##-Inf" });
    } else if f == f.trunc() && f.abs() < 1e16 {
        let _ = write!(out, "{f:.1}");
    } else {
        let _ = write!(out, "{f}");
    }
}

fn write_char(out: &mut String, c: char) {
    match c {
        '\n' => out.push_str("\\newline"),
        ' ' => out.push_str("\\space"),
        '\t' => out.push_str("\\tab"),
        '\r' => out.push_str("\\return"),
        c if (c as u32) < 0x20 => {
            let _ = write!(out, "\\u{:04X}", c as u32);
        }
        c => {
            out.push('\\');
            out.push(c);
        }
    }
}

fn write_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out.push('"');
}

fn write_seq(out: &mut String, v: Value, readable: bool, depth: usize, open: &str, close: &str) {
    if over_level(out, depth) {
        return;
    }
    out.push_str(open);
    let mut cursor = crate::seq::SeqCursor::new(v);
    let limit = print_length();
    let mut n = 0usize;
    loop {
        let item = print_heap(|heap| cursor.next(heap));
        match item {
            Ok(Some(item)) => {
                if let Some(limit) = limit {
                    if n >= limit {
                        if n > 0 {
                            out.push(' ');
                        }
                        out.push_str("...");
                        break;
                    }
                }
                if n > 0 {
                    out.push(' ');
                }
                write_value(out, item, readable, depth + 1);
                n += 1;
            }
            Ok(None) => break,
            Err(_) => {
                if n > 0 {
                    out.push(' ');
                }
                out.push_str("#<lazy-seq>");
                break;
            }
        }
    }
    out.push_str(close);
}

fn write_items(
    out: &mut String,
    items: impl Iterator<Item = Value>,
    readable: bool,
    depth: usize,
    open: &str,
    close: &str,
) {
    if over_level(out, depth) {
        return;
    }
    out.push_str(open);
    let limit = print_length();
    let mut n = 0usize;
    for item in items {
        if let Some(limit) = limit {
            if n >= limit {
                if n > 0 {
                    out.push(' ');
                }
                out.push_str("...");
                break;
            }
        }
        if n > 0 {
            out.push(' ');
        }
        write_value(out, item, readable, depth + 1);
        n += 1;
    }
    out.push_str(close);
}

fn write_map(out: &mut String, v: Value, readable: bool, depth: usize) {
    if over_level(out, depth) {
        return;
    }
    out.push('{');
    let entries = crate::collections::map_entries(v);
    let limit = print_length();
    let mut n = 0usize;
    for (k, val) in entries {
        if let Some(limit) = limit {
            if n >= limit {
                if n > 0 {
                    out.push_str(", ");
                }
                out.push_str("...");
                break;
            }
        }
        if n > 0 {
            out.push_str(", ");
        }
        write_value(out, k, readable, depth + 1);
        out.push(' ');
        write_value(out, val, readable, depth + 1);
        n += 1;
    }
    out.push('}');
}

fn over_level(out: &mut String, depth: usize) -> bool {
    if let Some(level) = print_level() {
        if depth >= level {
            out.push('#');
            return true;
        }
    }
    false
}

/// Decimal rendering of an unscaled/scale pair, with the M suffix.
fn write_big_dec(out: &mut String, d: &crate::value::BigDecData) {
    if d.scale == 0 {
        let _ = write!(out, "{}M", d.unscaled);
        return;
    }
    let negative = d.unscaled < num_bigint::BigInt::zero();
    let digits = d.unscaled.magnitude().to_string();
    let scale = d.scale as usize;
    if negative {
        out.push('-');
    }
    if digits.len() > scale {
        let split = digits.len() - scale;
        let _ = write!(out, "{}.{}M", &digits[..split], &digits[split..]);
    } else {
        let _ = write!(out, "0.{}{}M", "0".repeat(scale - digits.len()), digits);
    }
}
