//! Structural equality
//!
//! Clojure-style `=`: numeric values compare mathematically across kinds,
//! sequentials compare element-wise ignoring concrete type, maps and sets
//! compare by content, and reference kinds compare by pointer identity.
//!
//! `eql` runs without an allocator and treats unrealized lazy sequences by
//! identity; `eql_alloc` may realize lazy layers on demand.

use crate::arith;
use crate::collections;
use crate::heap::Heap;
use crate::seq::{SeqCursor, is_seq_like};
use crate::value::{HeapObj, Value, ValueKind};

/// Structural equality without an allocator.
pub fn eql(a: Value, b: Value) -> bool {
    eql_inner(None, a, b)
}

/// Structural equality, realizing lazy sequences through `heap` as needed.
pub fn eql_alloc(heap: &Heap, a: Value, b: Value) -> bool {
    eql_inner(Some(heap), a, b)
}

fn eql_inner(heap: Option<&Heap>, a: Value, b: Value) -> bool {
    // Bit identity covers nil, booleans, chars, identical small ints and
    // floats, and pointer-equal heap values.
    if a.identical(b) {
        return true;
    }

    // Cross-kind mathematical equality for the numeric tower.
    if arith::is_number(a) && arith::is_number(b) {
        return arith::num_eq(a, b);
    }

    let ka = a.kind();
    let kb = b.kind();

    // Sequential cross-type comparison, lazy layers included. nil is not a
    // sequence: an empty realized lazy equals () and [] but never nil, and
    // nil never reaches here because identical() handled nil/nil.
    let seq_a = is_seq_like(a) || ka == ValueKind::LazySeq;
    let seq_b = is_seq_like(b) || kb == ValueKind::LazySeq;
    if seq_a && seq_b {
        return seq_eql(heap, a, b);
    }
    if seq_a != seq_b {
        return false;
    }

    if ka != kb
        && !(collections::is_map(a) && collections::is_map(b))
    {
        return false;
    }

    if !a.is_heap() || !b.is_heap() {
        return false;
    }

    match (a.obj(), b.obj()) {
        (HeapObj::Str(x), HeapObj::Str(y)) => x == y,
        (HeapObj::Symbol(x), HeapObj::Symbol(y)) => x == y,
        (HeapObj::Keyword(x), HeapObj::Keyword(y)) => x == y,
        // Array-maps and hash-maps compare cross-type: same entry count,
        // every key of one looks up to an equal value in the other.
        (HeapObj::ArrayMap(_) | HeapObj::Map(_), HeapObj::ArrayMap(_) | HeapObj::Map(_)) => {
            map_eql(heap, a, b)
        }
        (HeapObj::Set(x), HeapObj::Set(y)) => {
            x.len() == y.len() && x.iter().all(|k| y.contains(k))
        }
        (HeapObj::Reduced(x), HeapObj::Reduced(y)) => eql_inner(heap, *x, *y),
        // Functions, vars, mutable references, transients, and regexes are
        // identity-equal only, which the identical() fast path decided.
        _ => false,
    }
}

fn seq_eql(heap: Option<&Heap>, a: Value, b: Value) -> bool {
    let mut ca = SeqCursor::new(a);
    let mut cb = SeqCursor::new(b);
    loop {
        let na = match ca.next(heap) {
            Ok(v) => v,
            // Unrealized lazy without an allocator: only identity equality,
            // which was already ruled out.
            Err(_) => return false,
        };
        let nb = match cb.next(heap) {
            Ok(v) => v,
            Err(_) => return false,
        };
        match (na, nb) {
            (None, None) => return true,
            (Some(x), Some(y)) => {
                if !eql_inner(heap, x, y) {
                    return false;
                }
            }
            _ => return false,
        }
    }
}

fn map_eql(heap: Option<&Heap>, a: Value, b: Value) -> bool {
    let ca = collections::coll_count(a);
    let cb = collections::coll_count(b);
    if ca != cb {
        return false;
    }
    for (k, va) in collections::map_entries(a) {
        match collections::map_get(b, k) {
            Some(vb) => {
                if !eql_inner(heap, va, vb) {
                    return false;
                }
            }
            None => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{LazyMeta, LazyOp};
    use num_bigint::BigInt;

    fn heap() -> std::sync::Arc<Heap> {
        Heap::new()
    }

    #[test]
    fn test_reflexive() {
        let h = heap();
        let values = [
            Value::nil(),
            Value::bool_val(true),
            Value::int(42),
            Value::float(2.5),
            Value::char_val('x'),
            h.str_value("s"),
            h.keyword(Some("a"), "b"),
            h.list_from(vec![Value::int(1)]),
        ];
        for v in values {
            assert!(eql(v, v), "{v:?} should equal itself");
        }
    }

    #[test]
    fn test_numeric_cross_kind() {
        let h = heap();
        assert!(eql(Value::int(2), Value::float(2.0)));
        assert!(eql(Value::int(2), h.big(BigInt::from(2))));
        assert!(!eql(Value::int(2), Value::int(3)));
        assert!(!eql(Value::int(2), h.str_value("2")));
    }

    #[test]
    fn test_string_content() {
        let h = heap();
        assert!(eql(h.str_value("abc"), h.str_value("abc")));
        assert!(!eql(h.str_value("abc"), h.str_value("abd")));
    }

    #[test]
    fn test_symbol_vs_keyword() {
        let h = heap();
        assert!(eql(h.symbol(None, "x"), h.symbol(None, "x")));
        assert!(eql(h.keyword(None, "x"), h.keyword(None, "x")));
        assert!(!eql(h.symbol(None, "x"), h.keyword(None, "x")));
        assert!(!eql(h.symbol(Some("a"), "x"), h.symbol(None, "x")));
    }

    #[test]
    fn test_list_equals_vector() {
        let h = heap();
        let l = h.list_from(vec![Value::int(1), Value::int(2)]);
        let v = h.vector_from(vec![Value::int(1), Value::int(2)]);
        assert!(eql(l, v));

        let v3 = h.vector_from(vec![Value::int(1), Value::int(3)]);
        assert!(!eql(l, v3));
    }

    #[test]
    fn test_cons_chain_equals_list() {
        let h = heap();
        let chain = h.cons(Value::int(1), h.cons(Value::int(2), Value::nil()));
        let l = h.list_from(vec![Value::int(1), Value::int(2)]);
        assert!(eql(chain, l));
    }

    #[test]
    fn test_nested_structures() {
        let h = heap();
        let a = h.vector_from(vec![h.list_from(vec![Value::int(1)]), Value::int(2)]);
        let b = h.vector_from(vec![h.vector_from(vec![Value::int(1)]), Value::int(2)]);
        assert!(eql(a, b));
    }

    #[test]
    fn test_map_cross_kind() {
        let h = heap();
        let am = h.array_map(vec![(h.keyword(None, "a"), Value::int(1))]);
        let hm = h.hash_map(
            [(crate::value::HKey(h.keyword(None, "a")), Value::int(1))]
                .into_iter()
                .collect(),
        );
        assert!(eql(am, hm));

        let hm2 = h.hash_map(
            [(crate::value::HKey(h.keyword(None, "a")), Value::int(2))]
                .into_iter()
                .collect(),
        );
        assert!(!eql(am, hm2));
    }

    #[test]
    fn test_sets() {
        let h = heap();
        let s1 = collections::set_from_items(&h, vec![Value::int(1), Value::int(2)]);
        let s2 = collections::set_from_items(&h, vec![Value::int(2), Value::int(1)]);
        let s3 = collections::set_from_items(&h, vec![Value::int(1)]);
        assert!(eql(s1, s2));
        assert!(!eql(s1, s3));
    }

    #[test]
    fn test_empty_lazy_equals_empty_sequential_not_nil() {
        let h = heap();
        let lazy = h.lazy_meta(LazyMeta {
            op: LazyOp::Range {
                start: 0,
                end: Some(0),
                step: 1,
            },
            source: Value::nil(),
        });
        assert!(eql_alloc(&h, lazy, h.vector_from(vec![])));
        assert!(eql_alloc(&h, lazy, h.list_from(vec![])));
        assert!(!eql_alloc(&h, lazy, Value::nil()));
        assert!(!eql_alloc(&h, Value::nil(), lazy));
    }

    #[test]
    fn test_lazy_equals_realized_content() {
        let h = heap();
        let lazy = h.lazy_meta(LazyMeta {
            op: LazyOp::Range {
                start: 1,
                end: Some(4),
                step: 1,
            },
            source: Value::nil(),
        });
        let v = h.vector_from(vec![Value::int(1), Value::int(2), Value::int(3)]);
        assert!(eql_alloc(&h, lazy, v));
    }

    #[test]
    fn test_identity_kinds() {
        let h = heap();
        let a1 = h.atom(Value::int(0));
        let a2 = h.atom(Value::int(0));
        assert!(eql(a1, a1));
        assert!(!eql(a1, a2));

        let r1 = h.regex(regex::Regex::new("a+").unwrap());
        let r2 = h.regex(regex::Regex::new("a+").unwrap());
        assert!(eql(r1, r1));
        assert!(!eql(r1, r2));
    }

    #[test]
    fn test_nil_not_equal_to_falsy_or_empty() {
        let h = heap();
        assert!(!eql(Value::nil(), Value::bool_val(false)));
        assert!(!eql(Value::nil(), h.list_from(vec![])));
        assert!(!eql(Value::nil(), Value::int(0)));
    }
}
