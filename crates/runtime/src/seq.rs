//! Sequences
//!
//! `seq`/`first`/`rest` over every sequential kind, cons chains as true
//! pairs, and lazy-sequence realization. Realization is monotonic: the
//! first force caches the result and clears the thunk; later forces return
//! the cache without re-invoking anything.
//!
//! Structural lazy layers (map/filter/take/range descriptors) realize by
//! walking the descriptor chain down to its base and iterating the base
//! once with every transform inlined. Nested filters land in one flat
//! stage list, so a deep filter tower costs a vector scan instead of a
//! recursion per element.

use crate::error::{Error, Result};
use crate::heap::Heap;
use crate::value::{HeapObj, LazyMeta, LazyOp, LazyState, Value, ValueKind};

/// Whether a value participates in sequential iteration.
pub fn is_seq_like(v: Value) -> bool {
    matches!(
        v.kind(),
        ValueKind::List
            | ValueKind::Vector
            | ValueKind::Cons
            | ValueKind::Chunked
            | ValueKind::LazySeq
    )
}

// =============================================================================
// Cursor
// =============================================================================

/// Streaming iterator over any sequential value.
///
/// Walks cons chains and chunked blocks without materializing them. A heap
/// is needed only to realize lazy layers encountered mid-chain; without
/// one, hitting an unrealized lazy yields an error the caller maps to its
/// no-allocator behavior.
pub struct SeqCursor {
    cur: Value,
    idx: usize,
}

impl SeqCursor {
    pub fn new(v: Value) -> SeqCursor {
        SeqCursor { cur: v, idx: 0 }
    }

    pub fn next(&mut self, heap: Option<&Heap>) -> Result<Option<Value>> {
        loop {
            if self.cur.is_nil() {
                return Ok(None);
            }
            if !self.cur.is_heap() {
                return Err(Error::type_error(format!(
                    "{} is not a sequence",
                    self.cur.type_name()
                )));
            }
            // Copy the handle so advancing the cursor does not fight the
            // borrow of the object behind it
            let cur = self.cur;
            match cur.obj() {
                HeapObj::List(items) | HeapObj::Vector(items) => {
                    if self.idx < items.len() {
                        let v = items[self.idx];
                        self.idx += 1;
                        return Ok(Some(v));
                    }
                    return Ok(None);
                }
                HeapObj::Cons(cell) => {
                    let first = cell.first;
                    self.cur = cell.rest;
                    self.idx = 0;
                    return Ok(Some(first));
                }
                HeapObj::Chunked(c) => {
                    if self.idx < c.chunk.len() {
                        let v = c.chunk[self.idx];
                        self.idx += 1;
                        return Ok(Some(v));
                    }
                    self.cur = c.rest;
                    self.idx = 0;
                }
                HeapObj::Lazy(lazy) => {
                    // Realized layers pass through to their cache without
                    // an allocator.
                    let cached = {
                        let state = lazy.state.lock().expect("lazy seq poisoned");
                        match &*state {
                            LazyState::Realized(v) => Some(*v),
                            _ => None,
                        }
                    };
                    match cached {
                        Some(v) => {
                            self.cur = v;
                            self.idx = 0;
                        }
                        None => match heap {
                            Some(heap) => {
                                self.cur = realize(heap, self.cur)?;
                                self.idx = 0;
                            }
                            None => {
                                return Err(Error::value_error(
                                    "unrealized lazy sequence needs an allocator",
                                ));
                            }
                        },
                    }
                }
                HeapObj::Str(s) => {
                    match s[self.idx..].chars().next() {
                        Some(c) => {
                            self.idx += c.len_utf8();
                            return Ok(Some(Value::char_val(c)));
                        }
                        None => return Ok(None),
                    }
                }
                other => {
                    return Err(Error::type_error(format!(
                        "{} is not a sequence",
                        other.kind().name()
                    )));
                }
            }
        }
    }

    /// Drain the cursor into a vector.
    pub fn collect(mut self, heap: Option<&Heap>) -> Result<Vec<Value>> {
        let mut out = Vec::new();
        while let Some(v) = self.next(heap)? {
            out.push(v);
        }
        Ok(out)
    }
}

// =============================================================================
// seq / first / rest / next
// =============================================================================

/// Seq view of a collection: nil for anything empty, a sequential value
/// otherwise. Maps become entry-vector seqs, sets element seqs, strings
/// char seqs. `nil` itself seqs to nil.
pub fn seq(heap: &Heap, v: Value) -> Result<Value> {
    if v.is_nil() {
        return Ok(Value::nil());
    }
    if !v.is_heap() {
        return Err(Error::type_error(format!("{} is not seqable", v.type_name())));
    }
    match v.obj() {
        HeapObj::List(items) | HeapObj::Vector(items) => {
            if items.is_empty() {
                Ok(Value::nil())
            } else {
                Ok(v)
            }
        }
        HeapObj::Cons(_) => Ok(v),
        HeapObj::Chunked(c) => {
            if c.chunk.is_empty() {
                seq(heap, c.rest)
            } else {
                Ok(v)
            }
        }
        HeapObj::Lazy(_) => {
            let realized = realize(heap, v)?;
            seq(heap, realized)
        }
        HeapObj::Str(s) => {
            if s.is_empty() {
                Ok(Value::nil())
            } else {
                let chars: Vec<Value> = s.chars().map(Value::char_val).collect();
                Ok(heap.list_from(chars))
            }
        }
        HeapObj::ArrayMap(_) | HeapObj::Map(_) => {
            let entries = crate::collections::map_entries(v);
            if entries.is_empty() {
                Ok(Value::nil())
            } else {
                let items: Vec<Value> = entries
                    .into_iter()
                    .map(|(k, val)| heap.vector_from(vec![k, val]))
                    .collect();
                Ok(heap.list_from(items))
            }
        }
        HeapObj::Set(_) => {
            let elems = crate::collections::set_elements(v);
            if elems.is_empty() {
                Ok(Value::nil())
            } else {
                Ok(heap.list_from(elems))
            }
        }
        _ => Err(Error::type_error(format!("{} is not seqable", v.type_name()))),
    }
}

/// First element, or nil when empty.
pub fn first(heap: &Heap, v: Value) -> Result<Value> {
    let s = seq(heap, v)?;
    if s.is_nil() {
        return Ok(Value::nil());
    }
    let mut cursor = SeqCursor::new(s);
    Ok(cursor.next(Some(heap))?.unwrap_or_else(Value::nil))
}

/// Everything after the first element; the empty list when exhausted.
pub fn rest(heap: &Heap, v: Value) -> Result<Value> {
    let s = seq(heap, v)?;
    if s.is_nil() {
        return Ok(heap.list_from(vec![]));
    }
    match s.obj() {
        HeapObj::Cons(cell) => Ok(cell.rest),
        HeapObj::List(items) | HeapObj::Vector(items) => {
            if items.is_empty() {
                Ok(heap.list_from(vec![]))
            } else {
                Ok(heap.list(items.clone().slice(1..)))
            }
        }
        HeapObj::Chunked(c) => {
            if c.chunk.len() > 1 {
                Ok(heap.chunked(c.chunk[1..].to_vec(), c.rest))
            } else {
                Ok(c.rest)
            }
        }
        _ => {
            // seq() already normalized everything else away
            let mut cursor = SeqCursor::new(s);
            cursor.next(Some(heap))?;
            Ok(heap.list_from(cursor.collect(Some(heap))?))
        }
    }
}

/// `rest` that returns nil instead of an empty sequence.
pub fn next(heap: &Heap, v: Value) -> Result<Value> {
    let r = rest(heap, v)?;
    seq(heap, r)
}

/// Element count; realizes lazy layers.
pub fn count(heap: &Heap, v: Value) -> Result<usize> {
    if v.is_nil() {
        return Ok(0);
    }
    if let Some(n) = crate::collections::coll_count(v) {
        return Ok(n);
    }
    let s = seq(heap, v)?;
    if s.is_nil() {
        return Ok(0);
    }
    Ok(SeqCursor::new(s).collect(Some(heap))?.len())
}

/// Nth element (zero-based); errors past the end.
pub fn nth(heap: &Heap, v: Value, n: usize) -> Result<Value> {
    let s = seq(heap, v)?;
    let mut cursor = SeqCursor::new(s);
    let mut i = 0;
    while let Some(item) = cursor.next(Some(heap))? {
        if i == n {
            return Ok(item);
        }
        i += 1;
    }
    Err(Error::value_error(format!("index {n} out of bounds")))
}

// =============================================================================
// Lazy realization
// =============================================================================

/// Whether a lazy sequence has been realized. Non-lazy values count as
/// realized.
pub fn is_realized(v: Value) -> bool {
    if v.is_heap() {
        if let HeapObj::Lazy(lazy) = v.obj() {
            let state = lazy.state.lock().expect("lazy seq poisoned");
            return matches!(&*state, LazyState::Realized(_));
        }
    }
    true
}

/// Force a lazy sequence, returning the cached result value.
///
/// The lock is held across the force, so a concurrent second force blocks
/// and then observes the cache; the thunk runs exactly once.
pub fn realize(heap: &Heap, v: Value) -> Result<Value> {
    if !v.is_heap() {
        return Ok(v);
    }
    let HeapObj::Lazy(lazy) = v.obj() else {
        return Ok(v);
    };

    let mut state = lazy.state.lock().expect("lazy seq poisoned");
    match &*state {
        LazyState::Realized(cached) => Ok(*cached),
        LazyState::Thunk(thunk) => {
            let result = crate::dispatch::call_fn_val(heap, *thunk, &[])?;
            *state = LazyState::Realized(result);
            Ok(result)
        }
        LazyState::Meta(meta) => {
            let result = realize_fused(heap, meta)?;
            *state = LazyState::Realized(result);
            Ok(result)
        }
    }
}

/// One inlined transform stage, base-to-outer order.
enum Stage {
    Map(Value),
    Filter(Value),
    Take { limit: i64, seen: i64 },
}

/// Realize a descriptor chain in one pass over its base.
fn realize_fused(heap: &Heap, meta: &LazyMeta) -> Result<Value> {
    // Walk outer-to-base collecting stages, then flip to base-to-outer.
    let mut stages: Vec<Stage> = Vec::new();
    let mut range: Option<(i64, Option<i64>, i64)> = None;
    let mut base: Option<Value> = None;
    let mut op = meta.op;
    let mut source = meta.source;

    loop {
        match op {
            LazyOp::Map(f) => stages.push(Stage::Map(f)),
            LazyOp::Filter(p) => stages.push(Stage::Filter(p)),
            LazyOp::Take(n) => stages.push(Stage::Take { limit: n, seen: 0 }),
            LazyOp::Range { start, end, step } => {
                range = Some((start, end, step));
                break;
            }
        }
        // Descend while the source is itself an unrealized structural layer
        let mut descended = false;
        let cur_source = source;
        if cur_source.is_heap() {
            if let HeapObj::Lazy(inner) = cur_source.obj() {
                let state = inner.state.lock().expect("lazy seq poisoned");
                if let LazyState::Meta(inner_meta) = &*state {
                    op = inner_meta.op;
                    source = inner_meta.source;
                    descended = true;
                }
            }
        }
        if !descended {
            base = Some(source);
            break;
        }
    }
    stages.reverse();

    let unbounded_range = matches!(range, Some((_, None, _)));
    let has_take = stages.iter().any(|s| matches!(s, Stage::Take { .. }));
    if unbounded_range && !has_take {
        return Err(Error::value_error(
            "cannot fully realize an unbounded sequence",
        ));
    }

    let mut out: Vec<Value> = Vec::new();
    match range {
        Some((start, end, step)) => {
            let mut i = start;
            loop {
                if let Some(end) = end {
                    if (step > 0 && i >= end) || (step < 0 && i <= end) {
                        break;
                    }
                }
                if !push_through(heap, &mut stages, Value::int(i), &mut out)? {
                    break;
                }
                i += step;
            }
        }
        None => {
            let base = base.expect("descriptor chain without base");
            let mut cursor = SeqCursor::new(seq(heap, base)?);
            while let Some(v) = cursor.next(Some(heap))? {
                if !push_through(heap, &mut stages, v, &mut out)? {
                    break;
                }
            }
        }
    }

    if out.is_empty() {
        Ok(Value::nil())
    } else {
        Ok(heap.list_from(out))
    }
}

/// Run one element through the stage pipeline. Returns false once a take
/// stage is exhausted and iteration should stop.
fn push_through(
    heap: &Heap,
    stages: &mut [Stage],
    elem: Value,
    out: &mut Vec<Value>,
) -> Result<bool> {
    let mut v = elem;
    for stage in stages.iter_mut() {
        match stage {
            Stage::Map(f) => v = crate::dispatch::call_fn_val(heap, *f, &[v])?,
            Stage::Filter(p) => {
                if !crate::dispatch::call_fn_val(heap, *p, &[v])?.is_truthy() {
                    return Ok(true);
                }
            }
            Stage::Take { limit, seen } => {
                if *seen >= *limit {
                    return Ok(false);
                }
                *seen += 1;
            }
        }
    }
    out.push(v);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> std::sync::Arc<Heap> {
        Heap::new()
    }

    #[test]
    fn test_seq_of_empty_is_nil() {
        let h = heap();
        assert!(seq(&h, h.list_from(vec![])).unwrap().is_nil());
        assert!(seq(&h, h.vector_from(vec![])).unwrap().is_nil());
        assert!(seq(&h, h.str_value("")).unwrap().is_nil());
        assert!(seq(&h, Value::nil()).unwrap().is_nil());
    }

    #[test]
    fn test_first_rest_list() {
        let h = heap();
        let l = h.list_from(vec![Value::int(1), Value::int(2), Value::int(3)]);
        assert_eq!(first(&h, l).unwrap().as_int(), 1);
        let r = rest(&h, l).unwrap();
        assert_eq!(first(&h, r).unwrap().as_int(), 2);
    }

    #[test]
    fn test_cons_chain_over_vector() {
        let h = heap();
        let base = h.vector_from(vec![Value::int(2), Value::int(3)]);
        let chain = h.cons(Value::int(1), base);
        let items = SeqCursor::new(chain).collect(Some(&h)).unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_int(), 1);
        assert_eq!(items[2].as_int(), 3);
    }

    #[test]
    fn test_rest_of_empty_is_empty_not_nil() {
        let h = heap();
        let r = rest(&h, h.list_from(vec![])).unwrap();
        assert!(!r.is_nil());
        assert_eq!(r.kind(), ValueKind::List);
        assert!(next(&h, h.list_from(vec![])).unwrap().is_nil());
    }

    #[test]
    fn test_chunked_iteration() {
        let h = heap();
        let tail = h.list_from(vec![Value::int(4)]);
        let c = h.chunked(vec![Value::int(1), Value::int(2), Value::int(3)], tail);
        let items = SeqCursor::new(c).collect(Some(&h)).unwrap();
        assert_eq!(items.len(), 4);
        assert_eq!(items[3].as_int(), 4);
    }

    #[test]
    fn test_map_seq_yields_entries() {
        let h = heap();
        let m = h.array_map(vec![(h.keyword(None, "a"), Value::int(1))]);
        let s = seq(&h, m).unwrap();
        let entry = first(&h, s).unwrap();
        assert_eq!(entry.kind(), ValueKind::Vector);
        assert_eq!(entry.as_seq_items()[1].as_int(), 1);
    }

    #[test]
    fn test_fused_range_realization() {
        let h = heap();
        let r = h.lazy_meta(LazyMeta {
            op: LazyOp::Range {
                start: 0,
                end: Some(5),
                step: 1,
            },
            source: Value::nil(),
        });
        let items = SeqCursor::new(r).collect(Some(&h)).unwrap();
        let nums: Vec<i64> = items.iter().map(|v| v.as_int()).collect();
        assert_eq!(nums, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_take_bounds_unbounded_range() {
        let h = heap();
        let r = h.lazy_meta(LazyMeta {
            op: LazyOp::Range {
                start: 10,
                end: None,
                step: 1,
            },
            source: Value::nil(),
        });
        let t = h.lazy_meta(LazyMeta {
            op: LazyOp::Take(3),
            source: r,
        });
        let items = SeqCursor::new(t).collect(Some(&h)).unwrap();
        let nums: Vec<i64> = items.iter().map(|v| v.as_int()).collect();
        assert_eq!(nums, vec![10, 11, 12]);
    }

    #[test]
    fn test_unbounded_range_without_take_fails() {
        let h = heap();
        let r = h.lazy_meta(LazyMeta {
            op: LazyOp::Range {
                start: 0,
                end: None,
                step: 1,
            },
            source: Value::nil(),
        });
        assert!(realize(&h, r).is_err());
    }

    #[test]
    fn test_realization_is_cached() {
        let h = heap();
        let r = h.lazy_meta(LazyMeta {
            op: LazyOp::Range {
                start: 0,
                end: Some(3),
                step: 1,
            },
            source: Value::nil(),
        });
        assert!(!is_realized(r));
        let v1 = realize(&h, r).unwrap();
        assert!(is_realized(r));
        let v2 = realize(&h, r).unwrap();
        // Second force returns the identical cached value
        assert!(v1.identical(v2));
    }

    #[test]
    fn test_lazy_realized_nil_is_empty_not_nil_value() {
        let h = heap();
        let r = h.lazy_meta(LazyMeta {
            op: LazyOp::Range {
                start: 0,
                end: Some(0),
                step: 1,
            },
            source: Value::nil(),
        });
        // The lazy value itself is truthy even though it realizes empty
        assert!(r.is_truthy());
        assert!(realize(&h, r).unwrap().is_nil());
        assert!(seq(&h, r).unwrap().is_nil());
    }
}
