//! Persistent collection operations
//!
//! Vectors, hash maps, and hash sets ride on HAMT structures with real
//! structural sharing; array maps are small pair vectors that spill into
//! hash maps past a size threshold, the way small map literals stay cheap.
//! Transients are mutex-wrapped builders that `persistent!` freezes.

use crate::error::{Error, Result};
use crate::heap::Heap;
use crate::value::{HKey, HeapObj, Value, ValueKind};

/// Array maps spill to hash maps past this entry count.
pub const ARRAY_MAP_THRESHOLD: usize = 8;

/// Look a key up in any map kind. `None` when absent or not a map.
pub fn map_get(coll: Value, key: Value) -> Option<Value> {
    if !coll.is_heap() {
        return None;
    }
    match coll.obj() {
        HeapObj::ArrayMap(pairs) => pairs
            .iter()
            .find(|(k, _)| crate::eql::eql(*k, key))
            .map(|(_, v)| *v),
        HeapObj::Map(m) => m.get(&HKey(key)).copied(),
        _ => None,
    }
}

/// Whether a set contains an element.
pub fn set_contains(coll: Value, elem: Value) -> bool {
    if !coll.is_heap() {
        return false;
    }
    match coll.obj() {
        HeapObj::Set(s) => s.contains(&HKey(elem)),
        _ => false,
    }
}

/// Entry pairs of any map kind, in iteration order.
pub fn map_entries(coll: Value) -> Vec<(Value, Value)> {
    if !coll.is_heap() {
        return Vec::new();
    }
    match coll.obj() {
        HeapObj::ArrayMap(pairs) => pairs.clone(),
        HeapObj::Map(m) => m.iter().map(|(k, v)| (k.0, *v)).collect(),
        _ => Vec::new(),
    }
}

/// Elements of a set.
pub fn set_elements(coll: Value) -> Vec<Value> {
    if !coll.is_heap() {
        return Vec::new();
    }
    match coll.obj() {
        HeapObj::Set(s) => s.iter().map(|k| k.0).collect(),
        _ => Vec::new(),
    }
}

/// Entry count of any collection kind.
pub fn coll_count(coll: Value) -> Option<usize> {
    if !coll.is_heap() {
        return None;
    }
    Some(match coll.obj() {
        HeapObj::List(v) | HeapObj::Vector(v) => v.len(),
        HeapObj::ArrayMap(pairs) => pairs.len(),
        HeapObj::Map(m) => m.len(),
        HeapObj::Set(s) => s.len(),
        HeapObj::Str(s) => s.chars().count(),
        _ => return None,
    })
}

/// Associate a key with a value, returning a new collection.
///
/// Vectors accept an in-range (or one-past-end) integer index; array maps
/// stay arrays until [`ARRAY_MAP_THRESHOLD`], then spill.
pub fn assoc(heap: &Heap, coll: Value, key: Value, val: Value) -> Result<Value> {
    if coll.is_nil() {
        return Ok(heap.array_map(vec![(key, val)]));
    }
    if !coll.is_heap() {
        return Err(Error::type_error(format!(
            "cannot assoc onto {}",
            coll.type_name()
        )));
    }
    match coll.obj() {
        HeapObj::ArrayMap(pairs) => {
            let mut pairs = pairs.clone();
            match pairs.iter_mut().find(|(k, _)| crate::eql::eql(*k, key)) {
                Some(entry) => entry.1 = val,
                None => pairs.push((key, val)),
            }
            if pairs.len() > ARRAY_MAP_THRESHOLD {
                let m: im::HashMap<HKey, Value> =
                    pairs.into_iter().map(|(k, v)| (HKey(k), v)).collect();
                Ok(heap.hash_map(m))
            } else {
                Ok(heap.array_map(pairs))
            }
        }
        HeapObj::Map(m) => Ok(heap.hash_map(m.update(HKey(key), val))),
        HeapObj::Vector(v) => {
            if !key.is_int() {
                return Err(Error::type_error("vector index must be an integer").with_arg(1));
            }
            let idx = key.as_int();
            if idx < 0 || idx as usize > v.len() {
                return Err(Error::value_error(format!(
                    "index {idx} out of bounds for vector of {}",
                    v.len()
                )));
            }
            let idx = idx as usize;
            let mut v = v.clone();
            if idx == v.len() {
                v.push_back(val);
            } else {
                v.set(idx, val);
            }
            Ok(heap.vector(v))
        }
        _ => Err(Error::type_error(format!(
            "cannot assoc onto {}",
            coll.type_name()
        ))),
    }
}

/// Remove a key, returning a new map.
pub fn dissoc(heap: &Heap, coll: Value, key: Value) -> Result<Value> {
    if coll.is_nil() {
        return Ok(Value::nil());
    }
    if !coll.is_heap() {
        return Err(Error::type_error(format!(
            "cannot dissoc from {}",
            coll.type_name()
        )));
    }
    match coll.obj() {
        HeapObj::ArrayMap(pairs) => {
            let pairs: Vec<(Value, Value)> = pairs
                .iter()
                .filter(|(k, _)| !crate::eql::eql(*k, key))
                .copied()
                .collect();
            Ok(heap.array_map(pairs))
        }
        HeapObj::Map(m) => Ok(heap.hash_map(m.without(&HKey(key)))),
        _ => Err(Error::type_error(format!(
            "cannot dissoc from {}",
            coll.type_name()
        ))),
    }
}

/// Add an element to a collection: vectors append, lists prepend, sets add,
/// maps take a two-element vector entry.
pub fn conj(heap: &Heap, coll: Value, elem: Value) -> Result<Value> {
    if coll.is_nil() {
        return Ok(heap.list_from(vec![elem]));
    }
    if !coll.is_heap() {
        return Err(Error::type_error(format!(
            "cannot conj onto {}",
            coll.type_name()
        )));
    }
    match coll.obj() {
        HeapObj::List(v) => {
            let mut v = v.clone();
            v.push_front(elem);
            Ok(heap.list(v))
        }
        HeapObj::Vector(v) => {
            let mut v = v.clone();
            v.push_back(elem);
            Ok(heap.vector(v))
        }
        HeapObj::Set(s) => Ok(heap.hash_set(s.update(HKey(elem)))),
        HeapObj::ArrayMap(_) | HeapObj::Map(_) => {
            if elem.is_heap() {
                if let HeapObj::Vector(pair) = elem.obj() {
                    if pair.len() == 2 {
                        return assoc(heap, coll, pair[0], pair[1]);
                    }
                }
            }
            Err(Error::type_error("map conj expects a [key value] entry").with_arg(1))
        }
        HeapObj::Cons(_) | HeapObj::Chunked(_) | HeapObj::Lazy(_) => Ok(heap.cons(elem, coll)),
        _ => Err(Error::type_error(format!(
            "cannot conj onto {}",
            coll.type_name()
        ))),
    }
}

// =============================================================================
// Transients
// =============================================================================

/// A short-lived mutable view of a persistent collection.
pub fn transient(heap: &Heap, coll: Value) -> Result<Value> {
    if !coll.is_heap() {
        return Err(Error::type_error(format!(
            "{} has no transient form",
            coll.type_name()
        )));
    }
    match coll.obj() {
        HeapObj::Vector(v) => Ok(heap.transient_vector(v.clone())),
        HeapObj::Map(m) => Ok(heap.transient_map(m.clone())),
        HeapObj::ArrayMap(pairs) => {
            let m: im::HashMap<HKey, Value> =
                pairs.iter().map(|(k, v)| (HKey(*k), *v)).collect();
            Ok(heap.transient_map(m))
        }
        HeapObj::Set(s) => Ok(heap.transient_set(s.clone())),
        _ => Err(Error::type_error(format!(
            "{} has no transient form",
            coll.type_name()
        ))),
    }
}

pub fn conj_bang(trans: Value, elem: Value) -> Result<Value> {
    if trans.is_heap() {
        match trans.obj() {
            HeapObj::TransientVector(v) => {
                v.lock().expect("transient poisoned").push_back(elem);
                return Ok(trans);
            }
            HeapObj::TransientSet(s) => {
                let mut guard = s.lock().expect("transient poisoned");
                *guard = guard.update(HKey(elem));
                return Ok(trans);
            }
            _ => {}
        }
    }
    Err(Error::type_error("conj! expects a transient vector or set"))
}

pub fn assoc_bang(trans: Value, key: Value, val: Value) -> Result<Value> {
    if trans.is_heap() {
        if let HeapObj::TransientMap(m) = trans.obj() {
            let mut guard = m.lock().expect("transient poisoned");
            *guard = guard.update(HKey(key), val);
            return Ok(trans);
        }
    }
    Err(Error::type_error("assoc! expects a transient map"))
}

/// Freeze a transient back into its persistent form.
pub fn persistent_bang(heap: &Heap, trans: Value) -> Result<Value> {
    if trans.is_heap() {
        match trans.obj() {
            HeapObj::TransientVector(v) => {
                return Ok(heap.vector(v.lock().expect("transient poisoned").clone()));
            }
            HeapObj::TransientMap(m) => {
                return Ok(heap.hash_map(m.lock().expect("transient poisoned").clone()));
            }
            HeapObj::TransientSet(s) => {
                return Ok(heap.hash_set(s.lock().expect("transient poisoned").clone()));
            }
            _ => {}
        }
    }
    Err(Error::type_error("persistent! expects a transient"))
}

/// Build the persistent map kind a literal of `n` entries gets: array map
/// below the spill threshold, hash map above.
pub fn map_from_pairs(heap: &Heap, pairs: Vec<(Value, Value)>) -> Value {
    if pairs.len() <= ARRAY_MAP_THRESHOLD {
        heap.array_map(pairs)
    } else {
        heap.hash_map(pairs.into_iter().map(|(k, v)| (HKey(k), v)).collect())
    }
}

pub fn set_from_items(heap: &Heap, items: Vec<Value>) -> Value {
    heap.hash_set(items.into_iter().map(HKey).collect())
}

/// Whether a value is one of the map kinds.
pub fn is_map(v: Value) -> bool {
    matches!(v.kind(), ValueKind::ArrayMap | ValueKind::HashMap)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> std::sync::Arc<Heap> {
        Heap::new()
    }

    #[test]
    fn test_array_map_get_assoc() {
        let h = heap();
        let k = h.keyword(None, "a");
        let m = h.array_map(vec![(k, Value::int(1))]);
        assert_eq!(map_get(m, h.keyword(None, "a")).unwrap().as_int(), 1);

        let m2 = assoc(&h, m, h.keyword(None, "b"), Value::int(2)).unwrap();
        assert_eq!(map_get(m2, h.keyword(None, "b")).unwrap().as_int(), 2);
        // Original unchanged
        assert!(map_get(m, h.keyword(None, "b")).is_none());
    }

    #[test]
    fn test_array_map_spills_to_hash_map() {
        let h = heap();
        let mut m = h.array_map(vec![]);
        for i in 0..(ARRAY_MAP_THRESHOLD as i64 + 1) {
            m = assoc(&h, m, Value::int(i), Value::int(i * 10)).unwrap();
        }
        assert_eq!(m.kind(), ValueKind::HashMap);
        assert_eq!(map_get(m, Value::int(3)).unwrap().as_int(), 30);
    }

    #[test]
    fn test_vector_assoc() {
        let h = heap();
        let v = h.vector_from(vec![Value::int(1), Value::int(2)]);
        let v2 = assoc(&h, v, Value::int(0), Value::int(9)).unwrap();
        assert_eq!(v2.as_seq_items()[0].as_int(), 9);
        // One-past-end appends
        let v3 = assoc(&h, v, Value::int(2), Value::int(3)).unwrap();
        assert_eq!(v3.as_seq_items().len(), 3);
        // Past that is out of bounds
        assert!(assoc(&h, v, Value::int(5), Value::int(0)).is_err());
    }

    #[test]
    fn test_dissoc() {
        let h = heap();
        let m = map_from_pairs(
            &h,
            vec![(Value::int(1), Value::int(10)), (Value::int(2), Value::int(20))],
        );
        let m2 = dissoc(&h, m, Value::int(1)).unwrap();
        assert!(map_get(m2, Value::int(1)).is_none());
        assert_eq!(map_get(m2, Value::int(2)).unwrap().as_int(), 20);
    }

    #[test]
    fn test_conj_kinds() {
        let h = heap();
        let l = h.list_from(vec![Value::int(2)]);
        let l2 = conj(&h, l, Value::int(1)).unwrap();
        assert_eq!(l2.as_seq_items()[0].as_int(), 1);

        let v = h.vector_from(vec![Value::int(1)]);
        let v2 = conj(&h, v, Value::int(2)).unwrap();
        assert_eq!(v2.as_seq_items()[1].as_int(), 2);

        let s = set_from_items(&h, vec![Value::int(1)]);
        let s2 = conj(&h, s, Value::int(2)).unwrap();
        assert!(set_contains(s2, Value::int(2)));
    }

    #[test]
    fn test_transient_build() {
        let h = heap();
        let t = transient(&h, h.vector_from(vec![])).unwrap();
        for i in 0..100 {
            conj_bang(t, Value::int(i)).unwrap();
        }
        let v = persistent_bang(&h, t).unwrap();
        assert_eq!(v.as_seq_items().len(), 100);
        assert_eq!(v.as_seq_items()[99].as_int(), 99);
    }

    #[test]
    fn test_set_membership_structural() {
        let h = heap();
        // Equal strings from different allocations hit the same set slot
        let s = set_from_items(&h, vec![h.str_value("x")]);
        assert!(set_contains(s, h.str_value("x")));
        assert!(!set_contains(s, h.str_value("y")));
    }
}
