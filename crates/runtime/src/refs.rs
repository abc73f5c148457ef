//! Mutable references: atoms, volatiles, delays, reduced wrappers
//!
//! Atoms implement compare-and-set under their lock so `swap!` retries on
//! concurrent modification. Volatiles are plain cells with no retry
//! semantics. Delays force once and cache.

use crate::dispatch;
use crate::error::{Error, Result};
use crate::heap::Heap;
use crate::value::{DelayState, HeapObj, Value};

fn atom_cell(v: Value) -> Result<&'static std::sync::Mutex<Value>> {
    if v.is_heap() {
        if let HeapObj::Atom(a) = v.obj() {
            // The heap outlives every value; stretch the borrow to match.
            return Ok(unsafe { &*(&a.value as *const std::sync::Mutex<Value>) });
        }
    }
    Err(Error::type_error(format!("{} is not an atom", v.type_name())))
}

pub fn atom_deref(atom: Value) -> Result<Value> {
    Ok(*atom_cell(atom)?.lock().expect("atom poisoned"))
}

pub fn atom_reset(atom: Value, new: Value) -> Result<Value> {
    *atom_cell(atom)?.lock().expect("atom poisoned") = new;
    Ok(new)
}

/// Set the atom to `new` iff its current value is identical to `expected`.
pub fn atom_compare_and_set(atom: Value, expected: Value, new: Value) -> Result<bool> {
    let cell = atom_cell(atom)?;
    let mut guard = cell.lock().expect("atom poisoned");
    if guard.identical(expected) {
        *guard = new;
        Ok(true)
    } else {
        Ok(false)
    }
}

/// Apply `f` to the atom's value, retrying until the compare-and-set wins.
pub fn atom_swap(heap: &Heap, atom: Value, f: Value, extra: &[Value]) -> Result<Value> {
    loop {
        let old = atom_deref(atom)?;
        let mut args = Vec::with_capacity(1 + extra.len());
        args.push(old);
        args.extend_from_slice(extra);
        let new = dispatch::call_fn_val(heap, f, &args)?;
        if atom_compare_and_set(atom, old, new)? {
            return Ok(new);
        }
    }
}

// =============================================================================
// Volatiles
// =============================================================================

fn volatile_cell(v: Value) -> Result<&'static std::sync::Mutex<Value>> {
    if v.is_heap() {
        if let HeapObj::Volatile(cell) = v.obj() {
            return Ok(unsafe { &*(cell as *const std::sync::Mutex<Value>) });
        }
    }
    Err(Error::type_error(format!(
        "{} is not a volatile",
        v.type_name()
    )))
}

pub fn volatile_deref(v: Value) -> Result<Value> {
    Ok(*volatile_cell(v)?.lock().expect("volatile poisoned"))
}

pub fn volatile_reset(v: Value, new: Value) -> Result<Value> {
    *volatile_cell(v)?.lock().expect("volatile poisoned") = new;
    Ok(new)
}

/// Plain read-apply-write; volatiles promise no atomicity.
pub fn volatile_swap(heap: &Heap, v: Value, f: Value, extra: &[Value]) -> Result<Value> {
    let old = volatile_deref(v)?;
    let mut args = Vec::with_capacity(1 + extra.len());
    args.push(old);
    args.extend_from_slice(extra);
    let new = dispatch::call_fn_val(heap, f, &args)?;
    volatile_reset(v, new)
}

// =============================================================================
// Delays
// =============================================================================

/// Force a delay: invoke the body once, cache, return the cache afterward.
pub fn delay_force(heap: &Heap, delay: Value) -> Result<Value> {
    if !delay.is_heap() {
        return Ok(delay);
    }
    let HeapObj::Delay(d) = delay.obj() else {
        return Ok(delay);
    };
    let mut state = d.state.lock().expect("delay poisoned");
    match &*state {
        DelayState::Forced(v) => Ok(*v),
        DelayState::Pending(body) => {
            let result = dispatch::call_fn_val(heap, *body, &[])?;
            *state = DelayState::Forced(result);
            Ok(result)
        }
    }
}

pub fn delay_is_forced(delay: Value) -> bool {
    if delay.is_heap() {
        if let HeapObj::Delay(d) = delay.obj() {
            return matches!(
                &*d.state.lock().expect("delay poisoned"),
                DelayState::Forced(_)
            );
        }
    }
    true
}

// =============================================================================
// Reduced
// =============================================================================

pub fn is_reduced(v: Value) -> bool {
    v.is_heap() && matches!(v.obj(), HeapObj::Reduced(_))
}

pub fn reduced_unwrap(v: Value) -> Value {
    if v.is_heap() {
        if let HeapObj::Reduced(inner) = v.obj() {
            return *inner;
        }
    }
    v
}
