//! Value hashing
//!
//! Composes the Murmur3 mixers from `clove-core` into per-kind hashes. The
//! contract: values equal under `eql` hash identically within each
//! hash-relevant family. Sequentials fold ordered (`h*31 + hk`) then mix
//! with length, maps XOR `kh ^ vh` per entry so entry order cannot matter,
//! sets sum. Cross-family numeric equality (an int and a float of the same
//! magnitude) is explicitly outside the contract; persistent maps rely on
//! the structural hash for their own keys only.

use clove_core::mix::{fmix, hash_long, hash_string, mix_coll_hash, mix_h1, mix_k1};
use num_traits::ToPrimitive;

use crate::seq::SeqCursor;
use crate::value::{HeapObj, LazyState, SymbolData, Value};

/// Seeds separating symbols from keywords with the same name.
const SYMBOL_SEED: u32 = 0x5379_6d62;
const KEYWORD_SEED: u32 = 0x4b65_7977;

/// Placeholder hash for lazy sequences nobody has realized yet.
const UNREALIZED_HASH: u32 = 0x1a27_5eec;

const TRUE_HASH: u32 = 1231;
const FALSE_HASH: u32 = 1237;

pub fn hash_value(v: Value) -> u32 {
    if v.is_float() {
        let f = v.as_float();
        // All zeros hash alike so 0.0 and -0.0 land in one bucket
        if f == 0.0 {
            return 0;
        }
        return hash_long(f.to_bits() as i64);
    }
    if v.is_nil() {
        return 0;
    }
    if v.is_bool() {
        return if v.as_bool() { TRUE_HASH } else { FALSE_HASH };
    }
    if v.is_int() {
        return hash_long(v.as_int());
    }
    if v.is_char() {
        return hash_long(v.as_char() as i64);
    }

    match v.obj() {
        HeapObj::Str(s) => hash_string(s),
        HeapObj::Symbol(sym) => hash_named(SYMBOL_SEED, sym),
        HeapObj::Keyword(sym) => hash_named(KEYWORD_SEED, sym),
        HeapObj::List(_) | HeapObj::Vector(_) | HeapObj::Cons(_) | HeapObj::Chunked(_) => {
            hash_ordered(v)
        }
        HeapObj::ArrayMap(_) | HeapObj::Map(_) => {
            let entries = crate::collections::map_entries(v);
            let mut acc: u32 = 0;
            for (k, val) in &entries {
                acc ^= hash_value(*k) ^ hash_value(*val);
            }
            mix_coll_hash(acc, entries.len() as u32)
        }
        HeapObj::Set(_) => {
            let elems = crate::collections::set_elements(v);
            let mut acc: u32 = 0;
            for e in &elems {
                acc = acc.wrapping_add(hash_value(*e));
            }
            mix_coll_hash(acc, elems.len() as u32)
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
                // An empty realized lazy must hash like () and []
                Some(cached) if cached.is_nil() => hash_ordered(cached),
                Some(cached) => hash_value(cached),
                None => UNREALIZED_HASH,
            }
        }
        // Big values that fit the small range hash like small ints, so a
        // promoted-then-reduced value keyed into a map still matches
        HeapObj::Big(b) => hash_value_big(b),
        HeapObj::Ratio(r) => {
            let hn = hash_value_big(&r.num);
            let hd = hash_value_big(&r.den);
            mix_coll_hash(hn ^ hd, 2)
        }
        HeapObj::BigDec(d) => {
            // Normalize trailing zeros so 1.50M and 1.5M hash alike
            let mut unscaled = d.unscaled.clone();
            let mut scale = d.scale;
            let ten = num_bigint::BigInt::from(10);
            use num_traits::Zero;
            while scale > 0 && !unscaled.is_zero() && (&unscaled % &ten).is_zero() {
                unscaled /= &ten;
                scale -= 1;
            }
            mix_coll_hash(hash_value_big(&unscaled) ^ hash_long(scale as i64), 2)
        }
        HeapObj::Reduced(inner) => mix_coll_hash(hash_value(*inner), 1),
        // Reference kinds hash by identity
        _ => hash_long(v.to_bits() as i64),
    }
}

fn hash_value_big(b: &num_bigint::BigInt) -> u32 {
    match b.to_i64() {
        Some(i) => hash_long(i),
        None => {
            let (sign, bytes) = b.to_bytes_le();
            let mut h: u32 = if sign == num_bigint::Sign::Minus { 1 } else { 0 };
            for chunk in bytes.chunks(4) {
                let mut block = [0u8; 4];
                block[..chunk.len()].copy_from_slice(chunk);
                h = mix_h1(h, mix_k1(u32::from_le_bytes(block)));
            }
            fmix(h, bytes.len() as u32)
        }
    }
}

fn hash_named(seed: u32, sym: &SymbolData) -> u32 {
    let ns_hash = sym.ns.as_deref().map(hash_string).unwrap_or(0);
    let name_hash = hash_string(&sym.name);
    let h = mix_h1(mix_h1(seed, mix_k1(ns_hash)), mix_k1(name_hash));
    fmix(h, sym.name.len() as u32)
}

/// Ordered fold for sequential values: `h*31 + hk`, then the collection
/// mixer with the element count. Unrealized lazy tails fall back to the
/// placeholder (hashing never allocates).
fn hash_ordered(v: Value) -> u32 {
    let mut cursor = SeqCursor::new(v);
    let mut h: u32 = 1;
    let mut n: u32 = 0;
    loop {
        match cursor.next(None) {
            Ok(Some(elem)) => {
                h = h.wrapping_mul(31).wrapping_add(hash_value(elem));
                n += 1;
            }
            Ok(None) => break,
            Err(_) => {
                h = h.wrapping_mul(31).wrapping_add(UNREALIZED_HASH);
                n += 1;
                break;
            }
        }
    }
    mix_coll_hash(h, n)
}
