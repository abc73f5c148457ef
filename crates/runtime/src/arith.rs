//! Numeric tower
//!
//! Five concrete kinds: small integer (48-bit immediate), float (IEEE 754
//! double), big integer, ratio (reduced, positive denominator), and big
//! decimal (unscaled big integer + scale).
//!
//! Binary add/sub/mul promote through the lattice:
//! 1. small op small computes in a widened range; in-range results stay
//!    small, otherwise the non-promoting entry points report overflow and
//!    the promoting ones retry in big integers
//! 2. a ratio on either side (no float) lifts both to rationals and reduces
//! 3. a big decimal on either side (no float, no ratio) aligns scales
//! 4. a big integer on either side (no float) computes big and stays big -
//!    promotion is sticky, results never demote
//! 5. anything else falls through to float
//!
//! Division reduces exact quotients all the way to integers; ratio results
//! are always in lowest terms with a positive denominator, and a
//! denominator of one is an integer, because that is a mathematical
//! identity rather than a representational choice.

use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::{One, Signed, ToPrimitive, Zero};

use crate::error::{Error, Result};
use crate::heap::Heap;
use crate::value::{BigDecData, HeapObj, RatioData, Value, ValueKind};

/// Borrowed view of a numeric value.
enum Num<'a> {
    Int(i64),
    Float(f64),
    Big(&'a BigInt),
    Ratio(&'a RatioData),
    BigDec(&'a BigDecData),
}

fn classify(v: &Value, arg: usize) -> Result<Num<'_>> {
    if v.is_float() {
        return Ok(Num::Float(v.as_float()));
    }
    if v.is_int() {
        return Ok(Num::Int(v.as_int()));
    }
    if v.is_heap() {
        match v.obj() {
            HeapObj::Big(b) => return Ok(Num::Big(b)),
            HeapObj::Ratio(r) => return Ok(Num::Ratio(r)),
            HeapObj::BigDec(d) => return Ok(Num::BigDec(d)),
            _ => {}
        }
    }
    Err(Error::type_error(format!("{} is not a number", v.type_name())).with_arg(arg))
}

/// Whether a value is one of the five numeric kinds.
pub fn is_number(v: Value) -> bool {
    matches!(
        v.kind(),
        ValueKind::Int | ValueKind::Float | ValueKind::BigInt | ValueKind::Ratio | ValueKind::BigDec
    )
}

fn to_f64(n: &Num<'_>) -> f64 {
    match n {
        Num::Int(i) => *i as f64,
        Num::Float(f) => *f,
        Num::Big(b) => b.to_f64().unwrap_or(f64::INFINITY),
        Num::Ratio(r) => {
            let num = r.num.to_f64().unwrap_or(f64::INFINITY);
            let den = r.den.to_f64().unwrap_or(f64::INFINITY);
            num / den
        }
        Num::BigDec(d) => {
            let unscaled = d.unscaled.to_f64().unwrap_or(f64::INFINITY);
            unscaled / 10f64.powi(d.scale as i32)
        }
    }
}

/// Exact rational view `(numerator, denominator)` of a non-float kind.
fn to_rational(n: &Num<'_>) -> (BigInt, BigInt) {
    match n {
        Num::Int(i) => (BigInt::from(*i), BigInt::one()),
        Num::Big(b) => ((*b).clone(), BigInt::one()),
        Num::Ratio(r) => (r.num.clone(), r.den.clone()),
        Num::BigDec(d) => (d.unscaled.clone(), pow10(d.scale)),
        Num::Float(_) => unreachable!("float has no exact rational form"),
    }
}

fn pow10(scale: u32) -> BigInt {
    num_traits::pow(BigInt::from(10), scale as usize)
}

fn is_zero(n: &Num<'_>) -> bool {
    match n {
        Num::Int(i) => *i == 0,
        Num::Float(f) => *f == 0.0,
        Num::Big(b) => b.is_zero(),
        Num::Ratio(r) => r.num.is_zero(),
        Num::BigDec(d) => d.unscaled.is_zero(),
    }
}

/// Construct a ratio in lowest terms with a positive denominator, reducing
/// to an integer when the denominator divides out.
pub fn make_ratio(heap: &Heap, num: BigInt, den: BigInt) -> Result<Value> {
    if den.is_zero() {
        return Err(Error::arithmetic("Divide by zero").with_arg(1));
    }
    let (mut num, mut den) = if den.is_negative() {
        (-num, -den)
    } else {
        (num, den)
    };
    let g = num.gcd(&den);
    if !g.is_one() {
        num /= &g;
        den /= &g;
    }
    if den.is_one() {
        Ok(heap.int_from_big(num))
    } else {
        Ok(heap.ratio_raw(num, den))
    }
}

// =============================================================================
// Add / subtract / multiply
// =============================================================================

#[derive(Clone, Copy)]
enum BinOp {
    Add,
    Sub,
    Mul,
}

impl BinOp {
    fn name(self) -> &'static str {
        match self {
            BinOp::Add => "add",
            BinOp::Sub => "subtract",
            BinOp::Mul => "multiply",
        }
    }

    fn on_i128(self, a: i128, b: i128) -> i128 {
        match self {
            BinOp::Add => a + b,
            BinOp::Sub => a - b,
            BinOp::Mul => a * b,
        }
    }

    fn on_big(self, a: &BigInt, b: &BigInt) -> BigInt {
        match self {
            BinOp::Add => a + b,
            BinOp::Sub => a - b,
            BinOp::Mul => a * b,
        }
    }

    fn on_f64(self, a: f64, b: f64) -> f64 {
        match self {
            BinOp::Add => a + b,
            BinOp::Sub => a - b,
            BinOp::Mul => a * b,
        }
    }
}

fn binop(heap: &Heap, op: BinOp, a: Value, b: Value, promote: bool) -> Result<Value> {
    let na = classify(&a, 0)?;
    let nb = classify(&b, 1)?;

    match (&na, &nb) {
        // Rule 1: small op small in a widened intermediate range
        (Num::Int(x), Num::Int(y)) => {
            let wide = op.on_i128(*x as i128, *y as i128);
            if let Some(v) = wide.to_i64().and_then(Value::try_int) {
                return Ok(v);
            }
            if promote {
                return Ok(heap.big(op.on_big(&BigInt::from(*x), &BigInt::from(*y))));
            }
            return Err(Error::arithmetic(format!(
                "integer overflow in {}",
                op.name()
            )));
        }
        _ => {}
    }

    let any_float = matches!(na, Num::Float(_)) || matches!(nb, Num::Float(_));

    // Rule 2: lift to rationals
    if !any_float && (matches!(na, Num::Ratio(_)) || matches!(nb, Num::Ratio(_))) {
        let (n1, d1) = to_rational(&na);
        let (n2, d2) = to_rational(&nb);
        let (num, den) = match op {
            BinOp::Add => (&n1 * &d2 + &n2 * &d1, &d1 * &d2),
            BinOp::Sub => (&n1 * &d2 - &n2 * &d1, &d1 * &d2),
            BinOp::Mul => (&n1 * &n2, &d1 * &d2),
        };
        return make_ratio(heap, num, den);
    }

    // Rule 3: align big-decimal scales
    if !any_float && (matches!(na, Num::BigDec(_)) || matches!(nb, Num::BigDec(_))) {
        let (ua, sa) = to_dec_parts(&na);
        let (ub, sb) = to_dec_parts(&nb);
        return Ok(match op {
            BinOp::Add | BinOp::Sub => {
                let scale = sa.max(sb);
                let ua = &ua * pow10(scale - sa);
                let ub = &ub * pow10(scale - sb);
                let unscaled = op.on_big(&ua, &ub);
                heap.big_dec(unscaled, scale)
            }
            BinOp::Mul => heap.big_dec(&ua * &ub, sa + sb),
        });
    }

    // Rule 4: sticky big-integer arithmetic
    if !any_float {
        let ba = to_big(&na);
        let bb = to_big(&nb);
        return Ok(heap.big(op.on_big(&ba, &bb)));
    }

    // Rule 5: float fallback
    Ok(Value::float(op.on_f64(to_f64(&na), to_f64(&nb))))
}

fn to_big(n: &Num<'_>) -> BigInt {
    match n {
        Num::Int(i) => BigInt::from(*i),
        Num::Big(b) => (*b).clone(),
        _ => unreachable!("to_big on non-integral kind"),
    }
}

fn to_dec_parts(n: &Num<'_>) -> (BigInt, u32) {
    match n {
        Num::Int(i) => (BigInt::from(*i), 0),
        Num::Big(b) => ((*b).clone(), 0),
        Num::BigDec(d) => (d.unscaled.clone(), d.scale),
        _ => unreachable!("to_dec_parts on non-decimal kind"),
    }
}

/// Non-promoting add: small-int overflow is an error.
pub fn add(heap: &Heap, a: Value, b: Value) -> Result<Value> {
    binop(heap, BinOp::Add, a, b, false)
}

/// Promoting add: small-int overflow retries in big integers.
pub fn add_promoting(heap: &Heap, a: Value, b: Value) -> Result<Value> {
    binop(heap, BinOp::Add, a, b, true)
}

pub fn sub(heap: &Heap, a: Value, b: Value) -> Result<Value> {
    binop(heap, BinOp::Sub, a, b, false)
}

pub fn sub_promoting(heap: &Heap, a: Value, b: Value) -> Result<Value> {
    binop(heap, BinOp::Sub, a, b, true)
}

pub fn mul(heap: &Heap, a: Value, b: Value) -> Result<Value> {
    binop(heap, BinOp::Mul, a, b, false)
}

pub fn mul_promoting(heap: &Heap, a: Value, b: Value) -> Result<Value> {
    binop(heap, BinOp::Mul, a, b, true)
}

/// Negate, promoting on the one overflow case (negating the minimum).
pub fn neg(heap: &Heap, a: Value) -> Result<Value> {
    sub_promoting(heap, Value::int(0), a)
}

// =============================================================================
// Division
// =============================================================================

pub fn div(heap: &Heap, a: Value, b: Value) -> Result<Value> {
    let na = classify(&a, 0)?;
    let nb = classify(&b, 1)?;

    if is_zero(&nb) {
        return Err(Error::arithmetic("Divide by zero").with_arg(1));
    }

    let any_float = matches!(na, Num::Float(_)) || matches!(nb, Num::Float(_));
    let any_dec = matches!(na, Num::BigDec(_)) || matches!(nb, Num::BigDec(_));

    // Float or big-decimal operands go through float division; dividing
    // decimals exactly would fail on non-terminating expansions.
    if any_float || any_dec {
        return Ok(Value::float(to_f64(&na) / to_f64(&nb)));
    }

    // Exact kinds reduce to a rational; a denominator of one comes back as
    // an integer (small when it fits, big otherwise).
    let (n1, d1) = to_rational(&na);
    let (n2, d2) = to_rational(&nb);
    make_ratio(heap, n1 * d2, d1 * n2)
}

// =============================================================================
// Modulo and remainder
// =============================================================================

/// Floor-mod: result takes the divisor's sign.
pub fn modulo(heap: &Heap, a: Value, b: Value) -> Result<Value> {
    let na = classify(&a, 0)?;
    let nb = classify(&b, 1)?;

    if is_zero(&nb) {
        return Err(Error::arithmetic("Divide by zero").with_arg(1));
    }

    match (&na, &nb) {
        (Num::Int(x), Num::Int(y)) => Ok(Value::int(x.mod_floor(y))),
        (Num::Int(_) | Num::Big(_), Num::Int(_) | Num::Big(_)) => {
            let ba = to_big(&na);
            let bb = to_big(&nb);
            Ok(heap.big(ba.mod_floor(&bb)))
        }
        // Rationals, decimals, or any float mix run in floating point
        _ => {
            let x = to_f64(&na);
            let y = to_f64(&nb);
            Ok(Value::float(x - y * (x / y).floor()))
        }
    }
}

/// Remainder under truncated division: result takes the dividend's sign.
pub fn rem(heap: &Heap, a: Value, b: Value) -> Result<Value> {
    let na = classify(&a, 0)?;
    let nb = classify(&b, 1)?;

    if is_zero(&nb) {
        return Err(Error::arithmetic("Divide by zero").with_arg(1));
    }

    match (&na, &nb) {
        (Num::Int(x), Num::Int(y)) => Ok(Value::int(x % y)),
        (Num::Int(_) | Num::Big(_), Num::Int(_) | Num::Big(_)) => {
            let ba = to_big(&na);
            let bb = to_big(&nb);
            Ok(heap.big(ba % bb))
        }
        _ => {
            let x = to_f64(&na);
            let y = to_f64(&nb);
            Ok(Value::float(x % y))
        }
    }
}

// =============================================================================
// Comparison and coercion
// =============================================================================

/// Three-way numeric comparison across kinds.
pub fn compare(a: Value, b: Value) -> Result<std::cmp::Ordering> {
    let na = classify(&a, 0)?;
    let nb = classify(&b, 1)?;

    let any_float = matches!(na, Num::Float(_)) || matches!(nb, Num::Float(_));
    let any_dec = matches!(na, Num::BigDec(_)) || matches!(nb, Num::BigDec(_));

    if any_float || any_dec {
        let x = to_f64(&na);
        let y = to_f64(&nb);
        return x
            .partial_cmp(&y)
            .ok_or_else(|| Error::arithmetic("NaN is not comparable"));
    }

    match (&na, &nb) {
        (Num::Int(x), Num::Int(y)) => Ok(x.cmp(y)),
        (Num::Big(x), Num::Big(y)) => Ok((*x).cmp(*y)),
        // Cross-multiplication is order-preserving: denominators are
        // always positive.
        _ => {
            let (n1, d1) = to_rational(&na);
            let (n2, d2) = to_rational(&nb);
            Ok((n1 * d2).cmp(&(n2 * d1)))
        }
    }
}

/// Mathematical equality across numeric kinds. Any float operand switches
/// both sides to float comparison.
pub fn num_eq(a: Value, b: Value) -> bool {
    let (Ok(na), Ok(nb)) = (classify(&a, 0), classify(&b, 1)) else {
        return false;
    };
    if matches!(na, Num::Float(_)) || matches!(nb, Num::Float(_)) {
        return to_f64(&na) == to_f64(&nb);
    }
    let (n1, d1) = to_rational(&na);
    let (n2, d2) = to_rational(&nb);
    n1 * d2 == n2 * d1
}

/// Coerce to a float; big integers past double range go lossy, non-numbers
/// fail.
pub fn to_float(v: Value) -> Result<f64> {
    let n = classify(&v, 0)?;
    Ok(to_f64(&n))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> std::sync::Arc<Heap> {
        Heap::new()
    }

    #[test]
    fn test_small_add() {
        let h = heap();
        assert_eq!(add(&h, Value::int(1), Value::int(2)).unwrap().as_int(), 3);
        assert_eq!(
            add(&h, Value::int(-5), Value::int(2)).unwrap().as_int(),
            -3
        );
    }

    #[test]
    fn test_overflow_non_promoting() {
        let h = heap();
        let max = Value::int(crate::value::MAX_SMALL_INT);
        let err = add(&h, max, Value::int(1)).unwrap_err();
        assert_eq!(err.kind_name(), "arithmetic_error");
        assert!(err.message.contains("overflow"));
    }

    #[test]
    fn test_overflow_promoting_yields_big() {
        let h = heap();
        let max = Value::int(crate::value::MAX_SMALL_INT);
        let v = add_promoting(&h, max, Value::int(1)).unwrap();
        assert_eq!(v.kind(), ValueKind::BigInt);
        match v.obj() {
            HeapObj::Big(b) => {
                assert_eq!(*b, BigInt::from(crate::value::MAX_SMALL_INT) + 1);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_big_arithmetic_sticky() {
        let h = heap();
        let big = h.big(BigInt::from(10));
        // 10N - 9 = 1, mathematically small, but the result stays big
        let v = sub(&h, big, Value::int(9)).unwrap();
        assert_eq!(v.kind(), ValueKind::BigInt);
    }

    #[test]
    fn test_float_contagion() {
        let h = heap();
        let v = add(&h, Value::int(1), Value::float(0.5)).unwrap();
        assert!(v.is_float());
        assert_eq!(v.as_float(), 1.5);

        // Even ratios go float when a float is present
        let third = make_ratio(&h, BigInt::from(1), BigInt::from(3)).unwrap();
        let v = mul(&h, third, Value::float(3.0)).unwrap();
        assert!(v.is_float());
    }

    #[test]
    fn test_ratio_add_reduces() {
        let h = heap();
        let a = make_ratio(&h, BigInt::from(1), BigInt::from(6)).unwrap();
        let b = make_ratio(&h, BigInt::from(1), BigInt::from(3)).unwrap();
        let v = add(&h, a, b).unwrap();
        match v.obj() {
            HeapObj::Ratio(r) => {
                assert_eq!(r.num, BigInt::from(1));
                assert_eq!(r.den, BigInt::from(2));
            }
            _ => panic!("expected ratio, got {:?}", v.kind()),
        }
    }

    #[test]
    fn test_ratio_integral_result_demotes() {
        let h = heap();
        let half = make_ratio(&h, BigInt::from(1), BigInt::from(2)).unwrap();
        let v = add(&h, half, half).unwrap();
        assert_eq!(v.kind(), ValueKind::Int);
        assert_eq!(v.as_int(), 1);
    }

    #[test]
    fn test_ratio_normalized_sign() {
        let h = heap();
        let v = make_ratio(&h, BigInt::from(1), BigInt::from(-2)).unwrap();
        match v.obj() {
            HeapObj::Ratio(r) => {
                assert_eq!(r.num, BigInt::from(-1));
                assert_eq!(r.den, BigInt::from(2));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_div_exact_small() {
        let h = heap();
        assert_eq!(div(&h, Value::int(10), Value::int(2)).unwrap().as_int(), 5);
    }

    #[test]
    fn test_div_inexact_yields_ratio() {
        let h = heap();
        let v = div(&h, Value::int(1), Value::int(4)).unwrap();
        match v.obj() {
            HeapObj::Ratio(r) => {
                assert_eq!(r.num, BigInt::from(1));
                assert_eq!(r.den, BigInt::from(4));
            }
            _ => panic!("expected ratio"),
        }
    }

    #[test]
    fn test_div_by_zero_every_kind() {
        let h = heap();
        for zero in [Value::int(0), Value::float(0.0), h.big(BigInt::zero())] {
            let err = div(&h, Value::int(1), zero).unwrap_err();
            assert_eq!(err.message, "Divide by zero");
            assert_eq!(err.arg_index, Some(1));
        }
    }

    #[test]
    fn test_big_decimal_goes_through_float_division() {
        let h = heap();
        let d = h.big_dec(BigInt::from(1), 0); // 1M
        let v = div(&h, d, Value::int(3)).unwrap();
        assert!(v.is_float());
    }

    #[test]
    fn test_big_decimal_scale_alignment() {
        let h = heap();
        // 1.50 + 0.125 = 1.625 at scale 3
        let a = h.big_dec(BigInt::from(150), 2);
        let b = h.big_dec(BigInt::from(125), 3);
        let v = add(&h, a, b).unwrap();
        match v.obj() {
            HeapObj::BigDec(d) => {
                assert_eq!(d.unscaled, BigInt::from(1625));
                assert_eq!(d.scale, 3);
            }
            _ => panic!("expected big decimal"),
        }
    }

    #[test]
    fn test_big_decimal_mul_sums_scales() {
        let h = heap();
        let a = h.big_dec(BigInt::from(15), 1); // 1.5
        let b = h.big_dec(BigInt::from(25), 1); // 2.5
        let v = mul(&h, a, b).unwrap();
        match v.obj() {
            HeapObj::BigDec(d) => {
                assert_eq!(d.unscaled, BigInt::from(375));
                assert_eq!(d.scale, 2);
            }
            _ => panic!("expected big decimal"),
        }
    }

    #[test]
    fn test_mod_floor_semantics() {
        let h = heap();
        assert_eq!(modulo(&h, Value::int(7), Value::int(3)).unwrap().as_int(), 1);
        assert_eq!(
            modulo(&h, Value::int(-7), Value::int(3)).unwrap().as_int(),
            2
        );
        assert_eq!(
            modulo(&h, Value::int(7), Value::int(-3)).unwrap().as_int(),
            -2
        );
    }

    #[test]
    fn test_rem_truncated_semantics() {
        let h = heap();
        assert_eq!(rem(&h, Value::int(7), Value::int(3)).unwrap().as_int(), 1);
        assert_eq!(rem(&h, Value::int(-7), Value::int(3)).unwrap().as_int(), -1);
        assert_eq!(rem(&h, Value::int(7), Value::int(-3)).unwrap().as_int(), 1);
    }

    #[test]
    fn test_quot_rem_mod_identity() {
        let h = heap();
        for (a, b) in [(17, 5), (-17, 5), (17, -5), (-17, -5)] {
            let m = modulo(&h, Value::int(a), Value::int(b)).unwrap().as_int();
            let q = (a as f64 / b as f64).floor() as i64;
            assert_eq!(q * b + m, a, "identity for {a} mod {b}");
        }
    }

    #[test]
    fn test_mod_by_zero() {
        let h = heap();
        let err = modulo(&h, Value::int(7), Value::int(0)).unwrap_err();
        assert_eq!(err.arg_index, Some(1));
        let err = rem(&h, Value::int(7), Value::int(0)).unwrap_err();
        assert_eq!(err.arg_index, Some(1));
    }

    #[test]
    fn test_compare_cross_kind() {
        use std::cmp::Ordering;
        let h = heap();
        let third = make_ratio(&h, BigInt::from(1), BigInt::from(3)).unwrap();
        let half = make_ratio(&h, BigInt::from(1), BigInt::from(2)).unwrap();

        assert_eq!(compare(third, half).unwrap(), Ordering::Less);
        assert_eq!(compare(Value::int(1), third).unwrap(), Ordering::Greater);
        assert_eq!(
            compare(Value::float(0.25), half).unwrap(),
            Ordering::Less
        );
        assert_eq!(
            compare(h.big(BigInt::from(5)), h.big(BigInt::from(5))).unwrap(),
            Ordering::Equal
        );
    }

    #[test]
    fn test_num_eq_cross_kind() {
        let h = heap();
        assert!(num_eq(Value::int(2), Value::float(2.0)));
        assert!(num_eq(Value::int(2), h.big(BigInt::from(2))));
        assert!(!num_eq(Value::int(2), Value::int(3)));
        let two = make_ratio(&h, BigInt::from(4), BigInt::from(2)).unwrap();
        assert!(num_eq(two, Value::int(2)));
    }

    #[test]
    fn test_to_float() {
        let h = heap();
        assert_eq!(to_float(Value::int(2)).unwrap(), 2.0);
        assert_eq!(to_float(Value::float(2.5)).unwrap(), 2.5);
        let half = make_ratio(&h, BigInt::from(1), BigInt::from(2)).unwrap();
        assert_eq!(to_float(half).unwrap(), 0.5);
        let d = h.big_dec(BigInt::from(125), 2);
        assert_eq!(to_float(d).unwrap(), 1.25);

        let err = to_float(h.str_value("x")).unwrap_err();
        assert_eq!(err.kind_name(), "type_error");
    }

    #[test]
    fn test_commutativity() {
        let h = heap();
        let cases = [
            (Value::int(3), Value::int(9)),
            (Value::int(3), Value::float(0.5)),
            (h.big(BigInt::from(7)), Value::int(2)),
        ];
        for (a, b) in cases {
            let ab = add(&h, a, b).unwrap();
            let ba = add(&h, b, a).unwrap();
            assert!(crate::eql::eql(ab, ba));
            let ab = mul(&h, a, b).unwrap();
            let ba = mul(&h, b, a).unwrap();
            assert!(crate::eql::eql(ab, ba));
        }
    }
}
