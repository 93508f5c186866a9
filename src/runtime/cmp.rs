use num_traits::Float;

use crate::{
    gc::ObjectHeap,
    runtime::{string, value::TValue},
};

pub fn are_equal<T: PartialEq>(x: T, y: T) -> bool {
    x == y
}

/// `|x - y| <= tolerance`. Not-a-number is never close to anything.
pub fn are_close<T: Float>(x: T, y: T, tolerance: T) -> bool {
    if x == y {
        return true;
    }
    (x - y).abs() <= tolerance
}

pub fn array_equal<T: PartialEq>(x: &[T], y: &[T]) -> bool {
    if x.len() != y.len() {
        return false;
    }

    x.iter().zip(y).all(|(a, b)| a == b)
}

pub fn array_close<T: Float>(x: &[T], y: &[T], tolerance: T) -> bool {
    if x.len() != y.len() {
        return false;
    }

    x.iter()
        .zip(y)
        .all(|(a, b)| are_close(*a, *b, tolerance))
}

/// Exact conversion of a float with an integral value.
pub fn float_to_int(n: f64) -> Option<i64> {
    // 2^63 is not representable as i64, -2^63 is
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    if n.floor() == n && n >= -LIMIT && n < LIMIT {
        Some(n as i64)
    } else {
        None
    }
}

/// Primitive equality, without metamethods.
pub fn raw_equal(heap: &ObjectHeap, x: &TValue, y: &TValue) -> bool {
    match (*x, *y) {
        (TValue::Int(a), TValue::Int(b)) => a == b,
        (TValue::Float(a), TValue::Float(b)) => a == b,
        // mixed numbers are equal only if both have the same integer value
        (TValue::Int(a), TValue::Float(b)) | (TValue::Float(b), TValue::Int(a)) => {
            float_to_int(b) == Some(a)
        }
        (TValue::LongString(a), TValue::LongString(b)) => {
            a == b || string::eq_long(heap.string(a), heap.string(b))
        }
        _ => x == y,
    }
}
