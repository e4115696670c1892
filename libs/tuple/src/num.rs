// Copyright 2026 Loam Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Numeric tower for the `+`/`-` update operations.
//!
//! Integers are carried as `i128`, which covers the sum of any two values in
//! the signed/unsigned 64-bit wire range, so overflow is detected exactly
//! once when the result is stored. Type promotion follows
//! `int -> float -> double -> decimal`; once a decimal is involved the result
//! stays decimal.

use loam_error::{Error, Result};
use rmpv::Value;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

use crate::codec::Cursor;

/// MsgPack extension tag carrying a decimal value. The payload is the
/// canonical decimal string.
pub const DECIMAL_EXT_TYPE: i8 = 1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Int(i128),
    Float(f32),
    Double(f64),
    Decimal(Decimal),
}

/// Context-free arithmetic failures; the op layer attaches opcode and field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithError {
    IntegerOverflow,
    DecimalOverflow,
}

// === impl Number ===

impl Number {
    pub fn from_value(v: &Value) -> Option<Number> {
        match v {
            Value::Integer(i) => match (i.as_u64(), i.as_i64()) {
                (Some(u), _) => Some(Number::Int(i128::from(u))),
                (None, Some(s)) => Some(Number::Int(i128::from(s))),
                (None, None) => None,
            },
            Value::F32(f) => Some(Number::Float(*f)),
            Value::F64(f) => Some(Number::Double(*f)),
            Value::Ext(tag, data) if *tag == DECIMAL_EXT_TYPE => {
                decimal_from_bytes(data).ok().map(Number::Decimal)
            }
            _ => None,
        }
    }

    /// Decode a single MsgPack value; `Ok(None)` when it is not numeric.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Option<Number>> {
        let v = Cursor::new(bytes).read_value()?;
        Ok(Self::from_value(&v))
    }

    /// Wire representation. Integer results are range-checked before this is
    /// reached, so the cast into the unsigned/signed 64-bit split is exact.
    pub fn to_value(self) -> Value {
        match self {
            Number::Int(v) => {
                if v >= 0 {
                    Value::from(v as u64)
                } else {
                    Value::from(v as i64)
                }
            }
            Number::Float(f) => Value::F32(f),
            Number::Double(d) => Value::F64(d),
            Number::Decimal(d) => Value::Ext(DECIMAL_EXT_TYPE, d.to_string().into_bytes()),
        }
    }

    fn rank(self) -> u8 {
        match self {
            Number::Int(_) => 0,
            Number::Float(_) => 1,
            Number::Double(_) => 2,
            Number::Decimal(_) => 3,
        }
    }

    fn to_float(self) -> f32 {
        match self {
            Number::Int(v) => v as f32,
            Number::Float(f) => f,
            // unreachable by promotion order, but total anyway
            Number::Double(d) => d as f32,
            Number::Decimal(_) => f32::NAN,
        }
    }

    fn to_double(self) -> f64 {
        match self {
            Number::Int(v) => v as f64,
            Number::Float(f) => f64::from(f),
            Number::Double(d) => d,
            Number::Decimal(_) => f64::NAN,
        }
    }

    fn to_decimal(self) -> core::result::Result<Decimal, ArithError> {
        match self {
            Number::Int(v) => Decimal::try_from_i128_with_scale(v, 0)
                .map_err(|_| ArithError::DecimalOverflow),
            Number::Float(f) => Decimal::from_f32(f).ok_or(ArithError::DecimalOverflow),
            Number::Double(d) => Decimal::from_f64(d).ok_or(ArithError::DecimalOverflow),
            Number::Decimal(d) => Ok(d),
        }
    }
}

impl core::ops::Neg for Number {
    type Output = Number;

    fn neg(self) -> Number {
        match self {
            Number::Int(v) => Number::Int(-v),
            Number::Float(f) => Number::Float(-f),
            Number::Double(d) => Number::Double(-d),
            Number::Decimal(d) => Number::Decimal(-d),
        }
    }
}

pub fn decimal_from_bytes(data: &[u8]) -> Result<Decimal> {
    let s = core::str::from_utf8(data)
        .map_err(|_| Error::IllegalParams("invalid decimal payload".into()))?;
    s.parse::<Decimal>()
        .map_err(|_| Error::IllegalParams(format!("invalid decimal '{s}'")))
}

/// `lhs + rhs` or `lhs - rhs` with promotion and overflow checks.
pub fn arith(subtract: bool, lhs: Number, rhs: Number) -> core::result::Result<Number, ArithError> {
    let rank = lhs.rank().max(rhs.rank());
    match rank {
        0 => {
            let (Number::Int(a), Number::Int(b)) = (lhs, rhs) else {
                return Err(ArithError::IntegerOverflow);
            };
            let v = if subtract { a - b } else { a + b };
            if v > i128::from(u64::MAX) || v < i128::from(i64::MIN) {
                return Err(ArithError::IntegerOverflow);
            }
            Ok(Number::Int(v))
        }
        1 => {
            let (a, b) = (lhs.to_float(), rhs.to_float());
            Ok(Number::Float(if subtract { a - b } else { a + b }))
        }
        2 => {
            let (a, b) = (lhs.to_double(), rhs.to_double());
            Ok(Number::Double(if subtract { a - b } else { a + b }))
        }
        _ => {
            let (a, b) = (lhs.to_decimal()?, rhs.to_decimal()?);
            let v = if subtract {
                a.checked_sub(b)
            } else {
                a.checked_add(b)
            };
            v.map(Number::Decimal).ok_or(ArithError::DecimalOverflow)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_overflow_is_detected_at_the_store_boundary() {
        let max = Number::Int(i128::from(u64::MAX));
        assert_eq!(
            arith(false, max, Number::Int(1)),
            Err(ArithError::IntegerOverflow)
        );
        assert_eq!(
            arith(true, Number::Int(i128::from(i64::MIN)), Number::Int(1)),
            Err(ArithError::IntegerOverflow)
        );
        // the full unsigned range is reachable
        assert_eq!(
            arith(false, Number::Int(i128::from(u64::MAX) - 1), Number::Int(1)),
            Ok(Number::Int(i128::from(u64::MAX)))
        );
    }

    #[test]
    fn promotion_ladder() {
        assert!(matches!(
            arith(false, Number::Int(1), Number::Float(0.5)),
            Ok(Number::Float(_))
        ));
        assert!(matches!(
            arith(false, Number::Float(1.0), Number::Double(0.5)),
            Ok(Number::Double(_))
        ));
        assert!(matches!(
            arith(false, Number::Int(1), Number::Decimal(Decimal::ONE)),
            Ok(Number::Decimal(_))
        ));
    }

    #[test]
    fn decimal_round_trips_through_ext() {
        let d: Decimal = "1.050".parse().unwrap();
        let v = Number::Decimal(d).to_value();
        let Value::Ext(tag, data) = &v else {
            panic!("expected ext, got {v:?}")
        };
        assert_eq!(*tag, DECIMAL_EXT_TYPE);
        assert_eq!(decimal_from_bytes(data).unwrap(), d);
    }

    #[test]
    fn non_numeric_values_are_rejected() {
        assert_eq!(Number::from_value(&Value::from("nope")), None);
        assert_eq!(Number::from_value(&Value::Boolean(true)), None);
    }
}
