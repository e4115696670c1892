// Copyright 2026 Loam Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Collapsing two upsert batches into one.
//!
//! Only the simple shape squashes: integer selectors, `=`/`+`/`-` opcodes,
//! strictly ascending field numbers in both batches. Anything else returns
//! `None` and the caller applies the batches sequentially. The merged batch
//! is re-emitted with the caller's index base so it stays byte-compatible
//! with batches produced elsewhere.

use loam_error::{Error, Result};
use rmpv::Value;

use crate::codec::Cursor;
use crate::num::{self, Number};
use crate::update::op::{decode_ops, Arg, Op, OpCode};
use crate::update::tree::corrupt;
use crate::{Dict, IndexBase};

pub(crate) fn upsert_squash(
    first: &[u8],
    second: &[u8],
    dict: &Dict,
    base: IndexBase,
) -> Result<Option<Vec<u8>>> {
    let a = decode_ops(first, dict, base)?;
    let b = decode_ops(second, dict, base)?;
    if !squashable(&a.ops) || !squashable(&b.ops) {
        return Ok(None);
    }

    let mut out: Vec<Value> = Vec::with_capacity(a.ops.len() + b.ops.len());
    let (mut i, mut j) = (0usize, 0usize);
    loop {
        match (a.ops.get(i), b.ops.get(j)) {
            (Some(x), Some(y)) if x.field_no == y.field_no => {
                match combine(x, y, base)? {
                    Some(v) => out.push(v),
                    None => return Ok(None),
                }
                i += 1;
                j += 1;
            }
            (Some(x), Some(y)) if x.field_no < y.field_no => {
                out.push(emit(x, base)?);
                i += 1;
            }
            (Some(_), Some(y)) => {
                out.push(emit(y, base)?);
                j += 1;
            }
            (Some(x), None) => {
                out.push(emit(x, base)?);
                i += 1;
            }
            (None, Some(y)) => {
                out.push(emit(y, base)?);
                j += 1;
            }
            (None, None) => break,
        }
    }

    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &Value::Array(out))
        .map_err(|_| Error::System("failed to encode squashed operations".into()))?;
    Ok(Some(buf))
}

fn squashable(ops: &[Op<'_>]) -> bool {
    let simple = ops.iter().all(|op| {
        op.path.is_none()
            && op.field_no >= 0
            && matches!(op.code, OpCode::Set | OpCode::Add | OpCode::Subtract)
    });
    simple && ops.windows(2).all(|w| w[0].field_no < w[1].field_no)
}

fn emit(op: &Op<'_>, base: IndexBase) -> Result<Value> {
    let arg = match &op.arg {
        Arg::Value(raw) => Cursor::new(raw).read_value()?,
        Arg::Arith(n) => n.to_value(),
        _ => return Err(corrupt()),
    };
    Ok(op_value(op.code.as_char(), op.field_no, base, arg))
}

fn op_value(code: char, field_no: i64, base: IndexBase, arg: Value) -> Value {
    Value::Array(vec![
        Value::from(code.to_string()),
        Value::from(field_no + i64::from(base.offset())),
        arg,
    ])
}

/// Merge two operations on the same field; `y` is the later one.
fn combine(x: &Op<'_>, y: &Op<'_>, base: IndexBase) -> Result<Option<Value>> {
    if y.code == OpCode::Set {
        return emit(y, base).map(Some);
    }
    let Arg::Arith(ry) = &y.arg else {
        return Err(corrupt());
    };
    let ry = if y.code == OpCode::Subtract { -*ry } else { *ry };

    match (&x.code, &x.arg) {
        (OpCode::Set, Arg::Value(raw)) => {
            // apply the arithmetic to the set value now
            let Some(n) = Number::from_msgpack(raw)? else {
                return Ok(None);
            };
            let res = num::arith(false, n, ry).map_err(|e| match e {
                num::ArithError::IntegerOverflow => Error::IntegerOverflow {
                    op: y.code.as_char(),
                    field: y.label.to_string(),
                },
                num::ArithError::DecimalOverflow => Error::DecimalOverflow {
                    op: y.code.as_char(),
                    field: y.label.to_string(),
                },
            })?;
            Ok(Some(op_value('=', x.field_no, base, res.to_value())))
        }
        (OpCode::Add | OpCode::Subtract, Arg::Arith(rx)) => {
            let rx = if x.code == OpCode::Subtract { -*rx } else { *rx };
            // if the summed argument cannot be represented, squashing is
            // refused rather than failed: sequential application may still
            // stay in range
            match num::arith(false, rx, ry) {
                Ok(sum) => Ok(Some(op_value('+', x.field_no, base, sum.to_value()))),
                Err(_) => Ok(None),
            }
        }
        _ => Err(corrupt()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc(v: &Value) -> Vec<u8> {
        let mut out = Vec::new();
        rmpv::encode::write_value(&mut out, v).unwrap();
        out
    }

    fn batch(ops: Vec<Value>) -> Vec<u8> {
        enc(&Value::Array(ops))
    }

    fn op(code: &str, sel: i64, arg: Value) -> Value {
        Value::Array(vec![Value::from(code), Value::from(sel), arg])
    }

    fn squash(a: &[u8], b: &[u8]) -> Option<Vec<u8>> {
        upsert_squash(a, b, &Dict::new(), IndexBase::One).unwrap()
    }

    #[test]
    fn squash_with_empty_batch_is_identity() {
        let a = batch(vec![
            op("+", 1, Value::from(10u64)),
            op("=", 3, Value::from("x")),
        ]);
        let empty = batch(vec![]);
        assert_eq!(squash(&a, &empty).unwrap(), a);
        assert_eq!(squash(&empty, &a).unwrap(), a);
    }

    #[test]
    fn arithmetic_on_the_same_field_sums() {
        let a = batch(vec![op("+", 2, Value::from(10u64))]);
        let b = batch(vec![op("-", 2, Value::from(4u64))]);
        let merged = squash(&a, &b).unwrap();
        assert_eq!(merged, batch(vec![op("+", 2, Value::from(6u64))]));
    }

    #[test]
    fn set_then_add_becomes_set() {
        let a = batch(vec![op("=", 2, Value::from(100u64))]);
        let b = batch(vec![op("+", 2, Value::from(1u64))]);
        let merged = squash(&a, &b).unwrap();
        assert_eq!(merged, batch(vec![op("=", 2, Value::from(101u64))]));
    }

    #[test]
    fn later_set_wins() {
        let a = batch(vec![op("+", 2, Value::from(1u64))]);
        let b = batch(vec![op("=", 2, Value::from("fresh"))]);
        let merged = squash(&a, &b).unwrap();
        assert_eq!(merged, batch(vec![op("=", 2, Value::from("fresh"))]));
    }

    #[test]
    fn disjoint_fields_interleave_sorted() {
        let a = batch(vec![
            op("+", 1, Value::from(1u64)),
            op("+", 4, Value::from(4u64)),
        ]);
        let b = batch(vec![op("+", 2, Value::from(2u64))]);
        let merged = squash(&a, &b).unwrap();
        assert_eq!(
            merged,
            batch(vec![
                op("+", 1, Value::from(1u64)),
                op("+", 2, Value::from(2u64)),
                op("+", 4, Value::from(4u64)),
            ])
        );
    }

    #[test]
    fn unsquashable_shapes_return_none() {
        let simple = batch(vec![op("+", 1, Value::from(1u64))]);

        // structural op
        let b = batch(vec![op("!", 2, Value::from(1u64))]);
        assert!(squash(&simple, &b).is_none());

        // path selector
        let b = batch(vec![Value::Array(vec![
            Value::from("+"),
            Value::from("[1].x"),
            Value::from(1u64),
        ])]);
        assert!(squash(&simple, &b).is_none());

        // unsorted batch
        let b = batch(vec![
            op("+", 3, Value::from(1u64)),
            op("+", 2, Value::from(1u64)),
        ]);
        assert!(squash(&simple, &b).is_none());

        // arithmetic over a non-numeric set value
        let a = batch(vec![op("=", 1, Value::from("text"))]);
        let b = batch(vec![op("+", 1, Value::from(1u64))]);
        assert!(squash(&a, &b).is_none());
    }

    #[test]
    fn overflowing_argument_sums_refuse_to_squash() {
        let a = batch(vec![op("+", 1, Value::from(u64::MAX))]);
        let b = batch(vec![op("+", 1, Value::from(u64::MAX))]);
        assert!(squash(&a, &b).is_none());
    }
}
