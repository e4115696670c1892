// Copyright 2026 Loam Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The update engine: apply a batch of typed mutation operations to an
//! immutable MsgPack record, producing a new record without re-encoding
//! unchanged regions.
//!
//! The output buffer lives in the caller's arena; callers own it only for the
//! arena's lifetime and must consume it before the next reset.

mod bar;
mod op;
mod squash;
mod tree;

pub use op::OPS_PER_BATCH_MAX;

use loam_arena::Arena;
use loam_error::Result;

use crate::codec::Writer;
use crate::{Dict, IndexBase};
use op::decode_ops;
use tree::Tree;

/// Result of a successful [`apply`].
#[derive(Debug, Clone, Copy)]
pub struct Applied<'a> {
    /// The new record, allocated in the caller's arena.
    pub data: &'a [u8],
    /// Bitmap of potentially affected top-level columns.
    pub column_mask: u64,
}

/// Apply `ops` to `tuple` and return the new record.
///
/// # Errors
///
/// Decode-time failures (malformed batch, unknown opcode, bad path) and
/// apply-time failures (missing field, type mismatch, overflow, intersected
/// paths, duplicate updates) abort the whole batch; the record is unchanged.
pub fn apply<'a>(
    arena: &'a Arena,
    ops: &[u8],
    tuple: &[u8],
    dict: &Dict,
    base: IndexBase,
) -> Result<Applied<'a>> {
    let batch = decode_ops(ops, dict, base)?;
    let mut tree = Tree::new();
    let root = tree.add_root(tuple)?;
    for op in &batch.ops {
        tree.apply_op(root, op)?;
    }
    flush(arena, &tree, root, batch.column_mask)
}

/// Validate a batch without a record.
///
/// # Errors
///
/// Fails with the same decode-time errors as [`apply`].
pub fn check(ops: &[u8], dict: &Dict, base: IndexBase) -> Result<()> {
    decode_ops(ops, dict, base).map(|_| ())
}

/// Apply in upsert mode: apply-time failures are logged and the offending
/// operation is skipped; decode-time failures are still fatal.
///
/// # Errors
///
/// Fails on malformed batches and on arena exhaustion.
pub fn upsert_apply<'a>(
    arena: &'a Arena,
    ops: &[u8],
    tuple: &[u8],
    dict: &Dict,
    base: IndexBase,
    suppress: bool,
) -> Result<Applied<'a>> {
    let batch = decode_ops(ops, dict, base)?;
    let mut tree = Tree::new();
    let root = tree.add_root(tuple)?;
    for op in &batch.ops {
        if let Err(e) = tree.apply_op(root, op) {
            if e.is_apply_time() {
                if !suppress {
                    tracing::warn!(field = %op.label, error = %e, "skipping upsert operation");
                }
                continue;
            }
            return Err(e);
        }
    }
    flush(arena, &tree, root, batch.column_mask)
}

/// Collapse two strictly sorted arithmetic/set batches into one equivalent
/// batch, re-encoded with the caller's index base. `Ok(None)` means the
/// batches do not have the squashable shape and must be applied sequentially.
///
/// # Errors
///
/// Fails on malformed batches, and on overflow when folding arithmetic into a
/// set value.
pub fn upsert_squash(
    first: &[u8],
    second: &[u8],
    dict: &Dict,
    base: IndexBase,
) -> Result<Option<Vec<u8>>> {
    squash::upsert_squash(first, second, dict, base)
}

fn flush<'a>(
    arena: &'a Arena,
    tree: &Tree<'_>,
    root: tree::NodeId,
    column_mask: u64,
) -> Result<Applied<'a>> {
    let size = tree.size(root);
    let out = arena.alloc_zeroed(size)?;
    {
        let mut w = Writer::new(&mut out[..]);
        tree.write(root, &mut w)?;
        debug_assert_eq!(w.pos(), size);
    }
    Ok(Applied {
        data: out,
        column_mask,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use loam_error::Error;
    use proptest::prelude::*;
    use rmpv::Value;

    fn enc(v: &Value) -> Vec<u8> {
        let mut out = Vec::new();
        rmpv::encode::write_value(&mut out, v).unwrap();
        out
    }

    fn decode(bytes: &[u8]) -> Value {
        let mut rd = bytes;
        rmpv::decode::read_value(&mut rd).unwrap()
    }

    fn tuple(fields: Vec<Value>) -> Vec<u8> {
        enc(&Value::Array(fields))
    }

    fn ops(list: Vec<Value>) -> Vec<u8> {
        enc(&Value::Array(list))
    }

    fn op(code: &str, sel: impl Into<Value>, arg: impl Into<Value>) -> Value {
        Value::Array(vec![Value::from(code), sel.into(), arg.into()])
    }

    fn apply_ok(o: &[u8], t: &[u8], base: IndexBase) -> (Vec<u8>, u64) {
        let arena = Arena::new();
        let r = apply(&arena, o, t, &Dict::new(), base).unwrap();
        (r.data.to_vec(), r.column_mask)
    }

    fn apply_err(o: &[u8], t: &[u8], base: IndexBase) -> Error {
        let arena = Arena::new();
        apply(&arena, o, t, &Dict::new(), base).unwrap_err()
    }

    #[test]
    fn empty_batch_reserializes_identically() {
        let t = tuple(vec![
            1u64.into(),
            "two".into(),
            Value::Array(vec![3u64.into(), Value::Nil]),
            Value::Map(vec![("k".into(), 4u64.into())]),
        ]);
        let (out, mask) = apply_ok(&ops(vec![]), &t, IndexBase::One);
        assert_eq!(out, t);
        assert_eq!(mask, 0);
    }

    #[test]
    fn negative_insert_appends() {
        // apply([['!', -1, 'push1']], {1,2,3}) -> {1,2,3,'push1'}
        let t = tuple(vec![1u64.into(), 2u64.into(), 3u64.into()]);
        let o = ops(vec![op("!", -1i64, "push1")]);
        let (out, _) = apply_ok(&o, &t, IndexBase::One);
        assert_eq!(
            decode(&out),
            Value::Array(vec![1u64.into(), 2u64.into(), 3u64.into(), "push1".into()])
        );
    }

    #[test]
    fn set_replaces_and_inserts_at_one_past_end() {
        let t = tuple(vec![1u64.into(), 2u64.into()]);
        let o = ops(vec![op("=", 2u64, 9u64), op("=", 3u64, 10u64)]);
        let (out, _) = apply_ok(&o, &t, IndexBase::One);
        assert_eq!(
            decode(&out),
            Value::Array(vec![1u64.into(), 9u64.into(), 10u64.into()])
        );
    }

    #[test]
    fn deep_set_rewrites_one_leaf_and_nothing_else() {
        // record with f.c.f = [4,5,6,7,8]; replace one element via path
        let nested = Value::Map(vec![(
            "c".into(),
            Value::Map(vec![(
                "f".into(),
                Value::Array(vec![
                    4u64.into(),
                    5u64.into(),
                    6u64.into(),
                    7u64.into(),
                    8u64.into(),
                ]),
            )]),
        )]);
        let t = tuple(vec![10u64.into(), nested]);
        let dict: Dict = [("f", 1u32)].into_iter().collect();

        let o = ops(vec![op("=", "f.c.f[1]", 100u64)]);
        let arena = Arena::new();
        let r = apply(&arena, &o, &t, &dict, IndexBase::Zero).unwrap();

        let expected_nested = Value::Map(vec![(
            "c".into(),
            Value::Map(vec![(
                "f".into(),
                Value::Array(vec![
                    4u64.into(),
                    100u64.into(),
                    6u64.into(),
                    7u64.into(),
                    8u64.into(),
                ]),
            )]),
        )]);
        let expected = tuple(vec![10u64.into(), expected_nested]);
        assert_eq!(r.data, &expected[..]);
        assert_eq!(r.column_mask, 1 << 1);
    }

    #[test]
    fn double_update_of_one_field_fails() {
        // apply([['+',2,10],['+',2,5]], {0,0}) -> Duplicate
        let t = tuple(vec![0u64.into(), 0u64.into()]);
        let o = ops(vec![op("+", 2u64, 10u64), op("+", 2u64, 5u64)]);
        assert!(matches!(
            apply_err(&o, &t, IndexBase::One),
            Error::Duplicate(_)
        ));
    }

    #[test]
    fn integer_overflow_aborts_the_batch() {
        // apply([['+',2,1]], {0, u64::MAX}) -> IntegerOverflow
        let t = tuple(vec![0u64.into(), u64::MAX.into()]);
        let o = ops(vec![op("+", 2u64, 1u64)]);
        assert!(matches!(
            apply_err(&o, &t, IndexBase::One),
            Error::IntegerOverflow { .. }
        ));
    }

    #[test]
    fn arithmetic_promotes_to_decimal() {
        let t = tuple(vec![1u64.into()]);
        let o = ops(vec![op("+", 0u64, Value::Ext(1, b"1.5".to_vec()))]);
        let (out, _) = apply_ok(&o, &t, IndexBase::Zero);
        assert_eq!(decode(&out), Value::Array(vec![Value::Ext(1, b"2.5".to_vec())]));
    }

    #[test]
    fn subtraction_can_go_negative() {
        let t = tuple(vec![3u64.into()]);
        let o = ops(vec![op("-", 0u64, 10u64)]);
        let (out, _) = apply_ok(&o, &t, IndexBase::Zero);
        assert_eq!(decode(&out), Value::Array(vec![Value::from(-7i64)]));
    }

    #[test]
    fn bitwise_ops_work_on_unsigned_fields() {
        let t = tuple(vec![0b1100u64.into(), 0b1100u64.into(), 0b1100u64.into()]);
        let o = ops(vec![
            op("&", 0u64, 0b1010u64),
            op("|", 1u64, 0b0011u64),
            op("^", 2u64, 0b1111u64),
        ]);
        let (out, _) = apply_ok(&o, &t, IndexBase::Zero);
        assert_eq!(
            decode(&out),
            Value::Array(vec![0b1000u64.into(), 0b1111u64.into(), 0b0011u64.into()])
        );
    }

    #[test]
    fn bitwise_rejects_negative_sources() {
        let t = tuple(vec![Value::from(-1i64)]);
        let o = ops(vec![op("&", 0u64, 1u64)]);
        assert!(matches!(
            apply_err(&o, &t, IndexBase::Zero),
            Error::UpdateFieldType { .. }
        ));
    }

    #[test]
    fn splice_inserts_at_end_when_offset_equals_length() {
        let t = tuple(vec!["hello".into()]);
        let o = ops(vec![Value::Array(vec![
            ":".into(),
            0u64.into(),
            5u64.into(),
            0u64.into(),
            "!!".into(),
        ])]);
        let (out, _) = apply_ok(&o, &t, IndexBase::Zero);
        assert_eq!(decode(&out), Value::Array(vec!["hello!!".into()]));
    }

    #[test]
    fn splice_negative_offset_counts_from_the_tail() {
        let t = tuple(vec!["hello".into()]);
        let o = ops(vec![Value::Array(vec![
            ":".into(),
            0u64.into(),
            Value::from(-1i64),
            1u64.into(),
            "p!".into(),
        ])]);
        let (out, _) = apply_ok(&o, &t, IndexBase::Zero);
        assert_eq!(decode(&out), Value::Array(vec!["hellp!".into()]));
    }

    #[test]
    fn splice_negative_cut_keeps_a_tail() {
        // cut everything after offset 1 except the last 2 bytes
        let t = tuple(vec!["abcdef".into()]);
        let o = ops(vec![Value::Array(vec![
            ":".into(),
            0u64.into(),
            1u64.into(),
            Value::from(-2i64),
            "X".into(),
        ])]);
        let (out, _) = apply_ok(&o, &t, IndexBase::Zero);
        assert_eq!(decode(&out), Value::Array(vec!["aXef".into()]));
    }

    #[test]
    fn splice_offset_below_start_fails() {
        let t = tuple(vec!["hello".into()]);
        let o = ops(vec![Value::Array(vec![
            ":".into(),
            0u64.into(),
            Value::from(-10i64),
            0u64.into(),
            "x".into(),
        ])]);
        assert!(matches!(
            apply_err(&o, &t, IndexBase::Zero),
            Error::Splice { .. }
        ));
    }

    #[test]
    fn delete_clamps_to_remaining_fields() {
        let t = tuple(vec![1u64.into(), 2u64.into(), 3u64.into()]);
        let o = ops(vec![op("#", 2u64, 100u64)]);
        let (out, _) = apply_ok(&o, &t, IndexBase::One);
        assert_eq!(decode(&out), Value::Array(vec![1u64.into()]));
    }

    #[test]
    fn delete_last_then_insert_restores_length() {
        let t = tuple(vec![1u64.into(), 2u64.into(), 3u64.into()]);
        let o = ops(vec![op("#", 3u64, 1u64), op("!", 3u64, 99u64)]);
        let (out, _) = apply_ok(&o, &t, IndexBase::One);
        assert_eq!(
            decode(&out),
            Value::Array(vec![1u64.into(), 2u64.into(), 99u64.into()])
        );
    }

    #[test]
    fn field_index_zero_under_base_one_fails() {
        let t = tuple(vec![1u64.into()]);
        let o = ops(vec![op("=", 0u64, 5u64)]);
        assert!(matches!(
            apply_err(&o, &t, IndexBase::One),
            Error::NoSuchField(_)
        ));
    }

    #[test]
    fn map_set_insert_and_delete_through_paths() {
        let m = Value::Map(vec![("a".into(), 1u64.into()), ("b".into(), 2u64.into())]);
        let t = tuple(vec![m]);
        let o = ops(vec![
            op("=", "[0].a", 10u64),
            op("!", "[0].c", 3u64),
            op("#", "[0].b", 1u64),
        ]);
        let (out, _) = apply_ok(&o, &t, IndexBase::Zero);
        assert_eq!(
            decode(&out),
            Value::Array(vec![Value::Map(vec![
                ("a".into(), 10u64.into()),
                ("c".into(), 3u64.into()),
            ])])
        );
    }

    #[test]
    fn map_set_on_missing_key_inserts() {
        let m = Value::Map(vec![("a".into(), 1u64.into())]);
        let t = tuple(vec![m]);
        let o = ops(vec![op("=", "[0].fresh", 7u64)]);
        let (out, _) = apply_ok(&o, &t, IndexBase::Zero);
        assert_eq!(
            decode(&out),
            Value::Array(vec![Value::Map(vec![
                ("a".into(), 1u64.into()),
                ("fresh".into(), 7u64.into()),
            ])])
        );
    }

    #[test]
    fn map_insert_on_existing_key_is_a_duplicate() {
        let m = Value::Map(vec![("a".into(), 1u64.into())]);
        let t = tuple(vec![m]);
        let o = ops(vec![op("!", "[0].a", 2u64)]);
        assert!(matches!(
            apply_err(&o, &t, IndexBase::Zero),
            Error::Duplicate(_)
        ));
    }

    fn route_sample() -> Vec<u8> {
        // field 0: [ [7, 8, 9], 40, 50 ]
        let sub = Value::Array(vec![7u64.into(), 8u64.into(), 9u64.into()]);
        let field0 = Value::Array(vec![sub, 40u64.into(), 50u64.into()]);
        tuple(vec![field0])
    }

    #[test]
    fn diverging_paths_share_a_route() {
        let t = route_sample();
        let o = ops(vec![
            op("=", "[0][0][1]", 111u64),
            op("=", "[0][2]", 222u64),
        ]);
        let (out, _) = apply_ok(&o, &t, IndexBase::Zero);
        let expected = {
            let sub = Value::Array(vec![7u64.into(), 111u64.into(), 9u64.into()]);
            let field0 = Value::Array(vec![sub, 40u64.into(), 222u64.into()]);
            tuple(vec![field0])
        };
        assert_eq!(out, expected);
    }

    #[test]
    fn disjoint_updates_commute() {
        let t = route_sample();
        let a = ops(vec![
            op("=", "[0][0][1]", 111u64),
            op("=", "[0][2]", 222u64),
        ]);
        let b = ops(vec![
            op("=", "[0][2]", 222u64),
            op("=", "[0][0][1]", 111u64),
        ]);
        assert_eq!(
            apply_ok(&a, &t, IndexBase::Zero).0,
            apply_ok(&b, &t, IndexBase::Zero).0
        );
    }

    #[test]
    fn three_paths_split_the_route() {
        let t = route_sample();
        let o = ops(vec![
            op("=", "[0][0][1]", 111u64),
            op("=", "[0][0][2]", 112u64),
            op("=", "[0][1]", 41u64),
        ]);
        let (out, _) = apply_ok(&o, &t, IndexBase::Zero);
        let expected = {
            let sub = Value::Array(vec![7u64.into(), 111u64.into(), 112u64.into()]);
            let field0 = Value::Array(vec![sub, 41u64.into(), 50u64.into()]);
            tuple(vec![field0])
        };
        assert_eq!(out, expected);
    }

    #[test]
    fn deeply_nested_pair_lands_both_writes() {
        // [4][4][5][3][2] = 11000 and [4][4][8][3] = 19000 under base 1
        fn level(children: Vec<Value>) -> Value {
            Value::Array(children)
        }
        // build field 4 (1-based) so that [4] -> a, a[5] -> b with b[3][2]
        // and a[8] -> c with c[3]
        let b = level(vec![
            0u64.into(),
            0u64.into(),
            level(vec![1u64.into(), 2u64.into()]),
        ]);
        let c = level(vec![
            0u64.into(),
            0u64.into(),
            3u64.into(),
        ]);
        let a = level(vec![
            0u64.into(),
            0u64.into(),
            0u64.into(),
            0u64.into(),
            b,
            0u64.into(),
            0u64.into(),
            c,
        ]);
        let field4 = level(vec![0u64.into(), 0u64.into(), 0u64.into(), a]);
        let t = tuple(vec![
            "pad1".into(),
            "pad2".into(),
            "pad3".into(),
            field4,
        ]);

        let o = ops(vec![
            op("=", "[4][4][5][3][2]", 11000u64),
            op("=", "[4][4][8][3]", 19000u64),
        ]);
        let (out, _) = apply_ok(&o, &t, IndexBase::One);

        let expected = {
            let b = level(vec![
                0u64.into(),
                0u64.into(),
                level(vec![1u64.into(), 11000u64.into()]),
            ]);
            let c = level(vec![0u64.into(), 0u64.into(), 19000u64.into()]);
            let a = level(vec![
                0u64.into(),
                0u64.into(),
                0u64.into(),
                0u64.into(),
                b,
                0u64.into(),
                0u64.into(),
                c,
            ]);
            let field4 = level(vec![0u64.into(), 0u64.into(), 0u64.into(), a]);
            tuple(vec!["pad1".into(), "pad2".into(), "pad3".into(), field4])
        };
        assert_eq!(out, expected);
    }

    #[test]
    fn intersected_paths_are_rejected() {
        let t = route_sample();

        // exact same leaf
        let o = ops(vec![
            op("=", "[0][0][1]", 1u64),
            op("=", "[0][0][1]", 2u64),
        ]);
        assert!(matches!(
            apply_err(&o, &t, IndexBase::Zero),
            Error::UnsupportedUpdate(_)
        ));

        // one path is a prefix of the other
        let o = ops(vec![
            op("=", "[0][0]", 1u64),
            op("=", "[0][0][1]", 2u64),
        ]);
        assert!(matches!(
            apply_err(&o, &t, IndexBase::Zero),
            Error::UnsupportedUpdate(_)
        ));
    }

    #[test]
    fn structural_bar_is_rematerialized_on_branch() {
        // first a deep insert, then a sibling write in the same array
        let t = route_sample();
        let o = ops(vec![
            op("!", "[0][0][1]", 555u64),
            op("=", "[0][0][0]", 666u64),
        ]);
        let (out, _) = apply_ok(&o, &t, IndexBase::Zero);
        let expected = {
            let sub = Value::Array(vec![
                666u64.into(),
                555u64.into(),
                8u64.into(),
                9u64.into(),
            ]);
            let field0 = Value::Array(vec![sub, 40u64.into(), 50u64.into()]);
            tuple(vec![field0])
        };
        assert_eq!(out, expected);
    }

    #[test]
    fn structural_bar_with_matching_prefix_rematerializes() {
        // a second path running onto a delete's final token decodes the
        // delete's container, replays the delete, and then addresses the
        // shifted layout: index 1 now holds what used to be index 2
        let t = route_sample();
        let o = ops(vec![
            op("#", "[0][0][1]", 1u64),
            op("=", "[0][0][1]", 99u64),
        ]);
        let (out, _) = apply_ok(&o, &t, IndexBase::Zero);
        let expected = {
            let sub = Value::Array(vec![7u64.into(), 99u64.into()]);
            let field0 = Value::Array(vec![sub, 40u64.into(), 50u64.into()]);
            tuple(vec![field0])
        };
        assert_eq!(out, expected);
    }

    #[test]
    fn delete_bar_then_write_to_the_shifted_slot() {
        // same shape with no shared prefix: the field itself is decoded in
        // place instead of being wrapped in a route
        let t = route_sample();
        let o = ops(vec![op("#", "[0][0]", 1u64), op("=", "[0][0]", 1u64)]);
        let (out, _) = apply_ok(&o, &t, IndexBase::Zero);
        let expected = {
            let field0 = Value::Array(vec![1u64.into(), 50u64.into()]);
            tuple(vec![field0])
        };
        assert_eq!(out, expected);
    }

    #[test]
    fn repeated_deep_inserts_at_one_position_both_land() {
        let t = route_sample();
        let o = ops(vec![
            op("!", "[0][0][1]", 555u64),
            op("!", "[0][0][1]", 556u64),
        ]);
        let (out, _) = apply_ok(&o, &t, IndexBase::Zero);
        let expected = {
            let sub = Value::Array(vec![
                7u64.into(),
                556u64.into(),
                555u64.into(),
                8u64.into(),
                9u64.into(),
            ]);
            let field0 = Value::Array(vec![sub, 40u64.into(), 50u64.into()]);
            tuple(vec![field0])
        };
        assert_eq!(out, expected);
    }

    #[test]
    fn writing_into_a_freshly_inserted_field_is_a_duplicate() {
        // the insert replays fine, but the follow-up write addresses the
        // very field the insert created
        let t = route_sample();
        let o = ops(vec![
            op("!", "[0][0][1]", 555u64),
            op("=", "[0][0][1]", 666u64),
        ]);
        assert!(matches!(
            apply_err(&o, &t, IndexBase::Zero),
            Error::Duplicate(_)
        ));
    }

    #[test]
    fn check_validates_without_a_record() {
        let good = ops(vec![op("=", 1u64, 5u64)]);
        assert!(check(&good, &Dict::new(), IndexBase::One).is_ok());

        let bad = ops(vec![op("?", 1u64, 5u64)]);
        assert!(check(&bad, &Dict::new(), IndexBase::One).is_err());
    }

    #[test]
    fn upsert_skips_failing_operations() {
        let t = tuple(vec!["text".into(), 5u64.into()]);
        let o = ops(vec![
            op("+", 1u64, 1u64), // arithmetic on a string: skipped
            op("+", 2u64, 1u64), // fine
        ]);
        let arena = Arena::new();
        let r = upsert_apply(&arena, &o, &t, &Dict::new(), IndexBase::One, false).unwrap();
        assert_eq!(
            decode(r.data),
            Value::Array(vec!["text".into(), 6u64.into()])
        );
    }

    #[test]
    fn upsert_still_rejects_malformed_batches() {
        let t = tuple(vec![1u64.into()]);
        let bad = ops(vec![op("?", 1u64, 1u64)]);
        let arena = Arena::new();
        assert!(upsert_apply(&arena, &bad, &t, &Dict::new(), IndexBase::One, true).is_err());
    }

    #[test]
    fn apply_after_check_produces_a_decodable_record() {
        let t = tuple(vec![
            1u64.into(),
            "two".into(),
            Value::Array(vec![3u64.into()]),
        ]);
        let o = ops(vec![
            op("=", 1u64, "one".to_string()),
            op("!", -1i64, 4u64),
            op("#", 2u64, 1u64),
        ]);
        check(&o, &Dict::new(), IndexBase::One).unwrap();
        let (out, _) = apply_ok(&o, &t, IndexBase::One);
        // decodes without error
        decode(&out);
    }

    proptest! {
        #[test]
        fn column_mask_is_the_or_of_scalar_bits(
            fields in proptest::collection::btree_set(0u32..62, 1..10)
        ) {
            let t = tuple((0..64).map(|_| Value::from(7u64)).collect());
            let list: Vec<Value> = fields
                .iter()
                .map(|f| op("=", u64::from(*f), u64::from(*f)))
                .collect();
            let o = ops(list);
            let (out, mask) = apply_ok(&o, &t, IndexBase::Zero);

            let expected: u64 = fields.iter().map(|f| 1u64 << f).fold(0, |a, b| a | b);
            prop_assert_eq!(mask, expected);

            let decoded = decode(&out);
            let vals = decoded.as_array().unwrap();
            for f in &fields {
                prop_assert_eq!(&vals[*f as usize], &Value::from(u64::from(*f)));
            }
        }

        #[test]
        fn applied_records_always_decode(
            fields in proptest::collection::vec(0u64..100, 1..8),
            set_at in 0usize..8,
        ) {
            let t = tuple(fields.iter().map(|v| Value::from(*v)).collect());
            let i = (set_at % fields.len()) as u64;
            let o = ops(vec![op("=", i, 424242u64)]);
            let (out, _) = apply_ok(&o, &t, IndexBase::Zero);
            let decoded = decode(&out);
            let vals = decoded.as_array().unwrap();
            prop_assert_eq!(vals.len(), fields.len());
            prop_assert_eq!(&vals[i as usize], &Value::from(424242u64));
        }
    }
}
