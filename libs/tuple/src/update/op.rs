// Copyright 2026 Loam Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Operation batch decoder.
//!
//! A batch is a MsgPack array of per-operation arrays
//! `[opcode, selector, args...]`. Decoding validates everything that can be
//! validated without a record: opcodes, argument counts and types, path
//! syntax, the batch size cap. It also accumulates the column mask
//! summarizing which top-level columns the batch may touch.

use loam_error::{Error, Result};
use smallvec::SmallVec;

use crate::codec::Cursor;
use crate::num::Number;
use crate::path::{Lexer, Token};
use crate::{Dict, IndexBase};

/// Hard cap on the number of operations in one batch.
pub const OPS_PER_BATCH_MAX: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpCode {
    Set,
    Insert,
    Delete,
    Add,
    Subtract,
    BitAnd,
    BitOr,
    BitXor,
    Splice,
}

// === impl OpCode ===

impl OpCode {
    fn from_str(s: &str) -> Option<Self> {
        match s {
            "=" => Some(OpCode::Set),
            "!" => Some(OpCode::Insert),
            "#" => Some(OpCode::Delete),
            "+" => Some(OpCode::Add),
            "-" => Some(OpCode::Subtract),
            "&" => Some(OpCode::BitAnd),
            "|" => Some(OpCode::BitOr),
            "^" => Some(OpCode::BitXor),
            ":" => Some(OpCode::Splice),
            _ => None,
        }
    }

    pub(crate) fn as_char(self) -> char {
        match self {
            OpCode::Set => '=',
            OpCode::Insert => '!',
            OpCode::Delete => '#',
            OpCode::Add => '+',
            OpCode::Subtract => '-',
            OpCode::BitAnd => '&',
            OpCode::BitOr => '|',
            OpCode::BitXor => '^',
            OpCode::Splice => ':',
        }
    }

    /// `!` and `#` mutate the parent container instead of one value.
    pub(crate) fn is_structural(self) -> bool {
        matches!(self, OpCode::Insert | OpCode::Delete)
    }

    fn argc(self) -> u32 {
        match self {
            OpCode::Splice => 5,
            _ => 3,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Arg<'a> {
    /// Raw MsgPack value for `=` and `!`.
    Value(&'a [u8]),
    /// Field count for `#`.
    Delete(u32),
    /// Decoded numeric argument for `+`/`-`.
    Arith(Number),
    /// Unsigned argument for `&`, `|`, `^`.
    Bit(u64),
    /// `(offset, cut_length, paste)` for `:`.
    Splice {
        offset: i64,
        cut: i64,
        paste: &'a str,
    },
}

/// How the operation addressed its field, kept verbatim for error messages.
#[derive(Debug, Clone, Copy)]
pub(crate) enum SelLabel<'a> {
    Index(i64),
    Path(&'a str),
}

impl core::fmt::Display for SelLabel<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SelLabel::Index(i) => write!(f, "{i}"),
            SelLabel::Path(p) => write!(f, "'{p}'"),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Op<'a> {
    pub code: OpCode,
    /// 0-based top-level position; negative counts from the tail.
    pub field_no: i64,
    /// Residual path positioned after the leading token, when there is one.
    pub path: Option<Lexer<'a>>,
    pub arg: Arg<'a>,
    pub label: SelLabel<'a>,
    pub base: u32,
}

// === impl Op ===

impl<'a> Op<'a> {
    pub fn no_such_field(&self) -> Error {
        Error::NoSuchField(self.label.to_string())
    }

    pub fn bad_type(&self, expected: &'static str) -> Error {
        Error::UpdateFieldType {
            op: self.code.as_char(),
            field: self.label.to_string(),
            expected,
        }
    }

    pub fn double_update(&self) -> Error {
        Error::Duplicate(format!(
            "field {} is updated more than once in the same batch",
            self.label
        ))
    }

    pub fn intersected(&self) -> Error {
        Error::UnsupportedUpdate(format!("intersected JSON paths at field {}", self.label))
    }
}

pub(crate) struct Batch<'a> {
    pub ops: SmallVec<[Op<'a>; 8]>,
    pub column_mask: u64,
}

/// Decode and validate a batch without touching a record.
pub(crate) fn decode_ops<'a>(buf: &'a [u8], dict: &Dict, base: IndexBase) -> Result<Batch<'a>> {
    let mut c = Cursor::new(buf);
    let count = c
        .read_array_header()
        .map_err(|_| Error::IllegalParams("update operations must be a msgpack array".into()))?;
    if count as usize > OPS_PER_BATCH_MAX {
        return Err(Error::IllegalParams(format!(
            "too many operations: {count} (at most {OPS_PER_BATCH_MAX})"
        )));
    }

    let mut ops = SmallVec::with_capacity(count as usize);
    let mut column_mask = 0u64;
    for _ in 0..count {
        let op = decode_one(&mut c, dict, base)?;
        column_mask |= op_mask(op.code, op.field_no, op.path.is_some());
        ops.push(op);
    }
    if !c.is_empty() {
        return Err(Error::IllegalParams(
            "trailing bytes after the operations array".into(),
        ));
    }

    Ok(Batch { ops, column_mask })
}

fn decode_one<'a>(c: &mut Cursor<'a>, dict: &Dict, base: IndexBase) -> Result<Op<'a>> {
    let argc = c.read_array_header().map_err(|_| {
        Error::IllegalParams("each update operation must be an array [op, field, args...]".into())
    })?;
    if argc < 1 {
        return Err(Error::IllegalParams("empty update operation".into()));
    }

    let code_str = c
        .read_str()
        .map_err(|_| Error::IllegalParams("update operation code must be a string".into()))?;
    let code = OpCode::from_str(code_str).ok_or_else(|| {
        Error::IllegalParams(format!("unknown update operation code '{code_str}'"))
    })?;
    if argc != code.argc() {
        return Err(Error::IllegalParams(format!(
            "wrong number of arguments for '{}': expected {}, got {argc}",
            code.as_char(),
            code.argc(),
        )));
    }

    let (field_no, path, label) = decode_selector(c, dict, base)?;

    let label_owned = label;
    let arg = match code {
        OpCode::Set | OpCode::Insert => Arg::Value(c.skip_value()?),
        OpCode::Delete => {
            let cnt = c.read_int().map_err(|_| Error::UpdateFieldType {
                op: code.as_char(),
                field: label_owned.to_string(),
                expected: "positive integer",
            })?;
            if cnt <= 0 || cnt > i128::from(u32::MAX) {
                return Err(Error::IllegalParams(format!(
                    "cannot delete {cnt} fields"
                )));
            }
            Arg::Delete(cnt as u32)
        }
        OpCode::Add | OpCode::Subtract => {
            let v = c.read_value()?;
            let n = Number::from_value(&v).ok_or(Error::UpdateFieldType {
                op: code.as_char(),
                field: label_owned.to_string(),
                expected: "number",
            })?;
            Arg::Arith(n)
        }
        OpCode::BitAnd | OpCode::BitOr | OpCode::BitXor => {
            let v = c.read_int().map_err(|_| Error::UpdateFieldType {
                op: code.as_char(),
                field: label_owned.to_string(),
                expected: "unsigned integer",
            })?;
            if v < 0 || v > i128::from(u64::MAX) {
                return Err(Error::UpdateFieldType {
                    op: code.as_char(),
                    field: label_owned.to_string(),
                    expected: "unsigned integer",
                });
            }
            Arg::Bit(v as u64)
        }
        OpCode::Splice => {
            let offset = read_i64(c, code, label_owned)?;
            let cut = read_i64(c, code, label_owned)?;
            let paste = c.read_str().map_err(|_| Error::UpdateFieldType {
                op: code.as_char(),
                field: label_owned.to_string(),
                expected: "string",
            })?;
            Arg::Splice { offset, cut, paste }
        }
    };

    Ok(Op {
        code,
        field_no,
        path,
        arg,
        label,
        base: base.offset(),
    })
}

fn read_i64(c: &mut Cursor<'_>, code: OpCode, label: SelLabel<'_>) -> Result<i64> {
    let v = c.read_int().map_err(|_| Error::UpdateFieldType {
        op: code.as_char(),
        field: label.to_string(),
        expected: "integer",
    })?;
    i64::try_from(v).map_err(|_| Error::IllegalParams("integer argument out of range".into()))
}

fn decode_selector<'a>(
    c: &mut Cursor<'a>,
    dict: &Dict,
    base: IndexBase,
) -> Result<(i64, Option<Lexer<'a>>, SelLabel<'a>)> {
    use rmp::Marker;

    if matches!(
        c.peek_marker()?,
        Marker::FixStr(_) | Marker::Str8 | Marker::Str16 | Marker::Str32
    ) {
        let p = c.read_str()?;
        let mut lex = Lexer::new(p, base.offset());
        let field_no = match lex.next_token()? {
            Token::Str(name) => i64::from(
                dict.resolve(name)
                    .ok_or_else(|| Error::NoSuchField(format!("'{name}'")))?,
            ),
            Token::Num(n) => i64::from(n),
            Token::Any => {
                return Err(Error::UnsupportedUpdate(format!(
                    "wildcard in path '{p}'"
                )))
            }
            Token::End => return Err(Error::IllegalParams("empty update path".into())),
        };
        // lex the rest eagerly so syntax errors and wildcards fail the batch
        let mut probe = lex;
        loop {
            match probe.next_token()? {
                Token::End => break,
                Token::Any => {
                    return Err(Error::UnsupportedUpdate(format!(
                        "wildcard in path '{p}'"
                    )))
                }
                _ => {}
            }
        }
        let path = if lex.at_end() { None } else { Some(lex) };
        Ok((field_no, path, SelLabel::Path(p)))
    } else {
        let sel = c
            .read_int()
            .map_err(|_| Error::IllegalParams("field selector must be an integer or a path".into()))?;
        let sel = i64::try_from(sel)
            .map_err(|_| Error::IllegalParams("field selector out of range".into()))?;
        let b = i64::from(base.offset());
        let field_no = if sel >= b {
            sel - b
        } else if sel < 0 {
            sel
        } else {
            // 0 under 1-based indexing
            return Err(Error::NoSuchField(sel.to_string()));
        };
        Ok((field_no, None, SelLabel::Index(sel)))
    }
}

/// Which top-level columns an operation may affect. Bits 0-62 map to columns
/// 0-62, bit 63 covers every higher column. Structural top-level operations
/// shift their right-hand siblings, so they mask the whole range from the
/// touched column onward; tail-relative selectors cannot be resolved without
/// the record, so they mask everything.
fn op_mask(code: OpCode, field_no: i64, has_path: bool) -> u64 {
    if field_no < 0 {
        return u64::MAX;
    }
    let n = field_no.min(63) as u32;
    if code.is_structural() && !has_path {
        if n >= 63 {
            1 << 63
        } else {
            u64::MAX << n
        }
    } else {
        1 << n
    }
}
