// Copyright 2026 Loam Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The transient field tree built while a batch is applied.
//!
//! Nodes live in one index-keyed table; untouched subtrees stay [`Node::Nop`]
//! and point straight into the original record, so they never allocate and
//! re-serialize byte for byte. Arrays are a rope of untouched runs and
//! touched children, maps track pending mutations over an unchanged base,
//! and deep point-updates stay lazy as bars until a second path forces a
//! branch (see `bar.rs`).
//!
//! Serialization is two passes: [`Tree::size`] computes the exact output
//! length as a pure function of the tree, then [`Tree::write`] stores into a
//! caller-provided buffer of exactly that length.

use core::mem;
use core::ops::Range;

use loam_error::{Error, Result};
use rmpv::Value;

use crate::codec::{container_header_size, str_header_size, Cursor, Writer};
use crate::num::{self, ArithError, Number};
use crate::path::{Lexer, Token};
use crate::update::op::{Arg, Op, OpCode};

pub(crate) type NodeId = usize;

#[derive(Debug, Clone)]
pub(crate) enum Node<'a> {
    /// Untouched bytes of the original record.
    Nop(&'a [u8]),
    /// A leaf whose single operation has been applied.
    Scalar(NewVal<'a>),
    Array(ArrayNode<'a>),
    Map(MapNode<'a>),
    Bar(Box<BarNode<'a>>),
    Route(RouteNode<'a>),
    /// Temporarily removed from the table while being transformed.
    Taken,
}

/// A replacement value, kept unencoded until the store pass.
#[derive(Debug, Clone)]
pub(crate) enum NewVal<'a> {
    /// Raw argument bytes of a `=`/`!` operation.
    Raw(&'a [u8]),
    /// Computed result of an arithmetic or bitwise operation.
    Value(Value),
    /// Result of a splice: three zero-copy string pieces.
    Splice {
        head: &'a [u8],
        paste: &'a [u8],
        tail: &'a [u8],
    },
}

// === impl NewVal ===

impl NewVal<'_> {
    pub(crate) fn size(&self) -> usize {
        match self {
            NewVal::Raw(b) => b.len(),
            NewVal::Value(v) => crate::codec::value_size(v),
            NewVal::Splice { head, paste, tail } => {
                let n = head.len() + paste.len() + tail.len();
                str_header_size(n) + n
            }
        }
    }

    pub(crate) fn write(&self, w: &mut Writer<'_>) -> Result<()> {
        match self {
            NewVal::Raw(b) => w.write_raw(b),
            NewVal::Value(v) => w.write_value(v),
            NewVal::Splice { head, paste, tail } => {
                w.write_str_header(head.len() + paste.len() + tail.len())?;
                w.write_raw(head)?;
                w.write_raw(paste)?;
                w.write_raw(tail)
            }
        }
    }
}

/// Rope item of an array node.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Item<'a> {
    /// A run of consecutive untouched fields.
    Slice { bytes: &'a [u8], count: u32 },
    /// One touched field.
    Field(NodeId),
}

#[derive(Debug, Clone)]
pub(crate) struct ArrayNode<'a> {
    pub items: Vec<Item<'a>>,
    pub count: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct MapNode<'a> {
    /// Entry region of the original map, header stripped.
    pub body: &'a [u8],
    /// Original entry count.
    pub count: u32,
    pub new_count: u32,
    pub touched: Vec<MapTouch<'a>>,
    pub appended: Vec<(&'a str, NodeId)>,
}

#[derive(Debug, Clone)]
pub(crate) struct MapTouch<'a> {
    /// Offset of the entry's key within `body`.
    pub off: usize,
    pub key_bytes: &'a [u8],
    pub val_bytes: &'a [u8],
    pub kind: TouchKind,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum TouchKind {
    Replace(NodeId),
    Delete,
}

/// A single point-update deep inside an unparsed subtree.
#[derive(Debug, Clone)]
pub(crate) struct BarNode<'a> {
    /// The whole untouched field this bar lives in.
    pub bytes: &'a [u8],
    /// Residual path from this node, including the leading token.
    pub path: &'a str,
    pub base: u32,
    pub code: OpCode,
    pub arg: Arg<'a>,
    pub label: crate::update::op::SelLabel<'a>,
    pub kind: BarKind<'a>,
}

#[derive(Debug, Clone)]
pub(crate) enum BarKind<'a> {
    /// Scalar operation applied at the located leaf.
    Point { point: Range<usize>, new: NewVal<'a> },
    /// Insertion into the parent container located by the path.
    Insert {
        at: usize,
        key: Option<&'a str>,
        new: NewVal<'a>,
        parent: ParentMeta,
    },
    /// Deletion from the parent container located by the path.
    Delete {
        cut: Range<usize>,
        removed: u32,
        parent: ParentMeta,
    },
}

/// Header of the container a structural bar mutates.
#[derive(Debug, Clone)]
pub(crate) struct ParentMeta {
    pub header: Range<usize>,
    pub count: u32,
    pub is_map: bool,
}

/// Common-prefix node: every update descending into this field shares
/// `prefix`; `hop` holds their divergence point.
#[derive(Debug, Clone)]
pub(crate) struct RouteNode<'a> {
    pub bytes: &'a [u8],
    pub prefix: &'a str,
    pub base: u32,
    pub hop: NodeId,
    pub hop_range: Range<usize>,
}

// === impl BarNode ===

impl BarNode<'_> {
    pub(crate) fn size(&self) -> usize {
        match &self.kind {
            BarKind::Point { point, new } => self.bytes.len() - point.len() + new.size(),
            BarKind::Insert {
                key, new, parent, ..
            } => {
                let key_len = key.map_or(0, |k| str_header_size(k.len()) + k.len());
                self.bytes.len() - parent.header.len()
                    + container_header_size(parent.count + 1)
                    + key_len
                    + new.size()
            }
            BarKind::Delete {
                cut,
                removed,
                parent,
            } => {
                self.bytes.len() - parent.header.len() - cut.len()
                    + container_header_size(parent.count - removed)
            }
        }
    }

    pub(crate) fn write(&self, w: &mut Writer<'_>) -> Result<()> {
        match &self.kind {
            BarKind::Point { point, new } => {
                w.write_raw(&self.bytes[..point.start])?;
                new.write(w)?;
                w.write_raw(&self.bytes[point.end..])
            }
            BarKind::Insert {
                at,
                key,
                new,
                parent,
            } => {
                w.write_raw(&self.bytes[..parent.header.start])?;
                if parent.is_map {
                    w.write_map_header(parent.count + 1)?;
                } else {
                    w.write_array_header(parent.count + 1)?;
                }
                w.write_raw(&self.bytes[parent.header.end..*at])?;
                if let Some(k) = key {
                    w.write_str_header(k.len())?;
                    w.write_raw(k.as_bytes())?;
                }
                new.write(w)?;
                w.write_raw(&self.bytes[*at..])
            }
            BarKind::Delete {
                cut,
                removed,
                parent,
            } => {
                w.write_raw(&self.bytes[..parent.header.start])?;
                if parent.is_map {
                    w.write_map_header(parent.count - removed)?;
                } else {
                    w.write_array_header(parent.count - removed)?;
                }
                w.write_raw(&self.bytes[parent.header.end..cut.start])?;
                w.write_raw(&self.bytes[cut.end..])
            }
        }
    }
}

// === impl MapNode ===

pub(crate) struct MapEntry<'a> {
    pub off: usize,
    pub key: Option<&'a str>,
    pub key_bytes: &'a [u8],
    pub val_bytes: &'a [u8],
}

pub(crate) struct MapEntries<'a> {
    c: Cursor<'a>,
    remaining: u32,
}

impl<'a> Iterator for MapEntries<'a> {
    type Item = Result<MapEntry<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let off = self.c.pos();
        let key_bytes = match self.c.skip_value() {
            Ok(b) => b,
            Err(e) => {
                self.remaining = 0;
                return Some(Err(e));
            }
        };
        let val_bytes = match self.c.skip_value() {
            Ok(b) => b,
            Err(e) => {
                self.remaining = 0;
                return Some(Err(e));
            }
        };
        let key = Cursor::new(key_bytes).read_str().ok();
        Some(Ok(MapEntry {
            off,
            key,
            key_bytes,
            val_bytes,
        }))
    }
}

impl<'a> MapNode<'a> {
    pub(crate) fn entries(&self) -> MapEntries<'a> {
        MapEntries {
            c: Cursor::new(self.body),
            remaining: self.count,
        }
    }

    fn touch_index(&self, off: usize) -> Option<usize> {
        self.touched.iter().position(|t| t.off == off)
    }
}

pub(crate) fn corrupt() -> Error {
    Error::System("corrupt update tree".into())
}

/// Apply a scalar operation to the raw bytes of its target value.
pub(crate) fn compute_scalar_new<'a>(op: &Op<'a>, old: &'a [u8]) -> Result<NewVal<'a>> {
    match op.code {
        OpCode::Set => {
            let Arg::Value(v) = &op.arg else {
                return Err(corrupt());
            };
            Ok(NewVal::Raw(*v))
        }
        OpCode::Add | OpCode::Subtract => {
            let lhs = Number::from_msgpack(old)?.ok_or_else(|| op.bad_type("number"))?;
            let Arg::Arith(rhs) = &op.arg else {
                return Err(corrupt());
            };
            let res =
                num::arith(op.code == OpCode::Subtract, lhs, *rhs).map_err(|e| match e {
                    ArithError::IntegerOverflow => Error::IntegerOverflow {
                        op: op.code.as_char(),
                        field: op.label.to_string(),
                    },
                    ArithError::DecimalOverflow => Error::DecimalOverflow {
                        op: op.code.as_char(),
                        field: op.label.to_string(),
                    },
                })?;
            Ok(NewVal::Value(res.to_value()))
        }
        OpCode::BitAnd | OpCode::BitOr | OpCode::BitXor => {
            let v = Cursor::new(old)
                .read_int()
                .map_err(|_| op.bad_type("unsigned integer"))?;
            if v < 0 || v > i128::from(u64::MAX) {
                return Err(op.bad_type("unsigned integer"));
            }
            let a = v as u64;
            let Arg::Bit(b) = &op.arg else {
                return Err(corrupt());
            };
            let r = match op.code {
                OpCode::BitAnd => a & b,
                OpCode::BitOr => a | b,
                _ => a ^ b,
            };
            Ok(NewVal::Value(Value::from(r)))
        }
        OpCode::Splice => splice_new(op, old),
        OpCode::Insert | OpCode::Delete => Err(corrupt()),
    }
}

fn splice_new<'a>(op: &Op<'a>, old: &'a [u8]) -> Result<NewVal<'a>> {
    let s = Cursor::new(old)
        .read_str()
        .map_err(|_| op.bad_type("string"))?;
    let bytes = s.as_bytes();
    let Arg::Splice { offset, cut, paste } = &op.arg else {
        return Err(corrupt());
    };
    let len = bytes.len() as i64;

    let off = if *offset >= 0 {
        let off = *offset - i64::from(op.base);
        if off < 0 {
            return Err(Error::Splice {
                field: op.label.to_string(),
                msg: format!("offset {offset} is out of bound"),
            });
        }
        // offsets past the end clamp to the end
        off.min(len)
    } else {
        let off = len + *offset;
        if off < 0 {
            return Err(Error::Splice {
                field: op.label.to_string(),
                msg: format!("offset {offset} is out of bound"),
            });
        }
        off
    };

    // negative cut leaves that many tail bytes uncut
    let cut_len = if *cut >= 0 {
        (*cut).min(len - off)
    } else {
        (len - off + *cut).max(0)
    };

    let off = off as usize;
    let cut_len = cut_len as usize;
    Ok(NewVal::Splice {
        head: &bytes[..off],
        paste: paste.as_bytes(),
        tail: &bytes[off + cut_len..],
    })
}

#[derive(Debug, Default)]
pub(crate) struct Tree<'a> {
    pub(crate) nodes: Vec<Node<'a>>,
}

// === impl Tree ===

impl<'a> Tree<'a> {
    pub(crate) fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    pub(crate) fn add(&mut self, node: Node<'a>) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    pub(crate) fn take(&mut self, id: NodeId) -> Node<'a> {
        mem::replace(&mut self.nodes[id], Node::Taken)
    }

    pub(crate) fn put(&mut self, id: NodeId, node: Node<'a>) {
        self.nodes[id] = node;
    }

    /// Parse the outer record into the root array node, validating the whole
    /// buffer along the way.
    pub(crate) fn add_root(&mut self, tuple: &'a [u8]) -> Result<NodeId> {
        let mut c = Cursor::new(tuple);
        let count = c
            .read_array_header()
            .map_err(|_| Error::IllegalParams("tuple must be a msgpack array".into()))?;
        let body = c.skip_values(count)?;
        if !c.is_empty() {
            return Err(Error::IllegalParams("trailing bytes after the tuple".into()));
        }
        let items = if count > 0 {
            vec![Item::Slice { bytes: body, count }]
        } else {
            Vec::new()
        };
        Ok(self.add(Node::Array(ArrayNode { items, count })))
    }

    /// Apply one decoded operation, resolving tail-relative selectors against
    /// the root's current field count.
    pub(crate) fn apply_op(&mut self, root: NodeId, op: &Op<'a>) -> Result<()> {
        let mut node = self.take(root);
        let res = self.apply_op_inner(&mut node, op);
        self.put(root, node);
        res
    }

    fn apply_op_inner(&mut self, node: &mut Node<'a>, op: &Op<'a>) -> Result<()> {
        let Node::Array(arr) = node else {
            return Err(corrupt());
        };
        let count = i64::from(arr.count);
        let idx = if op.field_no >= 0 {
            op.field_no
        } else if op.code == OpCode::Insert && op.path.is_none() {
            // negative insert targets the position after the addressed field
            count + op.field_no + 1
        } else {
            count + op.field_no
        };
        if idx < 0 {
            return Err(op.no_such_field());
        }
        let Ok(i) = u32::try_from(idx) else {
            return Err(op.no_such_field());
        };
        match op.path {
            None => self.array_terminal(arr, op, i),
            Some(lex) => {
                if i >= arr.count {
                    return Err(op.no_such_field());
                }
                let (cid, _) = self.array_extract(arr, i)?;
                self.apply_to_node(cid, op, lex)
            }
        }
    }

    /// Route one operation into the node at `id`, with `lex` positioned at
    /// the next unconsumed path token.
    pub(crate) fn apply_to_node(&mut self, id: NodeId, op: &Op<'a>, lex: Lexer<'a>) -> Result<()> {
        let mut node = self.take(id);
        let res = self.apply_to_node_inner(&mut node, op, lex);
        self.put(id, node);
        res
    }

    fn apply_to_node_inner(
        &mut self,
        node: &mut Node<'a>,
        op: &Op<'a>,
        mut lex: Lexer<'a>,
    ) -> Result<()> {
        match node {
            Node::Nop(bytes) => {
                let bytes = *bytes;
                let bar = crate::update::bar::make_bar(op, lex, bytes)?;
                *node = Node::Bar(Box::new(bar));
                Ok(())
            }
            Node::Bar(_) => self.bar_branch(node, op, lex),
            Node::Route(_) => self.route_apply(node, op, lex),
            Node::Array(_) => {
                let Node::Array(mut arr) = mem::replace(node, Node::Taken) else {
                    return Err(corrupt());
                };
                let res = self.array_descend(&mut arr, op, &mut lex);
                *node = Node::Array(arr);
                res
            }
            Node::Map(_) => {
                let Node::Map(mut map) = mem::replace(node, Node::Taken) else {
                    return Err(corrupt());
                };
                let res = self.map_descend(&mut map, op, &mut lex);
                *node = Node::Map(map);
                res
            }
            // a path running into an already-rewritten leaf
            Node::Scalar(_) => Err(op.intersected()),
            Node::Taken => Err(corrupt()),
        }
    }

    // --- arrays ---

    fn array_descend(
        &mut self,
        arr: &mut ArrayNode<'a>,
        op: &Op<'a>,
        lex: &mut Lexer<'a>,
    ) -> Result<()> {
        let Token::Num(i) = lex.next_token()? else {
            return Err(op.no_such_field());
        };
        if lex.peek()? == Token::End {
            return self.array_terminal(arr, op, i);
        }
        if i >= arr.count {
            return Err(op.no_such_field());
        }
        let (cid, _) = self.array_extract(arr, i)?;
        self.apply_to_node(cid, op, *lex)
    }

    /// Handle an operation whose final token addresses position `i` of `arr`.
    pub(crate) fn array_terminal(
        &mut self,
        arr: &mut ArrayNode<'a>,
        op: &Op<'a>,
        i: u32,
    ) -> Result<()> {
        match op.code {
            OpCode::Insert => {
                if i > arr.count {
                    return Err(op.no_such_field());
                }
                let Arg::Value(v) = &op.arg else {
                    return Err(corrupt());
                };
                let cid = self.add(Node::Scalar(NewVal::Raw(*v)));
                self.array_insert(arr, i, cid)
            }
            OpCode::Delete => {
                if i >= arr.count {
                    return Err(op.no_such_field());
                }
                let Arg::Delete(cnt) = &op.arg else {
                    return Err(corrupt());
                };
                let cnt = (*cnt).min(arr.count - i);
                self.array_delete(arr, op, i, cnt)
            }
            OpCode::Set if i == arr.count => {
                // one-past-end set inserts
                let Arg::Value(v) = &op.arg else {
                    return Err(corrupt());
                };
                let cid = self.add(Node::Scalar(NewVal::Raw(*v)));
                self.array_insert(arr, i, cid)
            }
            _ => {
                if i >= arr.count {
                    return Err(op.no_such_field());
                }
                let (cid, existed) = self.array_extract(arr, i)?;
                if existed {
                    return Err(op.double_update());
                }
                let bytes = match &self.nodes[cid] {
                    Node::Nop(b) => *b,
                    _ => return Err(corrupt()),
                };
                let new = compute_scalar_new(op, bytes)?;
                self.nodes[cid] = Node::Scalar(new);
                Ok(())
            }
        }
    }

    /// Ensure a rope boundary exactly before `index` and return the item
    /// position where `index` starts. `index == count` is the one-past-end
    /// boundary.
    fn array_seek(&mut self, arr: &mut ArrayNode<'a>, index: u32) -> Result<usize> {
        let mut acc = 0u32;
        let mut i = 0usize;
        while i < arr.items.len() {
            let span = match &arr.items[i] {
                Item::Slice { count, .. } => *count,
                Item::Field(_) => 1,
            };
            if index < acc + span {
                let skip = index - acc;
                if skip == 0 {
                    return Ok(i);
                }
                let Item::Slice { bytes, count } = arr.items[i] else {
                    return Err(corrupt());
                };
                let mut c = Cursor::new(bytes);
                let pre = c.skip_values(skip)?;
                let rest = &bytes[pre.len()..];
                arr.items[i] = Item::Slice {
                    bytes: pre,
                    count: skip,
                };
                arr.items.insert(
                    i + 1,
                    Item::Slice {
                        bytes: rest,
                        count: count - skip,
                    },
                );
                return Ok(i + 1);
            }
            acc += span;
            i += 1;
        }
        if index == acc {
            Ok(arr.items.len())
        } else {
            Err(corrupt())
        }
    }

    /// Turn field `index` into its own child node. The flag says whether the
    /// field had already been touched by an earlier operation.
    pub(crate) fn array_extract(
        &mut self,
        arr: &mut ArrayNode<'a>,
        index: u32,
    ) -> Result<(NodeId, bool)> {
        let i = self.array_seek(arr, index)?;
        match arr.items[i] {
            Item::Field(id) => Ok((id, true)),
            Item::Slice { bytes, count } => {
                let mut c = Cursor::new(bytes);
                let fb = c.skip_value()?;
                let rest = &bytes[fb.len()..];
                let id = self.add(Node::Nop(fb));
                arr.items[i] = Item::Field(id);
                if count > 1 {
                    arr.items.insert(
                        i + 1,
                        Item::Slice {
                            bytes: rest,
                            count: count - 1,
                        },
                    );
                }
                Ok((id, false))
            }
        }
    }

    pub(crate) fn array_insert(
        &mut self,
        arr: &mut ArrayNode<'a>,
        index: u32,
        child: NodeId,
    ) -> Result<()> {
        let i = self.array_seek(arr, index)?;
        arr.items.insert(i, Item::Field(child));
        arr.count += 1;
        Ok(())
    }

    pub(crate) fn array_delete(
        &mut self,
        arr: &mut ArrayNode<'a>,
        op: &Op<'a>,
        index: u32,
        cnt: u32,
    ) -> Result<()> {
        let i = self.array_seek(arr, index)?;
        let mut remaining = cnt;
        while remaining > 0 {
            let Some(item) = arr.items.get(i) else {
                return Err(corrupt());
            };
            match *item {
                Item::Field(_) => return Err(op.double_update()),
                Item::Slice { bytes, count } => {
                    if count <= remaining {
                        arr.items.remove(i);
                        remaining -= count;
                    } else {
                        let mut c = Cursor::new(bytes);
                        let cut = c.skip_values(remaining)?;
                        arr.items[i] = Item::Slice {
                            bytes: &bytes[cut.len()..],
                            count: count - remaining,
                        };
                        remaining = 0;
                    }
                }
            }
        }
        arr.count -= cnt;
        Ok(())
    }

    // --- maps ---

    pub(crate) fn map_find(&self, map: &MapNode<'a>, key: &str) -> Result<Option<MapEntry<'a>>> {
        for e in map.entries() {
            let e = e?;
            if e.key == Some(key) {
                return Ok(Some(e));
            }
        }
        Ok(None)
    }

    fn map_descend(
        &mut self,
        map: &mut MapNode<'a>,
        op: &Op<'a>,
        lex: &mut Lexer<'a>,
    ) -> Result<()> {
        let Token::Str(key) = lex.next_token()? else {
            return Err(op.no_such_field());
        };
        if lex.peek()? == Token::End {
            return self.map_terminal(map, op, key);
        }
        if let Some(&(_, cid)) = map.appended.iter().find(|(k, _)| *k == key) {
            return self.apply_to_node(cid, op, *lex);
        }
        let Some(e) = self.map_find(map, key)? else {
            return Err(op.no_such_field());
        };
        match map.touch_index(e.off) {
            Some(t) => match map.touched[t].kind {
                TouchKind::Replace(cid) => self.apply_to_node(cid, op, *lex),
                TouchKind::Delete => Err(op.no_such_field()),
            },
            None => {
                let cid = self.add(Node::Nop(e.val_bytes));
                map.touched.push(MapTouch {
                    off: e.off,
                    key_bytes: e.key_bytes,
                    val_bytes: e.val_bytes,
                    kind: TouchKind::Replace(cid),
                });
                self.apply_to_node(cid, op, *lex)
            }
        }
    }

    /// Handle an operation whose final token addresses `key` of `map`.
    pub(crate) fn map_terminal(
        &mut self,
        map: &mut MapNode<'a>,
        op: &Op<'a>,
        key: &'a str,
    ) -> Result<()> {
        let appended = map.appended.iter().any(|(k, _)| *k == key);
        match op.code {
            OpCode::Insert => {
                if appended {
                    return Err(Error::Duplicate(format!("key '{key}' already exists")));
                }
                if let Some(e) = self.map_find(map, key)? {
                    match map.touch_index(e.off).map(|t| map.touched[t].kind) {
                        Some(TouchKind::Delete) => {}
                        _ => {
                            return Err(Error::Duplicate(format!("key '{key}' already exists")))
                        }
                    }
                }
                let Arg::Value(v) = &op.arg else {
                    return Err(corrupt());
                };
                let cid = self.add(Node::Scalar(NewVal::Raw(*v)));
                self.map_insert(map, key, cid)
            }
            OpCode::Delete => {
                let Arg::Delete(cnt) = &op.arg else {
                    return Err(corrupt());
                };
                if *cnt != 1 {
                    return Err(Error::IllegalParams(
                        "can delete only 1 field from a map in one operation".into(),
                    ));
                }
                if appended {
                    return Err(op.double_update());
                }
                let Some(e) = self.map_find(map, key)? else {
                    return Err(op.no_such_field());
                };
                match map.touch_index(e.off).map(|t| map.touched[t].kind) {
                    Some(TouchKind::Replace(_)) => Err(op.double_update()),
                    Some(TouchKind::Delete) => Err(op.no_such_field()),
                    None => {
                        map.touched.push(MapTouch {
                            off: e.off,
                            key_bytes: e.key_bytes,
                            val_bytes: e.val_bytes,
                            kind: TouchKind::Delete,
                        });
                        map.new_count -= 1;
                        Ok(())
                    }
                }
            }
            OpCode::Set => {
                if appended {
                    return Err(op.double_update());
                }
                let Arg::Value(v) = &op.arg else {
                    return Err(corrupt());
                };
                if let Some(e) = self.map_find(map, key)? {
                    match map.touch_index(e.off).map(|t| map.touched[t].kind) {
                        Some(TouchKind::Replace(_)) => return Err(op.double_update()),
                        Some(TouchKind::Delete) => {}
                        None => {
                            let cid = self.add(Node::Scalar(NewVal::Raw(*v)));
                            map.touched.push(MapTouch {
                                off: e.off,
                                key_bytes: e.key_bytes,
                                val_bytes: e.val_bytes,
                                kind: TouchKind::Replace(cid),
                            });
                            return Ok(());
                        }
                    }
                }
                // absent key: set inserts
                let cid = self.add(Node::Scalar(NewVal::Raw(*v)));
                self.map_insert(map, key, cid)
            }
            _ => {
                if appended {
                    return Err(op.double_update());
                }
                let Some(e) = self.map_find(map, key)? else {
                    return Err(op.no_such_field());
                };
                match map.touch_index(e.off).map(|t| map.touched[t].kind) {
                    Some(TouchKind::Replace(_)) => Err(op.double_update()),
                    Some(TouchKind::Delete) => Err(op.no_such_field()),
                    None => {
                        let new = compute_scalar_new(op, e.val_bytes)?;
                        let cid = self.add(Node::Scalar(new));
                        map.touched.push(MapTouch {
                            off: e.off,
                            key_bytes: e.key_bytes,
                            val_bytes: e.val_bytes,
                            kind: TouchKind::Replace(cid),
                        });
                        Ok(())
                    }
                }
            }
        }
    }

    pub(crate) fn map_insert(
        &mut self,
        map: &mut MapNode<'a>,
        key: &'a str,
        child: NodeId,
    ) -> Result<()> {
        map.appended.push((key, child));
        map.new_count += 1;
        Ok(())
    }

    // --- size & store ---

    pub(crate) fn size(&self, id: NodeId) -> usize {
        match &self.nodes[id] {
            Node::Nop(b) => b.len(),
            Node::Scalar(v) => v.size(),
            Node::Array(a) => {
                let mut n = container_header_size(a.count);
                for item in &a.items {
                    n += match item {
                        Item::Slice { bytes, .. } => bytes.len(),
                        Item::Field(c) => self.size(*c),
                    };
                }
                n
            }
            Node::Map(m) => {
                let mut n = container_header_size(m.new_count) + m.body.len();
                for t in &m.touched {
                    match t.kind {
                        TouchKind::Delete => n -= t.key_bytes.len() + t.val_bytes.len(),
                        TouchKind::Replace(c) => {
                            n -= t.val_bytes.len();
                            n += self.size(c);
                        }
                    }
                }
                for (k, c) in &m.appended {
                    n += str_header_size(k.len()) + k.len() + self.size(*c);
                }
                n
            }
            Node::Bar(b) => b.size(),
            Node::Route(r) => {
                r.hop_range.start + (r.bytes.len() - r.hop_range.end) + self.size(r.hop)
            }
            Node::Taken => 0,
        }
    }

    pub(crate) fn write(&self, id: NodeId, w: &mut Writer<'_>) -> Result<()> {
        match &self.nodes[id] {
            Node::Nop(b) => w.write_raw(b),
            Node::Scalar(v) => v.write(w),
            Node::Array(a) => {
                w.write_array_header(a.count)?;
                for item in &a.items {
                    match item {
                        Item::Slice { bytes, .. } => w.write_raw(bytes)?,
                        Item::Field(c) => self.write(*c, w)?,
                    }
                }
                Ok(())
            }
            Node::Map(m) => {
                w.write_map_header(m.new_count)?;
                for e in m.entries() {
                    let e = e?;
                    match m.touch_index(e.off).map(|t| m.touched[t].kind) {
                        Some(TouchKind::Delete) => {}
                        Some(TouchKind::Replace(c)) => {
                            w.write_raw(e.key_bytes)?;
                            self.write(c, w)?;
                        }
                        None => {
                            w.write_raw(e.key_bytes)?;
                            w.write_raw(e.val_bytes)?;
                        }
                    }
                }
                for (k, c) in &m.appended {
                    w.write_str_header(k.len())?;
                    w.write_raw(k.as_bytes())?;
                    self.write(*c, w)?;
                }
                Ok(())
            }
            Node::Bar(b) => b.write(w),
            Node::Route(r) => {
                w.write_raw(&r.bytes[..r.hop_range.start])?;
                self.write(r.hop, w)?;
                w.write_raw(&r.bytes[r.hop_range.end..])
            }
            Node::Taken => Err(corrupt()),
        }
    }
}
