// Copyright 2026 Loam Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Lazy point-updates and path branching.
//!
//! The first path operation into a field does not materialize anything: the
//! path is walked once over the raw bytes, the touched point is located, and
//! the whole field becomes a single [`BarNode`]. Only when a second operation
//! enters the same field does the common prefix get materialized: the two
//! paths are compared token by token, the container at the divergence point
//! becomes a real array/map node holding both updates, and everything above
//! it collapses into a [`RouteNode`] keeping the shared prefix unparsed.
//!
//! A structural bar (`!`/`#`) whose path ends at the divergence container
//! cannot be carried over as a bar (it resizes the container itself), so it
//! is re-applied against the freshly decoded container. Every other bar is
//! rebased under its new parent with its remainder path.

use core::mem;
use core::ops::Range;

use loam_error::{Error, Result};
use rmp::Marker;

use crate::codec::Cursor;
use crate::path::{Lexer, Token};
use crate::update::op::{Arg, Op, OpCode};
use crate::update::tree::{
    compute_scalar_new, corrupt, ArrayNode, BarKind, BarNode, Item, MapNode, MapTouch, NewVal,
    Node, NodeId, ParentMeta, RouteNode, TouchKind, Tree,
};

/// Byte offset of `child` within `parent`; both must come from one buffer.
fn slice_offset(parent: &[u8], child: &[u8]) -> usize {
    child.as_ptr() as usize - parent.as_ptr() as usize
}

fn nop_bytes<'a>(tree: &Tree<'a>, id: NodeId) -> Result<&'a [u8]> {
    match &tree.nodes[id] {
        Node::Nop(b) => Ok(*b),
        _ => Err(corrupt()),
    }
}

/// Walk `op`'s residual path over the raw field bytes and capture the touched
/// point, producing the bar in one pass.
pub(crate) fn make_bar<'a>(op: &Op<'a>, lex: Lexer<'a>, bytes: &'a [u8]) -> Result<BarNode<'a>> {
    let path = lex.remainder();
    let base = lex.base();
    let mut lex = lex;
    let mut c = Cursor::new(bytes);
    loop {
        let tok = lex.next_token()?;
        let terminal = lex.peek()? == Token::End;
        let header_start = c.pos();
        match tok {
            Token::Num(i) => {
                let count = c.read_array_header().map_err(|_| op.no_such_field())?;
                let header = header_start..c.pos();
                if terminal {
                    let kind = terminal_array(op, &mut c, i, count, header)?;
                    return Ok(bar(op, bytes, path, base, kind));
                }
                if i >= count {
                    return Err(op.no_such_field());
                }
                c.skip_values(i)?;
            }
            Token::Str(key) => {
                let count = c.read_map_header().map_err(|_| op.no_such_field())?;
                let header = header_start..c.pos();
                if terminal {
                    let kind = terminal_map(op, &mut c, key, count, header)?;
                    return Ok(bar(op, bytes, path, base, kind));
                }
                let mut found = false;
                for _ in 0..count {
                    let kb = c.skip_value()?;
                    if Cursor::new(kb).read_str().ok() == Some(key) {
                        found = true;
                        break;
                    }
                    c.skip_value()?;
                }
                if !found {
                    return Err(op.no_such_field());
                }
            }
            Token::Any => {
                return Err(Error::UnsupportedUpdate("wildcard in path".into()));
            }
            Token::End => return Err(corrupt()),
        }
    }
}

fn bar<'a>(
    op: &Op<'a>,
    bytes: &'a [u8],
    path: &'a str,
    base: u32,
    kind: BarKind<'a>,
) -> BarNode<'a> {
    BarNode {
        bytes,
        path,
        base,
        code: op.code,
        arg: op.arg.clone(),
        label: op.label,
        kind,
    }
}

fn terminal_array<'a>(
    op: &Op<'a>,
    c: &mut Cursor<'a>,
    i: u32,
    count: u32,
    header: Range<usize>,
) -> Result<BarKind<'a>> {
    let parent = ParentMeta {
        header,
        count,
        is_map: false,
    };
    match op.code {
        OpCode::Insert => {
            if i > count {
                return Err(op.no_such_field());
            }
            c.skip_values(i)?;
            let Arg::Value(v) = &op.arg else {
                return Err(corrupt());
            };
            Ok(BarKind::Insert {
                at: c.pos(),
                key: None,
                new: NewVal::Raw(*v),
                parent,
            })
        }
        OpCode::Delete => {
            if i >= count {
                return Err(op.no_such_field());
            }
            let Arg::Delete(cnt) = &op.arg else {
                return Err(corrupt());
            };
            let cnt = (*cnt).min(count - i);
            c.skip_values(i)?;
            let start = c.pos();
            c.skip_values(cnt)?;
            Ok(BarKind::Delete {
                cut: start..c.pos(),
                removed: cnt,
                parent,
            })
        }
        OpCode::Set if i == count => {
            c.skip_values(count)?;
            let Arg::Value(v) = &op.arg else {
                return Err(corrupt());
            };
            Ok(BarKind::Insert {
                at: c.pos(),
                key: None,
                new: NewVal::Raw(*v),
                parent,
            })
        }
        _ => {
            if i >= count {
                return Err(op.no_such_field());
            }
            c.skip_values(i)?;
            let start = c.pos();
            let vb = c.skip_value()?;
            let new = compute_scalar_new(op, vb)?;
            Ok(BarKind::Point {
                point: start..c.pos(),
                new,
            })
        }
    }
}

fn terminal_map<'a>(
    op: &Op<'a>,
    c: &mut Cursor<'a>,
    key: &'a str,
    count: u32,
    header: Range<usize>,
) -> Result<BarKind<'a>> {
    let parent = ParentMeta {
        header,
        count,
        is_map: true,
    };
    // one scan finds the key and the end of the entry region at once
    let mut found: Option<(usize, Range<usize>, &'a [u8])> = None;
    for _ in 0..count {
        let entry_start = c.pos();
        let kb = c.skip_value()?;
        let matched = Cursor::new(kb).read_str().ok() == Some(key);
        let vstart = c.pos();
        let vb = c.skip_value()?;
        if matched && found.is_none() {
            found = Some((entry_start, vstart..c.pos(), vb));
        }
    }
    let map_end = c.pos();

    match op.code {
        OpCode::Insert => {
            if found.is_some() {
                return Err(Error::Duplicate(format!("key '{key}' already exists")));
            }
            let Arg::Value(v) = &op.arg else {
                return Err(corrupt());
            };
            Ok(BarKind::Insert {
                at: map_end,
                key: Some(key),
                new: NewVal::Raw(*v),
                parent,
            })
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
            let Some((entry_start, val, _)) = found else {
                return Err(op.no_such_field());
            };
            Ok(BarKind::Delete {
                cut: entry_start..val.end,
                removed: 1,
                parent,
            })
        }
        OpCode::Set => {
            let Arg::Value(v) = &op.arg else {
                return Err(corrupt());
            };
            match found {
                Some((_, val, _)) => Ok(BarKind::Point {
                    point: val,
                    new: NewVal::Raw(*v),
                }),
                None => Ok(BarKind::Insert {
                    at: map_end,
                    key: Some(key),
                    new: NewVal::Raw(*v),
                    parent,
                }),
            }
        }
        _ => {
            let Some((_, val, vb)) = found else {
                return Err(op.no_such_field());
            };
            let new = compute_scalar_new(op, vb)?;
            Ok(BarKind::Point { point: val, new })
        }
    }
}

/// Extent of the value reached by walking every token of `lex` over `bytes`.
fn descend<'a>(bytes: &'a [u8], mut lex: Lexer<'a>) -> Result<Range<usize>> {
    let mut c = Cursor::new(bytes);
    loop {
        match lex.next_token()? {
            Token::End => {
                let start = c.pos();
                c.skip_value()?;
                return Ok(start..c.pos());
            }
            Token::Num(i) => {
                let count = c.read_array_header()?;
                if i >= count {
                    return Err(corrupt());
                }
                c.skip_values(i)?;
            }
            Token::Str(key) => {
                let count = c.read_map_header()?;
                let mut found = false;
                for _ in 0..count {
                    let kb = c.skip_value()?;
                    if Cursor::new(kb).read_str().ok() == Some(key) {
                        found = true;
                        break;
                    }
                    c.skip_value()?;
                }
                if !found {
                    return Err(corrupt());
                }
            }
            Token::Any => return Err(Error::UnsupportedUpdate("wildcard in path".into())),
        }
    }
}

// === impl Tree: branching ===

impl<'a> Tree<'a> {
    fn parse_container(&mut self, op: &Op<'a>, bytes: &'a [u8]) -> Result<NodeId> {
        let mut c = Cursor::new(bytes);
        match c.peek_marker()? {
            Marker::FixArray(_) | Marker::Array16 | Marker::Array32 => {
                let count = c.read_array_header()?;
                let body = &bytes[c.pos()..];
                let items = if count > 0 {
                    vec![Item::Slice { bytes: body, count }]
                } else {
                    Vec::new()
                };
                Ok(self.add(Node::Array(ArrayNode { items, count })))
            }
            Marker::FixMap(_) | Marker::Map16 | Marker::Map32 => {
                let count = c.read_map_header()?;
                Ok(self.add(Node::Map(MapNode {
                    body: &bytes[c.pos()..],
                    count,
                    new_count: count,
                    touched: Vec::new(),
                    appended: Vec::new(),
                })))
            }
            _ => Err(op.no_such_field()),
        }
    }

    /// A second operation entered a field held as a bar: find the divergence
    /// of the two paths, materialize the container there, and re-root both
    /// updates under it.
    pub(crate) fn bar_branch(
        &mut self,
        node: &mut Node<'a>,
        op: &Op<'a>,
        lex: Lexer<'a>,
    ) -> Result<()> {
        let Node::Bar(boxed) = mem::replace(node, Node::Taken) else {
            return Err(corrupt());
        };
        let bar = *boxed;
        match self.bar_branch_inner(&bar, op, lex) {
            Ok(new_node) => {
                *node = new_node;
                Ok(())
            }
            Err(e) => {
                *node = Node::Bar(Box::new(bar));
                Err(e)
            }
        }
    }

    fn bar_branch_inner(
        &mut self,
        bar: &BarNode<'a>,
        op: &Op<'a>,
        lex: Lexer<'a>,
    ) -> Result<Node<'a>> {
        let mut la = Lexer::new(bar.path, bar.base);
        let mut lb = lex;
        loop {
            let mut la2 = la;
            let ta = la2.next_token()?;
            let mut lb2 = lb;
            let tb = lb2.next_token()?;
            if ta == Token::End || tb == Token::End {
                return Err(op.intersected());
            }
            if ta != tb {
                break;
            }
            // a structural bar cannot be copied past its final token: it
            // resizes the container that token selects into. The shared
            // prefix ends at that container; it is decoded and the insert or
            // delete replayed against it, and the incoming path then sees
            // the shifted layout.
            if bar.code.is_structural() && la2.peek()? == Token::End {
                break;
            }
            la = la2;
            lb = lb2;
        }

        let prefix_len = la.offset();
        let cont_range = descend(bar.bytes, Lexer::new(&bar.path[..prefix_len], bar.base))?;
        let cont_bytes = &bar.bytes[cont_range.clone()];
        let cont_id = self.parse_container(op, cont_bytes)?;

        // the bar's operation came first in the batch; replay it first
        self.reinsert_bar(cont_id, bar, la)?;
        self.apply_to_node(cont_id, op, lb)?;

        if prefix_len == 0 {
            Ok(self.take(cont_id))
        } else {
            Ok(Node::Route(RouteNode {
                bytes: bar.bytes,
                prefix: &bar.path[..prefix_len],
                base: bar.base,
                hop: cont_id,
                hop_range: cont_range,
            }))
        }
    }

    fn reinsert_bar(&mut self, cont_id: NodeId, bar: &BarNode<'a>, mut la: Lexer<'a>) -> Result<()> {
        let ta = la.next_token()?;
        let deeper = la.peek()? != Token::End;
        let mut cont = self.take(cont_id);
        let res = self.reinsert_bar_inner(&mut cont, bar, ta, deeper, la);
        self.put(cont_id, cont);
        res
    }

    fn reinsert_bar_inner(
        &mut self,
        cont: &mut Node<'a>,
        bar: &BarNode<'a>,
        ta: Token<'a>,
        deeper: bool,
        la: Lexer<'a>,
    ) -> Result<()> {
        let bar_op = Op {
            code: bar.code,
            field_no: 0,
            path: None,
            arg: bar.arg.clone(),
            label: bar.label,
            base: bar.base,
        };
        match cont {
            Node::Array(arr) => {
                let Token::Num(i) = ta else {
                    return Err(corrupt());
                };
                if deeper {
                    if i >= arr.count {
                        return Err(corrupt());
                    }
                    let (cid, _) = self.array_extract(arr, i)?;
                    let bytes = nop_bytes(self, cid)?;
                    let sub = make_bar(&bar_op, Lexer::new(la.remainder(), bar.base), bytes)?;
                    self.nodes[cid] = Node::Bar(Box::new(sub));
                    return Ok(());
                }
                match &bar.kind {
                    BarKind::Point { new, .. } => {
                        let (cid, existed) = self.array_extract(arr, i)?;
                        if existed {
                            return Err(corrupt());
                        }
                        self.nodes[cid] = Node::Scalar(new.clone());
                        Ok(())
                    }
                    BarKind::Insert { new, .. } => {
                        let cid = self.add(Node::Scalar(new.clone()));
                        self.array_insert(arr, i, cid)
                    }
                    BarKind::Delete { removed, .. } => {
                        self.array_delete(arr, &bar_op, i, *removed)
                    }
                }
            }
            Node::Map(map) => {
                let Token::Str(key) = ta else {
                    return Err(corrupt());
                };
                if deeper {
                    let Some(e) = self.map_find(map, key)? else {
                        return Err(corrupt());
                    };
                    let cid = self.add(Node::Nop(e.val_bytes));
                    map.touched.push(MapTouch {
                        off: e.off,
                        key_bytes: e.key_bytes,
                        val_bytes: e.val_bytes,
                        kind: TouchKind::Replace(cid),
                    });
                    let sub =
                        make_bar(&bar_op, Lexer::new(la.remainder(), bar.base), e.val_bytes)?;
                    self.nodes[cid] = Node::Bar(Box::new(sub));
                    return Ok(());
                }
                match &bar.kind {
                    BarKind::Point { new, .. } => {
                        let Some(e) = self.map_find(map, key)? else {
                            return Err(corrupt());
                        };
                        let cid = self.add(Node::Scalar(new.clone()));
                        map.touched.push(MapTouch {
                            off: e.off,
                            key_bytes: e.key_bytes,
                            val_bytes: e.val_bytes,
                            kind: TouchKind::Replace(cid),
                        });
                        Ok(())
                    }
                    BarKind::Insert { new, .. } => {
                        let cid = self.add(Node::Scalar(new.clone()));
                        self.map_insert(map, key, cid)
                    }
                    BarKind::Delete { .. } => {
                        let Some(e) = self.map_find(map, key)? else {
                            return Err(corrupt());
                        };
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
            _ => Err(corrupt()),
        }
    }

    /// A third (or later) operation entered a routed field: either it follows
    /// the whole prefix into the hop, or the route splits at the divergence.
    pub(crate) fn route_apply(
        &mut self,
        node: &mut Node<'a>,
        op: &Op<'a>,
        lex: Lexer<'a>,
    ) -> Result<()> {
        let Node::Route(route) = mem::replace(node, Node::Taken) else {
            return Err(corrupt());
        };
        match self.route_apply_inner(&route, op, lex) {
            Ok(Some(new_node)) => {
                *node = new_node;
                Ok(())
            }
            Ok(None) => {
                *node = Node::Route(route);
                Ok(())
            }
            Err(e) => {
                *node = Node::Route(route);
                Err(e)
            }
        }
    }

    fn route_apply_inner(
        &mut self,
        route: &RouteNode<'a>,
        op: &Op<'a>,
        lex: Lexer<'a>,
    ) -> Result<Option<Node<'a>>> {
        let mut lr = Lexer::new(route.prefix, route.base);
        let mut lb = lex;
        loop {
            let mut lr2 = lr;
            let tr = lr2.next_token()?;
            if tr == Token::End {
                self.apply_to_node(route.hop, op, lb)?;
                return Ok(None);
            }
            let mut lb2 = lb;
            let tb = lb2.next_token()?;
            if tb == Token::End {
                return Err(op.intersected());
            }
            if tr != tb {
                break;
            }
            lr = lr2;
            lb = lb2;
        }

        let split_len = lr.offset();
        let cont_range = descend(route.bytes, Lexer::new(&route.prefix[..split_len], route.base))?;
        let cont_bytes = &route.bytes[cont_range.clone()];
        let cont_id = self.parse_container(op, cont_bytes)?;

        let mut lr_next = lr;
        let tr = lr_next.next_token()?;
        let moved = self.reroute_hop(cont_id, route, tr, lr_next.remainder())?;

        if let Err(e) = self.apply_to_node(cont_id, op, lb) {
            // undo the hop move so the restored route stays reachable
            if let Some(cid) = moved {
                self.nodes[route.hop] = mem::replace(&mut self.nodes[cid], Node::Taken);
            }
            return Err(e);
        }

        if split_len == 0 {
            Ok(Some(self.take(cont_id)))
        } else {
            Ok(Some(Node::Route(RouteNode {
                bytes: route.bytes,
                prefix: &route.prefix[..split_len],
                base: route.base,
                hop: cont_id,
                hop_range: cont_range,
            })))
        }
    }

    /// Re-root the old hop under the freshly materialized container. Returns
    /// the child slot the hop node was moved into, when it was moved.
    fn reroute_hop(
        &mut self,
        cont_id: NodeId,
        route: &RouteNode<'a>,
        tr: Token<'a>,
        sub_prefix: &'a str,
    ) -> Result<Option<NodeId>> {
        let mut cont = self.take(cont_id);
        let res = self.reroute_hop_inner(&mut cont, route, tr, sub_prefix);
        self.put(cont_id, cont);
        res
    }

    fn reroute_hop_inner(
        &mut self,
        cont: &mut Node<'a>,
        route: &RouteNode<'a>,
        tr: Token<'a>,
        sub_prefix: &'a str,
    ) -> Result<Option<NodeId>> {
        let (cid, child_bytes) = match cont {
            Node::Array(arr) => {
                let Token::Num(i) = tr else {
                    return Err(corrupt());
                };
                if i >= arr.count {
                    return Err(corrupt());
                }
                let (cid, _) = self.array_extract(arr, i)?;
                let bytes = nop_bytes(self, cid)?;
                (cid, bytes)
            }
            Node::Map(map) => {
                let Token::Str(key) = tr else {
                    return Err(corrupt());
                };
                let Some(e) = self.map_find(map, key)? else {
                    return Err(corrupt());
                };
                let cid = self.add(Node::Nop(e.val_bytes));
                map.touched.push(MapTouch {
                    off: e.off,
                    key_bytes: e.key_bytes,
                    val_bytes: e.val_bytes,
                    kind: TouchKind::Replace(cid),
                });
                (cid, e.val_bytes)
            }
            _ => return Err(corrupt()),
        };

        if sub_prefix.is_empty() {
            // the child's extent is exactly the old hop
            self.nodes[cid] = mem::replace(&mut self.nodes[route.hop], Node::Taken);
            Ok(Some(cid))
        } else {
            let child_off = slice_offset(route.bytes, child_bytes);
            let hr = route.hop_range.clone();
            self.nodes[cid] = Node::Route(RouteNode {
                bytes: child_bytes,
                prefix: sub_prefix,
                base: route.base,
                hop: route.hop,
                hop_range: (hr.start - child_off)..(hr.end - child_off),
            });
            Ok(None)
        }
    }
}
