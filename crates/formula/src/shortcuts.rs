//! Terse node builders.
//!
//! Intended to be imported as `use lodq_formula::shortcuts as n;`.

use lodq_common::FormulaErrorCode;
use std::collections::BTreeSet;

use crate::node::{
    ForkJoinType, LiteralValue, LodKind, Node, NodeKind, WindowGroupingKind,
};

pub fn literal(value: LiteralValue) -> Node {
    Node::new(NodeKind::Literal(value), vec![])
}

pub fn lit_null() -> Node {
    literal(LiteralValue::Null)
}

pub fn lit_int(v: i64) -> Node {
    literal(LiteralValue::Integer(v))
}

pub fn lit_float(v: f64) -> Node {
    literal(LiteralValue::Float(v))
}

pub fn lit_bool(v: bool) -> Node {
    literal(LiteralValue::Boolean(v))
}

pub fn lit_str(v: &str) -> Node {
    literal(LiteralValue::String(v.to_string()))
}

pub fn lit_date(v: &str) -> Node {
    literal(LiteralValue::Date(v.to_string()))
}

pub fn lit_datetime(v: &str) -> Node {
    literal(LiteralValue::Datetime(v.to_string()))
}

pub fn field(name: &str) -> Node {
    Node::new(
        NodeKind::Field {
            name: name.to_string(),
        },
        vec![],
    )
}

pub fn formula(expr: Node) -> Node {
    Node::new(NodeKind::Formula, vec![expr])
}

pub fn paren(expr: Node) -> Node {
    Node::new(NodeKind::Parenthesized, vec![expr])
}

pub fn unary(op: &str, expr: Node) -> Node {
    Node::new(NodeKind::Unary { op: op.to_string() }, vec![expr])
}

pub fn binary(op: &str, left: Node, right: Node) -> Node {
    Node::new(NodeKind::Binary { op: op.to_string() }, vec![left, right])
}

pub fn ternary(op: &str, first: Node, second: Node, third: Node) -> Node {
    Node::new(
        NodeKind::Ternary { op: op.to_string() },
        vec![first, second, third],
    )
}

/// Left-folded `and` of the given conditions; `None` when empty.
pub fn and_all(conditions: Vec<Node>) -> Option<Node> {
    conditions
        .into_iter()
        .reduce(|acc, cond| binary("and", acc, cond))
}

pub fn default_lod() -> Node {
    Node::new(NodeKind::Lod(LodKind::Default), vec![])
}

pub fn inherited_lod() -> Node {
    Node::new(NodeKind::Lod(LodKind::Inherited), vec![])
}

pub fn fixed(dims: Vec<Node>) -> Node {
    Node::new(NodeKind::Lod(LodKind::Fixed), dims)
}

pub fn include(dims: Vec<Node>) -> Node {
    Node::new(NodeKind::Lod(LodKind::Include), dims)
}

pub fn exclude(dims: Vec<Node>) -> Node {
    Node::new(NodeKind::Lod(LodKind::Exclude), dims)
}

pub fn ignore_dims(dims: Vec<Node>) -> Node {
    Node::new(NodeKind::IgnoreDimensions, dims)
}

pub fn bfb(names: &[&str]) -> Node {
    bfb_set(names.iter().map(|s| s.to_string()).collect())
}

pub fn bfb_set(field_names: BTreeSet<String>) -> Node {
    Node::new(NodeKind::BeforeFilterBy { field_names }, vec![])
}

/// Aggregate/scalar call without LOD, IGNORE DIMENSIONS or BFB clauses.
pub fn func(name: &str, args: Vec<Node>) -> Node {
    func_with(name, args, default_lod(), ignore_dims(vec![]), bfb(&[]))
}

pub fn func_full(name: &str, args: Vec<Node>, lod: Node, ignore: Vec<Node>, bfb_names: &[&str]) -> Node {
    func_with(name, args, lod, ignore_dims(ignore), bfb(bfb_names))
}

pub fn func_with(name: &str, mut args: Vec<Node>, lod: Node, ignore: Node, bfb: Node) -> Node {
    args.extend([lod, ignore, bfb]);
    Node::new(
        NodeKind::FuncCall {
            name: name.to_string(),
        },
        args,
    )
}

pub fn ordering(items: Vec<Node>) -> Node {
    Node::new(NodeKind::Ordering, items)
}

pub fn asc(expr: Node) -> Node {
    Node::new(NodeKind::OrderAscending, vec![expr])
}

pub fn desc(expr: Node) -> Node {
    Node::new(NodeKind::OrderDescending, vec![expr])
}

pub fn total() -> Node {
    Node::new(NodeKind::WindowGrouping(WindowGroupingKind::Total), vec![])
}

pub fn within(dims: Vec<Node>) -> Node {
    Node::new(NodeKind::WindowGrouping(WindowGroupingKind::Within), dims)
}

pub fn among(dims: Vec<Node>) -> Node {
    Node::new(NodeKind::WindowGrouping(WindowGroupingKind::Among), dims)
}

/// Window call with TOTAL grouping, no ordering and no extra clauses.
pub fn window(name: &str, args: Vec<Node>) -> Node {
    window_full(name, args, vec![], total(), &[])
}

pub fn window_full(
    name: &str,
    args: Vec<Node>,
    order_by: Vec<Node>,
    grouping: Node,
    bfb_names: &[&str],
) -> Node {
    window_with(
        name,
        args,
        ordering(order_by),
        grouping,
        default_lod(),
        ignore_dims(vec![]),
        bfb(bfb_names),
    )
}

pub fn window_with(
    name: &str,
    mut args: Vec<Node>,
    ordering: Node,
    grouping: Node,
    lod: Node,
    ignore: Node,
    bfb: Node,
) -> Node {
    args.extend([ordering, grouping, lod, ignore, bfb]);
    Node::new(
        NodeKind::WindowFuncCall {
            name: name.to_string(),
        },
        args,
    )
}

pub fn if_block(parts: Vec<(Node, Node)>, else_expr: Node) -> Node {
    let mut children: Vec<Node> = parts
        .into_iter()
        .map(|(cond, expr)| Node::new(NodeKind::IfPart, vec![cond, expr]))
        .collect();
    children.push(else_expr);
    Node::new(NodeKind::IfBlock, children)
}

pub fn case_block(case_expr: Node, whens: Vec<(Node, Node)>, else_expr: Node) -> Node {
    let mut children = vec![case_expr];
    children.extend(
        whens
            .into_iter()
            .map(|(value, expr)| Node::new(NodeKind::WhenPart, vec![value, expr])),
    );
    children.push(else_expr);
    Node::new(NodeKind::CaseBlock, children)
}

pub fn self_eq(expr: Node) -> Node {
    Node::new(NodeKind::SelfEqualityJoinCondition, vec![expr])
}

pub fn binary_join(expr: Node, fork_expr: Node) -> Node {
    Node::new(NodeKind::BinaryJoinCondition, vec![expr, fork_expr])
}

/// `QueryForkJoining` over the given join conditions.
pub fn joining(conditions: Vec<Node>) -> Node {
    Node::new(NodeKind::QueryForkJoining, conditions)
}

pub fn bfb_mutation(original: Node, replacement: Node) -> Node {
    Node::new(NodeKind::BfbFilterMutationSpec, vec![original, replacement])
}

pub fn query_fork(
    join_type: ForkJoinType,
    conditions: Vec<Node>,
    result_expr: Node,
    lod: Node,
    bfb: Node,
    mutations: Vec<Node>,
) -> Node {
    Node::new(
        NodeKind::QueryFork { join_type },
        vec![
            joining(conditions),
            result_expr,
            lod,
            bfb,
            Node::new(NodeKind::BfbFilterMutations, mutations),
        ],
    )
}

pub fn error(message: &str, code: FormulaErrorCode) -> Node {
    Node::new(
        NodeKind::Error {
            message: message.to_string(),
            code,
        },
        vec![],
    )
}
