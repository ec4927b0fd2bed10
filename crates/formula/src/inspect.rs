//! Read-only questions about formula subtrees.

use std::collections::HashSet;

use crate::extract::NodeExtract;
use crate::index::NodeHierarchyIndex;
use crate::node::{LodKind, Node, NodeType};
use crate::tag::LevelTag;

/// Functions that aggregate rows when called as plain `FuncCall`s.
pub const AGGREGATE_FUNCTIONS: &[&str] = &[
    "sum",
    "avg",
    "min",
    "max",
    "count",
    "countd",
    "countd_approx",
    "any",
    "sum_if",
    "avg_if",
    "count_if",
    "countd_if",
    "median",
    "quantile",
    "stdev",
    "stdevp",
    "var",
    "varp",
    "arg_min",
    "arg_max",
    "all_concat",
    "top_concat",
];

/// Functions that may appear as `WindowFuncCall`s.
pub const WINDOW_FUNCTIONS: &[&str] = &[
    "sum",
    "avg",
    "min",
    "max",
    "count",
    "rsum",
    "ravg",
    "rmin",
    "rmax",
    "rcount",
    "msum",
    "mavg",
    "mmin",
    "mmax",
    "mcount",
    "rank",
    "rank_dense",
    "rank_unique",
    "rank_percentile",
    "lag",
    "first",
    "last",
    "nth",
];

/// Lookup functions rewritten into query forks.
pub const LOOKUP_FUNCTIONS: &[&str] = &["ago", "at_date"];

pub fn is_aggregate_function(node: &Node) -> bool {
    node.is(NodeType::FuncCall)
        && node
            .func_name()
            .is_some_and(|name| AGGREGATE_FUNCTIONS.contains(&name))
}

pub fn is_lookup_function(node: &Node) -> bool {
    node.is(NodeType::FuncCall)
        && node
            .func_name()
            .is_some_and(|name| LOOKUP_FUNCTIONS.contains(&name))
}

/// Parts of larger constructs that cannot stand alone as expressions.
fn is_autonomous(node: &Node) -> bool {
    !matches!(
        node.node_type(),
        NodeType::Lod
            | NodeType::WindowGrouping
            | NodeType::Ordering
            | NodeType::OrderAscending
            | NodeType::OrderDescending
            | NodeType::BeforeFilterBy
            | NodeType::IgnoreDimensions
            | NodeType::IfPart
            | NodeType::WhenPart
            | NodeType::QueryForkJoining
            | NodeType::SelfEqualityJoinCondition
            | NodeType::BinaryJoinCondition
            | NodeType::BfbFilterMutations
            | NodeType::BfbFilterMutationSpec
    )
}

/// Logical children of `node` with indices relative to `prefix`.
///
/// Non-autonomous children (LOD specifiers, IF parts, orderings...) are
/// looked through, so their own autonomous children are yielded instead.
pub fn enumerate_autonomous_children(
    node: &Node,
    prefix: &NodeHierarchyIndex,
) -> Vec<(NodeHierarchyIndex, Node)> {
    let mut out = Vec::new();
    for (pos, child) in node.children().iter().enumerate() {
        let index = prefix.child(pos);
        if is_autonomous(child) {
            out.push((index, child.clone()));
        } else {
            out.extend(enumerate_autonomous_children(child, &index));
        }
    }
    out
}

pub fn autonomous_children(node: &Node) -> Vec<Node> {
    enumerate_autonomous_children(node, &NodeHierarchyIndex::root())
        .into_iter()
        .map(|(_, child)| child)
        .collect()
}

/// Literals, possibly parenthesized.
pub fn is_constant_expression(node: &Node) -> bool {
    match node.node_type() {
        NodeType::Literal => true,
        NodeType::Parenthesized => is_constant_expression(&node.children()[0]),
        _ => false,
    }
}

pub fn is_aggregate_expression(node: &Node) -> bool {
    is_aggregate_function(node) || autonomous_children(node).iter().any(is_aggregate_expression)
}

pub fn is_window_expression(node: &Node) -> bool {
    node.is(NodeType::WindowFuncCall) || autonomous_children(node).iter().any(is_window_expression)
}

pub fn is_query_fork_expression(node: &Node) -> bool {
    node.is(NodeType::QueryFork)
        || autonomous_children(node)
            .iter()
            .any(is_query_fork_expression)
}

/// Whether every field in `node` is covered by one of `allowed`.
pub fn is_bound_only_to(node: &Node, allowed: &HashSet<NodeExtract>) -> bool {
    if node.extract().is_some_and(|e| allowed.contains(e)) {
        return true;
    }
    if node.is(NodeType::Field) {
        return false;
    }
    autonomous_children(node)
        .iter()
        .all(|child| is_bound_only_to(child, allowed))
}

/// Distinct field names referenced anywhere in `node`, in first-seen order.
pub fn used_fields(node: &Node) -> Vec<String> {
    let mut seen = HashSet::new();
    node.visit_node_type(NodeType::Field)
        .filter_map(|f| f.field_name())
        .filter(|name| seen.insert(name.to_string()))
        .map(str::to_string)
        .collect()
}

pub fn collect_tags(node: &Node) -> Vec<LevelTag> {
    let mut out: Vec<LevelTag> = Vec::new();
    for (_, sub_node) in node.enumerate(None) {
        if let Some(tag) = sub_node.tag() {
            if !out.contains(tag) {
                out.push(tag.clone());
            }
        }
    }
    out
}

/// Dimension expressions of a LOD specifier with an explicit list.
pub fn lod_dimensions(node: &Node) -> Option<(LodKind, &[Node])> {
    let lod = node.lod()?;
    let kind = lod.lod_kind()?;
    Some((kind, lod.children()))
}

/// Whether the call carries a FIXED/INCLUDE/EXCLUDE clause.
pub fn has_non_default_lod(node: &Node) -> bool {
    lod_dimensions(node).is_some_and(|(kind, _)| kind.has_dimensions())
}

/// Maximum number of nested window calls below (and including) `node` whose
/// BFB names equal `bfb_names`. Descent stops at calls and forks with a
/// different BFB set.
pub fn window_wrapping_level(node: &Node, bfb_names: &std::collections::BTreeSet<String>) -> i32 {
    let stops = matches!(node.node_type(), NodeType::FuncCall | NodeType::WindowFuncCall | NodeType::QueryFork)
        && node.bfb_names().is_some_and(|names| names != bfb_names);
    if stops {
        return 0;
    }
    let own = i32::from(node.is(NodeType::WindowFuncCall));
    let below = node
        .children()
        .iter()
        .map(|child| window_wrapping_level(child, bfb_names))
        .max()
        .unwrap_or(0);
    own + below
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shortcuts as n;

    #[test]
    fn aggregate_detection_looks_through_blocks() {
        let agg = n::func("sum", vec![n::field("x")]);
        assert!(is_aggregate_expression(&agg));
        assert!(!is_aggregate_expression(&n::field("x")));
        let block = n::if_block(vec![(n::lit_bool(true), agg.clone())], n::lit_int(0));
        assert!(is_aggregate_expression(&block));
        let win = n::window("rsum", vec![agg]);
        assert!(is_window_expression(&win));
        assert!(is_aggregate_expression(&win));
        assert!(!is_window_expression(&n::func("sum", vec![n::field("x")])));
    }

    #[test]
    fn autonomous_children_skip_specifiers() {
        let call = n::func_full(
            "sum",
            vec![n::field("x")],
            n::fixed(vec![n::field("a")]),
            vec![],
            &["f"],
        );
        let kids = enumerate_autonomous_children(&call, &NodeHierarchyIndex::root());
        let names: Vec<_> = kids.iter().filter_map(|(_, n)| n.field_name()).collect();
        assert_eq!(names, vec!["x", "a"]);
        assert_eq!(kids[1].0, NodeHierarchyIndex::new(vec![1, 0]));
    }

    #[test]
    fn constants_and_bindings() {
        assert!(is_constant_expression(&n::paren(n::lit_int(1))));
        assert!(!is_constant_expression(&n::binary("+", n::lit_int(1), n::lit_int(2))));
        let dims: HashSet<_> = [n::field("city")]
            .iter()
            .filter_map(|d| d.extract().cloned())
            .collect();
        assert!(is_bound_only_to(&n::func("upper", vec![n::field("city")]), &dims));
        assert!(!is_bound_only_to(&n::field("region"), &dims));
        assert_eq!(
            used_fields(&n::binary("+", n::field("a"), n::field("a"))),
            vec!["a".to_string()]
        );
    }

    #[test]
    fn window_wrapping_level_counts_matching_bfb() {
        let inner = n::window("rsum", vec![n::func("sum", vec![n::field("x")])]);
        let outer = n::window("rank", vec![inner.clone()]);
        let empty = std::collections::BTreeSet::new();
        assert_eq!(window_wrapping_level(&outer, &empty), 2);
        let other_bfb = n::window_full("rank", vec![inner], vec![], n::total(), &["d"]);
        assert_eq!(window_wrapping_level(&other_bfb, &empty), 0);
    }
}
