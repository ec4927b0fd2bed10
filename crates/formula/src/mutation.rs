//! Tree rewrites expressed as `(match, replace)` pairs over
//! [`Node::replace_nodes`].
//!
//! Contracts:
//! - a mutation never sees the root node (wrap expressions in `Formula`)
//! - mutations run bottom-up: a node is offered after its children were rewritten
//! - `parent_stack` holds the ancestors of the offered node, root first

use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

use crate::extract::NodeExtract;
use crate::inspect::{is_aggregate_function, is_lookup_function};
use crate::node::{LodKind, Node, NodeType, WindowGroupingKind};
use crate::shortcuts as n;

/// Single rewrite rule.
pub trait FormulaMutation {
    /// Stable rule name used in logs.
    fn name(&self) -> &str;
    fn match_node(&self, node: &Node, parent_stack: &[Node]) -> bool;
    fn make_replacement(&self, old: &Node, parent_stack: &[Node]) -> Node;
}

/// Apply each mutation in turn over the whole tree.
pub fn apply_mutations(tree: &Node, mutations: &[Box<dyn FormulaMutation>]) -> Node {
    let mut tree = tree.clone();
    for mutation in mutations {
        let new_tree = tree.replace_nodes(
            |node, stack| mutation.match_node(node, stack),
            |node, stack| mutation.make_replacement(node, stack),
        );
        if !new_tree.ptr_eq(&tree) {
            debug!(mutation = mutation.name(), "formula mutated");
        }
        tree = new_tree;
    }
    tree
}

fn extract_set(nodes: &[Node]) -> HashSet<NodeExtract> {
    nodes.iter().filter_map(|n| n.extract().cloned()).collect()
}

fn contains_extract(set: &HashSet<NodeExtract>, node: &Node) -> bool {
    node.extract().is_some_and(|e| set.contains(e))
}

// -----------------------------
// Syntax normalization
// -----------------------------

/// `(expr)` -> `expr`
#[derive(Debug, Default)]
pub struct IgnoreParenthesisMutation;

impl FormulaMutation for IgnoreParenthesisMutation {
    fn name(&self) -> &str {
        "ignore_parenthesis"
    }

    fn match_node(&self, node: &Node, _parent_stack: &[Node]) -> bool {
        node.is(NodeType::Parenthesized)
    }

    fn make_replacement(&self, old: &Node, _parent_stack: &[Node]) -> Node {
        old.children()[0].clone()
    }
}

/// `IF/CASE` blocks -> `if(...)` / `case(...)` calls.
#[derive(Debug, Default)]
pub struct ConvertBlocksToFunctionsMutation;

impl FormulaMutation for ConvertBlocksToFunctionsMutation {
    fn name(&self) -> &str {
        "convert_blocks_to_functions"
    }

    fn match_node(&self, node: &Node, _parent_stack: &[Node]) -> bool {
        matches!(node.node_type(), NodeType::IfBlock | NodeType::CaseBlock)
    }

    fn make_replacement(&self, old: &Node, _parent_stack: &[Node]) -> Node {
        let mut args = Vec::new();
        for child in old.children() {
            match child.node_type() {
                NodeType::IfPart | NodeType::WhenPart => args.extend(child.children().iter().cloned()),
                _ => args.push(child.clone()),
            }
        }
        let name = if old.is(NodeType::IfBlock) { "if" } else { "case" };
        n::func(name, args).with_meta(old.meta().clone())
    }
}

/// Window calls without an explicit ORDER BY inherit the request ordering.
#[derive(Debug)]
pub struct DefaultWindowOrderingMutation {
    order_by: Vec<Node>,
}

impl DefaultWindowOrderingMutation {
    /// `order_by` items are expressions, optionally wrapped in
    /// `OrderAscending` / `OrderDescending`.
    pub fn new(order_by: Vec<Node>) -> Self {
        Self { order_by }
    }
}

impl FormulaMutation for DefaultWindowOrderingMutation {
    fn name(&self) -> &str {
        "default_window_ordering"
    }

    fn match_node(&self, node: &Node, _parent_stack: &[Node]) -> bool {
        !self.order_by.is_empty()
            && node.is(NodeType::WindowFuncCall)
            && node.ordering().is_some_and(|o| o.children().is_empty())
    }

    fn make_replacement(&self, old: &Node, _parent_stack: &[Node]) -> Node {
        match old.ordering_pos() {
            Some(pos) => old.with_child(pos, n::ordering(self.order_by.clone())),
            None => old.clone(),
        }
    }
}

/// Adds the lookup dimension of `ago`/`at_date` to their BFB clause.
#[derive(Debug, Default)]
pub struct LookupDefaultBfbMutation;

impl FormulaMutation for LookupDefaultBfbMutation {
    fn name(&self) -> &str {
        "lookup_default_bfb"
    }

    fn match_node(&self, node: &Node, _parent_stack: &[Node]) -> bool {
        if !is_lookup_function(node) {
            return false;
        }
        let dim_name = node.func_args().get(1).and_then(|d| d.field_name());
        match (dim_name, node.bfb_names()) {
            (Some(name), Some(names)) => !names.contains(name),
            _ => false,
        }
    }

    fn make_replacement(&self, old: &Node, _parent_stack: &[Node]) -> Node {
        let (Some(name), Some(pos)) = (
            old.func_args().get(1).and_then(|d| d.field_name()),
            old.bfb_pos(),
        ) else {
            return old.clone();
        };
        let mut names = old.bfb_names().cloned().unwrap_or_default();
        names.insert(name.to_string());
        old.with_child(pos, n::bfb_set(names))
    }
}

/// Renames entries of BEFORE FILTER BY clauses (titles -> field ids).
#[derive(Debug)]
pub struct RemapBfbMutation {
    names: HashMap<String, String>,
}

impl RemapBfbMutation {
    pub fn new(names: HashMap<String, String>) -> Self {
        Self { names }
    }
}

impl FormulaMutation for RemapBfbMutation {
    fn name(&self) -> &str {
        "remap_bfb"
    }

    fn match_node(&self, node: &Node, _parent_stack: &[Node]) -> bool {
        node.is(NodeType::BeforeFilterBy)
            && node
                .bfb_names()
                .is_some_and(|names| names.iter().any(|name| self.names.contains_key(name)))
    }

    fn make_replacement(&self, old: &Node, _parent_stack: &[Node]) -> Node {
        let names: BTreeSet<String> = old
            .bfb_names()
            .map(|names| {
                names
                    .iter()
                    .map(|name| self.names.get(name).unwrap_or(name).clone())
                    .collect()
            })
            .unwrap_or_default();
        n::bfb_set(names)
    }
}

/// Renames field references.
#[derive(Debug)]
pub struct FieldRemapMutation {
    names: HashMap<String, String>,
}

impl FieldRemapMutation {
    pub fn new(names: HashMap<String, String>) -> Self {
        Self { names }
    }
}

impl FormulaMutation for FieldRemapMutation {
    fn name(&self) -> &str {
        "field_remap"
    }

    fn match_node(&self, node: &Node, _parent_stack: &[Node]) -> bool {
        node.field_name()
            .is_some_and(|name| self.names.contains_key(name))
    }

    fn make_replacement(&self, old: &Node, _parent_stack: &[Node]) -> Node {
        match old.field_name().and_then(|name| self.names.get(name)) {
            Some(new_name) => n::field(new_name).with_meta(old.meta().clone()),
            None => old.clone(),
        }
    }
}

/// Replaces every occurrence of a subtree, matched structurally.
#[derive(Debug)]
pub struct ReplacementMutation {
    original: NodeExtract,
    replacement: Node,
}

impl ReplacementMutation {
    /// `None` when `original` has no extract and so can never match.
    pub fn new(original: &Node, replacement: Node) -> Option<Self> {
        Some(Self {
            original: original.extract()?.clone(),
            replacement,
        })
    }
}

impl FormulaMutation for ReplacementMutation {
    fn name(&self) -> &str {
        "replacement"
    }

    fn match_node(&self, node: &Node, _parent_stack: &[Node]) -> bool {
        node.extract() == Some(&self.original)
    }

    fn make_replacement(&self, _old: &Node, _parent_stack: &[Node]) -> Node {
        self.replacement.clone()
    }
}

// -----------------------------
// Aggregation
// -----------------------------

const IDEMPOTENT_AGGREGATIONS: &[&str] = &["sum", "min", "max", "avg", "any"];

fn is_plain_call(node: &Node) -> bool {
    node.lod().and_then(|l| l.lod_kind()) == Some(LodKind::Default)
        && node.bfb_names().is_some_and(|names| names.is_empty())
        && node.ignore_dimensions().is_some_and(|i| i.children().is_empty())
}

/// `SUM(SUM(x))` -> `SUM(x)` when both calls work at the same level.
#[derive(Debug, Default)]
pub struct CollapseNestedAggregationMutation;

impl FormulaMutation for CollapseNestedAggregationMutation {
    fn name(&self) -> &str {
        "collapse_nested_aggregation"
    }

    fn match_node(&self, node: &Node, _parent_stack: &[Node]) -> bool {
        let Some(name) = node.func_name() else {
            return false;
        };
        if !is_aggregate_function(node) || !IDEMPOTENT_AGGREGATIONS.contains(&name) {
            return false;
        }
        match node.func_args() {
            [inner] => {
                is_aggregate_function(inner)
                    && inner.func_name() == Some(name)
                    && is_plain_call(node)
                    && is_plain_call(inner)
            }
            _ => false,
        }
    }

    fn make_replacement(&self, old: &Node, _parent_stack: &[Node]) -> Node {
        old.func_args()[0].clone()
    }
}

// -----------------------------
// Window functions
// -----------------------------

/// `AMONG dims` -> `WITHIN (global dims - dims)`.
///
/// Without a request the global dimensions are the AMONG dimensions
/// collected from the formula itself.
#[derive(Debug)]
pub struct AmongToWithinGroupingMutation {
    dimensions: Vec<Node>,
}

impl AmongToWithinGroupingMutation {
    pub fn new(dimensions: Vec<Node>) -> Self {
        Self { dimensions }
    }
}

impl FormulaMutation for AmongToWithinGroupingMutation {
    fn name(&self) -> &str {
        "among_to_within"
    }

    fn match_node(&self, node: &Node, _parent_stack: &[Node]) -> bool {
        node.is(NodeType::WindowFuncCall)
            && node.grouping().and_then(|g| g.grouping_kind()) == Some(WindowGroupingKind::Among)
    }

    fn make_replacement(&self, old: &Node, _parent_stack: &[Node]) -> Node {
        let (Some(grouping), Some(pos)) = (old.grouping(), old.grouping_pos()) else {
            return old.clone();
        };
        let among = extract_set(grouping.children());
        let within_dims = self
            .dimensions
            .iter()
            .filter(|d| !contains_extract(&among, d))
            .cloned()
            .collect();
        old.with_child(pos, n::within(within_dims))
    }
}

/// Drops WITHIN dimensions that are not request dimensions.
#[derive(Debug)]
pub struct IgnoreExtraWithinGroupingMutation {
    dimensions: HashSet<NodeExtract>,
}

impl IgnoreExtraWithinGroupingMutation {
    pub fn new(dimensions: &[Node]) -> Self {
        Self {
            dimensions: extract_set(dimensions),
        }
    }
}

impl FormulaMutation for IgnoreExtraWithinGroupingMutation {
    fn name(&self) -> &str {
        "ignore_extra_within"
    }

    fn match_node(&self, node: &Node, _parent_stack: &[Node]) -> bool {
        let Some(grouping) = node.grouping() else {
            return false;
        };
        grouping.grouping_kind() == Some(WindowGroupingKind::Within)
            && grouping
                .children()
                .iter()
                .any(|d| !contains_extract(&self.dimensions, d))
    }

    fn make_replacement(&self, old: &Node, _parent_stack: &[Node]) -> Node {
        let (Some(grouping), Some(pos)) = (old.grouping(), old.grouping_pos()) else {
            return old.clone();
        };
        let dims = grouping
            .children()
            .iter()
            .filter(|d| contains_extract(&self.dimensions, d))
            .cloned()
            .collect();
        old.with_child(pos, n::within(dims))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(m: impl FormulaMutation + 'static) -> Vec<Box<dyn FormulaMutation>> {
        vec![Box::new(m)]
    }

    #[test]
    fn blocks_become_calls_and_parens_vanish() {
        let tree = n::formula(n::if_block(
            vec![(n::paren(n::field("c")), n::lit_int(1))],
            n::lit_int(0),
        ));
        let out = apply_mutations(
            &tree,
            &[
                Box::new(IgnoreParenthesisMutation) as Box<dyn FormulaMutation>,
                Box::new(ConvertBlocksToFunctionsMutation),
            ],
        );
        assert_eq!(
            out,
            n::formula(n::func("if", vec![n::field("c"), n::lit_int(1), n::lit_int(0)]))
        );
    }

    #[test]
    fn default_ordering_only_fills_empty_orderings() {
        let tree = n::formula(n::binary(
            "+",
            n::window("rsum", vec![n::func("sum", vec![n::field("x")])]),
            n::window_full("rsum", vec![n::field("y")], vec![n::field("z")], n::total(), &[]),
        ));
        let out = apply_mutations(
            &tree,
            &boxed(DefaultWindowOrderingMutation::new(vec![n::desc(n::field("d"))])),
        );
        let expr = out.expr();
        assert_eq!(
            expr.children()[0].ordering().map(|o| o.children().to_vec()),
            Some(vec![n::desc(n::field("d"))])
        );
        assert_eq!(
            expr.children()[1].ordering().map(|o| o.children().to_vec()),
            Some(vec![n::field("z")])
        );
    }

    #[test]
    fn lookup_bfb_and_remap() {
        let tree = n::formula(n::func(
            "ago",
            vec![n::func("sum", vec![n::field("Sales")]), n::field("Date")],
        ));
        let out = apply_mutations(&tree, &boxed(LookupDefaultBfbMutation));
        let names: Vec<_> = out.expr().bfb_names().expect("bfb").iter().cloned().collect();
        assert_eq!(names, vec!["Date".to_string()]);

        let remap = RemapBfbMutation::new(HashMap::from([("Date".to_string(), "f_date".to_string())]));
        let out = apply_mutations(&out, &boxed(remap));
        assert!(out.expr().bfb_names().expect("bfb").contains("f_date"));
    }

    #[test]
    fn nested_same_aggregation_collapses() {
        let tree = n::formula(n::func("sum", vec![n::func("sum", vec![n::field("x")])]));
        let out = apply_mutations(&tree, &boxed(CollapseNestedAggregationMutation));
        assert_eq!(out, n::formula(n::func("sum", vec![n::field("x")])));

        let counted = n::formula(n::func("count", vec![n::func("count", vec![n::field("x")])]));
        let same = apply_mutations(&counted, &boxed(CollapseNestedAggregationMutation));
        assert!(same.ptr_eq(&counted));

        let with_lod = n::formula(n::func(
            "sum",
            vec![n::func_full("sum", vec![n::field("x")], n::fixed(vec![]), vec![], &[])],
        ));
        let same = apply_mutations(&with_lod, &boxed(CollapseNestedAggregationMutation));
        assert!(same.ptr_eq(&with_lod));
    }

    #[test]
    fn among_becomes_within_of_remaining_dims() {
        let dims = vec![n::field("city"), n::field("date"), n::field("cat")];
        let tree = n::formula(n::window_full(
            "rsum",
            vec![n::func("sum", vec![n::field("x")])],
            vec![],
            n::among(vec![n::field("date")]),
            &[],
        ));
        let out = apply_mutations(&tree, &boxed(AmongToWithinGroupingMutation::new(dims)));
        let grouping = out.expr().grouping().expect("grouping");
        assert_eq!(grouping.grouping_kind(), Some(WindowGroupingKind::Within));
        assert_eq!(grouping.children().to_vec(), vec![n::field("city"), n::field("cat")]);
    }

    #[test]
    fn among_alone_in_global_dims_leaves_empty_within() {
        let tree = n::formula(n::window_full(
            "rsum",
            vec![n::func("sum", vec![n::field("x")])],
            vec![],
            n::among(vec![n::field("date")]),
            &[],
        ));
        let out = apply_mutations(&tree, &boxed(AmongToWithinGroupingMutation::new(vec![n::field("date")])));
        let grouping = out.expr().grouping().expect("grouping");
        assert_eq!(grouping.grouping_kind(), Some(WindowGroupingKind::Within));
        assert!(grouping.children().is_empty());
    }

    #[test]
    fn extra_within_dimensions_are_dropped() {
        let tree = n::formula(n::window_full(
            "rsum",
            vec![n::func("sum", vec![n::field("x")])],
            vec![],
            n::within(vec![n::field("city"), n::field("other")]),
            &[],
        ));
        let out = apply_mutations(
            &tree,
            &boxed(IgnoreExtraWithinGroupingMutation::new(&[n::field("city")])),
        );
        assert_eq!(
            out.expr().grouping().expect("grouping").children().to_vec(),
            vec![n::field("city")]
        );
    }

    #[test]
    fn field_remap_and_replacement() {
        let tree = n::formula(n::binary("+", n::field("a"), n::field("b")));
        let remap = FieldRemapMutation::new(HashMap::from([("a".to_string(), "c".to_string())]));
        let out = apply_mutations(&tree, &boxed(remap));
        assert_eq!(out, n::formula(n::binary("+", n::field("c"), n::field("b"))));

        let replace = ReplacementMutation::new(&n::field("b"), n::lit_int(3)).expect("extract");
        let out = apply_mutations(&out, &boxed(replace));
        assert_eq!(out, n::formula(n::binary("+", n::field("c"), n::lit_int(3))));
    }
}
