//! Conversion of LOD aggregations, lookup functions and window functions
//! into `QueryFork` nodes.
//!
//! A fork describes a sub-query evaluated at its own dimension set and joined
//! back to the enclosing query. Dimensions are resolved against the request
//! GROUP BY (top level) or against the dimensions of the enclosing
//! aggregation.

use lodq_common::FormulaErrorCode;
use std::collections::HashSet;

use crate::extract::NodeExtract;
use crate::inspect::{
    is_aggregate_expression, is_aggregate_function, is_lookup_function, lod_dimensions,
    used_fields,
};
use crate::mutation::FormulaMutation;
use crate::node::{ForkJoinType, LiteralValue, LodKind, Node, NodeType};
use crate::shortcuts as n;

fn extract_set(nodes: &[Node]) -> HashSet<NodeExtract> {
    nodes.iter().filter_map(|n| n.extract().cloned()).collect()
}

fn contains(set: &HashSet<NodeExtract>, node: &Node) -> bool {
    node.extract().is_some_and(|e| set.contains(e))
}

fn dedup_dims(dims: impl IntoIterator<Item = Node>) -> Vec<Node> {
    let mut seen = HashSet::new();
    dims.into_iter()
        .filter(|d| d.extract().map_or(true, |e| seen.insert(e.clone())))
        .collect()
}

/// Dimensions an aggregation with the given LOD works at.
pub fn resolve_dimensions(kind: LodKind, lod_dims: &[Node], parent: &[Node]) -> Vec<Node> {
    match kind {
        LodKind::Default | LodKind::Inherited => parent.to_vec(),
        LodKind::Fixed => dedup_dims(lod_dims.iter().cloned()),
        LodKind::Include => dedup_dims(parent.iter().chain(lod_dims.iter()).cloned()),
        LodKind::Exclude => {
            let excluded = extract_set(lod_dims);
            parent
                .iter()
                .filter(|d| !contains(&excluded, d))
                .cloned()
                .collect()
        }
    }
}

/// Dimensions of the innermost aggregation enclosing a node, given its
/// ancestors (root first) and the request GROUP BY.
pub fn parent_dimensions(global_dims: &[Node], parent_stack: &[Node]) -> Vec<Node> {
    let mut dims = global_dims.to_vec();
    for ancestor in parent_stack {
        if !is_aggregate_function(ancestor) {
            continue;
        }
        if let Some((kind, lod_dims)) = lod_dimensions(ancestor) {
            dims = resolve_dimensions(kind, lod_dims, &dims);
        }
    }
    dims
}

fn same_dimension_set(a: &[Node], b: &[Node]) -> bool {
    extract_set(a) == extract_set(b)
}

/// Copy of an aggregate call without LOD, IGNORE DIMENSIONS and BFB clauses.
pub fn strip_call_clauses(node: &Node) -> Node {
    let (Some(lod_pos), Some(_)) = (node.lod_pos(), node.ignore_dimensions()) else {
        return node.clone();
    };
    // lod, ignore_dimensions, before_filter_by are adjacent.
    let mut children = node.children().to_vec();
    children[lod_pos] = n::default_lod();
    children[lod_pos + 1] = n::ignore_dims(vec![]);
    children[lod_pos + 2] = n::bfb(&[]);
    node.with_children(children)
}

/// FIXED/INCLUDE/EXCLUDE aggregations -> `QueryFork`.
///
/// An aggregation whose resolved dimensions equal the enclosing ones and
/// that has no BFB clause is not forked; its LOD clause is dropped instead.
#[derive(Debug)]
pub struct LodToQueryForkMutation {
    global_dims: Vec<Node>,
}

impl LodToQueryForkMutation {
    pub fn new(global_dims: Vec<Node>) -> Self {
        Self { global_dims }
    }
}

impl FormulaMutation for LodToQueryForkMutation {
    fn name(&self) -> &str {
        "lod_to_query_fork"
    }

    fn match_node(&self, node: &Node, _parent_stack: &[Node]) -> bool {
        is_aggregate_function(node)
            && lod_dimensions(node).is_some_and(|(kind, _)| kind.has_dimensions())
    }

    fn make_replacement(&self, old: &Node, parent_stack: &[Node]) -> Node {
        let Some((kind, lod_dims)) = lod_dimensions(old) else {
            return old.clone();
        };
        if let Some(dim) = lod_dims.iter().find(|d| is_aggregate_expression(d)) {
            return n::error(
                &format!(
                    "LOD dimension {} cannot be an aggregation",
                    crate::explain::to_text(dim)
                ),
                FormulaErrorCode::AggregationValidation,
            )
            .with_meta(old.meta().clone());
        }
        let parent = parent_dimensions(&self.global_dims, parent_stack);
        let dims = resolve_dimensions(kind, lod_dims, &parent);
        let bfb = old.before_filter_by().cloned().unwrap_or_else(|| n::bfb(&[]));
        let has_bfb = bfb.bfb_names().is_some_and(|names| !names.is_empty());
        let result_expr = strip_call_clauses(old);
        if !has_bfb && same_dimension_set(&dims, &parent) {
            return result_expr;
        }

        let own = extract_set(&dims);
        let ignored = extract_set(old.ignore_dimensions().map(|i| i.children()).unwrap_or(&[]));
        let conditions = parent
            .iter()
            .filter(|d| contains(&own, d) && !contains(&ignored, d))
            .cloned()
            .map(n::self_eq)
            .collect();
        n::query_fork(
            ForkJoinType::Left,
            conditions,
            result_expr,
            n::fixed(dims),
            bfb,
            vec![],
        )
        .with_meta(old.meta().clone())
    }
}

// -----------------------------
// Window functions
// -----------------------------

fn inherited_fork(old: &Node, global_dims: &[Node]) -> Node {
    let bfb = old.before_filter_by().cloned().unwrap_or_else(|| n::bfb(&[]));
    n::query_fork(
        ForkJoinType::Left,
        global_dims.iter().cloned().map(n::self_eq).collect(),
        old.clone(),
        n::inherited_lod(),
        bfb,
        vec![],
    )
    .with_meta(old.meta().clone())
}

/// Top-level aggregations -> inherited `QueryFork`.
///
/// Applied alongside [`WindowToQueryForkMutation`] so that plain aggregations
/// land in sub-queries apart from the window functions. Aggregations inside
/// window calls, other aggregations or forks are left alone.
#[derive(Debug)]
pub struct AggregationToQueryForkMutation {
    global_dims: Vec<Node>,
}

impl AggregationToQueryForkMutation {
    pub fn new(global_dims: Vec<Node>) -> Self {
        Self { global_dims }
    }
}

impl FormulaMutation for AggregationToQueryForkMutation {
    fn name(&self) -> &str {
        "aggregation_to_query_fork"
    }

    fn match_node(&self, node: &Node, parent_stack: &[Node]) -> bool {
        is_aggregate_function(node)
            && !parent_stack.iter().any(|ancestor| {
                is_aggregate_function(ancestor)
                    || ancestor.is(NodeType::WindowFuncCall)
                    || ancestor.is(NodeType::QueryFork)
            })
    }

    fn make_replacement(&self, old: &Node, _parent_stack: &[Node]) -> Node {
        inherited_fork(old, &self.global_dims)
    }
}

/// Outermost window calls -> inherited `QueryFork` carrying the window's
/// BFB names, joined back on the request dimensions.
#[derive(Debug)]
pub struct WindowToQueryForkMutation {
    global_dims: Vec<Node>,
}

impl WindowToQueryForkMutation {
    pub fn new(global_dims: Vec<Node>) -> Self {
        Self { global_dims }
    }
}

impl FormulaMutation for WindowToQueryForkMutation {
    fn name(&self) -> &str {
        "window_to_query_fork"
    }

    fn match_node(&self, node: &Node, parent_stack: &[Node]) -> bool {
        node.is(NodeType::WindowFuncCall)
            && !parent_stack
                .iter()
                .any(|ancestor| ancestor.is(NodeType::WindowFuncCall) || ancestor.is(NodeType::QueryFork))
    }

    fn make_replacement(&self, old: &Node, _parent_stack: &[Node]) -> Node {
        inherited_fork(old, &self.global_dims)
    }
}

// -----------------------------
// Lookup functions
// -----------------------------

const MONTH_BASED_UNITS: &[&str] = &["month", "quarter", "year"];

fn lookup_error(old: &Node, message: String) -> Node {
    n::error(&message, FormulaErrorCode::LookupFunction).with_meta(old.meta().clone())
}

/// `(conditions, bfb filter mutations)` for a lookup call.
fn lookup_conditions(name: &str, args: &[Node]) -> (Vec<Node>, Vec<Node>) {
    let dim = &args[1];
    match name {
        "ago" => {
            let mut dateadd_args = vec![dim.clone()];
            dateadd_args.extend(args[2..].iter().cloned());
            let shifted = n::func("dateadd", dateadd_args);
            let mut conditions = vec![n::binary_join(dim.clone(), shifted.clone())];
            let unit = args[2..].iter().find_map(|a| match a.literal() {
                Some(LiteralValue::String(s)) => Some(s.to_lowercase()),
                _ => None,
            });
            // Month-based shifts need an extra day match to avoid duplicated dates.
            if unit.is_some_and(|u| MONTH_BASED_UNITS.contains(&u.as_str())) {
                conditions.push(n::binary_join(
                    n::func("day", vec![dim.clone()]),
                    n::func("day", vec![dim.clone()]),
                ));
            }
            (conditions, vec![n::bfb_mutation(dim.clone(), shifted)])
        }
        _ => (vec![n::binary_join(args[2].clone(), dim.clone())], vec![]),
    }
}

/// `ago(expr, dim[, unit[, n]])` and `at_date(expr, dim, value)` ->
/// `QueryFork` joined on the shifted lookup dimension.
#[derive(Debug)]
pub struct LookupToQueryForkMutation {
    global_dims: Vec<Node>,
    allow_empty_dimensions: bool,
}

impl LookupToQueryForkMutation {
    /// `allow_empty_dimensions` accepts a missing lookup dimension when the
    /// request has no dimensions at all (single formula validation).
    pub fn new(global_dims: Vec<Node>, allow_empty_dimensions: bool) -> Self {
        Self {
            global_dims,
            allow_empty_dimensions,
        }
    }
}

impl FormulaMutation for LookupToQueryForkMutation {
    fn name(&self) -> &str {
        "lookup_to_query_fork"
    }

    fn match_node(&self, node: &Node, _parent_stack: &[Node]) -> bool {
        is_lookup_function(node)
    }

    fn make_replacement(&self, old: &Node, parent_stack: &[Node]) -> Node {
        let name = old.func_name().unwrap_or_default();
        let upper = name.to_uppercase();
        let args = old.func_args();
        let arg_counts: &[usize] = if name == "ago" { &[2, 3, 4] } else { &[3] };
        if !arg_counts.contains(&args.len()) {
            return lookup_error(
                old,
                format!(
                    "Invalid number of arguments for function {upper}: {}",
                    args.len()
                ),
            );
        }
        let result_expr = args[0].clone();
        if !is_aggregate_expression(&result_expr) {
            return lookup_error(
                old,
                format!("Result expression of function {upper} is not aggregated."),
            );
        }
        let lookup_dim = &args[1];
        if is_aggregate_expression(lookup_dim) {
            return lookup_error(
                old,
                format!("The lookup dimension of function {upper} is an aggregation."),
            );
        }
        let ignored = extract_set(old.ignore_dimensions().map(|i| i.children()).unwrap_or(&[]));
        if contains(&ignored, lookup_dim) {
            return lookup_error(
                old,
                format!("Cannot ignore lookup dimension of function {upper}"),
            );
        }
        let (conditions, mutations) = lookup_conditions(name, args);
        if conditions.iter().all(|c| used_fields(c).is_empty()) {
            return lookup_error(
                old,
                format!("Cannot use a constant expression as lookup dimension of function {upper}"),
            );
        }

        let dims = parent_dimensions(&self.global_dims, parent_stack);
        let mut condition_list = Vec::new();
        let mut found_lookup_dim = false;
        for dim in &dims {
            if contains(&ignored, dim) {
                continue;
            }
            if dim == lookup_dim {
                found_lookup_dim = true;
                condition_list.extend(conditions.iter().cloned());
            } else {
                condition_list.push(n::self_eq(dim.clone()));
            }
        }
        if (!self.allow_empty_dimensions || !dims.is_empty()) && !found_lookup_dim {
            return lookup_error(
                old,
                format!(
                    "Invalid dimension for function {upper}. \
                     It must be explicitly used in the data request as a dimension."
                ),
            );
        }

        let bfb = old.before_filter_by().cloned().unwrap_or_else(|| n::bfb(&[]));
        n::query_fork(
            ForkJoinType::Left,
            condition_list,
            result_expr,
            n::inherited_lod(),
            bfb,
            mutations,
        )
        .with_meta(old.meta().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::apply_mutations;

    fn lod_fork(tree: &Node, dims: Vec<Node>) -> Node {
        apply_mutations(tree, &[Box::new(LodToQueryForkMutation::new(dims)) as Box<dyn FormulaMutation>])
    }

    fn sum_lod(lod: Node) -> Node {
        n::func_full("sum", vec![n::field("sales")], lod, vec![], &[])
    }

    #[test]
    fn fixed_lod_at_query_level_is_not_forked() {
        let tree = n::formula(sum_lod(n::fixed(vec![n::field("city")])));
        let out = lod_fork(&tree, vec![n::field("city")]);
        assert_eq!(out, n::formula(n::func("sum", vec![n::field("sales")])));
    }

    #[test]
    fn coarser_fixed_lod_forks_and_joins_on_common_dims() {
        let tree = n::formula(sum_lod(n::fixed(vec![n::field("city")])));
        let out = lod_fork(&tree, vec![n::field("city"), n::field("cat")]);
        let fork = out.expr();
        assert!(fork.is(NodeType::QueryFork));
        let (joining, result, lod, _, _) = fork.fork_parts().expect("fork");
        assert_eq!(joining.children().to_vec(), vec![n::self_eq(n::field("city"))]);
        assert_eq!(result, &n::func("sum", vec![n::field("sales")]));
        assert_eq!(lod, &n::fixed(vec![n::field("city")]));
        assert_eq!(fork.join_type(), Some(ForkJoinType::Left));
    }

    #[test]
    fn include_and_exclude_resolve_against_enclosing_aggregation() {
        // AVG(SUM(sales) INCLUDE cat) at city level.
        let tree = n::formula(n::func(
            "avg",
            vec![sum_lod(n::include(vec![n::field("cat")]))],
        ));
        let out = lod_fork(&tree, vec![n::field("city")]);
        let fork = &out.expr().func_args()[0];
        let (joining, _, lod, _, _) = fork.fork_parts().expect("fork");
        assert_eq!(lod, &n::fixed(vec![n::field("city"), n::field("cat")]));
        assert_eq!(joining.children().to_vec(), vec![n::self_eq(n::field("city"))]);

        let tree = n::formula(sum_lod(n::exclude(vec![n::field("cat")])));
        let out = lod_fork(&tree, vec![n::field("city"), n::field("cat")]);
        let (_, _, lod, _, _) = out.expr().fork_parts().expect("fork");
        assert_eq!(lod, &n::fixed(vec![n::field("city")]));
    }

    #[test]
    fn total_lod_forks_without_conditions() {
        let tree = n::formula(sum_lod(n::fixed(vec![])));
        let out = lod_fork(&tree, vec![n::field("city")]);
        let (joining, _, _, _, _) = out.expr().fork_parts().expect("fork");
        assert!(joining.children().is_empty());
    }

    #[test]
    fn ago_becomes_left_fork_with_shifted_condition() {
        let tree = n::formula(n::func_full(
            "ago",
            vec![n::func("sum", vec![n::field("sales")]), n::field("date"), n::lit_str("month")],
            n::default_lod(),
            vec![],
            &["date"],
        ));
        let out = apply_mutations(
            &tree,
            &[Box::new(LookupToQueryForkMutation::new(
                vec![n::field("city"), n::field("date")],
                false,
            )) as Box<dyn FormulaMutation>],
        );
        let (joining, result, lod, bfb, mutations) = out.expr().fork_parts().expect("fork");
        assert_eq!(result, &n::func("sum", vec![n::field("sales")]));
        assert_eq!(lod.lod_kind(), Some(LodKind::Inherited));
        assert!(bfb.bfb_names().expect("names").contains("date"));
        let shifted = n::func("dateadd", vec![n::field("date"), n::lit_str("month")]);
        assert_eq!(
            joining.children().to_vec(),
            vec![
                n::self_eq(n::field("city")),
                n::binary_join(n::field("date"), shifted.clone()),
                n::binary_join(
                    n::func("day", vec![n::field("date")]),
                    n::func("day", vec![n::field("date")])
                ),
            ]
        );
        assert_eq!(mutations.children().to_vec(), vec![n::bfb_mutation(n::field("date"), shifted)]);
    }

    #[test]
    fn lookup_errors_become_error_nodes() {
        let unaggregated = n::formula(n::func("ago", vec![n::field("sales"), n::field("date")]));
        let out = apply_mutations(
            &unaggregated,
            &[Box::new(LookupToQueryForkMutation::new(vec![n::field("date")], false))
                as Box<dyn FormulaMutation>],
        );
        assert_eq!(
            out.expr().error_info().map(|(_, code)| code),
            Some(FormulaErrorCode::LookupFunction)
        );

        let missing_dim = n::formula(n::func(
            "at_date",
            vec![n::func("sum", vec![n::field("sales")]), n::field("date"), n::lit_date("2024-01-01")],
        ));
        let out = apply_mutations(
            &missing_dim,
            &[Box::new(LookupToQueryForkMutation::new(vec![n::field("city")], false))
                as Box<dyn FormulaMutation>],
        );
        assert!(out.expr().is(NodeType::Error));

        let validation_only = apply_mutations(
            &missing_dim,
            &[Box::new(LookupToQueryForkMutation::new(vec![], true)) as Box<dyn FormulaMutation>],
        );
        assert!(validation_only.expr().is(NodeType::QueryFork));
    }

    #[test]
    fn window_becomes_inherited_fork_with_its_bfb() {
        let window = n::window_full("rsum", vec![n::func("sum", vec![n::field("sales")])], vec![], n::total(), &["city"]);
        let tree = n::formula(window.clone());
        let out = apply_mutations(
            &tree,
            &[Box::new(WindowToQueryForkMutation::new(vec![n::field("city")])) as Box<dyn FormulaMutation>],
        );
        let (joining, result, lod, bfb, _) = out.expr().fork_parts().expect("fork");
        assert_eq!(joining.children().to_vec(), vec![n::self_eq(n::field("city"))]);
        assert_eq!(result, &window);
        assert_eq!(lod.lod_kind(), Some(LodKind::Inherited));
        assert!(bfb.bfb_names().expect("names").contains("city"));
    }

    #[test]
    fn aggregations_next_to_windows_get_their_own_forks() {
        let sum = n::func("sum", vec![n::field("sales")]);
        let tree = n::formula(n::binary("+", sum.clone(), n::window("rsum", vec![sum.clone()])));
        let dims = vec![n::field("city")];
        let out = apply_mutations(
            &tree,
            &[
                Box::new(AggregationToQueryForkMutation::new(dims.clone())) as Box<dyn FormulaMutation>,
                Box::new(WindowToQueryForkMutation::new(dims)),
            ],
        );
        let [left, right] = out.expr().children() else {
            panic!("binary operands");
        };
        let (_, left_result, ..) = left.fork_parts().expect("aggregation fork");
        assert_eq!(left_result, &sum);
        let (_, right_result, ..) = right.fork_parts().expect("window fork");
        assert!(right_result.is(NodeType::WindowFuncCall));
        // The aggregation inside the window is computed by the window's sub-query.
        assert_eq!(right_result.func_args()[0], sum);
    }
}
