//! Post-compilation checks that report [`FormulaError`]s instead of failing.

use lodq_common::{FormulaError, FormulaErrorCode};
use std::collections::HashSet;

use crate::explain::to_text;
use crate::extract::NodeExtract;
use crate::inspect::{
    autonomous_children, is_aggregate_expression, is_aggregate_function, is_bound_only_to,
    is_constant_expression, is_window_expression, lod_dimensions,
};
use crate::node::{LodKind, Node, NodeType};

fn error_at(node: &Node, code: FormulaErrorCode, message: String) -> FormulaError {
    FormulaError::new(code, message).at(node.position().map(|p| p.start))
}

/// Every embedded `Error` node as a [`FormulaError`], pre-order.
pub fn collect_error_nodes(node: &Node) -> Vec<FormulaError> {
    node.visit_node_type(NodeType::Error)
        .filter_map(|err| {
            err.error_info()
                .map(|(message, code)| error_at(err, code, message.to_string()))
        })
        .collect()
}

/// Checks that aggregated and non-aggregated operands are not mixed and
/// that aggregations are not nested without a LOD clause.
#[derive(Debug, Default)]
pub struct AggregationChecker {
    dimensions: HashSet<NodeExtract>,
}

impl AggregationChecker {
    /// `dimensions` are the request GROUP BY expressions; operands bound to
    /// them may be mixed with aggregations.
    pub fn new(dimensions: &[Node]) -> Self {
        Self {
            dimensions: dimensions.iter().filter_map(|d| d.extract().cloned()).collect(),
        }
    }

    pub fn check(&self, node: &Node) -> Vec<FormulaError> {
        let mut errors = Vec::new();
        self.walk(node.expr(), false, &mut errors);
        errors
    }

    fn walk(&self, node: &Node, inside_aggregation: bool, errors: &mut Vec<FormulaError>) {
        if is_aggregate_function(node) {
            let lod = lod_dimensions(node);
            if inside_aggregation && lod.map_or(true, |(kind, _)| kind == LodKind::Default) {
                errors.push(error_at(
                    node,
                    FormulaErrorCode::AggregationValidation,
                    format!(
                        "Double aggregation is not allowed without a LOD clause: {}",
                        to_text(node)
                    ),
                ));
            }
            if let Some((_, dims)) = lod {
                for dim in dims.iter().filter(|d| is_aggregate_expression(d)) {
                    errors.push(error_at(
                        dim,
                        FormulaErrorCode::AggregationValidation,
                        format!("LOD dimension cannot be an aggregation: {}", to_text(dim)),
                    ));
                }
            }
            for arg in node.func_args() {
                self.walk(arg, true, errors);
            }
            return;
        }

        match node.node_type() {
            NodeType::WindowFuncCall => {
                for arg in node.func_args() {
                    self.walk(arg, false, errors);
                }
                return;
            }
            NodeType::QueryFork => {
                if let Some((_, result_expr, _, _, _)) = node.fork_parts() {
                    self.walk(result_expr, false, errors);
                }
                return;
            }
            _ => {}
        }

        let children = autonomous_children(node);
        if !inside_aggregation && children.iter().any(is_aggregate_expression) {
            for child in &children {
                if !is_aggregate_expression(child)
                    && !is_constant_expression(child)
                    && !is_bound_only_to(child, &self.dimensions)
                {
                    errors.push(error_at(
                        child,
                        FormulaErrorCode::AggregationValidation,
                        format!(
                            "Inconsistent aggregation among operands: {} is not aggregated",
                            to_text(child)
                        ),
                    ));
                }
            }
        }
        for child in &children {
            self.walk(child, inside_aggregation, errors);
        }
    }
}

/// Checks window function placement and arguments.
#[derive(Debug)]
pub struct WindowFunctionChecker {
    allow_nested: bool,
}

impl WindowFunctionChecker {
    pub fn new(allow_nested: bool) -> Self {
        Self { allow_nested }
    }

    pub fn check(&self, node: &Node) -> Vec<FormulaError> {
        let mut errors = Vec::new();
        self.walk(node.expr(), false, false, &mut errors);
        errors
    }

    fn walk(&self, node: &Node, in_aggregation: bool, in_window: bool, errors: &mut Vec<FormulaError>) {
        if node.is(NodeType::WindowFuncCall) {
            let name = node.func_name().unwrap_or_default().to_uppercase();
            if in_aggregation {
                errors.push(error_at(
                    node,
                    FormulaErrorCode::WindowFunctionValidation,
                    format!("Window function {name} cannot be used inside an aggregation"),
                ));
            }
            if in_window && !self.allow_nested {
                errors.push(error_at(
                    node,
                    FormulaErrorCode::WindowFunctionValidation,
                    format!("Nested window function {name} is not allowed"),
                ));
            }
            for arg in node.func_args() {
                if !is_aggregate_expression(arg) && !is_constant_expression(arg) && !is_window_expression(arg) {
                    errors.push(error_at(
                        arg,
                        FormulaErrorCode::WindowFunctionValidation,
                        format!(
                            "Argument {} of window function {name} must be aggregated",
                            to_text(arg)
                        ),
                    ));
                }
                self.walk(arg, in_aggregation, true, errors);
            }
            return;
        }
        let in_aggregation = in_aggregation || is_aggregate_function(node);
        for child in autonomous_children(node) {
            self.walk(&child, in_aggregation, in_window, errors);
        }
    }
}
