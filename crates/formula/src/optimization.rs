//! Constant folding mutations.

use crate::mutation::FormulaMutation;
use crate::node::{LiteralValue, Node, NodeType};
use crate::shortcuts as n;

fn literal_operands(node: &Node) -> Option<(&LiteralValue, &LiteralValue)> {
    if !node.is(NodeType::Binary) {
        return None;
    }
    Some((node.children()[0].literal()?, node.children()[1].literal()?))
}

fn eval_math(op: &str, left: &LiteralValue, right: &LiteralValue) -> Option<LiteralValue> {
    use LiteralValue::*;
    match (left, op, right) {
        (Integer(a), "+", Integer(b)) => a.checked_add(*b).map(Integer),
        (Integer(a), "-", Integer(b)) => a.checked_sub(*b).map(Integer),
        (Integer(a), "*", Integer(b)) => a.checked_mul(*b).map(Integer),
        (Integer(_), "/", Integer(0)) => None,
        (Integer(a), "/", Integer(b)) => Some(Float(*a as f64 / *b as f64)),
        (Float(_) | Integer(_), _, Float(_) | Integer(_)) => {
            let a = as_f64(left)?;
            let b = as_f64(right)?;
            match op {
                "+" => Some(Float(a + b)),
                "-" => Some(Float(a - b)),
                "*" => Some(Float(a * b)),
                "/" if b != 0.0 => Some(Float(a / b)),
                _ => None,
            }
        }
        _ => None,
    }
}

fn as_f64(value: &LiteralValue) -> Option<f64> {
    match value {
        LiteralValue::Integer(v) => Some(*v as f64),
        LiteralValue::Float(v) => Some(*v),
        _ => None,
    }
}

/// `1 + 2` -> `3`; division always yields a float and is skipped for a zero
/// divisor.
#[derive(Debug, Default)]
pub struct OptimizeConstMathMutation;

impl FormulaMutation for OptimizeConstMathMutation {
    fn name(&self) -> &str {
        "optimize_const_math"
    }

    fn match_node(&self, node: &Node, _parent_stack: &[Node]) -> bool {
        match (node.operator(), literal_operands(node)) {
            (Some(op), Some((l, r))) => eval_math(op, l, r).is_some(),
            _ => false,
        }
    }

    fn make_replacement(&self, old: &Node, _parent_stack: &[Node]) -> Node {
        match (old.operator(), literal_operands(old)) {
            (Some(op), Some((l, r))) => match eval_math(op, l, r) {
                Some(value) => n::literal(value),
                None => old.clone(),
            },
            _ => old.clone(),
        }
    }
}

fn eval_comparison(op: &str, left: &LiteralValue, right: &LiteralValue) -> Option<bool> {
    if std::mem::discriminant(left) != std::mem::discriminant(right)
        || matches!(left, LiteralValue::Null)
    {
        return None;
    }
    if let (LiteralValue::Float(a), LiteralValue::Float(b)) = (left, right) {
        if a.is_nan() || b.is_nan() {
            return None;
        }
    }
    match op {
        "==" | "_==" => Some(left == right),
        "!=" | "_!=" => Some(left != right),
        _ => None,
    }
}

/// Equality of two literals of the same type -> boolean literal.
#[derive(Debug, Default)]
pub struct OptimizeConstComparisonMutation;

impl FormulaMutation for OptimizeConstComparisonMutation {
    fn name(&self) -> &str {
        "optimize_const_comparison"
    }

    fn match_node(&self, node: &Node, _parent_stack: &[Node]) -> bool {
        match (node.operator(), literal_operands(node)) {
            (Some(op), Some((l, r))) => eval_comparison(op, l, r).is_some(),
            _ => false,
        }
    }

    fn make_replacement(&self, old: &Node, _parent_stack: &[Node]) -> Node {
        match (old.operator(), literal_operands(old)) {
            (Some(op), Some((l, r))) => match eval_comparison(op, l, r) {
                Some(value) => n::lit_bool(value),
                None => old.clone(),
            },
            _ => old.clone(),
        }
    }
}

fn bool_literal(node: &Node) -> Option<bool> {
    match node.literal() {
        Some(LiteralValue::Boolean(v)) => Some(*v),
        _ => None,
    }
}

fn simplify_and_or(node: &Node) -> Option<Node> {
    let op = node.operator()?;
    if !node.is(NodeType::Binary) {
        return None;
    }
    let (left, right) = (&node.children()[0], &node.children()[1]);
    let (constant, other) = match (bool_literal(left), bool_literal(right)) {
        (Some(c), _) => (c, right),
        (None, Some(c)) => (c, left),
        (None, None) => return None,
    };
    match (op, constant) {
        ("and", false) => Some(n::lit_bool(false)),
        ("and", true) => Some(other.clone()),
        ("or", true) => Some(n::lit_bool(true)),
        ("or", false) => Some(other.clone()),
        _ => None,
    }
}

/// `true and x` -> `x`, `false or x` -> `x`, and the absorbing cases.
#[derive(Debug, Default)]
pub struct OptimizeConstAndOrMutation;

impl FormulaMutation for OptimizeConstAndOrMutation {
    fn name(&self) -> &str {
        "optimize_const_and_or"
    }

    fn match_node(&self, node: &Node, _parent_stack: &[Node]) -> bool {
        simplify_and_or(node).is_some()
    }

    fn make_replacement(&self, old: &Node, _parent_stack: &[Node]) -> Node {
        simplify_and_or(old).unwrap_or_else(|| old.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::apply_mutations;

    fn optimize(tree: &Node) -> Node {
        apply_mutations(
            tree,
            &[
                Box::new(OptimizeConstMathMutation) as Box<dyn FormulaMutation>,
                Box::new(OptimizeConstComparisonMutation),
                Box::new(OptimizeConstAndOrMutation),
            ],
        )
    }

    #[test]
    fn folds_nested_math() {
        let tree = n::formula(n::binary(
            "*",
            n::binary("+", n::lit_int(1), n::lit_int(2)),
            n::lit_int(4),
        ));
        assert_eq!(optimize(&tree), n::formula(n::lit_int(12)));
        let div = n::formula(n::binary("/", n::lit_int(3), n::lit_int(2)));
        assert_eq!(optimize(&div), n::formula(n::lit_float(1.5)));
        let by_zero = n::formula(n::binary("/", n::lit_int(3), n::lit_int(0)));
        assert!(optimize(&by_zero).ptr_eq(&by_zero));
        let mixed = n::formula(n::binary("-", n::lit_float(2.5), n::lit_int(1)));
        assert_eq!(optimize(&mixed), n::formula(n::lit_float(1.5)));
    }

    #[test]
    fn folds_comparisons_of_same_type() {
        let eq = n::formula(n::binary("==", n::lit_str("a"), n::lit_str("a")));
        assert_eq!(optimize(&eq), n::formula(n::lit_bool(true)));
        let cross = n::formula(n::binary("==", n::lit_str("1"), n::lit_int(1)));
        assert!(optimize(&cross).ptr_eq(&cross));
    }

    #[test]
    fn simplifies_and_or_with_constants() {
        let tree = n::formula(n::binary(
            "and",
            n::binary("==", n::lit_int(1), n::lit_int(1)),
            n::binary(">", n::field("x"), n::lit_int(0)),
        ));
        assert_eq!(
            optimize(&tree),
            n::formula(n::binary(">", n::field("x"), n::lit_int(0)))
        );
        let absorbed = n::formula(n::binary("or", n::field("flag"), n::lit_bool(true)));
        assert_eq!(optimize(&absorbed), n::formula(n::lit_bool(true)));
    }
}
