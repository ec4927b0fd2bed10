//! BI data types and best-effort type inference for formula expressions.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::node::{LiteralValue, Node, NodeKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Null,
    Boolean,
    Integer,
    Float,
    String,
    Date,
    Datetime,
    GenericDatetime,
    Geopoint,
    Geopolygon,
    Uuid,
    Markup,
    Array,
    Unsupported,
}

impl DataType {
    /// Name of the function that casts an expression to this type.
    pub fn cast_function(&self) -> Option<&'static str> {
        Some(match self {
            Self::Boolean => "bool",
            Self::Integer => "int",
            Self::Float => "float",
            Self::String => "str",
            Self::Date => "date",
            Self::Datetime => "datetime",
            Self::GenericDatetime => "genericdatetime",
            Self::Geopoint => "geopoint",
            Self::Geopolygon => "geopolygon",
            Self::Markup => "markup",
            _ => return None,
        })
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Integer | Self::Float)
    }

    /// Types a parameter value may have.
    pub fn is_parameter_type(&self) -> bool {
        matches!(
            self,
            Self::Boolean
                | Self::Integer
                | Self::Float
                | Self::String
                | Self::Date
                | Self::Datetime
                | Self::GenericDatetime
        )
    }

    pub fn of_literal(value: &LiteralValue) -> DataType {
        match value {
            LiteralValue::Null => Self::Null,
            LiteralValue::Integer(_) => Self::Integer,
            LiteralValue::Float(_) => Self::Float,
            LiteralValue::Boolean(_) => Self::Boolean,
            LiteralValue::String(_) => Self::String,
            LiteralValue::Date(_) => Self::Date,
            LiteralValue::Datetime(_) => Self::Datetime,
            LiteralValue::GenericDatetime(_) => Self::GenericDatetime,
            LiteralValue::Geopoint(..) => Self::Geopoint,
            LiteralValue::Uuid(_) => Self::Uuid,
            LiteralValue::Array(_) => Self::Array,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

const COMPARISON_OPS: &[&str] = &[
    "==", "_==", "!=", "_!=", "_dneq", ">", ">=", "<", "<=", "and", "or", "in", "notin", "like",
    "notlike",
];

/// Infer the result type of `node`; field types come from `field_type`.
///
/// Unknown functions yield [`DataType::Unsupported`].
pub fn infer_data_type(node: &Node, field_type: &dyn Fn(&str) -> Option<DataType>) -> DataType {
    let infer = |n: &Node| infer_data_type(n, field_type);
    match node.kind() {
        NodeKind::Literal(value) => DataType::of_literal(value),
        NodeKind::Field { name } => field_type(name).unwrap_or(DataType::Unsupported),
        NodeKind::Formula | NodeKind::Parenthesized => infer(&node.children()[0]),
        NodeKind::Unary { op } => match op.as_str() {
            "not" | "isnull" | "isnotnull" => DataType::Boolean,
            _ => infer(&node.children()[0]),
        },
        NodeKind::Binary { op } => {
            if COMPARISON_OPS.contains(&op.as_str()) {
                return DataType::Boolean;
            }
            let left = infer(&node.children()[0]);
            let right = infer(&node.children()[1]);
            match op.as_str() {
                "/" if left.is_numeric() && right.is_numeric() => DataType::Float,
                "+" | "-" | "*" | "%" | "^" => numeric_join(left, right),
                _ => DataType::Unsupported,
            }
        }
        NodeKind::Ternary { .. } => DataType::Boolean,
        NodeKind::IfBlock | NodeKind::CaseBlock => {
            let branch_types = node.children().iter().filter_map(|c| match c.kind() {
                NodeKind::IfPart | NodeKind::WhenPart => Some(infer(&c.children()[1])),
                _ => None,
            });
            let else_type = node.children().last().map(&infer);
            branch_types
                .chain(else_type)
                .find(|t| *t != DataType::Null)
                .unwrap_or(DataType::Null)
        }
        NodeKind::FuncCall { name } | NodeKind::WindowFuncCall { name } => {
            infer_call_type(name, node.func_args(), &infer)
        }
        NodeKind::QueryFork { .. } => infer(&node.children()[1]),
        _ => DataType::Unsupported,
    }
}

fn numeric_join(left: DataType, right: DataType) -> DataType {
    match (left, right) {
        (DataType::Integer, DataType::Integer) => DataType::Integer,
        (l, r) if l.is_numeric() && r.is_numeric() => DataType::Float,
        (DataType::String, DataType::String) => DataType::String,
        (DataType::Date, DataType::Integer) | (DataType::Integer, DataType::Date) => DataType::Date,
        (DataType::Null, other) | (other, DataType::Null) => other,
        _ => DataType::Unsupported,
    }
}

fn infer_call_type(name: &str, args: &[Node], infer: &dyn Fn(&Node) -> DataType) -> DataType {
    let first = || args.first().map(infer).unwrap_or(DataType::Null);
    match name {
        "count" | "countd" | "countd_approx" | "count_if" | "countd_if" | "rcount" | "mcount"
        | "rank" | "rank_dense" | "rank_unique" | "day" | "month" | "quarter" | "year"
        | "week" | "hour" | "minute" | "second" | "len" | "int" => DataType::Integer,
        "avg" | "avg_if" | "ravg" | "mavg" | "stdev" | "stdevp" | "var" | "varp" | "median"
        | "quantile" | "rank_percentile" | "float" => DataType::Float,
        "sum" | "sum_if" | "min" | "max" | "any" | "rsum" | "rmin" | "rmax" | "msum" | "mmin"
        | "mmax" | "lag" | "first" | "last" | "nth" | "dateadd" | "ago" | "at_date"
        | "arg_min" | "arg_max" => first(),
        "if" => {
            let mut branches = args.chunks(2).filter_map(|pair| match pair {
                [_, expr] => Some(infer(expr)),
                [else_expr] => Some(infer(else_expr)),
                _ => None,
            });
            branches.find(|t| *t != DataType::Null).unwrap_or(DataType::Null)
        }
        "case" => args
            .iter()
            .skip(1)
            .enumerate()
            .filter(|(i, _)| i % 2 == 1 || *i == args.len() - 2)
            .map(|(_, a)| infer(a))
            .find(|t| *t != DataType::Null)
            .unwrap_or(DataType::Null),
        "str" | "concat" | "upper" | "lower" | "trim" | "all_concat" | "top_concat" => {
            DataType::String
        }
        "bool" | "contains" | "startswith" | "endswith" | "isnull" => DataType::Boolean,
        "date" => DataType::Date,
        "datetime" | "now" => DataType::Datetime,
        "genericdatetime" => DataType::GenericDatetime,
        "geopoint" => DataType::Geopoint,
        "geopolygon" => DataType::Geopolygon,
        "markup" => DataType::Markup,
        _ => DataType::Unsupported,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shortcuts as n;

    fn types(name: &str) -> Option<DataType> {
        match name {
            "price" => Some(DataType::Float),
            "qty" => Some(DataType::Integer),
            "city" => Some(DataType::String),
            _ => None,
        }
    }

    #[test]
    fn infers_arithmetic_and_aggregates() {
        let qty_sum = n::func("sum", vec![n::field("qty")]);
        assert_eq!(infer_data_type(&qty_sum, &types), DataType::Integer);
        let ratio = n::binary("/", n::field("qty"), n::lit_int(2));
        assert_eq!(infer_data_type(&ratio, &types), DataType::Float);
        let mixed = n::binary("+", n::field("price"), n::field("qty"));
        assert_eq!(infer_data_type(&mixed, &types), DataType::Float);
        let cmp = n::binary("==", n::field("city"), n::lit_str("Moscow"));
        assert_eq!(infer_data_type(&cmp, &types), DataType::Boolean);
        assert_eq!(
            infer_data_type(&n::func("countd", vec![n::field("city")]), &types),
            DataType::Integer
        );
        assert_eq!(infer_data_type(&n::field("nope"), &types), DataType::Unsupported);
    }

    #[test]
    fn infers_branches_skipping_nulls() {
        let block = n::if_block(
            vec![(n::lit_bool(true), n::lit_null())],
            n::field("city"),
        );
        assert_eq!(infer_data_type(&block, &types), DataType::String);
        let call = n::func("if", vec![n::lit_bool(true), n::field("qty"), n::lit_null()]);
        assert_eq!(infer_data_type(&call, &types), DataType::Integer);
    }

    #[test]
    fn cast_functions() {
        assert_eq!(DataType::Integer.cast_function(), Some("int"));
        assert_eq!(DataType::Uuid.cast_function(), None);
    }
}
