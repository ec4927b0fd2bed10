use crate::node::{LiteralValue, LodKind, Node, NodeKind, NodeType, WindowGroupingKind};

/// Render a node as compact single-line formula text.
pub fn to_text(node: &Node) -> String {
    let mut s = String::new();
    fmt_node(node, &mut s);
    s
}

/// Render a node as an indented tree, one node per line, with level tags.
pub fn pretty(node: &Node) -> String {
    let mut s = String::new();
    fmt_tree(node, 0, &mut s);
    s
}

fn fmt_literal(value: &LiteralValue) -> String {
    match value {
        LiteralValue::Null => "NULL".to_string(),
        LiteralValue::Integer(v) => v.to_string(),
        LiteralValue::Float(v) => format!("{v:?}"),
        LiteralValue::Boolean(v) => if *v { "TRUE" } else { "FALSE" }.to_string(),
        LiteralValue::String(v) | LiteralValue::Uuid(v) => format!("'{}'", v.replace('\'', "\\'")),
        LiteralValue::Date(v) | LiteralValue::Datetime(v) | LiteralValue::GenericDatetime(v) => {
            format!("#{v}#")
        }
        LiteralValue::Geopoint(lat, lon) => format!("GEOPOINT({lat:?}, {lon:?})"),
        LiteralValue::Array(items) => format!(
            "[{}]",
            items.iter().map(fmt_literal).collect::<Vec<_>>().join(", ")
        ),
    }
}

fn join_text(nodes: &[Node]) -> String {
    nodes.iter().map(to_text).collect::<Vec<_>>().join(", ")
}

fn operand(node: &Node, out: &mut String) {
    if matches!(node.node_type(), NodeType::Binary | NodeType::Ternary) {
        out.push('(');
        fmt_node(node, out);
        out.push(')');
    } else {
        fmt_node(node, out);
    }
}

/// Text of LOD / IGNORE DIMENSIONS / BEFORE FILTER BY clauses, with a
/// leading space per present clause.
fn fmt_call_clauses(node: &Node, out: &mut String) {
    if let Some(lod) = node.lod() {
        if lod.lod_kind() != Some(LodKind::Default) {
            out.push(' ');
            fmt_node(lod, out);
        }
    }
    if let Some(ignore) = node.ignore_dimensions() {
        if !ignore.children().is_empty() {
            out.push(' ');
            fmt_node(ignore, out);
        }
    }
    if let Some(names) = node.bfb_names() {
        if !names.is_empty() {
            out.push_str(" BEFORE FILTER BY ");
            out.push_str(&names.iter().map(|n| format!("[{n}]")).collect::<Vec<_>>().join(", "));
        }
    }
}

fn fmt_node(node: &Node, out: &mut String) {
    let children = node.children();
    match node.kind() {
        NodeKind::Literal(value) => out.push_str(&fmt_literal(value)),
        NodeKind::Field { name } => out.push_str(&format!("[{name}]")),
        NodeKind::FuncCall { name } => {
            out.push_str(&format!("{}({}", name.to_uppercase(), join_text(node.func_args())));
            fmt_call_clauses(node, out);
            out.push(')');
        }
        NodeKind::WindowFuncCall { name } => {
            out.push_str(&format!("{}({}", name.to_uppercase(), join_text(node.func_args())));
            if let Some(grouping) = node.grouping() {
                out.push(' ');
                fmt_node(grouping, out);
            }
            if let Some(ordering) = node.ordering() {
                if !ordering.children().is_empty() {
                    out.push(' ');
                    fmt_node(ordering, out);
                }
            }
            fmt_call_clauses(node, out);
            out.push(')');
        }
        NodeKind::Unary { op } => match op.as_str() {
            "neg" => {
                out.push('-');
                operand(&children[0], out);
            }
            "isnull" | "isnotnull" => {
                operand(&children[0], out);
                out.push_str(if op == "isnull" { " IS NULL" } else { " IS NOT NULL" });
            }
            _ => {
                out.push_str(&format!("{} ", op.to_uppercase()));
                operand(&children[0], out);
            }
        },
        NodeKind::Binary { op } => {
            operand(&children[0], out);
            out.push_str(&format!(" {} ", op.to_uppercase()));
            operand(&children[1], out);
        }
        NodeKind::Ternary { op } if op == "between" || op == "notbetween" => {
            operand(&children[0], out);
            out.push_str(if op == "between" { " BETWEEN " } else { " NOT BETWEEN " });
            operand(&children[1], out);
            out.push_str(" AND ");
            operand(&children[2], out);
        }
        NodeKind::Ternary { op } => {
            out.push_str(&format!("{}({})", op.to_uppercase(), join_text(children)));
        }
        NodeKind::IfPart => {
            out.push_str(&format!("{} THEN {}", to_text(&children[0]), to_text(&children[1])));
        }
        NodeKind::IfBlock => {
            let (parts, else_expr) = children.split_at(children.len() - 1);
            for (i, part) in parts.iter().enumerate() {
                out.push_str(if i == 0 { "IF " } else { " ELSEIF " });
                fmt_node(part, out);
            }
            out.push_str(&format!(" ELSE {} END", to_text(&else_expr[0])));
        }
        NodeKind::WhenPart => {
            out.push_str(&format!("WHEN {} THEN {}", to_text(&children[0]), to_text(&children[1])));
        }
        NodeKind::CaseBlock => {
            out.push_str(&format!("CASE {}", to_text(&children[0])));
            for part in &children[1..children.len() - 1] {
                out.push(' ');
                fmt_node(part, out);
            }
            out.push_str(&format!(" ELSE {} END", to_text(&children[children.len() - 1])));
        }
        NodeKind::Parenthesized => out.push_str(&format!("({})", to_text(&children[0]))),
        NodeKind::Lod(kind) => {
            out.push_str(&kind.as_str().to_uppercase());
            if kind.has_dimensions() && !children.is_empty() {
                out.push_str(&format!(" {}", join_text(children)));
            }
        }
        NodeKind::WindowGrouping(kind) => {
            out.push_str(&kind.as_str().to_uppercase());
            if *kind != WindowGroupingKind::Total && !children.is_empty() {
                out.push_str(&format!(" {}", join_text(children)));
            }
        }
        NodeKind::BeforeFilterBy { field_names } => {
            let names = field_names.iter().map(|n| format!("[{n}]")).collect::<Vec<_>>();
            out.push_str(&format!("BEFORE FILTER BY {}", names.join(", ")));
        }
        NodeKind::Ordering => out.push_str(&format!("ORDER BY {}", join_text(children))),
        NodeKind::OrderAscending => out.push_str(&format!("{} ASC", to_text(&children[0]))),
        NodeKind::OrderDescending => out.push_str(&format!("{} DESC", to_text(&children[0]))),
        NodeKind::IgnoreDimensions => {
            out.push_str(&format!("IGNORE DIMENSIONS {}", join_text(children)))
        }
        NodeKind::QueryFork { join_type } => {
            out.push_str(&format!(
                "FORK[{}]({} ON {}",
                join_type.as_str().to_uppercase(),
                to_text(&children[1]),
                to_text(&children[0]),
            ));
            if children[2].lod_kind() != Some(LodKind::Default) {
                out.push(' ');
                fmt_node(&children[2], out);
            }
            if children[3].bfb_names().is_some_and(|names| !names.is_empty()) {
                out.push(' ');
                fmt_node(&children[3], out);
            }
            if !children[4].children().is_empty() {
                out.push_str(&format!(" MUTATE {}", to_text(&children[4])));
            }
            out.push(')');
        }
        NodeKind::QueryForkJoining => out.push_str(&join_text(children)),
        NodeKind::SelfEqualityJoinCondition => out.push_str(&format!("={}", to_text(&children[0]))),
        NodeKind::BinaryJoinCondition => {
            out.push_str(&format!("{} == {}", to_text(&children[0]), to_text(&children[1])))
        }
        NodeKind::BfbFilterMutations => out.push_str(&join_text(children)),
        NodeKind::BfbFilterMutationSpec => {
            out.push_str(&format!("{} -> {}", to_text(&children[0]), to_text(&children[1])))
        }
        NodeKind::Error { message, code } => out.push_str(&format!("ERROR({code}: {message})")),
        NodeKind::Formula => fmt_node(&children[0], out),
    }
}

fn fmt_tree(node: &Node, indent: usize, out: &mut String) {
    let pad = "  ".repeat(indent);
    let label = match node.kind() {
        NodeKind::Literal(value) => format!("Literal {}", fmt_literal(value)),
        NodeKind::Field { name } => format!("Field [{name}]"),
        NodeKind::FuncCall { name } => format!("FuncCall {name}"),
        NodeKind::WindowFuncCall { name } => format!("WindowFuncCall {name}"),
        NodeKind::Unary { op } | NodeKind::Binary { op } | NodeKind::Ternary { op } => {
            format!("{:?} {op}", node.node_type())
        }
        NodeKind::Lod(kind) => format!("Lod {}", kind.as_str()),
        NodeKind::WindowGrouping(kind) => format!("WindowGrouping {}", kind.as_str()),
        NodeKind::BeforeFilterBy { field_names } => format!("BeforeFilterBy {field_names:?}"),
        NodeKind::QueryFork { join_type } => format!("QueryFork join={}", join_type.as_str()),
        NodeKind::Error { message, code } => format!("Error {code}: {message}"),
        _ => format!("{:?}", node.node_type()),
    };
    match node.tag() {
        Some(tag) => out.push_str(&format!("{pad}{label} tag={tag}\n")),
        None => out.push_str(&format!("{pad}{label}\n")),
    }
    for child in node.children() {
        fmt_tree(child, indent + 1, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shortcuts as n;

    #[test]
    fn renders_calls_with_clauses() {
        let call = n::func_full(
            "sum",
            vec![n::field("sales")],
            n::fixed(vec![n::field("city")]),
            vec![],
            &["year"],
        );
        assert_eq!(to_text(&call), "SUM([sales] FIXED [city] BEFORE FILTER BY [year])");
        let expr = n::binary("*", n::binary("+", n::lit_int(1), n::field("x")), n::lit_float(2.5));
        assert_eq!(to_text(&expr), "(1 + [x]) * 2.5");
    }

    #[test]
    fn renders_window_calls() {
        let win = n::window_full(
            "rsum",
            vec![n::func("sum", vec![n::field("x")])],
            vec![n::desc(n::field("d"))],
            n::within(vec![n::field("c")]),
            &[],
        );
        assert_eq!(to_text(&win), "RSUM(SUM([x]) WITHIN [c] ORDER BY [d] DESC)");
    }

    #[test]
    fn pretty_indents_children() {
        let text = pretty(&n::formula(n::binary("+", n::field("a"), n::lit_int(1))));
        assert_eq!(text, "Formula\n  Binary +\n    Field [a]\n    Literal 1\n");
    }
}
