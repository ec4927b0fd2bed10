use lodq_formula::explain::to_text;

use crate::primitives::{
    CompiledFormulaInfo, CompiledMultiLevelQuery, CompiledMultiQuery, CompiledQuery, ExecutionLevel, ExecutionPlan,
    FromSource, JoinedFromObject, PlannedFormula, SlicerConfig,
};

/// Render a compiled query as human-readable multiline text.
pub fn explain_query(query: &CompiledQuery) -> String {
    let mut s = String::new();
    fmt_query(query, 0, &mut s);
    s
}

pub fn explain_multi_query(multi_query: &CompiledMultiQuery) -> String {
    let mut s = String::new();
    for query in &multi_query.queries {
        fmt_query(query, 0, &mut s);
    }
    s
}

/// Levels are rendered from the top down.
pub fn explain_multi_level_query(multi_query: &CompiledMultiLevelQuery) -> String {
    let mut s = String::new();
    for (level_idx, level) in multi_query.levels.iter().enumerate().rev() {
        s.push_str(&format!(
            "Level {level_idx} type={} queries={}\n",
            fmt_level(level.level_type),
            level.queries.len()
        ));
        for query in &level.queries {
            fmt_query(query, 1, &mut s);
        }
    }
    s
}

pub fn explain_plan(plan: &ExecutionPlan) -> String {
    let mut s = String::new();
    let levels: Vec<&str> = plan.level_plan.level_types.iter().map(|l| fmt_level(*l)).collect();
    s.push_str(&format!("ExecutionPlan id={} levels=[{}]\n", plan.id, levels.join(", ")));
    for (name, formulas) in [
        ("select", &plan.select),
        ("group_by", &plan.group_by),
        ("filters", &plan.filters),
        ("order_by", &plan.order_by),
        ("join_on", &plan.join_on),
    ] {
        if formulas.is_empty() {
            continue;
        }
        s.push_str(&format!("  {name}={}\n", formulas.len()));
        for f in formulas {
            fmt_planned(f, 2, &mut s);
        }
    }
    fmt_from(&plan.joined_from, 1, &mut s);
    s
}

fn fmt_query(query: &CompiledQuery, indent: usize, out: &mut String) {
    let pad = "  ".repeat(indent);
    out.push_str(&format!("{pad}Query id={} level={}\n", query.id, fmt_level(query.level_type)));
    for (name, formulas) in [
        ("select", &query.select),
        ("group_by", &query.group_by),
        ("filters", &query.filters),
        ("order_by", &query.order_by),
        ("join_on", &query.join_on),
    ] {
        if formulas.is_empty() {
            continue;
        }
        out.push_str(&format!("{pad}  {name}={}\n", formulas.len()));
        for f in formulas {
            out.push_str(&format!("{pad}    {}\n", fmt_formula(f)));
        }
    }
    fmt_from(&query.joined_from, indent + 1, out);
    if let Some(limit) = query.limit {
        out.push_str(&format!("{pad}  limit={limit} offset={}\n", query.offset.unwrap_or(0)));
    }
}

fn fmt_from(joined_from: &JoinedFromObject, indent: usize, out: &mut String) {
    let pad = "  ".repeat(indent);
    if joined_from.froms.is_empty() {
        return;
    }
    out.push_str(&format!(
        "{pad}from root={}\n",
        joined_from.root_from_id.as_deref().unwrap_or("-")
    ));
    for from in &joined_from.froms {
        let source = match &from.source {
            FromSource::Avatar { avatar_id } => format!("avatar {avatar_id}"),
            FromSource::Subquery { query_id } => format!("subquery {query_id}"),
        };
        let columns: Vec<&str> = from.columns.iter().map(|c| c.name.as_str()).collect();
        out.push_str(&format!("{pad}  {} <- {source} [{}]\n", from.id, columns.join(", ")));
    }
}

fn fmt_formula(formula: &CompiledFormulaInfo) -> String {
    let mut s = match &formula.alias {
        Some(alias) => format!("{alias} := {}", to_text(formula.expr())),
        None => to_text(formula.expr()),
    };
    if let Some(join) = &formula.join {
        s.push_str(&format!(" ({:?} {} -> {})", join.join_type, join.left_id, join.right_id));
    }
    if let Some(direction) = formula.direction {
        s.push_str(&format!(" {direction:?}"));
    }
    s
}

fn fmt_planned(formula: &PlannedFormula, indent: usize, out: &mut String) {
    let pad = "  ".repeat(indent);
    let slicers: Vec<String> = formula.slicing_plan.slicer_configs.iter().map(fmt_slicer).collect();
    out.push_str(&format!(
        "{pad}{} levels={} slicers=[{}]\n",
        fmt_formula(&formula.formula),
        formula.level_plan.level_count(),
        slicers.join(", ")
    ));
}

fn fmt_slicer(slicer: &SlicerConfig) -> String {
    match slicer {
        SlicerConfig::Top => "top".to_string(),
        SlicerConfig::Window => "window".to_string(),
        SlicerConfig::Field => "field".to_string(),
        SlicerConfig::LevelTagged(tag) => format!("tagged{tag}"),
    }
}

fn fmt_level(level: ExecutionLevel) -> &'static str {
    match level {
        ExecutionLevel::SourceDb => "source_db",
        ExecutionLevel::Compeng => "compeng",
    }
}
