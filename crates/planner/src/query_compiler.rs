//! Request to [`CompiledQuery`] compilation.
//!
//! A [`QuerySpec`] names fields by id; every field is compiled through the
//! session's [`FormulaCompiler`] (raise mode), filters are built from
//! operator specs, and the assembled query is then rewritten:
//! - constant folding and `SUM(SUM(x))` collapsing, `TRUE` filters dropped
//! - lookup functions and LOD aggregations turned into `QueryFork` nodes
//! - window calls and BFB-carrying forks tagged with level tags

use lodq_common::{AvatarId, FieldId, LodqError, Result, BASE_QUERY_ID};
use lodq_formula::fork::{
    AggregationToQueryForkMutation, LodToQueryForkMutation, LookupToQueryForkMutation,
    WindowToQueryForkMutation,
};
use lodq_formula::inspect::{has_non_default_lod, is_lookup_function, is_window_expression, used_fields};
use lodq_formula::mutation::CollapseNestedAggregationMutation;
use lodq_formula::optimization::{OptimizeConstAndOrMutation, OptimizeConstComparisonMutation};
use lodq_formula::shortcuts as n;
use lodq_formula::tag::LevelTaggerMutation;
use lodq_formula::{apply_mutations, FormulaMutation, LiteralValue, Node, NodeExtract, NodeType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::debug;

use crate::compiler::{CompilationContext, FormulaCompiler};
use crate::primitives::{
    CompiledFormulaInfo, CompiledQuery, ExecutionLevel, FromColumn, FromObject, JoinedFromObject,
    OrderDirection, PrefixedIdGen, QueryPart,
};
use crate::registry::AvatarRelation;

/// Comparison applied by a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    IsNull,
    IsNotNull,
    Contains,
    StartsWith,
    Between,
}

impl FilterOperator {
    fn arity(&self) -> Option<usize> {
        match self {
            Self::IsNull | Self::IsNotNull => Some(0),
            Self::Between => Some(2),
            Self::In | Self::NotIn => None,
            _ => Some(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub field_id: FieldId,
    pub operator: FilterOperator,
    #[serde(default)]
    pub values: Vec<LiteralValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBySpec {
    pub field_id: FieldId,
    pub direction: OrderDirection,
}

/// Data request in terms of dataset fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub select: Vec<FieldId>,
    #[serde(default)]
    pub group_by: Vec<FieldId>,
    #[serde(default)]
    pub order_by: Vec<OrderBySpec>,
    #[serde(default)]
    pub filters: Vec<FilterSpec>,
    #[serde(default)]
    pub parameter_values: HashMap<FieldId, LiteralValue>,
    /// Candidate joins; only those reaching used avatars are kept.
    #[serde(default)]
    pub relations: Vec<AvatarRelation>,
    #[serde(default)]
    pub root_avatar_id: Option<AvatarId>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub offset: Option<u64>,
}

/// Builds one [`CompiledQuery`] per request on top of a compiler session.
pub struct QueryCompiler<'c, 'a> {
    compiler: &'c mut FormulaCompiler<'a>,
    alias_gen: PrefixedIdGen,
    alias_by_extract: HashMap<NodeExtract, String>,
}

impl<'c, 'a> QueryCompiler<'c, 'a> {
    pub fn new(compiler: &'c mut FormulaCompiler<'a>) -> Self {
        Self {
            compiler,
            alias_gen: PrefixedIdGen::new("res"),
            alias_by_extract: HashMap::new(),
        }
    }

    /// Short alias shared by structurally equal expressions.
    fn expression_alias(&mut self, formula: &Node) -> String {
        match formula.extract() {
            Some(extract) => {
                if let Some(alias) = self.alias_by_extract.get(extract) {
                    return alias.clone();
                }
                let alias = self.alias_gen.get_id();
                self.alias_by_extract.insert(extract.clone(), alias.clone());
                alias
            }
            None => self.alias_gen.get_id(),
        }
    }

    fn compile_field(&mut self, id: &FieldId) -> Result<CompiledFormulaInfo> {
        let mut info = self.compiler.compile_field_formula(id)?;
        info.alias = Some(self.expression_alias(&info.formula));
        Ok(info)
    }

    pub fn make_compiled_query(&mut self, spec: &QuerySpec) -> Result<CompiledQuery> {
        self.compiler.set_context(CompilationContext {
            group_by_ids: spec.group_by.clone(),
            order_by: spec
                .order_by
                .iter()
                .map(|ob| (ob.field_id.clone(), ob.direction))
                .collect(),
            parameter_values: spec.parameter_values.clone(),
        });

        let mut query = CompiledQuery::new(BASE_QUERY_ID, ExecutionLevel::SourceDb);

        let mut used_aliases = HashSet::new();
        let mut copy_counter = 0usize;
        for id in &spec.select {
            let mut info = self.compile_field(id)?;
            let alias = info.alias_str().to_string();
            if !used_aliases.insert(alias.clone()) {
                let copy_alias = format!("{alias}_cp{copy_counter}");
                copy_counter += 1;
                used_aliases.insert(copy_alias.clone());
                info.alias = Some(copy_alias);
            }
            query.select.push(info);
        }

        for id in &spec.group_by {
            let info = self.compile_field(id)?;
            query.group_by.push(info);
        }

        let mut seen_order_by = HashSet::new();
        for ob in &spec.order_by {
            let info = self.compile_field(&ob.field_id)?.with_direction(ob.direction);
            if let Some(extract) = info.formula.extract() {
                if !seen_order_by.insert(extract.clone()) {
                    continue;
                }
            }
            query.order_by.push(info);
        }

        for filter in &spec.filters {
            let info = self.compile_filter(filter)?;
            query.filters.push(info);
        }

        let used_avatars: BTreeSet<String> = query
            .all_formulas()
            .flat_map(|f| f.avatar_ids.iter().cloned())
            .collect();
        let relations = select_relations(&spec.relations, &used_avatars);
        for relation in &relations {
            let mut info = self.compiler.compile_relation_formula(relation)?;
            info.alias = Some(self.expression_alias(&info.formula));
            query.join_on.push(info);
        }

        query.joined_from = self.make_joined_from(&query, spec.root_avatar_id.as_ref(), &relations)?;
        query.limit = spec.limit;
        query.offset = spec.offset;

        let query = optimize_query(query);
        let query = fork_extended_aggregations(query, self.compiler.config().fork_window_functions);
        debug!(
            query_id = %query.id,
            select = query.select.len(),
            group_by = query.group_by.len(),
            filters = query.filters.len(),
            join_on = query.join_on.len(),
            "compiled query"
        );
        Ok(query)
    }

    /// Filter formula for one operator spec; keeps the field id for BFB.
    pub fn compile_filter(&mut self, spec: &FilterSpec) -> Result<CompiledFormulaInfo> {
        let field_info = self.compiler.compile_field_formula(&spec.field_id)?;
        if let Some(arity) = spec.operator.arity() {
            if spec.values.len() != arity {
                return Err(LodqError::InvalidConfig(format!(
                    "filter {:?} on {} expects {arity} value(s), got {}",
                    spec.operator,
                    spec.field_id,
                    spec.values.len()
                )));
            }
        }
        for value in &spec.values {
            value.validate().map_err(|msg| {
                LodqError::InvalidConfig(format!("invalid filter value for {}: {msg}", spec.field_id))
            })?;
        }
        let expr = field_info.expr().clone();
        let lit = |i: usize| n::literal(spec.values[i].clone());
        let condition = match spec.operator {
            FilterOperator::Eq => n::binary("==", expr, lit(0)),
            FilterOperator::Ne => n::binary("!=", expr, lit(0)),
            FilterOperator::Gt => n::binary(">", expr, lit(0)),
            FilterOperator::Gte => n::binary(">=", expr, lit(0)),
            FilterOperator::Lt => n::binary("<", expr, lit(0)),
            FilterOperator::Lte => n::binary("<=", expr, lit(0)),
            FilterOperator::In | FilterOperator::NotIn => {
                let values = LiteralValue::Array(spec.values.clone());
                values.validate().map_err(|msg| {
                    LodqError::InvalidConfig(format!("invalid filter values for {}: {msg}", spec.field_id))
                })?;
                let op = if spec.operator == FilterOperator::In { "in" } else { "notin" };
                n::binary(op, expr, n::literal(values))
            }
            FilterOperator::IsNull => n::unary("isnull", expr),
            FilterOperator::IsNotNull => n::unary("isnotnull", expr),
            FilterOperator::Contains => n::func("contains", vec![expr, lit(0)]),
            FilterOperator::StartsWith => n::func("startswith", vec![expr, lit(0)]),
            FilterOperator::Between => n::ternary("between", expr, lit(0), lit(1)),
        };
        let formula = n::formula(condition);
        let alias = self.expression_alias(&formula);
        Ok(CompiledFormulaInfo::new(formula, Some(alias))
            .with_field_id(Some(spec.field_id.clone()))
            .with_avatar_ids(field_info.avatar_ids))
    }

    fn make_joined_from(
        &self,
        query: &CompiledQuery,
        root_avatar_id: Option<&AvatarId>,
        relations: &[AvatarRelation],
    ) -> Result<JoinedFromObject> {
        let columns = self.compiler.columns();
        let mut columns_by_avatar: BTreeMap<String, Vec<FromColumn>> = BTreeMap::new();
        for avatar_id in query.all_formulas().flat_map(|f| f.avatar_ids.iter()) {
            columns_by_avatar.entry(avatar_id.clone()).or_default();
        }
        for formula in query.all_formulas() {
            for name in used_fields(&formula.formula) {
                let Some(column) = columns.column_by_id(&name) else {
                    continue;
                };
                let entry = columns_by_avatar.entry(column.avatar_id.to_string()).or_default();
                if !entry.iter().any(|c| c.id == column.id) {
                    entry.push(FromColumn {
                        id: column.id.clone(),
                        name: column.name.clone(),
                    });
                }
            }
        }
        if columns_by_avatar.is_empty() {
            return Ok(JoinedFromObject::default());
        }

        let root = root_avatar_id
            .map(|id| id.to_string())
            .or_else(|| relations.first().map(|r| r.left_avatar_id.to_string()))
            .or_else(|| columns_by_avatar.keys().next().cloned())
            .ok_or_else(|| LodqError::Planning("no avatar to read from".to_string()))?;
        if columns_by_avatar.len() > 1 && relations.is_empty() {
            return Err(LodqError::Planning(format!(
                "avatars {:?} are used without relations",
                columns_by_avatar.keys().collect::<Vec<_>>()
            )));
        }

        let mut froms = Vec::with_capacity(columns_by_avatar.len());
        let root_columns = columns_by_avatar.remove(&root).unwrap_or_default();
        froms.push(FromObject::avatar(&root, root_columns));
        for (avatar_id, avatar_columns) in columns_by_avatar {
            froms.push(FromObject::avatar(&avatar_id, avatar_columns));
        }
        Ok(JoinedFromObject {
            root_from_id: Some(root),
            froms,
        })
    }
}

/// Relations needed to reach every used avatar: a relation is kept when
/// its right side is used, which in turn makes its left side used.
fn select_relations(relations: &[AvatarRelation], used_avatars: &BTreeSet<String>) -> Vec<AvatarRelation> {
    let mut used = used_avatars.clone();
    let mut selected: Vec<AvatarRelation> = Vec::new();
    loop {
        let before = selected.len();
        for relation in relations {
            if selected.contains(relation) {
                continue;
            }
            if used.contains(relation.right_avatar_id.as_str()) {
                used.insert(relation.left_avatar_id.to_string());
                selected.push(relation.clone());
            }
        }
        if selected.len() == before {
            break;
        }
    }
    selected
}

/// Apply `mutations` to every formula of every clause.
pub fn mutate_query_formulas(mut query: CompiledQuery, mutations: &[Box<dyn FormulaMutation>]) -> CompiledQuery {
    for part in [
        QueryPart::Select,
        QueryPart::GroupBy,
        QueryPart::Filters,
        QueryPart::OrderBy,
        QueryPart::JoinOn,
    ] {
        for formula in query.formula_list_mut(part) {
            let mutated = apply_mutations(&formula.formula, mutations);
            if !mutated.ptr_eq(&formula.formula) {
                formula.formula = mutated;
            }
        }
    }
    query
}

fn optimize_query(query: CompiledQuery) -> CompiledQuery {
    let mutations: Vec<Box<dyn FormulaMutation>> = vec![
        Box::new(CollapseNestedAggregationMutation),
        Box::new(OptimizeConstComparisonMutation),
        Box::new(OptimizeConstAndOrMutation),
    ];
    let mut query = mutate_query_formulas(query, &mutations);
    query
        .filters
        .retain(|f| f.expr().literal() != Some(&LiteralValue::Boolean(true)));
    query
}

fn fork_extended_aggregations(query: CompiledQuery, fork_windows: bool) -> CompiledQuery {
    let global_dims: Vec<Node> = query.group_by.iter().map(|f| f.expr().clone()).collect();
    let contains = |pred: &dyn Fn(&Node) -> bool| {
        query
            .all_formulas()
            .any(|f| f.formula.enumerate(None).any(|(_, node)| pred(node)))
    };
    let has_lookups = contains(&is_lookup_function);
    let has_lods = contains(&|node: &Node| {
        matches!(node.node_type(), NodeType::FuncCall) && has_non_default_lod(node)
    });
    let has_windows = query.all_formulas().any(|f| is_window_expression(&f.formula));

    let mut mutations: Vec<Box<dyn FormulaMutation>> = Vec::new();
    if has_lookups {
        mutations.push(Box::new(LookupToQueryForkMutation::new(
            global_dims.clone(),
            global_dims.is_empty(),
        )));
    }
    if has_lods {
        mutations.push(Box::new(LodToQueryForkMutation::new(global_dims.clone())));
    }
    if has_windows && fork_windows {
        mutations.push(Box::new(AggregationToQueryForkMutation::new(global_dims.clone())));
        mutations.push(Box::new(WindowToQueryForkMutation::new(global_dims)));
    }
    if has_windows || has_lookups || has_lods {
        mutations.push(Box::new(LevelTaggerMutation));
    }
    if mutations.is_empty() {
        return query;
    }
    mutate_query_formulas(query, &mutations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{
        BIField, ColumnInfo, FormulaParser, StaticColumnRegistry, StaticFieldRegistry,
    };
    use lodq_common::{CompilerConfig, FormulaError, FormulaErrorCode};
    use lodq_formula::{DataType, LodKind};

    #[derive(Default)]
    struct MapParser {
        formulas: HashMap<String, Node>,
    }

    impl MapParser {
        fn with(mut self, text: &str, expr: Node) -> Self {
            self.formulas.insert(text.to_string(), n::formula(expr));
            self
        }
    }

    impl FormulaParser for MapParser {
        fn parse(&self, text: &str) -> Result<Node> {
            self.formulas.get(text).cloned().ok_or_else(|| {
                LodqError::Parse(FormulaError::new(FormulaErrorCode::Parse, text.to_string()))
            })
        }
    }

    fn setup() -> (StaticFieldRegistry, StaticColumnRegistry, MapParser) {
        let columns = StaticColumnRegistry::new(vec![
            ColumnInfo::new("t", "city", DataType::String),
            ColumnInfo::new("t", "category", DataType::String),
            ColumnInfo::new("t", "sales", DataType::Float),
        ])
        .expect("columns");
        let parser = MapParser::default()
            .with("SUM([Sales])", n::func("sum", vec![n::field("Sales")]))
            .with(
                "SUM([Sales] FIXED [City])",
                n::func_full("sum", vec![n::field("Sales")], n::fixed(vec![n::field("City")]), vec![], &[]),
            );
        let fields = StaticFieldRegistry::new(vec![
            BIField::direct("city", "City", "t", "city"),
            BIField::direct("category", "Category", "t", "category"),
            BIField::direct("sales", "Sales", "t", "sales"),
            BIField::formula("ss", "Sales Sum", "SUM([Sales])"),
            BIField::formula("ssf", "Sales Sum Fixed City", "SUM([Sales] FIXED [City])"),
        ])
        .expect("fields");
        (fields, columns, parser)
    }

    #[test]
    fn select_aliases_are_shared_and_copies_get_suffix() {
        let (fields, columns, parser) = setup();
        let mut compiler = FormulaCompiler::new(&fields, &columns, &parser, CompilerConfig::default());
        let mut qc = QueryCompiler::new(&mut compiler);
        let query = qc
            .make_compiled_query(&QuerySpec {
                select: vec!["city".into(), "ss".into(), "city".into()],
                group_by: vec!["city".into()],
                ..Default::default()
            })
            .expect("query");
        let aliases: Vec<&str> = query.select.iter().map(|f| f.alias_str()).collect();
        assert_eq!(aliases, vec!["res_0", "res_1", "res_0_cp0"]);
        assert_eq!(query.group_by[0].alias_str(), "res_0");
        assert_eq!(query.id, BASE_QUERY_ID);
        assert_eq!(query.joined_from.root_from_id.as_deref(), Some("t"));
        assert_eq!(query.joined_from.froms[0].columns.len(), 2);
    }

    #[test]
    fn lod_aggregations_become_query_forks() {
        let (fields, columns, parser) = setup();
        let mut compiler = FormulaCompiler::new(&fields, &columns, &parser, CompilerConfig::default());
        let mut qc = QueryCompiler::new(&mut compiler);
        let query = qc
            .make_compiled_query(&QuerySpec {
                select: vec!["category".into(), "ssf".into()],
                group_by: vec!["category".into()],
                ..Default::default()
            })
            .expect("query");
        let fork = query.select[1].expr().clone();
        assert!(fork.is(NodeType::QueryFork));
        let (_, result_expr, lod, _, _) = fork.fork_parts().expect("fork");
        assert_eq!(lod.lod_kind(), Some(LodKind::Fixed));
        assert_eq!(result_expr.func_name(), Some("sum"));
    }

    #[test]
    fn filters_keep_field_ids_and_true_filters_are_dropped() {
        let (fields, columns, parser) = setup();
        let mut compiler = FormulaCompiler::new(&fields, &columns, &parser, CompilerConfig::default());
        let mut qc = QueryCompiler::new(&mut compiler);
        let query = qc
            .make_compiled_query(&QuerySpec {
                select: vec!["city".into()],
                filters: vec![
                    FilterSpec {
                        field_id: "city".into(),
                        operator: FilterOperator::In,
                        values: vec![
                            LiteralValue::String("a".into()),
                            LiteralValue::String("b".into()),
                        ],
                    },
                    FilterSpec {
                        field_id: "sales".into(),
                        operator: FilterOperator::Between,
                        values: vec![LiteralValue::Float(1.0), LiteralValue::Float(2.0)],
                    },
                ],
                ..Default::default()
            })
            .expect("query");
        assert_eq!(query.filters.len(), 2);
        assert_eq!(query.filters[0].original_field_id, Some(FieldId::from("city")));
        assert_eq!(query.filters[0].expr().operator(), Some("in"));
        assert_eq!(query.filters[1].expr().operator(), Some("between"));

        let dropped = optimize_query({
            let mut q = query.clone();
            q.filters.push(CompiledFormulaInfo::new(n::formula(n::lit_bool(true)), None));
            q
        });
        assert_eq!(dropped.filters.len(), 2);
    }

    #[test]
    fn filter_arity_is_checked() {
        let (fields, columns, parser) = setup();
        let mut compiler = FormulaCompiler::new(&fields, &columns, &parser, CompilerConfig::default());
        let mut qc = QueryCompiler::new(&mut compiler);
        let err = qc
            .compile_filter(&FilterSpec {
                field_id: "city".into(),
                operator: FilterOperator::Between,
                values: vec![LiteralValue::String("a".into())],
            })
            .expect_err("arity");
        assert!(matches!(err, LodqError::InvalidConfig(_)));
    }
}
