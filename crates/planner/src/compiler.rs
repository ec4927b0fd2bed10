//! Field formula compiler.
//!
//! A compiler instance is a request-scoped compilation session: it owns a
//! copy of the dataset fields, the request context (GROUP BY, ORDER BY,
//! parameter values) and per-field stage caches. Every field goes through
//! the stages of [`CompilationStage`] strictly in order; each stage result
//! (or the errors it produced) is cached independently.
//!
//! Error modes:
//! - [`ErrorMode::Raise`]: the errors of the first failing stage become a
//!   [`LodqError::FormulaHandling`]
//! - [`ErrorMode::Collect`]: errors are cached and `None` is returned

use lodq_common::{AvatarId, CompilerConfig, FieldId, FormulaError, FormulaErrorCode, LodqError, Result};
use lodq_formula::explain::to_text;
use lodq_formula::inspect::{is_aggregate_expression, is_aggregate_function, is_window_expression, used_fields};
use lodq_formula::mutation::{
    AmongToWithinGroupingMutation, CollapseNestedAggregationMutation,
    ConvertBlocksToFunctionsMutation, DefaultWindowOrderingMutation, IgnoreExtraWithinGroupingMutation,
    IgnoreParenthesisMutation, LookupDefaultBfbMutation, RemapBfbMutation,
};
use lodq_formula::optimization::{
    OptimizeConstAndOrMutation, OptimizeConstComparisonMutation, OptimizeConstMathMutation,
};
use lodq_formula::shortcuts as n;
use lodq_formula::types::infer_data_type;
use lodq_formula::validation::{collect_error_nodes, AggregationChecker, WindowFunctionChecker};
use lodq_formula::{
    apply_mutations, DataType, FormulaMutation, LiteralValue, Node, NodeExtract, NodeHierarchyIndex,
    NodeType, WindowGroupingKind,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, warn};

use crate::dependency::DependencyGraph;
use crate::primitives::{CompiledFormulaInfo, JoinSpec, OrderDirection};
use crate::registry::{
    AggregationFunction, AvatarRelation, BIField, CalcMode, ColumnRegistry, ConditionPart,
    FieldRegistry, FieldType, FormulaParser,
};

/// Field compilation stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompilationStage {
    Base,
    PreSubMutation,
    DepGeneration,
    Substitution,
    Casting,
    Aggregation,
    Mutation,
    Validation,
    Final,
}

impl CompilationStage {
    pub const ALL: [CompilationStage; 9] = [
        Self::Base,
        Self::PreSubMutation,
        Self::DepGeneration,
        Self::Substitution,
        Self::Casting,
        Self::Aggregation,
        Self::Mutation,
        Self::Validation,
        Self::Final,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::PreSubMutation => "pre_sub_mutation",
            Self::DepGeneration => "dep_generation",
            Self::Substitution => "substitution",
            Self::Casting => "casting",
            Self::Aggregation => "aggregation",
            Self::Mutation => "mutation",
            Self::Validation => "validation",
            Self::Final => "final",
        }
    }

    pub fn previous(&self) -> Option<CompilationStage> {
        let pos = Self::ALL.iter().position(|s| s == self)?;
        pos.checked_sub(1).map(|p| Self::ALL[p])
    }

    /// Stages whose result data type is recorded.
    fn saves_data_type(&self) -> bool {
        matches!(self, Self::Substitution | Self::Aggregation | Self::Final)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorMode {
    Raise,
    Collect,
}

/// Request-level inputs that influence field compilation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompilationContext {
    #[serde(default)]
    pub group_by_ids: Vec<FieldId>,
    #[serde(default)]
    pub order_by: Vec<(FieldId, OrderDirection)>,
    #[serde(default)]
    pub parameter_values: HashMap<FieldId, LiteralValue>,
}

/// Summary returned by [`FormulaCompiler::finish`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompilationReport {
    pub compiled_fields: usize,
    pub failed_fields: Vec<FieldId>,
}

type StageResult = std::result::Result<Node, Vec<FormulaError>>;

/// Per-field stage results, stage errors and data types.
#[derive(Debug, Default)]
struct StageCache {
    results: HashMap<FieldId, BTreeMap<CompilationStage, Node>>,
    errors: HashMap<FieldId, BTreeMap<CompilationStage, Vec<FormulaError>>>,
    data_types: HashMap<FieldId, BTreeMap<CompilationStage, DataType>>,
}

impl StageCache {
    fn result(&self, id: &FieldId, stage: CompilationStage) -> Option<&Node> {
        self.results.get(id)?.get(&stage)
    }

    fn errors(&self, id: &FieldId, stage: CompilationStage) -> Option<&Vec<FormulaError>> {
        self.errors.get(id)?.get(&stage)
    }

    /// Errors of the first failing stage.
    fn first_errors(&self, id: &FieldId) -> Vec<FormulaError> {
        self.errors
            .get(id)
            .and_then(|by_stage| by_stage.values().next().cloned())
            .unwrap_or_default()
    }

    fn data_type(&self, id: &FieldId, stage: CompilationStage) -> Option<DataType> {
        self.data_types.get(id)?.get(&stage).copied()
    }

    fn clear(&mut self, id: &FieldId) {
        self.results.remove(id);
        self.errors.remove(id);
        self.data_types.remove(id);
    }

    fn clear_all(&mut self) {
        self.results.clear();
        self.errors.clear();
        self.data_types.clear();
    }
}

fn error_node_from(message: &str, code: FormulaErrorCode, like: &Node) -> Node {
    n::error(message, code).with_meta(like.meta().clone())
}

fn wrap_call(formula: &Node, func_name: &str) -> Node {
    n::formula(n::func(func_name, vec![formula.expr().clone()]))
}

/// Formula compiler session.
pub struct FormulaCompiler<'a> {
    columns: &'a dyn ColumnRegistry,
    parser: &'a dyn FormulaParser,
    config: CompilerConfig,
    context: CompilationContext,
    fields: HashMap<FieldId, BIField>,
    titles: HashMap<String, FieldId>,
    stages: StageCache,
    deps: DependencyGraph,
    field_types: HashMap<FieldId, FieldType>,
    /// Auto-aggregated column id per direct field.
    auto_aggregated_columns: HashMap<FieldId, String>,
    parsed: HashMap<String, StageResult>,
    substituted_text: HashMap<NodeExtract, String>,
    in_progress: HashSet<(FieldId, CompilationStage)>,
    runtime_field_counter: usize,
}

impl std::fmt::Debug for FormulaCompiler<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormulaCompiler")
            .field("fields", &self.fields.len())
            .field("config", &self.config)
            .field("context", &self.context)
            .finish()
    }
}

impl<'a> FormulaCompiler<'a> {
    /// Start a session over all fields of `fields`.
    pub fn new(
        fields: &dyn FieldRegistry,
        columns: &'a dyn ColumnRegistry,
        parser: &'a dyn FormulaParser,
        config: CompilerConfig,
    ) -> Self {
        let mut compiler = Self {
            columns,
            parser,
            config,
            context: CompilationContext::default(),
            fields: HashMap::new(),
            titles: HashMap::new(),
            stages: StageCache::default(),
            deps: DependencyGraph::new(),
            field_types: HashMap::new(),
            auto_aggregated_columns: HashMap::new(),
            parsed: HashMap::new(),
            substituted_text: HashMap::new(),
            in_progress: HashSet::new(),
            runtime_field_counter: 0,
        };
        let all: Vec<BIField> = fields
            .field_ids()
            .iter()
            .filter_map(|id| fields.field_by_id(id).cloned())
            .collect();
        // Insert everything first so that title references resolve while
        // dependency edges are built.
        for field in &all {
            compiler.titles.insert(field.title.clone(), field.guid.clone());
            compiler.fields.insert(field.guid.clone(), field.clone());
        }
        for field in all {
            compiler.register_field(field);
        }
        compiler
    }

    /// Replace the request context; all cached stage results are dropped.
    pub fn with_context(mut self, context: CompilationContext) -> Self {
        self.set_context(context);
        self
    }

    pub fn set_context(&mut self, context: CompilationContext) {
        self.context = context;
        self.stages.clear_all();
        self.field_types.clear();
        self.substituted_text.clear();
    }

    pub fn context(&self) -> &CompilationContext {
        &self.context
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    pub fn columns(&self) -> &'a dyn ColumnRegistry {
        self.columns
    }

    pub fn field(&self, id: &FieldId) -> Result<&BIField> {
        self.fields
            .get(id)
            .ok_or_else(|| LodqError::UnknownField(id.to_string()))
    }

    pub fn field_by_title(&self, title: &str) -> Option<&BIField> {
        self.titles.get(title).and_then(|id| self.fields.get(id))
    }

    /// Field referenced by `name`: title first, then guid.
    fn resolve_reference(&self, name: &str) -> Option<FieldId> {
        if let Some(id) = self.titles.get(name) {
            return Some(id.clone());
        }
        let id = FieldId::from(name);
        self.fields.contains_key(&id).then_some(id)
    }

    // -----------------------------
    // Registration and invalidation
    // -----------------------------

    /// Add (or re-add) a field. Parse errors are cached, not raised.
    pub fn register_field(&mut self, field: BIField) {
        let id = field.guid.clone();
        self.auto_aggregated_columns.remove(&id);
        if let CalcMode::Direct { avatar_id, source } = &field.calc_mode {
            match self.columns.column(avatar_id, source) {
                Some(column) if column.has_auto_aggregation => {
                    self.auto_aggregated_columns.insert(id.clone(), column.id.clone());
                }
                Some(_) => {}
                None => warn!(
                    field_id = %id,
                    avatar_id = %avatar_id,
                    column = %source,
                    "unknown column for direct field"
                ),
            }
        }
        self.titles.insert(field.title.clone(), id.clone());
        self.fields.insert(id.clone(), field);

        if let Ok(base) = self.process(&id, CompilationStage::Base) {
            let deps: BTreeSet<FieldId> = used_fields(&base)
                .iter()
                .filter_map(|name| self.resolve_reference(name))
                .collect();
            self.deps.set_dependencies(&id, deps);
        }
    }

    /// Remove a field and invalidate everything that depends on it.
    pub fn unregister_field(&mut self, id: &FieldId) {
        if !self.fields.contains_key(id) {
            return;
        }
        self.uncache_field(id);
        self.deps.clear_dependencies(id);
        self.auto_aggregated_columns.remove(id);
        if let Some(field) = self.fields.remove(id) {
            if self.titles.get(&field.title) == Some(id) {
                self.titles.remove(&field.title);
            }
        }
    }

    /// Replace a field definition; dependents are recompiled on demand.
    pub fn update_field(&mut self, field: BIField) {
        let id = field.guid.clone();
        self.unregister_field(&id);
        self.register_field(field);
    }

    /// Drop cached stages of `id` and of every field depending on it.
    pub fn uncache_field(&mut self, id: &FieldId) {
        for dependent in self.deps.dependents_closure(id) {
            if self.config.verbose_logging {
                debug!(field_id = %dependent, "uncaching field");
            }
            self.stages.clear(&dependent);
            self.field_types.remove(&dependent);
        }
    }

    /// Register a runtime formula field.
    pub fn make_formula_field(&mut self, text: &str) -> BIField {
        let guid = self.next_runtime_id();
        let field = BIField::formula(&guid, &guid, text);
        self.register_field(field.clone());
        field
    }

    /// Register a runtime field over an avatar column.
    pub fn make_direct_field(&mut self, avatar_id: &AvatarId, source: &str) -> Result<BIField> {
        let column = self.columns.column(avatar_id, source).ok_or_else(|| {
            LodqError::InvalidConfig(format!("unknown column {source} of avatar {avatar_id}"))
        })?;
        let guid = self.next_runtime_id();
        let mut field = BIField::direct(&guid, &guid, avatar_id.as_str(), source);
        field.cast = Some(column.data_type);
        self.register_field(field.clone());
        Ok(field)
    }

    fn next_runtime_id(&mut self) -> String {
        loop {
            let guid = format!("__runtime_{}", self.runtime_field_counter);
            self.runtime_field_counter += 1;
            if !self.fields.contains_key(&FieldId::from(guid.as_str())) && !self.titles.contains_key(&guid) {
                return guid;
            }
        }
    }

    // -----------------------------
    // Public compilation API
    // -----------------------------

    /// Result of `stage` for a field.
    pub fn compile_stage(
        &mut self,
        id: &FieldId,
        stage: CompilationStage,
        mode: ErrorMode,
    ) -> Result<Option<Node>> {
        let title = self.field(id)?.title.clone();
        match self.process(id, stage) {
            Ok(node) => Ok(Some(node)),
            Err(errors) => match mode {
                ErrorMode::Collect => Ok(None),
                ErrorMode::Raise => Err(LodqError::FormulaHandling {
                    field: title,
                    field_id: id.to_string(),
                    errors,
                }),
            },
        }
    }

    /// Final formula of a field; alias and original field id are its guid.
    pub fn compile_field_formula(&mut self, id: &FieldId) -> Result<CompiledFormulaInfo> {
        let formula = self
            .compile_stage(id, CompilationStage::Final, ErrorMode::Raise)?
            .ok_or_else(|| LodqError::UnknownField(id.to_string()))?;
        let avatar_ids = self.used_avatar_ids(&formula);
        Ok(CompiledFormulaInfo::new(formula, Some(id.to_string()))
            .with_field_id(Some(id.clone()))
            .with_avatar_ids(avatar_ids))
    }

    /// Compile free formula text through a runtime field.
    pub fn compile_text_formula(&mut self, text: &str) -> Result<CompiledFormulaInfo> {
        let field = self.make_formula_field(text);
        let formula = self
            .compile_stage(&field.guid, CompilationStage::Final, ErrorMode::Raise)?
            .ok_or_else(|| LodqError::UnknownField(field.guid.to_string()))?;
        let avatar_ids = self.used_avatar_ids(&formula);
        Ok(CompiledFormulaInfo::new(formula, Some(field.guid.to_string())).with_avatar_ids(avatar_ids))
    }

    /// JOIN ON formula of an avatar relation: conditions joined with `and`.
    pub fn compile_relation_formula(&mut self, relation: &AvatarRelation) -> Result<CompiledFormulaInfo> {
        if relation.conditions.is_empty() {
            return Err(LodqError::InvalidConfig(
                "Relation requires at least one condition".to_string(),
            ));
        }
        let mut parts = Vec::with_capacity(relation.conditions.len());
        for condition in &relation.conditions {
            let left = self.compile_condition_part(&relation.left_avatar_id, &condition.left)?;
            let right = self.compile_condition_part(&relation.right_avatar_id, &condition.right)?;
            parts.push(n::binary(condition.operator.as_str(), left, right));
        }
        let mut parts = parts.into_iter();
        let first = parts
            .next()
            .ok_or_else(|| LodqError::InvalidConfig("Relation requires at least one condition".to_string()))?;
        let formula = n::formula(parts.fold(first, |acc, part| n::binary("and", acc, part)));
        let avatar_ids = self.used_avatar_ids(&formula);
        Ok(CompiledFormulaInfo::new(formula, None)
            .with_avatar_ids(avatar_ids)
            .with_join(JoinSpec {
                left_id: relation.left_avatar_id.to_string(),
                right_id: relation.right_avatar_id.to_string(),
                join_type: relation.join_type,
            }))
    }

    fn compile_condition_part(&mut self, avatar_id: &AvatarId, part: &ConditionPart) -> Result<Node> {
        let (field_id, aggregated) = match part {
            ConditionPart::ResultField { field_id } => {
                let aggregated = self.get_field_type(field_id)? == FieldType::Measure;
                (field_id.clone(), aggregated)
            }
            ConditionPart::Direct { source } => {
                let field = self.make_direct_field(avatar_id, source)?;
                let aggregated = self.field_has_auto_aggregation(&field.guid);
                (field.guid, aggregated)
            }
            ConditionPart::Formula { text } => {
                let field = self.make_formula_field(text);
                let aggregated = self.field_has_auto_aggregation(&field.guid);
                (field.guid, aggregated)
            }
        };
        if aggregated {
            return Err(LodqError::Unsupported(
                "Joining over aggregated expressions is not supported".to_string(),
            ));
        }
        let formula = self
            .compile_stage(&field_id, CompilationStage::Final, ErrorMode::Raise)?
            .ok_or_else(|| LodqError::UnknownField(field_id.to_string()))?;
        Ok(formula.expr().clone())
    }

    /// Errors of the first failing stage, compiling the field if needed.
    pub fn get_field_errors(&mut self, id: &FieldId) -> Vec<FormulaError> {
        let _ = self.process(id, CompilationStage::Final);
        self.stages.first_errors(id)
    }

    pub fn is_field_valid(&mut self, id: &FieldId) -> bool {
        self.get_field_errors(id).is_empty()
    }

    /// Dimension or measure, derived at the aggregation stage.
    pub fn get_field_type(&mut self, id: &FieldId) -> Result<FieldType> {
        self.field(id)?;
        let _ = self.process(id, CompilationStage::Aggregation);
        Ok(self.field_types.get(id).copied().unwrap_or(FieldType::Dimension))
    }

    /// Data type recorded at the substitution, aggregation or final stage.
    pub fn get_field_data_type(&mut self, id: &FieldId, stage: CompilationStage) -> Option<DataType> {
        let _ = self.process(id, stage);
        self.stages.data_type(id, stage)
    }

    /// Whether the field's expression (before explicit aggregation) is
    /// already aggregated.
    pub fn field_has_auto_aggregation(&mut self, id: &FieldId) -> bool {
        match self.process(id, CompilationStage::Casting) {
            Ok(node) => {
                is_aggregate_expression(&node)
                    || used_fields(&node)
                        .iter()
                        .any(|name| self.auto_aggregated_columns.values().any(|column| column == name))
            }
            Err(_) => false,
        }
    }

    /// Source text of a node, falling back to rendering it.
    pub fn get_node_text(&self, node: &Node) -> String {
        if let Some(text) = &node.meta().original_text {
            return text.clone();
        }
        if let Some(text) = node.extract().and_then(|e| self.substituted_text.get(e)) {
            return text.clone();
        }
        to_text(node)
    }

    /// End the session.
    pub fn finish(self) -> CompilationReport {
        let compiled_fields = self
            .stages
            .results
            .values()
            .filter(|by_stage| by_stage.contains_key(&CompilationStage::Final))
            .count();
        let mut failed_fields: Vec<FieldId> = self
            .stages
            .errors
            .iter()
            .filter(|(_, by_stage)| !by_stage.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        failed_fields.sort();
        debug!(
            compiled_fields,
            failed_fields = failed_fields.len(),
            "formula compilation session finished"
        );
        CompilationReport {
            compiled_fields,
            failed_fields,
        }
    }

    /// Avatars of the columns referenced by `formula`.
    pub fn used_avatar_ids(&self, formula: &Node) -> BTreeSet<String> {
        used_fields(formula)
            .iter()
            .filter_map(|name| self.columns.column_by_id(name))
            .map(|column| column.avatar_id.to_string())
            .collect()
    }

    // -----------------------------
    // Stage machinery
    // -----------------------------

    fn process(&mut self, id: &FieldId, stage: CompilationStage) -> StageResult {
        if let Some(node) = self.stages.result(id, stage) {
            return Ok(node.clone());
        }
        if let Some(errors) = self.stages.errors(id, stage) {
            return Err(errors.clone());
        }
        let Some(field) = self.fields.get(id).cloned() else {
            return Err(vec![FormulaError::new(
                FormulaErrorCode::UnknownField,
                format!("Unknown field: {id}"),
            )]);
        };
        let key = (id.clone(), stage);
        if !self.in_progress.insert(key.clone()) {
            return Err(vec![FormulaError::new(
                FormulaErrorCode::Recursion,
                format!("Recursion detected in field {}", field.title),
            )]);
        }

        let (outcome, own_failure) = match stage.previous() {
            None => (self.stage_base(&field), true),
            Some(previous) => match self.process(id, previous) {
                Ok(node) => (self.run_stage(&field, stage, node), true),
                Err(errors) => (Err(errors), false),
            },
        };
        self.in_progress.remove(&key);

        match &outcome {
            Ok(node) => {
                if stage.saves_data_type() {
                    let data_type = self.infer(node);
                    self.stages
                        .data_types
                        .entry(id.clone())
                        .or_default()
                        .insert(stage, data_type);
                }
                self.stages
                    .results
                    .entry(id.clone())
                    .or_default()
                    .insert(stage, node.clone());
                if self.config.verbose_logging {
                    debug!(field_id = %id, stage = stage.as_str(), "stage compiled");
                }
            }
            Err(errors) if own_failure => {
                debug!(
                    field_id = %id,
                    field = %field.title,
                    stage = stage.as_str(),
                    errors = errors.len(),
                    "formula handling errors"
                );
                self.stages
                    .errors
                    .entry(id.clone())
                    .or_default()
                    .insert(stage, errors.clone());
            }
            Err(_) => {}
        }
        outcome
    }

    fn run_stage(&mut self, field: &BIField, stage: CompilationStage, node: Node) -> StageResult {
        match stage {
            CompilationStage::Base => self.stage_base(field),
            CompilationStage::PreSubMutation => Ok(self.stage_pre_sub_mutation(&node)),
            CompilationStage::DepGeneration => self.stage_dep_generation(field, node),
            CompilationStage::Substitution => self.stage_substitution(node),
            CompilationStage::Casting => self.stage_casting(field, node),
            CompilationStage::Aggregation => Ok(self.stage_aggregation(field, node)),
            CompilationStage::Mutation => Ok(self.stage_mutation(field, node)),
            CompilationStage::Validation => self.stage_validation(field, node),
            CompilationStage::Final => Ok(node),
        }
    }

    fn infer(&self, node: &Node) -> DataType {
        let columns = self.columns;
        infer_data_type(node, &|name| columns.column_by_id(name).map(|c| c.data_type))
    }

    fn stage_base(&mut self, field: &BIField) -> StageResult {
        match &field.calc_mode {
            CalcMode::Formula { text } => self.parse(text),
            CalcMode::Direct { avatar_id, source } => {
                let expr = match self.columns.column(avatar_id, source) {
                    Some(column) => n::field(&column.id),
                    None => n::error(
                        &format!("Unknown column {source} of avatar {avatar_id}"),
                        FormulaErrorCode::UnknownField,
                    ),
                };
                Ok(n::formula(expr))
            }
            CalcMode::Parameter {
                default_value,
                value_constraint,
            } => {
                let cast = match field.cast {
                    Some(cast) if cast.is_parameter_type() => cast,
                    other => {
                        let typename = other.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string());
                        return Err(vec![FormulaError::new(
                            FormulaErrorCode::ParameterUnsupportedType,
                            format!("Unsupported type {typename} for parameter {}", field.title),
                        )]);
                    }
                };
                let value = self
                    .context
                    .parameter_values
                    .get(&field.guid)
                    .or(default_value.as_ref())
                    .cloned()
                    .ok_or_else(|| {
                        vec![FormulaError::new(
                            FormulaErrorCode::ParameterValue,
                            format!("No value can be found for parameter field {}", field.title),
                        )]
                    })?;
                if let Some(constraint) = value_constraint {
                    if !constraint.is_satisfied_by(&value) {
                        return Err(vec![FormulaError::new(
                            FormulaErrorCode::ParameterValue,
                            format!("Invalid parameter value {value:?} for constraint {constraint:?}"),
                        )]);
                    }
                }
                let value = match (cast, value) {
                    (DataType::Float, LiteralValue::Integer(v)) => LiteralValue::Float(v as f64),
                    (_, value) => value,
                };
                let invalid = || {
                    vec![FormulaError::new(
                        FormulaErrorCode::ParameterValue,
                        format!("Invalid parameter value for type {cast}"),
                    )]
                };
                if DataType::of_literal(&value) != cast || value.validate().is_err() {
                    return Err(invalid());
                }
                Ok(n::formula(n::literal(value)))
            }
        }
    }

    fn parse(&mut self, text: &str) -> StageResult {
        if let Some(cached) = self.parsed.get(text) {
            return cached.clone();
        }
        let result = match self.parser.parse(text) {
            Ok(node) if node.is(NodeType::Formula) => Ok(node),
            Ok(node) => Ok(n::formula(node)),
            Err(err) => {
                let errors = err.formula_errors().to_vec();
                if errors.is_empty() {
                    Err(vec![FormulaError::new(FormulaErrorCode::Parse, err.to_string())])
                } else {
                    Err(errors)
                }
            }
        };
        self.parsed.insert(text.to_string(), result.clone());
        result
    }

    fn stage_pre_sub_mutation(&self, node: &Node) -> Node {
        let default_order_by: Vec<Node> = self
            .context
            .order_by
            .iter()
            .filter_map(|(id, direction)| {
                let title = &self.fields.get(id)?.title;
                Some(match direction {
                    OrderDirection::Asc => n::field(title),
                    OrderDirection::Desc => n::desc(n::field(title)),
                })
            })
            .collect();
        let title_to_id: HashMap<String, String> = self
            .titles
            .iter()
            .map(|(title, id)| (title.clone(), id.to_string()))
            .collect();
        let mutations: Vec<Box<dyn FormulaMutation>> = vec![
            Box::new(IgnoreParenthesisMutation),
            Box::new(ConvertBlocksToFunctionsMutation),
            Box::new(DefaultWindowOrderingMutation::new(default_order_by)),
            Box::new(LookupDefaultBfbMutation),
            Box::new(RemapBfbMutation::new(title_to_id)),
        ];
        apply_mutations(node, &mutations)
    }

    fn stage_dep_generation(&mut self, field: &BIField, node: Node) -> StageResult {
        if !matches!(field.calc_mode, CalcMode::Formula { .. }) {
            return Ok(node);
        }
        let deps: BTreeSet<FieldId> = used_fields(&node)
            .iter()
            .filter_map(|name| self.resolve_reference(name))
            .collect();
        self.deps.set_dependencies(&field.guid, deps);
        if self.deps.has_cycle_from(&field.guid) {
            return Err(vec![FormulaError::new(
                FormulaErrorCode::Recursion,
                format!("Recursion detected in field {}", field.title),
            )]);
        }
        Ok(node)
    }

    fn stage_substitution(&mut self, node: Node) -> StageResult {
        let references: Vec<(NodeHierarchyIndex, Node, bool)> = node
            .enumerate(None)
            .filter(|(_, sub)| sub.is(NodeType::Field))
            .map(|(idx, sub)| {
                let path = node.iter_index(&idx);
                let inside_aggregate = path[..path.len().saturating_sub(1)]
                    .iter()
                    .any(|ancestor| is_aggregate_function(ancestor));
                (idx, sub.clone(), inside_aggregate)
            })
            .collect();

        let mut replacements = BTreeMap::new();
        let mut errors = Vec::new();
        for (idx, field_node, inside_aggregate) in references {
            let name = field_node.field_name().unwrap_or_default();
            let Some(child_id) = self.resolve_reference(name) else {
                if self.columns.column_by_id(name).is_none() {
                    replacements.insert(
                        idx,
                        error_node_from(
                            &format!("Unknown field found in formula: {name}"),
                            FormulaErrorCode::UnknownField,
                            &field_node,
                        ),
                    );
                }
                continue;
            };
            let declares_aggregation = self
                .fields
                .get(&child_id)
                .is_some_and(|child| child.aggregation != AggregationFunction::None);
            let stage = if self.config.suppress_double_aggregation && declares_aggregation && inside_aggregate {
                CompilationStage::Casting
            } else {
                CompilationStage::Aggregation
            };
            match self.process(&child_id, stage) {
                Ok(child) => {
                    let sub_node = child.expr().clone();
                    if let (Some(extract), Some(text)) = (sub_node.extract(), &field_node.meta().original_text) {
                        self.substituted_text.insert(extract.clone(), text.clone());
                    }
                    replacements.insert(idx, sub_node);
                }
                Err(child_errors) => {
                    for error in child_errors {
                        if !errors.contains(&error) {
                            errors.push(error);
                        }
                    }
                }
            }
        }
        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(node.substitute_batch(&replacements))
    }

    fn stage_casting(&mut self, field: &BIField, node: Node) -> StageResult {
        let Some(cast) = field.cast else {
            return Ok(node);
        };
        let current = self
            .stages
            .data_type(&field.guid, CompilationStage::Substitution)
            .unwrap_or(DataType::Unsupported);
        if matches!(current, DataType::Null | DataType::Unsupported) || current == cast {
            return Ok(node);
        }
        match cast.cast_function() {
            Some(func_name) => Ok(wrap_call(&node, func_name)),
            None => Err(vec![FormulaError::new(
                FormulaErrorCode::Cast,
                format!("Unsupported cast to {cast} for field {}", field.title),
            )]),
        }
    }

    fn stage_aggregation(&mut self, field: &BIField, node: Node) -> Node {
        let node = match field.aggregation.func_name() {
            Some(func_name) => wrap_call(&node, func_name),
            None => node,
        };
        let field_type = if is_aggregate_expression(&node) {
            FieldType::Measure
        } else {
            FieldType::Dimension
        };
        self.field_types.insert(field.guid.clone(), field_type);
        node
    }

    /// Request GROUP BY expressions at `stage`, sorted by field id; fields
    /// that fail to compile are skipped.
    fn global_dimensions(&mut self, stage: CompilationStage) -> Vec<Node> {
        let mut ids = self.context.group_by_ids.clone();
        ids.sort();
        ids.dedup();
        ids.iter()
            .filter_map(|id| self.process(id, stage).ok())
            .map(|node| node.expr().clone())
            .collect()
    }

    fn stage_mutation(&mut self, field: &BIField, node: Node) -> Node {
        let mut mutations: Vec<Box<dyn FormulaMutation>> = vec![
            Box::new(OptimizeConstMathMutation),
            Box::new(OptimizeConstComparisonMutation),
            Box::new(OptimizeConstAndOrMutation),
            Box::new(CollapseNestedAggregationMutation),
        ];
        let is_dimension = self.field_types.get(&field.guid) == Some(&FieldType::Dimension);
        if !is_dimension && is_window_expression(&node) {
            let dimensions = if self.config.mock_among_dimensions {
                node.visit_node_type(NodeType::WindowGrouping)
                    .filter(|g| g.grouping_kind() == Some(WindowGroupingKind::Among))
                    .flat_map(|g| g.children().iter().cloned())
                    .collect()
            } else {
                self.global_dimensions(CompilationStage::Aggregation)
            };
            let ignore_extra = IgnoreExtraWithinGroupingMutation::new(&dimensions);
            mutations.push(Box::new(AmongToWithinGroupingMutation::new(dimensions)));
            mutations.push(Box::new(ignore_extra));
        }
        apply_mutations(&node, &mutations)
    }

    fn stage_validation(&mut self, field: &BIField, node: Node) -> StageResult {
        let mut errors = collect_error_nodes(&node);
        let is_dimension = self.field_types.get(&field.guid) == Some(&FieldType::Dimension);
        if !is_dimension {
            let dimensions = self.global_dimensions(CompilationStage::Mutation);
            errors.extend(AggregationChecker::new(&dimensions).check(&node));
        }
        errors.extend(WindowFunctionChecker::new(self.config.allow_nested_window_functions).check(&node));
        if errors.is_empty() {
            Ok(node)
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ColumnInfo, StaticColumnRegistry, StaticFieldRegistry, ValueConstraint};
    use lodq_formula::shortcuts as n;

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
                LodqError::Parse(FormulaError::new(FormulaErrorCode::Parse, format!("cannot parse {text}")))
            })
        }
    }

    fn columns() -> StaticColumnRegistry {
        StaticColumnRegistry::new(vec![
            ColumnInfo::new("t", "city", DataType::String),
            ColumnInfo::new("t", "sales", DataType::Float),
            ColumnInfo::new("t", "qty", DataType::Integer),
        ])
        .expect("columns")
    }

    fn fields(extra: Vec<BIField>) -> StaticFieldRegistry {
        let mut all = vec![
            BIField::direct("city", "City", "t", "city"),
            BIField::direct("sales", "Sales", "t", "sales"),
        ];
        all.extend(extra);
        StaticFieldRegistry::new(all).expect("fields")
    }

    #[test]
    fn stage_order_is_strict() {
        assert_eq!(CompilationStage::Base.previous(), None);
        assert_eq!(
            CompilationStage::Final.previous(),
            Some(CompilationStage::Validation)
        );
        assert!(CompilationStage::Substitution < CompilationStage::Casting);
    }

    #[test]
    fn direct_field_compiles_to_column_reference() {
        let cols = columns();
        let parser = MapParser::default();
        let mut compiler = FormulaCompiler::new(&fields(vec![]), &cols, &parser, CompilerConfig::default());
        let info = compiler.compile_field_formula(&"city".into()).expect("compile");
        assert_eq!(info.formula, n::formula(n::field("t.city")));
        assert_eq!(info.alias.as_deref(), Some("city"));
        assert_eq!(info.avatar_ids.iter().collect::<Vec<_>>(), vec!["t"]);
        assert_eq!(compiler.get_field_type(&"city".into()).expect("type"), FieldType::Dimension);
    }

    #[test]
    fn formula_fields_substitute_references_and_cache() {
        let cols = columns();
        let parser = MapParser::default().with("SUM([Sales])", n::func("sum", vec![n::field("Sales")]));
        let registry = fields(vec![BIField::formula("ss", "Sales Sum", "SUM([Sales])")]);
        let mut compiler = FormulaCompiler::new(&registry, &cols, &parser, CompilerConfig::default());
        let first = compiler
            .compile_stage(&"ss".into(), CompilationStage::Final, ErrorMode::Raise)
            .expect("compile")
            .expect("node");
        assert_eq!(first, n::formula(n::func("sum", vec![n::field("t.sales")])));
        let second = compiler
            .compile_stage(&"ss".into(), CompilationStage::Final, ErrorMode::Raise)
            .expect("compile")
            .expect("node");
        assert!(first.ptr_eq(&second));
        assert_eq!(compiler.get_field_type(&"ss".into()).expect("type"), FieldType::Measure);
        assert_eq!(
            compiler.get_field_data_type(&"ss".into(), CompilationStage::Final),
            Some(DataType::Float)
        );
    }

    #[test]
    fn mutual_references_are_recursion_errors() {
        let cols = columns();
        let parser = MapParser::default()
            .with("[B] + 1", n::binary("+", n::field("B"), n::lit_int(1)))
            .with("[A] * 2", n::binary("*", n::field("A"), n::lit_int(2)));
        let registry = fields(vec![
            BIField::formula("a", "A", "[B] + 1"),
            BIField::formula("b", "B", "[A] * 2"),
        ]);
        let mut compiler = FormulaCompiler::new(&registry, &cols, &parser, CompilerConfig::default());
        for id in ["a", "b"] {
            let err = compiler.compile_field_formula(&id.into()).expect_err("recursion");
            assert!(err
                .formula_errors()
                .iter()
                .any(|e| e.code == FormulaErrorCode::Recursion));
        }
    }

    #[test]
    fn nested_same_aggregation_collapses() {
        let cols = columns();
        let parser = MapParser::default()
            .with("SUM(SUM([Sales]))", n::func("sum", vec![n::func("sum", vec![n::field("Sales")])]))
            .with("SUM([Sales])", n::func("sum", vec![n::field("Sales")]));
        let registry = fields(vec![
            BIField::formula("nested", "Nested", "SUM(SUM([Sales]))"),
            BIField::formula("plain", "Plain", "SUM([Sales])"),
        ]);
        let mut compiler = FormulaCompiler::new(&registry, &cols, &parser, CompilerConfig::default());
        let nested = compiler
            .compile_stage(&"nested".into(), CompilationStage::Mutation, ErrorMode::Raise)
            .expect("compile")
            .expect("node");
        let plain = compiler
            .compile_stage(&"plain".into(), CompilationStage::Mutation, ErrorMode::Raise)
            .expect("compile")
            .expect("node");
        assert_eq!(nested.extract(), plain.extract());
    }

    #[test]
    fn double_aggregation_is_suppressed_for_declared_aggregations() {
        let cols = columns();
        let parser = MapParser::default().with("AVG([Total])", n::func("avg", vec![n::field("Total")]));
        let registry = fields(vec![
            BIField::direct("total", "Total", "t", "sales").with_aggregation(AggregationFunction::Sum),
            BIField::formula("avg", "Avg Total", "AVG([Total])"),
        ]);
        let mut compiler = FormulaCompiler::new(&registry, &cols, &parser, CompilerConfig::default());
        let info = compiler.compile_field_formula(&"avg".into()).expect("compile");
        assert_eq!(info.formula, n::formula(n::func("avg", vec![n::field("t.sales")])));
    }

    #[test]
    fn unknown_references_become_errors() {
        let cols = columns();
        let parser = MapParser::default().with("[Nope] + 1", n::binary("+", n::field("Nope"), n::lit_int(1)));
        let registry = fields(vec![BIField::formula("bad", "Bad", "[Nope] + 1")]);
        let mut compiler = FormulaCompiler::new(&registry, &cols, &parser, CompilerConfig::default());
        let errors = compiler.get_field_errors(&"bad".into());
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, FormulaErrorCode::UnknownField);
        assert_eq!(errors[0].message, "Unknown field found in formula: Nope");
        assert!(!compiler.is_field_valid(&"bad".into()));
        let collected = compiler
            .compile_stage(&"bad".into(), CompilationStage::Final, ErrorMode::Collect)
            .expect("collect mode");
        assert!(collected.is_none());
    }

    #[test]
    fn parse_errors_are_collected_at_registration() {
        let cols = columns();
        let parser = MapParser::default();
        let registry = fields(vec![BIField::formula("p", "P", "SUM(")]);
        let mut compiler = FormulaCompiler::new(&registry, &cols, &parser, CompilerConfig::default());
        let errors = compiler.get_field_errors(&"p".into());
        assert_eq!(errors[0].code, FormulaErrorCode::Parse);
    }

    #[test]
    fn casting_wraps_mismatched_types() {
        let cols = columns();
        let parser = MapParser::default();
        let registry = fields(vec![
            BIField::direct("qty_str", "Qty Str", "t", "qty").with_cast(DataType::String),
            BIField::direct("qty_int", "Qty Int", "t", "qty").with_cast(DataType::Integer),
        ]);
        let mut compiler = FormulaCompiler::new(&registry, &cols, &parser, CompilerConfig::default());
        let cast = compiler.compile_field_formula(&"qty_str".into()).expect("compile");
        assert_eq!(cast.formula, n::formula(n::func("str", vec![n::field("t.qty")])));
        let same = compiler.compile_field_formula(&"qty_int".into()).expect("compile");
        assert_eq!(same.formula, n::formula(n::field("t.qty")));
    }

    #[test]
    fn parameters_use_request_value_and_constraints() {
        let cols = columns();
        let parser = MapParser::default();
        let registry = fields(vec![BIField::parameter(
            "limit",
            "Limit",
            DataType::Integer,
            LiteralValue::Integer(5),
        )
        .with_value_constraint(ValueConstraint::Range {
            min: Some(LiteralValue::Integer(1)),
            max: Some(LiteralValue::Integer(10)),
        })]);
        let mut compiler = FormulaCompiler::new(&registry, &cols, &parser, CompilerConfig::default());
        let default = compiler.compile_field_formula(&"limit".into()).expect("default");
        assert_eq!(default.formula, n::formula(n::lit_int(5)));

        let mut context = CompilationContext::default();
        context
            .parameter_values
            .insert("limit".into(), LiteralValue::Integer(50));
        compiler.set_context(context);
        let errors = compiler.get_field_errors(&"limit".into());
        assert_eq!(errors[0].code, FormulaErrorCode::ParameterValue);
    }

    #[test]
    fn update_field_invalidates_dependents() {
        let cols = columns();
        let parser = MapParser::default()
            .with("[Sales] * 2", n::binary("*", n::field("Sales"), n::lit_int(2)))
            .with("[Double] + 1", n::binary("+", n::field("Double"), n::lit_int(1)))
            .with("[Sales] * 3", n::binary("*", n::field("Sales"), n::lit_int(3)));
        let registry = fields(vec![
            BIField::formula("double", "Double", "[Sales] * 2"),
            BIField::formula("plus", "Plus", "[Double] + 1"),
        ]);
        let mut compiler = FormulaCompiler::new(&registry, &cols, &parser, CompilerConfig::default());
        let before = compiler.compile_field_formula(&"plus".into()).expect("compile");
        compiler.update_field(BIField::formula("double", "Double", "[Sales] * 3"));
        let after = compiler.compile_field_formula(&"plus".into()).expect("compile");
        assert_ne!(before.formula, after.formula);
        assert_eq!(
            after.formula,
            n::formula(n::binary(
                "+",
                n::binary("*", n::field("t.sales"), n::lit_int(3)),
                n::lit_int(1)
            ))
        );
    }

    #[test]
    fn relation_formula_joins_conditions() {
        use crate::primitives::JoinType;
        use crate::registry::{JoinOperator, RelationCondition};

        let cols = StaticColumnRegistry::new(vec![
            ColumnInfo::new("t", "city", DataType::String),
            ColumnInfo::new("d", "city", DataType::String),
        ])
        .expect("columns");
        let parser = MapParser::default();
        let registry = StaticFieldRegistry::default();
        let mut compiler = FormulaCompiler::new(&registry, &cols, &parser, CompilerConfig::default());
        let relation = AvatarRelation {
            left_avatar_id: "t".into(),
            right_avatar_id: "d".into(),
            join_type: JoinType::Left,
            conditions: vec![RelationCondition {
                left: ConditionPart::Direct { source: "city".into() },
                right: ConditionPart::Direct { source: "city".into() },
                operator: JoinOperator::Eq,
            }],
        };
        let info = compiler.compile_relation_formula(&relation).expect("relation");
        assert_eq!(
            info.formula,
            n::formula(n::binary("_==", n::field("t.city"), n::field("d.city")))
        );
        let join = info.join.expect("join spec");
        assert_eq!((join.left_id.as_str(), join.right_id.as_str()), ("t", "d"));
        assert_eq!(info.avatar_ids.len(), 2);

        let empty = AvatarRelation {
            conditions: vec![],
            ..relation
        };
        assert!(matches!(
            compiler.compile_relation_formula(&empty),
            Err(LodqError::InvalidConfig(_))
        ));
    }

    #[test]
    fn among_becomes_within_request_dimensions() {
        let cols = columns();
        let win = n::window_full(
            "rsum",
            vec![n::func("sum", vec![n::field("Sales")])],
            vec![],
            n::among(vec![n::field("City")]),
            &[],
        );
        let parser = MapParser::default().with("RSUM", win);
        let registry = fields(vec![BIField::formula("rs", "Running", "RSUM")]);
        let mut compiler = FormulaCompiler::new(&registry, &cols, &parser, CompilerConfig::default())
            .with_context(CompilationContext {
                group_by_ids: vec!["city".into()],
                ..Default::default()
            });
        let node = compiler
            .compile_stage(&"rs".into(), CompilationStage::Mutation, ErrorMode::Raise)
            .expect("compile")
            .expect("node");
        let grouping = node
            .visit_node_type(NodeType::WindowGrouping)
            .next()
            .cloned()
            .expect("grouping");
        assert_eq!(grouping.grouping_kind(), Some(WindowGroupingKind::Within));
        assert!(grouping.children().is_empty());
        let report = compiler.finish();
        assert!(report.failed_fields.is_empty());
    }

    #[test]
    fn unregistered_field_forgets_auto_aggregated_column() {
        let mut total = ColumnInfo::new("t", "total", DataType::Float);
        total.has_auto_aggregation = true;
        let cols = StaticColumnRegistry::new(vec![ColumnInfo::new("t", "city", DataType::String), total])
            .expect("columns");
        let parser = MapParser::default().with("[t.total]", n::field("t.total"));
        let registry = StaticFieldRegistry::new(vec![
            BIField::direct("total", "Total", "t", "total"),
            BIField::formula("ref", "Ref", "[t.total]"),
        ])
        .expect("fields");
        let mut compiler = FormulaCompiler::new(&registry, &cols, &parser, CompilerConfig::default());
        assert!(compiler.field_has_auto_aggregation(&"total".into()));
        assert!(compiler.field_has_auto_aggregation(&"ref".into()));

        compiler.unregister_field(&"total".into());
        compiler.uncache_field(&"ref".into());
        assert!(!compiler.field_has_auto_aggregation(&"ref".into()));

        compiler.register_field(BIField::direct("total", "Total", "t", "total"));
        assert!(compiler.field_has_auto_aggregation(&"ref".into()));
    }

    #[test]
    fn mock_among_subtracts_its_own_dimensions() {
        let cols = columns();
        let win = n::window_full(
            "rsum",
            vec![n::func("sum", vec![n::field("Sales")])],
            vec![],
            n::among(vec![n::field("City")]),
            &[],
        );
        let parser = MapParser::default().with("RSUM", win);
        let registry = fields(vec![BIField::formula("rs", "Running", "RSUM")]);
        let config = CompilerConfig {
            mock_among_dimensions: true,
            ..CompilerConfig::default()
        };
        let mut compiler = FormulaCompiler::new(&registry, &cols, &parser, config);
        let node = compiler
            .compile_stage(&"rs".into(), CompilationStage::Mutation, ErrorMode::Raise)
            .expect("compile")
            .expect("node");
        let grouping = node
            .visit_node_type(NodeType::WindowGrouping)
            .next()
            .cloned()
            .expect("grouping");
        assert_eq!(grouping.grouping_kind(), Some(WindowGroupingKind::Within));
        assert!(grouping.children().is_empty());
    }
}
