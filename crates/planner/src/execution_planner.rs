//! Assignment of query formulas to evaluation tiers.
//!
//! Every formula of a [`CompiledQuery`] gets a [`LevelPlan`] (the tiers it
//! passes through, `source_db` and/or `compeng`) and a [`SlicingPlan`]
//! describing where the expression is cut between consecutive tiers.

use lodq_common::{FieldId, LodqError, PlannerConfig, PlanningStrategy, Result};
use lodq_formula::inspect::{collect_tags, is_aggregate_expression, is_window_expression};
use lodq_formula::{linearize_tags, LevelTag, NodeType};
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, info};

use crate::primitives::{
    CompiledFormulaInfo, CompiledQuery, ExecutionLevel, ExecutionPlan, LevelPlan, PlannedFormula, SlicerConfig,
    SlicingPlan,
};

/// Strategy seam for query planning.
pub trait ExecutionPlanner {
    fn name(&self) -> &str;

    fn plan(&self, query: &CompiledQuery) -> Result<ExecutionPlan>;
}

/// Build the planner selected by `config.strategy`.
pub fn create_planner(config: &PlannerConfig) -> Box<dyn ExecutionPlanner> {
    match config.strategy {
        PlanningStrategy::WindowToCompeng => Box::new(WindowToCompengPlanner::new(config.verbose_logging)),
        PlanningStrategy::NestedLevelTag => {
            Box::new(NestedLevelTagPlanner::new(ExecutionLevel::SourceDb).with_verbose_logging(config.verbose_logging))
        }
        PlanningStrategy::PrefilterAndCompeng => Box::new(
            PrefilterAndCompengPlanner::new(NonAggregatePrefilterPolicy)
                .with_value_range_query(config.value_range_query)
                .with_verbose_logging(config.verbose_logging),
        ),
    }
}

/// Level tags found anywhere in the query.
fn query_tags(query: &CompiledQuery) -> Vec<LevelTag> {
    let mut tags: Vec<LevelTag> = Vec::new();
    for formula in query.all_formulas() {
        for tag in collect_tags(&formula.formula) {
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }
    }
    tags
}

fn plan_with(formula: &CompiledFormulaInfo, level_plan: &LevelPlan, slicing_plan: &SlicingPlan) -> PlannedFormula {
    PlannedFormula {
        formula: formula.clone(),
        level_plan: level_plan.clone(),
        slicing_plan: slicing_plan.clone(),
    }
}

fn single_tier() -> (LevelPlan, SlicingPlan) {
    (
        LevelPlan::new(vec![ExecutionLevel::SourceDb]),
        SlicingPlan::new(vec![SlicerConfig::Top]),
    )
}

fn two_tiers(lower_slicer: SlicerConfig) -> (LevelPlan, SlicingPlan) {
    (
        LevelPlan::new(vec![ExecutionLevel::SourceDb, ExecutionLevel::Compeng]),
        SlicingPlan::new(vec![lower_slicer, SlicerConfig::Top]),
    )
}

fn is_referenced(formula: &CompiledFormulaInfo, field_ids: &HashSet<String>) -> bool {
    formula
        .original_field_id
        .as_ref()
        .is_some_and(|id: &FieldId| field_ids.contains(id.as_str()))
}

// -----------------------------
// Window functions to compeng
// -----------------------------

/// Sends window functions to the compute engine and everything else to the
/// source database.
#[derive(Debug, Default, Clone)]
pub struct WindowToCompengPlanner {
    verbose_logging: bool,
}

impl WindowToCompengPlanner {
    pub fn new(verbose_logging: bool) -> Self {
        Self { verbose_logging }
    }
}

impl ExecutionPlanner for WindowToCompengPlanner {
    fn name(&self) -> &str {
        "WindowToCompengPlanner"
    }

    fn plan(&self, query: &CompiledQuery) -> Result<ExecutionPlan> {
        let (one_level, one_slicing) = single_tier();
        let (two_level, two_slicing) = two_tiers(SlicerConfig::Window);
        let plan_formula = |formula: &CompiledFormulaInfo, force_compeng: bool| {
            if force_compeng || is_window_expression(&formula.formula) {
                plan_with(formula, &two_level, &two_slicing)
            } else {
                plan_with(formula, &one_level, &one_slicing)
            }
        };

        let needs_compeng = query.all_formulas().any(|f| is_window_expression(&f.formula));
        // Filters named by window BFB clauses must be applied after the window.
        let bfb_filter_ids: HashSet<String> = query_tags(query)
            .into_iter()
            .filter(|tag| tag.qfork_nesting == 0)
            .flat_map(|tag| tag.bfb_names)
            .collect();

        if let Some(formula) = query.group_by.iter().find(|f| is_window_expression(&f.formula)) {
            return Err(LodqError::Planning(format!(
                "window function in GROUP BY: {:?}",
                formula.alias
            )));
        }
        if self.verbose_logging {
            debug!(query_id = %query.id, needs_compeng, bfb_filters = ?bfb_filter_ids, "window planning");
        }

        Ok(ExecutionPlan {
            id: query.id.clone(),
            level_plan: if needs_compeng { two_level.clone() } else { one_level.clone() },
            select: query.select.iter().map(|f| plan_formula(f, needs_compeng)).collect(),
            group_by: query.group_by.iter().map(|f| plan_formula(f, false)).collect(),
            filters: query
                .filters
                .iter()
                .map(|f| plan_formula(f, is_referenced(f, &bfb_filter_ids)))
                .collect(),
            order_by: query.order_by.iter().map(|f| plan_formula(f, needs_compeng)).collect(),
            join_on: query.join_on.iter().map(|f| plan_formula(f, false)).collect(),
            joined_from: query.joined_from.clone(),
            limit: query.limit,
            offset: query.offset,
        })
    }
}

// -----------------------------
// Nested level tags
// -----------------------------

/// One tier per distinct level tag plus an extra tier for filters, all of
/// `level_type`.
///
/// Tags are ordered from the innermost (greatest) to the outermost; tier
/// `i + 1` evaluates the nodes tagged with `tags[i]`. SELECT and ORDER BY
/// are planned through every tier, GROUP BY and JOIN ON stay at tier 0.
#[derive(Debug, Clone)]
pub struct NestedLevelTagPlanner {
    level_type: ExecutionLevel,
    verbose_logging: bool,
}

impl NestedLevelTagPlanner {
    pub fn new(level_type: ExecutionLevel) -> Self {
        Self {
            level_type,
            verbose_logging: false,
        }
    }

    pub fn with_verbose_logging(mut self, verbose_logging: bool) -> Self {
        self.verbose_logging = verbose_logging;
        self
    }

    /// Tier of a filter: the tier of the outermost tag naming it in
    /// BFB (one lower for fork tags), or one above the outermost tag in its
    /// own expression, whichever is higher.
    fn filter_tier(&self, formula: &CompiledFormulaInfo, level_tags: &[LevelTag]) -> Result<usize> {
        let mut tier = 0;
        if let Some(field_id) = &formula.original_field_id {
            if let Some(pos) = level_tags
                .iter()
                .rposition(|tag| tag.bfb_names.contains(field_id.as_str()))
            {
                let mut bfb_tier = pos + 1;
                if level_tags[pos].qfork_nesting != 0 {
                    // Forked sub-queries read the rows before this filter.
                    bfb_tier = bfb_tier.saturating_sub(1);
                }
                if self.verbose_logging {
                    debug!(field_id = %field_id, tag = %level_tags[pos], tier = bfb_tier, "filter referenced by BFB");
                }
                tier = tier.max(bfb_tier);
            }
        }

        for tag in collect_tags(&formula.formula) {
            let pos = level_tags
                .iter()
                .position(|t| t == &tag)
                .ok_or_else(|| LodqError::Planning(format!("filter tag {tag} is not a query tag")))?;
            tier = tier.max(pos + 1);
        }
        Ok(tier)
    }

    fn plan_formula(
        &self,
        formula: &CompiledFormulaInfo,
        level_plan: &LevelPlan,
        tier: usize,
        level_tags: &[LevelTag],
    ) -> PlannedFormula {
        let mut slicer_configs: Vec<SlicerConfig> = level_tags
            .iter()
            .take(tier)
            .cloned()
            .map(SlicerConfig::LevelTagged)
            .collect();
        slicer_configs.push(SlicerConfig::Top);
        PlannedFormula {
            formula: formula.clone(),
            level_plan: LevelPlan::new(level_plan.level_types[..=tier].to_vec()),
            slicing_plan: SlicingPlan::new(slicer_configs),
        }
    }
}

impl ExecutionPlanner for NestedLevelTagPlanner {
    fn name(&self) -> &str {
        "NestedLevelTagPlanner"
    }

    fn plan(&self, query: &CompiledQuery) -> Result<ExecutionPlan> {
        let level_tags = linearize_tags(query_tags(query).iter())?;
        let level_plan = LevelPlan::new(vec![self.level_type; level_tags.len() + 1]);
        if self.verbose_logging {
            info!(
                query_id = %query.id,
                tags = level_tags.len(),
                tiers = level_plan.level_count(),
                "using level tags for slicing"
            );
        }
        let top_tier = level_plan.level_count() - 1;

        let filters = query
            .filters
            .iter()
            .map(|f| {
                let tier = self.filter_tier(f, &level_tags)?;
                Ok(self.plan_formula(f, &level_plan, tier, &level_tags))
            })
            .collect::<Result<Vec<_>>>()?;
        let at_tier = |formulas: &[CompiledFormulaInfo], tier: usize| -> Vec<PlannedFormula> {
            formulas
                .iter()
                .map(|f| self.plan_formula(f, &level_plan, tier, &level_tags))
                .collect()
        };

        Ok(ExecutionPlan {
            id: query.id.clone(),
            select: at_tier(&query.select, top_tier),
            group_by: at_tier(&query.group_by, 0),
            filters,
            order_by: at_tier(&query.order_by, top_tier),
            join_on: at_tier(&query.join_on, 0),
            level_plan,
            joined_from: query.joined_from.clone(),
            limit: query.limit,
            offset: query.offset,
        })
    }
}

// -----------------------------
// Pre-filters and compeng
// -----------------------------

/// Decides which filters the source database can apply before the compute
/// engine takes over.
pub trait PrefilterPolicy {
    fn name(&self) -> &str;

    fn is_prefilter(&self, formula: &CompiledFormulaInfo) -> bool;
}

/// Row-level filters (no aggregation, no window functions) are pre-filters.
#[derive(Debug, Default, Clone, Copy)]
pub struct NonAggregatePrefilterPolicy;

impl PrefilterPolicy for NonAggregatePrefilterPolicy {
    fn name(&self) -> &str {
        "NonAggregatePrefilterPolicy"
    }

    fn is_prefilter(&self, formula: &CompiledFormulaInfo) -> bool {
        !is_aggregate_expression(&formula.formula) && !is_window_expression(&formula.formula)
    }
}

/// Plain field selects over pre-filtered rows run in the source database;
/// anything else moves the whole query to a second, compeng tier.
#[derive(Debug, Clone)]
pub struct PrefilterAndCompengPlanner<P> {
    policy: P,
    value_range_query: bool,
    verbose_logging: bool,
}

impl<P: PrefilterPolicy> PrefilterAndCompengPlanner<P> {
    pub fn new(policy: P) -> Self {
        Self {
            policy,
            value_range_query: false,
            verbose_logging: false,
        }
    }

    /// Value-range and distinct queries never use compeng.
    pub fn with_value_range_query(mut self, value_range_query: bool) -> Self {
        self.value_range_query = value_range_query;
        self
    }

    pub fn with_verbose_logging(mut self, verbose_logging: bool) -> Self {
        self.verbose_logging = verbose_logging;
        self
    }

    fn is_simple_query(&self, query: &CompiledQuery, compeng_only_filters: &[CompiledFormulaInfo]) -> bool {
        query.order_by.is_empty()
            && query.group_by.is_empty()
            && query.join_on.is_empty()
            && compeng_only_filters.is_empty()
            && query.select.iter().all(|f| f.expr().is(NodeType::Field))
    }
}

impl<P: PrefilterPolicy> ExecutionPlanner for PrefilterAndCompengPlanner<P> {
    fn name(&self) -> &str {
        "PrefilterAndCompengPlanner"
    }

    fn plan(&self, query: &CompiledQuery) -> Result<ExecutionPlan> {
        let bfb_filter_ids: HashSet<String> = query_tags(query).into_iter().flat_map(|tag| tag.bfb_names).collect();
        let (mut pre_filters, mut compeng_only_filters): (Vec<CompiledFormulaInfo>, Vec<CompiledFormulaInfo>) = query
            .filters
            .iter()
            .cloned()
            .partition(|f| !is_referenced(f, &bfb_filter_ids) && self.policy.is_prefilter(f));

        let needs_compeng = !self.value_range_query && !self.is_simple_query(query, &compeng_only_filters);
        if !needs_compeng {
            pre_filters.append(&mut compeng_only_filters);
            if !query.group_by.is_empty() {
                return Err(LodqError::Planning("compeng is required for GROUP BY".to_string()));
            }
            if !query.join_on.is_empty() {
                return Err(LodqError::Planning("compeng is required for JOIN ON".to_string()));
            }
        }
        if let Some(formula) = query.group_by.iter().find(|f| is_aggregate_expression(&f.formula)) {
            return Err(LodqError::Planning(format!(
                "aggregation in GROUP BY: {:?}",
                formula.alias
            )));
        }
        if self.verbose_logging {
            debug!(
                query_id = %query.id,
                policy = self.policy.name(),
                needs_compeng,
                pre_filters = pre_filters.len(),
                compeng_filters = compeng_only_filters.len(),
                "prefilter planning"
            );
        }

        let (one_level, one_slicing) = single_tier();
        let (two_level, two_slicing) = two_tiers(SlicerConfig::Field);
        let plan_formula = |formula: &CompiledFormulaInfo, use_compeng: bool| {
            if use_compeng {
                plan_with(formula, &two_level, &two_slicing)
            } else {
                plan_with(formula, &one_level, &one_slicing)
            }
        };

        // Pre-filters are applied again in compeng.
        let mut filters: Vec<PlannedFormula> = pre_filters.iter().map(|f| plan_formula(f, false)).collect();
        if needs_compeng {
            filters.extend(
                pre_filters
                    .iter()
                    .chain(compeng_only_filters.iter())
                    .map(|f| plan_formula(f, true)),
            );
        }

        Ok(ExecutionPlan {
            id: query.id.clone(),
            level_plan: if needs_compeng { two_level.clone() } else { one_level.clone() },
            select: query.select.iter().map(|f| plan_formula(f, needs_compeng)).collect(),
            group_by: query.group_by.iter().map(|f| plan_formula(f, true)).collect(),
            filters,
            order_by: query.order_by.iter().map(|f| plan_formula(f, needs_compeng)).collect(),
            join_on: query.join_on.iter().map(|f| plan_formula(f, true)).collect(),
            joined_from: query.joined_from.clone(),
            limit: query.limit,
            offset: query.offset,
        })
    }
}

/// Distinct tag name sets of a plan, innermost first.
pub fn plan_tag_names(plan: &ExecutionPlan) -> Vec<BTreeSet<String>> {
    let mut out: Vec<BTreeSet<String>> = Vec::new();
    for formula in plan.all_formulas() {
        for slicer in &formula.slicing_plan.slicer_configs {
            if let SlicerConfig::LevelTagged(tag) = slicer {
                if !out.contains(&tag.bfb_names) {
                    out.push(tag.bfb_names.clone());
                }
            }
        }
    }
    out
}
