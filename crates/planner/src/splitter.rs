//! Mask-based query splitting.
//!
//! A [`SplitMaskDiscovery`] strategy decides which expressions of a query
//! must be evaluated in separate sub-queries and describes each sub-query
//! with a [`QuerySplitMask`]. [`MultiQuerySplitter`] turns the masks into
//! a patch: one sub-query per mask plus the original query cropped to read
//! from them.

use lodq_common::{FormulaErrorCode, LodqError, Result, SplitterConfig};
use lodq_formula::inspect::{enumerate_autonomous_children, is_aggregate_expression, is_constant_expression, used_fields};
use lodq_formula::shortcuts as n;
use lodq_formula::{Node, NodeExtract, NodeHierarchyIndex, NodeType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, info};

use crate::primitives::{
    CompiledFormulaInfo, CompiledMultiQuery, CompiledQuery, FromColumn, FromObject, JoinSpec, JoinType,
    JoinedFromObject, PrefixedIdGen, QueryPart,
};
use crate::query_tools::{remap_fields, CompiledMultiQueryPatch};

/// Clauses whose expressions can be split off into sub-queries.
pub const SPLIT_QUERY_PARTS: [QueryPart; 3] = [QueryPart::Select, QueryPart::OrderBy, QueryPart::Filters];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubqueryType {
    WindowFunc,
    Default,
    GeneratedBase,
}

/// Location of a split node inside a query.
///
/// `outer_node_idx` is cut out of the original formula; `inner_node_idx`
/// (equal to or below it) is what the sub-query selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormulaSplitMask {
    pub query_part: QueryPart,
    pub formula_list_idx: usize,
    pub outer_node_idx: NodeHierarchyIndex,
    pub inner_node_idx: NodeHierarchyIndex,
}

impl FormulaSplitMask {
    pub fn new(
        query_part: QueryPart,
        formula_list_idx: usize,
        outer_node_idx: NodeHierarchyIndex,
        inner_node_idx: NodeHierarchyIndex,
    ) -> Self {
        debug_assert!(inner_node_idx.startswith(&outer_node_idx));
        Self {
            query_part,
            formula_list_idx,
            outer_node_idx,
            inner_node_idx,
        }
    }

    pub fn with_alias(self, alias: String) -> AliasedFormulaSplitMask {
        AliasedFormulaSplitMask { mask: self, alias }
    }
}

/// A split mask plus the column alias it is exposed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasedFormulaSplitMask {
    pub mask: FormulaSplitMask,
    pub alias: String,
}

/// Extra expression selected by a sub-query (dimension or join operand).
#[derive(Debug, Clone)]
pub struct AddFormulaInfo {
    pub alias: String,
    pub expr: Node,
    pub from_ids: BTreeSet<String>,
    pub is_group_by: bool,
}

/// Description of one sub-query split off a query.
#[derive(Debug, Clone)]
pub struct QuerySplitMask {
    pub subquery_type: SubqueryType,
    pub subquery_id: String,
    pub formula_split_masks: Vec<AliasedFormulaSplitMask>,
    pub add_formulas: Vec<AddFormulaInfo>,
    /// Indices of the original query's filters applied in the sub-query.
    pub filter_indices: BTreeSet<usize>,
    /// Sub-query-only filters (BFB-mutated copies of original filters).
    pub add_filters: Vec<CompiledFormulaInfo>,
    pub join_type: Option<JoinType>,
    /// `QueryForkJoining` node with conditions over the add formula aliases.
    pub joining_node: Option<Node>,
    pub is_base: bool,
}

impl QuerySplitMask {
    pub fn group_by_count(&self) -> usize {
        self.add_formulas.iter().filter(|f| f.is_group_by).count()
    }

    pub fn group_by_extracts(&self) -> BTreeSet<NodeExtract> {
        self.add_formulas
            .iter()
            .filter(|f| f.is_group_by)
            .filter_map(|f| f.expr.extract().cloned())
            .collect()
    }

    /// Join consists only of column-to-same-column equalities.
    pub fn has_direct_equality_join(&self) -> bool {
        self.joining_node.as_ref().map_or(true, |joining| {
            joining
                .children()
                .iter()
                .all(|c| c.is(NodeType::SelfEqualityJoinCondition))
        })
    }
}

/// Strategy that finds the sub-queries a query must be split into.
pub trait SplitMaskDiscovery {
    /// Stable strategy name used in logs.
    fn name(&self) -> &str;

    /// Masks for `query`; empty when it needs no split.
    fn get_split_masks(
        &self,
        query: &CompiledQuery,
        expr_ids: &mut PrefixedIdGen,
        query_ids: &mut PrefixedIdGen,
    ) -> Result<Vec<QuerySplitMask>>;

    /// Rewrite a split-off node before it is selected by its sub-query.
    fn mutate_split_node(&self, node: &Node) -> Node {
        node.clone()
    }

    /// Rewrite the cropped original query.
    fn mutate_cropped_query(&self, query: CompiledQuery) -> Result<CompiledQuery> {
        Ok(query)
    }

    /// Rearrange masks once the base mask is in place (base first).
    fn optimize_split_masks(&self, split_masks: Vec<QuerySplitMask>) -> Vec<QuerySplitMask> {
        split_masks
    }
}

/// Applies a [`SplitMaskDiscovery`] to queries and multi-queries.
#[derive(Debug)]
pub struct MultiQuerySplitter<D> {
    discovery: D,
    config: SplitterConfig,
    query_ids: PrefixedIdGen,
    expr_ids: PrefixedIdGen,
}

impl<D: SplitMaskDiscovery> MultiQuerySplitter<D> {
    /// New sub-queries are named `q_<n>`, their columns `e_<n>`.
    pub fn new(discovery: D, config: SplitterConfig) -> Self {
        Self {
            discovery,
            config,
            query_ids: PrefixedIdGen::new("q"),
            expr_ids: PrefixedIdGen::new("e"),
        }
    }

    pub fn discovery(&self) -> &D {
        &self.discovery
    }

    /// Split one query; `None` when it needs no split.
    pub fn split_query(&mut self, query: &CompiledQuery) -> Result<Option<CompiledMultiQueryPatch>> {
        let split_masks = self
            .discovery
            .get_split_masks(query, &mut self.expr_ids, &mut self.query_ids)?;
        if split_masks.is_empty() {
            return Ok(None);
        }
        if self.config.verbose_logging {
            debug!(
                query_id = %query.id,
                strategy = self.discovery.name(),
                masks = split_masks.len(),
                "split masks found"
            );
        }
        let patch = self.patch_from_split_masks(query, split_masks)?;
        Ok(Some(patch))
    }

    /// Split queries until none of them needs splitting.
    pub fn split_multi_query(&mut self, multi_query: &CompiledMultiQuery) -> Result<CompiledMultiQuery> {
        let mut current = multi_query.clone();
        for round in 0..self.config.max_split_rounds {
            let mut changed = false;
            let ids: Vec<String> = current.queries.iter().map(|q| q.id.clone()).collect();
            for id in ids {
                let Some(query) = current.query_by_id(&id) else {
                    continue;
                };
                if let Some(patch) = self.split_query(query)? {
                    current = patch.apply(&current)?;
                    changed = true;
                }
            }
            if !changed {
                info!(
                    rounds = round,
                    queries = current.query_count(),
                    "multi-query split finished"
                );
                return Ok(current);
            }
        }
        Err(LodqError::Planning(format!(
            "query splitting did not finish in {} rounds",
            self.config.max_split_rounds
        )))
    }

    fn patch_from_split_masks(
        &mut self,
        query: &CompiledQuery,
        split_masks: Vec<QuerySplitMask>,
    ) -> Result<CompiledMultiQueryPatch> {
        // Checked before the base mask is added.
        let compatible = are_subquery_dimensions_compatible(&split_masks);
        let split_masks = self.patch_masks_with_base(query, split_masks)?;
        let split_masks = self.discovery.optimize_split_masks(split_masks);
        let split_masks = self.patch_mask_dimensions(split_masks)?;

        let mut queries = Vec::with_capacity(split_masks.len() + 1);
        for mask in &split_masks {
            queries.push(self.generate_subquery(query, mask)?);
        }
        queries.push(self.crop_original_query(query, &split_masks, compatible)?);
        if !compatible {
            debug!(query_id = %query.id, "sub-query dimensions are incompatible");
        }
        Ok(CompiledMultiQueryPatch {
            replaced_id: query.id.clone(),
            patch: CompiledMultiQuery::new(queries),
        })
    }

    // -----------------------------
    // Base mask
    // -----------------------------

    fn patch_masks_with_base(
        &mut self,
        query: &CompiledQuery,
        mut split_masks: Vec<QuerySplitMask>,
    ) -> Result<Vec<QuerySplitMask>> {
        let counterparts = self.formula_mask_counterparts(query, &split_masks)?;
        let split_filter_indices: HashSet<usize> = split_masks
            .iter()
            .flat_map(|m| m.formula_split_masks.iter())
            .filter(|fm| fm.mask.query_part == QueryPart::Filters)
            .map(|fm| fm.mask.formula_list_idx)
            .collect();
        let base_filter_indices: BTreeSet<usize> = (0..query.filters.len())
            .filter(|idx| !split_filter_indices.contains(idx))
            .collect();

        if counterparts.is_empty() {
            if let Some(pos) = find_base_candidate(query, &split_masks, &base_filter_indices) {
                let mut base = split_masks.remove(pos);
                base.is_base = true;
                split_masks.insert(0, base);
                return Ok(split_masks);
            }
        }

        let add_formulas = query
            .group_by
            .iter()
            .map(|gb| AddFormulaInfo {
                alias: self.expr_ids.get_id(),
                expr: gb.expr().clone(),
                from_ids: gb.avatar_ids.clone(),
                is_group_by: !is_constant_expression(gb.expr()),
            })
            .collect();
        let base = QuerySplitMask {
            subquery_type: SubqueryType::GeneratedBase,
            subquery_id: self.query_ids.get_id(),
            formula_split_masks: counterparts,
            add_formulas,
            filter_indices: base_filter_indices,
            add_filters: Vec::new(),
            join_type: None,
            joining_node: None,
            is_base: true,
        };
        split_masks.insert(0, base);
        Ok(split_masks)
    }

    /// Masks for the non-constant siblings of split nodes that no mask
    /// covers; they are evaluated by the base sub-query.
    fn formula_mask_counterparts(
        &mut self,
        query: &CompiledQuery,
        split_masks: &[QuerySplitMask],
    ) -> Result<Vec<AliasedFormulaSplitMask>> {
        let mut by_formula: BTreeMap<(QueryPart, usize), BTreeSet<NodeHierarchyIndex>> = BTreeMap::new();
        for fm in split_masks.iter().flat_map(|m| m.formula_split_masks.iter()) {
            by_formula
                .entry((fm.mask.query_part, fm.mask.formula_list_idx))
                .or_default()
                .insert(fm.mask.outer_node_idx.clone());
        }
        let gb_aliases: HashSet<&str> = query.group_by.iter().map(|f| f.alias_str()).collect();

        let mut result = Vec::new();
        for part in SPLIT_QUERY_PARTS {
            for (idx, formula) in query.formula_list(part).iter().enumerate() {
                if gb_aliases.contains(formula.alias_str()) || is_constant_expression(formula.expr()) {
                    continue;
                }
                let masks: Vec<NodeHierarchyIndex> = by_formula
                    .get(&(part, idx))
                    .map(|set| set.iter().cloned().collect())
                    .unwrap_or_default();
                if part == QueryPart::Filters && masks.is_empty() {
                    // Unsplit filters stay where they are.
                    continue;
                }
                let mut cursor = 0;
                let mut found = Vec::new();
                collect_counterparts(
                    formula.expr(),
                    &NodeHierarchyIndex::new(vec![0]),
                    &masks,
                    &mut cursor,
                    &mut found,
                )?;
                for node_idx in found {
                    result.push(
                        FormulaSplitMask::new(part, idx, node_idx.clone(), node_idx)
                            .with_alias(self.expr_ids.get_id()),
                    );
                }
            }
        }
        Ok(result)
    }

    /// Give the base every add formula the other masks expose so that JOIN
    /// ON expressions can reference base columns.
    fn patch_mask_dimensions(&mut self, mut split_masks: Vec<QuerySplitMask>) -> Result<Vec<QuerySplitMask>> {
        let (base, others) = split_masks
            .split_first_mut()
            .ok_or_else(|| LodqError::Planning("no split masks".to_string()))?;
        if !base.is_base || others.iter().any(|m| m.is_base) {
            return Err(LodqError::Planning("base split mask must come first".to_string()));
        }
        let mut base_extracts: HashSet<NodeExtract> =
            base.add_formulas.iter().filter_map(|f| f.expr.extract().cloned()).collect();
        for add_formula in others.iter().flat_map(|m| m.add_formulas.iter()) {
            let Some(extract) = add_formula.expr.extract() else {
                continue;
            };
            if !base_extracts.insert(extract.clone()) {
                continue;
            }
            base.add_formulas.push(AddFormulaInfo {
                alias: self.expr_ids.get_id(),
                ..add_formula.clone()
            });
        }
        Ok(split_masks)
    }

    // -----------------------------
    // Sub-queries
    // -----------------------------

    fn generate_subquery(&self, query: &CompiledQuery, mask: &QuerySplitMask) -> Result<CompiledQuery> {
        let mut select: Vec<CompiledFormulaInfo> = Vec::new();
        let mut group_by = Vec::new();
        let mut seen_aliases: HashMap<String, Node> = HashMap::new();
        for fm in &mask.formula_split_masks {
            let original = query
                .formula_list(fm.mask.query_part)
                .get(fm.mask.formula_list_idx)
                .ok_or_else(|| LodqError::Planning(format!("split mask points past {:?}", fm.mask.query_part)))?;
            if fm.mask.inner_node_idx.is_empty() {
                return Err(LodqError::Planning("split mask cannot select the formula root".to_string()));
            }
            let node = original.formula.get(&fm.mask.inner_node_idx).ok_or_else(|| {
                LodqError::Planning(format!("invalid split index {}", fm.mask.inner_node_idx))
            })?;
            let formula = n::formula(self.discovery.mutate_split_node(node));
            if let Some(existing) = seen_aliases.get(&fm.alias) {
                if existing != &formula {
                    return Err(LodqError::Planning(format!(
                        "different SELECT formulas for alias {}",
                        fm.alias
                    )));
                }
                continue;
            }
            seen_aliases.insert(fm.alias.clone(), formula.clone());
            select.push(
                CompiledFormulaInfo::new(formula, Some(fm.alias.clone()))
                    .with_field_id(original.original_field_id.clone())
                    .with_avatar_ids(original.avatar_ids.iter().cloned()),
            );
        }
        for add_formula in &mask.add_formulas {
            let item = CompiledFormulaInfo::new(n::formula(add_formula.expr.clone()), Some(add_formula.alias.clone()))
                .with_avatar_ids(add_formula.from_ids.iter().cloned());
            if add_formula.is_group_by {
                group_by.push(item.clone());
            }
            select.push(item);
        }

        let mut filters: Vec<CompiledFormulaInfo> = query
            .filters
            .iter()
            .enumerate()
            .filter(|(idx, _)| mask.filter_indices.contains(idx))
            .map(|(_, f)| f.clone())
            .collect();
        filters.extend(mask.add_filters.iter().cloned());

        let mut subquery = CompiledQuery::new(mask.subquery_id.clone(), query.level_type);
        subquery.select = select;
        subquery.group_by = group_by;
        subquery.filters = filters;
        subquery.join_on = query.join_on.clone();
        subquery.joined_from = query.joined_from.clone();
        Ok(subquery)
    }

    // -----------------------------
    // Cropping
    // -----------------------------

    fn crop_original_query(
        &self,
        query: &CompiledQuery,
        split_masks: &[QuerySplitMask],
        compatible: bool,
    ) -> Result<CompiledQuery> {
        let Some((base, others)) = split_masks.split_first() else {
            return Err(LodqError::Planning("no split masks".to_string()));
        };
        let base_gb_alias_by_extract: HashMap<NodeExtract, String> = base
            .add_formulas
            .iter()
            .filter(|f| f.is_group_by)
            .filter_map(|f| f.expr.extract().map(|e| (e.clone(), f.alias.clone())))
            .collect();

        let mut alias_to_subquery: HashMap<String, String> = HashMap::new();
        for mask in split_masks {
            for fm in &mask.formula_split_masks {
                alias_to_subquery.insert(fm.alias.clone(), mask.subquery_id.clone());
            }
            for add_formula in &mask.add_formulas {
                alias_to_subquery.insert(add_formula.alias.clone(), mask.subquery_id.clone());
            }
        }

        for gb in &query.group_by {
            if is_constant_expression(gb.expr()) {
                continue;
            }
            let known = gb.expr().extract().is_some_and(|e| base_gb_alias_by_extract.contains_key(e));
            if !known {
                return Err(LodqError::Planning(format!(
                    "base sub-query lacks dimension {}",
                    gb.alias_str()
                )));
            }
        }

        let cropper = FormulaCropper {
            gb_aliases: query.group_by.iter().map(|f| f.alias_str().to_string()).collect(),
            formula_split_masks: split_masks.iter().flat_map(|m| m.formula_split_masks.iter()).collect(),
            base_gb_alias_by_extract: &base_gb_alias_by_extract,
            alias_to_subquery: &alias_to_subquery,
            error_node: (!compatible)
                .then(|| n::error("LOD dimensions are incompatible", FormulaErrorCode::LodIncompatibleDimensions)),
        };

        let mut cropped = CompiledQuery::new(query.id.clone(), query.level_type);
        cropped.select = cropper.crop(query, QueryPart::Select, &BTreeSet::new())?;
        cropped.group_by = cropper.crop(query, QueryPart::GroupBy, &BTreeSet::new())?;
        cropped.order_by = cropper.crop(query, QueryPart::OrderBy, &BTreeSet::new())?;
        // Filters applied by the base sub-query are not repeated.
        cropped.filters = cropper.crop(query, QueryPart::Filters, &base.filter_indices)?;
        cropped.limit = query.limit;
        cropped.offset = query.offset;

        let mut froms = Vec::with_capacity(split_masks.len());
        for mask in split_masks {
            let mut seen = HashSet::new();
            let columns = mask
                .formula_split_masks
                .iter()
                .map(|fm| fm.alias.as_str())
                .chain(mask.add_formulas.iter().map(|f| f.alias.as_str()))
                .filter(|alias| seen.insert(*alias))
                .map(FromColumn::aliased)
                .collect();
            froms.push(FromObject::subquery(&mask.subquery_id, columns));
        }
        if compatible {
            for mask in others {
                if let Some(join_on) = make_join_on(base, mask)? {
                    cropped.join_on.push(join_on);
                }
            }
        }
        cropped.joined_from = JoinedFromObject {
            root_from_id: Some(base.subquery_id.clone()),
            froms,
        };
        self.discovery.mutate_cropped_query(cropped)
    }
}

/// Index of the first mask with the most dimensions that covers the
/// query's dimensions, if it can serve as the base sub-query.
fn find_base_candidate(
    query: &CompiledQuery,
    split_masks: &[QuerySplitMask],
    base_filter_indices: &BTreeSet<usize>,
) -> Option<usize> {
    let base_extracts: BTreeSet<NodeExtract> = query
        .group_by
        .iter()
        .filter(|f| !is_constant_expression(f.expr()))
        .filter_map(|f| f.expr().extract().cloned())
        .collect();
    let max_dimensions = split_masks.iter().map(QuerySplitMask::group_by_count).max()?;
    let pos = split_masks.iter().position(|mask| {
        mask.group_by_count() == max_dimensions && mask.group_by_extracts().is_superset(&base_extracts)
    })?;
    let candidate = &split_masks[pos];
    let same_dimensions = candidate.group_by_count() == base_extracts.len();
    let same_filters = &candidate.filter_indices == base_filter_indices;
    if (same_dimensions && same_filters && candidate.has_direct_equality_join()) || base_extracts.is_empty() {
        Some(pos)
    } else {
        None
    }
}

/// Walk `node` against sorted split indices and collect the indices of
/// non-constant subtrees no index touches.
fn collect_counterparts(
    node: &Node,
    prefix: &NodeHierarchyIndex,
    masks: &[NodeHierarchyIndex],
    cursor: &mut usize,
    out: &mut Vec<NodeHierarchyIndex>,
) -> Result<()> {
    while *cursor < masks.len() && masks[*cursor] < *prefix {
        *cursor += 1;
    }
    let Some(mask) = masks.get(*cursor) else {
        if !is_constant_expression(node) {
            out.push(prefix.clone());
        }
        return Ok(());
    };
    if mask == prefix {
        return Ok(());
    }
    if !mask.startswith(prefix) {
        if !is_constant_expression(node) {
            out.push(prefix.clone());
        }
        return Ok(());
    }
    let children = enumerate_autonomous_children(node, prefix);
    if children.is_empty() {
        return Err(LodqError::Planning(format!("split index {mask} points to a missing node")));
    }
    for (child_idx, child) in children {
        collect_counterparts(&child, &child_idx, masks, cursor, out)?;
    }
    Ok(())
}

/// Dimension sets must form a chain ending in one maximal set.
pub fn are_subquery_dimensions_compatible(split_masks: &[QuerySplitMask]) -> bool {
    if split_masks.is_empty() {
        return true;
    }
    let sets: Vec<BTreeSet<NodeExtract>> = split_masks.iter().map(QuerySplitMask::group_by_extracts).collect();
    let union: BTreeSet<NodeExtract> = sets.iter().flatten().cloned().collect();
    sets.contains(&union)
}

/// `_dneq` JOIN ON between the base and another mask.
fn make_join_on(left: &QuerySplitMask, right: &QuerySplitMask) -> Result<Option<CompiledFormulaInfo>> {
    let Some(joining) = &right.joining_node else {
        return Ok(None);
    };
    let left_by_extract: HashMap<&NodeExtract, &str> = left
        .add_formulas
        .iter()
        .filter_map(|f| f.expr.extract().map(|e| (e, f.alias.as_str())))
        .collect();
    let right_to_left: HashMap<String, String> = right
        .add_formulas
        .iter()
        .filter_map(|f| {
            let left_alias = left_by_extract.get(f.expr.extract()?)?;
            Some((f.alias.clone(), left_alias.to_string()))
        })
        .collect();

    let mut condition: Option<Node> = None;
    for part in joining.children() {
        let (left_expr, right_expr) = match part.node_type() {
            NodeType::SelfEqualityJoinCondition => {
                let expr = &part.children()[0];
                if !matches!(expr.node_type(), NodeType::Field | NodeType::Error) {
                    return Err(LodqError::Planning(format!(
                        "self-equality join over a non-field expression in {}",
                        right.subquery_id
                    )));
                }
                (expr.clone(), expr.clone())
            }
            NodeType::BinaryJoinCondition => (part.children()[0].clone(), part.children()[1].clone()),
            other => {
                return Err(LodqError::Unsupported(format!("join condition {other:?}")));
            }
        };
        // The left operand is evaluated against the base sub-query.
        let left_expr = remap_fields(&left_expr, &right_to_left);
        let part = n::binary("_dneq", left_expr, right_expr);
        condition = Some(match condition {
            None => part,
            Some(prev) => n::binary("and", prev, part),
        });
    }
    let (Some(condition), Some(join_type)) = (condition, right.join_type) else {
        return Ok(None);
    };
    Ok(Some(
        CompiledFormulaInfo::new(n::formula(condition), None)
            .with_avatar_ids([left.subquery_id.clone(), right.subquery_id.clone()])
            .with_join(JoinSpec {
                left_id: left.subquery_id.clone(),
                right_id: right.subquery_id.clone(),
                join_type,
            }),
    ))
}

/// Replace every node matching `extract` with a field reference.
pub(crate) fn replace_extract_with_field(node: &Node, extract: &NodeExtract, alias: &str) -> Node {
    node.replace_nodes(
        |candidate, _| candidate.extract() == Some(extract),
        |old, _| n::field(alias).with_meta(old.meta().clone()),
    )
}

/// Apply extract-to-alias replacements, most complex expressions first.
pub(crate) fn replace_extracts_with_fields(node: &Node, aliases: &HashMap<NodeExtract, String>) -> Node {
    let mut ordered: Vec<(&NodeExtract, &String)> = aliases.iter().collect();
    ordered.sort_by(|a, b| b.0.complexity().cmp(&a.0.complexity()).then_with(|| a.0.cmp(b.0)));
    ordered
        .into_iter()
        .fold(node.clone(), |acc, (extract, alias)| replace_extract_with_field(&acc, extract, alias))
}

struct FormulaCropper<'m> {
    gb_aliases: HashSet<String>,
    formula_split_masks: Vec<&'m AliasedFormulaSplitMask>,
    base_gb_alias_by_extract: &'m HashMap<NodeExtract, String>,
    alias_to_subquery: &'m HashMap<String, String>,
    error_node: Option<Node>,
}

impl FormulaCropper<'_> {
    fn crop(
        &self,
        query: &CompiledQuery,
        part: QueryPart,
        exclude_indices: &BTreeSet<usize>,
    ) -> Result<Vec<CompiledFormulaInfo>> {
        let mut out = Vec::new();
        for (idx, formula) in query.formula_list(part).iter().enumerate() {
            if exclude_indices.contains(&idx) {
                continue;
            }
            let is_constant = is_constant_expression(formula.expr());
            let new_formula = if is_constant {
                formula.formula.clone()
            } else if self.gb_aliases.contains(formula.alias_str()) {
                let alias = formula
                    .expr()
                    .extract()
                    .and_then(|e| self.base_gb_alias_by_extract.get(e))
                    .ok_or_else(|| LodqError::Planning(format!("no base column for {}", formula.alias_str())))?;
                n::formula(n::field(alias).with_meta(formula.expr().meta().clone()))
                    .with_meta(formula.formula.meta().clone())
            } else if let Some(error) = &self.error_node {
                n::formula(error.clone())
            } else {
                let mut node = formula.formula.clone();
                for fm in self
                    .formula_split_masks
                    .iter()
                    .filter(|fm| fm.mask.query_part == part && fm.mask.formula_list_idx == idx)
                {
                    node = node.replace_at_index(&fm.mask.outer_node_idx, n::field(&fm.alias));
                }
                if part == QueryPart::Filters {
                    node = replace_extracts_with_fields(&node, self.base_gb_alias_by_extract);
                }
                node
            };

            if !new_formula.ptr_eq(&formula.formula) {
                let avatar_ids: BTreeSet<String> = used_fields(&new_formula)
                    .iter()
                    .filter_map(|name| self.alias_to_subquery.get(name).cloned())
                    .collect();
                let mut updated = formula.with_formula(new_formula);
                updated.avatar_ids = avatar_ids;
                out.push(updated);
            } else if is_constant {
                out.push(formula.clone());
            } else if part != QueryPart::Filters {
                return Err(LodqError::Planning(format!(
                    "formula {} was not split",
                    formula.alias_str()
                )));
            }
            // Unsplit filters reference sources the cropped query cannot see.
        }
        Ok(out)
    }
}

/// Drop GROUP BY from a cropped query whose non-dimension selects are all
/// non-aggregated. Mixed aggregation status leaves the query unchanged.
pub fn drop_group_by_for_plain_selects(mut query: CompiledQuery) -> CompiledQuery {
    let gb_aliases: HashSet<&str> = query.group_by.iter().map(|f| f.alias_str()).collect();
    let statuses: HashSet<bool> = query
        .select
        .iter()
        .filter(|f| !gb_aliases.contains(f.alias_str()) && !is_constant_expression(f.expr()))
        .map(|f| is_aggregate_expression(&f.formula))
        .collect();
    if statuses.len() == 1 && statuses.contains(&false) {
        query.group_by.clear();
    }
    query
}
