//! Level-by-level forking of sub-queries referenced by `QueryFork` nodes.
//!
//! Works on a [`CompiledMultiLevelQuery`] whose level N formulas reference
//! level N-1 select aliases. Every `QueryFork` found at level N is served
//! by a clone ("fork") of the level N-1 sub-query it reads from, stripped
//! to the needed columns and re-grouped by the fork dimensions. Ancestors
//! of the forked sub-query are cloned down to level 0 so forks never share
//! FROM objects with the original.

use lodq_common::{ForkerConfig, FormulaErrorCode, LodqError, Result};
use lodq_formula::inspect::used_fields;
use lodq_formula::shortcuts as n;
use lodq_formula::{LodKind, Node, NodeExtract, NodeHierarchyIndex, NodeType};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, info};

use crate::primitives::{
    CompiledFormulaInfo, CompiledMultiLevelQuery, CompiledQuery, FromColumn, FromObject, JoinSpec,
    JoinType, JoinedFromObject, MultiQueryIndex, QueryPart,
};
use crate::query_tools::{
    add_dummy_select_column, apply_incremental_patches, apply_replacement_patches, copy_and_remap_query,
    refresh_subquery_columns, remap_fields, IncrementalPatch,
};
use crate::sanitizer::{GroupByNormalizer, LevelUsage, MultiQuerySanitizer};

const FORKED_PARTS: [QueryPart; 5] = [
    QueryPart::Select,
    QueryPart::GroupBy,
    QueryPart::OrderBy,
    QueryPart::Filters,
    QueryPart::JoinOn,
];

/// Location of a fork node: clause, item and node index.
#[derive(Debug, Clone)]
struct FullNodeIndex {
    part: QueryPart,
    expr_idx: usize,
    node_idx: NodeHierarchyIndex,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SubqueryForkSignature {
    lod_idx: usize,
    joining: Option<NodeExtract>,
    bfb_names: BTreeSet<String>,
    dims: BTreeSet<NodeExtract>,
    join_type: JoinType,
}

#[derive(Debug)]
struct SubqueryForkInfo {
    original_subquery_id: String,
    joining: Node,
    bfb_field_ids: BTreeSet<String>,
    dimensions: Vec<Node>,
    join_type: JoinType,
    required_select_aliases: BTreeSet<String>,
    node_indices: Vec<FullNodeIndex>,
}

/// Forks sub-queries for the `QueryFork` nodes of a multi-level query.
#[derive(Debug, Default)]
pub struct QueryForker {
    config: ForkerConfig,
    subquery_counter: usize,
}

impl QueryForker {
    pub fn new(config: ForkerConfig) -> Self {
        Self {
            config,
            subquery_counter: 0,
        }
    }

    /// Fork every level from the top down, then sanitize and normalize
    /// GROUP BY. Level 0 reads from avatars and is never forked.
    pub fn scan_and_fork_multi_query(&mut self, multi_query: &CompiledMultiLevelQuery) -> Result<CompiledMultiLevelQuery> {
        let sanitizer = MultiQuerySanitizer;
        let mut multi_query = multi_query.clone();
        let mut upper_usage: Option<LevelUsage> = None;

        for level_idx in (0..multi_query.level_count()).rev() {
            let mut level = multi_query.levels[level_idx].clone();
            if level_idx > 0 {
                let alias_to_subquery = alias_to_query_id_map(&multi_query.levels[level_idx - 1].queries);
                let mut updated_queries = Vec::with_capacity(level.queries.len());
                for query_idx in 0..level.queries.len() {
                    let index = MultiQueryIndex { level_idx, query_idx };
                    let (updated, incremental, replacements) =
                        self.scan_subquery_and_make_forks(&multi_query, index, &alias_to_subquery)?;
                    updated_queries.push(updated);
                    multi_query = apply_incremental_patches(&multi_query, &incremental)?;
                    multi_query = apply_replacement_patches(&multi_query, replacements)?;
                }
                level.queries = updated_queries;
            }

            let level = sanitizer.sanitize_level(level, upper_usage.as_ref());
            let available = select_aliases_by_query(&level.queries);
            multi_query.levels[level_idx] = level;
            if let Some(upper) = multi_query.levels.get_mut(level_idx + 1) {
                for query in upper.queries.iter_mut() {
                    refresh_subquery_columns(query, &available);
                }
            }
            upper_usage = Some(LevelUsage::of_level(&multi_query.levels[level_idx]));
        }

        if multi_query.level_count() > 1 {
            multi_query = GroupByNormalizer.normalize_multi_query(multi_query);
        }
        info!(
            levels = multi_query.level_count(),
            forks = self.subquery_counter,
            "multi-query forking finished"
        );
        Ok(multi_query)
    }

    #[allow(clippy::type_complexity)]
    fn scan_subquery_and_make_forks(
        &mut self,
        multi_query: &CompiledMultiLevelQuery,
        index: MultiQueryIndex,
        alias_to_subquery: &HashMap<String, String>,
    ) -> Result<(CompiledQuery, Vec<IncrementalPatch>, Vec<(MultiQueryIndex, CompiledQuery)>)> {
        let mut local = multi_query.clone();
        let query = local.query(index)?.clone();
        let mut lists: BTreeMap<QueryPart, Vec<CompiledFormulaInfo>> = FORKED_PARTS
            .iter()
            .map(|part| (*part, query.formula_list(*part).to_vec()))
            .collect();

        let infos = self.collect_fork_infos(&lists, alias_to_subquery, &local)?;
        if infos.is_empty() {
            return Ok((query, Vec::new(), Vec::new()));
        }
        if self.config.verbose_logging {
            debug!(query_id = %query.id, forks = infos.len(), "sub-query forks detected");
        }
        let dim_sets: Vec<BTreeSet<NodeExtract>> = infos.iter().map(|(sig, _)| sig.dims.clone()).collect();
        let union: BTreeSet<NodeExtract> = dim_sets.iter().flatten().cloned().collect();
        let compatible = dim_sets.contains(&union);
        if !compatible {
            debug!(query_id = %query.id, "sub-query LODs are incompatible");
        }

        let skip_forking = self.config.skip_redundant_forks && infos.len() == 1 && {
            let info = &infos[0].1;
            let original = find_subquery(&local, &info.original_subquery_id)?.1;
            let fork_dims = dimension_aliases(&info.dimensions)?;
            let original_dims: BTreeSet<String> = original.group_by.iter().map(|f| f.alias_str().to_string()).collect();
            is_self_eq_join(&info.joining) && fork_dims == original_dims
        };

        let mut incremental = Vec::new();
        let mut replacements = Vec::new();
        let mut used_ids: BTreeSet<String> = query.joined_from.iter_ids().map(str::to_string).collect();
        let mut join_on = Vec::new();
        let mut new_queries: HashMap<String, CompiledQuery> = HashMap::new();

        for (_, info) in infos {
            let mut new_avatar_ids = BTreeSet::new();
            let mut remapped_aliases: HashMap<String, String> = HashMap::new();

            if !skip_forking {
                let dims = dimension_aliases(&info.dimensions)?;
                let (sub_idx, original) = find_subquery(&local, &info.original_subquery_id)?;
                let mut original = original.clone();
                let mut required = info.required_select_aliases.clone();
                let mut joining = info.joining.clone();

                if joining.children().is_empty() {
                    // Zero-dimension LOD: join on a constant column.
                    let dummy_alias = format!("{}_d_0", original.id);
                    if !original.select.iter().any(|f| f.alias_str() == dummy_alias) {
                        original = add_dummy_select_column(&original, &dummy_alias);
                        local = apply_replacement_patches(&local, vec![(sub_idx, original.clone())])?;
                        replacements.push((sub_idx, original.clone()));
                    }
                    joining = n::joining(vec![n::self_eq(n::field(&dummy_alias))]);
                    required.insert(dummy_alias);
                }

                if sub_idx.query_idx != 0 {
                    // Not the main sub-query of its level: it must be grouped by
                    // every fork dimension to be joined on them.
                    let gb_aliases: HashSet<String> =
                        original.group_by.iter().map(|f| f.alias_str().to_string()).collect();
                    let missing: Vec<CompiledFormulaInfo> = dims
                        .iter()
                        .filter(|alias| !gb_aliases.contains(*alias))
                        .filter_map(|alias| original.select.iter().find(|f| f.alias_str() == alias).cloned())
                        .collect();
                    if !missing.is_empty() {
                        original.group_by.extend(missing);
                        local = apply_replacement_patches(&local, vec![(sub_idx, original.clone())])?;
                        replacements.push((sub_idx, original.clone()));
                    }
                }

                let (patch, forked, remapped) =
                    self.fork_subquery(&local, sub_idx, &required, &info.bfb_field_ids, &dims)?;
                incremental.push(patch);
                if let Some(expr) = make_fork_join_on(&original, &forked, &joining, &remapped, info.join_type)? {
                    join_on.push(expr);
                }
                if self.config.verbose_logging {
                    debug!(original = %original.id, forked = %forked.id, "forked sub-query");
                }
                remapped_aliases.extend(remapped);
                used_ids.insert(forked.id.clone());
                new_avatar_ids.insert(forked.id.clone());
                new_queries.insert(forked.id.clone(), forked);
            }

            for node_index in &info.node_indices {
                let items = lists
                    .get_mut(&node_index.part)
                    .ok_or_else(|| LodqError::Planning(format!("no {:?} clause", node_index.part)))?;
                let item = &items[node_index.expr_idx];
                let fork = item
                    .formula
                    .get(&node_index.node_idx)
                    .filter(|node| node.is(NodeType::QueryFork))
                    .ok_or_else(|| LodqError::Planning(format!("expected a query fork at {}", node_index.node_idx)))?;
                let result_expr = fork.fork_parts().map(|(_, result, ..)| result.clone()).unwrap_or_else(|| fork.clone());
                let replacement = if !compatible {
                    n::error("LOD dimensions are incompatible", FormulaErrorCode::LodIncompatibleDimensions)
                } else if skip_forking {
                    result_expr
                } else {
                    remap_fields(&result_expr, &remapped_aliases)
                };
                let mut updated = item.with_formula(item.formula.replace_at_index(&node_index.node_idx, replacement));
                updated.avatar_ids.extend(new_avatar_ids.iter().cloned());
                items[node_index.expr_idx] = updated;
            }
        }

        let mut updated = query.clone();
        for (part, items) in lists {
            *updated.formula_list_mut(part) = items;
        }
        updated.join_on.extend(join_on);

        let lower: HashMap<&str, &CompiledQuery> = local.levels[index.level_idx - 1]
            .queries
            .iter()
            .map(|q| (q.id.as_str(), q))
            .chain(new_queries.iter().map(|(id, q)| (id.as_str(), q)))
            .collect();
        let mut froms = Vec::with_capacity(used_ids.len());
        for from_id in &used_ids {
            let subquery = lower
                .get(from_id.as_str())
                .ok_or_else(|| LodqError::Planning(format!("unknown sub-query {from_id}")))?;
            let columns = subquery.select.iter().map(|f| FromColumn::aliased(f.alias_str())).collect();
            froms.push(FromObject::subquery(from_id, columns));
        }
        updated.joined_from = JoinedFromObject {
            root_from_id: query.joined_from.root_from_id.clone(),
            froms,
        };
        Ok((updated, incremental, replacements))
    }

    fn collect_fork_infos(
        &self,
        lists: &BTreeMap<QueryPart, Vec<CompiledFormulaInfo>>,
        alias_to_subquery: &HashMap<String, String>,
        multi_query: &CompiledMultiLevelQuery,
    ) -> Result<Vec<(SubqueryForkSignature, SubqueryForkInfo)>> {
        let mut infos: Vec<(SubqueryForkSignature, SubqueryForkInfo)> = Vec::new();
        let mut lod_counter = 0;
        let mut lod_idx_by_child_dims: HashMap<BTreeSet<BTreeSet<NodeExtract>>, usize> = HashMap::new();

        for part in FORKED_PARTS {
            let Some(items) = lists.get(&part) else {
                continue;
            };
            for (expr_idx, item) in items.iter().enumerate() {
                let mut forks = Vec::new();
                find_forks(&item.formula, &NodeHierarchyIndex::root(), &mut forks);
                for (node_idx, fork) in forks {
                    let Some((joining, result_expr, lod, bfb, _)) = fork.fork_parts() else {
                        continue;
                    };
                    let mut significant = vec![result_expr.clone()];
                    for condition in joining.children() {
                        match condition.node_type() {
                            NodeType::BinaryJoinCondition => significant.push(condition.children()[1].clone()),
                            NodeType::SelfEqualityJoinCondition => significant.push(condition.children()[0].clone()),
                            _ => {}
                        }
                    }
                    let required: BTreeSet<String> = significant.iter().flat_map(used_fields).collect();
                    let subquery_ids = required
                        .iter()
                        .map(|alias| {
                            alias_to_subquery
                                .get(alias)
                                .cloned()
                                .ok_or_else(|| LodqError::Planning(format!("unknown column {alias}")))
                        })
                        .collect::<Result<BTreeSet<String>>>()?;
                    let original_subquery_id = match subquery_ids.len() {
                        1 => subquery_ids.into_iter().next().unwrap_or_default(),
                        found => {
                            return Err(LodqError::Planning(format!(
                                "a query fork must read from exactly one sub-query, found {found}"
                            )))
                        }
                    };

                    let join_type = fork.join_type().map(JoinType::from).unwrap_or(JoinType::Left);
                    let dimensions: Vec<Node> = match lod.lod_kind() {
                        Some(LodKind::Fixed) => lod.children().to_vec(),
                        Some(LodKind::Inherited) => {
                            let (_, original) = find_subquery(multi_query, &original_subquery_id)?;
                            original.group_by.iter().map(|f| n::field(f.alias_str())).collect()
                        }
                        other => {
                            return Err(LodqError::Unsupported(format!("query fork with {other:?} LOD")));
                        }
                    };

                    let lod_idx = if self.config.disable_lod_grouping {
                        lod_counter += 1;
                        lod_counter
                    } else {
                        let child_dims = child_dimension_sets(&fork, alias_to_subquery, multi_query);
                        let next = lod_idx_by_child_dims.len();
                        *lod_idx_by_child_dims.entry(child_dims).or_insert(next)
                    };
                    let bfb_names = bfb.bfb_names().cloned().unwrap_or_default();
                    let signature = SubqueryForkSignature {
                        lod_idx,
                        joining: joining.extract().cloned(),
                        bfb_names: bfb_names.clone(),
                        dims: dimensions.iter().filter_map(|d| d.extract().cloned()).collect(),
                        join_type,
                    };

                    let pos = match infos.iter().position(|(sig, _)| sig == &signature) {
                        Some(pos) => pos,
                        None => {
                            infos.push((
                                signature,
                                SubqueryForkInfo {
                                    original_subquery_id: original_subquery_id.clone(),
                                    joining: joining.clone(),
                                    bfb_field_ids: bfb_names,
                                    dimensions,
                                    join_type,
                                    required_select_aliases: BTreeSet::new(),
                                    node_indices: Vec::new(),
                                },
                            ));
                            infos.len() - 1
                        }
                    };
                    let info = &mut infos[pos].1;
                    if info.original_subquery_id != original_subquery_id {
                        return Err(LodqError::Planning(format!(
                            "sub-query mismatch: expected {}, got {original_subquery_id}",
                            info.original_subquery_id
                        )));
                    }
                    info.required_select_aliases.extend(required);
                    info.node_indices.push(FullNodeIndex {
                        part,
                        expr_idx,
                        node_idx,
                    });
                }
            }
        }
        Ok(infos)
    }

    /// Clone the sub-query at `index` and its ancestors.
    #[allow(clippy::type_complexity)]
    fn fork_subquery(
        &mut self,
        multi_query: &CompiledMultiLevelQuery,
        index: MultiQueryIndex,
        required_select_aliases: &BTreeSet<String>,
        bfb_field_ids: &BTreeSet<String>,
        dimension_aliases: &BTreeSet<String>,
    ) -> Result<(IncrementalPatch, CompiledQuery, HashMap<String, String>)> {
        let original = multi_query.query(index)?;
        let forked_id = self.make_forked_id(&original.id);
        if !original.order_by.is_empty() {
            return Err(LodqError::Planning(format!(
                "sub-query {} with ORDER BY cannot be forked",
                original.id
            )));
        }
        let required: BTreeSet<&str> = required_select_aliases
            .iter()
            .chain(dimension_aliases.iter())
            .map(String::as_str)
            .collect();

        let mut stripped = original.clone();
        stripped.select = original
            .select
            .iter()
            .filter(|f| required.contains(f.alias_str()))
            .cloned()
            .collect();
        let mut gb_aliases = HashSet::new();
        stripped.group_by = original
            .group_by
            .iter()
            .chain(original.select.iter())
            .filter(|f| dimension_aliases.contains(f.alias_str()) && gb_aliases.insert(f.alias_str().to_string()))
            .cloned()
            .collect();
        stripped.filters = original
            .filters
            .iter()
            .filter(|f| {
                f.original_field_id
                    .as_ref()
                    .map_or(true, |id| !bfb_field_ids.contains(id.as_str()))
            })
            .cloned()
            .collect();

        let (mut patch, parent_aliases, parent_ids) = self.fork_all_parents(multi_query, index)?;
        let (forked, remapped) = copy_and_remap_query(&stripped, &forked_id, &parent_aliases, &parent_ids)?;
        patch.add_query(index.level_idx, forked.clone());
        if self.config.verbose_logging {
            debug!(forked = %forked_id, aliases = ?remapped, "forked sub-query aliases");
        }
        Ok((patch, forked, remapped))
    }

    #[allow(clippy::type_complexity)]
    fn fork_all_parents(
        &mut self,
        multi_query: &CompiledMultiLevelQuery,
        index: MultiQueryIndex,
    ) -> Result<(IncrementalPatch, HashMap<String, String>, HashMap<String, String>)> {
        let mut patch = IncrementalPatch::with_levels(index.level_idx + 1);
        let ancestors = collect_ancestors_by_level(multi_query, index)?;
        let mut remapped_ids: HashMap<String, String> = HashMap::new();
        let mut lower_aliases: HashMap<String, String> = HashMap::new();
        for level_idx in 0..index.level_idx {
            let mut level_aliases = HashMap::new();
            for parent in ancestors.get(&level_idx).into_iter().flatten() {
                let new_id = self.make_forked_id(&parent.id);
                let (clone, aliases) = copy_and_remap_query(parent, &new_id, &lower_aliases, &remapped_ids)?;
                remapped_ids.insert(parent.id.clone(), new_id);
                level_aliases.extend(aliases);
                patch.add_query(level_idx, clone);
            }
            lower_aliases = level_aliases;
        }
        Ok((patch, lower_aliases, remapped_ids))
    }

    /// `<id>_f<n>`, replacing an existing `_f<n>` suffix.
    fn make_forked_id(&mut self, original_id: &str) -> String {
        let prefix = match original_id.rsplit_once("_f") {
            Some((prefix, digits)) if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) => prefix,
            _ => original_id,
        };
        let id = format!("{prefix}_f{}", self.subquery_counter);
        self.subquery_counter += 1;
        id
    }
}

fn alias_to_query_id_map(queries: &[CompiledQuery]) -> HashMap<String, String> {
    queries
        .iter()
        .flat_map(|q| q.select.iter().map(move |f| (f.alias_str().to_string(), q.id.clone())))
        .collect()
}

fn select_aliases_by_query(queries: &[CompiledQuery]) -> HashMap<String, Vec<String>> {
    queries
        .iter()
        .map(|q| (q.id.clone(), q.select.iter().map(|f| f.alias_str().to_string()).collect()))
        .collect()
}

fn find_subquery<'q>(multi_query: &'q CompiledMultiLevelQuery, id: &str) -> Result<(MultiQueryIndex, &'q CompiledQuery)> {
    let index = multi_query
        .query_index_by_id(id)
        .ok_or_else(|| LodqError::Planning(format!("unknown sub-query id: {id}")))?;
    Ok((index, multi_query.query(index)?))
}

/// Field dimension names; literal and error dimensions are ignored.
fn dimension_aliases(dimensions: &[Node]) -> Result<BTreeSet<String>> {
    let mut aliases = BTreeSet::new();
    for dim in dimensions {
        match dim.node_type() {
            NodeType::Field => {
                if let Some(name) = dim.field_name() {
                    aliases.insert(name.to_string());
                }
            }
            NodeType::Literal | NodeType::Error => {}
            other => {
                return Err(LodqError::Planning(format!(
                    "fork dimension must be a field, got {other:?}"
                )))
            }
        }
    }
    Ok(aliases)
}

fn is_self_eq_join(joining: &Node) -> bool {
    joining
        .children()
        .iter()
        .all(|c| c.is(NodeType::SelfEqualityJoinCondition))
}

/// Fork nodes in `node`, not descending into forks.
fn find_forks(node: &Node, prefix: &NodeHierarchyIndex, out: &mut Vec<(NodeHierarchyIndex, Node)>) {
    if node.is(NodeType::QueryFork) {
        out.push((prefix.clone(), node.clone()));
        return;
    }
    for (pos, child) in node.children().iter().enumerate() {
        find_forks(child, &prefix.child(pos), out);
    }
}

/// FIXED dimension sets of forks nested in the sub-query columns `fork`
/// reads.
fn child_dimension_sets(
    fork: &Node,
    alias_to_subquery: &HashMap<String, String>,
    multi_query: &CompiledMultiLevelQuery,
) -> BTreeSet<BTreeSet<NodeExtract>> {
    let mut result = BTreeSet::new();
    for alias in used_fields(fork) {
        let Some(subquery) = alias_to_subquery
            .get(&alias)
            .and_then(|id| multi_query.query_index_by_id(id))
            .and_then(|idx| multi_query.get(idx))
        else {
            continue;
        };
        let Some(item) = subquery.select.iter().find(|f| f.alias_str() == alias) else {
            continue;
        };
        for child in item.formula.visit_node_type(NodeType::QueryFork) {
            let Some(lod) = child.lod() else {
                continue;
            };
            if lod.lod_kind() == Some(LodKind::Fixed) {
                result.insert(lod.children().iter().filter_map(|d| d.extract().cloned()).collect());
            }
        }
    }
    result
}

/// Ancestors of the query at `index`, per level below it.
fn collect_ancestors_by_level(
    multi_query: &CompiledMultiLevelQuery,
    index: MultiQueryIndex,
) -> Result<BTreeMap<usize, Vec<CompiledQuery>>> {
    let mut by_level = BTreeMap::new();
    let mut children = vec![multi_query.query(index)?.clone()];
    for level_idx in (0..index.level_idx).rev() {
        let parent_ids: HashSet<&str> = children.iter().flat_map(|q| q.joined_from.iter_ids()).collect();
        let parents: Vec<CompiledQuery> = multi_query.levels[level_idx]
            .queries
            .iter()
            .filter(|q| parent_ids.contains(q.id.as_str()))
            .cloned()
            .collect();
        by_level.insert(level_idx, parents.clone());
        children = parents;
    }
    Ok(by_level)
}

/// `_==` JOIN ON between the original sub-query and its fork.
fn make_fork_join_on(
    original: &CompiledQuery,
    forked: &CompiledQuery,
    joining: &Node,
    remapped: &HashMap<String, String>,
    join_type: JoinType,
) -> Result<Option<CompiledFormulaInfo>> {
    let mut parts = Vec::with_capacity(joining.children().len());
    for part in joining.children() {
        let (original_expr, fork_expr) = match part.node_type() {
            NodeType::SelfEqualityJoinCondition => {
                let expr = &part.children()[0];
                if !matches!(expr.node_type(), NodeType::Field | NodeType::Error) {
                    return Err(LodqError::Planning(format!(
                        "self-equality join over a non-field expression for {}",
                        forked.id
                    )));
                }
                (expr.clone(), expr.clone())
            }
            NodeType::BinaryJoinCondition => (part.children()[0].clone(), part.children()[1].clone()),
            other => return Err(LodqError::Unsupported(format!("join condition {other:?}"))),
        };
        // The fork side is evaluated against the forked sub-query.
        parts.push(n::binary("_==", original_expr, remap_fields(&fork_expr, remapped)));
    }
    Ok(n::and_all(parts).map(|condition| {
        CompiledFormulaInfo::new(n::formula(condition), None)
            .with_avatar_ids([original.id.clone(), forked.id.clone()])
            .with_join(JoinSpec {
                left_id: original.id.clone(),
                right_id: forked.id.clone(),
                join_type,
            })
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::{CompiledLevel, ExecutionLevel};
    use lodq_common::FieldId;
    use lodq_formula::ForkJoinType;

    fn item(expr: Node, alias: &str) -> CompiledFormulaInfo {
        CompiledFormulaInfo::new(n::formula(expr), Some(alias.to_string()))
    }

    fn query(id: &str, froms: Vec<FromObject>) -> CompiledQuery {
        let mut q = CompiledQuery::new(id, ExecutionLevel::SourceDb);
        q.joined_from = JoinedFromObject {
            root_from_id: froms.first().map(|f| f.id.clone()),
            froms,
        };
        q
    }

    /// Level 0 `q0`: city as c, sum(sales) as s grouped by city.
    fn bottom() -> CompiledQuery {
        let mut q = query("q0", vec![FromObject::avatar("t", vec![])]);
        q.select.push(item(n::field("city"), "c"));
        q.select.push(item(n::func("sum", vec![n::field("sales")]), "s"));
        q.group_by.push(item(n::field("city"), "c"));
        q
    }

    fn fork(dims: Vec<Node>, conditions: Vec<Node>, bfb: &[&str]) -> Node {
        n::query_fork(ForkJoinType::Left, conditions, n::field("s"), n::fixed(dims), n::bfb(bfb), vec![])
    }

    fn top(fork_node: Node) -> CompiledQuery {
        let mut q = query(
            "qq",
            vec![FromObject::subquery("q0", vec![FromColumn::aliased("c"), FromColumn::aliased("s")])],
        );
        q.select.push(item(n::field("c"), "res_0"));
        q.select.push(item(fork_node, "res_1"));
        q
    }

    fn levels(queries: Vec<Vec<CompiledQuery>>) -> CompiledMultiLevelQuery {
        CompiledMultiLevelQuery::new(
            queries
                .into_iter()
                .map(|queries| CompiledLevel {
                    level_type: ExecutionLevel::SourceDb,
                    queries,
                })
                .collect(),
        )
    }

    #[test]
    fn redundant_fork_is_skipped() {
        let mq = levels(vec![
            vec![bottom()],
            vec![top(fork(vec![n::field("c")], vec![n::self_eq(n::field("c"))], &[]))],
        ]);
        let out = QueryForker::new(ForkerConfig::default())
            .scan_and_fork_multi_query(&mq)
            .expect("fork");
        assert_eq!(out.levels[0].queries.len(), 1);
        let top = &out.levels[1].queries[0];
        assert_eq!(top.select[1].expr(), &n::field("s"));
        assert!(top.join_on.is_empty());
    }

    #[test]
    fn fork_clones_sub_query_and_joins_it() {
        let mq = levels(vec![
            vec![bottom()],
            vec![top(fork(vec![n::field("c")], vec![n::self_eq(n::field("c"))], &[]))],
        ]);
        let config = ForkerConfig {
            skip_redundant_forks: false,
            ..ForkerConfig::default()
        };
        let out = QueryForker::new(config).scan_and_fork_multi_query(&mq).expect("fork");
        let ids: Vec<&str> = out.levels[0].queries.iter().map(|q| q.id.as_str()).collect();
        assert_eq!(ids, vec!["q0", "q0_f0"]);
        let forked = &out.levels[0].queries[1];
        assert_eq!(forked.select.len(), 2);
        assert_eq!(forked.group_by.len(), 1);

        let top = &out.levels[1].queries[0];
        assert_eq!(top.select[1].expr(), &n::field("q0_f0_1"));
        assert!(top.select[1].avatar_ids.contains("q0_f0"));
        assert_eq!(top.join_on.len(), 1);
        assert_eq!(
            top.join_on[0].expr(),
            &n::binary("_==", n::field("c"), n::field("q0_f0_0"))
        );
        let from_ids: Vec<&str> = top.joined_from.iter_ids().collect();
        assert_eq!(from_ids, vec!["q0", "q0_f0"]);
    }

    #[test]
    fn zero_dimension_fork_adds_dummy_column() {
        let mq = levels(vec![vec![bottom()], vec![top(fork(vec![], vec![], &[]))]]);
        let out = QueryForker::new(ForkerConfig::default())
            .scan_and_fork_multi_query(&mq)
            .expect("fork");
        let original = &out.levels[0].queries[0];
        assert!(original.select.iter().any(|f| f.alias_str() == "q0_d_0"));
        let forked = &out.levels[0].queries[1];
        assert!(forked.group_by.is_empty());
        let top = &out.levels[1].queries[0];
        assert_eq!(
            top.join_on[0].expr(),
            &n::binary("_==", n::field("q0_d_0"), n::field("q0_f0_1"))
        );
    }

    #[test]
    fn ancestors_are_cloned_down_to_level_zero() {
        let mut a = query("a", vec![FromObject::avatar("t", vec![])]);
        a.select.push(item(n::field("city"), "a_c"));
        a.select.push(item(n::field("sales"), "a_s"));
        let mut b = query(
            "b",
            vec![FromObject::subquery("a", vec![FromColumn::aliased("a_c"), FromColumn::aliased("a_s")])],
        );
        b.select.push(item(n::field("a_c"), "c"));
        b.select.push(item(n::func("sum", vec![n::field("a_s")]), "s"));
        b.group_by.push(item(n::field("a_c"), "c"));
        b.filters.push(
            CompiledFormulaInfo::new(n::formula(n::binary("==", n::field("a_c"), n::lit_str("x"))), None)
                .with_field_id(Some(FieldId::from("f_city"))),
        );
        let mut qq = query(
            "qq",
            vec![FromObject::subquery("b", vec![FromColumn::aliased("c"), FromColumn::aliased("s")])],
        );
        qq.select.push(item(n::field("c"), "res_0"));
        qq.select.push(item(
            n::query_fork(
                ForkJoinType::Left,
                vec![n::self_eq(n::field("c"))],
                n::field("s"),
                n::inherited_lod(),
                n::bfb(&["f_city"]),
                vec![],
            ),
            "res_1",
        ));
        let mq = levels(vec![vec![a], vec![b], vec![qq]]);
        let config = ForkerConfig {
            skip_redundant_forks: false,
            ..ForkerConfig::default()
        };
        let out = QueryForker::new(config).scan_and_fork_multi_query(&mq).expect("fork");

        let level0: Vec<&str> = out.levels[0].queries.iter().map(|q| q.id.as_str()).collect();
        assert_eq!(level0, vec!["a", "a_f1"]);
        let forked = &out.levels[1].queries[1];
        assert_eq!(forked.id, "b_f0");
        assert!(forked.filters.is_empty());
        let from_ids: Vec<&str> = forked.joined_from.iter_ids().collect();
        assert_eq!(from_ids, vec!["a_f1"]);
        assert!(used_fields(&forked.select[0].formula).iter().all(|f| f.starts_with("a_f1_")));
    }

    #[test]
    fn forked_ids_replace_existing_suffix() {
        let mut forker = QueryForker::default();
        assert_eq!(forker.make_forked_id("q0"), "q0_f0");
        assert_eq!(forker.make_forked_id("q0_f0"), "q0_f1");
        assert_eq!(forker.make_forked_id("a_fx"), "a_fx_f2");
    }
}
