//! Helpers shared by the splitter and the forker: field/alias remapping,
//! query copies and multi-query patches.

use lodq_common::{LodqError, Result};
use lodq_formula::inspect::used_fields;
use lodq_formula::mutation::FieldRemapMutation;
use lodq_formula::shortcuts as n;
use lodq_formula::{apply_mutations, FormulaMutation, Node, NodeType};
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::primitives::{
    CompiledFormulaInfo, CompiledLevel, CompiledMultiLevelQuery, CompiledMultiQuery, CompiledQuery,
    FromColumn, FromObject, FromSource, JoinedFromObject, MultiQueryIndex, QueryPart,
};

/// Rename field references; `node` itself may be a bare field.
pub fn remap_fields(node: &Node, names: &HashMap<String, String>) -> Node {
    if names.is_empty() {
        return node.clone();
    }
    let mutations: Vec<Box<dyn FormulaMutation>> = vec![Box::new(FieldRemapMutation::new(names.clone()))];
    if node.is(NodeType::Formula) {
        return apply_mutations(node, &mutations);
    }
    let wrapped = n::formula(node.clone());
    let remapped = apply_mutations(&wrapped, &mutations);
    if remapped.ptr_eq(&wrapped) {
        node.clone()
    } else {
        remapped.expr().clone()
    }
}

pub fn used_avatar_ids<'f>(formulas: impl IntoIterator<Item = &'f CompiledFormulaInfo>) -> BTreeSet<String> {
    formulas
        .into_iter()
        .flat_map(|f| f.avatar_ids.iter().cloned())
        .collect()
}

/// Field names referenced by any formula of any query of a level.
pub fn level_used_fields(level: &CompiledLevel) -> HashSet<String> {
    level
        .queries
        .iter()
        .flat_map(|q| q.all_formulas())
        .flat_map(|f| used_fields(&f.formula))
        .collect()
}

/// Assigns `<base>_<n>` aliases, one per distinct old alias.
#[derive(Debug, Clone)]
pub struct AliasRemapper {
    base: String,
    mapping: HashMap<String, String>,
    counter: usize,
}

impl AliasRemapper {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            mapping: HashMap::new(),
            counter: 0,
        }
    }

    pub fn remap(&mut self, old_alias: &str) -> String {
        if let Some(alias) = self.mapping.get(old_alias) {
            return alias.clone();
        }
        let alias = format!("{}_{}", self.base, self.counter);
        self.counter += 1;
        self.mapping.insert(old_alias.to_string(), alias.clone());
        alias
    }

    pub fn into_mapping(self) -> HashMap<String, String> {
        self.mapping
    }
}

/// Copy of a formula with renamed fields, alias and FROM ids.
pub fn remap_compiled_formula(
    formula: &CompiledFormulaInfo,
    alias: Option<String>,
    field_names: &HashMap<String, String>,
    from_ids: &HashMap<String, String>,
) -> CompiledFormulaInfo {
    let remap_id = |id: &String| from_ids.get(id).cloned().unwrap_or_else(|| id.clone());
    let mut out = formula.with_formula(remap_fields(&formula.formula, field_names));
    out.alias = alias;
    out.avatar_ids = formula.avatar_ids.iter().map(remap_id).collect();
    if let Some(join) = out.join.as_mut() {
        join.left_id = remap_id(&join.left_id);
        join.right_id = remap_id(&join.right_id);
    }
    out
}

/// Clone `query` as `new_id`: aliases are renamed `<new_id>_<n>`, fields
/// and FROM ids remapped. Returns the copy and its old-to-new alias map.
pub fn copy_and_remap_query(
    query: &CompiledQuery,
    new_id: &str,
    field_names: &HashMap<String, String>,
    from_ids: &HashMap<String, String>,
) -> Result<(CompiledQuery, HashMap<String, String>)> {
    let mut remapper = AliasRemapper::new(new_id);
    let mut copy = query.clone();
    copy.id = new_id.to_string();
    for part in [
        QueryPart::Select,
        QueryPart::GroupBy,
        QueryPart::OrderBy,
        QueryPart::Filters,
        QueryPart::JoinOn,
    ] {
        let remapped: Vec<CompiledFormulaInfo> = query
            .formula_list(part)
            .iter()
            .map(|f| {
                let alias = match (part, &f.alias) {
                    (QueryPart::JoinOn, _) | (_, None) => None,
                    (_, Some(alias)) => Some(remapper.remap(alias)),
                };
                remap_compiled_formula(f, alias, field_names, from_ids)
            })
            .collect();
        *copy.formula_list_mut(part) = remapped;
    }

    let reverse: HashMap<&str, &str> = from_ids
        .iter()
        .map(|(old, new)| (new.as_str(), old.as_str()))
        .collect();
    let originals: HashMap<&str, &FromObject> = query
        .joined_from
        .froms
        .iter()
        .map(|f| (f.id.as_str(), f))
        .collect();
    let new_ids: BTreeSet<String> = query
        .joined_from
        .iter_ids()
        .map(|id| from_ids.get(id).cloned().unwrap_or_else(|| id.to_string()))
        .collect();
    let mut froms = Vec::with_capacity(new_ids.len());
    for new_from_id in &new_ids {
        let old_from_id = reverse.get(new_from_id.as_str()).copied().unwrap_or(new_from_id.as_str());
        let original = originals.get(old_from_id).ok_or_else(|| {
            LodqError::Planning(format!("unknown FROM object {old_from_id} in query {}", query.id))
        })?;
        if new_from_id == old_from_id {
            froms.push((*original).clone());
            continue;
        }
        if !original.is_subquery() {
            return Err(LodqError::Planning(format!(
                "avatar FROM object {old_from_id} cannot be remapped"
            )));
        }
        let columns = original
            .columns
            .iter()
            .map(|col| {
                field_names
                    .get(&col.id)
                    .map(|name| FromColumn::aliased(name))
                    .ok_or_else(|| {
                        LodqError::Planning(format!("column {} of {old_from_id} has no remapped name", col.id))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        froms.push(FromObject::subquery(new_from_id, columns));
    }
    copy.joined_from = JoinedFromObject {
        root_from_id: query
            .joined_from
            .root_from_id
            .as_ref()
            .map(|id| from_ids.get(id).cloned().unwrap_or_else(|| id.clone())),
        froms,
    };
    Ok((copy, remapper.into_mapping()))
}

/// Add a constant `1` column to SELECT and GROUP BY (join key for
/// zero-dimension LODs).
pub fn add_dummy_select_column(query: &CompiledQuery, alias: &str) -> CompiledQuery {
    let dummy = CompiledFormulaInfo::new(n::formula(n::lit_int(1)), Some(alias.to_string()));
    let mut out = query.clone();
    out.select.push(dummy.clone());
    out.group_by.push(dummy);
    out
}

/// Recompute FROM columns of sub-query FROM objects from the columns the
/// query actually references.
pub fn refresh_subquery_columns(query: &mut CompiledQuery, available: &HashMap<String, Vec<String>>) {
    let used: HashSet<String> = query
        .all_formulas()
        .flat_map(|f| used_fields(&f.formula))
        .collect();
    for from in query.joined_from.froms.iter_mut() {
        let FromSource::Subquery { query_id } = &from.source else {
            continue;
        };
        if let Some(aliases) = available.get(query_id) {
            from.columns = aliases
                .iter()
                .filter(|alias| used.contains(alias.as_str()))
                .map(|alias| FromColumn::aliased(alias))
                .collect();
        }
    }
}

// -----------------------------
// Multi-query patches
// -----------------------------

/// Replacement of one query of a flat multi-query by a set of queries.
#[derive(Debug, Clone)]
pub struct CompiledMultiQueryPatch {
    /// The query being split; the patch's top query keeps this id.
    pub replaced_id: String,
    pub patch: CompiledMultiQuery,
}

impl CompiledMultiQueryPatch {
    /// Substitute the patched query; the new queries go where it was.
    pub fn apply(self, multi_query: &CompiledMultiQuery) -> Result<CompiledMultiQuery> {
        let existing: HashSet<&str> = multi_query
            .queries
            .iter()
            .filter(|q| q.id != self.replaced_id)
            .map(|q| q.id.as_str())
            .collect();
        if let Some(dup) = self.patch.queries.iter().find(|q| existing.contains(q.id.as_str())) {
            return Err(LodqError::Planning(format!(
                "patch query id {} is already used",
                dup.id
            )));
        }
        let pos = multi_query
            .queries
            .iter()
            .position(|q| q.id == self.replaced_id)
            .ok_or_else(|| LodqError::Planning(format!("unknown query {}", self.replaced_id)))?;
        let mut queries = multi_query.queries[..pos].to_vec();
        queries.extend(self.patch.queries);
        queries.extend(multi_query.queries[pos + 1..].iter().cloned());
        Ok(CompiledMultiQuery::new(queries))
    }
}

/// New queries to append to the lowest levels of a multi-level query.
#[derive(Debug, Clone, Default)]
pub struct IncrementalPatch {
    pub level_patches: Vec<Vec<CompiledQuery>>,
}

impl IncrementalPatch {
    pub fn with_levels(level_count: usize) -> Self {
        Self {
            level_patches: vec![Vec::new(); level_count],
        }
    }

    pub fn add_query(&mut self, level_idx: usize, query: CompiledQuery) {
        if self.level_patches.len() <= level_idx {
            self.level_patches.resize_with(level_idx + 1, Vec::new);
        }
        self.level_patches[level_idx].push(query);
    }

    pub fn is_empty(&self) -> bool {
        self.level_patches.iter().all(Vec::is_empty)
    }
}

pub fn apply_incremental_patches(
    multi_query: &CompiledMultiLevelQuery,
    patches: &[IncrementalPatch],
) -> Result<CompiledMultiLevelQuery> {
    let mut out = multi_query.clone();
    if patches.iter().all(IncrementalPatch::is_empty) {
        return Ok(out);
    }
    let mut ids: HashSet<String> = multi_query.iter_queries().map(|q| q.id.clone()).collect();
    for patch in patches {
        if patch.level_patches.len() > out.levels.len() {
            return Err(LodqError::Planning(
                "patch has more levels than the multi-query".to_string(),
            ));
        }
        for (level_idx, queries) in patch.level_patches.iter().enumerate() {
            for query in queries {
                if !ids.insert(query.id.clone()) {
                    return Err(LodqError::Planning(format!(
                        "patch contains query id {} already used in multi-query",
                        query.id
                    )));
                }
                out.levels[level_idx].queries.push(query.clone());
            }
        }
    }
    Ok(out)
}

/// Replace queries at given positions.
pub fn apply_replacement_patches(
    multi_query: &CompiledMultiLevelQuery,
    patches: Vec<(MultiQueryIndex, CompiledQuery)>,
) -> Result<CompiledMultiLevelQuery> {
    let mut out = multi_query.clone();
    for (index, query) in patches {
        let slot = out
            .levels
            .get_mut(index.level_idx)
            .and_then(|level| level.queries.get_mut(index.query_idx))
            .ok_or_else(|| LodqError::Planning(format!("no query at {index:?}")))?;
        *slot = query;
    }
    Ok(out)
}
