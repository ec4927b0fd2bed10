//! Compiled query and execution plan data model.
//!
//! Everything here is produced once per request and handed to the SQL
//! emission collaborator, so all types are `serde` serialisable.

use lodq_common::{FieldId, LodqError, Result};
use lodq_formula::{ForkJoinType, LevelTag, Node};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Physical evaluation tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionLevel {
    /// SQL backend.
    SourceDb,
    /// In-process compute engine.
    Compeng,
}

/// Clause of a query a formula belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryPart {
    Select,
    GroupBy,
    OrderBy,
    Filters,
    JoinOn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
}

impl From<ForkJoinType> for JoinType {
    fn from(value: ForkJoinType) -> Self {
        match value {
            ForkJoinType::Left => Self::Left,
            ForkJoinType::Inner => Self::Inner,
        }
    }
}

/// Sides and kind of a JOIN ON item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinSpec {
    /// Root side of the join.
    pub left_id: String,
    pub right_id: String,
    pub join_type: JoinType,
}

/// One compiled expression of a query clause.
///
/// ORDER BY items carry a `direction`, JOIN ON items a `join` spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledFormulaInfo {
    /// Always a `Formula` wrapper node.
    pub formula: Node,
    pub alias: Option<String>,
    /// Field the formula was compiled from (filters rely on it for BFB).
    pub original_field_id: Option<FieldId>,
    /// Avatars or sub-queries the formula reads from.
    pub avatar_ids: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<OrderDirection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join: Option<JoinSpec>,
}

impl CompiledFormulaInfo {
    pub fn new(formula: Node, alias: Option<String>) -> Self {
        Self {
            formula,
            alias,
            original_field_id: None,
            avatar_ids: BTreeSet::new(),
            direction: None,
            join: None,
        }
    }

    pub fn with_field_id(mut self, field_id: Option<FieldId>) -> Self {
        self.original_field_id = field_id;
        self
    }

    pub fn with_avatar_ids<I, S>(mut self, avatar_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.avatar_ids = avatar_ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_direction(mut self, direction: OrderDirection) -> Self {
        self.direction = Some(direction);
        self
    }

    pub fn with_join(mut self, join: JoinSpec) -> Self {
        self.join = Some(join);
        self
    }

    /// Copy with another formula, everything else kept.
    pub fn with_formula(&self, formula: Node) -> Self {
        Self {
            formula,
            ..self.clone()
        }
    }

    /// The expression under the `Formula` wrapper.
    pub fn expr(&self) -> &Node {
        self.formula.expr()
    }

    /// Alias, or an empty string for unaliased items (JOIN ON).
    pub fn alias_str(&self) -> &str {
        self.alias.as_deref().unwrap_or_default()
    }

    pub fn complexity(&self) -> usize {
        self.formula.complexity()
    }
}

/// Column exposed by a FROM object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FromColumn {
    pub id: String,
    pub name: String,
}

impl FromColumn {
    /// Column whose id and name are both `alias`.
    pub fn aliased(alias: &str) -> Self {
        Self {
            id: alias.to_string(),
            name: alias.to_string(),
        }
    }
}

/// Where a FROM object reads from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FromSource {
    Avatar { avatar_id: String },
    Subquery { query_id: String },
}

/// Item of a query's FROM graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FromObject {
    pub id: String,
    pub alias: String,
    pub columns: Vec<FromColumn>,
    pub source: FromSource,
}

impl FromObject {
    pub fn avatar(avatar_id: &str, columns: Vec<FromColumn>) -> Self {
        Self {
            id: avatar_id.to_string(),
            alias: avatar_id.to_string(),
            columns,
            source: FromSource::Avatar {
                avatar_id: avatar_id.to_string(),
            },
        }
    }

    /// Sub-query FROM whose id, alias and query id are all `query_id`.
    pub fn subquery(query_id: &str, columns: Vec<FromColumn>) -> Self {
        Self {
            id: query_id.to_string(),
            alias: query_id.to_string(),
            columns,
            source: FromSource::Subquery {
                query_id: query_id.to_string(),
            },
        }
    }

    pub fn is_subquery(&self) -> bool {
        matches!(self.source, FromSource::Subquery { .. })
    }
}

/// FROM graph: a root plus the objects joined to it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinedFromObject {
    pub root_from_id: Option<String>,
    pub froms: Vec<FromObject>,
}

impl JoinedFromObject {
    pub fn iter_ids(&self) -> impl Iterator<Item = &str> + '_ {
        self.froms.iter().map(|f| f.id.as_str())
    }
}

/// One un-split (or already split) query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledQuery {
    pub id: String,
    pub level_type: ExecutionLevel,
    pub select: Vec<CompiledFormulaInfo>,
    pub group_by: Vec<CompiledFormulaInfo>,
    pub filters: Vec<CompiledFormulaInfo>,
    pub order_by: Vec<CompiledFormulaInfo>,
    pub join_on: Vec<CompiledFormulaInfo>,
    pub joined_from: JoinedFromObject,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl CompiledQuery {
    pub fn new(id: impl Into<String>, level_type: ExecutionLevel) -> Self {
        Self {
            id: id.into(),
            level_type,
            select: Vec::new(),
            group_by: Vec::new(),
            filters: Vec::new(),
            order_by: Vec::new(),
            join_on: Vec::new(),
            joined_from: JoinedFromObject::default(),
            limit: None,
            offset: None,
        }
    }

    pub fn formula_list(&self, part: QueryPart) -> &[CompiledFormulaInfo] {
        match part {
            QueryPart::Select => &self.select,
            QueryPart::GroupBy => &self.group_by,
            QueryPart::OrderBy => &self.order_by,
            QueryPart::Filters => &self.filters,
            QueryPart::JoinOn => &self.join_on,
        }
    }

    pub fn formula_list_mut(&mut self, part: QueryPart) -> &mut Vec<CompiledFormulaInfo> {
        match part {
            QueryPart::Select => &mut self.select,
            QueryPart::GroupBy => &mut self.group_by,
            QueryPart::OrderBy => &mut self.order_by,
            QueryPart::Filters => &mut self.filters,
            QueryPart::JoinOn => &mut self.join_on,
        }
    }

    /// select, group_by, filters, order_by, join_on in that order.
    pub fn all_formulas(&self) -> impl Iterator<Item = &CompiledFormulaInfo> + '_ {
        self.select
            .iter()
            .chain(self.group_by.iter())
            .chain(self.filters.iter())
            .chain(self.order_by.iter())
            .chain(self.join_on.iter())
    }

    pub fn complexity(&self) -> usize {
        self.all_formulas().map(|f| f.complexity()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.select.is_empty()
    }
}

/// Flat list of queries; queries nobody reads from are the top ones.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompiledMultiQuery {
    pub queries: Vec<CompiledQuery>,
}

impl CompiledMultiQuery {
    pub fn new(queries: Vec<CompiledQuery>) -> Self {
        Self { queries }
    }

    pub fn query_by_id(&self, id: &str) -> Option<&CompiledQuery> {
        self.queries.iter().find(|q| q.id == id)
    }

    /// Queries not referenced by any FROM, ordered by id.
    pub fn top_queries(&self) -> Vec<&CompiledQuery> {
        let referenced: HashSet<&str> = self
            .queries
            .iter()
            .flat_map(|q| q.joined_from.iter_ids())
            .collect();
        let mut top: Vec<&CompiledQuery> = self
            .queries
            .iter()
            .filter(|q| !referenced.contains(q.id.as_str()))
            .collect();
        top.sort_by(|a, b| a.id.cmp(&b.id));
        top
    }

    pub fn single_top_query(&self) -> Result<&CompiledQuery> {
        match self.top_queries().as_slice() {
            [query] => Ok(query),
            other => Err(LodqError::Planning(format!(
                "expected exactly one top query, found {}",
                other.len()
            ))),
        }
    }

    /// FROM objects that are not produced by queries of this multi-query.
    pub fn base_froms(&self) -> Vec<&FromObject> {
        let ids: HashSet<&str> = self.queries.iter().map(|q| q.id.as_str()).collect();
        let mut seen = HashSet::new();
        self.queries
            .iter()
            .flat_map(|q| q.joined_from.froms.iter())
            .filter(|f| !ids.contains(f.id.as_str()) && seen.insert(f.id.as_str()))
            .collect()
    }

    pub fn query_count(&self) -> usize {
        self.queries.len()
    }

    pub fn complexity(&self) -> usize {
        self.queries.iter().map(|q| q.complexity()).sum()
    }
}

/// Position of a query inside a [`CompiledMultiLevelQuery`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MultiQueryIndex {
    pub level_idx: usize,
    pub query_idx: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledLevel {
    pub level_type: ExecutionLevel,
    pub queries: Vec<CompiledQuery>,
}

/// Queries separated into levels: level 0 reads from avatars, level N reads
/// from level N-1 only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompiledMultiLevelQuery {
    pub levels: Vec<CompiledLevel>,
}

impl CompiledMultiLevelQuery {
    pub fn new(levels: Vec<CompiledLevel>) -> Self {
        Self { levels }
    }

    /// Separate a flat multi-query into levels by FROM depth.
    ///
    /// Fails when a query reads from sub-queries of different depths, since
    /// that cannot be expressed without pass-through queries.
    pub fn from_multi_query(multi_query: &CompiledMultiQuery) -> Result<Self> {
        let by_id: HashMap<&str, &CompiledQuery> =
            multi_query.queries.iter().map(|q| (q.id.as_str(), q)).collect();
        let mut depth: HashMap<String, usize> = HashMap::new();
        fn depth_of(
            id: &str,
            by_id: &HashMap<&str, &CompiledQuery>,
            depth: &mut HashMap<String, usize>,
            guard: usize,
        ) -> Result<usize> {
            if let Some(d) = depth.get(id) {
                return Ok(*d);
            }
            if guard > by_id.len() {
                return Err(LodqError::Planning(format!("cyclic FROM reference at {id}")));
            }
            let query = by_id
                .get(id)
                .ok_or_else(|| LodqError::Planning(format!("unknown sub-query id: {id}")))?;
            let mut child_depths = BTreeSet::new();
            for from in &query.joined_from.froms {
                if by_id.contains_key(from.id.as_str()) {
                    child_depths.insert(depth_of(&from.id, by_id, depth, guard + 1)?);
                }
            }
            let d = match child_depths.len() {
                0 => 0,
                1 => child_depths.iter().next().copied().unwrap_or_default() + 1,
                _ => {
                    return Err(LodqError::Planning(format!(
                        "query {id} reads from sub-queries of different levels"
                    )))
                }
            };
            depth.insert(id.to_string(), d);
            Ok(d)
        }

        let mut levels: Vec<CompiledLevel> = Vec::new();
        for query in &multi_query.queries {
            let d = depth_of(&query.id, &by_id, &mut depth, 0)?;
            while levels.len() <= d {
                levels.push(CompiledLevel {
                    level_type: query.level_type,
                    queries: Vec::new(),
                });
            }
            levels[d].queries.push(query.clone());
        }
        Ok(Self { levels })
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    pub fn get(&self, index: MultiQueryIndex) -> Option<&CompiledQuery> {
        self.levels.get(index.level_idx)?.queries.get(index.query_idx)
    }

    pub fn query(&self, index: MultiQueryIndex) -> Result<&CompiledQuery> {
        self.get(index)
            .ok_or_else(|| LodqError::Planning(format!("no query at {index:?}")))
    }

    pub fn query_index_by_id(&self, id: &str) -> Option<MultiQueryIndex> {
        self.levels.iter().enumerate().find_map(|(level_idx, level)| {
            level
                .queries
                .iter()
                .position(|q| q.id == id)
                .map(|query_idx| MultiQueryIndex {
                    level_idx,
                    query_idx,
                })
        })
    }

    pub fn iter_queries(&self) -> impl Iterator<Item = &CompiledQuery> + '_ {
        self.levels.iter().flat_map(|l| l.queries.iter())
    }

    /// Queries of the last level.
    pub fn top_queries(&self) -> &[CompiledQuery] {
        self.levels.last().map(|l| l.queries.as_slice()).unwrap_or(&[])
    }

    pub fn to_multi_query(&self) -> CompiledMultiQuery {
        CompiledMultiQuery::new(self.iter_queries().cloned().collect())
    }
}

// -----------------------------
// Execution plans
// -----------------------------

/// Ordered tiers a query or formula passes through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelPlan {
    pub level_types: Vec<ExecutionLevel>,
}

impl LevelPlan {
    pub fn new(level_types: Vec<ExecutionLevel>) -> Self {
        Self { level_types }
    }

    pub fn level_count(&self) -> usize {
        self.level_types.len()
    }
}

/// How an expression is cut at one tier boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "slicer", content = "tag", rename_all = "snake_case")]
pub enum SlicerConfig {
    /// Whatever remains goes to the last tier.
    Top,
    /// Cut below window function calls.
    Window,
    /// Only plain field references go below.
    Field,
    /// Cut below nodes carrying this level tag.
    LevelTagged(LevelTag),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlicingPlan {
    pub slicer_configs: Vec<SlicerConfig>,
}

impl SlicingPlan {
    pub fn new(slicer_configs: Vec<SlicerConfig>) -> Self {
        Self { slicer_configs }
    }
}

/// A formula with the tiers it is evaluated across.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedFormula {
    pub formula: CompiledFormulaInfo,
    pub level_plan: LevelPlan,
    pub slicing_plan: SlicingPlan,
}

/// Planned counterpart of a [`CompiledQuery`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub id: String,
    pub level_plan: LevelPlan,
    pub select: Vec<PlannedFormula>,
    pub group_by: Vec<PlannedFormula>,
    pub filters: Vec<PlannedFormula>,
    pub order_by: Vec<PlannedFormula>,
    pub join_on: Vec<PlannedFormula>,
    pub joined_from: JoinedFromObject,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl ExecutionPlan {
    pub fn all_formulas(&self) -> impl Iterator<Item = &PlannedFormula> + '_ {
        self.select
            .iter()
            .chain(self.group_by.iter())
            .chain(self.filters.iter())
            .chain(self.order_by.iter())
            .chain(self.join_on.iter())
    }
}

// -----------------------------
// Id generation
// -----------------------------

/// Sequential `<prefix>_<n>` ids.
#[derive(Debug, Clone)]
pub struct PrefixedIdGen {
    prefix: String,
    counter: usize,
}

impl PrefixedIdGen {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: 0,
        }
    }

    pub fn get_id(&mut self) -> String {
        let id = format!("{}_{}", self.prefix, self.counter);
        self.counter += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodq_formula::shortcuts as n;

    fn query(id: &str, from_ids: &[&str]) -> CompiledQuery {
        let mut q = CompiledQuery::new(id, ExecutionLevel::SourceDb);
        q.select.push(CompiledFormulaInfo::new(
            n::formula(n::field("x")),
            Some(format!("{id}_x")),
        ));
        q.joined_from = JoinedFromObject {
            root_from_id: from_ids.first().map(|s| s.to_string()),
            froms: from_ids
                .iter()
                .map(|f| FromObject::subquery(f, vec![]))
                .collect(),
        };
        q
    }

    #[test]
    fn top_queries_are_unreferenced() {
        let mq = CompiledMultiQuery::new(vec![query("a", &[]), query("b", &["a"]), query("c", &["b"])]);
        let top: Vec<_> = mq.top_queries().iter().map(|q| q.id.clone()).collect();
        assert_eq!(top, vec!["c".to_string()]);
        assert_eq!(mq.single_top_query().expect("top").id, "c");
    }

    #[test]
    fn levels_follow_from_depth() {
        let mq = CompiledMultiQuery::new(vec![
            query("a", &["t1"]),
            query("b", &["t2"]),
            query("c", &["a", "b"]),
        ]);
        let mlq = CompiledMultiLevelQuery::from_multi_query(&mq).expect("levels");
        assert_eq!(mlq.level_count(), 2);
        assert_eq!(mlq.levels[0].queries.len(), 2);
        assert_eq!(
            mlq.query_index_by_id("c"),
            Some(MultiQueryIndex {
                level_idx: 1,
                query_idx: 0
            })
        );
        assert_eq!(mlq.to_multi_query().query_count(), 3);
    }

    #[test]
    fn mixed_depth_froms_are_rejected() {
        let mq = CompiledMultiQuery::new(vec![
            query("a", &[]),
            query("b", &["a"]),
            query("c", &["a", "b"]),
        ]);
        let err = CompiledMultiLevelQuery::from_multi_query(&mq).expect_err("mixed");
        assert!(matches!(err, LodqError::Planning(_)));
    }

    #[test]
    fn id_gen_is_sequential() {
        let mut gen = PrefixedIdGen::new("q");
        assert_eq!(gen.get_id(), "q_0");
        assert_eq!(gen.get_id(), "q_1");
    }
}
