//! Split masks derived from `QueryFork` nodes.

use lodq_common::{LodqError, Result, SplitterConfig};
use lodq_formula::fork::strip_call_clauses;
use lodq_formula::inspect::{
    enumerate_autonomous_children, is_aggregate_expression, is_aggregate_function, is_constant_expression,
};
use lodq_formula::mutation::ReplacementMutation;
use lodq_formula::shortcuts as n;
use lodq_formula::{apply_mutations, FormulaMutation, LodKind, Node, NodeExtract, NodeHierarchyIndex, NodeType};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

use crate::primitives::{CompiledFormulaInfo, CompiledQuery, JoinType, PrefixedIdGen, QueryPart};
use crate::splitter::{
    drop_group_by_for_plain_selects, replace_extracts_with_fields, AddFormulaInfo, AliasedFormulaSplitMask,
    FormulaSplitMask, MultiQuerySplitter, QuerySplitMask, SplitMaskDiscovery, SubqueryType, SPLIT_QUERY_PARTS,
};

/// Forks with equal signatures are evaluated by the same sub-query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ForkSignature {
    lod_idx: usize,
    joining: Option<NodeExtract>,
    bfb_names: BTreeSet<String>,
    dims: BTreeSet<NodeExtract>,
    child_lods: BTreeSet<NodeExtract>,
    join_type: JoinType,
}

#[derive(Debug)]
struct QueryForkInfo {
    subquery_type: SubqueryType,
    joining: Node,
    bfb_field_ids: BTreeSet<String>,
    add_formulas: Vec<AddFormulaInfo>,
    /// `(original, replacement)` pairs applied to BFB filters.
    bfb_filter_mutations: Vec<(Node, Node)>,
    join_type: JoinType,
    aliases_by_extract: HashMap<NodeExtract, String>,
    formula_split_masks: Vec<AliasedFormulaSplitMask>,
}

struct FoundFork {
    mask: FormulaSplitMask,
    fork: Node,
    bfb: BTreeSet<String>,
}

/// Turns every top-level `QueryFork` of a query into a split mask.
#[derive(Debug, Clone, Default)]
pub struct QueryForkMaskDiscovery {
    disable_lod_grouping: bool,
}

impl QueryForkMaskDiscovery {
    /// With `disable_lod_grouping`, forks with identical LODs still get
    /// separate sub-queries.
    pub fn new(disable_lod_grouping: bool) -> Self {
        Self { disable_lod_grouping }
    }
}

/// Splitter resolving `QueryFork` nodes into joined sub-queries.
pub fn query_fork_splitter(config: SplitterConfig) -> MultiQuerySplitter<QueryForkMaskDiscovery> {
    MultiQuerySplitter::new(QueryForkMaskDiscovery::new(config.disable_lod_grouping), config)
}

/// Query forks below `node`, not descending into forks.
fn find_query_forks(
    node: &Node,
    prefix: &NodeHierarchyIndex,
    part: QueryPart,
    idx: usize,
    out: &mut Vec<(FormulaSplitMask, Node)>,
) {
    if node.is(NodeType::QueryFork) {
        // result_expr is child 1
        let mask = FormulaSplitMask::new(part, idx, prefix.clone(), prefix.child(1));
        out.push((mask, node.clone()));
        return;
    }
    for (child_idx, child) in enumerate_autonomous_children(node, prefix) {
        find_query_forks(&child, &child_idx, part, idx, out);
    }
}

/// LOD extracts of the forks nested in `node`.
fn child_lod_extracts(node: &Node) -> BTreeSet<NodeExtract> {
    let mut forks = Vec::new();
    find_query_forks(node, &NodeHierarchyIndex::root(), QueryPart::Select, 0, &mut forks);
    forks
        .iter()
        .filter_map(|(_, fork)| fork.lod().and_then(|lod| lod.extract().cloned()))
        .collect()
}

fn is_window_fork(fork: &Node) -> bool {
    fork.fork_parts()
        .is_some_and(|(_, result_expr, ..)| result_expr.is(NodeType::WindowFuncCall))
}

/// With window forks present whose smallest BFB set is contained in every
/// BFB set, only the window forks with that smallest set are split now.
fn prioritize_window_forks(found: Vec<FoundFork>) -> (SubqueryType, Vec<FoundFork>) {
    let smallest = found
        .iter()
        .filter(|f| is_window_fork(&f.fork))
        .map(|f| &f.bfb)
        .min_by_key(|bfb| bfb.len())
        .cloned();
    let Some(smallest) = smallest else {
        return (SubqueryType::Default, found);
    };
    if !found.iter().all(|f| smallest.is_subset(&f.bfb)) {
        return (SubqueryType::Default, found);
    }
    let kept = found
        .into_iter()
        .filter(|f| is_window_fork(&f.fork) && f.bfb == smallest)
        .collect();
    (SubqueryType::WindowFunc, kept)
}

fn contains_node(tree: &Node, target: &Node) -> bool {
    tree.enumerate(None).any(|(_, node)| node == target)
}

impl QueryForkMaskDiscovery {
    fn collect_query_forks(&self, query: &CompiledQuery, expr_ids: &mut PrefixedIdGen) -> Result<Vec<QueryForkInfo>> {
        let mut raw = Vec::new();
        for part in SPLIT_QUERY_PARTS {
            for (idx, formula) in query.formula_list(part).iter().enumerate() {
                find_query_forks(&formula.formula, &NodeHierarchyIndex::root(), part, idx, &mut raw);
            }
        }
        let filter_ids: HashSet<&str> = query
            .filters
            .iter()
            .filter_map(|f| f.original_field_id.as_ref().map(|id| id.as_str()))
            .collect();
        let found: Vec<FoundFork> = raw
            .into_iter()
            .map(|(mask, fork)| {
                let bfb = fork
                    .bfb_names()
                    .map(|names| {
                        names
                            .iter()
                            .filter(|name| filter_ids.contains(name.as_str()))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                FoundFork { mask, fork, bfb }
            })
            .collect();
        let (subquery_type, found) = prioritize_window_forks(found);

        let from_ids: BTreeSet<String> = query.joined_from.iter_ids().map(str::to_string).collect();
        let mut lod_counter = 0;
        let mut by_signature: HashMap<ForkSignature, usize> = HashMap::new();
        let mut infos: Vec<QueryForkInfo> = Vec::new();
        for FoundFork { mask, fork, bfb } in found {
            let Some((joining, result_expr, lod, _, mutations)) = fork.fork_parts() else {
                continue;
            };
            let join_type = fork.join_type().map(JoinType::from).unwrap_or(JoinType::Left);
            let mut dims: Vec<Node> = match lod.lod_kind() {
                Some(LodKind::Fixed) => lod.children().to_vec(),
                Some(LodKind::Inherited) => query.group_by.iter().map(|gb| gb.expr().clone()).collect(),
                other => {
                    return Err(LodqError::Unsupported(format!("query fork with {other:?} LOD")));
                }
            };
            let mut joining = joining.clone();
            if dims.is_empty() {
                let dummy = n::lit_int(1);
                dims.push(dummy.clone());
                joining = n::joining(vec![n::self_eq(dummy)]);
            }

            let lod_idx = if self.disable_lod_grouping {
                lod_counter += 1;
                lod_counter
            } else {
                0
            };
            let signature = ForkSignature {
                lod_idx,
                joining: joining.extract().cloned(),
                bfb_names: bfb.clone(),
                dims: dims.iter().filter_map(|d| d.extract().cloned()).collect(),
                child_lods: child_lod_extracts(result_expr),
                join_type,
            };

            let pos = match by_signature.get(&signature) {
                Some(pos) => *pos,
                None => {
                    let mut add_formulas: Vec<AddFormulaInfo> = dims
                        .iter()
                        .map(|dim| AddFormulaInfo {
                            alias: expr_ids.get_id(),
                            expr: dim.clone(),
                            from_ids: from_ids.clone(),
                            is_group_by: !is_constant_expression(dim),
                        })
                        .collect();
                    // Aggregated join operands are selected too, without grouping.
                    for condition in joining.children() {
                        for expr in condition.children() {
                            if is_aggregate_expression(expr) {
                                add_formulas.push(AddFormulaInfo {
                                    alias: expr_ids.get_id(),
                                    expr: expr.clone(),
                                    from_ids: from_ids.clone(),
                                    is_group_by: false,
                                });
                            }
                        }
                    }
                    let bfb_filter_mutations = mutations
                        .children()
                        .iter()
                        .map(|spec| (spec.children()[0].clone(), spec.children()[1].clone()))
                        .collect();
                    infos.push(QueryForkInfo {
                        subquery_type,
                        joining,
                        bfb_field_ids: bfb,
                        add_formulas,
                        bfb_filter_mutations,
                        join_type,
                        aliases_by_extract: HashMap::new(),
                        formula_split_masks: Vec::new(),
                    });
                    by_signature.insert(signature, infos.len() - 1);
                    infos.len() - 1
                }
            };

            let info = &mut infos[pos];
            let alias = match result_expr.extract() {
                Some(extract) => info
                    .aliases_by_extract
                    .entry(extract.clone())
                    .or_insert_with(|| expr_ids.get_id())
                    .clone(),
                None => expr_ids.get_id(),
            };
            info.formula_split_masks.push(mask.with_alias(alias));
        }
        Ok(infos)
    }
}

impl SplitMaskDiscovery for QueryForkMaskDiscovery {
    fn name(&self) -> &str {
        "query_fork"
    }

    fn get_split_masks(
        &self,
        query: &CompiledQuery,
        expr_ids: &mut PrefixedIdGen,
        query_ids: &mut PrefixedIdGen,
    ) -> Result<Vec<QuerySplitMask>> {
        let infos = self.collect_query_forks(query, expr_ids)?;
        // Filters split at this level belong to the query above the forks.
        let split_filter_indices: HashSet<usize> = infos
            .iter()
            .flat_map(|info| info.formula_split_masks.iter())
            .filter(|fm| fm.mask.query_part == QueryPart::Filters)
            .map(|fm| fm.mask.formula_list_idx)
            .collect();

        let mut masks = Vec::with_capacity(infos.len());
        for info in infos {
            let aliases: HashMap<NodeExtract, String> = info
                .add_formulas
                .iter()
                .filter_map(|f| f.expr.extract().map(|e| (e.clone(), f.alias.clone())))
                .collect();
            let joining = replace_extracts_with_fields(&info.joining, &aliases);

            let mutations: Vec<Box<dyn FormulaMutation>> = info
                .bfb_filter_mutations
                .iter()
                .filter_map(|(original, replacement)| ReplacementMutation::new(original, replacement.clone()))
                .map(|m| Box::new(m) as Box<dyn FormulaMutation>)
                .collect();
            let mut add_filters: Vec<CompiledFormulaInfo> = Vec::new();
            let mut filter_indices = BTreeSet::new();
            for (idx, filter) in query.filters.iter().enumerate() {
                let in_bfb = filter
                    .original_field_id
                    .as_ref()
                    .is_some_and(|id| info.bfb_field_ids.contains(id.as_str()));
                if in_bfb {
                    let mutated = info
                        .bfb_filter_mutations
                        .iter()
                        .any(|(original, _)| contains_node(&filter.formula, original));
                    if mutated {
                        add_filters.push(filter.with_formula(apply_mutations(&filter.formula, &mutations)));
                    }
                    continue;
                }
                if split_filter_indices.contains(&idx) {
                    continue;
                }
                filter_indices.insert(idx);
            }

            let mask = QuerySplitMask {
                subquery_type: info.subquery_type,
                subquery_id: query_ids.get_id(),
                formula_split_masks: info.formula_split_masks,
                add_formulas: info.add_formulas,
                filter_indices,
                add_filters,
                join_type: Some(info.join_type),
                joining_node: Some(joining),
                is_base: false,
            };
            debug!(
                query_id = %query.id,
                subquery_id = %mask.subquery_id,
                split_nodes = mask.formula_split_masks.len(),
                dimensions = mask.group_by_count(),
                "query fork mask"
            );
            masks.push(mask);
        }
        Ok(masks)
    }

    fn mutate_split_node(&self, node: &Node) -> Node {
        if is_aggregate_function(node) {
            strip_call_clauses(node)
        } else {
            node.clone()
        }
    }

    fn mutate_cropped_query(&self, query: CompiledQuery) -> Result<CompiledQuery> {
        Ok(drop_group_by_for_plain_selects(query))
    }

    /// A single window-function mask is merged into the base so that no
    /// join is needed.
    fn optimize_split_masks(&self, split_masks: Vec<QuerySplitMask>) -> Vec<QuerySplitMask> {
        let types: HashSet<SubqueryType> = split_masks
            .iter()
            .map(|m| m.subquery_type)
            .filter(|t| *t != SubqueryType::GeneratedBase)
            .collect();
        if types.len() != 1 || !types.contains(&SubqueryType::WindowFunc) || split_masks.len() != 2 {
            return split_masks;
        }
        let mut iter = split_masks.into_iter();
        let (Some(mut base), Some(other)) = (iter.next(), iter.next()) else {
            return Vec::new();
        };
        let mut seen: HashSet<NodeExtract> = HashSet::new();
        let mut add_formulas = Vec::new();
        for add_formula in base.add_formulas.drain(..).chain(other.add_formulas) {
            match add_formula.expr.extract() {
                Some(extract) if !seen.insert(extract.clone()) => continue,
                _ => add_formulas.push(add_formula),
            }
        }
        base.add_formulas = add_formulas;
        base.formula_split_masks.extend(other.formula_split_masks);
        // BFB filters must not be applied below the window.
        base.filter_indices = other.filter_indices;
        base.add_filters.extend(other.add_filters);
        vec![base]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::{ExecutionLevel, FromObject, JoinedFromObject};
    use lodq_common::FieldId;
    use lodq_formula::inspect::used_fields;
    use lodq_formula::ForkJoinType;

    fn item(expr: Node, alias: &str) -> CompiledFormulaInfo {
        CompiledFormulaInfo::new(n::formula(expr), Some(alias.to_string())).with_avatar_ids(["t"])
    }

    fn sum_sales() -> Node {
        n::func("sum", vec![n::field("sales")])
    }

    fn fixed_fork(dims: &[&str], conditions: &[&str]) -> Node {
        n::query_fork(
            ForkJoinType::Left,
            conditions.iter().map(|c| n::self_eq(n::field(c))).collect(),
            sum_sales(),
            n::fixed(dims.iter().map(|d| n::field(d)).collect()),
            n::bfb(&[]),
            vec![],
        )
    }

    fn query(group_by: &[&str], forks: Vec<Node>) -> CompiledQuery {
        let mut q = CompiledQuery::new("qq", ExecutionLevel::SourceDb);
        for (i, dim) in group_by.iter().enumerate() {
            q.select.push(item(n::field(dim), &format!("res_{i}")));
            q.group_by.push(item(n::field(dim), &format!("res_{i}")));
        }
        for (i, fork) in forks.into_iter().enumerate() {
            q.select.push(item(fork, &format!("res_f{i}")));
        }
        q.joined_from = JoinedFromObject {
            root_from_id: Some("t".into()),
            froms: vec![FromObject::avatar("t", vec![])],
        };
        q
    }

    #[test]
    fn forks_with_same_signature_share_a_mask() {
        let q = query(
            &["city"],
            vec![
                fixed_fork(&["city", "category"], &["city"]),
                fixed_fork(&["category", "city"], &["city"]),
            ],
        );
        let masks = QueryForkMaskDiscovery::default()
            .get_split_masks(&q, &mut PrefixedIdGen::new("e"), &mut PrefixedIdGen::new("q"))
            .expect("masks");
        assert_eq!(masks.len(), 1);
        let mask = &masks[0];
        assert_eq!(mask.group_by_count(), 2);
        assert_eq!(mask.formula_split_masks.len(), 2);
        // identical result expressions get one alias
        assert_eq!(mask.formula_split_masks[0].alias, mask.formula_split_masks[1].alias);
        assert_eq!(mask.formula_split_masks[0].mask.inner_node_idx, NodeHierarchyIndex::new(vec![0, 1]));
        let joining = mask.joining_node.as_ref().expect("joining");
        assert_eq!(joining.children()[0].children()[0], n::field("e_0"));

        let separate = QueryForkMaskDiscovery::new(true)
            .get_split_masks(&q, &mut PrefixedIdGen::new("e"), &mut PrefixedIdGen::new("q"))
            .expect("masks");
        assert_eq!(separate.len(), 2);
    }

    #[test]
    fn zero_dimension_fork_joins_on_dummy_constant() {
        let q = query(&["city"], vec![fixed_fork(&[], &[])]);
        let masks = QueryForkMaskDiscovery::default()
            .get_split_masks(&q, &mut PrefixedIdGen::new("e"), &mut PrefixedIdGen::new("q"))
            .expect("masks");
        let mask = &masks[0];
        assert_eq!(mask.add_formulas.len(), 1);
        assert!(!mask.add_formulas[0].is_group_by);
        assert_eq!(mask.group_by_count(), 0);
        assert!(mask.has_direct_equality_join());
    }

    #[test]
    fn superset_lod_is_joined_to_generated_base() {
        let q = query(&["city"], vec![fixed_fork(&["city", "category"], &["city"])]);
        let mut splitter = query_fork_splitter(SplitterConfig::default());
        let out = splitter
            .split_multi_query(&crate::primitives::CompiledMultiQuery::new(vec![q]))
            .expect("split");
        assert_eq!(out.query_count(), 3);
        let top = out.single_top_query().expect("top");
        assert_eq!(top.join_on.len(), 1);
        assert!(top.group_by.is_empty());
        assert!(top.select.iter().all(|f| f.expr().is(NodeType::Field)));
        // the forked aggregate lost its LOD clause
        let fork_query = out
            .queries
            .iter()
            .find(|q| q.group_by.len() == 2)
            .expect("fork sub-query");
        assert!(fork_query.select.iter().any(|f| f.expr() == &sum_sales()));
    }

    #[test]
    fn incompatible_lods_become_error_nodes() {
        let q = query(
            &["region"],
            vec![fixed_fork(&["region", "city"], &["region"]), fixed_fork(&["region", "category"], &["region"])],
        );
        let mut splitter = query_fork_splitter(SplitterConfig::default());
        let patch = splitter.split_query(&q).expect("split").expect("patch");
        let top = patch.patch.queries.last().expect("cropped");
        assert!(top.join_on.is_empty());
        let errors: Vec<_> = top.select.iter().filter(|f| f.expr().is(NodeType::Error)).collect();
        assert_eq!(errors.len(), 2);
        assert_eq!(
            errors[0].expr().error_info().map(|(msg, _)| msg),
            Some("LOD dimensions are incompatible")
        );
    }

    #[test]
    fn window_fork_is_merged_into_base() {
        let window_fork = n::query_fork(
            ForkJoinType::Left,
            vec![n::self_eq(n::field("city"))],
            n::window("rank", vec![sum_sales()]),
            n::inherited_lod(),
            n::bfb(&["f_city"]),
            vec![],
        );
        let mut q = query(&["city"], vec![window_fork]);
        q.filters.push(
            CompiledFormulaInfo::new(n::formula(n::binary("==", n::field("city"), n::lit_str("x"))), None)
                .with_field_id(Some(FieldId::from("f_city")))
                .with_avatar_ids(["t"]),
        );
        let mut splitter = query_fork_splitter(SplitterConfig::default());
        let patch = splitter.split_query(&q).expect("split").expect("patch");
        assert_eq!(patch.patch.queries.len(), 2);
        let sub = &patch.patch.queries[0];
        assert!(sub.filters.is_empty());
        assert!(sub.select.iter().any(|f| f.expr().is(NodeType::WindowFuncCall)));
        let top = &patch.patch.queries[1];
        assert!(top.join_on.is_empty());
        assert_eq!(top.filters.len(), 1);
        let filter_fields = used_fields(&top.filters[0].formula);
        assert!(filter_fields.iter().all(|f| f.starts_with("e_")));
    }

    #[test]
    fn bfb_mutation_rewrites_filter_for_sub_query() {
        let shifted = n::func("dateadd", vec![n::field("day"), n::lit_str("year"), n::lit_int(1)]);
        let fork = n::query_fork(
            ForkJoinType::Left,
            vec![n::binary_join(n::field("day"), shifted.clone())],
            sum_sales(),
            n::inherited_lod(),
            n::bfb(&["f_day"]),
            vec![n::bfb_mutation(n::field("day"), shifted.clone())],
        );
        let mut q = query(&["day"], vec![fork]);
        q.filters.push(
            CompiledFormulaInfo::new(n::formula(n::binary(">", n::field("day"), n::lit_str("2020-01-01"))), None)
                .with_field_id(Some(FieldId::from("f_day"))),
        );
        let masks = QueryForkMaskDiscovery::default()
            .get_split_masks(&q, &mut PrefixedIdGen::new("e"), &mut PrefixedIdGen::new("q"))
            .expect("masks");
        let mask = &masks[0];
        assert!(mask.filter_indices.is_empty());
        assert_eq!(mask.add_filters.len(), 1);
        assert_eq!(
            mask.add_filters[0].expr(),
            &n::binary(">", shifted, n::lit_str("2020-01-01"))
        );
        assert!(!mask.has_direct_equality_join());
    }
}
