//! Post-forking cleanup of multi-level queries.

use std::collections::HashSet;
use tracing::debug;

use crate::primitives::{CompiledLevel, CompiledMultiLevelQuery, CompiledQuery};
use crate::query_tools::level_used_fields;

/// What a level reads from the level below it.
#[derive(Debug, Clone, Default)]
pub struct LevelUsage {
    pub aliases: HashSet<String>,
    pub from_ids: HashSet<String>,
}

impl LevelUsage {
    pub fn of_level(level: &CompiledLevel) -> Self {
        Self {
            aliases: level_used_fields(level),
            from_ids: level
                .queries
                .iter()
                .flat_map(|q| q.joined_from.iter_ids().map(str::to_string))
                .collect(),
        }
    }
}

/// Removes sub-queries nothing reads from, and select items of sub-queries
/// that the upper level does not reference.
#[derive(Debug, Default, Clone, Copy)]
pub struct MultiQuerySanitizer;

impl MultiQuerySanitizer {
    /// `upper` is `None` for the top level, which is left untouched.
    pub fn sanitize_level(&self, level: CompiledLevel, upper: Option<&LevelUsage>) -> CompiledLevel {
        let Some(upper) = upper else {
            return level;
        };
        let queries = level
            .queries
            .into_iter()
            .filter(|q| {
                let used = upper.from_ids.contains(&q.id);
                if !used {
                    debug!(query_id = %q.id, "dropping unreferenced sub-query");
                }
                used
            })
            .map(|q| sanitize_select(q, &upper.aliases))
            .collect();
        CompiledLevel {
            level_type: level.level_type,
            queries,
        }
    }
}

/// Keep select items that are used above or define the row granularity.
fn sanitize_select(mut query: CompiledQuery, used_aliases: &HashSet<String>) -> CompiledQuery {
    let group_by: HashSet<String> = query.group_by.iter().filter_map(|f| f.alias.clone()).collect();
    query
        .select
        .retain(|f| used_aliases.contains(f.alias_str()) || group_by.contains(f.alias_str()));
    query
}

/// Deduplicates GROUP BY items by expression and makes sure every
/// sub-query selects the expressions it groups by.
#[derive(Debug, Default, Clone, Copy)]
pub struct GroupByNormalizer;

impl GroupByNormalizer {
    pub fn normalize_multi_query(&self, mut multi_query: CompiledMultiLevelQuery) -> CompiledMultiLevelQuery {
        let top_level = multi_query.level_count().saturating_sub(1);
        for (level_idx, level) in multi_query.levels.iter_mut().enumerate() {
            for query in level.queries.iter_mut() {
                self.normalize_query(query, level_idx < top_level);
            }
        }
        multi_query
    }

    pub fn normalize_query(&self, query: &mut CompiledQuery, is_subquery: bool) {
        let mut seen = HashSet::new();
        query
            .group_by
            .retain(|f| f.formula.extract().map_or(true, |extract| seen.insert(extract.clone())));
        if !is_subquery {
            return;
        }
        let selected: HashSet<String> = query.select.iter().filter_map(|f| f.alias.clone()).collect();
        let missing: Vec<_> = query
            .group_by
            .iter()
            .filter(|f| f.alias.as_ref().is_some_and(|alias| !selected.contains(alias)))
            .cloned()
            .collect();
        query.select.extend(missing);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::{CompiledFormulaInfo, ExecutionLevel, FromColumn, FromObject, JoinedFromObject};
    use lodq_formula::shortcuts as n;
    use lodq_formula::Node;

    fn item(expr: Node, alias: &str) -> CompiledFormulaInfo {
        CompiledFormulaInfo::new(n::formula(expr), Some(alias.to_string()))
    }

    fn level(queries: Vec<CompiledQuery>) -> CompiledLevel {
        CompiledLevel {
            level_type: ExecutionLevel::SourceDb,
            queries,
        }
    }

    fn bottom(id: &str) -> CompiledQuery {
        let mut q = CompiledQuery::new(id, ExecutionLevel::SourceDb);
        q.select.push(item(n::field("city"), "c"));
        q.select.push(item(n::func("sum", vec![n::field("sales")]), "s"));
        q.select.push(item(n::func("sum", vec![n::field("profit")]), "p"));
        q.group_by.push(item(n::field("city"), "c"));
        q
    }

    fn top_reading(from_id: &str, alias: &str) -> CompiledQuery {
        let mut q = CompiledQuery::new("qq", ExecutionLevel::SourceDb);
        q.select.push(item(n::field(alias), "res"));
        q.joined_from = JoinedFromObject {
            root_from_id: Some(from_id.to_string()),
            froms: vec![FromObject::subquery(from_id, vec![FromColumn::aliased(alias)])],
        };
        q
    }

    #[test]
    fn unused_columns_and_queries_are_removed() {
        let upper = LevelUsage::of_level(&level(vec![top_reading("q0", "s")]));
        let out = MultiQuerySanitizer.sanitize_level(level(vec![bottom("q0"), bottom("orphan")]), Some(&upper));
        assert_eq!(out.queries.len(), 1);
        let aliases: Vec<&str> = out.queries[0].select.iter().map(|f| f.alias_str()).collect();
        assert_eq!(aliases, vec!["c", "s"]);
    }

    #[test]
    fn top_level_is_untouched() {
        let out = MultiQuerySanitizer.sanitize_level(level(vec![bottom("q0")]), None);
        assert_eq!(out.queries[0].select.len(), 3);
    }

    #[test]
    fn group_by_is_deduplicated_and_selected() {
        let mut q = bottom("q0");
        q.group_by.push(item(n::field("city"), "c2"));
        q.group_by.push(item(n::field("region"), "r"));
        GroupByNormalizer.normalize_query(&mut q, true);
        let gb: Vec<&str> = q.group_by.iter().map(|f| f.alias_str()).collect();
        assert_eq!(gb, vec!["c", "r"]);
        assert!(q.select.iter().any(|f| f.alias_str() == "r"));

        let mut top = bottom("qq");
        top.group_by.push(item(n::field("region"), "r"));
        GroupByNormalizer.normalize_query(&mut top, false);
        assert!(!top.select.iter().any(|f| f.alias_str() == "r"));
    }
}
