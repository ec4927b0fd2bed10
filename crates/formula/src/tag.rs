use lodq_common::{LodqError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

use crate::inspect::window_wrapping_level;
use crate::mutation::FormulaMutation;
use crate::node::{Node, NodeType};

/// Evaluation level marker attached to window calls and BFB-carrying forks.
///
/// Tags form a partial order: `a > b` iff `a.bfb_names` is a strict superset
/// of `b.bfb_names`, or the name sets are equal and
/// `(func_nesting, qfork_nesting)` of `a` is lexicographically greater.
/// Tags with incomparable name sets have no order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LevelTag {
    pub bfb_names: BTreeSet<String>,
    pub func_nesting: i32,
    pub qfork_nesting: i32,
}

impl LevelTag {
    pub fn new(bfb_names: BTreeSet<String>, func_nesting: i32, qfork_nesting: i32) -> Self {
        Self {
            bfb_names,
            func_nesting,
            qfork_nesting,
        }
    }
}

impl PartialOrd for LevelTag {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.bfb_names == other.bfb_names {
            return Some(
                (self.func_nesting, self.qfork_nesting)
                    .cmp(&(other.func_nesting, other.qfork_nesting)),
            );
        }
        if self.bfb_names.is_superset(&other.bfb_names) {
            Some(Ordering::Greater)
        } else if other.bfb_names.is_superset(&self.bfb_names) {
            Some(Ordering::Less)
        } else {
            None
        }
    }
}

impl fmt::Display for LevelTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self.bfb_names.iter().cloned().collect::<Vec<_>>();
        write!(
            f,
            "[{}]/f{}/q{}",
            names.join(","),
            self.func_nesting,
            self.qfork_nesting
        )
    }
}

/// Deduplicate and order tags from outermost (greatest) to innermost.
///
/// Fails with [`LodqError::UnresolvableSlicingTagOrder`] when two
/// neighbouring tags are not strictly ordered.
pub fn linearize_tags<'a>(tags: impl IntoIterator<Item = &'a LevelTag>) -> Result<Vec<LevelTag>> {
    // Sorted by (name count, func_nesting, qfork_nesting, names).
    let unique: BTreeSet<_> = tags
        .into_iter()
        .map(|t| {
            (
                t.bfb_names.len(),
                t.func_nesting,
                t.qfork_nesting,
                t.bfb_names.clone(),
            )
        })
        .collect();
    let ordered: Vec<LevelTag> = unique
        .into_iter()
        .rev()
        .map(|(_, func_nesting, qfork_nesting, bfb_names)| {
            LevelTag::new(bfb_names, func_nesting, qfork_nesting)
        })
        .collect();
    for pair in ordered.windows(2) {
        if pair[0].partial_cmp(&pair[1]) != Some(Ordering::Greater) {
            return Err(LodqError::UnresolvableSlicingTagOrder(format!(
                "tags {} and {} are not comparable",
                pair[0], pair[1]
            )));
        }
    }
    Ok(ordered)
}

/// Attaches [`LevelTag`]s to window calls and to forks with a BFB clause.
///
/// - window call: names = own BFB names plus those of enclosing window
///   calls; `func_nesting` = minus the number of window calls with the same
///   BFB nested below it (the innermost one gets 0)
/// - fork: names = own BFB names plus those of enclosing window calls;
///   `qfork_nesting` = 1
#[derive(Debug, Default)]
pub struct LevelTaggerMutation;

impl FormulaMutation for LevelTaggerMutation {
    fn name(&self) -> &str {
        "level_tagger"
    }

    fn match_node(&self, node: &Node, _parent_stack: &[Node]) -> bool {
        match node.node_type() {
            NodeType::WindowFuncCall => true,
            NodeType::QueryFork => node.bfb_names().is_some_and(|names| !names.is_empty()),
            _ => false,
        }
    }

    fn make_replacement(&self, old: &Node, parent_stack: &[Node]) -> Node {
        let own_names = old.bfb_names().cloned().unwrap_or_default();
        let mut names = own_names.clone();
        for ancestor in parent_stack {
            if ancestor.is(NodeType::WindowFuncCall) {
                if let Some(enclosing) = ancestor.bfb_names() {
                    names.extend(enclosing.iter().cloned());
                }
            }
        }
        let tag = if old.is(NodeType::WindowFuncCall) {
            let nested = window_wrapping_level(old, &own_names) - 1;
            LevelTag::new(names, -nested, 0)
        } else {
            LevelTag::new(names, 0, 1)
        };
        old.with_tag(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspect::collect_tags;
    use crate::mutation::apply_mutations;
    use crate::shortcuts as n;

    #[test]
    fn tagger_marks_nesting_and_enclosing_names() {
        let inner = n::window("rsum", vec![n::func("sum", vec![n::field("x")])]);
        let outer = n::window_full("rank", vec![inner], vec![], n::total(), &[]);
        let with_bfb = n::window_full(
            "rsum",
            vec![n::func("sum", vec![n::field("y")])],
            vec![],
            n::total(),
            &["d"],
        );
        let tree = n::formula(n::binary("+", outer, with_bfb));
        let out = apply_mutations(&tree, &[Box::new(LevelTaggerMutation) as Box<dyn FormulaMutation>]);
        let tags = collect_tags(&out);
        assert!(tags.contains(&tag(&[], -1, 0)));
        assert!(tags.contains(&tag(&[], 0, 0)));
        assert!(tags.contains(&tag(&["d"], 0, 0)));
        assert_eq!(tags.len(), 3);
        assert_eq!(out, tree);
    }

    fn tag(names: &[&str], f: i32, q: i32) -> LevelTag {
        LevelTag::new(names.iter().map(|s| s.to_string()).collect(), f, q)
    }

    #[test]
    fn superset_is_greater() {
        assert!(tag(&["a", "b"], -3, 0) > tag(&["a"], 0, 0));
        assert!(tag(&["a"], 0, 0) < tag(&["a", "b"], -3, 0));
        assert!(tag(&["a"], 0, 0) > tag(&["a"], -1, 0));
        assert!(tag(&["a"], 0, 1) > tag(&["a"], 0, 0));
        assert_eq!(tag(&["a"], 0, 0).partial_cmp(&tag(&["b"], 0, 0)), None);
    }

    #[test]
    fn linearize_orders_outermost_first() {
        let tags = vec![tag(&[], -1, 0), tag(&["a"], 0, 0), tag(&[], 0, 0), tag(&[], 0, 0)];
        let ordered = linearize_tags(&tags).expect("linear");
        assert_eq!(ordered, vec![tag(&["a"], 0, 0), tag(&[], 0, 0), tag(&[], -1, 0)]);
        for pair in ordered.windows(2) {
            assert!(pair[0] > pair[1]);
        }
    }

    #[test]
    fn linearize_rejects_incomparable_tags() {
        let tags = vec![tag(&["a"], 0, 0), tag(&["b"], 0, 0)];
        let err = linearize_tags(&tags).expect_err("incomparable");
        assert!(matches!(err, LodqError::UnresolvableSlicingTagOrder(_)));
    }
}
