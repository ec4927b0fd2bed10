//! Persistent-tree operations: addressing, path copying, bulk replacement
//! and traversal.
//!
//! Guarantees:
//! - inputs are never modified; untouched subtrees are shared with the result
//! - operations that change nothing return a pointer-equal node

use std::collections::BTreeMap;

use crate::index::NodeHierarchyIndex;
use crate::node::{Node, NodeType};

impl Node {
    /// Node at `index`, or `None` when the path leaves the tree.
    pub fn get(&self, index: &NodeHierarchyIndex) -> Option<&Node> {
        let mut node = self;
        for pos in index.indices() {
            node = node.child(*pos)?;
        }
        Some(node)
    }

    /// Nodes along `index`, root first, target last.
    pub fn iter_index(&self, index: &NodeHierarchyIndex) -> Vec<&Node> {
        let mut out = vec![self];
        let mut node = self;
        for pos in index.indices() {
            match node.child(*pos) {
                Some(child) => {
                    out.push(child);
                    node = child;
                }
                None => break,
            }
        }
        out
    }

    /// Index of `target` inside this tree, matched by identity.
    pub fn resolve_index(&self, target: &Node) -> Option<NodeHierarchyIndex> {
        self.enumerate(None)
            .find(|(_, node)| node.ptr_eq(target))
            .map(|(index, _)| index)
    }

    /// Copy of the tree with the node at `index` replaced.
    ///
    /// Only nodes along the path are rebuilt. Panics when `index` does not
    /// address a node.
    pub fn replace_at_index(&self, index: &NodeHierarchyIndex, node: Node) -> Node {
        match index.lsplit() {
            None => node,
            Some((pos, rest)) => {
                let child = self
                    .child(pos)
                    .unwrap_or_else(|| panic!("index {index} is out of bounds"));
                self.with_child(pos, child.replace_at_index(&rest, node))
            }
        }
    }

    /// Apply many index replacements at once, copying each path node once.
    ///
    /// When one index is a prefix of another, the outer replacement wins.
    pub fn substitute_batch(&self, replacements: &BTreeMap<NodeHierarchyIndex, Node>) -> Node {
        if replacements.is_empty() {
            return self.clone();
        }
        let entries: Vec<_> = replacements.iter().collect();
        substitute_rec(self, 0, &entries)
    }

    /// Bottom-up rewrite.
    ///
    /// Children are rewritten first; then each (possibly rewritten) child is
    /// offered to `match_func` together with the stack of its ancestors, and
    /// replaced with `replace_func`'s result when matched. The root itself is
    /// never matched, which is why compiled expressions are wrapped in a
    /// `Formula` node. Returns `self` (pointer-equal) when nothing changed.
    pub fn replace_nodes<M, R>(&self, mut match_func: M, mut replace_func: R) -> Node
    where
        M: FnMut(&Node, &[Node]) -> bool,
        R: FnMut(&Node, &[Node]) -> Node,
    {
        let mut stack = Vec::new();
        replace_rec(self, &mut stack, &mut match_func, &mut replace_func)
    }

    /// Lazy pre-order traversal yielding `(index, node)`.
    ///
    /// `max_depth` limits how deep below the root the walk goes (`Some(0)`
    /// yields only the root).
    pub fn enumerate(&self, max_depth: Option<usize>) -> NodeEnumerator<'_> {
        NodeEnumerator {
            stack: vec![(NodeHierarchyIndex::root(), self)],
            max_depth,
        }
    }

    /// Same as [`Node::enumerate`] with indices prefixed by `prefix`.
    pub fn enumerate_from(
        &self,
        prefix: NodeHierarchyIndex,
        max_depth: Option<usize>,
    ) -> impl Iterator<Item = (NodeHierarchyIndex, &Node)> + '_ {
        self.enumerate(max_depth)
            .map(move |(index, node)| (prefix.concat(&index), node))
    }

    /// All descendants (root included) of the given type, pre-order.
    pub fn visit_node_type(&self, node_type: NodeType) -> impl Iterator<Item = &Node> + '_ {
        self.enumerate(None)
            .filter(move |(_, node)| node.is(node_type))
            .map(|(_, node)| node)
    }

    pub fn list_node_type(&self, node_type: NodeType) -> Vec<Node> {
        self.visit_node_type(node_type).cloned().collect()
    }

    /// Innermost node whose source span contains `offset` (both ends
    /// inclusive). Among overlapping siblings the rightmost one wins.
    /// `node_types`, when given, restricts which nodes may be returned.
    pub fn get_by_pos(&self, offset: usize, node_types: Option<&[NodeType]>) -> Option<&Node> {
        for child in self.children().iter().rev() {
            if let Some(found) = child.get_by_pos(offset, node_types) {
                return Some(found);
            }
        }
        let position = self.position()?;
        let type_ok = node_types.map_or(true, |types| types.contains(&self.node_type()));
        (position.contains(offset) && type_ok).then_some(self)
    }
}

fn substitute_rec(node: &Node, depth: usize, entries: &[(&NodeHierarchyIndex, &Node)]) -> Node {
    // Sorted entries put an exact hit first.
    if let Some((index, replacement)) = entries.first() {
        if index.len() == depth {
            return (*replacement).clone();
        }
    }
    let mut children = node.children().to_vec();
    let mut start = 0;
    while start < entries.len() {
        let pos = entries[start].0.indices()[depth];
        let len = entries[start..]
            .iter()
            .take_while(|(index, _)| index.indices()[depth] == pos)
            .count();
        let child = children
            .get(pos)
            .unwrap_or_else(|| panic!("index {} is out of bounds", entries[start].0));
        children[pos] = substitute_rec(child, depth + 1, &entries[start..start + len]);
        start += len;
    }
    node.with_children(children)
}

type MatchFn<'a> = dyn FnMut(&Node, &[Node]) -> bool + 'a;
type ReplaceFn<'a> = dyn FnMut(&Node, &[Node]) -> Node + 'a;

fn replace_rec(
    node: &Node,
    stack: &mut Vec<Node>,
    match_func: &mut MatchFn<'_>,
    replace_func: &mut ReplaceFn<'_>,
) -> Node {
    if node.children().is_empty() {
        return node.clone();
    }
    stack.push(node.clone());
    let mut changed = false;
    let mut children = Vec::with_capacity(node.children().len());
    for child in node.children() {
        let mut new_child = replace_rec(child, stack, match_func, replace_func);
        if match_func(&new_child, stack) {
            new_child = replace_func(&new_child, stack);
        }
        changed |= !new_child.ptr_eq(child);
        children.push(new_child);
    }
    stack.pop();
    if changed {
        node.with_children(children)
    } else {
        node.clone()
    }
}

/// Explicit-stack pre-order iterator returned by [`Node::enumerate`].
pub struct NodeEnumerator<'a> {
    stack: Vec<(NodeHierarchyIndex, &'a Node)>,
    max_depth: Option<usize>,
}

impl<'a> Iterator for NodeEnumerator<'a> {
    type Item = (NodeHierarchyIndex, &'a Node);

    fn next(&mut self) -> Option<Self::Item> {
        let (index, node) = self.stack.pop()?;
        if self.max_depth.map_or(true, |max| index.len() < max) {
            for (pos, child) in node.children().iter().enumerate().rev() {
                self.stack.push((index.child(pos), child));
            }
        }
        Some((index, node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeMeta, Span};
    use crate::shortcuts as n;

    fn idx(v: &[usize]) -> NodeHierarchyIndex {
        NodeHierarchyIndex::new(v.to_vec())
    }

    fn sample() -> Node {
        // (x + 1) * sum(y)
        n::formula(n::binary(
            "*",
            n::binary("+", n::field("x"), n::lit_int(1)),
            n::func("sum", vec![n::field("y")]),
        ))
    }

    #[test]
    fn replace_at_index_shares_untouched_subtrees() {
        let tree = sample();
        let out = tree.replace_at_index(&idx(&[0, 0, 1]), n::lit_int(2));
        assert_eq!(out.get(&idx(&[0, 0, 1])), Some(&n::lit_int(2)));
        let old_sum = tree.get(&idx(&[0, 1])).expect("sum");
        let new_sum = out.get(&idx(&[0, 1])).expect("sum");
        assert!(old_sum.ptr_eq(new_sum));
        assert_eq!(tree.get(&idx(&[0, 0, 1])), Some(&n::lit_int(1)));
        assert!(tree.replace_at_index(&NodeHierarchyIndex::root(), n::lit_int(0)) == n::lit_int(0));
    }

    #[test]
    fn substitute_batch_equals_sequential_replacements() {
        let tree = sample();
        let mut batch = BTreeMap::new();
        batch.insert(idx(&[0, 0, 0]), n::field("z"));
        batch.insert(idx(&[0, 1, 0]), n::field("w"));
        let batched = tree.substitute_batch(&batch);
        let sequential = tree
            .replace_at_index(&idx(&[0, 0, 0]), n::field("z"))
            .replace_at_index(&idx(&[0, 1, 0]), n::field("w"));
        assert_eq!(batched, sequential);
        assert!(tree.substitute_batch(&BTreeMap::new()).ptr_eq(&tree));
    }

    #[test]
    fn replace_nodes_is_bottom_up_and_skips_root() {
        let tree = n::formula(n::field("x"));
        let out = tree.replace_nodes(|node, _| node.field_name() == Some("x"), |_, _| n::field("y"));
        assert_eq!(out, n::formula(n::field("y")));

        let root_only = n::field("x");
        let same = root_only.replace_nodes(|_, _| true, |_, _| n::lit_int(0));
        assert!(same.ptr_eq(&root_only));

        // Parent stack holds the ancestors of the matched child.
        let tree = sample();
        let mut depths = Vec::new();
        let unchanged = tree.replace_nodes(
            |node, parents| {
                if node.field_name() == Some("y") {
                    depths.push(parents.len());
                    assert!(parents[parents.len() - 1].func_name() == Some("sum"));
                }
                false
            },
            |node, _| node.clone(),
        );
        assert_eq!(depths, vec![3]);
        assert!(unchanged.ptr_eq(&tree));
    }

    #[test]
    fn replace_nodes_sees_rewritten_children() {
        // x + 1 -> rewrite fields first, then the binary sees the new child.
        let tree = n::formula(n::binary("+", n::field("x"), n::lit_int(1)));
        let mut seen_new_child = false;
        let out = tree.replace_nodes(
            |node, _| node.is(NodeType::Field) || node.is(NodeType::Binary),
            |node, _| {
                if node.is(NodeType::Binary) {
                    seen_new_child = node.children()[0] == n::field("x2");
                    node.clone()
                } else {
                    n::field("x2")
                }
            },
        );
        assert!(seen_new_child);
        assert_eq!(out.get(&idx(&[0, 0])), Some(&n::field("x2")));
    }

    #[test]
    fn enumerate_is_preorder_and_depth_bounded() {
        let tree = sample();
        let indices: Vec<_> = tree.enumerate(Some(2)).map(|(i, _)| i).collect();
        assert_eq!(
            indices,
            vec![idx(&[]), idx(&[0]), idx(&[0, 0]), idx(&[0, 1])]
        );
        let all: Vec<_> = tree.enumerate(None).collect();
        assert_eq!(all.len(), tree.complexity());
        // Restartable.
        assert_eq!(tree.enumerate(None).count(), all.len());
        let fields: Vec<_> = tree
            .visit_node_type(NodeType::Field)
            .filter_map(|n| n.field_name())
            .collect();
        assert_eq!(fields, vec!["x", "y"]);
        let prefixed: Vec<_> = tree
            .child(0)
            .expect("expr")
            .enumerate_from(idx(&[0]), Some(0))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(prefixed, vec![idx(&[0])]);
    }

    #[test]
    fn get_by_pos_prefers_innermost_rightmost() {
        let at = |node: Node, start, end| {
            node.with_meta(NodeMeta {
                position: Some(Span { start, end }),
                ..Default::default()
            })
        };
        // "x+y": x at 0..0, y at 2..2, overlapping bogus span on left child.
        let left = at(n::field("x"), 0, 2);
        let right = at(n::field("y"), 2, 2);
        let tree = at(n::binary("+", left, right), 0, 2);
        assert_eq!(tree.get_by_pos(2, None).and_then(|n| n.field_name()), Some("y"));
        assert_eq!(tree.get_by_pos(1, None).and_then(|n| n.field_name()), Some("x"));
        assert!(tree
            .get_by_pos(1, Some(&[NodeType::Binary]))
            .map(|n| n.is(NodeType::Binary))
            .unwrap_or(false));
        assert!(tree.get_by_pos(7, None).is_none());
    }

    #[test]
    fn resolve_index_finds_by_identity() {
        let tree = sample();
        let sum = tree.get(&idx(&[0, 1])).expect("sum").clone();
        assert_eq!(tree.resolve_index(&sum), Some(idx(&[0, 1])));
        assert_eq!(tree.resolve_index(&n::func("sum", vec![n::field("y")])), None);
        let path = tree.iter_index(&idx(&[0, 1, 0]));
        assert_eq!(path.len(), 4);
    }
}
