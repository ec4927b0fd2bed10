use serde::{Deserialize, Serialize};
use std::fmt;

/// Path of child positions from a root node to a descendant.
///
/// Ordering is lexicographic, so a prefix always sorts before any of its
/// descendants and siblings sort by position.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeHierarchyIndex(Vec<usize>);

impl NodeHierarchyIndex {
    /// Index of the root itself.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn new(indices: impl Into<Vec<usize>>) -> Self {
        Self(indices.into())
    }

    pub fn indices(&self) -> &[usize] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Split off the first step: `(head, rest)`.
    pub fn lsplit(&self) -> Option<(usize, NodeHierarchyIndex)> {
        let (head, rest) = self.0.split_first()?;
        Some((*head, Self(rest.to_vec())))
    }

    /// Split off the last step: `(parent, last)`.
    pub fn rsplit(&self) -> Option<(NodeHierarchyIndex, usize)> {
        let (last, parent) = self.0.split_last()?;
        Some((Self(parent.to_vec()), *last))
    }

    pub fn startswith(&self, prefix: &NodeHierarchyIndex) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Index of the `pos`-th child of this node.
    pub fn child(&self, pos: usize) -> Self {
        let mut indices = self.0.clone();
        indices.push(pos);
        Self(indices)
    }

    pub fn concat(&self, other: &NodeHierarchyIndex) -> Self {
        let mut indices = self.0.clone();
        indices.extend_from_slice(&other.0);
        Self(indices)
    }
}

impl From<Vec<usize>> for NodeHierarchyIndex {
    fn from(value: Vec<usize>) -> Self {
        Self(value)
    }
}

impl fmt::Display for NodeHierarchyIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = self.0.iter().map(|i| i.to_string()).collect::<Vec<_>>();
        write!(f, "({})", parts.join(", "))
    }
}
