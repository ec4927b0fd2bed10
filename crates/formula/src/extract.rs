use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::node::NodeType;

/// Structural fingerprint of a formula subtree.
///
/// Two nodes are equal iff their extracts are equal. Position, original text
/// and level tags never contribute. Cloning is cheap and the hash is
/// precomputed, so extracts are suitable as map keys.
#[derive(Clone)]
pub struct NodeExtract(Arc<ExtractInner>);

struct ExtractInner {
    node_type: NodeType,
    value: Option<String>,
    children: Vec<NodeExtract>,
    complexity: usize,
    hash: u64,
}

impl NodeExtract {
    pub(crate) fn new(node_type: NodeType, value: Option<String>, children: Vec<NodeExtract>) -> Self {
        let complexity = 1 + children.iter().map(|c| c.complexity()).sum::<usize>();
        let mut hasher = DefaultHasher::new();
        node_type.hash(&mut hasher);
        value.hash(&mut hasher);
        for child in &children {
            child.0.hash.hash(&mut hasher);
        }
        Self(Arc::new(ExtractInner {
            node_type,
            value,
            children,
            complexity,
            hash: hasher.finish(),
        }))
    }

    pub fn node_type(&self) -> NodeType {
        self.0.node_type
    }

    /// Canonical scalar payload (function name, operator, literal value...).
    pub fn value(&self) -> Option<&str> {
        self.0.value.as_deref()
    }

    pub fn children(&self) -> &[NodeExtract] {
        &self.0.children
    }

    /// Size of the subtree this extract describes.
    pub fn complexity(&self) -> usize {
        self.0.complexity
    }
}

impl PartialEq for NodeExtract {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.0, &other.0) {
            return true;
        }
        self.0.hash == other.0.hash
            && self.0.node_type == other.0.node_type
            && self.0.value == other.0.value
            && self.0.children == other.0.children
    }
}

impl Eq for NodeExtract {}

impl Hash for NodeExtract {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.0.hash);
    }
}

impl PartialOrd for NodeExtract {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeExtract {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .node_type
            .cmp(&other.0.node_type)
            .then_with(|| self.0.value.cmp(&other.0.value))
            .then_with(|| self.0.children.cmp(&other.0.children))
    }
}

impl fmt::Debug for NodeExtract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0.node_type)?;
        if let Some(value) = &self.0.value {
            write!(f, "<{value}>")?;
        }
        if !self.0.children.is_empty() {
            f.debug_list().entries(self.0.children.iter()).finish()?;
        }
        Ok(())
    }
}
