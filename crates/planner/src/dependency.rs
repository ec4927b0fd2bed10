//! Forward/inverse field dependency index.

use lodq_common::FieldId;
use std::collections::{BTreeSet, HashMap, HashSet};

/// `field -> fields it references` plus the inverse map.
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    forward: HashMap<FieldId, BTreeSet<FieldId>>,
    inverse: HashMap<FieldId, BTreeSet<FieldId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the outgoing edges of `field`.
    pub fn set_dependencies(&mut self, field: &FieldId, deps: BTreeSet<FieldId>) {
        self.clear_dependencies(field);
        for dep in &deps {
            self.inverse
                .entry(dep.clone())
                .or_default()
                .insert(field.clone());
        }
        self.forward.insert(field.clone(), deps);
    }

    /// Drop the outgoing edges of `field`; incoming edges stay.
    pub fn clear_dependencies(&mut self, field: &FieldId) {
        if let Some(old) = self.forward.remove(field) {
            for dep in old {
                if let Some(users) = self.inverse.get_mut(&dep) {
                    users.remove(field);
                    if users.is_empty() {
                        self.inverse.remove(&dep);
                    }
                }
            }
        }
    }

    pub fn dependencies(&self, field: &FieldId) -> impl Iterator<Item = &FieldId> + '_ {
        self.forward.get(field).into_iter().flatten()
    }

    pub fn direct_dependents(&self, field: &FieldId) -> impl Iterator<Item = &FieldId> + '_ {
        self.inverse.get(field).into_iter().flatten()
    }

    /// Whether `field` can reach itself through forward edges.
    pub fn has_cycle_from(&self, field: &FieldId) -> bool {
        let mut visited: HashSet<&FieldId> = HashSet::new();
        let mut stack: Vec<&FieldId> = self.dependencies(field).collect();
        while let Some(current) = stack.pop() {
            if current == field {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            stack.extend(self.dependencies(current));
        }
        false
    }

    /// `field` and every field that transitively depends on it.
    pub fn dependents_closure(&self, field: &FieldId) -> Vec<FieldId> {
        let mut visited: HashSet<FieldId> = HashSet::new();
        let mut out = Vec::new();
        let mut stack = vec![field.clone()];
        while let Some(current) = stack.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            stack.extend(self.direct_dependents(&current).cloned());
            out.push(current);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> BTreeSet<FieldId> {
        names.iter().map(|n| FieldId::from(*n)).collect()
    }

    #[test]
    fn cycles_are_detected() {
        let mut graph = DependencyGraph::new();
        graph.set_dependencies(&"a".into(), ids(&["b"]));
        graph.set_dependencies(&"b".into(), ids(&["c"]));
        assert!(!graph.has_cycle_from(&"a".into()));
        graph.set_dependencies(&"c".into(), ids(&["a"]));
        assert!(graph.has_cycle_from(&"a".into()));
        assert!(graph.has_cycle_from(&"c".into()));
    }

    #[test]
    fn dependents_are_transitive_and_terminate() {
        let mut graph = DependencyGraph::new();
        graph.set_dependencies(&"a".into(), ids(&["b"]));
        graph.set_dependencies(&"b".into(), ids(&["c"]));
        graph.set_dependencies(&"c".into(), ids(&["b"]));
        let mut closure = graph.dependents_closure(&"c".into());
        closure.sort();
        assert_eq!(closure, vec![FieldId::from("a"), "b".into(), "c".into()]);
    }

    #[test]
    fn replacing_edges_updates_inverse_index() {
        let mut graph = DependencyGraph::new();
        graph.set_dependencies(&"a".into(), ids(&["b"]));
        graph.set_dependencies(&"a".into(), ids(&["c"]));
        assert_eq!(graph.direct_dependents(&"b".into()).count(), 0);
        assert_eq!(graph.direct_dependents(&"c".into()).count(), 1);
        graph.clear_dependencies(&"a".into());
        assert_eq!(graph.dependencies(&"a".into()).count(), 0);
    }
}
