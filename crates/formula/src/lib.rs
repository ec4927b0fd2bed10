//! Formula AST, persistent-tree algebra and formula-level rewrites.
//!
//! Architecture role:
//! - immutable [`Node`] trees produced by an external parser or by
//!   [`shortcuts`] builders
//! - structural identity via [`NodeExtract`] and addressing via
//!   [`NodeHierarchyIndex`]
//! - inspection helpers, type inference, mutations (normalization, constant
//!   folding, LOD/lookup to `QueryFork` conversion, level tagging) and
//!   validation checkers used by the compiler in `lodq-planner`
//!
//! Key modules:
//! - [`node`]
//! - [`algebra`]
//! - [`inspect`]
//! - [`mutation`]
//! - [`fork`]
//! - [`tag`]
//! - [`validation`]

pub mod algebra;
pub mod explain;
pub mod extract;
pub mod fork;
pub mod index;
pub mod inspect;
pub mod mutation;
pub mod node;
pub mod optimization;
pub mod shortcuts;
pub mod tag;
pub mod types;
pub mod validation;

pub use algebra::NodeEnumerator;
pub use extract::NodeExtract;
pub use index::NodeHierarchyIndex;
pub use mutation::{apply_mutations, FormulaMutation};
pub use node::{
    ForkJoinType, LiteralValue, LodKind, Node, NodeKind, NodeMeta, NodeType, Span,
    WindowGroupingKind,
};
pub use tag::{linearize_tags, LevelTag};
pub use types::DataType;
