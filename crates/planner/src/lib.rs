//! Semantic-layer query planning: field compilation, sub-query splitting,
//! forking and tier planning.
//!
//! Architecture role:
//! - compiles BI fields into formula trees through [`FormulaCompiler`]
//!   stages against [`FieldRegistry`]/[`ColumnRegistry`] providers
//! - assembles requests into a [`CompiledQuery`] ([`QueryCompiler`])
//! - splits LOD `QueryFork` nodes into joined sub-queries
//!   ([`MultiQuerySplitter`] with [`QueryForkMaskDiscovery`])
//! - forks sub-queries of level-separated queries ([`QueryForker`])
//! - assigns formulas to `source_db`/`compeng` tiers ([`ExecutionPlanner`])
//!
//! Key modules:
//! - [`compiler`]
//! - [`query_compiler`]
//! - [`splitter`]
//! - [`query_fork_splitter`]
//! - [`forker`]
//! - [`execution_planner`]

pub mod compiler;
pub mod dependency;
pub mod execution_planner;
pub mod explain;
pub mod forker;
pub mod primitives;
pub mod query_compiler;
pub mod query_fork_splitter;
pub mod query_tools;
pub mod registry;
pub mod sanitizer;
pub mod splitter;

pub use compiler::{CompilationContext, CompilationReport, CompilationStage, ErrorMode, FormulaCompiler};
pub use dependency::DependencyGraph;
pub use execution_planner::{
    create_planner, ExecutionPlanner, NestedLevelTagPlanner, NonAggregatePrefilterPolicy, PrefilterAndCompengPlanner,
    PrefilterPolicy, WindowToCompengPlanner,
};
pub use explain::{explain_multi_level_query, explain_multi_query, explain_plan, explain_query};
pub use forker::QueryForker;
pub use primitives::*;
pub use query_compiler::{FilterOperator, FilterSpec, OrderBySpec, QueryCompiler, QuerySpec};
pub use query_fork_splitter::{query_fork_splitter, QueryForkMaskDiscovery};
pub use registry::*;
pub use sanitizer::{GroupByNormalizer, MultiQuerySanitizer};
pub use splitter::{MultiQuerySplitter, SplitMaskDiscovery};
