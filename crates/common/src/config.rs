use serde::{Deserialize, Serialize};

/// Field compiler behavior switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilerConfig {
    /// Substitute a child field's pre-aggregation expression when the
    /// reference already sits inside an aggregate call.
    pub suppress_double_aggregation: bool,
    /// Convert AMONG to WITHIN using the literal AMONG dimensions instead of
    /// the request GROUP BY.
    pub mock_among_dimensions: bool,
    /// Allow window functions nested inside other window functions.
    pub allow_nested_window_functions: bool,
    /// Turn window functions and the aggregations next to them into query
    /// forks, so the splitter evaluates windows in sub-queries of their own.
    #[serde(default)]
    pub fork_window_functions: bool,
    /// Emit per-stage debug logs.
    pub verbose_logging: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            suppress_double_aggregation: true,
            mock_among_dimensions: false,
            allow_nested_window_functions: true,
            fork_window_functions: false,
            verbose_logging: false,
        }
    }
}

/// Multi-query splitter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitterConfig {
    /// Do not group LOD forks that share a dimension set across sibling
    /// aggregations; every LOD gets its own mask.
    pub disable_lod_grouping: bool,
    /// Upper bound on repeated split rounds over a multi-query.
    pub max_split_rounds: usize,
    /// Emit per-mask debug logs.
    pub verbose_logging: bool,
}

impl Default for SplitterConfig {
    fn default() -> Self {
        Self {
            disable_lod_grouping: false,
            max_split_rounds: 64,
            verbose_logging: false,
        }
    }
}

/// Multi-level query forker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkerConfig {
    /// Do not group LOD forks by their child dimension sets.
    pub disable_lod_grouping: bool,
    /// Skip forking when the single fork would reproduce its origin query.
    pub skip_redundant_forks: bool,
    /// Emit per-fork debug logs.
    pub verbose_logging: bool,
}

impl Default for ForkerConfig {
    fn default() -> Self {
        Self {
            disable_lod_grouping: false,
            skip_redundant_forks: true,
            verbose_logging: false,
        }
    }
}

/// Execution planning strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanningStrategy {
    /// Route window functions to the compute engine tier.
    WindowToCompeng,
    /// One tier per level tag plus a top tier.
    NestedLevelTag,
    /// Push simple filters into the source database, compute the rest.
    PrefilterAndCompeng,
}

/// Execution planner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Strategy used by [`PlannerConfig::strategy`] consumers.
    pub strategy: PlanningStrategy,
    /// Treat the query as a value-range/distinct request (never uses compeng).
    pub value_range_query: bool,
    /// Emit per-formula debug logs.
    pub verbose_logging: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            strategy: PlanningStrategy::WindowToCompeng,
            value_range_query: false,
            verbose_logging: false,
        }
    }
}

/// Aggregate configuration passed across layers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LodqConfig {
    pub compiler: CompilerConfig,
    pub splitter: SplitterConfig,
    pub forker: ForkerConfig,
    pub planner: PlannerConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_behavior() {
        let cfg = LodqConfig::default();
        assert!(cfg.compiler.suppress_double_aggregation);
        assert!(!cfg.compiler.mock_among_dimensions);
        assert!(!cfg.compiler.fork_window_functions);
        assert!(cfg.forker.skip_redundant_forks);
        assert_eq!(cfg.planner.strategy, PlanningStrategy::WindowToCompeng);
    }

    #[test]
    fn config_deserializes_from_json() {
        let json = r#"{
            "compiler": {"suppress_double_aggregation": false, "mock_among_dimensions": true,
                         "allow_nested_window_functions": false, "verbose_logging": false},
            "splitter": {"disable_lod_grouping": true, "max_split_rounds": 3, "verbose_logging": false},
            "forker": {"disable_lod_grouping": false, "skip_redundant_forks": false, "verbose_logging": true},
            "planner": {"strategy": "NestedLevelTag", "value_range_query": false, "verbose_logging": false}
        }"#;
        let cfg: LodqConfig = serde_json::from_str(json).expect("config");
        assert!(cfg.compiler.mock_among_dimensions);
        assert_eq!(cfg.splitter.max_split_rounds, 3);
        assert!(!cfg.forker.skip_redundant_forks);
        assert_eq!(cfg.planner.strategy, PlanningStrategy::NestedLevelTag);
    }
}
