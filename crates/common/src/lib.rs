//! Shared configuration, error types and IDs for LODQ crates.
//!
//! Architecture role:
//! - defines compiler/splitter/forker/planner configuration passed across layers
//! - provides common [`LodqError`] / [`Result`] contracts and the
//!   [`FormulaError`] taxonomy
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]

pub mod config;
pub mod error;
pub mod ids;

pub use config::{
    CompilerConfig, ForkerConfig, LodqConfig, PlannerConfig, PlanningStrategy, SplitterConfig,
};
pub use error::{FormulaError, FormulaErrorCode, LodqError, Result};
pub use ids::*;
