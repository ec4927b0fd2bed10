use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Classification of a single formula-level error.
///
/// These codes are attached to [`FormulaError`] values that are cached per
/// field/stage by the compiler and embedded in error nodes of formula trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FormulaErrorCode {
    /// Formula text could not be parsed.
    Parse,
    /// Formula references a field that is not registered.
    UnknownField,
    /// Inferred and expected data types disagree.
    DataType,
    /// Declared cast is not applicable.
    Cast,
    /// Field dependency cycle or re-entrant stage evaluation.
    Recursion,
    /// Mixed aggregated/non-aggregated operands, double aggregation, etc.
    AggregationValidation,
    /// Illegal window function placement or arguments.
    WindowFunctionValidation,
    /// LOD dimension sets that cannot be joined.
    LodIncompatibleDimensions,
    /// Parameter value outside its constraint.
    ParameterValue,
    /// Parameter value of a type parameters cannot carry.
    ParameterUnsupportedType,
    /// Malformed lookup function call (`ago`, `at_date`).
    LookupFunction,
}

impl FormulaErrorCode {
    /// Dotted code string used in rendered error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parse => "FORMULA.PARSE",
            Self::UnknownField => "FORMULA.UNKNOWN_FIELD",
            Self::DataType => "FORMULA.DATA_TYPE",
            Self::Cast => "FORMULA.CAST",
            Self::Recursion => "FORMULA.RECURSION",
            Self::AggregationValidation => "FORMULA.VALIDATION.AGGREGATION",
            Self::WindowFunctionValidation => "FORMULA.VALIDATION.WINDOW_FUNCTION",
            Self::LodIncompatibleDimensions => "FORMULA.VALIDATION.LOD.INCOMPATIBLE_DIMENSIONS",
            Self::ParameterValue => "FORMULA.PARAMETER.VALUE",
            Self::ParameterUnsupportedType => "FORMULA.PARAMETER.UNSUPPORTED_TYPE",
            Self::LookupFunction => "FORMULA.LOOKUP_FUNCTION",
        }
    }
}

impl fmt::Display for FormulaErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One error found while compiling or validating a formula.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormulaError {
    /// Error class.
    pub code: FormulaErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Source text offset of the offending node, when known.
    pub position: Option<usize>,
}

impl FormulaError {
    /// Builds an error without position information.
    pub fn new(code: FormulaErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            position: None,
        }
    }

    /// Attaches a source offset.
    pub fn at(mut self, position: Option<usize>) -> Self {
        self.position = position;
        self
    }
}

impl fmt::Display for FormulaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.position {
            Some(pos) => write!(f, "[{}] {} (at {pos})", self.code, self.message),
            None => write!(f, "[{}] {}", self.code, self.message),
        }
    }
}

fn join_errors(errors: &[FormulaError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Canonical LODQ error taxonomy used across crates.
///
/// Classification guidance:
/// - [`LodqError::Parse`]: formula text rejected by the parser
/// - [`LodqError::FormulaHandling`]: one or more compiler stages failed for a field
/// - [`LodqError::UnknownField`]: a request references an unregistered field
/// - [`LodqError::UnresolvableSlicingTagOrder`]: level tags cannot be linearised
/// - [`LodqError::InvalidConfig`]: inconsistent registry/config state
/// - [`LodqError::Planning`]: query shape issues found while splitting/forking/planning
/// - [`LodqError::Unsupported`]: valid request for intentionally unimplemented behavior
#[derive(Debug, Error)]
pub enum LodqError {
    /// Formula text could not be parsed.
    #[error("parse error: {0}")]
    Parse(FormulaError),

    /// Compilation of a field failed at some stage.
    ///
    /// Carries the field reference and the full list of errors of the first
    /// failing stage.
    #[error("formula handling failed for field '{field}' ({field_id}): {}", join_errors(.errors))]
    FormulaHandling {
        /// Field title.
        field: String,
        /// Field guid.
        field_id: String,
        /// Errors of the failing stage.
        errors: Vec<FormulaError>,
    },

    /// Field id or title that is not present in the registry.
    #[error("unknown field: {0}")]
    UnknownField(String),

    /// Level tags of a query are not totally ordered.
    ///
    /// Examples:
    /// - two window functions with disjoint BEFORE FILTER BY sets
    #[error("unresolvable slicing tag order: {0}")]
    UnresolvableSlicingTagOrder(String),

    /// Invalid or inconsistent configuration/registry state.
    ///
    /// Examples:
    /// - direct field pointing to a missing column
    /// - field registered twice
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Split/fork/planning failures.
    ///
    /// Examples:
    /// - fork aliases originating from more than one sub-query
    /// - joined FROM referencing an unknown sub-query id
    #[error("planning error: {0}")]
    Planning(String),

    /// Valid request for a feature/shape not implemented in current version.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl LodqError {
    /// Formula errors carried by this error, if any.
    pub fn formula_errors(&self) -> &[FormulaError] {
        match self {
            Self::FormulaHandling { errors, .. } => errors,
            Self::Parse(err) => std::slice::from_ref(err),
            _ => &[],
        }
    }
}

/// Standard LODQ result alias.
pub type Result<T> = std::result::Result<T, LodqError>;
