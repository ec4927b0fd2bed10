//! Typed identifiers shared across compiler/splitter/planner components.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable user field identifier (guid).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldId(
    /// Raw guid value.
    pub String,
);

impl FieldId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for FieldId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Source table (avatar) identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AvatarId(
    /// Raw avatar id value.
    pub String,
);

impl AvatarId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AvatarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AvatarId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Id of the top-level query of a request before splitting.
pub const BASE_QUERY_ID: &str = "qq";
