//! Field, column and parser interfaces consumed by the compiler.
//!
//! The dataset layer owns fields and avatars; the compiler only needs
//! lookups. In-memory implementations are provided for callers that build
//! datasets programmatically and for tests.

use lodq_common::{AvatarId, FieldId, LodqError, Result};
use lodq_formula::{DataType, LiteralValue, Node};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::primitives::JoinType;

/// Aggregation declared on a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationFunction {
    #[default]
    None,
    Sum,
    Avg,
    Min,
    Max,
    Count,
    CountUnique,
}

impl AggregationFunction {
    /// Formula function implementing the aggregation.
    pub fn func_name(&self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Sum => Some("sum"),
            Self::Avg => Some("avg"),
            Self::Min => Some("min"),
            Self::Max => Some("max"),
            Self::Count => Some("count"),
            Self::CountUnique => Some("countd"),
        }
    }
}

/// Derived from the aggregation stage result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Dimension,
    Measure,
}

/// Allowed values of a parameter field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValueConstraint {
    /// Inclusive bounds; a missing bound is open.
    Range {
        min: Option<LiteralValue>,
        max: Option<LiteralValue>,
    },
    /// Explicit list of allowed values.
    Set { values: Vec<LiteralValue> },
}

fn literal_cmp(a: &LiteralValue, b: &LiteralValue) -> Option<Ordering> {
    use LiteralValue as L;
    match (a, b) {
        (L::Integer(x), L::Integer(y)) => Some(x.cmp(y)),
        (L::Integer(x), L::Float(y)) => (*x as f64).partial_cmp(y),
        (L::Float(x), L::Integer(y)) => x.partial_cmp(&(*y as f64)),
        (L::Float(x), L::Float(y)) => x.partial_cmp(y),
        (L::String(x), L::String(y)) => Some(x.cmp(y)),
        (L::Date(x), L::Date(y))
        | (L::Datetime(x), L::Datetime(y))
        | (L::GenericDatetime(x), L::GenericDatetime(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

impl ValueConstraint {
    pub fn is_satisfied_by(&self, value: &LiteralValue) -> bool {
        match self {
            Self::Range { min, max } => {
                let above = min.as_ref().map_or(true, |m| {
                    matches!(literal_cmp(value, m), Some(Ordering::Greater | Ordering::Equal))
                });
                let below = max.as_ref().map_or(true, |m| {
                    matches!(literal_cmp(value, m), Some(Ordering::Less | Ordering::Equal))
                });
                above && below
            }
            Self::Set { values } => values.contains(value),
        }
    }
}

/// How a field's base expression is obtained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CalcMode {
    /// A column of an avatar.
    Direct { avatar_id: AvatarId, source: String },
    /// User formula text.
    Formula { text: String },
    /// Request-provided constant.
    Parameter {
        default_value: Option<LiteralValue>,
        #[serde(default)]
        value_constraint: Option<ValueConstraint>,
    },
}

/// User-facing dataset field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BIField {
    pub guid: FieldId,
    pub title: String,
    pub calc_mode: CalcMode,
    #[serde(default)]
    pub aggregation: AggregationFunction,
    /// Declared result type; `None` keeps the inferred one.
    #[serde(default)]
    pub cast: Option<DataType>,
}

impl BIField {
    pub fn direct(guid: &str, title: &str, avatar_id: &str, source: &str) -> Self {
        Self {
            guid: FieldId::from(guid),
            title: title.to_string(),
            calc_mode: CalcMode::Direct {
                avatar_id: AvatarId::from(avatar_id),
                source: source.to_string(),
            },
            aggregation: AggregationFunction::None,
            cast: None,
        }
    }

    pub fn formula(guid: &str, title: &str, text: &str) -> Self {
        Self {
            guid: FieldId::from(guid),
            title: title.to_string(),
            calc_mode: CalcMode::Formula {
                text: text.to_string(),
            },
            aggregation: AggregationFunction::None,
            cast: None,
        }
    }

    pub fn parameter(guid: &str, title: &str, cast: DataType, default_value: LiteralValue) -> Self {
        Self {
            guid: FieldId::from(guid),
            title: title.to_string(),
            calc_mode: CalcMode::Parameter {
                default_value: Some(default_value),
                value_constraint: None,
            },
            aggregation: AggregationFunction::None,
            cast: Some(cast),
        }
    }

    pub fn with_aggregation(mut self, aggregation: AggregationFunction) -> Self {
        self.aggregation = aggregation;
        self
    }

    pub fn with_cast(mut self, cast: DataType) -> Self {
        self.cast = Some(cast);
        self
    }

    /// No-op for non-parameter fields.
    pub fn with_value_constraint(mut self, constraint: ValueConstraint) -> Self {
        if let CalcMode::Parameter {
            value_constraint, ..
        } = &mut self.calc_mode
        {
            *value_constraint = Some(constraint);
        }
        self
    }

    pub fn is_parameter(&self) -> bool {
        matches!(self.calc_mode, CalcMode::Parameter { .. })
    }
}

/// Physical column of an avatar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Canonical id used as the field name in compiled formulas.
    pub id: String,
    pub avatar_id: AvatarId,
    pub name: String,
    pub data_type: DataType,
    #[serde(default)]
    pub nullable: bool,
    /// Source column is pre-aggregated.
    #[serde(default)]
    pub has_auto_aggregation: bool,
}

impl ColumnInfo {
    /// Column with id `<avatar_id>.<name>`.
    pub fn new(avatar_id: &str, name: &str, data_type: DataType) -> Self {
        Self {
            id: format!("{avatar_id}.{name}"),
            avatar_id: AvatarId::from(avatar_id),
            name: name.to_string(),
            data_type,
            nullable: true,
            has_auto_aggregation: false,
        }
    }
}

/// Comparison used by a relation condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinOperator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl JoinOperator {
    /// Formula operator name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "_==",
            Self::Ne => "_!=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
        }
    }
}

/// One side of a relation condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "calc_mode", rename_all = "snake_case")]
pub enum ConditionPart {
    /// Column of the side's avatar.
    Direct { source: String },
    /// Formula over the side's avatar.
    Formula { text: String },
    /// Existing dataset field.
    ResultField { field_id: FieldId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationCondition {
    pub left: ConditionPart,
    pub right: ConditionPart,
    pub operator: JoinOperator,
}

/// Join between two avatars of a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvatarRelation {
    pub left_avatar_id: AvatarId,
    pub right_avatar_id: AvatarId,
    pub join_type: JoinType,
    pub conditions: Vec<RelationCondition>,
}

// -----------------------------
// Interfaces
// -----------------------------

pub trait FieldRegistry {
    fn field_by_id(&self, id: &FieldId) -> Option<&BIField>;
    fn field_by_title(&self, title: &str) -> Option<&BIField>;
    fn field_ids(&self) -> Vec<FieldId>;
}

pub trait ColumnRegistry {
    fn column(&self, avatar_id: &AvatarId, name: &str) -> Option<&ColumnInfo>;
    fn column_by_id(&self, id: &str) -> Option<&ColumnInfo>;
}

/// Formula text parser.
///
/// Returns a `Formula` node; malformed text is reported as
/// [`LodqError::Parse`].
pub trait FormulaParser {
    fn parse(&self, text: &str) -> Result<Node>;
}

// -----------------------------
// In-memory implementations
// -----------------------------

/// Field registry backed by insertion-ordered vectors.
#[derive(Debug, Default, Clone)]
pub struct StaticFieldRegistry {
    fields: Vec<BIField>,
    by_id: HashMap<FieldId, usize>,
    by_title: HashMap<String, usize>,
}

impl StaticFieldRegistry {
    pub fn new(fields: Vec<BIField>) -> Result<Self> {
        let mut registry = Self::default();
        for field in fields {
            registry.insert(field)?;
        }
        Ok(registry)
    }

    /// Fails on a duplicate guid or title.
    pub fn insert(&mut self, field: BIField) -> Result<()> {
        if self.by_id.contains_key(&field.guid) {
            return Err(LodqError::InvalidConfig(format!(
                "field {} registered twice",
                field.guid
            )));
        }
        if self.by_title.contains_key(&field.title) {
            return Err(LodqError::InvalidConfig(format!(
                "duplicate field title '{}'",
                field.title
            )));
        }
        let pos = self.fields.len();
        self.by_id.insert(field.guid.clone(), pos);
        self.by_title.insert(field.title.clone(), pos);
        self.fields.push(field);
        Ok(())
    }
}

impl FieldRegistry for StaticFieldRegistry {
    fn field_by_id(&self, id: &FieldId) -> Option<&BIField> {
        self.by_id.get(id).map(|pos| &self.fields[*pos])
    }

    fn field_by_title(&self, title: &str) -> Option<&BIField> {
        self.by_title.get(title).map(|pos| &self.fields[*pos])
    }

    fn field_ids(&self) -> Vec<FieldId> {
        self.fields.iter().map(|f| f.guid.clone()).collect()
    }
}

#[derive(Debug, Default, Clone)]
pub struct StaticColumnRegistry {
    columns: Vec<ColumnInfo>,
    by_id: HashMap<String, usize>,
    by_name: HashMap<(AvatarId, String), usize>,
}

impl StaticColumnRegistry {
    pub fn new(columns: Vec<ColumnInfo>) -> Result<Self> {
        let mut registry = Self::default();
        for column in columns {
            registry.insert(column)?;
        }
        Ok(registry)
    }

    pub fn insert(&mut self, column: ColumnInfo) -> Result<()> {
        if self.by_id.contains_key(&column.id) {
            return Err(LodqError::InvalidConfig(format!(
                "column {} registered twice",
                column.id
            )));
        }
        let pos = self.columns.len();
        self.by_id.insert(column.id.clone(), pos);
        self.by_name
            .insert((column.avatar_id.clone(), column.name.clone()), pos);
        self.columns.push(column);
        Ok(())
    }
}

impl ColumnRegistry for StaticColumnRegistry {
    fn column(&self, avatar_id: &AvatarId, name: &str) -> Option<&ColumnInfo> {
        self.by_name
            .get(&(avatar_id.clone(), name.to_string()))
            .map(|pos| &self.columns[*pos])
    }

    fn column_by_id(&self, id: &str) -> Option<&ColumnInfo> {
        self.by_id.get(id).map(|pos| &self.columns[*pos])
    }
}
