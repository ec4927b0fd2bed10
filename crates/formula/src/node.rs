//! Immutable formula AST nodes.
//!
//! A [`Node`] is an `Arc`-shared, immutable value: every edit produces a new
//! tree that reuses untouched subtrees. Node identity (`ptr_eq`) is used to
//! detect "nothing changed" results; node equality is structural and goes
//! through [`NodeExtract`].
//!
//! Child order contract (relied upon by hierarchy indices):
//! - `FuncCall`: `(*args, lod, ignore_dimensions, before_filter_by)`
//! - `WindowFuncCall`: `(*args, ordering, grouping, lod, ignore_dimensions, before_filter_by)`
//! - `IfBlock`: `(*if_parts, else)`; `CaseBlock`: `(case_expr, *when_parts, else)`
//! - `QueryFork`: `(joining, result_expr, lod, before_filter_by, bfb_filter_mutations)`

use lodq_common::FormulaErrorCode;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::extract::NodeExtract;
use crate::tag::LevelTag;

/// Literal payload of a constant node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LiteralValue {
    Null,
    Integer(i64),
    Float(f64),
    Boolean(bool),
    String(String),
    /// `YYYY-MM-DD`
    Date(String),
    /// `YYYY-MM-DD HH:MM:SS` (a `T` separator is accepted)
    Datetime(String),
    GenericDatetime(String),
    /// `(latitude, longitude)`
    Geopoint(f64, f64),
    Uuid(String),
    /// Homogeneous, non-nested list of values.
    Array(Vec<LiteralValue>),
}

impl LiteralValue {
    fn variant_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::Boolean(_) => "boolean",
            Self::String(_) => "string",
            Self::Date(_) => "date",
            Self::Datetime(_) => "datetime",
            Self::GenericDatetime(_) => "genericdatetime",
            Self::Geopoint(..) => "geopoint",
            Self::Uuid(_) => "uuid",
            Self::Array(_) => "array",
        }
    }

    /// Check payload format constraints.
    pub fn validate(&self) -> std::result::Result<(), String> {
        match self {
            Self::Date(v) => {
                if !is_valid_date(v) {
                    return Err(format!("invalid date literal '{v}'"));
                }
            }
            Self::Datetime(v) | Self::GenericDatetime(v) => {
                if !is_valid_datetime(v) {
                    return Err(format!("invalid datetime literal '{v}'"));
                }
            }
            Self::Geopoint(lat, lon) => {
                if !(-90.0..=90.0).contains(lat) || !(-180.0..=180.0).contains(lon) {
                    return Err(format!("geopoint ({lat}, {lon}) is out of range"));
                }
            }
            Self::Uuid(v) => {
                if !is_valid_uuid(v) {
                    return Err(format!("invalid uuid literal '{v}'"));
                }
            }
            Self::Array(items) => {
                let mut kinds = items.iter().map(|i| i.variant_name());
                if let Some(first) = kinds.next() {
                    if first == "array" {
                        return Err("nested array literals are not allowed".to_string());
                    }
                    if kinds.any(|k| k != first) {
                        return Err("array literal items must have the same type".to_string());
                    }
                }
                for item in items {
                    item.validate()?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Canonical text used for structural comparison.
    ///
    /// `None` for values without a canonical form (`NaN`).
    fn canonical(&self) -> Option<String> {
        Some(match self {
            Self::Null => "null".to_string(),
            Self::Integer(v) => format!("i:{v}"),
            Self::Float(v) => {
                if v.is_nan() {
                    return None;
                }
                // -0.0 == 0.0
                let v = if *v == 0.0 { 0.0 } else { *v };
                format!("f:{v:?}")
            }
            Self::Boolean(v) => format!("b:{v}"),
            Self::String(v) => format!("s:{v}"),
            Self::Date(v) => format!("d:{v}"),
            Self::Datetime(v) => format!("dt:{}", v.replacen('T', " ", 1)),
            Self::GenericDatetime(v) => format!("gdt:{}", v.replacen('T', " ", 1)),
            Self::Geopoint(lat, lon) => format!("gp:{lat:?},{lon:?}"),
            Self::Uuid(v) => format!("u:{}", v.to_ascii_lowercase()),
            Self::Array(items) => {
                let parts = items
                    .iter()
                    .map(|i| i.canonical())
                    .collect::<Option<Vec<_>>>()?;
                format!("a:{}:{}", parts.len(), parts.join("\u{1e}"))
            }
        })
    }
}

fn all_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn is_leap_year(year: u32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

fn days_in_month(year: u32, month: u32) -> u32 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 if is_leap_year(year) => 29,
        2 => 28,
        _ => 0,
    }
}

fn is_valid_date(v: &str) -> bool {
    let parts: Vec<&str> = v.split('-').collect();
    if parts.len() != 3 || parts[0].len() != 4 || parts[1].len() != 2 || parts[2].len() != 2 {
        return false;
    }
    if !parts.iter().all(|p| all_digits(p)) {
        return false;
    }
    let year: u32 = parts[0].parse().unwrap_or(0);
    let month: u32 = parts[1].parse().unwrap_or(0);
    let day: u32 = parts[2].parse().unwrap_or(0);
    day >= 1 && day <= days_in_month(year, month)
}

fn is_valid_datetime(v: &str) -> bool {
    // Offsets below are byte positions.
    if v.len() < 19 || !v.is_ascii() {
        return false;
    }
    let (date, rest) = v.split_at(10);
    if !is_valid_date(date) || !(rest.starts_with(' ') || rest.starts_with('T')) {
        return false;
    }
    let time: Vec<&str> = rest[1..9].split(':').collect();
    if time.len() != 3 || !time.iter().all(|p| p.len() == 2 && all_digits(p)) {
        return false;
    }
    let hour: u32 = time[0].parse().unwrap_or(99);
    let minute: u32 = time[1].parse().unwrap_or(99);
    let second: u32 = time[2].parse().unwrap_or(99);
    hour < 24 && minute < 60 && second < 61
}

fn is_valid_uuid(v: &str) -> bool {
    v.len() == 36
        && v.char_indices().all(|(i, c)| match i {
            8 | 13 | 18 | 23 => c == '-',
            _ => c.is_ascii_hexdigit(),
        })
}

/// Level-of-detail specifier flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LodKind {
    /// No LOD clause.
    Default,
    /// Dimensions are taken from the enclosing query.
    Inherited,
    Fixed,
    Include,
    Exclude,
}

impl LodKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Inherited => "inherited",
            Self::Fixed => "fixed",
            Self::Include => "include",
            Self::Exclude => "exclude",
        }
    }

    /// Whether the specifier carries a dimension list.
    pub fn has_dimensions(&self) -> bool {
        matches!(self, Self::Fixed | Self::Include | Self::Exclude)
    }
}

/// Window function grouping flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WindowGroupingKind {
    Total,
    Within,
    Among,
}

impl WindowGroupingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Total => "total",
            Self::Within => "within",
            Self::Among => "among",
        }
    }
}

/// Join type of a query fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ForkJoinType {
    Left,
    Inner,
}

impl ForkJoinType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Inner => "inner",
        }
    }
}

/// Node variant with its scalar payload. Children live on [`Node`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    Literal(LiteralValue),
    Field { name: String },
    FuncCall { name: String },
    WindowFuncCall { name: String },
    Unary { op: String },
    Binary { op: String },
    Ternary { op: String },
    /// `(condition, expr)`
    IfPart,
    IfBlock,
    /// `(value, expr)`
    WhenPart,
    CaseBlock,
    Parenthesized,
    Lod(LodKind),
    WindowGrouping(WindowGroupingKind),
    BeforeFilterBy { field_names: BTreeSet<String> },
    Ordering,
    OrderAscending,
    OrderDescending,
    IgnoreDimensions,
    QueryFork { join_type: ForkJoinType },
    QueryForkJoining,
    /// `(expr)`: left and fork sides must match on `expr`.
    SelfEqualityJoinCondition,
    /// `(expr, fork_expr)`
    BinaryJoinCondition,
    BfbFilterMutations,
    /// `(original, replacement)`
    BfbFilterMutationSpec,
    Error { message: String, code: FormulaErrorCode },
    Formula,
}

/// Payload-free discriminant of [`NodeKind`], used for type filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeType {
    Literal,
    Field,
    FuncCall,
    WindowFuncCall,
    Unary,
    Binary,
    Ternary,
    IfPart,
    IfBlock,
    WhenPart,
    CaseBlock,
    Parenthesized,
    Lod,
    WindowGrouping,
    BeforeFilterBy,
    Ordering,
    OrderAscending,
    OrderDescending,
    IgnoreDimensions,
    QueryFork,
    QueryForkJoining,
    SelfEqualityJoinCondition,
    BinaryJoinCondition,
    BfbFilterMutations,
    BfbFilterMutationSpec,
    Error,
    Formula,
}

impl NodeKind {
    pub fn node_type(&self) -> NodeType {
        match self {
            Self::Literal(_) => NodeType::Literal,
            Self::Field { .. } => NodeType::Field,
            Self::FuncCall { .. } => NodeType::FuncCall,
            Self::WindowFuncCall { .. } => NodeType::WindowFuncCall,
            Self::Unary { .. } => NodeType::Unary,
            Self::Binary { .. } => NodeType::Binary,
            Self::Ternary { .. } => NodeType::Ternary,
            Self::IfPart => NodeType::IfPart,
            Self::IfBlock => NodeType::IfBlock,
            Self::WhenPart => NodeType::WhenPart,
            Self::CaseBlock => NodeType::CaseBlock,
            Self::Parenthesized => NodeType::Parenthesized,
            Self::Lod(_) => NodeType::Lod,
            Self::WindowGrouping(_) => NodeType::WindowGrouping,
            Self::BeforeFilterBy { .. } => NodeType::BeforeFilterBy,
            Self::Ordering => NodeType::Ordering,
            Self::OrderAscending => NodeType::OrderAscending,
            Self::OrderDescending => NodeType::OrderDescending,
            Self::IgnoreDimensions => NodeType::IgnoreDimensions,
            Self::QueryFork { .. } => NodeType::QueryFork,
            Self::QueryForkJoining => NodeType::QueryForkJoining,
            Self::SelfEqualityJoinCondition => NodeType::SelfEqualityJoinCondition,
            Self::BinaryJoinCondition => NodeType::BinaryJoinCondition,
            Self::BfbFilterMutations => NodeType::BfbFilterMutations,
            Self::BfbFilterMutationSpec => NodeType::BfbFilterMutationSpec,
            Self::Error { .. } => NodeType::Error,
            Self::Formula => NodeType::Formula,
        }
    }

    /// Scalar part of the extract. `Err(())` when it cannot be canonicalised.
    fn extract_value(&self) -> std::result::Result<Option<String>, ()> {
        Ok(match self {
            Self::Literal(v) => Some(v.canonical().ok_or(())?),
            Self::Field { name } => Some(name.clone()),
            Self::FuncCall { name } | Self::WindowFuncCall { name } => Some(name.clone()),
            Self::Unary { op } | Self::Binary { op } | Self::Ternary { op } => Some(op.clone()),
            Self::Lod(kind) => Some(kind.as_str().to_string()),
            Self::WindowGrouping(kind) => Some(kind.as_str().to_string()),
            Self::BeforeFilterBy { field_names } => {
                Some(field_names.iter().cloned().collect::<Vec<_>>().join("\u{1f}"))
            }
            Self::QueryFork { join_type } => Some(join_type.as_str().to_string()),
            Self::Error { message, code } => Some(format!("{code}:{message}")),
            _ => None,
        })
    }
}

/// Inclusive source span `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn contains(&self, offset: usize) -> bool {
        self.start <= offset && offset <= self.end
    }
}

/// Metadata that never affects structural equality.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMeta {
    pub position: Option<Span>,
    pub original_text: Option<String>,
    pub tag: Option<LevelTag>,
}

struct NodeInner {
    kind: NodeKind,
    children: Vec<Node>,
    meta: NodeMeta,
    extract: Option<NodeExtract>,
}

/// Shared immutable formula node.
#[derive(Clone)]
pub struct Node(Arc<NodeInner>);

fn expect_type(children: &[Node], pos: usize, expected: NodeType) -> std::result::Result<(), String> {
    match children.get(pos) {
        Some(child) if child.node_type() == expected => Ok(()),
        Some(child) => Err(format!(
            "child {pos} must be {expected:?}, got {:?}",
            child.node_type()
        )),
        None => Err(format!("missing child {pos} ({expected:?})")),
    }
}

fn expect_len(children: &[Node], len: usize) -> std::result::Result<(), String> {
    if children.len() == len {
        Ok(())
    } else {
        Err(format!("expected {len} children, got {}", children.len()))
    }
}

fn expect_min_len(children: &[Node], len: usize) -> std::result::Result<(), String> {
    if children.len() >= len {
        Ok(())
    } else {
        Err(format!("expected at least {len} children, got {}", children.len()))
    }
}

fn expect_all(children: &[Node], expected: &[NodeType]) -> std::result::Result<(), String> {
    match children.iter().find(|c| !expected.contains(&c.node_type())) {
        Some(bad) => Err(format!(
            "unexpected child {:?}, allowed: {expected:?}",
            bad.node_type()
        )),
        None => Ok(()),
    }
}

fn validate_children(kind: &NodeKind, children: &[Node]) -> std::result::Result<(), String> {
    use NodeType as T;
    match kind {
        NodeKind::Literal(value) => {
            expect_len(children, 0)?;
            value.validate()
        }
        NodeKind::Field { .. }
        | NodeKind::BeforeFilterBy { .. }
        | NodeKind::Error { .. } => expect_len(children, 0),
        NodeKind::FuncCall { .. } => {
            expect_min_len(children, 3)?;
            let n = children.len();
            expect_type(children, n - 3, T::Lod)?;
            expect_type(children, n - 2, T::IgnoreDimensions)?;
            expect_type(children, n - 1, T::BeforeFilterBy)
        }
        NodeKind::WindowFuncCall { .. } => {
            expect_min_len(children, 5)?;
            let n = children.len();
            expect_type(children, n - 5, T::Ordering)?;
            expect_type(children, n - 4, T::WindowGrouping)?;
            expect_type(children, n - 3, T::Lod)?;
            expect_type(children, n - 2, T::IgnoreDimensions)?;
            expect_type(children, n - 1, T::BeforeFilterBy)
        }
        NodeKind::Unary { .. }
        | NodeKind::Parenthesized
        | NodeKind::OrderAscending
        | NodeKind::OrderDescending
        | NodeKind::SelfEqualityJoinCondition
        | NodeKind::Formula => expect_len(children, 1),
        NodeKind::Binary { .. }
        | NodeKind::IfPart
        | NodeKind::WhenPart
        | NodeKind::BinaryJoinCondition
        | NodeKind::BfbFilterMutationSpec => expect_len(children, 2),
        NodeKind::Ternary { .. } => expect_len(children, 3),
        NodeKind::IfBlock => {
            expect_min_len(children, 2)?;
            expect_all(&children[..children.len() - 1], &[T::IfPart])
        }
        NodeKind::CaseBlock => {
            expect_min_len(children, 3)?;
            expect_all(&children[1..children.len() - 1], &[T::WhenPart])
        }
        NodeKind::Lod(kind) => {
            if kind.has_dimensions() {
                Ok(())
            } else {
                expect_len(children, 0)
            }
        }
        NodeKind::WindowGrouping(kind) => match kind {
            WindowGroupingKind::Total => expect_len(children, 0),
            _ => Ok(()),
        },
        NodeKind::Ordering | NodeKind::IgnoreDimensions => Ok(()),
        NodeKind::QueryFork { .. } => {
            expect_len(children, 5)?;
            expect_type(children, 0, T::QueryForkJoining)?;
            expect_type(children, 2, T::Lod)?;
            expect_type(children, 3, T::BeforeFilterBy)?;
            expect_type(children, 4, T::BfbFilterMutations)
        }
        NodeKind::QueryForkJoining => expect_all(
            children,
            &[T::SelfEqualityJoinCondition, T::BinaryJoinCondition],
        ),
        NodeKind::BfbFilterMutations => expect_all(children, &[T::BfbFilterMutationSpec]),
    }
}

impl Node {
    /// Build a node, validating child arity and kinds.
    pub fn try_new(
        kind: NodeKind,
        children: Vec<Node>,
        meta: NodeMeta,
    ) -> std::result::Result<Node, String> {
        validate_children(&kind, &children)
            .map_err(|e| format!("invalid {:?} node: {e}", kind.node_type()))?;
        let extract = match kind.extract_value() {
            Ok(value) => children
                .iter()
                .map(|c| c.extract().cloned())
                .collect::<Option<Vec<_>>>()
                .map(|child_extracts| NodeExtract::new(kind.node_type(), value, child_extracts)),
            Err(()) => None,
        };
        Ok(Node(Arc::new(NodeInner {
            kind,
            children,
            meta,
            extract,
        })))
    }

    /// Build a node with empty metadata.
    ///
    /// Panics when the children violate the arity/kind contract of `kind`;
    /// that is a programming error in the caller.
    pub fn new(kind: NodeKind, children: Vec<Node>) -> Node {
        Self::try_new(kind, children, NodeMeta::default()).unwrap_or_else(|e| panic!("{e}"))
    }

    pub fn kind(&self) -> &NodeKind {
        &self.0.kind
    }

    pub fn node_type(&self) -> NodeType {
        self.0.kind.node_type()
    }

    pub fn is(&self, node_type: NodeType) -> bool {
        self.node_type() == node_type
    }

    pub fn children(&self) -> &[Node] {
        &self.0.children
    }

    pub fn child(&self, pos: usize) -> Option<&Node> {
        self.0.children.get(pos)
    }

    pub fn meta(&self) -> &NodeMeta {
        &self.0.meta
    }

    pub fn tag(&self) -> Option<&LevelTag> {
        self.0.meta.tag.as_ref()
    }

    pub fn position(&self) -> Option<Span> {
        self.0.meta.position
    }

    /// Structural fingerprint; `None` when any part of the subtree has no
    /// canonical form.
    pub fn extract(&self) -> Option<&NodeExtract> {
        self.0.extract.as_ref()
    }

    /// Subtree size.
    pub fn complexity(&self) -> usize {
        match &self.0.extract {
            Some(extract) => extract.complexity(),
            None => 1 + self.0.children.iter().map(|c| c.complexity()).sum::<usize>(),
        }
    }

    /// Same allocation, i.e. nothing was rebuilt.
    pub fn ptr_eq(&self, other: &Node) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Light copy: same payload and metadata, new children.
    pub fn with_children(&self, children: Vec<Node>) -> Node {
        Self::try_new(self.0.kind.clone(), children, self.0.meta.clone())
            .unwrap_or_else(|e| panic!("{e}"))
    }

    /// Copy with one child replaced.
    pub fn with_child(&self, pos: usize, child: Node) -> Node {
        let mut children = self.0.children.clone();
        children[pos] = child;
        self.with_children(children)
    }

    pub fn with_meta(&self, meta: NodeMeta) -> Node {
        Node(Arc::new(NodeInner {
            kind: self.0.kind.clone(),
            children: self.0.children.clone(),
            meta,
            extract: self.0.extract.clone(),
        }))
    }

    pub fn with_tag(&self, tag: LevelTag) -> Node {
        let mut meta = self.0.meta.clone();
        meta.tag = Some(tag);
        self.with_meta(meta)
    }

    // -----------------------------
    // Typed accessors
    // -----------------------------

    pub fn field_name(&self) -> Option<&str> {
        match &self.0.kind {
            NodeKind::Field { name } => Some(name),
            _ => None,
        }
    }

    pub fn literal(&self) -> Option<&LiteralValue> {
        match &self.0.kind {
            NodeKind::Literal(value) => Some(value),
            _ => None,
        }
    }

    /// Function name of a `FuncCall` or `WindowFuncCall`.
    pub fn func_name(&self) -> Option<&str> {
        match &self.0.kind {
            NodeKind::FuncCall { name } | NodeKind::WindowFuncCall { name } => Some(name),
            _ => None,
        }
    }

    pub fn operator(&self) -> Option<&str> {
        match &self.0.kind {
            NodeKind::Unary { op } | NodeKind::Binary { op } | NodeKind::Ternary { op } => {
                Some(op)
            }
            _ => None,
        }
    }

    fn trailing_specifiers(&self) -> usize {
        match self.0.kind {
            NodeKind::FuncCall { .. } => 3,
            NodeKind::WindowFuncCall { .. } => 5,
            _ => 0,
        }
    }

    /// Positional arguments of a function call; empty for other nodes.
    pub fn func_args(&self) -> &[Node] {
        match self.0.kind {
            NodeKind::FuncCall { .. } | NodeKind::WindowFuncCall { .. } => {
                &self.0.children[..self.0.children.len() - self.trailing_specifiers()]
            }
            _ => &[],
        }
    }

    /// Position of the LOD specifier child.
    pub fn lod_pos(&self) -> Option<usize> {
        match self.0.kind {
            NodeKind::FuncCall { .. } | NodeKind::WindowFuncCall { .. } => {
                Some(self.0.children.len() - 3)
            }
            NodeKind::QueryFork { .. } => Some(2),
            _ => None,
        }
    }

    /// Position of the BEFORE FILTER BY child.
    pub fn bfb_pos(&self) -> Option<usize> {
        match self.0.kind {
            NodeKind::FuncCall { .. } | NodeKind::WindowFuncCall { .. } => {
                Some(self.0.children.len() - 1)
            }
            NodeKind::QueryFork { .. } => Some(3),
            _ => None,
        }
    }

    pub fn lod(&self) -> Option<&Node> {
        self.lod_pos().map(|pos| &self.0.children[pos])
    }

    pub fn ignore_dimensions(&self) -> Option<&Node> {
        match self.0.kind {
            NodeKind::FuncCall { .. } | NodeKind::WindowFuncCall { .. } => {
                Some(&self.0.children[self.0.children.len() - 2])
            }
            _ => None,
        }
    }

    pub fn before_filter_by(&self) -> Option<&Node> {
        self.bfb_pos().map(|pos| &self.0.children[pos])
    }

    /// Position of the window ordering child.
    pub fn ordering_pos(&self) -> Option<usize> {
        match self.0.kind {
            NodeKind::WindowFuncCall { .. } => Some(self.0.children.len() - 5),
            _ => None,
        }
    }

    pub fn ordering(&self) -> Option<&Node> {
        self.ordering_pos().map(|pos| &self.0.children[pos])
    }

    pub fn grouping_pos(&self) -> Option<usize> {
        match self.0.kind {
            NodeKind::WindowFuncCall { .. } => Some(self.0.children.len() - 4),
            _ => None,
        }
    }

    pub fn grouping(&self) -> Option<&Node> {
        self.grouping_pos().map(|pos| &self.0.children[pos])
    }

    pub fn lod_kind(&self) -> Option<LodKind> {
        match self.0.kind {
            NodeKind::Lod(kind) => Some(kind),
            _ => None,
        }
    }

    pub fn grouping_kind(&self) -> Option<WindowGroupingKind> {
        match self.0.kind {
            NodeKind::WindowGrouping(kind) => Some(kind),
            _ => None,
        }
    }

    /// Names listed by a `BeforeFilterBy` node, or by the BFB child of a
    /// function call / query fork.
    pub fn bfb_names(&self) -> Option<&BTreeSet<String>> {
        match &self.0.kind {
            NodeKind::BeforeFilterBy { field_names } => Some(field_names),
            _ => self.before_filter_by().and_then(|bfb| bfb.bfb_names()),
        }
    }

    pub fn join_type(&self) -> Option<ForkJoinType> {
        match self.0.kind {
            NodeKind::QueryFork { join_type } => Some(join_type),
            _ => None,
        }
    }

    /// `(joining, result_expr, lod, bfb, bfb_filter_mutations)` of a fork.
    pub fn fork_parts(&self) -> Option<(&Node, &Node, &Node, &Node, &Node)> {
        match self.0.kind {
            NodeKind::QueryFork { .. } => {
                let c = &self.0.children;
                Some((&c[0], &c[1], &c[2], &c[3], &c[4]))
            }
            _ => None,
        }
    }

    pub fn error_info(&self) -> Option<(&str, FormulaErrorCode)> {
        match &self.0.kind {
            NodeKind::Error { message, code } => Some((message, *code)),
            _ => None,
        }
    }

    /// Unwrap a `Formula` wrapper; returns `self` for other nodes.
    pub fn expr(&self) -> &Node {
        match self.0.kind {
            NodeKind::Formula => &self.0.children[0],
            _ => self,
        }
    }
}

/// Structural equality through extracts. Nodes without an extract are never
/// equal to anything, themselves included.
impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        match (self.extract(), other.extract()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({})", crate::explain::to_text(self))
    }
}

#[derive(Serialize)]
struct NodeRepr<'a> {
    kind: &'a NodeKind,
    children: &'a [Node],
    meta: &'a NodeMeta,
}

#[derive(Deserialize)]
struct OwnedNodeRepr {
    kind: NodeKind,
    #[serde(default)]
    children: Vec<Node>,
    #[serde(default)]
    meta: NodeMeta,
}

impl Serialize for Node {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        NodeRepr {
            kind: &self.0.kind,
            children: &self.0.children,
            meta: &self.0.meta,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let repr = OwnedNodeRepr::deserialize(deserializer)?;
        Node::try_new(repr.kind, repr.children, repr.meta).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shortcuts as n;

    #[test]
    fn extract_ignores_meta() {
        let a = n::func("sum", vec![n::field("x")]);
        let b = a.with_meta(NodeMeta {
            position: Some(Span { start: 0, end: 5 }),
            original_text: Some("SUM([x])".to_string()),
            tag: Some(LevelTag::default()),
        });
        assert_eq!(a, b);
        assert_eq!(a.complexity(), 5);
        assert!(!a.ptr_eq(&b));
    }

    #[test]
    fn nan_literal_has_no_extract() {
        let nan = n::lit_float(f64::NAN);
        assert!(nan.extract().is_none());
        assert_ne!(nan, nan.clone());
        let wrapped = n::binary("+", nan, n::lit_int(1));
        assert!(wrapped.extract().is_none());
        assert_eq!(n::lit_float(-0.0), n::lit_float(0.0));
        assert_ne!(n::lit_float(1.0), n::lit_int(1));
    }

    #[test]
    fn typed_accessors_follow_child_order() {
        let call = n::func_full(
            "sum",
            vec![n::field("x")],
            n::fixed(vec![n::field("a")]),
            vec![],
            &["f"],
        );
        assert_eq!(call.func_args().len(), 1);
        assert_eq!(call.lod().and_then(|l| l.lod_kind()), Some(LodKind::Fixed));
        assert!(call.bfb_names().expect("bfb").contains("f"));

        let win = n::window("rsum", vec![n::func("sum", vec![n::field("x")])]);
        assert_eq!(win.func_args().len(), 1);
        assert_eq!(win.ordering_pos(), Some(1));
        assert_eq!(win.grouping().and_then(|g| g.grouping_kind()), Some(WindowGroupingKind::Total));
    }

    #[test]
    #[should_panic(expected = "invalid Binary node")]
    fn arity_violation_panics() {
        Node::new(NodeKind::Binary { op: "+".to_string() }, vec![n::lit_int(1)]);
    }

    #[test]
    fn literal_validation() {
        assert!(LiteralValue::Date("2024-02-29".to_string()).validate().is_ok());
        assert!(LiteralValue::Date("2024-13-01".to_string()).validate().is_err());
        assert!(LiteralValue::Datetime("2024-01-01T10:20:30".to_string()).validate().is_ok());
        assert!(LiteralValue::Geopoint(91.0, 0.0).validate().is_err());
        assert!(LiteralValue::Array(vec![LiteralValue::Integer(1), LiteralValue::String("a".into())])
            .validate()
            .is_err());
        let bad = Node::try_new(
            NodeKind::Literal(LiteralValue::Uuid("nope".to_string())),
            vec![],
            NodeMeta::default(),
        );
        assert!(bad.is_err());
    }

    #[test]
    fn dates_respect_month_length() {
        assert!(is_valid_date("2024-02-29"));
        assert!(is_valid_date("2000-02-29"));
        assert!(!is_valid_date("2023-02-29"));
        assert!(!is_valid_date("1900-02-29"));
        assert!(!is_valid_date("2024-02-30"));
        assert!(!is_valid_date("2024-04-31"));
        assert!(is_valid_date("2024-12-31"));
        assert!(!is_valid_date("2024-00-10"));
    }

    #[test]
    fn non_ascii_datetime_is_rejected() {
        assert!(!is_valid_datetime("2024-01-0\u{e9} 12:00:00Z"));
        assert!(!is_valid_datetime("2024-01-01 12:0\u{e9}:00Z"));
        let literal = Node::try_new(
            NodeKind::Literal(LiteralValue::Datetime("2024-01-0\u{e9} 12:00:00Z".to_string())),
            vec![],
            NodeMeta::default(),
        );
        assert!(literal.is_err());
    }

    #[test]
    fn serde_roundtrip_preserves_structure() {
        let node = n::formula(n::binary(
            "+",
            n::func_full("sum", vec![n::field("x")], n::include(vec![n::field("a")]), vec![], &[]),
            n::lit_date("2024-01-01"),
        ));
        let json = serde_json::to_string(&node).expect("serialize");
        let back: Node = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, node);
    }
}
