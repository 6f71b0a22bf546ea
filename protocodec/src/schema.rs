//! # Protocol Schema
//!
//! Defines the declarative schema for a binary protocol: a tree of typed
//! fields with per-field bit lengths, endianness, value encodings,
//! expression-driven derived values, conditional enablement, repetition
//! groups, and padding rules.
//!
//! Schemas are ordinary `serde`-deserializable Rust values — the crate ships a
//! YAML ingress path (`Schema::from_yaml` / `Schema::load_from_file`) as
//! convenience tooling, in the same shape as the teacher's own
//! `Schema::from_yaml`/`load_from_file`. Parsing any particular upstream
//! annotation or XML format that produces this shape is out of scope; the
//! crate only needs the shape itself.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::CodecError;

/// `Schema := Protocol`. The root of a schema is simply a
/// protocol with no enclosing parent.
pub type Schema = Protocol;

/// A named ordered tree with exactly one root and three distinguished child
/// sections. Protocols may nest: a body entry may itself be a `Protocol`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Protocol {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub endian_default: Endian,
    #[serde(default)]
    pub header: Vec<SchemaNode>,
    #[serde(default)]
    pub body: Vec<SchemaNode>,
    #[serde(default)]
    pub tail: Vec<SchemaNode>,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// A child of a protocol section: either a leaf field, a repetition group, or
/// a nested protocol ("Protocols may nest: a Body may itself be a
/// Protocol").
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[non_exhaustive]
pub enum SchemaNode {
    Node(Node),
    Group(Group),
    Protocol(Box<Protocol>),
}

impl SchemaNode {
    pub fn id(&self) -> &str {
        match self {
            SchemaNode::Node(n) => &n.id,
            SchemaNode::Group(g) => &g.id,
            SchemaNode::Protocol(p) => &p.id,
        }
    }

    pub fn order(&self) -> i64 {
        match self {
            SchemaNode::Node(n) => n.order,
            SchemaNode::Group(g) => g.order,
            SchemaNode::Protocol(_) => 0,
        }
    }
}

/// Big- or little-endian byte order. Applies to multi-byte numeric fields;
/// sub-byte fields are always MSB-first regardless of this setting
/// §9 Open Question on BIT endian semantics).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Endian {
    #[default]
    Big,
    Little,
}

/// What a node's declared-but-disabled bit range does to the encoded stream
/// (see DESIGN.md for the resolved default).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnDisable {
    #[default]
    Reserve,
    Collapse,
}

/// Primitive value encodings a leaf `Node` may declare.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValueType {
    Uint { width: u32 },
    Int { width: u32 },
    Hex,
    String {
        #[serde(default = "default_charset")]
        charset: String,
    },
    Float32,
    Float64,
    Bit,
    Bcd,
    Boolean,
}

fn default_charset() -> String {
    "utf-8".to_string()
}

impl ValueType {
    /// Whether this type's bit width may be determined only at runtime (by a
    /// forward expression rather than a static field width).
    pub fn is_variable_length(&self) -> bool {
        matches!(self, ValueType::String { .. } | ValueType::Hex)
    }
}

/// One entry of a `range` enumeration table.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RangeEntry {
    pub encoded: String,
    pub description: String,
}

/// Action taken by a matched (or default) conditional-dependency branch.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConditionalAction {
    Enable,
    Disable,
    SetDefault { value: String },
    Clear,
}

/// One `(condition_node_id, predicate_expr, then_action, else_action,
/// priority)` tuple. Ordered lists of these are evaluated in
/// priority order, highest first; the first match wins.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConditionalDep {
    pub condition_node: String,
    pub predicate: String,
    #[serde(default = "default_then")]
    pub then_action: ConditionalAction,
    #[serde(default = "default_else")]
    pub else_action: ConditionalAction,
    #[serde(default)]
    pub priority: i32,
}

fn default_then() -> ConditionalAction {
    ConditionalAction::Enable
}

fn default_else() -> ConditionalAction {
    ConditionalAction::Disable
}

/// Where a [`PaddingSpec`] is applied relative to its parent's children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PaddingPosition {
    #[default]
    End,
    Begin,
}

/// A padding rule attached to a structural node.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PaddingSpec {
    FixedLength {
        target_bytes: u32,
        #[serde(default = "default_fill")]
        fill: String,
    },
    Alignment {
        boundary_bytes: u32,
        #[serde(default = "default_fill")]
        fill: String,
    },
    FillContainer {
        container_bits: u32,
        #[serde(default = "default_fill")]
        fill: String,
        #[serde(default)]
        position: PaddingPosition,
    },
    Dynamic {
        length_expr: String,
        #[serde(default = "default_fill")]
        fill: String,
        #[serde(default)]
        condition_expr: Option<String>,
    },
    FillRemaining {
        #[serde(default = "default_fill")]
        fill: String,
    },
}

fn default_fill() -> String {
    "0x00".to_string()
}

/// A leaf field.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Node {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Static bit length; ignored (but still deserialized, for schema
    /// round-tripping) when `value_type` is variable-length and `fwd_expr`
    /// derives the runtime length.
    #[serde(default)]
    pub length_bits: u32,
    pub value_type: ValueType,
    #[serde(default)]
    pub endian: Option<Endian>,
    #[serde(default)]
    pub value: Option<crate::value::Value>,
    #[serde(default)]
    pub fwd_expr: Option<String>,
    #[serde(default)]
    pub bwd_expr: Option<String>,
    #[serde(default)]
    pub range: Vec<RangeEntry>,
    #[serde(default)]
    pub conditional_deps: Vec<ConditionalDep>,
    #[serde(default)]
    pub padding: Option<PaddingSpec>,
    #[serde(default)]
    pub order: i64,
    #[serde(default)]
    pub on_disable: OnDisable,
}

impl Node {
    pub fn new(id: impl Into<String>, value_type: ValueType, length_bits: u32) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            length_bits,
            value_type,
            endian: None,
            value: None,
            fwd_expr: None,
            bwd_expr: None,
            range: Vec::new(),
            conditional_deps: Vec::new(),
            padding: None,
            order: 0,
            on_disable: OnDisable::default(),
        }
    }

    pub fn with_order(mut self, order: i64) -> Self {
        self.order = order;
        self
    }
}

/// How a group's materialised clones are laid out relative to the
/// surrounding tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResolveStrategy {
    #[default]
    Flatten,
    GroupContainer,
    Mixed,
}

/// A container node whose children repeat.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Group {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub child_template: Box<SchemaNode>,
    #[serde(default = "default_id_suffix")]
    pub id_suffix_pattern: String,
    #[serde(default = "default_name_suffix")]
    pub name_suffix_pattern: String,
    #[serde(default)]
    pub resolve_strategy: ResolveStrategy,
    #[serde(default)]
    pub length_expr: Option<String>,
    #[serde(default)]
    pub order: i64,
    #[serde(default)]
    pub padding: Option<PaddingSpec>,
}

fn default_id_suffix() -> String {
    "_%d".to_string()
}

fn default_name_suffix() -> String {
    "[%d]".to_string()
}

impl Protocol {
    pub fn from_yaml(content: &str) -> Result<Self, CodecError> {
        let schema: Protocol = serde_yaml::from_str(content)?;
        Ok(schema)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, CodecError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Iterates the three sections in declaration order (header, body, tail),
    /// the order the tree finalizer must walk them in.
    pub fn sections(&self) -> [(&'static str, &[SchemaNode]); 3] {
        [
            ("header", &self.header),
            ("body", &self.body),
            ("tail", &self.tail),
        ]
    }
}

/// Instance-side collection length for a group, keyed by group id (the
/// "collection length from instance" precedence rule).
pub type GroupCounts = IndexMap<String, usize>;
