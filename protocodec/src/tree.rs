//! Tree Finalizer: turns a [`crate::schema::Protocol`] plus the
//! caller's raw instance values into a flat, bit-positioned node list.
//!
//! Mirrors the teacher's "walk the schema once, build a flat analysis plan"
//! style (`analyzer.rs`'s single-pass stat accumulation), generalized here to
//! group expansion and absolute bit-position bookkeeping instead of
//! compression statistics.

use crate::error::{CodecError, Stage};
use crate::expr::builtins::NodeContext as ExprNodeContext;
use crate::expr::{self};
use crate::schema::{Endian, Group, Node, PaddingPosition, PaddingSpec, Protocol, ResolveStrategy, SchemaNode};
use crate::value::Value;
use indexmap::IndexMap;

/// One flattened, bit-positioned leaf or padding run.
#[derive(Debug, Clone)]
pub enum FinalEntry {
    Node(FinalNode),
    Padding(FinalPadding),
}

impl FinalEntry {
    pub fn path(&self) -> &str {
        match self {
            FinalEntry::Node(n) => &n.path,
            FinalEntry::Padding(p) => &p.path,
        }
    }

    pub fn start_bit(&self) -> u64 {
        match self {
            FinalEntry::Node(n) => n.start_bit,
            FinalEntry::Padding(p) => p.start_bit,
        }
    }

    pub fn length_bits(&self) -> u64 {
        match self {
            FinalEntry::Node(n) => n.length_bits,
            FinalEntry::Padding(p) => p.length_bits,
        }
    }

    pub fn end_bit(&self) -> u64 {
        self.start_bit() + self.length_bits() - 1
    }
}

#[derive(Debug, Clone)]
pub struct FinalNode {
    pub path: String,
    pub name: String,
    pub source: Node,
    pub start_bit: u64,
    pub length_bits: u64,
    /// `source.endian`, or the enclosing protocol's `endian_default` when the
    /// node leaves it unset.
    pub endian: Endian,
}

#[derive(Debug, Clone)]
pub struct FinalPadding {
    pub path: String,
    pub container_path: String,
    pub start_bit: u64,
    pub length_bits: u64,
    pub fill: String,
}

/// The result of finalization: a declaration-ordered flat list plus lookup
/// indices used by the dependency builder and derivation driver.
#[derive(Debug, Clone, Default)]
pub struct FinalTree {
    pub entries: Vec<FinalEntry>,
    /// path -> index into `entries`, for O(1) lookup during derivation.
    pub index: IndexMap<String, usize>,
    /// group path -> materialised element count, for `size(#g)`.
    pub group_counts: IndexMap<String, usize>,
    /// group path -> every entry path materialised by that group's clones, in
    /// declaration order. Used by the dependency builder to expand a
    /// `size(#g)` reference into edges onto the group's actual children
    /// instead of guessing from path string shape.
    pub group_members: IndexMap<String, Vec<String>>,
    pub total_bits: u64,
    /// The owning protocol's declared default, used by the derivation driver
    /// to resolve a node's effective endian when its own `endian` is `None`.
    pub endian_default: Endian,
}

impl FinalTree {
    pub fn node(&self, path: &str) -> Option<&FinalNode> {
        self.index.get(path).and_then(|&i| match &self.entries[i] {
            FinalEntry::Node(n) => Some(n),
            _ => None,
        })
    }

    pub fn declaration_index(&self, path: &str) -> Option<usize> {
        self.index.get(path).copied()
    }

    /// Every entry whose bit span falls fully inside `[start_bit, end_bit]`,
    /// in declaration order.
    pub fn entries_in_span(&self, start_bit: u64, end_bit: u64) -> Vec<&FinalEntry> {
        self.entries
            .iter()
            .filter(|e| e.start_bit() >= start_bit && e.end_bit() <= end_bit)
            .collect()
    }
}

/// Minimal node context used only during finalization, to evaluate group
/// element counts and dynamic-padding lengths. Restricted to raw,
/// caller-supplied instance values — no derived values exist yet at this
/// stage of the pipeline, so `bytesOf`/`crc16Of`/etc. are unavailable here.
struct FinalizeContext<'a> {
    raw_values: &'a IndexMap<String, Value>,
}

impl<'a> ExprNodeContext for FinalizeContext<'a> {
    fn resolve(&self, node_path: &str) -> Result<Value, CodecError> {
        self.raw_values
            .get(node_path)
            .cloned()
            .ok_or_else(|| CodecError::unknown_reference(Stage::Plan, "", node_path))
    }
    fn bytes_of(&self, _node_path: &str) -> Result<Vec<u8>, CodecError> {
        Err(CodecError::schema(
            Stage::Plan,
            "",
            "bytesOf/crc/hash builtins are unavailable in length/count expressions evaluated during tree finalization",
        ))
    }
    fn bit_length_of(&self, _node_path: &str) -> Result<u64, CodecError> {
        Err(CodecError::schema(
            Stage::Plan,
            "",
            "nodeBitLength is unavailable in length/count expressions evaluated during tree finalization",
        ))
    }
    fn bytes_between(&self, _from: &str, _to: &str) -> Result<Vec<u8>, CodecError> {
        Err(CodecError::schema(
            Stage::Plan,
            "",
            "range builtins are unavailable in length/count expressions evaluated during tree finalization",
        ))
    }
    fn group_size(&self, group_path: &str) -> Result<u64, CodecError> {
        self.raw_values
            .get(group_path)
            .and_then(Value::as_uint)
            .ok_or_else(|| CodecError::unknown_reference(Stage::Plan, "", group_path))
    }
}

struct Builder<'a> {
    raw_values: &'a IndexMap<String, Value>,
    entries: Vec<FinalEntry>,
    group_counts: IndexMap<String, usize>,
    group_members: IndexMap<String, Vec<String>>,
    bit_cursor: u64,
}

pub fn finalize(protocol: &Protocol, raw_values: &IndexMap<String, Value>) -> Result<FinalTree, CodecError> {
    let mut builder = Builder {
        raw_values,
        entries: Vec::new(),
        group_counts: IndexMap::new(),
        group_members: IndexMap::new(),
        bit_cursor: 0,
    };
    builder.walk_protocol(protocol, "", protocol.endian_default)?;

    let mut index = IndexMap::new();
    for (i, e) in builder.entries.iter().enumerate() {
        index.insert(e.path().to_string(), i);
    }

    log::debug!(
        "finalized '{}': {} entries, {} bits",
        protocol.id,
        index.len(),
        builder.bit_cursor
    );

    Ok(FinalTree {
        total_bits: builder.bit_cursor,
        entries: builder.entries,
        index,
        group_counts: builder.group_counts,
        group_members: builder.group_members,
        endian_default: protocol.endian_default,
    })
}

impl<'a> Builder<'a> {
    fn ctx(&self) -> FinalizeContext<'a> {
        FinalizeContext {
            raw_values: self.raw_values,
        }
    }

    fn walk_protocol(&mut self, protocol: &Protocol, prefix: &str, endian_default: Endian) -> Result<(), CodecError> {
        for (_section_name, nodes) in protocol.sections() {
            let mut ordered: Vec<&SchemaNode> = nodes.iter().collect();
            ordered.sort_by_key(|n| n.order());
            for (decl_idx, schema_node) in ordered.into_iter().enumerate() {
                let _ = decl_idx;
                self.walk_schema_node(schema_node, prefix, endian_default)?;
            }
        }
        Ok(())
    }

    fn walk_schema_node(&mut self, schema_node: &SchemaNode, prefix: &str, endian_default: Endian) -> Result<(), CodecError> {
        match schema_node {
            SchemaNode::Node(n) => self.walk_node(n, prefix, endian_default),
            SchemaNode::Group(g) => self.walk_group(g, prefix, endian_default),
            SchemaNode::Protocol(p) => self.walk_protocol(p, &qualify(prefix, &p.id), p.endian_default),
        }
    }

    fn walk_node(&mut self, node: &Node, prefix: &str, endian_default: Endian) -> Result<(), CodecError> {
        let path = qualify(prefix, &node.id);
        let start_bit = self.bit_cursor;
        let length_bits = node.length_bits as u64;
        self.bit_cursor += length_bits;
        self.entries.push(FinalEntry::Node(FinalNode {
            path: path.clone(),
            name: node.name.clone(),
            endian: node.endian.unwrap_or(endian_default),
            source: node.clone(),
            start_bit,
            length_bits,
        }));

        if let Some(padding) = &node.padding {
            self.apply_padding(&path, start_bit, padding)?;
        }
        Ok(())
    }

    fn walk_group(&mut self, group: &Group, prefix: &str, endian_default: Endian) -> Result<(), CodecError> {
        let group_path = qualify(prefix, &group.id);
        let count = self.resolve_group_count(group, &group_path)?;
        self.group_counts.insert(group_path.clone(), count);

        let group_start = self.bit_cursor;
        let entries_before = self.entries.len();
        for i in 1..=count {
            for clone in resolve_group_clone(group, i, endian_default) {
                self.walk_schema_node(&clone, prefix, endian_default)?;
            }
        }
        let members = self.entries[entries_before..].iter().map(|e| e.path().to_string()).collect();
        self.group_members.insert(group_path.clone(), members);

        if let Some(padding) = &group.padding {
            self.apply_padding(&group_path, group_start, padding)?;
        }
        Ok(())
    }

    fn resolve_group_count(&self, group: &Group, group_path: &str) -> Result<usize, CodecError> {
        if let Some(v) = self.raw_values.get(group_path) {
            if let Some(n) = v.as_uint() {
                return Ok(n as usize);
            }
        }
        if let Some(expr) = &group.length_expr {
            let v = expr::evaluate(expr, &self.ctx())?;
            let n = v.require_uint(Stage::Plan, group_path)?;
            return Ok(n as usize);
        }
        Err(CodecError::schema(
            Stage::Plan,
            group_path,
            "group has neither an instance-supplied element count nor a length_expr",
        ))
    }

    /// Packing always appends the padding run after the container's content
    /// regardless of `PaddingPosition`: true leading (`Begin`) padding would
    /// require retroactively shifting the content's already-assigned bit
    /// positions, which this flat single-pass layout does not do. `position`
    /// is recorded but, in the current packer, `Begin` and `End` behave
    /// identically (both trailing).
    fn apply_padding(&mut self, container_path: &str, container_start: u64, spec: &PaddingSpec) -> Result<(), CodecError> {
        let written_bits = self.bit_cursor - container_start;
        let (extra_bits, fill, at_begin) = match spec {
            PaddingSpec::FixedLength { target_bytes, fill } => {
                let target_bits = *target_bytes as u64 * 8;
                if target_bits < written_bits {
                    return Err(CodecError::schema(
                        Stage::Plan,
                        container_path,
                        format!("fixed_length target {target_bytes} bytes is smaller than written content"),
                    ));
                }
                (target_bits - written_bits, fill.clone(), false)
            }
            PaddingSpec::Alignment { boundary_bytes, fill } => {
                let boundary_bits = *boundary_bytes as u64 * 8;
                let rem = written_bits % boundary_bits;
                let extra = if rem == 0 { 0 } else { boundary_bits - rem };
                (extra, fill.clone(), false)
            }
            PaddingSpec::FillContainer { container_bits, fill, position } => {
                if *container_bits < written_bits {
                    return Err(CodecError::schema(
                        Stage::Plan,
                        container_path,
                        format!("fill_container target {container_bits} bits is smaller than written content"),
                    ));
                }
                (
                    *container_bits - written_bits,
                    fill.clone(),
                    matches!(position, PaddingPosition::Begin),
                )
            }
            PaddingSpec::Dynamic { length_expr, fill, condition_expr } => {
                if let Some(cond) = condition_expr {
                    let v = expr::evaluate(cond, &self.ctx())?;
                    if !v.as_bool().unwrap_or(false) {
                        return Ok(());
                    }
                }
                let v = expr::evaluate(length_expr, &self.ctx())?;
                (v.require_uint(Stage::Plan, container_path)?, fill.clone(), false)
            }
            PaddingSpec::FillRemaining { .. } => {
                return Err(CodecError::schema(
                    Stage::Plan,
                    container_path,
                    "fill_remaining padding requires an enclosing declared length, which this container does not have",
                ));
            }
        };

        if extra_bits == 0 {
            return Ok(());
        }

        let start_bit = if at_begin { container_start } else { self.bit_cursor };
        self.bit_cursor += extra_bits;
        self.entries.push(FinalEntry::Padding(FinalPadding {
            path: format!("{container_path}::padding"),
            container_path: container_path.to_string(),
            start_bit,
            length_bits: extra_bits,
            fill,
        }));
        Ok(())
    }
}

/// Finalizes a protocol against a byte stream instead of caller-supplied
/// values: walks the schema exactly like [`finalize`], but each node's value
/// comes from reading the stream rather than a lookup, and that decoded
/// value becomes immediately available to later group `length_expr`/padding
/// `condition_expr` evaluation — mirroring the stream-driven way the teacher
/// walks a buffer once to produce both positions and values in one pass.
pub fn finalize_for_decode(protocol: &Protocol, data: &[u8]) -> Result<(FinalTree, IndexMap<String, Value>), CodecError> {
    let mut builder = DecodeBuilder {
        entries: Vec::new(),
        group_counts: IndexMap::new(),
        group_members: IndexMap::new(),
        decoded: IndexMap::new(),
        source: crate::bitcodec::BitSource::new(data),
    };
    builder.walk_protocol(protocol, "", protocol.endian_default)?;

    let mut index = IndexMap::new();
    for (i, e) in builder.entries.iter().enumerate() {
        index.insert(e.path().to_string(), i);
    }
    let total_bits = builder.source.position();
    log::debug!(
        "decoded '{}' from {} bytes: {} entries, {} bits consumed",
        protocol.id,
        data.len(),
        index.len(),
        total_bits
    );

    Ok((
        FinalTree {
            total_bits,
            entries: builder.entries,
            index,
            group_counts: builder.group_counts,
            group_members: builder.group_members,
            endian_default: protocol.endian_default,
        },
        builder.decoded,
    ))
}

struct DecodeBuilder<'a> {
    entries: Vec<FinalEntry>,
    group_counts: IndexMap<String, usize>,
    group_members: IndexMap<String, Vec<String>>,
    decoded: IndexMap<String, Value>,
    source: crate::bitcodec::BitSource<'a>,
}

impl<'a> DecodeBuilder<'a> {
    fn ctx(&self) -> FinalizeContext<'_> {
        FinalizeContext {
            raw_values: &self.decoded,
        }
    }

    fn walk_protocol(&mut self, protocol: &Protocol, prefix: &str, endian_default: Endian) -> Result<(), CodecError> {
        for (_section_name, nodes) in protocol.sections() {
            let mut ordered: Vec<&SchemaNode> = nodes.iter().collect();
            ordered.sort_by_key(|n| n.order());
            for schema_node in ordered {
                self.walk_schema_node(schema_node, prefix, endian_default)?;
            }
        }
        Ok(())
    }

    fn walk_schema_node(&mut self, schema_node: &SchemaNode, prefix: &str, endian_default: Endian) -> Result<(), CodecError> {
        match schema_node {
            SchemaNode::Node(n) => self.walk_node(n, prefix, endian_default),
            SchemaNode::Group(g) => self.walk_group(g, prefix, endian_default),
            SchemaNode::Protocol(p) => self.walk_protocol(p, &qualify(prefix, &p.id), p.endian_default),
        }
    }

    fn walk_node(&mut self, node: &Node, prefix: &str, endian_default: Endian) -> Result<(), CodecError> {
        let path = qualify(prefix, &node.id);
        let start_bit = self.source.position();
        let endian = node.endian.unwrap_or(endian_default);
        let length_bits = node.length_bits;
        let value = self.source.read_value(&node.value_type, endian, length_bits, &path)?;
        self.decoded.insert(path.clone(), value);
        self.entries.push(FinalEntry::Node(FinalNode {
            path: path.clone(),
            name: node.name.clone(),
            endian,
            source: node.clone(),
            start_bit,
            length_bits: length_bits as u64,
        }));

        if let Some(padding) = &node.padding {
            self.apply_padding(&path, start_bit, padding)?;
        }
        Ok(())
    }

    fn walk_group(&mut self, group: &Group, prefix: &str, endian_default: Endian) -> Result<(), CodecError> {
        let group_path = qualify(prefix, &group.id);
        let count = self.resolve_group_count(group, &group_path)?;
        self.group_counts.insert(group_path.clone(), count);

        let group_start = self.source.position();
        let entries_before = self.entries.len();
        for i in 1..=count {
            for clone in resolve_group_clone(group, i, endian_default) {
                self.walk_schema_node(&clone, prefix, endian_default)?;
            }
        }
        let members = self.entries[entries_before..].iter().map(|e| e.path().to_string()).collect();
        self.group_members.insert(group_path.clone(), members);

        if let Some(padding) = &group.padding {
            self.apply_padding(&group_path, group_start, padding)?;
        }
        Ok(())
    }

    fn resolve_group_count(&self, group: &Group, group_path: &str) -> Result<usize, CodecError> {
        let expr_src = group.length_expr.as_ref().ok_or_else(|| {
            CodecError::schema(
                Stage::Plan,
                group_path,
                "group has no length_expr, so its element count cannot be recovered while decoding",
            )
        })?;
        let v = expr::evaluate(expr_src, &self.ctx())?;
        let n = v.require_uint(Stage::Plan, group_path)?;
        Ok(n as usize)
    }

    /// Skips exactly as many bits as the matching encode-side
    /// [`Builder::apply_padding`] would have written. `PaddingPosition` is not
    /// distinguished here: both `Begin` and `End` are packed as a trailing
    /// run in this flat layout (see that method's doc comment), so reading
    /// back a trailing run after the content is always the correct inverse.
    fn apply_padding(&mut self, container_path: &str, container_start: u64, spec: &PaddingSpec) -> Result<(), CodecError> {
        let written_bits = self.source.position() - container_start;
        let extra_bits = match spec {
            PaddingSpec::FixedLength { target_bytes, .. } => {
                let target_bits = *target_bytes as u64 * 8;
                if target_bits < written_bits {
                    return Err(CodecError::schema(
                        Stage::Plan,
                        container_path,
                        format!("fixed_length target {target_bytes} bytes is smaller than content already read"),
                    ));
                }
                target_bits - written_bits
            }
            PaddingSpec::Alignment { boundary_bytes, .. } => {
                let boundary_bits = *boundary_bytes as u64 * 8;
                let rem = written_bits % boundary_bits;
                if rem == 0 {
                    0
                } else {
                    boundary_bits - rem
                }
            }
            PaddingSpec::FillContainer { container_bits, .. } => {
                if (*container_bits as u64) < written_bits {
                    return Err(CodecError::schema(
                        Stage::Plan,
                        container_path,
                        format!("fill_container target {container_bits} bits is smaller than content already read"),
                    ));
                }
                *container_bits as u64 - written_bits
            }
            PaddingSpec::Dynamic { length_expr, condition_expr, .. } => {
                if let Some(cond) = condition_expr {
                    let v = expr::evaluate(cond, &self.ctx())?;
                    if !v.as_bool().unwrap_or(false) {
                        return Ok(());
                    }
                }
                let v = expr::evaluate(length_expr, &self.ctx())?;
                v.require_uint(Stage::Plan, container_path)?
            }
            PaddingSpec::FillRemaining { .. } => {
                return Err(CodecError::schema(
                    Stage::Plan,
                    container_path,
                    "fill_remaining padding requires an enclosing declared length, which this container does not have",
                ));
            }
        };

        if extra_bits == 0 {
            return Ok(());
        }
        let start_bit = self.source.position();
        self.source.skip_bits(extra_bits, container_path)?;
        self.entries.push(FinalEntry::Padding(FinalPadding {
            path: format!("{container_path}::padding"),
            container_path: container_path.to_string(),
            start_bit,
            length_bits: extra_bits,
            fill: padding_fill(spec),
        }));
        Ok(())
    }
}

fn padding_fill(spec: &PaddingSpec) -> String {
    match spec {
        PaddingSpec::FixedLength { fill, .. }
        | PaddingSpec::Alignment { fill, .. }
        | PaddingSpec::FillContainer { fill, .. }
        | PaddingSpec::Dynamic { fill, .. }
        | PaddingSpec::FillRemaining { fill } => fill.clone(),
    }
}

fn qualify(prefix: &str, id: &str) -> String {
    if prefix.is_empty() {
        id.to_string()
    } else {
        format!("{prefix}.{id}")
    }
}

/// Produces the schema node(s) to walk for clone `index` of `group`, shaped
/// by its `resolve_strategy`:
///
/// - `Flatten` — every field of the clone lives directly in the surrounding
///   flat namespace, each carrying the clone's own suffix (`id_1`, `value_1`)
///   and no container segment, even when the child template is itself a
///   multi-field [`Protocol`] — its fields are unwrapped to the top level.
/// - `GroupContainer` — the clone is always addressed under one suffixed
///   container id (`item_1.id`, `item_1.value`); a bare [`Node`] template is
///   wrapped in a synthetic single-field container to get that addressing.
/// - `Mixed` — whichever of the above matches the child template's own
///   shape: a `Node` template flattens, a `Protocol` template containerizes.
///   This is today's adaptive default and what every other strategy is
///   judged against.
fn resolve_group_clone(group: &Group, index: usize, endian_default: Endian) -> Vec<SchemaNode> {
    let suffix = group.id_suffix_pattern.replace("%d", &index.to_string());
    match group.resolve_strategy {
        ResolveStrategy::Flatten => flatten_clone(&group.child_template, &suffix),
        ResolveStrategy::GroupContainer => vec![containerize_clone(group, &group.child_template, &suffix, endian_default)],
        ResolveStrategy::Mixed => vec![rewrite_node_suffix(&group.child_template, &suffix, true)],
    }
}

/// `Flatten`: a [`Protocol`] template's fields are unwrapped directly into
/// the parent namespace, each suffixed on its own id rather than nested under
/// a container path. Anything else (a bare `Node`, or a nested `Group`)
/// already addresses flatly once its own id is suffixed, so it is returned
/// as a single-element clone unchanged in shape.
fn flatten_clone(template: &SchemaNode, suffix: &str) -> Vec<SchemaNode> {
    match template {
        SchemaNode::Protocol(p) => {
            let mut out = Vec::new();
            for section in [&p.header, &p.body, &p.tail] {
                for child in section {
                    out.push(rewrite_node_suffix(child, suffix, true));
                }
            }
            out
        }
        other => vec![rewrite_node_suffix(other, suffix, true)],
    }
}

/// `GroupContainer`: a [`Protocol`] template already containerizes once its
/// own id is suffixed (the default `rewrite_node_suffix` behaviour), so it is
/// returned as-is. A bare `Node`/`Group` template has no container id of its
/// own to carry the suffix, so one is synthesized from `group.id` — a
/// single-field `Protocol` wrapper — giving the clone the same
/// `item_1.field` addressing a multi-field template would get.
fn containerize_clone(group: &Group, template: &SchemaNode, suffix: &str, endian_default: Endian) -> SchemaNode {
    match template {
        SchemaNode::Protocol(_) => rewrite_node_suffix(template, suffix, true),
        other => {
            let mut wrapper = Protocol {
                id: format!("{}{}", group.id, suffix),
                endian_default,
                ..Protocol::default()
            };
            wrapper.body.push(rewrite_node_suffix(other, suffix, false));
            SchemaNode::Protocol(Box::new(wrapper))
        }
    }
}

/// Clones `node`, appending `suffix` to internal references (`fwd_expr`/
/// `bwd_expr`/`conditional_deps[].condition_node`) throughout, and — only
/// when `rename_self` is set — to the node's own id. A `Protocol` child
/// template's own container id is a clone root and always gets renamed, but
/// its *descendants* keep their bare ids: they're already disambiguated by
/// being dot-qualified under the renamed container path (`item_1.value`, not
/// `item_1.value_1`), and a template-internal reference like `#item.value`
/// needs that bare `value` to still resolve after the container's `item`
/// component picks up the suffix. A nested `Group`'s own id is still a clone
/// root relative to its enclosing template, so it keeps renaming itself.
fn rewrite_node_suffix(node: &SchemaNode, suffix: &str, rename_self: bool) -> SchemaNode {
    match node {
        SchemaNode::Node(n) => {
            let mut n = n.clone();
            if rename_self {
                n.id = format!("{}{}", n.id, suffix);
            }
            n.fwd_expr = n.fwd_expr.map(|e| rewrite_expr_suffix(&e, suffix));
            n.bwd_expr = n.bwd_expr.map(|e| rewrite_expr_suffix(&e, suffix));
            for dep in &mut n.conditional_deps {
                dep.condition_node = suffix_reference(&dep.condition_node, suffix);
            }
            SchemaNode::Node(n)
        }
        SchemaNode::Group(g) => {
            let mut g = g.clone();
            if rename_self {
                g.id = format!("{}{}", g.id, suffix);
            }
            g.child_template = Box::new(rewrite_node_suffix(&g.child_template, suffix, true));
            g.length_expr = g.length_expr.clone().map(|e| rewrite_expr_suffix(&e, suffix));
            SchemaNode::Group(g)
        }
        SchemaNode::Protocol(p) => {
            let mut p = (**p).clone();
            if rename_self {
                p.id = format!("{}{}", p.id, suffix);
            }
            for section in [&mut p.header, &mut p.body, &mut p.tail] {
                for child in section.iter_mut() {
                    *child = rewrite_node_suffix(child, suffix, false);
                }
            }
            SchemaNode::Protocol(Box::new(p))
        }
    }
}

/// Appends `suffix` right after the leading identifier component of a bare
/// reference string, leaving any `.field` continuation untouched — the same
/// splitting [`rewrite_expr_suffix`] applies inside expression text, shared
/// here for `conditional_deps[].condition_node`, which carries a reference
/// with no surrounding expression syntax to drive that split.
fn suffix_reference(reference: &str, suffix: &str) -> String {
    let split_at = reference
        .find(|c: char| !(c.is_alphanumeric() || c == '_'))
        .unwrap_or(reference.len());
    format!("{}{}{}", &reference[..split_at], suffix, &reference[split_at..])
}

/// Rewrites bare `#id` occurrences (already reference-shaped, pre-sentinel)
/// inside a raw expression source string so they carry the clone's suffix.
/// Only touches identifiers that look like plain ids (no `:` qualifier,
/// which would address a sibling protocol rather than a template-local node).
fn rewrite_expr_suffix(expr_src: &str, suffix: &str) -> String {
    let mut out = String::with_capacity(expr_src.len());
    let mut chars = expr_src.char_indices().peekable();
    let mut in_string = false;
    while let Some((_, c)) = chars.next() {
        if in_string {
            out.push(c);
            if c == '\'' {
                in_string = false;
            }
            continue;
        }
        match c {
            '\'' => {
                in_string = true;
                out.push(c);
            }
            '#' => {
                let mut ident = String::new();
                while let Some(&(_, nc)) = chars.peek() {
                    if nc.is_alphanumeric() || nc == '_' {
                        ident.push(nc);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push('#');
                out.push_str(&ident);
                out.push_str(suffix);
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Endian, ValueType};

    fn leaf(id: &str, order: i64, width: u32) -> SchemaNode {
        SchemaNode::Node(Node::new(id, ValueType::Uint { width }, width as u32).with_order(order))
    }

    #[test]
    fn assigns_sequential_bit_positions() {
        let mut proto = Protocol::default();
        proto.id = "p".into();
        proto.endian_default = Endian::Big;
        proto.body.push(leaf("a", 0, 8));
        proto.body.push(leaf("b", 1, 16));
        let tree = finalize(&proto, &IndexMap::new()).unwrap();
        let a = tree.node("a").unwrap();
        let b = tree.node("b").unwrap();
        assert_eq!(a.start_bit, 0);
        assert_eq!(a.length_bits, 8);
        assert_eq!(b.start_bit, 8);
        assert_eq!(b.length_bits, 16);
        assert_eq!(tree.total_bits, 24);
    }

    #[test]
    fn orders_by_declared_order_value() {
        let mut proto = Protocol::default();
        proto.id = "p".into();
        proto.body.push(leaf("second", 5, 8));
        proto.body.push(leaf("first", 1, 8));
        let tree = finalize(&proto, &IndexMap::new()).unwrap();
        assert_eq!(tree.entries[0].path(), "first");
        assert_eq!(tree.entries[1].path(), "second");
    }

    #[test]
    fn group_expansion_uses_instance_supplied_count() {
        let mut proto = Protocol::default();
        proto.id = "p".into();
        let group = Group {
            id: "item".into(),
            name: String::new(),
            child_template: Box::new(leaf("val", 0, 8)),
            id_suffix_pattern: "_%d".into(),
            name_suffix_pattern: "[%d]".into(),
            resolve_strategy: crate::schema::ResolveStrategy::Flatten,
            length_expr: None,
            order: 0,
            padding: None,
        };
        proto.body.push(SchemaNode::Group(group));

        let mut raw = IndexMap::new();
        raw.insert("item".to_string(), Value::UInt(3));
        let tree = finalize(&proto, &raw).unwrap();
        assert_eq!(tree.group_counts.get("item"), Some(&3));
        assert!(tree.node("val_1").is_some());
        assert!(tree.node("val_2").is_some());
        assert!(tree.node("val_3").is_some());
    }

    #[test]
    fn missing_group_count_is_a_schema_error() {
        let mut proto = Protocol::default();
        proto.id = "p".into();
        let group = Group {
            id: "item".into(),
            name: String::new(),
            child_template: Box::new(leaf("val", 0, 8)),
            id_suffix_pattern: "_%d".into(),
            name_suffix_pattern: "[%d]".into(),
            resolve_strategy: crate::schema::ResolveStrategy::Flatten,
            length_expr: None,
            order: 0,
            padding: None,
        };
        proto.body.push(SchemaNode::Group(group));
        assert!(finalize(&proto, &IndexMap::new()).is_err());
    }

    fn multi_field_item_group(resolve_strategy: ResolveStrategy) -> Group {
        let mut item = Protocol::default();
        item.id = "item".into();
        item.body.push(leaf("id", 0, 8));
        item.body.push(leaf("value", 1, 8));
        Group {
            id: "item".into(),
            name: String::new(),
            child_template: Box::new(SchemaNode::Protocol(Box::new(item))),
            id_suffix_pattern: "_%d".into(),
            name_suffix_pattern: "[%d]".into(),
            resolve_strategy,
            length_expr: None,
            order: 0,
            padding: None,
        }
    }

    #[test]
    fn flatten_strategy_unwraps_a_protocol_template_to_bare_suffixed_ids() {
        let mut proto = Protocol::default();
        proto.id = "p".into();
        proto.body.push(SchemaNode::Group(multi_field_item_group(ResolveStrategy::Flatten)));

        let mut raw = IndexMap::new();
        raw.insert("item".to_string(), Value::UInt(2));
        let tree = finalize(&proto, &raw).unwrap();
        assert!(tree.node("id_1").is_some());
        assert!(tree.node("value_1").is_some());
        assert!(tree.node("id_2").is_some());
        assert!(tree.node("value_2").is_some());
        assert!(tree.node("item_1.id").is_none());
    }

    #[test]
    fn group_container_strategy_always_namespaces_under_the_container_id() {
        let mut proto = Protocol::default();
        proto.id = "p".into();
        proto.body.push(SchemaNode::Group(multi_field_item_group(ResolveStrategy::GroupContainer)));

        let mut raw = IndexMap::new();
        raw.insert("item".to_string(), Value::UInt(1));
        let tree = finalize(&proto, &raw).unwrap();
        assert!(tree.node("item_1.id").is_some());
        assert!(tree.node("item_1.value").is_some());
        assert!(tree.node("id_1").is_none());
    }

    #[test]
    fn group_container_strategy_wraps_a_bare_node_template_in_a_synthetic_container() {
        let mut proto = Protocol::default();
        proto.id = "p".into();
        let group = Group {
            id: "item".into(),
            name: String::new(),
            child_template: Box::new(leaf("val", 0, 8)),
            id_suffix_pattern: "_%d".into(),
            name_suffix_pattern: "[%d]".into(),
            resolve_strategy: ResolveStrategy::GroupContainer,
            length_expr: None,
            order: 0,
            padding: None,
        };
        proto.body.push(SchemaNode::Group(group));

        let mut raw = IndexMap::new();
        raw.insert("item".to_string(), Value::UInt(1));
        let tree = finalize(&proto, &raw).unwrap();
        assert!(tree.node("item_1.val").is_some());
        assert!(tree.node("val_1").is_none());
    }

    #[test]
    fn mixed_strategy_containerizes_protocol_templates_and_flattens_node_templates() {
        let mut proto = Protocol::default();
        proto.id = "p".into();
        proto.body.push(SchemaNode::Group(multi_field_item_group(ResolveStrategy::Mixed)));
        let mut raw = IndexMap::new();
        raw.insert("item".to_string(), Value::UInt(1));
        let tree = finalize(&proto, &raw).unwrap();
        assert!(tree.node("item_1.id").is_some());
        assert!(tree.node("item_1.value").is_some());
    }

    #[test]
    fn group_members_records_every_materialised_entry_for_a_group() {
        let mut proto = Protocol::default();
        proto.id = "p".into();
        let group = Group {
            id: "item".into(),
            name: String::new(),
            child_template: Box::new(leaf("val", 0, 8)),
            id_suffix_pattern: "_%d".into(),
            name_suffix_pattern: "[%d]".into(),
            resolve_strategy: ResolveStrategy::Flatten,
            length_expr: None,
            order: 0,
            padding: None,
        };
        proto.body.push(SchemaNode::Group(group));
        let mut raw = IndexMap::new();
        raw.insert("item".to_string(), Value::UInt(2));
        let tree = finalize(&proto, &raw).unwrap();
        assert_eq!(
            tree.group_members.get("item").unwrap(),
            &vec!["val_1".to_string(), "val_2".to_string()]
        );
    }

    #[test]
    fn alignment_padding_extends_to_boundary() {
        let mut proto = Protocol::default();
        proto.id = "p".into();
        let mut n = Node::new("a", crate::schema::ValueType::Uint { width: 8 }, 8);
        n.padding = Some(PaddingSpec::Alignment {
            boundary_bytes: 4,
            fill: "0x00".into(),
        });
        proto.body.push(SchemaNode::Node(n));
        let tree = finalize(&proto, &IndexMap::new()).unwrap();
        assert_eq!(tree.total_bits, 32);
    }
}
