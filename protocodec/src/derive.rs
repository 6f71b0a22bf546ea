//! Derivation Driver: walks a [`FinalTree`] in dependency order,
//! resolving every node's runtime value — from an explicit instance value, a
//! `fwd_expr`/`bwd_expr`, or a default — and applying `conditional_deps` to
//! enable, disable, default, or clear nodes along the way.
//!
//! Generalizes the teacher's single-pass "walk the schema, accumulate a
//! result per field" shape (`analyzer.rs`) to a graph-ordered walk with a
//! live value map standing in for the analyzer's running statistics.

use crate::bitcodec::{self, BitSink};
use crate::depgraph::{build_graph, topo_order};
use crate::error::{CodecError, Stage};
use crate::expr::{self, NodeContext};
use crate::schema::{ConditionalAction, Node, OnDisable, Protocol};
use crate::tree::{FinalEntry, FinalNode, FinalTree};
use crate::value::Value;
use indexmap::IndexMap;

/// Direction the derivation driver resolves expressions and conditional
/// actions for. Forward (`fwd_expr`) derives the value that gets encoded;
/// backward (`bwd_expr`) derives a display/decoded-side value once a raw
/// decode has produced one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encode,
    Decode,
}

/// Per-node derivation outcome: whether it's enabled, and (if so) its
/// resolved value.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub enabled: bool,
    pub value: Option<Value>,
}

/// Everything the derivation driver produces for one pass: every node's
/// resolved value/enablement, keyed by path.
pub type DerivedValues = IndexMap<String, Resolved>;

pub(crate) struct DeriveContext<'a> {
    pub(crate) tree: &'a FinalTree,
    pub(crate) resolved: &'a IndexMap<String, Resolved>,
}

impl NodeContext for DeriveContext<'_> {
    fn resolve(&self, node_path: &str) -> Result<Value, CodecError> {
        match self.resolved.get(node_path) {
            Some(Resolved { enabled: true, value: Some(v) }) => Ok(v.clone()),
            Some(Resolved { enabled: false, .. }) => Ok(Value::Null),
            _ => Err(CodecError::unknown_reference(Stage::Derive, "", node_path)),
        }
    }

    fn bytes_of(&self, node_path: &str) -> Result<Vec<u8>, CodecError> {
        let node = self
            .tree
            .node(node_path)
            .ok_or_else(|| CodecError::unknown_reference(Stage::Derive, "", node_path))?;
        let value = self.resolve(node_path)?;
        serialize_node(node, &value)
    }

    fn bit_length_of(&self, node_path: &str) -> Result<u64, CodecError> {
        let node = self
            .tree
            .node(node_path)
            .ok_or_else(|| CodecError::unknown_reference(Stage::Derive, "", node_path))?;
        Ok(node.length_bits)
    }

    fn bytes_between(&self, from: &str, to: &str) -> Result<Vec<u8>, CodecError> {
        let a = self
            .tree
            .node(from)
            .ok_or_else(|| CodecError::unknown_reference(Stage::Derive, "", from))?;
        let b = self
            .tree
            .node(to)
            .ok_or_else(|| CodecError::unknown_reference(Stage::Derive, "", to))?;
        if a.start_bit > b.start_bit {
            return Err(CodecError::RangeOrder {
                stage: Stage::Derive,
                node_path: String::new(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        let mut out = Vec::new();
        for entry in self.tree.entries_in_span(a.start_bit, b.end_bit()) {
            match entry {
                FinalEntry::Node(n) => {
                    let value = self.resolve(&n.path)?;
                    out.extend(serialize_node(n, &value)?);
                }
                FinalEntry::Padding(p) => out.extend(fill_bytes(&p.fill, p.length_bits, self)?),
            }
        }
        Ok(out)
    }

    fn group_size(&self, group_path: &str) -> Result<u64, CodecError> {
        self.tree
            .group_counts
            .get(group_path)
            .map(|&c| c as u64)
            .ok_or_else(|| CodecError::unknown_reference(Stage::Derive, "", group_path))
    }
}

/// Re-serializes a single resolved node value to its own bytes, independent
/// of the tree's overall bit-packing pass — used by `bytesOf`/`crc16Of`/etc.
/// builtins, which need a node's wire bytes before the whole stream exists.
fn serialize_node(node: &FinalNode, value: &Value) -> Result<Vec<u8>, CodecError> {
    let value = if node.source.range.is_empty() {
        value.clone()
    } else {
        bitcodec::resolve_enum_for_encode(value.clone(), &node.source.range, &node.path)?
    };
    let mut sink = BitSink::new();
    sink.write_value(&node.source.value_type, node.endian, node.length_bits as u32, &value, &node.path)?;
    sink.into_bytes()
}

fn fill_bytes(fill: &str, bits: u64, ctx: &dyn NodeContext) -> Result<Vec<u8>, CodecError> {
    let byte = bitcodec::eval_fill_byte(fill, ctx)?;
    let mut sink = BitSink::new();
    sink.write_fill(bits, byte, "padding")?;
    sink.into_bytes()
}

/// Runs the full forward derivation pass for encode: resolves every node's
/// value and enablement from caller-supplied instance values plus
/// `fwd_expr`/`conditional_deps`, in dependency order.
pub fn derive_for_encode(
    _protocol: &Protocol,
    tree: &FinalTree,
    raw_values: &IndexMap<String, Value>,
) -> Result<DerivedValues, CodecError> {
    let graph = build_graph(tree)?;
    let order = topo_order(&graph, tree)?;

    let mut resolved: IndexMap<String, Resolved> = IndexMap::new();
    for entry in &tree.entries {
        if let FinalEntry::Padding(_) = entry {
            continue;
        }
        resolved.insert(
            entry.path().to_string(),
            Resolved {
                enabled: true,
                value: None,
            },
        );
    }

    for path in &order {
        let Some(node) = tree.node(path) else { continue };

        if let Some(action) = apply_conditional_deps(node, &resolved, tree, Direction::Encode)? {
            apply_action(&mut resolved, path, &action);
        }

        if !resolved.get(path).map(|r| r.enabled).unwrap_or(true) {
            continue;
        }
        if resolved.get(path).and_then(|r| r.value.as_ref()).is_some() {
            continue;
        }

        let value = if let Some(expr_src) = &node.source.fwd_expr {
            let ctx = DeriveContext { tree, resolved: &resolved };
            expr::evaluate(expr_src, &ctx)?
        } else if let Some(raw) = raw_values.get(path) {
            raw.clone()
        } else if let Some(default) = &node.source.value {
            default.clone()
        } else {
            return Err(CodecError::MissingValue {
                stage: Stage::Derive,
                node_path: path.clone(),
            });
        };

        let value = if node.source.range.is_empty() {
            value
        } else {
            bitcodec::resolve_enum_for_encode(value, &node.source.range, path)?
        };

        resolved.insert(
            path.clone(),
            Resolved {
                enabled: true,
                value: Some(value),
            },
        );
    }

    Ok(resolved)
}

/// Runs the backward derivation pass for decode: given every node's
/// raw-decoded value already resolved by the bit codec, applies
/// `bwd_expr`/`conditional_deps` and enum substitution to produce the
/// caller-facing value map, in dependency order.
pub fn derive_for_decode(
    _protocol: &Protocol,
    tree: &FinalTree,
    raw_decoded: &IndexMap<String, Value>,
) -> Result<DerivedValues, CodecError> {
    let graph = build_graph(tree)?;
    let order = topo_order(&graph, tree)?;

    let mut resolved: IndexMap<String, Resolved> = IndexMap::new();
    for entry in &tree.entries {
        if let FinalEntry::Padding(_) = entry {
            continue;
        }
        let path = entry.path().to_string();
        let raw = raw_decoded.get(&path).cloned();
        resolved.insert(path, Resolved { enabled: true, value: raw });
    }

    for path in &order {
        let Some(node) = tree.node(path) else { continue };

        if let Some(action) = apply_conditional_deps(node, &resolved, tree, Direction::Decode)? {
            apply_action(&mut resolved, path, &action);
        }

        if !resolved.get(path).map(|r| r.enabled).unwrap_or(true) {
            continue;
        }

        let raw = resolved.get(path).and_then(|r| r.value.clone());
        let raw = match raw {
            Some(v) => v,
            None => continue,
        };
        let substituted = if node.source.range.is_empty() {
            raw
        } else {
            bitcodec::resolve_enum_for_decode(raw, &node.source.range)
        };

        let final_value = if let Some(expr_src) = &node.source.bwd_expr {
            let mut pre = resolved.clone();
            pre.insert(
                path.clone(),
                Resolved {
                    enabled: true,
                    value: Some(substituted.clone()),
                },
            );
            let ctx = DeriveContext { tree, resolved: &pre };
            expr::evaluate(expr_src, &ctx)?
        } else {
            substituted
        };

        resolved.insert(
            path.clone(),
            Resolved {
                enabled: true,
                value: Some(final_value),
            },
        );
    }

    Ok(resolved)
}

/// Evaluates `node`'s conditional dependencies in priority order (highest
/// first) against the current `resolved` map and returns the first
/// resolvable dep's action — deps whose condition node isn't resolved yet
/// are skipped over, but as soon as one resolves, its action is the one that
/// applies and every lower-priority dep is left unevaluated. Returns `None`
/// if no dep resolves. Doesn't mutate `resolved` itself — the caller applies
/// the action afterwards, once the immutable borrow used for evaluation is
/// done.
fn apply_conditional_deps(
    node: &FinalNode,
    resolved: &IndexMap<String, Resolved>,
    tree: &FinalTree,
    _direction: Direction,
) -> Result<Option<ConditionalAction>, CodecError> {
    let mut deps: Vec<&crate::schema::ConditionalDep> = node.source.conditional_deps.iter().collect();
    deps.sort_by_key(|d| std::cmp::Reverse(d.priority));

    for dep in deps {
        let condition_value = match resolved.get(&dep.condition_node) {
            Some(Resolved { enabled: true, value: Some(v) }) => v.clone(),
            _ => continue,
        };
        let ctx = DeriveContext { tree, resolved };
        let truthy = evaluate_predicate(&dep.predicate, &condition_value, &ctx)?;
        let action = if truthy { dep.then_action.clone() } else { dep.else_action.clone() };
        log::trace!(
            "{}: conditional dep on '{}' ({}) -> {:?}",
            node.path,
            dep.condition_node,
            dep.predicate,
            action
        );
        return Ok(Some(action));
    }
    Ok(None)
}

/// Evaluates a conditional-dependency predicate against its condition node's
/// value, which is bound into the expression under the name `value`
/// (the `condition_node`/`predicate` pairing, e.g. `"value >= 2"`).
fn evaluate_predicate(predicate: &str, condition_value: &Value, ctx: &dyn NodeContext) -> Result<bool, CodecError> {
    struct PredicateCtx<'a> {
        inner: &'a dyn NodeContext,
        value: &'a Value,
    }
    impl NodeContext for PredicateCtx<'_> {
        fn resolve(&self, node_path: &str) -> Result<Value, CodecError> {
            if node_path == "value" {
                Ok(self.value.clone())
            } else {
                self.inner.resolve(node_path)
            }
        }
        fn bytes_of(&self, node_path: &str) -> Result<Vec<u8>, CodecError> {
            self.inner.bytes_of(node_path)
        }
        fn bit_length_of(&self, node_path: &str) -> Result<u64, CodecError> {
            self.inner.bit_length_of(node_path)
        }
        fn bytes_between(&self, from: &str, to: &str) -> Result<Vec<u8>, CodecError> {
            self.inner.bytes_between(from, to)
        }
        fn group_size(&self, group_path: &str) -> Result<u64, CodecError> {
            self.inner.group_size(group_path)
        }
    }

    let predicate = bind_value_identifier(predicate);
    let pctx = PredicateCtx {
        inner: ctx,
        value: condition_value,
    };
    let result = expr::evaluate(&predicate, &pctx)?;
    Ok(result.as_bool().unwrap_or(false))
}

/// Rewrites the bare word `value` in a predicate expression to `#value` so
/// it resolves through the reference grammar, without touching identifiers
/// that merely contain `value` as a substring (e.g. `extended_value`).
fn bind_value_identifier(predicate: &str) -> String {
    let mut out = String::with_capacity(predicate.len() + 4);
    let chars: Vec<char> = predicate.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            if word == "value" {
                out.push('#');
            }
            out.push_str(&word);
        } else {
            out.push(c);
            i += 1;
        }
    }
    out
}

fn apply_action(resolved: &mut IndexMap<String, Resolved>, target: &str, action: &ConditionalAction) {
    let entry = resolved.entry(target.to_string()).or_insert(Resolved {
        enabled: true,
        value: None,
    });
    match action {
        ConditionalAction::Enable => entry.enabled = true,
        ConditionalAction::Disable => entry.enabled = false,
        ConditionalAction::Clear => entry.value = None,
        ConditionalAction::SetDefault { value } => entry.value = Some(Value::Str(value.clone())),
    }
}

/// Whether a disabled node still occupies its declared bit span in the
/// packed stream (`Reserve`, the default) or is omitted entirely, shifting
/// every following sibling left (`Collapse`).
pub fn on_disable_policy(node: &Node) -> OnDisable {
    node.on_disable
}
