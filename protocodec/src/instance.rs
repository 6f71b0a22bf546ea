//! Public encode/decode entry points: binds a
//! [`Protocol`] schema to a set of per-node instance values and drives the
//! full finalize → derive → pack pipeline in each direction.

use crate::bitcodec::{self, BitSink};
use crate::derive::{self, DeriveContext, DerivedValues};
use crate::error::{CodecError, Stage};
use crate::schema::{OnDisable, Protocol};
use crate::tree::{self, FinalEntry, FinalTree};
use crate::value::Value;
use indexmap::IndexMap;

/// A schema bound to the values of one concrete message.
#[derive(Debug, Clone)]
pub struct Instance {
    pub schema: Protocol,
    pub values: IndexMap<String, Value>,
}

impl Instance {
    pub fn new(schema: Protocol) -> Self {
        Self {
            schema,
            values: IndexMap::new(),
        }
    }

    pub fn set(&mut self, path: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.values.insert(path.into(), value.into());
        self
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        self.values.get(path)
    }

    /// Finalizes the tree against `self.values`, derives every expression-
    /// and conditional-dependency-driven value, and packs the result to a
    /// bit-exact byte stream.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let tree = tree::finalize(&self.schema, &self.values)?;
        let derived = derive::derive_for_encode(&self.schema, &tree, &self.values)?;
        let bytes = pack(&tree, &derived)?;
        log::info!("encoded '{}' to {} bytes", self.schema.id, bytes.len());
        Ok(bytes)
    }

    /// Reads a byte stream against `schema`, deriving group counts and
    /// padding lengths from the bytes themselves as it goes, then runs the
    /// backward derivation pass (`bwd_expr`, enum substitution).
    pub fn decode(schema: &Protocol, data: &[u8]) -> Result<Instance, CodecError> {
        let (tree, raw_decoded) = tree::finalize_for_decode(schema, data)?;
        let derived = derive::derive_for_decode(schema, &tree, &raw_decoded)?;

        let mut values = IndexMap::new();
        for (path, resolved) in derived {
            if resolved.enabled {
                if let Some(v) = resolved.value {
                    values.insert(path, v);
                }
            }
        }
        log::info!(
            "decoded {} bytes against '{}': {} values",
            data.len(),
            schema.id,
            values.len()
        );
        Ok(Instance {
            schema: schema.clone(),
            values,
        })
    }
}

/// Packs every finalized entry in declaration order: enabled nodes write
/// their resolved value, disabled nodes write zero-fill (`Reserve`) or
/// nothing at all (`Collapse`), and padding runs write their fill byte.
fn pack(tree: &FinalTree, derived: &DerivedValues) -> Result<Vec<u8>, CodecError> {
    let ctx = DeriveContext { tree, resolved: derived };
    let mut sink = BitSink::new();
    for entry in &tree.entries {
        match entry {
            FinalEntry::Node(n) => {
                let resolved = derived.get(&n.path);
                let enabled = resolved.map(|r| r.enabled).unwrap_or(true);
                if !enabled {
                    match derive::on_disable_policy(&n.source) {
                        OnDisable::Reserve => sink.write_fill(n.length_bits, 0, &n.path)?,
                        OnDisable::Collapse => {}
                    }
                    continue;
                }
                let value = resolved
                    .and_then(|r| r.value.clone())
                    .ok_or_else(|| CodecError::MissingValue {
                        stage: Stage::Code,
                        node_path: n.path.clone(),
                    })?;
                sink.write_value(&n.source.value_type, n.endian, n.length_bits as u32, &value, &n.path)?;
            }
            FinalEntry::Padding(p) => {
                let byte = bitcodec::eval_fill_byte(&p.fill, &ctx)?;
                sink.write_fill(p.length_bits, byte, &p.path)?;
            }
        }
    }
    sink.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Endian, Node, SchemaNode, ValueType};

    fn two_byte_protocol() -> Protocol {
        let mut proto = Protocol::default();
        proto.id = "p".into();
        proto.endian_default = Endian::Big;
        proto.body.push(SchemaNode::Node(Node::new("a", ValueType::Uint { width: 8 }, 8).with_order(0)));
        proto.body.push(SchemaNode::Node(Node::new("b", ValueType::Uint { width: 8 }, 8).with_order(1)));
        proto
    }

    #[test]
    fn round_trips_a_simple_two_byte_message() {
        let schema = two_byte_protocol();
        let mut inst = Instance::new(schema.clone());
        inst.set("a", 0x12u64);
        inst.set("b", 0x34u64);
        let bytes = inst.encode().unwrap();
        assert_eq!(bytes, vec![0x12, 0x34]);

        let decoded = Instance::decode(&schema, &bytes).unwrap();
        assert_eq!(decoded.get("a").unwrap().as_uint(), Some(0x12));
        assert_eq!(decoded.get("b").unwrap().as_uint(), Some(0x34));
    }

    #[test]
    fn fwd_expr_derives_a_checksum_node() {
        let mut proto = Protocol::default();
        proto.id = "p".into();
        proto.body.push(SchemaNode::Node(Node::new("a", ValueType::Uint { width: 8 }, 8).with_order(0)));
        let mut sum = Node::new("sum", ValueType::Uint { width: 8 }, 8).with_order(1);
        sum.fwd_expr = Some("#a + 1".to_string());
        proto.body.push(SchemaNode::Node(sum));

        let mut inst = Instance::new(proto);
        inst.set("a", 0x01u64);
        let bytes = inst.encode().unwrap();
        assert_eq!(bytes, vec![0x01, 0x02]);
    }

    #[test]
    fn disabled_reserve_node_is_zero_filled() {
        let mut proto = Protocol::default();
        proto.id = "p".into();
        proto.body.push(SchemaNode::Node(Node::new("flag", ValueType::Uint { width: 8 }, 8).with_order(0)));
        let mut guarded = Node::new("extra", ValueType::Uint { width: 8 }, 8).with_order(1);
        guarded.conditional_deps.push(crate::schema::ConditionalDep {
            condition_node: "flag".to_string(),
            predicate: "value == 1".to_string(),
            then_action: crate::schema::ConditionalAction::Enable,
            else_action: crate::schema::ConditionalAction::Disable,
            priority: 0,
        });
        guarded.value = Some(Value::UInt(0xAA));
        proto.body.push(SchemaNode::Node(guarded));

        let mut inst = Instance::new(proto);
        inst.set("flag", 0u64);
        let bytes = inst.encode().unwrap();
        assert_eq!(bytes, vec![0x00, 0x00]);
    }

    #[test]
    fn group_count_round_trips_through_a_length_expr() {
        let mut proto = Protocol::default();
        proto.id = "p".into();
        proto.body.push(SchemaNode::Node(Node::new("count", ValueType::Uint { width: 8 }, 8).with_order(0)));
        let group = crate::schema::Group {
            id: "item".into(),
            name: String::new(),
            child_template: Box::new(SchemaNode::Node(Node::new("val", ValueType::Uint { width: 8 }, 8))),
            id_suffix_pattern: "_%d".into(),
            name_suffix_pattern: "[%d]".into(),
            resolve_strategy: crate::schema::ResolveStrategy::Flatten,
            length_expr: Some("#count".to_string()),
            order: 1,
            padding: None,
        };
        proto.body.push(SchemaNode::Group(group));

        let mut inst = Instance::new(proto.clone());
        inst.set("count", 2u64);
        inst.set("item", 2u64);
        inst.set("val_1", 0x11u64);
        inst.set("val_2", 0x22u64);
        let bytes = inst.encode().unwrap();
        assert_eq!(bytes, vec![0x02, 0x11, 0x22]);

        let decoded = Instance::decode(&proto, &bytes).unwrap();
        assert_eq!(decoded.get("val_1").unwrap().as_uint(), Some(0x11));
        assert_eq!(decoded.get("val_2").unwrap().as_uint(), Some(0x22));
    }
}
