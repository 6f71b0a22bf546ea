//! End-to-end encode/decode scenarios over the public `Instance`/`Protocol`
//! API, covering the fixed byte expectations and quantified invariants
//! (round-trip, determinism, length law) a schema-driven codec has to hold.

use protocodec::schema::{
    ConditionalAction, ConditionalDep, Endian, Group, Node, OnDisable, Protocol, ResolveStrategy,
    SchemaNode, ValueType,
};
use protocodec::Instance;

fn node(id: &str, value_type: ValueType, length_bits: u32, order: i64) -> SchemaNode {
    SchemaNode::Node(Node::new(id, value_type, length_bits).with_order(order))
}

/// S1 — a checksum derived over the bytes between two sibling fields.
#[test]
fn s1_crc_between_version_and_data_field() {
    let mut proto = Protocol::default();
    proto.id = "s1".into();
    proto.endian_default = Endian::Big;

    let mut protocol_id = Node::new("protocol_id", ValueType::Hex, 16).with_order(0);
    protocol_id.value = Some(protocodec::Value::UInt(0x1234));

    let mut checksum = Node::new("checksum", ValueType::Hex, 16).with_order(1);
    checksum.fwd_expr = Some("crc16Between(#version, #data_field)".to_string());

    let version = node("version", ValueType::Uint { width: 8 }, 8, 2);

    let mut data_length = Node::new("data_length", ValueType::Uint { width: 16 }, 16).with_order(3);
    data_length.fwd_expr = Some("nodeLength(#data_field)".to_string());

    let data_field = node("data_field", ValueType::Hex, 32, 4);

    proto.body.push(SchemaNode::Node(protocol_id));
    proto.body.push(SchemaNode::Node(checksum));
    proto.body.push(version);
    proto.body.push(SchemaNode::Node(data_length));
    proto.body.push(data_field);

    let mut inst = Instance::new(proto.clone());
    inst.set("version", 1u64);
    inst.set("data_field", 0xDEADBEEFu64);

    let bytes = inst.encode().unwrap();
    assert_eq!(
        bytes,
        vec![0x12, 0x34, 0x04, 0xFE, 0x01, 0x00, 0x04, 0xDE, 0xAD, 0xBE, 0xEF]
    );

    let decoded = Instance::decode(&proto, &bytes).unwrap();
    assert_eq!(decoded.get("version").unwrap().as_uint(), Some(1));
    assert_eq!(decoded.get("data_length").unwrap().as_uint(), Some(4));
}

/// S2 — a conditional dependency gates a trailing field on/off depending on
/// a sibling's value, with the disabled field collapsed out of the stream
/// entirely rather than zero-filled.
#[test]
fn s2_version_gating_changes_encoded_length() {
    fn build() -> Protocol {
        let mut proto = Protocol::default();
        proto.id = "s2".into();
        proto.endian_default = Endian::Big;

        proto
            .body
            .push(node("version", ValueType::Uint { width: 8 }, 8, 0));

        let mut extended = Node::new("extended", ValueType::Hex, 32).with_order(1);
        extended.on_disable = OnDisable::Collapse;
        extended.conditional_deps.push(ConditionalDep {
            condition_node: "version".to_string(),
            predicate: "value >= 2".to_string(),
            then_action: ConditionalAction::Enable,
            else_action: ConditionalAction::Disable,
            priority: 0,
        });
        proto.body.push(SchemaNode::Node(extended));
        proto
    }

    let proto = build();
    let mut v1 = Instance::new(proto.clone());
    v1.set("version", 1u64);
    v1.set("extended", 0u64);
    let bytes_v1 = v1.encode().unwrap();
    assert_eq!(bytes_v1.len(), 1);
    assert_eq!(bytes_v1, vec![0x01]);

    let mut v2 = Instance::new(proto);
    v2.set("version", 2u64);
    v2.set("extended", 0x11223344u64);
    let bytes_v2 = v2.encode().unwrap();
    assert_eq!(bytes_v2.len(), 5);
    assert_eq!(&bytes_v2[1..5], &[0x11, 0x22, 0x33, 0x44]);
}

/// S3 — a group materializes a caller-supplied element count, each clone
/// addressable by its suffixed id, and a sibling derives the count back via
/// `size()`.
#[test]
fn s3_group_expansion_with_derived_count() {
    let mut proto = Protocol::default();
    proto.id = "s3".into();
    proto.endian_default = Endian::Big;

    let mut count = Node::new("count", ValueType::Uint { width: 16 }, 16).with_order(0);
    count.fwd_expr = Some("size(#params)".to_string());
    proto.body.push(SchemaNode::Node(count));

    let mut item = Protocol::default();
    item.id = "params".into();
    item.endian_default = Endian::Big;
    item.body.push(node("id", ValueType::Uint { width: 16 }, 16, 0));
    item.body.push(node("value", ValueType::Hex, 32, 1));

    let group = Group {
        id: "params".into(),
        name: String::new(),
        child_template: Box::new(SchemaNode::Protocol(Box::new(item))),
        id_suffix_pattern: "_%d".into(),
        name_suffix_pattern: "[%d]".into(),
        resolve_strategy: ResolveStrategy::GroupContainer,
        length_expr: Some("#count".to_string()),
        order: 1,
        padding: None,
    };
    proto.body.push(SchemaNode::Group(group));

    let mut inst = Instance::new(proto.clone());
    inst.set("params", 2u64);
    inst.set("params_1.id", 1u64);
    inst.set("params_1.value", 0x01020304u64);
    inst.set("params_2.id", 2u64);
    inst.set("params_2.value", 0x05060708u64);

    let bytes = inst.encode().unwrap();
    assert_eq!(
        bytes,
        vec![
            0x00, 0x02, // count
            0x00, 0x01, 0x01, 0x02, 0x03, 0x04, // params_1
            0x00, 0x02, 0x05, 0x06, 0x07, 0x08, // params_2
        ]
    );
    assert_eq!(bytes.len() - 2, 12);

    let decoded = Instance::decode(&proto, &bytes).unwrap();
    assert_eq!(decoded.get("params_1.id").unwrap().as_uint(), Some(1));
    assert_eq!(
        decoded.get("params_2.value").unwrap().as_uint(),
        Some(0x05060708)
    );
}

/// S4 — a little-endian integer is byte-swapped on the wire.
#[test]
fn s4_little_endian_integer() {
    let mut proto = Protocol::default();
    proto.id = "s4".into();

    let mut n = Node::new("n", ValueType::Uint { width: 32 }, 32).with_order(0);
    n.endian = Some(Endian::Little);
    proto.body.push(SchemaNode::Node(n));

    let mut inst = Instance::new(proto.clone());
    inst.set("n", 0x01020304u64);
    let bytes = inst.encode().unwrap();
    assert_eq!(bytes, vec![0x04, 0x03, 0x02, 0x01]);

    let decoded = Instance::decode(&proto, &bytes).unwrap();
    assert_eq!(decoded.get("n").unwrap().as_uint(), Some(0x01020304));
}

/// S5 — three sub-byte fields pack MSB-first within a shared byte.
#[test]
fn s5_sub_byte_packing() {
    let mut proto = Protocol::default();
    proto.id = "s5".into();
    proto.endian_default = Endian::Big;
    proto.body.push(node("a", ValueType::Uint { width: 3 }, 3, 0));
    proto.body.push(node("b", ValueType::Uint { width: 5 }, 5, 1));
    proto.body.push(node("c", ValueType::Uint { width: 8 }, 8, 2));

    let mut inst = Instance::new(proto.clone());
    inst.set("a", 5u64);
    inst.set("b", 9u64);
    inst.set("c", 0xAAu64);
    let bytes = inst.encode().unwrap();
    assert_eq!(bytes, vec![0xA9, 0xAA]);

    let decoded = Instance::decode(&proto, &bytes).unwrap();
    assert_eq!(decoded.get("a").unwrap().as_uint(), Some(5));
    assert_eq!(decoded.get("b").unwrap().as_uint(), Some(9));
    assert_eq!(decoded.get("c").unwrap().as_uint(), Some(0xAA));
}

/// S6 — a fixed-width UTF-8 string round-trips through zero-padding.
#[test]
fn s6_string_round_trip() {
    let mut proto = Protocol::default();
    proto.id = "s6".into();
    proto.body.push(SchemaNode::Node(
        Node::new(
            "name",
            ValueType::String {
                charset: "utf-8".into(),
            },
            64,
        )
        .with_order(0),
    ));

    let mut inst = Instance::new(proto.clone());
    inst.set("name", "你好".to_string());
    let bytes = inst.encode().unwrap();
    assert_eq!(
        bytes,
        vec![0xe4, 0xbd, 0xa0, 0xe5, 0xa5, 0xbd, 0x00, 0x00]
    );

    let decoded = Instance::decode(&proto, &bytes).unwrap();
    assert_eq!(
        decoded.get("name").unwrap().as_str().as_deref(),
        Some("你好")
    );
}

/// Round-trip + length-law invariant: encoding then decoding any instance
/// reproduces every explicitly-set value, and the encoded length matches the
/// schema's static bit layout exactly when there are no variable-length
/// fields.
#[test]
fn round_trip_and_length_law_hold_for_a_mixed_schema() {
    let mut proto = Protocol::default();
    proto.id = "roundtrip".into();
    proto.endian_default = Endian::Big;
    proto.body.push(node("flag", ValueType::Uint { width: 8 }, 8, 0));
    proto.body.push(node("payload", ValueType::Hex, 16, 1));

    let mut inst = Instance::new(proto.clone());
    inst.set("flag", 7u64);
    inst.set("payload", 0xBEEFu64);

    let bytes = inst.encode().unwrap();
    assert_eq!(bytes.len(), 3);

    let decoded = Instance::decode(&proto, &bytes).unwrap();
    assert_eq!(decoded.get("flag").unwrap().as_uint(), Some(7));
    assert_eq!(decoded.get("payload").unwrap().as_uint(), Some(0xBEEF));

    // Determinism: encoding the same instance twice yields identical bytes.
    let bytes_again = inst.encode().unwrap();
    assert_eq!(bytes, bytes_again);
}
