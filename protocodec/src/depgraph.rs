//! Dependency Builder & Topological Scheduler.
//!
//! Builds a DAG over node paths from every `fwd_expr`/`bwd_expr`/
//! `conditional_deps[i].condition_node` reference, expands range-shaped
//! builtins (`…Between(#a,#b)`) and `size(#g)` into per-node edges, then
//! produces a deterministic topological order with Kahn's algorithm —
//! grounded on the relate-by pattern's declaration-order tie-breaking
//! (`other_examples/34e487a7_relateby-pattern-rs`).

use crate::error::{CodecError, Stage};
use crate::expr;
use crate::tree::{FinalEntry, FinalTree};
use ahash::AHashMap;
use indexmap::{IndexMap, IndexSet};
use rustc_hash::FxHashSet;

/// `node -> set of nodes it depends on` (must be processed first).
#[derive(Debug, Clone, Default)]
pub struct Graph {
    pub depends_on: IndexMap<String, IndexSet<String>>,
}

pub fn build_graph(tree: &FinalTree) -> Result<Graph, CodecError> {
    let mut graph = Graph::default();
    for entry in &tree.entries {
        graph.depends_on.entry(entry.path().to_string()).or_default();
    }

    for entry in &tree.entries {
        let node = match entry {
            FinalEntry::Node(n) => n,
            FinalEntry::Padding(_) => continue,
        };
        let path = node.path.clone();

        let mut exprs: Vec<&str> = Vec::new();
        if let Some(e) = &node.source.fwd_expr {
            exprs.push(e);
        }
        if let Some(e) = &node.source.bwd_expr {
            exprs.push(e);
        }
        let predicates: Vec<&str> = node.source.conditional_deps.iter().map(|d| d.predicate.as_str()).collect();
        for e in &predicates {
            exprs.push(e);
        }
        for dep in &node.source.conditional_deps {
            add_edge(&mut graph, &path, &dep.condition_node);
        }

        for src in exprs {
            let ast = expr::parse_for_dependencies(src)?;

            let mut refs = Vec::new();
            ast.collect_references(&mut refs);
            for r in &refs {
                add_edge(&mut graph, &path, r);
            }

            let mut ranges = Vec::new();
            ast.collect_range_calls(&mut ranges);
            for (_fn_name, a, b) in ranges {
                let a_node = tree.node(&a).ok_or_else(|| CodecError::unknown_reference(Stage::Plan, &path, &a))?;
                let b_node = tree.node(&b).ok_or_else(|| CodecError::unknown_reference(Stage::Plan, &path, &b))?;
                if a_node.start_bit > b_node.start_bit {
                    return Err(CodecError::RangeOrder {
                        stage: Stage::Plan,
                        node_path: path.clone(),
                        from: a.clone(),
                        to: b.clone(),
                    });
                }
                for other in &tree.entries {
                    if let FinalEntry::Node(other_node) = other {
                        if other_node.start_bit >= a_node.start_bit && other_node.end_bit() <= b_node.end_bit() {
                            add_edge(&mut graph, &path, &other_node.path);
                        }
                    }
                }
            }

            let mut group_sizes = Vec::new();
            ast.collect_group_size_calls(&mut group_sizes);
            for g in group_sizes {
                if let Some(members) = tree.group_members.get(&g) {
                    for member in members {
                        add_edge(&mut graph, &path, member);
                    }
                } else {
                    add_edge(&mut graph, &path, &g);
                }
            }
        }
    }

    Ok(graph)
}

fn add_edge(graph: &mut Graph, from: &str, to: &str) {
    if from == to {
        return;
    }
    graph.depends_on.entry(from.to_string()).or_default().insert(to.to_string());
    graph.depends_on.entry(to.to_string()).or_default();
}

/// Kahn's algorithm with stable tie-breaking by declaration index (the
/// determinism requirement): among all currently-ready nodes, the one
/// that appears earliest in the flattened pre-order walk of the tree goes
/// next.
pub fn topo_order(graph: &Graph, tree: &FinalTree) -> Result<Vec<String>, CodecError> {
    // Lookup-only scratch maps: iteration order never escapes this function
    // (the declaration-order tie-break below reads from `decl_index`, it
    // doesn't iterate it), so these use the faster non-deterministic-order
    // hashers rather than `indexmap`.
    let decl_index: AHashMap<String, usize> = tree
        .entries
        .iter()
        .enumerate()
        .map(|(i, e)| (e.path().to_string(), i))
        .collect();

    let mut remaining_in_degree: AHashMap<String, usize> = AHashMap::default();
    let mut dependents: AHashMap<String, FxHashSet<String>> = AHashMap::default();

    for node in graph.depends_on.keys() {
        remaining_in_degree.entry(node.clone()).or_insert(0);
        dependents.entry(node.clone()).or_default();
    }
    for (node, deps) in &graph.depends_on {
        *remaining_in_degree.entry(node.clone()).or_insert(0) += deps.len();
        for dep in deps {
            dependents.entry(dep.clone()).or_default().insert(node.clone());
        }
    }

    let total = remaining_in_degree.len();
    let mut order = Vec::with_capacity(total);
    let mut settled: FxHashSet<String> = FxHashSet::default();

    loop {
        let mut ready: Vec<&String> = remaining_in_degree
            .iter()
            .filter(|(n, &deg)| deg == 0 && !settled.contains(*n))
            .map(|(n, _)| n)
            .collect();
        if ready.is_empty() {
            break;
        }
        ready.sort_by_key(|n| decl_index.get(*n).copied().unwrap_or(usize::MAX));
        let next = ready[0].clone();
        settled.insert(next.clone());
        order.push(next.clone());
        if let Some(deps) = dependents.get(&next) {
            for d in deps.clone() {
                if let Some(deg) = remaining_in_degree.get_mut(&d) {
                    *deg -= 1;
                }
            }
        }
    }

    if order.len() != total {
        let cycle: Vec<String> = remaining_in_degree
            .keys()
            .filter(|n| !settled.contains(*n))
            .cloned()
            .collect();
        return Err(CodecError::CyclicDependency {
            stage: Stage::Plan,
            cycle,
        });
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Endian, Node, Protocol, SchemaNode, ValueType};
    use indexmap::IndexMap as Map;

    fn node(id: &str, order: i64, width: u32, fwd: Option<&str>) -> SchemaNode {
        let mut n = Node::new(id, ValueType::Uint { width }, width).with_order(order);
        n.fwd_expr = fwd.map(|s| s.to_string());
        SchemaNode::Node(n)
    }

    #[test]
    fn topo_order_respects_value_dependency() {
        let mut proto = Protocol::default();
        proto.id = "p".into();
        proto.endian_default = Endian::Big;
        proto.body.push(node("a", 0, 8, None));
        proto.body.push(node("b", 1, 8, Some("#a + 1")));

        let tree = crate::tree::finalize(&proto, &Map::new()).unwrap();
        let graph = build_graph(&tree).unwrap();
        let order = topo_order(&graph, &tree).unwrap();
        let a_idx = order.iter().position(|n| n == "a").unwrap();
        let b_idx = order.iter().position(|n| n == "b").unwrap();
        assert!(a_idx < b_idx);
    }

    #[test]
    fn declaration_order_breaks_ties_among_independent_nodes() {
        let mut proto = Protocol::default();
        proto.id = "p".into();
        proto.body.push(node("z", 0, 8, None));
        proto.body.push(node("y", 1, 8, None));

        let tree = crate::tree::finalize(&proto, &Map::new()).unwrap();
        let graph = build_graph(&tree).unwrap();
        let order = topo_order(&graph, &tree).unwrap();
        assert_eq!(order, vec!["z".to_string(), "y".to_string()]);
    }

    #[test]
    fn range_dependency_expands_to_every_node_in_span() {
        let mut proto = Protocol::default();
        proto.id = "p".into();
        proto.body.push(node("a", 0, 8, None));
        proto.body.push(node("b", 1, 8, None));
        proto.body.push(node("c", 2, 8, None));
        proto.body.push(node("checksum", 3, 16, Some("crc16Between(#a,#c)")));

        let tree = crate::tree::finalize(&proto, &Map::new()).unwrap();
        let graph = build_graph(&tree).unwrap();
        let deps = graph.depends_on.get("checksum").unwrap();
        assert!(deps.contains("a"));
        assert!(deps.contains("b"));
        assert!(deps.contains("c"));
    }

    #[test]
    fn inverted_range_endpoints_are_rejected() {
        let mut proto = Protocol::default();
        proto.id = "p".into();
        proto.body.push(node("a", 0, 8, None));
        proto.body.push(node("b", 1, 8, None));
        proto.body.push(node("checksum", 2, 16, Some("crc16Between(#b,#a)")));

        let tree = crate::tree::finalize(&proto, &Map::new()).unwrap();
        assert!(build_graph(&tree).is_err());
    }

    /// A group whose own id does not match its child template's id (`item`
    /// group materializing `val_1`/`val_2`, not `item_1`/`item_2`) must still
    /// have `size(#item)` expand to edges onto the materialized children.
    #[test]
    fn group_size_expands_to_members_even_when_template_id_differs_from_group_id() {
        use crate::schema::{Group, ResolveStrategy};

        let mut proto = Protocol::default();
        proto.id = "p".into();
        proto.body.push(node("count", 0, 8, Some("size(#item)")));
        let group = Group {
            id: "item".into(),
            name: String::new(),
            child_template: Box::new(node("val", 0, 8, None)),
            id_suffix_pattern: "_%d".into(),
            name_suffix_pattern: "[%d]".into(),
            resolve_strategy: ResolveStrategy::Flatten,
            length_expr: None,
            order: 1,
            padding: None,
        };
        proto.body.push(SchemaNode::Group(group));

        let mut raw = Map::new();
        raw.insert("item".to_string(), crate::value::Value::UInt(2));
        let tree = crate::tree::finalize(&proto, &raw).unwrap();
        let graph = build_graph(&tree).unwrap();
        let deps = graph.depends_on.get("count").unwrap();
        assert!(deps.contains("val_1"));
        assert!(deps.contains("val_2"));
    }
}
