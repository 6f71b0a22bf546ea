//! Expression engine: lexer, parser, AST and evaluator for the
//! small C-family expression language used by forward/backward derivations,
//! conditional predicates, and padding length/fill expressions.

pub mod ast;
pub mod builtins;
pub mod eval;
pub mod lexer;
pub mod parser;
pub mod preprocess;
pub mod time;

pub use ast::Expr;
pub use builtins::NodeContext;

use crate::error::CodecError;
use crate::value::Value;
use indexmap::IndexMap;
use std::sync::{OnceLock, RwLock};

/// Process-global expression-parse cache, keyed by the preprocessed
/// (reference-rewritten) source text. Schemas reuse the same `fwd_expr`/
/// `bwd_expr`/predicate text across many clones of a group's child template,
/// so caching the parse avoids re-lexing identical strings once per clone.
/// A write race just repeats the parse for that key; insertion is idempotent,
/// so no corruption is possible.
fn parse_cache() -> &'static RwLock<IndexMap<String, Expr>> {
    static CACHE: OnceLock<RwLock<IndexMap<String, Expr>>> = OnceLock::new();
    CACHE.get_or_init(|| RwLock::new(IndexMap::new()))
}

fn cached_parse(source: &str) -> Result<Expr, CodecError> {
    let rewritten = preprocess::rewrite_references(source);
    if let Some(cached) = parse_cache().read().unwrap().get(&rewritten) {
        return Ok(cached.clone());
    }
    let ast = parser::parse(&rewritten)?;
    parse_cache().write().unwrap().insert(rewritten, ast.clone());
    Ok(ast)
}

/// Parses and evaluates a raw (un-preprocessed) expression source string
/// against a node context in one call.
pub fn evaluate(source: &str, ctx: &dyn NodeContext) -> Result<Value, CodecError> {
    let ast = cached_parse(source)?;
    eval::eval(&ast, ctx)
}

/// Parses a raw expression source string into its AST without evaluating it,
/// for use by the dependency builder.
pub fn parse_for_dependencies(source: &str) -> Result<Expr, CodecError> {
    cached_parse(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    struct FakeCtx {
        values: RefCell<HashMap<String, Value>>,
    }

    impl NodeContext for FakeCtx {
        fn resolve(&self, node_path: &str) -> Result<Value, CodecError> {
            self.values
                .borrow()
                .get(node_path)
                .cloned()
                .ok_or_else(|| CodecError::unknown_reference(crate::error::Stage::Derive, "", node_path))
        }
        fn bytes_of(&self, node_path: &str) -> Result<Vec<u8>, CodecError> {
            Ok(self.resolve(node_path)?.as_bytes().map(|c| c.into_owned()).unwrap_or_default())
        }
        fn bit_length_of(&self, node_path: &str) -> Result<u64, CodecError> {
            Ok(self.bytes_of(node_path)?.len() as u64 * 8)
        }
        fn bytes_between(&self, from: &str, to: &str) -> Result<Vec<u8>, CodecError> {
            let mut out = self.bytes_of(from)?;
            out.extend(self.bytes_of(to)?);
            Ok(out)
        }
        fn group_size(&self, _group_path: &str) -> Result<u64, CodecError> {
            Ok(1)
        }
    }

    #[test]
    fn evaluates_expression_with_node_reference() {
        let mut map = HashMap::new();
        map.insert("version".to_string(), Value::UInt(3));
        let ctx = FakeCtx { values: RefCell::new(map) };
        let v = evaluate("#version + 1", &ctx).unwrap();
        assert_eq!(v, Value::UInt(4));
    }

    #[test]
    fn unknown_reference_surfaces_as_error() {
        let ctx = FakeCtx { values: RefCell::new(HashMap::new()) };
        let err = evaluate("#missing", &ctx).unwrap_err();
        assert!(matches!(err, CodecError::UnknownReference { .. }));
    }

    #[test]
    fn parse_for_dependencies_yields_reference_names() {
        let e = parse_for_dependencies("crc16Between(#a,#b) + size(#g)").unwrap();
        let mut refs = Vec::new();
        e.collect_references(&mut refs);
        assert!(refs.contains(&"a".to_string()));
        assert!(refs.contains(&"b".to_string()));
        assert!(refs.contains(&"g".to_string()));
    }
}
