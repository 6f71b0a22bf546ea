//! Schema-driven bit-exact binary protocol codec.
//!
//! A [`schema::Protocol`] describes a wire format as a tree of fields, groups
//! and nested sub-protocols. Given a schema and a set of caller-supplied
//! values, [`instance::Instance::encode`] finalizes the tree (expanding
//! groups, laying out bit positions), builds a dependency graph over every
//! derived/conditional expression, evaluates it in topological order, and
//! packs the result bit-exactly. [`instance::Instance::decode`] runs the
//! inverse.

pub mod bitcodec;
pub mod depgraph;
pub mod derive;
pub mod error;
pub mod expr;
pub mod instance;
pub mod schema;
pub mod tree;
pub mod value;

pub use error::{CodecError, CodecResult, Stage};
pub use instance::Instance;
pub use schema::{Protocol, Schema};
pub use value::Value;
