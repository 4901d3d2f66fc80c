//! Dependency Graph
//!
//! Pure data and traversal, no I/O.
//!
//! - [`Memoizable`] - a versioned dependency node
//! - [`DependencyGraph`] - deduplicated, cycle-safe expansion of nodes
//! - [`DependencyBuilder`] - what dependency declarations write into
//! - [`QueryPredicateExtractor`] - bridge from the query layer

mod dependency;
mod memoizable;
mod proptest;
mod query;

pub use dependency::{Dependency, DependencyBuilder, DependencyGraph};
pub use memoizable::{EntityKind, ExpandFn, ExternalEntity, Memoizable, Props};
pub use query::{EntityConditions, QueryPredicateExtractor, QueryPredicates};

pub(crate) use memoizable::{canonical_json, hex_digest};
