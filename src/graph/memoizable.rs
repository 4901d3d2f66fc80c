//! Memoizable dependency nodes
//!
//! A node is identified by its type name and its props; props are
//! serialized canonically (keys sorted at every level) so two nodes with
//! the same props collide on the same key whatever order they were built in.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Node properties, kept sorted by name
pub type Props = BTreeMap<String, Value>;

/// Yields the nodes a node depends on
pub type ExpandFn = Arc<dyn Fn() -> Vec<Memoizable> + Send + Sync>;

/// Hex SHA-256 of `input`
pub(crate) fn hex_digest(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Deterministic JSON text for `props`.
pub(crate) fn canonical_json(props: &Props) -> String {
    let object: Map<String, Value> = props
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Value::Object(object).to_string()
}

/// A named, versioned dependency node
#[derive(Clone)]
pub struct Memoizable {
    type_name: String,
    props: Props,
    cache_key: String,
    expand: Option<ExpandFn>,
}

impl Memoizable {
    /// Build a node from a type name and props.
    pub fn new<K, V>(type_name: impl Into<String>, props: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        let props: Props = props
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::from_props(type_name, props)
    }

    pub fn from_props(type_name: impl Into<String>, props: Props) -> Self {
        let type_name = type_name.into();
        let cache_key = format!("{}:{}", type_name, hex_digest(&canonical_json(&props)));
        Self {
            type_name,
            props,
            cache_key,
            expand: None,
        }
    }

    /// Attach the function yielding this node's own dependencies.
    pub fn with_expand(mut self, expand: impl Fn() -> Vec<Memoizable> + Send + Sync + 'static) -> Self {
        self.expand = Some(Arc::new(expand));
        self
    }

    /// Add a node this one always depends on.
    pub fn with_dependency(self, dependency: Memoizable) -> Self {
        let previous = self.expand.clone();
        self.with_expand(move || {
            let mut nodes = previous.as_ref().map(|f| f()).unwrap_or_default();
            nodes.push(dependency.clone());
            nodes
        })
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn props(&self) -> &Props {
        &self.props
    }

    /// Store key holding this node's version
    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    /// Direct dependencies of this node
    pub fn expand(&self) -> Vec<Memoizable> {
        self.expand.as_ref().map(|f| f()).unwrap_or_default()
    }

    pub fn has_expand(&self) -> bool {
        self.expand.is_some()
    }

    /// Reject nodes whose key would be ambiguous.
    pub fn validate(&self) -> Result<()> {
        if self.type_name.is_empty() {
            return Err(Error::InvalidDependency(
                "dependency type name must not be empty".to_string(),
            ));
        }
        if self.type_name.contains(':') {
            return Err(Error::InvalidDependency(format!(
                "dependency type name {:?} must not contain ':'",
                self.type_name
            )));
        }
        Ok(())
    }
}

impl PartialEq for Memoizable {
    fn eq(&self, other: &Self) -> bool {
        self.cache_key == other.cache_key
    }
}

impl Eq for Memoizable {}

impl fmt::Debug for Memoizable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memoizable")
            .field("type_name", &self.type_name)
            .field("props", &self.props)
            .field("cache_key", &self.cache_key)
            .field("expands", &self.expand.is_some())
            .finish()
    }
}

// =============================================================================
// External entities
// =============================================================================

/// An external entity kind (for example a table) usable as a dependency,
/// either as a whole or restricted to records matching equality conditions.
pub trait ExternalEntity: Send + Sync {
    /// Node standing for every record of this kind
    fn class_level_memoizable(&self) -> Memoizable;

    /// Node standing for records matching `extra_props`
    fn create_memo(&self, extra_props: Props) -> Memoizable;
}

/// Entity kind identified by name. Condition nodes depend on the class-level
/// node, so invalidating the whole kind invalidates every condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityKind {
    name: String,
}

impl EntityKind {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl ExternalEntity for EntityKind {
    fn class_level_memoizable(&self) -> Memoizable {
        Memoizable::from_props(self.name.clone(), Props::new())
    }

    fn create_memo(&self, extra_props: Props) -> Memoizable {
        Memoizable::from_props(self.name.clone(), extra_props)
            .with_dependency(self.class_level_memoizable())
    }
}

// =============================================================================
// Tests
// =============================================================================
