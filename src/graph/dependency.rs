//! Dependency graph construction
//!
//! Depth-first expansion into a map keyed by cache key. A node already in
//! the map is not expanded again, which makes cyclic declarations terminate
//! and collapses diamonds into one entry per distinct node.

use std::collections::btree_map::{self, BTreeMap};
use std::sync::Arc;

use super::memoizable::{ExternalEntity, Memoizable, Props};
use super::query::{QueryPredicateExtractor, QueryPredicates};
use crate::error::{Error, Result};

/// Deduplicated set of dependency nodes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    nodes: BTreeMap<String, Memoizable>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expand `roots` and everything reachable from them.
    pub fn expand<'a>(roots: impl IntoIterator<Item = &'a Memoizable>) -> Self {
        let mut graph = Self::new();
        for root in roots {
            graph.insert_expanded(root);
        }
        graph
    }

    /// Insert `root` and its transitive dependencies.
    pub fn insert_expanded(&mut self, root: &Memoizable) {
        let mut stack = vec![root.clone()];
        while let Some(node) = stack.pop() {
            if let btree_map::Entry::Vacant(slot) = self.nodes.entry(node.cache_key().to_string()) {
                let children = node.expand();
                slot.insert(node);
                stack.extend(children.into_iter().rev());
            }
        }
    }

    /// Insert `root` and its transitive dependencies, rejecting the whole
    /// insertion if any reached node is invalid.
    pub fn try_insert_expanded(&mut self, root: &Memoizable) -> Result<()> {
        let mut added = BTreeMap::new();
        let mut stack = vec![root.clone()];
        while let Some(node) = stack.pop() {
            let key = node.cache_key();
            if self.nodes.contains_key(key) {
                continue;
            }
            if let btree_map::Entry::Vacant(slot) = added.entry(key.to_string()) {
                node.validate()?;
                let children = node.expand();
                slot.insert(node);
                stack.extend(children.into_iter().rev());
            }
        }
        self.nodes.append(&mut added);
        Ok(())
    }

    /// Union with another graph.
    pub fn merge(&mut self, other: &DependencyGraph) {
        for (key, node) in &other.nodes {
            self.nodes.entry(key.clone()).or_insert_with(|| node.clone());
        }
    }

    /// Cache keys, sorted
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.nodes.keys()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Memoizable> {
        self.nodes.values()
    }

    pub fn contains(&self, cache_key: &str) -> bool {
        self.nodes.contains_key(cache_key)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Anything accepted by [`DependencyBuilder::depends_on`]
pub enum Dependency {
    Node(Memoizable),
    Graph(DependencyGraph),
    /// Every record of an external entity kind
    Entity(Arc<dyn ExternalEntity>),
}

impl From<Memoizable> for Dependency {
    fn from(node: Memoizable) -> Self {
        Dependency::Node(node)
    }
}

impl From<&Memoizable> for Dependency {
    fn from(node: &Memoizable) -> Self {
        Dependency::Node(node.clone())
    }
}

impl From<DependencyGraph> for Dependency {
    fn from(graph: DependencyGraph) -> Self {
        Dependency::Graph(graph)
    }
}

impl From<Arc<dyn ExternalEntity>> for Dependency {
    fn from(entity: Arc<dyn ExternalEntity>) -> Self {
        Dependency::Entity(entity)
    }
}

/// Collects the dependencies a memoized call declares.
#[derive(Debug, Default)]
pub struct DependencyBuilder {
    graph: DependencyGraph,
}

impl DependencyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a dependency. Invalid nodes are rejected immediately.
    pub fn depends_on(&mut self, dependency: impl Into<Dependency>) -> Result<&mut Self> {
        match dependency.into() {
            Dependency::Node(node) => self.add_node(&node)?,
            Dependency::Graph(graph) => {
                for node in graph.nodes() {
                    node.validate()?;
                }
                self.graph.merge(&graph)
            }
            Dependency::Entity(entity) => self.add_node(&entity.class_level_memoizable())?,
        }
        Ok(self)
    }

    /// Depend on every record of `entity`.
    pub fn depends_on_entity(&mut self, entity: &dyn ExternalEntity) -> Result<&mut Self> {
        self.add_node(&entity.class_level_memoizable())?;
        Ok(self)
    }

    /// Depend on the records of `entity` matching `conditions`.
    pub fn depends_on_where(
        &mut self,
        entity: &dyn ExternalEntity,
        conditions: Props,
    ) -> Result<&mut Self> {
        self.add_node(&entity.create_memo(conditions))?;
        Ok(self)
    }

    /// Depend on whatever `query` reads, as reported by `extractor`.
    ///
    /// Each equality-condition map becomes one node; an entity with no
    /// conditions, or any entity of a query the extractor cannot express
    /// as equalities, is depended on as a whole.
    pub fn depends_on_query<Q: ?Sized>(
        &mut self,
        query: &Q,
        extractor: &dyn QueryPredicateExtractor<Q>,
    ) -> Result<&mut Self> {
        let QueryPredicates {
            cacheable,
            conditions,
        } = extractor.extract(query);

        if conditions.is_empty() {
            return Err(Error::InvalidDependency(
                "query references no entity it could depend on".to_string(),
            ));
        }

        for entry in conditions {
            if !cacheable || entry.conditions.is_empty() {
                self.depends_on_entity(entry.entity.as_ref())?;
                continue;
            }
            for condition in entry.conditions {
                self.depends_on_where(entry.entity.as_ref(), condition)?;
            }
        }
        Ok(self)
    }

    fn add_node(&mut self, node: &Memoizable) -> Result<()> {
        self.graph.try_insert_expanded(node)
    }

    pub fn is_empty(&self) -> bool {
        self.graph.is_empty()
    }

    pub fn build(self) -> DependencyGraph {
        self.graph
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::memoizable::EntityKind;
    use crate::graph::query::EntityConditions;
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn node(name: &str) -> Memoizable {
        Memoizable::new("node", [("name", name)])
    }

    #[test]
    fn test_expand_collects_transitive() {
        let d = node("d");
        let c = node("c").with_dependency(d.clone());
        let b = node("b").with_dependency(c.clone());
        let graph = DependencyGraph::expand([&b]);

        assert_eq!(graph.len(), 3);
        for n in [&b, &c, &d] {
            assert!(graph.contains(n.cache_key()));
        }
    }

    #[test]
    fn test_diamond_deduplicated() {
        let d2 = node("d2");
        let d3 = node("d3");
        let shared = node("shared");
        let d2 = d2.with_dependency(shared.clone());
        let d3 = d3.with_dependency(shared.clone());
        let d1 = node("d1")
            .with_dependency(d2.clone())
            .with_dependency(d3.clone());

        let graph = DependencyGraph::expand([&d1]);
        assert_eq!(graph.len(), 4);
        let keys: Vec<&String> = graph.keys().collect();
        let mut deduped = keys.clone();
        deduped.dedup();
        assert_eq!(keys, deduped);
    }

    #[test]
    fn test_expanded_once_per_node() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let shared = node("shared").with_expand(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Vec::new()
        });
        let a = node("a").with_dependency(shared.clone());
        let b = node("b").with_dependency(shared.clone());

        let graph = DependencyGraph::expand([&a, &b]);
        assert_eq!(graph.len(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cycle_terminates_same_set_from_any_root() {
        // a -> b -> c -> a, with expansion rebuilt by name to form the cycle
        fn cyclic(name: &'static str) -> Memoizable {
            let next = match name {
                "a" => "b",
                "b" => "c",
                _ => "a",
            };
            Memoizable::new("node", [("name", name)]).with_expand(move || vec![cyclic(next)])
        }

        let from_a = DependencyGraph::expand([&cyclic("a")]);
        let from_b = DependencyGraph::expand([&cyclic("b")]);
        let from_c = DependencyGraph::expand([&cyclic("c")]);

        assert_eq!(from_a.len(), 3);
        let keys = |g: &DependencyGraph| g.keys().cloned().collect::<Vec<_>>();
        assert_eq!(keys(&from_a), keys(&from_b));
        assert_eq!(keys(&from_b), keys(&from_c));
    }

    #[test]
    fn test_builder_merges_graphs() {
        let mut inner = DependencyBuilder::new();
        inner.depends_on(node("x")).unwrap();
        let inner = inner.build();

        let mut builder = DependencyBuilder::new();
        builder
            .depends_on(node("y"))
            .unwrap()
            .depends_on(inner)
            .unwrap()
            .depends_on(&node("x"))
            .unwrap();
        assert_eq!(builder.build().len(), 2);
    }

    #[test]
    fn test_builder_rejects_invalid_node() {
        let mut builder = DependencyBuilder::new();
        let bad = Memoizable::new("", [("id", 1)]);
        assert_matches!(builder.depends_on(bad), Err(Error::InvalidDependency(_)));
        assert!(builder.is_empty());
    }

    #[test]
    fn test_builder_rejects_invalid_nested_node() {
        let mut builder = DependencyBuilder::new();
        let entity: Arc<dyn ExternalEntity> = Arc::new(EntityKind::new("bad:name"));
        assert_matches!(builder.depends_on(entity), Err(Error::InvalidDependency(_)));
    }

    #[test]
    fn test_builder_rejects_invalid_expanded_node() {
        let mut builder = DependencyBuilder::new();
        builder.depends_on(node("existing")).unwrap();

        let hidden = Memoizable::new("", [("id", 1)]);
        let root = node("root").with_dependency(node("middle").with_dependency(hidden));
        assert_matches!(builder.depends_on(root), Err(Error::InvalidDependency(_)));

        // Nothing from the rejected declaration was kept
        let graph = builder.build();
        assert_eq!(graph.len(), 1);
        assert!(graph.contains(node("existing").cache_key()));
    }

    #[test]
    fn test_builder_rejects_graph_with_invalid_node() {
        let mut builder = DependencyBuilder::new();
        let root = node("a").with_dependency(Memoizable::new("x:y", [("id", 1)]));
        let graph = DependencyGraph::expand([&root]);
        assert_matches!(builder.depends_on(graph), Err(Error::InvalidDependency(_)));
        assert!(builder.is_empty());
    }

    #[test]
    fn test_builder_entities() {
        let users = EntityKind::new("users");
        let mut conds = Props::new();
        conds.insert("id".into(), json!(5));

        let mut builder = DependencyBuilder::new();
        builder.depends_on_where(&users, conds).unwrap();
        let graph = builder.build();

        // Condition node plus the class-level node it expands to
        assert_eq!(graph.len(), 2);
        assert!(graph.contains(users.class_level_memoizable().cache_key()));
    }

    struct FixedExtractor(QueryPredicates);

    impl QueryPredicateExtractor<str> for FixedExtractor {
        fn extract(&self, _query: &str) -> QueryPredicates {
            self.0.clone()
        }
    }

    fn users_where_id(ids: &[i64], cacheable: bool) -> FixedExtractor {
        let users: Arc<dyn ExternalEntity> = Arc::new(EntityKind::new("users"));
        FixedExtractor(QueryPredicates {
            cacheable,
            conditions: vec![EntityConditions {
                entity: users,
                conditions: ids
                    .iter()
                    .map(|id| Props::from([("id".to_string(), json!(id))]))
                    .collect(),
            }],
        })
    }

    #[test]
    fn test_query_dependency_per_condition() {
        let extractor = users_where_id(&[1, 2], true);
        let mut builder = DependencyBuilder::new();
        builder
            .depends_on_query("SELECT * FROM users WHERE id IN (1, 2)", &extractor)
            .unwrap();
        // two condition nodes + class-level
        assert_eq!(builder.build().len(), 3);
    }

    #[test]
    fn test_uncacheable_query_depends_on_whole_entity() {
        let extractor = users_where_id(&[1, 2], false);
        let mut builder = DependencyBuilder::new();
        builder
            .depends_on_query("SELECT * FROM users WHERE id > 1", &extractor)
            .unwrap();
        let graph = builder.build();
        assert_eq!(graph.len(), 1);
        assert!(graph.contains(EntityKind::new("users").class_level_memoizable().cache_key()));
    }

    #[test]
    fn test_query_without_entities_rejected() {
        let extractor = FixedExtractor(QueryPredicates {
            cacheable: true,
            conditions: Vec::new(),
        });
        let mut builder = DependencyBuilder::new();
        assert_matches!(
            builder.depends_on_query("SELECT 1", &extractor),
            Err(Error::InvalidDependency(_))
        );
    }
}
