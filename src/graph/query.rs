//! Query predicate dependencies
//!
//! The query layer inspects a structured query and reports, per entity kind,
//! the equality conditions it filters on. Each condition map becomes one
//! dependency node.

use std::fmt;
use std::sync::Arc;

use super::memoizable::{ExternalEntity, Props};

/// Equality conditions a query applies to one entity kind
#[derive(Clone)]
pub struct EntityConditions {
    pub entity: Arc<dyn ExternalEntity>,
    /// One map per disjunct, column name to value
    pub conditions: Vec<Props>,
}

impl fmt::Debug for EntityConditions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityConditions")
            .field("entity", &self.entity.class_level_memoizable().type_name())
            .field("conditions", &self.conditions)
            .finish()
    }
}

/// Predicates extracted from one query
#[derive(Debug, Clone)]
pub struct QueryPredicates {
    /// False when the query cannot be reduced to equality conditions
    pub cacheable: bool,
    pub conditions: Vec<EntityConditions>,
}

/// Turns an opaque query into the equality conditions it depends on.
pub trait QueryPredicateExtractor<Q: ?Sized>: Send + Sync {
    fn extract(&self, query: &Q) -> QueryPredicates;
}
