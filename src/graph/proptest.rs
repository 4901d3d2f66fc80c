//! Property-Based Tests for Dependency Nodes and Graphs
//!
//! # Test Properties
//!
//! 1. **Order Independence**: the cache key ignores prop insertion order
//! 2. **Injectivity**: different prop values give different cache keys
//! 3. **Cycle Safety**: expanding a ring of nodes terminates with the same
//!    node set from every root

#![cfg(test)]

use proptest::prelude::*;
use serde_json::Value;

use super::dependency::DependencyGraph;
use super::memoizable::Memoizable;

// =============================================================================
// Property Strategies
// =============================================================================

/// Distinct prop names with integer or string values.
fn props_strategy() -> impl Strategy<Value = Vec<(String, Value)>> {
    prop::collection::btree_map(
        "[a-z]{1,8}",
        prop_oneof![
            any::<i64>().prop_map(Value::from),
            "[a-zA-Z0-9 ]{0,12}".prop_map(Value::from),
            any::<bool>().prop_map(Value::from),
        ],
        1..8,
    )
    .prop_map(|m| m.into_iter().collect())
}

fn ring(size: usize, start: usize) -> Memoizable {
    let next = (start + 1) % size;
    Memoizable::new("ring", [("i", start as i64)]).with_expand(move || vec![ring(size, next)])
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_cache_key_order_independent(props in props_strategy(), seed in any::<u64>()) {
        let mut shuffled = props.clone();
        // deterministic rotation stands in for an arbitrary insertion order
        let len = shuffled.len();
        shuffled.rotate_left((seed as usize) % len);
        shuffled.reverse();

        let a = Memoizable::new("t", props);
        let b = Memoizable::new("t", shuffled);
        prop_assert_eq!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn prop_cache_key_distinguishes_values(id_a in any::<i64>(), id_b in any::<i64>()) {
        prop_assume!(id_a != id_b);
        let a = Memoizable::new("t", [("id", id_a)]);
        let b = Memoizable::new("t", [("id", id_b)]);
        prop_assert_ne!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn prop_cycle_expansion_root_independent(size in 1usize..20, root in 0usize..20) {
        let root = root % size;
        let from_zero = DependencyGraph::expand([&ring(size, 0)]);
        let from_root = DependencyGraph::expand([&ring(size, root)]);

        prop_assert_eq!(from_zero.len(), size);
        prop_assert_eq!(
            from_zero.keys().collect::<Vec<_>>(),
            from_root.keys().collect::<Vec<_>>()
        );
    }
}
