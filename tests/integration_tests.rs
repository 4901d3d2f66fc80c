//! verscache Integration Tests
//!
//! End-to-end scenarios against in-memory nodes:
//! - Memoization and invalidation
//! - Dependency graphs (diamonds, queries)
//! - Batching round-trip bounds
//! - Transaction staging (commit / rollback visibility)
//! - Fail-open behaviour under backing-store outage

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};

use verscache::memo::Computation;
use verscache::{DependencyGraph, Engine, EngineConfig, InMemoryNode, MemoFuture, Memoizable, ShardedStore};

fn engine_on(node: &Arc<InMemoryNode>) -> Engine {
    Engine::new(ShardedStore::single(node.clone())).unwrap()
}

fn counting(calls: &Arc<AtomicUsize>, value: Value) -> Computation {
    let calls = calls.clone();
    Box::new(move || {
        Box::pin(async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(value)
        })
    })
}

fn dep(id: &str) -> Memoizable {
    Memoizable::new("dep", [("id", id)])
}

// =============================================================================
// Memoization
// =============================================================================

mod memoization_tests {
    use super::*;

    fn calc(calls: &Arc<AtomicUsize>) -> MemoFuture {
        MemoFuture::new(
            "calc",
            json!([]),
            DependencyGraph::expand([&dep("d")]),
            counting(calls, json!("result")),
        )
    }

    #[tokio::test]
    async fn test_calc_computed_once_until_invalidated() {
        let node = Arc::new(InMemoryNode::new("n"));
        let engine = engine_on(&node);
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let scope = engine.scope();
            assert_eq!(engine.call(&scope, calc(&calls)).await.unwrap(), json!("result"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        engine.invalidate(&engine.scope(), &[dep("d")]).await.unwrap();

        for _ in 0..5 {
            let scope = engine.scope();
            engine.call(&scope, calc(&calls)).await.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_same_scope_served_locally() {
        let node = Arc::new(InMemoryNode::new("n"));
        let engine = engine_on(&node);
        let calls = Arc::new(AtomicUsize::new(0));
        let scope = engine.scope();

        engine.call(&scope, calc(&calls)).await.unwrap();
        let before = node.stats();
        engine.call(&scope, calc(&calls)).await.unwrap();
        let after = node.stats();

        assert_eq!(before.reads, after.reads);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_other_process_sees_invalidation() {
        let node = Arc::new(InMemoryNode::new("n"));
        let writer = engine_on(&node);
        let reader = engine_on(&node);
        let calls = Arc::new(AtomicUsize::new(0));

        reader.call(&reader.scope(), calc(&calls)).await.unwrap();
        reader.call(&reader.scope(), calc(&calls)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        writer.invalidate(&writer.scope(), &[dep("d")]).await.unwrap();
        reader.call(&reader.scope(), calc(&calls)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unrelated_invalidation_keeps_results() {
        let node = Arc::new(InMemoryNode::new("n"));
        let engine = engine_on(&node);
        let calls = Arc::new(AtomicUsize::new(0));

        engine.call(&engine.scope(), calc(&calls)).await.unwrap();
        engine.invalidate(&engine.scope(), &[dep("other")]).await.unwrap();
        engine.call(&engine.scope(), calc(&calls)).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_global_cache_version_orphans_results() {
        let node = Arc::new(InMemoryNode::new("n"));
        let v1 = engine_on(&node);
        let v2 = Engine::builder(ShardedStore::single(node.clone()))
            .config(EngineConfig::new().with_global_cache_version("2"))
            .build()
            .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        v1.call(&v1.scope(), calc(&calls)).await.unwrap();
        v2.call(&v2.scope(), calc(&calls)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}

// =============================================================================
// Dependency graphs
// =============================================================================

mod graph_tests {
    use super::*;
    use verscache::graph::{EntityConditions, Props, QueryPredicates};
    use verscache::{EntityKind, ExternalEntity, Memoized, QueryPredicateExtractor};

    #[tokio::test]
    async fn test_diamond_versions_fetched_once() {
        let node = Arc::new(InMemoryNode::new("n"));
        let engine = engine_on(&node);

        let shared = dep("shared");
        let d2 = dep("d2").with_dependency(shared.clone());
        let d3 = dep("d3").with_dependency(shared.clone());
        let d1 = dep("d1").with_dependency(d2).with_dependency(d3);

        let calls = Arc::new(AtomicUsize::new(0));
        let future = MemoFuture::new(
            "diamond",
            json!([]),
            DependencyGraph::expand([&d1]),
            counting(&calls, json!(1)),
        );
        engine.call(&engine.scope(), future).await.unwrap();

        // One version read of the four distinct nodes, one result read
        let stats = node.stats();
        assert_eq!(stats.reads, 2);
        assert_eq!(stats.keys_read, 4 + 1);
    }

    #[tokio::test]
    async fn test_invalidating_shared_dependency_reaches_dependents() {
        let node = Arc::new(InMemoryNode::new("n"));
        let engine = engine_on(&node);
        let shared = dep("shared");
        let top = dep("top").with_dependency(dep("mid").with_dependency(shared.clone()));

        let calls = Arc::new(AtomicUsize::new(0));
        let call = || {
            MemoFuture::new(
                "top",
                json!([]),
                DependencyGraph::expand([&top]),
                counting(&calls, json!(1)),
            )
        };

        engine.call(&engine.scope(), call()).await.unwrap();
        engine.invalidate(&engine.scope(), &[shared]).await.unwrap();
        engine.call(&engine.scope(), call()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    /// Pretends every query is `WHERE id = <query>`.
    struct IdQuery {
        users: Arc<dyn ExternalEntity>,
    }

    impl QueryPredicateExtractor<i64> for IdQuery {
        fn extract(&self, id: &i64) -> QueryPredicates {
            QueryPredicates {
                cacheable: true,
                conditions: vec![EntityConditions {
                    entity: self.users.clone(),
                    conditions: vec![Props::from([("id".to_string(), json!(id))])],
                }],
            }
        }
    }

    #[tokio::test]
    async fn test_query_dependency_invalidation() {
        let node = Arc::new(InMemoryNode::new("n"));
        let engine = engine_on(&node);
        let users: Arc<dyn ExternalEntity> = Arc::new(EntityKind::new("users"));
        let extractor = Arc::new(IdQuery {
            users: users.clone(),
        });

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let find: Memoized<(), i64, String> = Memoized::new("find_user", move |_: &(), id: &i64| {
            let counter = counter.clone();
            let name = format!("user-{}", id);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(name)
            })
        })
        .depends_on(move |b, _, id| {
            b.depends_on_query(id, extractor.as_ref())?;
            Ok(())
        });

        let user_5 = users.create_memo(Props::from([("id".to_string(), json!(5))]));

        find.call(&engine, &engine.scope(), &(), &5).await.unwrap();
        find.call(&engine, &engine.scope(), &(), &6).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Row-level invalidation touches only id 5
        engine.invalidate(&engine.scope(), &[user_5]).await.unwrap();
        find.call(&engine, &engine.scope(), &(), &5).await.unwrap();
        find.call(&engine, &engine.scope(), &(), &6).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Class-level invalidation touches every row
        engine
            .invalidate(&engine.scope(), &[users.class_level_memoizable()])
            .await
            .unwrap();
        find.call(&engine, &engine.scope(), &(), &5).await.unwrap();
        find.call(&engine, &engine.scope(), &(), &6).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }
}

// =============================================================================
// Version store
// =============================================================================

mod version_tests {
    use super::*;
    use verscache::versioning::VersionStore;

    #[tokio::test]
    async fn test_concurrent_bump_race() {
        let node = Arc::new(InMemoryNode::new("n"));
        let versions = VersionStore::new(Arc::new(ShardedStore::single(node.clone())), None);
        versions.bump_version("k", "original", "").await.unwrap();

        let (a, b) = tokio::join!(
            versions.bump_version("k", "desired-a", "original"),
            versions.bump_version("k", "desired-b", "original"),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        let winners = [a == "desired-a", b == "desired-b"];
        assert_eq!(winners.iter().filter(|w| **w).count(), 1);

        let last = node.peek("k").unwrap();
        assert_ne!(last, "original");
        let loser_desired = if a == "desired-a" { "desired-b" } else { "desired-a" };
        assert_ne!(last, loser_desired);
    }

    #[tokio::test]
    async fn test_expired_version_does_not_resurrect_results() {
        let node = Arc::new(InMemoryNode::new("n"));
        let engine = Engine::builder(ShardedStore::single(node.clone()))
            .config(EngineConfig::new().with_version_ttl(std::time::Duration::from_millis(20)))
            .build()
            .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let call = || {
            MemoFuture::new(
                "calc",
                json!([]),
                DependencyGraph::expand([&dep("d")]),
                counting(&calls, json!(1)),
            )
        };

        engine.call(&engine.scope(), call()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(40)).await;
        engine.call(&engine.scope(), call()).await.unwrap();

        // Version expired and was re-initialised to a fresh token
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}

// =============================================================================
// Batching
// =============================================================================

mod batch_tests {
    use super::*;

    fn shared_deps() -> DependencyGraph {
        DependencyGraph::expand([&dep("a"), &dep("b"), &dep("c")])
    }

    #[tokio::test]
    async fn test_one_version_and_one_result_round_trip() {
        let node = Arc::new(InMemoryNode::new("n"));
        // Version initialisation of the cold store runs in the background
        let engine = Engine::builder(ShardedStore::single(node.clone()))
            .config(EngineConfig::new().with_executor(tokio::runtime::Handle::current()))
            .build()
            .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let scope = engine.scope();
        let mut batch = engine.batch(&scope).unwrap();
        let handles: Vec<_> = (0..10)
            .map(|i| {
                batch.add(MemoFuture::new(
                    format!("m{}", i),
                    json!([i]),
                    shared_deps(),
                    counting(&calls, json!(i)),
                ))
            })
            .collect();
        let results = tokio_test::assert_ok!(batch.execute().await);

        let stats = node.stats();
        assert_eq!(stats.reads, 2);
        assert_eq!(stats.evals + stats.eval_shas, 0);
        assert_eq!(results.len(), 10);
        for (i, handle) in handles.iter().enumerate() {
            assert_eq!(handle.value().unwrap(), json!(i));
        }
    }

    #[tokio::test]
    async fn test_mid_batch_invalidation_uses_snapshot() {
        let node = Arc::new(InMemoryNode::new("n"));
        let engine = Arc::new(engine_on(&node));
        let reads = Arc::new(AtomicUsize::new(0));
        let reader = || {
            MemoFuture::new(
                "reader",
                json!([]),
                DependencyGraph::expand([&dep("d")]),
                counting(&reads, json!("read")),
            )
        };

        // Cached before the batch
        engine.call(&engine.scope(), reader()).await.unwrap();
        assert_eq!(reads.load(Ordering::SeqCst), 1);

        let invalidator = {
            let engine = engine.clone();
            MemoFuture::new(
                "writer",
                json!([]),
                DependencyGraph::expand([&dep("d")]),
                Box::new(move || {
                    Box::pin(async move {
                        engine.invalidate(&engine.scope(), &[dep("d")]).await?;
                        Ok(json!("wrote"))
                    })
                }),
            )
        };

        let scope = engine.scope();
        let mut batch = engine.batch(&scope).unwrap();
        let w = batch.add(invalidator);
        let r = batch.add(reader());
        batch.execute().await.unwrap();

        // The reader resolved against the versions read when the batch ran
        assert_eq!(w.value().unwrap(), json!("wrote"));
        assert_eq!(r.value().unwrap(), json!("read"));
        assert_eq!(reads.load(Ordering::SeqCst), 1);

        // Later calls see the bump
        engine.call(&engine.scope(), reader()).await.unwrap();
        assert_eq!(reads.load(Ordering::SeqCst), 2);
    }
}

// =============================================================================
// Transactions
// =============================================================================

mod transaction_tests {
    use super::*;
    use verscache::ManualTransactions;

    struct Fixture {
        tx: Arc<ManualTransactions>,
        inside: Engine,
        outside: Engine,
        generation: Arc<AtomicUsize>,
    }

    fn setup() -> Fixture {
        let node = Arc::new(InMemoryNode::new("n"));
        let tx = Arc::new(ManualTransactions::new());
        let inside = Engine::builder(ShardedStore::single(node.clone()))
            .coordinator(tx.clone())
            .build()
            .unwrap();
        Fixture {
            tx,
            inside,
            outside: engine_on(&node),
            generation: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns the generation current when it ran.
    fn snapshot(generation: &Arc<AtomicUsize>) -> MemoFuture {
        let generation = generation.clone();
        MemoFuture::new(
            "snapshot",
            json!([]),
            DependencyGraph::expand([&dep("row")]),
            Box::new(move || {
                Box::pin(async move { Ok(json!(generation.load(Ordering::SeqCst))) })
            }),
        )
    }

    /// The snapshot as seen by a new scope of the transactional engine.
    async fn fresh_call(f: &Fixture) -> Value {
        f.inside.call(&f.inside.scope(), snapshot(&f.generation)).await.unwrap()
    }

    #[tokio::test]
    async fn test_staged_version_visible_in_process_only() {
        let f = setup();
        let old = f.outside.call(&f.outside.scope(), snapshot(&f.generation)).await.unwrap();
        assert_eq!(old, json!(0));

        f.tx.begin().unwrap();
        f.generation.store(1, Ordering::SeqCst);
        let scope = f.inside.scope();
        f.inside.invalidate(&scope, &[dep("row")]).await.unwrap();

        assert_eq!(f.inside.call(&scope, snapshot(&f.generation)).await.unwrap(), json!(1));
        assert_eq!(
            f.inside.call(&f.inside.scope(), snapshot(&f.generation)).await.unwrap(),
            json!(1)
        );
        assert_eq!(
            f.outside.call(&f.outside.scope(), snapshot(&f.generation)).await.unwrap(),
            json!(0)
        );
        f.tx.rollback().await;
    }

    #[tokio::test]
    async fn test_rollback_discards_staged_results() {
        let f = setup();
        f.outside.call(&f.outside.scope(), snapshot(&f.generation)).await.unwrap();

        f.tx.begin().unwrap();
        f.generation.store(1, Ordering::SeqCst);
        let scope = f.inside.scope();
        f.inside.invalidate(&scope, &[dep("row")]).await.unwrap();
        f.inside.call(&scope, snapshot(&f.generation)).await.unwrap();
        f.tx.rollback().await;

        assert_eq!(
            f.outside.call(&f.outside.scope(), snapshot(&f.generation)).await.unwrap(),
            json!(0)
        );
        assert_eq!(f.inside.call(&scope, snapshot(&f.generation)).await.unwrap(), json!(0));
        assert!(f.inside.queue().is_empty());
    }

    #[tokio::test]
    async fn test_commit_publishes_staged_results() {
        let f = setup();
        f.outside.call(&f.outside.scope(), snapshot(&f.generation)).await.unwrap();

        f.tx.begin().unwrap();
        f.generation.store(1, Ordering::SeqCst);
        let scope = f.inside.scope();
        f.inside.invalidate(&scope, &[dep("row")]).await.unwrap();
        f.inside.call(&scope, snapshot(&f.generation)).await.unwrap();
        f.tx.commit().await;

        // Committed version equals the staged one, so the value written
        // inside the transaction is served as is
        f.generation.store(2, Ordering::SeqCst);
        assert_eq!(
            f.outside.call(&f.outside.scope(), snapshot(&f.generation)).await.unwrap(),
            json!(1)
        );
    }

    #[tokio::test]
    async fn test_other_transaction_never_sees_rolled_back_results() {
        let f = setup();
        assert_eq!(fresh_call(&f).await, json!(0));

        let writer = f.tx.begin().unwrap();
        f.generation.store(1, Ordering::SeqCst);
        let scope = f.inside.scope();
        f.inside.invalidate(&scope, &[dep("row")]).await.unwrap();
        assert_eq!(f.inside.call(&scope, snapshot(&f.generation)).await.unwrap(), json!(1));
        f.tx.suspend();

        // Same engine, a different transaction
        let reader = f.tx.begin().unwrap();
        assert_eq!(fresh_call(&f).await, json!(0));
        f.tx.suspend();

        // Same engine, no transaction
        assert_eq!(fresh_call(&f).await, json!(0));

        f.tx.resume(writer).unwrap();
        f.tx.rollback().await;

        f.tx.resume(reader).unwrap();
        assert_eq!(fresh_call(&f).await, json!(0));
        f.tx.commit().await;
        assert_eq!(fresh_call(&f).await, json!(0));
    }

    #[tokio::test]
    async fn test_interleaved_transactions_commit_independently() {
        let f = setup();
        let keys = vec![dep("row").cache_key().to_string(), dep("other").cache_key().to_string()];

        let first = f.tx.begin().unwrap();
        f.inside.invalidate(&f.inside.scope(), &[dep("row")]).await.unwrap();
        f.tx.suspend();

        let second = f.tx.begin().unwrap();
        f.inside.invalidate(&f.inside.scope(), &[dep("other")]).await.unwrap();
        f.tx.suspend();

        f.tx.resume(first).unwrap();
        f.tx.rollback().await;
        f.tx.resume(second).unwrap();
        f.tx.commit().await;

        let versions = f.outside.versions().get_versions(&keys).await.unwrap();
        assert!(!versions.contains_key(&keys[0]));
        assert!(versions.contains_key(&keys[1]));
        assert!(f.inside.queue().is_empty());
    }
}

// =============================================================================
// Fail-open
// =============================================================================

mod outage_tests {
    use super::*;

    fn calc(calls: &Arc<AtomicUsize>) -> MemoFuture {
        MemoFuture::new(
            "calc",
            json!([]),
            DependencyGraph::expand([&dep("d")]),
            counting(calls, json!("fresh")),
        )
    }

    #[tokio::test]
    async fn test_outage_degrades_to_fresh_computation() {
        let node = Arc::new(InMemoryNode::new("n"));
        let engine = engine_on(&node);
        let calls = Arc::new(AtomicUsize::new(0));
        let scope = engine.scope();

        node.set_down(true);
        for _ in 0..5 {
            assert_eq!(engine.call(&scope, calc(&calls)).await.unwrap(), json!("fresh"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(scope.is_bypassed());
        assert_eq!(scope.failures(), engine.config().max_connection_attempts);

        // A new scope tries the store again
        node.set_down(false);
        let scope = engine.scope();
        engine.call(&scope, calc(&calls)).await.unwrap();
        engine.call(&engine.scope(), calc(&calls)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_batch_during_outage() {
        let node = Arc::new(InMemoryNode::new("n"));
        let engine = engine_on(&node);
        let calls = Arc::new(AtomicUsize::new(0));
        node.set_down(true);

        let scope = engine.scope();
        let mut batch = engine.batch(&scope).unwrap();
        batch.add(calc(&calls));
        batch.add(calc(&calls));
        let results = batch.execute().await.unwrap();

        assert_eq!(results, vec![json!("fresh"), json!("fresh")]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidation_survives_outage() {
        let node = Arc::new(InMemoryNode::new("n"));
        let engine = engine_on(&node);
        let calls = Arc::new(AtomicUsize::new(0));
        engine.call(&engine.scope(), calc(&calls)).await.unwrap();

        node.set_down(true);
        engine.invalidate(&engine.scope(), &[dep("d")]).await.unwrap();
        assert_eq!(engine.queue().len(), 1);

        node.set_down(false);
        tokio_test::assert_ok!(engine.drain().await);
        engine.call(&engine.scope(), calc(&calls)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_transient_blip_on_one_read() {
        let node = Arc::new(InMemoryNode::new("n"));
        let engine = engine_on(&node);
        let calls = Arc::new(AtomicUsize::new(0));
        engine.call(&engine.scope(), calc(&calls)).await.unwrap();

        node.fail_next(1);
        let scope = engine.scope();
        engine.call(&scope, calc(&calls)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(scope.failures(), 1);
        assert!(!scope.is_bypassed());
    }
}

// =============================================================================
// Sharding
// =============================================================================

mod sharding_tests {
    use super::*;
    use verscache::{KvNode, Shard};

    #[tokio::test]
    async fn test_calls_across_shards() {
        let nodes: Vec<Arc<InMemoryNode>> = (0..3)
            .map(|i| Arc::new(InMemoryNode::new(format!("node-{}", i))))
            .collect();
        let shards = nodes
            .iter()
            .map(|n| Shard::new(n.clone() as Arc<dyn KvNode>))
            .collect();
        let engine = Engine::new(ShardedStore::new(shards).unwrap()).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let deps: Vec<Memoizable> = (0..20).map(|i| dep(&i.to_string())).collect();
        let call = || {
            MemoFuture::new(
                "wide",
                json!([]),
                DependencyGraph::expand(&deps),
                counting(&calls, json!(1)),
            )
        };

        engine.call(&engine.scope(), call()).await.unwrap();
        engine.call(&engine.scope(), call()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stored: usize = nodes.iter().map(|n| n.len()).sum();
        assert_eq!(stored, 20 + 1);
        assert!(nodes.iter().filter(|n| !n.is_empty()).count() > 1);

        engine.invalidate(&engine.scope(), &[dep("7")]).await.unwrap();
        engine.call(&engine.scope(), call()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
