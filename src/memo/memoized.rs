//! Typed memoization decorator
//!
//! Wraps a computation with its dependency declaration:
//!
//! ```ignore
//! let posts = Memoized::new("User#posts", |user: &User, limit: &u32| {
//!     let (id, limit) = (user.id, *limit);
//!     Box::pin(async move { load_posts(id, limit).await })
//! })
//! .receiver_id(|user| user.id.to_string())
//! .depends_on(|b, user, _limit| {
//!     b.depends_on(Memoizable::new("user", [("id", user.id)]))?;
//!     Ok(())
//! })
//! .named_args(|_limit| Value::Null);
//!
//! let page = posts.call(&engine, &scope, &user, &10).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::future::{Computation, MemoFuture, MethodOptions};
use super::scope::Scope;
use crate::engine::Engine;
use crate::error::Result;
use crate::graph::DependencyBuilder;

pub type DeclareFn<R, A> = Arc<dyn Fn(&mut DependencyBuilder, &R, &A) -> Result<()> + Send + Sync>;
pub type NamedArgsFn<A> = Arc<dyn Fn(&A) -> Value + Send + Sync>;
pub type ReceiverFn<R> = Arc<dyn Fn(&R) -> String + Send + Sync>;
pub type ComputeFn<R, A, T> =
    Arc<dyn Fn(&R, &A) -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>;

/// A memoized method of receiver `R` taking arguments `A` and returning `T`
pub struct Memoized<R, A, T> {
    method_id: String,
    receiver: Option<ReceiverFn<R>>,
    declare: Option<DeclareFn<R, A>>,
    named_args: Option<NamedArgsFn<A>>,
    compute: ComputeFn<R, A, T>,
    options: MethodOptions,
}

impl<R, A, T> Memoized<R, A, T>
where
    A: Serialize,
    T: Serialize + DeserializeOwned + Send + 'static,
{
    /// Without a dependency declaration the method is pure: cached on its
    /// arguments alone and never invalidated.
    pub fn new(
        method_id: impl Into<String>,
        compute: impl Fn(&R, &A) -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            method_id: method_id.into(),
            receiver: None,
            declare: None,
            named_args: None,
            compute: Arc::new(compute),
            options: MethodOptions::default(),
        }
    }

    /// Identity of the receiver, part of every key.
    pub fn receiver_id(mut self, f: impl Fn(&R) -> String + Send + Sync + 'static) -> Self {
        self.receiver = Some(Arc::new(f));
        self
    }

    pub fn depends_on(
        mut self,
        f: impl Fn(&mut DependencyBuilder, &R, &A) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.declare = Some(Arc::new(f));
        self
    }

    /// The arguments the dependency declaration actually reads. Enables the
    /// scope's dependency-extraction cache for this method; calls agreeing on
    /// receiver and named arguments share one graph.
    pub fn named_args(mut self, f: impl Fn(&A) -> Value + Send + Sync + 'static) -> Self {
        self.named_args = Some(Arc::new(f));
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.options.ttl = Some(ttl);
        self
    }

    pub fn validation_sample_pct(mut self, pct: f64) -> Self {
        self.options.validation_sample_pct = Some(pct);
        self
    }

    pub fn method_id(&self) -> &str {
        &self.method_id
    }

    /// Build the pending call, e.g. for a [`Batch`](super::Batch).
    pub fn future(&self, scope: &Scope, receiver: &R, args: &A) -> Result<MemoFuture> {
        let receiver_id = self.receiver.as_ref().map(|f| f(receiver)).unwrap_or_default();
        let args_json = serde_json::to_value(args)?;

        let pending = (self.compute)(receiver, args);
        let computation: Computation = Box::new(move || {
            Box::pin(async move {
                let value = pending.await?;
                Ok(serde_json::to_value(value)?)
            })
        });

        let future = match &self.declare {
            None => MemoFuture::pure(self.method_id.clone(), args_json, computation),
            Some(declare) => {
                let graph = match &self.named_args {
                    Some(named) => {
                        let call_key = format!("{}:{}:{}", self.method_id, receiver_id, named(args));
                        match scope.cached_dependencies(&call_key) {
                            Some(graph) => graph,
                            None => {
                                let mut builder = DependencyBuilder::new();
                                declare(&mut builder, receiver, args)?;
                                let graph = builder.build();
                                scope.remember_dependencies(call_key, &graph);
                                graph
                            }
                        }
                    }
                    None => {
                        let mut builder = DependencyBuilder::new();
                        declare(&mut builder, receiver, args)?;
                        builder.build()
                    }
                };
                MemoFuture::new(self.method_id.clone(), args_json, graph, computation)
            }
        };

        Ok(future
            .with_receiver(receiver_id)
            .with_options(self.options.clone()))
    }

    /// Run one memoized call.
    pub async fn call(&self, engine: &Engine, scope: &Scope, receiver: &R, args: &A) -> Result<T> {
        let future = self.future(scope, receiver, args)?;
        let value = engine.call(scope, future).await?;
        Ok(serde_json::from_value(value)?)
    }
}

// =============================================================================
// Tests
// =============================================================================
