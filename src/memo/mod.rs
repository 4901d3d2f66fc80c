//! Memoized Calls
//!
//! - [`Scope`] - per-unit-of-work caches and failure budget
//! - [`MemoFuture`] - one pending call
//! - [`Batch`] - many calls, two round trips
//! - [`Memoized`] - typed decorator producing futures
//! - [`EngineStats`] - hit/miss counters

mod batch;
mod future;
mod memoized;
mod scope;
mod stats;

pub use batch::Batch;
pub use future::{Computation, FutureHandle, MemoFuture, MethodOptions};
pub use memoized::{ComputeFn, DeclareFn, Memoized, NamedArgsFn, ReceiverFn};
pub use scope::{Scope, ScopeOptions};
pub use stats::{EngineStats, StatsSnapshot};
