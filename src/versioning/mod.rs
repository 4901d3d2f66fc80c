//! Dependency Versioning
//!
//! Everything that reads or advances dependency versions.
//!
//! # Flow
//!
//! ```text
//! invalidate ──▶ TransactionStaging ──(no txn)──▶ InvalidationQueue ──▶ VersionStore (CAS)
//!                        │                               ▲
//!                        └──(txn: stage; on commit)──────┘
//! ```

mod local;
mod queue;
mod transaction;
mod version_store;

pub use local::LocalVersions;
pub use queue::{DrainReport, InvalidationQueue, Task};
pub use transaction::{
    BumpDisposition, ManualTransactions, NoTransactions, TransactionCoordinator,
    TransactionHook, TransactionId, TransactionStaging,
};
pub use version_store::{new_version, Version, VersionStore};
