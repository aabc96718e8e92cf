//! Persistent Hierarchy Cache
//!
//! Stores materialized hierarchy levels, their data sources and nodes so a
//! level is populated at most once per (ruleset, parent, related variables).
//!
//! # Architecture
//!
//! - [`HierarchyCache`] owns one SQLite connection behind a mutex
//! - [`CacheSavepoint`] holds that connection for the duration of a write
//!   batch; dropping it uncommitted rolls the batch back
//! - [`QuickNodeCache`] keeps recently read nodes in memory
//! - [`HierarchyLevelLock`] / [`LockPolicy`] serialize population of a level,
//!   and [`get_result_or_lock`] packages the read-wait-lock-reread pattern
//!
//! # Invalidation
//!
//! - **Variables**: a data source records the variables it read; it is reused
//!   only for requests that agree on them
//! - **Removal ids**: superseded physical levels are marked, ignored by
//!   lookups, and deleted in one cascade
//! - **Clear**: every level of a ruleset is dropped

mod hierarchy_cache;
mod lock;
mod quick;
mod savepoint;

pub use hierarchy_cache::{CacheStats, CachedNode, HierarchyCache, NodeVisibility};
pub use lock::{get_result_or_lock, HierarchyLevelLock, LockPolicy, LockRegistry};
pub use quick::QuickNodeCache;
pub use savepoint::CacheSavepoint;
