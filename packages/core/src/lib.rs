//! Hierarchy Core - rule-driven hierarchy materialization
//!
//! This crate turns a ruleset (which classes to show, how to group them, what
//! to hide) and an instance store into a navigable tree of nodes, one level
//! at a time, and keeps every materialized level in a persistent cache.
//!
//! # Architecture
//!
//! - **Lazy levels**: a level is only built when someone asks for it
//! - **Write once**: each level is populated at most once per combination of
//!   ruleset, parent and the variables its rules actually read
//! - **SQLite throughout**: instances and the cache both live in SQLite via
//!   `rusqlite`; navigation queries are plain parameterized SQL
//! - **Index arena**: providers of one request live in a
//!   [`ProviderArena`](providers::ProviderArena) and refer to each other by index
//!
//! # Modules
//!
//! - [`models`] - Nodes, keys, rule types, variables and cache identities
//! - [`lookup`] - Schema, ruleset and expression collaborator traits
//! - [`store`] - Instance store the navigation queries run against
//! - [`db`] - Cache schema and SQL functions
//! - [`cache`] - Hierarchy cache, savepoints and level locks
//! - [`query`] - Grouping resolution and navigation query building
//! - [`providers`] - Node providers and the hierarchy level factory
//! - [`finalizer`] - Children determination and customization
//! - [`post_process`] - Label collapse and same-label merge
//! - [`hierarchy`] - [`HierarchyManager`] request entry point

pub mod cache;
pub mod cancel;
pub mod config;
pub mod db;
pub mod error;
pub mod finalizer;
pub mod hierarchy;
pub mod logging;
pub mod lookup;
pub mod models;
pub mod post_process;
pub mod providers;
pub mod query;
pub mod store;

// Re-export commonly used types
pub use cache::{CacheStats, HierarchyCache};
pub use cancel::CancellationToken;
pub use config::HierarchyConfig;
pub use error::{HierarchyError, Result};
pub use hierarchy::{HierarchyManager, HierarchyRequest};
pub use models::{HasChildren, NavNode, NodeKey, NodeKind, RulesetVariables};
pub use providers::PageOptions;
