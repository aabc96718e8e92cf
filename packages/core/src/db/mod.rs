//! Hierarchy cache database layer
//!
//! Schema and SQL functions of the persistent hierarchy cache. The cache
//! itself ([`crate::cache::HierarchyCache`]) owns the connection; this module
//! only knows how to prepare one.
//!
//! # Architecture
//!
//! - **Physical levels** key every node shown under one parent
//!   (connection, ruleset, physical parent, removal id)
//! - **Hierarchy levels** split a physical level by virtual parent
//! - **Data sources** are one provider's contribution to a level, keyed by
//!   zero-padded index path and matched against related variables
//! - **Nodes** hang off data sources; keys and instance links live in side tables
//! - Foreign keys cascade, so deleting a level removes its whole subtree

mod functions;
mod schema;

pub use functions::{register_cache_functions, variables_match};
pub use schema::{initialize_schema, SCHEMA_VERSION};
