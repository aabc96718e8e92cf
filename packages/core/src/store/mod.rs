//! Relational instance store
//!
//! The store holds the records hierarchies are built from: instances (with a
//! class, a display label and JSON properties) and relationships between
//! them. Generated navigation queries run against it through
//! [`InstanceStore::query_map`], which counts every executed statement and
//! polls the request's cancellation token per row.

mod functions;
mod instance_store;

pub use functions::{register_store_functions, sorting_value};
pub use instance_store::{to_sql_value, InstanceStore};
