//! Query Builder and Grouping Resolver
//!
//! # Architecture
//!
//! - [`GroupingResolver`] turns grouping rules and specification flags into an
//!   ordered chain of [`GroupingHandler`]s
//! - [`NavigationQueryBuilder`] replays the parent's grouping ancestry, lets
//!   the remaining handlers claim select classes, and emits one union branch
//!   per claiming handler plus one for plain instances
//! - [`NodeReader`] maps result rows back into [`NavNode`](crate::models::NavNode)s
//!
//! All SQL is parameterized through [`SqlBuilder`]; count, exists and paged
//! variants wrap the same statement.

mod builder;
mod grouping;
mod reader;
mod sql;

pub use builder::{NavigationQuery, NavigationQueryBuilder, QueryBranch, QueryContext};
pub use grouping::{
    concrete_classes, distribute, specification_selects, Acceptance, GroupingHandler, GroupingResolver,
    ResolvedGrouping, SelectClass,
};
pub use reader::NodeReader;
pub use sql::SqlBuilder;
