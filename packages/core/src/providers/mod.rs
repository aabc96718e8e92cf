//! Node Providers
//!
//! Providers produce the nodes of a hierarchy level lazily. Every provider
//! of a request lives in one [`ProviderArena`] and is addressed by
//! [`ProviderId`]; the arena dispatches on [`ProviderKind`].
//!
//! # Architecture
//!
//! - [`ProviderEnv`] - services and request inputs shared by all providers
//! - [`ProviderContext`] - where a provider sits: parent node, level, lock,
//!   specification, scoped [`ProviderFlags`]
//! - [`DataSourceProvider`] - nodes of one cached data source
//! - `Multi`, `LabelCollapse`, `SameLabelMerge` and `Finalizing` variants
//!   compose data sources into a level
//! - [`ProviderArena::create_hierarchy_level_provider`] builds a level from
//!   the cache or from the ruleset
//!
//! # Examples
//!
//! ```rust
//! use hierarchy_core::providers::{paged_count, split_page, PageOptions};
//!
//! let pages = split_page(&[4, 8, 20], PageOptions::new(10, 5));
//! assert_eq!(pages[1], PageOptions::new(6, 2));
//! assert_eq!(paged_count(8, pages[1]), 2);
//! ```

mod arena;
mod context;
mod cursor;
mod data_source;
mod factory;
mod paging;

pub use arena::{InitState, ProviderArena, ProviderId, ProviderKind, ProviderSlot};
pub use context::{ContextId, ProviderContext, ProviderEnv, ProviderFlags};
pub use cursor::NodeCursor;
pub use data_source::{DataSourceProvider, NodeSource};
pub use factory::LevelParent;
pub use paging::{paged_count, split_page, CountInfo, PageOptions};
