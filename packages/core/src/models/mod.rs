//! Data Models
//!
//! Plain data shared by every layer of the engine:
//!
//! - [`NavNode`] / [`NodeKey`] - materialized hierarchy rows and their identity
//! - [`RulesetVariables`] / [`TrackedVariables`] - rule inputs and usage tracking
//! - Cache identifiers for hierarchy levels and data sources
//! - Resolved rule types consumed from a [`RulesLookup`](crate::lookup::RulesLookup)

mod identifiers;
mod node;
mod rules;
mod variables;

pub use identifiers::{
    format_full_index, parts, CombinedHierarchyLevelIdentifier, DataSourceClass,
    DataSourceCustomData, DataSourceIdentifier, DataSourceInfo, HierarchyLevelIdentifier, PageCount,
};
pub use node::{HasChildren, NavNode, NodeExtendedData, NodeKey, NodeKind};
pub use rules::{
    ArtifactRule, ChildNodeSpecification, ChildrenHint, CustomizationKind, CustomizationRule,
    GroupSpecification, GroupingRule, NodeRule, PropertyGroupingValue, PropertyRange, RelationshipDirection,
    RulesetDefinition, SameLabelStage, SortingRule, SpecificationKind,
};
pub use variables::{RulesetVariables, TrackedVariables};
