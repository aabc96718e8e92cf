//! External collaborator interfaces
//!
//! The engine consumes three narrow services:
//!
//! - [`SchemaLookup`] - entity classes, inheritance and relationship classes
//! - [`RulesLookup`] - resolved rules of one ruleset
//! - [`ExpressionEvaluator`] - boolean/value expressions for conditions,
//!   hide rules, customization and artifacts
//!
//! In-memory implementations ([`SchemaCatalog`], [`Ruleset`],
//! [`SimpleExpressionEvaluator`]) back tests and embedders that have no richer
//! source.

mod catalog;
mod evaluator;
mod ruleset;

pub use catalog::{ClassInfo, RelationshipClassInfo, SchemaCatalog};
pub use evaluator::SimpleExpressionEvaluator;
pub use ruleset::Ruleset;

use crate::error::Result;
use crate::models::{
    ArtifactRule, CustomizationRule, GroupingRule, NavNode, NodeRule, SortingRule,
    TrackedVariables,
};
use serde_json::Value;

/// Metadata catalog lookups
pub trait SchemaLookup: Send + Sync {
    fn class(&self, name: &str) -> Option<ClassInfo>;

    fn all_classes(&self) -> Vec<ClassInfo>;

    /// Whether `class` equals `base` or derives from it transitively
    fn is_a(&self, class: &str, base: &str) -> bool;

    /// `class` and every class deriving from it
    fn derived_classes(&self, class: &str) -> Vec<String>;

    fn relationship(&self, name: &str) -> Option<RelationshipClassInfo>;

    /// Display label of a class, falling back to its name
    fn class_label(&self, name: &str) -> String {
        self.class(name)
            .map(|class| class.label)
            .unwrap_or_else(|| name.to_string())
    }
}

/// Resolved rules of one ruleset
pub trait RulesLookup: Send + Sync {
    fn ruleset_id(&self) -> &str;

    /// Root node rules, highest priority first
    fn root_rules(&self) -> Vec<NodeRule>;

    /// Candidate child node rules for `parent`, highest priority first
    ///
    /// Class and condition matching is finished by the engine.
    fn child_rules(&self, parent: &NavNode) -> Vec<NodeRule>;

    /// Grouping rules, highest priority first
    fn grouping_rules(&self) -> Vec<GroupingRule>;

    /// Sorting rules, highest priority first
    fn sorting_rules(&self) -> Vec<SortingRule>;

    fn customization_rules(&self) -> Vec<CustomizationRule>;

    fn artifact_rules(&self) -> Vec<ArtifactRule>;
}

/// Inputs an expression may reference
pub struct ExpressionContext<'a> {
    pub node: Option<&'a NavNode>,
    pub parent: Option<&'a NavNode>,
    pub variables: &'a TrackedVariables,
}

impl<'a> ExpressionContext<'a> {
    pub fn new(variables: &'a TrackedVariables) -> Self {
        Self {
            node: None,
            parent: None,
            variables,
        }
    }

    pub fn with_node(mut self, node: &'a NavNode) -> Self {
        self.node = Some(node);
        self
    }

    pub fn with_parent(mut self, parent: Option<&'a NavNode>) -> Self {
        self.parent = parent;
        self
    }
}

/// Evaluates rule expressions
///
/// Implementations read variables through [`TrackedVariables::get`] so the
/// engine learns which variables a result depends on.
pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate_bool(&self, expression: &str, context: &ExpressionContext<'_>) -> Result<bool>;

    fn evaluate_value(&self, expression: &str, context: &ExpressionContext<'_>) -> Result<Value>;
}
