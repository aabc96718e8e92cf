//! Ruleset backed by a deserialized [`RulesetDefinition`]

use crate::models::{
    ArtifactRule, CustomizationRule, GroupingRule, NavNode, NodeKind, NodeRule, RulesetDefinition,
    SortingRule,
};

use super::RulesLookup;

/// A ruleset held in memory
#[derive(Debug, Clone)]
pub struct Ruleset {
    definition: RulesetDefinition,
}

impl Ruleset {
    /// Wrap a definition, ordering every rule list by descending priority
    ///
    /// The sort is stable, so rules of equal priority keep their declared order.
    pub fn new(mut definition: RulesetDefinition) -> Self {
        definition.root_rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        definition.child_rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        definition.grouping_rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        definition.sorting_rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        definition
            .customization_rules
            .sort_by(|a, b| b.priority.cmp(&a.priority));
        Self { definition }
    }

    pub fn from_json_str(json: &str) -> crate::Result<Self> {
        Ok(Self::new(serde_json::from_str(json)?))
    }

    pub fn definition(&self) -> &RulesetDefinition {
        &self.definition
    }
}

impl RulesLookup for Ruleset {
    fn ruleset_id(&self) -> &str {
        &self.definition.id
    }

    fn root_rules(&self) -> Vec<NodeRule> {
        self.definition.root_rules.clone()
    }

    fn child_rules(&self, parent: &NavNode) -> Vec<NodeRule> {
        self.definition
            .child_rules
            .iter()
            .filter(|rule| match (&rule.parent_node_type, parent.kind()) {
                (Some(node_type), NodeKind::Custom) => {
                    parent.key.class_name.as_deref() == Some(node_type.as_str())
                }
                (Some(_), _) => false,
                (None, _) => true,
            })
            .cloned()
            .collect()
    }

    fn grouping_rules(&self) -> Vec<GroupingRule> {
        self.definition.grouping_rules.clone()
    }

    fn sorting_rules(&self) -> Vec<SortingRule> {
        self.definition.sorting_rules.clone()
    }

    fn customization_rules(&self) -> Vec<CustomizationRule> {
        self.definition.customization_rules.clone()
    }

    fn artifact_rules(&self) -> Vec<ArtifactRule> {
        self.definition.artifact_rules.clone()
    }
}
