//! In-memory schema catalog

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use super::SchemaLookup;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassInfo {
    pub name: String,
    pub label: String,
    #[serde(default)]
    pub base_classes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipClassInfo {
    pub name: String,
    pub label: String,
    pub source_class: String,
    pub target_class: String,
}

/// Schema held entirely in memory
///
/// # Examples
///
/// ```rust
/// use hierarchy_core::lookup::{SchemaCatalog, SchemaLookup};
///
/// let schema = SchemaCatalog::new()
///     .with_class("Device", "Device", &[])
///     .with_class("Widget", "Widget", &["Device"]);
/// assert!(schema.is_a("Widget", "Device"));
/// assert_eq!(schema.derived_classes("Device"), vec!["Device", "Widget"]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct SchemaCatalog {
    classes: BTreeMap<String, ClassInfo>,
    relationships: BTreeMap<String, RelationshipClassInfo>,
}

impl SchemaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_class(mut self, name: &str, label: &str, base_classes: &[&str]) -> Self {
        self.classes.insert(
            name.to_string(),
            ClassInfo {
                name: name.to_string(),
                label: label.to_string(),
                base_classes: base_classes.iter().map(|c| c.to_string()).collect(),
            },
        );
        self
    }

    pub fn with_relationship(mut self, name: &str, label: &str, source: &str, target: &str) -> Self {
        self.relationships.insert(
            name.to_string(),
            RelationshipClassInfo {
                name: name.to_string(),
                label: label.to_string(),
                source_class: source.to_string(),
                target_class: target.to_string(),
            },
        );
        self
    }
}

impl SchemaLookup for SchemaCatalog {
    fn class(&self, name: &str) -> Option<ClassInfo> {
        self.classes.get(name).cloned()
    }

    fn all_classes(&self) -> Vec<ClassInfo> {
        self.classes.values().cloned().collect()
    }

    fn is_a(&self, class: &str, base: &str) -> bool {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([class.to_string()]);
        while let Some(current) = queue.pop_front() {
            if current == base {
                return true;
            }
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(info) = self.classes.get(&current) {
                queue.extend(info.base_classes.iter().cloned());
            }
        }
        false
    }

    fn derived_classes(&self, class: &str) -> Vec<String> {
        // BTreeMap iteration keeps the result sorted and deterministic
        self.classes
            .keys()
            .filter(|name| self.is_a(name, class))
            .cloned()
            .collect()
    }

    fn relationship(&self, name: &str) -> Option<RelationshipClassInfo> {
        self.relationships.get(name).cloned()
    }
}
