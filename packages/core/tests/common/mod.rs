//! Shared fixtures for the hierarchy integration tests

#![allow(dead_code)]

use anyhow::Result;
use hierarchy_core::lookup::{Ruleset, SchemaCatalog};
use hierarchy_core::store::InstanceStore;
use hierarchy_core::{HierarchyCache, HierarchyConfig, HierarchyManager, HierarchyRequest, NavNode};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const RULESET_ID: &str = "test-ruleset";

pub struct TestHierarchy {
    pub manager: HierarchyManager,
    pub store: Arc<InstanceStore>,
    pub cache: Arc<HierarchyCache>,
}

impl TestHierarchy {
    pub fn request(&self) -> HierarchyRequest {
        HierarchyRequest::new(RULESET_ID)
    }

    pub fn children(&self, parent: Option<&NavNode>) -> Result<Vec<NavNode>> {
        let mut request = self.request();
        request.parent_id = parent.map(|node| node.id);
        Ok(self.manager.get_children(&request)?)
    }
}

pub fn schema() -> SchemaCatalog {
    SchemaCatalog::new()
        .with_class("Element", "Element", &[])
        .with_class("Widget", "Widget", &["Element"])
        .with_class("Gadget", "Gadget", &["Element"])
        .with_class("Note", "Note", &["Element"])
        .with_relationship("Owns", "Owns", "Widget", "Note")
        .with_relationship("Links", "Links", "Widget", "Widget")
}

/// Test helper: hierarchy over file-backed store and cache
pub fn create_test_hierarchy(rules: Value) -> Result<(TestHierarchy, TempDir)> {
    create_test_hierarchy_with_config(rules, HierarchyConfig::default())
}

pub fn create_test_hierarchy_with_config(rules: Value, config: HierarchyConfig) -> Result<(TestHierarchy, TempDir)> {
    let temp_dir = TempDir::new()?;
    let store = Arc::new(InstanceStore::open(
        temp_dir.path().join("instances.db"),
        Duration::from_secs(5),
    )?);
    let cache = Arc::new(HierarchyCache::open(temp_dir.path().join("cache.db"), config)?);
    let manager = HierarchyManager::new(cache.clone(), store.clone(), Arc::new(schema()));

    let mut rules = rules;
    rules["id"] = json!(RULESET_ID);
    manager.register_ruleset(Arc::new(Ruleset::from_json_str(&rules.to_string())?))?;

    Ok((TestHierarchy { manager, store, cache }, temp_dir))
}

/// Insert `(id, class, label)` instances without properties
pub fn seed(store: &InstanceStore, instances: &[(&str, &str, &str)]) -> Result<()> {
    for (id, class_name, label) in instances {
        store.insert_instance(id, class_name, label, &json!({}))?;
    }
    Ok(())
}

/// Root rule listing every instance of `class`
pub fn class_rule(spec_id: &str, class: &str) -> Value {
    json!({
        "specifications": [{
            "id": spec_id,
            "kind": { "type": "instancesOfSpecificClasses", "classes": [class] }
        }]
    })
}

pub fn labels(nodes: &[NavNode]) -> Vec<String> {
    nodes.iter().map(|node| node.label.clone()).collect()
}
