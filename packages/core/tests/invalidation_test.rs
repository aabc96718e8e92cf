//! Variable-aware reuse and explicit invalidation of cached levels
//!
//! Tests cover:
//! - Reuse across unrelated variable changes
//! - Variations keyed by the variables rules actually read
//! - invalidate / on_instances_changed / clear

mod common;

use anyhow::Result;
use common::{class_rule, create_test_hierarchy, labels, seed, RULESET_ID};
use hierarchy_core::RulesetVariables;
use serde_json::json;

fn conditional_rules() -> serde_json::Value {
    json!({
        "rootRules": [{
            "condition": "$var.show",
            "specifications": [{
                "id": "widgets",
                "kind": { "type": "instancesOfSpecificClasses", "classes": ["Widget"] },
                "hasChildren": "never"
            }]
        }]
    })
}

// =========================================================================
// Variables
// =========================================================================

#[test]
fn test_unrelated_variable_reuses_level() -> Result<()> {
    let (hierarchy, _temp_dir) = create_test_hierarchy(conditional_rules())?;
    seed(&hierarchy.store, &[("w1", "Widget", "Gear")])?;

    let shown = RulesetVariables::new().with("show", true);
    let request = hierarchy.request().with_variables(shown.clone());
    assert_eq!(labels(&hierarchy.manager.get_children(&request)?), vec!["Gear"]);
    let queries = hierarchy.store.executed_queries();

    let unrelated = hierarchy
        .request()
        .with_variables(shown.with("theme", "dark"));
    assert_eq!(labels(&hierarchy.manager.get_children(&unrelated)?), vec!["Gear"]);
    assert_eq!(hierarchy.store.executed_queries(), queries);
    Ok(())
}

#[test]
fn test_related_variable_selects_variation() -> Result<()> {
    let (hierarchy, _temp_dir) = create_test_hierarchy(conditional_rules())?;
    seed(&hierarchy.store, &[("w1", "Widget", "Gear")])?;

    let shown = hierarchy
        .request()
        .with_variables(RulesetVariables::new().with("show", true));
    let hidden = hierarchy
        .request()
        .with_variables(RulesetVariables::new().with("show", false));

    assert_eq!(hierarchy.manager.get_children(&shown)?.len(), 1);
    assert!(hierarchy.manager.get_children(&hidden)?.is_empty());
    assert_eq!(hierarchy.manager.get_children_count(&hidden)?, 0);

    let queries = hierarchy.store.executed_queries();
    assert_eq!(labels(&hierarchy.manager.get_children(&shown)?), vec!["Gear"]);
    assert_eq!(hierarchy.store.executed_queries(), queries);
    Ok(())
}

// =========================================================================
// Invalidation
// =========================================================================

#[test]
fn test_invalidate_root_level() -> Result<()> {
    let (hierarchy, _temp_dir) = create_test_hierarchy(json!({
        "rootRules": [class_rule("widgets", "Widget")]
    }))?;
    seed(&hierarchy.store, &[("w1", "Widget", "Gear")])?;
    assert_eq!(labels(&hierarchy.children(None)?), vec!["Gear"]);

    seed(&hierarchy.store, &[("w2", "Widget", "Bolt")])?;
    assert_eq!(labels(&hierarchy.children(None)?), vec!["Gear"], "stale until invalidated");

    assert_eq!(hierarchy.manager.invalidate(RULESET_ID, None)?, 1);
    assert_eq!(labels(&hierarchy.children(None)?), vec!["Bolt", "Gear"]);
    assert_eq!(hierarchy.manager.invalidate(RULESET_ID, None)?, 1);
    assert_eq!(hierarchy.manager.invalidate("other-ruleset", None)?, 0);
    Ok(())
}

#[test]
fn test_instance_change_invalidates_selecting_levels() -> Result<()> {
    let (hierarchy, _temp_dir) = create_test_hierarchy(json!({
        "rootRules": [class_rule("widgets", "Widget")]
    }))?;
    seed(&hierarchy.store, &[("w1", "Widget", "Gear")])?;
    hierarchy.children(None)?;

    seed(&hierarchy.store, &[("g1", "Gadget", "Lamp")])?;
    assert_eq!(hierarchy.manager.on_instances_changed(&["Gadget".to_string()])?, 0);

    seed(&hierarchy.store, &[("w2", "Widget", "Bolt")])?;
    assert_eq!(hierarchy.manager.on_instances_changed(&["Widget".to_string()])?, 1);
    assert_eq!(labels(&hierarchy.children(None)?), vec!["Bolt", "Gear"]);
    Ok(())
}

#[test]
fn test_clear_drops_every_level() -> Result<()> {
    let (hierarchy, _temp_dir) = create_test_hierarchy(json!({
        "rootRules": [class_rule("widgets", "Widget")],
        "childRules": [{
            "parentClass": "Widget",
            "specifications": [{
                "id": "notes",
                "kind": { "type": "relatedInstances", "relationship": "Owns" }
            }]
        }]
    }))?;
    seed(&hierarchy.store, &[("w1", "Widget", "Gear"), ("n1", "Note", "Manual")])?;
    hierarchy.store.insert_relationship("Owns", "w1", "n1")?;

    let roots = hierarchy.children(None)?;
    hierarchy.children(Some(&roots[0]))?;
    assert!(hierarchy.manager.clear(RULESET_ID)? >= 2);

    let queries = hierarchy.store.executed_queries();
    assert_eq!(labels(&hierarchy.children(None)?), vec!["Gear"]);
    assert!(hierarchy.store.executed_queries() > queries);
    Ok(())
}
