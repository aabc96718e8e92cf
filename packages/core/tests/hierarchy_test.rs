//! Integration tests for HierarchyManager requests
//!
//! Tests cover:
//! - At-most-once population of a level
//! - Counts agreeing with iteration, paged and unpaged, also through
//!   label collapse and same-label merge
//! - Related-instance children and children determination
//! - Empty data sources
//! - Request errors and cancellation

mod common;

use anyhow::Result;
use common::{class_rule, create_test_hierarchy, labels, seed, RULESET_ID};
use hierarchy_core::models::CombinedHierarchyLevelIdentifier;
use hierarchy_core::{CancellationToken, HasChildren, HierarchyError, HierarchyRequest, PageOptions, RulesetVariables};
use serde_json::json;

fn widgets_with_notes() -> serde_json::Value {
    json!({
        "rootRules": [class_rule("widgets", "Widget")],
        "childRules": [{
            "parentClass": "Widget",
            "specifications": [{
                "id": "owned-notes",
                "kind": { "type": "relatedInstances", "relationship": "Owns", "direction": "forward" },
                "hasChildren": "never"
            }]
        }]
    })
}

// =========================================================================
// Population
// =========================================================================

#[test]
fn test_root_level_is_populated_at_most_once() -> Result<()> {
    let (hierarchy, _temp_dir) = create_test_hierarchy(json!({
        "rootRules": [{ "specifications": [{
            "id": "widgets",
            "kind": { "type": "instancesOfSpecificClasses", "classes": ["Widget"] },
            "hasChildren": "never"
        }]}]
    }))?;
    seed(&hierarchy.store, &[("w1", "Widget", "Gear"), ("w2", "Widget", "Bolt")])?;

    let first = hierarchy.children(None)?;
    assert_eq!(labels(&first), vec!["Bolt", "Gear"]);
    let queries = hierarchy.store.executed_queries();

    let second = hierarchy.children(None)?;
    assert_eq!(second, first);
    assert_eq!(hierarchy.store.executed_queries(), queries, "second read must come from the cache");
    Ok(())
}

#[test]
fn test_count_matches_iteration() -> Result<()> {
    let (hierarchy, _temp_dir) = create_test_hierarchy(json!({
        "rootRules": [
            class_rule("widgets", "Widget"),
            class_rule("gadgets", "Gadget")
        ]
    }))?;
    seed(
        &hierarchy.store,
        &[
            ("w1", "Widget", "Gear"),
            ("w2", "Widget", "Bolt"),
            ("g1", "Gadget", "Lamp"),
            ("g2", "Gadget", "Fan"),
            ("g3", "Gadget", "Clock"),
        ],
    )?;

    let request = hierarchy.request();
    let nodes = hierarchy.manager.get_children(&request)?;
    assert_eq!(hierarchy.manager.get_children_count(&request)?, nodes.len());
    assert_eq!(labels(&nodes), vec!["Bolt", "Gear", "Clock", "Fan", "Lamp"]);

    let paged = hierarchy.request().with_page(PageOptions::new(1, 3));
    let page = hierarchy.manager.get_children(&paged)?;
    assert_eq!(hierarchy.manager.get_children_count(&paged)?, page.len());
    assert_eq!(labels(&page), vec!["Gear", "Clock", "Fan"]);
    Ok(())
}

#[test]
fn test_count_matches_iteration_through_label_collapse() -> Result<()> {
    let (hierarchy, _temp_dir) = create_test_hierarchy(json!({
        "rootRules": [{ "specifications": [{
            "id": "widgets",
            "kind": { "type": "instancesOfSpecificClasses", "classes": ["Widget"] },
            "groupByLabel": true,
            "hasChildren": "never"
        }]}]
    }))?;
    seed(
        &hierarchy.store,
        &[("w1", "Widget", "Gear"), ("w2", "Widget", "Gear"), ("w3", "Widget", "Gear")],
    )?;

    let request = hierarchy.request();
    let nodes = hierarchy.manager.get_children(&request)?;
    assert_eq!(nodes.len(), 3);
    assert_eq!(hierarchy.manager.get_children_count(&request)?, nodes.len());

    let paged = hierarchy.request().with_page(PageOptions::new(1, 5));
    let page = hierarchy.manager.get_children(&paged)?;
    assert_eq!(page.len(), 2);
    assert_eq!(hierarchy.manager.get_children_count(&paged)?, page.len());
    assert_eq!(page[..], nodes[1..]);
    Ok(())
}

#[test]
fn test_count_matches_iteration_through_same_label_merge() -> Result<()> {
    let (hierarchy, _temp_dir) = create_test_hierarchy(json!({
        "rootRules": [{ "specifications": [{
            "id": "widgets",
            "kind": { "type": "instancesOfSpecificClasses", "classes": ["Widget"] },
            "hasChildren": "never"
        }]}],
        "groupingRules": [{
            "class": "Widget",
            "groups": [{ "type": "sameLabelInstanceGroup", "applicationStage": "postProcess" }]
        }]
    }))?;
    seed(
        &hierarchy.store,
        &[
            ("w1", "Widget", "Bolt"),
            ("w2", "Widget", "Bolt"),
            ("w3", "Widget", "Gear"),
            ("w4", "Widget", "Cog"),
        ],
    )?;

    let request = hierarchy.request();
    let nodes = hierarchy.manager.get_children(&request)?;
    assert_eq!(labels(&nodes), vec!["Bolt", "Cog", "Gear"]);
    assert_eq!(hierarchy.manager.get_children_count(&request)?, nodes.len());

    let paged = hierarchy.request().with_page(PageOptions::new(1, 2));
    let page = hierarchy.manager.get_children(&paged)?;
    assert_eq!(labels(&page), vec!["Cog", "Gear"]);
    assert_eq!(hierarchy.manager.get_children_count(&paged)?, page.len());
    Ok(())
}

#[test]
fn test_related_children_and_children_determination() -> Result<()> {
    let (hierarchy, _temp_dir) = create_test_hierarchy(widgets_with_notes())?;
    seed(
        &hierarchy.store,
        &[
            ("w1", "Widget", "Gear"),
            ("w2", "Widget", "Bolt"),
            ("n1", "Note", "Torque spec"),
            ("n2", "Note", "Assembly"),
        ],
    )?;
    hierarchy.store.insert_relationship("Owns", "w1", "n1")?;
    hierarchy.store.insert_relationship("Owns", "w1", "n2")?;

    let roots = hierarchy.children(None)?;
    assert_eq!(labels(&roots), vec!["Bolt", "Gear"]);
    assert_eq!(roots[0].has_children, HasChildren::No);
    assert_eq!(roots[1].has_children, HasChildren::Yes);

    let notes = hierarchy.children(Some(&roots[1]))?;
    assert_eq!(labels(&notes), vec!["Assembly", "Torque spec"]);
    assert!(notes.iter().all(|note| note.parent_id == Some(roots[1].id)));
    assert!(notes.iter().all(|note| note.has_children == HasChildren::No));

    // children determination is persisted with the node
    let cached = hierarchy.manager.get_node(roots[1].id)?.expect("root node is cached");
    assert_eq!(cached.has_children, HasChildren::Yes);
    Ok(())
}

#[test]
fn test_locate_node_by_key_path() -> Result<()> {
    let (hierarchy, _temp_dir) = create_test_hierarchy(widgets_with_notes())?;
    seed(&hierarchy.store, &[("w1", "Widget", "Gear"), ("n1", "Note", "Manual")])?;
    hierarchy.store.insert_relationship("Owns", "w1", "n1")?;

    let roots = hierarchy.children(None)?;
    let notes = hierarchy.children(Some(&roots[0]))?;
    let located = hierarchy
        .manager
        .locate_node(RULESET_ID, &notes[0].key.path_from_root)?
        .expect("note is located by its path");
    assert_eq!(located.id, notes[0].id);
    Ok(())
}

#[test]
fn test_empty_data_source_is_cached_in_one_write() -> Result<()> {
    let (hierarchy, _temp_dir) = create_test_hierarchy(json!({
        "rootRules": [class_rule("gadgets", "Gadget")]
    }))?;
    seed(&hierarchy.store, &[("w1", "Widget", "Gear")])?;

    let (mut arena, provider) = hierarchy.manager.open_level(&hierarchy.request())?;
    let writes = hierarchy.cache.stats().writes;
    assert!(arena.nodes(provider)?.is_empty());
    assert_eq!(hierarchy.cache.stats().writes, writes + 1);

    let combined = CombinedHierarchyLevelIdentifier::new(hierarchy.store.connection_id(), RULESET_ID, None);
    let level = hierarchy
        .cache
        .find_hierarchy_level_id(&combined, None)?
        .expect("root level exists");
    let data_sources = hierarchy
        .cache
        .find_data_sources(level.id, None, None, None, &RulesetVariables::new())?;
    assert_eq!(data_sources.len(), 1);
    assert_eq!(data_sources[0].has_nodes, Some(false));
    assert_eq!(data_sources[0].total_nodes_count, Some(0));
    assert!(data_sources[0].is_finalized);

    let queries = hierarchy.store.executed_queries();
    assert_eq!(hierarchy.manager.get_children_count(&hierarchy.request())?, 0);
    assert_eq!(hierarchy.store.executed_queries(), queries);
    Ok(())
}

// =========================================================================
// Request errors
// =========================================================================

#[test]
fn test_unknown_ruleset_is_misconfiguration() -> Result<()> {
    let (hierarchy, _temp_dir) = create_test_hierarchy(json!({}))?;
    let result = hierarchy.manager.get_children(&HierarchyRequest::new("missing"));
    assert!(matches!(result, Err(HierarchyError::Misconfiguration { .. })));
    Ok(())
}

#[test]
fn test_uncached_parent_is_invariant_violation() -> Result<()> {
    let (hierarchy, _temp_dir) = create_test_hierarchy(widgets_with_notes())?;
    let request = hierarchy.request().with_parent(uuid::Uuid::new_v4());
    let result = hierarchy.manager.get_children(&request);
    assert!(matches!(result, Err(HierarchyError::Invariant { .. })));
    Ok(())
}

#[test]
fn test_cancelled_request_leaves_cache_usable() -> Result<()> {
    let (hierarchy, _temp_dir) = create_test_hierarchy(json!({
        "rootRules": [class_rule("widgets", "Widget")]
    }))?;
    seed(&hierarchy.store, &[("w1", "Widget", "Gear")])?;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = hierarchy.manager.get_children(&hierarchy.request().with_cancellation(cancel));
    assert!(matches!(result, Err(HierarchyError::Cancelled)));

    assert_eq!(labels(&hierarchy.children(None)?), vec!["Gear"]);
    Ok(())
}

#[test]
fn test_result_set_size_limit() -> Result<()> {
    let (hierarchy, _temp_dir) = create_test_hierarchy(json!({
        "rootRules": [class_rule("widgets", "Widget")]
    }))?;
    seed(
        &hierarchy.store,
        &[("w1", "Widget", "Gear"), ("w2", "Widget", "Bolt"), ("w3", "Widget", "Axle")],
    )?;

    let limited = hierarchy.request().with_result_set_size_limit(2);
    let result = hierarchy.manager.get_children(&limited);
    assert!(matches!(
        result,
        Err(HierarchyError::ResultSetTooLarge { limit: 2, actual: 3 })
    ));

    let roomy = hierarchy.request().with_result_set_size_limit(10);
    assert_eq!(hierarchy.manager.get_children(&roomy)?.len(), 3);
    Ok(())
}

#[test]
fn test_instance_filter_is_part_of_identity() -> Result<()> {
    let (hierarchy, _temp_dir) = create_test_hierarchy(json!({
        "rootRules": [class_rule("widgets", "Widget")]
    }))?;
    seed(&hierarchy.store, &[("w1", "Widget", "Gear"), ("w2", "Widget", "Bolt")])?;

    let filtered = hierarchy.request().with_instance_filter("this.Label = 'Gear'");
    assert_eq!(labels(&hierarchy.manager.get_children(&filtered)?), vec!["Gear"]);
    assert_eq!(labels(&hierarchy.children(None)?), vec!["Bolt", "Gear"]);
    assert_eq!(labels(&hierarchy.manager.get_children(&filtered)?), vec!["Gear"]);
    Ok(())
}
