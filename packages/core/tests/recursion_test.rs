//! Recursive rulesets and the similar-ancestor limit
//!
//! Tests cover:
//! - Cutting a self-referencing branch at the configured repetition
//! - Revisiting recursive and collapsed levels without new queries

mod common;

use anyhow::Result;
use common::{create_test_hierarchy, create_test_hierarchy_with_config, seed};
use hierarchy_core::{HasChildren, HierarchyConfig, NavNode, NodeKind};
use serde_json::{json, Value};

fn self_linking_rules(suppress_check: bool) -> Value {
    json!({
        "rootRules": [{ "specifications": [{
            "id": "start",
            "kind": { "type": "instancesOfSpecificClasses", "classes": ["Widget"] },
            "instanceFilter": "this.Id = 'w1'"
        }]}],
        "childRules": [{
            "parentClass": "Widget",
            "specifications": [{
                "id": "links",
                "kind": {
                    "type": "relatedInstances",
                    "relationship": "Links",
                    "direction": "forward",
                    "targetClasses": ["Widget"]
                },
                "suppressSimilarAncestorsCheck": suppress_check
            }]
        }]
    })
}

/// Follow the first child until a node reports no children
fn walk_down(hierarchy: &common::TestHierarchy, start: &NavNode, max_depth: usize) -> Result<Vec<NavNode>> {
    let mut path = Vec::new();
    let mut current = start.clone();
    while current.has_children == HasChildren::Yes && path.len() < max_depth {
        let children = hierarchy.children(Some(&current))?;
        let Some(first) = children.into_iter().next() else {
            break;
        };
        path.push(first.clone());
        current = first;
    }
    Ok(path)
}

#[test]
fn test_self_link_is_cut_at_first_repetition() -> Result<()> {
    let (hierarchy, _temp_dir) = create_test_hierarchy(self_linking_rules(false))?;
    seed(&hierarchy.store, &[("w1", "Widget", "Loop")])?;
    hierarchy.store.insert_relationship("Links", "w1", "w1")?;

    let roots = hierarchy.children(None)?;
    assert_eq!(roots.len(), 1);
    assert_eq!(roots[0].has_children, HasChildren::Yes);

    let path = walk_down(&hierarchy, &roots[0], 10)?;
    assert_eq!(path.len(), 2);
    assert!(path.iter().all(|node| node.key.specification_id == "links"));
    assert_eq!(path[0].has_children, HasChildren::Yes);
    assert_eq!(path[1].has_children, HasChildren::No);
    Ok(())
}

#[test]
fn test_suppressed_check_allows_configured_depth() -> Result<()> {
    let config = HierarchyConfig {
        max_allowed_similar_ancestors_when_suppressed: 3,
        ..HierarchyConfig::default()
    };
    let (hierarchy, _temp_dir) = create_test_hierarchy_with_config(self_linking_rules(true), config)?;
    seed(&hierarchy.store, &[("w1", "Widget", "Loop")])?;
    hierarchy.store.insert_relationship("Links", "w1", "w1")?;

    let roots = hierarchy.children(None)?;
    let path = walk_down(&hierarchy, &roots[0], 10)?;
    assert_eq!(path.len(), 4);
    assert!(path[..3].iter().all(|node| node.has_children == HasChildren::Yes));
    assert_eq!(path[3].has_children, HasChildren::No);

    // every copy hangs under the previous one
    assert_eq!(path[0].parent_id, Some(roots[0].id));
    for pair in path.windows(2) {
        assert_eq!(pair[1].parent_id, Some(pair[0].id));
    }
    Ok(())
}

#[test]
fn test_repeated_walk_is_served_from_cache() -> Result<()> {
    let (hierarchy, _temp_dir) = create_test_hierarchy(self_linking_rules(false))?;
    seed(&hierarchy.store, &[("w1", "Widget", "Loop")])?;
    hierarchy.store.insert_relationship("Links", "w1", "w1")?;

    let roots = hierarchy.children(None)?;
    let path = walk_down(&hierarchy, &roots[0], 10)?;
    let queries = hierarchy.store.executed_queries();

    assert_eq!(hierarchy.children(None)?, roots);
    assert_eq!(walk_down(&hierarchy, &roots[0], 10)?, path);
    assert_eq!(hierarchy.store.executed_queries(), queries);
    Ok(())
}

#[test]
fn test_collapsed_linked_level_is_stable_across_requests() -> Result<()> {
    let mut rules = self_linking_rules(false);
    rules["childRules"][0]["specifications"][0]["groupByLabel"] = json!(true);
    let (hierarchy, _temp_dir) = create_test_hierarchy(rules)?;
    seed(
        &hierarchy.store,
        &[("w1", "Widget", "Loop"), ("w2", "Widget", "Twin"), ("w3", "Widget", "Twin")],
    )?;
    hierarchy.store.insert_relationship("Links", "w1", "w2")?;
    hierarchy.store.insert_relationship("Links", "w1", "w3")?;

    let roots = hierarchy.children(None)?;
    assert_eq!(roots[0].has_children, HasChildren::Yes);
    let mut request = hierarchy.request();
    request.parent_id = Some(roots[0].id);

    // the lone "Twin" label group gives way to its instances
    let level = hierarchy.manager.get_children(&request)?;
    assert_eq!(level.len(), 2);
    assert!(level.iter().all(|node| node.kind() == NodeKind::Instance));
    assert!(level.iter().all(|node| node.parent_id == Some(roots[0].id)));
    assert_eq!(hierarchy.manager.get_children_count(&request)?, level.len());
    let queries = hierarchy.store.executed_queries();

    let again = hierarchy.manager.get_children(&request)?;
    assert_eq!(again, level);
    assert_eq!(hierarchy.store.executed_queries(), queries);
    assert_eq!(hierarchy.manager.get_children_count(&request)?, level.len());
    Ok(())
}
