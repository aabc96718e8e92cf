use super::*;
use crate::models::{DataSourceIdentifier, NodeKey, NodeKind};
use anyhow::Result;
use serde_json::json;
use tempfile::TempDir;

fn create_test_cache() -> Result<(HierarchyCache, TempDir)> {
    let temp_dir = TempDir::new()?;
    let cache = HierarchyCache::open(temp_dir.path().join("cache.db"), HierarchyConfig::default())?;
    Ok((cache, temp_dir))
}

fn root_level(cache: &HierarchyCache) -> Result<HierarchyLevelIdentifier> {
    let combined = CombinedHierarchyLevelIdentifier::new("conn", "ruleset", None);
    Ok(cache.get_or_create_hierarchy_level(&combined, None)?)
}

fn data_source(cache: &HierarchyCache, level: Uuid, index: Vec<u64>, vars: RulesetVariables) -> Result<DataSourceInfo> {
    let mut info = DataSourceInfo::new(
        DataSourceIdentifier {
            hierarchy_level_id: level,
            index,
            instance_filter: None,
            result_set_size_limit: None,
        },
        vars,
    );
    cache.cache_data_source(&mut info)?;
    Ok(info)
}

fn instance_node(label: &str, keys: &[&str]) -> NavNode {
    let keys = keys.iter().map(|key| key.to_string()).collect();
    NavNode::new(NodeKey::instance("spec", "Widget", keys), label)
}

// ============================================================================
// Levels and data sources
// ============================================================================

#[test]
fn test_hierarchy_level_is_created_once() -> Result<()> {
    let (cache, _temp_dir) = create_test_cache()?;
    let combined = CombinedHierarchyLevelIdentifier::new("conn", "ruleset", None);

    assert!(cache.find_hierarchy_level_id(&combined, None)?.is_none());
    let first = cache.get_or_create_hierarchy_level(&combined, None)?;
    let second = cache.get_or_create_hierarchy_level(&combined, None)?;
    assert_eq!(first, second);
    assert_eq!(cache.find_hierarchy_level_id(&combined, None)?, Some(first));

    let other_ruleset = CombinedHierarchyLevelIdentifier::new("conn", "other", None);
    let third = cache.get_or_create_hierarchy_level(&other_ruleset, None)?;
    assert_ne!(third.physical_level_id, second.physical_level_id);
    Ok(())
}

#[test]
fn test_find_data_source_respects_related_variables() -> Result<()> {
    let (cache, _temp_dir) = create_test_cache()?;
    let level = root_level(&cache)?;
    let stored = data_source(&cache, level.id, vec![0], RulesetVariables::new().with("show", true))?;

    let identifier = stored.identifier.clone();
    let matching = RulesetVariables::new().with("show", true).with("unrelated", 5);
    let found = cache.find_data_source(&identifier, &matching)?;
    assert_eq!(found.map(|info| info.id), Some(stored.id));

    let changed = RulesetVariables::new().with("show", false);
    assert!(cache.find_data_source(&identifier, &changed)?.is_none());

    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    Ok(())
}

#[test]
fn test_find_data_sources_prefers_specific_variation() -> Result<()> {
    let (cache, _temp_dir) = create_test_cache()?;
    let level = root_level(&cache)?;
    data_source(&cache, level.id, vec![1], RulesetVariables::new())?;
    let generic = data_source(&cache, level.id, vec![0], RulesetVariables::new())?;
    let specific = data_source(&cache, level.id, vec![0], RulesetVariables::new().with("a", 1))?;

    let vars = RulesetVariables::new().with("a", 1);
    let found = cache.find_data_sources(level.id, None, None, None, &vars)?;
    let ids: Vec<Uuid> = found.iter().map(|info| info.id).collect();
    assert_eq!(ids.len(), 2);
    assert_eq!(ids[0], specific.id);

    let other = cache.find_data_sources(level.id, None, None, None, &RulesetVariables::new().with("a", 2))?;
    assert_eq!(other[0].id, generic.id);
    Ok(())
}

#[test]
fn test_partial_update_writes_only_selected_columns() -> Result<()> {
    let (cache, _temp_dir) = create_test_cache()?;
    let level = root_level(&cache)?;
    let mut info = data_source(&cache, level.id, vec![0], RulesetVariables::new())?;

    info.total_nodes_count = Some(12);
    info.direct_nodes_count = Some(99);
    info.select_classes = vec![DataSourceClass {
        class_name: "Widget".to_string(),
        polymorphic: true,
    }];
    cache.update(&info, parts::TOTAL_NODES_COUNT | parts::SELECT_CLASSES)?;

    let stored = cache.get_data_source(info.id)?.expect("data source");
    assert_eq!(stored.total_nodes_count, Some(12));
    assert_eq!(stored.direct_nodes_count, None);
    assert_eq!(stored.select_classes, info.select_classes);
    Ok(())
}

#[test]
fn test_update_related_variables_skips_contained_sets() -> Result<()> {
    let (cache, _temp_dir) = create_test_cache()?;
    let level = root_level(&cache)?;
    let info = data_source(&cache, level.id, vec![0], RulesetVariables::new().with("a", 1))?;

    assert!(!cache.update_related_variables(info.id, &RulesetVariables::new().with("a", 1))?);
    assert!(cache.update_related_variables(info.id, &RulesetVariables::new().with("b", true))?);

    let stored = cache.get_data_source(info.id)?.expect("data source");
    assert_eq!(stored.related_variables, RulesetVariables::new().with("a", 1).with("b", true));
    Ok(())
}

// ============================================================================
// Savepoints
// ============================================================================

#[test]
fn test_dropped_savepoint_rolls_back() -> Result<()> {
    let (cache, _temp_dir) = create_test_cache()?;
    let level = root_level(&cache)?;
    let identifier = DataSourceIdentifier {
        hierarchy_level_id: level.id,
        index: vec![0],
        instance_filter: None,
        result_set_size_limit: None,
    };

    {
        let mut savepoint = cache.create_savepoint()?;
        let mut info = DataSourceInfo::new(identifier.clone(), RulesetVariables::new());
        savepoint.cache_data_source(&mut info)?;
        let mut node = instance_node("A", &["a"]);
        savepoint.cache_node(info.id, 0, &mut node, NodeVisibility::Visible, false)?;
    }
    assert!(cache.find_data_source(&identifier, &RulesetVariables::new())?.is_none());

    let mut savepoint = cache.create_savepoint()?;
    let mut info = DataSourceInfo::new(identifier.clone(), RulesetVariables::new());
    savepoint.cache_data_source(&mut info)?;
    savepoint.commit()?;
    assert!(cache.find_data_source(&identifier, &RulesetVariables::new())?.is_some());
    Ok(())
}

// ============================================================================
// Nodes
// ============================================================================

#[test]
fn test_node_round_trip_and_quick_cache() -> Result<()> {
    let (cache, _temp_dir) = create_test_cache()?;
    let level = root_level(&cache)?;
    let info = data_source(&cache, level.id, vec![0], RulesetVariables::new())?;

    let mut node = instance_node("Alpha", &["w1"]);
    cache.cache_node(info.id, 0, &mut node, NodeVisibility::Visible)?;
    assert!(!node.id.is_nil());

    let loaded = cache.get_node(node.id)?.expect("node");
    assert_eq!(loaded, node);
    cache.get_node(node.id)?;
    assert_eq!(cache.stats().quick_hits, 1);

    let mut changed = loaded.clone();
    changed.label = "Renamed".to_string();
    cache.update_node(&changed)?;
    assert_eq!(cache.get_node(node.id)?.map(|n| n.label), Some("Renamed".to_string()));
    Ok(())
}

#[test]
fn test_visibility_changes() -> Result<()> {
    let (cache, _temp_dir) = create_test_cache()?;
    let level = root_level(&cache)?;
    let info = data_source(&cache, level.id, vec![0], RulesetVariables::new())?;
    let mut node = instance_node("A", &["a"]);
    cache.cache_node(info.id, 0, &mut node, NodeVisibility::Visible)?;

    cache.make_virtual(node.id)?;
    let cached = cache.get_cached_node(node.id)?.expect("node");
    assert_eq!(cached.visibility, NodeVisibility::Virtual);
    assert!(cached.is_initialized);

    cache.make_hidden(node.id)?;
    assert_eq!(cache.get_cached_node(node.id)?.map(|c| c.visibility), Some(NodeVisibility::Hidden));
    cache.make_physical(node.id)?;
    assert_eq!(cache.get_cached_node(node.id)?.map(|c| c.visibility), Some(NodeVisibility::Visible));
    Ok(())
}

#[test]
fn test_physical_parent_and_ancestors() -> Result<()> {
    let (cache, _temp_dir) = create_test_cache()?;
    let root = root_level(&cache)?;
    let root_ds = data_source(&cache, root.id, vec![0], RulesetVariables::new())?;
    let mut parent = instance_node("Parent", &["p"]);
    cache.cache_node(root_ds.id, 0, &mut parent, NodeVisibility::Visible)?;

    let child_combined = CombinedHierarchyLevelIdentifier::new("conn", "ruleset", Some(parent.id));
    let child_level = cache.get_or_create_hierarchy_level(&child_combined, Some(parent.id))?;
    let child_ds = data_source(&cache, child_level.id, vec![0], RulesetVariables::new())?;
    let mut child = instance_node("Child", &["c"]);
    cache.cache_node(child_ds.id, 0, &mut child, NodeVisibility::Visible)?;

    assert_eq!(cache.get_physical_parent(child.id)?, Some(parent.id));
    assert_eq!(cache.get_physical_parent(parent.id)?, None);

    let ancestors = cache.node_ancestors(child.id)?;
    assert_eq!(ancestors.len(), 1);
    assert_eq!(ancestors[0].node.id, parent.id);
    assert!(cache.node_ancestors(parent.id)?.is_empty());
    Ok(())
}

#[test]
fn test_grouped_instances_difference() -> Result<()> {
    let (cache, _temp_dir) = create_test_cache()?;
    let level = root_level(&cache)?;
    let info = data_source(&cache, level.id, vec![0], RulesetVariables::new())?;

    let grouping = |keys: &[&str]| {
        NavNode::new(
            NodeKey::new(
                NodeKind::LabelGrouping,
                "spec",
                Some("Widget".to_string()),
                Some(json!("A")),
                keys.iter().map(|key| key.to_string()).collect(),
            ),
            "A",
        )
    };
    let mut a = grouping(&["1", "2"]);
    let mut b = grouping(&["2", "1"]);
    let mut c = grouping(&["1", "3"]);
    cache.cache_node(info.id, 0, &mut a, NodeVisibility::Visible)?;
    cache.cache_node(info.id, 1, &mut b, NodeVisibility::Visible)?;
    cache.cache_node(info.id, 2, &mut c, NodeVisibility::Visible)?;

    assert_eq!(a.key.hash, c.key.hash);
    assert!(!cache.grouped_instances_differ(a.id, b.id)?);
    assert!(cache.grouped_instances_differ(a.id, c.id)?);
    Ok(())
}

#[test]
fn test_refresh_finalized_waits_for_children_flags() -> Result<()> {
    let (cache, _temp_dir) = create_test_cache()?;
    let level = root_level(&cache)?;
    let mut info = data_source(&cache, level.id, vec![0], RulesetVariables::new())?;
    let mut node = instance_node("A", &["a"]);
    cache.cache_node(info.id, 0, &mut node, NodeVisibility::Visible)?;
    info.is_initialized = true;
    cache.update(&info, parts::IS_INITIALIZED)?;

    assert!(!cache.refresh_finalized(info.id)?);
    node.has_children = crate::models::HasChildren::No;
    cache.update_node(&node)?;
    assert!(cache.refresh_finalized(info.id)?);
    assert!(cache.get_data_source(info.id)?.map(|i| i.is_finalized).unwrap_or(false));
    Ok(())
}

#[test]
fn test_locate_node_by_path() -> Result<()> {
    let (cache, _temp_dir) = create_test_cache()?;
    let level = root_level(&cache)?;
    let info = data_source(&cache, level.id, vec![0], RulesetVariables::new())?;
    let mut node = instance_node("A", &["a"]);
    node.key.set_parent_path(&[]);
    cache.cache_node(info.id, 0, &mut node, NodeVisibility::Visible)?;

    let path = node.key.path_from_root.clone();
    assert_eq!(cache.locate_node("conn", "ruleset", &path)?.map(|n| n.id), Some(node.id));
    assert!(cache.locate_node("conn", "other", &path)?.is_none());
    Ok(())
}

// ============================================================================
// Invalidation
// ============================================================================

#[test]
fn test_is_initialized_and_new_variation() -> Result<()> {
    let (cache, _temp_dir) = create_test_cache()?;
    let level = root_level(&cache)?;
    let vars = RulesetVariables::new().with("mode", "a");
    assert!(!cache.is_initialized(level.id, None, None, &vars)?);

    let mut info = data_source(&cache, level.id, vec![0], vars.clone())?;
    assert!(!cache.is_initialized(level.id, None, None, &vars)?);
    info.is_initialized = true;
    cache.update(&info, parts::IS_INITIALIZED)?;
    assert!(cache.is_initialized(level.id, None, None, &vars)?);

    assert!(!cache.might_have_new_variation(level.id, &vars)?);
    assert!(cache.might_have_new_variation(level.id, &RulesetVariables::new().with("mode", "b"))?);
    assert!(!cache.might_have_new_variation(level.id, &vars.clone().with("other", 1))?);
    Ok(())
}

#[test]
fn test_removal_id_supersedes_level() -> Result<()> {
    let (cache, _temp_dir) = create_test_cache()?;
    let level = root_level(&cache)?;
    data_source(&cache, level.id, vec![0], RulesetVariables::new())?;

    let removal = cache
        .create_removal_id(&level.combined)?
        .expect("live level");
    assert!(cache.find_hierarchy_level_id(&level.combined, None)?.is_none());

    let mut superseded = level.combined.clone();
    superseded.removal_id = Some(removal);
    assert!(cache.find_hierarchy_level_id(&superseded, None)?.is_some());

    assert_eq!(cache.remove_hierarchy_level(removal)?, 1);
    assert!(cache.find_hierarchy_level_id(&superseded, None)?.is_none());
    assert!(cache.create_removal_id(&level.combined)?.is_none());
    Ok(())
}

#[test]
fn test_clear_removes_only_one_ruleset() -> Result<()> {
    let (cache, _temp_dir) = create_test_cache()?;
    let level = root_level(&cache)?;
    let other = CombinedHierarchyLevelIdentifier::new("conn", "other", None);
    cache.get_or_create_hierarchy_level(&other, None)?;

    assert_eq!(cache.clear("ruleset")?, 1);
    assert!(cache.find_hierarchy_level_id(&level.combined, None)?.is_none());
    assert!(cache.find_hierarchy_level_id(&other, None)?.is_some());
    Ok(())
}

#[test]
fn test_levels_using_classes() -> Result<()> {
    let (cache, _temp_dir) = create_test_cache()?;
    let level = root_level(&cache)?;
    let mut info = data_source(&cache, level.id, vec![0], RulesetVariables::new())?;
    info.select_classes = vec![DataSourceClass {
        class_name: "Widget".to_string(),
        polymorphic: false,
    }];
    cache.update(&info, parts::SELECT_CLASSES)?;

    let levels = cache.levels_using_classes(&["Widget".to_string()])?;
    assert_eq!(levels, vec![level.combined.clone()]);
    assert!(cache.levels_using_classes(&["Gadget".to_string()])?.is_empty());
    Ok(())
}
