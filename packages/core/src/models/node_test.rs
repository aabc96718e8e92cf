//! Tests for navigation node keys and hashing

#[cfg(test)]
mod tests {
    use crate::models::{HasChildren, NavNode, NodeKey, NodeKind};
    use serde_json::json;

    // ========================================================================
    // Hash Stability
    // ========================================================================

    #[test]
    fn test_instance_hash_ignores_key_order() {
        let a = NodeKey::instance("spec", "Widget", vec!["b".into(), "a".into()]);
        let b = NodeKey::instance("spec", "Widget", vec!["a".into(), "b".into()]);
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.instance_keys, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_hash_ignores_parent_path() {
        let mut a = NodeKey::instance("spec", "Person", vec!["p1".into()]);
        let b = NodeKey::instance("spec", "Person", vec!["p1".into()]);
        a.set_parent_path(&["root".to_string(), "child".to_string()]);
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.path_from_root.len(), 3);
        assert_eq!(a.path_from_root.last(), Some(&a.hash));
    }

    #[test]
    fn test_grouping_hash_ignores_instances() {
        let a = NodeKey::new(
            NodeKind::LabelGrouping,
            "spec",
            Some("Widget".into()),
            Some(json!("A")),
            vec!["1".into(), "2".into()],
        );
        let b = NodeKey::new(
            NodeKind::LabelGrouping,
            "spec",
            Some("Widget".into()),
            Some(json!("A")),
            vec!["3".into()],
        );
        assert_eq!(a.hash, b.hash);
    }

    #[test]
    fn test_hash_differs_by_kind_and_value() {
        let label = NodeKey::new(NodeKind::LabelGrouping, "spec", None, Some(json!("A")), vec![]);
        let property = NodeKey::new(NodeKind::PropertyGrouping, "spec", None, Some(json!("A")), vec![]);
        let other = NodeKey::new(NodeKind::LabelGrouping, "spec", None, Some(json!("B")), vec![]);
        assert_ne!(label.hash, property.hash);
        assert_ne!(label.hash, other.hash);
    }

    #[test]
    fn test_set_instance_keys_refreshes_hash_and_path() {
        let mut key = NodeKey::instance("spec", "Widget", vec!["1".into()]);
        key.set_parent_path(&[]);
        let before = key.hash.clone();
        key.set_instance_keys(vec!["2".into(), "1".into()]);
        assert_ne!(before, key.hash);
        assert_eq!(key.path_from_root, vec![key.hash.clone()]);
    }

    // ========================================================================
    // Node helpers
    // ========================================================================

    #[test]
    fn test_unspecified_grouping_value() {
        let null_group = NavNode::new(
            NodeKey::new(NodeKind::PropertyGrouping, "spec", None, None, vec![]),
            "Not specified",
        );
        let empty_group = NavNode::new(
            NodeKey::new(NodeKind::PropertyGrouping, "spec", None, Some(json!("")), vec![]),
            "Not specified",
        );
        let red = NavNode::new(
            NodeKey::new(NodeKind::PropertyGrouping, "spec", None, Some(json!("red")), vec![]),
            "red",
        );
        assert!(null_group.has_unspecified_grouping_value());
        assert!(empty_group.has_unspecified_grouping_value());
        assert!(!red.has_unspecified_grouping_value());
    }

    #[test]
    fn test_node_serialization_round_trip_keeps_flags() {
        let mut node = NavNode::new(NodeKey::custom("spec", "folder"), "Folder");
        node.has_children = HasChildren::Yes;
        node.extended.hide_if_no_children = true;

        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["hasChildren"], "yes");
        assert_eq!(json["key"]["kind"], "custom");
        assert_eq!(json["extended"]["hideIfNoChildren"], true);

        let back: NavNode = serde_json::from_value(json).unwrap();
        assert_eq!(back, node);
    }
}
