use super::*;
use crate::lookup::{SchemaCatalog, SimpleExpressionEvaluator};
use crate::models::RulesetVariables;

fn schema() -> SchemaCatalog {
    SchemaCatalog::new()
        .with_class("Element", "Element", &[])
        .with_class("Physical", "Physical Element", &["Element"])
        .with_class("Widget", "Widget", &["Physical"])
        .with_class("Note", "Note", &["Element"])
}

fn base(class: &str) -> GroupingHandler {
    GroupingHandler::BaseClass {
        base_class: class.to_string(),
        create_group_for_single_item: true,
    }
}

#[test]
fn test_base_class_accepts_partially_from_polymorphic_select() {
    let schema = schema();
    let handler = base("Physical");

    let select = SelectClass::new("Element", true);
    match handler.accept(&select, &schema) {
        Acceptance::AcceptPartially { accepted, remainder } => {
            assert_eq!(accepted, SelectClass::new("Physical", true));
            assert_eq!(remainder.excluded, vec!["Physical".to_string()]);
            assert_eq!(concrete_classes(&[remainder], &schema), vec!["Element", "Note"]);
        }
        other => panic!("unexpected acceptance {:?}", other),
    }

    assert_eq!(handler.accept(&SelectClass::new("Widget", false), &schema), Acceptance::Accept);
    assert_eq!(handler.accept(&SelectClass::new("Element", false), &schema), Acceptance::Reject);
    assert_eq!(handler.accept(&SelectClass::new("Note", true), &schema), Acceptance::Reject);
}

#[test]
fn test_distribute_hands_remainder_to_later_handlers() {
    let schema = schema();
    let physical = base("Physical");
    let class = GroupingHandler::Class;
    let handlers = vec![(0, &physical), (1, &class)];

    let (claimed, remaining) = distribute(vec![SelectClass::new("Element", true)], &handlers, &[], &schema);
    assert!(remaining.is_empty());
    assert_eq!(claimed.len(), 2);
    assert_eq!(claimed[0].0, 0);
    assert_eq!(concrete_classes(&claimed[0].1, &schema), vec!["Physical", "Widget"]);
    assert_eq!(claimed[1].0, 1);
    assert_eq!(concrete_classes(&claimed[1].1, &schema), vec!["Element", "Note"]);
}

#[test]
fn test_more_specific_ancestor_rejects_base_class() {
    let schema = schema();
    let element = base("Element");
    assert!(element.rejected_by_ancestors(&["Physical".to_string()], &schema));
    assert!(!element.rejected_by_ancestors(&["Element".to_string()], &schema));
    assert!(!base("Physical").rejected_by_ancestors(&["Element".to_string()], &schema));

    let handlers = vec![(1, &element)];
    let (claimed, remaining) = distribute(
        vec![SelectClass::new("Widget", false)],
        &handlers,
        &["Physical".to_string()],
        &schema,
    );
    assert!(claimed.is_empty());
    assert_eq!(remaining.len(), 1);
}

#[test]
fn test_resolver_orders_handlers() -> anyhow::Result<()> {
    let schema = schema();
    let evaluator = SimpleExpressionEvaluator::new();
    let rules: Vec<GroupingRule> = serde_json::from_value(serde_json::json!([
        {
            "class": "Widget",
            "groups": [
                { "type": "propertyGroup", "property": "Color" },
                { "type": "sameLabelInstanceGroup", "applicationStage": "postProcess" }
            ]
        },
        {
            "class": "Element",
            "groups": [{ "type": "classGroup", "baseClass": "Physical" }]
        },
        {
            "class": "Widget",
            "condition": "$var.groupBySize",
            "groups": [{ "type": "propertyGroup", "property": "Size" }]
        },
        {
            "class": "Note",
            "groups": [{ "type": "propertyGroup", "property": "Text" }]
        }
    ]))?;

    let mut spec = ChildNodeSpecification::new(
        "widgets",
        SpecificationKind::InstancesOfSpecificClasses {
            classes: vec!["Widget".to_string()],
            polymorphic: false,
        },
    );
    spec.group_by_label = true;
    spec.group_by_class = true;

    let variables = TrackedVariables::new(RulesetVariables::new());
    let resolved = GroupingResolver::new(&schema, &evaluator).resolve(&spec, &rules, None, &variables)?;

    assert_eq!(resolved.handlers.len(), 4);
    assert!(matches!(resolved.handlers[0], GroupingHandler::BaseClass { .. }));
    assert_eq!(resolved.handlers[1], GroupingHandler::Class);
    assert!(matches!(&resolved.handlers[2], GroupingHandler::Property { property, .. } if property == "Color"));
    assert_eq!(resolved.handlers[3], GroupingHandler::Label);
    assert!(resolved.merge_same_label_after_query);
    assert!(variables.used_names().contains("groupBySize"));
    Ok(())
}

#[test]
fn test_unknown_relationship_is_misconfiguration() {
    let spec = ChildNodeSpecification::new(
        "related",
        SpecificationKind::RelatedInstances {
            relationship: "Missing".to_string(),
            direction: RelationshipDirection::Forward,
            target_classes: Vec::new(),
        },
    );
    let result = specification_selects(&spec, &schema());
    assert!(matches!(result, Err(HierarchyError::Misconfiguration { .. })));
}

#[test]
fn test_relationship_grouping_comes_first() -> anyhow::Result<()> {
    let schema = schema().with_relationship("Owns", "Owned notes", "Widget", "Note");
    let evaluator = SimpleExpressionEvaluator::new();
    let rules: Vec<GroupingRule> = serde_json::from_value(serde_json::json!([
        { "class": "Note", "groups": [{ "type": "propertyGroup", "property": "Text" }] }
    ]))?;
    let mut spec = ChildNodeSpecification::new(
        "notes",
        SpecificationKind::RelatedInstances {
            relationship: "Owns".to_string(),
            direction: RelationshipDirection::Forward,
            target_classes: Vec::new(),
        },
    );
    spec.group_by_relationship = true;
    spec.group_by_class = true;

    let variables = TrackedVariables::new(RulesetVariables::new());
    let resolved = GroupingResolver::new(&schema, &evaluator).resolve(&spec, &rules, None, &variables)?;
    assert_eq!(resolved.handlers.len(), 3);
    assert_eq!(
        resolved.handlers[0],
        GroupingHandler::Relationship {
            relationship: "Owns".to_string()
        }
    );
    assert_eq!(resolved.handlers[1], GroupingHandler::Class);
    assert_eq!(resolved.handlers[0].node_kind(), NodeKind::RelationshipGrouping);
    assert!(resolved.handlers[0].union_priority() > resolved.handlers[2].union_priority());
    assert!(resolved.handlers[1].union_priority() > resolved.handlers[0].union_priority());

    // only related-instances specifications group by relationship
    let mut plain = ChildNodeSpecification::new(
        "widgets",
        SpecificationKind::InstancesOfSpecificClasses {
            classes: vec!["Widget".to_string()],
            polymorphic: false,
        },
    );
    plain.group_by_relationship = true;
    let resolved = GroupingResolver::new(&schema, &evaluator).resolve(&plain, &[], None, &variables)?;
    assert!(resolved.handlers.is_empty());
    Ok(())
}

#[test]
fn test_sorting_by_value_needs_grouping_by_value() -> anyhow::Result<()> {
    let group: GroupSpecification = serde_json::from_value(serde_json::json!({
        "type": "propertyGroup",
        "property": "Size",
        "sortingValue": "propertyValue"
    }))?;
    let handler = GroupingHandler::property("Widget", &group).ok_or_else(|| anyhow::anyhow!("no handler"))?;
    assert!(matches!(
        handler,
        GroupingHandler::Property {
            group_by_value: false,
            sort_by_value: false,
            ..
        }
    ));

    let group: GroupSpecification = serde_json::from_value(serde_json::json!({
        "type": "propertyGroup",
        "property": "Size",
        "propertyGroupingValue": "propertyValue",
        "sortingValue": "propertyValue"
    }))?;
    let handler = GroupingHandler::property("Widget", &group).ok_or_else(|| anyhow::anyhow!("no handler"))?;
    assert!(matches!(
        handler,
        GroupingHandler::Property {
            group_by_value: true,
            sort_by_value: true,
            ..
        }
    ));

    let same_label = GroupSpecification::SameLabelInstanceGroup {
        application_stage: SameLabelStage::Query,
    };
    assert!(GroupingHandler::property("Widget", &same_label).is_none());
    Ok(())
}
