//! Grouping handlers and their resolution
//!
//! A specification's instances pass through an ordered chain of grouping
//! handlers. At every hierarchy level each handler, in order, is offered the
//! select classes nobody has claimed yet and answers with an [`Acceptance`]:
//! it claims a class fully, rejects it, or claims the part of a polymorphic
//! select that derives from its own class and hands back the rest with that
//! part excluded. Whatever no handler claims becomes plain instance nodes.
//!
//! Handlers are ordered relationship, base-class, class, property, label,
//! same-label; the grouping node a handler produces remembers its handler index, and its
//! children are resolved from the next index on.

use serde_json::Value;
use std::collections::BTreeSet;

use crate::error::{HierarchyError, Result};
use crate::lookup::{ExpressionContext, ExpressionEvaluator, SchemaLookup};
use crate::models::{
    ChildNodeSpecification, GroupSpecification, GroupingRule, NavNode, NodeKind, PropertyGroupingValue,
    PropertyRange, RelationshipDirection, SameLabelStage, SpecificationKind, TrackedVariables,
};

use super::sql::SqlBuilder;

const NOT_SPECIFIED_LABEL: &str = "Not specified";
const OTHER_RANGE_LABEL: &str = "Other";
const OTHER_RANGE_KEY: &str = "other";

/// A class selected by a specification, optionally with derived classes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectClass {
    pub class: String,
    pub polymorphic: bool,

    /// Derived classes carved out by partial acceptance
    pub excluded: Vec<String>,
}

impl SelectClass {
    pub fn new(class: impl Into<String>, polymorphic: bool) -> Self {
        Self {
            class: class.into(),
            polymorphic,
            excluded: Vec::new(),
        }
    }
}

/// A handler's answer for one select class
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acceptance {
    Accept,
    Reject,
    AcceptPartially {
        accepted: SelectClass,
        remainder: SelectClass,
    },
}

/// One resolved grouping level
#[derive(Debug, Clone, PartialEq)]
pub enum GroupingHandler {
    /// Groups related instances under the relationship they were reached through
    Relationship { relationship: String },
    /// Groups every instance deriving from `base_class` under one node
    BaseClass {
        base_class: String,
        create_group_for_single_item: bool,
    },
    /// Groups instances by their own class
    Class,
    Property {
        rule_class: String,
        property: String,
        ranges: Vec<PropertyRange>,
        create_group_for_single_item: bool,
        create_group_for_unspecified_values: bool,
        image_id: Option<String>,

        /// Group by the raw value instead of its text
        group_by_value: bool,

        /// Order groups by the raw value instead of the label
        sort_by_value: bool,
    },
    /// Groups instances sharing a label; single instances stay instance nodes
    Label,
    /// Merges instances of `rule_class` sharing a label into one instance node
    SameLabel { rule_class: String },
}

impl GroupingHandler {
    /// Property handler for a property group of a rule targeting `rule_class`
    ///
    /// Sorting by raw value needs groups keyed by raw value; otherwise the
    /// groups sort by label.
    pub fn property(rule_class: &str, group: &GroupSpecification) -> Option<Self> {
        let GroupSpecification::PropertyGroup {
            property,
            ranges,
            create_group_for_single_item,
            create_group_for_unspecified_values,
            image_id,
            property_grouping_value,
            sorting_value,
        } = group
        else {
            return None;
        };
        let group_by_value = *property_grouping_value == PropertyGroupingValue::PropertyValue;
        let mut sort_by_value = *sorting_value == PropertyGroupingValue::PropertyValue;
        if sort_by_value && !group_by_value && ranges.is_empty() {
            tracing::warn!(
                class = %rule_class,
                property = %property,
                "property groups can only sort by value when grouped by value, sorting by label"
            );
            sort_by_value = false;
        }
        Some(GroupingHandler::Property {
            rule_class: rule_class.to_string(),
            property: property.clone(),
            ranges: ranges.clone(),
            create_group_for_single_item: *create_group_for_single_item,
            create_group_for_unspecified_values: *create_group_for_unspecified_values,
            image_id: image_id.clone(),
            group_by_value,
            sort_by_value,
        })
    }

    fn rank(&self) -> u8 {
        match self {
            GroupingHandler::Relationship { .. } => 0,
            GroupingHandler::BaseClass { .. } => 1,
            GroupingHandler::Class => 2,
            GroupingHandler::Property { .. } => 3,
            GroupingHandler::Label => 4,
            GroupingHandler::SameLabel { .. } => 5,
        }
    }

    /// Position of this handler's branch in the union; higher comes first
    pub fn union_priority(&self) -> i64 {
        match self {
            GroupingHandler::BaseClass { .. } => 6,
            GroupingHandler::Class => 5,
            GroupingHandler::Relationship { .. } => 4,
            GroupingHandler::Property { .. } => 3,
            GroupingHandler::Label => 2,
            GroupingHandler::SameLabel { .. } => 1,
        }
    }

    /// Kind of node the handler produces (label handlers may also yield instances)
    pub fn node_kind(&self) -> NodeKind {
        match self {
            GroupingHandler::Relationship { .. } => NodeKind::RelationshipGrouping,
            GroupingHandler::BaseClass { .. } | GroupingHandler::Class => NodeKind::ClassGrouping,
            GroupingHandler::Property { .. } => NodeKind::PropertyGrouping,
            GroupingHandler::Label => NodeKind::LabelGrouping,
            GroupingHandler::SameLabel { .. } => NodeKind::Instance,
        }
    }

    fn target_class(&self) -> Option<&str> {
        match self {
            GroupingHandler::BaseClass { base_class, .. } => Some(base_class),
            GroupingHandler::Property { rule_class, .. } | GroupingHandler::SameLabel { rule_class } => {
                Some(rule_class)
            }
            GroupingHandler::Relationship { .. } | GroupingHandler::Class | GroupingHandler::Label => None,
        }
    }

    /// Whether an enclosing base-class group already narrows instances to a
    /// class deriving from this handler's base class
    pub fn rejected_by_ancestors(&self, ancestor_bases: &[String], schema: &dyn SchemaLookup) -> bool {
        match self {
            GroupingHandler::BaseClass { base_class, .. } => ancestor_bases
                .iter()
                .any(|ancestor| ancestor != base_class && schema.is_a(ancestor, base_class)),
            _ => false,
        }
    }

    pub fn accept(&self, select: &SelectClass, schema: &dyn SchemaLookup) -> Acceptance {
        let Some(target) = self.target_class() else {
            return Acceptance::Accept;
        };
        if schema.is_a(&select.class, target) {
            return Acceptance::Accept;
        }
        let carves_out = select.polymorphic
            && schema.is_a(target, &select.class)
            && !select.excluded.iter().any(|excluded| schema.is_a(target, excluded));
        if !carves_out {
            return Acceptance::Reject;
        }
        let accepted = SelectClass {
            class: target.to_string(),
            polymorphic: true,
            excluded: select
                .excluded
                .iter()
                .filter(|excluded| schema.is_a(excluded, target))
                .cloned()
                .collect(),
        };
        let mut remainder = select.clone();
        remainder.excluded.push(target.to_string());
        Acceptance::AcceptPartially { accepted, remainder }
    }

    /// Group key expression over the `this` instance alias
    pub(crate) fn write_key(&self, sql: &mut SqlBuilder) {
        match self {
            GroupingHandler::Relationship { relationship } => {
                sql.bind(relationship.as_str());
            }
            GroupingHandler::BaseClass { base_class, .. } => {
                sql.bind(base_class.as_str());
            }
            GroupingHandler::Class => {
                sql.push("this.ClassName");
            }
            GroupingHandler::Property {
                property,
                ranges,
                group_by_value,
                ..
            } => {
                if !ranges.is_empty() {
                    sql.push("CASE WHEN ");
                    write_unspecified_condition(sql, property);
                    sql.push(" THEN NULL");
                    for (position, range) in ranges.iter().enumerate() {
                        write_range_condition(sql, property, range);
                        sql.bind(range_key(position));
                    }
                    sql.push(" ELSE ").bind(OTHER_RANGE_KEY).push(" END");
                } else if *group_by_value {
                    sql.push("NULLIF(");
                    write_property_value(sql, property);
                    sql.push(", '')");
                } else {
                    sql.push("NULLIF(CAST(");
                    write_property_value(sql, property);
                    sql.push(" AS TEXT), '')");
                }
            }
            GroupingHandler::Label | GroupingHandler::SameLabel { .. } => {
                sql.push("this.Label");
            }
        }
    }

    /// Group label expression over the `this` instance alias
    pub(crate) fn write_label(&self, sql: &mut SqlBuilder, schema: &dyn SchemaLookup, classes: &[String]) {
        match self {
            GroupingHandler::Relationship { relationship } => {
                let label = schema
                    .relationship(relationship)
                    .map(|info| info.label)
                    .unwrap_or_else(|| relationship.clone());
                sql.bind(label);
            }
            GroupingHandler::BaseClass { base_class, .. } => {
                sql.bind(schema.class_label(base_class));
            }
            GroupingHandler::Class => {
                sql.push("CASE this.ClassName");
                for class in classes {
                    sql.push(" WHEN ").bind(class.as_str()).push(" THEN ").bind(schema.class_label(class));
                }
                sql.push(" ELSE this.ClassName END");
            }
            GroupingHandler::Property { property, ranges, .. } => {
                sql.push("CASE WHEN ");
                write_unspecified_condition(sql, property);
                sql.push(" THEN ").bind(NOT_SPECIFIED_LABEL);
                if ranges.is_empty() {
                    sql.push(" ELSE CAST(");
                    write_property_value(sql, property);
                    sql.push(" AS TEXT) END");
                } else {
                    for range in ranges {
                        write_range_condition(sql, property, range);
                        sql.bind(range.display_label());
                    }
                    sql.push(" ELSE ").bind(OTHER_RANGE_LABEL).push(" END");
                }
            }
            GroupingHandler::Label | GroupingHandler::SameLabel { .. } => {
                sql.push("this.Label");
            }
        }
    }

    /// Predicate restricting instances to those grouped under `node`
    ///
    /// Replays the key expression the node was grouped by. Base-class groups
    /// need no predicate; their select classes already narrow the instances.
    pub(crate) fn write_filter(&self, node: &NavNode, sql: &mut SqlBuilder) -> bool {
        match self {
            GroupingHandler::Relationship { .. }
            | GroupingHandler::BaseClass { .. }
            | GroupingHandler::SameLabel { .. } => false,
            GroupingHandler::Class => {
                sql.push("this.ClassName = ")
                    .bind(node.key.class_name.clone().unwrap_or_default());
                true
            }
            GroupingHandler::Property { .. } | GroupingHandler::Label => {
                sql.push("(");
                self.write_key(sql);
                sql.push(") IS ")
                    .bind(node.key.grouping_value.clone().unwrap_or(Value::Null));
                true
            }
        }
    }
}

fn write_property_value(sql: &mut SqlBuilder, property: &str) {
    sql.push("json_extract(this.Properties, ")
        .bind(format!("$.\"{}\"", property))
        .push(")");
}

/// Group key of the range at `position`
pub(crate) fn range_key(position: usize) -> String {
    format!("range-{}", position)
}

fn write_unspecified_condition(sql: &mut SqlBuilder, property: &str) {
    write_property_value(sql, property);
    sql.push(" IS NULL OR ");
    write_property_value(sql, property);
    sql.push(" = ''");
}

fn write_range_condition(sql: &mut SqlBuilder, property: &str, range: &PropertyRange) {
    sql.push(" WHEN ");
    write_property_value(sql, property);
    sql.push(" >= ").bind(range.from).push(" AND ");
    write_property_value(sql, property);
    sql.push(" <= ").bind(range.to).push(" THEN ");
}

/// Hand `selects` to `handlers` in order
///
/// # Returns
///
/// The select classes each handler claimed (by handler index, only handlers
/// that claimed something) and the unclaimed rest.
pub fn distribute(
    selects: Vec<SelectClass>,
    handlers: &[(usize, &GroupingHandler)],
    ancestor_bases: &[String],
    schema: &dyn SchemaLookup,
) -> (Vec<(usize, Vec<SelectClass>)>, Vec<SelectClass>) {
    let mut remaining = selects;
    let mut claimed = Vec::new();
    for (index, handler) in handlers {
        if remaining.is_empty() {
            break;
        }
        if handler.rejected_by_ancestors(ancestor_bases, schema) {
            continue;
        }
        let mut accepted = Vec::new();
        let mut rest = Vec::new();
        for select in remaining {
            match handler.accept(&select, schema) {
                Acceptance::Accept => accepted.push(select),
                Acceptance::Reject => rest.push(select),
                Acceptance::AcceptPartially { accepted: part, remainder } => {
                    accepted.push(part);
                    rest.push(remainder);
                }
            }
        }
        if !accepted.is_empty() {
            claimed.push((*index, accepted));
        }
        remaining = rest;
    }
    (claimed, remaining)
}

/// Concrete class names covered by `selects`, sorted
pub fn concrete_classes(selects: &[SelectClass], schema: &dyn SchemaLookup) -> Vec<String> {
    let mut classes = BTreeSet::new();
    for select in selects {
        let candidates = if select.polymorphic {
            schema.derived_classes(&select.class)
        } else {
            vec![select.class.clone()]
        };
        for class in candidates {
            if !select.excluded.iter().any(|excluded| schema.is_a(&class, excluded)) {
                classes.insert(class);
            }
        }
    }
    classes.into_iter().collect()
}

/// Select classes of a specification
///
/// # Errors
///
/// [`HierarchyError::Misconfiguration`] when a related-instances
/// specification names an unknown relationship.
pub fn specification_selects(spec: &ChildNodeSpecification, schema: &dyn SchemaLookup) -> Result<Vec<SelectClass>> {
    match &spec.kind {
        SpecificationKind::AllInstances => Ok(schema
            .all_classes()
            .into_iter()
            .map(|class| SelectClass::new(class.name, false))
            .collect()),
        SpecificationKind::InstancesOfSpecificClasses { classes, polymorphic } => Ok(classes
            .iter()
            .map(|class| SelectClass::new(class.as_str(), *polymorphic))
            .collect()),
        SpecificationKind::RelatedInstances {
            relationship,
            direction,
            target_classes,
        } => {
            if !target_classes.is_empty() {
                return Ok(target_classes
                    .iter()
                    .map(|class| SelectClass::new(class.as_str(), true))
                    .collect());
            }
            let info = schema.relationship(relationship).ok_or_else(|| {
                HierarchyError::misconfiguration(format!(
                    "specification '{}' uses unknown relationship '{}'",
                    spec.id, relationship
                ))
            })?;
            let class = match direction {
                RelationshipDirection::Forward => info.target_class,
                RelationshipDirection::Backward => info.source_class,
            };
            Ok(vec![SelectClass::new(class, true)])
        }
        SpecificationKind::CustomNode { .. } => Ok(Vec::new()),
    }
}

/// Grouping chain for one specification
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedGrouping {
    pub handlers: Vec<GroupingHandler>,

    /// Same-label merging requested for the post-processing stage
    pub merge_same_label_after_query: bool,
}

/// Resolves grouping rules into an ordered handler chain
pub struct GroupingResolver<'a> {
    schema: &'a dyn SchemaLookup,
    evaluator: &'a dyn ExpressionEvaluator,
}

impl<'a> GroupingResolver<'a> {
    pub fn new(schema: &'a dyn SchemaLookup, evaluator: &'a dyn ExpressionEvaluator) -> Self {
        Self { schema, evaluator }
    }

    /// Build the handler chain of `spec` under `parent`
    ///
    /// Rules are consulted highest priority first; a rule applies when one of
    /// the specification's classes derives from the rule's class and its
    /// condition holds. Variables read by conditions are recorded in
    /// `variables`.
    pub fn resolve(
        &self,
        spec: &ChildNodeSpecification,
        rules: &[GroupingRule],
        parent: Option<&NavNode>,
        variables: &TrackedVariables,
    ) -> Result<ResolvedGrouping> {
        let selects = specification_selects(spec, self.schema)?;
        let classes = concrete_classes(&selects, self.schema);
        let mut resolved = ResolvedGrouping::default();
        let mut seen_properties = BTreeSet::new();
        let mut seen_bases = BTreeSet::new();
        let mut same_label_classes = BTreeSet::new();

        for rule in rules {
            let applies = classes.iter().any(|class| self.schema.is_a(class, &rule.class))
                || selects
                    .iter()
                    .any(|select| select.polymorphic && self.schema.is_a(&rule.class, &select.class));
            if !applies {
                continue;
            }
            if let Some(condition) = &rule.condition {
                let context = ExpressionContext::new(variables).with_parent(parent);
                if !self.evaluator.evaluate_bool(condition, &context)? {
                    continue;
                }
            }
            for group in &rule.groups {
                match group {
                    GroupSpecification::ClassGroup {
                        base_class,
                        create_group_for_single_item,
                    } => {
                        let base_class = base_class.clone().unwrap_or_else(|| rule.class.clone());
                        if seen_bases.insert(base_class.clone()) {
                            resolved.handlers.push(GroupingHandler::BaseClass {
                                base_class,
                                create_group_for_single_item: *create_group_for_single_item,
                            });
                        }
                    }
                    GroupSpecification::PropertyGroup { property, .. } => {
                        if seen_properties.insert((rule.class.clone(), property.clone())) {
                            resolved.handlers.extend(GroupingHandler::property(&rule.class, group));
                        }
                    }
                    GroupSpecification::SameLabelInstanceGroup { application_stage } => match application_stage {
                        SameLabelStage::Query => {
                            if same_label_classes.insert(rule.class.clone()) {
                                resolved.handlers.push(GroupingHandler::SameLabel {
                                    rule_class: rule.class.clone(),
                                });
                            }
                        }
                        SameLabelStage::PostProcess => resolved.merge_same_label_after_query = true,
                    },
                }
            }
        }

        if spec.group_by_relationship {
            if let SpecificationKind::RelatedInstances { relationship, .. } = &spec.kind {
                resolved.handlers.push(GroupingHandler::Relationship {
                    relationship: relationship.clone(),
                });
            }
        }
        if spec.group_by_class {
            resolved.handlers.push(GroupingHandler::Class);
        }
        if spec.group_by_label {
            resolved.handlers.push(GroupingHandler::Label);
        }
        resolved.handlers.sort_by_key(GroupingHandler::rank);
        tracing::debug!(
            specification = %spec.id,
            handlers = resolved.handlers.len(),
            "resolved grouping handlers"
        );
        Ok(resolved)
    }
}

#[cfg(test)]
#[path = "grouping_test.rs"]
mod grouping_test;
