//! Navigation query construction
//!
//! Turns one specification, its resolved grouping chain and the parent's
//! grouping ancestry into a single SQL statement over the instance store.
//!
//! # Query shape
//!
//! Every handler that claims select classes at this level contributes one
//! union branch, and the unclaimed classes contribute an instance branch.
//! Each branch reads the same filtered instance subquery `g` and emits:
//!
//! | column | meaning |
//! |---|---|
//! | `NodeType` | node kind tag |
//! | `ClassName` | instance class, grouped class or grouping rule class |
//! | `Label` | display label |
//! | `GroupingValue` | group key for grouping nodes |
//! | `GroupedCount` | instances behind the row |
//! | `InstanceKeys` | JSON array of instance ids |
//! | `BranchIndex` | position in [`NavigationQuery::branches`] |
//!
//! Branches are ordered by union priority (base-class groups first, plain
//! instances last) and each branch by its own sort order.

use serde_json::Value;

use crate::error::{HierarchyError, Result};
use crate::lookup::SchemaLookup;
use crate::models::{
    ChildNodeSpecification, NavNode, RelationshipDirection, SortingRule, SpecificationKind,
};

use super::grouping::{
    concrete_classes, distribute, range_key, specification_selects, GroupingHandler, SelectClass,
};
use super::sql::SqlBuilder;

/// What produced one union branch
#[derive(Debug, Clone, PartialEq)]
pub struct QueryBranch {
    /// Handler index in the grouping chain; `None` for plain instances
    pub handler_index: Option<usize>,
    pub handler: Option<GroupingHandler>,
}

/// A built navigation query
#[derive(Debug, Clone, PartialEq)]
pub struct NavigationQuery {
    pub sql: String,
    pub bindings: Vec<Value>,
    pub branches: Vec<QueryBranch>,

    /// Concrete classes the query may return
    pub classes: Vec<String>,
}

impl NavigationQuery {
    /// `SELECT COUNT(*)` over the query
    pub fn count_query(&self) -> (String, Vec<Value>) {
        (format!("SELECT COUNT(*) FROM ({})", self.sql), self.bindings.clone())
    }

    /// `SELECT EXISTS` over the query
    pub fn exists_query(&self) -> (String, Vec<Value>) {
        (format!("SELECT EXISTS ({})", self.sql), self.bindings.clone())
    }

    /// The query restricted to `limit` rows from `offset`
    pub fn paged(&self, offset: usize, limit: usize) -> (String, Vec<Value>) {
        let mut bindings = self.bindings.clone();
        bindings.push(Value::from(limit as u64));
        bindings.push(Value::from(offset as u64));
        (format!("{} LIMIT ? OFFSET ?", self.sql), bindings)
    }
}

/// Inputs of one navigation query
pub struct QueryContext<'a> {
    pub specification: &'a ChildNodeSpecification,

    /// Node the specification was applied under (above every grouping node
    /// of the specification)
    pub spec_parent: Option<&'a NavNode>,

    /// Grouping ancestors produced by the same specification, outermost
    /// first, ending with the direct parent
    pub group_chain: &'a [NavNode],

    pub handlers: &'a [GroupingHandler],
    pub sorting_rules: &'a [SortingRule],
    pub schema: &'a dyn SchemaLookup,

    /// Request-level instance predicate over the `this` alias
    pub instance_filter: Option<&'a str>,
}

/// Builds [`NavigationQuery`] values
pub struct NavigationQueryBuilder<'a> {
    context: QueryContext<'a>,
}

impl<'a> NavigationQueryBuilder<'a> {
    pub fn new(context: QueryContext<'a>) -> Self {
        Self { context }
    }

    /// Build the query
    ///
    /// # Returns
    ///
    /// `None` when the specification selects nothing at this level (no
    /// classes left after replaying the parent groups, or a custom node
    /// specification).
    ///
    /// # Errors
    ///
    /// [`HierarchyError::Misconfiguration`] for a related-instances
    /// specification without an instance parent or with an unknown
    /// relationship; [`HierarchyError::Invariant`] when a grouping parent
    /// refers to a handler that does not exist.
    pub fn build(&self) -> Result<Option<NavigationQuery>> {
        let ctx = &self.context;
        let mut selects = specification_selects(ctx.specification, ctx.schema)?;
        if selects.is_empty() {
            return Ok(None);
        }

        // Replay the parent groups: narrow the selects and collect filters
        let mut start = 0usize;
        let mut ancestor_bases: Vec<String> = Vec::new();
        let mut group_filters = SqlBuilder::new();
        for ancestor in ctx.group_chain {
            let level = ancestor.extended.grouping_level.ok_or_else(|| {
                HierarchyError::invariant(format!("grouping node '{}' has no grouping level", ancestor.label))
            })?;
            let handler = ctx.handlers.get(level).ok_or_else(|| {
                HierarchyError::invariant(format!(
                    "grouping node '{}' refers to missing handler {}",
                    ancestor.label, level
                ))
            })?;
            if level < start {
                return Err(HierarchyError::invariant("grouping ancestors are out of order"));
            }
            let candidates: Vec<(usize, &GroupingHandler)> =
                (start..=level).map(|index| (index, &ctx.handlers[index])).collect();
            let (claimed, _) = distribute(selects, &candidates, &ancestor_bases, ctx.schema);
            selects = claimed
                .into_iter()
                .find(|(index, _)| *index == level)
                .map(|(_, claimed)| claimed)
                .unwrap_or_default();
            if selects.is_empty() {
                return Ok(None);
            }
            let mut filter = SqlBuilder::new();
            if handler.write_filter(ancestor, &mut filter) {
                group_filters.push(" AND ").append(filter);
            }
            if let GroupingHandler::BaseClass { base_class, .. } = handler {
                ancestor_bases.push(base_class.clone());
            }
            start = level + 1;
        }

        let candidates: Vec<(usize, &GroupingHandler)> = ctx
            .handlers
            .iter()
            .enumerate()
            .skip(start)
            .collect();
        let (claimed, remaining) = distribute(selects, &candidates, &ancestor_bases, ctx.schema);

        let mut branches = Vec::new();
        let mut union = Vec::new();
        let mut all_classes = Vec::new();
        for (index, claimed_selects) in claimed {
            let classes = concrete_classes(&claimed_selects, ctx.schema);
            if classes.is_empty() {
                continue;
            }
            let handler = &ctx.handlers[index];
            union.push(self.grouping_branch(branches.len(), handler, &classes, &group_filters)?);
            branches.push(QueryBranch {
                handler_index: Some(index),
                handler: Some(handler.clone()),
            });
            all_classes.extend(classes);
        }
        let classes = concrete_classes(&remaining, ctx.schema);
        if !classes.is_empty() {
            union.push(self.instance_branch(branches.len(), &classes, &group_filters)?);
            branches.push(QueryBranch {
                handler_index: None,
                handler: None,
            });
            all_classes.extend(classes);
        }
        if union.is_empty() {
            return Ok(None);
        }

        let mut sql = SqlBuilder::new();
        sql.push(
            "SELECT NodeType, ClassName, Label, GroupingValue, GroupedCount, InstanceKeys, BranchIndex FROM (",
        );
        for (position, branch) in union.into_iter().enumerate() {
            if position > 0 {
                sql.push(" UNION ALL ");
            }
            sql.push("SELECT * FROM (").append(branch).push(")");
        }
        sql.push(") ORDER BY UnionPriority DESC, BranchIndex, RowOrder");

        all_classes.sort();
        all_classes.dedup();
        let (sql, bindings) = sql.into_parts();
        Ok(Some(NavigationQuery {
            sql,
            bindings,
            branches,
            classes: all_classes,
        }))
    }

    /// `g`: the filtered instances of `classes` with key, label and sort columns
    fn instances_subquery(
        &self,
        classes: &[String],
        handler: Option<&GroupingHandler>,
        group_filters: &SqlBuilder,
    ) -> Result<SqlBuilder> {
        let ctx = &self.context;
        let mut sql = SqlBuilder::new();
        sql.push("SELECT this.Id AS Id, this.ClassName AS ClassName, this.Label AS Label, this.rowid AS Seq, ");
        match self.instance_sort(classes) {
            InstanceSort::Label { .. } => {
                sql.push("sorting_value(this.Label)");
            }
            InstanceSort::Property { property, .. } => {
                sql.push("json_extract(this.Properties, ")
                    .bind(format!("$.\"{}\"", property))
                    .push(")");
            }
            InstanceSort::Unsorted => {
                sql.push("NULL");
            }
        }
        sql.push(" AS SortKey, ");
        match handler {
            Some(handler) => {
                handler.write_key(&mut sql);
                sql.push(" AS GroupKey, ");
                handler.write_label(&mut sql, ctx.schema, classes);
                sql.push(" AS GroupLabel");
            }
            None => {
                sql.push("NULL AS GroupKey, NULL AS GroupLabel");
            }
        }
        sql.push(" FROM Instances this WHERE this.ClassName IN (")
            .bind_list(classes.iter().map(String::as_str))
            .push(")");

        if let SpecificationKind::RelatedInstances {
            relationship,
            direction,
            ..
        } = &ctx.specification.kind
        {
            let parent = ctx.spec_parent.filter(|parent| !parent.instance_keys().is_empty()).ok_or_else(|| {
                HierarchyError::misconfiguration(format!(
                    "specification '{}' selects related instances without an instance parent",
                    ctx.specification.id
                ))
            })?;
            let (selected, anchor) = match direction {
                RelationshipDirection::Forward => ("TargetId", "SourceId"),
                RelationshipDirection::Backward => ("SourceId", "TargetId"),
            };
            sql.push(&format!(" AND this.Id IN (SELECT r.{} FROM Relationships r WHERE r.ClassName = ", selected))
                .bind(relationship.as_str())
                .push(&format!(" AND r.{} IN (SELECT value FROM json_each(", anchor))
                .bind(serde_json::to_string(parent.instance_keys())?)
                .push(")))");
        }
        if let Some(filter) = &ctx.specification.instance_filter {
            sql.push(" AND (").push(filter).push(")");
        }
        if let Some(filter) = ctx.instance_filter {
            sql.push(" AND (").push(filter).push(")");
        }
        sql.append(group_filters.clone());
        Ok(sql)
    }

    fn grouping_branch(
        &self,
        branch_index: usize,
        handler: &GroupingHandler,
        classes: &[String],
        group_filters: &SqlBuilder,
    ) -> Result<SqlBuilder> {
        let inner = self.instances_subquery(classes, Some(handler), group_filters)?;
        let priority = handler.union_priority();
        let (node_type, class_column, label_column, value_column, group_by) = match handler {
            GroupingHandler::Relationship { relationship } => (
                "'relationship-grouping'".to_string(),
                sql_literal(relationship),
                "MIN(g.GroupLabel)",
                "g.GroupKey",
                "g.GroupKey",
            ),
            GroupingHandler::BaseClass { base_class, .. } => (
                "'class-grouping'".to_string(),
                sql_literal(base_class),
                "MIN(g.GroupLabel)",
                "g.GroupKey",
                "g.GroupKey",
            ),
            GroupingHandler::Class => (
                "'class-grouping'".to_string(),
                "g.GroupKey".to_string(),
                "MIN(g.GroupLabel)",
                "g.GroupKey",
                "g.GroupKey",
            ),
            GroupingHandler::Property { rule_class, .. } => (
                "'property-grouping'".to_string(),
                sql_literal(rule_class),
                "MIN(g.GroupLabel)",
                "g.GroupKey",
                "g.GroupKey",
            ),
            GroupingHandler::Label => (
                "CASE WHEN COUNT(*) > 1 THEN 'label-grouping' ELSE 'instance' END".to_string(),
                "MIN(g.ClassName)".to_string(),
                "MIN(g.GroupLabel)",
                "g.GroupKey",
                "g.GroupKey",
            ),
            GroupingHandler::SameLabel { .. } => (
                "'instance'".to_string(),
                "g.ClassName".to_string(),
                "MIN(g.Label)",
                "NULL",
                "g.ClassName, g.GroupKey",
            ),
        };
        let order = match handler {
            GroupingHandler::SameLabel { .. } => self.instance_order("b.SortKey", "b.Seq", classes),
            _ if matches!(self.instance_sort(classes), InstanceSort::Unsorted) => "b.Seq".to_string(),
            GroupingHandler::Property {
                sort_by_value: true,
                ranges,
                ..
            } => grouping_value_order(ranges.len()),
            _ => "sorting_value(b.Label), b.Seq".to_string(),
        };

        let mut sql = SqlBuilder::new();
        sql.push(&format!(
            "SELECT b.NodeType, b.ClassName, b.Label, b.GroupingValue, b.GroupedCount, b.InstanceKeys, \
             b.BranchIndex, b.UnionPriority, ROW_NUMBER() OVER (ORDER BY {}) AS RowOrder FROM (\
             SELECT {} AS NodeType, {} AS ClassName, {} AS Label, {} AS GroupingValue, COUNT(*) AS GroupedCount, \
             json_group_array(g.Id) AS InstanceKeys, {} AS BranchIndex, {} AS UnionPriority, \
             MIN(g.Seq) AS Seq, MIN(g.SortKey) AS SortKey FROM (",
            order, node_type, class_column, label_column, value_column, branch_index, priority
        ))
        .append(inner)
        .push(&format!(") g GROUP BY {}) b", group_by));
        Ok(sql)
    }

    fn instance_branch(&self, branch_index: usize, classes: &[String], group_filters: &SqlBuilder) -> Result<SqlBuilder> {
        let inner = self.instances_subquery(classes, None, group_filters)?;
        let order = self.instance_order("g.SortKey", "g.Seq", classes);
        let mut sql = SqlBuilder::new();
        sql.push(&format!(
            "SELECT 'instance' AS NodeType, g.ClassName AS ClassName, g.Label AS Label, NULL AS GroupingValue, \
             1 AS GroupedCount, json_array(g.Id) AS InstanceKeys, {} AS BranchIndex, 0 AS UnionPriority, \
             ROW_NUMBER() OVER (ORDER BY {}) AS RowOrder FROM (",
            branch_index, order
        ))
        .append(inner)
        .push(") g");
        Ok(sql)
    }

    fn instance_order(&self, sort_column: &str, seq_column: &str, classes: &[String]) -> String {
        match self.instance_sort(classes) {
            InstanceSort::Unsorted => seq_column.to_string(),
            InstanceSort::Label { ascending } | InstanceSort::Property { ascending, .. } => format!(
                "{} {}, {}",
                sort_column,
                if ascending { "ASC" } else { "DESC" },
                seq_column
            ),
        }
    }

    /// Sort order of instance rows
    ///
    /// The highest-priority sorting rule that targets one of `classes` wins,
    /// including a do-not-sort rule. Without a rule instances sort by label.
    /// Grouping branches use the same resolution to decide whether they sort.
    fn instance_sort(&self, classes: &[String]) -> InstanceSort {
        let ctx = &self.context;
        if ctx.specification.do_not_sort {
            return InstanceSort::Unsorted;
        }
        let rule = ctx
            .sorting_rules
            .iter()
            .find(|rule| classes.iter().any(|class| ctx.schema.is_a(class, &rule.class)));
        match rule {
            Some(rule) if rule.do_not_sort => InstanceSort::Unsorted,
            Some(SortingRule {
                property: Some(property),
                ascending,
                ..
            }) => InstanceSort::Property {
                property: property.clone(),
                ascending: *ascending,
            },
            Some(rule) => InstanceSort::Label {
                ascending: rule.ascending,
            },
            None => InstanceSort::Label { ascending: true },
        }
    }
}

enum InstanceSort {
    Label { ascending: bool },
    Property { property: String, ascending: bool },
    Unsorted,
}

/// Order of property groups by value; range groups keep their declared order
fn grouping_value_order(range_count: usize) -> String {
    if range_count == 0 {
        return "b.GroupingValue, b.Seq".to_string();
    }
    let mut order = String::from("CASE WHEN b.GroupingValue IS NULL THEN -1");
    for position in 0..range_count {
        order.push_str(&format!(" WHEN b.GroupingValue = '{}' THEN {}", range_key(position), position));
    }
    order.push_str(&format!(" ELSE {} END, b.Seq", range_count));
    order
}

/// Quote a schema identifier as an SQL string literal
fn sql_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

#[cfg(test)]
#[path = "builder_test.rs"]
mod builder_test;
