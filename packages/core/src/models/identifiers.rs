//! Cache identities for hierarchy levels and data sources

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::variables::RulesetVariables;

/// Key of a physical hierarchy level: every node displayed under one parent
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CombinedHierarchyLevelIdentifier {
    pub connection_id: String,
    pub ruleset_id: String,
    pub physical_parent_id: Option<Uuid>,
    pub removal_id: Option<Uuid>,
}

impl CombinedHierarchyLevelIdentifier {
    pub fn new(
        connection_id: impl Into<String>,
        ruleset_id: impl Into<String>,
        physical_parent_id: Option<Uuid>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            ruleset_id: ruleset_id.into(),
            physical_parent_id,
            removal_id: None,
        }
    }
}

/// A hierarchy level: the nodes produced for one (possibly virtual) parent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HierarchyLevelIdentifier {
    pub id: Uuid,
    pub physical_level_id: Uuid,
    pub combined: CombinedHierarchyLevelIdentifier,
    pub virtual_parent_id: Option<Uuid>,
}

/// Identity of one data source within a level
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceIdentifier {
    pub hierarchy_level_id: Uuid,

    /// Position among sibling providers, outermost first
    pub index: Vec<u64>,

    pub instance_filter: Option<String>,
    pub result_set_size_limit: Option<usize>,
}

impl DataSourceIdentifier {
    /// Zero-padded textual index; lexical order equals index order
    pub fn full_index(&self) -> String {
        format_full_index(&self.index)
    }
}

pub fn format_full_index(index: &[u64]) -> String {
    index
        .iter()
        .map(|part| format!("{:010}", part))
        .collect::<Vec<_>>()
        .join("-")
}

/// Column groups of a data source row, for targeted partial updates
pub mod parts {
    pub const RELATED_VARIABLES: u32 = 1 << 0;
    pub const SPECIFICATION_HASH: u32 = 1 << 1;
    pub const NODE_TYPES: u32 = 1 << 2;
    pub const DIRECT_NODES_COUNT: u32 = 1 << 3;
    pub const TOTAL_NODES_COUNT: u32 = 1 << 4;
    pub const HAS_NODES: u32 = 1 << 5;
    pub const IS_INITIALIZED: u32 = 1 << 6;
    pub const IS_FINALIZED: u32 = 1 << 7;
    pub const CUSTOM_JSON: u32 = 1 << 8;
    pub const SELECT_CLASSES: u32 = 1 << 9;

    pub const ALL: u32 = (1 << 10) - 1;
}

/// Class filter a data source selects from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceClass {
    pub class_name: String,
    pub polymorphic: bool,
}

/// Persisted state of one data source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceInfo {
    pub id: Uuid,
    pub identifier: DataSourceIdentifier,

    /// Owning data source for partial (paged) data sources
    pub parent_id: Option<Uuid>,

    pub related_variables: RulesetVariables,
    pub specification_hash: Option<String>,
    pub node_types: Option<String>,
    pub select_classes: Vec<DataSourceClass>,
    pub direct_nodes_count: Option<usize>,
    pub total_nodes_count: Option<usize>,
    pub has_nodes: Option<bool>,
    pub is_initialized: bool,
    pub is_finalized: bool,
    pub custom_json: Option<Value>,
}

impl DataSourceInfo {
    pub fn new(identifier: DataSourceIdentifier, related_variables: RulesetVariables) -> Self {
        Self {
            id: Uuid::nil(),
            identifier,
            parent_id: None,
            related_variables,
            specification_hash: None,
            node_types: None,
            select_classes: Vec::new(),
            direct_nodes_count: None,
            total_nodes_count: None,
            has_nodes: None,
            is_initialized: false,
            is_finalized: false,
            custom_json: None,
        }
    }
}

/// Provider details stored in a data source's custom JSON
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DataSourceCustomData {
    /// Row counts of the partial data sources a large result was split into
    pub page_counts: Vec<PageCount>,

    /// Instance nodes are merged by label after the query
    pub merge_same_label: bool,
}

impl DataSourceCustomData {
    pub fn from_info(info: &DataSourceInfo) -> Self {
        info.custom_json
            .clone()
            .and_then(|json| serde_json::from_value(json).ok())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.page_counts.is_empty() && !self.merge_same_label
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageCount {
    pub total: usize,
}
