//! SQLite-backed hierarchy cache

use anyhow::Context;
use chrono::Utc;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use crate::cancel::CancellationToken;
use crate::config::HierarchyConfig;
use crate::db::{initialize_schema, register_cache_functions};
use crate::error::{HierarchyError, Result};
use crate::models::{
    parts, CombinedHierarchyLevelIdentifier, DataSourceClass, DataSourceIdentifier, DataSourceInfo,
    HierarchyLevelIdentifier, NavNode, RulesetVariables,
};

use super::lock::{HierarchyLevelLock, LockRegistry};
use super::quick::QuickNodeCache;
use super::savepoint::CacheSavepoint;

/// How a cached node takes part in its level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeVisibility {
    /// Returned to consumers
    Visible,
    /// Never returned; its children are shown in its place
    Virtual,
    /// Never returned, children included (merged away)
    Hidden,
}

impl NodeVisibility {
    pub fn as_i64(&self) -> i64 {
        match self {
            NodeVisibility::Visible => 0,
            NodeVisibility::Virtual => 1,
            NodeVisibility::Hidden => 2,
        }
    }

    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => NodeVisibility::Virtual,
            2 => NodeVisibility::Hidden,
            _ => NodeVisibility::Visible,
        }
    }
}

/// A node together with its cache bookkeeping
#[derive(Debug, Clone, PartialEq)]
pub struct CachedNode {
    pub node: NavNode,
    pub data_source_id: Uuid,
    pub index: usize,
    pub visibility: NodeVisibility,
    /// Whether visibility has been decided for the node
    pub is_initialized: bool,
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicUsize,
    misses: AtomicUsize,
    writes: AtomicUsize,
    quick_hits: AtomicUsize,
}

/// Cache usage counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Data source lookups answered from the cache
    pub hits: usize,
    /// Data source lookups that found nothing
    pub misses: usize,
    /// Rows inserted or updated
    pub writes: usize,
    /// Node reads answered by the quick cache
    pub quick_hits: usize,
}

/// Persistent cache of hierarchy levels, data sources and nodes
pub struct HierarchyCache {
    conn: Mutex<Connection>,
    quick: Mutex<QuickNodeCache>,
    locks: Arc<LockRegistry>,
    config: HierarchyConfig,
    counters: CacheCounters,
}

impl HierarchyCache {
    /// Open (or create) a cache database file
    pub fn open(path: impl AsRef<Path>, config: HierarchyConfig) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        conn.busy_timeout(config.busy_timeout())?;
        Self::initialize(conn, config)
    }

    pub fn open_in_memory(config: HierarchyConfig) -> Result<Self> {
        Self::initialize(Connection::open_in_memory()?, config)
    }

    fn initialize(conn: Connection, config: HierarchyConfig) -> Result<Self> {
        initialize_schema(&conn)
            .map_err(|e| HierarchyError::sql_execution(format!("Failed to initialize cache schema: {}", e)))?;
        register_cache_functions(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            quick: Mutex::new(QuickNodeCache::new(config.quick_cache_capacity)),
            locks: Arc::new(LockRegistry::new()),
            config,
            counters: CacheCounters::default(),
        })
    }

    pub fn config(&self) -> &HierarchyConfig {
        &self.config
    }

    pub(crate) fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| HierarchyError::invariant("hierarchy cache connection mutex poisoned"))
    }

    fn quick(&self) -> Result<MutexGuard<'_, QuickNodeCache>> {
        self.quick
            .lock()
            .map_err(|_| HierarchyError::invariant("quick node cache mutex poisoned"))
    }

    pub(crate) fn record_write(&self) {
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
    }

    fn forget_node(&self, id: &Uuid) -> Result<()> {
        self.quick()?.remove(id);
        Ok(())
    }

    pub(crate) fn forget_all_nodes(&self) -> Result<()> {
        self.quick()?.clear();
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            quick_hits: self.counters.quick_hits.load(Ordering::Relaxed),
        }
    }

    /// Lock handle for a physical level
    pub fn level_lock(&self, physical_level_id: Uuid, cancel: CancellationToken) -> HierarchyLevelLock {
        HierarchyLevelLock::new(
            self.locks.clone(),
            physical_level_id,
            self.config.lock_timeout(),
            self.config.lock_wait_interval(),
            cancel,
        )
    }

    /// Open a write batch
    ///
    /// The returned savepoint holds the cache connection until it is committed
    /// or dropped; use only its own methods while it is alive.
    pub fn create_savepoint(&self) -> Result<CacheSavepoint<'_>> {
        CacheSavepoint::begin(self, self.connection()?)
    }

    // ========================================================================
    // Hierarchy levels
    // ========================================================================

    /// Find the level displayed under `virtual_parent` within a physical level
    pub fn find_hierarchy_level_id(
        &self,
        combined: &CombinedHierarchyLevelIdentifier,
        virtual_parent: Option<Uuid>,
    ) -> Result<Option<HierarchyLevelIdentifier>> {
        let conn = self.connection()?;
        let Some(physical_level_id) = find_physical_level(&conn, combined)? else {
            return Ok(None);
        };
        Ok(find_level(&conn, physical_level_id, virtual_parent)?.map(|id| HierarchyLevelIdentifier {
            id,
            physical_level_id,
            combined: combined.clone(),
            virtual_parent_id: virtual_parent,
        }))
    }

    /// Find or create a level, atomically with respect to other threads
    pub fn get_or_create_hierarchy_level(
        &self,
        combined: &CombinedHierarchyLevelIdentifier,
        virtual_parent: Option<Uuid>,
    ) -> Result<HierarchyLevelIdentifier> {
        let conn = self.connection()?;
        let physical_level_id = match find_physical_level(&conn, combined)? {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4();
                let ruleset_row = ruleset_row_id(&conn, &combined.ruleset_id)?;
                conn.execute(
                    "INSERT INTO PhysicalHierarchyLevels (Id, ConnectionId, RulesetId, PhysicalParentNodeId, RemovalId, CreatedAt) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        id.to_string(),
                        combined.connection_id,
                        ruleset_row,
                        uuid_text(combined.physical_parent_id),
                        uuid_text(combined.removal_id),
                        Utc::now().to_rfc3339(),
                    ],
                )?;
                self.record_write();
                id
            }
        };
        let id = match find_level(&conn, physical_level_id, virtual_parent)? {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4();
                conn.execute(
                    "INSERT INTO HierarchyLevels (Id, PhysicalHierarchyLevelId, VirtualParentNodeId) VALUES (?1, ?2, ?3)",
                    params![id.to_string(), physical_level_id.to_string(), uuid_text(virtual_parent)],
                )?;
                self.record_write();
                tracing::debug!(level = %id, physical = %physical_level_id, "created hierarchy level");
                id
            }
        };
        Ok(HierarchyLevelIdentifier {
            id,
            physical_level_id,
            combined: combined.clone(),
            virtual_parent_id: virtual_parent,
        })
    }

    // ========================================================================
    // Data sources
    // ========================================================================

    /// Find the data source for an identifier whose related variables agree
    /// with `variables`
    pub fn find_data_source(
        &self,
        identifier: &DataSourceIdentifier,
        variables: &RulesetVariables,
    ) -> Result<Option<DataSourceInfo>> {
        let conn = self.connection()?;
        let sql = format!(
            "SELECT {} FROM DataSources ds JOIN Variables v ON v.Id = ds.VariablesId \
             WHERE ds.HierarchyLevelId = ? AND ds.FullIndex = ? AND ds.InstanceFilter IS ? \
               AND ds.ResultSetSizeLimit IS ? AND variables_match(v.Variables, ?) \
             ORDER BY length(v.Variables) DESC LIMIT 1",
            DATA_SOURCE_COLUMNS
        );
        let found = query_data_sources(
            &conn,
            &sql,
            &[
                SqlValue::Text(identifier.hierarchy_level_id.to_string()),
                SqlValue::Text(identifier.full_index()),
                opt_text(identifier.instance_filter.clone()),
                opt_int(identifier.result_set_size_limit),
                SqlValue::Text(variables.to_json()),
            ],
        )?
        .into_iter()
        .next();
        if found.is_some() {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(found)
    }

    pub fn get_data_source(&self, id: Uuid) -> Result<Option<DataSourceInfo>> {
        let conn = self.connection()?;
        let sql = format!(
            "SELECT {} FROM DataSources ds JOIN Variables v ON v.Id = ds.VariablesId WHERE ds.Id = ?",
            DATA_SOURCE_COLUMNS
        );
        Ok(query_data_sources(&conn, &sql, &[SqlValue::Text(id.to_string())])?
            .into_iter()
            .next())
    }

    /// Data sources of a level (or the children of `parent`) matching the
    /// variables, ordered by index
    ///
    /// When several variations of one index match, the most specific one wins.
    pub fn find_data_sources(
        &self,
        level_id: Uuid,
        parent: Option<Uuid>,
        instance_filter: Option<&str>,
        result_set_size_limit: Option<usize>,
        variables: &RulesetVariables,
    ) -> Result<Vec<DataSourceInfo>> {
        let conn = self.connection()?;
        let sql = format!(
            "SELECT {} FROM DataSources ds JOIN Variables v ON v.Id = ds.VariablesId \
             WHERE ds.HierarchyLevelId = ? AND ds.ParentId IS ? AND ds.InstanceFilter IS ? \
               AND ds.ResultSetSizeLimit IS ? AND variables_match(v.Variables, ?) \
             ORDER BY ds.FullIndex, length(v.Variables) DESC",
            DATA_SOURCE_COLUMNS
        );
        let all = query_data_sources(
            &conn,
            &sql,
            &[
                SqlValue::Text(level_id.to_string()),
                opt_text(parent.map(|id| id.to_string())),
                opt_text(instance_filter.map(str::to_string)),
                opt_int(result_set_size_limit),
                SqlValue::Text(variables.to_json()),
            ],
        )?;
        let mut seen = BTreeSet::new();
        Ok(all
            .into_iter()
            .filter(|info| seen.insert(info.identifier.full_index()))
            .collect())
    }

    /// Insert a data source row; assigns `info.id` when nil
    pub fn cache_data_source(&self, info: &mut DataSourceInfo) -> Result<()> {
        let conn = self.connection()?;
        insert_data_source(&conn, info)?;
        self.record_write();
        Ok(())
    }

    /// Write the selected column groups of a data source
    pub fn update(&self, info: &DataSourceInfo, update_parts: u32) -> Result<()> {
        let conn = self.connection()?;
        if write_data_source_update(&conn, info, update_parts)? {
            self.record_write();
        }
        Ok(())
    }

    /// Merge newly used variables into a data source's related set
    ///
    /// # Returns
    ///
    /// `true` when the stored set changed. Nothing is written when the stored
    /// set already contains every entry of `used`.
    pub fn update_related_variables(&self, data_source_id: Uuid, used: &RulesetVariables) -> Result<bool> {
        let Some(mut info) = self.get_data_source(data_source_id)? else {
            tracing::warn!(data_source = %data_source_id, "data source vanished before variables update");
            return Ok(false);
        };
        if info.related_variables.contains(used) {
            return Ok(false);
        }
        info.related_variables = info.related_variables.merged(used);
        self.update(&info, parts::RELATED_VARIABLES)?;
        Ok(true)
    }

    /// Mark a data source finalized once every visible direct node knows
    /// whether it has children
    pub fn refresh_finalized(&self, data_source_id: Uuid) -> Result<bool> {
        let conn = self.connection()?;
        let changed = conn.execute(
            "UPDATE DataSources SET IsFinalized = 1 \
             WHERE Id = ?1 AND IsInitialized = 1 AND IsFinalized = 0 AND NOT EXISTS ( \
                 SELECT 1 FROM Nodes n WHERE n.DataSourceId = ?1 AND n.Visibility = 0 \
                   AND json_extract(n.Data, '$.hasChildren') = 'unknown')",
            params![data_source_id.to_string()],
        )?;
        if changed > 0 {
            self.record_write();
        }
        Ok(changed > 0)
    }

    // ========================================================================
    // Nodes
    // ========================================================================

    /// Insert a node; assigns `node.id` when nil
    pub fn cache_node(
        &self,
        data_source_id: Uuid,
        index: usize,
        node: &mut NavNode,
        visibility: NodeVisibility,
    ) -> Result<()> {
        let conn = self.connection()?;
        insert_node(&conn, data_source_id, index, node, visibility, false)?;
        self.record_write();
        Ok(())
    }

    pub fn get_cached_node(&self, id: Uuid) -> Result<Option<CachedNode>> {
        if let Some(cached) = self.quick()?.get(&id) {
            self.counters.quick_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(cached.clone()));
        }
        let cached = {
            let conn = self.connection()?;
            let sql = format!("SELECT {} FROM Nodes n WHERE n.Id = ?", NODE_COLUMNS);
            query_nodes(&conn, &sql, &[SqlValue::Text(id.to_string())])?
                .into_iter()
                .next()
        };
        if let Some(cached) = &cached {
            self.quick()?.insert(cached.clone());
        }
        Ok(cached)
    }

    pub fn get_node(&self, id: Uuid) -> Result<Option<NavNode>> {
        Ok(self.get_cached_node(id)?.map(|cached| cached.node))
    }

    /// Direct nodes of a data source in index order, hidden ones included
    pub fn get_data_source_nodes(&self, data_source_id: Uuid) -> Result<Vec<CachedNode>> {
        let conn = self.connection()?;
        let sql = format!(
            "SELECT {} FROM Nodes n WHERE n.DataSourceId = ? ORDER BY n.NodeIndex",
            NODE_COLUMNS
        );
        query_nodes(&conn, &sql, &[SqlValue::Text(data_source_id.to_string())])
    }

    /// Persist a node's mutable data (flags, label, merged keys)
    pub fn update_node(&self, node: &NavNode) -> Result<()> {
        {
            let conn = self.connection()?;
            let data = serde_json::to_string(node)?;
            let changed = conn.execute(
                "UPDATE Nodes SET Label = ?2, Data = ?3 WHERE Id = ?1",
                params![node.id.to_string(), node.label, data],
            )?;
            if changed == 0 {
                return Err(HierarchyError::invariant(format!("node {} is not cached", node.id)));
            }
            write_node_key(&conn, node)?;
        }
        self.record_write();
        self.forget_node(&node.id)
    }

    /// Record that visibility has been decided for a node
    pub fn set_node_initialized(&self, id: Uuid) -> Result<()> {
        {
            let conn = self.connection()?;
            conn.execute("UPDATE Nodes SET IsInitialized = 1 WHERE Id = ?1", params![id.to_string()])?;
        }
        self.record_write();
        self.forget_node(&id)
    }

    fn set_visibility(&self, id: Uuid, visibility: NodeVisibility) -> Result<()> {
        {
            let conn = self.connection()?;
            conn.execute(
                "UPDATE Nodes SET Visibility = ?2, IsInitialized = 1 WHERE Id = ?1",
                params![id.to_string(), visibility.as_i64()],
            )?;
        }
        self.record_write();
        self.forget_node(&id)
    }

    /// Hide a node from consumers; its children take its place
    pub fn make_virtual(&self, id: Uuid) -> Result<()> {
        self.set_visibility(id, NodeVisibility::Virtual)
    }

    /// Hide a node together with its children
    pub fn make_hidden(&self, id: Uuid) -> Result<()> {
        self.set_visibility(id, NodeVisibility::Hidden)
    }

    /// Return a node to consumers
    pub fn make_physical(&self, id: Uuid) -> Result<()> {
        self.set_visibility(id, NodeVisibility::Visible)
    }

    /// Nearest non-virtual ancestor of a node (the parent it is displayed under)
    pub fn get_physical_parent(&self, id: Uuid) -> Result<Option<Uuid>> {
        let conn = self.connection()?;
        let parent: Option<Option<String>> = conn
            .query_row(
                "SELECT p.PhysicalParentNodeId FROM Nodes n \
                 JOIN DataSources ds ON ds.Id = n.DataSourceId \
                 JOIN HierarchyLevels l ON l.Id = ds.HierarchyLevelId \
                 JOIN PhysicalHierarchyLevels p ON p.Id = l.PhysicalHierarchyLevelId \
                 WHERE n.Id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        match parent {
            Some(parent) => Ok(parent.as_deref().map(parse_uuid).transpose()?),
            None => {
                tracing::warn!(node = %id, "physical parent requested for uncached node");
                Ok(None)
            }
        }
    }

    /// Ancestors of a node through virtual parents, nearest first
    pub fn node_ancestors(&self, id: Uuid) -> Result<Vec<CachedNode>> {
        let conn = self.connection()?;
        let sql = format!(
            "WITH RECURSIVE ancestors(NodeId, Depth) AS ( \
                 SELECT l.VirtualParentNodeId, 1 FROM Nodes n \
                 JOIN DataSources ds ON ds.Id = n.DataSourceId \
                 JOIN HierarchyLevels l ON l.Id = ds.HierarchyLevelId \
                 WHERE n.Id = ? \
                 UNION ALL \
                 SELECT l.VirtualParentNodeId, a.Depth + 1 FROM ancestors a \
                 JOIN Nodes n ON n.Id = a.NodeId \
                 JOIN DataSources ds ON ds.Id = n.DataSourceId \
                 JOIN HierarchyLevels l ON l.Id = ds.HierarchyLevelId \
             ) \
             SELECT {} FROM ancestors a JOIN Nodes n ON n.Id = a.NodeId ORDER BY a.Depth",
            NODE_COLUMNS
        );
        query_nodes(&conn, &sql, &[SqlValue::Text(id.to_string())])
    }

    /// Whether two grouping nodes stand for different instance sets
    ///
    /// Computed as the size of the symmetric difference of their instance links.
    pub fn grouped_instances_differ(&self, a: Uuid, b: Uuid) -> Result<bool> {
        let conn = self.connection()?;
        let difference: i64 = conn.query_row(
            "SELECT COUNT(*) FROM ( \
                 SELECT InstanceId FROM ( \
                     SELECT InstanceId FROM NodeInstances WHERE NodeId = ?1 \
                     EXCEPT SELECT InstanceId FROM NodeInstances WHERE NodeId = ?2) \
                 UNION \
                 SELECT InstanceId FROM ( \
                     SELECT InstanceId FROM NodeInstances WHERE NodeId = ?2 \
                     EXCEPT SELECT InstanceId FROM NodeInstances WHERE NodeId = ?1))",
            params![a.to_string(), b.to_string()],
            |row| row.get(0),
        )?;
        Ok(difference > 0)
    }

    /// Find a cached node by the key hashes on its path from the root
    pub fn locate_node(
        &self,
        connection_id: &str,
        ruleset_id: &str,
        path: &[String],
    ) -> Result<Option<NavNode>> {
        let id: Option<String> = {
            let conn = self.connection()?;
            conn.query_row(
                "SELECT k.NodeId FROM NodeKeys k \
                 JOIN Nodes n ON n.Id = k.NodeId \
                 JOIN DataSources ds ON ds.Id = n.DataSourceId \
                 JOIN HierarchyLevels l ON l.Id = ds.HierarchyLevelId \
                 JOIN PhysicalHierarchyLevels p ON p.Id = l.PhysicalHierarchyLevelId \
                 JOIN Rulesets r ON r.Id = p.RulesetId \
                 WHERE k.PathFromRoot = ?1 AND p.ConnectionId = ?2 AND r.Identifier = ?3 \
                   AND p.RemovalId IS NULL AND n.Visibility <> 2 \
                 LIMIT 1",
                params![serde_json::to_string(path)?, connection_id, ruleset_id],
                |row| row.get(0),
            )
            .optional()?
        };
        match id {
            Some(id) => self.get_node(parse_uuid(&id)?),
            None => Ok(None),
        }
    }

    // ========================================================================
    // Invalidation
    // ========================================================================

    /// Whether every data source of a level that matches the variables is
    /// fully initialized (and at least one exists)
    pub fn is_initialized(
        &self,
        level_id: Uuid,
        instance_filter: Option<&str>,
        result_set_size_limit: Option<usize>,
        variables: &RulesetVariables,
    ) -> Result<bool> {
        let conn = self.connection()?;
        let (count, initialized): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(MIN(ds.IsInitialized), 0) FROM DataSources ds \
             JOIN Variables v ON v.Id = ds.VariablesId \
             WHERE ds.HierarchyLevelId = ?1 AND ds.InstanceFilter IS ?2 \
               AND ds.ResultSetSizeLimit IS ?3 AND variables_match(v.Variables, ?4)",
            params![
                level_id.to_string(),
                instance_filter,
                result_set_size_limit.map(|limit| limit as i64),
                variables.to_json(),
            ],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(count > 0 && initialized == 1)
    }

    /// Whether a related variable of the level has a value no cached
    /// variation was built for
    pub fn might_have_new_variation(&self, level_id: Uuid, variables: &RulesetVariables) -> Result<bool> {
        let stored: Vec<String> = {
            let conn = self.connection()?;
            let mut stmt = conn.prepare_cached(
                "SELECT DISTINCT v.Variables FROM DataSources ds \
                 JOIN Variables v ON v.Id = ds.VariablesId WHERE ds.HierarchyLevelId = ?1",
            )?;
            let rows = stmt.query_map(params![level_id.to_string()], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        let variations = stored
            .iter()
            .map(|json| RulesetVariables::from_json(json))
            .collect::<serde_json::Result<Vec<_>>>()?;

        let mut seen_values: BTreeMap<&String, Vec<&serde_json::Value>> = BTreeMap::new();
        for variation in &variations {
            for (name, value) in variation.iter() {
                seen_values.entry(name).or_default().push(value);
            }
        }
        Ok(seen_values.iter().any(|(name, values)| {
            let current = variables.value_of(name);
            !values.iter().any(|value| **value == current)
        }))
    }

    /// Mark the physical level superseded
    ///
    /// # Returns
    ///
    /// The removal id, or `None` when no live level matched.
    pub fn create_removal_id(&self, combined: &CombinedHierarchyLevelIdentifier) -> Result<Option<Uuid>> {
        let removal_id = Uuid::new_v4();
        let changed = {
            let conn = self.connection()?;
            conn.execute(
                "UPDATE PhysicalHierarchyLevels SET RemovalId = ?1 \
                 WHERE ConnectionId = ?2 AND PhysicalParentNodeId IS ?3 AND RemovalId IS NULL \
                   AND RulesetId = (SELECT Id FROM Rulesets WHERE Identifier = ?4)",
                params![
                    removal_id.to_string(),
                    combined.connection_id,
                    uuid_text(combined.physical_parent_id),
                    combined.ruleset_id,
                ],
            )?
        };
        if changed == 0 {
            return Ok(None);
        }
        self.record_write();
        Ok(Some(removal_id))
    }

    /// Delete every physical level marked with `removal_id`, with its subtree
    pub fn remove_hierarchy_level(&self, removal_id: Uuid) -> Result<usize> {
        let removed = {
            let conn = self.connection()?;
            conn.execute(
                "DELETE FROM PhysicalHierarchyLevels WHERE RemovalId = ?1",
                params![removal_id.to_string()],
            )?
        };
        self.forget_all_nodes()?;
        tracing::info!(removal = %removal_id, removed, "removed superseded hierarchy levels");
        Ok(removed)
    }

    /// Drop every cached level of a ruleset
    pub fn clear(&self, ruleset_id: &str) -> Result<usize> {
        let removed = {
            let conn = self.connection()?;
            conn.execute(
                "DELETE FROM PhysicalHierarchyLevels \
                 WHERE RulesetId IN (SELECT Id FROM Rulesets WHERE Identifier = ?1)",
                params![ruleset_id],
            )?
        };
        self.forget_all_nodes()?;
        tracing::info!(ruleset = ruleset_id, removed, "cleared hierarchy cache");
        Ok(removed)
    }

    /// Live physical levels with a data source selecting one of `classes`
    pub fn levels_using_classes(&self, classes: &[String]) -> Result<Vec<CombinedHierarchyLevelIdentifier>> {
        if classes.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.connection()?;
        let placeholders = vec!["?"; classes.len()].join(", ");
        let sql = format!(
            "SELECT DISTINCT p.ConnectionId, r.Identifier, p.PhysicalParentNodeId \
             FROM DataSourceClasses c \
             JOIN DataSources ds ON ds.Id = c.DataSourceId \
             JOIN HierarchyLevels l ON l.Id = ds.HierarchyLevelId \
             JOIN PhysicalHierarchyLevels p ON p.Id = l.PhysicalHierarchyLevelId \
             JOIN Rulesets r ON r.Id = p.RulesetId \
             WHERE p.RemovalId IS NULL AND c.ClassName IN ({})",
            placeholders
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(classes.iter()))?;
        let mut levels = Vec::new();
        while let Some(row) = rows.next()? {
            let connection_id: String = row.get(0)?;
            let ruleset_id: String = row.get(1)?;
            let parent: Option<String> = row.get(2)?;
            levels.push(CombinedHierarchyLevelIdentifier {
                connection_id,
                ruleset_id,
                physical_parent_id: parent.as_deref().map(parse_uuid).transpose()?,
                removal_id: None,
            });
        }
        Ok(levels)
    }
}

// ============================================================================
// Row helpers shared with CacheSavepoint
// ============================================================================

const DATA_SOURCE_COLUMNS: &str = "ds.Id, ds.HierarchyLevelId, ds.ParentId, v.Variables, ds.FullIndex, \
     ds.InstanceFilter, ds.ResultSetSizeLimit, ds.SpecificationHash, ds.NodeTypes, ds.DirectNodesCount, \
     ds.TotalNodesCount, ds.HasNodes, ds.IsInitialized, ds.IsFinalized, ds.CustomJson";

const NODE_COLUMNS: &str = "n.Id, n.DataSourceId, n.NodeIndex, n.Visibility, n.IsInitialized, n.Data";

fn uuid_text(id: Option<Uuid>) -> Option<String> {
    id.map(|id| id.to_string())
}

fn opt_text(value: Option<String>) -> SqlValue {
    value.map(SqlValue::Text).unwrap_or(SqlValue::Null)
}

fn opt_int(value: Option<usize>) -> SqlValue {
    value
        .map(|value| SqlValue::Integer(value as i64))
        .unwrap_or(SqlValue::Null)
}

fn opt_bool(value: Option<bool>) -> SqlValue {
    value
        .map(|value| SqlValue::Integer(i64::from(value)))
        .unwrap_or(SqlValue::Null)
}

fn parse_uuid(text: &str) -> anyhow::Result<Uuid> {
    Uuid::parse_str(text).with_context(|| format!("Invalid uuid '{}'", text))
}

fn parse_index(full_index: &str) -> anyhow::Result<Vec<u64>> {
    if full_index.is_empty() {
        return Ok(Vec::new());
    }
    full_index
        .split('-')
        .map(|part| {
            part.parse::<u64>()
                .with_context(|| format!("Invalid index part '{}'", part))
        })
        .collect()
}

fn find_physical_level(conn: &Connection, combined: &CombinedHierarchyLevelIdentifier) -> Result<Option<Uuid>> {
    let id: Option<String> = conn
        .query_row(
            "SELECT p.Id FROM PhysicalHierarchyLevels p JOIN Rulesets r ON r.Id = p.RulesetId \
             WHERE p.ConnectionId = ?1 AND r.Identifier = ?2 AND p.PhysicalParentNodeId IS ?3 \
               AND p.RemovalId IS ?4 \
             ORDER BY p.CreatedAt LIMIT 1",
            params![
                combined.connection_id,
                combined.ruleset_id,
                uuid_text(combined.physical_parent_id),
                uuid_text(combined.removal_id),
            ],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id.as_deref().map(parse_uuid).transpose()?)
}

fn find_level(conn: &Connection, physical_level_id: Uuid, virtual_parent: Option<Uuid>) -> Result<Option<Uuid>> {
    let id: Option<String> = conn
        .query_row(
            "SELECT Id FROM HierarchyLevels WHERE PhysicalHierarchyLevelId = ?1 AND VirtualParentNodeId IS ?2 LIMIT 1",
            params![physical_level_id.to_string(), uuid_text(virtual_parent)],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id.as_deref().map(parse_uuid).transpose()?)
}

fn ruleset_row_id(conn: &Connection, identifier: &str) -> Result<i64> {
    conn.execute(
        "INSERT OR IGNORE INTO Rulesets (Identifier) VALUES (?1)",
        params![identifier],
    )?;
    Ok(conn.query_row(
        "SELECT Id FROM Rulesets WHERE Identifier = ?1",
        params![identifier],
        |row| row.get(0),
    )?)
}

fn ruleset_row_for_level(conn: &Connection, level_id: Uuid) -> Result<i64> {
    conn.query_row(
        "SELECT p.RulesetId FROM HierarchyLevels l \
         JOIN PhysicalHierarchyLevels p ON p.Id = l.PhysicalHierarchyLevelId WHERE l.Id = ?1",
        params![level_id.to_string()],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| HierarchyError::invariant(format!("hierarchy level {} is not cached", level_id)))
}

fn variables_row_id(conn: &Connection, ruleset_row: i64, variables: &RulesetVariables) -> Result<i64> {
    let json = variables.to_json();
    conn.execute(
        "INSERT OR IGNORE INTO Variables (RulesetId, Variables) VALUES (?1, ?2)",
        params![ruleset_row, json],
    )?;
    Ok(conn.query_row(
        "SELECT Id FROM Variables WHERE RulesetId = ?1 AND Variables = ?2",
        params![ruleset_row, json],
        |row| row.get(0),
    )?)
}

fn row_to_data_source(row: &Row<'_>) -> anyhow::Result<DataSourceInfo> {
    let id: String = row.get(0).context("Failed to get data source id")?;
    let level_id: String = row.get(1).context("Failed to get hierarchy level id")?;
    let parent_id: Option<String> = row.get(2).context("Failed to get parent data source id")?;
    let variables: String = row.get(3).context("Failed to get variables")?;
    let full_index: String = row.get(4).context("Failed to get full index")?;
    let result_set_size_limit: Option<i64> = row.get(6)?;
    let direct_nodes_count: Option<i64> = row.get(9)?;
    let total_nodes_count: Option<i64> = row.get(10)?;
    let custom_json: Option<String> = row.get(14)?;

    Ok(DataSourceInfo {
        id: parse_uuid(&id)?,
        identifier: DataSourceIdentifier {
            hierarchy_level_id: parse_uuid(&level_id)?,
            index: parse_index(&full_index)?,
            instance_filter: row.get(5)?,
            result_set_size_limit: result_set_size_limit.map(|limit| limit as usize),
        },
        parent_id: parent_id.as_deref().map(parse_uuid).transpose()?,
        related_variables: RulesetVariables::from_json(&variables).context("Failed to parse variables")?,
        specification_hash: row.get(7)?,
        node_types: row.get(8)?,
        select_classes: Vec::new(),
        direct_nodes_count: direct_nodes_count.map(|count| count as usize),
        total_nodes_count: total_nodes_count.map(|count| count as usize),
        has_nodes: row.get(11)?,
        is_initialized: row.get(12)?,
        is_finalized: row.get(13)?,
        custom_json: custom_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("Failed to parse custom json")?,
    })
}

fn row_to_cached_node(row: &Row<'_>) -> anyhow::Result<CachedNode> {
    let id: String = row.get(0).context("Failed to get node id")?;
    let data_source_id: String = row.get(1).context("Failed to get data source id")?;
    let index: i64 = row.get(2)?;
    let visibility: i64 = row.get(3)?;
    let is_initialized: bool = row.get(4)?;
    let data: String = row.get(5).context("Failed to get node data")?;

    let mut node: NavNode = serde_json::from_str(&data).context("Failed to parse node data")?;
    node.id = parse_uuid(&id)?;
    Ok(CachedNode {
        node,
        data_source_id: parse_uuid(&data_source_id)?,
        index: index as usize,
        visibility: NodeVisibility::from_i64(visibility),
        is_initialized,
    })
}

fn query_data_sources(conn: &Connection, sql: &str, values: &[SqlValue]) -> Result<Vec<DataSourceInfo>> {
    let mut infos = Vec::new();
    {
        let mut stmt = conn.prepare_cached(sql)?;
        let mut rows = stmt.query(params_from_iter(values.iter()))?;
        while let Some(row) = rows.next()? {
            infos.push(row_to_data_source(row)?);
        }
    }
    for info in &mut infos {
        info.select_classes = load_select_classes(conn, info.id)?;
    }
    Ok(infos)
}

fn query_nodes(conn: &Connection, sql: &str, values: &[SqlValue]) -> Result<Vec<CachedNode>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let mut rows = stmt.query(params_from_iter(values.iter()))?;
    let mut nodes = Vec::new();
    while let Some(row) = rows.next()? {
        nodes.push(row_to_cached_node(row)?);
    }
    Ok(nodes)
}

fn load_select_classes(conn: &Connection, data_source_id: Uuid) -> Result<Vec<DataSourceClass>> {
    let mut stmt = conn.prepare_cached(
        "SELECT ClassName, Polymorphic FROM DataSourceClasses WHERE DataSourceId = ?1 ORDER BY ClassName",
    )?;
    let rows = stmt.query_map(params![data_source_id.to_string()], |row| {
        Ok(DataSourceClass {
            class_name: row.get(0)?,
            polymorphic: row.get(1)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn write_select_classes(conn: &Connection, info: &DataSourceInfo) -> Result<()> {
    conn.execute(
        "DELETE FROM DataSourceClasses WHERE DataSourceId = ?1",
        params![info.id.to_string()],
    )?;
    for class in &info.select_classes {
        conn.execute(
            "INSERT OR REPLACE INTO DataSourceClasses (DataSourceId, ClassName, Polymorphic) VALUES (?1, ?2, ?3)",
            params![info.id.to_string(), class.class_name, class.polymorphic],
        )?;
    }
    Ok(())
}

pub(crate) fn insert_data_source(conn: &Connection, info: &mut DataSourceInfo) -> Result<()> {
    if info.id.is_nil() {
        info.id = Uuid::new_v4();
    }
    let ruleset_row = ruleset_row_for_level(conn, info.identifier.hierarchy_level_id)?;
    let variables_id = variables_row_id(conn, ruleset_row, &info.related_variables)?;
    let custom_json = info
        .custom_json
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        "INSERT INTO DataSources (Id, HierarchyLevelId, ParentId, VariablesId, FullIndex, InstanceFilter, \
             ResultSetSizeLimit, SpecificationHash, NodeTypes, DirectNodesCount, TotalNodesCount, HasNodes, \
             IsInitialized, IsFinalized, CustomJson) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            info.id.to_string(),
            info.identifier.hierarchy_level_id.to_string(),
            uuid_text(info.parent_id),
            variables_id,
            info.identifier.full_index(),
            info.identifier.instance_filter,
            info.identifier.result_set_size_limit.map(|limit| limit as i64),
            info.specification_hash,
            info.node_types,
            info.direct_nodes_count.map(|count| count as i64),
            info.total_nodes_count.map(|count| count as i64),
            info.has_nodes,
            info.is_initialized,
            info.is_finalized,
            custom_json,
        ],
    )
    .map_err(|e| HierarchyError::sql_execution(format!("Failed to cache data source {}: {}", info.id, e)))?;
    write_select_classes(conn, info)?;
    tracing::debug!(data_source = %info.id, index = %info.identifier.full_index(), "cached data source");
    Ok(())
}

/// Returns whether anything was written
pub(crate) fn write_data_source_update(conn: &Connection, info: &DataSourceInfo, update_parts: u32) -> Result<bool> {
    let mut assignments: Vec<&str> = Vec::new();
    let mut values: Vec<SqlValue> = Vec::new();

    if update_parts & parts::RELATED_VARIABLES != 0 {
        let ruleset_row = ruleset_row_for_level(conn, info.identifier.hierarchy_level_id)?;
        let variables_id = variables_row_id(conn, ruleset_row, &info.related_variables)?;
        assignments.push("VariablesId = ?");
        values.push(SqlValue::Integer(variables_id));
    }
    if update_parts & parts::SPECIFICATION_HASH != 0 {
        assignments.push("SpecificationHash = ?");
        values.push(opt_text(info.specification_hash.clone()));
    }
    if update_parts & parts::NODE_TYPES != 0 {
        assignments.push("NodeTypes = ?");
        values.push(opt_text(info.node_types.clone()));
    }
    if update_parts & parts::DIRECT_NODES_COUNT != 0 {
        assignments.push("DirectNodesCount = ?");
        values.push(opt_int(info.direct_nodes_count));
    }
    if update_parts & parts::TOTAL_NODES_COUNT != 0 {
        assignments.push("TotalNodesCount = ?");
        values.push(opt_int(info.total_nodes_count));
    }
    if update_parts & parts::HAS_NODES != 0 {
        assignments.push("HasNodes = ?");
        values.push(opt_bool(info.has_nodes));
    }
    if update_parts & parts::IS_INITIALIZED != 0 {
        assignments.push("IsInitialized = ?");
        values.push(SqlValue::Integer(i64::from(info.is_initialized)));
    }
    if update_parts & parts::IS_FINALIZED != 0 {
        assignments.push("IsFinalized = ?");
        values.push(SqlValue::Integer(i64::from(info.is_finalized)));
    }
    if update_parts & parts::CUSTOM_JSON != 0 {
        assignments.push("CustomJson = ?");
        let json = info.custom_json.as_ref().map(serde_json::to_string).transpose()?;
        values.push(opt_text(json));
    }
    if update_parts & parts::SELECT_CLASSES != 0 {
        write_select_classes(conn, info)?;
    }
    if assignments.is_empty() {
        return Ok(update_parts & parts::SELECT_CLASSES != 0);
    }

    values.push(SqlValue::Text(info.id.to_string()));
    let sql = format!("UPDATE DataSources SET {} WHERE Id = ?", assignments.join(", "));
    let changed = conn.execute(&sql, params_from_iter(values.iter()))?;
    if changed == 0 {
        return Err(HierarchyError::invariant(format!("data source {} is not cached", info.id)));
    }
    Ok(true)
}

pub(crate) fn insert_node(
    conn: &Connection,
    data_source_id: Uuid,
    index: usize,
    node: &mut NavNode,
    visibility: NodeVisibility,
    is_initialized: bool,
) -> Result<()> {
    if node.id.is_nil() {
        node.id = Uuid::new_v4();
    }
    let data = serde_json::to_string(node)?;
    conn.execute(
        "INSERT INTO Nodes (Id, DataSourceId, NodeIndex, Visibility, IsInitialized, Label, Data) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            node.id.to_string(),
            data_source_id.to_string(),
            index as i64,
            visibility.as_i64(),
            is_initialized,
            node.label,
            data,
        ],
    )
    .map_err(|e| HierarchyError::sql_execution(format!("Failed to cache node '{}': {}", node.label, e)))?;
    write_node_key(conn, node)
}

fn write_node_key(conn: &Connection, node: &NavNode) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO NodeKeys (NodeId, NodeType, SpecificationId, Hash, PathFromRoot) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            node.id.to_string(),
            node.key.kind.as_str(),
            node.key.specification_id,
            node.key.hash,
            serde_json::to_string(&node.key.path_from_root)?,
        ],
    )?;
    conn.execute(
        "DELETE FROM NodeInstances WHERE NodeId = ?1",
        params![node.id.to_string()],
    )?;
    let mut stmt = conn.prepare_cached("INSERT OR IGNORE INTO NodeInstances (NodeId, InstanceId) VALUES (?1, ?2)")?;
    for instance in &node.key.instance_keys {
        stmt.execute(params![node.id.to_string(), instance])?;
    }
    Ok(())
}

#[cfg(test)]
#[path = "hierarchy_cache_test.rs"]
mod hierarchy_cache_test;
