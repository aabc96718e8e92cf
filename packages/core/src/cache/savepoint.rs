//! Write batches on the cache connection

use rusqlite::Connection;
use std::sync::MutexGuard;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{DataSourceInfo, NavNode};

use super::hierarchy_cache::{insert_data_source, insert_node, write_data_source_update};
use super::{HierarchyCache, NodeVisibility};

const SAVEPOINT_NAME: &str = "hierarchy_cache_write";

/// An open SQLite savepoint on the cache connection
///
/// Writes made through the savepoint become visible to other readers only
/// after [`commit`](Self::commit). Dropping the savepoint without committing
/// (for example when a provider fails or is cancelled mid-read) rolls every
/// write back.
pub struct CacheSavepoint<'a> {
    cache: &'a HierarchyCache,
    conn: MutexGuard<'a, Connection>,
    finished: bool,
}

impl<'a> CacheSavepoint<'a> {
    pub(crate) fn begin(cache: &'a HierarchyCache, conn: MutexGuard<'a, Connection>) -> Result<Self> {
        conn.execute_batch(&format!("SAVEPOINT {}", SAVEPOINT_NAME))?;
        Ok(Self {
            cache,
            conn,
            finished: false,
        })
    }

    pub fn cache_data_source(&mut self, info: &mut DataSourceInfo) -> Result<()> {
        insert_data_source(&self.conn, info)?;
        self.cache.record_write();
        Ok(())
    }

    pub fn update(&mut self, info: &DataSourceInfo, update_parts: u32) -> Result<()> {
        if write_data_source_update(&self.conn, info, update_parts)? {
            self.cache.record_write();
        }
        Ok(())
    }

    pub fn cache_node(
        &mut self,
        data_source_id: Uuid,
        index: usize,
        node: &mut NavNode,
        visibility: NodeVisibility,
        is_initialized: bool,
    ) -> Result<()> {
        insert_node(&self.conn, data_source_id, index, node, visibility, is_initialized)?;
        self.cache.record_write();
        Ok(())
    }

    /// Publish every write made through the savepoint
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        self.conn.execute_batch(&format!("RELEASE {}", SAVEPOINT_NAME))?;
        Ok(())
    }

    /// Discard every write made through the savepoint
    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        self.conn.execute_batch(&format!(
            "ROLLBACK TO {name}; RELEASE {name}",
            name = SAVEPOINT_NAME
        ))?;
        Ok(())
    }
}

impl Drop for CacheSavepoint<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let rollback = format!("ROLLBACK TO {name}; RELEASE {name}", name = SAVEPOINT_NAME);
        if let Err(err) = self.conn.execute_batch(&rollback) {
            tracing::warn!(error = %err, "failed to roll back hierarchy cache savepoint");
        } else {
            tracing::debug!("rolled back uncommitted hierarchy cache savepoint");
        }
    }
}
