//! Cache schema

use rusqlite::Connection;

/// Bumped whenever the cache layout changes; older caches are rebuilt
pub const SCHEMA_VERSION: i64 = 3;

const CACHE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS Rulesets (
    Id INTEGER PRIMARY KEY AUTOINCREMENT,
    Identifier TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS Variables (
    Id INTEGER PRIMARY KEY AUTOINCREMENT,
    RulesetId INTEGER NOT NULL REFERENCES Rulesets(Id) ON DELETE CASCADE,
    Variables TEXT NOT NULL,
    UNIQUE (RulesetId, Variables)
);

CREATE TABLE IF NOT EXISTS PhysicalHierarchyLevels (
    Id TEXT PRIMARY KEY,
    ConnectionId TEXT NOT NULL,
    RulesetId INTEGER NOT NULL REFERENCES Rulesets(Id) ON DELETE CASCADE,
    PhysicalParentNodeId TEXT REFERENCES Nodes(Id) ON DELETE CASCADE,
    RemovalId TEXT,
    CreatedAt TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS IX_PhysicalHierarchyLevels_Parent
    ON PhysicalHierarchyLevels(ConnectionId, RulesetId, PhysicalParentNodeId);
CREATE INDEX IF NOT EXISTS IX_PhysicalHierarchyLevels_Removal
    ON PhysicalHierarchyLevels(RemovalId);

CREATE TABLE IF NOT EXISTS HierarchyLevels (
    Id TEXT PRIMARY KEY,
    PhysicalHierarchyLevelId TEXT NOT NULL REFERENCES PhysicalHierarchyLevels(Id) ON DELETE CASCADE,
    VirtualParentNodeId TEXT REFERENCES Nodes(Id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS IX_HierarchyLevels_Physical
    ON HierarchyLevels(PhysicalHierarchyLevelId, VirtualParentNodeId);

CREATE TABLE IF NOT EXISTS DataSources (
    Id TEXT PRIMARY KEY,
    HierarchyLevelId TEXT NOT NULL REFERENCES HierarchyLevels(Id) ON DELETE CASCADE,
    ParentId TEXT REFERENCES DataSources(Id) ON DELETE CASCADE,
    VariablesId INTEGER NOT NULL REFERENCES Variables(Id),
    FullIndex TEXT NOT NULL,
    InstanceFilter TEXT,
    ResultSetSizeLimit INTEGER,
    SpecificationHash TEXT,
    NodeTypes TEXT,
    DirectNodesCount INTEGER,
    TotalNodesCount INTEGER,
    HasNodes INTEGER,
    IsInitialized INTEGER NOT NULL DEFAULT 0,
    IsFinalized INTEGER NOT NULL DEFAULT 0,
    CustomJson TEXT
);
CREATE INDEX IF NOT EXISTS IX_DataSources_Level ON DataSources(HierarchyLevelId, FullIndex);
CREATE INDEX IF NOT EXISTS IX_DataSources_Parent ON DataSources(ParentId);

CREATE TABLE IF NOT EXISTS DataSourceClasses (
    DataSourceId TEXT NOT NULL REFERENCES DataSources(Id) ON DELETE CASCADE,
    ClassName TEXT NOT NULL,
    Polymorphic INTEGER NOT NULL,
    PRIMARY KEY (DataSourceId, ClassName)
);

CREATE TABLE IF NOT EXISTS Nodes (
    Id TEXT PRIMARY KEY,
    DataSourceId TEXT NOT NULL REFERENCES DataSources(Id) ON DELETE CASCADE,
    NodeIndex INTEGER NOT NULL,
    Visibility INTEGER NOT NULL DEFAULT 0,
    IsInitialized INTEGER NOT NULL DEFAULT 0,
    Label TEXT NOT NULL,
    Data TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS IX_Nodes_DataSource ON Nodes(DataSourceId, NodeIndex);

CREATE TABLE IF NOT EXISTS NodeKeys (
    NodeId TEXT PRIMARY KEY REFERENCES Nodes(Id) ON DELETE CASCADE,
    NodeType TEXT NOT NULL,
    SpecificationId TEXT NOT NULL,
    Hash TEXT NOT NULL,
    PathFromRoot TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS IX_NodeKeys_Hash ON NodeKeys(Hash);
CREATE INDEX IF NOT EXISTS IX_NodeKeys_Path ON NodeKeys(PathFromRoot);

CREATE TABLE IF NOT EXISTS NodeInstances (
    NodeId TEXT NOT NULL REFERENCES Nodes(Id) ON DELETE CASCADE,
    InstanceId TEXT NOT NULL,
    PRIMARY KEY (NodeId, InstanceId)
);
CREATE INDEX IF NOT EXISTS IX_NodeInstances_Instance ON NodeInstances(InstanceId);
"#;

const DROP_TABLES: &str = r#"
DROP TABLE IF EXISTS NodeInstances;
DROP TABLE IF EXISTS NodeKeys;
DROP TABLE IF EXISTS DataSourceClasses;
DROP TABLE IF EXISTS Nodes;
DROP TABLE IF EXISTS DataSources;
DROP TABLE IF EXISTS HierarchyLevels;
DROP TABLE IF EXISTS PhysicalHierarchyLevels;
DROP TABLE IF EXISTS Variables;
DROP TABLE IF EXISTS Rulesets;
"#;

/// Prepare a cache connection: pragmas, version check and tables
///
/// A cache written by a different schema version is dropped and recreated;
/// cached hierarchies are always reproducible from the store.
pub fn initialize_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version != SCHEMA_VERSION {
        if version != 0 {
            tracing::info!(from = version, to = SCHEMA_VERSION, "rebuilding hierarchy cache schema");
        }
        conn.execute_batch("PRAGMA foreign_keys = OFF;")?;
        conn.execute_batch(DROP_TABLES)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(&format!("PRAGMA user_version = {};", SCHEMA_VERSION))?;
    }
    conn.execute_batch(CACHE_TABLES)
}
