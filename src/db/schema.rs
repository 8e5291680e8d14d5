// Schema catalog
// Cached snapshot of the tables and columns visible under the session's schema

use crate::db::inference::ColumnType;
use crate::db::traits::{AccessError, AccessResult, Connection, ReflectionError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Represents a column in a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub primary_key: bool,
}

/// Represents a base table; columns are in physical order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub schema: Option<String>,
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
}

impl TableDescriptor {
    pub fn qualified_name(&self) -> String {
        qualify(self.schema.as_deref(), &self.name)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// One row of a reflection query, before grouping into tables
#[derive(Debug, Clone)]
pub(crate) struct ReflectedColumn {
    pub schema: Option<String>,
    pub table: String,
    pub column: String,
    pub data_type: String,
    pub max_length: Option<i64>,
    pub nullable: bool,
    pub primary_key: bool,
}

/// Group reflection rows (ordered by table, then ordinal position) into
/// table descriptors
pub(crate) fn group_columns(rows: Vec<ReflectedColumn>) -> Vec<TableDescriptor> {
    let mut tables: Vec<TableDescriptor> = Vec::new();
    for row in rows {
        let column = ColumnDescriptor {
            name: row.column,
            column_type: ColumnType::from_sql_type(&row.data_type, row.max_length),
            nullable: row.nullable,
            primary_key: row.primary_key,
        };
        match tables.last_mut() {
            Some(last) if last.name == row.table && last.schema == row.schema => {
                last.columns.push(column)
            }
            _ => tables.push(TableDescriptor {
                schema: row.schema,
                name: row.table,
                columns: vec![column],
            }),
        }
    }
    tables
}

/// Catalog key: `schema.table` when a schema namespace is active
pub fn qualify(schema: Option<&str>, table: &str) -> String {
    match schema {
        Some(s) if !table.contains('.') => format!("{}.{}", s, table),
        _ => table.to_string(),
    }
}

/// Immutable catalog contents at one point in time
#[derive(Debug, Clone, Serialize)]
pub struct CatalogSnapshot {
    pub tables: HashMap<String, Arc<TableDescriptor>>,
    pub refreshed_at: DateTime<Utc>,
}

impl CatalogSnapshot {
    fn empty() -> Self {
        Self {
            tables: HashMap::new(),
            refreshed_at: Utc::now(),
        }
    }

    pub fn get(&self, qualified: &str) -> Option<&Arc<TableDescriptor>> {
        self.tables.get(qualified)
    }

    /// Table keys, sorted
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Manages the table snapshot for one session.
///
/// Every change builds a new snapshot and swaps the `Arc`, so a reader
/// holding a snapshot never sees a partial update.
pub struct SchemaCatalog {
    schema: Option<String>,
    /// `None` when reflection was skipped at session creation
    state: Option<RwLock<Arc<CatalogSnapshot>>>,
}

impl SchemaCatalog {
    pub fn new(schema: Option<String>) -> Self {
        Self {
            schema,
            state: Some(RwLock::new(Arc::new(CatalogSnapshot::empty()))),
        }
    }

    pub fn disabled(schema: Option<String>) -> Self {
        Self {
            schema,
            state: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.state.is_some()
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn qualify(&self, table: &str) -> String {
        qualify(self.schema.as_deref(), table)
    }

    fn state(&self) -> Result<&RwLock<Arc<CatalogSnapshot>>, ReflectionError> {
        self.state.as_ref().ok_or(ReflectionError::Disabled)
    }

    /// Current snapshot
    pub async fn snapshot(&self) -> AccessResult<Arc<CatalogSnapshot>> {
        Ok(Arc::clone(&*self.state()?.read().await))
    }

    /// Re-enumerate all tables through `conn` and swap in the result
    pub async fn refresh(&self, conn: &mut dyn Connection) -> AccessResult<()> {
        let state = self.state()?;
        let tables = conn
            .reflect(self.schema.as_deref())
            .await
            .map_err(|e| ReflectionError::Failed(e.to_string()))?;
        let count = tables.len();
        self.install(state, tables).await;
        debug!(schema = ?self.schema, tables = count, "catalog refreshed");
        Ok(())
    }

    /// Replace the snapshot with the given tables
    pub async fn replace(&self, tables: Vec<TableDescriptor>) -> AccessResult<()> {
        let state = self.state()?;
        self.install(state, tables).await;
        Ok(())
    }

    async fn install(&self, state: &RwLock<Arc<CatalogSnapshot>>, tables: Vec<TableDescriptor>) {
        let tables = tables
            .into_iter()
            .map(|t| (self.key_for(&t), Arc::new(t)))
            .collect();
        let next = Arc::new(CatalogSnapshot {
            tables,
            refreshed_at: Utc::now(),
        });
        *state.write().await = next;
    }

    // Reflection only sees the active namespace, so keys follow it even when
    // the backend reports the default schema by name
    fn key_for(&self, table: &TableDescriptor) -> String {
        self.qualify(&table.name)
    }

    pub async fn lookup(&self, table: &str) -> AccessResult<Arc<TableDescriptor>> {
        let key = self.qualify(table);
        self.snapshot()
            .await?
            .get(&key)
            .cloned()
            .ok_or_else(|| AccessError::table_not_found(key))
    }

    pub async fn contains(&self, table: &str) -> AccessResult<bool> {
        let key = self.qualify(table);
        Ok(self.snapshot().await?.get(&key).is_some())
    }

    /// Drop one entry without re-enumerating
    pub async fn forget(&self, table: &str) -> AccessResult<()> {
        let key = self.qualify(table);
        self.update(|tables| {
            tables.remove(&key);
        })
        .await
    }

    /// Add or overwrite one entry without re-enumerating
    pub async fn record(&self, table: TableDescriptor) -> AccessResult<()> {
        let key = self.key_for(&table);
        self.update(|tables| {
            tables.insert(key, Arc::new(table));
        })
        .await
    }

    async fn update<F>(&self, f: F) -> AccessResult<()>
    where
        F: FnOnce(&mut HashMap<String, Arc<TableDescriptor>>),
    {
        let state = self.state()?;
        let mut guard = state.write().await;
        let mut tables = guard.tables.clone();
        let refreshed_at = guard.refreshed_at;
        f(&mut tables);
        *guard = Arc::new(CatalogSnapshot {
            tables,
            refreshed_at,
        });
        Ok(())
    }
}
