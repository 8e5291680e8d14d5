// Backend kinds, error kinds and the connection seams every driver implements

use crate::db::schema::{ColumnDescriptor, TableDescriptor};
use crate::db::tabular::Record;
use crate::db::value::CellValue;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported database backends
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Mssql,
    Postgres,
    Redshift,
    Vertica,
    Sqlite,
}

impl BackendKind {
    /// Display name for messages
    pub fn display_name(&self) -> &'static str {
        match self {
            BackendKind::Mssql => "Microsoft SQL Server",
            BackendKind::Postgres => "PostgreSQL",
            BackendKind::Redshift => "Amazon Redshift",
            BackendKind::Vertica => "Vertica",
            BackendKind::Sqlite => "SQLite",
        }
    }

    /// Default port for the backend
    pub fn default_port(&self) -> u16 {
        match self {
            BackendKind::Mssql => 1433,
            BackendKind::Postgres => 5432,
            BackendKind::Redshift => 5439,
            BackendKind::Vertica => 5433,
            BackendKind::Sqlite => 0, // File-based, no port
        }
    }

    /// Scheme used in canonical connection strings
    pub fn scheme(&self) -> &'static str {
        match self {
            BackendKind::Mssql => "mssql",
            BackendKind::Postgres => "postgresql",
            BackendKind::Redshift => "redshift",
            BackendKind::Vertica => "vertica",
            BackendKind::Sqlite => "sqlite",
        }
    }

    /// Backends reached over the PostgreSQL wire protocol
    pub fn speaks_pg_wire(&self) -> bool {
        matches!(
            self,
            BackendKind::Postgres | BackendKind::Redshift | BackendKind::Vertica
        )
    }

    pub fn is_embedded(&self) -> bool {
        matches!(self, BackendKind::Sqlite)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

impl FromStr for BackendKind {
    type Err = AccessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mssql" | "sqlserver" => Ok(BackendKind::Mssql),
            "postgres" | "postgresql" => Ok(BackendKind::Postgres),
            "redshift" => Ok(BackendKind::Redshift),
            "vertica" => Ok(BackendKind::Vertica),
            "sqlite" => Ok(BackendKind::Sqlite),
            other => Err(AccessError::Config(format!("unsupported backend '{}'", other))),
        }
    }
}

/// What a NotFound error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Table,
    Alias,
    Column,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKind::Table => f.write_str("Table"),
            ObjectKind::Alias => f.write_str("Connection alias"),
            ObjectKind::Column => f.write_str("Column"),
        }
    }
}

/// Connection errors
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Session is closed")]
    SessionClosed,

    #[error("Timed out waiting for a pooled connection")]
    Timeout,

    #[error("Connection failed ({backend}): {message}")]
    Failed { backend: BackendKind, message: String },
}

/// Schema reflection errors
#[derive(Debug, thiserror::Error)]
pub enum ReflectionError {
    #[error("Schema reflection is disabled for this session")]
    Disabled,

    #[error("Schema reflection failed: {0}")]
    Failed(String),

    #[error("Change committed but catalog refresh failed: {0}")]
    StaleAfterMutation(String),
}

/// Error type surfaced by every operation of the access layer
#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Reflection(#[from] ReflectionError),

    #[error("{kind} not found: {name}")]
    NotFound { kind: ObjectKind, name: String },

    #[error("Table {0} already exists")]
    TableExists(String),

    #[error("Insert into {table} failed: {message}")]
    Insert { table: String, message: String },

    #[error("Statement error: {0}")]
    Statement(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl AccessError {
    pub fn table_not_found(name: impl Into<String>) -> Self {
        AccessError::NotFound {
            kind: ObjectKind::Table,
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AccessError::NotFound { .. })
    }
}

impl ConnectionError {
    pub(crate) fn failed(backend: BackendKind, message: impl fmt::Display) -> Self {
        ConnectionError::Failed {
            backend,
            message: message.to_string(),
        }
    }

    /// Map a bb8 checkout failure
    pub(crate) fn from_pool<E: fmt::Display>(backend: BackendKind, err: bb8::RunError<E>) -> Self {
        match err {
            bb8::RunError::TimedOut => ConnectionError::Timeout,
            bb8::RunError::User(e) => ConnectionError::failed(backend, e),
        }
    }
}

pub type AccessResult<T> = Result<T, AccessError>;

/// Materialized result of a statement that produced column metadata
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
}

/// Lazily fetched rows; single pass, ends when the cursor is exhausted
pub type RecordStream = BoxStream<'static, AccessResult<Record>>;

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub connections: u32,
    pub idle_connections: u32,
}

/// One borrowed physical connection. Every driver implements this.
#[async_trait::async_trait]
pub trait Connection: Send {
    fn backend(&self) -> BackendKind;

    /// Test if the connection is alive
    async fn is_alive(&mut self) -> bool;

    /// Execute an arbitrary statement. Returns `None` when the statement
    /// yields no column metadata.
    async fn execute(&mut self, sql: &str) -> AccessResult<Option<ResultSet>>;

    /// Run `sql` once per row inside one transaction; all rows or none.
    async fn insert_rows(
        &mut self,
        sql: &str,
        columns: &[ColumnDescriptor],
        rows: &[Vec<CellValue>],
    ) -> AccessResult<u64>;

    /// Enumerate base tables and their columns in `schema` (or the
    /// connection's default schema)
    async fn reflect(&mut self, schema: Option<&str>) -> AccessResult<Vec<TableDescriptor>>;

    /// Commit any implicit transaction left open on this connection
    async fn commit_open_transaction(&mut self) -> AccessResult<()>;

    /// Hand the connection to a background fetcher and stream rows back
    fn stream(self: Box<Self>, sql: String) -> RecordStream;
}

/// Where sessions borrow connections from
#[async_trait::async_trait]
pub trait ConnectionSource: Send + Sync {
    fn backend(&self) -> BackendKind;

    /// Borrow a connection, waiting at most the configured timeout
    async fn acquire(&self) -> AccessResult<Box<dyn Connection>>;

    fn status(&self) -> PoolStatus;
}
