// Query and Table Executor
// Statement execution, streaming reads and the write-or-create table flow

use crate::db::dialect::Dialect;
use crate::db::inference::{
    infer_column_type, infer_columns, index_values, ColumnType, DEFAULT_CHAR_LIMIT, DEFAULT_INDEX_NAME,
};
use crate::db::pool::{Live, Session};
use crate::db::schema::{ColumnDescriptor, TableDescriptor};
use crate::db::tabular::{ImportResult, OutputShape, Record, TabularData};
use crate::db::traits::{
    AccessError, AccessResult, Connection, ConnectionError, RecordStream, ReflectionError,
};
use crate::db::value::CellValue;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

/// What `write_table` does when the table is already there
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IfExists {
    #[default]
    Append,
    Fail,
    Replace,
}

impl FromStr for IfExists {
    type Err = AccessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "append" => Ok(IfExists::Append),
            "fail" => Ok(IfExists::Fail),
            "replace" => Ok(IfExists::Replace),
            other => Err(AccessError::Config(format!(
                "if_exists must be one of append, fail, replace (got '{}')",
                other
            ))),
        }
    }
}

impl fmt::Display for IfExists {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IfExists::Append => f.write_str("append"),
            IfExists::Fail => f.write_str("fail"),
            IfExists::Replace => f.write_str("replace"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteOptions {
    pub if_exists: IfExists,
    /// Create the table but insert nothing
    pub create_only: bool,
    /// Prepend a primary-key column built from the row index
    pub index_as_key: bool,
    /// Length of text columns created from string values
    pub char_limit: u32,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            if_exists: IfExists::Append,
            create_only: false,
            index_as_key: false,
            char_limit: DEFAULT_CHAR_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum WriteOutcome {
    Created { rows: u64 },
    Replaced { rows: u64 },
    Appended { rows: u64 },
}

impl WriteOutcome {
    pub fn rows(&self) -> u64 {
        match self {
            WriteOutcome::Created { rows }
            | WriteOutcome::Replaced { rows }
            | WriteOutcome::Appended { rows } => *rows,
        }
    }
}

enum WriteState {
    Lookup,
    Drop,
    Create { replaced: bool },
    Append(Arc<TableDescriptor>),
    Done(WriteOutcome),
}

/// Column names, their target descriptors and row-major values for one INSERT
struct InsertPlan {
    names: Vec<String>,
    columns: Vec<ColumnDescriptor>,
    rows: Vec<Vec<CellValue>>,
}

impl InsertPlan {
    /// Line the data up against the target table. Data columns the table
    /// lacks are still sent so the database reports the mismatch.
    fn new(target: &TableDescriptor, data: &TabularData, index_as_key: bool, char_limit: u32) -> Self {
        let mut names = Vec::new();
        let mut columns = Vec::new();

        let key_name = data
            .index()
            .map(|c| c.name.as_str())
            .unwrap_or(DEFAULT_INDEX_NAME);
        let key = target
            .column(key_name)
            .filter(|_| index_as_key || data.index().is_some());
        if let Some(key) = key {
            names.push(key.name.clone());
            columns.push(key.clone());
        }

        for col in data.columns() {
            let descriptor = match target.column(&col.name) {
                Some(existing) => existing.clone(),
                None => ColumnDescriptor {
                    name: col.name.clone(),
                    column_type: col
                        .first()
                        .map(|v| infer_column_type(v, char_limit))
                        .unwrap_or(ColumnType::UnboundedText),
                    nullable: true,
                    primary_key: false,
                },
            };
            names.push(col.name.clone());
            columns.push(descriptor);
        }

        let mut rows = data.rows();
        if key.is_some() {
            for (row, key_value) in rows.iter_mut().zip(index_values(data)) {
                row.insert(0, key_value);
            }
        }

        Self {
            names,
            columns,
            rows,
        }
    }
}

impl Session {
    /// Run any statement.
    ///
    /// Statements without a result set return `None` and refresh the
    /// catalog, since they may have changed structure.
    #[tracing::instrument(level = "debug", skip_all, fields(session = %self.id()))]
    pub async fn query(&self, sql: &str, commit_first: bool) -> AccessResult<Option<TabularData>> {
        let live = self.live().await?;
        let mut conn = live.source.acquire().await?;
        let result = run_query(&live, conn.as_mut(), sql, commit_first).await;
        self.release(conn).await;
        result
    }

    /// Stream the rows of a statement as records, fetched as they are consumed
    ///
    /// The pooled connection travels with the stream and is returned once the
    /// stream ends or is dropped.
    pub async fn lazy_query(&self, sql: &str) -> AccessResult<RecordStream> {
        let live = self.live().await?;
        let conn = live.source.acquire().await?;
        debug!(session = %self.id(), sql, "streaming query");
        Ok(conn.stream(sql.to_string()))
    }

    /// Read a whole table
    #[tracing::instrument(level = "debug", skip_all, fields(session = %self.id(), table = %table))]
    pub async fn import_table(
        &self,
        table: &str,
        shape: OutputShape,
        index_column: Option<&str>,
    ) -> AccessResult<ImportResult> {
        let live = self.live().await?;
        if live.catalog.is_enabled() {
            live.catalog.lookup(table).await?;
        }

        let sql = Dialect::new(live.descriptor.backend()).select_all(live.descriptor.schema(), table);
        debug!(sql = %sql, "importing table");

        let mut conn = live.source.acquire().await?;
        let result = conn.execute(&sql).await;
        self.release(conn).await;

        let data = match result? {
            Some(rs) => TabularData::from_result_set(rs.columns, rs.rows)?,
            None => TabularData::default(),
        };

        match shape {
            OutputShape::Records => Ok(ImportResult::Records(data.to_records())),
            OutputShape::Tabular => {
                let mut data = data;
                if let Some(name) = index_column {
                    data.set_index(name)?;
                }
                Ok(ImportResult::Tabular(data))
            }
        }
    }

    /// Insert rows into an existing table as one transaction
    ///
    /// Never creates the table: a table missing from the catalog fails
    /// before any connection is borrowed.
    #[tracing::instrument(level = "debug", skip_all, fields(session = %self.id(), table = %table))]
    pub async fn insert(&self, table: &str, data: &TabularData) -> AccessResult<u64> {
        let live = self.live().await?;
        let target = live.catalog.lookup(table).await?;
        if data.is_empty() {
            return Ok(0);
        }

        let plan = InsertPlan::new(&target, data, false, DEFAULT_CHAR_LIMIT);
        let mut conn = live.source.acquire().await?;
        let result = insert_plan(&live, conn.as_mut(), table, &plan).await;
        self.release(conn).await;
        result
    }

    /// `insert` for row records
    pub async fn insert_records(&self, table: &str, records: &[Record]) -> AccessResult<u64> {
        let data = TabularData::from_records(records)?;
        self.insert(table, &data).await
    }

    /// Write `data` to `table`, creating it when absent
    #[tracing::instrument(level = "debug", skip_all, fields(session = %self.id(), table = %table, if_exists = %options.if_exists))]
    pub async fn write_table(
        &self,
        table: &str,
        data: &TabularData,
        options: &WriteOptions,
    ) -> AccessResult<WriteOutcome> {
        let live = self.live().await?;
        let mut lease: Option<Box<dyn Connection>> = None;
        let result = write_steps(&live, &mut lease, table, data, options).await;
        if let Some(conn) = lease {
            self.release(conn).await;
        }
        result
    }

    /// Drop a table known to the catalog
    #[tracing::instrument(level = "debug", skip_all, fields(session = %self.id(), table = %table))]
    pub async fn drop_table(&self, table: &str) -> AccessResult<()> {
        let live = self.live().await?;
        live.catalog.lookup(table).await?;

        let mut conn = live.source.acquire().await?;
        let result = drop_on(&live, conn.as_mut(), table).await;
        let result = match result {
            Ok(()) => refresh_after_mutation(&live, conn.as_mut()).await,
            Err(e) => Err(e),
        };
        self.release(conn).await;
        result
    }
}

async fn run_query(
    live: &Live,
    conn: &mut dyn Connection,
    sql: &str,
    commit_first: bool,
) -> AccessResult<Option<TabularData>> {
    if commit_first {
        conn.commit_open_transaction().await?;
    }
    debug!(sql, "executing statement");
    match conn.execute(sql).await? {
        Some(rs) => Ok(Some(TabularData::from_result_set(rs.columns, rs.rows)?)),
        None => {
            if live.catalog.is_enabled() {
                refresh_after_mutation(live, conn).await?;
            }
            Ok(None)
        }
    }
}

/// A refresh failing here leaves the committed change in place
async fn refresh_after_mutation(live: &Live, conn: &mut dyn Connection) -> AccessResult<()> {
    live.catalog
        .refresh(conn)
        .await
        .map_err(|e| ReflectionError::StaleAfterMutation(e.to_string()).into())
}

async fn insert_plan(
    live: &Live,
    conn: &mut dyn Connection,
    table: &str,
    plan: &InsertPlan,
) -> AccessResult<u64> {
    let sql = Dialect::new(live.descriptor.backend()).insert(live.descriptor.schema(), table, &plan.names);
    debug!(sql = %sql, rows = plan.rows.len(), "inserting");
    conn.insert_rows(&sql, &plan.columns, &plan.rows)
        .await
        .map_err(|e| match e {
            AccessError::Statement(message) => AccessError::Insert {
                table: live.catalog.qualify(table),
                message,
            },
            other => other,
        })
}

async fn drop_on(live: &Live, conn: &mut dyn Connection, table: &str) -> AccessResult<()> {
    let sql = Dialect::new(live.descriptor.backend()).drop_table(live.descriptor.schema(), table);
    debug!(sql = %sql, "dropping table");
    conn.execute(&sql).await?;
    live.catalog.forget(table).await?;
    info!(table = %live.catalog.qualify(table), "table dropped");
    Ok(())
}

async fn write_steps(
    live: &Live,
    lease: &mut Option<Box<dyn Connection>>,
    table: &str,
    data: &TabularData,
    options: &WriteOptions,
) -> AccessResult<WriteOutcome> {
    let dialect = Dialect::new(live.descriptor.backend());
    let schema = live.descriptor.schema();

    let mut state = WriteState::Lookup;
    let outcome = loop {
        state = match state {
            WriteState::Lookup => match live.catalog.lookup(table).await {
                Ok(existing) => match options.if_exists {
                    IfExists::Fail => {
                        return Err(AccessError::TableExists(live.catalog.qualify(table)))
                    }
                    IfExists::Replace => WriteState::Drop,
                    IfExists::Append => WriteState::Append(existing),
                },
                Err(e) if e.is_not_found() => WriteState::Create { replaced: false },
                Err(e) => return Err(e),
            },

            WriteState::Drop => {
                let conn = borrow(live, lease).await?;
                drop_on(live, conn, table).await?;
                WriteState::Create { replaced: true }
            }

            WriteState::Create { replaced } => {
                let columns = infer_columns(data, options.char_limit, options.index_as_key);
                if columns.is_empty() {
                    return Err(AccessError::InvalidData(format!(
                        "cannot create {} from data without columns",
                        table
                    )));
                }

                let sql = dialect.create_table(schema, table, &columns);
                debug!(sql = %sql, "creating table");
                let conn = borrow(live, lease).await?;
                conn.execute(&sql).await?;

                let descriptor = TableDescriptor {
                    schema: schema.map(str::to_string),
                    name: table.to_string(),
                    columns,
                };
                live.catalog.record(descriptor.clone()).await?;
                info!(table = %live.catalog.qualify(table), replaced, "table created");

                let rows = if options.create_only || data.is_empty() {
                    0
                } else {
                    let plan = InsertPlan::new(&descriptor, data, options.index_as_key, options.char_limit);
                    insert_plan(live, conn, table, &plan).await?
                };
                WriteState::Done(if replaced {
                    WriteOutcome::Replaced { rows }
                } else {
                    WriteOutcome::Created { rows }
                })
            }

            // Appends do not check the data against the existing columns
            WriteState::Append(existing) => {
                let conn = borrow(live, lease).await?;
                let rows = if data.is_empty() {
                    0
                } else {
                    let plan = InsertPlan::new(&existing, data, options.index_as_key, options.char_limit);
                    insert_plan(live, conn, table, &plan).await?
                };
                WriteState::Done(WriteOutcome::Appended { rows })
            }

            WriteState::Done(outcome) => break outcome,
        };
    };

    let conn = borrow(live, lease).await?;
    refresh_after_mutation(live, conn).await?;
    Ok(outcome)
}

/// The write flow's connection, borrowed on first use
async fn borrow<'a>(
    live: &Live,
    lease: &'a mut Option<Box<dyn Connection>>,
) -> AccessResult<&'a mut (dyn Connection + 'static)> {
    if lease.is_none() {
        *lease = Some(live.source.acquire().await?);
    }
    match lease {
        Some(conn) => Ok(conn.as_mut()),
        None => Err(ConnectionError::SessionClosed.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::{resolve, ConnectionParams};
    use crate::db::pool::testing::{mock_session, mock_session_with, MockSource};
    use crate::db::pool::SessionOptions;
    use crate::db::tabular::Column;
    use crate::db::traits::BackendKind;
    use chrono::NaiveDate;
    use futures::StreamExt;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    async fn temp_session() -> (Session, PathBuf) {
        let counter = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!(
            "sqlframe_exec_{}_{}_{}.db",
            std::process::id(),
            counter,
            uuid::Uuid::new_v4()
        ));
        let params = ConnectionParams {
            host: Some(path.to_string_lossy().into_owned()),
            ..Default::default()
        };
        let descriptor = resolve(BackendKind::Sqlite, &params).unwrap();
        let session = Session::open(descriptor, SessionOptions::default()).await.unwrap();
        (session, path)
    }

    async fn cleanup(session: Session, path: PathBuf) {
        session.close().await;
        drop(session);
        let _ = std::fs::remove_file(&path);
    }

    fn people() -> TabularData {
        TabularData::new(vec![
            Column::new("id", vec![1i64, 2, 3]),
            Column::new("name", vec!["a", "b", "c"]),
            Column::new("active", vec![true, false, true]),
        ])
        .unwrap()
    }

    fn fail_options() -> WriteOptions {
        WriteOptions {
            if_exists: IfExists::Fail,
            ..Default::default()
        }
    }

    async fn import(session: &Session, table: &str) -> TabularData {
        session
            .import_table(table, OutputShape::Tabular, None)
            .await
            .unwrap()
            .into_tabular()
            .unwrap()
    }

    #[test]
    fn test_if_exists_parse() {
        assert_eq!("Replace".parse::<IfExists>().unwrap(), IfExists::Replace);
        assert_eq!(" fail ".parse::<IfExists>().unwrap(), IfExists::Fail);
        assert!(matches!(
            "merge".parse::<IfExists>(),
            Err(AccessError::Config(_))
        ));
        assert_eq!(WriteOptions::default().if_exists, IfExists::Append);
        assert_eq!(WriteOptions::default().char_limit, 255);
    }

    #[tokio::test]
    async fn test_write_then_import_round_trip() {
        let (session, path) = temp_session().await;
        let options = WriteOptions {
            if_exists: IfExists::Fail,
            char_limit: 10,
            ..Default::default()
        };

        let outcome = session.write_table("people", &people(), &options).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Created { rows: 3 });

        let table = session.catalog().await.unwrap().lookup("people").await.unwrap();
        let types: Vec<ColumnType> = table.columns.iter().map(|c| c.column_type).collect();
        assert_eq!(
            types,
            vec![ColumnType::BigInteger, ColumnType::Text(10), ColumnType::Boolean]
        );

        assert_eq!(import(&session, "people").await, people());
        cleanup(session, path).await;
    }

    #[tokio::test]
    async fn test_mixed_types_round_trip() {
        let (session, path) = temp_session().await;
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let data = TabularData::new(vec![
            Column::new("price", vec![1.5f64, 2.25]),
            Column::new("day", vec![day, day.succ_opt().unwrap()]),
            Column::new("note", vec![Some("x"), None]),
        ])
        .unwrap();

        session.write_table("mixed", &data, &fail_options()).await.unwrap();
        assert_eq!(import(&session, "mixed").await, data);
        cleanup(session, path).await;
    }

    #[tokio::test]
    async fn test_fail_policy_and_drop() {
        let (session, path) = temp_session().await;

        session.write_table("t", &people(), &fail_options()).await.unwrap();
        let err = session.write_table("t", &people(), &fail_options()).await.unwrap_err();
        assert!(matches!(err, AccessError::TableExists(_)));

        session.drop_table("t").await.unwrap();
        assert!(session.catalog_tables().await.unwrap().is_empty());
        session.write_table("t", &people(), &fail_options()).await.unwrap();

        cleanup(session, path).await;
    }

    #[tokio::test]
    async fn test_replace_matches_drop_and_create() {
        let (session, path) = temp_session().await;
        session.write_table("t", &people(), &fail_options()).await.unwrap();

        let smaller = TabularData::new(vec![Column::new("code", vec!["x", "y"])]).unwrap();
        let options = WriteOptions {
            if_exists: IfExists::Replace,
            ..Default::default()
        };
        let outcome = session.write_table("t", &smaller, &options).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Replaced { rows: 2 });
        assert_eq!(import(&session, "t").await, smaller);

        let table = session.catalog().await.unwrap().lookup("t").await.unwrap();
        assert_eq!(table.column_names(), vec!["code"]);
        cleanup(session, path).await;
    }

    #[tokio::test]
    async fn test_append_adds_rows() {
        let (session, path) = temp_session().await;
        session.write_table("t", &people(), &WriteOptions::default()).await.unwrap();
        let outcome = session.write_table("t", &people(), &WriteOptions::default()).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Appended { rows: 3 });
        assert_eq!(import(&session, "t").await.row_count(), 6);
        cleanup(session, path).await;
    }

    #[tokio::test]
    async fn test_create_only_leaves_table_empty() {
        let (session, path) = temp_session().await;
        let options = WriteOptions {
            create_only: true,
            ..Default::default()
        };
        let outcome = session.write_table("t", &people(), &options).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Created { rows: 0 });

        let data = import(&session, "t").await;
        assert_eq!(data.column_names(), vec!["id", "name", "active"]);
        assert!(data.is_empty());
        cleanup(session, path).await;
    }

    #[tokio::test]
    async fn test_index_as_key_and_atomic_insert() {
        let (session, path) = temp_session().await;
        let data = TabularData::new(vec![Column::new("v", vec!["a", "b"])])
            .unwrap()
            .with_index(Column::new("key", vec![1i64, 2]))
            .unwrap();
        let options = WriteOptions {
            index_as_key: true,
            ..Default::default()
        };
        session.write_table("keyed", &data, &options).await.unwrap();

        let table = session.catalog().await.unwrap().lookup("keyed").await.unwrap();
        assert_eq!(table.column_names(), vec!["key", "v"]);
        assert!(table.columns[0].primary_key);

        // second row collides with the first; nothing from the batch lands
        let clash = TabularData::new(vec![Column::new("v", vec!["c", "d"])])
            .unwrap()
            .with_index(Column::new("key", vec![3i64, 3]))
            .unwrap();
        let err = session.insert("keyed", &clash).await.unwrap_err();
        assert!(matches!(err, AccessError::Insert { .. }));

        let imported = session
            .import_table("keyed", OutputShape::Tabular, Some("key"))
            .await
            .unwrap()
            .into_tabular()
            .unwrap();
        assert_eq!(imported, data);
        cleanup(session, path).await;
    }

    #[tokio::test]
    async fn test_insert_records() {
        let (session, path) = temp_session().await;
        session.write_table("t", &people(), &WriteOptions::default()).await.unwrap();

        let record = Record::from_pairs(vec![
            ("id", CellValue::Int(4)),
            ("name", CellValue::from("d")),
        ])
        .unwrap();
        assert_eq!(session.insert_records("t", &[record]).await.unwrap(), 1);

        let records = session
            .import_table("t", OutputShape::Records, Some("ignored"))
            .await
            .unwrap()
            .into_records();
        assert_eq!(records.len(), 4);
        assert_eq!(records[3].get("name"), Some(&CellValue::from("d")));
        assert_eq!(records[3].get("active"), Some(&CellValue::Null));
        cleanup(session, path).await;
    }

    #[tokio::test]
    async fn test_import_missing_index_column() {
        let (session, path) = temp_session().await;
        session.write_table("t", &people(), &WriteOptions::default()).await.unwrap();
        let err = session
            .import_table("t", OutputShape::Tabular, Some("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, AccessError::InvalidData(_)));
        cleanup(session, path).await;
    }

    #[tokio::test]
    async fn test_query_ddl_refreshes_catalog() {
        let (session, path) = temp_session().await;
        let none = session
            .query("CREATE TABLE raw_t (x INTEGER)", false)
            .await
            .unwrap();
        assert!(none.is_none());
        assert_eq!(session.catalog_tables().await.unwrap(), vec!["raw_t"]);

        session.query("INSERT INTO raw_t VALUES (7)", true).await.unwrap();
        let data = session.query("SELECT x FROM raw_t", true).await.unwrap().unwrap();
        assert_eq!(data.column("x").unwrap().values, vec![CellValue::Int(7)]);
        cleanup(session, path).await;
    }

    #[tokio::test]
    async fn test_query_error_is_statement_error() {
        let (session, path) = temp_session().await;
        let err = session.query("SELEC nonsense", false).await.unwrap_err();
        assert!(matches!(err, AccessError::Statement(_)));
        cleanup(session, path).await;
    }

    #[tokio::test]
    async fn test_lazy_query_single_pass() {
        let (session, path) = temp_session().await;
        session.write_table("t", &people(), &WriteOptions::default()).await.unwrap();

        let mut stream = session.lazy_query("SELECT * FROM t").await.unwrap();
        let mut names = Vec::new();
        while let Some(record) = stream.next().await {
            let record = record.unwrap();
            names.push(record.get("name").cloned().unwrap());
        }
        assert_eq!(
            names,
            vec![CellValue::from("a"), CellValue::from("b"), CellValue::from("c")]
        );
        assert!(stream.next().await.is_none());
        cleanup(session, path).await;
    }

    #[tokio::test]
    async fn test_join_with_repeated_column_names() {
        let (session, path) = temp_session().await;
        session.query("CREATE TABLE a (id INTEGER)", false).await.unwrap();
        session.query("CREATE TABLE b (id INTEGER)", false).await.unwrap();
        session.query("INSERT INTO a VALUES (1)", true).await.unwrap();
        session.query("INSERT INTO b VALUES (1)", true).await.unwrap();

        let joined = session
            .query("SELECT * FROM a JOIN b ON a.id = b.id", true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(joined.column_names(), vec!["id", "id_1"]);
        assert_eq!(joined.column("id_1").unwrap().values, vec![CellValue::Int(1)]);

        let counts = session
            .query("SELECT count(*) AS n, count(*) AS n FROM a", true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(counts.column_names(), vec!["n", "n_1"]);

        let mut stream = session
            .lazy_query("SELECT * FROM a JOIN b ON a.id = b.id")
            .await
            .unwrap();
        let record = stream.next().await.unwrap().unwrap();
        assert_eq!(record.get("id_1"), Some(&CellValue::Int(1)));
        assert!(stream.next().await.is_none());
        cleanup(session, path).await;
    }

    #[tokio::test]
    async fn test_failed_refresh_after_write_is_stale() {
        // the refresh on open succeeds, the one after the write does not
        let source = MockSource::new(vec![]).failing_reflection_after(1);
        let (session, counters) = mock_session_with(source, SessionOptions::default()).await;

        let err = session
            .write_table("t", &people(), &WriteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AccessError::Reflection(ReflectionError::StaleAfterMutation(_))
        ));

        let statements = counters.statements();
        assert!(statements.iter().any(|sql| sql.starts_with("CREATE TABLE")));
        assert!(statements.iter().any(|sql| sql.starts_with("INSERT INTO")));
        assert_eq!(counters.resets(), 2);
    }

    #[tokio::test]
    async fn test_drop_missing_table() {
        let (session, path) = temp_session().await;
        let err = session.drop_table("ghost").await.unwrap_err();
        assert!(err.is_not_found());
        cleanup(session, path).await;
    }

    #[tokio::test]
    async fn test_insert_missing_table_never_reaches_database() {
        let (session, counters) = mock_session(vec![], SessionOptions::default()).await;
        let acquired = counters.acquired();

        let err = session.insert("ghost", &people()).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(counters.acquired(), acquired);
        assert!(counters.statements.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_without_reflection_fails() {
        let options = SessionOptions {
            reflect: false,
            ..Default::default()
        };
        let (session, counters) = mock_session(vec![], options).await;
        let err = session
            .write_table("t", &people(), &WriteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AccessError::Reflection(ReflectionError::Disabled)));
        assert_eq!(counters.acquired(), 0);
    }

    #[tokio::test]
    async fn test_closed_session() {
        let (session, _) = mock_session(vec![], SessionOptions::default()).await;
        session.close().await;
        let err = session.query("SELECT 1", false).await.unwrap_err();
        assert!(matches!(
            err,
            AccessError::Connection(ConnectionError::SessionClosed)
        ));
    }
}
