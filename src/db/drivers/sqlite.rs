// SQLite Driver
// rusqlite connections checked out of a bb8 pool

use crate::db::drivers::{channel_stream, pool_builder, STREAM_BUFFER};
use crate::db::inference::ColumnType;
use crate::db::pool::PoolSettings;
use crate::db::schema::{group_columns, ColumnDescriptor, ReflectedColumn, TableDescriptor};
use crate::db::sqlite_manager::SqliteManager;
use crate::db::tabular::{unique_names, Record};
use crate::db::traits::{
    AccessError, AccessResult, BackendKind, Connection, ConnectionError, ConnectionSource,
    PoolStatus, RecordStream, ResultSet,
};
use crate::db::value::CellValue;
use bb8::{Pool, PooledConnection};
use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::types::{Value, ValueRef};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

const TABLES_SQL: &str = r#"
    SELECT name
    FROM sqlite_master
    WHERE type = 'table'
    AND name NOT LIKE 'sqlite_%'
    ORDER BY name
"#;

const COLUMNS_SQL: &str = r#"
    SELECT name, type, "notnull", pk
    FROM pragma_table_info(?1, ?2)
    ORDER BY cid
"#;

fn stmt_err(e: rusqlite::Error) -> AccessError {
    AccessError::Statement(e.to_string())
}

pub struct SqliteSource {
    pool: Pool<SqliteManager>,
}

impl SqliteSource {
    pub async fn open(path: PathBuf, settings: &PoolSettings) -> AccessResult<Self> {
        let pool = pool_builder(settings)?
            .build(SqliteManager::new(path))
            .await
            .map_err(|e| ConnectionError::failed(BackendKind::Sqlite, e))?;
        Ok(Self { pool })
    }
}

#[async_trait::async_trait]
impl ConnectionSource for SqliteSource {
    fn backend(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    async fn acquire(&self) -> AccessResult<Box<dyn Connection>> {
        let conn = self
            .pool
            .get_owned()
            .await
            .map_err(|e| ConnectionError::from_pool(BackendKind::Sqlite, e))?;
        Ok(Box::new(SqliteConnection { conn }))
    }

    fn status(&self) -> PoolStatus {
        let state = self.pool.state();
        PoolStatus {
            connections: state.connections,
            idle_connections: state.idle_connections,
        }
    }
}

pub struct SqliteConnection {
    conn: PooledConnection<'static, SqliteManager>,
}

impl SqliteConnection {
    /// Declared column types, used to recover booleans and dates that
    /// SQLite stores as integers and text
    fn declared_types(stmt: &rusqlite::Statement<'_>) -> Vec<Option<ColumnType>> {
        stmt.columns()
            .iter()
            .map(|c| c.decl_type().map(|t| ColumnType::from_sql_type(t, None)))
            .collect()
    }

    fn cell_value_from_row(row: &rusqlite::Row<'_>, idx: usize, declared: Option<ColumnType>) -> CellValue {
        match row.get_ref(idx) {
            Ok(ValueRef::Null) | Err(_) => CellValue::Null,
            Ok(ValueRef::Integer(i)) => match declared {
                Some(ColumnType::Boolean) => CellValue::Bool(i != 0),
                _ => CellValue::Int(i),
            },
            Ok(ValueRef::Real(f)) => CellValue::Float(f),
            Ok(ValueRef::Text(bytes)) => {
                let text = String::from_utf8_lossy(bytes);
                match declared {
                    Some(ColumnType::Date) => NaiveDate::parse_from_str(&text, DATE_FORMAT)
                        .map(CellValue::Date)
                        .unwrap_or_else(|_| CellValue::Text(text.into_owned())),
                    Some(ColumnType::Timestamp) => parse_timestamp(&text)
                        .map(CellValue::Timestamp)
                        .unwrap_or_else(|| CellValue::Text(text.into_owned())),
                    _ => CellValue::Text(text.into_owned()),
                }
            }
            Ok(ValueRef::Blob(b)) => CellValue::Binary(b.to_vec()),
        }
    }

    fn read_rows(
        conn: &rusqlite::Connection,
        sql: &str,
        mut on_row: impl FnMut(&Arc<[String]>, Vec<CellValue>) -> bool,
    ) -> AccessResult<Option<Arc<[String]>>> {
        let mut stmt = conn.prepare(sql).map_err(stmt_err)?;
        if stmt.column_count() == 0 {
            stmt.execute([]).map_err(stmt_err)?;
            return Ok(None);
        }

        let columns: Arc<[String]> =
            unique_names(stmt.column_names().into_iter().map(String::from).collect()).into();
        let declared = Self::declared_types(&stmt);
        let mut rows = stmt.query([]).map_err(stmt_err)?;
        while let Some(row) = rows.next().map_err(stmt_err)? {
            let values = declared
                .iter()
                .enumerate()
                .map(|(idx, ty)| Self::cell_value_from_row(row, idx, *ty))
                .collect();
            if !on_row(&columns, values) {
                break;
            }
        }
        Ok(Some(columns))
    }
}

fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
}

fn to_sqlite_value(value: &CellValue) -> Value {
    match value {
        CellValue::Null => Value::Null,
        CellValue::Bool(b) => Value::Integer(*b as i64),
        CellValue::Int(i) => Value::Integer(*i),
        CellValue::Float(f) => Value::Real(*f),
        CellValue::Text(s) => Value::Text(s.clone()),
        CellValue::Date(d) => Value::Text(d.format(DATE_FORMAT).to_string()),
        CellValue::Timestamp(ts) => Value::Text(ts.format(TIMESTAMP_FORMAT).to_string()),
        CellValue::Binary(b) => Value::Blob(b.clone()),
    }
}

#[async_trait::async_trait]
impl Connection for SqliteConnection {
    fn backend(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    async fn is_alive(&mut self) -> bool {
        self.conn
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok()
    }

    async fn execute(&mut self, sql: &str) -> AccessResult<Option<ResultSet>> {
        let mut rows = Vec::new();
        let columns = Self::read_rows(&self.conn, sql, |_, values| {
            rows.push(values);
            true
        })?;
        Ok(columns.map(|columns| ResultSet {
            columns: columns.to_vec(),
            rows,
        }))
    }

    async fn insert_rows(
        &mut self,
        sql: &str,
        _columns: &[ColumnDescriptor],
        rows: &[Vec<CellValue>],
    ) -> AccessResult<u64> {
        let tx = self.conn.transaction().map_err(stmt_err)?;
        {
            let mut stmt = tx.prepare(sql).map_err(stmt_err)?;
            for row in rows {
                let params = row.iter().map(to_sqlite_value);
                stmt.execute(rusqlite::params_from_iter(params))
                    .map_err(stmt_err)?;
            }
        }
        // Dropping an uncommitted transaction rolls it back
        tx.commit().map_err(stmt_err)?;
        Ok(rows.len() as u64)
    }

    async fn reflect(&mut self, schema: Option<&str>) -> AccessResult<Vec<TableDescriptor>> {
        let database = schema.unwrap_or("main");
        let tables_sql = if database == "main" {
            TABLES_SQL.to_string()
        } else {
            TABLES_SQL.replace(
                "FROM sqlite_master",
                &format!("FROM \"{}\".sqlite_master", database.replace('"', "\"\"")),
            )
        };

        let tables: Vec<String> = {
            let mut stmt = self.conn.prepare(&tables_sql).map_err(stmt_err)?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(stmt_err)?;
            names.collect::<Result<_, _>>().map_err(stmt_err)?
        };

        let mut rows = Vec::new();
        let mut stmt = self.conn.prepare(COLUMNS_SQL).map_err(stmt_err)?;
        for table in tables {
            let columns = stmt
                .query_map(rusqlite::params![table, database], |row| {
                    let notnull: i64 = row.get(2)?;
                    let pk: i64 = row.get(3)?;
                    Ok(ReflectedColumn {
                        schema: schema.map(str::to_string),
                        table: table.clone(),
                        column: row.get(0)?,
                        data_type: row.get(1)?,
                        max_length: None,
                        nullable: notnull == 0 && pk == 0,
                        primary_key: pk > 0,
                    })
                })
                .map_err(stmt_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(stmt_err)?;
            rows.extend(columns);
        }

        debug!(columns = rows.len(), "sqlite columns reflected");
        Ok(group_columns(rows))
    }

    async fn commit_open_transaction(&mut self) -> AccessResult<()> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("COMMIT").map_err(stmt_err)?;
        }
        Ok(())
    }

    fn stream(self: Box<Self>, sql: String) -> RecordStream {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::task::spawn_blocking(move || {
            let conn = self.conn;
            let result = Self::read_rows(&conn, &sql, |columns, values| {
                let record = Record::new(Arc::clone(columns), values);
                // A failed send means the consumer dropped the stream
                tx.blocking_send(record).is_ok()
            });
            if let Err(e) = result {
                let _ = tx.blocking_send(Err(e));
            }
            if !conn.is_autocommit() {
                let _ = conn.execute_batch("COMMIT");
            }
        });
        channel_stream(rx)
    }
}
