// PostgreSQL wire driver
// Serves PostgreSQL, Redshift and Vertica through tokio-postgres and bb8

use crate::db::connection::{ConnectionDescriptor, Credential, Endpoint};
use crate::db::drivers::{channel_stream, pool_builder, STREAM_BUFFER};
use crate::db::pool::PoolSettings;
use crate::db::schema::{group_columns, ColumnDescriptor, ReflectedColumn, TableDescriptor};
use crate::db::tabular::{unique_names, Record};
use crate::db::traits::{
    AccessError, AccessResult, BackendKind, Connection, ConnectionError, ConnectionSource,
    PoolStatus, RecordStream, ResultSet,
};
use crate::db::dialect::Dialect;
use crate::db::value::CellValue;
use bb8::{Pool, PooledConnection};
use bb8_postgres::PostgresConnectionManager;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use futures::TryStreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Client, NoTls, Row, SimpleQueryMessage};
use tracing::debug;

pub type PgManager = PostgresConnectionManager<NoTls>;

type PgParam = Box<dyn ToSql + Sync + Send>;

const COLUMNS_SQL: &str = r#"
    SELECT
        c.table_schema::text,
        c.table_name::text,
        c.column_name::text,
        c.data_type::text,
        c.character_maximum_length::int8,
        (c.is_nullable = 'YES') AS is_nullable,
        EXISTS (
            SELECT 1
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage ku
                ON tc.constraint_name = ku.constraint_name
                AND tc.table_schema = ku.table_schema
                AND tc.table_name = ku.table_name
            WHERE tc.constraint_type = 'PRIMARY KEY'
                AND tc.table_schema = c.table_schema
                AND tc.table_name = c.table_name
                AND ku.column_name = c.column_name
        ) AS is_primary_key
    FROM information_schema.columns c
    JOIN information_schema.tables t
        ON t.table_schema = c.table_schema
        AND t.table_name = c.table_name
    WHERE t.table_type = 'BASE TABLE'
        AND c.table_schema = COALESCE($1::text, current_schema()::text)
    ORDER BY c.table_name, c.ordinal_position
"#;

/// Vertica keeps its catalog in v_catalog; the schema is inlined as a literal
fn vertica_columns_sql(schema: &str) -> String {
    format!(
        r#"
        SELECT
            c.table_schema,
            c.table_name,
            c.column_name,
            c.data_type,
            c.character_maximum_length,
            c.is_nullable,
            pk.column_name IS NOT NULL AS is_primary_key
        FROM v_catalog.columns c
        LEFT JOIN v_catalog.primary_keys pk
            ON pk.table_schema = c.table_schema
            AND pk.table_name = c.table_name
            AND pk.column_name = c.column_name
        WHERE c.table_schema = {}
        ORDER BY c.table_name, c.ordinal_position
        "#,
        Dialect::quote_literal(schema)
    )
}

fn pg_err(e: tokio_postgres::Error) -> AccessError {
    AccessError::Statement(e.to_string())
}

/// Username for trusted connections, taken from the OS session
fn ambient_user() -> AccessResult<String> {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .map_err(|_| AccessError::Config("trusted mode needs USER or USERNAME set".to_string()))
}

/// Build the tokio-postgres config from a descriptor
pub fn pg_config(descriptor: &ConnectionDescriptor) -> AccessResult<tokio_postgres::Config> {
    let mut config = tokio_postgres::Config::new();
    match descriptor.endpoint() {
        Endpoint::Network {
            host,
            port,
            database,
        } => {
            config.host(host).port(*port).dbname(database);
        }
        Endpoint::File(_) => {
            return Err(AccessError::Config(format!(
                "{} needs a network endpoint",
                descriptor.backend().display_name()
            )))
        }
    }

    match descriptor.credential() {
        Credential::Password { username, secret } => {
            config.user(username).password(secret);
        }
        Credential::Ambient => {
            config.user(&ambient_user()?);
        }
        Credential::None => {}
    }

    if let (BackendKind::Postgres, Some(schema)) = (descriptor.backend(), descriptor.schema()) {
        config.options(&format!("-c search_path={}", schema));
    }
    config.application_name("sqlframe");
    Ok(config)
}

pub struct PgSource {
    backend: BackendKind,
    pool: Pool<PgManager>,
}

impl PgSource {
    pub async fn open(descriptor: &ConnectionDescriptor, settings: &PoolSettings) -> AccessResult<Self> {
        let backend = descriptor.backend();
        let manager = PostgresConnectionManager::new(pg_config(descriptor)?, NoTls);
        let pool = pool_builder(settings)?
            .build(manager)
            .await
            .map_err(|e| ConnectionError::failed(backend, e))?;
        Ok(Self { backend, pool })
    }
}

#[async_trait::async_trait]
impl ConnectionSource for PgSource {
    fn backend(&self) -> BackendKind {
        self.backend
    }

    async fn acquire(&self) -> AccessResult<Box<dyn Connection>> {
        let client = self
            .pool
            .get_owned()
            .await
            .map_err(|e| ConnectionError::from_pool(self.backend, e))?;
        Ok(Box::new(PgConnection {
            backend: self.backend,
            client,
        }))
    }

    fn status(&self) -> PoolStatus {
        let state = self.pool.state();
        PoolStatus {
            connections: state.connections,
            idle_connections: state.idle_connections,
        }
    }
}

pub struct PgConnection {
    backend: BackendKind,
    client: PooledConnection<'static, PgManager>,
}

/// Convert one column of a row, keyed on the server-reported type
fn cell_value_from_row(row: &Row, idx: usize) -> CellValue {
    let ty = row.columns()[idx].type_();
    match ty.name() {
        "bool" => row.try_get::<_, Option<bool>>(idx).ok().flatten().into(),
        "int2" => row
            .try_get::<_, Option<i16>>(idx)
            .ok()
            .flatten()
            .map(|v| CellValue::Int(v as i64))
            .unwrap_or(CellValue::Null),
        "int4" => row.try_get::<_, Option<i32>>(idx).ok().flatten().into(),
        "int8" => row.try_get::<_, Option<i64>>(idx).ok().flatten().into(),
        "oid" => row
            .try_get::<_, Option<u32>>(idx)
            .ok()
            .flatten()
            .map(|v| CellValue::Int(v as i64))
            .unwrap_or(CellValue::Null),
        "float4" => row
            .try_get::<_, Option<f32>>(idx)
            .ok()
            .flatten()
            .map(|v| CellValue::Float(v as f64))
            .unwrap_or(CellValue::Null),
        "float8" => row.try_get::<_, Option<f64>>(idx).ok().flatten().into(),
        "text" | "varchar" | "bpchar" | "name" | "unknown" => {
            row.try_get::<_, Option<String>>(idx).ok().flatten().into()
        }
        "date" => row.try_get::<_, Option<NaiveDate>>(idx).ok().flatten().into(),
        "timestamp" => row
            .try_get::<_, Option<NaiveDateTime>>(idx)
            .ok()
            .flatten()
            .into(),
        "timestamptz" => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)
            .ok()
            .flatten()
            .map(|dt| CellValue::Timestamp(dt.naive_utc()))
            .unwrap_or(CellValue::Null),
        "bytea" => row.try_get::<_, Option<Vec<u8>>>(idx).ok().flatten().into(),
        other => {
            debug!(column = row.columns()[idx].name(), pg_type = other, "unsupported type read as NULL");
            CellValue::Null
        }
    }
}

fn as_int(value: &CellValue) -> Option<Result<i64, ()>> {
    match value {
        CellValue::Null => None,
        CellValue::Int(i) => Some(Ok(*i)),
        CellValue::Bool(b) => Some(Ok(*b as i64)),
        _ => Some(Err(())),
    }
}

/// Box a value for the parameter type the server inferred. NULLs stay
/// typed so the bind matches the column.
fn to_pg_param(value: &CellValue, ty: &Type) -> Result<PgParam, String> {
    let mismatch = || format!("cannot bind {} value as {}", value.kind(), ty.name());
    let narrow = |v: i64| format!("value {} out of range for {}", v, ty.name());

    let param: PgParam = match ty.name() {
        "bool" => Box::new(match value {
            CellValue::Null => None,
            CellValue::Bool(b) => Some(*b),
            CellValue::Int(i) => Some(*i != 0),
            _ => return Err(mismatch()),
        }),
        "int2" => Box::new(match as_int(value) {
            None => None,
            Some(Ok(v)) => Some(i16::try_from(v).map_err(|_| narrow(v))?),
            Some(Err(())) => return Err(mismatch()),
        }),
        "int4" => Box::new(match as_int(value) {
            None => None,
            Some(Ok(v)) => Some(i32::try_from(v).map_err(|_| narrow(v))?),
            Some(Err(())) => return Err(mismatch()),
        }),
        "int8" => Box::new(match as_int(value) {
            None => None,
            Some(Ok(v)) => Some(v),
            Some(Err(())) => return Err(mismatch()),
        }),
        "float4" | "float8" => {
            let v = match value {
                CellValue::Null => None,
                CellValue::Float(f) => Some(*f),
                CellValue::Int(i) => Some(*i as f64),
                _ => return Err(mismatch()),
            };
            if ty.name() == "float4" {
                Box::new(v.map(|f| f as f32))
            } else {
                Box::new(v)
            }
        }
        "date" => Box::new(match value {
            CellValue::Null => None,
            CellValue::Date(d) => Some(*d),
            CellValue::Timestamp(ts) => Some(ts.date()),
            _ => return Err(mismatch()),
        }),
        "timestamp" | "timestamptz" => {
            let v = match value {
                CellValue::Null => None,
                CellValue::Timestamp(ts) => Some(*ts),
                CellValue::Date(d) => d.and_hms_opt(0, 0, 0),
                _ => return Err(mismatch()),
            };
            if ty.name() == "timestamptz" {
                Box::new(v.map(|ts| DateTime::<Utc>::from_naive_utc_and_offset(ts, Utc)))
            } else {
                Box::new(v)
            }
        }
        "bytea" => Box::new(match value {
            CellValue::Null => None,
            CellValue::Binary(b) => Some(b.clone()),
            CellValue::Text(s) => Some(s.clone().into_bytes()),
            _ => return Err(mismatch()),
        }),
        _ => Box::new(match value {
            CellValue::Null => None,
            other => Some(other.to_string()),
        }),
    };
    Ok(param)
}

async fn pump_rows(
    client: &Client,
    sql: &str,
    tx: &mpsc::Sender<AccessResult<Record>>,
) -> AccessResult<()> {
    let stmt = client.prepare(sql).await.map_err(pg_err)?;
    let columns: Arc<[String]> =
        unique_names(stmt.columns().iter().map(|c| c.name().to_string()).collect()).into();
    let rows = client
        .query_raw(&stmt, Vec::<String>::new())
        .await
        .map_err(pg_err)?;
    futures::pin_mut!(rows);

    while let Some(row) = rows.try_next().await.map_err(pg_err)? {
        let values = (0..row.len()).map(|i| cell_value_from_row(&row, i)).collect();
        let record = Record::new(Arc::clone(&columns), values)?;
        if tx.send(Ok(record)).await.is_err() {
            // Consumer dropped the stream
            break;
        }
    }
    Ok(())
}

#[async_trait::async_trait]
impl Connection for PgConnection {
    fn backend(&self) -> BackendKind {
        self.backend
    }

    async fn is_alive(&mut self) -> bool {
        self.client.simple_query("SELECT 1").await.is_ok()
    }

    async fn execute(&mut self, sql: &str) -> AccessResult<Option<ResultSet>> {
        let client: &Client = &self.client;
        let stmt = client.prepare(sql).await.map_err(pg_err)?;
        if stmt.columns().is_empty() {
            client.execute(&stmt, &[]).await.map_err(pg_err)?;
            return Ok(None);
        }

        let columns = stmt.columns().iter().map(|c| c.name().to_string()).collect();
        let rows = client
            .query(&stmt, &[])
            .await
            .map_err(pg_err)?
            .iter()
            .map(|row| (0..row.len()).map(|i| cell_value_from_row(row, i)).collect())
            .collect();
        Ok(Some(ResultSet { columns, rows }))
    }

    async fn insert_rows(
        &mut self,
        sql: &str,
        _columns: &[ColumnDescriptor],
        rows: &[Vec<CellValue>],
    ) -> AccessResult<u64> {
        let tx = self.client.transaction().await.map_err(pg_err)?;
        let stmt = tx.prepare(sql).await.map_err(pg_err)?;

        let mut inserted = 0;
        for (row_idx, row) in rows.iter().enumerate() {
            let params = row
                .iter()
                .zip(stmt.params())
                .map(|(value, ty)| to_pg_param(value, ty))
                .collect::<Result<Vec<PgParam>, String>>()
                .map_err(|e| AccessError::Statement(format!("row {}: {}", row_idx, e)))?;
            let refs: Vec<&(dyn ToSql + Sync)> =
                params.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();
            inserted += tx.execute(&stmt, &refs).await.map_err(pg_err)?;
        }

        // An early return drops `tx`, which rolls the batch back
        tx.commit().await.map_err(pg_err)?;
        Ok(inserted)
    }

    async fn reflect(&mut self, schema: Option<&str>) -> AccessResult<Vec<TableDescriptor>> {
        let client: &Client = &self.client;
        let rows = if self.backend == BackendKind::Vertica {
            let sql = vertica_columns_sql(schema.unwrap_or("public"));
            client
                .simple_query(&sql)
                .await
                .map_err(pg_err)?
                .into_iter()
                .filter_map(|msg| match msg {
                    SimpleQueryMessage::Row(row) => Some(row),
                    _ => None,
                })
                .filter_map(|row| {
                    let truthy = |v: Option<&str>| matches!(v, Some("t" | "true" | "1"));
                    Some(ReflectedColumn {
                        schema: row.get(0).map(str::to_string),
                        table: row.get(1)?.to_string(),
                        column: row.get(2)?.to_string(),
                        data_type: row.get(3).unwrap_or("unknown").to_string(),
                        max_length: row.get(4).and_then(|v| v.parse().ok()),
                        nullable: truthy(row.get(5)),
                        primary_key: truthy(row.get(6)),
                    })
                })
                .collect()
        } else {
            client
                .query(COLUMNS_SQL, &[&schema])
                .await
                .map_err(pg_err)?
                .iter()
                .map(|row| {
                    Ok(ReflectedColumn {
                        schema: row.try_get(0)?,
                        table: row.try_get(1)?,
                        column: row.try_get(2)?,
                        data_type: row.try_get(3)?,
                        max_length: row.try_get(4)?,
                        nullable: row.try_get(5)?,
                        primary_key: row.try_get(6)?,
                    })
                })
                .collect::<Result<Vec<_>, tokio_postgres::Error>>()
                .map_err(pg_err)?
        };

        debug!(backend = %self.backend, columns = rows.len(), "columns reflected");
        Ok(group_columns(rows))
    }

    async fn commit_open_transaction(&mut self) -> AccessResult<()> {
        // Outside a transaction block the server only warns
        self.client.batch_execute("COMMIT").await.map_err(pg_err)
    }

    fn stream(self: Box<Self>, sql: String) -> RecordStream {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            let mut conn = self;
            if let Err(e) = pump_rows(&conn.client, &sql, &tx).await {
                let _ = tx.send(Err(e)).await;
            }
            let _ = conn.commit_open_transaction().await;
        });
        channel_stream(rx)
    }
}
