// MS-SQL Driver
// tiberius connections checked out of a bb8 pool

use crate::db::connection::{ConnectionDescriptor, Credential, Endpoint};
use crate::db::dialect::Dialect;
use crate::db::drivers::{channel_stream, pool_builder, STREAM_BUFFER};
use crate::db::inference::ColumnType as Tag;
use crate::db::pool::SessionOptions;
use crate::db::schema::{group_columns, ColumnDescriptor, ReflectedColumn, TableDescriptor};
use crate::db::tabular::{unique_names, Record};
use crate::db::traits::{
    AccessError, AccessResult, BackendKind, Connection, ConnectionError, ConnectionSource,
    PoolStatus, RecordStream, ResultSet,
};
use crate::db::value::CellValue;
use bb8::{ManageConnection, Pool, PooledConnection};
use bb8_tiberius::ConnectionManager;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::TryStreamExt;
use std::sync::Arc;
use tiberius::numeric::Numeric;
use tiberius::{AuthMethod, ColumnType, Config, EncryptionLevel, Query, Row};
use tokio::sync::mpsc;
use tracing::{debug, warn};

type MssqlClient = <ConnectionManager as ManageConnection>::Connection;

const RESET_SQL: &str = "IF @@TRANCOUNT > 0 COMMIT TRANSACTION";

fn ms_err(e: tiberius::error::Error) -> AccessError {
    AccessError::Statement(e.to_string())
}

/// Create a tiberius Config from a descriptor
pub fn tiberius_config(descriptor: &ConnectionDescriptor, options: &SessionOptions) -> AccessResult<Config> {
    let mut config = Config::new();
    match descriptor.endpoint() {
        Endpoint::Network {
            host,
            port,
            database,
        } => {
            config.host(host);
            config.port(*port);
            config.database(database);
        }
        Endpoint::File(_) => {
            return Err(AccessError::Config(
                "SQL Server needs a network endpoint".to_string(),
            ))
        }
    }

    match descriptor.credential() {
        Credential::Password { username, secret } => {
            config.authentication(AuthMethod::sql_server(username, secret));
        }
        Credential::Ambient | Credential::None => {
            return Err(AccessError::Config(
                "trusted authentication is not available for SQL Server; supply a username and password"
                    .to_string(),
            ))
        }
    }

    if let Some(driver) = descriptor.driver() {
        debug!(driver, "driver override has no effect on the TDS client");
    }

    if options.mssql_trust_cert {
        config.trust_cert();
    }
    config.encryption(if options.mssql_encrypt {
        EncryptionLevel::Required
    } else {
        EncryptionLevel::Off
    });
    config.application_name("sqlframe");

    Ok(config)
}

pub struct MssqlSource {
    pool: Pool<ConnectionManager>,
}

impl MssqlSource {
    pub async fn open(descriptor: &ConnectionDescriptor, options: &SessionOptions) -> AccessResult<Self> {
        let manager = ConnectionManager::build(tiberius_config(descriptor, options)?)
            .map_err(|e| AccessError::Config(e.to_string()))?;
        let pool = pool_builder(&options.pool)?
            .build(manager)
            .await
            .map_err(|e| ConnectionError::failed(BackendKind::Mssql, e))?;
        Ok(Self { pool })
    }
}

#[async_trait::async_trait]
impl ConnectionSource for MssqlSource {
    fn backend(&self) -> BackendKind {
        BackendKind::Mssql
    }

    async fn acquire(&self) -> AccessResult<Box<dyn Connection>> {
        let conn = self
            .pool
            .get_owned()
            .await
            .map_err(|e| ConnectionError::from_pool(BackendKind::Mssql, e))?;
        Ok(Box::new(MssqlConnection { conn }))
    }

    fn status(&self) -> PoolStatus {
        let state = self.pool.state();
        PoolStatus {
            connections: state.connections,
            idle_connections: state.idle_connections,
        }
    }
}

pub struct MssqlConnection {
    conn: PooledConnection<'static, ConnectionManager>,
}

/// Convert tiberius column value to CellValue
fn cell_value_from_row(row: &Row, idx: usize) -> CellValue {
    let col_type = row
        .columns()
        .get(idx)
        .map(|c| c.column_type())
        .unwrap_or(ColumnType::Null);

    match col_type {
        ColumnType::Null => CellValue::Null,

        ColumnType::Bit | ColumnType::Bitn => row.try_get::<bool, _>(idx).ok().flatten().into(),

        ColumnType::Int1 => row
            .try_get::<u8, _>(idx)
            .ok()
            .flatten()
            .map(|v| CellValue::Int(v as i64))
            .unwrap_or(CellValue::Null),
        ColumnType::Int2 => row
            .try_get::<i16, _>(idx)
            .ok()
            .flatten()
            .map(|v| CellValue::Int(v as i64))
            .unwrap_or(CellValue::Null),
        ColumnType::Int4 => row.try_get::<i32, _>(idx).ok().flatten().into(),
        ColumnType::Int8 => row.try_get::<i64, _>(idx).ok().flatten().into(),
        // Nullable ints carry their width in the value
        ColumnType::Intn => row
            .try_get::<i64, _>(idx)
            .ok()
            .flatten()
            .or_else(|| row.try_get::<i32, _>(idx).ok().flatten().map(i64::from))
            .or_else(|| row.try_get::<i16, _>(idx).ok().flatten().map(i64::from))
            .or_else(|| row.try_get::<u8, _>(idx).ok().flatten().map(i64::from))
            .map(CellValue::Int)
            .unwrap_or(CellValue::Null),

        ColumnType::Float4 => row
            .try_get::<f32, _>(idx)
            .ok()
            .flatten()
            .map(|v| CellValue::Float(v as f64))
            .unwrap_or(CellValue::Null),
        ColumnType::Float8 | ColumnType::Money | ColumnType::Money4 => {
            row.try_get::<f64, _>(idx).ok().flatten().into()
        }
        ColumnType::Floatn => row
            .try_get::<f64, _>(idx)
            .ok()
            .flatten()
            .or_else(|| row.try_get::<f32, _>(idx).ok().flatten().map(f64::from))
            .map(CellValue::Float)
            .unwrap_or(CellValue::Null),
        ColumnType::Decimaln | ColumnType::Numericn => row
            .try_get::<Numeric, _>(idx)
            .ok()
            .flatten()
            .map(|n| CellValue::Float(f64::from(n)))
            .unwrap_or(CellValue::Null),

        ColumnType::Daten => row.try_get::<NaiveDate, _>(idx).ok().flatten().into(),
        ColumnType::Datetime
        | ColumnType::Datetime2
        | ColumnType::Datetimen
        | ColumnType::Datetime4 => row.try_get::<NaiveDateTime, _>(idx).ok().flatten().into(),
        ColumnType::DatetimeOffsetn => row
            .try_get::<DateTime<Utc>, _>(idx)
            .ok()
            .flatten()
            .map(|dt| CellValue::Timestamp(dt.naive_utc()))
            .unwrap_or(CellValue::Null),
        ColumnType::Timen => row
            .try_get::<NaiveTime, _>(idx)
            .ok()
            .flatten()
            .map(|t| CellValue::Text(t.to_string()))
            .unwrap_or(CellValue::Null),

        ColumnType::BigVarBin | ColumnType::BigBinary | ColumnType::Image => row
            .try_get::<&[u8], _>(idx)
            .ok()
            .flatten()
            .map(|b| CellValue::Binary(b.to_vec()))
            .unwrap_or(CellValue::Null),

        ColumnType::Guid => row
            .try_get::<tiberius::Uuid, _>(idx)
            .ok()
            .flatten()
            .map(|u| CellValue::Text(u.to_string()))
            .unwrap_or(CellValue::Null),

        // Character types and anything else readable as a string
        _ => row
            .try_get::<&str, _>(idx)
            .ok()
            .flatten()
            .map(|s| CellValue::Text(s.to_string()))
            .unwrap_or(CellValue::Null),
    }
}

/// Bind one value typed by its target column so NULLs carry a SQL type
fn bind_value(query: &mut Query<'_>, value: &CellValue, column: &ColumnDescriptor) -> Result<(), String> {
    let mismatch = || {
        format!(
            "cannot bind {} value to {} column '{}'",
            value.kind(),
            column.column_type,
            column.name
        )
    };

    match column.column_type {
        Tag::Boolean => query.bind(match value {
            CellValue::Null => None,
            CellValue::Bool(b) => Some(*b),
            CellValue::Int(i) => Some(*i != 0),
            _ => return Err(mismatch()),
        }),
        Tag::Integer => query.bind(match value {
            CellValue::Null => None,
            CellValue::Int(i) => Some(i32::try_from(*i).map_err(|_| mismatch())?),
            CellValue::Bool(b) => Some(*b as i32),
            _ => return Err(mismatch()),
        }),
        Tag::BigInteger => query.bind(match value {
            CellValue::Null => None,
            CellValue::Int(i) => Some(*i),
            CellValue::Bool(b) => Some(*b as i64),
            _ => return Err(mismatch()),
        }),
        Tag::Floating => query.bind(match value {
            CellValue::Null => None,
            CellValue::Float(f) => Some(*f),
            CellValue::Int(i) => Some(*i as f64),
            _ => return Err(mismatch()),
        }),
        Tag::Date => query.bind(match value {
            CellValue::Null => None,
            CellValue::Date(d) => Some(*d),
            CellValue::Timestamp(ts) => Some(ts.date()),
            _ => return Err(mismatch()),
        }),
        Tag::Timestamp => query.bind(match value {
            CellValue::Null => None,
            CellValue::Timestamp(ts) => Some(*ts),
            CellValue::Date(d) => d.and_hms_opt(0, 0, 0),
            _ => return Err(mismatch()),
        }),
        Tag::Text(_) | Tag::UnboundedText => match value {
            CellValue::Binary(b) => query.bind(Some(b.clone())),
            CellValue::Null => query.bind(None::<String>),
            other => query.bind(Some(other.to_string())),
        },
    }
    Ok(())
}

impl MssqlConnection {
    async fn run(&mut self, sql: &str) -> AccessResult<()> {
        self.conn
            .simple_query(sql)
            .await
            .map_err(ms_err)?
            .into_results()
            .await
            .map_err(ms_err)?;
        Ok(())
    }

    async fn insert_all(
        &mut self,
        sql: &str,
        columns: &[ColumnDescriptor],
        rows: &[Vec<CellValue>],
    ) -> AccessResult<u64> {
        let mut inserted = 0;
        for (row_idx, row) in rows.iter().enumerate() {
            let mut query = Query::new(sql);
            for (value, column) in row.iter().zip(columns) {
                bind_value(&mut query, value, column)
                    .map_err(|e| AccessError::Statement(format!("row {}: {}", row_idx, e)))?;
            }
            let result = query.execute(&mut *self.conn).await.map_err(ms_err)?;
            inserted += result.total();
        }
        Ok(inserted)
    }
}

async fn pump_rows(
    client: &mut MssqlClient,
    sql: &str,
    tx: &mpsc::Sender<AccessResult<Record>>,
) -> AccessResult<()> {
    let mut rows = client
        .simple_query(sql)
        .await
        .map_err(ms_err)?
        .into_row_stream();

    let mut names: Option<Arc<[String]>> = None;
    while let Some(row) = rows.try_next().await.map_err(ms_err)? {
        let columns = names.get_or_insert_with(|| {
            unique_names(row.columns().iter().map(|c| c.name().to_string()).collect()).into()
        });
        let values = (0..row.len()).map(|i| cell_value_from_row(&row, i)).collect();
        let record = Record::new(Arc::clone(columns), values)?;
        if tx.send(Ok(record)).await.is_err() {
            // Consumer is gone; read the rest so the connection is clean
            // when it goes back to the pool
            while rows.try_next().await.map_err(ms_err)?.is_some() {}
            break;
        }
    }
    Ok(())
}

#[async_trait::async_trait]
impl Connection for MssqlConnection {
    fn backend(&self) -> BackendKind {
        BackendKind::Mssql
    }

    async fn is_alive(&mut self) -> bool {
        self.run("SELECT 1").await.is_ok()
    }

    async fn execute(&mut self, sql: &str) -> AccessResult<Option<ResultSet>> {
        let mut stream = self.conn.simple_query(sql).await.map_err(ms_err)?;
        let columns: Option<Vec<String>> = stream
            .columns()
            .await
            .map_err(ms_err)?
            .map(|cols| cols.iter().map(|c| c.name().to_string()).collect());

        let Some(columns) = columns else {
            stream.into_results().await.map_err(ms_err)?;
            return Ok(None);
        };

        let rows = stream
            .into_first_result()
            .await
            .map_err(ms_err)?
            .iter()
            .map(|row| (0..row.len()).map(|i| cell_value_from_row(row, i)).collect())
            .collect();
        Ok(Some(ResultSet { columns, rows }))
    }

    async fn insert_rows(
        &mut self,
        sql: &str,
        columns: &[ColumnDescriptor],
        rows: &[Vec<CellValue>],
    ) -> AccessResult<u64> {
        self.run("BEGIN TRANSACTION").await?;
        match self.insert_all(sql, columns, rows).await {
            Ok(inserted) => {
                self.run("COMMIT TRANSACTION").await?;
                Ok(inserted)
            }
            Err(e) => {
                if let Err(rollback) = self.run("IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION").await {
                    warn!(error = %rollback, "rollback after failed insert did not complete");
                }
                Err(e)
            }
        }
    }

    async fn reflect(&mut self, schema: Option<&str>) -> AccessResult<Vec<TableDescriptor>> {
        let schema_filter = schema
            .map(Dialect::quote_literal)
            .unwrap_or_else(|| "SCHEMA_NAME()".to_string());
        let query = format!(
            r#"
            SELECT
                c.TABLE_SCHEMA,
                c.TABLE_NAME,
                c.COLUMN_NAME,
                c.DATA_TYPE,
                c.CHARACTER_MAXIMUM_LENGTH,
                c.IS_NULLABLE,
                CASE WHEN pk.COLUMN_NAME IS NOT NULL THEN 1 ELSE 0 END AS IS_PRIMARY_KEY
            FROM INFORMATION_SCHEMA.COLUMNS c
            JOIN INFORMATION_SCHEMA.TABLES t
                ON t.TABLE_SCHEMA = c.TABLE_SCHEMA
                AND t.TABLE_NAME = c.TABLE_NAME
            LEFT JOIN (
                SELECT
                    ku.TABLE_SCHEMA,
                    ku.TABLE_NAME,
                    ku.COLUMN_NAME
                FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc
                JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE ku
                    ON tc.CONSTRAINT_NAME = ku.CONSTRAINT_NAME
                    AND tc.TABLE_SCHEMA = ku.TABLE_SCHEMA
                WHERE tc.CONSTRAINT_TYPE = 'PRIMARY KEY'
            ) pk ON c.TABLE_SCHEMA = pk.TABLE_SCHEMA
                AND c.TABLE_NAME = pk.TABLE_NAME
                AND c.COLUMN_NAME = pk.COLUMN_NAME
            WHERE t.TABLE_TYPE = 'BASE TABLE'
                AND c.TABLE_SCHEMA = {}
            ORDER BY c.TABLE_NAME, c.ORDINAL_POSITION
        "#,
            schema_filter
        );

        let rows = self
            .conn
            .simple_query(&query)
            .await
            .map_err(ms_err)?
            .into_first_result()
            .await
            .map_err(ms_err)?;

        let columns: Vec<ReflectedColumn> = rows
            .iter()
            .filter_map(|row| {
                let text = |idx: usize| row.try_get::<&str, _>(idx).ok().flatten();
                Some(ReflectedColumn {
                    schema: text(0).map(str::to_string),
                    table: text(1)?.to_string(),
                    column: text(2)?.to_string(),
                    data_type: text(3).unwrap_or("unknown").to_string(),
                    max_length: row.try_get::<i32, _>(4).ok().flatten().map(i64::from),
                    nullable: text(5).map(|s| s == "YES").unwrap_or(true),
                    primary_key: row.try_get::<i32, _>(6).ok().flatten() == Some(1),
                })
            })
            .collect();

        debug!(columns = columns.len(), "mssql columns reflected");
        Ok(group_columns(columns))
    }

    async fn commit_open_transaction(&mut self) -> AccessResult<()> {
        self.run(RESET_SQL).await
    }

    fn stream(self: Box<Self>, sql: String) -> RecordStream {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            let mut conn = self;
            if let Err(e) = pump_rows(&mut conn.conn, &sql, &tx).await {
                let _ = tx.send(Err(e)).await;
            }
            let _ = conn.commit_open_transaction().await;
        });
        channel_stream(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::{resolve, ConnectionParams};

    fn params() -> ConnectionParams {
        ConnectionParams {
            host: Some("sql.local".into()),
            port: Some(1433),
            database: Some("sales".into()),
            username: Some("sa".into()),
            password: Some("pw".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_config_from_descriptor() {
        let desc = resolve(BackendKind::Mssql, &params()).unwrap();
        let config = tiberius_config(&desc, &SessionOptions::default()).unwrap();
        assert_eq!(config.get_addr(), "sql.local:1433");
    }

    #[test]
    fn test_trusted_mode_rejected() {
        let mut p = params();
        p.trusted = true;
        let desc = resolve(BackendKind::Mssql, &p).unwrap();
        let err = tiberius_config(&desc, &SessionOptions::default()).unwrap_err();
        assert!(matches!(err, AccessError::Config(_)));
    }

    #[test]
    fn test_bind_rejects_mismatched_values() {
        let column = ColumnDescriptor {
            name: "n".into(),
            column_type: Tag::BigInteger,
            nullable: true,
            primary_key: false,
        };
        let mut query = Query::new("INSERT INTO [t] ([n]) VALUES (@P1)");
        assert!(bind_value(&mut query, &CellValue::Int(3), &column).is_ok());
        assert!(bind_value(&mut query, &CellValue::Null, &column).is_ok());
        let err = bind_value(&mut query, &CellValue::Text("x".into()), &column).unwrap_err();
        assert!(err.contains("column 'n'"));
    }
}
