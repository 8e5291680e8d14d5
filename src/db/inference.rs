// Column type inference from in-memory values

use crate::db::schema::ColumnDescriptor;
use crate::db::tabular::TabularData;
use crate::db::value::CellValue;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default character limit for inferred text columns
pub const DEFAULT_CHAR_LIMIT: u32 = 255;

/// Name given to the key column when the data carries no named index
pub const DEFAULT_INDEX_NAME: &str = "index";

/// Abstract column type, independent of any dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "length", rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    BigInteger,
    Floating,
    Boolean,
    Text(u32),
    Date,
    Timestamp,
    UnboundedText,
}

impl ColumnType {
    /// Map a declared SQL type name back to a tag. Accepts an explicit
    /// length or one embedded in the name, e.g. `VARCHAR(10)`.
    pub fn from_sql_type(type_name: &str, length: Option<i64>) -> Self {
        let lowered = type_name.trim().to_ascii_lowercase();
        let (base, embedded) = match lowered.find('(') {
            Some(open) => {
                let inner = lowered[open + 1..].trim_end_matches(')');
                let arg = inner.split(',').next().and_then(|s| s.trim().parse::<i64>().ok());
                (lowered[..open].trim().to_string(), arg)
            }
            None => (lowered.clone(), None),
        };
        let length = length.or(embedded);

        match base.as_str() {
            "bit" | "bool" | "boolean" => ColumnType::Boolean,
            "bigint" | "int8" | "bigserial" => ColumnType::BigInteger,
            "int" | "integer" | "int4" | "int2" | "smallint" | "tinyint" | "mediumint"
            | "serial" => ColumnType::Integer,
            "float" | "float4" | "float8" | "real" | "double" | "double precision" | "numeric"
            | "decimal" | "number" | "money" | "smallmoney" => ColumnType::Floating,
            "date" => ColumnType::Date,
            "varchar" | "nvarchar" | "char" | "nchar" | "character" | "character varying"
            | "bpchar" | "varchar2" => match length {
                Some(n) if n > 0 && n <= u32::MAX as i64 => ColumnType::Text(n as u32),
                _ => ColumnType::UnboundedText,
            },
            other if other.starts_with("timestamp") || other.contains("datetime") => {
                ColumnType::Timestamp
            }
            _ => ColumnType::UnboundedText,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Integer => f.write_str("integer"),
            ColumnType::BigInteger => f.write_str("big-integer"),
            ColumnType::Floating => f.write_str("floating"),
            ColumnType::Boolean => f.write_str("boolean"),
            ColumnType::Text(n) => write!(f, "text({})", n),
            ColumnType::Date => f.write_str("date"),
            ColumnType::Timestamp => f.write_str("timestamp"),
            ColumnType::UnboundedText => f.write_str("unbounded-text"),
        }
    }
}

/// Infer the column type for one representative value.
///
/// First match wins. `Bool` is checked ahead of `Int` so boolean columns
/// never become integers. Null and binary fall back to unbounded text.
pub fn infer_column_type(sample: &CellValue, char_limit: u32) -> ColumnType {
    match sample {
        CellValue::Bool(_) => ColumnType::Boolean,
        CellValue::Int(_) => ColumnType::BigInteger,
        CellValue::Float(_) => ColumnType::Floating,
        CellValue::Text(_) => ColumnType::Text(char_limit),
        CellValue::Date(_) => ColumnType::Date,
        CellValue::Timestamp(_) => ColumnType::Timestamp,
        CellValue::Null | CellValue::Binary(_) => ColumnType::UnboundedText,
    }
}

/// Build the column list for a new table from its data.
///
/// Each column is typed from its first row only. With `index_as_key` a
/// primary-key column is prepended, named after the data's index (or
/// `index`) and typed from the first index value; data without an index
/// gets positional keys.
pub fn infer_columns(data: &TabularData, char_limit: u32, index_as_key: bool) -> Vec<ColumnDescriptor> {
    let mut columns = Vec::with_capacity(data.columns().len() + 1);

    if index_as_key {
        let (name, column_type) = match data.index() {
            Some(index) => (
                index.name.clone(),
                index
                    .first()
                    .map(|v| infer_column_type(v, char_limit))
                    .unwrap_or(ColumnType::BigInteger),
            ),
            None => (DEFAULT_INDEX_NAME.to_string(), ColumnType::BigInteger),
        };
        columns.push(ColumnDescriptor {
            name,
            column_type,
            nullable: false,
            primary_key: true,
        });
    }

    for col in data.columns() {
        let column_type = col
            .first()
            .map(|v| infer_column_type(v, char_limit))
            .unwrap_or(ColumnType::UnboundedText);
        columns.push(ColumnDescriptor {
            name: col.name.clone(),
            column_type,
            nullable: true,
            primary_key: false,
        });
    }

    columns
}

/// Key values written for the index column: the data's own index, or
/// row positions when it has none.
pub(crate) fn index_values(data: &TabularData) -> Vec<CellValue> {
    match data.index() {
        Some(index) => index.values.clone(),
        None => (0..data.row_count() as i64).map(CellValue::Int).collect(),
    }
}
