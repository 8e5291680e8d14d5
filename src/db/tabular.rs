// Columnar and row-record views of the data that flows in and out of tables

use crate::db::traits::{AccessError, AccessResult};
use crate::db::value::CellValue;
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A named column of values
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub values: Vec<CellValue>,
}

impl Column {
    pub fn new<V: Into<CellValue>>(name: impl Into<String>, values: Vec<V>) -> Self {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// First value, used as the representative sample for type inference
    pub fn first(&self) -> Option<&CellValue> {
        self.values.first()
    }
}

/// Ordered named columns of equal length, with an optional row-identity
/// index column kept apart from the value columns.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TabularData {
    index: Option<Column>,
    columns: Vec<Column>,
}

impl TabularData {
    pub fn new(columns: Vec<Column>) -> AccessResult<Self> {
        let data = Self {
            index: None,
            columns,
        };
        data.validate()?;
        Ok(data)
    }

    /// Build from a statement's result set. Repeated column names, as
    /// produced by joins or unaliased aggregates, get numeric suffixes.
    pub fn from_result_set(names: Vec<String>, rows: Vec<Vec<CellValue>>) -> AccessResult<Self> {
        Self::from_rows(unique_names(names), rows)
    }

    /// Build from column names and row-major values
    pub fn from_rows(names: Vec<String>, rows: Vec<Vec<CellValue>>) -> AccessResult<Self> {
        let mut columns: Vec<Column> = names
            .into_iter()
            .map(|name| Column {
                name,
                values: Vec::with_capacity(rows.len()),
            })
            .collect();

        for (row_idx, row) in rows.into_iter().enumerate() {
            if row.len() != columns.len() {
                return Err(AccessError::InvalidData(format!(
                    "row {} has {} values, expected {}",
                    row_idx,
                    row.len(),
                    columns.len()
                )));
            }
            for (col, value) in columns.iter_mut().zip(row) {
                col.values.push(value);
            }
        }

        Self::new(columns)
    }

    /// Build from row records. Keys are unioned in first-seen order and
    /// missing fields become NULL.
    pub fn from_records(records: &[Record]) -> AccessResult<Self> {
        let mut names: Vec<String> = Vec::new();
        let mut positions: HashMap<&str, usize> = HashMap::new();
        for record in records {
            for name in record.columns.iter() {
                if !positions.contains_key(name.as_str()) {
                    positions.insert(name.as_str(), names.len());
                    names.push(name.clone());
                }
            }
        }

        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            let mut row = vec![CellValue::Null; names.len()];
            for (name, value) in record.iter() {
                row[positions[name]] = value.clone();
            }
            rows.push(row);
        }

        Self::from_rows(names, rows)
    }

    /// Attach a row-identity index column
    pub fn with_index(mut self, index: Column) -> AccessResult<Self> {
        self.index = Some(index);
        self.validate()?;
        Ok(self)
    }

    /// Promote a value column into the index
    pub fn set_index(&mut self, name: &str) -> AccessResult<()> {
        let pos = self
            .columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| {
                AccessError::InvalidData(format!("index column '{}' is not in the data", name))
            })?;
        let column = self.columns.remove(pos);
        self.index = Some(column);
        Ok(())
    }

    fn validate(&self) -> AccessResult<()> {
        let mut seen = HashSet::new();
        for col in &self.columns {
            if !seen.insert(col.name.as_str()) {
                return Err(AccessError::InvalidData(format!(
                    "duplicate column name '{}'",
                    col.name
                )));
            }
        }

        if let Some(index) = &self.index {
            if seen.contains(index.name.as_str()) {
                return Err(AccessError::InvalidData(format!(
                    "index '{}' has the same name as a column",
                    index.name
                )));
            }
        }

        let expected = self.row_count();
        let all = self.index.iter().chain(self.columns.iter());
        for col in all {
            if col.len() != expected {
                return Err(AccessError::InvalidData(format!(
                    "column '{}' has {} values, expected {}",
                    col.name,
                    col.len(),
                    expected
                )));
            }
        }
        Ok(())
    }

    pub fn index(&self) -> Option<&Column> {
        self.index.as_ref()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn row_count(&self) -> usize {
        self.index
            .as_ref()
            .or_else(|| self.columns.first())
            .map(Column::len)
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.row_count() == 0
    }

    /// Row-major copy of the value columns
    pub fn rows(&self) -> Vec<Vec<CellValue>> {
        (0..self.row_count())
            .map(|i| self.columns.iter().map(|c| c.values[i].clone()).collect())
            .collect()
    }

    /// Row records. An index becomes the leading field, so
    /// `from_records` followed by `set_index` restores the original.
    pub fn to_records(&self) -> Vec<Record> {
        let names: Arc<[String]> = self
            .index
            .iter()
            .chain(self.columns.iter())
            .map(|c| c.name.clone())
            .collect::<Vec<_>>()
            .into();
        let mut rows = self.rows();
        if let Some(index) = &self.index {
            for (row, key) in rows.iter_mut().zip(&index.values) {
                row.insert(0, key.clone());
            }
        }
        rows.into_iter()
            .map(|values| Record {
                columns: Arc::clone(&names),
                values,
            })
            .collect()
    }
}

/// Make result-set column names unique: the second `id` becomes `id_1`,
/// the third `id_2`, skipping any suffix already taken.
pub(crate) fn unique_names(names: Vec<String>) -> Vec<String> {
    let mut used: HashSet<String> = HashSet::with_capacity(names.len());
    names
        .into_iter()
        .map(|name| {
            let mut candidate = name.clone();
            let mut n = 1;
            while used.contains(&candidate) {
                candidate = format!("{}_{}", name, n);
                n += 1;
            }
            used.insert(candidate.clone());
            candidate
        })
        .collect()
}

/// One row as an ordered mapping of column name to value
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    columns: Arc<[String]>,
    values: Vec<CellValue>,
}

impl Record {
    pub fn new(columns: Arc<[String]>, values: Vec<CellValue>) -> AccessResult<Self> {
        if columns.len() != values.len() {
            return Err(AccessError::InvalidData(format!(
                "record has {} names but {} values",
                columns.len(),
                values.len()
            )));
        }
        Ok(Self { columns, values })
    }

    pub fn from_pairs<K, V, I>(pairs: I) -> AccessResult<Self>
    where
        K: Into<String>,
        V: Into<CellValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut names = Vec::new();
        let mut values = Vec::new();
        for (k, v) in pairs {
            let name = k.into();
            if names.contains(&name) {
                return Err(AccessError::InvalidData(format!(
                    "duplicate field '{}' in record",
                    name
                )));
            }
            names.push(name);
            values.push(v.into());
        }
        Self::new(names.into(), values)
    }

    pub fn get(&self, name: &str) -> Option<&CellValue> {
        self.columns
            .iter()
            .position(|c| c == name)
            .map(|i| &self.values[i])
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[CellValue] {
        &self.values
    }

    pub fn into_values(self) -> Vec<CellValue> {
        self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CellValue)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (name, value) in self.iter() {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Result shape requested from `import_table`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputShape {
    #[default]
    Tabular,
    Records,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImportResult {
    Tabular(TabularData),
    Records(Vec<Record>),
}

impl ImportResult {
    pub fn into_tabular(self) -> AccessResult<TabularData> {
        match self {
            ImportResult::Tabular(data) => Ok(data),
            ImportResult::Records(records) => TabularData::from_records(&records),
        }
    }

    pub fn into_records(self) -> Vec<Record> {
        match self {
            ImportResult::Tabular(data) => data.to_records(),
            ImportResult::Records(records) => records,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TabularData {
        TabularData::new(vec![
            Column::new("id", vec![1i64, 2, 3]),
            Column::new("name", vec!["a", "b", "c"]),
        ])
        .unwrap()
    }

    #[test]
    fn test_unequal_columns_rejected() {
        let err = TabularData::new(vec![
            Column::new("id", vec![1i64, 2]),
            Column::new("name", vec!["a"]),
        ])
        .unwrap_err();
        assert!(matches!(err, AccessError::InvalidData(_)));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = TabularData::new(vec![
            Column::new("id", vec![1i64]),
            Column::new("id", vec![2i64]),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("duplicate column"));
    }

    #[test]
    fn test_records_view_is_lossless() {
        let data = sample();
        let records = data.to_records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].get("name"), Some(&CellValue::Text("b".into())));

        let back = TabularData::from_records(&records).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_from_records_unions_keys() {
        let records = vec![
            Record::from_pairs([("a", CellValue::Int(1))]).unwrap(),
            Record::from_pairs([("b", CellValue::from("x")), ("a", CellValue::Int(2))]).unwrap(),
        ];
        let data = TabularData::from_records(&records).unwrap();
        assert_eq!(data.column_names(), vec!["a", "b"]);
        assert_eq!(data.column("a").unwrap().values, vec![CellValue::Int(1), CellValue::Int(2)]);
        assert_eq!(
            data.column("b").unwrap().values,
            vec![CellValue::Null, CellValue::Text("x".into())]
        );
    }

    #[test]
    fn test_from_rows_checks_width() {
        let err = TabularData::from_rows(
            vec!["a".into(), "b".into()],
            vec![vec![CellValue::Int(1)]],
        )
        .unwrap_err();
        assert!(matches!(err, AccessError::InvalidData(_)));
    }

    #[test]
    fn test_set_index_promotes_column() {
        let mut data = sample();
        data.set_index("id").unwrap();
        assert_eq!(data.index().unwrap().name, "id");
        assert_eq!(data.column_names(), vec!["name"]);
        assert_eq!(data.row_count(), 3);
        assert!(data.set_index("missing").is_err());
    }

    #[test]
    fn test_record_serializes_in_column_order() {
        let record = Record::from_pairs([
            ("z", CellValue::Int(1)),
            ("a", CellValue::Bool(true)),
        ])
        .unwrap();
        assert_eq!(serde_json::to_string(&record).unwrap(), r#"{"z":1,"a":true}"#);
    }

    #[test]
    fn test_indexed_records_round_trip() {
        let data = TabularData::new(vec![Column::new("name", vec!["a", "b"])])
            .unwrap()
            .with_index(Column::new("id", vec![10i64, 20]))
            .unwrap();
        let records = data.to_records();
        assert_eq!(records[0].columns(), ["id", "name"]);
        assert_eq!(records[1].get("id"), Some(&CellValue::Int(20)));

        let mut back = TabularData::from_records(&records).unwrap();
        back.set_index("id").unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_index_name_clash_rejected() {
        let err = sample()
            .with_index(Column::new("id", vec![7i64, 8, 9]))
            .unwrap_err();
        assert!(matches!(err, AccessError::InvalidData(_)));
    }

    #[test]
    fn test_result_set_names_made_unique() {
        assert_eq!(
            unique_names(vec!["id".into(), "id".into(), "id_1".into(), "id".into()]),
            vec!["id", "id_1", "id_1_1", "id_2"]
        );

        let data = TabularData::from_result_set(
            vec!["n".into(), "n".into()],
            vec![vec![CellValue::Int(1), CellValue::Int(2)]],
        )
        .unwrap();
        assert_eq!(data.column_names(), vec!["n", "n_1"]);
        assert_eq!(data.column("n_1").unwrap().values, vec![CellValue::Int(2)]);
    }

    #[test]
    fn test_record_rejects_duplicate_fields() {
        assert!(Record::from_pairs([("a", 1i64), ("a", 2i64)]).is_err());
    }
}
