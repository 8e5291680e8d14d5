// SQL text generation for the fixed statements this crate issues itself:
// CREATE TABLE, DROP TABLE, INSERT and SELECT *

use crate::db::inference::ColumnType;
use crate::db::schema::ColumnDescriptor;
use crate::db::traits::BackendKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dialect {
    backend: BackendKind,
}

impl Dialect {
    pub fn new(backend: BackendKind) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    /// Quote an identifier, escaping the closing quote character
    pub fn quote_ident(&self, ident: &str) -> String {
        match self.backend {
            BackendKind::Mssql => format!("[{}]", ident.replace(']', "]]")),
            _ => format!("\"{}\"", ident.replace('"', "\"\"")),
        }
    }

    /// Quote a string literal
    pub fn quote_literal(value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    /// Quoted table reference. A dotted `table` carries its own schema.
    pub fn table_ref(&self, schema: Option<&str>, table: &str) -> String {
        let (schema, table) = match table.split_once('.') {
            Some((s, t)) => (Some(s), t),
            None => (schema, table),
        };
        match schema {
            Some(s) => format!("{}.{}", self.quote_ident(s), self.quote_ident(table)),
            None => self.quote_ident(table),
        }
    }

    /// Positional parameter marker, 1-based
    pub fn placeholder(&self, n: usize) -> String {
        match self.backend {
            BackendKind::Mssql => format!("@P{}", n),
            BackendKind::Sqlite => format!("?{}", n),
            _ => format!("${}", n),
        }
    }

    pub fn type_name(&self, column_type: ColumnType) -> String {
        use BackendKind::*;
        match column_type {
            ColumnType::Boolean => match self.backend {
                Mssql => "BIT".into(),
                _ => "BOOLEAN".into(),
            },
            ColumnType::BigInteger => "BIGINT".into(),
            ColumnType::Integer => match self.backend {
                Mssql => "INT".into(),
                _ => "INTEGER".into(),
            },
            ColumnType::Floating => match self.backend {
                Postgres | Redshift => "DOUBLE PRECISION".into(),
                _ => "FLOAT".into(),
            },
            ColumnType::Text(n) => format!("VARCHAR({})", n),
            ColumnType::Date => "DATE".into(),
            ColumnType::Timestamp => match self.backend {
                Mssql => "DATETIME2".into(),
                _ => "TIMESTAMP".into(),
            },
            ColumnType::UnboundedText => match self.backend {
                Mssql => "VARCHAR(MAX)".into(),
                Redshift => "VARCHAR(65535)".into(),
                Vertica => "LONG VARCHAR".into(),
                Postgres | Sqlite => "TEXT".into(),
            },
        }
    }

    pub fn column_definition(&self, column: &ColumnDescriptor) -> String {
        let mut def = format!(
            "{} {}",
            self.quote_ident(&column.name),
            self.type_name(column.column_type)
        );
        if column.primary_key {
            def.push_str(" NOT NULL PRIMARY KEY");
        } else if !column.nullable {
            def.push_str(" NOT NULL");
        }
        def
    }

    pub fn create_table(&self, schema: Option<&str>, table: &str, columns: &[ColumnDescriptor]) -> String {
        let defs: Vec<String> = columns.iter().map(|c| self.column_definition(c)).collect();
        format!(
            "CREATE TABLE {} ({})",
            self.table_ref(schema, table),
            defs.join(", ")
        )
    }

    pub fn drop_table(&self, schema: Option<&str>, table: &str) -> String {
        format!("DROP TABLE {}", self.table_ref(schema, table))
    }

    pub fn select_all(&self, schema: Option<&str>, table: &str) -> String {
        format!("SELECT * FROM {}", self.table_ref(schema, table))
    }

    pub fn insert(&self, schema: Option<&str>, table: &str, columns: &[String]) -> String {
        let names: Vec<String> = columns.iter().map(|c| self.quote_ident(c)).collect();
        let params: Vec<String> = (1..=columns.len()).map(|n| self.placeholder(n)).collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table_ref(schema, table),
            names.join(", "),
            params.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str, column_type: ColumnType) -> ColumnDescriptor {
        ColumnDescriptor {
            name: name.into(),
            column_type,
            nullable: true,
            primary_key: false,
        }
    }

    #[test]
    fn test_quote_ident_escapes() {
        assert_eq!(Dialect::new(BackendKind::Mssql).quote_ident("a]b"), "[a]]b]");
        assert_eq!(Dialect::new(BackendKind::Postgres).quote_ident("a\"b"), "\"a\"\"b\"");
        assert_eq!(Dialect::quote_literal("o'neil"), "'o''neil'");
    }

    #[test]
    fn test_table_ref() {
        let d = Dialect::new(BackendKind::Mssql);
        assert_eq!(d.table_ref(Some("dbo"), "t"), "[dbo].[t]");
        assert_eq!(d.table_ref(None, "sales.t"), "[sales].[t]");
        assert_eq!(d.table_ref(None, "t"), "[t]");
    }

    #[test]
    fn test_create_table_sqlite() {
        let d = Dialect::new(BackendKind::Sqlite);
        let mut key = col("index", ColumnType::BigInteger);
        key.primary_key = true;
        key.nullable = false;
        let sql = d.create_table(
            None,
            "people",
            &[
                key,
                col("name", ColumnType::Text(10)),
                col("active", ColumnType::Boolean),
            ],
        );
        assert_eq!(
            sql,
            "CREATE TABLE \"people\" (\"index\" BIGINT NOT NULL PRIMARY KEY, \"name\" VARCHAR(10), \"active\" BOOLEAN)"
        );
    }

    #[test]
    fn test_type_names_per_backend() {
        let mssql = Dialect::new(BackendKind::Mssql);
        assert_eq!(mssql.type_name(ColumnType::Boolean), "BIT");
        assert_eq!(mssql.type_name(ColumnType::Timestamp), "DATETIME2");
        assert_eq!(mssql.type_name(ColumnType::UnboundedText), "VARCHAR(MAX)");

        let pg = Dialect::new(BackendKind::Postgres);
        assert_eq!(pg.type_name(ColumnType::Floating), "DOUBLE PRECISION");
        assert_eq!(pg.type_name(ColumnType::UnboundedText), "TEXT");

        assert_eq!(
            Dialect::new(BackendKind::Redshift).type_name(ColumnType::UnboundedText),
            "VARCHAR(65535)"
        );
        assert_eq!(
            Dialect::new(BackendKind::Vertica).type_name(ColumnType::UnboundedText),
            "LONG VARCHAR"
        );
    }

    #[test]
    fn test_insert_placeholders() {
        let cols = vec!["a".to_string(), "b".to_string()];
        assert_eq!(
            Dialect::new(BackendKind::Mssql).insert(Some("dbo"), "t", &cols),
            "INSERT INTO [dbo].[t] ([a], [b]) VALUES (@P1, @P2)"
        );
        assert_eq!(
            Dialect::new(BackendKind::Postgres).insert(None, "t", &cols),
            "INSERT INTO \"t\" (\"a\", \"b\") VALUES ($1, $2)"
        );
        assert_eq!(
            Dialect::new(BackendKind::Sqlite).insert(None, "t", &cols),
            "INSERT INTO \"t\" (\"a\", \"b\") VALUES (?1, ?2)"
        );
    }

    #[test]
    fn test_select_and_drop() {
        let d = Dialect::new(BackendKind::Vertica);
        assert_eq!(d.select_all(Some("public"), "t"), "SELECT * FROM \"public\".\"t\"");
        assert_eq!(d.drop_table(None, "t"), "DROP TABLE \"t\"");
    }
}
