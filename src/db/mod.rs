// Database Module
// Connection resolution, pooled sessions, schema catalog and table I/O

pub mod connection;
pub mod dialect;
pub mod drivers;
pub mod inference;
pub mod pool;
pub mod query;
pub mod schema;
pub mod sqlite_manager;
pub mod tabular;
pub mod traits;
pub mod value;

pub use connection::{
    resolve, ConnectionDescriptor, ConnectionParams, Credential, CredentialPrompt, Endpoint,
    JsonProfileStore, MemoryProfileStore, ProfileEntry, ProfileStore, Resolver, Source,
};
pub use dialect::Dialect;
pub use inference::{infer_column_type, infer_columns, ColumnType, DEFAULT_CHAR_LIMIT};
pub use pool::{PoolSettings, Session, SessionOptions};
pub use query::{IfExists, WriteOptions, WriteOutcome};
pub use schema::{CatalogSnapshot, ColumnDescriptor, SchemaCatalog, TableDescriptor};
pub use tabular::{Column, ImportResult, OutputShape, Record, TabularData};
pub use traits::{
    AccessError, AccessResult, BackendKind, Connection, ConnectionError, ConnectionSource,
    ObjectKind, PoolStatus, RecordStream, ReflectionError, ResultSet,
};
pub use value::CellValue;
