//! Schema-aware access layer over pooled SQL connections.
//!
//! Resolve a [`ConnectionDescriptor`] from [`ConnectionParams`], open a
//! [`Session`] on it, then read and write [`TabularData`] without writing
//! dialect-specific DDL or DML:
//!
//! ```no_run
//! use sqlframe::{resolve, BackendKind, Column, ConnectionParams, Session, SessionOptions,
//!     TabularData, WriteOptions};
//!
//! # async fn demo() -> sqlframe::AccessResult<()> {
//! let params = ConnectionParams {
//!     host: Some("/tmp/demo.db".into()),
//!     ..Default::default()
//! };
//! let session = Session::open(resolve(BackendKind::Sqlite, &params)?, SessionOptions::default()).await?;
//! let data = TabularData::new(vec![Column::new("id", vec![1i64, 2, 3])])?;
//! session.write_table("numbers", &data, &WriteOptions::default()).await?;
//! # Ok(())
//! # }
//! ```

pub mod db;

pub use db::*;
