// Database Drivers
// One `Connection`/`ConnectionSource` pair per wire driver

pub mod mssql;
pub mod postgres;
pub mod sqlite;

pub use mssql::{MssqlConnection, MssqlSource};
pub use postgres::{PgConnection, PgSource};
pub use sqlite::{SqliteConnection, SqliteSource};

use crate::db::connection::{ConnectionDescriptor, Endpoint};
use crate::db::pool::{PoolSettings, SessionOptions};
use crate::db::tabular::Record;
use crate::db::traits::{AccessError, AccessResult, BackendKind, ConnectionSource, RecordStream};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Rows buffered between a streaming fetcher and its consumer
pub(crate) const STREAM_BUFFER: usize = 256;

/// bb8 builder for validated settings; bb8 panics on the ones `validate` rejects
pub(crate) fn pool_builder<M: bb8::ManageConnection>(settings: &PoolSettings) -> AccessResult<bb8::Builder<M>> {
    settings.validate()?;
    Ok(bb8::Pool::builder()
        .max_size(settings.max_size)
        .min_idle(settings.min_idle)
        .connection_timeout(Duration::from_secs(settings.connection_timeout_secs)))
}

/// Consumer half of a streaming fetch. Fused, so polling past the end
/// keeps returning `None`.
pub(crate) fn channel_stream(rx: mpsc::Receiver<AccessResult<Record>>) -> RecordStream {
    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .fuse()
    .boxed()
}

/// Open the pool for a descriptor
pub async fn open_source(
    descriptor: &ConnectionDescriptor,
    options: &SessionOptions,
) -> AccessResult<Arc<dyn ConnectionSource>> {
    let source: Arc<dyn ConnectionSource> = match (descriptor.backend(), descriptor.endpoint()) {
        (BackendKind::Sqlite, Endpoint::File(path)) => {
            Arc::new(SqliteSource::open(path.clone(), &options.pool).await?)
        }
        (BackendKind::Mssql, Endpoint::Network { .. }) => {
            Arc::new(MssqlSource::open(descriptor, options).await?)
        }
        (kind, Endpoint::Network { .. }) if kind.speaks_pg_wire() => {
            Arc::new(PgSource::open(descriptor, &options.pool).await?)
        }
        (kind, _) => {
            return Err(AccessError::Config(format!(
                "endpoint does not match backend {}",
                kind.display_name()
            )))
        }
    };
    Ok(source)
}
