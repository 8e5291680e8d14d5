// Session and Pool Manager
// Owns the pooled connection source and schema catalog for one descriptor

use crate::db::connection::ConnectionDescriptor;
use crate::db::drivers::open_source;
use crate::db::schema::SchemaCatalog;
use crate::db::traits::{
    AccessError, AccessResult, Connection, ConnectionError, ConnectionSource, PoolStatus,
};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bounds for the physical connection pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_size: u32,
    pub min_idle: Option<u32>,
    /// How long `acquire` waits for a free connection
    pub connection_timeout_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: 5,
            min_idle: Some(1),
            connection_timeout_secs: 30,
        }
    }
}

impl PoolSettings {
    /// Reject settings the pool cannot be built with
    pub fn validate(&self) -> AccessResult<()> {
        if self.max_size == 0 {
            return Err(AccessError::Config("pool max_size must be at least 1".to_string()));
        }
        if let Some(min_idle) = self.min_idle {
            if min_idle > self.max_size {
                return Err(AccessError::Config(format!(
                    "pool min_idle ({}) exceeds max_size ({})",
                    min_idle, self.max_size
                )));
            }
        }
        if self.connection_timeout_secs == 0 {
            return Err(AccessError::Config(
                "pool connection_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Reflect the schema on connect; when off every catalog call fails
    pub reflect: bool,
    pub pool: PoolSettings,
    pub mssql_encrypt: bool,
    pub mssql_trust_cert: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            reflect: true,
            pool: PoolSettings::default(),
            mssql_encrypt: false,
            mssql_trust_cert: true,
        }
    }
}

/// Everything that is rebuilt when the session switches database or schema
pub(crate) struct Live {
    pub(crate) descriptor: ConnectionDescriptor,
    pub(crate) source: Arc<dyn ConnectionSource>,
    pub(crate) catalog: Arc<SchemaCatalog>,
}

/// A connected session: one descriptor, one pool, one catalog
///
/// Switching database or schema swaps the pool and catalog in place. It must
/// not run concurrently with other operations on the same session.
pub struct Session {
    id: Uuid,
    options: SessionOptions,
    live: RwLock<Option<Arc<Live>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Open a pool for `descriptor` and reflect its schema
    pub async fn open(descriptor: ConnectionDescriptor, options: SessionOptions) -> AccessResult<Self> {
        let source = open_source(&descriptor, &options).await?;
        Self::from_source(descriptor, source, options).await
    }

    /// Build a session over an already opened connection source
    pub async fn from_source(
        descriptor: ConnectionDescriptor,
        source: Arc<dyn ConnectionSource>,
        options: SessionOptions,
    ) -> AccessResult<Self> {
        let id = Uuid::new_v4();
        let live = build_live(descriptor, source, &options).await?;
        info!(session = %id, url = %live.descriptor.redacted_url(), reflect = options.reflect, "session opened");
        Ok(Self {
            id,
            options,
            live: RwLock::new(Some(Arc::new(live))),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub(crate) async fn live(&self) -> AccessResult<Arc<Live>> {
        self.live
            .read()
            .await
            .clone()
            .ok_or_else(|| ConnectionError::SessionClosed.into())
    }

    /// Return a borrowed connection, committing whatever it left open
    pub(crate) async fn release(&self, mut conn: Box<dyn Connection>) {
        if let Err(e) = conn.commit_open_transaction().await {
            warn!(session = %self.id, error = %e, "reset on return failed");
        }
    }

    /// Lend one pooled connection to `f` and return it afterwards
    ///
    /// The connection goes back to the pool on every path, after its open
    /// transaction (if any) is committed.
    pub async fn with_connection<T, F>(&self, f: F) -> AccessResult<T>
    where
        F: for<'c> FnOnce(&'c mut dyn Connection) -> BoxFuture<'c, AccessResult<T>>,
    {
        let live = self.live().await?;
        let mut conn = live.source.acquire().await?;
        let result = f(conn.as_mut()).await;
        self.release(conn).await;
        result
    }

    /// Release every pooled connection; later calls fail with `SessionClosed`
    pub async fn close(&self) {
        if self.live.write().await.take().is_some() {
            info!(session = %self.id, "session closed");
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.live.read().await.is_none()
    }

    /// Reconnect to another database with the same credentials
    pub async fn switch_database(&self, database: &str) -> AccessResult<()> {
        let descriptor = self.live().await?.descriptor.with_database(database)?;
        self.reopen(descriptor).await
    }

    /// Reconnect under another schema namespace
    pub async fn switch_schema(&self, schema: Option<&str>) -> AccessResult<()> {
        let descriptor = self
            .live()
            .await?
            .descriptor
            .with_schema(schema.map(str::to_string));
        self.reopen(descriptor).await
    }

    async fn reopen(&self, descriptor: ConnectionDescriptor) -> AccessResult<()> {
        let source = open_source(&descriptor, &self.options).await?;
        let live = build_live(descriptor, source, &self.options).await?;
        info!(session = %self.id, url = %live.descriptor.redacted_url(), "session reopened");
        *self.live.write().await = Some(Arc::new(live));
        Ok(())
    }

    /// Borrow a connection and check it answers
    pub async fn is_healthy(&self) -> bool {
        let Ok(live) = self.live().await else {
            return false;
        };
        match live.source.acquire().await {
            Ok(mut conn) => {
                let alive = conn.is_alive().await;
                self.release(conn).await;
                alive
            }
            Err(e) => {
                debug!(session = %self.id, error = %e, "health check could not acquire");
                false
            }
        }
    }

    pub async fn pool_status(&self) -> AccessResult<PoolStatus> {
        Ok(self.live().await?.source.status())
    }

    pub async fn descriptor(&self) -> AccessResult<ConnectionDescriptor> {
        Ok(self.live().await?.descriptor.clone())
    }

    pub async fn catalog(&self) -> AccessResult<Arc<SchemaCatalog>> {
        Ok(Arc::clone(&self.live().await?.catalog))
    }

    /// Qualified names of every table in the current catalog snapshot
    pub async fn catalog_tables(&self) -> AccessResult<Vec<String>> {
        let catalog = self.catalog().await?;
        Ok(catalog.snapshot().await?.table_names())
    }
}

async fn build_live(
    descriptor: ConnectionDescriptor,
    source: Arc<dyn ConnectionSource>,
    options: &SessionOptions,
) -> AccessResult<Live> {
    let schema = descriptor.schema().map(str::to_string);
    let catalog = if options.reflect {
        let catalog = SchemaCatalog::new(schema);
        let mut conn = source.acquire().await?;
        let refreshed = catalog.refresh(conn.as_mut()).await;
        if let Err(e) = conn.commit_open_transaction().await {
            warn!(error = %e, "reset on return failed");
        }
        refreshed?;
        catalog
    } else {
        SchemaCatalog::disabled(schema)
    };

    Ok(Live {
        descriptor,
        source,
        catalog: Arc::new(catalog),
    })
}
