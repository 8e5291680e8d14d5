// SQLite Connection Manager
// bb8 adapter for file-based SQLite connections

use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How long a connection waits on a locked database file before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens SQLite connections for a bb8 pool
#[derive(Debug, Clone)]
pub struct SqliteManager {
    path: PathBuf,
}

impl SqliteManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Expand a leading `~/` to the home directory
    fn resolved_path(&self) -> PathBuf {
        match self.path.strip_prefix("~") {
            Ok(rest) => match std::env::var_os("HOME") {
                Some(home) => Path::new(&home).join(rest),
                None => self.path.clone(),
            },
            Err(_) => self.path.clone(),
        }
    }
}

#[async_trait::async_trait]
impl bb8::ManageConnection for SqliteManager {
    type Connection = Connection;
    type Error = rusqlite::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let conn = Connection::open_with_flags(
            self.resolved_path(),
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map(|_| ())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bb8::ManageConnection;

    #[tokio::test]
    async fn test_connect_creates_file() {
        let path = std::env::temp_dir().join(format!("sqlframe_mgr_{}.db", uuid::Uuid::new_v4()));
        let manager = SqliteManager::new(&path);

        let mut conn = manager.connect().await.unwrap();
        assert!(manager.is_valid(&mut conn).await.is_ok());
        assert!(path.exists());

        drop(conn);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_home_expansion() {
        let manager = SqliteManager::new("/abs/x.db");
        assert_eq!(manager.resolved_path(), PathBuf::from("/abs/x.db"));

        if let Some(home) = std::env::var_os("HOME") {
            let manager = SqliteManager::new("~/data/x.db");
            assert_eq!(manager.resolved_path(), Path::new(&home).join("data/x.db"));
        }
    }
}
