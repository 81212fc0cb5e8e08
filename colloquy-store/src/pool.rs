//! Bounded pool of SQLite connections.
//!
//! At most `max_size` connections are checked out at once. Callers wait on a
//! semaphore permit, then run their closure on the blocking thread pool with a
//! connection that is returned to the idle list when the guard drops.

use rusqlite::Connection;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::error::{Result, StoreError};

const SCHEMA: &str = include_str!("schema.sql");

/// Pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_size: usize,
    pub busy_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 8,
            busy_timeout: Duration::from_millis(5000),
        }
    }
}

struct Shared {
    path: PathBuf,
    busy_timeout: Duration,
    idle: Mutex<Vec<Connection>>,
}

impl Shared {
    fn open_connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        configure(&conn, self.busy_timeout)?;
        Ok(conn)
    }

    fn checkout(self: &Arc<Self>) -> Result<PooledConnection> {
        let reused = self
            .idle
            .lock()
            .map_err(|_| StoreError::Unavailable("connection pool poisoned".into()))?
            .pop();
        let conn = match reused {
            Some(conn) => conn,
            None => self.open_connection()?,
        };
        Ok(PooledConnection {
            conn: Some(conn),
            shared: Arc::clone(self),
        })
    }
}

fn configure(conn: &Connection, busy_timeout: Duration) -> Result<()> {
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = FULL;
         PRAGMA foreign_keys = ON;",
    )?;
    Ok(())
}

/// A connection on loan from the pool.
pub struct PooledConnection {
    conn: Option<Connection>,
    shared: Arc<Shared>,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // Only `Drop` takes the connection out.
        self.conn.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // A poisoned idle list just means the connection is closed instead.
            if let Ok(mut idle) = self.shared.idle.lock() {
                idle.push(conn);
            }
        }
    }
}

/// Cloneable handle to the pool.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<Shared>,
    permits: Arc<Semaphore>,
    max_size: usize,
}

impl ConnectionPool {
    /// Open the database at `path`, creating parent directories and the schema.
    pub fn open(path: impl AsRef<Path>, config: PoolConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Unavailable(format!(
                        "cannot create database directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        let max_size = config.max_size.max(1);
        let shared = Arc::new(Shared {
            path,
            busy_timeout: config.busy_timeout,
            idle: Mutex::new(Vec::with_capacity(max_size)),
        });

        let conn = shared.open_connection()?;
        conn.execute_batch(SCHEMA)?;
        shared
            .idle
            .lock()
            .map_err(|_| StoreError::Unavailable("connection pool poisoned".into()))?
            .push(conn);

        tracing::debug!(path = %shared.path.display(), max_size, "Connection pool opened");

        Ok(Self {
            shared,
            permits: Arc::new(Semaphore::new(max_size)),
            max_size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Number of connections currently checked out.
    pub fn in_use(&self) -> usize {
        self.max_size - self.permits.available_permits()
    }

    /// Run `f` with a pooled connection on the blocking thread pool.
    pub async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| StoreError::Unavailable("connection pool closed".into()))?;
        let shared = Arc::clone(&self.shared);

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let mut conn = shared.checkout()?;
            f(&mut *conn)
        })
        .await?
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("path", &self.shared.path)
            .field("max_size", &self.max_size)
            .finish()
    }
}
