//! In-memory connector for tests and benchmarks.
//!
//! [`MemoryServer`] stands in for a database server: rows live per
//! `(database, schema, table)`, connections honour the resolved `database` and
//! `schema_search_path`, and the server counts open physical connections with
//! a high-water mark so ceiling tests can assert on it.
//!
//! ```rust,ignore
//! use prax_tenant::testing::{MemoryConnector, MemoryServer};
//!
//! let server = MemoryServer::new();
//! let connector = MemoryConnector::new(server.clone());
//! assert_eq!(server.open_connections(), 0);
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::DbConfig;
use crate::error::BoxError;
use crate::pool::Connector;
use crate::quote::split_search_path;

type Tables = HashMap<String, Vec<String>>;

/// An in-memory database server.
#[derive(Debug, Default)]
pub struct MemoryServer {
    data: Mutex<HashMap<(String, String), Tables>>,
    open: AtomicUsize,
    peak: AtomicUsize,
    connects: AtomicUsize,
    connect_delay: Mutex<Duration>,
    refused: Mutex<HashSet<String>>,
}

impl MemoryServer {
    /// Create a server.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Connections currently open.
    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Most connections ever open at once.
    pub fn peak_connections(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Connections ever opened.
    pub fn total_connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Delay every connect by `delay`.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = delay;
    }

    /// Refuse connections to `database`.
    pub fn refuse(&self, database: &str) {
        self.refused.lock().insert(database.to_string());
    }

    /// Accept connections to `database` again.
    pub fn accept(&self, database: &str) {
        self.refused.lock().remove(database);
    }

    /// Rows of a table.
    pub fn rows(&self, database: &str, schema: &str, table: &str) -> Vec<String> {
        self.data
            .lock()
            .get(&(database.to_string(), schema.to_string()))
            .and_then(|tables| tables.get(table))
            .cloned()
            .unwrap_or_default()
    }
}

/// Connector for a [`MemoryServer`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    server: Arc<MemoryServer>,
}

impl MemoryConnector {
    /// Create a connector.
    pub fn new(server: Arc<MemoryServer>) -> Self {
        Self { server }
    }

    /// The server.
    pub fn server(&self) -> &Arc<MemoryServer> {
        &self.server
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Connection = MemoryConnection;

    async fn connect(&self, config: &DbConfig) -> Result<MemoryConnection, BoxError> {
        let delay = *self.server.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let database = config.database.clone().unwrap_or_else(|| "default".to_string());
        if self.server.refused.lock().contains(&database) {
            return Err(format!("database '{database}' refused the connection").into());
        }

        let search_path = config
            .schema_search_path
            .as_deref()
            .map(split_search_path)
            .filter(|path| !path.is_empty())
            .unwrap_or_else(|| vec!["public".to_string()]);

        let open = self.server.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.server.peak.fetch_max(open, Ordering::SeqCst);
        self.server.connects.fetch_add(1, Ordering::SeqCst);

        Ok(MemoryConnection {
            server: self.server.clone(),
            database,
            search_path,
            shard: config.shard.clone(),
            broken: AtomicBool::new(false),
        })
    }

    fn is_valid(&self, connection: &MemoryConnection) -> bool {
        !connection.broken.load(Ordering::SeqCst)
    }
}

/// A physical connection to a [`MemoryServer`].
#[derive(Debug)]
pub struct MemoryConnection {
    server: Arc<MemoryServer>,
    database: String,
    search_path: Vec<String>,
    shard: Option<String>,
    broken: AtomicBool,
}

impl MemoryConnection {
    /// Connected database.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Schema tables resolve to (first entry of the search path).
    pub fn schema(&self) -> &str {
        self.search_path.first().map(String::as_str).unwrap_or("public")
    }

    /// The search path.
    pub fn search_path(&self) -> &[String] {
        &self.search_path
    }

    /// Shard key.
    pub fn shard(&self) -> Option<&str> {
        self.shard.as_deref()
    }

    /// Insert a row.
    pub fn insert(&self, table: &str, row: impl Into<String>) {
        self.server
            .data
            .lock()
            .entry((self.database.clone(), self.schema().to_string()))
            .or_default()
            .entry(table.to_string())
            .or_default()
            .push(row.into());
    }

    /// Count rows in a table.
    pub fn count(&self, table: &str) -> usize {
        self.server
            .data
            .lock()
            .get(&(self.database.clone(), self.schema().to_string()))
            .and_then(|tables| tables.get(table))
            .map_or(0, Vec::len)
    }

    /// Mark the connection unusable; the pool drops it on next use.
    pub fn break_connection(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.server.open.fetch_sub(1, Ordering::SeqCst);
    }
}
