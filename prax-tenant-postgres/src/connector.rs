//! PostgreSQL connector for tenant pools.

use std::time::Duration;

use prax_tenant::{BoxError, Connector, DbConfig, async_trait};
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, warn};

use crate::error::{PgError, PgResult};

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 5432;

/// Opens `tokio-postgres` connections for resolved tenant configurations.
///
/// The resolved search path is applied right after connecting, so a pooled
/// connection is bound to its tenant's schema for its whole life.
#[derive(Debug, Clone)]
pub struct PgConnector {
    application_name: Option<String>,
    connect_timeout: Duration,
}

impl Default for PgConnector {
    fn default() -> Self {
        Self {
            application_name: None,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl PgConnector {
    /// Create a connector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name reported to the server.
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Build the driver configuration for a resolved tenant configuration.
    ///
    /// `extra.application_name` and `extra.connect_timeout` (seconds) override
    /// the connector defaults.
    pub fn pg_config(&self, config: &DbConfig) -> PgResult<tokio_postgres::Config> {
        let database = config
            .database
            .as_deref()
            .ok_or_else(|| PgError::config("no database configured"))?;

        let mut pg = tokio_postgres::Config::new();
        pg.host(config.host.as_deref().unwrap_or(DEFAULT_HOST));
        pg.port(config.port.unwrap_or(DEFAULT_PORT));
        pg.dbname(database);
        if let Some(ref user) = config.username {
            pg.user(user);
        }
        if let Some(ref password) = config.password {
            pg.password(password);
        }

        let application_name = config
            .extra
            .get("application_name")
            .and_then(|v| v.as_str())
            .or(self.application_name.as_deref());
        if let Some(name) = application_name {
            pg.application_name(name);
        }

        let connect_timeout = match config.extra.get("connect_timeout") {
            Some(value) => {
                let secs = value
                    .as_u64()
                    .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
                    .ok_or_else(|| PgError::config("invalid connect_timeout"))?;
                Duration::from_secs(secs)
            }
            None => self.connect_timeout,
        };
        pg.connect_timeout(connect_timeout);

        Ok(pg)
    }

    async fn open(&self, config: &DbConfig) -> PgResult<PgConnection> {
        let pg = self.pg_config(config)?;
        let (client, connection) = pg.connect(NoTls).await?;

        let database = config.database.clone().unwrap_or_default();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(database = %database, error = %e, "PostgreSQL connection terminated");
            }
        });

        if let Some(ref path) = config.schema_search_path {
            client.batch_execute(&search_path_statement(path)).await?;
        }

        debug!(
            host = ?config.host,
            database = ?config.database,
            search_path = ?config.schema_search_path,
            "PostgreSQL connection opened"
        );

        Ok(PgConnection {
            client,
            search_path: config.schema_search_path.clone(),
        })
    }
}

/// `SET search_path` for an already-quoted path.
pub(crate) fn search_path_statement(path: &str) -> String {
    format!("SET search_path TO {}", path)
}

#[async_trait]
impl Connector for PgConnector {
    type Connection = PgConnection;

    async fn connect(&self, config: &DbConfig) -> Result<PgConnection, BoxError> {
        self.open(config).await.map_err(|e| Box::new(e) as BoxError)
    }

    fn is_valid(&self, connection: &PgConnection) -> bool {
        !connection.client.is_closed()
    }
}

/// A tenant-bound PostgreSQL connection.
pub struct PgConnection {
    client: Client,
    search_path: Option<String>,
}

impl PgConnection {
    /// Execute a query and return all rows.
    pub async fn query(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> PgResult<Vec<Row>> {
        debug!(sql = %sql, "Executing query");
        Ok(self.client.query(sql, params).await?)
    }

    /// Execute a query and return exactly one row.
    pub async fn query_one(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> PgResult<Row> {
        debug!(sql = %sql, "Executing query_one");
        Ok(self.client.query_one(sql, params).await?)
    }

    /// Execute a query and return zero or one row.
    pub async fn query_opt(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> PgResult<Option<Row>> {
        debug!(sql = %sql, "Executing query_opt");
        Ok(self.client.query_opt(sql, params).await?)
    }

    /// Execute a statement and return the number of affected rows.
    pub async fn execute(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> PgResult<u64> {
        debug!(sql = %sql, "Executing statement");
        Ok(self.client.execute(sql, params).await?)
    }

    /// Execute a batch of statements in a single round-trip.
    pub async fn batch_execute(&self, sql: &str) -> PgResult<()> {
        debug!(sql = %sql, "Executing batch");
        self.client.batch_execute(sql).await?;
        Ok(())
    }

    /// The search path applied on connect.
    pub fn search_path(&self) -> Option<&str> {
        self.search_path.as_deref()
    }

    /// Get the underlying tokio-postgres client.
    pub fn inner(&self) -> &Client {
        &self.client
    }
}

impl std::fmt::Debug for PgConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgConnection")
            .field("search_path", &self.search_path)
            .field("closed", &self.client.is_closed())
            .finish()
    }
}
