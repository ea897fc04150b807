use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use graft_core::config::DatabaseConfig;
use graft_core::error::{GraftError, Result};
use graft_core::store::{Connection, Row, Transaction, TransactionKind};

use super::pool::{Pool, PoolStats, PooledConnection};

/// Where the facade gets its connections from.
trait ConnectionSource: Send + Sync {
    fn acquire<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, Result<Box<dyn Lease>>>;
    fn stats(&self) -> Option<PoolStats>;
    fn close(&self);
}

/// A connection held for the duration of one operation.
trait Lease: Send + Sync {
    fn connection(&self) -> &dyn Connection;
}

struct Direct(Arc<dyn Connection>);

impl Lease for Direct {
    fn connection(&self) -> &dyn Connection {
        self.0.as_ref()
    }
}

impl ConnectionSource for Direct {
    fn acquire<'a>(&'a self, _cancel: &'a CancellationToken) -> BoxFuture<'a, Result<Box<dyn Lease>>> {
        let lease: Box<dyn Lease> = Box::new(Direct(self.0.clone()));
        futures::future::ready(Ok(lease)).boxed()
    }

    fn stats(&self) -> Option<PoolStats> {
        None
    }

    fn close(&self) {
        self.0.close();
    }
}

impl<C: Connection> Lease for PooledConnection<C> {
    fn connection(&self) -> &dyn Connection {
        &**self
    }
}

impl<C: Connection> ConnectionSource for Pool<C> {
    fn acquire<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, Result<Box<dyn Lease>>> {
        async move {
            let conn = self.get(cancel).await?;
            Ok(Box::new(conn) as Box<dyn Lease>)
        }
        .boxed()
    }

    fn stats(&self) -> Option<PoolStats> {
        Some(Pool::stats(self))
    }

    fn close(&self) {
        Pool::close(self);
    }
}

/// A named database reached through a single connection or a pool.
#[derive(Clone)]
pub struct Database {
    name: Arc<str>,
    source: Arc<dyn ConnectionSource>,
}

impl Database {
    /// Use one shared connection for every operation.
    pub fn new(connection: impl Connection, name: impl Into<String>) -> Self {
        let connection: Arc<dyn Connection> = Arc::new(connection);
        Self {
            name: Arc::from(name.into()),
            source: Arc::new(Direct(connection)),
        }
    }

    /// Check a connection out of `pool` for every operation.
    pub fn pooled<C: Connection>(pool: Pool<C>, name: impl Into<String>) -> Self {
        Self {
            name: Arc::from(name.into()),
            source: Arc::new(pool),
        }
    }

    /// Build a pool from configuration and bind it to the configured database,
    /// creating the database when `create_if_missing` is set.
    pub async fn from_config<C, F, Fut>(config: &DatabaseConfig, factory: F) -> Result<Self>
    where
        C: Connection,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<C>> + Send + 'static,
    {
        if config.name.is_empty() {
            return Err(GraftError::Config("database name must not be empty".into()));
        }
        let pool = Pool::new(config.pool.to_pool_config()?, factory).await?;
        let db = Self::pooled(pool, config.name.clone());

        if config.create_if_missing {
            db.ensure_database(&CancellationToken::new()).await?;
        }

        info!(database = %db.name, address = %config.address, "Database ready");
        Ok(db)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pool occupancy, when backed by a pool.
    pub fn pool_stats(&self) -> Option<PoolStats> {
        self.source.stats()
    }

    /// Schema definition text as exported by the store.
    pub async fn schema(&self, cancel: &CancellationToken) -> Result<String> {
        let lease = self.lease(cancel).await?;
        lease.connection().schema(&self.name).await
    }

    /// Run one statement in a read transaction.
    pub async fn execute_read(&self, cancel: &CancellationToken, query: &str) -> Result<Vec<Row>> {
        let mut tx = self.transaction(cancel, TransactionKind::Read).await?;
        let rows = tx.query(cancel, query).await?;
        tx.close();
        Ok(rows)
    }

    /// Run one statement in a write transaction and commit it.
    pub async fn execute_write(&self, cancel: &CancellationToken, query: &str) -> Result<Vec<Row>> {
        let mut tx = self.transaction(cancel, TransactionKind::Write).await?;
        let rows = tx.query(cancel, query).await?;
        tx.commit().await?;
        Ok(rows)
    }

    /// Run one statement in a schema transaction and commit it.
    pub async fn execute_schema(&self, cancel: &CancellationToken, query: &str) -> Result<()> {
        let mut tx = self.transaction(cancel, TransactionKind::Schema).await?;
        tx.query(cancel, query).await?;
        tx.commit().await
    }

    /// Open a transaction. The connection stays checked out until it is dropped.
    pub async fn transaction(
        &self,
        cancel: &CancellationToken,
        kind: TransactionKind,
    ) -> Result<DbTransaction> {
        let lease = self.lease(cancel).await?;
        let tx = lease.connection().transaction(&self.name, kind).await?;
        debug!(database = %self.name, %kind, "Opened transaction");
        Ok(DbTransaction { tx, _lease: lease })
    }

    /// Create the database if the store does not have it. Returns whether it was created.
    pub async fn ensure_database(&self, cancel: &CancellationToken) -> Result<bool> {
        let lease = self.lease(cancel).await?;
        let conn = lease.connection();
        if conn.contains_database(&self.name).await? {
            return Ok(false);
        }
        if cancel.is_cancelled() {
            return Err(GraftError::Cancelled);
        }
        conn.create_database(&self.name).await?;
        info!(database = %self.name, "Created database");
        Ok(true)
    }

    /// Check that a connection can be obtained and the store answers.
    pub async fn health_check(&self, cancel: &CancellationToken) -> Result<()> {
        let lease = self.lease(cancel).await?;
        if lease.connection().contains_database(&self.name).await? {
            Ok(())
        } else {
            Err(GraftError::Database(format!(
                "database {} does not exist",
                self.name
            )))
        }
    }

    /// Close the underlying connection or pool.
    pub fn close(&self) {
        self.source.close();
    }

    async fn lease(&self, cancel: &CancellationToken) -> Result<Box<dyn Lease>> {
        if cancel.is_cancelled() {
            return Err(GraftError::Cancelled);
        }
        self.source.acquire(cancel).await
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("pool", &self.source.stats())
            .finish()
    }
}

/// A transaction scoped to the connection it was opened on.
///
/// A statement error closes the transaction without committing. Dropping an
/// uncommitted transaction closes it, then hands the connection back.
pub struct DbTransaction {
    tx: Box<dyn Transaction>,
    _lease: Box<dyn Lease>,
}

impl DbTransaction {
    pub async fn query(&mut self, cancel: &CancellationToken, statement: &str) -> Result<Vec<Row>> {
        if cancel.is_cancelled() {
            self.tx.close();
            return Err(GraftError::Cancelled);
        }
        match self.tx.query(statement).await {
            Ok(rows) => Ok(rows),
            Err(e) => {
                self.tx.close();
                Err(e)
            }
        }
    }

    pub async fn commit(&mut self) -> Result<()> {
        let result = self.tx.commit().await;
        self.tx.close();
        result
    }

    pub async fn rollback(&mut self) -> Result<()> {
        self.tx.rollback().await
    }

    pub fn close(&mut self) {
        self.tx.close();
    }

    pub fn is_open(&self) -> bool {
        self.tx.is_open()
    }
}

impl Drop for DbTransaction {
    fn drop(&mut self) {
        if self.tx.is_open() {
            self.tx.close();
        }
    }
}
