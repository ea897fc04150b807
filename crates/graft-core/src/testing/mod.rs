//! Testing utilities for graft.
//!
//! [`MemoryStore`] is an in-process store that speaks the TypeQL subset the
//! migration engine emits. Transactions work on a private copy of the
//! database and publish it on commit, so a failed or rolled back
//! transaction leaves no trace. Failure injection and connection counters
//! let pool and runner tests observe what happened.
//!
//! # Example
//!
//! ```ignore
//! let store = MemoryStore::new().with_database("social");
//! let conn = store.connect();
//! let mut tx = conn.transaction("social", TransactionKind::Schema).await?;
//! tx.query("define attribute email, value string;").await?;
//! tx.commit().await?;
//! ```

pub mod assertions;
mod interpreter;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::{GraftError, Result};
use crate::schema::SchemaModel;
use crate::store::{Connection, Row, Transaction, TransactionKind};

use interpreter::DatabaseState;

/// Default timeout for tests that wait on the pool.
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct StoreInner {
    databases: Mutex<BTreeMap<String, DatabaseState>>,
    failures: Mutex<Vec<String>>,
    executed: Mutex<Vec<String>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
    refuse_connections: AtomicBool,
}

impl StoreInner {
    fn databases(&self) -> MutexGuard<'_, BTreeMap<String, DatabaseState>> {
        self.databases.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn injected_failure(&self, statement: &str) -> Option<String> {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|pattern| statement.contains(pattern.as_str()))
            .cloned()
    }

    fn log(&self, statement: &str) {
        self.executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(statement.trim().to_string());
    }
}

/// In-memory store shared by every connection created from it.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty database.
    pub fn with_database(self, name: &str) -> Self {
        self.inner
            .databases()
            .entry(name.to_string())
            .or_default();
        self
    }

    /// Open a new connection.
    pub fn connect(&self) -> MemoryConnection {
        let id = self.inner.opened.fetch_add(1, Ordering::SeqCst);
        MemoryConnection {
            id,
            store: self.inner.clone(),
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Connection factory for the pool; fails while connections are refused.
    pub fn connect_async(&self) -> BoxFuture<'static, Result<MemoryConnection>> {
        let store = self.clone();
        async move {
            if store.inner.refuse_connections.load(Ordering::SeqCst) {
                return Err(GraftError::Database("connection refused".to_string()));
            }
            Ok(store.connect())
        }
        .boxed()
    }

    /// Make new connections fail until called again with `false`.
    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Fail every statement containing `pattern`.
    pub fn fail_statements_containing(&self, pattern: &str) {
        self.inner
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(pattern.to_string());
    }

    pub fn clear_failures(&self) {
        self.inner
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Committed schema of a database.
    pub fn schema_of(&self, database: &str) -> Option<SchemaModel> {
        self.inner.databases().get(database).map(|s| s.model.clone())
    }

    /// Committed instance count of a type, subtypes excluded.
    pub fn count_instances(&self, database: &str, type_name: &str) -> usize {
        self.inner
            .databases()
            .get(database)
            .map(|s| {
                s.instances
                    .iter()
                    .filter(|i| i.type_name == type_name)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Every statement sent to any transaction, in order.
    pub fn executed_statements(&self) -> Vec<String> {
        self.inner
            .executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn connections_opened(&self) -> usize {
        self.inner.opened.load(Ordering::SeqCst)
    }

    pub fn connections_closed(&self) -> usize {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

/// Handle that can break a connection from outside, e.g. while it sits idle in a pool.
#[derive(Clone)]
pub struct ConnectionHandle {
    open: Arc<AtomicBool>,
}

impl ConnectionHandle {
    /// Mark the connection as dead without counting it as closed.
    pub fn kill(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

pub struct MemoryConnection {
    id: usize,
    store: Arc<StoreInner>,
    open: Arc<AtomicBool>,
}

impl MemoryConnection {
    /// Sequence number of this connection within its store, starting at 0.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            open: self.open.clone(),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(GraftError::Database("connection is closed".to_string()))
        }
    }
}

impl Connection for MemoryConnection {
    fn transaction<'a>(
        &'a self,
        database: &'a str,
        kind: TransactionKind,
    ) -> BoxFuture<'a, Result<Box<dyn Transaction>>> {
        async move {
            self.ensure_open()?;
            let snapshot = self
                .store
                .databases()
                .get(database)
                .cloned()
                .ok_or_else(|| {
                    GraftError::Database(format!("database {} does not exist", database))
                })?;
            Ok(Box::new(MemoryTransaction {
                store: self.store.clone(),
                database: database.to_string(),
                kind,
                working: snapshot,
                open: true,
            }) as Box<dyn Transaction>)
        }
        .boxed()
    }

    fn schema<'a>(&'a self, database: &'a str) -> BoxFuture<'a, Result<String>> {
        async move {
            self.ensure_open()?;
            self.store
                .databases()
                .get(database)
                .map(|s| s.model.to_typeql())
                .ok_or_else(|| GraftError::Database(format!("database {} does not exist", database)))
        }
        .boxed()
    }

    fn create_database<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<()>> {
        async move {
            self.ensure_open()?;
            let mut databases = self.store.databases();
            if databases.contains_key(name) {
                return Err(GraftError::Database(format!("database {} already exists", name)));
            }
            databases.insert(name.to_string(), DatabaseState::default());
            Ok(())
        }
        .boxed()
    }

    fn delete_database<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<()>> {
        async move {
            self.ensure_open()?;
            self.store
                .databases()
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| GraftError::Database(format!("database {} does not exist", name)))
        }
        .boxed()
    }

    fn contains_database<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool>> {
        async move {
            self.ensure_open()?;
            Ok(self.store.databases().contains_key(name))
        }
        .boxed()
    }

    fn all_databases(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        async move {
            self.ensure_open()?;
            Ok(self.store.databases().keys().cloned().collect())
        }
        .boxed()
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.store.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

struct MemoryTransaction {
    store: Arc<StoreInner>,
    database: String,
    kind: TransactionKind,
    working: DatabaseState,
    open: bool,
}

impl MemoryTransaction {
    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(GraftError::Database("transaction is closed".to_string()))
        }
    }
}

impl Transaction for MemoryTransaction {
    fn query<'a>(&'a mut self, statement: &'a str) -> BoxFuture<'a, Result<Vec<Row>>> {
        async move {
            self.ensure_open()?;
            self.store.log(statement);
            if let Some(pattern) = self.store.injected_failure(statement) {
                return Err(GraftError::Statement {
                    statement: statement.trim().to_string(),
                    message: format!("injected failure ({})", pattern),
                });
            }
            interpreter::execute(&mut self.working, statement, self.kind)
        }
        .boxed()
    }

    fn commit(&mut self) -> BoxFuture<'_, Result<()>> {
        async move {
            self.ensure_open()?;
            if self.kind == TransactionKind::Read {
                return Err(GraftError::Database(
                    "read transactions cannot be committed".to_string(),
                ));
            }
            self.open = false;
            let mut databases = self.store.databases();
            match databases.get_mut(&self.database) {
                Some(state) => {
                    *state = std::mem::take(&mut self.working);
                    Ok(())
                }
                None => Err(GraftError::Database(format!(
                    "database {} was deleted",
                    self.database
                ))),
            }
        }
        .boxed()
    }

    fn rollback(&mut self) -> BoxFuture<'_, Result<()>> {
        async move {
            self.ensure_open()?;
            self.working = self
                .store
                .databases()
                .get(&self.database)
                .cloned()
                .unwrap_or_default();
            Ok(())
        }
        .boxed()
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(store: &MemoryStore, kind: TransactionKind, statements: &[&str]) -> Result<Vec<Row>> {
        let conn = store.connect();
        let mut tx = conn.transaction("db", kind).await?;
        let mut rows = Vec::new();
        for statement in statements {
            rows = tx.query(statement).await?;
        }
        if kind != TransactionKind::Read {
            tx.commit().await?;
        }
        Ok(rows)
    }

    const LEDGER: &str = "define
        attribute tag, value string;
        attribute at, value datetime;
        entity record, owns tag @key, owns at;";

    #[tokio::test]
    async fn test_define_insert_fetch() {
        let store = MemoryStore::new().with_database("db");
        run(&store, TransactionKind::Schema, &[LEDGER]).await.unwrap();
        run(
            &store,
            TransactionKind::Write,
            &[
                r#"insert $r isa record, has tag "a \"quoted\" tag", has at 2024-01-01T00:00:00.000;"#,
                r#"insert $r isa record, has tag "b";"#,
            ],
        )
        .await
        .unwrap();

        let rows = run(
            &store,
            TransactionKind::Read,
            &[r#"match $r isa record; fetch { "tag": $r.tag, "at": $r.at };"#],
        )
        .await
        .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].text("tag").unwrap(), "a \"quoted\" tag");
        assert!(rows[0].timestamp("at").is_ok());
        assert!(rows[1].get("at").is_null());
        assert_eq!(store.count_instances("db", "record"), 2);
    }

    #[tokio::test]
    async fn test_reduce_count_and_delete() {
        let store = MemoryStore::new().with_database("db");
        run(&store, TransactionKind::Schema, &[LEDGER]).await.unwrap();
        run(
            &store,
            TransactionKind::Write,
            &[
                r#"insert $r isa record, has tag "a";"#,
                r#"insert $r isa record, has tag "b";"#,
                r#"match $r isa record, has tag "a"; delete $r;"#,
            ],
        )
        .await
        .unwrap();

        let rows = run(
            &store,
            TransactionKind::Read,
            &["match $r isa record; reduce $count = count($r);"],
        )
        .await
        .unwrap();
        assert_eq!(rows[0].integer("count").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_key_uniqueness_enforced() {
        let store = MemoryStore::new().with_database("db");
        run(&store, TransactionKind::Schema, &[LEDGER]).await.unwrap();
        let result = run(
            &store,
            TransactionKind::Write,
            &[
                r#"insert $r isa record, has tag "a";"#,
                r#"insert $r isa record, has tag "a";"#,
            ],
        )
        .await;
        assert!(matches!(result, Err(GraftError::Statement { .. })));
        assert_eq!(store.count_instances("db", "record"), 0);
    }

    #[tokio::test]
    async fn test_uncommitted_changes_are_discarded() {
        let store = MemoryStore::new().with_database("db");
        let conn = store.connect();
        let mut tx = conn.transaction("db", TransactionKind::Schema).await.unwrap();
        tx.query("define attribute tag, value string;").await.unwrap();
        tx.close();
        assert!(store.schema_of("db").unwrap().is_empty());
        assert!(tx.query("define attribute other, value string;").await.is_err());
    }

    #[tokio::test]
    async fn test_schema_statements_need_schema_transaction() {
        let store = MemoryStore::new().with_database("db");
        let err = run(&store, TransactionKind::Write, &["define attribute tag, value string;"])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("requires a schema transaction"));
    }

    #[tokio::test]
    async fn test_undefine() {
        let store = MemoryStore::new().with_database("db");
        run(
            &store,
            TransactionKind::Schema,
            &["define attribute nick, value string; entity person, owns nick;"],
        )
        .await
        .unwrap();

        let err = run(&store, TransactionKind::Schema, &["undefine nick;"]).await.unwrap_err();
        assert!(err.to_string().contains("still owned"));

        run(
            &store,
            TransactionKind::Schema,
            &["undefine owns nick from person;", "undefine nick;"],
        )
        .await
        .unwrap();
        let model = store.schema_of("db").unwrap();
        assert!(model.attributes.is_empty());
        assert!(model.entities["person"].owns.is_empty());
    }

    #[tokio::test]
    async fn test_schema_export_round_trips() {
        let store = MemoryStore::new().with_database("db");
        run(&store, TransactionKind::Schema, &[LEDGER]).await.unwrap();
        let text = store.connect().schema("db").await.unwrap();
        let parsed = crate::schema::parse_schema(&text).unwrap();
        assert_eq!(Some(parsed), store.schema_of("db"));
    }

    #[tokio::test]
    async fn test_injected_failure_and_log() {
        let store = MemoryStore::new().with_database("db");
        store.fail_statements_containing("explode");
        let err = run(&store, TransactionKind::Schema, &["define attribute explode, value string;"])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("injected failure"));
        assert_eq!(store.executed_statements().len(), 1);

        store.clear_failures();
        run(&store, TransactionKind::Schema, &["define attribute explode, value string;"])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_connection_counters_and_kill() {
        let store = MemoryStore::new().with_database("db");
        let conn = store.connect();
        let handle = conn.handle();
        handle.kill();
        assert!(!conn.is_open());
        assert!(conn.transaction("db", TransactionKind::Read).await.is_err());

        let other = store.connect();
        assert_eq!((conn.id(), other.id()), (0, 1));
        other.close();
        other.close();
        assert_eq!(store.connections_opened(), 2);
        assert_eq!(store.connections_closed(), 1);

        store.refuse_connections(true);
        assert!(store.connect_async().await.is_err());
        store.refuse_connections(false);
        assert!(store.connect_async().await.is_ok());
    }
}
