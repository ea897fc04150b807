//! One-shot schema migration: diff the desired schema against the database
//! and apply the additive part.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use graft_core::error::{GraftError, Result};
use graft_core::schema::{SchemaIntrospector, SchemaProvider, TypeqlIntrospector};

use super::diff::SchemaDiff;
use super::ledger::{hash_statements, MigrationLedger};
use crate::db::Database;

/// A one-shot migration that failed, with the diff when it got that far.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct MigrateFailure {
    pub diff: Option<SchemaDiff>,
    #[source]
    pub error: GraftError,
}

impl MigrateFailure {
    fn before_diff(error: GraftError) -> Self {
        Self { diff: None, error }
    }

    fn with_diff(diff: SchemaDiff, error: GraftError) -> Self {
        Self {
            diff: Some(diff),
            error,
        }
    }
}

/// Diff a desired schema against schema text reported by the store.
pub fn diff_against(
    provider: &dyn SchemaProvider,
    introspector: &dyn SchemaIntrospector,
    schema_text: &str,
) -> Result<SchemaDiff> {
    let desired = provider.desired_schema()?;
    let current = introspector.introspect(schema_text)?;
    Ok(SchemaDiff::between(&desired, &current))
}

/// Bring the database up to the desired schema and record the change in the
/// hash ledger. Returns the diff that was computed.
pub async fn migrate(
    cancel: &CancellationToken,
    db: &Database,
    provider: &dyn SchemaProvider,
) -> std::result::Result<SchemaDiff, MigrateFailure> {
    let schema_text = db
        .schema(cancel)
        .await
        .map_err(MigrateFailure::before_diff)?;
    migrate_from_schema(cancel, db, provider, &schema_text).await
}

/// Like [`migrate`], diffing against schema text the caller already has.
///
/// A change set whose hash is already in the ledger is skipped. The hash
/// covers the generated statements, so stale schema text that reproduces an
/// applied diff does not run it twice.
pub async fn migrate_from_schema(
    cancel: &CancellationToken,
    db: &Database,
    provider: &dyn SchemaProvider,
    schema_text: &str,
) -> std::result::Result<SchemaDiff, MigrateFailure> {
    let ledger = MigrationLedger::new(db.clone());
    ledger
        .ensure_schema(cancel)
        .await
        .map_err(MigrateFailure::before_diff)?;

    let diff = diff_against(provider, &TypeqlIntrospector, schema_text)
        .map_err(MigrateFailure::before_diff)?;
    warn_about_removals(&diff);
    if !diff.has_additions() {
        debug!("Schema is up to date");
        return Ok(diff);
    }

    let statements = diff.generate_migration();
    let hash = hash_statements(&statements);
    match ledger.is_applied(cancel, &hash).await {
        Ok(true) => {
            info!(hash = %hash, "Schema migration already applied, skipping");
            return Ok(diff);
        }
        Ok(false) => {}
        Err(e) => return Err(MigrateFailure::with_diff(diff, e)),
    }

    if let Err(e) = apply(cancel, db, &statements).await {
        return Err(MigrateFailure::with_diff(diff, e));
    }

    let summary = diff.summary();
    if let Err(e) = ledger.record(cancel, &hash, &summary).await {
        return Err(MigrateFailure::with_diff(diff, e));
    }
    info!(statements = statements.len(), "Schema migration applied: {}", summary);
    Ok(diff)
}

/// Apply the additive diff without touching the ledger.
pub async fn migrate_untracked(
    cancel: &CancellationToken,
    db: &Database,
    provider: &dyn SchemaProvider,
) -> std::result::Result<SchemaDiff, MigrateFailure> {
    let schema_text = db
        .schema(cancel)
        .await
        .map_err(MigrateFailure::before_diff)?;
    let diff = diff_against(provider, &TypeqlIntrospector, &schema_text)
        .map_err(MigrateFailure::before_diff)?;
    warn_about_removals(&diff);

    let statements = diff.generate_migration();
    if let Err(e) = apply(cancel, db, &statements).await {
        return Err(MigrateFailure::with_diff(diff, e));
    }
    Ok(diff)
}

async fn apply(cancel: &CancellationToken, db: &Database, statements: &[String]) -> Result<()> {
    for statement in statements {
        debug!("Executing: {}", statement);
        db.execute_schema(cancel, statement)
            .await
            .map_err(|e| e.in_statement(statement))?;
    }
    Ok(())
}

fn warn_about_removals(diff: &SchemaDiff) {
    if !diff.remove_types.is_empty() {
        warn!(
            "{} type(s) in database not in code, leaving them in place: {}",
            diff.remove_types.len(),
            diff.remove_types.join(", ")
        );
    }
    if !diff.remove_owns.is_empty() {
        let labels: Vec<String> = diff.remove_owns.iter().map(|c| c.label()).collect();
        warn!(
            "{} owns clause(s) in database not in code, leaving them in place: {}",
            labels.len(),
            labels.join(", ")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use graft_core::schema::{
        AttributeSpec, EntitySpec, OwnsSpec, RelationSpec, RoleSpec, SchemaModel, SchemaRegistry,
        ValueType,
    };
    use graft_core::store::{Connection, Row, Transaction, TransactionKind};
    use graft_core::testing::{MemoryConnection, MemoryStore};

    /// Store connection whose driver rejects statements mentioning `pattern`
    /// with an error that does not say which statement it was.
    struct RejectingConnection {
        inner: MemoryConnection,
        pattern: &'static str,
    }

    struct RejectingTransaction {
        inner: Box<dyn Transaction>,
        pattern: &'static str,
    }

    impl Transaction for RejectingTransaction {
        fn query<'a>(&'a mut self, statement: &'a str) -> BoxFuture<'a, Result<Vec<Row>>> {
            if statement.contains(self.pattern) {
                return async { Err(GraftError::Database("type conflict".into())) }.boxed();
            }
            self.inner.query(statement)
        }

        fn commit(&mut self) -> BoxFuture<'_, Result<()>> {
            self.inner.commit()
        }

        fn rollback(&mut self) -> BoxFuture<'_, Result<()>> {
            self.inner.rollback()
        }

        fn close(&mut self) {
            self.inner.close()
        }

        fn is_open(&self) -> bool {
            self.inner.is_open()
        }
    }

    impl Connection for RejectingConnection {
        fn transaction<'a>(
            &'a self,
            database: &'a str,
            kind: TransactionKind,
        ) -> BoxFuture<'a, Result<Box<dyn Transaction>>> {
            async move {
                let inner = self.inner.transaction(database, kind).await?;
                let tx: Box<dyn Transaction> = Box::new(RejectingTransaction {
                    inner,
                    pattern: self.pattern,
                });
                Ok(tx)
            }
            .boxed()
        }

        fn schema<'a>(&'a self, database: &'a str) -> BoxFuture<'a, Result<String>> {
            self.inner.schema(database)
        }

        fn create_database<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<()>> {
            self.inner.create_database(name)
        }

        fn delete_database<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<()>> {
            self.inner.delete_database(name)
        }

        fn contains_database<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool>> {
            self.inner.contains_database(name)
        }

        fn all_databases(&self) -> BoxFuture<'_, Result<Vec<String>>> {
            self.inner.all_databases()
        }

        fn close(&self) {
            self.inner.close()
        }

        fn is_open(&self) -> bool {
            self.inner.is_open()
        }
    }

    fn social() -> SchemaRegistry {
        let registry = SchemaRegistry::new();
        registry
            .register_attribute(AttributeSpec::new("email", ValueType::String))
            .unwrap();
        registry
            .register_attribute(AttributeSpec::new("name", ValueType::String))
            .unwrap();
        registry
            .register_entity(
                EntitySpec::new("person")
                    .owns(OwnsSpec::key("email"))
                    .owns(OwnsSpec::new("name"))
                    .plays("friendship", "friend"),
            )
            .unwrap();
        registry
            .register_relation(RelationSpec::new("friendship").relates(RoleSpec::new("friend")))
            .unwrap();
        registry
    }

    fn ledger_size(store: &MemoryStore) -> usize {
        store.count_instances("db", "migration-record")
    }

    #[tokio::test]
    async fn test_migrate_converges() {
        let store = MemoryStore::new().with_database("db");
        let db = Database::new(store.connect(), "db");
        let cancel = CancellationToken::new();
        let registry = social();

        let diff = migrate(&cancel, &db, &registry).await.unwrap();
        assert_eq!(diff.add_attributes.len(), 2);
        assert_eq!(ledger_size(&store), 1);

        let desired = registry.desired_schema().unwrap();
        let current = store.schema_of("db").unwrap();
        assert!(SchemaDiff::between(&desired, &current).is_empty());

        let again = migrate(&cancel, &db, &registry).await.unwrap();
        assert!(again.is_empty());
        assert_eq!(ledger_size(&store), 1);
    }

    #[tokio::test]
    async fn test_migrate_adds_to_existing_schema() {
        let store = MemoryStore::new().with_database("db");
        let db = Database::new(store.connect(), "db");
        let cancel = CancellationToken::new();
        db.execute_schema(
            &cancel,
            "define attribute email, value string; entity person, owns email @key; entity legacy;",
        )
        .await
        .unwrap();

        let diff = migrate(&cancel, &db, &social()).await.unwrap();
        assert_eq!(diff.add_attributes, vec![AttributeSpec::new("name", ValueType::String)]);
        assert_eq!(diff.remove_types, vec!["legacy".to_string()]);

        let model = store.schema_of("db").unwrap();
        assert!(model.entities["person"].find_owns("name").is_some());
        assert!(model.entities.contains_key("legacy"));
    }

    #[tokio::test]
    async fn test_failed_migration_records_nothing() {
        let store = MemoryStore::new().with_database("db");
        let db = Database::new(store.connect(), "db");
        let cancel = CancellationToken::new();
        store.fail_statements_containing("relation friendship");

        let failure = migrate(&cancel, &db, &social()).await.unwrap_err();
        assert!(failure.diff.is_some());
        assert_eq!(ledger_size(&store), 0);

        store.clear_failures();
        migrate(&cancel, &db, &social()).await.unwrap();
        assert_eq!(ledger_size(&store), 1);
        assert!(store.schema_of("db").unwrap().relations.contains_key("friendship"));
    }

    #[tokio::test]
    async fn test_driver_error_names_failing_statement() {
        let store = MemoryStore::new().with_database("db");
        let connection = RejectingConnection {
            inner: store.connect(),
            pattern: "relation friendship",
        };
        let db = Database::new(connection, "db");
        let cancel = CancellationToken::new();

        let failure = migrate(&cancel, &db, &social()).await.unwrap_err();
        match &failure.error {
            GraftError::Statement { statement, message } => {
                assert!(statement.contains("relation friendship"));
                assert_eq!(message, "Database error: type conflict");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(failure.to_string().contains("relation friendship"));
        assert_eq!(ledger_size(&store), 0);
    }

    #[tokio::test]
    async fn test_dropped_ownership_is_left_in_place() {
        let store = MemoryStore::new().with_database("db");
        let db = Database::new(store.connect(), "db");
        let cancel = CancellationToken::new();
        migrate(&cancel, &db, &social()).await.unwrap();
        db.execute_schema(&cancel, "define attribute nickname, value string; person owns nickname;")
            .await
            .unwrap();

        let diff = migrate(&cancel, &db, &social()).await.unwrap();
        assert!(!diff.has_additions());
        assert!(diff.has_breaking_changes());
        assert_eq!(diff.remove_owns[0].label(), "person.nickname");
        assert!(store.schema_of("db").unwrap().entities["person"]
            .find_owns("nickname")
            .is_some());
    }

    #[tokio::test]
    async fn test_applied_hash_is_skipped() {
        let store = MemoryStore::new().with_database("db");
        let db = Database::new(store.connect(), "db");
        let cancel = CancellationToken::new();
        let registry = social();
        migrate(&cancel, &db, &registry).await.unwrap();
        let executed = store.executed_statements().len();

        let diff = migrate_from_schema(&cancel, &db, &registry, "").await.unwrap();
        assert!(diff.has_additions());

        let new_statements = &store.executed_statements()[executed..];
        assert!(new_statements.iter().all(|s| !s.starts_with("define entity person")));
        assert_eq!(ledger_size(&store), 1);
    }

    #[tokio::test]
    async fn test_migrate_untracked_skips_ledger() {
        let store = MemoryStore::new().with_database("db");
        let db = Database::new(store.connect(), "db");
        let cancel = CancellationToken::new();

        migrate_untracked(&cancel, &db, &social()).await.unwrap();
        let model = store.schema_of("db").unwrap();
        assert!(model.entities.contains_key("person"));
        assert!(!model.entities.contains_key("migration-record"));
    }

    #[tokio::test]
    async fn test_invalid_current_schema() {
        let store = MemoryStore::new().with_database("db");
        let db = Database::new(store.connect(), "db");
        let cancel = CancellationToken::new();

        let failure = migrate_from_schema(&cancel, &db, &SchemaModel::new(), "define entity")
            .await
            .unwrap_err();
        assert!(failure.diff.is_none());
    }
}
