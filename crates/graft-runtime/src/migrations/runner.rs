//! Sequential migration runner.
//!
//! Named migrations are applied in name order and recorded in the sequential
//! ledger. Recorded checksums guard against edits to migrations that already
//! ran. The runner takes no lock of its own: callers running it from several
//! processes against one database must serialize those runs themselves.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use graft_core::config::MigrationsConfig;
use graft_core::error::{GraftError, MigrationPhase, Result, ValidationIssue};
use graft_core::store::TransactionKind;

use super::ledger::{statements_checksum, AppliedMigration, SequentialLedger};
use super::observer::{MigrationEvent, MigrationObserver, TracingObserver};
use crate::db::Database;

/// Forward or reverse action of a migration.
pub type MigrationAction =
    Arc<dyn Fn(Database, CancellationToken) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Raw statements behind a migration, kept for checksums and dry runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationStatements {
    pub up: Vec<String>,
    pub down: Vec<String>,
}

/// A single named migration.
#[derive(Clone)]
pub struct SequentialMigration {
    name: String,
    up: Option<MigrationAction>,
    down: Option<MigrationAction>,
    statements: Option<MigrationStatements>,
}

impl SequentialMigration {
    /// A migration running `up` when applied.
    pub fn new<F, Fut>(name: impl Into<String>, up: F) -> Self
    where
        F: Fn(Database, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self::named(name).with_up(up)
    }

    /// A migration with no actions yet.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            up: None,
            down: None,
            statements: None,
        }
    }

    /// A migration made of raw statements. Each statement runs in its own
    /// transaction: a schema transaction for `define`, `undefine` and
    /// `redefine`, a write transaction for everything else.
    pub fn typeql<U, D>(name: impl Into<String>, up: U, down: D) -> Self
    where
        U: IntoIterator,
        U::Item: Into<String>,
        D: IntoIterator,
        D::Item: Into<String>,
    {
        let up: Vec<String> = up.into_iter().map(Into::into).collect();
        let down: Vec<String> = down.into_iter().map(Into::into).collect();

        let mut migration = Self::named(name);
        if !up.is_empty() {
            migration.up = Some(statement_action(up.clone()));
        }
        if !down.is_empty() {
            migration.down = Some(statement_action(down.clone()));
        }
        if !up.is_empty() || !down.is_empty() {
            migration.statements = Some(MigrationStatements { up, down });
        }
        migration
    }

    pub fn with_up<F, Fut>(mut self, up: F) -> Self
    where
        F: Fn(Database, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.up = Some(action(up));
        self
    }

    pub fn with_down<F, Fut>(mut self, down: F) -> Self
    where
        F: Fn(Database, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.down = Some(action(down));
        self
    }

    /// Attach the statements a custom action runs, so the migration gets a
    /// checksum and shows up in dry runs.
    pub fn with_statements(mut self, statements: MigrationStatements) -> Self {
        self.statements = Some(statements);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_up(&self) -> bool {
        self.up.is_some()
    }

    pub fn has_down(&self) -> bool {
        self.down.is_some()
    }

    pub fn statements(&self) -> Option<&MigrationStatements> {
        self.statements.as_ref()
    }

    /// Checksum of the raw statements; `None` for migrations without any.
    pub fn checksum(&self) -> Option<String> {
        self.statements
            .as_ref()
            .map(|s| statements_checksum(&s.up, &s.down))
    }

    async fn apply(&self, db: &Database, cancel: &CancellationToken) -> Result<()> {
        match &self.up {
            Some(up) => up(db.clone(), cancel.clone()).await,
            None => Err(GraftError::InvalidArgument(format!(
                "migration {} has no up action",
                self.name
            ))),
        }
    }

    async fn revert(&self, db: &Database, cancel: &CancellationToken) -> Result<()> {
        match &self.down {
            Some(down) => down(db.clone(), cancel.clone()).await,
            None => Err(GraftError::InvalidArgument(format!(
                "migration {} has no down action",
                self.name
            ))),
        }
    }
}

impl fmt::Debug for SequentialMigration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequentialMigration")
            .field("name", &self.name)
            .field("has_up", &self.has_up())
            .field("has_down", &self.has_down())
            .field("statements", &self.statements)
            .finish()
    }
}

fn action<F, Fut>(f: F) -> MigrationAction
where
    F: Fn(Database, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |db, cancel| f(db, cancel).boxed())
}

fn statement_action(statements: Vec<String>) -> MigrationAction {
    let statements = Arc::new(statements);
    action(move |db: Database, cancel: CancellationToken| {
        let statements = statements.clone();
        async move {
            for statement in statements.iter() {
                execute_statement(&db, &cancel, statement).await?;
            }
            Ok(())
        }
    })
}

/// Run one statement in the transaction kind it needs.
pub async fn execute_statement(
    db: &Database,
    cancel: &CancellationToken,
    statement: &str,
) -> Result<()> {
    let result = match TransactionKind::for_statement(statement) {
        TransactionKind::Schema => db.execute_schema(cancel, statement).await,
        _ => db.execute_write(cancel, statement).await.map(|_| ()),
    };
    result.map_err(|e| e.in_statement(statement))
}

/// Options for [`MigrationRunner::run`] and [`MigrationRunner::stamp`].
#[derive(Clone, Default)]
pub struct RunOptions {
    /// Report what would happen without touching the database.
    pub dry_run: bool,
    /// Stop after this migration.
    pub target: Option<String>,
    /// Overrides the runner's observer for this call.
    pub observer: Option<Arc<dyn MigrationObserver>>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn target(mut self, name: impl Into<String>) -> Self {
        self.target = Some(name.into());
        self
    }

    pub fn observer(mut self, observer: impl MigrationObserver + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }
}

impl fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("dry_run", &self.dry_run)
            .field("target", &self.target)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

/// A run, stamp or rollback that stopped part way.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct PartialFailure {
    /// Migrations completed before the failure.
    pub completed: Vec<String>,
    #[source]
    pub error: GraftError,
}

impl PartialFailure {
    pub fn new(completed: Vec<String>, error: GraftError) -> Self {
        Self { completed, error }
    }
}

impl From<GraftError> for PartialFailure {
    fn from(error: GraftError) -> Self {
        Self::new(Vec::new(), error)
    }
}

/// State of one migration as seen by the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    pub name: String,
    pub applied: bool,
    pub applied_at: Option<DateTime<Utc>>,
    pub has_down: bool,
}

/// Applies, stamps, inspects and rolls back sequential migrations.
pub struct MigrationRunner {
    db: Database,
    ledger: SequentialLedger,
    verify_checksums: bool,
    observer: Arc<dyn MigrationObserver>,
}

impl MigrationRunner {
    pub fn new(db: Database) -> Self {
        Self {
            ledger: SequentialLedger::new(db.clone()),
            db,
            verify_checksums: true,
            observer: Arc::new(TracingObserver),
        }
    }

    /// Runner configured from the `[migrations]` section.
    pub fn from_config(db: Database, config: &MigrationsConfig) -> Self {
        Self::new(db).verify_checksums(config.verify_checksums)
    }

    /// Turn checksum verification of applied migrations on or off.
    pub fn verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    pub fn with_observer(mut self, observer: impl MigrationObserver + 'static) -> Self {
        self.observer = Arc::new(observer);
        self
    }

    /// Structural problems with a migration list. Touches nothing.
    pub fn validate(migrations: &[SequentialMigration]) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        let mut seen = HashSet::new();

        for (index, migration) in migrations.iter().enumerate() {
            if migration.name.is_empty() {
                issues.push(ValidationIssue::error(
                    format!("[index {}]", index),
                    "migration name is empty",
                ));
                continue;
            }
            if !seen.insert(migration.name.as_str()) {
                issues.push(ValidationIssue::error(
                    &migration.name,
                    "duplicate migration name",
                ));
            }
            if !migration.has_up() {
                issues.push(ValidationIssue::error(&migration.name, "up action is missing"));
            }
        }

        let sorted = migrations.windows(2).all(|w| w[0].name <= w[1].name);
        if !sorted {
            issues.push(ValidationIssue::warning(
                "",
                "migrations are not in sorted order; they will be sorted automatically",
            ));
        }

        issues
    }

    /// Apply pending migrations in name order. Returns the names applied, or
    /// in a dry run the names that would be.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        migrations: &[SequentialMigration],
        options: &RunOptions,
    ) -> std::result::Result<Vec<String>, PartialFailure> {
        let observer = self.observer_for(options);
        let pending = self
            .pending(cancel, migrations, options, self.verify_checksums)
            .await?;
        let names: Vec<String> = pending.iter().map(|m| m.name.clone()).collect();
        observer.on_event(&MigrationEvent::Pending {
            names: names.clone(),
        });

        if options.dry_run {
            publish_dry_run(observer.as_ref(), &pending);
            return Ok(names);
        }

        let mut applied = Vec::with_capacity(pending.len());
        for migration in pending {
            let name = migration.name.clone();
            if cancel.is_cancelled() {
                return Err(PartialFailure::new(applied, GraftError::Cancelled));
            }

            observer.on_event(&MigrationEvent::Applying { name: name.clone() });
            if let Err(e) = migration.apply(&self.db, cancel).await {
                let error = GraftError::migration(&name, MigrationPhase::Up, e);
                observer.on_event(&MigrationEvent::Failed {
                    name,
                    error: error.to_string(),
                });
                return Err(PartialFailure::new(applied, error));
            }

            let checksum = migration.checksum();
            if let Err(e) = self.ledger.record(cancel, &name, checksum.as_deref()).await {
                let error = GraftError::migration(&name, MigrationPhase::Record, e);
                observer.on_event(&MigrationEvent::Failed {
                    name,
                    error: error.to_string(),
                });
                return Err(PartialFailure::new(applied, error));
            }

            observer.on_event(&MigrationEvent::Applied { name: name.clone() });
            applied.push(name);
        }

        info!(count = applied.len(), "Sequential migrations complete");
        Ok(applied)
    }

    /// Record pending migrations as applied without running them.
    pub async fn stamp(
        &self,
        cancel: &CancellationToken,
        migrations: &[SequentialMigration],
        options: &RunOptions,
    ) -> std::result::Result<Vec<String>, PartialFailure> {
        let observer = self.observer_for(options);
        let pending = self.pending(cancel, migrations, options, false).await?;
        let names: Vec<String> = pending.iter().map(|m| m.name.clone()).collect();
        observer.on_event(&MigrationEvent::Pending {
            names: names.clone(),
        });

        if options.dry_run {
            publish_dry_run(observer.as_ref(), &pending);
            return Ok(names);
        }

        let mut stamped = Vec::with_capacity(pending.len());
        for migration in pending {
            let name = migration.name.clone();
            let checksum = migration.checksum();
            if let Err(e) = self.ledger.record(cancel, &name, checksum.as_deref()).await {
                let error = GraftError::migration(&name, MigrationPhase::Record, e);
                observer.on_event(&MigrationEvent::Failed {
                    name,
                    error: error.to_string(),
                });
                return Err(PartialFailure::new(stamped, error));
            }
            observer.on_event(&MigrationEvent::Stamped { name: name.clone() });
            stamped.push(name);
        }
        Ok(stamped)
    }

    /// Applied state of every given migration, in name order.
    pub async fn status(
        &self,
        cancel: &CancellationToken,
        migrations: &[SequentialMigration],
    ) -> Result<Vec<MigrationStatus>> {
        let applied = self.read_ledger(cancel).await?;
        Ok(sorted(migrations)
            .into_iter()
            .map(|m| {
                let record = applied.get(&m.name);
                MigrationStatus {
                    name: m.name.clone(),
                    applied: record.is_some(),
                    applied_at: record.and_then(|r| r.applied_at),
                    has_down: m.has_down(),
                }
            })
            .collect())
    }

    /// Undo the `steps` most recently applied migrations, latest name first.
    pub async fn rollback(
        &self,
        cancel: &CancellationToken,
        migrations: &[SequentialMigration],
        steps: usize,
    ) -> std::result::Result<Vec<String>, PartialFailure> {
        if steps == 0 {
            return Ok(Vec::new());
        }

        let applied = self.read_ledger(cancel).await?;
        let by_name: HashMap<&str, &SequentialMigration> =
            migrations.iter().map(|m| (m.name.as_str(), m)).collect();

        let mut rolled_back = Vec::new();
        for name in applied.keys().rev().take(steps) {
            if cancel.is_cancelled() {
                return Err(PartialFailure::new(rolled_back, GraftError::Cancelled));
            }

            let Some(migration) = by_name.get(name.as_str()) else {
                return Err(PartialFailure::new(
                    rolled_back,
                    GraftError::InvalidArgument(format!(
                        "migration {} is applied but was not provided",
                        name
                    )),
                ));
            };
            if !migration.has_down() {
                return Err(PartialFailure::new(
                    rolled_back,
                    GraftError::InvalidArgument(format!("migration {} has no down action", name)),
                ));
            }

            self.observer.on_event(&MigrationEvent::RollingBack { name: name.clone() });
            if let Err(e) = migration.revert(&self.db, cancel).await {
                let error = GraftError::migration(name, MigrationPhase::Down, e);
                self.observer.on_event(&MigrationEvent::Failed {
                    name: name.clone(),
                    error: error.to_string(),
                });
                return Err(PartialFailure::new(rolled_back, error));
            }
            if let Err(e) = self.ledger.delete(cancel, name).await {
                let error = GraftError::migration(name, MigrationPhase::Delete, e);
                self.observer.on_event(&MigrationEvent::Failed {
                    name: name.clone(),
                    error: error.to_string(),
                });
                return Err(PartialFailure::new(rolled_back, error));
            }

            self.observer.on_event(&MigrationEvent::RolledBack { name: name.clone() });
            rolled_back.push(name.clone());
        }
        Ok(rolled_back)
    }

    fn observer_for(&self, options: &RunOptions) -> Arc<dyn MigrationObserver> {
        options
            .observer
            .clone()
            .unwrap_or_else(|| self.observer.clone())
    }

    /// Validate, sort, load the ledger, verify checksums and select what is pending.
    async fn pending<'m>(
        &self,
        cancel: &CancellationToken,
        migrations: &'m [SequentialMigration],
        options: &RunOptions,
        verify_checksums: bool,
    ) -> Result<Vec<&'m SequentialMigration>> {
        let issues = Self::validate(migrations);
        let (errors, warnings): (Vec<_>, Vec<_>) =
            issues.into_iter().partition(ValidationIssue::is_error);
        for issue in &warnings {
            warn!("{}", issue.message);
        }
        if !errors.is_empty() {
            return Err(GraftError::Validation(errors));
        }

        let sorted = sorted(migrations);
        if let Some(target) = options.target.as_deref() {
            if !sorted.iter().any(|m| m.name == target) {
                return Err(GraftError::Validation(vec![ValidationIssue::error(
                    target,
                    "target migration not found",
                )]));
            }
        }

        let applied = if options.dry_run {
            self.read_ledger(cancel).await?
        } else {
            self.ledger.ensure_schema(cancel).await?;
            self.ledger.applied(cancel).await?
        };
        debug!(applied = applied.len(), "Loaded migration ledger");

        if verify_checksums {
            verify(&sorted, &applied)?;
        }

        let mut pending = Vec::new();
        for migration in sorted {
            if !applied.contains_key(&migration.name) {
                pending.push(migration);
            }
            if options.target.as_deref() == Some(migration.name.as_str()) {
                break;
            }
        }
        Ok(pending)
    }

    /// Ledger contents without creating the ledger types when they are missing.
    async fn read_ledger(
        &self,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, AppliedMigration>> {
        if self.ledger.is_initialized(cancel).await? {
            self.ledger.applied(cancel).await
        } else {
            Ok(BTreeMap::new())
        }
    }
}

fn sorted(migrations: &[SequentialMigration]) -> Vec<&SequentialMigration> {
    let mut sorted: Vec<&SequentialMigration> = migrations.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    sorted
}

fn verify(
    migrations: &[&SequentialMigration],
    applied: &BTreeMap<String, AppliedMigration>,
) -> Result<()> {
    for migration in migrations {
        let Some(expected) = applied
            .get(&migration.name)
            .and_then(|r| r.checksum.as_deref())
        else {
            continue;
        };
        if let Some(actual) = migration.checksum() {
            if actual != expected {
                return Err(GraftError::ChecksumMismatch {
                    name: migration.name.clone(),
                    expected: expected.to_string(),
                    actual,
                });
            }
        }
    }
    Ok(())
}

fn publish_dry_run(observer: &dyn MigrationObserver, pending: &[&SequentialMigration]) {
    for migration in pending {
        if let Some(statements) = &migration.statements {
            for statement in &statements.up {
                observer.on_event(&MigrationEvent::DryRunStatement {
                    name: migration.name.clone(),
                    statement: statement.clone(),
                });
            }
        }
    }
}
