mod builtin;
mod diff;
mod generator;
mod ledger;
mod loader;
mod migrate;
mod observer;
mod runner;

pub use builtin::{HASH_LEDGER_SCHEMA, SEQUENTIAL_LEDGER_SCHEMA};
pub use diff::{BreakingChange, ClauseChange, SchemaDiff};
pub use generator::Operation;
pub use ledger::{
    hash_statements, statements_checksum, AppliedMigration, MigrationLedger, MigrationRecord,
    SequentialLedger,
};
pub use loader::{load_migrations_from_dir, parse_migration, split_statements};
pub use migrate::{diff_against, migrate, migrate_from_schema, migrate_untracked, MigrateFailure};
pub use observer::{ChannelObserver, MigrationEvent, MigrationObserver, TracingObserver};
pub use runner::{
    execute_statement, MigrationAction, MigrationRunner, MigrationStatements, MigrationStatus,
    PartialFailure, RunOptions, SequentialMigration,
};
