pub mod db;
pub mod migrations;

pub use db::{Database, DbTransaction, Pool, PoolStats, PooledConnection};
pub use migrations::{
    load_migrations_from_dir, migrate, MigrateFailure, MigrationEvent, MigrationObserver,
    MigrationRunner, PartialFailure, RunOptions, SchemaDiff, SequentialMigration,
};
