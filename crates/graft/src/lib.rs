//! graft - schema evolution and pooled access for TypeQL stores.
//!
//! Provides:
//! - Structural schema diffing with additive migration generation
//! - A hash-keyed ledger for one-shot migrations
//! - Named sequential migrations with checksums, targets, dry runs and rollback
//! - A bounded async connection pool

#[doc(hidden)]
pub use graft_core;
#[doc(hidden)]
pub use graft_runtime;

// Re-export testing assertion macros at crate root when testing feature is enabled.
#[cfg(feature = "testing")]
pub use graft_core::{assert_err_variant, assert_ok};

/// Prelude module for common imports.
pub mod prelude {
    pub use chrono::{DateTime, Utc};
    pub use tokio_util::sync::CancellationToken;

    pub use graft_core::config::{DatabaseConfig, GraftConfig, PoolConfig};
    pub use graft_core::error::{GraftError, PoolError, Result};
    pub use graft_core::schema::{
        AttributeSpec, Cardinality, EntitySpec, OwnsSpec, RelationSpec, RoleSpec, SchemaModel,
        SchemaProvider, SchemaRegistry, ValueType,
    };
    pub use graft_core::store::{Connection, Row, TransactionKind, Value};

    pub use graft_runtime::db::{Database, Pool, PoolStats};
    pub use graft_runtime::migrations::{
        load_migrations_from_dir, migrate, MigrateFailure, MigrationEvent, MigrationObserver,
        MigrationRunner, PartialFailure, RunOptions, SchemaDiff, SequentialMigration,
    };
}
