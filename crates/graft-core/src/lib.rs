pub mod config;
pub mod error;
pub mod schema;
pub mod store;

#[cfg(feature = "testing")]
pub mod testing;

pub use config::GraftConfig;
pub use error::{GraftError, MigrationPhase, PoolError, Result, Severity, ValidationIssue};
pub use schema::{
    AttributeSpec, Cardinality, EntitySpec, OwnsSpec, PlaysSpec, RelationSpec, RoleSpec,
    SchemaIntrospector, SchemaModel, SchemaProvider, SchemaRegistry, TypeqlIntrospector,
    ValueType,
};
pub use store::{Connection, Row, Transaction, TransactionKind, Value};
