mod model;
mod parser;
mod registry;

pub use model::{
    AttributeSpec, Cardinality, EntitySpec, OwnsSpec, PlaysSpec, RelationSpec, RoleSpec,
    SchemaModel, TypeKind, ValueType,
};
pub use parser::{apply_definition, parse_definitions, parse_schema, Clause, Definition};
pub use registry::SchemaRegistry;

use crate::error::Result;

/// Types owned by the migration ledgers. They live in the same database as
/// the application schema but never take part in a schema diff.
pub const LEDGER_TYPES: &[&str] = &[
    "migration-record",
    "migration-hash",
    "migration-summary",
    "migration-applied-at",
    "seq-migration-record",
    "seq-migration-name",
    "seq-migration-applied-at",
    "seq-migration-checksum",
];

pub fn is_ledger_type(name: &str) -> bool {
    LEDGER_TYPES.contains(&name)
}

/// Source of the schema the application wants the store to have.
pub trait SchemaProvider: Send + Sync {
    fn desired_schema(&self) -> Result<SchemaModel>;
}

impl SchemaProvider for SchemaModel {
    fn desired_schema(&self) -> Result<SchemaModel> {
        Ok(self.clone())
    }
}

/// Turns schema text reported by the store into a [`SchemaModel`].
pub trait SchemaIntrospector: Send + Sync {
    fn introspect(&self, schema_text: &str) -> Result<SchemaModel>;
}

/// Introspector for TypeQL `define` blocks.
#[derive(Debug, Clone, Copy, Default)]
pub struct TypeqlIntrospector;

impl SchemaIntrospector for TypeqlIntrospector {
    fn introspect(&self, schema_text: &str) -> Result<SchemaModel> {
        parse_schema(schema_text)
    }
}
