use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{GraftError, Result};

use super::model::{AttributeSpec, EntitySpec, RelationSpec, SchemaModel, TypeKind};
use super::{is_ledger_type, SchemaProvider};

/// Words that cannot be used as type labels.
const RESERVED_WORDS: &[&str] = &[
    "abstract", "as", "attribute", "count", "define", "delete", "entity", "fetch", "from",
    "has", "insert", "isa", "label", "match", "owns", "plays", "put", "redefine", "reduce",
    "relates", "relation", "sub", "thing", "undefine", "update", "value",
];

/// Registry of the desired schema, built explicitly by the application.
///
/// Every type is checked when it is registered (label syntax, reserved words,
/// duplicate labels across kinds). References between types are checked when
/// the schema is read back through [`SchemaProvider::desired_schema`], so
/// registration order does not matter.
pub struct SchemaRegistry {
    model: RwLock<SchemaModel>,
}

impl SchemaRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            model: RwLock::new(SchemaModel::new()),
        }
    }

    /// Register an attribute type.
    pub fn register_attribute(&self, attribute: AttributeSpec) -> Result<()> {
        let mut model = self.write();
        check_label(&model, &attribute.name)?;
        model.attributes.insert(attribute.name.clone(), attribute);
        Ok(())
    }

    /// Register an entity type.
    pub fn register_entity(&self, entity: EntitySpec) -> Result<()> {
        let mut model = self.write();
        check_label(&model, &entity.name)?;
        check_unique_clauses(&entity.name, entity.owns.iter().map(|o| o.attribute.as_str()))?;
        model.entities.insert(entity.name.clone(), entity);
        Ok(())
    }

    /// Register a relation type.
    pub fn register_relation(&self, relation: RelationSpec) -> Result<()> {
        let mut model = self.write();
        check_label(&model, &relation.name)?;
        check_unique_clauses(&relation.name, relation.owns.iter().map(|o| o.attribute.as_str()))?;
        check_unique_clauses(&relation.name, relation.relates.iter().map(|r| r.role.as_str()))?;
        if relation.relates.is_empty() && relation.parent.is_none() {
            return Err(GraftError::Schema(format!(
                "relation {} must relate at least one role",
                relation.name
            )));
        }
        model.relations.insert(relation.name.clone(), relation);
        Ok(())
    }

    /// Whether a label has been registered under any kind.
    pub fn contains(&self, name: &str) -> bool {
        self.read().kind_of(name).is_some()
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        let model = self.read();
        model.attributes.len() + model.entities.len() + model.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear all registrations.
    pub fn clear(&self) {
        *self.write() = SchemaModel::new();
    }

    fn read(&self) -> RwLockReadGuard<'_, SchemaModel> {
        self.model.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SchemaModel> {
        self.model.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaProvider for SchemaRegistry {
    fn desired_schema(&self) -> Result<SchemaModel> {
        let model = self.read().clone();
        let errors = model.reference_errors();
        if errors.is_empty() {
            Ok(model)
        } else {
            Err(GraftError::Schema(errors.join("; ")))
        }
    }
}

fn check_label(model: &SchemaModel, name: &str) -> Result<()> {
    if !is_valid_label(name) {
        return Err(GraftError::Schema(format!("invalid type label `{}`", name)));
    }
    if RESERVED_WORDS.contains(&name) {
        return Err(GraftError::Schema(format!("`{}` is a reserved word", name)));
    }
    if is_ledger_type(name) {
        return Err(GraftError::Schema(format!(
            "`{}` is reserved for migration bookkeeping",
            name
        )));
    }
    if let Some(kind) = model.kind_of(name) {
        return Err(GraftError::Schema(format!(
            "{} is already registered as {}",
            name,
            describe(kind)
        )));
    }
    Ok(())
}

fn describe(kind: TypeKind) -> &'static str {
    match kind {
        TypeKind::Attribute => "an attribute",
        TypeKind::Entity => "an entity",
        TypeKind::Relation => "a relation",
    }
}

fn check_unique_clauses<'a>(owner: &str, labels: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for label in labels {
        if !seen.insert(label) {
            return Err(GraftError::Schema(format!(
                "{} declares {} more than once",
                owner, label
            )));
        }
    }
    Ok(())
}

fn is_valid_label(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{OwnsSpec, RoleSpec, ValueType};

    #[test]
    fn test_register_and_read_back() {
        let registry = SchemaRegistry::new();
        registry
            .register_entity(EntitySpec::new("person").owns(OwnsSpec::key("email")))
            .unwrap();
        registry
            .register_attribute(AttributeSpec::new("email", ValueType::String))
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("person"));

        let model = registry.desired_schema().unwrap();
        assert!(model.entities["person"].find_owns("email").unwrap().key);
    }

    #[test]
    fn test_duplicate_label_across_kinds() {
        let registry = SchemaRegistry::new();
        registry
            .register_attribute(AttributeSpec::new("name", ValueType::String))
            .unwrap();
        let err = registry.register_entity(EntitySpec::new("name")).unwrap_err();
        assert!(err.to_string().contains("already registered as an attribute"));
    }

    #[test]
    fn test_reserved_and_invalid_labels() {
        let registry = SchemaRegistry::new();
        assert!(registry.register_entity(EntitySpec::new("match")).is_err());
        assert!(registry.register_entity(EntitySpec::new("9lives")).is_err());
        assert!(registry.register_entity(EntitySpec::new("has space")).is_err());
        assert!(registry.register_entity(EntitySpec::new("migration-record")).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_owns_rejected() {
        let registry = SchemaRegistry::new();
        let err = registry
            .register_entity(
                EntitySpec::new("person")
                    .owns(OwnsSpec::new("email"))
                    .owns(OwnsSpec::key("email")),
            )
            .unwrap_err();
        assert!(err.to_string().contains("declares email more than once"));
    }

    #[test]
    fn test_relation_needs_a_role() {
        let registry = SchemaRegistry::new();
        assert!(registry.register_relation(RelationSpec::new("friendship")).is_err());
        registry
            .register_relation(RelationSpec::new("friendship").relates(RoleSpec::new("friend")))
            .unwrap();
    }

    #[test]
    fn test_dangling_reference_fails_on_read() {
        let registry = SchemaRegistry::new();
        registry
            .register_entity(EntitySpec::new("person").owns(OwnsSpec::new("email")))
            .unwrap();
        let err = registry.desired_schema().unwrap_err();
        assert!(err.to_string().contains("owns undefined attribute email"));
    }

    #[test]
    fn test_clear() {
        let registry = SchemaRegistry::new();
        registry.register_entity(EntitySpec::new("person")).unwrap();
        registry.clear();
        assert!(registry.is_empty());
    }
}
