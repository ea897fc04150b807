//! Value representation of a graph schema.
//!
//! A [`SchemaModel`] is an immutable snapshot: the differ compares two of them,
//! the introspector builds one from store schema text and the registry builds
//! one from declared specs. Maps are keyed by type name so every traversal is
//! deterministic.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Value type of an attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueType {
    String,
    Integer,
    Double,
    Boolean,
    Datetime,
    /// A value type the store reports that is carried through verbatim.
    Other(String),
}

impl ValueType {
    pub fn parse(s: &str) -> Self {
        match s {
            "string" => ValueType::String,
            "integer" | "long" => ValueType::Integer,
            "double" => ValueType::Double,
            "boolean" => ValueType::Boolean,
            "datetime" => ValueType::Datetime,
            other => ValueType::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ValueType::String => "string",
            ValueType::Integer => "integer",
            ValueType::Double => "double",
            ValueType::Boolean => "boolean",
            ValueType::Datetime => "datetime",
            ValueType::Other(s) => s,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cardinality bound written as `@card(min..max)`; an open upper bound is `min..`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cardinality {
    pub min: u32,
    pub max: Option<u32>,
}

impl Cardinality {
    pub fn new(min: u32, max: Option<u32>) -> Self {
        Self { min, max }
    }

    /// Parse `1..3`, `0..` or the exact form `1`.
    pub fn parse(range: &str) -> Option<Self> {
        match range.split_once("..") {
            Some((min, "")) => Some(Self::new(min.parse().ok()?, None)),
            Some((min, max)) => Some(Self::new(min.parse().ok()?, Some(max.parse().ok()?))),
            None => {
                let exact = range.parse().ok()?;
                Some(Self::new(exact, Some(exact)))
            }
        }
    }
}

impl fmt::Display for Cardinality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max {
            Some(max) => write!(f, "{}..{}", self.min, max),
            None => write!(f, "{}..", self.min),
        }
    }
}

/// An attribute type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeSpec {
    pub name: String,
    pub value_type: ValueType,
}

impl AttributeSpec {
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
        }
    }

    /// Render as a definition, without the leading `define`.
    pub fn to_definition(&self) -> String {
        format!("attribute {}, value {};", self.name, self.value_type)
    }
}

/// An `owns` clause with its annotations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnsSpec {
    pub attribute: String,
    pub key: bool,
    pub unique: bool,
    pub card: Option<Cardinality>,
}

impl OwnsSpec {
    pub fn new(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            key: false,
            unique: false,
            card: None,
        }
    }

    /// Owned attribute marked `@key`.
    pub fn key(attribute: impl Into<String>) -> Self {
        Self {
            key: true,
            ..Self::new(attribute)
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn card(mut self, card: Cardinality) -> Self {
        self.card = Some(card);
        self
    }

    pub fn to_clause(&self) -> String {
        let mut clause = format!("owns {}", self.attribute);
        if self.key {
            clause.push_str(" @key");
        }
        if self.unique {
            clause.push_str(" @unique");
        }
        if let Some(card) = self.card {
            clause.push_str(&format!(" @card({})", card));
        }
        clause
    }
}

/// A `plays relation:role` clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaysSpec {
    pub relation: String,
    pub role: String,
}

impl PlaysSpec {
    pub fn new(relation: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            relation: relation.into(),
            role: role.into(),
        }
    }

    pub fn scoped_role(&self) -> String {
        format!("{}:{}", self.relation, self.role)
    }

    pub fn to_clause(&self) -> String {
        format!("plays {}", self.scoped_role())
    }
}

/// A `relates role` clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleSpec {
    pub role: String,
    /// Parent role this one specializes (`relates employee as member`).
    pub specializes: Option<String>,
    pub card: Option<Cardinality>,
}

impl RoleSpec {
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            specializes: None,
            card: None,
        }
    }

    pub fn specializes(mut self, parent_role: impl Into<String>) -> Self {
        self.specializes = Some(parent_role.into());
        self
    }

    pub fn card(mut self, card: Cardinality) -> Self {
        self.card = Some(card);
        self
    }

    pub fn to_clause(&self) -> String {
        let mut clause = format!("relates {}", self.role);
        if let Some(parent) = &self.specializes {
            clause.push_str(" as ");
            clause.push_str(parent);
        }
        if let Some(card) = self.card {
            clause.push_str(&format!(" @card({})", card));
        }
        clause
    }
}

/// An entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySpec {
    pub name: String,
    pub parent: Option<String>,
    pub is_abstract: bool,
    pub owns: Vec<OwnsSpec>,
    pub plays: Vec<PlaysSpec>,
}

impl EntitySpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            is_abstract: false,
            owns: Vec::new(),
            plays: Vec::new(),
        }
    }

    pub fn sub(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn abstract_type(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    pub fn owns(mut self, owns: OwnsSpec) -> Self {
        self.owns.push(owns);
        self
    }

    pub fn plays(mut self, relation: impl Into<String>, role: impl Into<String>) -> Self {
        self.plays.push(PlaysSpec::new(relation, role));
        self
    }

    pub fn find_owns(&self, attribute: &str) -> Option<&OwnsSpec> {
        self.owns.iter().find(|o| o.attribute == attribute)
    }

    pub fn has_plays(&self, plays: &PlaysSpec) -> bool {
        self.plays.contains(plays)
    }

    /// Render as a definition. `plays` clauses are left out when `with_plays` is false.
    pub fn to_definition(&self, with_plays: bool) -> String {
        let mut clauses: Vec<String> = self.owns.iter().map(OwnsSpec::to_clause).collect();
        if with_plays {
            clauses.extend(self.plays.iter().map(PlaysSpec::to_clause));
        }
        render_definition(
            "entity",
            &self.name,
            self.parent.as_deref(),
            self.is_abstract,
            &clauses,
        )
    }
}

/// A relation type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationSpec {
    pub name: String,
    pub parent: Option<String>,
    pub is_abstract: bool,
    pub relates: Vec<RoleSpec>,
    pub owns: Vec<OwnsSpec>,
    pub plays: Vec<PlaysSpec>,
}

impl RelationSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            is_abstract: false,
            relates: Vec::new(),
            owns: Vec::new(),
            plays: Vec::new(),
        }
    }

    pub fn sub(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn abstract_type(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    pub fn relates(mut self, role: RoleSpec) -> Self {
        self.relates.push(role);
        self
    }

    pub fn owns(mut self, owns: OwnsSpec) -> Self {
        self.owns.push(owns);
        self
    }

    pub fn plays(mut self, relation: impl Into<String>, role: impl Into<String>) -> Self {
        self.plays.push(PlaysSpec::new(relation, role));
        self
    }

    pub fn find_role(&self, role: &str) -> Option<&RoleSpec> {
        self.relates.iter().find(|r| r.role == role)
    }

    pub fn find_owns(&self, attribute: &str) -> Option<&OwnsSpec> {
        self.owns.iter().find(|o| o.attribute == attribute)
    }

    pub fn has_plays(&self, plays: &PlaysSpec) -> bool {
        self.plays.contains(plays)
    }

    /// Render as a definition. `plays` clauses are left out when `with_plays` is false.
    pub fn to_definition(&self, with_plays: bool) -> String {
        let mut clauses: Vec<String> = self.relates.iter().map(RoleSpec::to_clause).collect();
        clauses.extend(self.owns.iter().map(OwnsSpec::to_clause));
        if with_plays {
            clauses.extend(self.plays.iter().map(PlaysSpec::to_clause));
        }
        render_definition(
            "relation",
            &self.name,
            self.parent.as_deref(),
            self.is_abstract,
            &clauses,
        )
    }
}

fn render_definition(
    kind: &str,
    name: &str,
    parent: Option<&str>,
    is_abstract: bool,
    clauses: &[String],
) -> String {
    let mut out = format!("{} {}", kind, name);
    if let Some(parent) = parent {
        out.push_str(&format!(" sub {}", parent));
    }
    if is_abstract {
        out.push_str(" @abstract");
    }
    for clause in clauses {
        out.push_str(",\n    ");
        out.push_str(clause);
    }
    out.push(';');
    out
}

/// Kind of a schema type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Attribute,
    Entity,
    Relation,
}

impl fmt::Display for TypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeKind::Attribute => write!(f, "attribute"),
            TypeKind::Entity => write!(f, "entity"),
            TypeKind::Relation => write!(f, "relation"),
        }
    }
}

/// A complete schema: attribute, entity and relation types by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaModel {
    pub attributes: BTreeMap<String, AttributeSpec>,
    pub entities: BTreeMap<String, EntitySpec>,
    pub relations: BTreeMap<String, RelationSpec>,
}

impl SchemaModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attribute(mut self, attribute: AttributeSpec) -> Self {
        self.attributes.insert(attribute.name.clone(), attribute);
        self
    }

    pub fn with_entity(mut self, entity: EntitySpec) -> Self {
        self.entities.insert(entity.name.clone(), entity);
        self
    }

    pub fn with_relation(mut self, relation: RelationSpec) -> Self {
        self.relations.insert(relation.name.clone(), relation);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty() && self.entities.is_empty() && self.relations.is_empty()
    }

    pub fn kind_of(&self, name: &str) -> Option<TypeKind> {
        if self.attributes.contains_key(name) {
            Some(TypeKind::Attribute)
        } else if self.entities.contains_key(name) {
            Some(TypeKind::Entity)
        } else if self.relations.contains_key(name) {
            Some(TypeKind::Relation)
        } else {
            None
        }
    }

    /// Whether `name` is `ancestor` or inherits from it.
    pub fn is_subtype_of(&self, name: &str, ancestor: &str) -> bool {
        let mut seen = HashSet::new();
        let mut current = Some(name.to_string());
        while let Some(ty) = current {
            if ty == ancestor {
                return true;
            }
            if !seen.insert(ty.clone()) {
                return false;
            }
            current = self.parent_of(&ty).map(str::to_string);
        }
        false
    }

    fn parent_of(&self, name: &str) -> Option<&str> {
        self.entities
            .get(name)
            .and_then(|e| e.parent.as_deref())
            .or_else(|| self.relations.get(name).and_then(|r| r.parent.as_deref()))
    }

    /// Owns clauses of a type including those inherited from its supertypes.
    pub fn effective_owns(&self, name: &str) -> Vec<&OwnsSpec> {
        let mut owns = Vec::new();
        let mut seen = HashSet::new();
        let mut current = Some(name);
        while let Some(ty) = current {
            if !seen.insert(ty) {
                break;
            }
            if let Some(entity) = self.entities.get(ty) {
                owns.extend(entity.owns.iter());
            } else if let Some(relation) = self.relations.get(ty) {
                owns.extend(relation.owns.iter());
            }
            current = self.parent_of(ty);
        }
        owns
    }

    /// Entities ordered so that every supertype precedes its subtypes; ties by name.
    pub fn entities_in_definition_order(&self) -> Vec<&EntitySpec> {
        let parents: BTreeMap<&str, Option<&str>> = self
            .entities
            .values()
            .map(|e| (e.name.as_str(), e.parent.as_deref()))
            .collect();
        supertypes_first(&parents)
            .into_iter()
            .filter_map(|name| self.entities.get(name))
            .collect()
    }

    /// Relations ordered so that every supertype precedes its subtypes; ties by name.
    pub fn relations_in_definition_order(&self) -> Vec<&RelationSpec> {
        let parents: BTreeMap<&str, Option<&str>> = self
            .relations
            .values()
            .map(|r| (r.name.as_str(), r.parent.as_deref()))
            .collect();
        supertypes_first(&parents)
            .into_iter()
            .filter_map(|name| self.relations.get(name))
            .collect()
    }

    /// Render the whole model as a single `define` block.
    pub fn to_typeql(&self) -> String {
        let mut definitions: Vec<String> = self
            .attributes
            .values()
            .map(AttributeSpec::to_definition)
            .collect();
        definitions.extend(
            self.entities_in_definition_order()
                .into_iter()
                .map(|e| e.to_definition(true)),
        );
        definitions.extend(
            self.relations_in_definition_order()
                .into_iter()
                .map(|r| r.to_definition(true)),
        );

        if definitions.is_empty() {
            return String::new();
        }

        let mut out = String::from("define\n");
        for definition in definitions {
            for line in definition.lines() {
                out.push_str("  ");
                out.push_str(line);
                out.push('\n');
            }
        }
        out
    }

    /// Cross-reference problems: undefined attributes, parents, roles and
    /// inheritance cycles.
    pub fn reference_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();

        let owners = self
            .entities
            .values()
            .map(|e| (e.name.as_str(), e.parent.as_deref(), &e.owns, &e.plays, TypeKind::Entity))
            .chain(self.relations.values().map(|r| {
                (r.name.as_str(), r.parent.as_deref(), &r.owns, &r.plays, TypeKind::Relation)
            }));

        for (name, parent, owns, plays, kind) in owners {
            if let Some(parent) = parent {
                match self.kind_of(parent) {
                    None => errors.push(format!("{} {} subtypes undefined type {}", kind, name, parent)),
                    Some(parent_kind) if parent_kind != kind => errors.push(format!(
                        "{} {} cannot subtype {} {}",
                        kind, name, parent_kind, parent
                    )),
                    Some(_) if self.is_subtype_of(parent, name) => {
                        errors.push(format!("{} {} has a cyclic supertype chain", kind, name))
                    }
                    Some(_) => {}
                }
            }
            for o in owns {
                if !self.attributes.contains_key(&o.attribute) {
                    errors.push(format!("{} {} owns undefined attribute {}", kind, name, o.attribute));
                }
            }
            for p in plays {
                let role_defined = self
                    .relations
                    .get(&p.relation)
                    .is_some_and(|r| r.find_role(&p.role).is_some());
                if !role_defined {
                    errors.push(format!(
                        "{} {} plays undefined role {}",
                        kind,
                        name,
                        p.scoped_role()
                    ));
                }
            }
        }

        errors
    }
}

/// Depth-first ordering that emits a type's parent (when in the same set) before it.
fn supertypes_first<'a>(parents: &BTreeMap<&'a str, Option<&'a str>>) -> Vec<&'a str> {
    fn visit<'n>(
        name: &'n str,
        parents: &BTreeMap<&'n str, Option<&'n str>>,
        visited: &mut HashSet<&'n str>,
        order: &mut Vec<&'n str>,
    ) {
        if !visited.insert(name) {
            return;
        }
        if let Some(Some(parent)) = parents.get(name) {
            if parents.contains_key(parent) {
                visit(parent, parents, visited, order);
            }
        }
        order.push(name);
    }

    let mut visited = HashSet::new();
    let mut order = Vec::with_capacity(parents.len());
    for name in parents.keys() {
        visit(name, parents, &mut visited, &mut order);
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    fn social() -> SchemaModel {
        SchemaModel::new()
            .with_attribute(AttributeSpec::new("email", ValueType::String))
            .with_attribute(AttributeSpec::new("name", ValueType::String))
            .with_entity(
                EntitySpec::new("person")
                    .owns(OwnsSpec::key("email"))
                    .owns(OwnsSpec::new("name").card(Cardinality::new(0, Some(1))))
                    .plays("friendship", "friend"),
            )
            .with_entity(EntitySpec::new("admin").sub("person"))
            .with_relation(
                RelationSpec::new("friendship")
                    .relates(RoleSpec::new("friend").card(Cardinality::new(0, Some(2)))),
            )
    }

    #[test]
    fn test_cardinality_parse_and_display() {
        assert_eq!(Cardinality::parse("0..1"), Some(Cardinality::new(0, Some(1))));
        assert_eq!(Cardinality::parse("1.."), Some(Cardinality::new(1, None)));
        assert_eq!(Cardinality::parse("2"), Some(Cardinality::new(2, Some(2))));
        assert_eq!(Cardinality::parse("x..1"), None);
        assert_eq!(Cardinality::new(1, None).to_string(), "1..");
        assert_eq!(Cardinality::new(0, Some(3)).to_string(), "0..3");
    }

    #[test]
    fn test_entity_definition() {
        let model = social();
        let person = &model.entities["person"];
        assert_eq!(
            person.to_definition(true),
            "entity person,\n    owns email @key,\n    owns name @card(0..1),\n    plays friendship:friend;"
        );
        assert_eq!(
            person.to_definition(false),
            "entity person,\n    owns email @key,\n    owns name @card(0..1);"
        );
        assert_eq!(model.entities["admin"].to_definition(true), "entity admin sub person;");
    }

    #[test]
    fn test_abstract_relation_definition() {
        let rel = RelationSpec::new("membership")
            .abstract_type()
            .relates(RoleSpec::new("member"))
            .owns(OwnsSpec::new("since").unique());
        assert_eq!(
            rel.to_definition(true),
            "relation membership @abstract,\n    relates member,\n    owns since @unique;"
        );
    }

    #[test]
    fn test_definition_order_puts_parents_first() {
        let model = SchemaModel::new()
            .with_entity(EntitySpec::new("a-child").sub("z-parent"))
            .with_entity(EntitySpec::new("z-parent"))
            .with_entity(EntitySpec::new("m-other"));
        let order: Vec<_> = model
            .entities_in_definition_order()
            .iter()
            .map(|e| e.name.as_str())
            .collect();
        assert_eq!(order, vec!["z-parent", "a-child", "m-other"]);
    }

    #[test]
    fn test_effective_owns_includes_inherited() {
        let model = social();
        let owns: Vec<_> = model
            .effective_owns("admin")
            .iter()
            .map(|o| o.attribute.as_str())
            .collect();
        assert_eq!(owns, vec!["email", "name"]);
        assert!(model.is_subtype_of("admin", "person"));
        assert!(!model.is_subtype_of("person", "admin"));
    }

    #[test]
    fn test_reference_errors() {
        assert!(social().reference_errors().is_empty());

        let broken = SchemaModel::new()
            .with_entity(
                EntitySpec::new("person")
                    .owns(OwnsSpec::new("email"))
                    .plays("friendship", "friend"),
            )
            .with_entity(EntitySpec::new("admin").sub("ghost"));
        let errors = broken.reference_errors();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.contains("undefined attribute email")));
        assert!(errors.iter().any(|e| e.contains("undefined role friendship:friend")));
        assert!(errors.iter().any(|e| e.contains("undefined type ghost")));
    }

    #[test]
    fn test_to_typeql_block() {
        let model = SchemaModel::new()
            .with_attribute(AttributeSpec::new("email", ValueType::String))
            .with_entity(EntitySpec::new("person").owns(OwnsSpec::key("email")));
        assert_eq!(
            model.to_typeql(),
            "define\n  attribute email, value string;\n  entity person,\n      owns email @key;\n"
        );
        assert_eq!(SchemaModel::new().to_typeql(), "");
    }
}
