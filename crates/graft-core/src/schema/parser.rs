use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;
use tracing::debug;

use crate::error::{GraftError, Result};

use super::model::{
    AttributeSpec, Cardinality, EntitySpec, OwnsSpec, PlaysSpec, RelationSpec, RoleSpec,
    SchemaModel, TypeKind, ValueType,
};

#[derive(Parser)]
#[grammar = "schema/typeql.pest"]
struct TypeqlParser;

/// One definition inside a `define` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Definition {
    /// `None` for an extension of an existing type (`person owns email;`).
    pub kind: Option<TypeKind>,
    pub name: String,
    pub clauses: Vec<Clause>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Clause {
    Sub(String),
    Abstract,
    Value(ValueType),
    Owns(OwnsSpec),
    Plays(PlaysSpec),
    Relates(RoleSpec),
}

/// Parse schema text made of zero or more `define` blocks into a model.
pub fn parse_schema(input: &str) -> Result<SchemaModel> {
    let mut model = SchemaModel::new();
    for definition in parse_definitions(input)? {
        apply_definition(&mut model, definition)?;
    }
    Ok(model)
}

/// Parse schema text into its definitions without interpreting them.
pub fn parse_definitions(input: &str) -> Result<Vec<Definition>> {
    let pairs = TypeqlParser::parse(Rule::schema_file, input)
        .map_err(|e| GraftError::Schema(format!("invalid schema text: {}", e)))?;

    let mut definitions = Vec::new();
    for file in pairs {
        for block in file.into_inner() {
            if block.as_rule() != Rule::define_block {
                continue;
            }
            for pair in block.into_inner() {
                let kind = match pair.as_rule() {
                    Rule::attribute_def => Some(TypeKind::Attribute),
                    Rule::entity_def => Some(TypeKind::Entity),
                    Rule::relation_def => Some(TypeKind::Relation),
                    Rule::type_extension => None,
                    Rule::struct_def | Rule::fun_def => {
                        debug!("Ignoring {}", skipped_label(pair));
                        continue;
                    }
                    _ => continue,
                };
                definitions.push(parse_definition(pair, kind)?);
            }
        }
    }
    Ok(definitions)
}

fn parse_definition(pair: Pair<Rule>, kind: Option<TypeKind>) -> Result<Definition> {
    let mut name = None;
    let mut clauses = Vec::new();

    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::ident if name.is_none() => name = Some(inner.as_str().to_string()),
            Rule::sub_clause => clauses.push(Clause::Sub(clause_label(inner)?)),
            Rule::value_clause => {
                clauses.push(Clause::Value(ValueType::parse(&clause_label(inner)?)))
            }
            Rule::owns_clause => clauses.push(Clause::Owns(parse_owns(inner)?)),
            Rule::plays_clause => clauses.push(Clause::Plays(parse_plays(inner)?)),
            Rule::relates_clause => clauses.push(Clause::Relates(parse_relates(inner)?)),
            Rule::abstract_annot => clauses.push(Clause::Abstract),
            _ => {}
        }
    }

    let name = name.ok_or_else(|| GraftError::Schema("definition without a type label".into()))?;
    Ok(Definition {
        kind,
        name,
        clauses,
    })
}

/// The label following a clause keyword.
fn clause_label(pair: Pair<Rule>) -> Result<String> {
    let text = pair.as_str().to_string();
    pair.into_inner()
        .find(|p| matches!(p.as_rule(), Rule::ident | Rule::scoped_label))
        .map(|p| p.as_str().to_string())
        .ok_or_else(|| GraftError::Schema(format!("missing label in `{}`", text)))
}

fn parse_owns(pair: Pair<Rule>) -> Result<OwnsSpec> {
    let annotations: Vec<Pair<Rule>> = pair.clone().into_inner().collect();
    let mut owns = OwnsSpec::new(clause_label(pair)?);
    for annotation in annotations {
        match annotation.as_rule() {
            Rule::key_annot => owns.key = true,
            Rule::unique_annot => owns.unique = true,
            Rule::card_annot => owns.card = Some(parse_card(annotation)?),
            _ => {}
        }
    }
    Ok(owns)
}

fn parse_relates(pair: Pair<Rule>) -> Result<RoleSpec> {
    let parts: Vec<Pair<Rule>> = pair.clone().into_inner().collect();
    let mut role = RoleSpec::new(clause_label(pair)?);
    if let Some(parent) = parts.iter().filter(|p| p.as_rule() == Rule::ident).nth(1) {
        role.specializes = Some(parent.as_str().to_string());
    }
    for annotation in parts {
        if annotation.as_rule() == Rule::card_annot {
            role.card = Some(parse_card(annotation)?);
        }
    }
    Ok(role)
}

/// `struct address` / `fun count_people` for definitions the model does not track.
fn skipped_label(pair: Pair<Rule>) -> String {
    let keyword = if pair.as_rule() == Rule::struct_def { "struct" } else { "fun" };
    let name = pair
        .into_inner()
        .find(|p| p.as_rule() == Rule::ident)
        .map(|p| p.as_str().to_string())
        .unwrap_or_default();
    format!("{} {}", keyword, name)
}

fn parse_plays(pair: Pair<Rule>) -> Result<PlaysSpec> {
    let scoped = clause_label(pair)?;
    let (relation, role) = scoped
        .split_once(':')
        .ok_or_else(|| GraftError::Schema(format!("invalid role label `{}`", scoped)))?;
    Ok(PlaysSpec::new(relation, role))
}

fn parse_card(pair: Pair<Rule>) -> Result<Cardinality> {
    let text = pair.as_str().to_string();
    pair.into_inner()
        .find(|p| p.as_rule() == Rule::card_range)
        .and_then(|p| Cardinality::parse(p.as_str()))
        .ok_or_else(|| GraftError::Schema(format!("invalid cardinality `{}`", text)))
}

/// Merge a definition into a model the way the store does: new types are
/// created, clauses on existing types are added or replace the earlier
/// annotations of the same clause.
pub fn apply_definition(model: &mut SchemaModel, definition: Definition) -> Result<()> {
    let existing = model.kind_of(&definition.name);
    let kind = match (definition.kind, existing) {
        (Some(declared), Some(found)) if declared != found => {
            return Err(GraftError::Schema(format!(
                "{} is already defined as {}, cannot redefine it as {}",
                definition.name, found, declared
            )));
        }
        (Some(declared), _) => declared,
        (None, Some(found)) => found,
        (None, None) => {
            return Err(GraftError::Schema(format!(
                "cannot extend undefined type {}",
                definition.name
            )));
        }
    };

    match kind {
        TypeKind::Attribute => apply_attribute(model, definition),
        TypeKind::Entity => {
            let entity = model
                .entities
                .entry(definition.name.clone())
                .or_insert_with(|| EntitySpec::new(definition.name.clone()));
            for clause in definition.clauses {
                match clause {
                    Clause::Sub(parent) => entity.parent = Some(parent),
                    Clause::Abstract => entity.is_abstract = true,
                    Clause::Owns(owns) => upsert_owns(&mut entity.owns, owns),
                    Clause::Plays(plays) => {
                        if !entity.has_plays(&plays) {
                            entity.plays.push(plays);
                        }
                    }
                    Clause::Relates(role) => {
                        return Err(GraftError::Schema(format!(
                            "entity {} cannot relate role {}",
                            entity.name, role.role
                        )));
                    }
                    Clause::Value(_) => {
                        return Err(GraftError::Schema(format!(
                            "entity {} cannot declare a value type",
                            entity.name
                        )));
                    }
                }
            }
            Ok(())
        }
        TypeKind::Relation => {
            let relation = model
                .relations
                .entry(definition.name.clone())
                .or_insert_with(|| RelationSpec::new(definition.name.clone()));
            for clause in definition.clauses {
                match clause {
                    Clause::Sub(parent) => relation.parent = Some(parent),
                    Clause::Abstract => relation.is_abstract = true,
                    Clause::Owns(owns) => upsert_owns(&mut relation.owns, owns),
                    Clause::Plays(plays) => {
                        if !relation.has_plays(&plays) {
                            relation.plays.push(plays);
                        }
                    }
                    Clause::Relates(role) => {
                        match relation.relates.iter_mut().find(|r| r.role == role.role) {
                            Some(existing) => *existing = role,
                            None => relation.relates.push(role),
                        }
                    }
                    Clause::Value(_) => {
                        return Err(GraftError::Schema(format!(
                            "relation {} cannot declare a value type",
                            relation.name
                        )));
                    }
                }
            }
            Ok(())
        }
    }
}

fn apply_attribute(model: &mut SchemaModel, definition: Definition) -> Result<()> {
    let mut value_type = None;
    for clause in definition.clauses {
        match clause {
            Clause::Value(v) => value_type = Some(v),
            Clause::Abstract => {}
            other => {
                return Err(GraftError::Schema(format!(
                    "unsupported clause on attribute {}: {:?}",
                    definition.name, other
                )));
            }
        }
    }

    match (model.attributes.get(&definition.name), value_type) {
        (Some(existing), Some(v)) if existing.value_type != v => Err(GraftError::Schema(format!(
            "attribute {} already has value type {}, cannot change it to {}",
            definition.name, existing.value_type, v
        ))),
        (Some(_), _) => Ok(()),
        (None, Some(v)) => {
            model
                .attributes
                .insert(definition.name.clone(), AttributeSpec::new(definition.name, v));
            Ok(())
        }
        (None, None) => Err(GraftError::Schema(format!(
            "attribute {} has no value type",
            definition.name
        ))),
    }
}

fn upsert_owns(owns: &mut Vec<OwnsSpec>, clause: OwnsSpec) {
    match owns.iter_mut().find(|o| o.attribute == clause.attribute) {
        Some(existing) => *existing = clause,
        None => owns.push(clause),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOCIAL: &str = r#"
        define
          # people and who they know
          attribute email, value string;
          attribute name, value string;
          attribute since, value datetime;
          entity person @abstract,
              owns email @key,
              owns name @card(0..1),
              plays friendship:friend;
          entity employee sub person;
          relation friendship,
              relates friend @card(0..2),
              owns since;
    "#;

    #[test]
    fn test_parse_full_schema() {
        let model = parse_schema(SOCIAL).unwrap();

        assert_eq!(model.attributes.len(), 3);
        assert_eq!(model.attributes["since"].value_type, ValueType::Datetime);

        let person = &model.entities["person"];
        assert!(person.is_abstract);
        assert_eq!(person.owns.len(), 2);
        assert!(person.find_owns("email").unwrap().key);
        assert_eq!(
            person.find_owns("name").unwrap().card,
            Some(Cardinality::new(0, Some(1)))
        );
        assert_eq!(person.plays, vec![PlaysSpec::new("friendship", "friend")]);

        assert_eq!(model.entities["employee"].parent.as_deref(), Some("person"));

        let friendship = &model.relations["friendship"];
        assert_eq!(
            friendship.find_role("friend").unwrap().card,
            Some(Cardinality::new(0, Some(2)))
        );
        assert!(friendship.find_owns("since").is_some());
    }

    #[test]
    fn test_parse_empty_schema() {
        assert!(parse_schema("").unwrap().is_empty());
        assert!(parse_schema("define").unwrap().is_empty());
        assert!(parse_schema("  # nothing here\n").unwrap().is_empty());
    }

    #[test]
    fn test_type_extensions_merge() {
        let text = r#"
            define attribute email, value string;
            define entity person;
            define person owns email @key;
            define attribute nickname, value string;
            define person owns nickname @card(0..);
        "#;
        let model = parse_schema(text).unwrap();
        let person = &model.entities["person"];
        assert_eq!(person.owns.len(), 2);
        assert_eq!(
            person.find_owns("nickname").unwrap().card,
            Some(Cardinality::new(0, None))
        );
    }

    #[test]
    fn test_redefining_owns_replaces_annotations() {
        let text = r#"
            define
              attribute email, value string;
              entity person, owns email;
              person owns email @unique;
        "#;
        let model = parse_schema(text).unwrap();
        let owns = model.entities["person"].find_owns("email").unwrap();
        assert!(owns.unique);
        assert_eq!(model.entities["person"].owns.len(), 1);
    }

    #[test]
    fn test_unknown_annotations_are_ignored() {
        let text = r#"define attribute status, value string @regex("^(a|b)$"); entity task, owns status @values("a", "b");"#;
        let model = parse_schema(text).unwrap();
        assert!(model.entities["task"].find_owns("status").is_some());
    }

    #[test]
    fn test_extension_of_undefined_type_fails() {
        let err = parse_schema("define attribute email, value string; person owns email;")
            .unwrap_err();
        assert!(err.to_string().contains("undefined type person"));
    }

    #[test]
    fn test_kind_conflict_fails() {
        let err = parse_schema("define entity person; relation person, relates member;")
            .unwrap_err();
        assert!(err.to_string().contains("already defined as entity"));
    }

    #[test]
    fn test_value_type_change_fails() {
        let err = parse_schema(
            "define attribute age, value integer; define attribute age, value string;",
        )
        .unwrap_err();
        assert!(err.to_string().contains("cannot change it to string"));
    }

    #[test]
    fn test_syntax_error_reported() {
        let err = parse_schema("define entity person owns;").unwrap_err();
        assert!(matches!(err, GraftError::Schema(_)));
    }

    #[test]
    fn test_keyword_prefixed_labels() {
        let model = parse_schema(
            "define attribute subject, value string; entity owner, owns subject;",
        )
        .unwrap();
        assert!(model.entities["owner"].find_owns("subject").is_some());
    }

    #[test]
    fn test_rendered_model_parses_back() {
        let model = parse_schema(SOCIAL).unwrap();
        let reparsed = parse_schema(&model.to_typeql()).unwrap();
        assert_eq!(model, reparsed);
    }

    #[test]
    fn test_specialized_roles() {
        let model = parse_schema(
            "define relation membership, relates member; \
             relation employment sub membership, relates employee as member;",
        )
        .unwrap();

        let employment = &model.relations["employment"];
        assert_eq!(employment.parent.as_deref(), Some("membership"));
        let employee = employment.find_role("employee").unwrap();
        assert_eq!(employee.specializes.as_deref(), Some("member"));
        assert_eq!(employee.to_clause(), "relates employee as member");
        assert_eq!(parse_schema(&model.to_typeql()).unwrap(), model);
    }

    #[test]
    fn test_specialized_role_with_card() {
        let model = parse_schema(
            "define relation membership, relates member; \
             relation employment sub membership, relates employee as member @card(1..1);",
        )
        .unwrap();
        let employee = model.relations["employment"].find_role("employee").unwrap().clone();
        assert_eq!(employee.card, Some(Cardinality::new(1, Some(1))));
        assert_eq!(employee.specializes.as_deref(), Some("member"));
    }

    #[test]
    fn test_functions_are_skipped() {
        let schema = "define
  entity person;
fun count_people() -> integer:
  match $p isa person;
  return count($p);
fun first_person() -> person:
  match $p isa person;
  return first $p;
  attribute nickname, value string;
  person owns nickname;";
        let model = parse_schema(schema).unwrap();

        assert!(model.entities.contains_key("person"));
        assert!(model.attributes.contains_key("nickname"));
        assert!(model.entities["person"].find_owns("nickname").is_some());
    }

    #[test]
    fn test_function_at_end_of_input() {
        let schema = "define\n  entity person;\nfun count_people() -> integer:\n match $p isa person;\n return count($p);";
        let model = parse_schema(schema).unwrap();
        assert_eq!(model.entities.len(), 1);
    }

    #[test]
    fn test_structs_are_skipped() {
        let model = parse_schema(
            "define struct address: street value string, city value string?; \
             struct legacy, value zip string; \
             attribute email, value string; entity person, owns email;",
        )
        .unwrap();

        assert_eq!(model.attributes.len(), 1);
        assert_eq!(model.entities.len(), 1);
        assert!(!model.entities.contains_key("address"));
    }

    #[test]
    fn test_as_prefixed_labels() {
        let model = parse_schema(
            "define relation assignment, relates assignee, relates asset; \
             entity struct-holder, plays assignment:asset;",
        )
        .unwrap();
        assert!(model.relations["assignment"].find_role("asset").is_some());
        assert!(model.entities.contains_key("struct-holder"));
    }
}
