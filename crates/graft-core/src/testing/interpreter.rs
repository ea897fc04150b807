//! Statement interpreter behind [`MemoryStore`](super::MemoryStore).
//!
//! Supports the subset of TypeQL the migration engine emits: `define`,
//! `undefine`, single-variable `insert`, and `match` followed by `fetch`,
//! `reduce ... count` or `delete`.

use std::collections::BTreeMap;

use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;

use crate::error::{GraftError, Result};
use crate::schema::{apply_definition, parse_definitions, SchemaModel, TypeKind, ValueType};
use crate::store::{parse_datetime, unescape_string, Row, TransactionKind, Value};

#[derive(Parser)]
#[grammar = "schema/typeql.pest"]
#[grammar = "testing/statement.pest"]
struct StatementParser;

/// Committed contents of one database.
#[derive(Debug, Clone, Default)]
pub(crate) struct DatabaseState {
    pub(crate) model: SchemaModel,
    pub(crate) instances: Vec<Instance>,
}

#[derive(Debug, Clone)]
pub(crate) struct Instance {
    pub(crate) type_name: String,
    pub(crate) attributes: BTreeMap<String, Value>,
}

struct IsaPattern {
    var: String,
    type_name: String,
    has: Vec<(String, Value)>,
}

/// Execute one statement against `state`. The state is left untouched when
/// the statement fails.
pub(crate) fn execute(
    state: &mut DatabaseState,
    statement: &str,
    kind: TransactionKind,
) -> Result<Vec<Row>> {
    let fail = |message: String| GraftError::Statement {
        statement: statement.trim().to_string(),
        message,
    };

    if first_word(statement) == "define" {
        require(kind, TransactionKind::Schema, "define").map_err(fail)?;
        let mut model = state.model.clone();
        for definition in parse_definitions(statement).map_err(|e| fail(e.to_string()))? {
            apply_definition(&mut model, definition).map_err(|e| fail(e.to_string()))?;
        }
        let errors = model.reference_errors();
        if !errors.is_empty() {
            return Err(fail(errors.join("; ")));
        }
        state.model = model;
        return Ok(Vec::new());
    }

    let body = StatementParser::parse(Rule::statement, statement)
        .map_err(|e| fail(format!("syntax error: {}", e)))?
        .next()
        .and_then(|stmt| stmt.into_inner().next())
        .ok_or_else(|| fail("empty statement".to_string()))?;

    match body.as_rule() {
        Rule::undefine_block => {
            require(kind, TransactionKind::Schema, "undefine").map_err(fail)?;
            let mut model = state.model.clone();
            for item in body.into_inner() {
                undefine(&mut model, &state.instances, item).map_err(fail)?;
            }
            state.model = model;
            Ok(Vec::new())
        }
        Rule::insert_stmt => {
            require_writable(kind, "insert").map_err(fail)?;
            let pattern = parse_isa(first_inner(body).map_err(fail)?).map_err(fail)?;
            insert(state, pattern).map_err(fail)?;
            Ok(Vec::new())
        }
        Rule::match_stmt => {
            let mut inner = body.into_inner().filter(|p| p.as_rule() != Rule::kw_match);
            let pattern = inner
                .next()
                .ok_or_else(|| "missing match pattern".to_string())
                .and_then(parse_isa)
                .map_err(fail)?;
            let tail = inner
                .next()
                .ok_or_else(|| fail("missing fetch, reduce or delete".to_string()))?;
            let matched = matching(state, &pattern).map_err(fail)?;

            match tail.as_rule() {
                Rule::fetch_clause => fetch(state, &pattern, &matched, tail).map_err(fail),
                Rule::reduce_clause => {
                    let column = tail
                        .into_inner()
                        .find(|p| p.as_rule() == Rule::var)
                        .map(|p| p.as_str().trim_start_matches('$').to_string())
                        .ok_or_else(|| fail("missing reduce variable".to_string()))?;
                    Ok(vec![Row::new().with(column, matched.len() as i64)])
                }
                Rule::delete_clause => {
                    require_writable(kind, "delete").map_err(fail)?;
                    let mut index = 0;
                    state.instances.retain(|_| {
                        let keep = !matched.contains(&index);
                        index += 1;
                        keep
                    });
                    Ok(Vec::new())
                }
                other => Err(fail(format!("unexpected clause {:?}", other))),
            }
        }
        other => Err(fail(format!("unsupported statement {:?}", other))),
    }
}

fn first_word(statement: &str) -> String {
    statement
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'))
        .and_then(|l| l.split_whitespace().next())
        .unwrap_or_default()
        .to_ascii_lowercase()
}

fn require(kind: TransactionKind, needed: TransactionKind, what: &str) -> std::result::Result<(), String> {
    if kind == needed {
        Ok(())
    } else {
        Err(format!("{} requires a {} transaction, not {}", what, needed, kind))
    }
}

fn require_writable(kind: TransactionKind, what: &str) -> std::result::Result<(), String> {
    if kind == TransactionKind::Read {
        Err(format!("{} is not allowed in a read transaction", what))
    } else {
        Ok(())
    }
}

fn first_inner(pair: Pair<Rule>) -> std::result::Result<Pair<Rule>, String> {
    let text = pair.as_str().to_string();
    pair.into_inner()
        .find(|p| p.as_rule() == Rule::isa_pattern)
        .ok_or_else(|| format!("missing pattern in `{}`", text))
}

fn labels(pair: Pair<Rule>) -> Vec<String> {
    pair.into_inner()
        .filter(|p| matches!(p.as_rule(), Rule::ident | Rule::scoped_label))
        .map(|p| p.as_str().to_string())
        .collect()
}

fn parse_isa(pair: Pair<Rule>) -> std::result::Result<IsaPattern, String> {
    let mut var = None;
    let mut type_name = None;
    let mut has = Vec::new();

    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::var => var = Some(inner.as_str().to_string()),
            Rule::ident => type_name = Some(inner.as_str().to_string()),
            Rule::has_clause => {
                let mut attribute = None;
                let mut value = None;
                for part in inner.into_inner() {
                    match part.as_rule() {
                        Rule::ident => attribute = Some(part.as_str().to_string()),
                        Rule::kw_has => {}
                        _ => value = Some(parse_literal(part)?),
                    }
                }
                match (attribute, value) {
                    (Some(a), Some(v)) => has.push((a, v)),
                    _ => return Err("malformed has clause".to_string()),
                }
            }
            _ => {}
        }
    }

    match (var, type_name) {
        (Some(var), Some(type_name)) => Ok(IsaPattern {
            var,
            type_name,
            has,
        }),
        _ => Err("malformed isa pattern".to_string()),
    }
}

fn parse_literal(pair: Pair<Rule>) -> std::result::Result<Value, String> {
    let text = pair.as_str();
    match pair.as_rule() {
        Rule::string_lit => Ok(Value::Text(unescape_string(
            pair.into_inner()
                .next()
                .map(|p| p.as_str())
                .unwrap_or_default(),
        ))),
        Rule::datetime_lit => parse_datetime(text)
            .map(Value::Timestamp)
            .map_err(|e| e.to_string()),
        Rule::double_lit => text
            .parse()
            .map(Value::Double)
            .map_err(|e| format!("invalid double `{}`: {}", text, e)),
        Rule::integer_lit => text
            .parse()
            .map(Value::Integer)
            .map_err(|e| format!("invalid integer `{}`: {}", text, e)),
        Rule::boolean_lit => Ok(Value::Boolean(text == "true")),
        other => Err(format!("unexpected literal {:?}", other)),
    }
}

fn value_matches_type(value: &Value, value_type: &ValueType) -> bool {
    matches!(
        (value, value_type),
        (Value::Text(_), ValueType::String)
            | (Value::Integer(_), ValueType::Integer)
            | (Value::Double(_), ValueType::Double)
            | (Value::Integer(_), ValueType::Double)
            | (Value::Boolean(_), ValueType::Boolean)
            | (Value::Timestamp(_), ValueType::Datetime)
    )
}

fn insert(state: &mut DatabaseState, pattern: IsaPattern) -> std::result::Result<(), String> {
    let model = &state.model;
    match model.kind_of(&pattern.type_name) {
        Some(TypeKind::Entity) => {}
        Some(kind) => {
            return Err(format!(
                "cannot insert {} {} without role players",
                kind, pattern.type_name
            ))
        }
        None => return Err(format!("type {} is not defined", pattern.type_name)),
    }
    if model
        .entities
        .get(&pattern.type_name)
        .is_some_and(|e| e.is_abstract)
    {
        return Err(format!("cannot instantiate abstract type {}", pattern.type_name));
    }

    let owns = model.effective_owns(&pattern.type_name);
    let mut attributes = BTreeMap::new();
    for (attribute, value) in pattern.has {
        if !owns.iter().any(|o| o.attribute == attribute) {
            return Err(format!("{} does not own {}", pattern.type_name, attribute));
        }
        let value_type = model
            .attributes
            .get(&attribute)
            .map(|a| &a.value_type)
            .ok_or_else(|| format!("attribute {} is not defined", attribute))?;
        if !value_matches_type(&value, value_type) {
            return Err(format!(
                "{} value for {} does not match value type {}",
                value.kind(),
                attribute,
                value_type
            ));
        }
        if attributes.insert(attribute.clone(), value).is_some() {
            return Err(format!("multiple values given for {}", attribute));
        }
    }

    for spec in owns.iter().filter(|o| o.key || o.unique) {
        let Some(value) = attributes.get(&spec.attribute) else {
            if spec.key {
                return Err(format!(
                    "{} is missing key attribute {}",
                    pattern.type_name, spec.attribute
                ));
            }
            continue;
        };
        let taken = state.instances.iter().any(|i| {
            i.type_name == pattern.type_name && i.attributes.get(&spec.attribute) == Some(value)
        });
        if taken {
            return Err(format!(
                "{} {} already has {} {}",
                pattern.type_name,
                if spec.key { "key" } else { "unique value" },
                spec.attribute,
                value.to_literal()
            ));
        }
    }

    state.instances.push(Instance {
        type_name: pattern.type_name,
        attributes,
    });
    Ok(())
}

/// Indexes of the instances matching the pattern.
fn matching(state: &DatabaseState, pattern: &IsaPattern) -> std::result::Result<Vec<usize>, String> {
    if state.model.kind_of(&pattern.type_name).is_none() {
        return Err(format!("type {} is not defined", pattern.type_name));
    }
    Ok(state
        .instances
        .iter()
        .enumerate()
        .filter(|(_, i)| state.model.is_subtype_of(&i.type_name, &pattern.type_name))
        .filter(|(_, i)| {
            pattern
                .has
                .iter()
                .all(|(attribute, value)| i.attributes.get(attribute) == Some(value))
        })
        .map(|(index, _)| index)
        .collect())
}

fn fetch(
    state: &DatabaseState,
    pattern: &IsaPattern,
    matched: &[usize],
    clause: Pair<Rule>,
) -> std::result::Result<Vec<Row>, String> {
    let owns = state.model.effective_owns(&pattern.type_name);
    let mut columns = Vec::new();
    for entry in clause.into_inner().filter(|p| p.as_rule() == Rule::fetch_entry) {
        let mut key = None;
        let mut target = None;
        for part in entry.into_inner() {
            match part.as_rule() {
                Rule::string_lit => {
                    key = part.into_inner().next().map(|p| unescape_string(p.as_str()))
                }
                Rule::var_attribute => {
                    let mut pieces = part.into_inner();
                    let var = pieces.next().map(|p| p.as_str().to_string());
                    let attribute = pieces.next().map(|p| p.as_str().to_string());
                    target = var.zip(attribute);
                }
                _ => {}
            }
        }
        let (Some(key), Some((var, attribute))) = (key, target) else {
            return Err("malformed fetch entry".to_string());
        };
        if var != pattern.var {
            return Err(format!("variable {} is not bound", var));
        }
        if !owns.iter().any(|o| o.attribute == attribute) {
            return Err(format!("{} does not own {}", pattern.type_name, attribute));
        }
        columns.push((key, attribute));
    }

    Ok(matched
        .iter()
        .filter_map(|index| state.instances.get(*index))
        .map(|instance| {
            let mut row = Row::new();
            for (key, attribute) in &columns {
                let value = instance
                    .attributes
                    .get(attribute)
                    .cloned()
                    .unwrap_or(Value::Null);
                row.insert(key.clone(), value);
            }
            row
        })
        .collect())
}

fn undefine(
    model: &mut SchemaModel,
    instances: &[Instance],
    item: Pair<Rule>,
) -> std::result::Result<(), String> {
    let rule = item.as_rule();
    let labels = labels(item);
    match (rule, labels.as_slice()) {
        (Rule::undefine_type, [name]) => undefine_type(model, instances, name),
        (Rule::undefine_owns, [attribute, owner]) => {
            if instances
                .iter()
                .any(|i| &i.type_name == owner && i.attributes.contains_key(attribute))
            {
                return Err(format!("instances of {} still have {}", owner, attribute));
            }
            let owns = if let Some(entity) = model.entities.get_mut(owner) {
                &mut entity.owns
            } else if let Some(relation) = model.relations.get_mut(owner) {
                &mut relation.owns
            } else {
                return Err(format!("type {} is not defined", owner));
            };
            let before = owns.len();
            owns.retain(|o| &o.attribute != attribute);
            if owns.len() == before {
                return Err(format!("{} does not own {}", owner, attribute));
            }
            Ok(())
        }
        (Rule::undefine_relates, [role, relation_name]) => {
            let scoped = format!("{}:{}", relation_name, role);
            if players_of(model, &scoped).next().is_some() {
                return Err(format!("role {} is still played", scoped));
            }
            let relation = model
                .relations
                .get_mut(relation_name)
                .ok_or_else(|| format!("relation {} is not defined", relation_name))?;
            let before = relation.relates.len();
            relation.relates.retain(|r| &r.role != role);
            if relation.relates.len() == before {
                return Err(format!("{} does not relate {}", relation_name, role));
            }
            Ok(())
        }
        (Rule::undefine_plays, [scoped, player]) => {
            let plays = if let Some(entity) = model.entities.get_mut(player) {
                &mut entity.plays
            } else if let Some(relation) = model.relations.get_mut(player) {
                &mut relation.plays
            } else {
                return Err(format!("type {} is not defined", player));
            };
            let before = plays.len();
            plays.retain(|p| &p.scoped_role() != scoped);
            if plays.len() == before {
                return Err(format!("{} does not play {}", player, scoped));
            }
            Ok(())
        }
        _ => Err("malformed undefine".to_string()),
    }
}

fn players_of<'a>(model: &'a SchemaModel, scoped: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    model
        .entities
        .values()
        .filter(move |e| e.plays.iter().any(|p| p.scoped_role() == scoped))
        .map(|e| e.name.as_str())
        .chain(
            model
                .relations
                .values()
                .filter(move |r| r.plays.iter().any(|p| p.scoped_role() == scoped))
                .map(|r| r.name.as_str()),
        )
}

fn undefine_type(
    model: &mut SchemaModel,
    instances: &[Instance],
    name: &str,
) -> std::result::Result<(), String> {
    match model.kind_of(name) {
        None => Err(format!("type {} is not defined", name)),
        Some(TypeKind::Attribute) => {
            let owned = model
                .entities
                .values()
                .any(|e| e.find_owns(name).is_some())
                || model.relations.values().any(|r| r.find_owns(name).is_some());
            if owned {
                return Err(format!("attribute {} is still owned", name));
            }
            model.attributes.remove(name);
            Ok(())
        }
        Some(kind) => {
            if instances.iter().any(|i| i.type_name == name) {
                return Err(format!("{} {} has instances", kind, name));
            }
            let has_subtypes = model
                .entities
                .values()
                .any(|e| e.parent.as_deref() == Some(name))
                || model
                    .relations
                    .values()
                    .any(|r| r.parent.as_deref() == Some(name));
            if has_subtypes {
                return Err(format!("{} {} has subtypes", kind, name));
            }
            if let Some(relation) = model.relations.get(name) {
                for role in &relation.relates {
                    let scoped = format!("{}:{}", name, role.role);
                    if players_of(model, &scoped).any(|player| player != name) {
                        return Err(format!("role {} is still played", scoped));
                    }
                }
            }
            model.entities.remove(name);
            model.relations.remove(name);
            Ok(())
        }
    }
}
