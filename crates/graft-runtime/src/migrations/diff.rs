use std::fmt;

use graft_core::schema::{
    is_ledger_type, AttributeSpec, EntitySpec, OwnsSpec, PlaysSpec, RelationSpec, RoleSpec,
    SchemaModel,
};

/// Additive difference between the schema the application wants and the
/// schema the store has.
///
/// Only additions turn into statements. Types and ownerships present in the
/// store but not in the desired model are listed in `remove_types` and
/// `remove_owns` and reported, never undefined.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaDiff {
    /// New attribute types.
    pub add_attributes: Vec<AttributeSpec>,
    /// New entity types, supertypes first.
    pub add_entities: Vec<EntitySpec>,
    /// New relation types, supertypes first.
    pub add_relations: Vec<RelationSpec>,
    /// Clauses added to types, existing or new. Owns first, then relates, then plays.
    pub add_owns: Vec<ClauseChange>,
    /// Types in the store that the desired model no longer has.
    pub remove_types: Vec<String>,
    /// Owns clauses the store has on a desired type that the model no longer declares.
    pub remove_owns: Vec<ClauseChange>,
}

impl SchemaDiff {
    /// Create an empty diff.
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute what `current` lacks compared to `desired`.
    pub fn between(desired: &SchemaModel, current: &SchemaModel) -> Self {
        let mut diff = Self::new();

        diff.add_attributes = desired
            .attributes
            .values()
            .filter(|a| !current.attributes.contains_key(&a.name))
            .cloned()
            .collect();

        let mut owns = Vec::new();
        let mut relates = Vec::new();
        let mut plays = Vec::new();
        let mut dropped = Vec::new();

        for entity in desired.entities_in_definition_order() {
            match current.entities.get(&entity.name) {
                None => {
                    diff.add_entities.push(entity.clone());
                    plays.extend(entity.plays.iter().map(|p| ClauseChange::plays(&entity.name, p)));
                }
                Some(existing) => {
                    owns.extend(
                        entity
                            .owns
                            .iter()
                            .filter(|o| existing.find_owns(&o.attribute).is_none())
                            .map(|o| ClauseChange::owns(&entity.name, o)),
                    );
                    dropped.extend(
                        existing
                            .owns
                            .iter()
                            .filter(|o| entity.find_owns(&o.attribute).is_none())
                            .map(|o| ClauseChange::owns(&entity.name, o)),
                    );
                    plays.extend(
                        entity
                            .plays
                            .iter()
                            .filter(|p| !existing.has_plays(p))
                            .map(|p| ClauseChange::plays(&entity.name, p)),
                    );
                }
            }
        }

        for relation in desired.relations_in_definition_order() {
            match current.relations.get(&relation.name) {
                None => {
                    diff.add_relations.push(relation.clone());
                    plays.extend(
                        relation
                            .plays
                            .iter()
                            .map(|p| ClauseChange::plays(&relation.name, p)),
                    );
                }
                Some(existing) => {
                    relates.extend(
                        relation
                            .relates
                            .iter()
                            .filter(|r| existing.find_role(&r.role).is_none())
                            .map(|r| ClauseChange::Relates {
                                relation: relation.name.clone(),
                                role: r.clone(),
                            }),
                    );
                    owns.extend(
                        relation
                            .owns
                            .iter()
                            .filter(|o| existing.find_owns(&o.attribute).is_none())
                            .map(|o| ClauseChange::owns(&relation.name, o)),
                    );
                    dropped.extend(
                        existing
                            .owns
                            .iter()
                            .filter(|o| relation.find_owns(&o.attribute).is_none())
                            .map(|o| ClauseChange::owns(&relation.name, o)),
                    );
                    plays.extend(
                        relation
                            .plays
                            .iter()
                            .filter(|p| !existing.has_plays(p))
                            .map(|p| ClauseChange::plays(&relation.name, p)),
                    );
                }
            }
        }

        diff.add_owns = owns;
        diff.add_owns.extend(relates);
        diff.add_owns.extend(plays);

        let mut removed: Vec<String> = current
            .entities
            .keys()
            .filter(|name| !desired.entities.contains_key(*name))
            .chain(
                current
                    .relations
                    .keys()
                    .filter(|name| !desired.relations.contains_key(*name)),
            )
            .filter(|name| !is_ledger_type(name))
            .cloned()
            .collect();
        removed.sort();
        diff.remove_types = removed;

        dropped.sort_by(|a, b| a.label().cmp(&b.label()));
        diff.remove_owns = dropped;

        diff
    }

    /// True when nothing needs to be added and nothing is missing from the model.
    pub fn is_empty(&self) -> bool {
        !self.has_additions() && self.remove_types.is_empty() && self.remove_owns.is_empty()
    }

    /// True when applying the diff would execute at least one statement.
    pub fn has_additions(&self) -> bool {
        !(self.add_attributes.is_empty()
            && self.add_entities.is_empty()
            && self.add_relations.is_empty()
            && self.add_owns.is_empty())
    }

    /// One-line description of the diff.
    pub fn summary(&self) -> String {
        if self.is_empty() {
            return "schema is up to date".to_string();
        }

        let mut parts = Vec::new();
        if !self.add_attributes.is_empty() {
            let names: Vec<&str> = self.add_attributes.iter().map(|a| a.name.as_str()).collect();
            parts.push(format!(
                "add {} attribute(s): {}",
                names.len(),
                names.join(", ")
            ));
        }
        if !self.add_entities.is_empty() {
            parts.push(format!("add {} entity type(s)", self.add_entities.len()));
        }
        if !self.add_relations.is_empty() {
            parts.push(format!("add {} relation type(s)", self.add_relations.len()));
        }
        for (label, count) in [
            ("owns", self.count_clauses(ClauseKind::Owns)),
            ("relates", self.count_clauses(ClauseKind::Relates)),
            ("plays", self.count_clauses(ClauseKind::Plays)),
        ] {
            if count > 0 {
                parts.push(format!("add {} {} clause(s)", count, label));
            }
        }
        if !self.remove_types.is_empty() {
            parts.push(format!(
                "WARNING: {} type(s) in DB not in code: {}",
                self.remove_types.len(),
                self.remove_types.join(", ")
            ));
        }
        if !self.remove_owns.is_empty() {
            let labels: Vec<String> = self.remove_owns.iter().map(ClauseChange::label).collect();
            parts.push(format!(
                "WARNING: {} owns clause(s) in DB not in code: {}",
                labels.len(),
                labels.join(", ")
            ));
        }
        parts.join("; ")
    }

    /// Removals the diff will not perform but which would lose data if done by hand.
    pub fn breaking_changes(&self) -> Vec<BreakingChange> {
        let types = self.remove_types.iter().map(|name| BreakingChange {
            type_name: name.clone(),
            detail: format!(
                "type {} exists in the database but not in the schema; removing it would delete all its instances",
                name
            ),
        });
        let owns = self.remove_owns.iter().map(|change| BreakingChange {
            type_name: change.type_name().to_string(),
            detail: format!(
                "ownership {} exists in the database but not in the schema; removing it would delete attribute data",
                change.label()
            ),
        });
        types.chain(owns).collect()
    }

    pub fn has_breaking_changes(&self) -> bool {
        !(self.remove_types.is_empty() && self.remove_owns.is_empty())
    }

    fn count_clauses(&self, kind: ClauseKind) -> usize {
        self.add_owns.iter().filter(|c| c.kind() == kind).count()
    }
}

impl fmt::Display for SchemaDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

/// A clause added to a type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClauseChange {
    Owns { owner: String, owns: OwnsSpec },
    Relates { relation: String, role: RoleSpec },
    Plays { player: String, plays: PlaysSpec },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClauseKind {
    Owns,
    Relates,
    Plays,
}

impl ClauseChange {
    fn owns(owner: &str, owns: &OwnsSpec) -> Self {
        Self::Owns {
            owner: owner.to_string(),
            owns: owns.clone(),
        }
    }

    fn plays(player: &str, plays: &PlaysSpec) -> Self {
        Self::Plays {
            player: player.to_string(),
            plays: plays.clone(),
        }
    }

    fn kind(&self) -> ClauseKind {
        match self {
            Self::Owns { .. } => ClauseKind::Owns,
            Self::Relates { .. } => ClauseKind::Relates,
            Self::Plays { .. } => ClauseKind::Plays,
        }
    }

    /// The type the clause is added to.
    pub fn type_name(&self) -> &str {
        match self {
            Self::Owns { owner, .. } => owner,
            Self::Relates { relation, .. } => relation,
            Self::Plays { player, .. } => player,
        }
    }

    /// Short label such as `person.email` or `friendship:friend`.
    pub fn label(&self) -> String {
        match self {
            Self::Owns { owner, owns } => format!("{}.{}", owner, owns.attribute),
            Self::Relates { relation, role } => format!("{}:{}", relation, role.role),
            Self::Plays { player, plays } => format!("{}:{}", player, plays.scoped_role()),
        }
    }

    /// The clause text, e.g. `owns email @key`.
    pub fn clause(&self) -> String {
        match self {
            Self::Owns { owns, .. } => owns.to_clause(),
            Self::Relates { role, .. } => role.to_clause(),
            Self::Plays { plays, .. } => plays.to_clause(),
        }
    }
}

/// A type the store has that the desired schema dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakingChange {
    pub type_name: String,
    pub detail: String,
}
