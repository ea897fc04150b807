use graft_core::schema::{AttributeSpec, EntitySpec, OwnsSpec, PlaysSpec, RelationSpec, RoleSpec};

use super::diff::{ClauseChange, SchemaDiff};
use super::runner::SequentialMigration;

/// A single schema change derived from a diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    AddAttribute(AttributeSpec),
    /// Defined without its `plays` clauses; those follow as [`Operation::AddPlays`].
    AddEntity(EntitySpec),
    /// Defined without its `plays` clauses; those follow as [`Operation::AddPlays`].
    AddRelation(RelationSpec),
    AddOwns { owner: String, owns: OwnsSpec },
    AddRelates { relation: String, role: RoleSpec },
    AddPlays { player: String, plays: PlaysSpec },
}

impl Operation {
    /// Statement performing the change.
    pub fn to_typeql(&self) -> String {
        match self {
            Self::AddAttribute(attribute) => format!("define {}", attribute.to_definition()),
            Self::AddEntity(entity) => format!("define {}", entity.to_definition(false)),
            Self::AddRelation(relation) => format!("define {}", relation.to_definition(false)),
            Self::AddOwns { owner, owns } => format!("define {} {};", owner, owns.to_clause()),
            Self::AddRelates { relation, role } => {
                format!("define {} {};", relation, role.to_clause())
            }
            Self::AddPlays { player, plays } => format!("define {} {};", player, plays.to_clause()),
        }
    }

    /// Statement undoing the change.
    pub fn rollback_typeql(&self) -> String {
        match self {
            Self::AddAttribute(AttributeSpec { name, .. })
            | Self::AddEntity(EntitySpec { name, .. })
            | Self::AddRelation(RelationSpec { name, .. }) => format!("undefine {};", name),
            Self::AddOwns { owner, owns } => {
                format!("undefine owns {} from {};", owns.attribute, owner)
            }
            Self::AddRelates { relation, role } => {
                format!("undefine relates {} from {};", role.role, relation)
            }
            Self::AddPlays { player, plays } => {
                format!("undefine plays {} from {};", plays.scoped_role(), player)
            }
        }
    }
}

impl SchemaDiff {
    /// The additive changes in execution order.
    pub fn operations(&self) -> Vec<Operation> {
        let mut ops: Vec<Operation> = self
            .add_attributes
            .iter()
            .cloned()
            .map(Operation::AddAttribute)
            .collect();
        ops.extend(self.add_entities.iter().cloned().map(Operation::AddEntity));
        ops.extend(self.add_relations.iter().cloned().map(Operation::AddRelation));
        ops.extend(self.add_owns.iter().cloned().map(|change| match change {
            ClauseChange::Owns { owner, owns } => Operation::AddOwns { owner, owns },
            ClauseChange::Relates { relation, role } => Operation::AddRelates { relation, role },
            ClauseChange::Plays { player, plays } => Operation::AddPlays { player, plays },
        }));
        ops
    }

    /// One `define` statement per change, in execution order.
    pub fn generate_migration(&self) -> Vec<String> {
        self.operations().iter().map(Operation::to_typeql).collect()
    }

    /// A reversible named migration applying this diff. The down statements
    /// undo the operations in reverse order.
    pub fn to_sequential(&self, name: impl Into<String>) -> SequentialMigration {
        let ops = self.operations();
        let up: Vec<String> = ops.iter().map(Operation::to_typeql).collect();
        let down: Vec<String> = ops.iter().rev().map(Operation::rollback_typeql).collect();
        SequentialMigration::typeql(name, up, down)
    }
}
