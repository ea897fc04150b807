//! Schema of the migration ledgers.
//!
//! Both ledgers live in the database they track. Their definitions are
//! idempotent, so they are sent on every run.

/// Ledger of one-shot diff migrations, keyed by statement hash.
pub const HASH_LEDGER_SCHEMA: &str = "define
  attribute migration-hash, value string;
  attribute migration-summary, value string;
  attribute migration-applied-at, value datetime;
  entity migration-record,
    owns migration-hash @key,
    owns migration-summary,
    owns migration-applied-at;";

/// Ledger of named sequential migrations.
pub const SEQUENTIAL_LEDGER_SCHEMA: &str = "define
  attribute seq-migration-name, value string;
  attribute seq-migration-applied-at, value datetime;
  attribute seq-migration-checksum, value string;
  entity seq-migration-record,
    owns seq-migration-name @key,
    owns seq-migration-applied-at,
    owns seq-migration-checksum;";

#[cfg(test)]
mod tests {
    use super::*;
    use graft_core::schema::{is_ledger_type, parse_schema};

    #[test]
    fn test_ledger_schemas_parse() {
        for schema in [HASH_LEDGER_SCHEMA, SEQUENTIAL_LEDGER_SCHEMA] {
            let model = parse_schema(schema).unwrap();
            assert!(model.reference_errors().is_empty());
            for name in model
                .attributes
                .keys()
                .chain(model.entities.keys())
            {
                assert!(is_ledger_type(name), "{} is not a ledger type", name);
            }
        }
    }

    #[test]
    fn test_record_keys() {
        let model = parse_schema(SEQUENTIAL_LEDGER_SCHEMA).unwrap();
        let record = &model.entities["seq-migration-record"];
        assert!(record.find_owns("seq-migration-name").unwrap().key);
        assert!(!record.find_owns("seq-migration-checksum").unwrap().key);
    }
}
