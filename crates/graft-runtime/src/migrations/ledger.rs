//! Applied-migration bookkeeping stored as ordinary records in the tracked database.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use graft_core::error::Result;
use graft_core::schema::{SchemaIntrospector, TypeqlIntrospector};
use graft_core::store::{escape_string, format_datetime, Row};

use super::builtin::{HASH_LEDGER_SCHEMA, SEQUENTIAL_LEDGER_SCHEMA};
use crate::db::Database;

const SEQUENTIAL_LEDGER_RECORD: &str = "seq-migration-record";

/// A recorded one-shot migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRecord {
    pub hash: String,
    pub summary: String,
    pub applied_at: DateTime<Utc>,
}

/// Ledger of diff migrations, keyed by the hash of their statements.
#[derive(Debug, Clone)]
pub struct MigrationLedger {
    db: Database,
}

impl MigrationLedger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Define the ledger types. Safe to call repeatedly.
    pub async fn ensure_schema(&self, cancel: &CancellationToken) -> Result<()> {
        self.db.execute_schema(cancel, HASH_LEDGER_SCHEMA).await
    }

    pub async fn is_applied(&self, cancel: &CancellationToken, hash: &str) -> Result<bool> {
        let query = format!(
            "match $m isa migration-record, has migration-hash \"{}\";\nreduce $count = count($m);",
            escape_string(hash)
        );
        let rows = self.db.execute_read(cancel, &query).await?;
        match rows.first() {
            Some(row) => Ok(row.integer("count")? > 0),
            None => Ok(false),
        }
    }

    /// Record a migration as applied now. A hash recorded twice is rejected by the store.
    pub async fn record(&self, cancel: &CancellationToken, hash: &str, summary: &str) -> Result<()> {
        let query = format!(
            "insert $m isa migration-record,\n  has migration-hash \"{}\",\n  has migration-summary \"{}\",\n  has migration-applied-at {};",
            escape_string(hash),
            escape_string(summary),
            format_datetime(&Utc::now())
        );
        self.db.execute_write(cancel, &query).await?;
        debug!(hash, "Recorded schema migration");
        Ok(())
    }

    /// Every recorded migration, oldest first.
    pub async fn applied(&self, cancel: &CancellationToken) -> Result<Vec<MigrationRecord>> {
        let query = "match $m isa migration-record;\nfetch {\n  \"hash\": $m.migration-hash,\n  \"summary\": $m.migration-summary,\n  \"applied-at\": $m.migration-applied-at\n};";
        let rows = self.db.execute_read(cancel, query).await?;

        let mut records = rows
            .iter()
            .map(|row| {
                Ok(MigrationRecord {
                    hash: row.text("hash")?,
                    summary: row.opt_text("summary")?.unwrap_or_default(),
                    applied_at: row.timestamp("applied-at")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        records.sort_by(|a, b| a.applied_at.cmp(&b.applied_at));
        Ok(records)
    }
}

/// SHA-256 over each statement followed by a newline, as lowercase hex.
pub fn hash_statements<S: AsRef<str>>(statements: &[S]) -> String {
    let mut hasher = Sha256::new();
    for statement in statements {
        hasher.update(statement.as_ref().as_bytes());
        hasher.update(b"\n");
    }
    hex(&hasher.finalize())
}

/// Checksum of a migration's raw statements: up statements, a `|`, then down statements.
pub fn statements_checksum<S: AsRef<str>>(up: &[S], down: &[S]) -> String {
    let mut hasher = Sha256::new();
    for statement in up {
        hasher.update(statement.as_ref().as_bytes());
    }
    hasher.update(b"|");
    for statement in down {
        hasher.update(statement.as_ref().as_bytes());
    }
    hex(&hasher.finalize())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// A recorded sequential migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigration {
    pub name: String,
    pub applied_at: Option<DateTime<Utc>>,
    pub checksum: Option<String>,
}

/// Ledger of named sequential migrations.
#[derive(Debug, Clone)]
pub struct SequentialLedger {
    db: Database,
}

impl SequentialLedger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Define the ledger types. Safe to call repeatedly.
    pub async fn ensure_schema(&self, cancel: &CancellationToken) -> Result<()> {
        self.db.execute_schema(cancel, SEQUENTIAL_LEDGER_SCHEMA).await
    }

    /// Whether the ledger types exist, checked without defining them.
    pub async fn is_initialized(&self, cancel: &CancellationToken) -> Result<bool> {
        let schema = self.db.schema(cancel).await?;
        let model = TypeqlIntrospector.introspect(&schema)?;
        Ok(model.entities.contains_key(SEQUENTIAL_LEDGER_RECORD))
    }

    /// Applied migrations by name.
    pub async fn applied(&self, cancel: &CancellationToken) -> Result<BTreeMap<String, AppliedMigration>> {
        let query = "match $m isa seq-migration-record;\nfetch {\n  \"name\": $m.seq-migration-name,\n  \"applied-at\": $m.seq-migration-applied-at,\n  \"checksum\": $m.seq-migration-checksum\n};";
        let rows = self.db.execute_read(cancel, query).await?;

        let mut applied = BTreeMap::new();
        for row in &rows {
            if let Some(record) = Self::decode(row)? {
                applied.insert(record.name.clone(), record);
            }
        }
        Ok(applied)
    }

    fn decode(row: &Row) -> Result<Option<AppliedMigration>> {
        let Some(name) = row.opt_text("name")?.filter(|n| !n.is_empty()) else {
            return Ok(None);
        };
        let applied_at = if row.get("applied-at").is_null() {
            None
        } else {
            Some(row.timestamp("applied-at")?)
        };
        Ok(Some(AppliedMigration {
            name,
            applied_at,
            checksum: row.opt_text("checksum")?.filter(|c| !c.is_empty()),
        }))
    }

    /// Record a migration as applied now, with its checksum when it has one.
    pub async fn record(
        &self,
        cancel: &CancellationToken,
        name: &str,
        checksum: Option<&str>,
    ) -> Result<()> {
        let mut query = format!(
            "insert $m isa seq-migration-record,\n  has seq-migration-name \"{}\",\n  has seq-migration-applied-at {}",
            escape_string(name),
            format_datetime(&Utc::now())
        );
        if let Some(checksum) = checksum {
            query.push_str(&format!(
                ",\n  has seq-migration-checksum \"{}\"",
                escape_string(checksum)
            ));
        }
        query.push(';');
        self.db.execute_write(cancel, &query).await?;
        Ok(())
    }

    /// Remove a migration's record.
    pub async fn delete(&self, cancel: &CancellationToken, name: &str) -> Result<()> {
        let query = format!(
            "match $m isa seq-migration-record, has seq-migration-name \"{}\";\ndelete $m;",
            escape_string(name)
        );
        self.db.execute_write(cancel, &query).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graft_core::testing::MemoryStore;

    fn database(store: &MemoryStore) -> Database {
        Database::new(store.connect(), "db")
    }

    #[test]
    fn test_hash_statements() {
        let hash = hash_statements(&["define attribute a, value string;"]);
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(hash, hash_statements(&["define attribute a, value string;".to_string()]));
        assert_ne!(hash, hash_statements(&["define attribute b, value string;"]));
        // Statement boundaries matter.
        assert_ne!(hash_statements(&["ab", "c"]), hash_statements(&["a", "bc"]));
    }

    #[test]
    fn test_hash_of_nothing_is_sha256_of_empty_input() {
        let empty: [&str; 0] = [];
        assert_eq!(
            hash_statements(&empty),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_statements_checksum_separates_up_and_down() {
        let a = statements_checksum(&["x"], &["y"]);
        let b = statements_checksum(&["x", "y"], &[]);
        assert_ne!(a, b);
        assert_eq!(a, statements_checksum(&["x"], &["y"]));
    }

    #[tokio::test]
    async fn test_hash_ledger_round_trip() {
        let store = MemoryStore::new().with_database("db");
        let ledger = MigrationLedger::new(database(&store));
        let cancel = CancellationToken::new();

        ledger.ensure_schema(&cancel).await.unwrap();
        ledger.ensure_schema(&cancel).await.unwrap();
        assert!(!ledger.is_applied(&cancel, "abc").await.unwrap());

        ledger.record(&cancel, "abc", "add 1 attribute(s): \"x\"").await.unwrap();
        assert!(ledger.is_applied(&cancel, "abc").await.unwrap());
        assert!(ledger.record(&cancel, "abc", "again").await.is_err());

        let applied = ledger.applied(&cancel).await.unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].hash, "abc");
        assert_eq!(applied[0].summary, "add 1 attribute(s): \"x\"");
    }

    #[tokio::test]
    async fn test_sequential_ledger_record_and_delete() {
        let store = MemoryStore::new().with_database("db");
        let ledger = SequentialLedger::new(database(&store));
        let cancel = CancellationToken::new();

        assert!(!ledger.is_initialized(&cancel).await.unwrap());
        ledger.ensure_schema(&cancel).await.unwrap();
        assert!(ledger.is_initialized(&cancel).await.unwrap());
        ledger.record(&cancel, "0001_a", Some("c1")).await.unwrap();
        ledger.record(&cancel, "0002_b", None).await.unwrap();

        let applied = ledger.applied(&cancel).await.unwrap();
        assert_eq!(applied.len(), 2);
        assert_eq!(applied["0001_a"].checksum.as_deref(), Some("c1"));
        assert_eq!(applied["0002_b"].checksum, None);
        assert!(applied["0002_b"].applied_at.is_some());

        ledger.delete(&cancel, "0001_a").await.unwrap();
        let applied = ledger.applied(&cancel).await.unwrap();
        assert_eq!(applied.keys().collect::<Vec<_>>(), ["0002_b"]);
    }
}
