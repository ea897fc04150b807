//! Loading sequential migrations from `.tql` files.
//!
//! A file holds one migration named by its stem. `# @up` and `# @down` marker
//! lines split it into forward and reverse sections; without markers the whole
//! file is the forward section.

use std::path::Path;

use tracing::debug;

use graft_core::error::{GraftError, Result};

use super::runner::SequentialMigration;

const UP_MARKER: &str = "# @up";
const DOWN_MARKER: &str = "# @down";

/// Load every `*.tql` migration in `dir`, sorted by name. A missing directory
/// yields no migrations.
pub fn load_migrations_from_dir(dir: &Path) -> Result<Vec<SequentialMigration>> {
    if !dir.exists() {
        debug!("Migrations directory does not exist: {:?}", dir);
        return Ok(Vec::new());
    }

    let mut migrations = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.extension().map(|e| e == "tql").unwrap_or(false) {
            continue;
        }

        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| GraftError::Config(format!("Invalid migration filename: {:?}", path)))?
            .to_string();
        let content = std::fs::read_to_string(&path)?;
        migrations.push(parse_migration(name, &content));
    }

    migrations.sort_by(|a, b| a.name().cmp(b.name()));
    debug!("Loaded {} migrations from {:?}", migrations.len(), dir);
    Ok(migrations)
}

/// Build a migration from the contents of a migration file.
pub fn parse_migration(name: impl Into<String>, content: &str) -> SequentialMigration {
    let mut up = String::new();
    let mut down = String::new();
    let mut in_down = false;

    for line in content.lines() {
        match line.trim() {
            UP_MARKER => in_down = false,
            DOWN_MARKER => in_down = true,
            _ => {
                let section = if in_down { &mut down } else { &mut up };
                section.push_str(line);
                section.push('\n');
            }
        }
    }

    SequentialMigration::typeql(name, split_statements(&up), split_statements(&down))
}

/// Split a section into statements. A statement starts at a column-0
/// `define`, `undefine`, `redefine` or `match`; `insert` and `put` start one
/// only outside a `match` pipeline. Comment lines are dropped.
pub fn split_statements(section: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();

    for line in section.lines() {
        if line.trim_start().starts_with('#') {
            continue;
        }
        if starts_statement(line, &current) && !current.trim().is_empty() {
            statements.push(current.trim().to_string());
            current.clear();
        }
        current.push_str(line);
        current.push('\n');
    }

    if !current.trim().is_empty() {
        statements.push(current.trim().to_string());
    }
    statements
}

fn starts_statement(line: &str, current: &str) -> bool {
    if line.starts_with(char::is_whitespace) {
        return false;
    }
    match first_word(line) {
        "define" | "undefine" | "redefine" | "match" => true,
        "insert" | "put" => first_word(current.trim_start()) != "match",
        _ => false,
    }
}

fn first_word(text: &str) -> &str {
    text.split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_migrations_from_empty_dir() {
        let dir = TempDir::new().unwrap();
        let migrations = load_migrations_from_dir(dir.path()).unwrap();
        assert!(migrations.is_empty());
    }

    #[test]
    fn test_load_migrations_from_nonexistent_dir() {
        let migrations = load_migrations_from_dir(Path::new("/nonexistent/path")).unwrap();
        assert!(migrations.is_empty());
    }

    #[test]
    fn test_load_migrations_sorted() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("0002_second.tql"), "define attribute b, value string;").unwrap();
        fs::write(dir.path().join("0001_first.tql"), "define attribute a, value string;").unwrap();
        fs::write(dir.path().join("0003_third.tql"), "define attribute c, value string;").unwrap();

        let migrations = load_migrations_from_dir(dir.path()).unwrap();
        let names: Vec<&str> = migrations.iter().map(|m| m.name()).collect();
        assert_eq!(names, ["0001_first", "0002_second", "0003_third"]);
    }

    #[test]
    fn test_load_migrations_ignores_other_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("0001_migration.tql"), "define attribute a, value string;").unwrap();
        fs::write(dir.path().join("readme.txt"), "Not a migration").unwrap();
        fs::write(dir.path().join("backup.tql.bak"), "Backup").unwrap();

        let migrations = load_migrations_from_dir(dir.path()).unwrap();
        assert_eq!(migrations.len(), 1);
        assert_eq!(migrations[0].name(), "0001_migration");
    }

    #[test]
    fn test_parse_up_and_down_sections() {
        let content = "\
# Adds people.
# @up
define
  attribute email, value string;
  entity person, owns email @key;

insert $p isa person, has email \"a@example.com\";

# @down
match $p isa person;
delete $p;
undefine person; email;
";
        let migration = parse_migration("0001_people", content);
        let statements = migration.statements().unwrap();

        assert_eq!(
            statements.up,
            vec![
                "define\n  attribute email, value string;\n  entity person, owns email @key;".to_string(),
                "insert $p isa person, has email \"a@example.com\";".to_string(),
            ]
        );
        assert_eq!(
            statements.down,
            vec![
                "match $p isa person;\ndelete $p;".to_string(),
                "undefine person; email;".to_string(),
            ]
        );
        assert!(migration.has_up());
        assert!(migration.has_down());
    }

    #[test]
    fn test_insert_inside_match_pipeline() {
        let section = "match $p isa person;\ninsert $q isa person;\ndefine attribute x, value string;";
        let statements = split_statements(section);
        assert_eq!(
            statements,
            vec![
                "match $p isa person;\ninsert $q isa person;".to_string(),
                "define attribute x, value string;".to_string(),
            ]
        );
    }

    #[test]
    fn test_file_without_markers_is_up_only() {
        let migration = parse_migration("0001_a", "define attribute a, value string;\n");
        assert!(migration.has_up());
        assert!(!migration.has_down());
        assert!(migration.checksum().is_some());
    }

    #[test]
    fn test_empty_file_has_no_up() {
        let migration = parse_migration("0001_empty", "# nothing yet\n");
        assert!(!migration.has_up());
        assert_eq!(migration.checksum(), None);
    }
}
