use anyhow::{Context, Result};
use clap::Parser;
use console::style;
use std::fmt::Write;
use std::path::{Path, PathBuf};

use graft_core::schema::{SchemaIntrospector, SchemaModel, TypeqlIntrospector};
use graft_runtime::migrations::{diff_against, SchemaDiff};

/// Compare two schema files.
#[derive(Parser)]
pub struct DiffCommand {
    /// Schema the application expects.
    #[arg(long)]
    pub desired: PathBuf,

    /// Schema exported from the database.
    #[arg(long)]
    pub current: PathBuf,

    /// Also print the statements undoing the migration.
    #[arg(long)]
    pub rollback: bool,
}

impl DiffCommand {
    pub async fn execute(self) -> Result<()> {
        let diff = self.compute()?;
        print!("{}", render(&diff, self.rollback));
        Ok(())
    }

    fn compute(&self) -> Result<SchemaDiff> {
        let desired = read_schema(&self.desired)?;
        let errors = desired.reference_errors();
        if !errors.is_empty() {
            anyhow::bail!(
                "Desired schema {} is inconsistent:\n  {}",
                self.desired.display(),
                errors.join("\n  ")
            );
        }

        let current = std::fs::read_to_string(&self.current)
            .with_context(|| format!("Failed to read {}", self.current.display()))?;
        Ok(diff_against(&desired, &TypeqlIntrospector, &current)?)
    }
}

fn read_schema(path: &Path) -> Result<SchemaModel> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    TypeqlIntrospector
        .introspect(&text)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

fn render(diff: &SchemaDiff, rollback: bool) -> String {
    let mut out = String::new();
    let _ = writeln!(out);
    let _ = writeln!(out, "  {}  Schema diff", style("graft").bold().cyan());
    let _ = writeln!(out);

    if diff.is_empty() {
        let _ = writeln!(out, "  {} {}", style("✓").green(), diff.summary());
        let _ = writeln!(out);
        return out;
    }

    let _ = writeln!(out, "  {} {}", style("→").dim(), diff.summary());
    let _ = writeln!(out);
    for statement in diff.generate_migration() {
        for line in statement.lines() {
            let _ = writeln!(out, "    {}", line);
        }
    }

    for change in diff.breaking_changes() {
        let _ = writeln!(
            out,
            "  {} {}: {}",
            style("⚠").yellow(),
            style(&change.type_name).yellow(),
            change.detail
        );
    }

    if rollback && diff.has_additions() {
        let _ = writeln!(out);
        let _ = writeln!(out, "  {} Rollback:", style("↓").dim());
        for op in diff.operations().iter().rev() {
            let _ = writeln!(out, "    {}", op.rollback_typeql());
        }
    }

    let _ = writeln!(out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const DESIRED: &str = "define
  attribute email, value string;
  attribute name, value string;
  entity person, owns email @key, owns name;";

    const CURRENT: &str = "define
  attribute email, value string;
  entity person, owns email @key;
  entity legacy;";

    fn command(dir: &TempDir, desired: &str, current: &str, rollback: bool) -> DiffCommand {
        fs::write(dir.path().join("desired.tql"), desired).unwrap();
        fs::write(dir.path().join("current.tql"), current).unwrap();
        DiffCommand {
            desired: dir.path().join("desired.tql"),
            current: dir.path().join("current.tql"),
            rollback,
        }
    }

    #[test]
    fn test_render_diff() {
        let dir = TempDir::new().unwrap();
        let diff = command(&dir, DESIRED, CURRENT, true).compute().unwrap();
        let out = render(&diff, true);

        assert!(out.contains("add 1 attribute(s): name"));
        assert!(out.contains("define attribute name, value string;"));
        assert!(out.contains("define person owns name;"));
        assert!(out.contains("legacy"));
        assert!(out.contains("undefine owns name from person;"));
    }

    #[test]
    fn test_render_up_to_date() {
        let dir = TempDir::new().unwrap();
        let diff = command(&dir, DESIRED, DESIRED, false).compute().unwrap();
        assert!(diff.is_empty());
        assert!(render(&diff, false).contains("up to date"));
    }

    #[test]
    fn test_inconsistent_desired_schema() {
        let dir = TempDir::new().unwrap();
        let cmd = command(&dir, "define entity person, owns missing;", CURRENT, false);
        let err = cmd.compute().unwrap_err();
        assert!(err.to_string().contains("inconsistent"));
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let cmd = DiffCommand {
            desired: dir.path().join("nope.tql"),
            current: dir.path().join("nope.tql"),
            rollback: false,
        };
        assert!(cmd.execute().await.is_err());
    }
}
