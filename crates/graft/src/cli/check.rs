use anyhow::Result;
use clap::Parser;
use console::style;
use std::path::PathBuf;
use tracing::debug;

use graft_core::config::GraftConfig;
use graft_core::error::{Severity, ValidationIssue};
use graft_runtime::migrations::{load_migrations_from_dir, MigrationRunner, SequentialMigration};

/// Validate a migrations directory.
#[derive(Parser)]
pub struct CheckCommand {
    /// Migrations directory (defaults to `migrations.dir` from the config file).
    #[arg(short, long)]
    pub dir: Option<PathBuf>,

    /// Configuration file path.
    #[arg(short, long, default_value = "graft.toml")]
    pub config: PathBuf,
}

impl CheckCommand {
    pub async fn execute(self) -> Result<()> {
        let dir = self.migrations_dir()?;
        debug!("Checking migrations in {:?}", dir);
        let migrations = load_migrations_from_dir(&dir)?;

        println!();
        println!("  {}  Migrations in {}", style("graft").bold().cyan(), dir.display());
        println!();

        if migrations.is_empty() {
            println!("  {} No migrations found", style("ℹ").blue());
            println!();
            return Ok(());
        }

        for migration in &migrations {
            println!("{}", describe(migration));
        }

        let issues = MigrationRunner::validate(&migrations);
        if !issues.is_empty() {
            println!();
            for issue in &issues {
                println!("{}", describe_issue(issue));
            }
        }
        println!();

        let errors = issues.iter().filter(|i| i.is_error()).count();
        if errors > 0 {
            anyhow::bail!("{} migration error(s) in {}", errors, dir.display());
        }
        println!(
            "  {} {} migration(s) OK",
            style("✓").green(),
            migrations.len()
        );
        println!();
        Ok(())
    }

    fn migrations_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.dir {
            return Ok(dir.clone());
        }
        if self.config.exists() {
            let config = GraftConfig::from_file(&self.config)?;
            return Ok(config.migrations.dir);
        }
        Ok(PathBuf::from("migrations"))
    }
}

fn describe(migration: &SequentialMigration) -> String {
    let checksum = migration
        .checksum()
        .map(|c| c[..12].to_string())
        .unwrap_or_else(|| "-".to_string());
    let down = if migration.has_down() {
        style("↓").green().to_string()
    } else {
        style("·").dim().to_string()
    };
    let statements = migration.statements().map(|s| s.up.len()).unwrap_or(0);
    format!(
        "  {} {} {} {} ({} statement(s))",
        style("○").yellow(),
        migration.name(),
        down,
        style(checksum).dim(),
        statements
    )
}

fn describe_issue(issue: &ValidationIssue) -> String {
    match issue.severity {
        Severity::Error => format!("  {} {}", style("✗").red(), issue),
        Severity::Warning => format!("  {} {}", style("⚠").yellow(), issue),
    }
}
