mod check;
mod diff;

pub use check::CheckCommand;
pub use diff::DiffCommand;

use anyhow::Result;
use clap::{Parser, Subcommand};

/// graft - schema evolution for TypeQL stores
#[derive(Parser)]
#[command(name = "graft")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// CLI commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Compare two schema files and print the migration between them.
    Diff(DiffCommand),

    /// Validate the migrations in a directory.
    Check(CheckCommand),
}

impl Cli {
    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        dotenvy::dotenv().ok();
        init_tracing(self.verbose);

        match self.command {
            Commands::Diff(cmd) => cmd.execute().await,
            Commands::Check(cmd) => cmd.execute().await,
        }
    }
}

fn init_tracing(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    // A subscriber may already be installed when running under a test harness.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.to_string()))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_parse_diff() {
        let cli = Cli::try_parse_from([
            "graft",
            "diff",
            "--desired",
            "schema.tql",
            "--current",
            "export.tql",
        ])
        .unwrap();
        assert!(!cli.verbose);
        match cli.command {
            Commands::Diff(cmd) => {
                assert_eq!(cmd.desired, PathBuf::from("schema.tql"));
                assert_eq!(cmd.current, PathBuf::from("export.tql"));
                assert!(!cmd.rollback);
            }
            _ => panic!("expected diff"),
        }
    }

    #[test]
    fn test_parse_check_with_global_verbose() {
        let cli = Cli::try_parse_from(["graft", "check", "--dir", "db/migrations", "-v"]).unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Check(cmd) => {
                assert_eq!(cmd.dir, Some(PathBuf::from("db/migrations")));
                assert_eq!(cmd.config, PathBuf::from("graft.toml"));
            }
            _ => panic!("expected check"),
        }
    }

    #[test]
    fn test_diff_requires_both_files() {
        assert!(Cli::try_parse_from(["graft", "diff", "--desired", "schema.tql"]).is_err());
    }
}
