use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use usage_core::Family;

#[derive(Debug, Parser)]
#[command(name = "token-ingest")]
#[command(about = "Incremental ingestion of coding-agent token usage logs")]
#[command(version)]
pub struct Cli {
    /// Config file to use instead of the default location
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// Database file to ingest into
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,
    /// Inputs parsed in parallel
    #[arg(long, global = true)]
    pub workers: Option<usize>,
    /// Approve every registry change without asking
    #[arg(long, global = true, conflicts_with = "no_input")]
    pub yes: bool,
    /// Decline every registry change that needs confirmation
    #[arg(long, global = true)]
    pub no_input: bool,
    /// Raise log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Codex CLI session logs
    Codex {
        #[command(subcommand)]
        command: CodexCommand,
    },
    /// Gemini CLI telemetry
    Gemini {
        #[command(subcommand)]
        command: GeminiCommand,
    },
    /// OpenCode's local database
    Opencode {
        #[command(subcommand)]
        command: OpencodeCommand,
    },
    /// Registered input sources
    Sources {
        #[command(subcommand)]
        command: SourcesCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum CodexCommand {
    Ingest {
        /// Root that is searched for `*.jsonl` session files
        #[arg(long)]
        sessions_root: Option<PathBuf>,
        /// Ignore fingerprints and checkpoints and re-upsert everything
        #[arg(long)]
        full_refresh: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum GeminiCommand {
    /// Convert a raw telemetry log and make sure it carries project metadata
    Preprocess { path: PathBuf },
    Ingest {
        /// Telemetry files or directories containing them
        #[arg(required_unless_present = "all_active")]
        paths: Vec<PathBuf>,
        /// Also ingest every active registered Gemini source
        #[arg(long)]
        all_active: bool,
        /// Deactivate active sources whose file is gone
        #[arg(long, requires = "all_active")]
        auto_deactivate: bool,
        #[arg(long)]
        full_refresh: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum OpencodeCommand {
    Ingest {
        /// OpenCode SQLite database
        #[arg(long)]
        source_db: Option<PathBuf>,
        #[arg(long)]
        full_refresh: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum SourcesCommand {
    List {
        #[arg(long, value_enum)]
        family: Option<FamilyArg>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FamilyArg {
    Codex,
    Gemini,
    Opencode,
}

impl From<FamilyArg> for Family {
    fn from(value: FamilyArg) -> Self {
        match value {
            FamilyArg::Codex => Family::Codex,
            FamilyArg::Gemini => Family::Gemini,
            FamilyArg::Opencode => Family::OpenCode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gemini_ingest_needs_paths_or_all_active() {
        assert!(Cli::try_parse_from(["token-ingest", "gemini", "ingest"]).is_err());
        let cli = Cli::try_parse_from(["token-ingest", "--yes", "gemini", "ingest", "--all-active"])
            .expect("parse");
        assert!(cli.yes);
        assert!(matches!(
            cli.command,
            Command::Gemini {
                command: GeminiCommand::Ingest {
                    all_active: true,
                    ..
                }
            }
        ));
    }

    #[test]
    fn yes_and_no_input_conflict() {
        assert!(
            Cli::try_parse_from(["token-ingest", "--yes", "--no-input", "sources", "list"]).is_err()
        );
    }

    #[test]
    fn global_flags_follow_subcommands() {
        let cli = Cli::try_parse_from([
            "token-ingest",
            "codex",
            "ingest",
            "--workers",
            "3",
            "-vv",
            "--full-refresh",
        ])
        .expect("parse");
        assert_eq!(cli.workers, Some(3));
        assert_eq!(cli.verbose, 2);
    }
}
