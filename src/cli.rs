use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::constants::{DEFAULT_CONFIG_PATH, DEFAULT_DB_PATH, DEFAULT_SOURCE_DIR};

#[derive(Debug, Parser)]
#[command(
    name = "implbench",
    version,
    about = "Benchmarks language implementations against annotated programs"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Build, run and verify every compatible (source, implementation) pair.
    Bench(BenchArgs),
    /// Print the best result per implementation and game as JSON.
    Report(ReportArgs),
    /// Print the pairs `bench` would run.
    List(ListArgs),
}

#[derive(Debug, Args)]
pub struct ConfigArg {
    #[arg(long, env = "IMPLBENCH_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,
}

#[derive(Debug, Args)]
pub struct DbArg {
    #[arg(long, env = "IMPLBENCH_DB", default_value = DEFAULT_DB_PATH)]
    pub db: PathBuf,
}

#[derive(Debug, Args)]
pub struct BenchArgs {
    #[command(flatten)]
    pub config: ConfigArg,
    #[command(flatten)]
    pub db: DbArg,
    #[command(flatten)]
    pub selection: SelectionArgs,
}

#[derive(Debug, Args)]
pub struct ReportArgs {
    #[command(flatten)]
    pub config: ConfigArg,
    #[command(flatten)]
    pub db: DbArg,
    /// Never let a failing trial displace a passing one.
    #[arg(long)]
    pub prefer_passing: bool,
    /// Write the report here instead of stdout.
    #[arg(long)]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[command(flatten)]
    pub config: ConfigArg,
    #[command(flatten)]
    pub selection: SelectionArgs,
}

#[derive(Debug, Args)]
pub struct SelectionArgs {
    #[arg(long, default_value = DEFAULT_SOURCE_DIR)]
    pub source_dir: PathBuf,
    /// Only these games. Repeatable.
    #[arg(long = "game")]
    pub games: Vec<String>,
    /// Only these implementations. Repeatable.
    #[arg(long = "impl")]
    pub implementations: Vec<String>,
    /// Only sources whose path contains one of these. Repeatable.
    #[arg(long = "filter")]
    pub filters: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_bench() {
        let cli = Cli::try_parse_from([
            "implbench",
            "bench",
            "--config",
            "bench.toml",
            "--db",
            "out.db",
            "--game",
            "nbody",
            "--game",
            "fasta",
            "--impl",
            "gcc",
        ])
        .unwrap();

        let Command::Bench(args) = cli.command else {
            panic!("expected bench command");
        };
        assert_eq!(args.config.config, PathBuf::from("bench.toml"));
        assert_eq!(args.db.db, PathBuf::from("out.db"));
        assert_eq!(args.selection.games, vec!["nbody", "fasta"]);
        assert_eq!(args.selection.implementations, vec!["gcc"]);
        assert!(args.selection.filters.is_empty());
        assert_eq!(args.selection.source_dir, PathBuf::from(DEFAULT_SOURCE_DIR));
    }

    #[test]
    fn test_parse_report() {
        let cli = Cli::try_parse_from(["implbench", "report", "--prefer-passing"]).unwrap();

        let Command::Report(args) = cli.command else {
            panic!("expected report command");
        };
        assert!(args.prefer_passing);
        assert_eq!(args.output, None);
    }
}
