use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(
    name = "measurement-hub",
    version,
    about = "Sensor reading ingest, rollup and query service"
)]
pub struct Cli {
    /// Raw store (overrides HUB_MEASUREMENTS_DB).
    #[arg(long, global = true)]
    pub measurements_db: Option<PathBuf>,
    /// Hourly/daily summary store (overrides HUB_SUMMARIES_DB).
    #[arg(long, global = true)]
    pub summaries_db: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Stream ingest, query API and summary collector in one process.
    Run(RunArgs),
    /// Stream ingest only.
    Ingest,
    /// Query API only.
    Serve(ServeArgs),
    /// Hourly/daily summary collector only.
    CollectSummaries,
    /// Summarise the bucket containing now for every standard period.
    SummarizeLatest,
    /// Summarise the last complete bucket for every standard period.
    SummarizePrevious,
    /// Summarise every bucket from a UTC date up to now.
    SummarizeSince(SummarizeSinceArgs),
    /// Drop every batch summary table.
    ClearSummaries,
    /// Merge older store files into a daily archive.
    ExtractHistory(ExtractHistoryArgs),
    /// Split a legacy wide `measurement` table into per-quantity tables.
    SplitLegacy(SplitLegacyArgs),
}

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    #[arg(long)]
    pub host: Option<String>,
    #[arg(long)]
    pub port: Option<u16>,
    /// Daily archive TSV (overrides HUB_HISTORY_PATH).
    #[arg(long)]
    pub history: Option<PathBuf>,
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    #[command(flatten)]
    pub serve: ServeArgs,
    #[arg(long, default_value_t = false)]
    pub no_collector: bool,
}

#[derive(Args, Debug)]
pub struct SummarizeSinceArgs {
    /// First day to summarise, `YYYY-MM-DD` (UTC).
    pub date: String,
    #[arg(long, default_value_t = false)]
    pub overwrite: bool,
}

#[derive(Args, Debug)]
pub struct ExtractHistoryArgs {
    /// Source stores, oldest first. Later files take precedence.
    #[arg(required = true, num_args = 1..)]
    pub databases: Vec<PathBuf>,
    /// Output TSV; stdout when omitted.
    #[arg(long, short)]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct SplitLegacyArgs {
    pub source: PathBuf,
    pub destination: PathBuf,
}

impl Cli {
    /// Applies the global flags on top of the environment configuration.
    pub fn apply(&self, config: &mut Config) {
        if let Some(path) = &self.measurements_db {
            config.measurements_db = path.clone();
        }
        if let Some(path) = &self.summaries_db {
            config.summaries_db = path.clone();
        }
    }
}

impl ServeArgs {
    pub fn apply(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.http_host = host.clone();
        }
        if let Some(port) = self.port {
            config.http_port = port;
        }
        if let Some(path) = &self.history {
            config.history_path = Some(path.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subcommands_and_overrides() {
        let cli = Cli::try_parse_from([
            "measurement-hub",
            "--measurements-db",
            "/tmp/raw.db",
            "serve",
            "--port",
            "9000",
        ])
        .unwrap();
        let mut config = Config::default();
        cli.apply(&mut config);
        let Commands::Serve(serve) = &cli.command else {
            panic!("expected serve, got {:?}", cli.command);
        };
        serve.apply(&mut config);
        assert_eq!(config.measurements_db, PathBuf::from("/tmp/raw.db"));
        assert_eq!(config.http_port, 9000);
        assert_eq!(config.http_host, "127.0.0.1");
    }

    #[test]
    fn extract_history_needs_a_source() {
        assert!(Cli::try_parse_from(["measurement-hub", "extract-history"]).is_err());
        let cli =
            Cli::try_parse_from(["measurement-hub", "extract-history", "a.db", "b.db", "-o", "out.tsv"])
                .unwrap();
        let Commands::ExtractHistory(args) = cli.command else {
            panic!("expected extract-history");
        };
        assert_eq!(args.databases.len(), 2);
        assert_eq!(args.output, Some(PathBuf::from("out.tsv")));
    }

    #[test]
    fn summarize_since_takes_a_date() {
        let cli =
            Cli::try_parse_from(["measurement-hub", "summarize-since", "2024-01-01", "--overwrite"])
                .unwrap();
        let Commands::SummarizeSince(args) = cli.command else {
            panic!("expected summarize-since");
        };
        assert_eq!(args.date, "2024-01-01");
        assert!(args.overwrite);
    }
}
