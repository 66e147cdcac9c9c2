use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::company::{Phase, ResetKind};

#[derive(Parser, Debug)]
#[command(name = "gfscreen")]
#[command(about = "Screens German companies by the natural persons on their shareholder list")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (defaults to ./config/gfscreen.toml)
    #[arg(short, long, global = true, value_name = "PATH", env = "GFSCREEN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbose logging (use -v for per-company detail, -vv for DEBUG)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Append logs to this file in addition to stderr
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the default configuration file
    Init,

    /// Import companies from a CSV export or an Excel workbook
    Import {
        /// CSV or .xlsx file with company name, location, register court and register number
        file: PathBuf,

        /// Preferred CSV delimiter: ';', ',' or 'tab' (sniffed from the header when absent)
        #[arg(short, long)]
        delimiter: Option<String>,
    },

    /// Download shareholder lists for pending companies
    Fetch {
        /// Stop after this many companies
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Extract and qualify downloaded shareholder lists
    Parse {
        /// Stop after this many companies
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Fetch, then parse
    Run {
        /// Stop each phase after this many companies
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show lifecycle counts and recent events
    Status {
        /// Number of recent log events to show
        #[arg(long, default_value = "10")]
        events: usize,
    },

    /// Export qualified companies as a ';'-delimited CSV
    Export {
        /// Output file
        output: PathBuf,
    },

    /// Send a company back to an earlier phase
    Requeue {
        /// Company key as shown by `status` (e.g. "Berlin (Charlottenburg)/HRB 12345 B")
        key: String,

        /// Phase to re-run
        #[arg(long, value_enum)]
        phase: RequeuePhase,
    },

    /// Delete stored documents past the retention period
    Purge {
        /// Retention period in days (overrides config)
        #[arg(long, value_name = "DAYS")]
        max_age_days: Option<u32>,

        /// Only report what would be deleted
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum RequeuePhase {
    Fetch,
    Parse,
}

impl RequeuePhase {
    pub fn reset_kind(&self) -> ResetKind {
        match self {
            RequeuePhase::Fetch => ResetKind::Refetch,
            RequeuePhase::Parse => ResetKind::Reparse,
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            RequeuePhase::Fetch => Phase::Fetch,
            RequeuePhase::Parse => Phase::Parse,
        }
    }
}

impl Cli {
    pub fn validate(&self) -> Result<(), String> {
        match &self.command {
            Commands::Import { delimiter: Some(d), .. } => {
                parse_delimiter(d)?;
            }
            Commands::Fetch { limit: Some(0) } | Commands::Parse { limit: Some(0) } | Commands::Run { limit: Some(0) } => {
                return Err("Limit must be greater than 0".to_string());
            }
            Commands::Requeue { key, .. } if key.trim().is_empty() => {
                return Err("Company key cannot be empty".to_string());
            }
            Commands::Purge { max_age_days: Some(0), .. } => {
                return Err("Retention period must be at least one day".to_string());
            }
            _ => {}
        }
        Ok(())
    }
}

/// Accepts a single delimiter character or the word `tab`
pub fn parse_delimiter(raw: &str) -> Result<u8, String> {
    match raw {
        "tab" | "\\t" | "\t" => Ok(b'\t'),
        ";" => Ok(b';'),
        "," => Ok(b','),
        "|" => Ok(b'|'),
        other => Err(format!("Unsupported delimiter '{}': use ';', ',', '|' or 'tab'", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_import_with_globals() {
        let cli = Cli::try_parse_from([
            "gfscreen", "-vv", "--config", "custom.toml", "import", "leads.csv", "--delimiter", "tab",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.config, Some(PathBuf::from("custom.toml")));
        match &cli.command {
            Commands::Import { file, delimiter } => {
                assert_eq!(file, &PathBuf::from("leads.csv"));
                assert_eq!(parse_delimiter(delimiter.as_deref().unwrap()), Ok(b'\t'));
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_parse_requeue_phase() {
        let cli = Cli::try_parse_from(["gfscreen", "requeue", "HRB 1", "--phase", "parse"]).unwrap();
        match cli.command {
            Commands::Requeue { key, phase } => {
                assert_eq!(key, "HRB 1");
                assert_eq!(phase.reset_kind(), ResetKind::Reparse);
                assert_eq!(phase.phase(), Phase::Parse);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert!(Cli::try_parse_from(["gfscreen", "requeue", "HRB 1", "--phase", "export"]).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let zero = Cli::try_parse_from(["gfscreen", "run", "--limit", "0"]).unwrap();
        assert!(zero.validate().is_err());

        let bad = Cli::try_parse_from(["gfscreen", "import", "x.csv", "-d", "#"]).unwrap();
        assert!(bad.validate().is_err());

        let purge = Cli::try_parse_from(["gfscreen", "purge", "--max-age-days", "0"]).unwrap();
        assert!(purge.validate().is_err());

        let ok = Cli::try_parse_from(["gfscreen", "purge", "--dry-run"]).unwrap();
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_subcommand_required() {
        assert!(Cli::try_parse_from(["gfscreen"]).is_err());
    }
}
