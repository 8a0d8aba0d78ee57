//! Command-line interface for the scanner.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Static code security and privacy scanner.
#[derive(Parser, Debug)]
#[command(name = "leakhound")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (cli, json, yaml)
    #[arg(short = 'f', long, global = true, default_value = "cli")]
    pub format: String,

    /// Config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Scan a path for security and privacy risks
    Scan {
        /// Path to scan (file or directory)
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Directory of additional rule files (overrides built-ins by id)
        #[arg(long, value_name = "DIR")]
        external_rules: Option<PathBuf>,

        /// Force-refresh the external rules cache
        #[arg(long)]
        force: bool,

        /// Minimum severity to report (warning, low, medium, high, critical)
        #[arg(long, default_value = "low")]
        min_severity: String,

        /// Fail with exit code 1 if any detection at this severity or above
        #[arg(long)]
        fail_on: Option<String>,

        /// Output file (writes to stdout if not specified)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List loaded rules
    Rules {
        /// Show a specific rule by id
        #[arg(long)]
        rule: Option<String>,

        /// Output rules as JSON
        #[arg(long)]
        json: bool,
    },

    /// Write a default config file
    Init {
        /// Where to write the config
        #[arg(default_value = "leakhound.toml")]
        output: PathBuf,
    },
}
