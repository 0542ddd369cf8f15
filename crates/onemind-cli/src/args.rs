//! CLI argument definitions using clap

use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::path::PathBuf;

/// OneMind balance tracker: inspect and adjust API credit balances
#[derive(Parser, Debug)]
#[command(name = "onemind")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output format: table or json
    #[arg(long, default_value = "table", global = true)]
    pub format: String,

    /// Config file (defaults to ~/.onemind/balance.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Balance API base URL, e.g. http://localhost:3001/api
    #[arg(long, global = true)]
    pub api: Option<String>,

    /// Log requests and cache activity
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// List every balance row
    #[command(alias = "ls")]
    List,

    /// Show balances with their status (free, empty, low, good)
    Summary,

    /// Set the current balance of a provider
    Set {
        /// Provider id, e.g. openai
        provider: String,
        /// New balance
        amount: Decimal,
        #[arg(long)]
        engine: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },

    /// Record spend against a provider
    Deduct {
        /// Provider id, e.g. openai
        provider: String,
        /// Cost to subtract
        cost: Decimal,
        #[arg(long)]
        engine: Option<String>,
        #[arg(long)]
        tokens_in: Option<u64>,
        #[arg(long)]
        tokens_out: Option<u64>,
    },

    /// Restore a provider to its initial balance
    Reset {
        /// Provider id, e.g. openai
        provider: String,
        #[arg(long)]
        engine: Option<String>,
    },

    /// Replace all balances from a CSV file ("-" for stdin)
    Import { file: PathBuf },

    /// Download the backend's CSV export
    Export,
}
