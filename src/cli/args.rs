//! CLI argument definitions using clap
//!
//! Commands:
//! - postkeeper ingest --config <path>
//! - postkeeper stats --config <path>
//! - postkeeper keys --config <path> [--namespace <ns>] [--prefix <p>]
//! - postkeeper get --config <path> --namespace <ns> --key <k>
//! - postkeeper compact --config <path>

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// postkeeper - dedup ingestion into an embedded namespaced store
#[derive(Parser, Debug)]
#[command(name = "postkeeper")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Ingest records until the source is exhausted or a stop signal arrives
    Ingest {
        /// Path to configuration file
        #[arg(long, default_value = "./postkeeper.json")]
        config: PathBuf,
    },

    /// Print store statistics and the source cursor
    Stats {
        /// Path to configuration file
        #[arg(long, default_value = "./postkeeper.json")]
        config: PathBuf,
    },

    /// List stored keys
    Keys {
        /// Path to configuration file
        #[arg(long, default_value = "./postkeeper.json")]
        config: PathBuf,

        /// Only keys in this namespace
        #[arg(long)]
        namespace: Option<String>,

        /// Only keys starting with this prefix
        #[arg(long)]
        prefix: Option<String>,
    },

    /// Print the value stored under a key
    Get {
        /// Path to configuration file
        #[arg(long, default_value = "./postkeeper.json")]
        config: PathBuf,

        /// Namespace of the key
        #[arg(long)]
        namespace: String,

        /// Key to read
        #[arg(long)]
        key: String,
    },

    /// Run one compaction cycle now
    Compact {
        /// Path to configuration file
        #[arg(long, default_value = "./postkeeper.json")]
        config: PathBuf,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
