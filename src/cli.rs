use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rustarchiver")]
#[command(about = "Archive request composition and volume scheduling for a tiered storage archiver")]
#[command(version = "0.1.0")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit log records as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Specify configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Catalog and disk volume inventory (JSON)
    #[arg(short, long, global = true)]
    pub inventory: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate the configuration and list archive sets
    Check {
        /// Also list libraries and drives
        #[arg(short, long)]
        detailed: bool,
    },

    /// Scan a directory and show the copies that would start
    Plan {
        /// Directory to archive
        #[arg(value_name = "ROOT")]
        root: PathBuf,

        /// Archive set base name (copies are taken from the configuration)
        #[arg(short, long)]
        set: String,

        /// File system name recorded on the requests
        #[arg(long, default_value = "samfs1")]
        fs: String,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the volumes each archive set may use
    Volumes {
        /// Only this archive set
        #[arg(short, long)]
        set: Option<String>,

        /// Print the listing as JSON
        #[arg(long)]
        json: bool,
    },

    /// Archive a directory with the simulated copy executor
    Run {
        /// Directory to archive
        #[arg(value_name = "ROOT")]
        root: PathBuf,

        /// Archive set base name
        #[arg(short, long)]
        set: String,

        /// File system name recorded on the requests
        #[arg(long, default_value = "samfs1")]
        fs: String,

        /// Simulated time per archived file, in milliseconds
        #[arg(long, default_value = "0")]
        file_delay: u64,

        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Control directives applied after start (e.g. "rm idle")
        #[arg(short, long = "directive", value_name = "DIRECTIVE")]
        directives: Vec<String>,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
