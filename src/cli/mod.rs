use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod init;
pub mod patterns;
pub mod replay;

#[derive(Parser)]
#[command(name = "shufflefs")]
#[command(author, version, about = "Keeps document identity across application save shuffles", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate a default configuration file
    Init {
        #[arg(default_value = "shufflefs.toml")]
        path: PathBuf,
    },
    /// List the built-in save patterns in precedence order
    Patterns,
    /// Replay a recorded operation trace against an in-memory repository
    ///
    /// Prints the resulting tree with node ids, sizes and version labels,
    /// followed by the saves that were recognised.
    Replay {
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// TOML trace file with one [[step]] per operation
        trace: PathBuf,
    },
}
