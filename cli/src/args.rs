use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Read and write values of a SQLite-backed store group.
#[derive(Debug, Parser)]
#[command(author, about, version)]
pub struct Args {
    /// Database file, created if missing
    #[arg(long, default_value = "syncstores.db", env = "SYNCSTORES_DB")]
    pub db: PathBuf,

    /// JSON file with adapter options: `area`, `live` and `keys`
    ///
    /// Without it, the group serves every key of the `sync` area.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
#[command(rename_all = "kebab-case")]
pub enum Command {
    /// Print the value of a key as JSON
    Get { key: String },
    /// Set a key to a JSON value
    Set { key: String, value: String },
    /// Remove a key from storage
    Remove { key: String },
    /// Print every key with its value
    List,
}
