use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "drivespan")]
#[command(about = "Sync a file tree onto a pool of removable devices", long_about = None)]
pub struct Cli {
    /// YAML configuration file
    #[arg(long, global = true, default_value = "drivespan.yml")]
    pub config: PathBuf,

    /// Where to write the JSON sync context after the run
    #[arg(long, global = true, default_value = "sync-context.json")]
    pub context: PathBuf,

    /// Log file path
    #[arg(long, global = true, default_value = "drivespan.log")]
    pub log: PathBuf,

    /// Log verbosity
    #[arg(long, global = true, default_value = "info", value_parser = ["debug", "info", "warn", "error"])]
    pub log_level: String,

    /// Disable the log file
    #[arg(long, global = true)]
    pub no_file_log: bool,

    /// Skip writing the sync context onto the last device
    #[arg(long, global = true)]
    pub no_dev_context: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Synchronize the backup path onto the configured device pool
    Sync,
}
