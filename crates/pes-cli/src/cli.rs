use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "pes",
    about = "Partitioned Event Store — operator tools",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Generate an Ed25519 key pair
    Keygen,
    /// Print the effective store configuration as TOML
    Config(ConfigArgs),
    /// Replay a file-backed partition and show its state
    Inspect(InspectArgs),
    /// Run an in-memory write/sync/read cycle
    Demo(DemoArgs),
}

#[derive(Args)]
pub struct ConfigArgs {
    /// Config file to load; defaults are printed when omitted
    #[arg(long)]
    pub path: Option<PathBuf>,
}

#[derive(Args)]
pub struct InspectArgs {
    /// Directory holding the partition segment files
    #[arg(long)]
    pub root: PathBuf,
    #[arg(long)]
    pub topic: String,
    #[arg(long)]
    pub partition: u32,
}

#[derive(Args)]
pub struct DemoArgs {
    /// Number of entities to write
    #[arg(short = 'n', long, default_value = "3")]
    pub entities: usize,
}
