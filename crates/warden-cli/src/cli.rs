use std::path::PathBuf;

use clap::{Parser, Subcommand};
use warden_core::Operation;

#[derive(Debug, Parser)]
#[command(name = "warden", version, about = "Evaluate permission policies")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Policy document; overrides `policy.path` from the config.
    #[arg(short, long, global = true)]
    pub policy: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Compile every entity's rules and report the first invalid one.
    Validate,
    /// Print the compiled rule trees of an entity type.
    Explain {
        #[arg(long)]
        entity: String,
    },
    /// Evaluate a single permission request.
    Check(CheckArgs),
}

#[derive(Debug, clap::Args)]
pub struct CheckArgs {
    #[arg(long)]
    pub entity: String,

    #[arg(long)]
    pub operation: Operation,

    #[arg(long)]
    pub principal: String,

    #[arg(long = "role")]
    pub roles: Vec<String>,

    #[arg(long)]
    pub field: Option<String>,

    /// Resource attributes as a JSON object.
    #[arg(long)]
    pub object: Option<String>,

    /// Print evaluation counters after the decision.
    #[arg(long)]
    pub metrics: bool,
}
