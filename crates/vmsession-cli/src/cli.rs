//! CLI command definitions and subcommands

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// vmsession - drive a simulated VM session through its lifecycle
#[derive(Parser)]
#[command(name = "vmsession", version, about)]
pub struct Cli {
    /// Path to a JSON session config
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run session operations against the simulated hypervisor,
    /// printing progress events as JSON lines
    Run {
        /// Operations to run, in order
        #[arg(
            short,
            long,
            value_delimiter = ',',
            default_value = "open,start,pause,resume,hibernate,close"
        )]
        ops: Vec<Op>,

        /// Inject failures: `<verb>:<times>` (e.g. `startvm:1`)
        #[arg(long, value_name = "VERB:TIMES")]
        fail: Vec<String>,

        /// Seconds to wait for each operation to settle
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },

    /// Print the route the lifecycle graph takes between two states
    Route {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
    },

    /// Print the effective config as JSON
    Config,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Op {
    Open,
    Start,
    Pause,
    Resume,
    Stop,
    Hibernate,
    Close,
}
