use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Write debug-level tracing to the log file
    #[clap(long, global = true)]
    pub debug: bool,
    /// Work directory (default: $FDIST_WORK_DIR, then ~/.fdist)
    #[clap(long, global = true)]
    pub work_dir: Option<PathBuf>,
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[clap(
        about = "Run the distribution core (normally started by `monitor`)",
        display_order = 2
    )]
    Run {},
    #[clap(
        about = "Run the supervisor: start and watch the core and its siblings",
        display_order = 1
    )]
    Monitor {},
    #[clap(about = "Stop a running instance", display_order = 3)]
    Stop {
        #[clap(long, help = "Interrupt running transfers instead of draining them")]
        quick: bool,
    },
    #[clap(about = "Show hosts, queue depth and global counters", display_order = 4)]
    Status {},
}
