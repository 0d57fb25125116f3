use anyhow::Result;
use clap::Parser;
use std::fs::OpenOptions;
use tracing_appender::non_blocking;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

mod cli;
mod config;
mod conn;
mod dellog;
mod dispatch;
mod engine;
mod errqueue;
mod error;
mod fifo;
mod fra;
mod fsa;
mod ingest;
mod maintenance;
mod mdb;
mod msg;
mod queue;
mod reaper;
mod region;
mod status;
mod supervisor;
mod util;

pub use error::FdError;
pub use error::TransferCode;

fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    let dirs = config::WorkDirs::resolve(cli.work_dir.clone())?;
    init_tracing(&dirs, cli.debug);

    let res = match cli.command {
        cli::Commands::Run {} => {
            let cfg = config::FdConfig::load(&dirs.conf_file())?;
            let mut engine = engine::Engine::new(cfg, dirs, cli.debug)?;
            engine.run()
        }
        cli::Commands::Monitor {} => supervisor::run_monitor(dirs, cli.debug),
        cli::Commands::Stop { quick } => {
            let byte = if quick { fifo::CMD_QUICK_STOP } else { fifo::CMD_SAVE_STOP };
            match fifo::send_oneshot(&dirs.command_fifo(), &[byte]) {
                Ok(()) => {
                    println!("stop request sent");
                    Ok(())
                }
                Err(e) => {
                    eprintln!("❌ no running instance under {}", dirs.root.display());
                    Err(e)
                }
            }
        }
        cli::Commands::Status {} => status::print_report(&dirs),
    };

    res?;
    Ok(())
}

fn init_tracing(dirs: &config::WorkDirs, debug: bool) {
    // All tracing output goes into the canonical log file under the work
    // dir; console output stays reserved for the status/stop commands. If
    // the file cannot be opened we skip initializing tracing entirely.
    let _ = std::fs::create_dir_all(&dirs.logs);
    let log_path = dirs.logs.join("fdist.log");
    let level_str = if debug { "debug" } else { "warn" };

    match OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(file) => {
            let (non_blocking_writer, guard) = non_blocking(file);
            // Leak the worker guard so the background writer thread stays
            // alive for the whole process; dropping it here would lose logs.
            let _ = Box::leak(Box::new(guard));
            let file_layer = fmt::layer()
                .with_writer(non_blocking_writer)
                .with_ansi(false)
                .with_filter(EnvFilter::new(level_str));
            tracing_subscriber::registry().with(file_layer).init();
        }
        Err(e) => {
            eprintln!("warning: could not open log at {}: {}", log_path.display(), e);
        }
    }
}
