//! SyncNSwim - keeps a removable audio device stocked with the latest podcast
//! episodes or a rotating sample of a music library.
//!
//! This is the main entry point for the command-line application.

mod cli;
mod logging;

use std::process::ExitCode;

use clap::Parser;
use tokio::runtime::{Builder, Runtime};
use tracing::error;

/// Build the multi-threaded runtime used by the daemon.
pub(crate) fn build_runtime() -> std::io::Result<Runtime> {
    Builder::new_multi_thread()
        .thread_name("syncnswim-worker")
        .enable_all()
        .build()
}

fn main() -> ExitCode {
    let cli = cli::Cli::parse();

    let config = logging::LoggingConfig::auto().with_verbose(cli.verbose);
    let _logging_guard = match logging::init(&config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {e}");
            None
        }
    };

    match cli::execute(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
