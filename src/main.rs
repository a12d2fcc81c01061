mod cli;
mod engine;
mod error;
mod logging;
mod model;
mod orchestrator;
#[cfg(feature = "tui")]
mod tui;

use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    logging::init(&args)?;
    let is_text = args.is_text_mode();

    let res = cli::run(args).await;
    if let Err(e) = &res {
        tracing::error!(error = %format!("{e:#}"), "exiting with error");
    }
    // Explicitly exit in text mode so a signal listener or detached task cannot hold the runtime open.
    if is_text && res.is_ok() {
        std::process::exit(0);
    }
    res
}
