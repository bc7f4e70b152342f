//! Kiln CLI entry point.

use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::Result;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use kiln::cli::{Cli, LogFormat};
use kiln::reexec::ActionTable;

fn main() -> Result<()> {
    // Re-exec helpers run their action and exit before anything else starts
    let actions = Arc::new(ActionTable::builtin());
    if let Some(code) = actions.dispatch_if_reexec() {
        std::process::exit(code);
    }

    // Initialize error handling
    color_eyre::install()?;

    // Parse CLI arguments
    let cli = Cli::parse();
    let config = cli.load_config()?;

    // Initialize tracing
    let level = if cli.debug {
        "debug"
    } else {
        config.log_level.as_deref().unwrap_or("info")
    };
    let filter = EnvFilter::from_default_env().add_directive(format!("kiln={level}").parse()?);
    let registry = tracing_subscriber::registry().with(filter);
    match cli.log_format {
        LogFormat::Text => registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }

    // Execute command
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(cli.execute(config, actions))
}
