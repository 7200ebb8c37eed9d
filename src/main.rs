//! Binary entry point: initializes logging and dispatches to the CLI.

mod builder;
mod cli;
mod common;
mod config;
mod dispatcher;
mod file_index;
mod lambda;
mod lifecycle;
mod proxy;
mod registry;
mod request_id;
mod response;
mod router;
mod scheduler;
mod server;
mod static_builder;
mod watch;

use clap::Parser;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use cli::Cli;

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_filter()));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();

    tracing::info!(
        "{} starting devdeploy v{}",
        common::STARTING,
        env!("CARGO_PKG_VERSION")
    );

    match cli.run().await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{}{err:#}", common::ERROR);
            std::process::ExitCode::FAILURE
        }
    }
}
