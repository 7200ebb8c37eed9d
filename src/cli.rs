//! The command line surface (§1a): deliberately thin. Project layout and
//! build/runtime behavior come from `devdeploy.json`; the CLI only covers
//! what can't reasonably live in a committed manifest — where to serve
//! from, which port to try first, and whether to open a browser tab.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use crate::config::{manifest, RtcServe};
use crate::lifecycle::{self, ListenSpec};

#[derive(Debug, Parser)]
#[command(name = "devdeploy", version, about = "A local development server emulating a serverless platform's request pipeline")]
pub struct Cli {
    /// The project directory to serve. Must contain `devdeploy.json`, or
    /// nothing at all for zero-config static serving.
    #[arg(default_value = ".")]
    pub dir: PathBuf,

    /// The port to try first; on collision the next free port is tried.
    #[arg(short, long, default_value_t = 3000, conflicts_with = "unix_socket")]
    pub port: u16,

    /// Serve on a Unix domain socket instead of a TCP port. Bind failures
    /// here are fatal; there is no retry as there is for a port.
    #[arg(long)]
    pub unix_socket: Option<PathBuf>,

    /// Open the default browser once the server is listening.
    #[arg(short, long)]
    pub open: bool,

    /// Increase log verbosity; repeatable (`-v`, `-vv`).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// The `tracing-subscriber` filter directive this invocation implies,
    /// letting `-v`/`-vv` override `RUST_LOG` the way most CLIs layer them.
    pub fn log_filter(&self) -> String {
        match self.verbose {
            0 => "devdeploy=info".to_string(),
            1 => "devdeploy=debug".to_string(),
            _ => "devdeploy=trace".to_string(),
        }
    }

    fn listen_spec(&self) -> ListenSpec {
        match &self.unix_socket {
            Some(path) => ListenSpec::Unix(path.clone()),
            None => ListenSpec::Port(self.port),
        }
    }

    /// Load the manifest, start the server, and block until `ctrl_c` (or a
    /// fatal error) tells it to stop.
    pub async fn run(self) -> Result<()> {
        let manifest = manifest::load(&self.dir).context("error loading devdeploy.json")?;
        let rtc = RtcServe::new(self.dir.clone(), self.port, self.open, manifest)?;
        let listen = self.listen_spec();

        let running = lifecycle::start(rtc, listen).await?;
        announce(&running);

        tokio::signal::ctrl_c().await.context("error waiting for ctrl-c")?;
        tracing::info!("shutting down");
        running.stop().await
    }
}

fn announce(running: &lifecycle::Running) {
    match running.local_addr {
        Some(addr) => {
            tracing::info!("{}{}listening at http://{addr}", crate::common::SERVER, crate::common::NETWORK);
        }
        None => {
            tracing::info!("{}{}server listening", crate::common::SERVER, crate::common::NETWORK);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_default_args() {
        let cli = Cli::parse_from(["devdeploy"]);
        assert_eq!(cli.port, 3000);
        assert_eq!(cli.dir, PathBuf::from("."));
        assert!(cli.unix_socket.is_none());
    }

    #[test]
    fn port_and_unix_socket_are_mutually_exclusive() {
        let result = Cli::try_parse_from(["devdeploy", "--port", "4000", "--unix-socket", "/tmp/x.sock"]);
        assert!(result.is_err());
    }

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }
}
