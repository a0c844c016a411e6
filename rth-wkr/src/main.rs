//! RTH remote test worker.
//!
//! Receives a test's files and metadata over the wire protocol, runs the
//! test and returns the results and any coverage information. The intention
//! is that one can run a fleet of these to expand the available testing
//! resources beyond a single machine.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use rth_common::protocol::DEFAULT_PORT;
use rth_common::{init_logging, ByteSize};
use rth_wkr::worker::Server;

#[derive(Parser)]
#[command(name = "rth-wkr")]
#[command(author, version, about = "RTH remote test worker")]
struct Cli {
    /// Verbosity of output (higher number = more output)
    #[arg(short, long, default_value_t = 2)]
    verbose: u8,

    /// Port to serve on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Maximum size of message we will accept
    #[arg(long = "max_msg_size", default_value = "500M")]
    max_msg_size: ByteSize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Targets derive their scratch directories relative to this.
    let repo_root =
        std::env::current_dir().context("failed to determine working directory")?;

    let server = Server::bind(("0.0.0.0", cli.port), cli.max_msg_size.into(), repo_root)
        .await
        .with_context(|| format!("failed to bind port {}", cli.port))?;
    info!("Serving test worker on port {}", cli.port);
    server.serve().await;
    Ok(())
}
