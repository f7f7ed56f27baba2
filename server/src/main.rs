use anyhow::Result;
use clap::Parser;

mod args;
mod cursor;
mod gateway;
mod metrics;
mod shard;
mod socket;

use args::{Cli, Commands};
use gateway::run_server;

#[tokio::main]
async fn main() -> Result<()> {
    gingham_common::init();

    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server(args) => {
            gingham_common::metrics::maybe_spawn_metrics_server();
            run_server(args).await
        }
    }
}
