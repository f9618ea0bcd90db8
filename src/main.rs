use anyhow::Context;
use clap::Parser;
use tracing::{Level, debug};

use cli::Cli;

mod balancer;
mod cli;
mod config;
mod discovery;
mod dnsmasq;
mod error;
mod host;
mod kind;
mod model;
mod runner;
mod utils;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let settings = cli.settings().context("failed to load settings")?;

    let debug = settings.debug
        || std::env::var("LOG_LEVEL").is_ok_and(|level| level.eq_ignore_ascii_case("debug"));
    tracing_subscriber::fmt()
        .with_max_level(if debug { Level::DEBUG } else { Level::INFO })
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    debug!(?settings, "settings loaded");

    cli.run(settings).await
}
