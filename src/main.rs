mod aggregate;
mod build;
mod cli;
mod dashboard;
mod download;
mod generation;
mod geo;
mod index;
mod model;
mod patients;
mod pipeline;
mod server;
mod source;
mod storage;
mod tiering;
mod views;

use anyhow::Context;
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // stdout carries `aggregate` output.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Args::parse();

    match args.cmd {
        cli::Command::Build(cmd) => build::run(cmd).await.context("build failed"),
        cli::Command::Serve(cmd) => server::run(cmd).await.context("serve failed"),
        cli::Command::Aggregate(cmd) => pipeline::run(cmd).context("aggregate failed"),
    }
}
