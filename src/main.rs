use std::env;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use massip::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let cwd = env::current_dir()?;
    let settings = cli.settings(&cwd)?;

    match cli.command {
        Commands::Run(args) => massip::cli::run::run(&settings, args).await,
        Commands::Plugins => massip::cli::plugins::run(&settings),
        Commands::Parsers => massip::cli::parsers::run(&settings),
    }
}
