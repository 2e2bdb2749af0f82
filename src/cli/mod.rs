pub mod parsers;
pub mod plugins;
pub mod run;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;

use massip_core::{Rejection, Settings};

#[derive(Parser)]
#[command(
    name = "massip",
    about = "Run analysis plugins over the addresses found in CSV files",
    version
)]
pub struct Cli {
    /// Settings file (defaults to ./massip.toml, then the user config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
    /// Directory of plugin manifests
    #[arg(long, global = true)]
    pub plugin_dir: Option<PathBuf>,
    /// Directory of parser definitions
    #[arg(long, global = true)]
    pub parser_dir: Option<PathBuf>,
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Analyze one or more CSV files
    Run(run::RunArgs),
    /// List available plugins
    Plugins,
    /// List available parsers
    Parsers,
}

impl Cli {
    /// Settings from `--config` or discovery, with directory flags applied.
    pub fn settings(&self, cwd: &Path) -> Result<Settings> {
        let mut settings = match &self.config {
            Some(path) => Settings::load(path)
                .with_context(|| format!("loading settings from {}", path.display()))?,
            None => Settings::discover(cwd)?,
        };
        if let Some(dir) = &self.plugin_dir {
            settings = settings.with_plugin_dir(dir.clone());
        }
        if let Some(dir) = &self.parser_dir {
            settings = settings.with_parser_dir(dir.clone());
        }
        Ok(settings)
    }
}

pub(crate) fn print_rejections(kind: &str, rejected: &[Rejection]) {
    if rejected.is_empty() {
        return;
    }
    eprintln!();
    eprintln!("{}", style(format!("Rejected {kind}:")).yellow().bold());
    for rejection in rejected {
        eprintln!(
            "  {} {}",
            style(rejection.path.display()).yellow(),
            style(&rejection.error).dim()
        );
    }
}
