mod args;
mod commands;
mod output;

use anyhow::{Context, Result};
use args::Cli;
use clap::Parser;
use onemind_core::TrackerConfig;

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "warn" };
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(level));
}

fn load_config(cli: &Cli) -> Result<TrackerConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let mut config = TrackerConfig::load_from_file(path)
                .with_context(|| format!("Failed to load {}", path.display()))?;
            config.apply_env();
            config
        }
        None => TrackerConfig::load().context("Failed to load balance config")?,
    };

    if let Some(api) = &cli.api {
        config.base_url = api.clone();
    }
    Ok(config)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(&cli)?;
    log::debug!("Balance API at {}", config.base_url);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(commands::run(cli, config))
}
