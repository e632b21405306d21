use anyhow::Result;
use clap::Parser;

mod cli;

use cli::commands::{inspect::InspectCommand, run::RunCommand, validate::ValidateCommand};
use cli::{Cli, Commands};
use shipflow::config::{init_config, ShipflowConfig};
use shipflow::telemetry::{init_telemetry, shutdown_telemetry};

fn main() -> Result<()> {
    let cli = Cli::parse();

    ShipflowConfig::load_env_file()?;
    let settings = match &cli.config {
        Some(path) => ShipflowConfig::load_from(path)?,
        None => {
            init_config()?;
            shipflow::config()?.clone()
        }
    };
    init_telemetry(&settings.observability)?;

    let result = tokio::runtime::Runtime::new()?.block_on(async {
        match cli.command {
            Commands::Validate { file } => ValidateCommand::new(file).execute().await,
            Commands::Inspect { file, json } => InspectCommand::new(file).with_json(json).execute().await,
            Commands::Run {
                definitions,
                dry_run_actions,
                manual_clock,
            } => {
                RunCommand::new(definitions)
                    .with_settings(settings)
                    .with_dry_run_actions(dry_run_actions)
                    .with_manual_clock(manual_clock)
                    .execute()
                    .await
            }
        }
    });

    shutdown_telemetry();
    result
}
