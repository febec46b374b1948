//! repo-keeper - package version maintenance CLI

use clap::Parser;

use repo_keeper_backend::{
    cli::{self, commands, Cli},
    config::Config,
    telemetry,
};

#[tokio::main]
async fn main() {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Cli::parse();
    let format = args.format;

    if let Err(e) = execute(args).await {
        commands::error(format, &e);
        std::process::exit(1);
    }
}

async fn execute(args: Cli) -> repo_keeper_backend::Result<()> {
    let config = Config::from_env()?;
    telemetry::init_tracing(&config.log_level);
    tracing::debug!(?config, "Loaded configuration");

    let app = cli::bootstrap(&config).await?;
    let report = cli::run(&args, &app).await?;
    commands::output(args.format, &report.message, Some(report.json));
    Ok(())
}
