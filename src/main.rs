use clap::Parser;
use metric_refresh::RunOptions;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "metric-refresh",
    about = "Refresh dashboard metric variables one query at a time",
    version
)]
struct Cli {
    /// Settings file (JSON). Missing keys fall back to defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Metric variable definitions (.json, .yaml or .yml)
    #[arg(short, long)]
    variables: PathBuf,
    /// Run production expressions instead of test expressions
    #[arg(long)]
    production: bool,
    /// Stop after this many seconds instead of waiting for ctrl-c
    #[arg(long)]
    duration_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    metric_refresh::run(RunOptions {
        settings_path: cli.config,
        variables_path: cli.variables,
        production: cli.production,
        duration: cli.duration_secs.map(Duration::from_secs),
    })
    .await?;
    Ok(())
}
