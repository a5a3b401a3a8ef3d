mod logging;
mod serve;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use wxpipe_core::{load_config, PipelineConfig, RunId, RunStatus};
use wxpipe_fetch::WeatherClient;
use wxpipe_pipeline::{Pipeline, RunFlags};
use wxpipe_store::{FsStageStore, StagePaths};

#[derive(Debug, Parser)]
#[command(name = "wxpipe")]
#[command(about = "Scheduled weather batch pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Execute one pipeline run and print its result as JSON.
    Run(RunArgs),
    /// Serve metrics and run the pipeline on the configured schedule.
    Serve {
        #[command(flatten)]
        config: ConfigArg,
    },
}

#[derive(Debug, Args)]
struct ConfigArg {
    /// Path to the YAML configuration file.
    #[arg(
        long = "config",
        env = "WXPIPE_CONFIG",
        default_value = "config/config.yaml"
    )]
    path: PathBuf,
}

#[derive(Debug, Args)]
#[allow(clippy::struct_excessive_bools)]
struct RunArgs {
    #[command(flatten)]
    config: ConfigArg,

    /// Run identifier (ASCII letters, digits, `-`, `_`). Generated if absent.
    #[arg(long, value_parser = parse_run_id)]
    run_id: Option<RunId>,

    /// Reuse the latest raw batch instead of fetching.
    #[arg(long)]
    skip_extract: bool,

    /// Reuse the latest processed batch instead of cleaning.
    #[arg(long)]
    skip_transform: bool,

    #[arg(long)]
    skip_analyze: bool,

    #[arg(long)]
    skip_load: bool,

    /// Stop issuing fetches after this many seconds.
    #[arg(long)]
    deadline_secs: Option<u64>,
}

impl RunArgs {
    fn flags(&self) -> RunFlags {
        RunFlags {
            skip_extract: self.skip_extract,
            skip_transform: self.skip_transform,
            skip_analyze: self.skip_analyze,
            skip_load: self.skip_load,
            run_id: self.run_id.clone(),
            deadline: self.deadline_secs.map(Duration::from_secs),
        }
    }
}

fn parse_run_id(raw: &str) -> Result<RunId, String> {
    RunId::parse(raw).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            let config = read_config(&args.config)?;
            logging::init(&config.logging)?;
            let status = run_once(&config, args.flags()).await?;
            Ok(if status == RunStatus::Failed {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }
        Commands::Serve { config } => {
            let config = read_config(&config)?;
            logging::init(&config.logging)?;
            serve::serve(config).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn read_config(arg: &ConfigArg) -> anyhow::Result<PipelineConfig> {
    load_config(&arg.path)
        .with_context(|| format!("failed to load configuration from {}", arg.path.display()))
}

/// Builds the production pipeline: HTTP client plus filesystem store.
fn build_pipeline(
    config: &PipelineConfig,
) -> anyhow::Result<Pipeline<WeatherClient, FsStageStore>> {
    let client = WeatherClient::new(&config.api, &config.pipeline)?;
    let store = FsStageStore::new(StagePaths::from_config(&config.data));
    Ok(Pipeline::new(config, client, store)?)
}

async fn run_once(config: &PipelineConfig, flags: RunFlags) -> anyhow::Result<RunStatus> {
    let pipeline = build_pipeline(config)?;
    let result = pipeline
        .run(flags)
        .await
        .context("pipeline run could not start")?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(result.overall_status)
}
