//! Run the bundled samples against OpenAI and print the score table.
//!
//! Usage: halpert [--config FILE] [--model MODEL] [--concurrency N] [--max-steps N]
//!
//! Responses are cached under `HALPERT_CACHE_DIR` (default
//! `~/.cache/halpert/openai`); a second run with the same model replays them.

use std::env;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use halpert::{functions, AgentLoop, Client, FsCache, Halpert, HalpertConfig, SharedGateway};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Load the config file named by `--config` (env overrides included), then
/// apply the remaining flags in order.
fn parse_args(args: impl IntoIterator<Item = String>) -> Result<HalpertConfig, BoxError> {
    let args: Vec<String> = args.into_iter().collect();
    let config_path = match args.iter().position(|a| a == "--config") {
        Some(i) => Some(args.get(i + 1).ok_or("--config needs a value")?),
        None => None,
    };
    let mut config = HalpertConfig::load(config_path.map(Path::new))?;

    let mut args = args.iter();
    while let Some(arg) = args.next() {
        let mut value = || args.next().ok_or_else(|| format!("{} needs a value", arg));
        match arg.as_str() {
            "--config" => {
                value()?;
            }
            "--model" => config.model = value()?.clone(),
            "--concurrency" => config.concurrency = value()?.parse()?,
            "--max-steps" => config.max_steps = Some(value()?.parse()?),
            other => return Err(format!("unknown argument: {}", other).into()),
        }
    }
    Ok(config)
}

async fn run(config: HalpertConfig) -> Result<(), BoxError> {
    info!(model = %config.model, cache_dir = %config.cache_dir.display(), "starting evaluation");
    let cache = FsCache::new(&config.cache_dir)?;
    let gateway = SharedGateway::openai(Client::new(), Arc::new(cache), config.sampling());

    let harness = Halpert::new(functions::samples(&gateway, &config.model)?);
    let agent = AgentLoop::new(gateway, &config.model)
        .max_steps(config.max_steps)
        .argument_errors(config.argument_errors);

    harness
        .run_all(agent, config.concurrency, config.run_timeout)
        .await?;
    let report = harness.evaluate()?;
    println!("{}", report);
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("halpert=info")),
        )
        .init();

    let config = match parse_args(env::args().skip(1)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}", e);
            eprintln!("usage: halpert [--config FILE] [--model MODEL] [--concurrency N] [--max-steps N]");
            return ExitCode::from(2);
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "evaluation failed");
            ExitCode::FAILURE
        }
    }
}
