use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use futures::future::join_all;
use rand::Rng;
use serde_json::json;
use tracing::info;

use common::types::{Priority, Strategy, WorkItem};
use inference_dispatch::simulation::SimulatedProvisioner;
use inference_dispatch::DispatchOrchestrator;
use orchestrator_config::ConfigManager;

/// Runs a simulated inference workload through the dispatcher
#[derive(Parser, Debug)]
#[command(name = "inference-dispatch", version, about)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Nodes provisioned at start-up
    #[arg(long, default_value_t = 3)]
    nodes: usize,

    /// Worker slots per node
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Work items to submit
    #[arg(long, default_value_t = 100)]
    requests: usize,

    /// Initial selection strategy, overriding the configuration
    #[arg(long)]
    strategy: Option<Strategy>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let base = match &cli.config {
        Some(path) => ConfigManager::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => ConfigManager::new().context("loading configuration")?,
    };

    let mut settings = base.settings().clone();
    if let Some(strategy) = cli.strategy {
        settings.load_balancer.strategy = strategy;
    }
    settings.scaler.min_nodes = cli.nodes;
    settings.scaler.max_nodes = settings.scaler.max_nodes.max(cli.nodes);
    let config_manager = Arc::new(ConfigManager::from_settings(settings)?);

    let _logging = logging::init_logging(&config_manager.settings().logging)?;

    let provisioner = Arc::new(SimulatedProvisioner::new(cli.workers));
    let orchestrator = DispatchOrchestrator::new(config_manager, provisioner)?;
    orchestrator.start().await?;

    info!("Submitting {} work items", cli.requests);
    let mut handles = Vec::with_capacity(cli.requests);
    {
        let mut rng = rand::thread_rng();
        for n in 0..cli.requests {
            let priority = Priority::ALL[rng.gen_range(0..Priority::ALL.len())];
            let item = WorkItem::new(json!({ "prompt": format!("request {}", n) }))
                .with_priority(priority)
                .with_retry_budget(2);
            handles.push(orchestrator.submit(item)?);
        }
    }

    let results = join_all(handles.into_iter().map(|handle| handle.result())).await;
    let failed = results.iter().filter(|result| result.is_err()).count();
    info!(
        "Workload finished: {} succeeded, {} failed",
        results.len() - failed,
        failed
    );

    println!("{}", serde_json::to_string_pretty(&orchestrator.stats())?);

    orchestrator.stop().await?;
    Ok(())
}
