use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use nodestate::cli::{format_report, load_scenario_file, replay, Args, Report};
use nodestate::clock::FakeClock;
use nodestate::cluster::GROUP;
use nodestate::config::{default_config_path, load_config_file, StateConfig};
use nodestate::state::Cluster;
use nodestate::store::{MemoryStore, NodeClassKind, StaticCloudProvider};

fn load_config(args: &Args) -> StateConfig {
    let path = match &args.config {
        Some(path) => path.clone(),
        None => {
            let path = default_config_path();
            if !path.exists() {
                return StateConfig::default();
            }
            path
        }
    };
    match load_config_file(&path) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config file {}: {}", path.display(), e);
            process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    let config = load_config(&args);

    let scenario = match load_scenario_file(&args.scenario_file) {
        Ok(scenario) => scenario,
        Err(e) => {
            error!(
                "Failed to load scenario file {}: {:#}",
                args.scenario_file.display(),
                e
            );
            process::exit(1);
        }
    };

    let store = MemoryStore::new();
    scenario.seed(&store);

    let clock = FakeClock::default();
    let cloud_provider = StaticCloudProvider::new(
        "replay",
        vec![NodeClassKind::new(GROUP, "NodeClass")],
    );
    let cluster = Cluster::new(
        Arc::new(store.clone()),
        Arc::new(cloud_provider),
        Arc::new(clock.clone()),
        config,
    );

    info!("Replaying {} events", scenario.events.len());
    if let Err(e) = replay(&cluster, &store, &clock, &scenario).await {
        error!("Replay failed: {:#}", e);
        process::exit(1);
    }

    let report = Report::collect(&cluster).await;
    if args.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                error!("Failed to serialize report: {}", e);
                process::exit(1);
            }
        }
        return;
    }

    println!("{}", format_report(&report));
    match cluster.metrics().render() {
        Ok(metrics) => println!("{}", metrics),
        Err(e) => error!("Failed to render metrics: {}", e),
    }
}
