//! Command-line entry points: `run` (loop forever), `once` (single cycle,
//! useful for cron-driven deployments and debugging), `consolidate-now`.
//!
//! Grounded on the pack's `clap::Parser`/`Subcommand` derive shape and
//! `tracing_subscriber::EnvFilter` init, the ambient CLI idiom shown across
//! the example pack's Kubernetes-adjacent binaries.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use envconfig::Envconfig;
use kube::Client;
use tokio::sync::Mutex;
use tracing::info;

use nimbus_scheduler::catalog::Catalog;
use nimbus_scheduler::cluster::{ClusterDriver, KubeClusterDriver};
use nimbus_scheduler::config::SchedulerConfig;
use nimbus_scheduler::consolidator::Consolidator;
use nimbus_scheduler::providers::gcp::GcpProvider;
use nimbus_scheduler::providers::provider::Provider;
use nimbus_scheduler::scheduler::Scheduler;

#[derive(Parser, Debug)]
#[command(name = "nimbus-scheduler", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the scheduling loop and the background consolidator forever.
    Run,
    /// Run a single scheduling cycle and exit.
    Once,
    /// Run a single consolidation pass and exit.
    ConsolidateNow,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = SchedulerConfig::init_from_env()?;

    let spec_json = std::fs::read_to_string(&cfg.spec_json_path)?;
    let price_json = std::fs::read_to_string(&cfg.price_json_path)?;
    let catalog = Catalog::from_json(&spec_json, &price_json)?;

    let client = Client::try_default().await?;
    let cluster: Arc<dyn ClusterDriver> = Arc::new(KubeClusterDriver::new(client));

    let project = cfg
        .gcp_project
        .clone()
        .ok_or_else(|| anyhow::anyhow!("NIMBUS_GCP_PROJECT must be set"))?;
    let startup_script = std::fs::read_to_string(&cfg.gcp_startup_script_path)
        .unwrap_or_default();
    let provider = Provider::Gcp(GcpProvider::new(
        project,
        cfg.gcp_default_zone_suffix.clone(),
        startup_script,
    ));

    let op_lock = Arc::new(Mutex::new(()));

    match cli.command {
        Command::Run => {
            let consolidator = Arc::new(Consolidator::new(
                cfg.clone(),
                cluster.clone(),
                provider.clone(),
                op_lock.clone(),
            ));
            let scheduler =
                Arc::new(Scheduler::new(cfg, catalog, cluster, provider, op_lock).with_consolidator(consolidator.clone()));

            let scheduler_handle = tokio::spawn({
                let scheduler = scheduler.clone();
                async move { scheduler.run_forever().await }
            });
            let consolidator_handle = tokio::spawn({
                let consolidator = consolidator.clone();
                async move { consolidator.run_forever().await }
            });

            info!("nimbus-scheduler started");
            tokio::select! {
                _ = scheduler_handle => {}
                _ = consolidator_handle => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received");
                }
            }
        }
        Command::Once => {
            let scheduler = Scheduler::new(cfg, catalog, cluster, provider, op_lock);
            let report = scheduler.run_once().await?;
            info!(?report, "single cycle complete");
        }
        Command::ConsolidateNow => {
            let consolidator = Consolidator::new(cfg, cluster, provider, op_lock);
            let report = consolidator.run_once().await;
            info!(?report, "single consolidation pass complete");
        }
    }

    Ok(())
}
