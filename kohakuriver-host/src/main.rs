mod clients;
mod config;
mod ids;
mod overlay;
mod proxy;
mod repositories;
mod routes;
mod scheduler;
mod services;
mod workers;

use crate::{
    clients::runner::HttpRunnerClient,
    config::HostConfig,
    ids::TaskIdGenerator,
    overlay::{
        manager::{OverlayManagerArgs, OverlayNetworkManager},
        netlink::CommandLinkManager,
        reservation::IpReservationManager,
    },
    repositories::{node::SqliteNodeRepository, sqlite::SqliteDb, task::SqliteTaskRepository},
    routes::AppState,
    services::{
        cluster::{ClusterService, ClusterServiceArgs},
        tasks::{TaskService, TaskServiceArgs, VpsSettings},
    },
    workers::reconciler::ReconcilerWorker,
};
use anyhow::Context;
use clap::Parser;
use rand::RngCore;
use std::{path::PathBuf, sync::Arc};
use tracing::info;

#[derive(Parser)]
struct Cli {
    /// Path to the host configuration file.
    #[clap(long, short, env = "KOHAKURIVER_HOST_CONFIG")]
    config: PathBuf,
}

fn reservation_secret(configured: Option<&String>) -> Vec<u8> {
    match configured {
        Some(secret) => secret.as_bytes().to_vec(),
        None => {
            // Fresh secret per process: reservations do not survive a restart.
            let mut secret = vec![0u8; 32];
            rand::rng().fill_bytes(&mut secret);
            secret
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let raw_config = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("reading config file {}", cli.config.display()))?;
    let config: HostConfig = serde_yaml::from_str(&raw_config).context("parsing config file")?;

    let db = SqliteDb::connect(&config.db.url).await.context("connecting to database")?;
    let tasks_repo = Arc::new(SqliteTaskRepository::new(db.clone()));
    let nodes_repo = Arc::new(SqliteNodeRepository::new(db));

    let overlay = Arc::new(OverlayNetworkManager::new(OverlayManagerArgs {
        subnet: config.overlay.subnet.clone(),
        base_vxlan_id: config.overlay.base_vxlan_id,
        vxlan_port: config.overlay.vxlan_port,
        mtu: config.overlay.mtu,
        host_physical_ip: config.reachable_address,
        links: Arc::new(CommandLinkManager),
    }));
    if config.overlay.enabled {
        overlay.initialize().await.context("initializing overlay network")?;
    }
    let reservations = Arc::new(IpReservationManager::new(
        overlay.clone(),
        reservation_secret(config.overlay.reservation_secret.as_ref()),
        config.overlay.reservation_ttl,
    ));

    let runner_client = Arc::new(HttpRunnerClient::new().context("building runner client")?);
    let task_service = Arc::new(TaskService::new(TaskServiceArgs {
        tasks: tasks_repo.clone(),
        nodes: nodes_repo.clone(),
        runner_client,
        reservations: reservations.clone(),
        ids: Arc::new(TaskIdGenerator::new(1)),
        shared_dir: config.shared_dir.clone(),
        vps: VpsSettings {
            ssh_port_start: config.vps.ssh_port_start,
            vm_watchdog: config.vps.vm_watchdog,
            vm_gpu_watchdog: config.vps.vm_gpu_watchdog,
        },
    }));
    let cluster_service = Arc::new(ClusterService::new(ClusterServiceArgs {
        nodes: nodes_repo,
        tasks: tasks_repo,
        overlay: config.overlay.enabled.then(|| overlay.clone()),
        heartbeat_interval: config.heartbeat.interval,
        missed_intervals: config.heartbeat.missed_intervals,
    }));

    ReconcilerWorker::spawn(cluster_service.clone(), config.heartbeat.interval);

    let state = AppState { cluster: cluster_service, tasks: task_service, reservations };
    let router = routes::build_router(state);

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("Shutdown signal received");
        shutdown_handle.shutdown();
    });

    info!("Host listening on {}", config.bind_endpoint);
    axum_server::bind(config.bind_endpoint)
        .handle(handle)
        .serve(router.into_make_service())
        .await
        .context("running API server")?;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
