mod clients;
mod commands;
mod config;
mod overlay;
mod qemu;
mod repositories;
mod resources;
mod routes;
mod services;
mod tunnel;
mod workers;

use crate::{
    clients::{
        docker::{CliDockerClient, DockerClient},
        host::{HostApiClient, HttpHostApiClient},
    },
    commands::run_command,
    config::RunnerConfig,
    overlay::RunnerOverlayManager,
    qemu::{capability, manager::{VmManager, VmManagerArgs}},
    repositories::{records::SqliteTaskRecordRepository, sqlite::SqliteDb},
    routes::AppState,
    services::{
        executor::{ExecutorSettings, TaskExecutor},
        images::ImageSyncService,
        recovery::StartupReconciler,
        vps::{VpsService, VpsServiceArgs},
    },
    tunnel::TunnelRegistry,
    workers::heartbeat::{HeartbeatWorker, KilledTaskQueue, NodeIdentity, register_node},
};
use anyhow::Context;
use clap::Parser;
use kohakuriver_models::naming;
use std::{net::Ipv4Addr, path::Path, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

const REGISTRATION_ATTEMPTS: u32 = 5;

#[derive(Parser)]
struct Cli {
    /// Path to the runner configuration file.
    #[clap(long, short, env = "KOHAKURIVER_RUNNER_CONFIG")]
    config: std::path::PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let raw_config = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("reading config file {}", cli.config.display()))?;
    let config: RunnerConfig = serde_yaml::from_str(&raw_config).context("parsing config file")?;

    let hostname = resources::hostname()?;
    let advertise = advertise_address(&config)?;
    let runner_url = format!("http://{advertise}:{}", config.bind_endpoint.port());
    info!("Runner starting on {hostname}, advertising {runner_url}");

    tokio::fs::create_dir_all(config.local_temp_dir.join(".kohakuriver")).await.ok();
    tokio::fs::create_dir_all(config.shared_dir.join("shared_data")).await.ok();
    tokio::fs::create_dir_all(config.logs_dir()).await.ok();

    let docker: Arc<dyn DockerClient> = Arc::new(CliDockerClient);
    if let Err(e) = docker
        .ensure_network(
            &config.docker.network_name,
            &config.docker.network_subnet,
            &config.docker.network_gateway,
            None,
        )
        .await
    {
        warn!("Docker network check failed, tasks may not start: {e}");
    }

    let db_url = format!("sqlite://{}", config.state_db_path().display());
    let db = SqliteDb::connect(&db_url).await.context("opening runner state store")?;
    let records = Arc::new(SqliteTaskRecordRepository::new(db));

    let host: Arc<dyn HostApiClient> =
        Arc::new(HttpHostApiClient::new(config.host_base_url()).context("building host client")?);

    // VM capability is detected once and refreshed into heartbeats.
    let vm_capability = if config.vm.enabled { capability::detect().await } else { Default::default() };
    info!("VM capability: capable={}, vfio_gpus={}", vm_capability.vm_capable, vm_capability.vfio_gpus.len());
    let vm_capability = Arc::new(RwLock::new(vm_capability));

    let identity = NodeIdentity {
        hostname: hostname.clone(),
        url: runner_url.clone(),
        total_cores: resources::total_cores(),
        total_ram_bytes: resources::total_memory_bytes(),
        numa_topology: resources::detect_numa_topology(),
    };

    // Register with linear backoff before anything else; the overlay
    // block comes back with the response.
    let mut overlay_block = None;
    let mut registered = false;
    for attempt in 1..=REGISTRATION_ATTEMPTS {
        match register_node(&host, &identity, &vm_capability).await {
            Ok(response) => {
                overlay_block = response.overlay;
                registered = true;
                break;
            }
            Err(e) => {
                let wait = Duration::from_secs(5 * attempt as u64);
                warn!("Registration attempt {attempt}/{REGISTRATION_ATTEMPTS} failed: {e}, retrying in {wait:?}");
                tokio::time::sleep(wait).await;
            }
        }
    }
    if !registered {
        error!("Failed to register with host; continuing, heartbeats will keep retrying");
    }

    let runner_overlay = Arc::new(RunnerOverlayManager::new(
        config.overlay.base_vxlan_id,
        config.overlay.vxlan_port,
        config.overlay.mtu,
    ));
    if config.overlay.enabled {
        if let Some(block) = overlay_block {
            let physical_ip: Ipv4Addr = advertise.parse().context("advertise address must be an IPv4 address")?;
            match runner_overlay.setup(block, physical_ip, &docker).await {
                Ok(()) => info!("Overlay network ready"),
                Err(e) => warn!("Overlay setup failed, containers fall back to {}: {e}", config.docker.network_name),
            }
        }
    }

    let runner_public_key = load_or_create_runner_key(&config).await;

    let images = Arc::new(ImageSyncService::new(
        docker.clone(),
        config.container_tar_dir(),
        config.docker.image_sync_timeout,
    ));
    let vms = Arc::new(VmManager::new(VmManagerArgs {
        images_dir: config.vm.images_dir.clone(),
        instances_dir: config.vm.instances_dir.clone(),
        dns_servers: config.vm.dns_servers.clone(),
        shared_dir: config.shared_dir.clone(),
        local_temp_dir: config.local_temp_dir.clone(),
    }));

    let overlay_network = runner_overlay.is_configured().then(|| naming::OVERLAY_DOCKER_NETWORK.to_string());
    let executor = Arc::new(TaskExecutor::new(
        docker.clone(),
        images.clone(),
        records.clone(),
        host.clone(),
        ExecutorSettings {
            hostname: hostname.clone(),
            shared_dir: config.shared_dir.clone(),
            local_temp_dir: config.local_temp_dir.clone(),
            additional_mounts: config.additional_mounts.clone(),
            default_network: config.docker.network_name.clone(),
            overlay_network,
            tasks_privileged: config.docker.tasks_privileged,
            tunnel_url_base: format!("ws://{}:{}", config.docker.network_gateway, config.bind_endpoint.port()),
            numa_topology: identity.numa_topology.clone(),
        },
    ));
    let vps = Arc::new(VpsService::new(VpsServiceArgs {
        docker: docker.clone(),
        images,
        records: records.clone(),
        host: host.clone(),
        overlay: runner_overlay.clone(),
        vms: vms.clone(),
        capability: vm_capability.clone(),
        hostname: hostname.clone(),
        runner_public_key,
        runner_url: runner_url.clone(),
        default_network: config.docker.network_name.clone(),
    }));

    // Re-adopt or report whatever the previous process left behind.
    let reconciler = StartupReconciler {
        docker: docker.clone(),
        vms: vms.clone(),
        overlay: runner_overlay.clone(),
        records: records.clone(),
        host: host.clone(),
    };
    reconciler.run().await;

    let killed = Arc::new(KilledTaskQueue::default());
    HeartbeatWorker {
        host: host.clone(),
        records: records.clone(),
        vms: vms.clone(),
        capability: vm_capability,
        killed: killed.clone(),
        identity,
        interval: config.heartbeat.interval,
    }
    .spawn();

    let state = AppState {
        executor,
        vps,
        vms,
        records,
        tunnels: Arc::new(TunnelRegistry::default()),
        killed,
    };
    let router = routes::build_router(state);

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        // Containers and VMs stay up; the next startup re-adopts them.
        info!("Shutdown signal received, leaving workloads running");
        shutdown_handle.shutdown();
    });

    info!("Runner listening on {}", config.bind_endpoint);
    axum_server::bind(config.bind_endpoint)
        .handle(handle)
        .serve(router.into_make_service())
        .await
        .context("running API server")?;
    Ok(())
}

fn advertise_address(config: &RunnerConfig) -> anyhow::Result<String> {
    if let Some(address) = &config.advertise_address {
        return Ok(address.clone());
    }
    let bind = config.bind_endpoint.ip();
    if !bind.is_unspecified() {
        return Ok(bind.to_string());
    }
    // Bound to 0.0.0.0: discover the address used to reach the host.
    let host_endpoint = format!("{}:{}", config.host.address, config.host.port);
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").context("probing local address")?;
    socket.connect(&host_endpoint).with_context(|| format!("probing route to {host_endpoint}"))?;
    Ok(socket.local_addr().context("probing local address")?.ip().to_string())
}

/// The runner's own SSH identity, injected into VM guests so the runner
/// can probe them. Created on first start.
async fn load_or_create_runner_key(config: &RunnerConfig) -> Option<String> {
    let key_path = config.local_temp_dir.join(".kohakuriver/runner_key");
    let pub_path = key_path.with_extension("pub");
    if !Path::new(&pub_path).exists() {
        let path = key_path.display().to_string();
        let result = run_command(
            "ssh-keygen",
            &["-t", "ed25519", "-N", "", "-f", &path, "-C", "kohakuriver-runner"],
            Duration::from_secs(15),
        )
        .await;
        if let Err(e) = result {
            warn!("Cannot create runner SSH key, VM probing disabled: {e}");
            return None;
        }
    }
    match tokio::fs::read_to_string(&pub_path).await {
        Ok(key) => Some(key.trim().to_string()),
        Err(e) => {
            warn!("Cannot read runner SSH key: {e}");
            None
        }
    }
}

async fn wait_for_shutdown_signal() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
