//! The CPU device-plugin daemon: one device-plugin server per non-default
//! pool, re-registered whenever the kubelet restarts.

use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};

use clap::Parser;
use notify::Watcher;
use tokio::signal::unix::{signal, SignalKind};

use cpu_pooler::{
    core::pool::{read_pool_config, PoolConfig, POOL_CONFIG_DIR},
    deviceplugin::{DEVICE_PLUGIN_PATH, KUBELET_SOCKET},
    k8s,
    plugin::PluginSupervisor,
};

#[derive(Debug, Parser)]
#[command(
    name = "cpu-device-plugin",
    about = "Advertises CPU pools as schedulable node resources"
)]
struct Args {
    /// Path to the pool configuration files.
    #[arg(long, default_value = POOL_CONFIG_DIR)]
    poolconfigs: PathBuf,
    /// Path to a kubeconfig; only required out-of-cluster.
    #[arg(long)]
    kubeconfig: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    pretty_env_logger::init_timed();
    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("cpu-device-plugin exiting: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> cpu_pooler::Result<()> {
    let client = k8s::client(args.kubeconfig.as_deref()).await?;
    let pool_config = load_pool_config(&client, &args.poolconfigs).await?;

    let mut supervisor = PluginSupervisor::new();
    supervisor.start(&pool_config).await?;

    // The kubelet recreates its registration socket on restart; any event
    // on it means every plugin has to re-register from scratch.
    let (fs_tx, mut fs_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |event: Result<notify::Event, notify::Error>| {
        let _ = fs_tx.send(event);
    })
    .map_err(cpu_pooler::plugin::PluginError::from)?;
    watcher
        .watch(Path::new(DEVICE_PLUGIN_PATH), notify::RecursiveMode::NonRecursive)
        .map_err(cpu_pooler::plugin::PluginError::from)?;

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;
    let mut sighup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = sigint.recv() => break,
            _ = sigterm.recv() => break,
            _ = sigquit.recv() => break,
            _ = sighup.recv() => {
                log::info!("received SIGHUP");
            }
            event = fs_rx.recv() => {
                let Some(event) = event else { break };
                if !concerns_kubelet_socket(&event) {
                    continue;
                }
                log::info!("kubelet socket changed, reinitializing all pool servers");
                supervisor.stop().await;
                let pool_config = load_pool_config(&client, &args.poolconfigs).await?;
                supervisor = PluginSupervisor::new();
                supervisor.start(&pool_config).await?;
            }
        }
    }

    log::info!("received termination signal, shutting down");
    supervisor.stop().await;
    Ok(())
}

async fn load_pool_config(
    client: &kube::Client,
    config_dir: &Path,
) -> cpu_pooler::Result<PoolConfig> {
    let labels = k8s::node_labels(client).await?;
    let (pool_config, path) = read_pool_config(config_dir, labels.as_ref())?;
    log::info!("pool configuration read from {}", path.display());
    Ok(pool_config)
}

fn concerns_kubelet_socket(event: &Result<notify::Event, notify::Error>) -> bool {
    match event {
        Ok(event) => event
            .paths
            .iter()
            .any(|path| path.file_name().is_some_and(|name| name == KUBELET_SOCKET)),
        // a broken watch is indistinguishable from a socket change
        Err(_) => true,
    }
}
