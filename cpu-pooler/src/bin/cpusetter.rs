//! The cpusetter daemon: watches pods on this node and rewrites their
//! containers' cpuset cgroups to the configured pools.

use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::Parser;

use cpu_pooler::{
    core::pool::read_pool_config,
    k8s,
    setter::{SetHandler, SetterError},
};

#[derive(Debug, Parser)]
#[command(name = "cpusetter", about = "CPU pool cpuset controller for one node")]
struct Args {
    /// Path to the pool configuration files.
    #[arg(long)]
    poolconfigs: PathBuf,
    /// Root of the cgroupfs hierarchy where the runtime creates pod cpusets.
    #[arg(long)]
    cpusetroot: PathBuf,
    /// Path to a kubeconfig; only required out-of-cluster.
    #[arg(long)]
    kubeconfig: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    pretty_env_logger::init_timed();
    let args = Args::parse();
    match run(args).await {
        Ok(()) => {
            log::info!("orchestrator initiated graceful shutdown, see you soon");
            ExitCode::SUCCESS
        }
        Err(err) => {
            log::error!("cpusetter exiting: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> cpu_pooler::Result<()> {
    let client = k8s::client(args.kubeconfig.as_deref()).await?;
    let labels = k8s::node_labels(&client).await?;
    let (pool_config, config_path) = read_pool_config(&args.poolconfigs, labels.as_ref())?;
    log::info!(
        "cpusetter controller starting with pool config {}",
        config_path.display()
    );

    let handler = Arc::new(SetHandler::new(client, pool_config, args.cpusetroot)?);

    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        // the controller only ever returns on a non-recoverable failure;
        // exiting lets the supervisor restart us with fresh watches
        result = handler.run() => {
            result?;
            Err(SetterError::ControllerStopped.into())
        }
        _ = sigint.recv() => Ok(()),
        _ = sigterm.recv() => Ok(()),
    }
}
