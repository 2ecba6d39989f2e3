//! vxnet node daemon
//!
//! Brings up the local VXLAN endpoint, writes the CNI network config,
//! advertises the endpoint on the Node object and then keeps forwarding
//! entries for every other node in sync with the cluster.

mod bootstrap;
mod cli;
mod cniconf;
mod config;
mod error;
mod node;
mod sync;
mod watch;

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use k8s_openapi::api::core::v1::Node;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vxnet_link::NetlinkFabric;

use cli::Cli;
use config::Config;
use error::DaemonError;
use sync::DirectorySync;

const EVENT_QUEUE: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    let client = connect(&config.kube.kubeconfig).await?;
    let node_name = node::resolve_node_name(&client, &config.node).await?;
    let nodes: Api<Node> = Api::all(client.clone());
    let local = nodes
        .get(&node_name)
        .await
        .with_context(|| format!("Failed to fetch node {}", node_name))?;
    let pod_cidr = node::pod_cidr(&local)?;
    info!(node = %node_name, pod_cidr = %pod_cidr, "starting vxnetd");

    let fabric = NetlinkFabric::new().context("Failed to open netlink connection")?;
    let overlay = bootstrap::bootstrap(&fabric, &config.overlay, pod_cidr).await?;
    info!(
        device = %overlay.device,
        mac = %overlay.mac,
        anchor = %overlay.anchor,
        mtu = overlay.mtu,
        "overlay ready"
    );

    let conf = cniconf::render(&config.cni, pod_cidr, overlay.mtu, &overlay.egress);
    cniconf::write(&config.cni.conf_path, &conf).await?;
    info!(path = %config.cni.conf_path.display(), "wrote CNI network config");

    node::publish(&nodes, &local, &overlay).await?;

    let (tx, rx) = mpsc::channel(EVENT_QUEUE);
    let watcher = tokio::spawn(watch::watch_nodes(
        nodes,
        node_name,
        tx,
        cancel.clone(),
    ));
    let stats = DirectorySync::new(&fabric, overlay.device.clone())
        .run(rx, cancel.clone())
        .await;

    cancel.cancel();
    if let Err(e) = watcher.await {
        warn!(error = %e, "node watch task ended abnormally");
    }
    info!(
        applied = stats.applied,
        removed = stats.removed,
        failed = stats.failed,
        "vxnetd stopped"
    );
    Ok(())
}

/// Client from `kubeconfig` when it exists, otherwise inferred from the
/// environment (in-cluster service account)
async fn connect(kubeconfig: &Path) -> Result<Client, DaemonError> {
    if !kubeconfig.exists() {
        return Ok(Client::try_default().await?);
    }

    let kubeconfig_error = |e: &dyn std::fmt::Display| DaemonError::Kubeconfig {
        path: kubeconfig.to_path_buf(),
        details: e.to_string(),
    };
    let raw = Kubeconfig::read_from(kubeconfig).map_err(|e| kubeconfig_error(&e))?;
    let config = kube::Config::from_custom_kubeconfig(raw, &KubeConfigOptions::default())
        .await
        .map_err(|e| kubeconfig_error(&e))?;
    Ok(Client::try_from(config)?)
}

async fn shutdown_on_signal(cancel: CancellationToken) {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM");
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
    info!("shutdown requested");
    cancel.cancel();
}
