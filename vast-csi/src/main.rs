//! VAST CSI Driver
//!
//! Kubernetes CSI driver that implements the Container Storage Interface
//! against VAST Data's VMS, presenting NFS-backed exports as CSI volumes.

use std::sync::Arc;

use clap::Parser;
use tonic::transport::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vast_csi::config::Config;
use vast_csi::csi::controller_server::ControllerServer;
use vast_csi::csi::identity_server::IdentityServer;
use vast_csi::csi::node_server::NodeServer;
use vast_csi::vms::{RestSession, TestSession, VmsSession};
use vast_csi::{ControllerService, IdentityService, NodeService};

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn build_vms(config: &Config) -> anyhow::Result<Arc<dyn VmsSession>> {
    if config.mock_vast {
        let quota_store = config
            .fake_quota_store
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("vast-csi-quotas"));
        let snapshot_store = config
            .fake_snapshot_store
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("vast-csi-snapshots"));
        let nfs_server = config.vms_endpoint.clone().unwrap_or_else(|| "127.0.0.1".to_string());
        return Ok(Arc::new(TestSession::new(
            quota_store,
            snapshot_store,
            nfs_server,
            config.sanity_test_nfs_export.clone(),
        )?));
    }

    let base_url = config
        .vms_endpoint
        .clone()
        .ok_or_else(|| anyhow::anyhow!("--vms-endpoint is required unless --mock-vast is set"))?;
    let ca_cert_pem = config
        .vms_ssl_cert
        .as_ref()
        .map(std::fs::read)
        .transpose()?;
    let credentials = config.resolve_vms_credentials()?;
    let session = RestSession::new(
        base_url,
        config.ssl_verify,
        ca_cert_pem,
        credentials,
        config.sanity_test_nfs_export.clone(),
    )?;
    // Obtain the bearer token once at session start, per the session's
    // "called once at session start; re-called on auth failure" contract.
    session.refresh_auth_token().await?;
    Ok(Arc::new(session))
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let vms = build_vms(&config).await?;

    if let Some(addr) = &config.metrics_addr {
        vast_csi::metrics::init_metrics(addr)?;
    }

    let controller = config
        .mode
        .has_controller()
        .then(|| Arc::new(ControllerService::new(vms.clone(), config.clone())));

    let identity = IdentityService::new(config.clone(), Some(vms.clone()));

    let node = config.mode.has_node().then(|| NodeService::new(config.clone(), controller.clone()));

    let path = config
        .endpoint
        .strip_prefix("unix://")
        .unwrap_or(&config.endpoint)
        .to_string();

    match std::fs::remove_file(&path) {
        Ok(()) => info!(socket = %path, "removed stale CSI socket"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    if let Some(parent) = std::path::Path::new(&path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = tokio::net::UnixListener::bind(&path)?;
    let incoming = tokio_stream::wrappers::UnixListenerStream::new(listener);

    info!(
        endpoint = %config.endpoint,
        mode = ?config.mode,
        node_id = %config.resolved_node_id(),
        plugin_version = %config.plugin_version,
        git_commit = %config.git_commit,
        "starting vast-csi"
    );

    let mut builder = Server::builder().add_service(IdentityServer::new(identity));
    if let Some(controller) = controller {
        // `from_arc` lets the same `ControllerService` back both the gRPC
        // server and the Node service's in-process ephemeral-volume calls.
        builder = builder.add_service(ControllerServer::from_arc(controller));
    }
    if let Some(node) = node {
        builder = builder.add_service(NodeServer::new(node));
    }

    builder.serve_with_incoming(incoming).await?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    init_tracing(&config.log_level);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .enable_all()
        .build()?;

    runtime.block_on(serve(config))
}
