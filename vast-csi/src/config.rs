//! Process configuration.
//!
//! Parsed once at startup via `clap::Parser`, exactly as the upstream
//! driver's `Args` struct is built. Every option named in the external
//! interfaces list is a field here, each with a CLI flag and an env var
//! fallback.

use std::fmt;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    Controller,
    Node,
    ControllerAndNode,
}

impl Mode {
    pub fn has_controller(self) -> bool {
        matches!(self, Mode::Controller | Mode::ControllerAndNode)
    }

    pub fn has_node(self) -> bool {
        matches!(self, Mode::Node | Mode::ControllerAndNode)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
#[value(rename_all = "lowercase")]
pub enum LoadBalancing {
    #[default]
    Roundrobin,
    Random,
}

impl fmt::Display for LoadBalancing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoadBalancing::Roundrobin => "roundrobin",
            LoadBalancing::Random => "random",
        };
        write!(f, "{s}")
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "vast-csi")]
#[command(about = "CSI driver for VAST Data NFS-backed persistent volumes")]
pub struct Config {
    /// gRPC listen address, typically a unix socket path
    #[arg(long, env = "CSI_ENDPOINT", default_value = "unix:///var/run/csi/csi.sock")]
    pub endpoint: String,

    /// Which CSI services this process registers
    #[arg(long, env = "VAST_CSI_MODE", value_enum, default_value = "controller-and-node")]
    pub mode: Mode,

    /// Identity reported by NodeGetInfo
    #[arg(long, env = "CSI_NODE_ID")]
    pub node_id: Option<String>,

    #[arg(long, env = "VAST_CSI_PLUGIN_NAME", default_value = "csi.vastdata.com")]
    pub plugin_name: String,

    #[arg(long, env = "VAST_CSI_PLUGIN_VERSION", default_value = env!("CARGO_PKG_VERSION"))]
    pub plugin_version: String,

    #[arg(long, env = "VAST_CSI_GIT_COMMIT", default_value = "unknown")]
    pub git_commit: String,

    /// gRPC server worker pool size
    #[arg(long, env = "VAST_CSI_WORKER_THREADS", default_value_t = 4)]
    pub worker_threads: usize,

    #[arg(long, env = "VAST_CSI_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Base URL of the VMS REST management API
    #[arg(long, env = "VAST_CSI_VMS_ENDPOINT")]
    pub vms_endpoint: Option<String>,

    /// Verify the VMS TLS certificate
    #[arg(long, env = "VAST_CSI_SSL_VERIFY", default_value_t = true)]
    pub ssl_verify: bool,

    /// Path to a trusted CA bundle for the VMS connection
    #[arg(long, env = "VAST_CSI_VMS_SSL_CERT")]
    pub vms_ssl_cert: Option<PathBuf>,

    /// VMS username, or "user:pass" pair; see `vms_credentials_file`
    #[arg(long, env = "VAST_CSI_VMS_CREDENTIALS")]
    pub vms_credentials: Option<String>,

    /// Path to a file holding "user:pass", read once at startup
    #[arg(long, env = "VAST_CSI_VMS_CREDENTIALS_FILE")]
    pub vms_credentials_file: Option<PathBuf>,

    /// Default volume name template: fields {namespace}, {name}, {id}
    #[arg(long, env = "VAST_CSI_NAME_FMT", default_value = "{id}")]
    pub name_fmt: String,

    /// Default snapshot name template
    #[arg(long, env = "VAST_CSI_SNAPSHOT_NAME_FMT", default_value = "{id}")]
    pub snapshot_name_fmt: String,

    /// Ephemeral volume name template: fields {namespace}, {name}, {uid}
    #[arg(long, env = "VAST_CSI_EPH_VOLUME_NAME_FMT", default_value = "csi-eph-{namespace}-{name}-{uid}")]
    pub eph_volume_name_fmt: String,

    #[arg(long, env = "VAST_CSI_LOAD_BALANCING", value_enum, default_value = "roundrobin")]
    pub load_balancing: LoadBalancing,

    /// Default mount options, comma-separated
    #[arg(long, env = "VAST_CSI_MOUNT_OPTIONS", value_delimiter = ',')]
    pub mount_options: Vec<String>,

    /// Bounded retry count for NodeUnpublishVolume's unmount loop
    #[arg(long, env = "VAST_CSI_UNMOUNT_ATTEMPTS", default_value_t = 3)]
    pub unmount_attempts: u32,

    /// View policy used by the client-mount deletion path
    #[arg(long, env = "VAST_CSI_DELETION_VIEW_POLICY", default_value = "csi-deletion")]
    pub deletion_view_policy: String,

    /// VIP pool used by the client-mount deletion path
    #[arg(long, env = "VAST_CSI_DELETION_VIP_POOL", default_value = "csi-deletion")]
    pub deletion_vip_pool: String,

    /// Root export path under which quota leaf directories are relative
    #[arg(long, env = "VAST_CSI_SANITY_TEST_NFS_EXPORT")]
    pub sanity_test_nfs_export: Option<String>,

    /// Mock-mode: on-disk directory holding one file per fake quota
    #[arg(long, env = "VAST_CSI_FAKE_QUOTA_STORE")]
    pub fake_quota_store: Option<PathBuf>,

    /// Mock-mode: on-disk directory holding one file per fake snapshot
    #[arg(long, env = "VAST_CSI_FAKE_SNAPSHOT_STORE")]
    pub fake_snapshot_store: Option<PathBuf>,

    /// Run entirely against local fake stores, no VMS calls
    #[arg(long, env = "VAST_CSI_MOCK_VAST", default_value_t = false)]
    pub mock_vast: bool,

    /// Relax validation for the external CSI sanity test suite
    #[arg(long, env = "VAST_CSI_CSI_SANITY_TEST", default_value_t = false)]
    pub csi_sanity_test: bool,

    /// Prometheus metrics listen address, e.g. "0.0.0.0:9090"
    #[arg(long, env = "VAST_CSI_METRICS_ADDR")]
    pub metrics_addr: Option<String>,
}

impl Config {
    pub fn resolved_node_id(&self) -> String {
        self.node_id.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown-node".to_string())
        })
    }

    /// Read `vms_credentials`, falling back to the contents of
    /// `vms_credentials_file` when the inline value is absent.
    pub fn resolve_vms_credentials(&self) -> anyhow::Result<Option<String>> {
        if let Some(v) = &self.vms_credentials {
            return Ok(Some(v.clone()));
        }
        if let Some(path) = &self.vms_credentials_file {
            let contents = std::fs::read_to_string(path)?;
            return Ok(Some(contents.trim().to_string()));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_flags() {
        assert!(Mode::Controller.has_controller());
        assert!(!Mode::Controller.has_node());
        assert!(Mode::Node.has_node());
        assert!(!Mode::Node.has_controller());
        assert!(Mode::ControllerAndNode.has_controller());
        assert!(Mode::ControllerAndNode.has_node());
    }

    #[test]
    fn load_balancing_display() {
        assert_eq!(LoadBalancing::Roundrobin.to_string(), "roundrobin");
        assert_eq!(LoadBalancing::Random.to_string(), "random");
    }
}
