//! CSI Identity service.
//!
//! Reports plugin identity and capabilities, and answers `Probe` according
//! to which services this process registers: a node-only process is always
//! ready once started, a controller-only process must be able to reach the
//! VMS (fetch a VIP) to call itself ready, and mock mode is always ready.

use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::config::{Config, LoadBalancing};
use crate::csi;
use crate::vms::VmsSession;

pub struct IdentityService {
    config: Arc<Config>,
    vms: Option<Arc<dyn VmsSession>>,
}

impl IdentityService {
    pub fn new(config: Arc<Config>, vms: Option<Arc<dyn VmsSession>>) -> Self {
        Self { config, vms }
    }
}

#[tonic::async_trait]
impl csi::identity_server::Identity for IdentityService {
    async fn get_plugin_info(
        &self,
        _request: Request<csi::GetPluginInfoRequest>,
    ) -> Result<Response<csi::GetPluginInfoResponse>, Status> {
        Ok(Response::new(csi::GetPluginInfoResponse {
            name: self.config.plugin_name.clone(),
            vendor_version: self.config.plugin_version.clone(),
            manifest: std::collections::HashMap::new(),
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<csi::GetPluginCapabilitiesRequest>,
    ) -> Result<Response<csi::GetPluginCapabilitiesResponse>, Status> {
        let mut capabilities = vec![csi::PluginCapability {
            r#type: Some(csi::plugin_capability::Type::VolumeExpansion(
                csi::plugin_capability::VolumeExpansion {
                    r#type: csi::plugin_capability::volume_expansion::Type::Online as i32,
                },
            )),
        }];
        if self.config.mode.has_controller() {
            capabilities.push(csi::PluginCapability {
                r#type: Some(csi::plugin_capability::Type::Service(
                    csi::plugin_capability::Service {
                        r#type: csi::plugin_capability::service::Type::ControllerService as i32,
                    },
                )),
            });
        }
        Ok(Response::new(csi::GetPluginCapabilitiesResponse { capabilities }))
    }

    /// READY when Node is configured (nothing remote to check); when only
    /// Controller is configured, READY iff a VIP can be fetched from the
    /// VMS; when mocked, always READY.
    async fn probe(
        &self,
        _request: Request<csi::ProbeRequest>,
    ) -> Result<Response<csi::ProbeResponse>, Status> {
        if self.config.mock_vast || self.config.mode.has_node() {
            return Ok(Response::new(csi::ProbeResponse { ready: Some(true) }));
        }

        let vms = self
            .vms
            .as_ref()
            .ok_or_else(|| Status::failed_precondition("VMS session not configured"))?;
        let pool = &self.config.deletion_vip_pool;
        match vms.get_vip(pool, LoadBalancing::Roundrobin, 0).await {
            Ok(_) => Ok(Response::new(csi::ProbeResponse { ready: Some(true) })),
            Err(err) => Err(Status::failed_precondition(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;
    use csi::identity_server::Identity;

    fn config(mode: Mode, mock: bool) -> Arc<Config> {
        Arc::new(Config {
            endpoint: "unix:///tmp/csi.sock".to_string(),
            mode,
            node_id: Some("node-1".to_string()),
            plugin_name: "csi.vastdata.com".to_string(),
            plugin_version: "1.2.3".to_string(),
            git_commit: "test".to_string(),
            worker_threads: 4,
            log_level: "info".to_string(),
            vms_endpoint: None,
            ssl_verify: true,
            vms_ssl_cert: None,
            vms_credentials: None,
            vms_credentials_file: None,
            name_fmt: "{id}".to_string(),
            snapshot_name_fmt: "{id}".to_string(),
            eph_volume_name_fmt: "csi-eph-{namespace}-{name}-{uid}".to_string(),
            load_balancing: crate::config::LoadBalancing::Roundrobin,
            mount_options: vec![],
            unmount_attempts: 3,
            deletion_view_policy: "csi-deletion".to_string(),
            deletion_vip_pool: "csi-deletion".to_string(),
            sanity_test_nfs_export: Some("/k8s".to_string()),
            fake_quota_store: None,
            fake_snapshot_store: None,
            mock_vast: mock,
            csi_sanity_test: false,
            metrics_addr: None,
        })
    }

    #[tokio::test]
    async fn plugin_info_comes_from_config() {
        let service = IdentityService::new(config(Mode::Node, false), None);
        let response = Identity::get_plugin_info(&service, Request::new(csi::GetPluginInfoRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.name, "csi.vastdata.com");
        assert_eq!(response.vendor_version, "1.2.3");
    }

    #[tokio::test]
    async fn controller_service_capability_only_when_controller_configured() {
        let node_only = IdentityService::new(config(Mode::Node, false), None);
        let caps = Identity::get_plugin_capabilities(&node_only, Request::new(csi::GetPluginCapabilitiesRequest {}))
            .await
            .unwrap()
            .into_inner()
            .capabilities;
        assert_eq!(caps.len(), 1);

        let both = IdentityService::new(config(Mode::ControllerAndNode, false), None);
        let caps = Identity::get_plugin_capabilities(&both, Request::new(csi::GetPluginCapabilitiesRequest {}))
            .await
            .unwrap()
            .into_inner()
            .capabilities;
        assert_eq!(caps.len(), 2);
    }

    #[tokio::test]
    async fn probe_always_ready_in_mock_mode() {
        let service = IdentityService::new(config(Mode::Controller, true), None);
        let response = Identity::probe(&service, Request::new(csi::ProbeRequest {})).await.unwrap();
        assert_eq!(response.into_inner().ready, Some(true));
    }

    #[tokio::test]
    async fn probe_always_ready_when_node_configured() {
        let service = IdentityService::new(config(Mode::ControllerAndNode, false), None);
        let response = Identity::probe(&service, Request::new(csi::ProbeRequest {})).await.unwrap();
        assert_eq!(response.into_inner().ready, Some(true));
    }

    #[tokio::test]
    async fn probe_checks_vms_when_controller_only() {
        let dir = tempfile::tempdir().unwrap();
        let vms: Arc<dyn VmsSession> = Arc::new(
            crate::vms::TestSession::new(
                dir.path().join("quotas"),
                dir.path().join("snapshots"),
                "10.0.0.5".to_string(),
                Some("/k8s".to_string()),
            )
            .unwrap(),
        );
        let service = IdentityService::new(config(Mode::Controller, false), Some(vms));
        let response = Identity::probe(&service, Request::new(csi::ProbeRequest {})).await.unwrap();
        assert_eq!(response.into_inner().ready, Some(true));
    }
}
