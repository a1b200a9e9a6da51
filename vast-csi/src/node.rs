//! CSI Node service.
//!
//! Implements the NFS publish/unpublish state machine on the node host:
//! idempotent mount, bind-to-target reconciliation, ephemeral-volume inline
//! provisioning (via direct calls into [`ControllerService`]'s `*_impl`
//! methods, never over gRPC), and stuck-unmount recovery.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tonic::{Request, Response, Status};
use tracing::{info, warn};

use crate::config::Config;
use crate::controller::ControllerService;
use crate::csi;
use crate::dispatcher::{instrument, require_fields};
use crate::error::{DriverError, DriverResult};
use crate::mount;
use crate::quantity;

const EPHEMERAL_KEY: &str = "csi.storage.k8s.io/ephemeral";
const SIDECAR_NAME: &str = ".vast-csi-meta";

/// Persisted at `<target_path>/.vast-csi-meta`, surviving node restarts so
/// `NodeUnpublishVolume` knows whether to delete an ephemeral volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Sidecar {
    volume_id: String,
    is_ephemeral: bool,
}

pub struct NodeService {
    config: Arc<Config>,
    /// Present when this process also registers the Controller service, or
    /// when standalone Node mode is configured with inline controller
    /// access for ephemeral volumes. `None` means ephemeral volumes are
    /// rejected.
    controller: Option<Arc<ControllerService>>,
}

impl NodeService {
    pub fn new(config: Arc<Config>, controller: Option<Arc<ControllerService>>) -> Self {
        Self { config, controller }
    }

    fn sidecar_path(target_path: &str) -> PathBuf {
        Path::new(target_path).join(SIDECAR_NAME)
    }

    fn write_sidecar(target_path: &str, sidecar: &Sidecar) -> DriverResult<()> {
        let bytes = serde_json::to_vec(sidecar)?;
        std::fs::write(Self::sidecar_path(target_path), bytes)?;
        Ok(())
    }

    fn read_sidecar(target_path: &str) -> Option<Sidecar> {
        let bytes = std::fs::read(Self::sidecar_path(target_path)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    fn parse_mount_options(raw: &str) -> Vec<String> {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Resolve the ephemeral inline volume's `CreateVolume` + `ControllerPublishVolume`
    /// request, then run both in-process against the shared Controller.
    async fn publish_ephemeral(
        &self,
        req: &csi::NodePublishVolumeRequest,
    ) -> DriverResult<HashMap<String, String>> {
        let controller = self.controller.as_ref().ok_or_else(|| {
            DriverError::InvalidArgument("ephemeral volumes require the Controller service".to_string())
        })?;

        let namespace = req
            .volume_context
            .get("csi.storage.k8s.io/pod.namespace")
            .cloned()
            .unwrap_or_default();
        let pod_name = req
            .volume_context
            .get("csi.storage.k8s.io/pod.name")
            .cloned()
            .unwrap_or_default();
        let pod_uid = req
            .volume_context
            .get("csi.storage.k8s.io/pod.uid")
            .cloned()
            .unwrap_or_default();

        let volume_name = crate::builders::format_ephemeral_name(
            &self.config.eph_volume_name_fmt,
            &namespace,
            &pod_name,
            &pod_uid,
        );

        let capacity_bytes = match req.volume_context.get("size") {
            Some(size) => quantity::parse_bytes(size)
                .map_err(|e| DriverError::InvalidArgument(e.to_string()))?,
            None => 0,
        };

        let mut parameters: HashMap<String, String> = req.volume_context.clone();
        parameters.insert(EPHEMERAL_KEY.to_string(), "true".to_string());

        let create_req = csi::CreateVolumeRequest {
            name: volume_name,
            capacity_range: (capacity_bytes > 0).then_some(csi::CapacityRange {
                required_bytes: capacity_bytes,
                limit_bytes: 0,
            }),
            volume_capabilities: req.volume_capability.clone().into_iter().collect(),
            parameters,
            secrets: req.secrets.clone(),
            volume_content_source: None,
            accessibility_requirements: vec![],
        };
        let volume = controller.create_volume_impl(&create_req).await?;

        let publish_req = csi::ControllerPublishVolumeRequest {
            volume_id: volume.volume_id,
            node_id: self.config.resolved_node_id(),
            volume_capability: req.volume_capability.clone(),
            readonly: req.readonly,
            secrets: req.secrets.clone(),
            volume_context: volume.volume_context,
        };
        controller.controller_publish_volume_impl(&publish_req).await
    }

    async fn node_publish_volume_impl(&self, req: &csi::NodePublishVolumeRequest) -> DriverResult<()> {
        let is_ephemeral = req
            .volume_context
            .get(EPHEMERAL_KEY)
            .map(|v| v == "true")
            .unwrap_or(false);

        let (publish_context, volume_context): (HashMap<String, String>, HashMap<String, String>) =
            if is_ephemeral {
                (self.publish_ephemeral(req).await?, req.volume_context.clone())
            } else {
                if req.volume_capability.is_none() {
                    return Err(DriverError::InvalidArgument("volume_capability is required".to_string()));
                }
                (req.publish_context.clone(), req.volume_context.clone())
            };

        let nfs_server_ip = publish_context
            .get("nfs_server_ip")
            .ok_or_else(|| DriverError::InvalidArgument("publish_context missing nfs_server_ip".to_string()))?;
        let export_path = if volume_context.get("schema").map(String::as_str) == Some("2") {
            volume_context
                .get("export_path")
                .ok_or_else(|| DriverError::InvalidArgument("volume_context missing export_path".to_string()))?
        } else {
            publish_context
                .get("export_path")
                .ok_or_else(|| DriverError::InvalidArgument("publish_context missing export_path".to_string()))?
        };
        let mount_spec = format!("{nfs_server_ip}:{export_path}");

        let target = Path::new(&req.target_path);
        if target.is_dir() {
            if let Some(record) = mount::current_mount(target) {
                let readonly = record.opts.iter().any(|o| o == "ro");
                if record.device == mount_spec && readonly == req.readonly {
                    info!(target_path = %req.target_path, "already published, no-op");
                    return Ok(());
                }
                return Err(DriverError::VolumeAlreadyExists(format!(
                    "{} is mounted from {} (readonly={}), requested {} (readonly={})",
                    req.target_path, record.device, readonly, mount_spec, req.readonly
                )));
            }
        }

        std::fs::create_dir_all(target)?;
        Self::write_sidecar(
            &req.target_path,
            &Sidecar {
                volume_id: req.volume_id.clone(),
                is_ephemeral,
            },
        )?;

        let mut flags = Vec::new();
        if req.readonly {
            flags.push("ro".to_string());
        }
        let extra = match req.volume_capability.as_ref().and_then(|c| c.access_type.as_ref()) {
            Some(csi::volume_capability::AccessType::Mount(m)) if !m.mount_flags.is_empty() => {
                m.mount_flags.clone()
            }
            _ => volume_context
                .get("mount_options")
                .map(|s| Self::parse_mount_options(s))
                .unwrap_or_default(),
        };
        flags.extend(extra);

        mount::mount(&mount_spec, target, &flags)?;
        Ok(())
    }

    async fn node_unpublish_volume_impl(&self, req: &csi::NodeUnpublishVolumeRequest) -> DriverResult<()> {
        let target = Path::new(&req.target_path);
        if !target.exists() {
            return Ok(());
        }

        let mut attempts = 0;
        loop {
            if !mount::is_mounted(target) {
                break;
            }
            if attempts >= self.config.unmount_attempts {
                return Err(DriverError::Other(anyhow::anyhow!(
                    "stuck in unmount loop at {}",
                    req.target_path
                )));
            }
            mount::unmount(target)?;
            attempts += 1;
        }

        if let Some(sidecar) = Self::read_sidecar(&req.target_path)
            && sidecar.is_ephemeral
        {
            if let Some(controller) = &self.controller {
                controller.delete_volume_impl(&sidecar.volume_id).await?;
            } else {
                warn!(volume_id = %sidecar.volume_id, "ephemeral volume cleanup skipped: no Controller configured");
            }
        }

        let _ = std::fs::remove_file(Self::sidecar_path(&req.target_path));
        std::fs::remove_dir(target)?;
        Ok(())
    }
}

#[tonic::async_trait]
impl csi::node_server::Node for NodeService {
    async fn node_stage_volume(
        &self,
        _request: Request<csi::NodeStageVolumeRequest>,
    ) -> Result<Response<csi::NodeStageVolumeResponse>, Status> {
        Err(Status::unimplemented("staging is not supported; volumes publish directly"))
    }

    async fn node_unstage_volume(
        &self,
        _request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        Err(Status::unimplemented("staging is not supported; volumes publish directly"))
    }

    async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> Result<Response<csi::NodePublishVolumeResponse>, Status> {
        let req = request.into_inner();
        require_fields(&[
            ("volume_id", !req.volume_id.is_empty()),
            ("target_path", !req.target_path.is_empty()),
        ])
        .map_err(|e| crate::dispatcher::map_error("NodePublishVolume", e))?;

        instrument("NodePublishVolume", &req.target_path.clone(), async {
            self.node_publish_volume_impl(&req).await?;
            Ok(csi::NodePublishVolumeResponse {})
        })
        .await
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        require_fields(&[
            ("volume_id", !req.volume_id.is_empty()),
            ("target_path", !req.target_path.is_empty()),
        ])
        .map_err(|e| crate::dispatcher::map_error("NodeUnpublishVolume", e))?;

        instrument("NodeUnpublishVolume", &req.target_path.clone(), async {
            self.node_unpublish_volume_impl(&req).await?;
            Ok(csi::NodeUnpublishVolumeResponse {})
        })
        .await
    }

    async fn node_get_volume_stats(
        &self,
        _request: Request<csi::NodeGetVolumeStatsRequest>,
    ) -> Result<Response<csi::NodeGetVolumeStatsResponse>, Status> {
        Err(Status::unimplemented("NodeGetVolumeStats is not supported"))
    }

    async fn node_expand_volume(
        &self,
        _request: Request<csi::NodeExpandVolumeRequest>,
    ) -> Result<Response<csi::NodeExpandVolumeResponse>, Status> {
        Err(Status::unimplemented("node-side expansion is not supported"))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        instrument("NodeGetCapabilities", "", async {
            Ok(csi::NodeGetCapabilitiesResponse { capabilities: vec![] })
        })
        .await
    }

    async fn node_get_info(
        &self,
        _request: Request<csi::NodeGetInfoRequest>,
    ) -> Result<Response<csi::NodeGetInfoResponse>, Status> {
        instrument("NodeGetInfo", "", async {
            Ok(csi::NodeGetInfoResponse {
                node_id: self.config.resolved_node_id(),
                max_volumes_per_node: 0,
                accessible_topology: None,
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mount_options_splits_and_trims() {
        assert_eq!(
            NodeService::parse_mount_options("nfsvers=4, hard , "),
            vec!["nfsvers=4".to_string(), "hard".to_string()]
        );
    }

    #[test]
    fn sidecar_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("vol");
        std::fs::create_dir_all(&target).unwrap();
        let target_str = target.to_str().unwrap();
        NodeService::write_sidecar(
            target_str,
            &Sidecar {
                volume_id: "pvc-abc".to_string(),
                is_ephemeral: true,
            },
        )
        .unwrap();
        let read = NodeService::read_sidecar(target_str).unwrap();
        assert_eq!(read.volume_id, "pvc-abc");
        assert!(read.is_ephemeral);
    }

    #[test]
    fn read_sidecar_absent_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(NodeService::read_sidecar(dir.path().to_str().unwrap()).is_none());
    }
}
