//! CSI Controller service.
//!
//! Drives volume builders on create, the two-strategy deletion path on
//! delete, quota expansion, snapshot lifecycle, and CSI-paginated listing.
//! Every RPC's business logic lives in a `*_impl` method so the ephemeral
//! publish path in `node.rs` can call `create_volume_impl`/
//! `controller_publish_volume_impl` directly, in-process, bypassing gRPC —
//! the dispatcher wraps only the outer RPC entry point.

use std::collections::HashMap;
use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::builders::{BuildRequest, EmptyBuilder, FromSnapshotBuilder, TestBuilder, Volume, VolumeBuilder};
use crate::config::Config;
use crate::csi;
use crate::dispatcher::{instrument, require_fields};
use crate::error::{DriverError, DriverResult};
use crate::vms::VmsSession;

const DEFAULT_VOLUME_SIZE: i64 = 1024 * 1024 * 1024;

/// Parse the VMS's ISO-8601 `created` timestamp into a protobuf `Timestamp`.
/// Falls back to the epoch if the VMS ever returns something unparseable.
fn parse_creation_time(created: &str) -> prost_types::Timestamp {
    match chrono::DateTime::parse_from_rfc3339(created) {
        Ok(dt) => prost_types::Timestamp {
            seconds: dt.timestamp(),
            nanos: dt.timestamp_subsec_nanos() as i32,
        },
        Err(_) => prost_types::Timestamp { seconds: 0, nanos: 0 },
    }
}

const SUPPORTED_ACCESS_MODES: &[i32] = &[
    csi::volume_capability::access_mode::Mode::SingleNodeWriter as i32,
    csi::volume_capability::access_mode::Mode::MultiNodeMultiWriter as i32,
];

pub struct ControllerService {
    vms: Arc<dyn VmsSession>,
    config: Arc<Config>,
}

impl ControllerService {
    pub fn new(vms: Arc<dyn VmsSession>, config: Arc<Config>) -> Self {
        Self { vms, config }
    }

    fn validate_capabilities(&self, caps: &[csi::VolumeCapability]) -> DriverResult<()> {
        for cap in caps {
            if let Some(mode) = &cap.access_mode
                && !SUPPORTED_ACCESS_MODES.contains(&mode.mode)
            {
                return Err(DriverError::InvalidArgument(format!(
                    "unsupported access mode: {}",
                    mode.mode
                )));
            }
            if let Some(csi::volume_capability::AccessType::Mount(mount)) = &cap.access_type
                && !mount.fs_type.is_empty()
                && mount.fs_type != "ext4"
            {
                return Err(DriverError::InvalidArgument(format!(
                    "unsupported filesystem type: {}",
                    mount.fs_type
                )));
            }
        }
        Ok(())
    }

    fn mount_options(&self, caps: &[csi::VolumeCapability]) -> Vec<String> {
        for cap in caps {
            if let Some(csi::volume_capability::AccessType::Mount(mount)) = &cap.access_type {
                let joined = mount.mount_flags.join(",");
                let stripped = joined.replace(['[', ']'], "");
                return stripped
                    .split(|c: char| c == ',' || c.is_whitespace())
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
            }
        }
        self.config.mount_options.clone()
    }

    fn volume_size(&self, capacity_range: Option<&csi::CapacityRange>) -> i64 {
        match capacity_range {
            Some(range) if range.required_bytes > 0 => range.required_bytes,
            Some(range) if range.limit_bytes > 0 => range.limit_bytes,
            _ => DEFAULT_VOLUME_SIZE,
        }
    }

    /// Core `CreateVolume` logic, callable directly by the Node service's
    /// inline ephemeral-volume path.
    pub async fn create_volume_impl(
        &self,
        req: &csi::CreateVolumeRequest,
    ) -> DriverResult<Volume> {
        self.validate_capabilities(&req.volume_capabilities)?;

        let mount_options = self.mount_options(&req.volume_capabilities);
        let capacity_bytes = self.volume_size(req.capacity_range.as_ref());
        let pvc_name = req.parameters.get("csi.storage.k8s.io/pvc/name").cloned();
        let pvc_namespace = req.parameters.get("csi.storage.k8s.io/pvc/namespace").cloned();

        let content_source_snapshot_id = req.volume_content_source.as_ref().and_then(|src| match &src.r#type {
            Some(csi::volume_content_source::Type::Snapshot(s)) if !s.snapshot_id.is_empty() => {
                Some(s.snapshot_id.clone())
            }
            _ => None,
        });

        let builder: Box<dyn VolumeBuilder> = if self.config.mock_vast {
            Box::new(TestBuilder)
        } else if content_source_snapshot_id.is_some() {
            Box::new(FromSnapshotBuilder)
        } else if req.volume_content_source.is_none() {
            Box::new(EmptyBuilder)
        } else {
            return Err(DriverError::InvalidArgument(
                "unsupported volume_content_source".to_string(),
            ));
        };

        let root_export = req
            .parameters
            .get("root_export")
            .cloned()
            .unwrap_or_default();
        let view_policy = req.parameters.get("view_policy").cloned().unwrap_or_default();
        let vip_pool_name = req.parameters.get("vip_pool_name").cloned().unwrap_or_default();

        if !self.config.mock_vast {
            require_fields(&[
                ("root_export", !root_export.is_empty()),
                ("view_policy", !view_policy.is_empty()),
                ("vip_pool_name", !vip_pool_name.is_empty()),
            ])?;
        }

        let build_req = BuildRequest {
            name: req.name.clone(),
            capacity_bytes,
            pvc_name,
            pvc_namespace,
            content_source_snapshot_id,
            root_export,
            volume_name_fmt: self.config.name_fmt.clone(),
            view_policy,
            vip_pool_name,
            mount_options,
            load_balancing: self.config.load_balancing,
            qos_policy: req.parameters.get("qos_policy").cloned(),
        };

        builder.build(self.vms.as_ref(), &build_req).await
    }

    async fn delete_data_from_storage(&self, path: &str, tenant_id: u64) -> DriverResult<()> {
        if self.vms.is_trash_api_usable().await {
            return self.vms.trash_delete(path).await;
        }
        self.delete_via_client_mount(path, tenant_id).await
    }

    /// Client-mount deletion fallback: temporarily mount the parent
    /// directory and remove the leaf directly, used when the VMS has no
    /// trash endpoint.
    async fn delete_via_client_mount(&self, path: &str, tenant_id: u64) -> DriverResult<()> {
        let (parent, leaf) = path
            .rsplit_once('/')
            .ok_or_else(|| DriverError::Other(anyhow::anyhow!("path has no parent: {path}")))?;

        let policy = self.vms.ensure_view_policy(&self.config.deletion_view_policy).await?;
        let vip = self
            .vms
            .get_vip(&self.config.deletion_vip_pool, self.config.load_balancing, policy.tenant_id)
            .await?;
        self.vms.ensure_view(parent, policy.id, tenant_id).await?;

        let tmp = tempfile::tempdir().map_err(DriverError::from)?;
        let sentinel = tmp.path().join(".csi-unmounted");
        std::fs::write(&sentinel, b"").map_err(DriverError::from)?;

        let spec = format!("{vip}:{parent}");
        crate::mount::mount(&spec, tmp.path(), &[])?;
        let _ = std::fs::remove_file(&sentinel);

        let leaf_path = tmp.path().join(leaf);
        let delete_result = std::fs::remove_dir(&leaf_path);

        let outcome = match delete_result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(DriverError::Aborted(format!("concurrent deletion race on {path}")))
            }
            Err(e) => {
                // ENOTEMPTY has no stable ErrorKind; fall back to raw_os_error (39 on Linux).
                if e.raw_os_error() == Some(39) {
                    if self.vms.has_snapshots(path).await? {
                        tracing::info!(path, "leaving directory in place, snapshots remain");
                        Ok(())
                    } else {
                        let entries: Vec<String> = std::fs::read_dir(&leaf_path)
                            .map(|rd| {
                                rd.flatten()
                                    .take(10)
                                    .map(|e| e.file_name().to_string_lossy().to_string())
                                    .collect()
                            })
                            .unwrap_or_default();
                        tracing::error!(path, ?entries, "directory not empty and holds no snapshots");
                        Err(DriverError::Other(anyhow::anyhow!(
                            "directory {path} not empty: {entries:?}"
                        )))
                    }
                } else {
                    Err(DriverError::from(e))
                }
            }
        };

        crate::mount::unmount(tmp.path())?;
        outcome
    }

    pub async fn delete_volume_impl(&self, volume_id: &str) -> DriverResult<()> {
        let Some(quota) = self.vms.find_quota_containing(volume_id).await? else {
            return Ok(());
        };
        self.delete_data_from_storage(&quota.path, quota.tenant_id).await?;
        self.vms.delete_view_by_path(&quota.path).await?;
        self.vms.delete_quota(quota.id).await?;
        Ok(())
    }

    pub async fn controller_publish_volume_impl(
        &self,
        req: &csi::ControllerPublishVolumeRequest,
    ) -> DriverResult<HashMap<String, String>> {
        if let Some(cap) = &req.volume_capability {
            self.validate_capabilities(std::slice::from_ref(cap))?;
        }

        let root_export = req.volume_context.get("root_export").cloned().unwrap_or_default();
        let vip_pool_name = req.volume_context.get("vip_pool_name").cloned().unwrap_or_default();
        let load_balancing = req
            .volume_context
            .get("load_balancing")
            .and_then(|s| match s.as_str() {
                "random" => Some(crate::config::LoadBalancing::Random),
                "roundrobin" => Some(crate::config::LoadBalancing::Roundrobin),
                _ => None,
            })
            .unwrap_or(self.config.load_balancing);

        let (quota_path_fragment, export_suffix) = match req.volume_context.get("snapshot_base_path") {
            Some(base) => {
                let fragment = base.split('/').next().unwrap_or(base).to_string();
                (fragment, base.clone())
            }
            None => (req.volume_id.clone(), req.volume_id.clone()),
        };

        let quota = self
            .vms
            .find_quota_containing(&quota_path_fragment)
            .await?
            .ok_or_else(|| DriverError::NotFound(format!("quota for {}", req.volume_id)))?;

        let nfs_server_ip = self.vms.get_vip(&vip_pool_name, load_balancing, quota.tenant_id).await?;
        let export_path = format!("{}/{}", root_export.trim_end_matches('/'), export_suffix);

        let mut ctx = HashMap::new();
        ctx.insert("nfs_server_ip".to_string(), nfs_server_ip);
        ctx.insert("export_path".to_string(), export_path);
        Ok(ctx)
    }
}

#[tonic::async_trait]
impl csi::controller_server::Controller for ControllerService {
    async fn create_volume(
        &self,
        request: Request<csi::CreateVolumeRequest>,
    ) -> Result<Response<csi::CreateVolumeResponse>, Status> {
        let req = request.into_inner();
        require_fields(&[
            ("name", !req.name.is_empty()),
            ("volume_capabilities", !req.volume_capabilities.is_empty()),
        ])
        .map_err(|e| crate::dispatcher::map_error("CreateVolume", e))?;

        instrument("CreateVolume", &req.name.clone(), async {
            let volume = self.create_volume_impl(&req).await?;
            Ok(csi::CreateVolumeResponse {
                volume: Some(csi::Volume {
                    capacity_bytes: volume.capacity_bytes,
                    volume_id: volume.volume_id,
                    volume_context: volume.volume_context,
                    content_source: req.volume_content_source.clone(),
                    accessible_topology: vec![],
                }),
            })
        })
        .await
    }

    async fn delete_volume(
        &self,
        request: Request<csi::DeleteVolumeRequest>,
    ) -> Result<Response<csi::DeleteVolumeResponse>, Status> {
        let req = request.into_inner();
        require_fields(&[("volume_id", !req.volume_id.is_empty())])
            .map_err(|e| crate::dispatcher::map_error("DeleteVolume", e))?;

        instrument("DeleteVolume", &req.volume_id.clone(), async {
            self.delete_volume_impl(&req.volume_id).await?;
            Ok(csi::DeleteVolumeResponse {})
        })
        .await
    }

    async fn controller_publish_volume(
        &self,
        request: Request<csi::ControllerPublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerPublishVolumeResponse>, Status> {
        let req = request.into_inner();
        require_fields(&[
            ("volume_id", !req.volume_id.is_empty()),
            ("node_id", !req.node_id.is_empty()),
            ("volume_capability", req.volume_capability.is_some()),
        ])
        .map_err(|e| crate::dispatcher::map_error("ControllerPublishVolume", e))?;

        instrument("ControllerPublishVolume", &req.volume_id.clone(), async {
            let publish_context = self.controller_publish_volume_impl(&req).await?;
            Ok(csi::ControllerPublishVolumeResponse { publish_context })
        })
        .await
    }

    async fn controller_unpublish_volume(
        &self,
        request: Request<csi::ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        instrument("ControllerUnpublishVolume", &req.volume_id.clone(), async {
            Ok(csi::ControllerUnpublishVolumeResponse {})
        })
        .await
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<csi::ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<csi::ValidateVolumeCapabilitiesResponse>, Status> {
        let req = request.into_inner();
        require_fields(&[
            ("volume_id", !req.volume_id.is_empty()),
            ("volume_capabilities", !req.volume_capabilities.is_empty()),
        ])
        .map_err(|e| crate::dispatcher::map_error("ValidateVolumeCapabilities", e))?;

        instrument("ValidateVolumeCapabilities", &req.volume_id.clone(), async {
            if self.vms.find_quota_containing(&req.volume_id).await?.is_none() {
                return Err(DriverError::NotFound(req.volume_id.clone()));
            }
            let response = match self.validate_capabilities(&req.volume_capabilities) {
                Ok(()) => csi::ValidateVolumeCapabilitiesResponse {
                    confirmed: Some(csi::validate_volume_capabilities_response::Confirmed {
                        volume_context: req.volume_context.clone(),
                        volume_capabilities: req.volume_capabilities.clone(),
                        parameters: req.parameters.clone(),
                    }),
                    message: String::new(),
                },
                Err(e) => csi::ValidateVolumeCapabilitiesResponse {
                    confirmed: None,
                    message: e.to_string(),
                },
            };
            Ok(response)
        })
        .await
    }

    async fn list_volumes(
        &self,
        request: Request<csi::ListVolumesRequest>,
    ) -> Result<Response<csi::ListVolumesResponse>, Status> {
        let req = request.into_inner();
        instrument("ListVolumes", &req.starting_token.clone(), async {
            if req.starting_token == "invalid-token" {
                return Err(DriverError::Aborted("invalid starting_token".to_string()));
            }
            let page_size = if req.max_entries > 0 { req.max_entries as u32 } else { 250 };
            let token = (!req.starting_token.is_empty()).then_some(req.starting_token.as_str());
            let page = self.vms.list_quotas(page_size, token).await?;

            let root = self.vms.sanity_test_nfs_export().unwrap_or_default().to_string();
            let entries = page
                .results
                .into_iter()
                .map(|quota| {
                    let volume_id = quota
                        .path
                        .strip_prefix(&root)
                        .map(|p| p.trim_start_matches('/').to_string())
                        .filter(|p| !p.contains(".."));
                    let mut ctx = HashMap::new();
                    ctx.insert("quota_id".to_string(), quota.id.to_string());
                    csi::list_volumes_response::Entry {
                        volume: Some(csi::Volume {
                            capacity_bytes: quota.hard_limit,
                            volume_id: volume_id.unwrap_or_default(),
                            volume_context: ctx,
                            content_source: None,
                            accessible_topology: vec![],
                        }),
                        status: None,
                    }
                })
                .collect();

            Ok(csi::ListVolumesResponse {
                entries,
                next_token: page.next.unwrap_or_default(),
            })
        })
        .await
    }

    async fn get_capacity(
        &self,
        _request: Request<csi::GetCapacityRequest>,
    ) -> Result<Response<csi::GetCapacityResponse>, Status> {
        Err(Status::unimplemented("GetCapacity is not supported"))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<csi::ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<csi::ControllerGetCapabilitiesResponse>, Status> {
        use csi::controller_service_capability::{RPC, rpc::Type as RpcType};
        let make = |t: RpcType| csi::ControllerServiceCapability {
            r#type: Some(csi::controller_service_capability::Type::Rpc(RPC { r#type: t as i32 })),
        };
        let capabilities = vec![
            make(RpcType::CreateDeleteVolume),
            make(RpcType::PublishUnpublishVolume),
            make(RpcType::ListVolumes),
            make(RpcType::ExpandVolume),
            make(RpcType::CreateDeleteSnapshot),
            make(RpcType::ListSnapshots),
        ];
        Ok(Response::new(csi::ControllerGetCapabilitiesResponse { capabilities }))
    }

    async fn create_snapshot(
        &self,
        request: Request<csi::CreateSnapshotRequest>,
    ) -> Result<Response<csi::CreateSnapshotResponse>, Status> {
        let req = request.into_inner();
        require_fields(&[
            ("source_volume_id", !req.source_volume_id.is_empty()),
            ("name", !req.name.is_empty()),
        ])
        .map_err(|e| crate::dispatcher::map_error("CreateSnapshot", e))?;

        instrument("CreateSnapshot", &req.name.clone(), async {
            let quota = self
                .vms
                .find_quota_containing(&req.source_volume_id)
                .await?
                .ok_or_else(|| DriverError::NotFound(req.source_volume_id.clone()))?;

            let namespace = req.parameters.get("csi.storage.k8s.io/volumesnapshot/namespace").map(String::as_str);
            let vs_name = req.parameters.get("csi.storage.k8s.io/volumesnapshot/name").map(String::as_str);
            let display_name = crate::builders::format_name(
                &self.config.snapshot_name_fmt,
                namespace,
                vs_name,
                &req.name,
            )
            .replace([':', '/'], "-");

            let snapshot = self.vms.ensure_snapshot(&display_name, &quota.path, quota.tenant_id).await?;

            Ok(csi::CreateSnapshotResponse {
                snapshot: Some(csi::Snapshot {
                    size_bytes: 0,
                    snapshot_id: snapshot.id.to_string(),
                    source_volume_id: req.source_volume_id.clone(),
                    creation_time: Some(parse_creation_time(&snapshot.created)),
                    ready_to_use: true,
                }),
            })
        })
        .await
    }

    async fn delete_snapshot(
        &self,
        request: Request<csi::DeleteSnapshotRequest>,
    ) -> Result<Response<csi::DeleteSnapshotResponse>, Status> {
        let req = request.into_inner();
        require_fields(&[("snapshot_id", !req.snapshot_id.is_empty())])
            .map_err(|e| crate::dispatcher::map_error("DeleteSnapshot", e))?;

        instrument("DeleteSnapshot", &req.snapshot_id.clone(), async {
            let id: u64 = req
                .snapshot_id
                .parse()
                .map_err(|_| DriverError::NotFound(req.snapshot_id.clone()))?;
            let snapshot = match self.vms.get_snapshot(id).await {
                Ok(s) => s,
                Err(DriverError::NotFound(_)) => return Ok(csi::DeleteSnapshotResponse {}),
                Err(e) => return Err(e),
            };
            self.vms.delete_snapshot(id).await?;

            let remaining_quotas = self.vms.get_quotas_by_path(&snapshot.path).await?;
            let remaining_snapshots = self.vms.has_snapshots(&snapshot.path).await?;
            if remaining_quotas.is_empty() && !remaining_snapshots {
                self.delete_data_from_storage(&snapshot.path, snapshot.tenant_id).await?;
            }
            Ok(csi::DeleteSnapshotResponse {})
        })
        .await
    }

    async fn list_snapshots(
        &self,
        request: Request<csi::ListSnapshotsRequest>,
    ) -> Result<Response<csi::ListSnapshotsResponse>, Status> {
        let req = request.into_inner();
        instrument("ListSnapshots", &req.starting_token.clone(), async {
            let page_size = if req.max_entries > 0 { req.max_entries as u32 } else { 250 };
            let token = (!req.starting_token.is_empty()).then_some(req.starting_token.as_str());
            let source_volume_id = (!req.source_volume_id.is_empty()).then_some(req.source_volume_id.as_str());
            let snapshot_id = (!req.snapshot_id.is_empty()).then_some(req.snapshot_id.as_str());

            let page = self.vms.list_snapshots(page_size, token, source_volume_id, snapshot_id).await?;
            let root = self.vms.sanity_test_nfs_export().unwrap_or_default().to_string();

            let entries = page
                .results
                .into_iter()
                .map(|snap| {
                    let source_volume_id = snap
                        .path
                        .strip_prefix(&root)
                        .map(|p| p.trim_start_matches('/').to_string())
                        .unwrap_or_else(|| "n/a".to_string());
                    csi::list_snapshots_response::Entry {
                        snapshot: Some(csi::Snapshot {
                            size_bytes: 0,
                            snapshot_id: snap.id.to_string(),
                            source_volume_id,
                            creation_time: Some(parse_creation_time(&snap.created)),
                            ready_to_use: true,
                        }),
                    }
                })
                .collect();

            Ok(csi::ListSnapshotsResponse {
                entries,
                next_token: page.next.unwrap_or_default(),
            })
        })
        .await
    }

    async fn controller_expand_volume(
        &self,
        request: Request<csi::ControllerExpandVolumeRequest>,
    ) -> Result<Response<csi::ControllerExpandVolumeResponse>, Status> {
        let req = request.into_inner();
        require_fields(&[("volume_id", !req.volume_id.is_empty())])
            .map_err(|e| crate::dispatcher::map_error("ControllerExpandVolume", e))?;

        instrument("ControllerExpandVolume", &req.volume_id.clone(), async {
            let quota = self
                .vms
                .find_quota_containing(&req.volume_id)
                .await?
                .ok_or_else(|| DriverError::NotFound(req.volume_id.clone()))?;
            let required = req.capacity_range.as_ref().map(|r| r.required_bytes).unwrap_or(0);

            let capacity_bytes = if required <= quota.hard_limit {
                quota.hard_limit
            } else {
                match self.vms.update_quota(quota.id, required).await {
                    Ok(updated) => updated.hard_limit,
                    Err(DriverError::Api(api)) if api.status == 400 => {
                        return Err(DriverError::OutOfRange(api.to_string()));
                    }
                    Err(e) => return Err(e),
                }
            };

            Ok(csi::ControllerExpandVolumeResponse {
                capacity_bytes,
                node_expansion_required: false,
            })
        })
        .await
    }

    async fn controller_get_volume(
        &self,
        _request: Request<csi::ControllerGetVolumeRequest>,
    ) -> Result<Response<csi::ControllerGetVolumeResponse>, Status> {
        Err(Status::unimplemented("ControllerGetVolume is not supported"))
    }

    async fn controller_modify_volume(
        &self,
        _request: Request<csi::ControllerModifyVolumeRequest>,
    ) -> Result<Response<csi::ControllerModifyVolumeResponse>, Status> {
        Err(Status::unimplemented("ControllerModifyVolume is not supported"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Arc<Config> {
        Arc::new(Config {
            endpoint: "unix:///tmp/csi.sock".to_string(),
            mode: crate::config::Mode::ControllerAndNode,
            node_id: Some("node-1".to_string()),
            plugin_name: "csi.vastdata.com".to_string(),
            plugin_version: "0.0.0".to_string(),
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
            mock_vast: true,
            csi_sanity_test: false,
            metrics_addr: None,
        })
    }

    fn test_vms() -> Arc<dyn VmsSession> {
        let dir = tempfile::tempdir().unwrap();
        Arc::new(
            crate::vms::TestSession::new(
                dir.path().join("quotas"),
                dir.path().join("snapshots"),
                "10.0.0.5".to_string(),
                Some("/k8s".to_string()),
            )
            .unwrap(),
        )
    }

    fn mount_capability() -> csi::VolumeCapability {
        csi::VolumeCapability {
            access_type: Some(csi::volume_capability::AccessType::Mount(csi::volume_capability::MountVolume {
                fs_type: "ext4".to_string(),
                mount_flags: vec![],
            })),
            access_mode: Some(csi::volume_capability::AccessMode {
                mode: csi::volume_capability::access_mode::Mode::SingleNodeWriter as i32,
            }),
        }
    }

    #[test]
    fn volume_size_prefers_required_bytes() {
        let svc = ControllerService::new(test_vms(), config());
        let range = csi::CapacityRange { required_bytes: 5, limit_bytes: 10 };
        assert_eq!(svc.volume_size(Some(&range)), 5);
    }

    #[test]
    fn volume_size_falls_back_to_default() {
        let svc = ControllerService::new(test_vms(), config());
        assert_eq!(svc.volume_size(None), DEFAULT_VOLUME_SIZE);
    }

    #[test]
    fn validate_capabilities_rejects_bad_access_mode() {
        let svc = ControllerService::new(test_vms(), config());
        let mut cap = mount_capability();
        cap.access_mode = Some(csi::volume_capability::AccessMode {
            mode: csi::volume_capability::access_mode::Mode::MultiNodeReaderOnly as i32,
        });
        assert!(svc.validate_capabilities(&[cap]).is_err());
    }

    #[test]
    fn validate_capabilities_rejects_non_ext4() {
        let svc = ControllerService::new(test_vms(), config());
        let mut cap = mount_capability();
        if let Some(csi::volume_capability::AccessType::Mount(m)) = &mut cap.access_type {
            m.fs_type = "xfs".to_string();
        }
        assert!(svc.validate_capabilities(&[cap]).is_err());
    }

    #[tokio::test]
    async fn create_volume_impl_is_idempotent() {
        let vms = test_vms();
        let svc = ControllerService::new(vms, config());
        let req = csi::CreateVolumeRequest {
            name: "pvc-abc".to_string(),
            capacity_range: Some(csi::CapacityRange { required_bytes: 1073741824, limit_bytes: 0 }),
            volume_capabilities: vec![mount_capability()],
            parameters: HashMap::new(),
            secrets: HashMap::new(),
            volume_content_source: None,
            accessibility_requirements: vec![],
        };
        let v1 = svc.create_volume_impl(&req).await.unwrap();
        let v2 = svc.create_volume_impl(&req).await.unwrap();
        assert_eq!(v1.volume_id, v2.volume_id);
        assert_eq!(v1.capacity_bytes, 1073741824);
    }
}
