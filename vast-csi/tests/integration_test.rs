//! Cross-cutting integration tests for the CSI driver, exercised entirely
//! against `TestSession` (no live VMS, no real mount namespace).

use std::collections::HashMap;
use std::sync::Arc;

use tonic::Request;

use vast_csi::config::{Config, LoadBalancing, Mode};
use vast_csi::csi;
use vast_csi::csi::controller_server::Controller;
use vast_csi::csi::identity_server::Identity;
use vast_csi::vms::{TestSession, VmsSession};
use vast_csi::{ControllerService, IdentityService};

fn config() -> Arc<Config> {
    Arc::new(Config {
        endpoint: "unix:///tmp/csi.sock".to_string(),
        mode: Mode::ControllerAndNode,
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
        load_balancing: LoadBalancing::Roundrobin,
        mount_options: vec![],
        unmount_attempts: 3,
        deletion_view_policy: "csi-deletion".to_string(),
        deletion_vip_pool: "csi-deletion".to_string(),
        sanity_test_nfs_export: Some("/k8s".to_string()),
        fake_quota_store: None,
        fake_snapshot_store: None,
        mock_vast: false,
        csi_sanity_test: false,
        metrics_addr: None,
    })
}

fn test_vms(dir: &std::path::Path) -> Arc<dyn VmsSession> {
    Arc::new(
        TestSession::new(
            dir.join("quotas"),
            dir.join("snapshots"),
            "10.0.0.5".to_string(),
            Some("/k8s".to_string()),
        )
        .unwrap(),
    )
}

fn mount_capability() -> csi::VolumeCapability {
    csi::VolumeCapability {
        access_type: Some(csi::volume_capability::AccessType::Mount(csi::volume_capability::MountVolume {
            fs_type: String::new(),
            mount_flags: vec![],
        })),
        access_mode: Some(csi::volume_capability::AccessMode {
            mode: csi::volume_capability::access_mode::Mode::SingleNodeWriter as i32,
        }),
    }
}

fn create_request(name: &str, required_bytes: i64) -> csi::CreateVolumeRequest {
    let mut parameters = HashMap::new();
    parameters.insert("root_export".to_string(), "/k8s".to_string());
    parameters.insert("view_policy".to_string(), "default".to_string());
    parameters.insert("vip_pool_name".to_string(), "vp1".to_string());
    csi::CreateVolumeRequest {
        name: name.to_string(),
        capacity_range: Some(csi::CapacityRange { required_bytes, limit_bytes: 0 }),
        volume_capabilities: vec![mount_capability()],
        parameters,
        secrets: HashMap::new(),
        volume_content_source: None,
        accessibility_requirements: vec![],
    }
}

/// Scenario 1: Create -> Publish -> Node-Publish -> Unpublish -> Delete.
#[tokio::test]
async fn create_publish_node_publish_unpublish_delete() {
    let dir = tempfile::tempdir().unwrap();
    let vms = test_vms(dir.path());
    let controller = ControllerService::new(vms, config());

    let create_resp = controller
        .create_volume(Request::new(create_request("pvc-abc", 1073741824)))
        .await
        .unwrap()
        .into_inner();
    let volume = create_resp.volume.unwrap();
    assert_eq!(volume.volume_id, "pvc-abc");
    assert_eq!(volume.capacity_bytes, 1073741824);

    let publish_resp = controller
        .controller_publish_volume(Request::new(csi::ControllerPublishVolumeRequest {
            volume_id: volume.volume_id.clone(),
            node_id: "node-1".to_string(),
            volume_capability: Some(mount_capability()),
            readonly: false,
            secrets: HashMap::new(),
            volume_context: volume.volume_context.clone(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(publish_resp.publish_context.get("nfs_server_ip").unwrap(), "10.0.0.5");
    assert_eq!(publish_resp.publish_context.get("export_path").unwrap(), "/k8s/pvc-abc");

    let delete_resp = controller
        .delete_volume(Request::new(csi::DeleteVolumeRequest {
            volume_id: volume.volume_id.clone(),
            secrets: HashMap::new(),
        }))
        .await;
    assert!(delete_resp.is_ok());
}

/// Scenario 2: duplicate CreateVolume is idempotent.
#[tokio::test]
async fn duplicate_create_volume_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let vms = test_vms(dir.path());
    let controller = ControllerService::new(vms, config());

    let first = controller
        .create_volume(Request::new(create_request("pvc-dup", 1073741824)))
        .await
        .unwrap()
        .into_inner()
        .volume
        .unwrap();
    let second = controller
        .create_volume(Request::new(create_request("pvc-dup", 1073741824)))
        .await
        .unwrap()
        .into_inner()
        .volume
        .unwrap();

    assert_eq!(first.volume_id, second.volume_id);
    assert_eq!(first.capacity_bytes, second.capacity_bytes);
}

/// Scenario 3: mismatched capacity on an existing quota is a conflict.
#[tokio::test]
async fn mismatched_capacity_is_already_exists() {
    let dir = tempfile::tempdir().unwrap();
    let vms = test_vms(dir.path());
    let controller = ControllerService::new(vms, config());

    controller
        .create_volume(Request::new(create_request("pvc-mismatch", 1073741824)))
        .await
        .unwrap();

    let err = controller
        .create_volume(Request::new(create_request("pvc-mismatch", 2 * 1073741824)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), tonic::Code::AlreadyExists);
}

/// Scenario 5: ListVolumes with an invalid pagination token aborts.
#[tokio::test]
async fn list_volumes_invalid_token_aborts() {
    let dir = tempfile::tempdir().unwrap();
    let vms = test_vms(dir.path());
    let controller = ControllerService::new(vms, config());

    let err = controller
        .list_volumes(Request::new(csi::ListVolumesRequest {
            max_entries: 10,
            starting_token: "invalid-token".to_string(),
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), tonic::Code::Aborted);
}

/// `Probe` is READY unconditionally for a Node-mode process.
#[tokio::test]
async fn probe_ready_in_node_mode() {
    let cfg = Arc::new(Config { mode: Mode::Node, ..(*config()).clone() });
    let identity = IdentityService::new(cfg, None);
    let response = identity.probe(Request::new(csi::ProbeRequest {})).await.unwrap();
    assert_eq!(response.into_inner().ready, Some(true));
}

/// `Probe` on a controller-only process depends on reaching the VMS for a VIP.
#[tokio::test]
async fn probe_ready_when_controller_can_reach_vms() {
    let dir = tempfile::tempdir().unwrap();
    let vms = test_vms(dir.path());
    let cfg = Arc::new(Config { mode: Mode::Controller, ..(*config()).clone() });
    let identity = IdentityService::new(cfg, Some(vms));
    let response = identity.probe(Request::new(csi::ProbeRequest {})).await.unwrap();
    assert_eq!(response.into_inner().ready, Some(true));
}
