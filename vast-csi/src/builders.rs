//! Volume provisioning strategies.
//!
//! `CreateVolume` selects one of three builders — `Empty`, `FromSnapshot`,
//! `Test` — each given the same construction record and each producing a
//! `Volume` descriptor. This is the tagged-variant/capability-interface
//! shape the design notes call for in place of the source's subclassing.

use std::collections::HashMap;

use crate::config::LoadBalancing;
use crate::error::{DriverError, DriverResult};
use crate::vms::VmsSession;

/// The provisioned unit returned to the CSI caller.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    pub volume_id: String,
    pub capacity_bytes: i64,
    pub volume_context: HashMap<String, String>,
}

/// Everything a builder needs to provision (or find) a volume, gathered
/// from the storage-class parameters and the CreateVolume request.
pub struct BuildRequest {
    pub name: String,
    pub capacity_bytes: i64,
    pub pvc_name: Option<String>,
    pub pvc_namespace: Option<String>,
    pub content_source_snapshot_id: Option<String>,
    pub root_export: String,
    pub volume_name_fmt: String,
    pub view_policy: String,
    pub vip_pool_name: String,
    pub mount_options: Vec<String>,
    pub load_balancing: LoadBalancing,
    pub qos_policy: Option<String>,
}

/// Render a name template with `{namespace}`, `{name}`, `{id}` fields.
pub fn format_name(fmt: &str, namespace: Option<&str>, name: Option<&str>, id: &str) -> String {
    fmt.replace("{namespace}", namespace.unwrap_or(""))
        .replace("{name}", name.unwrap_or(""))
        .replace("{id}", id)
}

/// Render an ephemeral volume name template: `{namespace}`, `{name}`, `{uid}`.
pub fn format_ephemeral_name(fmt: &str, namespace: &str, name: &str, uid: &str) -> String {
    fmt.replace("{namespace}", namespace)
        .replace("{name}", name)
        .replace("{uid}", uid)
}

fn base_volume_context(req: &BuildRequest) -> HashMap<String, String> {
    let mut ctx = HashMap::new();
    ctx.insert("root_export".to_string(), req.root_export.clone());
    ctx.insert("vip_pool_name".to_string(), req.vip_pool_name.clone());
    ctx.insert("load_balancing".to_string(), req.load_balancing.to_string());
    if !req.mount_options.is_empty() {
        ctx.insert("mount_options".to_string(), req.mount_options.join(","));
    }
    if let Some(qos) = &req.qos_policy {
        ctx.insert("qos_policy".to_string(), qos.clone());
    }
    ctx
}

#[tonic::async_trait]
pub trait VolumeBuilder {
    async fn build(&self, vms: &dyn VmsSession, req: &BuildRequest) -> DriverResult<Volume>;
}

pub struct EmptyBuilder;

#[tonic::async_trait]
impl VolumeBuilder for EmptyBuilder {
    async fn build(&self, vms: &dyn VmsSession, req: &BuildRequest) -> DriverResult<Volume> {
        let policy = vms.ensure_view_policy(&req.view_policy).await?;
        let volume_id = format_name(
            &req.volume_name_fmt,
            req.pvc_namespace.as_deref(),
            req.pvc_name.as_deref(),
            &req.name,
        );
        let path = format!("{}/{}", req.root_export.trim_end_matches('/'), volume_id);

        let existing = vms.get_quotas_by_path(&path).await?;
        let quota = if let Some(existing) = existing.into_iter().next() {
            if existing.hard_limit != req.capacity_bytes {
                return Err(DriverError::VolumeAlreadyExists(volume_id));
            }
            existing
        } else {
            vms.create_quota(&path, req.capacity_bytes, policy.tenant_id).await?
        };

        vms.ensure_view(&path, policy.id, policy.tenant_id).await?;

        Ok(Volume {
            volume_id,
            capacity_bytes: quota.hard_limit,
            volume_context: base_volume_context(req),
        })
    }
}

pub struct FromSnapshotBuilder;

#[tonic::async_trait]
impl VolumeBuilder for FromSnapshotBuilder {
    async fn build(&self, vms: &dyn VmsSession, req: &BuildRequest) -> DriverResult<Volume> {
        let snapshot_id = req
            .content_source_snapshot_id
            .as_ref()
            .ok_or_else(|| DriverError::InvalidArgument("missing snapshot_id on content source".to_string()))?;
        let id: u64 = snapshot_id
            .parse()
            .map_err(|_| DriverError::SourceNotFound(snapshot_id.clone()))?;
        let snapshot = vms
            .get_snapshot(id)
            .await
            .map_err(|_| DriverError::SourceNotFound(snapshot_id.clone()))?;

        let volume_id = format_name(
            &req.volume_name_fmt,
            req.pvc_namespace.as_deref(),
            req.pvc_name.as_deref(),
            &req.name,
        );

        let source_quota_leaf = snapshot.path.rsplit('/').next().unwrap_or(&snapshot.path);
        let snapshot_base_path = format!("{source_quota_leaf}/.snapshot/{}", snapshot.name);

        let mut volume_context = base_volume_context(req);
        volume_context.insert("snapshot_base_path".to_string(), snapshot_base_path);

        Ok(Volume {
            volume_id,
            capacity_bytes: req.capacity_bytes,
            volume_context,
        })
    }
}

/// Mock builder used under `mock_vast`: provisions purely through whatever
/// `VmsSession` was injected (a `TestSession` backed by local fake stores),
/// never contacting a real VMS.
pub struct TestBuilder;

#[tonic::async_trait]
impl VolumeBuilder for TestBuilder {
    async fn build(&self, vms: &dyn VmsSession, req: &BuildRequest) -> DriverResult<Volume> {
        EmptyBuilder.build(vms, req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_name_substitutes_all_fields() {
        let out = format_name("{namespace}-{name}-{id}", Some("ns"), Some("pvc"), "abc123");
        assert_eq!(out, "ns-pvc-abc123");
    }

    #[test]
    fn format_name_tolerates_missing_optional_fields() {
        let out = format_name("{id}", None, None, "pvc-abc");
        assert_eq!(out, "pvc-abc");
    }

    #[test]
    fn format_ephemeral_name_substitutes_all_fields() {
        let out = format_ephemeral_name("csi-eph-{namespace}-{name}-{uid}", "ns", "pod-1", "uid-1");
        assert_eq!(out, "csi-eph-ns-pod-1-uid-1");
    }
}
