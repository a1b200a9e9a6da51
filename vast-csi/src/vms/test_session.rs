//! Mock VMS session used when `mock_vast` is set. Backed entirely by local
//! files under `fake_quota_store`/`fake_snapshot_store`; no network calls.
//!
//! Mirrors a documented divergence from production semantics (see
//! DESIGN.md's Open Question #2): `find_quota_containing` here always
//! returns a synthetic quota for the requested fragment, regardless of
//! whether a volume was ever created under that name, matching the
//! original mock's behavior rather than unifying it with the real
//! path-lookup semantics.

use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::LoadBalancing;
use crate::error::{DriverError, DriverResult};

use super::model::{Page, Quota, Snapshot, View, ViewPolicy};
use super::session::VmsSession;

pub struct TestSession {
    quota_store: PathBuf,
    snapshot_store: PathBuf,
    nfs_server: String,
    sanity_test_nfs_export: Option<String>,
    created_quotas: Mutex<Vec<Quota>>,
    next_id: AtomicUsize,
}

impl TestSession {
    pub fn new(
        quota_store: PathBuf,
        snapshot_store: PathBuf,
        nfs_server: String,
        sanity_test_nfs_export: Option<String>,
    ) -> std::io::Result<Self> {
        std::fs::create_dir_all(&quota_store)?;
        std::fs::create_dir_all(&snapshot_store)?;
        Ok(Self {
            quota_store,
            snapshot_store,
            nfs_server,
            sanity_test_nfs_export,
            created_quotas: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(1),
        })
    }

    fn quota_file(&self, path: &str) -> PathBuf {
        self.quota_store.join(path.replace('/', "_"))
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) as u64
    }
}

#[tonic::async_trait]
impl VmsSession for TestSession {
    async fn refresh_auth_token(&self) -> DriverResult<()> {
        Ok(())
    }

    async fn get_vip(&self, _pool: &str, _lb: LoadBalancing, _tenant_id: u64) -> DriverResult<String> {
        Ok(self.nfs_server.clone())
    }

    /// The fake store has no client-mount path to fall back to (there's no
    /// real NFS export to mount in mock mode), so deletion always goes
    /// through the trash-file branch, which `trash_delete` below handles
    /// entirely in terms of the fake quota store.
    async fn is_trash_api_usable(&self) -> bool {
        true
    }

    async fn trash_delete(&self, path: &str) -> DriverResult<()> {
        let _ = std::fs::remove_file(self.quota_file(path));
        Ok(())
    }

    async fn ensure_view_policy(&self, name: &str) -> DriverResult<ViewPolicy> {
        Ok(ViewPolicy {
            id: 1,
            name: name.to_string(),
            tenant_id: 1,
        })
    }

    async fn find_view_by_path(&self, path: &str) -> DriverResult<Option<View>> {
        Ok(Some(View {
            id: 1,
            path: path.to_string(),
            alias: String::new(),
            tenant_id: 1,
            policy_id: 1,
        }))
    }

    async fn ensure_view(&self, path: &str, policy_id: u64, tenant_id: u64) -> DriverResult<View> {
        Ok(View {
            id: 1,
            path: path.to_string(),
            alias: String::new(),
            tenant_id,
            policy_id,
        })
    }

    async fn delete_view_by_path(&self, _path: &str) -> DriverResult<()> {
        Ok(())
    }

    /// Always returns a synthetic quota for the requested fragment. This is
    /// the documented mock-only divergence from production path lookups.
    async fn find_quota_containing(&self, fragment: &str) -> DriverResult<Option<Quota>> {
        Ok(Some(Quota {
            id: 1,
            path: fragment.to_string(),
            hard_limit: 0,
            tenant_id: 1,
        }))
    }

    async fn get_quotas_by_path(&self, path: &str) -> DriverResult<Vec<Quota>> {
        let created = self.created_quotas.lock().unwrap();
        Ok(created.iter().filter(|q| q.path == path).cloned().collect())
    }

    async fn create_quota(&self, path: &str, hard_limit: i64, tenant_id: u64) -> DriverResult<Quota> {
        let quota = Quota {
            id: self.next_id(),
            path: path.to_string(),
            hard_limit,
            tenant_id,
        };
        std::fs::write(self.quota_file(path), serde_json::to_vec(&quota)?)?;
        self.created_quotas.lock().unwrap().push(quota.clone());
        Ok(quota)
    }

    async fn update_quota(&self, id: u64, hard_limit: i64) -> DriverResult<Quota> {
        let mut created = self.created_quotas.lock().unwrap();
        let quota = created
            .iter_mut()
            .find(|q| q.id == id)
            .ok_or_else(|| DriverError::NotFound(format!("quota {id}")))?;
        quota.hard_limit = hard_limit;
        Ok(quota.clone())
    }

    async fn delete_quota(&self, id: u64) -> DriverResult<()> {
        let mut created = self.created_quotas.lock().unwrap();
        if let Some(pos) = created.iter().position(|q| q.id == id) {
            let quota = created.remove(pos);
            let _ = std::fs::remove_file(self.quota_file(&quota.path));
        }
        Ok(())
    }

    async fn list_quotas(&self, _page_size: u32, _starting_token: Option<&str>) -> DriverResult<Page<Quota>> {
        let created = self.created_quotas.lock().unwrap();
        Ok(Page {
            results: created.clone(),
            next: None,
        })
    }

    async fn find_snapshot_by_name(&self, name: &str) -> DriverResult<Option<Snapshot>> {
        let path = self.snapshot_store.join(name);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn get_snapshot(&self, id: u64) -> DriverResult<Snapshot> {
        for entry in std::fs::read_dir(&self.snapshot_store)?.flatten() {
            let bytes = std::fs::read(entry.path())?;
            let snap: Snapshot = serde_json::from_slice(&bytes)?;
            if snap.id == id {
                return Ok(snap);
            }
        }
        Err(DriverError::NotFound(format!("snapshot {id}")))
    }

    async fn ensure_snapshot(&self, name: &str, path: &str, tenant_id: u64) -> DriverResult<Snapshot> {
        if let Some(existing) = self.find_snapshot_by_name(name).await? {
            return if existing.path == path {
                Ok(existing)
            } else {
                Err(DriverError::VolumeAlreadyExists(name.to_string()))
            };
        }
        let snap = Snapshot {
            id: self.next_id(),
            name: name.to_string(),
            path: path.to_string(),
            tenant_id,
            created: String::new(),
        };
        std::fs::write(self.snapshot_store.join(name), serde_json::to_vec(&snap)?)?;
        Ok(snap)
    }

    async fn delete_snapshot(&self, id: u64) -> DriverResult<()> {
        let snap = self.get_snapshot(id).await?;
        let _ = std::fs::remove_file(self.snapshot_store.join(&snap.name));
        Ok(())
    }

    async fn has_snapshots(&self, path: &str) -> DriverResult<bool> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        for entry in std::fs::read_dir(&self.snapshot_store)?.flatten() {
            let bytes = std::fs::read(entry.path())?;
            let snap: Snapshot = serde_json::from_slice(&bytes)?;
            if snap.path.starts_with(&prefix) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn list_snapshots(
        &self,
        _page_size: u32,
        _starting_token: Option<&str>,
        source_volume_id: Option<&str>,
        snapshot_id: Option<&str>,
    ) -> DriverResult<Page<Snapshot>> {
        if let Some(id) = snapshot_id {
            let id: u64 = id.parse().map_err(|_| DriverError::NotFound(id.to_string()))?;
            return Ok(Page {
                results: vec![self.get_snapshot(id).await?],
                next: None,
            });
        }
        let mut results = Vec::new();
        for entry in std::fs::read_dir(&self.snapshot_store)?.flatten() {
            let bytes = std::fs::read(entry.path())?;
            let snap: Snapshot = serde_json::from_slice(&bytes)?;
            if source_volume_id.is_none_or(|v| snap.path.contains(v)) {
                results.push(snap);
            }
        }
        Ok(Page { results, next: None })
    }

    fn sanity_test_nfs_export(&self) -> Option<&str> {
        self.sanity_test_nfs_export.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> TestSession {
        let dir = tempfile::tempdir().unwrap();
        TestSession::new(
            dir.path().join("quotas"),
            dir.path().join("snapshots"),
            "10.0.0.5".to_string(),
            Some("/k8s".to_string()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn create_quota_is_idempotent_by_inspection() {
        let session = session();
        let q1 = session.create_quota("/k8s/vol-1", 1024, 1).await.unwrap();
        let found = session.get_quotas_by_path("/k8s/vol-1").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, q1.id);
    }

    #[tokio::test]
    async fn ensure_snapshot_detects_collision() {
        let session = session();
        session.ensure_snapshot("snap-1", "/k8s/pvc-x", 1).await.unwrap();
        let err = session
            .ensure_snapshot("snap-1", "/k8s/pvc-y", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::VolumeAlreadyExists(_)));
    }

    #[tokio::test]
    async fn ensure_snapshot_same_path_is_idempotent() {
        let session = session();
        let s1 = session.ensure_snapshot("snap-1", "/k8s/pvc-x", 1).await.unwrap();
        let s2 = session.ensure_snapshot("snap-1", "/k8s/pvc-x", 1).await.unwrap();
        assert_eq!(s1.id, s2.id);
    }

    #[tokio::test]
    async fn get_vip_always_returns_configured_nfs_server() {
        let session = session();
        let ip = session
            .get_vip("any-pool", LoadBalancing::Roundrobin, 1)
            .await
            .unwrap();
        assert_eq!(ip, "10.0.0.5");
    }
}
