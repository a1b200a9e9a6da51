//! The VMS REST session: auth, pagination, VIP selection, and the typed
//! resource accessors the controller drives. `VmsSession` is the interface
//! both the real (`RestSession`) and mock (`TestSession`) implementations
//! satisfy — handlers are injected with one or the other at startup and
//! never branch on mock-mode themselves.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use reqwest::{Method, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::LoadBalancing;
use crate::error::{ApiError, DriverError, DriverResult};

use super::model::{Page, Quota, Snapshot, View, ViewPolicy, Vip};

#[tonic::async_trait]
pub trait VmsSession: Send + Sync {
    async fn refresh_auth_token(&self) -> DriverResult<()>;

    async fn get_vip(
        &self,
        vip_pool_name: &str,
        load_balancing: LoadBalancing,
        tenant_id: u64,
    ) -> DriverResult<String>;

    async fn is_trash_api_usable(&self) -> bool;
    async fn trash_delete(&self, path: &str) -> DriverResult<()>;

    async fn ensure_view_policy(&self, name: &str) -> DriverResult<ViewPolicy>;
    async fn find_view_by_path(&self, path: &str) -> DriverResult<Option<View>>;
    async fn ensure_view(&self, path: &str, policy_id: u64, tenant_id: u64) -> DriverResult<View>;
    async fn delete_view_by_path(&self, path: &str) -> DriverResult<()>;

    async fn find_quota_containing(&self, fragment: &str) -> DriverResult<Option<Quota>>;
    async fn get_quotas_by_path(&self, path: &str) -> DriverResult<Vec<Quota>>;
    async fn create_quota(&self, path: &str, hard_limit: i64, tenant_id: u64) -> DriverResult<Quota>;
    async fn update_quota(&self, id: u64, hard_limit: i64) -> DriverResult<Quota>;
    async fn delete_quota(&self, id: u64) -> DriverResult<()>;
    async fn list_quotas(
        &self,
        page_size: u32,
        starting_token: Option<&str>,
    ) -> DriverResult<Page<Quota>>;

    async fn find_snapshot_by_name(&self, name: &str) -> DriverResult<Option<Snapshot>>;
    async fn get_snapshot(&self, id: u64) -> DriverResult<Snapshot>;
    async fn ensure_snapshot(&self, name: &str, path: &str, tenant_id: u64) -> DriverResult<Snapshot>;
    async fn delete_snapshot(&self, id: u64) -> DriverResult<()>;
    async fn has_snapshots(&self, path: &str) -> DriverResult<bool>;
    async fn list_snapshots(
        &self,
        page_size: u32,
        starting_token: Option<&str>,
        source_volume_id: Option<&str>,
        snapshot_id: Option<&str>,
    ) -> DriverResult<Page<Snapshot>>;

    /// Directory under which quota leaf names are computed as relative
    /// paths; `None` means volume ids are treated as opaque.
    fn sanity_test_nfs_export(&self) -> Option<&str>;
}

/// Real REST-backed session against the VMS management API.
pub struct RestSession {
    base_url: String,
    client: reqwest::Client,
    token: Mutex<Option<String>>,
    credentials: Option<String>,
    round_robin_idx: AtomicUsize,
    sanity_test_nfs_export: Option<String>,
}

impl RestSession {
    pub fn new(
        base_url: String,
        ssl_verify: bool,
        ca_cert_pem: Option<Vec<u8>>,
        credentials: Option<String>,
        sanity_test_nfs_export: Option<String>,
    ) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().danger_accept_invalid_certs(!ssl_verify);
        if let Some(pem) = ca_cert_pem {
            let cert = reqwest::Certificate::from_pem(&pem)?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder.build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            token: Mutex::new(None),
            credentials,
            round_robin_idx: AtomicUsize::new(0),
            sanity_test_nfs_export,
        })
    }

    fn bearer(&self) -> Option<String> {
        self.token.lock().unwrap().clone()
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Generic request against the VMS API. HTTP 400/503 raise a
    /// structured `ApiError` the caller can inspect; other error statuses
    /// are folded into a generic error the dispatcher maps to `UNKNOWN`. A
    /// 401 triggers one token refresh and retry, per §4.6's "re-called on
    /// auth failure" contract.
    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> DriverResult<Option<Value>> {
        self.request_inner(method, path, query, body, true).await
    }

    /// `allow_reauth` is `false` on the retry itself (and on the token
    /// request), so a VMS that keeps rejecting the refreshed token can't
    /// recurse forever.
    fn request_inner<'a>(
        &'a self,
        method: Method,
        path: &'a str,
        query: &'a [(&'a str, String)],
        body: Option<&'a Value>,
        allow_reauth: bool,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = DriverResult<Option<Value>>> + Send + 'a>> {
        Box::pin(async move {
            let url = self.url(path);
            debug!(%method, %url, "vms request");
            let mut req = self.client.request(method.clone(), &url).query(query);
            if let Some(token) = self.bearer() {
                req = req.bearer_auth(token);
            }
            if let Some(body) = body {
                req = req.json(body);
            }
            let resp = req.send().await.map_err(|e| anyhow::anyhow!(e))?;
            let status = resp.status();
            debug!(%url, %status, "vms response");

            if status == StatusCode::UNAUTHORIZED && allow_reauth {
                warn!(%url, "vms request unauthorized, refreshing auth token");
                self.refresh_auth_token().await?;
                return self.request_inner(method, path, query, body, false).await;
            }
            if status == StatusCode::BAD_REQUEST || status == StatusCode::SERVICE_UNAVAILABLE {
                let reason = status.canonical_reason().unwrap_or("").to_string();
                let body_text = resp.text().await.unwrap_or_default();
                return Err(DriverError::Api(ApiError {
                    status: status.as_u16(),
                    reason,
                    body: body_text,
                    url,
                }));
            }
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                return Err(DriverError::Other(anyhow::anyhow!(
                    "vms request to {url} failed: {status} {text}"
                )));
            }
            if status == StatusCode::NO_CONTENT {
                return Ok(None);
            }
            let value: Value = resp.json().await.map_err(|e| anyhow::anyhow!(e))?;
            Ok(Some(value))
        })
    }

    async fn get_by_token<T: serde::de::DeserializeOwned>(&self, token: &str) -> DriverResult<Page<T>> {
        let value = self
            .request(Method::GET, token, &[], None)
            .await?
            .ok_or_else(|| anyhow::anyhow!("empty response following pagination token"))?;
        Ok(serde_json::from_value(value)?)
    }

    async fn list_page<T: serde::de::DeserializeOwned>(
        &self,
        resource: &str,
        page_size: u32,
        starting_token: Option<&str>,
        extra_query: &[(&str, String)],
    ) -> DriverResult<Page<T>> {
        if let Some(token) = starting_token {
            return self.get_by_token(token).await;
        }
        let mut query = vec![("page_size", page_size.to_string())];
        query.extend(extra_query.iter().cloned());
        let value = self
            .request(Method::GET, resource, &query, None)
            .await?
            .ok_or_else(|| anyhow::anyhow!("empty response listing {resource}"))?;
        Ok(serde_json::from_value(value)?)
    }
}

impl From<serde_json::Error> for DriverError {
    fn from(err: serde_json::Error) -> Self {
        DriverError::Other(err.into())
    }
}

#[tonic::async_trait]
impl VmsSession for RestSession {
    async fn refresh_auth_token(&self) -> DriverResult<()> {
        let Some(creds) = &self.credentials else {
            return Ok(());
        };
        let (user, pass) = creds.split_once(':').unwrap_or((creds.as_str(), ""));
        let body = serde_json::json!({"username": user, "password": pass});
        // `allow_reauth: false` — a 401 fetching a token isn't fixed by fetching another one.
        let value = self
            .request_inner(Method::POST, "token/", &[], Some(&body), false)
            .await?
            .ok_or_else(|| anyhow::anyhow!("empty token response"))?;
        let token = value
            .get("access")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("token response missing access field"))?
            .to_string();
        *self.token.lock().unwrap() = Some(token);
        Ok(())
    }

    async fn get_vip(
        &self,
        vip_pool_name: &str,
        load_balancing: LoadBalancing,
        tenant_id: u64,
    ) -> DriverResult<String> {
        let value = self
            .request(Method::GET, "vips", &[("vippool", vip_pool_name.to_string())], None)
            .await?
            .ok_or_else(|| anyhow::anyhow!("empty vips response"))?;
        let vips: Vec<Vip> = serde_json::from_value(value)?;
        let filtered: Vec<Vip> = vips
            .into_iter()
            .filter(|v| v.vippool == vip_pool_name && (tenant_id == 0 || v.tenant_id == tenant_id))
            .collect();
        if filtered.is_empty() {
            return Err(DriverError::FailedPrecondition(format!(
                "No vips in pool {vip_pool_name}"
            )));
        }
        let chosen = match load_balancing {
            LoadBalancing::Roundrobin => {
                let idx = self.round_robin_idx.fetch_add(1, Ordering::SeqCst) % filtered.len();
                &filtered[idx]
            }
            LoadBalancing::Random => {
                let idx = (std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.subsec_nanos() as usize)
                    .unwrap_or(0))
                    % filtered.len();
                &filtered[idx]
            }
        };
        debug!(vip = %chosen.ip, pool = %vip_pool_name, "selected vip");
        Ok(chosen.ip.clone())
    }

    async fn is_trash_api_usable(&self) -> bool {
        self.request(Method::GET, "trash", &[], None).await.is_ok()
    }

    async fn trash_delete(&self, path: &str) -> DriverResult<()> {
        let body = serde_json::json!({"path": path});
        self.request(Method::POST, "trash", &[], Some(&body)).await?;
        Ok(())
    }

    async fn ensure_view_policy(&self, name: &str) -> DriverResult<ViewPolicy> {
        let value = self
            .request(Method::GET, "viewpolicies", &[("name", name.to_string())], None)
            .await?
            .ok_or_else(|| anyhow::anyhow!("empty viewpolicies response"))?;
        let policies: Vec<ViewPolicy> = serde_json::from_value(value)?;
        policies
            .into_iter()
            .next()
            .ok_or_else(|| DriverError::NotFound(format!("view policy {name}")))
    }

    async fn find_view_by_path(&self, path: &str) -> DriverResult<Option<View>> {
        let value = self
            .request(Method::GET, "views", &[("path", path.to_string())], None)
            .await?
            .ok_or_else(|| anyhow::anyhow!("empty views response"))?;
        let views: Vec<View> = serde_json::from_value(value)?;
        Ok(views.into_iter().find(|v| v.path == path))
    }

    async fn ensure_view(&self, path: &str, policy_id: u64, tenant_id: u64) -> DriverResult<View> {
        if let Some(existing) = self.find_view_by_path(path).await? {
            return Ok(existing);
        }
        let body = serde_json::json!({"path": path, "policy_id": policy_id, "tenant_id": tenant_id});
        let value = self
            .request(Method::POST, "views", &[], Some(&body))
            .await?
            .ok_or_else(|| anyhow::anyhow!("empty view create response"))?;
        Ok(serde_json::from_value(value)?)
    }

    async fn delete_view_by_path(&self, path: &str) -> DriverResult<()> {
        if let Some(view) = self.find_view_by_path(path).await? {
            self.request(Method::DELETE, &format!("views/{}", view.id), &[], None)
                .await?;
        }
        Ok(())
    }

    async fn find_quota_containing(&self, fragment: &str) -> DriverResult<Option<Quota>> {
        let value = self
            .request(
                Method::GET,
                "quotas",
                &[("path__contains", fragment.to_string())],
                None,
            )
            .await?
            .ok_or_else(|| anyhow::anyhow!("empty quotas response"))?;
        let quotas: Vec<Quota> = serde_json::from_value(value)?;
        if quotas.len() > 1 {
            warn!(fragment, count = quotas.len(), "multiple quotas matched path fragment");
        }
        Ok(quotas.into_iter().next())
    }

    async fn get_quotas_by_path(&self, path: &str) -> DriverResult<Vec<Quota>> {
        let value = self
            .request(Method::GET, "quotas", &[("path", path.to_string())], None)
            .await?
            .ok_or_else(|| anyhow::anyhow!("empty quotas response"))?;
        let quotas: Vec<Quota> = serde_json::from_value(value)?;
        Ok(quotas.into_iter().filter(|q| q.path == path).collect())
    }

    async fn create_quota(&self, path: &str, hard_limit: i64, tenant_id: u64) -> DriverResult<Quota> {
        let body = serde_json::json!({"path": path, "hard_limit": hard_limit, "tenant_id": tenant_id});
        let value = self
            .request(Method::POST, "quotas", &[], Some(&body))
            .await?
            .ok_or_else(|| anyhow::anyhow!("empty quota create response"))?;
        Ok(serde_json::from_value(value)?)
    }

    async fn update_quota(&self, id: u64, hard_limit: i64) -> DriverResult<Quota> {
        let body = serde_json::json!({"hard_limit": hard_limit});
        let value = self
            .request(Method::PATCH, &format!("quotas/{id}"), &[], Some(&body))
            .await?
            .ok_or_else(|| anyhow::anyhow!("empty quota update response"))?;
        Ok(serde_json::from_value(value)?)
    }

    async fn delete_quota(&self, id: u64) -> DriverResult<()> {
        self.request(Method::DELETE, &format!("quotas/{id}"), &[], None)
            .await?;
        Ok(())
    }

    async fn list_quotas(
        &self,
        page_size: u32,
        starting_token: Option<&str>,
    ) -> DriverResult<Page<Quota>> {
        self.list_page("quotas", page_size, starting_token, &[]).await
    }

    async fn find_snapshot_by_name(&self, name: &str) -> DriverResult<Option<Snapshot>> {
        let value = self
            .request(Method::GET, "snapshots", &[("name", name.to_string())], None)
            .await?
            .ok_or_else(|| anyhow::anyhow!("empty snapshots response"))?;
        let snaps: Vec<Snapshot> = serde_json::from_value(value)?;
        if snaps.len() > 1 {
            warn!(name, count = snaps.len(), "multiple snapshots matched name");
        }
        Ok(snaps.into_iter().next())
    }

    async fn get_snapshot(&self, id: u64) -> DriverResult<Snapshot> {
        let value = self
            .request(Method::GET, &format!("snapshots/{id}"), &[], None)
            .await?
            .ok_or_else(|| DriverError::NotFound(format!("snapshot {id}")))?;
        Ok(serde_json::from_value(value)?)
    }

    async fn ensure_snapshot(&self, name: &str, path: &str, tenant_id: u64) -> DriverResult<Snapshot> {
        let body = serde_json::json!({"name": name, "path": path, "tenant_id": tenant_id});
        match self.request(Method::POST, "snapshots", &[], Some(&body)).await {
            Ok(Some(value)) => Ok(serde_json::from_value(value)?),
            Ok(None) => Err(DriverError::Other(anyhow::anyhow!("empty snapshot create response"))),
            Err(DriverError::Api(api)) if api.status == 400 => {
                if api.body.contains("\"name\"") && api.body.contains("must be unique") {
                    let existing = self
                        .find_snapshot_by_name(name)
                        .await?
                        .ok_or_else(|| DriverError::Other(anyhow::anyhow!(api.clone())))?;
                    if existing.path == path {
                        Ok(existing)
                    } else {
                        Err(DriverError::VolumeAlreadyExists(name.to_string()))
                    }
                } else {
                    Err(DriverError::InvalidArgument(api.to_string()))
                }
            }
            Err(other) => Err(other),
        }
    }

    async fn delete_snapshot(&self, id: u64) -> DriverResult<()> {
        self.request(Method::DELETE, &format!("snapshots/{id}"), &[], None)
            .await?;
        Ok(())
    }

    async fn has_snapshots(&self, path: &str) -> DriverResult<bool> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let value = self
            .request(
                Method::GET,
                "snapshots",
                &[("path__contains", prefix.clone()), ("page_size", "10".to_string())],
                None,
            )
            .await?
            .ok_or_else(|| anyhow::anyhow!("empty snapshots response"))?;
        let snaps: Vec<Snapshot> = serde_json::from_value(value)?;
        Ok(snaps.iter().any(|s| s.path.starts_with(&prefix)))
    }

    async fn list_snapshots(
        &self,
        page_size: u32,
        starting_token: Option<&str>,
        source_volume_id: Option<&str>,
        snapshot_id: Option<&str>,
    ) -> DriverResult<Page<Snapshot>> {
        if starting_token.is_none()
            && let Some(id) = snapshot_id
        {
            let id: u64 = id.parse().map_err(|_| DriverError::NotFound(id.to_string()))?;
            let snap = self.get_snapshot(id).await?;
            return Ok(Page {
                results: vec![snap],
                next: None,
            });
        }
        let extra: Vec<(&str, String)> = source_volume_id
            .map(|v| vec![("path__contains", v.to_string())])
            .unwrap_or_default();
        self.list_page("snapshots", page_size, starting_token, &extra).await
    }

    fn sanity_test_nfs_export(&self) -> Option<&str> {
        self.sanity_test_nfs_export.as_deref()
    }
}
