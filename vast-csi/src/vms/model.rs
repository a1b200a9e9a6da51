//! Wire-shaped structs for the VMS REST API's JSON bodies.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Quota {
    pub id: u64,
    pub path: String,
    pub hard_limit: i64,
    #[serde(default)]
    pub tenant_id: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct View {
    pub id: u64,
    pub path: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub tenant_id: u64,
    pub policy_id: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ViewPolicy {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub tenant_id: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VipPool {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Vip {
    pub ip: String,
    pub vippool: String,
    #[serde(default)]
    pub cnode: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub tenant_id: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Snapshot {
    pub id: u64,
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub tenant_id: u64,
    #[serde(default)]
    pub created: String,
}

/// A VMS paginated list response envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct Page<T> {
    pub results: Vec<T>,
    #[serde(default)]
    pub next: Option<String>,
}
