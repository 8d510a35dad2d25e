//! Registry transport contract and wire records.
//!
//! The rest of the crate is written against [`RegistryTransport`]; it
//! never talks HTTP directly. Two implementations ship with the crate:
//!
//! - [`HttpTransport`]: the agent HTTP API (`/v1/...`)
//! - [`MemoryTransport`]: an in-process registry used by tests and demos
//!
//! # Architecture
//!
//! ```text
//!   ServiceInstance ──┐
//!   Discovery ────────┼──► Client ──► Arc<dyn RegistryTransport>
//!   KvNamespace/Lock ─┘                     │
//!                                ┌──────────┴──────────┐
//!                                ▼                     ▼
//!                          HttpTransport         MemoryTransport
//! ```

mod http;
mod memory;

pub use http::HttpTransport;
pub use memory::{MemoryTransport, TransportCall};

use crate::error::RegistryResult;
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Primitive registry operations the client is built on.
///
/// Every method is a single round trip. Implementations must be safe to
/// share across tasks; the client adds no locking of its own.
#[async_trait]
pub trait RegistryTransport: Send + Sync {
    /// Register (or overwrite) a service instance with the local agent.
    async fn service_register(&self, registration: &ServiceRegistration) -> RegistryResult<()>;

    /// Remove a service instance by id.
    async fn service_deregister(&self, service_id: &str) -> RegistryResult<()>;

    /// Catalog view: every instance of `name` carrying all `tags`.
    async fn catalog_service(
        &self,
        name: &str,
        tags: &[String],
    ) -> RegistryResult<Vec<CatalogService>>;

    /// Health view: instances of `name` carrying all `tags`, optionally
    /// only those whose checks are all passing.
    async fn health_service(
        &self,
        name: &str,
        tags: &[String],
        passing_only: bool,
    ) -> RegistryResult<Vec<ServiceEntry>>;

    /// Fetch a KV pair; `None` when the key does not exist.
    async fn kv_get(&self, key: &str) -> RegistryResult<Option<KvPair>>;

    /// Write a KV pair unconditionally.
    async fn kv_put(&self, pair: &KvPair) -> RegistryResult<()>;

    /// Delete a single key.
    async fn kv_delete(&self, key: &str) -> RegistryResult<()>;

    /// Atomically write `pair` if the key is free or already held by
    /// `pair.session`. Returns whether the lock is now held.
    async fn kv_acquire(&self, pair: &KvPair) -> RegistryResult<bool>;

    /// Release the lock held by `pair.session` on `pair.key`.
    async fn kv_release(&self, pair: &KvPair) -> RegistryResult<bool>;

    /// Create a session, returning its id.
    async fn session_create(&self, entry: &SessionEntry) -> RegistryResult<String>;

    /// Reset a session's TTL. Fails if the session no longer exists.
    async fn session_renew(&self, session_id: &str) -> RegistryResult<()>;

    /// Invalidate a session, releasing (or deleting) the keys it holds.
    async fn session_destroy(&self, session_id: &str) -> RegistryResult<()>;
}

/// Alternate address advertised alongside the primary one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceAddress {
    pub address: String,
    pub port: u16,
}

/// Health probe attached at registration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceCheck {
    #[serde(rename = "HTTP", skip_serializing_if = "Option::is_none")]
    pub http: Option<String>,
    #[serde(rename = "TCP", skip_serializing_if = "Option::is_none")]
    pub tcp: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deregister_critical_service_after: Option<String>,
}

impl ServiceCheck {
    /// HTTP GET probe.
    pub fn http(url: impl Into<String>, interval: impl Into<String>, timeout: impl Into<String>) -> Self {
        Self {
            http: Some(url.into()),
            interval: Some(interval.into()),
            timeout: Some(timeout.into()),
            ..Self::default()
        }
    }

    /// TCP connect probe against `host:port`.
    pub fn tcp(addr: impl Into<String>, interval: impl Into<String>, timeout: impl Into<String>) -> Self {
        Self {
            tcp: Some(addr.into()),
            interval: Some(interval.into()),
            timeout: Some(timeout.into()),
            ..Self::default()
        }
    }

    /// Script probe run by the agent.
    pub fn script(args: Vec<String>, interval: impl Into<String>) -> Self {
        Self {
            args,
            interval: Some(interval.into()),
            ..Self::default()
        }
    }

    /// Deregister the instance after it has been critical this long.
    pub fn deregister_after(mut self, after: impl Into<String>) -> Self {
        self.deregister_critical_service_after = Some(after.into());
        self
    }
}

/// Agent service registration request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceRegistration {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    pub tags: Vec<String>,
    pub port: u16,
    pub address: String,
    pub meta: BTreeMap<String, String>,
    pub tagged_addresses: BTreeMap<String, ServiceAddress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check: Option<ServiceCheck>,
}

/// One row of the catalog view.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CatalogService {
    #[serde(default)]
    pub node: String,
    /// Node address.
    #[serde(default)]
    pub address: String,
    #[serde(rename = "ServiceID", default)]
    pub service_id: String,
    #[serde(default)]
    pub service_name: String,
    /// Service address; empty means "same as the node".
    #[serde(default, deserialize_with = "null_as_default")]
    pub service_address: String,
    #[serde(default)]
    pub service_port: u16,
    #[serde(default, deserialize_with = "null_as_default")]
    pub service_tags: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub service_meta: BTreeMap<String, String>,
}

/// Node half of a health entry.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HealthNode {
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub address: String,
}

/// Service half of a health entry.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentService {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(default)]
    pub service: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tags: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub meta: BTreeMap<String, String>,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub address: String,
}

/// Health check state attached to a health entry.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HealthCheck {
    #[serde(rename = "CheckID", default)]
    pub check_id: String,
    #[serde(default)]
    pub name: String,
    /// `passing`, `warning` or `critical`.
    #[serde(default)]
    pub status: String,
}

impl HealthCheck {
    pub fn is_passing(&self) -> bool {
        self.status == "passing"
    }
}

/// One row of the health view.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceEntry {
    #[serde(default)]
    pub node: HealthNode,
    #[serde(default)]
    pub service: AgentService,
    #[serde(default, deserialize_with = "null_as_default")]
    pub checks: Vec<HealthCheck>,
}

/// A key/value pair, optionally held by a session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KvPair {
    pub key: String,
    pub value: Option<Vec<u8>>,
    pub session: Option<String>,
    pub flags: u64,
    pub modify_index: u64,
    pub lock_index: u64,
}

impl KvPair {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            ..Self::default()
        }
    }

    /// Attach the session the pair is written under.
    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }
}

/// What the registry does with held keys when a session is invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionBehavior {
    /// Release the lock, keep the key.
    #[default]
    Release,
    /// Delete the key.
    Delete,
}

impl SessionBehavior {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionBehavior::Release => "release",
            SessionBehavior::Delete => "delete",
        }
    }
}

/// Session creation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEntry {
    pub name: String,
    pub behavior: SessionBehavior,
    /// TTL in registry duration syntax, e.g. `"15s"`.
    pub ttl: String,
    pub lock_delay: Duration,
}

/// Deserialize `null` as `T::default()`; the agent emits `null` for empty
/// tag lists and metadata maps.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
