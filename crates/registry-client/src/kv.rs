//! Rooted KV namespace with string, JSON and TOML values.
//!
//! A [`KvNamespace`] pairs a transport handle with a `data_root` prefix.
//! Logical key `k` maps to `<data_root>/k`, or to `k` when the root is
//! empty; the same mapping is used by every operation, locks included.

use crate::error::{RegistryError, RegistryResult};
use crate::transport::{KvPair, RegistryTransport};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// KV access scoped under a root prefix.
#[derive(Clone, Default)]
pub struct KvNamespace {
    transport: Option<Arc<dyn RegistryTransport>>,
    data_root: String,
}

impl fmt::Debug for KvNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvNamespace")
            .field("data_root", &self.data_root)
            .field("connected", &self.transport.is_some())
            .finish()
    }
}

impl KvNamespace {
    /// Namespace over `transport`; `None` yields a handle whose every
    /// operation fails with [`RegistryError::NotConnected`].
    pub fn new(transport: Option<Arc<dyn RegistryTransport>>, data_root: impl Into<String>) -> Self {
        Self {
            transport,
            data_root: data_root.into(),
        }
    }

    /// Prefix joined onto every key.
    pub fn data_root(&self) -> &str {
        &self.data_root
    }

    /// False when no transport is bound.
    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Effective registry key for a logical key.
    pub fn real_key(&self, key: &str) -> String {
        if self.data_root.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.data_root, key)
        }
    }

    pub(crate) fn transport(&self) -> RegistryResult<&Arc<dyn RegistryTransport>> {
        self.transport.as_ref().ok_or(RegistryError::NotConnected)
    }

    /// Raw pair at the rooted key, if any.
    pub(crate) async fn pair(&self, key: &str) -> RegistryResult<Option<KvPair>> {
        let transport = self.transport()?;
        transport.kv_get(&self.real_key(key)).await
    }

    /// Read a UTF-8 string value.
    pub async fn get_string(&self, key: &str) -> RegistryResult<String> {
        let real_key = self.real_key(key);
        debug!(key = %real_key, "KV get");
        let value = self
            .pair(key)
            .await?
            .and_then(|pair| pair.value)
            .ok_or_else(|| RegistryError::NotFound(format!("value of key[{real_key}] is nil")))?;

        String::from_utf8(value)
            .map_err(|e| RegistryError::Decode(format!("value of key[{real_key}]: {e}")))
    }

    /// Read a JSON document into `T`.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> RegistryResult<T> {
        let data = self.get_string(key).await?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Read a TOML document into `T`.
    pub async fn get_toml<T: DeserializeOwned>(&self, key: &str) -> RegistryResult<T> {
        let data = self.get_string(key).await?;
        Ok(toml::from_str(&data)?)
    }

    /// Write a string value.
    pub async fn set_string(&self, key: &str, value: &str) -> RegistryResult<()> {
        let transport = self.transport()?;
        let real_key = self.real_key(key);
        debug!(key = %real_key, bytes = value.len(), "KV put");
        transport.kv_put(&KvPair::new(real_key, value)).await
    }

    /// Serialize `value` as JSON and write it.
    pub async fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> RegistryResult<()> {
        self.transport()?;
        let data =
            serde_json::to_string(value).map_err(|e| RegistryError::Encode(e.to_string()))?;
        self.set_string(key, &data).await
    }

    /// Serialize `value` as TOML and write it.
    pub async fn set_toml<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> RegistryResult<()> {
        self.transport()?;
        let data = toml::to_string(value)?;
        self.set_string(key, &data).await
    }

    /// Remove the rooted key.
    pub async fn delete(&self, key: &str) -> RegistryResult<()> {
        let transport = self.transport()?;
        let real_key = self.real_key(key);
        debug!(key = %real_key, "KV delete");
        transport.kv_delete(&real_key).await
    }
}
