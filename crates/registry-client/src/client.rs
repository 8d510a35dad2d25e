//! Registry client.
//!
//! A [`Client`] owns the transport handle and the set of instances this
//! process has registered. The set exists so everything can be withdrawn
//! in one call on shutdown; it mirrors local intent, not registry state.
//! Each client has its own set, dropped with the client.

use crate::config::ClientConfig;
use crate::error::{RegistryError, RegistryResult};
use crate::kv::KvNamespace;
use crate::transport::{HttpTransport, RegistryTransport, ServiceRegistration};
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Handle to a registry agent.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct Client {
    config: ClientConfig,
    transport: Option<Arc<dyn RegistryTransport>>,
    instances: DashMap<String, ServiceRegistration>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("address", &self.config.address())
            .field("connected", &self.transport.is_some())
            .field("instances", &self.instances.len())
            .finish()
    }
}

impl Client {
    /// Connect to `host:port` with an ACL token.
    pub fn new(host: impl Into<String>, port: u16, token: impl Into<String>) -> RegistryResult<Self> {
        Self::connect(ClientConfig::new(host, port, token))
    }

    /// Connect over HTTP using `config`.
    pub fn connect(config: ClientConfig) -> RegistryResult<Self> {
        let transport = HttpTransport::new(&config)?;
        info!(address = %config.address(), "Registry client configured");
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    /// Client over an arbitrary transport.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn RegistryTransport>) -> Self {
        Self {
            config,
            transport: Some(transport),
            instances: DashMap::new(),
        }
    }

    /// Client with no transport; every registry operation fails with
    /// [`RegistryError::NotConnected`].
    pub fn disconnected() -> Self {
        Self {
            config: ClientConfig::default(),
            transport: None,
            instances: DashMap::new(),
        }
    }

    /// Settings this client was built from.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// False for [`Client::disconnected`].
    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    pub(crate) fn transport(&self) -> RegistryResult<&Arc<dyn RegistryTransport>> {
        self.transport.as_ref().ok_or(RegistryError::NotConnected)
    }

    /// KV namespace rooted at `data_root` sharing this client's transport.
    pub fn kv(&self, data_root: impl Into<String>) -> KvNamespace {
        KvNamespace::new(self.transport.clone(), data_root)
    }

    /// Submit a registration and remember it in the live set.
    ///
    /// Re-registering an id that is already live overwrites it.
    pub async fn register(&self, registration: ServiceRegistration) -> RegistryResult<()> {
        if registration.port == 0 {
            return Err(RegistryError::InvalidInstance(format!(
                "{}: port must be in 1..=65535",
                registration.id
            )));
        }
        if registration.id.is_empty() || registration.name.is_empty() {
            return Err(RegistryError::InvalidInstance(
                "service name and instance id must not be empty".to_string(),
            ));
        }

        let transport = self.transport()?;
        if let Err(e) = transport.service_register(&registration).await {
            warn!(service_id = %registration.id, error = %e, "Service registration failed");
            return Err(e);
        }

        info!(
            service_id = %registration.id,
            name = %registration.name,
            address = %registration.address,
            port = registration.port,
            "Service registered"
        );
        self.instances.insert(registration.id.clone(), registration);
        Ok(())
    }

    /// Withdraw a registration and forget it.
    pub async fn deregister(&self, service_id: &str) -> RegistryResult<()> {
        let transport = self.transport()?;
        if let Err(e) = transport.service_deregister(service_id).await {
            warn!(service_id = %service_id, error = %e, "Service deregistration failed");
            return Err(e);
        }
        self.instances.remove(service_id);
        info!(service_id = %service_id, "Service deregistered");
        Ok(())
    }

    /// Withdraw every instance in the live set.
    ///
    /// Keeps going past individual failures; failed ids stay in the set
    /// and the first error is returned.
    pub async fn deregister_all(&self) -> RegistryResult<()> {
        let ids: Vec<String> = self.instances.iter().map(|e| e.key().clone()).collect();
        debug!(count = ids.len(), "Deregistering all live instances");

        let mut first_error = None;
        for id in ids {
            if let Err(e) = self.deregister(&id).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Ids currently in the live set, sorted.
    pub fn live_instance_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.instances.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Registration last submitted for `service_id`, if live.
    pub fn live_registration(&self, service_id: &str) -> Option<ServiceRegistration> {
        self.instances.get(service_id).map(|e| e.value().clone())
    }
}
