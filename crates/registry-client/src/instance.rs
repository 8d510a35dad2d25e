//! Service instance model.
//!
//! A [`ServiceInstance`] is a registrable endpoint: identity, address,
//! tags, metadata and an optional health check. Construction is pure;
//! only [`ServiceInstance::register`] and [`ServiceInstance::deregister`]
//! touch the registry.
//!
//! # Derived fields
//!
//! - `tags` always starts with `serviceName=<name>`, `instanceId=<id>`
//!   followed by the caller's tags.
//! - `metadata["AnnouncedIp"]` / `metadata["LanIp"]` are the comma-joined
//!   IP lists, regenerated on every construction.
//! - `DataRoot` is dropped from caller metadata; the registration request
//!   carries `data_root` under that key instead.
//! - Each LAN / announced IP is advertised as tagged address `Lan{i}` /
//!   `Announced{i}` on the instance port.

use crate::client::Client;
use crate::error::RegistryResult;
use crate::kv::KvNamespace;
use crate::transport::{ServiceAddress, ServiceCheck, ServiceRegistration};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Metadata key holding the comma-joined announced IPs.
pub const META_ANNOUNCED_IP: &str = "AnnouncedIp";
/// Metadata key holding the comma-joined LAN IPs.
pub const META_LAN_IP: &str = "LanIp";
/// Metadata key holding the instance's KV data root.
pub const META_DATA_ROOT: &str = "DataRoot";

/// Tag key carrying the service name.
pub const TAG_SERVICE_NAME: &str = "serviceName";
/// Tag key carrying the instance id.
pub const TAG_INSTANCE_ID: &str = "instanceId";

/// Constructor input for [`ServiceInstance`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceDescriptor {
    pub service_name: String,
    pub host: String,
    pub port: u16,
    pub metadata: BTreeMap<String, String>,
    pub tags: Vec<String>,
    pub instance_id: String,
    pub lan_ips: Vec<String>,
    pub announced_ips: Vec<String>,
    pub data_root: String,
}

impl InstanceDescriptor {
    /// Descriptor with identity and address; everything else empty.
    pub fn new(
        service_name: impl Into<String>,
        instance_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            instance_id: instance_id.into(),
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Set the caller tags.
    pub fn tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Set the caller metadata.
    pub fn metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set the LAN IPs.
    pub fn lan_ips(mut self, ips: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.lan_ips = ips.into_iter().map(Into::into).collect();
        self
    }

    /// Set the publicly announced IPs.
    pub fn announced_ips(mut self, ips: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.announced_ips = ips.into_iter().map(Into::into).collect();
        self
    }

    /// Set the KV root for the instance's namespace.
    pub fn data_root(mut self, data_root: impl Into<String>) -> Self {
        self.data_root = data_root.into();
        self
    }
}

/// Tag identifying an instance by `key=value`.
pub fn registration_tag(key: &str, value: &str) -> String {
    format!("{key}={value}")
}

/// A registrable service endpoint.
#[derive(Debug, Clone)]
pub struct ServiceInstance {
    service_name: String,
    instance_id: String,
    host: String,
    port: u16,
    metadata: BTreeMap<String, String>,
    tags: Vec<String>,
    lan_ips: Vec<String>,
    announced_ips: Vec<String>,
    check: Option<ServiceCheck>,
    kv: KvNamespace,
    client: Arc<Client>,
    registered: bool,
}

impl ServiceInstance {
    /// Build an instance; never touches the network.
    pub fn new(descriptor: InstanceDescriptor, client: Arc<Client>) -> Self {
        let InstanceDescriptor {
            service_name,
            host,
            port,
            mut metadata,
            tags: caller_tags,
            instance_id,
            lan_ips,
            announced_ips,
            data_root,
        } = descriptor;

        // Reserved for the registration request; see `to_registration`.
        metadata.remove(META_DATA_ROOT);
        metadata.insert(META_ANNOUNCED_IP.to_string(), announced_ips.join(","));
        metadata.insert(META_LAN_IP.to_string(), lan_ips.join(","));

        let mut tags = Vec::with_capacity(caller_tags.len() + 2);
        tags.push(registration_tag(TAG_SERVICE_NAME, &service_name));
        tags.push(registration_tag(TAG_INSTANCE_ID, &instance_id));
        tags.extend(caller_tags);

        let kv = client.kv(data_root);

        Self {
            service_name,
            instance_id,
            host,
            port,
            metadata,
            tags,
            lan_ips,
            announced_ips,
            check: None,
            kv,
            client,
            registered: false,
        }
    }

    /// Service name.
    pub fn name(&self) -> &str {
        &self.service_name
    }

    /// Unique instance id.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Advertised address.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Advertised port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Metadata including the derived IP keys.
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Single metadata value.
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Identity tags followed by caller tags.
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Tags supplied by the caller, without the synthesized identity tags.
    pub fn caller_tags(&self) -> &[String] {
        &self.tags[2..]
    }

    /// LAN IPs, in registration order.
    pub fn lan_ips(&self) -> &[String] {
        &self.lan_ips
    }

    /// Announced IPs, in registration order.
    pub fn announced_ips(&self) -> &[String] {
        &self.announced_ips
    }

    /// Health probe sent on registration.
    pub fn check(&self) -> Option<&ServiceCheck> {
        self.check.as_ref()
    }

    /// Attach (or clear) the health probe sent with the next registration.
    pub fn set_check(&mut self, check: Option<ServiceCheck>) {
        self.check = check;
    }

    /// Builder form of [`ServiceInstance::set_check`].
    pub fn with_check(mut self, check: ServiceCheck) -> Self {
        self.check = Some(check);
        self
    }

    /// Root of the colocated KV namespace.
    pub fn data_root(&self) -> &str {
        self.kv.data_root()
    }

    /// KV namespace colocated with this instance.
    pub fn kv(&self) -> &KvNamespace {
        &self.kv
    }

    /// Client used for registration.
    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    /// True between a successful register and deregister.
    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// Registration request for the current field values.
    pub fn to_registration(&self) -> ServiceRegistration {
        let mut tagged_addresses = BTreeMap::new();
        for (i, ip) in self.lan_ips.iter().enumerate() {
            tagged_addresses.insert(format!("Lan{i}"), self.tagged_address(ip));
        }
        for (i, ip) in self.announced_ips.iter().enumerate() {
            tagged_addresses.insert(format!("Announced{i}"), self.tagged_address(ip));
        }

        let mut meta = self.metadata.clone();
        if !self.data_root().is_empty() {
            meta.insert(META_DATA_ROOT.to_string(), self.data_root().to_string());
        }

        ServiceRegistration {
            id: self.instance_id.clone(),
            name: self.service_name.clone(),
            tags: self.tags.clone(),
            port: self.port,
            address: self.host.clone(),
            meta,
            tagged_addresses,
            check: self.check.clone(),
        }
    }

    fn tagged_address(&self, ip: &str) -> ServiceAddress {
        ServiceAddress {
            address: ip.to_string(),
            port: self.port,
        }
    }

    /// Register with the registry. Calling again while registered
    /// overwrites the previous registration.
    pub async fn register(&mut self) -> RegistryResult<()> {
        self.client.register(self.to_registration()).await?;
        self.registered = true;
        Ok(())
    }

    /// Withdraw the registration; a no-op when not registered.
    ///
    /// On transport failure the instance stays registered.
    pub async fn deregister(&mut self) -> RegistryResult<()> {
        if !self.registered {
            return Ok(());
        }
        self.client.deregister(&self.instance_id).await?;
        self.registered = false;
        Ok(())
    }
}
