//! Catalog and health discovery.
//!
//! Every query turns registry rows back into [`ServiceInstance`] values
//! through one decode routine, so catalog and health results look the
//! same to callers. An empty result is [`RegistryError::NotFound`].

use crate::client::Client;
use crate::error::{RegistryError, RegistryResult};
use crate::instance::{
    InstanceDescriptor, META_ANNOUNCED_IP, META_DATA_ROOT, META_LAN_IP, ServiceInstance,
    TAG_INSTANCE_ID, TAG_SERVICE_NAME, registration_tag,
};
use crate::transport::{CatalogService, ServiceEntry};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Which registry view a query reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthFilter {
    /// Catalog view: every registered instance regardless of health.
    Catalog,
    /// Health view, optionally limited to instances whose checks pass.
    Health { passing_only: bool },
}

impl HealthFilter {
    /// Map the integer selector used by older callers: `-1` is the
    /// catalog, `1` is passing-only health, anything else is unfiltered
    /// health.
    pub fn from_passing(passing: i32) -> Self {
        match passing {
            -1 => HealthFilter::Catalog,
            1 => HealthFilter::Health { passing_only: true },
            _ => HealthFilter::Health {
                passing_only: false,
            },
        }
    }
}

impl Default for HealthFilter {
    fn default() -> Self {
        HealthFilter::Health { passing_only: true }
    }
}

/// A registry row that can be decoded into a [`ServiceInstance`].
pub trait ServiceRecord {
    fn service_name(&self) -> &str;
    fn service_id(&self) -> &str;
    fn host(&self) -> &str;
    fn port(&self) -> u16;
    fn tags(&self) -> &[String];
    fn meta(&self) -> &BTreeMap<String, String>;
}

impl ServiceRecord for CatalogService {
    fn service_name(&self) -> &str {
        &self.service_name
    }

    fn service_id(&self) -> &str {
        &self.service_id
    }

    fn host(&self) -> &str {
        if self.service_address.is_empty() {
            &self.address
        } else {
            &self.service_address
        }
    }

    fn port(&self) -> u16 {
        self.service_port
    }

    fn tags(&self) -> &[String] {
        &self.service_tags
    }

    fn meta(&self) -> &BTreeMap<String, String> {
        &self.service_meta
    }
}

impl ServiceRecord for ServiceEntry {
    fn service_name(&self) -> &str {
        &self.service.service
    }

    fn service_id(&self) -> &str {
        &self.service.id
    }

    fn host(&self) -> &str {
        if self.service.address.is_empty() {
            &self.node.address
        } else {
            &self.service.address
        }
    }

    fn port(&self) -> u16 {
        self.service.port
    }

    fn tags(&self) -> &[String] {
        &self.service.tags
    }

    fn meta(&self) -> &BTreeMap<String, String> {
        &self.service.meta
    }
}

fn split_ips(value: Option<&String>) -> Vec<String> {
    match value {
        Some(joined) if !joined.is_empty() => joined.split(',').map(str::to_string).collect(),
        _ => Vec::new(),
    }
}

/// Rebuild the constructor input a record was registered from.
pub fn decode_descriptor<R: ServiceRecord + ?Sized>(record: &R) -> InstanceDescriptor {
    let mut metadata = record.meta().clone();
    let data_root = metadata.remove(META_DATA_ROOT).unwrap_or_default();
    let lan_ips = split_ips(metadata.get(META_LAN_IP));
    let announced_ips = split_ips(metadata.get(META_ANNOUNCED_IP));

    // The constructor prepends these again.
    let synthesized = [
        registration_tag(TAG_SERVICE_NAME, record.service_name()),
        registration_tag(TAG_INSTANCE_ID, record.service_id()),
    ];
    let mut tags = record.tags();
    for tag in &synthesized {
        match tags.split_first() {
            Some((first, rest)) if first == tag => tags = rest,
            _ => {}
        }
    }

    InstanceDescriptor {
        service_name: record.service_name().to_string(),
        host: record.host().to_string(),
        port: record.port(),
        metadata,
        tags: tags.to_vec(),
        instance_id: record.service_id().to_string(),
        lan_ips,
        announced_ips,
        data_root,
    }
}

fn decode_all<R: ServiceRecord>(
    client: &Arc<Client>,
    name: &str,
    records: Vec<R>,
) -> RegistryResult<Vec<ServiceInstance>> {
    if records.is_empty() {
        return Err(RegistryError::NotFound(format!(
            "no instances of service [{name}]"
        )));
    }
    Ok(records
        .iter()
        .map(|record| ServiceInstance::new(decode_descriptor(record), client.clone()))
        .collect())
}

fn first(mut instances: Vec<ServiceInstance>) -> ServiceInstance {
    instances.swap_remove(0)
}

impl Client {
    fn id_tags(&self, name: &str, id: &str) -> Vec<String> {
        let style = self.config().id_tag_style;
        vec![
            style.tag(TAG_SERVICE_NAME, name),
            style.tag(TAG_INSTANCE_ID, id),
        ]
    }

    /// Catalog instances of `name` carrying every tag in `tags`.
    pub async fn discover_catalog_instances_by_tags(
        self: &Arc<Self>,
        name: &str,
        tags: &[String],
    ) -> RegistryResult<Vec<ServiceInstance>> {
        debug!(service = %name, ?tags, "Catalog discovery");
        let records = self.transport()?.catalog_service(name, tags).await?;
        decode_all(self, name, records)
    }

    /// Every catalog instance of `name`.
    pub async fn discover_catalog_instances_by_name(
        self: &Arc<Self>,
        name: &str,
    ) -> RegistryResult<Vec<ServiceInstance>> {
        self.discover_catalog_instances_by_tags(name, &[]).await
    }

    /// Health-view instances of `name` carrying every tag in `tags`.
    pub async fn discover_health_instances_by_tags(
        self: &Arc<Self>,
        name: &str,
        tags: &[String],
        passing_only: bool,
    ) -> RegistryResult<Vec<ServiceInstance>> {
        debug!(service = %name, ?tags, passing_only, "Health discovery");
        let records = self
            .transport()?
            .health_service(name, tags, passing_only)
            .await?;
        decode_all(self, name, records)
    }

    /// Catalog lookup of a single instance by id.
    pub async fn discover_catalog_instance_by_id(
        self: &Arc<Self>,
        name: &str,
        instance_id: &str,
    ) -> RegistryResult<ServiceInstance> {
        let tags = self.id_tags(name, instance_id);
        self.discover_catalog_instances_by_tags(name, &tags)
            .await
            .map(first)
    }

    /// Health-view lookup of a single instance by id.
    pub async fn discover_health_instance_by_id(
        self: &Arc<Self>,
        name: &str,
        instance_id: &str,
        passing_only: bool,
    ) -> RegistryResult<ServiceInstance> {
        let tags = self.id_tags(name, instance_id);
        self.discover_health_instances_by_tags(name, &tags, passing_only)
            .await
            .map(first)
    }

    /// Instances of `name` from the view selected by `filter`.
    pub async fn discover_instances_by_name(
        self: &Arc<Self>,
        name: &str,
        tags: &[String],
        filter: HealthFilter,
    ) -> RegistryResult<Vec<ServiceInstance>> {
        match filter {
            HealthFilter::Catalog => self.discover_catalog_instances_by_tags(name, tags).await,
            HealthFilter::Health { passing_only } => {
                self.discover_health_instances_by_tags(name, tags, passing_only)
                    .await
            }
        }
    }

    /// Single instance by id from the view selected by `filter`.
    pub async fn discover_instance_by_id(
        self: &Arc<Self>,
        name: &str,
        instance_id: &str,
        filter: HealthFilter,
    ) -> RegistryResult<ServiceInstance> {
        match filter {
            HealthFilter::Catalog => self.discover_catalog_instance_by_id(name, instance_id).await,
            HealthFilter::Health { passing_only } => {
                self.discover_health_instance_by_id(name, instance_id, passing_only)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientConfig, IdTagStyle};
    use crate::transport::{AgentService, HealthNode, MemoryTransport, TransportCall};

    fn client_with(config: ClientConfig) -> (Arc<MemoryTransport>, Arc<Client>) {
        let transport = Arc::new(MemoryTransport::new());
        let client = Client::with_transport(config, transport.clone());
        (transport, Arc::new(client))
    }

    fn orders(client: &Arc<Client>, id: &str) -> ServiceInstance {
        let mut metadata = BTreeMap::new();
        metadata.insert("owner".to_string(), "team-a".to_string());
        ServiceInstance::new(
            InstanceDescriptor::new("orders", id, "10.0.0.5", 8080)
                .tags(["zone=a"])
                .metadata(metadata)
                .lan_ips(["10.0.0.5", "10.0.1.5"])
                .announced_ips(["203.0.113.9"])
                .data_root("cfg"),
            client.clone(),
        )
    }

    #[test]
    fn test_health_filter_from_passing() {
        assert_eq!(HealthFilter::from_passing(-1), HealthFilter::Catalog);
        assert_eq!(
            HealthFilter::from_passing(1),
            HealthFilter::Health { passing_only: true }
        );
        for other in [0, 2, -7] {
            assert_eq!(
                HealthFilter::from_passing(other),
                HealthFilter::Health {
                    passing_only: false
                }
            );
        }
    }

    #[test]
    fn test_decode_prefers_service_address() {
        let mut record = CatalogService {
            address: "192.168.0.1".into(),
            service_id: "orders-1".into(),
            service_name: "orders".into(),
            service_port: 8080,
            ..CatalogService::default()
        };
        assert_eq!(decode_descriptor(&record).host, "192.168.0.1");

        record.service_address = "10.0.0.5".into();
        assert_eq!(decode_descriptor(&record).host, "10.0.0.5");
    }

    #[test]
    fn test_decode_missing_metadata() {
        let entry = ServiceEntry {
            node: HealthNode {
                node: "n1".into(),
                address: "192.168.0.1".into(),
            },
            service: AgentService {
                id: "orders-1".into(),
                service: "orders".into(),
                tags: vec!["serviceName=orders".into(), "instanceId=orders-1".into(), "v2".into()],
                port: 8080,
                ..AgentService::default()
            },
            checks: Vec::new(),
        };
        let descriptor = decode_descriptor(&entry);
        assert!(descriptor.lan_ips.is_empty());
        assert!(descriptor.announced_ips.is_empty());
        assert_eq!(descriptor.data_root, "");
        assert_eq!(descriptor.tags, vec!["v2"]);
        assert_eq!(descriptor.host, "192.168.0.1");
    }

    #[tokio::test]
    async fn test_catalog_by_id_round_trip() {
        let (_, client) = client_with(ClientConfig::default());
        let mut instance = orders(&client, "orders-1");
        instance.register().await.unwrap();

        let found = client
            .discover_catalog_instance_by_id("orders", "orders-1")
            .await
            .unwrap();
        assert_eq!(found.name(), instance.name());
        assert_eq!(found.instance_id(), instance.instance_id());
        assert_eq!(found.host(), instance.host());
        assert_eq!(found.port(), instance.port());
        assert_eq!(found.tags(), instance.tags());
        assert_eq!(found.metadata(), instance.metadata());
        assert_eq!(found.lan_ips(), instance.lan_ips());
        assert_eq!(found.announced_ips(), instance.announced_ips());
        assert_eq!(found.data_root(), "cfg");
        assert!(!found.is_registered());
    }

    #[tokio::test]
    async fn test_round_trip_with_reserved_metadata_key() {
        let (_, client) = client_with(ClientConfig::default());
        let mut metadata = BTreeMap::new();
        metadata.insert("DataRoot".to_string(), "other".to_string());
        metadata.insert("owner".to_string(), "team-a".to_string());
        let mut instance = ServiceInstance::new(
            InstanceDescriptor::new("orders", "orders-1", "10.0.0.5", 8080)
                .metadata(metadata)
                .data_root("cfg"),
            client.clone(),
        );
        instance.register().await.unwrap();

        let found = client
            .discover_catalog_instance_by_id("orders", "orders-1")
            .await
            .unwrap();
        assert_eq!(found.data_root(), "cfg");
        assert_eq!(found.metadata(), instance.metadata());
    }

    #[tokio::test]
    async fn test_by_id_sends_both_identity_tags() {
        let (transport, client) = client_with(ClientConfig::default());
        orders(&client, "orders-1").register().await.unwrap();
        transport.clear_calls();

        client
            .discover_health_instance_by_id("orders", "orders-1", false)
            .await
            .unwrap();
        assert_eq!(
            transport.calls(),
            vec![TransportCall::HealthService {
                name: "orders".into(),
                tags: vec!["serviceName=orders".into(), "instanceId=orders-1".into()],
                passing_only: false,
            }]
        );
    }

    #[tokio::test]
    async fn test_filter_routes_to_view() {
        let (transport, client) = client_with(ClientConfig::default());
        orders(&client, "orders-1").register().await.unwrap();
        transport.clear_calls();

        for passing in [-1, 0, 1] {
            let _ = client
                .discover_instances_by_name("orders", &[], HealthFilter::from_passing(passing))
                .await;
        }
        assert_eq!(
            transport.calls(),
            vec![
                TransportCall::CatalogService {
                    name: "orders".into(),
                    tags: vec![],
                },
                TransportCall::HealthService {
                    name: "orders".into(),
                    tags: vec![],
                    passing_only: false,
                },
                TransportCall::HealthService {
                    name: "orders".into(),
                    tags: vec![],
                    passing_only: true,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_passing_only_excludes_critical() {
        let (transport, client) = client_with(ClientConfig::default());
        let mut healthy = orders(&client, "orders-1")
            .with_check(crate::transport::ServiceCheck::tcp("10.0.0.5:8080", "10s", "1s"));
        let mut sick = orders(&client, "orders-2")
            .with_check(crate::transport::ServiceCheck::tcp("10.0.0.5:8080", "10s", "1s"));
        healthy.register().await.unwrap();
        sick.register().await.unwrap();
        transport.set_check_status("orders-1", "passing");

        let passing = client
            .discover_instances_by_name("orders", &[], HealthFilter::from_passing(1))
            .await
            .unwrap();
        assert_eq!(passing.len(), 1);
        assert_eq!(passing[0].instance_id(), "orders-1");

        let all = client
            .discover_instances_by_name("orders", &[], HealthFilter::from_passing(0))
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_result_is_not_found() {
        let (_, client) = client_with(ClientConfig::default());
        let err = client
            .discover_catalog_instances_by_name("payments")
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let err = client
            .discover_instance_by_id("payments", "p-1", HealthFilter::Catalog)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_tag_filter_requires_all_tags() {
        let (_, client) = client_with(ClientConfig::default());
        orders(&client, "orders-1").register().await.unwrap();

        let found = client
            .discover_catalog_instances_by_tags("orders", &["zone=a".to_string()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);

        let err = client
            .discover_catalog_instances_by_tags(
                "orders",
                &["zone=a".to_string(), "zone=b".to_string()],
            )
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_colon_style_does_not_match_registration_tags() {
        let config = ClientConfig {
            id_tag_style: IdTagStyle::Colon,
            ..ClientConfig::default()
        };
        let (_, client) = client_with(config);
        orders(&client, "orders-1").register().await.unwrap();

        let err = client
            .discover_catalog_instance_by_id("orders", "orders-1")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_disconnected_discovery() {
        let client = Arc::new(Client::disconnected());
        assert!(client
            .discover_catalog_instances_by_name("orders")
            .await
            .unwrap_err()
            .is_not_connected());
    }
}
