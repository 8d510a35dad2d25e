//! Service registry client
//!
//! Client-side access to a Consul-style service registry and KV store:
//!
//! - **Service instances**: build, register and withdraw endpoints with
//!   identity tags, IP metadata and an optional health check
//! - **Discovery**: catalog and health views, by tags or by instance id
//! - **KV namespaces**: rooted keys holding strings, JSON or TOML
//! - **Locks**: session-backed mutual exclusion over a KV key
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           Arc<Client>                             │
//! │   live instance set (DashMap)          discovery (catalog/health) │
//! ├───────────────┬────────────────────────────┬─────────────────────┤
//! │ServiceInstance│        KvNamespace         │        Lock         │
//! │ register /    │  <data_root>/<key>          │ session + acquire   │
//! │ deregister    │  string · json · toml       │ renew · release     │
//! └───────┬───────┴──────────────┬─────────────┴──────────┬──────────┘
//!         └──────────────────────┼────────────────────────┘
//!                                ▼
//!                 Arc<dyn RegistryTransport>
//!                   │                     │
//!             HttpTransport         MemoryTransport
//!          (agent HTTP /v1 API)     (in-process registry)
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use registry_client::{Client, ClientConfig, InstanceDescriptor, ServiceInstance};
//! use std::sync::Arc;
//!
//! # async fn demo() -> registry_client::RegistryResult<()> {
//! let client = Arc::new(Client::connect(ClientConfig::from_env()?)?);
//! let mut instance = ServiceInstance::new(
//!     InstanceDescriptor::new("orders", "orders-1", "10.0.0.5", 8080)
//!         .lan_ips(["10.0.0.5"])
//!         .data_root("orders/config"),
//!     client.clone(),
//! );
//! instance.register().await?;
//!
//! let found = client.discover_catalog_instance_by_id("orders", "orders-1").await?;
//! let threads = found.kv().get_string("threads").await?;
//! # let _ = threads;
//! client.deregister_all().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod instance;
pub mod kv;
pub mod lock;
pub mod transport;

pub use client::Client;
pub use config::{
    ClientConfig, DEFAULT_ADDRESS, ENV_DATACENTER, ENV_HTTP_ADDR, ENV_HTTP_TOKEN, IdTagStyle,
    LockOptions,
};
pub use discovery::{HealthFilter, ServiceRecord, decode_descriptor};
pub use error::{RegistryError, RegistryResult};
pub use instance::{InstanceDescriptor, ServiceInstance};
pub use kv::KvNamespace;
pub use lock::{Lock, RenewOutcome};
pub use transport::{
    HttpTransport, KvPair, MemoryTransport, RegistryTransport, ServiceCheck, ServiceRegistration,
    SessionBehavior, SessionEntry, TransportCall,
};
