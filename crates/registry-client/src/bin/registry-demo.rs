//! Exercise a registry agent: KV round trip, register + discover, locking.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use registry_client::{
    Client, ClientConfig, HealthFilter, InstanceDescriptor, LockOptions, MemoryTransport,
    ServiceCheck, ServiceInstance,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "registry-demo")]
#[command(about = "Exercise a service registry agent")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, default_value = "info")]
    log_level: String,

    /// YAML or TOML client config; `REGISTRY_*` environment variables otherwise
    #[arg(long)]
    config: Option<PathBuf>,

    /// Agent host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Agent HTTP port (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// ACL token (overrides config)
    #[arg(long)]
    token: Option<String>,

    /// Use an in-process registry instead of an agent
    #[arg(long)]
    memory: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Set, read back and delete a key
    Kv {
        #[arg(long, default_value = "key")]
        key: String,

        #[arg(long, default_value = "value")]
        value: String,

        #[arg(long, default_value = "")]
        root: String,
    },

    /// Register an instance, discover it and deregister it
    Discovery {
        #[arg(long, default_value = "test-service")]
        service: String,

        #[arg(long, default_value = "instance-1")]
        instance_id: String,

        #[arg(long, default_value = "127.0.0.1")]
        address: String,

        #[arg(long, default_value = "80")]
        service_port: u16,

        /// -1 catalog, 1 passing health, anything else unfiltered health
        #[arg(long, default_value = "1", allow_hyphen_values = true)]
        passing: i32,

        /// HTTP health check URL
        #[arg(long)]
        check_url: Option<String>,
    },

    /// Acquire a lock, renew it and release it
    Lock {
        #[arg(long, default_value = "demo-lock")]
        key: String,

        #[arg(long, default_value = "holder")]
        value: String,

        #[arg(long, default_value = "locks")]
        root: String,

        #[arg(long, default_value = "15s")]
        ttl: String,
    },
}

fn build_client(cli: &Cli) -> Result<Arc<Client>> {
    let mut config = match &cli.config {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ClientConfig::from_env().context("Invalid REGISTRY_* environment")?,
    };
    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(token) = &cli.token {
        config.token = token.clone();
    }

    let client = if cli.memory {
        info!("Using in-process registry");
        Client::with_transport(config, Arc::new(MemoryTransport::new()))
    } else {
        Client::connect(config).context("Failed to build registry client")?
    };
    Ok(Arc::new(client))
}

async fn run_kv(client: &Client, key: &str, value: &str, root: &str) -> Result<()> {
    let kv = client.kv(root);
    kv.set_string(key, value)
        .await
        .with_context(|| format!("Failed to set {}", kv.real_key(key)))?;

    let read = kv.get_string(key).await.context("Failed to read back")?;
    println!("get val: {read}");

    kv.delete(key).await.context("Failed to delete")?;
    Ok(())
}

async fn run_discovery(
    client: &Arc<Client>,
    descriptor: InstanceDescriptor,
    passing: i32,
    check_url: Option<String>,
) -> Result<()> {
    let mut instance = ServiceInstance::new(descriptor, client.clone());
    if let Some(url) = check_url {
        instance.set_check(Some(ServiceCheck::http(url, "10s", "5s")));
    }
    instance.register().await.context("Failed to register")?;

    let result = client
        .discover_instances_by_name(instance.name(), &[], HealthFilter::from_passing(passing))
        .await;
    match result {
        Ok(found) => {
            for ins in &found {
                println!(
                    "discovered {} id={} addr={}:{} tags={:?} meta={:?}",
                    ins.name(),
                    ins.instance_id(),
                    ins.host(),
                    ins.port(),
                    ins.tags(),
                    ins.metadata()
                );
            }
        }
        Err(e) if e.is_not_found() => println!("no instances of {}", instance.name()),
        Err(e) => warn!(error = %e, "Discovery failed"),
    }

    instance.deregister().await.context("Failed to deregister")?;
    Ok(())
}

async fn run_lock(client: &Client, key: &str, value: &str, root: &str, ttl: &str) -> Result<()> {
    let kv = client.kv(root);
    let Some(lock) = kv
        .acquire_lock(key, value, &LockOptions::with_ttl(ttl))
        .await
        .context("Lock acquire failed")?
    else {
        println!("lock {} is held elsewhere", kv.real_key(key));
        return Ok(());
    };
    println!("acquired {} with session {}", kv.real_key(key), lock.session());

    let outcome = kv.renew(key).await.context("Lock lookup failed")?;
    println!("renewed: {}", outcome.is_renewed());

    let released = lock.release().await.context("Lock release failed")?;
    println!("released: {released}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(cli.log_level.as_str())
        .init();

    let client = build_client(&cli)?;
    info!(address = %client.config().address(), "Registry demo starting");

    match cli.command {
        Commands::Kv { key, value, root } => run_kv(&client, &key, &value, &root).await?,
        Commands::Discovery {
            service,
            instance_id,
            address,
            service_port,
            passing,
            check_url,
        } => {
            let descriptor = InstanceDescriptor::new(service, instance_id, address, service_port)
                .data_root("test");
            run_discovery(&client, descriptor, passing, check_url).await?;
        }
        Commands::Lock {
            key,
            value,
            root,
            ttl,
        } => run_lock(&client, &key, &value, &root, &ttl).await?,
    }

    client
        .deregister_all()
        .await
        .context("Failed to withdraw registrations")?;
    Ok(())
}
