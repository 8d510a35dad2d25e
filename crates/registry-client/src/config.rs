//! Client and lock configuration.
//!
//! `ClientConfig` covers connection bootstrap (agent address, ACL token,
//! datacenter, request timeout) and the tag format used for id lookups.
//! `LockOptions` carries the session TTL and retry policy for KV locks;
//! both TTL and lock-delay affect liveness after a holder crashes, so they
//! are inputs rather than constants.

use crate::error::{RegistryError, RegistryResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Agent address used when no usable host/port is configured.
pub const DEFAULT_ADDRESS: &str = "127.0.0.1:8500";

/// Environment variable overriding the agent address (`host:port`).
pub const ENV_HTTP_ADDR: &str = "REGISTRY_HTTP_ADDR";
/// Environment variable carrying the ACL token.
pub const ENV_HTTP_TOKEN: &str = "REGISTRY_HTTP_TOKEN";
/// Environment variable selecting the datacenter.
pub const ENV_DATACENTER: &str = "REGISTRY_DATACENTER";

/// Separator used when building id-lookup filter tags.
///
/// Registration always tags instances with `serviceName=<name>` and
/// `instanceId=<id>`. `Equals` filters with the same format, so a lookup
/// by id finds instances registered by this crate. `Colon` produces the
/// older `serviceName:<name>` / `instanceId:<id>` filter tags, which only
/// match instances tagged that way by some other registrar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdTagStyle {
    /// `key=value`
    #[default]
    Equals,
    /// `key:value`
    Colon,
}

impl IdTagStyle {
    /// Format a single filter tag.
    pub fn tag(self, key: &str, value: &str) -> String {
        match self {
            IdTagStyle::Equals => format!("{key}={value}"),
            IdTagStyle::Colon => format!("{key}:{value}"),
        }
    }
}

/// Connection settings for the registry agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Agent host name or IP.
    pub host: String,
    /// Agent HTTP port.
    pub port: u16,
    /// ACL token sent with every request (empty for none).
    pub token: String,
    /// `http` or `https`.
    pub scheme: String,
    /// Datacenter to query (agent default when unset).
    pub datacenter: Option<String>,
    /// Per-request deadline applied by the HTTP client.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Tag format for id lookups.
    pub id_tag_style: IdTagStyle,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 0,
            token: String::new(),
            scheme: "http".to_string(),
            datacenter: None,
            request_timeout: Duration::from_secs(10),
            id_tag_style: IdTagStyle::default(),
        }
    }
}

impl ClientConfig {
    /// Create a config for the given agent.
    pub fn new(host: impl Into<String>, port: u16, token: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            token: token.into(),
            ..Self::default()
        }
    }

    /// The `host:port` the client talks to.
    ///
    /// Short host strings (three characters or fewer) and port 0 are not
    /// considered usable, in which case [`DEFAULT_ADDRESS`] is used.
    pub fn address(&self) -> String {
        if self.host.len() > 3 && self.port > 0 {
            format!("{}:{}", self.host, self.port)
        } else {
            DEFAULT_ADDRESS.to_string()
        }
    }

    /// Base URL of the agent HTTP API, without trailing slash.
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme, self.address())
    }

    /// Overlay settings from `REGISTRY_*` environment variables.
    pub fn from_env() -> RegistryResult<Self> {
        let mut config = Self::default();
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> RegistryResult<()> {
        if let Some(addr) = lookup(ENV_HTTP_ADDR) {
            let (scheme, rest) = match addr.split_once("://") {
                Some((scheme, rest)) => (Some(scheme.to_string()), rest.to_string()),
                None => (None, addr),
            };
            let (host, port) = rest.rsplit_once(':').ok_or_else(|| {
                RegistryError::Config(format!("{ENV_HTTP_ADDR} must be host:port, got {rest}"))
            })?;
            self.host = host.to_string();
            self.port = port
                .parse()
                .map_err(|e| RegistryError::Config(format!("invalid port {port}: {e}")))?;
            if let Some(scheme) = scheme {
                self.scheme = scheme;
            }
        }
        if let Some(token) = lookup(ENV_HTTP_TOKEN) {
            self.token = token;
        }
        if let Some(dc) = lookup(ENV_DATACENTER) {
            self.datacenter = Some(dc);
        }
        Ok(())
    }

    /// Load from a YAML (`.yaml`/`.yml`) or TOML (`.toml`) file.
    pub fn load(path: &Path) -> RegistryResult<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| RegistryError::Config(format!("{}: {e}", path.display())))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&contents)
                .map_err(|e| RegistryError::Config(e.to_string())),
            Some("toml") => {
                toml::from_str(&contents).map_err(|e| RegistryError::Config(e.to_string()))
            }
            other => Err(RegistryError::Config(format!(
                "unsupported config format: {}",
                other.unwrap_or("<none>")
            ))),
        }
    }
}

/// Session and retry policy for KV locks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockOptions {
    /// Session TTL in registry duration syntax, e.g. `"15s"`.
    pub ttl: String,
    /// Wait the registry enforces before a released key can be re-acquired.
    #[serde(with = "humantime_serde")]
    pub lock_delay: Duration,
    /// Total acquire attempts per call.
    pub max_attempts: u32,
    /// Sleep between failed attempts.
    #[serde(with = "humantime_serde")]
    pub backoff: Duration,
    /// Destroy the session when the lock was not obtained.
    pub release_session_on_failure: bool,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: "15s".to_string(),
            lock_delay: Duration::from_micros(1),
            max_attempts: 2,
            backoff: Duration::from_micros(10),
            release_session_on_failure: false,
        }
    }
}

impl LockOptions {
    /// Default policy with a different TTL.
    pub fn with_ttl(ttl: impl Into<String>) -> Self {
        Self {
            ttl: ttl.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_address_uses_host_and_port() {
        let config = ClientConfig::new("consul.local", 8500, "");
        assert_eq!(config.address(), "consul.local:8500");
        assert_eq!(config.base_url(), "http://consul.local:8500");
    }

    #[test]
    fn test_address_falls_back_for_short_host_or_zero_port() {
        assert_eq!(ClientConfig::new("abc", 8500, "").address(), DEFAULT_ADDRESS);
        assert_eq!(ClientConfig::new("10.0.0.1", 0, "").address(), DEFAULT_ADDRESS);
        assert_eq!(ClientConfig::default().address(), DEFAULT_ADDRESS);
    }

    #[test]
    fn test_id_tag_style() {
        assert_eq!(IdTagStyle::Equals.tag("instanceId", "a-1"), "instanceId=a-1");
        assert_eq!(IdTagStyle::Colon.tag("instanceId", "a-1"), "instanceId:a-1");
    }

    #[test]
    fn test_env_overlay() {
        let vars: HashMap<&str, &str> = [
            (ENV_HTTP_ADDR, "https://registry.internal:8501"),
            (ENV_HTTP_TOKEN, "secret"),
            (ENV_DATACENTER, "dc2"),
        ]
        .into_iter()
        .collect();

        let mut config = ClientConfig::default();
        config
            .apply_env(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.host, "registry.internal");
        assert_eq!(config.port, 8501);
        assert_eq!(config.scheme, "https");
        assert_eq!(config.token, "secret");
        assert_eq!(config.datacenter.as_deref(), Some("dc2"));
    }

    #[test]
    fn test_env_overlay_rejects_bad_port() {
        let mut config = ClientConfig::default();
        let result = config.apply_env(|name| {
            (name == ENV_HTTP_ADDR).then(|| "registry.internal:http".to_string())
        });
        assert!(matches!(result, Err(RegistryError::Config(_))));
    }

    #[test]
    fn test_load_yaml() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "host: consul.local\nport: 8500\ntoken: abc\nrequest_timeout: 3s\nid_tag_style: colon"
        )
        .unwrap();

        let config = ClientConfig::load(file.path()).unwrap();
        assert_eq!(config.address(), "consul.local:8500");
        assert_eq!(config.token, "abc");
        assert_eq!(config.request_timeout, Duration::from_secs(3));
        assert_eq!(config.id_tag_style, IdTagStyle::Colon);
        assert_eq!(config.scheme, "http");
    }

    #[test]
    fn test_load_toml() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "host = \"consul.local\"\nport = 8500\ndatacenter = \"eu1\"").unwrap();

        let config = ClientConfig::load(file.path()).unwrap();
        assert_eq!(config.datacenter.as_deref(), Some("eu1"));
        assert_eq!(config.id_tag_style, IdTagStyle::Equals);
    }

    #[test]
    fn test_load_rejects_unknown_extension() {
        let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        assert!(matches!(
            ClientConfig::load(file.path()),
            Err(RegistryError::Config(_))
        ));
    }

    #[test]
    fn test_lock_options_defaults() {
        let options = LockOptions::default();
        assert_eq!(options.ttl, "15s");
        assert_eq!(options.max_attempts, 2);
        assert_eq!(options.lock_delay, Duration::from_micros(1));
        assert!(!options.release_session_on_failure);
        assert_eq!(LockOptions::with_ttl("30s").ttl, "30s");
    }
}
