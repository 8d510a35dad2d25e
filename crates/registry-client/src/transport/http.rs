//! Agent HTTP API transport.
//!
//! Maps each [`RegistryTransport`] primitive onto one `/v1/...` request.
//! KV values travel base64-encoded in GET responses and as raw bodies in
//! PUT requests, matching the agent's wire format.

use super::{
    CatalogService, KvPair, RegistryTransport, ServiceEntry, ServiceRegistration, SessionEntry,
};
use crate::config::ClientConfig;
use crate::error::{RegistryError, RegistryResult};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Header carrying the ACL token.
const TOKEN_HEADER: &str = "X-Consul-Token";

/// Transport backed by the registry agent's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    base: Url,
    token: String,
    datacenter: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireKvPair {
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    session: Option<String>,
    #[serde(default)]
    flags: u64,
    #[serde(default)]
    modify_index: u64,
    #[serde(default)]
    lock_index: u64,
}

impl WireKvPair {
    fn into_pair(self) -> RegistryResult<KvPair> {
        let value = match self.value {
            Some(encoded) => Some(
                BASE64
                    .decode(encoded.as_bytes())
                    .map_err(|e| RegistryError::Decode(format!("value of {}: {e}", self.key)))?,
            ),
            None => None,
        };
        Ok(KvPair {
            key: self.key,
            value,
            session: self.session.filter(|s| !s.is_empty()),
            flags: self.flags,
            modify_index: self.modify_index,
            lock_index: self.lock_index,
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct WireSessionEntry<'a> {
    name: &'a str,
    behavior: &'static str,
    #[serde(rename = "TTL")]
    ttl: &'a str,
    /// Duration string the agent parses with Go duration syntax.
    lock_delay: String,
}

#[derive(Debug, Deserialize)]
struct WireSessionId {
    #[serde(rename = "ID")]
    id: String,
}

impl HttpTransport {
    /// Build a transport for the agent described by `config`.
    pub fn new(config: &ClientConfig) -> RegistryResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        let base = Url::parse(&config.base_url())
            .map_err(|e| RegistryError::Config(format!("invalid agent address: {e}")))?;

        Ok(Self {
            http,
            base,
            token: config.token.clone(),
            datacenter: config.datacenter.clone(),
        })
    }

    /// Base URL requests are issued against.
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// `/v1/<prefix...>/<tail>`; `tail` may itself contain `/`.
    fn url(&self, prefix: &[&str], tail: &str) -> RegistryResult<Url> {
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| RegistryError::Config(format!("cannot-be-a-base url {}", self.base)))?;
            segments.pop_if_empty().push("v1").extend(prefix);
            if !tail.is_empty() {
                segments.extend(tail.split('/'));
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let mut request = self.http.request(method, url);
        if !self.token.is_empty() {
            request = request.header(TOKEN_HEADER, &self.token);
        }
        if let Some(dc) = &self.datacenter {
            request = request.query(&[("dc", dc)]);
        }
        request
    }

    async fn send(&self, request: RequestBuilder) -> RegistryResult<Response> {
        let response = request.send().await?;
        self.check(response).await
    }

    async fn check(&self, response: Response) -> RegistryResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        warn!(status = %status, body = %body, "Registry request failed");
        Err(RegistryError::Http {
            status: status.as_u16(),
            body,
        })
    }

    async fn put_kv(&self, pair: &KvPair, lock: Option<(&str, &str)>) -> RegistryResult<bool> {
        let url = self.url(&["kv"], &pair.key)?;
        let mut request = self.request(Method::PUT, url);
        if pair.flags != 0 {
            request = request.query(&[("flags", pair.flags)]);
        }
        if let Some(param) = lock {
            request = request.query(&[param]);
        }
        let body = pair.value.clone().unwrap_or_default();
        let response = self.send(request.body(body)).await?;
        Ok(response.json::<bool>().await?)
    }

    fn lock_session(pair: &KvPair) -> RegistryResult<&str> {
        pair.session.as_deref().ok_or_else(|| {
            RegistryError::Transport(format!("lock operation on {} without a session", pair.key))
        })
    }
}

#[async_trait]
impl RegistryTransport for HttpTransport {
    async fn service_register(&self, registration: &ServiceRegistration) -> RegistryResult<()> {
        debug!(service_id = %registration.id, name = %registration.name, "PUT agent/service/register");
        let url = self.url(&["agent", "service", "register"], "")?;
        self.send(self.request(Method::PUT, url).json(registration))
            .await?;
        Ok(())
    }

    async fn service_deregister(&self, service_id: &str) -> RegistryResult<()> {
        debug!(service_id = %service_id, "PUT agent/service/deregister");
        let url = self.url(&["agent", "service", "deregister", service_id], "")?;
        self.send(self.request(Method::PUT, url)).await?;
        Ok(())
    }

    async fn catalog_service(
        &self,
        name: &str,
        tags: &[String],
    ) -> RegistryResult<Vec<CatalogService>> {
        let url = self.url(&["catalog", "service", name], "")?;
        let mut request = self.request(Method::GET, url);
        for tag in tags {
            request = request.query(&[("tag", tag)]);
        }
        let response = self.send(request).await?;
        Ok(response.json().await?)
    }

    async fn health_service(
        &self,
        name: &str,
        tags: &[String],
        passing_only: bool,
    ) -> RegistryResult<Vec<ServiceEntry>> {
        let url = self.url(&["health", "service", name], "")?;
        let mut request = self.request(Method::GET, url);
        for tag in tags {
            request = request.query(&[("tag", tag)]);
        }
        if passing_only {
            request = request.query(&[("passing", "true")]);
        }
        let response = self.send(request).await?;
        Ok(response.json().await?)
    }

    async fn kv_get(&self, key: &str) -> RegistryResult<Option<KvPair>> {
        let url = self.url(&["kv"], key)?;
        let response = self.request(Method::GET, url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = self.check(response).await?;
        let pairs: Vec<WireKvPair> = response.json().await?;
        pairs.into_iter().next().map(WireKvPair::into_pair).transpose()
    }

    async fn kv_put(&self, pair: &KvPair) -> RegistryResult<()> {
        self.put_kv(pair, None).await?;
        Ok(())
    }

    async fn kv_delete(&self, key: &str) -> RegistryResult<()> {
        let url = self.url(&["kv"], key)?;
        self.send(self.request(Method::DELETE, url)).await?;
        Ok(())
    }

    async fn kv_acquire(&self, pair: &KvPair) -> RegistryResult<bool> {
        let session = Self::lock_session(pair)?;
        self.put_kv(pair, Some(("acquire", session))).await
    }

    async fn kv_release(&self, pair: &KvPair) -> RegistryResult<bool> {
        let session = Self::lock_session(pair)?;
        self.put_kv(pair, Some(("release", session))).await
    }

    async fn session_create(&self, entry: &SessionEntry) -> RegistryResult<String> {
        let url = self.url(&["session", "create"], "")?;
        let body = WireSessionEntry {
            name: &entry.name,
            behavior: entry.behavior.as_str(),
            ttl: &entry.ttl,
            lock_delay: format!("{}ns", entry.lock_delay.as_nanos()),
        };
        let response = self.send(self.request(Method::PUT, url).json(&body)).await?;
        let created: WireSessionId = response.json().await?;
        Ok(created.id)
    }

    async fn session_renew(&self, session_id: &str) -> RegistryResult<()> {
        let url = self.url(&["session", "renew", session_id], "")?;
        match self.send(self.request(Method::PUT, url)).await {
            // The agent answers 404 once the session is gone.
            Err(RegistryError::Http { status: 404, body }) => Err(RegistryError::NotFound(body)),
            other => other.map(|_| ()),
        }
    }

    async fn session_destroy(&self, session_id: &str) -> RegistryResult<()> {
        let url = self.url(&["session", "destroy", session_id], "")?;
        self.send(self.request(Method::PUT, url)).await?;
        Ok(())
    }
}
