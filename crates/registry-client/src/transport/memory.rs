//! In-process registry.
//!
//! Keeps services, KV pairs and sessions in memory and reproduces the
//! registry semantics the client relies on: all-tags matching, health
//! filtering, atomic acquire, session TTL expiry with `delete`/`release`
//! behavior, and lock-delay after a session is invalidated. Every call is
//! recorded so tests can assert on what reached the transport.

use super::{
    AgentService, CatalogService, HealthCheck, HealthNode, KvPair, RegistryTransport,
    ServiceEntry, ServiceRegistration, SessionBehavior, SessionEntry,
};
use crate::error::{RegistryError, RegistryResult};
use async_trait::async_trait;
use humantime_serde::re::humantime::parse_duration;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

const NODE_NAME: &str = "memory";
const NODE_ADDRESS: &str = "127.0.0.1";

/// A primitive call observed by [`MemoryTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    ServiceRegister(String),
    ServiceDeregister(String),
    CatalogService { name: String, tags: Vec<String> },
    HealthService { name: String, tags: Vec<String>, passing_only: bool },
    KvGet(String),
    KvPut(String),
    KvDelete(String),
    KvAcquire { key: String, session: Option<String> },
    KvRelease { key: String, session: Option<String> },
    SessionCreate(String),
    SessionRenew(String),
    SessionDestroy(String),
}

impl TransportCall {
    /// Name of the [`RegistryTransport`] method that produced this call.
    pub fn operation(&self) -> &'static str {
        match self {
            TransportCall::ServiceRegister(_) => "service_register",
            TransportCall::ServiceDeregister(_) => "service_deregister",
            TransportCall::CatalogService { .. } => "catalog_service",
            TransportCall::HealthService { .. } => "health_service",
            TransportCall::KvGet(_) => "kv_get",
            TransportCall::KvPut(_) => "kv_put",
            TransportCall::KvDelete(_) => "kv_delete",
            TransportCall::KvAcquire { .. } => "kv_acquire",
            TransportCall::KvRelease { .. } => "kv_release",
            TransportCall::SessionCreate(_) => "session_create",
            TransportCall::SessionRenew(_) => "session_renew",
            TransportCall::SessionDestroy(_) => "session_destroy",
        }
    }
}

#[derive(Debug)]
struct StoredService {
    registration: ServiceRegistration,
    check_status: Option<String>,
}

#[derive(Debug)]
struct Session {
    behavior: SessionBehavior,
    ttl: Option<Duration>,
    lock_delay: Duration,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct State {
    services: BTreeMap<String, StoredService>,
    kv: BTreeMap<String, KvPair>,
    sessions: HashMap<String, Session>,
    lock_delay_until: HashMap<String, Instant>,
    calls: Vec<TransportCall>,
    next_session: u64,
    next_index: u64,
    unavailable: bool,
    failing: HashSet<&'static str>,
}

impl State {
    fn bump_index(&mut self) -> u64 {
        self.next_index += 1;
        self.next_index
    }

    fn check_available(&self, operation: &str) -> RegistryResult<()> {
        if self.unavailable {
            Err(RegistryError::Transport("connection refused".to_string()))
        } else if self.failing.contains(operation) {
            Err(RegistryError::Transport(format!("{operation}: connection reset")))
        } else {
            Ok(())
        }
    }

    /// Invalidate every session whose TTL has elapsed.
    fn expire_sessions(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.expires_at.is_some_and(|at| at <= now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            debug!(session = %id, "Session TTL elapsed");
            self.invalidate_session(&id, now);
        }
    }

    fn invalidate_session(&mut self, id: &str, now: Instant) {
        let Some(session) = self.sessions.remove(id) else {
            return;
        };
        let held: Vec<String> = self
            .kv
            .values()
            .filter(|pair| pair.session.as_deref() == Some(id))
            .map(|pair| pair.key.clone())
            .collect();
        for key in held {
            match session.behavior {
                SessionBehavior::Delete => {
                    self.kv.remove(&key);
                }
                SessionBehavior::Release => {
                    if let Some(pair) = self.kv.get_mut(&key) {
                        pair.session = None;
                    }
                }
            }
            self.lock_delay_until.insert(key, now + session.lock_delay);
        }
    }

    fn matching<'a>(
        &'a self,
        name: &'a str,
        tags: &'a [String],
    ) -> impl Iterator<Item = &'a StoredService> + 'a {
        self.services.values().filter(move |stored| {
            stored.registration.name == name
                && tags.iter().all(|t| stored.registration.tags.contains(t))
        })
    }
}

/// In-memory [`RegistryTransport`].
#[derive(Debug, Default)]
pub struct MemoryTransport {
    state: Mutex<State>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every call observed so far, oldest first.
    pub fn calls(&self) -> Vec<TransportCall> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Make every subsequent call fail with a transport error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    /// Make every subsequent call of one transport method (e.g.
    /// `"kv_acquire"`) fail with a transport error.
    pub fn fail_operation(&self, operation: &'static str) {
        self.state().failing.insert(operation);
    }

    /// Set the status (`passing`, `warning`, `critical`) of a service's check.
    pub fn set_check_status(&self, service_id: &str, status: &str) -> bool {
        match self.state().services.get_mut(service_id) {
            Some(stored) => {
                stored.check_status = Some(status.to_string());
                true
            }
            None => false,
        }
    }

    /// Invalidate a session immediately, as if its TTL had elapsed.
    pub fn expire_session(&self, session_id: &str) {
        let mut state = self.state();
        state.invalidate_session(session_id, Instant::now());
    }

    /// Ids of currently live sessions.
    pub fn session_ids(&self) -> Vec<String> {
        let mut state = self.state();
        state.expire_sessions(Instant::now());
        let mut ids: Vec<String> = state.sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Registrations currently held, keyed by service id.
    pub fn registrations(&self) -> BTreeMap<String, ServiceRegistration> {
        self.state()
            .services
            .iter()
            .map(|(id, stored)| (id.clone(), stored.registration.clone()))
            .collect()
    }

    /// Run `f` against the state after recording `call` and expiring
    /// sessions.
    fn with_state<T>(
        &self,
        call: TransportCall,
        f: impl FnOnce(&mut State, Instant) -> RegistryResult<T>,
    ) -> RegistryResult<T> {
        let now = Instant::now();
        let mut state = self.state();
        let operation = call.operation();
        state.calls.push(call);
        state.check_available(operation)?;
        state.expire_sessions(now);
        f(&mut state, now)
    }
}

/// Longest lock-delay the registry honours; longer requests are clamped.
const MAX_LOCK_DELAY: Duration = Duration::from_secs(60);

fn invalid_ttl(detail: String) -> RegistryError {
    RegistryError::Http {
        status: 400,
        body: format!("invalid session TTL {detail}"),
    }
}

/// Parse a registry duration such as `15s`, `500ms` or `1m30s`. A bare
/// number is seconds.
fn parse_ttl(ttl: &str) -> RegistryResult<Option<Duration>> {
    let ttl = ttl.trim();
    if ttl.is_empty() {
        return Ok(None);
    }
    if let Ok(secs) = ttl.parse::<u64>() {
        return Ok(Some(Duration::from_secs(secs)));
    }
    parse_duration(ttl)
        .map(Some)
        .map_err(|e| invalid_ttl(format!("{ttl}: {e}")))
}

/// Expiry for a session created or renewed at `now`.
fn expiry(now: Instant, ttl: Option<Duration>) -> RegistryResult<Option<Instant>> {
    match ttl {
        Some(ttl) => now
            .checked_add(ttl)
            .map(Some)
            .ok_or_else(|| invalid_ttl(format!("{ttl:?}: out of range"))),
        None => Ok(None),
    }
}

#[async_trait]
impl RegistryTransport for MemoryTransport {
    async fn service_register(&self, registration: &ServiceRegistration) -> RegistryResult<()> {
        self.with_state(
            TransportCall::ServiceRegister(registration.id.clone()),
            |state, _| {
                let check_status = registration.check.as_ref().map(|_| "critical".to_string());
                state.services.insert(
                    registration.id.clone(),
                    StoredService {
                        registration: registration.clone(),
                        check_status,
                    },
                );
                Ok(())
            },
        )
    }

    async fn service_deregister(&self, service_id: &str) -> RegistryResult<()> {
        self.with_state(
            TransportCall::ServiceDeregister(service_id.to_string()),
            |state, _| {
                state.services.remove(service_id);
                Ok(())
            },
        )
    }

    async fn catalog_service(
        &self,
        name: &str,
        tags: &[String],
    ) -> RegistryResult<Vec<CatalogService>> {
        let call = TransportCall::CatalogService {
            name: name.to_string(),
            tags: tags.to_vec(),
        };
        self.with_state(call, |state, _| {
            Ok(state
                .matching(name, tags)
                .map(|stored| {
                    let r = &stored.registration;
                    CatalogService {
                        node: NODE_NAME.to_string(),
                        address: NODE_ADDRESS.to_string(),
                        service_id: r.id.clone(),
                        service_name: r.name.clone(),
                        service_address: r.address.clone(),
                        service_port: r.port,
                        service_tags: r.tags.clone(),
                        service_meta: r.meta.clone(),
                    }
                })
                .collect())
        })
    }

    async fn health_service(
        &self,
        name: &str,
        tags: &[String],
        passing_only: bool,
    ) -> RegistryResult<Vec<ServiceEntry>> {
        let call = TransportCall::HealthService {
            name: name.to_string(),
            tags: tags.to_vec(),
            passing_only,
        };
        self.with_state(call, |state, _| {
            Ok(state
                .matching(name, tags)
                .map(|stored| {
                    let r = &stored.registration;
                    let mut checks = vec![HealthCheck {
                        check_id: "serfHealth".to_string(),
                        name: "Serf Health Status".to_string(),
                        status: "passing".to_string(),
                    }];
                    if let Some(status) = &stored.check_status {
                        checks.push(HealthCheck {
                            check_id: format!("service:{}", r.id),
                            name: format!("Service '{}' check", r.name),
                            status: status.clone(),
                        });
                    }
                    ServiceEntry {
                        node: HealthNode {
                            node: NODE_NAME.to_string(),
                            address: NODE_ADDRESS.to_string(),
                        },
                        service: AgentService {
                            id: r.id.clone(),
                            service: r.name.clone(),
                            tags: r.tags.clone(),
                            meta: r.meta.clone(),
                            port: r.port,
                            address: r.address.clone(),
                        },
                        checks,
                    }
                })
                .filter(|entry| !passing_only || entry.checks.iter().all(HealthCheck::is_passing))
                .collect())
        })
    }

    async fn kv_get(&self, key: &str) -> RegistryResult<Option<KvPair>> {
        self.with_state(TransportCall::KvGet(key.to_string()), |state, _| {
            Ok(state.kv.get(key).cloned())
        })
    }

    async fn kv_put(&self, pair: &KvPair) -> RegistryResult<()> {
        self.with_state(TransportCall::KvPut(pair.key.clone()), |state, _| {
            let index = state.bump_index();
            let entry = state.kv.entry(pair.key.clone()).or_insert_with(|| KvPair {
                key: pair.key.clone(),
                ..KvPair::default()
            });
            entry.value = pair.value.clone();
            entry.flags = pair.flags;
            entry.modify_index = index;
            Ok(())
        })
    }

    async fn kv_delete(&self, key: &str) -> RegistryResult<()> {
        self.with_state(TransportCall::KvDelete(key.to_string()), |state, _| {
            state.kv.remove(key);
            Ok(())
        })
    }

    async fn kv_acquire(&self, pair: &KvPair) -> RegistryResult<bool> {
        let call = TransportCall::KvAcquire {
            key: pair.key.clone(),
            session: pair.session.clone(),
        };
        self.with_state(call, |state, now| {
            let session = match &pair.session {
                Some(id) if state.sessions.contains_key(id) => id.clone(),
                Some(id) => {
                    return Err(RegistryError::Http {
                        status: 500,
                        body: format!("invalid session \"{id}\""),
                    });
                }
                None => {
                    return Err(RegistryError::Http {
                        status: 400,
                        body: "missing session".to_string(),
                    });
                }
            };

            if state
                .lock_delay_until
                .get(&pair.key)
                .is_some_and(|until| *until > now)
            {
                return Ok(false);
            }

            let index = state.bump_index();
            let entry = state.kv.entry(pair.key.clone()).or_insert_with(|| KvPair {
                key: pair.key.clone(),
                ..KvPair::default()
            });
            if entry.session.as_ref().is_some_and(|holder| *holder != session) {
                return Ok(false);
            }
            if entry.session.is_none() {
                entry.lock_index += 1;
            }
            entry.session = Some(session);
            entry.value = pair.value.clone();
            entry.flags = pair.flags;
            entry.modify_index = index;
            Ok(true)
        })
    }

    async fn kv_release(&self, pair: &KvPair) -> RegistryResult<bool> {
        let call = TransportCall::KvRelease {
            key: pair.key.clone(),
            session: pair.session.clone(),
        };
        self.with_state(call, |state, _| {
            let index = state.bump_index();
            match state.kv.get_mut(&pair.key) {
                Some(entry) if entry.session.is_some() && entry.session == pair.session => {
                    entry.session = None;
                    entry.modify_index = index;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    async fn session_create(&self, entry: &SessionEntry) -> RegistryResult<String> {
        self.with_state(
            TransportCall::SessionCreate(entry.name.clone()),
            |state, now| {
                let ttl = parse_ttl(&entry.ttl)?;
                let expires_at = expiry(now, ttl)?;
                state.next_session += 1;
                let id = format!("session-{}", state.next_session);
                state.sessions.insert(
                    id.clone(),
                    Session {
                        behavior: entry.behavior,
                        ttl,
                        lock_delay: entry.lock_delay.min(MAX_LOCK_DELAY),
                        expires_at,
                    },
                );
                Ok(id)
            },
        )
    }

    async fn session_renew(&self, session_id: &str) -> RegistryResult<()> {
        self.with_state(
            TransportCall::SessionRenew(session_id.to_string()),
            |state, now| match state.sessions.get_mut(session_id) {
                Some(session) => {
                    session.expires_at = expiry(now, session.ttl)?;
                    Ok(())
                }
                None => Err(RegistryError::NotFound(format!(
                    "Session id '{session_id}' not found"
                ))),
            },
        )
    }

    async fn session_destroy(&self, session_id: &str) -> RegistryResult<()> {
        self.with_state(
            TransportCall::SessionDestroy(session_id.to_string()),
            |state, now| {
                state.invalidate_session(session_id, now);
                Ok(())
            },
        )
    }
}
