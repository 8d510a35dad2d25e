//! Session-backed KV locks.
//!
//! # Protocol
//!
//! ```text
//!   session_create(name = key, behavior = delete, ttl, lock_delay)
//!          │
//!          ▼
//!   kv_acquire(<root>/key, session, value) ──true──► Acquired
//!          │ false
//!          ▼
//!   sleep(backoff), retry until max_attempts ──► NotAcquired (Ok(false))
//! ```
//!
//! Mutual exclusion is provided by the registry's atomic acquire, not by
//! anything in this process; the retry loop only smooths over a holder
//! that is releasing at the same moment. `NotAcquired` is a normal
//! outcome. The session created for a failed attempt stays alive until
//! its TTL runs out unless [`LockOptions::release_session_on_failure`]
//! is set.

use crate::config::LockOptions;
use crate::error::{RegistryError, RegistryResult};
use crate::kv::KvNamespace;
use crate::transport::{KvPair, SessionBehavior, SessionEntry};
use tracing::{debug, info, warn};

/// Result of [`KvNamespace::renew`] once the lock key was found.
#[derive(Debug)]
pub enum RenewOutcome {
    /// The holder's session TTL was reset.
    Renewed { session: String },
    /// A holder record was found but the registry refused the renewal,
    /// typically because the session already expired.
    Rejected {
        session: Option<String>,
        error: RegistryError,
    },
}

impl RenewOutcome {
    pub fn is_renewed(&self) -> bool {
        matches!(self, RenewOutcome::Renewed { .. })
    }

    /// Collapse into a plain result, discarding the session id.
    pub fn into_result(self) -> RegistryResult<()> {
        match self {
            RenewOutcome::Renewed { .. } => Ok(()),
            RenewOutcome::Rejected { error, .. } => Err(error),
        }
    }
}

/// A held lock: the rooted key plus the session that owns it.
#[derive(Debug, Clone)]
pub struct Lock {
    namespace: KvNamespace,
    key: String,
    session: String,
}

impl Lock {
    /// Logical key, relative to the namespace root.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Reset the session TTL.
    pub async fn renew(&self) -> RegistryResult<()> {
        self.namespace.transport()?.session_renew(&self.session).await
    }

    /// Release the key and destroy the session.
    pub async fn release(self) -> RegistryResult<bool> {
        self.namespace.release(&self.key, &self.session).await
    }
}

impl KvNamespace {
    /// Try to take the lock at `key`, writing `value` as the holder record.
    ///
    /// Returns `Ok(false)` when another session holds the key for the
    /// whole retry window.
    pub async fn acquire(&self, key: &str, value: &str, options: &LockOptions) -> RegistryResult<bool> {
        Ok(self.acquire_lock(key, value, options).await?.is_some())
    }

    /// Like [`KvNamespace::acquire`], returning a [`Lock`] handle on success.
    pub async fn acquire_lock(
        &self,
        key: &str,
        value: &str,
        options: &LockOptions,
    ) -> RegistryResult<Option<Lock>> {
        let transport = self.transport()?;
        let session = transport
            .session_create(&SessionEntry {
                name: key.to_string(),
                behavior: SessionBehavior::Delete,
                ttl: options.ttl.clone(),
                lock_delay: options.lock_delay,
            })
            .await?;

        let real_key = self.real_key(key);
        let pair = KvPair::new(real_key.clone(), value).with_session(session.clone());
        let attempts = options.max_attempts.max(1);

        let mut failure = None;
        for attempt in 1..=attempts {
            match transport.kv_acquire(&pair).await {
                Ok(true) => {
                    info!(key = %real_key, session = %session, attempt, "Lock acquired");
                    return Ok(Some(Lock {
                        namespace: self.clone(),
                        key: key.to_string(),
                        session,
                    }));
                }
                Ok(false) => {
                    debug!(key = %real_key, attempt, "Lock held elsewhere");
                    if attempt < attempts {
                        tokio::time::sleep(options.backoff).await;
                    }
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if options.release_session_on_failure {
            if let Err(e) = transport.session_destroy(&session).await {
                warn!(session = %session, error = %e, "Failed to destroy lock session");
            }
        }
        match failure {
            Some(e) => {
                warn!(key = %real_key, error = %e, "Lock acquire failed");
                Err(e)
            }
            None => {
                warn!(key = %real_key, attempts, "Lock not acquired");
                Ok(None)
            }
        }
    }

    /// Renew the session of whoever holds `key`.
    ///
    /// `Err` means the holder record could not be read (absent key,
    /// absent value, transport failure). `Ok(Rejected)` means a record was
    /// found but its session could not be renewed.
    pub async fn renew(&self, key: &str) -> RegistryResult<RenewOutcome> {
        let transport = self.transport()?;
        let real_key = self.real_key(key);
        let pair = self
            .pair(key)
            .await?
            .filter(|pair| pair.value.is_some())
            .ok_or_else(|| RegistryError::NotFound(format!("value of key[{real_key}] is nil")))?;

        let Some(session) = pair.session else {
            return Ok(RenewOutcome::Rejected {
                session: None,
                error: RegistryError::NotFound(format!("key[{real_key}] has no session")),
            });
        };

        match transport.session_renew(&session).await {
            Ok(()) => {
                debug!(key = %real_key, session = %session, "Lock session renewed");
                Ok(RenewOutcome::Renewed { session })
            }
            Err(error) => {
                warn!(key = %real_key, session = %session, error = %error, "Lock renewal rejected");
                Ok(RenewOutcome::Rejected {
                    session: Some(session),
                    error,
                })
            }
        }
    }

    /// Release `key` held by `session` and destroy the session.
    pub async fn release(&self, key: &str, session: &str) -> RegistryResult<bool> {
        let transport = self.transport()?;
        let real_key = self.real_key(key);
        let mut pair = KvPair {
            key: real_key.clone(),
            session: Some(session.to_string()),
            ..KvPair::default()
        };
        if let Some(current) = self.pair(key).await? {
            pair.value = current.value;
        }
        let released = transport.kv_release(&pair).await?;
        transport.session_destroy(session).await?;
        info!(key = %real_key, session = %session, released, "Lock released");
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryTransport, RegistryTransport, TransportCall};
    use std::sync::Arc;
    use std::time::Duration;

    fn namespace(root: &str) -> (Arc<MemoryTransport>, KvNamespace) {
        let transport = Arc::new(MemoryTransport::new());
        let ns = KvNamespace::new(Some(transport.clone() as Arc<dyn RegistryTransport>), root);
        (transport, ns)
    }

    fn fast_options() -> LockOptions {
        LockOptions {
            lock_delay: Duration::ZERO,
            ..LockOptions::default()
        }
    }

    #[tokio::test]
    async fn test_acquire_creates_session_and_writes_value() {
        let (transport, ns) = namespace("locks");
        assert!(ns.acquire("job", "worker-1", &fast_options()).await.unwrap());

        let pair = transport.kv_get("locks/job").await.unwrap().unwrap();
        assert_eq!(pair.value.as_deref(), Some(b"worker-1".as_slice()));
        assert_eq!(pair.session.as_deref(), Some("session-1"));
        assert_eq!(transport.calls()[0], TransportCall::SessionCreate("job".into()));
    }

    #[tokio::test]
    async fn test_second_acquirer_gets_false_after_two_attempts() {
        let (transport, ns) = namespace("locks");
        assert!(ns.acquire("job", "a", &fast_options()).await.unwrap());
        transport.clear_calls();

        assert!(!ns.acquire("job", "b", &fast_options()).await.unwrap());
        let attempts = transport
            .calls()
            .into_iter()
            .filter(|c| matches!(c, TransportCall::KvAcquire { .. }))
            .count();
        assert_eq!(attempts, 2);
        // The losing session is left to expire.
        assert_eq!(transport.session_ids().len(), 2);
    }

    #[tokio::test]
    async fn test_release_session_on_failure() {
        let (transport, ns) = namespace("");
        assert!(ns.acquire("job", "a", &fast_options()).await.unwrap());

        let options = LockOptions {
            release_session_on_failure: true,
            ..fast_options()
        };
        assert!(!ns.acquire("job", "b", &options).await.unwrap());
        assert_eq!(transport.session_ids(), vec!["session-1".to_string()]);
    }

    #[tokio::test]
    async fn test_acquire_after_holder_expires() {
        let (transport, ns) = namespace("locks");
        let lock = ns.acquire_lock("job", "a", &fast_options()).await.unwrap().unwrap();
        assert!(!ns.acquire("job", "b", &fast_options()).await.unwrap());

        transport.expire_session(lock.session());
        assert!(ns.acquire("job", "b", &fast_options()).await.unwrap());
        assert_eq!(ns.get_string("job").await.unwrap(), "b");
    }

    #[tokio::test]
    async fn test_acquire_error_destroys_session_when_asked() {
        let (transport, ns) = namespace("locks");
        transport.fail_operation("kv_acquire");
        let options = LockOptions {
            release_session_on_failure: true,
            ..fast_options()
        };

        assert!(matches!(
            ns.acquire("job", "a", &options).await,
            Err(RegistryError::Transport(_))
        ));
        assert!(transport.session_ids().is_empty());
        assert_eq!(
            transport.calls().last(),
            Some(&TransportCall::SessionDestroy("session-1".into()))
        );
    }

    #[tokio::test]
    async fn test_failed_session_cleanup_still_reports_not_acquired() {
        let (transport, ns) = namespace("locks");
        assert!(ns.acquire("job", "a", &fast_options()).await.unwrap());
        transport.fail_operation("session_destroy");

        let options = LockOptions {
            release_session_on_failure: true,
            ..fast_options()
        };
        assert!(!ns.acquire("job", "b", &options).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_after_lock_delay_elapses() {
        let (transport, ns) = namespace("locks");
        let options = LockOptions {
            lock_delay: Duration::from_secs(5),
            ..LockOptions::default()
        };
        let lock = ns.acquire_lock("job", "a", &options).await.unwrap().unwrap();

        transport.expire_session(lock.session());
        assert!(!ns.acquire("job", "b", &options).await.unwrap());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(ns.acquire("job", "b", &options).await.unwrap());
        assert_eq!(ns.get_string("job").await.unwrap(), "b");
    }

    #[tokio::test]
    async fn test_out_of_range_ttl_is_error() {
        let (_, ns) = namespace("locks");
        let err = ns
            .acquire("job", "a", &LockOptions::with_ttl("3000000000000000h"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Http { status: 400, .. }));
    }

    #[tokio::test]
    async fn test_transport_error_aborts() {
        let (transport, ns) = namespace("locks");
        transport.set_unavailable(true);
        assert!(matches!(
            ns.acquire("job", "a", &fast_options()).await,
            Err(RegistryError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_renew_live_session() {
        let (_, ns) = namespace("locks");
        ns.acquire("job", "a", &fast_options()).await.unwrap();

        let outcome = ns.renew("job").await.unwrap();
        assert!(outcome.is_renewed());
        assert!(matches!(outcome, RenewOutcome::Renewed { ref session } if session == "session-1"));
    }

    #[tokio::test]
    async fn test_renew_missing_key_is_err() {
        let (_, ns) = namespace("locks");
        assert!(ns.renew("job").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_renew_released_key_is_rejected() {
        let (transport, ns) = namespace("locks");
        // Release behavior keeps the key after the session goes away.
        let session = transport
            .session_create(&SessionEntry {
                name: "job".into(),
                behavior: SessionBehavior::Release,
                ttl: "15s".into(),
                lock_delay: Duration::ZERO,
            })
            .await
            .unwrap();
        transport
            .kv_acquire(&KvPair::new("locks/job", "a").with_session(&session))
            .await
            .unwrap();
        transport.session_destroy(&session).await.unwrap();

        let outcome = ns.renew("job").await.unwrap();
        assert!(!outcome.is_renewed());
        match outcome {
            RenewOutcome::Rejected { session: None, error } => assert!(error.is_not_found()),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_lock_release_frees_key() {
        let (transport, ns) = namespace("locks");
        let lock = ns.acquire_lock("job", "a", &fast_options()).await.unwrap().unwrap();
        lock.renew().await.unwrap();
        assert!(lock.release().await.unwrap());

        assert!(transport.session_ids().is_empty());
        assert!(ns.acquire("job", "b", &fast_options()).await.unwrap());
    }

    #[tokio::test]
    async fn test_disconnected_lock() {
        let ns = KvNamespace::new(None, "locks");
        assert!(ns.acquire("job", "a", &fast_options()).await.unwrap_err().is_not_connected());
        assert!(ns.renew("job").await.unwrap_err().is_not_connected());
    }
}
