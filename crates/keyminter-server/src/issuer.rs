use std::sync::Arc;

use keyminter_contracts::KeyRecord;
use keyminter_kernel::{key_fingerprint, KeyGenError, KeySource};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::store::{KeyStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssueOutcome {
    AlreadyActive,
    Issued(String),
}

#[derive(Debug, Error)]
pub enum IssueError {
    #[error("active key lookup failed: {0}")]
    LookupFailed(StoreError),
    #[error("key generation failed: {0}")]
    KeyGeneration(#[from] KeyGenError),
    #[error("persisting new key failed: {0}")]
    PersistFailed(StoreError),
}

impl IssueError {
    pub fn kind(&self) -> &'static str {
        match self {
            IssueError::LookupFailed(_) => "store_query_failed",
            IssueError::KeyGeneration(_) => "key_generation_failed",
            IssueError::PersistFailed(_) => "store_write_failed",
        }
    }
}

/// What to do when the active-key lookup itself fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupFailMode {
    /// Treat the failure as "no active key" and issue anyway.
    Allow,
    /// Refuse to issue until the store answers.
    Deny,
}

impl LookupFailMode {
    pub fn parse(value: &str) -> Result<Self, String> {
        match value {
            "allow" => Ok(LookupFailMode::Allow),
            "deny" => Ok(LookupFailMode::Deny),
            other => Err(format!("unsupported lookup_fail_mode: {other}")),
        }
    }
}

/// Queries the store for an unused key of `owner_id`. Failures are logged
/// here and handed back to the caller.
pub async fn lookup_active(store: &dyn KeyStore, owner_id: &str) -> Result<bool, StoreError> {
    store.find_active(owner_id).await.map_err(|err| {
        warn!(owner_id, error = %err, "active key lookup failed");
        err
    })
}

/// Lenient lookup: an unreachable or failing store reads as "no active key".
pub async fn has_active_key(store: &dyn KeyStore, owner_id: &str) -> bool {
    lookup_active(store, owner_id).await.unwrap_or(false)
}

pub struct KeyIssuer {
    store: Arc<dyn KeyStore>,
    keys: Arc<dyn KeySource>,
    lookup_fail_mode: LookupFailMode,
}

impl KeyIssuer {
    pub fn new(
        store: Arc<dyn KeyStore>,
        keys: Arc<dyn KeySource>,
        lookup_fail_mode: LookupFailMode,
    ) -> Self {
        Self {
            store,
            keys,
            lookup_fail_mode,
        }
    }

    /// Check-then-insert. The two store calls are not atomic; a backend
    /// that enforces one unused key per owner turns the losing insert of a
    /// concurrent pair into [`IssueOutcome::AlreadyActive`].
    pub async fn issue(&self, owner_id: &str) -> Result<IssueOutcome, IssueError> {
        let active = match self.lookup_fail_mode {
            LookupFailMode::Allow => has_active_key(self.store.as_ref(), owner_id).await,
            LookupFailMode::Deny => lookup_active(self.store.as_ref(), owner_id)
                .await
                .map_err(IssueError::LookupFailed)?,
        };
        if active {
            info!(owner_id, "owner already holds an active key");
            return Ok(IssueOutcome::AlreadyActive);
        }

        let token = self.keys.generate().map_err(|err| {
            error!(owner_id, error = %err, "key generation failed");
            IssueError::from(err)
        })?;
        let fingerprint = key_fingerprint(&token);

        match self.store.insert(&KeyRecord::unused(&token, owner_id)).await {
            Ok(()) => {
                info!(owner_id, key_fp = %fingerprint, "issued new key");
                Ok(IssueOutcome::Issued(token))
            }
            Err(StoreError::Conflict) => {
                warn!(
                    owner_id,
                    key_fp = %fingerprint,
                    "store rejected key as a second active key; concurrent issuance lost"
                );
                Ok(IssueOutcome::AlreadyActive)
            }
            Err(err) => {
                error!(owner_id, key_fp = %fingerprint, error = %err, "persisting new key failed");
                Err(IssueError::PersistFailed(err))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Store double that answers lookups from a fixed script and records
    /// inserts.
    pub(crate) struct ScriptedStore {
        pub lookup: Result<bool, u16>,
        pub insert_result: Option<StoreErrorKind>,
        pub lookups: AtomicUsize,
        pub inserts: Mutex<Vec<KeyRecord>>,
    }

    #[derive(Clone, Copy)]
    pub(crate) enum StoreErrorKind {
        Conflict,
        Status(u16),
    }

    impl ScriptedStore {
        pub(crate) fn new(lookup: Result<bool, u16>) -> Self {
            Self {
                lookup,
                insert_result: None,
                lookups: AtomicUsize::new(0),
                inserts: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn failing_insert(mut self, kind: StoreErrorKind) -> Self {
            self.insert_result = Some(kind);
            self
        }

        pub(crate) fn inserted(&self) -> Vec<KeyRecord> {
            self.inserts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl KeyStore for ScriptedStore {
        async fn find_active(&self, _owner_id: &str) -> Result<bool, StoreError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.lookup.map_err(StoreError::Status)
        }

        async fn insert(&self, record: &KeyRecord) -> Result<(), StoreError> {
            self.inserts.lock().unwrap().push(record.clone());
            match self.insert_result {
                None => Ok(()),
                Some(StoreErrorKind::Conflict) => Err(StoreError::Conflict),
                Some(StoreErrorKind::Status(code)) => Err(StoreError::Status(code)),
            }
        }
    }

    pub(crate) struct FixedKeys {
        pub key: Option<&'static str>,
        pub calls: AtomicUsize,
    }

    impl FixedKeys {
        pub(crate) fn new(key: &'static str) -> Self {
            Self {
                key: Some(key),
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn broken() -> Self {
            Self {
                key: None,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl KeySource for FixedKeys {
        fn generate(&self) -> Result<String, KeyGenError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.key
                .map(|k| k.to_string())
                .ok_or_else(|| KeyGenError::Entropy("entropy pool unavailable".to_string()))
        }
    }

    fn issuer(
        store: Arc<ScriptedStore>,
        keys: Arc<FixedKeys>,
        mode: LookupFailMode,
    ) -> KeyIssuer {
        KeyIssuer::new(store, keys, mode)
    }

    #[tokio::test]
    async fn issues_when_no_active_key() {
        let store = Arc::new(ScriptedStore::new(Ok(false)));
        let keys = Arc::new(FixedKeys::new("abc123"));
        let outcome = issuer(store.clone(), keys.clone(), LookupFailMode::Allow)
            .issue("42")
            .await
            .unwrap();

        assert_eq!(outcome, IssueOutcome::Issued("abc123".to_string()));
        assert_eq!(keys.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.inserted(), vec![KeyRecord::unused("abc123", "42")]);
    }

    #[tokio::test]
    async fn active_key_short_circuits() {
        let store = Arc::new(ScriptedStore::new(Ok(true)));
        let keys = Arc::new(FixedKeys::new("unused"));
        let outcome = issuer(store.clone(), keys.clone(), LookupFailMode::Allow)
            .issue("42")
            .await
            .unwrap();

        assert_eq!(outcome, IssueOutcome::AlreadyActive);
        assert_eq!(store.lookups.load(Ordering::SeqCst), 1);
        assert_eq!(keys.calls.load(Ordering::SeqCst), 0);
        assert!(store.inserted().is_empty());
    }

    #[tokio::test]
    async fn lenient_lookup_issues_when_store_fails() {
        let store = Arc::new(ScriptedStore::new(Err(503)));
        assert!(!has_active_key(store.as_ref(), "42").await);

        let keys = Arc::new(FixedKeys::new("k"));
        let outcome = issuer(store.clone(), keys, LookupFailMode::Allow)
            .issue("42")
            .await
            .unwrap();
        assert_eq!(outcome, IssueOutcome::Issued("k".to_string()));
    }

    #[tokio::test]
    async fn strict_lookup_refuses_when_store_fails() {
        let store = Arc::new(ScriptedStore::new(Err(500)));
        let keys = Arc::new(FixedKeys::new("k"));
        let err = issuer(store.clone(), keys.clone(), LookupFailMode::Deny)
            .issue("42")
            .await
            .expect_err("lookup failure is surfaced");

        assert!(matches!(err, IssueError::LookupFailed(StoreError::Status(500))));
        assert_eq!(err.kind(), "store_query_failed");
        assert_eq!(keys.calls.load(Ordering::SeqCst), 0);
        assert!(store.inserted().is_empty());
    }

    #[tokio::test]
    async fn persist_failure_is_surfaced() {
        let store =
            Arc::new(ScriptedStore::new(Ok(false)).failing_insert(StoreErrorKind::Status(500)));
        let keys = Arc::new(FixedKeys::new("k"));
        let err = issuer(store.clone(), keys, LookupFailMode::Allow)
            .issue("42")
            .await
            .expect_err("write failure");
        assert!(matches!(err, IssueError::PersistFailed(StoreError::Status(500))));
        assert_eq!(store.inserted().len(), 1);
    }

    #[tokio::test]
    async fn insert_conflict_reads_as_already_active() {
        let store = Arc::new(ScriptedStore::new(Ok(false)).failing_insert(StoreErrorKind::Conflict));
        let keys = Arc::new(FixedKeys::new("k"));
        let outcome = issuer(store, keys, LookupFailMode::Allow)
            .issue("42")
            .await
            .unwrap();
        assert_eq!(outcome, IssueOutcome::AlreadyActive);
    }

    #[tokio::test]
    async fn entropy_failure_skips_persist() {
        let store = Arc::new(ScriptedStore::new(Ok(false)));
        let keys = Arc::new(FixedKeys::broken());
        let err = issuer(store.clone(), keys, LookupFailMode::Allow)
            .issue("42")
            .await
            .expect_err("no entropy");
        assert!(matches!(err, IssueError::KeyGeneration(_)));
        assert!(store.inserted().is_empty());
    }

    #[test]
    fn parses_lookup_fail_mode() {
        assert_eq!(LookupFailMode::parse("allow").unwrap(), LookupFailMode::Allow);
        assert_eq!(LookupFailMode::parse("deny").unwrap(), LookupFailMode::Deny);
        assert!(LookupFailMode::parse("maybe").is_err());
    }
}
