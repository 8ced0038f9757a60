//! Store-resident advisory locks.
//!
//! A lock is a record written with create-if-absent at a token derived from
//! the key it protects. Acquisition is all-or-nothing per attempt: if any
//! token is held elsewhere the tokens won in this attempt are rolled back
//! and the attempt is retried after a fixed backoff. Once attempts (or the
//! optional deadline) run out, the manager either force-writes every token
//! or reports contention, depending on `LockConfig::force_on_exhaustion`.
//!
//! ```text
//! (free) ── acquire ──→ Acquired | Forced ── release ──→ (free)
//! ```
//!
//! Locks are not reentrant: acquiring a token this manager already holds
//! contends with itself.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tessera_core::{Key, LockConfig, TesseraError, TesseraResult};
use tracing::{debug, warn};

use crate::kv::KvStore;

// ============================================================================
// TOKENS AND OUTCOMES
// ============================================================================

/// Encoded store address of a lock record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockToken(String);

impl LockToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a set of locks was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// Every token was created cleanly.
    Acquired,
    /// Retries ran out and the tokens were overwritten unconditionally.
    Forced,
}

impl LockOutcome {
    pub fn is_forced(&self) -> bool {
        matches!(self, LockOutcome::Forced)
    }
}

// ============================================================================
// RELEASE GUARD
// ============================================================================

/// Deletes held tokens if dropped while still armed, so a cancelled future
/// does not leave records behind. Deletion is spawned on the current tokio
/// runtime; outside a runtime the tokens are left to expire by force.
struct ReleaseGuard<S: KvStore + 'static> {
    store: Arc<S>,
    tokens: Vec<String>,
}

impl<S: KvStore + 'static> ReleaseGuard<S> {
    fn new(store: Arc<S>) -> Self {
        Self {
            store,
            tokens: Vec::new(),
        }
    }

    fn hold(&mut self, token: &LockToken) {
        self.tokens.push(token.0.clone());
    }

    /// Take the held tokens, leaving the guard disarmed.
    fn take(&mut self) -> Vec<String> {
        std::mem::take(&mut self.tokens)
    }
}

impl<S: KvStore + 'static> Drop for ReleaseGuard<S> {
    fn drop(&mut self) {
        if self.tokens.is_empty() {
            return;
        }
        let tokens = self.take();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = Arc::clone(&self.store);
                handle.spawn(async move {
                    if let Err(e) = store.delete_many(&tokens).await {
                        warn!(
                            error = %e,
                            count = tokens.len(),
                            "failed to release abandoned locks"
                        );
                    }
                });
            }
            Err(_) => {
                warn!(
                    count = tokens.len(),
                    "abandoned locks outside a runtime were not released"
                );
            }
        }
    }
}

// ============================================================================
// LOCK MANAGER
// ============================================================================

/// Acquires and releases lock tokens on one store.
pub struct LockManager<S: KvStore + 'static> {
    store: Arc<S>,
    config: LockConfig,
    holder: String,
}

impl<S: KvStore + 'static> Clone for LockManager<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: self.config.clone(),
            holder: self.holder.clone(),
        }
    }
}

impl<S: KvStore + 'static> LockManager<S> {
    pub fn new(store: Arc<S>, config: LockConfig) -> TesseraResult<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            holder: uuid::Uuid::now_v7().to_string(),
        })
    }

    /// Value written into every lock record this manager creates.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Token protecting `key`.
    pub fn token(&self, key: &Key) -> LockToken {
        LockToken(key.namespaced(&self.config.prefix).encode())
    }

    pub fn tokens<'a>(&self, keys: impl IntoIterator<Item = &'a Key>) -> BTreeSet<LockToken> {
        keys.into_iter().map(|k| self.token(k)).collect()
    }

    /// Acquire every token, retrying with backoff and falling back per
    /// configuration.
    pub async fn acquire(&self, tokens: &BTreeSet<LockToken>) -> TesseraResult<LockOutcome> {
        if tokens.is_empty() {
            return Ok(LockOutcome::Acquired);
        }
        let started = Instant::now();
        let holder = self.holder.as_bytes().to_vec();
        let mut attempts = 0;

        while attempts < self.config.max_attempts {
            attempts += 1;
            let mut guard = ReleaseGuard::new(Arc::clone(&self.store));
            let mut contended = None;

            for token in tokens {
                match self.store.create_if_absent(&token.0, holder.clone()).await {
                    Ok(true) => guard.hold(token),
                    Ok(false) => {
                        contended = Some(token);
                        break;
                    }
                    Err(e) => {
                        let partial = guard.take();
                        if let Err(rollback) = self.store.delete_many(&partial).await {
                            warn!(
                                error = %rollback,
                                count = partial.len(),
                                "failed to roll back partial lock attempt"
                            );
                        }
                        return Err(e);
                    }
                }
            }

            let Some(token) = contended else {
                guard.take();
                return Ok(LockOutcome::Acquired);
            };

            self.store.delete_many(&guard.take()).await?;
            debug!(attempt = attempts, token = %token, "lock contended");

            if let Some(deadline) = self.config.deadline {
                if started.elapsed() >= deadline {
                    debug!(attempt = attempts, "lock deadline passed");
                    break;
                }
            }
            if attempts < self.config.max_attempts {
                tokio::time::sleep(self.config.backoff).await;
            }
        }

        if !self.config.force_on_exhaustion {
            return Err(TesseraError::LockContended {
                attempts,
                tokens: tokens.iter().map(|t| t.0.clone()).collect(),
            });
        }

        warn!(
            attempts,
            count = tokens.len(),
            holder = %self.holder,
            "forcing lock acquisition"
        );
        self.store
            .set_many(tokens.iter().map(|t| (t.0.clone(), holder.clone())).collect())
            .await?;
        Ok(LockOutcome::Forced)
    }

    /// Delete every token. Tokens that are already gone are ignored.
    pub async fn release(&self, tokens: &BTreeSet<LockToken>) -> TesseraResult<()> {
        if tokens.is_empty() {
            return Ok(());
        }
        let encoded: Vec<String> = tokens.iter().map(|t| t.0.clone()).collect();
        self.store.delete_many(&encoded).await?;
        Ok(())
    }

    /// Run `body` while holding `tokens`, releasing them on every exit path.
    ///
    /// An error from `body` wins over an error from release.
    pub async fn with_locks<T, F, Fut>(
        &self,
        tokens: &BTreeSet<LockToken>,
        body: F,
    ) -> TesseraResult<T>
    where
        F: FnOnce(LockOutcome) -> Fut,
        Fut: Future<Output = TesseraResult<T>>,
    {
        let outcome = self.acquire(tokens).await?;

        let mut guard = ReleaseGuard::new(Arc::clone(&self.store));
        for token in tokens {
            guard.hold(token);
        }

        let result = body(outcome).await;
        guard.take();
        let released = self.release(tokens).await;

        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(e), _) => Err(e),
            (Ok(_), Err(e)) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryKvStore;
    use std::time::Duration;
    use tessera_core::StoreError;

    fn manager(store: &InMemoryKvStore, config: LockConfig) -> LockManager<InMemoryKvStore> {
        LockManager::new(Arc::new(store.clone()), config).unwrap()
    }

    fn fast() -> LockConfig {
        LockConfig::new()
            .with_max_attempts(3)
            .with_backoff(Duration::from_millis(1))
    }

    fn keys(names: &[&str]) -> Vec<Key> {
        names.iter().map(|n| Key::from_parts(["doc", n])).collect()
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let store = InMemoryKvStore::new();
        let locks = manager(&store, fast());
        let tokens = locks.tokens(&keys(&["1", "2"]));

        assert_eq!(locks.acquire(&tokens).await.unwrap(), LockOutcome::Acquired);
        assert_eq!(store.len(), 2);
        for token in &tokens {
            assert!(token.as_str().starts_with("lock:"));
            let holder = store.get(token.as_str()).await.unwrap().unwrap();
            assert_eq!(holder, locks.holder().as_bytes());
        }

        locks.release(&tokens).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_contention_rolls_back_partial_attempt() {
        let store = InMemoryKvStore::new();
        let first = manager(&store, fast());
        let second = manager(&store, fast().with_force_on_exhaustion(false));

        let held = first.tokens(&keys(&["2"]));
        first.acquire(&held).await.unwrap();

        let wanted = second.tokens(&keys(&["1", "2"]));
        let err = second.acquire(&wanted).await.unwrap_err();
        assert!(matches!(err, TesseraError::LockContended { attempts: 3, .. }));

        // Only the first manager's record remains; "doc:1" was rolled back.
        assert_eq!(store.keys(), vec![held.iter().next().unwrap().to_string()]);
    }

    #[tokio::test]
    async fn test_exhaustion_forces() {
        let store = InMemoryKvStore::new();
        let first = manager(&store, fast());
        let second = manager(&store, fast());
        let tokens = first.tokens(&keys(&["1"]));

        first.acquire(&tokens).await.unwrap();
        assert_eq!(second.acquire(&tokens).await.unwrap(), LockOutcome::Forced);

        let token = tokens.iter().next().unwrap();
        let holder = store.get(token.as_str()).await.unwrap().unwrap();
        assert_eq!(holder, second.holder().as_bytes());
    }

    #[tokio::test]
    async fn test_locks_are_not_reentrant() {
        let store = InMemoryKvStore::new();
        let locks = manager(&store, fast().with_force_on_exhaustion(false));
        let tokens = locks.tokens(&keys(&["1"]));
        locks.acquire(&tokens).await.unwrap();
        assert!(locks.acquire(&tokens).await.is_err());
    }

    #[tokio::test]
    async fn test_deadline_skips_remaining_attempts() {
        let store = InMemoryKvStore::new();
        let first = manager(&store, fast());
        let config = LockConfig::new()
            .with_max_attempts(1000)
            .with_backoff(Duration::from_millis(5))
            .with_deadline(Duration::from_millis(1));
        let second = manager(&store, config);
        let tokens = first.tokens(&keys(&["1"]));

        first.acquire(&tokens).await.unwrap();
        let started = Instant::now();
        assert_eq!(second.acquire(&tokens).await.unwrap(), LockOutcome::Forced);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_with_locks_releases_on_success_and_failure() {
        let store = InMemoryKvStore::new();
        let locks = manager(&store, fast());
        let tokens = locks.tokens(&keys(&["1", "2"]));

        let value = locks
            .with_locks(&tokens, |outcome| async move {
                assert_eq!(outcome, LockOutcome::Acquired);
                Ok(7)
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert!(store.is_empty());

        let err = locks
            .with_locks(&tokens, |_| async {
                Err::<(), _>(TesseraError::corruption("boom"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TesseraError::Corruption { .. }));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_section_releases() {
        let store = InMemoryKvStore::new();
        let locks = manager(&store, fast());
        let tokens = locks.tokens(&keys(&["1"]));

        let section = locks.with_locks(&tokens, |_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        let timed_out = tokio::time::timeout(Duration::from_millis(20), section).await;
        assert!(timed_out.is_err());

        // The guard spawned the release; give it a moment to run.
        for _ in 0..50 {
            if store.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_empty_token_set_is_trivial() {
        let store = InMemoryKvStore::new();
        let locks = manager(&store, fast());
        let none = BTreeSet::new();
        assert_eq!(locks.acquire(&none).await.unwrap(), LockOutcome::Acquired);
        locks.release(&none).await.unwrap();
    }

    /// Fails creates on keys containing `fail_on`, and every delete.
    struct BrokenStore {
        inner: InMemoryKvStore,
        fail_on: &'static str,
    }

    fn broken(operation: &str) -> TesseraError {
        StoreError::Backend {
            operation: operation.to_string(),
            reason: "unavailable".to_string(),
        }
        .into()
    }

    #[async_trait::async_trait]
    impl KvStore for BrokenStore {
        fn name(&self) -> &str {
            "broken"
        }
        fn capabilities(&self) -> crate::kv::Capabilities {
            self.inner.capabilities()
        }
        async fn get(&self, key: &str) -> TesseraResult<Option<Vec<u8>>> {
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: Vec<u8>) -> TesseraResult<()> {
            self.inner.set(key, value).await
        }
        async fn delete(&self, _key: &str) -> TesseraResult<bool> {
            Err(broken("delete"))
        }
        async fn create_if_absent(&self, key: &str, value: Vec<u8>) -> TesseraResult<bool> {
            if key.contains(self.fail_on) {
                return Err(broken("create_if_absent"));
            }
            self.inner.create_if_absent(key, value).await
        }
    }

    #[tokio::test]
    async fn test_create_error_survives_failed_rollback() {
        let store = BrokenStore {
            inner: InMemoryKvStore::new(),
            fail_on: "doc:2",
        };
        let locks = LockManager::new(Arc::new(store), fast()).unwrap();
        let tokens = locks.tokens(&keys(&["1", "2"]));

        let err = locks.acquire(&tokens).await.unwrap_err();
        match err {
            TesseraError::Store(StoreError::Backend { operation, .. }) => {
                assert_eq!(operation, "create_if_absent")
            }
            other => panic!("Expected the create error, got: {:?}", other),
        }
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use crate::memory::InMemoryKvStore;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_acquire_release_leaves_nothing_held(
            names in prop::collection::btree_set("[a-z]{1,6}", 0..8)
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            rt.block_on(async {
                let store = InMemoryKvStore::new();
                let locks =
                    LockManager::new(Arc::new(store.clone()), LockConfig::default()).unwrap();
                let keys: Vec<Key> = names
                    .iter()
                    .map(|n| Key::from_parts(["doc", n.as_str()]))
                    .collect();
                let tokens = locks.tokens(&keys);

                let outcome = locks.acquire(&tokens).await.unwrap();
                prop_assert_eq!(outcome, LockOutcome::Acquired);
                prop_assert_eq!(store.len(), tokens.len());
                locks.release(&tokens).await.unwrap();
                prop_assert!(store.is_empty());
                Ok(())
            })?;
        }
    }
}
