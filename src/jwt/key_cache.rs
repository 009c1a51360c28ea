//! Per-webservice signing-key cache.
//!
//! Entries are keyed by the webservice resource id and hold the configuration
//! they were fetched for. Reads clone an `Arc` snapshot and never block a
//! refresh. A refresh replaces the whole entry after a successful fetch; a
//! failed or cancelled fetch leaves the previous entry in place.
//!
//! Entries do not expire. A refresh happens on a cold cache, on a changed key
//! configuration, or when verification fails against the cached set.
//!
//! Fetches for one webservice are serialized behind a per-webservice lock.
//! Callers that queued behind a fetch re-check the cache once they hold the
//! lock, so concurrent misses cost one network call and one unit of budget.

use std::sync::Arc;
use std::time::Instant;

use authn_types::Webservice;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

use super::refresh_guard::RefreshGuard;
use super::signing_key::{KeySet, SigningKeyConfig, SigningKeySource};
use crate::Result;
use crate::config::KeyCacheConfig;

/// One cached key set.
#[derive(Debug)]
pub struct CachedKeySet {
    /// Configuration the keys were fetched for.
    pub config: SigningKeyConfig,
    /// The keys.
    pub keys: KeySet,
    /// Fetch time.
    pub fetched_at: Instant,
}

/// Resolves key sets through the cache, fetching under the refresh guard.
pub struct SigningKeyResolver {
    source: Arc<dyn SigningKeySource>,
    entries: DashMap<String, Arc<CachedKeySet>>,
    fetch_locks: DashMap<String, Arc<Mutex<()>>>,
    guard: RefreshGuard,
}

impl SigningKeyResolver {
    /// Create a resolver over `source`.
    pub fn new(source: Arc<dyn SigningKeySource>, config: &KeyCacheConfig) -> Self {
        Self {
            source,
            entries: DashMap::new(),
            fetch_locks: DashMap::new(),
            guard: RefreshGuard::new(config),
        }
    }

    /// Cached key set for `webservice`, fetching on a miss.
    ///
    /// # Errors
    ///
    /// Fetch errors from the source, or a refresh-limit error when the guard
    /// refuses the fetch.
    pub async fn resolve(
        &self,
        webservice: &Webservice,
        config: &SigningKeyConfig,
    ) -> Result<Arc<CachedKeySet>> {
        if let Some(entry) = self.cached(webservice, config) {
            debug!(webservice = %webservice, "Signing key cache hit");
            return Ok(entry);
        }
        debug!(webservice = %webservice, "Signing key cache miss");

        let lock = self.fetch_lock(webservice);
        let _held = lock.lock().await;
        if let Some(entry) = self.cached(webservice, config) {
            debug!(webservice = %webservice, "Signing keys fetched by a concurrent request");
            return Ok(entry);
        }
        self.fetch(webservice, config).await
    }

    /// Replace the key set that failed verification.
    ///
    /// When another request already replaced `stale`, the newer entry is
    /// returned without a fetch.
    ///
    /// # Errors
    ///
    /// As [`Self::resolve`].
    pub async fn refresh(
        &self,
        webservice: &Webservice,
        config: &SigningKeyConfig,
        stale: &Arc<CachedKeySet>,
    ) -> Result<Arc<CachedKeySet>> {
        if let Some(current) = self.replaced(webservice, config, stale) {
            return Ok(current);
        }

        let lock = self.fetch_lock(webservice);
        let _held = lock.lock().await;
        if let Some(current) = self.replaced(webservice, config, stale) {
            return Ok(current);
        }
        debug!(webservice = %webservice, "Refreshing signing keys");
        self.fetch(webservice, config).await
    }

    fn replaced(
        &self,
        webservice: &Webservice,
        config: &SigningKeyConfig,
        stale: &Arc<CachedKeySet>,
    ) -> Option<Arc<CachedKeySet>> {
        let current = self.cached(webservice, config)?;
        if Arc::ptr_eq(&current, stale) {
            return None;
        }
        debug!(webservice = %webservice, "Signing keys already refreshed by another request");
        Some(current)
    }

    fn fetch_lock(&self, webservice: &Webservice) -> Arc<Mutex<()>> {
        let key = webservice.resource_id().to_string();
        Arc::clone(self.fetch_locks.entry(key).or_default().value())
    }

    /// Snapshot of the entry for `webservice`, if it was fetched for `config`.
    pub fn cached(
        &self,
        webservice: &Webservice,
        config: &SigningKeyConfig,
    ) -> Option<Arc<CachedKeySet>> {
        let key = webservice.resource_id().to_string();
        let entry = self.entries.get(&key).map(|e| Arc::clone(e.value()))?;
        (entry.config == *config).then_some(entry)
    }

    /// Number of cached webservices.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    async fn fetch(
        &self,
        webservice: &Webservice,
        config: &SigningKeyConfig,
    ) -> Result<Arc<CachedKeySet>> {
        let key = webservice.resource_id().to_string();
        let _permit = self.guard.try_admit(&key)?;

        let keys = self.source.fetch(config).await?;
        let entry = Arc::new(CachedKeySet {
            config: config.clone(),
            keys,
            fetched_at: Instant::now(),
        });
        self.entries.insert(key, Arc::clone(&entry));

        debug!(
            webservice = %webservice,
            keys = entry.keys.jwks.keys.len(),
            "Signing keys cached"
        );
        Ok(entry)
    }
}
