use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dag_contracts::ServiceAssociations;
use dag_store::{ServiceStore, StoreError};
use lru::LruCache;

/// Resolved services keyed by request path. Entries expire after `ttl` and
/// the least recently used entry is evicted when full. Failed loads are
/// never cached.
#[derive(Clone)]
pub struct ServiceCache {
    store: Arc<dyn ServiceStore>,
    entries: Arc<Mutex<LruCache<String, CachedService>>>,
    loading: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
    ttl: Duration,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

#[derive(Clone)]
struct CachedService {
    value: Arc<ServiceAssociations>,
    expires_at: Instant,
}

#[derive(Debug)]
pub enum CacheError {
    NotFound,
    Transient(StoreError),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::NotFound => write!(f, "service path does not exist"),
            CacheError::Transient(err) => write!(f, "service load failed: {}", err),
        }
    }
}

impl std::error::Error for CacheError {}

impl From<StoreError> for CacheError {
    fn from(value: StoreError) -> Self {
        if value.is_not_found() {
            CacheError::NotFound
        } else {
            CacheError::Transient(value)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

impl ServiceCache {
    pub fn new(store: Arc<dyn ServiceStore>, max_entries: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            entries: Arc::new(Mutex::new(LruCache::new(cap))),
            loading: Arc::new(Mutex::new(HashMap::new())),
            ttl,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn store(&self) -> &Arc<dyn ServiceStore> {
        &self.store
    }

    /// Returns the cached service at `path`, loading it from the store on a
    /// miss. Concurrent misses on one path share a single load.
    pub async fn get(&self, path: &str) -> Result<Arc<ServiceAssociations>, CacheError> {
        if let Some(value) = self.fresh(path) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            crate::metrics::observe_cache_lookup(true);
            return Ok(value);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        crate::metrics::observe_cache_lookup(false);

        let gate = self.load_gate(path);
        let _loading = gate.lock().await;

        // A load that finished while we waited is as good as our own.
        if let Some(value) = self.fresh(path) {
            return Ok(value);
        }

        let loaded = self.store.get_by_path(path).await;
        self.release_gate(path, &gate);

        let value = Arc::new(loaded?);
        self.insert(path, value.clone());
        Ok(value)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: lock(&self.entries).len(),
        }
    }

    fn fresh(&self, path: &str) -> Option<Arc<ServiceAssociations>> {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        match entries.get(path) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                entries.pop(path);
                None
            }
            None => None,
        }
    }

    fn insert(&self, path: &str, value: Arc<ServiceAssociations>) {
        let expires_at = Instant::now() + self.ttl;
        lock(&self.entries).put(path.to_string(), CachedService { value, expires_at });
    }

    fn load_gate(&self, path: &str) -> Arc<tokio::sync::Mutex<()>> {
        lock(&self.loading)
            .entry(path.to_string())
            .or_default()
            .clone()
    }

    fn release_gate(&self, path: &str, gate: &Arc<tokio::sync::Mutex<()>>) {
        let mut loading = lock(&self.loading);
        if loading.get(path).is_some_and(|current| Arc::ptr_eq(current, gate)) {
            loading.remove(path);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dag_contracts::{CreateModel, Service, ServiceStatus, ServiceType};
    use dag_store::InMemoryServiceStore;

    fn associations(id: &str, path: &str) -> ServiceAssociations {
        ServiceAssociations {
            service: Service {
                service_id: id.to_string(),
                service_name: id.to_string(),
                service_path: path.to_string(),
                http_method: "GET".to_string(),
                service_type: ServiceType::Generate,
                status: ServiceStatus::Online,
                publish_status: "published".to_string(),
                create_model: CreateModel::Wizard,
                timeout_seconds: 5,
                rate_limit_per_second: 0,
                backend_host: String::new(),
                backend_path: String::new(),
                department_id: String::new(),
                app_id: None,
                deleted_at: 0,
            },
            data_source: None,
            script_model: None,
            params: Vec::new(),
            response_filters: Vec::new(),
            sub_services: Vec::new(),
        }
    }

    async fn cache_with(
        ttl: Duration,
        max_entries: usize,
        paths: &[&str],
    ) -> (ServiceCache, InMemoryServiceStore) {
        let store = InMemoryServiceStore::new();
        for (idx, path) in paths.iter().enumerate() {
            store.insert(associations(&format!("s{idx}"), path)).await;
        }
        let cache = ServiceCache::new(Arc::new(store.clone()), max_entries, ttl);
        (cache, store)
    }

    #[tokio::test]
    async fn repeated_lookups_within_ttl_share_one_instance() {
        let (cache, store) = cache_with(Duration::from_secs(60), 8, &["/a"]).await;

        let first = cache.get("/a").await.expect("service should load");
        let second = cache.get("/a").await.expect("service should load");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.load_count(), 1);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn expired_entries_reload_from_the_store() {
        let (cache, store) = cache_with(Duration::from_millis(20), 8, &["/a"]).await;

        let first = cache.get("/a").await.expect("service should load");
        tokio::time::sleep(Duration::from_millis(40)).await;
        let second = cache.get("/a").await.expect("service should load");

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(store.load_count(), 2);
    }

    #[tokio::test]
    async fn least_recently_used_entry_is_evicted() {
        let (cache, store) = cache_with(Duration::from_secs(60), 2, &["/a", "/b", "/c"]).await;

        cache.get("/a").await.expect("load a");
        cache.get("/b").await.expect("load b");
        cache.get("/a").await.expect("hit a");
        cache.get("/c").await.expect("load c evicts b");
        assert_eq!(store.load_count(), 3);

        cache.get("/a").await.expect("a still cached");
        assert_eq!(store.load_count(), 3);
        cache.get("/b").await.expect("b reloads");
        assert_eq!(store.load_count(), 4);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let (cache, store) = cache_with(Duration::from_secs(60), 8, &[]).await;

        assert!(matches!(cache.get("/late").await, Err(CacheError::NotFound)));
        store.insert(associations("s9", "/late")).await;
        let value = cache.get("/late").await.expect("service appears after insert");
        assert_eq!(value.service.service_id, "s9");
        assert_eq!(store.load_count(), 2);
    }

    #[tokio::test]
    async fn concurrent_misses_collapse_to_one_load() {
        let (cache, store) = cache_with(Duration::from_secs(60), 8, &["/a"]).await;

        let (a, b, c) = tokio::join!(cache.get("/a"), cache.get("/a"), cache.get("/a"));
        let a = a.expect("load");
        assert!(Arc::ptr_eq(&a, &b.expect("load")));
        assert!(Arc::ptr_eq(&a, &c.expect("load")));
        assert_eq!(store.load_count(), 1);
    }
}
