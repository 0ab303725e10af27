//! Per-connection-name data-source cache
//!
//! One live data source per logical name. Entries are created lazily from
//! the current options snapshot and evicted wholesale when the options
//! change; callers holding an `Arc` to an evicted source keep it alive
//! until their execution finishes.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::DbOptions;
use crate::driver::{DataSource, DataSourceFactory};
use crate::error::{Error, Result};
use crate::monitor::OptionsMonitor;

/// Cache counters
#[derive(Debug, Clone, Default)]
pub struct SourceCacheStats {
    /// Lookups served from the cache
    pub hits: u64,
    /// Lookups that created a new data source
    pub misses: u64,
    /// Entries evicted by reconfiguration or disposal
    pub evicted: u64,
}

/// Thread-safe cache of driver data sources keyed by logical name.
pub struct DataSourceCache {
    options: Arc<OptionsMonitor<DbOptions>>,
    factory: Arc<dyn DataSourceFactory>,
    entries: RwLock<HashMap<String, Arc<dyn DataSource>>>,
    disposed: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    evicted: AtomicU64,
}

impl DataSourceCache {
    /// Create an empty cache
    pub fn new(
        options: Arc<OptionsMonitor<DbOptions>>,
        factory: Arc<dyn DataSourceFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            options,
            factory,
            entries: RwLock::new(HashMap::new()),
            disposed: AtomicBool::new(false),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        })
    }

    /// Get the cached data source for `name`, creating it on first use.
    ///
    /// A blank name targets the default connection of the current snapshot.
    /// Fails with a configuration error when the name has no non-blank
    /// connection string, without touching the driver.
    pub fn get(&self, name: &str) -> Result<Arc<dyn DataSource>> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::Disposed);
        }

        let snapshot = self.options.current();
        let effective = if name.trim().is_empty() {
            snapshot.default_connection_name.as_str()
        } else {
            name
        };
        let key = effective.to_ascii_lowercase();

        // Fast path
        {
            let entries = self.entries.read();
            if let Some(source) = entries.get(&key) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(source.clone());
            }
        }

        // Slow path: double-check under the write lock so concurrent
        // first-time calls collapse into a single creation.
        let mut entries = self.entries.write();
        if let Some(source) = entries.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(source.clone());
        }

        let connection_string = snapshot
            .connection_string(effective)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| {
                Error::config(format!(
                    "no connection string configured for \"{effective}\""
                ))
            })?;

        let source = self.factory.create(effective, connection_string)?;
        entries.insert(key, source.clone());
        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(connection = effective, "data source created");
        Ok(source)
    }

    /// Evict and dispose every entry; callers recreate lazily.
    ///
    /// Wired to the options monitor's change event by the builder.
    pub fn invalidate_all(&self) {
        let drained: Vec<_> = {
            let mut entries = self.entries.write();
            entries.drain().collect()
        };
        self.evicted
            .fetch_add(drained.len() as u64, Ordering::Relaxed);
        if !drained.is_empty() {
            debug!(count = drained.len(), "data source cache invalidated");
        }
        Self::dispose_in_background(drained);
    }

    /// Dispose every cached entry and refuse further lookups. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<_> = {
            let mut entries = self.entries.write();
            entries.drain().collect()
        };
        self.evicted
            .fetch_add(drained.len() as u64, Ordering::Relaxed);
        for (name, source) in drained {
            if let Err(err) = source.dispose().await {
                warn!(connection = %name, error = %err, "data source dispose failed");
            }
        }
    }

    /// Whether the cache has been disposed
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Snapshot of the cache counters
    pub fn stats(&self) -> SourceCacheStats {
        SourceCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }

    /// Number of live cached entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    // Disposal must not block the (synchronous) change listener; hand the
    // drained entries to the runtime when one is available.
    fn dispose_in_background(drained: Vec<(String, Arc<dyn DataSource>)>) {
        if drained.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    for (name, source) in drained {
                        if let Err(err) = source.dispose().await {
                            warn!(connection = %name, error = %err, "data source dispose failed");
                        }
                    }
                });
            }
            Err(_) => {
                debug!(
                    count = drained.len(),
                    "no runtime available; dropping evicted data sources without dispose"
                );
            }
        }
    }
}

impl std::fmt::Debug for DataSourceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSourceCache")
            .field("entries", &self.len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use crate::driver::DriverConnection;

    #[derive(Debug)]
    struct StubSource {
        disposed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl DataSource for StubSource {
        async fn open_connection(
            &self,
            _cancel: &CancellationToken,
        ) -> Result<Box<dyn DriverConnection>> {
            Err(Error::unknown("stub source opens no connections"))
        }

        async fn dispose(&self) -> Result<()> {
            self.disposed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct StubFactory {
        created: AtomicU64,
        // (connection string, disposed flag) per created source
        sources: parking_lot::Mutex<Vec<(String, Arc<AtomicBool>)>>,
    }

    impl DataSourceFactory for StubFactory {
        fn create(&self, _name: &str, connection_string: &str) -> Result<Arc<dyn DataSource>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            let disposed = Arc::new(AtomicBool::new(false));
            self.sources
                .lock()
                .push((connection_string.to_string(), disposed.clone()));
            Ok(Arc::new(StubSource { disposed }))
        }
    }

    fn options_with(name: &str, cs: &str) -> DbOptions {
        let mut opts = DbOptions::default();
        opts.set_connection_string(name, cs);
        opts
    }

    fn cache_with(
        opts: DbOptions,
    ) -> (Arc<DataSourceCache>, Arc<OptionsMonitor<DbOptions>>, Arc<StubFactory>) {
        let monitor = OptionsMonitor::new(opts);
        let factory = Arc::new(StubFactory::default());
        let cache = DataSourceCache::new(monitor.clone(), factory.clone());
        (cache, monitor, factory)
    }

    #[test]
    fn test_blank_name_targets_default() {
        let (cache, _, factory) = cache_with(options_with("defaultDatabase", "server=A"));
        cache.get("").unwrap();
        cache.get("  ").unwrap();
        cache.get("defaultDatabase").unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.stats().hits, 2);
    }

    #[test]
    fn test_missing_connection_string_is_configuration_error() {
        let (cache, _, factory) = cache_with(DbOptions::default());
        let err = cache.get("nope").unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
        assert!(err.to_string().contains("nope"));
        assert_eq!(factory.created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_blank_connection_string_is_configuration_error() {
        let (cache, _, _) = cache_with(options_with("reports", "   "));
        assert!(matches!(
            cache.get("reports").unwrap_err(),
            Error::Configuration { .. }
        ));
    }

    #[test]
    fn test_case_insensitive_single_entry() {
        let (cache, _, factory) = cache_with(options_with("Reports", "server=R"));
        let a = cache.get("reports").unwrap();
        let b = cache.get("REPORTS").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_rebuilds_from_new_snapshot() {
        let (cache, monitor, factory) = cache_with(options_with("defaultDatabase", "server=A"));
        let before = cache.get("").unwrap();

        monitor.update(options_with("defaultDatabase", "server=B"));
        cache.invalidate_all();

        let after = cache.get("").unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats().evicted, 1);
    }

    #[tokio::test]
    async fn test_dispose_disposes_entries_and_blocks_lookups() {
        let (cache, _, factory) = cache_with(options_with("defaultDatabase", "server=A"));
        let _source = cache.get("").unwrap();

        cache.dispose().await;
        cache.dispose().await; // idempotent

        assert!(matches!(cache.get("").unwrap_err(), Error::Disposed));
        assert!(cache.is_empty());

        let sources = factory.sources.lock();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].0, "server=A");
        assert!(sources[0].1.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_use_creates_once() {
        let (cache, _, factory) = cache_with(options_with("defaultDatabase", "server=A"));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.get("").map(|_| ()) }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    }
}
