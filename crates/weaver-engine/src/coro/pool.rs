//! Coroutine pool
//!
//! Idle coroutines are looked up in the calling worker's local cache first,
//! then in the shared queue of returned coroutines, then among the ones
//! allocated up front. Only when all of them are empty is a new coroutine
//! allocated.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::queue::{ArrayQueue, SegQueue};
use tracing::{debug, warn};

use super::coroutine::Coroutine;
use crate::config::CoroutinePoolConfig;
use crate::error::{CoroutineError, EngineError};

/// Coroutine pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CoroutinePoolStats {
    /// Coroutines currently bound to tasks
    pub active_coroutines: usize,
    /// Coroutines alive, idle or active
    pub total_coroutines: usize,
}

/// Per-worker cache of idle coroutines
#[derive(Debug, Default)]
pub(crate) struct LocalCoroutineCache {
    coroutines: Vec<Coroutine>,
}

impl LocalCoroutineCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.coroutines.len()
    }
}

/// Pool of reusable coroutines shared by the workers of a processor
pub struct CoroutinePool {
    /// Pool configuration
    config: CoroutinePoolConfig,
    /// Prefix of coroutine thread names
    thread_name: String,
    /// Coroutines allocated at construction, never used yet
    initial_coroutines: SegQueue<Coroutine>,
    /// Coroutines returned after use; bounded by `max_size`
    used_coroutines: ArrayQueue<Coroutine>,
    /// Alive coroutines
    total_coroutines: AtomicUsize,
    /// Coroutines handed out and not yet returned
    active_coroutines: AtomicUsize,
    /// Index assigned to the next allocated coroutine
    next_index: AtomicUsize,
}

impl CoroutinePool {
    /// Create a pool and allocate `initial_size` coroutines
    pub fn new(config: CoroutinePoolConfig) -> Result<Self, CoroutineError> {
        Self::with_thread_name(config, "weaver")
    }

    /// Create a pool whose coroutine threads are named after `thread_name`
    pub fn with_thread_name(config: CoroutinePoolConfig, thread_name: &str) -> Result<Self, CoroutineError> {
        let pool = Self {
            used_coroutines: ArrayQueue::new(config.max_size.max(1)),
            initial_coroutines: SegQueue::new(),
            thread_name: thread_name.to_string(),
            total_coroutines: AtomicUsize::new(0),
            active_coroutines: AtomicUsize::new(0),
            next_index: AtomicUsize::new(0),
            config,
        };
        for _ in 0..pool.config.initial_size {
            let coroutine = pool.allocate()?;
            pool.initial_coroutines.push(coroutine);
        }
        debug!(
            initial_size = pool.config.initial_size,
            max_size = pool.config.max_size,
            stack_size = pool.config.stack_size,
            "coroutine pool created"
        );
        Ok(pool)
    }

    /// Validate `config` and create a pool
    pub fn from_config(config: CoroutinePoolConfig, thread_name: &str) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self::with_thread_name(config, thread_name)?)
    }

    /// Pool configuration
    pub fn config(&self) -> &CoroutinePoolConfig {
        &self.config
    }

    fn allocate(&self) -> Result<Coroutine, CoroutineError> {
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        let coroutine = Coroutine::spawn(index, self.config.stack_size, &self.thread_name)?;
        self.total_coroutines.fetch_add(1, Ordering::Relaxed);
        Ok(coroutine)
    }

    /// Take an idle coroutine or allocate a new one
    pub(crate) fn get_coroutine(
        &self,
        cache: Option<&mut LocalCoroutineCache>,
    ) -> Result<Coroutine, CoroutineError> {
        let cached = cache.and_then(|cache| cache.coroutines.pop());
        let coroutine = match cached
            .or_else(|| self.used_coroutines.pop())
            .or_else(|| self.initial_coroutines.pop())
        {
            Some(coroutine) => coroutine,
            None => self.allocate().map_err(|err| {
                warn!(error = %err, "failed to allocate a coroutine");
                err
            })?,
        };
        self.active_coroutines.fetch_add(1, Ordering::Relaxed);
        Ok(coroutine)
    }

    /// Return a coroutine after its task finished
    pub(crate) fn put_coroutine(&self, cache: Option<&mut LocalCoroutineCache>, coroutine: Coroutine) {
        self.active_coroutines.fetch_sub(1, Ordering::Relaxed);
        match cache {
            Some(cache) if self.config.local_cache_size > 0 => {
                if cache.coroutines.len() >= self.config.local_cache_size {
                    let keep = self.config.local_cache_size / 2;
                    let overflow: Vec<_> = cache.coroutines.drain(keep..).collect();
                    for coroutine in overflow {
                        self.put_shared(coroutine);
                    }
                }
                cache.coroutines.push(coroutine);
            }
            _ => self.put_shared(coroutine),
        }
    }

    /// Move every cached coroutine back to the shared queues
    pub(crate) fn flush_local(&self, cache: &mut LocalCoroutineCache) {
        for coroutine in cache.coroutines.drain(..) {
            self.put_shared(coroutine);
        }
    }

    fn put_shared(&self, coroutine: Coroutine) {
        if let Err(coroutine) = self.used_coroutines.push(coroutine) {
            // more idle coroutines than `max_size`
            self.total_coroutines.fetch_sub(1, Ordering::Relaxed);
            drop(coroutine);
        }
    }

    /// Destroy every idle coroutine.
    ///
    /// Called by the owning processor once its consumers are joined, so that
    /// the pool is never dropped on one of its own coroutine threads.
    pub(crate) fn clear(&self) {
        let mut cleared = 0usize;
        while let Some(coroutine) = self
            .used_coroutines
            .pop()
            .or_else(|| self.initial_coroutines.pop())
        {
            drop(coroutine);
            cleared += 1;
        }
        self.total_coroutines.fetch_sub(cleared, Ordering::Relaxed);
        debug!(cleared, "coroutine pool cleared");
    }

    /// Current statistics
    pub fn stats(&self) -> CoroutinePoolStats {
        CoroutinePoolStats {
            active_coroutines: self.active_coroutines.load(Ordering::Relaxed),
            total_coroutines: self.total_coroutines.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for CoroutinePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoroutinePool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config(initial_size: usize, max_size: usize, local_cache_size: usize) -> CoroutinePoolConfig {
        CoroutinePoolConfig {
            initial_size,
            max_size,
            stack_size: 128 * 1024,
            local_cache_size,
        }
    }

    #[test]
    fn test_initial_allocation() {
        let pool = CoroutinePool::new(small_config(3, 8, 0)).unwrap();
        assert_eq!(pool.stats().total_coroutines, 3);
        assert_eq!(pool.stats().active_coroutines, 0);
    }

    #[test]
    fn test_reuse_keeps_total() {
        let pool = CoroutinePool::new(small_config(0, 1, 0)).unwrap();
        for _ in 0..5 {
            let coroutine = pool.get_coroutine(None).unwrap();
            assert_eq!(pool.stats().active_coroutines, 1);
            pool.put_coroutine(None, coroutine);
        }
        assert_eq!(pool.stats().total_coroutines, 1);
        assert_eq!(pool.stats().active_coroutines, 0);
    }

    #[test]
    fn test_excess_idle_coroutines_dropped() {
        let pool = CoroutinePool::new(small_config(0, 1, 0)).unwrap();
        let first = pool.get_coroutine(None).unwrap();
        let second = pool.get_coroutine(None).unwrap();
        assert_eq!(pool.stats().total_coroutines, 2);
        pool.put_coroutine(None, first);
        pool.put_coroutine(None, second);
        assert_eq!(pool.stats().total_coroutines, 1);
    }

    #[test]
    fn test_local_cache_first() {
        let pool = CoroutinePool::new(small_config(0, 4, 2)).unwrap();
        let mut cache = LocalCoroutineCache::new();
        let coroutine = pool.get_coroutine(Some(&mut cache)).unwrap();
        let index = coroutine.index();
        pool.put_coroutine(Some(&mut cache), coroutine);
        assert_eq!(cache.len(), 1);
        let again = pool.get_coroutine(Some(&mut cache)).unwrap();
        assert_eq!(again.index(), index);
        pool.put_coroutine(Some(&mut cache), again);
        pool.flush_local(&mut cache);
        assert_eq!(cache.len(), 0);
        assert_eq!(pool.stats().total_coroutines, 1);
    }

    #[test]
    fn test_clear_drops_idle() {
        let pool = CoroutinePool::new(small_config(2, 4, 0)).unwrap();
        let coroutine = pool.get_coroutine(None).unwrap();
        pool.put_coroutine(None, coroutine);
        pool.clear();
        assert_eq!(pool.stats().total_coroutines, 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = CoroutinePool::from_config(small_config(5, 2, 0), "bad").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }
}
