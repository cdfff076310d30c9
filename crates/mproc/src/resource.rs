//! Per-thread resource cache for UDL state (models, buffers, handles).
//!
//! Each dispatcher thread lazily builds its own instance on first use;
//! construction is serialized so loaders that are not thread-safe can run
//! safely.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::ThreadId;

use dashmap::DashMap;

pub struct ResourceCache<T> {
    init: Mutex<()>,
    slots: DashMap<ThreadId, Arc<T>>,
}

impl<T> Default for ResourceCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ResourceCache<T> {
    pub fn new() -> Self {
        Self {
            init: Mutex::new(()),
            slots: DashMap::new(),
        }
    }

    /// This thread's instance, building it with `init` the first time.
    pub fn get_or_try_init<E>(&self, init: impl FnOnce() -> Result<T, E>) -> Result<Arc<T>, E> {
        let id = std::thread::current().id();
        if let Some(existing) = self.slots.get(&id) {
            return Ok(Arc::clone(&existing));
        }

        let _guard = self.init.lock().unwrap_or_else(PoisonError::into_inner);
        let value = Arc::new(init()?);
        self.slots.insert(id, Arc::clone(&value));
        tracing::debug!(thread = ?id, "Initialized per-thread UDL resource");
        Ok(value)
    }

    pub fn get(&self) -> Option<Arc<T>> {
        self.slots
            .get(&std::thread::current().id())
            .map(|entry| Arc::clone(&entry))
    }

    /// Number of threads holding an instance.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn builds_once_per_thread() {
        let cache = Arc::new(ResourceCache::<usize>::new());
        let builds = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let builds = Arc::clone(&builds);
                thread::spawn(move || {
                    for _ in 0..10 {
                        cache
                            .get_or_try_init(|| {
                                Ok::<_, std::convert::Infallible>(
                                    builds.fetch_add(1, Ordering::SeqCst),
                                )
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(builds.load(Ordering::SeqCst), 4);
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn failed_init_is_retried() {
        let cache = ResourceCache::<String>::new();
        assert!(cache.get_or_try_init(|| Err("model missing")).is_err());
        assert!(cache.get().is_none());

        let value = cache
            .get_or_try_init(|| Ok::<_, &str>("loaded".to_string()))
            .unwrap();
        assert_eq!(*value, "loaded");
        assert_eq!(*cache.get().unwrap(), "loaded");
    }
}
