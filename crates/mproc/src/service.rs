//! Host service client surface.
//!
//! [`ServiceClient`] is what the host's context server executes proxied
//! calls against. [`InMemoryServiceClient`] is a single-node versioned
//! store used for tests, demos and the standalone worker harness.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::bridge::protocol::{CURRENT_VERSION, Object, Operation, Reply, Version};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("no object pool covers key '{0}'")]
    NoObjectPool(String),

    #[error("version {version} of '{key}' does not exist")]
    NoSuchVersion { key: String, version: Version },

    #[error("service unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ServiceClient: Send + Sync {
    async fn put(&self, object: Object) -> Result<(Version, u64), ServiceError>;

    async fn put_and_forget(&self, object: Object) -> Result<(), ServiceError>;

    /// Deliver to downstream observers without storing.
    async fn trigger_put(&self, object: Object) -> Result<(), ServiceError>;

    async fn get(&self, key: &str, version: Version) -> Result<Option<Object>, ServiceError>;

    async fn get_by_time(&self, key: &str, timestamp_us: u64)
    -> Result<Option<Object>, ServiceError>;

    async fn get_size(&self, key: &str, version: Version) -> Result<u64, ServiceError>;

    async fn remove(&self, key: &str) -> Result<(Version, u64), ServiceError>;

    async fn list_keys(&self, object_pool: &str, version: Version)
    -> Result<Vec<String>, ServiceError>;
}

/// Run one proxied operation. `None` for operations that get no reply.
pub async fn execute(client: &dyn ServiceClient, op: Operation) -> Option<Reply> {
    let expects_reply = op.expects_reply();
    let kind = op.kind();

    let result = match op {
        Operation::Put { object } => client
            .put(object)
            .await
            .map(|(version, timestamp_us)| Reply::Stored {
                version,
                timestamp_us,
            }),
        Operation::PutAndForget { object } => client.put_and_forget(object).await.map(|()| Reply::Triggered),
        Operation::TriggerPut { object } => client.trigger_put(object).await.map(|()| Reply::Triggered),
        Operation::Get { key, version } => client.get(&key, version).await.map(found),
        Operation::GetByTime { key, timestamp_us } => {
            client.get_by_time(&key, timestamp_us).await.map(found)
        }
        Operation::GetSize { key, version } => client.get_size(&key, version).await.map(Reply::Size),
        Operation::Remove { key } => {
            client
                .remove(&key)
                .await
                .map(|(version, timestamp_us)| Reply::Stored {
                    version,
                    timestamp_us,
                })
        }
        Operation::ListKeys {
            object_pool,
            version,
        } => client.list_keys(&object_pool, version).await.map(Reply::Keys),
        Operation::Diagnostic { .. } => return None,
    };

    let reply = result.unwrap_or_else(|e| {
        tracing::debug!(op = kind, error = %e, "Service call failed");
        Reply::Failed {
            reason: e.to_string(),
        }
    });
    if expects_reply {
        Some(reply)
    } else {
        if let Reply::Failed { reason } = &reply {
            tracing::warn!(op = kind, reason = %reason, "Unacknowledged service call failed");
        }
        None
    }
}

fn found(object: Option<Object>) -> Reply {
    object.map_or(Reply::NotFound, Reply::Found)
}

/// One stored version of a key; `object` is `None` for a removal.
struct Entry {
    timestamp_us: u64,
    object: Option<Object>,
}

type History = BTreeMap<Version, Entry>;

/// Versioned in-memory store. Versions are global and strictly increasing.
pub struct InMemoryServiceClient {
    pools: Vec<String>,
    objects: DashMap<String, History>,
    next_version: std::sync::atomic::AtomicI64,
    triggers: broadcast::Sender<Object>,
}

impl InMemoryServiceClient {
    /// Store accepting keys under any of `pools` (key prefixes).
    pub fn new<I, S>(pools: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (triggers, _) = broadcast::channel(1024);
        Arc::new(Self {
            pools: pools.into_iter().map(Into::into).collect(),
            objects: DashMap::new(),
            next_version: std::sync::atomic::AtomicI64::new(0),
            triggers,
        })
    }

    /// Objects passed to `trigger_put`, from now on.
    pub fn subscribe_triggers(&self) -> broadcast::Receiver<Object> {
        self.triggers.subscribe()
    }

    /// Latest live value of `key`, without going through the trait.
    pub fn latest(&self, key: &str) -> Option<Object> {
        self.objects
            .get(key)
            .and_then(|history| history.values().next_back().and_then(|e| e.object.clone()))
    }

    /// Number of keys with a live latest value.
    pub fn live_keys(&self) -> usize {
        self.objects
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .values()
                    .next_back()
                    .is_some_and(|e| e.object.is_some())
            })
            .count()
    }

    fn check_pool(&self, key: &str) -> Result<(), ServiceError> {
        if self.pools.iter().any(|pool| key.starts_with(pool.as_str())) {
            Ok(())
        } else {
            Err(ServiceError::NoObjectPool(key.to_string()))
        }
    }

    fn store(&self, key: &str, object: Option<Object>) -> (Version, u64) {
        let version = self
            .next_version
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            + 1;
        let timestamp_us = chrono::Utc::now().timestamp_micros().max(0) as u64;
        let object = object.map(|mut object| {
            object.version = version;
            object.timestamp_us = timestamp_us;
            object
        });
        self.objects
            .entry(key.to_string())
            .or_default()
            .insert(version, Entry {
                timestamp_us,
                object,
            });
        (version, timestamp_us)
    }

    fn lookup(&self, key: &str, version: Version) -> Result<Option<Object>, ServiceError> {
        let Some(history) = self.objects.get(key) else {
            return Ok(None);
        };
        if version == CURRENT_VERSION {
            return Ok(history.values().next_back().and_then(|e| e.object.clone()));
        }
        match history.get(&version) {
            Some(entry) => Ok(entry.object.clone()),
            None => Err(ServiceError::NoSuchVersion {
                key: key.to_string(),
                version,
            }),
        }
    }
}

#[async_trait]
impl ServiceClient for InMemoryServiceClient {
    async fn put(&self, object: Object) -> Result<(Version, u64), ServiceError> {
        self.check_pool(&object.key)?;
        let key = object.key.clone();
        Ok(self.store(&key, Some(object)))
    }

    async fn put_and_forget(&self, object: Object) -> Result<(), ServiceError> {
        self.put(object).await.map(|_| ())
    }

    async fn trigger_put(&self, object: Object) -> Result<(), ServiceError> {
        self.check_pool(&object.key)?;
        // No subscribers is fine.
        let _ = self.triggers.send(object);
        Ok(())
    }

    async fn get(&self, key: &str, version: Version) -> Result<Option<Object>, ServiceError> {
        self.lookup(key, version)
    }

    async fn get_by_time(
        &self,
        key: &str,
        timestamp_us: u64,
    ) -> Result<Option<Object>, ServiceError> {
        let Some(history) = self.objects.get(key) else {
            return Ok(None);
        };
        // Latest entry stored at or before the timestamp.
        Ok(history
            .values()
            .rev()
            .find(|entry| entry.timestamp_us <= timestamp_us)
            .and_then(|entry| entry.object.clone()))
    }

    async fn get_size(&self, key: &str, version: Version) -> Result<u64, ServiceError> {
        Ok(self
            .lookup(key, version)?
            .map_or(0, |object| object.blob.len() as u64))
    }

    async fn remove(&self, key: &str) -> Result<(Version, u64), ServiceError> {
        self.check_pool(key)?;
        Ok(self.store(key, None))
    }

    async fn list_keys(
        &self,
        object_pool: &str,
        version: Version,
    ) -> Result<Vec<String>, ServiceError> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .filter(|entry| entry.key().starts_with(object_pool))
            .filter(|entry| {
                let history = entry.value();
                let at = if version == CURRENT_VERSION {
                    history.values().next_back()
                } else {
                    history.range(..=version).next_back().map(|(_, entry)| entry)
                };
                at.is_some_and(|entry| entry.object.is_some())
            })
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Arc<InMemoryServiceClient> {
        InMemoryServiceClient::new(["/frames/", "/out/"])
    }

    #[tokio::test]
    async fn put_assigns_increasing_versions() {
        let store = store();
        let (v1, _) = store.put(Object::new("/out/a", b"1".to_vec())).await.unwrap();
        let (v2, _) = store.put(Object::new("/out/a", b"2".to_vec())).await.unwrap();
        assert!(v2 > v1);

        let latest = store.get("/out/a", CURRENT_VERSION).await.unwrap().unwrap();
        assert_eq!(latest.blob, b"2");
        assert_eq!(latest.version, v2);

        let old = store.get("/out/a", v1).await.unwrap().unwrap();
        assert_eq!(old.blob, b"1");
    }

    #[tokio::test]
    async fn keys_outside_pools_are_rejected() {
        let store = store();
        let err = store.put(Object::new("/elsewhere/a", vec![])).await.unwrap_err();
        assert!(matches!(err, ServiceError::NoObjectPool(_)));
    }

    #[tokio::test]
    async fn remove_hides_latest_but_keeps_history() {
        let store = store();
        let (v1, _) = store.put(Object::new("/out/a", b"x".to_vec())).await.unwrap();
        store.remove("/out/a").await.unwrap();

        assert!(store.get("/out/a", CURRENT_VERSION).await.unwrap().is_none());
        assert!(store.get("/out/a", v1).await.unwrap().is_some());
        assert!(store.list_keys("/out/", CURRENT_VERSION).await.unwrap().is_empty());
        assert_eq!(store.list_keys("/out/", v1).await.unwrap(), vec!["/out/a".to_string()]);
    }

    #[tokio::test]
    async fn get_size_and_missing_version() {
        let store = store();
        store.put(Object::new("/out/a", vec![0; 12])).await.unwrap();
        assert_eq!(store.get_size("/out/a", CURRENT_VERSION).await.unwrap(), 12);
        assert_eq!(store.get_size("/out/none", CURRENT_VERSION).await.unwrap(), 0);
        assert!(matches!(
            store.get("/out/a", 999).await,
            Err(ServiceError::NoSuchVersion { version: 999, .. })
        ));
    }

    #[tokio::test]
    async fn get_by_time_returns_value_at_timestamp() {
        let store = store();
        let (_, t1) = store.put(Object::new("/out/a", b"1".to_vec())).await.unwrap();
        assert!(store.get_by_time("/out/a", 0).await.unwrap().is_none());
        let at = store.get_by_time("/out/a", t1).await.unwrap().unwrap();
        assert_eq!(at.blob, b"1");
    }

    #[tokio::test]
    async fn trigger_put_notifies_without_storing() {
        let store = store();
        let mut triggers = store.subscribe_triggers();
        store.trigger_put(Object::new("/out/t", b"t".to_vec())).await.unwrap();

        assert_eq!(triggers.recv().await.unwrap().key, "/out/t");
        assert!(store.latest("/out/t").is_none());
    }

    #[tokio::test]
    async fn execute_maps_results_to_replies() {
        let store = store();
        let reply = execute(
            store.as_ref(),
            Operation::Put {
                object: Object::new("/out/a", b"x".to_vec()),
            },
        )
        .await;
        assert!(matches!(reply, Some(Reply::Stored { version: 1, .. })));

        let reply = execute(
            store.as_ref(),
            Operation::Get {
                key: "/out/missing".into(),
                version: CURRENT_VERSION,
            },
        )
        .await;
        assert_eq!(reply, Some(Reply::NotFound));

        let reply = execute(
            store.as_ref(),
            Operation::Remove {
                key: "/nowhere/a".into(),
            },
        )
        .await;
        assert!(matches!(reply, Some(Reply::Failed { .. })));

        let reply = execute(
            store.as_ref(),
            Operation::PutAndForget {
                object: Object::new("/out/b", b"y".to_vec()),
            },
        )
        .await;
        assert_eq!(reply, None);
        assert_eq!(store.latest("/out/b").unwrap().blob, b"y");
    }
}
