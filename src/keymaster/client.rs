use crate::keymaster::errors::{KeymasterError, KeymasterResult};
use crate::keymaster::server::{self, KmShared};
use crate::keymaster::SubscriptionId;
use ahash::AHashMap;
use serde_json::Value;
use std::sync::{Arc, Mutex};

/// Client handle onto a [`KeymasterServer`](crate::keymaster::KeymasterServer).
///
/// Cheap to clone; clones share the subscription bookkeeping so
/// [`unsubscribe_all`](Self::unsubscribe_all) tears down everything the
/// handle family registered. Each worker that needs its own
/// subscription lifetime should `connect` its own handle.
#[derive(Clone)]
pub struct Keymaster {
    shared: Arc<KmShared>,
    url: String,
    own: Arc<Mutex<AHashMap<String, Vec<SubscriptionId>>>>,
}

impl Keymaster {
    /// Resolve `url` against the in-process broker table.
    pub fn connect(url: &str) -> KeymasterResult<Self> {
        let shared =
            server::lookup(url).ok_or_else(|| KeymasterError::Connect(url.to_string()))?;

        Ok(Self {
            shared,
            url: url.to_string(),
            own: Arc::new(Mutex::new(AHashMap::new())),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Synchronous read of the node at `path` (clone of the subtree).
    pub fn get(&self, path: &str) -> KeymasterResult<Value> {
        self.shared
            .node(path)
            .ok_or_else(|| KeymasterError::NoSuchKey(path.to_string()))
    }

    /// Synchronous write. Subscribers of `path` and its ancestors are
    /// notified on the dispatch thread, in write order.
    pub fn put(&self, path: &str, value: Value) -> KeymasterResult<()> {
        if self.shared.write(path, value) {
            Ok(())
        } else {
            Err(KeymasterError::Closed)
        }
    }

    /// Register `callback` for writes to `path` or any descendant.
    ///
    /// The callback runs on the keymaster's dispatch thread with the
    /// changed path and its new value; it must be lock-light and must
    /// not block. Re-entrant subscribe/unsubscribe from inside a
    /// callback is not supported.
    pub fn subscribe(
        &self,
        path: &str,
        callback: impl Fn(&str, &Value) + Send + Sync + 'static,
    ) -> KeymasterResult<SubscriptionId> {
        let id = self.shared.add_subscription(path, Arc::new(callback));
        self.own
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push(id);
        Ok(id)
    }

    /// Drop every subscription this handle family registered at `path`.
    pub fn unsubscribe(&self, path: &str) -> KeymasterResult<()> {
        let ids = self.own.lock().unwrap().remove(path).unwrap_or_default();
        self.shared.remove_subscriptions(path, &ids);
        Ok(())
    }

    /// Drop every subscription this handle family registered.
    pub fn unsubscribe_all(&self) {
        let drained: Vec<(String, Vec<SubscriptionId>)> =
            self.own.lock().unwrap().drain().collect();
        for (path, ids) in drained {
            self.shared.remove_subscriptions(&path, &ids);
        }
    }
}
