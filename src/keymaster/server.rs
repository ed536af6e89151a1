use crate::keymaster::SubscriptionId;
use ahash::AHashMap;
use crossbeam::channel as cbchan;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread::{self, JoinHandle};
use uuid::Uuid;

pub(crate) type SubCallback = Arc<dyn Fn(&str, &Value) + Send + Sync>;

pub(crate) struct Notice {
    path: String,
    value: Value,
}

/// Store shared between the server, its dispatch thread and every
/// connected client handle.
pub(crate) struct KmShared {
    tree: Mutex<Value>,
    subs: Mutex<AHashMap<String, Vec<(SubscriptionId, SubCallback)>>>,
    notice_tx: Mutex<Option<cbchan::Sender<Notice>>>,
}

impl KmShared {
    /// Read a clone of the node at `path`.
    pub(crate) fn node(&self, path: &str) -> Option<Value> {
        let tree = self.tree.lock().unwrap();
        let mut cur = &*tree;
        for seg in path.split('.') {
            cur = cur.get(seg)?;
        }
        Some(cur.clone())
    }

    /// Write `value` at `path`, creating intermediate maps, and hand
    /// the change to the dispatch thread. The tree lock spans both so
    /// notification order equals write acceptance order.
    pub(crate) fn write(&self, path: &str, value: Value) -> bool {
        let mut tree = self.tree.lock().unwrap();
        write_at(&mut tree, path, value.clone());

        let tx = self.notice_tx.lock().unwrap();
        match tx.as_ref() {
            Some(tx) => tx
                .send(Notice {
                    path: path.to_string(),
                    value,
                })
                .is_ok(),
            None => false,
        }
    }

    pub(crate) fn add_subscription(&self, path: &str, callback: SubCallback) -> SubscriptionId {
        let id = SubscriptionId::new();
        let mut subs = self.subs.lock().unwrap();
        subs.entry(path.to_string())
            .or_default()
            .push((id, callback));
        id
    }

    pub(crate) fn remove_subscriptions(&self, path: &str, ids: &[SubscriptionId]) {
        let mut subs = self.subs.lock().unwrap();
        if let Some(list) = subs.get_mut(path) {
            list.retain(|(id, _)| !ids.contains(id));
            if list.is_empty() {
                subs.remove(path);
            }
        }
    }

    /// Callbacks registered at `path` or any of its ancestors.
    fn matching_callbacks(&self, changed: &str) -> Vec<SubCallback> {
        let subs = self.subs.lock().unwrap();
        let mut out = Vec::new();
        for (path, list) in subs.iter() {
            if changed == path || changed.starts_with(&format!("{path}.")) {
                out.extend(list.iter().map(|(_, cb)| cb.clone()));
            }
        }
        out
    }
}

fn write_at(tree: &mut Value, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    let (last, parents) = segments.split_last().expect("split never yields nothing");

    let mut cur = tree;
    for seg in parents {
        cur = ensure_object(cur)
            .entry(seg.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    ensure_object(cur).insert(last.to_string(), value);
}

fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

fn brokers() -> &'static Mutex<HashMap<String, Weak<KmShared>>> {
    static BROKERS: OnceLock<Mutex<HashMap<String, Weak<KmShared>>>> = OnceLock::new();
    BROKERS.get_or_init(|| Mutex::new(HashMap::new()))
}

pub(crate) fn lookup(url: &str) -> Option<Arc<KmShared>> {
    brokers().lock().unwrap().get(url).and_then(Weak::upgrade)
}

/// Owning side of an in-process keymaster: the configuration tree, the
/// subscription table and the dispatch thread delivering change
/// notifications in write order.
///
/// Each server registers itself under a unique `mem://` url; any number
/// of [`Keymaster`](crate::keymaster::Keymaster) clients may connect
/// for the server's lifetime. Dropping the server closes the notice
/// channel, ends the dispatch thread and invalidates the url.
pub struct KeymasterServer {
    shared: Arc<KmShared>,
    url: String,
    dispatch: Option<JoinHandle<()>>,
}

impl KeymasterServer {
    /// Create a server seeded with `tree`.
    pub fn with_tree(tree: Value) -> anyhow::Result<Self> {
        let (notice_tx, notice_rx) = cbchan::unbounded::<Notice>();

        let shared = Arc::new(KmShared {
            tree: Mutex::new(tree),
            subs: Mutex::new(AHashMap::new()),
            notice_tx: Mutex::new(Some(notice_tx)),
        });

        let url = format!("mem://km-{}", Uuid::new_v4().simple());
        brokers()
            .lock()
            .unwrap()
            .insert(url.clone(), Arc::downgrade(&shared));

        let dispatch = thread::Builder::new().name("keymaster-dispatch".into()).spawn({
            let shared = shared.clone();
            move || {
                for notice in notice_rx.iter() {
                    for callback in shared.matching_callbacks(&notice.path) {
                        callback(&notice.path, &notice.value);
                    }
                }
                tracing::debug!("[Keymaster] dispatch thread exiting");
            }
        })?;

        tracing::debug!("[Keymaster] serving at {}", url);

        Ok(Self {
            shared,
            url,
            dispatch: Some(dispatch),
        })
    }

    /// The `mem://` address clients connect to.
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Drop for KeymasterServer {
    fn drop(&mut self) {
        brokers().lock().unwrap().remove(&self.url);
        // Closing the channel ends the dispatch loop.
        self.shared.notice_tx.lock().unwrap().take();
        if let Some(handle) = self.dispatch.take() {
            let _ = handle.join();
        }
    }
}
