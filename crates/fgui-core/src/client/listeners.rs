use crate::api::{Record, RecordEvent};
use crate::client::id::{event_key, split_event_key};
use crate::client::transport::{ClientSlot, EventSink, TransportClient};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Local change-notification callback.
pub type Listener = Arc<dyn Fn(&Record) + Send + Sync>;

/// Handle returned by [`EventMultiplexer::subscribe`], used to unsubscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type CallbackMap = HashMap<String, Vec<(ListenerId, Listener)>>;

/// The one transport-level handler per key. Fans out to the callbacks
/// registered for that key at delivery time.
struct ProxyListener {
    key: String,
    callbacks: Weak<Mutex<CallbackMap>>,
}

impl EventSink for ProxyListener {
    fn deliver(&self, record: &Record) {
        let Some(callbacks) = self.callbacks.upgrade() else {
            return;
        };
        // Snapshot so callbacks may subscribe/unsubscribe while running.
        let listeners: Vec<Listener> = callbacks
            .lock()
            .get(&self.key)
            .map(|list| list.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default();
        for listener in listeners {
            listener(record);
        }
    }
}

/// Maps `(path, event)` keys to a single transport subscription each, with
/// any number of local callbacks behind it.
pub struct EventMultiplexer {
    slot: ClientSlot,
    callbacks: Arc<Mutex<CallbackMap>>,
    proxies: Mutex<HashMap<String, Arc<ProxyListener>>>,
    next_id: AtomicU64,
}

impl EventMultiplexer {
    pub fn new(slot: ClientSlot) -> Self {
        Self {
            slot,
            callbacks: Arc::new(Mutex::new(HashMap::new())),
            proxies: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `listener` for `event` on `path`. The first callback for a
    /// key creates its proxy and attaches it to the live transport, if any;
    /// otherwise it is attached on the next connect.
    pub fn subscribe(
        &self,
        path: &str,
        event: RecordEvent,
        listener: impl Fn(&Record) + Send + Sync + 'static,
    ) -> ListenerId {
        let key = event_key(path, event);
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks
            .lock()
            .entry(key.clone())
            .or_default()
            .push((id, Arc::new(listener)));

        let mut proxies = self.proxies.lock();
        if !proxies.contains_key(&key) {
            let proxy = Arc::new(ProxyListener {
                key: key.clone(),
                callbacks: Arc::downgrade(&self.callbacks),
            });
            if let Some(client) = self.slot.get() {
                client.listen(path, event, proxy.clone());
            }
            log::debug!("Created proxy listener for {}", key);
            proxies.insert(key, proxy);
        }
        id
    }

    /// Remove a callback. Returns false (and logs) if it was not registered.
    /// Dropping the last callback of a key detaches its proxy.
    pub fn unsubscribe(&self, path: &str, event: RecordEvent, id: ListenerId) -> bool {
        let key = event_key(path, event);
        let emptied = {
            let mut callbacks = self.callbacks.lock();
            let Some(list) = callbacks.get_mut(&key) else {
                log::warn!("Unsubscribe from {} with no registered listeners", key);
                return false;
            };
            let Some(pos) = list.iter().position(|(lid, _)| *lid == id) else {
                log::warn!("Unsubscribe from {}: listener {:?} not found", key, id);
                return false;
            };
            list.remove(pos);
            if list.is_empty() {
                callbacks.remove(&key);
                true
            } else {
                false
            }
        };

        if emptied && self.proxies.lock().remove(&key).is_some() {
            if let Some(client) = self.slot.get() {
                client.unlisten(path, event);
            }
            log::debug!("Dropped proxy listener for {}", key);
        }
        true
    }

    /// Attach every proxy to a freshly created transport.
    pub fn attach_all(&self, client: &dyn TransportClient) {
        let proxies = self.proxies.lock();
        for (key, proxy) in proxies.iter() {
            if let Some((path, event)) = split_event_key(key) {
                client.listen(path, event, proxy.clone());
            }
        }
        if !proxies.is_empty() {
            log::debug!("Attached {} proxy listeners", proxies.len());
        }
    }

    /// Detach every proxy from a transport about to be torn down. The
    /// proxies themselves are kept for the next transport.
    pub fn detach_all(&self, client: &dyn TransportClient) {
        for key in self.proxies.lock().keys() {
            if let Some((path, event)) = split_event_key(key) {
                client.unlisten(path, event);
            }
        }
    }

    pub fn callback_count(&self, path: &str, event: RecordEvent) -> usize {
        self.callbacks
            .lock()
            .get(&event_key(path, event))
            .map_or(0, Vec::len)
    }

    /// Number of keys with at least one registered callback.
    pub fn key_count(&self) -> usize {
        self.callbacks.lock().len()
    }

    pub fn proxy_count(&self) -> usize {
        self.proxies.lock().len()
    }
}
