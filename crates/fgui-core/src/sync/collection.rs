use crate::api::{
    record_id, unpack_fields, CollectionConfig, FieldSpec, Record, RecordEvent, ServiceError,
};
use crate::client::connection::ServerHandle;
use crate::client::gateway::{CallFuture, Gateway};
use crate::client::listeners::{EventMultiplexer, ListenerId};
use crate::client::types::{CallError, ServerStatus};
use crate::sync::cache::RecordCache;
use crate::sync::template::{empty_template, merge_template, representative_record, TemplateOptions};

use futures::future::{try_join_all, FutureExt};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::AbortHandle;

/// Events emitted upward by a collection synchronizer.
#[derive(Clone, Debug, PartialEq)]
pub enum CollectionEvent {
    /// Bulk load finished; the cache now holds exactly `records`
    Loaded { collection_id: String, records: Vec<Record> },
    Created { collection_id: String, record: Record },
    Updated { collection_id: String, record: Record },
    Patched { collection_id: String, record: Record },
    Removed { collection_id: String, record: Record },
    /// Cache dropped because the server is no longer ready
    Cleared { collection_id: String },
    ErrorChanged { collection_id: String, error: Option<ServiceError> },
    /// Field list edited; carries the config to persist
    FieldsChanged { config: CollectionConfig },
    /// Current record changed
    Selected { collection_id: String, record_id: Option<String> },
}

impl CollectionEvent {
    pub fn collection_id(&self) -> &str {
        match self {
            CollectionEvent::Loaded { collection_id, .. }
            | CollectionEvent::Created { collection_id, .. }
            | CollectionEvent::Updated { collection_id, .. }
            | CollectionEvent::Patched { collection_id, .. }
            | CollectionEvent::Removed { collection_id, .. }
            | CollectionEvent::Cleared { collection_id }
            | CollectionEvent::ErrorChanged { collection_id, .. }
            | CollectionEvent::Selected { collection_id, .. } => collection_id,
            CollectionEvent::FieldsChanged { config } => &config.id,
        }
    }
}

struct State {
    fields: Vec<FieldSpec>,
    cache: RecordCache,
    template: Record,
    selected: Vec<String>,
    current: Option<String>,
    last_error: Option<ServiceError>,
    /// Present while subscribed to the server's change events
    listeners: Vec<(RecordEvent, ListenerId)>,
    /// Bumped on every load and clear; a load finishing under an older
    /// epoch is discarded
    load_epoch: u64,
    /// Socket generation the cache was loaded from
    source: Option<u64>,
}

/// Shared with listener callbacks and in-flight calls, which hold it weakly
/// so a dropped synchronizer ignores late results.
struct Inner {
    id: String,
    path: String,
    state: Mutex<State>,
    event_tx: async_channel::Sender<CollectionEvent>,
}

impl Inner {
    fn emit(&self, event: CollectionEvent) {
        if self.event_tx.try_send(event).is_err() {
            log::debug!("{}: event receiver gone", self.path);
        }
    }

    fn set_error(&self, error: Option<ServiceError>) {
        let mut state = self.state.lock();
        if state.last_error != error {
            state.last_error = error.clone();
            self.emit(CollectionEvent::ErrorChanged {
                collection_id: self.id.clone(),
                error,
            });
        }
    }

    /// Most recent event wins.
    fn apply(&self, event: RecordEvent, record: &Record) {
        let mut state = self.state.lock();
        let collection_id = self.id.clone();
        let record = record.clone();
        match event {
            RecordEvent::Created | RecordEvent::Updated | RecordEvent::Patched => {
                if state.cache.upsert(record.clone()).is_none() {
                    return;
                }
                merge_template(&mut state.template, &record);
                self.emit(match event {
                    RecordEvent::Created => CollectionEvent::Created { collection_id, record },
                    RecordEvent::Updated => CollectionEvent::Updated { collection_id, record },
                    _ => CollectionEvent::Patched { collection_id, record },
                });
            }
            RecordEvent::Removed => {
                let Some(id) = record_id(&record) else {
                    log::warn!("{}: removed event without id", self.path);
                    return;
                };
                if state.cache.remove(&id).is_none() {
                    log::warn!("{}: removed record {} not in cache", self.path, id);
                    return;
                }
                state.selected.retain(|selected| *selected != id);
                self.emit(CollectionEvent::Removed { collection_id, record });
            }
        }
    }

    /// Drop every record and any load in flight, and start mirroring the
    /// socket of `source`.
    fn reset(&self, source: Option<u64>) {
        let mut state = self.state.lock();
        let had_data = state.source.is_some() || !state.cache.is_empty();
        state.load_epoch += 1;
        state.cache.clear();
        state.source = source;
        drop(state);
        if had_data {
            log::debug!("{}: cache cleared", self.path);
            self.emit(CollectionEvent::Cleared {
                collection_id: self.id.clone(),
            });
        }
    }

    fn finish_load(
        &self,
        epoch: u64,
        result: Result<Vec<Record>, CallError>,
    ) -> Result<usize, CallError> {
        let mut state = self.state.lock();
        if state.load_epoch != epoch {
            log::debug!("{}: discarding superseded load", self.path);
            return Ok(0);
        }
        match result {
            Ok(records) => {
                for record in &records {
                    merge_template(&mut state.template, record);
                }
                state.cache.replace_all(records);
                let loaded = state.cache.records();
                log::info!("{}: loaded {} records", self.path, loaded.len());
                self.emit(CollectionEvent::Loaded {
                    collection_id: self.id.clone(),
                    records: loaded.clone(),
                });
                Ok(loaded.len())
            }
            Err(e) => {
                log::warn!("{}: load failed: {}", self.path, e);
                drop(state);
                self.set_error(Some(e.to_service_error()));
                Err(e)
            }
        }
    }
}

/// Local mirror of one collection plus CRUD against it.
///
/// The cache is only changed by change events and bulk loads, never by the
/// CRUD calls themselves.
pub struct CollectionSync {
    inner: Arc<Inner>,
    server_id: String,
    gateway: Gateway,
    multiplexer: Arc<EventMultiplexer>,
    runtime: Handle,
    /// Present when built on a running server; reads are only served while
    /// it reports ready on the socket the cache was loaded from
    status: Option<watch::Receiver<ServerStatus>>,
    follower: Option<AbortHandle>,
}

impl CollectionSync {
    pub fn new(
        config: CollectionConfig,
        gateway: Gateway,
        multiplexer: Arc<EventMultiplexer>,
        event_tx: async_channel::Sender<CollectionEvent>,
        runtime: Handle,
    ) -> Self {
        let state = State {
            fields: config.fields,
            cache: RecordCache::new(),
            template: empty_template(),
            selected: Vec::new(),
            current: None,
            last_error: None,
            listeners: Vec::new(),
            load_epoch: 0,
            source: None,
        };
        Self {
            inner: Arc::new(Inner {
                id: config.id,
                path: config.path,
                state: Mutex::new(state),
                event_tx,
            }),
            server_id: config.server_id,
            gateway,
            multiplexer,
            runtime,
            status: None,
            follower: None,
        }
    }

    /// Build on top of a running server. Listeners are registered right
    /// away (the multiplexer attaches them once a socket exists) and the
    /// cache then follows the server's ready flag on its own.
    pub fn for_server(
        config: CollectionConfig,
        server: &ServerHandle,
        event_tx: async_channel::Sender<CollectionEvent>,
        runtime: Handle,
    ) -> Self {
        let mut sync = Self::new(
            config,
            server.gateway().clone(),
            server.listeners().clone(),
            event_tx,
            runtime,
        );
        sync.on_initialized(true);

        let status = server.watch_status();
        let follower = sync.runtime.spawn(follow_readiness(
            Arc::downgrade(&sync.inner),
            sync.gateway.clone(),
            status.clone(),
        ));
        sync.status = Some(status);
        sync.follower = Some(follower.abort_handle());
        sync
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn config(&self) -> CollectionConfig {
        CollectionConfig {
            id: self.inner.id.clone(),
            server_id: self.server_id.clone(),
            path: self.inner.path.clone(),
            fields: self.fields(),
        }
    }

    pub fn fields(&self) -> Vec<FieldSpec> {
        self.inner.state.lock().fields.clone()
    }

    // ── Server lifecycle ────────────────────────────────────────────────────

    /// Subscribe to (or drop) the four change events. Idempotent.
    pub fn on_initialized(&self, value: bool) {
        let mut state = self.inner.state.lock();
        if value && state.listeners.is_empty() {
            for event in RecordEvent::ALL {
                let weak: Weak<Inner> = Arc::downgrade(&self.inner);
                let id = self.multiplexer.subscribe(&self.inner.path, event, move |record| {
                    if let Some(inner) = weak.upgrade() {
                        inner.apply(event, record);
                    }
                });
                state.listeners.push((event, id));
            }
            log::debug!("{}: listening for changes", self.inner.path);
        } else if !value {
            for (event, id) in state.listeners.drain(..) {
                self.multiplexer.unsubscribe(&self.inner.path, event, id);
            }
        }
    }

    /// Load the collection when the server becomes ready; drop the cache
    /// when it stops being ready. Collections built with
    /// [`CollectionSync::for_server`] do this themselves.
    pub fn on_ready(&self, value: bool) {
        if value {
            let load = self.reload();
            self.runtime.spawn(async move {
                let _ = load.await;
            });
        } else {
            self.inner.reset(None);
        }
    }

    /// Fetch every record and replace the cache with the result.
    pub fn reload(&self) -> CallFuture<usize> {
        load(&self.inner, &self.gateway)
    }

    /// Whether the cache mirrors the server's current ready socket.
    fn serving(&self, state: &State) -> bool {
        match &self.status {
            None => true,
            Some(status) => {
                let status = status.borrow();
                status.is_ready && state.source == Some(status.socket_generation)
            }
        }
    }

    // ── CRUD ────────────────────────────────────────────────────────────────

    pub fn create_record(&self, record: Record) -> CallFuture<Record> {
        self.track(self.gateway.create(&self.inner.path, record))
    }

    pub fn update_record(&self, id: &str, record: Record) -> CallFuture<Record> {
        self.track(self.gateway.update(&self.inner.path, id, record))
    }

    pub fn patch_record(&self, id: &str, record: Record) -> CallFuture<Record> {
        self.track(self.gateway.patch(&self.inner.path, id, record))
    }

    pub fn delete_record(&self, id: &str) -> CallFuture<Record> {
        self.track(self.gateway.remove(&self.inner.path, id))
    }

    /// Cached record by id. Nothing is served while the server is not
    /// ready, even before the cache has been dropped.
    pub fn read_record(&self, id: &str) -> Option<Record> {
        let state = self.inner.state.lock();
        if !self.serving(&state) {
            return None;
        }
        state.cache.get(id).cloned()
    }

    pub fn records(&self) -> Vec<Record> {
        let state = self.inner.state.lock();
        if !self.serving(&state) {
            return Vec::new();
        }
        state.cache.records()
    }

    pub fn len(&self) -> usize {
        let state = self.inner.state.lock();
        if !self.serving(&state) {
            return 0;
        }
        state.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delete every selected record, then clear the selection. Any failed
    /// delete fails the batch and leaves the selection as it was.
    pub fn remove_selected_records(&self) -> CallFuture<Vec<Record>> {
        let selected = self.selected_records();
        let deletes: Vec<_> = selected.iter().map(|id| self.delete_record(id)).collect();
        let inner = Arc::downgrade(&self.inner);
        async move {
            let removed = try_join_all(deletes).await?;
            if let Some(inner) = inner.upgrade() {
                inner.state.lock().selected.clear();
            }
            Ok(removed)
        }
        .boxed()
    }

    pub fn representative_record(&self, options: TemplateOptions) -> Record {
        let state = self.inner.state.lock();
        representative_record(&state.template, &state.fields, options)
    }

    // ── Selection ───────────────────────────────────────────────────────────

    pub fn set_selected_records(&self, ids: Vec<String>) {
        self.inner.state.lock().selected = ids;
    }

    pub fn selected_records(&self) -> Vec<String> {
        self.inner.state.lock().selected.clone()
    }

    pub fn select_record(&self, id: Option<String>) {
        self.inner.state.lock().current = id.clone();
        self.inner.emit(CollectionEvent::Selected {
            collection_id: self.inner.id.clone(),
            record_id: id,
        });
    }

    pub fn current_record_id(&self) -> Option<String> {
        self.inner.state.lock().current.clone()
    }

    pub fn current_record(&self) -> Option<Record> {
        let state = self.inner.state.lock();
        if !self.serving(&state) {
            return None;
        }
        let id = state.current.as_deref()?;
        state.cache.get(id).cloned()
    }

    // ── Fields & errors ─────────────────────────────────────────────────────

    pub fn set_fields(&self, fields: Vec<FieldSpec>) {
        self.inner.state.lock().fields = fields;
        self.inner.emit(CollectionEvent::FieldsChanged { config: self.config() });
    }

    /// Set fields from a packed `{property: type}` lookup.
    pub fn update_fields(&self, packed: &Map<String, Value>) {
        self.set_fields(unpack_fields(packed));
    }

    pub fn last_error(&self) -> Option<ServiceError> {
        self.inner.state.lock().last_error.clone()
    }

    pub fn clear_error(&self) {
        self.inner.set_error(None);
    }

    fn track<T: Send + 'static>(&self, call: CallFuture<T>) -> CallFuture<T> {
        let inner = Arc::downgrade(&self.inner);
        async move {
            let result = call.await;
            if let (Err(e), Some(inner)) = (&result, inner.upgrade()) {
                log::warn!("{}: call failed: {}", inner.path, e);
                inner.set_error(Some(e.to_service_error()));
            }
            result
        }
        .boxed()
    }
}

fn load(inner: &Arc<Inner>, gateway: &Gateway) -> CallFuture<usize> {
    let epoch = {
        let mut state = inner.state.lock();
        state.load_epoch += 1;
        state.load_epoch
    };
    let call = gateway.find(&inner.path, Value::Object(Map::new()));
    let inner = Arc::downgrade(inner);
    async move {
        let result = call.await;
        match inner.upgrade() {
            Some(inner) => inner.finish_load(epoch, result),
            None => Ok(0),
        }
    }
    .boxed()
}

/// Keep the cache on the server's ready socket: reload whenever a socket
/// becomes ready, drop everything when it stops being ready.
async fn follow_readiness(
    inner: Weak<Inner>,
    gateway: Gateway,
    mut status: watch::Receiver<ServerStatus>,
) {
    let mut mirrored: Option<u64> = None;
    loop {
        let wanted = {
            let status = status.borrow_and_update();
            status.is_ready.then_some(status.socket_generation)
        };
        if wanted != mirrored {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.reset(wanted);
            mirrored = wanted;
            if wanted.is_some() {
                tokio::spawn(load(&inner, &gateway).map(|_| ()));
            }
        }
        if status.changed().await.is_err() {
            break;
        }
    }
}

impl Drop for CollectionSync {
    fn drop(&mut self) {
        if let Some(follower) = self.follower.take() {
            follower.abort();
        }
        self.on_initialized(false);
        self.inner.state.lock().load_epoch += 1;
    }
}
