use crate::persistence::{get_state_path, load_state_from, save_state_to, PersistedState};

use fgui_core::api::{CollectionConfig, ServerConfig, ServerProps};
use fgui_core::client::{
    spawn_server, Connector, ServerEvent, ServerHandle, ServerStatus, WsConnector,
};
use fgui_core::sync::{CollectionEvent, CollectionSync};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Handle;

/// Anything the coordinator passes on to the application after handling it.
#[derive(Clone, Debug, PartialEq)]
pub enum AppEvent {
    Server(ServerEvent),
    Collection(CollectionEvent),
}

/// Owns every server connection and collection synchronizer and keeps them
/// in step with the persisted configuration.
///
/// Collections follow their server's lifecycle on their own. Persisting
/// config and selection changes waits for the application to poll
/// [`Coordinator::next_event`] (or [`Coordinator::pump`]).
pub struct Coordinator {
    state: PersistedState,
    /// Where state is saved; `None` keeps everything in memory
    store_path: Option<PathBuf>,
    connector: Arc<dyn Connector>,
    runtime: Handle,
    servers: HashMap<String, ServerHandle>,
    collections: HashMap<String, CollectionSync>,

    server_tx: async_channel::Sender<ServerEvent>,
    server_rx: async_channel::Receiver<ServerEvent>,
    collection_tx: async_channel::Sender<CollectionEvent>,
    collection_rx: async_channel::Receiver<CollectionEvent>,
}

impl Coordinator {
    /// Start from a loaded state: every server is spawned (and connects if
    /// active), every collection is attached to its server.
    pub fn new(
        state: PersistedState,
        store_path: Option<PathBuf>,
        connector: Arc<dyn Connector>,
        runtime: Handle,
    ) -> Self {
        let (server_tx, server_rx) = async_channel::unbounded();
        let (collection_tx, collection_rx) = async_channel::unbounded();

        let mut this = Self {
            state,
            store_path,
            connector,
            runtime,
            servers: HashMap::new(),
            collections: HashMap::new(),
            server_tx,
            server_rx,
            collection_tx,
            collection_rx,
        };

        let servers = this.state.servers.clone();
        for config in servers {
            this.spawn(config);
        }
        let services = this.state.services.clone();
        for config in services {
            this.attach(config);
        }
        log::info!(
            "Coordinator started with {} servers and {} collections",
            this.servers.len(),
            this.collections.len()
        );
        this
    }

    /// Load state from the default location and talk to real sockets.
    pub fn open(runtime: Handle) -> Self {
        let path = get_state_path();
        let state = load_state_from(&path);
        let connector = Arc::new(WsConnector::new(state.client.clone(), runtime.clone()));
        Self::new(state, Some(path), connector, runtime)
    }

    pub fn state(&self) -> &PersistedState {
        &self.state
    }

    pub fn server(&self, id: &str) -> Option<&ServerHandle> {
        self.servers.get(id)
    }

    pub fn server_status(&self, id: &str) -> Option<ServerStatus> {
        self.servers.get(id).map(|s| s.status())
    }

    pub fn collection(&self, id: &str) -> Option<&CollectionSync> {
        self.collections.get(id)
    }

    pub fn current_server(&self) -> Option<&ServerHandle> {
        self.servers.get(self.state.current_server_id.as_deref()?)
    }

    pub fn current_collection(&self) -> Option<&CollectionSync> {
        self.collections.get(self.state.current_service_id.as_deref()?)
    }

    // ── Servers ─────────────────────────────────────────────────────────────

    /// Create and start a server. Returns its new id.
    pub fn add_server(&mut self, props: ServerProps) -> String {
        let config = ServerConfig::new(props);
        let id = config.id.clone();
        log::info!("Adding server {} ({})", config.url, id);
        self.state.upsert_server(config.clone());
        self.persist();
        self.spawn(config);
        id
    }

    /// Stop a server and drop its collections.
    pub fn remove_server(&mut self, id: &str) -> bool {
        let Some(handle) = self.servers.remove(id) else {
            log::warn!("Cannot remove unknown server {}", id);
            return false;
        };
        handle.shutdown();

        for collection_id in self.state.remove_server(id) {
            self.collections.remove(&collection_id);
        }
        // Collections not in the state (should not happen) go as well
        self.collections.retain(|_, c| c.server_id() != id);
        self.persist();
        true
    }

    /// Replace a server's editable fields. Reconnection and the debounced
    /// save are driven by the server itself.
    pub fn update_server(&mut self, id: &str, props: ServerProps) -> bool {
        let Some(handle) = self.servers.get(id) else {
            log::warn!("Cannot update unknown server {}", id);
            return false;
        };
        handle.update(props.clone());
        self.state.upsert_server(ServerConfig {
            id: id.to_string(),
            url: props.url,
            is_active: props.is_active,
            authentication: props.authentication,
        });
        true
    }

    pub fn select_server(&mut self, id: Option<&str>) -> bool {
        if let Some(id) = id {
            if !self.servers.contains_key(id) {
                log::warn!("Cannot select unknown server {}", id);
                return false;
            }
        }
        self.state.current_server_id = id.map(str::to_string);
        self.persist();
        true
    }

    // ── Collections ─────────────────────────────────────────────────────────

    /// Attach a collection at `path` to a server. Returns its new id.
    pub fn add_collection(&mut self, server_id: &str, path: &str) -> Option<String> {
        if !self.servers.contains_key(server_id) {
            log::warn!("Cannot add collection {} to unknown server {}", path, server_id);
            return None;
        }
        let config = CollectionConfig::new(server_id, path);
        let id = config.id.clone();
        self.state.upsert_service(config.clone());
        self.persist();
        self.attach(config);
        Some(id)
    }

    pub fn remove_collection(&mut self, id: &str) -> bool {
        if self.collections.remove(id).is_none() {
            log::warn!("Cannot remove unknown collection {}", id);
            return false;
        }
        self.state.remove_service(id);
        self.persist();
        true
    }

    /// Make a collection current. The current record follows the
    /// collection's own selection.
    pub fn select_collection(&mut self, id: Option<&str>) -> bool {
        let current_record = match id {
            Some(id) => match self.collections.get(id) {
                Some(collection) => collection.current_record_id(),
                None => {
                    log::warn!("Cannot select unknown collection {}", id);
                    return false;
                }
            },
            None => None,
        };
        self.state.current_service_id = id.map(str::to_string);
        self.state.current_record_id = current_record;
        self.persist();
        true
    }

    pub fn select_record(&mut self, collection_id: &str, record_id: Option<String>) -> bool {
        let Some(collection) = self.collections.get(collection_id) else {
            log::warn!("Cannot select record in unknown collection {}", collection_id);
            return false;
        };
        collection.select_record(record_id.clone());
        if self.mirror_selection(collection_id, record_id) {
            self.persist();
        }
        true
    }

    // ── Events ──────────────────────────────────────────────────────────────

    /// Wait for the next server or collection event, apply it, and hand it
    /// to the caller.
    pub async fn next_event(&mut self) -> Option<AppEvent> {
        let event = tokio::select! {
            Ok(event) = self.server_rx.recv() => AppEvent::Server(event),
            Ok(event) = self.collection_rx.recv() => AppEvent::Collection(event),
            else => return None,
        };
        self.handle_event(&event);
        Some(event)
    }

    /// Apply every event already queued, without waiting.
    pub fn pump(&mut self) -> Vec<AppEvent> {
        let mut handled = Vec::new();
        loop {
            let event = if let Ok(event) = self.server_rx.try_recv() {
                AppEvent::Server(event)
            } else if let Ok(event) = self.collection_rx.try_recv() {
                AppEvent::Collection(event)
            } else {
                break;
            };
            self.handle_event(&event);
            handled.push(event);
        }
        handled
    }

    fn handle_event(&mut self, event: &AppEvent) {
        match event {
            AppEvent::Server(event) => self.handle_server_event(event),
            AppEvent::Collection(event) => self.handle_collection_event(event),
        }
    }

    fn handle_server_event(&mut self, event: &ServerEvent) {
        match event {
            ServerEvent::ConfigChanged { config } => {
                // A save may still arrive after the server was removed
                if self.servers.contains_key(&config.id) {
                    self.state.upsert_server(config.clone());
                    self.persist();
                }
            }
            ServerEvent::ErrorChanged { server_id, fault: Some(fault), .. } => {
                log::warn!("Server {}: {}", server_id, fault);
            }
            _ => {}
        }
    }

    fn handle_collection_event(&mut self, event: &CollectionEvent) {
        match event {
            CollectionEvent::FieldsChanged { config } => {
                if self.collections.contains_key(&config.id) {
                    self.state.upsert_service(config.clone());
                    self.persist();
                }
            }
            CollectionEvent::Selected { collection_id, record_id } => {
                if self.mirror_selection(collection_id, record_id.clone()) {
                    self.persist();
                }
            }
            _ => {}
        }
    }

    /// Copy a collection's current record into the persisted selection if it
    /// is the current collection. Returns whether anything changed.
    fn mirror_selection(&mut self, collection_id: &str, record_id: Option<String>) -> bool {
        if self.state.current_service_id.as_deref() != Some(collection_id)
            || self.state.current_record_id == record_id
        {
            return false;
        }
        self.state.current_record_id = record_id;
        true
    }

    fn spawn(&mut self, config: ServerConfig) {
        let id = config.id.clone();
        let handle = spawn_server(
            config,
            self.state.client.clone(),
            self.connector.clone(),
            self.server_tx.clone(),
            &self.runtime,
        );
        self.servers.insert(id, handle);
    }

    fn attach(&mut self, config: CollectionConfig) {
        let Some(server) = self.servers.get(&config.server_id) else {
            log::warn!("Collection {} points at unknown server {}", config.path, config.server_id);
            return;
        };
        let id = config.id.clone();
        let collection = CollectionSync::for_server(
            config,
            server,
            self.collection_tx.clone(),
            self.runtime.clone(),
        );
        self.collections.insert(id, collection);
    }

    fn persist(&self) {
        let Some(path) = &self.store_path else {
            return;
        };
        if let Err(e) = save_state_to(path, &self.state) {
            log::error!("Failed to save state to {}: {}", path.display(), e);
        }
    }

    /// Stop every server, wait for their tasks, and write the final state.
    pub async fn shutdown(mut self) {
        self.collections.clear();
        let servers: Vec<ServerHandle> = self.servers.drain().map(|(_, s)| s).collect();
        for server in &servers {
            server.shutdown();
        }
        for server in servers {
            server.join().await;
        }
        // Saves flushed on the way out
        self.pump();
        self.persist();
    }
}
