use fgui_core::api::{CollectionConfig, ServerConfig};
use fgui_core::client::ClientSettings;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Current state schema version - increment when making breaking changes
pub const STATE_VERSION: u32 = 1;

/// Everything that survives a restart: configuration lists and the current
/// selection. Live connections and caches are rebuilt on load.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    /// Collection configs, each pointing at its server by id
    #[serde(default)]
    pub services: Vec<CollectionConfig>,
    #[serde(default)]
    pub current_server_id: Option<String>,
    #[serde(default)]
    pub current_service_id: Option<String>,
    #[serde(default)]
    pub current_record_id: Option<String>,
    #[serde(default)]
    pub client: ClientSettings,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            servers: Vec::new(),
            services: Vec::new(),
            current_server_id: None,
            current_service_id: None,
            current_record_id: None,
            client: ClientSettings::default(),
        }
    }
}

impl PersistedState {
    pub fn server(&self, id: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|s| s.id == id)
    }

    pub fn service(&self, id: &str) -> Option<&CollectionConfig> {
        self.services.iter().find(|s| s.id == id)
    }

    pub fn upsert_server(&mut self, config: ServerConfig) {
        match self.servers.iter_mut().find(|s| s.id == config.id) {
            Some(existing) => *existing = config,
            None => self.servers.push(config),
        }
    }

    pub fn upsert_service(&mut self, config: CollectionConfig) {
        match self.services.iter_mut().find(|s| s.id == config.id) {
            Some(existing) => *existing = config,
            None => self.services.push(config),
        }
    }

    /// Remove a server and every collection that points at it. Returns the
    /// ids of the removed collections.
    pub fn remove_server(&mut self, id: &str) -> Vec<String> {
        self.servers.retain(|s| s.id != id);
        let removed: Vec<String> = self
            .services
            .iter()
            .filter(|s| s.server_id == id)
            .map(|s| s.id.clone())
            .collect();
        for service_id in &removed {
            self.remove_service(service_id);
        }
        if self.current_server_id.as_deref() == Some(id) {
            self.current_server_id = None;
        }
        removed
    }

    pub fn remove_service(&mut self, id: &str) {
        self.services.retain(|s| s.id != id);
        if self.current_service_id.as_deref() == Some(id) {
            self.current_service_id = None;
            self.current_record_id = None;
        }
    }

    /// Drop collections whose server is gone and selections pointing nowhere.
    pub(crate) fn validate(&mut self) {
        let orphans: Vec<String> = self
            .services
            .iter()
            .filter(|s| self.server(&s.server_id).is_none())
            .map(|s| s.id.clone())
            .collect();
        for id in orphans {
            log::warn!("Dropping collection {} of unknown server", id);
            self.remove_service(&id);
        }
        if let Some(id) = &self.current_server_id {
            if self.server(id).is_none() {
                self.current_server_id = None;
            }
        }
        if let Some(id) = &self.current_service_id {
            if self.service(id).is_none() {
                self.current_service_id = None;
                self.current_record_id = None;
            }
        }
    }
}

/// Get the config directory path
pub fn get_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fgui")
}

/// Get the state file path
pub fn get_state_path() -> PathBuf {
    get_config_dir().join("state.json")
}

/// Load state from the default location.
pub fn load_state() -> PersistedState {
    load_state_from(&get_state_path())
}

/// Save state to the default location.
pub fn save_state(state: &PersistedState) -> Result<()> {
    save_state_to(&get_state_path(), state)
}

/// Load state with partial recovery of a damaged file. Never fails: the
/// worst case is the default state, with the old file left in place.
pub fn load_state_from(path: &Path) -> PersistedState {
    if !path.exists() {
        log::info!("State file not found at {}, using defaults", path.display());
        return PersistedState::default();
    }

    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            log::error!("Failed to read state file {}: {}", path.display(), e);
            return PersistedState::default();
        }
    };

    let mut recovered = false;
    let mut state = match serde_json::from_str::<PersistedState>(&content) {
        Ok(state) => state,
        Err(e) => {
            log::warn!("Failed to parse state directly: {}, attempting partial recovery", e);
            match recover_state_from_json(&content) {
                Ok(state) => {
                    log::info!("Recovered state with partial data");
                    recovered = true;
                    state
                }
                Err(e) => {
                    log::error!("Failed to recover state from {}: {}", path.display(), e);
                    return PersistedState::default();
                }
            }
        }
    };

    let original_version = state.version;
    state = migrate_state(state);
    state.validate();
    // Rewrite the file so the next load takes the fast path
    if recovered || original_version != state.version {
        if let Err(e) = save_state_to(path, &state) {
            log::warn!("Failed to save repaired state: {}", e);
        }
    }
    state
}

pub fn save_state_to(path: &Path, state: &PersistedState) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(state)?;
    std::fs::write(path, content).with_context(|| format!("writing {}", path.display()))?;
    #[cfg(unix)]
    {
        // Credentials may be stored here
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }
    Ok(())
}

/// Extract whatever is readable from a malformed state file. List entries
/// are recovered one by one; anything unreadable falls back to defaults.
fn recover_state_from_json(content: &str) -> Result<PersistedState> {
    let value: serde_json::Value =
        serde_json::from_str(content).context("State file is not valid JSON")?;
    let obj = value.as_object().context("State file root is not a JSON object")?;

    let mut state = PersistedState {
        version: 0,
        ..PersistedState::default()
    };

    if let Some(v) = obj.get("version").and_then(|v| v.as_u64()) {
        state.version = v as u32;
    }

    if let Some(items) = obj.get("servers").and_then(|v| v.as_array()) {
        state.servers = recover_list(items, "server");
    }

    if let Some(items) = obj.get("services").and_then(|v| v.as_array()) {
        state.services = recover_list(items, "collection");
    }

    for (key, slot) in [
        ("currentServerId", &mut state.current_server_id),
        ("currentServiceId", &mut state.current_service_id),
        ("currentRecordId", &mut state.current_record_id),
    ] {
        if let Some(id) = obj.get(key).and_then(|v| v.as_str()) {
            *slot = Some(id.to_string());
        }
    }

    if let Some(v) = obj.get("client") {
        match serde_json::from_value::<ClientSettings>(v.clone()) {
            Ok(client) => state.client = client,
            Err(_) => log::warn!("Could not parse client settings, using defaults"),
        }
    }

    Ok(state)
}

fn recover_list<T: serde::de::DeserializeOwned>(items: &[serde_json::Value], what: &str) -> Vec<T> {
    items
        .iter()
        .filter_map(|item| match serde_json::from_value::<T>(item.clone()) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                log::warn!("Skipping unreadable {} entry: {}", what, e);
                None
            }
        })
        .collect()
}

/// Migrate state from older versions to the current version
fn migrate_state(mut state: PersistedState) -> PersistedState {
    let original_version = state.version;

    // v0 files predate versioning; the layout is unchanged
    if state.version == 0 {
        log::info!("Migrating state from pre-versioning (v0) to v1");
        state.version = 1;
    }

    if original_version != state.version {
        log::info!("State migrated from v{} to v{}", original_version, state.version);
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use fgui_core::api::ServerProps;

    fn server(url: &str) -> ServerConfig {
        ServerConfig::new(ServerProps {
            url: url.to_string(),
            is_active: true,
            authentication: None,
        })
    }

    #[test]
    fn round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let mut state = PersistedState::default();
        let srv = server("ws://host:1");
        state.services.push(CollectionConfig::new(&srv.id, "items"));
        state.current_server_id = Some(srv.id.clone());
        state.upsert_server(srv);

        save_state_to(&path, &state).unwrap();
        assert_eq!(load_state_from(&path), state);

        let content = std::fs::read_to_string(&path).unwrap();
        let raw: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert!(raw.get("currentServerId").is_some());
        assert!(raw["servers"][0].get("isActive").is_some());
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let state = load_state_from(&dir.path().join("absent.json"));
        assert_eq!(state, PersistedState::default());
    }

    #[test]
    fn partial_recovery_skips_bad_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(
            &path,
            r#"{
                "version": 1,
                "servers": [
                    {"id": "s1", "url": "ws://host:1", "isActive": true},
                    {"id": 5}
                ],
                "services": [{"id": "c1", "serverId": "s1", "path": "items"}],
                "currentServerId": "s1",
                "client": "garbage"
            }"#,
        )
        .unwrap();

        let state = load_state_from(&path);
        assert_eq!(state.servers.len(), 1);
        assert_eq!(state.services.len(), 1);
        assert_eq!(state.current_server_id.as_deref(), Some("s1"));
        assert_eq!(state.client, ClientSettings::default());

        // The repaired file parses directly now
        let content = std::fs::read_to_string(&path).unwrap();
        let repaired: PersistedState = serde_json::from_str(&content).unwrap();
        assert_eq!(repaired, state);
    }

    #[test]
    fn unversioned_file_is_migrated_and_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, r#"{"servers": []}"#).unwrap();

        let state = load_state_from(&path);
        assert_eq!(state.version, STATE_VERSION);
        let content = std::fs::read_to_string(&path).unwrap();
        let rewritten: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(rewritten["version"], serde_json::json!(STATE_VERSION));
    }

    #[test]
    fn remove_server_cascades() {
        let mut state = PersistedState::default();
        let keep = server("ws://keep");
        let gone = server("ws://gone");
        let gone_items = CollectionConfig::new(&gone.id, "items");
        state.services.push(CollectionConfig::new(&keep.id, "items"));
        state.services.push(gone_items.clone());
        state.current_server_id = Some(gone.id.clone());
        state.current_service_id = Some(gone_items.id.clone());
        state.current_record_id = Some("r1".into());
        state.upsert_server(keep);
        state.upsert_server(gone.clone());

        let removed = state.remove_server(&gone.id);
        assert_eq!(removed, vec![gone_items.id]);
        assert_eq!(state.services.len(), 1);
        assert_eq!(state.current_server_id, None);
        assert_eq!(state.current_service_id, None);
        assert_eq!(state.current_record_id, None);
    }

    #[test]
    fn validate_drops_orphans() {
        let mut state = PersistedState::default();
        state.services.push(CollectionConfig::new("nobody", "items"));
        state.current_server_id = Some("nobody".into());
        state.validate();
        assert!(state.services.is_empty());
        assert!(state.current_server_id.is_none());
    }
}
