use anyhow::{Context, Result};
use menu_tree::{MenuId, MenuItem, MenuState, MenuTree, MenuValue};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::auth::{Authenticator, ClientCredential, OpenAuthenticator, PreDefinedAuthenticator};
use crate::error::ServerError;
use crate::menu_in_menu::{MenuInMenuDefinition, ReplicationMode};

// =============================================================================
// File config (figment-deserialized from defaults / TOML file / env vars)
// =============================================================================
//
//   menud.toml:      [server]
//                    port = 3333
//
//   env var:         MENUD_SERVER__PORT=3333   (double underscore = nesting)

/// Top-level configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub auth: AuthFileConfig,
    #[serde(default)]
    pub tree: TreeFileConfig,
    #[serde(default)]
    pub replicate: Vec<ReplicateFileConfig>,
}

/// Server identity and tuning (lives under `[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_name")]
    pub name: String,
    /// Random per start when unset.
    #[serde(default)]
    pub uuid: Option<Uuid>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_heartbeat_frequency_ms")]
    pub heartbeat_frequency_ms: u64,
    #[serde(default = "default_liveness_interval_ms")]
    pub liveness_interval_ms: u64,
    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            uuid: None,
            host: default_host(),
            port: default_port(),
            heartbeat_frequency_ms: default_heartbeat_frequency_ms(),
            liveness_interval_ms: default_liveness_interval_ms(),
            send_queue_capacity: default_send_queue_capacity(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    Open,
    Predefined,
}

/// Who may join (lives under `[auth]`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuthFileConfig {
    #[serde(default)]
    pub mode: AuthMode,
    #[serde(default)]
    pub clients: Vec<ClientCredential>,
}

/// Where the initial menu comes from (lives under `[tree]`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TreeFileConfig {
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// One `[[replicate]]` link to an upstream menu server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicateFileConfig {
    pub name: String,
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    pub id_offset: u32,
    pub maximum_range: u32,
    pub sub_menu_id: u32,
    #[serde(default)]
    pub mode: ReplicationMode,
}

fn default_name() -> String {
    "menud".to_string()
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    3333
}
fn default_heartbeat_frequency_ms() -> u64 {
    menu_remote::DEFAULT_HEARTBEAT_FREQUENCY_MS
}
fn default_liveness_interval_ms() -> u64 {
    200
}
fn default_send_queue_capacity() -> usize {
    100
}

/// Build a figment that layers: defaults → TOML file → MENUD_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `MENUD_SERVER__PORT=4000`  →  `server.port = 4000`
///   `MENUD_AUTH__MODE=predefined`  →  `auth.mode = "predefined"`
pub fn load_config(path: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let mut figment = Figment::from(Serialized::defaults(FileConfig::default()));
    if let Some(path) = path {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed("MENUD_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig)
// =============================================================================

/// Server configuration (runtime view).
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Name announced in the server's `Join`
    pub name: String,
    pub uuid: Uuid,
    pub host: String,
    pub port: u16,
    /// Heartbeat period the server promises its peers
    pub heartbeat_frequency: Duration,
    /// How often sessions are checked for liveness
    pub liveness_interval: Duration,
    /// Outbound queue length per session
    pub send_queue_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::from_file(&ServerFileConfig::default())
    }
}

impl ManagerConfig {
    pub fn from_file(fc: &ServerFileConfig) -> Self {
        Self {
            name: fc.name.clone(),
            uuid: fc.uuid.unwrap_or_else(Uuid::new_v4),
            host: fc.host.clone(),
            port: fc.port,
            heartbeat_frequency: Duration::from_millis(fc.heartbeat_frequency_ms.max(1)),
            liveness_interval: Duration::from_millis(fc.liveness_interval_ms.max(1)),
            send_queue_capacity: fc.send_queue_capacity.max(1),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn heartbeat_frequency_ms(&self) -> u64 {
        u64::try_from(self.heartbeat_frequency.as_millis()).unwrap_or(u64::MAX)
    }
}

/// One replication link (runtime view).
#[derive(Clone, Debug)]
pub struct ReplicateConfig {
    pub host: String,
    pub port: u16,
    pub definition: MenuInMenuDefinition,
}

impl ReplicateConfig {
    pub fn from_file(fc: &ReplicateFileConfig) -> Result<Self, ServerError> {
        Ok(Self {
            host: fc.host.clone(),
            port: fc.port,
            definition: MenuInMenuDefinition::from_file(fc)?,
        })
    }
}

impl MenuInMenuDefinition {
    pub fn from_file(fc: &ReplicateFileConfig) -> Result<Self, ServerError> {
        MenuInMenuDefinition::new(
            fc.name.clone(),
            fc.id_offset,
            fc.maximum_range,
            MenuId(fc.sub_menu_id),
            fc.mode,
        )
    }
}

pub fn build_authenticator(fc: &AuthFileConfig) -> Arc<dyn Authenticator> {
    match fc.mode {
        AuthMode::Open => Arc::new(OpenAuthenticator),
        AuthMode::Predefined => {
            info!(clients = fc.clients.len(), "using predefined client list");
            Arc::new(PreDefinedAuthenticator::new(fc.clients.clone()))
        }
    }
}

/// One entry of a JSON tree file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeEntry {
    #[serde(default = "root_parent")]
    pub parent: MenuId,
    pub item: MenuItem,
    #[serde(default)]
    pub value: Option<MenuValue>,
}

fn root_parent() -> MenuId {
    MenuId::ROOT
}

/// Read a JSON tree description. Parents must come before their children.
pub fn load_tree(path: &Path) -> Result<MenuTree> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading tree file {}", path.display()))?;
    let entries: Vec<TreeEntry> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing tree file {}", path.display()))?;
    build_tree(entries)
}

pub fn build_tree(entries: Vec<TreeEntry>) -> Result<MenuTree> {
    let tree = MenuTree::new();
    for entry in entries {
        let id = entry.item.id;
        tree.add_item(entry.parent, entry.item)
            .with_context(|| format!("adding item {id} under {}", entry.parent))?;
        if let Some(value) = entry.value {
            tree.change_state(id, MenuState::new(value));
        }
    }
    info!(items = tree.len(), "menu tree loaded");
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_file_config_defaults() {
        let fc = ServerFileConfig::default();
        assert_eq!(fc.name, "menud");
        assert_eq!(fc.host, "127.0.0.1");
        assert_eq!(fc.port, 3333);
        assert_eq!(fc.heartbeat_frequency_ms, 1500);
        assert_eq!(fc.liveness_interval_ms, 200);
        assert_eq!(fc.send_queue_capacity, 100);
        assert!(fc.uuid.is_none());
    }

    #[test]
    fn test_manager_config_from_file() {
        let uuid = Uuid::new_v4();
        let fc = ServerFileConfig {
            uuid: Some(uuid),
            heartbeat_frequency_ms: 500,
            ..Default::default()
        };
        let config = ManagerConfig::from_file(&fc);
        assert_eq!(config.uuid, uuid);
        assert_eq!(config.heartbeat_frequency, Duration::from_millis(500));
        assert_eq!(config.heartbeat_frequency_ms(), 500);
        assert_eq!(config.bind_addr(), "127.0.0.1:3333");
    }

    #[test]
    fn test_load_config_defaults() {
        let fc: FileConfig = load_config(None).extract().unwrap();
        assert_eq!(fc.auth.mode, AuthMode::Open);
        assert!(fc.replicate.is_empty());
        assert!(fc.tree.file.is_none());
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("menud.toml");
        let uuid = Uuid::new_v4();
        std::fs::write(
            &path,
            format!(
                r#"
[server]
name = "boiler"
port = 4000

[auth]
mode = "predefined"
clients = [{{ name = "panel", uuid = "{uuid}" }}]

[[replicate]]
name = "pump"
port = 3334
id_offset = 10000
maximum_range = 500
sub_menu_id = 7
mode = "add_status_item"
"#
            ),
        )
        .unwrap();

        let fc: FileConfig = load_config(Some(&path)).extract().unwrap();
        assert_eq!(fc.server.name, "boiler");
        assert_eq!(fc.server.port, 4000);
        assert_eq!(fc.server.send_queue_capacity, 100);
        assert_eq!(fc.auth.mode, AuthMode::Predefined);
        assert_eq!(fc.auth.clients[0].uuid, uuid);

        let link = ReplicateConfig::from_file(&fc.replicate[0]).unwrap();
        assert_eq!(link.host, "127.0.0.1");
        assert_eq!(link.definition.sub_menu_id, MenuId(7));
        assert_eq!(link.definition.replication_mode, ReplicationMode::AddStatusItem);

        let auth = build_authenticator(&fc.auth);
        assert!(auth.authenticate("panel", uuid));
        assert!(!auth.authenticate("panel", Uuid::new_v4()));
    }

    #[test]
    fn test_replicate_range_must_fit() {
        let fc = ReplicateFileConfig {
            name: "pump".into(),
            host: default_host(),
            port: 3334,
            id_offset: u32::MAX - 10,
            maximum_range: 100,
            sub_menu_id: 1,
            mode: ReplicationMode::Silently,
        };
        assert!(matches!(
            ReplicateConfig::from_file(&fc),
            Err(ServerError::InvalidReplicationRange { .. })
        ));
    }

    #[test]
    fn test_load_tree_from_json() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tree.json");
        std::fs::write(
            &path,
            r#"[
  { "parent": 0, "item": { "id": 1, "name": "Settings", "kind": "sub_menu", "secured": false } },
  { "parent": 1, "item": { "id": 2, "name": "Volume", "kind": "analog", "max_value": 100 },
    "value": { "type": "int", "value": 42 } },
  { "parent": 0, "item": { "id": 3, "name": "Start", "kind": "action" } }
]"#,
        )
        .unwrap();

        let tree = load_tree(&path).unwrap();
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.find_parent(MenuId(2)).map(|p| p.id), Some(MenuId(1)));
        assert_eq!(tree.get_state(MenuId(2)).unwrap().value, MenuValue::Int(42));
    }

    #[test]
    fn test_load_tree_rejects_orphans() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tree.json");
        std::fs::write(
            &path,
            r#"[{ "parent": 9, "item": { "id": 2, "name": "Lost", "kind": "action" } }]"#,
        )
        .unwrap();
        assert!(load_tree(&path).is_err());
    }
}
