//! Seams to the relational store. The store itself is an external
//! collaborator; the daemon ships file-backed implementations so it can run
//! against a directory of JSON documents: one for server records, one for
//! RCON credential material, and a JSON-lines trail for load history.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::models::{
    classify_game_engine, RconCredentials, ServerInfo, ServerLoadRow, ServerStatus,
};

#[async_trait]
pub trait CredentialsRepo: Send + Sync {
    /// Decrypted credentials for one server, or None when the server has no
    /// RCON material on file. Never cached by callers across failures.
    async fn get_rcon_credentials(&self, server_id: i64) -> Result<Option<RconCredentials>>;
    /// Write-through of the latest parsed status.
    async fn update_server_status(&self, server_id: i64, status: &ServerStatus) -> Result<()>;
}

#[async_trait]
pub trait ServerRepo: Send + Sync {
    async fn find_active_servers_with_rcon(&self) -> Result<Vec<ServerInfo>>;
    async fn find_by_id(&self, server_id: i64) -> Result<Option<ServerInfo>>;
    async fn has_rcon_credentials(&self, server_id: i64) -> Result<bool>;
    async fn record_server_load(&self, row: &ServerLoadRow) -> Result<()>;
}

#[async_trait]
pub trait ServerConfigRepo: Send + Sync {
    async fn get_server_config(&self, server_id: i64, key: &str) -> Result<Option<String>>;
    async fn get_mod_default(&self, game: &str, key: &str) -> Result<Option<String>>;
    async fn get_server_config_default(&self, key: &str) -> Result<Option<String>>;
}

/// Decrypts credential material coming out of the store.
pub trait CryptoService: Send + Sync {
    fn decrypt(&self, ciphertext: &str) -> Result<String>;
}

/// Post-capture enrichment hook (geo lookups, rankings, ...) owned by the
/// wider system.
#[async_trait]
pub trait ServerStatusEnricher: Send + Sync {
    async fn enrich_server_status(&self, server_id: i64) -> Result<()>;
}

/// Stand-in cipher for deployments where passwords are stored in the clear.
pub struct PlaintextCrypto;

impl CryptoService for PlaintextCrypto {
    fn decrypt(&self, ciphertext: &str) -> Result<String> {
        Ok(ciphertext.to_owned())
    }
}

// WARNING: If you add non-Optional values here, you must give them defaults or
//          you will break store loading
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredServer {
    pub server_id: i64,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub game_tag: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub config: HashMap<String, String>,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreDocument {
    #[serde(default)]
    pub servers: Vec<StoredServer>,
    /// Per-game command defaults, keyed by game tag then config key.
    #[serde(default)]
    pub mod_defaults: HashMap<String, HashMap<String, String>>,
    /// Process-wide config defaults.
    #[serde(default)]
    pub defaults: HashMap<String, String>,
}

/// One entry of the credentials document. Passwords are stored as the
/// ciphertext the configured [`CryptoService`] understands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCredential {
    pub server_id: i64,
    pub rcon_password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialsDocument {
    #[serde(default)]
    pub credentials: Vec<StoredCredential>,
}

/// JSON-document store implementing every repository seam. Server records
/// and credential material are separate documents so credentials can be
/// rotated or withheld without touching the fleet description.
pub struct FileStore {
    document: StoreDocument,
    credentials: HashMap<i64, String>,
    crypto: Box<dyn CryptoService>,
    load_history_file: PathBuf,
    history: Mutex<()>,
    statuses: Mutex<HashMap<i64, ServerStatus>>,
}

impl FileStore {
    pub fn load(
        servers_file: &Path,
        credentials_file: &Path,
        load_history_file: &Path,
        crypto: Box<dyn CryptoService>,
    ) -> Result<Self> {
        trace!("Loading server store from {}", servers_file.display());
        let document: StoreDocument = read_json_or_default(servers_file)?;

        trace!(
            "Loading rcon credentials from {}",
            credentials_file.display()
        );
        let credentials_document: CredentialsDocument = read_json_or_default(credentials_file)?;
        let credentials = credentials_document
            .credentials
            .into_iter()
            .map(|c| (c.server_id, c.rcon_password))
            .collect();

        Ok(Self {
            document,
            credentials,
            crypto,
            load_history_file: load_history_file.to_owned(),
            history: Mutex::new(()),
            statuses: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_documents(
        document: StoreDocument,
        credentials: HashMap<i64, String>,
        load_history_file: PathBuf,
    ) -> Self {
        Self {
            document,
            credentials,
            crypto: Box::new(PlaintextCrypto),
            load_history_file,
            history: Mutex::new(()),
            statuses: Mutex::new(HashMap::new()),
        }
    }

    fn server(&self, server_id: i64) -> Option<&StoredServer> {
        self.document
            .servers
            .iter()
            .find(|s| s.server_id == server_id)
    }

    fn to_info(&self, server: &StoredServer) -> ServerInfo {
        ServerInfo {
            server_id: server.server_id,
            name: server.name.clone(),
            address: server.address.clone(),
            port: server.port,
            game_tag: server.game_tag.clone(),
            tags: server.tags.clone(),
            active: server.active,
            has_rcon: self.credentials.contains_key(&server.server_id),
        }
    }

    #[cfg(test)]
    pub fn last_status(&self, server_id: i64) -> Option<ServerStatus> {
        self.statuses.lock().unwrap().get(&server_id).cloned()
    }
}

fn read_json_or_default<T: Default + serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    if !path.exists() {
        debug!("Store document {} not found, starting empty", path.display());
        return Ok(T::default());
    }
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&json).with_context(|| format!("Failed to parse {}", path.display()))
}

#[async_trait]
impl CredentialsRepo for FileStore {
    async fn get_rcon_credentials(&self, server_id: i64) -> Result<Option<RconCredentials>> {
        let Some(server) = self.server(server_id) else {
            return Ok(None);
        };
        let Some(ciphertext) = self.credentials.get(&server_id) else {
            return Ok(None);
        };
        let rcon_password = self.crypto.decrypt(ciphertext)?;

        Ok(Some(RconCredentials {
            server_id,
            address: server.address.clone(),
            port: server.port,
            rcon_password,
            game_engine: classify_game_engine(&server.game_tag),
        }))
    }

    async fn update_server_status(&self, server_id: i64, status: &ServerStatus) -> Result<()> {
        trace!(
            "Server {} status: map {} players {}/{}",
            server_id,
            status.map,
            status.players,
            status.max_players
        );
        self.statuses
            .lock()
            .expect("status map poisoned")
            .insert(server_id, status.clone());
        Ok(())
    }
}

#[async_trait]
impl ServerRepo for FileStore {
    async fn find_active_servers_with_rcon(&self) -> Result<Vec<ServerInfo>> {
        Ok(self
            .document
            .servers
            .iter()
            .filter(|s| s.active && self.credentials.contains_key(&s.server_id))
            .map(|s| self.to_info(s))
            .collect())
    }

    async fn find_by_id(&self, server_id: i64) -> Result<Option<ServerInfo>> {
        Ok(self.server(server_id).map(|s| self.to_info(s)))
    }

    async fn has_rcon_credentials(&self, server_id: i64) -> Result<bool> {
        Ok(self.credentials.contains_key(&server_id))
    }

    async fn record_server_load(&self, row: &ServerLoadRow) -> Result<()> {
        let line = serde_json::to_string(row)?;
        let _guard = self.history.lock().expect("history lock poisoned");
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.load_history_file)
            .with_context(|| {
                format!(
                    "Failed to open load history {}",
                    self.load_history_file.display()
                )
            })?;
        writeln!(file, "{}", line)?;
        Ok(())
    }
}

#[async_trait]
impl ServerConfigRepo for FileStore {
    async fn get_server_config(&self, server_id: i64, key: &str) -> Result<Option<String>> {
        Ok(self.server(server_id).and_then(|s| s.config.get(key).cloned()))
    }

    async fn get_mod_default(&self, game: &str, key: &str) -> Result<Option<String>> {
        Ok(self
            .document
            .mod_defaults
            .get(game)
            .and_then(|defaults| defaults.get(key).cloned()))
    }

    async fn get_server_config_default(&self, key: &str) -> Result<Option<String>> {
        Ok(self.document.defaults.get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn store() -> FileStore {
        let document = StoreDocument {
            servers: vec![
                StoredServer {
                    server_id: 1,
                    name: "EU #1".into(),
                    address: "10.0.0.1".into(),
                    port: 27015,
                    game_tag: "cstrike".into(),
                    tags: vec!["eu".into()],
                    active: true,
                    config: [("BroadCastEvents".to_string(), "hlx_sm_psay".to_string())]
                        .into_iter()
                        .collect(),
                },
                StoredServer {
                    server_id: 2,
                    name: "No RCON".into(),
                    address: "10.0.0.2".into(),
                    port: 27016,
                    game_tag: "csgo".into(),
                    tags: vec![],
                    active: true,
                    config: HashMap::new(),
                },
                StoredServer {
                    server_id: 3,
                    name: "Inactive".into(),
                    address: "10.0.0.3".into(),
                    port: 27017,
                    game_tag: "csgo".into(),
                    tags: vec![],
                    active: false,
                    config: HashMap::new(),
                },
            ],
            mod_defaults: [(
                "cstrike".to_string(),
                [("psay".to_string(), "amx_psay".to_string())]
                    .into_iter()
                    .collect(),
            )]
            .into_iter()
            .collect(),
            defaults: [("psay".to_string(), "ms_psay".to_string())]
                .into_iter()
                .collect(),
        };
        // server 2 deliberately has no credentials entry
        let credentials = [(1, "secret".to_string()), (3, "secret".to_string())]
            .into_iter()
            .collect();
        FileStore::from_documents(
            document,
            credentials,
            std::env::temp_dir().join("fleetmon-load-test.jsonl"),
        )
    }

    #[tokio::test]
    async fn active_rcon_servers_are_filtered() {
        let store = store();
        let servers = store.find_active_servers_with_rcon().await.unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].server_id, 1);
        assert!(servers[0].has_rcon);
    }

    #[tokio::test]
    async fn credentials_classify_engine_and_decrypt() {
        let store = store();
        let creds = store.get_rcon_credentials(1).await.unwrap().unwrap();
        assert_eq!(creds.rcon_password, "secret");
        assert_eq!(
            creds.game_engine,
            crate::models::GameEngine::GoldSrc
        );
        assert!(store.get_rcon_credentials(2).await.unwrap().is_none());
        assert!(store.get_rcon_credentials(99).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn has_rcon_follows_the_credentials_document() {
        let store = store();
        assert!(store.has_rcon_credentials(1).await.unwrap());
        assert!(!store.has_rcon_credentials(2).await.unwrap());
        // present in the credentials document even though the record is
        // inactive; activity filtering is the fleet query's job
        assert!(store.has_rcon_credentials(3).await.unwrap());

        let info = store.find_by_id(2).await.unwrap().unwrap();
        assert!(!info.has_rcon);
    }

    #[tokio::test]
    async fn config_layers_resolve_independently() {
        let store = store();
        assert_eq!(
            store.get_server_config(1, "BroadCastEvents").await.unwrap(),
            Some("hlx_sm_psay".into())
        );
        assert_eq!(
            store.get_mod_default("cstrike", "psay").await.unwrap(),
            Some("amx_psay".into())
        );
        assert_eq!(
            store.get_server_config_default("psay").await.unwrap(),
            Some("ms_psay".into())
        );
        assert_eq!(store.get_server_config(1, "missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn status_write_through_is_visible() {
        let store = store();
        let status = ServerStatus {
            map: "de_dust2".into(),
            players: 3,
            max_players: 32,
            uptime_seconds: 60,
            fps: 100.0,
            hostname: None,
            version: None,
            cpu: None,
            player_list: None,
            real_player_count: None,
            bot_count: None,
            timestamp: Utc::now(),
        };
        store.update_server_status(1, &status).await.unwrap();
        assert_eq!(store.last_status(1).unwrap().map, "de_dust2");
    }

    #[test]
    fn documents_parse_from_disk_shapes() {
        let document: StoreDocument = serde_json::from_str(
            r#"{
                "servers": [
                    { "server_id": 7, "name": "S", "address": "10.0.0.7",
                      "port": 27015, "game_tag": "cstrike" }
                ]
            }"#,
        )
        .unwrap();
        assert!(document.servers[0].active);
        assert!(document.servers[0].tags.is_empty());

        let credentials: CredentialsDocument = serde_json::from_str(
            r#"{ "credentials": [ { "server_id": 7, "rcon_password": "pw" } ] }"#,
        )
        .unwrap();
        assert_eq!(credentials.credentials[0].server_id, 7);
    }
}
