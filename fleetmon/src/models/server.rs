use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Engine families with incompatible RCON wire formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameEngine {
    GoldSrc,
    Source,
    Source2009,
}

impl Display for GameEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GameEngine::GoldSrc => write!(f, "GoldSrc"),
            GameEngine::Source => write!(f, "Source"),
            GameEngine::Source2009 => write!(f, "Source 2009"),
        }
    }
}

const SOURCE_2009_TAGS: &[&str] = &["ep2", "dod:s"];
const KNOWN_SOURCE_TAGS: &[&str] = &[
    "css", "csgo", "tf", "tf2", "hl2mp", "garrysmod", "insurgency", "fof",
];

/// Classifies a game tag into its engine family. Unknown tags fall back to
/// Source with a one-line warning.
pub fn classify_game_engine(game_tag: &str) -> GameEngine {
    let tag = game_tag.trim().to_ascii_lowercase();

    if tag.starts_with("cs_") || tag.contains("cstrike") {
        return GameEngine::GoldSrc;
    }
    if tag.starts_with("l4d") || tag.starts_with("portal") || SOURCE_2009_TAGS.contains(&tag.as_str())
    {
        return GameEngine::Source2009;
    }
    if !KNOWN_SOURCE_TAGS.contains(&tag.as_str()) {
        warn!("Unknown game tag '{}', assuming Source engine", game_tag);
    }
    GameEngine::Source
}

/// Decrypted connection material for one server. Produced on demand by the
/// credentials repository and never cached across failures.
#[derive(Debug, Clone)]
pub struct RconCredentials {
    pub server_id: i64,
    pub address: String,
    pub port: u16,
    pub rcon_password: String,
    pub game_engine: GameEngine,
}

impl RconCredentials {
    pub fn validate(&self) -> rcon::Result<()> {
        if self.address.trim().is_empty() {
            return Err(rcon::Error::InvalidCredentials(format!(
                "server {} has no address",
                self.server_id
            )));
        }
        if self.port == 0 {
            return Err(rcon::Error::InvalidCredentials(format!(
                "server {} has no port",
                self.server_id
            )));
        }
        if self.rcon_password.is_empty() {
            return Err(rcon::Error::InvalidCredentials(format!(
                "server {} has no rcon password",
                self.server_id
            )));
        }
        Ok(())
    }
}

/// Server record as the server repository reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub server_id: i64,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub game_tag: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub has_rcon: bool,
}

fn default_true() -> bool {
    true
}

/// One player line out of a `status` reply.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusPlayer {
    pub game_user_id: i64,
    pub name: String,
    pub unique_id: String,
    pub time: String,
    pub ping: u32,
    pub loss: u32,
    pub state: String,
    pub is_bot: bool,
}

/// Typed view over one engine `status` reply.
#[derive(Debug, Clone)]
pub struct ServerStatus {
    pub map: String,
    pub players: u32,
    pub max_players: u32,
    pub uptime_seconds: u64,
    pub fps: f64,
    pub hostname: Option<String>,
    pub version: Option<String>,
    pub cpu: Option<f64>,
    pub player_list: Option<Vec<StatusPlayer>>,
    pub real_player_count: Option<u32>,
    pub bot_count: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

impl ServerStatus {
    /// Player count preferring the bot-excluded figure when known.
    pub fn active_players(&self) -> u32 {
        self.real_player_count.unwrap_or(self.players)
    }
}

/// One load-history row written per successful status capture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerLoadRow {
    pub server_id: i64,
    pub timestamp: i64,
    pub active_players: u32,
    pub min_players: u32,
    pub max_players: u32,
    pub map: String,
    pub uptime: String,
    pub fps: String,
}

impl ServerLoadRow {
    pub fn from_status(server_id: i64, status: &ServerStatus) -> Self {
        Self {
            server_id,
            timestamp: status.timestamp.timestamp(),
            active_players: status.active_players(),
            min_players: status.active_players(),
            max_players: status.max_players,
            map: status.map.clone(),
            uptime: status.uptime_seconds.to_string(),
            fps: status.fps.to_string(),
        }
    }
}

/// Live in-memory record of a player currently present on a server.
#[derive(Debug, Clone)]
pub struct PlayerSession {
    pub server_id: i64,
    pub game_user_id: i64,
    pub database_player_id: i64,
    pub steam_id: String,
    pub player_name: String,
    pub is_bot: bool,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}
