use std::collections::HashSet;
use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ServerInfo;

/// Announcement channels understood by the HLstatsX family of server mods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "hlx_csay")]
    CenterSay,
    #[serde(rename = "hlx_tsay")]
    TopSay,
    #[serde(rename = "hlx_typehud")]
    TypeHud,
}

impl Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageType::CenterSay => write!(f, "hlx_csay"),
            MessageType::TopSay => write!(f, "hlx_tsay"),
            MessageType::TypeHud => write!(f, "hlx_typehud"),
        }
    }
}

pub fn default_message_color() -> String {
    "00FF00".into()
}

/// What a schedule runs, dispatched by type string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CommandSpec {
    ServerMessage {
        message_type: MessageType,
        #[serde(default = "default_message_color")]
        color: String,
        message: String,
    },
    PlayerMessage {
        message: String,
    },
    ServerMonitoring,
}

impl CommandSpec {
    pub fn type_name(&self) -> &'static str {
        match self {
            CommandSpec::ServerMessage { .. } => "server-message",
            CommandSpec::PlayerMessage { .. } => "player-message",
            CommandSpec::ServerMonitoring => "server-monitoring",
        }
    }
}

// WARNING: If you add non-Optional values here, you must give them defaults or
//          you will break settings loading
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledCommand {
    pub id: String,
    pub name: String,
    pub cron_expression: String,
    pub command: CommandSpec,
    #[serde(default = "super::default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub server_filter: Option<ServerFilter>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub retry_on_failure: Option<bool>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Narrowing of which servers a schedule runs on. Absent filter matches all;
/// the whitelist applies before the blacklist.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerFilter {
    #[serde(default)]
    pub server_ids: Option<HashSet<i64>>,
    #[serde(default)]
    pub exclude_server_ids: Option<HashSet<i64>>,
    #[serde(default)]
    pub min_players: Option<u32>,
    #[serde(default)]
    pub max_players: Option<u32>,
    #[serde(default)]
    pub game_types: Option<Vec<String>>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

impl ServerFilter {
    pub fn matches(&self, server: &ServerInfo, current_players: u32) -> bool {
        if let Some(ids) = &self.server_ids {
            if !ids.contains(&server.server_id) {
                return false;
            }
        }
        if let Some(excluded) = &self.exclude_server_ids {
            if excluded.contains(&server.server_id) {
                return false;
            }
        }
        if let Some(min) = self.min_players {
            if current_players < min {
                return false;
            }
        }
        if let Some(max) = self.max_players {
            if current_players > max {
                return false;
            }
        }
        if let Some(game_types) = &self.game_types {
            if !game_types
                .iter()
                .any(|g| g.eq_ignore_ascii_case(&server.game_tag))
            {
                return false;
            }
        }
        if let Some(tags) = &self.tags {
            if !tags
                .iter()
                .any(|t| server.tags.iter().any(|s| s.eq_ignore_ascii_case(t)))
            {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Failed,
}

/// Outcome of one (schedule, server) execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleExecutionResult {
    pub execution_id: String,
    pub schedule_id: String,
    pub server_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: ExecutionStatus,
    pub servers_processed: u32,
    pub commands_sent: u32,
    #[serde(default)]
    pub errors: Option<Vec<String>>,
}

/// Aggregate counters kept per registered schedule.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScheduleStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub last_execution_start: Option<DateTime<Utc>>,
    pub last_execution_end: Option<DateTime<Utc>>,
    pub last_execution_duration_ms: Option<u64>,
}
