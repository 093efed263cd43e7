use serde::{Deserialize, Serialize};

use super::ScheduledCommand;

// WARNING: If you add non-Optional values here, you must give them defaults or
//          you will break settings loading

/// RCON engine tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RconConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Seconds between periodic status captures.
    #[serde(default = "default_status_interval")]
    pub status_interval: u64,
    /// Per-command deadline in milliseconds.
    #[serde(default = "default_command_timeout_ms")]
    pub timeout: u64,
    /// Connect/auth handshake deadline in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_connections_per_server")]
    pub max_connections_per_server: u32,
    #[serde(default)]
    pub max_consecutive_failures: Option<u32>,
    #[serde(default)]
    pub backoff_multiplier: Option<u32>,
    #[serde(default)]
    pub max_backoff_minutes: Option<i64>,
    #[serde(default)]
    pub dormant_retry_minutes: Option<i64>,
}

impl Default for RconConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty RconConfig must deserialize")
    }
}

/// Scheduler tunables plus the administrator-defined schedule list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_execution_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default)]
    pub default_retry_on_failure: bool,
    #[serde(default = "default_schedule_retries")]
    pub default_max_retries: u32,
    #[serde(default = "default_history_retention_hours")]
    pub history_retention_hours: u64,
    #[serde(default = "default_max_concurrent_per_server")]
    pub max_concurrent_per_server: usize,
    #[serde(default)]
    pub schedules: Vec<ScheduledCommand>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty ScheduleConfig must deserialize")
    }
}

/// Top-level settings document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub rcon: RconConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default = "default_servers_file")]
    pub servers_file: String,
    #[serde(default = "default_credentials_file")]
    pub credentials_file: String,
    #[serde(default = "default_load_history_file")]
    pub load_history_file: String,
}

impl Default for Settings {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty Settings must deserialize")
    }
}

pub fn default_enabled() -> bool {
    true
}

fn default_status_interval() -> u64 {
    30
}

fn default_command_timeout_ms() -> u64 {
    3000
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_connections_per_server() -> u32 {
    1
}

fn default_execution_timeout_ms() -> u64 {
    30_000
}

fn default_schedule_retries() -> u32 {
    2
}

fn default_history_retention_hours() -> u64 {
    24
}

fn default_max_concurrent_per_server() -> usize {
    3
}

fn default_servers_file() -> String {
    "servers.json".into()
}

fn default_credentials_file() -> String {
    "credentials.json".into()
}

fn default_load_history_file() -> String {
    "server_load.jsonl".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_tunables() {
        let rcon = RconConfig::default();
        assert!(rcon.enabled);
        assert_eq!(rcon.status_interval, 30);
        assert_eq!(rcon.timeout, 3000);
        assert_eq!(rcon.connect_timeout, 5000);
        assert_eq!(rcon.max_retries, 3);
        assert_eq!(rcon.max_connections_per_server, 1);

        let schedule = ScheduleConfig::default();
        assert!(schedule.enabled);
        assert_eq!(schedule.default_timeout_ms, 30_000);
        assert!(!schedule.default_retry_on_failure);
        assert_eq!(schedule.max_concurrent_per_server, 3);
        assert!(schedule.schedules.is_empty());
    }

    #[test]
    fn settings_parse_with_partial_document() {
        let settings: Settings = serde_json::from_str(
            r#"{
                "rcon": { "status_interval": 10 },
                "schedule": { "max_concurrent_per_server": 1 }
            }"#,
        )
        .unwrap();
        assert_eq!(settings.rcon.status_interval, 10);
        assert_eq!(settings.rcon.timeout, 3000);
        assert_eq!(settings.schedule.max_concurrent_per_server, 1);
        assert_eq!(settings.servers_file, "servers.json");
        assert_eq!(settings.credentials_file, "credentials.json");
    }
}
