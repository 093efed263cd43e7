//! Scheduled-command executors, dispatched by command-type string.

use async_trait::async_trait;

use crate::models::{ScheduledCommand, ServerInfo};

mod message;
mod monitoring;
mod player_message;

pub use message::ServerMessageExecutor;
pub use monitoring::ServerMonitoringExecutor;
pub use player_message::PlayerMessageExecutor;

/// One (schedule, server) unit of work as the scheduler hands it over.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub server: ServerInfo,
    pub schedule: ScheduledCommand,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub servers_processed: u32,
    pub commands_sent: u32,
}

impl ExecutionOutcome {
    pub fn skipped() -> Self {
        Self::default()
    }
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, context: &ExecutionContext) -> anyhow::Result<ExecutionOutcome>;

    /// Registration-time sanity check; rejected schedules are skipped with
    /// a warning instead of crashing the daemon.
    fn validate(&self, schedule: &ScheduledCommand) -> bool;

    fn executor_type(&self) -> &'static str;
}

/// Replaces the `{server.name}` and `{server.serverId}` placeholders.
pub fn substitute_placeholders(template: &str, server: &ServerInfo) -> String {
    template
        .replace("{server.name}", &server.name)
        .replace("{server.serverId}", &server.server_id.to_string())
}
