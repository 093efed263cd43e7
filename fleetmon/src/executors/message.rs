//! Broadcast announcements. The wire command is
//! `<type> <color> <message>` with the HLstatsX display channel as the type;
//! per-server failures are logged and absorbed so one dead server does not
//! fail the whole schedule fire.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::models::{CommandSpec, MessageType, ScheduledCommand};
use crate::rcon_service::RconService;

use super::{substitute_placeholders, CommandExecutor, ExecutionContext, ExecutionOutcome};

const MAX_MESSAGE_LENGTH: usize = 200;

pub struct ServerMessageExecutor {
    rcon: Arc<RconService>,
}

impl ServerMessageExecutor {
    pub fn new(rcon: Arc<RconService>) -> Self {
        Self { rcon }
    }

    pub fn build_command(message_type: MessageType, color: &str, message: &str) -> String {
        format!("{} {} {}", message_type, color, message)
    }
}

#[async_trait]
impl CommandExecutor for ServerMessageExecutor {
    async fn execute(&self, context: &ExecutionContext) -> anyhow::Result<ExecutionOutcome> {
        let CommandSpec::ServerMessage {
            message_type,
            color,
            message,
        } = &context.schedule.command
        else {
            anyhow::bail!(
                "schedule {} is not a server-message command",
                context.schedule.id
            );
        };

        let server = &context.server;
        if !self.rcon.is_connected(server.server_id).await {
            debug!(
                "Server {} not connected, message '{}' skipped",
                server.server_id, context.schedule.name
            );
            return Ok(ExecutionOutcome {
                servers_processed: 1,
                commands_sent: 0,
            });
        }

        let message = substitute_placeholders(message, server);
        let command = Self::build_command(*message_type, color, &message);

        match self.rcon.execute_command(server.server_id, &command).await {
            Ok(_) => Ok(ExecutionOutcome {
                servers_processed: 1,
                commands_sent: 1,
            }),
            Err(e) => {
                warn!(
                    "Sending '{}' to server {} failed: {}",
                    context.schedule.name, server.server_id, e
                );
                Ok(ExecutionOutcome {
                    servers_processed: 1,
                    commands_sent: 0,
                })
            }
        }
    }

    fn validate(&self, schedule: &ScheduledCommand) -> bool {
        match &schedule.command {
            CommandSpec::ServerMessage { message, .. } => {
                let message = message.trim();
                if message.is_empty() {
                    warn!("Schedule {} has an empty message", schedule.id);
                    return false;
                }
                if message.len() > MAX_MESSAGE_LENGTH {
                    warn!(
                        "Schedule {} message exceeds {} characters",
                        schedule.id, MAX_MESSAGE_LENGTH
                    );
                    return false;
                }
                true
            }
            _ => false,
        }
    }

    fn executor_type(&self) -> &'static str {
        "server-message"
    }
}

#[cfg(test)]
mod tests {
    use crate::models::ServerInfo;

    use super::*;

    fn schedule(command: CommandSpec) -> ScheduledCommand {
        ScheduledCommand {
            id: "announce".into(),
            name: "Announce".into(),
            cron_expression: "0 * * * *".into(),
            command,
            enabled: true,
            server_filter: None,
            max_retries: None,
            retry_on_failure: None,
            timeout_ms: None,
            metadata: None,
        }
    }

    fn message_schedule(message: &str) -> ScheduledCommand {
        schedule(CommandSpec::ServerMessage {
            message_type: MessageType::CenterSay,
            color: "00FF00".into(),
            message: message.into(),
        })
    }

    fn executor() -> ServerMessageExecutor {
        use rcon::Timeouts;

        use crate::repositories::CredentialsRepo;
        use crate::models::{RconCredentials, ServerStatus};

        struct NoCredentials;

        #[async_trait]
        impl CredentialsRepo for NoCredentials {
            async fn get_rcon_credentials(
                &self,
                _server_id: i64,
            ) -> anyhow::Result<Option<RconCredentials>> {
                Ok(None)
            }

            async fn update_server_status(
                &self,
                _server_id: i64,
                _status: &ServerStatus,
            ) -> anyhow::Result<()> {
                Ok(())
            }
        }

        ServerMessageExecutor::new(Arc::new(RconService::new(
            Arc::new(NoCredentials),
            None,
            Timeouts::default(),
            1,
        )))
    }

    #[test]
    fn command_string_is_type_color_message() {
        assert_eq!(
            ServerMessageExecutor::build_command(MessageType::TopSay, "FF0000", "hello"),
            "hlx_tsay FF0000 hello"
        );
        assert_eq!(
            ServerMessageExecutor::build_command(MessageType::TypeHud, "00FF00", "hi"),
            "hlx_typehud 00FF00 hi"
        );
    }

    #[test]
    fn validation_rejects_bad_messages() {
        let executor = executor();
        assert!(executor.validate(&message_schedule("all good")));
        assert!(!executor.validate(&message_schedule("")));
        assert!(!executor.validate(&message_schedule("   ")));
        assert!(!executor.validate(&message_schedule(&"x".repeat(201))));
        assert!(executor.validate(&message_schedule(&"x".repeat(200))));
        assert!(!executor.validate(&schedule(CommandSpec::ServerMonitoring)));
    }

    #[tokio::test]
    async fn disconnected_server_counts_processed_but_not_sent() {
        let executor = executor();
        let context = ExecutionContext {
            server: ServerInfo {
                server_id: 1,
                name: "Test".into(),
                address: "127.0.0.1".into(),
                port: 27015,
                game_tag: "csgo".into(),
                tags: vec![],
                active: true,
                has_rcon: true,
            },
            schedule: message_schedule("restarting soon on {server.name}"),
        };

        let outcome = executor.execute(&context).await.unwrap();
        assert_eq!(outcome.servers_processed, 1);
        assert_eq!(outcome.commands_sent, 0);
    }
}
