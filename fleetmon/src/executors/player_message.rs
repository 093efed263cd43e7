//! Private per-player messaging. The concrete command comes out of the
//! resolver (server config, then mod default, then global default), and its
//! inferred capabilities drive batching and id prefixing: `amx_*` mods want
//! `#`-prefixed user ids, bulk variants accept several targets per line.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::models::{CommandSpec, ScheduledCommand};
use crate::rcon_service::RconService;
use crate::resolver::{CommandCapabilities, CommandResolver};
use crate::sessions::SessionRegistry;

use super::{substitute_placeholders, CommandExecutor, ExecutionContext, ExecutionOutcome};

const MAX_MESSAGE_LENGTH: usize = 200;
const PLAYER_MESSAGE_KIND: &str = "psay";

pub struct PlayerMessageExecutor {
    rcon: Arc<RconService>,
    resolver: Arc<CommandResolver>,
    sessions: Arc<SessionRegistry>,
}

impl PlayerMessageExecutor {
    pub fn new(
        rcon: Arc<RconService>,
        resolver: Arc<CommandResolver>,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            rcon,
            resolver,
            sessions,
        }
    }
}

/// Expands one logical message into wire commands honoring the command's
/// batch size and id prefix requirements.
pub fn build_commands(
    command: &str,
    capabilities: CommandCapabilities,
    player_ids: &[i64],
    message: &str,
) -> Vec<String> {
    let format_id = |id: &i64| {
        if capabilities.requires_hash_prefix {
            format!("#{}", id)
        } else {
            id.to_string()
        }
    };

    if capabilities.supports_batch {
        player_ids
            .chunks(capabilities.max_batch_size.max(1) as usize)
            .map(|chunk| {
                let ids: Vec<String> = chunk.iter().map(format_id).collect();
                format!("{} {} {}", command, ids.join(" "), message)
            })
            .collect()
    } else {
        player_ids
            .iter()
            .map(|id| format!("{} {} {}", command, format_id(id), message))
            .collect()
    }
}

#[async_trait]
impl CommandExecutor for PlayerMessageExecutor {
    async fn execute(&self, context: &ExecutionContext) -> anyhow::Result<ExecutionOutcome> {
        let CommandSpec::PlayerMessage { message } = &context.schedule.command else {
            anyhow::bail!(
                "schedule {} is not a player-message command",
                context.schedule.id
            );
        };

        let server = &context.server;
        if !self.rcon.is_connected(server.server_id).await {
            debug!(
                "Server {} not connected, player message skipped",
                server.server_id
            );
            return Ok(ExecutionOutcome {
                servers_processed: 1,
                commands_sent: 0,
            });
        }

        let player_ids: Vec<i64> = self
            .sessions
            .get_server_sessions(server.server_id)
            .into_iter()
            .filter(|s| !s.is_bot)
            .map(|s| s.game_user_id)
            .collect();
        if player_ids.is_empty() {
            return Ok(ExecutionOutcome {
                servers_processed: 1,
                commands_sent: 0,
            });
        }

        let command = self
            .resolver
            .get_command(server, PLAYER_MESSAGE_KIND)
            .await?;
        let capabilities = self
            .resolver
            .get_capabilities(server, PLAYER_MESSAGE_KIND)
            .await?;
        let message = substitute_placeholders(message, server);

        let mut sent = 0;
        for wire_command in build_commands(&command, capabilities, &player_ids, &message) {
            match self
                .rcon
                .execute_command(server.server_id, &wire_command)
                .await
            {
                Ok(_) => sent += 1,
                Err(e) => {
                    warn!(
                        "Player message to server {} failed: {}",
                        server.server_id, e
                    );
                    break;
                }
            }
        }

        Ok(ExecutionOutcome {
            servers_processed: 1,
            commands_sent: sent,
        })
    }

    fn validate(&self, schedule: &ScheduledCommand) -> bool {
        match &schedule.command {
            CommandSpec::PlayerMessage { message } => {
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
        "player-message"
    }
}

#[cfg(test)]
mod tests {
    use crate::resolver::infer_capabilities;

    use super::*;

    #[test]
    fn batched_commands_chunk_and_prefix() {
        let caps = infer_capabilities("amx_bulkpsay");
        let ids: Vec<i64> = (1..=10).collect();
        let commands = build_commands("amx_bulkpsay", caps, &ids, "server restarting");

        assert_eq!(commands.len(), 2);
        assert_eq!(
            commands[0],
            "amx_bulkpsay #1 #2 #3 #4 #5 #6 #7 #8 server restarting"
        );
        assert_eq!(commands[1], "amx_bulkpsay #9 #10 server restarting");
    }

    #[test]
    fn sourcemod_batches_without_hash() {
        let caps = infer_capabilities("hlx_sm_psay");
        let commands = build_commands("hlx_sm_psay", caps, &[4, 5], "hi");
        assert_eq!(commands, vec!["hlx_sm_psay 4 5 hi"]);
    }

    #[test]
    fn single_target_commands_fan_out() {
        let caps = infer_capabilities("amx_psay");
        let commands = build_commands("amx_psay", caps, &[4, 5], "hi");
        assert_eq!(commands, vec!["amx_psay #4 hi", "amx_psay #5 hi"]);

        let caps = infer_capabilities("say");
        let commands = build_commands("say", caps, &[4], "hi");
        assert_eq!(commands, vec!["say 4 hi"]);
    }
}
