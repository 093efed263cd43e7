//! Maps (server, logical command kind) onto the concrete command string the
//! server's mod understands, with capability inference for batching and
//! id prefixing. Lookups walk server config, then the mod default for the
//! server's game, then the process-wide default, then fall back to `say`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tracing::{debug, trace};

use crate::models::ServerInfo;
use crate::repositories::ServerConfigRepo;

const FALLBACK_COMMAND: &str = "say";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandCapabilities {
    pub supports_batch: bool,
    pub max_batch_size: u32,
    pub requires_hash_prefix: bool,
}

impl Default for CommandCapabilities {
    fn default() -> Self {
        Self {
            supports_batch: false,
            max_batch_size: 1,
            requires_hash_prefix: false,
        }
    }
}

// longest prefix first so e.g. hlx_amx_bulkpsay wins over hlx_amx_psay
const CAPABILITY_TABLE: &[(&str, CommandCapabilities)] = &[
    (
        "hlx_amx_bulkpsay",
        CommandCapabilities {
            supports_batch: true,
            max_batch_size: 8,
            requires_hash_prefix: true,
        },
    ),
    (
        "amx_bulkpsay",
        CommandCapabilities {
            supports_batch: true,
            max_batch_size: 8,
            requires_hash_prefix: true,
        },
    ),
    (
        "hlx_amx_psay",
        CommandCapabilities {
            supports_batch: false,
            max_batch_size: 1,
            requires_hash_prefix: true,
        },
    ),
    (
        "ma_hlx_psay",
        CommandCapabilities {
            supports_batch: false,
            max_batch_size: 1,
            requires_hash_prefix: false,
        },
    ),
    (
        "hlx_sm_psay",
        CommandCapabilities {
            supports_batch: true,
            max_batch_size: 32,
            requires_hash_prefix: false,
        },
    ),
    (
        "hlx_psay",
        CommandCapabilities {
            supports_batch: false,
            max_batch_size: 1,
            requires_hash_prefix: false,
        },
    ),
    (
        "amx_psay",
        CommandCapabilities {
            supports_batch: false,
            max_batch_size: 1,
            requires_hash_prefix: true,
        },
    ),
    (
        "amx_tell",
        CommandCapabilities {
            supports_batch: false,
            max_batch_size: 1,
            requires_hash_prefix: true,
        },
    ),
    (
        "amx_say",
        CommandCapabilities {
            supports_batch: false,
            max_batch_size: 1,
            requires_hash_prefix: true,
        },
    ),
    (
        "ms_psay",
        CommandCapabilities {
            supports_batch: false,
            max_batch_size: 1,
            requires_hash_prefix: false,
        },
    ),
    (
        "amx_pm",
        CommandCapabilities {
            supports_batch: false,
            max_batch_size: 1,
            requires_hash_prefix: true,
        },
    ),
];

pub fn infer_capabilities(command: &str) -> CommandCapabilities {
    let mut prefixes: Vec<&(&str, CommandCapabilities)> = CAPABILITY_TABLE.iter().collect();
    prefixes.sort_by_key(|(prefix, _)| std::cmp::Reverse(prefix.len()));
    prefixes
        .into_iter()
        .find(|(prefix, _)| command.starts_with(prefix))
        .map(|(_, caps)| *caps)
        .unwrap_or_default()
}

pub struct CommandResolver {
    config_repo: Arc<dyn ServerConfigRepo>,
    commands: Mutex<HashMap<(i64, String), String>>,
    capabilities: Mutex<HashMap<(i64, String), CommandCapabilities>>,
}

impl CommandResolver {
    pub fn new(config_repo: Arc<dyn ServerConfigRepo>) -> Self {
        Self {
            config_repo,
            commands: Mutex::new(HashMap::new()),
            capabilities: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves the concrete command for a logical kind, reading the
    /// repository at most once per (server, kind) until evicted.
    pub async fn get_command(&self, server: &ServerInfo, kind: &str) -> Result<String> {
        let key = (server.server_id, kind.to_owned());
        if let Some(command) = self
            .commands
            .lock()
            .expect("command cache poisoned")
            .get(&key)
        {
            return Ok(command.clone());
        }

        let command = self.resolve(server, kind).await?;
        let capabilities = infer_capabilities(&command);
        trace!(
            "Resolved {} for server {} to '{}' (batch {} x{})",
            kind,
            server.server_id,
            command,
            capabilities.supports_batch,
            capabilities.max_batch_size
        );

        self.commands
            .lock()
            .expect("command cache poisoned")
            .insert(key.clone(), command.clone());
        self.capabilities
            .lock()
            .expect("capability cache poisoned")
            .insert(key, capabilities);

        Ok(command)
    }

    pub async fn get_capabilities(
        &self,
        server: &ServerInfo,
        kind: &str,
    ) -> Result<CommandCapabilities> {
        let key = (server.server_id, kind.to_owned());
        if let Some(caps) = self
            .capabilities
            .lock()
            .expect("capability cache poisoned")
            .get(&key)
        {
            return Ok(*caps);
        }
        self.get_command(server, kind).await?;
        Ok(self
            .capabilities
            .lock()
            .expect("capability cache poisoned")
            .get(&key)
            .copied()
            .unwrap_or_default())
    }

    pub fn clear_cache(&self) {
        self.commands.lock().expect("command cache poisoned").clear();
        self.capabilities
            .lock()
            .expect("capability cache poisoned")
            .clear();
        debug!("Command resolver cache cleared");
    }

    pub fn clear_server_cache(&self, server_id: i64) {
        self.commands
            .lock()
            .expect("command cache poisoned")
            .retain(|(id, _), _| *id != server_id);
        self.capabilities
            .lock()
            .expect("capability cache poisoned")
            .retain(|(id, _), _| *id != server_id);
        debug!("Command resolver cache cleared for server {}", server_id);
    }

    async fn resolve(&self, server: &ServerInfo, kind: &str) -> Result<String> {
        if let Some(command) = present(
            self.config_repo
                .get_server_config(server.server_id, kind)
                .await?,
        ) {
            return Ok(command);
        }
        if let Some(command) = present(
            self.config_repo
                .get_mod_default(&server.game_tag, kind)
                .await?,
        ) {
            return Ok(command);
        }
        if let Some(command) = present(self.config_repo.get_server_config_default(kind).await?) {
            return Ok(command);
        }
        Ok(FALLBACK_COMMAND.to_owned())
    }
}

/// Blank strings at any layer count as absent.
fn present(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}
