//! The status probe. For each schedulable server: ensure a connection,
//! run `status`, parse it, persist a load row, and reconcile the session
//! registry with the reported player list. Failures feed the retry
//! controller instead of escaping the schedule callback.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::models::{
    classify_game_engine, CommandSpec, ScheduledCommand, ServerInfo, ServerLoadRow, ServerStatus,
};
use crate::rcon_service::RconService;
use crate::repositories::{CredentialsRepo, ServerRepo, ServerStatusEnricher};
use crate::retry::RetryController;
use crate::sessions::{NewSession, SessionRegistry};
use crate::status_parser::parse_status;

use super::{CommandExecutor, ExecutionContext, ExecutionOutcome};

pub struct ServerMonitoringExecutor {
    rcon: Arc<RconService>,
    retry: Arc<RetryController>,
    servers: Arc<dyn ServerRepo>,
    credentials: Arc<dyn CredentialsRepo>,
    sessions: Arc<SessionRegistry>,
    enricher: Option<Arc<dyn ServerStatusEnricher>>,
}

impl ServerMonitoringExecutor {
    pub fn new(
        rcon: Arc<RconService>,
        retry: Arc<RetryController>,
        servers: Arc<dyn ServerRepo>,
        credentials: Arc<dyn CredentialsRepo>,
        sessions: Arc<SessionRegistry>,
        enricher: Option<Arc<dyn ServerStatusEnricher>>,
    ) -> Self {
        Self {
            rcon,
            retry,
            servers,
            credentials,
            sessions,
            enricher,
        }
    }

    /// Event-bridge entry point: connect as soon as a server authenticates
    /// instead of waiting for the next cron fire. Sessions are only synced
    /// when this call actually established the connection.
    pub async fn connect_to_server_immediately(&self, server_id: i64) -> Result<()> {
        if !self.servers.has_rcon_credentials(server_id).await? {
            debug!("Server {} has no rcon credentials, skipping", server_id);
            return Ok(());
        }
        if !self.retry.should_retry(server_id) {
            debug!("Server {} is backing off, skipping immediate connect", server_id);
            return Ok(());
        }

        let newly_connected = match self.rcon.ensure_connected(server_id).await {
            Ok(newly) => newly,
            Err(e) => {
                self.record_failure(server_id, None, &e.to_string()).await;
                return Err(e.into());
            }
        };
        if !newly_connected {
            return Ok(());
        }

        let server = self
            .servers
            .find_by_id(server_id)
            .await?
            .with_context(|| format!("server {} vanished from the repository", server_id))?;
        match self.capture(&server).await {
            Ok(status) => {
                self.retry.reset_failure_state(server_id);
                info!(
                    "Server {} connected immediately, {} players on {}",
                    server_id,
                    status.active_players(),
                    status.map
                );
                Ok(())
            }
            Err(e) => {
                self.record_failure(server_id, Some(&server), &e.to_string())
                    .await;
                Err(e)
            }
        }
    }

    /// One full status capture against a connected server.
    async fn capture(&self, server: &ServerInfo) -> Result<ServerStatus> {
        let raw = self.rcon.execute_command(server.server_id, "status").await?;
        let status = parse_status(&raw);

        self.credentials
            .update_server_status(server.server_id, &status)
            .await
            .context("status write-through failed")?;
        self.servers
            .record_server_load(&ServerLoadRow::from_status(server.server_id, &status))
            .await
            .context("load history write failed")?;

        let (synced, removed) = self.sync_sessions(server.server_id, &status);
        debug!(
            "Server {} on {}: {}/{} players, {} sessions synced, {} removed",
            server.server_id,
            status.map,
            status.active_players(),
            status.max_players,
            synced,
            removed
        );

        if let Some(enricher) = &self.enricher {
            if let Err(e) = enricher.enrich_server_status(server.server_id).await {
                warn!("Enrichment for server {} failed: {}", server.server_id, e);
            }
        }

        Ok(status)
    }

    /// Reconciles the registry with the parsed player list: listed players
    /// are created or refreshed, departed ones are dropped. A status with
    /// no player lines only wipes sessions when the server reports empty.
    fn sync_sessions(&self, server_id: i64, status: &ServerStatus) -> (usize, usize) {
        let Some(player_list) = &status.player_list else {
            if status.players == 0 {
                let removed = self.sessions.delete_server_sessions(server_id);
                return (0, removed);
            }
            return (0, 0);
        };

        let mut present: HashSet<i64> = HashSet::with_capacity(player_list.len());
        for player in player_list {
            present.insert(player.game_user_id);
            self.sessions.create(NewSession {
                server_id,
                game_user_id: player.game_user_id,
                // identity resolution lives outside the daemon; the game
                // user id is a stable per-server stand-in
                database_player_id: player.game_user_id,
                steam_id: player.unique_id.clone(),
                player_name: player.name.clone(),
                is_bot: player.is_bot,
            });
        }

        let mut removed = 0;
        for session in self.sessions.get_server_sessions(server_id) {
            if !present.contains(&session.game_user_id)
                && self.sessions.delete(server_id, session.game_user_id)
            {
                removed += 1;
            }
        }

        (player_list.len(), removed)
    }

    async fn record_failure(&self, server_id: i64, server: Option<&ServerInfo>, error: &str) {
        let state = self.retry.record_failure(server_id);
        let engine = server
            .map(|s| classify_game_engine(&s.game_tag).to_string())
            .unwrap_or_else(|| "unknown engine".to_owned());
        warn!(
            "Monitoring server {} ({}) failed ({} consecutive): {}; next retry {}",
            server_id,
            engine,
            state.consecutive_failures,
            error,
            state
                .next_retry_at
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "unscheduled".to_owned())
        );
        // a broken transport must not linger; disconnect errors are noise
        self.rcon.disconnect(server_id).await;
    }
}

#[async_trait]
impl CommandExecutor for ServerMonitoringExecutor {
    async fn execute(&self, context: &ExecutionContext) -> Result<ExecutionOutcome> {
        let server = &context.server;
        if !self.retry.should_retry(server.server_id) {
            debug!(
                "Server {} is backing off, monitoring skipped",
                server.server_id
            );
            return Ok(ExecutionOutcome::skipped());
        }

        if let Err(e) = self.rcon.ensure_connected(server.server_id).await {
            self.record_failure(server.server_id, Some(server), &e.to_string())
                .await;
            return Err(e.into());
        }

        match self.capture(server).await {
            Ok(_) => {
                self.retry.reset_failure_state(server.server_id);
                Ok(ExecutionOutcome {
                    servers_processed: 1,
                    commands_sent: 1,
                })
            }
            Err(e) => {
                self.record_failure(server.server_id, Some(server), &e.to_string())
                    .await;
                Err(e)
            }
        }
    }

    fn validate(&self, schedule: &ScheduledCommand) -> bool {
        matches!(schedule.command, CommandSpec::ServerMonitoring)
    }

    fn executor_type(&self) -> &'static str {
        "server-monitoring"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use rcon::Timeouts;

    use crate::models::{GameEngine, RconCredentials};
    use crate::rcon_service::RconTransport;
    use crate::retry::RetryPolicy;

    use super::*;

    const STATUS_BODY: &str = concat!(
        "hostname:  Test Server\n",
        "map     :  de_dust2 at: 0 x, 0 y, 0 z\n",
        "players :  2 active (16 max)\n",
        "fps: 100.0\n",
        "#  1 \"Alice\" STEAM_0:0:1 1:00 20 0 active\n",
        "#  2 \"Eve\" STEAM_0:0:2 2:00 30 0 active\n",
    );

    struct ScriptedTransport {
        responses: StdMutex<Vec<rcon::Result<String>>>,
        connected: bool,
    }

    impl ScriptedTransport {
        fn replying(body: &str) -> Box<Self> {
            Box::new(Self {
                responses: StdMutex::new(vec![Ok(body.to_owned())]),
                connected: true,
            })
        }

        fn failing() -> Box<Self> {
            Box::new(Self {
                responses: StdMutex::new(vec![Err(rcon::Error::Timeout(
                    Duration::from_millis(1),
                ))]),
                connected: true,
            })
        }
    }

    #[async_trait]
    impl RconTransport for ScriptedTransport {
        async fn execute(&mut self, _command: &str) -> rcon::Result<String> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(String::new())
            } else {
                responses.remove(0)
            }
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        async fn disconnect(&mut self) {
            self.connected = false;
        }
    }

    struct TestStore {
        server: ServerInfo,
        has_credentials: bool,
        load_rows: AtomicUsize,
        status_writes: AtomicUsize,
    }

    impl TestStore {
        fn new(server_id: i64) -> Self {
            Self {
                server: ServerInfo {
                    server_id,
                    name: "Test".into(),
                    address: "127.0.0.1".into(),
                    port: 27015,
                    game_tag: "cstrike".into(),
                    tags: vec![],
                    active: true,
                    has_rcon: true,
                },
                has_credentials: true,
                load_rows: AtomicUsize::new(0),
                status_writes: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ServerRepo for TestStore {
        async fn find_active_servers_with_rcon(&self) -> Result<Vec<ServerInfo>> {
            Ok(vec![self.server.clone()])
        }

        async fn find_by_id(&self, server_id: i64) -> Result<Option<ServerInfo>> {
            Ok((server_id == self.server.server_id).then(|| self.server.clone()))
        }

        async fn has_rcon_credentials(&self, _server_id: i64) -> Result<bool> {
            Ok(self.has_credentials)
        }

        async fn record_server_load(&self, _row: &ServerLoadRow) -> Result<()> {
            self.load_rows.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl CredentialsRepo for TestStore {
        async fn get_rcon_credentials(&self, server_id: i64) -> Result<Option<RconCredentials>> {
            Ok(self.has_credentials.then(|| RconCredentials {
                server_id,
                address: self.server.address.clone(),
                port: self.server.port,
                rcon_password: "pw".into(),
                game_engine: GameEngine::GoldSrc,
            }))
        }

        async fn update_server_status(
            &self,
            _server_id: i64,
            _status: &ServerStatus,
        ) -> Result<()> {
            self.status_writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        executor: ServerMonitoringExecutor,
        rcon: Arc<RconService>,
        retry: Arc<RetryController>,
        sessions: Arc<SessionRegistry>,
        store: Arc<TestStore>,
    }

    async fn fixture(server_id: i64, transport: Option<Box<dyn RconTransport>>) -> Fixture {
        let store = Arc::new(TestStore::new(server_id));
        let rcon = Arc::new(RconService::new(
            store.clone(),
            None,
            Timeouts::default(),
            1,
        ));
        if let Some(transport) = transport {
            rcon.insert_transport_for_test(server_id, transport, GameEngine::GoldSrc)
                .await;
        }
        let retry = Arc::new(RetryController::new(RetryPolicy::default()));
        let sessions = Arc::new(SessionRegistry::new());
        let executor = ServerMonitoringExecutor::new(
            rcon.clone(),
            retry.clone(),
            store.clone(),
            store.clone(),
            sessions.clone(),
            None,
        );
        Fixture {
            executor,
            rcon,
            retry,
            sessions,
            store,
        }
    }

    fn context(server: &ServerInfo) -> ExecutionContext {
        ExecutionContext {
            server: server.clone(),
            schedule: ScheduledCommand {
                id: "monitor".into(),
                name: "Monitor".into(),
                cron_expression: "*/30 * * * * *".into(),
                command: CommandSpec::ServerMonitoring,
                enabled: true,
                server_filter: None,
                max_retries: None,
                retry_on_failure: None,
                timeout_ms: None,
                metadata: None,
            },
        }
    }

    #[tokio::test]
    async fn successful_capture_syncs_sessions_and_resets_failures() {
        let fixture = fixture(1, Some(ScriptedTransport::replying(STATUS_BODY))).await;
        fixture.retry.record_failure(1);
        // failure gate would normally hold it back; force the window open
        fixture.retry.reset_failure_state(1);

        let outcome = fixture
            .executor
            .execute(&context(&fixture.store.server))
            .await
            .unwrap();
        assert_eq!(outcome.servers_processed, 1);
        assert_eq!(outcome.commands_sent, 1);

        assert_eq!(fixture.sessions.server_session_count(1), 2);
        assert!(fixture.sessions.get_by_steam_id(1, "STEAM_0:0:1").is_some());
        assert_eq!(fixture.store.load_rows.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.store.status_writes.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.retry.get_failure_state(1).consecutive_failures, 0);
    }

    #[tokio::test]
    async fn departed_players_are_dropped_on_the_next_capture() {
        let fixture = fixture(1, Some(ScriptedTransport::replying(STATUS_BODY))).await;
        // a player who has since left
        fixture.sessions.create(NewSession {
            server_id: 1,
            game_user_id: 99,
            database_player_id: 99,
            steam_id: "STEAM_0:0:99".into(),
            player_name: "Gone".into(),
            is_bot: false,
        });

        fixture
            .executor
            .execute(&context(&fixture.store.server))
            .await
            .unwrap();

        assert_eq!(fixture.sessions.server_session_count(1), 2);
        assert!(fixture.sessions.get_by_game_user_id(1, 99).is_none());
    }

    #[tokio::test]
    async fn failed_status_records_a_failure_and_disconnects() {
        let fixture = fixture(1, Some(ScriptedTransport::failing())).await;

        let result = fixture
            .executor
            .execute(&context(&fixture.store.server))
            .await;
        assert!(result.is_err());

        let state = fixture.retry.get_failure_state(1);
        assert_eq!(state.consecutive_failures, 1);
        assert!(state.next_retry_at.is_some());
        assert!(!fixture.rcon.is_connected(1).await);
        assert_eq!(fixture.store.load_rows.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn backing_off_server_is_skipped() {
        let fixture = fixture(1, Some(ScriptedTransport::replying(STATUS_BODY))).await;
        fixture.retry.record_failure(1);

        let outcome = fixture
            .executor
            .execute(&context(&fixture.store.server))
            .await
            .unwrap();
        assert_eq!(outcome, ExecutionOutcome::skipped());
        // nothing touched the transport or the stores
        assert_eq!(fixture.store.load_rows.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn immediate_connect_skips_servers_without_credentials() {
        let store = Arc::new(TestStore {
            has_credentials: false,
            ..TestStore::new(2)
        });
        let rcon = Arc::new(RconService::new(
            store.clone(),
            None,
            Timeouts::default(),
            1,
        ));
        let executor = ServerMonitoringExecutor::new(
            rcon,
            Arc::new(RetryController::new(RetryPolicy::default())),
            store.clone(),
            store.clone(),
            Arc::new(SessionRegistry::new()),
            None,
        );
        executor.connect_to_server_immediately(2).await.unwrap();
        assert_eq!(store.load_rows.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn immediate_connect_on_live_connection_does_not_resync() {
        let fixture = fixture(1, Some(ScriptedTransport::replying(STATUS_BODY))).await;

        fixture.executor.connect_to_server_immediately(1).await.unwrap();

        // connection already existed, so no capture ran
        assert_eq!(fixture.sessions.server_session_count(1), 0);
        assert_eq!(fixture.store.load_rows.load(Ordering::SeqCst), 0);
    }
}
