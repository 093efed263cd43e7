//! Connection manager and per-server command serializer.
//!
//! Each connected server is owned by one spawned worker task holding the
//! protocol instance; callers submit `(command, reply)` pairs over a channel
//! and block on the reply. RCON for GoldSource is half-duplex over UDP, so
//! commands for one server must never overlap; the single-consumer worker
//! enforces that for both protocols. A failed command is returned to exactly
//! its submitter and the worker continues with the next request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::future::join_all;
use rcon::{Error, GoldSrcConnection, SourceConnection, Timeouts};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, trace, warn};

use crate::events::{EventBus, ServerEvent};
use crate::models::{GameEngine, RconCredentials};
use crate::repositories::CredentialsRepo;

const CONNECT_BACKOFF_BASE_MS: u64 = 1000;
const CONNECT_BACKOFF_CAP_MS: u64 = 5000;

/// What the command serializer drives. Both engine clients implement this;
/// tests substitute scripted transports.
#[async_trait]
pub trait RconTransport: Send {
    async fn execute(&mut self, command: &str) -> rcon::Result<String>;
    fn is_connected(&self) -> bool;
    async fn disconnect(&mut self);
}

#[async_trait]
impl RconTransport for SourceConnection {
    async fn execute(&mut self, command: &str) -> rcon::Result<String> {
        SourceConnection::execute(self, command).await
    }

    fn is_connected(&self) -> bool {
        SourceConnection::is_connected(self)
    }

    async fn disconnect(&mut self) {
        SourceConnection::disconnect(self).await;
    }
}

#[async_trait]
impl RconTransport for GoldSrcConnection {
    async fn execute(&mut self, command: &str) -> rcon::Result<String> {
        GoldSrcConnection::execute(self, command).await
    }

    fn is_connected(&self) -> bool {
        GoldSrcConnection::is_connected(self)
    }

    async fn disconnect(&mut self) {
        GoldSrcConnection::disconnect(self).await;
    }
}

struct CommandRequest {
    command: String,
    reply: oneshot::Sender<rcon::Result<String>>,
}

struct Connection {
    sender: mpsc::UnboundedSender<CommandRequest>,
    connected: Arc<AtomicBool>,
    last_activity: Arc<AtomicI64>,
    engine: GameEngine,
    connection_attempts: u32,
    worker: JoinHandle<()>,
}

/// Read-only view of one live connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub server_id: i64,
    pub engine: GameEngine,
    pub is_connected: bool,
    pub last_activity: DateTime<Utc>,
    pub connection_attempts: u32,
}

pub struct RconService {
    credentials_repo: Arc<dyn CredentialsRepo>,
    events: Option<EventBus>,
    connections: Mutex<HashMap<i64, Connection>>,
    // serializes concurrent connect attempts per server without blocking
    // command traffic for other servers
    connect_locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
    timeouts: Timeouts,
    max_retries: u32,
}

impl RconService {
    pub fn new(
        credentials_repo: Arc<dyn CredentialsRepo>,
        events: Option<EventBus>,
        timeouts: Timeouts,
        max_retries: u32,
    ) -> Self {
        Self {
            credentials_repo,
            events,
            connections: Mutex::new(HashMap::new()),
            connect_locks: Mutex::new(HashMap::new()),
            timeouts,
            max_retries: max_retries.max(1),
        }
    }

    /// Ensures an authenticated connection exists for the server. Returns
    /// true when this call established it, false when one was already live.
    pub async fn ensure_connected(&self, server_id: i64) -> rcon::Result<bool> {
        let connect_lock = {
            let mut locks = self.connect_locks.lock().await;
            locks.entry(server_id).or_default().clone()
        };
        let _guard = connect_lock.lock().await;

        if self.is_connected(server_id).await {
            return Ok(false);
        }
        // a previous worker may still linger in a failed state
        self.drop_connection(server_id).await;

        let credentials = self
            .credentials_repo
            .get_rcon_credentials(server_id)
            .await
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?
            .ok_or_else(|| {
                Error::InvalidCredentials(format!("no rcon credentials for server {}", server_id))
            })?;
        credentials.validate()?;

        let (transport, attempts) = self.establish(&credentials).await?;
        let engine = credentials.game_engine;

        let connection = spawn_worker(server_id, transport, engine, attempts);
        self.connections.lock().await.insert(server_id, connection);
        debug!(
            "Server {} connected over {} after {} attempt(s)",
            server_id, engine, attempts
        );

        if let Some(events) = &self.events {
            events.publish(ServerEvent::Authenticated { server_id });
        }

        Ok(true)
    }

    /// Submits a command into the server's FIFO queue and awaits the reply.
    pub async fn execute_command(&self, server_id: i64, command: &str) -> rcon::Result<String> {
        let sender = {
            let connections = self.connections.lock().await;
            let Some(connection) = connections.get(&server_id) else {
                return Err(Error::NotConnected);
            };
            if !connection.connected.load(Ordering::SeqCst) {
                return Err(Error::NotConnected);
            }
            connection.sender.clone()
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(CommandRequest {
                command: command.to_owned(),
                reply: reply_tx,
            })
            .map_err(|_| Error::NotConnected)?;

        match reply_rx.await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(e)) => {
                // the transport is suspect; reconnect before the next command
                self.drop_connection(server_id).await;
                Err(e)
            }
            Err(_) => {
                self.drop_connection(server_id).await;
                Err(Error::CommandFailed(format!(
                    "command worker for server {} terminated",
                    server_id
                )))
            }
        }
    }

    pub async fn is_connected(&self, server_id: i64) -> bool {
        self.connections
            .lock()
            .await
            .get(&server_id)
            .map(|c| c.connected.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub async fn connection_info(&self, server_id: i64) -> Option<ConnectionInfo> {
        self.connections
            .lock()
            .await
            .get(&server_id)
            .map(|c| ConnectionInfo {
                server_id,
                engine: c.engine,
                is_connected: c.connected.load(Ordering::SeqCst),
                last_activity: Utc
                    .timestamp_opt(c.last_activity.load(Ordering::SeqCst), 0)
                    .single()
                    .unwrap_or_else(Utc::now),
                connection_attempts: c.connection_attempts,
            })
    }

    /// Safe to call for unknown servers; queued commands drain before the
    /// worker closes the transport.
    pub async fn disconnect(&self, server_id: i64) {
        if let Some(connection) = self.connections.lock().await.remove(&server_id) {
            drop(connection.sender);
            if let Err(e) = connection.worker.await {
                debug!("Worker for server {} ended abruptly: {}", server_id, e);
            }
            trace!("Server {} disconnected", server_id);
        }
    }

    pub async fn disconnect_all(&self) {
        let connections: Vec<(i64, Connection)> =
            self.connections.lock().await.drain().collect();
        let workers = connections
            .into_iter()
            .map(|(server_id, connection)| {
                drop(connection.sender);
                trace!("Draining connection for server {}", server_id);
                connection.worker
            })
            .collect::<Vec<_>>();
        join_all(workers).await;
    }

    async fn drop_connection(&self, server_id: i64) {
        if let Some(connection) = self.connections.lock().await.remove(&server_id) {
            connection.connected.store(false, Ordering::SeqCst);
            // dropping the sender lets the worker drain queued requests
            // and close the transport on its own time
            drop(connection.sender);
        }
    }

    async fn establish(
        &self,
        credentials: &RconCredentials,
    ) -> rcon::Result<(Box<dyn RconTransport>, u32)> {
        let mut last_error = None;
        for attempt in 1..=self.max_retries {
            match self.open_transport(credentials).await {
                Ok(transport) => return Ok((transport, attempt)),
                // credentials will not change mid-run, retrying is pointless
                Err(e @ Error::AuthFailed) | Err(e @ Error::InvalidCredentials(_)) => {
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        "Connect attempt {}/{} to server {} failed: {}",
                        attempt, self.max_retries, credentials.server_id, e
                    );
                    last_error = Some(e);
                    if attempt < self.max_retries {
                        sleep(connect_backoff(attempt)).await;
                    }
                }
            }
        }

        let last_error = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_owned());
        Err(Error::ConnectionFailed(format!(
            "server {} unreachable after {} attempts: {}",
            credentials.server_id, self.max_retries, last_error
        )))
    }

    async fn open_transport(
        &self,
        credentials: &RconCredentials,
    ) -> rcon::Result<Box<dyn RconTransport>> {
        match credentials.game_engine {
            GameEngine::GoldSrc => Ok(Box::new(
                GoldSrcConnection::connect(
                    &credentials.address,
                    credentials.port,
                    &credentials.rcon_password,
                    self.timeouts,
                )
                .await?,
            )),
            GameEngine::Source | GameEngine::Source2009 => Ok(Box::new(
                SourceConnection::connect(
                    &credentials.address,
                    credentials.port,
                    &credentials.rcon_password,
                    self.timeouts,
                )
                .await?,
            )),
        }
    }

    #[cfg(test)]
    pub(crate) async fn insert_transport_for_test(
        &self,
        server_id: i64,
        transport: Box<dyn RconTransport>,
        engine: GameEngine,
    ) {
        let connection = spawn_worker(server_id, transport, engine, 1);
        self.connections.lock().await.insert(server_id, connection);
    }
}

fn connect_backoff(attempt: u32) -> Duration {
    let exp = CONNECT_BACKOFF_BASE_MS.saturating_mul(1u64 << (attempt - 1).min(16));
    Duration::from_millis(exp.min(CONNECT_BACKOFF_CAP_MS))
}

fn spawn_worker(
    server_id: i64,
    transport: Box<dyn RconTransport>,
    engine: GameEngine,
    connection_attempts: u32,
) -> Connection {
    let (sender, receiver) = mpsc::unbounded_channel();
    let connected = Arc::new(AtomicBool::new(true));
    let last_activity = Arc::new(AtomicI64::new(Utc::now().timestamp()));

    let worker = tokio::spawn(run_worker(
        server_id,
        transport,
        receiver,
        connected.clone(),
        last_activity.clone(),
    ));

    Connection {
        sender,
        connected,
        last_activity,
        engine,
        connection_attempts,
        worker,
    }
}

/// One request in flight at a time; a failure answers its submitter and the
/// queue moves on.
async fn run_worker(
    server_id: i64,
    mut transport: Box<dyn RconTransport>,
    mut receiver: mpsc::UnboundedReceiver<CommandRequest>,
    connected: Arc<AtomicBool>,
    last_activity: Arc<AtomicI64>,
) {
    while let Some(request) = receiver.recv().await {
        let result = transport.execute(&request.command).await;
        connected.store(transport.is_connected(), Ordering::SeqCst);
        last_activity.store(Utc::now().timestamp(), Ordering::SeqCst);
        if let Err(e) = &result {
            trace!("Server {} command failed in worker: {}", server_id, e);
        }
        let _ = request.reply.send(result);
    }

    transport.disconnect().await;
    connected.store(false, Ordering::SeqCst);
    trace!("Worker for server {} drained and closed", server_id);
}
