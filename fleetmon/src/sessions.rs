//! In-memory registry of live player sessions, multi-indexed so command
//! executors can address a player by game user id, database id, or steam id.
//! All four maps move in lock-step under one mutex; sessions never leak
//! across servers.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::PlayerSession;

/// `(server_id, game_user_id)`: the primary session key.
pub type SessionKey = (i64, i64);

#[derive(Default)]
struct Indexes {
    primary: HashMap<SessionKey, PlayerSession>,
    by_player_id: HashMap<(i64, i64), SessionKey>,
    by_steam_id: HashMap<(i64, String), SessionKey>,
    by_server: HashMap<i64, HashSet<SessionKey>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub total_sessions: usize,
    pub server_sessions: HashMap<i64, usize>,
    pub bot_sessions: usize,
    pub real_player_sessions: usize,
}

/// What a caller supplies when opening a session; timestamps are assigned
/// by the registry.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub server_id: i64,
    pub game_user_id: i64,
    pub database_player_id: i64,
    pub steam_id: String,
    pub player_name: String,
    pub is_bot: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub player_name: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<Indexes>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent on the primary key: re-creating an existing session
    /// refreshes the name and `last_seen` instead of duplicating.
    pub fn create(&self, new: NewSession) -> PlayerSession {
        let now = Utc::now();
        let key = (new.server_id, new.game_user_id);
        let mut inner = self.inner.lock().expect("session maps poisoned");

        if let Some(existing) = inner.primary.get_mut(&key) {
            if !new.player_name.is_empty() {
                existing.player_name = new.player_name;
            }
            existing.last_seen = now;
            return existing.clone();
        }

        let session = PlayerSession {
            server_id: new.server_id,
            game_user_id: new.game_user_id,
            database_player_id: new.database_player_id,
            steam_id: new.steam_id,
            player_name: new.player_name,
            is_bot: new.is_bot,
            connected_at: now,
            last_seen: now,
        };

        inner
            .by_player_id
            .insert((new.server_id, session.database_player_id), key);
        inner
            .by_steam_id
            .insert((new.server_id, session.steam_id.clone()), key);
        inner.by_server.entry(new.server_id).or_default().insert(key);
        inner.primary.insert(key, session.clone());

        session
    }

    pub fn update(
        &self,
        server_id: i64,
        game_user_id: i64,
        patch: SessionPatch,
    ) -> Option<PlayerSession> {
        let mut inner = self.inner.lock().expect("session maps poisoned");
        let session = inner.primary.get_mut(&(server_id, game_user_id))?;
        if let Some(name) = patch.player_name {
            session.player_name = name;
        }
        session.last_seen = patch.last_seen.unwrap_or_else(Utc::now);
        Some(session.clone())
    }

    pub fn delete(&self, server_id: i64, game_user_id: i64) -> bool {
        let mut inner = self.inner.lock().expect("session maps poisoned");
        Self::remove_session(&mut inner, (server_id, game_user_id))
    }

    pub fn delete_server_sessions(&self, server_id: i64) -> usize {
        let mut inner = self.inner.lock().expect("session maps poisoned");
        let keys: Vec<SessionKey> = inner
            .by_server
            .get(&server_id)
            .map(|keys| keys.iter().copied().collect())
            .unwrap_or_default();
        let mut removed = 0;
        for key in keys {
            if Self::remove_session(&mut inner, key) {
                removed += 1;
            }
        }
        removed
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("session maps poisoned");
        inner.primary.clear();
        inner.by_player_id.clear();
        inner.by_steam_id.clear();
        inner.by_server.clear();
    }

    pub fn get_by_game_user_id(&self, server_id: i64, game_user_id: i64) -> Option<PlayerSession> {
        self.inner
            .lock()
            .expect("session maps poisoned")
            .primary
            .get(&(server_id, game_user_id))
            .cloned()
    }

    pub fn get_by_player_id(&self, server_id: i64, database_player_id: i64) -> Option<PlayerSession> {
        let inner = self.inner.lock().expect("session maps poisoned");
        let key = inner.by_player_id.get(&(server_id, database_player_id))?;
        inner.primary.get(key).cloned()
    }

    pub fn get_by_steam_id(&self, server_id: i64, steam_id: &str) -> Option<PlayerSession> {
        let inner = self.inner.lock().expect("session maps poisoned");
        let key = inner.by_steam_id.get(&(server_id, steam_id.to_owned()))?;
        inner.primary.get(key).cloned()
    }

    pub fn get_server_sessions(&self, server_id: i64) -> Vec<PlayerSession> {
        let inner = self.inner.lock().expect("session maps poisoned");
        inner
            .by_server
            .get(&server_id)
            .map(|keys| {
                keys.iter()
                    .filter_map(|key| inner.primary.get(key).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn server_session_count(&self, server_id: i64) -> usize {
        self.inner
            .lock()
            .expect("session maps poisoned")
            .by_server
            .get(&server_id)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    pub fn get_stats(&self) -> SessionStats {
        let inner = self.inner.lock().expect("session maps poisoned");
        let bot_sessions = inner.primary.values().filter(|s| s.is_bot).count();
        SessionStats {
            total_sessions: inner.primary.len(),
            server_sessions: inner
                .by_server
                .iter()
                .map(|(server_id, keys)| (*server_id, keys.len()))
                .collect(),
            bot_sessions,
            real_player_sessions: inner.primary.len() - bot_sessions,
        }
    }

    fn remove_session(inner: &mut Indexes, key: SessionKey) -> bool {
        let Some(session) = inner.primary.remove(&key) else {
            return false;
        };
        inner
            .by_player_id
            .remove(&(session.server_id, session.database_player_id));
        inner
            .by_steam_id
            .remove(&(session.server_id, session.steam_id.clone()));
        if let Some(keys) = inner.by_server.get_mut(&session.server_id) {
            keys.remove(&key);
            if keys.is_empty() {
                inner.by_server.remove(&session.server_id);
            }
        }
        true
    }
}
