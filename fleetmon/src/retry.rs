//! Per-server failure isolation. Servers that keep failing their status
//! probes are backed off exponentially and eventually parked dormant so one
//! dead target cannot exhaust scheduler capacity.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::models::RconConfig;

const BASE_DELAY_SECONDS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RetryStatus {
    Healthy,
    BackingOff,
    Dormant,
}

#[derive(Debug, Clone)]
pub struct ServerFailureState {
    pub server_id: i64,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub status: RetryStatus,
}

impl ServerFailureState {
    fn healthy(server_id: i64) -> Self {
        Self {
            server_id,
            consecutive_failures: 0,
            last_failure_at: None,
            next_retry_at: None,
            status: RetryStatus::Healthy,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RetryStats {
    pub total_servers_in_failure_state: usize,
    pub healthy_servers: usize,
    pub backing_off_servers: usize,
    pub dormant_servers: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_consecutive_failures: u32,
    pub backoff_multiplier: i64,
    pub max_backoff_minutes: i64,
    pub dormant_retry_minutes: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 10,
            backoff_multiplier: 2,
            max_backoff_minutes: 30,
            dormant_retry_minutes: 60,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RconConfig) -> Self {
        let defaults = Self::default();
        Self {
            max_consecutive_failures: config
                .max_consecutive_failures
                .unwrap_or(defaults.max_consecutive_failures),
            backoff_multiplier: config
                .backoff_multiplier
                .map(i64::from)
                .unwrap_or(defaults.backoff_multiplier),
            max_backoff_minutes: config
                .max_backoff_minutes
                .unwrap_or(defaults.max_backoff_minutes),
            dormant_retry_minutes: config
                .dormant_retry_minutes
                .unwrap_or(defaults.dormant_retry_minutes),
        }
    }
}

/// Healthy servers are not tracked: presence in the map implies at least one
/// consecutive failure.
pub struct RetryController {
    policy: RetryPolicy,
    states: Mutex<HashMap<i64, ServerFailureState>>,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_failure(&self, server_id: i64) -> ServerFailureState {
        let now = Utc::now();
        let mut states = self.states.lock().expect("failure map poisoned");
        let entry = states
            .entry(server_id)
            .or_insert_with(|| ServerFailureState::healthy(server_id));

        let previous_status = entry.status;
        entry.consecutive_failures += 1;
        entry.last_failure_at = Some(now);
        entry.next_retry_at = Some(self.calculate_next_retry(entry.consecutive_failures));
        entry.status = self.determine_retry_status(entry.consecutive_failures);

        if entry.status != previous_status {
            match entry.status {
                RetryStatus::Dormant => warn!(
                    "Server {} is dormant after {} consecutive failures, next probe at {}",
                    server_id,
                    entry.consecutive_failures,
                    entry.next_retry_at.expect("dormant state has retry time")
                ),
                RetryStatus::BackingOff => info!(
                    "Server {} is backing off ({} consecutive failures)",
                    server_id, entry.consecutive_failures
                ),
                RetryStatus::Healthy => {}
            }
        }

        entry.clone()
    }

    /// Synthesizes a healthy state for untracked servers.
    pub fn get_failure_state(&self, server_id: i64) -> ServerFailureState {
        self.states
            .lock()
            .expect("failure map poisoned")
            .get(&server_id)
            .cloned()
            .unwrap_or_else(|| ServerFailureState::healthy(server_id))
    }

    pub fn should_retry(&self, server_id: i64) -> bool {
        let state = self.get_failure_state(server_id);
        match state.status {
            RetryStatus::Healthy => true,
            _ => state
                .next_retry_at
                .map(|at| Utc::now() >= at)
                .unwrap_or(false),
        }
    }

    pub fn reset_failure_state(&self, server_id: i64) {
        let removed = self
            .states
            .lock()
            .expect("failure map poisoned")
            .remove(&server_id);
        if let Some(state) = removed {
            if state.consecutive_failures > 0 {
                info!(
                    "Server {} recovered after {} consecutive failures",
                    server_id, state.consecutive_failures
                );
            }
        }
    }

    pub fn calculate_next_retry(&self, consecutive_failures: u32) -> DateTime<Utc> {
        let now = Utc::now();
        if consecutive_failures >= self.policy.max_consecutive_failures {
            return now + Duration::seconds(self.policy.dormant_retry_minutes * 60);
        }

        let cap = self.policy.max_backoff_minutes * 60;
        let mut delay = BASE_DELAY_SECONDS;
        for _ in 1..consecutive_failures {
            delay = (delay * self.policy.backoff_multiplier).min(cap);
        }
        now + Duration::seconds(delay.min(cap))
    }

    pub fn determine_retry_status(&self, consecutive_failures: u32) -> RetryStatus {
        if consecutive_failures == 0 {
            RetryStatus::Healthy
        } else if consecutive_failures < self.policy.max_consecutive_failures {
            RetryStatus::BackingOff
        } else {
            RetryStatus::Dormant
        }
    }

    pub fn stats(&self) -> RetryStats {
        let states = self.states.lock().expect("failure map poisoned");
        let backing_off = states
            .values()
            .filter(|s| s.status == RetryStatus::BackingOff)
            .count();
        let dormant = states
            .values()
            .filter(|s| s.status == RetryStatus::Dormant)
            .count();
        RetryStats {
            total_servers_in_failure_state: states.len(),
            healthy_servers: states.len() - backing_off - dormant,
            backing_off_servers: backing_off,
            dormant_servers: dormant,
        }
    }

    #[cfg(test)]
    fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}
