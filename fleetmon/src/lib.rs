//! Game-server fleet monitor over RCON.
//!
//! The daemon keeps one authenticated RCON session per managed server,
//! captures `status` on a cron cadence into an in-memory session registry
//! and a load-history trail, runs administrator-scheduled announcements,
//! and isolates failing servers behind an exponential-backoff controller.

pub mod events;
pub mod executors;
pub mod models;
pub mod rcon_service;
pub mod repositories;
pub mod resolver;
pub mod retry;
pub mod scheduler;
pub mod sessions;
pub mod settings_utils;
pub mod status_parser;
