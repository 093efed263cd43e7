use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rcon::Timeouts;
use structopt::StructOpt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fleetmon::events::EventBus;
use fleetmon::executors::{
    PlayerMessageExecutor, ServerMessageExecutor, ServerMonitoringExecutor,
};
use fleetmon::models::{CommandSpec, ScheduledCommand, Settings};
use fleetmon::rcon_service::RconService;
use fleetmon::repositories::{FileStore, PlaintextCrypto};
use fleetmon::resolver::CommandResolver;
use fleetmon::retry::{RetryController, RetryPolicy};
use fleetmon::scheduler::CommandScheduler;
use fleetmon::sessions::SessionRegistry;
use fleetmon::settings_utils;

#[derive(StructOpt)]
#[structopt(name = "fleetmon", about = "Game-server fleet monitor over RCON")]
struct Opt {
    /// Path to the JSON settings document
    #[structopt(long, default_value = "fleetmon.json", parse(from_os_str))]
    settings: PathBuf,

    /// Directory holding the data files named in the settings
    #[structopt(long, parse(from_os_str))]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::from_args();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut settings = settings_utils::load_settings(&opt.settings)?;
    if !settings.rcon.enabled {
        warn!("RCON engine disabled by configuration, exiting");
        return Ok(());
    }
    ensure_monitoring_schedule(&mut settings);

    let data_dir = opt.data_dir.unwrap_or_else(|| PathBuf::from("."));
    let store = Arc::new(FileStore::load(
        &data_dir.join(&settings.servers_file),
        &data_dir.join(&settings.credentials_file),
        &data_dir.join(&settings.load_history_file),
        Box::new(PlaintextCrypto),
    )?);

    let events = EventBus::new();
    let rcon = Arc::new(RconService::new(
        store.clone(),
        Some(events.clone()),
        Timeouts {
            connect: Duration::from_millis(settings.rcon.connect_timeout),
            command: Duration::from_millis(settings.rcon.timeout),
        },
        settings.rcon.max_retries,
    ));
    let retry = Arc::new(RetryController::new(RetryPolicy::from_config(&settings.rcon)));
    let sessions = Arc::new(SessionRegistry::new());
    let resolver = Arc::new(CommandResolver::new(store.clone()));

    let monitoring = Arc::new(ServerMonitoringExecutor::new(
        rcon.clone(),
        retry.clone(),
        store.clone(),
        store.clone(),
        sessions.clone(),
        None,
    ));

    let mut scheduler = CommandScheduler::new(
        settings.schedule.clone(),
        store.clone(),
        sessions.clone(),
        events.clone(),
        monitoring,
    );
    scheduler.register_executor(Arc::new(ServerMessageExecutor::new(rcon.clone())));
    scheduler.register_executor(Arc::new(PlayerMessageExecutor::new(
        rcon.clone(),
        resolver,
        sessions.clone(),
    )));
    let scheduler = Arc::new(scheduler);

    scheduler.start().await;
    info!("fleetmon running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    scheduler.stop().await;
    rcon.disconnect_all().await;
    sessions.clear();

    Ok(())
}

/// The periodic status capture is itself a schedule; deployments that do not
/// configure one get it synthesized from `rcon.status_interval`.
fn ensure_monitoring_schedule(settings: &mut Settings) {
    let already_configured = settings
        .schedule
        .schedules
        .iter()
        .any(|s| matches!(s.command, CommandSpec::ServerMonitoring));
    if already_configured {
        return;
    }

    let interval = settings.rcon.status_interval.max(1);
    let cron_expression = if interval < 60 {
        format!("*/{} * * * * *", interval)
    } else {
        format!("0 */{} * * * *", (interval / 60).clamp(1, 59))
    };
    info!(
        "No monitoring schedule configured, synthesizing one every {}s",
        interval
    );
    settings.schedule.schedules.push(ScheduledCommand {
        id: "server-monitoring".into(),
        name: "Periodic status capture".into(),
        cron_expression,
        command: CommandSpec::ServerMonitoring,
        enabled: true,
        server_filter: None,
        max_retries: None,
        retry_on_failure: None,
        timeout_ms: None,
        metadata: None,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitoring_schedule_is_synthesized_once() {
        let mut settings = Settings::default();
        settings.rcon.status_interval = 30;

        ensure_monitoring_schedule(&mut settings);
        assert_eq!(settings.schedule.schedules.len(), 1);
        assert_eq!(
            settings.schedule.schedules[0].cron_expression,
            "*/30 * * * * *"
        );

        ensure_monitoring_schedule(&mut settings);
        assert_eq!(settings.schedule.schedules.len(), 1);
    }

    #[test]
    fn minute_scale_intervals_use_minute_fields() {
        let mut settings = Settings::default();
        settings.rcon.status_interval = 300;
        ensure_monitoring_schedule(&mut settings);
        assert_eq!(
            settings.schedule.schedules[0].cron_expression,
            "0 */5 * * * *"
        );
    }
}
