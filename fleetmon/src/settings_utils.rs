use std::path::Path;

use anyhow::{Context, Result};
use tracing::{trace, warn};

use crate::models::Settings;

pub fn load_settings(path: &Path) -> Result<Settings> {
    trace!("Loading settings from {}", path.display());
    if !path.exists() {
        warn!(
            "Settings file {} not found, starting with defaults",
            path.display()
        );
        return Ok(Settings::default());
    }
    let settings = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings from {}", path.display()))?;
    serde_json::from_str(&settings)
        .with_context(|| format!("Failed to parse settings from {}", path.display()))
}

pub fn save_settings(path: &Path, settings: &Settings) -> Result<()> {
    trace!("Saving settings to {}", path.display());
    let settings = serde_json::to_string_pretty(settings)?;
    Ok(std::fs::write(path, settings)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let settings = load_settings(Path::new("/definitely/not/here.json")).unwrap();
        assert!(settings.rcon.enabled);
        assert!(settings.schedule.schedules.is_empty());
    }

    #[test]
    fn round_trip_through_disk() {
        let dir = std::env::temp_dir().join("fleetmon-settings-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");

        let mut settings = Settings::default();
        settings.rcon.status_interval = 17;
        save_settings(&path, &settings).unwrap();

        let loaded = load_settings(&path).unwrap();
        assert_eq!(loaded.rcon.status_interval, 17);

        std::fs::remove_file(&path).ok();
    }
}
