use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node_name: String,
    /// Directory holding the JSON key-value store.
    pub data_dir: String,
    pub playback_interval_ms: u64,
    pub telemetry_autosave_secs: u64,
    pub program_poll_interval_secs: u64,
    pub monitor_interval_secs: u64,
    pub diagnostics: bool,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: "Local".to_string(),
            data_dir: "data".to_string(),
            playback_interval_ms: 8000,
            telemetry_autosave_secs: 30,
            program_poll_interval_secs: 60,
            monitor_interval_secs: 10,
            diagnostics: false,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        if config.playback_interval_ms == 0 {
            anyhow::bail!("playback_interval_ms must be greater than zero");
        }
        Ok(config)
    }

    pub fn playback_interval(&self) -> Duration {
        Duration::from_millis(self.playback_interval_ms)
    }

    pub fn telemetry_autosave(&self) -> Duration {
        Duration::from_secs(self.telemetry_autosave_secs.max(1))
    }

    pub fn program_poll_interval(&self) -> Duration {
        Duration::from_secs(self.program_poll_interval_secs.max(1))
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs.max(1))
    }

    pub fn default_template() -> &'static str {
        r#"node_name = "Local"
data_dir = "data"
playback_interval_ms = 8000
telemetry_autosave_secs = 30
program_poll_interval_secs = 60
monitor_interval_secs = 10
diagnostics = false
log_level = "info"
"#
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_matches_defaults() {
        let parsed: Config = toml::from_str(Config::default_template()).unwrap();
        let defaults = Config::default();
        assert_eq!(parsed.node_name, defaults.node_name);
        assert_eq!(parsed.playback_interval(), Duration::from_secs(8));
        assert_eq!(parsed.telemetry_autosave(), Duration::from_secs(30));
        assert!(!parsed.diagnostics);
    }

    #[test]
    fn test_missing_keys_fall_back() {
        let parsed: Config = toml::from_str("node_name = \"Lobby\"\ndiagnostics = true\n").unwrap();
        assert_eq!(parsed.node_name, "Lobby");
        assert!(parsed.diagnostics);
        assert_eq!(parsed.data_dir, "data");
        assert_eq!(parsed.monitor_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_load_rejects_zero_interval() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "playback_interval_ms = 0\n").unwrap();
        assert!(Config::load(path.to_str().unwrap()).is_err());

        fs::write(&path, Config::default_template()).unwrap();
        assert!(Config::load(path.to_str().unwrap()).is_ok());
    }
}
