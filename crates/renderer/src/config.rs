//! Persisted configuration: a JSON file under a per-user config directory,
//! loaded once at startup and rewritten whenever a value the renderer picks
//! for itself (USN, bound port) changes.

use std::path::{Path, PathBuf};

use serde_derive::{Deserialize, Serialize};
use tracing::{debug, warn};

fn default_application_port() -> u16 {
    4004
}

fn default_friendly_name() -> String {
    gethostname::gethostname()
        .into_string()
        .map(|h| format!("{h} Renderer"))
        .unwrap_or_else(|_| "UPnP Renderer".to_owned())
}

fn default_player_path() -> String {
    "mpv".to_owned()
}

fn default_player_position() -> (u32, u32) {
    (0, 0)
}

fn default_player_size() -> (u32, u32) {
    (1280, 720)
}

fn default_log_level() -> String {
    "info".to_owned()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendererConfig {
    /// Bare `uuid:...` unique device name, generated once and kept stable
    /// across restarts so control points don't see a new device every boot.
    #[serde(default = "new_usn")]
    pub usn: String,

    #[serde(default = "default_application_port")]
    pub application_port: u16,

    #[serde(default = "default_friendly_name")]
    pub friendly_name: String,

    #[serde(default = "default_player_path")]
    pub player_path: String,

    #[serde(default = "default_player_position")]
    pub player_position: (u32, u32),

    #[serde(default = "default_player_size")]
    pub player_size: (u32, u32),

    /// Interface names excluded from SSDP advertisement and the IP-change
    /// monitor (e.g. virtual/VPN interfaces the user doesn't want exposed).
    #[serde(default)]
    pub blocked_interfaces: Vec<String>,

    /// Interface names to include even if they'd otherwise be filtered out
    /// as non-private/loopback.
    #[serde(default)]
    pub additional_interfaces: Vec<String>,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn new_usn() -> String {
    format!("uuid:{}", uuid::Uuid::new_v4())
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            usn: new_usn(),
            application_port: default_application_port(),
            friendly_name: default_friendly_name(),
            player_path: default_player_path(),
            player_position: default_player_position(),
            player_size: default_player_size(),
            blocked_interfaces: Vec::new(),
            additional_interfaces: Vec::new(),
            log_level: default_log_level(),
        }
    }
}

pub fn config_path() -> anyhow::Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("io", "renderer", "upnp-renderer")
        .ok_or_else(|| anyhow::anyhow!("could not determine a config directory for this platform"))?;
    Ok(dirs.config_dir().join("config.json"))
}

/// Loads the config from `path`, creating a fresh default one (and
/// persisting it) if the file doesn't exist. A malformed file is logged and
/// treated as empty rather than treated as fatal.
pub fn load_or_init(path: &Path) -> RendererConfig {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(cfg) => {
                debug!(path=?path, "loaded config");
                cfg
            }
            Err(e) => {
                warn!(path=?path, error=?e, "config file is malformed, using defaults");
                RendererConfig::default()
            }
        },
        Err(e) => {
            debug!(path=?path, error=?e, "no config file, writing defaults");
            let cfg = RendererConfig::default();
            if let Err(e) = save(path, &cfg) {
                warn!(path=?path, error=?e, "error writing initial config");
            }
            cfg
        }
    }
}

pub fn save(path: &Path, config: &RendererConfig) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let contents = serde_json::to_string_pretty(config)?;
    std::fs::write(path, contents)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_roundtrips() {
        let dir = tempdir();
        let path = dir.join("config.json");
        let cfg = RendererConfig::default();
        save(&path, &cfg).unwrap();
        let loaded = load_or_init(&path);
        assert_eq!(loaded.usn, cfg.usn);
        assert_eq!(loaded.application_port, cfg.application_port);
    }

    #[test]
    fn test_malformed_config_falls_back_to_defaults() {
        let dir = tempdir();
        let path = dir.join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        let loaded = load_or_init(&path);
        assert_eq!(loaded.application_port, default_application_port());
    }

    fn tempdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("upnp-renderer-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
