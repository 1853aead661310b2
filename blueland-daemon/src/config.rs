use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    pub command_socket: PathBuf,
    pub event_socket: PathBuf,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub prompt: PromptConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub obex: ObexConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscoveryConfig {
    pub window_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PromptConfig {
    pub program: String,
    pub title: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BroadcastConfig {
    /// Lines buffered per subscriber before it is dropped as too slow
    pub queue_depth: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObexConfig {
    pub enabled: bool,
    pub download_dir: PathBuf,
    pub auto_accept: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self { window_secs: 10 }
    }
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            program: "zenity".to_string(),
            title: "Blueland".to_string(),
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self { queue_depth: 64 }
    }
}

impl Default for ObexConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            download_dir: std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp")),
            auto_accept: false,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let runtime_dir = runtime_dir();
        Self {
            command_socket: runtime_dir.join("command.sock"),
            event_socket: runtime_dir.join("blueland.sock"),
            discovery: DiscoveryConfig::default(),
            prompt: PromptConfig::default(),
            broadcast: BroadcastConfig::default(),
            obex: ObexConfig::default(),
        }
    }
}

/// `$XDG_RUNTIME_DIR/blueland`, or `/run/user/<uid>/blueland` when unset.
pub fn runtime_dir() -> PathBuf {
    let base = std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(format!("/run/user/{}", nix::unistd::getuid())));
    base.join("blueland")
}

impl DaemonConfig {
    pub fn load(path: &str) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(toml::from_str(&content)?),
            Err(_) => {
                // Create default config if not found
                let config = Self::default();
                if let Err(e) = fs::write(path, toml::to_string_pretty(&config)?) {
                    tracing::debug!("Not writing default config to {}: {}", path, e);
                }
                Ok(config)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_fills_in_defaults() {
        let config: DaemonConfig = toml::from_str(
            r#"
            command_socket = "/tmp/bl/command.sock"
            event_socket = "/tmp/bl/events.sock"

            [prompt]
            program = "kdialog"
            title = "Pairing"
            "#,
        )
        .unwrap();
        assert_eq!(config.prompt.program, "kdialog");
        assert_eq!(config.discovery.window_secs, 10);
        assert_eq!(config.broadcast.queue_depth, 64);
        assert!(config.obex.enabled);
        assert!(!config.obex.auto_accept);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bluelandd.toml");
        let config = DaemonConfig::load(path.to_str().unwrap()).unwrap();
        assert!(config.event_socket.ends_with("blueland/blueland.sock"));
        // default file was written out
        let written = fs::read_to_string(&path).unwrap();
        assert!(written.contains("command_socket"));
    }
}
