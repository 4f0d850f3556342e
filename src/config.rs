use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Engine and server configuration, loaded from TOML with CLI overrides
/// applied on top in `main`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory under which per-project workspaces live.
    pub workspace_root: PathBuf,
    /// Shell program for new sessions. `None` means `$SHELL` / `/bin/bash`.
    pub shell: Option<String>,
    /// Replay buffer cap per session, in bytes.
    pub buffer_cap_bytes: usize,
    /// Per-subscriber channel capacity, in chunks.
    pub subscriber_capacity: usize,
    /// Initial terminal window size for new sessions.
    pub rows: u16,
    pub cols: u16,
    /// PTY read chunk size, in bytes.
    pub read_chunk_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace_root: default_workspace_root(),
            shell: None,
            buffer_cap_bytes: crate::buffer::ReplayBuffer::DEFAULT_CAP_BYTES,
            subscriber_capacity: crate::fanout::SUBSCRIBER_CAPACITY,
            rows: 24,
            cols: 80,
            read_chunk_bytes: 4096,
        }
    }
}

fn default_workspace_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("termhub/workspace")
}

/// Errors that can occur when loading config.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {0}: {1}")]
    ReadFailed(PathBuf, #[source] std::io::Error),
    #[error("failed to parse config {0}: {1}")]
    ParseFailed(PathBuf, #[source] toml::de::Error),
}

impl Config {
    /// Load config from a TOML file path. Returns `None` if the file does
    /// not exist; missing keys fall back to their defaults.
    pub fn load(path: &std::path::Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.buffer_cap_bytes, 100 * 1024);
        assert_eq!(config.subscriber_capacity, 512);
        assert_eq!((config.rows, config.cols), (24, 80));
        assert!(config.shell.is_none());
    }

    #[test]
    fn parse_partial_config_uses_defaults() {
        let toml = r#"
            buffer_cap_bytes = 4096
            shell = "/bin/zsh"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.buffer_cap_bytes, 4096);
        assert_eq!(config.shell.as_deref(), Some("/bin/zsh"));
        assert_eq!(config.subscriber_capacity, 512);
    }

    #[test]
    fn parse_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.read_chunk_bytes, 4096);
    }

    #[test]
    fn load_missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load(&dir.path().join("nope.toml")).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn load_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("termhub.toml");
        std::fs::write(&path, "rows = 50\ncols = 132\n").unwrap();
        let config = Config::load(&path).unwrap().expect("config should load");
        assert_eq!((config.rows, config.cols), (50, 132));
    }

    #[test]
    fn load_invalid_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "rows = \"not a number").unwrap();
        assert!(matches!(
            Config::load(&path),
            Err(ConfigError::ParseFailed(_, _))
        ));
    }
}
