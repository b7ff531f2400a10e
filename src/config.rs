//! Configuration loader/writer plus strongly typed settings structures.
//!
//! The profile config (`~/.lichstream/<profile>/config.toml`) controls the
//! proxy connection and the routing policy: which channels get a dedicated
//! buffer, which tags are metadata, and how aggressively duplicates are
//! dropped.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

// Embed default configuration at compile time
pub const DEFAULT_CONFIG: &str = include_str!("../defaults/config.toml");

/// Environment variable overriding the base directory
pub const DIR_ENV: &str = "LICHSTREAM_DIR";

/// Top-level configuration object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub streams: StreamsConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub event_patterns: HashMap<String, EventPattern>,
    #[serde(skip)] // Set at runtime
    pub character: Option<String>, // Profile this config was loaded for
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub character: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamsConfig {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize, // Max entries per channel buffer
    #[serde(default = "default_dedicated_streams")]
    pub dedicated: Vec<String>, // Channels with their own buffer (excluded from main)
    #[serde(default = "default_known_streams")]
    pub known: Vec<String>, // Recognized channels that still land in main
    #[serde(default)]
    pub mirror: bool, // Copy dedicated channel content into main as well
    #[serde(default = "default_dedup_window_ms")]
    pub dedup_window_ms: u64,
    #[serde(default = "default_dedup_history")]
    pub dedup_history: usize, // Remembered batches per channel
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            dedicated: default_dedicated_streams(),
            known: default_known_streams(),
            mirror: false,
            dedup_window_ms: default_dedup_window_ms(),
            dedup_history: default_dedup_history(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    #[serde(default = "default_metadata_names")]
    pub names: Vec<String>,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            names: default_metadata_names(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPattern {
    pub pattern: String,    // Regex matched against the plain text of content
    pub event_type: String, // Published on event/<event_type>
    #[serde(default = "default_enabled")]
    pub enabled: bool, // Can disable without deleting
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_buffer_size() -> usize {
    10_000
}

fn default_dedicated_streams() -> Vec<String> {
    [
        "speech",
        "thoughts",
        "logons",
        "death",
        "familiar",
        "inv",
        "room",
        "combat",
        "playerlist",
        "bounty",
        "spell",
        "atmospherics",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_known_streams() -> Vec<String> {
    [
        "main",
        "assess",
        "group",
        "ooc",
        "whispers",
        "talk",
        "experience",
        "percWindow",
        "shopWindow",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_dedup_window_ms() -> u64 {
    200
}

fn default_dedup_history() -> usize {
    32
}

fn default_metadata_names() -> Vec<String> {
    [
        "prompt",
        "left",
        "right",
        "spell",
        "progressBar",
        "roundTime",
        "castTime",
        "compass",
        "indicator",
        "dialogData",
        "nav",
        "streamWindow",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_enabled() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig {
                host: default_host(),
                port: default_port(),
                character: None,
            },
            streams: StreamsConfig::default(),
            metadata: MetadataConfig::default(),
            event_patterns: HashMap::new(),
            character: None,
        }
    }
}

impl Config {
    /// Parse a config from TOML text and apply validation fixes
    pub fn from_toml(contents: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(contents).context("Failed to parse config")?;
        for warning in config.validate() {
            tracing::warn!("Config: {}", warning);
        }
        Ok(config)
    }

    /// Load config from a custom file path
    pub fn load_from_path(
        path: &Path,
        character: Option<&str>,
        port_override: Option<u16>,
    ) -> Result<Self> {
        let contents =
            fs::read_to_string(path).context(format!("Failed to read config file: {:?}", path))?;
        let mut config = Self::from_toml(&contents)
            .context(format!("Failed to load config file: {:?}", path))?;

        if let Some(port) = port_override {
            config.connection.port = port;
        }
        config.character = character.map(|s| s.to_string());
        Ok(config)
    }

    /// Load the profile config, extracting the default on first run
    pub fn load_with_options(character: Option<&str>, port_override: Option<u16>) -> Result<Self> {
        // Idempotent - only creates missing files
        Self::extract_defaults(character)?;
        let config_path = Self::config_path(character)?;
        Self::load_from_path(&config_path, character, port_override)
    }

    /// Extract default files on first run
    ///
    /// Profile-specific (default or character):
    /// - ~/.lichstream/{profile}/config.toml
    fn extract_defaults(character: Option<&str>) -> Result<()> {
        let profile = Self::profile_dir(character)?;
        fs::create_dir_all(&profile)
            .context(format!("Failed to create profile directory: {:?}", profile))?;

        let config_path = profile.join("config.toml");
        if !config_path.exists() {
            fs::write(&config_path, DEFAULT_CONFIG).context("Failed to write config.toml")?;
            tracing::info!("Extracted config.toml to {:?}", config_path);
        }

        Ok(())
    }

    /// Check for inconsistent settings, fixing what can be fixed.
    /// Returns a description of every issue found.
    pub fn validate(&mut self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.streams.buffer_size == 0 {
            issues.push("streams.buffer_size must be at least 1, using 1".to_string());
            self.streams.buffer_size = 1;
        }

        let dedicated = &self.streams.dedicated;
        let before = self.streams.known.len();
        self.streams.known.retain(|id| !dedicated.contains(id));
        if self.streams.known.len() != before {
            issues.push("streams listed as both dedicated and known; treating them as dedicated".to_string());
        }

        if self.streams.dedicated.iter().any(|id| id == crate::data::MAIN_CHANNEL) {
            issues.push("'main' cannot be a dedicated stream, ignoring it".to_string());
            self.streams
                .dedicated
                .retain(|id| id != crate::data::MAIN_CHANNEL);
        }

        for (name, pattern) in &mut self.event_patterns {
            if pattern.enabled {
                if let Err(e) = regex::Regex::new(&pattern.pattern) {
                    issues.push(format!("event pattern '{}' is invalid and disabled: {}", name, e));
                    pattern.enabled = false;
                }
            }
        }

        issues
    }

    /// Returns: ~/.lichstream/{character}/ or ~/.lichstream/default/
    fn profile_dir(character: Option<&str>) -> Result<PathBuf> {
        let profile_name = character.unwrap_or("default");
        Ok(Self::config_dir()?.join(profile_name))
    }

    /// Get the base directory (~/.lichstream/)
    /// Can be overridden with LICHSTREAM_DIR environment variable
    fn config_dir() -> Result<PathBuf> {
        if let Ok(custom_dir) = std::env::var(DIR_ENV) {
            return Ok(PathBuf::from(custom_dir));
        }

        let home = dirs::home_dir().context("Could not find home directory")?;
        Ok(home.join(".lichstream"))
    }

    /// Returns: ~/.lichstream/{character}/config.toml
    pub fn config_path(character: Option<&str>) -> Result<PathBuf> {
        Ok(Self::profile_dir(character)?.join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_default_parses() {
        let config = Config::from_toml(DEFAULT_CONFIG).expect("default config parses");

        assert_eq!(config.connection.port, 8000);
        assert_eq!(config.streams.buffer_size, 10_000);
        assert_eq!(config.streams.dedup_window_ms, 200);
        assert!(config.streams.dedicated.contains(&"speech".to_string()));
        assert!(config.streams.known.contains(&"main".to_string()));
        assert!(config.metadata.names.contains(&"prompt".to_string()));
        assert_eq!(config.event_patterns["stunned"].event_type, "stun");
        assert!(config.event_patterns.values().all(|p| p.enabled));
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::from_toml("[connection]\n").expect("minimal config");

        assert_eq!(config.connection.host, "127.0.0.1");
        assert!(!config.streams.mirror);
        assert_eq!(config.streams.dedup_history, 32);
        assert!(config.metadata.names.contains(&"left".to_string()));
        assert!(config.event_patterns.is_empty());
    }

    #[test]
    fn test_validate_fixes_conflicts() {
        let mut config = Config::from_toml(
            r#"
[connection]

[streams]
buffer_size = 0
dedicated = ["speech", "main"]
known = ["speech", "ooc"]

[event_patterns.broken]
pattern = "(unclosed"
event_type = "x"
"#,
        )
        .expect("config parses");

        // from_toml already applied the fixes
        assert_eq!(config.streams.buffer_size, 1);
        assert_eq!(config.streams.dedicated, vec!["speech".to_string()]);
        assert_eq!(config.streams.known, vec!["ooc".to_string()]);
        assert!(!config.event_patterns["broken"].enabled);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_builtin_defaults_match_embedded_config() {
        let embedded = Config::from_toml(DEFAULT_CONFIG).expect("default config parses");
        let builtin = Config::default();

        assert_eq!(builtin.streams.dedicated, embedded.streams.dedicated);
        assert_eq!(builtin.streams.known, embedded.streams.known);
        assert_eq!(builtin.streams.mirror, embedded.streams.mirror);
        assert_eq!(builtin.streams.buffer_size, embedded.streams.buffer_size);
        assert_eq!(builtin.streams.dedup_window_ms, embedded.streams.dedup_window_ms);
        assert_eq!(builtin.streams.dedup_history, embedded.streams.dedup_history);
        assert_eq!(builtin.metadata.names, embedded.metadata.names);
        assert_eq!(builtin.connection.port, embedded.connection.port);
    }

    #[test]
    fn test_serialize_round_trip_keeps_policy() {
        let mut config = Config::default();
        config.streams.mirror = true;
        config.streams.dedicated = vec!["thoughts".to_string()];

        let text = toml::to_string_pretty(&config).expect("serialize");
        let back = Config::from_toml(&text).expect("parse back");
        assert!(back.streams.mirror);
        assert_eq!(back.streams.dedicated, vec!["thoughts".to_string()]);
    }
}
