//! # Feature: Configuration System
//!
//! Process-level configuration for the bot and its dashboard. Loaded from a YAML
//! file with environment variable interpolation, or from plain environment
//! variables when no file is present.
//!
//! Feature documents (embed messages, role buttons, ...) are *not* configured
//! here; they live in the JSON config store edited through the dashboard.

use anyhow::{Context, Result};
use log::info;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

static ENV_VAR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("Invalid regex")
});

/// Dashboard bind settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DashboardConfig {
    #[serde(default = "default_dashboard_host")]
    pub host: String,

    #[serde(default = "default_dashboard_port")]
    pub port: u16,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        DashboardConfig {
            host: default_dashboard_host(),
            port: default_dashboard_port(),
        }
    }
}

impl DashboardConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Channel and tag ids used by the forum analysis command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForumAnalysisConfig {
    /// Forum channel whose threads are analysed
    pub forum_channel_id: String,

    /// Text channel where the command may be used and reports are posted
    pub target_channel_id: String,

    /// Forum tag marking a thread as a bug report
    pub bug_tag_id: String,

    /// Forum tag marking a bug as patched
    pub patched_tag_id: String,
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Discord bot token (required unless `debug_server` is set)
    #[serde(default)]
    pub discord_token: String,

    /// Guild the bot manages; slash commands are registered here
    pub guild_id: String,

    /// SQLite database path
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory holding feature documents, schemas, defaults and applied snapshots
    #[serde(default = "default_configs_dir")]
    pub configs_dir: PathBuf,

    /// Seconds between config document polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default)]
    pub dashboard: DashboardConfig,

    /// Run only the dashboard, without connecting to Discord
    #[serde(default)]
    pub debug_server: bool,

    /// Forum analysis settings; without them the command reports it is not configured
    #[serde(default)]
    pub forum_analysis: Option<ForumAnalysisConfig>,
}

// Default value functions for serde
fn default_database_path() -> String {
    "ranger.db".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_configs_dir() -> PathBuf {
    PathBuf::from("configs")
}

fn default_poll_interval() -> u64 {
    10
}

fn default_dashboard_host() -> String {
    "0.0.0.0".to_string()
}

fn default_dashboard_port() -> u16 {
    5000
}

impl AppConfig {
    /// Load configuration from a YAML file with environment variable interpolation
    ///
    /// Supports `${VAR_NAME}` and `${VAR_NAME:-default}`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let interpolated = interpolate_env_vars(&content)?;

        let config: AppConfig = serde_yaml::from_str(&interpolated)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;

        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Build configuration from environment variables only
    pub fn from_env() -> Result<Self> {
        let debug_server = env::var("DEBUG_SERVER")
            .map(|v| v.to_lowercase() == "true")
            .unwrap_or(false);

        let forum_analysis = match (
            env::var("FORUM_CHANNEL_ID"),
            env::var("FORUM_TARGET_CHANNEL_ID"),
            env::var("FORUM_BUG_TAG_ID"),
            env::var("FORUM_PATCHED_TAG_ID"),
        ) {
            (Ok(forum_channel_id), Ok(target_channel_id), Ok(bug_tag_id), Ok(patched_tag_id)) => {
                Some(ForumAnalysisConfig {
                    forum_channel_id,
                    target_channel_id,
                    bug_tag_id,
                    patched_tag_id,
                })
            }
            _ => None,
        };

        let config = AppConfig {
            discord_token: env::var("DISCORD_TOKEN").unwrap_or_default(),
            guild_id: env::var("GUILD_ID")
                .map_err(|_| anyhow::anyhow!("GUILD_ID environment variable not set"))?,
            database_path: env::var("DATABASE_PATH").unwrap_or_else(|_| default_database_path()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| default_log_level()),
            configs_dir: env::var("CONFIGS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_configs_dir()),
            poll_interval_secs: env::var("CONFIG_POLL_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_poll_interval),
            dashboard: DashboardConfig {
                host: env::var("DASHBOARD_HOST").unwrap_or_else(|_| default_dashboard_host()),
                port: env::var("DASHBOARD_PORT")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(default_dashboard_port),
            },
            debug_server,
            forum_analysis,
        };

        config.validate()?;
        Ok(config)
    }

    /// Auto-detect and load configuration
    ///
    /// Priority order:
    /// 1. If CONFIG_FILE env var is set, load from that file
    /// 2. If config.yaml exists in current directory, load from it
    /// 3. Fall back to environment variables
    pub fn auto_load() -> Result<Self> {
        if let Ok(config_path) = env::var("CONFIG_FILE") {
            info!("Loading config from CONFIG_FILE: {}", config_path);
            return Self::from_file(&config_path);
        }

        let default_config_path = "config.yaml";
        if Path::new(default_config_path).exists() {
            info!("Loading config from {}", default_config_path);
            return Self::from_file(default_config_path);
        }

        info!("No config file found, using environment variables");
        Self::from_env()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !self.debug_server && self.discord_token.is_empty() {
            anyhow::bail!("discord_token is required unless debug_server is enabled");
        }

        parse_id("guild_id", &self.guild_id)?;

        if self.poll_interval_secs == 0 {
            anyhow::bail!("poll_interval_secs must be greater than zero");
        }

        if let Some(forum) = &self.forum_analysis {
            parse_id("forum_analysis.forum_channel_id", &forum.forum_channel_id)?;
            parse_id("forum_analysis.target_channel_id", &forum.target_channel_id)?;
            parse_id("forum_analysis.bug_tag_id", &forum.bug_tag_id)?;
            parse_id("forum_analysis.patched_tag_id", &forum.patched_tag_id)?;
        }

        Ok(())
    }

    /// Numeric guild id (validated on load)
    pub fn guild_id(&self) -> Result<u64> {
        parse_id("guild_id", &self.guild_id)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Parse a Discord snowflake given as a string
pub fn parse_id(field: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| anyhow::anyhow!("{} must be a numeric id, got '{}'", field, value))
}

// ============================================================================
// Environment Variable Interpolation
// ============================================================================

/// Interpolate environment variables in a string
///
/// Supports `${VAR_NAME}` syntax. If a variable is not set, returns an error.
/// Use `${VAR_NAME:-default}` for default values.
fn interpolate_env_vars(content: &str) -> Result<String> {
    let mut errors = Vec::new();
    let mut result = String::with_capacity(content.len());

    for line in content.split_inclusive('\n') {
        // Comments are left as written
        if line.trim_start().starts_with('#') {
            result.push_str(line);
            continue;
        }
        let replaced = ENV_VAR_PATTERN.replace_all(line, |cap: &regex::Captures| {
            let var_name = &cap[1];
            match env::var(var_name) {
                Ok(v) => v,
                Err(_) => match cap.get(2) {
                    Some(default) => default.as_str().to_string(),
                    None => {
                        errors.push(format!("Environment variable '{}' is not set", var_name));
                        String::new()
                    }
                },
            }
        });
        result.push_str(&replaced);
    }

    if !errors.is_empty() {
        anyhow::bail!("Missing environment variables:\n  - {}", errors.join("\n  - "));
    }

    Ok(result)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig {
            discord_token: "token".to_string(),
            guild_id: "123".to_string(),
            database_path: "test.db".to_string(),
            log_level: "info".to_string(),
            configs_dir: PathBuf::from("configs"),
            poll_interval_secs: 10,
            dashboard: DashboardConfig::default(),
            debug_server: false,
            forum_analysis: None,
        }
    }

    #[test]
    fn test_interpolate_env_vars_simple() {
        env::set_var("RANGER_TEST_VAR_1", "value1");
        let result = interpolate_env_vars("key: ${RANGER_TEST_VAR_1}").unwrap();
        assert_eq!(result, "key: value1");
        env::remove_var("RANGER_TEST_VAR_1");
    }

    #[test]
    fn test_interpolate_env_vars_with_default() {
        env::remove_var("RANGER_NONEXISTENT_VAR");
        let result = interpolate_env_vars("key: ${RANGER_NONEXISTENT_VAR:-fallback}").unwrap();
        assert_eq!(result, "key: fallback");
    }

    #[test]
    fn test_interpolate_env_vars_missing_no_default() {
        env::remove_var("RANGER_MISSING_VAR");
        let result = interpolate_env_vars("key: ${RANGER_MISSING_VAR}");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("RANGER_MISSING_VAR"));
    }

    #[test]
    fn test_interpolate_env_vars_skips_comments() {
        env::remove_var("RANGER_COMMENTED_VAR");
        let yaml = "# uses ${RANGER_COMMENTED_VAR}\n  # ${RANGER_COMMENTED_VAR:-x}\nkey: value\n";
        assert_eq!(interpolate_env_vars(yaml).unwrap(), yaml);
    }

    #[test]
    fn test_example_config_loads() {
        for (name, value) in [
            ("DISCORD_TOKEN", "token"),
            ("GUILD_ID", "42"),
            ("FORUM_CHANNEL_ID", "1"),
            ("FORUM_TARGET_CHANNEL_ID", "2"),
            ("FORUM_BUG_TAG_ID", "3"),
            ("FORUM_PATCHED_TAG_ID", "4"),
        ] {
            env::set_var(name, value);
        }

        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config.example.yaml");
        let config = AppConfig::from_file(path).unwrap();

        assert_eq!(config.guild_id().unwrap(), 42);
        assert_eq!(config.dashboard.bind_address(), "0.0.0.0:5000");
        assert!(config.forum_analysis.is_some());
    }

    #[test]
    fn test_app_config_from_yaml_defaults() {
        env::set_var("RANGER_TEST_TOKEN", "abc");

        let yaml = r#"
discord_token: "${RANGER_TEST_TOKEN}"
guild_id: "42"
forum_analysis:
  forum_channel_id: "1"
  target_channel_id: "2"
  bug_tag_id: "3"
  patched_tag_id: "4"
"#;

        let interpolated = interpolate_env_vars(yaml).unwrap();
        let config: AppConfig = serde_yaml::from_str(&interpolated).unwrap();
        config.validate().unwrap();

        assert_eq!(config.discord_token, "abc");
        assert_eq!(config.guild_id().unwrap(), 42);
        assert_eq!(config.database_path, "ranger.db");
        assert_eq!(config.configs_dir, PathBuf::from("configs"));
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.dashboard.bind_address(), "0.0.0.0:5000");
        assert_eq!(
            config.forum_analysis.as_ref().map(|f| f.bug_tag_id.as_str()),
            Some("3")
        );

        env::remove_var("RANGER_TEST_TOKEN");
    }

    #[test]
    fn test_validation_requires_token_outside_debug_server() {
        let mut config = base_config();
        config.discord_token.clear();
        assert!(config.validate().is_err());

        config.debug_server = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_non_numeric_ids() {
        let mut config = base_config();
        config.guild_id = "not-a-guild".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("guild_id"));

        let mut config = base_config();
        config.forum_analysis = Some(ForumAnalysisConfig {
            forum_channel_id: "1".to_string(),
            target_channel_id: "x".to_string(),
            bug_tag_id: "3".to_string(),
            patched_tag_id: "4".to_string(),
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("target_channel_id"));
    }

    #[test]
    fn test_validation_rejects_zero_poll_interval() {
        let mut config = base_config();
        config.poll_interval_secs = 0;
        assert!(config.validate().is_err());
    }
}
