use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_SHELL: &str = "/bin/sh";
pub const DEFAULT_MAX_OUTPUT_CHARS: usize = 1_000_000;
pub const DEFAULT_SENDER: &str = "cadence <cadence@localhost>";

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub driver: DriverConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Settings for the polling driver (`cadence daemon`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Seconds between due-job queries.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
        }
    }
}

/// Settings applied to every command execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Interpreter used for jobs with `run_in_shell` set. Invoked as `<shell> -c <script>`.
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Captured stdout/stderr are each truncated to this many characters
    /// (middle omission) before they reach a log.
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            max_output_chars: DEFAULT_MAX_OUTPUT_CHARS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// From-address attached to every subscriber notification.
    #[serde(default = "default_sender")]
    pub sender: String,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            sender: default_sender(),
        }
    }
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}
fn default_shell() -> String {
    DEFAULT_SHELL.to_string()
}
fn default_max_output_chars() -> usize {
    DEFAULT_MAX_OUTPUT_CHARS
}
fn default_sender() -> String {
    DEFAULT_SENDER.to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.db", home)
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `CADENCE_EXECUTOR__MAX_OUTPUT_CHARS=5000`. A missing file is not an
    /// error; every section has defaults.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::from_figment(
            Figment::new()
                .merge(Toml::file(&path))
                .merge(Env::prefixed("CADENCE_").split("__")),
        )
    }

    pub fn from_figment(figment: Figment) -> crate::error::Result<Self> {
        let config: CadenceConfig = figment
            .extract()
            .map_err(|e| crate::error::CadenceError::Config(e.to_string()))?;

        if config.driver.poll_interval_secs == 0 {
            return Err(crate::error::CadenceError::Config(
                "driver.poll_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_source_yields_defaults() {
        let config = CadenceConfig::from_figment(Figment::new()).expect("defaults");
        assert_eq!(config.driver.poll_interval_secs, DEFAULT_POLL_INTERVAL_SECS);
        assert_eq!(config.executor.shell, DEFAULT_SHELL);
        assert_eq!(config.executor.max_output_chars, DEFAULT_MAX_OUTPUT_CHARS);
        assert!(config.database.path.ends_with("/.cadence/cadence.db"));
    }

    #[test]
    fn toml_overrides_individual_keys() {
        let toml = r#"
            [driver]
            poll_interval_secs = 5

            [executor]
            shell = "/bin/bash"
        "#;
        let figment = Figment::new().merge(Toml::string(toml));
        let config = CadenceConfig::from_figment(figment).expect("parse");
        assert_eq!(config.driver.poll_interval_secs, 5);
        assert_eq!(config.executor.shell, "/bin/bash");
        // untouched keys keep their defaults
        assert_eq!(config.executor.max_output_chars, DEFAULT_MAX_OUTPUT_CHARS);
        assert_eq!(config.notify.sender, DEFAULT_SENDER);
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let toml = "[driver]\npoll_interval_secs = 0\n";
        let err = CadenceConfig::from_figment(Figment::new().merge(Toml::string(toml)))
            .unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }
}
