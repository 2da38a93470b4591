use std::env;
use std::fmt;

use serde::Deserialize;

#[derive(Clone, Deserialize, Debug)]
pub struct Config {
    #[serde(default = "default_env")]
    pub env: String, // file / server
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub prefix: Option<String>,

    /// Rasterization backend: `canvas` or `chrome`.
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_resource_timeout_ms")]
    pub resource_timeout_ms: u64,
    #[serde(default = "default_resource_budget_ms")]
    pub resource_budget_ms: u64,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_rasterization_budget_ms")]
    pub rasterization_budget_ms: u64,

    /// Origin the cards are served from. Resources from other origins must
    /// be CORS-enabled for it.
    pub app_origin: Option<String>,
    #[serde(default = "default_true")]
    pub enforce_cors: bool,
    #[serde(default)]
    pub force_background_substitution: bool,

    pub usage_log_url: Option<String>,
    pub fallback_font_path: Option<String>,
    #[serde(default = "default_browser_pool_size")]
    pub browser_pool_size: usize,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

fn default_env() -> String {
    "file".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_backend() -> String {
    "canvas".to_string()
}

fn default_resource_timeout_ms() -> u64 {
    4000
}

fn default_resource_budget_ms() -> u64 {
    8000
}

fn default_settle_delay_ms() -> u64 {
    250
}

fn default_rasterization_budget_ms() -> u64 {
    15000
}

fn default_true() -> bool {
    true
}

fn default_browser_pool_size() -> usize {
    2
}

fn default_log_dir() -> String {
    "./logs".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            env: default_env(),
            host: default_host(),
            port: default_port(),
            prefix: None,
            backend: default_backend(),
            resource_timeout_ms: default_resource_timeout_ms(),
            resource_budget_ms: default_resource_budget_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            rasterization_budget_ms: default_rasterization_budget_ms(),
            app_origin: None,
            enforce_cors: true,
            force_background_substitution: false,
            usage_log_url: None,
            fallback_font_path: None,
            browser_pool_size: default_browser_pool_size(),
            log_dir: default_log_dir(),
        }
    }
}

/// Where [`get_config`] reads its variables from, selected by `env`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvSource {
    DotEnvFile,
    Server,
}

impl EnvSource {
    pub fn current() -> Self {
        Self::from_var(env::var("env").ok().as_deref())
    }

    fn from_var(value: Option<&str>) -> Self {
        match value {
            None | Some("file") => EnvSource::DotEnvFile,
            Some(_) => EnvSource::Server,
        }
    }
}

impl fmt::Display for EnvSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvSource::DotEnvFile => write!(f, ".env file"),
            EnvSource::Server => write!(f, "server environment"),
        }
    }
}

/// Runs before logging is set up, so the caller reports [`EnvSource`].
pub fn get_config() -> Result<Config, envy::Error> {
    if EnvSource::current() == EnvSource::DotEnvFile {
        let _ = dotenvy::dotenv();
    }
    envy::from_env::<Config>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_source_defaults_to_dotenv_file() {
        assert_eq!(EnvSource::from_var(None), EnvSource::DotEnvFile);
        assert_eq!(EnvSource::from_var(Some("file")), EnvSource::DotEnvFile);
        assert_eq!(EnvSource::from_var(Some("server")), EnvSource::Server);
        assert_eq!(EnvSource::Server.to_string(), "server environment");
    }

    #[test]
    fn defaults_fill_missing_variables() {
        let config: Config = envy::from_iter(vec![
            ("port".to_string(), "9000".to_string()),
            ("backend".to_string(), "chrome".to_string()),
        ])
        .unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.backend, "chrome");
        assert_eq!(config.resource_timeout_ms, 4000);
        assert_eq!(config.rasterization_budget_ms, 15000);
        assert!(config.enforce_cors);
        assert!(!config.force_background_substitution);
        assert_eq!(config.app_origin, None);
    }

    #[test]
    fn booleans_parse_from_strings() {
        let config: Config = envy::from_iter(vec![
            ("enforce_cors".to_string(), "false".to_string()),
            ("force_background_substitution".to_string(), "true".to_string()),
        ])
        .unwrap();

        assert!(!config.enforce_cors);
        assert!(config.force_background_substitution);
    }
}
