//! CLI configuration.
//!
//! Configuration is layered, later sources winning:
//! - The first of `herald.toml`, `/etc/herald/herald.toml` and
//!   `~/.config/herald/herald.toml`, or the file given with `--config`
//! - Environment variables (`HERALD_*`, nested keys separated by `__`)

use anyhow::{Context, Result};
use herald_client::ClientConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Files searched when no `--config` is given.
const CONFIG_PATHS: [&str; 3] = [
    "herald.toml",
    "/etc/herald/herald.toml",
    "~/.config/herald/herald.toml",
];

const ENV_PREFIX: &str = "HERALD";

/// Top-level CLI configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliConfig {
    /// Connection settings.
    #[serde(default)]
    pub client: ClientConfig,

    /// Channels to subscribe to on start.
    #[serde(default)]
    pub channels: Vec<String>,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Serve Prometheus metrics.
    #[serde(default)]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl CliConfig {
    /// Load configuration from `path`, or from the first default location
    /// that exists, then apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if `path` does not exist, or a file or variable
    /// cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => {
                anyhow::ensure!(path.exists(), "Config file not found: {}", path.display());
                Some(path.to_path_buf())
            }
            None => find_config_file(),
        };
        Self::load_layered(file.as_deref(), ENV_PREFIX)
    }

    fn load_layered(file: Option<&Path>, env_prefix: &str) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(file) = file {
            tracing::debug!(path = %file.display(), "Loading config file");
            builder = builder.add_source(config::File::from(file).format(config::FileFormat::Toml));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(env_prefix)
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("channels")
                .try_parsing(true),
        );

        let source = match file {
            Some(file) => file.display().to_string(),
            None => "environment".to_string(),
        };
        builder
            .build()
            .and_then(config::Config::try_deserialize)
            .with_context(|| format!("Failed to load configuration from {source}"))
    }

    /// Append channels not already configured.
    pub fn add_channels(&mut self, channels: impl IntoIterator<Item = String>) {
        for channel in channels {
            if !self.channels.contains(&channel) {
                self.channels.push(channel);
            }
        }
    }
}

fn find_config_file() -> Option<PathBuf> {
    CONFIG_PATHS
        .iter()
        .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
        .find(|path| path.exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_client::ReconnectPolicy;
    use std::io::Write;

    const NO_ENV: &str = "HERALD_TEST_UNSET";

    const SAMPLE: &str = r#"
        channels = ["orders", "private-alerts"]

        [client]
        app_key = "app-1"
        host = "rt.example.com"
        encryption_required = false
        transports = ["streaming", "polling"]
        reconnect_policy = "clear_history"
        auth_endpoint = "https://example.com/herald/auth"

        [metrics]
        enabled = true
        port = 9100
    "#;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = CliConfig::default();
        assert!(config.channels.is_empty());
        assert!(!config.metrics.enabled);
        assert_eq!(config.metrics.port, 9090);
        assert!(config.client.encryption_required);
    }

    #[test]
    fn test_config_from_toml() {
        let file = write_config(SAMPLE);
        let config = CliConfig::load_layered(Some(file.path()), NO_ENV).unwrap();

        assert_eq!(config.client.app_key, "app-1");
        assert_eq!(config.client.host.as_deref(), Some("rt.example.com"));
        assert!(!config.client.encryption_required);
        assert_eq!(config.client.reconnect_policy, ReconnectPolicy::ClearHistory);
        assert_eq!(config.client.transport_timeout_ms, 10_000);
        assert_eq!(config.channels, vec!["orders", "private-alerts"]);
        assert!(config.metrics.enabled);
        assert_eq!(config.metrics.port, 9100);
    }

    #[test]
    fn test_layered_matches_plain_toml() {
        let file = write_config(SAMPLE);
        let layered = CliConfig::load_layered(Some(file.path()), NO_ENV).unwrap();
        let plain: CliConfig = toml::from_str(SAMPLE).unwrap();

        assert_eq!(layered.client.app_key, plain.client.app_key);
        assert_eq!(layered.client.transports, plain.client.transports);
        assert_eq!(layered.channels, plain.channels);
        assert_eq!(layered.metrics.port, plain.metrics.port);
    }

    #[test]
    fn test_environment_overrides_file() {
        let file = write_config(SAMPLE);
        std::env::set_var("HERALD_ENVTEST_CLIENT__HOST", "override.example.com");
        std::env::set_var("HERALD_ENVTEST_CHANNELS", "a,b");

        let config = CliConfig::load_layered(Some(file.path()), "HERALD_ENVTEST").unwrap();

        std::env::remove_var("HERALD_ENVTEST_CLIENT__HOST");
        std::env::remove_var("HERALD_ENVTEST_CHANNELS");

        assert_eq!(config.client.host.as_deref(), Some("override.example.com"));
        assert_eq!(config.client.app_key, "app-1");
        assert_eq!(config.channels, vec!["a", "b"]);
    }

    #[test]
    fn test_cluster_from_file() {
        let file = write_config("[client]\napp_key = \"app-1\"\ncluster = \"eu\"\n");
        let config = CliConfig::load_layered(Some(file.path()), NO_ENV).unwrap();
        assert_eq!(config.client.cluster.as_deref(), Some("eu"));
        assert_eq!(config.client.resolved_host(), "ws-eu.herald.io");
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(CliConfig::load(Some(&dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn test_bad_file_mentions_path() {
        let file = write_config("channels = 7");
        let err = CliConfig::load_layered(Some(file.path()), NO_ENV).unwrap_err();
        assert!(err.to_string().contains(&file.path().display().to_string()));
    }

    #[test]
    fn test_add_channels_skips_duplicates() {
        let mut config = CliConfig::default();
        config.channels.push("orders".into());
        config.add_channels(["orders".to_string(), "news".to_string()]);
        assert_eq!(config.channels, vec!["orders", "news"]);
    }
}
