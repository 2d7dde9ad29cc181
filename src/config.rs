//! Daemon configuration.
//!
//! Loaded from a YAML file (default `~/.incus-azure-pipelines/config.yaml`),
//! validated up front, with per-pool PATs optionally resolved from the OS
//! keyring when the daemon starts.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

/// Keyring service name PATs are stored under; the account is the pool name.
pub const KEYRING_SERVICE: &str = "incus-azure-pipelines";

/// Maximum agents per pool.
pub const MAX_AGENT_COUNT: usize = 64;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("error reading config at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("error parsing config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Validation(String),

    #[error("pool {pool:?}: no PAT configured and keyring lookup failed: {source}")]
    Keyring {
        pool: String,
        source: keyring::Error,
    },
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CliConfig {
    /// Agent pools to manage.
    #[serde(default)]
    pub pools: Vec<PoolConfig>,

    /// Port serving Prometheus metrics.
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Background process settings.
    #[serde(default)]
    pub daemon: DaemonConfig,
}

/// Per-pool configuration. Immutable for the lifetime of the pool.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    /// Pool name, unique across pools; also the agent-container name prefix.
    pub name: String,

    /// Number of agents to keep running (1..=64).
    pub agent_count: usize,

    /// Prefix for the agent label registered with Azure. Defaults to the
    /// OS hostname.
    #[serde(default)]
    pub agent_prefix: Option<String>,

    pub azure: AzureConfig,

    pub incus: IncusConfig,
}

/// Azure DevOps settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureConfig {
    /// Personal access token used to register agents. When empty, looked
    /// up from the OS keyring at daemon start.
    #[serde(default)]
    pub pat: String,

    /// Organization URL, e.g. `https://dev.azure.com/myorg`.
    pub url: String,
}

/// Incus settings for a pool.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncusConfig {
    /// Image alias agent containers are cloned from.
    pub image: String,

    /// Incus project to run the pool in. Empty means the default project.
    #[serde(default)]
    pub project_name: String,

    /// Max cores per agent; sets a percentage-based CPU allowance. 0 = unset.
    #[serde(default)]
    pub max_cores: u32,

    /// Memory limit per agent in GiB. 0 = unset.
    #[serde(default)]
    pub max_ram_in_gb: u32,

    /// Size of the tmpfs mounted at /tmp in each agent, in GiB. 0 = none.
    #[serde(default)]
    pub tmpfs_size_in_gb: u32,

    /// How long after creation the reaper leaves an agent alone.
    #[serde(default, with = "humantime_serde")]
    pub startup_grace_period: Duration,
}

/// Settings for the daemon background loops.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonConfig {
    /// How often to reconcile expected vs actual agent count.
    #[serde(default = "default_reconcile_interval", with = "humantime_serde")]
    pub reconcile_interval: Duration,

    /// How often to check for and clean up stale agents.
    #[serde(default = "default_reaper_interval", with = "humantime_serde")]
    pub reaper_interval: Duration,

    /// Event listener retry behavior.
    #[serde(default)]
    pub listener: ListenerConfig,
}

/// Event listener retry settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerConfig {
    /// Initial delay between reconnect attempts.
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,

    /// Cap on the reconnect delay.
    #[serde(default = "default_max_retry_delay", with = "humantime_serde")]
    pub max_retry_delay: Duration,
}

fn default_metrics_port() -> u16 {
    9922
}

fn default_reconcile_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_reaper_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_retry_delay() -> Duration {
    Duration::from_secs(60)
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: default_reconcile_interval(),
            reaper_interval: default_reaper_interval(),
            listener: ListenerConfig::default(),
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            retry_delay: default_retry_delay(),
            max_retry_delay: default_max_retry_delay(),
        }
    }
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// Host-label form: alphanumerics and inner hyphens, as accepted for
/// container names.
fn host_label_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]*[A-Za-z0-9])?$").unwrap())
}

fn absolute_url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^https?://[^\s/]+").unwrap())
}

impl CliConfig {
    /// Parse and validate a YAML config document.
    pub fn parse(data: &str) -> Result<Self, ConfigError> {
        let config: CliConfig = serde_yaml::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    /// Load, parse, and validate the config file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&data)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for pool in &self.pools {
            if !seen.insert(pool.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate pool name {:?}",
                    pool.name
                )));
            }
            pool.validate()?;
        }
        Ok(())
    }

    /// Fill in empty PATs from the OS keyring. A missing secret is a
    /// startup error.
    pub fn resolve_pats(&mut self) -> Result<(), ConfigError> {
        for pool in &mut self.pools {
            if !pool.azure.pat.is_empty() {
                continue;
            }
            pool.azure.pat = lookup_pat(&pool.name).map_err(|source| ConfigError::Keyring {
                pool: pool.name.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

impl PoolConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !host_label_re().is_match(&self.name) {
            return Err(ConfigError::Validation(format!(
                "pool name {:?} is not a valid host label",
                self.name
            )));
        }
        if self.agent_count < 1 || self.agent_count > MAX_AGENT_COUNT {
            return Err(ConfigError::Validation(format!(
                "pool {:?}: agentCount must be between 1 and {}, got {}",
                self.name, MAX_AGENT_COUNT, self.agent_count
            )));
        }
        if let Some(prefix) = &self.agent_prefix {
            if !host_label_re().is_match(prefix) {
                return Err(ConfigError::Validation(format!(
                    "pool {:?}: agentPrefix {:?} is not a valid host label",
                    self.name, prefix
                )));
            }
        }
        if !absolute_url_re().is_match(&self.azure.url) {
            return Err(ConfigError::Validation(format!(
                "pool {:?}: azure.url {:?} is not an absolute http(s) URL",
                self.name, self.azure.url
            )));
        }
        if self.incus.image.is_empty() {
            return Err(ConfigError::Validation(format!(
                "pool {:?}: incus.image is required",
                self.name
            )));
        }
        Ok(())
    }
}

/// Read a pool's PAT from the OS keyring.
pub fn lookup_pat(pool: &str) -> Result<String, keyring::Error> {
    keyring::Entry::new(KEYRING_SERVICE, pool)?.get_password()
}

/// Store a pool's PAT in the OS keyring.
pub fn store_pat(pool: &str, pat: &str) -> Result<(), keyring::Error> {
    keyring::Entry::new(KEYRING_SERVICE, pool)?.set_password(pat)
}

/// The default config file path, under the user's home directory.
pub fn default_config_path() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".incus-azure-pipelines").join("config.yaml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
pools:
  - name: my-pool
    agentCount: 2
    azure:
      pat: "test-token"
      url: "https://dev.azure.com/myorg"
    incus:
      image: "ubuntu-agent"
"#
    }

    #[test]
    fn parses_valid_single_pool() {
        let config = CliConfig::parse(minimal_yaml()).unwrap();
        assert_eq!(config.pools.len(), 1);
        assert_eq!(config.pools[0].name, "my-pool");
        assert_eq!(config.pools[0].agent_count, 2);
        assert_eq!(config.pools[0].azure.pat, "test-token");
        assert_eq!(config.pools[0].incus.image, "ubuntu-agent");
    }

    #[test]
    fn defaults_are_applied() {
        let config = CliConfig::parse(minimal_yaml()).unwrap();
        assert_eq!(config.metrics_port, 9922);
        assert_eq!(config.daemon.reconcile_interval, Duration::from_secs(5));
        assert_eq!(config.daemon.reaper_interval, Duration::from_secs(30));
        assert_eq!(config.daemon.listener.retry_delay, Duration::from_secs(1));
        assert_eq!(
            config.daemon.listener.max_retry_delay,
            Duration::from_secs(60)
        );
        assert_eq!(config.pools[0].incus.startup_grace_period, Duration::ZERO);
        assert_eq!(config.pools[0].incus.max_cores, 0);
    }

    #[test]
    fn parses_durations_and_overrides() {
        let yaml = r#"
metricsPort: 8080
daemon:
  reconcileInterval: 10s
  reaperInterval: 2m
  listener:
    retryDelay: 500ms
    maxRetryDelay: 30s
pools:
  - name: my-pool
    agentCount: 1
    azure:
      pat: "token"
      url: "https://dev.azure.com/org"
    incus:
      image: "img"
      startupGracePeriod: 5m
      maxCores: 4
"#;
        let config = CliConfig::parse(yaml).unwrap();
        assert_eq!(config.metrics_port, 8080);
        assert_eq!(config.daemon.reconcile_interval, Duration::from_secs(10));
        assert_eq!(config.daemon.reaper_interval, Duration::from_secs(120));
        assert_eq!(
            config.daemon.listener.retry_delay,
            Duration::from_millis(500)
        );
        assert_eq!(
            config.pools[0].incus.startup_grace_period,
            Duration::from_secs(300)
        );
        assert_eq!(config.pools[0].incus.max_cores, 4);
    }

    #[test]
    fn rejects_duplicate_pool_names() {
        let yaml = r#"
pools:
  - name: my-pool
    agentCount: 1
    azure: { pat: "t", url: "https://dev.azure.com/a" }
    incus: { image: "img" }
  - name: my-pool
    agentCount: 1
    azure: { pat: "t", url: "https://dev.azure.com/b" }
    incus: { image: "img" }
"#;
        let err = CliConfig::parse(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate pool name"));
    }

    #[test]
    fn rejects_bad_agent_count() {
        for count in [0, 65] {
            let yaml = format!(
                r#"
pools:
  - name: my-pool
    agentCount: {count}
    azure: {{ pat: "t", url: "https://dev.azure.com/a" }}
    incus: {{ image: "img" }}
"#
            );
            let err = CliConfig::parse(&yaml).unwrap_err();
            assert!(err.to_string().contains("agentCount"), "{err}");
        }
    }

    #[test]
    fn rejects_invalid_names_and_urls() {
        let bad_name = r#"
pools:
  - name: "has spaces"
    agentCount: 1
    azure: { pat: "t", url: "https://dev.azure.com/a" }
    incus: { image: "img" }
"#;
        assert!(CliConfig::parse(bad_name).is_err());

        let bad_url = r#"
pools:
  - name: my-pool
    agentCount: 1
    azure: { pat: "t", url: "dev.azure.com/a" }
    incus: { image: "img" }
"#;
        assert!(CliConfig::parse(bad_url).is_err());

        let bad_prefix = r#"
pools:
  - name: my-pool
    agentCount: 1
    agentPrefix: "-leading"
    azure: { pat: "t", url: "https://dev.azure.com/a" }
    incus: { image: "img" }
"#;
        assert!(CliConfig::parse(bad_prefix).is_err());
    }

    #[test]
    fn missing_required_fields_fail_parse() {
        let yaml = r#"
pools:
  - name: my-pool
    azure: { url: "https://dev.azure.com/a" }
    incus: { image: "img" }
"#;
        assert!(matches!(
            CliConfig::parse(yaml),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn host_label_regex_table() {
        let cases = [
            ("azp-agent", true),
            ("a", true),
            ("A1-b2", true),
            ("-leading", false),
            ("trailing-", false),
            ("has.dot", false),
            ("", false),
        ];
        for (input, expect) in cases {
            assert_eq!(host_label_re().is_match(input), expect, "{input:?}");
        }
    }
}
