use std::{
    collections::{BTreeMap, HashSet},
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::{info, warn};

use crate::journal::JournalSettings;
use crate::poller::InstanceTarget;
use crate::repository::HistorySettings;
use crate::waits::{HISTORY_SLOTS, WaitMapping};

const DEFAULT_CONFIG_PATH: &str = "/config/waitmon.yaml";

/// Top-level configuration for the waitmon agent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub journal: JournalConfig,
    #[serde(default)]
    pub waits: WaitsConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub timeouts: StatementTimeouts,
}

/// One monitored server. The connection string is read from `connection_env`.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    pub key: String,
    pub connection_env: String,
    #[serde(default = "default_true")]
    pub polling: bool,
    /// Only present to reject connection strings written into YAML.
    #[serde(default)]
    pub dsn: String,
}

/// Per-instance sampling schedule.
#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    #[serde(
        default = "PollingConfig::default_sample_interval",
        with = "humantime_serde"
    )]
    pub sample_interval: Duration,
    #[serde(
        default = "PollingConfig::default_emit_interval",
        with = "humantime_serde"
    )]
    pub emit_interval: Duration,
    /// Delay between failed connection attempts.
    #[serde(
        default = "PollingConfig::default_retry_interval",
        with = "humantime_serde"
    )]
    pub retry_interval: Duration,
    /// Emission runs this far behind sampling.
    #[serde(
        default = "PollingConfig::default_emit_offset",
        with = "humantime_serde"
    )]
    pub emit_offset: Duration,
}

impl PollingConfig {
    const fn default_sample_interval() -> Duration {
        Duration::from_secs(1)
    }

    const fn default_emit_interval() -> Duration {
        Duration::from_secs(60)
    }

    const fn default_retry_interval() -> Duration {
        Duration::from_secs(10)
    }

    const fn default_emit_offset() -> Duration {
        Duration::from_millis(500)
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            sample_interval: Self::default_sample_interval(),
            emit_interval: Self::default_emit_interval(),
            retry_interval: Self::default_retry_interval(),
            emit_offset: Self::default_emit_offset(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "HistoryConfig::default_capacity")]
    pub capacity: usize,
    #[serde(default = "HistoryConfig::default_lookback", with = "humantime_serde")]
    pub lookback: Duration,
    #[serde(
        default = "HistoryConfig::default_replay_timeout",
        with = "humantime_serde"
    )]
    pub replay_timeout: Duration,
}

impl HistoryConfig {
    const fn default_capacity() -> usize {
        HISTORY_SLOTS
    }

    const fn default_lookback() -> Duration {
        Duration::from_secs(60 * 60)
    }

    const fn default_replay_timeout() -> Duration {
        Duration::from_secs(30)
    }

    pub fn settings(&self) -> HistorySettings {
        HistorySettings {
            capacity: self.capacity,
            lookback: self.lookback,
            replay_timeout: self.replay_timeout,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity: Self::default_capacity(),
            lookback: Self::default_lookback(),
            replay_timeout: Self::default_replay_timeout(),
        }
    }
}

/// On-disk journal of emitted snapshots.
#[derive(Debug, Clone, Deserialize)]
pub struct JournalConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "JournalConfig::default_dir")]
    pub dir: PathBuf,
    #[serde(default = "JournalConfig::default_prefix")]
    pub prefix: String,
    #[serde(default = "JournalConfig::default_extension")]
    pub extension: String,
    #[serde(
        default = "JournalConfig::default_rotate_every",
        with = "humantime_serde"
    )]
    pub rotate_every: Duration,
    #[serde(default = "JournalConfig::default_retain", with = "humantime_serde")]
    pub retain: Duration,
}

impl JournalConfig {
    fn default_dir() -> PathBuf {
        PathBuf::from("cache")
    }

    fn default_prefix() -> String {
        "w2".to_string()
    }

    fn default_extension() -> String {
        "ndjson".to_string()
    }

    const fn default_rotate_every() -> Duration {
        Duration::from_secs(10 * 60)
    }

    const fn default_retain() -> Duration {
        Duration::from_secs(85 * 60)
    }

    pub fn settings(&self) -> JournalSettings {
        JournalSettings {
            dir: self.dir.clone(),
            prefix: self.prefix.clone(),
            extension: self.extension.clone(),
            rotate_every: self.rotate_every,
            retain: self.retain,
        }
    }
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: Self::default_dir(),
            prefix: Self::default_prefix(),
            extension: Self::default_extension(),
            rotate_every: Self::default_rotate_every(),
            retain: Self::default_retain(),
        }
    }
}

/// Wait types dropped or renamed before accumulation.
#[derive(Debug, Clone, Deserialize)]
pub struct WaitsConfig {
    #[serde(default = "WaitsConfig::default_excluded")]
    pub excluded: Vec<String>,
    #[serde(default)]
    pub mapped: BTreeMap<String, String>,
}

impl WaitsConfig {
    fn default_excluded() -> Vec<String> {
        vec!["Timeout:PgSleep".to_string(), "Client:ClientRead".to_string()]
    }

    pub fn mapping(&self) -> WaitMapping {
        WaitMapping::new(self.excluded.iter().cloned(), self.mapped.clone())
    }
}

impl Default for WaitsConfig {
    fn default() -> Self {
        Self {
            excluded: Self::default_excluded(),
            mapped: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "HttpConfig::default_bind")]
    pub bind: String,
}

impl HttpConfig {
    fn default_bind() -> String {
        "0.0.0.0:8182".to_string()
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: Self::default_bind(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Postgres session timeouts applied to every monitoring connection.
#[derive(Debug, Clone, Deserialize)]
pub struct StatementTimeouts {
    #[serde(default = "StatementTimeouts::default_statement_timeout_ms")]
    pub statement_timeout_ms: u64,
    #[serde(default = "StatementTimeouts::default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl StatementTimeouts {
    const fn default_statement_timeout_ms() -> u64 {
        3_000
    }

    const fn default_lock_timeout_ms() -> u64 {
        1_000
    }
}

impl Default for StatementTimeouts {
    fn default() -> Self {
        Self {
            statement_timeout_ms: Self::default_statement_timeout_ms(),
            lock_timeout_ms: Self::default_lock_timeout_ms(),
        }
    }
}

/// Read the YAML file named by `path`, `WAITMON_CONFIG` or the default location.
/// A missing file yields the built-in defaults.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let target_path = if let Some(path) = path {
        path.to_path_buf()
    } else if let Ok(env_path) = env::var("WAITMON_CONFIG") {
        PathBuf::from(env_path)
    } else {
        PathBuf::from(DEFAULT_CONFIG_PATH)
    };

    let mut config = match try_parse_file(&target_path)? {
        Some(cfg) => {
            info!(path = %target_path.display(), "loaded configuration");
            cfg
        }
        None => {
            warn!(path = %target_path.display(), "no config file; running with defaults");
            AppConfig::default()
        }
    };

    enforce_yaml_policy(&config)?;
    apply_env_overrides(&mut config);
    validate(&config)?;
    Ok(config)
}

pub fn parse_config(raw: &str) -> Result<AppConfig> {
    let config: AppConfig = serde_yaml::from_str(raw).context("failed to parse YAML config")?;
    enforce_yaml_policy(&config)?;
    validate(&config)?;
    Ok(config)
}

fn try_parse_file(path: &Path) -> Result<Option<AppConfig>> {
    match fs::read_to_string(path) {
        Ok(raw) => {
            let cfg = serde_yaml::from_str(&raw)
                .with_context(|| format!("failed to parse YAML config at {}", path.display()))?;
            Ok(Some(cfg))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => {
            Err(err).with_context(|| format!("failed to read config file at {}", path.display()))
        }
    }
}

fn enforce_yaml_policy(config: &AppConfig) -> Result<()> {
    for instance in &config.instances {
        if !instance.dsn.trim().is_empty() {
            bail!(
                "Remove `dsn` from instance `{}` in the waitmon YAML config; set the connection string via the {} environment variable instead.",
                instance.key,
                instance.connection_env
            );
        }
    }
    Ok(())
}

fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(dir) = env::var("WAITMON_JOURNAL_DIR") {
        if !dir.trim().is_empty() {
            config.journal.dir = PathBuf::from(dir);
        }
    }
}

fn validate(config: &AppConfig) -> Result<()> {
    let mut seen = HashSet::new();
    for instance in &config.instances {
        if instance.key.trim().is_empty() {
            bail!("instance keys must not be empty");
        }
        if !seen.insert(instance.key.as_str()) {
            bail!("instance key `{}` is configured twice", instance.key);
        }
        if instance.connection_env.trim().is_empty() {
            bail!("instance `{}` has no connection_env", instance.key);
        }
    }
    if config.polling.sample_interval.is_zero() || config.polling.emit_interval.is_zero() {
        bail!("polling intervals must be greater than zero");
    }
    if config.journal.enabled
        && (config.journal.prefix.is_empty() || config.journal.extension.is_empty())
    {
        bail!("journal prefix and extension must not be empty");
    }
    Ok(())
}

/// Resolve each instance's connection string from its environment variable.
pub fn resolve_instances(config: &AppConfig) -> Result<Vec<InstanceTarget>> {
    resolve_instances_with(config, |name| env::var(name))
}

pub fn resolve_instances_with<F>(config: &AppConfig, lookup: F) -> Result<Vec<InstanceTarget>>
where
    F: Fn(&str) -> Result<String, env::VarError>,
{
    config
        .instances
        .iter()
        .map(|instance| -> Result<InstanceTarget> {
            let connection_string = match lookup(&instance.connection_env) {
                Ok(value) if !value.trim().is_empty() => value,
                Ok(_) => bail!(
                    "Environment variable {} for instance `{}` is set but empty; populate it in your .env file.",
                    instance.connection_env,
                    instance.key
                ),
                Err(env::VarError::NotPresent) => bail!(
                    "Missing connection string for instance `{}`. Set the {} environment variable (see .env.sample). Secrets must not be stored in YAML.",
                    instance.key,
                    instance.connection_env
                ),
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("failed to read {}", instance.connection_env)
                    });
                }
            };
            Ok(InstanceTarget {
                key: instance.key.clone(),
                connection_string,
                polling: instance.polling,
            })
        })
        .collect()
}
