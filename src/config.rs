use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::{info, warn};

use crate::model::ProbeKind;

const DEFAULT_CONFIG_PATH: &str = "/config/dbpulse.yaml";

/// Top-level configuration for one monitored target.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "AppConfig::default_target")]
    pub target: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub dsn: String,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub correlation: CorrelationConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
    #[serde(default)]
    pub annotator: AnnotatorConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub timeouts: StatementTimeouts,
}

impl AppConfig {
    fn default_target() -> String {
        "local".into()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            target: Self::default_target(),
            host: None,
            dsn: String::new(),
            source: SourceConfig::default(),
            schedule: ScheduleConfig::default(),
            correlation: CorrelationConfig::default(),
            alerts: AlertConfig::default(),
            annotator: AnnotatorConfig::default(),
            sink: SinkConfig::default(),
            http: HttpConfig::default(),
            timeouts: StatementTimeouts::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    /// Replay a JSONL file of captured probe rows.
    Sample,
    Postgres,
}

/// Where probe rows come from and which probes run.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "SourceConfig::default_mode")]
    pub mode: SourceMode,
    #[serde(default = "SourceConfig::default_sample_path")]
    pub sample_path: PathBuf,
    #[serde(default = "SourceConfig::default_probes")]
    pub probes: Vec<ProbeKind>,
}

impl SourceConfig {
    const fn default_mode() -> SourceMode {
        SourceMode::Sample
    }

    fn default_sample_path() -> PathBuf {
        PathBuf::from("sample_inputs/sample_metrics.jsonl")
    }

    fn default_probes() -> Vec<ProbeKind> {
        ProbeKind::ALL.to_vec()
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            mode: Self::default_mode(),
            sample_path: Self::default_sample_path(),
            probes: Self::default_probes(),
        }
    }
}

/// Cycle schedule (with friendly duration parsing).
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "ScheduleConfig::default_interval", with = "humantime_serde")]
    pub interval: Duration,
    /// Budget for each individual probe; a probe exceeding it counts as failed.
    #[serde(
        default = "ScheduleConfig::default_probe_timeout",
        with = "humantime_serde"
    )]
    pub probe_timeout: Duration,
}

impl ScheduleConfig {
    const fn default_interval() -> Duration {
        Duration::from_secs(60)
    }

    const fn default_probe_timeout() -> Duration {
        Duration::from_secs(10)
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval: Self::default_interval(),
            probe_timeout: Self::default_probe_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorrelationConfig {
    /// Consecutive cycles an entry may go unseen before it is evicted.
    #[serde(default = "CorrelationConfig::default_stale_grace_cycles")]
    pub stale_grace_cycles: u32,
}

impl CorrelationConfig {
    const fn default_stale_grace_cycles() -> u32 {
        1
    }
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            stale_grace_cycles: Self::default_stale_grace_cycles(),
        }
    }
}

/// Rule file location and alert lifecycle policy.
#[derive(Debug, Clone, Deserialize)]
pub struct AlertConfig {
    #[serde(default = "AlertConfig::default_rules_path")]
    pub rules_path: PathBuf,
    #[serde(
        default = "AlertConfig::default_reannounce_interval",
        with = "humantime_serde"
    )]
    pub reannounce_interval: Option<Duration>,
    #[serde(default = "AlertConfig::default_resolved_retention_cycles")]
    pub resolved_retention_cycles: u32,
}

impl AlertConfig {
    fn default_rules_path() -> PathBuf {
        PathBuf::from("alerting/rules.yaml")
    }

    const fn default_reannounce_interval() -> Option<Duration> {
        Some(Duration::from_secs(3_600))
    }

    const fn default_resolved_retention_cycles() -> u32 {
        1
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            rules_path: Self::default_rules_path(),
            reannounce_interval: Self::default_reannounce_interval(),
            resolved_retention_cycles: Self::default_resolved_retention_cycles(),
        }
    }
}

/// Optional LLM enrichment of emitted alerts (Ollama-compatible endpoint).
#[derive(Debug, Clone, Deserialize)]
pub struct AnnotatorConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "AnnotatorConfig::default_url")]
    pub url: String,
    #[serde(default = "AnnotatorConfig::default_model")]
    pub model: String,
    #[serde(default = "AnnotatorConfig::default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Upper bound for annotating all alerts of one cycle.
    #[serde(default = "AnnotatorConfig::default_deadline", with = "humantime_serde")]
    pub deadline: Duration,
    #[serde(default = "AnnotatorConfig::default_max_concurrency")]
    pub max_concurrency: usize,
}

impl AnnotatorConfig {
    fn default_url() -> String {
        "http://localhost:11434".to_string()
    }

    fn default_model() -> String {
        "llama3.2".to_string()
    }

    const fn default_timeout() -> Duration {
        Duration::from_secs(5)
    }

    const fn default_deadline() -> Duration {
        Duration::from_secs(10)
    }

    const fn default_max_concurrency() -> usize {
        4
    }
}

impl Default for AnnotatorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: Self::default_url(),
            model: Self::default_model(),
            timeout: Self::default_timeout(),
            deadline: Self::default_deadline(),
            max_concurrency: Self::default_max_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkMode {
    Memory,
    Elastic,
}

/// Time-series store settings. Credentials only come from the environment.
#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    #[serde(default = "SinkConfig::default_mode")]
    pub mode: SinkMode,
    #[serde(default = "SinkConfig::default_url")]
    pub url: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(skip)]
    pub password: Option<String>,
    #[serde(skip)]
    pub api_key: Option<String>,
    #[serde(default = "SinkConfig::default_metrics_index")]
    pub metrics_index: String,
    #[serde(default = "SinkConfig::default_alerts_index")]
    pub alerts_index: String,
    #[serde(default = "SinkConfig::default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "SinkConfig::default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl SinkConfig {
    const fn default_mode() -> SinkMode {
        SinkMode::Memory
    }

    fn default_url() -> String {
        "http://localhost:9200".to_string()
    }

    fn default_metrics_index() -> String {
        "dbpulse-metrics".to_string()
    }

    fn default_alerts_index() -> String {
        "dbpulse-alerts".to_string()
    }

    const fn default_batch_size() -> usize {
        200
    }

    const fn default_request_timeout() -> Duration {
        Duration::from_secs(15)
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            mode: Self::default_mode(),
            url: Self::default_url(),
            user: None,
            password: None,
            api_key: None,
            metrics_index: Self::default_metrics_index(),
            alerts_index: Self::default_alerts_index(),
            batch_size: Self::default_batch_size(),
            request_timeout: Self::default_request_timeout(),
        }
    }
}

/// HTTP listener configuration (bind address).
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "HttpConfig::default_bind")]
    pub bind: String,
}

impl HttpConfig {
    fn default_bind() -> String {
        "0.0.0.0:8181".to_string()
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: Self::default_bind(),
        }
    }
}

/// Postgres session timeouts applied to the monitoring connection.
#[derive(Debug, Clone, Deserialize)]
pub struct StatementTimeouts {
    #[serde(default = "StatementTimeouts::default_statement_timeout_ms")]
    pub statement_timeout_ms: u64,
    #[serde(default = "StatementTimeouts::default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl StatementTimeouts {
    const fn default_statement_timeout_ms() -> u64 {
        5_000
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

/// Load configuration from YAML disk file, falling back to defaults + env overrides.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let target_path = if let Some(path) = path {
        path.to_path_buf()
    } else if let Ok(env_path) = env::var("DBPULSE_CONFIG") {
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
            warn!(path = %target_path.display(), "config file not found; using built-in defaults");
            AppConfig::default()
        }
    };

    enforce_yaml_policy(&config)?;
    apply_env_overrides(&mut config)?;
    validate(&config)?;
    ensure_required_secrets(&config)?;
    Ok(config)
}

fn try_parse_file(path: &Path) -> Result<Option<AppConfig>> {
    match fs::read_to_string(path) {
        Ok(raw) => parse_config(&raw)
            .with_context(|| format!("failed to parse YAML config at {}", path.display()))
            .map(Some),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => {
            Err(err).with_context(|| format!("failed to read config file at {}", path.display()))
        }
    }
}

pub fn parse_config(raw: &str) -> Result<AppConfig> {
    Ok(serde_yaml::from_str(raw)?)
}

fn enforce_yaml_policy(config: &AppConfig) -> Result<()> {
    if !config.dsn.trim().is_empty() {
        bail!(
            "Remove `dsn` from the dbpulse YAML config; set the connection string via the DBPULSE_DSN environment variable."
        );
    }
    Ok(())
}

fn apply_env_overrides(config: &mut AppConfig) -> Result<()> {
    if let Ok(target) = env::var("DBPULSE_TARGET") {
        if !target.is_empty() {
            config.target = target;
        }
    }

    match env::var("DBPULSE_DSN") {
        Ok(dsn) => {
            if dsn.trim().is_empty() {
                bail!(
                    "Environment variable DBPULSE_DSN is set but empty; populate it in your .env file."
                );
            }
            config.dsn = dsn;
        }
        Err(env::VarError::NotPresent) => {}
        Err(err) => return Err(err.into()),
    };

    config.sink.password = non_empty_env("DBPULSE_ELASTIC_PASSWORD");
    config.sink.api_key = non_empty_env("DBPULSE_ELASTIC_API_KEY");

    Ok(())
}

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn validate(config: &AppConfig) -> Result<()> {
    if config.source.probes.is_empty() {
        bail!("source.probes must list at least one probe");
    }
    if config.correlation.stale_grace_cycles == 0 {
        bail!("correlation.stale_grace_cycles must be at least 1");
    }
    if config.alerts.resolved_retention_cycles == 0 {
        bail!("alerts.resolved_retention_cycles must be at least 1");
    }
    if config.annotator.max_concurrency == 0 {
        bail!("annotator.max_concurrency must be at least 1");
    }
    if config.sink.batch_size == 0 {
        bail!("sink.batch_size must be at least 1");
    }
    if config.schedule.interval.is_zero() {
        bail!("schedule.interval must be greater than zero");
    }
    Ok(())
}

fn ensure_required_secrets(config: &AppConfig) -> Result<()> {
    if config.source.mode == SourceMode::Postgres && config.dsn.trim().is_empty() {
        bail!(
            "Missing database DSN. Set the DBPULSE_DSN environment variable. Secrets must not be stored in YAML."
        );
    }
    Ok(())
}
