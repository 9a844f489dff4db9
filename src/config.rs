use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::store::query::AggregateFn;

/// Top-level configuration for the cpuwatch agent.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Value of the host tag written with every sample and used to filter
    /// aggregation queries. Default: "localhost".
    #[serde(default = "default_host")]
    pub host: String,

    /// Time-series store connection.
    #[serde(default)]
    pub store: StoreConfig,

    /// CPU sampling configuration.
    #[serde(default)]
    pub sampling: SamplingConfig,

    /// Alert debounce configuration.
    #[serde(default)]
    pub alert: AlertConfig,

    /// Mail transport for alert delivery.
    #[serde(default)]
    pub smtp: SmtpConfig,

    /// Window aggregation configuration.
    #[serde(default)]
    pub aggregation: AggregationConfig,

    /// Snapshot file configuration.
    #[serde(default)]
    pub snapshot: SnapshotConfig,

    /// External forecaster configuration.
    #[serde(default)]
    pub forecast: ForecastConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// InfluxDB v2 connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Base URL (e.g., "http://localhost:8086").
    #[serde(default)]
    pub url: String,

    /// API token.
    #[serde(default)]
    pub token: String,

    /// Organization name.
    #[serde(default)]
    pub org: String,

    /// Bucket samples are written to and queried from.
    #[serde(default)]
    pub bucket: String,

    /// Request timeout. Default: 10s.
    #[serde(default = "default_store_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Gzip-compress write request bodies. Default: false.
    #[serde(default)]
    pub gzip: bool,
}

/// CPU sampling configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SamplingConfig {
    /// Interval between samples. Default: 10s.
    #[serde(default = "default_sampling_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Measurement name samples are written under. Default: "cpu_usage".
    #[serde(default = "default_measurement")]
    pub measurement: String,

    /// Field name holding the utilization percentage. Default: "percent".
    #[serde(default = "default_field")]
    pub field: String,
}

/// Debounce policy selecting how repeated threshold breaches alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebouncePolicy {
    /// Fire once utilization stayed above threshold for `sustain`, then once
    /// per further `sustain` while it stays high.
    Sustained,
    /// Fire on any single sample above threshold, at most once per `cooldown`.
    Cooldown,
}

impl Default for DebouncePolicy {
    fn default() -> Self {
        Self::Sustained
    }
}

/// Alert debounce configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AlertConfig {
    /// Utilization percentage above which a sample counts as high.
    /// Zero means unset, which disables alerting.
    #[serde(default)]
    pub threshold: f64,

    /// Debounce policy. Default: sustained.
    #[serde(default)]
    pub policy: DebouncePolicy,

    /// How long utilization must stay high before firing. Default: 30s.
    #[serde(default = "default_sustain", with = "humantime_serde")]
    pub sustain: Duration,

    /// Minimum gap between alerts under the cooldown policy. Default: 5m.
    #[serde(default = "default_cooldown", with = "humantime_serde")]
    pub cooldown: Duration,

    /// Subject line of alert mails.
    #[serde(default = "default_alert_subject")]
    pub subject: String,
}

/// How the SMTP connection is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmtpSecurity {
    /// Plain connection upgraded with STARTTLS.
    Starttls,
    /// Implicit TLS (SMTPS).
    Tls,
    /// Unencrypted; only for local relays and tests.
    Plain,
}

impl Default for SmtpSecurity {
    fn default() -> Self {
        Self::Starttls
    }
}

/// Mail transport configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    /// Relay host name.
    #[serde(default)]
    pub host: String,

    /// Relay port. Default: 587.
    #[serde(default = "default_smtp_port")]
    pub port: u16,

    /// Login user name, also used as sender address unless `from` is set.
    #[serde(default)]
    pub username: String,

    /// Login password.
    #[serde(default)]
    pub password: String,

    /// Sender address. Default: the username.
    #[serde(default)]
    pub from: String,

    /// Alert recipient address.
    #[serde(default)]
    pub recipient: String,

    /// Connection security. Default: starttls.
    #[serde(default)]
    pub security: SmtpSecurity,

    /// Transport timeout. Default: 30s.
    #[serde(default = "default_smtp_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Window aggregation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    /// Interval between aggregation cycles. Default: 30s.
    #[serde(default = "default_aggregation_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// How far back each query looks. Default: 10m.
    #[serde(default = "default_aggregation_range", with = "humantime_serde")]
    pub range: Duration,

    /// Bucket width of the aggregate window. Default: 30s.
    #[serde(default = "default_aggregation_every", with = "humantime_serde")]
    pub every: Duration,

    /// Aggregate function applied per bucket. Default: mean.
    #[serde(default)]
    pub function: AggregateFn,

    /// Print each aggregated record to stdout. Default: true.
    #[serde(default = "default_true")]
    pub print_records: bool,
}

/// Snapshot file configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotConfig {
    /// Path the raw query output is written to. Empty disables snapshots
    /// and forecasting.
    #[serde(default)]
    pub path: PathBuf,

    /// Refresh the snapshot every aggregation cycle. Default: true.
    #[serde(default = "default_true")]
    pub refresh: bool,

    /// Command-line tool used to run the query. Default: "influx".
    #[serde(default = "default_snapshot_program")]
    pub program: String,

    /// Timeout for one refresh. Default: 30s.
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// External forecaster configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ForecastConfig {
    /// Run the forecaster after each aggregation cycle. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Forecaster program. Default: "cpuwatch-forecast".
    #[serde(default = "default_forecast_program")]
    pub program: String,

    /// Arguments placed before the snapshot path.
    #[serde(default)]
    pub args: Vec<String>,

    /// Timeout for one forecast. Default: 30s.
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics, /healthz and /window. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_store_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_sampling_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_measurement() -> String {
    "cpu_usage".to_string()
}

fn default_field() -> String {
    "percent".to_string()
}

fn default_sustain() -> Duration {
    Duration::from_secs(30)
}

fn default_cooldown() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_alert_subject() -> String {
    "High CPU Usage Alert".to_string()
}

fn default_smtp_port() -> u16 {
    587
}

fn default_smtp_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_aggregation_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_aggregation_range() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_aggregation_every() -> Duration {
    Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}

fn default_snapshot_program() -> String {
    "influx".to_string()
}

fn default_forecast_program() -> String {
    "cpuwatch-forecast".to_string()
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            host: default_host(),
            store: StoreConfig::default(),
            sampling: SamplingConfig::default(),
            alert: AlertConfig::default(),
            smtp: SmtpConfig::default(),
            aggregation: AggregationConfig::default(),
            snapshot: SnapshotConfig::default(),
            forecast: ForecastConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: String::new(),
            org: String::new(),
            bucket: String::new(),
            timeout: default_store_timeout(),
            gzip: false,
        }
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            interval: default_sampling_interval(),
            measurement: default_measurement(),
            field: default_field(),
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            threshold: 0.0,
            policy: DebouncePolicy::default(),
            sustain: default_sustain(),
            cooldown: default_cooldown(),
            subject: default_alert_subject(),
        }
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_smtp_port(),
            username: String::new(),
            password: String::new(),
            from: String::new(),
            recipient: String::new(),
            security: SmtpSecurity::default(),
            timeout: default_smtp_timeout(),
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            interval: default_aggregation_interval(),
            range: default_aggregation_range(),
            every: default_aggregation_every(),
            function: AggregateFn::default(),
            print_records: true,
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            refresh: true,
            program: default_snapshot_program(),
            timeout: default_command_timeout(),
        }
    }
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            program: default_forecast_program(),
            args: Vec::new(),
            timeout: default_command_timeout(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: default_health_addr(),
        }
    }
}

// --- Loading, environment overrides and validation ---

impl Config {
    /// Load configuration from an optional YAML file, apply environment
    /// overrides, and validate the result.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        cfg.apply_env(|key| std::env::var(key).ok())?;
        cfg.validate()?;

        Ok(cfg)
    }

    /// Parse a YAML configuration file without validating it.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Override fields from environment variables. Empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("INFLUXDB_URL") {
            self.store.url = v;
        }
        if let Some(v) = get("INFLUXDB_TOKEN") {
            self.store.token = v;
        }
        if let Some(v) = get("INFLUXDB_ORG") {
            self.store.org = v;
        }
        if let Some(v) = get("INFLUXDB_BUCKET") {
            self.store.bucket = v;
        }
        if let Some(v) = get("SMTP_HOST") {
            self.smtp.host = v;
        }
        if let Some(v) = get("SMTP_PORT") {
            self.smtp.port = v
                .trim()
                .parse()
                .with_context(|| format!("invalid SMTP_PORT: {v}"))?;
        }
        if let Some(v) = get("SMTP_USERNAME") {
            self.smtp.username = v;
        }
        if let Some(v) = get("SMTP_PASSWORD") {
            self.smtp.password = v;
        }
        if let Some(v) = get("ALERT_EMAIL") {
            self.smtp.recipient = v;
        }
        if let Some(v) = get("CPU_THRESHOLD") {
            self.alert.threshold = v
                .trim()
                .parse()
                .with_context(|| format!("invalid CPU_THRESHOLD: {v}"))?;
        }
        if let Some(v) = get("CSV_FILE_PATH") {
            self.snapshot.path = PathBuf::from(v);
        }

        Ok(())
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.store.url.is_empty()
            || self.store.token.is_empty()
            || self.store.org.is_empty()
            || self.store.bucket.is_empty()
        {
            bail!("store.url, store.token, store.org and store.bucket are required");
        }

        if self.host.is_empty() {
            bail!("host must not be empty");
        }

        if self.sampling.interval.is_zero() {
            bail!("sampling.interval must be positive");
        }
        if self.sampling.measurement.is_empty() {
            bail!("sampling.measurement must not be empty");
        }
        if self.sampling.field.is_empty() {
            bail!("sampling.field must not be empty");
        }

        let threshold = self.alert.threshold;
        if !threshold.is_finite() || !(0.0..=100.0).contains(&threshold) {
            bail!("alert.threshold must be within [0, 100], got {threshold}");
        }
        if self.alert.sustain.is_zero() {
            bail!("alert.sustain must be positive");
        }
        if self.alert.cooldown.is_zero() {
            bail!("alert.cooldown must be positive");
        }

        if self.aggregation.interval.is_zero() {
            bail!("aggregation.interval must be positive");
        }
        if self.aggregation.range.is_zero() {
            bail!("aggregation.range must be positive");
        }
        if self.aggregation.every.is_zero() {
            bail!("aggregation.every must be positive");
        }
        if self.aggregation.every > self.aggregation.range {
            bail!(
                "aggregation.every {:?} must not exceed aggregation.range {:?}",
                self.aggregation.every,
                self.aggregation.range
            );
        }

        if self.snapshot_refresh_enabled() && self.snapshot.program.is_empty() {
            bail!("snapshot.program is required when snapshots are refreshed");
        }
        if self.forecast_enabled() && self.forecast.program.is_empty() {
            bail!("forecast.program is required when forecasting is enabled");
        }

        Ok(())
    }

    /// Log filter to install: the command-line value wins over the file.
    pub fn log_filter<'a>(&'a self, cli: Option<&'a str>) -> &'a str {
        cli.unwrap_or(&self.log_level)
    }

    /// Alerting requires a complete mail transport, a recipient and a threshold.
    pub fn alerting_enabled(&self) -> bool {
        self.smtp.is_configured() && self.alert.threshold > 0.0
    }

    /// Snapshots are refreshed only with a configured path.
    pub fn snapshot_refresh_enabled(&self) -> bool {
        self.snapshot.refresh && !self.snapshot.path.as_os_str().is_empty()
    }

    /// Forecasting reads the snapshot, so it needs a configured path too.
    pub fn forecast_enabled(&self) -> bool {
        self.forecast.enabled && !self.snapshot.path.as_os_str().is_empty()
    }
}

impl SmtpConfig {
    /// Whether every field needed to authenticate and address a mail is set.
    pub fn is_configured(&self) -> bool {
        !self.host.is_empty()
            && self.port != 0
            && !self.username.is_empty()
            && !self.password.is_empty()
            && !self.recipient.is_empty()
    }

    /// Sender address, falling back to the login name.
    pub fn sender(&self) -> &str {
        if self.from.is_empty() {
            &self.username
        } else {
            &self.from
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn valid_config() -> Config {
        Config {
            store: StoreConfig {
                url: "http://localhost:8086".to_string(),
                token: "secret".to_string(),
                org: "home".to_string(),
                bucket: "metrics".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_log_filter_prefers_cli_over_file() {
        let cfg: Config = serde_yaml::from_str("log_level: debug\n").expect("parse yaml");
        assert_eq!(cfg.log_filter(None), "debug");
        assert_eq!(cfg.log_filter(Some("warn")), "warn");
        assert_eq!(Config::default().log_filter(None), "info");
    }

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.host, "localhost");
        assert_eq!(cfg.sampling.interval, Duration::from_secs(10));
        assert_eq!(cfg.aggregation.interval, Duration::from_secs(30));
        assert_eq!(cfg.aggregation.range, Duration::from_secs(600));
        assert_eq!(cfg.aggregation.every, Duration::from_secs(30));
        assert_eq!(cfg.alert.sustain, Duration::from_secs(30));
        assert_eq!(cfg.alert.policy, DebouncePolicy::Sustained);
        assert_eq!(cfg.smtp.port, 587);
        assert_eq!(cfg.health.addr, ":9090");
    }

    #[test]
    fn test_parse_yaml_with_humantime_durations() {
        let yaml = r#"
host: web-1
store:
  url: http://influx:8086
  token: t
  org: o
  bucket: b
sampling:
  interval: 5s
alert:
  threshold: 75.5
  policy: cooldown
  cooldown: 2m
aggregation:
  range: 1h
  every: 1m
  function: max
snapshot:
  path: /tmp/cpu.csv
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parse yaml");
        assert_eq!(cfg.host, "web-1");
        assert_eq!(cfg.sampling.interval, Duration::from_secs(5));
        assert_eq!(cfg.alert.policy, DebouncePolicy::Cooldown);
        assert_eq!(cfg.alert.cooldown, Duration::from_secs(120));
        assert!((cfg.alert.threshold - 75.5).abs() < f64::EPSILON);
        assert_eq!(cfg.aggregation.range, Duration::from_secs(3600));
        assert_eq!(cfg.aggregation.function, AggregateFn::Max);
        assert_eq!(cfg.snapshot.path, PathBuf::from("/tmp/cpu.csv"));
        cfg.validate().expect("valid config");
    }

    #[test]
    fn test_validation_missing_store_is_fatal() {
        let cfg = Config::default();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("store.url"));
    }

    #[test]
    fn test_validation_missing_bucket() {
        let mut cfg = valid_config();
        cfg.store.bucket.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validation_threshold_out_of_range() {
        let mut cfg = valid_config();
        cfg.alert.threshold = 120.0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("alert.threshold"));
    }

    #[test]
    fn test_validation_zero_sampling_interval() {
        let mut cfg = valid_config();
        cfg.sampling.interval = Duration::ZERO;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("sampling.interval"));
    }

    #[test]
    fn test_validation_bucket_wider_than_range() {
        let mut cfg = valid_config();
        cfg.aggregation.every = Duration::from_secs(3600);
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("aggregation.every"));
    }

    #[test]
    fn test_env_overrides_plain_variable_names() {
        let mut cfg = Config::default();
        cfg.apply_env(env(&[
            ("INFLUXDB_URL", "http://influx:8086"),
            ("INFLUXDB_TOKEN", "tok"),
            ("INFLUXDB_ORG", "org"),
            ("INFLUXDB_BUCKET", "bucket"),
            ("SMTP_HOST", "smtp.example.com"),
            ("SMTP_PORT", "2525"),
            ("SMTP_USERNAME", "alerts@example.com"),
            ("SMTP_PASSWORD", "pw"),
            ("ALERT_EMAIL", "ops@example.com"),
            ("CPU_THRESHOLD", "80"),
            ("CSV_FILE_PATH", "data/cpu.csv"),
        ]))
        .expect("apply env");

        assert_eq!(cfg.store.url, "http://influx:8086");
        assert_eq!(cfg.smtp.port, 2525);
        assert_eq!(cfg.smtp.recipient, "ops@example.com");
        assert!((cfg.alert.threshold - 80.0).abs() < f64::EPSILON);
        assert_eq!(cfg.snapshot.path, PathBuf::from("data/cpu.csv"));
        assert!(cfg.alerting_enabled());
        assert!(cfg.snapshot_refresh_enabled());
        assert!(cfg.forecast_enabled());
        cfg.validate().expect("valid config");
    }

    #[test]
    fn test_env_empty_values_are_ignored() {
        let mut cfg = valid_config();
        cfg.apply_env(env(&[("INFLUXDB_URL", "  "), ("CPU_THRESHOLD", "")]))
            .expect("apply env");
        assert_eq!(cfg.store.url, "http://localhost:8086");
        assert_eq!(cfg.alert.threshold, 0.0);
    }

    #[test]
    fn test_env_invalid_threshold_is_error() {
        let mut cfg = valid_config();
        let err = cfg
            .apply_env(env(&[("CPU_THRESHOLD", "eighty")]))
            .unwrap_err();
        assert!(err.to_string().contains("CPU_THRESHOLD"));
    }

    #[test]
    fn test_alerting_disabled_without_threshold() {
        let mut cfg = valid_config();
        cfg.smtp = SmtpConfig {
            host: "smtp.example.com".to_string(),
            username: "u".to_string(),
            password: "p".to_string(),
            recipient: "ops@example.com".to_string(),
            ..Default::default()
        };
        assert!(!cfg.alerting_enabled());
        cfg.alert.threshold = 80.0;
        assert!(cfg.alerting_enabled());
    }

    #[test]
    fn test_alerting_disabled_with_incomplete_transport() {
        let mut cfg = valid_config();
        cfg.alert.threshold = 80.0;
        cfg.smtp.host = "smtp.example.com".to_string();
        assert!(!cfg.alerting_enabled());
    }

    #[test]
    fn test_snapshot_and_forecast_need_path() {
        let mut cfg = valid_config();
        assert!(!cfg.snapshot_refresh_enabled());
        assert!(!cfg.forecast_enabled());

        cfg.snapshot.path = PathBuf::from("cpu.csv");
        cfg.snapshot.refresh = false;
        assert!(!cfg.snapshot_refresh_enabled());
        assert!(cfg.forecast_enabled());
    }

    #[test]
    fn test_smtp_sender_falls_back_to_username() {
        let mut smtp = SmtpConfig {
            username: "alerts@example.com".to_string(),
            ..Default::default()
        };
        assert_eq!(smtp.sender(), "alerts@example.com");
        smtp.from = "cpuwatch@example.com".to_string();
        assert_eq!(smtp.sender(), "cpuwatch@example.com");
    }
}
