use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Prefix of environment variables that override file settings.
const ENV_PREFIX: &str = "NOZZLE_";

/// Top-level configuration for the firehose nozzle.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Traffic controller websocket endpoint (e.g. "wss://doppler.example.com:443").
    #[serde(default, alias = "TrafficControllerURL")]
    pub traffic_controller_url: String,

    /// Firehose subscription ID. Nozzles sharing an ID split the stream.
    #[serde(default, alias = "FirehoseSubscriptionID")]
    pub subscription_id: String,

    /// UAA endpoint used to fetch the firehose token.
    #[serde(default, alias = "UAAURL")]
    pub uaa_url: String,

    /// UAA user with the `doppler.firehose` scope.
    #[serde(default, alias = "Username")]
    pub username: String,

    #[serde(default, alias = "Password")]
    pub password: String,

    /// Skip the token fetch and connect without an Authorization header.
    #[serde(default, alias = "DisableAccessControl")]
    pub disable_access_control: bool,

    /// Accept invalid TLS certificates from UAA and the traffic controller.
    #[serde(default, alias = "InsecureSSLSkipVerify")]
    pub insecure_ssl_skip_verify: bool,

    /// Idle read timeout on the firehose connection. 0 disables it.
    #[serde(default, alias = "IdleTimeoutSeconds")]
    pub idle_timeout_seconds: u64,

    /// Flush cycle length. Default: 15.
    #[serde(default = "default_flush_interval_seconds", alias = "FlushDurationSeconds")]
    pub flush_interval_seconds: u64,

    /// Prepended to every exported metric name.
    #[serde(default, alias = "MetricPrefix")]
    pub metric_prefix: String,

    /// Deployment label attached to the nozzle's own metrics. Default: "nozzle".
    #[serde(default = "default_deployment_name", alias = "Deployment")]
    pub deployment_name: String,

    /// Liveness and self-observability server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Metrics backend configuration.
    pub sink: SinkConfig,
}

/// Liveness and self-observability server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":8000". `PORT` overrides the port.
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

/// Metrics backend, selected by `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkConfig {
    Http(HttpSinkConfig),
    #[serde(alias = "influx")]
    Influxdb(InfluxDbSinkConfig),
    Riemann(RiemannSinkConfig),
}

impl SinkConfig {
    /// Returns the backend name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Http(_) => "http",
            Self::Influxdb(_) => "influxdb",
            Self::Riemann(_) => "riemann",
        }
    }
}

/// JSON series endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpSinkConfig {
    /// Series endpoint URL.
    #[serde(default)]
    pub url: String,

    /// Appended to the URL as `api_key` when set.
    #[serde(default)]
    pub api_key: String,

    /// Body compression (none, gzip). Default: none.
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Request timeout. Default: 30s.
    #[serde(default = "default_sink_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// InfluxDB v1 write endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct InfluxDbSinkConfig {
    /// InfluxDB base URL (e.g. "http://localhost:8086").
    #[serde(default, alias = "InfluxDbUrl")]
    pub url: String,

    #[serde(default, alias = "InfluxDbDatabase")]
    pub database: String,

    #[serde(default, alias = "InfluxDbUser")]
    pub username: String,

    #[serde(default, alias = "InfluxDbPassword")]
    pub password: String,

    /// Request timeout. Default: 30s.
    #[serde(default = "default_sink_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Riemann server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RiemannSinkConfig {
    #[serde(default, alias = "RiemannHost")]
    pub host: String,

    /// Default: 5555.
    #[serde(default = "default_riemann_port", alias = "RiemannPort")]
    pub port: u16,

    /// Default: tcp.
    #[serde(default, alias = "RiemannTransport")]
    pub transport: RiemannTransport,

    /// Connect and write timeout. Default: 30s.
    #[serde(default = "default_sink_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiemannTransport {
    #[default]
    Tcp,
    Udp,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_flush_interval_seconds() -> u64 {
    15
}

fn default_deployment_name() -> String {
    "nozzle".to_string()
}

fn default_health_addr() -> String {
    ":8000".to_string()
}

fn default_compression() -> String {
    "none".to_string()
}

fn default_sink_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_riemann_port() -> u16 {
    5555
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

impl Default for HttpSinkConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key: String::new(),
            compression: default_compression(),
            timeout: default_sink_timeout(),
        }
    }
}

impl Default for InfluxDbSinkConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            database: String::new(),
            username: String::new(),
            password: String::new(),
            timeout: default_sink_timeout(),
        }
    }
}

impl Default for RiemannSinkConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_riemann_port(),
            transport: RiemannTransport::default(),
            timeout: default_sink_timeout(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            traffic_controller_url: String::new(),
            subscription_id: String::new(),
            uaa_url: String::new(),
            username: String::new(),
            password: String::new(),
            disable_access_control: false,
            insecure_ssl_skip_verify: false,
            idle_timeout_seconds: 0,
            flush_interval_seconds: default_flush_interval_seconds(),
            metric_prefix: String::new(),
            deployment_name: default_deployment_name(),
            health: HealthConfig::default(),
            sink: SinkConfig::Http(HttpSinkConfig::default()),
        }
    }
}

impl Config {
    /// Load configuration from a JSON or YAML file, apply environment
    /// overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let mut cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.apply_env_overrides(|key| std::env::var(key).ok())?;
        cfg.validate()?;

        Ok(cfg)
    }

    /// Overrides file settings with `NOZZLE_*` variables and `PORT`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = var("TRAFFIC_CONTROLLER_URL") {
            self.traffic_controller_url = v;
        }
        if let Some(v) = var("SUBSCRIPTION_ID") {
            self.subscription_id = v;
        }
        if let Some(v) = var("UAA_URL") {
            self.uaa_url = v;
        }
        if let Some(v) = var("USERNAME") {
            self.username = v;
        }
        if let Some(v) = var("PASSWORD") {
            self.password = v;
        }
        if let Some(v) = var("METRIC_PREFIX") {
            self.metric_prefix = v;
        }
        if let Some(v) = var("DEPLOYMENT_NAME") {
            self.deployment_name = v;
        }
        if let Some(v) = var("FLUSH_INTERVAL_SECONDS") {
            self.flush_interval_seconds = v
                .parse()
                .with_context(|| format!("parsing {ENV_PREFIX}FLUSH_INTERVAL_SECONDS={v}"))?;
        }
        if let Some(v) = var("IDLE_TIMEOUT_SECONDS") {
            self.idle_timeout_seconds = v
                .parse()
                .with_context(|| format!("parsing {ENV_PREFIX}IDLE_TIMEOUT_SECONDS={v}"))?;
        }
        if let Some(v) = var("DISABLE_ACCESS_CONTROL") {
            self.disable_access_control = parse_bool(&v)
                .with_context(|| format!("parsing {ENV_PREFIX}DISABLE_ACCESS_CONTROL={v}"))?;
        }
        if let Some(v) = var("INSECURE_SSL_SKIP_VERIFY") {
            self.insecure_ssl_skip_verify = parse_bool(&v)
                .with_context(|| format!("parsing {ENV_PREFIX}INSECURE_SSL_SKIP_VERIFY={v}"))?;
        }
        if let Some(port) = lookup("PORT").filter(|p| !p.is_empty()) {
            self.health.addr = format!(":{port}");
        }

        Ok(())
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.traffic_controller_url.is_empty() {
            bail!("traffic_controller_url is required");
        }

        if !self.traffic_controller_url.starts_with("ws://")
            && !self.traffic_controller_url.starts_with("wss://")
        {
            bail!(
                "traffic_controller_url must be a ws:// or wss:// URL, got {}",
                self.traffic_controller_url
            );
        }

        if self.subscription_id.is_empty() {
            bail!("subscription_id is required");
        }

        if !self.disable_access_control && self.uaa_url.is_empty() {
            bail!("uaa_url is required unless disable_access_control is set");
        }

        if self.flush_interval_seconds == 0 {
            bail!("flush_interval_seconds must be positive");
        }

        if self.deployment_name.is_empty() {
            bail!("deployment_name must not be empty");
        }

        match &self.sink {
            SinkConfig::Http(http) => {
                if http.url.is_empty() {
                    bail!("sink.url is required for the http sink");
                }
                match http.compression.as_str() {
                    "none" | "" | "gzip" => {}
                    other => bail!("invalid compression type: {other}"),
                }
            }
            SinkConfig::Influxdb(influx) => {
                if influx.url.is_empty() {
                    bail!("sink.url is required for the influxdb sink");
                }
                if influx.database.is_empty() {
                    bail!("sink.database is required for the influxdb sink");
                }
            }
            SinkConfig::Riemann(riemann) => {
                if riemann.host.is_empty() {
                    bail!("sink.host is required for the riemann sink");
                }
                if riemann.port == 0 {
                    bail!("sink.port must be positive");
                }
            }
        }

        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_seconds)
    }

    /// Zero means no idle timeout.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }
}

fn parse_bool(v: &str) -> Result<bool> {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" | "" => Ok(false),
        other => bail!("not a boolean: {other}"),
    }
}
