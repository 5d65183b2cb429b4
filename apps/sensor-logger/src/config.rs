use anyhow::{anyhow, bail, Context, Result};
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

#[derive(Clone, Debug)]
pub struct Config {
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_db: i64,
    pub redis_password: Option<String>,
    pub redis_channel: String,

    pub influxdb_scheme: String,
    pub influxdb_host: String,
    pub influxdb_port: u16,
    pub influxdb_org: String,
    pub influxdb_bucket: String,
    pub influxdb_token: String,
    pub influxdb_verify_tls: bool,
    pub influxdb_write_timeout_secs: u64,

    pub samples_trigger: usize,
    pub time_trigger_secs: u64,
    pub fresh_limit: usize,
    pub backlog_limit: usize,
    pub backlog_chunk: usize,

    pub poll_timeout_ms: u64,
    pub reconnect_backoff_secs: u64,
    pub stats_interval_secs: u64,

    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        load_env_file()?;
        let vars: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|key| vars.get(key).cloned())
    }

    /// Builds the config from an arbitrary key lookup. Unset keys take their
    /// defaults; set-but-invalid values are an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };

        let config = Self {
            redis_host: vars.string("REDIS_HOST", "localhost"),
            redis_port: vars.parsed("REDIS_PORT", 6379)?,
            redis_db: vars.parsed("REDIS_DB", 0)?,
            redis_password: vars.optional("REDIS_PASSWORD"),
            redis_channel: vars.string("REDIS_CHANNEL", "sensors"),

            influxdb_scheme: vars.string("INFLUXDB_SCHEME", "http"),
            influxdb_host: vars.string("INFLUXDB_HOST", "localhost"),
            influxdb_port: vars.parsed("INFLUXDB_PORT", 8086)?,
            influxdb_org: vars.string("INFLUXDB_ORG", "DAQ"),
            influxdb_bucket: vars.string("INFLUXDB_BUCKET", "logger"),
            influxdb_token: vars.string("INFLUXDB_TOKEN", ""),
            influxdb_verify_tls: vars.flag("INFLUXDB_VERIFY_TLS", false)?,
            influxdb_write_timeout_secs: vars.parsed("INFLUXDB_WRITE_TIMEOUT_SECS", 10)?,

            samples_trigger: vars.parsed("INFLUXDB_SAMPLES_TRIGGER", 1000)?,
            time_trigger_secs: vars.parsed("INFLUXDB_TIME_TRIGGER", 10)?,
            fresh_limit: vars.parsed("LOGGER_FRESH_LIMIT", 2000)?,
            backlog_limit: vars.parsed("LOGGER_BACKLOG_LIMIT", 1_000_000)?,
            backlog_chunk: vars.parsed("LOGGER_BACKLOG_CHUNK", 5000)?,

            poll_timeout_ms: vars.parsed("LOGGER_POLL_TIMEOUT_MS", 100)?,
            reconnect_backoff_secs: vars.parsed("LOGGER_RECONNECT_BACKOFF_SECS", 5)?,
            stats_interval_secs: vars.parsed("LOGGER_STATS_INTERVAL_SECS", 30)?,

            otlp_endpoint: vars.optional("OTEL_EXPORTER_OTLP_ENDPOINT"),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.redis_channel.is_empty() {
            bail!("REDIS_CHANNEL must not be empty");
        }
        if self.redis_db < 0 {
            bail!("REDIS_DB must be >= 0");
        }
        if !matches!(self.influxdb_scheme.as_str(), "http" | "https") {
            bail!(
                "INFLUXDB_SCHEME must be http or https (got {})",
                self.influxdb_scheme
            );
        }
        if self.influxdb_bucket.is_empty() || self.influxdb_org.is_empty() {
            bail!("INFLUXDB_ORG and INFLUXDB_BUCKET must not be empty");
        }
        for (key, value) in [
            ("LOGGER_FRESH_LIMIT", self.fresh_limit as u64),
            ("LOGGER_BACKLOG_CHUNK", self.backlog_chunk as u64),
            ("INFLUXDB_SAMPLES_TRIGGER", self.samples_trigger as u64),
            ("INFLUXDB_TIME_TRIGGER", self.time_trigger_secs),
            ("INFLUXDB_WRITE_TIMEOUT_SECS", self.influxdb_write_timeout_secs),
            ("LOGGER_POLL_TIMEOUT_MS", self.poll_timeout_ms),
            ("LOGGER_RECONNECT_BACKOFF_SECS", self.reconnect_backoff_secs),
            ("LOGGER_STATS_INTERVAL_SECS", self.stats_interval_secs),
        ] {
            if value == 0 {
                bail!("{key} must be greater than zero");
            }
        }
        if self.samples_trigger > self.fresh_limit {
            bail!(
                "INFLUXDB_SAMPLES_TRIGGER ({}) cannot exceed LOGGER_FRESH_LIMIT ({})",
                self.samples_trigger,
                self.fresh_limit
            );
        }
        Ok(())
    }

    pub fn redis_url(&self) -> Result<String> {
        let mut url = Url::parse(&format!(
            "redis://{}:{}/{}",
            self.redis_host, self.redis_port, self.redis_db
        ))
        .context("invalid REDIS_HOST")?;
        if let Some(password) = &self.redis_password {
            url.set_password(Some(password.as_str()))
                .map_err(|_| anyhow!("REDIS_PASSWORD cannot be applied to {}", self.redis_host))?;
        }
        Ok(url.to_string())
    }

    pub fn influxdb_base_url(&self) -> String {
        format!(
            "{}://{}:{}",
            self.influxdb_scheme, self.influxdb_host, self.influxdb_port
        )
    }

    pub fn time_trigger(&self) -> Duration {
        Duration::from_secs(self.time_trigger_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.influxdb_write_timeout_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}

fn load_env_file() -> Result<()> {
    match env::var("LOGGER_ENV_FILE") {
        Ok(path) if !path.trim().is_empty() => {
            let path = PathBuf::from(path.trim());
            dotenvy::from_path(&path)
                .with_context(|| format!("failed to load LOGGER_ENV_FILE {}", path.display()))?;
        }
        _ => {
            dotenvy::dotenv().ok();
        }
    }
    Ok(())
}

struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn parsed<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: std::str::FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match self.optional(key) {
            Some(raw) => raw
                .replace('_', "")
                .parse::<T>()
                .with_context(|| format!("invalid {key}: {raw:?}")),
            None => Ok(default),
        }
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool> {
        match self.optional(key) {
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(anyhow!("invalid {key}: {raw:?}")),
            },
            None => Ok(default),
        }
    }
}
