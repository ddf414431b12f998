//! Typed configuration.
//!
//! `Config` is the process-level configuration, loaded once from environment
//! variables at startup; it fails fast if required vars are missing.
//! `ScheduleConfig` tunes one work schedule and can come from a TOML file,
//! environment overrides, or plain `Default`.

pub mod secrets;

use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    /// Pool name. Instances sharing a database and pool name cooperate.
    pub pool: String,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            pool: std::env::var("WORKPOOL_POOL").unwrap_or_else(|_| "default".to_string()),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

// ---------------------------------------------------------------------------
// Schedule tuning
// ---------------------------------------------------------------------------

/// Tuning for one work schedule. Durations are seconds, fractions allowed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Worker tasks executing claimed records.
    pub parallelism: usize,
    /// Most records this process holds at once, queued or running.
    pub bucket_size: usize,
    /// Period of the poll cycle.
    pub poll_secs: f64,
    /// Default backoff when a handler doesn't pick its own next time.
    pub invocation_secs: f64,
    /// Provisional `next_time` written with a claim. Falls back to
    /// `invocation_secs`.
    pub claim_secs: Option<f64>,
    /// Claims older than this are treated as abandoned.
    pub stuck_secs: f64,
    /// How often the stuck-claim sweep runs.
    pub sweep_secs: f64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            bucket_size: 16,
            poll_secs: 5.0,
            invocation_secs: 60.0,
            claim_secs: None,
            stuck_secs: 600.0,
            sweep_secs: 60.0,
        }
    }
}

impl ScheduleConfig {
    /// Load from a TOML file. Missing keys keep their defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read schedule config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("bad schedule config {}: {e}", path.display())))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `WORKPOOL_*` environment overrides on top of `self`.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(v) = env_parse::<usize>("WORKPOOL_PARALLELISM")? {
            self.parallelism = v;
        }
        if let Some(v) = env_parse::<usize>("WORKPOOL_BUCKET_SIZE")? {
            self.bucket_size = v;
        }
        if let Some(v) = env_parse::<f64>("WORKPOOL_POLL_SECS")? {
            self.poll_secs = v;
        }
        if let Some(v) = env_parse::<f64>("WORKPOOL_INVOCATION_SECS")? {
            self.invocation_secs = v;
        }
        if let Some(v) = env_parse::<f64>("WORKPOOL_CLAIM_SECS")? {
            self.claim_secs = Some(v);
        }
        if let Some(v) = env_parse::<f64>("WORKPOOL_STUCK_SECS")? {
            self.stuck_secs = v;
        }
        if let Some(v) = env_parse::<f64>("WORKPOOL_SWEEP_SECS")? {
            self.sweep_secs = v;
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject settings the scheduler can't run with.
    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            return Err(Error::Config("parallelism must be at least 1".to_string()));
        }
        if self.bucket_size == 0 {
            return Err(Error::Config("bucket_size must be at least 1".to_string()));
        }
        let intervals = [
            ("poll_secs", Some(self.poll_secs)),
            ("invocation_secs", Some(self.invocation_secs)),
            ("claim_secs", self.claim_secs),
            ("stuck_secs", Some(self.stuck_secs)),
            ("sweep_secs", Some(self.sweep_secs)),
        ];
        for (name, value) in intervals {
            let Some(value) = value else {
                continue;
            };
            // Out-of-range and sub-nanosecond values would panic or spin later.
            match Duration::try_from_secs_f64(value) {
                Ok(d) if !d.is_zero() => {}
                Ok(_) => {
                    return Err(Error::Config(format!(
                        "{name} must be at least one nanosecond, got {value}"
                    )));
                }
                Err(e) => {
                    return Err(Error::Config(format!("{name} is out of range ({value}): {e}")));
                }
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        secs(self.poll_secs)
    }

    pub fn invocation_interval(&self) -> Duration {
        secs(self.invocation_secs)
    }

    pub fn claim_interval(&self) -> Duration {
        secs(self.claim_secs.unwrap_or(self.invocation_secs))
    }

    pub fn stuck_threshold(&self) -> Duration {
        secs(self.stuck_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        secs(self.sweep_secs)
    }
}

/// Seconds to `Duration`, saturating on values `validate` would reject.
fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{name} has an invalid value: {raw}"))),
        Err(_) => Ok(None),
    }
}
