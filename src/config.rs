use crate::{
    crypto::MIN_SECRET_LEN, model::AccountId, queue::QueueConfig, scheduler::MAX_INTERVAL,
};
use clap::Args;
use std::{path::PathBuf, time::Duration};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be a finite number >= 0, got {value}")]
    NegativeSeconds { name: &'static str, value: f64 },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("retry backoff cap ({cap:?}) is below the base ({base:?})")]
    BackoffCapBelowBase { base: Duration, cap: Duration },
    #[error("encryption key must be at least {MIN_SECRET_LEN} characters")]
    WeakEncryptionKey,
    #[error("{0} exceeds {MAX_INTERVAL:?}")]
    TooLong(&'static str),
}

/// Tunables shared by every subcommand. Each flag falls back to an
/// environment variable.
#[derive(Clone, Args)]
pub struct Settings {
    /// Pause between two consecutive fetches, counted from the end of the first
    #[arg(long, env = "NEWSLETTER_QUEUE_DELAY_SECONDS", default_value_t = 5.0)]
    pub queue_delay_seconds: f64,

    /// Fetch interval for subscriptions that do not set their own
    #[arg(long, env = "NEWSLETTER_DEFAULT_FETCH_INTERVAL", default_value_t = 1440)]
    pub default_fetch_interval_minutes: u64,

    /// Attempts per fetch task, the first one included
    #[arg(long, env = "NEWSLETTER_MAX_RETRY_ATTEMPTS", default_value_t = 3)]
    pub max_retry_attempts: u32,

    #[arg(long, env = "NEWSLETTER_RETRY_BACKOFF_BASE_SECONDS", default_value_t = 2.0)]
    pub retry_backoff_base_seconds: f64,

    #[arg(long, env = "NEWSLETTER_RETRY_BACKOFF_CAP_SECONDS", default_value_t = 300.0)]
    pub retry_backoff_cap_seconds: f64,

    /// Upper bound for every Gmail and token endpoint call
    #[arg(long, env = "NEWSLETTER_REQUEST_TIMEOUT_SECONDS", default_value_t = 30.0)]
    pub request_timeout_seconds: f64,

    /// Refuse new fetch requests beyond this many waiting tasks
    #[arg(long, env = "NEWSLETTER_MAX_PENDING")]
    pub max_pending: Option<usize>,

    /// Secret the stored OAuth tokens are encrypted with
    #[arg(long, env = "NEWSLETTER_ENCRYPTION_KEY", hide_env_values = true)]
    pub encryption_key: String,

    #[arg(long, env = "NEWSLETTER_DB", default_value = "newsletters.db")]
    pub db: PathBuf,

    /// Google OAuth client secrets JSON
    #[arg(long, env = "NEWSLETTER_SECRETS_FILE", default_value = "client_secret.json")]
    pub secrets_file: PathBuf,

    #[arg(long, env = "NEWSLETTER_ACCOUNT", default_value = "me")]
    pub account: String,
}

/// Validated settings. No `Debug`: it carries the encryption key.
#[derive(Clone)]
pub struct Config {
    pub queue: QueueConfig,
    pub default_fetch_interval: Duration,
    pub request_timeout: Duration,
    pub encryption_key: String,
    pub db: PathBuf,
    pub secrets_file: PathBuf,
    pub account: AccountId,
}

impl Settings {
    pub fn validate(&self) -> Result<Config, ConfigError> {
        let queue_delay = seconds("queue delay", self.queue_delay_seconds)?;
        let base = positive("retry backoff base", self.retry_backoff_base_seconds)?;
        let cap = positive("retry backoff cap", self.retry_backoff_cap_seconds)?;
        if cap < base {
            return Err(ConfigError::BackoffCapBelowBase { base, cap });
        }
        let request_timeout = positive("request timeout", self.request_timeout_seconds)?;
        if self.default_fetch_interval_minutes == 0 {
            return Err(ConfigError::Zero("default fetch interval"));
        }
        let default_fetch_interval = self
            .default_fetch_interval_minutes
            .checked_mul(60)
            .map(Duration::from_secs)
            .filter(|interval| *interval <= MAX_INTERVAL)
            .ok_or(ConfigError::TooLong("default fetch interval"))?;
        if self.max_pending == Some(0) {
            return Err(ConfigError::Zero("max pending"));
        }
        if self.encryption_key.chars().count() < MIN_SECRET_LEN {
            return Err(ConfigError::WeakEncryptionKey);
        }

        Ok(Config {
            queue: QueueConfig::builder()
                .queue_delay(queue_delay)
                .max_retry_attempts(self.max_retry_attempts)
                .retry_backoff_base(base)
                .retry_backoff_cap(cap)
                .maybe_max_pending(self.max_pending)
                .build(),
            default_fetch_interval,
            request_timeout,
            encryption_key: self.encryption_key.clone(),
            db: self.db.clone(),
            secrets_file: self.secrets_file.clone(),
            account: self.account.as_str().into(),
        })
    }
}

fn seconds(name: &'static str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value).map_err(|_| ConfigError::NegativeSeconds { name, value })
}

fn positive(name: &'static str, value: f64) -> Result<Duration, ConfigError> {
    let duration = seconds(name, value)?;
    if duration.is_zero() {
        return Err(ConfigError::Zero(name));
    }
    Ok(duration)
}
