//! Worker configuration loaded from the environment.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::health::HealthMonitorConfig;
use crate::jobs::{Channel, ChannelConfig};
use crate::notifications::MailSettings;
use crate::workers::SupervisorSettings;

/// Configuration error. Fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required configuration: {}", .0.join(", "))]
    Missing(Vec<&'static str>),
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Redis connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisConfig {
    /// Full URL; wins over host/port/password when set.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
}

impl RedisConfig {
    pub fn connection_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        match &self.password {
            Some(password) => format!("redis://:{password}@{}:{}/", self.host, self.port),
            None => format!("redis://{}:{}/", self.host, self.port),
        }
    }
}

/// Everything the worker process needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub redis: RedisConfig,
    pub resend_api_key: String,
    /// Deployment environment (`production` disables recipient redirect).
    pub environment: String,
    pub mail: MailSettings,
    pub email_concurrency: usize,
    pub scheduled_concurrency: usize,
    pub health: HealthMonitorConfig,
    pub supervisor: SupervisorSettings,
    pub enqueue_timeout: Duration,
    pub reminder_cron: String,
    pub log_level: String,
    pub log_json: bool,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let redis_url = get("REDIS_URL");
        let redis_host = get("REDIS_HOST");
        let resend_api_key = get("RESEND_API_KEY");

        let mut missing = Vec::new();
        if redis_url.is_none() && redis_host.is_none() {
            missing.push("REDIS_HOST");
        }
        if resend_api_key.is_none() {
            missing.push("RESEND_API_KEY");
        }
        let resend_api_key = match resend_api_key {
            Some(key) if missing.is_empty() => key,
            _ => return Err(ConfigError::Missing(missing)),
        };

        let environment = get("APP_ENV")
            .or_else(|| get("NODE_ENV"))
            .unwrap_or_else(|| "development".to_string());
        let production = environment.eq_ignore_ascii_case("production");

        let verified_email = get("VERIFIED_EMAIL");
        if !production && verified_email.is_none() {
            warn!("VERIFIED_EMAIL not set; outbound mail goes to the original recipients");
        }

        let mail = MailSettings {
            from: get("FROM_EMAIL").unwrap_or_else(|| "EchoBoard <noreply@resend.dev>".to_string()),
            verified_email,
            production,
            dashboard_url: get("DASHBOARD_URL").unwrap_or_else(|| "https://echoboard.dev".to_string()),
        };

        let health = HealthMonitorConfig {
            interval: Duration::from_secs(parse_or(&get, "HEALTH_INTERVAL_SECS", 30u64)?.max(1)),
            probe_timeout: Duration::from_secs(parse_or(&get, "HEALTH_PROBE_TIMEOUT_SECS", 5u64)?),
            failure_threshold: parse_or(&get, "HEALTH_FAILURE_THRESHOLD", 3u32)?.max(1),
        };
        let supervisor = SupervisorSettings {
            shutdown_grace: Duration::from_secs(parse_or(&get, "SHUTDOWN_GRACE_SECS", 30u64)?),
            reconnect_cooldown: Duration::from_secs(parse_or(&get, "RECONNECT_COOLDOWN_SECS", 2u64)?),
        };

        let log_json = match get("LOG_FORMAT").as_deref() {
            None | Some("json") => true,
            Some("pretty") => false,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "LOG_FORMAT",
                    value: other.to_string(),
                    reason: "expected json or pretty".to_string(),
                });
            }
        };

        Ok(Self {
            redis: RedisConfig {
                url: redis_url,
                host: redis_host.unwrap_or_else(|| "localhost".to_string()),
                port: parse_or(&get, "REDIS_PORT", 6379u16)?,
                password: get("REDIS_PASSWORD"),
            },
            resend_api_key,
            environment,
            mail,
            email_concurrency: parse_or(&get, "EMAIL_CONCURRENCY", 5usize)?.max(1),
            scheduled_concurrency: parse_or(&get, "SCHEDULED_CONCURRENCY", 2usize)?.max(1),
            health,
            supervisor,
            enqueue_timeout: Duration::from_secs(parse_or(&get, "ENQUEUE_TIMEOUT_SECS", 30u64)?),
            reminder_cron: get("REMINDER_CRON").unwrap_or_else(|| "0 9 * * *".to_string()),
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_json,
        })
    }

    pub fn is_production(&self) -> bool {
        self.mail.production
    }

    /// Channel defaults with the configured concurrency applied.
    pub fn channel_config(&self, channel: Channel) -> ChannelConfig {
        let concurrency = match channel {
            Channel::Email => self.email_concurrency,
            Channel::Scheduled => self.scheduled_concurrency,
        };
        ChannelConfig::for_channel(channel).with_concurrency(concurrency)
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(value) => match value.trim().parse() {
            Ok(parsed) => Ok(parsed),
            Err(e) => Err(ConfigError::Invalid {
                key,
                reason: e.to_string(),
                value,
            }),
        },
    }
}
