//! Service configuration, read from `config.json` with environment overrides.
//!
//! Every field has a default so any subset of keys may be given. `validate`
//! must pass before the service starts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::atom_feed::DEFAULT_FEED_BASE;
use crate::error::ConfigError;
use crate::monitor::MonitorConfig;
use crate::notify::{DEFAULT_EMAIL_API_BASE, DEFAULT_EMAIL_FROM};
use crate::youtube::{DEFAULT_API_BASE, DEFAULT_MAX_RESULTS};

const APP_DIR: &str = "tubewatch";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// YouTube Data API v3; needs an API key.
    #[default]
    Api,
    /// Public Atom feeds; no key, no handle resolution.
    Feed,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub poll_interval_secs: u64,
    /// Must be shorter than the poll interval. Half the interval when unset.
    pub cache_ttl_secs: Option<u64>,
    pub request_timeout_secs: u64,
    pub max_concurrent_polls: usize,
    pub max_results: u32,
    pub cache_sweep_interval_secs: u64,
    /// Where `channels.json` and `handles.json` live.
    pub data_dir: Option<PathBuf>,
    pub source: SourceKind,
    pub youtube: YouTubeConfig,
    pub notifications: NotificationConfig,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct YouTubeConfig {
    pub api_key: Option<String>,
    pub api_base: String,
    pub feed_base: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Log every event through tracing.
    pub log: bool,
    pub webhook_url: Option<String>,
    pub email: Option<EmailConfig>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    pub api_key: String,
    pub to: String,
    #[serde(default = "default_email_from")]
    pub from: String,
    #[serde(default = "default_email_api_base")]
    pub api_base: String,
}

fn default_email_from() -> String {
    DEFAULT_EMAIL_FROM.to_owned()
}

fn default_email_api_base() -> String {
    DEFAULT_EMAIL_API_BASE.to_owned()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval_secs: 1800,
            cache_ttl_secs: None,
            request_timeout_secs: 10,
            max_concurrent_polls: 4,
            max_results: DEFAULT_MAX_RESULTS,
            cache_sweep_interval_secs: 300,
            data_dir: None,
            source: SourceKind::default(),
            youtube: YouTubeConfig::default(),
            notifications: NotificationConfig::default(),
        }
    }
}

impl Default for YouTubeConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: DEFAULT_API_BASE.to_owned(),
            feed_base: DEFAULT_FEED_BASE.to_owned(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            log: true,
            webhook_url: None,
            email: None,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("poll_interval_secs", &self.poll_interval_secs)
            .field("cache_ttl_secs", &self.cache_ttl_secs)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("max_concurrent_polls", &self.max_concurrent_polls)
            .field("max_results", &self.max_results)
            .field("cache_sweep_interval_secs", &self.cache_sweep_interval_secs)
            .field("data_dir", &self.data_dir)
            .field("source", &self.source)
            .field("youtube", &self.youtube)
            .field("notifications", &self.notifications)
            .finish()
    }
}

impl std::fmt::Debug for YouTubeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YouTubeConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("api_base", &self.api_base)
            .field("feed_base", &self.feed_base)
            .finish()
    }
}

impl std::fmt::Debug for EmailConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailConfig")
            .field("api_key", &"[REDACTED]")
            .field("to", &self.to)
            .field("from", &self.from)
            .field("api_base", &self.api_base)
            .finish()
    }
}

impl Config {
    /// `~/.config/tubewatch/config.json` on Linux.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let dir = dirs::config_dir().ok_or(ConfigError::NoDirectory("config"))?;
        Ok(dir.join(APP_DIR).join("config.json"))
    }

    /// A missing or empty file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(&content)?)
    }

    /// Applies the process environment on top of the file values.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Recognized keys: `YOUTUBE_API_KEY`, `CHECK_INTERVAL` (seconds),
    /// `DISCORD_WEBHOOK_URL`, `RESEND_API_KEY`, `NOTIFICATION_EMAIL`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = lookup("YOUTUBE_API_KEY") {
            self.youtube.api_key = Some(key);
        }
        if let Some(interval) = lookup("CHECK_INTERVAL") {
            self.poll_interval_secs = interval.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("CHECK_INTERVAL must be a number of seconds, got {interval:?}"))
            })?;
        }
        if let Some(url) = lookup("DISCORD_WEBHOOK_URL") {
            self.notifications.webhook_url = Some(url);
        }

        let resend_key = lookup("RESEND_API_KEY");
        let recipient = lookup("NOTIFICATION_EMAIL");
        if let Some(email) = self.notifications.email.as_mut() {
            if let Some(key) = resend_key {
                email.api_key = key;
            }
            if let Some(to) = recipient {
                email.to = to;
            }
        } else {
            match (resend_key, recipient) {
                (Some(api_key), Some(to)) => {
                    self.notifications.email = Some(EmailConfig {
                        api_key,
                        to,
                        from: default_email_from(),
                        api_base: default_email_api_base(),
                    });
                }
                (None, None) => {}
                _ => {
                    return Err(ConfigError::Invalid(
                        "email notifications need both RESEND_API_KEY and NOTIFICATION_EMAIL".into(),
                    ))
                }
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_owned()));

        if self.poll_interval_secs == 0 {
            return invalid("poll_interval_secs must be greater than zero");
        }
        if let Some(ttl) = self.cache_ttl_secs {
            if ttl == 0 {
                return invalid("cache_ttl_secs must be greater than zero");
            }
            if ttl >= self.poll_interval_secs {
                return invalid("cache_ttl_secs must be shorter than poll_interval_secs");
            }
        }
        if self.request_timeout_secs == 0 {
            return invalid("request_timeout_secs must be greater than zero");
        }
        if self.max_concurrent_polls == 0 {
            return invalid("max_concurrent_polls must be at least 1");
        }
        if self.cache_sweep_interval_secs == 0 {
            return invalid("cache_sweep_interval_secs must be greater than zero");
        }
        if self.source == SourceKind::Api
            && self.youtube.api_key.as_deref().map_or(true, |k| k.trim().is_empty())
        {
            return invalid("the api source needs youtube.api_key or YOUTUBE_API_KEY");
        }
        if let Some(email) = &self.notifications.email {
            if email.api_key.trim().is_empty() || email.to.trim().is_empty() {
                return invalid("notifications.email needs both api_key and to");
            }
        }
        if let Some(url) = &self.notifications.webhook_url {
            if url::Url::parse(url).is_err() {
                return invalid("notifications.webhook_url is not a valid URL");
            }
        }
        Ok(())
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            interval: Duration::from_secs(self.poll_interval_secs),
            cache_ttl: self.cache_ttl(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            max_concurrent_polls: self.max_concurrent_polls,
        }
    }

    /// Explicit `cache_ttl_secs`, or half the poll interval.
    pub fn cache_ttl(&self) -> Duration {
        match self.cache_ttl_secs {
            Some(secs) => Duration::from_secs(secs),
            None => Duration::from_secs(self.poll_interval_secs) / 2,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache_sweep_interval_secs)
    }

    /// Configured data directory, or `~/.local/share/tubewatch` on Linux.
    pub fn data_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::data_dir()
                .map(|dir| dir.join(APP_DIR))
                .ok_or(ConfigError::NoDirectory("data")),
        }
    }
}
