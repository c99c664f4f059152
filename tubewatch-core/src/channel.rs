use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    #[default]
    Healthy,
    Degraded,
    Invalid,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Health::Healthy => "healthy",
            Health::Degraded => "degraded",
            Health::Invalid => "invalid",
        };
        f.write_str(label)
    }
}

/// A channel under watch. `id` is the upstream identifier and never changes
/// once stored; `last_notified_item_id` is the dedup watermark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedChannel {
    pub id: String,
    pub alias: Option<String>,
    pub last_notified_item_id: Option<String>,
    pub last_notified_published_at: Option<DateTime<Utc>>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub health: Health,
    pub last_error: Option<String>,
    /// When this instance entered the watch list. A channel removed and added
    /// again gets a new value, which keeps stale poll results off it.
    pub added_at: DateTime<Utc>,
}

impl WatchedChannel {
    pub fn new(id: impl Into<String>, alias: Option<String>) -> Self {
        Self {
            id: id.into(),
            alias,
            last_notified_item_id: None,
            last_notified_published_at: None,
            last_polled_at: None,
            health: Health::Healthy,
            last_error: None,
            added_at: Utc::now(),
        }
    }

    /// Alias when the user gave one, identifier otherwise.
    pub fn display_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.id)
    }

    /// True when `input` names this channel by identifier or by alias.
    /// Aliases compare case-insensitively, as handles do upstream.
    pub fn matches(&self, input: &str) -> bool {
        self.id == input
            || self
                .alias
                .as_deref()
                .is_some_and(|alias| alias.eq_ignore_ascii_case(input))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedItem {
    pub id: String,
    pub title: String,
    pub url: String,
    pub published_at: Option<DateTime<Utc>>,
}

/// One newly discovered item, ready for the dispatcher.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NotificationEvent {
    pub channel_id: String,
    pub channel_alias: Option<String>,
    pub item: FeedItem,
}

impl NotificationEvent {
    pub fn channel_name(&self) -> &str {
        self.channel_alias.as_deref().unwrap_or(&self.channel_id)
    }
}

/// What a user typed to designate a channel, after normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRef {
    Id(String),
    /// Always stored with its leading `@`.
    Handle(String),
}

impl ChannelRef {
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if input.is_empty() {
            return None;
        }
        if looks_like_url(input) {
            return Self::from_url(input);
        }
        if is_channel_id(input) {
            return Some(ChannelRef::Id(input.to_owned()));
        }
        let bare = input.strip_prefix('@').unwrap_or(input);
        is_handle(bare).then(|| ChannelRef::Handle(format!("@{bare}")))
    }

    fn from_url(input: &str) -> Option<Self> {
        let url = if input.contains("://") {
            Url::parse(input).ok()?
        } else {
            Url::parse(&format!("https://{input}")).ok()?
        };
        let host = url.host_str()?;
        if !(host == "youtube.com" || host.ends_with(".youtube.com")) {
            return None;
        }
        let mut segments = url.path_segments()?.filter(|s| !s.is_empty());
        match (segments.next(), segments.next()) {
            (Some("channel"), Some(id)) if is_channel_id(id) => Some(ChannelRef::Id(id.to_owned())),
            (Some(first), _) => first
                .strip_prefix('@')
                .filter(|handle| is_handle(handle))
                .map(|handle| ChannelRef::Handle(format!("@{handle}"))),
            _ => None,
        }
    }
}

fn looks_like_url(input: &str) -> bool {
    input.contains("://") || input.contains("youtube.com/")
}

/// `UC` followed by 22 url-safe base64 characters.
pub fn is_channel_id(input: &str) -> bool {
    input.len() == 24
        && input.starts_with("UC")
        && input
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

fn is_handle(bare: &str) -> bool {
    (3..=30).contains(&bare.len())
        && bare
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
}
