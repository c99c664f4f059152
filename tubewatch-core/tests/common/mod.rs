#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tubewatch_core::{FeedItem, FeedSource, ResolveError, UpstreamError};

pub const CHANNEL_A: &str = "UCaaaaaaaaaaaaaaaaaaaaaa";
pub const CHANNEL_B: &str = "UCbbbbbbbbbbbbbbbbbbbbbb";

pub fn item(id: &str, hour: u32) -> FeedItem {
    FeedItem {
        id: id.to_owned(),
        title: format!("Upload {id}"),
        url: format!("https://www.youtube.com/watch?v={id}"),
        published_at: Some(Utc.with_ymd_and_hms(2024, 10, 21, hour, 0, 0).unwrap()),
    }
}

#[derive(Clone)]
pub enum Reply {
    Items(Vec<FeedItem>),
    Transient,
    Permanent,
}

/// Scripted upstream: one reply per channel, optional latency, call counters.
#[derive(Default)]
pub struct FakeSource {
    replies: Mutex<HashMap<String, Reply>>,
    handles: Mutex<HashMap<String, String>>,
    titles: Mutex<HashMap<String, String>>,
    delay: Mutex<Option<Duration>>,
    list_calls: Mutex<HashMap<String, usize>>,
    resolve_calls: AtomicUsize,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, channel_id: &str, reply: Reply) {
        self.replies.lock().unwrap().insert(channel_id.to_owned(), reply);
    }

    pub fn items(&self, channel_id: &str, items: Vec<FeedItem>) {
        self.reply(channel_id, Reply::Items(items));
    }

    pub fn handle(&self, handle: &str, channel_id: &str) {
        self.handles
            .lock()
            .unwrap()
            .insert(handle.to_ascii_lowercase(), channel_id.to_owned());
    }

    pub fn title(&self, channel_id: &str, title: &str) {
        self.titles.lock().unwrap().insert(channel_id.to_owned(), title.to_owned());
    }

    pub fn delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn list_calls(&self, channel_id: &str) -> usize {
        self.list_calls.lock().unwrap().get(channel_id).copied().unwrap_or(0)
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedSource for FakeSource {
    async fn list_recent_items(&self, channel_id: &str) -> Result<Vec<FeedItem>, UpstreamError> {
        *self
            .list_calls
            .lock()
            .unwrap()
            .entry(channel_id.to_owned())
            .or_default() += 1;
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let reply = self.replies.lock().unwrap().get(channel_id).cloned();
        match reply {
            Some(Reply::Items(items)) => Ok(items),
            Some(Reply::Transient) => Err(UpstreamError::Transient("quotaExceeded".into())),
            Some(Reply::Permanent) | None => Err(UpstreamError::Permanent("channel not found".into())),
        }
    }

    async fn resolve_handle(&self, handle: &str) -> Result<String, ResolveError> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        self.handles
            .lock()
            .unwrap()
            .get(&handle.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| ResolveError::NotFound(handle.to_owned()))
    }

    async fn channel_title(&self, channel_id: &str) -> Result<Option<String>, UpstreamError> {
        Ok(self.titles.lock().unwrap().get(channel_id).cloned())
    }
}
