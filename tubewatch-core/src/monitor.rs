//! Scheduled polling of every watched channel.
//!
//! Each cycle snapshots the store, fetches recent items per channel through
//! the TTL cache, emits one event per item newer than the channel's watermark
//! (oldest first) and persists the advanced watermark. Failures are isolated
//! to the channel they happen on.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cache::TtlCache;
use crate::channel::{FeedItem, Health, NotificationEvent, WatchedChannel};
use crate::error::{MonitorError, StoreError, UpstreamError};
use crate::notify::Dispatcher;
use crate::source::FeedSource;
use crate::store::{ChannelStore, PollRecord};

/// Recent items per channel identifier.
pub type ItemCache = TtlCache<String, Arc<Vec<FeedItem>>>;

#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    pub interval: Duration,
    /// Lifetime of a cached upload list; bounds upstream calls to one per
    /// channel per window regardless of `interval`.
    pub cache_ttl: Duration,
    pub request_timeout: Duration,
    pub max_concurrent_polls: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1800),
            cache_ttl: Duration::from_secs(900),
            request_timeout: Duration::from_secs(10),
            max_concurrent_polls: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOutcome {
    /// First successful poll; watermark set without notifying.
    Baselined,
    Notified(usize),
    Unchanged,
    Degraded,
    Invalidated,
    /// Not polled: suspended as invalid, or shutdown was requested.
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub channels: usize,
    pub baselined: usize,
    pub notified: usize,
    pub events: usize,
    pub unchanged: usize,
    pub degraded: usize,
    pub invalidated: usize,
    pub skipped: usize,
}

impl FromIterator<ChannelOutcome> for CycleReport {
    fn from_iter<I: IntoIterator<Item = ChannelOutcome>>(iter: I) -> Self {
        let mut report = CycleReport::default();
        for outcome in iter {
            report.channels += 1;
            match outcome {
                ChannelOutcome::Baselined => report.baselined += 1,
                ChannelOutcome::Notified(n) => {
                    report.notified += 1;
                    report.events += n;
                }
                ChannelOutcome::Unchanged => report.unchanged += 1,
                ChannelOutcome::Degraded => report.degraded += 1,
                ChannelOutcome::Invalidated => report.invalidated += 1,
                ChannelOutcome::Skipped => report.skipped += 1,
            }
        }
        report
    }
}

#[derive(Clone)]
pub struct Monitor {
    store: ChannelStore,
    cache: ItemCache,
    source: Arc<dyn FeedSource>,
    dispatcher: Arc<dyn Dispatcher>,
    config: MonitorConfig,
}

pub struct MonitorHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<Result<(), StoreError>>,
}

impl MonitorHandle {
    /// Lets in-flight channels finish, flushes the store, and waits for the
    /// task to exit.
    pub async fn stop(self) -> Result<(), MonitorError> {
        let _ = self.shutdown_tx.send(true);
        self.join.await??;
        Ok(())
    }
}

impl Monitor {
    pub fn new(
        store: ChannelStore,
        cache: ItemCache,
        source: Arc<dyn FeedSource>,
        dispatcher: Arc<dyn Dispatcher>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            store,
            cache,
            source,
            dispatcher,
            config,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Runs the loop on a background task. The first cycle starts immediately;
    /// a cycle that overruns the interval delays the next tick.
    pub fn spawn(self) -> MonitorHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let cycle_rx = shutdown_rx.clone();
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *cycle_rx.borrow() {
                            info!("monitor shutdown requested");
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let report = self.run_cycle(Some(&cycle_rx)).await;
                        info!(
                            channels = report.channels,
                            events = report.events,
                            baselined = report.baselined,
                            degraded = report.degraded,
                            invalidated = report.invalidated,
                            "poll cycle finished"
                        );
                        if *cycle_rx.borrow() {
                            info!("monitor shutdown requested");
                            break;
                        }
                    }
                }
            }

            self.store.flush().await
        });

        MonitorHandle { shutdown_tx, join }
    }

    /// Runs a single cycle over the current snapshot.
    pub async fn poll_once(&self) -> CycleReport {
        self.run_cycle(None).await
    }

    async fn run_cycle(&self, shutdown: Option<&watch::Receiver<bool>>) -> CycleReport {
        let snapshot = self.store.list().await;
        let report: CycleReport = stream::iter(snapshot)
            .map(|channel| async move {
                if shutdown.is_some_and(|rx| *rx.borrow()) {
                    return ChannelOutcome::Skipped;
                }
                self.poll_channel(&channel).await
            })
            .buffer_unordered(self.config.max_concurrent_polls.max(1))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect();

        if let Err(err) = self.store.flush().await {
            warn!(error = %err, "failed to persist channel state; retrying next cycle");
        }
        report
    }

    pub async fn poll_channel(&self, channel: &WatchedChannel) -> ChannelOutcome {
        if channel.health == Health::Invalid {
            debug!(channel = %channel.id, "skipping invalid channel");
            return ChannelOutcome::Skipped;
        }

        let items = match self.fetch_items(&channel.id).await {
            Ok(items) => items,
            Err(err) => return self.record_failure(channel, err).await,
        };
        let Some(newest) = items.first() else {
            debug!(channel = %channel.id, "upstream returned no items");
            if channel.health != Health::Healthy {
                self.commit(channel, healthy_record(None)).await;
            }
            return ChannelOutcome::Unchanged;
        };

        let Some(watermark) = channel.last_notified_item_id.as_deref() else {
            info!(channel = %channel.id, item = %newest.id, "baseline established");
            self.commit(channel, healthy_record(Some(watermark_at(newest)))).await;
            return ChannelOutcome::Baselined;
        };

        let fresh = match items_after_watermark(&items, watermark, channel.last_notified_published_at) {
            Fresh::Items(fresh) => fresh,
            Fresh::Rebaseline => {
                warn!(
                    channel = %channel.id,
                    watermark,
                    "watermark item no longer listed upstream; re-baselining without notifying"
                );
                self.commit(channel, healthy_record(Some(watermark_at(newest)))).await;
                return ChannelOutcome::Baselined;
            }
        };

        for item in &fresh {
            let event = NotificationEvent {
                channel_id: channel.id.clone(),
                channel_alias: channel.alias.clone(),
                item: (*item).clone(),
            };
            if let Err(err) = self.dispatcher.dispatch(&event).await {
                warn!(channel = %channel.id, item = %item.id, error = %err, "dispatch failed");
            }
        }

        // The page head becomes the positional watermark; its time is the
        // newest publish time seen so far.
        let advanced = (!fresh.is_empty()).then(|| {
            let published_at = fresh
                .iter()
                .map(|item| item.published_at)
                .chain([newest.published_at, channel.last_notified_published_at])
                .max()
                .flatten();
            (newest.id.clone(), published_at)
        });
        self.commit(channel, healthy_record(advanced)).await;
        if fresh.is_empty() {
            ChannelOutcome::Unchanged
        } else {
            info!(channel = %channel.id, count = fresh.len(), "notified new uploads");
            ChannelOutcome::Notified(fresh.len())
        }
    }

    async fn fetch_items(&self, channel_id: &str) -> Result<Arc<Vec<FeedItem>>, UpstreamError> {
        let key = channel_id.to_owned();
        if let Some(items) = self.cache.get(&key).await {
            debug!(channel = %channel_id, "cache hit");
            return Ok(items);
        }

        let timeout = self.config.request_timeout;
        let items = match tokio::time::timeout(timeout, self.source.list_recent_items(channel_id)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(UpstreamError::Transient(format!(
                    "no response within {}s",
                    timeout.as_secs_f32()
                )))
            }
        };
        let items = Arc::new(items);
        self.cache.set(key, Arc::clone(&items), self.config.cache_ttl).await;
        Ok(items)
    }

    async fn record_failure(&self, channel: &WatchedChannel, err: UpstreamError) -> ChannelOutcome {
        let (health, outcome) = match &err {
            UpstreamError::Transient(_) => {
                warn!(channel = %channel.id, error = %err, "transient upstream failure; retrying next cycle");
                (Health::Degraded, ChannelOutcome::Degraded)
            }
            UpstreamError::Permanent(_) => {
                warn!(channel = %channel.id, error = %err, "channel unavailable upstream; suspending polls");
                (Health::Invalid, ChannelOutcome::Invalidated)
            }
        };
        self.commit(
            channel,
            PollRecord {
                health: Some(health),
                error: Some(err.to_string()),
                ..PollRecord::default()
            },
        )
        .await;
        outcome
    }

    async fn commit(&self, channel: &WatchedChannel, record: PollRecord) {
        let record = PollRecord {
            added_at: Some(channel.added_at),
            ..record
        };
        match self.store.record_poll(&channel.id, record).await {
            Ok(true) => {}
            Ok(false) => debug!(channel = %channel.id, "channel removed or replaced during cycle"),
            Err(err) => warn!(
                channel = %channel.id,
                error = %err,
                "failed to persist poll result; kept in memory"
            ),
        }
    }
}

fn watermark_at(item: &FeedItem) -> (String, Option<DateTime<Utc>>) {
    (item.id.clone(), item.published_at)
}

fn healthy_record(watermark: Option<(String, Option<DateTime<Utc>>)>) -> PollRecord {
    PollRecord {
        watermark,
        health: Some(Health::Healthy),
        polled_at: Some(Utc::now()),
        error: None,
        added_at: None,
    }
}

#[derive(Debug, PartialEq)]
pub(crate) enum Fresh<'a> {
    /// Items to notify, oldest first. May be empty.
    Items(Vec<&'a FeedItem>),
    /// The watermark item is gone and its publish time is unknown.
    Rebaseline,
}

/// Selects the items newer than the watermark from a newest-first list.
///
/// Everything above the watermark's position is new, whatever its publish
/// time. Only when the watermark is no longer listed does publish time decide:
/// items published at or after `since` count, anything older is dropped so the
/// watermark never moves backwards.
pub(crate) fn items_after_watermark<'a>(
    items: &'a [FeedItem],
    watermark: &str,
    since: Option<DateTime<Utc>>,
) -> Fresh<'a> {
    let mut fresh: Vec<&FeedItem> = match (items.iter().position(|item| item.id == watermark), since) {
        (Some(pos), _) => items[..pos].iter().collect(),
        (None, Some(since)) => items
            .iter()
            .filter(|item| item.published_at.is_some_and(|published| published >= since))
            .collect(),
        (None, None) => return Fresh::Rebaseline,
    };
    fresh.reverse();
    // Undated items keep upstream order.
    if fresh.iter().all(|item| item.published_at.is_some()) {
        fresh.sort_by_key(|item| item.published_at);
    }
    Fresh::Items(fresh)
}
