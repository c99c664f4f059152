mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tubewatch_core::{
    ChannelDispatcher, ChannelOutcome, ChannelStore, DispatchError, Dispatcher, Health, ItemCache, Monitor,
    MonitorConfig, NotificationEvent,
};

use common::{item, FakeSource, Reply, CHANNEL_A, CHANNEL_B};

const CHANNEL_C: &str = "UCcccccccccccccccccccccc";

struct Harness {
    store: ChannelStore,
    cache: ItemCache,
    source: Arc<FakeSource>,
    monitor: Monitor,
    events: mpsc::Receiver<NotificationEvent>,
}

fn harness(config: MonitorConfig) -> Harness {
    let store = ChannelStore::in_memory();
    let cache = ItemCache::new();
    let source = Arc::new(FakeSource::new());
    let (tx, events) = mpsc::channel(64);
    let monitor = Monitor::new(
        store.clone(),
        cache.clone(),
        source.clone(),
        Arc::new(ChannelDispatcher::new(tx)),
        config,
    );
    Harness {
        store,
        cache,
        source,
        monitor,
        events,
    }
}

fn drain(events: &mut mpsc::Receiver<NotificationEvent>) -> Vec<String> {
    let mut ids = Vec::new();
    while let Ok(event) = events.try_recv() {
        ids.push(event.item.id);
    }
    ids
}

async fn watermark(store: &ChannelStore, id: &str) -> Option<String> {
    store.get(id).await.and_then(|c| c.last_notified_item_id)
}

#[tokio::test]
async fn first_poll_baselines_without_notifying() {
    let mut h = harness(MonitorConfig::default());
    h.store.add(CHANNEL_A, None).await.unwrap();
    h.source.items(CHANNEL_A, vec![item("v10", 10), item("v9", 9)]);

    let report = h.monitor.poll_once().await;

    assert_eq!(report.baselined, 1);
    assert_eq!(report.events, 0);
    assert!(drain(&mut h.events).is_empty());
    assert_eq!(watermark(&h.store, CHANNEL_A).await.as_deref(), Some("v10"));
}

#[tokio::test]
async fn new_uploads_are_notified_oldest_first_then_deduplicated() {
    let mut h = harness(MonitorConfig::default());
    h.store.add(CHANNEL_A, Some("@example".into())).await.unwrap();
    let v10 = item("v10", 10);
    h.store
        .update_watermark(CHANNEL_A, &v10.id, v10.published_at, Utc::now())
        .await
        .unwrap();
    h.source.items(
        CHANNEL_A,
        vec![item("v13", 13), item("v12", 12), item("v11", 11), v10],
    );

    let report = h.monitor.poll_once().await;
    assert_eq!(report.notified, 1);
    assert_eq!(report.events, 3);
    assert_eq!(drain(&mut h.events), ["v11", "v12", "v13"]);
    assert_eq!(watermark(&h.store, CHANNEL_A).await.as_deref(), Some("v13"));

    // Same upstream answer, served from cache and from upstream again.
    h.monitor.poll_once().await;
    h.cache.clear().await;
    let report = h.monitor.poll_once().await;
    assert_eq!(report.unchanged, 1);
    assert!(drain(&mut h.events).is_empty());
}

#[tokio::test]
async fn events_carry_alias_and_item() {
    let mut h = harness(MonitorConfig::default());
    h.store.add(CHANNEL_A, Some("@example".into())).await.unwrap();
    h.store.update_watermark(CHANNEL_A, "v1", None, Utc::now()).await.unwrap();
    h.source.items(CHANNEL_A, vec![item("v2", 2), item("v1", 1)]);

    h.monitor.poll_once().await;
    let event = h.events.try_recv().unwrap();
    assert_eq!(event.channel_id, CHANNEL_A);
    assert_eq!(event.channel_name(), "@example");
    assert_eq!(event.item.url, "https://www.youtube.com/watch?v=v2");
}

#[tokio::test]
async fn older_listing_never_moves_the_watermark_back() {
    let mut h = harness(MonitorConfig::default());
    h.store.add(CHANNEL_A, None).await.unwrap();
    let v10 = item("v10", 10);
    h.store
        .update_watermark(CHANNEL_A, &v10.id, v10.published_at, Utc::now())
        .await
        .unwrap();
    h.source.items(CHANNEL_A, vec![item("v9", 9), item("v8", 8)]);

    h.monitor.poll_once().await;

    assert!(drain(&mut h.events).is_empty());
    assert_eq!(watermark(&h.store, CHANNEL_A).await.as_deref(), Some("v10"));
}

#[tokio::test]
async fn empty_listing_keeps_watermark_and_restores_health() {
    let h = harness(MonitorConfig::default());
    h.store.add(CHANNEL_A, None).await.unwrap();
    h.store.update_watermark(CHANNEL_A, "v1", None, Utc::now()).await.unwrap();
    h.store.set_health(CHANNEL_A, Health::Degraded).await.unwrap();
    h.source.items(CHANNEL_A, Vec::new());

    let report = h.monitor.poll_once().await;

    assert_eq!(report.unchanged, 1);
    let channel = h.store.get(CHANNEL_A).await.unwrap();
    assert_eq!(channel.last_notified_item_id.as_deref(), Some("v1"));
    assert_eq!(channel.health, Health::Healthy);
}

#[tokio::test]
async fn empty_listing_does_not_baseline() {
    let h = harness(MonitorConfig::default());
    h.store.add(CHANNEL_A, None).await.unwrap();
    h.source.items(CHANNEL_A, Vec::new());

    h.monitor.poll_once().await;
    assert_eq!(watermark(&h.store, CHANNEL_A).await, None);
}

#[tokio::test(start_paused = true)]
async fn slow_upstream_degrades_only_that_channel() {
    let config = MonitorConfig {
        request_timeout: Duration::from_secs(10),
        ..MonitorConfig::default()
    };
    let h = harness(config);
    h.store.add(CHANNEL_A, None).await.unwrap();
    h.source.items(CHANNEL_A, vec![item("v1", 1)]);
    h.source.delay(Duration::from_secs(60));

    let report = h.monitor.poll_once().await;

    assert_eq!(report.degraded, 1);
    let channel = h.store.get(CHANNEL_A).await.unwrap();
    assert_eq!(channel.health, Health::Degraded);
    assert_eq!(channel.last_notified_item_id, None);
    assert!(channel.last_error.unwrap().contains("no response"));
}

#[tokio::test]
async fn transient_failure_isolated_from_other_channels() {
    let mut h = harness(MonitorConfig::default());
    h.store.add(CHANNEL_A, None).await.unwrap();
    h.store.add(CHANNEL_B, None).await.unwrap();
    h.store.update_watermark(CHANNEL_B, "b1", None, Utc::now()).await.unwrap();
    h.source.reply(CHANNEL_A, Reply::Transient);
    h.source.items(CHANNEL_B, vec![item("b2", 2), item("b1", 1)]);

    let report = h.monitor.poll_once().await;

    assert_eq!(report.degraded, 1);
    assert_eq!(report.events, 1);
    assert_eq!(drain(&mut h.events), ["b2"]);
    assert_eq!(h.store.get(CHANNEL_A).await.unwrap().health, Health::Degraded);

    // Recovery on the next cycle baselines normally.
    h.source.items(CHANNEL_A, vec![item("a1", 1)]);
    let report = h.monitor.poll_once().await;
    assert_eq!(report.baselined, 1);
    assert_eq!(h.store.get(CHANNEL_A).await.unwrap().health, Health::Healthy);
}

#[tokio::test]
async fn failures_are_not_cached() {
    let h = harness(MonitorConfig::default());
    h.store.add(CHANNEL_A, None).await.unwrap();
    h.source.reply(CHANNEL_A, Reply::Transient);

    h.monitor.poll_once().await;
    h.monitor.poll_once().await;
    assert_eq!(h.source.list_calls(CHANNEL_A), 2);
}

#[tokio::test]
async fn permanent_failure_suspends_channel_until_reactivated() {
    let h = harness(MonitorConfig::default());
    h.store.add(CHANNEL_A, None).await.unwrap();
    h.source.reply(CHANNEL_A, Reply::Permanent);

    let report = h.monitor.poll_once().await;
    assert_eq!(report.invalidated, 1);
    assert_eq!(h.store.get(CHANNEL_A).await.unwrap().health, Health::Invalid);

    let report = h.monitor.poll_once().await;
    assert_eq!(report.skipped, 1);
    assert_eq!(h.source.list_calls(CHANNEL_A), 1);

    h.source.items(CHANNEL_A, vec![item("v1", 1)]);
    h.store.set_health(CHANNEL_A, Health::Healthy).await.unwrap();
    let report = h.monitor.poll_once().await;
    assert_eq!(report.baselined, 1);
}

#[tokio::test(start_paused = true)]
async fn cache_bounds_upstream_calls_per_window() {
    let config = MonitorConfig {
        cache_ttl: Duration::from_secs(900),
        ..MonitorConfig::default()
    };
    let h = harness(config);
    h.store.add(CHANNEL_A, None).await.unwrap();
    h.source.items(CHANNEL_A, vec![item("v1", 1)]);

    for _ in 0..3 {
        h.monitor.poll_once().await;
        tokio::time::advance(Duration::from_secs(60)).await;
    }
    assert_eq!(h.source.list_calls(CHANNEL_A), 1);

    tokio::time::advance(Duration::from_secs(900)).await;
    h.monitor.poll_once().await;
    assert_eq!(h.source.list_calls(CHANNEL_A), 2);
}

struct RefusingDispatcher {
    calls: AtomicUsize,
}

#[async_trait]
impl Dispatcher for RefusingDispatcher {
    fn name(&self) -> &'static str {
        "refusing"
    }

    async fn dispatch(&self, _event: &NotificationEvent) -> Result<(), DispatchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(DispatchError::Rejected {
            sink: "refusing",
            status: 500,
        })
    }
}

#[tokio::test]
async fn failed_delivery_still_advances_watermark() {
    let store = ChannelStore::in_memory();
    let source = Arc::new(FakeSource::new());
    let dispatcher = Arc::new(RefusingDispatcher {
        calls: AtomicUsize::new(0),
    });
    let monitor = Monitor::new(
        store.clone(),
        ItemCache::new(),
        source.clone(),
        dispatcher.clone(),
        MonitorConfig::default(),
    );
    store.add(CHANNEL_A, None).await.unwrap();
    store.update_watermark(CHANNEL_A, "v1", None, Utc::now()).await.unwrap();
    source.items(CHANNEL_A, vec![item("v3", 3), item("v2", 2), item("v1", 1)]);

    monitor.poll_once().await;
    monitor.poll_once().await;

    assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 2);
    assert_eq!(watermark(&store, CHANNEL_A).await.as_deref(), Some("v3"));
}

#[tokio::test(start_paused = true)]
async fn channel_removed_mid_cycle_is_not_resurrected() {
    let h = harness(MonitorConfig::default());
    h.store.add(CHANNEL_A, None).await.unwrap();
    h.source.items(CHANNEL_A, vec![item("v1", 1)]);
    h.source.delay(Duration::from_millis(50));

    let monitor = h.monitor.clone();
    let cycle = tokio::spawn(async move { monitor.poll_once().await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    h.store.remove(CHANNEL_A).await.unwrap();

    let report = cycle.await.unwrap();
    assert_eq!(report.baselined, 1);
    assert!(h.store.list().await.is_empty());
}

#[tokio::test]
async fn poll_channel_reports_outcome() {
    let h = harness(MonitorConfig::default());
    let channel = h.store.add(CHANNEL_A, None).await.unwrap();
    h.source.items(CHANNEL_A, vec![item("v1", 1)]);

    assert_eq!(h.monitor.poll_channel(&channel).await, ChannelOutcome::Baselined);
}

#[tokio::test]
async fn spawned_monitor_polls_immediately_and_stops_cleanly() {
    let mut h = harness(MonitorConfig::default());
    h.store.add(CHANNEL_A, None).await.unwrap();
    h.store.update_watermark(CHANNEL_A, "v1", None, Utc::now()).await.unwrap();
    h.source.items(CHANNEL_A, vec![item("v2", 2), item("v1", 1)]);

    let handle = h.monitor.clone().spawn();
    let event = tokio::time::timeout(Duration::from_secs(5), h.events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.item.id, "v2");

    handle.stop().await.unwrap();
    assert_eq!(watermark(&h.store, CHANNEL_A).await.as_deref(), Some("v2"));
}

#[tokio::test]
async fn upload_in_the_same_second_as_the_watermark_is_notified() {
    let mut h = harness(MonitorConfig::default());
    h.store.add(CHANNEL_A, None).await.unwrap();
    let v10 = item("v10", 10);
    h.store
        .update_watermark(CHANNEL_A, &v10.id, v10.published_at, Utc::now())
        .await
        .unwrap();
    let mut undated = item("v12", 10);
    undated.published_at = None;
    h.source.items(CHANNEL_A, vec![undated, item("v11", 10), v10]);

    let report = h.monitor.poll_once().await;

    assert_eq!(report.events, 2);
    assert_eq!(drain(&mut h.events), ["v11", "v12"]);
    let channel = h.store.get(CHANNEL_A).await.unwrap();
    assert_eq!(channel.last_notified_item_id.as_deref(), Some("v12"));
    assert_eq!(channel.last_notified_published_at, item("v10", 10).published_at);

    h.cache.clear().await;
    h.monitor.poll_once().await;
    assert!(drain(&mut h.events).is_empty());
}

#[tokio::test(start_paused = true)]
async fn stop_mid_cycle_persists_the_in_flight_channel_and_skips_the_rest() {
    let dir = tempfile::tempdir().unwrap();
    let store = ChannelStore::open(dir.path()).await.unwrap();
    let source = Arc::new(FakeSource::new());
    let (tx, mut events) = mpsc::channel(64);
    for id in [CHANNEL_A, CHANNEL_B, CHANNEL_C] {
        store.add(id, None).await.unwrap();
        let v1 = item("v1", 1);
        store.update_watermark(id, &v1.id, v1.published_at, Utc::now()).await.unwrap();
        source.items(id, vec![item("v2", 2), item("v1", 1)]);
    }
    source.delay(Duration::from_secs(30));
    let monitor = Monitor::new(
        store.clone(),
        ItemCache::new(),
        source.clone(),
        Arc::new(ChannelDispatcher::new(tx)),
        MonitorConfig {
            request_timeout: Duration::from_secs(120),
            max_concurrent_polls: 1,
            ..MonitorConfig::default()
        },
    );

    let handle = monitor.spawn();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(source.list_calls(CHANNEL_A), 1);
    handle.stop().await.unwrap();

    assert_eq!(drain(&mut events), ["v2"]);
    assert_eq!(watermark(&store, CHANNEL_A).await.as_deref(), Some("v2"));
    for id in [CHANNEL_B, CHANNEL_C] {
        assert_eq!(source.list_calls(id), 0);
        assert_eq!(watermark(&store, id).await.as_deref(), Some("v1"));
    }

    let on_disk = ChannelStore::open_read_only(dir.path()).await.unwrap();
    assert_eq!(on_disk.list().await, store.list().await);
    assert!(!store.is_dirty().await);
}

#[tokio::test(start_paused = true)]
async fn channel_re_added_mid_cycle_ignores_the_stale_poll() {
    let h = harness(MonitorConfig::default());
    h.store.add(CHANNEL_A, Some("@old".into())).await.unwrap();
    h.source.items(CHANNEL_A, vec![item("v1", 1)]);
    h.source.delay(Duration::from_millis(50));

    let monitor = h.monitor.clone();
    let cycle = tokio::spawn(async move { monitor.poll_once().await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    h.store.remove(CHANNEL_A).await.unwrap();
    h.store.add(CHANNEL_A, Some("@new".into())).await.unwrap();

    let report = cycle.await.unwrap();
    assert_eq!(report.baselined, 1);

    let channel = h.store.get(CHANNEL_A).await.unwrap();
    assert_eq!(channel.alias.as_deref(), Some("@new"));
    assert_eq!(channel.last_notified_item_id, None);
    assert_eq!(channel.last_polled_at, None);
    assert_eq!(channel.health, Health::Healthy);
}
