use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::{redirect, Client, ClientBuilder};
use tracing::{info, warn};
use tubewatch_core::store::Access;
use tubewatch_core::{
    AtomFeedClient, ChannelStore, Config, Dispatcher, EmailDispatcher, FanOutDispatcher, FeedSource,
    HandleBook, ItemCache, LogDispatcher, Monitor, Registry, SourceKind, WebhookDispatcher,
    YouTubeApiClient,
};

pub struct Services {
    pub cache: ItemCache,
    pub monitor: Monitor,
    pub registry: Registry,
}

impl Services {
    /// `Access::Exclusive` fails while another process (usually `tubewatch run`)
    /// holds the data directory.
    pub async fn build(config: &Config, access: Access) -> Result<Self> {
        let client = ClientBuilder::new()
            .redirect(redirect::Policy::limited(5))
            .timeout(config.request_timeout())
            .user_agent(concat!("tubewatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;

        let data_dir = config.data_dir()?;
        let store = ChannelStore::open_with(&data_dir, access)
            .await
            .with_context(|| format!("failed to open channel state in {}", data_dir.display()))?;
        let handles = HandleBook::open(&data_dir).await;
        info!(dir = %data_dir.display(), channels = store.list().await.len(), "channel state loaded");

        let source = build_source(config, client.clone())?;
        let dispatcher = build_dispatcher(config, client);
        let cache = ItemCache::new();

        let monitor = Monitor::new(
            store.clone(),
            cache.clone(),
            Arc::clone(&source),
            dispatcher,
            config.monitor_config(),
        );
        let registry = Registry::new(store, source, handles).with_item_cache(cache.clone());

        Ok(Self {
            cache,
            monitor,
            registry,
        })
    }
}

fn build_source(config: &Config, client: Client) -> Result<Arc<dyn FeedSource>> {
    let source: Arc<dyn FeedSource> = match config.source {
        SourceKind::Api => {
            let api_key = config
                .youtube
                .api_key
                .clone()
                .context("the api source needs a YouTube API key")?;
            Arc::new(
                YouTubeApiClient::new(client, api_key)
                    .with_base_url(&config.youtube.api_base)
                    .with_max_results(config.max_results),
            )
        }
        SourceKind::Feed => Arc::new(AtomFeedClient::new(client).with_base_url(&config.youtube.feed_base)),
    };
    Ok(source)
}

fn build_dispatcher(config: &Config, client: Client) -> Arc<dyn Dispatcher> {
    let notifications = &config.notifications;
    let mut fan_out = FanOutDispatcher::default();
    if notifications.log {
        fan_out.push(Arc::new(LogDispatcher));
    }
    if let Some(url) = &notifications.webhook_url {
        fan_out.push(Arc::new(WebhookDispatcher::new(client.clone(), url.clone())));
    }
    if let Some(email) = &notifications.email {
        fan_out.push(Arc::new(
            EmailDispatcher::new(client, email.api_key.clone(), email.to.clone())
                .with_api_base(&email.api_base)
                .with_sender(email.from.clone()),
        ));
    }
    if fan_out.is_empty() {
        warn!("no notification sinks configured; new uploads will only advance watermarks");
    }
    Arc::new(fan_out)
}
