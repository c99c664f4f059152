//! Mutation surface shared by every front end. Handle resolution runs before
//! any store write so no lock is held across the network call.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::cache::TtlCache;
use crate::channel::{ChannelRef, Health, WatchedChannel};
use crate::error::{RegistryError, StoreError};
use crate::handles::HandleBook;
use crate::monitor::ItemCache;
use crate::source::FeedSource;
use crate::store::ChannelStore;

const RESOLUTION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelListing {
    pub alias: Option<String>,
    pub id: String,
    pub health: Health,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl From<WatchedChannel> for ChannelListing {
    fn from(channel: WatchedChannel) -> Self {
        Self {
            alias: channel.alias,
            id: channel.id,
            health: channel.health,
            last_polled_at: channel.last_polled_at,
            last_error: channel.last_error,
        }
    }
}

#[derive(Clone)]
pub struct Registry {
    store: ChannelStore,
    source: Arc<dyn FeedSource>,
    handles: HandleBook,
    resolutions: TtlCache<String, String>,
    items: Option<ItemCache>,
}

impl Registry {
    pub fn new(store: ChannelStore, source: Arc<dyn FeedSource>, handles: HandleBook) -> Self {
        Self {
            store,
            source,
            handles,
            resolutions: TtlCache::new(),
            items: None,
        }
    }

    /// Shares the monitor's item cache so removals and reactivations drop
    /// stale upload lists.
    pub fn with_item_cache(mut self, items: ItemCache) -> Self {
        self.items = Some(items);
        self
    }

    /// Watches a channel given as identifier, handle or channel URL. Handles
    /// are resolved once; the resolved identifier is stored with the handle as
    /// alias. A bare identifier takes the channel title as alias when the
    /// source can provide one.
    pub async fn add_channel(&self, input: &str) -> Result<WatchedChannel, RegistryError> {
        let reference = ChannelRef::parse(input)
            .ok_or_else(|| RegistryError::UnrecognizedInput(input.to_owned()))?;

        let (id, alias) = match reference {
            ChannelRef::Id(id) => {
                let alias = self.title_of(&id).await;
                (id, alias)
            }
            ChannelRef::Handle(handle) => {
                let id = self.resolve(&handle).await?;
                (id, Some(handle))
            }
        };

        let channel = self.store.add(&id, alias).await?;
        info!(channel = %channel.id, alias = ?channel.alias, "channel added");
        Ok(channel)
    }

    /// Stops watching the channel named by identifier or alias.
    pub async fn remove_channel(&self, input: &str) -> Result<WatchedChannel, RegistryError> {
        let channel = self.lookup(input).await?;
        let removed = self.store.remove(&channel.id).await?;
        self.forget_items(&removed.id).await;
        info!(channel = %removed.id, "channel removed");
        Ok(removed)
    }

    pub async fn list_channels(&self) -> Vec<ChannelListing> {
        self.store
            .list()
            .await
            .into_iter()
            .map(ChannelListing::from)
            .collect()
    }

    /// Replaces the alias. Identifier and watermark are preserved; an empty
    /// alias clears it.
    pub async fn rename_channel(&self, input: &str, alias: &str) -> Result<WatchedChannel, RegistryError> {
        let channel = self.lookup(input).await?;
        let alias = alias.trim();
        let alias = (!alias.is_empty()).then(|| alias.to_owned());
        self.store.rename(&channel.id, alias.clone()).await?;
        info!(channel = %channel.id, alias = ?alias, "channel renamed");
        Ok(WatchedChannel { alias, ..channel })
    }

    /// Puts a suspended channel back into the polling rotation.
    pub async fn reactivate_channel(&self, input: &str) -> Result<WatchedChannel, RegistryError> {
        let channel = self.lookup(input).await?;
        self.store.set_health(&channel.id, Health::Healthy).await?;
        self.forget_items(&channel.id).await;
        info!(channel = %channel.id, "channel reactivated");
        Ok(WatchedChannel {
            health: Health::Healthy,
            last_error: None,
            ..channel
        })
    }

    async fn lookup(&self, input: &str) -> Result<WatchedChannel, RegistryError> {
        let input = input.trim();
        if let Some(channel) = self.store.find(input).await {
            return Ok(channel);
        }
        // "example" finds a channel aliased "@example".
        if !input.starts_with('@') {
            if let Some(channel) = self.store.find(&format!("@{input}")).await {
                return Ok(channel);
            }
        }
        Err(StoreError::NotFound(input.to_owned()).into())
    }

    async fn resolve(&self, handle: &str) -> Result<String, RegistryError> {
        let key = handle.to_ascii_lowercase();
        if let Some(id) = self.resolutions.get(&key).await {
            return Ok(id);
        }
        let id = self.source.resolve_handle(handle).await?;
        self.resolutions.set(key, id.clone(), RESOLUTION_TTL).await;
        if let Err(err) = self.handles.record(handle, &id).await {
            warn!(handle, error = %err, "failed to record handle resolution");
        }
        info!(handle, channel = %id, "resolved handle");
        Ok(id)
    }

    /// Best effort; the channel is watched under its identifier otherwise.
    async fn title_of(&self, id: &str) -> Option<String> {
        if self.store.get(id).await.is_some() {
            return None;
        }
        match self.source.channel_title(id).await {
            Ok(title) => title.map(|t| t.trim().to_owned()).filter(|t| !t.is_empty()),
            Err(err) => {
                warn!(channel = %id, error = %err, "failed to look up channel title");
                None
            }
        }
    }

    async fn forget_items(&self, id: &str) {
        if let Some(items) = &self.items {
            items.invalidate(&id.to_owned()).await;
        }
    }
}
