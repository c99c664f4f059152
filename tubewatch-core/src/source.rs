use async_trait::async_trait;

use crate::channel::FeedItem;
use crate::error::{ResolveError, UpstreamError};

/// Upstream provider of channel uploads.
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Most recent items of the channel, newest first.
    async fn list_recent_items(&self, channel_id: &str) -> Result<Vec<FeedItem>, UpstreamError>;

    /// Turns a handle such as `@example` into the channel's stable identifier.
    async fn resolve_handle(&self, handle: &str) -> Result<String, ResolveError>;

    /// Display title of the channel, when the source knows one.
    async fn channel_title(&self, _channel_id: &str) -> Result<Option<String>, UpstreamError> {
        Ok(None)
    }
}
