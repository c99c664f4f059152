//! YouTube Data API v3 client.
//!
//! Recent uploads come from the channel's uploads playlist (`UU…`, derived from
//! the `UC…` identifier), which costs one quota unit per call. Handles are
//! resolved through `channels.list?forHandle=`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::channel::FeedItem;
use crate::error::{ResolveError, UpstreamError};
use crate::source::FeedSource;

pub const DEFAULT_API_BASE: &str = "https://www.googleapis.com/youtube/v3/";
pub const DEFAULT_MAX_RESULTS: u32 = 15;

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItem {
    snippet: PlaylistSnippet,
    #[serde(default)]
    content_details: Option<PlaylistContentDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistSnippet {
    title: String,
    published_at: Option<DateTime<Utc>>,
    resource_id: ResourceId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceId {
    video_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistContentDetails {
    video_published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelResource {
    id: String,
    #[serde(default)]
    snippet: Option<ChannelSnippet>,
    #[serde(default)]
    content_details: Option<ChannelContentDetails>,
}

#[derive(Debug, Deserialize)]
struct ChannelSnippet {
    title: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelContentDetails {
    related_playlists: RelatedPlaylists,
}

#[derive(Debug, Deserialize)]
struct RelatedPlaylists {
    uploads: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    reason: String,
}

#[derive(Clone)]
pub struct YouTubeApiClient {
    client: Client,
    api_key: String,
    base: String,
    max_results: u32,
}

impl std::fmt::Debug for YouTubeApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YouTubeApiClient")
            .field("base", &self.base)
            .field("max_results", &self.max_results)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

impl YouTubeApiClient {
    pub fn new(client: Client, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            base: DEFAULT_API_BASE.to_owned(),
            max_results: DEFAULT_MAX_RESULTS,
        }
    }

    pub fn with_base_url(mut self, base: &str) -> Self {
        self.base = normalize_base(base);
        self
    }

    pub fn with_max_results(mut self, max_results: u32) -> Self {
        self.max_results = max_results.clamp(1, 50);
        self
    }

    async fn get(&self, endpoint: &str, query: &[(&str, &str)]) -> Result<Response, reqwest::Error> {
        self.client
            .get(format!("{}{endpoint}", self.base))
            .query(query)
            .query(&[("key", self.api_key.as_str())])
            .send()
            .await
    }

    async fn uploads_playlist(&self, channel_id: &str) -> Result<String, UpstreamError> {
        if let Some(rest) = channel_id.strip_prefix("UC") {
            return Ok(format!("UU{rest}"));
        }
        let response = self
            .get("channels", &[("part", "contentDetails"), ("id", channel_id)])
            .await?;
        let response = check_status(response).await?;
        let body: ListResponse<ChannelResource> = response.json().await?;
        body.items
            .into_iter()
            .next()
            .and_then(|c| c.content_details)
            .map(|d| d.related_playlists.uploads)
            .ok_or_else(|| UpstreamError::Permanent(format!("channel {channel_id} not found")))
    }
}

#[async_trait]
impl FeedSource for YouTubeApiClient {
    async fn list_recent_items(&self, channel_id: &str) -> Result<Vec<FeedItem>, UpstreamError> {
        let playlist = self.uploads_playlist(channel_id).await?;
        let max_results = self.max_results.to_string();
        let response = self
            .get(
                "playlistItems",
                &[
                    ("part", "snippet,contentDetails"),
                    ("playlistId", playlist.as_str()),
                    ("maxResults", max_results.as_str()),
                ],
            )
            .await?;
        let response = check_status(response).await?;
        let body: ListResponse<PlaylistItem> = response.json().await?;
        debug!(channel = %channel_id, count = body.items.len(), "fetched uploads playlist");

        Ok(body
            .items
            .into_iter()
            .map(|item| {
                let video_id = item.snippet.resource_id.video_id;
                FeedItem {
                    url: format!("https://www.youtube.com/watch?v={video_id}"),
                    id: video_id,
                    title: item.snippet.title,
                    published_at: item
                        .content_details
                        .and_then(|d| d.video_published_at)
                        .or(item.snippet.published_at),
                }
            })
            .collect())
    }

    async fn resolve_handle(&self, handle: &str) -> Result<String, ResolveError> {
        let response = self.get("channels", &[("part", "id"), ("forHandle", handle)]).await?;
        let status = response.status();
        if !status.is_success() {
            let detail = error_detail(response).await;
            return Err(ResolveError::Upstream(format!("status {status}: {detail}")));
        }
        let body: ListResponse<ChannelResource> = response.json().await?;
        body.items
            .into_iter()
            .next()
            .map(|c| c.id)
            .ok_or_else(|| ResolveError::NotFound(handle.to_owned()))
    }

    async fn channel_title(&self, channel_id: &str) -> Result<Option<String>, UpstreamError> {
        let response = self.get("channels", &[("part", "snippet"), ("id", channel_id)]).await?;
        let response = check_status(response).await?;
        let body: ListResponse<ChannelResource> = response.json().await?;
        Ok(body
            .items
            .into_iter()
            .next()
            .and_then(|c| c.snippet)
            .map(|s| s.title))
    }
}

pub(crate) fn normalize_base(base: &str) -> String {
    if base.ends_with('/') {
        base.to_owned()
    } else {
        format!("{base}/")
    }
}

/// Maps a non-success status to the transient/permanent split. Only "not
/// found" is permanent; quota, auth and server faults affect every channel and
/// are retried on the next cycle.
async fn check_status(response: Response) -> Result<Response, UpstreamError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let detail = error_detail(response).await;
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => {
            Err(UpstreamError::Permanent(format!("status {status}: {detail}")))
        }
        _ => Err(UpstreamError::Transient(format!("status {status}: {detail}"))),
    }
}

async fn error_detail(response: Response) -> String {
    match response.json::<ErrorEnvelope>().await {
        Ok(envelope) => {
            let reasons: Vec<&str> = envelope
                .error
                .errors
                .iter()
                .map(|e| e.reason.as_str())
                .filter(|r| !r.is_empty())
                .collect();
            if reasons.is_empty() {
                envelope.error.message
            } else {
                format!("{} ({})", envelope.error.message, reasons.join(", "))
            }
        }
        Err(_) => "no error details".to_owned(),
    }
}
