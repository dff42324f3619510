//! YouTube Data API v3 client: channel metadata, paged video listings and
//! per-video statistics.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;
use ytsync_core::{ChannelRecord, VideoRecord};
use ytsync_storage::{FetchError, HttpClientConfig, HttpFetcher};

pub const CRATE_NAME: &str = "ytsync-youtube";

pub const DEFAULT_BASE_URL: &str = "https://www.googleapis.com/youtube/v3/";
const API_KEY_HEADER: &str = "x-goog-api-key";
const SEARCH_PAGE_SIZE: &str = "50";
const VIDEO_KIND: &str = "youtube#video";

#[derive(Debug, Error)]
pub enum YouTubeError {
    #[error("youtube api error for channel {channel_id}: {message}")]
    Api {
        channel_id: String,
        status: Option<u16>,
        message: String,
    },
    #[error("youtube request for channel {channel_id} failed: {source}")]
    Http {
        channel_id: String,
        #[source]
        source: FetchError,
    },
    #[error("youtube response for channel {channel_id} could not be decoded: {message}")]
    Decode { channel_id: String, message: String },
    #[error("building youtube client: {0}")]
    Client(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchContext {
    pub run_id: Uuid,
}

/// One page of a channel's video listing, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VideoPage {
    pub videos: Vec<VideoRecord>,
    pub next_page_token: Option<String>,
}

/// The platform operations the retrieval pipeline depends on.
#[async_trait]
pub trait VideoPlatform: Send + Sync {
    /// `Ok(None)` when the platform knows no channel with this id.
    async fn fetch_channel_snapshot(
        &self,
        ctx: &FetchContext,
        channel_id: &str,
    ) -> Result<Option<ChannelRecord>, YouTubeError>;

    async fn fetch_video_page(
        &self,
        ctx: &FetchContext,
        channel_id: &str,
        page_token: Option<&str>,
    ) -> Result<VideoPage, YouTubeError>;
}

/// Lazily walks a channel's video pages. Finite: stops on the last page or
/// after `max_pages` pages when a limit is set.
pub struct VideoPager<'a> {
    platform: &'a dyn VideoPlatform,
    ctx: FetchContext,
    channel_id: String,
    next_token: Option<String>,
    pages_fetched: usize,
    max_pages: Option<usize>,
    exhausted: bool,
}

impl<'a> VideoPager<'a> {
    pub fn new(
        platform: &'a dyn VideoPlatform,
        ctx: FetchContext,
        channel_id: impl Into<String>,
        max_pages: Option<usize>,
    ) -> Self {
        Self {
            platform,
            ctx,
            channel_id: channel_id.into(),
            next_token: None,
            pages_fetched: 0,
            max_pages,
            exhausted: false,
        }
    }

    pub async fn next_page(&mut self) -> Result<Option<Vec<VideoRecord>>, YouTubeError> {
        if self.exhausted || self.max_pages.is_some_and(|max| self.pages_fetched >= max) {
            return Ok(None);
        }
        let page = self
            .platform
            .fetch_video_page(&self.ctx, &self.channel_id, self.next_token.as_deref())
            .await?;
        self.pages_fetched += 1;
        self.next_token = page.next_page_token;
        if self.next_token.is_none() {
            self.exhausted = true;
        }
        Ok(Some(page.videos))
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }
}

#[derive(Debug, Clone)]
pub struct YouTubeConfig {
    pub base_url: String,
    pub http: HttpClientConfig,
}

impl Default for YouTubeConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            http: HttpClientConfig::default(),
        }
    }
}

pub struct YouTubeClient {
    http: HttpFetcher,
    base_url: Url,
}

impl YouTubeClient {
    /// The key travels in a sensitive request header so it never appears in
    /// request URLs, error messages or spans.
    pub fn new(api_key: &str, mut config: YouTubeConfig) -> Result<Self, YouTubeError> {
        let mut key = HeaderValue::from_str(api_key)
            .map_err(|_| YouTubeError::Client("api key is not a valid header value".into()))?;
        key.set_sensitive(true);
        config
            .http
            .default_headers
            .insert(HeaderName::from_static(API_KEY_HEADER), key);

        let base = if config.base_url.ends_with('/') {
            config.base_url.clone()
        } else {
            format!("{}/", config.base_url)
        };
        let base_url = Url::parse(&base).map_err(|e| YouTubeError::Client(e.to_string()))?;
        let http = HttpFetcher::new(config.http).map_err(|e| YouTubeError::Client(e.to_string()))?;
        Ok(Self { http, base_url })
    }

    fn endpoint(&self, path: &str, params: &[(&str, &str)]) -> Result<Url, YouTubeError> {
        let mut url = self
            .base_url
            .join(path)
            .map_err(|e| YouTubeError::Client(e.to_string()))?;
        url.query_pairs_mut().extend_pairs(params);
        Ok(url)
    }

    async fn get_json(
        &self,
        ctx: &FetchContext,
        channel_id: &str,
        url: &Url,
    ) -> Result<Vec<u8>, YouTubeError> {
        match self.http.fetch_bytes(ctx.run_id, channel_id, url).await {
            Ok(resp) => {
                if let Some(message) = api_error_message(&resp.body) {
                    return Err(YouTubeError::Api {
                        channel_id: channel_id.to_string(),
                        status: Some(resp.status.as_u16()),
                        message,
                    });
                }
                Ok(resp.body)
            }
            Err(FetchError::HttpStatus { status, url, body }) => match api_error_message(&body) {
                Some(message) => Err(YouTubeError::Api {
                    channel_id: channel_id.to_string(),
                    status: Some(status),
                    message,
                }),
                None => Err(YouTubeError::Http {
                    channel_id: channel_id.to_string(),
                    source: FetchError::HttpStatus { status, url, body },
                }),
            },
            Err(source) => Err(YouTubeError::Http {
                channel_id: channel_id.to_string(),
                source,
            }),
        }
    }

    async fn fetch_statistics(
        &self,
        ctx: &FetchContext,
        channel_id: &str,
        video_ids: &[String],
    ) -> Result<HashMap<String, VideoStats>, YouTubeError> {
        if video_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let ids = video_ids.join(",");
        let url = self.endpoint("videos", &[("part", "statistics"), ("id", ids.as_str())])?;
        let body = self.get_json(ctx, channel_id, &url).await?;
        decode_statistics(channel_id, &body)
    }
}

#[async_trait]
impl VideoPlatform for YouTubeClient {
    async fn fetch_channel_snapshot(
        &self,
        ctx: &FetchContext,
        channel_id: &str,
    ) -> Result<Option<ChannelRecord>, YouTubeError> {
        let url = self.endpoint(
            "channels",
            &[("part", "snippet,statistics"), ("id", channel_id)],
        )?;
        let body = self.get_json(ctx, channel_id, &url).await?;
        decode_channel(channel_id, &body)
    }

    async fn fetch_video_page(
        &self,
        ctx: &FetchContext,
        channel_id: &str,
        page_token: Option<&str>,
    ) -> Result<VideoPage, YouTubeError> {
        let mut params = vec![
            ("channelId", channel_id),
            ("part", "snippet,id"),
            ("order", "date"),
            ("maxResults", SEARCH_PAGE_SIZE),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken", token));
        }
        let url = self.endpoint("search", &params)?;
        let body = self.get_json(ctx, channel_id, &url).await?;
        let page = decode_search_page(channel_id, &body)?;

        let ids = page.items.iter().map(|v| v.video_id.clone()).collect::<Vec<_>>();
        let stats = self.fetch_statistics(ctx, channel_id, &ids).await?;
        debug!(channel_id, videos = ids.len(), "fetched video page");

        let videos = page
            .items
            .into_iter()
            .map(|item| {
                let s = stats.get(&item.video_id).copied().unwrap_or_default();
                VideoRecord {
                    video_id: item.video_id,
                    title: item.title,
                    description: item.description,
                    published_at: item.published_at,
                    likes: s.likes,
                    views: s.views,
                    comments: s.comments,
                }
            })
            .collect();

        Ok(VideoPage {
            videos,
            next_page_token: page.next_page_token,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
}

/// Extracts `error.message` when the body is an API error payload.
pub fn api_error_message(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<ErrorEnvelope>(body)
        .ok()
        .map(|env| env.error.message)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    id: SearchItemId,
    snippet: Option<SearchSnippet>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchItemId {
    kind: String,
    video_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchSnippet {
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    published_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SearchVideo {
    video_id: String,
    title: String,
    description: String,
    published_at: DateTime<Utc>,
}

#[derive(Debug)]
struct SearchPage {
    items: Vec<SearchVideo>,
    next_page_token: Option<String>,
}

fn decode_error(channel_id: &str, err: impl std::fmt::Display) -> YouTubeError {
    YouTubeError::Decode {
        channel_id: channel_id.to_string(),
        message: err.to_string(),
    }
}

/// Keeps only `youtube#video` results; playlists and channels in the search
/// results are skipped.
fn decode_search_page(channel_id: &str, body: &[u8]) -> Result<SearchPage, YouTubeError> {
    let resp: SearchResponse =
        serde_json::from_slice(body).map_err(|e| decode_error(channel_id, e))?;
    let items = resp
        .items
        .into_iter()
        .filter(|item| item.id.kind == VIDEO_KIND)
        .filter_map(|item| {
            let video_id = item.id.video_id?;
            let snippet = item.snippet?;
            Some(SearchVideo {
                video_id,
                title: snippet.title,
                description: snippet.description,
                published_at: snippet.published_at,
            })
        })
        .collect();
    Ok(SearchPage {
        items,
        next_page_token: resp.next_page_token.filter(|t| !t.is_empty()),
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct VideoStats {
    likes: i64,
    views: i64,
    comments: i64,
}

#[derive(Debug, Deserialize)]
struct VideosResponse {
    #[serde(default)]
    items: Vec<VideoItem>,
}

#[derive(Debug, Deserialize)]
struct VideoItem {
    id: String,
    #[serde(default)]
    statistics: Statistics,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Statistics {
    like_count: Option<String>,
    view_count: Option<String>,
    comment_count: Option<String>,
    subscriber_count: Option<String>,
    video_count: Option<String>,
}

/// Missing counters (hidden likes, disabled comments) count as zero.
fn parse_count(channel_id: &str, field: &str, value: Option<&str>) -> Result<i64, YouTubeError> {
    match value {
        None => Ok(0),
        Some(raw) => raw
            .trim()
            .parse::<i64>()
            .map_err(|_| decode_error(channel_id, format!("{field} is not a count: {raw:?}"))),
    }
}

fn decode_statistics(
    channel_id: &str,
    body: &[u8],
) -> Result<HashMap<String, VideoStats>, YouTubeError> {
    let resp: VideosResponse =
        serde_json::from_slice(body).map_err(|e| decode_error(channel_id, e))?;
    let mut out = HashMap::with_capacity(resp.items.len());
    for item in resp.items {
        let s = &item.statistics;
        let stats = VideoStats {
            likes: parse_count(channel_id, "likeCount", s.like_count.as_deref())?,
            views: parse_count(channel_id, "viewCount", s.view_count.as_deref())?,
            comments: parse_count(channel_id, "commentCount", s.comment_count.as_deref())?,
        };
        out.insert(item.id, stats);
    }
    Ok(out)
}

#[derive(Debug, Deserialize)]
struct ChannelsResponse {
    #[serde(default)]
    items: Vec<ChannelItem>,
}

#[derive(Debug, Deserialize)]
struct ChannelItem {
    #[serde(default)]
    snippet: ChannelSnippet,
    #[serde(default)]
    statistics: Statistics,
}

#[derive(Debug, Default, Deserialize)]
struct ChannelSnippet {
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
}

fn decode_channel(channel_id: &str, body: &[u8]) -> Result<Option<ChannelRecord>, YouTubeError> {
    let resp: ChannelsResponse =
        serde_json::from_slice(body).map_err(|e| decode_error(channel_id, e))?;
    let Some(item) = resp.items.into_iter().next() else {
        return Ok(None);
    };
    let s = &item.statistics;
    Ok(Some(ChannelRecord {
        channel_id: channel_id.to_string(),
        channel_name: item.snippet.title,
        description: item.snippet.description,
        subscriber_count: parse_count(channel_id, "subscriberCount", s.subscriber_count.as_deref())?,
        video_count: parse_count(channel_id, "videoCount", s.video_count.as_deref())?,
        view_count: parse_count(channel_id, "viewCount", s.view_count.as_deref())?,
    }))
}
