//! Remote tile acquisition with cache check, timeout race and fallback.

use bevy::log::warn;
use image::RgbaImage;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::constants;
use crate::geo::TileIndex;
use crate::tile_cache::{TileDataCache, TilePayload};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("HTTP error: {0}")]
    Status(u16),
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
}

/// Anything that can hand back the raw bytes behind a tile URL.
pub trait TileSource: Send + Sync + 'static {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<Vec<u8>, FetchError>> + Send;
}

/// HTTP source. `reqwest` keeps no cookie store unless asked to, so
/// requests never carry credentials beyond what the URL itself contains.
#[derive(Clone)]
pub struct HttpTileSource {
    client: reqwest::Client,
}

impl HttpTileSource {
    pub fn new() -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(constants::USER_AGENT)
            .build()?;
        Ok(Self { client })
    }
}

impl TileSource for HttpTileSource {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<Vec<u8>, FetchError>> + Send {
        let request = self.client.get(url);
        async move {
            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::Status(status.as_u16()));
            }
            Ok(response.bytes().await?.to_vec())
        }
    }
}

/// URL templates for the two remote endpoints. `{z}`, `{x}`, `{y}` and
/// `{token}` are substituted per tile.
#[derive(Debug, Clone)]
pub struct SourceUrls {
    pub terrain: String,
    pub imagery: String,
    pub access_token: String,
}

impl Default for SourceUrls {
    fn default() -> Self {
        Self {
            terrain: constants::TERRAIN_URL_TEMPLATE.to_string(),
            imagery: constants::IMAGERY_URL_TEMPLATE.to_string(),
            access_token: String::new(),
        }
    }
}

impl SourceUrls {
    pub fn terrain_url(&self, index: TileIndex) -> String {
        self.expand(&self.terrain, index)
    }

    pub fn imagery_url(&self, index: TileIndex) -> String {
        self.expand(&self.imagery, index)
    }

    fn expand(&self, template: &str, index: TileIndex) -> String {
        template
            .replace("{z}", &index.zoom.to_string())
            .replace("{x}", &index.col.to_string())
            .replace("{y}", &index.row.to_string())
            .replace("{token}", &self.access_token)
    }
}

async fn fetch_image(source: &impl TileSource, url: &str) -> Result<RgbaImage, FetchError> {
    let bytes = source.fetch(url).await?;
    Ok(image::load_from_memory(&bytes)?.to_rgba8())
}

/// Fetch and decode `url`, going through the cache under `key`.
///
/// Never fails: a cache hit returns without touching the network, and any
/// network, status or decode failure is logged and answered with
/// `fallback`.
pub async fn acquire(
    source: &impl TileSource,
    cache: &TileDataCache,
    url: &str,
    key: &str,
    fallback: Option<TilePayload>,
) -> Option<TilePayload> {
    match cache.get_or_fetch(key, fetch_image(source, url)).await {
        Ok(payload) => Some(payload),
        Err(e) => {
            warn!("Failed to fetch {} ({}): {}", key, strip_query(url), e);
            fallback
        }
    }
}

/// [`acquire`] raced against `timeout`. When the deadline wins the fetch is
/// dropped, so it can neither complete nor write into the cache later.
pub async fn acquire_within(
    timeout: Duration,
    source: &impl TileSource,
    cache: &TileDataCache,
    url: &str,
    key: &str,
) -> Option<TilePayload> {
    match tokio::time::timeout(timeout, acquire(source, cache, url, key, None)).await {
        Ok(payload) => payload,
        Err(_) => {
            warn!("Timed out after {:?} fetching {}", timeout, key);
            None
        }
    }
}

// Keeps access tokens out of the logs.
fn strip_query(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}
