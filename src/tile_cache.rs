//! In-memory tile payload cache.
//!
//! Holds decoded terrain and imagery bitmaps keyed by `"<tile>-terrain"` /
//! `"<tile>-imagery"` so a tile that unloads and reloads never fetches the
//! same payload twice. Entries are written once per key and never evicted.

use image::RgbaImage;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

/// A decoded bitmap shared between the cache and in-flight loads.
pub type TilePayload = Arc<RgbaImage>;

/// Which of a tile's two remote payloads a cache key refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Terrain,
    Imagery,
}

impl PayloadKind {
    pub fn suffix(&self) -> &'static str {
        match self {
            PayloadKind::Terrain => "terrain",
            PayloadKind::Imagery => "imagery",
        }
    }
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Cache key for one of a tile's payloads.
pub fn payload_key(tile_name: &str, kind: PayloadKind) -> String {
    format!("{}-{}", tile_name, kind.suffix())
}

/// Shared handle to the payload store. Cloning shares the same entries.
#[derive(Clone, Default)]
pub struct TileDataCache {
    entries: Arc<Mutex<HashMap<String, TilePayload>>>,
}

impl TileDataCache {
    pub fn new() -> Self {
        Self::default()
    }

    // A poisoned lock still holds consistent data: entries are only ever
    // inserted whole.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, TilePayload>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, key: &str) -> Option<TilePayload> {
        self.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Store `payload` unless the key is already populated. Returns whatever
    /// the cache holds for `key` afterwards.
    pub fn insert_if_absent(&self, key: &str, payload: TilePayload) -> TilePayload {
        self.lock()
            .entry(key.to_string())
            .or_insert(payload)
            .clone()
    }

    /// Return the cached payload for `key`, or await `fetch` and cache its
    /// result. The future is not polled on a hit. Failures are not cached,
    /// so the next request for the key fetches again.
    pub async fn get_or_fetch<E, F>(&self, key: &str, fetch: F) -> Result<TilePayload, E>
    where
        F: Future<Output = Result<RgbaImage, E>>,
    {
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }

        let image = fetch.await?;
        Ok(self.insert_if_absent(key, Arc::new(image)))
    }
}
