use std::{fmt, sync::Arc};

use url::Url;

/// A payload ready for display or playback.
#[derive(Debug, Clone)]
pub enum PreparedMedia {
    Image(PreparedImage),
    Video(VideoAsset),
}

impl PreparedMedia {
    /// Approximate resident size, used as the memory store's eviction cost.
    pub fn cost_bytes(&self) -> u64 {
        match self {
            PreparedMedia::Image(image) => image.resident_bytes(),
            PreparedMedia::Video(asset) => asset.resident_bytes(),
        }
    }

    pub fn as_image(&self) -> Option<&PreparedImage> {
        match self {
            PreparedMedia::Image(image) => Some(image),
            PreparedMedia::Video(_) => None,
        }
    }

    pub fn as_video(&self) -> Option<&VideoAsset> {
        match self {
            PreparedMedia::Video(asset) => Some(asset),
            PreparedMedia::Image(_) => None,
        }
    }
}

/// A size-bounded image derivative plus its decoded RGBA pixels.
#[derive(Clone)]
pub struct PreparedImage {
    /// Encoded derivative as persisted to disk.
    pub encoded: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
    /// Tightly packed RGBA8 rows.
    pub rgba: Arc<[u8]>,
}

impl PreparedImage {
    pub fn resident_bytes(&self) -> u64 {
        (self.encoded.len() + self.rgba.len()) as u64
    }
}

impl fmt::Debug for PreparedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedImage")
            .field("encoded_len", &self.encoded.len())
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

/// Which rendition of a video the playable locator points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoVariant {
    /// Adaptive master playlist.
    Master,
    /// Single-rendition media playlist.
    Variant,
    /// The raw locator, played progressively.
    Progressive,
}

/// Lazy video handle: the resolved locator, not the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoAsset {
    pub source: Url,
    pub playable: Url,
    pub variant: VideoVariant,
    pub content_type: Option<String>,
}

impl VideoAsset {
    pub fn resident_bytes(&self) -> u64 {
        let urls = self.source.as_str().len() + self.playable.as_str().len();
        let ct = self.content_type.as_ref().map_or(0, String::len);
        (std::mem::size_of::<Self>() + urls + ct) as u64
    }
}

/// Where a completed payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Network,
    Disk,
}
