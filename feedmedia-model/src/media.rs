use url::Url;

use crate::{
    error::{ModelError, Result},
    ids::RequestKey,
};

/// What kind of payload a locator points at. Decides how a fetched resource
/// is prepared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MediaKind {
    Image,
    Video,
}

/// A fetchable resource attached to a feed item.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MediaRef {
    pub key: RequestKey,
    pub locator: Url,
    pub kind: MediaKind,
}

impl MediaRef {
    pub fn new(key: RequestKey, locator: Url, kind: MediaKind) -> Self {
        Self { key, locator, kind }
    }

    pub fn image(key: impl Into<RequestKey>, locator: Url) -> Self {
        Self::new(key.into(), locator, MediaKind::Image)
    }

    pub fn video(key: impl Into<RequestKey>, locator: Url) -> Self {
        Self::new(key.into(), locator, MediaKind::Video)
    }

    /// Parse a locator string and build a reference in one step.
    pub fn parse(key: &str, locator: &str, kind: MediaKind) -> Result<Self> {
        let key = RequestKey::parse(key)?;
        let locator = Url::parse(locator)
            .map_err(|e| ModelError::InvalidLocator(e.to_string()))?;
        let media = Self::new(key, locator, kind);
        media.validate()?;
        Ok(media)
    }

    /// Checks the two preconditions every submission must meet: a non-empty
    /// key and an http(s) locator with a host.
    pub fn validate(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(ModelError::EmptyKey);
        }
        match self.locator.scheme() {
            "http" | "https" if self.locator.host_str().is_some() => Ok(()),
            other => Err(ModelError::InvalidLocator(format!(
                "unsupported locator {} (scheme {other})",
                self.locator
            ))),
        }
    }
}
