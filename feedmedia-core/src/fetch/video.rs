use url::Url;

use super::transport::MediaTransport;
use crate::{
    error::FetchError,
    prepared::{VideoAsset, VideoVariant},
};

const MASTER_PLAYLIST: &str = "master.m3u8";
const VARIANT_PLAYLIST: &str = "playlist.m3u8";

/// Rendition candidates in probe order. A locator that already names a
/// playlist is used as-is; otherwise the adaptive master and single-variant
/// playlists next to the file stem are preferred over the raw file.
pub fn candidates(locator: &Url) -> Vec<(Url, VideoVariant)> {
    let path = locator.path();
    if path.to_ascii_lowercase().ends_with(".m3u8") {
        return vec![(locator.clone(), VideoVariant::Master)];
    }

    let mut out = Vec::with_capacity(3);
    let (dir, file) = path.rsplit_once('/').unwrap_or(("", path));
    let stem = file.rsplit_once('.').map_or(file, |(stem, _)| stem);
    if !stem.is_empty() {
        for (name, variant) in [
            (MASTER_PLAYLIST, VideoVariant::Master),
            (VARIANT_PLAYLIST, VideoVariant::Variant),
        ] {
            let mut url = locator.clone();
            url.set_path(&format!("{dir}/{stem}/{name}"));
            out.push((url, variant));
        }
    }
    out.push((locator.clone(), VideoVariant::Progressive));
    out
}

fn is_playlist_type(content_type: &str) -> bool {
    content_type.to_ascii_lowercase().contains("mpegurl")
}

fn is_playable_type(content_type: &str) -> bool {
    let ct = content_type.to_ascii_lowercase();
    ct.starts_with("video/")
        || ct.contains("mpegurl")
        || ct.starts_with("application/octet-stream")
}

/// Resolve the playable locator with headers-only probes. Nothing but
/// headers is downloaded; the returned asset is a lazy handle.
pub async fn resolve(
    transport: &dyn MediaTransport,
    locator: &Url,
) -> Result<VideoAsset, FetchError> {
    let mut candidates = candidates(locator);
    // The raw locator is always last and decides the failure mode.
    let Some((raw, raw_variant)) = candidates.pop() else {
        return Err(FetchError::Status(404));
    };

    for (url, variant) in candidates {
        match transport.probe(&url).await {
            Ok(probe)
                if probe.status == 200
                    && probe
                        .content_type
                        .as_deref()
                        .is_none_or(is_playlist_type) =>
            {
                tracing::debug!(
                    %locator,
                    playable = %url,
                    ?variant,
                    "video rendition resolved"
                );
                return Ok(VideoAsset {
                    source: locator.clone(),
                    playable: url,
                    variant,
                    content_type: probe.content_type,
                });
            }
            Ok(probe) => {
                tracing::trace!(
                    %url,
                    status = probe.status,
                    "playlist candidate rejected"
                );
            }
            Err(e) => {
                tracing::trace!(
                    %url,
                    err = %e,
                    "playlist candidate probe failed"
                );
            }
        }
    }

    let probe = transport.probe(&raw).await?;
    if probe.status != 200 {
        return Err(FetchError::Status(probe.status));
    }
    if let Some(ct) = probe.content_type.as_deref()
        && !is_playable_type(ct)
    {
        return Err(FetchError::UnsupportedContentType(ct.to_string()));
    }
    Ok(VideoAsset {
        source: locator.clone(),
        playable: raw,
        variant: raw_variant,
        content_type: probe.content_type,
    })
}
